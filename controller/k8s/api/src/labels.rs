use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A pod's labels.
pub type Map = BTreeMap<String, String>;

/// Selects the pods a policy applies to, in the Kubernetes wire shape:
/// `matchLabels` and `matchExpressions` are ANDed, and an empty selector
/// selects every pod.
///
/// Both fields lower into one list of [`Requirement`]s, so equality pairs
/// and set expressions evaluate through a single code path and a malformed
/// expression fails closed instead of half-matching.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Vec<Expression>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    pub key: String,
    pub operator: Operator,
    pub values: Option<BTreeSet<String>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidSelector {
    #[error("operator {operator:?} on key {key:?} requires a non-empty values list")]
    MissingValues { key: String, operator: Operator },

    #[error("operator {operator:?} on key {key:?} must not carry values")]
    UnexpectedValues { key: String, operator: Operator },
}

/// One constraint on a label set.
enum Requirement<'a> {
    /// The label must be present with exactly this value.
    Equals { key: &'a str, value: &'a str },

    /// The label's value must (or, negated, must not) be in a set. An
    /// absent label satisfies only the negated form.
    InSet {
        key: &'a str,
        values: &'a BTreeSet<String>,
        negated: bool,
    },

    /// The label key must (or, negated, must not) exist; its value is
    /// irrelevant.
    Present { key: &'a str, negated: bool },
}

impl Requirement<'_> {
    fn holds(&self, labels: &Map) -> bool {
        match self {
            Requirement::Equals { key, value } => {
                labels.get(*key).map(String::as_str) == Some(*value)
            }
            Requirement::InSet {
                key,
                values,
                negated,
            } => match labels.get(*key) {
                Some(v) => values.contains(v) != *negated,
                None => *negated,
            },
            Requirement::Present { key, negated } => labels.contains_key(*key) != *negated,
        }
    }
}

// === Selector ===

impl Selector {
    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    pub fn from_expressions(expressions: Vec<Expression>) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(expressions),
        }
    }

    fn requirements(&self) -> impl Iterator<Item = Result<Requirement<'_>, InvalidSelector>> {
        let pairs = self.match_labels.iter().flatten().map(|(key, value)| {
            Ok(Requirement::Equals {
                key: key.as_str(),
                value: value.as_str(),
            })
        });
        let expressions = self
            .match_expressions
            .iter()
            .flatten()
            .map(Expression::lower);
        pairs.chain(expressions)
    }

    /// Rejects expressions that could never be evaluated.
    pub fn validate(&self) -> Result<(), InvalidSelector> {
        for requirement in self.requirements() {
            requirement?;
        }
        Ok(())
    }

    /// Whether this selector places no constraints at all.
    pub fn selects_all(&self) -> bool {
        self.requirements().next().is_none()
    }

    /// Whether every requirement holds for `labels`. A selector that fails
    /// [`Selector::validate`] matches nothing.
    pub fn matches(&self, labels: &Map) -> bool {
        self.requirements().all(|requirement| match requirement {
            Ok(requirement) => requirement.holds(labels),
            Err(error) => {
                tracing::warn!(%error, "unevaluable match expression");
                false
            }
        })
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

// === Expression ===

impl Expression {
    fn lower(&self) -> Result<Requirement<'_>, InvalidSelector> {
        let values = self.values.as_ref().filter(|values| !values.is_empty());
        match (self.operator, values) {
            (Operator::In, Some(values)) => Ok(Requirement::InSet {
                key: self.key.as_str(),
                values,
                negated: false,
            }),
            (Operator::NotIn, Some(values)) => Ok(Requirement::InSet {
                key: self.key.as_str(),
                values,
                negated: true,
            }),
            (Operator::Exists, None) => Ok(Requirement::Present {
                key: self.key.as_str(),
                negated: false,
            }),
            (Operator::DoesNotExist, None) => Ok(Requirement::Present {
                key: self.key.as_str(),
                negated: true,
            }),
            (operator @ (Operator::In | Operator::NotIn), None) => {
                Err(InvalidSelector::MissingValues {
                    key: self.key.clone(),
                    operator,
                })
            }
            (operator, Some(_)) => Err(InvalidSelector::UnexpectedValues {
                key: self.key.clone(),
                operator,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Map {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn expr(key: &str, operator: Operator, values: &[&str]) -> Expression {
        Expression {
            key: key.to_string(),
            operator,
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn match_labels_require_every_pair() {
        let selector = Selector::from_map(labels(&[("app", "web"), ("tier", "front")]));
        assert!(selector.matches(&labels(&[
            ("app", "web"),
            ("tier", "front"),
            ("extra", "x"),
        ])));
        assert!(!selector.matches(&labels(&[("app", "web")])));
        assert!(!selector.matches(&labels(&[("app", "api"), ("tier", "front")])));
    }

    #[test]
    fn set_expressions() {
        let selector = Selector::from_expressions(vec![expr("app", Operator::In, &["web", "api"])]);
        assert!(selector.matches(&labels(&[("app", "api")])));
        assert!(!selector.matches(&labels(&[("app", "db")])));
        assert!(!selector.matches(&labels(&[])));

        let selector = Selector::from_expressions(vec![expr("app", Operator::NotIn, &["db"])]);
        assert!(selector.matches(&labels(&[("app", "web")])));
        assert!(!selector.matches(&labels(&[("app", "db")])));
        // NotIn is satisfied by absence.
        assert!(selector.matches(&labels(&[])));
    }

    #[test]
    fn existence_expressions() {
        let selector = Selector::from_expressions(vec![expr("tier", Operator::Exists, &[])]);
        assert!(selector.matches(&labels(&[("tier", "front")])));
        assert!(!selector.matches(&labels(&[("app", "web")])));

        let selector = Selector::from_expressions(vec![expr("tier", Operator::DoesNotExist, &[])]);
        assert!(selector.matches(&labels(&[("app", "web")])));
        assert!(!selector.matches(&labels(&[("tier", "front")])));
    }

    #[test]
    fn labels_and_expressions_are_anded() {
        let selector: Selector = serde_json::from_str(
            r#"{"matchLabels":{"app":"web"},"matchExpressions":[{"key":"tier","operator":"In","values":["front"]}]}"#,
        )
        .unwrap();
        assert!(selector.validate().is_ok());
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "front")])));
        assert!(!selector.matches(&labels(&[("app", "web")])));
        assert!(!selector.matches(&labels(&[("tier", "front")])));
    }

    #[test]
    fn empty_selectors_select_everything() {
        assert!(Selector::default().selects_all());
        assert!(Selector::from_map(Map::new()).selects_all());
        assert!(Selector::default().matches(&labels(&[("anything", "at-all")])));
        assert!(!Selector::from_map(labels(&[("app", "web")])).selects_all());
    }

    #[test]
    fn malformed_expressions_fail_validation_and_match_nothing() {
        let missing = Selector::from_expressions(vec![expr("app", Operator::In, &[])]);
        assert_eq!(
            missing.validate(),
            Err(InvalidSelector::MissingValues {
                key: "app".to_string(),
                operator: Operator::In,
            })
        );
        assert!(!missing.matches(&labels(&[("app", "web")])));

        let unexpected = Selector::from_expressions(vec![expr("app", Operator::Exists, &["web"])]);
        assert_eq!(
            unexpected.validate(),
            Err(InvalidSelector::UnexpectedValues {
                key: "app".to_string(),
                operator: Operator::Exists,
            })
        );
        assert!(!unexpected.matches(&labels(&[("app", "web")])));

        let fine = Selector::from_expressions(vec![
            expr("app", Operator::In, &["web"]),
            expr("tier", Operator::DoesNotExist, &[]),
        ]);
        assert_eq!(fine.validate(), Ok(()));
    }
}
