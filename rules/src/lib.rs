//! Header propagation rules.
//!
//! A rule names an HTTP header that must flow across service-to-service
//! calls, optionally synthesizing a value when the header is absent and
//! optionally restricting the rule to a subset of paths and methods. Rules
//! are parsed once at startup from either a comma-separated header-name list
//! or a structured JSON array; the [`Engine`] then answers, per request,
//! which (name, value) pairs belong in that request's scope.

#![forbid(unsafe_code)]

pub mod generate;

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub use self::generate::{GeneratorKind, Generators};

/// Methods a rule's `methods` filter may name.
const KNOWN_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS", "TRACE", "CONNECT",
];

/// One configured header propagation rule.
///
/// The rule's `name` is held in canonical case; matching against inbound
/// headers is case-insensitive.
#[derive(Clone, Debug)]
pub struct HeaderRule {
    name: String,
    generate: bool,
    generator_kind: GeneratorKind,
    propagate: bool,
    path_pattern: Option<PathPattern>,
    methods: Option<BTreeSet<String>>,
}

/// An anchored path filter, retaining the source expression for
/// serialization.
#[derive(Clone, Debug)]
struct PathPattern {
    raw: String,
    re: regex::Regex,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid header name {0:?}: names are 1-256 ASCII alphanumerics or hyphens and must begin with an alphanumeric")]
    InvalidHeaderName(String),

    #[error("rule {name:?}: pathPattern {pattern:?} does not compile: {source}")]
    InvalidPathPattern {
        name: String,
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },

    #[error("rule {name:?}: unrecognized method {method:?} in methods")]
    InvalidMethod { name: String, method: String },

    #[error("failed to parse header rules JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no header rules configured: declare at least one header")]
    Empty,
}

/// The wire form of a structured rule, as carried in the `HEADER_RULES`
/// environment variable and the pod annotation.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct RawRule {
    name: String,
    #[serde(default)]
    generate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generator_kind: Option<GeneratorKind>,
    #[serde(default = "default_true")]
    propagate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    methods: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

/// Folds a header name into canonical case: the first character of each
/// hyphen-delimited segment uppercased, the remainder lowercased.
pub fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, segment) in name.split('-').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars.map(|c| c.to_ascii_lowercase()));
        }
    }
    out
}

fn valid_header_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 256 {
        return false;
    }
    if !bytes[0].is_ascii_alphanumeric() {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

impl HeaderRule {
    /// A rule that propagates `name` on all paths and methods, the shape the
    /// legacy comma-separated configuration produces.
    pub fn propagate_only(name: &str) -> Result<Self, ParseError> {
        if !valid_header_name(name) {
            return Err(ParseError::InvalidHeaderName(name.to_string()));
        }
        Ok(Self {
            name: canonical_name(name),
            generate: false,
            generator_kind: GeneratorKind::default(),
            propagate: true,
            path_pattern: None,
            methods: None,
        })
    }

    fn from_raw(raw: RawRule) -> Result<Self, ParseError> {
        if !valid_header_name(&raw.name) {
            return Err(ParseError::InvalidHeaderName(raw.name));
        }
        let name = canonical_name(&raw.name);

        let path_pattern = raw
            .path_pattern
            .map(|pattern| {
                regex::Regex::new(&format!("^(?:{pattern})$"))
                    .map(|re| PathPattern {
                        raw: pattern.clone(),
                        re,
                    })
                    .map_err(|e| ParseError::InvalidPathPattern {
                        name: name.clone(),
                        pattern,
                        source: Box::new(e),
                    })
            })
            .transpose()?;

        let methods = raw
            .methods
            .map(|methods| {
                methods
                    .into_iter()
                    .map(|m| {
                        let upper = m.to_ascii_uppercase();
                        if KNOWN_METHODS.contains(&upper.as_str()) {
                            Ok(upper)
                        } else {
                            Err(ParseError::InvalidMethod {
                                name: name.clone(),
                                method: m,
                            })
                        }
                    })
                    .collect::<Result<BTreeSet<_>, _>>()
            })
            .transpose()?;

        Ok(Self {
            name,
            generate: raw.generate,
            generator_kind: raw.generator_kind.unwrap_or_default(),
            propagate: raw.propagate,
            path_pattern,
            methods,
        })
    }

    fn to_raw(&self) -> RawRule {
        RawRule {
            name: self.name.clone(),
            generate: self.generate,
            generator_kind: self.generate.then_some(self.generator_kind),
            propagate: self.propagate,
            path_pattern: self.path_pattern.as_ref().map(|p| p.raw.clone()),
            methods: self
                .methods
                .as_ref()
                .map(|ms| ms.iter().cloned().collect()),
        }
    }

    /// The rule's canonical header name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generates(&self) -> bool {
        self.generate
    }

    pub fn generator_kind(&self) -> GeneratorKind {
        self.generator_kind
    }

    pub fn propagates(&self) -> bool {
        self.propagate
    }

    /// Whether this rule applies to a request with the given path and
    /// method. Both filters must hold; an absent filter matches everything.
    pub fn matches(&self, path: &str, method: &str) -> bool {
        if let Some(pattern) = &self.path_pattern {
            if !pattern.re.is_match(path) {
                return false;
            }
        }
        if let Some(methods) = &self.methods {
            if !methods.contains(&method.to_ascii_uppercase()) {
                return false;
            }
        }
        true
    }
}

/// The per-request decision produced by [`Engine::resolve`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Pairs to record in the request's scope: every matched rule with
    /// `propagate` whose header carries a non-empty value (extracted or
    /// generated), keyed by canonical name.
    pub scope: BTreeMap<String, String>,

    /// Headers synthesized for this request; these must be set on the
    /// forwarded request whether or not they are also propagated.
    pub generated: Vec<(String, String)>,
}

/// The rule engine: an ordered rule list plus the generator state shared by
/// every request.
#[derive(Debug)]
pub struct Engine {
    rules: Vec<HeaderRule>,
    generators: Generators,
}

impl Engine {
    pub fn new(rules: Vec<HeaderRule>) -> Self {
        Self {
            rules,
            generators: Generators::new(),
        }
    }

    /// Parses rules from the two mutually exclusive configuration inputs.
    /// The structured JSON input wins when both are set; the legacy list is
    /// then ignored.
    pub fn from_sources(
        simple: Option<&str>,
        structured: Option<&str>,
    ) -> Result<Self, ParseError> {
        parse_sources(simple, structured).map(Self::new)
    }

    pub fn rules(&self) -> &[HeaderRule] {
        &self.rules
    }

    /// Decides, for one request, which header values belong in its scope and
    /// which must be synthesized. Rules are evaluated independently and in
    /// order; a value generated by an earlier rule is visible to later rules
    /// for the same header, so at most one value is ever generated per
    /// header per request.
    pub fn resolve(&self, path: &str, method: &str, headers: &HeaderMap) -> Resolution {
        let mut resolution = Resolution::default();
        // Values already established for this request, keyed by canonical
        // name. Seeded lazily from the inbound headers.
        let mut effective: BTreeMap<String, Option<String>> = BTreeMap::new();

        for rule in &self.rules {
            if !rule.matches(path, method) {
                continue;
            }
            tracing::debug!(rule = %rule.name, %path, %method, "rule matched");

            let value = effective
                .entry(rule.name.clone())
                .or_insert_with(|| extract(headers, &rule.name))
                .clone();

            let value = match value {
                Some(v) => Some(v),
                None if rule.generate => {
                    let v = self.generators.generate(rule.generator_kind);
                    resolution.generated.push((rule.name.clone(), v.clone()));
                    effective.insert(rule.name.clone(), Some(v.clone()));
                    Some(v)
                }
                None => None,
            };

            if let Some(v) = value {
                if rule.propagate && !v.is_empty() {
                    resolution.scope.insert(rule.name.clone(), v);
                }
            }
        }

        resolution
    }
}

/// Looks a header up case-insensitively, treating unparseable values as
/// absent. Empty values are returned as-is; propagation filters them, but
/// presence still suppresses generation.
fn extract(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name.to_ascii_lowercase())
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Parses the legacy comma-separated header-name list.
pub fn parse_simple_list(list: &str) -> Result<Vec<HeaderRule>, ParseError> {
    let rules = list
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(HeaderRule::propagate_only)
        .collect::<Result<Vec<_>, _>>()?;
    if rules.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(rules)
}

/// Parses the structured JSON rule array.
pub fn parse_structured(json: &str) -> Result<Vec<HeaderRule>, ParseError> {
    let raw: Vec<RawRule> = serde_json::from_str(json)?;
    let rules = raw
        .into_iter()
        .map(HeaderRule::from_raw)
        .collect::<Result<Vec<_>, _>>()?;
    if rules.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(rules)
}

fn parse_sources(
    simple: Option<&str>,
    structured: Option<&str>,
) -> Result<Vec<HeaderRule>, ParseError> {
    match (simple, structured) {
        (_, Some(json)) => parse_structured(json),
        (Some(list), None) => parse_simple_list(list),
        (None, None) => Err(ParseError::Empty),
    }
}

/// Serializes a rule list back to its structured JSON form.
pub fn to_json(rules: &[HeaderRule]) -> String {
    let raw: Vec<RawRule> = rules.iter().map(HeaderRule::to_raw).collect();
    serde_json::to_string(&raw).expect("header rules serialize to JSON")
}
