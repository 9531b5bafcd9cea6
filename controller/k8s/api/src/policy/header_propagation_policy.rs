use crate::labels;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declares a set of headers that must flow across the HTTP calls of the
/// pods selected by `pod_selector`. The data path is configured at
/// injection time; this resource exists so operators can express the intent
/// declaratively and observe where it applies.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "ctxforge.io",
    version = "v1alpha1",
    kind = "HeaderPropagationPolicy",
    status = "HeaderPropagationPolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HeaderPropagationPolicySpec {
    /// Pods the policy applies to. Absent selects every pod in the
    /// namespace.
    pub pod_selector: Option<labels::Selector>,

    pub propagation_rules: Vec<PropagationRule>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PropagationRule {
    pub headers: Vec<PolicyHeader>,

    /// Anchored regular expression over the request path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_regex: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyHeader {
    pub name: String,

    #[serde(default)]
    pub generate: bool,

    /// One of `uuid-v4`, `ulid`, or `rfc3339-timestamp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator_type: Option<String>,

    #[serde(default = "default_true")]
    pub propagate: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderPropagationPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Running pods bearing the forwarder that match the selector.
    #[serde(default)]
    pub applied_to_pods: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_declared_shape() {
        let policy: HeaderPropagationPolicySpec = serde_json::from_str(
            r#"{
                "podSelector": {"matchLabels": {"app": "web"}},
                "propagationRules": [{
                    "headers": [
                        {"name": "x-request-id", "generate": true, "generatorType": "uuid-v4"},
                        {"name": "x-tenant-id"}
                    ],
                    "pathRegex": "^/api/.*",
                    "methods": ["GET", "POST"]
                }]
            }"#,
        )
        .unwrap();

        let rule = &policy.propagation_rules[0];
        assert_eq!(rule.headers.len(), 2);
        assert!(rule.headers[0].generate);
        assert_eq!(rule.headers[0].generator_type.as_deref(), Some("uuid-v4"));
        assert!(rule.headers[1].propagate);
        assert_eq!(rule.path_regex.as_deref(), Some("^/api/.*"));
    }

    #[test]
    fn crd_identity() {
        use kube::CustomResourceExt;
        let crd = HeaderPropagationPolicy::crd();
        assert_eq!(crd.spec.group, "ctxforge.io");
        assert_eq!(crd.spec.names.kind, "HeaderPropagationPolicy");
        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        assert!(
            version
                .subresources
                .as_ref()
                .and_then(|s| s.status.as_ref())
                .is_some(),
            "status subresource must be declared"
        );
    }

    #[test]
    fn status_serializes_camel_case() {
        let status = HeaderPropagationPolicyStatus {
            observed_generation: Some(3),
            applied_to_pods: 2,
            conditions: Vec::new(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["observedGeneration"], 3);
        assert_eq!(json["appliedToPods"], 2);
    }
}
