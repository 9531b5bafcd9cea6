//! Sidecar injection: deciding whether a pod gets the forwarder and
//! emitting the JSON patch that adds it.

use ctxforge_k8s_api::{
    annotations::{self, FORWARDER_CONTAINER_NAME, FORWARDER_PORT},
    Capabilities, Container, ContainerPort, EnvVar, HTTPGetAction, IntOrString, Pod, Probe,
    Quantity, ResourceRequirements, SecurityContext,
};
use serde_json::json;
use std::collections::BTreeMap;

/// Proxy environment injected into every pre-existing container.
const HTTP_PROXY: &str = "HTTP_PROXY";
const HTTPS_PROXY: &str = "HTTPS_PROXY";
const NO_PROXY: &str = "NO_PROXY";
const NO_PROXY_LIST: &str = "localhost,127.0.0.1";

#[derive(Clone, Debug)]
pub struct InjectorConfig {
    /// The forwarder container image.
    pub image: String,

    /// Log level handed to injected forwarders.
    pub log_level: String,
}

/// The admission decision for one pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Admit unchanged: not opted in, or the sidecar is already present.
    Skip,

    /// Admit unchanged, surfacing a warning to the client.
    AdmitWithWarning(String),

    /// Reject with a descriptive reason.
    Reject(String),

    /// Admit with the given RFC 6902 patch operations.
    Inject(Vec<serde_json::Value>),
}

/// Decides what to do with a pod at creation.
pub fn evaluate(config: &InjectorConfig, pod: &Pod) -> Decision {
    let anns = pod.metadata.annotations.clone().unwrap_or_default();

    if !annotations::injection_enabled(&anns) {
        return Decision::Skip;
    }

    let Some(spec) = pod.spec.as_ref() else {
        return Decision::Skip;
    };

    // Idempotence: a marker annotation or a container with the forwarder's
    // name means this pod has already been through injection.
    if annotations::already_injected(&anns)
        || spec
            .containers
            .iter()
            .any(|c| c.name == FORWARDER_CONTAINER_NAME)
    {
        return Decision::Skip;
    }

    let headers = anns
        .get(annotations::HEADERS)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty());
    let rules = anns
        .get(annotations::HEADER_RULES)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty());

    let header_env = match (headers, rules) {
        (_, Some(rules)) => {
            if let Err(error) = ctxforge_header_rules::parse_structured(rules) {
                return Decision::Reject(format!(
                    "invalid {} annotation: {error}",
                    annotations::HEADER_RULES
                ));
            }
            ("HEADER_RULES", rules.to_string())
        }
        (Some(headers), None) => {
            if let Err(error) = ctxforge_header_rules::parse_simple_list(headers) {
                return Decision::Reject(format!(
                    "invalid {} annotation: {error}",
                    annotations::HEADERS
                ));
            }
            ("HEADERS_TO_PROPAGATE", headers.to_string())
        }
        (None, None) => {
            return Decision::AdmitWithWarning(format!(
                "{} is set but no headers are declared; add {} or {}",
                annotations::ENABLED,
                annotations::HEADERS,
                annotations::HEADER_RULES,
            ));
        }
    };

    let (target_port, port_warning) = match annotations::target_port(&anns) {
        Ok(port) => (port, None),
        Err(error) => (
            annotations::DEFAULT_TARGET_PORT,
            Some(format!(
                "{error}; falling back to {}",
                annotations::DEFAULT_TARGET_PORT
            )),
        ),
    };

    let mut ops = Vec::new();

    let sidecar = forwarder_container(config, target_port, header_env);
    ops.push(json!({
        "op": "add",
        "path": "/spec/containers/-",
        "value": sidecar,
    }));

    // Point every pre-existing container's outbound HTTP(S) traffic at the
    // forwarder. Indices are stable: the sidecar was appended at the tail.
    let proxy_url = format!("http://localhost:{FORWARDER_PORT}");
    for (i, container) in spec.containers.iter().enumerate() {
        let proxy_env = [
            env_var(HTTP_PROXY, &proxy_url),
            env_var(HTTPS_PROXY, &proxy_url),
            env_var(NO_PROXY, NO_PROXY_LIST),
        ];
        if container.env.as_ref().map(|e| e.is_empty()).unwrap_or(true) {
            ops.push(json!({
                "op": "add",
                "path": format!("/spec/containers/{i}/env"),
                "value": proxy_env,
            }));
        } else {
            for var in proxy_env {
                ops.push(json!({
                    "op": "add",
                    "path": format!("/spec/containers/{i}/env/-"),
                    "value": var,
                }));
            }
        }
    }

    // The opt-in annotation got us here, so /metadata/annotations exists.
    ops.push(json!({
        "op": "add",
        "path": format!("/metadata/annotations/{}", escape_pointer(annotations::INJECTED)),
        "value": "true",
    }));
    if let Some(warning) = port_warning {
        ops.push(json!({
            "op": "add",
            "path": format!(
                "/metadata/annotations/{}",
                escape_pointer(annotations::TARGET_PORT_WARNING)
            ),
            "value": warning,
        }));
    }

    Decision::Inject(ops)
}

/// The forwarder sidecar spec: fixed listener port, restricted security
/// posture, probes against its own health endpoints.
fn forwarder_container(
    config: &InjectorConfig,
    target_port: u16,
    (header_env_name, header_env_value): (&str, String),
) -> Container {
    Container {
        name: FORWARDER_CONTAINER_NAME.to_string(),
        image: Some(config.image.clone()),
        ports: Some(vec![ContainerPort {
            container_port: i32::from(FORWARDER_PORT),
            name: Some("proxy".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(vec![
            env_var(header_env_name, &header_env_value),
            env_var("TARGET_HOST", &format!("localhost:{target_port}")),
            env_var("PROXY_PORT", &FORWARDER_PORT.to_string()),
            env_var("LOG_LEVEL", &config.log_level),
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(quantities(&[("cpu", "50m"), ("memory", "64Mi")])),
            limits: Some(quantities(&[("cpu", "100m"), ("memory", "128Mi")])),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            read_only_root_filesystem: Some(true),
            run_as_non_root: Some(true),
            run_as_user: Some(65532),
            ..Default::default()
        }),
        liveness_probe: Some(http_probe("/healthz", 2, 10)),
        readiness_probe: Some(http_probe("/ready", 2, 5)),
        ..Default::default()
    }
}

fn http_probe(path: &str, initial_delay: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(i32::from(FORWARDER_PORT)),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn quantities(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

/// Escapes a key for use in a JSON pointer segment (RFC 6901).
fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> InjectorConfig {
        InjectorConfig {
            image: "ghcr.io/ctxforge/forwarder:latest".to_string(),
            log_level: "info".to_string(),
        }
    }

    fn pod_json(annotations: &[(&str, &str)]) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "web-0",
                "namespace": "default",
                "annotations": annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), json!(v)))
                    .collect::<serde_json::Map<_, _>>(),
            },
            "spec": {
                "containers": [{
                    "name": "app",
                    "image": "example/app:1",
                    "ports": [{"containerPort": 3000}],
                }],
            },
        })
    }

    fn pod(annotations: &[(&str, &str)]) -> Pod {
        serde_json::from_value(pod_json(annotations)).unwrap()
    }

    fn apply(pod_value: &serde_json::Value, ops: Vec<serde_json::Value>) -> serde_json::Value {
        let patch: json_patch::Patch =
            serde_json::from_value(serde_json::Value::Array(ops)).unwrap();
        let mut doc = pod_value.clone();
        json_patch::patch(&mut doc, &patch).unwrap();
        doc
    }

    #[test]
    fn skips_pods_that_did_not_opt_in() {
        assert_eq!(evaluate(&config(), &pod(&[])), Decision::Skip);
        assert_eq!(
            evaluate(
                &config(),
                &pod(&[("ctxforge.io/enabled", "false"), ("ctxforge.io/headers", "x-a")])
            ),
            Decision::Skip
        );
    }

    #[test]
    fn warns_when_enabled_without_headers() {
        let decision = evaluate(&config(), &pod(&[("ctxforge.io/enabled", "true")]));
        let Decision::AdmitWithWarning(warning) = decision else {
            panic!("expected a warning, got {decision:?}");
        };
        assert!(warning.contains("ctxforge.io/headers"));
    }

    #[test]
    fn rejects_malformed_headers() {
        let decision = evaluate(
            &config(),
            &pod(&[
                ("ctxforge.io/enabled", "true"),
                ("ctxforge.io/headers", "bad header name"),
            ]),
        );
        assert!(matches!(decision, Decision::Reject(_)), "{decision:?}");

        let decision = evaluate(
            &config(),
            &pod(&[
                ("ctxforge.io/enabled", "true"),
                ("ctxforge.io/header-rules", "{not json"),
            ]),
        );
        let Decision::Reject(reason) = decision else {
            panic!("expected rejection");
        };
        assert!(reason.contains("ctxforge.io/header-rules"));
    }

    #[test]
    fn injects_sidecar_env_and_marker() {
        let source = pod_json(&[
            ("ctxforge.io/enabled", "true"),
            ("ctxforge.io/headers", "x-request-id,x-tenant-id"),
            ("ctxforge.io/target-port", "3000"),
        ]);
        let Decision::Inject(ops) = evaluate(&config(), &serde_json::from_value(source.clone()).unwrap())
        else {
            panic!("expected injection");
        };

        let patched = apply(&source, ops);
        let containers = patched["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 2);

        // The app container gains exactly the three proxy env vars.
        let app = &containers[0];
        let env = app["env"].as_array().unwrap();
        let get = |name: &str| {
            env.iter()
                .find(|e| e["name"] == name)
                .unwrap_or_else(|| panic!("missing env {name}"))["value"]
                .as_str()
                .unwrap()
                .to_string()
        };
        assert_eq!(get("HTTP_PROXY"), "http://localhost:9090");
        assert_eq!(get("HTTPS_PROXY"), "http://localhost:9090");
        assert_eq!(get("NO_PROXY"), "localhost,127.0.0.1");

        // The sidecar carries the declared configuration.
        let sidecar = &containers[1];
        assert_eq!(sidecar["name"], "ctxforge-forwarder");
        let sidecar_env = sidecar["env"].as_array().unwrap();
        let sidecar_get = |name: &str| {
            sidecar_env
                .iter()
                .find(|e| e["name"] == name)
                .unwrap_or_else(|| panic!("missing env {name}"))["value"]
                .as_str()
                .unwrap()
                .to_string()
        };
        assert_eq!(sidecar_get("TARGET_HOST"), "localhost:3000");
        assert_eq!(
            sidecar_get("HEADERS_TO_PROPAGATE"),
            "x-request-id,x-tenant-id"
        );
        assert_eq!(sidecar["ports"][0]["containerPort"], 9090);
        assert_eq!(sidecar["livenessProbe"]["httpGet"]["path"], "/healthz");
        assert_eq!(sidecar["readinessProbe"]["httpGet"]["path"], "/ready");
        assert_eq!(
            sidecar["securityContext"]["readOnlyRootFilesystem"],
            true
        );

        assert_eq!(patched["metadata"]["annotations"]["ctxforge.io/injected"], "true");
    }

    #[test]
    fn structured_rules_are_passed_verbatim() {
        let rules = r#"[{"name":"x-request-id","generate":true}]"#;
        let source = pod_json(&[
            ("ctxforge.io/enabled", "true"),
            ("ctxforge.io/header-rules", rules),
            // Structured rules win over the simple list.
            ("ctxforge.io/headers", "x-ignored"),
        ]);
        let Decision::Inject(ops) =
            evaluate(&config(), &serde_json::from_value(source.clone()).unwrap())
        else {
            panic!("expected injection");
        };

        let patched = apply(&source, ops);
        let sidecar = &patched["spec"]["containers"][1];
        let env = sidecar["env"].as_array().unwrap();
        let rules_env = env.iter().find(|e| e["name"] == "HEADER_RULES").unwrap();
        assert_eq!(rules_env["value"], rules);
        assert!(!env.iter().any(|e| e["name"] == "HEADERS_TO_PROPAGATE"));
    }

    #[test]
    fn existing_env_vars_are_preserved() {
        let mut source = pod_json(&[
            ("ctxforge.io/enabled", "true"),
            ("ctxforge.io/headers", "x-a"),
        ]);
        source["spec"]["containers"][0]["env"] =
            json!([{"name": "EXISTING", "value": "kept"}]);
        let Decision::Inject(ops) =
            evaluate(&config(), &serde_json::from_value(source.clone()).unwrap())
        else {
            panic!("expected injection");
        };

        let patched = apply(&source, ops);
        let env = patched["spec"]["containers"][0]["env"].as_array().unwrap();
        assert_eq!(env[0]["name"], "EXISTING");
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn invalid_target_port_falls_back_with_warning() {
        let source = pod_json(&[
            ("ctxforge.io/enabled", "true"),
            ("ctxforge.io/headers", "x-a"),
            ("ctxforge.io/target-port", "9090"),
        ]);
        let Decision::Inject(ops) =
            evaluate(&config(), &serde_json::from_value(source.clone()).unwrap())
        else {
            panic!("expected injection");
        };

        let patched = apply(&source, ops);
        let sidecar = &patched["spec"]["containers"][1];
        let env = sidecar["env"].as_array().unwrap();
        let target = env.iter().find(|e| e["name"] == "TARGET_HOST").unwrap();
        assert_eq!(target["value"], "localhost:8080");
        assert!(patched["metadata"]["annotations"]["ctxforge.io/target-port-warning"]
            .as_str()
            .unwrap()
            .contains("9090"));
    }

    #[test]
    fn reinjection_is_a_no_op() {
        let source = pod_json(&[
            ("ctxforge.io/enabled", "true"),
            ("ctxforge.io/headers", "x-request-id"),
        ]);
        let Decision::Inject(ops) =
            evaluate(&config(), &serde_json::from_value(source.clone()).unwrap())
        else {
            panic!("expected injection");
        };
        let patched = apply(&source, ops);

        // A second pass over the patched pod changes nothing, so the
        // serialized workload is byte-identical.
        let decision = evaluate(&config(), &serde_json::from_value(patched.clone()).unwrap());
        assert_eq!(decision, Decision::Skip);
    }

    #[test]
    fn container_name_alone_blocks_injection() {
        let mut source = pod_json(&[
            ("ctxforge.io/enabled", "true"),
            ("ctxforge.io/headers", "x-a"),
        ]);
        source["spec"]["containers"]
            .as_array_mut()
            .unwrap()
            .push(json!({"name": "ctxforge-forwarder", "image": "x"}));
        let decision = evaluate(&config(), &serde_json::from_value(source).unwrap());
        assert_eq!(decision, Decision::Skip);
    }

    #[test]
    fn pointer_escaping() {
        assert_eq!(escape_pointer("ctxforge.io/injected"), "ctxforge.io~1injected");
        assert_eq!(escape_pointer("a~b/c"), "a~0b~1c");
    }
}
