//! The `ctxforge.io` annotation and label surface.

use std::collections::BTreeMap;

/// Opts a workload in to sidecar injection when set to `"true"`.
pub const ENABLED: &str = "ctxforge.io/enabled";

/// Comma-separated header names (simple mode).
pub const HEADERS: &str = "ctxforge.io/headers";

/// JSON-encoded rule array (structured mode; overrides [`HEADERS`]).
pub const HEADER_RULES: &str = "ctxforge.io/header-rules";

/// The application container's listening port. Defaults to 8080.
pub const TARGET_PORT: &str = "ctxforge.io/target-port";

/// Set by the injector once a workload has been mutated.
pub const INJECTED: &str = "ctxforge.io/injected";

/// Added alongside a fallback when the declared target port is unusable.
pub const TARGET_PORT_WARNING: &str = "ctxforge.io/target-port-warning";

/// Namespace-scope opt-in label. Advisory: the per-pod [`ENABLED`]
/// annotation remains authoritative.
pub const NAMESPACE_INJECTION_LABEL: &str = "ctxforge.io/injection";

/// The default application port assumed when none is declared.
pub const DEFAULT_TARGET_PORT: u16 = 8080;

/// The forwarder's fixed listener port inside the pod.
pub const FORWARDER_PORT: u16 = 9090;

/// The injected sidecar's container name. Its presence marks a pod as
/// already carrying the forwarder.
pub const FORWARDER_CONTAINER_NAME: &str = "ctxforge-forwarder";

pub type Annotations = BTreeMap<String, String>;

/// Whether the workload opted in. Only the literal `"true"` counts.
pub fn injection_enabled(annotations: &Annotations) -> bool {
    annotations.get(ENABLED).map(String::as_str) == Some("true")
}

/// Whether the workload was already mutated.
pub fn already_injected(annotations: &Annotations) -> bool {
    annotations.get(INJECTED).map(String::as_str) == Some("true")
}

/// Reads the declared target port, falling back to the default when the
/// value is non-numeric, out of range, or collides with the forwarder's own
/// port. The error carries the reason so callers can surface a warning.
pub fn target_port(annotations: &Annotations) -> Result<u16, InvalidTargetPort> {
    let Some(raw) = annotations.get(TARGET_PORT) else {
        return Ok(DEFAULT_TARGET_PORT);
    };
    let port: u16 = raw
        .trim()
        .parse()
        .map_err(|_| InvalidTargetPort::NotAPort(raw.clone()))?;
    if port == 0 {
        return Err(InvalidTargetPort::NotAPort(raw.clone()));
    }
    if port == FORWARDER_PORT {
        return Err(InvalidTargetPort::CollidesWithForwarder(port));
    }
    Ok(port)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidTargetPort {
    #[error("target-port {0:?} is not a port number in [1, 65535]")]
    NotAPort(String),

    #[error("target-port {0} collides with the forwarder listener port")]
    CollidesWithForwarder(u16),
}
