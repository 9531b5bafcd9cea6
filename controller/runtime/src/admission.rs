//! The mutating admission server.
//!
//! Receives `AdmissionReview`s for pod creation, consults the injection
//! decision, and answers with a JSON patch, a warning, or a denial.

use crate::inject::{self, Decision, InjectorConfig};
use http_body_util::BodyExt;
use hyper::http::{header, Method, StatusCode};
use hyper::{Request, Response};
use kube::core::DynamicObject;
use kube::Resource;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Admission {
    config: Arc<InjectorConfig>,
    failure_policy: FailurePolicy,
}

/// What to do when patch construction itself fails.
#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum FailurePolicy {
    /// Reject the workload.
    Fail,
    /// Admit the workload unchanged.
    Ignore,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        Box::pin(self.clone().serve(req))
    }
}

impl Admission {
    pub fn new(config: Arc<InjectorConfig>, failure_policy: FailurePolicy) -> Self {
        Self {
            config,
            failure_policy,
        }
    }

    /// The webhook surface is a single POST endpoint; anything else is 404.
    async fn serve(self, req: Request<hyper::body::Incoming>) -> Result<Response<Body>, Error> {
        if req.method() != Method::POST || req.uri().path() != "/" {
            return Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::default())
                .expect("not-found response must be valid"));
        }

        let body = req.into_body().collect().await?.to_bytes();
        let review = self.review(&body);
        let bytes = serde_json::to_vec(&review)?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::new(bytes.into()))
            .expect("review response must be valid"))
    }

    /// Runs one serialized review through parsing, conversion, and the
    /// injection decision. Every failure mode still produces an answerable
    /// review; nothing here returns an HTTP error.
    fn review(&self, body: &[u8]) -> Review {
        let review: Review = match serde_json::from_slice(body) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "admission review did not parse");
                return AdmissionResponse::invalid(error).into_review();
            }
        };

        let rsp = match TryInto::<AdmissionRequest>::try_into(review) {
            Ok(req) => self.admit(req),
            Err(error) => {
                warn!(%error, "admission review carried no usable request");
                AdmissionResponse::invalid(error)
            }
        };
        debug!(?rsp);
        rsp.into_review()
    }

    fn admit(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);

        if !is_kind::<ctxforge_k8s_api::Pod>(&req) {
            return AdmissionResponse::invalid(format!(
                "unsupported resource type: {}.{}.{}",
                req.kind.group, req.kind.version, req.kind.kind
            ));
        }

        // Only creations are mutated; updates of an injected pod carry the
        // marker already and are admitted unchanged.
        if !matches!(req.operation, kube::core::admission::Operation::Create) {
            return rsp;
        }

        let Some(obj) = req.object else {
            return AdmissionResponse::invalid("admission request is missing 'object'");
        };
        let pod: ctxforge_k8s_api::Pod = match parse_pod(&obj) {
            Ok(pod) => pod,
            Err(error) => {
                warn!(%error, "failed to deserialize pod");
                return AdmissionResponse::invalid(error);
            }
        };

        let name = pod.metadata.name.clone().unwrap_or_default();
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();

        let decision = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            inject::evaluate(&self.config, &pod)
        })) {
            Ok(decision) => decision,
            Err(_) => {
                warn!(%namespace, %name, "panicked while constructing the injection patch");
                return self.fail_or_admit(rsp);
            }
        };

        match decision {
            Decision::Skip => rsp,
            Decision::AdmitWithWarning(warning) => {
                info!(%namespace, %name, %warning, "admitting without injection");
                let mut rsp = rsp;
                rsp.warnings = Some(vec![warning]);
                rsp
            }
            Decision::Reject(reason) => {
                info!(%namespace, %name, %reason, "denied");
                rsp.deny(reason)
            }
            Decision::Inject(ops) => {
                debug!(%namespace, %name, patch_ops = ops.len(), "injecting forwarder");
                let fallback = rsp.clone();
                let patch = match serde_json::from_value::<json_patch::Patch>(Value::Array(ops)) {
                    Ok(patch) => patch,
                    Err(error) => {
                        warn!(%namespace, %name, %error, "failed to encode injection patch");
                        return self.fail_or_admit(fallback);
                    }
                };
                match rsp.with_patch(patch) {
                    Ok(rsp) => rsp,
                    Err(error) => {
                        warn!(%namespace, %name, %error, "failed to attach injection patch");
                        self.fail_or_admit(fallback)
                    }
                }
            }
        }
    }

    /// Applies the configured failure policy to a response that could not
    /// be patched.
    fn fail_or_admit(&self, rsp: AdmissionResponse) -> AdmissionResponse {
        match self.failure_policy {
            FailurePolicy::Fail => rsp.deny("sidecar injection failed"),
            FailurePolicy::Ignore => rsp,
        }
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    *req.kind.group == *T::group(&dt) && *req.kind.kind == *T::kind(&dt)
}

/// Rebuilds the typed pod from the review's dynamic object.
fn parse_pod(obj: &DynamicObject) -> Result<ctxforge_k8s_api::Pod, serde_json::Error> {
    let value = serde_json::to_value(obj)?;
    serde_json::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn admission(policy: FailurePolicy) -> Admission {
        Admission::new(
            Arc::new(InjectorConfig {
                image: "ghcr.io/ctxforge/forwarder:latest".to_string(),
                log_level: "info".to_string(),
            }),
            policy,
        )
    }

    fn pod(annotations: serde_json::Value) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "web-0",
                "namespace": "default",
                "annotations": annotations,
            },
            "spec": {
                "containers": [{"name": "app", "image": "example/app:1"}],
            },
        })
    }

    fn request_for(
        kind: &str,
        operation: &str,
        object: serde_json::Value,
    ) -> AdmissionRequest {
        let review: Review = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "review-1",
                "kind": {"group": "", "version": "v1", "kind": kind},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "namespace": "default",
                "operation": operation,
                "userInfo": {},
                "object": object,
            },
        }))
        .expect("review must parse");
        review.try_into().expect("request must convert")
    }

    #[test]
    fn creations_are_answered_with_a_json_patch() {
        let source = pod(json!({
            "ctxforge.io/enabled": "true",
            "ctxforge.io/headers": "x-request-id,x-tenant-id",
        }));
        let rsp = admission(FailurePolicy::Fail)
            .admit(request_for("Pod", "CREATE", source.clone()));
        assert!(rsp.allowed);

        let patch: json_patch::Patch =
            serde_json::from_slice(rsp.patch.as_deref().expect("a patch must be attached"))
                .unwrap();
        let mut doc = source;
        json_patch::patch(&mut doc, &patch).unwrap();

        let containers = doc["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[1]["name"], "ctxforge-forwarder");
        assert_eq!(doc["metadata"]["annotations"]["ctxforge.io/injected"], "true");
    }

    #[test]
    fn updates_are_admitted_unchanged() {
        let source = pod(json!({
            "ctxforge.io/enabled": "true",
            "ctxforge.io/headers": "x-request-id",
        }));
        let rsp = admission(FailurePolicy::Fail).admit(request_for("Pod", "UPDATE", source));
        assert!(rsp.allowed);
        assert!(rsp.patch.is_none());
    }

    #[test]
    fn enabled_without_headers_warns_but_admits() {
        let rsp = admission(FailurePolicy::Fail).admit(request_for(
            "Pod",
            "CREATE",
            pod(json!({"ctxforge.io/enabled": "true"})),
        ));
        assert!(rsp.allowed);
        assert!(rsp.patch.is_none());
        let warnings = rsp.warnings.expect("a warning must be surfaced");
        assert!(warnings[0].contains("ctxforge.io/headers"), "{warnings:?}");
    }

    #[test]
    fn malformed_rules_are_denied_with_the_offending_field() {
        let rsp = admission(FailurePolicy::Fail).admit(request_for(
            "Pod",
            "CREATE",
            pod(json!({
                "ctxforge.io/enabled": "true",
                "ctxforge.io/header-rules": "{not json",
            })),
        ));
        assert!(!rsp.allowed);
        assert!(
            rsp.result.message.contains("ctxforge.io/header-rules"),
            "{}",
            rsp.result.message
        );
    }

    #[test]
    fn opted_out_pods_are_admitted_untouched() {
        let rsp = admission(FailurePolicy::Fail).admit(request_for("Pod", "CREATE", pod(json!({}))));
        assert!(rsp.allowed);
        assert!(rsp.patch.is_none());
        assert!(rsp.warnings.is_none());
    }

    #[test]
    fn other_kinds_are_not_served() {
        let rsp = admission(FailurePolicy::Fail).admit(request_for(
            "ConfigMap",
            "CREATE",
            json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cm"}}),
        ));
        assert!(!rsp.allowed);
    }
}
