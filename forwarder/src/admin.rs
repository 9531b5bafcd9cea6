//! The admin listener: liveness, readiness, and metrics.

use crate::proxy::{full, Body};
use chrono::{SecondsFormat, Utc};
use http::{header, Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use prometheus_client::registry::Registry;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Bound on the readiness probe's upstream dial.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Server {
    listener: TcpListener,
    target_host: String,
}

impl Server {
    pub(crate) fn new(listener: TcpListener, target_host: String) -> Self {
        Self {
            listener,
            target_host,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("bound listener has a local address")
    }

    pub async fn run(self, drain: drain::Watch, registry: Arc<Registry>) {
        let Self {
            listener,
            target_host,
        } = self;
        info!(addr = %listener.local_addr().expect("bound listener has a local address"), "admin listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _peer)) => {
                        let target_host = target_host.clone();
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                handle(target_host.clone(), registry.clone(), req)
                            });
                            let conn = hyper::server::conn::http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service);
                            if let Err(error) = conn.await {
                                debug!(%error, "admin connection closed");
                            }
                        });
                    }
                    Err(error) => warn!(%error, "failed to accept admin connection"),
                },
                _shutdown = drain.clone().signaled() => {
                    debug!("admin listener draining");
                    break;
                }
            }
        }
    }
}

async fn handle(
    target_host: String,
    registry: Arc<Registry>,
    req: Request<Incoming>,
) -> Result<Response<Body>, Infallible> {
    let rsp = if req.method() == Method::GET {
        match req.uri().path() {
            "/healthz" => healthz_response(),
            "/ready" => ready_response(&target_host).await,
            "/metrics" => metrics_response(&registry),
            _ => not_found(),
        }
    } else {
        not_found()
    };
    Ok(rsp)
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(full("not found\n"))
        .expect("static response must be valid")
}

/// Liveness: succeeds whenever the process is serving at all.
pub(crate) fn healthz_response() -> Response<Body> {
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "timestamp": timestamp(),
        }),
    )
}

/// Readiness: succeeds only when a fresh TCP connection to the application
/// completes within the probe timeout.
pub(crate) async fn ready_response(target_host: &str) -> Response<Body> {
    let reachable = matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(target_host)).await,
        Ok(Ok(_))
    );
    let status = if reachable {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(
        status,
        serde_json::json!({
            "status": if reachable { "ready" } else { "not ready" },
            "targetHost": target_host,
            "targetReachable": reachable,
            "timestamp": timestamp(),
        }),
    )
}

fn metrics_response(registry: &Registry) -> Response<Body> {
    let mut out = String::new();
    match prometheus_client::encoding::text::encode(&mut out, registry) {
        Ok(()) => Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(full(out))
            .expect("metrics response must be valid"),
        Err(error) => {
            warn!(%error, "failed to encode metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(full("metrics encoding failed\n"))
                .expect("static response must be valid")
        }
    }
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full(body.to_string()))
        .expect("json response must be valid")
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(rsp: Response<Body>) -> serde_json::Value {
        let bytes = rsp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn liveness_is_unconditional() {
        let rsp = healthz_response();
        assert_eq!(rsp.status(), StatusCode::OK);
        let json = body_json(rsp).await;
        assert_eq!(json["status"], "healthy");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn readiness_names_the_probed_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let rsp = ready_response(&addr).await;
        assert_eq!(rsp.status(), StatusCode::OK);
        let json = body_json(rsp).await;
        assert_eq!(json["status"], "ready");
        assert_eq!(json["targetHost"], addr);
        assert_eq!(json["targetReachable"], true);
    }

    #[tokio::test]
    async fn readiness_fails_when_the_target_is_down() {
        // RFC 5737 TEST-NET-1: guaranteed unroutable.
        let rsp = ready_response("192.0.2.1:9").await;
        assert_eq!(rsp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(rsp).await;
        assert_eq!(json["status"], "not ready");
        assert_eq!(json["targetReachable"], false);
    }
}
