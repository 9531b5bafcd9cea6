//! The dual-role proxy listener.
//!
//! One port, three request shapes:
//!
//! * origin-form (`GET /path`) — reverse-proxied to the co-located
//!   application, with `/healthz` and `/ready` carved out for kubelet
//!   probes;
//! * absolute-form (`GET http://host/path`) — forward-proxied to the named
//!   target;
//! * `CONNECT host:port` — tunneled verbatim, no header inspection.
//!
//! Every non-CONNECT request gets a freshly resolved [`RequestScope`] in its
//! extensions before it is dispatched; the proxied call re-attaches the
//! scope's headers. The upstream client pools keep-alive connections, so the
//! scope must never live anywhere but the request itself.

use crate::config::Config;
use crate::io::TimeoutIo;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::scope::RequestScope;
use bytes::Bytes;
use ctxforge_header_rules::Engine;
use futures::FutureExt;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

mod inbound;
mod outbound;

pub(crate) type Body = BoxBody<Bytes, hyper::Error>;

/// Header values synthesized for this request. Unlike the scope, these are
/// set on the forwarded request even when their rule does not propagate.
#[derive(Clone, Debug, Default)]
pub(crate) struct Generated(pub(crate) Arc<Vec<(String, String)>>);

impl Generated {
    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

pub(crate) fn full<B: Into<Bytes>>(body: B) -> Body {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn empty() -> Body {
    full(Bytes::new())
}

pub(crate) fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(body))
        .expect("static response must be valid")
}

pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) engine: Engine,
    /// Every declared header name, pre-parsed. Declared headers are removed
    /// from forwarded requests and re-attached only as the scope dictates.
    pub(crate) declared: Vec<HeaderName>,
    pub(crate) client: Client<HttpConnector, Incoming>,
    pub(crate) metrics: Metrics,
    pub(crate) limiter: Option<RateLimiter>,
    pub(crate) target_host: String,
    pub(crate) read_timeout: Duration,
    pub(crate) read_header_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) target_dial_timeout: Duration,
}

impl Server {
    pub(crate) fn new(listener: TcpListener, config: Config, metrics: Metrics) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(config.target_dial_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(32)
            .http1_title_case_headers(true)
            .build(connector);

        let limiter = config
            .rate_limit
            .map(|limit| RateLimiter::new(limit.requests_per_second, limit.burst));

        let engine = Engine::new(config.rules);
        let mut declared: Vec<HeaderName> = Vec::new();
        for rule in engine.rules() {
            if let Ok(name) = HeaderName::try_from(rule.name()) {
                if !declared.contains(&name) {
                    declared.push(name);
                }
            }
        }

        let shared = Arc::new(Shared {
            engine,
            declared,
            client,
            metrics,
            limiter,
            target_host: config.target_host,
            read_timeout: config.read_timeout,
            read_header_timeout: config.read_header_timeout,
            write_timeout: config.write_timeout,
            idle_timeout: config.idle_timeout,
            target_dial_timeout: config.target_dial_timeout,
        });

        Self { listener, shared }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener
            .local_addr()
            .expect("bound listener has a local address")
    }

    /// Accepts connections until the drain watch fires, then stops
    /// accepting; each connection task finishes its in-flight requests.
    pub async fn run(self, drain: drain::Watch) {
        let Self { listener, shared } = self;
        info!(addr = %self_addr(&listener), "proxy listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = shared.clone();
                        let watch = drain.clone();
                        tokio::spawn(
                            serve_connection(shared, stream, watch)
                                .instrument(info_span!("conn", %peer)),
                        );
                    }
                    Err(error) => warn!(%error, "failed to accept connection"),
                },
                _shutdown = drain.clone().signaled() => {
                    debug!("proxy listener draining");
                    break;
                }
            }
        }
    }
}

fn self_addr(listener: &TcpListener) -> SocketAddr {
    listener
        .local_addr()
        .expect("bound listener has a local address")
}

async fn serve_connection(shared: Arc<Shared>, stream: TcpStream, watch: drain::Watch) {
    let _guard = shared.metrics.connection();
    // TimeoutIo holds its deadline timers, so pin it on the heap to hand
    // hyper an Unpin stream.
    let io = TokioIo::new(Box::pin(TimeoutIo::new(
        stream,
        shared.idle_timeout,
        shared.write_timeout,
    )));

    let service = service_fn({
        let shared = shared.clone();
        move |req: Request<Incoming>| {
            let shared = shared.clone();
            async move {
                let rsp = AssertUnwindSafe(handle(shared, req))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                    });
                Ok::<_, Infallible>(rsp)
            }
        }
    });

    let mut builder = hyper::server::conn::http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(shared.read_header_timeout)
        .title_case_headers(true);

    let conn = builder.serve_connection(io, service).with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(error) = result {
                debug!(%error, "connection closed");
            }
        }
        release = watch.signaled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(error) = release.release_after(conn).await {
                debug!(%error, "connection closed during drain");
            }
        }
    }
}

async fn handle(shared: Arc<Shared>, mut req: Request<Incoming>) -> Response<Body> {
    let start = Instant::now();
    let method = req.method().clone();

    if let Some(limiter) = &shared.limiter {
        if !limiter.allow() {
            shared.metrics.record_rate_limited();
            let rsp = text_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
            shared
                .metrics
                .record_request(&method, rsp.status(), start.elapsed());
            return rsp;
        }
    }

    if method == Method::CONNECT {
        let rsp = outbound::tunnel(&shared, req).await;
        shared
            .metrics
            .record_request(&method, rsp.status(), start.elapsed());
        return rsp;
    }

    let forward_proxy = req.uri().scheme().is_some();

    // Probes from the kubelet land on the proxy port; answer them here
    // rather than forwarding them into the application.
    if !forward_proxy && method == Method::GET {
        match req.uri().path() {
            "/healthz" => return crate::admin::healthz_response(),
            "/ready" => return crate::admin::ready_response(&shared.target_host).await,
            _ => {}
        }
    }

    let resolution = shared
        .engine
        .resolve(req.uri().path(), method.as_str(), req.headers());
    shared.metrics.record_propagated(resolution.scope.len());
    req.extensions_mut()
        .insert(RequestScope::new(resolution.scope));
    req.extensions_mut()
        .insert(Generated(Arc::new(resolution.generated)));

    let rsp = if forward_proxy {
        outbound::proxy(&shared, req).await
    } else {
        inbound::proxy(&shared, req).await
    };
    shared
        .metrics
        .record_request(&method, rsp.status(), start.elapsed());
    rsp
}

/// Sends a proxied request on the pooled client, bounded by the read
/// timeout, and maps failures onto 502.
pub(crate) async fn send_upstream(
    shared: &Shared,
    req: Request<Incoming>,
    target: &'static str,
) -> Response<Body> {
    match tokio::time::timeout(shared.read_timeout, shared.client.request(req)).await {
        Ok(Ok(rsp)) => {
            let (mut parts, body) = rsp.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            Response::from_parts(parts, body.boxed())
        }
        Ok(Err(error)) => {
            debug!(%error, target, "upstream request failed");
            shared.metrics.record_upstream_error(if error.is_connect() {
                "dial"
            } else {
                "exchange"
            });
            text_response(
                StatusCode::BAD_GATEWAY,
                format!("upstream {target} unreachable\n"),
            )
        }
        Err(_) => {
            debug!(target, "upstream request timed out");
            shared.metrics.record_upstream_error("timeout");
            text_response(
                StatusCode::BAD_GATEWAY,
                format!("upstream {target} timed out\n"),
            )
        }
    }
}

/// Removes hop-by-hop headers per RFC 7230 §6.1: everything named by
/// `Connection`, then the fixed set.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    for name in [
        header::CONNECTION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

/// Removes every declared header from a forwarded request. The request's
/// scope decides which of them reappear, so a declared header whose rule
/// did not match this request never reaches the other side.
pub(crate) fn strip_declared(headers: &mut HeaderMap, declared: &[HeaderName]) {
    for name in declared {
        headers.remove(name);
    }
}

/// Attaches header pairs to an outgoing request. Propagation is additive:
/// a header the request already carries is never overwritten.
pub(crate) fn attach_headers<'a>(
    headers: &mut HeaderMap,
    pairs: impl Iterator<Item = (&'a str, &'a str)>,
) {
    for (name, value) in pairs {
        let Ok(name) = HeaderName::try_from(name) else {
            continue;
        };
        if headers.contains_key(&name) {
            continue;
        }
        let Ok(value) = HeaderValue::try_from(value) else {
            continue;
        };
        headers.insert(name, value);
    }
}
