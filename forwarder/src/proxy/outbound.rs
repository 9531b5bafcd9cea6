//! The forward-proxy role: the application's own outbound traffic.
//!
//! Plain-HTTP requests arrive in absolute form and are relayed with the
//! request's scope attached. HTTPS arrives as CONNECT and is spliced
//! byte-for-byte; nothing is injected into an encrypted stream.

use super::{
    attach_headers, empty, send_upstream, strip_declared, strip_hop_by_hop, text_response, Body,
    Generated, Shared,
};
use crate::scope::RequestScope;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

/// Relays one absolute-form request to its target.
pub(crate) async fn proxy(shared: &Shared, req: Request<Incoming>) -> Response<Body> {
    let scope = req
        .extensions()
        .get::<RequestScope>()
        .cloned()
        .unwrap_or_default();
    let generated = req
        .extensions()
        .get::<Generated>()
        .cloned()
        .unwrap_or_default();
    let (mut parts, body) = req.into_parts();

    if parts.uri.scheme_str() != Some("http") {
        return text_response(
            StatusCode::BAD_REQUEST,
            "only http targets are proxied; use CONNECT for TLS\n",
        );
    }

    strip_hop_by_hop(&mut parts.headers);
    strip_declared(&mut parts.headers, &shared.declared);
    attach_headers(&mut parts.headers, scope.iter());
    attach_headers(&mut parts.headers, generated.iter());

    send_upstream(shared, Request::from_parts(parts, body), "target").await
}

/// Establishes a CONNECT tunnel: dial the requested authority, answer 200,
/// then splice raw bytes until either side closes. No header inspection or
/// injection happens on this path.
pub(crate) async fn tunnel(shared: &Shared, req: Request<Incoming>) -> Response<Body> {
    let authority = match req.uri().authority() {
        Some(authority) if authority.port().is_some() => authority.clone(),
        _ => {
            return text_response(
                StatusCode::BAD_REQUEST,
                "CONNECT target must be host:port\n",
            )
        }
    };

    let dial = TcpStream::connect(authority.as_str());
    let mut upstream = match tokio::time::timeout(shared.target_dial_timeout, dial).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            debug!(%error, %authority, "tunnel dial failed");
            shared.metrics.record_upstream_error("dial");
            return text_response(StatusCode::BAD_GATEWAY, "tunnel dial failed\n");
        }
        Err(_) => {
            debug!(%authority, "tunnel dial timed out");
            shared.metrics.record_upstream_error("timeout");
            return text_response(StatusCode::BAD_GATEWAY, "tunnel dial timed out\n");
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((to_target, to_client)) => {
                        debug!(to_target, to_client, %authority, "tunnel closed");
                    }
                    Err(error) => debug!(%error, %authority, "tunnel errored"),
                }
            }
            Err(error) => debug!(%error, "connection upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(empty())
        .expect("static response must be valid")
}
