//! The reverse-proxy role: origin-form requests forwarded to the
//! co-located application.

use super::{
    attach_headers, send_upstream, strip_declared, strip_hop_by_hop, text_response, Body,
    Generated, Shared,
};
use crate::scope::RequestScope;
use http::{Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use tracing::debug;

/// Forwards one origin-form request to the application, preserving the
/// method, target path, query, and undeclared headers. Declared headers
/// reappear only as this request's scope dictates. Bodies stream through
/// unbuffered in both directions.
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

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = match format!("http://{}{}", shared.target_host, path_and_query).parse::<Uri>() {
        Ok(uri) => uri,
        Err(error) => {
            debug!(%error, "request target does not form a valid upstream URI");
            return text_response(StatusCode::BAD_REQUEST, "invalid request target\n");
        }
    };
    parts.uri = uri;

    strip_hop_by_hop(&mut parts.headers);
    strip_declared(&mut parts.headers, &shared.declared);
    attach_headers(&mut parts.headers, scope.iter());
    attach_headers(&mut parts.headers, generated.iter());

    send_upstream(shared, Request::from_parts(parts, body), "application").await
}
