//! Writing upstream content back to the client.
//!
//! The origin status is always forwarded verbatim. Only a fixed set of origin
//! headers survives; cookies, server identification and caching directives
//! are dropped.

use crate::upstream::UpstreamResponse;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use tokio_util::sync::CancellationToken;

/// Origin response headers copied to the client.
pub const FORWARDED_RESPONSE_HEADERS: &[&str] = &[
    "content-type",
    "accept-ranges",
    "access-control-allow-origin",
];

/// Keep only the whitelisted origin headers.
pub fn forward_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for name in FORWARDED_RESPONSE_HEADERS {
        for value in upstream.get_all(*name) {
            forwarded.append(*name, value.clone());
        }
    }
    forwarded
}

/// Pipe the upstream body to the client as it arrives.
///
/// hyper only polls the body when the client socket accepts more data, so the
/// upstream is never read faster than the client drains it.
pub fn streamed(upstream: UpstreamResponse, cancel: CancellationToken) -> Response {
    let status = upstream.status;
    let headers = forward_response_headers(&upstream.headers);
    let body = Body::from_stream(upstream.into_body_stream(cancel));

    with_parts(status, headers, body)
}

/// Send a fully materialized body with a freshly computed `Content-Length`.
pub fn buffered(status: StatusCode, mut headers: HeaderMap, body: Vec<u8>) -> Response {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    with_parts(status, headers, Body::from(body))
}

fn with_parts(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
