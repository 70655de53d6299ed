use crate::{
    error::Result,
    metrics,
    server::{request::RelayRequest, response, state::AppState},
};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, header},
    response::Response,
};
use std::time::Instant;
use tracing::info;

/// Buffered pass-through for API calls and on-demand assets.
///
/// Forwards the origin status and `Content-Type` only, and never rewrites
/// playlists.
pub async fn serve_proxy(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();
    let result = proxy(&state, params, &headers).await;

    let status = match &result {
        Ok(resp) => resp.status(),
        Err(e) => {
            if e.is_upstream() {
                metrics::record_upstream_error("proxy");
            }
            e.status()
        }
    };
    metrics::record_request("proxy", status.as_u16());
    metrics::record_duration("proxy", start);

    result
}

async fn proxy(
    state: &AppState,
    params: Vec<(String, String)>,
    headers: &HeaderMap,
) -> Result<Response> {
    let request = RelayRequest::from_parts(params, headers, state.config.block_private_origins)?;

    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();

    let upstream = state.upstream.fetch(&request, &cancel).await?;
    let status = upstream.status;

    let mut forwarded = HeaderMap::new();
    if let Some(content_type) = upstream.headers.get(header::CONTENT_TYPE) {
        forwarded.insert(header::CONTENT_TYPE, content_type.clone());
    }

    let body = upstream
        .buffer(state.config.max_proxy_body_bytes, &cancel)
        .await?;

    info!(
        "Proxied {} ({} bytes, origin status {})",
        request.url,
        body.len(),
        status
    );

    Ok(response::buffered(status, forwarded, body))
}
