use crate::{
    error::{RelayError, Result},
    hls::{ContentKind, RelayBase, classify, looks_like_playlist, playlist},
    metrics,
    server::{request::RelayRequest, response, state::AppState},
};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, Uri},
    response::Response,
};
use std::time::Instant;
use tracing::{info, warn};

/// Relay live content, rewriting HLS playlists so that every variant playlist
/// and segment they reference is also fetched through this endpoint.
///
/// Playlists (2xx, body opening with `#EXTM3U`, valid UTF-8) are buffered and
/// rewritten; everything else, including error responses and segments served
/// under a playlist name, is streamed back unmodified with the origin status.
pub async fn serve_stream(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response> {
    let start = Instant::now();
    let result = relay_live(&state, params, &headers, &uri).await;

    let status = match &result {
        Ok(resp) => resp.status(),
        Err(e) => {
            if e.is_upstream() {
                metrics::record_upstream_error("stream");
            }
            e.status()
        }
    };
    metrics::record_request("stream", status.as_u16());
    metrics::record_duration("stream", start);

    result
}

async fn relay_live(
    state: &AppState,
    params: Vec<(String, String)>,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<Response> {
    let request = RelayRequest::from_parts(params, headers, state.config.block_private_origins)?;
    let relay_base = RelayBase::from_request(headers, uri).ok_or(RelayError::MissingHost)?;

    // Dropping this handler (client gone) cancels any in-flight fetch
    let cancel = state.shutdown.child_token();
    let guard = cancel.clone().drop_guard();

    let mut upstream = state.upstream.fetch(&request, &cancel).await?;
    let kind = classify(upstream.content_type(), &upstream.requested_url);

    info!(
        "Relaying {} as {:?} (origin status {})",
        upstream.requested_url, kind, upstream.status
    );

    // Segments served under a playlist name or MIME type are streamed raw, so
    // the size cap only applies to bodies that start like a playlist
    let rewrite = if kind == ContentKind::Playlist && upstream.status.is_success() {
        let text = looks_like_playlist(upstream.peek(&cancel).await?);
        if !text {
            info!(
                "Body from {} is not playlist text, streaming it raw",
                upstream.requested_url
            );
        }
        text
    } else {
        false
    };

    if rewrite {
        let status = upstream.status;
        let forwarded = response::forward_response_headers(&upstream.headers);
        let base = upstream.final_url().clone();
        let body = upstream
            .buffer(state.config.max_playlist_bytes, &cancel)
            .await?;

        let body = match String::from_utf8(body) {
            Ok(text) => {
                metrics::record_playlist_rewritten();
                playlist::rewrite(&text, &base, &relay_base).into_bytes()
            }
            Err(e) => {
                warn!(
                    "Body from {} looked like a playlist but is not UTF-8, relaying raw bytes",
                    base
                );
                e.into_bytes()
            }
        };

        return Ok(response::buffered(status, forwarded, body));
    }

    // From here the body stream owns cancellation
    let response = response::streamed(upstream, cancel);
    guard.disarm();
    Ok(response)
}
