//! Playlist-vs-binary classification of upstream responses.
//!
//! Origins are often misconfigured, so a response counts as a playlist when
//! either its `Content-Type` or the requested URL's extension says so. The
//! first body bytes are then checked with [`looks_like_playlist`], so a
//! segment served under a playlist name is still streamed raw.

use url::Url;

/// What the relay should do with an upstream body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// HLS manifest: buffer, decode and rewrite references
    Playlist,
    /// Media segments, keys and anything else: stream bytes unmodified
    Binary,
}

/// MIME types (lower-case, parameters stripped) that identify an HLS manifest.
const PLAYLIST_MIME_TYPES: &[&str] = &[
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "application/mpegurl",
    "audio/mpegurl",
    "audio/x-mpegurl",
];

/// Path suffixes (lower-case) that identify an HLS manifest.
const PLAYLIST_EXTENSIONS: &[&str] = &[".m3u8"];

/// Classify an upstream response from its content type and the requested URL.
pub fn classify(content_type: Option<&str>, requested: &Url) -> ContentKind {
    if content_type.is_some_and(is_playlist_mime) || has_playlist_extension(requested) {
        ContentKind::Playlist
    } else {
        ContentKind::Binary
    }
}

/// First tag of every HLS playlist.
pub const PLAYLIST_HEADER: &str = "#EXTM3U";

/// Whether `head`, the first chunk of a body, can be the start of a playlist:
/// UTF-8 text that opens with `#EXTM3U`, after an optional byte-order mark
/// and leading whitespace.
///
/// A chunk shorter than the header only has to agree with it so far, and a
/// multi-byte character cut off at the end of the chunk is not an error. An
/// empty body counts as a playlist.
pub fn looks_like_playlist(head: &[u8]) -> bool {
    let text = match std::str::from_utf8(head) {
        Ok(text) => text,
        Err(e) if e.error_len().is_none() => {
            std::str::from_utf8(&head[..e.valid_up_to()]).unwrap_or_default()
        }
        Err(_) => return false,
    };

    let text = text.strip_prefix('\u{feff}').unwrap_or(text).trim_start();
    if text.len() >= PLAYLIST_HEADER.len() {
        text.starts_with(PLAYLIST_HEADER)
    } else {
        PLAYLIST_HEADER.starts_with(text)
    }
}

fn is_playlist_mime(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    PLAYLIST_MIME_TYPES.contains(&essence.as_str())
}

fn has_playlist_extension(requested: &Url) -> bool {
    let path = requested.path().to_ascii_lowercase();
    PLAYLIST_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}
