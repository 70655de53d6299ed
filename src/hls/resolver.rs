//! Resolution of playlist references against the playlist's own location.

use url::{ParseError, Url};

/// Returns `true` when `reference` already carries an `http`/`https` scheme.
pub fn is_absolute(reference: &str) -> bool {
    let lower = reference.get(..8).unwrap_or(reference).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Resolve `reference` against `base`, the URL of the playlist it appeared in.
///
/// Absolute references are parsed on their own, ignoring the base; the parsed
/// form is normalised, so callers that must keep the reference as written
/// check [`is_absolute`] and use the original text. Relative ones are resolved per
/// RFC 3986 against the base's directory (everything up to and including the
/// last `/` of its path), so `../` and root-relative paths behave as a browser
/// would resolve them.
pub fn resolve(base: &Url, reference: &str) -> Result<Url, ParseError> {
    if is_absolute(reference) {
        Url::parse(reference)
    } else {
        base.join(reference)
    }
}
