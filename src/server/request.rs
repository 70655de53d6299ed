//! Validation of incoming relay requests.

use crate::error::{RelayError, Result};
use crate::server::url_validation::validate_target_url;
use crate::upstream::forward_request_headers;
use axum::http::HeaderMap;
use url::Url;

/// Name of the query parameter carrying the upstream target.
pub const TARGET_PARAM: &str = "url";

/// A validated request to relay one asset from an upstream origin.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    /// Target URL as supplied by the client (after scheme normalization)
    pub url: Url,
    /// Every other query parameter, in order, forwarded to the origin
    pub query: Vec<(String, String)>,
    /// Whitelisted client headers forwarded to the origin
    pub headers: HeaderMap,
}

impl RelayRequest {
    /// Build a relay request from the decoded query string and client headers.
    ///
    /// # Errors
    ///
    /// [`RelayError::MissingUrl`] when no non-empty `url` parameter is
    /// present, [`RelayError::InvalidUrl`] when it does not parse, and
    /// [`RelayError::InvalidOrigin`] when it fails origin validation.
    pub fn from_parts(
        params: Vec<(String, String)>,
        incoming: &HeaderMap,
        block_private_origins: bool,
    ) -> Result<Self> {
        let mut target = None;
        let mut query = Vec::with_capacity(params.len());
        for (key, value) in params {
            if key == TARGET_PARAM && target.is_none() {
                target = Some(value);
            } else if key != TARGET_PARAM {
                query.push((key, value));
            }
        }

        let raw = target
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(RelayError::MissingUrl)?;

        let normalized = normalize_scheme(&raw);
        let url = Url::parse(&normalized)
            .map_err(|e| RelayError::InvalidUrl(format!("{raw}: {e}")))?;
        validate_target_url(&url, block_private_origins)?;

        Ok(Self {
            url,
            query,
            headers: forward_request_headers(incoming),
        })
    }

    /// Target URL with the forwarded query parameters appended.
    pub fn upstream_url(&self) -> Url {
        let mut url = self.url.clone();
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                pairs.append_pair(key, value);
            }
        }
        url
    }
}

/// Prefix `http://` when the target carries no scheme at all.
fn normalize_scheme(raw: &str) -> String {
    if has_scheme(raw) {
        raw.to_string()
    } else {
        format!("http://{raw}")
    }
}

/// Whether `raw` opens with `scheme://`. A `://` later on, such as inside a
/// query value, does not count.
fn has_scheme(raw: &str) -> bool {
    raw.split_once("://").is_some_and(|(scheme, _)| {
        let mut chars = scheme.chars();
        chars.next().is_some_and(|c| c.is_ascii_alphabetic())
            && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    })
}
