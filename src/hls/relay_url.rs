//! URLs that point back at this relay.
//!
//! Rewritten playlist references are built from the incoming request's scheme
//! and host rather than any configured base URL, so recursive fetches stay
//! same-origin from the player's point of view.

use axum::http::{HeaderMap, Uri, header};
use url::form_urlencoded;

/// Header set by TLS-terminating proxies in front of the relay.
pub const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Scheme, host and endpoint path of the relay as the client addressed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayBase {
    scheme: String,
    host: String,
    endpoint: String,
}

impl RelayBase {
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Derive the relay base from an incoming request.
    ///
    /// The scheme comes from the first `X-Forwarded-Proto` value when it names
    /// http or https, then from the request URI, then defaults to `http`.
    /// The host comes from the `Host` header, then from the URI authority.
    /// Returns `None` when no host can be determined.
    pub fn from_request(headers: &HeaderMap, uri: &Uri) -> Option<Self> {
        let forwarded = headers
            .get(FORWARDED_PROTO)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| v == "http" || v == "https");

        let scheme = forwarded
            .or_else(|| uri.scheme_str().map(str::to_ascii_lowercase))
            .unwrap_or_else(|| "http".to_string());

        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))?;

        Some(Self::new(scheme, host, uri.path()))
    }

    /// `scheme://host/endpoint` without a query string.
    pub fn endpoint_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.endpoint)
    }

    /// Relay URL carrying `target` as its percent-encoded `url` parameter.
    pub fn relay_url(&self, target: &str) -> String {
        let encoded: String = form_urlencoded::byte_serialize(target.as_bytes()).collect();
        format!("{}?url={}", self.endpoint_url(), encoded)
    }

    /// Whether `reference` already routes through this relay endpoint.
    pub fn is_relay_url(&self, reference: &str) -> bool {
        reference
            .strip_prefix(&self.endpoint_url())
            .is_some_and(|rest| rest.starts_with('?'))
    }
}
