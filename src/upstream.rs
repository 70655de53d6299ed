//! HTTP fetches against the upstream origin.
//!
//! Every relay request maps to exactly one upstream GET. Origin status codes
//! are never turned into errors here; only transport failures (DNS, connect,
//! timeout) are, and they are not retried. The player owns retry policy.

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::server::request::RelayRequest;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode, header};
use futures_util::{Stream, StreamExt, stream};
use reqwest::{Client, Response};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Browser identification sent to every origin. Some IPTV origins refuse
/// requests from non-browser user agents.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Incoming request headers copied onto the upstream request.
pub const FORWARDED_REQUEST_HEADERS: &[&str] = &["range", "if-range"];

/// Keep only the whitelisted request headers from the client.
pub fn forward_request_headers(incoming: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for name in FORWARDED_REQUEST_HEADERS {
        if let Some(value) = incoming.get(*name) {
            forwarded.insert(*name, value.clone());
        }
    }
    forwarded
}

/// Shared upstream client with a bound on concurrent fetches.
#[derive(Clone, Debug)]
pub struct Upstream {
    client: Client,
    permits: Arc<Semaphore>,
    request_timeout: Duration,
}

impl Upstream {
    /// Build the pooled client from configuration.
    pub fn new(config: &Config) -> std::result::Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &Config) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(config.max_upstream_connections)),
            request_timeout: config.request_timeout,
        }
    }

    /// Number of fetches that could start right now without waiting.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Issue the GET for `request`.
    ///
    /// Waiting for a connection permit and waiting for response headers both
    /// race `cancel`; whichever loses is dropped, which aborts the upstream
    /// connection. Response headers must arrive within the request timeout.
    /// The body itself has no deadline here, since a long segment or a slow
    /// client is not a failure; [`UpstreamResponse::buffer`] applies its own.
    ///
    /// # Errors
    ///
    /// [`RelayError::Cancelled`] when `cancel` fires first,
    /// [`RelayError::Timeout`] when headers do not arrive in time, and
    /// [`RelayError::Upstream`] for transport failures. Non-2xx statuses are
    /// returned as ordinary responses.
    pub async fn fetch(
        &self,
        request: &RelayRequest,
        cancel: &CancellationToken,
    ) -> Result<UpstreamResponse> {
        let url = request.upstream_url();

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| RelayError::Cancelled)?
            }
        };

        let send = self
            .client
            .get(url.clone())
            .headers(request.headers.clone())
            .header(header::USER_AGENT, BROWSER_USER_AGENT)
            .send();

        debug!("Fetching upstream {}", url);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            result = tokio::time::timeout(self.request_timeout, send) => match result {
                Ok(Ok(response)) => response,
                Ok(Err(source)) => {
                    warn!("Upstream fetch failed for {}: {}", url, source);
                    return Err(RelayError::Upstream {
                        url: url.to_string(),
                        source,
                    });
                }
                Err(_) => {
                    warn!("Upstream fetch timed out for {}", url);
                    return Err(RelayError::Timeout {
                        url: url.to_string(),
                    });
                }
            },
        };

        Ok(UpstreamResponse {
            status: response.status(),
            headers: response.headers().clone(),
            requested_url: url,
            read_timeout: self.request_timeout,
            response,
            head: None,
            permit,
        })
    }
}

/// Status, headers and the still-unread body of an upstream response.
///
/// Holds its connection permit until the body is consumed or dropped.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// URL the relay asked for (before redirects)
    pub requested_url: Url,
    read_timeout: Duration,
    response: Response,
    /// First body chunk, once [`UpstreamResponse::peek`] has read it
    head: Option<Bytes>,
    permit: OwnedSemaphorePermit,
}

impl UpstreamResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    /// URL the body was actually served from, after redirects. Relative
    /// playlist references resolve against this.
    pub fn final_url(&self) -> &Url {
        self.response.url()
    }

    /// Read the first body chunk without consuming it.
    ///
    /// The chunk is replayed at the front of [`buffer`](Self::buffer) and
    /// [`into_body_stream`](Self::into_body_stream). An empty slice means the
    /// body is empty.
    pub async fn peek(&mut self, cancel: &CancellationToken) -> Result<&[u8]> {
        if self.head.is_none() {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = tokio::time::timeout(self.read_timeout, self.response.chunk()) => Some(result),
            };

            let chunk = match read {
                None => return Err(RelayError::Cancelled),
                Some(Ok(Ok(chunk))) => chunk.unwrap_or_default(),
                Some(Ok(Err(source))) => {
                    warn!("Upstream body from {} failed: {}", self.requested_url, source);
                    return Err(RelayError::Upstream {
                        url: self.requested_url.to_string(),
                        source,
                    });
                }
                Some(Err(_)) => {
                    warn!("Upstream body from {} timed out", self.requested_url);
                    return Err(RelayError::Timeout {
                        url: self.requested_url.to_string(),
                    });
                }
            };
            self.head = Some(chunk);
        }

        Ok(self.head.as_deref().unwrap_or_default())
    }

    /// Read the whole body into memory, failing once it exceeds `limit` bytes
    /// or takes longer than the request timeout.
    pub async fn buffer(self, limit: usize, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let UpstreamResponse {
            requested_url,
            read_timeout,
            mut response,
            head,
            permit,
            ..
        } = self;

        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(body_too_large(&requested_url, limit));
        }

        let body = head.map(|chunk| chunk.to_vec()).unwrap_or_default();
        if body.len() > limit {
            return Err(body_too_large(&requested_url, limit));
        }

        let read = async {
            let mut body = body;
            while let Some(chunk) = response.chunk().await.map_err(|source| {
                warn!("Upstream body from {} failed: {}", requested_url, source);
                RelayError::Upstream {
                    url: requested_url.to_string(),
                    source,
                }
            })? {
                if body.len() + chunk.len() > limit {
                    return Err(body_too_large(&requested_url, limit));
                }
                body.extend_from_slice(&chunk);
            }
            Ok::<_, RelayError>(body)
        };

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            result = tokio::time::timeout(read_timeout, read) => result.map_err(|_| {
                warn!("Upstream body from {} timed out", requested_url);
                RelayError::Timeout {
                    url: requested_url.to_string(),
                }
            })??,
        };

        drop(permit);
        Ok(body)
    }

    /// Convert into a byte stream for the client response body.
    ///
    /// The stream ends early when `cancel` fires, and cancels `cancel` when it
    /// is dropped (hyper drops the body when the client disconnects). A
    /// mid-stream upstream error becomes a stream error, which makes hyper
    /// abort the connection instead of writing a second response.
    pub fn into_body_stream(
        self,
        cancel: CancellationToken,
    ) -> impl Stream<Item = std::result::Result<Bytes, io::Error>> + Send + 'static {
        let UpstreamResponse {
            requested_url,
            response,
            head,
            permit,
            ..
        } = self;
        let guard = cancel.clone().drop_guard();

        let head = head
            .filter(|chunk| !chunk.is_empty())
            .map(Ok::<Bytes, reqwest::Error>);

        stream::iter(head)
            .chain(response.bytes_stream())
            .take_until(cancel.cancelled_owned())
            .map(move |chunk| {
                // The permit and the guard live exactly as long as the body.
                let _held = (&permit, &guard);
                chunk.map_err(|e| {
                    warn!("Upstream stream from {} failed mid-body: {}", requested_url, e);
                    io::Error::other(e)
                })
            })
    }
}

fn body_too_large(url: &Url, limit: usize) -> RelayError {
    warn!(
        "Upstream body from {} exceeds {} bytes, refusing to buffer",
        url, limit
    );
    RelayError::BodyTooLarge {
        url: url.to_string(),
        limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use wiremock::matchers::{header as header_matcher, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> Config {
        Config {
            max_upstream_connections: 2,
            ..Config::default()
        }
    }

    fn request(url: &str) -> RelayRequest {
        RelayRequest {
            url: Url::parse(url).unwrap(),
            query: Vec::new(),
            headers: HeaderMap::new(),
        }
    }

    #[test]
    fn only_range_headers_are_forwarded() {
        let mut incoming = HeaderMap::new();
        incoming.insert(header::RANGE, HeaderValue::from_static("bytes=0-99"));
        incoming.insert(header::COOKIE, HeaderValue::from_static("session=1"));
        incoming.insert(header::USER_AGENT, HeaderValue::from_static("curl/8"));

        let forwarded = forward_request_headers(&incoming);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded.get(header::RANGE).unwrap(), "bytes=0-99");
    }

    #[tokio::test]
    async fn sends_browser_user_agent_and_range() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/seg.ts"))
            .and(header_matcher("user-agent", BROWSER_USER_AGENT))
            .and(header_matcher("range", "bytes=10-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![1u8, 2, 3]))
            .expect(1)
            .mount(&server)
            .await;

        let upstream = Upstream::new(&config()).unwrap();
        let mut req = request(&format!("{}/seg.ts", server.uri()));
        req.headers
            .insert(header::RANGE, HeaderValue::from_static("bytes=10-"));

        let resp = upstream
            .fetch(&req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);

        let body = resp.buffer(1024, &CancellationToken::new()).await.unwrap();
        assert_eq!(body, vec![1u8, 2, 3]);
    }

    #[tokio::test]
    async fn forwards_extra_query_params() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/player_api.php"))
            .and(query_param("username", "alice"))
            .and(query_param("action", "get_live_streams"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&server)
            .await;

        let upstream = Upstream::new(&config()).unwrap();
        let mut req = request(&format!("{}/player_api.php", server.uri()));
        req.query = vec![
            ("username".into(), "alice".into()),
            ("action".into(), "get_live_streams".into()),
        ];

        let resp = upstream
            .fetch(&req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn error_statuses_are_not_errors() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .expect(1)
            .mount(&server)
            .await;

        let upstream = Upstream::new(&config()).unwrap();
        let resp = upstream
            .fetch(
                &request(&server.uri()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_network() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let upstream = Upstream::new(&config()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = upstream
            .fetch(&request(&server.uri()), &cancel)
            .await;
        assert!(matches!(result, Err(RelayError::Cancelled)));
    }

    #[tokio::test]
    async fn connection_refused_is_upstream_error() {
        // Bind then drop a listener to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = Upstream::new(&config()).unwrap();
        let result = upstream
            .fetch(
                &request(&format!("http://{}/live.m3u8", addr)),
                &CancellationToken::new(),
            )
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RelayError::Upstream { .. }));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn slow_origin_times_out() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let upstream = Upstream::new(&Config {
            request_timeout: Duration::from_millis(100),
            ..config()
        })
        .unwrap();

        let result = upstream
            .fetch(&request(&server.uri()), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RelayError::Timeout { .. })));
        // The permit is released with the abandoned request
        assert_eq!(upstream.available_permits(), 2);
    }

    #[tokio::test]
    async fn buffer_enforces_limit() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(64)))
            .mount(&server)
            .await;

        let upstream = Upstream::new(&config()).unwrap();
        let resp = upstream
            .fetch(
                &request(&server.uri()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let result = resp.buffer(16, &CancellationToken::new()).await;
        assert!(matches!(result, Err(RelayError::BodyTooLarge { limit: 16, .. })));
    }

    #[tokio::test]
    async fn peeked_chunk_replayed_by_buffer() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#EXTM3U\nchunk1.ts\n"))
            .mount(&server)
            .await;

        let upstream = Upstream::new(&config()).unwrap();
        let cancel = CancellationToken::new();
        let mut resp = upstream
            .fetch(&request(&server.uri()), &cancel)
            .await
            .unwrap();

        let head = resp.peek(&cancel).await.unwrap().to_vec();
        assert!(head.starts_with(b"#EXTM3U"));
        // A second peek returns the same chunk without reading further
        assert_eq!(resp.peek(&cancel).await.unwrap(), head.as_slice());

        let body = resp.buffer(1024, &cancel).await.unwrap();
        assert_eq!(body, b"#EXTM3U\nchunk1.ts\n");
    }

    #[tokio::test]
    async fn peeked_chunk_replayed_by_stream() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x47u8; 4096]))
            .mount(&server)
            .await;

        let upstream = Upstream::new(&config()).unwrap();
        let cancel = CancellationToken::new();
        let mut resp = upstream
            .fetch(&request(&server.uri()), &cancel)
            .await
            .unwrap();
        assert!(!resp.peek(&cancel).await.unwrap().is_empty());

        let chunks: Vec<_> = resp.into_body_stream(cancel).collect().await;
        let body: Vec<u8> = chunks
            .into_iter()
            .flat_map(|c| c.unwrap().to_vec())
            .collect();
        assert_eq!(body, vec![0x47u8; 4096]);
    }

    #[tokio::test]
    async fn peek_of_empty_body_is_empty() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let upstream = Upstream::new(&config()).unwrap();
        let cancel = CancellationToken::new();
        let mut resp = upstream
            .fetch(&request(&server.uri()), &cancel)
            .await
            .unwrap();

        assert!(resp.peek(&cancel).await.unwrap().is_empty());
        assert!(resp.buffer(16, &cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn permit_held_until_body_consumed() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("segment"))
            .mount(&server)
            .await;

        let upstream = Upstream::new(&config()).unwrap();
        assert_eq!(upstream.available_permits(), 2);

        let resp = upstream
            .fetch(
                &request(&server.uri()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(upstream.available_permits(), 1);

        let stream = resp.into_body_stream(CancellationToken::new());
        let chunks: Vec<_> = stream.collect().await;
        assert!(chunks.iter().all(|c| c.is_ok()));
        drop(chunks);
        assert_eq!(upstream.available_permits(), 2);
    }

    #[tokio::test]
    async fn dropping_body_stream_cancels_token() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("segment"))
            .mount(&server)
            .await;

        let upstream = Upstream::new(&config()).unwrap();
        let cancel = CancellationToken::new();
        let resp = upstream
            .fetch(&request(&server.uri()), &cancel)
            .await
            .unwrap();

        let stream = resp.into_body_stream(cancel.clone());
        assert!(!cancel.is_cancelled());
        drop(stream);
        assert!(cancel.is_cancelled());
    }
}
