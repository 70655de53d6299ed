use crate::{config::Config, metrics, upstream::Upstream};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Application state shared across all handlers.
///
/// Nothing in here is mutated per request; every relay request is resolved
/// independently.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Pooled upstream client with a concurrency bound
    pub upstream: Upstream,
    /// Root token cancelled on shutdown; each request takes a child token
    pub shutdown: CancellationToken,
    /// Prometheus registry rendered at `/metrics`
    pub metrics: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    /// Create a new AppState with the given configuration
    pub fn new(config: Config) -> Result<Self, reqwest::Error> {
        let upstream = Upstream::new(&config)?;

        Ok(Self {
            config: Arc::new(config),
            upstream,
            shutdown: CancellationToken::new(),
            metrics: metrics::init(),
            started_at: Instant::now(),
        })
    }
}
