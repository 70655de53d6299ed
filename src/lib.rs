//! HLS live-stream relay.
//!
//! Fetches media from an arbitrary upstream origin on behalf of a browser and,
//! when the content is an HLS playlist, rewrites every reference so that
//! variant playlists and segments are fetched through the relay as well.

pub mod config;
pub mod error;
pub mod hls;
pub mod metrics;
pub mod server;
pub mod upstream;
