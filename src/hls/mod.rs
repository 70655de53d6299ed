//! HLS-aware pieces of the relay: reference resolution, content
//! classification, playlist rewriting and relay URL construction.

pub mod classifier;
pub mod playlist;
pub mod relay_url;
pub mod resolver;

pub use classifier::{ContentKind, classify, looks_like_playlist};
pub use playlist::{PlaylistDocument, PlaylistLine, rewrite};
pub use relay_url::RelayBase;
