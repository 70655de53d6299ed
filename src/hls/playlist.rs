//! Line-oriented HLS playlist model and reference rewriting.
//!
//! Directive lines (`#EXT...`, comments) and blank lines are carried through
//! byte-for-byte. Only bare URI lines are rewritten into relay URLs. URIs held
//! in directive attributes (`#EXT-X-KEY:URI="..."`, `#EXT-X-MAP:URI="..."`,
//! `#EXT-X-MEDIA:URI="..."`) are left untouched, so encrypted or fMP4 streams
//! still fetch keys and init sections straight from the origin.

use super::relay_url::RelayBase;
use super::resolver;
use tracing::{debug, warn};
use url::Url;

/// One line of a playlist body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaylistLine {
    /// Empty or whitespace-only line, kept verbatim
    Blank(String),
    /// Tag or comment starting with `#`, kept verbatim
    Directive(String),
    /// URI reference (trimmed) to a variant playlist or media segment
    Reference(String),
}

impl PlaylistLine {
    /// Classify a single line (without its terminator).
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            PlaylistLine::Blank(line.to_string())
        } else if trimmed.starts_with('#') {
            PlaylistLine::Directive(line.to_string())
        } else {
            PlaylistLine::Reference(trimmed.to_string())
        }
    }
}

/// A parsed playlist together with the URL it was fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistDocument {
    base: Url,
    lines: Vec<PlaylistLine>,
}

impl PlaylistDocument {
    /// Split `body` into typed lines. `\r\n` terminators are normalised to `\n`;
    /// a trailing newline is preserved as a final empty line. A leading
    /// byte-order mark is dropped, as browsers do when decoding.
    pub fn parse(body: &str, base: Url) -> Self {
        let body = body.strip_prefix('\u{feff}').unwrap_or(body);
        let lines = body
            .split('\n')
            .map(|line| PlaylistLine::parse(line.strip_suffix('\r').unwrap_or(line)))
            .collect();
        Self { base, lines }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn lines(&self) -> &[PlaylistLine] {
        &self.lines
    }

    /// Number of `Reference` lines.
    pub fn reference_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| matches!(l, PlaylistLine::Reference(_)))
            .count()
    }

    /// Replace every reference with a relay URL and render the body.
    ///
    /// References that already point at `relay`, or that fail to resolve
    /// against the playlist base, are emitted unchanged.
    pub fn rewrite(&self, relay: &RelayBase) -> String {
        let rendered: Vec<String> = self
            .lines
            .iter()
            .map(|line| match line {
                PlaylistLine::Blank(text) | PlaylistLine::Directive(text) => text.clone(),
                PlaylistLine::Reference(uri) => self.rewrite_reference(uri, relay),
            })
            .collect();
        rendered.join("\n")
    }

    fn rewrite_reference(&self, uri: &str, relay: &RelayBase) -> String {
        if relay.is_relay_url(uri) {
            return uri.to_string();
        }

        match resolver::resolve(&self.base, uri) {
            Ok(absolute) => {
                debug!("Rewriting reference {} -> {}", uri, absolute);
                // Absolute references travel exactly as written
                if resolver::is_absolute(uri) {
                    relay.relay_url(uri)
                } else {
                    relay.relay_url(absolute.as_str())
                }
            }
            Err(e) => {
                warn!(
                    "Leaving unresolvable playlist reference {:?} (base {}): {}",
                    uri, self.base, e
                );
                uri.to_string()
            }
        }
    }
}

/// Rewrite a playlist body fetched from `base` so every reference goes
/// through `relay`.
pub fn rewrite(body: &str, base: &Url, relay: &RelayBase) -> String {
    PlaylistDocument::parse(body, base.clone()).rewrite(relay)
}
