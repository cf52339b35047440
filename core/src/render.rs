//! Render keys, ETags and the rendering collaborator.
//!
//! A render key folds in every input that affects the rendered artifact:
//! the club, the night, the scale, a version token for the renderer itself
//! and a fingerprint of the externally mutable state the image depends on
//! (table statuses, typically). The cache performs no invalidation on
//! external change — a changed fingerprint yields a *different key*, never
//! a stale hit under the old one.
//!
//! The ETag is derived from the key, not from payload bytes: since the key
//! already encodes all inputs, two requests with identical logical inputs
//! agree on the ETag without rendering anything.

use crate::booking::ClubId;
use crate::error::CoreError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;

/// Logical coordinates of one rendered hall image.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderKey {
    /// Club whose hall is rendered.
    pub club_id: ClubId,
    /// Night the rendering is for.
    pub night_start: DateTime<Utc>,
    /// Output scale factor.
    pub scale: f64,
    /// Version token of the renderer / base image; bump to invalidate.
    pub base_version: String,
    /// Fingerprint of the mutable state the image depends on.
    pub state_fingerprint: String,
}

impl RenderKey {
    /// Deterministic, order-sensitive canonical form of the key.
    ///
    /// Every component participates; the separator never occurs inside the
    /// timestamp or scale fields, and version/fingerprint are hashed as-is.
    #[must_use]
    pub fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.club_id,
            self.night_start.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.scale,
            self.base_version,
            self.state_fingerprint,
        )
    }

    /// Strong ETag for this key: quoted base64url SHA-256 of the canonical
    /// form.
    #[must_use]
    pub fn etag(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        format!("\"{}\"", URL_SAFE_NO_PAD.encode(digest))
    }
}

/// Tolerant conditional-tag comparison.
///
/// Accepts a weak-prefix marker (`W/`) on either side, strips double
/// quotes, honors the `*` match-all token and a comma-separated list of
/// candidates, as clients send in `If-None-Match`.
#[must_use]
pub fn etag_matches(client_tag: &str, etag: &str) -> bool {
    let target = normalize_tag(etag);
    client_tag.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || normalize_tag(candidate) == target
    })
}

fn normalize_tag(tag: &str) -> &str {
    let tag = tag.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    tag.trim_matches('"')
}

/// Rendering collaborator: composes the actual image bytes.
///
/// Assumed potentially slow (network round-trips, image composition) and
/// safe to call concurrently for different keys. The cache guarantees at
/// most one concurrent invocation per key.
///
/// Uses explicit boxed futures for trait-object compatibility
/// (`Arc<dyn HallRenderer>`).
pub trait HallRenderer: Send + Sync {
    /// Produce the artifact for `key`.
    ///
    /// # Errors
    ///
    /// Implementations report failures as `Internal`; the cache stores
    /// nothing on failure.
    fn render(
        &self,
        key: &RenderKey,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, CoreError>> + Send + '_>>;
}
