//! Idempotency-key primitives.
//!
//! Keys are caller-supplied and never generated server-side: a key minted
//! by the server would change on every retry and defeat deduplication.
//! Each mutating operation deduplicates in its own [`Namespace`], so the
//! same token may be reused across `hold` and `confirm` without clashing.

use crate::error::CoreError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum accepted key length, from the original wire grammar.
const MAX_KEY_LEN: usize = 128;

/// Deduplication namespace, one per mutating operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Table hold requests.
    Hold,
    /// Hold confirmations.
    Confirm,
    /// Cancellations.
    Cancel,
    /// Seat-by-scan at the door.
    Seat,
}

impl Namespace {
    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hold => "hold",
            Self::Confirm => "confirm",
            Self::Cancel => "cancel",
            Self::Seat => "seat",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated caller-supplied idempotency token.
///
/// Accepted grammar: 1..=128 characters from `[A-Za-z0-9._~:-]`. The value
/// is otherwise opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Validate and wrap a raw token.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty, oversized or ill-charactered token.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CoreError::Validation("missing idempotency key".into()));
        }
        if raw.len() > MAX_KEY_LEN {
            return Err(CoreError::Validation("idempotency key too long".into()));
        }
        let valid = raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'~' | b':' | b'-'));
        if !valid {
            return Err(CoreError::Validation(
                "idempotency key has invalid characters".into(),
            ));
        }
        Ok(Self(raw.to_owned()))
    }

    /// Validate an optional header value; absence is a caller error.
    ///
    /// # Errors
    ///
    /// `Validation` when the header is missing or malformed.
    pub fn from_header(raw: Option<&str>) -> Result<Self, CoreError> {
        match raw {
            Some(value) => Self::parse(value),
            None => Err(CoreError::Validation("missing idempotency key".into())),
        }
    }

    /// The validated token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest of the request payload a key was first used with.
///
/// A key replayed with a different payload is a `Conflict`, not a silent
/// replay of someone else's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// SHA-256 over the canonical JSON encoding of `payload`, base64url
    /// without padding.
    ///
    /// # Errors
    ///
    /// `Internal` when the payload cannot be serialized.
    pub fn of<T: Serialize>(payload: &T) -> Result<Self, CoreError> {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| CoreError::Internal(format!("fingerprint encoding failed: {e}")))?;
        let digest = Sha256::digest(&bytes);
        Ok(Self(URL_SAFE_NO_PAD.encode(digest)))
    }

    /// The encoded digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
