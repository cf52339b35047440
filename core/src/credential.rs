//! Self-authenticating seat credential presented at the door.
//!
//! Token format: `BK:<booking_id>:<club_id>:<issued_epoch_s>:<mac_hex>`,
//! where the MAC is HMAC-SHA-256 under a key derived from the service
//! secret with a fixed label. The token carries everything needed to find
//! the booking; verification is constant-time and bounded by a TTL so a
//! leaked token ages out.

use crate::booking::{BookingId, ClubId};
use crate::error::CoreError;
use chrono::{DateTime, TimeDelta, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "BK:";
const KEY_LABEL: &[u8] = b"VelvetScanCredential";
const MAC_HEX_LEN: usize = 64;

/// Why a presented token was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFault {
    /// The token does not parse as a credential at all.
    Malformed,
    /// Parsed but failed the MAC check or fell outside the validity window.
    Rejected,
}

/// Fields recovered from a verified token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Booking the credential was issued for.
    pub booking_id: BookingId,
    /// Club recorded at issue time; must match the booking on seat.
    pub club_id: ClubId,
    /// Issue instant, second precision.
    pub issued_at: DateTime<Utc>,
}

/// Issue and verify seat credentials.
pub struct ScanCredential;

impl ScanCredential {
    /// Mint a token for a confirmed booking.
    ///
    /// # Errors
    ///
    /// `Internal` when the service secret is empty (a deployment fault,
    /// not a caller error).
    pub fn issue(
        booking_id: BookingId,
        club_id: ClubId,
        issued_at: DateTime<Utc>,
        secret: &str,
    ) -> Result<String, CoreError> {
        if secret.is_empty() {
            return Err(CoreError::Internal("scan secret is empty".into()));
        }
        let message = format!("{booking_id}:{club_id}:{}", issued_at.timestamp());
        let tag = sign(&message, secret)?;
        Ok(format!("{TOKEN_PREFIX}{message}:{}", hex_lower(&tag)))
    }

    /// Verify a presented token against the validity window.
    ///
    /// Rejects tokens with a bad MAC, tokens older than `ttl` and tokens
    /// dated in the future. The MAC comparison is constant-time.
    ///
    /// # Errors
    ///
    /// [`CredentialFault::Malformed`] for syntax errors,
    /// [`CredentialFault::Rejected`] for everything else.
    pub fn verify(
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
        secret: &str,
    ) -> Result<Decoded, CredentialFault> {
        let parsed = parse(token).ok_or(CredentialFault::Malformed)?;
        if secret.is_empty() || ttl.is_zero() {
            return Err(CredentialFault::Rejected);
        }
        let mac = verify_mac(&parsed.message, secret, &parsed.tag);
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        let in_window = parsed.issued_at <= now && now - parsed.issued_at <= ttl;
        if mac && in_window {
            Ok(Decoded {
                booking_id: parsed.booking_id,
                club_id: parsed.club_id,
                issued_at: parsed.issued_at,
            })
        } else {
            Err(CredentialFault::Rejected)
        }
    }
}

struct Parsed {
    booking_id: BookingId,
    club_id: ClubId,
    issued_at: DateTime<Utc>,
    message: String,
    tag: Vec<u8>,
}

fn parse(token: &str) -> Option<Parsed> {
    let rest = token.strip_prefix(TOKEN_PREFIX)?;
    let mut parts = rest.split(':');
    let booking_raw = parts.next()?;
    let club_raw = parts.next()?;
    let ts_raw = parts.next()?;
    let mac_raw = parts.next()?;
    if parts.next().is_some() || mac_raw.len() != MAC_HEX_LEN {
        return None;
    }
    let booking_id = BookingId(Uuid::parse_str(booking_raw).ok()?);
    let club_id = ClubId(club_raw.parse().ok()?);
    let ts: i64 = ts_raw.parse().ok()?;
    if ts < 0 {
        return None;
    }
    let issued_at = DateTime::from_timestamp(ts, 0)?;
    let tag = hex_decode(mac_raw)?;
    Some(Parsed {
        booking_id,
        club_id,
        issued_at,
        message: format!("{booking_id}:{club_id}:{ts}"),
        tag,
    })
}

fn derived_key(secret: &str) -> Result<Vec<u8>, CoreError> {
    let mut mac = HmacSha256::new_from_slice(KEY_LABEL)
        .map_err(|e| CoreError::Internal(format!("mac init failed: {e}")))?;
    mac.update(secret.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sign(message: &str, secret: &str) -> Result<Vec<u8>, CoreError> {
    let key = derived_key(secret)?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| CoreError::Internal(format!("mac init failed: {e}")))?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify_mac(message: &str, secret: &str, tag: &[u8]) -> bool {
    let Ok(key) = derived_key(secret) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(&key) else {
        return false;
    };
    mac.update(message.as_bytes());
    mac.verify_slice(tag).is_ok()
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
