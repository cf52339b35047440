//! Booking domain model and lifecycle rules.
//!
//! The lifecycle is `Held → Confirmed → Seated`, with `Cancelled` reachable
//! from `Held`/`Confirmed` and `Expired` reachable from `Held` once the
//! hold TTL has passed. `Cancelled`, `Seated` and `Expired` are terminal.
//!
//! Transition legality is enforced on [`BookingRecord`] itself rather than
//! in the service layer, so no caller can skip a check: every mutator
//! returns the closed [`CoreError`] taxonomy on an illegal transition.

use crate::actor::ActorId;
use crate::error::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookingId(pub Uuid);

impl BookingId {
    /// Generate a new random `BookingId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BookingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a club (venue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClubId(pub i64);

impl fmt::Display for ClubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a table within a club.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId(pub i64);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Half-open UTC time interval `[start, end)` a booking occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    /// Inclusive start of the slot.
    pub start: DateTime<Utc>,
    /// Exclusive end of the slot.
    pub end: DateTime<Utc>,
}

impl SlotRange {
    /// Create a slot range.
    #[must_use]
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// True when the interval is non-empty.
    #[must_use]
    pub fn is_forward(&self) -> bool {
        self.end > self.start
    }

    /// Half-open interval overlap test.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Lifecycle state of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingState {
    /// Provisional reservation awaiting confirmation; time-bounded.
    Held,
    /// Confirmed reservation awaiting arrival.
    Confirmed,
    /// Cancelled by the guest or staff. Terminal.
    Cancelled,
    /// Guest arrived and was seated. Terminal.
    Seated,
    /// Hold lapsed before confirmation. Terminal.
    Expired,
}

impl BookingState {
    /// Terminal states admit no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Seated | Self::Expired)
    }

    /// Stable lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Seated => "seated",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for BookingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A booking as persisted by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRecord {
    /// Unique booking id.
    pub id: BookingId,
    /// Club the table belongs to.
    pub club_id: ClubId,
    /// Reserved table.
    pub table_id: TableId,
    /// Party size.
    pub guest_count: u32,
    /// Occupied time slot.
    pub slot: SlotRange,
    /// Current lifecycle state.
    pub state: BookingState,
    /// Hold deadline; present only while `Held`.
    pub hold_expires_at: Option<DateTime<Utc>>,
    /// Caller identity the authorization collaborator resolved. Opaque here.
    pub owner: ActorId,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last transition instant.
    pub updated_at: DateTime<Utc>,
}

impl BookingRecord {
    /// Create a fresh record in `Held` with the given hold deadline.
    #[must_use]
    pub fn held(
        club_id: ClubId,
        table_id: TableId,
        guest_count: u32,
        slot: SlotRange,
        owner: ActorId,
        now: DateTime<Utc>,
        hold_expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: BookingId::new(),
            club_id,
            table_id,
            guest_count,
            slot,
            state: BookingState::Held,
            hold_expires_at: Some(hold_expires_at),
            owner,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the record is `Held` and its deadline has passed.
    #[must_use]
    pub fn hold_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == BookingState::Held
            && self.hold_expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// An active booking blocks other holds/confirms on its table and slot.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            BookingState::Held => !self.hold_expired(now),
            BookingState::Confirmed | BookingState::Seated => true,
            BookingState::Cancelled | BookingState::Expired => false,
        }
    }

    /// `Held → Confirmed`.
    ///
    /// # Errors
    ///
    /// `Gone` when the hold has lapsed (or the record already expired),
    /// `Conflict` for any other state.
    pub fn confirm(&mut self, now: DateTime<Utc>) -> Result<(), CoreError> {
        match self.state {
            BookingState::Held if self.hold_expired(now) => {
                Err(CoreError::Gone("hold expired".into()))
            }
            BookingState::Held => {
                self.state = BookingState::Confirmed;
                self.hold_expires_at = None;
                self.updated_at = now;
                Ok(())
            }
            BookingState::Expired => Err(CoreError::Gone("hold expired".into())),
            other => Err(CoreError::Conflict(format!("cannot confirm in state {other}"))),
        }
    }

    /// `Held | Confirmed → Cancelled`.
    ///
    /// Returns `false` without touching the record when already `Cancelled`
    /// (cancellation is naturally idempotent).
    ///
    /// # Errors
    ///
    /// `Gone` for `Seated`/`Expired`, which admit no further transitions.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<bool, CoreError> {
        match self.state {
            BookingState::Held | BookingState::Confirmed => {
                self.state = BookingState::Cancelled;
                self.hold_expires_at = None;
                self.updated_at = now;
                Ok(true)
            }
            BookingState::Cancelled => Ok(false),
            other => Err(CoreError::Gone(format!("cannot cancel in state {other}"))),
        }
    }

    /// `Confirmed → Seated`.
    ///
    /// # Errors
    ///
    /// `Conflict` when not yet confirmed, already seated or cancelled;
    /// `Gone` when expired.
    pub fn seat(&mut self, now: DateTime<Utc>) -> Result<(), CoreError> {
        match self.state {
            BookingState::Confirmed => {
                self.state = BookingState::Seated;
                self.updated_at = now;
                Ok(())
            }
            BookingState::Expired => Err(CoreError::Gone("hold expired".into())),
            other => Err(CoreError::Conflict(format!("cannot seat in state {other}"))),
        }
    }

    /// Lazily transition a lapsed hold to `Expired`. No-op otherwise.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        if self.state == BookingState::Held {
            self.state = BookingState::Expired;
            self.hold_expires_at = None;
            self.updated_at = now;
        }
    }

    /// Outcome view handed back to callers; `scan_token` is filled in by
    /// the service at confirmation.
    #[must_use]
    pub fn snapshot(&self) -> BookingSnapshot {
        BookingSnapshot {
            id: self.id,
            club_id: self.club_id,
            table_id: self.table_id,
            guest_count: self.guest_count,
            slot: self.slot,
            state: self.state,
            hold_expires_at: self.hold_expires_at,
            scan_token: None,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Serializable view of a booking returned as an operation outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingSnapshot {
    /// Booking id.
    pub id: BookingId,
    /// Club the table belongs to.
    pub club_id: ClubId,
    /// Reserved table.
    pub table_id: TableId,
    /// Party size.
    pub guest_count: u32,
    /// Occupied time slot.
    pub slot: SlotRange,
    /// Lifecycle state at the time of the outcome.
    pub state: BookingState,
    /// Hold deadline while `Held`.
    pub hold_expires_at: Option<DateTime<Utc>>,
    /// Scan credential issued at confirmation, absent otherwise.
    pub scan_token: Option<String>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last transition instant.
    pub updated_at: DateTime<Utc>,
}

/// Parameters of a hold request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldRequest {
    /// Target club.
    pub club_id: ClubId,
    /// Target table.
    pub table_id: TableId,
    /// Party size; must be at least one.
    pub guest_count: u32,
    /// Requested slot; must be non-empty.
    pub slot: SlotRange,
}

impl HoldRequest {
    /// Shape validation, independent of any stored state.
    ///
    /// # Errors
    ///
    /// `Validation` for a zero guest count or an empty/backward slot.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.guest_count == 0 {
            return Err(CoreError::Validation("guest count must be positive".into()));
        }
        if !self.slot.is_forward() {
            return Err(CoreError::Validation("slot end must be after start".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeDelta;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    fn held_record(now: DateTime<Utc>) -> BookingRecord {
        BookingRecord::held(
            ClubId(1),
            TableId(7),
            4,
            SlotRange::new(now, now + TimeDelta::hours(4)),
            ActorId(42),
            now,
            now + TimeDelta::minutes(7),
        )
    }

    #[test]
    fn overlap_is_half_open() {
        let now = t0();
        let a = SlotRange::new(now, now + TimeDelta::hours(2));
        let b = SlotRange::new(now + TimeDelta::hours(2), now + TimeDelta::hours(4));
        let c = SlotRange::new(now + TimeDelta::hours(1), now + TimeDelta::hours(3));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
    }

    #[test]
    fn confirm_within_ttl_succeeds() {
        let now = t0();
        let mut rec = held_record(now);
        assert!(rec.confirm(now + TimeDelta::minutes(5)).is_ok());
        assert_eq!(rec.state, BookingState::Confirmed);
        assert!(rec.hold_expires_at.is_none());
    }

    #[test]
    fn confirm_after_ttl_is_gone() {
        let now = t0();
        let mut rec = held_record(now);
        let late = now + TimeDelta::minutes(8);
        assert_eq!(
            rec.confirm(late),
            Err(CoreError::Gone("hold expired".into()))
        );
        // The failed confirm must not have mutated anything.
        assert_eq!(rec.state, BookingState::Held);
    }

    #[test]
    fn confirm_on_cancelled_is_conflict() {
        let now = t0();
        let mut rec = held_record(now);
        assert_eq!(rec.cancel(now), Ok(true));
        let err = rec.confirm(now).unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(rec.state, BookingState::Cancelled);
    }

    #[test]
    fn cancel_is_idempotent() {
        let now = t0();
        let mut rec = held_record(now);
        assert_eq!(rec.cancel(now), Ok(true));
        assert_eq!(rec.cancel(now), Ok(false));
        assert_eq!(rec.state, BookingState::Cancelled);
    }

    #[test]
    fn cancel_after_seating_is_gone() {
        let now = t0();
        let mut rec = held_record(now);
        rec.confirm(now).ok();
        rec.seat(now).ok();
        assert_eq!(rec.cancel(now).unwrap_err().kind(), "gone");
    }

    #[test]
    fn seat_requires_confirmation() {
        let now = t0();
        let mut rec = held_record(now);
        assert_eq!(rec.seat(now).unwrap_err().kind(), "conflict");
        rec.confirm(now).ok();
        assert!(rec.seat(now).is_ok());
        assert_eq!(rec.state, BookingState::Seated);
    }

    #[test]
    fn expired_hold_is_not_active() {
        let now = t0();
        let mut rec = held_record(now);
        assert!(rec.is_active(now));
        assert!(!rec.is_active(now + TimeDelta::minutes(10)));
        rec.expire(now + TimeDelta::minutes(10));
        assert_eq!(rec.state, BookingState::Expired);
    }

    #[test]
    fn hold_request_validation() {
        let now = t0();
        let ok = HoldRequest {
            club_id: ClubId(1),
            table_id: TableId(1),
            guest_count: 2,
            slot: SlotRange::new(now, now + TimeDelta::hours(1)),
        };
        assert!(ok.validate().is_ok());

        let empty_slot = HoldRequest {
            slot: SlotRange::new(now, now),
            ..ok.clone()
        };
        assert_eq!(empty_slot.validate().unwrap_err().kind(), "validation");

        let no_guests = HoldRequest {
            guest_count: 0,
            ..ok
        };
        assert_eq!(no_guests.validate().unwrap_err().kind(), "validation");
    }
}
