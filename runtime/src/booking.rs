//! Booking service: lifecycle operations deduplicated through the ledger.
//!
//! Each operation validates its inputs and the caller's club scope, then
//! runs the mutating body through the [`IdempotencyLedger`] in its own
//! namespace, keyed by the caller-supplied idempotency token and
//! fingerprinted over the request payload. Client retries therefore replay
//! the original outcome instead of mutating twice, and a reused key
//! carrying a different payload is rejected as `Conflict`.
//!
//! Storage failures surface as `Internal` and are never retried here: the
//! mutation may already have committed, and blind retry could apply it
//! twice.

use crate::ledger::{IdempotencyLedger, LedgerConfig};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use velvet_core::actor::ActorContext;
use velvet_core::booking::{BookingRecord, BookingSnapshot, BookingState, HoldRequest};
use velvet_core::clock::{Clock, SystemClock};
use velvet_core::credential::{CredentialFault, ScanCredential};
use velvet_core::error::CoreError;
use velvet_core::idempotency::{IdempotencyKey, Namespace, RequestFingerprint};
use velvet_core::store::{BookingStore, StoreError};
use velvet_core::{BookingId, TableId};

/// How a scan of an already-seated booking is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeatReplayPolicy {
    /// Return the seated snapshot; a second scan of the same ticket at the
    /// same door is a retry, not an intrusion.
    #[default]
    ReturnSeated,
    /// Reject the second scan as `Conflict` (strict doors).
    Conflict,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct BookingConfig {
    /// How long a hold blocks its table before lapsing.
    pub hold_ttl: Duration,
    /// Validity window of issued scan credentials.
    pub scan_ttl: Duration,
    /// Secret the scan credential MAC is derived from.
    pub scan_secret: String,
    /// Replay behavior for scans of seated bookings.
    pub seat_replay: SeatReplayPolicy,
    /// Ledger configuration for operation deduplication.
    pub ledger: LedgerConfig,
}

impl BookingConfig {
    /// Start a builder. The scan secret has no usable default.
    #[must_use]
    pub fn builder(scan_secret: impl Into<String>) -> BookingConfigBuilder {
        BookingConfigBuilder {
            scan_secret: scan_secret.into(),
            hold_ttl: None,
            scan_ttl: None,
            seat_replay: None,
            ledger: None,
        }
    }
}

/// Builder for [`BookingConfig`].
#[derive(Debug, Clone)]
pub struct BookingConfigBuilder {
    scan_secret: String,
    hold_ttl: Option<Duration>,
    scan_ttl: Option<Duration>,
    seat_replay: Option<SeatReplayPolicy>,
    ledger: Option<LedgerConfig>,
}

impl BookingConfigBuilder {
    /// Set the hold time-to-live.
    #[must_use]
    pub const fn hold_ttl(mut self, ttl: Duration) -> Self {
        self.hold_ttl = Some(ttl);
        self
    }

    /// Set the scan credential validity window.
    #[must_use]
    pub const fn scan_ttl(mut self, ttl: Duration) -> Self {
        self.scan_ttl = Some(ttl);
        self
    }

    /// Set the seated-replay policy.
    #[must_use]
    pub const fn seat_replay(mut self, policy: SeatReplayPolicy) -> Self {
        self.seat_replay = Some(policy);
        self
    }

    /// Override the ledger configuration.
    #[must_use]
    pub fn ledger(mut self, config: LedgerConfig) -> Self {
        self.ledger = Some(config);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> BookingConfig {
        BookingConfig {
            scan_secret: self.scan_secret,
            hold_ttl: self.hold_ttl.unwrap_or(Duration::from_secs(7 * 60)),
            scan_ttl: self.scan_ttl.unwrap_or(Duration::from_secs(48 * 3600)),
            seat_replay: self.seat_replay.unwrap_or_default(),
            ledger: self.ledger.unwrap_or_default(),
        }
    }
}

/// Booking lifecycle operations with at-most-once semantics.
pub struct BookingService {
    ledger: IdempotencyLedger<BookingSnapshot>,
    store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    config: BookingConfig,
}

impl BookingService {
    /// Create a service with the system clock.
    #[must_use]
    pub fn new(config: BookingConfig, store: Arc<dyn BookingStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a service with an injected clock (tests).
    #[must_use]
    pub fn with_clock(
        config: BookingConfig,
        store: Arc<dyn BookingStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ledger = IdempotencyLedger::with_clock(config.ledger.clone(), Arc::clone(&clock));
        Self {
            ledger,
            store,
            clock,
            config,
        }
    }

    /// The ledger operations are deduplicated through, exposed for
    /// maintenance (`purge_expired`, `clear`).
    #[must_use]
    pub const fn ledger(&self) -> &IdempotencyLedger<BookingSnapshot> {
        &self.ledger
    }

    /// Place a hold on a table for a slot.
    ///
    /// # Errors
    ///
    /// `Validation` for a malformed key or request, `Forbidden` outside the
    /// actor's club scope, `Conflict` when the table is already actively
    /// booked for an overlapping slot, `Internal` on storage failure.
    pub async fn hold(
        &self,
        request: HoldRequest,
        actor: &ActorContext,
        idempotency_key: &str,
    ) -> Result<BookingSnapshot, CoreError> {
        let key = IdempotencyKey::parse(idempotency_key)?;
        request.validate()?;
        if !actor.may_access_club(request.club_id) {
            return deny(Namespace::Hold, "club outside actor scope");
        }
        let fingerprint = RequestFingerprint::of(&request)?;

        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let hold_ttl = chrono_ttl(self.config.hold_ttl);
        let owner = actor.actor_id;
        let outcome = self
            .ledger
            .execute(Namespace::Hold, key, fingerprint, move || async move {
                let now = clock.now();
                if let Some(existing) = store
                    .find_active_for(request.table_id, request.slot)
                    .await
                    .map_err(store_failure)?
                {
                    if existing.is_active(now) {
                        return Err(CoreError::Conflict(format!(
                            "table {} already booked for an overlapping slot",
                            request.table_id
                        )));
                    }
                }
                let record = BookingRecord::held(
                    request.club_id,
                    request.table_id,
                    request.guest_count,
                    request.slot,
                    owner,
                    now,
                    now + hold_ttl,
                );
                let snapshot = record.snapshot();
                store.save(record).await.map_err(store_failure)?;
                Ok(snapshot)
            })
            .await;
        observe(Namespace::Hold, &outcome);
        outcome
    }

    /// Confirm a held booking, issuing its scan credential.
    ///
    /// A lapsed hold is transitioned to `Expired` and saved before `Gone`
    /// is returned, so later reads agree with the answer.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `Forbidden` outside club scope, `Gone`
    /// when the hold lapsed, `Conflict` for any other state.
    pub async fn confirm(
        &self,
        booking_id: BookingId,
        actor: &ActorContext,
        idempotency_key: &str,
    ) -> Result<BookingSnapshot, CoreError> {
        let key = IdempotencyKey::parse(idempotency_key)?;
        let fingerprint = RequestFingerprint::of(&booking_id)?;

        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let actor = actor.clone();
        let secret = self.config.scan_secret.clone();
        let outcome = self
            .ledger
            .execute(Namespace::Confirm, key, fingerprint, move || async move {
                let now = clock.now();
                let mut record = load_scoped(&*store, booking_id, &actor).await?;
                if record.hold_expired(now) {
                    record.expire(now);
                    store.save(record).await.map_err(store_failure)?;
                    return Err(CoreError::Gone("hold expired".into()));
                }
                record.confirm(now)?;
                let token = ScanCredential::issue(record.id, record.club_id, now, &secret)?;
                let mut snapshot = record.snapshot();
                snapshot.scan_token = Some(token);
                store.save(record).await.map_err(store_failure)?;
                Ok(snapshot)
            })
            .await;
        observe(Namespace::Confirm, &outcome);
        outcome
    }

    /// Cancel a held or confirmed booking.
    ///
    /// Cancelling an already-cancelled booking succeeds without touching
    /// storage and returns the current snapshot.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `Forbidden` outside club scope, `Gone`
    /// for `Seated`/`Expired`.
    pub async fn cancel(
        &self,
        booking_id: BookingId,
        actor: &ActorContext,
        idempotency_key: &str,
    ) -> Result<BookingSnapshot, CoreError> {
        let key = IdempotencyKey::parse(idempotency_key)?;
        let fingerprint = RequestFingerprint::of(&booking_id)?;

        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let actor = actor.clone();
        let outcome = self
            .ledger
            .execute(Namespace::Cancel, key, fingerprint, move || async move {
                let now = clock.now();
                let mut record = load_scoped(&*store, booking_id, &actor).await?;
                if record.cancel(now)? {
                    let snapshot = record.snapshot();
                    store.save(record).await.map_err(store_failure)?;
                    Ok(snapshot)
                } else {
                    Ok(record.snapshot())
                }
            })
            .await;
        observe(Namespace::Cancel, &outcome);
        outcome
    }

    /// Seat a guest by their scan credential.
    ///
    /// A bad MAC, an aged-out credential or a club mismatch all answer
    /// `NotFound`, indistinguishable from an unknown booking; only a valid
    /// credential outside the actor's scope earns `Forbidden`.
    ///
    /// # Errors
    ///
    /// `Validation` for an unparsable token, `NotFound`/`Forbidden` as
    /// above, `Conflict` for unconfirmed or cancelled bookings, `Gone` for
    /// expired ones. Scanning a seated booking follows [`SeatReplayPolicy`].
    pub async fn seat_by_scan(
        &self,
        token: &str,
        actor: &ActorContext,
        idempotency_key: &str,
    ) -> Result<BookingSnapshot, CoreError> {
        let key = IdempotencyKey::parse(idempotency_key)?;
        let fingerprint = RequestFingerprint::of(&token)?;

        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let actor = actor.clone();
        let secret = self.config.scan_secret.clone();
        let scan_ttl = self.config.scan_ttl;
        let replay = self.config.seat_replay;
        let token = token.to_owned();
        let outcome = self
            .ledger
            .execute(Namespace::Seat, key, fingerprint, move || async move {
                let now = clock.now();
                let decoded = ScanCredential::verify(&token, now, scan_ttl, &secret).map_err(
                    |fault| match fault {
                        CredentialFault::Malformed => {
                            CoreError::Validation("malformed scan token".into())
                        }
                        CredentialFault::Rejected => {
                            CoreError::NotFound("unknown or expired scan token".into())
                        }
                    },
                )?;
                let mut record = load_verified(&*store, decoded.booking_id).await?;
                if record.club_id != decoded.club_id {
                    return Err(CoreError::NotFound("booking not found".into()));
                }
                if !actor.may_access_club(record.club_id) {
                    return Err(CoreError::Forbidden("club outside actor scope".into()));
                }
                if record.state == BookingState::Seated {
                    return match replay {
                        SeatReplayPolicy::ReturnSeated => Ok(record.snapshot()),
                        SeatReplayPolicy::Conflict => {
                            Err(CoreError::Conflict("already seated".into()))
                        }
                    };
                }
                record.seat(now)?;
                let snapshot = record.snapshot();
                store.save(record).await.map_err(store_failure)?;
                Ok(snapshot)
            })
            .await;
        observe(Namespace::Seat, &outcome);
        outcome
    }

    /// Look up a table's currently blocking booking, if any. Read-only; not
    /// deduplicated.
    ///
    /// # Errors
    ///
    /// `Internal` on storage failure.
    pub async fn active_booking(
        &self,
        table_id: TableId,
        slot: velvet_core::SlotRange,
    ) -> Result<Option<BookingSnapshot>, CoreError> {
        let now = self.clock.now();
        let found = self
            .store
            .find_active_for(table_id, slot)
            .await
            .map_err(store_failure)?;
        Ok(found
            .filter(|record| record.is_active(now))
            .map(|record| record.snapshot()))
    }
}

async fn load_scoped(
    store: &dyn BookingStore,
    booking_id: BookingId,
    actor: &ActorContext,
) -> Result<BookingRecord, CoreError> {
    let record = load_verified(store, booking_id).await?;
    if actor.may_access_club(record.club_id) {
        Ok(record)
    } else {
        Err(CoreError::Forbidden("club outside actor scope".into()))
    }
}

async fn load_verified(
    store: &dyn BookingStore,
    booking_id: BookingId,
) -> Result<BookingRecord, CoreError> {
    store
        .load(booking_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| CoreError::NotFound("booking not found".into()))
}

fn store_failure(err: StoreError) -> CoreError {
    CoreError::Internal(format!("storage failure: {err}"))
}

fn deny(namespace: Namespace, detail: &str) -> Result<BookingSnapshot, CoreError> {
    let outcome = Err(CoreError::Forbidden(detail.into()));
    observe(namespace, &outcome);
    outcome
}

fn chrono_ttl(ttl: Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::from_std(ttl).unwrap_or(chrono::TimeDelta::MAX)
}

fn observe(namespace: Namespace, outcome: &Result<BookingSnapshot, CoreError>) {
    match outcome {
        Ok(snapshot) => {
            counter!(
                "booking_operations_total",
                "action" => namespace.as_str(),
                "outcome" => "ok",
            )
            .increment(1);
            tracing::info!(
                action = namespace.as_str(),
                booking = %snapshot.id,
                state = %snapshot.state,
                "booking operation succeeded"
            );
        }
        Err(err) => {
            counter!(
                "booking_operations_total",
                "action" => namespace.as_str(),
                "outcome" => err.kind(),
            )
            .increment(1);
            tracing::warn!(
                action = namespace.as_str(),
                kind = err.kind(),
                error = %err,
                "booking operation failed"
            );
        }
    }
}
