//! End-to-end booking lifecycle through the service, with deterministic
//! time and an in-memory store.

#![allow(clippy::unwrap_used)]

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use velvet_core::actor::{ActorContext, ActorId, Role};
use velvet_core::booking::{BookingState, ClubId, HoldRequest, SlotRange, TableId};
use velvet_core::credential::ScanCredential;
use velvet_runtime::booking::{BookingConfig, BookingService, SeatReplayPolicy};
use velvet_testing::{InMemoryBookingStore, StepClock, init_test_tracing};

const SECRET: &str = "door-secret";
const EPOCH: i64 = 1_700_000_000;

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(EPOCH, 0).unwrap()
}

fn manager(club: i64) -> ActorContext {
    ActorContext {
        actor_id: ActorId(7),
        roles: vec![Role::Manager],
        permitted_club_ids: vec![ClubId(club)],
    }
}

fn request(table: i64) -> HoldRequest {
    HoldRequest {
        club_id: ClubId(1),
        table_id: TableId(table),
        guest_count: 4,
        slot: SlotRange::new(t0() + TimeDelta::hours(2), t0() + TimeDelta::hours(6)),
    }
}

fn setup() -> (BookingService, Arc<InMemoryBookingStore>, Arc<StepClock>) {
    init_test_tracing();
    let clock = Arc::new(StepClock::at_epoch(EPOCH));
    let store = Arc::new(InMemoryBookingStore::new());
    let config = BookingConfig::builder(SECRET).build();
    let service = BookingService::with_clock(config, store.clone(), clock.clone());
    (service, store, clock)
}

#[tokio::test]
async fn hold_replay_returns_the_same_snapshot() {
    let (service, store, _) = setup();
    let actor = manager(1);

    let first = service.hold(request(3), &actor, "h1").await.unwrap();
    let second = service.hold(request(3), &actor, "h1").await.unwrap();
    assert_eq!(first, second, "replay did not mint a second booking");
    assert_eq!(store.len(), 1);
    assert_eq!(first.state, BookingState::Held);
    assert!(first.hold_expires_at.is_some());
}

#[tokio::test]
async fn overlapping_hold_with_a_new_key_conflicts() {
    let (service, _, _) = setup();
    let actor = manager(1);

    service.hold(request(3), &actor, "h1").await.unwrap();
    let err = service.hold(request(3), &actor, "h2").await.unwrap_err();
    assert_eq!(err.kind(), "conflict");

    // A different table is free.
    assert!(service.hold(request(4), &actor, "h3").await.is_ok());
}

#[tokio::test]
async fn key_reuse_with_a_different_request_is_a_conflict() {
    let (service, _, _) = setup();
    let actor = manager(1);

    service.hold(request(3), &actor, "h1").await.unwrap();
    let err = service.hold(request(9), &actor, "h1").await.unwrap_err();
    assert_eq!(err.kind(), "conflict");
}

#[tokio::test]
async fn confirm_replay_returns_the_same_token() {
    let (service, store, _) = setup();
    let actor = manager(1);

    let held = service.hold(request(3), &actor, "h1").await.unwrap();
    let first = service.confirm(held.id, &actor, "c1").await.unwrap();
    let second = service.confirm(held.id, &actor, "c1").await.unwrap();

    assert_eq!(first, second);
    assert!(first.scan_token.is_some());
    assert_eq!(first.state, BookingState::Confirmed);
    let record = store.get(held.id).unwrap();
    assert_eq!(record.state, BookingState::Confirmed);
    assert!(record.hold_expires_at.is_none());
}

#[tokio::test]
async fn confirm_on_cancelled_is_a_conflict_without_mutation() {
    let (service, store, _) = setup();
    let actor = manager(1);

    let held = service.hold(request(3), &actor, "h1").await.unwrap();
    service.cancel(held.id, &actor, "x1").await.unwrap();

    let err = service.confirm(held.id, &actor, "c1").await.unwrap_err();
    assert_eq!(err.kind(), "conflict");
    assert_eq!(store.get(held.id).unwrap().state, BookingState::Cancelled);
}

#[tokio::test]
async fn expired_hold_is_gone_on_confirm_and_stays_gone() {
    let (service, store, clock) = setup();
    let actor = manager(1);

    let held = service.hold(request(3), &actor, "h1").await.unwrap();
    clock.advance(Duration::from_secs(8 * 60)); // past the 7 min hold TTL

    let err = service.confirm(held.id, &actor, "c1").await.unwrap_err();
    assert_eq!(err.kind(), "gone");
    // Lazily transitioned and saved.
    assert_eq!(store.get(held.id).unwrap().state, BookingState::Expired);

    // A fresh retry key reaches the same verdict.
    let err = service.confirm(held.id, &actor, "c2").await.unwrap_err();
    assert_eq!(err.kind(), "gone");
}

#[tokio::test]
async fn cancel_is_idempotent_and_terminal_states_are_gone() {
    let (service, _, _) = setup();
    let actor = manager(1);

    let held = service.hold(request(3), &actor, "h1").await.unwrap();
    let first = service.cancel(held.id, &actor, "x1").await.unwrap();
    assert_eq!(first.state, BookingState::Cancelled);

    // Cancelling again with a new key is a successful no-op.
    let second = service.cancel(held.id, &actor, "x2").await.unwrap();
    assert_eq!(second.state, BookingState::Cancelled);
}

#[tokio::test]
async fn seat_by_scan_seats_and_replays_per_policy() {
    let (service, store, _) = setup();
    let actor = manager(1);

    let held = service.hold(request(3), &actor, "h1").await.unwrap();
    let confirmed = service.confirm(held.id, &actor, "c1").await.unwrap();
    let token = confirmed.scan_token.unwrap();

    let seated = service.seat_by_scan(&token, &actor, "s1").await.unwrap();
    assert_eq!(seated.state, BookingState::Seated);
    assert_eq!(store.get(held.id).unwrap().state, BookingState::Seated);

    // Default policy: a second scan answers the seated snapshot.
    let replay = service.seat_by_scan(&token, &actor, "s2").await.unwrap();
    assert_eq!(replay.state, BookingState::Seated);
}

#[tokio::test]
async fn strict_seat_policy_rejects_second_scans() {
    init_test_tracing();
    let clock = Arc::new(StepClock::at_epoch(EPOCH));
    let store = Arc::new(InMemoryBookingStore::new());
    let config = BookingConfig::builder(SECRET)
        .seat_replay(SeatReplayPolicy::Conflict)
        .build();
    let service = BookingService::with_clock(config, store, clock);
    let actor = manager(1);

    let held = service.hold(request(3), &actor, "h1").await.unwrap();
    let confirmed = service.confirm(held.id, &actor, "c1").await.unwrap();
    let token = confirmed.scan_token.unwrap();

    service.seat_by_scan(&token, &actor, "s1").await.unwrap();
    let err = service.seat_by_scan(&token, &actor, "s2").await.unwrap_err();
    assert_eq!(err.kind(), "conflict");
}

#[tokio::test]
async fn seat_of_an_unconfirmed_hold_is_a_conflict() {
    let (service, _, _) = setup();
    let actor = manager(1);

    let held = service.hold(request(3), &actor, "h1").await.unwrap();
    // Forge a structurally valid credential for the un-confirmed booking.
    let token = ScanCredential::issue(held.id, ClubId(1), t0(), SECRET).unwrap();
    let err = service.seat_by_scan(&token, &actor, "s1").await.unwrap_err();
    assert_eq!(err.kind(), "conflict");
}

#[tokio::test]
async fn bad_scan_tokens_reveal_nothing() {
    let (service, _, _) = setup();
    let actor = manager(1);

    let held = service.hold(request(3), &actor, "h1").await.unwrap();
    let confirmed = service.confirm(held.id, &actor, "c1").await.unwrap();
    let token = confirmed.scan_token.unwrap();

    // Unparsable token: caller error.
    let err = service.seat_by_scan("garbage", &actor, "s1").await.unwrap_err();
    assert_eq!(err.kind(), "validation");

    // Tampered token: indistinguishable from an unknown booking.
    let forged = token.replacen(":1:", ":2:", 1);
    let err = service.seat_by_scan(&forged, &actor, "s2").await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn scope_checks_answer_forbidden() {
    let (service, _, _) = setup();
    let insider = manager(1);
    let outsider = manager(2);

    let err = service.hold(request(3), &outsider, "h1").await.unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    let held = service.hold(request(3), &insider, "h2").await.unwrap();
    let err = service.confirm(held.id, &outsider, "c1").await.unwrap_err();
    assert_eq!(err.kind(), "forbidden");

    // A valid credential presented by an out-of-scope actor is Forbidden,
    // not NotFound: the credential itself checked out.
    let confirmed = service.confirm(held.id, &insider, "c2").await.unwrap();
    let token = confirmed.scan_token.unwrap();
    let err = service
        .seat_by_scan(&token, &outsider, "s1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "forbidden");
}

#[tokio::test]
async fn storage_failure_surfaces_internal_and_is_replayed() {
    let (service, store, _) = setup();
    let actor = manager(1);

    store.fail_next_save();
    let err = service.hold(request(3), &actor, "h1").await.unwrap_err();
    assert_eq!(err.kind(), "internal");

    // The failed outcome is on the ledger: the same key replays it rather
    // than risking a second mutation. A fresh key starts over.
    let err = service.hold(request(3), &actor, "h1").await.unwrap_err();
    assert_eq!(err.kind(), "internal");
    assert!(service.hold(request(3), &actor, "h2").await.is_ok());
}

#[tokio::test]
async fn aged_out_credentials_are_rejected() {
    let (service, _, clock) = setup();
    let actor = manager(1);

    let held = service.hold(request(3), &actor, "h1").await.unwrap();
    let confirmed = service.confirm(held.id, &actor, "c1").await.unwrap();
    let token = confirmed.scan_token.unwrap();

    clock.advance(Duration::from_secs(49 * 3600)); // past the 48 h scan TTL
    let err = service.seat_by_scan(&token, &actor, "s1").await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}
