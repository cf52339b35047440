//! # Velvet Testing
//!
//! Deterministic test doubles for the Velvet reservation core:
//!
//! - [`FixedClock`] / [`StepClock`]: controllable time sources
//! - [`InMemoryBookingStore`]: a `BookingStore` over a `HashMap`, with an
//!   injectable save failure
//! - [`CountingRenderer`]: a `HallRenderer` returning configurable bytes
//!   and counting invocations
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use velvet_core::clock::Clock;
//! use velvet_testing::StepClock;
//!
//! let clock = Arc::new(StepClock::at_epoch(1_700_000_000));
//! let before = clock.now();
//! clock.advance(Duration::from_secs(60));
//! assert_eq!(clock.now() - before, chrono::TimeDelta::minutes(1));
//! ```

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use velvet_core::booking::{BookingId, BookingRecord, BookingState, SlotRange, TableId};
use velvet_core::clock::Clock;
use velvet_core::error::CoreError;
use velvet_core::render::{HallRenderer, RenderKey};
use velvet_core::store::{BookingStore, StoreError, StoreFuture};

/// Install a compact tracing subscriber writing to the test capture.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Clock pinned to a single instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    /// Clock pinned to the given UNIX timestamp (seconds).
    #[must_use]
    pub fn at_epoch(secs: i64) -> Self {
        Self(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct StepClock {
    now: Mutex<DateTime<Utc>>,
}

impl StepClock {
    /// Start at the given instant.
    #[must_use]
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the given UNIX timestamp (seconds).
    #[must_use]
    pub fn at_epoch(secs: i64) -> Self {
        Self::at(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += delta;
    }
}

impl Clock for StepClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `BookingStore` over a `HashMap`, with an injectable save failure.
#[derive(Debug, Default)]
pub struct InMemoryBookingStore {
    records: Mutex<HashMap<BookingId, BookingRecord>>,
    fail_next_save: AtomicBool,
}

impl InMemoryBookingStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `save` fail with a backend error. One-shot.
    pub fn fail_next_save(&self) {
        self.fail_next_save.store(true, Ordering::SeqCst);
    }

    /// Seed a record directly, bypassing the trait.
    pub fn insert(&self, record: BookingRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record);
    }

    /// Read a record directly for assertions.
    #[must_use]
    pub fn get(&self, id: BookingId) -> Option<BookingRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when nothing has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BookingStore for InMemoryBookingStore {
    fn load(&self, id: BookingId) -> StoreFuture<'_, Option<BookingRecord>> {
        let found = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        Box::pin(async move { Ok(found) })
    }

    fn find_active_for(
        &self,
        table_id: TableId,
        slot: SlotRange,
    ) -> StoreFuture<'_, Option<BookingRecord>> {
        // Expiring lapsed holds is the caller's judgement; this double
        // hands back anything not terminally released.
        let found = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|record| {
                record.table_id == table_id
                    && record.slot.overlaps(&slot)
                    && !matches!(
                        record.state,
                        BookingState::Cancelled | BookingState::Expired
                    )
            })
            .cloned();
        Box::pin(async move { Ok(found) })
    }

    fn save(&self, record: BookingRecord) -> StoreFuture<'_, ()> {
        if self.fail_next_save.swap(false, Ordering::SeqCst) {
            return Box::pin(async { Err(StoreError::Backend("injected failure".into())) });
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id, record);
        Box::pin(async { Ok(()) })
    }
}

/// `HallRenderer` returning configurable bytes and counting invocations.
#[derive(Debug)]
pub struct CountingRenderer {
    payload: Vec<u8>,
    calls: AtomicUsize,
    fail_next: AtomicBool,
    latency: Option<Duration>,
}

impl CountingRenderer {
    /// Renderer that answers every call with `payload`.
    #[must_use]
    pub const fn returning(payload: Vec<u8>) -> Self {
        Self {
            payload,
            calls: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
            latency: None,
        }
    }

    /// Add a per-call delay, to widen coalescing windows in tests.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next render fail with `Internal`. One-shot.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Number of render invocations so far, failures included.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HallRenderer for CountingRenderer {
    fn render(
        &self,
        _key: &RenderKey,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, CoreError>> + Send + '_>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = self.fail_next.swap(false, Ordering::SeqCst);
        let latency = self.latency;
        let payload = self.payload.clone();
        Box::pin(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            if fail {
                Err(CoreError::Internal("injected render failure".into()))
            } else {
                Ok(payload)
            }
        })
    }
}
