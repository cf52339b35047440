//! Storage collaborator for committed booking state.
//!
//! # Design
//!
//! The trait is deliberately minimal: load one record, probe a table/slot
//! for an active booking, save a record commit-or-fail. How committed state
//! is stored (engine, schema, transactions) is a collaborator concern and
//! out of scope here; the runtime maps every storage failure to the closed
//! taxonomy's `Internal` kind and never retries it — the mutation may
//! already have been applied, and retrying without fencing could apply it
//! twice.
//!
//! # Dyn compatibility
//!
//! Methods return explicit `Pin<Box<dyn Future>>` instead of `async fn` so
//! the trait can be used as `Arc<dyn BookingStore>` across the service.

use crate::booking::{BookingId, BookingRecord, SlotRange, TableId};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Failures reported by a storage implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The write did not commit; committed state is unchanged.
    #[error("write not committed")]
    NotCommitted,

    /// Backend failure (connection, constraint, timeout).
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Boxed future alias used by all store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Committed booking state, as seen by the core.
pub trait BookingStore: Send + Sync {
    /// Load a booking by id; `None` when unknown.
    fn load(&self, id: BookingId) -> StoreFuture<'_, Option<BookingRecord>>;

    /// Find a booking that blocks `table_id` for any part of `slot`:
    /// `Held` with an unexpired hold, `Confirmed` or `Seated`.
    fn find_active_for(
        &self,
        table_id: TableId,
        slot: SlotRange,
    ) -> StoreFuture<'_, Option<BookingRecord>>;

    /// Persist a record. Commit-or-fail: on `Err` the previous committed
    /// state must still be observable.
    fn save(&self, record: BookingRecord) -> StoreFuture<'_, ()>;
}
