//! # Velvet Core
//!
//! Core types and collaborator traits for the Velvet reservation core: the
//! booking lifecycle model, the closed error taxonomy, idempotency-key and
//! render-key primitives, and the trait seams (storage, rendering, clock)
//! the runtime components are wired against.
//!
//! This crate holds no shared mutable state and performs no I/O. The two
//! stateful components — the idempotent operation ledger and the render
//! cache — live in `velvet-runtime`.
//!
//! ## Layout
//!
//! - [`error`]: the six-kind [`CoreError`] taxonomy every operation returns
//! - [`booking`]: records, snapshots and lifecycle transition rules
//! - [`actor`]: authorization context consumed for `Forbidden` decisions
//! - [`idempotency`]: namespaces, validated keys, request fingerprints
//! - [`render`]: render keys, key-derived ETags, the renderer trait
//! - [`credential`]: HMAC-signed seat credentials
//! - [`store`]: the storage collaborator trait
//! - [`clock`]: injectable time source

/// Authorization context supplied by the caller.
pub mod actor;

/// Booking records, snapshots and transition rules.
pub mod booking;

/// Injectable clock.
pub mod clock;

/// Seat credential codec.
pub mod credential;

/// Closed error taxonomy.
pub mod error;

/// Idempotency-key primitives.
pub mod idempotency;

/// Render keys, ETags and the renderer trait.
pub mod render;

/// Storage collaborator trait.
pub mod store;

pub use actor::{ActorContext, ActorId, Role};
pub use booking::{
    BookingId, BookingRecord, BookingSnapshot, BookingState, ClubId, HoldRequest, SlotRange,
    TableId,
};
pub use clock::{Clock, SystemClock};
pub use credential::{CredentialFault, Decoded, ScanCredential};
pub use error::CoreError;
pub use idempotency::{IdempotencyKey, Namespace, RequestFingerprint};
pub use render::{HallRenderer, RenderKey, etag_matches};
pub use store::{BookingStore, StoreError, StoreFuture};
