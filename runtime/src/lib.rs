//! # Velvet Runtime
//!
//! The stateful half of the Velvet reservation core: an at-most-once
//! operation ledger, a single-flight render cache, and the booking service
//! that layers lifecycle rules on top of the ledger.
//!
//! ## Core Components
//!
//! - **`IdempotencyLedger`**: deduplicates mutating operations by
//!   `(namespace, key)`; duplicates replay the stored outcome, concurrent
//!   duplicates coalesce onto one in-flight execution
//! - **`RenderCache`**: conditional (ETag) cache in front of a slow hall
//!   renderer, with TTL, LRU eviction and per-key single-flight
//! - **`BookingService`**: the `hold` / `confirm` / `cancel` /
//!   `seat_by_scan` lifecycle, every operation deduplicated through the
//!   ledger
//!
//! ## Example
//!
//! ```ignore
//! use velvet_runtime::booking::{BookingConfig, BookingService};
//!
//! let config = BookingConfig::builder("door-secret").build();
//! let service = BookingService::new(config, store);
//!
//! let snapshot = service.hold(request, &actor, "retry-key-1").await?;
//! ```

/// Booking lifecycle operations deduplicated through the ledger
pub mod booking;

/// Conditional single-flight render cache
pub mod cache;

/// At-most-once operation ledger
pub mod ledger;

/// Prometheus metrics for observability
pub mod metrics;

pub use booking::{BookingConfig, BookingService, SeatReplayPolicy};
pub use cache::{RenderCache, RenderCacheConfig, RenderOutcome};
pub use ledger::{IdempotencyLedger, LedgerConfig};
pub use metrics::MetricsServer;
