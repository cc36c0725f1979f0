//! Build-coordination cache
//!
//! A generic coalescing result cache ([`AsyncResultCache`]) plus the pieces
//! it is built from: an injectable clock and an injectable metrics sink.
//! The installation and bundle caches are both instances of it.
//!
//! # Lookup outcomes
//!
//! | Slot | Caller's freshness floor met | Result |
//! |------|------------------------------|--------|
//! | empty | - | start build, wait |
//! | pending / fresh | yes | share entry |
//! | rebuilding | yes | serve current immediately |
//! | rebuilding | no | wait for rebuild, retry |
//! | stale success | yes | start rebuild, serve stale |
//! | stale failure, or floor unmet | no | start rebuild, wait |

pub mod clock;
pub mod engine;
pub mod metrics;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    AsyncResultCache, CacheBuilder, Created, GetMetaOptions, Meta, SlotState, DEFAULT_ERROR_TTL,
};
pub use metrics::{CacheEvent, CountingMetrics, MetricsSink, TracingMetrics};
