//! Foundational low-level utilities shared across rkgate crates.
//!
//! Provides wall-clock helpers and the `Clock` abstraction used by buffer
//! expiry bookkeeping, so eviction can be driven deterministically in tests.

pub mod clock;
pub mod time_utils;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, is_idle_past_ttl};
