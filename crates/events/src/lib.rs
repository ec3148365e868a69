//! Structured event system for stowage.
//!
//! The spawn cache reports what it did through emit macros. The macros are
//! plain `tracing` events under the `stowage::cache` target; a custom tracing
//! [`Layer`](tracing_subscriber::Layer) captures them as typed
//! [`StowageEvent`]s and hands them to an [`EventBus`], so any number of
//! frontends can subscribe to one stream.
//!
//! # Usage
//!
//! ```rust,ignore
//! use stowage_events::{EventBus, emit_cache_hit};
//!
//! let bus = EventBus::new();
//! stowage_events::init_tracing("info", &bus)?;
//!
//! emit_cache_hit!("compile a.c", "e3b0c442.../142");
//! ```

pub mod bus;
pub mod error;
pub mod event;
pub mod layer;

pub use bus::{EventBus, Subscription};
pub use error::TracingInitError;
pub use event::{CacheEvent, MissReason, StowageEvent, UnknownMissReason};
pub use layer::StowageEventLayer;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global subscriber: a filtered stderr formatter plus an
/// unfiltered event layer feeding `bus`.
///
/// # Errors
///
/// Returns an error if `filter` is not a valid `EnvFilter` directive or a
/// global subscriber was already set.
pub fn init_tracing(filter: &str, bus: &EventBus) -> Result<(), TracingInitError> {
    let env_filter = EnvFilter::try_new(filter)?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(bus.layer())
        .try_init()?;
    Ok(())
}

// ============================================================================
// Emit Macros
// ============================================================================

/// Emit a cache hit event.
///
/// # Example
/// ```rust,ignore
/// emit_cache_hit!("compile a.c", action_key);
/// ```
#[macro_export]
macro_rules! emit_cache_hit {
    ($spawn:expr, $action_key:expr) => {
        ::tracing::info!(
            target: "stowage::cache",
            event_type = "cache.hit",
            spawn = %$spawn,
            action_key = %$action_key,
            "Remote cache hit"
        )
    };
}

/// Emit a cache miss event with a [`MissReason`].
#[macro_export]
macro_rules! emit_cache_miss {
    ($spawn:expr, $reason:expr) => {
        ::tracing::info!(
            target: "stowage::cache",
            event_type = "cache.miss",
            spawn = %$spawn,
            reason = %$reason,
            "Remote cache miss"
        )
    };
}

/// Emit a stored event after a local result was uploaded.
#[macro_export]
macro_rules! emit_cache_stored {
    ($spawn:expr, $action_key:expr) => {
        ::tracing::info!(
            target: "stowage::cache",
            event_type = "cache.stored",
            spawn = %$spawn,
            action_key = %$action_key,
            "Stored result in remote cache"
        )
    };
}

/// Emit a store-skipped event.
#[macro_export]
macro_rules! emit_cache_store_skipped {
    ($spawn:expr, $reason:expr) => {
        ::tracing::debug!(
            target: "stowage::cache",
            event_type = "cache.store_skipped",
            spawn = %$spawn,
            reason = %$reason,
        )
    };
}

/// Emit a user-visible cache warning.
///
/// # Example
/// ```rust,ignore
/// emit_cache_warning!("compile a.c", format!("Remote cache upload failed: {err}"));
/// ```
#[macro_export]
macro_rules! emit_cache_warning {
    ($spawn:expr, $message:expr) => {
        ::tracing::warn!(
            target: "stowage::cache",
            event_type = "cache.warning",
            spawn = %$spawn,
            "{}",
            $message
        )
    };
}
