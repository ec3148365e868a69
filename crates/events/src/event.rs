//! Event type definitions for structured stowage events.
//!
//! Cache events describe what the spawn cache decided for one build step.
//! They are produced by the emit macros, captured by [`crate::StowageEventLayer`]
//! and fanned out through the [`crate::EventBus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A structured stowage event with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StowageEvent {
    /// Unique event identifier.
    pub id: Uuid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// The tracing target the event was emitted under (e.g. "`stowage::cache`").
    pub target: String,
    /// The event payload.
    pub event: CacheEvent,
}

impl StowageEvent {
    /// Create a new event stamped with the current time.
    #[must_use]
    pub fn new(target: impl Into<String>, event: CacheEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            target: target.into(),
            event,
        }
    }

    /// Whether this event must be shown to the user as a warning.
    #[must_use]
    pub fn is_warning(&self) -> bool {
        matches!(self.event, CacheEvent::Warning { .. })
    }
}

/// Spawn cache lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    /// A cached result was found and its outputs were made available.
    Hit {
        /// Human-readable spawn description.
        spawn: String,
        /// Action key (digest string) that hit.
        action_key: String,
    },
    /// No usable cached result; the spawn must run locally.
    Miss {
        /// Human-readable spawn description.
        spawn: String,
        /// Why the lookup did not produce a hit.
        reason: MissReason,
    },
    /// A local result was uploaded and recorded in the action cache.
    Stored {
        /// Human-readable spawn description.
        spawn: String,
        /// Action key the result was stored under.
        action_key: String,
    },
    /// A store was intentionally not performed.
    StoreSkipped {
        /// Human-readable spawn description.
        spawn: String,
        /// Why nothing was stored.
        reason: String,
    },
    /// A non-fatal cache failure the user should know about.
    Warning {
        /// Human-readable spawn description.
        spawn: String,
        /// Rendered error message.
        message: String,
    },
}

/// Why a lookup ended as a miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissReason {
    /// The spawn's execution requirements forbid remote caching.
    NotCacheable,
    /// Lookups are switched off in configuration.
    Disabled,
    /// The action cache has no entry for the action key.
    NotFound,
    /// The entry exists but references blobs that were evicted.
    Orphaned,
    /// The lookup failed; a warning has been emitted separately.
    Error,
}

impl MissReason {
    /// Stable string form used in tracing fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotCacheable => "not_cacheable",
            Self::Disabled => "disabled",
            Self::NotFound => "not_found",
            Self::Orphaned => "orphaned",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MissReason {
    type Err = UnknownMissReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_cacheable" => Ok(Self::NotCacheable),
            "disabled" => Ok(Self::Disabled),
            "not_found" => Ok(Self::NotFound),
            "orphaned" => Ok(Self::Orphaned),
            "error" => Ok(Self::Error),
            other => Err(UnknownMissReason(other.to_string())),
        }
    }
}

/// Returned when parsing an unknown miss reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown miss reason: {0}")]
pub struct UnknownMissReason(pub String);
