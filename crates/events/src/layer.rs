//! Custom tracing Layer for capturing stowage events.
//!
//! This layer intercepts tracing events whose target starts with "stowage"
//! and that carry an `event_type` field, converts them to [`StowageEvent`]
//! values and sends them to the `EventBus`.

use crate::event::{CacheEvent, MissReason, StowageEvent};
use tokio::sync::mpsc;
use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

/// A tracing Layer that captures stowage-specific events.
pub struct StowageEventLayer {
    sender: mpsc::UnboundedSender<StowageEvent>,
}

impl StowageEventLayer {
    /// Create a new layer that sends events to the given channel.
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<StowageEvent>) -> Self {
        Self { sender }
    }
}

impl<S> Layer<S> for StowageEventLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let target = event.metadata().target();
        if !target.starts_with("stowage") {
            return;
        }

        let mut visitor = CacheEventVisitor::new(target);
        event.record(&mut visitor);

        if let Some(stowage_event) = visitor.build() {
            let _ = self.sender.send(stowage_event);
        }
    }
}

/// Visitor for extracting typed fields from tracing events.
#[derive(Default)]
struct CacheEventVisitor {
    target: String,
    event_type: Option<String>,
    spawn: Option<String>,
    action_key: Option<String>,
    reason: Option<String>,
    message: Option<String>,
}

impl CacheEventVisitor {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            ..Self::default()
        }
    }

    fn build(self) -> Option<StowageEvent> {
        let event = match self.event_type.as_deref()? {
            "cache.hit" => CacheEvent::Hit {
                spawn: self.spawn?,
                action_key: self.action_key?,
            },
            "cache.miss" => CacheEvent::Miss {
                spawn: self.spawn?,
                reason: self.reason?.parse::<MissReason>().ok()?,
            },
            "cache.stored" => CacheEvent::Stored {
                spawn: self.spawn?,
                action_key: self.action_key?,
            },
            "cache.store_skipped" => CacheEvent::StoreSkipped {
                spawn: self.spawn?,
                reason: self.reason?,
            },
            "cache.warning" => CacheEvent::Warning {
                spawn: self.spawn?,
                message: self.message?,
            },
            _ => return None,
        };

        Some(StowageEvent::new(self.target, event))
    }

    fn record_string(&mut self, field: &Field, value: String) {
        match field.name() {
            "event_type" => self.event_type = Some(value),
            "spawn" => self.spawn = Some(value),
            "action_key" => self.action_key = Some(value),
            "reason" => self.reason = Some(value),
            "message" | "error" => self.message = Some(value),
            _ => {}
        }
    }
}

impl Visit for CacheEventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_string(field, value.to_string());
    }

    // `%value` fields arrive here already Display-formatted
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record_string(field, format!("{value:?}"));
    }
}
