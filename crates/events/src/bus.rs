//! Fan-out of captured cache events.
//!
//! [`StowageEventLayer`] writes into an unbounded intake so emitting a cache
//! event never blocks the spawn that emitted it. A forwarding task republishes
//! every event on a broadcast channel, one [`Subscription`] per consumer.

use crate::event::StowageEvent;
use crate::layer::StowageEventLayer;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};

/// Events a slow subscriber may fall behind before it starts skipping.
const FANOUT_CAPACITY: usize = 1024;

/// Broadcasts events captured by [`EventBus::layer`] to every subscription.
///
/// Must be created inside a tokio runtime.
#[derive(Debug)]
pub struct EventBus {
    intake: Mutex<Option<mpsc::UnboundedSender<StowageEvent>>>,
    fanout: broadcast::Sender<StowageEvent>,
}

impl EventBus {
    /// Create a bus with the default fan-out capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(FANOUT_CAPACITY)
    }

    /// Create a bus whose subscriptions buffer at most `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (intake, mut captured) = mpsc::unbounded_channel();
        let (fanout, _) = broadcast::channel(capacity);

        let forward = fanout.clone();
        tokio::spawn(async move {
            while let Some(event) = captured.recv().await {
                // nobody listening yet
                let _ = forward.send(event);
            }
        });

        Self {
            intake: Mutex::new(Some(intake)),
            fanout,
        }
    }

    /// A tracing layer feeding this bus, or `None` once the bus is closed.
    #[must_use]
    pub fn layer(&self) -> Option<StowageEventLayer> {
        let intake = self.intake.lock().ok()?;
        intake.as_ref().map(|tx| StowageEventLayer::new(tx.clone()))
    }

    /// Stop handing out layers. The forwarder exits once every layer
    /// already installed has been dropped.
    pub fn close(&self) {
        if let Ok(mut intake) = self.intake.lock() {
            intake.take();
        }
    }

    /// Receive every event captured after this call.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            events: self.fanout.subscribe(),
            missed: 0,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One consumer's view of an [`EventBus`].
#[derive(Debug)]
pub struct Subscription {
    events: broadcast::Receiver<StowageEvent>,
    missed: u64,
}

impl Subscription {
    /// Wait for the next event. A subscription that fell behind skips ahead
    /// to the oldest event still buffered. `None` once the bus is dropped.
    pub async fn next(&mut self) -> Option<StowageEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => self.missed += skipped,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events skipped because this subscription fell behind
    #[must_use]
    pub fn missed(&self) -> u64 {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CacheEvent;
    use crate::emit_cache_warning;
    use tracing_subscriber::layer::SubscriberExt;

    fn message(event: StowageEvent) -> String {
        match event.event {
            CacheEvent::Warning { message, .. } => message,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_every_subscription_sees_events_in_order() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let subscriber = tracing_subscriber::registry().with(bus.layer());

        tracing::subscriber::with_default(subscriber, || {
            emit_cache_warning!("cc", "one");
            emit_cache_warning!("cc", "two");
        });

        for sub in [&mut first, &mut second] {
            assert_eq!(message(sub.next().await.unwrap()), "one");
            assert_eq!(message(sub.next().await.unwrap()), "two");
            assert_eq!(sub.missed(), 0);
        }
    }

    #[tokio::test]
    async fn test_lagging_subscription_skips_to_newest() {
        let bus = EventBus::with_capacity(2);
        let mut sub = bus.subscribe();
        let subscriber = tracing_subscriber::registry().with(bus.layer());

        tracing::subscriber::with_default(subscriber, || {
            for n in 1..=5 {
                emit_cache_warning!("cc", n.to_string());
            }
        });

        assert_eq!(message(sub.next().await.unwrap()), "4");
        assert_eq!(message(sub.next().await.unwrap()), "5");
        assert_eq!(sub.missed(), 3);
    }

    #[tokio::test]
    async fn test_closed_bus_hands_out_no_layer() {
        let bus = EventBus::new();
        assert!(bus.layer().is_some());
        bus.close();
        bus.close();
        assert!(bus.layer().is_none());
    }
}
