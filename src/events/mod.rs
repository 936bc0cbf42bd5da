//! Event system for session lifecycle notifications
//!
//! Coordinators publish state transitions, viewer churn and muxer
//! lifecycle events here; the `/api/ws/events` endpoint and tests subscribe.

pub mod types;

pub use types::SystemEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event bus for broadcasting system events
///
/// # Example
///
/// ```no_run
/// use jsmpeg_relay::events::{EventBus, SystemEvent};
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(SystemEvent::SessionStateChanged {
///     camera: "front-door".to_string(),
///     state: "active".to_string(),
/// });
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: SystemEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events
    ///
    /// Slow subscribers receive `Lagged` and miss events.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
