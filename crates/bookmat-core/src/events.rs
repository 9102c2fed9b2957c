//! In-process event broadcast.
//!
//! Everything the external façade can observe flows through one bus:
//! motion progress, errors, card detections, authentication outcomes,
//! sensor and position snapshots. The bus is a `tokio` broadcast
//! channel: publishing never blocks, and subscribers that fall behind
//! or disappear are simply skipped.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::motion::MotionOp;
use crate::rfid::CardSource;
use crate::sensors::SensorSnapshot;

/// Default channel depth. Progress events are small; a lagging consumer
/// loses the oldest ones rather than stalling the mechanics.
pub const DEFAULT_CAPACITY: usize = 256;

/// Broadcast payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// One step of a motion algorithm.
    Progress {
        step: u32,
        total: u32,
        message: String,
        operation: MotionOp,
    },
    /// A motion algorithm failed.
    Error {
        code: u8,
        message: String,
        operation: Option<MotionOp>,
    },
    /// A card or tag appeared at one of the outside readers.
    CardDetected { uid: String, source: CardSource },
    /// Outcome of an authentication attempt.
    AuthResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Debounced limit-switch snapshot.
    Sensors { sensors: SensorSnapshot },
    /// Carriage and tray position.
    Position { x: i32, y: i32, tray: bool },
}

/// Cloneable handle over the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event. A bus with no live subscribers swallows it.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Subscribes from this point forward.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Live subscriber count, for diagnostics.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let bus = EventBus::default();
        for _ in 0..10_000 {
            bus.publish(Event::Position {
                x: 0,
                y: 0,
                tray: false,
            });
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        for step in 1..=5u32 {
            bus.publish(Event::Progress {
                step,
                total: 5,
                message: format!("step {step}"),
                operation: MotionOp::Take,
            });
        }
        for expected in 1..=5u32 {
            match rx.recv().await.unwrap() {
                Event::Progress { step, .. } => assert_eq!(step, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_ignored() {
        let bus = EventBus::default();
        let rx = bus.subscribe();
        drop(rx);
        bus.publish(Event::Position {
            x: 1,
            y: 2,
            tray: true,
        });
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn test_events_serialize_with_tags() {
        let json = serde_json::to_string(&Event::CardDetected {
            uid: "04AABBCC".into(),
            source: CardSource::Nfc,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"card_detected\""));
        assert!(json.contains("\"source\":\"nfc\""));
    }
}
