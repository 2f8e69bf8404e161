use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Span;

const CHANNEL_CAPACITY: usize = 256;

/// Facts the notification collaborator cares about. The engine publishes,
/// fire-and-forget; delivery, retry, and rendering are someone else's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    BookingPending {
        booking_id: Ulid,
        client_name: String,
        span: Span,
    },
    RoomAssigned {
        booking_id: Ulid,
        room_id: Ulid,
        override_used: bool,
    },
    BookingRejected {
        booking_id: Ulid,
        reason: String,
    },
    /// An assignment failed on conflict and no substitute device exists.
    DeviceConflictNoAlternative {
        booking_id: Ulid,
        category: String,
        span: Span,
    },
    StockLow {
        category: String,
        available: u32,
        threshold: u32,
    },
    RentalOverdue {
        assignment_id: Ulid,
        device_id: Ulid,
        rental_no: String,
        expected_return: i64,
    },
}

/// Single broadcast channel for all domain events. Subscribers filter;
/// publishing when nobody listens is a no-op.
pub struct EventHub {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: DomainEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();

        let event = DomainEvent::BookingPending {
            booking_id: Ulid::new(),
            client_name: "Acme".into(),
            span: Span::new(100, 200),
        };
        hub.publish(event.clone());

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = EventHub::new();
        hub.publish(DomainEvent::StockLow {
            category: "Laptop".into(),
            available: 2,
            threshold: 5,
        });
    }

    #[test]
    fn wire_shape_is_tagged() {
        let event = DomainEvent::RoomAssigned {
            booking_id: Ulid::new(),
            room_id: Ulid::new(),
            override_used: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "room_assigned");
        assert_eq!(json["override_used"], true);
    }
}
