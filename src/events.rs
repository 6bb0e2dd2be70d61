//! Informational notifications about inventory and settlement changes.
//!
//! Publishing never blocks and never fails the caller: with no subscribers the
//! event is dropped, and slow subscribers observe `Lagged` on their receiver.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::model::{ReservationId, ResourceId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InventoryEvent {
    Reserved {
        reservation: ReservationId,
        resource: ResourceId,
        quantity: u32,
    },
    LedgerChanged {
        resource: ResourceId,
        available: u32,
    },
    SettlementCompleted {
        reservation: ReservationId,
    },
    SettlementFailed {
        reservation: ReservationId,
        reason: String,
    },
    ReservationCancelled {
        reservation: ReservationId,
        resource: ResourceId,
        quantity: u32,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<InventoryEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InventoryEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: InventoryEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            trace!(?event, "no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let event = InventoryEvent::SettlementCompleted {
            reservation: Uuid::new_v4(),
        };
        bus.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new(1);
        bus.publish(InventoryEvent::LedgerChanged {
            resource: "concert".into(),
            available: 3,
        });
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&InventoryEvent::LedgerChanged {
            resource: "concert".into(),
            available: 3,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"ledger_changed","resource":"concert","available":3}"#
        );
    }
}
