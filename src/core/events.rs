//! Semantic change notifications published by the diagram session
//!
//! Consumers (renderers, caches, the text editor) subscribe to an
//! [`EventBus`] instead of polling the model.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default event channel capacity
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum DiagramEvent {
    DiagramLoaded { diagram_id: Uuid },

    DiagramCleared { diagram_id: Uuid },

    DiagramDeleted { diagram_id: Uuid },

    DiagramRenamed { name: String },

    TablesAdded { table_ids: Vec<Uuid> },

    /// Also emitted for tables removed by a whole-state update
    TablesRemoved { table_ids: Vec<Uuid> },

    TableUpdated { table_id: Uuid },

    FieldAdded { table_id: Uuid, field_id: Uuid },

    FieldUpdated { table_id: Uuid, field_id: Uuid },

    FieldRemoved { table_id: Uuid, field_id: Uuid },

    IndexesChanged { table_id: Uuid },

    RelationshipsAdded { relationship_ids: Vec<Uuid> },

    RelationshipsRemoved { relationship_ids: Vec<Uuid> },

    RelationshipUpdated { relationship_id: Uuid },

    DependenciesAdded { dependency_ids: Vec<Uuid> },

    DependenciesRemoved { dependency_ids: Vec<Uuid> },

    DependencyUpdated { dependency_id: Uuid },

    /// Ask the view to bring a table into focus
    FocusTable { table_id: Uuid },
}

/// Broadcast channel of [`DiagramEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DiagramEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagramEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: DiagramEvent) {
        tracing::trace!(?event, "diagram event");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let table_id = Uuid::new_v4();

        bus.emit(DiagramEvent::TablesAdded {
            table_ids: vec![table_id],
        });
        bus.emit(DiagramEvent::FocusTable { table_id });

        assert_eq!(
            rx.recv().await.unwrap(),
            DiagramEvent::TablesAdded {
                table_ids: vec![table_id]
            }
        );
        assert_eq!(rx.recv().await.unwrap(), DiagramEvent::FocusTable { table_id });
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(DiagramEvent::DiagramRenamed {
            name: "x".to_string(),
        });
    }

    #[test]
    fn test_event_serialization() {
        let table_id = Uuid::nil();
        let json = serde_json::to_value(DiagramEvent::FieldRemoved {
            table_id,
            field_id: table_id,
        })
        .unwrap();
        assert_eq!(json["action"], "field_removed");
        assert_eq!(json["data"]["table_id"], table_id.to_string());
    }
}
