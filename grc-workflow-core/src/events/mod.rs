pub mod types;

use tokio::sync::broadcast;

use crate::events::types::Event;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self { sender }
    }

    /// Publishing without subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(4);
        let mut receiver = bus.subscribe();
        let workflow_id = Uuid::new_v4();
        bus.publish(Event::DefinitionChanged { workflow_id });

        match receiver.recv().await.expect("event") {
            Event::DefinitionChanged { workflow_id: id } => assert_eq!(id, workflow_id),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
