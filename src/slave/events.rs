use chrono::{DateTime, Local};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::slave::state::ControllerState;

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    StateChanged {
        old: ControllerState,
        new: ControllerState,
    },
    PositionChanged(f64),
    /// Sent as soon as a seek is written, before the player confirms it
    SeekedTo(f64),
    LoadDone,
    Error(String),
    ErrorAtPosition {
        reason: String,
        position: Option<f64>,
    },
    GiveUp {
        crashes: u32,
    },
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub controller_id: Uuid,
    pub at: DateTime<Local>,
    pub event: ControllerEvent,
}

/// Fan-out of controller notifications. Sending with no subscriber is fine.
#[derive(Debug, Clone)]
pub struct EventBus {
    controller_id: Uuid,
    sender: broadcast::Sender<Notification>,
}

impl EventBus {
    pub fn new(controller_id: Uuid, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { controller_id, sender }
    }

    pub fn controller_id(&self) -> Uuid {
        self.controller_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ControllerEvent) {
        log::debug!("[{}] event: {:?}", short_id(self.controller_id), event);
        let notification = Notification {
            controller_id: self.controller_id,
            at: Local::now(),
            event,
        };
        // No receivers is not an error
        let _ = self.sender.send(notification);
    }
}

/// First block of the uuid, used as a log prefix.
pub fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribers_receive_wrapped_events() {
        let id = Uuid::new_v4();
        let bus = EventBus::new(id, 8);
        let mut rx = bus.subscribe();

        bus.emit(ControllerEvent::LoadDone);
        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.controller_id, id);
        assert_eq!(notification.event, ControllerEvent::LoadDone);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(Uuid::new_v4(), 8);
        bus.emit(ControllerEvent::PositionChanged(1.0));
        assert_eq!(short_id(bus.controller_id()).len(), 8);
    }
}
