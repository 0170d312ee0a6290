//! Engine notifications for the UI side
//!
//! The engine publishes into a bounded crossbeam channel with `try_send`, so
//! a slow or absent subscriber never stalls the mix worker or the controller.
//! Every [`Engine::subscribe`](super::Engine::subscribe) call gets its own
//! channel; full channels drop the event.

use std::sync::{Mutex, MutexGuard};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use super::EngineState;
use crate::audio::{AudioError, DeviceId, ErrorKind};

/// Events queued per subscriber before new ones are dropped
pub const EVENT_CAPACITY: usize = 256;

/// Something the UI may want to react to
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged(EngineState),
    InputDeviceSelected {
        slot: usize,
        device: Option<DeviceId>,
    },
    OutputDeviceSelected {
        slot: usize,
        device: Option<DeviceId>,
    },
    /// Left/right RMS of every input and output, in slot order
    LevelsUpdated {
        inputs: Vec<(f32, f32)>,
        outputs: Vec<(f32, f32)>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl EngineEvent {
    pub fn error(err: &AudioError) -> Self {
        EngineEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Fan-out of engine events to any number of subscribers
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Sender<EngineEvent>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = channel::bounded(EVENT_CAPACITY);
        self.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber without blocking
    ///
    /// Subscribers whose receiver was dropped are forgotten.
    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(EngineEvent::StateChanged(EngineState::Running));

        assert_eq!(a.try_recv().unwrap(), EngineEvent::StateChanged(EngineState::Running));
        assert_eq!(b.try_recv().unwrap(), EngineEvent::StateChanged(EngineState::Running));
    }

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        for _ in 0..EVENT_CAPACITY + 10 {
            bus.publish(EngineEvent::StateChanged(EngineState::Idle));
        }
        assert_eq!(rx.len(), EVENT_CAPACITY);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(bus.subscribe());
        bus.publish(EngineEvent::StateChanged(EngineState::Starting));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_error_event_carries_kind() {
        let err = AudioError::DeviceBusy("hw:0".into());
        match EngineEvent::error(&err) {
            EngineEvent::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::StreamOpenFailure);
                assert!(message.contains("hw:0"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
