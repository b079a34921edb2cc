use async_channel::{Receiver, Sender, TrySendError};

use crate::core::machine::MachineId;
use crate::core::tasks::Alert;

/// Default capacity of the event channel; events beyond it are dropped until observers catch up.
pub const EVENT_CAPACITY: usize = 256;

/// Observable change in library state.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ListChanged { generation: u64, len: usize },
    SelectionChanged { selected: Option<MachineId> },
    PendingChanged { len: usize },
    BusyChanged { busy: bool },
    AlertRaised(Alert),
}

/// Publishing side of the event stream. Never blocks the publisher.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: Option<Sender<Event>>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, Receiver<Event>) {
        let (sender, receiver) = async_channel::bounded(capacity.max(1));
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Sink that discards every event.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn publish(&self, event: Event) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => log::debug!("event channel full; dropped {event:?}"),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (sink, receiver) = EventSink::channel(1);
        sink.publish(Event::BusyChanged { busy: true });
        sink.publish(Event::BusyChanged { busy: false });
        assert_eq!(receiver.len(), 1);
        assert_eq!(
            receiver.try_recv().unwrap(),
            Event::BusyChanged { busy: true }
        );
    }

    #[test]
    fn disabled_sink_is_silent() {
        EventSink::disabled().publish(Event::PendingChanged { len: 0 });
    }
}
