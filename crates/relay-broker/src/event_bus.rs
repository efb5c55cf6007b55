use std::collections::VecDeque;
use std::sync::Mutex;

use relay_types::Event;
use tokio::sync::broadcast;

const DEFAULT_REPLAY_CAPACITY: usize = 256;

/// Fan-out for every [`Event`] the broker produces. New subscribers miss
/// whatever was broadcast before they subscribed, so a bounded replay ring
/// is kept alongside the channel for callers (the protocol stream's
/// `get_recent_events` method, the trajectory recorder catching up a late
/// joiner) that need a bit of history rather than only the live stream.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    replay: Mutex<VecDeque<Event>>,
    replay_capacity: usize,
}

impl EventBus {
    pub fn new(channel_capacity: usize) -> Self {
        Self::with_replay_capacity(channel_capacity, DEFAULT_REPLAY_CAPACITY)
    }

    pub fn with_replay_capacity(channel_capacity: usize, replay_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity);
        Self {
            sender,
            replay: Mutex::new(VecDeque::with_capacity(replay_capacity)),
            replay_capacity,
        }
    }

    /// Publish an event to every live subscriber and the replay ring. A send
    /// with no subscribers is not an error — events are fire-and-forget.
    pub fn publish(&self, event: Event) {
        let mut replay = self.replay.lock().expect("event bus replay lock poisoned");
        if replay.len() >= self.replay_capacity {
            replay.pop_front();
        }
        replay.push_back(event.clone());
        drop(replay);

        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Snapshot of the most recently published events, oldest first.
    pub fn recent(&self) -> Vec<Event> {
        self.replay
            .lock()
            .expect("event bus replay lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(Event::Warning {
            message: "hi".into(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::Warning { .. }));
    }

    #[test]
    fn replay_ring_is_bounded() {
        let bus = EventBus::with_replay_capacity(16, 2);
        for i in 0..5 {
            bus.publish(Event::Warning {
                message: format!("{i}"),
            });
        }
        assert_eq!(bus.recent().len(), 2);
    }
}
