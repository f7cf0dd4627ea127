//! Live-notification fan-out.
//!
//! Optional push of the event stream to in-process subscribers. A slow or
//! disconnected subscriber never blocks execution: sends are fire-and-forget
//! over bounded queues, and overflow drops the event (counted, logged at
//! debug). The transport beyond these receivers is someone else's problem.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};

use tracing::debug;

use crate::io::event_log::Event;

/// A live subscription. Dropping the receiver detaches it on the next publish.
pub struct Subscription {
    pub id: u64,
    pub receiver: Receiver<Event>,
}

struct Subscriber {
    id: u64,
    sender: SyncSender<Event>,
}

/// Bounded, drop-on-overflow event fan-out.
pub struct Notifier {
    queue_capacity: usize,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    dropped: AtomicUsize,
}

impl Notifier {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicUsize::new(0),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = sync_channel(self.queue_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("notifier lock poisoned")
            .push(Subscriber { id, sender });
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("notifier lock poisoned")
            .retain(|sub| sub.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("notifier lock poisoned").len()
    }

    /// Events dropped because a subscriber queue was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Push one event to every subscriber without ever blocking.
    pub fn publish(&self, event: &Event) {
        let mut subscribers = self.subscribers.lock().expect("notifier lock poisoned");
        subscribers.retain(|sub| match sub.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(subscriber = sub.id, "notification queue full, dropping event");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(ts_ms: i64) -> Event {
        Event {
            ts_ms,
            task_id: "t1".to_string(),
            kind: "output_chunk".to_string(),
            payload: json!({}),
        }
    }

    #[test]
    fn subscriber_receives_published_events() {
        let notifier = Notifier::new(8);
        let sub = notifier.subscribe();
        notifier.publish(&event(1));
        assert_eq!(sub.receiver.recv().expect("recv").ts_ms, 1);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let notifier = Notifier::new(2);
        let sub = notifier.subscribe();
        for i in 0..5 {
            notifier.publish(&event(i));
        }
        assert_eq!(notifier.dropped(), 3);
        // The two oldest events are retained; the rest were dropped.
        assert_eq!(sub.receiver.recv().expect("recv").ts_ms, 0);
        assert_eq!(sub.receiver.recv().expect("recv").ts_ms, 1);
    }

    #[test]
    fn dropped_receiver_is_detached_on_next_publish() {
        let notifier = Notifier::new(2);
        let sub = notifier.subscribe();
        drop(sub.receiver);
        notifier.publish(&event(1));
        assert_eq!(notifier.subscriber_count(), 0);
    }
}
