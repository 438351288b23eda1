// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Event Bus
//!
//! In-process publish/subscribe. Every registered subscriber owns a bounded
//! queue drained by its own task, so a subscriber observes events in
//! publish order and a slow subscriber never blocks the publisher.
//!
//! - `publish` enqueues without waiting. When a subscriber's queue is full
//!   the event is dropped for that subscriber (newest dropped) and a warning
//!   is logged.
//! - `publish_sync` waits for queue space and for every subscriber to finish
//!   handling the event. It must not be called from inside a subscriber.
//! - Global properties set with `set_global_property` are attached to every
//!   event published afterwards.

pub mod types;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

pub use types::{Event, EventPayload};

/// Capacity of each subscriber's queue.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn consume_event(&self, event: Arc<Event>);
}

/// Handle returned by `register`, used to remove the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Delivery {
    event: Arc<Event>,
    done: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Delivery>>,
    globals: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct EventPublisher {
    state: RwLock<BusState>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and start its delivery task.
    pub fn register(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriberId {
        let (tx, mut rx) = mpsc::channel::<Delivery>(SUBSCRIBER_QUEUE_CAPACITY);
        let id = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.next_id += 1;
            let id = SubscriberId(state.next_id);
            state.subscribers.insert(id, tx);
            id
        };

        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                subscriber.consume_event(delivery.event).await;
                if let Some(done) = delivery.done {
                    let _ = done.send(());
                }
            }
            tracing::debug!(subscriber = id.0, "Event subscriber stopped");
        });
        id
    }

    /// Remove a subscriber. Its task drains what is already queued, then exits.
    pub fn remove(&self, id: SubscriberId) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.subscribers.remove(&id);
    }

    pub fn set_global_property(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.globals.insert(key.into(), value.into());
    }

    pub fn subscriber_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.subscribers.len()
    }

    fn snapshot(&self, mut event: Event) -> (Arc<Event>, Vec<(SubscriberId, mpsc::Sender<Delivery>)>) {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        for (k, v) in &state.globals {
            event.globals.entry(k.clone()).or_insert_with(|| v.clone());
        }
        let subscribers = state
            .subscribers
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();
        (Arc::new(event), subscribers)
    }

    /// Fire-and-forget delivery to every subscriber.
    pub fn publish(&self, event: Event) {
        let (event, subscribers) = self.snapshot(event);
        tracing::debug!(event = %event.name, "Publishing event");
        for (id, tx) in subscribers {
            let delivery = Delivery {
                event: event.clone(),
                done: None,
            };
            match tx.try_send(delivery) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = id.0,
                        event = %event.name,
                        "Subscriber queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.remove(id);
                }
            }
        }
    }

    /// Deliver to every subscriber and wait until all have handled it.
    pub async fn publish_sync(&self, event: Event) {
        let (event, subscribers) = self.snapshot(event);
        tracing::debug!(event = %event.name, "Publishing event (sync)");
        let mut pending = Vec::with_capacity(subscribers.len());
        for (id, tx) in subscribers {
            let (done_tx, done_rx) = oneshot::channel();
            let delivery = Delivery {
                event: event.clone(),
                done: Some(done_tx),
            };
            if tx.send(delivery).await.is_err() {
                self.remove(id);
                continue;
            }
            pending.push(done_rx);
        }
        for done in pending {
            let _ = done.await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSubscriber;
    use super::*;
    use std::time::Duration;

    struct Blocking {
        release: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl EventSubscriber for Blocking {
        async fn consume_event(&self, _event: Arc<Event>) {
            if let Ok(permit) = self.release.acquire().await {
                permit.forget();
            }
        }
    }

    #[tokio::test]
    async fn sync_publish_preserves_order_and_globals() {
        let bus = EventPublisher::new();
        let recorder = Arc::new(RecordingSubscriber::default());
        bus.register(recorder.clone());
        bus.set_global_property("node_pubkey", "02ab");

        for i in 0..5 {
            bus.publish_sync(Event::named(format!("e{i}"))).await;
        }

        let events = recorder.events.lock().await;
        let names: Vec<_> = events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["e0", "e1", "e2", "e3", "e4"]);
        assert_eq!(events[0].globals.get("node_pubkey").map(String::as_str), Some("02ab"));
    }

    #[tokio::test]
    async fn full_queue_drops_for_slow_subscriber_only() {
        let bus = EventPublisher::new();
        let slow = Arc::new(Blocking {
            release: tokio::sync::Semaphore::new(0),
        });
        let recorder = Arc::new(RecordingSubscriber::default());
        bus.register(slow.clone());
        bus.register(recorder.clone());

        let total = SUBSCRIBER_QUEUE_CAPACITY + 50;
        for i in 0..total {
            bus.publish(Event::named(format!("e{i}")));
            tokio::task::yield_now().await;
        }
        // The recorder keeps up; give its task time to drain.
        for _ in 0..50 {
            if recorder.events.lock().await.len() == total {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.events.lock().await.len(), total);
        slow.release.add_permits(total);
    }

    #[tokio::test]
    async fn removed_subscribers_stop_receiving() {
        let bus = EventPublisher::new();
        let recorder = Arc::new(RecordingSubscriber::default());
        let id = bus.register(recorder.clone());
        bus.publish_sync(Event::named("before")).await;
        bus.remove(id);
        bus.publish_sync(Event::named("after")).await;
        assert_eq!(recorder.names().await, ["before"]);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
