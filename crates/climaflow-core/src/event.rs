/*!
 * Event bus for ClimaFlow.
 *
 * A thin typed wrapper over a tokio broadcast channel. Publishers never
 * block and never fail because nobody is listening; slow subscribers lose
 * the oldest events.
 */
use std::fmt::Debug;

use tokio::sync::broadcast;
use tracing::trace;

/// Maximum number of events that can be buffered in a channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast bus for one event type
#[derive(Debug, Clone)]
pub struct EventBus<E: Clone + Debug + Send + 'static> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Debug + Send + 'static> EventBus<E> {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event, returning how many subscribers received it
    pub fn publish(&self, event: E) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => {
                trace!("Published event to {} receivers", receivers);
                receivers
            }
            // Only fails when there are no receivers.
            Err(_) => 0,
        }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone + Debug + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[derive(Debug, Clone, PartialEq)]
    struct TestEvent {
        id: u32,
        message: String,
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let event = TestEvent {
            id: 1,
            message: "status changed".to_string(),
        };

        assert_eq!(bus.publish(event.clone()), 1);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus: EventBus<TestEvent> = EventBus::with_capacity(4);
        let delivered = bus.publish(TestEvent {
            id: 2,
            message: "nobody listens".to_string(),
        });
        assert_eq!(delivered, 0);
        assert_eq!(bus.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_publish() {
        const NUM_PUBLISHERS: usize = 8;
        const EVENTS_PER_PUBLISHER: usize = 10;

        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let barrier = Arc::new(Barrier::new(NUM_PUBLISHERS));

        let mut handles = Vec::with_capacity(NUM_PUBLISHERS);
        for publisher_id in 0..NUM_PUBLISHERS {
            let bus = bus.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                for i in 0..EVENTS_PER_PUBLISHER {
                    bus.publish(TestEvent {
                        id: (publisher_id * EVENTS_PER_PUBLISHER + i) as u32,
                        message: format!("publisher {}", publisher_id),
                    });
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, NUM_PUBLISHERS * EVENTS_PER_PUBLISHER);
    }
}
