//! Event/status publisher
//!
//! Observers receive every [`MatchmakingEvent`] in the order the orchestrator
//! publishes it. Delivery works on a snapshot of the subscriber list taken
//! per event with no lock held, so an observer may subscribe or unsubscribe
//! from inside its own callback; removal takes effect from the next event.

use crate::types::{MatchmakingEvent, TicketResult, TransitionEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Consumer of matchmaking events
#[cfg_attr(test, mockall::automock)]
pub trait MatchmakingObserver: Send + Sync {
    fn on_event(&self, event: &MatchmakingEvent);

    /// Closed observers are pruned after the next delivery
    fn is_closed(&self) -> bool {
        false
    }
}

/// Handle returned by [`EventPublisher::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

type Subscriber = (SubscriptionHandle, Arc<dyn MatchmakingObserver>);

/// Fan-out of matchmaking events to registered observers
#[derive(Default)]
pub struct EventPublisher {
    subscribers: RwLock<Vec<Subscriber>>,
    next_handle: AtomicU64,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn MatchmakingObserver>) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subscribers.push((handle, observer));
        debug!("Observer {} subscribed", handle.id());
        handle
    }

    /// Subscribe an unbounded channel and return its receiving end
    pub fn subscribe_channel(
        &self,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<MatchmakingEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = self.subscribe(Arc::new(ChannelObserver::new(sender)));
        (handle, receiver)
    }

    /// Like [`subscribe_channel`](Self::subscribe_channel) but wrapped as a `Stream`
    pub fn subscribe_stream(
        &self,
    ) -> (
        SubscriptionHandle,
        UnboundedReceiverStream<MatchmakingEvent>,
    ) {
        let (handle, receiver) = self.subscribe_channel();
        (handle, UnboundedReceiverStream::new(receiver))
    }

    /// Remove an observer, returning whether it was subscribed
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != handle);
        let removed = subscribers.len() != before;
        if removed {
            debug!("Observer {} unsubscribed", handle.id());
        }
        removed
    }

    pub fn publish(&self, event: MatchmakingEvent) {
        let snapshot: Vec<Subscriber> = {
            let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            subscribers.clone()
        };

        let mut closed = Vec::new();
        for (handle, observer) in &snapshot {
            if !self.is_subscribed(*handle) {
                continue;
            }
            observer.on_event(&event);
            if observer.is_closed() {
                closed.push(*handle);
            }
        }

        for handle in closed {
            self.unsubscribe(handle);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    fn is_subscribed(&self, handle: SubscriptionHandle) -> bool {
        self.subscribers
            .read()
            .map(|subscribers| subscribers.iter().any(|(existing, _)| *existing == handle))
            .unwrap_or(false)
    }
}

/// Observer that forwards events into an unbounded channel
#[derive(Debug)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<MatchmakingEvent>,
}

impl ChannelObserver {
    pub fn new(sender: mpsc::UnboundedSender<MatchmakingEvent>) -> Self {
        Self { sender }
    }
}

impl MatchmakingObserver for ChannelObserver {
    fn on_event(&self, event: &MatchmakingEvent) {
        let _ = self.sender.send(event.clone());
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Observer that keeps every event it receives
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<MatchmakingEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MatchmakingEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn transitions(&self) -> Vec<TransitionEvent> {
        self.events()
            .iter()
            .filter_map(|event| event.as_transition().cloned())
            .collect()
    }

    pub fn results(&self) -> Vec<TicketResult> {
        self.events()
            .iter()
            .filter_map(|event| event.as_result().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl MatchmakingObserver for RecordingObserver {
    fn on_event(&self, event: &MatchmakingEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MatchmakingState;
    use crate::types::{TicketId, TransitionReason};
    use crate::utils::current_timestamp;
    use futures::StreamExt;

    fn transition(ticket_id: TicketId, to: MatchmakingState) -> MatchmakingEvent {
        MatchmakingEvent::Transition(TransitionEvent {
            ticket_id,
            from: MatchmakingState::Idle,
            to,
            reason: Some(TransitionReason::QuickMatchRequested),
            timestamp: current_timestamp(),
        })
    }

    #[test]
    fn test_observers_receive_identical_order() {
        let publisher = EventPublisher::new();
        let first = Arc::new(RecordingObserver::new());
        let second = Arc::new(RecordingObserver::new());
        publisher.subscribe(first.clone());
        publisher.subscribe(second.clone());

        let ticket = TicketId::new();
        publisher.publish(transition(ticket, MatchmakingState::Searching));
        publisher.publish(transition(ticket, MatchmakingState::Creating));

        assert_eq!(first.events(), second.events());
        let targets: Vec<_> = first.transitions().iter().map(|event| event.to).collect();
        assert_eq!(
            targets,
            vec![MatchmakingState::Searching, MatchmakingState::Creating]
        );
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let publisher = EventPublisher::new();
        let observer = Arc::new(RecordingObserver::new());
        let handle = publisher.subscribe(observer.clone());

        publisher.publish(transition(TicketId::new(), MatchmakingState::Searching));
        assert!(publisher.unsubscribe(handle));
        assert!(!publisher.unsubscribe(handle));
        publisher.publish(transition(TicketId::new(), MatchmakingState::Searching));

        assert_eq!(observer.len(), 1);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    struct SelfRemovingObserver {
        publisher: Arc<EventPublisher>,
        handle: Mutex<Option<SubscriptionHandle>>,
        seen: AtomicU64,
    }

    impl MatchmakingObserver for SelfRemovingObserver {
        fn on_event(&self, _event: &MatchmakingEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = self.handle.lock().unwrap().take() {
                self.publisher.unsubscribe(handle);
            }
        }
    }

    #[test]
    fn test_unsubscribe_during_delivery() {
        let publisher = Arc::new(EventPublisher::new());
        let observer = Arc::new(SelfRemovingObserver {
            publisher: publisher.clone(),
            handle: Mutex::new(None),
            seen: AtomicU64::new(0),
        });
        let handle = publisher.subscribe(observer.clone());
        *observer.handle.lock().unwrap() = Some(handle);
        let recorder = Arc::new(RecordingObserver::new());
        publisher.subscribe(recorder.clone());

        publisher.publish(transition(TicketId::new(), MatchmakingState::Searching));
        publisher.publish(transition(TicketId::new(), MatchmakingState::Searching));

        assert_eq!(observer.seen.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.len(), 2);
    }

    #[test]
    fn test_mock_observer_called_once_per_event() {
        let publisher = EventPublisher::new();
        let mut mock = MockMatchmakingObserver::new();
        mock.expect_on_event().times(2).return_const(());
        mock.expect_is_closed().return_const(false);
        publisher.subscribe(Arc::new(mock));

        publisher.publish(transition(TicketId::new(), MatchmakingState::Searching));
        publisher.publish(transition(TicketId::new(), MatchmakingState::Creating));
    }

    #[test]
    fn test_closed_channel_is_pruned() {
        let publisher = EventPublisher::new();
        let (_, receiver) = publisher.subscribe_channel();
        assert_eq!(publisher.subscriber_count(), 1);

        drop(receiver);
        publisher.publish(transition(TicketId::new(), MatchmakingState::Searching));
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_subscription() {
        let publisher = EventPublisher::new();
        let (_, mut stream) = publisher.subscribe_stream();
        let ticket = TicketId::new();

        publisher.publish(transition(ticket, MatchmakingState::Searching));

        let event = stream.next().await.unwrap();
        assert_eq!(event.ticket_id(), ticket);
    }
}
