//! Public handle to a matchmaking actor

use crate::adapter::SessionAdapter;
use crate::backend::SessionBackend;
use crate::config::MatchmakingConfig;
use crate::error::{MatchmakingError, Result};
use crate::events::{EventPublisher, MatchmakingObserver, SubscriptionHandle};
use crate::metrics::MetricsCollector;
use crate::orchestrator::actor::{ActorMessage, Command, MatchmakingActor, PendingLeave, Reply};
use crate::types::{
    Attributes, MatchmakingEvent, MatchmakingStatus, OrderingPreference, SessionDescriptor,
    SessionRoster, TicketId,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Ordering used by [`Matchmaker::start_quick_match`]
pub fn default_ordering() -> Vec<OrderingPreference> {
    vec![OrderingPreference::MostPopulated]
}

/// Clone-able handle to the matchmaking actor of one local player.
///
/// Operations return as soon as the actor has accepted or rejected the
/// intent; progress and outcomes are reported through subscribed observers.
#[derive(Clone)]
pub struct Matchmaker {
    sender: mpsc::UnboundedSender<ActorMessage>,
    publisher: Arc<EventPublisher>,
    metrics: Arc<MetricsCollector>,
}

impl Matchmaker {
    /// Spawn an actor on the current tokio runtime
    pub fn new(backend: Arc<dyn SessionBackend>, config: MatchmakingConfig) -> Result<Self> {
        let metrics = Arc::new(MetricsCollector::new()?);
        Ok(Self::with_components(
            backend,
            config,
            Arc::new(EventPublisher::new()),
            metrics,
        ))
    }

    pub fn with_components(
        backend: Arc<dyn SessionBackend>,
        config: MatchmakingConfig,
        publisher: Arc<EventPublisher>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let adapter = SessionAdapter::new(backend).with_metrics(metrics.clone());
        let (sender, receiver) = mpsc::unbounded_channel();
        let actor = MatchmakingActor::new(
            adapter,
            publisher.clone(),
            metrics.clone(),
            config,
            receiver,
            sender.downgrade(),
        );
        tokio::spawn(actor.run());

        Self {
            sender,
            publisher,
            metrics,
        }
    }

    /// Search with the default ordering, join the best candidate, fall back to creating
    pub async fn start_quick_match(&self, filters: Attributes) -> Result<TicketId> {
        self.start_quick_match_ordered(filters, default_ordering())
            .await
    }

    pub async fn start_quick_match_ordered(
        &self,
        filters: Attributes,
        ordering: Vec<OrderingPreference>,
    ) -> Result<TicketId> {
        self.request(|reply| Command::StartQuickMatch {
            filters,
            ordering,
            reply,
        })
        .await
    }

    /// Create a session directly; `None` uses the configured default capacity
    pub async fn create_session(
        &self,
        attributes: Attributes,
        capacity: Option<u32>,
    ) -> Result<TicketId> {
        self.request(|reply| Command::CreateSession {
            attributes,
            capacity,
            reply,
        })
        .await
    }

    pub async fn cancel(&self, ticket_id: TicketId) -> Result<()> {
        self.request(|reply| Command::Cancel { ticket_id, reply })
            .await
    }

    pub async fn leave_current_session(&self) -> Result<PendingLeave> {
        self.request(|reply| Command::Leave { reply }).await
    }

    /// Clear a `Failed` ticket so a new intent can start
    pub async fn acknowledge_failure(&self) -> Result<()> {
        self.request(|reply| Command::AcknowledgeFailure { reply })
            .await
    }

    /// Update attributes of the hosted session, resolving once the backend answers
    pub async fn update_session_attributes(
        &self,
        attributes: Attributes,
    ) -> Result<SessionDescriptor> {
        self.request(|reply| Command::UpdateAttributes { attributes, reply })
            .await
    }

    /// Members of the current session and their ready flags
    pub async fn session_members(&self) -> Result<SessionRoster> {
        self.request(|reply| Command::Members { reply }).await
    }

    /// Set the local player's ready flag in the current session.
    ///
    /// Observers get `AllPlayersReady` once every member is ready.
    pub async fn set_ready(&self, ready: bool) -> Result<SessionRoster> {
        self.request(|reply| Command::SetReady { ready, reply })
            .await
    }

    /// Publish the game server address of the hosted session
    pub async fn set_session_address(&self, address: impl Into<String>) -> Result<SessionRoster> {
        let address = address.into();
        self.request(|reply| Command::SetSessionAddress { address, reply })
            .await
    }

    pub async fn current_status(&self) -> Result<MatchmakingStatus> {
        let (reply, receiver) = oneshot::channel();
        self.send(Command::Status { reply })?;
        receiver.await.map_err(|_| MatchmakingError::ShutDown.into())
    }

    pub fn subscribe(&self, observer: Arc<dyn MatchmakingObserver>) -> SubscriptionHandle {
        self.publisher.subscribe(observer)
    }

    pub fn subscribe_channel(
        &self,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<MatchmakingEvent>) {
        self.publisher.subscribe_channel()
    }

    pub fn subscribe_stream(
        &self,
    ) -> (
        SubscriptionHandle,
        UnboundedReceiverStream<MatchmakingEvent>,
    ) {
        self.publisher.subscribe_stream()
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.publisher.unsubscribe(handle)
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    /// Stop the actor and cancel outstanding adapter requests
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, receiver) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_err() {
            return Ok(());
        }
        let _ = receiver.await;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, receiver) = oneshot::channel();
        self.send(build(reply))?;
        receiver
            .await
            .map_err(|_| anyhow::Error::from(MatchmakingError::ShutDown))?
    }

    fn send(&self, command: Command) -> Result<()> {
        self.sender
            .send(ActorMessage::Command(command))
            .map_err(|_| MatchmakingError::ShutDown.into())
    }
}
