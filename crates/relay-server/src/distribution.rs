//! Message distribution: turning client requests into broker publishes, and
//! broker records into local deliveries.
//!
//! Routing:
//!
//! | request                 | topics                                   | publish |
//! |-------------------------|------------------------------------------|---------|
//! | chat, `private`         | `private-<receiver>`                     | sync    |
//! | chat, `group`           | `private-<member>` for every group member | sync    |
//! | chat, `system`          | `global-0`                               | sync    |
//! | typing                  | `private-<receiver>` or other members    | async   |
//! | status change           | `status-0`                               | queued  |
//!
//! Chat events are persisted before anything is published; an event that
//! could not be stored is never announced.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex as SyncMutex;
use relay_broker::{BrokerMessage, FanoutAdapter, MessageHandler};
use relay_core::chat::{
    ChatEvent, ChatEventView, ChatRequest, ChatTarget, SenderProfile, TypingNotice, TypingRequest,
    UserStatus,
};
use relay_core::ids::{MessageId, UserId};
use relay_core::{Envelope, EnvelopeType, RelayError, Topic};
use relay_store::ChatStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::auth::Identity;
use crate::connection::Frame;
use crate::metrics::{CHAT_FAILURES_TOTAL, CHAT_MESSAGES_TOTAL};
use crate::registry::{ConnectionRegistry, StatusNotifier};

/// Serialize an envelope for the wire and the broker.
fn encode(kind: EnvelopeType, content: &impl serde::Serialize) -> Result<Bytes, RelayError> {
    Ok(Bytes::from(Envelope::new(kind, content)?.encode()?))
}

/// The `error` envelope sent back to a client for `err`, if it is one the
/// client should see.
pub fn error_frame(err: &RelayError) -> Option<Frame> {
    if !err.is_client_visible() {
        return None;
    }
    Envelope::error(err.code(), err.to_string())
        .encode()
        .ok()
        .map(Frame::from)
}

/// Builds, persists and publishes events on behalf of connected users.
pub struct Distributor {
    store: Arc<dyn ChatStore>,
    adapter: FanoutAdapter,
}

impl Distributor {
    /// Create a distributor.
    pub fn new(store: Arc<dyn ChatStore>, adapter: FanoutAdapter) -> Self {
        Self { store, adapter }
    }

    /// Route one decoded client envelope.
    #[instrument(skip_all, fields(user_id = %sender.user_id, kind = envelope.kind().as_str()))]
    pub async fn handle_inbound(&self, sender: &Identity, envelope: Envelope) -> Result<(), RelayError> {
        match envelope.kind() {
            EnvelopeType::ChatMessage => {
                let request: ChatRequest = envelope.content_as()?;
                let _ = self.send_chat(sender, &request).await?;
                Ok(())
            }
            EnvelopeType::Typing => {
                let request: TypingRequest = envelope.content_as()?;
                self.send_typing(sender, &request).await
            }
            other => Err(RelayError::InvalidRequest(format!(
                "clients may not send {} envelopes",
                other.as_str()
            ))),
        }
    }

    /// Persist a chat event and publish it to every recipient topic.
    ///
    /// On a publish failure the event stays persisted and the error carries
    /// its id.
    pub async fn send_chat(&self, sender: &Identity, request: &ChatRequest) -> Result<MessageId, RelayError> {
        let result = self.send_chat_inner(sender, request).await;
        match &result {
            Ok(_) => counter!(CHAT_MESSAGES_TOTAL, "kind" => request.kind.as_str()).increment(1),
            Err(e) => counter!(CHAT_FAILURES_TOTAL, "code" => e.code()).increment(1),
        }
        result
    }

    async fn send_chat_inner(&self, sender: &Identity, request: &ChatRequest) -> Result<MessageId, RelayError> {
        let target = request.target()?;
        let event = ChatEvent::from_request(sender.user_id, request);
        let id = self
            .store
            .save_chat_event(&event)
            .await
            .map_err(|e| RelayError::PersistenceFailure(e.to_string()))?;

        let view = ChatEventView::resolve(id, &event, self.sender_profile(sender).await);
        let payload = encode(EnvelopeType::ChatMessage, &view)?;
        let topics = self.topics_for(target, None).await.map_err(|e| RelayError::BrokerUnavailable {
            reason: e.to_string(),
            message_id: Some(id),
        })?;

        let mut first_error = None;
        for topic in &topics {
            let name = self.adapter.topic_name(topic);
            if let Err(e) = self
                .adapter
                .publish_sync(&name, &topic.partition_key(), payload.clone())
                .await
            {
                warn!(message_id = %id, topic = %name, error = %e, "chat publish failed");
                let _ = first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(RelayError::BrokerUnavailable {
                reason: e.to_string(),
                message_id: Some(id),
            });
        }
        debug!(message_id = %id, recipients = topics.len(), "chat published");
        Ok(id)
    }

    /// Publish a typing indicator. Never waits for the broker.
    pub async fn send_typing(&self, sender: &Identity, request: &TypingRequest) -> Result<(), RelayError> {
        let target = request.target()?;
        let notice = TypingNotice {
            sender_id: sender.user_id,
            username: sender.display_name.clone(),
            receiver_id: request.receiver_id,
            group_id: request.group_id,
        };
        let payload = encode(EnvelopeType::Typing, &notice)?;
        let topics = match self.topics_for(target, Some(sender.user_id)).await {
            Ok(topics) => topics,
            Err(e) => {
                warn!(user_id = %sender.user_id, error = %e, "typing recipients lookup failed");
                return Ok(());
            }
        };
        for topic in topics {
            self.adapter
                .publish_async(&self.adapter.topic_name(&topic), &topic.partition_key(), payload.clone());
        }
        Ok(())
    }

    async fn sender_profile(&self, sender: &Identity) -> SenderProfile {
        match self.store.get_user_by_id(sender.user_id).await {
            Ok(Some(profile)) => SenderProfile {
                id: profile.id,
                username: profile.username,
                avatar: profile.avatar,
                online: true,
            },
            Ok(None) => fallback_profile(sender),
            Err(e) => {
                warn!(user_id = %sender.user_id, error = %e, "sender lookup failed");
                fallback_profile(sender)
            }
        }
    }

    /// Recipient topics for `target`; `exclude` drops one group member.
    async fn topics_for(
        &self,
        target: ChatTarget,
        exclude: Option<UserId>,
    ) -> Result<Vec<Topic>, relay_store::StoreError> {
        Ok(match target {
            ChatTarget::User(user) => vec![Topic::private(user)],
            ChatTarget::Group(group) => self
                .store
                .get_group_members(group)
                .await?
                .into_iter()
                .filter(|m| Some(*m) != exclude)
                .map(Topic::private)
                .collect(),
            ChatTarget::Everyone => vec![Topic::global()],
        })
    }
}

fn fallback_profile(sender: &Identity) -> SenderProfile {
    SenderProfile {
        id: sender.user_id,
        username: sender.display_name.clone(),
        avatar: String::new(),
        online: true,
    }
}

/// Publishes registry presence transitions to the status topic.
///
/// Transitions are queued and published one at a time by a single worker,
/// so they reach `status-0` in the order the registry produced them.
pub struct StatusPublisher {
    adapter: FanoutAdapter,
    queue: mpsc::UnboundedSender<UserStatus>,
    /// Taken by the first call, which starts the worker.
    pending: SyncMutex<Option<mpsc::UnboundedReceiver<UserStatus>>>,
}

impl StatusPublisher {
    /// Create a publisher.
    pub fn new(adapter: FanoutAdapter) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        Self {
            adapter,
            queue,
            pending: SyncMutex::new(Some(rx)),
        }
    }

    fn ensure_worker(&self) {
        let Some(rx) = self.pending.lock().take() else {
            return;
        };
        let adapter = self.adapter.clone();
        self.adapter
            .spawn_tracked(move |cancel| publish_in_order(adapter, rx, cancel));
    }
}

#[async_trait]
impl StatusNotifier for StatusPublisher {
    async fn user_status(&self, status: UserStatus) {
        self.ensure_worker();
        if self.queue.send(status).is_err() {
            debug!("status worker gone, dropping status");
        }
    }
}

/// Drains `rx` onto the status topic. On cancellation, whatever is already
/// queued is still published.
async fn publish_in_order(
    adapter: FanoutAdapter,
    mut rx: mpsc::UnboundedReceiver<UserStatus>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(status) => publish_status(&adapter, &status).await,
                None => break,
            },
            () = cancel.cancelled() => {
                while let Ok(status) = rx.try_recv() {
                    publish_status(&adapter, &status).await;
                }
                break;
            }
        }
    }
}

async fn publish_status(adapter: &FanoutAdapter, status: &UserStatus) {
    let payload = match encode(EnvelopeType::UserStatus, status) {
        Ok(p) => p,
        Err(e) => {
            warn!(user_id = %status.user_id, error = %e, "status encode failed");
            return;
        }
    };
    let topic = Topic::status();
    if let Err(e) = adapter
        .publish_sync(&adapter.topic_name(&topic), &topic.partition_key(), payload)
        .await
    {
        warn!(user_id = %status.user_id, error = %e, "status publish failed");
    }
}

fn frame_from(message: &BrokerMessage) -> Option<Frame> {
    match std::str::from_utf8(&message.payload) {
        Ok(text) if Envelope::decode(text.as_bytes()).is_ok() => Some(Frame::from(text)),
        _ => {
            warn!(topic = %message.topic, offset = message.offset, "dropping malformed broker record");
            None
        }
    }
}

/// Delivers records of one `private-<user>` topic to that user's local
/// connection, if any.
pub struct PrivateDelivery {
    registry: Arc<ConnectionRegistry>,
    user: UserId,
}

impl PrivateDelivery {
    /// Handler for `user`'s private topic.
    pub fn new(registry: Arc<ConnectionRegistry>, user: UserId) -> Arc<dyn MessageHandler> {
        Arc::new(Self { registry, user })
    }
}

#[async_trait]
impl MessageHandler for PrivateDelivery {
    async fn handle(&self, message: BrokerMessage) {
        if let Some(frame) = frame_from(&message) {
            let delivered = self.registry.deliver(self.user, frame).await;
            debug!(user_id = %self.user, delivered, "private record handled");
        }
    }
}

/// Delivers records of a broadcast topic (`global-0`, `status-0`) to every
/// local connection.
pub struct LocalBroadcast {
    registry: Arc<ConnectionRegistry>,
}

impl LocalBroadcast {
    /// Handler broadcasting to all of `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Arc<dyn MessageHandler> {
        Arc::new(Self { registry })
    }
}

#[async_trait]
impl MessageHandler for LocalBroadcast {
    async fn handle(&self, message: BrokerMessage) {
        if let Some(frame) = frame_from(&message) {
            let delivered = self.registry.broadcast(frame).await;
            debug!(topic = %message.topic, delivered, "broadcast record handled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use mockall::mock;
    use relay_broker::{AdapterConfig, MemoryBroker};
    use relay_core::chat::{ChatKind, PresenceStatus, UserProfile};
    use relay_core::ids::GroupId;
    use relay_core::retry::RetryConfig;
    use relay_store::{MemoryStore, StoreError};
    use std::time::Duration;
    use tokio::time::timeout;

    mock! {
        pub Store {}

        #[async_trait]
        impl ChatStore for Store {
            async fn save_chat_event(&self, event: &ChatEvent) -> Result<MessageId, StoreError>;
            async fn get_user_by_id(&self, id: UserId) -> Result<Option<UserProfile>, StoreError>;
            async fn get_group_members(&self, group: relay_core::ids::GroupId) -> Result<Vec<UserId>, StoreError>;
        }
    }

    fn adapter(broker: &MemoryBroker) -> FanoutAdapter {
        FanoutAdapter::new(
            Arc::new(broker.clone()),
            AdapterConfig {
                publish_retry: RetryConfig {
                    max_retries: 1,
                    base_delay_ms: 1,
                    max_delay_ms: 1,
                    jitter_factor: 0.0,
                },
                ..AdapterConfig::default()
            },
        )
    }

    fn alice() -> Identity {
        Identity {
            user_id: UserId(1),
            display_name: "alice-token".into(),
        }
    }

    fn private_to(receiver: u64, content: &str) -> ChatRequest {
        ChatRequest {
            content: content.into(),
            kind: ChatKind::Private,
            receiver_id: Some(UserId(receiver)),
            group_id: None,
        }
    }

    fn decode_view(record: &BrokerMessage) -> ChatEventView {
        let envelope = Envelope::decode(&record.payload).unwrap();
        assert_eq!(envelope.kind(), EnvelopeType::ChatMessage);
        envelope.content_as().unwrap()
    }

    #[tokio::test]
    async fn private_chat_is_persisted_then_published_to_receiver() {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryStore::new());
        store.add_user(UserId(1), "alice");
        let d = Distributor::new(store.clone(), adapter(&broker));

        let id = d.send_chat(&alice(), &private_to(2, "hi bob")).await.unwrap();
        assert!(id.get() > 0);
        assert_eq!(store.events().len(), 1);

        let records = broker.records("chatroom-private-2");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key.as_deref(), Some("user-2"));
        let view = decode_view(&records[0]);
        assert_eq!(view.id, id);
        assert_eq!(view.content, "hi bob");
        assert_eq!(view.sender_id, UserId(1));
        assert_eq!(view.receiver_id, Some(UserId(2)));
        assert_eq!(view.sender.username, "alice");
        assert!(broker.records("chatroom-private-1").is_empty());
    }

    #[tokio::test]
    async fn group_chat_fans_out_to_every_member() {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryStore::new());
        for member in [1, 2, 3] {
            store.add_group_member(GroupId(5), UserId(member));
        }
        let d = Distributor::new(store, adapter(&broker));
        let request = ChatRequest {
            content: "team".into(),
            kind: ChatKind::Group,
            receiver_id: None,
            group_id: Some(GroupId(5)),
        };
        let _ = d.send_chat(&alice(), &request).await.unwrap();
        for member in [1, 2, 3] {
            let records = broker.records(&format!("chatroom-private-{member}"));
            assert_eq!(records.len(), 1, "member {member}");
            assert_eq!(decode_view(&records[0]).group_id, Some(GroupId(5)));
        }
    }

    #[tokio::test]
    async fn system_chat_goes_to_global_topic() {
        let broker = MemoryBroker::new();
        let d = Distributor::new(Arc::new(MemoryStore::new()), adapter(&broker));
        let request = ChatRequest {
            content: "maintenance at noon".into(),
            kind: ChatKind::System,
            receiver_id: None,
            group_id: None,
        };
        let _ = d.send_chat(&alice(), &request).await.unwrap();
        assert_eq!(broker.records("chatroom-global-0").len(), 1);
    }

    #[tokio::test]
    async fn unknown_sender_falls_back_to_token_name() {
        let broker = MemoryBroker::new();
        let d = Distributor::new(Arc::new(MemoryStore::new()), adapter(&broker));
        let _ = d.send_chat(&alice(), &private_to(2, "x")).await.unwrap();
        let view = decode_view(&broker.records("chatroom-private-2")[0]);
        assert_eq!(view.sender.username, "alice-token");
        assert!(view.sender.online);
    }

    #[tokio::test]
    async fn persistence_failure_publishes_nothing() {
        let broker = MemoryBroker::new();
        let mut store = MockStore::new();
        let _ = store
            .expect_save_chat_event()
            .times(1)
            .returning(|_| Err(StoreError::Unavailable("disk full".into())));
        let _ = store.expect_get_user_by_id().never();
        let d = Distributor::new(Arc::new(store), adapter(&broker));

        let err = d.send_chat(&alice(), &private_to(2, "lost")).await.unwrap_err();
        assert_matches!(err, RelayError::PersistenceFailure(_));
        assert!(broker.topic_names().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_keeps_persisted_id() {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryStore::new());
        let d = Distributor::new(store.clone(), adapter(&broker));
        broker.set_available(false);

        let err = d.send_chat(&alice(), &private_to(2, "stuck")).await.unwrap_err();
        let persisted = store.events()[0].id;
        assert_matches!(err, RelayError::BrokerUnavailable { message_id, .. } if message_id == persisted);
        broker.set_available(true);
        assert!(broker.records("chatroom-private-2").is_empty());
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_persisting() {
        let broker = MemoryBroker::new();
        let mut store = MockStore::new();
        let _ = store.expect_save_chat_event().never();
        let d = Distributor::new(Arc::new(store), adapter(&broker));
        let missing_receiver = ChatRequest {
            content: "hi".into(),
            kind: ChatKind::Private,
            receiver_id: None,
            group_id: None,
        };
        assert_matches!(
            d.send_chat(&alice(), &missing_receiver).await,
            Err(RelayError::InvalidRequest(_))
        );
    }

    #[tokio::test]
    async fn typing_in_group_skips_sender() {
        let broker = MemoryBroker::new();
        let store = Arc::new(MemoryStore::new());
        store.add_group_member(GroupId(5), UserId(1));
        store.add_group_member(GroupId(5), UserId(2));
        let a = adapter(&broker);
        let d = Distributor::new(store, a.clone());
        let request = TypingRequest {
            receiver_id: None,
            group_id: Some(GroupId(5)),
        };
        d.send_typing(&alice(), &request).await.unwrap();
        for _ in 0..100 {
            if a.metrics_snapshot().messages_sent == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(broker.records("chatroom-private-2").len(), 1);
        assert!(broker.records("chatroom-private-1").is_empty());
        let envelope = Envelope::decode(&broker.records("chatroom-private-2")[0].payload).unwrap();
        assert_eq!(envelope.kind(), EnvelopeType::Typing);
    }

    #[tokio::test]
    async fn inbound_dispatch_by_type() {
        let broker = MemoryBroker::new();
        let d = Distributor::new(Arc::new(MemoryStore::new()), adapter(&broker));
        let chat = Envelope::new(EnvelopeType::ChatMessage, &private_to(2, "via ws")).unwrap();
        d.handle_inbound(&alice(), chat).await.unwrap();
        assert_eq!(broker.records("chatroom-private-2").len(), 1);

        let status = Envelope::new(
            EnvelopeType::UserStatus,
            &UserStatus {
                user_id: UserId(1),
                username: "alice".into(),
                status: PresenceStatus::Online,
            },
        )
        .unwrap();
        assert_matches!(
            d.handle_inbound(&alice(), status).await,
            Err(RelayError::InvalidRequest(_))
        );
    }

    #[tokio::test]
    async fn status_publisher_writes_status_topic_in_order() {
        let broker = MemoryBroker::new();
        let publisher = StatusPublisher::new(adapter(&broker));
        for status in [PresenceStatus::Online, PresenceStatus::Offline, PresenceStatus::Online] {
            publisher
                .user_status(UserStatus {
                    user_id: UserId(4),
                    username: "dave".into(),
                    status,
                })
                .await;
        }

        let records = timeout(Duration::from_secs(2), async {
            loop {
                let records = broker.records("chatroom-status-0");
                if records.len() == 3 {
                    return records;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let seen: Vec<PresenceStatus> = records
            .iter()
            .map(|r| {
                let status: UserStatus = Envelope::decode(&r.payload).unwrap().content_as().unwrap();
                status.status
            })
            .collect();
        assert_eq!(
            seen,
            vec![PresenceStatus::Online, PresenceStatus::Offline, PresenceStatus::Online]
        );
    }

    #[test]
    fn error_frames_only_for_client_visible_errors() {
        let frame = error_frame(&RelayError::InvalidRequest("no receiver".into())).unwrap();
        let envelope = Envelope::decode(frame.as_bytes()).unwrap();
        assert_eq!(envelope.kind(), EnvelopeType::Error);
        assert_eq!(envelope.content()["code"], "invalid_request");
        assert!(
            error_frame(&RelayError::BrokerUnavailable {
                reason: "down".into(),
                message_id: None
            })
            .is_none()
        );
    }
}
