//! One relay process: registry, adapter and distributor wired together.

use std::sync::Arc;

use relay_broker::{AdapterConfig, BrokerTransport, FanoutAdapter, SubscriptionHandle};
use relay_core::chat::ChatRequest;
use relay_core::ids::MessageId;
use relay_core::{RelayError, Topic};
use relay_settings::RelaySettings;
use relay_store::{ChatStore, PresenceSet};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::Identity;
use crate::distribution::{Distributor, LocalBroadcast, PrivateDelivery, StatusPublisher};
use crate::registry::{Admission, ConnectionRegistry, RegistryConfig};
use crate::session::SessionConfig;

/// A relay node.
///
/// Several nodes sharing one broker, store and presence set behave like
/// several processes behind a load balancer.
pub struct RelayNode {
    node_id: String,
    registry: Arc<ConnectionRegistry>,
    adapter: FanoutAdapter,
    distributor: Arc<Distributor>,
    store: Arc<dyn ChatStore>,
    session: SessionConfig,
    sweep_interval: std::time::Duration,
}

impl RelayNode {
    /// Wire a node from settings and its external collaborators.
    pub fn new(
        settings: &RelaySettings,
        transport: Arc<dyn BrokerTransport>,
        store: Arc<dyn ChatStore>,
        presence: Arc<dyn PresenceSet>,
    ) -> Self {
        let mut adapter_config = AdapterConfig::from_settings(&settings.broker);
        adapter_config.shutdown_timeout = settings.server.shutdown_timeout();
        let adapter = FanoutAdapter::new(transport, adapter_config);

        let registry_config = RegistryConfig {
            max_connections: settings.server.max_connections,
            send_queue_capacity: settings.server.send_queue_capacity,
            idle_timeout: settings.server.idle_timeout(),
            presence_stale_after: settings.presence.stale_after(),
        };
        let registry = Arc::new(ConnectionRegistry::new(
            registry_config,
            settings.broker.node_id.clone(),
            presence,
            Arc::new(StatusPublisher::new(adapter.clone())),
        ));
        let distributor = Arc::new(Distributor::new(Arc::clone(&store), adapter.clone()));

        Self {
            node_id: settings.broker.node_id.clone(),
            registry,
            adapter,
            distributor,
            store,
            session: SessionConfig::from_settings(&settings.server),
            sweep_interval: settings.server.sweep_interval(),
        }
    }

    /// Subscribe the broadcast topics (`global-0`, `status-0`).
    pub async fn start(&self) -> Vec<SubscriptionHandle> {
        let mut handles = Vec::with_capacity(2);
        for topic in [Topic::global(), Topic::status()] {
            let name = self.adapter.topic_name(&topic);
            handles.push(
                self.adapter
                    .subscribe(&name, LocalBroadcast::new(Arc::clone(&self.registry)))
                    .await,
            );
        }
        info!(node_id = %self.node_id, group = self.adapter.group_id(), "relay node started");
        handles
    }

    /// Admit `identity` and make sure its private topic is consumed here.
    pub async fn connect(&self, identity: &Identity) -> Result<Admission, RelayError> {
        let admission = self.registry.admit(identity).await?;
        let name = self.adapter.topic_name(&Topic::private(identity.user_id));
        let _ = self
            .adapter
            .subscribe(&name, PrivateDelivery::new(Arc::clone(&self.registry), identity.user_id))
            .await;
        Ok(admission)
    }

    /// Send a chat message on behalf of `sender`.
    pub async fn send_chat(&self, sender: &Identity, request: &ChatRequest) -> Result<MessageId, RelayError> {
        self.distributor.send_chat(sender, request).await
    }

    /// Run the registry sweep on the configured interval until `cancel`.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.registry.spawn_sweeper(self.sweep_interval, cancel)
    }

    /// Close every local connection and stop all subscriptions.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
        self.adapter.shutdown().await;
        info!(node_id = %self.node_id, "relay node stopped");
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The broker adapter.
    pub fn adapter(&self) -> &FanoutAdapter {
        &self.adapter
    }

    /// The distributor.
    pub fn distributor(&self) -> &Arc<Distributor> {
        &self.distributor
    }

    /// The chat store.
    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    /// Session limits for new connections.
    pub fn session_config(&self) -> &SessionConfig {
        &self.session
    }
}
