//! Two relay nodes sharing one broker, store and presence set, driven by
//! real WebSocket clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_broker::MemoryBroker;
use relay_core::ids::{GroupId, UserId};
use relay_server::metrics::detached_handle;
use relay_server::{Identity, JwtAuthenticator, RelayNode, RelayServer};
use relay_settings::RelaySettings;
use relay_store::{MemoryPresence, MemoryStore};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct Cluster {
    broker: MemoryBroker,
    store: Arc<MemoryStore>,
    presence: Arc<MemoryPresence>,
    auth: Arc<JwtAuthenticator>,
    servers: Vec<RelayServer>,
}

impl Cluster {
    fn new() -> Self {
        let settings = RelaySettings::default();
        Self {
            broker: MemoryBroker::new(),
            store: Arc::new(MemoryStore::new()),
            presence: Arc::new(MemoryPresence::new()),
            auth: Arc::new(JwtAuthenticator::from_settings(&settings.auth)),
            servers: Vec::new(),
        }
    }

    async fn spawn_node(&mut self, node_id: &str, max_connections: usize) -> SocketAddr {
        let mut settings = RelaySettings::default();
        settings.server.host = "127.0.0.1".into();
        settings.server.port = 0;
        settings.server.max_connections = max_connections;
        settings.broker.node_id = node_id.into();

        let node = Arc::new(RelayNode::new(
            &settings,
            Arc::new(self.broker.clone()),
            self.store.clone(),
            self.presence.clone(),
        ));
        let _ = node.start().await;
        let server = RelayServer::new(settings.server.clone(), node, self.auth.clone(), detached_handle());
        let addr = server.listen().await.unwrap();
        self.servers.push(server);
        addr
    }

    fn token(&self, user: u64, name: &str) -> String {
        self.auth
            .issue(&Identity {
                user_id: UserId(user),
                display_name: name.into(),
            })
            .unwrap()
    }

    async fn connect(&self, addr: SocketAddr, user: u64, name: &str) -> Client {
        let url = format!("ws://{addr}/ws?token={}", self.token(user, name));
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }
}

async fn send(ws: &mut Client, envelope: Value) {
    ws.send(Message::text(envelope.to_string())).await.unwrap();
}

/// Read frames until an envelope satisfies `pred`. Coalesced frames are split on newlines.
async fn expect_envelope(ws: &mut Client, pred: impl Fn(&Value) -> bool) -> Value {
    timeout(WAIT, async {
        loop {
            let msg = ws.next().await.expect("stream ended").expect("websocket error");
            if let Message::Text(text) = msg {
                for line in text.as_str().split('\n') {
                    let envelope: Value = serde_json::from_str(line).unwrap();
                    if pred(&envelope) {
                        return envelope;
                    }
                }
            }
        }
    })
    .await
    .expect("timed out waiting for envelope")
}

fn is_chat(envelope: &Value) -> bool {
    envelope["type"] == "chat_message"
}

#[tokio::test]
async fn private_message_crosses_nodes() {
    let mut cluster = Cluster::new();
    cluster.store.add_user(UserId(1), "alice");
    let a = cluster.spawn_node("a", 100).await;
    let b = cluster.spawn_node("b", 100).await;

    let mut bob = cluster.connect(b, 2, "bob").await;
    let mut alice = cluster.connect(a, 1, "alice").await;

    send(
        &mut alice,
        json!({"type": "chat_message", "content": {"content": "hi bob", "type": "private", "receiver_id": 2}}),
    )
    .await;

    let received = expect_envelope(&mut bob, is_chat).await;
    let content = &received["content"];
    assert_eq!(content["content"], "hi bob");
    assert_eq!(content["sender_id"], 1);
    assert_eq!(content["receiver_id"], 2);
    assert_eq!(content["sender"]["username"], "alice");
    assert_eq!(content["sender"]["online"], true);
    assert_eq!(content["id"], 1);
    assert_eq!(cluster.store.events().len(), 1);
}

#[tokio::test]
async fn group_message_reaches_members_on_every_node() {
    let mut cluster = Cluster::new();
    for user in [1, 2, 3] {
        cluster.store.add_group_member(GroupId(7), UserId(user));
    }
    let a = cluster.spawn_node("a", 100).await;
    let b = cluster.spawn_node("b", 100).await;

    let mut alice = cluster.connect(a, 1, "alice").await;
    let mut bob = cluster.connect(b, 2, "bob").await;
    let mut carol = cluster.connect(a, 3, "carol").await;

    send(
        &mut alice,
        json!({"type": "chat_message", "content": {"content": "standup", "type": "group", "group_id": 7}}),
    )
    .await;

    for ws in [&mut bob, &mut carol, &mut alice] {
        let received = expect_envelope(ws, is_chat).await;
        assert_eq!(received["content"]["content"], "standup");
        assert_eq!(received["content"]["group_id"], 7);
    }
}

#[tokio::test]
async fn group_event_carries_one_id_and_skips_absent_members() {
    let mut cluster = Cluster::new();
    for user in [1, 2, 3] {
        cluster.store.add_group_member(GroupId(9), UserId(user));
    }
    let a = cluster.spawn_node("a", 100).await;
    let b = cluster.spawn_node("b", 100).await;

    let mut alice = cluster.connect(a, 1, "alice").await;
    let mut bob = cluster.connect(b, 2, "bob").await;

    send(
        &mut alice,
        json!({"type": "chat_message", "content": {"content": "retro", "type": "group", "group_id": 9}}),
    )
    .await;

    let to_alice = expect_envelope(&mut alice, is_chat).await;
    let to_bob = expect_envelope(&mut bob, is_chat).await;
    assert_eq!(to_alice["content"]["id"], to_bob["content"]["id"]);

    let events = cluster.store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].group_id, Some(GroupId(9)));
    assert_eq!(
        to_bob["content"]["id"],
        json!(events[0].id.map(|id| id.0)),
    );
    // Carol is connected nowhere, yet her topic still carries the event.
    let carol_records = cluster.broker.records("chatroom-private-3");
    assert_eq!(carol_records.len(), 1);

    // Joining later does not replay what was published while offline.
    let mut carol = cluster.connect(b, 3, "carol").await;
    let _ = expect_envelope(&mut alice, |e| {
        e["type"] == "user_status" && e["content"]["user_id"] == 3
    })
    .await;
    send(
        &mut alice,
        json!({"type": "chat_message", "content": {"content": "welcome", "type": "group", "group_id": 9}}),
    )
    .await;
    let first_for_carol = expect_envelope(&mut carol, is_chat).await;
    assert_eq!(first_for_carol["content"]["content"], "welcome");
}

#[tokio::test]
async fn status_changes_are_broadcast_to_other_nodes() {
    let mut cluster = Cluster::new();
    let a = cluster.spawn_node("a", 100).await;
    let b = cluster.spawn_node("b", 100).await;

    let mut bob = cluster.connect(b, 2, "bob").await;
    let alice = cluster.connect(a, 1, "alice").await;

    let online = expect_envelope(&mut bob, |e| {
        e["type"] == "user_status" && e["content"]["user_id"] == 1
    })
    .await;
    assert_eq!(online["content"]["status"], "online");
    assert_eq!(online["content"]["username"], "alice");

    drop(alice);
    let offline = expect_envelope(&mut bob, |e| {
        e["type"] == "user_status" && e["content"]["user_id"] == 1 && e["content"]["status"] == "offline"
    })
    .await;
    assert_eq!(offline["content"]["username"], "alice");
}

#[tokio::test]
async fn typing_reaches_receiver_only() {
    let mut cluster = Cluster::new();
    let a = cluster.spawn_node("a", 100).await;
    let b = cluster.spawn_node("b", 100).await;

    let mut bob = cluster.connect(b, 2, "bob").await;
    let mut alice = cluster.connect(a, 1, "alice").await;

    send(&mut alice, json!({"type": "typing", "content": {"receiver_id": 2}})).await;
    let notice = expect_envelope(&mut bob, |e| e["type"] == "typing").await;
    assert_eq!(notice["content"]["sender_id"], 1);
    assert_eq!(notice["content"]["username"], "alice");
}

#[tokio::test]
async fn persistence_failure_is_reported_to_sender() {
    let mut cluster = Cluster::new();
    let a = cluster.spawn_node("a", 100).await;
    let mut alice = cluster.connect(a, 1, "alice").await;

    cluster.store.set_failing(true);
    send(
        &mut alice,
        json!({"type": "chat_message", "content": {"content": "lost", "type": "private", "receiver_id": 2}}),
    )
    .await;

    let error = expect_envelope(&mut alice, |e| e["type"] == "error").await;
    assert_eq!(error["content"]["code"], "persistence_failure");
    assert!(cluster.broker.records("chatroom-private-2").is_empty());
}

#[tokio::test]
async fn malformed_frame_keeps_connection_open() {
    let mut cluster = Cluster::new();
    let a = cluster.spawn_node("a", 100).await;
    let mut alice = cluster.connect(a, 1, "alice").await;

    alice.send(Message::text("not json")).await.unwrap();
    let error = expect_envelope(&mut alice, |e| e["type"] == "error").await;
    assert_eq!(error["content"]["code"], "decode_error");

    send(
        &mut alice,
        json!({"type": "chat_message", "content": {"content": "still here", "type": "private", "receiver_id": 1}}),
    )
    .await;
    let echoed = expect_envelope(&mut alice, is_chat).await;
    assert_eq!(echoed["content"]["content"], "still here");
}

#[tokio::test]
async fn invalid_token_is_rejected_before_upgrade() {
    let mut cluster = Cluster::new();
    let a = cluster.spawn_node("a", 100).await;

    let err = connect_async(format!("ws://{a}/ws?token=garbage")).await.unwrap_err();
    match err {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 401),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn connection_cap_refuses_with_503() {
    let mut cluster = Cluster::new();
    let a = cluster.spawn_node("a", 1).await;

    let _alice = cluster.connect(a, 1, "alice").await;
    let url = format!("ws://{a}/ws?token={}", cluster.token(2, "bob"));
    match connect_async(url).await.unwrap_err() {
        tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 503),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(cluster.servers[0].node().registry().count().await, 1);
}

#[tokio::test]
async fn reconnect_closes_previous_socket() {
    let mut cluster = Cluster::new();
    let a = cluster.spawn_node("a", 100).await;

    let mut first = cluster.connect(a, 1, "alice").await;
    let _second = cluster.connect(a, 1, "alice").await;

    let closed = timeout(WAIT, async {
        loop {
            match first.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert_eq!(cluster.servers[0].node().registry().count().await, 1);
}
