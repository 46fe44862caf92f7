//! Integration tests: real relay server + RelayClient over WebSocket.

use std::sync::Arc;
use std::time::Duration;

use scribe_relay::{
    issue_token, ClientEvent, CollabService, CursorPosition, Directory, MemoryStore,
    PresencePatch, RelayClient, RelayConfig, RelayServer, ServerMessage,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;
use yrs::sync::{Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

const SECRET: &str = "integration-secret";

struct TestRelay {
    url: String,
    service: Arc<CollabService>,
    workspace: Uuid,
    document: Uuid,
    alice: Uuid,
    bob: Uuid,
    outsider: Uuid,
}

/// Start a relay on an ephemeral port with Alice and Bob in one workspace.
async fn start_test_server() -> TestRelay {
    let (workspace, document) = (Uuid::new_v4(), Uuid::new_v4());
    let (alice, bob, outsider) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let directory = Arc::new(
        Directory::new()
            .with_user(alice, Some("Alice"))
            .with_user(bob, Some("Bob"))
            .with_user(outsider, Some("Mallory"))
            .with_member(workspace, alice)
            .with_member(workspace, bob)
            .with_document(workspace, document),
    );

    let config = RelayConfig {
        jwt_secret: SECRET.into(),
        ..RelayConfig::default()
    };
    let service = Arc::new(CollabService::new(
        &config,
        directory.clone(),
        directory,
        Arc::new(MemoryStore::new()),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(config, service.clone());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestRelay {
        url: format!("ws://{addr}"),
        service,
        workspace,
        document,
        alice,
        bob,
        outsider,
    }
}

async fn connect_as(relay: &TestRelay, user: Uuid) -> (RelayClient, mpsc::Receiver<ClientEvent>) {
    let token = issue_token(SECRET, user, Duration::from_secs(60)).unwrap();
    let mut client = RelayClient::new(relay.url.clone(), Some(token));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(ClientEvent::Connected)) => {}
        other => panic!("Expected Connected, got {other:?}"),
    }
    (client, events)
}

/// Skip events until one matches, or panic after two seconds.
async fn wait_for<F>(events: &mut mpsc::Receiver<ClientEvent>, what: &str, pred: F) -> ServerMessage
where
    F: Fn(&ServerMessage) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(ClientEvent::Message(msg))) if pred(&msg) => return msg,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("Event channel closed while waiting for {what}"),
            Err(_) => panic!("Timed out waiting for {what}"),
        }
    }
}

/// Assert no message matching `pred` arrives within `window`.
async fn assert_none<F>(events: &mut mpsc::Receiver<ClientEvent>, window: Duration, pred: F)
where
    F: Fn(&ServerMessage) -> bool,
{
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        if let ClientEvent::Message(msg) = &event {
            assert!(!pred(msg), "Unexpected message: {msg:?}");
        }
    }
}

async fn join_and_settle(
    relay: &TestRelay,
    client: &RelayClient,
    events: &mut mpsc::Receiver<ClientEvent>,
) -> Vec<Uuid> {
    client.join(relay.document, relay.workspace, None).await.unwrap();
    let list = wait_for(events, "presence list", |m| {
        matches!(m, ServerMessage::PresenceList { .. })
    })
    .await;
    wait_for(events, "sync step 1", |m| {
        matches!(m, ServerMessage::SyncMessage { .. })
    })
    .await;
    match list {
        ServerMessage::PresenceList { presences, .. } => {
            presences.iter().map(|p| p.user_id).collect()
        }
        _ => unreachable!(),
    }
}

fn text_update(content: &str) -> Vec<u8> {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("content");
    let mut txn = doc.transact_mut();
    text.insert(&mut txn, 0, content);
    drop(txn);
    let update = doc
        .transact()
        .encode_state_as_update_v1(&StateVector::default());
    update
}

#[tokio::test]
async fn test_join_leave_presence_flow() {
    let relay = start_test_server().await;
    let (alice, mut alice_events) = connect_as(&relay, relay.alice).await;
    let (mut bob, mut bob_events) = connect_as(&relay, relay.bob).await;

    // Alice alone in the room.
    let roster = join_and_settle(&relay, &alice, &mut alice_events).await;
    assert_eq!(roster, vec![relay.alice]);

    // Bob joins: he sees both, Alice is told about Bob.
    let roster = join_and_settle(&relay, &bob, &mut bob_events).await;
    assert_eq!(roster, vec![relay.alice, relay.bob]);
    let bob_id = relay.bob;
    let update = wait_for(&mut alice_events, "presence:updated for Bob", |m| {
        matches!(m, ServerMessage::PresenceUpdated { presence, .. } if presence.user_id == bob_id)
    })
    .await;
    if let ServerMessage::PresenceUpdated { presence, .. } = update {
        assert_eq!(presence.display_name, "Bob");
        assert!(presence.color.starts_with('#'));
    }

    // Bob drops: Alice gets presence:removed.
    bob.disconnect().await;
    let removed = wait_for(&mut alice_events, "presence:removed", |m| {
        matches!(m, ServerMessage::PresenceRemoved { .. })
    })
    .await;
    assert_eq!(
        removed,
        ServerMessage::PresenceRemoved {
            document_id: relay.document,
            user_id: relay.bob,
        }
    );
    assert_eq!(relay.service.presence(relay.document).await.len(), 1);
}

#[tokio::test]
async fn test_update_relayed_without_echo() {
    let relay = start_test_server().await;
    let (alice, mut alice_events) = connect_as(&relay, relay.alice).await;
    let (bob, mut bob_events) = connect_as(&relay, relay.bob).await;
    join_and_settle(&relay, &alice, &mut alice_events).await;
    join_and_settle(&relay, &bob, &mut bob_events).await;

    let u1 = text_update("hello");
    alice.send_update(relay.document, u1.clone()).await.unwrap();

    let received = wait_for(&mut bob_events, "update", |m| {
        matches!(m, ServerMessage::Update { .. })
    })
    .await;
    assert_eq!(
        received,
        ServerMessage::Update {
            document_id: relay.document,
            update: u1,
        }
    );

    // The sender never gets its own update back.
    assert_none(&mut alice_events, Duration::from_millis(200), |m| {
        matches!(m, ServerMessage::Update { .. })
    })
    .await;
}

#[tokio::test]
async fn test_late_joiner_syncs_full_state() {
    let relay = start_test_server().await;
    let (alice, mut alice_events) = connect_as(&relay, relay.alice).await;
    alice.join(relay.document, relay.workspace, None).await.unwrap();

    // Answer the server's SyncStep1 with Alice's local content.
    let step1 = wait_for(&mut alice_events, "sync step 1", |m| {
        matches!(m, ServerMessage::SyncMessage { .. })
    })
    .await;
    let server_sv = match step1 {
        ServerMessage::SyncMessage { message, .. } => match Message::decode_v1(&message).unwrap() {
            Message::Sync(SyncMessage::SyncStep1(sv)) => sv,
            other => panic!("Expected SyncStep1, got {other:?}"),
        },
        _ => unreachable!(),
    };
    let local = Doc::new();
    let text = local.get_or_insert_text("content");
    text.insert(&mut local.transact_mut(), 0, "shared draft");
    let diff = local.transact().encode_diff_v1(&server_sv);
    alice
        .send_sync(
            relay.document,
            Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1(),
        )
        .await
        .unwrap();

    // Give the relay a moment to integrate before Bob asks.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (bob, mut bob_events) = connect_as(&relay, relay.bob).await;
    join_and_settle(&relay, &bob, &mut bob_events).await;
    let bob_doc = Doc::new();
    let bob_text = bob_doc.get_or_insert_text("content");
    let ask = Message::Sync(SyncMessage::SyncStep1(StateVector::default())).encode_v1();
    bob.send_sync(relay.document, ask).await.unwrap();

    let reply = wait_for(&mut bob_events, "sync step 2", |m| {
        matches!(m, ServerMessage::SyncMessage { .. })
    })
    .await;
    let ServerMessage::SyncMessage { message, .. } = reply else {
        unreachable!()
    };
    match Message::decode_v1(&message).unwrap() {
        Message::Sync(SyncMessage::SyncStep2(update)) => {
            bob_doc
                .transact_mut()
                .apply_update(Update::decode_v1(&update).unwrap())
                .unwrap();
        }
        other => panic!("Expected SyncStep2, got {other:?}"),
    }
    assert_eq!(bob_text.get_string(&bob_doc.transact()), "shared draft");
}

#[tokio::test]
async fn test_presence_update_reaches_peers() {
    let relay = start_test_server().await;
    let (alice, mut alice_events) = connect_as(&relay, relay.alice).await;
    let (bob, mut bob_events) = connect_as(&relay, relay.bob).await;
    join_and_settle(&relay, &alice, &mut alice_events).await;
    join_and_settle(&relay, &bob, &mut bob_events).await;

    let cursor = CursorPosition { line: 3, index: 14 };
    alice
        .update_presence(relay.document, PresencePatch::cursor(cursor))
        .await
        .unwrap();

    let alice_id = relay.alice;
    let update = wait_for(&mut bob_events, "Alice's cursor", |m| {
        matches!(m, ServerMessage::PresenceUpdated { presence, .. }
            if presence.user_id == alice_id && presence.cursor.is_some())
    })
    .await;
    if let ServerMessage::PresenceUpdated { presence, .. } = update {
        assert_eq!(presence.cursor, Some(cursor));
        assert_eq!(presence.display_name, "Alice");
    }
}

#[tokio::test]
async fn test_unknown_user_rejected() {
    let relay = start_test_server().await;
    let ghost = Uuid::new_v4();
    let token = issue_token(SECRET, ghost, Duration::from_secs(60)).unwrap();
    let mut client = RelayClient::new(relay.url.clone(), Some(token));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    wait_for(&mut events, "authentication error", |m| {
        *m == ServerMessage::error("Authentication error")
    })
    .await;
    // Joining is pointless now; the socket is closed by the relay.
    let _ = client.join(relay.document, relay.workspace, None).await;
    assert_none(&mut events, Duration::from_millis(200), |m| {
        matches!(m, ServerMessage::PresenceList { .. })
    })
    .await;
    assert_eq!(relay.service.stats().await.connections, 0);
}

#[tokio::test]
async fn test_forged_token_rejected() {
    let relay = start_test_server().await;
    let token = issue_token("some-other-secret", relay.alice, Duration::from_secs(60)).unwrap();
    let mut client = RelayClient::new(relay.url.clone(), Some(token));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    wait_for(&mut events, "authentication error", |m| {
        *m == ServerMessage::error("Authentication error")
    })
    .await;
}

#[tokio::test]
async fn test_non_member_denied() {
    let relay = start_test_server().await;
    let (alice, mut alice_events) = connect_as(&relay, relay.alice).await;
    join_and_settle(&relay, &alice, &mut alice_events).await;

    let (mallory, mut mallory_events) = connect_as(&relay, relay.outsider).await;
    mallory
        .join(relay.document, relay.workspace, None)
        .await
        .unwrap();
    wait_for(&mut mallory_events, "access denied", |m| {
        *m == ServerMessage::error("Access denied")
    })
    .await;

    // Nothing about Mallory reaches the room.
    let outsider = relay.outsider;
    assert_none(&mut alice_events, Duration::from_millis(200), |m| {
        matches!(m, ServerMessage::PresenceUpdated { presence, .. } if presence.user_id == outsider)
    })
    .await;
    assert_eq!(relay.service.presence(relay.document).await.len(), 1);
}

#[tokio::test]
async fn test_unknown_document_not_found() {
    let relay = start_test_server().await;
    let (alice, mut events) = connect_as(&relay, relay.alice).await;
    alice
        .join(Uuid::new_v4(), relay.workspace, None)
        .await
        .unwrap();
    wait_for(&mut events, "not found", |m| {
        *m == ServerMessage::error("Document not found")
    })
    .await;
}
