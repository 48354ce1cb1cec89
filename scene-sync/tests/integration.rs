//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real room server and connect real clients (and a
//! few raw WebSocket peers), verifying the full sync pipeline.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use scene_sync::client::{ClientConfig, ClientEvent, CollabClient, ConnectionState};
use scene_sync::element::{Element, ElementSet};
use scene_sync::presence::{Pointer, PRESENCE_PALETTE};
use scene_sync::protocol::{ClientMessage, ServerMessage};
use scene_sync::server::{RoomServer, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

/// Start a room server on an ephemeral port; returns it with its URL.
async fn start_server(
    config: ServerConfig,
    initial: ElementSet,
) -> (Arc<RoomServer>, String, JoinHandle<()>) {
    let server = Arc::new(RoomServer::new(config, "test-room", initial));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = {
        let server = server.clone();
        tokio::spawn(async move {
            server.serve(listener).await.unwrap();
        })
    };
    (server, format!("ws://{addr}"), task)
}

fn client_config(url: &str, name: &str) -> ClientConfig {
    let mut config = ClientConfig::new(url, name);
    config.reconnect_delay = Duration::from_millis(50);
    config.max_reconnect_delay = Duration::from_millis(200);
    config
}

/// Connect a client and wait for its first full-state.
async fn join(url: &str, name: &str) -> (CollabClient, UnboundedReceiver<ClientEvent>) {
    let mut client = CollabClient::connect(client_config(url, name)).await.unwrap();
    let mut events = client.take_event_rx().unwrap();
    expect(&mut events, |e| {
        matches!(e, ClientEvent::SceneReplaced { .. }).then_some(())
    })
    .await;
    (client, events)
}

/// Wait for the first event `pick` accepts.
async fn expect<T>(
    events: &mut UnboundedReceiver<ClientEvent>,
    mut pick: impl FnMut(ClientEvent) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if let Some(found) = pick(event) {
                return found;
            }
        }
        panic!("event stream closed");
    })
    .await
    .expect("timed out waiting for event")
}

async fn raw_connect(url: &str) -> RawSocket {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn raw_send(ws: &mut RawSocket, msg: &ClientMessage) {
    ws.send(Message::Text(msg.encode().unwrap().into())).await.unwrap();
}

async fn raw_recv(ws: &mut RawSocket) -> ServerMessage {
    loop {
        match timeout(WAIT, ws.next()).await.expect("timed out waiting for frame") {
            Some(Ok(Message::Text(text))) => return ServerMessage::decode(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("connection ended: {other:?}"),
        }
    }
}

fn scene(elements: &[Element]) -> ElementSet {
    ElementSet::from_elements(elements.iter().cloned())
}

/// Poll the room until `ready` accepts its element set.
async fn wait_for_room(server: &RoomServer, ready: impl Fn(&ElementSet) -> bool) {
    timeout(WAIT, async {
        while !ready(&server.snapshot().await) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room never reached the expected state");
}

/// TCP forwarder in front of the server. Cutting it drops every forwarded
/// connection while the room itself keeps running.
struct Relay {
    url: String,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Relay {
    async fn start(server_url: &str) -> Self {
        let target = server_url.trim_start_matches("ws://").to_string();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let links = Arc::new(Mutex::new(Vec::new()));

        let accepted = links.clone();
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let target = target.clone();
                let link = tokio::spawn(async move {
                    if let Ok(mut upstream) = TcpStream::connect(target.as_str()).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut upstream).await;
                    }
                });
                accepted.lock().unwrap().push(link);
            }
        });

        Self { url, links }
    }

    fn cut(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }
}

#[tokio::test]
async fn test_join_receives_seeded_full_state() {
    let seed = scene(&[
        Element::with_version("a", 4, 2).with_field("type", "ellipse"),
        Element::with_version("b", 1, 9),
    ]);
    let (_server, url, _task) = start_server(ServerConfig::for_testing(), seed.clone()).await;

    let mut client = CollabClient::connect(client_config(&url, "Alice")).await.unwrap();
    let mut events = client.take_event_rx().unwrap();

    let (elements, participants) = expect(&mut events, |e| match e {
        ClientEvent::SceneReplaced {
            elements,
            participants,
            ..
        } => Some((elements, participants)),
        _ => None,
    })
    .await;

    assert_eq!(elements, seed);
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].name, "Alice");
    assert_eq!(participants[0].color, PRESENCE_PALETTE[0]);
    assert_eq!(client.connection_state(), ConnectionState::Joined);
    assert_eq!(client.elements().await.unwrap(), seed);
}

#[tokio::test]
async fn test_scene_update_relayed_without_echo() {
    let (server, url, _task) = start_server(ServerConfig::for_testing(), ElementSet::new()).await;
    let (alice, mut alice_events) = join(&url, "Alice").await;
    let (bob, mut bob_events) = join(&url, "Bob").await;

    let rect = Element::with_version("rect", 1, 5).with_field("width", 40);
    alice.local_change(scene(&[rect.clone()])).await.unwrap();

    let (merged, from) = expect(&mut bob_events, |e| match e {
        ClientEvent::SceneMerged { elements, from, .. } => Some((elements, from)),
        _ => None,
    })
    .await;
    assert_eq!(from, "Alice");
    assert_eq!(merged.get("rect"), Some(&rect));
    assert!(server.snapshot().await.contains("rect"));

    // Anything echoed to Alice would be queued ahead of Bob's cursor.
    bob.move_pointer(Pointer::new(1.0, 1.0)).await.unwrap();
    timeout(WAIT, async {
        while let Some(event) = alice_events.recv().await {
            match event {
                ClientEvent::SceneMerged { .. } => panic!("update echoed to its sender"),
                ClientEvent::RemoteCursor { .. } => break,
                _ => {}
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_stale_local_scene_keeps_remote_elements() {
    let (server, url, _task) = start_server(ServerConfig::for_testing(), ElementSet::new()).await;
    let (alice, mut alice_events) = join(&url, "Alice").await;
    let (bob, _bob_events) = join(&url, "Bob").await;

    let b = Element::with_version("b", 1, 3);
    bob.local_change(scene(&[b.clone()])).await.unwrap();
    expect(&mut alice_events, |e| match e {
        ClientEvent::SceneMerged { elements, .. } if elements.contains("b") => Some(()),
        _ => None,
    })
    .await;

    // Alice's editor reports a scene drawn before "b" reached it.
    alice
        .local_change(scene(&[Element::with_version("a", 1, 1)]))
        .await
        .unwrap();
    wait_for_room(&server, |room| room.contains("a")).await;

    let mut b2 = b.clone();
    b2.bump();
    bob.local_change(scene(&[b2, Element::with_version("c", 1, 5)]))
        .await
        .unwrap();

    let merged = expect(&mut alice_events, |e| match e {
        ClientEvent::SceneMerged { elements, .. } if elements.contains("c") => Some(elements),
        _ => None,
    })
    .await;
    let ids: Vec<&str> = merged.ids().map(String::as_str).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(merged, server.snapshot().await);
    assert_eq!(alice.elements().await.unwrap(), merged);
}

#[tokio::test]
async fn test_unchanged_scene_is_not_resent() {
    let seed = scene(&[Element::with_version("a", 2, 1)]);
    let (server, url, _task) = start_server(ServerConfig::for_testing(), seed.clone()).await;
    let (alice, _alice_events) = join(&url, "Alice").await;
    let (_bob, _bob_events) = join(&url, "Bob").await;

    alice.local_change(seed).await.unwrap();
    // Barrier: commands run in order.
    alice.elements().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.stats().scene_updates, 0);
}

#[tokio::test]
async fn test_participant_join_and_leave_events() {
    let (_server, url, _task) = start_server(ServerConfig::for_testing(), ElementSet::new()).await;
    let (_alice, mut alice_events) = join(&url, "Alice").await;

    let (bob, bob_events) = join(&url, "Bob").await;
    let joined = expect(&mut alice_events, |e| match e {
        ClientEvent::ParticipantJoined(summary) => Some(summary),
        _ => None,
    })
    .await;
    assert_eq!(joined.name, "Bob");
    assert_eq!(joined.color, PRESENCE_PALETTE[1]);

    drop(bob_events);
    bob.disconnect().await;
    let left = expect(&mut alice_events, |e| match e {
        ClientEvent::ParticipantLeft(name) => Some(name),
        _ => None,
    })
    .await;
    assert_eq!(left, "Bob");
}

#[tokio::test]
async fn test_cursor_relayed_with_name_and_color() {
    let (_server, url, _task) = start_server(ServerConfig::for_testing(), ElementSet::new()).await;
    let (_alice, mut alice_events) = join(&url, "Alice").await;
    let (bob, _bob_events) = join(&url, "Bob").await;

    bob.move_pointer(Pointer::new(12.5, -4.0)).await.unwrap();

    let (name, color, pointer) = expect(&mut alice_events, |e| match e {
        ClientEvent::RemoteCursor {
            name,
            color,
            pointer,
        } => Some((name, color, pointer)),
        _ => None,
    })
    .await;
    assert_eq!(name, "Bob");
    assert_eq!(color, PRESENCE_PALETTE[1]);
    assert_eq!(pointer, Pointer::new(12.5, -4.0));
}

#[tokio::test]
async fn test_cursor_burst_is_throttled() {
    let (server, url, _task) = start_server(ServerConfig::for_testing(), ElementSet::new()).await;
    let (_alice, mut alice_events) = join(&url, "Alice").await;
    let (bob, _bob_events) = join(&url, "Bob").await;
    let before = server.stats().total_messages;

    for i in 0..100 {
        bob.move_pointer(Pointer::new(i as f64, 0.0)).await.unwrap();
    }

    let last = expect(&mut alice_events, |e| match e {
        ClientEvent::RemoteCursor { pointer, .. } if pointer.x == 99.0 => Some(pointer),
        _ => None,
    })
    .await;
    assert_eq!(last, Pointer::new(99.0, 0.0));
    let sent = server.stats().total_messages - before;
    assert!(sent < 100, "{sent} cursor frames reached the server");
}

#[tokio::test]
async fn test_concurrent_same_version_edits() {
    let seed = scene(&[Element::with_version("x", 1, 0)]);
    let (server, url, _task) = start_server(ServerConfig::for_testing(), seed).await;
    let (alice, mut alice_events) = join(&url, "Alice").await;

    let mut carol = raw_connect(&url).await;
    raw_send(&mut carol, &ClientMessage::Join { name: "Carol".into() }).await;
    assert!(matches!(raw_recv(&mut carol).await, ServerMessage::FullState { .. }));

    alice
        .local_change(scene(&[Element::with_version("x", 2, 20)]))
        .await
        .unwrap();
    loop {
        if let ServerMessage::SceneUpdate { from, .. } = raw_recv(&mut carol).await {
            assert_eq!(from, "Alice");
            break;
        }
    }

    // Carol edited from the same base: same version, lower nonce.
    raw_send(
        &mut carol,
        &ClientMessage::SceneUpdate {
            elements: scene(&[Element::with_version("x", 2, 10)]),
        },
    )
    .await;

    expect(&mut alice_events, |e| {
        matches!(e, ClientEvent::SceneMerged { .. }).then_some(())
    })
    .await;
    // Clients break the tie by nonce.
    let local = alice.elements().await.unwrap();
    assert_eq!(local.get("x").unwrap().version_nonce, 10);
    // The server only adopts strictly newer versions.
    let authoritative = server.snapshot().await;
    assert_eq!(authoritative.get("x").unwrap().version_nonce, 20);
    assert_eq!(server.stats().elements_adopted, 1);
}

#[tokio::test]
async fn test_two_clients_converge_on_same_version_tie() {
    let seed = scene(&[Element::with_version("x", 1, 0)]);
    let (_server, url, _task) = start_server(ServerConfig::for_testing(), seed).await;
    let (alice, _alice_events) = join(&url, "Alice").await;
    let (bob, _bob_events) = join(&url, "Bob").await;

    // Both edit "x" from version 1 at the same time.
    let (sent_a, sent_b) = tokio::join!(
        alice.local_change(scene(&[
            Element::with_version("x", 2, 20).with_field("width", 10)
        ])),
        bob.local_change(scene(&[
            Element::with_version("x", 2, 10).with_field("width", 30)
        ])),
    );
    sent_a.unwrap();
    sent_b.unwrap();

    let converged = timeout(WAIT, async {
        loop {
            let ours = alice.elements().await.unwrap();
            let theirs = bob.elements().await.unwrap();
            if ours == theirs && ours.get("x").is_some_and(|x| x.version_nonce == 10) {
                return ours;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("clients did not converge");
    assert_eq!(
        converged.get("x").unwrap().field("width"),
        Some(&serde_json::json!(30))
    );
}

#[tokio::test]
async fn test_client_tracks_remote_participants() {
    let (_server, url, _task) = start_server(ServerConfig::for_testing(), ElementSet::new()).await;
    let (alice, mut alice_events) = join(&url, "Alice").await;
    assert!(alice.participants().await.unwrap().is_empty());

    let (bob, _bob_events) = join(&url, "Bob").await;
    expect(&mut alice_events, |e| {
        matches!(e, ClientEvent::ParticipantJoined(_)).then_some(())
    })
    .await;
    let peers = alice.participants().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name, "Bob");
    assert_eq!(peers[0].color, PRESENCE_PALETTE[1]);
    assert_eq!(peers[0].pointer, None);

    bob.move_pointer(Pointer::new(3.0, 4.0)).await.unwrap();
    expect(&mut alice_events, |e| {
        matches!(e, ClientEvent::RemoteCursor { .. }).then_some(())
    })
    .await;
    let peers = alice.participants().await.unwrap();
    assert_eq!(peers[0].pointer, Some(Pointer::new(3.0, 4.0)));

    bob.disconnect().await;
    expect(&mut alice_events, |e| {
        matches!(e, ClientEvent::ParticipantLeft(_)).then_some(())
    })
    .await;
    assert!(alice.participants().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_frames_are_ignored() {
    let (server, url, _task) = start_server(ServerConfig::for_testing(), ElementSet::new()).await;
    let mut ws = raw_connect(&url).await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"explode"}"#.into())).await.unwrap();
    raw_send(&mut ws, &ClientMessage::Join { name: "Mallory".into() }).await;

    match raw_recv(&mut ws).await {
        ServerMessage::FullState { participants, .. } => {
            assert_eq!(participants[0].name, "Mallory");
        }
        other => panic!("expected full-state, got {other:?}"),
    }
    assert_eq!(server.stats().malformed_messages, 2);
    assert_eq!(server.participant_count().await, 1);
}

#[tokio::test]
async fn test_request_state_without_join() {
    let seed = scene(&[Element::with_version("a", 1, 1)]);
    let (server, url, _task) = start_server(ServerConfig::for_testing(), seed.clone()).await;
    let mut ws = raw_connect(&url).await;

    raw_send(&mut ws, &ClientMessage::RequestState).await;
    match raw_recv(&mut ws).await {
        ServerMessage::FullState {
            elements,
            participants,
        } => {
            assert_eq!(elements, seed);
            assert!(participants.is_empty());
        }
        other => panic!("expected full-state, got {other:?}"),
    }
    assert_eq!(server.participant_count().await, 0);
}

#[tokio::test]
async fn test_updates_before_join_are_ignored() {
    let (server, url, _task) = start_server(ServerConfig::for_testing(), ElementSet::new()).await;
    let mut ws = raw_connect(&url).await;

    raw_send(
        &mut ws,
        &ClientMessage::SceneUpdate {
            elements: scene(&[Element::with_version("sneaky", 1, 1)]),
        },
    )
    .await;
    raw_send(&mut ws, &ClientMessage::RequestState).await;

    match raw_recv(&mut ws).await {
        ServerMessage::FullState { elements, .. } => assert!(elements.is_empty()),
        other => panic!("expected full-state, got {other:?}"),
    }
    assert!(server.snapshot().await.is_empty());
}

#[tokio::test]
async fn test_full_room_refuses_join() {
    let mut config = ServerConfig::for_testing();
    config.max_participants = 1;
    let (server, url, _task) = start_server(config, ElementSet::new()).await;
    let (_alice, _alice_events) = join(&url, "Alice").await;

    let mut ws = raw_connect(&url).await;
    raw_send(&mut ws, &ClientMessage::Join { name: "Bob".into() }).await;

    let closed = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(Message::Text(_))) => return false,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .unwrap();
    assert!(closed, "refused peer should be disconnected");
    assert_eq!(server.participant_count().await, 1);
}

#[tokio::test]
async fn test_reconnect_resyncs_from_new_server() {
    let first = scene(&[Element::with_version("old", 1, 1)]);
    let (server, url, task) = start_server(ServerConfig::for_testing(), first).await;
    let addr = url.trim_start_matches("ws://").to_string();

    let (client, mut events) = join(&url, "Alice").await;

    server.shutdown();
    task.await.unwrap();
    expect(&mut events, |e| {
        matches!(e, ClientEvent::StateChanged(ConnectionState::Disconnected)).then_some(())
    })
    .await;

    let second = scene(&[Element::with_version("new", 3, 7)]);
    let mut config = ServerConfig::for_testing();
    config.bind_addr = addr;
    let (server2, _url, _task2) = start_server(config, second.clone()).await;

    let resynced = expect(&mut events, |e| match e {
        ClientEvent::SceneReplaced { elements, .. } => Some(elements),
        _ => None,
    })
    .await;
    assert_eq!(resynced, second);
    assert!(client.wait_for_state(ConnectionState::Joined, WAIT).await);
    assert_eq!(client.elements().await.unwrap(), second);
    assert_eq!(server2.participant_count().await, 1);
}

#[tokio::test]
async fn test_reconnect_catches_up_with_live_room() {
    let seed = scene(&[Element::with_version("a", 1, 1)]);
    let (server, url, _task) = start_server(ServerConfig::for_testing(), seed).await;
    let relay = Relay::start(&url).await;

    let mut config = client_config(&relay.url, "Alice");
    config.reconnect_delay = Duration::from_millis(300);
    let mut alice = CollabClient::connect(config).await.unwrap();
    let mut alice_events = alice.take_event_rx().unwrap();
    expect(&mut alice_events, |e| {
        matches!(e, ClientEvent::SceneReplaced { .. }).then_some(())
    })
    .await;
    let (bob, mut bob_events) = join(&url, "Bob").await;

    relay.cut();
    expect(&mut alice_events, |e| {
        matches!(e, ClientEvent::StateChanged(ConnectionState::Disconnected)).then_some(())
    })
    .await;
    let left = expect(&mut bob_events, |e| match e {
        ClientEvent::ParticipantLeft(name) => Some(name),
        _ => None,
    })
    .await;
    assert_eq!(left, "Alice");

    // The room moves on while Alice is away.
    bob.local_change(scene(&[
        Element::with_version("a", 2, 4),
        Element::with_version("b", 1, 8),
    ]))
    .await
    .unwrap();
    wait_for_room(&server, |room| room.contains("b")).await;

    assert!(alice.wait_for_state(ConnectionState::Joined, WAIT).await);
    let resynced = timeout(WAIT, async {
        loop {
            let local = alice.elements().await.unwrap();
            if local == server.snapshot().await {
                return local;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reconnected client never caught up");
    assert_eq!(resynced.get("a").unwrap().version, 2);
    assert!(resynced.contains("b"));
    assert_eq!(server.participant_count().await, 2);
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let (server, url, task) = start_server(ServerConfig::for_testing(), ElementSet::new()).await;
    let mut ws = raw_connect(&url).await;
    raw_send(&mut ws, &ClientMessage::Join { name: "Alice".into() }).await;
    raw_recv(&mut ws).await;

    server.shutdown();
    let closed = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(server.stats().active_connections, 0);
}
