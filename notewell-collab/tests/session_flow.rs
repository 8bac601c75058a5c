//! End-to-end session flows against an in-process stub server.
//!
//! The stub speaks just enough of the wire protocol to exercise the client:
//! handshake, join snapshots, versioned edit broadcasts, presence notices,
//! and heartbeat replies. Its authoritative version is independent of the
//! snapshot it serves, which lets tests force version-mismatch rejections.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use notewell_collab::protocol::{self, dest, EditBroadcast, EditRequest, JoinRequest};
use notewell_collab::{
    CollabConfig, Collaborator, ConnectionManager, ConnectionStatus, Credentials, CursorUpdate,
    EditKind, Frame, PresenceEventKind, PresenceNotice, SessionController, SessionEvent,
    SessionSnapshot,
};

const TOKEN: &str = "let-me-in";

/// Knobs for misbehaving-server tests.
#[derive(Default)]
struct StubBehavior {
    /// Incoming connections to drop before the WebSocket handshake.
    reject_connects: AtomicU32,
    /// Swallow join requests instead of answering with a snapshot.
    mute_join: AtomicBool,
}

struct Stub {
    addr: SocketAddr,
    /// Flip to true to close every live and future stub connection.
    drop_tx: watch::Sender<bool>,
    bob: Collaborator,
    behavior: Arc<StubBehavior>,
}

impl Stub {
    /// Serve `snapshot` to joiners while holding `server_version` as the
    /// authoritative version for edit requests.
    async fn start(snapshot: SessionSnapshot, server_version: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (drop_tx, drop_rx) = watch::channel(false);
        let bob = Collaborator::new("Bob");
        let version = Arc::new(Mutex::new(server_version));
        let behavior = Arc::new(StubBehavior::default());

        let late_joiner = bob.clone();
        let shared_behavior = behavior.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                tokio::spawn(serve_client(
                    stream,
                    snapshot.clone(),
                    late_joiner.clone(),
                    version.clone(),
                    shared_behavior.clone(),
                    drop_rx.clone(),
                ));
            }
        });

        Self { addr, drop_tx, bob, behavior }
    }

    fn drop_connections(&self) {
        self.drop_tx.send_replace(true);
    }

    fn reject_next_connects(&self, count: u32) {
        self.behavior.reject_connects.store(count, Ordering::SeqCst);
    }

    fn set_mute_join(&self, mute: bool) {
        self.behavior.mute_join.store(mute, Ordering::SeqCst);
    }
}

async fn serve_client(
    stream: TcpStream,
    snapshot: SessionSnapshot,
    late_joiner: Collaborator,
    version: Arc<Mutex<u64>>,
    behavior: Arc<StubBehavior>,
    mut drop_rx: watch::Receiver<bool>,
) {
    if behavior.reject_connects.load(Ordering::SeqCst) > 0 {
        behavior.reject_connects.fetch_sub(1, Ordering::SeqCst);
        // Dropping the stream fails the caller's dial.
        return;
    }
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else { return };
    if *drop_rx.borrow() {
        let _ = ws.close(None).await;
        return;
    }
    loop {
        tokio::select! {
            changed = drop_rx.changed() => {
                if changed.is_err() || *drop_rx.borrow() {
                    let _ = ws.close(None).await;
                    return;
                }
            }
            msg = ws.next() => {
                let Some(Ok(Message::Binary(data))) = msg else { return };
                let bytes: Vec<u8> = data.into();
                match Frame::decode(&bytes) {
                    Ok(Frame::Connect { token }) => {
                        if token == TOKEN {
                            send_frame(&mut ws, &Frame::Connected).await;
                        } else {
                            let _ = ws.close(None).await;
                            return;
                        }
                    }
                    Ok(Frame::Ping) => send_frame(&mut ws, &Frame::Pong).await,
                    Ok(Frame::Publish { destination, body }) => {
                        handle_publish(
                            &mut ws,
                            &destination,
                            &body,
                            &snapshot,
                            &late_joiner,
                            &version,
                            &behavior,
                        )
                        .await;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn handle_publish(
    ws: &mut WebSocketStream<TcpStream>,
    destination: &str,
    body: &[u8],
    snapshot: &SessionSnapshot,
    late_joiner: &Collaborator,
    version: &Arc<Mutex<u64>>,
    behavior: &StubBehavior,
) {
    if destination.ends_with("/join") {
        if behavior.mute_join.load(Ordering::SeqCst) {
            return;
        }
        let request: JoinRequest = protocol::decode(body).unwrap();
        assert_eq!(request.note_id, snapshot.note_id);
        send_message(ws, dest::SNAPSHOT_QUEUE, snapshot).await;
        // A collaborator not in the snapshot arrives right after.
        let notice = PresenceNotice {
            event: PresenceEventKind::UserJoined,
            collaborator: late_joiner.clone(),
            total_collaborators: snapshot.collaborators.len() as u32 + 1,
        };
        send_message(ws, &dest::presence_topic(snapshot.note_id), &notice).await;
    } else if destination.ends_with("/edit") {
        let request: EditRequest = protocol::decode(body).unwrap();
        let (reply_destination, broadcast) = {
            let mut current = version.lock().unwrap();
            if request.base_version == *current {
                *current += 1;
                let accepted = EditBroadcast {
                    note_id: request.note_id,
                    editor_id: Uuid::nil(),
                    kind: request.kind,
                    title: request.title,
                    content: request.content,
                    base_version: request.base_version,
                    resulting_version: *current,
                    has_conflict: false,
                    conflict_message: None,
                };
                (dest::edits_topic(request.note_id), accepted)
            } else {
                let rejected = EditBroadcast {
                    note_id: request.note_id,
                    editor_id: Uuid::nil(),
                    kind: request.kind,
                    title: request.title,
                    content: request.content,
                    base_version: request.base_version,
                    resulting_version: *current,
                    has_conflict: true,
                    conflict_message: Some("version mismatch".into()),
                };
                (dest::ERRORS_QUEUE.to_string(), rejected)
            }
        };
        send_message(ws, &reply_destination, &broadcast).await;
    }
    // Leave, typing, and cursor publishes need no reply.
}

async fn send_frame(ws: &mut WebSocketStream<TcpStream>, frame: &Frame) {
    let bytes = frame.encode().unwrap();
    let _ = ws.send(Message::Binary(bytes.into())).await;
}

async fn send_message<T: serde::Serialize>(
    ws: &mut WebSocketStream<TcpStream>,
    destination: &str,
    payload: &T,
) {
    let frame = Frame::Message {
        destination: destination.to_string(),
        body: protocol::encode(payload).unwrap(),
    };
    send_frame(ws, &frame).await;
}

fn test_config(addr: SocketAddr) -> CollabConfig {
    CollabConfig {
        server_url: format!("ws://{addr}"),
        edit_debounce: Duration::from_millis(50),
        reconnect_delay: Duration::from_millis(30),
        max_reconnect_attempts: 2,
        ..CollabConfig::default()
    }
}

fn snapshot(note_id: Uuid, me: &Collaborator, version: u64) -> SessionSnapshot {
    let alice = Collaborator::new("Alice");
    SessionSnapshot {
        note_id,
        version,
        title: "Planning".into(),
        content: "first draft".into(),
        collaborators: vec![me.clone(), alice.clone()],
        cursors: vec![CursorUpdate {
            note_id,
            user_id: alice.user_id,
            position: 4,
            selection_start: None,
            selection_end: None,
        }],
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn joined_session(
    stub: &Stub,
    me: Collaborator,
    note_id: Uuid,
) -> (SessionController, mpsc::UnboundedReceiver<SessionEvent>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut session = SessionController::new(test_config(stub.addr), Credentials::new(TOKEN), me, note_id);
    let mut events = session.take_event_rx().unwrap();

    session.connect().await;
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ConnectionStatus(ConnectionStatus::Connected))
    })
    .await;

    session.join_note().await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::SessionJoined(_))).await;
    (session, events)
}

#[tokio::test]
async fn test_join_receives_snapshot_and_presence() {
    let me = Collaborator::new("Me");
    let note_id = Uuid::new_v4();
    let stub = Stub::start(snapshot(note_id, &me, 5), 5).await;

    let (session, mut events) = joined_session(&stub, me, note_id).await;
    assert!(session.is_joined());
    assert_eq!(session.version(), Some(5));
    assert_eq!(session.cursors().len(), 1);

    // Bob joined right after the snapshot was sent.
    let event = wait_for(&mut events, |e| matches!(e, SessionEvent::CollaboratorJoined(_))).await;
    match event {
        SessionEvent::CollaboratorJoined(collaborator) => {
            assert_eq!(collaborator.user_id, stub.bob.user_id);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(session.collaborators().len(), 3);

    session.shutdown().await;
}

#[tokio::test]
async fn test_edit_burst_flushes_once_and_advances_version() {
    let me = Collaborator::new("Me");
    let note_id = Uuid::new_v4();
    let stub = Stub::start(snapshot(note_id, &me, 5), 5).await;
    let (session, mut events) = joined_session(&stub, me, note_id).await;

    // Three rapid keystrokes inside the debounce window.
    session.send_edit(EditKind::ContentUpdate, None, Some("f".into())).await;
    session.send_edit(EditKind::ContentUpdate, None, Some("fi".into())).await;
    session.send_edit(EditKind::ContentUpdate, None, Some("fix".into())).await;

    let event = wait_for(&mut events, |e| matches!(e, SessionEvent::EditApplied(_))).await;
    match event {
        SessionEvent::EditApplied(edit) => {
            assert_eq!(edit.content.as_deref(), Some("fix"));
            assert_eq!(edit.base_version, 5);
            assert_eq!(edit.resulting_version, 6);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(session.version(), Some(6));

    let stats = session.stats();
    assert_eq!(stats.edits_queued, 3);
    assert_eq!(stats.edits_sent, 1);
    assert_eq!(stats.edits_applied, 1);

    session.shutdown().await;
}

#[tokio::test]
async fn test_stale_edit_rejected_as_conflict() {
    let me = Collaborator::new("Me");
    let note_id = Uuid::new_v4();
    // The server has moved on since the snapshot was taken.
    let stub = Stub::start(snapshot(note_id, &me, 5), 7).await;
    let (session, mut events) = joined_session(&stub, me, note_id).await;

    session.send_edit(EditKind::TitleUpdate, Some("New title".into()), None).await;

    let event = wait_for(&mut events, |e| matches!(e, SessionEvent::EditConflict(_))).await;
    match event {
        SessionEvent::EditConflict(edit) => {
            assert!(edit.has_conflict);
            assert_eq!(edit.base_version, 5);
        }
        other => panic!("unexpected event {other:?}"),
    }
    // A rejected edit never moves local state.
    assert_eq!(session.version(), Some(5));
    assert_eq!(session.stats().conflicts, 1);

    session.shutdown().await;
}

#[tokio::test]
async fn test_leave_ends_session_and_clears_state() {
    let me = Collaborator::new("Me");
    let note_id = Uuid::new_v4();
    let stub = Stub::start(snapshot(note_id, &me, 5), 5).await;
    let (session, mut events) = joined_session(&stub, me, note_id).await;

    session.leave_note().await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::SessionEnded { .. })).await;

    assert!(!session.is_joined());
    assert_eq!(session.version(), None);
    assert!(session.collaborators().is_empty());
    assert!(session.cursors().is_empty());
    assert!(session.typing_users().is_empty());
    // Still connected: only the session ended, not the transport.
    assert_eq!(session.status(), ConnectionStatus::Connected);

    session.shutdown().await;
}

#[tokio::test]
async fn test_connection_loss_ends_session_then_errors_out() {
    let me = Collaborator::new("Me");
    let note_id = Uuid::new_v4();
    let stub = Stub::start(snapshot(note_id, &me, 5), 5).await;
    let (session, mut events) = joined_session(&stub, me, note_id).await;

    stub.drop_connections();

    // The session dies with the connection.
    wait_for(&mut events, |e| matches!(e, SessionEvent::SessionEnded { .. })).await;
    assert!(!session.is_joined());
    assert!(session.collaborators().is_empty());

    // The stub keeps closing fresh sockets, so the retry ceiling is hit and
    // the connection parks in the terminal error status.
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ConnectionStatus(ConnectionStatus::Error))
    })
    .await;
    assert_eq!(session.status(), ConnectionStatus::Error);

    session.shutdown().await;
}

#[tokio::test]
async fn test_attempt_counter_resets_after_successful_reconnect() {
    let me = Collaborator::new("Me");
    let note_id = Uuid::new_v4();
    let stub = Stub::start(snapshot(note_id, &me, 5), 5).await;
    // First dial is dropped on the floor; the retry goes through.
    stub.reject_next_connects(1);

    let conn = ConnectionManager::new(test_config(stub.addr), Some(Credentials::new(TOKEN)));
    conn.connect().await;

    let mut rx = conn.watch_status();
    timeout(Duration::from_secs(5), async {
        while *rx.borrow_and_update() != ConnectionStatus::Connected {
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("never reached connected");

    // A successful handshake zeroes the failure counter.
    assert_eq!(conn.reconnect_attempts(), 0);
    conn.disconnect().await;
}

#[tokio::test]
async fn test_unanswered_join_is_abandoned_and_can_be_retried() {
    let me = Collaborator::new("Me");
    let note_id = Uuid::new_v4();
    let stub = Stub::start(snapshot(note_id, &me, 5), 5).await;
    stub.set_mute_join(true);

    let config = CollabConfig {
        handshake_timeout: Duration::from_millis(200),
        ..test_config(stub.addr)
    };
    let mut session = SessionController::new(config, Credentials::new(TOKEN), me, note_id);
    let mut events = session.take_event_rx().unwrap();
    session.connect().await;
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::ConnectionStatus(ConnectionStatus::Connected))
    })
    .await;

    // The server swallows the join; the deadline abandons it.
    session.join_note().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!session.is_joined());

    // A later retry succeeds once the server answers again.
    stub.set_mute_join(false);
    session.join_note().await;
    wait_for(&mut events, |e| matches!(e, SessionEvent::SessionJoined(_))).await;
    assert!(session.is_joined());
    assert_eq!(session.version(), Some(5));

    session.shutdown().await;
}
