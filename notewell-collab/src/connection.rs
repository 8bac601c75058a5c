//! Transport connection lifecycle.
//!
//! One [`ConnectionManager`] owns one WebSocket connection and its
//! supervisor task:
//!
//! ```text
//! disconnected ──connect()──► connecting ──handshake──► connected
//!       ▲                         │  ▲                     │
//!       │                 failure │  │ fixed-delay retry   │ heartbeat loss /
//!       └──── disconnect() ◄──────┤  └─────────────────────┘ abnormal close
//!                                 │
//!                                 ▼ attempts ≥ ceiling
//!                               error   (fresh connect() required)
//! ```
//!
//! The attempt counter increments on every abnormal close and resets to zero
//! on a successful handshake. Status transitions are published on a watch
//! channel so every dependent component observes them without polling. No
//! business logic lives here: inbound `Message` frames are handed straight to
//! the [`SubscriptionRouter`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;

use crate::config::{CollabConfig, Credentials};
use crate::protocol::Frame;
use crate::router::SubscriptionRouter;

/// Connection status, observable via [`ConnectionManager::watch_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal until the caller issues a fresh `connect()`.
    Error,
}

enum AttemptEnd {
    /// `disconnect()` was requested.
    Graceful,
    /// Dial, handshake, or an established connection failed.
    Failed(String),
}

/// Owns one transport connection: connect, authenticated handshake,
/// heartbeat, bounded reconnection, and status reporting.
pub struct ConnectionManager {
    config: CollabConfig,
    credentials: RwLock<Option<Credentials>>,
    router: Arc<SubscriptionRouter>,
    status_tx: watch::Sender<ConnectionStatus>,
    outgoing: Arc<RwLock<Option<mpsc::Sender<Frame>>>>,
    attempts: Arc<AtomicU32>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: CollabConfig, credentials: Option<Credentials>) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            credentials: RwLock::new(credentials),
            router: Arc::new(SubscriptionRouter::new(status_rx)),
            status_tx,
            outgoing: Arc::new(RwLock::new(None)),
            attempts: Arc::new(AtomicU32::new(0)),
            shutdown_tx,
            supervisor: Mutex::new(None),
        }
    }

    /// The router delivering inbound messages for this connection.
    pub fn router(&self) -> Arc<SubscriptionRouter> {
        self.router.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Abnormal closes since the last successful handshake.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Replace the credentials used by the next `connect()` — the recovery
    /// path out of the terminal `Error` status.
    pub async fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.write().await = Some(credentials);
    }

    /// Establish the connection, spawning the supervisor task.
    ///
    /// Without credentials this fails silently into `Error` status. Calling
    /// while already connecting or connected is a no-op. Failures never
    /// surface here; they arrive later as status changes.
    pub async fn connect(&self) {
        match self.status() {
            ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                log::debug!("connect() ignored; already {:?}", self.status());
                return;
            }
            _ => {}
        }

        let credentials = self.credentials.read().await.clone();
        let Some(credentials) = credentials else {
            log::warn!("connect() without credentials; entering error status");
            self.status_tx.send_replace(ConnectionStatus::Error);
            return;
        };

        self.attempts.store(0, Ordering::SeqCst);
        self.shutdown_tx.send_replace(false);
        self.status_tx.send_replace(ConnectionStatus::Connecting);

        let mut supervisor = self.supervisor.lock().await;
        if let Some(stale) = supervisor.take() {
            stale.abort();
        }
        *supervisor = Some(tokio::spawn(supervise(
            self.config.clone(),
            credentials,
            self.router.clone(),
            self.status_tx.clone(),
            self.outgoing.clone(),
            self.attempts.clone(),
            self.shutdown_tx.subscribe(),
        )));
    }

    /// Tear down subscriptions, then close the transport. Idempotent.
    pub async fn disconnect(&self) {
        self.router.clear();
        self.shutdown_tx.send_replace(true);
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            supervisor.abort();
        }
        self.outgoing.write().await.take();
        self.status_tx.send_replace(ConnectionStatus::Disconnected);
    }

    /// Publish a message body to a destination.
    ///
    /// While not connected this warns and drops the message; it never
    /// errors, never queues, and never blocks.
    pub async fn send(&self, destination: &str, body: Vec<u8>) {
        if self.status() != ConnectionStatus::Connected {
            log::warn!(
                "send to {destination} while {:?}; message dropped",
                self.status()
            );
            return;
        }
        let outgoing = self.outgoing.read().await;
        match outgoing.as_ref() {
            Some(tx) => {
                let frame = Frame::Publish {
                    destination: destination.to_string(),
                    body,
                };
                if tx.try_send(frame).is_err() {
                    log::warn!("outgoing queue full; message for {destination} dropped");
                }
            }
            None => log::warn!("no active transport; message for {destination} dropped"),
        }
    }
}

/// Reconnection loop: one `run_attempt` per iteration, fixed delay between
/// failures, terminal `Error` once the ceiling is hit.
async fn supervise(
    config: CollabConfig,
    credentials: Credentials,
    router: Arc<SubscriptionRouter>,
    status: watch::Sender<ConnectionStatus>,
    outgoing: Arc<RwLock<Option<mpsc::Sender<Frame>>>>,
    attempts: Arc<AtomicU32>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            status.send_replace(ConnectionStatus::Disconnected);
            return;
        }
        status.send_replace(ConnectionStatus::Connecting);

        let end = run_attempt(
            &config,
            &credentials,
            &router,
            &status,
            &outgoing,
            &attempts,
            &mut shutdown,
        )
        .await;
        outgoing.write().await.take();

        match end {
            AttemptEnd::Graceful => {
                status.send_replace(ConnectionStatus::Disconnected);
                return;
            }
            AttemptEnd::Failed(reason) => {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= config.max_reconnect_attempts {
                    log::error!("giving up after {n} failed connection attempts: {reason}");
                    status.send_replace(ConnectionStatus::Error);
                    return;
                }
                log::warn!(
                    "connection attempt {n} failed ({reason}); retrying in {:?}",
                    config.reconnect_delay
                );
                tokio::select! {
                    _ = sleep(config.reconnect_delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// One dial + handshake + connected-session lifetime.
async fn run_attempt(
    config: &CollabConfig,
    credentials: &Credentials,
    router: &Arc<SubscriptionRouter>,
    status: &watch::Sender<ConnectionStatus>,
    outgoing: &Arc<RwLock<Option<mpsc::Sender<Frame>>>>,
    attempts: &Arc<AtomicU32>,
    shutdown: &mut watch::Receiver<bool>,
) -> AttemptEnd {
    let ws = match timeout(
        config.handshake_timeout,
        tokio_tungstenite::connect_async(config.server_url.as_str()),
    )
    .await
    {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => return AttemptEnd::Failed(format!("dial failed: {e}")),
        Err(_) => return AttemptEnd::Failed("dial timed out".to_string()),
    };
    let (mut ws_writer, mut ws_reader) = ws.split();

    // Authenticated handshake: Connect must be answered by Connected.
    let hello = match (Frame::Connect { token: credentials.token.clone() }).encode() {
        Ok(bytes) => bytes,
        Err(e) => return AttemptEnd::Failed(format!("handshake encode: {e}")),
    };
    if let Err(e) = ws_writer.send(Message::Binary(hello.into())).await {
        return AttemptEnd::Failed(format!("handshake send: {e}"));
    }
    match timeout(config.handshake_timeout, ws_reader.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => {
            let bytes: Vec<u8> = data.into();
            match Frame::decode(&bytes) {
                Ok(Frame::Connected) => {}
                _ => return AttemptEnd::Failed("handshake rejected".to_string()),
            }
        }
        Ok(_) => return AttemptEnd::Failed("connection closed during handshake".to_string()),
        Err(_) => return AttemptEnd::Failed("handshake timed out".to_string()),
    }

    attempts.store(0, Ordering::SeqCst);
    status.send_replace(ConnectionStatus::Connected);
    log::info!("connected to {}", config.server_url);

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(config.outgoing_capacity);
    *outgoing.write().await = Some(out_tx.clone());

    // Writer task: forward the outgoing queue onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(encoded) = frame.encode() else { continue };
            if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                break;
            }
        }
    });

    let mut heartbeat = interval(config.heartbeat_interval);
    let mut last_seen = Instant::now();
    let end = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break AttemptEnd::Graceful;
                }
            }
            msg = ws_reader.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    last_seen = Instant::now();
                    let bytes: Vec<u8> = data.into();
                    match Frame::decode(&bytes) {
                        Ok(Frame::Message { destination, body }) => {
                            router.dispatch(&destination, &body);
                        }
                        Ok(Frame::Ping) => {
                            let _ = out_tx.try_send(Frame::Pong);
                        }
                        Ok(Frame::Pong) => {}
                        Ok(other) => log::debug!("ignoring unexpected frame: {other:?}"),
                        Err(e) => log::warn!("dropping undecodable frame: {e}"),
                    }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    last_seen = Instant::now();
                }
                Some(Ok(Message::Close(_))) | None => {
                    break AttemptEnd::Failed("closed by server".to_string());
                }
                Some(Err(e)) => break AttemptEnd::Failed(format!("socket error: {e}")),
                _ => {}
            },
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > config.heartbeat_interval * 2 {
                    break AttemptEnd::Failed("heartbeat lost".to_string());
                }
                if out_tx.try_send(Frame::Ping).is_err() {
                    break AttemptEnd::Failed("writer gone".to_string());
                }
            }
        }
    };
    writer.abort();
    end
}
