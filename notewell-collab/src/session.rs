//! Session orchestration: join/leave lifecycle and component wiring.
//!
//! One [`SessionController`] per (note, caller). It requests a connection
//! from the [`ConnectionManager`], registers the note's broadcast topics and
//! the caller's private queues with the [`SubscriptionRouter`], and routes
//! inbound messages to the [`PresenceTracker`] or [`EditSynchronizer`].
//! Outbound user actions (edit, cursor move) flow back out through the
//! connection, with edits debounced behind the session-owned timer.
//!
//! Everything the caller observes arrives as a [`SessionEvent`] on the
//! channel returned by [`SessionController::take_event_rx`]. Per the error
//! design, only connection status and conflicts are meant to reach the UI;
//! the rest of the event stream is state change notification.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::api::SnapshotApi;
use crate::config::{CollabConfig, Credentials};
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::error::{CollabError, CollabResult};
use crate::presence::{PresenceChange, PresenceTracker};
use crate::protocol::{
    self, dest, Collaborator, CursorUpdate, EditBroadcast, EditKind, EditRequest, JoinRequest,
    LeaveRequest, PresenceNotice, SessionSnapshot, TypingNotice,
};
use crate::router::{SubscriptionHandle, SubscriptionRouter};
use crate::sync::{EditOutcome, EditSynchronizer};
use crate::timer::ResettableTimer;

/// Events emitted to the caller.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionStatus(ConnectionStatus),
    /// Join snapshot received; local state was fully replaced.
    SessionJoined(SessionSnapshot),
    /// The session ended (leave, connection loss, or disposal).
    SessionEnded { note_id: Uuid },
    /// A remote edit was accepted; merge title/content into caller state.
    EditApplied(EditBroadcast),
    /// An edit was computed against stale state; caller decides whether to
    /// force-refresh. Local state is untouched.
    EditConflict(EditBroadcast),
    CollaboratorJoined(Collaborator),
    CollaboratorLeft { user_id: Uuid },
    CursorMoved(CursorUpdate),
    TypingStarted { user_id: Uuid },
    TypingStopped { user_id: Uuid },
}

/// Session counters, in the spirit of transport-level stats.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub edits_queued: u64,
    pub edits_sent: u64,
    pub edits_applied: u64,
    pub edits_acknowledged: u64,
    pub conflicts: u64,
}

struct SessionState {
    joined: bool,
    /// Join request sent, snapshot not yet received.
    joining: bool,
    /// We announced "typing" and have not yet flushed the burst.
    typing_active: bool,
    presence: PresenceTracker,
    sync: EditSynchronizer,
    subscriptions: Vec<SubscriptionHandle>,
    debounce_timer: ResettableTimer,
    typing_expiry: ResettableTimer,
    join_deadline: ResettableTimer,
    stats: SessionStats,
}

impl SessionState {
    fn reset(&mut self) {
        self.joined = false;
        self.joining = false;
        self.typing_active = false;
        self.presence.clear();
        self.sync.clear();
        self.debounce_timer.cancel();
        self.typing_expiry.cancel();
        self.join_deadline.cancel();
    }
}

type SharedState = Arc<Mutex<SessionState>>;
type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Public API for one live note collaboration session.
pub struct SessionController {
    note_id: Uuid,
    me: Collaborator,
    config: CollabConfig,
    connection: Arc<ConnectionManager>,
    router: Arc<SubscriptionRouter>,
    state: SharedState,
    events_tx: EventSender,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    snapshot_api: Option<Arc<dyn SnapshotApi>>,
    status_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Create a controller for one note. Must be called within a tokio
    /// runtime (the status watcher task is spawned here).
    pub fn new(
        config: CollabConfig,
        credentials: Credentials,
        me: Collaborator,
        note_id: Uuid,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(config.clone(), Some(credentials)));
        let router = connection.router();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let state: SharedState = Arc::new(Mutex::new(SessionState {
            joined: false,
            joining: false,
            typing_active: false,
            presence: PresenceTracker::new(me.user_id, config.typing_ttl),
            sync: EditSynchronizer::new(note_id, me.user_id),
            subscriptions: Vec::new(),
            debounce_timer: ResettableTimer::new(),
            typing_expiry: ResettableTimer::new(),
            join_deadline: ResettableTimer::new(),
            stats: SessionStats::default(),
        }));

        let status_task = Self::spawn_status_watcher(
            connection.watch_status(),
            router.clone(),
            state.clone(),
            events_tx.clone(),
            note_id,
        );

        Self {
            note_id,
            me,
            config,
            connection,
            router,
            state,
            events_tx,
            events_rx: Some(events_rx),
            snapshot_api: None,
            status_task: Mutex::new(Some(status_task)),
        }
    }

    /// Attach the REST fallback used by [`refresh_snapshot`].
    ///
    /// [`refresh_snapshot`]: SessionController::refresh_snapshot
    pub fn attach_snapshot_api(&mut self, api: Arc<dyn SnapshotApi>) {
        self.snapshot_api = Some(api);
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    pub async fn connect(&self) {
        self.connection.connect().await;
    }

    /// Leave the session (if joined) and close the connection.
    pub async fn shutdown(&self) {
        self.leave_note().await;
        self.connection.disconnect().await;
        if let Some(task) = self.status_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Join the note session. A no-op unless connected and not already
    /// joined. The snapshot response flips the session to joined; a join
    /// the server never answers within the handshake deadline is abandoned,
    /// so `join_note` can be retried.
    pub async fn join_note(&self) {
        if self.connection.status() != ConnectionStatus::Connected {
            log::warn!("join_note while not connected; ignored");
            return;
        }
        {
            let st = self.state.lock().unwrap();
            if st.joined || st.joining {
                log::debug!("join_note: already joined note {}", self.note_id);
                return;
            }
        }

        // Register handlers before the join request so the snapshot and any
        // immediately following broadcasts cannot race past us.
        let mut handles = Vec::new();

        let (state, events) = (self.state.clone(), self.events_tx.clone());
        handles.extend(self.router.subscribe::<EditBroadcast, _>(
            &dest::edits_topic(self.note_id),
            move |edit| Self::on_remote_edit(&state, &events, edit),
        ));

        let (state, events) = (self.state.clone(), self.events_tx.clone());
        handles.extend(self.router.subscribe::<CursorUpdate, _>(
            &dest::cursors_topic(self.note_id),
            move |cursor| Self::on_cursor(&state, &events, cursor),
        ));

        let (state, events) = (self.state.clone(), self.events_tx.clone());
        handles.extend(self.router.subscribe::<PresenceNotice, _>(
            &dest::presence_topic(self.note_id),
            move |notice| Self::on_presence(&state, &events, notice),
        ));

        let (state, events) = (self.state.clone(), self.events_tx.clone());
        handles.extend(self.router.subscribe::<SessionSnapshot, _>(
            dest::SNAPSHOT_QUEUE,
            move |snapshot| Self::on_snapshot(&state, &events, snapshot),
        ));

        let (state, events) = (self.state.clone(), self.events_tx.clone());
        handles.extend(self.router.subscribe::<EditBroadcast, _>(
            dest::ERRORS_QUEUE,
            move |edit| Self::on_error(&state, &events, edit),
        ));

        {
            let mut st = self.state.lock().unwrap();
            st.joining = true;
            st.subscriptions = handles;

            let (state, router) = (self.state.clone(), self.router.clone());
            st.join_deadline.arm(self.config.handshake_timeout, async move {
                Self::abandon_unanswered_join(state, router);
            });
        }

        match protocol::encode(&JoinRequest { note_id: self.note_id }) {
            Ok(body) => self.connection.send(&dest::join_endpoint(self.note_id), body).await,
            Err(e) => log::warn!("join request encode failed: {e}"),
        }
    }

    /// Leave the session: send the leave request, unsubscribe every topic
    /// and queue for the note, clear all local state, cancel all timers.
    /// Collaborators, cursors, and typing state are empty once this returns.
    pub async fn leave_note(&self) {
        let (was_active, handles) = {
            let mut st = self.state.lock().unwrap();
            let was_active = st.joined || st.joining;
            let handles = std::mem::take(&mut st.subscriptions);
            st.reset();
            (was_active, handles)
        };
        for handle in handles {
            self.router.unsubscribe(handle);
        }
        if !was_active {
            return;
        }
        match protocol::encode(&LeaveRequest { note_id: self.note_id }) {
            Ok(body) => self.connection.send(&dest::leave_endpoint(self.note_id), body).await,
            Err(e) => log::warn!("leave request encode failed: {e}"),
        }
        let _ = self.events_tx.send(SessionEvent::SessionEnded { note_id: self.note_id });
    }

    /// Queue a local edit. Effective only while joined. Rapid calls collapse
    /// into one outbound message after the debounce quiet period; the first
    /// call of a burst also announces "typing", and the flush announces
    /// "stopped typing".
    pub async fn send_edit(&self, kind: EditKind, title: Option<String>, content: Option<String>) {
        let starts_burst = {
            let mut st = self.state.lock().unwrap();
            if !st.joined {
                log::warn!("send_edit before join; ignored");
                return;
            }
            if !st.sync.queue_edit(kind, title, content) {
                return;
            }
            st.stats.edits_queued += 1;

            let starts_burst = !st.typing_active;
            st.typing_active = true;

            let (state, connection, note_id) =
                (self.state.clone(), self.connection.clone(), self.note_id);
            st.debounce_timer.arm(self.config.edit_debounce, async move {
                Self::flush_pending_edit(state, connection, note_id).await;
            });
            starts_burst
        };

        if starts_burst {
            match protocol::encode(&TypingNotice { note_id: self.note_id, user_id: self.me.user_id }) {
                Ok(body) => self.connection.send(&dest::typing_endpoint(self.note_id), body).await,
                Err(e) => log::warn!("typing notice encode failed: {e}"),
            }
        }
    }

    /// Broadcast the local cursor position. Effective only while joined.
    pub async fn update_cursor(&self, position: u64, selection: Option<(u64, u64)>) {
        {
            let st = self.state.lock().unwrap();
            if !st.joined {
                log::debug!("update_cursor before join; ignored");
                return;
            }
        }
        let cursor = CursorUpdate {
            note_id: self.note_id,
            user_id: self.me.user_id,
            position,
            selection_start: selection.map(|(start, _)| start),
            selection_end: selection.map(|(_, end)| end),
        };
        match protocol::encode(&cursor) {
            Ok(body) => self.connection.send(&dest::cursor_endpoint(self.note_id), body).await,
            Err(e) => log::warn!("cursor update encode failed: {e}"),
        }
    }

    /// Fetch the snapshot over the REST fallback and replace local state
    /// with it — the recovery path after a conflict, or when the real-time
    /// channel is unavailable.
    pub async fn refresh_snapshot(&self) -> CollabResult<()> {
        let Some(api) = self.snapshot_api.as_ref() else {
            return Err(CollabError::Snapshot("no snapshot service attached".into()));
        };
        let snapshot = api.fetch_snapshot(self.note_id).await?;
        Self::on_snapshot(&self.state, &self.events_tx, snapshot);
        Ok(())
    }

    // ── Inbound message handlers ─────────────────────────────────────

    fn on_remote_edit(state: &SharedState, events: &EventSender, edit: EditBroadcast) {
        let mut st = state.lock().unwrap();
        if !st.joined {
            log::debug!("edit broadcast for inactive session dropped");
            return;
        }
        match st.sync.apply_remote(edit) {
            EditOutcome::Applied(edit) => {
                st.stats.edits_applied += 1;
                st.presence.touch(edit.editor_id, Utc::now());
                let _ = events.send(SessionEvent::EditApplied(edit));
            }
            EditOutcome::OwnAck { version } => {
                st.stats.edits_acknowledged += 1;
                log::debug!("own edit acknowledged at version {version}");
            }
            EditOutcome::Conflict(edit) => {
                st.stats.conflicts += 1;
                let _ = events.send(SessionEvent::EditConflict(edit));
            }
            EditOutcome::NotJoined => {}
        }
    }

    fn on_error(state: &SharedState, events: &EventSender, edit: EditBroadcast) {
        let mut st = state.lock().unwrap();
        st.stats.conflicts += 1;
        log::warn!(
            "server rejected edit on note {} (base version {}): {}",
            edit.note_id,
            edit.base_version,
            edit.conflict_message.as_deref().unwrap_or("conflict")
        );
        let _ = events.send(SessionEvent::EditConflict(edit));
    }

    fn on_cursor(state: &SharedState, events: &EventSender, cursor: CursorUpdate) {
        let mut st = state.lock().unwrap();
        if !st.joined {
            return;
        }
        if st.presence.apply_cursor(cursor.clone()) {
            let _ = events.send(SessionEvent::CursorMoved(cursor));
        }
    }

    fn on_presence(state: &SharedState, events: &EventSender, notice: PresenceNotice) {
        let mut st = state.lock().unwrap();
        if !st.joined && !st.joining {
            return;
        }
        match st.presence.apply_notice(&notice, Instant::now()) {
            Some(PresenceChange::Joined(collaborator)) => {
                let _ = events.send(SessionEvent::CollaboratorJoined(collaborator));
            }
            Some(PresenceChange::Left { user_id }) => {
                let _ = events.send(SessionEvent::CollaboratorLeft { user_id });
            }
            Some(PresenceChange::TypingStarted { user_id }) => {
                let _ = events.send(SessionEvent::TypingStarted { user_id });
            }
            Some(PresenceChange::TypingStopped { user_id }) => {
                let _ = events.send(SessionEvent::TypingStopped { user_id });
            }
            None => {}
        }
        Self::rearm_typing_expiry(&mut st, state, events);
    }

    fn on_snapshot(state: &SharedState, events: &EventSender, snapshot: SessionSnapshot) {
        let mut st = state.lock().unwrap();
        st.presence.replace_from_snapshot(&snapshot);
        st.sync.set_version(snapshot.version);
        st.typing_expiry.cancel();
        st.join_deadline.cancel();
        st.joined = true;
        st.joining = false;
        log::info!(
            "joined note {} at version {} with {} collaborators",
            snapshot.note_id,
            snapshot.version,
            snapshot.collaborators.len()
        );
        let _ = events.send(SessionEvent::SessionJoined(snapshot));
    }

    // ── Timer-driven paths ───────────────────────────────────────────

    /// Abandon a join the server never answered so `join_note` can be
    /// retried. Does nothing if the snapshot arrived in the meantime.
    fn abandon_unanswered_join(state: SharedState, router: Arc<SubscriptionRouter>) {
        let handles = {
            let mut st = state.lock().unwrap();
            if st.joined || !st.joining {
                return;
            }
            log::warn!("join request unanswered; abandoning join");
            st.joining = false;
            std::mem::take(&mut st.subscriptions)
        };
        for handle in handles {
            router.unsubscribe(handle);
        }
    }

    /// Re-arm the typing expiry timer for the earliest outstanding deadline.
    fn rearm_typing_expiry(st: &mut SessionState, state: &SharedState, events: &EventSender) {
        match st.presence.next_typing_deadline() {
            Some(deadline) => {
                let (state, events) = (state.clone(), events.clone());
                st.typing_expiry.arm_at(deadline, async move {
                    let mut st = state.lock().unwrap();
                    for user_id in st.presence.expire_typing(Instant::now()) {
                        let _ = events.send(SessionEvent::TypingStopped { user_id });
                    }
                    Self::rearm_typing_expiry(&mut st, &state, &events);
                });
            }
            None => st.typing_expiry.cancel(),
        }
    }

    /// Debounce flush: send the coalesced edit and the stopped-typing
    /// notice.
    async fn flush_pending_edit(state: SharedState, connection: Arc<ConnectionManager>, note_id: Uuid) {
        let (request, user_id): (Option<EditRequest>, Uuid) = {
            let mut st = state.lock().unwrap();
            st.typing_active = false;
            let request = st.sync.flush_pending();
            if request.is_some() {
                st.stats.edits_sent += 1;
            }
            (request, st.sync.local_user_id())
        };

        if let Some(request) = request {
            match protocol::encode(&request) {
                Ok(body) => connection.send(&dest::edit_endpoint(note_id), body).await,
                Err(e) => log::warn!("edit request encode failed: {e}"),
            }
        }
        match protocol::encode(&TypingNotice { note_id, user_id }) {
            Ok(body) => connection.send(&dest::stopped_typing_endpoint(note_id), body).await,
            Err(e) => log::warn!("stopped-typing notice encode failed: {e}"),
        }
    }

    fn spawn_status_watcher(
        mut status_rx: tokio::sync::watch::Receiver<ConnectionStatus>,
        router: Arc<SubscriptionRouter>,
        state: SharedState,
        events: EventSender,
        note_id: Uuid,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last = *status_rx.borrow();
            while status_rx.changed().await.is_ok() {
                let status = *status_rx.borrow();
                if status == last {
                    continue;
                }
                last = status;
                let _ = events.send(SessionEvent::ConnectionStatus(status));

                // Connection loss destroys the session; the caller re-joins
                // after a successful reconnect.
                if status != ConnectionStatus::Connected {
                    let handles = {
                        let mut st = state.lock().unwrap();
                        if !st.joined && !st.joining {
                            continue;
                        }
                        let handles = std::mem::take(&mut st.subscriptions);
                        st.reset();
                        handles
                    };
                    for handle in handles {
                        router.unsubscribe(handle);
                    }
                    let _ = events.send(SessionEvent::SessionEnded { note_id });
                }
            }
        })
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn note_id(&self) -> Uuid {
        self.note_id
    }

    pub fn local_user(&self) -> &Collaborator {
        &self.me
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn is_joined(&self) -> bool {
        self.state.lock().unwrap().joined
    }

    pub fn version(&self) -> Option<u64> {
        self.state.lock().unwrap().sync.version()
    }

    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.state.lock().unwrap().presence.collaborators()
    }

    pub fn cursors(&self) -> Vec<CursorUpdate> {
        self.state.lock().unwrap().presence.cursors()
    }

    pub fn typing_users(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().presence.typing_users(Instant::now())
    }

    pub fn stats(&self) -> SessionStats {
        self.state.lock().unwrap().stats
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(task) = self.status_task.lock().unwrap().take() {
            task.abort();
        }
        // Timers abort via ResettableTimer::drop once the last state Arc
        // (held by router closures until unsubscribed) goes away.
    }
}
