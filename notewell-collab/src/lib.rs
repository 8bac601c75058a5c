//! Real-time note collaboration client.
//!
//! Connects a note editor to the collaboration server over a WebSocket
//! transport, keeping edits, cursors, and presence in sync across everyone
//! viewing the same note:
//!
//! ```text
//!                    ┌───────────────────┐
//!   editor calls ───►│ SessionController │───► SessionEvent channel
//!                    └─────────┬─────────┘
//!            ┌─────────────────┼──────────────────┐
//!            ▼                 ▼                  ▼
//!   ┌────────────────┐ ┌─────────────────┐ ┌──────────────────┐
//!   │ PresenceTracker│ │ EditSynchronizer│ │ ConnectionManager│
//!   └────────────────┘ └─────────────────┘ └────────┬─────────┘
//!                                                   ▼
//!                                          ┌────────────────────┐
//!                                          │ SubscriptionRouter │
//!                                          └────────────────────┘
//! ```
//!
//! The [`ConnectionManager`] owns the socket: authenticated handshake,
//! heartbeats, and bounded reconnection. The [`SubscriptionRouter`] fans
//! inbound messages out to destination callbacks. The [`SessionController`]
//! is the caller-facing surface: join a note, send debounced edits and
//! cursor positions, and consume [`SessionEvent`]s. Concurrent edits are
//! resolved last-write-wins by version number; conflicting edits surface as
//! events and never touch local state.
//!
//! ```no_run
//! use notewell_collab::{
//!     CollabConfig, Collaborator, Credentials, EditKind, SessionController,
//! };
//! use uuid::Uuid;
//!
//! # async fn demo() {
//! let mut session = SessionController::new(
//!     CollabConfig::default(),
//!     Credentials::new("bearer-token"),
//!     Collaborator::new("Alice"),
//!     Uuid::new_v4(),
//! );
//! let mut events = session.take_event_rx().unwrap();
//!
//! session.connect().await;
//! session.join_note().await;
//! session.send_edit(EditKind::ContentUpdate, None, Some("hello".into())).await;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # }
//! ```

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod session;
pub mod sync;
pub mod timer;

pub use api::SnapshotApi;
pub use config::{CollabConfig, Credentials};
pub use connection::{ConnectionManager, ConnectionStatus};
pub use error::{CollabError, CollabResult};
pub use presence::{PresenceChange, PresenceTracker};
pub use protocol::{
    Collaborator, CursorUpdate, EditBroadcast, EditKind, EditRequest, Frame, PresenceEventKind,
    PresenceNotice, SessionSnapshot,
};
pub use router::{SubscriptionHandle, SubscriptionRouter};
pub use session::{SessionController, SessionEvent, SessionStats};
pub use sync::{EditOutcome, EditSynchronizer};
pub use timer::ResettableTimer;
