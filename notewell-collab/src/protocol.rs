//! Wire protocol for the note collaboration transport.
//!
//! Every WebSocket binary payload is one bincode-encoded [`Frame`]. Frames
//! either belong to the connection layer (`Connect`/`Connected`,
//! `Ping`/`Pong`) or carry an application message addressed to a destination:
//!
//! ```text
//! caller ──Publish{destination, body}──► server
//! caller ◄──Message{destination, body}── server
//! ```
//!
//! Destinations follow the patterns of the session protocol: per-note
//! broadcast topics (edits, cursors, presence) and private per-caller queues
//! (session snapshot, errors). Message bodies are themselves bincode-encoded
//! payload structs defined below.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};

/// Encode any payload with the standard wire configuration.
pub fn encode<T: Serialize>(value: &T) -> CollabResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CollabError::Encode(e.to_string()))
}

/// Decode any payload with the standard wire configuration.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CollabResult<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CollabError::Decode(e.to_string()))?;
    Ok(value)
}

/// Top-level transport frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Frame {
    /// Authenticated handshake, first frame after the socket opens.
    Connect { token: String },
    /// Server acknowledgment of a successful handshake.
    Connected,
    /// Caller → server message for an application endpoint.
    Publish { destination: String, body: Vec<u8> },
    /// Server → caller message delivered to a subscribed destination.
    Message { destination: String, body: Vec<u8> },
    /// Heartbeat request.
    Ping,
    /// Heartbeat response.
    Pong,
}

impl Frame {
    pub fn encode(&self) -> CollabResult<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> CollabResult<Self> {
        decode(bytes)
    }
}

/// Destination patterns for the session protocol.
pub mod dest {
    use uuid::Uuid;

    /// Broadcast topic for edit messages of one note.
    pub fn edits_topic(note_id: Uuid) -> String {
        format!("/topic/notes/{note_id}/edits")
    }

    /// Broadcast topic for cursor updates of one note.
    pub fn cursors_topic(note_id: Uuid) -> String {
        format!("/topic/notes/{note_id}/cursors")
    }

    /// Broadcast topic for presence events of one note.
    pub fn presence_topic(note_id: Uuid) -> String {
        format!("/topic/notes/{note_id}/presence")
    }

    /// Private per-caller queue carrying the join snapshot.
    pub const SNAPSHOT_QUEUE: &str = "/user/queue/note-session";

    /// Private per-caller queue carrying edit-shaped error payloads.
    pub const ERRORS_QUEUE: &str = "/user/queue/errors";

    pub fn join_endpoint(note_id: Uuid) -> String {
        format!("/app/notes/{note_id}/join")
    }

    pub fn leave_endpoint(note_id: Uuid) -> String {
        format!("/app/notes/{note_id}/leave")
    }

    pub fn edit_endpoint(note_id: Uuid) -> String {
        format!("/app/notes/{note_id}/edit")
    }

    pub fn cursor_endpoint(note_id: Uuid) -> String {
        format!("/app/notes/{note_id}/cursor")
    }

    pub fn typing_endpoint(note_id: Uuid) -> String {
        format!("/app/notes/{note_id}/typing")
    }

    pub fn stopped_typing_endpoint(note_id: Uuid) -> String {
        format!("/app/notes/{note_id}/stopped-typing")
    }
}

/// What part of the note an edit touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditKind {
    TitleUpdate,
    ContentUpdate,
    FullUpdate,
}

/// A joined collaborator with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Collaborator {
    pub user_id: Uuid,
    pub display_name: String,
    /// RGBA color for cursor/selection rendering, stable per user id.
    pub color: [f32; 4],
    pub joined_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl Collaborator {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), display_name)
    }

    pub fn with_id(user_id: Uuid, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            display_name: display_name.into(),
            color: Self::color_for(user_id),
            joined_at: now,
            last_active_at: now,
        }
    }

    /// Derive a stable color from the user id hash.
    fn color_for(user_id: Uuid) -> [f32; 4] {
        let hash = user_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        [r, g, b, 1.0]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRequest {
    pub note_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaveRequest {
    pub note_id: Uuid,
}

/// Sent on the typing / stopped-typing endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypingNotice {
    pub note_id: Uuid,
    pub user_id: Uuid,
}

/// Outbound edit, stamped with the version it was computed against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditRequest {
    pub note_id: Uuid,
    pub kind: EditKind,
    pub title: Option<String>,
    pub content: Option<String>,
    pub base_version: u64,
}

/// Inbound edit broadcast (or edit-shaped error payload).
///
/// `has_conflict` is set by the server when `base_version` did not match its
/// authoritative version; the client additionally re-checks against its own
/// version at application time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditBroadcast {
    pub note_id: Uuid,
    /// Identity of the user whose edit this is.
    pub editor_id: Uuid,
    pub kind: EditKind,
    pub title: Option<String>,
    pub content: Option<String>,
    pub base_version: u64,
    pub resulting_version: u64,
    pub has_conflict: bool,
    pub conflict_message: Option<String>,
}

/// Cursor broadcast; replaces any prior cursor for the same user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CursorUpdate {
    pub note_id: Uuid,
    pub user_id: Uuid,
    pub position: u64,
    pub selection_start: Option<u64>,
    pub selection_end: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceEventKind {
    UserJoined,
    UserLeft,
    UserTyping,
    UserStoppedTyping,
}

/// Presence event broadcast on the per-note presence topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceNotice {
    pub event: PresenceEventKind,
    pub collaborator: Collaborator,
    pub total_collaborators: u32,
}

/// Authoritative session state delivered on the private snapshot queue after
/// a join request. Fully replaces local session state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub note_id: Uuid,
    pub version: u64,
    pub title: String,
    pub content: String,
    pub collaborators: Vec<Collaborator>,
    pub cursors: Vec<CursorUpdate>,
}
