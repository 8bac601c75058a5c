//! Interfaces to external collaborators of the sync core.
//!
//! The document storage backend, notification, and report subsystems are
//! consumed through plain request/response calls and are not part of this
//! crate; only the REST fallback surface the session actually needs is
//! modelled here. Implementations live with the caller.

use futures_util::future::BoxFuture;
use uuid::Uuid;

use crate::error::CollabResult;
use crate::protocol::SessionSnapshot;

/// REST fallback for when the real-time channel is unavailable (or after a
/// conflict, when the caller wants a force-refresh).
pub trait SnapshotApi: Send + Sync {
    /// Fetch the authoritative session snapshot for a note — the same shape
    /// the join response delivers over the transport.
    fn fetch_snapshot(&self, note_id: Uuid) -> BoxFuture<'_, CollabResult<SessionSnapshot>>;

    /// Current collaborator count for a note.
    fn collaborator_count(&self, note_id: Uuid) -> BoxFuture<'_, CollabResult<usize>>;
}
