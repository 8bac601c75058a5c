//! Version-based edit synchronization for one session.
//!
//! The synchronizer owns the session's version counter and nothing else: no
//! document content lives here. Outbound edits coalesce into one pending
//! entry that the session flushes after its debounce timer fires, stamped
//! with the version current at flush time. Inbound broadcasts either advance
//! the version or are flagged as conflicts; a conflicting edit never mutates
//! local state.

use uuid::Uuid;

use crate::protocol::{EditBroadcast, EditKind, EditRequest};

/// Result of applying an inbound edit broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum EditOutcome {
    /// A remote edit was accepted; the caller merges title/content.
    Applied(EditBroadcast),
    /// Our own edit came back acknowledged; the version advanced but there
    /// is nothing to re-render.
    OwnAck { version: u64 },
    /// The edit was computed against stale state; local state is untouched.
    Conflict(EditBroadcast),
    /// No session version is known; the broadcast is dropped.
    NotJoined,
}

#[derive(Debug, Clone, PartialEq)]
struct PendingEdit {
    kind: EditKind,
    title: Option<String>,
    content: Option<String>,
}

/// Tracks the authoritative local version and coalesces outbound edits.
pub struct EditSynchronizer {
    note_id: Uuid,
    local_user_id: Uuid,
    version: Option<u64>,
    pending: Option<PendingEdit>,
}

impl EditSynchronizer {
    pub fn new(note_id: Uuid, local_user_id: Uuid) -> Self {
        Self {
            note_id,
            local_user_id,
            version: None,
            pending: None,
        }
    }

    /// Set the version from a fresh join snapshot. The only way the version
    /// moves backwards.
    pub fn set_version(&mut self, version: u64) {
        self.version = Some(version);
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// Merge a local edit into the pending entry. No-op (returning `false`)
    /// when no session is joined.
    pub fn queue_edit(
        &mut self,
        kind: EditKind,
        title: Option<String>,
        content: Option<String>,
    ) -> bool {
        if self.version.is_none() {
            return false;
        }
        match &mut self.pending {
            Some(pending) => {
                if title.is_some() {
                    pending.title = title;
                }
                if content.is_some() {
                    pending.content = content;
                }
                pending.kind = combine_kinds(pending.kind, kind);
            }
            None => self.pending = Some(PendingEdit { kind, title, content }),
        }
        true
    }

    /// Take the pending edit, stamped with the current version as its base.
    pub fn flush_pending(&mut self) -> Option<EditRequest> {
        let pending = self.pending.take()?;
        let base_version = self.version?;
        Some(EditRequest {
            note_id: self.note_id,
            kind: pending.kind,
            title: pending.title,
            content: pending.content,
            base_version,
        })
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Apply an inbound edit broadcast against the current version.
    ///
    /// An edit conflicts iff the server flagged it, or its base version does
    /// not match the version known locally at application time. Accepted
    /// edits advance the version to the edit's resulting version; our own
    /// acknowledgments advance the version without being re-applied.
    pub fn apply_remote(&mut self, edit: EditBroadcast) -> EditOutcome {
        let Some(current) = self.version else {
            return EditOutcome::NotJoined;
        };
        if edit.has_conflict || edit.base_version != current {
            return EditOutcome::Conflict(edit);
        }
        self.version = Some(edit.resulting_version);
        if edit.editor_id == self.local_user_id {
            EditOutcome::OwnAck { version: edit.resulting_version }
        } else {
            EditOutcome::Applied(edit)
        }
    }

    /// Drop version and pending state when the session ends.
    pub fn clear(&mut self) {
        self.version = None;
        self.pending = None;
    }

    pub fn note_id(&self) -> Uuid {
        self.note_id
    }

    pub fn local_user_id(&self) -> Uuid {
        self.local_user_id
    }
}

fn combine_kinds(a: EditKind, b: EditKind) -> EditKind {
    if a == b {
        a
    } else {
        EditKind::FullUpdate
    }
}
