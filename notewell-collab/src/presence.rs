//! Collaborator presence, cursors, and typing indicators for one session.
//!
//! [`PresenceTracker`] is plain state plus transition logic; it holds no
//! timers of its own. Typing entries carry per-user expiry deadlines, and the
//! session drives expiry through its cancellable timer, re-armed to the
//! earliest outstanding deadline. Malformed or irrelevant events are dropped;
//! nothing in this module fails.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::{Collaborator, CursorUpdate, PresenceEventKind, PresenceNotice, SessionSnapshot};

/// State transition produced by a presence event, for the session to turn
/// into a caller-visible event.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    Joined(Collaborator),
    Left { user_id: Uuid },
    TypingStarted { user_id: Uuid },
    TypingStopped { user_id: Uuid },
}

/// Tracks who is in the session, where their cursors are, and who is typing.
pub struct PresenceTracker {
    local_user_id: Uuid,
    typing_ttl: Duration,
    collaborators: HashMap<Uuid, Collaborator>,
    cursors: HashMap<Uuid, CursorUpdate>,
    /// user id → expiry deadline. Entries past their deadline are never
    /// reported, even before the sweep removes them.
    typing: HashMap<Uuid, Instant>,
}

impl PresenceTracker {
    pub fn new(local_user_id: Uuid, typing_ttl: Duration) -> Self {
        Self {
            local_user_id,
            typing_ttl,
            collaborators: HashMap::new(),
            cursors: HashMap::new(),
            typing: HashMap::new(),
        }
    }

    /// Apply a presence event. Events about the local user are self-echo and
    /// are ignored. Returns the change to surface, if any.
    pub fn apply_notice(&mut self, notice: &PresenceNotice, now: Instant) -> Option<PresenceChange> {
        let user_id = notice.collaborator.user_id;
        if user_id == self.local_user_id {
            return None;
        }

        match notice.event {
            PresenceEventKind::UserJoined => {
                if self.collaborators.contains_key(&user_id) {
                    self.touch(user_id, Utc::now());
                    None
                } else {
                    self.collaborators.insert(user_id, notice.collaborator.clone());
                    Some(PresenceChange::Joined(notice.collaborator.clone()))
                }
            }
            PresenceEventKind::UserLeft => {
                let known = self.collaborators.remove(&user_id).is_some();
                self.cursors.remove(&user_id);
                self.typing.remove(&user_id);
                known.then_some(PresenceChange::Left { user_id })
            }
            PresenceEventKind::UserTyping => {
                self.touch(user_id, Utc::now());
                // Re-triggering replaces the previous deadline.
                let fresh = self.typing.insert(user_id, now + self.typing_ttl).is_none();
                fresh.then_some(PresenceChange::TypingStarted { user_id })
            }
            PresenceEventKind::UserStoppedTyping => {
                let was_typing = self.typing.remove(&user_id).is_some();
                was_typing.then_some(PresenceChange::TypingStopped { user_id })
            }
        }
    }

    /// Replace the cursor entry for the update's user. Own cursor echoes are
    /// ignored. Returns whether the update was recorded.
    pub fn apply_cursor(&mut self, cursor: CursorUpdate) -> bool {
        if cursor.user_id == self.local_user_id {
            return false;
        }
        self.touch(cursor.user_id, Utc::now());
        self.cursors.insert(cursor.user_id, cursor);
        true
    }

    /// Remove typing entries whose deadline has elapsed; returns the users
    /// removed so the session can emit stopped-typing events.
    pub fn expire_typing(&mut self, now: Instant) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .typing
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for user_id in &expired {
            self.typing.remove(user_id);
        }
        expired
    }

    /// Earliest outstanding typing deadline, for re-arming the expiry timer.
    pub fn next_typing_deadline(&self) -> Option<Instant> {
        self.typing.values().min().copied()
    }

    /// Users currently typing. Entries past their deadline are excluded.
    pub fn typing_users(&self, now: Instant) -> Vec<Uuid> {
        self.typing
            .iter()
            .filter(|(_, deadline)| **deadline > now)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Replace all presence state with the join snapshot. Typing state never
    /// survives a fresh snapshot.
    pub fn replace_from_snapshot(&mut self, snapshot: &SessionSnapshot) {
        self.collaborators = snapshot
            .collaborators
            .iter()
            .map(|c| (c.user_id, c.clone()))
            .collect();
        self.cursors = snapshot
            .cursors
            .iter()
            .map(|c| (c.user_id, c.clone()))
            .collect();
        self.typing.clear();
    }

    pub fn clear(&mut self) {
        self.collaborators.clear();
        self.cursors.clear();
        self.typing.clear();
    }

    /// Refresh a collaborator's activity timestamp, if they are known.
    pub fn touch(&mut self, user_id: Uuid, when: DateTime<Utc>) {
        if let Some(collaborator) = self.collaborators.get_mut(&user_id) {
            collaborator.last_active_at = when;
        }
    }

    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.collaborators.values().cloned().collect()
    }

    pub fn collaborator_count(&self) -> usize {
        self.collaborators.len()
    }

    pub fn cursors(&self) -> Vec<CursorUpdate> {
        self.cursors.values().cloned().collect()
    }

    pub fn cursor_for(&self, user_id: &Uuid) -> Option<&CursorUpdate> {
        self.cursors.get(user_id)
    }

    pub fn local_user_id(&self) -> Uuid {
        self.local_user_id
    }
}
