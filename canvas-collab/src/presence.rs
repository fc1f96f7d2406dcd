//! Ephemeral presence: who is connected, where their cursor is, what they
//! have selected.
//!
//! ## Flow
//!
//! ```text
//! set_local_user / update_local_presence
//!       │
//!       ▼
//! AwarenessMessage::State { record, clock }
//!       │
//!       ▼   (SyncMessage::Awareness, relayed by the server, never stored)
//! Remote PresenceChannel::apply_remote()
//!       │  (last-write-wins per participant clock)
//!       ▼
//! on_presence_change subscribers
//! ```
//!
//! Remote entries disappear on `Leave`, on `PeerLeft` for the connection
//! that announced them, when the local connection drops, or through
//! [`PresenceChannel::evict_stale`] once their last message is older than
//! the configured timeout.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::model::{now_millis, Point};
use crate::observer::{Observers, Subscription};
use crate::protocol::ProtocolError;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Participant identity supplied by the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub name: String,
    pub avatar: Option<String>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// One participant's broadcast state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub name: String,
    pub avatar: Option<String>,
    pub cursor: Option<Point>,
    pub selection: Vec<String>,
    pub is_active: bool,
    /// Sender wall clock, milliseconds.
    pub last_seen: u64,
}

impl PresenceRecord {
    pub fn new(profile: &UserProfile) -> Self {
        Self {
            user_id: profile.user_id.clone(),
            name: profile.name.clone(),
            avatar: profile.avatar.clone(),
            cursor: None,
            selection: Vec::new(),
            is_active: true,
            last_seen: now_millis(),
        }
    }
}

/// Partial local presence update. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresencePatch {
    pub cursor: Option<Option<Point>>,
    pub selection: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

impl PresencePatch {
    pub fn cursor(x: f64, y: f64) -> Self {
        Self {
            cursor: Some(Some(Point::new(x, y))),
            ..Self::default()
        }
    }

    pub fn selection(ids: Vec<String>) -> Self {
        Self {
            selection: Some(ids),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Remote entries silent for longer than this are evicted.
    pub timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl PresenceConfig {
    pub fn for_testing() -> Self {
        Self {
            timeout: Duration::from_millis(200),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire protocol messages
// ───────────────────────────────────────────────────────────────────

/// Awareness payload carried inside `SyncMessage::Awareness`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessMessage {
    /// Full state of one participant. Higher `clock` wins.
    State { record: PresenceRecord, clock: u64 },
    /// Clean departure.
    Leave { user_id: String },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    pub fn user_id(&self) -> &str {
        match self {
            AwarenessMessage::State { record, .. } => &record.user_id,
            AwarenessMessage::Leave { user_id } => user_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Channel
// ───────────────────────────────────────────────────────────────────

/// What changed in the connected-user set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceEvent {
    pub joined: Vec<String>,
    pub updated: Vec<String>,
    pub left: Vec<String>,
}

impl PresenceEvent {
    fn left(ids: Vec<String>) -> Self {
        Self {
            left: ids,
            ..Self::default()
        }
    }
}

struct RemoteEntry {
    record: PresenceRecord,
    clock: u64,
    /// Connection that announced this participant.
    peer: Uuid,
    /// Local receive time, used for eviction so sender clock skew is harmless.
    received_at: u64,
}

/// Local and remote presence for one room.
pub struct PresenceChannel {
    config: PresenceConfig,
    local: Option<PresenceRecord>,
    clock: u64,
    remote: HashMap<String, RemoteEntry>,
    observers: Observers<PresenceEvent>,
}

impl PresenceChannel {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            local: None,
            clock: 0,
            remote: HashMap::new(),
            observers: Observers::new(),
        }
    }

    /// Announce the local participant. Returns the message to broadcast.
    pub fn set_local_user(&mut self, profile: &UserProfile) -> AwarenessMessage {
        let joined = self.local.is_none();
        let mut record = match self.local.take() {
            Some(mut existing) if existing.user_id == profile.user_id => {
                existing.name = profile.name.clone();
                existing.avatar = profile.avatar.clone();
                existing
            }
            _ => PresenceRecord::new(profile),
        };
        record.last_seen = now_millis();
        let user_id = record.user_id.clone();
        let message = self.stamp(&record);
        self.local = Some(record);

        let event = if joined {
            PresenceEvent {
                joined: vec![user_id],
                ..PresenceEvent::default()
            }
        } else {
            PresenceEvent {
                updated: vec![user_id],
                ..PresenceEvent::default()
            }
        };
        self.observers.notify(&event);
        message
    }

    /// Apply a partial update to the local state.
    ///
    /// Returns `None` when no local user has been set yet.
    pub fn update_local_presence(&mut self, patch: PresencePatch) -> Option<AwarenessMessage> {
        let record = self.local.as_mut()?;
        if let Some(cursor) = patch.cursor {
            record.cursor = cursor;
        }
        if let Some(selection) = patch.selection {
            record.selection = selection;
        }
        if let Some(is_active) = patch.is_active {
            record.is_active = is_active;
        }
        record.last_seen = now_millis();
        let record = record.clone();

        self.observers.notify(&PresenceEvent {
            updated: vec![record.user_id.clone()],
            ..PresenceEvent::default()
        });
        Some(self.stamp(&record))
    }

    /// The current local state as a broadcastable message, e.g. to
    /// re-announce after a reconnect.
    pub fn local_message(&mut self) -> Option<AwarenessMessage> {
        let record = self.local.clone()?;
        Some(self.stamp(&record))
    }

    /// Message announcing a clean departure of the local participant.
    pub fn leave_message(&self) -> Option<AwarenessMessage> {
        self.local.as_ref().map(|record| AwarenessMessage::Leave {
            user_id: record.user_id.clone(),
        })
    }

    pub fn local_state(&self) -> Option<&PresenceRecord> {
        self.local.as_ref()
    }

    fn stamp(&mut self, record: &PresenceRecord) -> AwarenessMessage {
        self.clock += 1;
        AwarenessMessage::State {
            record: record.clone(),
            clock: self.clock,
        }
    }

    /// Merge a message received from connection `from`.
    ///
    /// Returns whether the visible state changed. Stale clocks and
    /// echoes of the local participant are ignored.
    pub fn apply_remote(&mut self, from: Uuid, message: AwarenessMessage) -> bool {
        self.apply_remote_at(from, message, now_millis())
    }

    fn apply_remote_at(&mut self, from: Uuid, message: AwarenessMessage, now: u64) -> bool {
        if self
            .local
            .as_ref()
            .is_some_and(|local| local.user_id == message.user_id())
        {
            return false;
        }

        match message {
            AwarenessMessage::State { record, clock } => {
                let user_id = record.user_id.clone();
                let event = match self.remote.get_mut(&user_id) {
                    Some(entry) if clock <= entry.clock => return false,
                    Some(entry) => {
                        entry.record = record;
                        entry.clock = clock;
                        entry.peer = from;
                        entry.received_at = now;
                        PresenceEvent {
                            updated: vec![user_id],
                            ..PresenceEvent::default()
                        }
                    }
                    None => {
                        self.remote.insert(
                            user_id.clone(),
                            RemoteEntry {
                                record,
                                clock,
                                peer: from,
                                received_at: now,
                            },
                        );
                        PresenceEvent {
                            joined: vec![user_id],
                            ..PresenceEvent::default()
                        }
                    }
                };
                self.observers.notify(&event);
                true
            }
            AwarenessMessage::Leave { user_id } => {
                if self.remote.remove(&user_id).is_none() {
                    return false;
                }
                self.observers.notify(&PresenceEvent::left(vec![user_id]));
                true
            }
        }
    }

    /// Drop every participant announced by a closed connection.
    pub fn handle_peer_left(&mut self, peer: Uuid) -> Vec<String> {
        self.remove_where(|entry| entry.peer == peer)
    }

    /// Remove remote entries that have been silent longer than the timeout.
    pub fn evict_stale(&mut self, now: u64) -> Vec<String> {
        let timeout = self.config.timeout.as_millis() as u64;
        self.remove_where(|entry| now.saturating_sub(entry.received_at) > timeout)
    }

    /// Forget all remote participants, e.g. after the local connection drops.
    pub fn clear_remote(&mut self) -> Vec<String> {
        self.remove_where(|_| true)
    }

    fn remove_where(&mut self, predicate: impl Fn(&RemoteEntry) -> bool) -> Vec<String> {
        let mut removed: Vec<String> = self
            .remote
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(id, _)| id.clone())
            .collect();
        if removed.is_empty() {
            return removed;
        }
        removed.sort();
        for id in &removed {
            self.remote.remove(id);
        }
        log::debug!("Presence removed {} participant(s)", removed.len());
        self.observers.notify(&PresenceEvent::left(removed.clone()));
        removed
    }

    /// Local state plus every live remote state, ordered by user id.
    pub fn get_connected_users(&self) -> Vec<PresenceRecord> {
        let mut users: Vec<PresenceRecord> = self
            .local
            .iter()
            .cloned()
            .chain(self.remote.values().map(|entry| entry.record.clone()))
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    pub fn on_presence_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PresenceEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }
}

impl Default for PresenceChannel {
    fn default() -> Self {
        Self::new(PresenceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn remote_state(user: &str, clock: u64, x: f64) -> AwarenessMessage {
        let mut record = PresenceRecord::new(&UserProfile::new(user, user.to_uppercase()));
        record.cursor = Some(Point::new(x, 0.0));
        AwarenessMessage::State { record, clock }
    }

    #[test]
    fn test_local_user_and_patch() {
        let mut channel = PresenceChannel::default();
        assert!(channel.update_local_presence(PresencePatch::cursor(1.0, 1.0)).is_none());

        let profile = UserProfile::new("alice", "Alice").with_avatar("a.png");
        let first = channel.set_local_user(&profile);
        let second = channel
            .update_local_presence(PresencePatch::cursor(10.0, 20.0))
            .unwrap();

        match (first, second) {
            (
                AwarenessMessage::State { clock: c1, .. },
                AwarenessMessage::State { record, clock: c2 },
            ) => {
                assert!(c2 > c1);
                assert_eq!(record.cursor, Some(Point::new(10.0, 20.0)));
                assert_eq!(record.avatar.as_deref(), Some("a.png"));
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[test]
    fn test_remote_last_write_wins_by_clock() {
        let mut channel = PresenceChannel::default();
        let peer = Uuid::new_v4();

        assert!(channel.apply_remote(peer, remote_state("bob", 2, 5.0)));
        assert!(!channel.apply_remote(peer, remote_state("bob", 1, 99.0)));
        assert!(!channel.apply_remote(peer, remote_state("bob", 2, 99.0)));

        let users = channel.get_connected_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].cursor, Some(Point::new(5.0, 0.0)));

        assert!(channel.apply_remote(peer, remote_state("bob", 3, 7.0)));
        assert_eq!(
            channel.get_connected_users()[0].cursor,
            Some(Point::new(7.0, 0.0))
        );
    }

    #[test]
    fn test_connected_users_include_local() {
        let mut channel = PresenceChannel::default();
        channel.set_local_user(&UserProfile::new("alice", "Alice"));
        channel.apply_remote(Uuid::new_v4(), remote_state("bob", 1, 0.0));

        let ids: Vec<String> = channel
            .get_connected_users()
            .into_iter()
            .map(|u| u.user_id)
            .collect();
        assert_eq!(ids, vec!["alice", "bob"]);
    }

    #[test]
    fn test_own_echo_ignored() {
        let mut channel = PresenceChannel::default();
        let msg = channel.set_local_user(&UserProfile::new("alice", "Alice"));
        assert!(!channel.apply_remote(Uuid::new_v4(), msg));
        assert_eq!(channel.remote_count(), 0);
    }

    #[test]
    fn test_leave_and_peer_left() {
        let mut channel = PresenceChannel::default();
        let conn_b = Uuid::new_v4();
        let conn_c = Uuid::new_v4();
        channel.apply_remote(conn_b, remote_state("bob", 1, 0.0));
        channel.apply_remote(conn_c, remote_state("carol", 1, 0.0));

        assert!(channel.apply_remote(
            conn_b,
            AwarenessMessage::Leave {
                user_id: "bob".into()
            }
        ));
        assert_eq!(channel.handle_peer_left(conn_c), vec!["carol"]);
        assert_eq!(channel.remote_count(), 0);
        assert!(channel.handle_peer_left(conn_c).is_empty());
    }

    #[test]
    fn test_evict_stale_entries() {
        let mut channel = PresenceChannel::new(PresenceConfig::for_testing());
        let peer = Uuid::new_v4();
        channel.apply_remote_at(peer, remote_state("bob", 1, 0.0), 1_000);
        channel.apply_remote_at(peer, remote_state("carol", 1, 0.0), 1_150);

        assert!(channel.evict_stale(1_100).is_empty());
        assert_eq!(channel.evict_stale(1_250), vec!["bob"]);
        assert_eq!(channel.remote_count(), 1);
    }

    #[test]
    fn test_presence_events() {
        let mut channel = PresenceChannel::default();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = channel.on_presence_change(move |e| sink.lock().unwrap().push(e.clone()));

        let peer = Uuid::new_v4();
        channel.apply_remote(peer, remote_state("bob", 1, 0.0));
        channel.apply_remote(peer, remote_state("bob", 2, 1.0));
        channel.clear_remote();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].joined, vec!["bob"]);
        assert_eq!(events[1].updated, vec!["bob"]);
        assert_eq!(events[2].left, vec!["bob"]);
    }

    #[test]
    fn test_awareness_message_encoding() {
        let msg = remote_state("bob", 4, 3.5);
        let decoded = AwarenessMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.user_id(), "bob");
        assert!(AwarenessMessage::decode(&[0xFF]).is_err());
    }
}
