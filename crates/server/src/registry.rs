use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{GroupId, PresenceStatus, UserId},
    protocol::{PresenceEntry, ServerEvent},
};
use tokio::sync::{mpsc, RwLock};

/// One live connection's outbound channel. The websocket writer task on
/// the other end owns the receiver; a closed receiver just drops the
/// push (delivery is best-effort, never awaited).
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: u64,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn push(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }
}

/// Maps each authenticated user to at most one live connection.
/// Explicitly constructed and injected; never ambient global state.
#[derive(Default)]
pub struct SessionRegistry {
    next_connection_id: AtomicU64,
    inner: RwLock<HashMap<UserId, ConnectionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a user to a fresh connection, last-connect-wins. A prior
    /// session for the same user is superseded, not closed: its handle
    /// simply stops being addressable.
    pub async fn register(
        &self,
        user_id: UserId,
    ) -> (u64, mpsc::UnboundedReceiver<ServerEvent>) {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.write().await;
        inner.insert(
            user_id,
            ConnectionHandle {
                connection_id,
                sender,
            },
        );
        (connection_id, receiver)
    }

    /// Compare-and-swap removal: the binding goes away only if it still
    /// belongs to this exact connection, so a stale disconnect cannot
    /// clobber a newer session. Returns whether the binding was removed.
    pub async fn unregister(&self, user_id: UserId, connection_id: u64) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get(&user_id) {
            Some(handle) if handle.connection_id == connection_id => {
                inner.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn is_live(&self, user_id: UserId) -> bool {
        self.inner.read().await.contains_key(&user_id)
    }

    /// Push to one user's session, if any. Returns whether a live
    /// session existed at dispatch time.
    pub async fn send_to(&self, user_id: UserId, event: ServerEvent) -> bool {
        let inner = self.inner.read().await;
        match inner.get(&user_id) {
            Some(handle) => {
                handle.push(event);
                true
            }
            None => false,
        }
    }

    /// Fan out to every connected session except `except`. Presence is
    /// public to any authenticated peer, so this is not targeted.
    pub async fn broadcast_except(&self, except: UserId, event: &ServerEvent) {
        let inner = self.inner.read().await;
        for (user_id, handle) in inner.iter() {
            if *user_id != except {
                handle.push(event.clone());
            }
        }
    }

    pub async fn send_to_many(&self, targets: &[UserId], event: &ServerEvent) {
        let inner = self.inner.read().await;
        for target in targets {
            if let Some(handle) = inner.get(target) {
                handle.push(event.clone());
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PresenceState {
    status: PresenceStatus,
    last_seen: Option<DateTime<Utc>>,
}

/// Tracks {status, last_seen} per user. Entries are created on first
/// connect and never destroyed; a stale offline entry is harmless.
/// Single writer by convention: only connection lifecycle code and
/// explicit presence updates mutate it.
#[derive(Default)]
pub struct PresenceDirectory {
    inner: RwLock<HashMap<UserId, PresenceState>>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status change and return the broadcast event carrying
    /// the transition timestamp.
    pub async fn set_status(&self, user_id: UserId, status: PresenceStatus) -> ServerEvent {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        inner.insert(
            user_id,
            PresenceState {
                status,
                last_seen: Some(now),
            },
        );
        ServerEvent::UserStatus {
            user_id,
            status,
            timestamp: now,
        }
    }

    /// Snapshot read for a poll. Users the directory has never seen
    /// default to offline with no last-seen.
    pub async fn snapshot(&self, user_ids: &[UserId]) -> Vec<PresenceEntry> {
        let inner = self.inner.read().await;
        user_ids
            .iter()
            .map(|user_id| match inner.get(user_id) {
                Some(state) => PresenceEntry {
                    user_id: *user_id,
                    status: state.status,
                    last_seen: state.last_seen,
                },
                None => PresenceEntry {
                    user_id: *user_id,
                    status: PresenceStatus::Offline,
                    last_seen: None,
                },
            })
            .collect()
    }

    /// Every entry the directory knows about; the initial snapshot a
    /// client receives right after connecting.
    pub async fn snapshot_all(&self) -> Vec<PresenceEntry> {
        let inner = self.inner.read().await;
        inner
            .iter()
            .map(|(user_id, state)| PresenceEntry {
                user_id: *user_id,
                status: state.status,
                last_seen: state.last_seen,
            })
            .collect()
    }
}

/// Which users are currently subscribed to each group room. Room
/// subscription is session-scoped and separate from persistent group
/// membership, which is re-checked at join time.
#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<HashMap<GroupId, HashSet<UserId>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, group_id: GroupId, user_id: UserId) {
        let mut inner = self.inner.write().await;
        inner.entry(group_id).or_default().insert(user_id);
    }

    pub async fn leave(&self, group_id: GroupId, user_id: UserId) {
        let mut inner = self.inner.write().await;
        if let Some(members) = inner.get_mut(&group_id) {
            members.remove(&user_id);
            if members.is_empty() {
                inner.remove(&group_id);
            }
        }
    }

    pub async fn members(&self, group_id: GroupId) -> Vec<UserId> {
        let inner = self.inner.read().await;
        inner
            .get(&group_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop a disconnecting user from every room they joined; returns
    /// the affected rooms so leave notices can be broadcast.
    pub async fn leave_all(&self, user_id: UserId) -> Vec<GroupId> {
        let mut inner = self.inner.write().await;
        let mut left = Vec::new();
        inner.retain(|group_id, members| {
            if members.remove(&user_id) {
                left.push(*group_id);
            }
            !members.is_empty()
        });
        left
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn last_connect_wins_and_supersedes() {
        let registry = SessionRegistry::new();
        let (first_id, mut first_rx) = registry.register(UserId(1)).await;
        let (second_id, mut second_rx) = registry.register(UserId(1)).await;
        assert_ne!(first_id, second_id);

        registry
            .send_to(UserId(1), ServerEvent::MessageUnsent {
                message_id: shared::domain::MessageId(9),
            })
            .await;
        assert!(second_rx.try_recv().is_ok(), "new session is addressable");
        assert!(
            first_rx.try_recv().is_err(),
            "superseded session gets nothing"
        );
    }

    #[tokio::test]
    async fn stale_disconnect_does_not_clobber_newer_session() {
        let registry = SessionRegistry::new();
        let (stale_id, _rx1) = registry.register(UserId(1)).await;
        let (_fresh_id, _rx2) = registry.register(UserId(1)).await;

        assert!(!registry.unregister(UserId(1), stale_id).await);
        assert!(registry.is_live(UserId(1)).await);
    }

    #[tokio::test]
    async fn unregister_removes_matching_binding() {
        let registry = SessionRegistry::new();
        let (connection_id, _rx) = registry.register(UserId(1)).await;
        assert!(registry.unregister(UserId(1), connection_id).await);
        assert!(!registry.is_live(UserId(1)).await);
    }

    #[tokio::test]
    async fn broadcast_skips_the_origin() {
        let registry = SessionRegistry::new();
        let (_id1, mut rx1) = registry.register(UserId(1)).await;
        let (_id2, mut rx2) = registry.register(UserId(2)).await;

        let event = ServerEvent::UserStatus {
            user_id: UserId(1),
            status: PresenceStatus::Online,
            timestamp: Utc::now(),
        };
        registry.broadcast_except(UserId(1), &event).await;
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn presence_defaults_unknown_users_to_offline() {
        let presence = PresenceDirectory::new();
        presence.set_status(UserId(1), PresenceStatus::Away).await;

        let entries = presence.snapshot(&[UserId(1), UserId(2)]).await;
        assert_eq!(entries[0].status, PresenceStatus::Away);
        assert!(entries[0].last_seen.is_some());
        assert_eq!(entries[1].status, PresenceStatus::Offline);
        assert!(entries[1].last_seen.is_none());
    }

    #[tokio::test]
    async fn rooms_track_membership_and_bulk_leave() {
        let rooms = RoomRegistry::new();
        rooms.join(GroupId(1), UserId(1)).await;
        rooms.join(GroupId(1), UserId(2)).await;
        rooms.join(GroupId(2), UserId(1)).await;

        let mut members = rooms.members(GroupId(1)).await;
        members.sort_by_key(|u| u.0);
        assert_eq!(members, vec![UserId(1), UserId(2)]);

        let mut left = rooms.leave_all(UserId(1)).await;
        left.sort_by_key(|g| g.0);
        assert_eq!(left, vec![GroupId(1), GroupId(2)]);
        assert_eq!(rooms.members(GroupId(1)).await, vec![UserId(2)]);
        assert!(rooms.members(GroupId(2)).await.is_empty());
    }
}
