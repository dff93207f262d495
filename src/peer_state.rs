//! Peer-state table (§3, §4.5): the bounded set of currently-known peers
//! and their live metrics.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use libp2p::PeerId;
use parking_lot::RwLock;
use tracing::{debug, trace};
use web_time::Instant;

use crate::callbacks::CloseCallback;
use crate::error::ConnMgrError;

/// Direction of a connection at the time it was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
    Unknown,
}

/// A newly-established connection as reported to [`PeerStateTable::notify_connected`].
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub peer_id: PeerId,
    pub direction: Direction,
}

/// Live metrics for one currently-known peer.
#[derive(Debug, Clone)]
pub struct PeerConnInfo {
    pub peer_id: PeerId,
    pub direction: Direction,
    pub created_at: Instant,
    pub last_active: Instant,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub rtt: Option<Duration>,
    /// Mirrors [`crate::protection::ProtectionStore`]'s tag set for this
    /// peer so the trimmer can filter/score without a second lock.
    pub tags: std::collections::HashSet<String>,
    pub protected: bool,
}

impl PeerConnInfo {
    fn new(peer_id: PeerId, direction: Direction) -> Self {
        let now = Instant::now();
        Self {
            peer_id,
            direction,
            created_at: now,
            last_active: now,
            bytes_sent: 0,
            bytes_recv: 0,
            rtt: None,
            tags: std::collections::HashSet::new(),
            protected: false,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle(&self) -> Duration {
        self.last_active.elapsed()
    }
}

/// Bounded set of live peers, keyed by peer-id. Reads take a shared lock,
/// writes an exclusive one, per §4.5.
#[derive(Default)]
pub struct PeerStateTable {
    peers: RwLock<HashMap<PeerId, PeerConnInfo>>,
    online_count: AtomicI64,
    close_callback: RwLock<Option<Arc<dyn CloseCallback>>>,
}

impl PeerStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new peer, or updates an existing one in place without
    /// double-incrementing the online counter.
    pub fn notify_connected(&self, conn: NewConnection) {
        let mut peers = self.peers.write();
        match peers.get_mut(&conn.peer_id) {
            Some(existing) => {
                existing.direction = conn.direction;
                existing.last_active = Instant::now();
                trace!(peer_id = %conn.peer_id, "peer re-registered in place");
            }
            None => {
                peers.insert(conn.peer_id, PeerConnInfo::new(conn.peer_id, conn.direction));
                self.online_count.fetch_add(1, Ordering::SeqCst);
                debug!(peer_id = %conn.peer_id, "peer added to connection table");
            }
        }
    }

    /// Removes the peer unconditionally, decrementing the online counter
    /// exactly once if it was present. Used by the grace-timeout handler and
    /// higher-layer disconnect signals; the trimmer instead goes through
    /// [`Self::close_and_remove`] so the close callback runs first.
    pub fn notify_disconnected(&self, peer_id: &PeerId) -> Option<PeerConnInfo> {
        let removed = self.peers.write().remove(peer_id);
        if removed.is_some() {
            self.online_count.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn set_close_callback(&self, callback: Arc<dyn CloseCallback>) {
        *self.close_callback.write() = Some(callback);
    }

    /// Invokes the close callback (without holding the table lock) and
    /// removes the peer only if it succeeds, per §5's "suspension/blocking
    /// points". Returns `Ok(false)` if the peer wasn't present.
    pub async fn close_and_remove(&self, peer_id: PeerId) -> Result<bool, ConnMgrError> {
        let callback = self.close_callback.read().clone();
        if let Some(callback) = callback {
            callback.close(peer_id).await?;
        }
        Ok(self.notify_disconnected(&peer_id).is_some())
    }

    pub fn conn_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn conn_count_by_tag(&self, tag: &str) -> usize {
        self.peers.read().values().filter(|info| info.tags.contains(tag)).count()
    }

    pub fn conn_count_by_direction(&self, direction: Direction) -> usize {
        self.peers.read().values().filter(|info| info.direction == direction).count()
    }

    pub fn get_conn_info(&self, peer_id: &PeerId) -> Option<PeerConnInfo> {
        self.peers.read().get(peer_id).cloned()
    }

    pub fn all_conn_info(&self) -> Vec<PeerConnInfo> {
        self.peers.read().values().cloned().collect()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    pub fn update_last_active(&self, peer_id: &PeerId) -> Result<(), ConnMgrError> {
        let mut peers = self.peers.write();
        let info = peers.get_mut(peer_id).ok_or(ConnMgrError::PeerNotFound)?;
        info.last_active = Instant::now();
        Ok(())
    }

    pub fn update_stats(
        &self,
        peer_id: &PeerId,
        bytes_sent: u64,
        bytes_recv: u64,
        rtt: Option<Duration>,
    ) -> Result<(), ConnMgrError> {
        let mut peers = self.peers.write();
        let info = peers.get_mut(peer_id).ok_or(ConnMgrError::PeerNotFound)?;
        info.bytes_sent = info.bytes_sent.saturating_add(bytes_sent);
        info.bytes_recv = info.bytes_recv.saturating_add(bytes_recv);
        if let Some(rtt) = rtt {
            info.rtt = Some(rtt);
        }
        info.last_active = Instant::now();
        Ok(())
    }

    /// Creates the peer entry if absent (unknown direction) and syncs its
    /// cached tag set/protected flag. Called by the Manager whenever
    /// [`crate::protection::ProtectionStore`] changes for this peer.
    pub fn ensure_peer_with_tags(
        &self,
        peer_id: PeerId,
        tags: std::collections::HashSet<String>,
        protected: bool,
    ) {
        let mut peers = self.peers.write();
        let info = peers.entry(peer_id).or_insert_with(|| {
            self.online_count.fetch_add(1, Ordering::SeqCst);
            PeerConnInfo::new(peer_id, Direction::Unknown)
        });
        info.tags = tags;
        info.protected = protected;
    }

    pub fn online_count(&self) -> i64 {
        self.online_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_peer_id as peer;

    #[test]
    fn insert_then_remove_balances_online_count() {
        let table = PeerStateTable::new();
        let p = peer(1);

        table.notify_connected(NewConnection {
            peer_id: p,
            direction: Direction::Inbound,
        });
        assert_eq!(table.online_count(), 1);
        assert_eq!(table.conn_count(), 1);

        table.notify_disconnected(&p);
        assert_eq!(table.online_count(), 0);
        assert_eq!(table.conn_count(), 0);
    }

    #[test]
    fn re_registering_an_existing_peer_does_not_double_count() {
        let table = PeerStateTable::new();
        let p = peer(2);

        table.notify_connected(NewConnection {
            peer_id: p,
            direction: Direction::Inbound,
        });
        table.notify_connected(NewConnection {
            peer_id: p,
            direction: Direction::Outbound,
        });

        assert_eq!(table.online_count(), 1);
        assert_eq!(table.get_conn_info(&p).unwrap().direction, Direction::Outbound);
    }

    #[test]
    fn update_stats_accumulates() {
        let table = PeerStateTable::new();
        let p = peer(3);
        table.notify_connected(NewConnection {
            peer_id: p,
            direction: Direction::Outbound,
        });

        table.update_stats(&p, 100, 200, Some(Duration::from_millis(50))).unwrap();
        table.update_stats(&p, 50, 25, None).unwrap();

        let info = table.get_conn_info(&p).unwrap();
        assert_eq!(info.bytes_sent, 150);
        assert_eq!(info.bytes_recv, 225);
        assert_eq!(info.rtt, Some(Duration::from_millis(50)));
    }

    #[test]
    fn update_stats_on_unknown_peer_errors() {
        let table = PeerStateTable::new();
        let p = peer(4);
        assert!(matches!(
            table.update_stats(&p, 0, 0, None),
            Err(ConnMgrError::PeerNotFound)
        ));
    }

    #[tokio::test]
    async fn close_and_remove_only_removes_on_success() {
        use crate::callbacks::close_callback_fn;
        use std::sync::atomic::AtomicBool;

        let table = PeerStateTable::new();
        let p = peer(5);
        table.notify_connected(NewConnection {
            peer_id: p,
            direction: Direction::Inbound,
        });

        let should_fail = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&should_fail);
        table.set_close_callback(close_callback_fn(move |_peer_id| {
            let flag = Arc::clone(&flag);
            async move {
                if flag.load(Ordering::SeqCst) {
                    Err(ConnMgrError::CallbackFailure("refused".into()))
                } else {
                    Ok(())
                }
            }
        }));

        assert!(table.close_and_remove(p).await.is_err());
        assert!(table.contains(&p));

        should_fail.store(false, Ordering::SeqCst);
        assert!(table.close_and_remove(p).await.unwrap());
        assert!(!table.contains(&p));
    }

    #[test]
    fn conn_count_by_tag_counts_matching_peers() {
        let table = PeerStateTable::new();
        let p1 = peer(6);
        let p2 = peer(7);
        table.ensure_peer_with_tags(p1, std::collections::HashSet::from(["important".to_string()]), true);
        table.ensure_peer_with_tags(p2, std::collections::HashSet::new(), false);

        assert_eq!(table.conn_count_by_tag("important"), 1);
        assert_eq!(table.conn_count_by_tag("missing"), 0);
    }

    #[test]
    fn conn_count_by_direction_counts_matching_peers() {
        let table = PeerStateTable::new();
        table.notify_connected(NewConnection { peer_id: peer(8), direction: Direction::Inbound });
        table.notify_connected(NewConnection { peer_id: peer(9), direction: Direction::Inbound });
        table.notify_connected(NewConnection { peer_id: peer(10), direction: Direction::Outbound });

        assert_eq!(table.conn_count_by_direction(Direction::Inbound), 2);
        assert_eq!(table.conn_count_by_direction(Direction::Outbound), 1);
        assert_eq!(table.conn_count_by_direction(Direction::Unknown), 0);
    }

    #[test]
    fn concurrent_connect_disconnect_keeps_online_count_consistent() {
        use std::thread;

        let table = Arc::new(PeerStateTable::new());
        let peers: Vec<PeerId> = (0..30).map(peer).collect();

        let mut handles = Vec::new();
        for p in peers.clone() {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                table.notify_connected(NewConnection {
                    peer_id: p,
                    direction: Direction::Inbound,
                });
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.online_count(), 30);

        let mut handles = Vec::new();
        for p in peers {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                table.notify_disconnected(&p);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.online_count(), 0);
    }
}
