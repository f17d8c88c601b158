//! Tracks outstanding block requests by peer, so the planner knows what's
//! already been asked for and can sweep requests that never got an answer.

use std::{collections::HashMap, net::SocketAddr, time::Instant};

use crate::{BlockInfo, PieceIndex};

/// An outstanding request and when it was made, used to detect peers that
/// stopped answering without closing the connection.
#[derive(Clone, Copy, Debug)]
struct Entry {
    block: BlockInfo,
    requested_at: Instant,
}

/// Tracks every block we've asked for but haven't yet received, keyed by
/// the peer we asked.
#[derive(Default)]
pub(crate) struct RequestManager {
    requests: HashMap<SocketAddr, Vec<Entry>>,
}

impl RequestManager {
    pub(crate) fn new() -> Self {
        Self {
            requests: HashMap::new(),
        }
    }

    /// The number of outstanding requests for a specific peer.
    pub(crate) fn len_for_peer(&self, peer: SocketAddr) -> usize {
        self.requests.get(&peer).map_or(0, Vec::len)
    }

    /// Whether `block` is currently outstanding with any peer.
    pub(crate) fn is_requested(&self, block: BlockInfo) -> bool {
        self.requests
            .values()
            .any(|entries| entries.iter().any(|e| e.block == block))
    }

    pub(crate) fn add(&mut self, peer: SocketAddr, block: BlockInfo) {
        self.requests.entry(peer).or_default().push(Entry {
            block,
            requested_at: Instant::now(),
        });
    }

    /// Removes the outstanding request for `block` from `peer`, if any.
    /// Returns whether a matching entry was found.
    pub(crate) fn remove(&mut self, peer: SocketAddr, block: BlockInfo) -> bool {
        if let Some(entries) = self.requests.get_mut(&peer) {
            let before = entries.len();
            entries.retain(|e| e.block != block);
            return entries.len() != before;
        }
        false
    }

    /// Drops every outstanding request for `index`, across all peers. Used
    /// once a piece turns out to be invalid and needs to be re-requested
    /// from scratch.
    pub(crate) fn delete_all_for_piece(&mut self, index: PieceIndex) {
        for entries in self.requests.values_mut() {
            entries.retain(|e| e.block.piece_index != index);
        }
    }

    /// Drops every outstanding request attributed to `peer`. Used when a
    /// peer connection closes.
    pub(crate) fn delete_all_for_peer(&mut self, peer: SocketAddr) {
        self.requests.remove(&peer);
    }

    /// Returns the blocks currently outstanding with `peer`.
    pub(crate) fn existing_requests_for_peer(
        &self,
        peer: SocketAddr,
    ) -> Vec<BlockInfo> {
        self.requests
            .get(&peer)
            .map(|entries| entries.iter().map(|e| e.block).collect())
            .unwrap_or_default()
    }

    /// Removes and returns every request older than `max_age`, so the
    /// planner can treat those blocks as available again.
    pub(crate) fn sweep_stale(
        &mut self,
        max_age: std::time::Duration,
    ) -> Vec<(SocketAddr, BlockInfo)> {
        let now = Instant::now();
        let mut stale = Vec::new();
        for (peer, entries) in self.requests.iter_mut() {
            let mut remaining = Vec::with_capacity(entries.len());
            for entry in entries.drain(..) {
                if now.duration_since(entry.requested_at) >= max_age {
                    stale.push((*peer, entry.block));
                } else {
                    remaining.push(entry);
                }
            }
            *entries = remaining;
        }
        self.requests.retain(|_, entries| !entries.is_empty());
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peer(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn block(piece_index: PieceIndex, offset: u32) -> BlockInfo {
        BlockInfo {
            piece_index,
            offset,
            len: 16384,
        }
    }

    #[test]
    fn test_add_and_remove() {
        let mut rm = RequestManager::new();
        let p = peer(1);
        rm.add(p, block(0, 0));
        rm.add(p, block(0, 16384));
        assert_eq!(rm.len_for_peer(p), 2);

        assert!(rm.remove(p, block(0, 0)));
        assert_eq!(rm.len_for_peer(p), 1);
        assert!(!rm.remove(p, block(0, 0)));
    }

    #[test]
    fn test_delete_all_for_piece_spans_peers() {
        let mut rm = RequestManager::new();
        let a = peer(1);
        let b = peer(2);
        rm.add(a, block(0, 0));
        rm.add(b, block(0, 16384));
        rm.add(b, block(1, 0));

        rm.delete_all_for_piece(0);
        assert_eq!(rm.len_for_peer(a), 0);
        assert_eq!(rm.existing_requests_for_peer(b), vec![block(1, 0)]);
    }

    #[test]
    fn test_delete_all_for_peer() {
        let mut rm = RequestManager::new();
        let a = peer(1);
        let b = peer(2);
        rm.add(a, block(0, 0));
        rm.add(b, block(0, 16384));

        rm.delete_all_for_peer(a);
        assert_eq!(rm.len_for_peer(a), 0);
        assert_eq!(rm.len_for_peer(b), 1);
    }

    #[test]
    fn test_sweep_stale_removes_only_old_entries() {
        let mut rm = RequestManager::new();
        let p = peer(1);
        rm.add(p, block(0, 0));
        // nothing is old enough yet
        assert!(rm.sweep_stale(Duration::from_secs(3600)).is_empty());
        assert_eq!(rm.len_for_peer(p), 1);

        let stale = rm.sweep_stale(Duration::from_secs(0));
        assert_eq!(stale, vec![(p, block(0, 0))]);
        assert_eq!(rm.len_for_peer(p), 0);
    }
}
