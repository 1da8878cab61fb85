//! # Overlay routing table
//!
//! Kademlia-style table over the XOR metric: 256 buckets indexed by the
//! distance prefix, each holding up to `k` verified records ordered
//! most-recently-verified-last plus one pending replacement slot.
//!
//! Beyond plain bucketing, the overlay tracks two things per peer that
//! classic Kademlia does not:
//!
//! - the **radius** the peer advertised in its last PONG, bounding which
//!   content it is willing to store, and
//! - a bounded LRU set of content-ids we already OFFERed it, so gossip
//!   never repeats an offer while the entry survives.
//!
//! ## Invariants
//!
//! - every record sits in exactly the bucket matching its distance to self
//! - within a bucket, most-recently-verified records sit at the tail
//! - adding to a full bucket parks the candidate in the pending slot and
//!   hands the caller the head to liveness-probe
//! - `nearest(t, n)` returns records in non-decreasing distance to `t`

use std::collections::HashMap;
use std::num::NonZeroUsize;

use alloy_primitives::{B256, U256};
use lru::LruCache;
use tokio::time::Instant;
use tracing::trace;

use crate::content::ContentId;
use crate::identity::{bucket_index, random_node_id_in_bucket, xor_distance, Enr, NodeId};

/// Records per bucket.
pub const DEFAULT_K: usize = 16;

/// Concurrent queries per lookup.
pub const DEFAULT_ALPHA: usize = 3;

/// Peers tracked in the offered-content cache.
const MAX_OFFER_TRACKED_PEERS: usize = 1024;

/// Offered content-ids remembered per peer. Once evicted, a repeat OFFER
/// for the same key becomes legal again.
const OFFERS_REMEMBERED_PER_PEER: usize = 512;

/// What `add` did with a candidate record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// New record admitted.
    Inserted,
    /// Known identity; record and freshness updated.
    Updated,
    /// Bucket full: candidate parked in the pending slot. The caller
    /// should liveness-probe the returned head and report back through
    /// [`RoutingTable::head_confirmed`] or [`RoutingTable::head_failed`].
    PendingProbe(Enr),
    /// Self, an invalid signature, or a stale sequence number.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub enr: Enr,
    pub last_seen: Instant,
    /// Set once the peer answered a request on this session.
    pub verified: bool,
}

#[derive(Debug)]
struct Bucket {
    peers: Vec<PeerEntry>,
    pending: Option<Enr>,
    last_refresh: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self { peers: Vec::new(), pending: None, last_refresh: Instant::now() }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.peers.iter().position(|entry| entry.enr.node_id() == *id)
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
    /// Advertised content radius per peer, updated on every PONG.
    radii: HashMap<NodeId, U256>,
    /// Per-peer LRU of content-ids already offered.
    offered: LruCache<NodeId, LruCache<ContentId, ()>>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(256);
        for _ in 0..256 {
            buckets.push(Bucket::new());
        }
        Self {
            self_id,
            k,
            buckets,
            radii: HashMap::new(),
            offered: LruCache::new(NonZeroUsize::new(MAX_OFFER_TRACKED_PEERS).unwrap()),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit or refresh a record.
    pub fn add(&mut self, enr: Enr) -> AddOutcome {
        let id = enr.node_id();
        if id == self.self_id || enr.verify().is_err() {
            return AddOutcome::Rejected;
        }
        let idx = match bucket_index(&self.self_id, &id) {
            Some(idx) => idx,
            None => return AddOutcome::Rejected,
        };
        let k = self.k;
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.position(&id) {
            let entry = bucket.peers.remove(pos);
            // Keep whichever record carries the higher sequence.
            let enr = if enr.seq >= entry.enr.seq { enr } else { entry.enr };
            bucket.peers.push(PeerEntry { enr, last_seen: Instant::now(), verified: entry.verified });
            return AddOutcome::Updated;
        }

        if bucket.peers.len() < k {
            bucket.peers.push(PeerEntry { enr, last_seen: Instant::now(), verified: false });
            trace!(bucket = idx, "peer inserted");
            return AddOutcome::Inserted;
        }

        let head = bucket.peers[0].enr.clone();
        bucket.pending = Some(enr);
        AddOutcome::PendingProbe(head)
    }

    /// The probed head answered: keep it, refresh its position, drop the
    /// pending candidate.
    pub fn head_confirmed(&mut self, head: &NodeId) {
        if let Some(idx) = bucket_index(&self.self_id, head) {
            let bucket = &mut self.buckets[idx];
            if let Some(pos) = bucket.position(head) {
                let mut entry = bucket.peers.remove(pos);
                entry.last_seen = Instant::now();
                entry.verified = true;
                bucket.peers.push(entry);
            }
            bucket.pending = None;
        }
    }

    /// The probed head is dead: evict it and admit the pending candidate.
    pub fn head_failed(&mut self, head: &NodeId) {
        if let Some(idx) = bucket_index(&self.self_id, head) {
            let bucket = &mut self.buckets[idx];
            if let Some(pos) = bucket.position(head) {
                bucket.peers.remove(pos);
            }
            if let Some(pending) = bucket.pending.take() {
                bucket.peers.push(PeerEntry {
                    enr: pending,
                    last_seen: Instant::now(),
                    verified: false,
                });
            }
            self.radii.remove(head);
        }
    }

    /// A peer answered a request: move it to its bucket tail.
    pub fn mark_verified(&mut self, id: &NodeId) {
        if let Some(idx) = bucket_index(&self.self_id, id) {
            let bucket = &mut self.buckets[idx];
            if let Some(pos) = bucket.position(id) {
                let mut entry = bucket.peers.remove(pos);
                entry.last_seen = Instant::now();
                entry.verified = true;
                bucket.peers.push(entry);
            }
        }
    }

    /// Temporary demotion for misbehaving or unresponsive peers: the entry
    /// moves to the head of its bucket (next eviction candidate) and loses
    /// its verified standing.
    pub fn mark_failed(&mut self, id: &NodeId) {
        if let Some(idx) = bucket_index(&self.self_id, id) {
            let bucket = &mut self.buckets[idx];
            if let Some(pos) = bucket.position(id) {
                let mut entry = bucket.peers.remove(pos);
                entry.verified = false;
                bucket.peers.insert(0, entry);
            }
        }
    }

    pub fn remove(&mut self, id: &NodeId) {
        if let Some(idx) = bucket_index(&self.self_id, id) {
            let bucket = &mut self.buckets[idx];
            if let Some(pos) = bucket.position(id) {
                bucket.peers.remove(pos);
            }
        }
        self.radii.remove(id);
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        bucket_index(&self.self_id, id)
            .map(|idx| self.buckets[idx].position(id).is_some())
            .unwrap_or(false)
    }

    pub fn enr_of(&self, id: &NodeId) -> Option<Enr> {
        let idx = bucket_index(&self.self_id, id)?;
        let pos = self.buckets[idx].position(id)?;
        Some(self.buckets[idx].peers[pos].enr.clone())
    }

    /// Up to `n` records ordered by non-decreasing distance to `target`.
    pub fn nearest(&self, target: &B256, n: usize) -> Vec<Enr> {
        let mut all: Vec<(U256, Enr)> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.peers.iter())
            .map(|entry| {
                let id = entry.enr.node_id();
                (xor_distance(&id, target), entry.enr.clone())
            })
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all.truncate(n);
        all.into_iter().map(|(_, enr)| enr).collect()
    }

    /// Records in the bucket for a FINDNODES log2-distance, in insertion
    /// order. Distance 0 (self) is the caller's business.
    pub fn at_log2_distance(&self, distance: u16) -> Vec<Enr> {
        if distance == 0 || distance > 256 {
            return Vec::new();
        }
        let idx = 256 - distance as usize;
        self.buckets[idx].peers.iter().map(|entry| entry.enr.clone()).collect()
    }

    // ------------------------------------------------------------------
    // Radius tracking
    // ------------------------------------------------------------------

    pub fn set_radius(&mut self, id: NodeId, radius: U256) {
        self.radii.insert(id, radius);
    }

    pub fn radius_of(&self, id: &NodeId) -> Option<U256> {
        self.radii.get(id).copied()
    }

    /// Peers whose advertised radius covers `content_id`, nearest first.
    pub fn interested_in(&self, content_id: &ContentId, n: usize) -> Vec<Enr> {
        self.nearest(content_id, self.len())
            .into_iter()
            .filter(|enr| {
                let id = enr.node_id();
                match self.radii.get(&id) {
                    Some(radius) => xor_distance(&id, content_id) <= *radius,
                    None => false,
                }
            })
            .take(n)
            .collect()
    }

    // ------------------------------------------------------------------
    // Offered-content suppression
    // ------------------------------------------------------------------

    /// Whether we already offered `content_id` to `peer` (and the record
    /// has not been evicted since).
    pub fn already_offered(&mut self, peer: &NodeId, content_id: &ContentId) -> bool {
        match self.offered.get_mut(peer) {
            Some(per_peer) => per_peer.get(content_id).is_some(),
            None => false,
        }
    }

    /// Record an outgoing OFFER for suppression of repeats.
    pub fn register_offered(&mut self, peer: NodeId, content_id: ContentId) {
        let per_peer = self.offered.get_or_insert_mut(peer, || {
            LruCache::new(NonZeroUsize::new(OFFERS_REMEMBERED_PER_PEER).unwrap())
        });
        per_peer.put(content_id, ());
    }

    // ------------------------------------------------------------------
    // Bucket refresh
    // ------------------------------------------------------------------

    /// Index of the non-empty bucket with the fewest records, preferring
    /// the farther bucket on ties; refresh aims where coverage is thinnest.
    pub fn lowest_populated_bucket(&self) -> Option<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.peers.is_empty())
            .min_by_key(|(_, b)| b.peers.len())
            .map(|(idx, _)| idx)
    }

    /// A random target inside the given bucket's distance range.
    pub fn refresh_target(&self, bucket_idx: usize) -> NodeId {
        random_node_id_in_bucket(&self.self_id, bucket_idx)
    }

    pub fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.last_refresh = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn keypair(index: u32) -> Keypair {
        let mut seed = [0u8; 32];
        seed[..4].copy_from_slice(&index.to_be_bytes());
        Keypair::from_secret_bytes(&seed).unwrap()
    }

    fn enr(index: u32) -> Enr {
        keypair(index).make_enr(format!("10.0.{}.{}:9000", index >> 8, index & 0xFF), 1)
    }

    fn table() -> RoutingTable {
        RoutingTable::new(keypair(0).node_id(), DEFAULT_K)
    }

    #[test]
    fn rejects_self_and_bad_signatures() {
        let mut t = RoutingTable::new(keypair(1).node_id(), DEFAULT_K);
        assert_eq!(t.add(enr(1)), AddOutcome::Rejected);

        let mut forged = enr(2);
        forged.addr = "1.2.3.4:1".into();
        assert_eq!(t.add(forged), AddOutcome::Rejected);
        assert!(t.is_empty());
    }

    #[test]
    fn update_keeps_higher_sequence_and_moves_to_tail() {
        let mut t = table();
        let old = keypair(5).make_enr("10.0.0.5:9000", 1);
        let new = keypair(5).make_enr("10.0.0.50:9000", 2);
        assert_eq!(t.add(old.clone()), AddOutcome::Inserted);
        assert_eq!(t.add(new.clone()), AddOutcome::Updated);
        assert_eq!(t.enr_of(&new.node_id()).unwrap().addr, "10.0.0.50:9000");
        // A replay of the stale record must not win.
        assert_eq!(t.add(old), AddOutcome::Updated);
        assert_eq!(t.enr_of(&new.node_id()).unwrap().seq, 2);
    }

    /// `nearest` returns records in non-decreasing XOR distance.
    #[test]
    fn nearest_orders_by_distance() {
        let mut t = table();
        for i in 1..200u32 {
            t.add(enr(i));
        }
        let target = keypair(999).node_id();
        let nearest = t.nearest(&target, 20);
        assert_eq!(nearest.len(), 20);
        let dists: Vec<U256> =
            nearest.iter().map(|e| xor_distance(&e.node_id(), &target)).collect();
        for pair in dists.windows(2) {
            assert!(pair[0] <= pair[1], "distance order violated");
        }
    }

    #[test]
    fn full_bucket_parks_candidate_and_probe_resolves() {
        let self_id = keypair(0).node_id();
        let mut t = RoutingTable::new(self_id, 2);

        // Find four records landing in one bucket.
        let mut by_bucket: HashMap<usize, Vec<u32>> = HashMap::new();
        let mut chosen = None;
        for i in 1..5000u32 {
            let idx = bucket_index(&self_id, &keypair(i).node_id()).unwrap();
            let list = by_bucket.entry(idx).or_default();
            list.push(i);
            if list.len() == 4 {
                chosen = Some(list.clone());
                break;
            }
        }
        let ids = chosen.expect("no crowded bucket found");

        assert_eq!(t.add(enr(ids[0])), AddOutcome::Inserted);
        assert_eq!(t.add(enr(ids[1])), AddOutcome::Inserted);
        let head = match t.add(enr(ids[2])) {
            AddOutcome::PendingProbe(head) => head,
            other => panic!("expected pending probe, got {other:?}"),
        };
        assert_eq!(head.node_id(), keypair(ids[0]).node_id());

        // Head dead: pending candidate takes its place.
        t.head_failed(&head.node_id());
        assert!(!t.contains(&head.node_id()));
        assert!(t.contains(&keypair(ids[2]).node_id()));

        // Fill again; this time the probed head survives.
        let head = match t.add(enr(ids[3])) {
            AddOutcome::PendingProbe(head) => head,
            other => panic!("expected pending probe, got {other:?}"),
        };
        t.head_confirmed(&head.node_id());
        assert!(t.contains(&head.node_id()));
        assert!(!t.contains(&keypair(ids[3]).node_id()));
    }

    #[test]
    fn mark_failed_demotes_to_eviction_candidate() {
        let mut t = table();
        t.add(enr(10));
        t.add(enr(11));
        t.mark_verified(&keypair(10).node_id());
        t.mark_failed(&keypair(10).node_id());
        // Still present, still reachable, but no longer verified.
        assert!(t.contains(&keypair(10).node_id()));
    }

    #[test]
    fn radius_tracking_and_interest() {
        let mut t = table();
        let a = enr(20);
        let b = enr(21);
        t.add(a.clone());
        t.add(b.clone());
        t.set_radius(a.node_id(), U256::MAX);
        t.set_radius(b.node_id(), U256::ZERO);

        let content = crate::content::ContentKey::BlockHeader {
            block_hash: B256::repeat_byte(0x42),
        };
        let interested = t.interested_in(&content.content_id(), 10);
        assert_eq!(interested.len(), 1);
        assert_eq!(interested[0].node_id(), a.node_id());

        t.remove(&a.node_id());
        assert_eq!(t.radius_of(&a.node_id()), None);
    }

    /// Repeat offers are suppressed until the entry ages out.
    #[test]
    fn offered_content_suppression() {
        let mut t = table();
        let peer = keypair(30).node_id();
        let id = ContentId::repeat_byte(0x01);
        assert!(!t.already_offered(&peer, &id));
        t.register_offered(peer, id);
        assert!(t.already_offered(&peer, &id));

        // Flood the per-peer cache; the original entry ages out and the
        // key becomes offerable again.
        for i in 0..OFFERS_REMEMBERED_PER_PEER {
            let mut bytes = [0u8; 32];
            bytes[..8].copy_from_slice(&(i as u64 + 2).to_be_bytes());
            t.register_offered(peer, ContentId::from(bytes));
        }
        assert!(!t.already_offered(&peer, &id));
    }

    #[test]
    fn log2_distance_buckets_and_refresh_targets() {
        let mut t = table();
        for i in 1..50u32 {
            t.add(enr(i));
        }
        let lowest = t.lowest_populated_bucket().unwrap();
        let target = t.refresh_target(lowest);
        assert_eq!(bucket_index(&t.self_id(), &target), Some(lowest));

        assert!(t.at_log2_distance(0).is_empty());
        assert!(t.at_log2_distance(257).is_empty());
        let total: usize = (1..=256u16).map(|d| t.at_log2_distance(d).len()).sum();
        assert_eq!(total, t.len());
    }
}
