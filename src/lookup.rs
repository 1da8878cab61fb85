//! # Recursive lookups
//!
//! Iterative, α-parallel lookups over FINDCONTENT and FINDNODES. The
//! lookup drives a shortlist of the closest known-but-unqueried nodes,
//! keeps α queries in flight, and folds every reply back into the
//! shortlist until it holds a result or runs dry.
//!
//! ## Content lookup
//!
//! A CONTENT reply resolves the lookup three ways:
//!
//! - inline bytes: done, remaining in-flight queries are abandoned (their
//!   replies are ignored, matching the cancellation model: no response is
//!   ever awaited past the first result);
//! - a connection-id: the query slot blocks on the uTP transfer and
//!   resolves with the delivered blob;
//! - ENRs: merged into the shortlist if closer coverage is useful.
//!
//! The whole lookup runs under one wall-clock deadline; expiry terminates
//! it as not-found regardless of in-flight state. Peers in the caller's
//! exclude set (for example, ones that served unverifiable content on a
//! previous attempt) are never queried.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::content::ContentId;
use crate::identity::{log2_distance, xor_distance, Enr, NodeId};
use crate::messages::{ContentResponse, FindContent, FindNodes, PortalMessage};
use crate::protocols::{NetworkId, TalkTransport};
use crate::routing::{DEFAULT_ALPHA, DEFAULT_K};
use crate::utp::UtpMultiplexer;

/// Lookup tuning.
#[derive(Debug, Clone)]
pub struct LookupConfig {
    pub alpha: usize,
    pub k: usize,
    /// Wall-clock bound on one whole lookup.
    pub deadline: Duration,
    /// Bound on a single peer query (uTP redirects excluded; those are
    /// bounded by the transfer watchdog).
    pub query_timeout: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            k: DEFAULT_K,
            deadline: Duration::from_secs(60),
            query_timeout: Duration::from_secs(10),
        }
    }
}

/// A successful content lookup.
#[derive(Debug)]
pub struct ContentFound {
    pub content: Vec<u8>,
    pub from: NodeId,
    /// Whether the bytes came over uTP rather than inline.
    pub via_utp: bool,
}

enum QueryReply {
    Content(ContentFound),
    Enrs(NodeId, Vec<Enr>),
    Failed(NodeId),
}

/// Iterative FINDCONTENT lookup. Returns the result (if any) and every
/// verified ENR discovered along the way, for routing-table admission.
#[allow(clippy::too_many_arguments)]
pub async fn content_lookup(
    transport: Arc<dyn TalkTransport>,
    network: NetworkId,
    utp: UtpMultiplexer,
    self_id: NodeId,
    key_bytes: Vec<u8>,
    content_id: ContentId,
    seeds: Vec<Enr>,
    exclude: HashSet<NodeId>,
    config: LookupConfig,
) -> (Option<ContentFound>, Vec<Enr>) {
    let deadline = Instant::now() + config.deadline;
    let mut shortlist: BTreeMap<U256, Enr> = BTreeMap::new();
    let mut queried: HashSet<NodeId> = exclude;
    queried.insert(self_id);
    let mut discovered: Vec<Enr> = Vec::new();

    for enr in seeds {
        shortlist.insert(xor_distance(&enr.node_id(), &content_id), enr);
    }

    let mut queries: JoinSet<QueryReply> = JoinSet::new();
    loop {
        // Keep α slots busy with the nearest unqueried candidates.
        while queries.len() < config.alpha {
            let Some((_, enr)) = shortlist.pop_first() else { break };
            let id = enr.node_id();
            if !queried.insert(id) {
                continue;
            }
            trace!(peer = %hex::encode(&id[..4]), "findcontent query");
            queries.spawn(query_content(
                transport.clone(),
                network,
                utp.clone(),
                enr,
                key_bytes.clone(),
                config.query_timeout,
            ));
        }
        if queries.is_empty() {
            debug!("content lookup exhausted its shortlist");
            return (None, discovered);
        }

        let reply = tokio::select! {
            joined = queries.join_next() => match joined {
                Some(Ok(reply)) => reply,
                Some(Err(_)) | None => continue,
            },
            _ = tokio::time::sleep_until(deadline) => {
                debug!("content lookup hit its deadline");
                return (None, discovered);
            }
        };

        match reply {
            QueryReply::Content(found) => {
                // Abandon whatever is still in flight.
                queries.abort_all();
                return (Some(found), discovered);
            }
            QueryReply::Enrs(_, enrs) => {
                for enr in enrs {
                    let id = enr.node_id();
                    if queried.contains(&id) {
                        continue;
                    }
                    shortlist.insert(xor_distance(&id, &content_id), enr.clone());
                    discovered.push(enr);
                    // Bound the shortlist to the k best candidates.
                    while shortlist.len() > config.k {
                        shortlist.pop_last();
                    }
                }
            }
            QueryReply::Failed(id) => {
                trace!(peer = %hex::encode(&id[..4]), "findcontent query failed");
            }
        }
    }
}

async fn query_content(
    transport: Arc<dyn TalkTransport>,
    network: NetworkId,
    utp: UtpMultiplexer,
    enr: Enr,
    key_bytes: Vec<u8>,
    query_timeout: Duration,
) -> QueryReply {
    let peer = enr.node_id();
    let request = PortalMessage::FindContent(FindContent { content_key: key_bytes.clone() }).encode();
    let response = tokio::time::timeout(
        query_timeout,
        transport.talk_req(&enr, network.protocol(), request),
    )
    .await;
    let raw = match response {
        Ok(Ok(raw)) => raw,
        _ => return QueryReply::Failed(peer),
    };
    match PortalMessage::decode(&raw) {
        Ok(PortalMessage::Content(ContentResponse::Content(content))) => {
            QueryReply::Content(ContentFound { content, from: peer, via_utp: false })
        }
        Ok(PortalMessage::Content(ContentResponse::ConnectionId(conn_id))) => {
            match utp.initiate_find_content_read(network, enr, conn_id, key_bytes).await {
                Ok(content) => {
                    QueryReply::Content(ContentFound { content, from: peer, via_utp: true })
                }
                Err(_) => QueryReply::Failed(peer),
            }
        }
        Ok(PortalMessage::Content(ContentResponse::Enrs(raw_enrs))) => {
            let enrs = decode_verified_enrs(&raw_enrs);
            QueryReply::Enrs(peer, enrs)
        }
        _ => QueryReply::Failed(peer),
    }
}

/// Decode wire ENRs, dropping anything that fails signature verification.
pub fn decode_verified_enrs(raw: &[Vec<u8>]) -> Vec<Enr> {
    raw.iter()
        .filter_map(|bytes| Enr::from_wire(bytes).ok())
        .filter(|enr| enr.verify().is_ok())
        .collect()
}

/// Iterative FINDNODES lookup toward `target`, used by bucket refresh.
/// Returns every verified ENR discovered.
pub async fn node_lookup(
    transport: Arc<dyn TalkTransport>,
    network: NetworkId,
    self_id: NodeId,
    target: NodeId,
    seeds: Vec<Enr>,
    config: LookupConfig,
) -> Vec<Enr> {
    const MAX_ROUNDS: usize = 3;

    let mut shortlist: BTreeMap<U256, Enr> = BTreeMap::new();
    let mut queried: HashSet<NodeId> = HashSet::new();
    queried.insert(self_id);
    let mut discovered: Vec<Enr> = Vec::new();

    for enr in seeds {
        shortlist.insert(xor_distance(&enr.node_id(), &target), enr);
    }

    for _ in 0..MAX_ROUNDS {
        let mut round: JoinSet<Vec<Enr>> = JoinSet::new();
        for _ in 0..config.alpha {
            let Some((_, enr)) = shortlist.pop_first() else { break };
            let id = enr.node_id();
            if !queried.insert(id) {
                continue;
            }
            let transport = transport.clone();
            let timeout = config.query_timeout;
            round.spawn(async move {
                let distance = log2_distance(&id, &target);
                let request =
                    PortalMessage::FindNodes(FindNodes { distances: vec![distance] }).encode();
                let response = tokio::time::timeout(
                    timeout,
                    transport.talk_req(&enr, network.protocol(), request),
                )
                .await;
                match response {
                    Ok(Ok(raw)) => match PortalMessage::decode(&raw) {
                        Ok(PortalMessage::Nodes(nodes)) => decode_verified_enrs(&nodes.enrs),
                        _ => Vec::new(),
                    },
                    _ => Vec::new(),
                }
            });
        }
        if round.is_empty() {
            break;
        }
        while let Some(result) = round.join_next().await {
            let Ok(enrs) = result else { continue };
            for enr in enrs {
                let id = enr.node_id();
                if queried.contains(&id) || id == self_id {
                    continue;
                }
                shortlist.insert(xor_distance(&id, &target), enr.clone());
                discovered.push(enr);
            }
        }
    }
    discovered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::protocols::MonotonicClock;
    use crate::utp::UtpConfig;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted responder: each peer answers FINDCONTENT with a fixed
    /// content response.
    struct SimTransport {
        replies: Mutex<HashMap<NodeId, ContentResponse>>,
        queried: Mutex<Vec<NodeId>>,
    }

    impl SimTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { replies: Mutex::new(HashMap::new()), queried: Mutex::new(Vec::new()) })
        }

        fn script(&self, peer: NodeId, reply: ContentResponse) {
            self.replies.lock().unwrap().insert(peer, reply);
        }

        fn queried(&self) -> Vec<NodeId> {
            self.queried.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TalkTransport for SimTransport {
        async fn talk_req(&self, to: &Enr, _protocol: &[u8], _payload: Vec<u8>) -> Result<Vec<u8>> {
            let id = to.node_id();
            self.queried.lock().unwrap().push(id);
            let reply = self.replies.lock().unwrap().get(&id).cloned();
            match reply {
                Some(response) => Ok(PortalMessage::Content(response).encode()),
                None => Err(anyhow!("peer unreachable")),
            }
        }

        fn enr_of(&self, _node: &NodeId) -> Option<Enr> {
            None
        }
    }

    fn peer(index: u8) -> (Keypair, Enr) {
        let mut seed = [0u8; 32];
        seed[0] = index;
        seed[1] = 0xA5;
        let kp = Keypair::from_secret_bytes(&seed).unwrap();
        let enr = kp.make_enr(format!("10.1.0.{index}:9000"), 1);
        (kp, enr)
    }

    fn test_utp(transport: Arc<dyn TalkTransport>) -> UtpMultiplexer {
        let clock = Arc::new(MonotonicClock::new());
        UtpMultiplexer::spawn(transport, clock, UtpConfig::default()).0
    }

    fn quick_config() -> LookupConfig {
        LookupConfig {
            deadline: Duration::from_secs(5),
            query_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn finds_inline_content_at_first_hop() {
        let transport = SimTransport::new();
        let (_, enr) = peer(1);
        transport.script(enr.node_id(), ContentResponse::Content(b"payload".to_vec()));

        let (found, _) = content_lookup(
            transport.clone(),
            NetworkId::History,
            test_utp(transport.clone()),
            NodeId::repeat_byte(0xFF),
            vec![0x00, 0x01],
            ContentId::repeat_byte(0x01),
            vec![enr.clone()],
            HashSet::new(),
            quick_config(),
        )
        .await;
        let found = found.expect("content not found");
        assert_eq!(found.content, b"payload");
        assert_eq!(found.from, enr.node_id());
        assert!(!found.via_utp);
    }

    /// Scenario: the first peers only know closer peers; the lookup walks
    /// the referral chain and finds the holder within the deadline.
    #[tokio::test]
    async fn follows_enr_referrals_to_the_holder() {
        let transport = SimTransport::new();
        let (_, first) = peer(1);
        let (_, second) = peer(2);
        let (_, holder) = peer(3);
        transport.script(
            first.node_id(),
            ContentResponse::Enrs(vec![second.to_wire()]),
        );
        transport.script(
            second.node_id(),
            ContentResponse::Enrs(vec![holder.to_wire(), first.to_wire()]),
        );
        transport.script(holder.node_id(), ContentResponse::Content(b"deep".to_vec()));

        let (found, discovered) = content_lookup(
            transport.clone(),
            NetworkId::History,
            test_utp(transport.clone()),
            NodeId::repeat_byte(0xFF),
            vec![0x00, 0x02],
            ContentId::repeat_byte(0x02),
            vec![first.clone()],
            HashSet::new(),
            quick_config(),
        )
        .await;
        assert_eq!(found.expect("not found").content, b"deep");
        // Referral targets became discovered candidates.
        assert!(discovered.iter().any(|e| e.node_id() == holder.node_id()));
        // No peer was queried twice.
        let mut queried = transport.queried();
        queried.sort();
        queried.dedup();
        assert_eq!(queried.len(), transport.queried().len());
    }

    #[tokio::test]
    async fn not_found_when_shortlist_exhausts() {
        let transport = SimTransport::new();
        let (_, a) = peer(1);
        let (_, b) = peer(2);
        transport.script(a.node_id(), ContentResponse::Enrs(vec![b.to_wire()]));
        transport.script(b.node_id(), ContentResponse::Enrs(vec![a.to_wire()]));

        let started = Instant::now();
        let (found, _) = content_lookup(
            transport.clone(),
            NetworkId::History,
            test_utp(transport.clone()),
            NodeId::repeat_byte(0xFF),
            vec![0x00, 0x03],
            ContentId::repeat_byte(0x03),
            vec![a],
            HashSet::new(),
            quick_config(),
        )
        .await;
        assert!(found.is_none());
        assert!(started.elapsed() < Duration::from_secs(5), "deadline exceeded");
    }

    #[tokio::test]
    async fn excluded_peers_are_never_queried() {
        let transport = SimTransport::new();
        let (_, bad) = peer(1);
        transport.script(bad.node_id(), ContentResponse::Content(b"tainted".to_vec()));

        let mut exclude = HashSet::new();
        exclude.insert(bad.node_id());
        let (found, _) = content_lookup(
            transport.clone(),
            NetworkId::History,
            test_utp(transport.clone()),
            NodeId::repeat_byte(0xFF),
            vec![0x00, 0x04],
            ContentId::repeat_byte(0x04),
            vec![bad.clone()],
            exclude,
            quick_config(),
        )
        .await;
        assert!(found.is_none());
        assert!(transport.queried().is_empty());
    }

    #[tokio::test]
    async fn unverifiable_enrs_are_dropped() {
        let (_, good) = peer(7);
        let mut forged = good.clone();
        forged.addr = "6.6.6.6:6".into();
        let decoded = decode_verified_enrs(&[good.to_wire(), forged.to_wire(), vec![0xFF]]);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].node_id(), good.node_id());
    }
}
