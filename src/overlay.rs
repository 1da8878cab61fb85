//! # Overlay network base
//!
//! One [`OverlayNetwork`] per Portal sub-network (history, beacon). The
//! public handle is cheap to clone; the private actor owns the routing
//! table and the content store, so every handler and the refresh timer
//! mutate them from one task.
//!
//! ## Message handling
//!
//! | Message | Handling |
//! |---------|----------|
//! | PING | admit/refresh the peer, record its radius, answer PONG |
//! | FINDNODES | records from the named buckets, ascending distance, 1200-byte budget |
//! | FINDCONTENT | inline content ≤ 1165 bytes, else uTP conn-id, else closer ENRs |
//! | OFFER | ACCEPT bitmap = decodable ∧ unknown ∧ within radius, uTP registration |
//!
//! ## Gossip
//!
//! Every freshly stored key is offered to the 5 nearest peers whose
//! advertised radius covers its content-id and who have not been offered
//! it before; each (peer, key) pair is recorded so a key is offered to a
//! peer at most once while the record survives.
//!
//! ## Lookups
//!
//! `find_content` checks the local store, then runs the α-parallel
//! iterative lookup. Content found remotely passes through validation
//! and storage before it is returned; a peer serving unverifiable bytes
//! is demoted and excluded, and the lookup retries without it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use anyhow::{anyhow, Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::content::{ContentId, ContentKey};
use crate::identity::{Enr, NodeId};
use crate::lookup::{content_lookup, node_lookup, LookupConfig};
use crate::messages::{
    accept_bitmap, bitmap_bit, decode_radius, encode_radius, Accept, ContentResponse, FindContent,
    FindNodes, Nodes, Offer, Ping, PortalMessage, Pong, MAX_INLINE_CONTENT, TALK_PAYLOAD_BUDGET,
};
use crate::protocols::{NetworkId, TalkTransport};
use crate::routing::{AddOutcome, RoutingTable, DEFAULT_ALPHA, DEFAULT_K};
use crate::store::{ContentStore, PutOutcome, StoreError};
use crate::utp::UtpMultiplexer;

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum PortalEvent {
    ContentAdded { network: NetworkId, key: ContentKey, content: Vec<u8> },
    ContentDropped { network: NetworkId, id: ContentId },
    NodeAdded { network: NetworkId, node_id: NodeId },
    TransferFailed { network: NetworkId, peer: NodeId, reason: String },
}

/// Terminal result of a content request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindResult {
    Found(Vec<u8>),
    NotFound,
}

/// Per-network tuning.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub k: usize,
    pub alpha: usize,
    /// Peers each fresh key is gossiped to.
    pub gossip_fanout: usize,
    pub bucket_refresh_interval: Duration,
    /// Timeout on a single outbound request (PING, OFFER, FINDNODES).
    pub request_timeout: Duration,
    /// Lookup retries when a peer serves unverifiable content.
    pub max_lookup_attempts: usize,
    pub lookup: LookupConfig,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            gossip_fanout: 5,
            bucket_refresh_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            max_lookup_attempts: 3,
            lookup: LookupConfig::default(),
        }
    }
}

enum OverlayCommand {
    HandleTalkReq {
        src: NodeId,
        payload: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    },
    FindContent {
        key: ContentKey,
        reply: oneshot::Sender<FindResult>,
    },
    Offer {
        peer: Enr,
        keys: Vec<ContentKey>,
        reply: oneshot::Sender<Result<usize>>,
    },
    Ping {
        peer: Enr,
        reply: oneshot::Sender<Result<U256>>,
    },
    StoreContent {
        key: ContentKey,
        value: Vec<u8>,
        source: Option<NodeId>,
        reply: oneshot::Sender<Result<PutOutcome, String>>,
    },
    LocalContent {
        key: ContentKey,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    ProcessInbound {
        peer: NodeId,
        raw_keys: Vec<Vec<u8>>,
        items: Vec<Vec<u8>>,
    },
    TransferFailed {
        peer: NodeId,
        reason: String,
    },
    RecordPong {
        peer: NodeId,
        radius: U256,
    },
    AddEnrs {
        enrs: Vec<Enr>,
    },
    HeadConfirmed {
        head: NodeId,
    },
    HeadFailed {
        head: NodeId,
    },
    Snapshot {
        target: ContentId,
        n: usize,
        reply: oneshot::Sender<Vec<Enr>>,
    },
    Radius {
        reply: oneshot::Sender<U256>,
    },
    TableSize {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Public handle to one overlay network.
#[derive(Clone)]
pub struct OverlayNetwork {
    network: NetworkId,
    cmd_tx: mpsc::Sender<OverlayCommand>,
}

impl OverlayNetwork {
    /// Spawn the overlay actor.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        network: NetworkId,
        self_enr: Enr,
        transport: Arc<dyn TalkTransport>,
        utp: UtpMultiplexer,
        store: ContentStore,
        config: OverlayConfig,
        event_tx: broadcast::Sender<PortalEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let handle = Self { network, cmd_tx };
        let self_id = self_enr.node_id();
        let actor = OverlayActor {
            network,
            self_enr,
            self_id,
            transport,
            utp,
            routing: RoutingTable::new(self_id, config.k),
            store,
            config,
            event_tx,
            handle: handle.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));
        handle
    }

    pub fn network(&self) -> NetworkId {
        self.network
    }

    /// Serve one inbound TALKREQ payload; the returned bytes are the
    /// TALKRESP payload.
    pub async fn handle_talk_req(&self, src: NodeId, payload: Vec<u8>) -> Vec<u8> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(OverlayCommand::HandleTalkReq { src, payload, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Recursive content retrieval: local store, then the network.
    pub async fn find_content(&self, key: ContentKey) -> Result<FindResult> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(OverlayCommand::FindContent { key, reply })
            .await
            .map_err(|_| anyhow!("overlay actor closed"))?;
        rx.await.context("overlay actor dropped lookup")
    }

    /// Offer keys to a specific peer; returns how many it accepted.
    pub async fn offer(&self, peer: Enr, keys: Vec<ContentKey>) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(OverlayCommand::Offer { peer, keys, reply })
            .await
            .map_err(|_| anyhow!("overlay actor closed"))?;
        rx.await.map_err(|_| anyhow!("overlay actor dropped offer"))?
    }

    /// Liveness + radius exchange. Returns the peer's radius.
    pub async fn ping(&self, peer: Enr) -> Result<U256> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(OverlayCommand::Ping { peer, reply })
            .await
            .map_err(|_| anyhow!("overlay actor closed"))?;
        rx.await.map_err(|_| anyhow!("overlay actor dropped ping"))?
    }

    /// Validate and store local or retrieved content, then gossip it.
    pub async fn store_content(&self, key: ContentKey, value: Vec<u8>) -> Result<PutOutcome> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(OverlayCommand::StoreContent { key, value, source: None, reply })
            .await
            .map_err(|_| anyhow!("overlay actor closed"))?;
        rx.await
            .map_err(|_| anyhow!("overlay actor dropped store"))?
            .map_err(|reason| anyhow!(reason))
    }

    pub async fn local_content(&self, key: ContentKey) -> Option<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(OverlayCommand::LocalContent { key, reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Content delivered by an accepted OFFER transfer.
    pub async fn process_inbound(&self, peer: NodeId, raw_keys: Vec<Vec<u8>>, items: Vec<Vec<u8>>) {
        let _ = self
            .cmd_tx
            .send(OverlayCommand::ProcessInbound { peer, raw_keys, items })
            .await;
    }

    /// A uTP transfer for this network failed.
    pub async fn transfer_failed(&self, peer: NodeId, reason: String) {
        let _ = self.cmd_tx.send(OverlayCommand::TransferFailed { peer, reason }).await;
    }

    /// Admit records (bootnodes, lookup discoveries).
    pub async fn add_enrs(&self, enrs: Vec<Enr>) {
        let _ = self.cmd_tx.send(OverlayCommand::AddEnrs { enrs }).await;
    }

    /// Nearest known records to a target, for lookups and diagnostics.
    pub async fn nearest(&self, target: ContentId, n: usize) -> Vec<Enr> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(OverlayCommand::Snapshot { target, n, reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn radius(&self) -> U256 {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(OverlayCommand::Radius { reply }).await.is_err() {
            return U256::ZERO;
        }
        rx.await.unwrap_or(U256::ZERO)
    }

    pub async fn table_size(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(OverlayCommand::TableSize { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(OverlayCommand::Shutdown).await;
    }

    async fn head_confirmed(&self, head: NodeId) {
        let _ = self.cmd_tx.send(OverlayCommand::HeadConfirmed { head }).await;
    }

    async fn head_failed(&self, head: NodeId) {
        let _ = self.cmd_tx.send(OverlayCommand::HeadFailed { head }).await;
    }
}

struct OverlayActor {
    network: NetworkId,
    self_enr: Enr,
    self_id: NodeId,
    transport: Arc<dyn TalkTransport>,
    utp: UtpMultiplexer,
    routing: RoutingTable,
    store: ContentStore,
    config: OverlayConfig,
    event_tx: broadcast::Sender<PortalEvent>,
    /// Own handle, cloned into spawned lookup/offer/probe tasks.
    handle: OverlayNetwork,
}

impl OverlayActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<OverlayCommand>) {
        info!(network = ?self.network, node = %hex::encode(&self.self_id[..8]), "overlay up");
        let mut refresh = tokio::time::interval(self.config.bucket_refresh_interval);
        refresh.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(OverlayCommand::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd).await,
                },
                _ = refresh.tick() => self.refresh_lowest_bucket(),
            }
        }
        debug!(network = ?self.network, "overlay actor stopped");
    }

    async fn on_command(&mut self, cmd: OverlayCommand) {
        match cmd {
            OverlayCommand::HandleTalkReq { src, payload, reply } => {
                let response = self.handle_request(src, &payload).await;
                let _ = reply.send(response);
            }
            OverlayCommand::FindContent { key, reply } => self.start_find_content(key, reply).await,
            OverlayCommand::Offer { peer, keys, reply } => self.start_offer(peer, keys, reply),
            OverlayCommand::Ping { peer, reply } => self.start_ping(peer, reply),
            OverlayCommand::StoreContent { key, value, source, reply } => {
                let verdict = self.store_and_gossip(key, value, source).await;
                let _ = reply.send(verdict.map_err(|e| e.to_string()));
            }
            OverlayCommand::LocalContent { key, reply } => {
                let value = self.store.get(&key).await.ok().flatten();
                let _ = reply.send(value);
            }
            OverlayCommand::ProcessInbound { peer, raw_keys, items } => {
                self.process_inbound(peer, raw_keys, items).await;
            }
            OverlayCommand::TransferFailed { peer, reason } => {
                self.routing.mark_failed(&peer);
                let _ = self.event_tx.send(PortalEvent::TransferFailed {
                    network: self.network,
                    peer,
                    reason,
                });
            }
            OverlayCommand::RecordPong { peer, radius } => {
                self.routing.mark_verified(&peer);
                self.routing.set_radius(peer, radius);
            }
            OverlayCommand::AddEnrs { enrs } => {
                for enr in enrs {
                    self.admit(enr);
                }
            }
            OverlayCommand::HeadConfirmed { head } => self.routing.head_confirmed(&head),
            OverlayCommand::HeadFailed { head } => self.routing.head_failed(&head),
            OverlayCommand::Snapshot { target, n, reply } => {
                let _ = reply.send(self.routing.nearest(&target, n));
            }
            OverlayCommand::Radius { reply } => {
                let _ = reply.send(self.store.radius());
            }
            OverlayCommand::TableSize { reply } => {
                let _ = reply.send(self.routing.len());
            }
            OverlayCommand::Shutdown => unreachable!("handled in run loop"),
        }
    }

    // ------------------------------------------------------------------
    // Inbound requests
    // ------------------------------------------------------------------

    async fn handle_request(&mut self, src: NodeId, payload: &[u8]) -> Vec<u8> {
        let message = match PortalMessage::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(peer = %hex::encode(&src[..4]), error = %err, "malformed overlay request");
                return Vec::new();
            }
        };
        trace!(peer = %hex::encode(&src[..4]), selector = message.selector(), "overlay request");
        match message {
            PortalMessage::Ping(ping) => self.on_ping(src, ping).encode(),
            PortalMessage::FindNodes(req) => self.on_find_nodes(req).encode(),
            PortalMessage::FindContent(req) => self.on_find_content(src, req).await.encode(),
            PortalMessage::Offer(offer) => self.on_offer(src, offer).await.encode(),
            other => {
                debug!(
                    peer = %hex::encode(&src[..4]),
                    selector = other.selector(),
                    "response message arrived as request"
                );
                Vec::new()
            }
        }
    }

    fn on_ping(&mut self, src: NodeId, ping: Ping) -> PortalMessage {
        if let Some(enr) = self.transport.enr_of(&src) {
            self.admit(enr);
        }
        self.routing.mark_verified(&src);
        if let Some(radius) = decode_radius(&ping.custom_payload) {
            self.routing.set_radius(src, radius);
        }
        trace!(peer = %hex::encode(&src[..4]), seq = ping.enr_seq, "ping");
        PortalMessage::Pong(Pong {
            enr_seq: self.self_enr.seq,
            custom_payload: encode_radius(self.store.radius()),
        })
    }

    fn on_find_nodes(&mut self, req: FindNodes) -> PortalMessage {
        let mut distances = req.distances;
        distances.sort_unstable();
        distances.dedup();

        let mut enrs: Vec<Vec<u8>> = Vec::new();
        let mut budget = TALK_PAYLOAD_BUDGET;
        'outer: for distance in distances {
            let records = if distance == 0 {
                vec![self.self_enr.clone()]
            } else {
                self.routing.at_log2_distance(distance)
            };
            for enr in records {
                let wire = enr.to_wire();
                // Offsets cost 4 bytes per entry on top of the record.
                let cost = wire.len() + 4;
                if cost > budget {
                    break 'outer;
                }
                budget -= cost;
                enrs.push(wire);
            }
        }
        PortalMessage::Nodes(Nodes { total: 1, enrs })
    }

    async fn on_find_content(&mut self, src: NodeId, req: FindContent) -> PortalMessage {
        let key = match ContentKey::decode(&req.content_key) {
            Ok(key) => key,
            Err(err) => {
                debug!(peer = %hex::encode(&src[..4]), error = %err, "bad content key");
                return PortalMessage::Content(ContentResponse::Enrs(Vec::new()));
            }
        };
        let content_id = key.content_id();

        if let Ok(Some(content)) = self.store.get(&key).await {
            if content.len() <= MAX_INLINE_CONTENT {
                return PortalMessage::Content(ContentResponse::Content(content));
            }
            // Too big for one message: redirect through uTP.
            if let Some(peer_enr) = self.enr_for(&src) {
                if let Some(conn_id) = self
                    .utp
                    .register_found_content_write(self.network, peer_enr, content)
                    .await
                {
                    debug!(
                        peer = %hex::encode(&src[..4]),
                        conn_id,
                        kind = key.kind(),
                        "serving content over utp"
                    );
                    return PortalMessage::Content(ContentResponse::ConnectionId(conn_id));
                }
            }
        }

        // Not ours to serve: hand out closer records, never the asker or us.
        let mut enrs = Vec::new();
        let mut budget = TALK_PAYLOAD_BUDGET;
        for enr in self.routing.nearest(&content_id, self.config.k) {
            let id = enr.node_id();
            if id == src || id == self.self_id {
                continue;
            }
            let wire = enr.to_wire();
            let cost = wire.len() + 4;
            if cost > budget {
                break;
            }
            budget -= cost;
            enrs.push(wire);
        }
        PortalMessage::Content(ContentResponse::Enrs(enrs))
    }

    async fn on_offer(&mut self, src: NodeId, offer: Offer) -> PortalMessage {
        let mut wanted = Vec::with_capacity(offer.content_keys.len());
        let mut wanted_keys = Vec::new();
        for raw in &offer.content_keys {
            let want = match ContentKey::decode(raw) {
                Ok(key) => {
                    !self.store.contains(&key) && self.store.is_within_radius(&key.content_id())
                }
                Err(_) => false,
            };
            if want {
                wanted_keys.push(raw.clone());
            }
            wanted.push(want);
        }

        if wanted_keys.is_empty() {
            return PortalMessage::Accept(Accept {
                connection_id: 0,
                accepted: accept_bitmap(&wanted),
            });
        }
        let Some(peer_enr) = self.enr_for(&src) else {
            return PortalMessage::Accept(Accept {
                connection_id: 0,
                accepted: accept_bitmap(&vec![false; wanted.len()]),
            });
        };
        match self.utp.register_accept_read(self.network, peer_enr, wanted_keys).await {
            Some(conn_id) => {
                debug!(
                    peer = %hex::encode(&src[..4]),
                    conn_id,
                    accepted = wanted.iter().filter(|w| **w).count(),
                    offered = wanted.len(),
                    "offer accepted"
                );
                PortalMessage::Accept(Accept { connection_id: conn_id, accepted: accept_bitmap(&wanted) })
            }
            None => PortalMessage::Accept(Accept {
                connection_id: 0,
                accepted: accept_bitmap(&vec![false; wanted.len()]),
            }),
        }
    }

    /// ENR for a peer: routing table first, then the session layer.
    fn enr_for(&self, id: &NodeId) -> Option<Enr> {
        self.routing.enr_of(id).or_else(|| self.transport.enr_of(id))
    }

    // ------------------------------------------------------------------
    // Outbound operations
    // ------------------------------------------------------------------

    fn start_ping(&mut self, peer: Enr, reply: oneshot::Sender<Result<U256>>) {
        let transport = self.transport.clone();
        let network = self.network;
        let message = PortalMessage::Ping(Ping {
            enr_seq: self.self_enr.seq,
            custom_payload: encode_radius(self.store.radius()),
        })
        .encode();
        let timeout = self.config.request_timeout;
        let handle = self.handle.clone();
        let peer_id = peer.node_id();
        tokio::spawn(async move {
            let outcome = async {
                let raw = tokio::time::timeout(timeout, transport.talk_req(&peer, network.protocol(), message))
                    .await
                    .map_err(|_| anyhow!("ping timed out"))??;
                match PortalMessage::decode(&raw)? {
                    PortalMessage::Pong(pong) => {
                        let radius = decode_radius(&pong.custom_payload)
                            .ok_or_else(|| anyhow!("pong without radius"))?;
                        Ok::<_, anyhow::Error>(radius)
                    }
                    _ => Err(anyhow!("unexpected response to ping")),
                }
            }
            .await;
            match &outcome {
                Ok(radius) => {
                    handle.record_pong(peer_id, *radius).await;
                }
                Err(_) => {
                    handle.transfer_failed(peer_id, "ping failed".into()).await;
                }
            }
            let _ = reply.send(outcome);
        });
    }

    async fn start_find_content(&mut self, key: ContentKey, reply: oneshot::Sender<FindResult>) {
        // Local hit needs no network round.
        if let Ok(Some(content)) = self.store.get(&key).await {
            let _ = reply.send(FindResult::Found(content));
            return;
        }

        let content_id = key.content_id();
        let seeds = self.routing.nearest(&content_id, self.config.k);
        if seeds.is_empty() {
            let _ = reply.send(FindResult::NotFound);
            return;
        }

        let transport = self.transport.clone();
        let utp = self.utp.clone();
        let network = self.network;
        let self_id = self.self_id;
        let handle = self.handle.clone();
        let config = self.config.lookup.clone();
        let attempts = self.config.max_lookup_attempts;

        tokio::spawn(async move {
            let key_bytes = key.encode();
            let mut exclude: HashSet<NodeId> = HashSet::new();
            for _ in 0..attempts {
                let (found, discovered) = content_lookup(
                    transport.clone(),
                    network,
                    utp.clone(),
                    self_id,
                    key_bytes.clone(),
                    content_id,
                    seeds.clone(),
                    exclude.clone(),
                    config.clone(),
                )
                .await;
                if !discovered.is_empty() {
                    handle.add_enrs(discovered).await;
                }
                let Some(found) = found else {
                    let _ = reply.send(FindResult::NotFound);
                    return;
                };
                // Retrieved content is only a result once it validates.
                let (verdict_tx, verdict_rx) = oneshot::channel();
                let stored = handle
                    .cmd_tx
                    .send(OverlayCommand::StoreContent {
                        key: key.clone(),
                        value: found.content.clone(),
                        source: Some(found.from),
                        reply: verdict_tx,
                    })
                    .await
                    .is_ok();
                let verdict = if stored { verdict_rx.await.ok() } else { None };
                match verdict {
                    Some(Ok(_)) => {
                        let _ = reply.send(FindResult::Found(found.content));
                        return;
                    }
                    Some(Err(reason)) => {
                        debug!(
                            peer = %hex::encode(&found.from[..4]),
                            reason,
                            "lookup content failed validation; retrying without peer"
                        );
                        exclude.insert(found.from);
                    }
                    None => {
                        let _ = reply.send(FindResult::NotFound);
                        return;
                    }
                }
            }
            let _ = reply.send(FindResult::NotFound);
        });
    }

    fn start_offer(&mut self, peer: Enr, keys: Vec<ContentKey>, reply: oneshot::Sender<Result<usize>>) {
        // Suppression bookkeeping happens before the wire round so a
        // concurrent gossip pass cannot double-offer.
        let peer_id = peer.node_id();
        for key in &keys {
            self.routing.register_offered(peer_id, key.content_id());
        }
        let transport = self.transport.clone();
        let utp = self.utp.clone();
        let network = self.network;
        let handle = self.handle.clone();
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let _ = reply.send(
                run_offer(transport, utp, network, handle, peer, keys, timeout).await,
            );
        });
    }

    // ------------------------------------------------------------------
    // Storage and gossip
    // ------------------------------------------------------------------

    async fn store_and_gossip(
        &mut self,
        key: ContentKey,
        value: Vec<u8>,
        source: Option<NodeId>,
    ) -> Result<PutOutcome, StoreError> {
        match self.store.put(&key, value.clone()).await {
            Ok(report) => {
                for id in report.evicted {
                    let _ = self
                        .event_tx
                        .send(PortalEvent::ContentDropped { network: self.network, id });
                }
                if report.outcome == PutOutcome::Stored {
                    let _ = self.event_tx.send(PortalEvent::ContentAdded {
                        network: self.network,
                        key: key.clone(),
                        content: value,
                    });
                    self.gossip(key);
                }
                Ok(report.outcome)
            }
            Err(err) => {
                if let StoreError::Content(content_err) = &err {
                    if let Some(peer) = source {
                        debug!(
                            peer = %hex::encode(&peer[..4]),
                            error = %content_err,
                            "peer served invalid content; demoting"
                        );
                        self.routing.mark_failed(&peer);
                    }
                }
                Err(err)
            }
        }
    }

    /// Offer a fresh key to the nearest interested peers that have not
    /// seen it from us yet.
    fn gossip(&mut self, key: ContentKey) {
        let content_id = key.content_id();
        let candidates = self.routing.interested_in(&content_id, self.routing.len());
        let mut chosen = Vec::new();
        for enr in candidates {
            if chosen.len() >= self.config.gossip_fanout {
                break;
            }
            let id = enr.node_id();
            if self.routing.already_offered(&id, &content_id) {
                continue;
            }
            self.routing.register_offered(id, content_id);
            chosen.push(enr);
        }
        if chosen.is_empty() {
            return;
        }
        debug!(kind = key.kind(), fanout = chosen.len(), "gossiping content");
        for enr in chosen {
            let transport = self.transport.clone();
            let utp = self.utp.clone();
            let network = self.network;
            let handle = self.handle.clone();
            let key = key.clone();
            let timeout = self.config.request_timeout;
            tokio::spawn(async move {
                if let Err(err) =
                    run_offer(transport, utp, network, handle, enr, vec![key], timeout).await
                {
                    trace!(error = %err, "gossip offer failed");
                }
            });
        }
    }

    /// Content streamed in from an accepted OFFER.
    async fn process_inbound(&mut self, peer: NodeId, raw_keys: Vec<Vec<u8>>, items: Vec<Vec<u8>>) {
        if raw_keys.len() != items.len() {
            warn!(
                peer = %hex::encode(&peer[..4]),
                expected = raw_keys.len(),
                got = items.len(),
                "offer transfer item count mismatch"
            );
            self.routing.mark_failed(&peer);
        }
        for (raw_key, item) in raw_keys.into_iter().zip(items) {
            let key = match ContentKey::decode(&raw_key) {
                Ok(key) => key,
                Err(_) => continue,
            };
            if let Err(err) = self.store_and_gossip(key.clone(), item, Some(peer)).await {
                debug!(kind = key.kind(), error = %err, "inbound content rejected");
            }
        }
    }

    // ------------------------------------------------------------------
    // Routing maintenance
    // ------------------------------------------------------------------

    fn admit(&mut self, enr: Enr) {
        let id = enr.node_id();
        match self.routing.add(enr) {
            AddOutcome::Inserted => {
                let _ = self
                    .event_tx
                    .send(PortalEvent::NodeAdded { network: self.network, node_id: id });
            }
            AddOutcome::PendingProbe(head) => self.probe_head(head),
            AddOutcome::Updated | AddOutcome::Rejected => {}
        }
    }

    /// Liveness-probe a bucket head before letting a pending candidate
    /// replace it.
    fn probe_head(&self, head: Enr) {
        let transport = self.transport.clone();
        let network = self.network;
        let handle = self.handle.clone();
        let timeout = self.config.request_timeout;
        let message = PortalMessage::Ping(Ping {
            enr_seq: self.self_enr.seq,
            custom_payload: encode_radius(self.store.radius()),
        })
        .encode();
        tokio::spawn(async move {
            let head_id = head.node_id();
            let alive = matches!(
                tokio::time::timeout(timeout, transport.talk_req(&head, network.protocol(), message))
                    .await,
                Ok(Ok(raw)) if PortalMessage::decode(&raw).is_ok()
            );
            if alive {
                handle.head_confirmed(head_id).await;
            } else {
                handle.head_failed(head_id).await;
            }
        });
    }

    fn refresh_lowest_bucket(&mut self) {
        let Some(bucket) = self.routing.lowest_populated_bucket() else { return };
        let target = self.routing.refresh_target(bucket);
        self.routing.mark_bucket_refreshed(bucket);
        let seeds = self.routing.nearest(&target, self.config.k);
        let transport = self.transport.clone();
        let network = self.network;
        let self_id = self.self_id;
        let handle = self.handle.clone();
        let config = self.config.lookup.clone();
        trace!(bucket, "bucket refresh lookup");
        tokio::spawn(async move {
            let discovered = node_lookup(transport, network, self_id, target, seeds, config).await;
            if !discovered.is_empty() {
                handle.add_enrs(discovered).await;
            }
        });
    }
}

impl OverlayNetwork {
    async fn record_pong(&self, peer: NodeId, radius: U256) {
        let _ = self.cmd_tx.send(OverlayCommand::RecordPong { peer, radius }).await;
    }
}

/// Send OFFER, parse ACCEPT, stream the accepted items over uTP.
async fn run_offer(
    transport: Arc<dyn TalkTransport>,
    utp: UtpMultiplexer,
    network: NetworkId,
    handle: OverlayNetwork,
    peer: Enr,
    keys: Vec<ContentKey>,
    timeout: Duration,
) -> Result<usize> {
    let raw_keys: Vec<Vec<u8>> = keys.iter().map(|k| k.encode()).collect();
    let message = PortalMessage::Offer(Offer { content_keys: raw_keys.clone() }).encode();
    let raw = tokio::time::timeout(timeout, transport.talk_req(&peer, network.protocol(), message))
        .await
        .map_err(|_| anyhow!("offer timed out"))??;
    let accept = match PortalMessage::decode(&raw)? {
        PortalMessage::Accept(accept) => accept,
        _ => return Err(anyhow!("unexpected response to offer")),
    };

    let mut accepted_keys = Vec::new();
    let mut items = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        if !bitmap_bit(&accept.accepted, i) {
            continue;
        }
        // We only offer what we hold, but the store may have evicted the
        // key since; skip silently rather than stream a hole.
        match handle.local_content(key.clone()).await {
            Some(value) => {
                accepted_keys.push(raw_keys[i].clone());
                items.push(value);
            }
            None => debug!(kind = key.kind(), "accepted key no longer stored"),
        }
    }
    let accepted = accepted_keys.len();
    if accepted > 0 {
        utp.initiate_offer_write(network, peer, accept.connection_id, accepted_keys, items).await;
    }
    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::protocols::{AcceptAllBeaconVerifier, MonotonicClock};
    use crate::store::{MemoryDb, StoreConfig};
    use crate::utp::UtpConfig;
    use crate::validation::HeaderValidator;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Transport stub: outbound requests fail, but the session layer
    /// knows the ENRs of registered peers.
    struct StubTransport {
        enrs: Mutex<HashMap<NodeId, Enr>>,
    }

    impl StubTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { enrs: Mutex::new(HashMap::new()) })
        }

        fn learn(&self, enr: &Enr) {
            self.enrs.lock().unwrap().insert(enr.node_id(), enr.clone());
        }
    }

    #[async_trait::async_trait]
    impl TalkTransport for StubTransport {
        async fn talk_req(
            &self,
            _to: &Enr,
            _protocol: &[u8],
            _payload: Vec<u8>,
        ) -> Result<Vec<u8>> {
            Err(anyhow!("stub transport has no wire"))
        }

        fn enr_of(&self, node: &NodeId) -> Option<Enr> {
            self.enrs.lock().unwrap().get(node).cloned()
        }
    }

    struct Fixture {
        overlay: OverlayNetwork,
        transport: Arc<StubTransport>,
        utp: UtpMultiplexer,
        self_enr: Enr,
        events: broadcast::Receiver<PortalEvent>,
    }

    async fn fixture(network: NetworkId) -> Fixture {
        let transport = StubTransport::new();
        let clock = Arc::new(MonotonicClock::new());
        let (utp, _utp_events) =
            UtpMultiplexer::spawn(transport.clone(), clock, UtpConfig::default());
        let keypair = Keypair::generate();
        let self_enr = keypair.make_enr("10.0.0.1:9009", 1);
        let store = ContentStore::open(
            MemoryDb::new(),
            self_enr.node_id(),
            HeaderValidator::default(),
            Arc::new(AcceptAllBeaconVerifier),
            StoreConfig::default(),
        )
        .await
        .unwrap();
        let (event_tx, events) = broadcast::channel(64);
        let overlay = OverlayNetwork::spawn(
            network,
            self_enr.clone(),
            transport.clone(),
            utp.clone(),
            store,
            OverlayConfig::default(),
            event_tx,
        );
        Fixture { overlay, transport, utp, self_enr, events }
    }

    fn peer_enr(index: u8) -> Enr {
        let mut seed = [0u8; 32];
        seed[0] = index;
        seed[1] = 0x77;
        Keypair::from_secret_bytes(&seed).unwrap().make_enr(format!("10.0.1.{index}:9009"), 1)
    }

    #[tokio::test]
    async fn ping_admits_peer_and_answers_with_our_radius() {
        let mut f = fixture(NetworkId::History).await;
        let peer = peer_enr(1);
        f.transport.learn(&peer);

        let request = PortalMessage::Ping(Ping {
            enr_seq: 1,
            custom_payload: encode_radius(U256::from(1234u64)),
        })
        .encode();
        let response = f.overlay.handle_talk_req(peer.node_id(), request).await;
        match PortalMessage::decode(&response).unwrap() {
            PortalMessage::Pong(pong) => {
                assert_eq!(pong.enr_seq, f.self_enr.seq);
                assert_eq!(decode_radius(&pong.custom_payload), Some(U256::MAX));
            }
            other => panic!("expected pong, got {other:?}"),
        }
        assert_eq!(f.overlay.table_size().await, 1);
        assert!(matches!(f.events.try_recv(), Ok(PortalEvent::NodeAdded { .. })));
    }

    #[tokio::test]
    async fn find_nodes_serves_own_record_and_stays_in_budget() {
        let f = fixture(NetworkId::History).await;
        let peers: Vec<Enr> = (1..40).map(peer_enr).collect();
        f.overlay.add_enrs(peers.clone()).await;

        let request = PortalMessage::FindNodes(FindNodes {
            distances: (0..=256).collect(),
        })
        .encode();
        let response = f.overlay.handle_talk_req(peer_enr(1).node_id(), request).await;
        let nodes = match PortalMessage::decode(&response).unwrap() {
            PortalMessage::Nodes(nodes) => nodes,
            other => panic!("expected nodes, got {other:?}"),
        };
        assert_eq!(nodes.total, 1);
        // Distance 0 is our own record, served first.
        assert_eq!(Enr::from_wire(&nodes.enrs[0]).unwrap(), f.self_enr);
        let payload: usize = nodes.enrs.iter().map(|e| e.len() + 4).sum();
        assert!(payload <= TALK_PAYLOAD_BUDGET, "response over budget: {payload}");
    }

    #[tokio::test]
    async fn find_content_inline_redirect_and_referral() {
        let f = fixture(NetworkId::Beacon).await;
        let asker = peer_enr(9);
        f.transport.learn(&asker);

        // Small content answers inline.
        let small_key = ContentKey::LightClientFinalityUpdate { finalized_slot: 1 };
        f.overlay.store_content(small_key.clone(), vec![0xAB; 100]).await.unwrap();
        let request =
            PortalMessage::FindContent(FindContent { content_key: small_key.encode() }).encode();
        let response = f.overlay.handle_talk_req(asker.node_id(), request).await;
        assert_eq!(
            PortalMessage::decode(&response).unwrap(),
            PortalMessage::Content(ContentResponse::Content(vec![0xAB; 100]))
        );

        // Oversized content redirects through a registered uTP transfer.
        let big_key = ContentKey::LightClientFinalityUpdate { finalized_slot: 2 };
        f.overlay.store_content(big_key.clone(), vec![0xCD; 5_000]).await.unwrap();
        let request =
            PortalMessage::FindContent(FindContent { content_key: big_key.encode() }).encode();
        let response = f.overlay.handle_talk_req(asker.node_id(), request).await;
        match PortalMessage::decode(&response).unwrap() {
            PortalMessage::Content(ContentResponse::ConnectionId(_)) => {}
            other => panic!("expected conn-id redirect, got {other:?}"),
        }
        assert_eq!(f.utp.open_count().await, 1);

        // Unknown content refers closer peers, never the asker.
        f.overlay.add_enrs(vec![asker.clone(), peer_enr(10)]).await;
        let missing = ContentKey::LightClientFinalityUpdate { finalized_slot: 3 };
        let request =
            PortalMessage::FindContent(FindContent { content_key: missing.encode() }).encode();
        let response = f.overlay.handle_talk_req(asker.node_id(), request).await;
        match PortalMessage::decode(&response).unwrap() {
            PortalMessage::Content(ContentResponse::Enrs(enrs)) => {
                let ids: Vec<NodeId> =
                    enrs.iter().map(|raw| Enr::from_wire(raw).unwrap().node_id()).collect();
                assert!(!ids.contains(&asker.node_id()), "referred the asker to itself");
                assert!(ids.contains(&peer_enr(10).node_id()));
            }
            other => panic!("expected referral, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn offer_bitmap_marks_unknown_keys_within_radius() {
        let f = fixture(NetworkId::Beacon).await;
        let offeror = peer_enr(5);
        f.transport.learn(&offeror);

        let k1 = ContentKey::LightClientFinalityUpdate { finalized_slot: 10 };
        let k2 = ContentKey::LightClientFinalityUpdate { finalized_slot: 11 };
        let k3 = ContentKey::LightClientFinalityUpdate { finalized_slot: 12 };
        // k2 is already ours; only k1 and k3 are wanted.
        f.overlay.store_content(k2.clone(), vec![1, 2, 3]).await.unwrap();

        let request = PortalMessage::Offer(Offer {
            content_keys: vec![k1.encode(), k2.encode(), k3.encode()],
        })
        .encode();
        let response = f.overlay.handle_talk_req(offeror.node_id(), request).await;
        let accept = match PortalMessage::decode(&response).unwrap() {
            PortalMessage::Accept(accept) => accept,
            other => panic!("expected accept, got {other:?}"),
        };
        assert_eq!(accept.accepted, vec![0b101]);
        assert_eq!(f.utp.open_count().await, 1);

        // Offering only known keys yields an all-zero bitmap and no
        // transfer registration.
        let request =
            PortalMessage::Offer(Offer { content_keys: vec![k2.encode()] }).encode();
        let response = f.overlay.handle_talk_req(offeror.node_id(), request).await;
        match PortalMessage::decode(&response).unwrap() {
            PortalMessage::Accept(accept) => {
                assert_eq!(accept.accepted, vec![0b0]);
                assert_eq!(accept.connection_id, 0);
            }
            other => panic!("expected accept, got {other:?}"),
        }
        assert_eq!(f.utp.open_count().await, 1);
    }

    #[tokio::test]
    async fn malformed_and_unexpected_messages_answer_empty() {
        let f = fixture(NetworkId::History).await;
        let peer = peer_enr(2);
        assert!(f.overlay.handle_talk_req(peer.node_id(), vec![0x99, 1, 2]).await.is_empty());
        let as_request = PortalMessage::Pong(Pong {
            enr_seq: 1,
            custom_payload: encode_radius(U256::ZERO),
        })
        .encode();
        assert!(f.overlay.handle_talk_req(peer.node_id(), as_request).await.is_empty());
    }
}
