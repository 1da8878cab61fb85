//! # Portal node facade
//!
//! [`PortalNode`] wires the pieces into one embeddable unit: the uTP
//! multiplexer, one overlay per network (history, beacon), the TALKREQ
//! dispatcher, and identity persistence.
//!
//! ## Quick start
//!
//! ```ignore
//! let (talk_tx, talk_rx) = tokio::sync::mpsc::channel(256);
//! let node = PortalNode::builder()
//!     .transport(my_discv5_adapter, talk_rx)
//!     .database(MemoryDb::new())
//!     .address("203.0.113.7:9009")
//!     .build()
//!     .await?;
//!
//! node.add_bootnode(bootnode_enr).await?;
//! let header = node.find_content(key).await?;
//! ```
//!
//! ## Dispatch
//!
//! The dispatcher owns the inbound TALKREQ receiver and routes by
//! protocol id: uTP packets go to the multiplexer in arrival order;
//! overlay requests are answered concurrently; unknown protocol ids are
//! logged and answered empty. It also drains terminal uTP transfer
//! events back into the owning overlay.
//!
//! ## Persisted state
//!
//! Four reserved database keys rehydrate identity and bootnodes across
//! restarts: `enr`, `privateKey`, `publicKey`, and `peers` (a JSON array
//! of ENR text). Everything else in the database is content.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::identity::{Enr, Keypair, NodeId};
use crate::overlay::{FindResult, OverlayConfig, OverlayNetwork, PortalEvent};
use crate::protocols::{
    protocol_id, AcceptAllBeaconVerifier, BeaconVerifier, Clock, ContentDatabase, MonotonicClock,
    NetworkId, TalkRequest, TalkTransport,
};
use crate::content::ContentKey;
use crate::store::{ContentStore, PutOutcome, StoreConfig};
use crate::utp::{TransferEvent, UtpConfig, UtpMultiplexer};
use crate::validation::HeaderValidator;

/// Reserved database keys for identity rehydration.
mod reserved {
    pub const ENR: &str = "enr";
    pub const PRIVATE_KEY: &str = "privateKey";
    pub const PUBLIC_KEY: &str = "publicKey";
    pub const PEERS: &str = "peers";
}

/// Bootnodes remembered across restarts.
const PERSISTED_PEER_LIMIT: usize = 32;

/// Event channel capacity; slow consumers miss old events.
const EVENT_CHANNEL_SIZE: usize = 256;

pub struct NodeBuilder {
    transport: Option<Arc<dyn TalkTransport>>,
    talk_rx: Option<mpsc::Receiver<TalkRequest>>,
    db: Option<Arc<dyn ContentDatabase>>,
    beacon_verifier: Arc<dyn BeaconVerifier>,
    clock: Arc<dyn Clock>,
    keypair: Option<Keypair>,
    addr: String,
    header_validator: HeaderValidator,
    history_config: OverlayConfig,
    beacon_config: OverlayConfig,
    history_store: StoreConfig,
    beacon_store: StoreConfig,
    utp_config: UtpConfig,
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self {
            transport: None,
            talk_rx: None,
            db: None,
            beacon_verifier: Arc::new(AcceptAllBeaconVerifier),
            clock: Arc::new(MonotonicClock::new()),
            keypair: None,
            addr: "0.0.0.0:9009".to_string(),
            header_validator: HeaderValidator::default(),
            history_config: OverlayConfig::default(),
            beacon_config: OverlayConfig::default(),
            history_store: StoreConfig::default(),
            beacon_store: StoreConfig::default(),
            utp_config: UtpConfig::default(),
        }
    }
}

impl NodeBuilder {
    /// The authenticated datagram service and its inbound request stream.
    pub fn transport(
        mut self,
        transport: Arc<dyn TalkTransport>,
        talk_rx: mpsc::Receiver<TalkRequest>,
    ) -> Self {
        self.transport = Some(transport);
        self.talk_rx = Some(talk_rx);
        self
    }

    pub fn database(mut self, db: Arc<dyn ContentDatabase>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn beacon_verifier(mut self, verifier: Arc<dyn BeaconVerifier>) -> Self {
        self.beacon_verifier = verifier;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fixed identity instead of the persisted/generated one.
    pub fn keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Transport coordinates advertised in our ENR.
    pub fn address(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Chain constants for header proof validation.
    pub fn header_validator(mut self, validator: HeaderValidator) -> Self {
        self.header_validator = validator;
        self
    }

    pub fn history_config(mut self, config: OverlayConfig) -> Self {
        self.history_config = config;
        self
    }

    pub fn beacon_config(mut self, config: OverlayConfig) -> Self {
        self.beacon_config = config;
        self
    }

    pub fn history_store(mut self, config: StoreConfig) -> Self {
        self.history_store = config;
        self
    }

    pub fn beacon_store(mut self, config: StoreConfig) -> Self {
        self.beacon_store = config;
        self
    }

    pub fn utp_config(mut self, config: UtpConfig) -> Self {
        self.utp_config = config;
        self
    }

    pub async fn build(self) -> Result<PortalNode> {
        let transport = self.transport.context("transport is required")?;
        let talk_rx = self.talk_rx.context("talk request receiver is required")?;
        let db = self.db.context("database is required")?;

        let keypair = match self.keypair {
            Some(keypair) => keypair,
            None => rehydrate_or_generate_keypair(db.as_ref()).await?,
        };
        let enr = rehydrate_enr(db.as_ref(), &keypair, &self.addr).await?;
        let node_id = enr.node_id();
        info!(node = %hex::encode(&node_id[..8]), addr = %enr.addr, "portal node starting");

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (utp, transfer_events) =
            UtpMultiplexer::spawn(transport.clone(), self.clock.clone(), self.utp_config);

        let history_store = ContentStore::open(
            db.clone(),
            node_id,
            self.header_validator.clone(),
            self.beacon_verifier.clone(),
            self.history_store,
        )
        .await?;
        let history = OverlayNetwork::spawn(
            NetworkId::History,
            enr.clone(),
            transport.clone(),
            utp.clone(),
            history_store,
            self.history_config,
            event_tx.clone(),
        );

        let beacon_store = ContentStore::open(
            db.clone(),
            node_id,
            HeaderValidator::default(),
            self.beacon_verifier.clone(),
            self.beacon_store,
        )
        .await?;
        let beacon = OverlayNetwork::spawn(
            NetworkId::Beacon,
            enr.clone(),
            transport.clone(),
            utp.clone(),
            beacon_store,
            self.beacon_config,
            event_tx.clone(),
        );

        let dispatcher = tokio::spawn(dispatch_loop(
            talk_rx,
            transfer_events,
            utp.clone(),
            history.clone(),
            beacon.clone(),
        ));

        let node = PortalNode { keypair, enr, db, history, beacon, utp, event_tx, dispatcher };
        node.rehydrate_bootnodes().await;
        Ok(node)
    }
}

pub struct PortalNode {
    keypair: Keypair,
    enr: Enr,
    db: Arc<dyn ContentDatabase>,
    history: OverlayNetwork,
    beacon: OverlayNetwork,
    utp: UtpMultiplexer,
    event_tx: broadcast::Sender<PortalEvent>,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl PortalNode {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    pub fn enr(&self) -> &Enr {
        &self.enr
    }

    pub fn node_id(&self) -> NodeId {
        self.enr.node_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn history(&self) -> &OverlayNetwork {
        &self.history
    }

    pub fn beacon(&self) -> &OverlayNetwork {
        &self.beacon
    }

    /// Subscribe to node events. Each subscriber sees events from the
    /// moment of subscription.
    pub fn events(&self) -> broadcast::Receiver<PortalEvent> {
        self.event_tx.subscribe()
    }

    fn overlay_for(&self, key: &ContentKey) -> &OverlayNetwork {
        match key.network() {
            NetworkId::History => &self.history,
            NetworkId::Beacon => &self.beacon,
        }
    }

    /// Recursive content retrieval on the network the key belongs to.
    pub async fn find_content(&self, key: ContentKey) -> Result<FindResult> {
        self.overlay_for(&key).find_content(key).await
    }

    /// Validate, store, and gossip a content item.
    pub async fn store_content(&self, key: ContentKey, value: Vec<u8>) -> Result<PutOutcome> {
        self.overlay_for(&key).store_content(key, value).await
    }

    /// Offer keys to a peer on the network of the first key.
    pub async fn offer(&self, peer: Enr, keys: Vec<ContentKey>) -> Result<usize> {
        let network = keys.first().map(|k| k.network()).unwrap_or(NetworkId::History);
        let overlay = match network {
            NetworkId::History => &self.history,
            NetworkId::Beacon => &self.beacon,
        };
        overlay.offer(peer, keys).await
    }

    /// Admit a bootnode to both networks, ping it, and persist it.
    pub async fn add_bootnode(&self, enr: Enr) -> Result<()> {
        enr.verify().map_err(|e| anyhow!("bootnode record invalid: {e}"))?;
        self.history.add_enrs(vec![enr.clone()]).await;
        self.beacon.add_enrs(vec![enr.clone()]).await;
        // Liveness + radius exchange per network; failure just leaves the
        // record unverified.
        let _ = self.history.ping(enr.clone()).await;
        let _ = self.beacon.ping(enr.clone()).await;
        self.persist_peers().await;
        Ok(())
    }

    /// Write the current close neighborhood to the `peers` key.
    pub async fn persist_peers(&self) {
        let neighbors = self.history.nearest(self.node_id(), PERSISTED_PEER_LIMIT).await;
        let texts: Vec<String> = neighbors.iter().map(|e| e.to_text()).collect();
        match serde_json::to_vec(&texts) {
            Ok(json) => {
                if let Err(err) = self.db.put(reserved::PEERS, json).await {
                    warn!(error = %err, "failed to persist peers");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize peers"),
        }
    }

    async fn rehydrate_bootnodes(&self) {
        let Ok(Some(json)) = self.db.get(reserved::PEERS).await else { return };
        let Ok(texts) = serde_json::from_slice::<Vec<String>>(&json) else {
            warn!("persisted peers entry is not a JSON string array");
            return;
        };
        let enrs: Vec<Enr> = texts
            .iter()
            .filter_map(|text| Enr::from_text(text).ok())
            .filter(|enr| enr.verify().is_ok())
            .collect();
        if enrs.is_empty() {
            return;
        }
        info!(count = enrs.len(), "rehydrated persisted peers");
        self.history.add_enrs(enrs.clone()).await;
        self.beacon.add_enrs(enrs).await;
    }

    /// Persist peers and stop every actor.
    pub async fn shutdown(self) {
        self.persist_peers().await;
        self.history.shutdown().await;
        self.beacon.shutdown().await;
        self.utp.shutdown().await;
        self.dispatcher.abort();
    }
}

/// Route inbound TALKREQs and terminal transfer events.
async fn dispatch_loop(
    mut talk_rx: mpsc::Receiver<TalkRequest>,
    mut transfer_events: mpsc::Receiver<TransferEvent>,
    utp: UtpMultiplexer,
    history: OverlayNetwork,
    beacon: OverlayNetwork,
) {
    loop {
        tokio::select! {
            request = talk_rx.recv() => {
                let Some(request) = request else { break };
                route_talk_request(request, &utp, &history, &beacon).await;
            }
            event = transfer_events.recv() => {
                let Some(event) = event else { break };
                route_transfer_event(event, &history, &beacon).await;
            }
        }
    }
    debug!("dispatcher stopped");
}

async fn route_talk_request(
    request: TalkRequest,
    utp: &UtpMultiplexer,
    history: &OverlayNetwork,
    beacon: &OverlayNetwork,
) {
    let TalkRequest { src, protocol, payload, responder } = request;
    if protocol == protocol_id::UTP {
        // uTP packets stay in arrival order per socket; the empty
        // TALKRESP just completes the request envelope.
        utp.handle_packet(src, payload).await;
        let _ = responder.send(Vec::new());
        return;
    }
    let overlay = match NetworkId::from_protocol(&protocol) {
        Some(NetworkId::History) => history.clone(),
        Some(NetworkId::Beacon) => beacon.clone(),
        None => {
            debug!(protocol = %hex::encode(&protocol), "talkreq for unknown protocol");
            let _ = responder.send(Vec::new());
            return;
        }
    };
    // Overlay requests may block on store reads or uTP registration;
    // answer them concurrently.
    tokio::spawn(async move {
        let response = overlay.handle_talk_req(src, payload).await;
        let _ = responder.send(response);
    });
}

async fn route_transfer_event(
    event: TransferEvent,
    history: &OverlayNetwork,
    beacon: &OverlayNetwork,
) {
    match event {
        TransferEvent::InboundContent { network, peer, content_keys, items } => {
            let overlay = match network {
                NetworkId::History => history,
                NetworkId::Beacon => beacon,
            };
            overlay.process_inbound(peer, content_keys, items).await;
        }
        TransferEvent::Failed { network, peer, direction, error } => {
            let overlay = match network {
                NetworkId::History => history,
                NetworkId::Beacon => beacon,
            };
            overlay.transfer_failed(peer, format!("{direction:?}: {error}")).await;
        }
    }
}

// ----------------------------------------------------------------------
// Identity persistence
// ----------------------------------------------------------------------

async fn rehydrate_or_generate_keypair(db: &dyn ContentDatabase) -> Result<Keypair> {
    if let Some(stored) = db.get(reserved::PRIVATE_KEY).await? {
        let hex_str = String::from_utf8(stored).context("privateKey entry is not utf-8")?;
        let secret = hex::decode(hex_str.trim()).context("privateKey entry is not hex")?;
        let keypair =
            Keypair::from_secret_bytes(&secret).map_err(|e| anyhow!("bad persisted key: {e}"))?;
        debug!("identity rehydrated from database");
        return Ok(keypair);
    }
    let keypair = Keypair::generate();
    db.put(reserved::PRIVATE_KEY, hex::encode(keypair.secret_bytes()).into_bytes()).await?;
    db.put(reserved::PUBLIC_KEY, hex::encode(keypair.public_bytes()).into_bytes()).await?;
    info!("generated fresh identity");
    Ok(keypair)
}

/// Reuse the persisted ENR when the address still matches; otherwise
/// bump the sequence and re-sign.
async fn rehydrate_enr(db: &dyn ContentDatabase, keypair: &Keypair, addr: &str) -> Result<Enr> {
    let previous = match db.get(reserved::ENR).await? {
        Some(stored) => String::from_utf8(stored)
            .ok()
            .and_then(|text| Enr::from_text(text.trim()).ok())
            .filter(|enr| enr.verify().is_ok() && enr.node_id() == keypair.node_id()),
        None => None,
    };
    let enr = match previous {
        Some(old) if old.addr == addr => old,
        Some(old) => keypair.make_enr(addr, old.seq + 1),
        None => keypair.make_enr(addr, 1),
    };
    db.put(reserved::ENR, enr.to_text().into_bytes()).await?;
    Ok(enr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDb;
    use async_trait::async_trait;

    /// Transport that goes nowhere; enough for identity tests.
    struct NullTransport;

    #[async_trait]
    impl TalkTransport for NullTransport {
        async fn talk_req(&self, _to: &Enr, _protocol: &[u8], _payload: Vec<u8>) -> Result<Vec<u8>> {
            Err(anyhow!("null transport"))
        }

        fn enr_of(&self, _node: &NodeId) -> Option<Enr> {
            None
        }
    }

    async fn build_node(db: Arc<dyn ContentDatabase>, addr: &str) -> PortalNode {
        let (_talk_tx, talk_rx) = mpsc::channel(8);
        PortalNode::builder()
            .transport(Arc::new(NullTransport), talk_rx)
            .database(db)
            .address(addr)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn identity_persists_across_restarts() {
        let db: Arc<dyn ContentDatabase> = MemoryDb::new();

        let first = build_node(db.clone(), "10.0.0.1:9009").await;
        let id = first.node_id();
        let seq = first.enr().seq;
        assert_eq!(seq, 1);
        first.shutdown().await;

        // Same database, same address: identical identity and sequence.
        let second = build_node(db.clone(), "10.0.0.1:9009").await;
        assert_eq!(second.node_id(), id);
        assert_eq!(second.enr().seq, 1);
        second.shutdown().await;

        // Address change bumps the sequence and re-signs.
        let third = build_node(db.clone(), "10.0.0.2:9009").await;
        assert_eq!(third.node_id(), id);
        assert_eq!(third.enr().seq, 2);
        third.enr().verify().unwrap();
        third.shutdown().await;
    }

    #[tokio::test]
    async fn reserved_keys_are_written() {
        let db: Arc<dyn ContentDatabase> = MemoryDb::new();
        let node = build_node(db.clone(), "10.0.0.3:9009").await;
        node.persist_peers().await;
        node.shutdown().await;

        for key in ["enr", "privateKey", "publicKey", "peers"] {
            assert!(db.get(key).await.unwrap().is_some(), "missing reserved key {key}");
        }
        // privateKey round-trips through hex.
        let stored = db.get("privateKey").await.unwrap().unwrap();
        let secret = hex::decode(String::from_utf8(stored).unwrap()).unwrap();
        assert_eq!(secret.len(), 32);
    }

    #[tokio::test]
    async fn persisted_peers_rehydrate() {
        let db: Arc<dyn ContentDatabase> = MemoryDb::new();
        let peer_enr = Keypair::generate().make_enr("10.0.0.9:9009", 1);
        let json = serde_json::to_vec(&vec![peer_enr.to_text()]).unwrap();
        db.put("peers", json).await.unwrap();

        let node = build_node(db, "10.0.0.4:9009").await;
        // Give the overlay actor a beat to process the admission.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(node.history().table_size().await, 1);
        node.shutdown().await;
    }
}
