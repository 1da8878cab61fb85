//! # uTP multiplexer
//!
//! Demultiplexes every uTP packet arriving over the discv5 TALK channel to
//! the socket owning its `(peer, connection-id)` flow, and owns the table
//! of open content transfers.
//!
//! ## Architecture
//!
//! The module follows the actor pattern used across this crate:
//! [`UtpMultiplexer`] is a cheap-to-clone handle; `MuxActor` owns the
//! open-request table and processes commands sequentially, so registration,
//! dispatch, and eviction never race.
//!
//! ## Open-request table
//!
//! `open_requests: HashMap<(NodeId, u16), ContentRequest>` keyed by the
//! socket's receive connection-id. Registration spawns the socket task up
//! front, so an arriving SYN for a pre-registered transfer is ordinary
//! dispatch; packets for unknown keys are dropped silently, SYN included.
//!
//! ## Lifecycle
//!
//! A request leaves the table on exactly one of: clean FIN delivery, RESET,
//! or the watchdog sweep (default 180 s without socket progress). Every
//! terminal transition emits a [`TransferEvent`] and, for transfers with a
//! waiter, resolves its oneshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::identity::{Enr, NodeId};
use crate::packet::Packet;
use crate::protocols::{Clock, NetworkId, TalkTransport};
use crate::socket::{
    encode_frames, spawn_socket, ConnectionPair, SocketConfig, SocketHandle, SocketInput,
    SocketMode, SocketOutcome, UtpError,
};

/// Identifies one open uTP flow: (peer node-id, receive connection-id).
pub type SocketKey = (NodeId, u16);

/// Which overlay operation a transfer serves, and which way bytes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// We serve content for a FINDCONTENT we answered with a conn-id.
    FoundContentWrite,
    /// We fetch content after receiving CONTENT(conn-id).
    FindContentRead,
    /// We stream offered content after the peer's ACCEPT.
    OfferWrite,
    /// We receive content we accepted from an OFFER.
    AcceptRead,
}

/// Multiplexer tuning.
#[derive(Debug, Clone)]
pub struct UtpConfig {
    /// Requests whose socket shows no progress for this long are failed.
    pub watchdog: Duration,
    /// Sweep cadence for the watchdog.
    pub watchdog_interval: Duration,
    pub socket: SocketConfig,
}

impl Default for UtpConfig {
    fn default() -> Self {
        Self {
            watchdog: Duration::from_secs(180),
            watchdog_interval: Duration::from_secs(5),
            socket: SocketConfig::default(),
        }
    }
}

/// Terminal transfer notifications consumed by the node dispatcher.
#[derive(Debug)]
pub enum TransferEvent {
    /// An accepted OFFER finished streaming in; items pair up with
    /// `content_keys` in order.
    InboundContent {
        network: NetworkId,
        peer: NodeId,
        content_keys: Vec<Vec<u8>>,
        items: Vec<Vec<u8>>,
    },
    /// Any transfer ended in failure.
    Failed {
        network: NetworkId,
        peer: NodeId,
        direction: TransferDirection,
        error: UtpError,
    },
}

/// An open transfer tracked by the multiplexer.
struct ContentRequest {
    direction: TransferDirection,
    network: NetworkId,
    peer: NodeId,
    conn: ConnectionPair,
    content_keys: Vec<Vec<u8>>,
    handle: SocketHandle,
    /// Resolved for FINDCONTENT reads awaited by a lookup.
    waiter: Option<oneshot::Sender<Result<Vec<u8>, UtpError>>>,
}

enum MuxCommand {
    RegisterFoundContentWrite {
        network: NetworkId,
        peer: Enr,
        payload: Vec<u8>,
        reply: oneshot::Sender<u16>,
    },
    RegisterAcceptRead {
        network: NetworkId,
        peer: Enr,
        content_keys: Vec<Vec<u8>>,
        reply: oneshot::Sender<u16>,
    },
    InitiateFindContentRead {
        network: NetworkId,
        peer: Enr,
        conn_id: u16,
        content_key: Vec<u8>,
        reply: oneshot::Sender<oneshot::Receiver<Result<Vec<u8>, UtpError>>>,
    },
    InitiateOfferWrite {
        network: NetworkId,
        peer: Enr,
        conn_id: u16,
        content_keys: Vec<Vec<u8>>,
        items: Vec<Vec<u8>>,
    },
    HandlePacket {
        src: NodeId,
        raw: Vec<u8>,
    },
    OpenCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Public handle to the multiplexer actor.
#[derive(Clone)]
pub struct UtpMultiplexer {
    cmd_tx: mpsc::Sender<MuxCommand>,
}

impl UtpMultiplexer {
    /// Spawn the multiplexer. Terminal transfer events surface on the
    /// returned receiver.
    pub fn spawn(
        transport: Arc<dyn TalkTransport>,
        clock: Arc<dyn Clock>,
        config: UtpConfig,
    ) -> (Self, mpsc::Receiver<TransferEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (outcome_tx, outcome_rx) = mpsc::channel(256);
        let actor = MuxActor {
            transport,
            clock,
            config,
            open_requests: HashMap::new(),
            outcome_tx,
            event_tx,
        };
        tokio::spawn(actor.run(cmd_rx, outcome_rx));
        (Self { cmd_tx }, event_rx)
    }

    /// Allocate a connection-id and stand up a write socket serving
    /// `payload` for a FINDCONTENT we cannot answer inline. Returns the
    /// id to advertise in CONTENT.
    pub async fn register_found_content_write(
        &self,
        network: NetworkId,
        peer: Enr,
        payload: Vec<u8>,
    ) -> Option<u16> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MuxCommand::RegisterFoundContentWrite { network, peer, payload, reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Allocate a connection-id and stand up a read socket expecting the
    /// accepted keys. Returns the id to advertise in ACCEPT.
    pub async fn register_accept_read(
        &self,
        network: NetworkId,
        peer: Enr,
        content_keys: Vec<Vec<u8>>,
    ) -> Option<u16> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MuxCommand::RegisterAcceptRead { network, peer, content_keys, reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Act on CONTENT(conn-id): open a read socket toward the serving
    /// peer and await delivery of the single content item.
    pub async fn initiate_find_content_read(
        &self,
        network: NetworkId,
        peer: Enr,
        conn_id: u16,
        content_key: Vec<u8>,
    ) -> Result<Vec<u8>, UtpError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MuxCommand::InitiateFindContentRead { network, peer, conn_id, content_key, reply })
            .await
            .map_err(|_| UtpError::Closed)?;
        let waiter = rx.await.map_err(|_| UtpError::Closed)?;
        waiter.await.map_err(|_| UtpError::Closed)?
    }

    /// Act on ACCEPT: stream the accepted items, varint-framed, over a
    /// write socket we initiate.
    pub async fn initiate_offer_write(
        &self,
        network: NetworkId,
        peer: Enr,
        conn_id: u16,
        content_keys: Vec<Vec<u8>>,
        items: Vec<Vec<u8>>,
    ) {
        let _ = self
            .cmd_tx
            .send(MuxCommand::InitiateOfferWrite { network, peer, conn_id, content_keys, items })
            .await;
    }

    /// Dispatch one raw uTP packet from the TALK channel.
    pub async fn handle_packet(&self, src: NodeId, raw: Vec<u8>) {
        let _ = self.cmd_tx.send(MuxCommand::HandlePacket { src, raw }).await;
    }

    /// Number of open transfers; used by tests and diagnostics.
    pub async fn open_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(MuxCommand::OpenCount { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(MuxCommand::Shutdown).await;
    }
}

struct MuxActor {
    transport: Arc<dyn TalkTransport>,
    clock: Arc<dyn Clock>,
    config: UtpConfig,
    open_requests: HashMap<SocketKey, ContentRequest>,
    outcome_tx: mpsc::Sender<SocketOutcome>,
    event_tx: mpsc::Sender<TransferEvent>,
}

impl MuxActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<MuxCommand>,
        mut outcome_rx: mpsc::Receiver<SocketOutcome>,
    ) {
        let mut watchdog = tokio::time::interval(self.config.watchdog_interval);
        watchdog.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(MuxCommand::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                outcome = outcome_rx.recv() => {
                    if let Some(outcome) = outcome {
                        self.on_outcome(outcome).await;
                    }
                }
                _ = watchdog.tick() => self.sweep_watchdog(),
            }
        }

        for (_, request) in self.open_requests.drain() {
            let _ = request.handle.input.send(SocketInput::Abort(UtpError::Closed));
        }
    }

    fn on_command(&mut self, cmd: MuxCommand) {
        match cmd {
            MuxCommand::RegisterFoundContentWrite { network, peer, payload, reply } => {
                let conn_id = self.register(
                    network,
                    peer,
                    TransferDirection::FoundContentWrite,
                    Vec::new(),
                    SocketModeSpec::AcceptWrite(payload),
                    None,
                );
                let _ = reply.send(conn_id);
            }
            MuxCommand::RegisterAcceptRead { network, peer, content_keys, reply } => {
                let conn_id = self.register(
                    network,
                    peer,
                    TransferDirection::AcceptRead,
                    content_keys,
                    SocketModeSpec::AcceptRead,
                    None,
                );
                let _ = reply.send(conn_id);
            }
            MuxCommand::InitiateFindContentRead { network, peer, conn_id, content_key, reply } => {
                let (waiter_tx, waiter_rx) = oneshot::channel();
                self.open(
                    network,
                    peer,
                    ConnectionPair::initiator(conn_id),
                    TransferDirection::FindContentRead,
                    vec![content_key],
                    SocketModeSpec::InitiateRead,
                    Some(waiter_tx),
                );
                let _ = reply.send(waiter_rx);
            }
            MuxCommand::InitiateOfferWrite { network, peer, conn_id, content_keys, items } => {
                let payload = encode_frames(&items);
                self.open(
                    network,
                    peer,
                    ConnectionPair::initiator(conn_id),
                    TransferDirection::OfferWrite,
                    content_keys,
                    SocketModeSpec::InitiateWrite(payload),
                    None,
                );
            }
            MuxCommand::HandlePacket { src, raw } => self.dispatch_packet(src, &raw),
            MuxCommand::OpenCount { reply } => {
                let _ = reply.send(self.open_requests.len());
            }
            MuxCommand::Shutdown => unreachable!("handled in run loop"),
        }
    }

    /// Pick an unused connection-id for `peer` and open an advertiser-side
    /// request with it.
    fn register(
        &mut self,
        network: NetworkId,
        peer: Enr,
        direction: TransferDirection,
        content_keys: Vec<Vec<u8>>,
        mode: SocketModeSpec,
        waiter: Option<oneshot::Sender<Result<Vec<u8>, UtpError>>>,
    ) -> u16 {
        let peer_id = peer.node_id();
        let conn_id = loop {
            let candidate: u16 = rand::random();
            if !self.open_requests.contains_key(&(peer_id, candidate))
                && !self.open_requests.contains_key(&(peer_id, candidate.wrapping_add(1)))
            {
                break candidate;
            }
        };
        self.open(network, peer, ConnectionPair::advertiser(conn_id), direction, content_keys, mode, waiter);
        conn_id
    }

    fn open(
        &mut self,
        network: NetworkId,
        peer: Enr,
        conn: ConnectionPair,
        direction: TransferDirection,
        content_keys: Vec<Vec<u8>>,
        mode: SocketModeSpec,
        waiter: Option<oneshot::Sender<Result<Vec<u8>, UtpError>>>,
    ) {
        let peer_id = peer.node_id();
        let key = (peer_id, conn.recv);
        if self.open_requests.contains_key(&key) {
            warn!(conn = conn.recv, "connection-id collision; dropping transfer");
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(UtpError::Closed));
            }
            return;
        }
        let framed = matches!(direction, TransferDirection::AcceptRead);
        let handle = spawn_socket(
            peer,
            conn,
            mode.into_socket_mode(),
            framed,
            self.transport.clone(),
            self.clock.clone(),
            self.config.socket.clone(),
            self.outcome_tx.clone(),
        );
        trace!(
            peer = %hex::encode(&peer_id[..4]),
            conn = conn.recv,
            ?direction,
            "transfer opened"
        );
        self.open_requests.insert(
            key,
            ContentRequest { direction, network, peer: peer_id, conn, content_keys, handle, waiter },
        );
    }

    fn dispatch_packet(&mut self, src: NodeId, raw: &[u8]) {
        let packet = match Packet::decode(raw) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(peer = %hex::encode(&src[..4]), error = %err, "malformed utp packet");
                return;
            }
        };
        match self.open_requests.get(&(src, packet.conn_id)) {
            Some(request) => {
                let _ = request.handle.input.send(SocketInput::Packet(packet));
            }
            None => {
                // Unknown flow. A SYN would normally open a connection, but
                // inbound transfers only exist when the overlay registered
                // the id beforehand, so everything else is dropped.
                trace!(
                    peer = %hex::encode(&src[..4]),
                    conn = packet.conn_id,
                    kind = %packet.packet_type,
                    "packet for unknown socket"
                );
            }
        }
    }

    async fn on_outcome(&mut self, outcome: SocketOutcome) {
        let key = (outcome.peer, outcome.recv_id);
        let request = match self.open_requests.remove(&key) {
            Some(request) => request,
            None => return,
        };
        debug!(
            peer = %hex::encode(&request.peer[..4]),
            conn = request.conn.recv,
            direction = ?request.direction,
            ok = outcome.result.is_ok(),
            "transfer closed"
        );
        match outcome.result {
            Ok(items) => {
                if let Some(waiter) = request.waiter {
                    let blob = items.into_iter().next().unwrap_or_default();
                    let _ = waiter.send(Ok(blob));
                } else if request.direction == TransferDirection::AcceptRead {
                    let event = TransferEvent::InboundContent {
                        network: request.network,
                        peer: request.peer,
                        content_keys: request.content_keys,
                        items,
                    };
                    let _ = self.event_tx.send(event).await;
                }
            }
            Err(error) => {
                if let Some(waiter) = request.waiter {
                    let _ = waiter.send(Err(error.clone()));
                }
                let event = TransferEvent::Failed {
                    network: request.network,
                    peer: request.peer,
                    direction: request.direction,
                    error,
                };
                let _ = self.event_tx.send(event).await;
            }
        }
    }

    fn sweep_watchdog(&mut self) {
        let now = self.clock.now_micros();
        let budget = self.config.watchdog.as_micros() as u64;
        for (key, request) in &self.open_requests {
            let last = request.handle.last_progress.load(std::sync::atomic::Ordering::Relaxed);
            if now.saturating_sub(last) > budget {
                warn!(
                    peer = %hex::encode(&key.0[..4]),
                    conn = key.1,
                    direction = ?request.direction,
                    "watchdog closing stalled transfer"
                );
                let _ = request.handle.input.send(SocketInput::Abort(UtpError::SocketTimeout));
            }
        }
        // Eviction happens when the aborted socket reports its outcome.
    }
}

/// Internal selector for which socket mode to spawn, keeping payload
/// moves out of the command match.
enum SocketModeSpec {
    InitiateRead,
    InitiateWrite(Vec<u8>),
    AcceptRead,
    AcceptWrite(Vec<u8>),
}

impl SocketModeSpec {
    fn into_socket_mode(self) -> SocketMode {
        match self {
            SocketModeSpec::InitiateRead => SocketMode::InitiateRead,
            SocketModeSpec::InitiateWrite(p) => SocketMode::InitiateWrite(p),
            SocketModeSpec::AcceptRead => SocketMode::AcceptRead,
            SocketModeSpec::AcceptWrite(p) => SocketMode::AcceptWrite(p),
        }
    }
}
