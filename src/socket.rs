//! # uTP connection state machine
//!
//! One [`UtpSocket`] per content transfer, running as its own task so every
//! state transition for a connection is serialized on one executor. The
//! multiplexer feeds it decoded packets; it emits outbound packets through
//! the shared [`TalkTransport`] and reports a single terminal outcome.
//!
//! ## Roles
//!
//! A socket is either a **read** socket (content sink) or a **write**
//! socket (content source), and either side may be the one sending the
//! SYN. The four combinations map onto the four transfer directions:
//!
//! | Direction | Role | SYN sender |
//! |-----------|------|------------|
//! | FOUNDCONTENT | write | peer |
//! | FINDCONTENT | read | us |
//! | OFFER | write | us |
//! | ACCEPT | read | peer |
//!
//! ## State machine
//!
//! `SynSent → Connected → Closed`, with `SynRecv` on the accepting side,
//! `GotFin` when a FIN arrives over a sequence gap, and `Reset` on a peer
//! RESET, a reassembly-buffer overflow, or three consecutive RTO expiries.
//! Every terminal transition fires the outcome channel exactly once and
//! cancels the socket's timers by ending its task.
//!
//! ## Reassembly
//!
//! In-order DATA is appended to the delivery buffer; out-of-order DATA
//! parks in a bounded buffer and is acknowledged through the selective-ACK
//! bitmap without advancing `ack_nr`. Delivery is atomic: content surfaces
//! only on a clean FIN covering every sequence number. Batched transfers
//! (OFFER/ACCEPT) are framed as repeated `(uvarint length, bytes)` and the
//! frame decoder runs incrementally over the contiguous prefix.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::congestion::{CongestionController, TimeoutAction, MSS};
use crate::identity::{Enr, NodeId};
use crate::packet::{Packet, PacketType, SelectiveAck};
use crate::protocols::{protocol_id, Clock, TalkTransport};

/// Largest single frame accepted during batched reassembly.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Sequence-space half used to distinguish "ahead" from "behind".
const SEQ_AHEAD_WINDOW: u16 = 32_768;

/// Terminal failures for a uTP transfer.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum UtpError {
    #[error("socket timed out")]
    SocketTimeout,
    #[error("connection reset")]
    Reset,
    #[error("reassembly failed: {0}")]
    Reassembly(String),
    #[error("socket closed before completion")]
    Closed,
}

/// The send/recv connection-id pair for one flow.
///
/// The node that advertises a connection-id `c` (in a CONTENT or ACCEPT
/// response) registers `{recv: c, send: c + 1}`; the node acting on the
/// advertisement derives `{recv: c + 1, send: c}`. Every packet carries
/// the sender's send-id, so incoming packets always match the receiver's
/// recv-id and one advertised value names the whole bidirectional flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionPair {
    pub recv: u16,
    pub send: u16,
}

impl ConnectionPair {
    /// Pair for the node that advertised connection-id `c`.
    pub fn advertiser(c: u16) -> Self {
        Self { recv: c, send: c.wrapping_add(1) }
    }

    /// Pair for the node acting on an advertised connection-id `c`.
    pub fn initiator(c: u16) -> Self {
        Self { recv: c.wrapping_add(1), send: c }
    }
}

/// How a socket starts and which way content flows.
pub enum SocketMode {
    /// We send the SYN and read (FINDCONTENT redirect).
    InitiateRead,
    /// We send the SYN and write the given payload (OFFER after ACCEPT).
    InitiateWrite(Vec<u8>),
    /// Peer will SYN; we read (accepted OFFER).
    AcceptRead,
    /// Peer will SYN; we write the given payload (FOUNDCONTENT).
    AcceptWrite(Vec<u8>),
}

/// Socket tuning shared by the multiplexer.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Hard cap on out-of-order buffered packets before RESET.
    pub max_buffered_packets: usize,
    /// Receive window advertised in outgoing packets.
    pub recv_window: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self { max_buffered_packets: 1024, recv_window: 1024 * 1024 }
    }
}

/// Input fed to a socket task by the multiplexer.
#[derive(Debug)]
pub enum SocketInput {
    Packet(Packet),
    /// Force-terminate with the given failure (watchdog, shutdown).
    Abort(UtpError),
}

/// Terminal report sent to the multiplexer.
#[derive(Debug)]
pub struct SocketOutcome {
    pub peer: NodeId,
    pub recv_id: u16,
    /// Read sockets deliver the reassembled item(s); write sockets an
    /// empty list.
    pub result: Result<Vec<Vec<u8>>, UtpError>,
}

/// Handle kept by the multiplexer for an active socket.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    /// Unbounded: the multiplexer never drops packets; bursts land in the
    /// socket's bounded out-of-order buffer instead.
    pub input: mpsc::UnboundedSender<SocketInput>,
    /// Microsecond timestamp of the socket's last observable progress,
    /// read by the watchdog sweep.
    pub last_progress: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketState {
    SynSent,
    SynRecv,
    Connected,
    GotFin,
    Closed,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Read,
    Write,
}

struct OutPacket {
    packet_type: PacketType,
    payload: Vec<u8>,
    tx_micros: u64,
    transmissions: u32,
    /// Whether this packet's bytes are charged against `cur_window`.
    /// Cleared for everything in flight when an RTO fires.
    counted: bool,
}

/// Spawn a socket task. Returns the handle the multiplexer keeps.
pub(crate) fn spawn_socket(
    peer: Enr,
    conn: ConnectionPair,
    mode: SocketMode,
    framed: bool,
    transport: Arc<dyn TalkTransport>,
    clock: Arc<dyn Clock>,
    config: SocketConfig,
    outcome_tx: mpsc::Sender<SocketOutcome>,
) -> SocketHandle {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let last_progress = Arc::new(AtomicU64::new(clock.now_micros()));
    let socket = UtpSocket::new(peer, conn, mode, framed, transport, clock, config, last_progress.clone());
    tokio::spawn(socket.run(input_rx, outcome_tx));
    SocketHandle { input: input_tx, last_progress }
}

struct UtpSocket {
    peer: Enr,
    peer_id: NodeId,
    conn: ConnectionPair,
    role: Role,
    we_initiate: bool,
    framed: bool,
    state: SocketState,
    config: SocketConfig,
    transport: Arc<dyn TalkTransport>,
    clock: Arc<dyn Clock>,
    ctrl: CongestionController,
    last_progress: Arc<AtomicU64>,

    /// Next sequence number this side will consume (SYN/DATA/FIN).
    seq_nr: u16,
    /// Highest contiguous peer sequence number processed.
    ack_nr: u16,
    /// Sequence number the handshake SYN carried, for duplicate detection.
    syn_seq: Option<u16>,
    /// Initial write sequence, re-advertised on duplicate SYN.
    seq_base: u16,

    // Write side.
    payload: Vec<u8>,
    pending: VecDeque<(u16, Vec<u8>)>,
    inflight: BTreeMap<u16, OutPacket>,
    fin_seq: Option<u16>,

    // Read side.
    recv_buf: BTreeMap<u16, Vec<u8>>,
    assembled: Vec<u8>,
    peer_fin: Option<u16>,
    /// ts_micros of the most recent packet from the peer, echoed back as
    /// our timestamp-difference.
    peer_ts_micros: u32,
    peer_ts_seen_at: u64,
}

impl UtpSocket {
    #[allow(clippy::too_many_arguments)]
    fn new(
        peer: Enr,
        conn: ConnectionPair,
        mode: SocketMode,
        framed: bool,
        transport: Arc<dyn TalkTransport>,
        clock: Arc<dyn Clock>,
        config: SocketConfig,
        last_progress: Arc<AtomicU64>,
    ) -> Self {
        let (role, we_initiate, payload) = match mode {
            SocketMode::InitiateRead => (Role::Read, true, Vec::new()),
            SocketMode::InitiateWrite(p) => (Role::Write, true, p),
            SocketMode::AcceptRead => (Role::Read, false, Vec::new()),
            SocketMode::AcceptWrite(p) => (Role::Write, false, p),
        };
        let peer_id = peer.node_id();
        Self {
            peer,
            peer_id,
            conn,
            role,
            we_initiate,
            framed,
            state: if we_initiate { SocketState::SynSent } else { SocketState::SynRecv },
            config,
            transport,
            clock,
            ctrl: CongestionController::new(),
            last_progress,
            seq_nr: 1,
            ack_nr: 0,
            syn_seq: None,
            seq_base: 0,
            payload,
            pending: VecDeque::new(),
            inflight: BTreeMap::new(),
            fin_seq: None,
            recv_buf: BTreeMap::new(),
            assembled: Vec::new(),
            peer_fin: None,
            peer_ts_micros: 0,
            peer_ts_seen_at: 0,
        }
    }

    async fn run(
        mut self,
        mut input_rx: mpsc::UnboundedReceiver<SocketInput>,
        outcome_tx: mpsc::Sender<SocketOutcome>,
    ) {
        if self.we_initiate {
            // The SYN consumes sequence number 1 and stays retransmittable
            // until the handshake completes.
            let seq = self.seq_nr;
            self.seq_nr = self.seq_nr.wrapping_add(1);
            self.transmit(PacketType::Syn, seq, Vec::new(), true);
        }

        let result = loop {
            if let Some(result) = self.terminal_result() {
                break result;
            }
            let deadline = self.rto_deadline();
            tokio::select! {
                input = input_rx.recv() => match input {
                    Some(SocketInput::Packet(packet)) => self.on_packet(packet),
                    Some(SocketInput::Abort(err)) => {
                        self.send_reset();
                        self.state = SocketState::Reset;
                        break Err(err);
                    }
                    None => {
                        self.state = SocketState::Reset;
                        break Err(UtpError::Closed);
                    }
                },
                _ = Self::sleep_until(deadline, self.clock.as_ref()) => self.on_rto_expired(),
            }
        };

        let outcome = SocketOutcome { peer: self.peer_id, recv_id: self.conn.recv, result };
        if outcome_tx.send(outcome).await.is_err() {
            debug!(peer = %short(&self.peer_id), "multiplexer gone before socket outcome");
        }
    }

    async fn sleep_until(deadline: Option<u64>, clock: &dyn Clock) {
        match deadline {
            Some(at) => {
                let now = clock.now_micros();
                let wait = at.saturating_sub(now);
                tokio::time::sleep(Duration::from_micros(wait)).await;
            }
            // No retransmittable state: idle until input or watchdog.
            None => tokio::time::sleep(Duration::from_secs(3600)).await,
        }
    }

    fn terminal_result(&mut self) -> Option<Result<Vec<Vec<u8>>, UtpError>> {
        match self.state {
            SocketState::Closed => Some(match self.role {
                Role::Read => self.take_delivery(),
                Role::Write => Ok(Vec::new()),
            }),
            SocketState::Reset => Some(Err(UtpError::Reset)),
            _ => None,
        }
    }

    fn take_delivery(&mut self) -> Result<Vec<Vec<u8>>, UtpError> {
        let bytes = std::mem::take(&mut self.assembled);
        if self.framed {
            decode_frames(&bytes)
        } else {
            Ok(vec![bytes])
        }
    }

    fn rto_deadline(&self) -> Option<u64> {
        self.inflight
            .values()
            .map(|p| p.tx_micros)
            .min()
            .map(|earliest| earliest + self.ctrl.rto_micros())
    }

    fn touch(&mut self) {
        self.last_progress.store(self.clock.now_micros(), Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Packet handling
    // ------------------------------------------------------------------

    fn on_packet(&mut self, packet: Packet) {
        trace!(
            peer = %short(&self.peer_id),
            conn = self.conn.recv,
            kind = %packet.packet_type,
            seq = packet.seq_nr,
            ack = packet.ack_nr,
            "utp packet"
        );
        self.touch();
        self.peer_ts_micros = packet.ts_micros;
        self.peer_ts_seen_at = self.clock.now_micros();

        match packet.packet_type {
            PacketType::Reset => {
                debug!(peer = %short(&self.peer_id), conn = self.conn.recv, "peer reset");
                self.state = SocketState::Reset;
            }
            PacketType::Syn => self.on_syn(packet),
            PacketType::State => self.on_state(packet),
            PacketType::Data => self.on_data(packet),
            PacketType::Fin => self.on_fin(packet),
        }
    }

    fn on_syn(&mut self, packet: Packet) {
        if self.we_initiate {
            // Both sides initiating the same pair is an impossible overlay
            // state; refuse the connection.
            warn!(peer = %short(&self.peer_id), conn = self.conn.recv, "unexpected SYN from peer");
            self.send_reset();
            self.state = SocketState::Reset;
            return;
        }
        if let Some(seen) = self.syn_seq {
            // Duplicate SYN: the handshake STATE was lost. Re-advertise the
            // original sequence base so seeding stays consistent.
            if seen == packet.seq_nr {
                self.send_state_with_seq(self.seq_base);
            }
            return;
        }
        self.syn_seq = Some(packet.seq_nr);
        self.ack_nr = packet.seq_nr;
        match self.role {
            Role::Read => {
                // Reader's own sequence numbers are only cosmetic (it never
                // sends DATA), but stay random like a writer's.
                self.seq_base = random_seq();
                self.seq_nr = self.seq_base;
                self.send_state_with_seq(self.seq_base);
                self.state = SocketState::Connected;
            }
            Role::Write => {
                self.seq_base = random_seq();
                self.seq_nr = self.seq_base;
                self.send_state_with_seq(self.seq_base);
                self.state = SocketState::Connected;
                self.queue_chunks();
                self.drain_writes();
            }
        }
    }

    fn on_state(&mut self, packet: Packet) {
        match self.state {
            SocketState::SynSent => {
                let syn_acked = self
                    .inflight
                    .keys()
                    .next()
                    .map(|syn_seq| *syn_seq == packet.ack_nr)
                    .unwrap_or(false);
                if !syn_acked {
                    return;
                }
                self.inflight.clear();
                // The peer's STATE carries its next sequence number; seed
                // the contiguous counter one below it.
                self.ack_nr = packet.seq_nr.wrapping_sub(1);
                self.state = SocketState::Connected;
                match self.role {
                    Role::Read => {
                        // Early DATA may already be parked; drain anything
                        // now contiguous.
                        self.drain_recv_buf();
                        self.maybe_finish_read();
                    }
                    Role::Write => {
                        self.queue_chunks();
                        self.drain_writes();
                    }
                }
            }
            SocketState::Connected => {
                if self.role == Role::Write {
                    self.process_acks(&packet);
                }
            }
            _ => {}
        }
    }

    fn process_acks(&mut self, packet: &Packet) {
        let now = self.clock.now_micros();
        let mut counted_bytes = 0usize;
        let mut acked_bytes = 0usize;
        let mut rtt_sample = None;

        let cumulative: Vec<u16> = self
            .inflight
            .keys()
            .copied()
            .filter(|seq| seq_le(*seq, packet.ack_nr))
            .collect();
        let mut selective: Vec<u16> = Vec::new();
        if let Some(sack) = &packet.selective_ack {
            for seq in sack.acked_seqs(packet.ack_nr) {
                if self.inflight.contains_key(&seq) {
                    selective.push(seq);
                }
            }
        }

        for seq in cumulative.into_iter().chain(selective) {
            if let Some(out) = self.inflight.remove(&seq) {
                acked_bytes += out.payload.len();
                if out.counted {
                    counted_bytes += out.payload.len();
                }
                if out.transmissions == 1 && rtt_sample.is_none() {
                    rtt_sample = Some(now.saturating_sub(out.tx_micros));
                }
            }
        }

        self.ctrl.on_ack(
            now,
            counted_bytes,
            acked_bytes,
            packet.ts_diff_micros,
            rtt_sample,
            packet.wnd_size,
        );
        // The controller freeing window is the write signal.
        self.drain_writes();
    }

    fn on_data(&mut self, packet: Packet) {
        if self.role != Role::Read {
            return;
        }
        match self.state {
            SocketState::SynSent => {
                // Handshake STATE not yet seen; park the chunk until the
                // sequence base is known.
                if self.recv_buf.len() >= self.config.max_buffered_packets {
                    self.overflow_reset();
                    return;
                }
                self.recv_buf.insert(packet.seq_nr, packet.payload);
            }
            SocketState::Connected | SocketState::GotFin => {
                self.accept_data(packet.seq_nr, packet.payload);
                self.maybe_finish_read();
                if self.state != SocketState::Reset && self.state != SocketState::Closed {
                    self.send_ack();
                }
            }
            _ => {}
        }
    }

    fn accept_data(&mut self, seq: u16, payload: Vec<u8>) {
        let offset = seq.wrapping_sub(self.ack_nr);
        if offset == 1 {
            self.assembled.extend_from_slice(&payload);
            self.ack_nr = seq;
            self.drain_recv_buf();
        } else if offset > 1 && offset < SEQ_AHEAD_WINDOW {
            if self.recv_buf.len() >= self.config.max_buffered_packets {
                self.overflow_reset();
                return;
            }
            self.recv_buf.entry(seq).or_insert(payload);
        }
        // offset == 0 or behind: duplicate, drop silently.
    }

    fn drain_recv_buf(&mut self) {
        while let Some(payload) = self.recv_buf.remove(&self.ack_nr.wrapping_add(1)) {
            self.ack_nr = self.ack_nr.wrapping_add(1);
            self.assembled.extend_from_slice(&payload);
        }
    }

    fn on_fin(&mut self, packet: Packet) {
        if self.role != Role::Read {
            // A writer receiving FIN is a peer abandoning the read; treat
            // as reset.
            self.state = SocketState::Reset;
            return;
        }
        match self.state {
            SocketState::Connected | SocketState::GotFin => {
                self.peer_fin = Some(packet.seq_nr);
                if !self.maybe_finish_read() {
                    self.state = SocketState::GotFin;
                    self.send_ack();
                }
            }
            _ => {}
        }
    }

    /// Close out the read once every sequence number up to the FIN has
    /// been delivered. Returns true when the socket reached `Closed`.
    fn maybe_finish_read(&mut self) -> bool {
        let fin = match self.peer_fin {
            Some(f) => f,
            None => return false,
        };
        if self.ack_nr.wrapping_add(1) != fin {
            return false;
        }
        self.ack_nr = fin;
        self.send_ack();
        self.state = SocketState::Closed;
        self.touch();
        true
    }

    fn overflow_reset(&mut self) {
        warn!(
            peer = %short(&self.peer_id),
            conn = self.conn.recv,
            buffered = self.recv_buf.len(),
            "reassembly buffer overflow"
        );
        self.send_reset();
        self.state = SocketState::Reset;
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    fn queue_chunks(&mut self) {
        let payload = std::mem::take(&mut self.payload);
        for chunk in payload.chunks(MSS) {
            let seq = self.seq_nr;
            self.seq_nr = self.seq_nr.wrapping_add(1);
            self.pending.push_back((seq, chunk.to_vec()));
        }
        debug!(
            peer = %short(&self.peer_id),
            conn = self.conn.recv,
            chunks = self.pending.len(),
            "write queued"
        );
    }

    fn drain_writes(&mut self) {
        if self.role != Role::Write || self.state != SocketState::Connected {
            return;
        }
        while self.ctrl.window_available() {
            match self.pending.pop_front() {
                Some((seq, chunk)) => {
                    self.ctrl.on_send(chunk.len());
                    self.transmit(PacketType::Data, seq, chunk, true);
                }
                None => break,
            }
        }
        if self.pending.is_empty() && self.fin_seq.is_none() && self.all_data_acked() {
            // FIN takes the sequence number immediately after the last DATA.
            let seq = self.seq_nr;
            self.seq_nr = self.seq_nr.wrapping_add(1);
            self.fin_seq = Some(seq);
            self.transmit(PacketType::Fin, seq, Vec::new(), true);
        }
        if self.fin_acked() {
            self.state = SocketState::Closed;
            self.touch();
        }
    }

    fn all_data_acked(&self) -> bool {
        self.inflight.is_empty()
    }

    fn fin_acked(&self) -> bool {
        self.fin_seq.is_some() && self.inflight.is_empty() && self.pending.is_empty()
    }

    fn on_rto_expired(&mut self) {
        if self.inflight.is_empty() {
            return;
        }
        match self.ctrl.on_timeout() {
            TimeoutAction::Reset => {
                debug!(peer = %short(&self.peer_id), conn = self.conn.recv, "retries exhausted");
                self.send_reset();
                self.state = SocketState::Reset;
            }
            TimeoutAction::Retransmit => {
                // cur_window was zeroed: drop the charge on everything in
                // flight, then resend the earliest packet. Earliest means
                // oldest transmit time, which stays correct across
                // sequence-number wrap.
                for out in self.inflight.values_mut() {
                    out.counted = false;
                }
                let earliest = self
                    .inflight
                    .iter()
                    .min_by_key(|(_, out)| out.tx_micros)
                    .map(|(&seq, _)| seq);
                if let Some(seq) = earliest {
                    self.retransmit(seq);
                }
            }
        }
    }

    fn retransmit(&mut self, seq: u16) {
        let now = self.clock.now_micros();
        let (packet_type, payload) = match self.inflight.get_mut(&seq) {
            Some(out) => {
                out.tx_micros = now;
                out.transmissions += 1;
                out.counted = true;
                (out.packet_type, out.payload.clone())
            }
            None => return,
        };
        self.ctrl.on_send(payload.len());
        trace!(conn = self.conn.recv, seq, "retransmit");
        self.send_on_wire(packet_type, seq, payload, None);
    }

    // ------------------------------------------------------------------
    // Outbound packets
    // ------------------------------------------------------------------

    fn transmit(&mut self, packet_type: PacketType, seq: u16, payload: Vec<u8>, track: bool) {
        let now = self.clock.now_micros();
        if track {
            self.inflight.insert(
                seq,
                OutPacket {
                    packet_type,
                    payload: payload.clone(),
                    tx_micros: now,
                    transmissions: 1,
                    counted: true,
                },
            );
        }
        self.send_on_wire(packet_type, seq, payload, None);
    }

    /// STATE carrying an explicit sequence value (handshake replies).
    fn send_state_with_seq(&mut self, seq: u16) {
        self.send_on_wire(PacketType::State, seq, Vec::new(), None);
    }

    fn send_ack(&mut self) {
        let sack = if self.recv_buf.is_empty() {
            None
        } else {
            Some(SelectiveAck::from_buffered(self.ack_nr, self.recv_buf.keys().copied()))
        };
        self.send_on_wire(PacketType::State, self.seq_nr, Vec::new(), sack);
    }

    fn send_reset(&mut self) {
        self.send_on_wire(PacketType::Reset, self.seq_nr, Vec::new(), None);
    }

    fn send_on_wire(
        &mut self,
        packet_type: PacketType,
        seq: u16,
        payload: Vec<u8>,
        sack: Option<SelectiveAck>,
    ) {
        let now = self.clock.now_micros();
        let ts_micros = now as u32;
        // One-way delay estimate: our clock now vs the peer's transmit
        // stamp, adjusted for how long ago we saw it.
        let ts_diff = if self.peer_ts_seen_at == 0 {
            0
        } else {
            (self.peer_ts_seen_at as u32).wrapping_sub(self.peer_ts_micros)
        };
        let packet = Packet {
            packet_type,
            conn_id: self.conn.send,
            ts_micros,
            ts_diff_micros: ts_diff,
            wnd_size: self.config.recv_window,
            seq_nr: seq,
            ack_nr: self.ack_nr,
            selective_ack: sack,
            payload,
        };
        let raw = packet.encode();
        let transport = self.transport.clone();
        let peer = self.peer.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.talk_req(&peer, protocol_id::UTP, raw).await {
                trace!(error = %err, "utp packet send failed");
            }
        });
    }
}

fn random_seq() -> u16 {
    let v: u16 = rand::random();
    v.max(1)
}

/// `a <= b` in wrapping sequence space.
fn seq_le(a: u16, b: u16) -> bool {
    b.wrapping_sub(a) < SEQ_AHEAD_WINDOW
}

fn short(id: &NodeId) -> String {
    hex::encode(&id[..4])
}

// ----------------------------------------------------------------------
// Varint content framing (OFFER/ACCEPT batches)
// ----------------------------------------------------------------------

/// Prefix each item with its uvarint (LEB128) length and concatenate.
pub fn encode_frames(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(items.iter().map(|i| i.len() + 5).sum());
    for item in items {
        let mut len = item.len() as u64;
        loop {
            let byte = (len & 0x7F) as u8;
            len >>= 7;
            if len == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
        out.extend_from_slice(item);
    }
    out
}

/// Decode a complete varint-framed stream. Trailing or oversized frames
/// fail reassembly.
pub fn decode_frames(bytes: &[u8]) -> Result<Vec<Vec<u8>>, UtpError> {
    let mut frames = Vec::new();
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        let (len, consumed) = decode_uvarint(&bytes[cursor..])
            .ok_or_else(|| UtpError::Reassembly("truncated length prefix".into()))?;
        cursor += consumed;
        if len as usize > MAX_FRAME_SIZE {
            return Err(UtpError::Reassembly(format!("frame of {len} bytes exceeds cap")));
        }
        let end = cursor
            .checked_add(len as usize)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| UtpError::Reassembly("frame overruns delivery".into()))?;
        frames.push(bytes[cursor..end].to_vec());
        cursor = end;
    }
    Ok(frames)
}

fn decode_uvarint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in bytes.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}
