//! Collaborator trait definitions for the Portal networking stack.
//!
//! This module defines the seams between the overlay core and the services
//! it consumes. Everything behind these traits is an external collaborator:
//! the discv5 session layer, the durable key-value store, the beacon
//! light-client verifier, and the clock.
//!
//! ## Traits
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | discv5 session layer | [`TalkTransport`] | Authenticated TALKREQ/TALKRESP datagrams |
//! | durable KV store | [`ContentDatabase`] | Hex-keyed content and identity persistence |
//! | beacon verifier | [`BeaconVerifier`] | Fork-digest / sync-committee validation |
//! | time source | [`Clock`] | Monotonic microseconds, injectable in tests |
//!
//! ## Design
//!
//! Traits are defined here separately from implementations to:
//! - Let the uTP layer and the overlay share one transport handle
//! - Keep the content store independent of any concrete database
//! - Allow tests to drive congestion control with a scripted clock
//!
//! Inbound TALKREQs do not go through a trait: the embedding application
//! hands the node an mpsc receiver of [`TalkRequest`] values, each carrying
//! a oneshot responder for the TALKRESP payload.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::identity::{Enr, NodeId};

/// Sub-protocol identifiers registered with the discv5 TALK dispatcher.
pub mod protocol_id {
    /// Portal history network (headers, bodies, receipts, epoch accumulators).
    pub const HISTORY: &[u8] = &[0x50, 0x0B];
    /// Portal state network (reserved; no overlay is spawned for it here).
    pub const STATE: &[u8] = &[0x50, 0x0A];
    /// Portal beacon light-client network.
    pub const BEACON: &[u8] = &[0x50, 0x1A];
    /// uTP transfer sub-protocol ("utp").
    pub const UTP: &[u8] = &[0x75, 0x74, 0x70];
}

/// The overlay network a message or transfer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkId {
    History,
    Beacon,
}

impl NetworkId {
    /// The discv5 protocol-id bytes for this network's overlay messages.
    pub const fn protocol(&self) -> &'static [u8] {
        match self {
            NetworkId::History => protocol_id::HISTORY,
            NetworkId::Beacon => protocol_id::BEACON,
        }
    }

    pub fn from_protocol(bytes: &[u8]) -> Option<Self> {
        match bytes {
            protocol_id::HISTORY => Some(NetworkId::History),
            protocol_id::BEACON => Some(NetworkId::Beacon),
            _ => None,
        }
    }
}

/// An inbound TALKREQ surfaced by the session layer.
///
/// The responder must be fired exactly once; dropping it makes the session
/// layer time the request out on the remote side.
#[derive(Debug)]
pub struct TalkRequest {
    /// Authenticated sender, established by the discv5 handshake.
    pub src: NodeId,
    /// Sub-protocol id the sender addressed.
    pub protocol: Vec<u8>,
    /// Raw request payload.
    pub payload: Vec<u8>,
    /// TALKRESP payload channel.
    pub responder: oneshot::Sender<Vec<u8>>,
}

/// Authenticated datagram service provided by the discv5 session layer.
///
/// Implementations own socket management, handshakes, and retransmission of
/// the discv5 envelope; this crate only sees whole payloads with a verified
/// remote identity.
#[async_trait]
pub trait TalkTransport: Send + Sync + 'static {
    /// Send a TALKREQ to `to` and await the TALKRESP payload.
    async fn talk_req(&self, to: &Enr, protocol: &[u8], payload: Vec<u8>) -> Result<Vec<u8>>;

    /// Look up the ENR for a node the session layer has seen, if any.
    ///
    /// Used to address uTP packets to peers discovered through an inbound
    /// request rather than a NODES response.
    fn enr_of(&self, node: &NodeId) -> Option<Enr>;
}

/// Durable key-value store. Keys are hex strings; values are opaque bytes.
///
/// The node reserves the keys `enr`, `privateKey`, `publicKey`, and `peers`
/// for identity rehydration; everything else is content keyed by hex
/// content-id.
#[async_trait]
pub trait ContentDatabase: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    /// Apply a batch of operations; used by eviction to delete in one pass.
    async fn batch(&self, ops: Vec<DbOp>) -> Result<()>;
    /// Total stored size in bytes.
    async fn size(&self) -> Result<u64>;
    /// All stored keys. Used to rebuild the in-memory distance index at open.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// A single operation in a [`ContentDatabase::batch`] call.
#[derive(Debug, Clone)]
pub enum DbOp {
    Put { key: String, value: Vec<u8> },
    Del { key: String },
}

/// Verifier for beacon light-client artifacts.
///
/// The sync algorithm itself lives outside this crate; the overlay only
/// needs a yes/no on whether an artifact is acceptable for storage and
/// gossip under the current fork digest and sync committee.
#[async_trait]
pub trait BeaconVerifier: Send + Sync + 'static {
    /// Validate a light-client artifact for the given content key bytes.
    /// Returns `Err` with a reason when the artifact must be rejected.
    async fn validate(&self, content_key: &[u8], content: &[u8]) -> Result<()>;
}

/// A beacon verifier that accepts everything. Suitable for tests and for
/// embeddings that run without a beacon light-client.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllBeaconVerifier;

#[async_trait]
impl BeaconVerifier for AcceptAllBeaconVerifier {
    async fn validate(&self, _content_key: &[u8], _content: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Monotonic time source in microseconds.
///
/// All congestion-control arithmetic takes timestamps produced here, so a
/// scripted clock drives the controller deterministically in tests.
pub trait Clock: Send + Sync + 'static {
    /// Microseconds since an arbitrary epoch. Wraps naturally in the u32
    /// timestamp fields on the wire.
    fn now_micros(&self) -> u64;

    /// The low 32 bits, as carried in uTP packet timestamp fields.
    fn wire_micros(&self) -> u32 {
        self.now_micros() as u32
    }
}

/// Default clock backed by [`std::time::Instant`].
#[derive(Debug)]
pub struct MonotonicClock {
    origin: std::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: std::time::Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}
