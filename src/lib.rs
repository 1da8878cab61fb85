//! # Portalnet - Portal Network Core
//!
//! Portalnet implements the core of a Portal Network client: a
//! peer-to-peer overlay serving historical Ethereum execution data and
//! beacon light-client artifacts over an XOR-metric DHT, with a uTP
//! reliable transport riding inside discv5 TALKREQ/TALKRESP datagrams.
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for safe concurrent state:
//! - Each stateful component (overlay network, uTP multiplexer, uTP
//!   socket) has a public Handle and a private Actor
//! - Handles are cheap to clone and communicate via async channels
//! - Actors own all mutable state and process commands sequentially, so
//!   per-socket and per-table transitions are serialized by construction
//!
//! External collaborators stay behind traits: the discv5 session layer is
//! an authenticated datagram service, the database a hex-keyed KV store,
//! the beacon verifier and the clock injectable. No global state anywhere;
//! every component receives its context at construction.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API combining all components |
//! | `identity` | Keypairs, NodeIds, signed ENRs, XOR distance |
//! | `packet` | uTP packet codec with selective-ACK extension |
//! | `congestion` | LEDBAT-style delay-based congestion control |
//! | `socket` | Per-connection uTP state machine |
//! | `utp` | uTP multiplexer and open-transfer table |
//! | `messages` | Portal overlay wire messages (selector + SSZ) |
//! | `routing` | 256-bucket XOR routing table, radius and offer tracking |
//! | `content` | Typed content keys and SHA-256 content-ids |
//! | `lookup` | α-parallel iterative content/node lookups |
//! | `overlay` | Per-network message handlers, gossip, refresh |
//! | `validation` | Accumulator and historical-roots proof validation |
//! | `store` | Validated content store with radius eviction |
//! | `protocols` | Collaborator traits (transport, database, clock) |

mod congestion;
mod content;
mod identity;
mod lookup;
mod messages;
mod node;
mod overlay;
mod packet;
mod protocols;
mod routing;
mod socket;
mod store;
mod utp;
mod validation;

pub use content::{content_id_of, ContentId, ContentKey, ContentKeyError};
pub use identity::{
    bucket_index, log2_distance, xor_distance, Enr, EnrError, Keypair, NodeId,
};
pub use lookup::LookupConfig;
pub use messages::{
    Accept, ContentResponse, FindContent, FindNodes, Nodes, Offer, Ping, PortalMessage,
    ProtocolError, Pong,
};
pub use node::{NodeBuilder, PortalNode};
pub use overlay::{FindResult, OverlayConfig, OverlayNetwork, PortalEvent};
pub use packet::{Packet, PacketError, PacketType, SelectiveAck};
pub use protocols::{
    protocol_id, AcceptAllBeaconVerifier, BeaconVerifier, Clock, ContentDatabase, DbOp,
    MonotonicClock, NetworkId, TalkRequest, TalkTransport,
};
pub use routing::{AddOutcome, RoutingTable, DEFAULT_ALPHA, DEFAULT_K};
pub use socket::{ConnectionPair, SocketConfig, UtpError};
pub use store::{ContentStore, MemoryDb, PutOutcome, PutReport, StoreConfig, StoreError};
pub use utp::{TransferDirection, TransferEvent, UtpConfig, UtpMultiplexer};
pub use validation::{
    build_merkle_branch, merkle_root_from_chunks, verify_header_proof, verify_merkle_branch,
    ContentError, EpochAccumulator, HeaderProof, HeaderRecord, HeaderValidator, HeaderWithProof,
    HistoricalRootsBlockProof,
};
