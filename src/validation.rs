//! # Content validation
//!
//! Every item entering the content store passes through here first.
//! Nothing is stored or gossiped on trust: headers prove their place in
//! the chain, bodies and receipts prove they reassemble against a stored
//! header, epoch accumulators prove membership in the master list, and
//! beacon artifacts are judged by the external verifier.
//!
//! ## Header proofs
//!
//! Pre-merge headers carry a 15-witness SSZ single-proof: the block hash
//! is a field chunk inside an epoch accumulator (an SSZ list of 8192
//! `(block_hash, total_difficulty)` records), so its generalized index is
//! `2^15 + 2 * (block_number % 8192)`: 13 record-tree levels, one field
//! level, one length-mixin level. The reconstructed root must equal the
//! master accumulator entry for `block_number / 8192`.
//!
//! Post-merge, pre-Capella headers carry a `HistoricalRootsBlockProof`:
//! an 11-witness branch placing the execution block hash inside a beacon
//! block, and a 14-witness branch placing that beacon block root inside
//! the `historical_roots` entry for `slot / 8192`.
//!
//! ## Value encodings
//!
//! | Content | Encoding |
//! |---------|----------|
//! | header | SSZ `{header: rlp bytes, proof: selector ‖ body}` |
//! | body | RLP `(transactions, uncles)` |
//! | receipts | RLP receipt list |
//! | epoch accumulator | SSZ list of header records |
//! | beacon artifacts | opaque, delegated to [`BeaconVerifier`] |
//!
//! [`BeaconVerifier`]: crate::protocols::BeaconVerifier

use alloy_consensus::proofs::{
    calculate_ommers_root, calculate_receipt_root, calculate_transaction_root,
};
use alloy_consensus::{Header, ReceiptEnvelope, TxEnvelope};
use alloy_primitives::{B256, U256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use sha2::{Digest, Sha256};
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};

/// Blocks per epoch accumulator, slots per historical root.
pub const EPOCH_SIZE: u64 = 8192;

/// Witnesses in a pre-merge accumulator proof.
pub const ACCUMULATOR_PROOF_LEN: usize = 15;

/// Witnesses placing a beacon block root in a historical batch.
const BEACON_BLOCK_PROOF_LEN: usize = 14;

/// Witnesses placing an execution hash in a beacon block; the
/// generalized index of `body.execution_payload.block_hash`.
const EXECUTION_BLOCK_PROOF_LEN: usize = 11;
const EXECUTION_BLOCK_GINDEX: u64 = 3228;

/// Content rejection reasons. Rejected content is never stored and never
/// gossiped; the offering peer is demoted, not banned.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContentError {
    #[error("invalid proof: {0}")]
    InvalidProof(&'static str),
    #[error("content reassembly failed: {0}")]
    ReassemblyFailed(String),
    #[error("unknown content type selector {0:#04x}")]
    UnknownContentType(u8),
    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),
    #[error("content decoding failed: {0}")]
    Decode(String),
}

// ----------------------------------------------------------------------
// SSZ merkle helpers
// ----------------------------------------------------------------------

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Root of `chunks` padded with zero chunks to `2^depth` leaves.
pub fn merkle_root_from_chunks(chunks: &[B256], depth: usize) -> B256 {
    let width = 1usize << depth;
    debug_assert!(chunks.len() <= width);
    let mut level: Vec<[u8; 32]> = Vec::with_capacity(width);
    level.extend(chunks.iter().map(|c| c.0));
    level.resize(width, [0u8; 32]);
    for _ in 0..depth {
        level = level.chunks(2).map(|pair| hash_pair(&pair[0], &pair[1])).collect();
    }
    B256::from(level[0])
}

/// Sibling path for the chunk at `index`, bottom-up, over the same padded
/// tree as [`merkle_root_from_chunks`].
pub fn build_merkle_branch(chunks: &[B256], depth: usize, index: usize) -> Vec<B256> {
    let width = 1usize << depth;
    debug_assert!(index < width);
    let mut level: Vec<[u8; 32]> = Vec::with_capacity(width);
    level.extend(chunks.iter().map(|c| c.0));
    level.resize(width, [0u8; 32]);

    let mut branch = Vec::with_capacity(depth);
    let mut idx = index;
    for _ in 0..depth {
        branch.push(B256::from(level[idx ^ 1]));
        level = level.chunks(2).map(|pair| hash_pair(&pair[0], &pair[1])).collect();
        idx /= 2;
    }
    branch
}

/// Verify a single-leaf branch; the depth is the branch length.
pub fn verify_merkle_branch(leaf: B256, branch: &[B256], index: u64, root: B256) -> bool {
    let mut node = leaf.0;
    for (height, witness) in branch.iter().enumerate() {
        node = if (index >> height) & 1 == 1 {
            hash_pair(&witness.0, &node)
        } else {
            hash_pair(&node, &witness.0)
        };
    }
    B256::from(node) == root
}

/// `mix_in_length` step of SSZ list hashing.
fn mix_in_length(root: B256, length: u64) -> B256 {
    let mut len_chunk = [0u8; 32];
    len_chunk[..8].copy_from_slice(&length.to_le_bytes());
    B256::from(hash_pair(&root.0, &len_chunk))
}

// ----------------------------------------------------------------------
// Epoch accumulator
// ----------------------------------------------------------------------

/// One accumulated block: its hash and the chain's difficulty through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct HeaderRecord {
    pub block_hash: B256,
    pub total_difficulty: U256,
}

/// An epoch's worth of header records (SSZ `List[HeaderRecord, 8192]`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EpochAccumulator {
    pub records: Vec<HeaderRecord>,
}

impl EpochAccumulator {
    pub fn encode_ssz(&self) -> Vec<u8> {
        self.records.as_ssz_bytes()
    }

    pub fn decode_ssz(bytes: &[u8]) -> Result<Self, ContentError> {
        let records = Vec::<HeaderRecord>::from_ssz_bytes(bytes)
            .map_err(|e| ContentError::Decode(format!("epoch accumulator: {e:?}")))?;
        if records.len() > EPOCH_SIZE as usize {
            return Err(ContentError::Decode("epoch accumulator over 8192 records".into()));
        }
        Ok(Self { records })
    }

    /// Field chunks of the record list: `(block_hash, td)` per record.
    fn chunks(&self) -> Vec<B256> {
        let mut chunks = Vec::with_capacity(self.records.len() * 2);
        for record in &self.records {
            chunks.push(record.block_hash);
            chunks.push(B256::from(record.total_difficulty.to_le_bytes::<32>()));
        }
        chunks
    }

    /// SSZ hash-tree-root: depth-14 chunk tree with the record count
    /// mixed in.
    pub fn tree_hash_root(&self) -> B256 {
        let data_root = merkle_root_from_chunks(&self.chunks(), 14);
        mix_in_length(data_root, self.records.len() as u64)
    }

    /// The 15-witness inclusion proof for a block's hash chunk.
    pub fn build_header_proof(&self, block_number: u64) -> Vec<B256> {
        let index = (block_number % EPOCH_SIZE) as usize * 2;
        let mut branch = build_merkle_branch(&self.chunks(), 14, index);
        let mut len_chunk = [0u8; 32];
        len_chunk[..8].copy_from_slice(&(self.records.len() as u64).to_le_bytes());
        branch.push(B256::from(len_chunk));
        branch
    }
}

/// Verify a 15-witness accumulator proof against an epoch root.
pub fn verify_header_proof(
    block_hash: B256,
    block_number: u64,
    proof: &[B256],
    epoch_root: B256,
) -> bool {
    if proof.len() != ACCUMULATOR_PROOF_LEN {
        return false;
    }
    let index = (block_number % EPOCH_SIZE) * 2;
    verify_merkle_branch(block_hash, proof, index, epoch_root)
}

// ----------------------------------------------------------------------
// Header-with-proof value encoding
// ----------------------------------------------------------------------

/// Proof union carried alongside a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderProof {
    /// Selector 0: pre-merge epoch accumulator proof.
    Accumulator(Vec<B256>),
    /// Selector 1: post-merge, pre-Capella beacon proof.
    HistoricalRoots(HistoricalRootsBlockProof),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct HistoricalRootsBlockProof {
    pub beacon_block_proof: Vec<B256>,
    pub beacon_block_root: B256,
    pub execution_block_proof: Vec<B256>,
    pub slot: u64,
}

impl HeaderProof {
    fn encode(&self) -> Vec<u8> {
        match self {
            HeaderProof::Accumulator(witnesses) => {
                let mut out = vec![0u8];
                for witness in witnesses {
                    out.extend_from_slice(witness.as_slice());
                }
                out
            }
            HeaderProof::HistoricalRoots(proof) => {
                let mut out = vec![1u8];
                out.extend_from_slice(&proof.as_ssz_bytes());
                out
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, ContentError> {
        let (&selector, body) = bytes
            .split_first()
            .ok_or_else(|| ContentError::Decode("empty header proof".into()))?;
        match selector {
            0 => {
                if body.len() % 32 != 0 {
                    return Err(ContentError::Decode("ragged accumulator proof".into()));
                }
                let witnesses = body.chunks(32).map(B256::from_slice).collect();
                Ok(HeaderProof::Accumulator(witnesses))
            }
            1 => {
                let proof = HistoricalRootsBlockProof::from_ssz_bytes(body)
                    .map_err(|e| ContentError::Decode(format!("historical-roots proof: {e:?}")))?;
                Ok(HeaderProof::HistoricalRoots(proof))
            }
            other => Err(ContentError::Decode(format!("unknown proof selector {other}"))),
        }
    }
}

/// Stored/transferred header value: RLP header bytes plus its proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderWithProof {
    pub header_rlp: Vec<u8>,
    pub proof: HeaderProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
struct HeaderWithProofSsz {
    header: Vec<u8>,
    proof: Vec<u8>,
}

impl HeaderWithProof {
    pub fn encode_ssz(&self) -> Vec<u8> {
        HeaderWithProofSsz { header: self.header_rlp.clone(), proof: self.proof.encode() }
            .as_ssz_bytes()
    }

    pub fn decode_ssz(bytes: &[u8]) -> Result<Self, ContentError> {
        let raw = HeaderWithProofSsz::from_ssz_bytes(bytes)
            .map_err(|e| ContentError::Decode(format!("header-with-proof: {e:?}")))?;
        Ok(Self { header_rlp: raw.header, proof: HeaderProof::decode(&raw.proof)? })
    }
}

// ----------------------------------------------------------------------
// Validators
// ----------------------------------------------------------------------

/// Immutable chain constants the header validator checks proofs against.
///
/// Loaded at construction (the canonical values for mainnet, small
/// fixtures for tests) and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct HeaderValidator {
    /// Root of every completed pre-merge epoch accumulator, indexed by
    /// `block_number / 8192`.
    pub historical_epochs: Vec<B256>,
    /// `historical_roots` entries, indexed by `slot / 8192`.
    pub historical_roots: Vec<B256>,
    /// First post-merge block number.
    pub merge_block: u64,
}

impl HeaderValidator {
    /// Validate a header value against its content-key hash. Returns the
    /// decoded header so dependent validations can reuse it.
    pub fn validate_header(
        &self,
        key_block_hash: B256,
        value: &[u8],
    ) -> Result<Header, ContentError> {
        let hwp = HeaderWithProof::decode_ssz(value)?;
        let header = decode_header(&hwp.header_rlp)?;
        let hash = header.hash_slow();
        if hash != key_block_hash {
            return Err(ContentError::InvalidProof("header hash does not match content key"));
        }
        match &hwp.proof {
            HeaderProof::Accumulator(witnesses) => {
                if header.number >= self.merge_block {
                    return Err(ContentError::InvalidProof(
                        "accumulator proof on post-merge header",
                    ));
                }
                let epoch = (header.number / EPOCH_SIZE) as usize;
                let epoch_root = self
                    .historical_epochs
                    .get(epoch)
                    .copied()
                    .ok_or(ContentError::InvalidProof("epoch beyond master accumulator"))?;
                if !verify_header_proof(hash, header.number, witnesses, epoch_root) {
                    return Err(ContentError::InvalidProof("accumulator proof mismatch"));
                }
            }
            HeaderProof::HistoricalRoots(proof) => {
                if header.number < self.merge_block {
                    return Err(ContentError::InvalidProof(
                        "historical-roots proof on pre-merge header",
                    ));
                }
                self.verify_historical_roots(hash, proof)?;
            }
        }
        Ok(header)
    }

    fn verify_historical_roots(
        &self,
        block_hash: B256,
        proof: &HistoricalRootsBlockProof,
    ) -> Result<(), ContentError> {
        if proof.execution_block_proof.len() != EXECUTION_BLOCK_PROOF_LEN
            || proof.beacon_block_proof.len() != BEACON_BLOCK_PROOF_LEN
        {
            return Err(ContentError::InvalidProof("wrong historical-roots witness count"));
        }
        // Execution hash inside the beacon block.
        let exec_index = EXECUTION_BLOCK_GINDEX - (1 << EXECUTION_BLOCK_PROOF_LEN);
        if !verify_merkle_branch(
            block_hash,
            &proof.execution_block_proof,
            exec_index,
            proof.beacon_block_root,
        ) {
            return Err(ContentError::InvalidProof("execution block proof mismatch"));
        }
        // Beacon block root inside its historical batch.
        let batch = (proof.slot / EPOCH_SIZE) as usize;
        let batch_root = self
            .historical_roots
            .get(batch)
            .copied()
            .ok_or(ContentError::InvalidProof("slot beyond historical roots"))?;
        if !verify_merkle_branch(
            proof.beacon_block_root,
            &proof.beacon_block_proof,
            proof.slot % EPOCH_SIZE,
            batch_root,
        ) {
            return Err(ContentError::InvalidProof("beacon block proof mismatch"));
        }
        Ok(())
    }

    /// Validate an epoch accumulator value: its root must match the
    /// content key and appear in the master list.
    pub fn validate_epoch_accumulator(
        &self,
        key_epoch_hash: B256,
        value: &[u8],
    ) -> Result<(), ContentError> {
        let accumulator = EpochAccumulator::decode_ssz(value)?;
        let root = accumulator.tree_hash_root();
        if root != key_epoch_hash {
            return Err(ContentError::InvalidProof("accumulator root does not match key"));
        }
        if !self.historical_epochs.contains(&root) {
            return Err(ContentError::InvalidProof("accumulator root not in master list"));
        }
        Ok(())
    }
}

#[derive(RlpEncodable, RlpDecodable)]
struct BodyRlp {
    transactions: Vec<TxEnvelope>,
    uncles: Vec<Header>,
}

pub fn decode_header(rlp: &[u8]) -> Result<Header, ContentError> {
    let mut slice = rlp;
    Header::decode(&mut slice).map_err(|e| ContentError::Decode(format!("header rlp: {e}")))
}

/// Encode a body value from its parts.
pub fn encode_body(transactions: &[TxEnvelope], uncles: &[Header]) -> Vec<u8> {
    let body = BodyRlp { transactions: transactions.to_vec(), uncles: uncles.to_vec() };
    let mut out = Vec::new();
    body.encode(&mut out);
    out
}

/// Validate a body against its stored header: the transactions trie and
/// the uncle list must reproduce the header's commitments.
pub fn validate_body(header: &Header, value: &[u8]) -> Result<(), ContentError> {
    let mut slice = value;
    let body =
        BodyRlp::decode(&mut slice).map_err(|e| ContentError::Decode(format!("body rlp: {e}")))?;
    if calculate_transaction_root(&body.transactions) != header.transactions_root {
        return Err(ContentError::InvalidProof("transactions root mismatch"));
    }
    if calculate_ommers_root(&body.uncles) != header.ommers_hash {
        return Err(ContentError::InvalidProof("uncles hash mismatch"));
    }
    Ok(())
}

/// Encode a receipts value.
pub fn encode_receipts(receipts: &[ReceiptEnvelope]) -> Vec<u8> {
    let mut out = Vec::new();
    receipts.to_vec().encode(&mut out);
    out
}

/// Validate receipts against the stored header's receipts root.
pub fn validate_receipts(header: &Header, value: &[u8]) -> Result<(), ContentError> {
    let mut slice = value;
    let receipts = Vec::<ReceiptEnvelope>::decode(&mut slice)
        .map_err(|e| ContentError::Decode(format!("receipts rlp: {e}")))?;
    if calculate_receipt_root(&receipts) != header.receipts_root {
        return Err(ContentError::InvalidProof("receipts root mismatch"));
    }
    Ok(())
}
