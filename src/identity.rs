//! # Identity, ENRs, and the XOR metric
//!
//! Core identity types for the Portal overlay:
//!
//! - [`Keypair`]: Ed25519 signing keypair backing a node's identity
//! - [`NodeId`]: 32-byte identifier, the keccak256 of the public key
//! - [`Enr`]: signed, sequenced record binding a NodeId to transport
//!   coordinates
//!
//! ## Distance
//!
//! The overlay routes on bitwise XOR interpreted as a 256-bit unsigned
//! integer. The same metric covers nodes and content: a content-id is
//! compared against node-ids directly, and a node's *radius* is a plain
//! [`U256`] bound on the distance of content it stores.
//!
//! ## ENR model
//!
//! Records are deliberately minimal: sequence number, Ed25519 public key,
//! and one socket address, RLP-encoded for the wire and signed over the
//! unsigned encoding. The text form is the RLP hex behind an `enr:` prefix.
//! Everything else the full ENR spec allows is opaque to the overlay, which
//! only ever extracts the NodeId and the address.
//!
//! ## Invariants
//!
//! - `Enr::from_text(enr.to_text()) == enr`
//! - A record whose signature does not verify is never admitted to the
//!   routing table
//! - A higher `seq` for the same identity always replaces a lower one

use alloy_primitives::{keccak256, B256, U256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// 32-byte node identifier: keccak256 of the Ed25519 public key.
pub type NodeId = B256;

/// Domain separator mixed into ENR signatures.
const ENR_SIGNATURE_DOMAIN: &[u8] = b"portal-enr-v1";

/// Text-encoding prefix for ENRs.
const ENR_TEXT_PREFIX: &str = "enr:";

/// XOR distance between two 256-bit coordinates.
pub fn xor_distance(a: &B256, b: &B256) -> U256 {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    U256::from_be_bytes(out)
}

/// Bucket index for a non-zero distance: `255 - floor(log2(distance))`,
/// expressed through leading zeros. Returns `None` for distance zero
/// (a node never buckets itself).
pub fn bucket_index(self_id: &NodeId, other: &B256) -> Option<usize> {
    let dist = xor_distance(self_id, other);
    if dist.is_zero() {
        return None;
    }
    Some(dist.leading_zeros())
}

/// Log2-distance as used by FINDNODES: `256 - leading_zeros`, in `1..=256`,
/// with 0 meaning "self".
pub fn log2_distance(a: &B256, b: &B256) -> u16 {
    let dist = xor_distance(a, b);
    if dist.is_zero() {
        0
    } else {
        (256 - dist.leading_zeros()) as u16
    }
}

/// A uniformly random id whose distance to `self_id` falls in the given
/// bucket. Used by the periodic bucket refresh to aim FINDNODES lookups.
pub fn random_node_id_in_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    debug_assert!(bucket_idx < 256);
    let mut distance = [0u8; 32];
    if getrandom::getrandom(&mut distance).is_err() {
        for (i, byte) in distance.iter_mut().enumerate() {
            *byte = self_id[i].wrapping_add((bucket_idx.wrapping_mul(i + 1)) as u8);
        }
    }

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; 32];
    for i in 0..32 {
        target[i] = self_id[i] ^ distance[i];
    }
    B256::from(target)
}

/// Ed25519 signing keypair. The node identity is derived from the
/// verifying key; the signing key is persisted under the reserved
/// `privateKey` database entry.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &hex::encode(self.public_bytes()))
            .finish_non_exhaustive()
    }
}

impl Keypair {
    pub fn generate() -> Self {
        Self { signing: SigningKey::generate(&mut OsRng) }
    }

    /// Rehydrate from the 32 persisted secret bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, EnrError> {
        let secret: [u8; 32] = bytes.try_into().map_err(|_| EnrError::BadKeyLength)?;
        Ok(Self { signing: SigningKey::from_bytes(&secret) })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn node_id(&self) -> NodeId {
        keccak256(self.public_bytes())
    }

    /// Build and sign a record for this identity.
    pub fn make_enr(&self, addr: impl Into<String>, seq: u64) -> Enr {
        let unsigned = UnsignedEnr {
            seq,
            public_key: self.public_bytes().to_vec(),
            addr: addr.into(),
        };
        let signature = self.signing.sign(&unsigned.signing_input());
        Enr {
            signature: signature.to_bytes().to_vec(),
            seq: unsigned.seq,
            public_key: unsigned.public_key,
            addr: unsigned.addr,
        }
    }
}

/// The signed portion of a record, RLP-encoded for signing.
#[derive(RlpEncodable)]
struct UnsignedEnr {
    seq: u64,
    public_key: Vec<u8>,
    addr: String,
}

impl UnsignedEnr {
    fn signing_input(&self) -> Vec<u8> {
        let mut out = ENR_SIGNATURE_DOMAIN.to_vec();
        self.encode(&mut out);
        out
    }
}

/// A signed node record.
///
/// Wire form is the RLP of `(signature, seq, public_key, addr)`; text form
/// is that RLP hex-encoded behind `enr:`.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Enr {
    pub signature: Vec<u8>,
    pub seq: u64,
    pub public_key: Vec<u8>,
    pub addr: String,
}

/// Errors decoding or verifying records.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnrError {
    #[error("missing enr: prefix")]
    MissingPrefix,
    #[error("invalid hex encoding")]
    BadHex,
    #[error("invalid rlp encoding")]
    BadRlp,
    #[error("key material has wrong length")]
    BadKeyLength,
    #[error("signature verification failed")]
    BadSignature,
}

impl Enr {
    pub fn node_id(&self) -> NodeId {
        keccak256(&self.public_key)
    }

    /// Verify the record's signature against its own public key.
    pub fn verify(&self) -> Result<(), EnrError> {
        let key: [u8; 32] = self
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| EnrError::BadKeyLength)?;
        let verifying = VerifyingKey::from_bytes(&key).map_err(|_| EnrError::BadKeyLength)?;
        let sig_bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| EnrError::BadKeyLength)?;
        let signature = Signature::from_bytes(&sig_bytes);
        let unsigned = UnsignedEnr {
            seq: self.seq,
            public_key: self.public_key.clone(),
            addr: self.addr.clone(),
        };
        verifying
            .verify(&unsigned.signing_input(), &signature)
            .map_err(|_| EnrError::BadSignature)
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, EnrError> {
        let mut slice = bytes;
        Enr::decode(&mut slice).map_err(|_| EnrError::BadRlp)
    }

    pub fn to_text(&self) -> String {
        format!("{}{}", ENR_TEXT_PREFIX, hex::encode(self.to_wire()))
    }

    pub fn from_text(text: &str) -> Result<Self, EnrError> {
        let hex_part = text
            .strip_prefix(ENR_TEXT_PREFIX)
            .ok_or(EnrError::MissingPrefix)?;
        let bytes = hex::decode(hex_part).map_err(|_| EnrError::BadHex)?;
        Self::from_wire(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair(index: u8) -> Keypair {
        let mut seed = [0u8; 32];
        seed[0] = index;
        Keypair::from_secret_bytes(&seed).unwrap()
    }

    #[test]
    fn enr_text_round_trip() {
        let kp = test_keypair(1);
        let enr = kp.make_enr("10.0.0.1:9009", 3);
        let text = enr.to_text();
        assert!(text.starts_with("enr:"));
        let parsed = Enr::from_text(&text).unwrap();
        assert_eq!(parsed, enr);
        parsed.verify().unwrap();
        assert_eq!(parsed.node_id(), kp.node_id());
    }

    #[test]
    fn tampered_enr_fails_verification() {
        let kp = test_keypair(2);
        let mut enr = kp.make_enr("10.0.0.2:9009", 1);
        enr.addr = "10.9.9.9:9009".to_string();
        assert_eq!(enr.verify(), Err(EnrError::BadSignature));

        let mut resigned = kp.make_enr("10.0.0.2:9009", 1);
        let last = resigned.signature.len() - 1;
        resigned.signature[last] ^= 0x01;
        assert_eq!(resigned.verify(), Err(EnrError::BadSignature));
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let a = test_keypair(3).node_id();
        let b = test_keypair(4).node_id();
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
        assert!(xor_distance(&a, &a).is_zero());
        assert_eq!(bucket_index(&a, &a), None);
    }

    #[test]
    fn bucket_index_matches_log_distance() {
        let a = test_keypair(5).node_id();
        let b = test_keypair(6).node_id();
        let idx = bucket_index(&a, &b).unwrap();
        assert_eq!(log2_distance(&a, &b) as usize, 256 - idx);
    }

    #[test]
    fn random_id_lands_in_requested_bucket() {
        let self_id = test_keypair(7).node_id();
        for bucket in [0usize, 5, 127, 200, 255] {
            let id = random_node_id_in_bucket(&self_id, bucket);
            assert_eq!(bucket_index(&self_id, &id), Some(bucket));
        }
    }
}
