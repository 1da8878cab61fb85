//! # Content keys and content-ids
//!
//! A content key is a typed byte string: one selector byte naming the
//! variant, followed by the variant's fixed fields. The content-id, the
//! coordinate used for XOR distance against node-ids and radii, is the
//! SHA-256 of the full key encoding.
//!
//! ## Selectors
//!
//! | Byte | Variant | Network |
//! |------|---------|---------|
//! | 0x00 | header by hash | history |
//! | 0x01 | block body | history |
//! | 0x02 | receipts | history |
//! | 0x03 | epoch accumulator | history |
//! | 0x10 | light-client bootstrap | beacon |
//! | 0x11 | light-client updates by range | beacon |
//! | 0x12 | light-client finality update | beacon |
//! | 0x13 | light-client optimistic update | beacon |

use alloy_primitives::B256;
use sha2::{Digest, Sha256};

use crate::protocols::NetworkId;

/// 32-byte coordinate of a content item in the XOR space.
pub type ContentId = B256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContentKeyError {
    #[error("unknown content type selector {0:#04x}")]
    UnknownContentType(u8),
    #[error("content key has wrong length for its selector")]
    InvalidLength,
}

/// A typed content key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentKey {
    BlockHeader { block_hash: B256 },
    BlockBody { block_hash: B256 },
    Receipts { block_hash: B256 },
    EpochAccumulator { epoch_hash: B256 },
    LightClientBootstrap { block_root: B256 },
    LightClientUpdatesByRange { start_period: u64, count: u64 },
    LightClientFinalityUpdate { finalized_slot: u64 },
    LightClientOptimisticUpdate { signature_slot: u64 },
}

impl ContentKey {
    pub fn selector(&self) -> u8 {
        match self {
            ContentKey::BlockHeader { .. } => 0x00,
            ContentKey::BlockBody { .. } => 0x01,
            ContentKey::Receipts { .. } => 0x02,
            ContentKey::EpochAccumulator { .. } => 0x03,
            ContentKey::LightClientBootstrap { .. } => 0x10,
            ContentKey::LightClientUpdatesByRange { .. } => 0x11,
            ContentKey::LightClientFinalityUpdate { .. } => 0x12,
            ContentKey::LightClientOptimisticUpdate { .. } => 0x13,
        }
    }

    pub fn network(&self) -> NetworkId {
        match self {
            ContentKey::BlockHeader { .. }
            | ContentKey::BlockBody { .. }
            | ContentKey::Receipts { .. }
            | ContentKey::EpochAccumulator { .. } => NetworkId::History,
            _ => NetworkId::Beacon,
        }
    }

    /// Short variant name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ContentKey::BlockHeader { .. } => "header",
            ContentKey::BlockBody { .. } => "body",
            ContentKey::Receipts { .. } => "receipts",
            ContentKey::EpochAccumulator { .. } => "epoch-accumulator",
            ContentKey::LightClientBootstrap { .. } => "lc-bootstrap",
            ContentKey::LightClientUpdatesByRange { .. } => "lc-updates",
            ContentKey::LightClientFinalityUpdate { .. } => "lc-finality",
            ContentKey::LightClientOptimisticUpdate { .. } => "lc-optimistic",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.selector()];
        match self {
            ContentKey::BlockHeader { block_hash }
            | ContentKey::BlockBody { block_hash }
            | ContentKey::Receipts { block_hash } => out.extend_from_slice(block_hash.as_slice()),
            ContentKey::EpochAccumulator { epoch_hash } => {
                out.extend_from_slice(epoch_hash.as_slice())
            }
            ContentKey::LightClientBootstrap { block_root } => {
                out.extend_from_slice(block_root.as_slice())
            }
            ContentKey::LightClientUpdatesByRange { start_period, count } => {
                out.extend_from_slice(&start_period.to_le_bytes());
                out.extend_from_slice(&count.to_le_bytes());
            }
            ContentKey::LightClientFinalityUpdate { finalized_slot } => {
                out.extend_from_slice(&finalized_slot.to_le_bytes())
            }
            ContentKey::LightClientOptimisticUpdate { signature_slot } => {
                out.extend_from_slice(&signature_slot.to_le_bytes())
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ContentKeyError> {
        let (&selector, rest) = bytes.split_first().ok_or(ContentKeyError::InvalidLength)?;
        let hash32 = |rest: &[u8]| -> Result<B256, ContentKeyError> {
            let arr: [u8; 32] = rest.try_into().map_err(|_| ContentKeyError::InvalidLength)?;
            Ok(B256::from(arr))
        };
        let u64le = |chunk: &[u8]| -> Result<u64, ContentKeyError> {
            let arr: [u8; 8] = chunk.try_into().map_err(|_| ContentKeyError::InvalidLength)?;
            Ok(u64::from_le_bytes(arr))
        };
        match selector {
            0x00 => Ok(ContentKey::BlockHeader { block_hash: hash32(rest)? }),
            0x01 => Ok(ContentKey::BlockBody { block_hash: hash32(rest)? }),
            0x02 => Ok(ContentKey::Receipts { block_hash: hash32(rest)? }),
            0x03 => Ok(ContentKey::EpochAccumulator { epoch_hash: hash32(rest)? }),
            0x10 => Ok(ContentKey::LightClientBootstrap { block_root: hash32(rest)? }),
            0x11 => {
                if rest.len() != 16 {
                    return Err(ContentKeyError::InvalidLength);
                }
                Ok(ContentKey::LightClientUpdatesByRange {
                    start_period: u64le(&rest[..8])?,
                    count: u64le(&rest[8..])?,
                })
            }
            0x12 => Ok(ContentKey::LightClientFinalityUpdate { finalized_slot: u64le(rest)? }),
            0x13 => Ok(ContentKey::LightClientOptimisticUpdate { signature_slot: u64le(rest)? }),
            other => Err(ContentKeyError::UnknownContentType(other)),
        }
    }

    /// SHA-256 of the key encoding: the content's XOR-space coordinate.
    pub fn content_id(&self) -> ContentId {
        content_id_of(&self.encode())
    }
}

/// Content-id of raw key bytes, for keys that arrive over the wire.
pub fn content_id_of(key_bytes: &[u8]) -> ContentId {
    let digest = Sha256::digest(key_bytes);
    B256::from_slice(&digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> B256 {
        B256::repeat_byte(byte)
    }

    #[test]
    fn encode_decode_round_trip() {
        let keys = [
            ContentKey::BlockHeader { block_hash: hash(1) },
            ContentKey::BlockBody { block_hash: hash(2) },
            ContentKey::Receipts { block_hash: hash(3) },
            ContentKey::EpochAccumulator { epoch_hash: hash(4) },
            ContentKey::LightClientBootstrap { block_root: hash(5) },
            ContentKey::LightClientUpdatesByRange { start_period: 700, count: 4 },
            ContentKey::LightClientFinalityUpdate { finalized_slot: 123_456 },
            ContentKey::LightClientOptimisticUpdate { signature_slot: 9 },
        ];
        for key in keys {
            let bytes = key.encode();
            assert_eq!(ContentKey::decode(&bytes).unwrap(), key);
            assert_eq!(key.content_id(), content_id_of(&bytes));
        }
    }

    #[test]
    fn header_key_layout_is_selector_then_hash() {
        let key = ContentKey::BlockHeader { block_hash: hash(0xAB) };
        let bytes = key.encode();
        assert_eq!(bytes.len(), 33);
        assert_eq!(bytes[0], 0x00);
        assert_eq!(&bytes[1..], hash(0xAB).as_slice());
    }

    #[test]
    fn rejects_unknown_selector_and_bad_length() {
        assert_eq!(
            ContentKey::decode(&[0x77, 0, 0]),
            Err(ContentKeyError::UnknownContentType(0x77))
        );
        assert_eq!(ContentKey::decode(&[]), Err(ContentKeyError::InvalidLength));
        assert_eq!(ContentKey::decode(&[0x00, 1, 2]), Err(ContentKeyError::InvalidLength));
    }

    #[test]
    fn network_classification() {
        assert_eq!(ContentKey::BlockBody { block_hash: hash(1) }.network(), NetworkId::History);
        assert_eq!(
            ContentKey::LightClientBootstrap { block_root: hash(1) }.network(),
            NetworkId::Beacon
        );
    }

    #[test]
    fn content_id_is_sha256_of_key_bytes() {
        use sha2::{Digest, Sha256};
        let key = ContentKey::BlockHeader { block_hash: hash(9) };
        let expected = Sha256::digest(key.encode());
        assert_eq!(key.content_id().as_slice(), expected.as_slice());
    }
}
