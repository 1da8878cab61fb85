//! # Portal overlay wire messages
//!
//! The selector-tagged union carried in TALKREQ/TALKRESP payloads for each
//! overlay network. Every message is one selector byte followed by the
//! SSZ encoding of its body:
//!
//! | ID | Message | Direction | Description |
//! |----|---------|-----------|-------------|
//! | 0x00 | `Ping` | Request | Liveness probe carrying enr-seq and radius |
//! | 0x01 | `Pong` | Response | Liveness answer carrying enr-seq and radius |
//! | 0x02 | `FindNodes` | Request | ENRs at the given log2-distances |
//! | 0x03 | `Nodes` | Response | ENR list, size-budgeted |
//! | 0x04 | `FindContent` | Request | Content or redirection for one key |
//! | 0x05 | `Content` | Response | Inline bytes, a uTP conn-id, or ENRs |
//! | 0x06 | `Offer` | Request | Keys available for transfer |
//! | 0x07 | `Accept` | Response | Wanted-key bitmap plus uTP conn-id |
//!
//! `Content` is itself a union: selector 0 carries a connection-id for a
//! uTP transfer, 1 carries the content inline, 2 carries ENRs closer to
//! the target. Unknown selectors at either level decode to a typed
//! [`ProtocolError`], never a silent drop.
//!
//! The ping/pong custom payload is the node's content radius as an SSZ
//! `U256`; unknown payload shapes are treated as "radius unknown", not an
//! error, so the field stays extensible.

use alloy_primitives::U256;
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};

/// TALKRESP payload budget: responses must stay within a UDP-safe size.
pub const TALK_PAYLOAD_BUDGET: usize = 1200;

/// Largest content that may ride inline in a `Content` response after
/// framing overhead; anything bigger redirects through uTP.
pub const MAX_INLINE_CONTENT: usize = 1165;

/// Decode failures for overlay messages.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProtocolError {
    #[error("unknown message selector {0:#04x}")]
    UnknownSelector(u8),
    #[error("unknown content-response selector {0:#04x}")]
    UnknownContentSelector(u8),
    #[error("empty message")]
    Empty,
    #[error("ssz decoding failed: {0:?}")]
    Ssz(ssz::DecodeError),
}

impl From<ssz::DecodeError> for ProtocolError {
    fn from(err: ssz::DecodeError) -> Self {
        ProtocolError::Ssz(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Ping {
    pub enr_seq: u64,
    pub custom_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Pong {
    pub enr_seq: u64,
    pub custom_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FindNodes {
    /// Requested log2-distances, 0 meaning the node's own record.
    pub distances: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Nodes {
    /// Number of response messages the answer spans. Always 1 here; kept
    /// on the wire for compatibility with chunked responders.
    pub total: u8,
    /// Wire-encoded ENRs.
    pub enrs: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FindContent {
    pub content_key: Vec<u8>,
}

/// Body of a CONTENT response: the nested union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentResponse {
    /// Selector 0: fetch over uTP with this advertised connection-id.
    ConnectionId(u16),
    /// Selector 1: the content itself.
    Content(Vec<u8>),
    /// Selector 2: ENRs closer to the content-id.
    Enrs(Vec<Vec<u8>>),
}

impl ContentResponse {
    fn encode_body(&self) -> Vec<u8> {
        match self {
            ContentResponse::ConnectionId(id) => {
                let mut out = vec![0u8];
                out.extend_from_slice(&id.as_ssz_bytes());
                out
            }
            ContentResponse::Content(bytes) => {
                let mut out = vec![1u8];
                out.extend_from_slice(bytes);
                out
            }
            ContentResponse::Enrs(enrs) => {
                let mut out = vec![2u8];
                out.extend_from_slice(&enrs.as_ssz_bytes());
                out
            }
        }
    }

    fn decode_body(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&selector, rest) = bytes.split_first().ok_or(ProtocolError::Empty)?;
        match selector {
            0 => Ok(ContentResponse::ConnectionId(u16::from_ssz_bytes(rest)?)),
            1 => Ok(ContentResponse::Content(rest.to_vec())),
            2 => Ok(ContentResponse::Enrs(Vec::<Vec<u8>>::from_ssz_bytes(rest)?)),
            other => Err(ProtocolError::UnknownContentSelector(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Offer {
    pub content_keys: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Accept {
    pub connection_id: u16,
    /// Bitmap over the offered keys, LSB-first: bit i set iff key i is
    /// wanted.
    pub accepted: Vec<u8>,
}

/// The overlay message union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalMessage {
    Ping(Ping),
    Pong(Pong),
    FindNodes(FindNodes),
    Nodes(Nodes),
    FindContent(FindContent),
    Content(ContentResponse),
    Offer(Offer),
    Accept(Accept),
}

impl PortalMessage {
    pub fn selector(&self) -> u8 {
        match self {
            PortalMessage::Ping(_) => 0x00,
            PortalMessage::Pong(_) => 0x01,
            PortalMessage::FindNodes(_) => 0x02,
            PortalMessage::Nodes(_) => 0x03,
            PortalMessage::FindContent(_) => 0x04,
            PortalMessage::Content(_) => 0x05,
            PortalMessage::Offer(_) => 0x06,
            PortalMessage::Accept(_) => 0x07,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = match self {
            PortalMessage::Ping(m) => m.as_ssz_bytes(),
            PortalMessage::Pong(m) => m.as_ssz_bytes(),
            PortalMessage::FindNodes(m) => m.as_ssz_bytes(),
            PortalMessage::Nodes(m) => m.as_ssz_bytes(),
            PortalMessage::FindContent(m) => m.as_ssz_bytes(),
            PortalMessage::Content(m) => m.encode_body(),
            PortalMessage::Offer(m) => m.as_ssz_bytes(),
            PortalMessage::Accept(m) => m.as_ssz_bytes(),
        };
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(self.selector());
        out.extend_from_slice(&body);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&selector, body) = bytes.split_first().ok_or(ProtocolError::Empty)?;
        match selector {
            0x00 => Ok(PortalMessage::Ping(Ping::from_ssz_bytes(body)?)),
            0x01 => Ok(PortalMessage::Pong(Pong::from_ssz_bytes(body)?)),
            0x02 => Ok(PortalMessage::FindNodes(FindNodes::from_ssz_bytes(body)?)),
            0x03 => Ok(PortalMessage::Nodes(Nodes::from_ssz_bytes(body)?)),
            0x04 => Ok(PortalMessage::FindContent(FindContent::from_ssz_bytes(body)?)),
            0x05 => Ok(PortalMessage::Content(ContentResponse::decode_body(body)?)),
            0x06 => Ok(PortalMessage::Offer(Offer::from_ssz_bytes(body)?)),
            0x07 => Ok(PortalMessage::Accept(Accept::from_ssz_bytes(body)?)),
            other => Err(ProtocolError::UnknownSelector(other)),
        }
    }
}

// ----------------------------------------------------------------------
// Ping/Pong custom payload: the content radius
// ----------------------------------------------------------------------

/// Encode a radius as the ping/pong custom payload.
pub fn encode_radius(radius: U256) -> Vec<u8> {
    radius.as_ssz_bytes()
}

/// Decode a radius from a custom payload; `None` when the payload has an
/// unknown shape.
pub fn decode_radius(payload: &[u8]) -> Option<U256> {
    U256::from_ssz_bytes(payload).ok()
}

// ----------------------------------------------------------------------
// Accept bitmap helpers
// ----------------------------------------------------------------------

/// Build the ACCEPT bitmap from per-key verdicts, LSB-first.
pub fn accept_bitmap(wanted: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; wanted.len().div_ceil(8)];
    for (i, want) in wanted.iter().enumerate() {
        if *want {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Whether bit `i` of an ACCEPT bitmap is set.
pub fn bitmap_bit(bitmap: &[u8], i: usize) -> bool {
    bitmap.get(i / 8).map(|byte| byte & (1 << (i % 8)) != 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_every_selector() {
        let messages = [
            PortalMessage::Ping(Ping { enr_seq: 1, custom_payload: encode_radius(U256::MAX) }),
            PortalMessage::Pong(Pong { enr_seq: 2, custom_payload: encode_radius(U256::from(7u8)) }),
            PortalMessage::FindNodes(FindNodes { distances: vec![0, 255, 256] }),
            PortalMessage::Nodes(Nodes { total: 1, enrs: vec![vec![1, 2, 3], vec![4]] }),
            PortalMessage::FindContent(FindContent { content_key: vec![0x00, 0xAA] }),
            PortalMessage::Content(ContentResponse::ConnectionId(0xBEEF)),
            PortalMessage::Content(ContentResponse::Content(vec![9u8; 64])),
            PortalMessage::Content(ContentResponse::Enrs(vec![vec![5, 6], vec![]])),
            PortalMessage::Offer(Offer { content_keys: vec![vec![0x01, 0xBB], vec![0x02, 0xCC]] }),
            PortalMessage::Accept(Accept { connection_id: 4660, accepted: vec![0b101] }),
        ];
        for message in messages {
            let bytes = message.encode();
            let decoded = PortalMessage::decode(&bytes).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn selector_is_first_byte() {
        let msg = PortalMessage::FindContent(FindContent { content_key: vec![0x00] });
        assert_eq!(msg.encode()[0], 0x04);
    }

    #[test]
    fn unknown_selectors_are_typed_errors() {
        assert_eq!(PortalMessage::decode(&[0x42]), Err(ProtocolError::UnknownSelector(0x42)));
        assert_eq!(PortalMessage::decode(&[]), Err(ProtocolError::Empty));
        assert_eq!(
            PortalMessage::decode(&[0x05, 0x09]),
            Err(ProtocolError::UnknownContentSelector(0x09))
        );
    }

    #[test]
    fn malformed_body_is_an_ssz_error() {
        // FindNodes body must be an offset-prefixed list; garbage fails.
        let result = PortalMessage::decode(&[0x02, 0xFF]);
        assert!(matches!(result, Err(ProtocolError::Ssz(_))));
    }

    #[test]
    fn radius_payload_round_trip() {
        for radius in [U256::ZERO, U256::from(123u64), U256::MAX] {
            assert_eq!(decode_radius(&encode_radius(radius)), Some(radius));
        }
        assert_eq!(decode_radius(&[1, 2, 3]), None);
    }

    #[test]
    fn accept_bitmap_round_trip() {
        let wanted = [true, false, true, false, false, false, false, false, true];
        let bitmap = accept_bitmap(&wanted);
        assert_eq!(bitmap.len(), 2);
        assert_eq!(bitmap[0], 0b0000_0101);
        for (i, want) in wanted.iter().enumerate() {
            assert_eq!(bitmap_bit(&bitmap, i), *want);
        }
        assert!(!bitmap_bit(&bitmap, 100));
    }
}
