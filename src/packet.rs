//! # uTP packet codec
//!
//! Wire format for the micro-transport packets that ride inside discv5
//! TALKREQ payloads. The layout is the 20-byte libutp header, big-endian
//! throughout, followed by an optional extension chain and the payload:
//!
//! ```text
//! 0       4       8               16              24              31
//! +-------+-------+---------------+---------------+---------------+
//! | type  | ver   | extension     | connection_id                 |
//! +-------+-------+---------------+---------------+---------------+
//! | timestamp_microseconds                                        |
//! +---------------+---------------+---------------+---------------+
//! | timestamp_difference_microseconds                             |
//! +---------------+---------------+---------------+---------------+
//! | wnd_size                                                      |
//! +---------------+---------------+---------------+---------------+
//! | seq_nr                        | ack_nr                        |
//! +---------------+---------------+---------------+---------------+
//! ```
//!
//! The only extension is selective-ACK (id 1): a 4-byte bitmap covering
//! the 32 sequence numbers `ack_nr + 2 ..= ack_nr + 33`, bit `i` set iff
//! `ack_nr + 2 + i` has been received. Bits are LSB-first within each
//! byte, matching BEP-29.
//!
//! Decoding never panics; every malformed input maps to a [`PacketError`].

use std::fmt;

/// uTP protocol version carried in the low nibble of the first byte.
pub const UTP_VERSION: u8 = 1;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 20;

/// Extension id for selective ACK.
const EXT_SELECTIVE_ACK: u8 = 1;

/// Selective-ACK bitmap length. Fixed: 32 sequence numbers.
const SACK_LEN: usize = 4;

/// Packet type nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

impl PacketType {
    pub const fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Fin),
            2 => Some(PacketType::State),
            3 => Some(PacketType::Reset),
            4 => Some(PacketType::Syn),
            _ => None,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Data => "DATA",
            PacketType::Fin => "FIN",
            PacketType::State => "STATE",
            PacketType::Reset => "RESET",
            PacketType::Syn => "SYN",
        };
        f.write_str(name)
    }
}

/// Decode failures. All of these drop the packet at the multiplexer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet shorter than the {HEADER_LEN}-byte header")]
    Truncated,
    #[error("unknown uTP version {0}")]
    UnknownVersion(u8),
    #[error("unknown packet type nibble {0}")]
    UnknownType(u8),
    #[error("extension chain runs past the end of the packet")]
    UnterminatedExtension,
    #[error("extension {id} has length {len}, expected {expected}")]
    InvalidExtensionLength { id: u8, len: usize, expected: usize },
}

/// Selective-ACK bitmap: receipt of `ack_nr + 2 ..= ack_nr + 33`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SelectiveAck {
    bitmap: [u8; SACK_LEN],
}

impl SelectiveAck {
    /// Build a bitmap from the sequence numbers buffered past `ack_nr + 1`.
    /// Numbers outside the 32-slot window are ignored.
    pub fn from_buffered<I: IntoIterator<Item = u16>>(ack_nr: u16, seqs: I) -> Self {
        let mut bitmap = [0u8; SACK_LEN];
        let base = ack_nr.wrapping_add(2);
        for seq in seqs {
            let offset = seq.wrapping_sub(base);
            if (offset as usize) < SACK_LEN * 8 {
                bitmap[offset as usize / 8] |= 1 << (offset % 8);
            }
        }
        Self { bitmap }
    }

    /// Whether `seq` is marked received, relative to `ack_nr`.
    pub fn is_acked(&self, ack_nr: u16, seq: u16) -> bool {
        let offset = seq.wrapping_sub(ack_nr.wrapping_add(2));
        (offset as usize) < SACK_LEN * 8 && self.bitmap[offset as usize / 8] & (1 << (offset % 8)) != 0
    }

    /// The sequence numbers this bitmap marks as received.
    pub fn acked_seqs(&self, ack_nr: u16) -> Vec<u16> {
        let base = ack_nr.wrapping_add(2);
        (0..(SACK_LEN * 8) as u16)
            .filter(|i| self.bitmap[*i as usize / 8] & (1 << (i % 8)) != 0)
            .map(|i| base.wrapping_add(i))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == [0u8; SACK_LEN]
    }
}

/// A decoded uTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub conn_id: u16,
    /// Sender's clock at transmit time, low 32 bits of microseconds.
    pub ts_micros: u32,
    /// Sender's measured one-way delay: its receive time minus the
    /// peer packet's `ts_micros`, wrapping.
    pub ts_diff_micros: u32,
    /// Sender's advertised receive window in bytes.
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
    pub selective_ack: Option<SelectiveAck>,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let ext_len = if self.selective_ack.is_some() { 2 + SACK_LEN } else { 0 };
        let mut out = Vec::with_capacity(HEADER_LEN + ext_len + self.payload.len());
        let first_ext = if self.selective_ack.is_some() { EXT_SELECTIVE_ACK } else { 0 };
        out.push(((self.packet_type as u8) << 4) | UTP_VERSION);
        out.push(first_ext);
        out.extend_from_slice(&self.conn_id.to_be_bytes());
        out.extend_from_slice(&self.ts_micros.to_be_bytes());
        out.extend_from_slice(&self.ts_diff_micros.to_be_bytes());
        out.extend_from_slice(&self.wnd_size.to_be_bytes());
        out.extend_from_slice(&self.seq_nr.to_be_bytes());
        out.extend_from_slice(&self.ack_nr.to_be_bytes());
        if let Some(sack) = &self.selective_ack {
            // Extension entry: next-extension id, length, bitmap.
            out.push(0);
            out.push(SACK_LEN as u8);
            out.extend_from_slice(&sack.bitmap);
        }
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self, PacketError> {
        if raw.len() < HEADER_LEN {
            return Err(PacketError::Truncated);
        }
        let version = raw[0] & 0x0F;
        if version != UTP_VERSION {
            return Err(PacketError::UnknownVersion(version));
        }
        let type_nibble = raw[0] >> 4;
        let packet_type =
            PacketType::from_nibble(type_nibble).ok_or(PacketError::UnknownType(type_nibble))?;

        let be16 = |i: usize| u16::from_be_bytes([raw[i], raw[i + 1]]);
        let be32 = |i: usize| u32::from_be_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);

        let mut selective_ack = None;
        let mut cursor = HEADER_LEN;
        let mut next_ext = raw[1];
        while next_ext != 0 {
            if cursor + 2 > raw.len() {
                return Err(PacketError::UnterminatedExtension);
            }
            let this_ext = next_ext;
            next_ext = raw[cursor];
            let len = raw[cursor + 1] as usize;
            cursor += 2;
            if cursor + len > raw.len() {
                return Err(PacketError::UnterminatedExtension);
            }
            if this_ext == EXT_SELECTIVE_ACK {
                if len != SACK_LEN {
                    return Err(PacketError::InvalidExtensionLength {
                        id: this_ext,
                        len,
                        expected: SACK_LEN,
                    });
                }
                let mut bitmap = [0u8; SACK_LEN];
                bitmap.copy_from_slice(&raw[cursor..cursor + SACK_LEN]);
                selective_ack = Some(SelectiveAck { bitmap });
            }
            // Unknown extensions are skipped; the chain itself must stay
            // well-formed.
            cursor += len;
        }

        Ok(Packet {
            packet_type,
            conn_id: be16(2),
            ts_micros: be32(4),
            ts_diff_micros: be32(8),
            wnd_size: be32(12),
            seq_nr: be16(16),
            ack_nr: be16(18),
            selective_ack,
            payload: raw[cursor..].to_vec(),
        })
    }
}
