//! The wireless MP packet header exchanged on the MP channel.
//!
//! The payload is an emulated-wireless frame and stays opaque to the core.

use crate::constants::{MP_MAGIC, MP_PAYLOAD_MAX};
use crate::error::ProtoError;

/// Wire size of the MP packet header.
pub const MP_HEADER_LEN: usize = 24;

/// Sub-kind of an MP packet, packed into the header's type field.
///
/// The low 16 bits select the kind; for replies the high 16 bits carry the
/// responder's association id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpKind {
    /// Bulk wireless frame.
    Frame,
    /// Host command frame.
    Cmd,
    /// Client reply to a command, tagged with the responder aid.
    Reply { aid: u16 },
    /// Acknowledgment frame.
    Ack,
}

impl MpKind {
    pub fn to_type_field(self) -> u32 {
        match self {
            MpKind::Frame => 0,
            MpKind::Cmd => 1,
            MpKind::Reply { aid } => 2 | (u32::from(aid) << 16),
            MpKind::Ack => 3,
        }
    }

    pub fn from_type_field(v: u32) -> Result<Self, ProtoError> {
        match v & 0xFFFF {
            0 => Ok(MpKind::Frame),
            1 => Ok(MpKind::Cmd),
            2 => Ok(MpKind::Reply {
                aid: (v >> 16) as u16,
            }),
            3 => Ok(MpKind::Ack),
            _ => Err(ProtoError::FieldRange("mp packet type")),
        }
    }

    pub fn is_cmd(self) -> bool {
        matches!(self, MpKind::Cmd)
    }

    pub fn is_reply(self) -> bool {
        matches!(self, MpKind::Reply { .. })
    }
}

/// MP packet header.
///
/// Wire layout (24 bytes, little-endian):
/// - 0..4   magic ("NIFI")
/// - 4..8   sender player id
/// - 8..12  type field (see [`MpKind`])
/// - 12..16 payload length
/// - 16..24 emulated-wireless timestamp (us)
///
/// The receive wall-clock used for staleness filtering is *not* part of the
/// wire format; the receive queue records it beside the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpHeader {
    pub sender_id: u32,
    pub kind: MpKind,
    pub length: u32,
    pub timestamp: u64,
}

impl MpHeader {
    pub fn encode_into(&self, out: &mut [u8; MP_HEADER_LEN]) {
        out[0..4].copy_from_slice(&MP_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.sender_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.kind.to_type_field().to_le_bytes());
        out[12..16].copy_from_slice(&self.length.to_le_bytes());
        out[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
    }

    /// Decode a whole MP packet; `buf` must hold exactly header + payload.
    pub fn decode(buf: &[u8]) -> Result<(MpHeader, &[u8]), ProtoError> {
        if buf.len() < MP_HEADER_LEN {
            return Err(ProtoError::TooShort);
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().expect("slice length is 4"));
        if magic != MP_MAGIC {
            return Err(ProtoError::BadMagic);
        }
        let sender_id = u32::from_le_bytes(buf[4..8].try_into().expect("slice length is 4"));
        let kind = MpKind::from_type_field(u32::from_le_bytes(
            buf[8..12].try_into().expect("slice length is 4"),
        ))?;
        let length = u32::from_le_bytes(buf[12..16].try_into().expect("slice length is 4"));
        if length as usize > MP_PAYLOAD_MAX {
            return Err(ProtoError::PayloadTooLarge(length as usize));
        }
        if buf.len() != MP_HEADER_LEN + length as usize {
            return Err(ProtoError::LengthMismatch {
                expected: MP_HEADER_LEN + length as usize,
                got: buf.len(),
            });
        }
        let timestamp = u64::from_le_bytes(buf[16..24].try_into().expect("slice length is 8"));
        Ok((
            MpHeader {
                sender_id,
                kind,
                length,
                timestamp,
            },
            &buf[MP_HEADER_LEN..],
        ))
    }
}

/// Encode a full MP packet (header + payload) into one buffer.
pub fn encode_mp_packet(sender_id: u32, kind: MpKind, timestamp: u64, payload: &[u8]) -> Vec<u8> {
    let header = MpHeader {
        sender_id,
        kind,
        length: payload.len() as u32,
        timestamp,
    };
    let mut out = vec![0u8; MP_HEADER_LEN + payload.len()];
    let mut hbuf = [0u8; MP_HEADER_LEN];
    header.encode_into(&mut hbuf);
    out[..MP_HEADER_LEN].copy_from_slice(&hbuf);
    out[MP_HEADER_LEN..].copy_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_packs_aid_in_high_bits() {
        let kind = MpKind::Reply { aid: 0x0005 };
        assert_eq!(kind.to_type_field(), 0x0005_0002);
        assert_eq!(MpKind::from_type_field(0x0005_0002).unwrap(), kind);
    }

    #[test]
    fn packet_round_trip_is_exact() {
        let pkt = encode_mp_packet(2, MpKind::Cmd, 0xDEAD_BEEF_1234, &[9, 8, 7]);
        assert_eq!(pkt.len(), MP_HEADER_LEN + 3);

        let (header, payload) = MpHeader::decode(&pkt).unwrap();
        assert_eq!(header.sender_id, 2);
        assert_eq!(header.kind, MpKind::Cmd);
        assert_eq!(header.length, 3);
        assert_eq!(header.timestamp, 0xDEAD_BEEF_1234);
        assert_eq!(payload, &[9, 8, 7]);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut pkt = encode_mp_packet(0, MpKind::Frame, 0, &[1, 2, 3, 4]);
        pkt.push(0);
        assert!(matches!(
            MpHeader::decode(&pkt),
            Err(ProtoError::LengthMismatch { .. })
        ));
        assert!(MpHeader::decode(&pkt[..MP_HEADER_LEN + 3]).is_err());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut buf = [0u8; MP_HEADER_LEN];
        MpHeader {
            sender_id: 0,
            kind: MpKind::Frame,
            length: 4096,
            timestamp: 0,
        }
        .encode_into(&mut buf);
        let mut pkt = buf.to_vec();
        pkt.resize(MP_HEADER_LEN + 4096, 0);
        assert_eq!(MpHeader::decode(&pkt), Err(ProtoError::PayloadTooLarge(4096)));
    }
}
