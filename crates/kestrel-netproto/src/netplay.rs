//! Netplay control-channel messages.

use crate::constants::{BLOB_CHUNK_SIZE, NETPLAY_MAX_PLAYERS};
use crate::error::ProtoError;

const TAG_SESSION_OFFER: u8 = 0x10;
const TAG_SESSION_ACCEPT: u8 = 0x11;
const TAG_BLOB_START: u8 = 0x12;
const TAG_BLOB_CHUNK: u8 = 0x13;
const TAG_BLOB_END: u8 = 0x14;
const TAG_SYNC_READY: u8 = 0x15;
const TAG_START_GAME: u8 = 0x16;
const TAG_DESYNC_ALERT: u8 = 0x20;
const TAG_DISCONNECT: u8 = 0xFF;

/// Purpose tag of a transferred blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobType {
    /// Cart save memory of instance 0.
    Sram,
    /// Savestate of instance `n`.
    Savestate(u8),
}

/// Number of distinct blob slots (SRAM + one savestate per instance).
pub const BLOB_TYPE_COUNT: usize = 1 + NETPLAY_MAX_PLAYERS;

impl BlobType {
    pub fn to_u8(self) -> u8 {
        match self {
            BlobType::Sram => 0,
            BlobType::Savestate(n) => 1 + n,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, ProtoError> {
        match v {
            0 => Ok(BlobType::Sram),
            n if (n as usize) < BLOB_TYPE_COUNT => Ok(BlobType::Savestate(n - 1)),
            _ => Err(ProtoError::FieldRange("blob type")),
        }
    }

    /// Dense index for per-type receiver tables.
    pub fn index(self) -> usize {
        self.to_u8() as usize
    }
}

/// Why a peer is leaving the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Normal,
    Desync,
    Error,
}

impl DisconnectReason {
    fn to_u8(self) -> u8 {
        match self {
            DisconnectReason::Normal => 0,
            DisconnectReason::Desync => 1,
            DisconnectReason::Error => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self, ProtoError> {
        match v {
            0 => Ok(DisconnectReason::Normal),
            1 => Ok(DisconnectReason::Desync),
            2 => Ok(DisconnectReason::Error),
            _ => Err(ProtoError::FieldRange("disconnect reason")),
        }
    }
}

/// Messages exchanged on the reliable control channel of a netplay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetplayMsg {
    /// `0x10`, host → client on connect.
    SessionOffer {
        rom_hash: u64,
        num_players: u8,
        input_delay: u8,
    },
    /// `0x11`, client → host.
    SessionAccept { player_id: u8 },
    /// `0x12`: begin a blob transfer of `total_len` bytes.
    BlobStart { blob_type: BlobType, total_len: u32 },
    /// `0x13`: one chunk at `offset`, at most 64 KiB of payload.
    BlobChunk { offset: u32, payload: Vec<u8> },
    /// `0x14`: end of transfer; checksum is the byte sum mod 2^32.
    BlobEnd { blob_type: BlobType, checksum: u32 },
    /// `0x15`, client → host: all join blobs applied, ready to run.
    SyncReady,
    /// `0x16`, host → client: common starting frame and input delay.
    StartGame { frame: u32, input_delay: u8 },
    /// `0x20`: state hash at a checkpoint frame.
    DesyncAlert { frame: u32, hash: u64 },
    /// `0xFF`: the sender is leaving.
    Disconnect { reason: DisconnectReason },
}

impl NetplayMsg {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            NetplayMsg::SessionOffer {
                rom_hash,
                num_players,
                input_delay,
            } => {
                let mut out = vec![TAG_SESSION_OFFER];
                out.extend_from_slice(&rom_hash.to_le_bytes());
                out.push(*num_players);
                out.push(*input_delay);
                out
            }
            NetplayMsg::SessionAccept { player_id } => vec![TAG_SESSION_ACCEPT, *player_id],
            NetplayMsg::BlobStart {
                blob_type,
                total_len,
            } => {
                let mut out = vec![TAG_BLOB_START, blob_type.to_u8()];
                out.extend_from_slice(&total_len.to_le_bytes());
                out
            }
            NetplayMsg::BlobChunk { offset, payload } => {
                debug_assert!(payload.len() <= BLOB_CHUNK_SIZE);
                let mut out = Vec::with_capacity(5 + payload.len());
                out.push(TAG_BLOB_CHUNK);
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(payload);
                out
            }
            NetplayMsg::BlobEnd {
                blob_type,
                checksum,
            } => {
                let mut out = vec![TAG_BLOB_END, blob_type.to_u8()];
                out.extend_from_slice(&checksum.to_le_bytes());
                out
            }
            NetplayMsg::SyncReady => vec![TAG_SYNC_READY],
            NetplayMsg::StartGame { frame, input_delay } => {
                let mut out = vec![TAG_START_GAME];
                out.extend_from_slice(&frame.to_le_bytes());
                out.push(*input_delay);
                out
            }
            NetplayMsg::DesyncAlert { frame, hash } => {
                let mut out = vec![TAG_DESYNC_ALERT];
                out.extend_from_slice(&frame.to_le_bytes());
                out.extend_from_slice(&hash.to_le_bytes());
                out
            }
            NetplayMsg::Disconnect { reason } => vec![TAG_DISCONNECT, reason.to_u8()],
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let (&tag, rest) = buf.split_first().ok_or(ProtoError::TooShort)?;
        match tag {
            TAG_SESSION_OFFER => {
                expect_len(rest, 10)?;
                Ok(NetplayMsg::SessionOffer {
                    rom_hash: u64::from_le_bytes(rest[0..8].try_into().expect("slice length is 8")),
                    num_players: rest[8],
                    input_delay: rest[9],
                })
            }
            TAG_SESSION_ACCEPT => {
                expect_len(rest, 1)?;
                Ok(NetplayMsg::SessionAccept { player_id: rest[0] })
            }
            TAG_BLOB_START => {
                expect_len(rest, 5)?;
                Ok(NetplayMsg::BlobStart {
                    blob_type: BlobType::from_u8(rest[0])?,
                    total_len: u32::from_le_bytes(
                        rest[1..5].try_into().expect("slice length is 4"),
                    ),
                })
            }
            TAG_BLOB_CHUNK => {
                if rest.len() < 4 {
                    return Err(ProtoError::TooShort);
                }
                let payload = rest[4..].to_vec();
                if payload.len() > BLOB_CHUNK_SIZE {
                    return Err(ProtoError::PayloadTooLarge(payload.len()));
                }
                Ok(NetplayMsg::BlobChunk {
                    offset: u32::from_le_bytes(rest[0..4].try_into().expect("slice length is 4")),
                    payload,
                })
            }
            TAG_BLOB_END => {
                expect_len(rest, 5)?;
                Ok(NetplayMsg::BlobEnd {
                    blob_type: BlobType::from_u8(rest[0])?,
                    checksum: u32::from_le_bytes(rest[1..5].try_into().expect("slice length is 4")),
                })
            }
            TAG_SYNC_READY => {
                expect_len(rest, 0)?;
                Ok(NetplayMsg::SyncReady)
            }
            TAG_START_GAME => {
                expect_len(rest, 5)?;
                Ok(NetplayMsg::StartGame {
                    frame: u32::from_le_bytes(rest[0..4].try_into().expect("slice length is 4")),
                    input_delay: rest[4],
                })
            }
            TAG_DESYNC_ALERT => {
                expect_len(rest, 12)?;
                Ok(NetplayMsg::DesyncAlert {
                    frame: u32::from_le_bytes(rest[0..4].try_into().expect("slice length is 4")),
                    hash: u64::from_le_bytes(rest[4..12].try_into().expect("slice length is 8")),
                })
            }
            TAG_DISCONNECT => {
                expect_len(rest, 1)?;
                Ok(NetplayMsg::Disconnect {
                    reason: DisconnectReason::from_u8(rest[0])?,
                })
            }
            other => Err(ProtoError::UnknownTag(other)),
        }
    }
}

fn expect_len(rest: &[u8], expected: usize) -> Result<(), ProtoError> {
    if rest.len() != expected {
        return Err(ProtoError::LengthMismatch {
            expected: expected + 1,
            got: rest.len() + 1,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_type_mapping() {
        assert_eq!(BlobType::Sram.to_u8(), 0);
        assert_eq!(BlobType::Savestate(0).to_u8(), 1);
        assert_eq!(BlobType::Savestate(3).to_u8(), 4);
        assert_eq!(BlobType::from_u8(4).unwrap(), BlobType::Savestate(3));
        assert!(BlobType::from_u8(5).is_err());
    }

    #[test]
    fn control_messages_round_trip() {
        let msgs = [
            NetplayMsg::SessionOffer {
                rom_hash: 0x1122_3344_5566_7788,
                num_players: 3,
                input_delay: 4,
            },
            NetplayMsg::SessionAccept { player_id: 1 },
            NetplayMsg::BlobStart {
                blob_type: BlobType::Savestate(1),
                total_len: 196_608,
            },
            NetplayMsg::BlobChunk {
                offset: 65_536,
                payload: vec![0xAB; 100],
            },
            NetplayMsg::BlobEnd {
                blob_type: BlobType::Savestate(1),
                checksum: 0xDEAD_00AA,
            },
            NetplayMsg::SyncReady,
            NetplayMsg::StartGame {
                frame: 0,
                input_delay: 4,
            },
            NetplayMsg::DesyncAlert {
                frame: 60,
                hash: 0x0102_0304_0506_0708,
            },
            NetplayMsg::Disconnect {
                reason: DisconnectReason::Desync,
            },
        ];
        for msg in msgs {
            assert_eq!(NetplayMsg::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn oversized_chunk_rejected() {
        let mut bytes = vec![0x13, 0, 0, 0, 0];
        bytes.extend(std::iter::repeat(0u8).take(BLOB_CHUNK_SIZE + 1));
        assert!(matches!(
            NetplayMsg::decode(&bytes),
            Err(ProtoError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn truncated_messages_rejected() {
        for msg in [
            NetplayMsg::SyncReady,
            NetplayMsg::DesyncAlert { frame: 1, hash: 2 },
        ] {
            let bytes = msg.encode();
            let mut longer = bytes.clone();
            longer.push(0);
            assert!(NetplayMsg::decode(&longer).is_err());
            if bytes.len() > 1 {
                assert!(NetplayMsg::decode(&bytes[..bytes.len() - 1]).is_err());
            }
        }
    }
}
