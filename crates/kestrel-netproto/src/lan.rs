//! LAN control-channel commands.
//!
//! On the wire each command is a single tag byte followed by a fixed-layout
//! payload. Decoding enforces exact sizes; a mismatched command is a
//! protocol violation and is dropped by the session.

use crate::constants::{LAN_MAGIC, MAX_PLAYERS, PROTOCOL_VERSION};
use crate::error::ProtoError;
use crate::player::{Player, PLAYER_WIRE_LEN};

const TAG_CLIENT_INIT: u8 = 0x01;
const TAG_PLAYER_INFO: u8 = 0x02;
const TAG_PLAYER_LIST: u8 = 0x03;
const TAG_PLAYER_CONNECT: u8 = 0x04;
const TAG_PLAYER_DISCONNECT: u8 = 0x05;

/// Total encoded size of each fixed-size command.
pub const CLIENT_INIT_LEN: usize = 11;
pub const PLAYER_INFO_LEN: usize = 9 + PLAYER_WIRE_LEN;
pub const PLAYER_LIST_LEN: usize = 2 + MAX_PLAYERS * PLAYER_WIRE_LEN;

/// Control commands of a LAN session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LanCommand {
    /// `0x01`, host → new client: session magic/version, the assigned player
    /// id and the session capacity.
    ClientInit { assigned_id: u8, max_players: u8 },
    /// `0x02`, client → host: the client's own player record.
    PlayerInfo { player: Player },
    /// `0x03`, host → all: occupied-count plus the full 16-slot table.
    PlayerList {
        num_players: u8,
        players: Box<[Player; MAX_PLAYERS]>,
    },
    /// `0x04`, any → all: the sender entered the in-game MP screen.
    PlayerConnect,
    /// `0x05`, any → all: the sender left the in-game MP screen.
    PlayerDisconnect,
}

impl LanCommand {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            LanCommand::ClientInit {
                assigned_id,
                max_players,
            } => {
                let mut out = Vec::with_capacity(CLIENT_INIT_LEN);
                out.push(TAG_CLIENT_INIT);
                out.extend_from_slice(&LAN_MAGIC.to_le_bytes());
                out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
                out.push(*assigned_id);
                out.push(*max_players);
                out
            }
            LanCommand::PlayerInfo { player } => {
                let mut out = Vec::with_capacity(PLAYER_INFO_LEN);
                out.push(TAG_PLAYER_INFO);
                out.extend_from_slice(&LAN_MAGIC.to_le_bytes());
                out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
                let mut rec = [0u8; PLAYER_WIRE_LEN];
                player.encode_into(&mut rec);
                out.extend_from_slice(&rec);
                out
            }
            LanCommand::PlayerList {
                num_players,
                players,
            } => {
                let mut out = Vec::with_capacity(PLAYER_LIST_LEN);
                out.push(TAG_PLAYER_LIST);
                out.push(*num_players);
                let mut rec = [0u8; PLAYER_WIRE_LEN];
                for player in players.iter() {
                    player.encode_into(&mut rec);
                    out.extend_from_slice(&rec);
                }
                out
            }
            LanCommand::PlayerConnect => vec![TAG_PLAYER_CONNECT],
            LanCommand::PlayerDisconnect => vec![TAG_PLAYER_DISCONNECT],
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let (&tag, rest) = buf.split_first().ok_or(ProtoError::TooShort)?;
        match tag {
            TAG_CLIENT_INIT => {
                expect_len(buf, CLIENT_INIT_LEN)?;
                check_magic_version(rest)?;
                let assigned_id = rest[8];
                let max_players = rest[9];
                if assigned_id as usize >= MAX_PLAYERS {
                    return Err(ProtoError::FieldRange("assigned id"));
                }
                if max_players as usize > MAX_PLAYERS {
                    return Err(ProtoError::FieldRange("max players"));
                }
                Ok(LanCommand::ClientInit {
                    assigned_id,
                    max_players,
                })
            }
            TAG_PLAYER_INFO => {
                expect_len(buf, PLAYER_INFO_LEN)?;
                check_magic_version(rest)?;
                let player = Player::decode(&rest[8..])?;
                Ok(LanCommand::PlayerInfo { player })
            }
            TAG_PLAYER_LIST => {
                expect_len(buf, PLAYER_LIST_LEN)?;
                let num_players = rest[0];
                if num_players as usize > MAX_PLAYERS {
                    return Err(ProtoError::FieldRange("player count"));
                }
                let mut players: Box<[Player; MAX_PLAYERS]> = Default::default();
                for (i, rec) in rest[1..].chunks_exact(PLAYER_WIRE_LEN).enumerate() {
                    players[i] = Player::decode(rec)?;
                }
                Ok(LanCommand::PlayerList {
                    num_players,
                    players,
                })
            }
            TAG_PLAYER_CONNECT => {
                expect_len(buf, 1)?;
                Ok(LanCommand::PlayerConnect)
            }
            TAG_PLAYER_DISCONNECT => {
                expect_len(buf, 1)?;
                Ok(LanCommand::PlayerDisconnect)
            }
            other => Err(ProtoError::UnknownTag(other)),
        }
    }
}

fn check_magic_version(rest: &[u8]) -> Result<(), ProtoError> {
    let magic = u32::from_le_bytes(rest[0..4].try_into().expect("slice length is 4"));
    if magic != LAN_MAGIC {
        return Err(ProtoError::BadMagic);
    }
    let version = u32::from_le_bytes(rest[4..8].try_into().expect("slice length is 4"));
    if version != PROTOCOL_VERSION {
        return Err(ProtoError::UnsupportedVersion(version));
    }
    Ok(())
}

fn expect_len(buf: &[u8], expected: usize) -> Result<(), ProtoError> {
    if buf.len() != expected {
        return Err(ProtoError::LengthMismatch {
            expected,
            got: buf.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::PlayerStatus;

    #[test]
    fn client_init_is_11_bytes() {
        let cmd = LanCommand::ClientInit {
            assigned_id: 2,
            max_players: 8,
        };
        let bytes = cmd.encode();
        assert_eq!(bytes.len(), CLIENT_INIT_LEN);
        assert_eq!(bytes[0], 0x01);
        assert_eq!(&bytes[1..5], &LAN_MAGIC.to_le_bytes());
        assert_eq!(bytes[9], 2);
        assert_eq!(bytes[10], 8);
        assert_eq!(LanCommand::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn player_list_round_trip() {
        let mut players: Box<[Player; MAX_PLAYERS]> = Default::default();
        players[0] = Player {
            id: 0,
            status: PlayerStatus::Host,
            name: "host".into(),
            address: 0x7F00_0001,
            mp_port: 7064,
            ping_ms: 0,
            is_local: false,
        };
        players[1] = Player {
            id: 1,
            status: PlayerStatus::Client,
            name: "c1".into(),
            address: 0xC0A8_0102,
            mp_port: 50211,
            ping_ms: 4,
            is_local: false,
        };
        let cmd = LanCommand::PlayerList {
            num_players: 2,
            players,
        };
        let bytes = cmd.encode();
        assert_eq!(bytes.len(), PLAYER_LIST_LEN);
        assert_eq!(LanCommand::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn size_mismatch_rejected() {
        let mut bytes = LanCommand::PlayerConnect.encode();
        bytes.push(0);
        assert!(matches!(
            LanCommand::decode(&bytes),
            Err(ProtoError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = LanCommand::ClientInit {
            assigned_id: 0,
            max_players: 2,
        }
        .encode();
        bytes[1] ^= 0xFF;
        assert_eq!(LanCommand::decode(&bytes), Err(ProtoError::BadMagic));
    }

    #[test]
    fn unknown_tag_rejected() {
        assert_eq!(LanCommand::decode(&[0x77]), Err(ProtoError::UnknownTag(0x77)));
    }
}
