//! The player record carried by LAN control commands.

use crate::constants::MAX_PLAYERS;
use crate::error::ProtoError;

/// Wire size of one player record.
pub const PLAYER_WIRE_LEN: usize = 44;

/// Longest display name in bytes (a trailing NUL pads the 32-byte field).
pub const PLAYER_NAME_MAX: usize = 31;

/// Slot status of a player table entry. `None` marks an empty slot.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerStatus {
    #[default]
    None = 0,
    Client = 1,
    Host = 2,
    Connecting = 3,
    Disconnected = 4,
}

impl PlayerStatus {
    pub fn from_u8(v: u8) -> Result<Self, ProtoError> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Client),
            2 => Ok(Self::Host),
            3 => Ok(Self::Connecting),
            4 => Ok(Self::Disconnected),
            _ => Err(ProtoError::FieldRange("player status")),
        }
    }

    /// An occupied slot: anything but `None`.
    pub fn occupied(self) -> bool {
        self != Self::None
    }
}

/// One participant of a LAN session.
///
/// Wire layout (44 bytes, little-endian):
/// - 0      id
/// - 1      status
/// - 2..34  name (NUL-padded; byte 33 is forced to 0 on decode)
/// - 34..38 address (host-order IPv4)
/// - 38..40 mp_port (the port this player's transport listens on; peers
///          dial it to build the client mesh)
/// - 40..44 ping_ms
///
/// `is_local` never crosses the wire; it is set when snapshots are handed to
/// the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Player {
    pub id: u8,
    pub status: PlayerStatus,
    pub name: String,
    pub address: u32,
    pub mp_port: u16,
    pub ping_ms: u32,
    pub is_local: bool,
}

impl Player {
    pub fn encode_into(&self, out: &mut [u8; PLAYER_WIRE_LEN]) {
        out.fill(0);
        out[0] = self.id;
        out[1] = self.status as u8;
        let name = truncate_name(&self.name);
        out[2..2 + name.len()].copy_from_slice(name.as_bytes());
        out[34..38].copy_from_slice(&self.address.to_le_bytes());
        out[38..40].copy_from_slice(&self.mp_port.to_le_bytes());
        out[40..44].copy_from_slice(&self.ping_ms.to_le_bytes());
    }

    /// Decode one record from the first `PLAYER_WIRE_LEN` bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < PLAYER_WIRE_LEN {
            return Err(ProtoError::TooShort);
        }
        let id = buf[0];
        if id as usize >= MAX_PLAYERS {
            return Err(ProtoError::FieldRange("player id"));
        }
        let status = PlayerStatus::from_u8(buf[1])?;
        let raw_name = &buf[2..2 + PLAYER_NAME_MAX];
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
        let name = String::from_utf8_lossy(&raw_name[..end]).into_owned();
        let address = u32::from_le_bytes(buf[34..38].try_into().expect("slice length is 4"));
        let mp_port = u16::from_le_bytes(buf[38..40].try_into().expect("slice length is 2"));
        let ping_ms = u32::from_le_bytes(buf[40..44].try_into().expect("slice length is 4"));
        Ok(Self {
            id,
            status,
            name,
            address,
            mp_port,
            ping_ms,
            is_local: false,
        })
    }
}

/// Clamp a display name to `PLAYER_NAME_MAX` bytes on a char boundary.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= PLAYER_NAME_MAX {
        return name;
    }
    let mut end = PLAYER_NAME_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_offsets_are_locked() {
        let p = Player {
            id: 3,
            status: PlayerStatus::Client,
            name: "ada".into(),
            address: 0xC0A8_0105,
            mp_port: 7064,
            ping_ms: 17,
            is_local: true,
        };
        let mut buf = [0u8; PLAYER_WIRE_LEN];
        p.encode_into(&mut buf);

        assert_eq!(buf[0], 3);
        assert_eq!(buf[1], PlayerStatus::Client as u8);
        assert_eq!(&buf[2..5], b"ada");
        assert_eq!(buf[5], 0);
        assert_eq!(u32::from_le_bytes(buf[34..38].try_into().unwrap()), 0xC0A8_0105);
        assert_eq!(u16::from_le_bytes(buf[38..40].try_into().unwrap()), 7064);
        assert_eq!(u32::from_le_bytes(buf[40..44].try_into().unwrap()), 17);

        let back = Player::decode(&buf).unwrap();
        assert_eq!(back.name, "ada");
        assert_eq!(back.address, 0xC0A8_0105);
        assert_eq!(back.mp_port, 7064);
        // is_local is not a wire field
        assert!(!back.is_local);
    }

    #[test]
    fn name_is_clamped_to_31_bytes() {
        let p = Player {
            name: "x".repeat(64),
            ..Player::default()
        };
        let mut buf = [0u8; PLAYER_WIRE_LEN];
        p.encode_into(&mut buf);
        let back = Player::decode(&buf).unwrap();
        assert_eq!(back.name.len(), PLAYER_NAME_MAX);
    }

    #[test]
    fn multibyte_name_clamps_on_char_boundary() {
        // 16 two-byte chars = 32 bytes; must clamp to 30, not split a char.
        let name: String = "é".repeat(16);
        assert_eq!(truncate_name(&name).len(), 30);
    }

    #[test]
    fn out_of_range_fields_rejected() {
        let mut buf = [0u8; PLAYER_WIRE_LEN];
        buf[0] = 16;
        assert_eq!(Player::decode(&buf), Err(ProtoError::FieldRange("player id")));
        buf[0] = 0;
        buf[1] = 9;
        assert_eq!(
            Player::decode(&buf),
            Err(ProtoError::FieldRange("player status"))
        );
    }
}
