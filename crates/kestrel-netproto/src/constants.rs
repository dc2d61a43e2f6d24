//! Protocol constants shared by both multiplayer subsystems.

/// Magic of the discovery beacon ("LAND" as a little-endian u32).
pub const DISCOVERY_MAGIC: u32 = 0x444E_414C;

/// Magic of the LAN control handshake ("LANP").
pub const LAN_MAGIC: u32 = 0x504E_414C;

/// Magic of a wireless MP packet header ("NIFI").
pub const MP_MAGIC: u32 = 0x4946_494E;

/// Wire-format version. Beacons and handshakes carrying any other value are
/// rejected.
pub const PROTOCOL_VERSION: u32 = 1;

/// UDP port the discovery beacon is broadcast on.
pub const DISCOVERY_PORT: u16 = 7063;

/// Default port of a LAN game session.
pub const DEFAULT_LAN_PORT: u16 = 7064;

/// Default port of a netplay session.
pub const DEFAULT_NETPLAY_PORT: u16 = 7065;

/// Fixed capacity of the LAN player table. Player ids are 0..16.
pub const MAX_PLAYERS: usize = 16;

/// Maximum participants in a netplay session (one emulator instance each).
pub const NETPLAY_MAX_PLAYERS: usize = 4;

/// 127.0.0.1 as a host-order u32. IPv4 addresses are carried as host-order
/// integers everywhere in the core; conversion happens at socket boundaries.
pub const LOCALHOST: u32 = 0x7F00_0001;

/// Chunk size used by blob transfers (64 KiB).
pub const BLOB_CHUNK_SIZE: usize = 0x10000;

/// Upper bound on a single MP packet payload.
pub const MP_PAYLOAD_MAX: usize = 2048;

/// Size of a single per-aid slot in a reply-gather buffer.
pub const REPLY_SLOT_SIZE: usize = 1024;
