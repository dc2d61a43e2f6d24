//! Wire formats for the kestrel multiplayer core.
//!
//! Everything here is pure data: fixed little-endian layouts, byte-tagged
//! command enums and their codecs. No sockets, no threads. The layouts are
//! locked by tests; bump [`constants::PROTOCOL_VERSION`] for any breaking
//! change.

pub mod constants;
pub mod discovery;
pub mod error;
pub mod input;
pub mod lan;
pub mod mp;
pub mod netplay;
pub mod player;

pub use error::ProtoError;
