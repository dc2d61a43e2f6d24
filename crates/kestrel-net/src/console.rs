//! The seam between the multiplayer core and the emulator.
//!
//! The emulator proper lives outside this crate. The core only needs the
//! narrow contract below: frame stepping, input injection, savestate
//! serialization, and read access to the state that feeds the desync hash.
//! Wireless MP traffic flows the other way, from the emulated radio into an
//! [`MpInterface`]: the LAN session over the network, or the in-process
//! bus when netplay clones run side by side.

use std::sync::Arc;

use thiserror::Error;

pub use kestrel_netproto::input::DsKeys;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("ROM load failed: {0}")]
    Rom(String),

    #[error("savestate serialization failed: {0}")]
    SaveState(String),

    #[error("savestate deserialization failed: {0}")]
    LoadState(String),

    #[error("save memory rejected: {0}")]
    Sram(String),
}

/// One emulated handheld.
///
/// Implementations are driven from a single thread at a time; the engine's
/// barrier discipline guarantees no instance is touched concurrently.
pub trait Console: Send {
    fn reset(&mut self);

    /// Load a ROM image and prepare it for direct boot.
    fn load_rom(&mut self, rom: &[u8]) -> Result<(), ConsoleError>;

    /// Run one frame. Returns the number of scanlines produced.
    fn run_frame(&mut self) -> u32;

    /// Set the key register state (bit set = button released).
    fn set_key_mask(&mut self, keys: DsKeys);

    fn touch(&mut self, x: u16, y: u16);
    fn release_touch(&mut self);
    fn set_lid_closed(&mut self, closed: bool);

    fn save_state(&mut self) -> Result<Vec<u8>, ConsoleError>;
    fn load_state(&mut self, data: &[u8]) -> Result<(), ConsoleError>;

    /// Cart save memory, if the cart has any.
    fn sram(&self) -> Option<Vec<u8>>;
    fn set_sram(&mut self, data: &[u8]) -> Result<(), ConsoleError>;

    /// Main RAM, hashed for desync detection.
    fn main_ram(&self) -> &[u8];

    /// Both CPU register files, hashed for desync detection.
    fn cpu_registers(&self) -> [[u32; 16]; 2];

    /// Mute audio output. Non-display netplay instances run muted.
    fn set_muted(&mut self, muted: bool);

    /// Route this console's wireless MP callbacks to the given interface.
    fn attach_mp(&mut self, mp: Arc<dyn MpInterface>);
}

/// Result of a successful MP receive.
#[derive(Debug, Clone, Copy)]
pub struct MpRecv {
    /// Bytes written into the caller's buffer.
    pub len: usize,
    /// Emulated-wireless timestamp of the packet.
    pub timestamp: u64,
}

/// Wireless MP exchange, as seen from one emulated console.
///
/// Send operations return the payload length actually handed to the
/// transport (0 when inactive). Receives are bounded: `recv_packet` never
/// blocks, `recv_host_packet` and `recv_replies` wait at most the session's
/// MP receive timeout.
pub trait MpInterface: Send + Sync {
    /// Broadcast a bulk wireless frame.
    fn send_packet(&self, data: &[u8], timestamp: u64) -> usize;

    /// Broadcast a host command frame.
    fn send_cmd(&self, data: &[u8], timestamp: u64) -> usize;

    /// Send a reply to the last-seen command sender, tagged with `aid`.
    fn send_reply(&self, data: &[u8], timestamp: u64, aid: u16) -> usize;

    /// Broadcast an acknowledgment frame.
    fn send_ack(&self, data: &[u8], timestamp: u64) -> usize;

    /// Pop the next fresh packet, if any.
    fn recv_packet(&self, buf: &mut [u8]) -> Option<MpRecv>;

    /// Wait for the next command frame, bounded by the receive timeout.
    fn recv_host_packet(&self, buf: &mut [u8]) -> Option<MpRecv>;

    /// Gather reply frames whose aid is in `aidmask` and whose timestamp is
    /// within the reply window of `timestamp`. Each reply lands in its
    /// per-aid slot of `buf`; the returned mask has bit `aid` set per reply
    /// received. Returns when every connected peer has answered, the mask
    /// is satisfied, or the receive timeout expires.
    fn recv_replies(&self, buf: &mut [u8], timestamp: u64, aidmask: u16) -> u16;
}
