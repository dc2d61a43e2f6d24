//! Session configuration.
//!
//! The host application persists this through its own key-value store; only
//! the player name and ports survive between sessions.

use serde::{Deserialize, Serialize};

use kestrel_netproto::constants::{DEFAULT_LAN_PORT, DEFAULT_NETPLAY_PORT};

use crate::discovery::DiscoveryConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Display name broadcast to other participants.
    pub player_name: String,

    /// Port of a hosted LAN session.
    pub lan_port: u16,

    /// Port of a hosted netplay session.
    pub netplay_port: u16,

    /// Frames of input delay for netplay (inputs at frame F apply at
    /// F + delay).
    pub input_delay: u8,

    /// LAN MP receive timeout in milliseconds.
    pub recv_timeout_ms: u32,

    pub discovery: DiscoveryConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            player_name: String::new(),
            lan_port: DEFAULT_LAN_PORT,
            netplay_port: DEFAULT_NETPLAY_PORT,
            input_delay: 4,
            recv_timeout_ms: 25,
            discovery: DiscoveryConfig::default(),
        }
    }
}
