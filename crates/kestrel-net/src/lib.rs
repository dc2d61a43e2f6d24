//! Multiplayer coordination core for the kestrel emulator.
//!
//! Two cooperating subsystems let several machines run synchronized copies
//! of the same handheld session:
//!
//! - [`lan`]: bridges each machine's single emulated console to a shared
//!   session, forwarding native wireless MP frames between peers.
//! - [`netplay`]: runs N cloned emulator instances in lockstep on one
//!   machine, feeding every instance the same delayed input stream and
//!   watching for divergence.
//!
//! Shared plumbing lives below both: [`transport`] (reliable multi-channel
//! messaging), [`blob`] (chunked transfers), [`discovery`] (UDP beacons),
//! [`players`] (the participant table), [`upnp`] (best-effort port
//! forwarding). The emulator itself stays outside the crate behind the
//! [`console::Console`] contract.

pub mod blob;
pub mod config;
pub mod console;
pub mod discovery;
pub mod error;
pub mod lan;
pub mod localmp;
pub mod netplay;
pub mod players;
pub mod transport;
pub mod upnp;

pub use config::NetConfig;
pub use console::{Console, ConsoleError, MpInterface, MpRecv};
pub use error::NetError;
pub use lan::LanSession;
pub use netplay::NetplayEngine;
