//! Error types of the multiplayer core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("transport init failed: {0}")]
    TransportInit(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection timed out")]
    ConnectTimeout,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Proto(#[from] kestrel_netproto::ProtoError),

    #[error("session already active")]
    AlreadyActive,

    #[error("session is not active")]
    NotActive,

    #[error("session is full")]
    SessionFull,

    #[error("invalid player count {0}")]
    InvalidPlayerCount(usize),

    #[error("invalid player id {0}")]
    InvalidPlayerId(usize),

    #[error("blob transfer failed: {0}")]
    BlobTransfer(String),

    #[error("state transfer failed: {0}")]
    StateTransfer(String),

    #[error("console error: {0}")]
    Console(#[from] crate::console::ConsoleError),
}
