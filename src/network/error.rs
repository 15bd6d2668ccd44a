//! Network error types

use thiserror::Error;

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Signaling error: {0}")]
    SignalingError(String),

    #[error("STUN error: {0}")]
    StunFailed(String),

    #[error("Invalid packet")]
    InvalidPacket,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}
