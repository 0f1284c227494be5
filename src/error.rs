use std::time::Duration;

use thiserror::Error;

use crate::status::ConnectionInfo;

#[derive(Debug, Error)]
pub enum PeerError {
    /// The timer won the handshake race. The session is left `failed`;
    /// calling `connect()` again starts a fresh attempt.
    #[error("peer connection timeout ({session}) after {timeout:?}")]
    HandshakeTimeout {
        session: ConnectionInfo,
        timeout: Duration,
    },

    /// A newer handshake attempt replaced this one before it settled.
    #[error("peer handshake aborted ({session})")]
    HandshakeAborted { session: ConnectionInfo },

    #[error("envelope encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, PeerError>;
