//! Shared error types for the peerlink driver.

use crate::config::ConfigError;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from the transport and framing layers.
#[derive(Debug, Error)]
pub enum WireError {
    /// An I/O error on a socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame body could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote end closed the connection between frames.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A frame exceeded the configured size limit.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Size of the offending frame body.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// The remote speaks a different framing version.
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Our protocol version.
        local: u32,
        /// The version carried by the frame.
        remote: u32,
    },

    /// A peer address that the socket layer cannot dial.
    #[error("Unsupported address: {0}")]
    UnsupportedAddress(String),

    /// A destination with no registered address.
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// The local receiving address could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// Dialling a peer did not complete in time.
    #[error("Connecting to {address} timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// The peer address being dialled.
        address: String,
        /// The configured timeout.
        timeout_ms: u64,
    },

    /// The driver configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The inbound channel is gone (driver closed).
    #[error("Inbound channel closed")]
    ChannelClosed,
}

/// Alias for Result with WireError.
pub type WireResult<T> = Result<T, WireError>;
