//! Canonical error and result types for the crate.
//!
//! This module defines the single public `MqError` surface used across the
//! engine. The taxonomy separates local configuration mistakes (detected
//! before any I/O) from transport, protocol, and per-operation failures.

use thiserror::Error;

use crate::codec::CodecError;

/// Top-level error type exposed by `mqwire`.
#[derive(Debug, Error)]
pub enum MqError {
    /// A locally detected configuration mistake (empty exchange name,
    /// unrecognised exchange type, and so on). No bytes were sent.
    #[error("configuration error: {reason}")]
    Config {
        /// Human-readable description of the mistake.
        reason: String,
    },

    /// The operation requires a role the client was not configured with.
    #[error("operation requires the {required} role")]
    Role {
        /// Name of the missing role.
        required: &'static str,
    },

    /// An error in the underlying transport (for example, a socket close).
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A framing-layer error. Always fatal to the connection.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A protocol-level violation: unexpected method reply, frame for an
    /// unknown channel, or a server-reported channel/connection error.
    #[error("protocol error: {reason}")]
    Protocol {
        /// What the peer did that the protocol forbids.
        reason: String,
    },

    /// A server-side rejection of a single request. The channel remains
    /// usable unless the server closed it.
    #[error("operation failed: {reason}")]
    Operation {
        /// Reply text reported by the server.
        reason: String,
    },

    /// The channel was closed while the operation was pending or before it
    /// could be issued.
    #[error("channel closed")]
    ChannelClosed,

    /// The connection is closed or failed; no further frames can be sent.
    #[error("connection closed")]
    ConnectionClosed,
}

impl MqError {
    /// Shorthand constructor for [`MqError::Config`].
    #[must_use]
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Shorthand constructor for [`MqError::Protocol`].
    #[must_use]
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Returns true when the error is fatal to the whole connection rather
    /// than to a single operation or channel.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Codec(_) | Self::ConnectionClosed
        )
    }
}

/// Canonical result alias used by `mqwire` public APIs.
pub type Result<T> = std::result::Result<T, MqError>;
