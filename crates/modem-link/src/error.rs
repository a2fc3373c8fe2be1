//! Error types for the link engine

use thiserror::Error;

use crate::channel::ChannelKind;

/// Errors that can occur in the link engine
#[derive(Debug, Error)]
pub enum LinkError {
    /// I/O error on the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The link worker task has shut down
    #[error("link worker is gone")]
    PortClosed,

    /// No UA/DM reply to a channel handshake within the retry budget
    #[error("handshake timeout opening {kind:?} channel after {attempts} attempts")]
    HandshakeTimeout { kind: ChannelKind, attempts: u32 },

    /// The modem answered a SABM with DM
    #[error("{kind:?} channel rejected by modem")]
    ChannelRejected { kind: ChannelKind },

    /// A channel with this DLCI is already open
    #[error("{kind:?} channel already open")]
    ChannelExists { kind: ChannelKind },

    /// Operation requires multiplexed mode
    #[error("link is not in multiplexed mode")]
    NotMultiplexed,

    /// No candidate baud rate produced a response
    #[error("modem not responding at any candidate baud rate")]
    ModemNotResponding,

    /// A bring-up phase command was rejected
    #[error("configuration failure in {phase}: {detail}")]
    ConfigurationFailure { phase: &'static str, detail: String },

    /// One-time provisioning was written; it takes effect only after a
    /// modem restart
    #[error("modem restart required to apply provisioning")]
    ModemNeedsReset,
}
