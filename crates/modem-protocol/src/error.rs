//! Error types for protocol parsing

use thiserror::Error;

/// Errors that can occur while parsing wire data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Frame structure does not hold together
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Control byte does not name a known frame type
    #[error("unknown control byte: 0x{0:02X}")]
    InvalidControl(u8),

    /// Frame check sequence failed
    #[error("FCS mismatch on DLCI {dlci}")]
    FcsMismatch { dlci: u8 },
}
