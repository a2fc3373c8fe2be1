//! Unified event stream for the link engine
//!
//! Everything observable about the link (boot URCs, channel lifecycle,
//! flow control, bring-up progress, errors) is emitted through a single
//! event channel, so a host application can watch one stream.

use modem_protocol::UrcKind;

use crate::bringup::BringupState;
use crate::channel::ChannelKind;

/// Unified event enum for all link activity
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Every boot URC in the required set has been observed; the modem
    /// is operational. Fires at most once per boot.
    ModemReady,

    /// An unsolicited result code was recognized
    Urc {
        /// Classified kind
        kind: UrcKind,
        /// The raw line as received
        line: String,
    },

    /// A FOTA progress line, forwarded verbatim
    FotaProgress(String),

    /// A logical channel finished its SABM/UA handshake
    ChannelOpened {
        /// Which channel
        kind: ChannelKind,
    },

    /// A logical channel was closed (DISC sent; UA may or may not have
    /// arrived)
    ChannelClosed {
        /// Which channel
        kind: ChannelKind,
    },

    /// The modem toggled flow control via an MSC frame
    FlowControl {
        /// Whether transmission is currently allowed
        allowed: bool,
    },

    /// The bring-up orchestrator advanced to a new phase
    BringupState(BringupState),

    /// Result of the end-to-end signal strength probe
    SignalQuality {
        /// RSSI per TS 27.007 +CSQ (99 = unknown)
        rssi: u8,
    },

    /// Error surfaced from a background task
    Error {
        /// Source of the error (e.g. "worker", "router")
        source: String,
        /// Error message
        message: String,
    },
}
