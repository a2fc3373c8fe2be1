//! Logical channel identities
//!
//! The multiplexer carries four fixed channels. The control channel
//! (DLCI 0) is owned by the link engine itself; the others carry
//! application traffic.

/// The logical channels carried over the multiplexed link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ChannelKind {
    /// DLCI 0: mux control messages (MSC, CLD). Never user-visible.
    Control,
    /// DLCI 1: unsolicited notifications from the modem
    Notifications,
    /// DLCI 2: AT command request/response traffic
    Commands,
    /// DLCI 3: bulk data
    Data,
}

impl ChannelKind {
    /// The DLCI this channel occupies on the wire
    pub fn dlci(&self) -> u8 {
        match self {
            ChannelKind::Control => 0,
            ChannelKind::Notifications => 1,
            ChannelKind::Commands => 2,
            ChannelKind::Data => 3,
        }
    }

    /// Map a wire DLCI back to a channel, if it is one of ours
    pub fn from_dlci(dlci: u8) -> Option<ChannelKind> {
        match dlci {
            0 => Some(ChannelKind::Control),
            1 => Some(ChannelKind::Notifications),
            2 => Some(ChannelKind::Commands),
            3 => Some(ChannelKind::Data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlci_mapping_round_trips() {
        for kind in [
            ChannelKind::Control,
            ChannelKind::Notifications,
            ChannelKind::Commands,
            ChannelKind::Data,
        ] {
            assert_eq!(ChannelKind::from_dlci(kind.dlci()), Some(kind));
        }
        assert_eq!(ChannelKind::from_dlci(4), None);
        assert_eq!(ChannelKind::from_dlci(61), None);
    }
}
