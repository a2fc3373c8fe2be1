//! Unsolicited result code classification
//!
//! URCs are modem-initiated lines recognized by fixed literal prefixes.
//! A defined subset signals boot progress; once every member of that
//! required set has been observed the modem counts as operational.

/// Kinds of unsolicited result codes the link reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UrcKind {
    /// `RDY` — mobile equipment initialization finished
    MeInitializationSuccessful,
    /// `+CFUN: 1` — full functionality available
    FullFunctionalityAvailable,
    /// `+CPIN: READY` — SIM card unlocked and usable
    SimCardReady,
    /// `+QIND: SMS DONE` — SMS subsystem initialized
    SmsInitializationComplete,
    /// `+QIND: PB DONE` — phonebook subsystem initialized
    PhonebookInitializationComplete,
    /// `+QIND: "FOTA"` — firmware-over-the-air progress report
    Fota,
    /// Anything else
    NotHandled,
}

const PREFIX_TABLE: &[(&str, UrcKind)] = &[
    ("RDY", UrcKind::MeInitializationSuccessful),
    ("+CFUN: 1", UrcKind::FullFunctionalityAvailable),
    ("+CPIN: READY", UrcKind::SimCardReady),
    ("+QIND: SMS DONE", UrcKind::SmsInitializationComplete),
    ("+QIND: PB DONE", UrcKind::PhonebookInitializationComplete),
    ("+QIND: \"FOTA\"", UrcKind::Fota),
];

impl UrcKind {
    /// Classify a complete line by prefix match
    pub fn classify(line: &str) -> UrcKind {
        let line = line.trim();
        for (prefix, kind) in PREFIX_TABLE {
            if line.starts_with(prefix) {
                return *kind;
            }
        }
        UrcKind::NotHandled
    }
}

/// Tracks the boot URCs that must all be seen before the modem counts
/// as operational.
#[derive(Debug, Default)]
pub struct ReadySet {
    me_init: bool,
    full_functionality: bool,
    sim_ready: bool,
    sms_done: bool,
    phonebook_done: bool,
    fired: bool,
}

impl ReadySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed URC. Returns true exactly once: on the
    /// observation that completes the set.
    pub fn observe(&mut self, kind: UrcKind) -> bool {
        match kind {
            UrcKind::MeInitializationSuccessful => self.me_init = true,
            UrcKind::FullFunctionalityAvailable => self.full_functionality = true,
            UrcKind::SimCardReady => self.sim_ready = true,
            UrcKind::SmsInitializationComplete => self.sms_done = true,
            UrcKind::PhonebookInitializationComplete => self.phonebook_done = true,
            UrcKind::Fota | UrcKind::NotHandled => return false,
        }
        if self.fired || !self.complete() {
            return false;
        }
        self.fired = true;
        true
    }

    fn complete(&self) -> bool {
        self.me_init
            && self.full_functionality
            && self.sim_ready
            && self.sms_done
            && self.phonebook_done
    }
}
