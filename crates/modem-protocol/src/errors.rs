//! CME / CMS result code tables
//!
//! Modems report failures either as a bare `ERROR` or as
//! `+CME ERROR: <n>` (mobile equipment fault, 3GPP TS 27.007 §9.2) /
//! `+CMS ERROR: <n>` (message service fault, 3GPP TS 27.005 §3.2.5).
//! Both mappings are total: codes outside the table land in `Unknown`
//! and are carried numerically, never dropped.

use thiserror::Error;

/// Mobile equipment error (`+CME ERROR`)
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CmeError {
    #[error("phone failure")]
    PhoneFailure,
    #[error("no connection to phone")]
    NoConnection,
    #[error("phone-adaptor link reserved")]
    LinkReserved,
    #[error("operation not allowed")]
    OperationNotAllowed,
    #[error("operation not supported")]
    OperationNotSupported,
    #[error("PH-SIM PIN required")]
    PhSimPinRequired,
    #[error("SIM not inserted")]
    SimNotInserted,
    #[error("SIM PIN required")]
    SimPinRequired,
    #[error("SIM PUK required")]
    SimPukRequired,
    #[error("SIM failure")]
    SimFailure,
    #[error("SIM busy")]
    SimBusy,
    #[error("SIM wrong")]
    SimWrong,
    #[error("incorrect password")]
    IncorrectPassword,
    #[error("SIM PIN2 required")]
    SimPin2Required,
    #[error("SIM PUK2 required")]
    SimPuk2Required,
    #[error("memory full")]
    MemoryFull,
    #[error("invalid index")]
    InvalidIndex,
    #[error("not found")]
    NotFound,
    #[error("memory failure")]
    MemoryFailure,
    #[error("text string too long")]
    TextStringTooLong,
    #[error("invalid characters in text string")]
    InvalidCharsInText,
    #[error("dial string too long")]
    DialStringTooLong,
    #[error("invalid characters in dial string")]
    InvalidCharsInDialString,
    #[error("no network service")]
    NoNetworkService,
    #[error("network timeout")]
    NetworkTimeout,
    #[error("network not allowed, emergency calls only")]
    NetworkNotAllowed,
    #[error("unknown CME error {0}")]
    Unknown(u16),
}

impl CmeError {
    /// Map a numeric code to the named variant (total)
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Self::PhoneFailure,
            1 => Self::NoConnection,
            2 => Self::LinkReserved,
            3 => Self::OperationNotAllowed,
            4 => Self::OperationNotSupported,
            5 => Self::PhSimPinRequired,
            10 => Self::SimNotInserted,
            11 => Self::SimPinRequired,
            12 => Self::SimPukRequired,
            13 => Self::SimFailure,
            14 => Self::SimBusy,
            15 => Self::SimWrong,
            16 => Self::IncorrectPassword,
            17 => Self::SimPin2Required,
            18 => Self::SimPuk2Required,
            20 => Self::MemoryFull,
            21 => Self::InvalidIndex,
            22 => Self::NotFound,
            23 => Self::MemoryFailure,
            24 => Self::TextStringTooLong,
            25 => Self::InvalidCharsInText,
            26 => Self::DialStringTooLong,
            27 => Self::InvalidCharsInDialString,
            30 => Self::NoNetworkService,
            31 => Self::NetworkTimeout,
            32 => Self::NetworkNotAllowed,
            other => Self::Unknown(other),
        }
    }

    /// The numeric code this variant maps back to
    pub fn code(&self) -> u16 {
        match self {
            Self::PhoneFailure => 0,
            Self::NoConnection => 1,
            Self::LinkReserved => 2,
            Self::OperationNotAllowed => 3,
            Self::OperationNotSupported => 4,
            Self::PhSimPinRequired => 5,
            Self::SimNotInserted => 10,
            Self::SimPinRequired => 11,
            Self::SimPukRequired => 12,
            Self::SimFailure => 13,
            Self::SimBusy => 14,
            Self::SimWrong => 15,
            Self::IncorrectPassword => 16,
            Self::SimPin2Required => 17,
            Self::SimPuk2Required => 18,
            Self::MemoryFull => 20,
            Self::InvalidIndex => 21,
            Self::NotFound => 22,
            Self::MemoryFailure => 23,
            Self::TextStringTooLong => 24,
            Self::InvalidCharsInText => 25,
            Self::DialStringTooLong => 26,
            Self::InvalidCharsInDialString => 27,
            Self::NoNetworkService => 30,
            Self::NetworkTimeout => 31,
            Self::NetworkNotAllowed => 32,
            Self::Unknown(code) => *code,
        }
    }
}

/// Message service error (`+CMS ERROR`)
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CmsError {
    #[error("unassigned number")]
    UnassignedNumber,
    #[error("operator determined barring")]
    OperatorBarring,
    #[error("call barred")]
    CallBarred,
    #[error("short message transfer rejected")]
    TransferRejected,
    #[error("destination out of service")]
    DestinationOutOfService,
    #[error("unidentified subscriber")]
    UnidentifiedSubscriber,
    #[error("facility rejected")]
    FacilityRejected,
    #[error("unknown subscriber")]
    UnknownSubscriber,
    #[error("network out of order")]
    NetworkOutOfOrder,
    #[error("temporary failure")]
    TemporaryFailure,
    #[error("congestion")]
    Congestion,
    #[error("resources unavailable")]
    ResourcesUnavailable,
    #[error("ME failure")]
    MeFailure,
    #[error("SMS service of ME reserved")]
    SmsServiceReserved,
    #[error("operation not allowed")]
    OperationNotAllowed,
    #[error("operation not supported")]
    OperationNotSupported,
    #[error("invalid PDU mode parameter")]
    InvalidPduModeParameter,
    #[error("invalid text mode parameter")]
    InvalidTextModeParameter,
    #[error("SIM not inserted")]
    SimNotInserted,
    #[error("SIM PIN required")]
    SimPinRequired,
    #[error("SIM failure")]
    SimFailure,
    #[error("memory failure")]
    MemoryFailure,
    #[error("invalid memory index")]
    InvalidMemoryIndex,
    #[error("memory full")]
    MemoryFull,
    #[error("SMSC address unknown")]
    SmscAddressUnknown,
    #[error("no network service")]
    NoNetworkService,
    #[error("network timeout")]
    NetworkTimeout,
    #[error("unknown CMS error {0}")]
    Unknown(u16),
}

impl CmsError {
    /// Map a numeric code to the named variant (total)
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::UnassignedNumber,
            8 => Self::OperatorBarring,
            10 => Self::CallBarred,
            21 => Self::TransferRejected,
            27 => Self::DestinationOutOfService,
            28 => Self::UnidentifiedSubscriber,
            29 => Self::FacilityRejected,
            30 => Self::UnknownSubscriber,
            38 => Self::NetworkOutOfOrder,
            41 => Self::TemporaryFailure,
            42 => Self::Congestion,
            47 => Self::ResourcesUnavailable,
            300 => Self::MeFailure,
            301 => Self::SmsServiceReserved,
            302 => Self::OperationNotAllowed,
            303 => Self::OperationNotSupported,
            304 => Self::InvalidPduModeParameter,
            305 => Self::InvalidTextModeParameter,
            310 => Self::SimNotInserted,
            311 => Self::SimPinRequired,
            313 => Self::SimFailure,
            320 => Self::MemoryFailure,
            321 => Self::InvalidMemoryIndex,
            322 => Self::MemoryFull,
            330 => Self::SmscAddressUnknown,
            331 => Self::NoNetworkService,
            332 => Self::NetworkTimeout,
            other => Self::Unknown(other),
        }
    }

    /// The numeric code this variant maps back to
    pub fn code(&self) -> u16 {
        match self {
            Self::UnassignedNumber => 1,
            Self::OperatorBarring => 8,
            Self::CallBarred => 10,
            Self::TransferRejected => 21,
            Self::DestinationOutOfService => 27,
            Self::UnidentifiedSubscriber => 28,
            Self::FacilityRejected => 29,
            Self::UnknownSubscriber => 30,
            Self::NetworkOutOfOrder => 38,
            Self::TemporaryFailure => 41,
            Self::Congestion => 42,
            Self::ResourcesUnavailable => 47,
            Self::MeFailure => 300,
            Self::SmsServiceReserved => 301,
            Self::OperationNotAllowed => 302,
            Self::OperationNotSupported => 303,
            Self::InvalidPduModeParameter => 304,
            Self::InvalidTextModeParameter => 305,
            Self::SimNotInserted => 310,
            Self::SimPinRequired => 311,
            Self::SimFailure => 313,
            Self::MemoryFailure => 320,
            Self::InvalidMemoryIndex => 321,
            Self::MemoryFull => 322,
            Self::SmscAddressUnknown => 330,
            Self::NoNetworkService => 331,
            Self::NetworkTimeout => 332,
            Self::Unknown(code) => *code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cme_codes_round_trip() {
        for code in 0..1000u16 {
            let err = CmeError::from_code(code);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn cms_codes_round_trip() {
        for code in 0..1000u16 {
            let err = CmsError::from_code(code);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn named_variants() {
        assert_eq!(CmeError::from_code(10), CmeError::SimNotInserted);
        assert_eq!(CmeError::from_code(30), CmeError::NoNetworkService);
        assert_eq!(CmsError::from_code(322), CmsError::MemoryFull);
    }

    #[test]
    fn unknown_codes_preserved() {
        assert_eq!(CmeError::from_code(9999), CmeError::Unknown(9999));
        assert_eq!(CmsError::from_code(9999), CmsError::Unknown(9999));
    }
}
