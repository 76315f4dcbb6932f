//! Error taxonomy for the serial core and the CDMA codec.
//!
//! One crate-wide [`Error`] enum so callers can match on the kind without
//! digging through source chains. The split that matters operationally:
//! retryable conditions (timeouts, busy) versus never-going-to-work ones
//! (unsupported teleservice, malformed PDU).

use thiserror::Error;

/// All failures surfaced by the port, the command queue and the codecs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The device node does not exist (or vanished). Distinguished from
    /// [`Error::OpenFailed`] because some devices report this spuriously
    /// right after appearing and callers may want to retry.
    #[error("device not present: {0}")]
    DeviceNotPresent(String),

    #[error("could not open {device}: {reason}")]
    OpenFailed { device: String, reason: String },

    #[error("could not configure {device}: {reason}")]
    ConfigFailed { device: String, reason: String },

    /// Command submitted while the port has no open descriptor.
    #[error("port is not open")]
    NotOpen,

    /// Command submitted while a data session owns the byte stream.
    #[error("port is connected as a data port, commands rejected")]
    Connected,

    /// The non-blocking write retry budget ran out before the command was
    /// fully on the wire.
    #[error("sending command timed out")]
    SendTimeout,

    /// No complete response arrived within the command's timeout.
    #[error("response timed out")]
    ResponseTimeout,

    #[error("operation was cancelled")]
    Cancelled,

    /// The port was closed (or force-closed) while the command was queued.
    #[error("port was closed")]
    PortClosed,

    /// A second flash or reopen was requested while one is in flight.
    #[error("{0} already in progress")]
    InProgress(&'static str),

    #[error("flash failed: {0}")]
    FlashFailed(String),

    /// The port actor is gone; the owning task has shut down.
    #[error("port task terminated")]
    PortGone,

    /// The device answered with a final error code.
    #[error(transparent)]
    Equipment(#[from] EquipmentError),

    /// A dial attempt failed with one of the named V.250 reasons.
    #[error(transparent)]
    Connect(#[from] ConnectFailure),

    /// The capability is not implemented by this device or transport.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// PDU shorter than a declared field. Fatal on decode.
    #[error("malformed PDU: {0}")]
    MalformedPdu(&'static str),

    #[error("unsupported teleservice 0x{0:04x}")]
    UnsupportedTeleservice(u16),

    #[error("unsupported user-data encoding {0}")]
    UnsupportedEncoding(u8),

    /// A field count or length exceeded what the wire format can carry.
    #[error("{what} too long: {len} exceeds {max}")]
    TooLong {
        what: &'static str,
        len: usize,
        max: usize,
    },
}

impl Error {
    /// True for conditions where retrying the same operation later can
    /// plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DeviceNotPresent(_)
                | Error::SendTimeout
                | Error::ResponseTimeout
                | Error::InProgress(_)
                | Error::Connect(ConnectFailure::Busy)
                | Error::Connect(ConnectFailure::NoAnswer)
        )
    }
}

/// Mobile-equipment error reported by the device (`+CME ERROR: <n>`,
/// `+CMS ERROR: <n>`, or a bare `ERROR`).
///
/// The numeric table follows 3GPP TS 27.007 §9.2; codes outside the table
/// are carried through as [`EquipmentError::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EquipmentError {
    #[error("phone failure")]
    PhoneFailure,
    #[error("no connection to phone")]
    NoConnection,
    #[error("phone-adaptor link reserved")]
    LinkReserved,
    #[error("operation not allowed")]
    NotAllowed,
    #[error("operation not supported")]
    NotSupported,
    #[error("PH-SIM PIN required")]
    PhSimPin,
    #[error("SIM not inserted")]
    SimNotInserted,
    #[error("SIM PIN required")]
    SimPin,
    #[error("SIM PUK required")]
    SimPuk,
    #[error("SIM failure")]
    SimFailure,
    #[error("SIM busy")]
    SimBusy,
    #[error("SIM wrong")]
    SimWrong,
    #[error("incorrect password")]
    IncorrectPassword,
    #[error("SIM PIN2 required")]
    SimPin2,
    #[error("SIM PUK2 required")]
    SimPuk2,
    #[error("memory full")]
    MemoryFull,
    #[error("invalid index")]
    InvalidIndex,
    #[error("not found")]
    NotFound,
    #[error("memory failure")]
    MemoryFailure,
    #[error("text string too long")]
    TextTooLong,
    #[error("invalid characters in text string")]
    InvalidChars,
    #[error("dial string too long")]
    DialStringTooLong,
    #[error("invalid characters in dial string")]
    InvalidDialString,
    #[error("no network service")]
    NoNetwork,
    #[error("network timeout")]
    NetworkTimeout,
    #[error("network not allowed - emergency calls only")]
    NetworkNotAllowed,
    #[error("unknown equipment error {code}")]
    Unknown { code: u32 },
}

impl EquipmentError {
    /// Map a `+CME ERROR` numeric code to the typed kind.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::PhoneFailure,
            1 => Self::NoConnection,
            2 => Self::LinkReserved,
            3 => Self::NotAllowed,
            4 => Self::NotSupported,
            5 => Self::PhSimPin,
            10 => Self::SimNotInserted,
            11 => Self::SimPin,
            12 => Self::SimPuk,
            13 => Self::SimFailure,
            14 => Self::SimBusy,
            15 => Self::SimWrong,
            16 => Self::IncorrectPassword,
            17 => Self::SimPin2,
            18 => Self::SimPuk2,
            20 => Self::MemoryFull,
            21 => Self::InvalidIndex,
            22 => Self::NotFound,
            23 => Self::MemoryFailure,
            24 => Self::TextTooLong,
            25 => Self::InvalidChars,
            26 => Self::DialStringTooLong,
            27 => Self::InvalidDialString,
            30 => Self::NoNetwork,
            31 => Self::NetworkTimeout,
            32 => Self::NetworkNotAllowed,
            _ => Self::Unknown { code },
        }
    }
}

/// Dial failure reasons reported as bare final result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectFailure {
    #[error("no carrier")]
    NoCarrier,
    #[error("line busy")]
    Busy,
    #[error("no answer")]
    NoAnswer,
    #[error("no dial tone")]
    NoDialtone,
}
