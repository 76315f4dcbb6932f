//! CDMA-specific logic: registration checking and the SMS PDU codec.

pub mod bits;
pub mod pdu;
pub mod registration;

use crate::error::Error;

/// Registration state of one CDMA technology (1x or EVDO).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CdmaRegistrationState {
    #[default]
    Unknown,
    /// Registered, home/roaming not yet determined.
    Registered,
    Home,
    Roaming,
}

impl CdmaRegistrationState {
    pub fn is_registered(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Registered => "registered",
            Self::Home => "home",
            Self::Roaming => "roaming",
        }
    }
}

/// System the call manager is currently camped on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmSystemMode {
    NoService,
    Amps,
    Cdma,
    Hdr,
    Wcdma,
}

/// Call-manager snapshot from the vendor diagnostic interface.
#[derive(Debug, Clone, Copy)]
pub struct CallManagerState {
    pub system_mode: CmSystemMode,
    /// False while the device is powering up, resetting, or offline.
    pub online: bool,
}

/// HDR (EVDO) air-link management protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdrAlmpState {
    Init,
    Idle,
    Connected,
    Other(u8),
}

/// HDR snapshot from the vendor diagnostic interface.
#[derive(Debug, Clone, Copy)]
pub struct HdrState {
    pub hybrid_mode: bool,
    pub almp_state: HdrAlmpState,
}

/// Serving-system identity from the vendor diagnostic interface.
#[derive(Debug, Clone, Copy)]
pub struct ServingSystem {
    pub sid: u32,
    pub nid: u32,
}

/// Vendor diagnostic surface used by the fast registration-check path.
///
/// Every operation defaults to unsupported; a device without the diagnostic
/// transport falls straight through to the AT-command path. The transport
/// itself (QCDM framing and friends) lives behind this trait and is not part
/// of this crate.
pub trait CdmaProbe: Send + Sync {
    fn call_manager_state(
        &self,
    ) -> impl std::future::Future<Output = Result<CallManagerState, Error>> + Send {
        async { Err(Error::Unsupported("call-manager state probe")) }
    }

    fn hdr_state(&self) -> impl std::future::Future<Output = Result<HdrState, Error>> + Send {
        async { Err(Error::Unsupported("HDR state probe")) }
    }

    fn serving_system(
        &self,
    ) -> impl std::future::Future<Output = Result<ServingSystem, Error>> + Send {
        async { Err(Error::Unsupported("serving-system probe")) }
    }

    /// Optional refinement of coarse registered states into home/roaming.
    fn detailed_registration_state(
        &self,
        _cdma1x: CdmaRegistrationState,
        _evdo: CdmaRegistrationState,
    ) -> impl std::future::Future<
        Output = Result<(CdmaRegistrationState, CdmaRegistrationState), Error>,
    > + Send {
        async { Err(Error::Unsupported("detailed registration state")) }
    }
}

/// A device with no diagnostic transport at all.
pub struct NoProbe;

impl CdmaProbe for NoProbe {}
