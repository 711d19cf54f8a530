use thiserror::Error;

/// Errors surfaced by the command-execution core.
///
/// Every variant carries a stable machine-readable kind (see [`ConnectError::kind`]);
/// callers are expected to branch on the kind, never on the message text.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// A request field is missing or has the wrong shape. Raised before any
    /// device or UI interaction takes place.
    #[error("Parameter \"{name}\" is invalid. \"{expected}\" expected.")]
    InvalidParameter { name: String, expected: String },

    /// The request's coin/network could not be resolved.
    #[error("Coin info not found")]
    NoCoinInfo,

    /// The requested operation name is not part of the method registry.
    #[error("Method {0} not found")]
    MethodNotFound(String),

    /// The user declined a permission, confirmation or firmware override.
    #[error("Permissions not granted")]
    PermissionsNotGranted,

    /// The connected device has no firmware installed.
    #[error("Firmware not installed")]
    FirmwareNotInstalled,

    /// The requested operation is not supported on this device generation.
    #[error("Firmware not supported")]
    FirmwareNotSupported,

    /// The device firmware is older than the minimum required version.
    #[error("Firmware upgrade required")]
    FirmwareOld,

    /// The device firmware is newer than the tested range and no interactive
    /// surface was available to ask for an override.
    #[error("Firmware not compatible")]
    FirmwareNotCompatible,

    /// The device derived a different address than the caller supplied.
    /// Security relevant: the device does not hold the key the caller
    /// believes it does.
    #[error("Addresses do not match")]
    AddressMismatch,

    /// A targeted discovery completed without finding the requested account.
    #[error("Account not found")]
    AccountNotFound,

    /// Device communication failure. Fatal for the current method.
    #[error("Device error: {0}")]
    Device(String),

    /// Backend (blockchain index) failure. Fatal for the current method.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The UI surface channel was closed while a decision was pending.
    #[error("UI surface unavailable")]
    UiClosed,

    /// `Discovery::start` was called on a session that is already running.
    #[error("Discovery already running")]
    DiscoveryAlreadyRunning,
}

impl ConnectError {
    pub fn invalid_parameter(name: impl Into<String>, expected: impl Into<String>) -> Self {
        ConnectError::InvalidParameter {
            name: name.into(),
            expected: expected.into(),
        }
    }

    /// Stable error code for caller-side branching.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectError::InvalidParameter { .. } => "invalid_parameter",
            ConnectError::NoCoinInfo => "no_coin_info",
            ConnectError::MethodNotFound(_) => "method_not_found",
            ConnectError::PermissionsNotGranted => "permissions_not_granted",
            ConnectError::FirmwareNotInstalled => "firmware_not_installed",
            ConnectError::FirmwareNotSupported => "firmware_not_supported",
            ConnectError::FirmwareOld => "firmware_old",
            ConnectError::FirmwareNotCompatible => "firmware_not_compatible",
            ConnectError::AddressMismatch => "address_mismatch",
            ConnectError::AccountNotFound => "account_not_found",
            ConnectError::Device(_) => "device",
            ConnectError::Backend(_) => "backend",
            ConnectError::UiClosed => "ui_closed",
            ConnectError::DiscoveryAlreadyRunning => "discovery_already_running",
        }
    }
}

pub type Result<T, E = ConnectError> = std::result::Result<T, E>;
