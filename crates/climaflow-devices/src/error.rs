/*!
 * Error type for device and adapter operations.
 */
use thiserror::Error;

use climaflow_core::error::Error as CoreError;

use crate::setpoint::ParameterPath;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Transport-level failure: the controller could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// The controller refused the credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The device has no live adapter
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// The controller answered with something we could not interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An adapter call did not finish in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Some, but not all, fields of a composite setpoint write were applied
    #[error("Partial write: {} applied, {} failed", applied.len(), failed.len())]
    PartialWrite {
        /// Parameters the controller accepted
        applied: Vec<ParameterPath>,
        /// Parameters that failed, with the reason
        failed: Vec<(ParameterPath, String)>,
    },

    /// The vendor has no mapping for this parameter
    #[error("Unsupported parameter: {0}")]
    UnsupportedParameter(String),

    /// The value cannot be encoded for the controller
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The protocol is not compiled in or not known
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The device is not registered
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The device is already registered
    #[error("Device already exists: {0}")]
    AlreadyExists(String),

    /// Data writes are disabled for the device
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The persistence collaborator failed
    #[error("Store error: {0}")]
    Store(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new connection error
    pub fn connection<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Connection(msg.as_ref().to_string())
    }

    /// Create a new protocol error
    pub fn protocol<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Protocol(msg.as_ref().to_string())
    }

    /// Create a new not found error
    pub fn not_found<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::NotFound(msg.as_ref().to_string())
    }

    /// Create a new store error
    pub fn store<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Store(msg.as_ref().to_string())
    }

    /// Whether the error means the controller is unreachable or refused us
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            DeviceError::Connection(_)
                | DeviceError::Authentication(_)
                | DeviceError::Timeout(_)
                | DeviceError::NotConnected(_)
        ) || matches!(self, DeviceError::Core(CoreError::Timeout(_)))
    }
}

impl From<reqwest::Error> for DeviceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeviceError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            DeviceError::Connection(err.to_string())
        } else if err.is_decode() {
            DeviceError::Protocol(format!("Malformed response: {}", err))
        } else {
            DeviceError::Connection(err.to_string())
        }
    }
}

impl From<url::ParseError> for DeviceError {
    fn from(err: url::ParseError) -> Self {
        DeviceError::Connection(format!("Invalid controller address: {}", err))
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => DeviceError::Timeout(err.to_string()),
            _ => DeviceError::Connection(err.to_string()),
        }
    }
}
