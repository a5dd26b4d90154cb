/*!
 * Error types for the ClimaFlow engine crate.
 */
use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use climaflow_devices::{DeviceError, ParameterPath};

/// Error type for ClimaFlow engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// Authentication or transport failure talking to a controller
    #[error("Connection error: {0}")]
    Connection(String),

    /// Some, but not all, setpoint fields were applied
    #[error("Partial write on {compartment}: {} applied, {} failed", applied.len(), failed.len())]
    PartialWrite {
        /// Compartment the write targeted
        compartment: String,
        /// Parameters the controller accepted
        applied: Vec<ParameterPath>,
        /// Parameters that failed, with the reason
        failed: Vec<(ParameterPath, String)>,
    },

    /// The advice expired before it was applied
    #[error("Stale advice: {0}")]
    StaleAdvice(String),

    /// Another setpoint mutation for the same compartment is in flight or won the race
    #[error("Concurrent mutation: {0}")]
    ConcurrentMutation(String),

    /// The advice is not in a state that allows the transition
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Setpoint writes are disabled for the device
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// The persistence collaborator failed
    #[error("Store error: {0}")]
    Store(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] climaflow_core::error::Error),
}

/// Result type for ClimaFlow engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new not found error
    pub fn not_found<S: AsRef<str>>(msg: S) -> Self {
        Error::NotFound(msg.as_ref().to_string())
    }

    /// Create a new store error
    pub fn store<S: AsRef<str>>(msg: S) -> Self {
        Error::Store(msg.as_ref().to_string())
    }

    /// Create a new concurrent mutation error
    pub fn concurrent<S: AsRef<str>>(msg: S) -> Self {
        Error::ConcurrentMutation(msg.as_ref().to_string())
    }

    /// Create a new validation error
    pub fn validation<S: AsRef<str>>(msg: S) -> Self {
        Error::Validation(msg.as_ref().to_string())
    }

    /// Whether the sync loop recovers from this error on its own.
    ///
    /// Connection and partial-write failures are logged and retried on the
    /// next tick; everything else is surfaced to the caller.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Connection(_) | Error::PartialWrite { .. } | Error::Timeout(_) => true,
            Error::Device(e) => e.is_connection_failure(),
            _ => false,
        }
    }

    /// Attach the target compartment to a device-level partial write
    pub(crate) fn from_write(compartment: &str, err: DeviceError) -> Self {
        match err {
            DeviceError::PartialWrite { applied, failed } => Error::PartialWrite {
                compartment: compartment.to_string(),
                applied,
                failed,
            },
            other => Error::from(other),
        }
    }
}

impl From<DeviceError> for Error {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Connection(msg) | DeviceError::Authentication(msg) => Error::Connection(msg),
            DeviceError::Timeout(msg) => Error::Timeout(msg),
            DeviceError::NotFound(msg) => Error::NotFound(msg),
            DeviceError::PermissionDenied(msg) => Error::PermissionDenied(msg),
            DeviceError::Store(msg) => Error::Store(msg),
            DeviceError::Core(climaflow_core::error::Error::Timeout(msg)) => Error::Timeout(msg),
            DeviceError::PartialWrite { applied, failed } => Error::PartialWrite {
                compartment: String::new(),
                applied,
                failed,
            },
            other => Error::Device(other),
        }
    }
}

/// Run an adapter call under `limit`, flattening the timeout into the taxonomy
pub(crate) async fn bounded<F, T>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = climaflow_devices::Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::Timeout(format!("{} timed out after {:?}", what, limit))),
    }
}
