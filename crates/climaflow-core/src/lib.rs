/*!
 * ClimaFlow Core
 *
 * This crate provides the shared services for the ClimaFlow system:
 * configuration, logging, identifiers, the clock, the event bus and
 * async helpers used by the device and engine crates.
 */

#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use chrono;
    pub use futures;
    pub use serde;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// ClimaFlow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
