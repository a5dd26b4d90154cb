/*!
 * Prelude module for ClimaFlow Core.
 *
 * This module re-exports commonly used types and functions from the ClimaFlow Core crate
 * to make them easier to import.
 */

pub use crate::clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use crate::config::{AdvisoryConfig, Config, ConfigBuilder, SharedConfig, SyncConfig, VpdBands};
pub use crate::error::{Error, Result};
pub use crate::event::EventBus;
pub use crate::types::{Id, TimeWindow};
pub use crate::utils::{backoff_delay, with_timeout};

pub use tracing::{debug, error, info, trace, warn};

