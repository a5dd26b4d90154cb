/*!
 * ClimaFlow Engine
 *
 * This crate provides the control side of ClimaFlow: the periodic
 * synchronization of every climate computer, the advisory rules and their
 * apply/reject lifecycle, the serialized setpoint write path, historical
 * queries and outbound events.
 */

#![warn(missing_docs)]

// Re-export core types
pub use climaflow_core::prelude;

// Re-export types from climaflow_core for convenience
pub use climaflow_core::types::{Id, TimeWindow};

pub mod advisory;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod scheduler;
pub mod setpoint;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use advisory::{AdvicePriority, AdviceStatus, AdvisoryEngine, AdvisoryRules, ControlAdvice};
pub use engine::{ClimateEngine, ClimateEngineBuilder};
pub use error::{Error, Result};
pub use events::{EngineEvent, Notifier, TracingNotifier};
pub use history::HistoryService;
pub use scheduler::{SyncReport, SyncScheduler};
pub use setpoint::{AuditEntry, ClimateSetpoint, SetpointChange, SetpointSource, SetpointWriter};
pub use store::{ClimateStore, InMemoryStore};

/// ClimaFlow engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
