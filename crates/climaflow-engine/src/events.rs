/*!
 * Outbound engine events and the notification seam.
 *
 * The engine never calls a delivery mechanism directly: every state change
 * is published on an [`EventBus`] and a background task hands the events to
 * a [`Notifier`] without waiting on it.
 */
use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use climaflow_core::event::EventBus;
use climaflow_core::types::Id;
use climaflow_devices::{ParameterPath, RegistryEvent};

use crate::advisory::AdvicePriority;
use crate::setpoint::SetpointSource;

/// Everything the engine reports to the outside world
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Device lifecycle and connection status
    Registry(RegistryEvent),
    /// A normalized measurement was stored
    MeasurementRecorded {
        /// The computer ID
        device_id: Id,
        /// The compartment ID
        compartment_id: Id,
        /// Reading time
        timestamp: DateTime<Utc>,
    },
    /// The advisory engine proposed a correction
    AdviceCreated {
        /// The advice ID
        advice_id: Id,
        /// The compartment ID
        compartment_id: Id,
        /// Target parameter
        parameter: ParameterPath,
        /// Priority
        priority: AdvicePriority,
    },
    /// Advice was written to the controller
    AdviceApplied {
        /// The advice ID
        advice_id: Id,
        /// The setpoint created by the write
        setpoint_id: Id,
    },
    /// Advice was dismissed
    AdviceRejected {
        /// The advice ID
        advice_id: Id,
    },
    /// A new active setpoint superseded the previous one
    SetpointChanged {
        /// The compartment ID
        compartment_id: Id,
        /// The new setpoint ID
        setpoint_id: Id,
        /// Who caused the change
        source: SetpointSource,
    },
    /// A sync cycle finished for every compartment
    SyncCompleted {
        /// The computer ID
        device_id: Id,
        /// Number of compartments synchronized
        compartments: usize,
    },
    /// A sync cycle failed in whole or in part
    SyncFailed {
        /// The computer ID
        device_id: Id,
        /// Failure summary
        error: String,
    },
}

impl From<RegistryEvent> for EngineEvent {
    fn from(event: RegistryEvent) -> Self {
        EngineEvent::Registry(event)
    }
}

/// Fire-and-forget delivery of engine events
pub trait Notifier: Send + Sync + Debug {
    /// Deliver one event; must not block
    fn send(&self, event: &EngineEvent);
}

/// Notifier that writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn send(&self, event: &EngineEvent) {
        match event {
            EngineEvent::SyncFailed { device_id, error } => {
                warn!(device_id = %device_id, "Sync failed: {}", error)
            }
            EngineEvent::AdviceApplied { advice_id, setpoint_id } => {
                info!(advice_id = %advice_id, setpoint_id = %setpoint_id, "Advice applied")
            }
            EngineEvent::SetpointChanged {
                compartment_id,
                setpoint_id,
                source,
            } => info!(
                compartment_id = %compartment_id,
                setpoint_id = %setpoint_id,
                source = ?source,
                "Setpoint changed"
            ),
            other => debug!("Engine event: {:?}", other),
        }
    }
}

/// Forward every event on `events` to `notifier` until `token` is cancelled
pub fn spawn_notifier(
    events: &EventBus<EngineEvent>,
    notifier: Arc<dyn Notifier>,
    token: CancellationToken,
) -> JoinHandle<()> {
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = receiver.recv() => match received {
                    Ok(event) => notifier.send(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Notifier lagged, {} events dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Notifier stopped");
    })
}

/// Republish registry events on the engine bus until `token` is cancelled
pub fn bridge_registry_events(
    registry: &EventBus<RegistryEvent>,
    events: EventBus<EngineEvent>,
    token: CancellationToken,
) -> JoinHandle<()> {
    let mut receiver = registry.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = receiver.recv() => match received {
                    Ok(event) => {
                        events.publish(event.into());
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Registry bridge lagged, {} events dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}
