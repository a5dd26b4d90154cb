/*!
 * Setpoint history and the serialized write path.
 *
 * A compartment has at most one active [`ClimateSetpoint`]; every change
 * closes the active row and appends a new one together with an
 * [`AuditEntry`]. [`SetpointWriter`] is the only code that performs this
 * mutation, and it admits one in-flight write per compartment.
 */
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use climaflow_core::clock::SharedClock;
use climaflow_core::event::EventBus;
use climaflow_core::types::Id;
use climaflow_devices::{ClimateCompartment, DeviceRegistry, ParameterPath, SetpointConfig};

use crate::error::{bounded, Error, Result};
use crate::events::EngineEvent;
use crate::store::ClimateStore;

/// Who caused a setpoint row to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetpointSource {
    /// A person changed the targets
    Manual,
    /// Approved or auto-applied advice
    Advice,
    /// Imported from the controller's own configuration
    Controller,
}

/// A time-bounded target configuration for one compartment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClimateSetpoint {
    /// Setpoint ID
    pub id: Id,
    /// Owning computer
    pub computer_id: Id,
    /// Target compartment
    pub compartment_id: Id,
    /// The targets
    #[serde(flatten)]
    pub config: SetpointConfig,
    /// Start of validity
    pub active_from: DateTime<Utc>,
    /// End of validity, set when superseded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_to: Option<DateTime<Utc>>,
    /// Whether this is the compartment's current setpoint
    pub is_active: bool,
    /// Origin of the row
    pub source: SetpointSource,
}

impl ClimateSetpoint {
    /// A new active setpoint starting at `at`
    pub fn new(
        compartment: &ClimateCompartment,
        config: SetpointConfig,
        at: DateTime<Utc>,
        source: SetpointSource,
    ) -> Self {
        Self {
            id: Id::new(),
            computer_id: compartment.computer_id.clone(),
            compartment_id: compartment.id.clone(),
            config,
            active_from: at,
            active_to: None,
            is_active: true,
            source,
        }
    }

    /// Close the validity window at `at`
    pub fn close(&mut self, at: DateTime<Utc>) {
        self.is_active = false;
        self.active_to = Some(at);
    }
}

/// One row of the setpoint change log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Entry ID
    pub id: Id,
    /// Owning computer
    pub computer_id: Id,
    /// Target compartment
    pub compartment_id: Id,
    /// Setpoint that was superseded, if any
    pub previous_setpoint_id: Option<Id>,
    /// Setpoint created by the change
    pub setpoint_id: Id,
    /// Parameters written, with their new values
    pub changes: Vec<(ParameterPath, f64)>,
    /// Origin of the change
    pub source: SetpointSource,
    /// User name, or the automatic actor
    pub actor: String,
    /// Advice that caused the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice_id: Option<Id>,
    /// When the change was recorded
    pub timestamp: DateTime<Utc>,
}

/// A request to change the targets of one compartment
#[derive(Debug, Clone)]
pub struct SetpointChange {
    /// Target compartment
    pub compartment_id: Id,
    /// Parameters to write
    pub changes: Vec<(ParameterPath, f64)>,
    /// Origin of the change
    pub source: SetpointSource,
    /// Who asked for it
    pub actor: String,
    /// Advice being applied
    pub advice_id: Option<Id>,
}

impl SetpointChange {
    /// A change requested by a person
    pub fn manual<A: Into<String>>(compartment_id: Id, changes: Vec<(ParameterPath, f64)>, actor: A) -> Self {
        Self {
            compartment_id,
            changes,
            source: SetpointSource::Manual,
            actor: actor.into(),
            advice_id: None,
        }
    }
}

/// Serializes setpoint mutations per compartment
#[derive(Debug)]
pub struct SetpointWriter {
    registry: Arc<DeviceRegistry>,
    store: Arc<dyn ClimateStore>,
    clock: SharedClock,
    timeout: Duration,
    events: EventBus<EngineEvent>,
    locks: Mutex<HashMap<Id, Arc<AsyncMutex<()>>>>,
}

impl SetpointWriter {
    /// Create a writer
    pub fn new(
        registry: Arc<DeviceRegistry>,
        store: Arc<dyn ClimateStore>,
        clock: SharedClock,
        timeout: Duration,
        events: EventBus<EngineEvent>,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            timeout,
            events,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, compartment_id: &Id) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| Error::store("setpoint lock table poisoned"))?;
        Ok(locks
            .entry(compartment_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }

    /// The compartment's active setpoint, importing the controller's own
    /// configuration when none has been recorded yet
    pub async fn active_or_import(&self, compartment: &ClimateCompartment) -> Result<ClimateSetpoint> {
        if let Some(active) = self.store.active_setpoint(&compartment.id).await? {
            return Ok(active);
        }

        let adapter = self.registry.adapter(&compartment.computer_id)?;
        let raw = bounded(
            self.timeout,
            "read setpoint",
            adapter.read_setpoint(&compartment.external_id),
        )
        .await?;
        let imported = ClimateSetpoint::new(
            compartment,
            SetpointConfig::from_parameters(&raw),
            self.clock.now(),
            SetpointSource::Controller,
        );

        match self.store.supersede_setpoint(None, &imported, None, None).await {
            Ok(()) => {
                debug!(compartment_id = %compartment.id, "Imported controller setpoint");
                Ok(imported)
            }
            // Someone else recorded a setpoint first; theirs wins.
            Err(Error::ConcurrentMutation(_)) => self
                .store
                .active_setpoint(&compartment.id)
                .await?
                .ok_or_else(|| Error::concurrent(format!("setpoint of {} changed during import", compartment.id))),
            Err(e) => Err(e),
        }
    }

    /// Write `change` to the controller and record the superseding setpoint.
    ///
    /// Fails with `ConcurrentMutation` while another write for the same
    /// compartment is in flight. The store is only touched after the
    /// controller accepted every field.
    pub async fn write(&self, change: SetpointChange) -> Result<ClimateSetpoint> {
        if change.changes.is_empty() {
            return Err(Error::validation("setpoint change has no parameters"));
        }

        let lock = self.lock_for(&change.compartment_id)?;
        let _guard = lock.try_lock_owned().map_err(|_| {
            Error::concurrent(format!(
                "a setpoint write for {} is already in progress",
                change.compartment_id
            ))
        })?;

        let compartment = self
            .store
            .get_compartment(&change.compartment_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("compartment {}", change.compartment_id)))?;
        let computer = self.registry.get(&compartment.computer_id)?;
        if !computer.data_flow.allows_write() {
            return Err(Error::PermissionDenied(format!(
                "computer {} does not accept setpoint writes",
                computer.id
            )));
        }

        let previous = self.active_or_import(&compartment).await?;
        let adapter = self.registry.adapter(&computer.id)?;

        let report = tokio::time::timeout(
            self.timeout,
            adapter.write_setpoints(&compartment.external_id, &change.changes),
        )
        .await
        .map_err(|_| Error::Timeout(format!("setpoint write to {} timed out", compartment.id)))?;
        if let Err(e) = report.into_result() {
            warn!(
                compartment_id = %compartment.id,
                "Setpoint write failed: {}", e
            );
            return Err(Error::from_write(compartment.id.as_str(), e));
        }

        let now = self.clock.now();
        let next = ClimateSetpoint::new(
            &compartment,
            previous.config.with_changes(&change.changes),
            now,
            change.source,
        );
        let audit = AuditEntry {
            id: Id::new(),
            computer_id: computer.id.clone(),
            compartment_id: compartment.id.clone(),
            previous_setpoint_id: Some(previous.id.clone()),
            setpoint_id: next.id.clone(),
            changes: change.changes,
            source: change.source,
            actor: change.actor,
            advice_id: change.advice_id,
            timestamp: now,
        };
        self.store
            .supersede_setpoint(Some(&previous.id), &next, Some(&audit), audit.advice_id.as_ref())
            .await?;

        info!(
            compartment_id = %compartment.id,
            setpoint_id = %next.id,
            actor = %audit.actor,
            "Setpoint superseded"
        );
        self.events.publish(EngineEvent::SetpointChanged {
            compartment_id: compartment.id.clone(),
            setpoint_id: next.id.clone(),
            source: next.source,
        });
        Ok(next)
    }
}
