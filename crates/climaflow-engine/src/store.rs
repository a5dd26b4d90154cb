/*!
 * Persistence seam for the engine.
 *
 * [`ClimateStore`] extends the device store with measurements, setpoint
 * history, advice and the audit log. [`InMemoryStore`] implements both
 * traits behind one lock so every call is a transaction.
 */
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use climaflow_core::types::{Id, TimeWindow};
use climaflow_devices::{
    ClimateCompartment, ClimateComputer, ClimateMeasurement, ConnectionStatus, DeviceError, DeviceStore,
};

use crate::advisory::{AdviceStatus, ControlAdvice};
use crate::error::{Error, Result};
use crate::setpoint::{AuditEntry, ClimateSetpoint};

/// Transactional storage of engine records
#[async_trait]
pub trait ClimateStore: DeviceStore {
    /// Append one measurement; rejected for unknown computers
    async fn save_measurement(&self, measurement: &ClimateMeasurement) -> Result<()>;

    /// Append measurements, skipping timestamps already stored for the
    /// compartment; returns how many were new
    async fn save_measurements(&self, measurements: &[ClimateMeasurement]) -> Result<usize>;

    /// Measurements of one compartment inside `window`, oldest first
    async fn measurements(&self, computer_id: &Id, compartment_id: &Id, window: TimeWindow)
        -> Result<Vec<ClimateMeasurement>>;

    /// The compartment's active setpoint
    async fn active_setpoint(&self, compartment_id: &Id) -> Result<Option<ClimateSetpoint>>;

    /// Atomically close the active setpoint and append `setpoint` with its
    /// audit entry.
    ///
    /// Fails with `ConcurrentMutation` when the active setpoint is not
    /// `expected_previous` (`None` meaning no active setpoint). When
    /// `applied_advice` is given, that advice must be `accepted` and becomes
    /// `applied` in the same transaction; otherwise nothing is written.
    async fn supersede_setpoint(
        &self,
        expected_previous: Option<&Id>,
        setpoint: &ClimateSetpoint,
        audit: Option<&AuditEntry>,
        applied_advice: Option<&Id>,
    ) -> Result<()>;

    /// Setpoints whose `[active_from, active_to)` overlaps `window`
    async fn setpoints(&self, computer_id: &Id, compartment_id: &Id, window: TimeWindow)
        -> Result<Vec<ClimateSetpoint>>;

    /// Store new advice; rejected for unknown computers
    async fn save_advice(&self, advice: &ControlAdvice) -> Result<()>;

    /// Fetch advice
    async fn get_advice(&self, id: &Id) -> Result<Option<ControlAdvice>>;

    /// Move advice from `from` to `to`; `InvalidTransition` when it is not in `from`
    async fn transition_advice(&self, id: &Id, from: AdviceStatus, to: AdviceStatus) -> Result<ControlAdvice>;

    /// Every advice record of a compartment
    async fn list_advice(&self, compartment_id: &Id) -> Result<Vec<ControlAdvice>>;

    /// Audit entries of one compartment inside `window`, oldest first
    async fn audit_entries(&self, computer_id: &Id, compartment_id: &Id, window: TimeWindow)
        -> Result<Vec<AuditEntry>>;
}

#[derive(Debug, Default)]
struct State {
    computers: HashMap<Id, ClimateComputer>,
    compartments: HashMap<Id, ClimateCompartment>,
    measurements: Vec<ClimateMeasurement>,
    setpoints: Vec<ClimateSetpoint>,
    advice: HashMap<Id, ControlAdvice>,
    audit: Vec<AuditEntry>,
}

impl State {
    fn require_computer(&self, id: &Id) -> Result<()> {
        if self.computers.contains_key(id) {
            Ok(())
        } else {
            Err(Error::not_found(format!("computer {}", id)))
        }
    }
}

/// Process-local store for tests and single-node deployments
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Every setpoint ever recorded for a compartment, oldest first
    pub async fn setpoint_history(&self, compartment_id: &Id) -> Vec<ClimateSetpoint> {
        let state = self.state.read().await;
        state
            .setpoints
            .iter()
            .filter(|s| &s.compartment_id == compartment_id)
            .cloned()
            .collect()
    }

    /// Every audit entry of a compartment, oldest first
    pub async fn audit_for(&self, compartment_id: &Id) -> Vec<AuditEntry> {
        let state = self.state.read().await;
        state
            .audit
            .iter()
            .filter(|a| &a.compartment_id == compartment_id)
            .cloned()
            .collect()
    }

    /// Number of stored measurements for a compartment
    pub async fn measurement_count(&self, compartment_id: &Id) -> usize {
        let state = self.state.read().await;
        state
            .measurements
            .iter()
            .filter(|m| &m.compartment_id == compartment_id)
            .count()
    }
}

#[async_trait]
impl DeviceStore for InMemoryStore {
    async fn save_computer(&self, computer: &ClimateComputer) -> climaflow_devices::Result<()> {
        let mut state = self.state.write().await;
        state.computers.insert(computer.id.clone(), computer.clone());
        Ok(())
    }

    async fn get_computer(&self, id: &Id) -> climaflow_devices::Result<Option<ClimateComputer>> {
        Ok(self.state.read().await.computers.get(id).cloned())
    }

    async fn list_computers(&self) -> climaflow_devices::Result<Vec<ClimateComputer>> {
        Ok(self.state.read().await.computers.values().cloned().collect())
    }

    async fn delete_computer(&self, id: &Id) -> climaflow_devices::Result<()> {
        let mut state = self.state.write().await;
        state.computers.remove(id);
        state.compartments.retain(|_, c| &c.computer_id != id);
        Ok(())
    }

    async fn update_status(
        &self,
        id: &Id,
        status: ConnectionStatus,
        last_sync: Option<DateTime<Utc>>,
        last_error: Option<String>,
    ) -> climaflow_devices::Result<()> {
        let mut state = self.state.write().await;
        let computer = state
            .computers
            .get_mut(id)
            .ok_or_else(|| DeviceError::not_found(id.as_str()))?;
        computer.status = status;
        if last_sync.is_some() {
            computer.last_sync = last_sync;
        }
        computer.last_error = last_error;
        Ok(())
    }

    async fn save_compartments(
        &self,
        computer_id: &Id,
        compartments: &[ClimateCompartment],
    ) -> climaflow_devices::Result<()> {
        let mut state = self.state.write().await;
        if !state.computers.contains_key(computer_id) {
            return Err(DeviceError::not_found(computer_id.as_str()));
        }
        for compartment in compartments {
            state.compartments.insert(compartment.id.clone(), compartment.clone());
        }
        Ok(())
    }

    async fn list_compartments(&self, computer_id: &Id) -> climaflow_devices::Result<Vec<ClimateCompartment>> {
        let state = self.state.read().await;
        let mut compartments: Vec<_> = state
            .compartments
            .values()
            .filter(|c| &c.computer_id == computer_id)
            .cloned()
            .collect();
        compartments.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        Ok(compartments)
    }

    async fn get_compartment(&self, id: &Id) -> climaflow_devices::Result<Option<ClimateCompartment>> {
        Ok(self.state.read().await.compartments.get(id).cloned())
    }
}

#[async_trait]
impl ClimateStore for InMemoryStore {
    async fn save_measurement(&self, measurement: &ClimateMeasurement) -> Result<()> {
        let mut state = self.state.write().await;
        state.require_computer(&measurement.device_id)?;
        state.measurements.push(measurement.clone());
        Ok(())
    }

    async fn save_measurements(&self, measurements: &[ClimateMeasurement]) -> Result<usize> {
        let mut state = self.state.write().await;
        for measurement in measurements {
            state.require_computer(&measurement.device_id)?;
        }
        let mut added = 0;
        for measurement in measurements {
            let duplicate = state.measurements.iter().any(|m| {
                m.compartment_id == measurement.compartment_id && m.timestamp == measurement.timestamp
            });
            if !duplicate {
                state.measurements.push(measurement.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    async fn measurements(
        &self,
        computer_id: &Id,
        compartment_id: &Id,
        window: TimeWindow,
    ) -> Result<Vec<ClimateMeasurement>> {
        let state = self.state.read().await;
        let mut found: Vec<_> = state
            .measurements
            .iter()
            .filter(|m| {
                &m.device_id == computer_id && &m.compartment_id == compartment_id && window.contains(m.timestamp)
            })
            .cloned()
            .collect();
        found.sort_by_key(|m| m.timestamp);
        Ok(found)
    }

    async fn active_setpoint(&self, compartment_id: &Id) -> Result<Option<ClimateSetpoint>> {
        let state = self.state.read().await;
        Ok(state
            .setpoints
            .iter()
            .find(|s| s.is_active && &s.compartment_id == compartment_id)
            .cloned())
    }

    async fn supersede_setpoint(
        &self,
        expected_previous: Option<&Id>,
        setpoint: &ClimateSetpoint,
        audit: Option<&AuditEntry>,
        applied_advice: Option<&Id>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.require_computer(&setpoint.computer_id)?;
        if let Some(id) = applied_advice {
            let status = state
                .advice
                .get(id)
                .map(|a| a.status)
                .ok_or_else(|| Error::not_found(format!("advice {}", id)))?;
            if status != AdviceStatus::Accepted {
                return Err(Error::InvalidTransition(format!(
                    "advice {} is {}, expected {}",
                    id,
                    status,
                    AdviceStatus::Accepted
                )));
            }
        }

        let active = state
            .setpoints
            .iter()
            .position(|s| s.is_active && s.compartment_id == setpoint.compartment_id);
        let active_id = active.map(|index| &state.setpoints[index].id);
        if active_id != expected_previous {
            return Err(Error::concurrent(format!(
                "active setpoint of {} changed concurrently",
                setpoint.compartment_id
            )));
        }

        if let Some(index) = active {
            state.setpoints[index].close(setpoint.active_from);
        }
        state.setpoints.push(setpoint.clone());
        if let Some(entry) = audit {
            state.audit.push(entry.clone());
        }
        if let Some(advice) = applied_advice.and_then(|id| state.advice.get_mut(id)) {
            advice.status = AdviceStatus::Applied;
        }
        Ok(())
    }

    async fn setpoints(
        &self,
        computer_id: &Id,
        compartment_id: &Id,
        window: TimeWindow,
    ) -> Result<Vec<ClimateSetpoint>> {
        let state = self.state.read().await;
        Ok(state
            .setpoints
            .iter()
            .filter(|s| {
                &s.computer_id == computer_id
                    && &s.compartment_id == compartment_id
                    && window.overlaps(s.active_from, s.active_to)
            })
            .cloned()
            .collect())
    }

    async fn save_advice(&self, advice: &ControlAdvice) -> Result<()> {
        let mut state = self.state.write().await;
        state.require_computer(&advice.computer_id)?;
        state.advice.insert(advice.id.clone(), advice.clone());
        Ok(())
    }

    async fn get_advice(&self, id: &Id) -> Result<Option<ControlAdvice>> {
        Ok(self.state.read().await.advice.get(id).cloned())
    }

    async fn transition_advice(&self, id: &Id, from: AdviceStatus, to: AdviceStatus) -> Result<ControlAdvice> {
        let mut state = self.state.write().await;
        let advice = state
            .advice
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("advice {}", id)))?;
        if advice.status != from {
            return Err(Error::InvalidTransition(format!(
                "advice {} is {}, expected {}",
                id, advice.status, from
            )));
        }
        advice.status = to;
        Ok(advice.clone())
    }

    async fn list_advice(&self, compartment_id: &Id) -> Result<Vec<ControlAdvice>> {
        let state = self.state.read().await;
        let mut found: Vec<_> = state
            .advice
            .values()
            .filter(|a| &a.compartment_id == compartment_id)
            .cloned()
            .collect();
        found.sort_by_key(|a| a.created_at);
        Ok(found)
    }

    async fn audit_entries(
        &self,
        computer_id: &Id,
        compartment_id: &Id,
        window: TimeWindow,
    ) -> Result<Vec<AuditEntry>> {
        let state = self.state.read().await;
        Ok(state
            .audit
            .iter()
            .filter(|a| {
                &a.computer_id == computer_id && &a.compartment_id == compartment_id && window.contains(a.timestamp)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use climaflow_devices::{Brand, ConnectionDescriptor, ParameterPath, SetpointConfig};

    use super::*;
    use crate::advisory::AdvicePriority;
    use crate::setpoint::tests::t0;
    use crate::setpoint::SetpointSource;

    async fn seeded() -> (InMemoryStore, ClimateCompartment) {
        let store = InMemoryStore::new();
        let computer = ClimateComputer::new("A", Brand::VendorA, ConnectionDescriptor::http("localhost", 80))
            .with_id("dev");
        store.save_computer(&computer).await.unwrap();
        let compartment = ClimateCompartment::new(computer.id.clone(), "gh1", "House 1");
        store
            .save_compartments(&computer.id, std::slice::from_ref(&compartment))
            .await
            .unwrap();
        (store, compartment)
    }

    fn measurement(compartment: &ClimateCompartment, at: DateTime<Utc>) -> ClimateMeasurement {
        ClimateMeasurement {
            device_id: compartment.computer_id.clone(),
            compartment_id: compartment.id.clone(),
            timestamp: at,
            temperature: 21.0,
            humidity: 70.0,
            co2: 600.0,
            light: 200.0,
            vpd: 0.75,
            dew_point: 15.3,
            heating_active: false,
            cooling_active: false,
            humidification_active: false,
            dehumidification_active: false,
            co2_dosing_active: false,
            lights_active: true,
            screen_position: None,
        }
    }

    #[tokio::test]
    async fn test_supersede_checks_expected_previous() {
        let (store, compartment) = seeded().await;
        let first = ClimateSetpoint::new(&compartment, SetpointConfig::default(), t0(), SetpointSource::Controller);
        store.supersede_setpoint(None, &first, None, None).await.unwrap();

        let second = ClimateSetpoint::new(
            &compartment,
            SetpointConfig::default(),
            t0() + Duration::minutes(5),
            SetpointSource::Manual,
        );
        let err = store.supersede_setpoint(None, &second, None, None).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentMutation(_)));

        store
            .supersede_setpoint(Some(&first.id), &second, None, None)
            .await
            .unwrap();
        let history = store.setpoint_history(&compartment.id).await;
        assert_eq!(history.len(), 2);
        assert!(!history[0].is_active);
        assert_eq!(history[0].active_to, Some(second.active_from));
        assert!(history[1].is_active);
    }

    #[tokio::test]
    async fn test_supersede_settles_only_claimed_advice() {
        let (store, compartment) = seeded().await;
        let first = ClimateSetpoint::new(&compartment, SetpointConfig::default(), t0(), SetpointSource::Controller);
        store.supersede_setpoint(None, &first, None, None).await.unwrap();

        let advice = ControlAdvice {
            id: Id::from("adv-1"),
            computer_id: compartment.computer_id.clone(),
            compartment_id: compartment.id.clone(),
            parameter: ParameterPath::TemperatureDay,
            current_value: 26.0,
            recommended_value: 22.0,
            rationale: "too warm".into(),
            energy_impact_kwh: None,
            cost_impact: None,
            priority: AdvicePriority::High,
            auto_apply: false,
            status: AdviceStatus::Pending,
            created_at: t0(),
            expires_at: t0() + Duration::hours(1),
        };
        store.save_advice(&advice).await.unwrap();
        let second = ClimateSetpoint::new(
            &compartment,
            SetpointConfig::default(),
            t0() + Duration::minutes(5),
            SetpointSource::Advice,
        );

        let err = store
            .supersede_setpoint(Some(&first.id), &second, None, Some(&advice.id))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
        assert_eq!(store.setpoint_history(&compartment.id).await.len(), 1);

        store
            .transition_advice(&advice.id, AdviceStatus::Pending, AdviceStatus::Accepted)
            .await
            .unwrap();
        store
            .supersede_setpoint(Some(&first.id), &second, None, Some(&advice.id))
            .await
            .unwrap();
        let stored = store.get_advice(&advice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AdviceStatus::Applied);
        assert_eq!(store.setpoint_history(&compartment.id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_setpoint_range_uses_half_open_overlap() {
        let (store, compartment) = seeded().await;
        let first = ClimateSetpoint::new(&compartment, SetpointConfig::default(), t0(), SetpointSource::Controller);
        store.supersede_setpoint(None, &first, None, None).await.unwrap();
        let second = ClimateSetpoint::new(
            &compartment,
            SetpointConfig::default(),
            t0() + Duration::hours(2),
            SetpointSource::Manual,
        );
        store
            .supersede_setpoint(Some(&first.id), &second, None, None)
            .await
            .unwrap();

        let computer = &compartment.computer_id;
        let window = TimeWindow::new(t0() + Duration::hours(2), t0() + Duration::hours(3));
        let found = store.setpoints(computer, &compartment.id, window).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, second.id);

        let window = TimeWindow::new(t0() + Duration::hours(1), t0() + Duration::hours(3));
        assert_eq!(store.setpoints(computer, &compartment.id, window).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_writes_for_removed_computer_are_rejected() {
        let (store, compartment) = seeded().await;
        store.delete_computer(&compartment.computer_id).await.unwrap();

        let err = store.save_measurement(&measurement(&compartment, t0())).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(store.list_compartments(&compartment.computer_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_with_unknown_computer_stores_nothing() {
        let (store, compartment) = seeded().await;
        let mut stray = measurement(&compartment, t0() + Duration::minutes(5));
        stray.device_id = Id::from("ghost");
        let batch = vec![measurement(&compartment, t0()), stray];

        let err = store.save_measurements(&batch).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let window = TimeWindow::new(t0(), t0() + Duration::hours(1));
        let stored = store
            .measurements(&compartment.computer_id, &compartment.id, window)
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn test_backfill_skips_known_timestamps() {
        let (store, compartment) = seeded().await;
        store.save_measurement(&measurement(&compartment, t0())).await.unwrap();

        let batch = vec![
            measurement(&compartment, t0()),
            measurement(&compartment, t0() + Duration::minutes(5)),
        ];
        assert_eq!(store.save_measurements(&batch).await.unwrap(), 1);

        let window = TimeWindow::new(t0(), t0() + Duration::hours(1));
        let stored = store
            .measurements(&compartment.computer_id, &compartment.id, window)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored[0].timestamp < stored[1].timestamp);
    }

    #[tokio::test]
    async fn test_unknown_status_update_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .update_status(&Id::from("ghost"), ConnectionStatus::Connected, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotFound(_)));
    }
}
