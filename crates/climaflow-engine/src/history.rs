/*!
 * Read-only range queries over stored records.
 */
use std::sync::Arc;

use chrono::{DateTime, Utc};

use climaflow_core::types::{Id, TimeWindow};
use climaflow_devices::ClimateMeasurement;

use crate::error::Result;
use crate::setpoint::{AuditEntry, ClimateSetpoint};
use crate::store::ClimateStore;

/// Historical query service
#[derive(Debug, Clone)]
pub struct HistoryService {
    store: Arc<dyn ClimateStore>,
}

impl HistoryService {
    /// Create a query service over `store`
    pub fn new(store: Arc<dyn ClimateStore>) -> Self {
        Self { store }
    }

    /// Measurements with `start <= timestamp < end`, oldest first
    pub async fn measurements(
        &self,
        computer_id: &Id,
        compartment_id: &Id,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ClimateMeasurement>> {
        self.store
            .measurements(computer_id, compartment_id, TimeWindow::new(start, end))
            .await
    }

    /// Setpoints whose `[active_from, active_to)` overlaps `[start, end)`,
    /// oldest first
    pub async fn setpoints(
        &self,
        computer_id: &Id,
        compartment_id: &Id,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ClimateSetpoint>> {
        let mut setpoints = self
            .store
            .setpoints(computer_id, compartment_id, TimeWindow::new(start, end))
            .await?;
        setpoints.sort_by_key(|s| s.active_from);
        Ok(setpoints)
    }

    /// Setpoint changes recorded in `[start, end)`, oldest first
    pub async fn events(
        &self,
        computer_id: &Id,
        compartment_id: &Id,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditEntry>> {
        let mut entries = self
            .store
            .audit_entries(computer_id, compartment_id, TimeWindow::new(start, end))
            .await?;
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;

    use climaflow_core::clock::Clock;
    use climaflow_core::event::EventBus;
    use climaflow_devices::{DataFlow, ParameterPath};

    use super::*;
    use crate::setpoint::{SetpointChange, SetpointWriter};
    use crate::testing::harness;

    #[tokio::test]
    async fn test_setpoint_and_event_history() {
        let h = harness(DataFlow::Bidirectional).await;
        let writer = SetpointWriter::new(
            h.registry.clone(),
            h.store.clone(),
            h.clock.clone(),
            Duration::from_secs(1),
            EventBus::new(),
        );
        let compartment = h.compartment("gh1");
        let start = h.clock.now();
        writer.active_or_import(&compartment).await.unwrap();

        h.clock.advance(ChronoDuration::hours(1));
        writer
            .write(SetpointChange::manual(
                compartment.id.clone(),
                vec![(ParameterPath::HumidityDay, 75.0)],
                "alice",
            ))
            .await
            .unwrap();

        let history = HistoryService::new(h.store.clone());
        let computer = &compartment.computer_id;

        let all = history
            .setpoints(computer, &compartment.id, start, start + ChronoDuration::hours(2))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].active_from < all[1].active_from);

        let early = history
            .setpoints(computer, &compartment.id, start, start + ChronoDuration::minutes(30))
            .await
            .unwrap();
        assert_eq!(early.len(), 1);
        assert!(!early[0].is_active);

        let events = history
            .events(computer, &compartment.id, start, start + ChronoDuration::hours(2))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].changes, vec![(ParameterPath::HumidityDay, 75.0)]);

        let other = history
            .events(&Id::from("elsewhere"), &compartment.id, start, start + ChronoDuration::hours(2))
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_reversed_range_is_normalized() {
        let h = harness(DataFlow::Bidirectional).await;
        let compartment = h.compartment("gh2");
        let history = HistoryService::new(h.store.clone());
        let now = h.clock.now();

        let found = history
            .measurements(&compartment.computer_id, &compartment.id, now, now - ChronoDuration::hours(1))
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
