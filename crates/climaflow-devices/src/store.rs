/*!
 * Persistence seam for computers and compartments.
 */
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use climaflow_core::types::Id;

use crate::device::{ClimateCompartment, ClimateComputer, ConnectionStatus};
use crate::error::Result;

/// Transactional storage of device records
#[async_trait]
pub trait DeviceStore: Send + Sync + Debug {
    /// Insert or replace a computer
    async fn save_computer(&self, computer: &ClimateComputer) -> Result<()>;

    /// Fetch a computer
    async fn get_computer(&self, id: &Id) -> Result<Option<ClimateComputer>>;

    /// Every stored computer
    async fn list_computers(&self) -> Result<Vec<ClimateComputer>>;

    /// Delete a computer and its compartments
    async fn delete_computer(&self, id: &Id) -> Result<()>;

    /// Update status fields only; fails with `NotFound` for unknown ids
    async fn update_status(
        &self,
        id: &Id,
        status: ConnectionStatus,
        last_sync: Option<DateTime<Utc>>,
        last_error: Option<String>,
    ) -> Result<()>;

    /// Replace the compartment catalog of a computer
    async fn save_compartments(&self, computer_id: &Id, compartments: &[ClimateCompartment]) -> Result<()>;

    /// Compartments of a computer
    async fn list_compartments(&self, computer_id: &Id) -> Result<Vec<ClimateCompartment>>;

    /// Fetch one compartment
    async fn get_compartment(&self, id: &Id) -> Result<Option<ClimateCompartment>>;
}
