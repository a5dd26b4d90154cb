/*!
 * Device registry for ClimaFlow.
 *
 * The registry owns the arena of configured computers, their live adapter
 * handles and the handles of their sync tasks. Its status field is what every
 * other component looks at before touching a device.
 */
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use climaflow_core::error::Error as CoreError;
use climaflow_core::event::EventBus;
use climaflow_core::logging::operation_span;
use climaflow_core::types::Id;
use climaflow_core::utils::with_timeout;

use crate::device::{ClimateCompartment, ClimateComputer, ConnectionStatus};
use crate::error::{DeviceError, Result};
use crate::protocol::{AdapterOptions, AdapterProvider, ClimateAdapter};
use crate::store::DeviceStore;

/// Event types for the device registry
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A computer was registered
    DeviceAdded(Id),
    /// A computer's configuration changed
    DeviceUpdated(Id),
    /// A computer was removed
    DeviceRemoved(Id),
    /// A computer's connection status changed
    StatusChanged {
        /// The computer ID
        id: Id,
        /// The old status
        old_status: ConnectionStatus,
        /// The new status
        new_status: ConnectionStatus,
        /// Error recorded with the new status
        error: Option<String>,
    },
    /// The compartment catalog of a computer was refreshed
    CompartmentsDiscovered {
        /// The computer ID
        id: Id,
        /// Number of compartments found
        count: usize,
    },
}

#[derive(Debug)]
struct DeviceEntry {
    computer: ClimateComputer,
    adapter: Option<Arc<dyn ClimateAdapter>>,
}

#[derive(Debug)]
struct ScheduleHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Device registry
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<Id, DeviceEntry>>,
    schedules: Mutex<HashMap<Id, ScheduleHandle>>,
    store: Arc<dyn DeviceStore>,
    provider: Arc<dyn AdapterProvider>,
    options: AdapterOptions,
    discover_compartments: bool,
    events: EventBus<RegistryEvent>,
}

fn poisoned(what: &str) -> DeviceError {
    DeviceError::Core(CoreError::runtime(format!("{} lock poisoned", what)))
}

impl DeviceRegistry {
    /// Create a registry over `store`, building adapters with `provider`
    pub fn new(
        store: Arc<dyn DeviceStore>,
        provider: Arc<dyn AdapterProvider>,
        options: AdapterOptions,
    ) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            schedules: Mutex::new(HashMap::new()),
            store,
            provider,
            options,
            discover_compartments: true,
            events: EventBus::new(),
        }
    }

    /// Enable or disable compartment discovery after each connect
    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.discover_compartments = enabled;
        self
    }

    /// Publish events on `events` instead of a private bus
    pub fn with_events(mut self, events: EventBus<RegistryEvent>) -> Self {
        self.events = events;
        self
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<Id, DeviceEntry>>> {
        self.devices.read().map_err(|_| poisoned("device registry"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<Id, DeviceEntry>>> {
        self.devices.write().map_err(|_| poisoned("device registry"))
    }

    fn timeout(&self) -> Duration {
        self.options.timeout
    }

    /// Populate the arena from the store; every device starts disconnected
    pub async fn load(&self) -> Result<usize> {
        let computers = self.store.list_computers().await?;
        let mut devices = self.write()?;
        for mut computer in computers {
            computer.status = ConnectionStatus::Disconnected;
            devices.insert(
                computer.id.clone(),
                DeviceEntry {
                    computer,
                    adapter: None,
                },
            );
        }
        info!("Loaded {} climate computers", devices.len());
        Ok(devices.len())
    }

    /// Persist a new computer and try to connect it
    pub async fn add(&self, mut computer: ClimateComputer) -> Result<ConnectionStatus> {
        if self.contains(&computer.id)? {
            return Err(DeviceError::AlreadyExists(computer.id.to_string()));
        }
        computer.status = ConnectionStatus::Disconnected;
        computer.last_error = None;
        self.store.save_computer(&computer).await?;

        let id = computer.id.clone();
        {
            let mut devices = self.write()?;
            if devices.contains_key(&id) {
                return Err(DeviceError::AlreadyExists(id.to_string()));
            }
            devices.insert(
                id.clone(),
                DeviceEntry {
                    computer,
                    adapter: None,
                },
            );
        }
        self.events.publish(RegistryEvent::DeviceAdded(id.clone()));
        debug!("Registered climate computer {}", id);

        self.connect(&id).await
    }

    /// Build the adapter and authenticate.
    ///
    /// Only an unknown id is an error; any connection failure ends up in the
    /// device status instead.
    pub async fn connect(&self, id: &Id) -> Result<ConnectionStatus> {
        let computer = self.get(id)?;

        let adapter = match self.provider.create(&computer, &self.options) {
            Ok(adapter) => adapter,
            Err(e) => {
                error!("No adapter for {}: {}", id, e);
                return Ok(self
                    .settle(id, ConnectionStatus::Error, Some(e.to_string()))
                    .await);
            }
        };

        let outcome = match with_timeout(self.timeout(), adapter.authenticate())
            .instrument(operation_span("authenticate", "registry"))
            .await
        {
            Ok(result) => result,
            Err(e) => Err(DeviceError::from(e)),
        };

        if let Err(e) = outcome {
            warn!("Connecting {} failed: {}", id, e);
            return Ok(self
                .settle(id, ConnectionStatus::Error, Some(e.to_string()))
                .await);
        }

        let installed = {
            let mut devices = self.write()?;
            devices
                .get_mut(id)
                .map(|entry| entry.adapter.replace(adapter.clone()))
        };
        let Some(previous) = installed else {
            // Removed while we were authenticating.
            let _ = adapter.disconnect().await;
            return Err(DeviceError::not_found(id.to_string()));
        };
        if let Some(previous) = previous {
            if let Err(e) = previous.disconnect().await {
                debug!("Closing previous adapter of {} failed: {}", id, e);
            }
        }

        self.settle(id, ConnectionStatus::Connected, None).await;
        info!("Connected climate computer {} ({})", id, computer.brand);

        if self.discover_compartments {
            if let Err(e) = self.discover(id).await {
                warn!("Compartment discovery for {} failed: {}", id, e);
            }
        }
        Ok(ConnectionStatus::Connected)
    }

    /// Refresh the compartment catalog from the controller
    pub async fn discover(&self, id: &Id) -> Result<Vec<ClimateCompartment>> {
        let adapter = self.adapter(id)?;
        let refs = with_timeout(self.timeout(), adapter.list_compartments()).await??;
        let compartments: Vec<ClimateCompartment> = refs
            .into_iter()
            .map(|r| {
                let mut compartment = ClimateCompartment::new(id.clone(), r.external_id, r.name);
                compartment.area = r.area;
                compartment.volume = r.volume;
                compartment.crop_type = r.crop_type;
                compartment
            })
            .collect();

        self.store.save_compartments(id, &compartments).await?;
        self.events.publish(RegistryEvent::CompartmentsDiscovered {
            id: id.clone(),
            count: compartments.len(),
        });
        debug!("Discovered {} compartments on {}", compartments.len(), id);
        Ok(compartments)
    }

    /// Compartments known for a computer
    pub async fn compartments(&self, id: &Id) -> Result<Vec<ClimateCompartment>> {
        self.store.list_compartments(id).await
    }

    /// Record the outcome of a connect attempt. A store failure is logged,
    /// the in-memory status still holds `status`.
    async fn settle(&self, id: &Id, status: ConnectionStatus, error: Option<String>) -> ConnectionStatus {
        if let Err(e) = self.record_status(id, status, error, None).await {
            warn!("Recording status {} for {} failed: {}", status, id, e);
        }
        status
    }

    async fn record_status(
        &self,
        id: &Id,
        status: ConnectionStatus,
        last_error: Option<String>,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let (old_status, last_sync, error) = {
            let mut devices = self.write()?;
            let entry = devices
                .get_mut(id)
                .ok_or_else(|| DeviceError::not_found(id.to_string()))?;
            let old = entry.computer.status;
            entry.computer.status = status;
            if status != ConnectionStatus::Syncing {
                entry.computer.last_error = last_error;
            }
            if synced_at.is_some() {
                entry.computer.last_sync = synced_at;
            }
            (
                old,
                entry.computer.last_sync,
                entry.computer.last_error.clone(),
            )
        };

        self.store
            .update_status(id, status, last_sync, error.clone())
            .await?;

        if old_status != status {
            self.events.publish(RegistryEvent::StatusChanged {
                id: id.clone(),
                old_status,
                new_status: status,
                error,
            });
        }
        Ok(())
    }

    /// Mark a sync cycle as running
    pub async fn mark_syncing(&self, id: &Id) -> Result<()> {
        self.record_status(id, ConnectionStatus::Syncing, None, None).await
    }

    /// Mark a sync cycle as successful
    pub async fn mark_synced(&self, id: &Id, at: DateTime<Utc>) -> Result<()> {
        self.record_status(id, ConnectionStatus::Connected, None, Some(at))
            .await
    }

    /// Mark the device as failed with `message`
    pub async fn mark_failed<S: Into<String>>(&self, id: &Id, message: S) -> Result<()> {
        self.record_status(id, ConnectionStatus::Error, Some(message.into()), None)
            .await
    }

    /// Replace a computer's configuration.
    ///
    /// Returns `true` when the brand or connection changed; the adapter is
    /// then dropped and the device must be connected again.
    pub async fn update(&self, mut computer: ClimateComputer) -> Result<bool> {
        let existing = self.get(&computer.id)?;
        let reconnect = existing.connection_changed(&computer);
        if reconnect {
            computer.status = ConnectionStatus::Disconnected;
            computer.last_error = None;
        } else {
            computer.status = existing.status;
            computer.last_error = existing.last_error.clone();
        }
        computer.last_sync = existing.last_sync;

        self.store.save_computer(&computer).await?;

        let id = computer.id.clone();
        let dropped = {
            let mut devices = self.write()?;
            let entry = devices
                .get_mut(&id)
                .ok_or_else(|| DeviceError::not_found(id.to_string()))?;
            entry.computer = computer;
            if reconnect {
                entry.adapter.take()
            } else {
                None
            }
        };
        if let Some(adapter) = dropped {
            if let Err(e) = adapter.disconnect().await {
                debug!("Closing adapter of {} failed: {}", id, e);
            }
        }

        self.events.publish(RegistryEvent::DeviceUpdated(id.clone()));
        if reconnect && existing.status != ConnectionStatus::Disconnected {
            self.events.publish(RegistryEvent::StatusChanged {
                id: id.clone(),
                old_status: existing.status,
                new_status: ConnectionStatus::Disconnected,
                error: None,
            });
        }
        Ok(reconnect)
    }

    /// Remove a computer: stop its schedule, drop its adapter, then delete it
    pub async fn remove(&self, id: &Id) -> Result<()> {
        let known = self.contains(id)?;
        if !known && self.store.get_computer(id).await?.is_none() {
            return Err(DeviceError::not_found(id.to_string()));
        }

        self.cancel_schedule(id)?;

        let entry = self.write()?.remove(id);
        if let Some(adapter) = entry.and_then(|e| e.adapter) {
            if let Err(e) = adapter.disconnect().await {
                debug!("Closing adapter of {} failed: {}", id, e);
            }
        }

        self.store.delete_computer(id).await?;
        self.events.publish(RegistryEvent::DeviceRemoved(id.clone()));
        info!("Removed climate computer {}", id);
        Ok(())
    }

    /// Snapshot of a computer
    pub fn get(&self, id: &Id) -> Result<ClimateComputer> {
        self.read()?
            .get(id)
            .map(|entry| entry.computer.clone())
            .ok_or_else(|| DeviceError::not_found(id.to_string()))
    }

    /// Snapshots of every computer
    pub fn list(&self) -> Result<Vec<ClimateComputer>> {
        Ok(self
            .read()?
            .values()
            .map(|entry| entry.computer.clone())
            .collect())
    }

    /// Whether the computer is registered
    pub fn contains(&self, id: &Id) -> Result<bool> {
        Ok(self.read()?.contains_key(id))
    }

    /// Live adapter of a computer
    pub fn adapter(&self, id: &Id) -> Result<Arc<dyn ClimateAdapter>> {
        let devices = self.read()?;
        let entry = devices
            .get(id)
            .ok_or_else(|| DeviceError::not_found(id.to_string()))?;
        entry
            .adapter
            .clone()
            .ok_or_else(|| DeviceError::NotConnected(id.to_string()))
    }

    /// Track the sync task of a computer, cancelling any previous one
    pub fn attach_schedule(&self, id: &Id, token: CancellationToken, task: JoinHandle<()>) -> Result<()> {
        let previous = self
            .schedules
            .lock()
            .map_err(|_| poisoned("schedule"))?
            .insert(id.clone(), ScheduleHandle { token, task });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        Ok(())
    }

    /// Cancel the sync task of a computer; an in-flight cycle may finish
    pub fn cancel_schedule(&self, id: &Id) -> Result<bool> {
        let handle = self
            .schedules
            .lock()
            .map_err(|_| poisoned("schedule"))?
            .remove(id);
        match handle {
            Some(handle) => {
                handle.token.cancel();
                debug!("Cancelled sync task of {}", id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether a live sync task is tracked for the computer
    pub fn has_schedule(&self, id: &Id) -> Result<bool> {
        Ok(self
            .schedules
            .lock()
            .map_err(|_| poisoned("schedule"))?
            .get(id)
            .map(|h| !h.token.is_cancelled() && !h.task.is_finished())
            .unwrap_or(false))
    }

    /// Stop every sync task and close every adapter
    pub async fn shutdown(&self) -> Result<()> {
        let handles: Vec<(Id, ScheduleHandle)> = self
            .schedules
            .lock()
            .map_err(|_| poisoned("schedule"))?
            .drain()
            .collect();
        let (ids, tasks): (Vec<Id>, Vec<JoinHandle<()>>) = handles
            .into_iter()
            .map(|(id, handle)| {
                handle.token.cancel();
                (id, handle.task)
            })
            .unzip();
        for (id, result) in ids.into_iter().zip(join_all(tasks).await) {
            if let Err(e) = result {
                warn!("Sync task of {} ended abnormally: {}", id, e);
            }
        }

        let adapters: Vec<(Id, Arc<dyn ClimateAdapter>)> = {
            let mut devices = self.write()?;
            devices
                .iter_mut()
                .filter_map(|(id, entry)| entry.adapter.take().map(|a| (id.clone(), a)))
                .collect()
        };
        for (id, adapter) in adapters {
            if let Err(e) = adapter.disconnect().await {
                debug!("Closing adapter of {} failed: {}", id, e);
            }
        }
        info!("Device registry shut down");
        Ok(())
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// The registry's event bus
    pub fn events(&self) -> &EventBus<RegistryEvent> {
        &self.events
    }
}
