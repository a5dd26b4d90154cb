/*!
 * The engine facade.
 *
 * [`ClimateEngine`] wires the registry, the setpoint writer, the advisory
 * engine, the scheduler and the history service over one store, and exposes
 * the operations callers use. Build it with [`ClimateEngineBuilder`].
 */
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use climaflow_core::clock::{system_clock, SharedClock};
use climaflow_core::config::{Config, SharedConfig};
use climaflow_core::event::EventBus;
use climaflow_core::types::{Id, TimeWindow};
use climaflow_devices::normalizer::normalize;
use climaflow_devices::{
    AdapterOptions, AdapterProvider, ClimateComputer, ConnectionStatus, DefaultAdapterProvider, DeviceRegistry,
    DeviceStore, ParameterPath, RegistryEvent,
};

use crate::advisory::{AdvisoryEngine, AdvisoryRules, ControlAdvice};
use crate::error::{bounded, Error, Result};
use crate::events::{bridge_registry_events, spawn_notifier, EngineEvent, Notifier, TracingNotifier};
use crate::history::HistoryService;
use crate::scheduler::{SyncReport, SyncScheduler};
use crate::setpoint::{ClimateSetpoint, SetpointChange, SetpointWriter};
use crate::store::{ClimateStore, InMemoryStore};

/// Builder for [`ClimateEngine`]
#[derive(Debug, Default)]
pub struct ClimateEngineBuilder {
    config: Option<Config>,
    stores: Option<(Arc<dyn DeviceStore>, Arc<dyn ClimateStore>)>,
    provider: Option<Arc<dyn AdapterProvider>>,
    clock: Option<SharedClock>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl ClimateEngineBuilder {
    /// Create a builder with defaults: in-memory store, vendor adapters,
    /// system clock and log notifications
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config`
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Persist through `store`
    pub fn with_store<S: ClimateStore + 'static>(mut self, store: Arc<S>) -> Self {
        let devices: Arc<dyn DeviceStore> = store.clone();
        let climate: Arc<dyn ClimateStore> = store;
        self.stores = Some((devices, climate));
        self
    }

    /// Build adapters with `provider`
    pub fn with_provider(mut self, provider: Arc<dyn AdapterProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Read time from `clock`
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Deliver events to `notifier`
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Validate the configuration and wire the components
    pub fn build(self) -> Result<ClimateEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let config = SharedConfig::new(config);
        let sync = config.get().sync.clone();

        let (device_store, store) = match self.stores {
            Some(stores) => stores,
            None => {
                let store = Arc::new(InMemoryStore::new());
                let devices: Arc<dyn DeviceStore> = store.clone();
                let climate: Arc<dyn ClimateStore> = store;
                (devices, climate)
            }
        };
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(DefaultAdapterProvider) as Arc<dyn AdapterProvider>);
        let clock = self.clock.unwrap_or_else(system_clock);
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotifier) as Arc<dyn Notifier>);

        let events = EventBus::with_capacity(sync.event_capacity);
        let options = AdapterOptions::new()
            .with_timeout(sync.adapter_timeout())
            .with_clock(clock.clone());
        let registry = Arc::new(
            DeviceRegistry::new(device_store, provider, options)
                .with_discovery(sync.discover_compartments)
                .with_events(EventBus::with_capacity(sync.event_capacity)),
        );
        let writer = Arc::new(SetpointWriter::new(
            registry.clone(),
            store.clone(),
            clock.clone(),
            sync.adapter_timeout(),
            events.clone(),
        ));
        let advisory = Arc::new(AdvisoryEngine::new(
            AdvisoryRules::new(config.get().advisory.clone()),
            store.clone(),
            writer.clone(),
            clock.clone(),
            events.clone(),
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            registry.clone(),
            store.clone(),
            writer.clone(),
            advisory.clone(),
            sync,
            clock.clone(),
            events.clone(),
        ));

        Ok(ClimateEngine {
            config,
            history: HistoryService::new(store.clone()),
            store,
            registry,
            writer,
            advisory,
            scheduler,
            events,
            clock,
            notifier,
            background: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Climate-computer integration and control-advisory engine
#[derive(Debug)]
pub struct ClimateEngine {
    config: SharedConfig,
    store: Arc<dyn ClimateStore>,
    registry: Arc<DeviceRegistry>,
    writer: Arc<SetpointWriter>,
    advisory: Arc<AdvisoryEngine>,
    scheduler: Arc<SyncScheduler>,
    history: HistoryService,
    events: EventBus<EngineEvent>,
    clock: SharedClock,
    notifier: Arc<dyn Notifier>,
    background: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClimateEngine {
    /// Start building an engine
    pub fn builder() -> ClimateEngineBuilder {
        ClimateEngineBuilder::new()
    }

    /// Load stored computers, start event delivery and every sync task.
    ///
    /// Returns the number of computers scheduled.
    pub async fn start(&self) -> Result<usize> {
        let loaded = self.registry.load().await?;
        {
            let mut tasks = self
                .tasks
                .lock()
                .map_err(|_| Error::store("engine task list poisoned"))?;
            tasks.push(spawn_notifier(
                &self.events,
                self.notifier.clone(),
                self.background.child_token(),
            ));
            tasks.push(bridge_registry_events(
                self.registry.events(),
                self.events.clone(),
                self.background.child_token(),
            ));
        }
        let started = self.scheduler.start_all()?;
        info!(
            "Climate engine '{}' started with {} of {} computers",
            self.config.get().general.app_name,
            started,
            loaded
        );
        Ok(started)
    }

    /// Stop every task and close every adapter
    pub async fn shutdown(&self) -> Result<()> {
        self.registry.shutdown().await?;
        self.background.cancel();
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Climate engine stopped");
        Ok(())
    }

    /// Register a computer, connect it and schedule its sync task
    pub async fn register_computer(&self, computer: ClimateComputer) -> Result<ConnectionStatus> {
        let id = computer.id.clone();
        let status = self.registry.add(computer).await?;
        self.scheduler.start(&id)?;
        info!(device_id = %id, "Registered computer ({})", status);
        Ok(status)
    }

    /// Replace a computer's configuration and restart its schedule
    pub async fn update_computer(&self, computer: ClimateComputer) -> Result<()> {
        let id = computer.id.clone();
        if self.registry.update(computer).await? {
            let status = self.registry.connect(&id).await?;
            debug!(device_id = %id, "Reconnected after configuration change: {}", status);
        }
        self.scheduler.start(&id)?;
        Ok(())
    }

    /// Cancel a computer's schedule, drop its adapter and delete it
    pub async fn remove_computer(&self, id: &Id) -> Result<()> {
        self.registry.remove(id).await?;
        self.scheduler.forget(id);
        Ok(())
    }

    /// A computer snapshot
    pub fn computer(&self, id: &Id) -> Result<ClimateComputer> {
        Ok(self.registry.get(id)?)
    }

    /// Every registered computer
    pub fn computers(&self) -> Result<Vec<ClimateComputer>> {
        Ok(self.registry.list()?)
    }

    /// Run one sync cycle now
    pub async fn sync_now(&self, id: &Id) -> Result<SyncReport> {
        self.scheduler.sync_now(id).await
    }

    /// Change setpoint parameters of a compartment on behalf of `actor`
    pub async fn update_setpoint<A: Into<String>>(
        &self,
        compartment_id: &Id,
        changes: Vec<(ParameterPath, f64)>,
        actor: A,
    ) -> Result<ClimateSetpoint> {
        self.writer
            .write(SetpointChange::manual(compartment_id.clone(), changes, actor))
            .await
    }

    /// The active setpoint of a compartment
    pub async fn active_setpoint(&self, compartment_id: &Id) -> Result<Option<ClimateSetpoint>> {
        self.store.active_setpoint(compartment_id).await
    }

    /// Apply pending advice on behalf of `actor`
    pub async fn apply_advice(&self, advice_id: &Id, actor: &str) -> Result<ClimateSetpoint> {
        self.advisory.apply(advice_id, actor).await
    }

    /// Reject pending advice
    pub async fn reject_advice(&self, advice_id: &Id) -> Result<ControlAdvice> {
        self.advisory.reject(advice_id).await
    }

    /// Pending, unexpired advice of a compartment, most urgent first
    pub async fn pending_advice(&self, compartment_id: &Id) -> Result<Vec<ControlAdvice>> {
        self.advisory.pending_advice(compartment_id).await
    }

    /// Import the controller's history of a compartment for `[start, end)`.
    ///
    /// Returns how many new measurements were stored.
    pub async fn backfill(
        &self,
        computer_id: &Id,
        compartment_id: &Id,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize> {
        let compartment = self
            .store
            .get_compartment(compartment_id)
            .await?
            .filter(|c| &c.computer_id == computer_id)
            .ok_or_else(|| Error::not_found(format!("compartment {} of {}", compartment_id, computer_id)))?;
        let adapter = self.registry.adapter(computer_id)?;
        let readings = bounded(
            self.config.get().sync.adapter_timeout(),
            "read history",
            adapter.read_measurements(&compartment.external_id, TimeWindow::new(start, end)),
        )
        .await?;

        let measurements: Vec<_> = readings
            .iter()
            .map(|reading| normalize(computer_id, compartment_id, reading))
            .collect();
        let added = self.store.save_measurements(&measurements).await?;
        info!(
            device_id = %computer_id,
            compartment_id = %compartment_id,
            "Backfilled {} of {} readings",
            added,
            measurements.len()
        );
        Ok(added)
    }

    /// Historical queries
    pub fn history(&self) -> &HistoryService {
        &self.history
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Subscribe to raw registry events
    pub fn registry_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// The engine's clock
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// The engine's configuration
    pub fn config(&self) -> &Config {
        self.config.get()
    }
}
