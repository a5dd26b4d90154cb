/*!
 * Synchronization scheduling.
 *
 * Every computer gets one task that runs a sync cycle, sleeps for the
 * device interval and repeats until its cancellation token fires or the
 * device disappears. Cycles of different computers run concurrently;
 * cycles of one computer never overlap.
 */
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use climaflow_core::clock::SharedClock;
use climaflow_core::config::SyncConfig;
use climaflow_core::event::EventBus;
use climaflow_core::logging::component_span;
use climaflow_core::types::{Id, TimeWindow};
use climaflow_core::utils::backoff_delay;
use climaflow_devices::normalizer::normalize;
use climaflow_devices::{
    ClimateAdapter, ClimateCompartment, ClimateComputer, ConnectionStatus, DeviceError, DeviceRegistry,
    OperatingMode,
};

use crate::advisory::{AdvisoryEngine, AUTO_ACTOR};
use crate::error::{bounded, Error, Result};
use crate::events::EngineEvent;
use crate::setpoint::SetpointWriter;
use crate::store::ClimateStore;

/// Outcome of one sync cycle
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// The computer ID
    pub device_id: Id,
    /// Cycle start
    pub started_at: DateTime<Utc>,
    /// Cycle end
    pub finished_at: DateTime<Utc>,
    /// Compartments that produced a measurement
    pub synced: Vec<Id>,
    /// Compartments that failed, with the reason
    pub failed: Vec<(Id, String)>,
    /// Advice records created
    pub advice_created: usize,
    /// Advice applied without a person
    pub advice_applied: usize,
    /// Device-level failure (connect, discovery)
    pub error: Option<String>,
}

impl SyncReport {
    fn new(device_id: Id, at: DateTime<Utc>) -> Self {
        Self {
            device_id,
            started_at: at,
            finished_at: at,
            synced: Vec::new(),
            failed: Vec::new(),
            advice_created: 0,
            advice_applied: 0,
            error: None,
        }
    }

    /// Whether every compartment synchronized
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed.is_empty()
    }
}

/// Drives the periodic sync task of every computer
#[derive(Debug)]
pub struct SyncScheduler {
    registry: Arc<DeviceRegistry>,
    store: Arc<dyn ClimateStore>,
    writer: Arc<SetpointWriter>,
    advisory: Arc<AdvisoryEngine>,
    config: SyncConfig,
    clock: SharedClock,
    events: EventBus<EngineEvent>,
    cycles: Mutex<HashMap<Id, Arc<AsyncMutex<()>>>>,
}

impl SyncScheduler {
    /// Create a scheduler
    pub fn new(
        registry: Arc<DeviceRegistry>,
        store: Arc<dyn ClimateStore>,
        writer: Arc<SetpointWriter>,
        advisory: Arc<AdvisoryEngine>,
        config: SyncConfig,
        clock: SharedClock,
        events: EventBus<EngineEvent>,
    ) -> Self {
        Self {
            registry,
            store,
            writer,
            advisory,
            config,
            clock,
            events,
            cycles: Mutex::new(HashMap::new()),
        }
    }

    fn cycle_lock(&self, id: &Id) -> Result<Arc<AsyncMutex<()>>> {
        let mut cycles = self
            .cycles
            .lock()
            .map_err(|_| Error::store("sync lock table poisoned"))?;
        Ok(cycles
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }

    /// Interval between cycles of `computer`
    pub fn interval_of(&self, computer: &ClimateComputer) -> Duration {
        if computer.sync_interval_secs == 0 {
            self.config.default_interval()
        } else {
            Duration::from_secs(computer.sync_interval_secs)
        }
    }

    /// Delay before the next cycle after `failures` consecutive failed cycles
    pub fn next_delay(&self, interval: Duration, failures: u32) -> Duration {
        backoff_delay(interval, failures, self.config.max_backoff())
    }

    /// Start (or restart) the periodic task of a computer
    pub fn start(self: &Arc<Self>, id: &Id) -> Result<()> {
        let computer = self.registry.get(id)?;
        let token = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let device_id = computer.id.clone();
        let cancelled = token.clone();
        let span = component_span("sync_task", Some(id.as_str()));
        let task = tokio::spawn(
            async move { scheduler.run(device_id, cancelled).await }.instrument(span),
        );
        self.registry.attach_schedule(id, token, task)?;
        debug!(device_id = %id, "Sync task scheduled every {:?}", self.interval_of(&computer));
        Ok(())
    }

    /// Start the task of every registered computer
    pub fn start_all(self: &Arc<Self>) -> Result<usize> {
        let computers = self.registry.list()?;
        for computer in &computers {
            self.start(&computer.id)?;
        }
        info!("Started {} sync tasks", computers.len());
        Ok(computers.len())
    }

    /// Stop the task of a computer; an in-flight cycle may finish
    pub fn stop(&self, id: &Id) -> Result<bool> {
        Ok(self.registry.cancel_schedule(id)?)
    }

    /// Drop per-device state of a removed computer
    pub fn forget(&self, id: &Id) {
        if let Ok(mut cycles) = self.cycles.lock() {
            cycles.remove(id);
        }
    }

    async fn run(self: Arc<Self>, id: Id, token: CancellationToken) {
        info!(device_id = %id, "Sync task started");
        let mut failures: u32 = 0;

        loop {
            if token.is_cancelled() {
                break;
            }
            let interval = match self.registry.get(&id) {
                Ok(computer) => self.interval_of(&computer),
                Err(_) => break,
            };

            match self.sync_now(&id).await {
                Ok(report) if report.is_success() => failures = 0,
                Ok(_) => failures = failures.saturating_add(1),
                Err(Error::NotFound(_)) => {
                    debug!(device_id = %id, "Device removed, stopping sync task");
                    break;
                }
                Err(e) => {
                    warn!(device_id = %id, "Sync cycle aborted: {}", e);
                    failures = failures.saturating_add(1);
                }
            }

            let delay = self.next_delay(interval, failures);
            if failures > 1 {
                debug!(device_id = %id, "Backing off for {:?} after {} failed cycles", delay, failures);
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(device_id = %id, "Sync task stopped");
    }

    /// Run one cycle now, after any cycle already running for the device
    pub async fn sync_now(&self, id: &Id) -> Result<SyncReport> {
        let lock = self.cycle_lock(id)?;
        let _cycle = lock.lock().await;
        let span = tracing::info_span!("sync_cycle", device_id = %id);
        self.cycle(id).instrument(span).await
    }

    async fn fail_cycle(&self, mut report: SyncReport, message: String) -> Result<SyncReport> {
        warn!("{}", message);
        self.record_failure(&report.device_id, &message).await?;
        report.finished_at = self.clock.now();
        report.error = Some(message.clone());
        self.events.publish(EngineEvent::SyncFailed {
            device_id: report.device_id.clone(),
            error: message,
        });
        Ok(report)
    }

    /// Leave the device in `error`. Only a removed device is fatal; the
    /// registry holds the status in memory even when the store rejects it.
    async fn record_failure(&self, id: &Id, message: &str) -> Result<()> {
        match self.registry.mark_failed(id, message).await.map_err(Error::from) {
            Ok(()) => Ok(()),
            Err(e @ Error::NotFound(_)) => Err(e),
            Err(e) => {
                warn!("Persisting failure status of {} failed: {}", id, e);
                Ok(())
            }
        }
    }

    async fn cycle(&self, id: &Id) -> Result<SyncReport> {
        let mut computer = self.registry.get(id)?;
        let mut report = SyncReport::new(id.clone(), self.clock.now());

        if computer.needs_connect() {
            let status = self.registry.connect(id).await?;
            computer = self.registry.get(id)?;
            if status != ConnectionStatus::Connected {
                let message = computer
                    .last_error
                    .clone()
                    .unwrap_or_else(|| format!("connecting {} failed", id));
                report.error = Some(message.clone());
                self.events.publish(EngineEvent::SyncFailed {
                    device_id: id.clone(),
                    error: message,
                });
                return Ok(report);
            }
        }

        if !computer.data_flow.allows_read() {
            debug!("Reads disabled, nothing to synchronize");
            self.registry.mark_synced(id, self.clock.now()).await?;
            return Ok(report);
        }

        match self.registry.mark_syncing(id).await.map_err(Error::from) {
            Ok(()) => {}
            Err(e @ Error::NotFound(_)) => return Err(e),
            Err(e) => {
                return self
                    .fail_cycle(report, format!("recording sync start failed: {}", e))
                    .await
            }
        }

        let mut compartments = match self.registry.compartments(id).await {
            Ok(compartments) => compartments,
            Err(e) => {
                return self
                    .fail_cycle(report, format!("listing compartments failed: {}", e))
                    .await
            }
        };
        if compartments.is_empty() {
            match self.registry.discover(id).await {
                Ok(found) => compartments = found,
                Err(e) => {
                    return self
                        .fail_cycle(report, format!("compartment discovery failed: {}", e))
                        .await
                }
            }
        }

        let adapter = match self.registry.adapter(id) {
            Ok(adapter) => adapter,
            Err(e) => return self.fail_cycle(report, e.to_string()).await,
        };

        for compartment in &compartments {
            match self
                .sync_compartment(&computer, adapter.as_ref(), compartment, &mut report)
                .await
            {
                Ok(()) => report.synced.push(compartment.id.clone()),
                Err(e) => {
                    warn!(compartment_id = %compartment.id, "Compartment sync failed: {}", e);
                    report.failed.push((compartment.id.clone(), e.to_string()));
                }
            }
        }

        report.finished_at = self.clock.now();
        if report.failed.is_empty() {
            match self
                .registry
                .mark_synced(id, report.finished_at)
                .await
                .map_err(Error::from)
            {
                Ok(()) => {}
                Err(e @ Error::NotFound(_)) => return Err(e),
                Err(e) => {
                    return self
                        .fail_cycle(report, format!("recording sync result failed: {}", e))
                        .await
                }
            }
            info!(
                "Synchronized {} compartments, {} advice created, {} applied",
                report.synced.len(),
                report.advice_created,
                report.advice_applied
            );
            self.events.publish(EngineEvent::SyncCompleted {
                device_id: id.clone(),
                compartments: report.synced.len(),
            });
        } else {
            let failed: Vec<String> = report
                .failed
                .iter()
                .map(|(compartment, reason)| format!("{}: {}", compartment, reason))
                .collect();
            let message = format!(
                "{} of {} compartments failed ({})",
                report.failed.len(),
                compartments.len(),
                failed.join("; ")
            );
            self.record_failure(id, &message).await?;
            self.events.publish(EngineEvent::SyncFailed {
                device_id: id.clone(),
                error: message,
            });
        }
        Ok(report)
    }

    async fn sync_compartment(
        &self,
        computer: &ClimateComputer,
        adapter: &dyn ClimateAdapter,
        compartment: &ClimateCompartment,
        report: &mut SyncReport,
    ) -> Result<()> {
        let window = TimeWindow::trailing(self.clock.now(), self.config.measurement_window());
        let reading = bounded(
            self.config.adapter_timeout(),
            "read measurement",
            adapter.read_current(&compartment.external_id, window),
        )
        .await?
        .ok_or_else(|| {
            Error::from(DeviceError::protocol(format!(
                "controller returned no reading for {}",
                compartment.external_id
            )))
        })?;

        let measurement = normalize(&computer.id, &compartment.id, &reading);
        self.store.save_measurement(&measurement).await?;
        self.events.publish(EngineEvent::MeasurementRecorded {
            device_id: computer.id.clone(),
            compartment_id: compartment.id.clone(),
            timestamp: measurement.timestamp,
        });

        if computer.mode == OperatingMode::Monitor {
            return Ok(());
        }

        let targets = self.writer.active_or_import(compartment).await?;
        let advice = self
            .advisory
            .generate(computer, &measurement, &targets.config)
            .await?;
        report.advice_created += advice.len();

        if computer.mode != OperatingMode::Control {
            return Ok(());
        }
        for item in advice.iter().filter(|a| a.should_auto_apply()) {
            match self.advisory.apply(&item.id, AUTO_ACTOR).await {
                Ok(_) => report.advice_applied += 1,
                Err(e) => warn!(advice_id = %item.id, "Auto-apply failed: {}", e),
            }
        }
        Ok(())
    }
}
