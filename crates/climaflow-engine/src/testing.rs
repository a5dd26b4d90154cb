//! Scripted controller and wiring shared by the engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use climaflow_core::clock::{Clock, ManualClock};
use climaflow_core::types::{Id, TimeWindow};
use climaflow_devices::adapters::token_rest::TokenRestReading;
use climaflow_devices::{
    AdapterOptions, AdapterProvider, Brand, ClimateAdapter, ClimateCompartment, ClimateComputer,
    ClimateMeasurement, CompartmentRef, ConnectionDescriptor, ConnectionStatus, Credentials, DataFlow,
    DeviceError, DeviceRegistry, DeviceStore, OperatingMode, ParameterPath, RawReading, RawSetpoint, Session, SetpointConfig,
    TemperatureUnit,
};

use crate::setpoint::tests::t0;
use crate::store::InMemoryStore;

#[derive(Debug, Default)]
struct Script {
    compartments: Vec<String>,
    offline: HashSet<String>,
    hung: HashSet<String>,
    refused: HashMap<ParameterPath, String>,
    writes: Vec<(String, ParameterPath, f64)>,
    write_delay: Option<Duration>,
    temperature: f64,
    auth_failure: bool,
}

/// A vendor A controller whose behaviour tests script
#[derive(Debug)]
pub struct ScriptedAdapter {
    script: Mutex<Script>,
    clock: Arc<ManualClock>,
}

impl ScriptedAdapter {
    pub fn new(clock: Arc<ManualClock>, compartments: &[&str]) -> Self {
        Self {
            script: Mutex::new(Script {
                compartments: compartments.iter().map(|c| c.to_string()).collect(),
                temperature: 22.0,
                ..Script::default()
            }),
            clock,
        }
    }

    pub fn set_offline(&self, compartment: &str, offline: bool) {
        let mut script = self.script.lock().unwrap();
        if offline {
            script.offline.insert(compartment.to_string());
        } else {
            script.offline.remove(compartment);
        }
    }

    /// Reads of `compartment` never answer while set
    pub fn set_hung(&self, compartment: &str, hung: bool) {
        let mut script = self.script.lock().unwrap();
        if hung {
            script.hung.insert(compartment.to_string());
        } else {
            script.hung.remove(compartment);
        }
    }

    pub fn refuse(&self, parameter: ParameterPath, err: DeviceError) {
        self.script.lock().unwrap().refused.insert(parameter, err.to_string());
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.script.lock().unwrap().write_delay = Some(delay);
    }

    pub fn set_temperature(&self, temperature: f64) {
        self.script.lock().unwrap().temperature = temperature;
    }

    pub fn fail_auth(&self, fail: bool) {
        self.script.lock().unwrap().auth_failure = fail;
    }

    pub fn writes(&self) -> Vec<(String, ParameterPath, f64)> {
        self.script.lock().unwrap().writes.clone()
    }

    fn reading(&self, at: DateTime<Utc>) -> RawReading {
        let temperature = self.script.lock().unwrap().temperature;
        RawReading::TokenRest(TokenRestReading {
            timestamp: at,
            unit: TemperatureUnit::Celsius,
            temperature,
            humidity: 70.0,
            co2: 900.0,
            radiation: 300.0,
            vpd: None,
            dew_point: None,
            heating_valve: 0.0,
            vent_position: 10.0,
            misting: 0.0,
            dehumidifier: 0.0,
            co2_valve: 0.0,
            lighting: 80.0,
            screen_position: None,
        })
    }
}

#[async_trait]
impl ClimateAdapter for ScriptedAdapter {
    fn brand(&self) -> Brand {
        Brand::VendorA
    }

    async fn authenticate(&self) -> climaflow_devices::Result<Session> {
        if self.script.lock().unwrap().auth_failure {
            return Err(DeviceError::Authentication("bad credentials".into()));
        }
        Ok(Session {
            token: Some("token".into()),
            established_at: self.clock.now(),
        })
    }

    async fn list_compartments(&self) -> climaflow_devices::Result<Vec<CompartmentRef>> {
        let script = self.script.lock().unwrap();
        Ok(script
            .compartments
            .iter()
            .map(|c| CompartmentRef::new(c.clone(), format!("House {}", c)))
            .collect())
    }

    async fn read_measurements(
        &self,
        compartment: &str,
        window: TimeWindow,
    ) -> climaflow_devices::Result<Vec<RawReading>> {
        if self.script.lock().unwrap().offline.contains(compartment) {
            return Err(DeviceError::connection(format!("{} unreachable", compartment)));
        }
        let step = chrono::Duration::minutes(5);
        let mut readings = Vec::new();
        let mut at = window.start;
        while at < window.end {
            readings.push(self.reading(at));
            at = at + step;
        }
        Ok(readings)
    }

    async fn read_current(
        &self,
        compartment: &str,
        _window: TimeWindow,
    ) -> climaflow_devices::Result<Option<RawReading>> {
        let hung = {
            let script = self.script.lock().unwrap();
            if script.offline.contains(compartment) {
                return Err(DeviceError::connection(format!("{} unreachable", compartment)));
            }
            script.hung.contains(compartment)
        };
        if hung {
            std::future::pending::<()>().await;
        }
        Ok(Some(self.reading(self.clock.now())))
    }

    async fn read_setpoint(&self, _compartment: &str) -> climaflow_devices::Result<RawSetpoint> {
        Ok(SetpointConfig::default().to_parameters())
    }

    async fn write_setpoint(
        &self,
        compartment: &str,
        parameter: ParameterPath,
        value: f64,
    ) -> climaflow_devices::Result<bool> {
        let delay = self.script.lock().unwrap().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock().unwrap();
        if let Some(reason) = script.refused.get(&parameter) {
            return Err(DeviceError::Connection(reason.clone()));
        }
        script.writes.push((compartment.to_string(), parameter, value));
        Ok(true)
    }
}

#[derive(Debug)]
pub struct ScriptedProvider(pub Arc<ScriptedAdapter>);

impl AdapterProvider for ScriptedProvider {
    fn create(
        &self,
        _computer: &ClimateComputer,
        _options: &AdapterOptions,
    ) -> climaflow_devices::Result<Arc<dyn ClimateAdapter>> {
        Ok(self.0.clone())
    }
}

/// Device store over an [`InMemoryStore`] whose writes can be made to fail
#[derive(Debug)]
pub struct FlakyDeviceStore {
    inner: Arc<InMemoryStore>,
    pub fail_listing: AtomicBool,
    failing_status: Mutex<Option<ConnectionStatus>>,
}

impl FlakyDeviceStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            fail_listing: AtomicBool::new(false),
            failing_status: Mutex::new(None),
        }
    }

    /// Status updates to `status` fail until cleared with `None`
    pub fn fail_status(&self, status: Option<ConnectionStatus>) {
        *self.failing_status.lock().unwrap() = status;
    }
}

#[async_trait]
impl DeviceStore for FlakyDeviceStore {
    async fn save_computer(&self, computer: &ClimateComputer) -> climaflow_devices::Result<()> {
        self.inner.save_computer(computer).await
    }

    async fn get_computer(&self, id: &Id) -> climaflow_devices::Result<Option<ClimateComputer>> {
        self.inner.get_computer(id).await
    }

    async fn list_computers(&self) -> climaflow_devices::Result<Vec<ClimateComputer>> {
        self.inner.list_computers().await
    }

    async fn delete_computer(&self, id: &Id) -> climaflow_devices::Result<()> {
        self.inner.delete_computer(id).await
    }

    async fn update_status(
        &self,
        id: &Id,
        status: ConnectionStatus,
        last_sync: Option<DateTime<Utc>>,
        last_error: Option<String>,
    ) -> climaflow_devices::Result<()> {
        if *self.failing_status.lock().unwrap() == Some(status) {
            return Err(DeviceError::Store(format!("cannot persist status {}", status)));
        }
        self.inner.update_status(id, status, last_sync, last_error).await
    }

    async fn save_compartments(
        &self,
        computer_id: &Id,
        compartments: &[ClimateCompartment],
    ) -> climaflow_devices::Result<()> {
        self.inner.save_compartments(computer_id, compartments).await
    }

    async fn list_compartments(&self, computer_id: &Id) -> climaflow_devices::Result<Vec<ClimateCompartment>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(DeviceError::Store("compartment table unavailable".into()));
        }
        self.inner.list_compartments(computer_id).await
    }

    async fn get_compartment(&self, id: &Id) -> climaflow_devices::Result<Option<ClimateCompartment>> {
        self.inner.get_compartment(id).await
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub registry: Arc<DeviceRegistry>,
    pub adapter: Arc<ScriptedAdapter>,
    pub clock: Arc<ManualClock>,
    pub computer_id: Id,
}

impl Harness {
    pub fn compartment(&self, external_id: &str) -> ClimateCompartment {
        ClimateCompartment::new(self.computer_id.clone(), external_id, format!("House {}", external_id))
    }
}

pub fn computer(data_flow: DataFlow) -> ClimateComputer {
    let connection =
        ConnectionDescriptor::http("controller.local", 8080).with_credentials(Credentials::new("grower", "secret"));
    ClimateComputer::new("North block", Brand::VendorA, connection)
        .with_id("dev")
        .with_mode(OperatingMode::Advise)
        .with_data_flow(data_flow)
}

/// A registry with one connected computer serving `gh1` and `gh2`
pub async fn harness(data_flow: DataFlow) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    build(data_flow, store.clone(), store).await
}

/// Like [`harness`], with the registry persisting through a [`FlakyDeviceStore`]
pub async fn flaky_harness(data_flow: DataFlow) -> (Harness, Arc<FlakyDeviceStore>) {
    let store = Arc::new(InMemoryStore::new());
    let flaky = Arc::new(FlakyDeviceStore::new(store.clone()));
    (build(data_flow, store, flaky.clone()).await, flaky)
}

async fn build(data_flow: DataFlow, store: Arc<InMemoryStore>, device_store: Arc<dyn DeviceStore>) -> Harness {
    let clock = Arc::new(ManualClock::new(t0()));
    let adapter = Arc::new(ScriptedAdapter::new(clock.clone(), &["gh1", "gh2"]));
    let registry = Arc::new(DeviceRegistry::new(
        device_store,
        Arc::new(ScriptedProvider(adapter.clone())),
        AdapterOptions::new().with_clock(clock.clone()),
    ));
    let computer = computer(data_flow);
    let computer_id = computer.id.clone();
    registry.add(computer).await.unwrap();

    Harness {
        store,
        registry,
        adapter,
        clock,
        computer_id,
    }
}

/// A plain daytime measurement
pub fn measurement_at(device_id: &Id, compartment_id: &Id, at: DateTime<Utc>) -> ClimateMeasurement {
    ClimateMeasurement {
        device_id: device_id.clone(),
        compartment_id: compartment_id.clone(),
        timestamp: at,
        temperature: 22.0,
        humidity: 70.0,
        co2: 800.0,
        light: 300.0,
        vpd: 0.8,
        dew_point: 16.3,
        heating_active: false,
        cooling_active: false,
        humidification_active: false,
        dehumidification_active: false,
        co2_dosing_active: false,
        lights_active: true,
        screen_position: None,
    }
}
