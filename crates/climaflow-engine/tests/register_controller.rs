//! The engine driving a register-protocol controller end to end.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use climaflow_core::clock::{Clock, ManualClock};
use climaflow_devices::adapters::{MemoryRegisters, RegisterAdapter};
use climaflow_devices::{
    AdapterOptions, AdapterProvider, Brand, ClimateAdapter, ClimateComputer, ConnectionDescriptor, DataFlow,
    OperatingMode, ParameterPath,
};
use climaflow_engine::{AdvicePriority, ClimateEngine, Error, Id};

#[derive(Debug)]
struct BusProvider(Arc<MemoryRegisters>);

impl AdapterProvider for BusProvider {
    fn create(
        &self,
        computer: &ClimateComputer,
        options: &AdapterOptions,
    ) -> climaflow_devices::Result<Arc<dyn ClimateAdapter>> {
        Ok(Arc::new(RegisterAdapter::new(
            self.0.clone(),
            computer.connection.units.clone(),
            options,
        )))
    }
}

/// Live values and a 22 °C day target on `unit`
fn seed(bus: &MemoryRegisters, unit: u8, temperature_tenths: u16) {
    for (address, value) in [
        (100, temperature_tenths),
        (101, 700),
        (102, 900),
        (103, 350),
        (104, 0),
        (109, 80),
        (200, 220),
        (201, 700),
        (202, 800),
        (203, 180),
        (204, 800),
        (205, 400),
        (206, 0),
        (207, 160),
        (208, 100),
    ] {
        bus.set(unit, address, value);
    }
}

struct Setup {
    engine: ClimateEngine,
    bus: Arc<MemoryRegisters>,
    clock: Arc<ManualClock>,
    id: Id,
}

async fn setup(data_flow: DataFlow) -> Setup {
    let bus = Arc::new(MemoryRegisters::new());
    seed(&bus, 1, 270);
    seed(&bus, 2, 221);
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
    let engine = ClimateEngine::builder()
        .with_provider(Arc::new(BusProvider(bus.clone())))
        .with_clock(clock.clone())
        .build()
        .unwrap();

    let computer = ClimateComputer::new(
        "North house",
        Brand::VendorB,
        ConnectionDescriptor::modbus_tcp("bus.local", 502).with_units(vec![1, 2]),
    )
    .with_id("b1")
    .with_mode(OperatingMode::Advise)
    .with_data_flow(data_flow);
    engine.register_computer(computer).await.unwrap();

    Setup {
        engine,
        bus,
        clock,
        id: Id::from("b1"),
    }
}

#[test_log::test(tokio::test)]
async fn advice_from_register_readings_is_written_back() {
    let s = setup(DataFlow::Bidirectional).await;
    let unit1 = Id::from("b1:1");

    let report = s.engine.sync_now(&s.id).await.unwrap();
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.synced.len(), 2);

    let now = s.clock.now();
    let measurements = s
        .engine
        .history()
        .measurements(&s.id, &unit1, now - Duration::hours(1), now + Duration::hours(1))
        .await
        .unwrap();
    assert!(!measurements.is_empty());
    assert_eq!(measurements[0].temperature, 27.0);
    assert!(measurements[0].lights_active);

    let imported = s.engine.active_setpoint(&unit1).await.unwrap().unwrap();
    assert_eq!(imported.config.get(ParameterPath::TemperatureDay), 22.0);

    let pending = s.engine.pending_advice(&unit1).await.unwrap();
    let advice = pending
        .iter()
        .find(|a| a.parameter == ParameterPath::TemperatureDay)
        .unwrap();
    assert_eq!(advice.priority, AdvicePriority::High);
    assert_eq!(advice.recommended_value, 22.0);
    assert!(!advice.auto_apply);

    s.engine
        .update_setpoint(&unit1, vec![(ParameterPath::TemperatureDay, 23.5)], "alice")
        .await
        .unwrap();
    assert_eq!(s.bus.get(1, 200), Some(235));

    s.clock.advance(Duration::minutes(1));
    let applied = s.engine.apply_advice(&advice.id, "bob").await.unwrap();
    assert_eq!(s.bus.get(1, 200), Some(220));
    assert_eq!(applied.config.get(ParameterPath::TemperatureDay), 22.0);

    let events = s
        .engine
        .history()
        .events(&s.id, &unit1, now - Duration::hours(1), now + Duration::hours(1))
        .await
        .unwrap();
    let actors: Vec<_> = events.iter().map(|e| e.actor.as_str()).collect();
    assert_eq!(actors, vec!["alice", "bob"]);
    assert_eq!(events[1].advice_id.as_ref(), Some(&advice.id));

    // Unit 2 untouched
    assert_eq!(s.bus.get(2, 200), Some(220));
}

#[tokio::test]
async fn silent_unit_does_not_block_its_neighbour() {
    let s = setup(DataFlow::Bidirectional).await;
    s.engine.sync_now(&s.id).await.unwrap();

    s.bus.set_offline(1, true);
    s.clock.advance(Duration::minutes(5));
    let report = s.engine.sync_now(&s.id).await.unwrap();
    assert!(!report.is_success());
    assert_eq!(report.synced, vec![Id::from("b1:2")]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, Id::from("b1:1"));

    let at = s.clock.now();
    let fresh = s
        .engine
        .history()
        .measurements(&s.id, &Id::from("b1:2"), at, at + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].temperature, 22.1);
    assert!(s.engine.computer(&s.id).unwrap().last_error.is_some());
}

#[tokio::test]
async fn read_only_controller_is_never_written() {
    let s = setup(DataFlow::ReadOnly).await;
    let unit1 = Id::from("b1:1");

    let err = s
        .engine
        .update_setpoint(&unit1, vec![(ParameterPath::Co2Day, 1000.0)], "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    assert_eq!(s.bus.get(1, 202), Some(800));
}

#[tokio::test]
async fn removed_controller_cannot_be_synced() {
    let s = setup(DataFlow::Bidirectional).await;
    s.engine.remove_computer(&s.id).await.unwrap();

    assert!(matches!(s.engine.sync_now(&s.id).await, Err(Error::NotFound(_))));
    assert!(s.engine.computers().unwrap().is_empty());
    s.engine.shutdown().await.unwrap();
}
