use std::sync::Arc;
use std::time::Duration;

use climaflow_core::config::Config;
use climaflow_devices::adapters::{MemoryRegisters, RegisterAdapter};
use climaflow_devices::{
    AdapterOptions, AdapterProvider, Brand, ClimateAdapter, ClimateComputer, ConnectionDescriptor, DataFlow,
    OperatingMode, ParameterPath,
};
use climaflow_engine::{ClimateEngine, EngineEvent, Id};

/// Serves every computer from one in-process register bank
#[derive(Debug)]
struct SimulatedBus(Arc<MemoryRegisters>);

impl AdapterProvider for SimulatedBus {
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::default();
    config.logging.level = "info,climaflow_engine=debug".to_string();
    climaflow_core::logging::init_from_config(&config.logging)?;

    // Two compartments: unit 1 runs hot, unit 2 is short on CO2
    let bus = Arc::new(MemoryRegisters::new());
    for (unit, temperature, co2) in [(1u8, 268u16, 900u16), (2, 221, 500)] {
        bus.set(unit, 100, temperature);
        bus.set(unit, 101, 720);
        bus.set(unit, 102, co2);
        bus.set(unit, 103, 410);
        bus.set(unit, 109, 100);
        for (address, value) in [(200, 220), (201, 700), (202, 800), (203, 180), (204, 800), (205, 400)] {
            bus.set(unit, address, value);
        }
    }

    let engine = ClimateEngine::builder()
        .with_config(config)
        .with_provider(Arc::new(SimulatedBus(bus.clone())))
        .build()?;
    let mut events = engine.subscribe();
    engine.start().await?;

    let computer = ClimateComputer::new(
        "Demo greenhouse",
        Brand::VendorB,
        ConnectionDescriptor::modbus_tcp("127.0.0.1", 502).with_units(vec![1, 2]),
    )
    .with_id("demo")
    .with_mode(OperatingMode::Control)
    .with_data_flow(DataFlow::Bidirectional)
    .with_sync_interval(5);
    let status = engine.register_computer(computer).await?;
    println!("Controller status: {}", status);

    let report = engine.sync_now(&Id::from("demo")).await?;
    println!(
        "Synced {} compartments, {} advice created, {} applied",
        report.synced.len(),
        report.advice_created,
        report.advice_applied
    );

    for compartment in ["demo:1", "demo:2"] {
        let id = Id::from(compartment);
        for advice in engine.pending_advice(&id).await? {
            println!(
                "  {} {:?} {}: {:.1} -> {:.1} ({})",
                compartment, advice.priority, advice.parameter, advice.current_value, advice.recommended_value, advice.rationale
            );
        }
        if let Some(setpoint) = engine.active_setpoint(&id).await? {
            println!(
                "  {} day temperature setpoint {:.1}°C, CO2 dosing {}",
                compartment,
                setpoint.config.get(ParameterPath::TemperatureDay),
                setpoint.config.get(ParameterPath::Co2Dosing)
            );
        }
    }

    // Let the scheduler run a couple of cycles on its own
    let deadline = tokio::time::sleep(Duration::from_secs(12));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(EngineEvent::SyncCompleted { device_id, compartments }) => {
                    println!("Cycle finished for {} ({} compartments)", device_id, compartments);
                }
                Ok(EngineEvent::SetpointChanged { compartment_id, source, .. }) => {
                    println!("Setpoint of {} changed by {:?}", compartment_id, source);
                }
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }

    engine.shutdown().await?;
    Ok(())
}
