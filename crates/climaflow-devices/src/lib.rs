/*!
 * ClimaFlow Devices
 *
 * This crate provides the climate-computer model, the vendor protocol
 * adapters, measurement normalization and the device registry for the
 * ClimaFlow engine.
 */

#![warn(missing_docs)]

// Re-export core types
pub use climaflow_core::prelude;

pub mod adapters;
pub mod device;
pub mod error;
pub mod measurement;
pub mod normalizer;
pub mod protocol;
pub mod registry;
pub mod setpoint;
pub mod store;

pub use device::{
    Brand, Capabilities, ClimateCompartment, ClimateComputer, ConnectionDescriptor, ConnectionStatus,
    Credentials, DataFlow, OperatingMode, Transport,
};
pub use error::{DeviceError, Result};
pub use measurement::{ClimateMeasurement, TemperatureUnit};
pub use protocol::{
    AdapterOptions, AdapterProvider, ClimateAdapter, CompartmentRef, DefaultAdapterProvider, RawReading,
    Session, WriteReport,
};
pub use registry::{DeviceRegistry, RegistryEvent};
pub use setpoint::{ParameterPath, RawSetpoint, SetpointConfig};
pub use store::DeviceStore;

/// ClimaFlow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
