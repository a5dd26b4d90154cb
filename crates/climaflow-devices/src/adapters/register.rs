//! Vendor B: register-addressed protocol.
//!
//! There is no session. Each compartment is one unit id on the bus and the
//! adapter owns a fixed map between holding registers and logical fields:
//!
//! | Register | Field                         | Encoding          |
//! |----------|-------------------------------|-------------------|
//! | 100      | air temperature               | i16, 0.1 °C       |
//! | 101      | relative humidity             | u16, 0.1 %        |
//! | 102      | CO2                           | u16, ppm          |
//! | 103      | global radiation              | u16, W/m²         |
//! | 104..110 | heating, vents, misting, dehumidifier, CO2 valve, lights, screen | u16, % |
//! | 200..208 | setpoints, see [`SETPOINT_REGISTERS`] | scaled   |

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use climaflow_core::clock::SharedClock;
use climaflow_core::types::TimeWindow;

use crate::device::Brand;
use crate::error::{DeviceError, Result};
use crate::protocol::{AdapterOptions, ClimateAdapter, CompartmentRef, RawReading, Session};
use crate::setpoint::{ParameterPath, RawSetpoint};

/// First measurement register
pub const MEASUREMENT_BASE: u16 = 100;

/// Logical measurement fields, in register order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegisterField {
    /// Air temperature, signed tenths of °C
    Temperature,
    /// Relative humidity, tenths of %
    Humidity,
    /// CO2, ppm
    Co2,
    /// Global radiation, W/m²
    Radiation,
    /// Heating valve, %
    HeatingValve,
    /// Vent opening, %
    Ventilation,
    /// Misting, %
    Misting,
    /// Dehumidifier, %
    Dehumidifier,
    /// CO2 valve, %
    Co2Valve,
    /// Lighting, %
    Lighting,
    /// Screen closure, %
    Screen,
}

impl RegisterField {
    /// Every field, in register order
    pub const ALL: [RegisterField; 11] = [
        RegisterField::Temperature,
        RegisterField::Humidity,
        RegisterField::Co2,
        RegisterField::Radiation,
        RegisterField::HeatingValve,
        RegisterField::Ventilation,
        RegisterField::Misting,
        RegisterField::Dehumidifier,
        RegisterField::Co2Valve,
        RegisterField::Lighting,
        RegisterField::Screen,
    ];

    /// Holding register address
    pub fn address(&self) -> u16 {
        MEASUREMENT_BASE + *self as u16
    }
}

/// One setpoint register
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetpointRegister {
    /// Logical leaf
    pub path: ParameterPath,
    /// Holding register address
    pub address: u16,
    /// Raw value = canonical value × scale
    pub scale: f64,
    /// Whether the raw value is a two's-complement i16
    pub signed: bool,
}

/// Setpoint register map
pub const SETPOINT_REGISTERS: [SetpointRegister; 9] = [
    SetpointRegister { path: ParameterPath::TemperatureDay, address: 200, scale: 10.0, signed: true },
    SetpointRegister { path: ParameterPath::HumidityDay, address: 201, scale: 10.0, signed: false },
    SetpointRegister { path: ParameterPath::Co2Day, address: 202, scale: 1.0, signed: false },
    SetpointRegister { path: ParameterPath::TemperatureNight, address: 203, scale: 10.0, signed: true },
    SetpointRegister { path: ParameterPath::HumidityNight, address: 204, scale: 10.0, signed: false },
    SetpointRegister { path: ParameterPath::Co2Night, address: 205, scale: 1.0, signed: false },
    SetpointRegister { path: ParameterPath::Co2Dosing, address: 206, scale: 1.0, signed: false },
    SetpointRegister { path: ParameterPath::LightingPhotoperiod, address: 207, scale: 10.0, signed: false },
    SetpointRegister { path: ParameterPath::LightingIntensity, address: 208, scale: 1.0, signed: false },
];

const SETPOINT_BASE: u16 = 200;

impl SetpointRegister {
    /// Look up the register for a leaf
    pub fn for_path(path: ParameterPath) -> Option<SetpointRegister> {
        SETPOINT_REGISTERS.iter().copied().find(|r| r.path == path)
    }

    /// Canonical value to raw register content
    pub fn encode(&self, value: f64) -> Result<u16> {
        let raw = (value * self.scale).round();
        let (min, max) = if self.signed {
            (i16::MIN as f64, i16::MAX as f64)
        } else {
            (0.0, u16::MAX as f64)
        };
        if !raw.is_finite() || raw < min || raw > max {
            return Err(DeviceError::InvalidValue(format!(
                "{} = {} does not fit register {}",
                self.path, value, self.address
            )));
        }
        Ok(if self.signed {
            raw as i16 as u16
        } else {
            raw as u16
        })
    }

    /// Raw register content to canonical value
    pub fn decode(&self, raw: u16) -> f64 {
        let value = if self.signed { raw as i16 as f64 } else { raw as f64 };
        value / self.scale
    }
}

/// A snapshot of the measurement registers of one unit
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterReading {
    /// When the registers were read
    pub timestamp: DateTime<Utc>,
    /// Raw register content by field
    pub values: BTreeMap<RegisterField, u16>,
}

impl RegisterReading {
    /// Build from registers read contiguously from [`MEASUREMENT_BASE`]
    pub fn from_registers(timestamp: DateTime<Utc>, registers: &[u16]) -> Self {
        let values = RegisterField::ALL
            .iter()
            .zip(registers.iter())
            .map(|(field, raw)| (*field, *raw))
            .collect();
        Self { timestamp, values }
    }

    /// Raw content of a field
    pub fn raw(&self, field: RegisterField) -> Option<u16> {
        self.values.get(&field).copied()
    }

    /// Field in engineering units
    pub fn scaled(&self, field: RegisterField) -> Option<f64> {
        let raw = self.raw(field)?;
        Some(match field {
            RegisterField::Temperature => raw as i16 as f64 / 10.0,
            RegisterField::Humidity => raw as f64 / 10.0,
            _ => raw as f64,
        })
    }
}

/// Raw access to holding registers
#[async_trait]
pub trait RegisterTransport: Send + Sync + Debug {
    /// Read `count` holding registers starting at `address`
    async fn read_holding(&self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>>;

    /// Write one holding register
    async fn write_single(&self, unit: u8, address: u16, value: u16) -> Result<()>;

    /// Close the underlying connection
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// In-process register bank, for simulators and tests
#[derive(Debug, Default)]
pub struct MemoryRegisters {
    registers: Mutex<HashMap<(u8, u16), u16>>,
    offline: Mutex<HashSet<u8>>,
}

impl MemoryRegisters {
    /// Create an empty bank
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one register
    pub fn set(&self, unit: u8, address: u16, value: u16) {
        self.registers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((unit, address), value);
    }

    /// Read one register
    pub fn get(&self, unit: u8, address: u16) -> Option<u16> {
        self.registers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(unit, address))
            .copied()
    }

    /// Make every request to `unit` fail, or stop doing so
    pub fn set_offline(&self, unit: u8, offline: bool) {
        let mut units = self.offline.lock().unwrap_or_else(|e| e.into_inner());
        if offline {
            units.insert(unit);
        } else {
            units.remove(&unit);
        }
    }

    fn check_online(&self, unit: u8) -> Result<()> {
        if self.offline.lock().unwrap_or_else(|e| e.into_inner()).contains(&unit) {
            return Err(DeviceError::connection(format!("unit {} does not respond", unit)));
        }
        Ok(())
    }
}

#[async_trait]
impl RegisterTransport for MemoryRegisters {
    async fn read_holding(&self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>> {
        self.check_online(unit)?;
        let registers = self.registers.lock().unwrap_or_else(|e| e.into_inner());
        Ok((address..address.saturating_add(count))
            .map(|a| registers.get(&(unit, a)).copied().unwrap_or(0))
            .collect())
    }

    async fn write_single(&self, unit: u8, address: u16, value: u16) -> Result<()> {
        self.check_online(unit)?;
        self.set(unit, address, value);
        Ok(())
    }
}

#[cfg(feature = "modbus")]
pub use modbus::ModbusTcpTransport;

#[cfg(feature = "modbus")]
mod modbus {
    use std::net::SocketAddr;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use tokio::time::timeout;
    use tokio_modbus::client::{tcp, Context};
    use tokio_modbus::prelude::*;
    use tracing::debug;

    use super::RegisterTransport;
    use crate::error::{DeviceError, Result};

    /// Modbus TCP transport; connects lazily and reconnects after any failure
    pub struct ModbusTcpTransport {
        address: SocketAddr,
        timeout: Duration,
        context: Mutex<Option<Context>>,
    }

    impl std::fmt::Debug for ModbusTcpTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ModbusTcpTransport")
                .field("address", &self.address)
                .field("timeout", &self.timeout)
                .finish()
        }
    }

    impl ModbusTcpTransport {
        /// Create a transport for `address`
        pub fn new(address: SocketAddr, timeout: Duration) -> Self {
            Self {
                address,
                timeout,
                context: Mutex::new(None),
            }
        }

        async fn connect(&self, unit: u8) -> Result<Context> {
            debug!("Connecting to {} unit {}", self.address, unit);
            match timeout(self.timeout, tcp::connect_slave(self.address, Slave(unit))).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(DeviceError::Timeout(format!("connect to {}", self.address))),
            }
        }
    }

    #[async_trait]
    impl RegisterTransport for ModbusTcpTransport {
        async fn read_holding(&self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>> {
            let mut guard = self.context.lock().await;
            let mut ctx = match guard.take() {
                Some(ctx) => ctx,
                None => self.connect(unit).await?,
            };
            ctx.set_slave(Slave(unit));
            let result = match timeout(self.timeout, ctx.read_holding_registers(address, count)).await {
                Ok(result) => result.map_err(DeviceError::from),
                Err(_) => Err(DeviceError::Timeout(format!("read {}+{}", address, count))),
            };
            if result.is_ok() {
                *guard = Some(ctx);
            }
            result
        }

        async fn write_single(&self, unit: u8, address: u16, value: u16) -> Result<()> {
            let mut guard = self.context.lock().await;
            let mut ctx = match guard.take() {
                Some(ctx) => ctx,
                None => self.connect(unit).await?,
            };
            ctx.set_slave(Slave(unit));
            let result = match timeout(self.timeout, ctx.write_single_register(address, value)).await {
                Ok(result) => result.map_err(DeviceError::from),
                Err(_) => Err(DeviceError::Timeout(format!("write {}", address))),
            };
            if result.is_ok() {
                *guard = Some(ctx);
            }
            result
        }

        async fn close(&self) -> Result<()> {
            if let Some(mut ctx) = self.context.lock().await.take() {
                ctx.disconnect().await?;
            }
            Ok(())
        }
    }
}

/// Adapter for vendor B controllers
#[derive(Debug)]
pub struct RegisterAdapter {
    transport: Arc<dyn RegisterTransport>,
    units: Vec<u8>,
    clock: SharedClock,
}

impl RegisterAdapter {
    /// Create an adapter over `transport` serving `units`
    pub fn new(transport: Arc<dyn RegisterTransport>, units: Vec<u8>, options: &AdapterOptions) -> Self {
        let units = if units.is_empty() {
            options.default_units.clone()
        } else {
            units
        };
        Self {
            transport,
            units,
            clock: options.clock.clone(),
        }
    }

    fn unit(&self, compartment: &str) -> Result<u8> {
        let unit: u8 = compartment
            .parse()
            .map_err(|_| DeviceError::not_found(format!("compartment {}", compartment)))?;
        if !self.units.contains(&unit) {
            return Err(DeviceError::not_found(format!("unit {}", unit)));
        }
        Ok(unit)
    }

    async fn snapshot(&self, unit: u8) -> Result<RegisterReading> {
        let registers = self
            .transport
            .read_holding(unit, MEASUREMENT_BASE, RegisterField::ALL.len() as u16)
            .await?;
        if registers.len() < RegisterField::ALL.len() {
            return Err(DeviceError::protocol(format!(
                "unit {} returned {} measurement registers",
                unit,
                registers.len()
            )));
        }
        Ok(RegisterReading::from_registers(self.clock.now(), &registers))
    }
}

#[async_trait]
impl ClimateAdapter for RegisterAdapter {
    fn brand(&self) -> Brand {
        Brand::VendorB
    }

    async fn authenticate(&self) -> Result<Session> {
        let unit = self
            .units
            .first()
            .copied()
            .ok_or_else(|| DeviceError::connection("no register units configured"))?;
        self.transport
            .read_holding(unit, MEASUREMENT_BASE, 1)
            .await
            .map_err(|e| DeviceError::connection(format!("unit {} did not answer: {}", unit, e)))?;
        info!("Register controller answered on unit {}", unit);
        Ok(Session::anonymous(self.clock.now()))
    }

    async fn list_compartments(&self) -> Result<Vec<CompartmentRef>> {
        Ok(self
            .units
            .iter()
            .map(|unit| CompartmentRef::new(unit.to_string(), format!("Unit {}", unit)))
            .collect())
    }

    async fn read_measurements(&self, compartment: &str, window: TimeWindow) -> Result<Vec<RawReading>> {
        let unit = self.unit(compartment)?;
        // Only live values exist on the bus.
        if !window.contains(self.clock.now()) {
            debug!("Unit {} has no history for {:?}", unit, window);
            return Ok(Vec::new());
        }
        Ok(vec![RawReading::Register(self.snapshot(unit).await?)])
    }

    async fn read_current(&self, compartment: &str, _window: TimeWindow) -> Result<Option<RawReading>> {
        let unit = self.unit(compartment)?;
        Ok(Some(RawReading::Register(self.snapshot(unit).await?)))
    }

    async fn read_setpoint(&self, compartment: &str) -> Result<RawSetpoint> {
        let unit = self.unit(compartment)?;
        let raw = self
            .transport
            .read_holding(unit, SETPOINT_BASE, SETPOINT_REGISTERS.len() as u16)
            .await?;
        Ok(SETPOINT_REGISTERS
            .iter()
            .filter_map(|reg| {
                let offset = (reg.address - SETPOINT_BASE) as usize;
                raw.get(offset).map(|value| (reg.path, reg.decode(*value)))
            })
            .collect())
    }

    async fn write_setpoint(&self, compartment: &str, parameter: ParameterPath, value: f64) -> Result<bool> {
        let unit = self.unit(compartment)?;
        let register = SetpointRegister::for_path(parameter)
            .ok_or_else(|| DeviceError::UnsupportedParameter(parameter.to_string()))?;
        let raw = if parameter.is_flag() {
            u16::from(value > 0.0)
        } else {
            register.encode(value)?
        };
        self.transport.write_single(unit, register.address, raw).await?;
        debug!("Unit {} register {} <- {}", unit, register.address, raw);
        Ok(true)
    }

    async fn disconnect(&self) -> Result<()> {
        self.transport.close().await
    }
}
