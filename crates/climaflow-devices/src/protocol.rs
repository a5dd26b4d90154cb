/*!
 * Vendor protocol abstraction.
 *
 * Every vendor is a leaf implementation of [`ClimateAdapter`]; the
 * [`AdapterProvider`] picks one from the computer's brand when the registry
 * connects a device.
 */
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use climaflow_core::clock::{system_clock, SharedClock};
use climaflow_core::types::TimeWindow;

use crate::adapters::register::RegisterReading;
use crate::adapters::session_rest::SessionRestReading;
use crate::adapters::token_rest::TokenRestReading;
use crate::adapters::{SessionRestAdapter, TokenRestAdapter};
use crate::device::{Brand, ClimateComputer, Transport};
use crate::error::{DeviceError, Result};
use crate::setpoint::{ParameterPath, RawSetpoint};

/// Proof of a successful login
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Bearer token or session id; `None` for session-less protocols
    pub token: Option<String>,
    /// When the session was established
    pub established_at: DateTime<Utc>,
}

impl Session {
    /// A session-less acknowledgement
    pub fn anonymous(at: DateTime<Utc>) -> Self {
        Self {
            token: None,
            established_at: at,
        }
    }
}

/// A compartment as the controller lists it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompartmentRef {
    /// Identifier on the controller
    pub external_id: String,
    /// Display name
    pub name: String,
    /// Floor area (m²)
    #[serde(default)]
    pub area: Option<f64>,
    /// Air volume (m³)
    #[serde(default)]
    pub volume: Option<f64>,
    /// Crop grown
    #[serde(default)]
    pub crop_type: Option<String>,
}

impl CompartmentRef {
    /// A bare reference
    pub fn new<E: Into<String>, N: Into<String>>(external_id: E, name: N) -> Self {
        Self {
            external_id: external_id.into(),
            name: name.into(),
            area: None,
            volume: None,
            crop_type: None,
        }
    }
}

/// A reading in the vendor's own shape, tagged by vendor
#[derive(Debug, Clone, PartialEq)]
pub enum RawReading {
    /// Vendor A JSON reading
    TokenRest(TokenRestReading),
    /// Vendor B register snapshot
    Register(RegisterReading),
    /// Vendor C JSON reading
    SessionRest(SessionRestReading),
}

impl RawReading {
    /// When the controller took the reading
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            RawReading::TokenRest(r) => r.timestamp,
            RawReading::Register(r) => r.timestamp,
            RawReading::SessionRest(r) => r.recorded_at,
        }
    }

    /// Brand the reading belongs to
    pub fn brand(&self) -> Brand {
        match self {
            RawReading::TokenRest(_) => Brand::VendorA,
            RawReading::Register(_) => Brand::VendorB,
            RawReading::SessionRest(_) => Brand::VendorC,
        }
    }
}

/// Outcome of a multi-field setpoint write
#[derive(Debug, Default)]
pub struct WriteReport {
    /// Parameters the controller accepted
    pub applied: Vec<ParameterPath>,
    /// Parameters that failed
    pub failed: Vec<(ParameterPath, DeviceError)>,
}

impl WriteReport {
    /// Whether every field was applied
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Collapse the report into a result.
    ///
    /// Nothing applied means a plain failure with the first error; a mix of
    /// applied and failed fields is a [`DeviceError::PartialWrite`].
    pub fn into_result(self) -> Result<Vec<ParameterPath>> {
        if self.failed.is_empty() {
            return Ok(self.applied);
        }
        if self.applied.is_empty() {
            let mut failed = self.failed;
            let (_, first) = failed.remove(0);
            return Err(first);
        }
        Err(DeviceError::PartialWrite {
            applied: self.applied,
            failed: self
                .failed
                .into_iter()
                .map(|(path, err)| (path, err.to_string()))
                .collect(),
        })
    }
}

/// Canonical operations every vendor binds to its wire protocol
#[async_trait]
pub trait ClimateAdapter: Send + Sync + Debug {
    /// Vendor family
    fn brand(&self) -> Brand;

    /// Log in; fails with [`DeviceError::Authentication`] or a connection error
    async fn authenticate(&self) -> Result<Session>;

    /// Compartments the controller serves
    async fn list_compartments(&self) -> Result<Vec<CompartmentRef>>;

    /// Readings for a compartment inside `window`
    async fn read_measurements(&self, compartment: &str, window: TimeWindow)
        -> Result<Vec<RawReading>>;

    /// The newest reading inside `window`
    async fn read_current(&self, compartment: &str, window: TimeWindow) -> Result<Option<RawReading>> {
        let readings = self.read_measurements(compartment, window).await?;
        Ok(readings.into_iter().max_by_key(|r| r.timestamp()))
    }

    /// The controller's current setpoint, flattened
    async fn read_setpoint(&self, compartment: &str) -> Result<RawSetpoint>;

    /// Write one parameter; `Ok(false)` means the controller refused the value
    async fn write_setpoint(&self, compartment: &str, parameter: ParameterPath, value: f64)
        -> Result<bool>;

    /// Write several parameters, trying every one of them
    async fn write_setpoints(&self, compartment: &str, changes: &[(ParameterPath, f64)]) -> WriteReport {
        let mut report = WriteReport::default();
        for (parameter, value) in changes {
            match self.write_setpoint(compartment, *parameter, *value).await {
                Ok(true) => report.applied.push(*parameter),
                Ok(false) => {
                    warn!("Controller refused {} = {} on {}", parameter, value, compartment);
                    report.failed.push((
                        *parameter,
                        DeviceError::InvalidValue(format!("{} = {} refused by controller", parameter, value)),
                    ));
                }
                Err(e) => {
                    warn!("Writing {} on {} failed: {}", parameter, compartment, e);
                    report.failed.push((*parameter, e));
                }
            }
        }
        debug!(
            "Setpoint batch on {}: {} applied, {} failed",
            compartment,
            report.applied.len(),
            report.failed.len()
        );
        report
    }

    /// Release the session
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Adapter construction options
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Per-request timeout inside the adapter
    pub timeout: Duration,
    /// Time source for sessions and register snapshots
    pub clock: SharedClock,
    /// Register-protocol units used when the descriptor lists none
    pub default_units: Vec<u8>,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            clock: system_clock(),
            default_units: vec![1],
        }
    }
}

impl AdapterOptions {
    /// Creates default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the clock
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }
}

/// Builds the adapter for a computer
pub trait AdapterProvider: Send + Sync + Debug {
    /// Create a fresh adapter; no I/O happens here
    fn create(&self, computer: &ClimateComputer, options: &AdapterOptions) -> Result<Arc<dyn ClimateAdapter>>;
}

/// Picks the adapter by brand
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAdapterProvider;

impl AdapterProvider for DefaultAdapterProvider {
    fn create(&self, computer: &ClimateComputer, options: &AdapterOptions) -> Result<Arc<dyn ClimateAdapter>> {
        let transport = computer.connection.transport;
        match computer.brand {
            Brand::VendorA => {
                require_http(computer.brand, transport)?;
                Ok(Arc::new(TokenRestAdapter::new(&computer.connection, options)?))
            }
            Brand::VendorC => {
                require_http(computer.brand, transport)?;
                Ok(Arc::new(SessionRestAdapter::new(&computer.connection, options)?))
            }
            Brand::VendorB => {
                if transport != Transport::ModbusTcp {
                    return Err(DeviceError::UnsupportedProtocol(format!(
                        "{} speaks modbus_tcp, not {:?}",
                        computer.brand, transport
                    )));
                }
                register_adapter(computer, options)
            }
        }
    }
}

fn require_http(brand: Brand, transport: Transport) -> Result<()> {
    match transport {
        Transport::Http | Transport::Https => Ok(()),
        other => Err(DeviceError::UnsupportedProtocol(format!(
            "{} speaks HTTP, not {:?}",
            brand, other
        ))),
    }
}

#[cfg(feature = "modbus")]
fn register_adapter(computer: &ClimateComputer, options: &AdapterOptions) -> Result<Arc<dyn ClimateAdapter>> {
    use crate::adapters::register::{ModbusTcpTransport, RegisterAdapter};

    let address = computer
        .connection
        .socket_address()
        .parse()
        .map_err(|e| DeviceError::connection(format!("Invalid register address: {}", e)))?;
    let units = if computer.connection.units.is_empty() {
        options.default_units.clone()
    } else {
        computer.connection.units.clone()
    };
    let transport = ModbusTcpTransport::new(address, options.timeout);
    Ok(Arc::new(RegisterAdapter::new(Arc::new(transport), units, options)))
}

#[cfg(not(feature = "modbus"))]
fn register_adapter(computer: &ClimateComputer, _options: &AdapterOptions) -> Result<Arc<dyn ClimateAdapter>> {
    Err(DeviceError::UnsupportedProtocol(format!(
        "{} requires the `modbus` feature",
        computer.brand
    )))
}
