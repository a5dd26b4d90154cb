/*!
 * Climate computer and compartment model.
 *
 * A [`ClimateComputer`] is one physical greenhouse controller. It owns the
 * [`ClimateCompartment`]s it serves; everything else refers to compartments
 * by id only.
 */
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use climaflow_core::config::VpdBands;
use climaflow_core::types::Id;

/// Vendor family of a climate computer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Brand {
    /// REST API with a bearer token
    VendorA,
    /// Register-addressed protocol
    VendorB,
    /// REST API with a session header
    VendorC,
}

impl Brand {
    /// Transport the vendor speaks when the descriptor does not say otherwise
    pub fn default_transport(&self) -> Transport {
        match self {
            Brand::VendorA | Brand::VendorC => Transport::Http,
            Brand::VendorB => Transport::ModbusTcp,
        }
    }
}

impl fmt::Display for Brand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Brand::VendorA => write!(f, "vendor_a"),
            Brand::VendorB => write!(f, "vendor_b"),
            Brand::VendorC => write!(f, "vendor_c"),
        }
    }
}

/// Wire transport used to reach the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Plain HTTP
    Http,
    /// HTTP over TLS
    Https,
    /// Modbus over TCP
    ModbusTcp,
}

/// Login material for a controller
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Create credentials
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How to reach a controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Wire transport
    pub transport: Transport,
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Login material, if the vendor needs any
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Register-protocol unit ids; each unit is one compartment
    #[serde(default)]
    pub units: Vec<u8>,
}

impl ConnectionDescriptor {
    /// HTTP descriptor
    pub fn http<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            transport: Transport::Http,
            host: host.into(),
            port,
            credentials: None,
            units: Vec::new(),
        }
    }

    /// Modbus TCP descriptor
    pub fn modbus_tcp<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            transport: Transport::ModbusTcp,
            host: host.into(),
            port,
            credentials: None,
            units: Vec::new(),
        }
    }

    /// Attach credentials
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the register-protocol unit ids
    pub fn with_units(mut self, units: Vec<u8>) -> Self {
        self.units = units;
        self
    }

    /// Base URL for the REST transports
    pub fn base_url(&self) -> String {
        let scheme = match self.transport {
            Transport::Https => "https",
            _ => "http",
        };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// `host:port`
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How far the engine may go with a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Read and store only
    Monitor,
    /// Also generate advice
    Advise,
    /// Also auto-apply eligible advice
    Control,
}

/// Direction of data exchange with the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFlow {
    /// Readings only
    ReadOnly,
    /// Setpoint writes only
    WriteOnly,
    /// Both
    Bidirectional,
}

impl DataFlow {
    /// Whether setpoint writes are permitted
    pub fn allows_write(&self) -> bool {
        matches!(self, DataFlow::WriteOnly | DataFlow::Bidirectional)
    }

    /// Whether readings are permitted
    pub fn allows_read(&self) -> bool {
        matches!(self, DataFlow::ReadOnly | DataFlow::Bidirectional)
    }
}

/// Which climate functions the controller manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Air temperature
    pub temperature: bool,
    /// Relative humidity
    pub humidity: bool,
    /// CO2 enrichment
    pub co2: bool,
    /// Supplemental lighting
    pub lighting: bool,
    /// Irrigation
    pub irrigation: bool,
    /// Shade and energy screens
    pub screens: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            temperature: true,
            humidity: true,
            co2: true,
            lighting: true,
            irrigation: false,
            screens: false,
        }
    }
}

/// Connection status of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Authenticated and usable
    Connected,
    /// No live adapter
    Disconnected,
    /// Last connect or sync failed
    Error,
    /// A sync cycle is running
    Syncing,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Error => write!(f, "error"),
            ConnectionStatus::Syncing => write!(f, "syncing"),
        }
    }
}

/// One physical climate controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimateComputer {
    /// Identifier
    pub id: Id,
    /// Display name
    pub name: String,
    /// Vendor family
    pub brand: Brand,
    /// Model designation
    #[serde(default)]
    pub model: String,
    /// Firmware or API version
    #[serde(default)]
    pub version: String,
    /// How to reach it
    pub connection: ConnectionDescriptor,
    /// Operating mode
    pub mode: OperatingMode,
    /// Data-flow direction
    pub data_flow: DataFlow,
    /// Seconds between sync cycles
    pub sync_interval_secs: u64,
    /// Managed climate functions
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Connection status
    pub status: ConnectionStatus,
    /// Last successful sync
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    /// Last connect or sync error
    #[serde(default)]
    pub last_error: Option<String>,
    /// Crop-stage specific optimal VPD bands
    #[serde(default)]
    pub vpd_bands: Option<VpdBands>,
}

impl ClimateComputer {
    /// Create a computer in monitor mode, disconnected
    pub fn new<N: Into<String>>(name: N, brand: Brand, connection: ConnectionDescriptor) -> Self {
        Self {
            id: Id::new(),
            name: name.into(),
            brand,
            model: String::new(),
            version: String::new(),
            connection,
            mode: OperatingMode::Monitor,
            data_flow: DataFlow::ReadOnly,
            sync_interval_secs: 300,
            capabilities: Capabilities::default(),
            status: ConnectionStatus::Disconnected,
            last_sync: None,
            last_error: None,
            vpd_bands: None,
        }
    }

    /// Set the identifier
    pub fn with_id<I: Into<Id>>(mut self, id: I) -> Self {
        self.id = id.into();
        self
    }

    /// Set the operating mode
    pub fn with_mode(mut self, mode: OperatingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the data-flow direction
    pub fn with_data_flow(mut self, data_flow: DataFlow) -> Self {
        self.data_flow = data_flow;
        self
    }

    /// Set the sync interval
    pub fn with_sync_interval(mut self, secs: u64) -> Self {
        self.sync_interval_secs = secs;
        self
    }

    /// Set the capability flags
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set device-specific VPD bands
    pub fn with_vpd_bands(mut self, bands: VpdBands) -> Self {
        self.vpd_bands = Some(bands);
        self
    }

    /// Whether reconnecting is needed before a sync
    pub fn needs_connect(&self) -> bool {
        matches!(
            self.status,
            ConnectionStatus::Disconnected | ConnectionStatus::Error
        )
    }

    /// Whether a change to `other` invalidates the live adapter
    pub fn connection_changed(&self, other: &ClimateComputer) -> bool {
        self.brand != other.brand || self.connection != other.connection
    }
}

/// A growing zone served by one computer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimateCompartment {
    /// `"{computer_id}:{external_id}"`
    pub id: Id,
    /// Owning computer
    pub computer_id: Id,
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
    /// Sensor inventory
    #[serde(default)]
    pub sensors: Vec<String>,
    /// Sub-zones
    #[serde(default)]
    pub sub_zones: Vec<String>,
}

impl ClimateCompartment {
    /// Compose the compartment id
    pub fn compose_id(computer_id: &Id, external_id: &str) -> Id {
        Id::from_string(format!("{}:{}", computer_id, external_id))
    }

    /// Create a compartment for `computer_id`
    pub fn new<E: Into<String>, N: Into<String>>(computer_id: Id, external_id: E, name: N) -> Self {
        let external_id = external_id.into();
        Self {
            id: Self::compose_id(&computer_id, &external_id),
            computer_id,
            external_id,
            name: name.into(),
            area: None,
            volume: None,
            crop_type: None,
            sensors: Vec::new(),
            sub_zones: Vec::new(),
        }
    }
}
