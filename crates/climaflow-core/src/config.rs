/*!
 * Configuration management for ClimaFlow.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for the synchronization loop and the advisory rules.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for ClimaFlow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Synchronization loop configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Advisory rule configuration
    #[serde(default)]
    pub advisory: AdvisoryConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (e.g. "info", "climaflow_engine=debug")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// Synchronization loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval used when a device does not carry its own
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: u64,

    /// Upper bound for every single adapter call
    #[serde(default = "default_adapter_timeout_ms")]
    pub adapter_timeout_ms: u64,

    /// Trailing window used when asking a controller for its latest reading
    #[serde(default = "default_measurement_window_secs")]
    pub measurement_window_secs: u64,

    /// Cap for the exponential backoff after failed cycles
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Refresh the compartment catalog after every successful connect
    #[serde(default = "default_true")]
    pub discover_compartments: bool,

    /// Capacity of the outbound event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// One temperature band of the optimal-VPD table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VpdBand {
    /// Band applies while the air temperature (°F) is below this value
    pub below_fahrenheit: f64,
    /// Optimal VPD in kPa inside the band
    pub optimal_kpa: f64,
}

/// Optimal VPD lookup by air temperature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpdBands {
    /// Optimal VPD above the last band
    pub above_kpa: f64,
    /// Bands in ascending temperature order
    pub bands: Vec<VpdBand>,
}

impl VpdBands {
    /// Optimal VPD (kPa) for an air temperature in °F
    pub fn optimal_for(&self, temperature_fahrenheit: f64) -> f64 {
        self.bands
            .iter()
            .find(|band| temperature_fahrenheit < band.below_fahrenheit)
            .map(|band| band.optimal_kpa)
            .unwrap_or(self.above_kpa)
    }
}

impl Default for VpdBands {
    fn default() -> Self {
        Self {
            above_kpa: 1.3,
            bands: vec![
                VpdBand {
                    below_fahrenheit: 75.0,
                    optimal_kpa: 0.9,
                },
                VpdBand {
                    below_fahrenheit: 80.0,
                    optimal_kpa: 1.1,
                },
            ],
        }
    }
}

/// Advisory rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryConfig {
    /// Temperature deviation (°C) that triggers a correction
    #[serde(default = "default_temperature_threshold")]
    pub temperature_threshold: f64,

    /// VPD deviation (kPa) that triggers a humidity correction
    #[serde(default = "default_vpd_threshold")]
    pub vpd_threshold: f64,

    /// CO2 dosing is proposed below this fraction of the day setpoint
    #[serde(default = "default_co2_ratio")]
    pub co2_ratio: f64,

    /// Night overshoot (°C) that triggers the energy-saving advice
    #[serde(default = "default_energy_margin")]
    pub energy_margin: f64,

    /// Energy used per degree of heating, in kWh
    #[serde(default = "default_kwh_per_degree")]
    pub kwh_per_degree: f64,

    /// Energy price per kWh
    #[serde(default = "default_energy_price")]
    pub energy_price_per_kwh: f64,

    /// Lifetime of regular advice
    #[serde(default = "default_expiry_minutes")]
    pub expiry_minutes: i64,

    /// Lifetime of energy-saving advice
    #[serde(default = "default_energy_expiry_minutes")]
    pub energy_expiry_minutes: i64,

    /// Default optimal-VPD bands
    #[serde(default)]
    pub vpd_bands: VpdBands,
}

impl SyncConfig {
    /// Timeout for a single adapter call
    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    /// Default interval between sync cycles
    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.default_interval_secs)
    }

    /// Trailing measurement window
    pub fn measurement_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.measurement_window_secs as i64)
    }

    /// Backoff cap
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_interval_secs(),
            adapter_timeout_ms: default_adapter_timeout_ms(),
            measurement_window_secs: default_measurement_window_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            discover_compartments: true,
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            temperature_threshold: default_temperature_threshold(),
            vpd_threshold: default_vpd_threshold(),
            co2_ratio: default_co2_ratio(),
            energy_margin: default_energy_margin(),
            kwh_per_degree: default_kwh_per_degree(),
            energy_price_per_kwh: default_energy_price(),
            expiry_minutes: default_expiry_minutes(),
            energy_expiry_minutes: default_energy_expiry_minutes(),
            vpd_bands: VpdBands::default(),
        }
    }
}

fn default_app_name() -> String {
    "climaflow".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    300
}

fn default_adapter_timeout_ms() -> u64 {
    10_000
}

fn default_measurement_window_secs() -> u64 {
    900
}

fn default_max_backoff_secs() -> u64 {
    3600
}

fn default_event_capacity() -> usize {
    1024
}

fn default_temperature_threshold() -> f64 {
    2.0
}

fn default_vpd_threshold() -> f64 {
    0.2
}

fn default_co2_ratio() -> f64 {
    0.9
}

fn default_energy_margin() -> f64 {
    1.0
}

fn default_kwh_per_degree() -> f64 {
    2.5
}

fn default_energy_price() -> f64 {
    0.25
}

fn default_expiry_minutes() -> i64 {
    60
}

fn default_energy_expiry_minutes() -> i64 {
    120
}

impl Config {
    /// Validate value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.sync.default_interval_secs == 0 {
            return Err(Error::config("sync.default_interval_secs must be positive"));
        }
        if self.sync.adapter_timeout_ms == 0 {
            return Err(Error::config("sync.adapter_timeout_ms must be positive"));
        }
        if !(0.0..=1.0).contains(&self.advisory.co2_ratio) {
            return Err(Error::config("advisory.co2_ratio must be within 0..=1"));
        }
        if self.advisory.expiry_minutes <= 0 || self.advisory.energy_expiry_minutes <= 0 {
            return Err(Error::config("advisory expiry windows must be positive"));
        }
        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            config.validate()?;
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&Config::default())
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
