/*!
 * Canonical measurement record.
 */
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use climaflow_core::types::Id;

/// Temperature unit reported by a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TemperatureUnit {
    /// Degrees Celsius
    #[default]
    #[serde(rename = "C", alias = "c", alias = "celsius")]
    Celsius,
    /// Degrees Fahrenheit
    #[serde(rename = "F", alias = "f", alias = "fahrenheit")]
    Fahrenheit,
}

impl TemperatureUnit {
    /// Convert a value in this unit to °C
    pub fn to_celsius(&self, value: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => value,
            TemperatureUnit::Fahrenheit => fahrenheit_to_celsius(value),
        }
    }
}

impl fmt::Display for TemperatureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemperatureUnit::Celsius => write!(f, "°C"),
            TemperatureUnit::Fahrenheit => write!(f, "°F"),
        }
    }
}

/// °F to °C
pub fn fahrenheit_to_celsius(value: f64) -> f64 {
    (value - 32.0) * 5.0 / 9.0
}

/// °C to °F
pub fn celsius_to_fahrenheit(value: f64) -> f64 {
    value * 9.0 / 5.0 + 32.0
}

/// An immutable snapshot of live readings for one compartment.
///
/// Temperatures are °C, humidity is % RH, CO2 is ppm, light is W/m²,
/// VPD and dew point are kPa and °C.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClimateMeasurement {
    /// Controller the reading came from
    pub device_id: Id,
    /// Compartment the reading describes
    pub compartment_id: Id,
    /// Reading time
    pub timestamp: DateTime<Utc>,
    /// Air temperature
    pub temperature: f64,
    /// Relative humidity
    pub humidity: f64,
    /// CO2 concentration
    pub co2: f64,
    /// Global radiation
    pub light: f64,
    /// Vapor pressure deficit
    pub vpd: f64,
    /// Dew point
    pub dew_point: f64,
    /// Heating running
    pub heating_active: bool,
    /// Ventilation or cooling running
    pub cooling_active: bool,
    /// Misting running
    pub humidification_active: bool,
    /// Dehumidifier running
    pub dehumidification_active: bool,
    /// CO2 valve open
    pub co2_dosing_active: bool,
    /// Supplemental lights on
    pub lights_active: bool,
    /// Screen closure (%)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_position: Option<f64>,
}
