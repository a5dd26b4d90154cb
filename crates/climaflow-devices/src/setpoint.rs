/*!
 * Canonical setpoint configuration.
 *
 * Every vendor speaks its own setpoint dialect; inside ClimaFlow a setpoint
 * is the nested [`SetpointConfig`] and a single writable leaf of it is
 * addressed by a [`ParameterPath`] such as `temperature.day`.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DeviceError;

/// Address of one writable setpoint leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParameterPath {
    /// Day air temperature target (°C)
    TemperatureDay,
    /// Night air temperature target (°C)
    TemperatureNight,
    /// Temperature deadband (°C)
    TemperatureDeadband,
    /// Day relative humidity target (%)
    HumidityDay,
    /// Night relative humidity target (%)
    HumidityNight,
    /// Humidity deadband (%)
    HumidityDeadband,
    /// Day CO2 target (ppm)
    Co2Day,
    /// Night CO2 target (ppm)
    Co2Night,
    /// CO2 dosing enabled (1) or disabled (0)
    Co2Dosing,
    /// Photoperiod (hours)
    LightingPhotoperiod,
    /// Supplemental light intensity (%)
    LightingIntensity,
    /// Lights-on hour of day
    LightingSunrise,
    /// Lights-off hour of day
    LightingSunset,
    /// Daily light integral target (mol/m²/day)
    LightingDli,
    /// Minutes between irrigation cycles
    IrrigationInterval,
    /// Irrigation cycle length (seconds)
    IrrigationDuration,
    /// Nutrient solution EC (mS/cm)
    IrrigationEc,
    /// Nutrient solution pH
    IrrigationPh,
    /// Humidity control strategy enabled
    StrategyHumidityControl,
    /// CO2 enrichment strategy enabled
    StrategyCo2Enrichment,
    /// Energy screen strategy enabled
    StrategyEnergyScreens,
    /// Night temperature setback enabled
    StrategyNightSetback,
}

impl ParameterPath {
    /// Every known path
    pub const ALL: [ParameterPath; 22] = [
        ParameterPath::TemperatureDay,
        ParameterPath::TemperatureNight,
        ParameterPath::TemperatureDeadband,
        ParameterPath::HumidityDay,
        ParameterPath::HumidityNight,
        ParameterPath::HumidityDeadband,
        ParameterPath::Co2Day,
        ParameterPath::Co2Night,
        ParameterPath::Co2Dosing,
        ParameterPath::LightingPhotoperiod,
        ParameterPath::LightingIntensity,
        ParameterPath::LightingSunrise,
        ParameterPath::LightingSunset,
        ParameterPath::LightingDli,
        ParameterPath::IrrigationInterval,
        ParameterPath::IrrigationDuration,
        ParameterPath::IrrigationEc,
        ParameterPath::IrrigationPh,
        ParameterPath::StrategyHumidityControl,
        ParameterPath::StrategyCo2Enrichment,
        ParameterPath::StrategyEnergyScreens,
        ParameterPath::StrategyNightSetback,
    ];

    /// Dotted string form
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterPath::TemperatureDay => "temperature.day",
            ParameterPath::TemperatureNight => "temperature.night",
            ParameterPath::TemperatureDeadband => "temperature.deadband",
            ParameterPath::HumidityDay => "humidity.day",
            ParameterPath::HumidityNight => "humidity.night",
            ParameterPath::HumidityDeadband => "humidity.deadband",
            ParameterPath::Co2Day => "co2.day",
            ParameterPath::Co2Night => "co2.night",
            ParameterPath::Co2Dosing => "co2.dosing",
            ParameterPath::LightingPhotoperiod => "lighting.photoperiod",
            ParameterPath::LightingIntensity => "lighting.intensity",
            ParameterPath::LightingSunrise => "lighting.sunrise",
            ParameterPath::LightingSunset => "lighting.sunset",
            ParameterPath::LightingDli => "lighting.dli",
            ParameterPath::IrrigationInterval => "irrigation.intervalMinutes",
            ParameterPath::IrrigationDuration => "irrigation.durationSeconds",
            ParameterPath::IrrigationEc => "irrigation.ec",
            ParameterPath::IrrigationPh => "irrigation.ph",
            ParameterPath::StrategyHumidityControl => "strategies.humidityControl",
            ParameterPath::StrategyCo2Enrichment => "strategies.co2Enrichment",
            ParameterPath::StrategyEnergyScreens => "strategies.energyScreens",
            ParameterPath::StrategyNightSetback => "strategies.nightSetback",
        }
    }

    /// Whether the leaf is a flag (written as 0/1)
    pub fn is_flag(&self) -> bool {
        matches!(
            self,
            ParameterPath::Co2Dosing
                | ParameterPath::StrategyHumidityControl
                | ParameterPath::StrategyCo2Enrichment
                | ParameterPath::StrategyEnergyScreens
                | ParameterPath::StrategyNightSetback
        )
    }
}

impl fmt::Display for ParameterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParameterPath {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ParameterPath::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DeviceError::UnsupportedParameter(s.to_string()))
    }
}

impl Serialize for ParameterPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ParameterPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A flat `parameter -> value` view of a controller's setpoint, as adapters read it
pub type RawSetpoint = BTreeMap<ParameterPath, f64>;

/// Temperature targets
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureTargets {
    /// Day target (°C)
    pub day: f64,
    /// Night target (°C)
    pub night: f64,
    /// Deadband (°C)
    pub deadband: f64,
}

/// Humidity targets
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumidityTargets {
    /// Day target (% RH)
    pub day: f64,
    /// Night target (% RH)
    pub night: f64,
    /// Deadband (% RH)
    pub deadband: f64,
}

/// CO2 targets
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Co2Targets {
    /// Day target (ppm)
    pub day: f64,
    /// Night target (ppm)
    pub night: f64,
    /// Dosing enabled
    pub dosing: bool,
}

/// Lighting targets
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightingTargets {
    /// Hours of light per day
    pub photoperiod: f64,
    /// Supplemental intensity (%)
    pub intensity: f64,
    /// Lights-on hour
    pub sunrise: f64,
    /// Lights-off hour
    pub sunset: f64,
    /// Daily light integral (mol/m²/day)
    pub dli: f64,
}

/// Irrigation timing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IrrigationTargets {
    /// Minutes between cycles
    pub interval_minutes: f64,
    /// Seconds per cycle
    pub duration_seconds: f64,
    /// Nutrient EC (mS/cm)
    pub ec: f64,
    /// Nutrient pH
    pub ph: f64,
}

/// Control strategy flags
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStrategies {
    /// Actively steer humidity
    pub humidity_control: bool,
    /// Enrich CO2 while lights are on
    pub co2_enrichment: bool,
    /// Close energy screens at night
    pub energy_screens: bool,
    /// Lower temperature at night
    pub night_setback: bool,
}

/// The canonical, nested setpoint shape
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetpointConfig {
    /// Temperature targets
    pub temperature: TemperatureTargets,
    /// Humidity targets
    pub humidity: HumidityTargets,
    /// CO2 targets
    pub co2: Co2Targets,
    /// Lighting targets
    pub lighting: LightingTargets,
    /// Irrigation timing
    pub irrigation: IrrigationTargets,
    /// Strategy flags
    pub strategies: ControlStrategies,
}

impl Default for SetpointConfig {
    fn default() -> Self {
        Self {
            temperature: TemperatureTargets {
                day: 22.0,
                night: 18.0,
                deadband: 1.0,
            },
            humidity: HumidityTargets {
                day: 70.0,
                night: 80.0,
                deadband: 5.0,
            },
            co2: Co2Targets {
                day: 800.0,
                night: 400.0,
                dosing: true,
            },
            lighting: LightingTargets {
                photoperiod: 16.0,
                intensity: 100.0,
                sunrise: 6.0,
                sunset: 22.0,
                dli: 17.0,
            },
            irrigation: IrrigationTargets {
                interval_minutes: 60.0,
                duration_seconds: 120.0,
                ec: 2.0,
                ph: 5.8,
            },
            strategies: ControlStrategies {
                humidity_control: true,
                co2_enrichment: true,
                energy_screens: true,
                night_setback: true,
            },
        }
    }
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

impl SetpointConfig {
    /// Read one leaf as a number (flags become 0/1)
    pub fn get(&self, path: ParameterPath) -> f64 {
        match path {
            ParameterPath::TemperatureDay => self.temperature.day,
            ParameterPath::TemperatureNight => self.temperature.night,
            ParameterPath::TemperatureDeadband => self.temperature.deadband,
            ParameterPath::HumidityDay => self.humidity.day,
            ParameterPath::HumidityNight => self.humidity.night,
            ParameterPath::HumidityDeadband => self.humidity.deadband,
            ParameterPath::Co2Day => self.co2.day,
            ParameterPath::Co2Night => self.co2.night,
            ParameterPath::Co2Dosing => flag(self.co2.dosing),
            ParameterPath::LightingPhotoperiod => self.lighting.photoperiod,
            ParameterPath::LightingIntensity => self.lighting.intensity,
            ParameterPath::LightingSunrise => self.lighting.sunrise,
            ParameterPath::LightingSunset => self.lighting.sunset,
            ParameterPath::LightingDli => self.lighting.dli,
            ParameterPath::IrrigationInterval => self.irrigation.interval_minutes,
            ParameterPath::IrrigationDuration => self.irrigation.duration_seconds,
            ParameterPath::IrrigationEc => self.irrigation.ec,
            ParameterPath::IrrigationPh => self.irrigation.ph,
            ParameterPath::StrategyHumidityControl => flag(self.strategies.humidity_control),
            ParameterPath::StrategyCo2Enrichment => flag(self.strategies.co2_enrichment),
            ParameterPath::StrategyEnergyScreens => flag(self.strategies.energy_screens),
            ParameterPath::StrategyNightSetback => flag(self.strategies.night_setback),
        }
    }

    /// Set one leaf; flags are true for any value > 0
    pub fn set(&mut self, path: ParameterPath, value: f64) {
        let on = value > 0.0;
        match path {
            ParameterPath::TemperatureDay => self.temperature.day = value,
            ParameterPath::TemperatureNight => self.temperature.night = value,
            ParameterPath::TemperatureDeadband => self.temperature.deadband = value,
            ParameterPath::HumidityDay => self.humidity.day = value,
            ParameterPath::HumidityNight => self.humidity.night = value,
            ParameterPath::HumidityDeadband => self.humidity.deadband = value,
            ParameterPath::Co2Day => self.co2.day = value,
            ParameterPath::Co2Night => self.co2.night = value,
            ParameterPath::Co2Dosing => self.co2.dosing = on,
            ParameterPath::LightingPhotoperiod => self.lighting.photoperiod = value,
            ParameterPath::LightingIntensity => self.lighting.intensity = value,
            ParameterPath::LightingSunrise => self.lighting.sunrise = value,
            ParameterPath::LightingSunset => self.lighting.sunset = value,
            ParameterPath::LightingDli => self.lighting.dli = value,
            ParameterPath::IrrigationInterval => self.irrigation.interval_minutes = value,
            ParameterPath::IrrigationDuration => self.irrigation.duration_seconds = value,
            ParameterPath::IrrigationEc => self.irrigation.ec = value,
            ParameterPath::IrrigationPh => self.irrigation.ph = value,
            ParameterPath::StrategyHumidityControl => self.strategies.humidity_control = on,
            ParameterPath::StrategyCo2Enrichment => self.strategies.co2_enrichment = on,
            ParameterPath::StrategyEnergyScreens => self.strategies.energy_screens = on,
            ParameterPath::StrategyNightSetback => self.strategies.night_setback = on,
        }
    }

    /// A copy with the given changes applied
    pub fn with_changes(&self, changes: &[(ParameterPath, f64)]) -> Self {
        let mut next = *self;
        for (path, value) in changes {
            next.set(*path, *value);
        }
        next
    }

    /// Build from a controller's flat view; missing leaves keep their defaults
    pub fn from_parameters(raw: &RawSetpoint) -> Self {
        let mut config = SetpointConfig::default();
        for (path, value) in raw {
            config.set(*path, *value);
        }
        config
    }

    /// Flatten into the `parameter -> value` view
    pub fn to_parameters(&self) -> RawSetpoint {
        ParameterPath::ALL
            .iter()
            .map(|path| (*path, self.get(*path)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_path_round_trips_through_its_string() {
        for path in ParameterPath::ALL {
            let parsed: ParameterPath = path.as_str().parse().unwrap();
            assert_eq!(parsed, path);
        }
    }

    #[test]
    fn test_unknown_path_is_rejected() {
        let err = "temperature.noon".parse::<ParameterPath>().unwrap_err();
        assert!(matches!(err, DeviceError::UnsupportedParameter(_)));
    }

    #[test]
    fn test_paths_serialize_as_dotted_strings() {
        let json = serde_json::to_string(&ParameterPath::IrrigationInterval).unwrap();
        assert_eq!(json, "\"irrigation.intervalMinutes\"");
        let back: ParameterPath = serde_json::from_str("\"co2.dosing\"").unwrap();
        assert_eq!(back, ParameterPath::Co2Dosing);
    }

    #[test]
    fn test_set_and_get_flags() {
        let mut config = SetpointConfig::default();
        config.set(ParameterPath::Co2Dosing, 0.0);
        assert!(!config.co2.dosing);
        assert_eq!(config.get(ParameterPath::Co2Dosing), 0.0);
        config.set(ParameterPath::Co2Dosing, 1.0);
        assert!(config.co2.dosing);
    }

    #[test]
    fn test_from_parameters_keeps_defaults_for_missing_leaves() {
        let mut raw = RawSetpoint::new();
        raw.insert(ParameterPath::TemperatureDay, 24.5);
        let config = SetpointConfig::from_parameters(&raw);
        assert_eq!(config.temperature.day, 24.5);
        assert_eq!(config.temperature.night, SetpointConfig::default().temperature.night);
        assert_eq!(config.to_parameters().len(), ParameterPath::ALL.len());
    }

    #[test]
    fn test_nested_json_shape() {
        let json = serde_json::to_value(SetpointConfig::default()).unwrap();
        assert_eq!(json["temperature"]["day"], 22.0);
        assert_eq!(json["irrigation"]["intervalMinutes"], 60.0);
        assert_eq!(json["strategies"]["nightSetback"], true);
    }
}
