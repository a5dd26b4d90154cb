/*!
 * Measurement normalization.
 *
 * Turns a vendor [`RawReading`] into a canonical [`ClimateMeasurement`],
 * deriving VPD and dew point when the vendor leaves them out. Everything in
 * here is pure.
 */
use climaflow_core::types::Id;

use crate::adapters::register::{RegisterField, RegisterReading};
use crate::adapters::session_rest::SessionRestReading;
use crate::adapters::token_rest::TokenRestReading;
use crate::measurement::{fahrenheit_to_celsius, ClimateMeasurement};
use crate::protocol::RawReading;

const MAGNUS_A: f64 = 17.27;
const MAGNUS_B: f64 = 237.3;
const SVP_ZERO_KPA: f64 = 0.6108;

/// Saturation vapor pressure (kPa) at `temperature` °C
pub fn saturation_vapor_pressure(temperature: f64) -> f64 {
    SVP_ZERO_KPA * (MAGNUS_A * temperature / (temperature + MAGNUS_B)).exp()
}

/// Vapor pressure deficit (kPa); humidity is clamped to 0..=100 %
pub fn vapor_pressure_deficit(temperature: f64, humidity: f64) -> f64 {
    let svp = saturation_vapor_pressure(temperature);
    let avp = humidity.clamp(0.0, 100.0) / 100.0 * svp;
    (svp - avp).max(0.0)
}

/// Dew point (°C) via the inverse Magnus formula
pub fn dew_point(temperature: f64, humidity: f64) -> f64 {
    let rh = humidity.clamp(0.01, 100.0);
    let gamma = (rh / 100.0).ln() + MAGNUS_A * temperature / (temperature + MAGNUS_B);
    MAGNUS_B * gamma / (MAGNUS_A - gamma)
}

/// Relative humidity (%) that yields `vpd` kPa at `temperature` °C
pub fn humidity_for_vpd(temperature: f64, vpd: f64) -> f64 {
    let svp = saturation_vapor_pressure(temperature);
    ((1.0 - vpd / svp) * 100.0).clamp(0.0, 100.0)
}

fn active(value: f64) -> bool {
    value > 0.0
}

/// Normalize one vendor reading for `compartment_id` on `device_id`
pub fn normalize(device_id: &Id, compartment_id: &Id, reading: &RawReading) -> ClimateMeasurement {
    match reading {
        RawReading::TokenRest(r) => from_token_rest(device_id, compartment_id, r),
        RawReading::Register(r) => from_registers(device_id, compartment_id, r),
        RawReading::SessionRest(r) => from_session_rest(device_id, compartment_id, r),
    }
}

fn from_token_rest(device_id: &Id, compartment_id: &Id, r: &TokenRestReading) -> ClimateMeasurement {
    let temperature = r.unit.to_celsius(r.temperature);
    ClimateMeasurement {
        device_id: device_id.clone(),
        compartment_id: compartment_id.clone(),
        timestamp: r.timestamp,
        temperature,
        humidity: r.humidity,
        co2: r.co2,
        light: r.radiation,
        vpd: r
            .vpd
            .unwrap_or_else(|| vapor_pressure_deficit(temperature, r.humidity)),
        dew_point: r
            .dew_point
            .map(|dp| r.unit.to_celsius(dp))
            .unwrap_or_else(|| dew_point(temperature, r.humidity)),
        heating_active: active(r.heating_valve),
        cooling_active: active(r.vent_position),
        humidification_active: active(r.misting),
        dehumidification_active: active(r.dehumidifier),
        co2_dosing_active: active(r.co2_valve),
        lights_active: active(r.lighting),
        screen_position: r.screen_position,
    }
}

fn from_registers(device_id: &Id, compartment_id: &Id, r: &RegisterReading) -> ClimateMeasurement {
    let field = |f: RegisterField| r.scaled(f).unwrap_or(0.0);
    let temperature = field(RegisterField::Temperature);
    let humidity = field(RegisterField::Humidity);
    ClimateMeasurement {
        device_id: device_id.clone(),
        compartment_id: compartment_id.clone(),
        timestamp: r.timestamp,
        temperature,
        humidity,
        co2: field(RegisterField::Co2),
        light: field(RegisterField::Radiation),
        vpd: vapor_pressure_deficit(temperature, humidity),
        dew_point: dew_point(temperature, humidity),
        heating_active: active(field(RegisterField::HeatingValve)),
        cooling_active: active(field(RegisterField::Ventilation)),
        humidification_active: active(field(RegisterField::Misting)),
        dehumidification_active: active(field(RegisterField::Dehumidifier)),
        co2_dosing_active: active(field(RegisterField::Co2Valve)),
        lights_active: active(field(RegisterField::Lighting)),
        screen_position: r.scaled(RegisterField::Screen),
    }
}

fn from_session_rest(device_id: &Id, compartment_id: &Id, r: &SessionRestReading) -> ClimateMeasurement {
    let temperature = fahrenheit_to_celsius(r.air_temp_f);
    ClimateMeasurement {
        device_id: device_id.clone(),
        compartment_id: compartment_id.clone(),
        timestamp: r.recorded_at,
        temperature,
        humidity: r.relative_humidity,
        co2: r.co2_ppm,
        light: r.solar_radiation,
        vpd: vapor_pressure_deficit(temperature, r.relative_humidity),
        dew_point: dew_point(temperature, r.relative_humidity),
        heating_active: r.heating,
        cooling_active: active(r.vent_opening),
        humidification_active: r.fogging,
        dehumidification_active: r.dehumidifying,
        co2_dosing_active: active(r.co2_injection),
        lights_active: r.grow_lights,
        screen_position: r.curtain_closure,
    }
}
