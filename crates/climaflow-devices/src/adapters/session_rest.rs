//! Vendor C: session REST.
//!
//! `POST /login` yields a session id that travels in the `X-Session-Id`
//! header. Compartments are greenhouses, every temperature on the wire is
//! Fahrenheit and settings are one flat `parameter -> value` map.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use climaflow_core::clock::SharedClock;
use climaflow_core::types::TimeWindow;

use super::http;
use crate::device::{Brand, ConnectionDescriptor, Credentials};
use crate::error::{DeviceError, Result};
use crate::measurement::{celsius_to_fahrenheit, fahrenheit_to_celsius};
use crate::protocol::{AdapterOptions, ClimateAdapter, CompartmentRef, RawReading, Session};
use crate::setpoint::{ParameterPath, RawSetpoint};

/// Header carrying the session id
pub const SESSION_HEADER: &str = "X-Session-Id";

/// One vendor C climate record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRestReading {
    /// Reading time
    pub recorded_at: DateTime<Utc>,
    /// Air temperature (°F)
    pub air_temp_f: f64,
    /// Relative humidity (%)
    pub relative_humidity: f64,
    /// CO2 (ppm)
    #[serde(default)]
    pub co2_ppm: f64,
    /// Global radiation (W/m²)
    #[serde(default)]
    pub solar_radiation: f64,
    /// Heating running
    #[serde(default)]
    pub heating: bool,
    /// Vent opening (%)
    #[serde(default)]
    pub vent_opening: f64,
    /// Fogging running
    #[serde(default)]
    pub fogging: bool,
    /// Dehumidifier running
    #[serde(default)]
    pub dehumidifying: bool,
    /// CO2 injection rate (%)
    #[serde(default)]
    pub co2_injection: f64,
    /// Grow lights on
    #[serde(default)]
    pub grow_lights: bool,
    /// Curtain closure (%)
    #[serde(default)]
    pub curtain_closure: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GreenhouseRecord {
    greenhouse_id: String,
    name: String,
    #[serde(default)]
    surface_m2: Option<f64>,
    #[serde(default)]
    volume_m3: Option<f64>,
    #[serde(default)]
    crop: Option<String>,
}

/// Convert a setpoint leaf from the vendor's units to canonical units
fn from_vendor(path: ParameterPath, value: f64) -> f64 {
    match path {
        ParameterPath::TemperatureDay | ParameterPath::TemperatureNight => fahrenheit_to_celsius(value),
        ParameterPath::TemperatureDeadband => value * 5.0 / 9.0,
        _ => value,
    }
}

/// Convert a setpoint leaf from canonical units to the vendor's units
fn to_vendor(path: ParameterPath, value: f64) -> f64 {
    match path {
        ParameterPath::TemperatureDay | ParameterPath::TemperatureNight => celsius_to_fahrenheit(value),
        ParameterPath::TemperatureDeadband => value * 9.0 / 5.0,
        _ => value,
    }
}

/// Adapter for vendor C controllers
#[derive(Debug)]
pub struct SessionRestAdapter {
    client: Client,
    base_url: Url,
    credentials: Credentials,
    session: RwLock<Option<String>>,
    clock: SharedClock,
}

impl SessionRestAdapter {
    /// Create an adapter; nothing is sent until the first call
    pub fn new(descriptor: &ConnectionDescriptor, options: &AdapterOptions) -> Result<Self> {
        Ok(Self {
            client: http::build_client(options.timeout)?,
            base_url: http::base_url(descriptor)?,
            credentials: descriptor.credentials.clone().unwrap_or_default(),
            session: RwLock::new(None),
            clock: options.clock.clone(),
        })
    }

    async fn login(&self) -> Result<String> {
        let url = http::endpoint(&self.base_url, &["login"])?;
        let response = self
            .client
            .post(url)
            .json(&json!({
                "username": self.credentials.username,
                "password": self.credentials.password,
            }))
            .send()
            .await?;

        if http::is_auth_rejection(response.status()) {
            return Err(DeviceError::Authentication(format!(
                "{} refused the login for {}",
                self.base_url, self.credentials.username
            )));
        }
        let body: LoginResponse = http::read_json(response).await?;
        *self.session.write().await = Some(body.session_id.clone());
        Ok(body.session_id)
    }

    async fn current_session(&self) -> Result<String> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(session);
        }
        self.login().await
    }

    /// Send a request inside the session, logging in again once if it lapsed
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let session = self.current_session().await?;
        let response = build(&self.client)
            .header(SESSION_HEADER, &session)
            .send()
            .await?;
        if !http::is_auth_rejection(response.status()) {
            return Ok(response);
        }

        warn!("Session on {} lapsed, logging in again", self.base_url);
        *self.session.write().await = None;
        let session = self.login().await?;
        Ok(build(&self.client)
            .header(SESSION_HEADER, &session)
            .send()
            .await?)
    }

    fn greenhouse(&self, id: &str, resource: &str) -> Result<Url> {
        http::endpoint(&self.base_url, &["greenhouses", id, resource])
    }
}

#[async_trait]
impl ClimateAdapter for SessionRestAdapter {
    fn brand(&self) -> Brand {
        Brand::VendorC
    }

    async fn authenticate(&self) -> Result<Session> {
        let session = self.login().await?;
        info!("Opened session on {}", self.base_url);
        Ok(Session {
            token: Some(session),
            established_at: self.clock.now(),
        })
    }

    async fn list_compartments(&self) -> Result<Vec<CompartmentRef>> {
        let url = http::endpoint(&self.base_url, &["greenhouses"])?;
        let records: Vec<GreenhouseRecord> =
            http::read_json(self.send(|c| c.get(url.clone())).await?).await?;
        Ok(records
            .into_iter()
            .map(|r| CompartmentRef {
                external_id: r.greenhouse_id,
                name: r.name,
                area: r.surface_m2,
                volume: r.volume_m3,
                crop_type: r.crop,
            })
            .collect())
    }

    async fn read_measurements(&self, compartment: &str, window: TimeWindow) -> Result<Vec<RawReading>> {
        let url = self.greenhouse(compartment, "history")?;
        let query = [
            ("start", http::query_time(window.start)),
            ("end", http::query_time(window.end)),
        ];
        let readings: Vec<SessionRestReading> =
            http::read_json(self.send(|c| c.get(url.clone()).query(&query)).await?).await?;
        Ok(readings.into_iter().map(RawReading::SessionRest).collect())
    }

    async fn read_current(&self, compartment: &str, _window: TimeWindow) -> Result<Option<RawReading>> {
        let url = self.greenhouse(compartment, "climate")?;
        let reading: SessionRestReading =
            http::read_json(self.send(|c| c.get(url.clone())).await?).await?;
        Ok(Some(RawReading::SessionRest(reading)))
    }

    async fn read_setpoint(&self, compartment: &str) -> Result<RawSetpoint> {
        let url = self.greenhouse(compartment, "settings")?;
        let settings: HashMap<String, Value> =
            http::read_json(self.send(|c| c.get(url.clone())).await?).await?;

        let mut setpoint = RawSetpoint::new();
        for (key, value) in settings {
            let Ok(path) = key.parse::<ParameterPath>() else {
                debug!("Ignoring unknown setting {}", key);
                continue;
            };
            let number = match value {
                Value::Bool(flag) => Some(if flag { 1.0 } else { 0.0 }),
                Value::Number(n) => n.as_f64(),
                _ => None,
            };
            match number {
                Some(v) => {
                    setpoint.insert(path, from_vendor(path, v));
                }
                None => debug!("Ignoring non-numeric setting {}", key),
            }
        }
        Ok(setpoint)
    }

    async fn write_setpoint(&self, compartment: &str, parameter: ParameterPath, value: f64) -> Result<bool> {
        let url = self.greenhouse(compartment, "settings")?;
        let wire_value = if parameter.is_flag() {
            json!(value > 0.0)
        } else {
            json!(to_vendor(parameter, value))
        };
        let body = json!({ "parameter": parameter.as_str(), "value": wire_value });
        let response = self.send(|c| c.put(url.clone()).json(&body)).await?;
        http::write_outcome(response).await
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };
        let url = http::endpoint(&self.base_url, &["logout"])?;
        match self
            .client
            .post(url)
            .header(SESSION_HEADER, session)
            .send()
            .await
        {
            Ok(_) => debug!("Closed session on {}", self.base_url),
            Err(e) => debug!("Logout from {} failed: {}", self.base_url, e),
        }
        Ok(())
    }
}
