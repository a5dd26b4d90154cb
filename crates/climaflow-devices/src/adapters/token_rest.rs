//! Vendor A: JSON REST with a bearer token.
//!
//! The token comes from `POST /auth/token` and is reused until the
//! controller answers 401, at which point the adapter logs in once more and
//! retries the request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use climaflow_core::clock::SharedClock;
use climaflow_core::types::TimeWindow;

use super::http;
use crate::device::{Brand, ConnectionDescriptor, Credentials};
use crate::error::{DeviceError, Result};
use crate::measurement::TemperatureUnit;
use crate::protocol::{AdapterOptions, ClimateAdapter, CompartmentRef, RawReading, Session};
use crate::setpoint::{ParameterPath, RawSetpoint};

/// One vendor A measurement record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRestReading {
    /// Reading time
    pub timestamp: DateTime<Utc>,
    /// Unit of `temperature` and `dew_point`
    #[serde(default)]
    pub unit: TemperatureUnit,
    /// Air temperature
    pub temperature: f64,
    /// Relative humidity (%)
    pub humidity: f64,
    /// CO2 (ppm)
    #[serde(default)]
    pub co2: f64,
    /// Global radiation (W/m²)
    #[serde(default)]
    pub radiation: f64,
    /// VPD (kPa), when the controller computes it
    #[serde(default)]
    pub vpd: Option<f64>,
    /// Dew point, when the controller computes it
    #[serde(default)]
    pub dew_point: Option<f64>,
    /// Heating valve opening (%)
    #[serde(default)]
    pub heating_valve: f64,
    /// Vent opening (%)
    #[serde(default)]
    pub vent_position: f64,
    /// Misting output (%)
    #[serde(default)]
    pub misting: f64,
    /// Dehumidifier output (%)
    #[serde(default)]
    pub dehumidifier: f64,
    /// CO2 valve opening (%)
    #[serde(default)]
    pub co2_valve: f64,
    /// Lighting output (%)
    #[serde(default)]
    pub lighting: f64,
    /// Screen closure (%)
    #[serde(default)]
    pub screen_position: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct CompartmentRecord {
    id: String,
    name: String,
    #[serde(default)]
    area: Option<f64>,
    #[serde(default)]
    volume: Option<f64>,
    #[serde(default)]
    crop: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetpointRecord {
    parameter: String,
    value: f64,
}

/// Adapter for vendor A controllers
#[derive(Debug)]
pub struct TokenRestAdapter {
    client: Client,
    base_url: Url,
    credentials: Credentials,
    token: RwLock<Option<String>>,
    clock: SharedClock,
}

impl TokenRestAdapter {
    /// Create an adapter; nothing is sent until the first call
    pub fn new(descriptor: &ConnectionDescriptor, options: &AdapterOptions) -> Result<Self> {
        Ok(Self {
            client: http::build_client(options.timeout)?,
            base_url: http::base_url(descriptor)?,
            credentials: descriptor.credentials.clone().unwrap_or_default(),
            token: RwLock::new(None),
            clock: options.clock.clone(),
        })
    }

    async fn login(&self) -> Result<String> {
        let url = http::endpoint(&self.base_url, &["auth", "token"])?;
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
                "{} rejected the credentials for {}",
                self.base_url, self.credentials.username
            )));
        }
        let body: TokenResponse = http::read_json(response).await?;
        *self.token.write().await = Some(body.token.clone());
        debug!("Obtained token from {}", self.base_url);
        Ok(body.token)
    }

    async fn current_token(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.login().await
    }

    /// Send an authorized request, logging in again once on 401
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let token = self.current_token().await?;
        let response = build(&self.client).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("Token for {} expired, logging in again", self.base_url);
        *self.token.write().await = None;
        let token = self.login().await?;
        Ok(build(&self.client).bearer_auth(&token).send().await?)
    }
}

#[async_trait]
impl ClimateAdapter for TokenRestAdapter {
    fn brand(&self) -> Brand {
        Brand::VendorA
    }

    async fn authenticate(&self) -> Result<Session> {
        let token = self.login().await?;
        info!("Authenticated with {}", self.base_url);
        Ok(Session {
            token: Some(token),
            established_at: self.clock.now(),
        })
    }

    async fn list_compartments(&self) -> Result<Vec<CompartmentRef>> {
        let url = http::endpoint(&self.base_url, &["compartments"])?;
        let records: Vec<CompartmentRecord> =
            http::read_json(self.send(|c| c.get(url.clone())).await?).await?;
        Ok(records
            .into_iter()
            .map(|r| CompartmentRef {
                external_id: r.id,
                name: r.name,
                area: r.area,
                volume: r.volume,
                crop_type: r.crop,
            })
            .collect())
    }

    async fn read_measurements(&self, compartment: &str, window: TimeWindow) -> Result<Vec<RawReading>> {
        let url = http::endpoint(&self.base_url, &["compartments", compartment, "measurements"])?;
        let query = [
            ("start", http::query_time(window.start)),
            ("end", http::query_time(window.end)),
        ];
        let readings: Vec<TokenRestReading> =
            http::read_json(self.send(|c| c.get(url.clone()).query(&query)).await?).await?;
        Ok(readings.into_iter().map(RawReading::TokenRest).collect())
    }

    async fn read_setpoint(&self, compartment: &str) -> Result<RawSetpoint> {
        let url = http::endpoint(&self.base_url, &["compartments", compartment, "setpoints"])?;
        let records: Vec<SetpointRecord> =
            http::read_json(self.send(|c| c.get(url.clone())).await?).await?;

        let mut setpoint = RawSetpoint::new();
        for record in records {
            match record.parameter.parse::<ParameterPath>() {
                Ok(path) => {
                    setpoint.insert(path, record.value);
                }
                Err(_) => debug!("Ignoring unknown parameter {}", record.parameter),
            }
        }
        Ok(setpoint)
    }

    async fn write_setpoint(&self, compartment: &str, parameter: ParameterPath, value: f64) -> Result<bool> {
        let url = http::endpoint(
            &self.base_url,
            &["compartments", compartment, "setpoints", parameter.as_str()],
        )?;
        let body = json!({ "value": value });
        let response = self.send(|c| c.put(url.clone()).json(&body)).await?;
        http::write_outcome(response).await
    }

    async fn disconnect(&self) -> Result<()> {
        *self.token.write().await = None;
        Ok(())
    }
}
