//! Shared HTTP plumbing for the REST vendors.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, ClientBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::device::ConnectionDescriptor;
use crate::error::{DeviceError, Result};

/// Build the HTTP client used by one adapter
pub fn build_client(timeout: Duration) -> Result<Client> {
    ClientBuilder::new()
        .timeout(timeout)
        .connect_timeout(timeout)
        .user_agent(format!("climaflow/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| DeviceError::connection(format!("Failed to build HTTP client: {e}")))
}

/// Parse the controller's base URL
pub fn base_url(descriptor: &ConnectionDescriptor) -> Result<Url> {
    Ok(Url::parse(&descriptor.base_url())?)
}

/// Append path segments to `base`, percent-encoding each one
pub fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| DeviceError::connection(format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Timestamp format used in range queries
pub fn query_time(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Whether the status means the session or token is no longer valid
pub fn is_auth_rejection(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// Turn a non-success response into an error
pub async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

/// Decode a successful JSON response
pub async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let response = ensure_success(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| DeviceError::protocol(format!("Malformed response body: {e}")))
}

/// Map the response of a setpoint write.
///
/// 2xx is accepted, any other 4xx is a refusal, everything else is a failure.
pub async fn write_outcome(response: Response) -> Result<bool> {
    let status = response.status();
    if status.is_success() {
        return Ok(true);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() && !is_auth_rejection(status) {
        debug!("Write refused with {status}: {body}");
        return Ok(false);
    }
    Err(status_error(status, &body))
}

fn status_error(status: StatusCode, body: &str) -> DeviceError {
    if is_auth_rejection(status) {
        DeviceError::Authentication(format!("HTTP {status}: {body}"))
    } else if status == StatusCode::NOT_FOUND {
        DeviceError::not_found(format!("HTTP {status}: {body}"))
    } else if status.is_server_error() {
        DeviceError::connection(format!("HTTP {status}: {body}"))
    } else {
        DeviceError::protocol(format!("HTTP {status}: {body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_endpoint_encodes_segments() {
        let base = Url::parse("http://controller:8080").unwrap();
        let url = endpoint(&base, &["compartments", "east wing", "setpoints", "temperature.day"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://controller:8080/compartments/east%20wing/setpoints/temperature.day"
        );
    }

    #[test]
    fn test_query_time_is_second_precision_utc() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 6, 30, 0).unwrap();
        assert_eq!(query_time(at), "2024-05-01T06:30:00Z");
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, ""),
            DeviceError::Authentication(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, ""),
            DeviceError::Connection(_)
        ));
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, ""),
            DeviceError::Protocol(_)
        ));
    }
}
