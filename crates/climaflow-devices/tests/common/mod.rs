//! WireMock-based controller mocks for the REST vendors.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::{json, Value};
use wiremock::{
    matchers::{body_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use climaflow_devices::{AdapterOptions, ConnectionDescriptor, Credentials};

/// Descriptor pointing at a mock server
pub fn descriptor_for(server: &MockServer) -> ConnectionDescriptor {
    let url = url::Url::parse(&server.uri()).unwrap();
    ConnectionDescriptor::http(url.host_str().unwrap(), url.port().unwrap())
        .with_credentials(Credentials::new("grower", "secret"))
}

/// Short timeouts so failing tests fail fast
pub fn options() -> AdapterOptions {
    AdapterOptions::default().with_timeout(Duration::from_secs(2))
}

/// Mock vendor A controller
pub struct MockTokenController {
    pub server: MockServer,
}

impl MockTokenController {
    /// Start a controller that hands out `token` for the right credentials
    pub async fn start(token: &str) -> Self {
        let server = MockServer::start().await;
        let controller = Self { server };
        controller.mock_login(token).await;
        controller
    }

    pub async fn mock_login(&self, token: &str) {
        Mock::given(method("POST"))
            .and(path("/auth/token"))
            .and(body_json(json!({"username": "grower", "password": "secret"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": token })))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_get(&self, route: &str, token: &str, body: Value) {
        Mock::given(method("GET"))
            .and(path(route))
            .and(header("authorization", format!("Bearer {token}").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    pub async fn mock_status(&self, verb: &str, route: &str, status: u16) {
        Mock::given(method(verb))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&self.server)
            .await;
    }
}

/// Mock vendor C controller
pub struct MockSessionController {
    pub server: MockServer,
}

impl MockSessionController {
    /// Start a controller that opens `session` on login
    pub async fn start(session: &str) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sessionId": session })))
            .mount(&server)
            .await;
        Self { server }
    }

    pub async fn mock_get(&self, route: &str, session: &str, body: Value) {
        Mock::given(method("GET"))
            .and(path(route))
            .and(header("x-session-id", session))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }
}

/// A vendor C climate record at 20 °C
pub fn session_reading(recorded_at: &str) -> Value {
    json!({
        "recordedAt": recorded_at,
        "airTempF": 68.0,
        "relativeHumidity": 70.0,
        "co2Ppm": 650.0,
        "solarRadiation": 180.0,
        "heating": true,
        "ventOpening": 0.0,
        "growLights": false
    })
}
