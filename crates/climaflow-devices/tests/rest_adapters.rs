//! REST vendor adapters against mocked controllers.

use chrono::{TimeZone, Utc};
use serde_json::json;
use wiremock::{
    matchers::{body_json, header, method, path, query_param},
    Mock, ResponseTemplate,
};

use climaflow_core::types::TimeWindow;
use climaflow_devices::adapters::{SessionRestAdapter, TokenRestAdapter};
use climaflow_devices::normalizer::normalize;
use climaflow_devices::prelude::Id;
use climaflow_devices::{ClimateAdapter, DeviceError, ParameterPath, RawReading};

mod common;
use common::{descriptor_for, options, session_reading, MockSessionController, MockTokenController};

fn window() -> TimeWindow {
    TimeWindow::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 5, 1, 6, 15, 0).unwrap(),
    )
}

#[test_log::test(tokio::test)]
async fn token_adapter_authenticates_and_lists_compartments() {
    let controller = MockTokenController::start("tok-1").await;
    controller
        .mock_get(
            "/compartments",
            "tok-1",
            json!([
                {"id": "1", "name": "Tomatoes", "area": 1200.0, "crop": "tomato"},
                {"id": "2", "name": "Peppers"}
            ]),
        )
        .await;

    let adapter = TokenRestAdapter::new(&descriptor_for(&controller.server), &options()).unwrap();
    let session = adapter.authenticate().await.unwrap();
    assert_eq!(session.token.as_deref(), Some("tok-1"));

    let compartments = adapter.list_compartments().await.unwrap();
    assert_eq!(compartments.len(), 2);
    assert_eq!(compartments[0].external_id, "1");
    assert_eq!(compartments[0].crop_type.as_deref(), Some("tomato"));
    assert_eq!(compartments[1].area, None);
}

#[tokio::test]
async fn token_adapter_rejects_bad_credentials() {
    let controller = MockTokenController::start("unused").await;
    let mut descriptor = descriptor_for(&controller.server);
    descriptor.credentials = Some(climaflow_devices::Credentials::new("grower", "wrong"));
    Mock::given(method("POST"))
        .and(path("/auth/token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&controller.server)
        .await;

    let adapter = TokenRestAdapter::new(&descriptor, &options()).unwrap();
    let err = adapter.authenticate().await.unwrap_err();
    assert!(matches!(err, DeviceError::Authentication(_)));
    assert!(err.is_connection_failure());
}

#[tokio::test]
async fn token_adapter_logs_in_again_after_401() {
    let server = wiremock::MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "old"})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "new"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/compartments"))
        .and(header("authorization", "Bearer old"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/compartments"))
        .and(header("authorization", "Bearer new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "7", "name": "Cucumbers"}])))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = TokenRestAdapter::new(&descriptor_for(&server), &options()).unwrap();
    adapter.authenticate().await.unwrap();
    let compartments = adapter.list_compartments().await.unwrap();
    assert_eq!(compartments[0].external_id, "7");
}

#[tokio::test]
async fn token_adapter_reads_measurements_in_window() {
    let controller = MockTokenController::start("tok").await;
    Mock::given(method("GET"))
        .and(path("/compartments/1/measurements"))
        .and(query_param("start", "2024-05-01T06:00:00Z"))
        .and(query_param("end", "2024-05-01T06:15:00Z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"timestamp": "2024-05-01T06:05:00Z", "temperature": 21.0, "humidity": 70.0, "co2": 600.0},
            {"timestamp": "2024-05-01T06:10:00Z", "unit": "F", "temperature": 71.6, "humidity": 68.0,
             "co2": 640.0, "lighting": 80.0, "co2Valve": 20.0}
        ])))
        .mount(&controller.server)
        .await;

    let adapter = TokenRestAdapter::new(&descriptor_for(&controller.server), &options()).unwrap();
    let readings = adapter.read_measurements("1", window()).await.unwrap();
    assert_eq!(readings.len(), 2);

    let latest = adapter.read_current("1", window()).await.unwrap().unwrap();
    assert_eq!(latest.timestamp(), Utc.with_ymd_and_hms(2024, 5, 1, 6, 10, 0).unwrap());

    let measurement = normalize(&Id::from_string("dev"), &Id::from_string("dev:1"), &latest);
    assert!((measurement.temperature - 22.0).abs() < 1e-9);
    assert!(measurement.lights_active);
    assert!(measurement.co2_dosing_active);
    assert!(measurement.vpd > 0.0);
}

#[tokio::test]
async fn token_adapter_setpoint_round_trip() {
    let controller = MockTokenController::start("tok").await;
    controller
        .mock_get(
            "/compartments/1/setpoints",
            "tok",
            json!([
                {"parameter": "temperature.day", "value": 22.5},
                {"parameter": "co2.dosing", "value": 1.0},
                {"parameter": "firmware.secret", "value": 3.0}
            ]),
        )
        .await;
    Mock::given(method("PUT"))
        .and(path("/compartments/1/setpoints/temperature.day"))
        .and(body_json(json!({"value": 23.0})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&controller.server)
        .await;
    controller
        .mock_status("PUT", "/compartments/1/setpoints/co2.day", 422)
        .await;
    controller
        .mock_status("PUT", "/compartments/1/setpoints/humidity.day", 503)
        .await;

    let adapter = TokenRestAdapter::new(&descriptor_for(&controller.server), &options()).unwrap();
    let setpoint = adapter.read_setpoint("1").await.unwrap();
    assert_eq!(setpoint.len(), 2);
    assert_eq!(setpoint[&ParameterPath::TemperatureDay], 22.5);

    assert!(adapter
        .write_setpoint("1", ParameterPath::TemperatureDay, 23.0)
        .await
        .unwrap());
    assert!(!adapter.write_setpoint("1", ParameterPath::Co2Day, 5000.0).await.unwrap());
    assert!(matches!(
        adapter.write_setpoint("1", ParameterPath::HumidityDay, 70.0).await,
        Err(DeviceError::Connection(_))
    ));
}

#[tokio::test]
async fn token_adapter_batch_write_is_partial_when_one_field_fails() {
    let controller = MockTokenController::start("tok").await;
    controller
        .mock_status("PUT", "/compartments/1/setpoints/temperature.day", 200)
        .await;
    controller
        .mock_status("PUT", "/compartments/1/setpoints/temperature.night", 500)
        .await;

    let adapter = TokenRestAdapter::new(&descriptor_for(&controller.server), &options()).unwrap();
    let report = adapter
        .write_setpoints(
            "1",
            &[
                (ParameterPath::TemperatureDay, 22.0),
                (ParameterPath::TemperatureNight, 17.0),
            ],
        )
        .await;
    assert_eq!(report.applied, vec![ParameterPath::TemperatureDay]);
    match report.into_result() {
        Err(DeviceError::PartialWrite { applied, failed }) => {
            assert_eq!(applied.len(), 1);
            assert_eq!(failed[0].0, ParameterPath::TemperatureNight);
        }
        other => panic!("expected partial write, got {:?}", other),
    }
}

#[tokio::test]
async fn session_adapter_sends_session_header_and_reads_climate() {
    let controller = MockSessionController::start("sess-9").await;
    controller
        .mock_get(
            "/greenhouses",
            "sess-9",
            json!([{"greenhouseId": "gh-a", "name": "Roses", "surfaceM2": 800.0}]),
        )
        .await;
    controller
        .mock_get(
            "/greenhouses/gh-a/climate",
            "sess-9",
            session_reading("2024-05-01T06:12:00Z"),
        )
        .await;

    let adapter = SessionRestAdapter::new(&descriptor_for(&controller.server), &options()).unwrap();
    let compartments = adapter.list_compartments().await.unwrap();
    assert_eq!(compartments[0].external_id, "gh-a");
    assert_eq!(compartments[0].area, Some(800.0));

    let reading = adapter.read_current("gh-a", window()).await.unwrap().unwrap();
    assert!(matches!(reading, RawReading::SessionRest(_)));
    let measurement = normalize(&Id::from_string("dev"), &Id::from_string("dev:gh-a"), &reading);
    assert!((measurement.temperature - 20.0).abs() < 1e-9);
    assert!(measurement.heating_active);
    assert!(!measurement.lights_active);
}

#[tokio::test]
async fn session_adapter_history_uses_date_range() {
    let controller = MockSessionController::start("sess").await;
    Mock::given(method("GET"))
        .and(path("/greenhouses/gh-a/history"))
        .and(header("x-session-id", "sess"))
        .and(query_param("start", "2024-05-01T06:00:00Z"))
        .and(query_param("end", "2024-05-01T06:15:00Z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            session_reading("2024-05-01T06:00:00Z"),
            session_reading("2024-05-01T06:05:00Z"),
            session_reading("2024-05-01T06:10:00Z")
        ])))
        .mount(&controller.server)
        .await;

    let adapter = SessionRestAdapter::new(&descriptor_for(&controller.server), &options()).unwrap();
    let readings = adapter.read_measurements("gh-a", window()).await.unwrap();
    assert_eq!(readings.len(), 3);
}

#[tokio::test]
async fn session_adapter_converts_settings_units() {
    let controller = MockSessionController::start("sess").await;
    controller
        .mock_get(
            "/greenhouses/gh-a/settings",
            "sess",
            json!({"temperature.day": 68.0, "co2.dosing": true, "co2.day": 900, "vendor.mode": "auto"}),
        )
        .await;
    Mock::given(method("PUT"))
        .and(path("/greenhouses/gh-a/settings"))
        .and(header("x-session-id", "sess"))
        .and(body_json(json!({"parameter": "temperature.day", "value": 68.0})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&controller.server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/greenhouses/gh-a/settings"))
        .and(body_json(json!({"parameter": "co2.dosing", "value": false})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&controller.server)
        .await;

    let adapter = SessionRestAdapter::new(&descriptor_for(&controller.server), &options()).unwrap();
    let setpoint = adapter.read_setpoint("gh-a").await.unwrap();
    assert_eq!(setpoint[&ParameterPath::TemperatureDay], 20.0);
    assert_eq!(setpoint[&ParameterPath::Co2Dosing], 1.0);
    assert_eq!(setpoint[&ParameterPath::Co2Day], 900.0);
    assert_eq!(setpoint.len(), 3);

    assert!(adapter
        .write_setpoint("gh-a", ParameterPath::TemperatureDay, 20.0)
        .await
        .unwrap());
    assert!(adapter
        .write_setpoint("gh-a", ParameterPath::Co2Dosing, 0.0)
        .await
        .unwrap());
}

#[tokio::test]
async fn session_adapter_logs_in_again_when_session_lapses() {
    let server = wiremock::MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sessionId": "first"})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sessionId": "second"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/greenhouses"))
        .and(header("x-session-id", "first"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/greenhouses"))
        .and(header("x-session-id", "second"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let adapter = SessionRestAdapter::new(&descriptor_for(&server), &options()).unwrap();
    adapter.authenticate().await.unwrap();
    assert!(adapter.list_compartments().await.unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_controller_is_a_connection_failure() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let descriptor = climaflow_devices::ConnectionDescriptor::http("127.0.0.1", port)
        .with_credentials(climaflow_devices::Credentials::new("grower", "secret"));

    let adapter = TokenRestAdapter::new(&descriptor, &options()).unwrap();
    let err = adapter.authenticate().await.unwrap_err();
    assert!(err.is_connection_failure(), "unexpected error: {err:?}");
}
