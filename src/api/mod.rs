//! HTTP API for the device registry
//!
//! Routes are built from injected collaborators: the repository and a
//! [`ConnectionHandle`] for the health report. Nothing here reaches for a
//! global client.

use crate::error::{PlatformError, PlatformResult, sanitize_error_message};
use crate::models::{CreateDeviceRequest, DeviceStatusView, UpdateDeviceRequest};
use crate::observability::metrics;
use crate::storage::{DEFAULT_TELEMETRY_LIMIT, DeviceRepository, StorageError, TelemetryQuery};
use crate::transport::mqtt::ConnectionHandle;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// Largest request body accepted
const MAX_BODY_BYTES: u64 = 64 * 1024;

const DEVICE_NOT_FOUND: &str = "device not found";

/// Collaborators shared by every route
#[derive(Clone)]
pub struct ApiState {
    pub repository: Arc<dyn DeviceRepository>,
    pub connection: ConnectionHandle,
}

impl ApiState {
    pub fn new(repository: Arc<dyn DeviceRepository>, connection: ConnectionHandle) -> Self {
        Self {
            repository,
            connection,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
    mqtt_status: &'static str,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn json_response<T: Serialize>(body: &T, status: StatusCode) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

fn error_response(message: impl Into<String>, status: StatusCode) -> Response {
    json_response(
        &ErrorBody {
            error: sanitize_error_message(&message.into()),
        },
        status,
    )
}

/// Map a storage failure to an HTTP response
fn storage_error_response(error: StorageError) -> Response {
    match error {
        StorageError::NotFound { .. } => error_response(DEVICE_NOT_FOUND, StatusCode::NOT_FOUND),
        StorageError::InvalidInput(message) => {
            error_response(message, StatusCode::BAD_REQUEST)
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| {
        error_response(
            format!("Invalid request body: {e}"),
            StatusCode::BAD_REQUEST,
        )
    })
}

/// Parse the `limit` query value; missing, invalid or non-positive values use the default
fn parse_limit(raw: Option<&String>) -> usize {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|limit| *limit > 0)
        .map_or(DEFAULT_TELEMETRY_LIMIT, |limit| {
            usize::try_from(limit).unwrap_or(usize::MAX)
        })
}

fn with_state(state: ApiState) -> impl Filter<Extract = (ApiState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn json_body() -> impl Filter<Extract = (Bytes,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::bytes())
}

async fn health(state: ApiState) -> Result<Response, Infallible> {
    let mqtt_status = if state.connection.is_connected() {
        "connected"
    } else {
        "disconnected"
    };
    Ok(json_response(
        &HealthResponse {
            status: "ok",
            message: "IoT Platform is running",
            mqtt_status,
            timestamp: Utc::now().to_rfc3339(),
        },
        StatusCode::OK,
    ))
}

async fn metrics_snapshot() -> Result<Response, Infallible> {
    Ok(json_response(&metrics().snapshot(), StatusCode::OK))
}

async fn create_device(state: ApiState, body: Bytes) -> Result<Response, Infallible> {
    let request: CreateDeviceRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return Ok(response),
    };
    match state.repository.create_device(request).await {
        Ok(device) => {
            info!(device_id = %device.id, name = %device.name, "Device created");
            Ok(json_response(&device, StatusCode::CREATED))
        }
        Err(e) => Ok(storage_error_response(e)),
    }
}

async fn list_devices(state: ApiState) -> Result<Response, Infallible> {
    match state.repository.list_devices().await {
        Ok(devices) => Ok(json_response(
            &json!({"count": devices.len(), "devices": devices}),
            StatusCode::OK,
        )),
        Err(e) => Ok(storage_error_response(e)),
    }
}

async fn get_device(id: String, state: ApiState) -> Result<Response, Infallible> {
    Ok(match state.repository.get_device(&id).await {
        Ok(device) => json_response(&device, StatusCode::OK),
        Err(e) => storage_error_response(e),
    })
}

async fn update_device(id: String, state: ApiState, body: Bytes) -> Result<Response, Infallible> {
    let request: UpdateDeviceRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return Ok(response),
    };
    Ok(match state.repository.update_device(&id, request).await {
        Ok(device) => {
            info!(device_id = %device.id, "Device updated");
            json_response(&device, StatusCode::OK)
        }
        Err(e) => storage_error_response(e),
    })
}

async fn delete_device(id: String, state: ApiState) -> Result<Response, Infallible> {
    Ok(match state.repository.delete_device(&id).await {
        Ok(()) => {
            info!(device_id = %id, "Device deleted");
            json_response(
                &json!({"message": "Device deleted successfully"}),
                StatusCode::OK,
            )
        }
        Err(e) => storage_error_response(e),
    })
}

async fn device_status(id: String, state: ApiState) -> Result<Response, Infallible> {
    Ok(match state.repository.get_device(&id).await {
        Ok(device) => json_response(&DeviceStatusView::from(&device), StatusCode::OK),
        Err(e) => storage_error_response(e),
    })
}

async fn device_data(
    id: String,
    params: HashMap<String, String>,
    state: ApiState,
) -> Result<Response, Infallible> {
    let mut query = TelemetryQuery::new(id.clone()).with_limit(parse_limit(params.get("limit")));
    if let Some(data_type) = params.get("type").filter(|t| !t.is_empty()) {
        query = query.with_data_type(data_type.clone());
    }

    Ok(match state.repository.query_telemetry(&query).await {
        Ok(data) => json_response(
            &json!({
                "device_id": id,
                "count": data.len(),
                "limit": query.limit(),
                "data": data,
            }),
            StatusCode::OK,
        ),
        Err(e) => {
            error!(device_id = %id, error = %e, "Failed to query device data");
            error_response("Failed to get device data", StatusCode::INTERNAL_SERVER_ERROR)
        }
    })
}

async fn latest_device_data(id: String, state: ApiState) -> Result<Response, Infallible> {
    Ok(match state.repository.latest_telemetry(&id).await {
        Ok(Some(latest)) => json_response(
            &json!({"device_id": id, "latest_data": latest}),
            StatusCode::OK,
        ),
        Ok(None) => error_response("No data found for device", StatusCode::NOT_FOUND),
        Err(e) => storage_error_response(e),
    })
}

/// Turn unmatched routes and malformed requests into JSON errors
async fn handle_rejection(rejection: Rejection) -> Result<Response, Infallible> {
    let (status, message) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found")
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
    } else if rejection.find::<warp::reject::LengthRequired>().is_some() {
        (StatusCode::LENGTH_REQUIRED, "content length required")
    } else if rejection.find::<warp::reject::InvalidQuery>().is_some() {
        (StatusCode::BAD_REQUEST, "invalid query string")
    } else {
        debug!(rejection = ?rejection, "Unhandled rejection");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    };
    Ok(error_response(message, status))
}

/// All routes, with CORS and JSON error handling applied
pub fn routes(state: ApiState) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let health_route = warp::path!("health")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(health);

    let metrics_route = warp::path!("metrics")
        .and(warp::get())
        .and_then(metrics_snapshot);

    let create_route = warp::path!("api" / "devices")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(json_body())
        .and_then(create_device);

    let list_route = warp::path!("api" / "devices")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(list_devices);

    let get_route = warp::path!("api" / "devices" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_device);

    let update_route = warp::path!("api" / "devices" / String)
        .and(warp::put())
        .and(with_state(state.clone()))
        .and(json_body())
        .and_then(update_device);

    let delete_route = warp::path!("api" / "devices" / String)
        .and(warp::delete())
        .and(with_state(state.clone()))
        .and_then(delete_device);

    let status_route = warp::path!("api" / "devices" / String / "status")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(device_status);

    let data_route = warp::path!("api" / "devices" / String / "data")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(with_state(state.clone()))
        .and_then(device_data);

    let latest_route = warp::path!("api" / "devices" / String / "data" / "latest")
        .and(warp::get())
        .and(with_state(state))
        .and_then(latest_device_data);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
        .allow_headers(vec!["content-type", "authorization"]);

    health_route
        .or(metrics_route)
        .or(create_route)
        .or(list_route)
        .or(get_route)
        .or(update_route)
        .or(delete_route)
        .or(status_route)
        .or(data_route)
        .or(latest_route)
        .with(cors)
        .with(warp::trace(|info| {
            crate::http_span!(method = %info.method(), path = %info.path())
        }))
        .recover(handle_rejection)
}

/// Serve the API until `shutdown` resolves
pub async fn serve<F>(state: ApiState, addr: SocketAddr, shutdown: F) -> PlatformResult<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let (bound, server) = warp::serve(routes(state))
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .map_err(|e| PlatformError::server(format!("failed to bind {addr}: {e}")))?;
    info!(addr = %bound, "HTTP server listening");
    info!("Health check: http://{bound}/health");
    server.await;
    info!("HTTP server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryRepository;
    use crate::transport::mqtt::ConnectionState;
    use serde_json::Value;

    fn state(connection: ConnectionState) -> ApiState {
        ApiState::new(
            Arc::new(InMemoryRepository::new()),
            ConnectionHandle::fixed(connection),
        )
    }

    fn body_json(response: &warp::http::Response<Bytes>) -> Value {
        serde_json::from_slice(response.body()).unwrap()
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(None), DEFAULT_TELEMETRY_LIMIT);
        assert_eq!(parse_limit(Some(&"25".to_string())), 25);
        assert_eq!(parse_limit(Some(&"0".to_string())), DEFAULT_TELEMETRY_LIMIT);
        assert_eq!(parse_limit(Some(&"-4".to_string())), DEFAULT_TELEMETRY_LIMIT);
        assert_eq!(parse_limit(Some(&"many".to_string())), DEFAULT_TELEMETRY_LIMIT);
    }

    #[tokio::test]
    async fn test_health_reports_mqtt_status() {
        let api = routes(state(ConnectionState::Connected));
        let response = warp::test::request().path("/health").reply(&api).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(&response);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["mqtt_status"], "connected");

        let api = routes(state(ConnectionState::Connecting));
        let response = warp::test::request().path("/health").reply(&api).await;
        assert_eq!(body_json(&response)["mqtt_status"], "disconnected");
    }

    #[tokio::test]
    async fn test_create_and_fetch_device() {
        let api = routes(state(ConnectionState::Disconnected));

        let created = warp::test::request()
            .method("POST")
            .path("/api/devices")
            .json(&json!({"name": "Sensor", "type": "temperature", "location": "lab"}))
            .reply(&api)
            .await;
        assert_eq!(created.status(), StatusCode::CREATED);
        let device = body_json(&created);
        assert_eq!(device["status"], "offline");
        let id = device["id"].as_str().unwrap().to_string();

        let fetched = warp::test::request()
            .path(&format!("/api/devices/{id}"))
            .reply(&api)
            .await;
        assert_eq!(fetched.status(), StatusCode::OK);
        assert_eq!(body_json(&fetched)["name"], "Sensor");

        let listed = warp::test::request().path("/api/devices").reply(&api).await;
        assert_eq!(body_json(&listed)["count"], 1);
    }

    #[tokio::test]
    async fn test_create_device_rejects_invalid_bodies() {
        let api = routes(state(ConnectionState::Disconnected));

        let garbage = warp::test::request()
            .method("POST")
            .path("/api/devices")
            .body("{not json")
            .reply(&api)
            .await;
        assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);

        let missing_type = warp::test::request()
            .method("POST")
            .path("/api/devices")
            .json(&json!({"name": "Sensor"}))
            .reply(&api)
            .await;
        assert_eq!(missing_type.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_device_routes_return_404() {
        let api = routes(state(ConnectionState::Disconnected));

        for (method, path) in [
            ("GET", "/api/devices/ghost"),
            ("DELETE", "/api/devices/ghost"),
            ("GET", "/api/devices/ghost/status"),
            ("GET", "/api/devices/ghost/data/latest"),
        ] {
            let response = warp::test::request()
                .method(method)
                .path(path)
                .reply(&api)
                .await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method} {path}");
        }

        let update = warp::test::request()
            .method("PUT")
            .path("/api/devices/ghost")
            .json(&json!({"name": "x"}))
            .reply(&api)
            .await;
        assert_eq!(update.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(&update)["error"], DEVICE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_and_delete_device() {
        let state = state(ConnectionState::Disconnected);
        let device = state
            .repository
            .create_device(CreateDeviceRequest {
                name: "Sensor".to_string(),
                device_type: "humidity".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let api = routes(state);

        let updated = warp::test::request()
            .method("PUT")
            .path(&format!("/api/devices/{}", device.id))
            .json(&json!({"status": "maintenance", "location": "roof"}))
            .reply(&api)
            .await;
        assert_eq!(updated.status(), StatusCode::OK);
        let body = body_json(&updated);
        assert_eq!(body["status"], "maintenance");
        assert_eq!(body["location"], "roof");

        let status = warp::test::request()
            .path(&format!("/api/devices/{}/status", device.id))
            .reply(&api)
            .await;
        assert_eq!(body_json(&status)["status"], "maintenance");

        let deleted = warp::test::request()
            .method("DELETE")
            .path(&format!("/api/devices/{}", device.id))
            .reply(&api)
            .await;
        assert_eq!(deleted.status(), StatusCode::OK);
        assert_eq!(body_json(&deleted)["message"], "Device deleted successfully");
    }

    #[tokio::test]
    async fn test_device_data_query_params() {
        let state = state(ConnectionState::Disconnected);
        let id = state
            .repository
            .create_device(crate::models::CreateDeviceRequest {
                name: "Weather Station".to_string(),
                device_type: "climate".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .id;
        for (i, data_type) in ["temperature", "humidity", "temperature"].iter().enumerate() {
            state
                .repository
                .save_telemetry(crate::models::DeviceData {
                    id: format!("row-{i}"),
                    device_id: id.clone(),
                    timestamp: Utc::now(),
                    data_type: data_type.to_string(),
                    value: i as f64,
                    unit: None,
                    metadata: None,
                })
                .await
                .unwrap();
        }
        let api = routes(state);

        let all = warp::test::request()
            .path(&format!("/api/devices/{id}/data"))
            .reply(&api)
            .await;
        let body = body_json(&all);
        assert_eq!(body["count"], 3);
        assert_eq!(body["limit"], 100);

        let filtered = warp::test::request()
            .path(&format!("/api/devices/{id}/data?type=temperature&limit=1"))
            .reply(&api)
            .await;
        let body = body_json(&filtered);
        assert_eq!(body["count"], 1);
        assert_eq!(body["limit"], 1);
        assert_eq!(body["data"][0]["data_type"], "temperature");

        let capped = warp::test::request()
            .path(&format!("/api/devices/{id}/data?limit=5000"))
            .reply(&api)
            .await;
        assert_eq!(body_json(&capped)["limit"], 1000);

        let latest = warp::test::request()
            .path(&format!("/api/devices/{id}/data/latest"))
            .reply(&api)
            .await;
        assert_eq!(latest.status(), StatusCode::OK);
        assert_eq!(body_json(&latest)["device_id"], id.as_str());
    }

    #[tokio::test]
    async fn test_metrics_and_unknown_route() {
        let api = routes(state(ConnectionState::Disconnected));

        let metrics = warp::test::request().path("/metrics").reply(&api).await;
        assert_eq!(metrics.status(), StatusCode::OK);
        assert!(body_json(&metrics).get("mqtt").is_some());

        let missing = warp::test::request().path("/nowhere").reply(&api).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
