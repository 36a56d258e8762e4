//! HTTP API handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::audio::device::list_devices;
use crate::audio::{DeviceSelection, Volumes};
use crate::call::{CallInfo, CallStatus};
use crate::constants::DEFAULT_CONTROL_PORT;
use crate::discovery::Peer;
use crate::error::{Error, NetworkError};
use crate::protocol::AudioDeviceInfo;
use crate::ui::server::AppState;

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

fn failure<T>(status: StatusCode, msg: impl Into<String>) -> Reply<T> {
    (status, Json(ApiResponse::error(msg)))
}

/// Run a blocking core operation off the async workers
async fn blocking<T, F>(f: F) -> Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| format!("Worker failed: {}", e))
}

/// System status
#[derive(Serialize)]
pub struct SystemStatus {
    pub id: String,
    pub username: String,
    pub control_port: Option<u16>,
    pub broadcast_port: u16,
    pub discovery_running: bool,
    pub peer_count: usize,
    pub in_call: bool,
    pub call: CallStatus,
    pub uptime_seconds: u64,
}

/// Get system status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Reply<SystemStatus> {
    let calls = state.calls.clone();
    let call = match blocking(move || calls.status()).await {
        Ok(call) => call,
        Err(e) => return failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    let status = SystemStatus {
        id: state.discovery.self_id().to_string(),
        username: state.discovery.username(),
        control_port: state.calls.control().local_port(),
        broadcast_port: state.discovery.options().broadcast_port,
        discovery_running: state.discovery.is_running(),
        peer_count: state.discovery.peers().len(),
        in_call: matches!(call, CallStatus::ActiveCall { .. }),
        call,
        uptime_seconds: state.uptime_seconds(),
    };

    (StatusCode::OK, Json(ApiResponse::ok(status)))
}

/// Get peers heard from within the TTL
pub async fn get_peers(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<Peer>>> {
    Json(ApiResponse::ok(state.discovery.peers()))
}

/// Send a beacon right away
pub async fn discover(State(state): State<Arc<AppState>>) -> Json<ApiResponse<()>> {
    state.discovery.trigger();
    Json(ApiResponse::ok(()))
}

#[derive(Debug, Deserialize)]
pub struct CallRequest {
    pub ip: Option<String>,
    pub control_port: Option<u16>,
}

/// Place a call; blocks until the peer answers or the handshake times out
pub async fn start_call(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CallRequest>>,
) -> Reply<CallInfo> {
    let Some(Json(request)) = body else {
        return failure(StatusCode::BAD_REQUEST, "Missing ip");
    };
    let Some(ip) = request.ip.filter(|ip| !ip.trim().is_empty()) else {
        return failure(StatusCode::BAD_REQUEST, "Missing ip");
    };
    let peer_ip: Ipv4Addr = match ip.trim().parse() {
        Ok(peer_ip) => peer_ip,
        Err(_) => return failure(StatusCode::BAD_REQUEST, format!("Invalid ip: {}", ip)),
    };
    let control_port = request.control_port.unwrap_or(DEFAULT_CONTROL_PORT);

    let calls = state.calls.clone();
    match blocking(move || calls.start_call(peer_ip, control_port)).await {
        Ok(Ok(info)) => (StatusCode::OK, Json(ApiResponse::ok(info))),
        Ok(Err(e @ Error::Network(NetworkError::InvalidAddress(_)))) => {
            failure(StatusCode::BAD_REQUEST, e.to_string())
        }
        Ok(Err(e)) => failure(StatusCode::CONFLICT, e.to_string()),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Accept the pending call
pub async fn accept(State(state): State<Arc<AppState>>) -> Reply<CallInfo> {
    let calls = state.calls.clone();
    match blocking(move || calls.accept()).await {
        Ok(Ok(info)) => (StatusCode::OK, Json(ApiResponse::ok(info))),
        Ok(Err(e)) => failure(StatusCode::CONFLICT, e.to_string()),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Reject the pending call
pub async fn reject(State(state): State<Arc<AppState>>) -> Reply<()> {
    let calls = state.calls.clone();
    match blocking(move || calls.reject()).await {
        Ok(Ok(())) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Ok(Err(e)) => failure(StatusCode::CONFLICT, e.to_string()),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// End the active call; `data` tells whether there was one
pub async fn hangup(State(state): State<Arc<AppState>>) -> Reply<bool> {
    let calls = state.calls.clone();
    match blocking(move || calls.hangup()).await {
        Ok(was_active) => (StatusCode::OK, Json(ApiResponse::ok(was_active))),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub async fn get_volume(State(state): State<Arc<AppState>>) -> Reply<Volumes> {
    let calls = state.calls.clone();
    match blocking(move || calls.volume()).await {
        Ok(volumes) => (StatusCode::OK, Json(ApiResponse::ok(volumes))),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct VolumeUpdate {
    pub input: Option<i64>,
    pub output: Option<i64>,
}

/// Set either volume; values are clamped to 0..=100
pub async fn set_volume(
    State(state): State<Arc<AppState>>,
    Json(update): Json<VolumeUpdate>,
) -> Reply<Volumes> {
    let calls = state.calls.clone();
    match blocking(move || calls.set_volume(update.input, update.output)).await {
        Ok(volumes) => (StatusCode::OK, Json(ApiResponse::ok(volumes))),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Get available audio devices
pub async fn get_devices() -> Reply<Vec<AudioDeviceInfo>> {
    match blocking(list_devices).await {
        Ok(devices) => (StatusCode::OK, Json(ApiResponse::ok(devices))),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
}

pub async fn get_user(State(state): State<Arc<AppState>>) -> Json<ApiResponse<UserInfo>> {
    Json(ApiResponse::ok(UserInfo {
        username: state.discovery.username(),
    }))
}

/// Change the advertised username and persist it
pub async fn set_user(
    State(state): State<Arc<AppState>>,
    Json(update): Json<UserInfo>,
) -> Reply<UserInfo> {
    let username = update.username.trim().to_string();
    if username.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "Username must not be empty");
    }

    state.discovery.set_username(username.clone());
    state.update_config(|config| config.identity.username = Some(username.clone()));
    tracing::info!("Username changed to {}", username);
    (StatusCode::OK, Json(ApiResponse::ok(UserInfo { username })))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceUpdate {
    pub input: Option<String>,
    pub output: Option<String>,
}

/// Choose devices for the next call; an empty id selects the host default
pub async fn set_audio_devices(
    State(state): State<Arc<AppState>>,
    Json(update): Json<DeviceUpdate>,
) -> Json<ApiResponse<DeviceSelection>> {
    let current = state.calls.devices();
    let selection = DeviceSelection::new(
        update.input.or(current.input),
        update.output.or(current.output),
    );

    state.calls.set_devices(selection.clone());
    state.update_config(|config| {
        config.audio.input_device = selection.input.clone();
        config.audio.output_device = selection.output.clone();
    });
    Json(ApiResponse::ok(selection))
}
