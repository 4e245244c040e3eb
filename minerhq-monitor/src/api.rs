//! HTTP surface: health, device management, test alerts and the live event
//! socket.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::alerts::{AlertError, AlertKind};
use crate::hub::HubHandle;
use crate::orchestrator::{MonitorError, Orchestrator};
use crate::storage::Store;

pub type AppState<S> = Arc<Orchestrator<S>>;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            message: None,
        })
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    BadGateway(String),
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = ApiResponse::<()> {
            success: false,
            data: None,
            message: Some(message),
        };
        (status, Json(body)).into_response()
    }
}

impl From<MonitorError> for ApiError {
    fn from(err: MonitorError) -> Self {
        match err {
            MonitorError::InvalidAddr(_) | MonitorError::UnknownAsset(_) => {
                ApiError::BadRequest(err.to_string())
            }
            MonitorError::Alert(AlertError::NoWebhook | AlertError::UnknownKind(_)) => {
                ApiError::BadRequest(err.to_string())
            }
            MonitorError::Alert(AlertError::Http(_) | AlertError::Status(_)) => {
                ApiError::BadGateway(err.to_string())
            }
            other => {
                error!(error = %other, "Request failed");
                ApiError::InternalServerError(other.to_string())
            }
        }
    }
}

impl From<AlertError> for ApiError {
    fn from(err: AlertError) -> Self {
        MonitorError::Alert(err).into()
    }
}

#[derive(Debug, Deserialize)]
pub struct AddDeviceRequest {
    pub addr: String,
}

#[derive(Debug, Deserialize)]
pub struct SetAssetRequest {
    pub asset: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TestAlertRequest {
    pub kind: Option<String>,
}

pub fn router<S: Store>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/ws", get(ws_handler::<S>))
        .route(
            "/api/devices",
            get(list_devices::<S>).post(add_device::<S>),
        )
        .route("/api/devices/{addr}", delete(remove_device::<S>))
        .route("/api/devices/{addr}/asset", put(set_device_asset::<S>))
        .route("/api/blocks", get(recent_blocks::<S>))
        .route("/api/alerts/test", post(test_alert::<S>))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn list_devices<S: Store>(State(state): State<AppState<S>>) -> Result<Response, ApiError> {
    let devices = state.device_status().await?;
    Ok(ApiResponse::ok(devices).into_response())
}

async fn add_device<S: Store>(
    State(state): State<AppState<S>>,
    Json(request): Json<AddDeviceRequest>,
) -> Result<Response, ApiError> {
    let added = state.add_device(&request.addr).await?;
    let status = if added {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, ApiResponse::ok(added)).into_response())
}

async fn remove_device<S: Store>(
    State(state): State<AppState<S>>,
    Path(addr): Path<String>,
) -> Result<Response, ApiError> {
    if !state.remove_device(&addr).await? {
        return Err(ApiError::NotFound(format!("device {addr} not found")));
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn set_device_asset<S: Store>(
    State(state): State<AppState<S>>,
    Path(addr): Path<String>,
    Json(request): Json<SetAssetRequest>,
) -> Result<Response, ApiError> {
    let asset = request.asset.as_deref().filter(|a| !a.is_empty());
    if !state.set_device_asset(&addr, asset).await? {
        return Err(ApiError::NotFound(format!("device {addr} not found")));
    }
    Ok(ApiResponse::ok(asset).into_response())
}

async fn recent_blocks<S: Store>(State(state): State<AppState<S>>) -> Result<Response, ApiError> {
    let blocks = state
        .store()
        .recent_blocks(50)
        .await
        .map_err(|e| ApiError::InternalServerError(e.to_string()))?;
    Ok(ApiResponse::ok(blocks).into_response())
}

async fn test_alert<S: Store>(
    State(state): State<AppState<S>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: TestAlertRequest = if body.is_empty() {
        TestAlertRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let kind = match request.kind {
        Some(kind) => Some(kind.parse::<AlertKind>()?),
        None => None,
    };

    state.evaluator().send_test_alert(kind).await?;
    Ok(ApiResponse::ok("Test alert sent").into_response())
}

async fn ws_handler<S: Store>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<S>>,
) -> Response {
    let hub = state.hub().clone();
    ws.on_upgrade(move |socket| serve_subscriber(socket, hub))
}

/// Relays hub messages to one client until either side goes away.
async fn serve_subscriber(socket: WebSocket, hub: HubHandle) {
    let (mut sender, mut receiver) = socket.split();

    let mut subscription = match hub.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(error = %e, "Rejecting event subscriber");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    debug!(subscriber = %subscription.id.0, "Event subscriber connected");

    loop {
        tokio::select! {
            message = subscription.rx.recv() => {
                let Some(message) = message else {
                    // Evicted or hub stopped.
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                if sender.send(Message::Text((&*message).into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        }
    }

    hub.unsubscribe(subscription.id);
    debug!(subscriber = %subscription.id.0, "Event subscriber disconnected");
}
