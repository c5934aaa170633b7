use axum::{
  extract::{
    ws::{Message, WebSocket, WebSocketUpgrade},
    Path, State,
  },
  http::StatusCode,
  response::{Json, Response},
  routing::{delete, get, post},
  Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::debug;

use upgrade_core::compat::DeviceInfo;
use upgrade_core::error::UpgradeError;
use upgrade_core::hash::is_valid_hash;
use upgrade_core::types::{PackageRecord, UpgradeState, VersionInfo};
use crate::routes::error_response;
use crate::services::manager::{ControlCommand, Notification, UpgradeManager};
use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
  Router::new()
    .route("/state", get(get_state))
    .route("/device", get(get_device))
    .route("/services/start", post(start_services))
    .route("/services/stop", post(stop_services))
    .route("/packages", get(list_packages).post(register_package))
    .route("/packages/{hash}", delete(remove_package))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
  filepath: String,
  #[serde(flatten)]
  version: VersionInfo,
}

async fn get_state(State(state): State<AppState>) -> Json<UpgradeState> {
  Json(state.manager.get_state())
}

async fn get_device(State(state): State<AppState>) -> Json<DeviceInfo> {
  Json(state.config.device.clone())
}

async fn start_services(State(state): State<AppState>) -> (StatusCode, Json<UpgradeState>) {
  state.manager.start_services();
  (StatusCode::ACCEPTED, Json(state.manager.get_state()))
}

async fn stop_services(State(state): State<AppState>) -> (StatusCode, Json<UpgradeState>) {
  state.manager.stop_services();
  (StatusCode::ACCEPTED, Json(state.manager.get_state()))
}

async fn list_packages(State(state): State<AppState>) -> Json<Vec<PackageRecord>> {
  Json(state.manager.packages())
}

async fn register_package(
  State(state): State<AppState>,
  Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<PackageRecord>), (StatusCode, Json<Value>)> {
  if body.filepath.trim().is_empty() {
    return Err(error_response(&UpgradeError::InvalidPackage(
      "Missing filepath".into(),
    )));
  }
  let record = state
    .manager
    .register_built_package(PathBuf::from(body.filepath), body.version)
    .await
    .map_err(|e| error_response(&e))?;
  Ok((StatusCode::CREATED, Json(record)))
}

async fn remove_package(
  State(state): State<AppState>,
  Path(hash): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<Value>)> {
  if !is_valid_hash(&hash) {
    return Err(error_response(&UpgradeError::NotFound(hash)));
  }
  state
    .manager
    .remove_package(hash)
    .await
    .map_err(|e| error_response(&e))?;
  Ok(StatusCode::NO_CONTENT)
}

pub async fn control_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
  ws.on_upgrade(move |socket| handle_control(socket, state.manager))
}

async fn handle_control(socket: WebSocket, manager: Arc<UpgradeManager>) {
  let (mut ws_tx, mut ws_rx) = socket.split();

  // Single writer for replies and notifications
  let (send_tx, mut send_rx) = mpsc::channel::<String>(64);
  let sender = tokio::spawn(async move {
    while let Some(text) = send_rx.recv().await {
      if ws_tx.send(Message::Text(text.into())).await.is_err() {
        break;
      }
    }
  });

  let mut notifications = manager.subscribe();
  let notify_tx = send_tx.clone();
  let snapshot_source = manager.clone();
  let forwarder = tokio::spawn(async move {
    loop {
      let notification = match notifications.recv().await {
        Ok(n) => n,
        // Skipped snapshots are superseded by the current one
        Err(RecvError::Lagged(_)) => Notification::State(snapshot_source.get_state()),
        Err(RecvError::Closed) => break,
      };
      if !send_json(&notify_tx, &notification).await {
        break;
      }
    }
  });

  while let Some(msg) = ws_rx.next().await {
    let text = match msg {
      Ok(Message::Text(t)) => t,
      Ok(Message::Close(_)) | Err(_) => break,
      _ => continue,
    };

    match serde_json::from_str::<ControlCommand>(text.as_str()) {
      Ok(command) => {
        if let Some(reply) = manager.handle(command) {
          send_json(&send_tx, &reply).await;
        }
      }
      Err(e) => {
        debug!("Rejected control message: {}", e);
        let err = serde_json::json!({"error": format!("Invalid command: {}", e)});
        send_json(&send_tx, &err).await;
      }
    }
  }

  forwarder.abort();
  sender.abort();
}

async fn send_json<T: Serialize>(tx: &mpsc::Sender<String>, value: &T) -> bool {
  match serde_json::to_string(value) {
    Ok(text) => tx.send(text).await.is_ok(),
    Err(_) => false,
  }
}
