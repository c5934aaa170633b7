pub mod control;
pub mod peer;

use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use upgrade_core::error::UpgradeError;
use crate::state::AppState;

pub fn error_response(err: &UpgradeError) -> (StatusCode, Json<Value>) {
  let status =
    StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  (status, Json(serde_json::json!({"error": err.to_string()})))
}

/// Control surface for the owning application.
pub fn app(state: AppState) -> Router {
  Router::new()
    .nest("/api", control::api_router())
    .route("/control", get(control::control_handler))
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive())
    .with_state(state)
}
