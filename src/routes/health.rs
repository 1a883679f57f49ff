//! Health check endpoints

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub active_uploads: usize,
    pub upload_url: String,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        service: "tus-upload-server",
        active_uploads: state.tus().list().await.len(),
        upload_url: state.config().tus.upload_url.clone(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}
