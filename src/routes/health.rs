use axum::response::{IntoResponse, Json};
use serde::Serialize;

#[derive(Serialize)]
struct HealthStatus {
    status: &'static str,
    version: &'static str,
}

/// Liveness only: the model is loaded before the listener binds.
pub async fn healthcheck() -> impl IntoResponse {
    Json(HealthStatus {
        status: "Available",
        version: env!("CARGO_PKG_VERSION"),
    })
}
