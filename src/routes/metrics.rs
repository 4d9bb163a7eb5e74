use crate::server::SharedState;
use axum::{extract::State, http::StatusCode};
use prometheus::{Encoder, TextEncoder};

pub async fn metrics_handler(
    State(state): State<SharedState>,
) -> Result<String, (StatusCode, String)> {
    let metric_families = state.metrics.registry.gather();

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
