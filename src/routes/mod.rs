mod health;
mod metrics;
mod predictions;
mod video_feed;

use crate::server::SharedState;
use axum::{routing::get, Router};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/video_feed", get(video_feed::video_feed))
        .route("/predictions", get(predictions::predictions))
        .route("/predictions/stream", get(predictions::prediction_events))
}
