use crate::{confidence::ConfidenceReport, server::SharedState};
use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::WatchStream;
use tracing::instrument;

/// Current confidences; empty while no inference stream runs.
#[instrument(skip(state))]
pub async fn predictions(State(state): State<SharedState>) -> Json<ConfidenceReport> {
    state.metrics.record_request("predictions");
    Json(state.confidences.borrow().clone())
}

/// Pushes every new confidence report as a server-sent event.
#[instrument(skip(state))]
pub async fn prediction_events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    state.metrics.record_request("predictions_stream");
    let stream =
        WatchStream::new(state.confidences.clone()).map(|report| Event::default().json_data(report));
    Sse::new(stream).keep_alive(KeepAlive::default())
}
