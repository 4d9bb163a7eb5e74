use crate::{
    frame::FrameEncoder,
    server::SharedState,
    stream::{VideoStream, VideoStreamError},
};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::instrument;

const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[instrument(skip(state))]
pub async fn video_feed(State(state): State<SharedState>) -> Result<Response, VideoStreamError> {
    state.metrics.record_request("video_feed");
    let camera = &state.camera_config;
    let video_stream = VideoStream::new(
        state.preview.clone(),
        FrameEncoder::new(camera.frame_width, camera.frame_height, camera.jpeg_quality),
        camera.get_preview_delay_ms(),
    );

    let body = Body::from_stream(video_stream.generate_stream());

    let response = Response::builder()
        .header(header::CONTENT_TYPE, CONTENT_TYPE)
        .body(body)
        .map_err(|e| VideoStreamError::HttpBuilderError(e.to_string()))?;

    Ok(response)
}

impl IntoResponse for VideoStreamError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}
