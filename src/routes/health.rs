use crate::server::SharedState;
use axum::{extract::State, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
    camera: bool,
    predicting: bool,
}

pub async fn healthcheck(State(state): State<SharedState>) -> Json<Health> {
    Json(Health {
        status: "Available",
        camera: state.preview.is_bound(),
        predicting: state.confidences.borrow().top.is_some(),
    })
}
