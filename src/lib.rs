pub mod api;
pub mod app;
pub mod camera;
pub mod channel;
pub mod config;
pub mod confidence;
pub mod frame;
pub mod lifecycle;
pub mod protocol;
mod routes;
pub mod server;
pub mod stream;
pub mod streamer;
pub mod telemetry;
pub mod training;
pub mod ws;

pub use app::start_app;
