use serde::Deserialize;
use std::{path::PathBuf, time::Duration};
use thiserror::Error;
use url::Url;

use crate::streamer::StreamerConfig;

const INFERENCE_PATH: [&str; 2] = ["ws", "predict"];
const TRAINING_PATH: [&str; 2] = ["ws", "train_progress"];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub service: ServiceConfig,
    pub camera: CameraConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Invalid service URL: {0}")]
    Parse(#[from] url::ParseError),
    #[error("Service URL `{0}` must use http or https")]
    UnsupportedScheme(String),
    #[error("Service URL `{0}` cannot carry a path")]
    CannotBeABase(String),
}

/// Location of the training/inference service.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub base_url: String,
}

impl ServiceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Resolves a REST path (e.g. `train/`) against the base URL.
    pub fn http_url(&self, path: &str) -> Result<Url, EndpointError> {
        let mut base = self.parsed_base()?;
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        Ok(base.join(path.trim_start_matches('/'))?)
    }

    pub fn inference_endpoint(&self) -> Result<Url, EndpointError> {
        self.ws_url(&INFERENCE_PATH)
    }

    pub fn training_endpoint(&self, session_id: &str) -> Result<Url, EndpointError> {
        let mut url = self.ws_url(&TRAINING_PATH)?;
        url.path_segments_mut()
            .map_err(|_| EndpointError::CannotBeABase(self.base_url.clone()))?
            .push(session_id);
        Ok(url)
    }

    fn ws_url(&self, segments: &[&str]) -> Result<Url, EndpointError> {
        let mut url = self.parsed_base()?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
        };
        url.set_scheme(scheme)
            .map_err(|_| EndpointError::UnsupportedScheme(scheme.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| EndpointError::CannotBeABase(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn parsed_base(&self) -> Result<Url, EndpointError> {
        let url = Url::parse(&self.base_url)?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(EndpointError::UnsupportedScheme(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CameraBackend {
    Opencv,
    StillImage,
}

#[derive(Clone, Deserialize, Debug)]
pub struct CameraConfig {
    #[serde(default = "default_backend")]
    pub backend: CameraBackend,
    #[serde(default)]
    pub device_index: i32,
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
    #[serde(default = "default_frame_height")]
    pub frame_height: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_preview_fps")]
    pub preview_fps: u64,
}

fn default_backend() -> CameraBackend {
    CameraBackend::Opencv
}

fn default_frame_interval_ms() -> u64 {
    200
}

fn default_frame_width() -> u32 {
    640
}

fn default_frame_height() -> u32 {
    480
}

fn default_jpeg_quality() -> u8 {
    80
}

fn default_preview_fps() -> u64 {
    15
}

fn fps_to_delay_ms(fps: u64) -> u64 {
    (1000.0 / fps.max(1) as f64).round() as u64
}

impl CameraConfig {
    pub fn get_preview_delay_ms(&self) -> u64 {
        fps_to_delay_ms(self.preview_fps)
    }

    pub fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig {
            frame_interval: Duration::from_millis(self.frame_interval_ms.max(1)),
            frame_width: self.frame_width,
            frame_height: self.frame_height,
            jpeg_quality: self.jpeg_quality,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path =
        std::env::current_dir().map_err(|e| config::ConfigError::Message(e.to_string()))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("LC")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    Ok(config)
}
