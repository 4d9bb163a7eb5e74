//! REST client for the dataset, training and project endpoints of the
//! classifier service.

use bytes::Bytes;
use futures::{stream, StreamExt};
use reqwest::{
    header::CONTENT_DISPOSITION,
    multipart::{Form, Part},
    Body, Client, Response,
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};
use url::Url;

use crate::config::{EndpointError, ServiceConfig};

const UPLOAD_CHUNK: usize = 64 * 1024;
const DEFAULT_EXPORT_NAME: &str = "project_export.zip";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Server returned {status}: {detail}")]
    Server { status: u16, detail: String },
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No files selected for upload")]
    EmptyUpload,
    #[error("{0} is not a .zip archive")]
    NotAnArchive(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub datasets_available: bool,
    pub model_available: bool,
    #[serde(default)]
    pub class_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrainingTicket {
    pub session_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    message: String,
}

/// One image to upload and the class it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetFile {
    pub class_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub sent: u64,
    pub total: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.sent.min(self.total) * 100) / self.total) as u8
    }
}

pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    service: ServiceConfig,
}

impl ApiClient {
    pub fn new(service: ServiceConfig) -> Self {
        Self {
            client: Client::new(),
            service,
        }
    }

    #[instrument(skip(self))]
    pub async fn status(&self) -> Result<ServerStatus, ApiError> {
        let response = self.client.get(self.service.http_url("status")?).send().await?;
        Ok(check(response).await?.json().await?)
    }

    #[instrument(skip(self))]
    pub async fn submit_training(&self) -> Result<TrainingTicket, ApiError> {
        let response = self.client.post(self.service.http_url("train/")?).send().await?;
        let ticket: TrainingTicket = check(response).await?.json().await?;
        info!(session_id = %ticket.session_id, "Training job submitted");
        Ok(ticket)
    }

    /// Uploads all files in one multipart request, with the nth `files` part
    /// paired to the nth `class_names` field.
    #[instrument(skip_all, fields(files = files.len()))]
    pub async fn upload_datasets(
        &self,
        files: &[DatasetFile],
        on_progress: ProgressCallback,
    ) -> Result<String, ApiError> {
        if files.is_empty() {
            return Err(ApiError::EmptyUpload);
        }

        let mut contents = Vec::with_capacity(files.len());
        for file in files {
            contents.push(Bytes::from(tokio::fs::read(&file.path).await?));
        }
        let total: u64 = contents.iter().map(|c| c.len() as u64).sum();
        let sent = Arc::new(AtomicU64::new(0));

        let mut form = Form::new();
        for (file, content) in files.iter().zip(contents) {
            let part = Part::stream_with_length(
                progress_body(content.clone(), total, sent.clone(), on_progress.clone()),
                content.len() as u64,
            )
            .file_name(file_name(&file.path))
            .mime_str(mime_for(&file.path))?;
            form = form
                .part("files", part)
                .text("class_names", file.class_name.clone());
        }

        let response = self
            .client
            .post(self.service.http_url("upload_datasets/")?)
            .multipart(form)
            .send()
            .await?;
        let reply: MessageResponse = check(response).await?.json().await?;
        Ok(reply.message)
    }

    #[instrument(skip(self))]
    pub async fn delete_class(&self, class_name: &str) -> Result<String, ApiError> {
        let url = self.segment_url("dataset", class_name)?;
        let response = self.client.delete(url).send().await?;
        let reply: MessageResponse = check(response).await?.json().await?;
        Ok(reply.message)
    }

    #[instrument(skip(self))]
    pub async fn delete_all_datasets(&self) -> Result<String, ApiError> {
        let response = self
            .client
            .delete(self.service.http_url("datasets/all")?)
            .send()
            .await?;
        let reply: MessageResponse = check(response).await?.json().await?;
        Ok(reply.message)
    }

    /// Downloads the project archive into `dir`, returning the written path.
    #[instrument(skip(self))]
    pub async fn export_project(&self, dir: &Path) -> Result<PathBuf, ApiError> {
        let response = self
            .client
            .get(self.service.http_url("export_project/")?)
            .send()
            .await?;
        let response = check(response).await?;

        let name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(attachment_filename)
            .unwrap_or_else(|| DEFAULT_EXPORT_NAME.to_string());
        let path = dir.join(name);

        let mut file = tokio::fs::File::create(&path).await?;
        let mut body = response.bytes_stream();
        let mut written = 0usize;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            written += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        info!(path = %path.display(), bytes = written, "Project exported");
        Ok(path)
    }

    /// Replaces every dataset and model on the server with the archive.
    #[instrument(skip(self))]
    pub async fn import_project(&self, archive: &Path) -> Result<String, ApiError> {
        let is_zip = archive
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if !is_zip {
            return Err(ApiError::NotAnArchive(archive.to_path_buf()));
        }

        let content = tokio::fs::read(archive).await?;
        let part = Part::bytes(content)
            .file_name(file_name(archive))
            .mime_str("application/zip")?;
        let response = self
            .client
            .post(self.service.http_url("import_project/")?)
            .multipart(Form::new().part("file", part))
            .send()
            .await?;
        let reply: MessageResponse = check(response).await?.json().await?;
        Ok(reply.message)
    }

    fn segment_url(&self, prefix: &str, segment: &str) -> Result<Url, EndpointError> {
        let mut url = self.service.http_url(prefix)?;
        url.path_segments_mut()
            .map_err(|_| EndpointError::CannotBeABase(self.service.base_url.clone()))?
            .push(segment);
        Ok(url)
    }
}

/// Passes successful responses through; turns anything else into
/// [`ApiError::Server`] with the body's `detail` or `error` text.
async fn check(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await?;
    debug!(%status, body, "Service returned an error");
    Err(ApiError::Server {
        status: status.as_u16(),
        detail: error_detail(&body),
    })
}

fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| {
            ["detail", "error"]
                .iter()
                .find_map(|key| json.get(*key).and_then(|v| v.as_str()).map(str::to_owned))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

fn progress_body(
    content: Bytes,
    total: u64,
    sent: Arc<AtomicU64>,
    on_progress: ProgressCallback,
) -> Body {
    let chunks: Vec<Bytes> = (0..content.len())
        .step_by(UPLOAD_CHUNK)
        .map(|start| content.slice(start..(start + UPLOAD_CHUNK).min(content.len())))
        .collect();
    let chunks = stream::iter(chunks).map(move |chunk| {
        let so_far = sent.fetch_add(chunk.len() as u64, Ordering::AcqRel) + chunk.len() as u64;
        on_progress(UploadProgress {
            sent: so_far,
            total,
        });
        Ok::<_, std::io::Error>(chunk)
    });
    Body::wrap_stream(chunks)
}

fn attachment_filename(header: &str) -> Option<String> {
    header.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let name = Path::new(value.trim().trim_matches('"')).file_name()?;
        Some(name.to_string_lossy().into_owned())
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string())
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("bmp") => "image/bmp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}
