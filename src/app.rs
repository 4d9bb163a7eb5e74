use crate::api::{ApiClient, DatasetFile, ProgressCallback, ServerStatus};
use crate::camera::DeviceCameraProvider;
use crate::config::{Config, ServiceConfig};
use crate::lifecycle::{CaptureLifecycle, LifecycleError};
use crate::server::{HttpServer, SharedState};
use crate::stream::PreviewSink;
use crate::streamer::InferenceStreamer;
use crate::telemetry::Metrics;
use crate::training::{TrainingEvent, TrainingMonitor};
use crate::ws::WsConnector;

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};
use tokio::{
    signal,
    sync::{broadcast, mpsc},
};

/// Runs the camera, live inference and the local status server until Ctrl-C
/// or SIGTERM.
pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new()?);
    let endpoint = config.service.inference_endpoint()?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let streamer = InferenceStreamer::new(
        Arc::new(WsConnector),
        endpoint.as_str(),
        config.camera.streamer_config(),
        events_tx,
    )
    .with_metrics(metrics.clone());

    let preview = PreviewSink::default();
    let state = SharedState {
        preview: preview.clone(),
        confidences: streamer.confidences(),
        metrics,
        camera_config: config.camera.clone(),
    };
    let provider = Arc::new(DeviceCameraProvider::new(config.camera.clone()));
    let mut lifecycle = CaptureLifecycle::new(provider, preview, streamer);

    let server = HttpServer::new(state, &config.server.get_address()).await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe());

    let event_log = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            tracing::info!(status = %event.status_line(), "Inference status");
        }
    });

    match lifecycle.start_camera().await {
        Ok(()) => tracing::info!("Live inference running on {}", endpoint),
        Err(LifecycleError::Connect(e)) => {
            tracing::warn!("Camera preview running without live inference: {e}")
        }
        Err(e) => tracing::error!("Failed to start camera: {e}"),
    }

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    lifecycle.stop_camera().await;
    drop(lifecycle);
    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::error!("Status server task failed: {e}"),
    }
    let _ = event_log.await;

    Ok(())
}

/// Submits a training job, follows it to the end and reports readiness.
pub async fn run_training(service: &ServiceConfig) -> anyhow::Result<ServerStatus> {
    let api = ApiClient::new(service.clone());
    let ticket = api.submit_training().await?;
    if let Some(message) = &ticket.message {
        println!("{message}");
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut monitor = TrainingMonitor::new(Arc::new(WsConnector), service.clone(), events_tx);
    monitor.attach(&ticket.session_id).await?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = &mut shutdown, if !interrupted => {
                interrupted = true;
                monitor.detach().await;
            }
            event = events_rx.recv() => match event {
                Some(TrainingEvent::Progress(progress)) => match progress.percent() {
                    Some(percent) => println!("[{percent:>5.1}%] {}", progress.log),
                    None => println!("{}", progress.log),
                },
                Some(TrainingEvent::Ended(end)) => {
                    println!("{end}");
                    break;
                }
                None => break,
            }
        }
    }
    monitor.detach().await;

    let status = api.status().await?;
    print_status(&status);
    Ok(status)
}

pub async fn show_status(service: &ServiceConfig) -> anyhow::Result<ServerStatus> {
    let status = ApiClient::new(service.clone()).status().await?;
    print_status(&status);
    Ok(status)
}

pub async fn upload_datasets(
    service: &ServiceConfig,
    class_name: &str,
    files: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let files: Vec<DatasetFile> = files
        .into_iter()
        .map(|path| DatasetFile {
            class_name: class_name.to_string(),
            path,
        })
        .collect();

    let last = Arc::new(AtomicU8::new(0));
    let on_progress: ProgressCallback = Arc::new(move |progress| {
        let percent = progress.percent();
        if last.swap(percent, Ordering::AcqRel) != percent {
            tracing::info!(percent, "Uploading");
        }
    });

    let message = ApiClient::new(service.clone())
        .upload_datasets(&files, on_progress)
        .await?;
    println!("{message}");
    Ok(())
}

pub async fn delete_datasets(service: &ServiceConfig, class_name: Option<&str>) -> anyhow::Result<()> {
    let api = ApiClient::new(service.clone());
    let message = match class_name {
        Some(name) => api.delete_class(name).await?,
        None => api.delete_all_datasets().await?,
    };
    println!("{message}");
    Ok(())
}

pub async fn export_project(service: &ServiceConfig, dir: &Path) -> anyhow::Result<PathBuf> {
    let path = ApiClient::new(service.clone()).export_project(dir).await?;
    println!("Project exported to {}", path.display());
    Ok(path)
}

pub async fn import_project(service: &ServiceConfig, archive: &Path) -> anyhow::Result<()> {
    let message = ApiClient::new(service.clone()).import_project(archive).await?;
    println!("{message}");
    Ok(())
}

fn print_status(status: &ServerStatus) {
    let yes_no = |flag: bool| if flag { "yes" } else { "no" };
    println!("Datasets available: {}", yes_no(status.datasets_available));
    println!("Model available:    {}", yes_no(status.model_available));
    if !status.class_names.is_empty() {
        println!("Classes:            {}", status.class_names.join(", "));
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
