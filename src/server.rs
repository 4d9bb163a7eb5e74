use crate::{
    config::CameraConfig, confidence::ConfidenceReport, routes::api_routes, stream::PreviewSink,
    telemetry::Metrics,
};
use axum::Router;
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::TcpListener,
    sync::{broadcast::Receiver, watch},
    task::JoinHandle,
};

#[derive(Clone)]
pub struct SharedState {
    pub preview: PreviewSink,
    pub confidences: watch::Receiver<ConfidenceReport>,
    pub metrics: Arc<Metrics>,
    pub camera_config: CameraConfig,
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, address: &str) -> anyhow::Result<Self> {
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let router = Router::new()
            .merge(api_routes())
            .with_state(state)
            .layer(metrics_layer);

        let listener = TcpListener::bind(address).await?;

        Ok(Self { router, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(self, mut shutdown_rx: Receiver<()>) -> JoinHandle<anyhow::Result<()>> {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("Starting status server on {}", addr);
        }

        let listener = self.listener;
        let router = self.router;
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok(())
        })
    }
}
