mod common;

use common::{next_event, ScriptedService, Step, CLOSED_BASE_URL};
use live_classifier::{
    app::run_training,
    channel::CloseReason,
    config::ServiceConfig,
    telemetry::Metrics,
    training::{TrainingEnd, TrainingEvent, TrainingMonitor, TrainingStatus},
    ws::WsConnector,
};
use pretty_assertions::assert_eq;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};

fn progress(epoch: u32, total: u32, status: &str) -> Step {
    Step::Text(format!(
        r#"{{"current_epoch": {epoch}, "total_epochs": {total}, "log": "Epoch {epoch}/{total}", "status": "{status}"}}"#
    ))
}

fn monitor(base_url: &str) -> (TrainingMonitor<WsConnector>, UnboundedReceiver<TrainingEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let monitor = TrainingMonitor::new(Arc::new(WsConnector), ServiceConfig::new(base_url), tx);
    (monitor, rx)
}

fn epoch_of(event: &TrainingEvent) -> u32 {
    match event {
        TrainingEvent::Progress(progress) => progress.current_epoch,
        other => panic!("expected progress, got {other:?}"),
    }
}

#[tokio::test]
async fn test_completed_session_reports_progress_then_one_completion() {
    let service = ScriptedService::start(vec![
        progress(1, 10, "Training"),
        progress(10, 10, "Completed"),
    ])
    .await;
    let (monitor, mut events) = monitor(&service.base_url());
    let metrics = Arc::new(Metrics::new().unwrap());
    let mut monitor = monitor.with_metrics(metrics.clone());

    monitor.attach("3f2c9a").await.unwrap();
    assert_eq!(monitor.session_id(), Some("3f2c9a"));

    let first = next_event(&mut events).await;
    let second = next_event(&mut events).await;
    assert!(epoch_of(&first) <= epoch_of(&second));
    assert_eq!(epoch_of(&second), 10);

    let TrainingEvent::Ended(end) = next_event(&mut events).await else {
        panic!("expected the session to end");
    };
    assert!(end.is_completed());
    let TrainingEnd::Completed(last) = end else {
        unreachable!()
    };
    assert_eq!(last.status, TrainingStatus::Completed);
    assert_eq!(last.percent(), Some(100.0));

    monitor.detach().await;
    monitor.detach().await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert!(!monitor.is_attached());

    let families = metrics.registry.gather();
    assert!(families
        .iter()
        .any(|family| family.get_name().starts_with("training_epoch")));
}

#[tokio::test]
async fn test_connect_failure_emits_nothing() {
    let (mut monitor, mut events) = monitor(CLOSED_BASE_URL);

    let result = monitor.attach("3f2c9a").await;

    assert!(result.is_err());
    assert!(!monitor.is_attached());
    assert_eq!(monitor.session_id(), None);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_remote_close_ends_session() {
    let service = ScriptedService::start(vec![progress(2, 10, "Training"), Step::Close]).await;
    let (mut monitor, mut events) = monitor(&service.base_url());

    monitor.attach("abc").await.unwrap();

    assert_eq!(epoch_of(&next_event(&mut events).await), 2);
    assert_eq!(
        next_event(&mut events).await,
        TrainingEvent::Ended(TrainingEnd::Closed(CloseReason::Remote {
            code: Some(1000),
            reason: "done".into(),
        }))
    );

    monitor.detach().await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_server_error_ends_session() {
    let service = ScriptedService::start(vec![Step::Text(
        r#"{"error": "Dataset is empty"}"#.into(),
    )])
    .await;
    let (mut monitor, mut events) = monitor(&service.base_url());

    monitor.attach("abc").await.unwrap();

    let TrainingEvent::Ended(end) = next_event(&mut events).await else {
        panic!("expected the session to end");
    };
    assert_eq!(end, TrainingEnd::ServerError("Dataset is empty".into()));
    assert_eq!(end.to_string(), "Training error: Dataset is empty");
}

#[tokio::test]
async fn test_epoch_regression_is_protocol_error() {
    let service =
        ScriptedService::start(vec![progress(5, 10, "Training"), progress(3, 10, "Training")])
            .await;
    let (mut monitor, mut events) = monitor(&service.base_url());

    monitor.attach("abc").await.unwrap();

    assert_eq!(epoch_of(&next_event(&mut events).await), 5);
    assert!(matches!(
        next_event(&mut events).await,
        TrainingEvent::Ended(TrainingEnd::Protocol(_))
    ));
}

#[tokio::test]
async fn test_detach_mid_session_ends_once() {
    let service = ScriptedService::start(vec![progress(1, 10, "Starting")]).await;
    let (mut monitor, mut events) = monitor(&service.base_url());

    monitor.attach("abc").await.unwrap();
    assert_eq!(epoch_of(&next_event(&mut events).await), 1);
    assert!(monitor.is_attached());

    monitor.detach().await;

    assert_eq!(
        next_event(&mut events).await,
        TrainingEvent::Ended(TrainingEnd::Detached)
    );
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert!(!monitor.is_attached());
}

#[tokio::test]
async fn test_attach_replaces_previous_session() {
    let service = ScriptedService::start(vec![]).await;
    let (mut monitor, mut events) = monitor(&service.base_url());

    monitor.attach("first").await.unwrap();
    monitor.attach("second").await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        TrainingEvent::Ended(TrainingEnd::Detached)
    );
    assert_eq!(monitor.session_id(), Some("second"));
    assert_eq!(service.connections(), 2);

    monitor.detach().await;
}

#[tokio::test]
async fn test_run_training_follows_session_then_requeries_status() {
    let service = ScriptedService::start(vec![
        progress(1, 2, "Training"),
        progress(2, 2, "Completed"),
    ])
    .await;

    let status = tokio::time::timeout(
        Duration::from_secs(5),
        run_training(&ServiceConfig::new(service.base_url())),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(status.model_available);
    assert_eq!(status.class_names, vec!["cat".to_string(), "dog".to_string()]);
    assert_eq!(service.connections(), 1);
}
