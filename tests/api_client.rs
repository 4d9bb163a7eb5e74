use live_classifier::{
    api::{ApiClient, ApiError, DatasetFile, ProgressCallback, ServerStatus, UploadProgress},
    config::ServiceConfig,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

async fn client() -> (MockServer, ApiClient) {
    let server = MockServer::start().await;
    let client = ApiClient::new(ServiceConfig::new(server.uri()));
    (server, client)
}

#[tokio::test]
async fn test_status() {
    let (server, client) = client().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "datasets_available": true,
            "class_names": ["cat", "dog"],
            "model_available": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let status = client.status().await.unwrap();

    assert_eq!(
        status,
        ServerStatus {
            datasets_available: true,
            model_available: false,
            class_names: vec!["cat".into(), "dog".into()],
        }
    );
}

#[tokio::test]
async fn test_submit_training_returns_session_id() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/train/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": "Training started.",
            "session_id": "0b8f6c1e-5d7a-4c39-9d2e-1f3a4b5c6d7e"
        })))
        .mount(&server)
        .await;

    let ticket = client.submit_training().await.unwrap();

    assert_eq!(ticket.session_id, "0b8f6c1e-5d7a-4c39-9d2e-1f3a4b5c6d7e");
    assert_eq!(ticket.message.as_deref(), Some("Training started."));
}

#[tokio::test]
async fn test_server_detail_is_surfaced() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/train/"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"detail": "Dataset is empty, upload data first."})),
        )
        .mount(&server)
        .await;

    let err = client.submit_training().await.unwrap_err();

    match err {
        ApiError::Server { status, detail } => {
            assert_eq!(status, 400);
            assert_eq!(detail, "Dataset is empty, upload data first.");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_upload_reports_progress() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/upload_datasets/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": "Upload succeeded",
            "files": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("a.jpg");
    let second = dir.path().join("b.png");
    std::fs::write(&first, vec![1u8; 100_000]).unwrap();
    std::fs::write(&second, vec![2u8; 2_000]).unwrap();
    let files = vec![
        DatasetFile {
            class_name: "cat".into(),
            path: first,
        },
        DatasetFile {
            class_name: "cat".into(),
            path: second,
        },
    ];

    let seen: Arc<Mutex<Vec<UploadProgress>>> = Arc::default();
    let on_progress: ProgressCallback = {
        let seen = seen.clone();
        Arc::new(move |progress: UploadProgress| seen.lock().push(progress))
    };

    let message = client.upload_datasets(&files, on_progress).await.unwrap();

    assert_eq!(message, "Upload succeeded");
    let seen = seen.lock();
    let last = seen.last().copied().unwrap();
    assert_eq!(last, UploadProgress { sent: 102_000, total: 102_000 });
    assert_eq!(last.percent(), 100);
    assert!(seen.windows(2).all(|pair| pair[0].sent <= pair[1].sent));
}

#[tokio::test]
async fn test_upload_mismatch_error_field_is_surfaced() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/upload_datasets/"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"error": "file/class count mismatch"})),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("a.jpg");
    std::fs::write(&image, b"jpeg").unwrap();
    let files = vec![DatasetFile {
        class_name: "cat".into(),
        path: image,
    }];

    let err = client
        .upload_datasets(&files, Arc::new(|_: UploadProgress| {}))
        .await
        .unwrap_err();

    assert!(
        matches!(err, ApiError::Server { status: 400, ref detail } if detail == "file/class count mismatch")
    );
}

#[tokio::test]
async fn test_empty_upload_is_rejected_locally() {
    let (server, client) = client().await;

    let err = client.upload_datasets(&[], Arc::new(|_: UploadProgress| {})).await.unwrap_err();

    assert!(matches!(err, ApiError::EmptyUpload));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_class_and_all() {
    let (server, client) = client().await;
    Mock::given(method("DELETE"))
        .and(path("/dataset/golden%20retriever"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"message": "Class deleted."})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/datasets/all"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"message": "All datasets cleared."})),
        )
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(
        client.delete_class("golden retriever").await.unwrap(),
        "Class deleted."
    );
    assert_eq!(
        client.delete_all_datasets().await.unwrap(),
        "All datasets cleared."
    );
}

#[tokio::test]
async fn test_export_writes_named_archive() {
    let (server, client) = client().await;
    Mock::given(method("GET"))
        .and(path("/export_project/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "content-disposition",
                    "attachment; filename=project_export_20240101-120000.zip",
                )
                .set_body_bytes(b"PK\x03\x04archive".to_vec()),
        )
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();

    let written = client.export_project(dir.path()).await.unwrap();

    assert_eq!(
        written,
        dir.path().join("project_export_20240101-120000.zip")
    );
    assert_eq!(std::fs::read(&written).unwrap(), b"PK\x03\x04archive");
}

#[tokio::test]
async fn test_import_rejects_non_zip() {
    let (server, client) = client().await;
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("backup.tar");
    std::fs::write(&archive, b"tar").unwrap();

    let err = client.import_project(&archive).await.unwrap_err();

    assert!(matches!(err, ApiError::NotAnArchive(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_import_uploads_archive() {
    let (server, client) = client().await;
    Mock::given(method("POST"))
        .and(path("/import_project/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"message": "Project imported."})),
        )
        .expect(1)
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("project.ZIP");
    std::fs::write(&archive, b"PK\x03\x04").unwrap();

    assert_eq!(
        client.import_project(&archive).await.unwrap(),
        "Project imported."
    );
}
