#![allow(dead_code)]

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::{get, post},
    Json, Router,
};
use live_classifier::camera::{CameraError, CameraProvider, CaptureSource, RawFrame};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::TcpListener, sync::mpsc::UnboundedReceiver};

/// One step a scripted service endpoint performs on every connection.
#[derive(Debug, Clone)]
pub enum Step {
    Text(String),
    /// Wait for one binary frame from the client.
    AwaitFrame,
    /// Send a close frame with code 1000 and end the connection.
    Close,
}

#[derive(Clone)]
struct Script {
    steps: Arc<Vec<Step>>,
    connections: Arc<AtomicUsize>,
    frames: Arc<AtomicUsize>,
}

/// Server standing in for the inference and training endpoints, plus the
/// `/train/` and `/status` REST routes.
pub struct ScriptedService {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    frames: Arc<AtomicUsize>,
}

impl ScriptedService {
    pub async fn start(steps: Vec<Step>) -> Self {
        let script = Script {
            steps: Arc::new(steps),
            connections: Arc::new(AtomicUsize::new(0)),
            frames: Arc::new(AtomicUsize::new(0)),
        };
        let connections = script.connections.clone();
        let frames = script.frames.clone();

        let router = Router::new()
            .route("/ws/predict", get(upgrade))
            .route("/ws/train_progress/{session_id}", get(upgrade))
            .route("/train/", post(submit_training))
            .route("/status", get(status))
            .with_state(script);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            addr,
            connections,
            frames,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn inference_endpoint(&self) -> String {
        format!("ws://{}/ws/predict", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::SeqCst)
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(script): State<Script>) -> Response {
    script.connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| play(socket, script))
}

async fn submit_training() -> Json<Value> {
    Json(json!({"message": "Training started.", "session_id": "3f2c9a"}))
}

async fn status() -> Json<Value> {
    Json(json!({"datasets_available": true, "model_available": true, "class_names": ["cat", "dog"]}))
}

async fn play(mut socket: WebSocket, script: Script) {
    for step in script.steps.iter() {
        match step {
            Step::Text(text) => {
                if socket.send(Message::Text(text.clone().into())).await.is_err() {
                    return;
                }
            }
            Step::AwaitFrame => loop {
                match socket.recv().await {
                    Some(Ok(Message::Binary(_))) => {
                        script.frames.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                }
            },
            Step::Close => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: 1000,
                        reason: "done".into(),
                    })))
                    .await;
                return;
            }
        }
    }

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Binary(_) => {
                script.frames.fetch_add(1, Ordering::SeqCst);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Capture source that replays a flat grey frame and counts stops.
pub struct TestCamera {
    live: AtomicBool,
    stops: AtomicUsize,
}

impl TestCamera {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            live: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl CaptureSource for TestCamera {
    fn capture_frame(&self) -> Result<Option<RawFrame>, CameraError> {
        if !self.is_live() {
            return Err(CameraError::NotCapturing);
        }
        Ok(Some(RawFrame {
            width: 32,
            height: 24,
            pixels: vec![128; 32 * 24 * 3],
        }))
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out a fresh [`TestCamera`] per acquire, or refuses access.
pub struct TestProvider {
    deny: bool,
    pub acquired: Mutex<Vec<Arc<TestCamera>>>,
}

impl TestProvider {
    pub fn granting() -> Arc<Self> {
        Arc::new(Self {
            deny: false,
            acquired: Mutex::new(Vec::new()),
        })
    }

    pub fn denying() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            acquired: Mutex::new(Vec::new()),
        })
    }

    pub fn camera(&self, index: usize) -> Arc<TestCamera> {
        self.acquired.lock()[index].clone()
    }
}

impl CameraProvider for TestProvider {
    fn acquire(&self) -> Result<Arc<dyn CaptureSource>, CameraError> {
        if self.deny {
            return Err(CameraError::PermissionDenied("user dismissed prompt".into()));
        }
        let camera = TestCamera::new();
        self.acquired.lock().push(camera.clone());
        Ok(camera)
    }
}

pub async fn next_event<T>(events: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Address nothing listens on.
pub const CLOSED_ENDPOINT: &str = "ws://127.0.0.1:1/ws/predict";
pub const CLOSED_BASE_URL: &str = "http://127.0.0.1:1";
