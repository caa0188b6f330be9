use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::api::{HistoryEntry, SessionInitResponse};
use crate::core::controller::StreamingController;
use crate::core::session_store::SessionStore;
use crate::core::transport::{
    BackendError, ByteStream, ChatBackend, Transport, TransportError,
};

pub const TEST_MODEL: &str = "test-model";
pub const TEST_CHAT_URL: &str = "http://localhost:8000/chat";

pub fn delta_frame(text: &str) -> Vec<u8> {
    let payload = serde_json::json!({ "type": "delta", "content": text });
    format!("data: {payload}\n\n").into_bytes()
}

pub fn done_frame() -> Vec<u8> {
    b"data: {\"type\":\"done\"}\n\n".to_vec()
}

pub fn error_frame(message: &str) -> Vec<u8> {
    let payload = serde_json::json!({ "type": "error", "message": message });
    format!("data: {payload}\n\n").into_bytes()
}

#[derive(Default)]
struct LiveState {
    sender: Option<mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>>,
    pending: VecDeque<Vec<u8>>,
}

enum Script {
    Bodies(VecDeque<Vec<Vec<u8>>>),
    Fail(TransportError),
    Live(Arc<Mutex<LiveState>>),
    Hang,
}

/// In-memory transport that replays canned response bodies.
pub struct ScriptedTransport {
    script: Mutex<Script>,
    requests: Mutex<Vec<serde_json::Value>>,
}

/// Pushes frames into the stream opened by a live [`ScriptedTransport`].
/// Frames sent before the stream opens, or after it closed, are queued for
/// the next open.
pub struct LiveFeed {
    state: Arc<Mutex<LiveState>>,
}

impl LiveFeed {
    pub fn send_frame(&self, frame: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if let Some(sender) = &state.sender {
            if sender.send(Ok(frame.clone())).is_ok() {
                return;
            }
        }
        state.sender = None;
        state.pending.push_back(frame);
    }
}

impl ScriptedTransport {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn with_body(frames: Vec<Vec<u8>>) -> Arc<Self> {
        Self::with_bodies(vec![frames])
    }

    /// One body per `open_stream` call, in order.
    pub fn with_bodies(bodies: Vec<Vec<Vec<u8>>>) -> Arc<Self> {
        Self::new(Script::Bodies(bodies.into()))
    }

    pub fn failing(error: TransportError) -> Arc<Self> {
        Self::new(Script::Fail(error))
    }

    /// Every `open_stream` call stays pending forever.
    pub fn hanging() -> Arc<Self> {
        Self::new(Script::Hang)
    }

    pub fn live() -> (Arc<Self>, LiveFeed) {
        let state = Arc::new(Mutex::new(LiveState::default()));
        let transport = Self::new(Script::Live(Arc::clone(&state)));
        (transport, LiveFeed { state })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<serde_json::Value> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open_stream(
        &self,
        _url: &str,
        body: serde_json::Value,
    ) -> Result<ByteStream, TransportError> {
        self.requests.lock().unwrap().push(body);

        let hang = matches!(*self.script.lock().unwrap(), Script::Hang);
        if hang {
            std::future::pending::<()>().await;
        }

        let mut script = self.script.lock().unwrap();
        match &mut *script {
            Script::Bodies(bodies) => {
                let frames = bodies.pop_front().unwrap_or_default();
                let chunks: Vec<Result<Vec<u8>, TransportError>> =
                    frames.into_iter().map(Ok).collect();
                Ok(Box::pin(futures_util::stream::iter(chunks)))
            }
            Script::Fail(error) => Err(error.clone()),
            Script::Hang => unreachable!("hanging transport never resolves"),
            Script::Live(state) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let mut state = state.lock().unwrap();
                for frame in state.pending.drain(..) {
                    let _ = tx.send(Ok(frame));
                }
                state.sender = Some(tx);
                Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })))
            }
        }
    }
}

/// Backend with fixed answers for session setup and history.
pub struct FakeBackend {
    next_session: Mutex<u32>,
    history: Vec<HistoryEntry>,
    models: Vec<String>,
}

impl FakeBackend {
    pub fn with_history(history: Vec<HistoryEntry>) -> Self {
        Self {
            next_session: Mutex::new(1),
            history,
            models: vec![TEST_MODEL.to_string()],
        }
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn init_session(&self, model: &str) -> Result<SessionInitResponse, BackendError> {
        let mut next = self.next_session.lock().unwrap();
        let session_id = format!("session-{}", *next);
        *next += 1;
        Ok(SessionInitResponse {
            session_id,
            model: model.to_string(),
        })
    }

    async fn fetch_history(&self, _session_id: &str) -> Result<Vec<HistoryEntry>, BackendError> {
        Ok(self.history.clone())
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.models.clone())
    }

    fn chat_url(&self) -> String {
        TEST_CHAT_URL.to_string()
    }
}

pub async fn new_controller(
    transport: Arc<ScriptedTransport>,
    session_id: Option<&str>,
) -> StreamingController {
    let mut store = SessionStore::new();
    if let Some(session_id) = session_id {
        store.create_session(session_id, TEST_MODEL);
    }
    let store = Arc::new(tokio::sync::Mutex::new(store));
    StreamingController::new(transport, store, TEST_CHAT_URL.to_string())
}

pub async fn wait_for_content(controller: &StreamingController, expected: &str) {
    let mut rx = controller.store().lock().await.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|snapshot| {
            snapshot
                .messages
                .iter()
                .any(|message| message.is_assistant() && message.content == expected)
        }),
    )
    .await
    .expect("content should arrive")
    .expect("store alive");
}

pub async fn wait_for_streaming(controller: &StreamingController) {
    let mut rx = controller.store().lock().await.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|snapshot| snapshot.streaming_message().is_some()),
    )
    .await
    .expect("turn should start streaming")
    .expect("store alive");
}

/// Waits until a turn has claimed the slot, before its stream has opened.
pub async fn wait_for_turn_start(controller: &StreamingController) {
    let mut rx = controller.store().lock().await.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|snapshot| snapshot.is_any_turn_streaming),
    )
    .await
    .expect("turn should claim the slot")
    .expect("store alive");
}
