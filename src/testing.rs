//! Recording fakes and fixtures shared by the unit tests.

use crate::config::{MediaConfig, SessionConfig};
use crate::error::{CompletionError, MediaError, PlatformError, Result};
use crate::llm::{ChatRequest, Completer, CompletionApi};
use crate::media::MediaNormalizer;
use crate::messaging::{InboundStream, Messaging, RemoteFile};
use crate::session::SessionDeps;
use crate::store::{
    AIAssistant, AssistantCategory, AssistantConfig, Dashboard, Messenger, MessengerId,
    MessengerKind, NewAssistant, NewMessenger, PlatformUser, PlatformUserId, SqliteStore,
};
use crate::stt::Transcriber;
use crate::supervisor::{ManagedSession, SessionFactory};
use crate::{EventKind, InboundEvent, MessageHandle, PlatformChatId};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// A seeded dashboard with one active Telegram messenger and one assistant.
pub struct Tenant {
    pub dashboard: Dashboard,
    pub messenger: Messenger,
    pub assistant: AIAssistant,
}

pub async fn seed_tenant(store: &SqliteStore) -> Tenant {
    let dashboard = store.create_dashboard("acme", Some(1)).await.unwrap();
    let messenger = store
        .create_messenger(NewMessenger {
            dashboard_id: dashboard.id,
            kind: MessengerKind::Telegram,
            token: format!("{}:test-token", dashboard.id),
            is_active: true,
            id_instance: None,
        })
        .await
        .unwrap();
    let assistant = store
        .create_assistant(NewAssistant::new(
            dashboard.id,
            format!("asst_{}", dashboard.id),
        ))
        .await
        .unwrap();
    Tenant {
        dashboard,
        messenger,
        assistant,
    }
}

pub async fn count_rows(store: &SqliteStore, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(store.pool())
        .await
        .unwrap()
}

pub fn assistant_fixture(model: &str, config: AssistantConfig) -> AIAssistant {
    AIAssistant {
        id: 1,
        dashboard_id: 1,
        assistant_id: "asst_fixture".into(),
        category: AssistantCategory::General,
        is_active: true,
        config,
        instructions: "You are our AI Assistant".into(),
        model: model.into(),
        created_at: chrono::Utc::now(),
        last_used: None,
    }
}

pub fn telegram_user(id: i64) -> PlatformUser {
    PlatformUser {
        id: PlatformUserId::Telegram(id),
        first_name: "Ada".into(),
        last_name: Some("Lovelace".into()),
        username: Some("ada".into()),
        is_bot: false,
    }
}

pub fn event(chat_id: PlatformChatId, user_id: i64, kind: EventKind) -> InboundEvent {
    InboundEvent {
        chat_id,
        user: telegram_user(user_id),
        kind,
        timestamp: chrono::Utc::now(),
    }
}

pub fn session_deps(
    store: Arc<SqliteStore>,
    completion: Arc<FakeCompletion>,
    transcriber: FakeTranscriber,
) -> SessionDeps {
    let media = MediaNormalizer::new(
        Arc::new(transcriber),
        MediaConfig {
            ffmpeg_path: String::new(),
            ..MediaConfig::default()
        },
    );
    SessionDeps {
        store: store.clone(),
        completer: Completer::new(completion, store),
        media: Arc::new(media),
        config: SessionConfig::default(),
        shutdown_grace: Duration::from_secs(2),
    }
}

/// In-process transport that records everything the session sends.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<FakeTransportState>,
}

#[derive(Default)]
struct FakeTransportState {
    sent: Mutex<Vec<(PlatformChatId, String)>>,
    edits: Mutex<Vec<(MessageHandle, String)>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    resolved: Mutex<Vec<String>>,
    inbound_tx: Mutex<Option<mpsc::Sender<InboundEvent>>>,
    fail_health: AtomicBool,
    shutdown_calls: AtomicUsize,
    next_message_id: AtomicI32,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_health_check(&self) {
        self.state.fail_health.store(true, Ordering::SeqCst);
    }

    pub fn add_file(&self, file_id: &str, bytes: Vec<u8>) {
        self.state.files.lock().insert(file_id.to_string(), bytes);
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.state
            .sent
            .lock()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn edits(&self) -> Vec<(MessageHandle, String)> {
        self.state.edits.lock().clone()
    }

    pub fn resolved_files(&self) -> Vec<String> {
        self.state.resolved.lock().clone()
    }

    pub fn shutdown_calls(&self) -> usize {
        self.state.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Deliver an event through the stream returned by `start`.
    pub async fn push(&self, event: InboundEvent) {
        let sender = self.state.inbound_tx.lock().clone();
        sender
            .expect("transport not started")
            .send(event)
            .await
            .expect("session dropped the stream");
    }

    /// End the inbound stream as if the platform connection died.
    pub fn close_stream(&self) {
        self.state.inbound_tx.lock().take();
    }
}

impl Messaging for FakeTransport {
    fn name(&self) -> &str {
        "fake"
    }

    async fn health_check(&self) -> Result<String> {
        if self.state.fail_health.load(Ordering::SeqCst) {
            return Err(PlatformError::Connect {
                platform: "fake",
                reason: "401 unauthorized".into(),
            }
            .into());
        }
        Ok("@fake_bot".into())
    }

    async fn start(&self) -> Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        *self.state.inbound_tx.lock() = Some(inbound_tx);
        Ok(Box::pin(ReceiverStream::new(inbound_rx)))
    }

    async fn send_text(&self, chat_id: PlatformChatId, text: &str) -> Result<MessageHandle> {
        self.state.sent.lock().push((chat_id, text.to_string()));
        Ok(MessageHandle {
            chat_id,
            message_id: self.state.next_message_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn edit_text(&self, handle: MessageHandle, text: &str) -> Result<()> {
        self.state.edits.lock().push((handle, text.to_string()));
        Ok(())
    }

    async fn resolve_file(&self, file_id: &str) -> Result<RemoteFile> {
        self.state.resolved.lock().push(file_id.to_string());
        let size = self
            .state
            .files
            .lock()
            .get(file_id)
            .map(Vec::len)
            .ok_or_else(|| PlatformError::File {
                file_id: file_id.to_string(),
                reason: "not found".into(),
            })?;
        Ok(RemoteFile {
            file_id: file_id.to_string(),
            path: format!("files/{file_id}"),
            size: size as u32,
        })
    }

    async fn fetch_file(&self, file: &RemoteFile) -> Result<Vec<u8>> {
        let bytes = self.state.files.lock().get(&file.file_id).cloned();
        bytes.ok_or_else(|| {
            PlatformError::File {
                file_id: file.file_id.clone(),
                reason: "not found".into(),
            }
            .into()
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.state.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        self.state.inbound_tx.lock().take();
        Ok(())
    }
}

/// Completion API with a fixed result that records every request.
pub struct FakeCompletion {
    /// `None` never answers.
    result: Option<std::result::Result<String, CompletionError>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl FakeCompletion {
    pub fn replying(text: &str) -> Self {
        Self {
            result: Some(Ok(text.to_string())),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: CompletionError) -> Self {
        Self {
            result: Some(Err(error)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A provider that accepts the request and never responds.
    pub fn hanging() -> Self {
        Self {
            result: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CompletionApi for FakeCompletion {
    async fn create(&self, request: &ChatRequest) -> std::result::Result<String, CompletionError> {
        self.requests.lock().push(request.clone());
        match &self.result {
            Some(result) => result.clone(),
            None => std::future::pending().await,
        }
    }
}

/// Transcriber with a fixed answer.
#[derive(Clone)]
pub struct FakeTranscriber {
    result: std::result::Result<String, String>,
    calls: Arc<Mutex<Vec<(usize, String)>>>,
}

impl FakeTranscriber {
    pub fn returning(text: &str) -> Self {
        Self {
            result: Ok(text.to_string()),
            calls: Arc::default(),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            result: Err(reason.to_string()),
            calls: Arc::default(),
        }
    }

    /// `(audio length, filename)` per call.
    pub fn calls(&self) -> Vec<(usize, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        filename: &str,
    ) -> std::result::Result<String, MediaError> {
        self.calls.lock().push((audio.len(), filename.to_string()));
        self.result
            .clone()
            .map_err(MediaError::TranscriptionFailed)
    }
}

/// Observable state of one fake session.
#[derive(Clone, Default)]
pub struct SessionMonitor {
    running: Arc<AtomicBool>,
    shutdown_calls: Arc<AtomicUsize>,
}

impl SessionMonitor {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Simulate the transport dying underneath the session.
    pub fn kill(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

struct FakeSession {
    monitor: SessionMonitor,
    fail_initialize: bool,
    fail_shutdown: bool,
}

#[async_trait]
impl ManagedSession for FakeSession {
    async fn initialize(&mut self) -> Result<()> {
        if self.fail_initialize {
            return Err(PlatformError::Connect {
                platform: "fake",
                reason: "invalid token".into(),
            }
            .into());
        }
        self.monitor.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.monitor.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        self.monitor.running.store(false, Ordering::SeqCst);
        if self.fail_shutdown {
            return Err(anyhow::anyhow!("transport hung up mid-shutdown").into());
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.monitor.is_running()
    }
}

/// Session factory recording every session it creates.
#[derive(Clone, Default)]
pub struct FakeSessionFactory {
    state: Arc<FakeFactoryState>,
}

#[derive(Default)]
struct FakeFactoryState {
    created: Mutex<Vec<(MessengerId, SessionMonitor)>>,
    fail_initialize: Mutex<HashSet<MessengerId>>,
    fail_shutdown: Mutex<HashSet<MessengerId>>,
}

impl FakeSessionFactory {
    /// The next session created for `messenger_id` fails to initialize.
    pub fn fail_next_initialize(&self, messenger_id: MessengerId) {
        self.state.fail_initialize.lock().insert(messenger_id);
    }

    pub fn fail_shutdown(&self, messenger_id: MessengerId) {
        self.state.fail_shutdown.lock().insert(messenger_id);
    }

    pub fn created(&self) -> Vec<MessengerId> {
        self.state.created.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Monitor of the most recent session created for `messenger_id`.
    pub fn monitor(&self, messenger_id: MessengerId) -> SessionMonitor {
        self.state
            .created
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| *id == messenger_id)
            .map(|(_, monitor)| monitor.clone())
            .expect("no session created for messenger")
    }
}

impl SessionFactory for FakeSessionFactory {
    fn create(&self, messenger: &Messenger) -> Box<dyn ManagedSession> {
        let monitor = SessionMonitor::default();
        self.state
            .created
            .lock()
            .push((messenger.id, monitor.clone()));
        Box::new(FakeSession {
            monitor,
            fail_initialize: self.state.fail_initialize.lock().remove(&messenger.id),
            fail_shutdown: self.state.fail_shutdown.lock().contains(&messenger.id),
        })
    }
}
