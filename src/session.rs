//! Bot session: one running transport for one messenger credential, and the
//! per-event pipeline from inbound message to persisted reply.

use crate::config::SessionConfig;
use crate::error::{MediaError, Result};
use crate::llm::{Completer, CompletionOutcome};
use crate::media::{InboundContent, MediaNormalizer, Normalized};
use crate::messaging::MessagingDyn;
use crate::store::{
    AIAssistant, Chat, Client, ConversationStore, HistoryEntry, MessageId, Messenger, NewMessage,
    PlatformUser,
};
use crate::supervisor::ManagedSession;
use crate::{EventKind, InboundEvent, MessageHandle, PhotoVariant, PlatformChatId};

use async_trait::async_trait;
use futures::future::Shared;
use futures::{FutureExt as _, StreamExt as _};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio_util::task::TaskTracker;

pub const START_PROMPT: &str = "Please start a new session with /start";
pub const START_ERROR: &str = "⚠️ An error occurred. Please try again later.";
pub const TEXT_ERROR: &str = "⚠️ An error occurred while processing your message. Please try again.";
pub const NO_ASSISTANT: &str = "⚠️ No active AI assistant is configured for this dashboard.";
pub const UNSUPPORTED_MEDIA: &str = "I currently support text, photos and audio messages.";
pub const IMAGE_REJECTED: &str = "I can't process images with my current configuration.";
pub const PHOTO_FAILED: &str = "⚠️ Failed to process your image.";
pub const AUDIO_PROCESSING: &str = "🔊 Processing your audio message...";
pub const TRANSCRIPTION_FAILED: &str = "⚠️ Failed to transcribe audio. Please try again.";
pub const NO_SPEECH: &str =
    "🤔 I didn't catch that. Could you try again or send a text message instead?";
pub const AUDIO_FAILED: &str = "⚠️ Failed to process your audio message. Please try again later.";

/// Lifecycle of a [`BotSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Running,
    ShuttingDown,
    Stopped,
}

/// Dependencies shared by every session of the process.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<dyn ConversationStore>,
    pub completer: Completer,
    pub media: Arc<MediaNormalizer>,
    pub config: SessionConfig,
    /// How long `shutdown` waits for in-flight handlers.
    pub shutdown_grace: Duration,
}

/// A running bot for one messenger.
pub struct BotSession {
    inner: Arc<SessionInner>,
    state: SessionState,
    tracker: TaskTracker,
    shutdown_grace: Duration,
    receiving: Arc<AtomicBool>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    event_loop: Option<tokio::task::JoinHandle<()>>,
}

/// Everything an event handler needs, shared with the handler tasks.
struct SessionInner {
    messenger: Messenger,
    transport: Arc<dyn MessagingDyn>,
    store: Arc<dyn ConversationStore>,
    completer: Completer,
    media: Arc<MediaNormalizer>,
    config: SessionConfig,
    /// Platform chats that have sent `/start`.
    admitted: RwLock<HashSet<PlatformChatId>>,
    /// Newest queued handler per platform chat. Each handler waits for the
    /// one queued before it, so a chat's events run one at a time in arrival
    /// order while different chats run concurrently.
    chat_tails: Mutex<HashMap<PlatformChatId, ChatTail>>,
    next_turn: AtomicU64,
}

struct ChatTail {
    turn: u64,
    finished: Shared<oneshot::Receiver<()>>,
}

/// A handler's place in its chat's queue.
struct ChatTurn {
    chat_id: PlatformChatId,
    turn: u64,
    previous: Option<Shared<oneshot::Receiver<()>>>,
    done: oneshot::Sender<()>,
}

/// How a reply reaches the user.
#[derive(Debug, Clone, Copy)]
enum Delivery {
    Send,
    Edit(MessageHandle),
}

impl BotSession {
    pub fn new(messenger: Messenger, transport: Arc<dyn MessagingDyn>, deps: SessionDeps) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                messenger,
                transport,
                store: deps.store,
                completer: deps.completer,
                media: deps.media,
                config: deps.config,
                admitted: RwLock::new(HashSet::new()),
                chat_tails: Mutex::new(HashMap::new()),
                next_turn: AtomicU64::new(0),
            }),
            state: SessionState::Uninitialized,
            tracker: TaskTracker::new(),
            shutdown_grace: deps.shutdown_grace,
            receiving: Arc::new(AtomicBool::new(false)),
            shutdown_tx: None,
            event_loop: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn messenger(&self) -> &Messenger {
        &self.inner.messenger
    }

    pub async fn is_admitted(&self, chat_id: PlatformChatId) -> bool {
        self.inner.admitted.read().await.contains(&chat_id)
    }

    async fn start_receiving(&mut self) -> Result<()> {
        let transport = &self.inner.transport;
        let bot = transport.health_check().await?;
        let mut stream = transport.start().await?;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.receiving.store(true, Ordering::SeqCst);

        let inner = self.inner.clone();
        let tracker = self.tracker.clone();
        let receiving = self.receiving.clone();
        let messenger_id = self.inner.messenger.id;

        self.event_loop = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!(messenger_id, "session event loop stopping");
                        break;
                    }
                    event = stream.next() => {
                        let Some(event) = event else {
                            tracing::warn!(messenger_id, "inbound stream ended");
                            break;
                        };
                        // Queued here, on the loop, so arrival order is kept.
                        let turn = inner.queue_turn(event.chat_id).await;
                        let inner = inner.clone();
                        tracker.spawn(async move { inner.run_turn(turn, event).await });
                    }
                }
            }
            receiving.store(false, Ordering::SeqCst);
        }));

        tracing::info!(
            messenger_id,
            dashboard = %self.inner.messenger.dashboard_name,
            %bot,
            "bot session running"
        );
        Ok(())
    }
}

#[async_trait]
impl ManagedSession for BotSession {
    async fn initialize(&mut self) -> Result<()> {
        if self.state != SessionState::Uninitialized {
            return Ok(());
        }

        match self.start_receiving().await {
            Ok(()) => {
                self.state = SessionState::Running;
                Ok(())
            }
            Err(error) => {
                // Release whatever the transport set up before failing.
                if let Err(shutdown_error) = self.inner.transport.shutdown().await {
                    tracing::debug!(%shutdown_error, "transport cleanup after failed start");
                }
                self.state = SessionState::Stopped;
                Err(error)
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::ShuttingDown | SessionState::Stopped) {
            return Ok(());
        }
        self.state = SessionState::ShuttingDown;
        let messenger_id = self.inner.messenger.id;

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            shutdown_tx.send(()).await.ok();
        }
        if let Some(event_loop) = self.event_loop.take()
            && let Err(error) = event_loop.await
        {
            tracing::warn!(messenger_id, %error, "session event loop panicked");
        }

        self.tracker.close();
        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                messenger_id,
                in_flight = self.tracker.len(),
                grace_secs = self.shutdown_grace.as_secs(),
                "in-flight handlers did not finish within the grace period"
            );
        }

        let result = self.inner.transport.shutdown().await;
        self.state = SessionState::Stopped;
        tracing::info!(messenger_id, "bot session stopped");
        result
    }

    fn is_running(&self) -> bool {
        self.state == SessionState::Running && self.receiving.load(Ordering::SeqCst)
    }
}

impl SessionInner {
    /// Failure boundary for one event: nothing escapes, the user always gets
    /// an answer.
    async fn handle_event(&self, event: InboundEvent) {
        let chat_id = event.chat_id;
        let stage = event.kind.label();
        let age_ms = (chrono::Utc::now() - event.timestamp).num_milliseconds();
        tracing::debug!(chat_id, stage, age_ms, "handling inbound event");

        let (result, apology) = match &event.kind {
            EventKind::Start => (self.handle_start(&event).await, START_ERROR),
            EventKind::Text(text) => (self.handle_text(&event, text).await, TEXT_ERROR),
            EventKind::Photo { variants, caption } => (
                self.handle_photo(&event, variants, caption.as_deref()).await,
                PHOTO_FAILED,
            ),
            EventKind::Audio {
                file_id,
                mime_type,
                voice,
            } => (
                self.handle_audio(&event, file_id, mime_type.as_deref(), *voice)
                    .await,
                AUDIO_FAILED,
            ),
            EventKind::Other => (self.reply(chat_id, UNSUPPORTED_MEDIA).await, TEXT_ERROR),
        };

        if let Err(error) = result {
            tracing::error!(
                chat_id,
                messenger_id = self.messenger.id,
                stage,
                %error,
                "failed to handle inbound event"
            );
            if let Err(error) = self.transport.send_text(chat_id, apology).await {
                tracing::warn!(chat_id, %error, "failed to deliver apology");
            }
        }
    }

    async fn handle_start(&self, event: &InboundEvent) -> Result<()> {
        let (client, chat) = self.conversation(&event.user).await?;
        let assistant = self
            .store
            .default_assistant(self.messenger.dashboard_id)
            .await?;

        let mut greeting = format!("👋 Hello {}! I'm your AI assistant.", event.user.first_name);
        if let Some(assistant) = &assistant {
            greeting.push_str(&format!(
                "\n\nCurrent assistant: {}",
                assistant.category.display_name()
            ));
        }

        self.reply(event.chat_id, &greeting).await?;
        self.admitted.write().await.insert(event.chat_id);

        tracing::info!(
            chat_id = event.chat_id,
            client_id = client.id,
            store_chat_id = chat.id,
            "chat admitted"
        );
        Ok(())
    }

    async fn handle_text(&self, event: &InboundEvent, text: &str) -> Result<()> {
        if !self.admit(event.chat_id).await? {
            return Ok(());
        }

        let (client, chat) = self.conversation(&event.user).await?;
        let inbound = self
            .store
            .append_message(NewMessage::inbound(&chat, &client, &event.user, text))
            .await?;

        let Some(assistant) = self.default_assistant(event.chat_id).await? else {
            return Ok(());
        };

        self.answer(
            event.chat_id,
            &chat,
            &client,
            &assistant,
            &InboundContent::text(text),
            inbound.id,
            Delivery::Send,
        )
        .await
    }

    async fn handle_photo(
        &self,
        event: &InboundEvent,
        variants: &[PhotoVariant],
        caption: Option<&str>,
    ) -> Result<()> {
        if !self.admit(event.chat_id).await? {
            return Ok(());
        }

        let (client, chat) = self.conversation(&event.user).await?;
        let Some(assistant) = self.default_assistant(event.chat_id).await? else {
            return Ok(());
        };

        let content = match self
            .media
            .photo(self.transport.as_ref(), &assistant, variants, caption)
            .await?
        {
            Normalized::Content(content) => content,
            Normalized::Rejected => return self.reply(event.chat_id, IMAGE_REJECTED).await,
        };

        let inbound = self
            .store
            .append_message(
                NewMessage::inbound(&chat, &client, &event.user, &content.text)
                    .with_media(content.media.clone()),
            )
            .await?;

        self.answer(
            event.chat_id,
            &chat,
            &client,
            &assistant,
            &content,
            inbound.id,
            Delivery::Send,
        )
        .await
    }

    async fn handle_audio(
        &self,
        event: &InboundEvent,
        file_id: &str,
        mime_type: Option<&str>,
        voice: bool,
    ) -> Result<()> {
        if !self.admit(event.chat_id).await? {
            return Ok(());
        }

        let (client, chat) = self.conversation(&event.user).await?;
        let Some(assistant) = self.default_assistant(event.chat_id).await? else {
            return Ok(());
        };

        let notice = self
            .transport
            .send_text(event.chat_id, AUDIO_PROCESSING)
            .await?;

        let result = self
            .transcribe_and_answer(event, &chat, &client, &assistant, file_id, mime_type, voice, notice)
            .await;

        if let Err(error) = result {
            tracing::error!(chat_id = event.chat_id, stage = "audio", %error, "audio pipeline failed");
            let text = match &error {
                crate::Error::Media(MediaError::NoSpeech) => NO_SPEECH,
                crate::Error::Media(
                    MediaError::TranscriptionFailed(_)
                    | MediaError::Download(_)
                    | MediaError::TooLarge { .. },
                ) => TRANSCRIPTION_FAILED,
                _ => AUDIO_FAILED,
            };
            self.deliver(event.chat_id, Delivery::Edit(notice), text)
                .await?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn transcribe_and_answer(
        &self,
        event: &InboundEvent,
        chat: &Chat,
        client: &Client,
        assistant: &AIAssistant,
        file_id: &str,
        mime_type: Option<&str>,
        voice: bool,
        notice: MessageHandle,
    ) -> Result<()> {
        let content = self
            .media
            .audio(self.transport.as_ref(), file_id, mime_type, voice)
            .await?;

        let inbound = self
            .store
            .append_message(
                NewMessage::inbound(chat, client, &event.user, &content.text)
                    .with_media(content.media.clone()),
            )
            .await?;

        self.answer(
            event.chat_id,
            chat,
            client,
            assistant,
            &content,
            inbound.id,
            Delivery::Edit(notice),
        )
        .await
    }

    /// History, completion, delivery, then persistence of the reply.
    #[allow(clippy::too_many_arguments)]
    async fn answer(
        &self,
        chat_id: PlatformChatId,
        chat: &Chat,
        client: &Client,
        assistant: &AIAssistant,
        content: &InboundContent,
        inbound_id: MessageId,
        delivery: Delivery,
    ) -> Result<()> {
        let history = self.history(chat, inbound_id).await?;
        tracing::debug!(chat_id, turns = history.len(), "loaded conversation history");

        let outcome = self
            .completer
            .complete(
                assistant,
                &content.text,
                content.image_ref.as_deref(),
                &history,
            )
            .await;

        self.deliver(chat_id, delivery, outcome.text()).await?;

        if let CompletionOutcome::Reply(reply) = &outcome {
            self.store
                .append_message(NewMessage::outgoing(chat, client, assistant, reply))
                .await?;
        }
        Ok(())
    }

    /// Last `history_limit` turns before the message being answered.
    async fn history(&self, chat: &Chat, current: MessageId) -> Result<Vec<HistoryEntry>> {
        let limit = self.config.history_limit;
        let mut history: Vec<HistoryEntry> = self
            .store
            .recent_history(chat.id, limit.saturating_add(1))
            .await?
            .into_iter()
            .filter(|entry| entry.message_id != current)
            .collect();

        let excess = history.len().saturating_sub(limit.max(0) as usize);
        history.drain(..excess);
        Ok(history)
    }

    /// Gate for non-start events. Prompts unadmitted chats and returns false.
    async fn admit(&self, chat_id: PlatformChatId) -> Result<bool> {
        if self.admitted.read().await.contains(&chat_id) {
            return Ok(true);
        }
        tracing::info!(chat_id, "message from chat without a session, prompting /start");
        self.reply(chat_id, START_PROMPT).await?;
        Ok(false)
    }

    /// Default assistant, or tell the user none is configured.
    async fn default_assistant(&self, chat_id: PlatformChatId) -> Result<Option<AIAssistant>> {
        let assistant = self
            .store
            .default_assistant(self.messenger.dashboard_id)
            .await?;
        if assistant.is_none() {
            tracing::warn!(
                chat_id,
                dashboard_id = self.messenger.dashboard_id,
                "no active assistant for dashboard"
            );
            self.reply(chat_id, NO_ASSISTANT).await?;
        }
        Ok(assistant)
    }

    async fn conversation(&self, user: &PlatformUser) -> Result<(Client, Chat)> {
        let client = self
            .store
            .get_or_create_client(self.messenger.dashboard_id, user)
            .await?;
        let chat = self.store.get_or_create_chat(&self.messenger, &client).await?;
        Ok((client, chat))
    }

    async fn reply(&self, chat_id: PlatformChatId, text: &str) -> Result<()> {
        self.deliver(chat_id, Delivery::Send, text).await
    }

    async fn deliver(&self, chat_id: PlatformChatId, delivery: Delivery, text: &str) -> Result<()> {
        match delivery {
            Delivery::Send => {
                self.transport.send_text(chat_id, text).await?;
            }
            Delivery::Edit(handle) => self.transport.edit_text(handle, text).await?,
        }
        Ok(())
    }

    /// Put a handler at the back of its chat's queue.
    async fn queue_turn(&self, chat_id: PlatformChatId) -> ChatTurn {
        let turn = self.next_turn.fetch_add(1, Ordering::Relaxed);
        let (done, finished) = oneshot::channel();
        let previous = self
            .chat_tails
            .lock()
            .await
            .insert(
                chat_id,
                ChatTail {
                    turn,
                    finished: finished.shared(),
                },
            )
            .map(|tail| tail.finished);

        ChatTurn {
            chat_id,
            turn,
            previous,
            done,
        }
    }

    async fn run_turn(&self, turn: ChatTurn, event: InboundEvent) {
        if let Some(previous) = turn.previous {
            // A dropped sender (panicked handler) also releases the queue.
            previous.await.ok();
        }

        self.handle_event(event).await;

        let mut tails = self.chat_tails.lock().await;
        if tails
            .get(&turn.chat_id)
            .is_some_and(|tail| tail.turn == turn.turn)
        {
            tails.remove(&turn.chat_id);
        }
        drop(tails);
        turn.done.send(()).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompletionError;
    use crate::llm::completion::{ChatContent, ContentPart};
    use crate::llm::ChatRequest;
    use crate::store::{AssistantCategory, NewAssistant, Role, SqliteStore};
    use crate::testing::{
        FakeCompletion, FakeTranscriber, FakeTransport, Tenant, count_rows, event, seed_tenant,
        session_deps,
    };

    const CHAT: PlatformChatId = 555;
    const USER: i64 = 77;

    struct Harness {
        store: Arc<SqliteStore>,
        tenant: Tenant,
        transport: FakeTransport,
        completion: Arc<FakeCompletion>,
        session: BotSession,
    }

    async fn harness_with(completion: FakeCompletion, transcriber: FakeTranscriber) -> Harness {
        harness_configured(completion, transcriber, |_| {}).await
    }

    async fn harness_configured(
        completion: FakeCompletion,
        transcriber: FakeTranscriber,
        configure: impl FnOnce(&mut SessionDeps),
    ) -> Harness {
        let store = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let tenant = seed_tenant(&store).await;
        let transport = FakeTransport::new();
        let completion = Arc::new(completion);
        let mut deps = session_deps(store.clone(), completion.clone(), transcriber);
        configure(&mut deps);
        let session = BotSession::new(
            tenant.messenger.clone(),
            Arc::new(transport.clone()),
            deps,
        );
        Harness {
            store,
            tenant,
            transport,
            completion,
            session,
        }
    }

    async fn harness() -> Harness {
        harness_with(
            FakeCompletion::replying("Hi! How can I help?"),
            FakeTranscriber::returning("what's the weather"),
        )
        .await
    }

    async fn wait_for_sent(transport: &FakeTransport, count: usize) {
        for _ in 0..400 {
            if transport.sent_texts().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Text of the newest user turn in a completion request.
    fn last_user_text(request: &ChatRequest) -> String {
        match request.messages.last().map(|message| &message.content) {
            Some(ChatContent::Text(text)) => text.clone(),
            Some(ChatContent::Parts(parts)) => parts
                .iter()
                .find_map(|part| match part {
                    ContentPart::Text { text } => Some(text.clone()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .unwrap_or_default(),
            None => String::new(),
        }
    }

    impl Harness {
        async fn send(&self, kind: EventKind) {
            self.session.inner.handle_event(event(CHAT, USER, kind)).await;
        }

        async fn start(&self) {
            self.send(EventKind::Start).await;
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_and_admits_chat() {
        let h = harness().await;

        h.start().await;
        h.start().await;

        assert!(h.session.is_admitted(CHAT).await);
        assert_eq!(count_rows(&h.store, "clients").await, 1);
        assert_eq!(count_rows(&h.store, "chats").await, 1);
        assert_eq!(count_rows(&h.store, "messages").await, 0);

        let sent = h.transport.sent_texts();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            "👋 Hello Ada! I'm your AI assistant.\n\nCurrent assistant: General Assistant"
        );
    }

    #[tokio::test]
    async fn start_without_assistant_omits_category() {
        let h = harness().await;
        sqlx::query("UPDATE ai_assistants SET is_active = 0")
            .execute(h.store.pool())
            .await
            .unwrap();

        h.start().await;
        assert_eq!(h.transport.sent_texts(), vec!["👋 Hello Ada! I'm your AI assistant."]);
    }

    #[tokio::test]
    async fn text_from_unadmitted_chat_only_prompts() {
        let h = harness().await;

        h.send(EventKind::Text("hello?".into())).await;

        assert_eq!(h.transport.sent_texts(), vec![START_PROMPT]);
        assert_eq!(count_rows(&h.store, "clients").await, 0);
        assert_eq!(count_rows(&h.store, "chats").await, 0);
        assert_eq!(count_rows(&h.store, "messages").await, 0);
        assert!(h.completion.requests().is_empty());
    }

    #[tokio::test]
    async fn text_turn_persists_both_sides_and_sends_reply() {
        let h = harness().await;
        h.start().await;

        h.send(EventKind::Text("hello".into())).await;

        assert_eq!(
            h.transport.sent_texts().last().map(String::as_str),
            Some("Hi! How can I help?")
        );
        assert_eq!(count_rows(&h.store, "messages").await, 2);

        let outgoing: (String, bool, Option<i64>) = sqlx::query_as(
            "SELECT text, outgoing, ai_assistant_id FROM messages WHERE outgoing = 1",
        )
        .fetch_one(h.store.pool())
        .await
        .unwrap();
        assert_eq!(outgoing.0, "Hi! How can I help?");
        assert_eq!(outgoing.2, Some(h.tenant.assistant.id));

        // First turn: instructions plus the current message, no duplicated history.
        let request = &h.completion.requests()[0];
        let roles: Vec<Role> = request.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User]);
    }

    #[tokio::test]
    async fn later_turns_carry_prior_history() {
        let h = harness().await;
        h.start().await;

        h.send(EventKind::Text("first".into())).await;
        h.send(EventKind::Text("second".into())).await;

        let requests = h.completion.requests();
        let roles: Vec<Role> = requests[1].messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
    }

    #[tokio::test]
    async fn completion_failures_send_apology_and_persist_only_inbound() {
        let cases = [
            (
                CompletionError::AuthFailure("401".into()),
                "⚠️ Bot configuration error. Please contact support.",
            ),
            (
                CompletionError::RateLimited("429".into()),
                "⏳ I'm getting too many requests. Please try again later.",
            ),
            (
                CompletionError::ConnectionFailure("refused".into()),
                "🔌 Connection error. Please try again.",
            ),
            (
                CompletionError::Other("boom".into()),
                "⚠️ I encountered an error processing your request. Please try again.",
            ),
        ];

        for (error, apology) in cases {
            let h = harness_with(
                FakeCompletion::failing(error),
                FakeTranscriber::returning("x"),
            )
            .await;
            h.start().await;

            h.send(EventKind::Text("hello".into())).await;

            assert_eq!(
                h.transport.sent_texts().last().map(String::as_str),
                Some(apology)
            );
            assert_eq!(count_rows(&h.store, "messages").await, 1);
            let outgoing: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE outgoing = 1")
                    .fetch_one(h.store.pool())
                    .await
                    .unwrap();
            assert_eq!(outgoing, 0);
        }
    }

    #[tokio::test]
    async fn missing_assistant_is_reported_after_persisting_inbound() {
        let h = harness().await;
        h.start().await;
        sqlx::query("UPDATE ai_assistants SET is_active = 0")
            .execute(h.store.pool())
            .await
            .unwrap();

        h.send(EventKind::Text("hello".into())).await;

        assert_eq!(
            h.transport.sent_texts().last().map(String::as_str),
            Some(NO_ASSISTANT)
        );
        assert_eq!(count_rows(&h.store, "messages").await, 1);
        assert!(h.completion.requests().is_empty());
    }

    #[tokio::test]
    async fn photo_for_text_only_model_never_reaches_completion() {
        let h = harness().await;
        h.store
            .create_assistant(NewAssistant {
                model: "gpt-3.5-turbo".into(),
                category: AssistantCategory::Writing,
                ..NewAssistant::new(h.tenant.dashboard.id, "asst_text_only")
            })
            .await
            .unwrap();
        h.transport.add_file("photo-1", vec![1, 2, 3]);
        h.start().await;

        h.send(EventKind::Photo {
            variants: vec![PhotoVariant {
                file_id: "photo-1".into(),
                width: 100,
                height: 100,
                file_size: Some(3),
            }],
            caption: None,
        })
        .await;

        assert_eq!(
            h.transport.sent_texts().last().map(String::as_str),
            Some(IMAGE_REJECTED)
        );
        assert!(h.completion.requests().is_empty());
        assert_eq!(count_rows(&h.store, "messages").await, 0);
    }

    #[tokio::test]
    async fn photo_for_vision_model_is_answered() {
        let h = harness().await;
        h.transport.add_file("photo-1", vec![1, 2, 3]);
        h.start().await;

        h.send(EventKind::Photo {
            variants: vec![PhotoVariant {
                file_id: "photo-1".into(),
                width: 100,
                height: 100,
                file_size: Some(3),
            }],
            caption: Some("what's this?".into()),
        })
        .await;

        assert_eq!(h.completion.requests().len(), 1);
        let media: (String, Option<String>, Option<String>) = sqlx::query_as(
            "SELECT text, media_type, media_url FROM messages WHERE outgoing = 0",
        )
        .fetch_one(h.store.pool())
        .await
        .unwrap();
        assert_eq!(media.0, "what's this?");
        assert_eq!(media.1.as_deref(), Some("photo"));
        assert_eq!(media.2.as_deref(), Some("fake-file:photo-1"));
    }

    #[tokio::test]
    async fn audio_reply_edits_processing_notice() {
        let h = harness().await;
        h.transport.add_file("voice-1", vec![0; 32]);
        h.start().await;

        h.send(EventKind::Audio {
            file_id: "voice-1".into(),
            mime_type: Some("audio/ogg".into()),
            voice: true,
        })
        .await;

        assert_eq!(
            h.transport.sent_texts().last().map(String::as_str),
            Some(AUDIO_PROCESSING)
        );
        let edits = h.transport.edits();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].1, "Hi! How can I help?");

        let inbound: String =
            sqlx::query_scalar("SELECT text FROM messages WHERE outgoing = 0")
                .fetch_one(h.store.pool())
                .await
                .unwrap();
        assert_eq!(inbound, "what's the weather");
    }

    #[tokio::test]
    async fn silent_audio_gets_distinct_reply() {
        let h = harness_with(
            FakeCompletion::replying("unused"),
            FakeTranscriber::returning(""),
        )
        .await;
        h.transport.add_file("voice-1", vec![0; 32]);
        h.start().await;

        h.send(EventKind::Audio {
            file_id: "voice-1".into(),
            mime_type: None,
            voice: true,
        })
        .await;

        assert_eq!(h.transport.edits()[0].1, NO_SPEECH);
        assert!(h.completion.requests().is_empty());
    }

    #[tokio::test]
    async fn failed_transcription_edits_notice() {
        let h = harness_with(
            FakeCompletion::replying("unused"),
            FakeTranscriber::failing("whisper down"),
        )
        .await;
        h.transport.add_file("voice-1", vec![0; 32]);
        h.start().await;

        h.send(EventKind::Audio {
            file_id: "voice-1".into(),
            mime_type: None,
            voice: true,
        })
        .await;

        assert_eq!(h.transport.edits()[0].1, TRANSCRIPTION_FAILED);
        assert_eq!(count_rows(&h.store, "messages").await, 0);
    }

    #[tokio::test]
    async fn other_media_is_declined() {
        let h = harness().await;
        h.send(EventKind::Other).await;
        assert_eq!(h.transport.sent_texts(), vec![UNSUPPORTED_MEDIA]);
    }

    #[tokio::test]
    async fn shutdown_before_initialize_is_safe() {
        let mut h = harness().await;
        h.session.shutdown().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Stopped);
        assert!(!h.session.is_running());
        h.session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn failed_identity_check_fails_initialize() {
        let mut h = harness().await;
        h.transport.fail_health_check();

        assert!(h.session.initialize().await.is_err());
        assert!(!h.session.is_running());
    }

    #[tokio::test]
    async fn running_session_handles_stream_events_and_drains_on_shutdown() {
        let mut h = harness().await;
        h.session.initialize().await.unwrap();
        assert!(h.session.is_running());

        h.transport.push(event(CHAT, USER, EventKind::Start)).await;
        h.transport
            .push(event(CHAT, USER, EventKind::Text("hello".into())))
            .await;
        wait_for_sent(&h.transport, 2).await;

        h.session.shutdown().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Stopped);
        assert_eq!(h.transport.shutdown_calls(), 1);
        assert_eq!(
            h.transport.sent_texts().last().map(String::as_str),
            Some("Hi! How can I help?")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn chat_events_are_handled_in_arrival_order() {
        let mut h = harness().await;
        h.session.initialize().await.unwrap();

        h.transport.push(event(CHAT, USER, EventKind::Start)).await;
        for text in ["first", "second", "third"] {
            h.transport
                .push(event(CHAT, USER, EventKind::Text(text.into())))
                .await;
        }
        wait_for_sent(&h.transport, 4).await;

        // Nothing overtook the /start, so no chat was prompted to start.
        let sent = h.transport.sent_texts();
        assert!(!sent.iter().any(|text| text == START_PROMPT), "{sent:?}");
        let asked: Vec<String> = h.completion.requests().iter().map(last_user_text).collect();
        assert_eq!(asked, vec!["first", "second", "third"]);

        h.session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_abandons_handlers_stuck_past_the_grace_period() {
        let mut h = harness_configured(
            FakeCompletion::hanging(),
            FakeTranscriber::returning("x"),
            |deps| deps.shutdown_grace = Duration::from_millis(100),
        )
        .await;
        h.session.initialize().await.unwrap();

        h.transport.push(event(CHAT, USER, EventKind::Start)).await;
        h.transport
            .push(event(CHAT, USER, EventKind::Text("hello".into())))
            .await;
        for _ in 0..400 {
            if !h.completion.requests().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.completion.requests().len(), 1);

        tokio::time::timeout(Duration::from_secs(5), h.session.shutdown())
            .await
            .expect("shutdown should not wait on a stuck handler")
            .unwrap();
        assert_eq!(h.session.state(), SessionState::Stopped);
        assert_eq!(h.transport.shutdown_calls(), 1);
    }

    #[tokio::test]
    async fn unbounded_history_limit_is_accepted() {
        let h = harness_configured(
            FakeCompletion::replying("ok"),
            FakeTranscriber::returning("x"),
            |deps| deps.config.history_limit = i64::MAX,
        )
        .await;
        h.start().await;

        h.send(EventKind::Text("first".into())).await;
        h.send(EventKind::Text("second".into())).await;

        let requests = h.completion.requests();
        assert_eq!(requests.len(), 2);
        let roles: Vec<Role> = requests[1].messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
    }

    #[tokio::test]
    async fn ended_stream_marks_session_not_running() {
        let mut h = harness().await;
        h.session.initialize().await.unwrap();

        h.transport.close_stream();
        for _ in 0..200 {
            if !h.session.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!h.session.is_running());
        h.session.shutdown().await.unwrap();
    }
}
