//! Conversation store: tenants, credentials, assistants, clients, chats and
//! messages.
//!
//! The bot pipeline only sees the [`ConversationStore`] trait. Lookups return
//! `Option` instead of erroring on "not found", and every get-or-create
//! converges on a single row when concurrent first-contact events race.

pub mod sqlite;
pub mod types;

pub use sqlite::SqliteStore;
pub use types::*;

use crate::error::Result;

use async_trait::async_trait;

/// Store operations consumed by the supervisor and bot sessions.
#[async_trait]
pub trait ConversationStore: Send + Sync + 'static {
    /// Active credentials of one platform kind, joined with their dashboard.
    async fn active_messengers(&self, kind: MessengerKind) -> Result<Vec<Messenger>>;

    /// Look up the dashboard's client for `user`, creating it on first contact.
    async fn get_or_create_client(
        &self,
        dashboard_id: DashboardId,
        user: &PlatformUser,
    ) -> Result<Client>;

    /// Look up the chat between `messenger` and `client`, creating it if absent.
    async fn get_or_create_chat(&self, messenger: &Messenger, client: &Client) -> Result<Chat>;

    /// Most recently created active assistant of the dashboard.
    async fn default_assistant(&self, dashboard_id: DashboardId) -> Result<Option<AIAssistant>>;

    /// Persist a message and bump its chat's `updated_at`.
    async fn append_message(&self, message: NewMessage) -> Result<Message>;

    /// Last `limit` turns of a chat, oldest first.
    async fn recent_history(&self, chat_id: ChatId, limit: i64) -> Result<Vec<HistoryEntry>>;

    /// Record that an assistant was just used for a completion.
    async fn touch_assistant(&self, assistant_id: AssistantId) -> Result<()>;
}
