//! Persisted entities shared between the store and the bot pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type DashboardId = i64;
pub type MessengerId = i64;
pub type AssistantId = i64;
pub type ClientId = i64;
pub type ChatId = i64;
pub type MessageId = i64;

/// Messaging platform a credential, client or chat belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessengerKind {
    Telegram,
    WhatsApp,
    Instagram,
}

impl MessengerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessengerKind::Telegram => "telegram",
            MessengerKind::WhatsApp => "whatsapp",
            MessengerKind::Instagram => "instagram",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "telegram" => Some(MessengerKind::Telegram),
            "whatsapp" => Some(MessengerKind::WhatsApp),
            "instagram" => Some(MessengerKind::Instagram),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessengerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tenant root.
#[derive(Debug, Clone)]
pub struct Dashboard {
    pub id: DashboardId,
    pub name: String,
    pub is_active: bool,
    pub owner_id: Option<i64>,
}

/// One platform credential of a dashboard, joined with the dashboard name.
#[derive(Clone)]
pub struct Messenger {
    pub id: MessengerId,
    pub dashboard_id: DashboardId,
    pub dashboard_name: String,
    pub kind: MessengerKind,
    pub token: String,
    pub is_active: bool,
    pub id_instance: Option<String>,
}

impl Messenger {
    /// First characters of the token, safe to log.
    pub fn token_prefix(&self) -> &str {
        match self.token.char_indices().nth(5) {
            Some((index, _)) => &self.token[..index],
            None => &self.token,
        }
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("id", &self.id)
            .field("dashboard_id", &self.dashboard_id)
            .field("dashboard_name", &self.dashboard_name)
            .field("kind", &self.kind)
            .field("token", &format_args!("{}...", self.token_prefix()))
            .field("is_active", &self.is_active)
            .field("id_instance", &self.id_instance)
            .finish()
    }
}

/// Assistant persona category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssistantCategory {
    General,
    Coding,
    Writing,
    Analysis,
    Custom,
}

impl AssistantCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AssistantCategory::General => "general",
            AssistantCategory::Coding => "coding",
            AssistantCategory::Writing => "writing",
            AssistantCategory::Analysis => "analysis",
            AssistantCategory::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "general" => Some(AssistantCategory::General),
            "coding" => Some(AssistantCategory::Coding),
            "writing" => Some(AssistantCategory::Writing),
            "analysis" => Some(AssistantCategory::Analysis),
            "custom" => Some(AssistantCategory::Custom),
            _ => None,
        }
    }

    /// Human-readable label shown to end users.
    pub fn display_name(self) -> &'static str {
        match self {
            AssistantCategory::General => "General Assistant",
            AssistantCategory::Coding => "Coding Assistant",
            AssistantCategory::Writing => "Writing Assistant",
            AssistantCategory::Analysis => "Data Analysis",
            AssistantCategory::Custom => "Custom Assistant",
        }
    }
}

/// Free-form per-assistant overrides. Unknown keys are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A configured AI persona.
#[derive(Debug, Clone)]
pub struct AIAssistant {
    pub id: AssistantId,
    pub dashboard_id: DashboardId,
    /// Identifier of the assistant at the provider.
    pub assistant_id: String,
    pub category: AssistantCategory,
    pub is_active: bool,
    pub config: AssistantConfig,
    pub instructions: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

/// Platform-specific identity of an end user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PlatformUserId {
    Telegram(i64),
    WhatsApp(String),
}

/// Profile of the platform user who sent an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformUser {
    pub id: PlatformUserId,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub is_bot: bool,
}

impl PlatformUser {
    /// "First Last", or just the first name.
    pub fn display_name(&self) -> String {
        match &self.last_name {
            Some(last) if !last.is_empty() => format!("{} {}", self.first_name, last),
            _ => self.first_name.clone(),
        }
    }

    pub fn kind(&self) -> MessengerKind {
        match self.id {
            PlatformUserId::Telegram(_) => MessengerKind::Telegram,
            PlatformUserId::WhatsApp(_) => MessengerKind::WhatsApp,
        }
    }

    /// Sender metadata persisted alongside inbound messages.
    pub fn sender_info(&self) -> serde_json::Value {
        let id = match &self.id {
            PlatformUserId::Telegram(id) => serde_json::json!(id),
            PlatformUserId::WhatsApp(id) => serde_json::json!(id),
        };
        serde_json::json!({
            "first_name": self.first_name,
            "last_name": self.last_name,
            "username": self.username,
            "id": id,
        })
    }
}

/// An end user of a messaging platform, scoped to a dashboard.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub dashboard_id: DashboardId,
    pub platform_id: PlatformUserId,
    pub name: Option<String>,
    pub username: Option<String>,
    pub is_bot: bool,
}

/// One conversation thread, one-to-one with a client.
#[derive(Debug, Clone)]
pub struct Chat {
    pub id: ChatId,
    pub messenger_id: Option<MessengerId>,
    pub client_id: ClientId,
    pub dashboard_id: Option<DashboardId>,
    pub assistant_id: Option<AssistantId>,
    pub kind: MessengerKind,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Media attached to a persisted message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Audio,
    Voice,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Audio => "audio",
            MediaKind::Voice => "voice",
        }
    }
}

/// Token-free reference to a piece of inbound media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub url: String,
}

/// Fields of a message to append.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub text: String,
    pub sender_info: serde_json::Value,
    pub client_id: Option<ClientId>,
    pub assistant_id: Option<AssistantId>,
    pub outgoing: bool,
    pub is_opened: bool,
    pub media: Option<MediaRef>,
}

impl NewMessage {
    /// An inbound turn from a platform user.
    pub fn inbound(chat: &Chat, client: &Client, user: &PlatformUser, text: &str) -> Self {
        Self {
            chat_id: chat.id,
            text: text.to_string(),
            sender_info: user.sender_info(),
            client_id: Some(client.id),
            assistant_id: None,
            outgoing: false,
            is_opened: true,
            media: None,
        }
    }

    /// A reply produced by an assistant.
    pub fn outgoing(chat: &Chat, client: &Client, assistant: &AIAssistant, text: &str) -> Self {
        Self {
            chat_id: chat.id,
            text: text.to_string(),
            sender_info: serde_json::json!({
                "assistant_id": assistant.assistant_id,
                "assistant_type": assistant.category.as_str(),
                "model": assistant.model,
            }),
            client_id: Some(client.id),
            assistant_id: Some(assistant.id),
            outgoing: true,
            is_opened: true,
            media: None,
        }
    }

    pub fn with_media(mut self, media: Option<MediaRef>) -> Self {
        self.media = media;
        self
    }
}

/// A persisted turn.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: Option<ChatId>,
    pub text: String,
    pub sender_info: Option<serde_json::Value>,
    pub client_id: Option<ClientId>,
    pub assistant_id: Option<AssistantId>,
    pub outgoing: bool,
    pub is_opened: bool,
    pub media: Option<MediaRef>,
    pub created_at: DateTime<Utc>,
}

/// Speaker of a history entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of recent history, oldest first when returned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub message_id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Admin-side input for a new messenger credential.
#[derive(Debug, Clone)]
pub struct NewMessenger {
    pub dashboard_id: DashboardId,
    pub kind: MessengerKind,
    pub token: String,
    pub is_active: bool,
    pub id_instance: Option<String>,
}

/// Admin-side input for a new assistant.
#[derive(Debug, Clone)]
pub struct NewAssistant {
    pub dashboard_id: DashboardId,
    pub assistant_id: String,
    pub category: AssistantCategory,
    pub is_active: bool,
    pub config: AssistantConfig,
    pub instructions: String,
    pub model: String,
}

impl NewAssistant {
    /// Defaults matching a freshly created assistant in the admin UI.
    pub fn new(dashboard_id: DashboardId, assistant_id: impl Into<String>) -> Self {
        Self {
            dashboard_id,
            assistant_id: assistant_id.into(),
            category: AssistantCategory::General,
            is_active: true,
            config: AssistantConfig::default(),
            instructions: "You are our AI Assistant".into(),
            model: "gpt-4-turbo".into(),
        }
    }
}
