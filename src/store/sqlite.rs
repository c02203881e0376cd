//! SQLite-backed conversation store.

use crate::error::{Result, StoreError};
use crate::store::ConversationStore;
use crate::store::types::*;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row as _, SqlitePool};
use std::str::FromStr as _;

const NOW: &str = "strftime('%Y-%m-%d %H:%M:%f', 'now')";

const MESSENGER_COLUMNS: &str = "m.id, m.dashboard_id, d.name AS dashboard_name, m.kind, m.token, m.is_active, m.id_instance";

const ASSISTANT_COLUMNS: &str = "id, dashboard_id, assistant_id, assistant_type, is_active, config, instructions, model, created_at, last_used";

const CLIENT_COLUMNS: &str =
    "id, dashboard_id, telegram_user_id, whatsapp_chat_id, name, username, is_bot";

const CHAT_COLUMNS: &str =
    "id, messenger_id, client_id, dashboard_id, assistant_id, kind, is_active, created_at, updated_at";

/// Conversation store over a sqlx SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Maximum number of lookup/insert rounds when concurrent first-contact
    /// events race on the same UNIQUE constraint.
    const MAX_CREATE_RETRIES: usize = 3;

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the database at `database_url` and apply pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StoreError::Query)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to `:memory:` is its own database, so pin the pool
        // to one long-lived connection.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|error| StoreError::Migration(error.to_string()))?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn create_dashboard(&self, name: &str, owner_id: Option<i64>) -> Result<Dashboard> {
        let id: i64 =
            sqlx::query_scalar("INSERT INTO dashboards (name, owner_id) VALUES (?, ?) RETURNING id")
                .bind(name)
                .bind(owner_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(Dashboard {
            id,
            name: name.to_string(),
            is_active: true,
            owner_id,
        })
    }

    /// Register a platform credential. A WhatsApp credential needs its
    /// instance id, and each dashboard gets at most one credential per kind.
    pub async fn create_messenger(&self, input: NewMessenger) -> Result<Messenger> {
        if input.kind == MessengerKind::WhatsApp
            && input.id_instance.as_deref().is_none_or(str::is_empty)
        {
            return Err(StoreError::Validation(
                "id_instance cannot be empty when messenger type is whatsapp".into(),
            )
            .into());
        }

        let inserted = sqlx::query_scalar::<_, i64>(
            "INSERT INTO messengers (dashboard_id, kind, token, is_active, id_instance) \
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(input.dashboard_id)
        .bind(input.kind.as_str())
        .bind(&input.token)
        .bind(input.is_active)
        .bind(&input.id_instance)
        .fetch_one(&self.pool)
        .await;

        let id = match inserted {
            Ok(id) => id,
            Err(error) if is_unique_violation(&error) => {
                return Err(StoreError::Validation(format!(
                    "a {} messenger already exists for this dashboard or token",
                    input.kind
                ))
                .into());
            }
            Err(error) => return Err(error.into()),
        };

        self.messenger(id)
            .await?
            .ok_or_else(|| not_found("messenger", id))
    }

    pub async fn messenger(&self, id: MessengerId) -> Result<Option<Messenger>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSENGER_COLUMNS} FROM messengers m \
             JOIN dashboards d ON d.id = m.dashboard_id WHERE m.id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(messenger_from_row).transpose()
    }

    pub async fn set_messenger_active(&self, id: MessengerId, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE messengers SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(not_found("messenger", id));
        }
        Ok(())
    }

    pub async fn create_assistant(&self, input: NewAssistant) -> Result<AIAssistant> {
        let config_json = serde_json::to_string(&input.config)
            .map_err(|error| StoreError::Validation(format!("invalid assistant config: {error}")))?;

        let inserted = sqlx::query_scalar::<_, i64>(
            "INSERT INTO ai_assistants \
             (assistant_id, dashboard_id, assistant_type, is_active, config, instructions, model) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&input.assistant_id)
        .bind(input.dashboard_id)
        .bind(input.category.as_str())
        .bind(input.is_active)
        .bind(&config_json)
        .bind(&input.instructions)
        .bind(&input.model)
        .fetch_one(&self.pool)
        .await;

        let id = match inserted {
            Ok(id) => id,
            Err(error) if is_unique_violation(&error) => {
                return Err(StoreError::Validation(format!(
                    "assistant id {} is already registered",
                    input.assistant_id
                ))
                .into());
            }
            Err(error) => return Err(error.into()),
        };

        self.assistant(id)
            .await?
            .ok_or_else(|| not_found("assistant", id))
    }

    pub async fn assistant(&self, id: AssistantId) -> Result<Option<AIAssistant>> {
        let row = sqlx::query(&format!(
            "SELECT {ASSISTANT_COLUMNS} FROM ai_assistants WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(assistant_from_row).transpose()
    }

    async fn find_client(
        &self,
        dashboard_id: DashboardId,
        platform_id: &PlatformUserId,
    ) -> Result<Option<Client>> {
        let row = match platform_id {
            PlatformUserId::Telegram(user_id) => {
                sqlx::query(&format!(
                    "SELECT {CLIENT_COLUMNS} FROM clients \
                     WHERE dashboard_id = ? AND telegram_user_id = ?"
                ))
                .bind(dashboard_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
            }
            PlatformUserId::WhatsApp(chat_id) => {
                sqlx::query(&format!(
                    "SELECT {CLIENT_COLUMNS} FROM clients \
                     WHERE dashboard_id = ? AND whatsapp_chat_id = ?"
                ))
                .bind(dashboard_id)
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.map(client_from_row).transpose()
    }

    async fn find_chat(
        &self,
        messenger_id: MessengerId,
        client_id: ClientId,
    ) -> Result<Option<Chat>> {
        let row = sqlx::query(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE messenger_id = ? AND client_id = ?"
        ))
        .bind(messenger_id)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(chat_from_row).transpose()
    }

    /// A client owns at most one chat, even if it was opened through another
    /// (possibly since removed) messenger.
    async fn find_chat_by_client(&self, client_id: ClientId) -> Result<Option<Chat>> {
        let row = sqlx::query(&format!("SELECT {CHAT_COLUMNS} FROM chats WHERE client_id = ?"))
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(chat_from_row).transpose()
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn active_messengers(&self, kind: MessengerKind) -> Result<Vec<Messenger>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSENGER_COLUMNS} FROM messengers m \
             JOIN dashboards d ON d.id = m.dashboard_id \
             WHERE m.kind = ? AND m.is_active = 1 \
             ORDER BY m.id"
        ))
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(messenger_from_row).collect()
    }

    async fn get_or_create_client(
        &self,
        dashboard_id: DashboardId,
        user: &PlatformUser,
    ) -> Result<Client> {
        let (telegram_user_id, whatsapp_chat_id) = match &user.id {
            PlatformUserId::Telegram(id) => (Some(*id), None),
            PlatformUserId::WhatsApp(id) => (None, Some(id.clone())),
        };
        let name = user.display_name();

        for attempt in 0..Self::MAX_CREATE_RETRIES {
            if let Some(client) = self.find_client(dashboard_id, &user.id).await? {
                tracing::debug!(client_id = client.id, "found existing client");
                return Ok(client);
            }

            let inserted = sqlx::query_scalar::<_, i64>(
                "INSERT INTO clients \
                 (dashboard_id, messenger_type, telegram_user_id, whatsapp_chat_id, name, username, is_bot) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(dashboard_id)
            .bind(user.kind().as_str())
            .bind(telegram_user_id)
            .bind(&whatsapp_chat_id)
            .bind(&name)
            .bind(&user.username)
            .bind(user.is_bot)
            .fetch_one(&self.pool)
            .await;

            match inserted {
                Ok(id) => {
                    tracing::info!(client_id = id, dashboard_id, "created new client");
                    return Ok(Client {
                        id,
                        dashboard_id,
                        platform_id: user.id.clone(),
                        name: Some(name),
                        username: user.username.clone(),
                        is_bot: user.is_bot,
                    });
                }
                Err(error) if is_unique_violation(&error) => {
                    // Another event from the same user won the insert; the
                    // next lookup returns its row.
                    tracing::debug!(attempt, dashboard_id, "client create raced, retrying lookup");
                    continue;
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(StoreError::Conflict {
            entity: "client",
            attempts: Self::MAX_CREATE_RETRIES,
        }
        .into())
    }

    async fn get_or_create_chat(&self, messenger: &Messenger, client: &Client) -> Result<Chat> {
        for attempt in 0..Self::MAX_CREATE_RETRIES {
            if let Some(chat) = self.find_chat(messenger.id, client.id).await? {
                tracing::debug!(chat_id = chat.id, "found existing chat");
                return Ok(chat);
            }

            let inserted = sqlx::query(&format!(
                "INSERT INTO chats (messenger_id, kind, client_id, dashboard_id, is_active) \
                 VALUES (?, ?, ?, ?, 1) RETURNING {CHAT_COLUMNS}"
            ))
            .bind(messenger.id)
            .bind(messenger.kind.as_str())
            .bind(client.id)
            .bind(messenger.dashboard_id)
            .fetch_one(&self.pool)
            .await;

            match inserted {
                Ok(row) => {
                    let chat = chat_from_row(row)?;
                    tracing::info!(chat_id = chat.id, client_id = client.id, "created new chat");
                    return Ok(chat);
                }
                Err(error) if is_unique_violation(&error) => {
                    if let Some(chat) = self.find_chat_by_client(client.id).await? {
                        return Ok(chat);
                    }
                    tracing::debug!(attempt, client_id = client.id, "chat create raced, retrying lookup");
                    continue;
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(StoreError::Conflict {
            entity: "chat",
            attempts: Self::MAX_CREATE_RETRIES,
        }
        .into())
    }

    async fn default_assistant(&self, dashboard_id: DashboardId) -> Result<Option<AIAssistant>> {
        let row = sqlx::query(&format!(
            "SELECT {ASSISTANT_COLUMNS} FROM ai_assistants \
             WHERE dashboard_id = ? AND is_active = 1 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(dashboard_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(assistant_from_row).transpose()
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message> {
        let sender_info = message.sender_info.to_string();
        let (media_url, media_type) = match &message.media {
            Some(media) => (Some(media.url.as_str()), Some(media.kind.as_str())),
            None => (None, None),
        };

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "INSERT INTO messages \
             (chat_id, text, sender_info, client_id, ai_assistant_id, is_opened, outgoing, media_url, media_type) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id, created_at",
        )
        .bind(message.chat_id)
        .bind(&message.text)
        .bind(&sender_info)
        .bind(message.client_id)
        .bind(message.assistant_id)
        .bind(message.is_opened)
        .bind(message.outgoing)
        .bind(media_url)
        .bind(media_type)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(&format!("UPDATE chats SET updated_at = {NOW} WHERE id = ?"))
            .bind(message.chat_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Message {
            id: row.try_get("id")?,
            chat_id: Some(message.chat_id),
            text: message.text,
            sender_info: Some(message.sender_info),
            client_id: message.client_id,
            assistant_id: message.assistant_id,
            outgoing: message.outgoing,
            is_opened: message.is_opened,
            media: message.media,
            created_at: row.try_get::<chrono::NaiveDateTime, _>("created_at")?.and_utc(),
        })
    }

    async fn recent_history(&self, chat_id: ChatId, limit: i64) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, text, outgoing, created_at FROM messages \
             WHERE chat_id = ? \
             ORDER BY created_at DESC, id DESC \
             LIMIT ?",
        )
        .bind(chat_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        let mut history = rows
            .into_iter()
            .map(|row| {
                let outgoing: bool = row.try_get("outgoing")?;
                Ok(HistoryEntry {
                    message_id: row.try_get("id")?,
                    role: if outgoing { Role::Assistant } else { Role::User },
                    content: row.try_get("text")?,
                    timestamp: row.try_get::<chrono::NaiveDateTime, _>("created_at")?.and_utc(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // Reverse to chronological order
        history.reverse();
        Ok(history)
    }

    async fn touch_assistant(&self, assistant_id: AssistantId) -> Result<()> {
        sqlx::query(&format!("UPDATE ai_assistants SET last_used = {NOW} WHERE id = ?"))
            .bind(assistant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_error) if db_error.is_unique_violation())
}

fn not_found(entity: &'static str, id: i64) -> crate::Error {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
    .into()
}

fn messenger_from_row(row: SqliteRow) -> Result<Messenger> {
    let kind: String = row.try_get("kind")?;
    Ok(Messenger {
        id: row.try_get("id")?,
        dashboard_id: row.try_get("dashboard_id")?,
        dashboard_name: row.try_get("dashboard_name")?,
        kind: parse_kind(&kind)?,
        token: row.try_get("token")?,
        is_active: row.try_get("is_active")?,
        id_instance: row.try_get("id_instance")?,
    })
}

fn assistant_from_row(row: SqliteRow) -> Result<AIAssistant> {
    let category: String = row.try_get("assistant_type")?;
    let config: String = row.try_get("config")?;
    Ok(AIAssistant {
        id: row.try_get("id")?,
        dashboard_id: row.try_get("dashboard_id")?,
        assistant_id: row.try_get("assistant_id")?,
        category: AssistantCategory::parse(&category).ok_or(StoreError::Corrupt {
            column: "assistant_type",
            value: category.clone(),
        })?,
        is_active: row.try_get("is_active")?,
        // A malformed config falls back to defaults rather than disabling the assistant.
        config: serde_json::from_str(&config).unwrap_or_else(|error| {
            tracing::warn!(%error, "unparseable assistant config, using defaults");
            AssistantConfig::default()
        }),
        instructions: row.try_get("instructions")?,
        model: row.try_get("model")?,
        created_at: row.try_get::<chrono::NaiveDateTime, _>("created_at")?.and_utc(),
        last_used: row
            .try_get::<Option<chrono::NaiveDateTime>, _>("last_used")?
            .map(|value| value.and_utc()),
    })
}

fn client_from_row(row: SqliteRow) -> Result<Client> {
    let telegram_user_id: Option<i64> = row.try_get("telegram_user_id")?;
    let whatsapp_chat_id: Option<String> = row.try_get("whatsapp_chat_id")?;
    let platform_id = match (telegram_user_id, whatsapp_chat_id) {
        (Some(id), _) => PlatformUserId::Telegram(id),
        (None, Some(id)) => PlatformUserId::WhatsApp(id),
        (None, None) => {
            return Err(StoreError::Corrupt {
                column: "telegram_user_id",
                value: "NULL".into(),
            }
            .into());
        }
    };

    Ok(Client {
        id: row.try_get("id")?,
        dashboard_id: row.try_get("dashboard_id")?,
        platform_id,
        name: row.try_get("name")?,
        username: row.try_get("username")?,
        is_bot: row.try_get("is_bot")?,
    })
}

fn chat_from_row(row: SqliteRow) -> Result<Chat> {
    let kind: String = row.try_get("kind")?;
    Ok(Chat {
        id: row.try_get("id")?,
        messenger_id: row.try_get("messenger_id")?,
        client_id: row.try_get("client_id")?,
        dashboard_id: row.try_get("dashboard_id")?,
        assistant_id: row.try_get("assistant_id")?,
        kind: parse_kind(&kind)?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get::<chrono::NaiveDateTime, _>("created_at")?.and_utc(),
        updated_at: row.try_get::<chrono::NaiveDateTime, _>("updated_at")?.and_utc(),
    })
}

fn parse_kind(value: &str) -> Result<MessengerKind> {
    MessengerKind::parse(value).ok_or_else(|| {
        StoreError::Corrupt {
            column: "kind",
            value: value.to_string(),
        }
        .into()
    })
}
