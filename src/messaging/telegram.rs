//! Telegram transport using teloxide long polling.

use crate::error::PlatformError;
use crate::messaging::traits::{InboundStream, Messaging, RemoteFile};
use crate::store::{PlatformUser, PlatformUserId};
use crate::{EventKind, InboundEvent, MessageHandle, PhotoVariant, PlatformChatId};

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::ShutdownToken;
use teloxide::error_handlers::ErrorHandler;
use teloxide::net::Download as _;
use teloxide::prelude::*;
use teloxide::stop::StopToken;
use teloxide::types::{FileId, MessageId};
use teloxide::update_listeners::{Polling, UpdateListener as _};
use teloxide::{ApiError, RequestError};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

const PLATFORM: &str = "telegram";

/// Long-poll timeout passed to `getUpdates`.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `shutdown` waits for the in-flight `getUpdates` to return.
const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Telegram adapter state. One instance per bot token.
pub struct TelegramAdapter {
    bot: Bot,
    token_prefix: String,
    polling: Mutex<Option<PollingTask>>,
}

/// The spawned dispatcher and the tokens that stop it.
struct PollingTask {
    shutdown: ShutdownToken,
    stop_listener: StopToken,
    task: JoinHandle<()>,
}

impl TelegramAdapter {
    pub fn new(token: &str) -> Self {
        Self {
            bot: Bot::new(token),
            token_prefix: token.chars().take(5).collect(),
            polling: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_api_url(mut self, url: reqwest::Url) -> Self {
        self.bot = self.bot.set_api_url(url);
        self
    }
}

/// Receives `getUpdates` failures. A rejected token stops the listener, which
/// ends dispatching and with it the inbound stream; anything else is retried
/// by the listener's backoff.
struct PollingErrorHandler {
    stop_listener: StopToken,
    token_prefix: String,
}

impl ErrorHandler<RequestError> for PollingErrorHandler {
    fn handle_error(self: Arc<Self>, error: RequestError) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if is_token_rejected(&error) {
                tracing::error!(
                    token_prefix = %format_args!("{}...", self.token_prefix),
                    %error,
                    "telegram rejected the bot token, stopping polling"
                );
                self.stop_listener.stop();
            } else {
                tracing::warn!(
                    token_prefix = %format_args!("{}...", self.token_prefix),
                    %error,
                    "telegram polling error"
                );
            }
        })
    }
}

/// Telegram answers "Unauthorized" for revoked tokens and "Not Found" for
/// unknown ones; both parse as `InvalidToken`.
fn is_token_rejected(error: &RequestError) -> bool {
    matches!(error, RequestError::Api(ApiError::InvalidToken))
}

impl Messaging for TelegramAdapter {
    fn name(&self) -> &str {
        PLATFORM
    }

    async fn health_check(&self) -> crate::Result<String> {
        let me = self
            .bot
            .get_me()
            .await
            .map_err(|error| PlatformError::Connect {
                platform: PLATFORM,
                reason: error.to_string(),
            })?;

        let handle = me
            .username
            .as_deref()
            .map(|username| format!("@{username}"))
            .unwrap_or_else(|| me.first_name.clone());

        tracing::info!(bot = %handle, token_prefix = %format_args!("{}...", self.token_prefix), "telegram bot verified");
        Ok(handle)
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let handler = Update::filter_message().endpoint(move |message: Message| {
            let inbound_tx = inbound_tx.clone();
            async move {
                match to_inbound_event(&message) {
                    Some(event) => {
                        if inbound_tx.send(event).await.is_err() {
                            tracing::warn!(
                                chat_id = message.chat.id.0,
                                "failed to forward telegram update (receiver dropped)"
                            );
                        }
                    }
                    None => {
                        tracing::debug!(chat_id = message.chat.id.0, "ignoring update without sender");
                    }
                }
                respond(())
            }
        });

        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .default_handler(|_| async {})
            .build();

        // Webhook removal happens in the spawned task; `build` makes no requests.
        let mut listener = Polling::builder(self.bot.clone())
            .timeout(POLL_TIMEOUT)
            .build();
        let stop_listener = listener.stop_token();
        let shutdown = dispatcher.shutdown_token();
        let error_handler = Arc::new(PollingErrorHandler {
            stop_listener: stop_listener.clone(),
            token_prefix: self.token_prefix.clone(),
        });

        let bot = self.bot.clone();
        let token_prefix = self.token_prefix.clone();
        let task = tokio::spawn(async move {
            if let Err(error) = bot.delete_webhook().await {
                tracing::warn!(token_prefix = %format_args!("{token_prefix}..."), %error, "failed to delete telegram webhook");
            }
            if let Err(error) = dispatcher
                .try_dispatch_with_listener(listener, error_handler)
                .await
            {
                tracing::error!(token_prefix = %format_args!("{token_prefix}..."), %error, "telegram dispatcher failed to start");
            }
            tracing::info!(token_prefix = %format_args!("{token_prefix}..."), "telegram polling stopped");
        });

        let polling = PollingTask {
            shutdown,
            stop_listener,
            task,
        };
        if let Some(previous) = self.polling.lock().await.replace(polling) {
            previous.task.abort();
        }

        tracing::info!(token_prefix = %format_args!("{}...", self.token_prefix), "telegram polling started");

        Ok(Box::pin(ReceiverStream::new(inbound_rx)))
    }

    async fn send_text(&self, chat_id: PlatformChatId, text: &str) -> crate::Result<MessageHandle> {
        let sent = self
            .bot
            .send_message(ChatId(chat_id), text)
            .await
            .map_err(|error| PlatformError::Send {
                chat_id,
                reason: error.to_string(),
            })?;

        Ok(MessageHandle {
            chat_id,
            message_id: sent.id.0,
        })
    }

    async fn edit_text(&self, handle: MessageHandle, text: &str) -> crate::Result<()> {
        let result = self
            .bot
            .edit_message_text(ChatId(handle.chat_id), MessageId(handle.message_id), text)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if error.to_string().contains("message is not modified") => Ok(()),
            Err(error) => Err(PlatformError::Send {
                chat_id: handle.chat_id,
                reason: error.to_string(),
            }
            .into()),
        }
    }

    async fn resolve_file(&self, file_id: &str) -> crate::Result<RemoteFile> {
        let file = self
            .bot
            .get_file(FileId(file_id.to_string()))
            .await
            .map_err(|error| PlatformError::File {
                file_id: file_id.to_string(),
                reason: error.to_string(),
            })?;

        Ok(RemoteFile {
            file_id: file_id.to_string(),
            path: file.path.clone(),
            size: file.size,
        })
    }

    async fn fetch_file(&self, file: &RemoteFile) -> crate::Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(file.size as usize);
        self.bot
            .download_file(&file.path, &mut buffer)
            .await
            .map_err(|error| PlatformError::File {
                file_id: file.file_id.clone(),
                reason: error.to_string(),
            })?;

        tracing::debug!(file_id = %file.file_id, size = buffer.len(), "downloaded telegram file");
        Ok(buffer)
    }

    async fn shutdown(&self) -> crate::Result<()> {
        let Some(PollingTask {
            shutdown,
            stop_listener,
            mut task,
        }) = self.polling.lock().await.take()
        else {
            return Ok(());
        };

        // Idle means still deleting the webhook or fetching bot info, or
        // already stopped on its own. Neither token reaches it then.
        let outcome = if shutdown.shutdown().is_err() {
            task.abort();
            task.await
        } else {
            stop_listener.stop();
            match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => {
                    tracing::warn!(
                        token_prefix = %format_args!("{}...", self.token_prefix),
                        "telegram polling did not stop in time, aborting"
                    );
                    task.abort();
                    task.await
                }
            }
        };

        match outcome {
            Ok(()) => {}
            Err(error) if error.is_cancelled() => {}
            Err(error) => tracing::warn!(
                token_prefix = %format_args!("{}...", self.token_prefix),
                %error,
                "telegram polling task panicked"
            ),
        }

        tracing::info!(token_prefix = %format_args!("{}...", self.token_prefix), "telegram adapter shut down");
        Ok(())
    }
}

/// Map a Telegram message to an inbound event. Messages without a sender
/// (channel posts) are dropped.
fn to_inbound_event(message: &Message) -> Option<InboundEvent> {
    let from = message.from.as_ref()?;

    let user = PlatformUser {
        id: PlatformUserId::Telegram(from.id.0 as i64),
        first_name: from.first_name.clone(),
        last_name: from.last_name.clone(),
        username: from.username.clone(),
        is_bot: from.is_bot,
    };

    let kind = if let Some(text) = message.text() {
        if is_start_command(text) {
            EventKind::Start
        } else {
            EventKind::Text(text.to_string())
        }
    } else if let Some(photos) = message.photo() {
        EventKind::Photo {
            variants: photos
                .iter()
                .map(|photo| PhotoVariant {
                    file_id: photo.file.id.to_string(),
                    width: photo.width,
                    height: photo.height,
                    file_size: Some(photo.file.size),
                })
                .collect(),
            caption: message.caption().map(str::to_string),
        }
    } else if let Some(voice) = message.voice() {
        EventKind::Audio {
            file_id: voice.file.id.to_string(),
            mime_type: voice.mime_type.as_ref().map(ToString::to_string),
            voice: true,
        }
    } else if let Some(audio) = message.audio() {
        EventKind::Audio {
            file_id: audio.file.id.to_string(),
            mime_type: audio.mime_type.as_ref().map(ToString::to_string),
            voice: false,
        }
    } else {
        EventKind::Other
    };

    Some(InboundEvent {
        chat_id: message.chat.id.0,
        user,
        kind,
        timestamp: message.date,
    })
}

/// `/start`, `/start@botname` and `/start <payload>` all count.
fn is_start_command(text: &str) -> bool {
    let command = text.split_whitespace().next().unwrap_or_default();
    command == "/start" || command.starts_with("/start@")
}
