//! Dashbot: per-tenant messaging bots backed by a chat-completion API.

pub mod config;
pub mod daemon;
pub mod error;
pub mod llm;
pub mod media;
pub mod messaging;
pub mod session;
pub mod store;
pub mod stt;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

use chrono::{DateTime, Utc};
use store::PlatformUser;

/// Platform-side chat identifier (a Telegram chat id).
pub type PlatformChatId = i64;

/// An event delivered by a messaging transport.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub chat_id: PlatformChatId,
    pub user: PlatformUser,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

/// Payload of an inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// The `/start` command.
    Start,
    Text(String),
    Photo {
        /// Every resolution the platform offers for the same picture.
        variants: Vec<PhotoVariant>,
        caption: Option<String>,
    },
    Audio {
        file_id: String,
        mime_type: Option<String>,
        /// Recorded in-app voice note rather than an uploaded audio file.
        voice: bool,
    },
    /// Stickers, documents, locations and anything else.
    Other,
}

impl EventKind {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Text(_) => "text",
            EventKind::Photo { .. } => "photo",
            EventKind::Audio { voice: true, .. } => "voice",
            EventKind::Audio { voice: false, .. } => "audio",
            EventKind::Other => "other",
        }
    }
}

/// One size of an inbound photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoVariant {
    pub file_id: String,
    pub width: u32,
    pub height: u32,
    pub file_size: Option<u32>,
}

impl PhotoVariant {
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Handle of a message the bot sent, used to edit it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHandle {
    pub chat_id: PlatformChatId,
    pub message_id: i32,
}
