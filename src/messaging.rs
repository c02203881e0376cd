//! Messaging transports.

pub mod telegram;
pub mod traits;

pub use telegram::TelegramAdapter;
pub use traits::{InboundStream, Messaging, MessagingDyn, RemoteFile};
