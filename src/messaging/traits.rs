//! Messaging trait and dynamic dispatch companion.

use crate::error::Result;
use crate::{InboundEvent, MessageHandle, PlatformChatId};

use futures::Stream;
use std::pin::Pin;

/// Inbound event stream type.
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// A platform file resolved from its id, fetchable without exposing credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub file_id: String,
    /// Platform-side path, relative to the platform's file endpoint.
    pub path: String,
    pub size: u32,
}

/// Static trait for messaging transports.
/// Use this for type-safe implementations.
pub trait Messaging: Send + Sync + 'static {
    /// Unique name for this transport.
    fn name(&self) -> &str;

    /// Verify credentials with the platform. Returns the bot's handle.
    fn health_check(&self) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Start receiving and return the inbound event stream. The stream ends
    /// when the transport stops.
    fn start(&self) -> impl std::future::Future<Output = Result<InboundStream>> + Send;

    /// Send a plain-text message.
    fn send_text(
        &self,
        chat_id: PlatformChatId,
        text: &str,
    ) -> impl std::future::Future<Output = Result<MessageHandle>> + Send;

    /// Replace the text of a message sent earlier.
    fn edit_text(
        &self,
        handle: MessageHandle,
        text: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Resolve a file id to a downloadable file.
    fn resolve_file(
        &self,
        file_id: &str,
    ) -> impl std::future::Future<Output = Result<RemoteFile>> + Send;

    /// Download a resolved file.
    fn fetch_file(
        &self,
        file: &RemoteFile,
    ) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;

    /// Stop receiving. Safe to call when `start` never ran.
    fn shutdown(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn MessagingDyn>` for storing different transports.
pub trait MessagingDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn health_check<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>>;

    fn start<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<InboundStream>> + Send + 'a>>;

    fn send_text<'a>(
        &'a self,
        chat_id: PlatformChatId,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<MessageHandle>> + Send + 'a>>;

    fn edit_text<'a>(
        &'a self,
        handle: MessageHandle,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn resolve_file<'a>(
        &'a self,
        file_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<RemoteFile>> + Send + 'a>>;

    fn fetch_file<'a>(
        &'a self,
        file: &'a RemoteFile,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<u8>>> + Send + 'a>>;

    fn shutdown<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
}

/// Blanket implementation: any type implementing Messaging automatically implements MessagingDyn.
impl<T: Messaging> MessagingDyn for T {
    fn name(&self) -> &str {
        Messaging::name(self)
    }

    fn health_check<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(Messaging::health_check(self))
    }

    fn start<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<InboundStream>> + Send + 'a>> {
        Box::pin(Messaging::start(self))
    }

    fn send_text<'a>(
        &'a self,
        chat_id: PlatformChatId,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<MessageHandle>> + Send + 'a>> {
        Box::pin(Messaging::send_text(self, chat_id, text))
    }

    fn edit_text<'a>(
        &'a self,
        handle: MessageHandle,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Messaging::edit_text(self, handle, text))
    }

    fn resolve_file<'a>(
        &'a self,
        file_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<RemoteFile>> + Send + 'a>> {
        Box::pin(Messaging::resolve_file(self, file_id))
    }

    fn fetch_file<'a>(
        &'a self,
        file: &'a RemoteFile,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<u8>>> + Send + 'a>> {
        Box::pin(Messaging::fetch_file(self, file))
    }

    fn shutdown<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Messaging::shutdown(self))
    }
}
