//! Media normalizer: turns photo and audio events into text plus an optional
//! image reference for the completion step.

use crate::PhotoVariant;
use crate::config::MediaConfig;
use crate::error::MediaError;
use crate::messaging::{MessagingDyn, RemoteFile};
use crate::store::{AIAssistant, MediaKind, MediaRef};
use crate::stt::{AudioTranscoder, Transcriber};

use base64::Engine as _;
use std::sync::Arc;

/// Prompt used when a photo arrives without a caption.
pub const DEFAULT_PHOTO_PROMPT: &str = "Describe this image";

/// Canonical content of an inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundContent {
    pub text: String,
    /// URI handed to the completion API. Never contains platform credentials.
    pub image_ref: Option<String>,
    /// Token-free reference persisted with the inbound message.
    pub media: Option<MediaRef>,
}

impl InboundContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image_ref: None,
            media: None,
        }
    }
}

/// Outcome of normalizing a photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Content(InboundContent),
    /// The assistant's model cannot read images.
    Rejected,
}

/// Shared across every session; holds no per-chat state.
pub struct MediaNormalizer {
    transcriber: Arc<dyn Transcriber>,
    transcoder: AudioTranscoder,
    config: MediaConfig,
}

impl MediaNormalizer {
    pub fn new(transcriber: Arc<dyn Transcriber>, config: MediaConfig) -> Self {
        Self {
            transcriber,
            transcoder: AudioTranscoder::new(config.ffmpeg_path.clone()),
            config,
        }
    }

    /// Case-insensitive substring match against the configured allow-list.
    pub fn supports_images(&self, model: &str) -> bool {
        let model = model.to_lowercase();
        self.config
            .image_capable_models
            .iter()
            .any(|fragment| !fragment.is_empty() && model.contains(&fragment.to_lowercase()))
    }

    /// Resolve the largest variant of a photo into an inline `data:` URI.
    ///
    /// Capability is checked before anything is downloaded.
    pub async fn photo(
        &self,
        transport: &dyn MessagingDyn,
        assistant: &AIAssistant,
        variants: &[PhotoVariant],
        caption: Option<&str>,
    ) -> Result<Normalized, MediaError> {
        if !self.supports_images(&assistant.model) {
            tracing::info!(model = %assistant.model, "model cannot read images, rejecting photo");
            return Ok(Normalized::Rejected);
        }

        let largest = largest_variant(variants).ok_or(MediaError::Unsupported("empty photo"))?;
        let bytes = self.download(transport, &largest.file_id).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);

        let text = caption
            .map(str::trim)
            .filter(|caption| !caption.is_empty())
            .unwrap_or(DEFAULT_PHOTO_PROMPT)
            .to_string();

        Ok(Normalized::Content(InboundContent {
            text,
            image_ref: Some(format!("data:image/jpeg;base64,{encoded}")),
            media: Some(MediaRef {
                kind: MediaKind::Photo,
                url: platform_file_ref(transport, &largest.file_id),
            }),
        }))
    }

    /// Download, transcode and transcribe an audio message.
    pub async fn audio(
        &self,
        transport: &dyn MessagingDyn,
        file_id: &str,
        mime_type: Option<&str>,
        voice: bool,
    ) -> Result<InboundContent, MediaError> {
        let bytes = self.download(transport, file_id).await?;
        let prepared = self.transcoder.prepare(bytes, mime_type).await;

        let transcript = self
            .transcriber
            .transcribe(prepared.bytes, prepared.filename)
            .await?;

        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Err(MediaError::NoSpeech);
        }

        Ok(InboundContent {
            text: transcript.to_string(),
            image_ref: None,
            media: Some(MediaRef {
                kind: if voice { MediaKind::Voice } else { MediaKind::Audio },
                url: platform_file_ref(transport, file_id),
            }),
        })
    }

    async fn download(
        &self,
        transport: &dyn MessagingDyn,
        file_id: &str,
    ) -> Result<Vec<u8>, MediaError> {
        let file: RemoteFile = transport
            .resolve_file(file_id)
            .await
            .map_err(|error| MediaError::Download(error.to_string()))?;

        let limit = self.config.max_download_bytes;
        if file.size as usize > limit {
            return Err(MediaError::TooLarge {
                size: file.size as usize,
                limit,
            });
        }

        let bytes = transport
            .fetch_file(&file)
            .await
            .map_err(|error| MediaError::Download(error.to_string()))?;

        if bytes.len() > limit {
            return Err(MediaError::TooLarge {
                size: bytes.len(),
                limit,
            });
        }
        Ok(bytes)
    }
}

/// Highest resolution wins; file size breaks ties.
fn largest_variant(variants: &[PhotoVariant]) -> Option<&PhotoVariant> {
    variants
        .iter()
        .max_by_key(|variant| (variant.pixels(), variant.file_size.unwrap_or(0)))
}

fn platform_file_ref(transport: &dyn MessagingDyn, file_id: &str) -> String {
    format!("{}-file:{file_id}", transport.name())
}
