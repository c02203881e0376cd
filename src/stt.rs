//! Speech-to-text: the provider transcription endpoint plus a best-effort
//! ffmpeg transcoder for platform voice notes.

use crate::error::MediaError;

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt as _;

/// External transcription RPC.
#[async_trait]
pub trait Transcriber: Send + Sync + 'static {
    /// Transcribe `audio`. `filename` carries the container hint the provider
    /// uses to pick a decoder.
    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<String, MediaError>;
}

/// OpenAI-compatible `/audio/transcriptions` client.
pub struct WhisperApi {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl WhisperApi {
    pub fn new(
        http_client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Transcriber for WhisperApi {
    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> Result<String, MediaError> {
        let size = audio.len();
        let part = reqwest::multipart::Part::bytes(audio)
            .file_name(filename.to_string())
            .mime_str(mime_for(filename))
            .map_err(|error| MediaError::TranscriptionFailed(error.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", part);

        let response = self
            .http_client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .header("authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|error| MediaError::TranscriptionFailed(error.to_string()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|error| MediaError::TranscriptionFailed(format!("({status}) {error}")))?;

        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            return Err(MediaError::TranscriptionFailed(format!(
                "transcription API error ({status}): {message}"
            )));
        }

        let text = body["text"].as_str().ok_or_else(|| {
            MediaError::TranscriptionFailed("transcription response has no text".into())
        })?;

        tracing::debug!(audio_bytes = size, text_len = text.len(), "audio transcribed");
        Ok(text.to_string())
    }
}

fn mime_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next() {
        Some("mp3") => "audio/mpeg",
        Some("ogg" | "oga") => "audio/ogg",
        Some("m4a") => "audio/mp4",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    }
}

/// Audio handed to the transcriber, with the filename hint matching its codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedAudio {
    pub bytes: Vec<u8>,
    pub filename: &'static str,
}

/// Converts platform audio to mp3 with ffmpeg.
#[derive(Debug, Clone)]
pub struct AudioTranscoder {
    ffmpeg_path: String,
}

impl AudioTranscoder {
    /// An empty `ffmpeg_path` disables transcoding.
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Transcode to mp3. On any failure the original bytes pass through
    /// unchanged with a filename derived from `mime_type`.
    pub async fn prepare(&self, audio: Vec<u8>, mime_type: Option<&str>) -> PreparedAudio {
        if self.ffmpeg_path.is_empty() {
            return passthrough(audio, mime_type);
        }

        match self.transcode(&audio).await {
            Ok(mp3) if !mp3.is_empty() => PreparedAudio {
                bytes: mp3,
                filename: "audio.mp3",
            },
            Ok(_) => {
                tracing::warn!("ffmpeg produced no output, sending original audio");
                passthrough(audio, mime_type)
            }
            Err(error) => {
                tracing::warn!(%error, "audio transcoding failed, sending original audio");
                passthrough(audio, mime_type)
            }
        }
    }

    async fn transcode(&self, audio: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut child = tokio::process::Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-f", "mp3", "pipe:1"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("ffmpeg stdin unavailable"))?;
        let input = audio.to_vec();
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        });

        let output = child.wait_with_output().await?;
        writer.await??;

        if !output.status.success() {
            anyhow::bail!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }
}

fn passthrough(audio: Vec<u8>, mime_type: Option<&str>) -> PreparedAudio {
    let filename = match mime_type {
        Some("audio/mpeg" | "audio/mp3") => "audio.mp3",
        Some("audio/mp4" | "audio/x-m4a" | "audio/m4a") => "audio.m4a",
        Some("audio/wav" | "audio/x-wav") => "audio.wav",
        // Telegram voice notes are ogg/opus.
        _ => "audio.ogg",
    };
    PreparedAudio {
        bytes: audio,
        filename,
    }
}
