//! Transcription provider — speech-to-text for spoken answers
//!
//! [`WhisperClient`] uploads audio as multipart form data to an
//! OpenAI-compatible `/audio/transcriptions` endpoint through the [`RetryClient`].

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use thiserror::Error;

use crate::config::TranscriptionConfig;
use crate::retry::{RetryClient, RetryError, RetryPolicy};

#[derive(Error, Debug)]
pub enum TranscriptionError {
    #[error("Service paused: usage limits exceeded")]
    ServicePaused,

    #[error("Audio payload is empty")]
    EmptyAudio,

    #[error("Missing API key")]
    MissingApiKey,

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// One recorded utterance.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
}

#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    async fn transcribe(&self, clip: &AudioClip) -> Result<String, TranscriptionError>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone)]
pub struct WhisperClient {
    http: RetryClient,
    api_key: String,
    config: TranscriptionConfig,
}

impl WhisperClient {
    /// `api_key` falls back to `OPENAI_API_KEY`.
    pub fn new(
        api_key: Option<String>,
        config: TranscriptionConfig,
        policy: RetryPolicy,
    ) -> Result<Self, TranscriptionError> {
        let api_key = api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();
        if api_key.is_empty() {
            return Err(TranscriptionError::MissingApiKey);
        }
        Ok(Self {
            http: RetryClient::new(policy)?,
            api_key,
            config,
        })
    }

    /// Client pointed at a custom endpoint (for testing / integration).
    pub fn with_base_url(
        api_key: String,
        base_url: String,
        policy: RetryPolicy,
    ) -> Result<Self, TranscriptionError> {
        let config = TranscriptionConfig {
            base_url,
            ..TranscriptionConfig::default()
        };
        Self::new(Some(api_key), config, policy)
    }

    fn form(&self, clip: &AudioClip) -> Result<Form, reqwest::Error> {
        let part = Part::bytes(clip.bytes.clone())
            .file_name(clip.file_name.clone())
            .mime_str(&clip.mime_type)?;
        let mut form = Form::new()
            .part("file", part)
            .text("model", self.config.model.clone());
        if let Some(language) = &self.config.language {
            form = form.text("language", language.clone());
        }
        Ok(form)
    }
}

#[async_trait]
impl TranscriptionProvider for WhisperClient {
    async fn transcribe(&self, clip: &AudioClip) -> Result<String, TranscriptionError> {
        if clip.bytes.is_empty() {
            return Err(TranscriptionError::EmptyAudio);
        }
        // Validate the mime type once; the builder below rebuilds the form per attempt.
        self.form(clip)?;

        let url = format!(
            "{}/audio/transcriptions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .execute(|c| {
                let request = c.post(&url).bearer_auth(&self.api_key);
                match self.form(clip) {
                    Ok(form) => request.multipart(form),
                    Err(_) => request,
                }
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::error!(code = status.as_u16(), message = %message, "Transcription API error");
            return Err(TranscriptionError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let parsed: TranscriptionResponse = response.json().await?;
        tracing::debug!(bytes = clip.bytes.len(), chars = parsed.text.len(), "Transcribed audio");
        Ok(parsed.text.trim().to_string())
    }
}
