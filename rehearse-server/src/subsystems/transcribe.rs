//! Spoken answers: gate check, speech-to-text, spend recording.
//!
//! The transcript is returned to the caller for review; nothing is stored
//! until it is submitted as an ordinary answer.

use std::sync::Arc;

use rehearse_core::usage::estimate_audio_tokens;
use rehearse_core::{AudioClip, RehearseError, TranscriptionError, TranscriptionProvider, UsageGuard};
use uuid::Uuid;

pub struct TranscriptionService {
    provider: Arc<dyn TranscriptionProvider>,
    guard: UsageGuard,
}

impl TranscriptionService {
    pub fn new(provider: Arc<dyn TranscriptionProvider>, guard: UsageGuard) -> Self {
        Self { provider, guard }
    }

    pub async fn transcribe(
        &self,
        clip: AudioClip,
        session_id: Option<Uuid>,
    ) -> Result<String, RehearseError> {
        if clip.bytes.is_empty() {
            return Err(TranscriptionError::EmptyAudio.into());
        }
        if !self.guard.check_global_gate().await {
            return Err(TranscriptionError::ServicePaused.into());
        }

        let text = self.provider.transcribe(&clip).await?;

        let tokens = estimate_audio_tokens(clip.bytes.len());
        if let Err(e) = self
            .guard
            .record_token_spend("transcribe", session_id, tokens, 0)
            .await
        {
            tracing::warn!(error = %e, "Failed to record transcription spend");
        }

        tracing::info!(bytes = clip.bytes.len(), chars = text.len(), "Audio transcribed");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rehearse_core::config::UsageConfig;
    use rehearse_core::store::UsageStore;
    use rehearse_core::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TranscriptionProvider for EchoProvider {
        async fn transcribe(&self, clip: &AudioClip) -> Result<String, TranscriptionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{} bytes of speech", clip.bytes.len()))
        }
    }

    fn clip(len: usize) -> AudioClip {
        AudioClip {
            bytes: vec![7; len],
            file_name: "answer.webm".to_string(),
            mime_type: "audio/webm".to_string(),
        }
    }

    fn service(store: Arc<MemoryStore>) -> (TranscriptionService, Arc<EchoProvider>) {
        let provider = Arc::new(EchoProvider {
            calls: AtomicUsize::new(0),
        });
        let guard = UsageGuard::new(store, UsageConfig::default());
        (TranscriptionService::new(provider.clone(), guard), provider)
    }

    #[tokio::test]
    async fn test_transcription_records_estimated_spend() {
        let store = Arc::new(MemoryStore::new());
        let (service, provider) = service(store.clone());

        let text = service.transcribe(clip(40_000), None).await.unwrap();
        assert_eq!(text, "40000 bytes of speech");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.ledger_len(), 1);
    }

    #[tokio::test]
    async fn test_closed_gate_skips_provider() {
        let store = Arc::new(MemoryStore::new());
        store.write_gate(false).await.unwrap();
        let (service, provider) = service(store);

        let err = service.transcribe(clip(10), None).await.unwrap_err();
        assert!(matches!(err, RehearseError::ServicePaused));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_audio_is_a_validation_error() {
        let (service, provider) = service(Arc::new(MemoryStore::new()));
        let err = service.transcribe(clip(0), None).await.unwrap_err();
        assert!(matches!(err, RehearseError::Validation(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
