pub mod config;
pub mod danger;
pub mod db;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod models;
pub mod prompts;
pub mod retry;
pub mod store;
pub mod transcription;
pub mod usage;

pub use config::RehearseConfig;
pub use error::RehearseError;
pub use gateway::{FinalPair, GatewayError, PromptGateway, FALLBACK_FOLLOW_UP};
pub use llm::{Completion, CompletionProvider, CompletionRequest, OpenAiClient, ProviderError};
pub use prompts::TranscriptEntry;
pub use retry::{RetryClient, RetryError, RetryPolicy};
pub use store::{InterviewStore, MemoryStore, PgStore, StoreError, UsageStore};
pub use transcription::{AudioClip, TranscriptionError, TranscriptionProvider, WhisperClient};
pub use usage::{SessionSlot, UsageGuard};
