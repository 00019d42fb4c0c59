//! Session store adapter
//!
//! The narrow persistence contract consumed by the interview state machine and
//! the usage guard. Two implementations:
//! - [`PgStore`] — PostgreSQL via sqlx (production)
//! - [`MemoryStore`] — in-process maps (tests, `--memory` dev mode)
//!
//! Every operation is atomic at the single-record level only.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Answer, AnswerAnalysis, FeedbackReport, GeneratedQuestion, InterviewSession, JobContext,
    NewQuestion, Question, ReportDraft, SessionDetails, TokenUsage,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),
}

#[async_trait]
pub trait InterviewStore: Send + Sync {
    async fn create_session(
        &self,
        identity: Option<&str>,
        job: &JobContext,
    ) -> Result<InterviewSession, StoreError>;

    async fn append_questions(
        &self,
        session_id: Uuid,
        questions: &[NewQuestion],
    ) -> Result<Vec<Question>, StoreError>;

    /// Insert the answer for `question_id`, replacing the content of an
    /// existing one (a retried transition) so each question keeps at most one.
    async fn append_answer(
        &self,
        session_id: Uuid,
        question_id: Uuid,
        content: &str,
    ) -> Result<Answer, StoreError>;

    async fn attach_analysis(
        &self,
        answer_id: Uuid,
        analysis: &AnswerAnalysis,
    ) -> Result<(), StoreError>;

    /// in_progress → completed, stamping `completed_at`.
    async fn mark_completed(&self, session_id: Uuid) -> Result<InterviewSession, StoreError>;

    /// in_progress → abandoned.
    async fn mark_abandoned(&self, session_id: Uuid) -> Result<InterviewSession, StoreError>;

    /// Append a report as the next version for the session.
    async fn create_report(
        &self,
        session_id: Uuid,
        draft: &ReportDraft,
    ) -> Result<FeedbackReport, StoreError>;

    async fn get_session_with_details(
        &self,
        session_id: Uuid,
    ) -> Result<Option<SessionDetails>, StoreError>;

    /// Newest first. `None` lists anonymous sessions.
    async fn list_sessions_for_identity(
        &self,
        identity: Option<&str>,
    ) -> Result<Vec<InterviewSession>, StoreError>;

    /// Cascades to questions, answers and reports. Returns whether anything was removed.
    async fn delete_session(&self, session_id: Uuid) -> Result<bool, StoreError>;

    async fn cached_questions(
        &self,
        key: &str,
        newer_than: DateTime<Utc>,
    ) -> Result<Option<Vec<GeneratedQuestion>>, StoreError>;

    async fn cache_questions(
        &self,
        key: &str,
        snippet: &str,
        questions: &[GeneratedQuestion],
    ) -> Result<(), StoreError>;
}

/// Persistence for the usage guard: the global gate, per-identity daily
/// counters and the token-spend ledger.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// `true` while outbound model calls are allowed.
    async fn read_gate(&self) -> Result<bool, StoreError>;

    async fn write_gate(&self, allow: bool) -> Result<(), StoreError>;

    async fn session_count(&self, identity: &str, day: NaiveDate) -> Result<u32, StoreError>;

    /// Count one session start in a single atomic step, provided fewer than
    /// `max` are already counted for the day. Returns the new count, or `None`
    /// when the day is full.
    async fn try_acquire_session(
        &self,
        identity: &str,
        day: NaiveDate,
        max: u32,
    ) -> Result<Option<u32>, StoreError>;

    /// Give back a start taken by `try_acquire_session`. Never goes below zero.
    async fn release_session(&self, identity: &str, day: NaiveDate) -> Result<(), StoreError>;

    /// Append to the ledger; returns the cumulative spend in USD.
    async fn record_usage(&self, usage: &TokenUsage) -> Result<f64, StoreError>;
}
