use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Answer, FeedbackReport, JobContext, Question};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "session_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterviewSession {
    pub id: Uuid,
    pub identity: Option<String>,
    pub job: JobContext,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A session with every question, answer and report version attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetails {
    pub session: InterviewSession,
    pub questions: Vec<Question>,
    pub answers: Vec<Answer>,
    pub reports: Vec<FeedbackReport>,
}

impl SessionDetails {
    pub fn answer_for(&self, question_id: Uuid) -> Option<&Answer> {
        self.answers.iter().find(|a| a.question_id == question_id)
    }

    /// Most recent report version, if any.
    pub fn latest_report(&self) -> Option<&FeedbackReport> {
        self.reports.iter().max_by_key(|r| r.version)
    }
}
