use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{InterviewStore, StoreError, UsageStore};
use crate::models::{
    Answer, AnswerAnalysis, FeedbackReport, GeneratedQuestion, InterviewSession, JobContext,
    NewQuestion, Question, QuestionFeedback, ReportDraft, RiskLevel, SessionDetails,
    SessionStatus, TokenUsage,
};

const GATE_KEY: &str = "allow_llm_calls";

const SESSION_COLUMNS: &str = "id, identity, job_data, status, created_at, completed_at";
const QUESTION_COLUMNS: &str = "id, session_id, text, category, skill, difficulty, position, \
                                is_follow_up, parent_id, is_final, created_at";
const ANSWER_COLUMNS: &str = "id, session_id, question_id, content, analysis, created_at";
const REPORT_COLUMNS: &str = "id, session_id, version, overall_score, summary, strengths, \
                              areas_for_improvement, danger_zones, danger_zone_risk, \
                              question_feedback, next_steps, created_at";

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    identity: Option<String>,
    job_data: Json<JobContext>,
    status: SessionStatus,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<SessionRow> for InterviewSession {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.id,
            identity: row.identity,
            job: row.job_data.0,
            status: row.status,
            created_at: row.created_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AnswerRow {
    id: Uuid,
    session_id: Uuid,
    question_id: Uuid,
    content: String,
    analysis: Option<Json<AnswerAnalysis>>,
    created_at: DateTime<Utc>,
}

impl From<AnswerRow> for Answer {
    fn from(row: AnswerRow) -> Self {
        Self {
            id: row.id,
            session_id: row.session_id,
            question_id: row.question_id,
            content: row.content,
            analysis: row.analysis.map(|a| a.0),
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReportRow {
    id: Uuid,
    session_id: Uuid,
    version: i32,
    overall_score: f64,
    summary: String,
    strengths: Vec<String>,
    areas_for_improvement: Vec<String>,
    danger_zones: Vec<String>,
    danger_zone_risk: Option<String>,
    question_feedback: Json<Vec<QuestionFeedback>>,
    next_steps: Vec<String>,
    created_at: DateTime<Utc>,
}

impl From<ReportRow> for FeedbackReport {
    fn from(row: ReportRow) -> Self {
        Self {
            id: row.id,
            session_id: row.session_id,
            version: row.version,
            overall_score: row.overall_score,
            summary: row.summary,
            strengths: row.strengths,
            areas_for_improvement: row.areas_for_improvement,
            danger_zones: row.danger_zones,
            danger_zone_risk: row.danger_zone_risk.as_deref().and_then(RiskLevel::parse_lenient),
            question_feedback: row.question_feedback.0,
            next_steps: row.next_steps,
            created_at: row.created_at,
        }
    }
}

fn risk_str(risk: Option<RiskLevel>) -> Option<&'static str> {
    risk.map(|r| match r {
        RiskLevel::Low => "low",
        RiskLevel::Medium => "medium",
        RiskLevel::High => "high",
    })
}

/// PostgreSQL-backed store. Queries are checked at runtime so the crate builds
/// without a live database.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn transition(
        &self,
        session_id: Uuid,
        status: SessionStatus,
    ) -> Result<InterviewSession, StoreError> {
        let completed_at = (status == SessionStatus::Completed).then(Utc::now);
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "UPDATE interview_sessions SET status = $2, completed_at = $3
             WHERE id = $1 AND status = 'in_progress'
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(session_id)
        .bind(status)
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => {
                let exists: Option<(Uuid,)> =
                    sqlx::query_as("SELECT id FROM interview_sessions WHERE id = $1")
                        .bind(session_id)
                        .fetch_optional(&self.pool)
                        .await?;
                match exists {
                    Some(_) => Err(StoreError::Conflict(format!(
                        "session {} is no longer in progress",
                        session_id
                    ))),
                    None => Err(StoreError::NotFound(format!("session {}", session_id))),
                }
            }
        }
    }
}

#[async_trait]
impl InterviewStore for PgStore {
    async fn create_session(
        &self,
        identity: Option<&str>,
        job: &JobContext,
    ) -> Result<InterviewSession, StoreError> {
        let row: SessionRow = sqlx::query_as(&format!(
            "INSERT INTO interview_sessions (id, identity, job_data, status)
             VALUES ($1, $2, $3, 'in_progress')
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(identity)
        .bind(Json(job))
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(session_id = %row.id, "Created interview session");
        Ok(row.into())
    }

    async fn append_questions(
        &self,
        session_id: Uuid,
        questions: &[NewQuestion],
    ) -> Result<Vec<Question>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut saved = Vec::with_capacity(questions.len());

        for q in questions {
            let row: Question = sqlx::query_as(&format!(
                "INSERT INTO questions
                    (id, session_id, text, category, skill, difficulty, position,
                     is_follow_up, parent_id, is_final)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 RETURNING {QUESTION_COLUMNS}"
            ))
            .bind(Uuid::new_v4())
            .bind(session_id)
            .bind(&q.text)
            .bind(q.category)
            .bind(&q.skill)
            .bind(q.difficulty)
            .bind(q.position)
            .bind(q.is_follow_up)
            .bind(q.parent_id)
            .bind(q.is_final)
            .fetch_one(&mut *tx)
            .await?;
            saved.push(row);
        }

        tx.commit().await?;
        Ok(saved)
    }

    async fn append_answer(
        &self,
        session_id: Uuid,
        question_id: Uuid,
        content: &str,
    ) -> Result<Answer, StoreError> {
        let row: AnswerRow = sqlx::query_as(&format!(
            "INSERT INTO answers (id, session_id, question_id, content)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (question_id)
             DO UPDATE SET content = EXCLUDED.content, analysis = NULL
             RETURNING {ANSWER_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(question_id)
        .bind(content)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn attach_analysis(
        &self,
        answer_id: Uuid,
        analysis: &AnswerAnalysis,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE answers SET analysis = $2 WHERE id = $1")
            .bind(answer_id)
            .bind(Json(analysis))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("answer {}", answer_id)));
        }
        Ok(())
    }

    async fn mark_completed(&self, session_id: Uuid) -> Result<InterviewSession, StoreError> {
        self.transition(session_id, SessionStatus::Completed).await
    }

    async fn mark_abandoned(&self, session_id: Uuid) -> Result<InterviewSession, StoreError> {
        self.transition(session_id, SessionStatus::Abandoned).await
    }

    async fn create_report(
        &self,
        session_id: Uuid,
        draft: &ReportDraft,
    ) -> Result<FeedbackReport, StoreError> {
        let row: ReportRow = sqlx::query_as(&format!(
            "INSERT INTO feedback_reports
                (id, session_id, version, overall_score, summary, strengths,
                 areas_for_improvement, danger_zones, danger_zone_risk,
                 question_feedback, next_steps)
             SELECT $1, $2, COALESCE(MAX(version), 0) + 1, $3, $4, $5, $6, $7, $8, $9, $10
             FROM feedback_reports WHERE session_id = $2
             RETURNING {REPORT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(draft.overall_score)
        .bind(&draft.summary)
        .bind(&draft.strengths)
        .bind(&draft.areas_for_improvement)
        .bind(&draft.danger_zones)
        .bind(risk_str(draft.danger_zone_risk))
        .bind(Json(&draft.question_feedback))
        .bind(&draft.next_steps)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(session_id = %session_id, version = row.version, "Stored feedback report");
        Ok(row.into())
    }

    async fn get_session_with_details(
        &self,
        session_id: Uuid,
    ) -> Result<Option<SessionDetails>, StoreError> {
        let session: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM interview_sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(session) = session else {
            return Ok(None);
        };

        let questions: Vec<Question> = sqlx::query_as(&format!(
            "SELECT {QUESTION_COLUMNS} FROM questions WHERE session_id = $1 ORDER BY position"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let answers: Vec<AnswerRow> = sqlx::query_as(&format!(
            "SELECT {ANSWER_COLUMNS} FROM answers WHERE session_id = $1 ORDER BY created_at"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let reports: Vec<ReportRow> = sqlx::query_as(&format!(
            "SELECT {REPORT_COLUMNS} FROM feedback_reports WHERE session_id = $1 ORDER BY version"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(SessionDetails {
            session: session.into(),
            questions,
            answers: answers.into_iter().map(Answer::from).collect(),
            reports: reports.into_iter().map(FeedbackReport::from).collect(),
        }))
    }

    async fn list_sessions_for_identity(
        &self,
        identity: Option<&str>,
    ) -> Result<Vec<InterviewSession>, StoreError> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM interview_sessions
             WHERE identity IS NOT DISTINCT FROM $1
             ORDER BY created_at DESC"
        ))
        .bind(identity)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(InterviewSession::from).collect())
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM interview_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cached_questions(
        &self,
        key: &str,
        newer_than: DateTime<Utc>,
    ) -> Result<Option<Vec<GeneratedQuestion>>, StoreError> {
        let row: Option<(Json<Vec<GeneratedQuestion>>,)> = sqlx::query_as(
            "SELECT questions FROM question_cache WHERE cache_key = $1 AND created_at >= $2",
        )
        .bind(key)
        .bind(newer_than)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.0 .0))
    }

    async fn cache_questions(
        &self,
        key: &str,
        snippet: &str,
        questions: &[GeneratedQuestion],
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO question_cache (cache_key, snippet, questions, created_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (cache_key)
             DO UPDATE SET questions = EXCLUDED.questions, created_at = now()",
        )
        .bind(key)
        .bind(snippet)
        .bind(Json(questions))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn read_gate(&self) -> Result<bool, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM global_settings WHERE key = $1")
                .bind(GATE_KEY)
                .fetch_optional(&self.pool)
                .await?;

        // A missing row counts as closed.
        Ok(row.map(|r| r.0 == "true").unwrap_or(false))
    }

    async fn write_gate(&self, allow: bool) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO global_settings (key, value, updated_at) VALUES ($1, $2, now())
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(GATE_KEY)
        .bind(if allow { "true" } else { "false" })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn session_count(&self, identity: &str, day: NaiveDate) -> Result<u32, StoreError> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT count FROM session_counters WHERE identity = $1 AND day = $2")
                .bind(identity)
                .bind(day)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|r| r.0.max(0) as u32).unwrap_or(0))
    }

    async fn try_acquire_session(
        &self,
        identity: &str,
        day: NaiveDate,
        max: u32,
    ) -> Result<Option<u32>, StoreError> {
        if max == 0 {
            return Ok(None);
        }
        let row: Option<(i32,)> = sqlx::query_as(
            "INSERT INTO session_counters (identity, day, count) VALUES ($1, $2, 1)
             ON CONFLICT (identity, day) DO UPDATE SET count = session_counters.count + 1
             WHERE session_counters.count < $3
             RETURNING count",
        )
        .bind(identity)
        .bind(day)
        .bind(i32::try_from(max).unwrap_or(i32::MAX))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(count,)| count.max(0) as u32))
    }

    async fn release_session(&self, identity: &str, day: NaiveDate) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE session_counters SET count = count - 1
             WHERE identity = $1 AND day = $2 AND count > 0",
        )
        .bind(identity)
        .bind(day)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_usage(&self, usage: &TokenUsage) -> Result<f64, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO token_usage (operation, session_id, prompt_tokens, completion_tokens, cost_usd)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&usage.operation)
        .bind(usage.session_id)
        .bind(usage.prompt_tokens as i32)
        .bind(usage.completion_tokens as i32)
        .bind(usage.cost_usd)
        .execute(&mut *tx)
        .await?;

        let total: (f64,) = sqlx::query_as("SELECT COALESCE(SUM(cost_usd), 0)::float8 FROM token_usage")
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(total.0)
    }
}

// ============================================================================
// TESTS — require a live PostgreSQL; skipped when unavailable
// ============================================================================
