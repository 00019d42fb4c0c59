use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use super::{InterviewStore, StoreError, UsageStore};
use crate::models::{
    Answer, AnswerAnalysis, FeedbackReport, GeneratedQuestion, InterviewSession, JobContext,
    NewQuestion, Question, ReportDraft, SessionDetails, SessionStatus, TokenUsage,
};

#[derive(Debug)]
struct CachedQuestions {
    questions: Vec<GeneratedQuestion>,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct MemoryState {
    sessions: HashMap<Uuid, InterviewSession>,
    questions: Vec<Question>,
    answers: Vec<Answer>,
    reports: Vec<FeedbackReport>,
    gate_open: bool,
    counters: HashMap<(String, NaiveDate), u32>,
    ledger: Vec<TokenUsage>,
    cache: HashMap<String, CachedQuestions>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            questions: Vec::new(),
            answers: Vec::new(),
            reports: Vec::new(),
            gate_open: true,
            counters: HashMap::new(),
            ledger: Vec::new(),
            cache: HashMap::new(),
        }
    }
}

/// In-process store for tests and `--memory` dev mode. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rows in the token ledger.
    pub fn ledger_len(&self) -> usize {
        self.state().ledger.len()
    }

    fn transition(
        &self,
        session_id: Uuid,
        status: SessionStatus,
    ) -> Result<InterviewSession, StoreError> {
        let mut state = self.state();
        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))?;

        if session.status != SessionStatus::InProgress {
            return Err(StoreError::Conflict(format!(
                "session {} is no longer in progress",
                session_id
            )));
        }

        session.status = status;
        if status == SessionStatus::Completed {
            session.completed_at = Some(Utc::now());
        }
        Ok(session.clone())
    }
}

#[async_trait]
impl InterviewStore for MemoryStore {
    async fn create_session(
        &self,
        identity: Option<&str>,
        job: &JobContext,
    ) -> Result<InterviewSession, StoreError> {
        let session = InterviewSession {
            id: Uuid::new_v4(),
            identity: identity.map(str::to_string),
            job: job.clone(),
            status: SessionStatus::InProgress,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.state().sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn append_questions(
        &self,
        session_id: Uuid,
        questions: &[NewQuestion],
    ) -> Result<Vec<Question>, StoreError> {
        let mut state = self.state();
        if !state.sessions.contains_key(&session_id) {
            return Err(StoreError::NotFound(format!("session {}", session_id)));
        }

        let taken = |state: &MemoryState, position: i32| {
            state
                .questions
                .iter()
                .any(|q| q.session_id == session_id && q.position == position)
        };
        if let Some(dup) = questions.iter().find(|q| taken(&*state, q.position)) {
            return Err(StoreError::Conflict(format!(
                "position {} already used in session {}",
                dup.position, session_id
            )));
        }

        let now = Utc::now();
        let saved: Vec<Question> = questions
            .iter()
            .map(|q| Question {
                id: Uuid::new_v4(),
                session_id,
                text: q.text.clone(),
                category: q.category,
                skill: q.skill.clone(),
                difficulty: q.difficulty,
                position: q.position,
                is_follow_up: q.is_follow_up,
                parent_id: q.parent_id,
                is_final: q.is_final,
                created_at: now,
            })
            .collect();
        state.questions.extend(saved.iter().cloned());
        Ok(saved)
    }

    async fn append_answer(
        &self,
        session_id: Uuid,
        question_id: Uuid,
        content: &str,
    ) -> Result<Answer, StoreError> {
        let mut state = self.state();
        if !state.questions.iter().any(|q| q.id == question_id) {
            return Err(StoreError::NotFound(format!("question {}", question_id)));
        }

        if let Some(existing) = state.answers.iter_mut().find(|a| a.question_id == question_id) {
            existing.content = content.to_string();
            existing.analysis = None;
            return Ok(existing.clone());
        }

        let answer = Answer {
            id: Uuid::new_v4(),
            session_id,
            question_id,
            content: content.to_string(),
            analysis: None,
            created_at: Utc::now(),
        };
        state.answers.push(answer.clone());
        Ok(answer)
    }

    async fn attach_analysis(
        &self,
        answer_id: Uuid,
        analysis: &AnswerAnalysis,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let answer = state
            .answers
            .iter_mut()
            .find(|a| a.id == answer_id)
            .ok_or_else(|| StoreError::NotFound(format!("answer {}", answer_id)))?;
        answer.analysis = Some(analysis.clone());
        Ok(())
    }

    async fn mark_completed(&self, session_id: Uuid) -> Result<InterviewSession, StoreError> {
        self.transition(session_id, SessionStatus::Completed)
    }

    async fn mark_abandoned(&self, session_id: Uuid) -> Result<InterviewSession, StoreError> {
        self.transition(session_id, SessionStatus::Abandoned)
    }

    async fn create_report(
        &self,
        session_id: Uuid,
        draft: &ReportDraft,
    ) -> Result<FeedbackReport, StoreError> {
        let mut state = self.state();
        if !state.sessions.contains_key(&session_id) {
            return Err(StoreError::NotFound(format!("session {}", session_id)));
        }

        let version = state
            .reports
            .iter()
            .filter(|r| r.session_id == session_id)
            .map(|r| r.version)
            .max()
            .unwrap_or(0)
            + 1;
        let report = FeedbackReport::from_draft(session_id, version, draft.clone());
        state.reports.push(report.clone());
        Ok(report)
    }

    async fn get_session_with_details(
        &self,
        session_id: Uuid,
    ) -> Result<Option<SessionDetails>, StoreError> {
        let state = self.state();
        let Some(session) = state.sessions.get(&session_id).cloned() else {
            return Ok(None);
        };

        let mut questions: Vec<Question> = state
            .questions
            .iter()
            .filter(|q| q.session_id == session_id)
            .cloned()
            .collect();
        questions.sort_by_key(|q| q.position);

        let answers = state
            .answers
            .iter()
            .filter(|a| a.session_id == session_id)
            .cloned()
            .collect();

        let mut reports: Vec<FeedbackReport> = state
            .reports
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        reports.sort_by_key(|r| r.version);

        Ok(Some(SessionDetails {
            session,
            questions,
            answers,
            reports,
        }))
    }

    async fn list_sessions_for_identity(
        &self,
        identity: Option<&str>,
    ) -> Result<Vec<InterviewSession>, StoreError> {
        let state = self.state();
        let mut sessions: Vec<InterviewSession> = state
            .sessions
            .values()
            .filter(|s| s.identity.as_deref() == identity)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state();
        if state.sessions.remove(&session_id).is_none() {
            return Ok(false);
        }
        state.questions.retain(|q| q.session_id != session_id);
        state.answers.retain(|a| a.session_id != session_id);
        state.reports.retain(|r| r.session_id != session_id);
        Ok(true)
    }

    async fn cached_questions(
        &self,
        key: &str,
        newer_than: DateTime<Utc>,
    ) -> Result<Option<Vec<GeneratedQuestion>>, StoreError> {
        Ok(self
            .state()
            .cache
            .get(key)
            .filter(|c| c.created_at >= newer_than)
            .map(|c| c.questions.clone()))
    }

    async fn cache_questions(
        &self,
        key: &str,
        _snippet: &str,
        questions: &[GeneratedQuestion],
    ) -> Result<(), StoreError> {
        self.state().cache.insert(
            key.to_string(),
            CachedQuestions {
                questions: questions.to_vec(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn read_gate(&self) -> Result<bool, StoreError> {
        Ok(self.state().gate_open)
    }

    async fn write_gate(&self, allow: bool) -> Result<(), StoreError> {
        self.state().gate_open = allow;
        Ok(())
    }

    async fn session_count(&self, identity: &str, day: NaiveDate) -> Result<u32, StoreError> {
        Ok(self
            .state()
            .counters
            .get(&(identity.to_string(), day))
            .copied()
            .unwrap_or(0))
    }

    async fn try_acquire_session(
        &self,
        identity: &str,
        day: NaiveDate,
        max: u32,
    ) -> Result<Option<u32>, StoreError> {
        let mut state = self.state();
        let count = state.counters.entry((identity.to_string(), day)).or_insert(0);
        if *count >= max {
            return Ok(None);
        }
        *count += 1;
        Ok(Some(*count))
    }

    async fn release_session(&self, identity: &str, day: NaiveDate) -> Result<(), StoreError> {
        if let Some(count) = self.state().counters.get_mut(&(identity.to_string(), day)) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    async fn record_usage(&self, usage: &TokenUsage) -> Result<f64, StoreError> {
        let mut state = self.state();
        state.ledger.push(usage.clone());
        Ok(state.ledger.iter().map(|u| u.cost_usd).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Difficulty, QuestionCategory};

    fn job() -> JobContext {
        JobContext {
            description: "Senior Rust engineer at Acme".to_string(),
            title: "Senior Rust Engineer".to_string(),
            company: "Acme".to_string(),
            profile: None,
        }
    }

    fn main_question(position: i32) -> NewQuestion {
        GeneratedQuestion {
            id: format!("q{}", position),
            text: format!("Question {}", position),
            category: QuestionCategory::Technical,
            skill: "Rust".to_string(),
            difficulty: Difficulty::Medium,
        }
        .into_new(position)
    }

    fn draft(score: f64) -> ReportDraft {
        ReportDraft {
            overall_score: score,
            summary: "Solid".to_string(),
            strengths: vec![],
            areas_for_improvement: vec![],
            danger_zones: vec![],
            danger_zone_risk: None,
            question_feedback: vec![],
            next_steps: vec![],
        }
    }

    #[tokio::test]
    async fn test_questions_come_back_in_position_order() {
        let store = MemoryStore::new();
        let session = store.create_session(None, &job()).await.unwrap();
        store
            .append_questions(session.id, &[main_question(2), main_question(0)])
            .await
            .unwrap();
        store.append_questions(session.id, &[main_question(1)]).await.unwrap();

        let details = store.get_session_with_details(session.id).await.unwrap().unwrap();
        let positions: Vec<i32> = details.questions.iter().map(|q| q.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_duplicate_position_is_a_conflict() {
        let store = MemoryStore::new();
        let session = store.create_session(None, &job()).await.unwrap();
        store.append_questions(session.id, &[main_question(0)]).await.unwrap();

        let result = store.append_questions(session.id, &[main_question(0)]).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_answer_upsert_replaces_content_and_clears_analysis() {
        let store = MemoryStore::new();
        let session = store.create_session(None, &job()).await.unwrap();
        let q = store.append_questions(session.id, &[main_question(0)]).await.unwrap();

        let first = store.append_answer(session.id, q[0].id, "first").await.unwrap();
        let analysis = AnswerAnalysis {
            strengths: vec![],
            weaknesses: vec![],
            missing_competencies: vec![],
            score: 6.0,
            needs_follow_up: false,
            danger_zones: vec![],
        };
        store.attach_analysis(first.id, &analysis).await.unwrap();

        let second = store.append_answer(session.id, q[0].id, "second").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.content, "second");
        assert!(second.analysis.is_none());

        let details = store.get_session_with_details(session.id).await.unwrap().unwrap();
        assert_eq!(details.answers.len(), 1);
    }

    #[tokio::test]
    async fn test_reports_are_versioned() {
        let store = MemoryStore::new();
        let session = store.create_session(None, &job()).await.unwrap();

        let v1 = store.create_report(session.id, &draft(60.0)).await.unwrap();
        let v2 = store.create_report(session.id, &draft(75.0)).await.unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));

        let details = store.get_session_with_details(session.id).await.unwrap().unwrap();
        assert_eq!(details.reports.len(), 2);
        assert_eq!(details.latest_report().map(|r| r.overall_score), Some(75.0));
    }

    #[tokio::test]
    async fn test_terminal_sessions_reject_transitions() {
        let store = MemoryStore::new();
        let session = store.create_session(Some("alice"), &job()).await.unwrap();

        let abandoned = store.mark_abandoned(session.id).await.unwrap();
        assert_eq!(abandoned.status, SessionStatus::Abandoned);
        assert!(abandoned.completed_at.is_none());

        let result = store.mark_completed(session.id).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        let missing = store.mark_completed(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_cascades_and_is_idempotent() {
        let store = MemoryStore::new();
        let session = store.create_session(None, &job()).await.unwrap();
        let q = store.append_questions(session.id, &[main_question(0)]).await.unwrap();
        store.append_answer(session.id, q[0].id, "answer").await.unwrap();
        store.create_report(session.id, &draft(50.0)).await.unwrap();

        assert!(store.delete_session(session.id).await.unwrap());
        assert!(!store.delete_session(session.id).await.unwrap());
        assert!(store.get_session_with_details(session.id).await.unwrap().is_none());
        assert!(store.state().answers.is_empty());
        assert!(store.state().reports.is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_by_identity_newest_first() {
        let store = MemoryStore::new();
        let a1 = store.create_session(Some("alice"), &job()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let a2 = store.create_session(Some("alice"), &job()).await.unwrap();
        store.create_session(Some("bob"), &job()).await.unwrap();
        store.create_session(None, &job()).await.unwrap();

        let alice = store.list_sessions_for_identity(Some("alice")).await.unwrap();
        let ids: Vec<Uuid> = alice.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a2.id, a1.id]);

        let anonymous = store.list_sessions_for_identity(None).await.unwrap();
        assert_eq!(anonymous.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_respects_freshness_bound() {
        let store = MemoryStore::new();
        let questions = vec![GeneratedQuestion {
            id: "q1".to_string(),
            text: "Tell me about ownership".to_string(),
            category: QuestionCategory::Technical,
            skill: "Rust".to_string(),
            difficulty: Difficulty::Easy,
        }];
        store.cache_questions("k", "snippet", &questions).await.unwrap();

        let fresh = store
            .cached_questions("k", Utc::now() - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(fresh, Some(questions));

        let stale = store
            .cached_questions("k", Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn test_counters_and_ledger() {
        let store = MemoryStore::new();
        let day = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();

        assert_eq!(store.session_count("alice", day).await.unwrap(), 0);
        assert_eq!(store.try_acquire_session("alice", day, 2).await.unwrap(), Some(1));
        assert_eq!(store.try_acquire_session("alice", day, 2).await.unwrap(), Some(2));
        assert_eq!(store.try_acquire_session("alice", day, 2).await.unwrap(), None);
        assert_eq!(store.session_count("alice", day).await.unwrap(), 2);

        store.release_session("alice", day).await.unwrap();
        assert_eq!(store.session_count("alice", day).await.unwrap(), 1);
        store.release_session("bob", day).await.unwrap();
        assert_eq!(store.session_count("bob", day).await.unwrap(), 0);

        let usage = |cost| TokenUsage {
            operation: "analyze_answer".to_string(),
            session_id: None,
            prompt_tokens: 100,
            completion_tokens: 50,
            cost_usd: cost,
        };
        store.record_usage(&usage(0.25)).await.unwrap();
        let total = store.record_usage(&usage(0.5)).await.unwrap();
        assert!((total - 0.75).abs() < 1e-9);
        assert_eq!(store.ledger_len(), 2);
    }
}
