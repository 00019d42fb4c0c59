//! Interview session state machine
//!
//! `QuestioningMain(i) ⇄ AwaitingFollowUp(i) → QuestioningFinal(j) → Completed`,
//! with `Abandoned` reachable from any non-terminal stage.
//!
//! The stage is never stored. It is derived from the persisted questions and
//! answers, and every call reloads the session, so a restart or a failed
//! transition resumes exactly where storage says it is. A failed required
//! step leaves storage at the prior stage and the caller may retry.
//!
//! One transition per session runs at a time; a concurrent call is rejected
//! with `Conflict` rather than queued. Nothing is kept in memory between
//! calls, so sessions a candidate walks away from cost nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use rehearse_core::config::{CacheConfig, InterviewConfig};
use rehearse_core::gateway::{self, FinalPair, PromptGateway, FALLBACK_FOLLOW_UP};
use rehearse_core::models::{
    Answer, FeedbackReport, GeneratedQuestion, InterviewSession, JobContext, JobProfile,
    NewQuestion, Question, QuotaStatus, SessionDetails, SessionStatus,
};
use rehearse_core::store::InterviewStore;
use rehearse_core::{GatewayError, RehearseError, TranscriptEntry, UsageGuard};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Quota bucket shared by callers without an identity.
pub const ANONYMOUS_IDENTITY: &str = "anonymous";

const FINAL_QUESTION_COUNT: usize = 2;
const CACHE_SNIPPET_CHARS: usize = 500;

// ============================================================================
// Stage & progress
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    QuestioningMain(usize),
    AwaitingFollowUp(usize),
    QuestioningFinal(usize),
    Completed,
    Abandoned,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Abandoned)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::QuestioningMain(_) => "questioning_main",
            Stage::AwaitingFollowUp(_) => "awaiting_follow_up",
            Stage::QuestioningFinal(_) => "questioning_final",
            Stage::Completed => "completed",
            Stage::Abandoned => "abandoned",
        }
    }

    pub fn index(self) -> Option<usize> {
        match self {
            Stage::QuestioningMain(i) | Stage::AwaitingFollowUp(i) | Stage::QuestioningFinal(i) => {
                Some(i)
            }
            Stage::Completed | Stage::Abandoned => None,
        }
    }
}

/// Informational completion estimate, 0–100.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub stage: Stage,
    pub percent: f64,
}

impl Serialize for Progress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Progress", 3)?;
        state.serialize_field("stage", self.stage.name())?;
        state.serialize_field("index", &self.stage.index())?;
        state.serialize_field("percent", &self.percent)?;
        state.end()
    }
}

fn main_questions(details: &SessionDetails) -> Vec<&Question> {
    details
        .questions
        .iter()
        .filter(|q| !q.is_follow_up && !q.is_final)
        .collect()
}

fn final_questions(details: &SessionDetails) -> Vec<&Question> {
    details.questions.iter().filter(|q| q.is_final).collect()
}

fn follow_up_of(details: &SessionDetails, parent: Uuid) -> Option<&Question> {
    details
        .questions
        .iter()
        .find(|q| q.is_follow_up && q.parent_id == Some(parent))
}

fn answered(details: &SessionDetails, question: &Question) -> bool {
    details.answer_for(question.id).is_some()
}

/// Where the session stands, judged from what has been persisted.
pub fn derive_stage(details: &SessionDetails) -> Stage {
    match details.session.status {
        SessionStatus::Completed => return Stage::Completed,
        SessionStatus::Abandoned => return Stage::Abandoned,
        SessionStatus::InProgress => {}
    }

    let mains = main_questions(details);
    for (i, main) in mains.iter().enumerate() {
        if !answered(details, main) {
            return Stage::QuestioningMain(i);
        }
        match follow_up_of(details, main.id) {
            // Answer stored but the follow-up never was: redo the main transition.
            None => return Stage::QuestioningMain(i),
            Some(f) if !answered(details, f) => return Stage::AwaitingFollowUp(i),
            Some(_) => {}
        }
    }

    let finals = final_questions(details);
    if finals.is_empty() {
        // Last follow-up answered but the closing pair was never stored.
        return Stage::AwaitingFollowUp(mains.len().saturating_sub(1));
    }
    match finals.iter().position(|q| !answered(details, q)) {
        Some(j) => Stage::QuestioningFinal(j),
        // Every final answered but the report failed: retry the last one.
        None => Stage::QuestioningFinal(finals.len() - 1),
    }
}

/// The question the candidate should answer next.
pub fn current_question(details: &SessionDetails) -> Option<&Question> {
    match derive_stage(details) {
        Stage::QuestioningMain(i) => main_questions(details).get(i).copied(),
        Stage::AwaitingFollowUp(i) => main_questions(details)
            .get(i)
            .and_then(|m| follow_up_of(details, m.id)),
        Stage::QuestioningFinal(j) => final_questions(details).get(j).copied(),
        Stage::Completed | Stage::Abandoned => None,
    }
}

pub fn progress(details: &SessionDetails) -> Progress {
    let stage = derive_stage(details);
    let finals = final_questions(details);

    let percent = if stage == Stage::Completed {
        100.0
    } else if !finals.is_empty() {
        let done = finals.iter().filter(|q| answered(details, q)).count();
        done as f64 / FINAL_QUESTION_COUNT as f64 * 100.0
    } else {
        let mains = main_questions(details);
        if mains.is_empty() {
            0.0
        } else {
            let done: f64 = mains
                .iter()
                .map(|m| {
                    let main = if answered(details, m) { 1.0 } else { 0.0 };
                    let follow = match follow_up_of(details, m.id) {
                        Some(f) if answered(details, f) => 0.5,
                        _ => 0.0,
                    };
                    main + follow
                })
                .sum();
            done / (mains.len() as f64 * 1.5) * 100.0
        }
    };

    Progress {
        stage,
        percent: percent.clamp(0.0, 100.0),
    }
}

fn transcript(details: &SessionDetails) -> Vec<TranscriptEntry> {
    details
        .questions
        .iter()
        .map(|q| {
            let answer = details.answer_for(q.id);
            TranscriptEntry {
                question: q.text.clone(),
                category: q.category,
                skill: q.skill.clone(),
                answer: answer.map(|a| a.content.clone()),
                analysis: answer.and_then(|a| a.analysis.clone()),
            }
        })
        .collect()
}

fn upsert_answer(details: &mut SessionDetails, answer: Answer) {
    match details
        .answers
        .iter_mut()
        .find(|a| a.question_id == answer.question_id)
    {
        Some(existing) => *existing = answer,
        None => details.answers.push(answer),
    }
}

fn next_position(details: &SessionDetails) -> i32 {
    details
        .questions
        .iter()
        .map(|q| q.position)
        .max()
        .map_or(0, |p| p + 1)
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub session: InterviewSession,
    pub questions: Vec<Question>,
    pub question: Question,
    pub progress: Progress,
    pub quota: QuotaStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Next {
        question: Question,
        progress: Progress,
    },
    Completed {
        report: FeedbackReport,
        progress: Progress,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub details: SessionDetails,
    pub progress: Progress,
    pub current_question: Option<Question>,
}

impl From<SessionDetails> for SessionView {
    fn from(details: SessionDetails) -> Self {
        let progress = progress(&details);
        let current_question = current_question(&details).cloned();
        Self {
            details,
            progress,
            current_question,
        }
    }
}

// ============================================================================
// InterviewService
// ============================================================================

type Slot = Arc<AsyncMutex<()>>;

/// Exclusive hold on one session for the length of a transition. The session
/// leaves the active map when the lease drops, so only sessions with a call
/// in flight are held in memory.
struct SessionLease<'a> {
    active: &'a Mutex<HashMap<Uuid, Slot>>,
    session_id: Uuid,
    slot: Slot,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active
            .get(&self.session_id)
            .is_some_and(|slot| Arc::ptr_eq(slot, &self.slot))
        {
            active.remove(&self.session_id);
        }
    }
}

pub struct InterviewService {
    store: Arc<dyn InterviewStore>,
    gateway: Arc<PromptGateway>,
    config: InterviewConfig,
    cache: CacheConfig,
    active: Mutex<HashMap<Uuid, Slot>>,
}

impl InterviewService {
    pub fn new(
        store: Arc<dyn InterviewStore>,
        gateway: Arc<PromptGateway>,
        config: InterviewConfig,
        cache: CacheConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
            cache,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn guard(&self) -> &UsageGuard {
        self.gateway.guard()
    }

    /// Sessions with a transition currently in flight.
    pub fn active_sessions(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Lookup and lock happen under the map lock, so a lease being dropped
    /// can never hand its slot to a second caller.
    fn lease(&self, session_id: Uuid) -> Result<SessionLease<'_>, RehearseError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let slot = active.entry(session_id).or_default().clone();
        let guard = slot.clone().try_lock_owned().map_err(|_| {
            RehearseError::Conflict(format!("session {} is busy", session_id))
        })?;
        Ok(SessionLease {
            active: &self.active,
            session_id,
            slot,
            _guard: guard,
        })
    }

    async fn load(&self, session_id: Uuid) -> Result<SessionDetails, RehearseError> {
        self.store
            .get_session_with_details(session_id)
            .await?
            .ok_or_else(|| RehearseError::NotFound(format!("session {}", session_id)))
    }

    // ========================================================================
    // start
    // ========================================================================

    pub async fn start(
        &self,
        identity: Option<&str>,
        job_description: &str,
    ) -> Result<StartOutcome, RehearseError> {
        let description = job_description.trim();
        let length = description.chars().count();
        if length < self.config.min_job_description_chars {
            return Err(RehearseError::Validation(format!(
                "job description must be at least {} characters",
                self.config.min_job_description_chars
            )));
        }
        if length > self.config.max_job_description_chars {
            return Err(RehearseError::Validation(format!(
                "job description must be at most {} characters",
                self.config.max_job_description_chars
            )));
        }

        let quota_key = identity.unwrap_or(ANONYMOUS_IDENTITY);
        let slot = self
            .guard()
            .acquire_session_slot(quota_key)
            .await
            .map_err(|denied| RehearseError::QuotaExceeded {
                remaining: denied.remaining,
                reset_at: denied.reset_at,
            })?;

        let (session, questions) = match self.open_session(identity, description).await {
            Ok(opened) => opened,
            Err(e) => {
                if let Err(release) = self.guard().release_session_slot(&slot).await {
                    tracing::error!(identity = quota_key, error = %release, "Failed to return unused session start");
                }
                return Err(e);
            }
        };

        let details = SessionDetails {
            session: session.clone(),
            questions: questions.clone(),
            answers: Vec::new(),
            reports: Vec::new(),
        };
        let progress = progress(&details);
        let question = current_question(&details)
            .cloned()
            .ok_or_else(|| RehearseError::Persistence("session has no questions".to_string()))?;

        tracing::info!(
            session_id = %session.id,
            identity = quota_key,
            questions = questions.len(),
            started_today = slot.count,
            "Interview started"
        );

        Ok(StartOutcome {
            session,
            questions,
            question,
            progress,
            quota: self.guard().check_identity_quota(quota_key).await,
        })
    }

    /// Parse the description, pick questions and persist the new session.
    async fn open_session(
        &self,
        identity: Option<&str>,
        description: &str,
    ) -> Result<(InterviewSession, Vec<Question>), RehearseError> {
        let profile = match self.gateway.parse_job_description(None, description).await {
            Ok(profile) => profile,
            Err(GatewayError::ServicePaused) => return Err(RehearseError::ServicePaused),
            Err(e) => {
                tracing::warn!(error = %e, "Job description parsing failed, guessing title and company");
                let (title, company) = gateway::extract_title_and_company(description);
                JobProfile {
                    title,
                    company,
                    ..JobProfile::default()
                }
            }
        };

        let generated = self.initial_questions(description, &profile).await?;

        let job = JobContext {
            description: description.to_string(),
            title: profile.title.clone(),
            company: profile.company.clone(),
            profile: Some(profile),
        };
        let session = self.store.create_session(identity, &job).await?;

        let new_questions: Vec<NewQuestion> = generated
            .into_iter()
            .enumerate()
            .map(|(i, q)| q.into_new(i as i32))
            .collect();
        match self.store.append_questions(session.id, &new_questions).await {
            Ok(saved) => Ok((session, saved)),
            Err(e) => {
                if let Err(cleanup) = self.store.delete_session(session.id).await {
                    tracing::warn!(session_id = %session.id, error = %cleanup, "Failed to remove half-created session");
                }
                Err(e.into())
            }
        }
    }

    async fn initial_questions(
        &self,
        description: &str,
        profile: &JobProfile,
    ) -> Result<Vec<GeneratedQuestion>, RehearseError> {
        let key = gateway::question_cache_key(description);

        if self.cache.enabled {
            let newer_than = Utc::now() - Duration::hours(self.cache.ttl_hours);
            match self.store.cached_questions(&key, newer_than).await {
                Ok(Some(cached)) if cached.len() >= self.config.min_questions => {
                    tracing::info!(count = cached.len(), "Using cached questions");
                    return Ok(cached);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Question cache lookup failed"),
            }
        }

        let questions = self
            .gateway
            .generate_questions(None, profile, self.config.question_count)
            .await?;

        if self.cache.enabled {
            let snippet: String = description.chars().take(CACHE_SNIPPET_CHARS).collect();
            if let Err(e) = self.store.cache_questions(&key, &snippet, &questions).await {
                tracing::warn!(error = %e, "Failed to cache questions");
            }
        }
        Ok(questions)
    }

    // ========================================================================
    // submit_answer
    // ========================================================================

    pub async fn submit_answer(
        &self,
        session_id: Uuid,
        text: &str,
    ) -> Result<SubmitOutcome, RehearseError> {
        let content = text.trim();
        if content.chars().count() < self.config.min_answer_chars {
            return Err(RehearseError::Validation(format!(
                "answer must be at least {} characters",
                self.config.min_answer_chars
            )));
        }

        let _lease = self.lease(session_id)?;
        let mut details = self.load(session_id).await?;
        self.advance(&mut details, content).await
    }

    async fn advance(
        &self,
        details: &mut SessionDetails,
        content: &str,
    ) -> Result<SubmitOutcome, RehearseError> {
        let session_id = details.session.id;
        let stage = derive_stage(details);
        tracing::debug!(session_id = %session_id, ?stage, "Submitting answer");

        match stage {
            Stage::Completed | Stage::Abandoned => Err(RehearseError::Conflict(format!(
                "session {} is no longer in progress",
                session_id
            ))),

            Stage::QuestioningMain(i) => {
                let question = main_questions(details)[i].clone();
                let answer = self.store.append_answer(session_id, question.id, content).await?;
                let answer_id = answer.id;
                upsert_answer(details, answer);

                let analysis = self.analyze(details, &question, content).await;
                if let Some(a) = &analysis {
                    self.store.attach_analysis(answer_id, a).await?;
                    if let Some(stored) = details.answers.iter_mut().find(|a| a.id == answer_id) {
                        stored.analysis = Some(a.clone());
                    }
                }

                let text = match self
                    .gateway
                    .generate_follow_up(Some(session_id), &question.text, content, analysis.as_ref())
                    .await
                {
                    Ok(text) if !text.trim().is_empty() => text,
                    Ok(_) => FALLBACK_FOLLOW_UP.to_string(),
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "Follow-up generation failed, using fallback");
                        FALLBACK_FOLLOW_UP.to_string()
                    }
                };

                let follow_up = NewQuestion::follow_up(text, &question, next_position(details));
                let saved = self.store.append_questions(session_id, &[follow_up]).await?;
                details.questions.extend(saved);

                self.next_outcome(details)
            }

            Stage::AwaitingFollowUp(i) => {
                let mains = main_questions(details);
                let is_last = i + 1 == mains.len();
                let follow_up = mains
                    .get(i)
                    .and_then(|m| follow_up_of(details, m.id))
                    .cloned()
                    .ok_or_else(|| RehearseError::Persistence("follow-up question missing".into()))?;

                let answer = self.store.append_answer(session_id, follow_up.id, content).await?;
                upsert_answer(details, answer);

                if is_last {
                    let pair = match self.gateway.generate_final_pair(Some(session_id)).await {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(session_id = %session_id, error = %e, "Final pair unavailable, using curated pair");
                            FinalPair::fallback()
                        }
                    };
                    let position = next_position(details);
                    let finals = [
                        NewQuestion::closing(pair.classic, "Motivation", position),
                        NewQuestion::closing(pair.curveball, "Personality", position + 1),
                    ];
                    let saved = self.store.append_questions(session_id, &finals).await?;
                    details.questions.extend(saved);
                }

                self.next_outcome(details)
            }

            Stage::QuestioningFinal(j) => {
                let finals = final_questions(details);
                let is_last = j + 1 == finals.len();
                let question = finals[j].clone();

                let answer = self.store.append_answer(session_id, question.id, content).await?;
                upsert_answer(details, answer);

                if !is_last {
                    return self.next_outcome(details);
                }

                let report = self.write_report(details).await?;
                let session = self.store.mark_completed(session_id).await?;
                details.session = session;
                details.reports.push(report.clone());

                tracing::info!(
                    session_id = %session_id,
                    score = report.overall_score,
                    "Interview completed"
                );
                Ok(SubmitOutcome::Completed {
                    report,
                    progress: progress(details),
                })
            }
        }
    }

    fn next_outcome(&self, details: &SessionDetails) -> Result<SubmitOutcome, RehearseError> {
        let question = current_question(details)
            .cloned()
            .ok_or_else(|| RehearseError::Persistence("no next question after transition".into()))?;
        Ok(SubmitOutcome::Next {
            question,
            progress: progress(details),
        })
    }

    /// Optional: failures leave the answer without analysis.
    async fn analyze(
        &self,
        details: &SessionDetails,
        question: &Question,
        content: &str,
    ) -> Option<rehearse_core::models::AnswerAnalysis> {
        if !self.config.analyze_answers {
            return None;
        }
        let profile = details.session.job.profile_or_minimal();
        match self
            .gateway
            .analyze_answer(
                Some(details.session.id),
                &question.text,
                question.category,
                &question.skill,
                content,
                &profile,
            )
            .await
        {
            Ok(analysis) => Some(analysis),
            Err(e) => {
                tracing::warn!(session_id = %details.session.id, error = %e, "Answer analysis failed");
                None
            }
        }
    }

    /// Required: any gateway failure fails the calling transition.
    async fn write_report(&self, details: &SessionDetails) -> Result<FeedbackReport, RehearseError> {
        let job = &details.session.job;
        let draft = self
            .gateway
            .generate_report(
                Some(details.session.id),
                &job.description,
                &job.profile_or_minimal(),
                &transcript(details),
            )
            .await?;
        Ok(self.store.create_report(details.session.id, &draft).await?)
    }

    // ========================================================================
    // Other operations
    // ========================================================================

    pub async fn abandon(&self, session_id: Uuid) -> Result<InterviewSession, RehearseError> {
        let _lease = self.lease(session_id)?;
        let session = self.store.mark_abandoned(session_id).await?;
        tracing::info!(session_id = %session_id, "Interview abandoned");
        Ok(session)
    }

    /// Append a new report version for a completed session.
    pub async fn regenerate_report(&self, session_id: Uuid) -> Result<FeedbackReport, RehearseError> {
        let _lease = self.lease(session_id)?;
        let details = self.load(session_id).await?;
        if details.session.status != SessionStatus::Completed {
            return Err(RehearseError::Conflict(format!(
                "session {} is not completed",
                session_id
            )));
        }
        let report = self.write_report(&details).await?;
        tracing::info!(session_id = %session_id, version = report.version, "Report regenerated");
        Ok(report)
    }

    pub async fn get(&self, session_id: Uuid) -> Result<SessionView, RehearseError> {
        Ok(self.load(session_id).await?.into())
    }

    pub async fn list(&self, identity: Option<&str>) -> Result<Vec<InterviewSession>, RehearseError> {
        Ok(self.store.list_sessions_for_identity(identity).await?)
    }

    /// Idempotent: `false` when nothing was there to delete.
    pub async fn delete(&self, session_id: Uuid) -> Result<bool, RehearseError> {
        let _lease = self.lease(session_id)?;
        let deleted = self.store.delete_session(session_id).await?;
        if deleted {
            tracing::info!(session_id = %session_id, "Session deleted");
        }
        Ok(deleted)
    }
}

// ============================================================================
// TESTS
// ============================================================================
