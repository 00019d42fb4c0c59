//! Prompt gateway — typed operations over the completion provider
//!
//! Each operation checks the usage gate, builds its prompt, calls the
//! provider, records token spend and parses the reply. Malformed output is
//! absorbed into defaults; only the minimum question count is a hard failure.

use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{LlmConfig, OperationConfig};
use crate::danger;
use crate::llm::{CompletionProvider, CompletionRequest, ProviderError};
use crate::models::{
    AnswerAnalysis, Difficulty, GeneratedQuestion, JobProfile, QuestionCategory,
    QuestionFeedback, ReportDraft, RiskLevel,
};
use crate::prompts::{self, Prompt, TranscriptEntry};
use crate::usage::UsageGuard;

pub const UNKNOWN_POSITION: &str = "Unknown Position";
pub const UNKNOWN_COMPANY: &str = "Unknown Company";
pub const FALLBACK_FOLLOW_UP: &str =
    "Could you elaborate more on your experience with this specific area?";

/// Scores missing from an analysis default to the midpoint.
const DEFAULT_ANALYSIS_SCORE: f64 = 5.0;

const FOLLOW_UP_PREFIXES: [&str; 6] = [
    "follow-up question:",
    "follow up question:",
    "follow-up:",
    "interviewer:",
    "question:",
    "q:",
];

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Service paused: usage limits exceeded")]
    ServicePaused,

    #[error("Provider call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Provider returned {actual} usable items, expected at least {expected}")]
    InsufficientContent { expected: usize, actual: usize },
}

/// Closing questions issued after the main stage.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FinalPair {
    pub classic: String,
    pub curveball: String,
}

impl FinalPair {
    /// Curated pair used whenever generation or parsing fails.
    pub fn fallback() -> Self {
        Self {
            classic: "Why do you want to work here, and why is this the right next step for you?"
                .to_string(),
            curveball: "If you could instantly master one skill unrelated to your job, \
                        what would it be and why?"
                .to_string(),
        }
    }
}

pub struct PromptGateway {
    provider: Arc<dyn CompletionProvider>,
    guard: UsageGuard,
    config: LlmConfig,
    min_questions: usize,
}

impl PromptGateway {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        guard: UsageGuard,
        config: LlmConfig,
        min_questions: usize,
    ) -> Self {
        Self {
            provider,
            guard,
            config,
            min_questions,
        }
    }

    pub fn guard(&self) -> &UsageGuard {
        &self.guard
    }

    async fn call(
        &self,
        operation: &str,
        settings: &OperationConfig,
        prompt: Prompt,
        json_mode: bool,
        session_id: Option<Uuid>,
    ) -> Result<String, GatewayError> {
        if !self.guard.check_global_gate().await {
            tracing::warn!(operation, "Usage gate closed, refusing provider call");
            return Err(GatewayError::ServicePaused);
        }

        let request = CompletionRequest {
            model: settings.model.clone(),
            system: prompt.system,
            user: prompt.user,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            json_mode,
        };

        let completion = self.provider.complete(request).await.map_err(|e| {
            tracing::error!(operation, provider = self.provider.name(), error = %e, "Provider call failed");
            GatewayError::from(e)
        })?;

        if let Err(e) = self
            .guard
            .record_token_spend(
                operation,
                session_id,
                completion.prompt_tokens,
                completion.completion_tokens,
            )
            .await
        {
            tracing::warn!(operation, error = %e, "Failed to record token spend");
        }

        Ok(completion.text)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub async fn parse_job_description(
        &self,
        session_id: Option<Uuid>,
        description: &str,
    ) -> Result<JobProfile, GatewayError> {
        let text = self
            .call(
                "parse_job_description",
                &self.config.parse_job,
                prompts::parse_job_description(description),
                true,
                session_id,
            )
            .await?;

        let value = parse_json_object(&text).unwrap_or_else(|| {
            tracing::warn!("Job description reply was not JSON, using defaults");
            Value::Null
        });
        Ok(job_profile_from_value(&value))
    }

    pub async fn generate_questions(
        &self,
        session_id: Option<Uuid>,
        job: &JobProfile,
        count: usize,
    ) -> Result<Vec<GeneratedQuestion>, GatewayError> {
        let text = self
            .call(
                "generate_questions",
                &self.config.questions,
                prompts::generate_questions(job, count),
                true,
                session_id,
            )
            .await?;

        let mut questions = questions_from_text(&text);
        if questions.len() < self.min_questions {
            tracing::warn!(
                expected = self.min_questions,
                actual = questions.len(),
                "Too few usable questions in provider reply"
            );
            return Err(GatewayError::InsufficientContent {
                expected: self.min_questions,
                actual: questions.len(),
            });
        }
        questions.truncate(count.max(self.min_questions));
        Ok(questions)
    }

    /// Score an answer and flag danger zones against the job profile.
    pub async fn analyze_answer(
        &self,
        session_id: Option<Uuid>,
        question: &str,
        category: QuestionCategory,
        skill: &str,
        answer: &str,
        job: &JobProfile,
    ) -> Result<AnswerAnalysis, GatewayError> {
        let text = self
            .call(
                "analyze_answer",
                &self.config.analysis,
                prompts::analyze_answer(question, category, skill, answer, job),
                true,
                session_id,
            )
            .await?;

        let value = parse_json_object(&text).unwrap_or(Value::Null);
        let mut analysis = analysis_from_value(&value);
        analysis.danger_zones =
            danger::detect_danger_zones(category, skill, answer, &analysis, job);
        Ok(analysis)
    }

    /// A probing question for the given answer. Danger zones in `analysis`
    /// take precedence over a generated question.
    pub async fn generate_follow_up(
        &self,
        session_id: Option<Uuid>,
        question: &str,
        answer: &str,
        analysis: Option<&AnswerAnalysis>,
    ) -> Result<String, GatewayError> {
        if let Some(zone) = analysis.and_then(|a| a.danger_zones.first()) {
            tracing::debug!(kind = ?zone.kind, "Using targeted follow-up for danger zone");
            return Ok(danger::targeted_follow_up(zone));
        }

        let text = self
            .call(
                "generate_follow_up",
                &self.config.follow_up,
                prompts::generate_follow_up(question, answer, analysis),
                false,
                session_id,
            )
            .await?;

        Ok(clean_follow_up(&text).unwrap_or_else(|| FALLBACK_FOLLOW_UP.to_string()))
    }

    pub async fn generate_final_pair(
        &self,
        session_id: Option<Uuid>,
    ) -> Result<FinalPair, GatewayError> {
        let text = match self
            .call(
                "generate_final_pair",
                &self.config.final_pair,
                prompts::generate_final_pair(),
                false,
                session_id,
            )
            .await
        {
            Ok(text) => text,
            Err(GatewayError::ServicePaused) => return Err(GatewayError::ServicePaused),
            Err(e) => {
                tracing::warn!(error = %e, "Final pair generation failed, using curated pair");
                return Ok(FinalPair::fallback());
            }
        };

        Ok(parse_final_pair(&text).unwrap_or_else(|| {
            tracing::warn!("Could not parse final pair, using curated pair");
            FinalPair::fallback()
        }))
    }

    pub async fn generate_report(
        &self,
        session_id: Option<Uuid>,
        job_description: &str,
        job: &JobProfile,
        transcript: &[TranscriptEntry],
    ) -> Result<ReportDraft, GatewayError> {
        let text = self
            .call(
                "generate_report",
                &self.config.report,
                prompts::generate_report(job_description, job, transcript),
                true,
                session_id,
            )
            .await?;

        let value = first_balanced_object(&text)
            .and_then(|span| serde_json::from_str::<Value>(span).ok())
            .unwrap_or_else(|| {
                tracing::warn!("Report reply had no JSON object, building report from analyses");
                Value::Null
            });
        Ok(report_from_value(&value, transcript))
    }
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Regex-based title/company guess used when structured parsing is unavailable.
pub fn extract_title_and_company(text: &str) -> (String, String) {
    let title = Regex::new(r"(?i)\b(?:Role|Position):?\s*(.+)")
        .ok()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Custom Role".to_string());

    let company = Regex::new(r"\b(?:at|for)\s+([A-Z][a-zA-Z0-9& ]+)")
        .ok()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Company Name".to_string());

    (title, company)
}

/// Cache key for a job description: SHA-256 of the trimmed, lowercased text.
pub fn question_cache_key(description: &str) -> String {
    let normalised = description.trim().to_lowercase();
    hex::encode(Sha256::digest(normalised.as_bytes()))
}

/// First complete `{...}` span, honouring string literals and escapes.
pub fn first_balanced_object(text: &str) -> Option<&str> {
    first_balanced(text, '{', '}')
}

fn first_balanced(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_json_object(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text.trim())
        .ok()
        .filter(Value::is_object)
        .or_else(|| {
            first_balanced_object(text).and_then(|span| serde_json::from_str(span).ok())
        })
}

/// First of `keys` present on `value` as a non-empty string.
fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .filter_map(Value::as_str)
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
}

/// First of `keys` present on `value` as a list; a bare string becomes a one-item list.
fn string_list(value: &Value, keys: &[&str]) -> Vec<String> {
    for key in keys {
        match value.get(*key) {
            Some(Value::Array(items)) => {
                return items
                    .iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s.trim().to_string()),
                        Value::Null => None,
                        other => Some(other.to_string()),
                    })
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            Some(Value::String(s)) if !s.trim().is_empty() => return vec![s.trim().to_string()],
            _ => {}
        }
    }
    Vec::new()
}

fn number_field(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|k| value.get(*k)).find_map(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches("/100").trim_end_matches("/10").trim().parse().ok(),
        _ => None,
    })
}

fn bool_field(value: &Value, keys: &[&str]) -> Option<bool> {
    keys.iter().filter_map(|k| value.get(*k)).find_map(|v| match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

pub fn job_profile_from_value(value: &Value) -> JobProfile {
    JobProfile {
        title: string_field(value, &["title", "jobTitle", "job_title"])
            .unwrap_or_else(|| UNKNOWN_POSITION.to_string()),
        company: string_field(value, &["company", "companyName", "company_name"])
            .unwrap_or_else(|| UNKNOWN_COMPANY.to_string()),
        required_skills: string_list(value, &["required_skills", "requiredSkills"]),
        preferred_skills: string_list(value, &["preferred_skills", "preferredSkills"]),
        responsibilities: string_list(value, &["responsibilities"]),
        qualifications: string_list(value, &["qualifications"]),
        company_values: string_list(value, &["company_values", "companyValues"]),
    }
}

pub fn questions_from_text(text: &str) -> Vec<GeneratedQuestion> {
    let value = serde_json::from_str::<Value>(text.trim())
        .ok()
        .or_else(|| {
            first_balanced(text, '[', ']').and_then(|span| serde_json::from_str(span).ok())
        })
        .or_else(|| first_balanced_object(text).and_then(|span| serde_json::from_str(span).ok()));

    let items = match value {
        Some(Value::Array(items)) => items,
        Some(Value::Object(mut map)) => match map.remove("questions") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| {
            let text = match item {
                Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
                other => string_field(other, &["text", "question"]),
            }?;
            Some((item, text))
        })
        .enumerate()
        .map(|(i, (item, text))| GeneratedQuestion {
            id: string_field(item, &["id"]).unwrap_or_else(|| format!("q{}", i + 1)),
            text,
            category: string_field(item, &["category", "type"])
                .and_then(|s| QuestionCategory::parse_lenient(&s))
                .unwrap_or(QuestionCategory::Technical),
            skill: string_field(item, &["skill"]).unwrap_or_else(|| "General".to_string()),
            difficulty: string_field(item, &["difficulty"])
                .and_then(|s| Difficulty::parse_lenient(&s))
                .unwrap_or(Difficulty::Medium),
        })
        .collect()
}

pub fn analysis_from_value(value: &Value) -> AnswerAnalysis {
    AnswerAnalysis {
        strengths: string_list(value, &["strengths"]),
        weaknesses: string_list(value, &["weaknesses"]),
        missing_competencies: string_list(value, &["missing_competencies", "missingCompetencies"]),
        score: number_field(value, &["score"])
            .filter(|s| s.is_finite())
            .unwrap_or(DEFAULT_ANALYSIS_SCORE)
            .clamp(1.0, 10.0),
        needs_follow_up: bool_field(value, &["needs_follow_up", "needsFollowUp"]).unwrap_or(false),
        danger_zones: Vec::new(),
    }
}

/// Strip label prefixes and wrapping quotes; `None` when nothing usable remains.
pub fn clean_follow_up(text: &str) -> Option<String> {
    let mut line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())?
        .to_string();

    loop {
        let lower = line.to_lowercase();
        let Some(prefix) = FOLLOW_UP_PREFIXES.iter().find(|p| lower.starts_with(*p)) else {
            break;
        };
        line = line[prefix.len()..].trim().to_string();
    }

    let trimmed = line
        .trim_matches(|c| matches!(c, '"' | '\'' | '\u{201c}' | '\u{201d}' | '*'))
        .trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Parse a numbered `1.` / `2.` list into a pair. Both markers must start a
/// line, so numbers inside a question ("Web 2.0") are left alone.
pub fn parse_final_pair(text: &str) -> Option<FinalPair> {
    let re = Regex::new(r"(?ms)^\s*1[.)]\s*(.+?)\s*^\s*2[.)]\s*(.+)").ok()?;
    let caps = re.captures(text.trim())?;
    let classic = caps.get(1)?.as_str().trim().to_string();
    let curveball = caps
        .get(2)?
        .as_str()
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if classic.is_empty() || curveball.is_empty() {
        return None;
    }
    Some(FinalPair { classic, curveball })
}

/// Scores at or below 10 are read as a 0–10 scale and lifted to 0–100.
pub fn normalise_score(raw: f64) -> f64 {
    let scaled = if raw <= 10.0 { raw * 10.0 } else { raw };
    scaled.clamp(0.0, 100.0)
}

/// Mean analysis score across the transcript on the 0–100 scale.
pub fn mean_analysis_score(transcript: &[TranscriptEntry]) -> Option<f64> {
    let scores: Vec<f64> = transcript
        .iter()
        .filter_map(|e| e.analysis.as_ref().map(|a| a.score))
        .collect();
    if scores.is_empty() {
        return None;
    }
    Some(scores.iter().sum::<f64>() / scores.len() as f64 * 10.0)
}

pub fn report_from_value(value: &Value, transcript: &[TranscriptEntry]) -> ReportDraft {
    let question_feedback: Vec<QuestionFeedback> = match value
        .get("questionFeedback")
        .or_else(|| value.get("question_feedback"))
    {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                let mut improvements = string_list(item, &["improvements", "weaknesses"]);
                if improvements.is_empty() {
                    improvements = string_list(item, &["improvement"]);
                }
                QuestionFeedback {
                    question: string_field(item, &["question"]).unwrap_or_default(),
                    score: number_field(item, &["score"]).map(normalise_score).unwrap_or(0.0),
                    strengths: string_list(item, &["strengths"]),
                    improvements,
                }
            })
            .collect(),
        _ => Vec::new(),
    };

    let overall_score = match number_field(value, &["overallScore", "overall_score"]) {
        Some(raw) if raw.is_finite() => normalise_score(raw),
        _ => mean_analysis_score(transcript).unwrap_or(0.0),
    };

    let local_zones: Vec<_> = transcript
        .iter()
        .filter_map(|e| e.analysis.as_ref())
        .flat_map(|a| a.danger_zones.iter())
        .collect();

    let mut danger_zones = string_list(value, &["dangerZones", "danger_zones"]);
    for zone in &local_zones {
        if !danger_zones.contains(&zone.description) {
            danger_zones.push(zone.description.clone());
        }
    }

    let danger_zone_risk = string_field(value, &["dangerZoneRisk", "danger_zone_risk"])
        .and_then(|s| RiskLevel::parse_lenient(&s))
        .or_else(|| danger::highest_severity(local_zones.iter().copied()).map(RiskLevel::from));

    ReportDraft {
        overall_score,
        summary: string_field(value, &["overallFeedback", "summary", "overall_feedback"])
            .unwrap_or_else(|| format!("Overall performance score: {:.0}/100", overall_score)),
        strengths: string_list(value, &["keyStrengths", "strengths", "key_strengths"]),
        areas_for_improvement: string_list(
            value,
            &["areasForImprovement", "areas_for_improvement"],
        ),
        danger_zones,
        danger_zone_risk,
        question_feedback,
        next_steps: string_list(value, &["nextSteps", "next_steps"]),
    }
}

// ============================================================================
// TESTS
// ============================================================================
