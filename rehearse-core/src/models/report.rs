use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "moderate" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl From<Severity> for RiskLevel {
    fn from(s: Severity) -> Self {
        match s {
            Severity::Low => RiskLevel::Low,
            Severity::Medium => RiskLevel::Medium,
            Severity::High => RiskLevel::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QuestionFeedback {
    pub question: String,
    /// 0–100
    pub score: f64,
    pub strengths: Vec<String>,
    pub improvements: Vec<String>,
}

/// Report content produced by the gateway, before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDraft {
    /// 0–100
    pub overall_score: f64,
    pub summary: String,
    pub strengths: Vec<String>,
    pub areas_for_improvement: Vec<String>,
    pub danger_zones: Vec<String>,
    pub danger_zone_risk: Option<RiskLevel>,
    pub question_feedback: Vec<QuestionFeedback>,
    pub next_steps: Vec<String>,
}

/// Persisted report. Regeneration appends a new `version`; rows are never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackReport {
    pub id: Uuid,
    pub session_id: Uuid,
    pub version: i32,
    pub overall_score: f64,
    pub summary: String,
    pub strengths: Vec<String>,
    pub areas_for_improvement: Vec<String>,
    pub danger_zones: Vec<String>,
    pub danger_zone_risk: Option<RiskLevel>,
    pub question_feedback: Vec<QuestionFeedback>,
    pub next_steps: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl FeedbackReport {
    pub fn from_draft(session_id: Uuid, version: i32, draft: ReportDraft) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            version,
            overall_score: draft.overall_score,
            summary: draft.summary,
            strengths: draft.strengths,
            areas_for_improvement: draft.areas_for_improvement,
            danger_zones: draft.danger_zones,
            danger_zone_risk: draft.danger_zone_risk,
            question_feedback: draft.question_feedback,
            next_steps: draft.next_steps,
            created_at: Utc::now(),
        }
    }
}
