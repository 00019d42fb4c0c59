use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn weight(self) -> f64 {
        match self {
            Severity::Low => 1.0,
            Severity::Medium => 2.0,
            Severity::High => 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerKind {
    MissingRequiredSkill,
    VagueResponse,
    PoorSituationalJudgment,
    ValueMisalignment,
}

/// A flagged gap in a candidate's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DangerZone {
    pub kind: DangerKind,
    pub skill: String,
    pub severity: Severity,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerAnalysis {
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub missing_competencies: Vec<String>,
    /// 1–10
    pub score: f64,
    pub needs_follow_up: bool,
    #[serde(default)]
    pub danger_zones: Vec<DangerZone>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub id: Uuid,
    pub session_id: Uuid,
    pub question_id: Uuid,
    pub content: String,
    pub analysis: Option<AnswerAnalysis>,
    pub created_at: DateTime<Utc>,
}
