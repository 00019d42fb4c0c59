use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    None,
    Soft,
    Hard,
}

/// Result of a per-identity quota check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub warning: WarningLevel,
}

/// One row of the token-spend ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub operation: String,
    pub session_id: Option<Uuid>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
}
