//! Usage guard — spend circuit breaker and per-identity daily quotas
//!
//! Every check fails closed: a store error denies the call rather than letting
//! it through.

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use uuid::Uuid;

use crate::config::UsageConfig;
use crate::models::{QuotaStatus, TokenUsage, WarningLevel};
use crate::store::{StoreError, UsageStore};

/// Bytes of audio per token-equivalent bucket.
const AUDIO_BYTES_PER_BUCKET: u64 = 32_000;
/// Token-equivalents charged per bucket.
const AUDIO_TOKENS_PER_BUCKET: u64 = 100;

/// A session start counted against one identity's day.
#[derive(Debug, Clone)]
pub struct SessionSlot {
    identity: String,
    day: NaiveDate,
    pub count: u32,
}

#[derive(Clone)]
pub struct UsageGuard {
    store: Arc<dyn UsageStore>,
    config: UsageConfig,
}

impl UsageGuard {
    pub fn new(store: Arc<dyn UsageStore>, config: UsageConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &UsageConfig {
        &self.config
    }

    /// `true` while outbound model calls are allowed.
    pub async fn check_global_gate(&self) -> bool {
        match self.store.read_gate().await {
            Ok(open) => open,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read usage gate, treating as closed");
                false
            }
        }
    }

    pub async fn check_identity_quota(&self, identity: &str) -> QuotaStatus {
        let now = Utc::now();
        let reset_at = self.next_reset(now);
        let max = self.config.max_sessions_per_day;

        match self.store.session_count(identity, self.day_of(now)).await {
            Ok(count) => {
                let remaining = max.saturating_sub(count);
                QuotaStatus {
                    allowed: count < max,
                    remaining,
                    reset_at,
                    warning: warning_for(remaining),
                }
            }
            Err(e) => {
                tracing::warn!(identity, error = %e, "Failed to read session count, denying");
                denied(reset_at)
            }
        }
    }

    /// Reserve one of today's session starts for `identity`. The check and the
    /// increment are a single store call, so concurrent starts cannot overshoot
    /// the limit. A full day or an unreachable store both deny.
    pub async fn acquire_session_slot(&self, identity: &str) -> Result<SessionSlot, QuotaStatus> {
        let now = Utc::now();
        let day = self.day_of(now);
        let max = self.config.max_sessions_per_day;

        match self.store.try_acquire_session(identity, day, max).await {
            Ok(Some(count)) => {
                tracing::debug!(identity, count, "Reserved session start");
                Ok(SessionSlot {
                    identity: identity.to_string(),
                    day,
                    count,
                })
            }
            Ok(None) => {
                tracing::info!(identity, max, "Session quota exhausted");
                Err(denied(self.next_reset(now)))
            }
            Err(e) => {
                tracing::warn!(identity, error = %e, "Failed to reserve session start, denying");
                Err(denied(self.next_reset(now)))
            }
        }
    }

    /// Hand a reserved start back when the session was never created.
    pub async fn release_session_slot(&self, slot: &SessionSlot) -> Result<(), StoreError> {
        self.store.release_session(&slot.identity, slot.day).await?;
        tracing::debug!(identity = %slot.identity, "Released session start");
        Ok(())
    }

    /// Append a ledger row and close the gate once cumulative spend reaches the ceiling.
    pub async fn record_token_spend(
        &self,
        operation: &str,
        session_id: Option<Uuid>,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Result<f64, StoreError> {
        let cost_usd = self.cost_of(prompt_tokens, completion_tokens);
        let usage = TokenUsage {
            operation: operation.to_string(),
            session_id,
            prompt_tokens,
            completion_tokens,
            cost_usd,
        };

        let total = self.store.record_usage(&usage).await?;
        tracing::debug!(operation, prompt_tokens, completion_tokens, cost_usd, total, "Token spend");

        if total >= self.config.spend_ceiling_usd {
            tracing::error!(
                total,
                ceiling = self.config.spend_ceiling_usd,
                "Spend ceiling reached, closing usage gate"
            );
            self.store.write_gate(false).await?;
        }
        Ok(total)
    }

    pub fn cost_of(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        prompt_tokens as f64 * self.config.prompt_token_cost_usd
            + completion_tokens as f64 * self.config.completion_token_cost_usd
    }

    fn offset(&self) -> FixedOffset {
        let hours = self.config.reset_utc_offset_hours.clamp(-23, 23);
        FixedOffset::east_opt(hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    fn day_of(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset()).date_naive()
    }

    /// Next midnight in the reference offset, as UTC.
    fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let offset = self.offset();
        let tomorrow = self.day_of(now) + Duration::days(1);
        let midnight = tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default();
        offset
            .from_local_datetime(&midnight)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now + Duration::days(1))
    }
}

fn denied(reset_at: DateTime<Utc>) -> QuotaStatus {
    QuotaStatus {
        allowed: false,
        remaining: 0,
        reset_at,
        warning: WarningLevel::Hard,
    }
}

fn warning_for(remaining: u32) -> WarningLevel {
    match remaining {
        0 | 1 => WarningLevel::Hard,
        2 => WarningLevel::Soft,
        _ => WarningLevel::None,
    }
}

/// Token equivalents charged for an audio upload of `bytes`.
pub fn estimate_audio_tokens(bytes: usize) -> u32 {
    let buckets = (bytes as u64).div_ceil(AUDIO_BYTES_PER_BUCKET);
    (buckets * AUDIO_TOKENS_PER_BUCKET).min(u32::MAX as u64) as u32
}
