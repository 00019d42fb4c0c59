//! Danger-zone detection
//!
//! Local rules run over an answer analysis to flag gaps an interviewer would
//! treat as red flags. Pure functions, no provider calls.

use crate::models::{
    AnswerAnalysis, DangerKind, DangerZone, JobProfile, QuestionCategory, Severity,
};

/// Analyses scoring below this on a situational question are flagged.
const SITUATIONAL_SCORE_FLOOR: f64 = 6.0;
const VAGUENESS_MARKERS: [&str; 3] = ["specific", "example", "detail"];

/// Flag danger zones for one answer.
pub fn detect_danger_zones(
    category: QuestionCategory,
    skill: &str,
    answer: &str,
    analysis: &AnswerAnalysis,
    job: &JobProfile,
) -> Vec<DangerZone> {
    let mut zones = Vec::new();
    let skill_lower = skill.trim().to_lowercase();

    match category {
        QuestionCategory::Technical => {
            let required = job.required_skills.iter().any(|s| {
                let s = s.trim().to_lowercase();
                !s.is_empty()
                    && !skill_lower.is_empty()
                    && (skill_lower.contains(&s) || s.contains(&skill_lower))
            });
            if required && !analysis.missing_competencies.is_empty() {
                zones.push(DangerZone {
                    kind: DangerKind::MissingRequiredSkill,
                    skill: skill.to_string(),
                    severity: Severity::High,
                    description: format!(
                        "Missing demonstration of {} which is a required skill for this role.",
                        skill
                    ),
                });
            }
        }
        QuestionCategory::Behavioral => {
            let vague = analysis.weaknesses.iter().any(|w| {
                let w = w.to_lowercase();
                VAGUENESS_MARKERS.iter().any(|m| w.contains(m))
            });
            if vague {
                zones.push(DangerZone {
                    kind: DangerKind::VagueResponse,
                    skill: skill.to_string(),
                    severity: Severity::Medium,
                    description: "Response lacks specific examples or details that demonstrate the competency."
                        .to_string(),
                });
            }
        }
        QuestionCategory::Situational => {
            if analysis.score < SITUATIONAL_SCORE_FLOOR {
                zones.push(DangerZone {
                    kind: DangerKind::PoorSituationalJudgment,
                    skill: skill.to_string(),
                    severity: Severity::High,
                    description: "Response indicates potential issues with situational judgment in this area."
                        .to_string(),
                });
            }
        }
        QuestionCategory::General => {}
    }

    let values: Vec<String> = job
        .company_values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    if !values.is_empty() {
        let answer_lower = answer.to_lowercase();
        if !values.iter().any(|v| answer_lower.contains(v.as_str())) {
            zones.push(DangerZone {
                kind: DangerKind::ValueMisalignment,
                skill: "Company Culture".to_string(),
                severity: Severity::Medium,
                description: "Response does not demonstrate alignment with company values."
                    .to_string(),
            });
        }
    }

    zones
}

/// 0–10, higher is more concerning.
pub fn danger_score(zones: &[DangerZone]) -> f64 {
    if zones.is_empty() {
        return 0.0;
    }
    let total: f64 = zones.iter().map(|z| z.severity.weight()).sum();
    let max = zones.len() as f64 * Severity::High.weight();
    (total / max * 10.0).min(10.0)
}

pub fn highest_severity<'a>(zones: impl IntoIterator<Item = &'a DangerZone>) -> Option<Severity> {
    zones.into_iter().map(|z| z.severity).max()
}

/// Follow-up question aimed at the given zone.
pub fn targeted_follow_up(zone: &DangerZone) -> String {
    match zone.kind {
        DangerKind::MissingRequiredSkill => format!(
            "Could you share a specific example of how you've used {} in a previous role? \
             I'm particularly interested in your hands-on experience.",
            zone.skill
        ),
        DangerKind::VagueResponse => format!(
            "I'd like to dive deeper into a specific example. Can you walk me through a situation \
             where you demonstrated {}, including the context, your actions, and the outcome?",
            zone.skill
        ),
        DangerKind::PoorSituationalJudgment => {
            "Let's explore this scenario further. If you encountered resistance or complications \
             in this situation, how would you adapt your approach?"
                .to_string()
        }
        DangerKind::ValueMisalignment => {
            "Culture matters a lot to us. Could you share an example of how you've demonstrated \
             our company values in your previous work?"
                .to_string()
        }
    }
}
