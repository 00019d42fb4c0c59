use serde::{Deserialize, Serialize};

/// Structured view of a job description, as extracted by the completion provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct JobProfile {
    pub title: String,
    pub company: String,
    pub required_skills: Vec<String>,
    pub preferred_skills: Vec<String>,
    pub responsibilities: Vec<String>,
    pub qualifications: Vec<String>,
    pub company_values: Vec<String>,
}

/// Job context stored on a session (`interview_sessions.job_data`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobContext {
    pub description: String,
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub profile: Option<JobProfile>,
}

impl JobContext {
    /// Profile to feed into prompts; falls back to title/company only.
    pub fn profile_or_minimal(&self) -> JobProfile {
        self.profile.clone().unwrap_or_else(|| JobProfile {
            title: self.title.clone(),
            company: self.company.clone(),
            ..JobProfile::default()
        })
    }
}
