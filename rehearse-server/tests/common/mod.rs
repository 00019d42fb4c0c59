//! Shared fixtures for server integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rehearse_core::config::{CacheConfig, InterviewConfig, LlmConfig, UsageConfig};
use rehearse_core::{
    Completion, CompletionProvider, CompletionRequest, MemoryStore, PromptGateway, ProviderError,
    UsageGuard,
};
use rehearse_server::subsystems::interview::InterviewService;

pub const JOB_DESCRIPTION: &str = "Position: Senior Rust Engineer at Initech. \
    You will build low-latency services in Rust, run them on Kubernetes and mentor the team.";

pub const PROFILE_REPLY: &str = r#"{
    "title": "Senior Rust Engineer",
    "company": "Initech",
    "required_skills": ["Rust", "Kubernetes"],
    "preferred_skills": ["Mentoring"],
    "responsibilities": ["Build low-latency services"],
    "qualifications": ["5+ years of backend work"],
    "company_values": []
}"#;

pub const QUESTIONS_REPLY: &str = r#"{"questions": [
    {"id": "q1", "text": "How do you avoid allocations on a hot path in Rust?", "category": "technical", "skill": "Rust", "difficulty": "hard"},
    {"id": "q2", "text": "Tell me about a time you mentored a struggling teammate.", "category": "behavioral", "skill": "Mentoring", "difficulty": "medium"},
    {"id": "q3", "text": "A deploy doubles p99 latency. What do you do first?", "category": "situational", "skill": "Incident response", "difficulty": "medium"}
]}"#;

pub const ANALYSIS_REPLY: &str = r#"{
    "strengths": ["Clear structure"],
    "weaknesses": ["Could quantify impact"],
    "missing_competencies": [],
    "score": 8,
    "needs_follow_up": true
}"#;

pub const FOLLOW_UP_REPLY: &str = "Follow-up question: \"How did you measure the result?\"";

pub const FINAL_PAIR_REPLY: &str =
    "1. Why do you want to work at Initech?\n2. If you were a data structure, which one would you be?";

pub const REPORT_REPLY: &str = r#"Here is the feedback:
{
    "overallScore": 82,
    "overallFeedback": "Strong technical depth with room to tighten stories.",
    "keyStrengths": ["Rust performance knowledge", "Calm incident handling"],
    "areasForImprovement": ["Quantify outcomes"],
    "dangerZones": [],
    "dangerZoneRisk": "Low",
    "questionFeedback": [
        {"question": "How do you avoid allocations on a hot path in Rust?", "score": 9, "strengths": ["Arena allocation"], "improvements": []}
    ],
    "nextSteps": ["Practice STAR stories"]
}"#;

/// The gateway operation a request belongs to, judged from its system prompt.
pub fn operation_of(request: &CompletionRequest) -> &'static str {
    let system = request.system.as_str();
    if system.contains("job description analyzer") {
        "parse_job_description"
    } else if system.contains("creates relevant") {
        "generate_questions"
    } else if system.contains("interview evaluator") {
        "analyze_answer"
    } else if system.contains("follow-up") {
        "generate_follow_up"
    } else if system.contains("job interview expert") {
        "generate_final_pair"
    } else if system.contains("interview coach") {
        "generate_report"
    } else {
        "unknown"
    }
}

/// Answers each operation with a canned reply; individual operations can be
/// switched to fail or to return a custom reply at runtime.
pub struct RoutingProvider {
    failing: Mutex<HashSet<&'static str>>,
    overrides: Mutex<HashMap<&'static str, String>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    delay: Mutex<Option<Duration>>,
}

impl RoutingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            failing: Mutex::new(HashSet::new()),
            overrides: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
        })
    }

    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn recover(&self, operation: &'static str) {
        self.failing.lock().unwrap().remove(operation);
    }

    pub fn reply_with(&self, operation: &'static str, text: &str) {
        self.overrides
            .lock()
            .unwrap()
            .insert(operation, text.to_string());
    }

    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self, operation: &'static str) -> usize {
        self.calls.lock().unwrap().get(operation).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CompletionProvider for RoutingProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        let operation = operation_of(&request);
        *self.calls.lock().unwrap().entry(operation).or_insert(0) += 1;

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(operation) {
            return Err(ProviderError::Api {
                code: 500,
                message: format!("{} is down", operation),
            });
        }

        let custom = self.overrides.lock().unwrap().get(operation).cloned();
        let text = custom.unwrap_or_else(|| {
            match operation {
                "parse_job_description" => PROFILE_REPLY,
                "generate_questions" => QUESTIONS_REPLY,
                "analyze_answer" => ANALYSIS_REPLY,
                "generate_follow_up" => FOLLOW_UP_REPLY,
                "generate_final_pair" => FINAL_PAIR_REPLY,
                "generate_report" => REPORT_REPLY,
                _ => "",
            }
            .to_string()
        });

        Ok(Completion {
            text,
            prompt_tokens: 120,
            completion_tokens: 60,
        })
    }

    fn name(&self) -> &str {
        "routing"
    }
}

pub fn service_with(
    provider: Arc<RoutingProvider>,
    store: Arc<MemoryStore>,
    interview: InterviewConfig,
    usage: UsageConfig,
) -> InterviewService {
    let guard = UsageGuard::new(store.clone(), usage);
    let gateway = Arc::new(PromptGateway::new(
        provider,
        guard,
        LlmConfig::default(),
        interview.min_questions,
    ));
    InterviewService::new(store, gateway, interview, CacheConfig::default())
}

pub fn service(provider: Arc<RoutingProvider>, store: Arc<MemoryStore>) -> InterviewService {
    service_with(
        provider,
        store,
        InterviewConfig::default(),
        UsageConfig::default(),
    )
}

pub fn answer_for(question: &str) -> String {
    format!("For \"{}\" I would start by measuring, then iterate.", question)
}
