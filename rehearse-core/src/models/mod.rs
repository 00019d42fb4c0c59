pub mod answer;
pub mod job;
pub mod question;
pub mod report;
pub mod session;
pub mod usage;

pub use answer::{Answer, AnswerAnalysis, DangerKind, DangerZone, Severity};
pub use job::{JobContext, JobProfile};
pub use question::{Difficulty, GeneratedQuestion, NewQuestion, Question, QuestionCategory};
pub use report::{FeedbackReport, QuestionFeedback, ReportDraft, RiskLevel};
pub use session::{InterviewSession, SessionDetails, SessionStatus};
pub use usage::{QuotaStatus, TokenUsage, WarningLevel};
