//! rehearse-cli — terminal client for the Rehearse mock-interview API
//!
//! # Subcommands
//! - `start [--file <path>]`      — start an interview (job description from file or stdin)
//! - `answer <session> <text>`    — submit one answer
//! - `show <session>`             — current question, progress and latest report
//! - `list`                       — your sessions, newest first
//! - `delete <session>`           — delete a session and everything in it
//! - `abandon <session>`          — stop an interview early
//! - `report <session>`           — regenerate the feedback report
//! - `usage`                      — remaining sessions today
//! - `practice [--file <path>]`   — run a whole interview interactively
//! - `status`                     — show server health

use std::io::{BufRead, Read, Write};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8787";

/// Generation can take a while on the report step.
const REQUEST_TIMEOUT_SECS: u64 = 120;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "rehearse-cli",
    version,
    about = "Rehearse mock interviews from the terminal"
)]
struct Cli {
    /// Rehearse HTTP server URL (overrides REHEARSE_HTTP_URL env var)
    #[arg(long, env = "REHEARSE_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Identity sent as x-user-id; anonymous when unset
    #[arg(long, env = "REHEARSE_USER")]
    user: Option<String>,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start an interview from a job description
    Start {
        /// Read the job description from this file instead of stdin
        #[arg(short, long)]
        file: Option<String>,
    },

    /// Submit an answer to the current question
    Answer { session: String, text: String },

    /// Show a session's progress, current question and latest report
    Show { session: String },

    /// List your sessions
    List,

    /// Delete a session
    Delete { session: String },

    /// Abandon an interview in progress
    Abandon { session: String },

    /// Regenerate the report of a completed interview
    Report { session: String },

    /// Show remaining sessions for today
    Usage,

    /// Run an interview interactively, one answer per line
    Practice {
        #[arg(short, long)]
        file: Option<String>,
    },

    /// Show Rehearse server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct QuestionView {
    pub text: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub skill: String,
    #[serde(default)]
    pub is_follow_up: bool,
    #[serde(default)]
    pub is_final: bool,
}

#[derive(Debug, Deserialize)]
pub struct ProgressView {
    pub stage: String,
    pub index: Option<usize>,
    pub percent: f64,
}

#[derive(Debug, Deserialize, Default)]
pub struct QuestionFeedbackView {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub score: f64,
}

#[derive(Debug, Deserialize)]
pub struct ReportView {
    pub version: i32,
    pub overall_score: f64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub areas_for_improvement: Vec<String>,
    #[serde(default)]
    pub danger_zones: Vec<String>,
    pub danger_zone_risk: Option<String>,
    #[serde(default)]
    pub question_feedback: Vec<QuestionFeedbackView>,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct JobView {
    pub title: String,
    pub company: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub status: String,
    pub created_at: String,
    pub job: JobView,
}

// ============================================================================
// Formatting (pure)
// ============================================================================

pub fn format_progress(progress: &ProgressView) -> String {
    let stage = match progress.stage.as_str() {
        "questioning_main" => "main questions",
        "awaiting_follow_up" => "follow-up",
        "questioning_final" => "closing questions",
        "completed" => "completed",
        "abandoned" => "abandoned",
        other => other,
    };
    match (progress.stage.as_str(), progress.index) {
        ("completed" | "abandoned", _) | (_, None) => {
            format!("[{:>3.0}% · {}]", progress.percent, stage)
        }
        (_, Some(i)) => format!("[{:>3.0}% · {} {}]", progress.percent, stage, i + 1),
    }
}

pub fn format_question(question: &QuestionView) -> String {
    let label = if question.is_follow_up {
        "Follow-up".to_string()
    } else if question.is_final {
        "Closing question".to_string()
    } else if question.skill.is_empty() {
        "Question".to_string()
    } else {
        format!("Question ({}, {})", question.category, question.skill)
    };
    format!("{}:\n  {}", label, question.text)
}

fn bullet_list(title: &str, items: &[String]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let mut out = format!("\n{}:\n", title);
    for item in items {
        out.push_str(&format!("  - {}\n", item));
    }
    out
}

pub fn format_report(report: &ReportView) -> String {
    let mut out = format!(
        "Feedback report v{}\nOverall score: {:.0}/100\n",
        report.version, report.overall_score
    );
    if !report.summary.is_empty() {
        out.push_str(&format!("\n{}\n", report.summary));
    }
    out.push_str(&bullet_list("Strengths", &report.strengths));
    out.push_str(&bullet_list(
        "Areas for improvement",
        &report.areas_for_improvement,
    ));
    if !report.danger_zones.is_empty() {
        let risk = report.danger_zone_risk.as_deref().unwrap_or("unrated");
        out.push_str(&bullet_list(
            &format!("Danger zones (risk: {})", risk),
            &report.danger_zones,
        ));
    }
    if !report.question_feedback.is_empty() {
        out.push_str("\nPer question:\n");
        for q in &report.question_feedback {
            let question: String = q.question.chars().take(70).collect();
            out.push_str(&format!("  {:>3.0}  {}\n", q.score, question));
        }
    }
    out.push_str(&bullet_list("Next steps", &report.next_steps));
    out
}

pub fn format_session_line(session: &SessionSummary) -> String {
    let date = session.created_at.get(..10).unwrap_or(&session.created_at);
    format!(
        "{}  {}  {:<11}  {} at {}",
        session.id, date, session.status, session.job.title, session.job.company
    )
}

// ============================================================================
// HTTP Client
// ============================================================================

struct Api {
    http: Client,
    server: String,
    user: Option<String>,
}

impl Api {
    fn new(server: &str, user: Option<String>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            server: server.trim_end_matches('/').to_string(),
            user,
        })
    }

    fn call(&self, method: Method, path: &str, body: Option<Value>) -> anyhow::Result<Value> {
        let url = format!("{}{}", self.server, path);
        let mut req = self.http.request(method, &url);
        if let Some(user) = &self.user {
            req = req.header("x-user-id", user);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .with_context(|| format!("connection failed to {}", url))?;
        let status = resp.status();
        let body: Value = resp.json().unwrap_or(Value::Null);

        if !status.is_success() {
            let message = body["error"].as_str().unwrap_or("request failed");
            let hint = match body["retry_after_secs"].as_i64() {
                Some(secs) => format!(" (retry in {}s)", secs),
                None => String::new(),
            };
            return Err(anyhow!("server returned {}: {}{}", status, message, hint));
        }
        Ok(body)
    }
}

fn parse<T: for<'de> Deserialize<'de>>(value: &Value) -> anyhow::Result<T> {
    serde_json::from_value(value.clone()).context("unexpected response shape")
}

fn read_job_description(file: Option<&str>) -> anyhow::Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path)),
        None => {
            eprintln!("Paste the job description, then press Ctrl-D:");
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

fn print_value(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a submit or start response; returns the report when the interview finished.
fn print_step(body: &Value) -> anyhow::Result<bool> {
    if body["status"] == "completed" {
        let report: ReportView = parse(&body["report"])?;
        println!("\n{}", format_report(&report));
        return Ok(true);
    }
    let progress: ProgressView = parse(&body["progress"])?;
    let question: QuestionView = parse(&body["question"])?;
    println!("{} {}", format_progress(&progress), format_question(&question));
    Ok(false)
}

// ============================================================================
// Commands
// ============================================================================

fn do_start(api: &Api, file: Option<&str>, json: bool) -> anyhow::Result<String> {
    let description = read_job_description(file)?;
    let body = api.call(
        Method::POST,
        "/sessions",
        Some(serde_json::json!({ "job_description": description })),
    )?;
    let session_id = body["session_id"]
        .as_str()
        .ok_or_else(|| anyhow!("response has no session_id"))?
        .to_string();

    if json {
        print_value(&body)?;
    } else {
        println!(
            "Session {} · {} at {}",
            session_id,
            body["session"]["job"]["title"].as_str().unwrap_or("?"),
            body["session"]["job"]["company"].as_str().unwrap_or("?"),
        );
        if let Some(remaining) = body["quota"]["remaining"].as_u64() {
            println!("Sessions left today: {}", remaining);
        }
        print_step(&body)?;
    }
    Ok(session_id)
}

fn do_answer(api: &Api, session: &str, text: &str, json: bool) -> anyhow::Result<bool> {
    let body = api.call(
        Method::POST,
        &format!("/sessions/{}/answers", session),
        Some(serde_json::json!({ "answer": text })),
    )?;
    if json {
        print_value(&body)?;
        return Ok(body["status"] == "completed");
    }
    print_step(&body)
}

fn do_show(api: &Api, session: &str, json: bool) -> anyhow::Result<()> {
    let body = api.call(Method::GET, &format!("/sessions/{}", session), None)?;
    if json {
        return print_value(&body);
    }

    println!(
        "{} at {} · {}",
        body["session"]["job"]["title"].as_str().unwrap_or("?"),
        body["session"]["job"]["company"].as_str().unwrap_or("?"),
        body["session"]["status"].as_str().unwrap_or("?"),
    );
    let progress: ProgressView = parse(&body["progress"])?;
    if body["current_question"].is_object() {
        let question: QuestionView = parse(&body["current_question"])?;
        println!("{} {}", format_progress(&progress), format_question(&question));
    } else {
        println!("{}", format_progress(&progress));
    }
    if let Some(latest) = body["reports"].as_array().and_then(|r| r.last()) {
        let report: ReportView = parse(latest)?;
        println!("\n{}", format_report(&report));
    }
    Ok(())
}

fn do_list(api: &Api, json: bool) -> anyhow::Result<()> {
    let body = api.call(Method::GET, "/sessions", None)?;
    if json {
        return print_value(&body);
    }
    let sessions: Vec<SessionSummary> = parse(&body["sessions"])?;
    if sessions.is_empty() {
        eprintln!("No sessions yet.");
    }
    for s in &sessions {
        println!("{}", format_session_line(s));
    }
    Ok(())
}

fn do_delete(api: &Api, session: &str, json: bool) -> anyhow::Result<()> {
    let body = api.call(Method::DELETE, &format!("/sessions/{}", session), None)?;
    if json {
        return print_value(&body);
    }
    if body["deleted"] == true {
        println!("Deleted {}", session);
    } else {
        println!("Nothing to delete for {}", session);
    }
    Ok(())
}

fn do_abandon(api: &Api, session: &str, json: bool) -> anyhow::Result<()> {
    let body = api.call(Method::POST, &format!("/sessions/{}/abandon", session), None)?;
    if json {
        return print_value(&body);
    }
    println!("Abandoned {}", session);
    Ok(())
}

fn do_report(api: &Api, session: &str, json: bool) -> anyhow::Result<()> {
    let body = api.call(Method::POST, &format!("/sessions/{}/report", session), None)?;
    if json {
        return print_value(&body);
    }
    let report: ReportView = parse(&body)?;
    println!("{}", format_report(&report));
    Ok(())
}

fn do_usage(api: &Api, json: bool) -> anyhow::Result<()> {
    let body = api.call(Method::GET, "/usage", None)?;
    if json {
        return print_value(&body);
    }
    println!(
        "Sessions left today: {} of {}",
        body["remaining"].as_u64().unwrap_or(0),
        body["limit"].as_u64().unwrap_or(0)
    );
    println!("Resets at:           {}", body["reset_at"].as_str().unwrap_or("?"));
    if body["service_paused"] == true {
        println!("The service is paused; try again later.");
    }
    Ok(())
}

/// Whole interview in one terminal session. `/quit` abandons.
fn do_practice(api: &Api, file: Option<&str>) -> anyhow::Result<()> {
    let session = do_start(api, file, false)?;
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else {
            println!("\nStopped. Resume later with: rehearse-cli show {}", session);
            return Ok(());
        };
        let line = line?;
        let answer = line.trim();
        if answer.is_empty() {
            continue;
        }
        if answer == "/quit" {
            return do_abandon(api, &session, false);
        }

        match do_answer(api, &session, answer, false) {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            // Validation and transient errors leave the session where it was.
            Err(e) => eprintln!("rehearse-cli: {}", e),
        }
    }
}

fn do_status(api: &Api) -> anyhow::Result<()> {
    let body = api.call(Method::GET, "/health", None)?;
    println!("Rehearse server: {}", body["status"].as_str().unwrap_or("unknown"));
    println!("Version:         {}", body["version"].as_str().unwrap_or("?"));
    println!("Store:           {}", body["store"].as_str().unwrap_or("?"));
    if let Some(pg) = body["postgresql"].as_str() {
        println!("PostgreSQL:      {}", pg);
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();

    let result = Api::new(&cli.server, cli.user.clone()).and_then(|api| match &cli.command {
        Commands::Start { file } => do_start(&api, file.as_deref(), cli.json).map(|_| ()),
        Commands::Answer { session, text } => {
            do_answer(&api, session, text, cli.json).map(|_| ())
        }
        Commands::Show { session } => do_show(&api, session, cli.json),
        Commands::List => do_list(&api, cli.json),
        Commands::Delete { session } => do_delete(&api, session, cli.json),
        Commands::Abandon { session } => do_abandon(&api, session, cli.json),
        Commands::Report { session } => do_report(&api, session, cli.json),
        Commands::Usage => do_usage(&api, cli.json),
        Commands::Practice { file } => do_practice(&api, file.as_deref()),
        Commands::Status => do_status(&api),
    });

    if let Err(e) = result {
        eprintln!("rehearse-cli: {:#}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
