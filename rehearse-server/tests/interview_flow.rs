//! Interview lifecycle tests against the in-memory store and a routed stub provider.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{answer_for, service, service_with, RoutingProvider, JOB_DESCRIPTION};
use rehearse_core::config::{InterviewConfig, UsageConfig};
use rehearse_core::models::{FeedbackReport, SessionStatus, WarningLevel};
use rehearse_core::store::UsageStore;
use rehearse_core::{FinalPair, MemoryStore, RehearseError, FALLBACK_FOLLOW_UP};
use rehearse_server::subsystems::interview::{InterviewService, Stage, SubmitOutcome};
use uuid::Uuid;

/// Answer whatever the session currently asks until it completes.
async fn finish(service: &InterviewService, session_id: Uuid) -> FeedbackReport {
    for _ in 0..20 {
        let view = service.get(session_id).await.unwrap();
        let question = view.current_question.expect("session should be asking something");
        match service
            .submit_answer(session_id, &answer_for(&question.text))
            .await
            .unwrap()
        {
            SubmitOutcome::Next { .. } => continue,
            SubmitOutcome::Completed { report, .. } => return report,
        }
    }
    panic!("interview did not complete");
}

/// Submit `count` answers to whatever is currently asked.
async fn answer_n(service: &InterviewService, session_id: Uuid, count: usize) {
    for _ in 0..count {
        let view = service.get(session_id).await.unwrap();
        let question = view.current_question.unwrap();
        service
            .submit_answer(session_id, &answer_for(&question.text))
            .await
            .unwrap();
    }
}

// ===========================================================================
// Full interview
// ===========================================================================

#[tokio::test]
async fn test_full_interview_walks_every_stage() {
    let provider = RoutingProvider::new();
    let store = Arc::new(MemoryStore::new());
    let service = service(provider.clone(), store.clone());

    let started = service.start(Some("alice"), JOB_DESCRIPTION).await.unwrap();
    assert_eq!(started.questions.len(), 3);
    assert_eq!(started.question.id, started.questions[0].id);
    assert_eq!(started.progress.stage, Stage::QuestioningMain(0));
    assert_eq!(started.progress.percent, 0.0);
    assert_eq!(started.session.job.title, "Senior Rust Engineer");
    assert_eq!(started.session.job.company, "Initech");
    assert_eq!(started.quota.remaining, UsageConfig::default().max_sessions_per_day - 1);

    let session_id = started.session.id;
    let mut current = started.question;
    let mut asked = vec![current.clone()];
    let mut main_percents = Vec::new();
    let mut final_percents = Vec::new();

    let report = loop {
        match service
            .submit_answer(session_id, &answer_for(&current.text))
            .await
            .unwrap()
        {
            SubmitOutcome::Next { question, progress } => {
                match progress.stage {
                    Stage::QuestioningFinal(_) => final_percents.push(progress.percent),
                    _ => main_percents.push(progress.percent),
                }
                asked.push(question.clone());
                current = question;
            }
            SubmitOutcome::Completed { report, progress } => {
                assert_eq!(progress.stage, Stage::Completed);
                assert_eq!(progress.percent, 100.0);
                break report;
            }
        }
        assert!(asked.len() <= 8, "too many questions asked");
    };

    // main, follow-up, main, follow-up, main, follow-up, classic, curveball
    assert_eq!(asked.len(), 8);
    for i in [1, 3, 5] {
        assert!(asked[i].is_follow_up);
        assert_eq!(asked[i].parent_id, Some(asked[i - 1].id));
        assert_eq!(asked[i].text, "How did you measure the result?");
    }
    assert!(asked[6].is_final && asked[7].is_final);
    assert_eq!(asked[6].text, "Why do you want to work at Initech?");
    assert_eq!(
        asked[7].text,
        "If you were a data structure, which one would you be?"
    );

    assert!(main_percents.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(final_percents, vec![0.0, 50.0]);

    assert_eq!(report.version, 1);
    assert_eq!(report.overall_score, 82.0);
    assert_eq!(report.question_feedback[0].score, 90.0);

    let view = service.get(session_id).await.unwrap();
    assert_eq!(view.details.session.status, SessionStatus::Completed);
    assert!(view.details.session.completed_at.is_some());
    assert!(view.current_question.is_none());
    assert_eq!(view.details.answers.len(), 8);
    assert_eq!(view.details.reports.len(), 1);
    let positions: Vec<i32> = view.details.questions.iter().map(|q| q.position).collect();
    assert_eq!(positions, (0..8).collect::<Vec<_>>());
    let analysed = view
        .details
        .answers
        .iter()
        .filter(|a| a.analysis.is_some())
        .count();
    assert_eq!(analysed, 3, "only main answers are analysed");

    assert_eq!(provider.calls("parse_job_description"), 1);
    assert_eq!(provider.calls("generate_questions"), 1);
    assert_eq!(provider.calls("analyze_answer"), 3);
    assert_eq!(provider.calls("generate_follow_up"), 3);
    assert_eq!(provider.calls("generate_final_pair"), 1);
    assert_eq!(provider.calls("generate_report"), 1);
    assert_eq!(store.ledger_len(), 10);
}

// ===========================================================================
// Resilience
// ===========================================================================

#[tokio::test]
async fn test_follow_up_failure_uses_fallback_question() {
    let provider = RoutingProvider::new();
    provider.fail("generate_follow_up");
    let service = service(provider.clone(), Arc::new(MemoryStore::new()));

    let started = service.start(None, JOB_DESCRIPTION).await.unwrap();
    let outcome = service
        .submit_answer(started.session.id, "I keep buffers on the stack and reuse arenas.")
        .await
        .unwrap();
    match outcome {
        SubmitOutcome::Next { question, progress } => {
            assert!(question.is_follow_up);
            assert_eq!(question.text, FALLBACK_FOLLOW_UP);
            assert_eq!(progress.stage, Stage::AwaitingFollowUp(0));
        }
        other => panic!("expected next question, got {:?}", other),
    }

    let report = finish(&service, started.session.id).await;
    assert_eq!(report.overall_score, 82.0);
}

#[tokio::test]
async fn test_blank_follow_up_reply_uses_fallback_question() {
    let provider = RoutingProvider::new();
    provider.reply_with("generate_follow_up", "   \n  ");
    let service = service(provider, Arc::new(MemoryStore::new()));

    let started = service.start(None, JOB_DESCRIPTION).await.unwrap();
    answer_n(&service, started.session.id, 1).await;

    let view = service.get(started.session.id).await.unwrap();
    assert_eq!(view.current_question.unwrap().text, FALLBACK_FOLLOW_UP);
}

#[tokio::test]
async fn test_analysis_failure_still_progresses() {
    let provider = RoutingProvider::new();
    provider.fail("analyze_answer");
    let service = service(provider, Arc::new(MemoryStore::new()));

    let started = service.start(None, JOB_DESCRIPTION).await.unwrap();
    finish(&service, started.session.id).await;

    let view = service.get(started.session.id).await.unwrap();
    assert_eq!(view.details.session.status, SessionStatus::Completed);
    assert!(view.details.answers.iter().all(|a| a.analysis.is_none()));
}

#[tokio::test]
async fn test_final_pair_failure_uses_curated_pair() {
    let provider = RoutingProvider::new();
    provider.fail("generate_final_pair");
    let service = service(provider, Arc::new(MemoryStore::new()));

    let started = service.start(None, JOB_DESCRIPTION).await.unwrap();
    answer_n(&service, started.session.id, 6).await;

    let view = service.get(started.session.id).await.unwrap();
    let finals: Vec<&str> = view
        .details
        .questions
        .iter()
        .filter(|q| q.is_final)
        .map(|q| q.text.as_str())
        .collect();
    let fallback = FinalPair::fallback();
    assert_eq!(finals, vec![fallback.classic.as_str(), fallback.curveball.as_str()]);
    assert_eq!(view.progress.stage, Stage::QuestioningFinal(0));
}

#[tokio::test]
async fn test_report_failure_keeps_session_open_for_retry() {
    let provider = RoutingProvider::new();
    provider.fail("generate_report");
    let service = service(provider.clone(), Arc::new(MemoryStore::new()));

    let started = service.start(None, JOB_DESCRIPTION).await.unwrap();
    let session_id = started.session.id;
    answer_n(&service, session_id, 7).await;

    let err = service
        .submit_answer(session_id, "I would be a skip list.")
        .await
        .unwrap_err();
    assert!(matches!(err, RehearseError::UpstreamUnavailable(_)));

    let view = service.get(session_id).await.unwrap();
    assert_eq!(view.details.session.status, SessionStatus::InProgress);
    assert_eq!(view.progress.stage, Stage::QuestioningFinal(1));
    assert!(view.details.reports.is_empty());

    provider.recover("generate_report");
    let outcome = service
        .submit_answer(session_id, "On reflection, a B-tree.")
        .await
        .unwrap();
    assert!(matches!(outcome, SubmitOutcome::Completed { .. }));

    let view = service.get(session_id).await.unwrap();
    assert_eq!(view.details.answers.len(), 8, "retried answer replaces the first");
    let last = view.details.questions.last().unwrap();
    assert_eq!(
        view.details.answer_for(last.id).unwrap().content,
        "On reflection, a B-tree."
    );
}

#[tokio::test]
async fn test_report_without_json_scores_from_analyses() {
    let provider = RoutingProvider::new();
    provider.reply_with("generate_report", "I could not produce structured output.");
    let service = service(provider, Arc::new(MemoryStore::new()));

    let started = service.start(None, JOB_DESCRIPTION).await.unwrap();
    let report = finish(&service, started.session.id).await;

    // three analyses scored 8/10
    assert_eq!(report.overall_score, 80.0);
    assert!((0.0..=100.0).contains(&report.overall_score));
    assert_eq!(report.summary, "Overall performance score: 80/100");
}

#[tokio::test]
async fn test_danger_zone_drives_targeted_follow_up_and_report() {
    let provider = RoutingProvider::new();
    provider.reply_with(
        "analyze_answer",
        r#"{"strengths": [], "weaknesses": ["Thin answer"], "missing_competencies": ["benchmarks"], "score": 5}"#,
    );
    let service = service(provider.clone(), Arc::new(MemoryStore::new()));

    let started = service.start(None, JOB_DESCRIPTION).await.unwrap();
    let outcome = service
        .submit_answer(started.session.id, "I just write fast code.")
        .await
        .unwrap();
    let SubmitOutcome::Next { question, .. } = outcome else {
        panic!("expected a follow-up");
    };
    assert!(question.text.contains("how you've used Rust"));
    assert_eq!(provider.calls("generate_follow_up"), 0);

    let report = finish(&service, started.session.id).await;
    assert!(report
        .danger_zones
        .iter()
        .any(|z| z.contains("Missing demonstration of Rust")));
}

#[tokio::test]
async fn test_session_resumes_after_restart() {
    let provider = RoutingProvider::new();
    let store = Arc::new(MemoryStore::new());

    let first = service(provider.clone(), store.clone());
    let started = first.start(None, JOB_DESCRIPTION).await.unwrap();
    answer_n(&first, started.session.id, 3).await;
    drop(first);

    let second = service(provider, store);
    let view = second.get(started.session.id).await.unwrap();
    assert_eq!(view.progress.stage, Stage::AwaitingFollowUp(1));

    finish(&second, started.session.id).await;
    let view = second.get(started.session.id).await.unwrap();
    assert_eq!(view.details.answers.len(), 8);
}

#[tokio::test]
async fn test_concurrent_submission_is_rejected() {
    let provider = RoutingProvider::new();
    let service = Arc::new(service(provider.clone(), Arc::new(MemoryStore::new())));
    let started = service.start(None, JOB_DESCRIPTION).await.unwrap();
    let session_id = started.session.id;

    provider.slow_down(Duration::from_millis(300));
    let background = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .submit_answer(session_id, "The first, slow submission.")
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = service
        .submit_answer(session_id, "A second submission racing the first.")
        .await
        .unwrap_err();
    assert!(matches!(err, RehearseError::Conflict(_)));

    assert!(background.await.unwrap().is_ok());
    let view = service.get(session_id).await.unwrap();
    assert_eq!(view.details.answers.len(), 1);
}

#[tokio::test]
async fn test_delete_waits_for_in_flight_submission() {
    let provider = RoutingProvider::new();
    let service = Arc::new(service(provider.clone(), Arc::new(MemoryStore::new())));
    let started = service.start(None, JOB_DESCRIPTION).await.unwrap();
    let session_id = started.session.id;

    provider.slow_down(Duration::from_millis(300));
    let background = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .submit_answer(session_id, "A slow answer still being scored.")
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = service.delete(session_id).await.unwrap_err();
    assert!(matches!(err, RehearseError::Conflict(_)));

    assert!(background.await.unwrap().is_ok());
    assert!(service.delete(session_id).await.unwrap());
}

#[tokio::test]
async fn test_idle_sessions_hold_no_memory() {
    let provider = RoutingProvider::new();
    let service = service(provider, Arc::new(MemoryStore::new()));

    let mut ids = Vec::new();
    for _ in 0..10 {
        ids.push(service.start(None, JOB_DESCRIPTION).await.unwrap().session.id);
    }
    assert_eq!(service.active_sessions(), 0);

    answer_n(&service, ids[0], 2).await;
    assert_eq!(service.active_sessions(), 0);

    // Sessions left idle still resume from storage.
    let view = service.get(ids[0]).await.unwrap();
    assert_eq!(view.progress.stage, Stage::QuestioningMain(1));
    assert!(service.delete(ids[1]).await.unwrap());
    assert_eq!(service.active_sessions(), 0);
}

// ===========================================================================
// Start
// ===========================================================================

#[tokio::test]
async fn test_quota_counts_down_then_rejects() {
    let provider = RoutingProvider::new();
    let usage = UsageConfig {
        max_sessions_per_day: 2,
        ..UsageConfig::default()
    };
    let service = service_with(
        provider,
        Arc::new(MemoryStore::new()),
        InterviewConfig::default(),
        usage,
    );

    let first = service.start(Some("bob"), JOB_DESCRIPTION).await.unwrap();
    assert_eq!(first.quota.remaining, 1);
    assert_eq!(first.quota.warning, WarningLevel::Hard);

    let second = service.start(Some("bob"), JOB_DESCRIPTION).await.unwrap();
    assert_eq!(second.quota.remaining, 0);
    assert!(!second.quota.allowed);

    let err = service.start(Some("bob"), JOB_DESCRIPTION).await.unwrap_err();
    assert!(matches!(err, RehearseError::QuotaExceeded { remaining: 0, .. }));

    // other identities have their own bucket
    assert!(service.start(Some("carol"), JOB_DESCRIPTION).await.is_ok());
    assert_eq!(service.list(Some("bob")).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_concurrent_starts_respect_quota() {
    let provider = RoutingProvider::new();
    provider.slow_down(Duration::from_millis(100));
    let usage = UsageConfig {
        max_sessions_per_day: 2,
        ..UsageConfig::default()
    };
    let service = Arc::new(service_with(
        provider,
        Arc::new(MemoryStore::new()),
        InterviewConfig::default(),
        usage,
    ));

    let starts: Vec<_> = (0..10)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.start(Some("mallory"), JOB_DESCRIPTION).await })
        })
        .collect();

    let mut accepted = 0;
    for start in starts {
        match start.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert!(matches!(e, RehearseError::QuotaExceeded { remaining: 0, .. })),
        }
    }
    assert_eq!(accepted, 2);
    assert_eq!(service.list(Some("mallory")).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_start_returns_its_quota() {
    let provider = RoutingProvider::new();
    provider.fail("generate_questions");
    let usage = UsageConfig {
        max_sessions_per_day: 1,
        ..UsageConfig::default()
    };
    let service = service_with(
        provider.clone(),
        Arc::new(MemoryStore::new()),
        InterviewConfig::default(),
        usage,
    );

    let err = service.start(Some("erin"), JOB_DESCRIPTION).await.unwrap_err();
    assert!(matches!(err, RehearseError::UpstreamUnavailable(_)));
    assert_eq!(service.guard().check_identity_quota("erin").await.remaining, 1);

    provider.recover("generate_questions");
    assert!(service.start(Some("erin"), JOB_DESCRIPTION).await.is_ok());
}

#[tokio::test]
async fn test_closed_gate_pauses_service() {
    let provider = RoutingProvider::new();
    let store = Arc::new(MemoryStore::new());
    store.write_gate(false).await.unwrap();
    let service = service(provider.clone(), store);

    let err = service.start(None, JOB_DESCRIPTION).await.unwrap_err();
    assert!(matches!(err, RehearseError::ServicePaused));
    assert_eq!(provider.calls("parse_job_description"), 0);
    assert!(service.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_too_few_questions_fails_start() {
    let provider = RoutingProvider::new();
    provider.reply_with("generate_questions", r#"{"questions": [{"text": "Only one?"}]}"#);
    let service = service(provider, Arc::new(MemoryStore::new()));

    let err = service.start(None, JOB_DESCRIPTION).await.unwrap_err();
    assert!(matches!(err, RehearseError::UpstreamUnavailable(_)));
    assert!(service.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_job_parse_failure_falls_back_to_regex() {
    let provider = RoutingProvider::new();
    provider.fail("parse_job_description");
    let service = service(provider, Arc::new(MemoryStore::new()));

    let started = service.start(None, JOB_DESCRIPTION).await.unwrap();
    assert!(started.session.job.title.starts_with("Senior Rust Engineer"));
    assert_eq!(started.session.job.company, "Initech");
    assert_eq!(started.questions.len(), 3);
}

#[tokio::test]
async fn test_questions_are_served_from_cache() {
    let provider = RoutingProvider::new();
    let service = service(provider.clone(), Arc::new(MemoryStore::new()));

    service.start(Some("a"), JOB_DESCRIPTION).await.unwrap();
    let again = service
        .start(Some("b"), &format!("  {}  ", JOB_DESCRIPTION.to_uppercase()))
        .await
        .unwrap();
    assert_eq!(again.questions.len(), 3);
    assert_eq!(provider.calls("generate_questions"), 1);
}

#[tokio::test]
async fn test_input_validation() {
    let service = service(RoutingProvider::new(), Arc::new(MemoryStore::new()));

    let err = service.start(None, "too short").await.unwrap_err();
    assert!(matches!(err, RehearseError::Validation(_)));

    let huge = "x".repeat(10_001);
    let err = service.start(None, &huge).await.unwrap_err();
    assert!(matches!(err, RehearseError::Validation(_)));

    let started = service.start(None, JOB_DESCRIPTION).await.unwrap();
    let err = service
        .submit_answer(started.session.id, "  ok  ")
        .await
        .unwrap_err();
    assert!(matches!(err, RehearseError::Validation(_)));
}

// ===========================================================================
// Other operations
// ===========================================================================

#[tokio::test]
async fn test_abandoned_session_rejects_answers() {
    let service = service(RoutingProvider::new(), Arc::new(MemoryStore::new()));
    let started = service.start(None, JOB_DESCRIPTION).await.unwrap();
    let session_id = started.session.id;

    let session = service.abandon(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Abandoned);

    let err = service
        .submit_answer(session_id, "Too late for this.")
        .await
        .unwrap_err();
    assert!(matches!(err, RehearseError::Conflict(_)));
    assert!(matches!(
        service.abandon(session_id).await,
        Err(RehearseError::Conflict(_))
    ));
    assert_eq!(
        service.get(session_id).await.unwrap().progress.stage,
        Stage::Abandoned
    );
}

#[tokio::test]
async fn test_regenerated_report_is_a_new_version() {
    let service = service(RoutingProvider::new(), Arc::new(MemoryStore::new()));
    let started = service.start(None, JOB_DESCRIPTION).await.unwrap();
    let session_id = started.session.id;

    let err = service.regenerate_report(session_id).await.unwrap_err();
    assert!(matches!(err, RehearseError::Conflict(_)));

    finish(&service, session_id).await;
    let second = service.regenerate_report(session_id).await.unwrap();
    assert_eq!(second.version, 2);

    let view = service.get(session_id).await.unwrap();
    assert_eq!(view.details.reports.len(), 2);
    assert_eq!(view.details.latest_report().map(|r| r.version), Some(2));
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let service = service(RoutingProvider::new(), Arc::new(MemoryStore::new()));
    let started = service.start(None, JOB_DESCRIPTION).await.unwrap();
    let session_id = started.session.id;
    answer_n(&service, session_id, 1).await;

    assert!(service.delete(session_id).await.unwrap());
    assert!(!service.delete(session_id).await.unwrap());

    assert!(matches!(
        service.get(session_id).await,
        Err(RehearseError::NotFound(_))
    ));
    assert!(matches!(
        service.submit_answer(session_id, "Anyone there?").await,
        Err(RehearseError::NotFound(_))
    ));
}
