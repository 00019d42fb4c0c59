use std::sync::Arc;

use clap::Parser;
use rehearse_core::store::{InterviewStore, UsageStore};
use rehearse_core::{
    MemoryStore, OpenAiClient, PgStore, PromptGateway, RehearseConfig, TranscriptionProvider,
    UsageGuard, WhisperClient,
};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use rehearse_server::http::{self, HttpState};
use rehearse_server::subsystems::interview::InterviewService;
use rehearse_server::subsystems::transcribe::TranscriptionService;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "rehearse.toml")]
    config: String,

    #[arg(long)]
    health: bool,

    /// Keep everything in process memory instead of PostgreSQL
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present; real deployments set the environment directly
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match RehearseConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    // Storage
    let (interview_store, usage_store, pool): (
        Arc<dyn InterviewStore>,
        Arc<dyn UsageStore>,
        Option<sqlx::PgPool>,
    ) =
        if args.memory {
            tracing::warn!("Running with in-memory store; sessions are lost on restart");
            let store = Arc::new(MemoryStore::new());
            (
                store.clone() as Arc<dyn InterviewStore>,
                store as Arc<dyn UsageStore>,
                None,
            )
        } else {
            let pool = match rehearse_core::db::create_pool(&config.database).await {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("Failed to connect to database: {}", e);
                    std::process::exit(1);
                }
            };

            if args.health {
                match rehearse_core::db::health_check(&pool).await {
                    Ok(v) => println!("✅ PostgreSQL connected: {}", v),
                    Err(e) => {
                        println!("❌ PostgreSQL connection failed: {}", e);
                        std::process::exit(1);
                    }
                }
                println!("✅ Rehearse DB health check passed");
                return Ok(());
            }

            if let Err(e) = rehearse_core::db::run_migrations(&pool).await {
                eprintln!("Failed to run migrations: {}", e);
                std::process::exit(1);
            }

            let store = Arc::new(PgStore::new(pool.clone()));
            (
                store.clone() as Arc<dyn InterviewStore>,
                store as Arc<dyn UsageStore>,
                Some(pool),
            )
        };

    // Model providers
    let provider = match OpenAiClient::new(None, config.llm.base_url.clone(), config.retry.clone()) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            eprintln!("Failed to create completion client: {}", e);
            std::process::exit(1);
        }
    };

    let guard = UsageGuard::new(usage_store, config.usage.clone());
    let gateway = Arc::new(PromptGateway::new(
        provider,
        guard.clone(),
        config.llm.clone(),
        config.interview.min_questions,
    ));
    let service = Arc::new(InterviewService::new(
        interview_store,
        gateway,
        config.interview.clone(),
        config.cache.clone(),
    ));

    let transcriber = match WhisperClient::new(
        None,
        config.transcription.clone(),
        config.retry.clone(),
    ) {
        Ok(client) => {
            let client: Arc<dyn TranscriptionProvider> = Arc::new(client);
            Some(Arc::new(TranscriptionService::new(client, guard.clone())))
        }
        Err(e) => {
            tracing::warn!("Transcription disabled: {}", e);
            None
        }
    };

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let state = Arc::new(HttpState {
        service,
        transcriber,
        pool,
    });
    http::start_http_server(state, &config.http, tx.subscribe()).await?;

    Ok(())
}
