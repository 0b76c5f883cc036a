use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use survey_analysis_engine::cli::{self, Command};
use survey_analysis_engine::domain::Window;
use survey_analysis_engine::services::analysis::jobs::postgres::PostgresStore;
use survey_analysis_engine::services::analysis::jobs::store::TracingNotifier;
use survey_analysis_engine::services::analysis::jobs::{
    AnalysisJobService, EngineStores, EnqueueRequest,
};
use survey_analysis_engine::{config, db};
use tokio_util::sync::CancellationToken;

/// Completion events are relayed from the outbox table to the log.
fn postgres_stores(pool: sqlx::PgPool) -> EngineStores {
    let store = Arc::new(PostgresStore::new(pool));
    EngineStores {
        queue: store.clone(),
        responses: store.clone(),
        results: store,
        notifier: Arc::new(TracingNotifier),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = config::EngineConfig::from_env()?;
    if let Some(workers) = args.workers {
        config.worker_count = workers.max(1);
    }

    match args.command() {
        Command::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Enqueue {
            company,
            survey,
            start,
            end,
        } => {
            let window = Window::new(start, end).map_err(anyhow::Error::msg)?;
            let pool = db::connect_lazy(config.require_database_url()?, 1)?;
            let service = AnalysisJobService::new(postgres_stores(pool), &config);
            let outcome = service
                .enqueue(&EnqueueRequest {
                    company_id: company.into(),
                    survey_id: survey.into(),
                    window,
                })
                .await
                .context("failed to enqueue analysis job")?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Run { apply_schema } => {
            let pool = db::connect_lazy(config.require_database_url()?, config.worker_count)?;
            if apply_schema {
                db::apply_schema(&pool).await?;
            }
            let service = Arc::new(AnalysisJobService::new(postgres_stores(pool), &config));
            let cancel = CancellationToken::new();
            let workers = service.clone().start(cancel.clone());
            tracing::info!(workers = workers.len(), "survey analysis engine started");

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown requested; draining workers");
            cancel.cancel();
            for joined in futures::future::join_all(workers).await {
                if let Err(err) = joined {
                    tracing::warn!(error = %err, "analysis worker task ended abnormally");
                }
            }
        }
    }
    Ok(())
}
