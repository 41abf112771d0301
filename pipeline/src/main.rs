mod app_config;
mod batch_processor;
mod csv_pipeline;
mod db_core;
mod error;
mod model;
mod prompt;
mod rate_limiters;
#[cfg(test)]
mod testing;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use tokio::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use app_config::AppConfig;
use batch_processor::BatchProcessor;
use model::progress::ProgressCtrl;
use prompt::{AzureChatApi, BatchClassifier};
use rate_limiters::RateLimiters;

pub type HttpClient = reqwest::Client;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(false))
        .init();

    let cfg = AppConfig::load()?;
    let prediction = cfg.religion_prediction.clone();

    let conn = connect_progress_db(&prediction.progress_db).await?;
    ProgressCtrl::init_schema(&conn).await?;

    let http_client = reqwest::ClientBuilder::new().use_rustls_tls().build()?;
    let rate_limiters = RateLimiters::new(prediction.calls_per_minute, prediction.tokens_per_minute);
    let api = AzureChatApi::new(http_client, &cfg.azure_openai, &cfg.model);
    let classifier = BatchClassifier::new(
        api,
        rate_limiters.clone(),
        prediction.max_retries,
        prediction.estimated_tokens_per_call,
    );
    let processor = BatchProcessor::new(
        conn.clone(),
        classifier,
        prediction.batch_size,
        prediction.max_parallel,
        Duration::from_secs(prediction.batch_delay_seconds),
    );

    let input_root = PathBuf::from(&prediction.input_directory);
    let output_root = PathBuf::from(&prediction.output_directory);
    let files = collect_csv_files(&input_root)?;
    if files.is_empty() {
        tracing::warn!("No CSV files found under {}", input_root.display());
        return Ok(());
    }
    tracing::info!("Found {} CSV files under {}", files.len(), input_root.display());

    let mut failed_files = Vec::new();
    for (idx, input_path) in files.iter().enumerate() {
        let relative = input_path
            .strip_prefix(&input_root)
            .unwrap_or(input_path.as_path());
        let output_path = output_root.join(relative);

        if let Err(e) =
            csv_pipeline::process_csv_file(&conn, &processor, input_path, &output_path).await
        {
            tracing::error!("Failed to process {}: {}", input_path.display(), e);
            failed_files.push(input_path.clone());
        }

        processor
            .print_progress(&input_path.display().to_string(), idx + 1, files.len())
            .await?;
        tracing::info!("Rate limiter status: {}", rate_limiters.get_status());
    }

    let totals = ProgressCtrl::get_total_stats(&conn).await?;
    let snapshot = processor.stats().snapshot();
    tracing::info!("Run finished: {} files, {} failed", files.len(), failed_files.len());
    tracing::info!(
        "Store totals: {} completed, {} failed, {} total",
        totals.completed,
        totals.failed,
        totals.total
    );
    tracing::info!(
        "This run: {} records in {:.1} minutes ({:.1} records/min)",
        snapshot.total_processed,
        snapshot.elapsed.as_secs_f64() / 60.0,
        snapshot.records_per_min
    );

    if !failed_files.is_empty() {
        anyhow::bail!("{} file(s) failed to process", failed_files.len());
    }

    Ok(())
}

async fn connect_progress_db(db_path: &str) -> anyhow::Result<DatabaseConnection> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Could not create {}", parent.display()))?;
        }
    }

    // One connection keeps the upsert path serialized; sqlite locks the whole
    // file on write anyway.
    let mut options = ConnectOptions::new(format!("sqlite://{db_path}?mode=rwc"));
    options.max_connections(1).sqlx_logging(false);

    Database::connect(options)
        .await
        .context("Progress database connection failed")
}

fn collect_csv_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries =
            fs::read_dir(&dir).with_context(|| format!("Could not read {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv")) {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}
