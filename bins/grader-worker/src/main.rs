use std::sync::Arc;

use anyhow::Context;
use grader_common::config::GraderConfig;
use grader_common::redis::RedisSubmissionStore;
use grader_worker::checkout::GitCheckout;
use grader_worker::engine::{DockerBackend, SandboxRunner};
use grader_worker::evaluation::Evaluator;
use grader_worker::orchestrator::Orchestrator;
use grader_worker::poller::{GithubTagSource, TagPoller};
use grader_worker::recorder::SubmissionRecorder;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Grader worker booting...");

    let config = GraderConfig::load_default().map_err(|e| {
        error!("Failed to load grader configuration: {}", e);
        error!("Make sure config/grader.json exists or set GRADER_CONFIG");
        e
    })?;
    let config = Arc::new(config);

    info!(
        repositories = config.repositories.len(),
        marker = %config.submission_marker,
        max_parallel = config.max_parallel_evaluations,
        "Configuration loaded"
    );
    if config.github_token.is_none() {
        warn!("GITHUB_TOKEN not set; only public repositories can be polled");
    }
    if config.sandbox.timeout_seconds.is_none() {
        warn!("Sandbox timeout is unbounded");
    }

    let store = RedisSubmissionStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("failed to connect to Redis at {}", config.redis_url))?;
    info!("Connected to Redis: {}", config.redis_url);

    let tags = GithubTagSource::new(&config.github_api, config.github_token.clone())
        .context("failed to build GitHub client")?;
    let poller = TagPoller::new(Arc::new(tags), config.submission_marker.clone());

    let recorder = SubmissionRecorder::new(
        Arc::new(store),
        config.store_write_attempts,
        config.store_retry_delay(),
    );

    let backend = DockerBackend::connect(config.sandbox.clone()).context("failed to connect to Docker")?;
    let fetcher = GitCheckout::new(
        config.git_host.clone(),
        config.github_token.clone(),
        config.workspace_dir.clone(),
    );
    let runner = SandboxRunner::new(backend, config.sandbox.clone());
    let evaluator = Evaluator::new(Arc::new(fetcher), runner, config.output_root.clone());

    let orchestrator = Orchestrator::new(
        config.repositories.clone(),
        poller,
        recorder,
        Arc::new(evaluator),
        config.max_parallel_evaluations,
    );

    let start = std::time::Instant::now();
    let summary = orchestrator.run().await;

    info!(
        repositories = summary.repositories_polled,
        poll_failures = summary.poll_failures,
        skipped = summary.skipped,
        succeeded = summary.succeeded,
        failed = summary.failed,
        unrecorded = summary.unrecorded,
        elapsed_ms = start.elapsed().as_millis(),
        "Grading pass complete"
    );

    if summary.unrecorded > 0 {
        anyhow::bail!("{} evaluated submissions could not be recorded", summary.unrecorded);
    }
    Ok(())
}
