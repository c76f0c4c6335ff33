// CLI commands for inspecting and producing submission results
use anyhow::{bail, Context, Result};
use grader_common::config::{GraderConfig, SandboxSettings};
use grader_common::policy::{policy_args, PolicyCatalog};
use grader_common::redis::RedisSubmissionStore;
use grader_common::store::SubmissionStore;
use grader_common::types::{EvaluationArtifact, Submission, SubmissionRecord, TagRef, Trial};
use grader_worker::checkout::LocalSource;
use grader_worker::engine::{DockerBackend, EntrypointOptions, SandboxRunner};
use grader_worker::evaluation::{EvaluationOutcome, Evaluator, SubmissionEvaluator};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Flag, then environment, then the worker's default
pub fn resolve_redis_url(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("REDIS_URL").ok())
        .unwrap_or_else(|| GraderConfig::default().redis_url)
}

async fn connect(redis_url: &str) -> Result<RedisSubmissionStore> {
    RedisSubmissionStore::connect(redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))
}

fn print_record(record: &SubmissionRecord) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

pub async fn export(redis_url: &str, out: &Path) -> Result<()> {
    println!("📦 Exporting submission records from {}...", redis_url);
    let store = connect(redis_url).await?;
    let records = store.scan().await.context("Failed to scan submission records")?;

    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(out, serde_json::to_string_pretty(&records)?)
        .with_context(|| format!("Failed to write {}", out.display()))?;

    println!("✅ Exported {} record(s) to {}", records.len(), out.display());
    Ok(())
}

pub async fn latest(redis_url: &str, team: &str) -> Result<()> {
    let store = connect(redis_url).await?;
    match store.query_latest(team).await? {
        Some(record) => print_record(&record),
        None => bail!("No submissions recorded for team '{}'", team),
    }
}

pub async fn show(redis_url: &str, team: &str, commit: &str) -> Result<()> {
    let store = connect(redis_url).await?;
    match store.get_item(team, commit).await? {
        Some(record) => print_record(&record),
        None => bail!("No record for {} at {}", team, commit),
    }
}

/// What a local run reports: the artifact with only its main trial
#[derive(Debug, Serialize)]
pub struct EvaluationSummary {
    pub class_name: String,
    pub parameters: Map<String, Value>,
    pub mean_profit: f64,
    pub std_profit: f64,
    pub num_runs: u32,
    pub score: f64,
    pub main_trial: Option<Trial>,
}

impl From<EvaluationArtifact> for EvaluationSummary {
    fn from(artifact: EvaluationArtifact) -> Self {
        let main_trial = artifact.main_trial().cloned();
        Self {
            class_name: artifact.class_name,
            parameters: artifact.parameters,
            mean_profit: artifact.mean_profit,
            std_profit: artifact.std_profit,
            num_runs: artifact.num_runs,
            score: artifact.score,
            main_trial,
        }
    }
}

/// Entrypoint arguments for the requested policy, checked against its schema
fn resolve_policy_args(class_name: Option<&str>, params: &[String], policies: &Path) -> Result<Vec<String>> {
    let Some(class_name) = class_name else {
        if !params.is_empty() {
            bail!("--param requires --class-name");
        }
        return Ok(Vec::new());
    };

    let catalog = PolicyCatalog::load(policies)?;
    let schema = catalog.get(class_name).with_context(|| {
        format!("Known policies: {}", catalog.class_names().join(", "))
    })?;
    let resolved = schema.resolve(params)?;
    Ok(policy_args(class_name, &resolved))
}

/// Policy selection followed by the run options, in entrypoint argument order
fn entrypoint_args(
    class_name: Option<&str>,
    params: &[String],
    policies: &Path,
    options: &EntrypointOptions,
) -> Result<Vec<String>> {
    let mut args = resolve_policy_args(class_name, params, policies)?;
    args.extend(options.to_args());
    Ok(args)
}

fn sandbox_settings(config: Option<&Path>) -> Result<SandboxSettings> {
    match config {
        Some(path) => Ok(GraderConfig::load(path)?.sandbox),
        None => Ok(SandboxSettings::default()),
    }
}

pub async fn evaluate(
    source: &Path,
    class_name: Option<&str>,
    params: &[String],
    policies: &Path,
    options: &EntrypointOptions,
    config: Option<&Path>,
    out: Option<&Path>,
) -> Result<()> {
    println!("🔍 Evaluating {}", source.display());

    let extra_args = entrypoint_args(class_name, params, policies, options)?;
    let settings = sandbox_settings(config)?;

    let backend = DockerBackend::connect(settings.clone()).context("Failed to connect to Docker")?;
    let runner = SandboxRunner::new(backend, settings).with_extra_args(extra_args);
    let output_root = tempfile::tempdir().context("Failed to create output directory")?;
    let evaluator = Evaluator::new(Arc::new(LocalSource::new(source)), runner, output_root.path());

    let submission = Submission::new("local", &TagRef::new("local", "working-tree"));
    match evaluator.evaluate(&submission).await {
        EvaluationOutcome::Success(artifact) => {
            let summary = EvaluationSummary::from(artifact);
            let rendered = serde_json::to_string_pretty(&summary)?;
            println!("{}", rendered);
            if let Some(out) = out {
                fs::write(out, &rendered).with_context(|| format!("Failed to write {}", out.display()))?;
                println!("💾 Saved to {}", out.display());
            }
            println!("✅ Score: {}", summary.score);
            Ok(())
        }
        EvaluationOutcome::Failure(failure) => {
            eprintln!("{}", failure.trace);
            bail!("{}", failure.message)
        }
    }
}
