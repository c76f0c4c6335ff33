/// Evaluation Step - One Submission, One Outcome
///
/// **Responsibility:**
/// Check out a submission, run it in the sandbox, extract its artifact, and
/// fold every failure along the way into an explicit outcome value.
///
/// This module is the glue layer - it knows nothing about:
/// - How containers are managed (engine's job)
/// - How artifacts are parsed (extractor's job)
/// - How outcomes are persisted (recorder's job)

use async_trait::async_trait;
use grader_common::types::{EvaluationArtifact, Submission};
use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::checkout::{CheckoutError, SourceFetcher};
use crate::engine::{SandboxBackend, SandboxError, SandboxRunner};
use crate::extractor::{ArtifactError, ArtifactExtractor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Checkout,
    Build,
    Runtime,
    Timeout,
    ArtifactMissing,
    ArtifactMalformed,
    Infrastructure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Checkout => "CheckoutError",
            FailureKind::Build => "BuildError",
            FailureKind::Runtime => "RuntimeError",
            FailureKind::Timeout => "TimeoutError",
            FailureKind::ArtifactMissing => "ArtifactMissing",
            FailureKind::ArtifactMalformed => "ArtifactMalformed",
            FailureKind::Infrastructure => "InfrastructureError",
        };
        write!(f, "{}", name)
    }
}

/// Why a submission could not be scored, in a form a team can act on
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationFailure {
    pub kind: FailureKind,
    pub message: String,
    pub trace: String,
}

impl EvaluationFailure {
    pub fn new(kind: FailureKind, error: &(dyn StdError + 'static), log_tail: Option<&str>) -> Self {
        Self {
            kind,
            message: format!("{}: {}", kind, error),
            trace: render_trace(error, log_tail),
        }
    }
}

/// Error source chain, followed by the tail of the sandbox log when present
fn render_trace(error: &(dyn StdError + 'static), log_tail: Option<&str>) -> String {
    let mut trace = format!("Error: {}", error);
    let mut source = error.source();
    while let Some(cause) = source {
        trace.push_str(&format!("\nCaused by: {}", cause));
        source = cause.source();
    }
    if let Some(tail) = log_tail.filter(|t| !t.is_empty()) {
        trace.push_str("\n\nSandbox output (tail):\n");
        trace.push_str(tail);
    }
    trace
}

impl From<&CheckoutError> for EvaluationFailure {
    fn from(e: &CheckoutError) -> Self {
        EvaluationFailure::new(FailureKind::Checkout, e, None)
    }
}

impl From<&SandboxError> for EvaluationFailure {
    fn from(e: &SandboxError) -> Self {
        let kind = match e {
            SandboxError::Build { .. } => FailureKind::Build,
            SandboxError::Runtime { .. } => FailureKind::Runtime,
            SandboxError::Timeout { .. } => FailureKind::Timeout,
            SandboxError::Docker(_) | SandboxError::Io(_) => FailureKind::Infrastructure,
        };
        EvaluationFailure::new(kind, e, e.log_tail())
    }
}

impl From<&ArtifactError> for EvaluationFailure {
    fn from(e: &ArtifactError) -> Self {
        let kind = match e {
            ArtifactError::Missing(_) => FailureKind::ArtifactMissing,
            ArtifactError::Malformed { .. } => FailureKind::ArtifactMalformed,
            ArtifactError::Io { .. } => FailureKind::Infrastructure,
        };
        EvaluationFailure::new(kind, e, None)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    Success(EvaluationArtifact),
    Failure(EvaluationFailure),
}

impl EvaluationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, EvaluationOutcome::Success(_))
    }
}

/// Produces an outcome for one submission; never fails outright
#[async_trait]
pub trait SubmissionEvaluator: Send + Sync {
    async fn evaluate(&self, submission: &Submission) -> EvaluationOutcome;
}

/// Checkout → sandbox → extractor, each evaluation on its own output mount
pub struct Evaluator<B: SandboxBackend> {
    fetcher: Arc<dyn SourceFetcher>,
    runner: SandboxRunner<B>,
    extractor: ArtifactExtractor,
    output_root: PathBuf,
}

impl<B: SandboxBackend> Evaluator<B> {
    pub fn new(fetcher: Arc<dyn SourceFetcher>, runner: SandboxRunner<B>, output_root: impl Into<PathBuf>) -> Self {
        let extractor = ArtifactExtractor::new(runner.settings().artifact_file.clone());
        Self {
            fetcher,
            runner,
            extractor,
            output_root: output_root.into(),
        }
    }

    async fn run(&self, submission: &Submission, mount: &std::path::Path) -> EvaluationOutcome {
        let source = match self.fetcher.fetch(&submission.team, &submission.commit_hash).await {
            Ok(source) => source,
            Err(e) => return EvaluationOutcome::Failure((&e).into()),
        };

        if let Err(e) = self.runner.execute(source.path(), mount).await {
            return EvaluationOutcome::Failure((&e).into());
        }

        match self.extractor.extract(mount).await {
            Ok(artifact) => EvaluationOutcome::Success(artifact),
            Err(e) => EvaluationOutcome::Failure((&e).into()),
        }
    }
}

#[async_trait]
impl<B: SandboxBackend> SubmissionEvaluator for Evaluator<B> {
    #[tracing::instrument(skip(self, submission), fields(team = %submission.team, commit = %submission.commit_hash))]
    async fn evaluate(&self, submission: &Submission) -> EvaluationOutcome {
        // Private mount per evaluation: the handoff channel is single-writer
        let mount = self.output_root.join(uuid::Uuid::new_v4().to_string());
        if let Err(e) = tokio::fs::create_dir_all(&mount).await {
            let error = SandboxError::Io(e);
            return EvaluationOutcome::Failure((&error).into());
        }

        let outcome = self.run(submission, &mount).await;

        if let Err(e) = tokio::fs::remove_dir_all(&mount).await {
            warn!(mount = %mount.display(), error = %e, "Failed to remove output mount");
        }

        match &outcome {
            EvaluationOutcome::Success(artifact) => {
                info!(score = artifact.score, mean_profit = artifact.mean_profit, "Evaluation succeeded")
            }
            EvaluationOutcome::Failure(failure) => {
                warn!(kind = %failure.kind, error = %failure.message, "Evaluation failed")
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::LocalSource;
    use crate::engine::fake::{Behavior, FakeBackend};
    use crate::extractor::tests::VALID_ARTIFACT;
    use grader_common::config::SandboxSettings;
    use grader_common::types::TagRef;

    fn submission(commit: &str) -> Submission {
        Submission::new("org/team-a", &TagRef::new("submission-3", commit))
    }

    fn evaluator(backend: FakeBackend, output_root: &std::path::Path) -> Evaluator<FakeBackend> {
        let runner = SandboxRunner::new(backend, SandboxSettings::default());
        Evaluator::new(Arc::new(LocalSource::new(std::env::temp_dir())), runner, output_root)
    }

    #[tokio::test]
    async fn test_successful_evaluation() {
        let root = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new(Behavior::WriteArtifact(VALID_ARTIFACT.to_string()));

        let outcome = evaluator(backend.clone(), root.path()).evaluate(&submission("abc123")).await;

        match outcome {
            EvaluationOutcome::Success(artifact) => assert_eq!(artifact.score, 12.5),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(backend.live_images(), 0);
        // The per-evaluation mount is gone afterwards
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_clean_exit_without_artifact_is_missing() {
        let root = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new(Behavior::ExitCleanly);

        let outcome = evaluator(backend, root.path()).evaluate(&submission("abc123")).await;

        match outcome {
            EvaluationOutcome::Failure(failure) => {
                assert_eq!(failure.kind, FailureKind::ArtifactMissing);
                assert!(failure.message.starts_with("ArtifactMissing"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_runtime_failure_carries_log_tail() {
        let root = tempfile::tempdir().unwrap();
        let backend = FakeBackend::new(Behavior::Exit(2));

        let outcome = evaluator(backend, root.path()).evaluate(&submission("abc123")).await;

        match outcome {
            EvaluationOutcome::Failure(failure) => {
                assert_eq!(failure.kind, FailureKind::Runtime);
                assert!(failure.trace.contains("exited with code 2"));
                assert!(failure.trace.contains("Sandbox output (tail)"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_build_and_checkout_failures() {
        let root = tempfile::tempdir().unwrap();
        let mut backend = FakeBackend::new(Behavior::ExitCleanly);
        backend.fail_build = true;
        let outcome = evaluator(backend, root.path()).evaluate(&submission("abc123")).await;
        assert!(matches!(outcome, EvaluationOutcome::Failure(ref f) if f.kind == FailureKind::Build));

        let runner = SandboxRunner::new(FakeBackend::new(Behavior::ExitCleanly), SandboxSettings::default());
        let missing = Evaluator::new(Arc::new(LocalSource::new("/no/such/source")), runner, root.path());
        let outcome = missing.evaluate(&submission("abc123")).await;
        assert!(matches!(outcome, EvaluationOutcome::Failure(ref f) if f.kind == FailureKind::Checkout));
    }

    #[tokio::test]
    async fn test_concurrent_evaluations_use_distinct_mounts() {
        let root = tempfile::tempdir().unwrap();
        let artifact_a = VALID_ARTIFACT.to_string();
        let artifact_b = VALID_ARTIFACT.replace(r#""score": 12.5"#, r#""score": 99.0"#);

        let backend_a = FakeBackend::new(Behavior::WriteArtifact(artifact_a));
        let backend_b = FakeBackend::new(Behavior::WriteArtifact(artifact_b));
        let eval_a = evaluator(backend_a.clone(), root.path());
        let eval_b = evaluator(backend_b.clone(), root.path());

        let sub_a = submission("aaa");
        let sub_b = submission("bbb");
        let (a, b) = tokio::join!(eval_a.evaluate(&sub_a), eval_b.evaluate(&sub_b));

        match (a, b) {
            (EvaluationOutcome::Success(a), EvaluationOutcome::Success(b)) => {
                assert_eq!(a.score, 12.5);
                assert_eq!(b.score, 99.0);
            }
            other => panic!("unexpected outcomes: {other:?}"),
        }
        let mount_a = backend_a.state.lock().unwrap().mounts[0].clone();
        let mount_b = backend_b.state.lock().unwrap().mounts[0].clone();
        assert_ne!(mount_a, mount_b);
    }

    #[test]
    fn test_outcome_success_flag() {
        let artifact = serde_json::from_str(VALID_ARTIFACT).unwrap();
        assert!(EvaluationOutcome::Success(artifact).is_success());

        let err = ArtifactError::Missing(PathBuf::from("/out/output.json"));
        assert!(!EvaluationOutcome::Failure((&err).into()).is_success());
    }

    #[test]
    fn test_trace_renders_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ArtifactError::Io {
            path: PathBuf::from("/out/output.json"),
            source: io,
        };
        let failure = EvaluationFailure::from(&err);
        assert_eq!(failure.kind, FailureKind::Infrastructure);
        assert!(failure.trace.contains("Caused by: denied"));
    }
}
