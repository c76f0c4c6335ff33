/// Orchestrator - One Grading Pass Over Every Tracked Repository
///
/// **Flow per repository:**
/// 1. Poll submission tags (a failing repository is logged and skipped)
/// 2. Collapse tags that point at the same commit
/// 3. Gate every commit through the recorder (terminal records are skipped)
/// 4. pending → evaluate → terminal record, for each eligible commit
///
/// Evaluations are independent and run up to `max_parallel` at a time; each
/// one gets its own checkout and output mount from the evaluator.

use futures_util::stream::{self, StreamExt};
use grader_common::types::{Submission, SubmissionRecord};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::evaluation::{EvaluationOutcome, SubmissionEvaluator};
use crate::poller::TagPoller;
use crate::recorder::SubmissionRecorder;

/// Counters for one `run()` invocation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub repositories_polled: usize,
    pub poll_failures: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Evaluated, but the terminal write never landed
    pub unrecorded: usize,
}

impl RunSummary {
    pub fn evaluated(&self) -> usize {
        self.succeeded + self.failed + self.unrecorded
    }
}

enum Processed {
    Succeeded,
    Failed,
    Unrecorded,
}

pub struct Orchestrator {
    repositories: Vec<String>,
    poller: TagPoller,
    recorder: SubmissionRecorder,
    evaluator: Arc<dyn SubmissionEvaluator>,
    max_parallel: usize,
}

impl Orchestrator {
    pub fn new(
        repositories: Vec<String>,
        poller: TagPoller,
        recorder: SubmissionRecorder,
        evaluator: Arc<dyn SubmissionEvaluator>,
        max_parallel: usize,
    ) -> Self {
        Self {
            repositories,
            poller,
            recorder,
            evaluator,
            max_parallel: max_parallel.max(1),
        }
    }

    #[tracing::instrument(skip(self), fields(repositories = self.repositories.len(), max_parallel = self.max_parallel))]
    pub async fn run(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut eligible = Vec::new();

        for repo in &self.repositories {
            summary.repositories_polled += 1;
            match self.poller.list_submission_tags(repo).await {
                Ok(tags) => {
                    let submissions = dedup_commits(repo, tags.iter().map(|t| Submission::new(repo.as_str(), t)));
                    eligible.extend(self.gate(submissions, &mut summary).await);
                }
                Err(e) => {
                    summary.poll_failures += 1;
                    error!(repo = %repo, error = %e, "Failed to poll repository; continuing with the rest");
                }
            }
        }

        info!(eligible = eligible.len(), skipped = summary.skipped, "Submissions discovered");

        let results: Vec<Processed> = stream::iter(eligible)
            .map(|submission| self.process(submission))
            .buffer_unordered(self.max_parallel)
            .collect()
            .await;

        for processed in results {
            match processed {
                Processed::Succeeded => summary.succeeded += 1,
                Processed::Failed => summary.failed += 1,
                Processed::Unrecorded => summary.unrecorded += 1,
            }
        }
        summary
    }

    /// Drop commits that already hold a terminal record
    async fn gate(&self, submissions: Vec<Submission>, summary: &mut RunSummary) -> Vec<Submission> {
        let mut eligible = Vec::new();
        for submission in submissions {
            match self.recorder.is_recorded(&submission.team, &submission.commit_hash).await {
                Ok(false) => eligible.push(submission),
                Ok(true) => summary.skipped += 1,
                Err(e) => {
                    // Unknown state: leave it for the next invocation rather than risk a double run
                    summary.skipped += 1;
                    warn!(
                        team = %submission.team,
                        commit = %submission.commit_hash,
                        error = %e,
                        "Could not check submission record, skipping"
                    );
                }
            }
        }
        eligible
    }

    #[tracing::instrument(skip(self, submission), fields(team = %submission.team, tag = %submission.tag, commit = %submission.commit_hash))]
    async fn process(&self, submission: Submission) -> Processed {
        info!("Evaluating submission");
        self.recorder.mark_pending(&submission.team, &submission.commit_hash).await;

        let outcome = self.evaluator.evaluate(&submission).await;
        let succeeded = outcome.is_success();
        let record = match outcome {
            EvaluationOutcome::Success(artifact) => {
                SubmissionRecord::success(&submission.team, &submission.commit_hash, artifact)
            }
            EvaluationOutcome::Failure(failure) => SubmissionRecord::failed(
                &submission.team,
                &submission.commit_hash,
                failure.message,
                failure.trace,
            ),
        };

        match (self.recorder.record(&record).await, succeeded) {
            (false, _) => Processed::Unrecorded,
            (true, true) => Processed::Succeeded,
            (true, false) => Processed::Failed,
        }
    }
}

/// Keep the first tag seen for each commit
fn dedup_commits(repo: &str, submissions: impl Iterator<Item = Submission>) -> Vec<Submission> {
    let mut seen = HashSet::new();
    submissions
        .filter(|s| {
            let fresh = seen.insert(s.commit_hash.clone());
            if !fresh {
                info!(repo = %repo, tag = %s.tag, commit = %s.commit_hash, "Tag shares an already listed commit");
            }
            fresh
        })
        .collect()
}
