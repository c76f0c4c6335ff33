// Submission recorder - dedup gate and status lifecycle on top of the store.
//
// pending (best effort) -> success | failed (terminal, retried on write failure)

use grader_common::store::{StoreError, SubmissionStore};
use grader_common::types::SubmissionRecord;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct SubmissionRecorder {
    store: Arc<dyn SubmissionStore>,
    write_attempts: u32,
    retry_delay: Duration,
}

impl SubmissionRecorder {
    pub fn new(store: Arc<dyn SubmissionStore>, write_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            store,
            write_attempts: write_attempts.max(1),
            retry_delay,
        }
    }

    /// True when a terminal record already exists for `(team, commit)`.
    /// A leftover `pending` record does not count: that evaluation never finished.
    pub async fn is_recorded(&self, team: &str, commit_hash: &str) -> Result<bool, StoreError> {
        let existing = self.store.get_item(team, commit_hash).await?;
        Ok(existing.map(|r| r.status.is_terminal()).unwrap_or(false))
    }

    /// Write the work-in-progress placeholder; failures are logged and ignored
    pub async fn mark_pending(&self, team: &str, commit_hash: &str) {
        let placeholder = SubmissionRecord::pending(team, commit_hash);
        match self.store.put_item(&placeholder).await {
            Ok(()) => debug!(team = %team, commit = %commit_hash, "Pending placeholder written"),
            Err(e) => warn!(
                team = %team,
                commit = %commit_hash,
                error = %e,
                "Failed to write pending placeholder; continuing"
            ),
        }
    }

    /// Persist a record. Terminal records are retried up to the configured
    /// number of attempts. Returns whether the write landed.
    pub async fn record(&self, record: &SubmissionRecord) -> bool {
        let attempts = if record.status.is_terminal() {
            self.write_attempts
        } else {
            1
        };

        let mut record = record.clone();
        for attempt in 1..=attempts {
            record.touch();
            match self.store.put_item(&record).await {
                Ok(()) => {
                    info!(
                        team = %record.team,
                        commit = %record.commit_hash,
                        status = %record.status,
                        score = record.score,
                        attempt = attempt,
                        "Submission recorded"
                    );
                    return true;
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        team = %record.team,
                        commit = %record.commit_hash,
                        attempt = attempt,
                        error = %e,
                        "Store write failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        team = %record.team,
                        commit = %record.commit_hash,
                        status = %record.status,
                        attempts = attempts,
                        error = %e,
                        "Failed to persist submission record"
                    );
                }
            }
        }
        false
    }
}
