use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Lifecycle of a submission record.
///
/// `Pending` is a placeholder written before evaluation starts. `Success`
/// and `Failed` are terminal: once either is stored the commit is never
/// evaluated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Success,
    Failed,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionStatus::Success | SubmissionStatus::Failed)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionStatus::Pending => write!(f, "pending"),
            SubmissionStatus::Success => write!(f, "success"),
            SubmissionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A tag on a tracked repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRef {
    pub name: String,
    pub commit_sha: String,
}

impl TagRef {
    pub fn new(name: impl Into<String>, commit_sha: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commit_sha: commit_sha.into(),
        }
    }

    /// Submission tags are recognised by a marker substring anywhere in the name
    pub fn is_submission(&self, marker: &str) -> bool {
        self.name.contains(marker)
    }
}

/// One discovered submission: a team's tagged commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub team: String,
    pub tag: String,
    pub commit_hash: String,
}

impl Submission {
    pub fn new(team: impl Into<String>, tag: &TagRef) -> Self {
        Self {
            team: team.into(),
            tag: tag.name.clone(),
            commit_hash: tag.commit_sha.clone(),
        }
    }
}

/// A single simulated episode inside an evaluation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub actions: Vec<f64>,
    pub profits: Vec<f64>,
    pub socs: Vec<f64>,
    pub market_prices: Vec<f64>,
    pub start_step: u64,
    pub episode_length: u64,
}

/// Result file written by the sandboxed program.
///
/// Produced fresh inside the sandbox for every run and consumed exactly once
/// by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationArtifact {
    pub class_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub mean_profit: f64,
    pub std_profit: f64,
    pub num_runs: u32,
    pub score: f64,
    pub trials: Vec<Trial>,
    pub main_trial_idx: usize,
}

impl EvaluationArtifact {
    pub fn main_trial(&self) -> Option<&Trial> {
        self.trials.get(self.main_trial_idx)
    }
}

/// Persisted outcome for one `(team, commit_hash)` key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub team: String,
    pub commit_hash: String,
    pub status: SubmissionStatus,
    pub score: f64,
    pub error: Option<String>,
    pub error_traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_runs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_trial: Option<Trial>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub submitted_at: DateTime<Utc>,
}

impl SubmissionRecord {
    fn base(team: &str, commit_hash: &str, status: SubmissionStatus) -> Self {
        Self {
            team: team.to_string(),
            commit_hash: commit_hash.to_string(),
            status,
            score: 0.0,
            error: None,
            error_traceback: None,
            class_name: None,
            parameters: None,
            mean_profit: None,
            std_profit: None,
            num_runs: None,
            main_trial: None,
            submitted_at: Utc::now(),
        }
    }

    /// Work-in-progress placeholder
    pub fn pending(team: &str, commit_hash: &str) -> Self {
        Self::base(team, commit_hash, SubmissionStatus::Pending)
    }

    /// Terminal record for a completed evaluation; the full trial list is
    /// reduced to the main trial.
    pub fn success(team: &str, commit_hash: &str, artifact: EvaluationArtifact) -> Self {
        let main_trial = artifact.main_trial().cloned();
        Self {
            score: artifact.score,
            class_name: Some(artifact.class_name),
            parameters: Some(artifact.parameters),
            mean_profit: Some(artifact.mean_profit),
            std_profit: Some(artifact.std_profit),
            num_runs: Some(artifact.num_runs),
            main_trial,
            ..Self::base(team, commit_hash, SubmissionStatus::Success)
        }
    }

    /// Terminal record for an evaluation that could not produce a score
    pub fn failed(team: &str, commit_hash: &str, error: String, traceback: String) -> Self {
        Self {
            error: Some(error),
            error_traceback: Some(traceback),
            ..Self::base(team, commit_hash, SubmissionStatus::Failed)
        }
    }

    /// Restamp the write time. Stores persist `submitted_at` as given; the
    /// recorder calls this before each write attempt.
    pub fn touch(&mut self) {
        self.submitted_at = Utc::now();
    }
}
