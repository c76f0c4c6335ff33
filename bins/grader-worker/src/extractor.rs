// Result extraction - reads the artifact the sandboxed program left in the
// output mount, then deletes it so the mount never serves a stale result.

use grader_common::types::EvaluationArtifact;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("no result file at {0}; the submission exited without writing output")]
    Missing(PathBuf),

    #[error("result file {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("failed to access result file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ArtifactExtractor {
    file_name: String,
}

impl ArtifactExtractor {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn artifact_path(&self, output_mount: &Path) -> PathBuf {
        output_mount.join(&self.file_name)
    }

    /// Read, delete and parse the artifact under `output_mount`
    pub async fn extract(&self, output_mount: &Path) -> Result<EvaluationArtifact, ArtifactError> {
        let path = self.artifact_path(output_mount);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ArtifactError::Missing(path)),
            Err(source) => return Err(ArtifactError::Io { path, source }),
        };

        // Consumed once read, whether or not it parses
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to delete consumed result file");
        }

        let artifact: EvaluationArtifact =
            serde_json::from_slice(&bytes).map_err(|e| ArtifactError::Malformed {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        if artifact.main_trial().is_none() {
            return Err(ArtifactError::Malformed {
                path,
                reason: format!(
                    "main_trial_idx {} is out of range for {} trials",
                    artifact.main_trial_idx,
                    artifact.trials.len()
                ),
            });
        }

        debug!(
            class_name = %artifact.class_name,
            trials = artifact.trials.len(),
            score = artifact.score,
            "Result file extracted"
        );
        Ok(artifact)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const VALID_ARTIFACT: &str = r#"{
        "class_name": "MovingAveragePolicy",
        "parameters": {"window_size": 5},
        "mean_profit": 12.5,
        "std_profit": 1.1,
        "num_runs": 2,
        "score": 12.5,
        "trials": [
            {"actions": [10.0, -10.0], "profits": [0.5, 1.25], "socs": [5.0, 0.0],
             "market_prices": [0.2, 0.4], "start_step": 0, "episode_length": 2},
            {"actions": [0], "profits": [3.0], "socs": [0.0],
             "market_prices": [0.3], "start_step": 17, "episode_length": 1}
        ],
        "main_trial_idx": 0
    }"#;

    #[tokio::test]
    async fn test_extract_valid_artifact_and_delete() {
        let mount = tempfile::tempdir().unwrap();
        std::fs::write(mount.path().join("output.json"), VALID_ARTIFACT).unwrap();
        let extractor = ArtifactExtractor::new("output.json");

        let artifact = extractor.extract(mount.path()).await.unwrap();

        assert_eq!(artifact.class_name, "MovingAveragePolicy");
        assert_eq!(artifact.score, 12.5);
        assert_eq!(artifact.trials.len(), 2);
        assert_eq!(artifact.trials[1].start_step, 17);
        assert!(!mount.path().join("output.json").exists());

        // A second read on the same mount never sees the old result
        assert!(matches!(
            extractor.extract(mount.path()).await,
            Err(ArtifactError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let mount = tempfile::tempdir().unwrap();
        let err = ArtifactExtractor::new("output.json")
            .extract(mount.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Missing(_)));
    }

    #[tokio::test]
    async fn test_wrong_shape_is_malformed() {
        let mount = tempfile::tempdir().unwrap();
        std::fs::write(mount.path().join("output.json"), r#"{"score": "high"}"#).unwrap();

        let err = ArtifactExtractor::new("output.json")
            .extract(mount.path())
            .await
            .unwrap_err();

        assert!(matches!(err, ArtifactError::Malformed { .. }));
        assert!(!mount.path().join("output.json").exists());
    }

    #[tokio::test]
    async fn test_truncated_json_is_malformed() {
        let mount = tempfile::tempdir().unwrap();
        std::fs::write(mount.path().join("output.json"), &VALID_ARTIFACT[..40]).unwrap();

        let err = ArtifactExtractor::new("output.json")
            .extract(mount.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_main_trial_index_out_of_range() {
        let mount = tempfile::tempdir().unwrap();
        let body = VALID_ARTIFACT.replace(r#""main_trial_idx": 0"#, r#""main_trial_idx": 9"#);
        std::fs::write(mount.path().join("output.json"), body).unwrap();

        let err = ArtifactExtractor::new("output.json")
            .extract(mount.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Malformed { ref reason, .. } if reason.contains("out of range")));
    }
}
