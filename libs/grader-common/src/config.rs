// Grader configuration
// Loaded once at startup from config/grader.json, overridden by environment, then
// shared read-only with every component.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/grader.json";
pub const OUTPUT_FILE_PLACEHOLDER: &str = "{output_file}";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Sandbox invocation and the optional hardening knobs.
///
/// Every limit is unset by default: none of them is assumed by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Entrypoint run inside the container; `{output_file}` expands to the
    /// in-container artifact path
    pub command: Vec<String>,
    /// Where the host output mount is bound inside the container
    pub container_mount: String,
    /// Artifact file name under the mount
    pub artifact_file: String,
    pub timeout_seconds: Option<u64>,
    pub memory_limit_mb: Option<u32>,
    pub cpu_limit: Option<f32>,
    pub network_disabled: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            command: vec![
                "python".to_string(),
                "evaluate.py".to_string(),
                "--output_file".to_string(),
                OUTPUT_FILE_PLACEHOLDER.to_string(),
            ],
            container_mount: "/grader/output".to_string(),
            artifact_file: "output.json".to_string(),
            timeout_seconds: None,
            memory_limit_mb: None,
            cpu_limit: None,
            network_disabled: false,
        }
    }
}

impl SandboxSettings {
    /// In-container path of the artifact file
    pub fn container_output_file(&self) -> String {
        format!(
            "{}/{}",
            self.container_mount.trim_end_matches('/'),
            self.artifact_file
        )
    }

    /// Entrypoint with the artifact placeholder expanded
    pub fn render_command(&self) -> Vec<String> {
        let output_file = self.container_output_file();
        self.command
            .iter()
            .map(|arg| arg.replace(OUTPUT_FILE_PLACEHOLDER, &output_file))
            .collect()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    /// Tracked repositories as `owner/name`; the full name is the team key
    pub repositories: Vec<String>,
    pub submission_marker: String,
    pub github_api: String,
    /// Repository host token; usually supplied through `GITHUB_TOKEN`
    #[serde(skip_serializing)]
    pub github_token: Option<String>,
    pub git_host: String,
    pub redis_url: String,
    /// Parent directory for per-evaluation source checkouts
    pub workspace_dir: PathBuf,
    /// Parent directory for per-evaluation output mounts
    pub output_root: PathBuf,
    pub sandbox: SandboxSettings,
    pub max_parallel_evaluations: usize,
    pub store_write_attempts: u32,
    pub store_retry_delay_ms: u64,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            repositories: Vec::new(),
            submission_marker: "submission".to_string(),
            github_api: "https://api.github.com".to_string(),
            github_token: None,
            git_host: "github.com".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            workspace_dir: PathBuf::from("submissions"),
            output_root: PathBuf::from("output"),
            sandbox: SandboxSettings::default(),
            max_parallel_evaluations: 1,
            store_write_attempts: 2,
            store_retry_delay_ms: 500,
        }
    }
}

impl GraderConfig {
    /// Load from a JSON file, apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from `GRADER_CONFIG` or the default path
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = std::env::var("GRADER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(Path::new(&path))
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Environment wins over the file for connection strings and credentials
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("REDIS_URL") {
            self.redis_url = url;
        }
        if let Some(token) = lookup("GITHUB_TOKEN").filter(|t| !t.is_empty()) {
            self.github_token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repositories.is_empty() {
            return Err(ConfigError::Invalid("no repositories configured".into()));
        }
        if let Some(bad) = self.repositories.iter().find(|r| r.split('/').count() != 2) {
            return Err(ConfigError::Invalid(format!(
                "repository '{}' must be of the form owner/name",
                bad
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.repositories.iter().find(|r| !seen.insert(r.as_str())) {
            return Err(ConfigError::Invalid(format!("repository '{}' is listed twice", dup)));
        }
        if self.submission_marker.is_empty() {
            return Err(ConfigError::Invalid("submission_marker cannot be empty".into()));
        }
        if !self.sandbox.command.iter().any(|a| a.contains(OUTPUT_FILE_PLACEHOLDER)) {
            return Err(ConfigError::Invalid(format!(
                "sandbox.command must reference {}",
                OUTPUT_FILE_PLACEHOLDER
            )));
        }
        if !self.sandbox.container_mount.starts_with('/') {
            return Err(ConfigError::Invalid("sandbox.container_mount must be absolute".into()));
        }
        if self.sandbox.timeout_seconds == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.timeout_seconds must be positive; omit it for no limit".into(),
            ));
        }
        if self.max_parallel_evaluations == 0 {
            return Err(ConfigError::Invalid("max_parallel_evaluations must be at least 1".into()));
        }
        if self.store_write_attempts == 0 {
            return Err(ConfigError::Invalid("store_write_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn store_retry_delay(&self) -> Duration {
        Duration::from_millis(self.store_retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> GraderConfig {
        GraderConfig {
            repositories: vec!["org/team-a".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_command_renders_output_file() {
        let settings = SandboxSettings::default();
        assert_eq!(
            settings.render_command(),
            vec!["python", "evaluate.py", "--output_file", "/grader/output/output.json"]
        );
        assert!(settings.timeout().is_none());
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"repositories": ["org/team-a"], "sandbox": {{"timeout_seconds": 600}}}}"#).unwrap();

        let config = GraderConfig::from_file(file.path()).unwrap();
        assert_eq!(config.repositories, vec!["org/team-a"]);
        assert_eq!(config.submission_marker, "submission");
        assert_eq!(config.sandbox.timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.sandbox.artifact_file, "output.json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = GraderConfig::from_file(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = valid();
        config.apply_env(|key| match key {
            "REDIS_URL" => Some("redis://cache:6379".to_string()),
            "GITHUB_TOKEN" => Some("ghp_secret".to_string()),
            _ => None,
        });
        assert_eq!(config.redis_url, "redis://cache:6379");
        assert_eq!(config.github_token.as_deref(), Some("ghp_secret"));
    }

    #[test]
    fn test_token_is_never_serialized() {
        let config = GraderConfig {
            github_token: Some("ghp_secret".to_string()),
            ..valid()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("ghp_secret"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(GraderConfig::default().validate().is_err());

        let bad_repo = GraderConfig {
            repositories: vec!["just-a-name".to_string()],
            ..Default::default()
        };
        assert!(bad_repo.validate().is_err());

        let mut no_placeholder = valid();
        no_placeholder.sandbox.command = vec!["python".into(), "evaluate.py".into()];
        assert!(no_placeholder.validate().is_err());

        let no_parallelism = GraderConfig {
            max_parallel_evaluations: 0,
            ..valid()
        };
        assert!(no_parallelism.validate().is_err());

        let mut zero_timeout = valid();
        zero_timeout.sandbox.timeout_seconds = Some(0);
        assert!(zero_timeout.validate().is_err());

        let mut positive_timeout = valid();
        positive_timeout.sandbox.timeout_seconds = Some(1);
        assert!(positive_timeout.validate().is_ok());

        let duplicated = GraderConfig {
            repositories: vec!["org/team-a".into(), "org/team-b".into(), "org/team-a".into()],
            ..Default::default()
        };
        assert!(matches!(
            duplicated.validate(),
            Err(ConfigError::Invalid(ref msg)) if msg.contains("org/team-a")
        ));

        let no_writes = GraderConfig {
            store_write_attempts: 0,
            ..valid()
        };
        assert!(no_writes.validate().is_err());
    }
}
