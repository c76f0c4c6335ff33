/// Sandbox Engine - Ephemeral Container Lifecycle
///
/// **Core Responsibility:**
/// Build an image from a submission's source tree, run it once with the
/// output mount bound read-write, stream its logs, and tear everything down.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to run a submission (image, container, mount)
/// - Engine does NOT read or interpret the artifact (extractor's job)
/// - Engine does NOT record outcomes (recorder's job)
///
/// **Cleanup Invariant:**
/// Every image and container created by one `execute` call is removed before
/// the call returns, whatever the outcome. Teardown steps tolerate resources
/// that were never created or are already gone.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::RemoveImageOptions;
use bollard::Docker;
use futures_util::stream::{BoxStream, StreamExt};
use grader_common::config::SandboxSettings;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Number of trailing log lines kept for failure reports
const LOG_TAIL_LINES: usize = 40;

/// Grace period given to a running container before it is killed
const STOP_GRACE_SECONDS: i64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("image build failed for {tag}: {message}")]
    Build { tag: String, message: String },

    #[error("submission exited with code {exit_code}")]
    Runtime { exit_code: i64, log_tail: String },

    #[error("submission exceeded the {seconds}s execution limit")]
    Timeout { seconds: u64, log_tail: String },

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("sandbox io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Trailing container output captured before the failure, if any
    pub fn log_tail(&self) -> Option<&str> {
        match self {
            SandboxError::Runtime { log_tail, .. } | SandboxError::Timeout { log_tail, .. } => {
                Some(log_tail.as_str())
            }
            _ => None,
        }
    }
}

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Host directory bound into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountBinding {
    pub host_path: PathBuf,
    pub container_path: String,
}

impl MountBinding {
    fn to_bind_spec(&self) -> String {
        format!("{}:{}:rw", self.host_path.display(), self.container_path)
    }
}

/// Primitive operations of an isolation backend.
///
/// Creating and starting an instance are separate steps so that an instance
/// that was created but failed to start is still known to the caller and torn
/// down. `stop`, `remove` and `remove_image` must succeed when the target no
/// longer exists.
#[async_trait]
pub trait SandboxBackend: Clone + Send + Sync + 'static {
    async fn build(&self, source_dir: &Path, tag: &str) -> SandboxResult<()>;

    async fn create(&self, tag: &str, command: &[String], mount: &MountBinding) -> SandboxResult<String>;

    async fn start(&self, instance: &str) -> SandboxResult<()>;

    fn stream_logs(&self, instance: &str) -> BoxStream<'static, SandboxResult<String>>;

    /// Block until the instance exits and return its exit code
    async fn wait(&self, instance: &str) -> SandboxResult<i64>;

    async fn stop(&self, instance: &str) -> SandboxResult<()>;

    async fn remove(&self, instance: &str) -> SandboxResult<()>;

    async fn remove_image(&self, tag: &str) -> SandboxResult<()>;
}

/// Docker backend: images are built with the docker CLI, everything else goes
/// through the daemon API.
#[derive(Clone)]
pub struct DockerBackend {
    docker: Docker,
    settings: SandboxSettings,
}

impl DockerBackend {
    pub fn connect(settings: SandboxSettings) -> SandboxResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker, settings })
    }

    fn host_config(&self, mount: &MountBinding) -> bollard::models::HostConfig {
        bollard::models::HostConfig {
            binds: Some(vec![mount.to_bind_spec()]),
            memory: self
                .settings
                .memory_limit_mb
                .map(|mb| i64::from(mb) * 1024 * 1024),
            nano_cpus: self
                .settings
                .cpu_limit
                .map(|cpus| (f64::from(cpus) * 1_000_000_000.0) as i64),
            ..Default::default()
        }
    }
}

/// 404 from the daemon means the resource is already gone
fn ignore_missing(result: Result<(), bollard::errors::Error>) -> SandboxResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    #[tracing::instrument(skip(self, source_dir), fields(source = %source_dir.display()))]
    async fn build(&self, source_dir: &Path, tag: &str) -> SandboxResult<()> {
        let mut child = Command::new("docker")
            .args(["build", "-t", tag])
            .arg(source_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // stdout is streamed, stderr is kept for the failure message
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "sandbox", "{}", line);
                    push_bounded(&mut tail, line);
                }
            }
            tail
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                debug!(target: "sandbox", "{}", line);
            }
        }

        let status = child.wait().await?;
        let tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(SandboxError::Build {
                tag: tag.to_string(),
                message: join_tail(&tail),
            });
        }
        Ok(())
    }

    async fn create(&self, tag: &str, command: &[String], mount: &MountBinding) -> SandboxResult<String> {
        let config = Config {
            image: Some(tag.to_string()),
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(self.settings.network_disabled),
            host_config: Some(self.host_config(mount)),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: tag,
            platform: None,
        };

        let container = self.docker.create_container(Some(create_options), config).await?;
        Ok(container.id)
    }

    async fn start(&self, instance: &str) -> SandboxResult<()> {
        self.docker
            .start_container(instance, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    fn stream_logs(&self, instance: &str) -> BoxStream<'static, SandboxResult<String>> {
        let logs_options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        });

        self.docker
            .logs(instance, logs_options)
            .map(|chunk| match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    Ok(String::from_utf8_lossy(&message).trim_end().to_string())
                }
                Ok(LogOutput::StdIn { .. }) => Ok(String::new()),
                Err(e) => Err(SandboxError::from(e)),
            })
            .boxed()
    }

    async fn wait(&self, instance: &str) -> SandboxResult<i64> {
        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.docker.wait_container(instance, Some(wait_options));

        match wait_stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "no wait response from container",
            ))),
        }
    }

    async fn stop(&self, instance: &str) -> SandboxResult<()> {
        ignore_missing(
            self.docker
                .stop_container(instance, Some(StopContainerOptions { t: STOP_GRACE_SECONDS }))
                .await,
        )
    }

    async fn remove(&self, instance: &str) -> SandboxResult<()> {
        let remove_options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        ignore_missing(self.docker.remove_container(instance, Some(remove_options)).await)
    }

    async fn remove_image(&self, tag: &str) -> SandboxResult<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        ignore_missing(self.docker.remove_image(tag, Some(options), None).await.map(|_| ()))
    }
}

/// Teardown guard - tracks what one `execute` call created.
///
/// `release` tears down explicitly on every normal path. If the owning future
/// is dropped before that (cancellation, panic), `Drop` schedules the same
/// teardown on the runtime.
struct TeardownGuard<B: SandboxBackend> {
    backend: B,
    image: Option<String>,
    instance: Option<String>,
}

impl<B: SandboxBackend> TeardownGuard<B> {
    fn new(backend: B) -> Self {
        Self {
            backend,
            image: None,
            instance: None,
        }
    }

    async fn release(mut self) {
        let image = self.image.take();
        let instance = self.instance.take();
        teardown(&self.backend, instance, image).await;
    }
}

impl<B: SandboxBackend> Drop for TeardownGuard<B> {
    fn drop(&mut self) {
        if self.image.is_none() && self.instance.is_none() {
            return;
        }
        let backend = self.backend.clone();
        let image = self.image.take();
        let instance = self.instance.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    teardown(&backend, instance, image).await;
                });
            }
            Err(_) => warn!(?instance, ?image, "No runtime available; sandbox resources leaked"),
        }
    }
}

async fn teardown<B: SandboxBackend>(backend: &B, instance: Option<String>, image: Option<String>) {
    if let Some(instance) = instance {
        if let Err(e) = backend.stop(&instance).await {
            warn!(container = %instance, error = %e, "Failed to stop container");
        }
        if let Err(e) = backend.remove(&instance).await {
            warn!(container = %instance, error = %e, "Failed to remove container");
        }
    }
    if let Some(image) = image {
        if let Err(e) = backend.remove_image(&image).await {
            warn!(image = %image, error = %e, "Failed to remove image");
        }
    }
}

fn push_bounded(tail: &mut VecDeque<String>, line: String) {
    if tail.len() == LOG_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

fn join_tail(tail: &VecDeque<String>) -> String {
    tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
}

/// Optional evaluation knobs forwarded to the entrypoint; unset ones keep the
/// program's own defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntrypointOptions {
    pub trials: Option<u32>,
    pub seed: Option<u64>,
    /// Market data path as seen inside the container
    pub data: Option<String>,
}

impl EntrypointOptions {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(trials) = self.trials {
            args.push("--trials".to_string());
            args.push(trials.to_string());
        }
        if let Some(seed) = self.seed {
            args.push("--seed".to_string());
            args.push(seed.to_string());
        }
        if let Some(data) = &self.data {
            args.push("--data".to_string());
            args.push(data.clone());
        }
        args
    }
}

/// Runs one submission per `execute` call on top of a backend
#[derive(Clone)]
pub struct SandboxRunner<B: SandboxBackend> {
    backend: B,
    settings: SandboxSettings,
    extra_args: Vec<String>,
}

impl<B: SandboxBackend> SandboxRunner<B> {
    pub fn new(backend: B, settings: SandboxSettings) -> Self {
        Self {
            backend,
            settings,
            extra_args: Vec::new(),
        }
    }

    /// Append arguments to the fixed entrypoint (used for local policy runs)
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    fn command(&self) -> Vec<String> {
        let mut command = self.settings.render_command();
        command.extend(self.extra_args.iter().cloned());
        command
    }

    /// Build, run and tear down one submission.
    ///
    /// On success the artifact is expected under `output_mount`. Errors are
    /// returned only after teardown has finished.
    #[tracing::instrument(skip(self, source_dir, output_mount), fields(source = %source_dir.display()))]
    pub async fn execute(&self, source_dir: &Path, output_mount: &Path) -> SandboxResult<()> {
        let tag = format!("grader-{}", uuid::Uuid::new_v4());
        let mut guard = TeardownGuard::new(self.backend.clone());

        let result = self.run_stages(&mut guard, &tag, source_dir, output_mount).await;
        guard.release().await;

        match &result {
            Ok(()) => info!(image = %tag, "Sandbox run completed and torn down"),
            Err(e) => warn!(image = %tag, error = %e, "Sandbox run failed; resources torn down"),
        }
        result
    }

    async fn run_stages(
        &self,
        guard: &mut TeardownGuard<B>,
        tag: &str,
        source_dir: &Path,
        output_mount: &Path,
    ) -> SandboxResult<()> {
        let mount = MountBinding {
            host_path: tokio::fs::canonicalize(output_mount).await?,
            container_path: self.settings.container_mount.clone(),
        };

        // A failed build may leave a partial image behind; track the tag first
        guard.image = Some(tag.to_string());
        let build_start = Instant::now();
        self.backend.build(source_dir, tag).await?;
        info!(image = %tag, build_ms = build_start.elapsed().as_millis() as u64, "Image built");

        let instance = self.backend.create(tag, &self.command(), &mount).await?;
        guard.instance = Some(instance.clone());
        self.backend.start(&instance).await?;
        info!(image = %tag, container = %instance, "Container started");

        let run_start = Instant::now();
        let mut tail = VecDeque::new();
        let watched = self.watch(&instance, &mut tail);

        // None means the configured limit elapsed
        let outcome = match self.settings.timeout() {
            Some(limit) => tokio::time::timeout(limit, watched).await.ok(),
            None => Some(watched.await),
        };

        let exit_code = match outcome {
            Some(code) => code?,
            None => {
                let seconds = self.settings.timeout_seconds.unwrap_or_default();
                warn!(container = %instance, limit_s = seconds, "Execution timed out, stopping container");
                return Err(SandboxError::Timeout {
                    seconds,
                    log_tail: join_tail(&tail),
                });
            }
        };

        info!(
            container = %instance,
            exit_code = exit_code,
            execution_ms = run_start.elapsed().as_millis() as u64,
            "Container exited"
        );

        if exit_code != 0 {
            return Err(SandboxError::Runtime {
                exit_code,
                log_tail: join_tail(&tail),
            });
        }
        Ok(())
    }

    /// Drain logs until the container closes its output, then collect the exit code
    async fn watch(&self, instance: &str, tail: &mut VecDeque<String>) -> SandboxResult<i64> {
        let mut logs = self.backend.stream_logs(instance);
        while let Some(line) = logs.next().await {
            match line {
                Ok(line) if line.is_empty() => {}
                Ok(line) => {
                    info!(target: "sandbox", container = %instance, "{}", line);
                    push_bounded(tail, line);
                }
                Err(e) => {
                    warn!(container = %instance, error = %e, "Error reading container logs");
                    break;
                }
            }
        }
        self.backend.wait(instance).await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scriptable in-memory backend that records every live resource.

    use super::*;
    use futures_util::stream;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// What the fake "program" does when its container starts
    #[derive(Debug, Clone)]
    pub enum Behavior {
        /// Write this artifact body and exit 0
        WriteArtifact(String),
        /// Exit 0 without writing anything
        ExitCleanly,
        /// Exit with this code
        Exit(i64),
        /// Never exit on its own
        Hang,
    }

    #[derive(Debug, Default)]
    pub struct State {
        pub images: HashSet<String>,
        pub containers: HashSet<String>,
        pub started: HashSet<String>,
        pub mounts: Vec<PathBuf>,
        pub commands: Vec<Vec<String>>,
        pub operations: Vec<String>,
    }

    #[derive(Clone)]
    pub struct FakeBackend {
        pub state: Arc<Mutex<State>>,
        pub behavior: Behavior,
        pub fail_build: bool,
        pub fail_start: bool,
        pub artifact_file: String,
        exit_codes: Arc<Mutex<std::collections::HashMap<String, i64>>>,
    }

    impl FakeBackend {
        pub fn new(behavior: Behavior) -> Self {
            Self {
                state: Arc::new(Mutex::new(State::default())),
                behavior,
                fail_build: false,
                fail_start: false,
                artifact_file: "output.json".to_string(),
                exit_codes: Arc::default(),
            }
        }

        pub fn live_images(&self) -> usize {
            self.state.lock().unwrap().images.len()
        }

        pub fn live_containers(&self) -> usize {
            self.state.lock().unwrap().containers.len()
        }

        pub fn operations(&self) -> Vec<String> {
            self.state.lock().unwrap().operations.clone()
        }

        fn log(&self, op: &str) {
            self.state.lock().unwrap().operations.push(op.to_string());
        }
    }

    #[async_trait]
    impl SandboxBackend for FakeBackend {
        async fn build(&self, _source_dir: &Path, tag: &str) -> SandboxResult<()> {
            self.log("build");
            if self.fail_build {
                return Err(SandboxError::Build {
                    tag: tag.to_string(),
                    message: "Dockerfile not found".to_string(),
                });
            }
            self.state.lock().unwrap().images.insert(tag.to_string());
            Ok(())
        }

        async fn create(&self, tag: &str, command: &[String], mount: &MountBinding) -> SandboxResult<String> {
            self.log("create");
            let id = format!("container-{}", tag);
            let mut state = self.state.lock().unwrap();
            state.containers.insert(id.clone());
            state.mounts.push(mount.host_path.clone());
            state.commands.push(command.to_vec());
            Ok(id)
        }

        async fn start(&self, instance: &str) -> SandboxResult<()> {
            self.log("start");
            if self.fail_start {
                return Err(SandboxError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "start refused",
                )));
            }
            let mount = {
                let mut state = self.state.lock().unwrap();
                state.started.insert(instance.to_string());
                state.mounts.last().cloned()
            };
            let code = match &self.behavior {
                Behavior::WriteArtifact(body) => {
                    if let Some(mount) = mount {
                        std::fs::write(mount.join(&self.artifact_file), body)?;
                    }
                    0
                }
                Behavior::ExitCleanly | Behavior::Hang => 0,
                Behavior::Exit(code) => *code,
            };
            self.exit_codes.lock().unwrap().insert(instance.to_string(), code);
            Ok(())
        }

        fn stream_logs(&self, _instance: &str) -> BoxStream<'static, SandboxResult<String>> {
            match self.behavior {
                Behavior::Hang => stream::pending::<SandboxResult<String>>().boxed(),
                _ => stream::iter(vec![
                    Ok("Running 2 trials with policy MovingAveragePolicy".to_string()),
                    Ok("Average profit ($): 12.50 ± 1.10".to_string()),
                ])
                .boxed(),
            }
        }

        async fn wait(&self, instance: &str) -> SandboxResult<i64> {
            self.log("wait");
            Ok(self.exit_codes.lock().unwrap().get(instance).copied().unwrap_or(0))
        }

        async fn stop(&self, instance: &str) -> SandboxResult<()> {
            self.log("stop");
            self.state.lock().unwrap().started.remove(instance);
            Ok(())
        }

        async fn remove(&self, instance: &str) -> SandboxResult<()> {
            self.log("remove");
            self.state.lock().unwrap().containers.remove(instance);
            Ok(())
        }

        async fn remove_image(&self, tag: &str) -> SandboxResult<()> {
            self.log("remove_image");
            self.state.lock().unwrap().images.remove(tag);
            Ok(())
        }
    }
}
