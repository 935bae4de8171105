//! Container runtime abstraction for Docker/Podman
//!
//! The pipeline consumes exactly five primitives from the container runtime:
//! run a detached container with bind mounts, exec a command inside it, copy a
//! path out of it, stop it, and force-remove it. [`ContainerRuntime`] captures
//! those; [`CliRuntime`] drives the `docker`/`podman` CLI and
//! [`mock::MockRuntime`] simulates a runtime in memory for tests.

use crate::errors::{PrepError, Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::{debug, instrument, warn};

/// Runtime selection options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Docker runtime
    #[default]
    Docker,
    /// Podman runtime
    Podman,
}

impl RuntimeKind {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = PrepError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            _ => Err(RuntimeError::CLIError(format!(
                "Unknown runtime: {}. Supported runtimes: docker, podman",
                s
            ))
            .into()),
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A host directory bind-mounted into a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Absolute path on the host
    pub host: PathBuf,
    /// Absolute path inside the container
    pub container: String,
}

impl BindMount {
    /// Render as `--mount` argument value
    pub fn to_mount_arg(&self) -> String {
        format!(
            "type=bind,source={},target={}",
            self.host.display(),
            self.container
        )
    }
}

/// A published port (`host:container`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
}

/// Everything needed to start one detached container
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<BindMount>,
    pub ports: Vec<PortBinding>,
    pub env: BTreeMap<String, String>,
}

impl RunSpec {
    /// CLI arguments for `run -d`
    pub fn to_run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];

        for mount in &self.mounts {
            args.push("--mount".to_string());
            args.push(mount.to_mount_arg());
        }

        for port in &self.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", port.host, port.container));
        }

        for (key, value) in &self.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.image.clone());
        args
    }
}

/// Result of executing a command in a container
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code of the command
    pub exit_code: i32,
    /// Whether the command completed successfully (exit code 0)
    pub success: bool,
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
}

/// Outcome of a force-remove request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The container existed and was removed
    Removed,
    /// There was nothing to remove
    NotFound,
}

/// Container runtime abstraction
#[allow(async_fn_in_trait)]
pub trait ContainerRuntime {
    /// Get the name of this runtime (e.g., "docker", "podman")
    fn runtime_name(&self) -> &'static str;

    /// Create and start a detached container; returns its ID
    async fn run_detached(&self, spec: &RunSpec) -> Result<String>;

    /// Execute a command inside a running container, capturing output
    async fn exec(&self, container: &str, command: &[String]) -> Result<ExecResult>;

    /// Copy `source` from inside the container to `dest` on the host
    async fn copy_from(&self, container: &str, source: &str, dest: &Path) -> Result<()>;

    /// Stop a container with optional timeout in seconds
    async fn stop(&self, container: &str, timeout: Option<u32>) -> Result<()>;

    /// Force-remove a container; a missing container is not an error
    async fn force_remove(&self, container: &str) -> Result<RemoveOutcome>;

    /// Synchronous force-remove for use from `Drop`
    fn force_remove_blocking(&self, container: &str) -> Result<RemoveOutcome>;
}

impl<T: ContainerRuntime> ContainerRuntime for &T {
    fn runtime_name(&self) -> &'static str {
        (*self).runtime_name()
    }

    async fn run_detached(&self, spec: &RunSpec) -> Result<String> {
        (*self).run_detached(spec).await
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<ExecResult> {
        (*self).exec(container, command).await
    }

    async fn copy_from(&self, container: &str, source: &str, dest: &Path) -> Result<()> {
        (*self).copy_from(container, source, dest).await
    }

    async fn stop(&self, container: &str, timeout: Option<u32>) -> Result<()> {
        (*self).stop(container, timeout).await
    }

    async fn force_remove(&self, container: &str) -> Result<RemoveOutcome> {
        (*self).force_remove(container).await
    }

    fn force_remove_blocking(&self, container: &str) -> Result<RemoveOutcome> {
        (*self).force_remove_blocking(container)
    }
}

/// Detects the runtime's "container does not exist" message
///
/// Docker: "Error: No such container: x" / "Error response from daemon: No such container"
/// Podman: "no container with name or ID \"x\" found"
fn is_not_found_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no container with name or id")
}

/// Generic CLI-based container runtime implementation
///
/// Works for both Docker and Podman since they share a compatible CLI.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    kind: RuntimeKind,
    /// Container runtime CLI binary path (e.g., "docker" or "podman")
    runtime_path: String,
}

impl CliRuntime {
    /// Create a new CliRuntime for Docker
    pub fn docker() -> Self {
        Self {
            kind: RuntimeKind::Docker,
            runtime_path: "docker".to_string(),
        }
    }

    /// Create a new CliRuntime for Podman
    pub fn podman() -> Self {
        Self {
            kind: RuntimeKind::Podman,
            runtime_path: "podman".to_string(),
        }
    }

    /// Create a runtime of the given kind, optionally with a custom binary path
    pub fn new(kind: RuntimeKind, runtime_path: Option<String>) -> Self {
        Self {
            kind,
            runtime_path: runtime_path.unwrap_or_else(|| kind.as_str().to_string()),
        }
    }

    /// Binary this runtime shells out to
    pub fn runtime_path(&self) -> &str {
        &self.runtime_path
    }

    fn output_blocking(runtime_path: &str, args: &[String]) -> Result<Output> {
        Command::new(runtime_path).args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RuntimeError::NotInstalled.into()
            } else {
                RuntimeError::CLIError(format!("Failed to run {}: {}", runtime_path, e)).into()
            }
        })
    }

    /// Run the runtime CLI on a blocking thread
    async fn output(&self, args: Vec<String>) -> Result<Output> {
        let runtime_path = self.runtime_path.clone();
        tokio::task::spawn_blocking(move || Self::output_blocking(&runtime_path, &args))
            .await
            .map_err(|e| RuntimeError::CLIError(format!("Task join error: {}", e)))?
    }

    fn remove_outcome(container: &str, output: &Output) -> Result<RemoveOutcome> {
        if output.status.success() {
            return Ok(RemoveOutcome::Removed);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found_error(&stderr) {
            debug!("Container {} already gone", container);
            return Ok(RemoveOutcome::NotFound);
        }
        Err(RuntimeError::CLIError(format!("Remove command failed: {}", stderr.trim())).into())
    }
}

impl Default for CliRuntime {
    fn default() -> Self {
        Self::docker()
    }
}

impl ContainerRuntime for CliRuntime {
    fn runtime_name(&self) -> &'static str {
        self.kind.as_str()
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn run_detached(&self, spec: &RunSpec) -> Result<String> {
        debug!("Starting container");

        let output = self.output(spec.to_run_args()).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(
                RuntimeError::CLIError(format!("Container run failed: {}", stderr.trim())).into(),
            );
        }

        let stdout = String::from_utf8(output.stdout).map_err(|e| {
            RuntimeError::CLIError(format!("Invalid UTF-8 in runtime output: {}", e))
        })?;
        let container_id = stdout.trim().to_string();

        debug!("Started container with ID: {}", container_id);
        Ok(container_id)
    }

    #[instrument(skip(self))]
    async fn exec(&self, container: &str, command: &[String]) -> Result<ExecResult> {
        let mut args = vec!["exec".to_string(), container.to_string()];
        args.extend(command.iter().cloned());

        let output = self.output(args).await?;
        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() && is_not_found_error(&stderr) {
            return Err(RuntimeError::ContainerNotFound {
                name: container.to_string(),
            }
            .into());
        }

        Ok(ExecResult {
            exit_code,
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }

    #[instrument(skip(self))]
    async fn copy_from(&self, container: &str, source: &str, dest: &Path) -> Result<()> {
        let args = vec![
            "cp".to_string(),
            format!("{}:{}", container, source),
            dest.display().to_string(),
        ];

        let output = self.output(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::CLIError(format!(
                "Copy of {}:{} failed: {}",
                container,
                source,
                stderr.trim()
            ))
            .into());
        }

        debug!("Copied {}:{} to {}", container, source, dest.display());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self, container: &str, timeout: Option<u32>) -> Result<()> {
        let mut args = vec!["stop".to_string()];
        if let Some(timeout) = timeout {
            args.push("-t".to_string());
            args.push(timeout.to_string());
        }
        args.push(container.to_string());

        let output = self.output(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_found_error(&stderr) {
                return Err(RuntimeError::ContainerNotFound {
                    name: container.to_string(),
                }
                .into());
            }
            return Err(RuntimeError::CLIError(format!(
                "Runtime stop command failed: {}",
                stderr.trim()
            ))
            .into());
        }

        debug!("Container {} stopped successfully", container);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn force_remove(&self, container: &str) -> Result<RemoveOutcome> {
        let output = self
            .output(vec![
                "rm".to_string(),
                "-f".to_string(),
                container.to_string(),
            ])
            .await?;
        Self::remove_outcome(container, &output)
    }

    fn force_remove_blocking(&self, container: &str) -> Result<RemoveOutcome> {
        let output = Self::output_blocking(
            &self.runtime_path,
            &["rm".to_string(), "-f".to_string(), container.to_string()],
        );
        match output {
            Ok(output) => Self::remove_outcome(container, &output),
            Err(e) => {
                warn!("Blocking removal of {} failed: {}", container, e);
                Err(e)
            }
        }
    }
}

pub mod mock {
    //! In-memory container runtime for tests
    //!
    //! Containers are tracked by name. Paths inside containers can be scheduled
    //! to "appear" a fixed delay after the container starts (measured on the
    //! tokio clock, so paused-time tests work), and individual operations can be
    //! made to fail for containers whose name contains a given fragment.

    use super::{ContainerRuntime, ExecResult, RemoveOutcome, RunSpec};
    use crate::errors::{Result, RuntimeError};
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;
    use tracing::debug;

    /// Simulated container
    #[derive(Debug, Clone)]
    pub struct MockContainer {
        pub name: String,
        pub image: String,
        pub running: bool,
        pub started_at: Instant,
        pub spec: RunSpec,
    }

    /// Which operations fail, keyed by container-name fragment
    #[derive(Debug, Clone, Default)]
    pub struct MockFailures {
        pub run: HashSet<String>,
        pub exec: HashSet<String>,
        pub copy: HashSet<String>,
        pub stop: HashSet<String>,
        pub remove: HashSet<String>,
    }

    fn matches_any(fragments: &HashSet<String>, name: &str) -> bool {
        fragments.iter().any(|f| name.contains(f.as_str()))
    }

    #[derive(Debug, Default)]
    struct MockState {
        containers: HashMap<String, MockContainer>,
        /// path -> delay after container start
        paths: HashMap<String, Duration>,
        failures: MockFailures,
        run_calls: Vec<String>,
        removed: Vec<String>,
        exec_history: Vec<(String, Vec<String>)>,
        copies: Vec<(String, String)>,
    }

    /// Mock runtime implementation
    #[derive(Debug, Clone, Default)]
    pub struct MockRuntime {
        state: Arc<Mutex<MockState>>,
    }

    impl MockRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make `path` exist in every container `delay` after it starts
        pub fn path_appears_after(&self, path: &str, delay: Duration) {
            let mut state = self.state.lock().unwrap();
            state.paths.insert(path.to_string(), delay);
        }

        /// Make `path` exist immediately in every container
        pub fn with_path(self, path: &str) -> Self {
            self.path_appears_after(path, Duration::ZERO);
            self
        }

        /// Configure failure injection
        pub fn update_failures<F>(&self, f: F)
        where
            F: FnOnce(&mut MockFailures),
        {
            let mut state = self.state.lock().unwrap();
            f(&mut state.failures);
        }

        /// Names passed to `run_detached`, in call order
        pub fn run_calls(&self) -> Vec<String> {
            self.state.lock().unwrap().run_calls.clone()
        }

        /// Names that were force-removed (including not-found removals)
        pub fn removed(&self) -> Vec<String> {
            self.state.lock().unwrap().removed.clone()
        }

        /// Containers still known to the runtime
        pub fn live_containers(&self) -> Vec<String> {
            let state = self.state.lock().unwrap();
            let mut names: Vec<String> = state.containers.keys().cloned().collect();
            names.sort();
            names
        }

        /// Specs of the containers currently known to the runtime
        pub fn container(&self, name: &str) -> Option<MockContainer> {
            self.state.lock().unwrap().containers.get(name).cloned()
        }

        /// Recorded exec invocations as (container, argv)
        pub fn exec_history(&self) -> Vec<(String, Vec<String>)> {
            self.state.lock().unwrap().exec_history.clone()
        }

        /// Recorded copies as (container, source)
        pub fn copies(&self) -> Vec<(String, String)> {
            self.state.lock().unwrap().copies.clone()
        }

        fn path_exists(state: &MockState, container: &MockContainer, path: &str) -> bool {
            state.paths.iter().any(|(known, delay)| {
                let visible = container.started_at + *delay <= Instant::now();
                visible && (known == path || known.starts_with(&format!("{}/", path)))
            })
        }

        fn remove_now(&self, name: &str) -> Result<RemoveOutcome> {
            let mut state = self.state.lock().unwrap();
            if matches_any(&state.failures.remove, name) {
                return Err(RuntimeError::CLIError(format!("mock remove failure for {}", name)).into());
            }
            state.removed.push(name.to_string());
            match state.containers.remove(name) {
                Some(_) => Ok(RemoveOutcome::Removed),
                None => Ok(RemoveOutcome::NotFound),
            }
        }
    }

    impl ContainerRuntime for MockRuntime {
        fn runtime_name(&self) -> &'static str {
            "mock"
        }

        async fn run_detached(&self, spec: &RunSpec) -> Result<String> {
            let mut state = self.state.lock().unwrap();
            state.run_calls.push(spec.name.clone());
            if matches_any(&state.failures.run, &spec.name) {
                return Err(RuntimeError::CLIError(format!(
                    "mock run failure for {}",
                    spec.name
                ))
                .into());
            }
            if state.containers.contains_key(&spec.name) {
                return Err(RuntimeError::CLIError(format!(
                    "Conflict. The container name \"{}\" is already in use",
                    spec.name
                ))
                .into());
            }

            let container = MockContainer {
                name: spec.name.clone(),
                image: spec.image.clone(),
                running: true,
                started_at: Instant::now(),
                spec: spec.clone(),
            };
            state.containers.insert(spec.name.clone(), container);
            debug!("MockRuntime started {}", spec.name);
            Ok(format!("mock-{}", spec.name))
        }

        async fn exec(&self, container: &str, command: &[String]) -> Result<ExecResult> {
            let mut state = self.state.lock().unwrap();
            state
                .exec_history
                .push((container.to_string(), command.to_vec()));
            if matches_any(&state.failures.exec, container) {
                return Err(RuntimeError::CLIError(format!("mock exec failure for {}", container)).into());
            }
            let Some(target) = state.containers.get(container).cloned() else {
                return Err(RuntimeError::ContainerNotFound {
                    name: container.to_string(),
                }
                .into());
            };
            if !target.running {
                return Err(RuntimeError::CLIError(format!("container {} is not running", container)).into());
            }

            // Only `test -e <path>` is understood; everything else succeeds.
            let success = match command {
                [test, flag, path] if test == "test" && flag == "-e" => {
                    Self::path_exists(&state, &target, path)
                }
                _ => true,
            };

            Ok(ExecResult {
                exit_code: if success { 0 } else { 1 },
                success,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        async fn copy_from(&self, container: &str, source: &str, dest: &Path) -> Result<()> {
            {
                let mut state = self.state.lock().unwrap();
                if matches_any(&state.failures.copy, container) {
                    return Err(RuntimeError::CLIError(format!("mock copy failure for {}", container)).into());
                }
                let Some(target) = state.containers.get(container).cloned() else {
                    return Err(RuntimeError::ContainerNotFound {
                        name: container.to_string(),
                    }
                    .into());
                };
                if !Self::path_exists(&state, &target, source) {
                    return Err(RuntimeError::CLIError(format!(
                        "Could not find the file {} in container {}",
                        source, container
                    ))
                    .into());
                }
                state.copies.push((container.to_string(), source.to_string()));
            }

            std::fs::write(dest, format!("{}:{}\n", container, source))
                .map_err(|e| crate::errors::PrepError::io(dest, e))
        }

        async fn stop(&self, container: &str, _timeout: Option<u32>) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if matches_any(&state.failures.stop, container) {
                return Err(RuntimeError::CLIError(format!("mock stop failure for {}", container)).into());
            }
            match state.containers.get_mut(container) {
                Some(target) => {
                    target.running = false;
                    Ok(())
                }
                None => Err(RuntimeError::ContainerNotFound {
                    name: container.to_string(),
                }
                .into()),
            }
        }

        async fn force_remove(&self, container: &str) -> Result<RemoveOutcome> {
            self.remove_now(container)
        }

        fn force_remove_blocking(&self, container: &str) -> Result<RemoveOutcome> {
            self.remove_now(container)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockRuntime;
    use super::*;

    fn sample_spec() -> RunSpec {
        let mut env = BTreeMap::new();
        env.insert("EULA".to_string(), "TRUE".to_string());
        RunSpec {
            name: "mcprep-build-abc123".to_string(),
            image: "minecraft-docker:main".to_string(),
            mounts: vec![BindMount {
                host: PathBuf::from("/srv/mc/build/plugins"),
                container: "/mc/plugins".to_string(),
            }],
            ports: vec![PortBinding {
                host: 25575,
                container: 25575,
            }],
            env,
        }
    }

    #[test]
    fn test_run_args_layout() {
        let args = sample_spec().to_run_args();
        assert_eq!(
            args,
            vec![
                "run",
                "-d",
                "--name",
                "mcprep-build-abc123",
                "--mount",
                "type=bind,source=/srv/mc/build/plugins,target=/mc/plugins",
                "-p",
                "25575:25575",
                "--env",
                "EULA=TRUE",
                "minecraft-docker:main",
            ]
        );
    }

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found_error(
            "Error response from daemon: No such container: mcprep-map-x"
        ));
        assert!(is_not_found_error(
            "Error: no container with name or ID \"mcprep-map-x\" found: no such container"
        ));
        assert!(!is_not_found_error("permission denied"));
    }

    #[test]
    fn test_runtime_kind_parse() {
        assert_eq!("Docker".parse::<RuntimeKind>().unwrap(), RuntimeKind::Docker);
        assert_eq!("podman".parse::<RuntimeKind>().unwrap(), RuntimeKind::Podman);
        assert!("containerd".parse::<RuntimeKind>().is_err());
        assert_eq!(CliRuntime::new(RuntimeKind::Podman, None).runtime_path(), "podman");
    }

    #[tokio::test]
    async fn test_mock_remove_is_idempotent() {
        let runtime = MockRuntime::new();
        let spec = sample_spec();
        runtime.run_detached(&spec).await.unwrap();

        assert_eq!(
            runtime.force_remove(&spec.name).await.unwrap(),
            RemoveOutcome::Removed
        );
        assert_eq!(
            runtime.force_remove(&spec.name).await.unwrap(),
            RemoveOutcome::NotFound
        );
        assert!(runtime.live_containers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_path_appears_on_schedule() {
        let runtime = MockRuntime::new();
        runtime.path_appears_after("/mc/plotworld", std::time::Duration::from_secs(12));
        let spec = sample_spec();
        runtime.run_detached(&spec).await.unwrap();

        let test_cmd = vec!["test".to_string(), "-e".to_string(), "/mc/plotworld".to_string()];
        assert!(!runtime.exec(&spec.name, &test_cmd).await.unwrap().success);

        tokio::time::advance(std::time::Duration::from_secs(12)).await;
        assert!(runtime.exec(&spec.name, &test_cmd).await.unwrap().success);
    }
}
