//! Provisioning pipeline
//!
//! Runs the stages in order:
//!
//! 1. create the build and map instances (concurrently)
//! 2. wait until each instance reports its ready path
//! 3. issue the console commands against the build instance
//! 4. wait for and extract each artifact
//! 5. stop the instances
//! 6. patch config files and normalize permissions (only once every
//!    instance is stopped, so nothing inside a container is still writing)
//! 7. remove every instance
//!
//! A failing stage is recorded in the [`PipelineReport`] and the run moves on;
//! stages that depend on it are skipped. Removal always runs.
//!
//! A stop request (see [`Pipeline::with_cancel`]) is honoured once creation
//! has finished: the waiting stages are abandoned and the run goes straight
//! to removal, so every container that was started is also removed.

use crate::artifact::extract;
use crate::config::{resolve, PrepConfig};
use crate::console::{BatchOutcome, ConsoleConnector, RemoteCommandExecutor};
use crate::errors::PrepError;
use crate::lifecycle::{InstanceState, LifecycleManager, Role};
use crate::patch::{ConfigPatcher, PatchOutcome};
use crate::permissions::{host_owner, normalize, NormalizeSummary, Owner};
use crate::readiness::{wait_for, wait_for_path, PathExists, PollConfig, Readiness};
use crate::runtime::ContainerRuntime;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, info_span, instrument, warn, Instrument};

/// Pipeline stage, used to attribute failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Create,
    Readiness,
    Commands,
    Extract,
    Stop,
    Patch,
    Permissions,
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Readiness => "readiness",
            Self::Commands => "commands",
            Self::Extract => "extract",
            Self::Stop => "stop",
            Self::Patch => "patch",
            Self::Permissions => "permissions",
            Self::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSkip {
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessRecord {
    pub instance: String,
    pub path: String,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractRecord {
    pub instance: String,
    pub source: String,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchRecord {
    pub file: PathBuf,
    pub outcome: PatchOutcome,
}

/// Everything that happened during one run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub image: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created: Vec<String>,
    pub removed: Vec<String>,
    pub readiness: Vec<ReadinessRecord>,
    pub commands: Option<BatchOutcome>,
    pub extracted: Vec<ExtractRecord>,
    pub patches: Vec<PatchRecord>,
    pub permissions: Option<NormalizeSummary>,
    pub skipped: Vec<StageSkip>,
    pub failures: Vec<StageFailure>,
    /// A stop was requested before the run completed
    pub interrupted: bool,
}

impl PipelineReport {
    fn new(run_id: &str, image: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            image: image.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            created: Vec::new(),
            removed: Vec::new(),
            readiness: Vec::new(),
            commands: None,
            extracted: Vec::new(),
            patches: Vec::new(),
            permissions: None,
            skipped: Vec::new(),
            failures: Vec::new(),
            interrupted: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.interrupted
    }

    /// Stages with at least one failure, in first-failure order
    pub fn failed_stages(&self) -> Vec<Stage> {
        let mut stages = Vec::new();
        for failure in &self.failures {
            if !stages.contains(&failure.stage) {
                stages.push(failure.stage);
            }
        }
        stages
    }

    fn fail(&mut self, stage: Stage, message: impl Into<String>) {
        let message = message.into();
        warn!("Stage {} failed: {}", stage, message);
        self.failures.push(StageFailure { stage, message });
    }

    fn skip(&mut self, stage: Stage, reason: impl Into<String>) {
        let reason = reason.into();
        info!("Skipping {}: {}", stage, reason);
        self.skipped.push(StageSkip { stage, reason });
    }
}

/// Random lowercase alphanumeric run identifier
pub fn generate_run_id() -> String {
    random_token(6)
}

fn random_token(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..len)
        .map(|_| ALPHABET[fastrand::usize(..ALPHABET.len())] as char)
        .collect()
}

/// Fill in a per-run console password when none is configured
pub fn ensure_rcon_password(config: &mut PrepConfig) {
    if config.rcon.password.is_empty() {
        config.rcon.password = random_token(24);
    }
}

/// Resolves once `true` is published; never resolves if the sender is gone
async fn stop_requested(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// One configured run over a container runtime and console connector
pub struct Pipeline<'r, R: ContainerRuntime, C: ConsoleConnector> {
    runtime: &'r R,
    executor: RemoteCommandExecutor<C>,
    config: PrepConfig,
    base_dir: PathBuf,
    run_id: String,
    cancel: watch::Receiver<bool>,
}

impl<'r, R: ContainerRuntime, C: ConsoleConnector> Pipeline<'r, R, C> {
    pub fn new(
        runtime: &'r R,
        connector: C,
        config: PrepConfig,
        base_dir: impl Into<PathBuf>,
    ) -> Self {
        let executor =
            RemoteCommandExecutor::new(connector, config.rcon.rejection_markers.clone());
        let (_, cancel) = watch::channel(false);
        Self {
            runtime,
            executor,
            config,
            base_dir: base_dir.into(),
            run_id: generate_run_id(),
            cancel,
        }
    }

    /// Stop the run early once `true` is sent on the paired sender
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Drive `stage` to completion unless a stop arrives first
    ///
    /// Returns false when the stage was abandoned or never started.
    async fn unless_cancelled(&self, stage: impl Future<Output = ()>) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = stage => true,
            _ = stop_requested(&mut cancel) => false,
        }
    }

    /// Use a fixed run id instead of a random one
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn instance_specs(&self) -> Vec<crate::lifecycle::InstanceSpec> {
        Role::ALL
            .iter()
            .map(|role| {
                let mut spec = self.config.instance_spec(*role, &self.base_dir);
                if *role == Role::Build {
                    spec.env.insert("ENABLE_RCON".to_string(), "true".to_string());
                    spec.env
                        .insert("RCON_PORT".to_string(), self.config.rcon.port.to_string());
                    spec.env
                        .insert("RCON_PASSWORD".to_string(), self.config.rcon.password.clone());
                }
                spec
            })
            .collect()
    }

    /// Execute every stage; always returns a report
    #[instrument(skip(self), fields(run_id = %self.run_id))]
    pub async fn run(&self) -> PipelineReport {
        let poll = self.config.poll_config();
        let mut report = PipelineReport::new(&self.run_id, &self.config.image.reference());
        let mut manager = LifecycleManager::new(self.runtime, self.run_id.clone())
            .with_stop_timeout(self.config.runtime.stop_timeout_secs);

        info!("Starting run {} with image {}", self.run_id, report.image);

        // Creation is never abandoned midway: every start that was issued
        // finishes and is registered, so removal below sees it.
        let created = !self.is_cancelled();
        if created {
            self.create(&mut manager, &mut report).await;
        }

        let completed = created
            && self
                .unless_cancelled(
                    self.await_readiness(&mut manager, &poll, &mut report)
                        .instrument(info_span!("readiness")),
                )
                .await
            && self
                .unless_cancelled(self.run_commands(&mut manager, &mut report))
                .await
            && self
                .unless_cancelled(
                    self.extract_artifacts(&mut manager, &poll, &mut report)
                        .instrument(info_span!("extract")),
                )
                .await;

        if completed {
            self.stop_all(&mut manager, &mut report).await;

            let all_stopped = manager.instances().len() == Role::ALL.len()
                && manager
                    .instances()
                    .iter()
                    .all(|i| i.state() == InstanceState::Stopped);
            if all_stopped {
                self.apply_patches(&mut report);
                self.normalize_permissions(&mut report);
            } else {
                let reason = "not every instance reached Stopped";
                report.skip(Stage::Patch, reason);
                report.skip(Stage::Permissions, reason);
            }
        } else {
            warn!("Run {} interrupted, removing instances", self.run_id);
            report.interrupted = true;
            for stage in [Stage::Stop, Stage::Patch, Stage::Permissions] {
                report.skip(stage, "interrupted");
            }
        }

        for (name, error) in manager.remove_all().await {
            report.fail(Stage::Cleanup, format!("{}: {}", name, error));
        }
        report.removed = manager.removed_names();
        report.finished_at = Some(Utc::now());

        info!(
            "Run {} finished with {} failure(s)",
            self.run_id,
            report.failures.len()
        );
        report
    }

    async fn create(&self, manager: &mut LifecycleManager<'r, R>, report: &mut PipelineReport) {
        let specs = self.instance_specs();
        // Bind mounts require an existing source
        for mount in specs.iter().flat_map(|s| s.mounts.iter()) {
            if let Err(e) = std::fs::create_dir_all(&mount.host) {
                report.fail(
                    Stage::Create,
                    format!("cannot create {}: {}", mount.host.display(), e),
                );
            }
        }

        for (role, result) in manager.create_concurrently(specs).await {
            if let Err(e) = result {
                report.fail(Stage::Create, format!("{} instance: {}", role, e));
            }
        }
        report.created = manager.created_names();
    }

    async fn await_readiness(
        &self,
        manager: &mut LifecycleManager<'r, R>,
        poll: &PollConfig,
        report: &mut PipelineReport,
    ) {
        let targets: Vec<(Role, String, String)> = manager
            .instances()
            .iter()
            .filter(|i| i.is_live())
            .map(|i| {
                let path = self.config.instances.get(i.role()).ready_path.clone();
                (i.role(), i.name().to_string(), path)
            })
            .collect();

        let runtime = self.runtime;
        let results = join_all(targets.iter().map(|(_, name, path)| async move {
            wait_for(&PathExists::new(runtime, name, path), poll).await
        }))
        .await;

        for ((role, name, path), readiness) in targets.into_iter().zip(results) {
            match readiness {
                Readiness::Ready { attempts, elapsed } => {
                    if let Some(instance) = manager.instance_mut(role) {
                        if let Err(e) = instance.confirm_path(&path) {
                            report.fail(Stage::Readiness, e.to_string());
                            continue;
                        }
                    }
                    report.readiness.push(ReadinessRecord {
                        instance: name,
                        path,
                        attempts,
                        elapsed_ms: elapsed.as_millis() as u64,
                    });
                }
                Readiness::TimedOut { elapsed, .. } => {
                    let error = PrepError::Timeout {
                        what: format!("{}:{}", name, path),
                        elapsed_secs: elapsed.as_secs(),
                    };
                    report.fail(Stage::Readiness, error.to_string());
                }
            }
        }
    }

    async fn run_commands(&self, manager: &mut LifecycleManager<'r, R>, report: &mut PipelineReport) {
        if self.config.commands.is_empty() {
            return;
        }

        let name = match manager.instance(Role::Build) {
            Some(instance) if instance.state() == InstanceState::Ready => instance.name().to_string(),
            _ => {
                report.skip(Stage::Commands, "build instance is not ready");
                return;
            }
        };

        let outcome = self
            .executor
            .execute_batch(&name, &self.config.commands)
            .await;
        for failure in &outcome.failures {
            report.fail(Stage::Commands, failure.to_string());
        }
        report.commands = Some(outcome);

        if let Some(instance) = manager.instance_mut(Role::Build) {
            if let Err(e) = instance.advance(InstanceState::CommandsExecuted) {
                report.fail(Stage::Commands, e.to_string());
            }
        }
    }

    async fn extract_artifacts(
        &self,
        manager: &mut LifecycleManager<'r, R>,
        poll: &PollConfig,
        report: &mut PipelineReport,
    ) {
        for artifact in &self.config.artifacts {
            let live = manager.instance(artifact.role).is_some_and(|i| i.is_live());
            if !live {
                report.skip(
                    Stage::Extract,
                    format!("{} instance is not running for {}", artifact.role, artifact.source),
                );
                continue;
            }

            if let Err(e) = wait_for_path(manager, artifact.role, &artifact.source, poll).await {
                report.fail(Stage::Extract, e.to_string());
                continue;
            }

            let Some(instance) = manager.instance(artifact.role) else {
                continue;
            };
            let destination = resolve(&self.base_dir, &artifact.destination);
            match extract(self.runtime, instance, &artifact.source, &destination).await {
                Ok(()) => report.extracted.push(ExtractRecord {
                    instance: instance.name().to_string(),
                    source: artifact.source.clone(),
                    destination,
                }),
                Err(e) => report.fail(Stage::Extract, e.to_string()),
            }
        }
    }

    async fn stop_all(&self, manager: &mut LifecycleManager<'r, R>, report: &mut PipelineReport) {
        let live: Vec<Role> = manager
            .instances()
            .iter()
            .filter(|i| i.is_live())
            .map(|i| i.role())
            .collect();
        for role in live {
            if let Err(e) = manager.stop(role).await {
                report.fail(Stage::Stop, format!("{} instance: {}", role, e));
            }
        }
    }

    fn apply_patches(&self, report: &mut PipelineReport) {
        let patcher = ConfigPatcher::new(&self.base_dir);
        for op in &self.config.patches {
            match patcher.apply(op) {
                Ok(outcome) => report.patches.push(PatchRecord {
                    file: op.file.clone(),
                    outcome,
                }),
                Err(e) => report.fail(Stage::Patch, e.to_string()),
            }
        }
    }

    fn owner(&self) -> crate::errors::Result<Owner> {
        match (self.config.permissions.uid, self.config.permissions.gid) {
            (Some(uid), gid) => Ok(Owner {
                uid,
                gid: gid.unwrap_or(uid),
            }),
            (None, _) => host_owner(),
        }
    }

    fn normalize_permissions(&self, report: &mut PipelineReport) {
        let owner = match self.owner() {
            Ok(owner) => owner,
            Err(e) => {
                report.fail(Stage::Permissions, e.to_string());
                return;
            }
        };

        let paths: Vec<PathBuf> = self
            .config
            .permissions
            .paths
            .iter()
            .map(|p| resolve(&self.base_dir, p))
            .collect();
        match normalize(&paths, Some(owner), self.config.permissions.mode) {
            Ok(summary) => report.permissions = Some(summary),
            Err(e) => report.fail(Stage::Permissions, e.to_string()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::console::RemoteConsole;
    use crate::errors::ConsoleError;
    use crate::runtime::mock::MockRuntime;
    use std::os::unix::fs::MetadataExt;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct RecordingConnector {
        sent: Arc<Mutex<Vec<String>>>,
        fail_on: Option<String>,
        refuse: bool,
    }

    struct RecordingConsole {
        sent: Arc<Mutex<Vec<String>>>,
        fail_on: Option<String>,
    }

    impl RemoteConsole for RecordingConsole {
        async fn send(&mut self, command: &str) -> Result<String, ConsoleError> {
            self.sent.lock().unwrap().push(command.to_string());
            if self.fail_on.as_deref() == Some(command) {
                return Ok("Unknown or incomplete command, see below for error".to_string());
            }
            Ok(String::new())
        }
    }

    impl ConsoleConnector for RecordingConnector {
        type Console = RecordingConsole;

        async fn connect(&self) -> Result<RecordingConsole, ConsoleError> {
            if self.refuse {
                return Err(ConsoleError::AuthRejected);
            }
            Ok(RecordingConsole {
                sent: self.sent.clone(),
                fail_on: self.fail_on.clone(),
            })
        }
    }

    struct Fixture {
        temp: TempDir,
        config: PrepConfig,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let base = temp.path();
        std::fs::create_dir_all(base.join("build/plugins/Essentials")).unwrap();
        std::fs::write(
            base.join("build/plugins/Essentials/config.yml"),
            "disabled-commands:\n- gamemode\n",
        )
        .unwrap();
        std::fs::create_dir_all(base.join("map/plugins/BlueMap")).unwrap();
        std::fs::write(
            base.join("map/plugins/BlueMap/core.conf"),
            "accept-download: false\n",
        )
        .unwrap();

        let meta = std::fs::metadata(base).unwrap();
        let mut config = PrepConfig::default();
        config.permissions.uid = Some(meta.uid());
        config.permissions.gid = Some(meta.gid());
        config.rcon.password = "pw".to_string();
        Fixture { temp, config }
    }

    fn ready_runtime() -> MockRuntime {
        MockRuntime::new()
            .with_path("/mc/world/level.dat")
            .with_path("/mc/plugins/BlueMap/core.conf")
            .with_path("/mc/plotworld")
    }

    fn sorted(mut names: Vec<String>) -> Vec<String> {
        names.sort();
        names
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path() {
        let fx = fixture();
        let runtime = ready_runtime();
        let connector = RecordingConnector::default();
        let pipeline = Pipeline::new(&runtime, connector.clone(), fx.config.clone(), fx.temp.path())
            .with_run_id("ok1");

        let report = pipeline.run().await;

        assert!(report.is_success(), "failures: {:?}", report.failures);
        assert_eq!(sorted(report.created.clone()), vec!["mcprep-build-ok1", "mcprep-map-ok1"]);
        assert_eq!(sorted(report.removed.clone()), sorted(report.created.clone()));
        assert!(runtime.live_containers().is_empty());

        assert_eq!(*connector.sent.lock().unwrap(), fx.config.commands);
        assert_eq!(report.commands.as_ref().unwrap().responses.len(), 13);
        assert_eq!(report.readiness.len(), 2);
        assert_eq!(report.extracted.len(), 1);
        assert!(fx.temp.path().join("world/plotworld").is_file());
        assert!(report
            .patches
            .iter()
            .all(|p| p.outcome == PatchOutcome::Applied));
        assert!(report.permissions.is_some());
        assert!(report.finished_at.is_some());

        let essentials =
            std::fs::read_to_string(fx.temp.path().join("build/plugins/Essentials/config.yml")).unwrap();
        assert!(essentials.contains("customtext"));

        let build = runtime.container("mcprep-build-ok1");
        assert!(build.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_env_carries_rcon_settings() {
        let fx = fixture();
        let runtime = ready_runtime();
        let pipeline = Pipeline::new(&runtime, RecordingConnector::default(), fx.config.clone(), fx.temp.path());
        let specs = pipeline.instance_specs();

        let build = specs.iter().find(|s| s.role == Role::Build).unwrap();
        assert_eq!(build.env.get("RCON_PASSWORD").map(String::as_str), Some("pw"));
        assert_eq!(build.env.get("ENABLE_RCON").map(String::as_str), Some("true"));
        let map = specs.iter().find(|s| s.role == Role::Map).unwrap();
        assert!(!map.env.contains_key("RCON_PASSWORD"));
        assert_eq!(pipeline.run_id().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_create_still_cleans_up() {
        let fx = fixture();
        let runtime = ready_runtime();
        runtime.update_failures(|f| {
            f.run.insert("mcprep-map".to_string());
        });
        let pipeline = Pipeline::new(&runtime, RecordingConnector::default(), fx.config.clone(), fx.temp.path())
            .with_run_id("cf1");

        let report = pipeline.run().await;

        assert!(!report.is_success());
        assert_eq!(report.failed_stages(), vec![Stage::Create]);
        assert_eq!(sorted(report.removed.clone()), sorted(report.created.clone()));
        assert_eq!(report.created.len(), 2);
        assert!(runtime.live_containers().is_empty());
        assert!(report.skipped.iter().any(|s| s.stage == Stage::Patch));
        // build side still ran
        assert!(report.commands.is_some());
        assert_eq!(report.extracted.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_skips_commands() {
        let mut fx = fixture();
        fx.config.readiness.interval_secs = 1;
        fx.config.readiness.timeout_secs = 3;
        let runtime = MockRuntime::new().with_path("/mc/plugins/BlueMap/core.conf");
        let connector = RecordingConnector::default();
        let pipeline = Pipeline::new(&runtime, connector.clone(), fx.config.clone(), fx.temp.path())
            .with_run_id("rt1");

        let report = pipeline.run().await;

        assert_eq!(
            report.failed_stages(),
            vec![Stage::Readiness, Stage::Extract]
        );
        assert!(connector.sent.lock().unwrap().is_empty());
        assert!(report.skipped.iter().any(|s| s.stage == Stage::Commands));
        // both instances stopped, so patching still happened
        assert_eq!(report.patches.len(), 2);
        assert_eq!(sorted(report.removed.clone()), sorted(report.created.clone()));
        assert!(runtime.live_containers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_failure_is_reported_and_run_continues() {
        let fx = fixture();
        let runtime = ready_runtime();
        let connector = RecordingConnector {
            fail_on: Some(fx.config.commands[6].clone()),
            ..Default::default()
        };
        let pipeline = Pipeline::new(&runtime, connector.clone(), fx.config.clone(), fx.temp.path())
            .with_run_id("cm1");

        let report = pipeline.run().await;

        assert_eq!(connector.sent.lock().unwrap().len(), 13);
        let commands = report.commands.as_ref().unwrap();
        assert_eq!(commands.failures.len(), 1);
        assert_eq!(commands.failures[0].position, 7);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, Stage::Commands);
        assert!(report.failures[0].message.contains("#7"));
        assert_eq!(report.extracted.len(), 1);
        assert!(runtime.live_containers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_console_unreachable_fails_every_command() {
        let fx = fixture();
        let runtime = ready_runtime();
        let connector = RecordingConnector {
            refuse: true,
            ..Default::default()
        };
        let pipeline = Pipeline::new(&runtime, connector, fx.config.clone(), fx.temp.path());

        let report = pipeline.run().await;
        let command_failures = report
            .failures
            .iter()
            .filter(|f| f.stage == Stage::Commands)
            .count();
        assert_eq!(command_failures, 13);
        assert!(runtime.live_containers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_failure_is_reported() {
        let fx = fixture();
        let runtime = ready_runtime();
        runtime.update_failures(|f| {
            f.remove.insert("mcprep-build".to_string());
        });
        let pipeline = Pipeline::new(&runtime, RecordingConnector::default(), fx.config.clone(), fx.temp.path())
            .with_run_id("rm1");

        let report = pipeline.run().await;

        assert_eq!(report.failed_stages(), vec![Stage::Cleanup]);
        assert_eq!(report.removed, vec!["mcprep-map-rm1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_failure_skips_patching() {
        let fx = fixture();
        let runtime = ready_runtime();
        runtime.update_failures(|f| {
            f.stop.insert("mcprep-map".to_string());
        });
        let pipeline = Pipeline::new(&runtime, RecordingConnector::default(), fx.config.clone(), fx.temp.path())
            .with_run_id("st1");

        let report = pipeline.run().await;

        assert_eq!(report.failed_stages(), vec![Stage::Stop]);
        assert!(report.patches.is_empty());
        assert!(report.permissions.is_none());
        let original =
            std::fs::read_to_string(fx.temp.path().join("map/plugins/BlueMap/core.conf")).unwrap();
        assert_eq!(original, "accept-download: false\n");
        assert!(runtime.live_containers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_request_during_readiness_removes_instances() {
        let fx = fixture();
        // no ready paths: readiness would otherwise wait for the full timeout
        let runtime = MockRuntime::new();
        let connector = RecordingConnector::default();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let pipeline = Pipeline::new(&runtime, connector.clone(), fx.config.clone(), fx.temp.path())
            .with_run_id("int1")
            .with_cancel(cancel_rx);

        let (report, _) = tokio::join!(pipeline.run(), async {
            tokio::time::sleep(std::time::Duration::from_secs(12)).await;
            cancel_tx.send(true).unwrap();
        });

        assert!(report.interrupted);
        assert!(!report.is_success());
        assert_eq!(report.created.len(), 2);
        assert_eq!(sorted(report.removed.clone()), sorted(report.created.clone()));
        assert!(runtime.live_containers().is_empty());
        assert!(connector.sent.lock().unwrap().is_empty());
        assert!(report.commands.is_none());
        assert!(report.patches.is_empty());
        assert!(report
            .skipped
            .iter()
            .any(|s| s.stage == Stage::Stop && s.reason == "interrupted"));
        let conf =
            std::fs::read_to_string(fx.temp.path().join("map/plugins/BlueMap/core.conf")).unwrap();
        assert_eq!(conf, "accept-download: false\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_request_before_start_creates_nothing() {
        let fx = fixture();
        let runtime = ready_runtime();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();
        let pipeline = Pipeline::new(&runtime, RecordingConnector::default(), fx.config.clone(), fx.temp.path())
            .with_cancel(cancel_rx);

        let report = pipeline.run().await;

        assert!(report.interrupted);
        assert!(report.created.is_empty());
        assert!(report.removed.is_empty());
        assert!(runtime.live_containers().is_empty());
    }

    #[test]
    fn test_run_id_shape() {
        let id = generate_run_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

        let mut config = PrepConfig::default();
        ensure_rcon_password(&mut config);
        assert_eq!(config.rcon.password.len(), 24);
        let kept = config.rcon.password.clone();
        ensure_rcon_password(&mut config);
        assert_eq!(config.rcon.password, kept);
    }
}
