//! Ephemeral instance lifecycle
//!
//! [`LifecycleManager`] owns every [`Instance`] of a run. An instance is
//! registered *before* its container is started, so a failed or partial start
//! still gets a removal attempt. [`LifecycleManager::remove_all`] is the normal
//! release path; the `Drop` impl is the fallback for early returns and panics
//! and force-removes whatever is still registered.

use crate::errors::{PrepError, Result};
use crate::runtime::{BindMount, ContainerRuntime, PortBinding, RemoveOutcome, RunSpec};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// Purpose of an instance within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Generates the world and receives console commands
    Build,
    /// Generates map-plugin configuration
    Map,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Build, Role::Map];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Map => "map",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance state; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceState {
    Created,
    Running,
    Ready,
    CommandsExecuted,
    Stopped,
    Removed,
}

/// What the pipeline asks the manager to create
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub role: Role,
    pub image: String,
    pub mounts: Vec<BindMount>,
    pub ports: Vec<PortBinding>,
    pub env: BTreeMap<String, String>,
}

/// One ephemeral container of the current run
#[derive(Debug, Clone)]
pub struct Instance {
    name: String,
    role: Role,
    state: InstanceState,
    container_id: Option<String>,
    confirmed_paths: Vec<String>,
}

impl Instance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    /// Whether the container process is up (Running through CommandsExecuted)
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            InstanceState::Running | InstanceState::Ready | InstanceState::CommandsExecuted
        )
    }

    /// Move to `next`; moving backwards is a precondition error
    pub fn advance(&mut self, next: InstanceState) -> Result<()> {
        if next < self.state {
            return Err(PrepError::precondition(format!(
                "Instance {} cannot move from {:?} back to {:?}",
                self.name, self.state, next
            )));
        }
        debug!("Instance {}: {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Record that readiness polling observed `path` inside the instance
    pub fn confirm_path(&mut self, path: &str) -> Result<()> {
        if !self.confirmed_paths.iter().any(|p| p == path) {
            self.confirmed_paths.push(path.to_string());
        }
        if self.state < InstanceState::Ready {
            self.advance(InstanceState::Ready)?;
        }
        Ok(())
    }

    /// True if `path` or one of its ancestors was confirmed by readiness polling
    pub fn is_path_confirmed(&self, path: &str) -> bool {
        let path = path.trim_end_matches('/');
        self.confirmed_paths.iter().any(|confirmed| {
            let confirmed = confirmed.trim_end_matches('/');
            path == confirmed || path.starts_with(&format!("{}/", confirmed))
        })
    }
}

/// Creates, stops and removes the instances of one run
pub struct LifecycleManager<'r, R: ContainerRuntime> {
    runtime: &'r R,
    run_id: String,
    stop_timeout: Option<u32>,
    instances: Vec<Instance>,
}

impl<'r, R: ContainerRuntime> LifecycleManager<'r, R> {
    pub fn new(runtime: &'r R, run_id: impl Into<String>) -> Self {
        Self {
            runtime,
            run_id: run_id.into(),
            stop_timeout: None,
            instances: Vec::new(),
        }
    }

    /// Grace period handed to the runtime's stop command
    pub fn with_stop_timeout(mut self, seconds: u32) -> Self {
        self.stop_timeout = Some(seconds);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn runtime(&self) -> &'r R {
        self.runtime
    }

    /// Container name for a role in this run
    pub fn instance_name(&self, role: Role) -> String {
        format!("mcprep-{}-{}", role, self.run_id)
    }

    pub fn instance(&self, role: Role) -> Option<&Instance> {
        self.instances.iter().find(|i| i.role == role)
    }

    pub fn instance_mut(&mut self, role: Role) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.role == role)
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Names of every instance registered in this run
    pub fn created_names(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.name.clone()).collect()
    }

    /// Register an instance for the role; its release is owed from here on
    fn register(&mut self, spec: &InstanceSpec) -> Result<RunSpec> {
        if self.instance(spec.role).is_some() {
            return Err(PrepError::precondition(format!(
                "An instance for role '{}' already exists in run {}",
                spec.role, self.run_id
            )));
        }

        let name = self.instance_name(spec.role);
        self.instances.push(Instance {
            name: name.clone(),
            role: spec.role,
            state: InstanceState::Created,
            container_id: None,
            confirmed_paths: Vec::new(),
        });

        Ok(RunSpec {
            name,
            image: spec.image.clone(),
            mounts: spec.mounts.clone(),
            ports: spec.ports.clone(),
            env: spec.env.clone(),
        })
    }

    fn mark_started(&mut self, role: Role, container_id: String) -> Result<()> {
        if let Some(instance) = self.instance_mut(role) {
            instance.container_id = Some(container_id);
            instance.advance(InstanceState::Running)?;
        }
        Ok(())
    }

    /// Create and start one instance without waiting for the application
    #[instrument(skip(self, spec), fields(role = %spec.role))]
    pub async fn create(&mut self, spec: InstanceSpec) -> Result<&Instance> {
        let run_spec = self.register(&spec)?;
        let container_id = self.runtime.run_detached(&run_spec).await?;
        self.mark_started(spec.role, container_id)?;
        info!("Started instance {}", run_spec.name);
        self.instance(spec.role)
            .ok_or_else(|| PrepError::precondition("instance vanished after creation"))
    }

    /// Create several instances concurrently; returns one result per spec
    #[instrument(skip(self, specs))]
    pub async fn create_concurrently(
        &mut self,
        specs: Vec<InstanceSpec>,
    ) -> Vec<(Role, Result<()>)> {
        let mut results = Vec::new();
        let mut pending = Vec::new();
        for spec in &specs {
            match self.register(spec) {
                Ok(run_spec) => pending.push((spec.role, run_spec)),
                Err(e) => results.push((spec.role, Err(e))),
            }
        }

        let runtime = self.runtime;
        let started = join_all(
            pending
                .iter()
                .map(|(_, run_spec)| async move { runtime.run_detached(run_spec).await }),
        )
        .await;

        for ((role, run_spec), outcome) in pending.into_iter().zip(started) {
            let result = match outcome {
                Ok(container_id) => {
                    info!("Started instance {}", run_spec.name);
                    self.mark_started(role, container_id)
                }
                Err(e) => {
                    warn!("Failed to start instance {}: {}", run_spec.name, e);
                    Err(e)
                }
            };
            results.push((role, result));
        }

        results
    }

    /// Stop a live instance gracefully
    #[instrument(skip(self))]
    pub async fn stop(&mut self, role: Role) -> Result<()> {
        let stop_timeout = self.stop_timeout;
        let runtime = self.runtime;
        let instance = self
            .instance_mut(role)
            .ok_or_else(|| PrepError::precondition(format!("No instance for role '{}'", role)))?;

        if instance.state >= InstanceState::Stopped {
            return Ok(());
        }
        if instance.state == InstanceState::Created {
            return Err(PrepError::precondition(format!(
                "Instance {} was never started",
                instance.name
            )));
        }

        runtime.stop(&instance.name, stop_timeout).await?;
        instance.advance(InstanceState::Stopped)?;
        info!("Stopped instance {}", instance.name);
        Ok(())
    }

    /// Force-remove one instance; removing a missing container is a no-op
    #[instrument(skip(self))]
    pub async fn remove(&mut self, role: Role) -> Result<()> {
        let runtime = self.runtime;
        let instance = self
            .instance_mut(role)
            .ok_or_else(|| PrepError::precondition(format!("No instance for role '{}'", role)))?;

        if instance.state == InstanceState::Removed {
            return Ok(());
        }

        match runtime.force_remove(&instance.name).await? {
            RemoveOutcome::Removed => info!("Removed instance {}", instance.name),
            RemoveOutcome::NotFound => debug!("Instance {} was already gone", instance.name),
        }
        instance.advance(InstanceState::Removed)
    }

    /// Attempt removal of every instance, collecting failures
    pub async fn remove_all(&mut self) -> Vec<(String, PrepError)> {
        let mut failures = Vec::new();
        let roles: Vec<Role> = self.instances.iter().map(|i| i.role).collect();
        for role in roles {
            if let Err(e) = self.remove(role).await {
                let name = self.instance_name(role);
                warn!("Failed to remove instance {}: {}", name, e);
                failures.push((name, e));
            }
        }
        failures
    }

    /// Names of instances that reached Removed
    pub fn removed_names(&self) -> Vec<String> {
        self.instances
            .iter()
            .filter(|i| i.state == InstanceState::Removed)
            .map(|i| i.name.clone())
            .collect()
    }
}

impl<R: ContainerRuntime> Drop for LifecycleManager<'_, R> {
    fn drop(&mut self) {
        for instance in self
            .instances
            .iter_mut()
            .filter(|i| i.state != InstanceState::Removed)
        {
            warn!(
                "Instance {} still registered at teardown; forcing removal",
                instance.name
            );
            match self.runtime.force_remove_blocking(&instance.name) {
                Ok(_) => instance.state = InstanceState::Removed,
                Err(e) => warn!("Could not remove {}: {}", instance.name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use std::path::PathBuf;

    fn spec(role: Role) -> InstanceSpec {
        InstanceSpec {
            role,
            image: "minecraft-docker:latest".to_string(),
            mounts: vec![BindMount {
                host: PathBuf::from(format!("/tmp/{}/plugins", role)),
                container: "/mc/plugins".to_string(),
            }],
            ports: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_then_remove() {
        let runtime = MockRuntime::new();
        let mut manager = LifecycleManager::new(&runtime, "t1");

        let instance = manager.create(spec(Role::Build)).await.unwrap();
        assert_eq!(instance.name(), "mcprep-build-t1");
        assert_eq!(instance.state(), InstanceState::Running);
        assert_eq!(instance.container_id(), Some("mock-mcprep-build-t1"));

        manager.remove(Role::Build).await.unwrap();
        assert_eq!(
            manager.instance(Role::Build).unwrap().state(),
            InstanceState::Removed
        );
        // second removal is a no-op
        manager.remove(Role::Build).await.unwrap();
        assert_eq!(runtime.removed(), vec!["mcprep-build-t1".to_string()]);
    }

    #[tokio::test]
    async fn test_one_instance_per_role() {
        let runtime = MockRuntime::new();
        let mut manager = LifecycleManager::new(&runtime, "t2");
        manager.create(spec(Role::Map)).await.unwrap();

        let err = manager.create(spec(Role::Map)).await.unwrap_err();
        assert!(matches!(err, PrepError::Precondition { .. }));
        assert_eq!(runtime.run_calls().len(), 1);
        manager.remove_all().await;
    }

    #[tokio::test]
    async fn test_failed_start_is_still_released() {
        let runtime = MockRuntime::new();
        runtime.update_failures(|f| {
            f.run.insert("map".to_string());
        });
        let mut manager = LifecycleManager::new(&runtime, "t3");

        let results = manager
            .create_concurrently(vec![spec(Role::Build), spec(Role::Map)])
            .await;
        assert!(results.iter().any(|(r, res)| *r == Role::Build && res.is_ok()));
        assert!(results.iter().any(|(r, res)| *r == Role::Map && res.is_err()));

        assert!(manager.remove_all().await.is_empty());
        let mut created = manager.created_names();
        let mut removed = manager.removed_names();
        created.sort();
        removed.sort();
        assert_eq!(created, removed);
    }

    #[tokio::test]
    async fn test_drop_releases_leftover_instances() {
        let runtime = MockRuntime::new();
        {
            let mut manager = LifecycleManager::new(&runtime, "t4");
            manager.create(spec(Role::Build)).await.unwrap();
            manager.create(spec(Role::Map)).await.unwrap();
        }
        assert!(runtime.live_containers().is_empty());
        assert_eq!(runtime.removed().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_requires_started_instance() {
        let runtime = MockRuntime::new();
        runtime.update_failures(|f| {
            f.run.insert("build".to_string());
        });
        let mut manager = LifecycleManager::new(&runtime, "t5");
        assert!(manager.create(spec(Role::Build)).await.is_err());

        let err = manager.stop(Role::Build).await.unwrap_err();
        assert!(matches!(err, PrepError::Precondition { .. }));
        manager.remove_all().await;
    }

    #[test]
    fn test_state_never_moves_backwards() {
        let mut instance = Instance {
            name: "mcprep-build-x".to_string(),
            role: Role::Build,
            state: InstanceState::Stopped,
            container_id: None,
            confirmed_paths: Vec::new(),
        };
        assert!(instance.advance(InstanceState::Ready).is_err());
        assert!(instance.advance(InstanceState::Removed).is_ok());
    }

    #[test]
    fn test_path_confirmation_covers_descendants() {
        let mut instance = Instance {
            name: "mcprep-build-x".to_string(),
            role: Role::Build,
            state: InstanceState::Running,
            container_id: None,
            confirmed_paths: Vec::new(),
        };
        instance.confirm_path("/mc/plotworld").unwrap();
        assert_eq!(instance.state(), InstanceState::Ready);
        assert!(instance.is_path_confirmed("/mc/plotworld"));
        assert!(instance.is_path_confirmed("/mc/plotworld/region"));
        assert!(!instance.is_path_confirmed("/mc/plotworld2"));
        assert!(!instance.is_path_confirmed("/mc"));
    }
}
