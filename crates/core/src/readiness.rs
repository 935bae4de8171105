//! Bounded readiness polling
//!
//! [`wait_for`] sleeps one interval, checks, and repeats until the check
//! reports true or the timeout has elapsed. It never loops forever: when the
//! condition is never observed it returns [`Readiness::TimedOut`] no later
//! than `timeout + interval` after invocation. A check still pending at that
//! deadline is abandoned.

use crate::errors::{PrepError, Result};
use crate::lifecycle::{LifecycleManager, Role};
use crate::runtime::ContainerRuntime;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Polling cadence and bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Result of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { attempts: u32, elapsed: Duration },
    TimedOut { attempts: u32, elapsed: Duration },
}

/// An observable condition
#[allow(async_fn_in_trait)]
pub trait ReadinessCheck {
    /// Human-readable description used in logs and errors
    fn describe(&self) -> String;

    /// Check the condition once
    async fn check(&self) -> Result<bool>;
}

/// "Does `path` exist inside `container`", checked with `test -e`
pub struct PathExists<'a, R: ContainerRuntime> {
    runtime: &'a R,
    container: &'a str,
    path: &'a str,
}

impl<'a, R: ContainerRuntime> PathExists<'a, R> {
    pub fn new(runtime: &'a R, container: &'a str, path: &'a str) -> Self {
        Self {
            runtime,
            container,
            path,
        }
    }
}

impl<R: ContainerRuntime> ReadinessCheck for PathExists<'_, R> {
    fn describe(&self) -> String {
        format!("{}:{}", self.container, self.path)
    }

    async fn check(&self) -> Result<bool> {
        let command = vec!["test".to_string(), "-e".to_string(), self.path.to_string()];
        let result = self.runtime.exec(self.container, &command).await?;
        Ok(result.success)
    }
}

/// Poll `condition` every `config.interval` until it holds or `config.timeout` elapses
///
/// Check errors count as "not yet" so a container that is still booting does
/// not abort the wait. Each check may run until `timeout + interval` after the
/// start at most.
#[instrument(level = "debug", skip(condition), fields(condition = %condition.describe()))]
pub async fn wait_for<P: ReadinessCheck>(condition: &P, config: &PollConfig) -> Readiness {
    let start = Instant::now();
    let deadline = start + config.timeout + config.interval;
    let mut attempts = 0u32;

    loop {
        tokio::time::sleep(config.interval).await;
        attempts += 1;

        match tokio::time::timeout_at(deadline, condition.check()).await {
            Ok(Ok(true)) => {
                let elapsed = start.elapsed();
                debug!("Condition observed on attempt {} after {:?}", attempts, elapsed);
                return Readiness::Ready { attempts, elapsed };
            }
            Ok(Ok(false)) => debug!("Attempt {}: not ready yet", attempts),
            Ok(Err(e)) => debug!("Attempt {}: check failed: {}", attempts, e),
            Err(_) => debug!("Attempt {}: check did not finish before the deadline", attempts),
        }

        let elapsed = start.elapsed();
        if elapsed >= config.timeout {
            warn!(
                "Gave up on {} after {} attempts ({:?})",
                condition.describe(),
                attempts,
                elapsed
            );
            return Readiness::TimedOut { attempts, elapsed };
        }
    }
}

/// Wait for `path` inside the role's instance and record it on success
///
/// A timeout is converted into [`PrepError::Timeout`].
pub async fn wait_for_path<R: ContainerRuntime>(
    manager: &mut LifecycleManager<'_, R>,
    role: Role,
    path: &str,
    config: &PollConfig,
) -> Result<Readiness> {
    let runtime = manager.runtime();
    let name = match manager.instance(role) {
        Some(instance) if instance.is_live() => instance.name().to_string(),
        Some(instance) => {
            return Err(PrepError::precondition(format!(
                "Instance {} is not running (state {:?})",
                instance.name(),
                instance.state()
            )))
        }
        None => {
            return Err(PrepError::precondition(format!(
                "No instance for role '{}'",
                role
            )))
        }
    };

    let readiness = wait_for(&PathExists::new(runtime, &name, path), config).await;
    match readiness {
        Readiness::Ready { attempts, elapsed } => {
            info!("{}:{} present after {:?} ({} polls)", name, path, elapsed, attempts);
            if let Some(instance) = manager.instance_mut(role) {
                instance.confirm_path(path)?;
            }
            Ok(readiness)
        }
        Readiness::TimedOut { elapsed, .. } => Err(PrepError::Timeout {
            what: format!("{}:{}", name, path),
            elapsed_secs: elapsed.as_secs(),
        }),
    }
}
