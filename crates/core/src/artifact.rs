//! Artifact extraction
//!
//! Copies a generated path out of an instance onto the host. Extraction is
//! only allowed once readiness polling has confirmed the source path (or one
//! of its ancestors) inside that instance.

use crate::errors::{PrepError, Result};
use crate::lifecycle::{Instance, InstanceState, Role};
use crate::runtime::ContainerRuntime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// A path to copy out of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub role: Role,
    /// Absolute path inside the container
    pub source: String,
    /// Host path, relative to the base directory unless absolute
    pub destination: PathBuf,
}

/// Copy `source` from `instance` to `dest`, replacing whatever is there
#[instrument(skip(runtime, instance), fields(instance = %instance.name()))]
pub async fn extract<R: ContainerRuntime>(
    runtime: &R,
    instance: &Instance,
    source: &str,
    dest: &Path,
) -> Result<()> {
    if instance.state() == InstanceState::Removed {
        return Err(PrepError::precondition(format!(
            "Instance {} has already been removed",
            instance.name()
        )));
    }
    if !instance.is_path_confirmed(source) {
        return Err(PrepError::precondition(format!(
            "{} has not been observed in {}; wait for it before extracting",
            source,
            instance.name()
        )));
    }

    clear_destination(dest)?;
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| PrepError::io(parent, e))?;
    }

    runtime.copy_from(instance.name(), source, dest).await?;
    info!("Extracted {}:{} to {}", instance.name(), source, dest.display());
    Ok(())
}

/// Remove a previous extraction so the copy does not nest inside it
fn clear_destination(dest: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(dest) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PrepError::io(dest, e)),
    };

    debug!("Replacing existing {}", dest.display());
    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(dest)
    } else {
        std::fs::remove_file(dest)
    };
    result.map_err(|e| PrepError::io(dest, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{InstanceSpec, LifecycleManager};
    use crate::runtime::mock::MockRuntime;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn build_spec() -> InstanceSpec {
        InstanceSpec {
            role: Role::Build,
            image: "minecraft-docker:latest".to_string(),
            mounts: Vec::new(),
            ports: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_extract_requires_confirmation() {
        let runtime = MockRuntime::new().with_path("/mc/plotworld");
        let mut manager = LifecycleManager::new(&runtime, "a1");
        manager.create(build_spec()).await.unwrap();
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("world/plotworld");

        let instance = manager.instance(Role::Build).unwrap().clone();
        let err = extract(&runtime, &instance, "/mc/plotworld", &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, PrepError::Precondition { .. }));
        assert!(runtime.copies().is_empty());

        manager
            .instance_mut(Role::Build)
            .unwrap()
            .confirm_path("/mc/plotworld")
            .unwrap();
        let instance = manager.instance(Role::Build).unwrap().clone();
        extract(&runtime, &instance, "/mc/plotworld", &dest)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(&dest).unwrap(),
            "mcprep-build-a1:/mc/plotworld\n"
        );
        manager.remove_all().await;
    }

    #[tokio::test]
    async fn test_extract_replaces_previous_output() {
        let runtime = MockRuntime::new().with_path("/mc/plotworld");
        let mut manager = LifecycleManager::new(&runtime, "a2");
        manager.create(build_spec()).await.unwrap();
        manager
            .instance_mut(Role::Build)
            .unwrap()
            .confirm_path("/mc/plotworld")
            .unwrap();

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("plotworld");
        std::fs::create_dir_all(dest.join("region")).unwrap();
        std::fs::write(dest.join("region/r.0.0.mca"), b"stale").unwrap();

        let instance = manager.instance(Role::Build).unwrap().clone();
        extract(&runtime, &instance, "/mc/plotworld", &dest)
            .await
            .unwrap();
        assert!(dest.is_file());
        manager.remove_all().await;
    }

    #[tokio::test]
    async fn test_extract_after_removal_fails() {
        let runtime = MockRuntime::new().with_path("/mc/plotworld");
        let mut manager = LifecycleManager::new(&runtime, "a3");
        manager.create(build_spec()).await.unwrap();
        manager
            .instance_mut(Role::Build)
            .unwrap()
            .confirm_path("/mc")
            .unwrap();
        manager.remove(Role::Build).await.unwrap();

        let temp = TempDir::new().unwrap();
        let instance = manager.instance(Role::Build).unwrap().clone();
        let err = extract(&runtime, &instance, "/mc/plotworld", &temp.path().join("w"))
            .await
            .unwrap_err();
        assert!(matches!(err, PrepError::Precondition { .. }));
    }
}
