//! Cgroups v2 resource control.
//!
//! [`CgroupManager`] is the capability set the container object consumes:
//! attach a pid, enumerate pids, report statistics and paths, drive the
//! freezer, and destroy the group. [`FsManager`] is the shipped driver for
//! the unified hierarchy at `/sys/fs/cgroup`.

pub mod cpu;
pub mod memory;
pub mod pids;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use berth_common::constants::CGROUP_V2_PATH;
use berth_common::error::{BerthError, Result};
use berth_common::types::FreezerState;

/// Key under which the unified-hierarchy path is reported by
/// [`CgroupManager::paths`].
pub const UNIFIED: &str = "unified";

/// Resource-control group specification for a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupSpec {
    /// Leaf group name, usually the container id.
    pub name: String,
    /// Parent group under the hierarchy root.
    #[serde(default = "default_parent")]
    pub parent: String,
    /// Hard memory limit in bytes.
    #[serde(default)]
    pub memory_limit: Option<u64>,
    /// Relative CPU weight (1-10000).
    #[serde(default)]
    pub cpu_weight: Option<u64>,
    /// Maximum number of pids in the group.
    #[serde(default)]
    pub pids_limit: Option<u64>,
    /// Initial freezer target, if any.
    #[serde(default)]
    pub freezer: Option<FreezerState>,
}

fn default_parent() -> String {
    berth_common::constants::APP_NAME.to_string()
}

impl CgroupSpec {
    /// Creates a spec with the default parent and no resource limits.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: default_parent(),
            memory_limit: None,
            cpu_weight: None,
            pids_limit: None,
            freezer: None,
        }
    }
}

/// Memory accounting snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Current usage in bytes.
    pub current: u64,
    /// Peak usage in bytes, 0 when the kernel does not report it.
    pub peak: u64,
}

/// CPU accounting snapshot from `cpu.stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStats {
    /// Total CPU time in microseconds.
    pub usage_usec: u64,
    /// User-mode CPU time in microseconds.
    pub user_usec: u64,
    /// Kernel-mode CPU time in microseconds.
    pub system_usec: u64,
}

/// Pid accounting snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidsStats {
    /// Current number of pids in the group.
    pub current: u64,
}

/// Composite cgroup statistics for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupStats {
    /// Memory accounting.
    pub memory: MemoryStats,
    /// CPU accounting.
    pub cpu: CpuStats,
    /// Pid accounting.
    pub pids: PidsStats,
}

/// Capability set through which the container object controls its group.
pub trait CgroupManager: Send {
    /// Creates the group if needed, applies resource limits, and attaches
    /// the pid.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be created or written.
    fn apply(&self, pid: Pid) -> Result<()>;

    /// Returns the pids currently in the group.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.procs` cannot be read.
    fn pids(&self) -> Result<Vec<Pid>>;

    /// Collects a statistics snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a stat file cannot be read.
    fn stats(&self) -> Result<CgroupStats>;

    /// Reports the group path per controller key.
    fn paths(&self) -> HashMap<String, PathBuf>;

    /// Sets the freezer target.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.freeze` cannot be written.
    fn freeze(&self, state: FreezerState) -> Result<()>;

    /// Removes the group, releasing its resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the group directory cannot be removed.
    fn destroy(&self) -> Result<()>;
}

/// Attaches a pid to every path of a previously created group.
///
/// Used when injecting a process into a live container: the paths come from
/// the recorded runtime state rather than from a manager instance.
///
/// # Errors
///
/// Returns an error if any `cgroup.procs` write fails.
pub fn enter(paths: &HashMap<String, PathBuf>, pid: Pid) -> Result<()> {
    for path in paths.values() {
        let procs = path.join("cgroup.procs");
        std::fs::write(&procs, pid.as_raw().to_string())
            .map_err(|e| BerthError::io(procs.clone(), e))?;
    }
    tracing::debug!(pid = pid.as_raw(), "entered cgroup paths");
    Ok(())
}

/// Reads the current freezer target from recorded group paths.
///
/// A group without a freezer interface reports [`FreezerState::Thawed`].
///
/// # Errors
///
/// Returns an error if `cgroup.freeze` exists but cannot be read.
pub fn freezer_target(paths: &HashMap<String, PathBuf>) -> Result<FreezerState> {
    let Some(path) = paths.get(UNIFIED) else {
        return Ok(FreezerState::Thawed);
    };
    let freeze = path.join("cgroup.freeze");
    match std::fs::read_to_string(&freeze) {
        Ok(contents) if contents.trim() == "1" => Ok(FreezerState::Frozen),
        Ok(_) => Ok(FreezerState::Thawed),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(FreezerState::Thawed),
        Err(e) => Err(BerthError::io(freeze, e)),
    }
}

/// Cgroups v2 unified-hierarchy driver.
#[derive(Debug)]
pub struct FsManager {
    spec: CgroupSpec,
    path: PathBuf,
}

impl FsManager {
    /// Creates a driver for the spec, rooted at the unified hierarchy.
    #[must_use]
    pub fn new(spec: CgroupSpec) -> Self {
        let path = PathBuf::from(CGROUP_V2_PATH)
            .join(&spec.parent)
            .join(&spec.name);
        Self { spec, path }
    }

    /// Creates a driver with an explicit hierarchy root, for tests.
    #[must_use]
    pub fn with_root(spec: CgroupSpec, root: &Path) -> Self {
        let path = root.join(&spec.parent).join(&spec.name);
        Self { spec, path }
    }

    /// Returns the group directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CgroupManager for FsManager {
    fn apply(&self, pid: Pid) -> Result<()> {
        std::fs::create_dir_all(&self.path).map_err(|e| BerthError::io(self.path.clone(), e))?;

        if let Some(bytes) = self.spec.memory_limit {
            memory::set_memory_max(&self.path, bytes)?;
        }
        if let Some(weight) = self.spec.cpu_weight {
            cpu::set_cpu_weight(&self.path, weight)?;
        }
        if let Some(limit) = self.spec.pids_limit {
            pids::set_pids_max(&self.path, limit)?;
        }
        if let Some(state) = self.spec.freezer {
            self.freeze(state)?;
        }

        let procs = self.path.join("cgroup.procs");
        std::fs::write(&procs, pid.as_raw().to_string())
            .map_err(|e| BerthError::io(procs, e))?;
        tracing::debug!(pid = pid.as_raw(), path = %self.path.display(), "cgroup applied");
        Ok(())
    }

    fn pids(&self) -> Result<Vec<Pid>> {
        let procs = self.path.join("cgroup.procs");
        let contents =
            std::fs::read_to_string(&procs).map_err(|e| BerthError::io(procs.clone(), e))?;
        Ok(contents
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .map(Pid::from_raw)
            .collect())
    }

    fn stats(&self) -> Result<CgroupStats> {
        Ok(CgroupStats {
            memory: memory::stats(&self.path)?,
            cpu: cpu::stats(&self.path)?,
            pids: pids::stats(&self.path)?,
        })
    }

    fn paths(&self) -> HashMap<String, PathBuf> {
        let mut paths = HashMap::new();
        paths.insert(UNIFIED.to_string(), self.path.clone());
        paths
    }

    fn freeze(&self, state: FreezerState) -> Result<()> {
        let freeze = self.path.join("cgroup.freeze");
        let value = match state {
            FreezerState::Frozen => "1",
            FreezerState::Thawed => "0",
        };
        std::fs::write(&freeze, value).map_err(|e| BerthError::io(freeze, e))?;
        tracing::debug!(?state, path = %self.path.display(), "freezer target set");
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        match std::fs::remove_dir(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "cgroup destroyed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BerthError::io(self.path.clone(), e)),
        }
    }
}

pub(crate) fn read_counter(path: &Path) -> Result<u64> {
    let contents = std::fs::read_to_string(path).map_err(|e| BerthError::io(path, e))?;
    contents
        .trim()
        .parse()
        .map_err(|_| BerthError::io(path, std::io::Error::new(ErrorKind::InvalidData, contents)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> CgroupSpec {
        CgroupSpec::new("test-container")
    }

    #[test]
    fn paths_report_unified_hierarchy_entry() {
        let manager = FsManager::new(spec());
        let paths = manager.paths();
        assert_eq!(paths.len(), 1);
        assert!(paths[UNIFIED].ends_with("berth/test-container"));
    }

    #[test]
    fn destroy_of_absent_group_is_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = FsManager::with_root(spec(), dir.path());
        manager.destroy().expect("absent group tolerated");
    }

    #[test]
    fn freezer_target_defaults_to_thawed_without_interface() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = FsManager::with_root(spec(), dir.path());
        std::fs::create_dir_all(manager.path()).expect("create group dir");

        let target = freezer_target(&manager.paths()).expect("read target");
        assert_eq!(target, FreezerState::Thawed);
    }

    #[test]
    fn freeze_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = FsManager::with_root(spec(), dir.path());
        std::fs::create_dir_all(manager.path()).expect("create group dir");

        manager.freeze(FreezerState::Frozen).expect("freeze");
        assert_eq!(
            freezer_target(&manager.paths()).expect("read"),
            FreezerState::Frozen
        );

        manager.freeze(FreezerState::Thawed).expect("thaw");
        assert_eq!(
            freezer_target(&manager.paths()).expect("read"),
            FreezerState::Thawed
        );
    }

    #[test]
    fn pids_parses_procs_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = FsManager::with_root(spec(), dir.path());
        std::fs::create_dir_all(manager.path()).expect("create group dir");
        std::fs::write(manager.path().join("cgroup.procs"), "12\n345\n").expect("write procs");

        let pids = manager.pids().expect("read pids");
        assert_eq!(pids, vec![Pid::from_raw(12), Pid::from_raw(345)]);
    }

    #[test]
    fn enter_writes_pid_into_every_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = FsManager::with_root(spec(), dir.path());
        std::fs::create_dir_all(manager.path()).expect("create group dir");

        enter(&manager.paths(), Pid::from_raw(4242)).expect("enter");
        let written =
            std::fs::read_to_string(manager.path().join("cgroup.procs")).expect("read back");
        assert_eq!(written, "4242");
    }
}
