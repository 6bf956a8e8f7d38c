//! Memory resource control via cgroups v2.
//!
//! Manages `memory.max` and reads the accounting files.

use std::io::ErrorKind;
use std::path::Path;

use berth_common::error::{BerthError, Result};

use super::{read_counter, MemoryStats};

/// Sets the hard memory limit for a cgroup.
///
/// Processes exceeding this limit are subject to the OOM killer.
///
/// # Errors
///
/// Returns an error if writing to `memory.max` fails.
pub fn set_memory_max(cgroup_path: &Path, bytes: u64) -> Result<()> {
    let file = cgroup_path.join("memory.max");
    std::fs::write(&file, bytes.to_string()).map_err(|e| BerthError::io(file, e))?;
    tracing::debug!(bytes, "memory max limit set");
    Ok(())
}

/// Reads the memory accounting snapshot for a cgroup.
///
/// `memory.peak` is not present on older kernels; it reads as 0 there.
///
/// # Errors
///
/// Returns an error if `memory.current` cannot be read.
pub fn stats(cgroup_path: &Path) -> Result<MemoryStats> {
    let current = read_counter(&cgroup_path.join("memory.current"))?;
    let peak = match read_counter(&cgroup_path.join("memory.peak")) {
        Ok(value) => value,
        Err(BerthError::Io { ref source, .. }) if source.kind() == ErrorKind::NotFound => 0,
        Err(e) => return Err(e),
    };
    Ok(MemoryStats { current, peak })
}
