//! Pid-count resource control via cgroups v2.

use std::path::Path;

use berth_common::error::{BerthError, Result};

use super::{read_counter, PidsStats};

/// Sets the maximum number of pids for a cgroup.
///
/// # Errors
///
/// Returns an error if writing to `pids.max` fails.
pub fn set_pids_max(cgroup_path: &Path, limit: u64) -> Result<()> {
    let file = cgroup_path.join("pids.max");
    std::fs::write(&file, limit.to_string()).map_err(|e| BerthError::io(file, e))?;
    tracing::debug!(limit, "pids max set");
    Ok(())
}

/// Reads the current pid count from `pids.current`.
///
/// # Errors
///
/// Returns an error if `pids.current` cannot be read.
pub fn stats(cgroup_path: &Path) -> Result<PidsStats> {
    Ok(PidsStats {
        current: read_counter(&cgroup_path.join("pids.current"))?,
    })
}
