//! CPU resource control via cgroups v2.
//!
//! Manages `cpu.weight` and parses `cpu.stat`.

use std::path::Path;

use berth_common::error::{BerthError, Result};

use super::CpuStats;

/// Sets the relative CPU weight for a cgroup.
///
/// # Errors
///
/// Returns an error if writing to `cpu.weight` fails.
pub fn set_cpu_weight(cgroup_path: &Path, weight: u64) -> Result<()> {
    let file = cgroup_path.join("cpu.weight");
    std::fs::write(&file, weight.to_string()).map_err(|e| BerthError::io(file, e))?;
    tracing::debug!(weight, "cpu weight set");
    Ok(())
}

/// Reads the CPU accounting snapshot from `cpu.stat`.
///
/// Unknown keys are ignored so newer kernels do not break parsing.
///
/// # Errors
///
/// Returns an error if `cpu.stat` cannot be read.
pub fn stats(cgroup_path: &Path) -> Result<CpuStats> {
    let file = cgroup_path.join("cpu.stat");
    let contents = std::fs::read_to_string(&file).map_err(|e| BerthError::io(file, e))?;

    let mut stats = CpuStats::default();
    for line in contents.lines() {
        let Some((key, value)) = line.split_once(' ') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };
        match key {
            "usage_usec" => stats.usage_usec = value,
            "user_usec" => stats.user_usec = value,
            "system_usec" => stats.system_usec = value,
            _ => {}
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_parse_known_keys_and_skip_others() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("cpu.stat"),
            "usage_usec 123\nuser_usec 100\nsystem_usec 23\nnr_periods 7\n",
        )
        .expect("write cpu.stat");

        let stats = stats(dir.path()).expect("stats");
        assert_eq!(stats.usage_usec, 123);
        assert_eq!(stats.user_usec, 100);
        assert_eq!(stats.system_usec, 23);
    }
}
