//! Atomic persistence of the container runtime state.
//!
//! The state lives in a single file inside the container root. Writes go to
//! a sibling temporary (`state.json.new`) which is renamed over the target,
//! so a partial write is never observable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use berth_common::constants::STATE_FILENAME;
use berth_common::error::{BerthError, Result};
use berth_core::network::NetworkState;

/// Mutable runtime state of a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    /// Pid of the init process; 0 when no init runs.
    pub init_pid: i32,
    /// Init start time in clock ticks since boot, for pid-reuse detection.
    pub init_start_time: u64,
    /// Opaque per-network records, in configured order.
    pub network_state: Vec<NetworkState>,
    /// Cgroup path per controller key.
    pub cgroup_paths: HashMap<String, PathBuf>,
}

/// Returns the state file path for a container root.
#[must_use]
pub fn state_file(root: &Path) -> PathBuf {
    root.join(STATE_FILENAME)
}

/// Persists the runtime state atomically into the container root.
///
/// # Errors
///
/// Returns an error if serialization, the temporary write, or the rename
/// fails; the previous state file is left intact and the temporary removed.
pub fn save(root: &Path, state: &RuntimeState) -> Result<()> {
    let target = state_file(root);
    let tmp = root.join(format!("{STATE_FILENAME}.new"));

    let json = serde_json::to_vec_pretty(state)?;
    if let Err(e) = std::fs::write(&tmp, &json) {
        let _ = std::fs::remove_file(&tmp);
        return Err(BerthError::io(tmp, e));
    }
    if let Err(e) = std::fs::rename(&tmp, &target) {
        let _ = std::fs::remove_file(&tmp);
        return Err(BerthError::io(target, e));
    }
    tracing::debug!(path = %target.display(), "runtime state persisted");
    Ok(())
}

/// Loads the runtime state from a container root.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load(root: &Path) -> Result<RuntimeState> {
    let path = state_file(root);
    let contents = std::fs::read_to_string(&path).map_err(|e| BerthError::io(path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> RuntimeState {
        RuntimeState {
            init_pid: 4321,
            init_start_time: 8_979_167,
            network_state: vec![NetworkState {
                net_type: "loopback".into(),
                interface: "lo".into(),
                veth_host: String::new(),
                veth_child: String::new(),
            }],
            cgroup_paths: HashMap::from([(
                "unified".to_string(),
                PathBuf::from("/sys/fs/cgroup/berth/c1"),
            )]),
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = sample_state();

        save(dir.path(), &state).expect("save");
        let loaded = load(dir.path()).expect("load");
        assert_eq!(loaded, state);
    }

    #[test]
    fn save_replaces_previous_state_atomically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = sample_state();

        save(dir.path(), &state).expect("first save");
        state.init_pid = 0;
        save(dir.path(), &state).expect("second save");

        let loaded = load(dir.path()).expect("load");
        assert_eq!(loaded.init_pid, 0);
        assert!(
            !dir.path().join(format!("{STATE_FILENAME}.new")).exists(),
            "temporary must not remain after a successful save"
        );
    }

    #[test]
    fn failed_save_leaves_original_intact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = sample_state();
        save(dir.path(), &state).expect("save");

        // a directory squatting on the target makes the rename fail
        let target = state_file(dir.path());
        std::fs::remove_file(&target).expect("clear target");
        std::fs::create_dir(&target).expect("squat on target");

        let result = save(dir.path(), &RuntimeState::default());
        assert!(result.is_err(), "rename over a directory must fail");
        assert!(
            !dir.path().join(format!("{STATE_FILENAME}.new")).exists(),
            "temporary must be removed on failure"
        );
    }

    #[test]
    fn load_missing_state_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load(dir.path()).is_err());
    }
}
