//! One-shot OOM notification for a container cgroup.
//!
//! Watches the `oom_kill` counter in the group's `memory.events` file and
//! fires a channel once when it increments. If the group disappears the
//! sender is dropped, which a blocked receiver observes as disconnection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use berth_common::error::{BerthError, Result};
use berth_core::cgroup::UNIFIED;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Starts an OOM watcher over the recorded cgroup paths.
///
/// # Errors
///
/// Returns an error if no cgroup path is recorded or the event counter
/// cannot be read.
pub fn notify_on_oom(paths: &HashMap<String, PathBuf>) -> Result<Receiver<()>> {
    let Some(path) = paths.get(UNIFIED) else {
        return Err(BerthError::ConfigMismatch {
            message: "no cgroup path recorded for oom notification".into(),
        });
    };
    let events = path.join("memory.events");
    let baseline = oom_kill_count(&events)?;

    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("berth-oom".into())
        .spawn(move || loop {
            thread::sleep(POLL_INTERVAL);
            match oom_kill_count(&events) {
                Ok(count) if count > baseline => {
                    let _ = tx.send(());
                    return;
                }
                Ok(_) => {}
                Err(_) => return,
            }
        })
        .map_err(|e| BerthError::io("oom watcher thread", e))?;
    Ok(rx)
}

fn oom_kill_count(events: &Path) -> Result<u64> {
    let contents =
        std::fs::read_to_string(events).map_err(|e| BerthError::io(events, e))?;
    Ok(contents
        .lines()
        .find_map(|line| line.strip_prefix("oom_kill "))
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0))
}
