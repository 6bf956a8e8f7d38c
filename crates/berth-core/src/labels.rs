//! Process labeling back-ends (AppArmor / SELinux).
//!
//! Thin collaborators consumed during child finalization. Both back-ends
//! schedule the label for the upcoming `execve` via `/proc/self/attr`.

use std::path::Path;
use std::sync::OnceLock;

use berth_common::error::{BerthError, Result};

const ATTR_EXEC: &str = "/proc/self/attr/exec";

/// Probes whether SELinux is enabled on the host.
///
/// The result is cached for the life of the process.
#[must_use]
pub fn selinux_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| Path::new("/sys/fs/selinux/enforce").exists())
}

/// Idempotent label-system initialization.
///
/// Safe to call from any process that will later apply labels; repeated
/// calls are no-ops.
pub fn init() {
    let _ = selinux_enabled();
}

/// Schedules an AppArmor profile transition for the next `execve`.
///
/// An empty profile name is a no-op.
///
/// # Errors
///
/// Returns an error if the attribute file cannot be written.
pub fn apply_apparmor_profile(profile: &str) -> Result<()> {
    if profile.is_empty() {
        return Ok(());
    }
    std::fs::write(ATTR_EXEC, format!("exec {profile}"))
        .map_err(|e| BerthError::io(ATTR_EXEC, e))?;
    tracing::debug!(profile, "apparmor exec profile set");
    Ok(())
}

/// Schedules an SELinux process label for the next `execve`.
///
/// A no-op when the label is empty or SELinux is not enabled.
///
/// # Errors
///
/// Returns an error if the attribute file cannot be written.
pub fn set_process_label(label: &str) -> Result<()> {
    if label.is_empty() || !selinux_enabled() {
        return Ok(());
    }
    std::fs::write(ATTR_EXEC, label).map_err(|e| BerthError::io(ATTR_EXEC, e))?;
    tracing::debug!(label, "selinux exec label set");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_profile_is_a_noop() {
        apply_apparmor_profile("").expect("empty profile ignored");
    }

    #[test]
    fn empty_label_is_a_noop() {
        set_process_label("").expect("empty label ignored");
    }

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
