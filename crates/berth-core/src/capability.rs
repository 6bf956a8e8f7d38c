//! Linux capability management for least-privilege execution.
//!
//! Drops capabilities from the bounding set before `execve`, retaining only
//! those explicitly requested by the container configuration.

use nix::errno::Errno;

use berth_common::error::{BerthError, Result};

/// Well-known capability names and their kernel numbers.
const CAPABILITIES: &[(&str, u64)] = &[
    ("CHOWN", 0),
    ("DAC_OVERRIDE", 1),
    ("DAC_READ_SEARCH", 2),
    ("FOWNER", 3),
    ("FSETID", 4),
    ("KILL", 5),
    ("SETGID", 6),
    ("SETUID", 7),
    ("SETPCAP", 8),
    ("LINUX_IMMUTABLE", 9),
    ("NET_BIND_SERVICE", 10),
    ("NET_BROADCAST", 11),
    ("NET_ADMIN", 12),
    ("NET_RAW", 13),
    ("IPC_LOCK", 14),
    ("IPC_OWNER", 15),
    ("SYS_MODULE", 16),
    ("SYS_RAWIO", 17),
    ("SYS_CHROOT", 18),
    ("SYS_PTRACE", 19),
    ("SYS_PACCT", 20),
    ("SYS_ADMIN", 21),
    ("SYS_BOOT", 22),
    ("SYS_NICE", 23),
    ("SYS_RESOURCE", 24),
    ("SYS_TIME", 25),
    ("SYS_TTY_CONFIG", 26),
    ("MKNOD", 27),
    ("LEASE", 28),
    ("AUDIT_WRITE", 29),
    ("AUDIT_CONTROL", 30),
    ("SETFCAP", 31),
    ("MAC_OVERRIDE", 32),
    ("MAC_ADMIN", 33),
    ("SYSLOG", 34),
    ("WAKE_ALARM", 35),
    ("BLOCK_SUSPEND", 36),
    ("AUDIT_READ", 37),
];

/// Resolves a capability name to its kernel number.
///
/// Accepts names with or without the `CAP_` prefix, case-insensitively.
#[must_use]
pub fn capability_id(name: &str) -> Option<u64> {
    let upper = name.to_ascii_uppercase();
    let stripped = upper.strip_prefix("CAP_").unwrap_or(&upper);
    CAPABILITIES
        .iter()
        .find(|(cap, _)| *cap == stripped)
        .map(|(_, id)| *id)
}

/// Drops every capability from the bounding set except those named.
///
/// Unknown names are ignored; the kernel's own capability ceiling ends the
/// sweep.
///
/// # Errors
///
/// Returns an error if a `PR_CAPBSET_DROP` call fails for a supported
/// capability.
pub fn drop_bounding_capabilities(keep: &[String]) -> Result<()> {
    let keep_ids: Vec<u64> = keep.iter().filter_map(|name| capability_id(name)).collect();

    for cap in 0..=last_capability() {
        if keep_ids.contains(&cap) {
            continue;
        }
        // SAFETY: PR_CAPBSET_DROP takes a capability number and no pointers.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
        if rc != 0 {
            let errno = Errno::last();
            if errno == Errno::EINVAL {
                // past the highest capability this kernel supports
                break;
            }
            return Err(BerthError::system("prctl(PR_CAPBSET_DROP)", errno));
        }
    }
    tracing::debug!(retained = keep_ids.len(), "bounding capabilities dropped");
    Ok(())
}

fn last_capability() -> u64 {
    std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|contents| contents.trim().parse().ok())
        .unwrap_or(40)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_names_resolve_with_and_without_prefix() {
        assert_eq!(capability_id("CAP_NET_BIND_SERVICE"), Some(10));
        assert_eq!(capability_id("net_bind_service"), Some(10));
        assert_eq!(capability_id("SYS_ADMIN"), Some(21));
    }

    #[test]
    fn unknown_capability_name_resolves_to_none() {
        assert_eq!(capability_id("CAP_TIME_TRAVEL"), None);
    }

    #[test]
    fn last_capability_is_plausible() {
        assert!(last_capability() >= 37);
    }
}
