//! Kernel namespace selection and joining.
//!
//! A container's isolation is expressed as a [`NamespaceSet`]; the derived
//! clone-flag bitmask is handed to `clone(2)` at spawn time, and
//! [`join`] re-enters a live process's namespaces via `setns(2)`.

use std::fs::File;
use std::path::PathBuf;

use nix::sched::{setns, CloneFlags};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use berth_common::error::{BerthError, Result};

/// A kernel namespace kind a container may be isolated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Process-id namespace.
    Pid,
    /// Network namespace.
    Net,
    /// Mount namespace.
    Mnt,
    /// System V IPC / POSIX message queue namespace.
    Ipc,
    /// Hostname and domain-name namespace.
    Uts,
    /// User and group id namespace.
    User,
}

impl Namespace {
    /// All namespace kinds, in the order they are joined by `setns`.
    ///
    /// User comes last: once the caller has entered a user namespace it
    /// loses the privileges required to enter the others.
    pub const ALL: [Self; 6] = [
        Self::Ipc,
        Self::Uts,
        Self::Net,
        Self::Pid,
        Self::Mnt,
        Self::User,
    ];

    /// Returns the clone flag selecting this namespace.
    #[must_use]
    pub fn clone_flag(self) -> CloneFlags {
        match self {
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Net => CloneFlags::CLONE_NEWNET,
            Self::Mnt => CloneFlags::CLONE_NEWNS,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::User => CloneFlags::CLONE_NEWUSER,
        }
    }

    /// Returns the file name of this namespace under `/proc/<pid>/ns/`.
    #[must_use]
    pub fn proc_file(self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Net => "net",
            Self::Mnt => "mnt",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::User => "user",
        }
    }
}

/// Ordered set of namespaces requested for a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceSet(Vec<Namespace>);

impl NamespaceSet {
    /// Builds a set from the given kinds, dropping duplicates while
    /// preserving first-seen order.
    #[must_use]
    pub fn new(kinds: impl IntoIterator<Item = Namespace>) -> Self {
        let mut inner = Vec::new();
        for kind in kinds {
            if !inner.contains(&kind) {
                inner.push(kind);
            }
        }
        Self(inner)
    }

    /// Returns whether the set requests the given namespace kind.
    #[must_use]
    pub fn contains(&self, kind: Namespace) -> bool {
        self.0.contains(&kind)
    }

    /// Derives the clone-flag bitmask selecting every namespace in the set.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        self.0
            .iter()
            .fold(CloneFlags::empty(), |flags, ns| flags | ns.clone_flag())
    }

    /// Iterates over the requested kinds in order.
    pub fn iter(&self) -> impl Iterator<Item = Namespace> + '_ {
        self.0.iter().copied()
    }

    /// Returns whether no namespaces are requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Namespace> for NamespaceSet {
    fn from_iter<T: IntoIterator<Item = Namespace>>(iter: T) -> Self {
        Self::new(iter)
    }
}

/// Joins one namespace of a live process via `setns(2)`.
///
/// # Errors
///
/// Returns an error if the namespace file cannot be opened or the `setns`
/// syscall fails.
pub fn join(pid: Pid, ns: Namespace) -> Result<()> {
    let path = PathBuf::from(format!("/proc/{pid}/ns/{}", ns.proc_file()));
    let file = File::open(&path).map_err(|e| BerthError::io(path.clone(), e))?;
    setns(&file, ns.clone_flag()).map_err(|e| BerthError::system("setns", e))?;
    tracing::debug!(pid = pid.as_raw(), ns = ns.proc_file(), "joined namespace");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_flags_cover_every_requested_kind() {
        let set = NamespaceSet::new([Namespace::Pid, Namespace::Net, Namespace::Mnt]);
        let flags = set.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn duplicate_kinds_are_dropped() {
        let set = NamespaceSet::new([Namespace::Pid, Namespace::Pid, Namespace::Uts]);
        assert_eq!(set.iter().count(), 2);
    }

    #[test]
    fn empty_set_derives_empty_mask() {
        let set = NamespaceSet::default();
        assert!(set.clone_flags().is_empty());
        assert!(set.is_empty());
    }

    #[test]
    fn set_serializes_as_plain_list() {
        let set = NamespaceSet::new([Namespace::Pid, Namespace::User]);
        let json = serde_json::to_string(&set).expect("serialize");
        assert_eq!(json, r#"["pid","user"]"#);
        let back: NamespaceSet = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, set);
    }

    #[test]
    fn user_namespace_is_joined_last() {
        assert_eq!(Namespace::ALL.last(), Some(&Namespace::User));
    }
}
