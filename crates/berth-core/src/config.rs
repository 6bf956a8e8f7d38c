//! Immutable container configuration model.
//!
//! A [`Config`] is produced by an external factory and never mutated after
//! construction; it is also the payload of the `Config` wire record sent to
//! the container's init over the control pipe.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use berth_common::error::{BerthError, Result};

use crate::cgroup::CgroupSpec;
use crate::namespace::{Namespace, NamespaceSet};
use crate::network::{Network, Route};

/// One entry of a user-namespace uid or gid mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    /// First id inside the container's user namespace.
    pub container_id: u32,
    /// First id on the host it maps to.
    pub host_id: u32,
    /// Number of consecutive ids covered by this entry.
    pub size: u32,
}

/// Resource-limit kinds settable on the container init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RlimitKind {
    /// CPU time in seconds.
    Cpu,
    /// Maximum file size.
    Fsize,
    /// Data segment size.
    Data,
    /// Stack size.
    Stack,
    /// Core file size.
    Core,
    /// Number of processes.
    Nproc,
    /// Number of open files.
    Nofile,
    /// Locked memory.
    Memlock,
    /// Address space size.
    As,
}

impl RlimitKind {
    /// Maps the kind onto the kernel resource identifier.
    #[must_use]
    pub fn resource(self) -> nix::sys::resource::Resource {
        use nix::sys::resource::Resource;
        match self {
            Self::Cpu => Resource::RLIMIT_CPU,
            Self::Fsize => Resource::RLIMIT_FSIZE,
            Self::Data => Resource::RLIMIT_DATA,
            Self::Stack => Resource::RLIMIT_STACK,
            Self::Core => Resource::RLIMIT_CORE,
            Self::Nproc => Resource::RLIMIT_NPROC,
            Self::Nofile => Resource::RLIMIT_NOFILE,
            Self::Memlock => Resource::RLIMIT_MEMLOCK,
            Self::As => Resource::RLIMIT_AS,
        }
    }
}

/// A resource limit applied to the init before `execve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    /// Which resource the limit constrains.
    pub kind: RlimitKind,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit.
    pub hard: u64,
}

/// A bind mount made available inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host path to bind from.
    pub source: PathBuf,
    /// Absolute path inside the container to bind to.
    pub destination: PathBuf,
    /// Whether the mount is writable.
    #[serde(default)]
    pub writable: bool,
}

/// Immutable snapshot of everything needed to boot a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root filesystem path on the host.
    pub rootfs: PathBuf,
    /// Hostname set inside a UTS namespace.
    #[serde(default)]
    pub hostname: String,
    /// Environment vector, `KEY=value` form.
    #[serde(default)]
    pub env: Vec<String>,
    /// Kernel namespaces requested for the init.
    pub namespaces: NamespaceSet,
    /// Ordered uid mapping table for the user namespace.
    #[serde(default)]
    pub uid_mappings: Vec<IdMap>,
    /// Ordered gid mapping table for the user namespace.
    #[serde(default)]
    pub gid_mappings: Vec<IdMap>,
    /// Resource-control group specification.
    pub cgroups: CgroupSpec,
    /// Ordered list of networks to create for the container.
    #[serde(default)]
    pub networks: Vec<Network>,
    /// Ordered list of routes to install inside the network namespace.
    #[serde(default)]
    pub routes: Vec<Route>,
    /// SELinux process label applied before `execve`.
    #[serde(default)]
    pub process_label: String,
    /// AppArmor profile applied before `execve`.
    #[serde(default)]
    pub apparmor_profile: String,
    /// Resource limits applied to the init.
    #[serde(default)]
    pub rlimits: Vec<Rlimit>,
    /// Capability names retained in the bounding set; `None` keeps all.
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    /// Remount the root filesystem read-only after setup.
    #[serde(default)]
    pub readonly_rootfs: bool,
    /// Additional bind mounts.
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

impl Config {
    /// Checks that the namespace set can satisfy the configured networking.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::ConfigMismatch`] when networks or routes are
    /// configured without a network namespace.
    pub fn ensure_can_network(&self) -> Result<()> {
        if !self.namespaces.contains(Namespace::Net)
            && (!self.networks.is_empty() || !self.routes.is_empty())
        {
            return Err(BerthError::ConfigMismatch {
                message: "unable to apply network parameters without a network namespace".into(),
            });
        }
        Ok(())
    }
}
