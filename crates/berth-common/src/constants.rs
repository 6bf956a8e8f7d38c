//! System-wide constants and default paths.

/// Default base directory for berth container roots.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/berth";

/// Name of the runtime state file inside a container root.
pub const STATE_FILENAME: &str = "state.json";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Descriptor number at which the child half of the control pipe is
/// inherited by re-invoked binaries.
pub const INIT_PIPE_FD: i32 = 3;

/// Environment variable naming the inherited control-pipe descriptor.
pub const ENV_INIT_PIPE: &str = "_BERTH_INITPIPE";

/// Environment variable carrying the pid of an existing container init.
///
/// Present when the child is expected to `setns` into that container.
pub const ENV_INIT_PID: &str = "_BERTH_INITPID";

/// Environment variable marking the user-namespace setup helper.
pub const ENV_USERNS: &str = "_BERTH_USERNS";

/// Offset added to a signal number when synthesizing an exit code from a
/// signalled child.
pub const EXIT_SIGNAL_OFFSET: i32 = 128;

/// Application name used in logs and state files.
pub const APP_NAME: &str = "berth";

/// Name of the init re-entry binary.
pub const INIT_BIN_NAME: &str = "berth-init";
