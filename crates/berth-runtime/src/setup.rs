//! User-namespace setup helper, child side.
//!
//! An init that is root only in its own user namespace cannot mount
//! filesystems or configure network interfaces. The supervisor therefore
//! spawns this helper, which joins all of the init's namespaces *except*
//! the user namespace, staying host-root to perform mount-namespace and
//! network-interior setup before the init proceeds.

use nix::unistd::{self, Pid};

use berth_common::error::{BerthError, Result};
use berth_core::filesystem;
use berth_core::labels;
use berth_core::namespace::Namespace;
use berth_core::network::{self, Route};

use crate::init::join_namespaces;
use crate::pipe::{ChildPipe, PidRecord, ProcessArgs};

/// Runs the setup helper handshake.
///
/// Announces its own pid, joins the init's namespaces except user, reads
/// the `ProcessArgs` record, and performs the in-namespace setup. Failures
/// are reported back over the pipe.
///
/// # Errors
///
/// Returns an error if namespace entry, the handshake, or setup fails.
pub fn setup_main(mut pipe: ChildPipe, init_pid: Pid) -> Result<()> {
    pipe.send(&PidRecord {
        pid: unistd::getpid().as_raw(),
    })?;

    let result = run_setup(&mut pipe, init_pid);
    if let Err(ref e) = result {
        pipe.report_error(e);
    }
    result
}

fn run_setup(pipe: &mut ChildPipe, init_pid: Pid) -> Result<()> {
    join_namespaces(init_pid, |ns| ns != Namespace::User)?;

    let process: ProcessArgs = pipe.recv()?.ok_or_else(|| BerthError::InitFailed {
        message: "control pipe closed before process args".into(),
    })?;
    if pipe.recv::<serde_json::Value>()?.is_some() {
        return Err(BerthError::InitFailed {
            message: "unexpected record after process args".into(),
        });
    }
    setup_in_namespace(&process)
}

/// Mount and network setup performed from inside the container's
/// namespaces (except user).
///
/// Also runs in the init itself when no user namespace is configured and
/// no helper exists.
pub(crate) fn setup_in_namespace(process: &ProcessArgs) -> Result<()> {
    let config = &process.config;
    config.ensure_can_network()?;

    if config.namespaces.contains(Namespace::Net) {
        let registry = network::registry();
        for (net, state) in config.networks.iter().zip(&process.network_state) {
            registry.resolve(&net.net_type)?.initialize(net, state)?;
        }
        setup_routes(&config.routes)?;
    }

    labels::init();

    if config.namespaces.contains(Namespace::Mnt) {
        filesystem::initialize_mount_namespace(config)?;
    }
    Ok(())
}

fn setup_routes(routes: &[Route]) -> Result<()> {
    if routes.is_empty() {
        return Ok(());
    }
    // route programming lives in the external network driver
    Err(BerthError::NotImplemented {
        operation: "route programming",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::cgroup::CgroupSpec;
    use berth_core::config::Config;
    use berth_core::namespace::NamespaceSet;

    fn process_args(namespaces: NamespaceSet) -> ProcessArgs {
        ProcessArgs {
            args: vec!["/bin/true".into()],
            config: Config {
                rootfs: "/tmp/rootfs".into(),
                hostname: String::new(),
                env: vec![],
                namespaces,
                uid_mappings: vec![],
                gid_mappings: vec![],
                cgroups: CgroupSpec::new("t"),
                networks: vec![],
                routes: vec![],
                process_label: String::new(),
                apparmor_profile: String::new(),
                rlimits: vec![],
                capabilities: None,
                readonly_rootfs: false,
                mounts: vec![],
            },
            network_state: vec![],
        }
    }

    #[test]
    fn setup_rejects_networks_without_net_namespace() {
        let mut args = process_args(NamespaceSet::default());
        args.config.networks.push(berth_core::network::Network {
            net_type: "loopback".into(),
            ..Default::default()
        });

        let err = setup_in_namespace(&args).expect_err("mismatch expected");
        assert!(matches!(err, BerthError::ConfigMismatch { .. }));
    }

    #[test]
    fn setup_without_namespaces_is_a_noop() {
        setup_in_namespace(&process_args(NamespaceSet::default())).expect("nothing to do");
    }

    #[test]
    fn configured_routes_surface_as_unimplemented() {
        let err = setup_routes(&[Route {
            destination: "0.0.0.0/0".into(),
            source: String::new(),
            gateway: "10.0.0.1".into(),
            interface: "eth0".into(),
        }])
        .expect_err("route programming is external");
        assert!(matches!(err, BerthError::NotImplemented { .. }));
    }
}
