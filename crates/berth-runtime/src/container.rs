//! Container object and lifecycle operations.
//!
//! A [`Container`] holds identity, configuration, runtime state, and the
//! cgroup manager, and exposes the lifecycle API: start, signal,
//! pause/resume, processes, stats, destroy, and OOM notification. The
//! init-start handshake lives in [`Container::start_init_process`].

use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use thiserror::Error;

use berth_common::constants::{ENV_INIT_PID, ENV_USERNS};
use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, FreezerState, Status};
use berth_core::cgroup::{self, CgroupManager, CgroupStats};
use berth_core::config::Config;
use berth_core::namespace::Namespace;
use berth_core::network::{self, NetworkState, NetworkStats};
use berth_core::system;

use crate::oom;
use crate::pipe::{ControlPipe, InitError, PidRecord, ProcessArgs};
use crate::process::{exit_status_code, spawn_reentrant, Launcher, Process};
use crate::state::{self, RuntimeState};

/// Composite statistics for a running container.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Cgroup accounting.
    pub cgroup: CgroupStats,
    /// Per-network counters, keyed off the stored network state order.
    pub networks: Vec<NetworkStats>,
}

/// Statistics collection failure carrying whatever was gathered before the
/// first failing probe.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct StatsError {
    /// Partial statistics collected so far.
    pub partial: Stats,
    /// The probe failure.
    #[source]
    pub source: BerthError,
}

/// A Linux container: an isolated process tree with resource control.
pub struct Container {
    id: ContainerId,
    root: PathBuf,
    config: Config,
    state: RuntimeState,
    cgroup: Box<dyn CgroupManager>,
    init_args: Vec<String>,
}

impl Container {
    /// Assembles a container from its factory-allocated parts.
    ///
    /// `init_args` is the argv used to re-invoke the engine binary as its
    /// own init helper.
    #[must_use]
    pub fn new(
        id: ContainerId,
        root: PathBuf,
        config: Config,
        cgroup: Box<dyn CgroupManager>,
        init_args: Vec<String>,
    ) -> Self {
        Self {
            id,
            root,
            config,
            state: RuntimeState::default(),
            cgroup,
            init_args,
        }
    }

    /// Returns the container id.
    #[must_use]
    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Returns the immutable configuration snapshot.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the container root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the current runtime state record.
    #[must_use]
    pub fn runtime_state(&self) -> &RuntimeState {
        &self.state
    }

    /// Probes the container's lifecycle status.
    ///
    /// Liveness is probed with signal 0; a recorded start time that no
    /// longer matches the live process means the pid was reused and the
    /// container reports [`Status::Destroyed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the liveness probe fails for a reason other
    /// than "no such process".
    pub fn status(&self) -> Result<Status> {
        if self.state.init_pid <= 0 {
            return Ok(Status::Destroyed);
        }
        let pid = Pid::from_raw(self.state.init_pid);
        match kill(pid, None) {
            Err(Errno::ESRCH) => Ok(Status::Destroyed),
            Err(e) => Err(BerthError::system("kill", e)),
            Ok(()) => match system::process_start_time(pid) {
                Ok(started) if started == self.state.init_start_time => {
                    if cgroup::freezer_target(&self.state.cgroup_paths)? == FreezerState::Frozen {
                        Ok(Status::Paused)
                    } else {
                        Ok(Status::Running)
                    }
                }
                // the pid was reused by an unrelated process, or it exited
                // between the probe and the /proc read
                _ => Ok(Status::Destroyed),
            },
        }
    }

    /// Returns the pids currently in the container's cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup manager cannot enumerate pids.
    pub fn processes(&self) -> Result<Vec<Pid>> {
        tracing::debug!(id = %self.id, "fetch container processes");
        self.cgroup.pids()
    }

    /// Collects cgroup and per-network statistics.
    ///
    /// The first failing probe aborts collection; the error carries
    /// whatever was gathered so far.
    ///
    /// # Errors
    ///
    /// Returns a [`StatsError`] wrapping the failed probe.
    pub fn stats(&self) -> std::result::Result<Stats, StatsError> {
        tracing::debug!(id = %self.id, "fetch container stats");
        let mut stats = Stats::default();
        match self.cgroup.stats() {
            Ok(cgroup_stats) => stats.cgroup = cgroup_stats,
            Err(source) => {
                return Err(StatsError {
                    partial: stats,
                    source,
                })
            }
        }
        let registry = network::registry();
        for net_state in &self.state.network_state {
            match registry
                .resolve(&net_state.net_type)
                .and_then(|strategy| strategy.stats(net_state))
            {
                Ok(net_stats) => stats.networks.push(net_stats),
                Err(source) => {
                    return Err(StatsError {
                        partial: stats,
                        source,
                    })
                }
            }
        }
        Ok(stats)
    }

    /// Starts a process in the container.
    ///
    /// With no live init this boots the container and returns the init pid;
    /// otherwise the process is injected into the running container and its
    /// fresh pid is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the bootstrap or injection handshake fails; the
    /// spawned child is killed and reaped before the error surfaces.
    pub fn start(&mut self, process: Process) -> Result<i32> {
        match self.status()? {
            Status::Destroyed => self.start_init_process(process),
            _ => self.start_new_process(process),
        }
    }

    /// Sets the cgroup freezer target to frozen, suspending all member
    /// processes. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the freezer cannot be written.
    pub fn pause(&self) -> Result<()> {
        self.cgroup.freeze(FreezerState::Frozen)
    }

    /// Sets the cgroup freezer target to thawed, resuming all member
    /// processes. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the freezer cannot be written.
    pub fn resume(&self) -> Result<()> {
        self.cgroup.freeze(FreezerState::Thawed)
    }

    /// Sends a signal to the container init.
    ///
    /// The recorded start time guards against pid reuse: a mismatch is
    /// reported as "no such process" rather than signalling a stranger.
    ///
    /// # Errors
    ///
    /// Returns an error if no live init exists or the kill fails.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        let pid = Pid::from_raw(self.state.init_pid);
        tracing::info!(id = %self.id, signal = %signal, pid = self.state.init_pid, "signalling container init");
        if self.state.init_pid <= 0 {
            return Err(BerthError::system("kill", Errno::ESRCH));
        }
        match system::process_start_time(pid) {
            Ok(started) if started == self.state.init_start_time => {
                kill(pid, signal).map_err(|e| BerthError::system("kill", e))
            }
            _ => Err(BerthError::system("kill", Errno::ESRCH)),
        }
    }

    /// Destroys a stopped container, removing its root directory and
    /// releasing cgroup resources.
    ///
    /// Does not kill anything; the caller is expected to have stopped the
    /// container first.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::ContainerNotStopped`] while an init is alive,
    /// or an I/O error if the root tree cannot be removed.
    pub fn destroy(&mut self) -> Result<()> {
        if self.status()? != Status::Destroyed {
            return Err(BerthError::ContainerNotStopped {
                id: self.id.to_string(),
            });
        }
        self.cgroup.destroy()?;
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BerthError::io(self.root.clone(), e)),
        }
        self.state = RuntimeState::default();
        tracing::info!(id = %self.id, "container destroyed");
        Ok(())
    }

    /// Returns a one-shot channel that fires when the kernel reports an OOM
    /// kill in the container's cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if no cgroup path is recorded or the event counter
    /// cannot be read.
    pub fn oom(&self) -> Result<Receiver<()>> {
        oom::notify_on_oom(&self.state.cgroup_paths)
    }

    /// Boots the container init: the multi-step bootstrap handshake.
    ///
    /// Ordering is load-bearing: the cgroup is applied before any record is
    /// sent so no descendant the child forks can escape it; network
    /// interfaces migrate once the pid is known but before in-namespace
    /// bring-up; the setup helper needs the target namespaces to exist but
    /// must still run with host credentials.
    fn start_init_process(&mut self, process: Process) -> Result<i32> {
        tracing::info!(id = %self.id, "starting container init process");
        let args = process.args.clone();
        let (mut pipe, pipe_child) = ControlPipe::new()?;
        let pid = Launcher::new(&self.config, &self.init_args).spawn(&process, pipe_child)?;

        let started = match system::process_start_time(pid) {
            Ok(started) => started,
            Err(e) => return self.terminate(pid, e),
        };

        // before any synchronization with the child, so that no children
        // it forks can escape the cgroup
        if let Err(e) = self.cgroup.apply(pid) {
            return self.terminate(pid, e);
        }

        match self.bootstrap(&mut pipe, pid, &args) {
            Ok(network_state) => {
                self.state.init_pid = pid.as_raw();
                self.state.init_start_time = started;
                self.state.network_state = network_state;
                self.state.cgroup_paths = self.cgroup.paths();
                self.update_state_file()?;
                tracing::info!(id = %self.id, pid = pid.as_raw(), "container running");
                Ok(pid.as_raw())
            }
            Err(e) => {
                let err = self.terminate(pid, e);
                if let Err(derr) = self.cgroup.destroy() {
                    tracing::warn!(id = %self.id, error = %derr, "cgroup teardown failed");
                }
                err
            }
        }
    }

    /// Steps of the handshake that run once the cgroup holds the init pid.
    fn bootstrap(
        &self,
        pipe: &mut ControlPipe,
        pid: Pid,
        args: &[String],
    ) -> Result<Vec<NetworkState>> {
        let mut network_state = Vec::new();
        self.initialize_networking(pid, &mut network_state)?;

        let process_args = ProcessArgs {
            args: args.to_vec(),
            config: self.config.clone(),
            network_state: network_state.clone(),
        };

        if self.config.namespaces.contains(Namespace::User) {
            self.execute_setup_helper(pid, &process_args)?;
        }

        pipe.send(&process_args)?;
        pipe.shutdown_write()?;

        // EOF means the child reached execve and close-on-exec shut the
        // pipe; a record means it failed beforehand
        match pipe.recv::<InitError>()? {
            Some(init_error) => Err(BerthError::InitFailed {
                message: init_error.message,
            }),
            None => Ok(network_state),
        }
    }

    /// Injects a process into the running container.
    fn start_new_process(&self, mut process: Process) -> Result<i32> {
        tracing::info!(id = %self.id, "injecting process into running container");
        let args = process.args.clone();
        let (mut pipe, pipe_child) = ControlPipe::new()?;

        let extra_env = [(ENV_INIT_PID, self.state.init_pid.to_string())];
        let mut child = spawn_reentrant(
            &self.init_args,
            &self.config,
            &extra_env,
            pipe_child,
            &mut process,
        )?;

        let status = child
            .wait()
            .map_err(|e| BerthError::io(self.init_args[0].clone(), e))?;
        if !status.success() {
            return Err(BerthError::ProcessExited {
                process: "exec-in helper",
                status: exit_status_code(status),
            });
        }

        let pid_record: PidRecord = pipe.recv()?.ok_or_else(|| BerthError::InitFailed {
            message: "control pipe closed before pid record".into(),
        })?;
        let new_pid = Pid::from_raw(pid_record.pid);

        let handshake = (|| -> Result<()> {
            cgroup::enter(&self.state.cgroup_paths, new_pid)?;
            pipe.send(&self.config)?;
            pipe.send(&ProcessArgs {
                args,
                config: self.config.clone(),
                network_state: Vec::new(),
            })?;
            Ok(())
        })();

        if let Err(e) = handshake {
            let _ = kill(new_pid, Signal::SIGKILL);
            let _ = waitpid(new_pid, None);
            return Err(e);
        }
        tracing::info!(id = %self.id, pid = new_pid.as_raw(), "process injected");
        Ok(pid_record.pid)
    }

    /// Creates the container's network stack on the host side and moves
    /// interfaces into the child's network namespace, in configured order.
    fn initialize_networking(&self, nspid: Pid, state: &mut Vec<NetworkState>) -> Result<()> {
        tracing::debug!(id = %self.id, "initializing container networking");
        self.config.ensure_can_network()?;
        let registry = network::registry();
        for net in &self.config.networks {
            registry.resolve(&net.net_type)?.create(net, nspid, state)?;
        }
        Ok(())
    }

    /// Runs the user-namespace setup helper against the freshly cloned
    /// init and awaits its successful exit.
    ///
    /// The helper joins the init's namespaces except the user namespace,
    /// staying host-root to perform mount and network-interior setup that
    /// a user-namespace root cannot.
    fn execute_setup_helper(&self, pid: Pid, process_args: &ProcessArgs) -> Result<()> {
        tracing::debug!(id = %self.id, pid = pid.as_raw(), "running user-namespace setup helper");
        let (mut pipe, pipe_child) = ControlPipe::new()?;

        let extra_env = [
            (ENV_INIT_PID, pid.as_raw().to_string()),
            (ENV_USERNS, "1".to_string()),
        ];
        let mut helper = spawn_reentrant(
            &self.init_args,
            &self.config,
            &extra_env,
            pipe_child,
            &mut Process::default(),
        )?;

        let handshake = (|| -> Result<()> {
            let _announced: PidRecord = pipe.recv()?.ok_or_else(|| BerthError::InitFailed {
                message: "control pipe closed before setup helper pid".into(),
            })?;
            pipe.send(process_args)?;
            pipe.shutdown_write()?;
            match pipe.recv::<InitError>()? {
                Some(init_error) => Err(BerthError::InitFailed {
                    message: init_error.message,
                }),
                None => Ok(()),
            }
        })();

        if let Err(e) = handshake {
            let _ = helper.kill();
            let _ = helper.wait();
            return Err(e);
        }

        let status = helper
            .wait()
            .map_err(|e| BerthError::io(self.init_args[0].clone(), e))?;
        if !status.success() {
            return Err(BerthError::ProcessExited {
                process: "setup helper",
                status: exit_status_code(status),
            });
        }
        Ok(())
    }

    /// Kills the child, reaps it, and propagates the original error.
    fn terminate<T>(&self, pid: Pid, err: BerthError) -> Result<T> {
        tracing::warn!(id = %self.id, pid = pid.as_raw(), error = %err, "terminating container init");
        if let Err(kerr) = kill(pid, Signal::SIGKILL) {
            if kerr != Errno::ESRCH {
                tracing::warn!(pid = pid.as_raw(), error = %kerr, "kill during teardown failed");
            }
        }
        self.wait_and_reap(pid);
        Err(err)
    }

    /// Waits for the init and, without a PID namespace, sweeps the cgroup
    /// for descendants that would otherwise outlive it.
    fn wait_and_reap(&self, pid: Pid) {
        if let Err(e) = waitpid(pid, None) {
            tracing::warn!(pid = pid.as_raw(), error = %e, "wait on container init failed");
        }
        if !self.config.namespaces.contains(Namespace::Pid) {
            if let Err(e) = self.kill_all_pids() {
                tracing::warn!(id = %self.id, error = %e, "cgroup sweep failed");
            }
        }
    }

    /// Kills every process remaining in the container's cgroup.
    ///
    /// Freeze and thaw are best-effort so a missing freezer degrades to a
    /// plain sweep; a pid that vanished between enumeration and kill is not
    /// fatal.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup pids cannot be enumerated.
    pub fn kill_all_pids(&self) -> Result<()> {
        tracing::info!(id = %self.id, "killing all processes in container cgroup");
        if let Err(e) = self.cgroup.freeze(FreezerState::Frozen) {
            tracing::warn!(error = %e, "freeze before sweep failed");
        }
        let pids = self.cgroup.pids()?;
        let mut killed = Vec::new();
        for pid in pids {
            match kill(pid, Signal::SIGKILL) {
                Ok(()) => killed.push(pid),
                Err(Errno::ESRCH) => {}
                Err(e) => {
                    tracing::warn!(pid = pid.as_raw(), error = %e, "kill failed, continuing");
                }
            }
        }
        if let Err(e) = self.cgroup.freeze(FreezerState::Thawed) {
            tracing::warn!(error = %e, "thaw after sweep failed");
        }
        for pid in killed {
            let _ = waitpid(pid, None);
        }
        Ok(())
    }

    /// Persists the committed runtime state into the container root.
    fn update_state_file(&self) -> Result<()> {
        state::save(&self.root, &self.state)
    }
}
