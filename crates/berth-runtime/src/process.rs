//! Process launching for container bootstrap.
//!
//! [`Launcher`] clones the init helper binary into the configured namespace
//! set; [`spawn_reentrant`] re-invokes the same binary without new
//! namespaces for exec-in and the user-namespace setup helper. In both
//! cases the child half of the control pipe is the only inherited extra
//! descriptor, re-installed at [`INIT_PIPE_FD`].

use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};

use nix::errno::Errno;
use nix::sched::clone;
use nix::sys::prctl;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{self, Pid};

use berth_common::constants::{ENV_INIT_PIPE, INIT_PIPE_FD};
use berth_common::error::{BerthError, Result};
use berth_common::types::signal_exit_code;
use berth_core::config::{Config, IdMap};
use berth_core::namespace::Namespace;

use crate::pipe::InitError;

const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// A program invocation requested by the caller, with the standard streams
/// the spawned process should use. `None` streams are inherited.
#[derive(Debug, Default)]
pub struct Process {
    /// Argument vector to exec inside the container.
    pub args: Vec<String>,
    /// Standard input for the spawned process.
    pub stdin: Option<OwnedFd>,
    /// Standard output for the spawned process.
    pub stdout: Option<OwnedFd>,
    /// Standard error for the spawned process.
    pub stderr: Option<OwnedFd>,
}

impl Process {
    /// Creates a process description inheriting all standard streams.
    #[must_use]
    pub fn new(args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }
}

/// Configures and clones the init helper into fresh namespaces.
pub struct Launcher<'a> {
    config: &'a Config,
    init_args: &'a [String],
}

impl<'a> Launcher<'a> {
    /// Creates a launcher for the given configuration and init argv.
    #[must_use]
    pub fn new(config: &'a Config, init_args: &'a [String]) -> Self {
        Self { config, init_args }
    }

    /// Clones the init helper with the configured namespace flags.
    ///
    /// The child installs `SIGKILL` as its parent-death signal, wires the
    /// requested standard streams, re-installs the control pipe at
    /// [`INIT_PIPE_FD`], and execs `init_args` from the container rootfs.
    /// When a user namespace is requested, the uid/gid mapping tables are
    /// written before this function returns; the in-namespace credential
    /// switch happens in the init after its first read, which the mapping
    /// write therefore always precedes.
    ///
    /// # Errors
    ///
    /// Returns an error if argument preparation, the clone itself, or the
    /// id-mapping writes fail. A child cloned before a failure is killed
    /// and reaped.
    pub fn spawn(&self, process: &Process, pipe_child: OwnedFd) -> Result<Pid> {
        let exe = cstring(&self.init_args[0])?;
        let argv: Vec<CString> = self
            .init_args
            .iter()
            .map(|arg| cstring(arg))
            .collect::<Result<_>>()?;
        let mut envp: Vec<CString> = self
            .config
            .env
            .iter()
            .map(|entry| cstring(entry))
            .collect::<Result<_>>()?;
        envp.push(cstring(&format!("{ENV_INIT_PIPE}={INIT_PIPE_FD}"))?);
        let cwd = cstring(&self.config.rootfs.to_string_lossy())?;

        let pipe_fd = pipe_child.as_raw_fd();
        let stdin = process.stdin.as_ref().map(AsRawFd::as_raw_fd);
        let stdout = process.stdout.as_ref().map(AsRawFd::as_raw_fd);
        let stderr = process.stderr.as_ref().map(AsRawFd::as_raw_fd);

        let flags = self.config.namespaces.clone_flags();
        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let cb = Box::new(|| {
            child_entry(
                &exe, &argv, &envp, &cwd, pipe_fd, stdin, stdout, stderr,
            )
        });

        // SAFETY: the callback runs in a fresh child and ends in execve or
        // _exit-equivalent return; it does not unwind into the parent.
        let pid = unsafe { clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) }
            .map_err(|e| BerthError::system("clone", e))?;
        tracing::info!(pid = pid.as_raw(), ?flags, "container init cloned");

        if self.config.namespaces.contains(Namespace::User) {
            if let Err(e) =
                write_id_mappings(pid, &self.config.uid_mappings, &self.config.gid_mappings)
            {
                let _ = kill(pid, Signal::SIGKILL);
                let _ = waitpid(pid, None);
                return Err(e);
            }
        }
        Ok(pid)
    }
}

fn cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| BerthError::ConfigMismatch {
        message: format!("embedded NUL in argument or environment: {value:?}"),
    })
}

#[allow(clippy::too_many_arguments)]
fn child_entry(
    exe: &CString,
    argv: &[CString],
    envp: &[CString],
    cwd: &CString,
    pipe_fd: RawFd,
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    stderr: Option<RawFd>,
) -> isize {
    let result = (|| -> Result<()> {
        prctl::set_pdeathsig(Signal::SIGKILL)
            .map_err(|e| BerthError::system("prctl(PR_SET_PDEATHSIG)", e))?;

        for (fd, target) in [(stdin, 0), (stdout, 1), (stderr, 2)] {
            if let Some(fd) = fd {
                unistd::dup2(fd, target).map_err(|e| BerthError::system("dup2", e))?;
            }
        }
        install_pipe_fd(pipe_fd)?;

        // SAFETY: cwd is a valid NUL-terminated path for the chdir call.
        if unsafe { libc::chdir(cwd.as_ptr()) } != 0 {
            return Err(BerthError::system("chdir", Errno::last()));
        }

        unistd::execve(exe, argv, envp).map_err(|e| BerthError::system("execve", e))?;
        Ok(())
    })();

    if let Err(err) = result {
        // pipe_fd stays valid whether or not it was moved to INIT_PIPE_FD
        report_exec_failure(pipe_fd, &err);
        return 1;
    }
    0
}

/// Moves the control-pipe descriptor to [`INIT_PIPE_FD`], clearing
/// close-on-exec in the process.
fn install_pipe_fd(pipe_fd: RawFd) -> Result<()> {
    if pipe_fd == INIT_PIPE_FD {
        // dup2 onto itself would keep the close-on-exec flag
        // SAFETY: clearing FD_CLOEXEC on a descriptor we own.
        if unsafe { libc::fcntl(pipe_fd, libc::F_SETFD, 0) } != 0 {
            return Err(BerthError::system("fcntl(F_SETFD)", Errno::last()));
        }
    } else {
        unistd::dup2(pipe_fd, INIT_PIPE_FD).map_err(|e| BerthError::system("dup2", e))?;
    }
    Ok(())
}

/// Last-resort error report from a child that could not reach `execve`.
fn report_exec_failure(fd: RawFd, err: &BerthError) {
    let record = InitError {
        message: err.to_string(),
    };
    if let Ok(mut line) = serde_json::to_vec(&record) {
        line.push(b'\n');
        // SAFETY: fd is the inherited control-pipe descriptor, live for the
        // remainder of the child's life.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let _ = unistd::write(borrowed, &line);
    }
}

/// Writes the user-namespace id mapping tables for a freshly cloned child.
///
/// `setgroups` is denied before the gid map, as the kernel requires for
/// unprivileged namespaces.
pub(crate) fn write_id_mappings(pid: Pid, uid_maps: &[IdMap], gid_maps: &[IdMap]) -> Result<()> {
    let base = format!("/proc/{pid}");

    if !gid_maps.is_empty() {
        let setgroups = format!("{base}/setgroups");
        if std::path::Path::new(&setgroups).exists() {
            std::fs::write(&setgroups, "deny").map_err(|e| BerthError::io(setgroups, e))?;
        }
    }
    if !uid_maps.is_empty() {
        let path = format!("{base}/uid_map");
        std::fs::write(&path, format_id_maps(uid_maps)).map_err(|e| BerthError::io(path, e))?;
    }
    if !gid_maps.is_empty() {
        let path = format!("{base}/gid_map");
        std::fs::write(&path, format_id_maps(gid_maps)).map_err(|e| BerthError::io(path, e))?;
    }
    tracing::debug!(pid = pid.as_raw(), "uid/gid mappings written");
    Ok(())
}

fn format_id_maps(maps: &[IdMap]) -> String {
    maps.iter()
        .map(|m| format!("{} {} {}\n", m.container_id, m.host_id, m.size))
        .collect()
}

/// Re-invokes the init helper binary without new namespaces, handing it the
/// child half of the control pipe at [`INIT_PIPE_FD`].
///
/// Used for exec-in and the user-namespace setup helper; the extra
/// environment carries the `_BERTH_*` contract variables.
pub(crate) fn spawn_reentrant(
    init_args: &[String],
    config: &Config,
    extra_env: &[(&str, String)],
    pipe_child: OwnedFd,
    process: &mut Process,
) -> Result<Child> {
    let mut cmd = Command::new(&init_args[0]);
    cmd.args(&init_args[1..]);
    cmd.env_clear();
    for entry in &config.env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    for (key, value) in extra_env {
        cmd.env(key, value);
    }
    cmd.env(ENV_INIT_PIPE, INIT_PIPE_FD.to_string());
    cmd.current_dir(&config.rootfs);

    if let Some(fd) = process.stdin.take() {
        cmd.stdin(Stdio::from(fd));
    }
    if let Some(fd) = process.stdout.take() {
        cmd.stdout(Stdio::from(fd));
    }
    if let Some(fd) = process.stderr.take() {
        cmd.stderr(Stdio::from(fd));
    }

    let raw = pipe_child.as_raw_fd();
    // SAFETY: the hook only calls async-signal-safe syscalls.
    unsafe {
        cmd.pre_exec(move || {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if raw == INIT_PIPE_FD {
                if libc::fcntl(raw, libc::F_SETFD, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(raw, INIT_PIPE_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .map_err(|e| BerthError::io(init_args[0].clone(), e))?;
    drop(pipe_child);
    Ok(child)
}

/// Maps an exit status onto the conventional exit code, synthesizing
/// `128 + signal` for signalled children.
pub(crate) fn exit_status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(signal_exit_code))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_maps_format_one_triple_per_line() {
        let maps = [
            IdMap {
                container_id: 0,
                host_id: 100_000,
                size: 65_536,
            },
            IdMap {
                container_id: 65_536,
                host_id: 1000,
                size: 1,
            },
        ];
        assert_eq!(format_id_maps(&maps), "0 100000 65536\n65536 1000 1\n");
    }

    #[test]
    fn embedded_nul_is_rejected() {
        assert!(cstring("ok").is_ok());
        assert!(cstring("bad\0arg").is_err());
    }

    #[test]
    fn exit_code_of_signalled_child_is_synthesized() {
        let status = ExitStatus::from_raw(9); // killed by SIGKILL
        assert_eq!(exit_status_code(status), 137);
    }

    #[test]
    fn exit_code_of_exited_child_is_preserved() {
        let status = ExitStatus::from_raw(3 << 8); // exited with 3
        assert_eq!(exit_status_code(status), 3);
    }
}
