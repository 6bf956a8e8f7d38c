//! Child-side init routines.
//!
//! This code runs in re-invoked binaries, between clone/`setns` and the
//! final `execve`: it reads the configuration records from the inherited
//! control pipe, finalizes the process environment, and execs the requested
//! program. Any pre-exec failure is reported back to the supervisor as an
//! `InitError` record.

use std::convert::Infallible;
use std::ffi::CString;

use nix::errno::Errno;
use nix::unistd::{self, ForkResult, Gid, Pid, Uid};

use berth_common::error::{BerthError, Result};
use berth_core::capability;
use berth_core::config::{Config, Rlimit};
use berth_core::labels;
use berth_core::namespace::{self, Namespace};

use crate::pipe::{ChildPipe, PidRecord, ProcessArgs};
use crate::setup;

/// Runs the init of a freshly cloned container.
///
/// Reads the `ProcessArgs` record, waits for the supervisor's half-close,
/// finalizes the namespace interior, and execs the requested program. Never
/// returns on success.
///
/// # Errors
///
/// Any pre-exec failure is reported over the pipe and returned.
pub fn init_main(mut pipe: ChildPipe) -> Result<()> {
    let err = match bootstrap(&mut pipe) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    pipe.report_error(&err);
    Err(err)
}

fn bootstrap(pipe: &mut ChildPipe) -> Result<Infallible> {
    let process: ProcessArgs = pipe.recv()?.ok_or_else(|| BerthError::InitFailed {
        message: "control pipe closed before process args".into(),
    })?;
    // EOF confirms the supervisor finished sending configuration
    if pipe.recv::<serde_json::Value>()?.is_some() {
        return Err(BerthError::InitFailed {
            message: "unexpected record after process args".into(),
        });
    }
    let config = &process.config;

    if config.namespaces.contains(Namespace::User) {
        // default credential: root inside the user namespace. The id maps
        // were written before the supervisor sent any record, so the
        // switch cannot race them.
        unistd::setgid(Gid::from_raw(0)).map_err(|e| BerthError::system("setgid", e))?;
        unistd::setuid(Uid::from_raw(0)).map_err(|e| BerthError::system("setuid", e))?;
    } else {
        // without a user namespace there is no setup helper; mount and
        // network-interior setup happen here
        setup::setup_in_namespace(&process)?;
    }

    if config.namespaces.contains(Namespace::Uts) && !config.hostname.is_empty() {
        unistd::sethostname(&config.hostname)
            .map_err(|e| BerthError::system("sethostname", e))?;
    }

    apply_rlimits(&config.rlimits)?;
    finalize(config)?;
    exec(&process.args, &config.env)
}

/// Re-enters a running container and injects a new process.
///
/// Joins the init's namespaces, then forks: the intermediate announces the
/// grandchild's pid over the pipe and exits, while the grandchild reads the
/// `Config` and `ProcessArgs` records, finalizes, and execs.
///
/// # Errors
///
/// Returns an error if namespace entry or the handshake fails; grandchild
/// failures are reported over the pipe before it exits.
pub fn init_setns_main(mut pipe: ChildPipe, init_pid: Pid) -> Result<()> {
    join_namespaces(init_pid, |_| true)?;

    // pid-namespace membership only applies to children, hence the fork
    // SAFETY: the process is single-threaded at this point.
    match unsafe { unistd::fork() }.map_err(|e| BerthError::system("fork", e))? {
        ForkResult::Parent { child } => {
            pipe.send(&PidRecord {
                pid: child.as_raw(),
            })?;
            Ok(())
        }
        ForkResult::Child => {
            let err = match exec_in(&mut pipe) {
                Ok(never) => match never {},
                Err(e) => e,
            };
            pipe.report_error(&err);
            std::process::exit(1);
        }
    }
}

fn exec_in(pipe: &mut ChildPipe) -> Result<Infallible> {
    let config: Config = pipe.recv()?.ok_or_else(|| BerthError::InitFailed {
        message: "control pipe closed before configuration".into(),
    })?;
    let process: ProcessArgs = pipe.recv()?.ok_or_else(|| BerthError::InitFailed {
        message: "control pipe closed before process args".into(),
    })?;

    apply_rlimits(&config.rlimits)?;
    finalize(&config)?;
    exec(&process.args, &config.env)
}

/// Joins the namespaces of a live process for which `filter` returns true.
///
/// A namespace the caller already occupies reports `EINVAL` and is
/// skipped, as is a kind the kernel does not expose for the target.
pub(crate) fn join_namespaces(pid: Pid, filter: impl Fn(Namespace) -> bool) -> Result<()> {
    for ns in Namespace::ALL {
        if !filter(ns) {
            continue;
        }
        match namespace::join(pid, ns) {
            Ok(()) => {}
            Err(BerthError::System {
                source: Errno::EINVAL,
                ..
            }) => {}
            Err(BerthError::Io { ref source, .. })
                if source.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn apply_rlimits(rlimits: &[Rlimit]) -> Result<()> {
    for rlimit in rlimits {
        nix::sys::resource::setrlimit(rlimit.kind.resource(), rlimit.soft, rlimit.hard)
            .map_err(|e| BerthError::system("setrlimit", e))?;
    }
    Ok(())
}

/// Last steps before `execve`: capability drop and process labeling.
fn finalize(config: &Config) -> Result<()> {
    if let Some(capabilities) = &config.capabilities {
        capability::drop_bounding_capabilities(capabilities)?;
    }
    labels::apply_apparmor_profile(&config.apparmor_profile)?;
    labels::set_process_label(&config.process_label)?;
    Ok(())
}

fn exec(args: &[String], env: &[String]) -> Result<Infallible> {
    let program = args.first().ok_or_else(|| BerthError::InitFailed {
        message: "empty argument vector".into(),
    })?;
    let program_c = to_cstring(program)?;
    let argv: Vec<CString> = args.iter().map(|a| to_cstring(a)).collect::<Result<_>>()?;
    let envp: Vec<CString> = env.iter().map(|e| to_cstring(e)).collect::<Result<_>>()?;
    unistd::execvpe(&program_c, &argv, &envp).map_err(|e| BerthError::InitFailed {
        message: format!("exec {program}: {e}"),
    })
}

fn to_cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| BerthError::ConfigMismatch {
        message: format!("embedded NUL in argument or environment: {value:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_argv_is_rejected_before_exec() {
        let err = exec(&[], &[]).expect_err("empty argv");
        assert!(matches!(err, BerthError::InitFailed { .. }));
    }

    #[test]
    fn joining_own_namespaces_is_tolerated() {
        if !unistd::Uid::effective().is_root() {
            eprintln!("skipping: setns requires CAP_SYS_ADMIN");
            return;
        }
        // joining our own namespaces is either a no-op or EINVAL; both must
        // be accepted so shared-namespace containers can be re-entered
        join_namespaces(unistd::getpid(), |_| true).expect("self-join tolerated");
    }

    #[test]
    fn rlimit_application_round_trips() {
        use berth_core::config::RlimitKind;
        let (soft, hard) =
            nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE)
                .expect("getrlimit");
        apply_rlimits(&[Rlimit {
            kind: RlimitKind::Nofile,
            soft,
            hard,
        }])
        .expect("reapplying current limits succeeds");
    }
}
