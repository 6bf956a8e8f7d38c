//! # berth-init — container init re-entry binary
//!
//! Re-invoked by the engine as a container's own init helper. The
//! environment contract selects the role: `_BERTH_USERNS=1` runs the
//! user-namespace setup helper, `_BERTH_INITPID` alone re-enters a live
//! container for exec-in, and neither runs the fresh-container init. In
//! every role the child half of the control pipe arrives as an inherited
//! descriptor.

#![allow(unsafe_code)]

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nix::unistd::Pid;

use berth_common::constants::{ENV_INIT_PID, ENV_INIT_PIPE, ENV_USERNS, INIT_PIPE_FD};
use berth_runtime::pipe::ChildPipe;
use berth_runtime::{init, setup};

#[derive(Parser)]
#[command(name = "berth-init", about = "Container init re-entry helper")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the in-namespace bootstrap and exec the container process.
    Init,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Init => run(),
    }
}

fn run() -> anyhow::Result<()> {
    let pipe = inherited_pipe().context("open inherited control pipe")?;
    let init_pid = std::env::var(ENV_INIT_PID)
        .ok()
        .and_then(|value| value.parse::<i32>().ok());

    match (std::env::var(ENV_USERNS).is_ok(), init_pid) {
        (true, Some(pid)) => setup::setup_main(pipe, Pid::from_raw(pid))?,
        (true, None) => bail!("{ENV_USERNS} set without {ENV_INIT_PID}"),
        (false, Some(pid)) => init::init_setns_main(pipe, Pid::from_raw(pid))?,
        (false, None) => init::init_main(pipe)?,
    }
    Ok(())
}

fn inherited_pipe() -> anyhow::Result<ChildPipe> {
    let fd: RawFd = std::env::var(ENV_INIT_PIPE)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(INIT_PIPE_FD);
    // SAFETY: the supervisor installed the control pipe at this descriptor
    // before exec; nothing else in this process owns it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(ChildPipe::from_fd(owned)?)
}
