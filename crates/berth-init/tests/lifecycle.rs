//! End-to-end container lifecycle tests.
//!
//! These drive the full bootstrap handshake: clone into namespaces, cgroup
//! attachment, control-pipe records, exec, injection, and teardown. They
//! require root and a writable cgroups v2 hierarchy and skip themselves
//! otherwise.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use berth_common::error::BerthError;
use berth_common::types::{ContainerId, Status};
use berth_core::cgroup::CgroupSpec;
use berth_core::config::Config;
use berth_core::namespace::{Namespace, NamespaceSet};
use berth_runtime::factory::Factory;
use berth_runtime::process::Process;
use berth_runtime::state;

const INIT_BIN: &str = env!("CARGO_BIN_EXE_berth-init");

fn e2e_supported() -> bool {
    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("skipping: requires root");
        return false;
    }
    let probe = Path::new("/sys/fs/cgroup/berth-e2e-probe");
    match std::fs::create_dir(probe) {
        Ok(()) => {
            let _ = std::fs::remove_dir(probe);
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = std::fs::remove_dir(probe);
            true
        }
        Err(e) => {
            eprintln!("skipping: cgroup hierarchy not writable: {e}");
            false
        }
    }
}

fn test_config(cgroup_name: &str, namespaces: NamespaceSet, rootfs: &Path) -> Config {
    Config {
        rootfs: rootfs.to_path_buf(),
        hostname: String::new(),
        env: vec!["PATH=/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".into()],
        namespaces,
        uid_mappings: vec![],
        gid_mappings: vec![],
        cgroups: CgroupSpec::new(cgroup_name),
        networks: vec![],
        routes: vec![],
        process_label: String::new(),
        apparmor_profile: String::new(),
        rlimits: vec![],
        capabilities: None,
        readonly_rootfs: false,
        mounts: vec![],
    }
}

fn init_args() -> Vec<String> {
    vec![INIT_BIN.to_string(), "init".to_string()]
}

// ── Happy-path start ─────────────────────────────────────────────────

#[test]
fn start_commits_state_and_tracks_exit() {
    if !e2e_supported() {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = Factory::new(dir.path(), init_args());
    let config = test_config(
        "berth-e2e-start",
        NamespaceSet::new([Namespace::Pid, Namespace::Ipc, Namespace::Uts]),
        dir.path(),
    );
    let mut container = factory
        .create(&ContainerId::new("e2e-start"), config)
        .expect("create container");

    let pid = container
        .start(Process::new(["/bin/sleep", "30"]))
        .expect("start container");
    assert!(pid > 0);
    assert_eq!(container.status().expect("status"), Status::Running);

    let persisted = state::load(container.root()).expect("state file present");
    assert_eq!(persisted.init_pid, pid);
    assert!(persisted.init_start_time > 0);

    container.signal(Signal::SIGKILL).expect("signal init");
    waitpid(Pid::from_raw(pid), None).expect("reap init");
    assert_eq!(container.status().expect("status"), Status::Destroyed);

    container.destroy().expect("destroy stopped container");
    assert!(!container.root().exists());
}

// ── Handshake failure ────────────────────────────────────────────────

#[test]
fn failed_exec_surfaces_as_init_error() {
    if !e2e_supported() {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = Factory::new(dir.path(), init_args());
    let config = test_config(
        "berth-e2e-initerr",
        NamespaceSet::new([Namespace::Pid, Namespace::Ipc, Namespace::Uts]),
        dir.path(),
    );
    let mut container = factory
        .create(&ContainerId::new("e2e-initerr"), config)
        .expect("create container");

    let err = container
        .start(Process::new(["/nonexistent-berth-program"]))
        .expect_err("start must fail");
    match err {
        BerthError::InitFailed { message } => {
            assert!(
                message.contains("/nonexistent-berth-program"),
                "message should name the failed path: {message}"
            );
        }
        other => panic!("expected InitFailed, got {other}"),
    }

    assert_eq!(container.status().expect("status"), Status::Destroyed);
    assert!(
        state::load(container.root()).is_err(),
        "no state may be persisted for a failed start"
    );
    assert!(
        !Path::new("/sys/fs/cgroup/berth/berth-e2e-initerr").exists(),
        "cgroup must be torn down after a failed start"
    );
}

// ── Pause / resume ───────────────────────────────────────────────────

#[test]
fn pause_and_resume_toggle_status() {
    if !e2e_supported() {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = Factory::new(dir.path(), init_args());
    let config = test_config(
        "berth-e2e-freeze",
        NamespaceSet::new([Namespace::Pid, Namespace::Ipc, Namespace::Uts]),
        dir.path(),
    );
    let mut container = factory
        .create(&ContainerId::new("e2e-freeze"), config)
        .expect("create container");

    let pid = container
        .start(Process::new(["/bin/sleep", "30"]))
        .expect("start container");

    container.pause().expect("pause");
    assert_eq!(container.status().expect("status"), Status::Paused);
    nix::sys::signal::kill(Pid::from_raw(pid), None).expect("frozen init is still alive");
    container.pause().expect("pause is idempotent");

    container.resume().expect("resume");
    assert_eq!(container.status().expect("status"), Status::Running);
    container.resume().expect("resume is idempotent");

    container.signal(Signal::SIGKILL).expect("signal init");
    waitpid(Pid::from_raw(pid), None).expect("reap init");
    container.destroy().expect("destroy");
}

// ── Exec-in ──────────────────────────────────────────────────────────

#[test]
fn exec_in_runs_in_live_container() {
    if !e2e_supported() {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = Factory::new(dir.path(), init_args());
    let config = test_config(
        "berth-e2e-execin",
        NamespaceSet::new([Namespace::Pid, Namespace::Ipc, Namespace::Uts]),
        dir.path(),
    );
    let mut container = factory
        .create(&ContainerId::new("e2e-execin"), config)
        .expect("create container");

    let init_pid = container
        .start(Process::new(["/bin/sleep", "30"]))
        .expect("start container");

    let (read_fd, write_fd) = nix::unistd::pipe().expect("stdout pipe");
    let mut request = Process::new(["/bin/echo", "hi"]);
    request.stdout = Some(write_fd);

    let injected = container.start(request).expect("exec-in");
    assert!(injected > 0);
    assert_ne!(injected, init_pid);

    let mut output = String::new();
    std::fs::File::from(read_fd)
        .read_to_string(&mut output)
        .expect("read injected stdout");
    assert_eq!(output, "hi\n");

    container.signal(Signal::SIGKILL).expect("signal init");
    waitpid(Pid::from_raw(init_pid), None).expect("reap init");
    container.destroy().expect("destroy");
}

// ── Kill-all without a PID namespace ─────────────────────────────────

#[test]
fn cgroup_sweep_reaps_descendants_without_pid_namespace() {
    if !e2e_supported() {
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let factory = Factory::new(dir.path(), init_args());
    let config = test_config(
        "berth-e2e-sweep",
        NamespaceSet::new([Namespace::Ipc, Namespace::Uts]),
        dir.path(),
    );
    let mut container = factory
        .create(&ContainerId::new("e2e-sweep"), config)
        .expect("create container");

    let pid = container
        .start(Process::new([
            "/bin/sh",
            "-c",
            "sleep 30 & sleep 30 & exit 0",
        ]))
        .expect("start container");
    waitpid(Pid::from_raw(pid), None).expect("reap init");

    container.kill_all_pids().expect("sweep cgroup");

    // killed descendants leave the cgroup once init(1) reaps them
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = container.processes().expect("enumerate cgroup");
        if remaining.is_empty() {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "descendants still in cgroup: {remaining:?}"
        );
        std::thread::sleep(Duration::from_millis(50));
    }

    container.destroy().expect("destroy");
}
