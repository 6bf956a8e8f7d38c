//! Mount-namespace initialization.
//!
//! Runs inside the container's freshly created mount namespace, before the
//! final `execve`: privatizes mount propagation, stages the root filesystem,
//! applies configured bind mounts, and pivots into the new root.

pub mod pivot_root;

use std::path::Path;

use nix::mount::{mount, MsFlags};

use berth_common::error::{BerthError, Result};

use crate::config::{Config, Mount};

/// Prepares the mount namespace and switches into the container rootfs.
///
/// Must only be called inside a new mount namespace; the propagation change
/// would otherwise leak to the host.
///
/// # Errors
///
/// Returns an error if any mount, bind, or pivot operation fails.
pub fn initialize_mount_namespace(config: &Config) -> Result<()> {
    // keep container mounts from propagating back to the host
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| BerthError::system("mount(/, MS_PRIVATE)", e))?;

    // pivot_root requires the new root to be a mount point
    mount(
        Some(&config.rootfs),
        &config.rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| BerthError::system("mount(rootfs, MS_BIND)", e))?;

    mount_proc(&config.rootfs)?;

    for m in &config.mounts {
        bind_mount(&config.rootfs, m)?;
    }

    pivot_root::pivot_root(&config.rootfs)?;

    if config.readonly_rootfs {
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| BerthError::system("mount(/, MS_RDONLY)", e))?;
    }

    tracing::debug!(rootfs = %config.rootfs.display(), "mount namespace initialized");
    Ok(())
}

fn mount_proc(rootfs: &Path) -> Result<()> {
    let target = rootfs.join("proc");
    std::fs::create_dir_all(&target).map_err(|e| BerthError::io(target.clone(), e))?;
    mount(
        Some("proc"),
        &target,
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| BerthError::system("mount(proc)", e))
}

fn bind_mount(rootfs: &Path, m: &Mount) -> Result<()> {
    let relative = m.destination.strip_prefix("/").unwrap_or(&m.destination);
    let target = rootfs.join(relative);
    std::fs::create_dir_all(&target).map_err(|e| BerthError::io(target.clone(), e))?;

    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REC;
    if !m.writable {
        flags |= MsFlags::MS_RDONLY;
    }
    mount(Some(&m.source), &target, None::<&str>, flags, None::<&str>)
        .map_err(|e| BerthError::system("mount(MS_BIND)", e))?;

    // a read-only bind needs a remount for the flag to take effect
    if !m.writable {
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| BerthError::system("mount(MS_REMOUNT)", e))?;
    }
    Ok(())
}
