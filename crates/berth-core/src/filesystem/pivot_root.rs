//! Root filesystem switching via `pivot_root(2)`.
//!
//! Changes the actual root mount point rather than just the process's view
//! of `/`, so the old root cannot be re-entered.

use std::path::Path;

use berth_common::error::{BerthError, Result};

const PUT_OLD: &str = ".old_root";

/// Switches the root filesystem to `new_root`.
///
/// The caller must have bind-mounted `new_root` onto itself beforehand.
/// After the pivot the old root is lazily unmounted and its mount point
/// removed, leaving no path back to the host filesystem.
///
/// # Errors
///
/// Returns an error if the pivot or the old-root cleanup fails.
pub fn pivot_root(new_root: &Path) -> Result<()> {
    let put_old = new_root.join(PUT_OLD);
    std::fs::create_dir_all(&put_old).map_err(|e| BerthError::io(put_old.clone(), e))?;

    nix::unistd::pivot_root(new_root, &put_old)
        .map_err(|e| BerthError::system("pivot_root", e))?;

    std::env::set_current_dir("/").map_err(|e| BerthError::io("/", e))?;

    let old_root = Path::new("/").join(PUT_OLD);
    nix::mount::umount2(&old_root, nix::mount::MntFlags::MNT_DETACH)
        .map_err(|e| BerthError::system("umount2(old root)", e))?;
    let _ = std::fs::remove_dir(&old_root);

    tracing::debug!(root = %new_root.display(), "pivot_root complete");
    Ok(())
}
