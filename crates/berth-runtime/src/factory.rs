//! Container factory.
//!
//! Allocates a container's root directory and cgroup manager and assembles
//! the [`Container`] object in the destroyed state.

use std::path::PathBuf;

use berth_common::error::{BerthError, Result};
use berth_common::types::ContainerId;
use berth_core::cgroup::FsManager;
use berth_core::config::Config;

use crate::container::Container;

/// Creates containers under a base directory, re-invoking `init_args` as
/// each container's init helper.
pub struct Factory {
    base: PathBuf,
    init_args: Vec<String>,
}

impl Factory {
    /// Creates a factory rooted at `base`.
    ///
    /// `init_args` is typically the engine binary plus its init subcommand,
    /// e.g. `["/usr/bin/berth-init", "init"]`.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>, init_args: Vec<String>) -> Self {
        Self {
            base: base.into(),
            init_args,
        }
    }

    /// Allocates the root directory and cgroup hierarchy for a new
    /// container.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn create(&self, id: &ContainerId, config: Config) -> Result<Container> {
        let root = self.base.join(id.as_str());
        std::fs::create_dir_all(&root).map_err(|e| BerthError::io(root.clone(), e))?;
        let cgroup = Box::new(FsManager::new(config.cgroups.clone()));
        tracing::info!(id = %id, root = %root.display(), "container created");
        Ok(Container::new(
            id.clone(),
            root,
            config,
            cgroup,
            self.init_args.clone(),
        ))
    }
}
