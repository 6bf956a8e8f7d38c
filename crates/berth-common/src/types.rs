//! Domain primitive types used across the berth workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::EXIT_SIGNAL_OFFSET;

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observable lifecycle status of a container.
///
/// Exactly one of these holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// No live init process; the container may be started or destroyed.
    Destroyed,
    /// The init process is alive and not frozen.
    Running,
    /// The init process is alive and the cgroup freezer target is frozen.
    Paused,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Destroyed => write!(f, "destroyed"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Target state of the cgroup freezer controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreezerState {
    /// All member processes are suspended.
    Frozen,
    /// Member processes run normally.
    Thawed,
}

/// Synthesizes an exit code from the signal that terminated a child,
/// following the conventional `128 + signal` mapping.
#[must_use]
pub fn signal_exit_code(signal: i32) -> i32 {
    EXIT_SIGNAL_OFFSET + signal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_generate_unique() {
        let id1 = ContainerId::generate();
        let id2 = ContainerId::generate();
        assert_ne!(id1, id2, "generated IDs should be unique");
        assert!(!id1.as_str().is_empty());
    }

    #[test]
    fn status_display() {
        assert_eq!(format!("{}", Status::Destroyed), "destroyed");
        assert_eq!(format!("{}", Status::Running), "running");
        assert_eq!(format!("{}", Status::Paused), "paused");
    }

    #[test]
    fn freezer_state_serializes_lowercase() {
        let json = serde_json::to_string(&FreezerState::Frozen).expect("serialize");
        assert_eq!(json, "\"frozen\"");
    }

    #[test]
    fn signalled_child_exit_code_follows_convention() {
        assert_eq!(signal_exit_code(9), 137);
        assert_eq!(signal_exit_code(15), 143);
    }
}
