//! # berth-runtime
//!
//! Container lifecycle engine: bootstrap handshake, container object,
//! state persistence, and the child-side init routines.
//!
//! The supervisor clones an init into the configured namespaces, applies
//! the cgroup before any synchronization, wires networking and id
//! mappings, and exchanges structured records with the child over the
//! control pipe until the final `execve`.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod factory;
pub mod init;
pub mod oom;
pub mod pipe;
pub mod process;
pub mod setup;
pub mod state;
