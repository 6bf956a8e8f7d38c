//! # berth-common
//!
//! Shared error types, domain primitives, and constants for the berth
//! container engine workspace.

pub mod constants;
pub mod error;
pub mod types;
