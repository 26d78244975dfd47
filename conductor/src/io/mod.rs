//! I/O adapters used by the orchestrator.

pub mod agent_backend;
pub mod config;
pub mod process;
pub mod repo_state;
pub mod store;
pub mod vcs;
