//! Iterative orchestrator for long-running, multi-step agent workflows.
//!
//! A workflow is a declarative tree of phases, steps and runnable nodes that
//! is re-rendered every iteration until it converges. The crate is split in
//! two layers:
//!
//! - **[`core`]**: Pure, deterministic logic (node identity, stop conditions,
//!   backoff, cleanup selection, repo-state diffing). No I/O.
//! - **[`io`]**: Side-effecting adapters (SQLite state store, version control,
//!   child processes, agent CLI backend, configuration).
//!
//! Orchestration modules ([`scheduler`], [`sequencer`], [`agent`],
//! [`transaction`]) coordinate core logic with I/O.

pub mod agent;
pub mod core;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod scheduler;
pub mod sequencer;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod transaction;
