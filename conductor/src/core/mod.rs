//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod cleanup;
pub mod frame_storm;
pub mod identity;
pub mod loops;
pub mod plan;
pub mod repo_diff;
pub mod stop;
pub mod types;
