//! Deterministic, pure logic shared by the engine and the supervisor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod dependency;
pub mod rate_limit;
pub mod recovery;
pub mod stop_policy;
pub mod types;
