//! Deterministic, pure logic of the repair loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod artifact_path;
pub mod backoff;
pub mod convergence;
pub mod prompt;
pub mod scenario;
pub mod types;
pub mod validator;
