//! Microservice synthesis through a generate-execute-validate-repair loop.
//!
//! An untrusted code-generation oracle proposes a candidate service, the
//! sandbox runs it, the validator scores the run against a test scenario and
//! the controller feeds failures back until a candidate passes or the attempt
//! budget runs out. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (paths, scenario parsing,
//!   validation, prompt composition, retry and convergence policy). No I/O.
//! - **[`io`]**: Side-effecting collaborators (config, processes, sandbox,
//!   oracle backends, packaging, session logs) behind traits for testing.
//!
//! [`controller`] runs the loop; [`generate`] and [`run`] implement the CLI
//! commands on top of it.

pub mod cancel;
pub mod controller;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod generate;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
