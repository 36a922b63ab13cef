//! Side-effecting collaborators of the repair loop.

pub mod config;
pub mod oracle;
pub mod packager;
pub mod process;
pub mod sandbox;
pub mod session_log;
