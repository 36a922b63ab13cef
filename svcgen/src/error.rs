//! Error taxonomy of the synthesis loop.
//!
//! Only failures that change control flow get a typed variant here. Glue code
//! (config, session log, CLI) uses `anyhow` with context strings instead.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::artifact_path::PathRejection;
use crate::core::types::{Diagnostic, Session};

/// Invalid artifact contents. Raised while building an [`ArtifactSet`].
///
/// [`ArtifactSet`]: crate::core::types::ArtifactSet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
    #[error("artifact set is empty")]
    Empty,
    #[error("invalid artifact path {path:?}: {reason}")]
    InvalidPath { path: String, reason: PathRejection },
    #[error("duplicate artifact path {0:?}")]
    DuplicatePath(String),
    #[error("artifact path {file:?} is a file but {nested:?} needs it as a directory")]
    FileDirectoryClash { file: String, nested: String },
}

/// Failure classes reported by a synthesis oracle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    /// Retrying the same request may succeed (network, timeout, 5xx, rate limit).
    #[error("oracle temporarily unavailable: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    /// Retrying cannot help (auth, quota, invalid request).
    #[error("oracle rejected the request: {message}")]
    Permanent { message: String },
    /// The oracle answered with files that violate size or path rules.
    #[error("malformed oracle response: {message}")]
    MalformedResponse { message: String },
    #[error("oracle call cancelled")]
    Cancelled,
}

impl OracleError {
    pub fn transient(message: impl Into<String>) -> Self {
        OracleError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        OracleError::Permanent {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        OracleError::MalformedResponse {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, OracleError::Transient { .. })
    }
}

/// Execution failure classes.
///
/// `Timeout` and `NonZeroExit` never abort a session: they classify an
/// [`ExecutionResult`](crate::core::types::ExecutionResult) and feed the
/// diagnostic. Only `SandboxSetupFailure` and `Cancelled` are returned as errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("execution timed out after {}s", .after.as_secs_f64())]
    Timeout { after: Duration },
    #[error("execution exited with status {code}")]
    NonZeroExit { code: i32 },
    #[error("sandbox setup failed: {message}")]
    SandboxSetupFailure { message: String },
    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn setup(message: impl Into<String>) -> Self {
        ExecutionError::SandboxSetupFailure {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("test scenario line {line}: {reason}")]
    ScenarioUnparseable { line: usize, reason: String },
}

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("destination {} is not empty", .path.display())]
    DestinationNotEmpty { path: PathBuf },
    #[error("write {}: {source}", .path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a session ended without a passing artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionReason {
    /// `max_attempts` attempts were spent.
    MaxAttempts,
    /// The same diagnostic came back `repeats` times in a row after the first.
    RepeatedDiagnostic { repeats: u32 },
}

impl fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExhaustionReason::MaxAttempts => f.write_str("attempt budget exhausted"),
            ExhaustionReason::RepeatedDiagnostic { repeats } => {
                write!(f, "identical diagnostic repeated {repeats} time(s)")
            }
        }
    }
}

/// Root cause of an aborted session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortCause {
    #[error(transparent)]
    Oracle(OracleError),
    #[error(transparent)]
    Sandbox(ExecutionError),
    #[error(transparent)]
    Scenario(ValidationError),
    #[error("invalid session limits: {0}")]
    Limits(String),
    #[error("interrupted")]
    Cancelled,
}

/// Terminal failure of a session. Always carries the attempt history.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("no passing artifact after {} attempt(s): {reason}", .session.attempts.len())]
    AttemptsExhausted {
        session: Box<Session>,
        reason: ExhaustionReason,
    },
    #[error("session aborted after {} attempt(s): {cause}", .session.attempts.len())]
    Aborted {
        session: Box<Session>,
        cause: AbortCause,
    },
}

impl SynthesisError {
    pub fn session(&self) -> &Session {
        match self {
            SynthesisError::AttemptsExhausted { session, .. } => session,
            SynthesisError::Aborted { session, .. } => session,
        }
    }

    pub fn last_diagnostic(&self) -> Option<&Diagnostic> {
        self.session().last_diagnostic()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SynthesisError::Aborted {
                cause: AbortCause::Cancelled,
                ..
            }
        )
    }
}
