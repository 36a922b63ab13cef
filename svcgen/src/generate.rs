//! Orchestration for `svcgen generate`.
//!
//! Checks the destination, runs one repair-loop session, packages the passing
//! artifact and writes the session log. Failures are returned as
//! `anyhow::Error` wrapping the typed [`SynthesisError`] or [`PackagingError`]
//! so the CLI can map them to exit codes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::controller::{ControllerConfig, RepairLoop};
use crate::core::types::{ArtifactSet, Attempt, SessionOutcome};
use crate::error::PackagingError;
use crate::io::config::SvcgenConfig;
use crate::io::oracle::Oracle;
use crate::io::packager::{PackageInfo, Packager};
use crate::io::sandbox::Sandbox;
use crate::io::session_log::{SessionSummary, new_session_id, write_attempt, write_session_summary};

/// Inputs of one `generate` invocation.
#[derive(Debug, Clone)]
pub struct GenerateOptions<'a> {
    pub description: &'a str,
    pub test_scenario: &'a str,
    pub destination: &'a Path,
    pub max_attempts: u32,
    pub timeout_per_attempt: Duration,
}

impl<'a> GenerateOptions<'a> {
    /// Options with loop limits taken from `cfg`.
    pub fn from_config(
        cfg: &SvcgenConfig,
        description: &'a str,
        test_scenario: &'a str,
        destination: &'a Path,
    ) -> Self {
        Self {
            description,
            test_scenario,
            destination,
            max_attempts: cfg.repair.max_attempts,
            timeout_per_attempt: cfg.sandbox.timeout(),
        }
    }
}

/// Outcome of a successful `generate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOutcome {
    pub session_id: String,
    pub destination: PathBuf,
    pub attempts: usize,
    pub entry_point: Option<String>,
}

/// Expand a leading `~` and make `raw` absolute.
pub fn resolve_destination(raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(anyhow!("path must not be empty"));
    }
    let expanded = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            let home = std::env::var_os("HOME").ok_or_else(|| anyhow!("HOME is not set"))?;
            PathBuf::from(home).join(rest.trim_start_matches('/'))
        }
        _ => PathBuf::from(raw),
    };
    std::path::absolute(&expanded)
        .with_context(|| format!("resolve path {}", expanded.display()))
}

/// Fail unless `path` is absent or an empty directory.
pub fn ensure_empty_destination(path: &Path) -> Result<(), PackagingError> {
    match fs::read_dir(path) {
        Ok(mut entries) => match entries.next() {
            None => Ok(()),
            Some(_) => Err(PackagingError::DestinationNotEmpty {
                path: path.to_path_buf(),
            }),
        },
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        // A regular file in the way counts as occupied.
        Err(_) if path.exists() => Err(PackagingError::DestinationNotEmpty {
            path: path.to_path_buf(),
        }),
        Err(source) => Err(PackagingError::WriteFailure {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Entry point the sandbox would pick for `artifact`.
pub fn entry_point_for(cfg: &SvcgenConfig, artifact: &ArtifactSet) -> Option<String> {
    cfg.sandbox
        .entrypoints
        .iter()
        .find(|entry| artifact.contains(&entry.file))
        .map(|entry| entry.file.clone())
}

/// Run one session and package its artifact on success.
///
/// `packager` is invoked exactly once, and only when a candidate passed.
#[instrument(skip_all, fields(destination = %options.destination.display()))]
pub fn generate<O, S, P>(
    cfg: &SvcgenConfig,
    oracle: &O,
    sandbox: &S,
    packager: &P,
    options: &GenerateOptions<'_>,
    cancel: &CancelToken,
) -> Result<GenerateOutcome>
where
    O: Oracle + ?Sized,
    S: Sandbox + ?Sized,
    P: Packager + ?Sized,
{
    ensure_empty_destination(options.destination)?;

    let session_id = new_session_id();
    let log_root = cfg
        .session_log
        .enabled
        .then(|| PathBuf::from(&cfg.session_log.dir));
    info!(session = %session_id, "starting session");

    let controller = RepairLoop::new(oracle, sandbox, ControllerConfig::from_config(cfg));
    let result = controller.run(
        &session_id,
        options.description,
        options.test_scenario,
        options.max_attempts,
        options.timeout_per_attempt,
        cancel,
        |attempt: &Attempt| {
            if let Some(root) = &log_root
                && let Err(err) = write_attempt(root, &session_id, attempt)
            {
                warn!(err = %format!("{err:#}"), "failed to write attempt log");
            }
        },
    );

    let synthesis = match result {
        Ok(synthesis) => synthesis,
        Err(err) => {
            let detail = err.to_string();
            log_summary(log_root.as_deref(), &SessionSummary {
                session_id: &session_id,
                description: options.description,
                test_scenario: options.test_scenario,
                outcome: SessionOutcome::Failed,
                attempts: err.session().attempts.len(),
                detail: Some(&detail),
            });
            return Err(err.into());
        }
    };

    let attempts = synthesis.session.attempts.len();
    let entry_point = entry_point_for(cfg, &synthesis.artifact);
    let info = PackageInfo {
        session_id: session_id.clone(),
        description: options.description.to_string(),
        test_scenario: options.test_scenario.to_string(),
        attempts: attempts as u32,
        entry_point: entry_point.clone(),
    };
    let packaged = packager.package(&synthesis.artifact, &info, options.destination);

    let detail = packaged.as_ref().err().map(ToString::to_string);
    log_summary(log_root.as_deref(), &SessionSummary {
        session_id: &session_id,
        description: options.description,
        test_scenario: options.test_scenario,
        outcome: SessionOutcome::Succeeded,
        attempts,
        detail: detail.as_deref(),
    });
    packaged?;

    info!(session = %session_id, attempts, "session packaged");
    Ok(GenerateOutcome {
        session_id,
        destination: options.destination.to_path_buf(),
        attempts,
        entry_point,
    })
}

fn log_summary(root: Option<&Path>, summary: &SessionSummary<'_>) {
    if let Some(root) = root
        && let Err(err) = write_session_summary(root, summary)
    {
        warn!(err = %format!("{err:#}"), "failed to write session summary");
    }
}
