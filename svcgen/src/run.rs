//! Orchestration for `svcgen run`: execute a packaged artifact locally.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::cancel::CancelToken;
use crate::core::scenario::TestScenario;
use crate::core::types::{ExecutionResult, Verdict};
use crate::core::validator::validate;
use crate::io::packager::{Manifest, load_packaged};
use crate::io::sandbox::Sandbox;

#[derive(Debug, Clone)]
pub struct RunReport {
    pub manifest: Manifest,
    pub execution: ExecutionResult,
    /// Present when a test scenario was supplied.
    pub verdict: Option<Verdict>,
}

/// Load, verify and execute the artifact packaged at `dir`.
///
/// With `test_scenario` the execution is also validated.
#[instrument(skip_all, fields(dir = %dir.display(), timeout_secs = timeout.as_secs()))]
pub fn run_packaged<S: Sandbox + ?Sized>(
    dir: &Path,
    sandbox: &S,
    test_scenario: Option<&str>,
    timeout: Duration,
    diagnostic_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<RunReport> {
    // Parse first so a bad scenario fails before anything runs.
    let scenario = test_scenario
        .map(TestScenario::parse)
        .transpose()
        .context("parse test scenario")?;
    let (manifest, artifact) =
        load_packaged(dir).with_context(|| format!("load packaged artifact {}", dir.display()))?;

    let execution = sandbox
        .execute(&artifact, timeout, cancel)
        .context("execute packaged artifact")?;
    info!(
        exit_code = execution.exit_code,
        timed_out = execution.timed_out,
        "packaged artifact finished"
    );

    let verdict = scenario
        .as_ref()
        .map(|scenario| validate(scenario, &execution, diagnostic_limit_bytes));
    Ok(RunReport {
        manifest,
        execution,
        verdict,
    })
}
