//! Sandbox executor for candidate artifacts.
//!
//! Every call materializes the artifact in a fresh temporary directory, runs
//! the resolved entry point through the isolation wrapper with a cleared
//! environment and tears the directory down afterwards. Nothing is shared
//! between calls. Without a wrapper the sandbox refuses to run unless
//! `allow_unisolated` is set.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::{ArtifactSet, ExecutionResult};
use crate::error::ExecutionError;
use crate::io::config::{EntryPointConfig, SandboxConfig};
use crate::io::process::{is_not_found, run_command};

/// Exit code reported when the entry point or its interpreter is missing.
pub const MISSING_ENTRY_EXIT: i32 = 127;

/// Placeholders in the wrapper argv.
const WORKDIR_PLACEHOLDER: &str = "{workdir}";
const ROOT_PLACEHOLDER: &str = "{root}";

/// Abstraction over execution environments.
///
/// Implementations must be usable from several sessions at once.
pub trait Sandbox: Send + Sync {
    /// Run `artifact` bounded by `timeout`.
    ///
    /// A timeout or non-zero exit is a normal [`ExecutionResult`]; only setup
    /// failures and cancellation are errors.
    fn execute(
        &self,
        artifact: &ArtifactSet,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, ExecutionError>;
}

/// Sandbox backed by a temporary directory and a child process group.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn has_wrapper(&self) -> bool {
        self.config
            .wrapper
            .first()
            .is_some_and(|program| !program.trim().is_empty())
    }

    fn resolve_entry(&self, artifact: &ArtifactSet) -> Option<&EntryPointConfig> {
        self.config
            .entrypoints
            .iter()
            .find(|entry| artifact.contains(&entry.file))
    }

    fn missing_entry(&self) -> ExecutionResult {
        let expected: Vec<&str> = self
            .config
            .entrypoints
            .iter()
            .map(|entry| entry.file.as_str())
            .collect();
        ExecutionResult {
            exit_code: MISSING_ENTRY_EXIT,
            stdout: String::new(),
            stderr: format!(
                "no entry point found: expected one of {} at the top level\n",
                expected.join(", ")
            ),
            duration: Duration::ZERO,
            timed_out: false,
        }
    }

    fn build_command(
        &self,
        entry: &EntryPointConfig,
        root: &Path,
        work: &Path,
    ) -> Result<Command, ExecutionError> {
        let workdir = work.to_string_lossy();
        let rootdir = root.to_string_lossy();
        let argv: Vec<String> = self
            .config
            .wrapper
            .iter()
            .map(|arg| {
                arg.replace(WORKDIR_PLACEHOLDER, &workdir)
                    .replace(ROOT_PLACEHOLDER, &rootdir)
            })
            .chain(entry.command.iter().cloned())
            .collect();
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecutionError::setup(format!(
                "entry point {} has no command",
                entry.file
            )));
        };

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(work).env_clear();
        for key in &self.config.env_passthrough {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        cmd.env("HOME", root.join("home"))
            .env("TMPDIR", root.join("tmp"));
        Ok(cmd)
    }
}

impl Sandbox for ProcessSandbox {
    #[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), files = artifact.len()))]
    fn execute(
        &self,
        artifact: &ArtifactSet,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        if !self.has_wrapper() && !self.config.allow_unisolated {
            return Err(ExecutionError::setup(
                "no isolation wrapper configured and sandbox.allow_unisolated is off",
            ));
        }
        let Some(entry) = self.resolve_entry(artifact) else {
            warn!("artifact has no entry point");
            return Ok(self.missing_entry());
        };

        let root = tempfile::Builder::new()
            .prefix("svcgen-sandbox-")
            .tempdir()
            .map_err(|err| ExecutionError::setup(format!("create sandbox dir: {err}")))?;
        let _tracked = cancel.track_dir(root.path());
        let work = root.path().join("work");
        for dir in ["work", "home", "tmp"] {
            let path = root.path().join(dir);
            fs::create_dir(&path).map_err(|err| {
                ExecutionError::setup(format!("create {}: {err}", path.display()))
            })?;
        }
        materialize(artifact, &work)?;

        let cmd = self.build_command(entry, root.path(), &work)?;
        info!(entry = %entry.file, "running artifact");
        let output = match run_command(cmd, None, timeout, self.config.output_limit_bytes, cancel)
        {
            Ok(output) => output,
            Err(err) if is_not_found(&err) && self.has_wrapper() => {
                let wrapper = self.config.wrapper.first().map_or("", String::as_str);
                return Err(ExecutionError::setup(format!(
                    "isolation wrapper {wrapper:?} is not available: {err:#}"
                )));
            }
            Err(err) if is_not_found(&err) => {
                let program = entry.command.first().map_or("", String::as_str);
                return Ok(ExecutionResult {
                    exit_code: MISSING_ENTRY_EXIT,
                    stdout: String::new(),
                    stderr: format!("{program}: command not found\n"),
                    duration: Duration::ZERO,
                    timed_out: false,
                });
            }
            Err(err) => return Err(ExecutionError::setup(format!("{err:#}"))),
        };

        if output.cancelled {
            return Err(ExecutionError::Cancelled);
        }

        let scrub = |text: String| scrub_paths(text, &work, root.path());
        let result = ExecutionResult {
            exit_code: output.exit_code(),
            stdout: scrub(output.stdout_lossy()),
            stderr: scrub(output.stderr_lossy()),
            duration: output.duration,
            timed_out: output.timed_out,
        };
        debug!(
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            duration_ms = result.duration.as_millis() as u64,
            "artifact finished"
        );

        if let Err(err) = root.close() {
            warn!(err = %err, "failed to remove sandbox dir");
        }
        Ok(result)
    }
}

fn materialize(artifact: &ArtifactSet, work: &Path) -> Result<(), ExecutionError> {
    for (rel, content) in artifact.files() {
        let path = work.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                ExecutionError::setup(format!("create {}: {err}", parent.display()))
            })?;
        }
        fs::write(&path, content)
            .map_err(|err| ExecutionError::setup(format!("write {}: {err}", path.display())))?;
    }
    Ok(())
}

/// Replace sandbox paths so output does not vary between runs.
fn scrub_paths(text: String, work: &Path, root: &Path) -> String {
    let mut text = text;
    for (path, replacement) in [(work, "."), (root, "<sandbox>")] {
        let mut candidates = vec![path.to_string_lossy().into_owned()];
        if let Ok(canonical) = path.canonicalize() {
            candidates.push(canonical.to_string_lossy().into_owned());
        }
        for candidate in candidates {
            if !candidate.is_empty() {
                text = text.replace(&candidate, replacement);
            }
        }
    }
    text
}
