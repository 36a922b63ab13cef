//! Oracle backed by an external agent command (e.g. `codex exec`).

use std::fs;
use std::process::Command;

use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::{ArtifactSet, GenerationRequest};
use crate::error::OracleError;
use crate::io::config::OracleConfig;
use crate::io::oracle::{ARTIFACT_RESPONSE_SCHEMA, Oracle, ResponseLimits, parse_artifact_response};
use crate::io::process::{is_not_found, run_command};

const SCHEMA_PLACEHOLDER: &str = "{schema}";
const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Spawns the configured argv once per request.
///
/// The prompt goes to stdin. `{schema}` is replaced with the path of the
/// response JSON Schema and `{output}` with the file the command must write its
/// answer to; without `{output}` the answer is read from stdout.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    config: OracleConfig,
}

impl CommandOracle {
    pub fn new(config: OracleConfig) -> Self {
        Self { config }
    }
}

impl Oracle for CommandOracle {
    #[instrument(skip_all, fields(timeout_secs = self.config.timeout_secs, repair = request.is_repair()))]
    fn synthesize(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<ArtifactSet, OracleError> {
        let argv = &self.config.command.argv;
        let Some(program) = argv.first() else {
            return Err(OracleError::permanent("oracle.command.argv is empty"));
        };

        let scratch = tempfile::Builder::new()
            .prefix("svcgen-oracle-")
            .tempdir()
            .map_err(|err| OracleError::transient(format!("create oracle scratch dir: {err}")))?;
        let schema_path = scratch.path().join("artifact_response.schema.json");
        let output_path = scratch.path().join("response.json");
        fs::write(&schema_path, ARTIFACT_RESPONSE_SCHEMA)
            .map_err(|err| OracleError::transient(format!("write response schema: {err}")))?;

        let schema_arg = schema_path.to_string_lossy();
        let output_arg = output_path.to_string_lossy();
        let reads_output_file = argv.iter().any(|arg| arg.contains(OUTPUT_PLACEHOLDER));
        let mut cmd = Command::new(program);
        cmd.args(argv[1..].iter().map(|arg| {
            arg.replace(SCHEMA_PLACEHOLDER, &schema_arg)
                .replace(OUTPUT_PLACEHOLDER, &output_arg)
        }))
        .current_dir(scratch.path());

        info!(program = %program, "invoking oracle command");
        let output = run_command(
            cmd,
            Some(request.prompt.as_bytes()),
            self.config.timeout(),
            self.config.output_limit_bytes,
            cancel,
        )
        .map_err(|err| {
            if is_not_found(&err) {
                OracleError::permanent(format!("oracle command {program} not found"))
            } else {
                OracleError::transient(format!("{err:#}"))
            }
        })?;

        if output.cancelled {
            return Err(OracleError::Cancelled);
        }
        if output.timed_out {
            warn!(timeout_secs = self.config.timeout_secs, "oracle command timed out");
            return Err(OracleError::transient(format!(
                "oracle command timed out after {}s",
                self.config.timeout_secs
            )));
        }
        if !output.status.success() {
            warn!(exit_code = output.exit_code(), "oracle command failed");
            let stderr = output.stderr_lossy();
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            return Err(OracleError::transient(format!(
                "oracle command exited with status {}: {}",
                output.exit_code(),
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            )));
        }

        let raw = if reads_output_file {
            fs::read_to_string(&output_path).map_err(|err| {
                OracleError::transient(format!(
                    "read oracle output {}: {err}",
                    output_path.display()
                ))
            })?
        } else {
            String::from_utf8_lossy(&output.stdout).into_owned()
        };
        debug!(bytes = raw.len(), "oracle command answered");

        parse_artifact_response(&raw, &ResponseLimits::from(&self.config))
    }
}
