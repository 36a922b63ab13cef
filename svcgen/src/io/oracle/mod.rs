//! Synthesis oracle adapters.
//!
//! The [`Oracle`] trait decouples the repair loop from the generation backend.
//! Backends return raw model text; [`parse_artifact_response`] is the single
//! trust boundary that turns it into an [`ArtifactSet`].

mod command;
mod http;

use std::sync::LazyLock;

use jsonschema::Validator;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::artifact_path::normalize_relative;
use crate::core::backoff::RetryPolicy;
use crate::core::types::{ArtifactSet, GenerationRequest, MANIFEST_FILE};
use crate::error::OracleError;
use crate::io::config::{OracleBackend, OracleConfig};

pub use command::CommandOracle;
pub use http::{HttpOracle, classify_status};

/// JSON Schema every structured oracle response must satisfy.
pub const ARTIFACT_RESPONSE_SCHEMA: &str =
    include_str!("../../../schemas/artifact_response.schema.json");

static RESPONSE_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(ARTIFACT_RESPONSE_SCHEMA).expect("response schema is valid json");
    jsonschema::validator_for(&schema).expect("response schema compiles")
});

/// Abstraction over code-generation backends.
pub trait Oracle: Send + Sync {
    /// Produce a candidate artifact for `request`.
    fn synthesize(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<ArtifactSet, OracleError>;
}

/// Build the backend selected in the config.
pub fn oracle_from_config(config: &OracleConfig) -> Result<Box<dyn Oracle>, OracleError> {
    match config.backend {
        OracleBackend::Command => Ok(Box::new(CommandOracle::new(config.clone()))),
        OracleBackend::Http => Ok(Box::new(HttpOracle::new(config.clone())?)),
    }
}

impl<O: Oracle + ?Sized> Oracle for Box<O> {
    fn synthesize(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<ArtifactSet, OracleError> {
        (**self).synthesize(request, cancel)
    }
}

/// Sanity bounds applied to every oracle response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseLimits {
    pub max_files: usize,
    pub max_file_bytes: usize,
    pub max_total_bytes: usize,
}

impl From<&OracleConfig> for ResponseLimits {
    fn from(config: &OracleConfig) -> Self {
        Self {
            max_files: config.max_files,
            max_file_bytes: config.max_file_bytes,
            max_total_bytes: config.max_total_bytes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseFile {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ArtifactResponse {
    files: Vec<ResponseFile>,
}

/// Parse raw model output into an artifact.
///
/// Accepts a JSON object `{"files": [{"path", "content"}]}` (optionally inside a
/// code fence or surrounded by prose) and falls back to markdown file blocks
/// (`**path**` followed by a fenced block).
///
/// - Output with no recognizable files, including text that is not valid
///   JSON, is [`OracleError::Transient`]: another call may well produce a
///   usable answer.
/// - A well-formed JSON object that fails the response schema, and files that
///   break the size bounds or path rules, are [`OracleError::MalformedResponse`].
pub fn parse_artifact_response(
    raw: &str,
    limits: &ResponseLimits,
) -> Result<ArtifactSet, OracleError> {
    let files = match extract_json_files(raw) {
        JsonFiles::Parsed(files) => files,
        JsonFiles::Absent => extract_markdown_files(raw),
        JsonFiles::Unparseable(reason) => markdown_or(
            raw,
            OracleError::transient(format!("unusable oracle response: {reason}")),
        )?,
        JsonFiles::SchemaInvalid(reason) => markdown_or(raw, OracleError::malformed(reason))?,
    };

    if files.is_empty() {
        return Err(OracleError::transient(
            "oracle response contained no files",
        ));
    }
    check_limits(&files, limits)?;

    for (path, _) in &files {
        if normalize_relative(path).is_ok_and(|p| p == MANIFEST_FILE) {
            return Err(OracleError::malformed(format!(
                "{MANIFEST_FILE} is reserved for the packaging manifest"
            )));
        }
    }

    ArtifactSet::new(files).map_err(|err| OracleError::malformed(err.to_string()))
}

fn check_limits(files: &[(String, String)], limits: &ResponseLimits) -> Result<(), OracleError> {
    if files.len() > limits.max_files {
        return Err(OracleError::malformed(format!(
            "{} files exceed the limit of {}",
            files.len(),
            limits.max_files
        )));
    }
    let mut total = 0usize;
    for (path, content) in files {
        if content.len() > limits.max_file_bytes {
            return Err(OracleError::malformed(format!(
                "{path:?} is {} bytes, limit is {}",
                content.len(),
                limits.max_file_bytes
            )));
        }
        total += content.len();
    }
    if total > limits.max_total_bytes {
        return Err(OracleError::malformed(format!(
            "response is {total} bytes, limit is {}",
            limits.max_total_bytes
        )));
    }
    Ok(())
}

/// Markdown file blocks from `raw`, or `rejection` when there are none.
fn markdown_or(raw: &str, rejection: OracleError) -> Result<Vec<(String, String)>, OracleError> {
    let blocks = extract_markdown_files(raw);
    if blocks.is_empty() {
        return Err(rejection);
    }
    debug!(reason = %rejection, "json response rejected, using markdown blocks");
    Ok(blocks)
}

/// What the JSON reading of a raw response produced.
enum JsonFiles {
    /// The text holds no JSON object at all.
    Absent,
    Unparseable(String),
    SchemaInvalid(String),
    Parsed(Vec<(String, String)>),
}

fn extract_json_files(raw: &str) -> JsonFiles {
    let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
        return JsonFiles::Absent;
    };
    if end < start {
        return JsonFiles::Absent;
    }
    let value: Value = match serde_json::from_str(&raw[start..=end]) {
        Ok(value) => value,
        Err(err) => return JsonFiles::Unparseable(format!("invalid json: {err}")),
    };
    let messages: Vec<String> = RESPONSE_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return JsonFiles::SchemaInvalid(format!(
            "schema validation failed: {}",
            messages.join("; ")
        ));
    }
    match serde_json::from_value::<ArtifactResponse>(value) {
        Ok(parsed) => JsonFiles::Parsed(
            parsed
                .files
                .into_iter()
                .map(|file| (file.path, file.content))
                .collect(),
        ),
        Err(err) => JsonFiles::SchemaInvalid(format!("deserialize response: {err}")),
    }
}

/// Collect `**path**` + fenced block pairs.
fn extract_markdown_files(raw: &str) -> Vec<(String, String)> {
    let lines: Vec<&str> = raw.lines().collect();
    let mut files = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some(path) = header_path(lines[i]) else {
            i += 1;
            continue;
        };
        let Some(open) = lines[i + 1..]
            .iter()
            .position(|line| !line.trim().is_empty())
            .map(|offset| i + 1 + offset)
        else {
            break;
        };
        let fence_len = lines[open]
            .trim_start()
            .chars()
            .take_while(|c| *c == '`')
            .count();
        if fence_len < 3 {
            i = open;
            continue;
        }
        let close = lines[open + 1..].iter().position(|line| {
            let trimmed = line.trim();
            trimmed.len() >= fence_len && trimmed.chars().all(|c| c == '`')
        });
        let Some(close) = close.map(|offset| open + 1 + offset) else {
            break;
        };
        let mut content = lines[open + 1..close].join("\n");
        content.push('\n');
        files.push((path.to_string(), content));
        i = close + 1;
    }

    files
}

fn header_path(line: &str) -> Option<&str> {
    let inner = line.trim().strip_prefix("**")?.strip_suffix("**")?;
    let inner = inner.trim().trim_matches('`').trim();
    (!inner.is_empty() && !inner.contains(char::is_whitespace)).then_some(inner)
}

/// Call `oracle`, retrying transient failures per `policy`.
///
/// Returns the last transient error once retries are exhausted; permanent,
/// malformed and cancelled outcomes return immediately.
#[instrument(skip_all, fields(retries = policy.retries))]
pub fn synthesize_with_retry<O: Oracle + ?Sized>(
    oracle: &O,
    request: &GenerationRequest,
    policy: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<ArtifactSet, OracleError> {
    let mut retry = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(OracleError::Cancelled);
        }
        match oracle.synthesize(request, cancel) {
            Ok(artifact) => return Ok(artifact),
            Err(OracleError::Transient {
                message,
                retry_after,
            }) if retry < policy.retries => {
                let delay = policy.sleep_for(retry, retry_after, rand::thread_rng().r#gen());
                warn!(
                    retry = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "transient oracle failure, backing off"
                );
                if !cancel.sleep(delay) {
                    return Err(OracleError::Cancelled);
                }
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
