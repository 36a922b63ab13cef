//! svcgen configuration stored in `svcgen.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::RetryPolicy;
use crate::core::prompt::PromptComposer;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "svcgen.toml";

/// svcgen configuration (TOML).
///
/// Every table is optional; missing keys fall back to the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SvcgenConfig {
    #[serde(rename = "loop")]
    pub repair: LoopConfig,
    pub oracle: OracleConfig,
    pub sandbox: SandboxConfig,
    pub validator: ValidatorConfig,
    pub prompt: PromptConfig,
    pub session_log: SessionLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    pub max_attempts: u32,
    /// Stop after the same diagnostic repeats this many times in a row (0 disables).
    pub identical_diagnostic_limit: u32,
    /// Diagnostics shown in text in a repair prompt (latest included).
    pub history_window: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            identical_diagnostic_limit: 2,
            history_window: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OracleBackend {
    #[default]
    Command,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    pub backend: OracleBackend,
    pub transient_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter: bool,
    pub timeout_secs: u64,
    pub max_files: usize,
    pub max_file_bytes: usize,
    pub max_total_bytes: usize,
    /// Largest HTTP response body read before parsing.
    pub max_response_bytes: usize,
    /// Truncate captured backend stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    pub command: CommandOracleConfig,
    pub http: HttpOracleConfig,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            backend: OracleBackend::Command,
            transient_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            backoff_jitter: true,
            timeout_secs: 10 * 60,
            max_files: 64,
            max_file_bytes: 256 * 1024,
            max_total_bytes: 1024 * 1024,
            max_response_bytes: 4 * 1024 * 1024,
            output_limit_bytes: 2_000_000,
            command: CommandOracleConfig::default(),
            http: HttpOracleConfig::default(),
        }
    }
}

impl OracleConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.transient_retries,
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            jitter: self.backoff_jitter,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandOracleConfig {
    /// Backend command. `{schema}` and `{output}` are replaced per call; the
    /// prompt is written to stdin.
    pub argv: Vec<String>,
}

impl Default for CommandOracleConfig {
    fn default() -> Self {
        Self {
            argv: [
                "codex",
                "exec",
                "--skip-git-repo-check",
                "--sandbox",
                "read-only",
                "--output-schema",
                "{schema}",
                "--output-last-message",
                "{output}",
                "-",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpOracleConfig {
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
}

impl Default for HttpOracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryPointConfig {
    /// Top-level artifact file that marks this entry point.
    pub file: String,
    /// Command run inside the sandbox working directory.
    pub command: Vec<String>,
}

impl EntryPointConfig {
    fn new(file: &str, command: &[&str]) -> Self {
        Self {
            file: file.to_string(),
            command: command.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Extra tries when the sandbox itself cannot be set up.
    pub setup_retries: u32,
    /// Isolation wrapper prepended to the entry command. `{root}` is replaced
    /// with the sandbox directory and `{workdir}` with its working directory.
    pub wrapper: Vec<String>,
    /// Run without a wrapper. Generated code can then read the host filesystem.
    pub allow_unisolated: bool,
    /// Variables copied from the parent environment. Everything else is cleared.
    pub env_passthrough: Vec<String>,
    /// Entry points in priority order; the first present in the artifact wins.
    pub entrypoints: Vec<EntryPointConfig>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            output_limit_bytes: 64 * 1024,
            setup_retries: 2,
            wrapper: default_wrapper(),
            allow_unisolated: false,
            env_passthrough: vec!["PATH".to_string()],
            entrypoints: vec![
                EntryPointConfig::new("run.sh", &["sh", "run.sh"]),
                EntryPointConfig::new("main.py", &["python3", "main.py"]),
                EntryPointConfig::new("index.js", &["node", "index.js"]),
            ],
        }
    }
}

/// Bubblewrap with read-only system directories, a private `/tmp`, no
/// network and only the sandbox directory writable.
fn default_wrapper() -> Vec<String> {
    [
        "bwrap",
        "--die-with-parent",
        "--unshare-all",
        "--ro-bind",
        "/usr",
        "/usr",
        "--ro-bind-try",
        "/bin",
        "/bin",
        "--ro-bind-try",
        "/lib",
        "/lib",
        "--ro-bind-try",
        "/lib64",
        "/lib64",
        "--ro-bind-try",
        "/etc/alternatives",
        "/etc/alternatives",
        "--proc",
        "/proc",
        "--dev",
        "/dev",
        "--tmpfs",
        "/tmp",
        "--bind",
        "{root}",
        "{root}",
        "--chdir",
        "{workdir}",
        "--",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidatorConfig {
    pub diagnostic_limit_bytes: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            diagnostic_limit_bytes: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    pub budget_bytes: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionLogConfig {
    pub enabled: bool,
    pub dir: String,
}

impl Default for SessionLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: ".svcgen/sessions".to_string(),
        }
    }
}

impl SvcgenConfig {
    pub fn validate(&self) -> Result<()> {
        if self.repair.max_attempts == 0 {
            return Err(anyhow!("loop.max_attempts must be > 0"));
        }
        if self.repair.history_window == 0 {
            return Err(anyhow!("loop.history_window must be > 0"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self.oracle.backoff_max_ms < self.oracle.backoff_base_ms {
            return Err(anyhow!("oracle.backoff_max_ms must be >= backoff_base_ms"));
        }
        if self.oracle.max_files == 0
            || self.oracle.max_file_bytes == 0
            || self.oracle.max_total_bytes == 0
            || self.oracle.output_limit_bytes == 0
        {
            return Err(anyhow!("oracle size limits must be > 0"));
        }
        if self.oracle.max_response_bytes < self.oracle.max_total_bytes {
            return Err(anyhow!("oracle.max_response_bytes must be >= max_total_bytes"));
        }
        if self.oracle.backend == OracleBackend::Command && is_blank_command(&self.oracle.command.argv)
        {
            return Err(anyhow!("oracle.command.argv must be a non-empty array"));
        }
        if self.oracle.backend == OracleBackend::Http {
            if self.oracle.http.base_url.trim().is_empty() {
                return Err(anyhow!("oracle.http.base_url must be set"));
            }
            if self.oracle.http.model.trim().is_empty() {
                return Err(anyhow!("oracle.http.model must be set"));
            }
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if is_blank_command(&self.sandbox.wrapper) && !self.sandbox.allow_unisolated {
            return Err(anyhow!(
                "sandbox.wrapper is empty; configure an isolation wrapper or set sandbox.allow_unisolated = true"
            ));
        }
        if self.sandbox.entrypoints.is_empty() {
            return Err(anyhow!("sandbox.entrypoints must not be empty"));
        }
        for entry in &self.sandbox.entrypoints {
            if entry.file.trim().is_empty() || is_blank_command(&entry.command) {
                return Err(anyhow!(
                    "sandbox.entrypoints entry {:?} needs a file and a command",
                    entry.file
                ));
            }
        }
        if self.validator.diagnostic_limit_bytes == 0 {
            return Err(anyhow!("validator.diagnostic_limit_bytes must be > 0"));
        }
        if self.prompt.budget_bytes == 0 {
            return Err(anyhow!("prompt.budget_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn prompt_composer(&self) -> PromptComposer {
        PromptComposer::new(
            self.prompt.budget_bytes,
            self.repair.history_window,
            self.sandbox
                .entrypoints
                .iter()
                .map(|entry| entry.file.clone())
                .collect(),
        )
    }
}

fn is_blank_command(argv: &[String]) -> bool {
    argv.first().is_none_or(|program| program.trim().is_empty())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SvcgenConfig::default()`.
pub fn load_config(path: &Path) -> Result<SvcgenConfig> {
    if !path.exists() {
        let cfg = SvcgenConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SvcgenConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Write config to disk atomically (temp file + rename).
///
/// Refuses to replace an existing file unless `force` is set.
pub fn write_config(path: &Path, cfg: &SvcgenConfig, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SvcgenConfig::default());
        assert_eq!(cfg.repair.max_attempts, 5);
        assert_eq!(cfg.sandbox.entrypoints[0].file, "run.sh");
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("svcgen.toml");
        let cfg = SvcgenConfig::default();
        write_config(&path, &cfg, false).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn write_refuses_to_overwrite_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("svcgen.toml");
        write_config(&path, &SvcgenConfig::default(), false).expect("first write");
        let err = write_config(&path, &SvcgenConfig::default(), false).expect_err("exists");
        assert!(err.to_string().contains("already exists"));
        write_config(&path, &SvcgenConfig::default(), true).expect("forced write");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("svcgen.toml");
        fs::write(
            &path,
            "[loop]\nmax_attempts = 2\n\n[oracle]\nbackend = \"http\"\n\n[oracle.http]\nmodel = \"local\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.repair.max_attempts, 2);
        assert_eq!(cfg.repair.history_window, 3);
        assert_eq!(cfg.oracle.backend, OracleBackend::Http);
        assert_eq!(cfg.oracle.http.model, "local");
        assert_eq!(cfg.oracle.http.api_key_env, "OPENAI_API_KEY");
        assert_eq!(cfg.sandbox.timeout_secs, 60);
    }

    #[test]
    fn validate_rejects_zero_limits_and_empty_commands() {
        let mut cfg = SvcgenConfig::default();
        cfg.sandbox.timeout_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SvcgenConfig::default();
        cfg.oracle.command.argv = vec![" ".to_string()];
        assert!(cfg.validate().is_err());

        let mut cfg = SvcgenConfig::default();
        cfg.sandbox.entrypoints[0].command.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = SvcgenConfig::default();
        cfg.oracle.max_response_bytes = cfg.oracle.max_total_bytes - 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_wrapper_needs_explicit_opt_in() {
        let mut cfg = SvcgenConfig::default();
        assert_eq!(cfg.sandbox.wrapper.first().map(String::as_str), Some("bwrap"));
        cfg.sandbox.wrapper.clear();
        let err = cfg.validate().expect_err("unisolated");
        assert!(err.to_string().contains("allow_unisolated"));

        cfg.sandbox.allow_unisolated = true;
        cfg.validate().expect("opted in");
    }

    #[test]
    fn composer_uses_entry_point_files() {
        let request = SvcgenConfig::default()
            .prompt_composer()
            .compose("d", "s", &[]);
        assert!(request.prompt.contains("run.sh, main.py, index.js"));
    }
}
