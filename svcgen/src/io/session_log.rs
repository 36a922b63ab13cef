//! Per-session attempt logs under `session_log.dir`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;

use crate::core::types::{Attempt, ExecutionResult, SessionOutcome};

/// `<UTC timestamp>-<6 random alphanumerics>`, e.g. `20261018T142501Z-k3x9qa`.
pub fn new_session_id() -> String {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let mut rng = rand::thread_rng();
    let suffix: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("{timestamp}-{suffix}")
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta<'a> {
    pub session_id: &'a str,
    pub attempt: u32,
    pub repair: bool,
    pub passed: bool,
    pub files: usize,
    pub exit_code: Option<i32>,
    pub timed_out: Option<bool>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary<'a> {
    pub session_id: &'a str,
    pub description: &'a str,
    pub test_scenario: &'a str,
    pub outcome: SessionOutcome,
    pub attempts: usize,
    pub detail: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
    pub artifact_path: PathBuf,
    pub execution_path: PathBuf,
    pub diagnostic_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(root: &Path, session_id: &str, attempt: u32) -> Self {
        let dir = root.join(session_id).join(attempt.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
            artifact_path: dir.join("artifact.json"),
            execution_path: dir.join("execution.log"),
            diagnostic_path: dir.join("diagnostic.json"),
            dir,
        }
    }
}

pub fn session_summary_path(root: &Path, session_id: &str) -> PathBuf {
    root.join(session_id).join("session.json")
}

/// Write the files of one attempt. Optional parts are skipped when absent.
pub fn write_attempt(root: &Path, session_id: &str, attempt: &Attempt) -> Result<AttemptPaths> {
    let paths = AttemptPaths::new(root, session_id, attempt.index);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

    let execution = attempt.execution.as_ref();
    let meta = AttemptMeta {
        session_id,
        attempt: attempt.index,
        repair: attempt.request.is_repair(),
        passed: attempt.verdict.passed,
        files: attempt.artifact.as_ref().map_or(0, |a| a.len()),
        exit_code: execution.map(|e| e.exit_code),
        timed_out: execution.map(|e| e.timed_out),
        duration_ms: execution.map(|e| e.duration.as_millis() as u64),
    };

    // Write in deterministic order to keep logs stable.
    write_json(&paths.meta_path, &meta)?;
    write_text(&paths.prompt_path, &attempt.request.prompt)?;
    if let Some(artifact) = &attempt.artifact {
        write_json(&paths.artifact_path, artifact)?;
    }
    if let Some(execution) = execution {
        write_text(&paths.execution_path, &render_execution(execution))?;
    }
    if let Some(diagnostic) = &attempt.verdict.diagnostic {
        write_json(&paths.diagnostic_path, diagnostic)?;
    }

    Ok(paths)
}

pub fn write_session_summary(root: &Path, summary: &SessionSummary<'_>) -> Result<PathBuf> {
    let path = session_summary_path(root, summary.session_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create session dir {}", parent.display()))?;
    }
    write_json(&path, summary)?;
    Ok(path)
}

fn render_execution(execution: &ExecutionResult) -> String {
    format!(
        "exit_code: {}\ntimed_out: {}\nduration_ms: {}\n=== stdout ===\n{}\n=== stderr ===\n{}\n",
        execution.exit_code,
        execution.timed_out,
        execution.duration.as_millis(),
        execution.stdout,
        execution.stderr
    )
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::types::{ArtifactSet, Diagnostic, GenerationRequest, Verdict};

    fn attempt(index: u32, with_run: bool) -> Attempt {
        let diagnostic = Diagnostic {
            summary: "1 assertion(s) failed".to_string(),
            failing_assertions: vec!["expected stdout contains \"ok\"".to_string()],
            raw_output: "=== stdout ===\n\n=== stderr ===\n".to_string(),
        };
        Attempt {
            index,
            request: GenerationRequest {
                description: "echo service".to_string(),
                test_scenario: "expect: stdout contains ok".to_string(),
                prior_artifact: None,
                diagnostic_history: Vec::new(),
                prompt: "# prompt".to_string(),
            },
            artifact: with_run
                .then(|| ArtifactSet::new([("run.sh", "echo nope")]).expect("artifact")),
            execution: with_run.then(|| ExecutionResult {
                exit_code: 0,
                stdout: "nope\n".to_string(),
                stderr: String::new(),
                duration: Duration::from_millis(12),
                timed_out: false,
            }),
            verdict: Verdict::fail(diagnostic),
        }
    }

    #[test]
    fn session_ids_are_timestamped_and_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        let (timestamp, suffix) = a.split_once('-').expect("separator");
        assert_eq!(timestamp.len(), 16);
        assert!(timestamp.ends_with('Z'));
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn attempt_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AttemptPaths::new(temp.path(), "s-1", 3);
        assert!(paths.dir.ends_with(Path::new("s-1/3")));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.prompt_path.ends_with("prompt.md"));
        assert!(paths.artifact_path.ends_with("artifact.json"));
        assert!(paths.execution_path.ends_with("execution.log"));
        assert!(paths.diagnostic_path.ends_with("diagnostic.json"));
    }

    #[test]
    fn writes_full_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = write_attempt(temp.path(), "s-1", &attempt(0, true)).expect("write");

        let meta: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("meta"))
                .expect("json");
        assert_eq!(meta["attempt"], 0);
        assert_eq!(meta["passed"], false);
        assert_eq!(meta["exit_code"], 0);
        assert_eq!(fs::read_to_string(&paths.prompt_path).expect("prompt"), "# prompt");
        let artifact: ArtifactSet =
            serde_json::from_str(&fs::read_to_string(&paths.artifact_path).expect("artifact"))
                .expect("json");
        assert_eq!(artifact.get("run.sh"), Some("echo nope"));
        assert!(
            fs::read_to_string(&paths.execution_path)
                .expect("execution")
                .contains("=== stdout ===\nnope\n")
        );
        assert!(paths.diagnostic_path.is_file());
    }

    #[test]
    fn generation_failure_attempt_skips_artifact_and_execution() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = write_attempt(temp.path(), "s-2", &attempt(1, false)).expect("write");
        assert!(paths.meta_path.is_file());
        assert!(!paths.artifact_path.exists());
        assert!(!paths.execution_path.exists());
        assert!(paths.diagnostic_path.is_file());
    }

    #[test]
    fn writes_session_summary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_session_summary(
            temp.path(),
            &SessionSummary {
                session_id: "s-3",
                description: "d",
                test_scenario: "t",
                outcome: SessionOutcome::Succeeded,
                attempts: 2,
                detail: None,
            },
        )
        .expect("summary");
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json");
        assert_eq!(value["outcome"], "succeeded");
        assert_eq!(value["attempts"], 2);
    }
}
