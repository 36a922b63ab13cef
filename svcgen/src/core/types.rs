//! Shared deterministic types for the generate-execute-validate-repair loop.
//!
//! These types define the contracts between the controller and its
//! collaborators. They hold no I/O handles and serialize to stable JSON for
//! the session log.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::artifact_path::normalize_relative;
use crate::error::{ArtifactError, ExecutionError};

/// File name reserved for the packaging manifest.
pub const MANIFEST_FILE: &str = "svcgen.json";

/// One candidate microservice implementation: relative path -> file content.
///
/// Paths are normalized on construction and iteration order is lexicographic,
/// so two sets with the same files always render the same prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct ArtifactSet {
    files: BTreeMap<String, String>,
}

impl ArtifactSet {
    pub fn new<I, P, C>(files: I) -> Result<Self, ArtifactError>
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: Into<String>,
    {
        let mut normalized = BTreeMap::new();
        for (raw, content) in files {
            let raw = raw.as_ref();
            let path = normalize_relative(raw).map_err(|reason| ArtifactError::InvalidPath {
                path: raw.to_string(),
                reason,
            })?;
            if normalized.insert(path.clone(), content.into()).is_some() {
                return Err(ArtifactError::DuplicatePath(path));
            }
        }
        if normalized.is_empty() {
            return Err(ArtifactError::Empty);
        }
        check_directory_prefixes(&normalized)?;
        Ok(Self { files: normalized })
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.files.values().map(String::len).sum()
    }
}

/// Reject sets where one path is a file and also a parent directory of another.
fn check_directory_prefixes(files: &BTreeMap<String, String>) -> Result<(), ArtifactError> {
    for nested in files.keys() {
        for (i, _) in nested.match_indices('/') {
            let parent = &nested[..i];
            if files.contains_key(parent) {
                return Err(ArtifactError::FileDirectoryClash {
                    file: parent.to_string(),
                    nested: nested.clone(),
                });
            }
        }
    }
    Ok(())
}

impl TryFrom<BTreeMap<String, String>> for ArtifactSet {
    type Error = ArtifactError;

    fn try_from(files: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        ArtifactSet::new(files)
    }
}

impl From<ArtifactSet> for BTreeMap<String, String> {
    fn from(set: ArtifactSet) -> Self {
        set.files
    }
}

/// Captured result of one sandbox run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    /// Classify a failed run. `None` for a clean zero exit.
    pub fn failure(&self, timeout: Duration) -> Option<ExecutionError> {
        if self.timed_out {
            return Some(ExecutionError::Timeout { after: timeout });
        }
        if self.exit_code != 0 {
            return Some(ExecutionError::NonZeroExit {
                code: self.exit_code,
            });
        }
        None
    }
}

/// Structured feedback describing why a candidate failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub summary: String,
    pub failing_assertions: Vec<String>,
    pub raw_output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub diagnostic: Option<Diagnostic>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            diagnostic: None,
        }
    }

    pub fn fail(diagnostic: Diagnostic) -> Self {
        Self {
            passed: false,
            diagnostic: Some(diagnostic),
        }
    }
}

/// Input to one oracle call. Built by the prompt composer, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationRequest {
    pub description: String,
    pub test_scenario: String,
    pub prior_artifact: Option<ArtifactSet>,
    pub diagnostic_history: Vec<Diagnostic>,
    /// Rendered prompt text sent to the oracle.
    pub prompt: String,
}

impl GenerationRequest {
    pub fn is_repair(&self) -> bool {
        !self.diagnostic_history.is_empty()
    }
}

/// One pass through compose -> generate -> execute -> validate.
///
/// `artifact` and `execution` are `None` only when the oracle stayed
/// unavailable through every transient retry; the verdict then carries a
/// diagnostic describing the generation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub index: u32,
    pub request: GenerationRequest,
    pub artifact: Option<ArtifactSet>,
    pub execution: Option<ExecutionResult>,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    Pending,
    Succeeded,
    Failed,
}

/// One end-to-end generate-repair process for a single description/scenario pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    pub description: String,
    pub test_scenario: String,
    pub attempts: Vec<Attempt>,
    pub outcome: SessionOutcome,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        test_scenario: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            test_scenario: test_scenario.into(),
            attempts: Vec::new(),
            outcome: SessionOutcome::Pending,
        }
    }

    /// Diagnostics of every failed attempt, oldest first.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.attempts
            .iter()
            .filter_map(|attempt| attempt.verdict.diagnostic.clone())
            .collect()
    }

    pub fn last_diagnostic(&self) -> Option<&Diagnostic> {
        self.attempts
            .last()
            .and_then(|attempt| attempt.verdict.diagnostic.as_ref())
    }
}
