//! Deterministic fakes and canned artifacts for controller and lifecycle tests.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::core::types::{ArtifactSet, ExecutionResult, GenerationRequest};
use crate::error::{ExecutionError, OracleError, PackagingError};
use crate::io::oracle::Oracle;
use crate::io::config::SandboxConfig;
use crate::io::packager::{PackageInfo, Packager};
use crate::io::sandbox::Sandbox;

/// Scenario satisfied by [`echo_service`].
pub const ECHO_SCENARIO: &str = "Given input X the service returns X.\n\
expect: stdout contains echo:hello\n\
expect: stderr empty";

/// Working echo service: echoes its input and runs a TAP self-test.
pub fn echo_service() -> ArtifactSet {
    ArtifactSet::new([
        (
            "run.sh",
            "#!/bin/sh\n. ./lib/echo.sh\necho_reply hello\n\
             [ \"$(echo_reply abc)\" = \"echo:abc\" ] && echo \"ok 1 - echo returns input\"\n",
        ),
        ("lib/echo.sh", "echo_reply() {\n  printf 'echo:%s\\n' \"$1\"\n}\n"),
    ])
    .expect("echo artifact")
}

/// Shell script with a syntax error; `sh` exits non-zero.
pub fn syntax_broken() -> ArtifactSet {
    ArtifactSet::new([("run.sh", "echo_reply() {\n  printf 'echo:%s\\n' \"$1\"\n\nif then fi\n")])
        .expect("broken artifact")
}

/// Runs cleanly but prints the wrong reply.
pub fn wrong_output() -> ArtifactSet {
    ArtifactSet::new([("run.sh", "echo \"echo:goodbye\"\n")]).expect("wrong artifact")
}

/// Never terminates.
pub fn never_ending() -> ArtifactSet {
    ArtifactSet::new([("run.sh", "while :; do sleep 1; done\n")]).expect("spinning artifact")
}

/// Sandbox settings without an isolation wrapper, for hosts lacking bubblewrap.
pub fn unisolated_sandbox() -> SandboxConfig {
    SandboxConfig {
        wrapper: Vec::new(),
        allow_unisolated: true,
        ..SandboxConfig::default()
    }
}

/// Whether `pid` names a live process. Zombies count as gone.
pub fn process_alive(pid: &str) -> bool {
    if let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) {
        // The state field follows the parenthesised command name.
        return stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X");
    }
    if Path::new("/proc/self").exists() {
        return false;
    }
    Command::new("kill")
        .args(["-0", pid])
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// Poll until `pid` is gone or `limit` passes. Returns whether it is gone.
pub fn wait_for_exit(pid: &str, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while process_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
    true
}

pub fn exec_ok(stdout: &str) -> ExecutionResult {
    ExecutionResult {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
        duration: Duration::from_millis(1),
        timed_out: false,
    }
}

pub fn exec_failed(code: i32, stderr: &str) -> ExecutionResult {
    ExecutionResult {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
        duration: Duration::from_millis(1),
        timed_out: false,
    }
}

/// Pops one scripted item per call; once the script runs dry the last item repeats.
#[derive(Debug)]
struct Script<T> {
    queue: VecDeque<T>,
    last: Option<T>,
}

impl<T: Clone> Script<T> {
    fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            queue: items.into_iter().collect(),
            last: None,
        }
    }

    fn next(&mut self) -> Option<T> {
        if let Some(item) = self.queue.pop_front() {
            self.last = Some(item.clone());
        }
        self.last.clone()
    }
}

/// Oracle that replays a fixed list of responses and records every request.
#[derive(Debug)]
pub struct ScriptedOracle {
    script: Mutex<Script<Result<ArtifactSet, OracleError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedOracle {
    pub fn new(responses: Vec<Result<ArtifactSet, OracleError>>) -> Self {
        Self {
            script: Mutex::new(Script::new(responses)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(artifact: ArtifactSet) -> Self {
        Self::new(vec![Ok(artifact)])
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

impl Oracle for ScriptedOracle {
    fn synthesize(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<ArtifactSet, OracleError> {
        if cancel.is_cancelled() {
            return Err(OracleError::Cancelled);
        }
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        self.script
            .lock()
            .expect("script lock")
            .next()
            .unwrap_or_else(|| Err(OracleError::permanent("oracle script is empty")))
    }
}

/// Sandbox that replays fixed results without running anything.
#[derive(Debug)]
pub struct ScriptedSandbox {
    script: Mutex<Script<Result<ExecutionResult, ExecutionError>>>,
    runs: Mutex<Vec<ArtifactSet>>,
}

impl ScriptedSandbox {
    pub fn new(results: Vec<Result<ExecutionResult, ExecutionError>>) -> Self {
        Self {
            script: Mutex::new(Script::new(results)),
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn runs(&self) -> Vec<ArtifactSet> {
        self.runs.lock().expect("runs lock").clone()
    }
}

impl Sandbox for ScriptedSandbox {
    fn execute(
        &self,
        artifact: &ArtifactSet,
        _timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        self.runs.lock().expect("runs lock").push(artifact.clone());
        self.script
            .lock()
            .expect("script lock")
            .next()
            .unwrap_or_else(|| Err(ExecutionError::setup("sandbox script is empty")))
    }
}

/// Packager wrapper that counts calls before delegating.
#[derive(Debug)]
pub struct CountingPackager<P> {
    inner: P,
    calls: Mutex<Vec<PathBuf>>,
}

impl<P: Packager> CountingPackager<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

impl<P: Packager> Packager for CountingPackager<P> {
    fn package(
        &self,
        artifact: &ArtifactSet,
        info: &PackageInfo,
        destination: &Path,
    ) -> Result<(), PackagingError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(destination.to_path_buf());
        self.inner.package(artifact, info, destination)
    }
}
