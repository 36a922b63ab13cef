//! Test validator: scores one execution against the parsed scenario.
//!
//! The verdict is a pure function of the scenario, the execution result and
//! the diagnostic size limit. Durations never reach the diagnostic, so two runs
//! that fail the same way yield equal diagnostics.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::scenario::{Expectation, Stream, TestScenario};
use crate::core::types::{Diagnostic, ExecutionResult, Verdict};

/// Non-zero exits include at most this many trailing stderr lines as assertions.
const STDERR_TAIL_LINES: usize = 5;

static SELF_TEST_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(not ok\b|FAIL:|FAILED\s)").expect("self-test failure regex is valid")
});

/// Score `execution` against `scenario`.
///
/// - Timed-out and non-zero runs always fail.
/// - Zero-exit runs fail when an expectation is unmet or stdout reports a
///   failed self-test (`not ok`, `FAIL:`, `FAILED `).
pub fn validate(
    scenario: &TestScenario,
    execution: &ExecutionResult,
    diagnostic_limit_bytes: usize,
) -> Verdict {
    let raw_output = render_raw_output(execution, diagnostic_limit_bytes);

    if execution.timed_out {
        let mut failing = vec!["process did not exit within the time limit".to_string()];
        failing.extend(stderr_tail(&execution.stderr));
        return Verdict::fail(Diagnostic {
            summary: "execution timed out".to_string(),
            failing_assertions: failing,
            raw_output,
        });
    }

    if execution.exit_code != 0 {
        let mut failing = vec![format!("exited with status {}", execution.exit_code)];
        failing.extend(stderr_tail(&execution.stderr));
        return Verdict::fail(Diagnostic {
            summary: format!("execution exited with status {}", execution.exit_code),
            failing_assertions: failing,
            raw_output,
        });
    }

    let mut failing: Vec<String> = scenario
        .expectations()
        .iter()
        .filter(|expectation| !expectation.holds(stream_output(execution, expectation)))
        .map(|expectation| format!("expected {}", expectation.describe()))
        .collect();
    failing.extend(
        execution
            .stdout
            .lines()
            .filter(|line| SELF_TEST_FAILURE_RE.is_match(line))
            .map(|line| format!("self-test: {}", line.trim())),
    );

    if failing.is_empty() {
        return Verdict::pass();
    }

    Verdict::fail(Diagnostic {
        summary: format!("{} assertion(s) failed", failing.len()),
        failing_assertions: failing,
        raw_output,
    })
}

fn stream_output<'a>(execution: &'a ExecutionResult, expectation: &Expectation) -> &'a str {
    match expectation.stream() {
        Stream::Stdout => &execution.stdout,
        Stream::Stderr => &execution.stderr,
    }
}

fn stderr_tail(stderr: &str) -> Vec<String> {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..]
        .iter()
        .map(|line| format!("stderr: {line}"))
        .collect()
}

fn render_raw_output(execution: &ExecutionResult, limit_bytes: usize) -> String {
    let per_stream = limit_bytes / 2;
    format!(
        "=== stdout ===\n{}\n=== stderr ===\n{}",
        truncate_middle(&execution.stdout, per_stream),
        truncate_middle(&execution.stderr, per_stream)
    )
}

/// Keep the head and tail of `text` within `limit` bytes, marking the cut.
///
/// Cuts land on UTF-8 boundaries, so the kept part may be a few bytes shorter
/// than `limit`. The marker itself is not counted against the limit.
pub fn truncate_middle(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let head_end = floor_char_boundary(text, limit / 2);
    let tail_start = ceil_char_boundary(text, text.len() - (limit - limit / 2));
    let omitted = tail_start - head_end;
    format!(
        "{}\n[... truncated {omitted} bytes ...]\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}
