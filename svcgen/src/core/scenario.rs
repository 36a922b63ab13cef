//! Test scenario parsing.
//!
//! A scenario is free text written for the oracle. Lines of the form
//! `expect: <stream> <operator> [operand]` additionally declare checks that
//! the validator applies to a zero-exit run:
//!
//! ```text
//! given input "ping" the service returns "ping"
//! expect: stdout contains ok 1
//! expect: stdout not contains Traceback
//! expect: stdout matches ^ok \d+
//! expect: stderr empty
//! ```

use regex::Regex;

use crate::error::ValidationError;

const EXPECT_PREFIX: &str = "expect:";

/// Output stream an expectation inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// A single structured check declared by the scenario.
#[derive(Debug, Clone)]
pub enum Expectation {
    Contains { stream: Stream, needle: String },
    NotContains { stream: Stream, needle: String },
    Matches { stream: Stream, pattern: Regex },
    Empty { stream: Stream },
}

impl PartialEq for Expectation {
    fn eq(&self, other: &Self) -> bool {
        self.describe() == other.describe()
    }
}

impl Eq for Expectation {}

impl Expectation {
    /// Human-readable form used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Expectation::Contains { stream, needle } => {
                format!("{} contains {:?}", stream.as_str(), needle)
            }
            Expectation::NotContains { stream, needle } => {
                format!("{} does not contain {:?}", stream.as_str(), needle)
            }
            Expectation::Matches { stream, pattern } => {
                format!("{} matches /{}/", stream.as_str(), pattern.as_str())
            }
            Expectation::Empty { stream } => format!("{} is empty", stream.as_str()),
        }
    }

    pub fn stream(&self) -> Stream {
        match self {
            Expectation::Contains { stream, .. }
            | Expectation::NotContains { stream, .. }
            | Expectation::Matches { stream, .. }
            | Expectation::Empty { stream } => *stream,
        }
    }

    pub fn holds(&self, output: &str) -> bool {
        match self {
            Expectation::Contains { needle, .. } => output.contains(needle.as_str()),
            Expectation::NotContains { needle, .. } => !output.contains(needle.as_str()),
            Expectation::Matches { pattern, .. } => pattern.is_match(output),
            Expectation::Empty { .. } => output.trim().is_empty(),
        }
    }
}

/// Structured expectations parsed from a free-text test scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestScenario {
    expectations: Vec<Expectation>,
}

impl TestScenario {
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        if text.trim().is_empty() {
            return Err(ValidationError::ScenarioUnparseable {
                line: 0,
                reason: "scenario is empty".to_string(),
            });
        }

        let mut expectations = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            let Some(rest) = strip_prefix_ignore_case(trimmed, EXPECT_PREFIX) else {
                continue;
            };
            let expectation =
                parse_expectation(rest.trim()).map_err(|reason| {
                    ValidationError::ScenarioUnparseable {
                        line: index + 1,
                        reason,
                    }
                })?;
            expectations.push(expectation);
        }

        Ok(Self { expectations })
    }

    pub fn expectations(&self) -> &[Expectation] {
        &self.expectations
    }
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

fn parse_expectation(body: &str) -> Result<Expectation, String> {
    let (stream_word, rest) = split_word(body);
    let stream = match stream_word.to_ascii_lowercase().as_str() {
        "stdout" => Stream::Stdout,
        "stderr" => Stream::Stderr,
        "" => return Err("missing stream (stdout or stderr)".to_string()),
        other => return Err(format!("unknown stream '{other}'")),
    };

    let (op, operand) = split_word(rest);
    match op.to_ascii_lowercase().as_str() {
        "contains" => Ok(Expectation::Contains {
            stream,
            needle: required_operand(operand, "contains")?,
        }),
        "not" => {
            let (next, operand) = split_word(operand);
            if !next.eq_ignore_ascii_case("contains") {
                return Err(format!("expected 'not contains', found 'not {next}'"));
            }
            Ok(Expectation::NotContains {
                stream,
                needle: required_operand(operand, "not contains")?,
            })
        }
        "matches" => {
            let source = required_operand(operand, "matches")?;
            let pattern =
                Regex::new(&source).map_err(|err| format!("invalid regex {source:?}: {err}"))?;
            Ok(Expectation::Matches { stream, pattern })
        }
        "empty" => {
            if !operand.trim().is_empty() {
                return Err("'empty' takes no operand".to_string());
            }
            Ok(Expectation::Empty { stream })
        }
        "" => Err("missing operator".to_string()),
        other => Err(format!("unknown operator '{other}'")),
    }
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(idx) => (&input[..idx], &input[idx..]),
        None => (input, ""),
    }
}

fn required_operand(raw: &str, op: &str) -> Result<String, String> {
    let value = unquote(raw.trim());
    if value.is_empty() {
        return Err(format!("'{op}' requires an operand"));
    }
    Ok(value.to_string())
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}
