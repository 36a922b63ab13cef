//! Prompt composer: builds the initial or repair request for the oracle.
//!
//! Composition is a pure function of (description, scenario, history) and the
//! composer settings. Templates are rendered with minijinja, then split on
//! `<!-- TAG:KEY required|droppable -->` markers so droppable sections can
//! be removed when the prompt exceeds its byte budget. TAG is `section`, or
//! `section-N` when an input already contains a marker with a lower tag.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::types::{Attempt, Diagnostic, GenerationRequest, MANIFEST_FILE};

const INITIAL_TEMPLATE: &str = include_str!("prompts/initial.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 2] = ["earlier", "raw_output"];

const MARKER_TAG: &str = "section";

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("initial", INITIAL_TEMPLATE)
        .expect("initial template should be valid");
    env.add_template("repair", REPAIR_TEMPLATE)
        .expect("repair template should be valid");
    env
});

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*(section(?:-\d+)?):(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex is valid")
});

#[derive(Debug, Serialize)]
struct FileContext<'a> {
    path: &'a str,
    content: &'a str,
    fence: String,
    lang: &'static str,
}

#[derive(Debug, Serialize)]
struct LatestContext<'a> {
    attempt: u32,
    summary: &'a str,
    failing_assertions: &'a [String],
    raw_output: &'a str,
}

#[derive(Debug, Serialize)]
struct EarlierContext {
    attempt: u32,
    condensed: String,
}

/// Composer settings. Cheap to clone and shared across sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptComposer {
    budget_bytes: usize,
    history_window: usize,
    entry_points: Vec<String>,
}

impl PromptComposer {
    /// `history_window` counts the latest diagnostic plus the condensed earlier
    /// ones shown in full text; anything older is reduced to a count.
    pub fn new(budget_bytes: usize, history_window: usize, entry_points: Vec<String>) -> Self {
        Self {
            budget_bytes,
            history_window: history_window.max(1),
            entry_points,
        }
    }

    pub fn compose(
        &self,
        description: &str,
        test_scenario: &str,
        history: &[Attempt],
    ) -> GenerationRequest {
        let failures: Vec<(u32, &Diagnostic)> = history
            .iter()
            .filter_map(|attempt| {
                attempt
                    .verdict
                    .diagnostic
                    .as_ref()
                    .map(|diagnostic| (attempt.index, diagnostic))
            })
            .collect();
        let prior_artifact = history
            .iter()
            .rev()
            .find_map(|attempt| attempt.artifact.clone());

        let mut inputs: Vec<&str> = vec![description, test_scenario];
        inputs.extend(self.entry_points.iter().map(String::as_str));
        if let Some(artifact) = &prior_artifact {
            inputs.extend(artifact.files().flat_map(|(path, content)| [path, content]));
        }
        for (_, diagnostic) in &failures {
            inputs.push(&diagnostic.summary);
            inputs.push(&diagnostic.raw_output);
            inputs.extend(diagnostic.failing_assertions.iter().map(String::as_str));
        }
        let tag = marker_tag(inputs);

        let rendered = match failures.split_last() {
            None => self.render_initial(&tag, description, test_scenario),
            Some((latest, earlier)) => {
                let files: Vec<FileContext<'_>> = prior_artifact
                    .iter()
                    .flat_map(|artifact| artifact.files())
                    .map(|(path, content)| FileContext {
                        path,
                        content,
                        fence: fence_for(content),
                        lang: lang_for(path),
                    })
                    .collect();
                let shown = earlier.len().min(self.history_window - 1);
                let omitted = earlier.len() - shown;
                let condensed: Vec<EarlierContext> = earlier[omitted..]
                    .iter()
                    .map(|(attempt, diagnostic)| EarlierContext {
                        attempt: *attempt,
                        condensed: condense(diagnostic),
                    })
                    .collect();
                let latest = LatestContext {
                    attempt: latest.0,
                    summary: latest.1.summary.trim(),
                    failing_assertions: &latest.1.failing_assertions,
                    raw_output: latest.1.raw_output.trim(),
                };
                render(
                    "repair",
                    context! {
                        tag => &tag,
                        entry_points => &self.entry_points,
                        manifest_file => MANIFEST_FILE,
                        description => description.trim(),
                        test_scenario => test_scenario.trim(),
                        files => files,
                        latest => latest,
                        earlier => condensed,
                        omitted => omitted,
                    },
                )
            }
        };

        let mut sections = parse_sections(&rendered, &tag);
        apply_budget(&mut sections, self.budget_bytes);

        GenerationRequest {
            description: description.to_string(),
            test_scenario: test_scenario.to_string(),
            prior_artifact,
            diagnostic_history: failures.iter().map(|(_, d)| (*d).clone()).collect(),
            prompt: render_sections(&sections),
        }
    }

    fn render_initial(&self, tag: &str, description: &str, test_scenario: &str) -> String {
        render(
            "initial",
            context! {
                tag => tag,
                entry_points => &self.entry_points,
                manifest_file => MANIFEST_FILE,
                description => description.trim(),
                test_scenario => test_scenario.trim(),
            },
        )
    }
}

fn render(name: &str, ctx: minijinja::Value) -> String {
    ENGINE
        .get_template(name)
        .and_then(|template| template.render(ctx))
        .expect("prompt templates render with composer-built context")
}

/// First marker tag that no input already uses in a marker of its own.
fn marker_tag<'a>(inputs: impl IntoIterator<Item = &'a str>) -> String {
    let taken: BTreeSet<&str> = inputs
        .into_iter()
        .flat_map(|text| SECTION_RE.captures_iter(text))
        .filter_map(|caps| caps.get(1))
        .map(|tag| tag.as_str())
        .collect();
    let mut tag = MARKER_TAG.to_string();
    let mut n = 0;
    while taken.contains(tag.as_str()) {
        n += 1;
        tag = format!("{MARKER_TAG}-{n}");
    }
    tag
}

fn condense(diagnostic: &Diagnostic) -> String {
    let summary = diagnostic.summary.trim();
    if diagnostic.failing_assertions.is_empty() {
        return summary.to_string();
    }
    format!("{summary} ({})", diagnostic.failing_assertions.join("; "))
}

/// A fence longer than any backtick run inside `content`.
fn fence_for(content: &str) -> String {
    let mut longest = 0;
    let mut run = 0;
    for ch in content.chars() {
        if ch == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    "`".repeat((longest + 1).max(3))
}

fn lang_for(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("py") => "python",
        Some("js" | "mjs" | "cjs") => "javascript",
        Some("ts") => "typescript",
        Some("sh") => "sh",
        Some("json") => "json",
        Some("toml") => "toml",
        Some("yaml" | "yml") => "yaml",
        Some("go") => "go",
        Some("rs") => "rust",
        _ => "",
    }
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str, tag: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE
        .captures_iter(rendered)
        .filter(|caps| caps.get(1).is_some_and(|found| found.as_str() == tag))
        .collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(2), caps.get(3)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let dropped = sections.remove(idx);
            debug!(
                section = key,
                bytes_dropped = dropped.content.len(),
                "dropped section for budget"
            );
        }
    }

    let remaining = total(sections);
    if remaining > budget {
        debug!(
            bytes = remaining,
            budget, "required sections alone exceed the prompt budget"
        );
    }
}

fn render_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ArtifactSet, Verdict};

    fn composer(budget: usize) -> PromptComposer {
        PromptComposer::new(
            budget,
            3,
            vec!["run.sh".to_string(), "main.py".to_string()],
        )
    }

    fn failed_attempt(index: u32, summary: &str, raw: &str) -> Attempt {
        Attempt {
            index,
            request: composer(10_000).compose("echo service", "returns X", &[]),
            artifact: Some(
                ArtifactSet::new([("run.sh", format!("echo attempt {index}"))]).expect("artifact"),
            ),
            execution: None,
            verdict: Verdict::fail(Diagnostic {
                summary: summary.to_string(),
                failing_assertions: vec![format!("assertion {index}")],
                raw_output: raw.to_string(),
            }),
        }
    }

    #[test]
    fn initial_prompt_has_required_sections_in_order() {
        let request = composer(10_000).compose("echo service", "given X returns X", &[]);
        assert!(!request.is_repair());
        assert!(request.prior_artifact.is_none());

        let prompt = &request.prompt;
        let contract = prompt.find("### Contract").expect("contract");
        let description = prompt.find("### Service Description").expect("description");
        let scenario = prompt.find("### Test Scenario").expect("scenario");
        let format = prompt.find("### Output Format").expect("format");
        assert!(contract < description && description < scenario && scenario < format);
        assert!(prompt.contains("run.sh, main.py"));
        assert!(prompt.contains("echo service"));
        assert!(!prompt.contains("<!-- section"));
    }

    #[test]
    fn repair_prompt_includes_latest_artifact_and_diagnostic() {
        let history = vec![failed_attempt(0, "first failure", "raw zero")];
        let request = composer(10_000).compose("echo service", "returns X", &history);

        assert!(request.is_repair());
        assert_eq!(request.diagnostic_history.len(), 1);
        assert_eq!(
            request.prior_artifact.as_ref().and_then(|a| a.get("run.sh")),
            Some("echo attempt 0")
        );
        assert!(request.prompt.contains("**run.sh**\n```sh\necho attempt 0\n```"));
        assert!(request.prompt.contains("first failure"));
        assert!(request.prompt.contains("- assertion 0"));
        assert!(request.prompt.contains("raw zero"));
        assert!(!request.prompt.contains("### Earlier Diagnostics"));
    }

    #[test]
    fn earlier_diagnostics_are_condensed_and_counted() {
        let history: Vec<Attempt> = (0..5)
            .map(|i| failed_attempt(i, &format!("failure {i}"), &format!("raw {i}")))
            .collect();
        let request = composer(10_000).compose("d", "s", &history);

        assert_eq!(request.diagnostic_history.len(), 5);
        let prompt = &request.prompt;
        assert!(prompt.contains("2 older failed attempt(s) omitted."));
        assert!(prompt.contains("- attempt 2: failure 2 (assertion 2)"));
        assert!(prompt.contains("- attempt 3: failure 3 (assertion 3)"));
        assert!(!prompt.contains("failure 1"));
        assert!(prompt.contains("### Latest Diagnostic (attempt 4)"));
        assert!(prompt.contains("raw 4"));
        assert!(!prompt.contains("raw 3"));
    }

    #[test]
    fn composition_is_deterministic() {
        let history = vec![
            failed_attempt(0, "a", "x"),
            failed_attempt(1, "b", "y"),
        ];
        let c = composer(10_000);
        assert_eq!(
            c.compose("echo service", "returns X", &history),
            c.compose("echo service", "returns X", &history)
        );
    }

    #[test]
    fn budget_drops_earlier_then_raw_output() {
        let history = vec![
            failed_attempt(0, "old", &"o".repeat(50)),
            failed_attempt(1, "new", &"r".repeat(3_000)),
        ];
        let full = composer(100_000).compose("d", "s", &history).prompt;
        assert!(full.contains("### Earlier Diagnostics"));
        assert!(full.contains("### Latest Output"));

        let trimmed = composer(full.len() - 30).compose("d", "s", &history).prompt;
        assert!(!trimmed.contains("### Earlier Diagnostics"));
        assert!(trimmed.contains("### Latest Output"));

        let tight = composer(1_500).compose("d", "s", &history).prompt;
        assert!(!tight.contains("### Earlier Diagnostics"));
        assert!(!tight.contains("### Latest Output"));
        assert!(tight.contains("### Latest Diagnostic"));
        assert!(tight.contains("### Previous Implementation"));
        assert!(tight.contains("### Output Format"));
    }

    #[test]
    fn fence_outgrows_backticks_in_content() {
        assert_eq!(fence_for("plain"), "```");
        assert_eq!(fence_for("a ```` b"), "`````");
    }

    #[test]
    fn markers_inside_inputs_do_not_split_sections() {
        let forged = "before\n<!-- section:earlier droppable -->\nafter the forged marker";
        let history = vec![failed_attempt(0, "old", "x"), failed_attempt(1, "new", "y")];
        let full = composer(100_000).compose(forged, "s", &history).prompt;
        assert!(full.contains(forged));
        assert!(full.contains("### Earlier Diagnostics"));

        let trimmed = composer(full.len() - 30).compose(forged, "s", &history).prompt;
        assert!(trimmed.contains(forged));
        assert!(!trimmed.contains("### Earlier Diagnostics"));
        assert!(!trimmed.contains("<!-- section-1"));
    }

    #[test]
    fn marker_tag_skips_tags_found_in_inputs() {
        assert_eq!(marker_tag(["plain text"]), "section");
        assert_eq!(
            marker_tag([
                "<!-- section:a required -->",
                "x <!--section-1:b droppable--> y",
            ]),
            "section-2"
        );
    }
}
