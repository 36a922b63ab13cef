//! Repair loop controller: compose, generate, execute, validate, decide.
//!
//! The controller owns the [`Session`] for its whole lifetime. Collaborators
//! only see borrowed inputs and hand back values that are folded into the
//! session here. Attempts run strictly one after another.

use std::time::Duration;

use tracing::{debug, error, info, info_span, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::backoff::RetryPolicy;
use crate::core::convergence::{Convergence, Transition};
use crate::core::prompt::PromptComposer;
use crate::core::scenario::TestScenario;
use crate::core::types::{
    ArtifactSet, Attempt, Diagnostic, ExecutionResult, GenerationRequest, Session, SessionOutcome,
    Verdict,
};
use crate::core::validator::validate;
use crate::error::{AbortCause, ExecutionError, OracleError, SynthesisError};
use crate::io::config::SvcgenConfig;
use crate::io::oracle::{Oracle, synthesize_with_retry};
use crate::io::sandbox::Sandbox;

/// Summary used for attempts where the oracle never produced an artifact.
pub const GENERATION_FAILED: &str = "generation failed";

/// Policy knobs of one controller. Built from [`SvcgenConfig`] by the CLI.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub retry: RetryPolicy,
    pub setup_retries: u32,
    pub identical_diagnostic_limit: u32,
    pub diagnostic_limit_bytes: usize,
    pub composer: PromptComposer,
}

impl ControllerConfig {
    pub fn from_config(cfg: &SvcgenConfig) -> Self {
        Self {
            retry: cfg.oracle.retry_policy(),
            setup_retries: cfg.sandbox.setup_retries,
            identical_diagnostic_limit: cfg.repair.identical_diagnostic_limit,
            diagnostic_limit_bytes: cfg.validator.diagnostic_limit_bytes,
            composer: cfg.prompt_composer(),
        }
    }
}

/// Successful session: the passing artifact plus the full history.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub artifact: ArtifactSet,
    pub session: Session,
}

/// Result of one attempt before it is folded into the session.
enum Step {
    Passed {
        artifact: ArtifactSet,
        execution: ExecutionResult,
    },
    Failed {
        artifact: Option<ArtifactSet>,
        execution: Option<ExecutionResult>,
        diagnostic: Diagnostic,
    },
}

/// The generate-execute-validate-repair state machine.
pub struct RepairLoop<'a, O: ?Sized, S: ?Sized> {
    oracle: &'a O,
    sandbox: &'a S,
    config: ControllerConfig,
}

impl<'a, O: Oracle + ?Sized, S: Sandbox + ?Sized> RepairLoop<'a, O, S> {
    pub fn new(oracle: &'a O, sandbox: &'a S, config: ControllerConfig) -> Self {
        Self {
            oracle,
            sandbox,
            config,
        }
    }

    /// Run one session until a candidate passes or the session stops.
    ///
    /// `on_attempt` sees every recorded attempt, in order, before the
    /// controller decides what to do next.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(session = %session_id, max_attempts, timeout_secs = timeout_per_attempt.as_secs()))]
    pub fn run<F: FnMut(&Attempt)>(
        &self,
        session_id: &str,
        description: &str,
        test_scenario: &str,
        max_attempts: u32,
        timeout_per_attempt: Duration,
        cancel: &CancelToken,
        mut on_attempt: F,
    ) -> Result<Synthesis, SynthesisError> {
        let mut session = Session::new(session_id, description, test_scenario);
        if max_attempts == 0 {
            error!("max_attempts is zero");
            return Err(aborted(
                session,
                AbortCause::Limits("max_attempts must be at least 1".to_string()),
            ));
        }
        let scenario = match TestScenario::parse(test_scenario) {
            Ok(scenario) => scenario,
            Err(err) => {
                error!(err = %err, "test scenario is unparseable");
                return Err(aborted(session, AbortCause::Scenario(err)));
            }
        };
        let mut convergence =
            Convergence::new(max_attempts, self.config.identical_diagnostic_limit);

        loop {
            if cancel.is_cancelled() {
                return Err(aborted(session, AbortCause::Cancelled));
            }
            let index = session.attempts.len() as u32;
            let _span = info_span!("attempt", index).entered();

            let request = self
                .config
                .composer
                .compose(description, test_scenario, &session.attempts);
            debug!(
                repair = request.is_repair(),
                prompt_bytes = request.prompt.len(),
                "request composed"
            );

            let step = match self.attempt(&scenario, &request, timeout_per_attempt, cancel) {
                Ok(step) => step,
                Err(cause) => {
                    error!(cause = %cause, "session aborted");
                    return Err(aborted(session, cause));
                }
            };

            let (attempt, transition) = match step {
                Step::Passed {
                    artifact,
                    execution,
                } => {
                    let attempt = Attempt {
                        index,
                        request,
                        artifact: Some(artifact.clone()),
                        execution: Some(execution),
                        verdict: Verdict::pass(),
                    };
                    on_attempt(&attempt);
                    session.attempts.push(attempt);
                    session.outcome = SessionOutcome::Succeeded;
                    info!(attempts = session.attempts.len(), "candidate passed");
                    return Ok(Synthesis { artifact, session });
                }
                Step::Failed {
                    artifact,
                    execution,
                    diagnostic,
                } => {
                    let verdict = Verdict::fail(diagnostic);
                    let transition = convergence.observe(index + 1, &verdict);
                    let attempt = Attempt {
                        index,
                        request,
                        artifact,
                        execution,
                        verdict,
                    };
                    (attempt, transition)
                }
            };

            on_attempt(&attempt);
            session.attempts.push(attempt);

            match transition {
                Transition::Retry => {
                    warn!(streak = convergence.streak(), "candidate failed, repairing");
                }
                Transition::Exhausted(reason) => {
                    session.outcome = SessionOutcome::Failed;
                    warn!(reason = %reason, "giving up");
                    return Err(SynthesisError::AttemptsExhausted {
                        session: Box::new(session),
                        reason,
                    });
                }
                // A failed verdict never converges to success.
                Transition::Succeed => {
                    debug!("ignoring success transition for a failed verdict");
                }
            }
        }
    }

    /// GENERATE, EXECUTE and VALIDATE for one request.
    fn attempt(
        &self,
        scenario: &TestScenario,
        request: &GenerationRequest,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Step, AbortCause> {
        let artifact = match synthesize_with_retry(self.oracle, request, &self.config.retry, cancel)
        {
            Ok(artifact) => artifact,
            Err(OracleError::Transient { message, .. }) => {
                warn!(error = %message, "oracle unavailable, recording failed attempt");
                return Ok(Step::Failed {
                    artifact: None,
                    execution: None,
                    diagnostic: generation_failure(self.config.retry.retries + 1, &message),
                });
            }
            Err(OracleError::Cancelled) => return Err(AbortCause::Cancelled),
            Err(err) => return Err(AbortCause::Oracle(err)),
        };
        debug!(files = artifact.len(), bytes = artifact.total_bytes(), "candidate generated");

        let execution = self.execute(&artifact, timeout, cancel)?;
        if let Some(failure) = execution.failure(timeout) {
            debug!(failure = %failure, "candidate run failed");
        }
        let verdict = validate(scenario, &execution, self.config.diagnostic_limit_bytes);
        Ok(match verdict.diagnostic {
            Some(diagnostic) if !verdict.passed => Step::Failed {
                artifact: Some(artifact),
                execution: Some(execution),
                diagnostic,
            },
            _ => Step::Passed {
                artifact,
                execution,
            },
        })
    }

    /// Run the sandbox, retrying setup failures up to `setup_retries` times.
    fn execute(
        &self,
        artifact: &ArtifactSet,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, AbortCause> {
        let mut retry = 0;
        loop {
            match self.sandbox.execute(artifact, timeout, cancel) {
                Ok(execution) => return Ok(execution),
                Err(ExecutionError::Cancelled) => return Err(AbortCause::Cancelled),
                Err(err) if retry < self.config.setup_retries => {
                    warn!(retry = retry + 1, err = %err, "sandbox setup failed, retrying");
                    if !cancel.sleep(self.config.retry.delay(retry)) {
                        return Err(AbortCause::Cancelled);
                    }
                    retry += 1;
                }
                Err(err) => return Err(AbortCause::Sandbox(err)),
            }
        }
    }
}

fn generation_failure(tries: u32, message: &str) -> Diagnostic {
    Diagnostic {
        summary: GENERATION_FAILED.to_string(),
        failing_assertions: vec![format!(
            "oracle produced no artifact after {tries} tries: {message}"
        )],
        raw_output: String::new(),
    }
}

fn aborted(mut session: Session, cause: AbortCause) -> SynthesisError {
    session.outcome = SessionOutcome::Failed;
    SynthesisError::Aborted {
        session: Box::new(session),
        cause,
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::error::{ExhaustionReason, ValidationError};
    use crate::test_support::{
        ScriptedOracle, ScriptedSandbox, exec_failed, exec_ok, syntax_broken, wrong_output,
    };

    const SCENARIO: &str = "expect: stdout contains ok";
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn config(identical_limit: u32) -> ControllerConfig {
        ControllerConfig {
            retry: RetryPolicy {
                retries: 2,
                base: Duration::from_millis(1),
                max: Duration::from_millis(2),
                jitter: false,
            },
            setup_retries: 1,
            identical_diagnostic_limit: identical_limit,
            diagnostic_limit_bytes: 2_000,
            composer: PromptComposer::new(60_000, 3, vec!["run.sh".to_string()]),
        }
    }

    fn candidate(tag: &str) -> ArtifactSet {
        ArtifactSet::new([("run.sh", format!("echo {tag}"))]).expect("artifact")
    }

    fn run(
        oracle: &ScriptedOracle,
        sandbox: &ScriptedSandbox,
        max_attempts: u32,
        identical_limit: u32,
    ) -> Result<Synthesis, SynthesisError> {
        RepairLoop::new(oracle, sandbox, config(identical_limit)).run(
            "s-test",
            "echo service",
            SCENARIO,
            max_attempts,
            TIMEOUT,
            &CancelToken::new(),
            |_| {},
        )
    }

    #[test]
    fn first_passing_attempt_succeeds() {
        let oracle = ScriptedOracle::always(candidate("a"));
        let sandbox = ScriptedSandbox::new(vec![Ok(exec_ok("ok\n"))]);
        let synthesis = run(&oracle, &sandbox, 5, 2).expect("success");

        assert_eq!(synthesis.session.attempts.len(), 1);
        assert_eq!(synthesis.session.outcome, SessionOutcome::Succeeded);
        assert_eq!(synthesis.artifact, candidate("a"));
        assert!(!oracle.requests()[0].is_repair());
    }

    #[test]
    fn repairs_until_pass_and_feeds_back_all_diagnostics() {
        let oracle = ScriptedOracle::new(vec![
            Ok(candidate("a")),
            Ok(candidate("b")),
            Ok(candidate("c")),
        ]);
        let sandbox = ScriptedSandbox::new(vec![
            Ok(exec_failed(2, "syntax error near line 1")),
            Ok(exec_failed(2, "syntax error near line 7")),
            Ok(exec_ok("ok\n")),
        ]);
        let mut seen = Vec::new();
        let synthesis = RepairLoop::new(&oracle, &sandbox, config(2))
            .run(
                "s-test",
                "echo service",
                SCENARIO,
                5,
                TIMEOUT,
                &CancelToken::new(),
                |attempt| seen.push(attempt.index),
            )
            .expect("success");

        assert_eq!(synthesis.session.attempts.len(), 3);
        assert_eq!(seen, vec![0, 1, 2]);
        let third = &oracle.requests()[2];
        assert_eq!(third.diagnostic_history.len(), 2);
        assert_eq!(third.prior_artifact, Some(candidate("b")));
        assert!(third.prompt.contains("syntax error near line 7"));
    }

    #[test]
    fn exhausts_attempt_budget() {
        let oracle = ScriptedOracle::always(candidate("a"));
        let sandbox = ScriptedSandbox::new(vec![
            Ok(exec_failed(1, "one")),
            Ok(exec_failed(1, "two")),
            Ok(exec_failed(1, "three")),
            Ok(exec_failed(1, "four")),
        ]);
        let err = run(&oracle, &sandbox, 3, 2).expect_err("exhausted");

        match &err {
            SynthesisError::AttemptsExhausted { session, reason } => {
                assert_eq!(*reason, ExhaustionReason::MaxAttempts);
                assert_eq!(session.attempts.len(), 3);
                assert_eq!(session.outcome, SessionOutcome::Failed);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.last_diagnostic().is_some());
        assert_eq!(oracle.calls(), 3);
    }

    #[test]
    fn identical_diagnostics_stop_early() {
        let oracle = ScriptedOracle::always(syntax_broken());
        let sandbox = ScriptedSandbox::new(vec![Ok(exec_failed(2, "same failure"))]);
        let err = run(&oracle, &sandbox, 10, 2).expect_err("repeated");

        match err {
            SynthesisError::AttemptsExhausted { session, reason } => {
                assert_eq!(reason, ExhaustionReason::RepeatedDiagnostic { repeats: 2 });
                assert_eq!(session.attempts.len(), 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_attempt_budget_aborts_before_generating() {
        let oracle = ScriptedOracle::always(candidate("a"));
        let sandbox = ScriptedSandbox::new(vec![Ok(exec_ok("ok\n"))]);
        let err = run(&oracle, &sandbox, 0, 2).expect_err("no budget");

        match &err {
            SynthesisError::Aborted { session, cause } => {
                assert!(matches!(cause, AbortCause::Limits(_)));
                assert!(session.attempts.is_empty());
                assert_eq!(session.outcome, SessionOutcome::Failed);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(oracle.calls(), 0);
        assert!(sandbox.runs().is_empty());
    }

    #[test]
    fn permanent_oracle_error_aborts_without_attempts() {
        let oracle = ScriptedOracle::new(vec![Err(OracleError::permanent("http 401: bad key"))]);
        let sandbox = ScriptedSandbox::new(vec![Ok(exec_ok("ok\n"))]);
        let err = run(&oracle, &sandbox, 5, 2).expect_err("aborted");

        match &err {
            SynthesisError::Aborted { session, cause } => {
                assert!(matches!(cause, AbortCause::Oracle(OracleError::Permanent { .. })));
                assert!(session.attempts.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(oracle.calls(), 1);
        assert!(sandbox.runs().is_empty());
    }

    #[test]
    fn malformed_response_aborts_after_earlier_attempts() {
        let oracle = ScriptedOracle::new(vec![
            Ok(wrong_output()),
            Err(OracleError::malformed("too many files")),
        ]);
        let sandbox = ScriptedSandbox::new(vec![Ok(exec_ok("nope\n"))]);
        let err = run(&oracle, &sandbox, 5, 2).expect_err("aborted");

        assert!(matches!(
            &err,
            SynthesisError::Aborted {
                cause: AbortCause::Oracle(OracleError::MalformedResponse { .. }),
                ..
            }
        ));
        assert_eq!(err.session().attempts.len(), 1);
    }

    #[test]
    fn transient_failures_are_retried_within_an_attempt() {
        let oracle = ScriptedOracle::new(vec![
            Err(OracleError::transient("503")),
            Err(OracleError::transient("503")),
            Ok(candidate("a")),
        ]);
        let sandbox = ScriptedSandbox::new(vec![Ok(exec_ok("ok\n"))]);
        let synthesis = run(&oracle, &sandbox, 5, 2).expect("success");

        assert_eq!(oracle.calls(), 3);
        assert_eq!(synthesis.session.attempts.len(), 1);
    }

    #[test]
    fn exhausted_transient_retries_record_a_failed_attempt() {
        let oracle = ScriptedOracle::new(vec![
            Err(OracleError::transient("connection reset")),
            Err(OracleError::transient("connection reset")),
            Err(OracleError::transient("connection reset")),
            Ok(candidate("a")),
        ]);
        let sandbox = ScriptedSandbox::new(vec![Ok(exec_ok("ok\n"))]);
        let synthesis = run(&oracle, &sandbox, 5, 2).expect("success");

        let attempts = &synthesis.session.attempts;
        assert_eq!(attempts.len(), 2);
        assert!(attempts[0].artifact.is_none());
        assert!(attempts[0].execution.is_none());
        let diagnostic = attempts[0].verdict.diagnostic.as_ref().expect("diagnostic");
        assert_eq!(diagnostic.summary, GENERATION_FAILED);
        assert!(diagnostic.failing_assertions[0].contains("after 3 tries: connection reset"));
    }

    #[test]
    fn sandbox_setup_failure_is_retried_then_aborts() {
        let oracle = ScriptedOracle::always(candidate("a"));
        let flaky = ScriptedSandbox::new(vec![
            Err(ExecutionError::setup("no space left")),
            Ok(exec_ok("ok\n")),
        ]);
        run(&oracle, &flaky, 5, 2).expect("setup retried");
        assert_eq!(flaky.runs().len(), 2);

        let broken = ScriptedSandbox::new(vec![Err(ExecutionError::setup("no space left"))]);
        let err = run(&oracle, &broken, 5, 2).expect_err("aborted");
        assert!(matches!(
            err,
            SynthesisError::Aborted {
                cause: AbortCause::Sandbox(ExecutionError::SandboxSetupFailure { .. }),
                ..
            }
        ));
        assert_eq!(broken.runs().len(), 2);
    }

    #[test]
    fn unparseable_scenario_aborts_before_generation() {
        let oracle = ScriptedOracle::always(candidate("a"));
        let sandbox = ScriptedSandbox::new(vec![Ok(exec_ok("ok\n"))]);
        let err = RepairLoop::new(&oracle, &sandbox, config(2))
            .run(
                "s-test",
                "echo service",
                "expect: stdout sings loudly",
                5,
                TIMEOUT,
                &CancelToken::new(),
                |_| {},
            )
            .expect_err("aborted");

        assert!(matches!(
            err,
            SynthesisError::Aborted {
                cause: AbortCause::Scenario(ValidationError::ScenarioUnparseable { line: 1, .. }),
                ..
            }
        ));
        assert_eq!(oracle.calls(), 0);
    }

    #[test]
    fn cancelled_session_aborts() {
        let oracle = ScriptedOracle::always(candidate("a"));
        let sandbox = ScriptedSandbox::new(vec![Ok(exec_ok("ok\n"))]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = RepairLoop::new(&oracle, &sandbox, config(2))
            .run("s-test", "d", SCENARIO, 5, TIMEOUT, &cancel, |_| {})
            .expect_err("cancelled");
        assert!(err.is_cancelled());
        assert_eq!(oracle.calls(), 0);
    }

    #[test]
    fn parallel_sessions_are_independent() {
        let sandbox = ScriptedSandbox::new(vec![Ok(exec_ok("ok\n"))]);
        thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let sandbox = &sandbox;
                    scope.spawn(move || {
                        let oracle = ScriptedOracle::always(candidate(&i.to_string()));
                        let synthesis = RepairLoop::new(&oracle, sandbox, config(2))
                            .run(
                                &format!("s-{i}"),
                                "d",
                                SCENARIO,
                                3,
                                TIMEOUT,
                                &CancelToken::new(),
                                |_| {},
                            )
                            .expect("success");
                        (i, synthesis)
                    })
                })
                .collect();
            for handle in handles {
                let (i, synthesis) = handle.join().expect("thread");
                assert_eq!(synthesis.session.id, format!("s-{i}"));
                assert_eq!(synthesis.artifact, candidate(&i.to_string()));
            }
        });
    }
}
