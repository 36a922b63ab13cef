//! `svcgen` command-line entry point.
//!
//! Parses arguments, loads `svcgen.toml`, wires the configured oracle,
//! sandbox and packager together and maps outcomes to stable exit codes.

use std::path::{Path, PathBuf};
use std::process;
use std::thread;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing::warn;

use svcgen::cancel::CancelToken;
use svcgen::core::types::Diagnostic;
use svcgen::error::{PackagingError, SynthesisError};
use svcgen::exit_codes;
use svcgen::generate::{GenerateOptions, ensure_empty_destination, generate, resolve_destination};
use svcgen::io::config::{DEFAULT_CONFIG_FILE, SvcgenConfig, load_config, write_config};
use svcgen::io::oracle::oracle_from_config;
use svcgen::io::packager::DirPackager;
use svcgen::io::process::terminate_tracked;
use svcgen::io::sandbox::ProcessSandbox;
use svcgen::logging;
use svcgen::run::run_packaged;

#[derive(Parser)]
#[command(
    name = "svcgen",
    version,
    about = "Synthesize a microservice from a description and a test scenario"
)]
struct Cli {
    /// Config file (defaults to ./svcgen.toml; missing file means defaults).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate, test and repair a service until it passes, then package it.
    Generate {
        /// Functional description of the service.
        #[arg(long)]
        description: String,
        /// Test scenario; `expect:` lines are checked against the output.
        #[arg(long)]
        test: String,
        /// Destination directory. Must be absent or empty.
        #[arg(long)]
        path: String,
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Per-attempt sandbox timeout.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Verify and execute a packaged service.
    Run {
        #[arg(long)]
        path: String,
        /// Validate the run against this scenario.
        #[arg(long)]
        test: Option<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Write the default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::INVALID
        }
    };
    process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    match cli.command {
        Command::Generate {
            description,
            test,
            path,
            max_attempts,
            timeout_secs,
        } => cmd_generate(
            &config_path,
            &description,
            &test,
            &path,
            max_attempts,
            timeout_secs,
        ),
        Command::Run {
            path,
            test,
            timeout_secs,
        } => cmd_run(&config_path, &path, test.as_deref(), timeout_secs),
        Command::Init { force } => cmd_init(&config_path, force),
    }
}

fn cmd_generate(
    config_path: &Path,
    description: &str,
    test: &str,
    path: &str,
    max_attempts: Option<u32>,
    timeout_secs: Option<u64>,
) -> Result<i32> {
    let cfg = load_config_with_overrides(config_path, max_attempts, timeout_secs)?;
    if description.trim().is_empty() {
        bail!("--description must not be empty");
    }
    let destination = resolve_destination(path)?;
    ensure_empty_destination(&destination)?;

    let oracle = match oracle_from_config(&cfg.oracle) {
        Ok(oracle) => oracle,
        Err(err) => {
            eprintln!("error: {err}");
            return Ok(exit_codes::ABORTED);
        }
    };
    let sandbox = ProcessSandbox::new(cfg.sandbox.clone());
    let packager = DirPackager::new();
    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    let options = GenerateOptions::from_config(&cfg, description, test, &destination);
    match generate(&cfg, &oracle, &sandbox, &packager, &options, &cancel) {
        Ok(outcome) => {
            eprintln!(
                "session {} passed after {} attempt(s)",
                outcome.session_id, outcome.attempts
            );
            println!("{}", outcome.destination.display());
            Ok(exit_codes::OK)
        }
        Err(err) => {
            if let Some(synthesis) = err.downcast_ref::<SynthesisError>() {
                report_failure(synthesis);
                return Ok(match synthesis {
                    _ if synthesis.is_cancelled() => exit_codes::INTERRUPTED,
                    SynthesisError::AttemptsExhausted { .. } => exit_codes::EXHAUSTED,
                    SynthesisError::Aborted { .. } => exit_codes::ABORTED,
                });
            }
            if let Some(packaging) = err.downcast_ref::<PackagingError>() {
                eprintln!("error: packaging failed: {packaging}");
                return Ok(exit_codes::INVALID);
            }
            Err(err)
        }
    }
}

fn cmd_run(
    config_path: &Path,
    path: &str,
    test: Option<&str>,
    timeout_secs: Option<u64>,
) -> Result<i32> {
    let cfg = load_config_with_overrides(config_path, None, timeout_secs)?;
    let dir = resolve_destination(path)?;
    let sandbox = ProcessSandbox::new(cfg.sandbox.clone());
    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    let report = run_packaged(
        &dir,
        &sandbox,
        test,
        cfg.sandbox.timeout(),
        cfg.validator.diagnostic_limit_bytes,
        &cancel,
    )?;
    print!("{}", report.execution.stdout);
    eprint!("{}", report.execution.stderr);

    match report.verdict {
        Some(verdict) if verdict.passed => Ok(exit_codes::OK),
        Some(verdict) => {
            if let Some(diagnostic) = &verdict.diagnostic {
                print_diagnostic(diagnostic);
            }
            Ok(exit_codes::EXHAUSTED)
        }
        None => match report.execution.failure(cfg.sandbox.timeout()) {
            None => Ok(exit_codes::OK),
            Some(failure) => {
                eprintln!("service failed: {failure}");
                Ok(exit_codes::EXHAUSTED)
            }
        },
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    write_config(config_path, &SvcgenConfig::default(), force)?;
    println!("{}", config_path.display());
    Ok(exit_codes::OK)
}

fn load_config_with_overrides(
    path: &Path,
    max_attempts: Option<u32>,
    timeout_secs: Option<u64>,
) -> Result<SvcgenConfig> {
    let mut cfg = load_config(path)?;
    if let Some(max_attempts) = max_attempts {
        cfg.repair.max_attempts = max_attempts;
    }
    if let Some(timeout_secs) = timeout_secs {
        cfg.sandbox.timeout_secs = timeout_secs;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn report_failure(err: &SynthesisError) {
    eprintln!("error: {err}");
    eprintln!("attempts: {}", err.session().attempts.len());
    if let Some(diagnostic) = err.last_diagnostic() {
        print_diagnostic(diagnostic);
    }
}

fn print_diagnostic(diagnostic: &Diagnostic) {
    eprintln!("last diagnostic: {}", diagnostic.summary);
    for assertion in &diagnostic.failing_assertions {
        eprintln!("  - {assertion}");
    }
}

/// Cancel `cancel` on the first Ctrl-C. The second kills every tracked
/// process group, removes scratch dirs and exits.
fn install_interrupt_handler(cancel: CancelToken) {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(err = %err, "failed to start signal runtime");
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            eprintln!("interrupted, stopping the current attempt");
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                // exit() skips destructors, so clean up what they would have.
                terminate_tracked(&cancel);
                process::exit(exit_codes::INTERRUPTED);
            }
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["svcgen", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
        assert!(cli.config.is_none());
    }

    #[test]
    fn parse_generate_with_overrides() {
        let cli = Cli::parse_from([
            "svcgen",
            "generate",
            "--description",
            "echo service",
            "--test",
            "expect: stdout contains ok",
            "--path",
            "out",
            "--max-attempts",
            "3",
            "--config",
            "custom.toml",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        match cli.command {
            Command::Generate {
                description,
                max_attempts,
                timeout_secs,
                ..
            } => {
                assert_eq!(description, "echo service");
                assert_eq!(max_attempts, Some(3));
                assert_eq!(timeout_secs, None);
            }
            _ => panic!("expected generate"),
        }
    }

    #[test]
    fn overrides_are_validated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("svcgen.toml");
        let cfg = load_config_with_overrides(&path, Some(2), Some(9)).expect("load");
        assert_eq!(cfg.repair.max_attempts, 2);
        assert_eq!(cfg.sandbox.timeout_secs, 9);
        assert!(load_config_with_overrides(&path, Some(0), None).is_err());
    }
}
