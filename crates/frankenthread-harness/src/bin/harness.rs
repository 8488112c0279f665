//! CLI entrypoint for the frankenthread harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use frankenthread_core::config::LogSink;
use frankenthread_core::trace::{self, LogLevel};
use frankenthread_core::{Runtime, RuntimeConfig, WaitBackend};
use frankenthread_harness::stress::run_mutex_stress;
use frankenthread_harness::{MutexKind, ScenarioRunner, StressConfig, clock_sources};

/// Scenario and stress tooling for frankenthread.
#[derive(Debug, Parser)]
#[command(name = "frankenthread-harness")]
#[command(about = "Scenario and stress harness for the frankenthread runtime")]
struct Cli {
    /// Clock source to select (overrides FRANKENTHREAD_CLOCK_SOURCE).
    #[arg(long, global = true)]
    clock_source: Option<String>,
    /// Wait backend: `emulated` or `native` (overrides FRANKENTHREAD_WAIT_BACKEND).
    #[arg(long, global = true)]
    wait_backend: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the selectable clock sources.
    ClockSources {
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Hammer one mutex from many threads and report throughput.
    Stress {
        /// Worker threads (defaults to the CPU count, at least 2).
        #[arg(long)]
        threads: Option<usize>,
        /// Lock/unlock rounds per thread.
        #[arg(long, default_value_t = 100_000)]
        iterations: u64,
        /// Mutex flavour: `static` or `dynamic`.
        #[arg(long, default_value = "static")]
        mutex: String,
    },
    /// Run the end-to-end scenarios and print a JSON report.
    Scenarios {
        /// Append structured log entries to this JSONL file.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Run only the named scenario (repeatable).
        #[arg(long)]
        only: Vec<String>,
        /// List scenario names and exit.
        #[arg(long)]
        list: bool,
    },
    /// Check a structured JSONL log against the log schema.
    ValidateLog {
        /// JSONL log path.
        #[arg(long)]
        log: PathBuf,
    },
}

fn runtime_config(cli: &Cli, log: Option<&PathBuf>) -> Result<RuntimeConfig, String> {
    let mut config = RuntimeConfig::from_env();
    if let Some(source) = &cli.clock_source {
        config = config.with_clock_source(source.clone());
    }
    if let Some(raw) = &cli.wait_backend {
        let backend = WaitBackend::from_str_loose(raw)
            .ok_or_else(|| format!("unknown wait backend: {raw}"))?;
        config = config.with_wait_backend(backend);
    }
    if let Some(path) = log {
        config = config.with_log_sink(LogSink::File(path.clone()), LogLevel::Debug);
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match &cli.command {
        Command::ClockSources { json } => {
            let rows = clock_sources::rows();
            if *json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print!("{}", clock_sources::render_plain(&rows));
            }
        }
        Command::Stress {
            threads,
            iterations,
            mutex,
        } => {
            let kind = MutexKind::from_str_loose(mutex)
                .ok_or_else(|| format!("unknown mutex flavour: {mutex}"))?;
            let config = runtime_config(&cli, None)?;
            Runtime::global().setup(&config)?;
            let threads = threads.unwrap_or_else(|| frankenthread_core::available_cpus().max(2));
            let report = run_mutex_stress(StressConfig {
                threads,
                iterations: *iterations,
                kind,
            })?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Runtime::global().teardown();
            if !report.ok {
                return Err(format!(
                    "lost updates: counter {} expected {}",
                    report.counter, report.expected
                )
                .into());
            }
        }
        Command::Scenarios { log, only, list } => {
            if *list {
                for name in ScenarioRunner::names() {
                    println!("{name}");
                }
                return Ok(());
            }
            let runner = ScenarioRunner::new(only.clone())?;
            let config = runtime_config(&cli, log.as_ref())?;
            Runtime::global().setup(&config)?;
            let report = runner.run();
            println!("{}", report.to_json()?);
            Runtime::global().teardown();
            if !report.ok() {
                return Err(format!("{} of {} scenarios failed", report.failed, report.total).into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = trace::validate_log_file(log)?;
            let summary = serde_json::json!({
                "lines": lines,
                "ok": errors.is_empty(),
                "errors": errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !errors.is_empty() {
                return Err(format!("{} invalid log fields", errors.len()).into());
            }
        }
    }
    Ok(())
}
