//! End-to-end scenarios run against the process-wide runtime.
//!
//! Each scenario returns a short detail string on success and a failure
//! message otherwise. Scenarios spawn runtime threads, so they expect
//! [`Runtime::setup`](frankenthread_core::Runtime::setup) to have run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use frankenthread_core::pthread::futex::WaitWord;
use frankenthread_core::pthread::tls;
use frankenthread_core::trace::{self, LogLevel};
use frankenthread_core::{
    AddressWait, ClockService, ClockSource, Runtime, Semaphore, Timer, available_cpus, spawn,
    with_cleanup,
};
use parking_lot::Mutex as PlMutex;
use serde::Serialize;

use crate::stress::{MutexKind, StressConfig, run_mutex_stress};

/// Errors surfaced by the harness.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("runtime error: {0}")]
    Runtime(#[from] frankenthread_core::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown scenario: {0}")]
    UnknownScenario(String),
}

type Check = fn() -> Result<String, String>;

const SCENARIOS: &[(&str, Check)] = &[
    ("static_mutex_counter", static_mutex_counter),
    ("wake_all_releases_waiter", wake_all_releases_waiter),
    ("cancel_runs_cleanup_lifo", cancel_runs_cleanup_lifo),
    ("tls_destructors_once", tls_destructors_once),
    ("timer_rearm_fires_once", timer_rearm_fires_once),
    ("perf_clock_monotonic", perf_clock_monotonic),
];

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub passed: bool,
    pub duration_ms: u128,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub clock_source: Option<String>,
    pub native_waits: bool,
    pub cpus: usize,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<ScenarioOutcome>,
}

impl ScenarioReport {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.failed == 0
    }

    pub fn to_json(&self) -> Result<String, HarnessError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Runs the registered scenarios, optionally restricted to a subset.
pub struct ScenarioRunner {
    only: Vec<String>,
}

impl ScenarioRunner {
    /// Scenario names in run order.
    #[must_use]
    pub fn names() -> Vec<&'static str> {
        SCENARIOS.iter().map(|(name, _)| *name).collect()
    }

    /// Restrict to the named scenarios. An empty list runs everything.
    pub fn new(only: Vec<String>) -> Result<Self, HarnessError> {
        if let Some(unknown) = only
            .iter()
            .find(|name| !SCENARIOS.iter().any(|(known, _)| *known == name.as_str()))
        {
            return Err(HarnessError::UnknownScenario(unknown.clone()));
        }
        Ok(Self { only })
    }

    #[must_use]
    pub fn run(&self) -> ScenarioReport {
        let runtime = Runtime::global();
        let results: Vec<ScenarioOutcome> = SCENARIOS
            .iter()
            .filter(|(name, _)| self.only.is_empty() || self.only.iter().any(|o| o.as_str() == *name))
            .map(|&(name, check)| run_one(name, check))
            .collect();
        let passed = results.iter().filter(|r| r.passed).count();
        ScenarioReport {
            clock_source: runtime.clock().active().map(|s| s.name().to_string()),
            native_waits: runtime.uses_native_waits(),
            cpus: available_cpus(),
            total: results.len(),
            passed,
            failed: results.len() - passed,
            results,
        }
    }
}

fn run_one(name: &str, check: Check) -> ScenarioOutcome {
    let start = Instant::now();
    let outcome = check();
    let duration_ms = start.elapsed().as_millis();
    let (passed, detail) = match outcome {
        Ok(detail) => (true, detail),
        Err(detail) => (false, detail),
    };
    trace::emit(
        if passed { LogLevel::Info } else { LogLevel::Error },
        "harness",
        "scenario_result",
        Some(serde_json::json!({
            "scenario": name,
            "passed": passed,
            "duration_ms": duration_ms,
            "detail": detail,
        })),
    );
    ScenarioOutcome {
        name: name.to_string(),
        passed,
        duration_ms,
        detail,
    }
}

fn static_mutex_counter() -> Result<String, String> {
    let report = run_mutex_stress(StressConfig {
        threads: 8,
        iterations: 10_000,
        kind: MutexKind::Static,
    })
    .map_err(|err| err.to_string())?;
    if report.ok {
        Ok(format!("counter={}", report.counter))
    } else {
        Err(format!("counter={} expected={}", report.counter, report.expected))
    }
}

fn wake_all_releases_waiter() -> Result<String, String> {
    let flag = Arc::new(AtomicU32::new(0));
    let waiter = {
        let flag = Arc::clone(&flag);
        spawn(
            move || {
                let waits = Runtime::global().waits();
                while flag.load(Ordering::Acquire) == 0 {
                    waits.wait(&*flag, 0, None);
                }
                1
            },
            0,
        )
        .map_err(|err| err.to_string())?
    };
    std::thread::sleep(Duration::from_millis(20));
    let woke_at = Instant::now();
    flag.store(1, Ordering::Release);
    Runtime::global().waits().wake_all(flag.address());
    waiter.join().ok_or("waiter was cancelled")?;
    let latency = woke_at.elapsed();
    if latency < Duration::from_secs(1) {
        Ok(format!("released after {}us", latency.as_micros()))
    } else {
        Err(format!("release took {}ms", latency.as_millis()))
    }
}

static CLEANUP_ORDER: PlMutex<Vec<usize>> = PlMutex::new(Vec::new());

fn record_cleanup(tag: usize) {
    CLEANUP_ORDER.lock().push(tag);
}

fn cancel_runs_cleanup_lifo() -> Result<String, String> {
    CLEANUP_ORDER.lock().clear();
    let gate = Arc::new(Semaphore::new(0));
    let thread = {
        let gate = Arc::clone(&gate);
        spawn(
            move || {
                with_cleanup(record_cleanup, 1, || {
                    with_cleanup(record_cleanup, 2, || {
                        with_cleanup(record_cleanup, 3, || gate.wait());
                    });
                });
                0
            },
            0,
        )
        .map_err(|err| err.to_string())?
    };
    std::thread::sleep(Duration::from_millis(20));
    thread.cancel();
    if let Some(result) = thread.join() {
        return Err(format!("thread finished normally with {result}"));
    }
    let order = CLEANUP_ORDER.lock().clone();
    if order == [3, 2, 1] {
        Ok("cleanup ran 3,2,1".to_string())
    } else {
        Err(format!("cleanup order {order:?}"))
    }
}

static TLS_CALLS: AtomicUsize = AtomicUsize::new(0);

fn count_tls_destructor(_: usize) {
    TLS_CALLS.fetch_add(1, Ordering::SeqCst);
}

fn tls_destructors_once() -> Result<String, String> {
    TLS_CALLS.store(0, Ordering::SeqCst);
    let slot = tls::create(Some(count_tls_destructor)).map_err(|err| err.to_string())?;
    let mut threads = Vec::new();
    for n in 0..6usize {
        threads.push(
            spawn(
                move || {
                    // Odd threads never store a value.
                    if n % 2 == 0 {
                        let _ = slot.set(n + 1);
                    }
                    0
                },
                0,
            )
            .map_err(|err| err.to_string())?,
        );
    }
    for thread in threads {
        thread.join();
    }
    tls::destroy(slot);
    let calls = TLS_CALLS.load(Ordering::SeqCst);
    if calls == 3 {
        Ok("3 destructor calls for 3 values".to_string())
    } else {
        Err(format!("{calls} destructor calls, expected 3"))
    }
}

fn timer_rearm_fires_once() -> Result<String, String> {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let timer = Timer::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .map_err(|err| err.to_string())?;
    timer.arm(false, 50_000, 0);
    timer.arm(false, 200_000, 0);
    std::thread::sleep(Duration::from_millis(120));
    let early = fired.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(250));
    let late = fired.load(Ordering::SeqCst);
    match (early, late) {
        (0, 1) => Ok("fired once at 200ms".to_string()),
        _ => Err(format!("fired {early} by 120ms, {late} by 370ms")),
    }
}

fn perf_clock_monotonic() -> Result<String, String> {
    let clock = ClockService::new();
    clock.select(Some(ClockSource::Perf));
    let mut previous = clock.now();
    for _ in 0..100_000 {
        let reading = clock.now();
        if reading < previous {
            return Err(format!("went backwards: {previous} -> {reading}"));
        }
        previous = reading;
    }
    Ok("100000 non-decreasing readings".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_names_are_rejected() {
        assert!(matches!(
            ScenarioRunner::new(vec!["teleport".into()]),
            Err(HarnessError::UnknownScenario(name)) if name == "teleport"
        ));
    }

    #[test]
    fn filtered_run_reports_only_selected() {
        let runner = ScenarioRunner::new(vec!["perf_clock_monotonic".into()]).unwrap();
        let report = runner.run();
        assert_eq!(report.total, 1);
        assert!(report.ok(), "{report:?}");
        assert_eq!(report.results[0].name, "perf_clock_monotonic");
    }

    #[test]
    fn names_are_unique() {
        let mut names = ScenarioRunner::names();
        let count = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), count);
    }
}
