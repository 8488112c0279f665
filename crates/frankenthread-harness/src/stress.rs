//! Mutex contention stress runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use frankenthread_core::{Mutex, spawn};
use serde::Serialize;

use crate::scenarios::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutexKind {
    Static,
    Dynamic,
}

impl MutexKind {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Some(Self::Static),
            "dynamic" => Some(Self::Dynamic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StressConfig {
    pub threads: usize,
    pub iterations: u64,
    pub kind: MutexKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub kind: MutexKind,
    pub threads: usize,
    pub iterations: u64,
    pub expected: u64,
    pub counter: u64,
    pub elapsed_ms: u128,
    pub ops_per_sec: f64,
    pub ok: bool,
}

static SHARED_STATIC: Mutex = Mutex::new_static();

/// Increment a shared counter `iterations` times from each of `threads`
/// runtime threads, one lock/unlock per increment.
///
/// The counter is bumped with a relaxed load/store pair, so any lost update
/// means mutual exclusion failed.
pub fn run_mutex_stress(config: StressConfig) -> Result<StressReport, HarnessError> {
    let dynamic = Arc::new(Mutex::new());
    let counter = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let mut threads = Vec::with_capacity(config.threads);
    for _ in 0..config.threads {
        let dynamic = Arc::clone(&dynamic);
        let counter = Arc::clone(&counter);
        let iterations = config.iterations;
        let kind = config.kind;
        threads.push(spawn(
            move || {
                let mutex: &Mutex = match kind {
                    MutexKind::Static => &SHARED_STATIC,
                    MutexKind::Dynamic => &dynamic,
                };
                for _ in 0..iterations {
                    let _guard = mutex.guard();
                    let seen = counter.load(Ordering::Relaxed);
                    counter.store(seen + 1, Ordering::Relaxed);
                }
                0
            },
            0,
        )?);
    }
    for thread in threads {
        thread.join();
    }

    let elapsed = start.elapsed();
    let expected = config.iterations * config.threads as u64;
    let value = counter.load(Ordering::Relaxed);
    let seconds = elapsed.as_secs_f64();
    Ok(StressReport {
        kind: config.kind,
        threads: config.threads,
        iterations: config.iterations,
        expected,
        counter: value,
        elapsed_ms: elapsed.as_millis(),
        ops_per_sec: if seconds > 0.0 {
            expected as f64 / seconds
        } else {
            0.0
        },
        ok: value == expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_runs_keep_every_increment() {
        for kind in [MutexKind::Static, MutexKind::Dynamic] {
            let report = run_mutex_stress(StressConfig {
                threads: 4,
                iterations: 2_000,
                kind,
            })
            .unwrap();
            assert!(report.ok, "{report:?}");
            assert_eq!(report.counter, 8_000);
        }
    }

    #[test]
    fn kind_parses_loosely() {
        assert_eq!(MutexKind::from_str_loose(" Static "), Some(MutexKind::Static));
        assert_eq!(MutexKind::from_str_loose("dynamic"), Some(MutexKind::Dynamic));
        assert_eq!(MutexKind::from_str_loose("spin"), None);
    }
}
