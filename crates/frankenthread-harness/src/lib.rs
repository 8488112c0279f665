//! Scenario and stress harness for frankenthread.
//!
//! This crate provides:
//! - Scenarios: end-to-end checks of the runtime's concurrency contracts
//!   (mutual exclusion, prompt wakeups, cancellation cleanup, thread-local
//!   destructors, timer re-arming, clock monotonicity)
//! - Stress runs: sized mutex contention with throughput figures
//! - Clock source listing for configuration front ends
//! - Structured log validation (via `frankenthread_core::trace`)

#![forbid(unsafe_code)]

pub mod clock_sources;
pub mod scenarios;
pub mod stress;

pub use scenarios::{HarnessError, ScenarioOutcome, ScenarioReport, ScenarioRunner};
pub use stress::{MutexKind, StressConfig, StressReport};
