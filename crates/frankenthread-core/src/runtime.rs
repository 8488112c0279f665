//! The process-wide runtime context.
//!
//! A [`Runtime`] owns the static mutex registry (which also guards the
//! thread-local slot table), the address-wait service, the clock service and
//! the timer queue.
//! Everything is `const`-constructible, so the global instance needs no
//! lazy initialisation and statically initialised mutexes work before
//! [`Runtime::setup`] runs.

use crate::config::{LogSink, RuntimeConfig};
use crate::error::{Error, Result};
use crate::pthread::futex::{WaitBackend, WaitService};
use crate::pthread::mutex::StaticMutexRegistry;
use crate::pthread::tls::ThreadLocalRegistry;
use crate::time::timer::TimerQueue;
use crate::time::{ClockService, ClockSource, Tick, sleep_until_on};
use crate::trace::{self, LogEmitter, LogLevel};

pub struct Runtime {
    registry: StaticMutexRegistry,
    waits: WaitService,
    clock: ClockService,
    timers: TimerQueue,
}

static GLOBAL: Runtime = Runtime::new();

impl Runtime {
    /// A fresh, independent context.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            registry: StaticMutexRegistry::new(),
            waits: WaitService::new(),
            clock: ClockService::new(),
            timers: TimerQueue::new(),
        }
    }

    /// The context used by threads, static mutexes, semaphores and timers.
    #[must_use]
    pub fn global() -> &'static Runtime {
        &GLOBAL
    }

    #[must_use]
    pub fn registry(&self) -> &StaticMutexRegistry {
        &self.registry
    }

    #[must_use]
    pub fn waits(&self) -> &WaitService {
        &self.waits
    }

    #[must_use]
    pub fn clock(&self) -> &ClockService {
        &self.clock
    }

    pub(crate) fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    #[must_use]
    pub fn thread_locals(&self) -> ThreadLocalRegistry<'_> {
        ThreadLocalRegistry::new(&self.registry)
    }

    #[must_use]
    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    pub fn sleep_until(&self, deadline: Tick) {
        sleep_until_on(&self.clock, &self.waits, deadline);
    }

    /// Apply `config`: install the log sink, pick the wait backend, select
    /// the clock source. Call before starting threads.
    ///
    /// An unknown clock source name is fatal. Failing to open a log file is
    /// reported and leaves logging off.
    pub fn setup(&self, config: &RuntimeConfig) -> Result<ClockSource> {
        let sink = match &config.log_sink {
            LogSink::Off => None,
            LogSink::Stderr => Some(LogEmitter::to_stderr(&run_id())),
            LogSink::File(path) => Some(LogEmitter::to_file(path, &run_id()).map_err(Error::LogSink)?),
        };
        if let Some(emitter) = sink {
            trace::install(emitter.with_min_level(config.log_level));
        }

        let backend = self.waits.select_backend(config.wait_backend);
        if backend != config.wait_backend {
            trace::emit(
                LogLevel::Warn,
                "runtime",
                "wait_backend_unavailable",
                Some(serde_json::json!({
                    "requested": config.wait_backend.name(),
                    "active": backend.name(),
                })),
            );
        }

        let requested = match ClockSource::parse(&config.clock_source) {
            Ok(requested) => requested,
            Err(err) => {
                trace::emit(
                    LogLevel::Fatal,
                    "clock",
                    "invalid_clock_source",
                    Some(serde_json::json!({ "source": config.clock_source, "error": err.to_string() })),
                );
                abort_with(&err.to_string());
            }
        };
        let source = self.clock.select(requested);
        trace::emit(
            LogLevel::Info,
            "runtime",
            "setup_complete",
            Some(serde_json::json!({
                "clock_source": source.name(),
                "wait_backend": backend.name(),
                "cpus": available_cpus(),
            })),
        );
        Ok(source)
    }

    /// Flush and detach the log sink.
    pub fn teardown(&self) {
        trace::emit(LogLevel::Info, "runtime", "teardown", None);
        trace::uninstall();
    }

    /// Whether the wait backend is the native one.
    #[must_use]
    pub fn uses_native_waits(&self) -> bool {
        self.waits.backend() == WaitBackend::Native
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of CPUs available to the process.
#[must_use]
pub fn available_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

fn run_id() -> String {
    format!("pid{}", std::process::id())
}

fn abort_with(message: &str) -> ! {
    trace::uninstall();
    eprintln!("frankenthread: fatal: {message}");
    std::process::abort();
}

/// Log an unrecoverable native failure and abort the process.
pub(crate) fn fatal(component: &str, event: &str, errno: i32) -> ! {
    trace::emit(
        LogLevel::Fatal,
        component,
        event,
        Some(serde_json::json!({ "errno": errno })),
    );
    abort_with(&format!("{component}: {event} (errno {errno})"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    #[test]
    fn private_runtime_setup_selects_requested_clock() {
        let runtime = Runtime::new();
        let config = RuntimeConfig::default().with_clock_source("perf");
        assert_eq!(runtime.setup(&config).unwrap(), ClockSource::Perf);
        assert_eq!(runtime.clock().active(), Some(ClockSource::Perf));
        assert!(!runtime.uses_native_waits());
    }

    #[test]
    fn auto_selects_multimedia() {
        let runtime = Runtime::new();
        let source = runtime.setup(&RuntimeConfig::default()).unwrap();
        assert_eq!(source, ClockSource::Multimedia);
    }

    #[test]
    fn unopenable_log_file_is_reported() {
        let runtime = Runtime::new();
        let config = RuntimeConfig::default().with_log_sink(
            LogSink::File("/nonexistent-dir/for/sure/log.jsonl".into()),
            LogLevel::Info,
        );
        assert!(matches!(runtime.setup(&config), Err(Error::LogSink(_))));
    }

    #[test]
    fn cpu_count_is_positive() {
        assert!(available_cpus() >= 1);
    }
}
