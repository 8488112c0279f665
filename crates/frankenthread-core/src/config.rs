//! Runtime configuration.
//!
//! Read once from the environment by [`RuntimeConfig::from_env`] and applied
//! by [`Runtime::setup`](crate::Runtime::setup):
//!
//! - `FRANKENTHREAD_CLOCK_SOURCE`: `auto` (or empty), `interrupt`, `tick`,
//!   `multimedia`, `perf` or `wall`. An unknown name is fatal at setup.
//! - `FRANKENTHREAD_WAIT_BACKEND`: `emulated` (default) or `native`.
//! - `FRANKENTHREAD_LOG`: `off` (default), `stderr`, or a file path to append
//!   JSONL entries to.
//! - `FRANKENTHREAD_LOG_LEVEL`: minimum level written, default `info`.

use std::path::PathBuf;

use crate::pthread::futex::WaitBackend;
use crate::trace::LogLevel;

pub const CLOCK_SOURCE_ENV: &str = "FRANKENTHREAD_CLOCK_SOURCE";
pub const WAIT_BACKEND_ENV: &str = "FRANKENTHREAD_WAIT_BACKEND";
pub const LOG_ENV: &str = "FRANKENTHREAD_LOG";
pub const LOG_LEVEL_ENV: &str = "FRANKENTHREAD_LOG_LEVEL";

/// Where structured log entries go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LogSink {
    #[default]
    Off,
    Stderr,
    File(PathBuf),
}

impl LogSink {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "off" | "none" | "0" | "false" => Self::Off,
            "stderr" | "-" | "1" | "true" => Self::Stderr,
            _ => Self::File(PathBuf::from(trimmed)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Clock source name as configured; parsed at setup.
    pub clock_source: String,
    pub wait_backend: WaitBackend,
    pub log_sink: LogSink,
    pub log_level: LogLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            clock_source: String::new(),
            wait_backend: WaitBackend::Emulated,
            log_sink: LogSink::Off,
            log_level: LogLevel::Info,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable backend or level
    /// values fall back to the defaults.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            clock_source: lookup(CLOCK_SOURCE_ENV).unwrap_or_default(),
            wait_backend: lookup(WAIT_BACKEND_ENV)
                .and_then(|raw| WaitBackend::from_str_loose(&raw))
                .unwrap_or(defaults.wait_backend),
            log_sink: lookup(LOG_ENV)
                .map(|raw| LogSink::from_str_loose(&raw))
                .unwrap_or(defaults.log_sink),
            log_level: lookup(LOG_LEVEL_ENV)
                .and_then(|raw| LogLevel::from_str_loose(&raw))
                .unwrap_or(defaults.log_level),
        }
    }

    #[must_use]
    pub fn with_clock_source(mut self, name: impl Into<String>) -> Self {
        self.clock_source = name.into();
        self
    }

    #[must_use]
    pub fn with_wait_backend(mut self, backend: WaitBackend) -> Self {
        self.wait_backend = backend;
        self
    }

    #[must_use]
    pub fn with_log_sink(mut self, sink: LogSink, level: LogLevel) -> Self {
        self.log_sink = sink;
        self.log_level = level;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(RuntimeConfig::from_lookup(lookup(&[])), RuntimeConfig::default());
    }

    #[test]
    fn all_keys_are_read() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (CLOCK_SOURCE_ENV, "perf"),
            (WAIT_BACKEND_ENV, "native"),
            (LOG_ENV, "/tmp/ft.jsonl"),
            (LOG_LEVEL_ENV, "debug"),
        ]));
        assert_eq!(config.clock_source, "perf");
        assert_eq!(config.wait_backend, WaitBackend::Native);
        assert_eq!(config.log_sink, LogSink::File(PathBuf::from("/tmp/ft.jsonl")));
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn bad_values_fall_back() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (WAIT_BACKEND_ENV, "carrier-pigeon"),
            (LOG_LEVEL_ENV, "shouty"),
            (LOG_ENV, "STDERR"),
        ]));
        assert_eq!(config.wait_backend, WaitBackend::Emulated);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.log_sink, LogSink::Stderr);
    }

    #[test]
    fn clock_source_is_kept_verbatim() {
        let config = RuntimeConfig::from_lookup(lookup(&[(CLOCK_SOURCE_ENV, "sundial")]));
        assert_eq!(config.clock_source, "sundial");
    }
}
