//! Recoverable failures surfaced by the runtime.
//!
//! Contract violations (unlocking a mutex nobody holds, popping an empty
//! cleanup stack, joining yourself) are not represented here: they are
//! programming errors and trip an assertion. Native service failures that
//! leave the runtime unusable are logged at `fatal` and abort the process.

use thiserror::Error;

use crate::errno;

/// Errors returned by fallible runtime operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("thread creation failed: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("thread-local slots exhausted ({max} in use)")]
    SlotsExhausted { max: usize },

    #[error("thread-local slot is not usable from this thread")]
    InvalidSlot,

    #[error("timer queue worker could not be started: {0}")]
    TimerQueue(#[source] std::io::Error),

    #[error("invalid clock source \"{0}\"")]
    InvalidClockSource(String),

    #[error("cannot set thread priority {priority} (errno {errno})")]
    Priority { priority: i32, errno: i32 },

    #[error("cannot open log sink: {0}")]
    LogSink(#[source] std::io::Error),
}

impl Error {
    /// Closest `errno` value, for callers that speak the C convention.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::ThreadSpawn(err) | Self::TimerQueue(err) | Self::LogSink(err) => {
                err.raw_os_error().unwrap_or(errno::EAGAIN)
            }
            Self::SlotsExhausted { .. } => errno::EAGAIN,
            Self::InvalidSlot | Self::InvalidClockSource(_) => errno::EINVAL,
            Self::Priority { errno, .. } => *errno,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
