//! Calling-thread `errno` access.
//!
//! Thread-local slot accessors must leave the caller's last-error value
//! untouched; [`ErrnoGuard`] snapshots it and puts it back on drop.

pub const EPERM: i32 = libc::EPERM;
pub const ESRCH: i32 = libc::ESRCH;
pub const EAGAIN: i32 = libc::EAGAIN;
pub const ENOMEM: i32 = libc::ENOMEM;
pub const EBUSY: i32 = libc::EBUSY;
pub const EINVAL: i32 = libc::EINVAL;
pub const ENOSYS: i32 = libc::ENOSYS;
pub const ETIMEDOUT: i32 = libc::ETIMEDOUT;

/// Read the calling thread's `errno`.
#[must_use]
pub fn get() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Overwrite the calling thread's `errno`.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn set(value: i32) {
    // SAFETY: __errno_location always returns a valid pointer to the
    // calling thread's errno.
    unsafe { *libc::__errno_location() = value };
}

/// Overwrite the calling thread's `errno`.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub fn set(value: i32) {
    // SAFETY: __error always returns a valid pointer to the calling
    // thread's errno.
    unsafe { *libc::__error() = value };
}

/// Overwrite the calling thread's `errno`.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
)))]
pub fn set(_value: i32) {}

/// Restores the `errno` observed at construction when dropped.
#[derive(Debug)]
pub struct ErrnoGuard {
    saved: i32,
}

impl ErrnoGuard {
    #[must_use]
    pub fn new() -> Self {
        Self { saved: get() }
    }

    /// The value that will be restored.
    #[must_use]
    pub fn saved(&self) -> i32 {
        self.saved
    }
}

impl Default for ErrnoGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        set(self.saved);
    }
}

#[cfg(all(test, any(target_os = "linux", target_os = "android")))]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_errno() {
        set(EBUSY);
        {
            let guard = ErrnoGuard::new();
            assert_eq!(guard.saved(), EBUSY);
            set(EINVAL);
            assert_eq!(get(), EINVAL);
        }
        assert_eq!(get(), EBUSY);
    }
}
