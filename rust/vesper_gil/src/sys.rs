//! Platform shims.

/// Saves the ambient OS error indicator and restores it when dropped.
///
/// The timed waits inside the acquire path may go through syscalls that
/// clobber `errno`; the lock is required to be transparent to the error
/// state of the calling thread.
pub(crate) struct ErrnoGuard {
    #[cfg(unix)]
    saved: i32,
}

impl ErrnoGuard {
    pub(crate) fn save() -> Self {
        Self {
            #[cfg(unix)]
            // SAFETY: `errno` is thread-local and always valid to read.
            saved: unsafe { *errno_location() },
        }
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: `errno` is thread-local and always valid to write.
        unsafe {
            *errno_location() = self.saved;
        }
    }
}

#[cfg(target_os = "linux")]
fn errno_location() -> *mut i32 {
    // SAFETY: Infallible; returns the calling thread's `errno` slot.
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn errno_location() -> *mut i32 {
    // SAFETY: Infallible; returns the calling thread's `errno` slot.
    unsafe { libc::__error() }
}

#[cfg(all(
    unix,
    not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd"
    ))
))]
fn errno_location() -> *mut i32 {
    // SAFETY: Infallible; returns the calling thread's `errno` slot.
    unsafe { libc::__errno() }
}
