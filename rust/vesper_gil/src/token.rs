use std::fmt::{Debug, Formatter};
use std::ptr::NonNull;

/// Identity of a thread competing for the execution lock.
///
/// A token wraps the address of the caller's thread-state and is only ever
/// compared for equality with the identity of the previous holder; the lock
/// never dereferences it. Two threads must not share a token.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadToken(NonNull<()>);

impl ThreadToken {
    /// Constructs a token from a raw thread-state address.
    #[inline]
    pub fn new(state: NonNull<()>) -> Self {
        Self(state)
    }

    /// Constructs the token identifying `state`.
    ///
    /// The token remains a valid identity for as long as `state` is neither
    /// moved nor dropped.
    #[inline]
    pub fn of<T>(state: &T) -> Self {
        Self(NonNull::from(state).cast())
    }

    /// The raw address backing the token.
    #[inline]
    pub fn as_ptr(self) -> *mut () {
        self.0.as_ptr()
    }
}

// SAFETY: The wrapped address is an opaque identity that is compared, never
// dereferenced.
unsafe impl Send for ThreadToken {}

// SAFETY: See the `Send` implementation.
unsafe impl Sync for ThreadToken {}

impl Debug for ThreadToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ThreadToken({:p})", self.0)
    }
}

/// Asynchronous-signal services consulted when the lock changes hands.
///
/// The lock treats thread identities as opaque; whether an identity carries
/// a pending signal marker is knowledge only the surrounding runtime has.
/// A hook is installed through [`Builder::signal_hook`](crate::Builder::signal_hook).
pub trait SignalHook: Send + Sync {
    /// Whether the thread identified by `token` has an asynchronous signal
    /// queued.
    fn pending(&self, token: ThreadToken) -> bool;

    /// Invoked by the fresh holder at the end of a successful acquisition
    /// whenever [`pending`](SignalHook::pending) reports a queued signal.
    fn notify(&self);
}
