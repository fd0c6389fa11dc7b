use crate::sys::ErrnoGuard;
use crate::token::{SignalHook, ThreadToken};
use atomic::Atomic;
use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};
use std::fmt::{Debug, Formatter};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::time::Duration;

/// Ownership state of the lock.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum LockState {
    /// [`Gil::init`] has not run yet.
    Uninitialized,
    /// No thread holds the lock.
    Free,
    /// Exactly one thread holds the lock.
    Held,
}

/// A builder for a [`Gil`].
pub struct Builder {
    interval_us: u64,
    force_switching: bool,
    hook: Option<Box<dyn SignalHook>>,
}

impl Builder {
    /// Default switch interval, in microseconds.
    pub const DEFAULT_SWITCH_INTERVAL: u64 = 5000;

    /// Creates a new builder with the default settings.
    #[inline]
    pub fn new() -> Self {
        Self {
            interval_us: Self::DEFAULT_SWITCH_INTERVAL,
            force_switching: true,
            hook: None,
        }
    }

    /// Changes the initial switch interval, in microseconds.
    ///
    /// The value is stored as given; a wait clamps it to at least one
    /// microsecond when it is used.
    #[inline]
    pub fn switch_interval(mut self, microseconds: u64) -> Self {
        self.interval_us = microseconds;
        self
    }

    /// Enables or disables forced switching.
    ///
    /// With forced switching disabled, mutual exclusion and progress still
    /// hold, but a releasing thread may immediately reacquire the lock on a
    /// fast core, lengthening the timeslice observed by waiters.
    #[inline]
    pub fn force_switching(mut self, enabled: bool) -> Self {
        self.force_switching = enabled;
        self
    }

    /// Installs the asynchronous-signal hook.
    #[inline]
    pub fn signal_hook(mut self, hook: impl SignalHook + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Builds the lock with the provided settings.
    ///
    /// The lock starts out uninitialized; call [`Gil::init`] before the
    /// first acquisition.
    #[inline]
    pub fn build(self) -> Gil {
        Gil {
            state: Atomic::new(LockState::Uninitialized),
            last_holder: AtomicPtr::new(ptr::null_mut()),
            switch_count: AtomicU64::new(0),
            yield_request: AtomicBool::new(false),
            interval_us: AtomicU64::new(self.interval_us),
            force_switching: self.force_switching,
            hook: self.hook,
            station: Mutex::new(()),
            released: Condvar::new(),
            barrier: Mutex::new(()),
            switched: Condvar::new(),
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Builder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("interval_us", &self.interval_us)
            .field("force_switching", &self.force_switching)
            .finish_non_exhaustive()
    }
}

/// The global execution lock.
///
/// The lock consists of four cooperating pieces: the ownership state below,
/// a wait station where aspirants block until a release, a handoff barrier
/// where a releaser awaits its successor, and the yield request polled by
/// the holder. See the crate documentation for the overall protocol.
pub struct Gil {
    /// Ownership tri-state. Written only while `station` is held; readable
    /// anywhere, possibly stale.
    state: Atomic<LockState>,
    /// Identity of the thread that last completed an acquisition. Written
    /// only while `barrier` is held.
    last_holder: AtomicPtr<()>,
    /// Ownership transfers between distinct identities. Written while both
    /// `station` and `barrier` are held.
    switch_count: AtomicU64,
    /// Polled by the holder without a lock. The acquire path only writes it
    /// while `station` is held; external callers may set it from anywhere.
    yield_request: AtomicBool,
    /// Switch interval in microseconds. Re-read on every turn of the wait
    /// loop, so changes apply to waits already in progress.
    interval_us: AtomicU64,
    force_switching: bool,
    hook: Option<Box<dyn SignalHook>>,
    /// Wait station: aspirants block here until the lock is released.
    station: Mutex<()>,
    released: Condvar,
    /// Handoff barrier: a releaser blocks here until a successor takes over.
    barrier: Mutex<()>,
    switched: Condvar,
}

impl Gil {
    /// Creates an uninitialized lock with the default settings.
    #[inline]
    pub fn new() -> Self {
        Builder::new().build()
    }

    /// Whether [`init`](Gil::init) has run.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.state.load(Ordering::Relaxed) != LockState::Uninitialized
    }

    /// Prepares the lock for use.
    ///
    /// Must run before the first acquisition. Calling it on an initialized
    /// lock is a no-op; starting over after a fork goes through
    /// [`reinit`](Gil::reinit).
    pub fn init(&mut self) {
        if self.is_initialized() {
            return;
        }
        self.reinit();
    }

    /// Unconditionally recreates the lock.
    ///
    /// Meant for the child of a fork, where primitives inherited from the
    /// parent must not be reused. Exclusive access encodes the requirement
    /// that no other thread exists at this point. The switch interval
    /// survives reinitialization.
    pub fn reinit(&mut self) {
        debug!("Recreating the execution lock");
        self.station = Mutex::new(());
        self.released = Condvar::new();
        self.barrier = Mutex::new(());
        self.switched = Condvar::new();
        self.state.store(LockState::Free, Ordering::Relaxed);
        self.last_holder.store(ptr::null_mut(), Ordering::Relaxed);
        self.switch_count.store(0, Ordering::Relaxed);
        self.yield_request.store(false, Ordering::Relaxed);
    }

    /// Blocks until the calling thread owns the lock.
    ///
    /// `token` identifies the calling thread and is only compared with the
    /// identity of the previous holder. A waiter whose timed wait elapses a
    /// full switch interval without an ownership change raises the yield
    /// request before waiting again. The ambient OS error indicator is
    /// preserved across the call.
    ///
    /// # Panics
    ///
    /// Panics if the lock is uninitialized.
    pub fn acquire(&self, token: ThreadToken) {
        let _errno = ErrnoGuard::save();
        let mut station = self.station.lock();

        if self.state.load(Ordering::Relaxed) == LockState::Uninitialized {
            error!("Attempted to acquire the execution lock before initialization");
            panic!("the execution lock is not initialized");
        }

        while self.state.load(Ordering::Relaxed) == LockState::Held {
            let saved_switches = self.switch_count.load(Ordering::Relaxed);
            let timed_out = self
                .released
                .wait_for(&mut station, self.effective_interval())
                .timed_out();

            // A full interval elapsed and ownership never moved; prod the
            // holder to give the lock up at its next safe point.
            if timed_out
                && self.state.load(Ordering::Relaxed) == LockState::Held
                && self.switch_count.load(Ordering::Relaxed) == saved_switches
            {
                trace!("No switch for a full interval, requesting a yield");
                self.request_yield();
            }
        }

        {
            // The barrier must be held while `last_holder` changes, so a
            // releaser waiting for the handoff observes the new holder
            // together with the signal.
            let _barrier = self.barrier.lock();
            self.state.store(LockState::Held, Ordering::Relaxed);
            if self.last_holder.load(Ordering::Relaxed) != token.as_ptr() {
                self.last_holder.store(token.as_ptr(), Ordering::Relaxed);
                self.switch_count.fetch_add(1, Ordering::Relaxed);
            }
            self.switched.notify_one();
        }

        // Any pending request targeted the previous holder.
        if self.yield_requested() {
            self.clear_yield_request();
        }
        if let Some(hook) = &self.hook {
            if hook.pending(token) {
                hook.notify();
            }
        }

        drop(station);
    }

    /// Releases the lock.
    ///
    /// When `token` is given it must identify the holder. When forced
    /// switching is enabled and a yield was requested, the call does not
    /// return until some other thread has taken ownership, so the releaser
    /// cannot win the race to retake the lock from the threads it was asked
    /// to yield to.
    ///
    /// # Panics
    ///
    /// Panics if the lock is not held, or if `token` does not match the
    /// holder's identity.
    pub fn release(&self, token: Option<ThreadToken>) {
        if self.state.load(Ordering::Relaxed) != LockState::Held {
            error!("Attempted to release the execution lock while it is not held");
            panic!("the execution lock is not held");
        }
        let me = token.map_or(ptr::null_mut(), ThreadToken::as_ptr);
        if token.is_some() && me != self.last_holder.load(Ordering::Relaxed) {
            error!("Thread identity does not match the holder of the execution lock");
            panic!("the execution lock is held by another thread");
        }

        {
            let station = self.station.lock();
            self.state.store(LockState::Free, Ordering::Relaxed);
            self.released.notify_one();
            drop(station);
        }

        if self.force_switching && self.yield_requested() {
            let mut barrier = self.barrier.lock();
            // Not switched yet; wait until a successor has published itself.
            while self.last_holder.load(Ordering::Relaxed) == me {
                trace!("Waiting for a successor to take the execution lock");
                self.switched.wait(&mut barrier);
            }
        }
    }

    /// Asks the holder to release the lock at its next safe point.
    ///
    /// Raised internally by aspirants whose timed wait elapsed without an
    /// ownership change; external code (signal delivery, for instance) may
    /// raise it as well.
    #[inline]
    pub fn request_yield(&self) {
        self.yield_request.store(true, Ordering::Relaxed);
    }

    /// Clears the yield request.
    #[inline]
    pub fn clear_yield_request(&self) {
        self.yield_request.store(false, Ordering::Relaxed);
    }

    /// Whether a yield has been requested.
    ///
    /// Takes no lock; cheap enough to poll between every unit of
    /// interpreted work. The read may lag a writer by at most a memory
    /// fence, which delays the yield by one quantum in the worst case.
    #[inline]
    pub fn yield_requested(&self) -> bool {
        self.yield_request.load(Ordering::Relaxed)
    }

    /// Changes the switch interval, in microseconds.
    ///
    /// Takes effect on the next turn of any wait loop already in progress.
    #[inline]
    pub fn set_switch_interval(&self, microseconds: u64) {
        self.interval_us.store(microseconds, Ordering::Relaxed);
    }

    /// The switch interval as last set, in microseconds.
    #[inline]
    pub fn switch_interval(&self) -> u64 {
        self.interval_us.load(Ordering::Relaxed)
    }

    /// Number of ownership transfers between distinct thread identities.
    ///
    /// A thread reacquiring the lock after its own release does not count
    /// as a transfer.
    #[inline]
    pub fn switch_count(&self) -> u64 {
        self.switch_count.load(Ordering::Relaxed)
    }

    /// Identity of the thread that last completed an acquisition, if any.
    ///
    /// May be stale unless the caller is the holder.
    #[inline]
    pub fn last_holder(&self) -> Option<ThreadToken> {
        NonNull::new(self.last_holder.load(Ordering::Relaxed)).map(ThreadToken::new)
    }

    /// Whether some thread currently holds the lock.
    ///
    /// May be stale by the time the caller acts on it.
    #[inline]
    pub fn is_held(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LockState::Held
    }

    /// The wait duration in use, clamped to at least one microsecond.
    #[inline]
    fn effective_interval(&self) -> Duration {
        Duration::from_micros(self.switch_interval().max(1))
    }
}

impl Default for Gil {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Gil {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gil")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("last_holder", &self.last_holder())
            .field("switch_count", &self.switch_count())
            .field("yield_request", &self.yield_requested())
            .field("switch_interval_us", &self.switch_interval())
            .field("force_switching", &self.force_switching)
            .finish_non_exhaustive()
    }
}
