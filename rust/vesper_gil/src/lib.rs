//! Global execution lock of the vesper interpreter runtime.
//!
//! At most one thread at a time may execute interpreted work; all shared
//! runtime state is implicitly protected by this single lock. A thread that
//! wants to run blocks in [`Gil::acquire`] until the current holder calls
//! [`Gil::release`]. Between units of work the holder polls
//! [`Gil::yield_requested`], a lock-free flag raised by aspirants whose
//! timed wait elapsed a full switch interval without the lock changing
//! hands, and drops the lock at its next safe point when the flag is set.
//!
//! Releasing is not enough to guarantee a switch on a multiprocessor: the
//! releasing thread may win the race to reacquire before any waiter is
//! scheduled. When a yield was requested, the releaser therefore rendezvous
//! with its successor and only returns from [`Gil::release`] once another
//! thread has taken ownership. This forced switching is a policy, not a
//! correctness requirement, and can be disabled through the [`Builder`].
//!
//! ```
//! use vesper_gil::{Gil, ThreadToken};
//!
//! let mut gil = Gil::new();
//! gil.init();
//!
//! let state = 0u8;
//! let me = ThreadToken::of(&state);
//! gil.acquire(me);
//! // Interpreted work happens here; poll `gil.yield_requested()`
//! // between units and release at the next safe point.
//! gil.release(Some(me));
//! assert_eq!(gil.switch_count(), 1);
//! ```
#![warn(
    missing_docs,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]

mod gil;
mod sys;
mod token;

pub use gil::{Builder, Gil};
pub use token::{SignalHook, ThreadToken};
