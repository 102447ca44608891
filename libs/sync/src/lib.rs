//! Futex-backed synchronization primitives.
//!
//! Everything in this crate bottoms out in the Linux `futex(2)` syscall: a
//! [`Futex`] is an `i32` whose waiters park in the kernel, and
//! [`RawMiniMutex`] builds a spin-free "mini-mutex" on top of it that is
//! cheap in the uncontended case (one atomic add) and fair enough for the
//! short critical sections the server core uses. The mutex plugs into
//! [`lock_api`] so the usual guard types come for free.

mod futex;
mod raw_mutex;

pub use futex::{Futex, WaitResult};
pub use raw_mutex::RawMiniMutex;

/// A mutual exclusion primitive backed by [`RawMiniMutex`].
pub type Mutex<T> = lock_api::Mutex<RawMiniMutex, T>;

/// An RAII guard for [`Mutex`].
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawMiniMutex, T>;
