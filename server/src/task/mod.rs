//! Tasks: the unit of cooperative execution.
//!
//! A task is a flag word, a priority, bookkeeping for the scheduler and the
//! timer wheel, an optional socket half, and the capability record that does
//! the actual work — a boxed [`TaskHandler`] dispatched once per slice. Type
//! erasure through the trait object keeps the scheduler generic over every
//! task kind (listener, connection, log writer, allocator flusher, ...).
//!
//! Ownership: the scheduler logically owns a task while it is
//! `Queued|Running`, the timer wheel while `OnTimer`, otherwise the creator;
//! the `Arc` makes each of those a real reference. After a hard termination
//! the last reference is dropped through RCU, so no thread can still be
//! holding a stale pointer from the epoll array or a queue.

mod state;
mod states;
mod transition;

use crate::logging::RequestCtx;
use crate::socket::SockState;
use core::sync::atomic::{AtomicU8, AtomicU16, Ordering};
use smallvec::SmallVec;
use std::sync::Arc;
use sync::Mutex;

pub use state::{ExecutedOutcome, RunnableOutcome, TaskFlags, TaskState};
pub use states::{StateFn, StateResult, StatesMachine};
pub use transition::TransitionTask;

/// Index of a worker thread; 0 is the main thread, workers start at 1.
pub type ThreadNum = u16;

pub type TaskRef = Arc<SrvTask>;

/// The work a task performs, one cooperative slice at a time.
///
/// A slice must be short and must not block; to continue later, arrange a
/// wake-up (`set_runnable`, `run_after`, or socket readiness) and return.
pub trait TaskHandler: Send {
    fn execute_slice(&mut self, task: &TaskRef, thr_num: ThreadNum);
}

pub struct SrvTask {
    pub(crate) state: TaskState,
    priority: AtomicU8,
    pub(crate) last_thread: AtomicU16,
    /// Stack of diagnostic contexts for nested requests; the top is the
    /// context current log records attach to.
    pub(crate) diag: Mutex<SmallVec<[Arc<RequestCtx>; 2]>>,
    /// Back-reference to this task's ticket in the timer wheel. Guarded by
    /// the wheel's lock; `ON_TIMER` is the source of truth.
    pub(crate) timer_ticket: Mutex<Option<Arc<crate::timers::TimerTicket>>>,
    /// Socket half, present only on connection tasks.
    pub(crate) sock: Option<SockState>,
    /// The capability record. Locked for the duration of a slice; the
    /// Running bit guarantees the lock is uncontended.
    handler: Mutex<Box<dyn TaskHandler>>,
}

impl SrvTask {
    pub fn new(handler: Box<dyn TaskHandler>) -> TaskRef {
        Arc::new(Self {
            state: TaskState::new(),
            priority: AtomicU8::new(1),
            last_thread: AtomicU16::new(0),
            diag: Mutex::new(SmallVec::new()),
            timer_ticket: Mutex::new(None),
            sock: None,
            handler: Mutex::new(handler),
        })
    }

    pub(crate) fn new_socket(handler: Box<dyn TaskHandler>, sock: SockState) -> TaskRef {
        Arc::new(Self {
            state: TaskState::new(),
            priority: AtomicU8::new(1),
            last_thread: AtomicU16::new(0),
            diag: Mutex::new(SmallVec::new()),
            timer_ticket: Mutex::new(None),
            sock: Some(sock),
            handler: Mutex::new(handler),
        })
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, prty: u8) {
        self.priority.store(prty.max(1), Ordering::Relaxed);
    }

    pub(crate) fn sock(&self) -> Option<&SockState> {
        self.sock.as_ref()
    }

    pub fn flags(&self) -> TaskFlags {
        self.state.load()
    }

    /// Requests another slice: marks the task runnable (if mid-slice) or
    /// places it on a thread's queue. Cancels a pending timer either way.
    pub fn set_runnable(self: &Arc<Self>) {
        match self.state.transition_to_runnable() {
            RunnableOutcome::Ignored => {}
            RunnableOutcome::MarkedRunnable(new_flags) => {
                crate::timers::remove_task_from_timer(self, new_flags);
            }
            RunnableOutcome::Queue(new_flags) => {
                crate::timers::remove_task_from_timer(self, new_flags);
                crate::scheduler::queue_runnable_task(self);
            }
        }
    }

    /// Arranges a wake-up `delay_sec` seconds from now. No-op while the
    /// task already has a wake-up pending; immediate during shutdown.
    pub fn run_after(self: &Arc<Self>, delay_sec: u64) {
        crate::timers::run_after(self, delay_sec);
    }

    /// Requests termination. Plain tasks terminate hard; socket tasks close
    /// their descriptor and terminate softly so the socket list can sweep
    /// them out.
    pub fn terminate(self: &Arc<Self>) {
        if let Some(sock) = &self.sock {
            sock.close_on_owner(self);
            crate::scheduler::mark_task_terminated(self, false);
        } else {
            crate::scheduler::mark_task_terminated(self, true);
        }
    }

    pub fn create_new_diag_ctx(&self) {
        self.set_diag_ctx(Arc::new(RequestCtx::new()));
    }

    pub fn set_diag_ctx(&self, ctx: Arc<RequestCtx>) {
        self.diag.lock().push(ctx);
    }

    pub fn diag_ctx(&self) -> Option<Arc<RequestCtx>> {
        self.diag.lock().last().cloned()
    }

    pub fn release_diag_ctx(&self) {
        let popped = self.diag.lock().pop();
        debug_assert!(popped.is_some(), "release_diag_ctx with empty stack");
    }

    /// One slice: socket tasks run through the socket engine's wrapper
    /// (flush/proxy interlock), plain tasks dispatch the handler directly.
    pub(crate) fn run_slice(self: &Arc<Self>, thr_num: ThreadNum) {
        if self.sock.is_some() {
            crate::socket::internal_run_slice(self, thr_num);
        } else {
            self.execute_handler(thr_num);
        }
    }

    /// Dispatches the capability record. Only the slice protocol calls this;
    /// the Running bit makes the handler lock uncontended.
    pub(crate) fn execute_handler(self: &Arc<Self>, thr_num: ThreadNum) {
        let mut handler = self.handler.lock();
        handler.execute_slice(self, thr_num);
    }
}

impl Drop for SrvTask {
    fn drop(&mut self) {
        if let Some(sock) = &self.sock {
            sock.close_fd_quietly();
        }
    }
}

impl core::fmt::Debug for SrvTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SrvTask")
            .field("flags", &self.state.load())
            .field("priority", &self.priority())
            .field("last_thread", &self.last_thread.load(Ordering::Relaxed))
            .field("is_socket", &self.sock.is_some())
            .finish()
    }
}
