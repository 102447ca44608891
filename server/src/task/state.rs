//! The task flag word.
//!
//! All lifecycle transitions go through compare-and-swap loops on one
//! `AtomicU32`; the enums returned by the `transition_*` methods tell the
//! caller what follow-up action the winning transition requires.

use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// A wake-up arrived while the task was running; re-queue on
        /// completion.
        const RUNNABLE = 1 << 0;
        /// Currently in some scheduler queue.
        const QUEUED = 1 << 1;
        /// Currently executing a slice.
        const RUNNING = 1 << 2;
        /// Parked in the timer wheel.
        const ON_TIMER = 1 << 3;
        /// Soft termination requested; no further queueing.
        const NEED_TERMINATION = 1 << 4;
        /// Hard termination; free as soon as not Running/Queued.
        const TERMINATED = 1 << 5;
    }
}

impl TaskFlags {
    pub fn any_termination(self) -> bool {
        self.intersects(TaskFlags::NEED_TERMINATION | TaskFlags::TERMINATED)
    }
}

#[derive(Debug)]
pub struct TaskState(AtomicU32);

#[must_use]
pub enum RunnableOutcome {
    /// Nothing to do: already queued/runnable or terminated.
    Ignored,
    /// The Runnable bit was added to a running task; `flags` is the new
    /// word, for the timer-cancel that follows.
    MarkedRunnable(TaskFlags),
    /// The task went idle -> Queued and must be placed on a thread.
    Queue(TaskFlags),
}

#[must_use]
pub enum ExecutedOutcome {
    /// Runnable was set during the slice: place the task again.
    Requeue,
    /// Hard-terminated and off every queue: free through RCU.
    Terminate,
    /// The task went idle.
    Idle,
}

impl TaskState {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    #[inline]
    pub fn load(&self) -> TaskFlags {
        TaskFlags::from_bits_truncate(self.0.load(Ordering::SeqCst))
    }

    fn cas(&self, old: TaskFlags, new: TaskFlags) -> bool {
        self.0
            .compare_exchange(old.bits(), new.bits(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Wake-up request: mark Runnable if running, else claim the Queued bit.
    pub fn transition_to_runnable(&self) -> RunnableOutcome {
        loop {
            let old = self.load();
            if old.any_termination() {
                return RunnableOutcome::Ignored;
            }
            if old.contains(TaskFlags::RUNNING) {
                if old.contains(TaskFlags::RUNNABLE) {
                    return RunnableOutcome::Ignored;
                }
                let new = old | TaskFlags::RUNNABLE;
                if self.cas(old, new) {
                    return RunnableOutcome::MarkedRunnable(new);
                }
                continue;
            }
            if old.contains(TaskFlags::QUEUED) {
                return RunnableOutcome::Ignored;
            }
            let new = old | TaskFlags::QUEUED;
            if self.cas(old, new) {
                return RunnableOutcome::Queue(new);
            }
        }
    }

    /// Queued -> Running, on dequeue. Panics on an illegal word: this means
    /// the scheduler and the flag word disagree, which is unrecoverable.
    pub fn transition_to_running(&self) {
        loop {
            let old = self.load();
            if !old.contains(TaskFlags::QUEUED) || old.contains(TaskFlags::RUNNING) {
                panic!("invalid task flags: {old:?}");
            }
            let new = (old - TaskFlags::QUEUED) | TaskFlags::RUNNING;
            if self.cas(old, new) {
                return;
            }
        }
    }

    /// Running -> (Queued | idle | terminated), at the end of a slice.
    pub fn transition_executed(&self) -> ExecutedOutcome {
        loop {
            let old = self.load();
            if old.contains(TaskFlags::QUEUED) || !old.contains(TaskFlags::RUNNING) {
                panic!("invalid task flags: {old:?}");
            }
            let mut new = old - TaskFlags::RUNNING;
            if new.any_termination() {
                new -= TaskFlags::RUNNABLE;
            } else if new.contains(TaskFlags::RUNNABLE) {
                new = (new - TaskFlags::RUNNABLE) | TaskFlags::QUEUED;
            }
            if self.cas(old, new) {
                return if new.contains(TaskFlags::QUEUED) {
                    ExecutedOutcome::Requeue
                } else if new.contains(TaskFlags::TERMINATED) {
                    ExecutedOutcome::Terminate
                } else {
                    ExecutedOutcome::Idle
                };
            }
        }
    }

    /// ORs a termination bit in; returns the new word.
    pub fn transition_terminated(&self, term_flag: TaskFlags) -> TaskFlags {
        loop {
            let old = self.load();
            let new = old | term_flag;
            if self.cas(old, new) {
                return new;
            }
        }
    }

    /// Claims the OnTimer bit; refused while the task is queued or runnable
    /// (a pending wake-up beats a timer). Caller holds the timer lock.
    pub fn try_set_on_timer(&self) -> bool {
        loop {
            let old = self.load();
            if old.intersects(TaskFlags::QUEUED | TaskFlags::RUNNABLE) {
                return false;
            }
            if old.contains(TaskFlags::ON_TIMER) {
                return false;
            }
            if self.cas(old, old | TaskFlags::ON_TIMER) {
                return true;
            }
        }
    }

    /// Drops the OnTimer bit; returns whether it was set. Caller holds the
    /// timer lock.
    pub fn clear_on_timer(&self) -> bool {
        loop {
            let old = self.load();
            if !old.contains(TaskFlags::ON_TIMER) {
                return false;
            }
            if self.cas(old, old - TaskFlags::ON_TIMER) {
                return true;
            }
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_and_running_stay_exclusive() {
        let st = TaskState::new();
        assert!(matches!(
            st.transition_to_runnable(),
            RunnableOutcome::Queue(_)
        ));
        // Second wake-up while queued is a no-op.
        assert!(matches!(st.transition_to_runnable(), RunnableOutcome::Ignored));
        st.transition_to_running();
        let f = st.load();
        assert!(f.contains(TaskFlags::RUNNING) && !f.contains(TaskFlags::QUEUED));
        assert!(matches!(st.transition_executed(), ExecutedOutcome::Idle));
        assert!(st.load().is_empty());
    }

    #[test]
    fn runnable_during_slice_requeues() {
        let st = TaskState::new();
        let _ = st.transition_to_runnable();
        st.transition_to_running();
        assert!(matches!(
            st.transition_to_runnable(),
            RunnableOutcome::MarkedRunnable(_)
        ));
        assert!(matches!(st.transition_executed(), ExecutedOutcome::Requeue));
        assert!(st.load().contains(TaskFlags::QUEUED));
    }

    #[test]
    fn termination_suppresses_runnable() {
        let st = TaskState::new();
        let _ = st.transition_to_runnable();
        st.transition_to_running();
        let _ = st.transition_to_runnable();
        let _ = st.transition_terminated(TaskFlags::TERMINATED);
        assert!(matches!(
            st.transition_executed(),
            ExecutedOutcome::Terminate
        ));
        let f = st.load();
        assert!(!f.contains(TaskFlags::RUNNABLE));
        // Once terminated, wake-ups never add Runnable.
        assert!(matches!(st.transition_to_runnable(), RunnableOutcome::Ignored));
        assert!(!st.load().contains(TaskFlags::RUNNABLE));
    }

    #[test]
    fn on_timer_excluded_by_queued_and_runnable() {
        let st = TaskState::new();
        assert!(st.try_set_on_timer());
        assert!(st.load().contains(TaskFlags::ON_TIMER));
        assert!(st.clear_on_timer());
        assert!(!st.clear_on_timer());

        let _ = st.transition_to_runnable();
        assert!(!st.try_set_on_timer(), "queued task must refuse a timer");
    }
}
