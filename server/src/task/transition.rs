//! One-shot transition with parked consumers.
//!
//! A transition task performs some state change exactly once (for example,
//! loading a record from storage). Consumers that need the result register
//! themselves; the first one kicks the owner task runnable, the rest just
//! park. When the owner calls `finish_transition`, every consumer's flag is
//! set and every consumer is made runnable.

use crate::task::TaskRef;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransState {
    Initial,
    Transition,
    Final,
}

struct TransInner {
    state: TransState,
    consumers: Vec<(TaskRef, Arc<AtomicBool>)>,
}

pub struct TransitionTask {
    inner: Mutex<TransInner>,
}

impl TransitionTask {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TransInner {
                state: TransState::Initial,
                consumers: Vec::new(),
            }),
        }
    }

    /// Registers `consumer` for completion. `owner` is the task that will
    /// perform the transition; it is made runnable when the transition has
    /// not started yet. `finished` is set (and the consumer woken) when the
    /// transition completes; if it is already final, the flag is set
    /// immediately and no parking happens.
    pub fn request_transition(
        &self,
        owner: &TaskRef,
        consumer: &TaskRef,
        finished: &Arc<AtomicBool>,
    ) {
        let mut inner = self.inner.lock();
        match inner.state {
            TransState::Initial => {
                inner.state = TransState::Transition;
                inner
                    .consumers
                    .push((Arc::clone(consumer), Arc::clone(finished)));
                drop(inner);
                owner.set_runnable();
            }
            TransState::Transition => {
                inner
                    .consumers
                    .push((Arc::clone(consumer), Arc::clone(finished)));
            }
            TransState::Final => {
                drop(inner);
                finished.store(true, Ordering::SeqCst);
                consumer.set_runnable();
            }
        }
    }

    pub fn is_final(&self) -> bool {
        self.inner.lock().state == TransState::Final
    }

    /// Unregisters a parked consumer, e.g. because it is terminating.
    pub fn cancel_request(&self, consumer: &TaskRef) {
        let mut inner = self.inner.lock();
        inner
            .consumers
            .retain(|(task, _)| !Arc::ptr_eq(task, consumer));
    }

    /// Marks the transition final and releases every parked consumer.
    /// Called by the owner task from its slice.
    pub fn finish_transition(&self) {
        let consumers = {
            let mut inner = self.inner.lock();
            if inner.state == TransState::Final {
                panic!("transition finished twice");
            }
            inner.state = TransState::Final;
            core::mem::take(&mut inner.consumers)
        };
        for (task, finished) in consumers {
            finished.store(true, Ordering::SeqCst);
            task.set_runnable();
        }
    }
}

impl Default for TransitionTask {
    fn default() -> Self {
        Self::new()
    }
}
