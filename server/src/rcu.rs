//! Quiescence-based deferred reclamation (RCU).
//!
//! Each thread keeps a FIFO of deferred calls with two sentinel markers in
//! it, splitting the list into three segments:
//!
//! ```text
//! [ calls before last GP | marker_cur | calls this GP | marker_next | tail ]
//! ```
//!
//! Executing means running everything ahead of the first marker. Once per
//! jiffy every thread announces a quiescent state ([`pass_qs`]); when the
//! last active thread of a grace period passes, the period is finished and
//! each thread rotates its markers, promoting one segment towards
//! execution. A call submitted during grace period N therefore runs no
//! earlier than the start of N+2, after every thread active at submission
//! has passed a quiescent state.

use std::collections::VecDeque;
use sync::Mutex;

pub(crate) enum RcuEntry {
    Marker,
    Call(Box<dyn FnOnce() + Send>),
}

/// Per-thread RCU state; single-writer (the owning thread).
pub struct RcuInfo {
    calls: VecDeque<RcuEntry>,
    seen_gp: u8,
}

impl RcuInfo {
    pub(crate) fn new() -> Self {
        Self {
            calls: VecDeque::new(),
            seen_gp: 0,
        }
    }

    pub(crate) fn push_call(&mut self, call: Box<dyn FnOnce() + Send>) {
        self.calls.push_back(RcuEntry::Call(call));
    }
}

struct RcuGlobals {
    finished_gp: u8,
    current_gp: u8,
    threads_passed_qs: u16,
    threads_entered_gp: u16,
    active_threads: u16,
}

static RCU: Mutex<RcuGlobals> = Mutex::new(RcuGlobals {
    finished_gp: 0,
    current_gp: 0,
    threads_passed_qs: 0,
    threads_entered_gp: 0,
    active_threads: 0,
});

/// Runs every call ahead of the first marker.
fn execute_calls(rcu: &mut RcuInfo) {
    while matches!(rcu.calls.front(), Some(RcuEntry::Call(_))) {
        let Some(RcuEntry::Call(call)) = rcu.calls.pop_front() else {
            unreachable!("front changed between check and pop")
        };
        call();
    }
}

/// Rotates the markers: the front entry must be the current marker; it goes
/// to the tail and the next marker becomes current.
fn move_gp_markers(rcu: &mut RcuInfo) {
    match rcu.calls.pop_front() {
        Some(RcuEntry::Marker) => {}
        _ => panic!("RCU list head is not the current GP marker"),
    }
    rcu.calls.push_back(RcuEntry::Marker);
}

fn note_started_gp(rcu: &mut RcuInfo, g: &mut RcuGlobals) {
    rcu.seen_gp = g.current_gp;
    g.threads_passed_qs += 1;
    if g.threads_passed_qs == g.threads_entered_gp {
        g.finished_gp = g.current_gp;
    }
}

fn note_gp_or_start_new(rcu: &mut RcuInfo) {
    {
        let mut g = RCU.lock();
        if rcu.seen_gp != g.current_gp {
            note_started_gp(rcu, &mut g);
        } else {
            g.current_gp = g.current_gp.wrapping_add(1);
            rcu.seen_gp = g.current_gp;
            g.threads_entered_gp = g.active_threads;
            g.threads_passed_qs = 1;
        }
    }
    move_gp_markers(rcu);
}

/// Announces a quiescent state for the owning thread and executes whatever
/// became safe. Invoked once per jiffy and on shutdown.
pub fn pass_qs(rcu: &mut RcuInfo) {
    execute_calls(rcu);
    loop {
        let (current_gp, finished_gp) = {
            let g = RCU.lock();
            (g.current_gp, g.finished_gp)
        };
        if rcu.seen_gp == current_gp && !(finished_gp == current_gp && rcu.calls.len() != 2) {
            return;
        }
        note_gp_or_start_new(rcu);
        // We may have been the last thread of the noted GP, or of a GP
        // started concurrently; either way some calls may have become
        // executable.
        execute_calls(rcu);
    }
}

/// True while any non-marker entries remain in the thread's list.
pub fn has_calls(rcu: &RcuInfo) -> bool {
    rcu.calls.len() != 2
}

/// Registers a thread with the RCU machinery: seeds the two markers and
/// counts the thread into the active set.
pub fn init_thread_rcu(rcu: &mut RcuInfo) {
    rcu.calls.push_back(RcuEntry::Marker);
    rcu.calls.push_back(RcuEntry::Marker);
    let mut g = RCU.lock();
    g.active_threads += 1;
    rcu.seen_gp = g.current_gp;
}

/// Withdraws a thread; its list must be fully drained.
pub fn finalize_thread_rcu(rcu: &mut RcuInfo) {
    assert!(!has_calls(rcu), "thread exiting with pending RCU calls");
    {
        let mut g = RCU.lock();
        if rcu.seen_gp != g.current_gp {
            note_started_gp(rcu, &mut g);
        }
        g.active_threads -= 1;
    }
    rcu.calls.clear();
}

/// Defers `call` until every thread active now has passed a quiescent
/// state. Must be called from a managed thread; from anywhere else the
/// call runs immediately (there is no grace period to wait for).
pub fn call_rcu(call: Box<dyn FnOnce() + Send>) {
    if !crate::threads::with_cur_thread_rcu(|rcu| rcu.push_call(call)) {
        // Not a managed thread: nothing can hold an unprotected reference.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    // The grace-period counters are process globals; run these one at a
    // time so each test sees only its own simulated threads.
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn flagged_call(flag: &Arc<AtomicBool>) -> Box<dyn FnOnce() + Send> {
        let flag = Arc::clone(flag);
        Box::new(move || flag.store(true, Ordering::SeqCst))
    }

    #[test]
    fn call_waits_for_two_grace_periods() {
        let _g = TEST_LOCK.lock().unwrap();
        let mut a = RcuInfo::new();
        let mut b = RcuInfo::new();
        init_thread_rcu(&mut a);
        init_thread_rcu(&mut b);

        let fired = Arc::new(AtomicBool::new(false));
        a.push_call(flagged_call(&fired));
        assert!(has_calls(&a));

        // One QS from the submitter alone must never release the call.
        pass_qs(&mut a);
        assert!(!fired.load(Ordering::SeqCst));

        // Both threads cycle through enough quiescent states.
        for _ in 0..3 {
            pass_qs(&mut b);
            pass_qs(&mut a);
        }
        assert!(fired.load(Ordering::SeqCst));
        assert!(!has_calls(&a));

        finalize_thread_rcu(&mut a);
        finalize_thread_rcu(&mut b);
    }

    #[test]
    fn calls_execute_in_submission_order() {
        let _g = TEST_LOCK.lock().unwrap();
        let mut a = RcuInfo::new();
        let mut b = RcuInfo::new();
        init_thread_rcu(&mut a);
        init_thread_rcu(&mut b);

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            a.push_call(Box::new(move || order.lock().unwrap().push(i)));
        }
        for _ in 0..4 {
            pass_qs(&mut b);
            pass_qs(&mut a);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

        finalize_thread_rcu(&mut a);
        finalize_thread_rcu(&mut b);
    }
}
