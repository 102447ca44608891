//! Per-thread task scheduling.
//!
//! Every worker thread owns a priority-keyed map of FIFO queues plus a
//! futex whose value is the number of queued tasks (so an idle worker can
//! park on it). Placement prefers the task's last thread, walks that
//! thread's preference chain when it is overloaded, then scans all workers,
//! and as a last resort doubles the global overload coefficient. Within a
//! thread, dequeueing charges each priority queue "execution credit" so
//! lower-priority queues get a proportional share of slices.

use crate::task::{ExecutedOutcome, TaskFlags, TaskRef, ThreadNum};
use crate::threads::{self, SrvThread, is_thread_running};
use crate::time::{self, SrvTime};
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use sync::{Futex, Mutex};

static MAX_TASKS_COEF: AtomicU32 = AtomicU32::new(1);
static MAX_TASK_LATENCY: AtomicU32 = AtomicU32::new(500);
static IDLE_STOP_TIMEOUT: AtomicU64 = AtomicU64::new(300);

pub fn configure(reg: &crate::config::Registry, section: &str) {
    MAX_TASK_LATENCY.store(
        reg.get_int(section, "max_task_delay", 500).max(1) as u32,
        Ordering::Relaxed,
    );
    IDLE_STOP_TIMEOUT.store(
        reg.get_int(section, "idle_thread_stop_timeout", 300).max(1) as u64,
        Ordering::Relaxed,
    );
}

struct PrtyQueue {
    exec_time: u32,
    tasks: VecDeque<TaskRef>,
}

#[derive(Default)]
struct PrtyMap {
    queues: BTreeMap<u8, PrtyQueue>,
}

/// Scheduling state of one worker thread.
pub(crate) struct SchedInfo {
    tasks: Mutex<PrtyMap>,
    /// Holds the total number of queued tasks; an idle worker waits for the
    /// value to leave zero.
    pub(crate) cnt_signal: Futex,
    max_tasks: AtomicU32,
    done_tasks: AtomicU32,
    done_time: AtomicU64,
    wait_time: AtomicU64,
    max_slice: AtomicU64,
    /// Start of the current jiffy, µs since epoch; 0 before the first one.
    jfy_start_time: AtomicU64,
    /// Time of the last executed task, µs since epoch.
    pub(crate) last_exec_time: AtomicU64,
    prefer_thr_num: AtomicU16,
}

impl SchedInfo {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Mutex::new(PrtyMap::default()),
            cnt_signal: Futex::new(0),
            max_tasks: AtomicU32::new(1),
            done_tasks: AtomicU32::new(0),
            done_time: AtomicU64::new(0),
            wait_time: AtomicU64::new(0),
            max_slice: AtomicU64::new(0),
            jfy_start_time: AtomicU64::new(0),
            last_exec_time: AtomicU64::new(0),
            prefer_thr_num: AtomicU16::new(0),
        }
    }

}

fn is_thread_overloaded(thr: &SrvThread, max_coef: u32) -> bool {
    let queued = thr.sched.cnt_signal.value().max(0) as u64;
    let limit = u64::from(thr.sched.max_tasks.load(Ordering::Relaxed)) * u64::from(max_coef);
    queued >= limit || time::cur_jiffies().saturating_sub(thr.seen_jiffy.load(Ordering::Relaxed)) > 1
}

/// Picks the thread a runnable task should be queued to. Mirrors the rule
/// "use as few threads as possible, compacted into the lowest numbers".
fn find_queue_thread(prefer_num: ThreadNum, cur_thr: Option<Arc<SrvThread>>) -> Arc<SrvThread> {
    let threads = threads::threads();
    let cur_thr = cur_thr.filter(|t| is_thread_running(t));
    let mut prefer_thr = Arc::clone(&threads[prefer_num as usize]);
    if !is_thread_running(&prefer_thr) {
        prefer_thr = cur_thr
            .clone()
            .unwrap_or_else(|| Arc::clone(&threads[1]));
    }
    let mut max_coef = MAX_TASKS_COEF.load(Ordering::Relaxed);

    loop {
        // Preferred thread first, then up to two hops along its chain.
        let mut queue_thr = Arc::clone(&prefer_thr);
        let mut pref_chain_tries = 2;
        loop {
            if !is_thread_overloaded(&queue_thr, max_coef) {
                if !Arc::ptr_eq(&queue_thr, &prefer_thr) {
                    // Remember the choice to amortize later lookups.
                    prefer_thr
                        .sched
                        .prefer_thr_num
                        .store(queue_thr.thread_num, Ordering::Relaxed);
                }
                return queue_thr;
            }
            if pref_chain_tries == 0 {
                break;
            }
            pref_chain_tries -= 1;
            let chain_num = queue_thr.sched.prefer_thr_num.load(Ordering::Relaxed);
            let chained = Arc::clone(&threads[chain_num as usize]);
            if is_thread_running(&chained) {
                queue_thr = chained;
            } else {
                break;
            }
        }

        // Check every running worker one by one.
        let max_running = threads::max_running_threads();
        let mut thr_num: ThreadNum = 1;
        while thr_num <= max_running {
            let t = &threads[thr_num as usize];
            if !is_thread_running(t) {
                // First inactive slot: no running workers above it.
                break;
            }
            if !is_thread_overloaded(t, max_coef) {
                if !Arc::ptr_eq(t, &prefer_thr) {
                    prefer_thr
                        .sched
                        .prefer_thr_num
                        .store(t.thread_num, Ordering::Relaxed);
                }
                return Arc::clone(t);
            }
            thr_num += 1;
        }
        if thr_num <= max_running {
            // A slot is free: ask for a new worker and queue into the
            // preferred thread meanwhile; the starter will steal.
            threads::request_thread_start(&threads[thr_num as usize]);
            return cur_thr.unwrap_or(prefer_thr);
        }
        if max_coef >= u32::from(u16::MAX) {
            return cur_thr.unwrap_or(prefer_thr);
        }

        // Everyone is overloaded and no slot is free: pretend the limits
        // are twice as big and redo the whole calculation.
        let _ = MAX_TASKS_COEF.compare_exchange(
            max_coef,
            max_coef * 2,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        max_coef *= 2;
    }
}

fn add_task_to_queue(thr: &Arc<SrvThread>, task: TaskRef) {
    let mut thr = Arc::clone(thr);
    let mut map = thr.sched.tasks.lock();
    if !is_thread_running(&thr) {
        // The thread started stopping before we queued; fall back to the
        // current thread or the first worker.
        drop(map);
        let threads = threads::threads();
        thr = threads::get_cur_thread()
            .filter(|t| is_thread_running(t))
            .unwrap_or_else(|| Arc::clone(&threads[1]));
        map = thr.sched.tasks.lock();
    }

    let queue = map.queues.entry(task.priority()).or_insert_with(|| PrtyQueue {
        exec_time: 0,
        tasks: VecDeque::new(),
    });
    queue.tasks.push_back(task);
    let signal_val = thr.sched.cnt_signal.value();
    thr.sched.cnt_signal.set_value_nonatomic(signal_val + 1);
    drop(map);

    if signal_val == 0 {
        thr.sched.cnt_signal.wake_up_waiters(1);
    }
}

/// Places a task that just became runnable (idle -> Queued transition).
pub(crate) fn queue_runnable_task(task: &TaskRef) {
    if !threads::threads_initialized() {
        // No queues exist yet; the task keeps its Queued bit and will be
        // picked up by nobody. Only reachable from standalone tests.
        return;
    }
    let cur_thr = threads::get_cur_thread();
    let last = task.last_thread.load(Ordering::Relaxed);
    let prefer_num = if last != 0 { last } else { 1 };
    let thr = find_queue_thread(prefer_num, cur_thr);
    add_task_to_queue(&thr, Arc::clone(task));
}

/// Pulls the next task out of a thread's queues, honoring the execution
/// credits: a lower-priority queue whose credit-plus-priority does not
/// exceed the default choice's credit runs instead.
fn unqueue_task(sched: &SchedInfo) -> Option<TaskRef> {
    let mut map = sched.tasks.lock();

    let first_prty = map
        .queues
        .iter()
        .find(|(_, q)| !q.tasks.is_empty())
        .map(|(&p, _)| p)?;
    let first_credit = map.queues[&first_prty].exec_time;

    let mut exec_prty = first_prty;
    for (&prty, queue) in map
        .queues
        .range((Bound::Excluded(first_prty), Bound::Unbounded))
    {
        if !queue.tasks.is_empty() && queue.exec_time + u32::from(prty) <= first_credit {
            exec_prty = prty;
            break;
        }
    }

    let queue = map.queues.get_mut(&exec_prty).expect("queue vanished");
    let task = queue.tasks.pop_front().expect("picked an empty queue");
    queue.exec_time += u32::from(exec_prty);
    sched
        .cnt_signal
        .set_value_nonatomic(sched.cnt_signal.value() - 1);
    Some(task)
}

fn do_termination(task: &TaskRef) {
    if !crate::server::is_in_shutdown() {
        let owned = Arc::clone(task);
        crate::rcu::call_rcu(Box::new(move || drop(owned)));
    }
}

/// ORs a termination bit into the task; frees through RCU once the task is
/// neither running nor queued.
pub(crate) fn mark_task_terminated(task: &TaskRef, immediate: bool) {
    let term_flag = if immediate {
        TaskFlags::TERMINATED
    } else {
        TaskFlags::NEED_TERMINATION
    };
    let new_flags = task.state.transition_terminated(term_flag);
    if immediate && !new_flags.intersects(TaskFlags::RUNNING | TaskFlags::QUEUED) {
        do_termination(task);
    }
}

/// Executes one task slice on this thread, or parks for up to a jiffy when
/// the queue is empty.
pub(crate) fn sched_execute_task(thr: &Arc<SrvThread>) {
    let sched = &thr.sched;
    if sched.cnt_signal.value() == 0 {
        let start = SrvTime::current();
        let jiffy = time::jiffy_time();
        let timeout = Duration::new(jiffy.sec().max(0) as u64, jiffy.nsec());
        sched.cnt_signal.wait_value_change_timeout(0, timeout);
        let waited = SrvTime::current().since(start);
        sched.wait_time.fetch_add(waited.as_usec(), Ordering::Relaxed);
        return;
    }
    let Some(task) = unqueue_task(sched) else {
        // Somebody rebalanced our queues away between the check and the
        // lock.
        return;
    };

    if !is_thread_running(thr) {
        threads::request_thread_revive(thr);
    }
    task.state.transition_to_running();
    *thr.cur_task.lock() = Some(Arc::clone(&task));
    task.last_thread.store(thr.thread_num, Ordering::Relaxed);

    let start_time = SrvTime::current();
    task.run_slice(thr.thread_num);
    let end_time = SrvTime::current();

    *thr.cur_task.lock() = None;
    sched
        .last_exec_time
        .store(end_time.as_usec(), Ordering::Relaxed);
    let exec_time = end_time.since(start_time).as_usec();
    if exec_time > sched.max_slice.load(Ordering::Relaxed) {
        sched.max_slice.store(exec_time, Ordering::Relaxed);
    }
    sched.done_time.fetch_add(exec_time, Ordering::Relaxed);
    sched.done_tasks.fetch_add(1, Ordering::Relaxed);

    match task.state.transition_executed() {
        ExecutedOutcome::Requeue => {
            let queue_thr = find_queue_thread(thr.thread_num, Some(Arc::clone(thr)));
            add_task_to_queue(&queue_thr, task);
        }
        ExecutedOutcome::Terminate => do_termination(&task),
        ExecutedOutcome::Idle => {}
    }
}

/// Takes every queued task away from `sched` and re-places each one by the
/// normal rules; used on overload and when a thread stops.
fn balance_tasks(sched: &SchedInfo, cur_thr: Option<&Arc<SrvThread>>) {
    let mut grabbed: Vec<TaskRef> = Vec::new();
    {
        let mut map = sched.tasks.lock();
        for queue in map.queues.values_mut() {
            grabbed.extend(queue.tasks.drain(..));
        }
        sched.cnt_signal.set_value_nonatomic(0);
    }

    for task in grabbed {
        let prefer = cur_thr.map_or(1, |t| t.thread_num);
        let thr = find_queue_thread(prefer, cur_thr.cloned());
        add_task_to_queue(&thr, task);
    }
}

/// Pulls work from the highest-numbered thread that has any, preferring the
/// calling (idle) thread as the destination.
fn find_rebalance_tasks(cur_thr: &Arc<SrvThread>) {
    let threads = threads::threads();
    let mut i = threads::max_running_threads();
    while i > cur_thr.thread_num {
        let src = &threads[i as usize];
        if src.sched.cnt_signal.value() != 0 {
            balance_tasks(&src.sched, Some(cur_thr));
            return;
        }
        i -= 1;
    }
}

/// Service-thread duty: spread out the queues of any overloaded or
/// unresponsive worker.
pub(crate) fn sched_check_overloads() {
    let threads = threads::threads();
    let cur = threads::get_cur_thread();
    let max_coef = MAX_TASKS_COEF.load(Ordering::Relaxed);
    for i in 1..=threads::max_running_threads() {
        let thr = &threads[i as usize];
        if !is_thread_running(thr) {
            return;
        }
        if is_thread_overloaded(thr, max_coef) {
            balance_tasks(&thr.sched, cur.as_ref());
        }
    }
}

/// Per-jiffy bookkeeping for one worker: statistics reset, dynamic
/// max-tasks recalculation, overload rebalance, idle-thread stopping.
pub(crate) fn sched_start_jiffy(thr: &Arc<SrvThread>) {
    let sched = &thr.sched;
    let cur_time = SrvTime::current();
    let jfy_start = sched.jfy_start_time.load(Ordering::Relaxed);
    let jiffy_len_usec = cur_time.as_usec().saturating_sub(jfy_start);

    // Reset execution credits.
    {
        let mut map = sched.tasks.lock();
        for queue in map.queues.values_mut() {
            queue.exec_time = 0;
        }
    }

    // max_tasks = done_tasks * max_latency / done_time, clipped to [2, max).
    let done_tasks = sched.done_tasks.swap(0, Ordering::Relaxed);
    let done_time = sched.done_time.swap(0, Ordering::Relaxed);
    sched.wait_time.store(0, Ordering::Relaxed);
    sched.max_slice.store(0, Ordering::Relaxed);
    let mut max_tasks = u32::MAX;
    if done_tasks != 0 && done_time != 0 {
        let computed = u64::from(done_tasks)
            * u64::from(MAX_TASK_LATENCY.load(Ordering::Relaxed))
            / done_time;
        if computed > 2 && computed < u64::from(u32::MAX) {
            max_tasks = computed as u32;
        }
    }
    sched.max_tasks.store(max_tasks, Ordering::Relaxed);

    if is_thread_overloaded(thr, MAX_TASKS_COEF.load(Ordering::Relaxed)) {
        balance_tasks(sched, Some(thr));
    }

    sched
        .jfy_start_time
        .store(cur_time.as_usec(), Ordering::Relaxed);

    if jfy_start != 0 && jiffy_len_usec >= crate::time::USECS_PER_SECOND {
        // Either a task ran way too long or this thread was just restarted;
        // both cases mean idle-time math must restart from here.
        sched
            .last_exec_time
            .store(cur_time.as_usec(), Ordering::Relaxed);
    } else if sched.cnt_signal.value() == 0 {
        let idle_usec = cur_time
            .as_usec()
            .saturating_sub(sched.last_exec_time.load(Ordering::Relaxed));
        if idle_usec >= IDLE_STOP_TIMEOUT.load(Ordering::Relaxed) * crate::time::USECS_PER_SECOND {
            let threads = threads::threads();
            let next = &threads[thr.thread_num as usize + 1];
            if is_thread_running(next) {
                find_rebalance_tasks(thr);
            } else if thr.thread_num != 1 {
                threads::request_thread_stop(thr);
            }
        }
    }
}

/// True when every worker has an empty queue, no task in flight, and has
/// been idle for longer than a jiffy. Drives the shutdown tracker.
pub(crate) fn sched_is_all_idle() -> bool {
    let threads = threads::threads();
    let cur_time = SrvTime::current();
    for i in 1..=threads::max_running_threads() {
        let thr = &threads[i as usize];
        {
            let _map = thr.sched.tasks.lock();
            if thr.sched.cnt_signal.value() != 0 || thr.cur_task.lock().is_some() {
                return false;
            }
        }
        let idle_usec = cur_time
            .as_usec()
            .saturating_sub(thr.sched.last_exec_time.load(Ordering::Relaxed));
        if idle_usec <= time::jiffy_time().as_usec() {
            return false;
        }
    }
    true
}

/// Redistributes a stopping thread's queues to the survivors.
pub(crate) fn release_thread_sched(thr: &Arc<SrvThread>) {
    thr.sched.jfy_start_time.store(0, Ordering::Relaxed);
    balance_tasks(&thr.sched, threads::get_cur_thread().as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with(prty_and_credit: &[(u8, u32, usize)]) -> SchedInfo {
        use crate::task::{SrvTask, TaskHandler};
        struct Nop;
        impl TaskHandler for Nop {
            fn execute_slice(&mut self, _t: &TaskRef, _n: ThreadNum) {}
        }
        let sched = SchedInfo::new();
        {
            let mut map = sched.tasks.lock();
            let mut total = 0;
            for &(prty, credit, cnt) in prty_and_credit {
                let mut q = PrtyQueue {
                    exec_time: credit,
                    tasks: VecDeque::new(),
                };
                for _ in 0..cnt {
                    let t = SrvTask::new(Box::new(Nop));
                    t.set_priority(prty);
                    q.tasks.push_back(t);
                    total += 1;
                }
                map.queues.insert(prty, q);
            }
            sched.cnt_signal.set_value_nonatomic(total);
        }
        sched
    }

    #[test]
    fn unqueue_prefers_lowest_priority_number() {
        let sched = queue_with(&[(1, 0, 2), (4, 0, 2)]);
        let t = unqueue_task(&sched).unwrap();
        assert_eq!(t.priority(), 1);
        // Credit charged to the queue that ran.
        assert_eq!(sched.tasks.lock().queues[&1].exec_time, 1);
    }

    #[test]
    fn credits_let_lower_priority_run() {
        // Priority-1 queue has consumed lots of credit; the priority-4
        // queue with credit 0 satisfies 0 + 4 <= 8 and must run.
        let sched = queue_with(&[(1, 8, 2), (4, 0, 2)]);
        let t = unqueue_task(&sched).unwrap();
        assert_eq!(t.priority(), 4);
    }

    #[test]
    fn credit_scheme_approximates_inverse_priorities() {
        // Saturated queues at priorities 1 and 2: over many dequeues the
        // executed ratio approaches 2:1.
        let sched = queue_with(&[(1, 0, 600), (2, 0, 300)]);
        let mut ran = [0u32; 3];
        for _ in 0..600 {
            let t = unqueue_task(&sched).unwrap();
            ran[t.priority() as usize] += 1;
        }
        let ratio = f64::from(ran[1]) / f64::from(ran[2]);
        assert!(
            (1.8..=2.2).contains(&ratio),
            "ratio {ratio}, ran {ran:?}"
        );
    }

    #[test]
    fn empty_map_yields_none() {
        let sched = SchedInfo::new();
        assert!(unqueue_task(&sched).is_none());
    }
}
