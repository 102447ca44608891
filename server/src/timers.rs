//! Hierarchical timer wheel: 256 one-second slots in the low wheel and two
//! mid wheels of 32 slots at coarser scales (cycles of 256 s and 8192 s).
//!
//! The wheel owns its tickets; a task holds only a non-owning back
//! reference, and the `OnTimer` flag is the single source of truth for
//! "this task is parked in the wheel". Cancellation marks the ticket and
//! clears the flag; the slot list drops marked tickets when it next drains.

use crate::srv_log;
use crate::task::{TaskFlags, TaskRef};
use crate::time;
use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, LazyLock};
use sync::Mutex;

const TIMER_LOW_BITS: u32 = 8;
const TIMER_MID_BITS: u32 = 5;
const TIMER_MID_LEVELS: usize = 2;
const TIMER_LOW_MASK: i64 = (1 << TIMER_LOW_BITS) - 1;
const TIMER_MID_MASK: i64 = (1 << TIMER_MID_BITS) - 1;

pub(crate) struct TimerTicket {
    timer_time: AtomicI64,
    cancelled: AtomicBool,
    task: TaskRef,
}

impl TimerTicket {
    fn new(timer_time: i64, task: TaskRef) -> Arc<Self> {
        Arc::new(Self {
            timer_time: AtomicI64::new(timer_time),
            cancelled: AtomicBool::new(false),
            task,
        })
    }

    fn time(&self) -> i64 {
        self.timer_time.load(Ordering::Relaxed)
    }
}

struct TimerWheel {
    last_fired_time: i64,
    low: Vec<VecDeque<Arc<TimerTicket>>>,
    mid: [Vec<VecDeque<Arc<TimerTicket>>>; TIMER_MID_LEVELS],
}

impl TimerWheel {
    fn new() -> Self {
        Self {
            last_fired_time: 0,
            low: (0..=TIMER_LOW_MASK).map(|_| VecDeque::new()).collect(),
            mid: [
                (0..=TIMER_MID_MASK).map(|_| VecDeque::new()).collect(),
                (0..=TIMER_MID_MASK).map(|_| VecDeque::new()).collect(),
            ],
        }
    }
}

static TIMER: LazyLock<Mutex<TimerWheel>> = LazyLock::new(|| Mutex::new(TimerWheel::new()));

/// Files a ticket into the coarsest level whose period still covers its
/// remaining delay; overdue tickets land one second out.
fn add_timer_ticket(wheel: &mut TimerWheel, ticket: Arc<TimerTicket>) {
    let cur_time = time::cur_secs();
    let mut ticket_time = ticket.time();
    if ticket_time <= cur_time + TIMER_LOW_MASK {
        if ticket_time <= cur_time {
            ticket_time = cur_time + 1;
            ticket.timer_time.store(ticket_time, Ordering::Relaxed);
        }
        wheel.low[(ticket_time & TIMER_LOW_MASK) as usize].push_back(ticket);
    } else {
        let mut ticket_scaled = ticket_time >> TIMER_LOW_BITS;
        let mut cur_scaled = cur_time >> TIMER_LOW_BITS;
        for level in 0..TIMER_MID_LEVELS {
            if ticket_scaled < cur_scaled + TIMER_MID_MASK || level == TIMER_MID_LEVELS - 1 {
                wheel.mid[level][(ticket_scaled & TIMER_MID_MASK) as usize].push_back(ticket);
                break;
            }
            ticket_scaled >>= TIMER_MID_BITS;
            cur_scaled >>= TIMER_MID_BITS;
        }
    }
}

/// Redistributes the mid-wheel slots matching `fire_time` down a level; run
/// whenever the low wheel wraps.
fn shift_timers(wheel: &mut TimerWheel, fire_time: i64) {
    let mut scaled = fire_time >> TIMER_LOW_BITS;
    for level in 0..TIMER_MID_LEVELS {
        let slot = (scaled & TIMER_MID_MASK) as usize;
        let tickets = core::mem::take(&mut wheel.mid[level][slot]);
        for ticket in tickets {
            if !ticket.cancelled.load(Ordering::Relaxed) {
                add_timer_ticket(wheel, ticket);
            }
        }
        scaled >>= TIMER_MID_BITS;
    }
}

fn execute_timer_ticket(ticket: &Arc<TimerTicket>) {
    let task = &ticket.task;
    *task.timer_ticket.lock() = None;
    let was_on_timer = task.state.clear_on_timer();
    debug_assert!(was_on_timer, "fired a ticket whose task lost OnTimer");
    task.set_runnable();
}

fn fire_timers(wheel: &mut TimerWheel, fire_time: i64) {
    let slot = (fire_time & TIMER_LOW_MASK) as usize;
    let tickets = core::mem::take(&mut wheel.low[slot]);
    for ticket in tickets {
        if ticket.cancelled.load(Ordering::Relaxed) {
            continue;
        }
        if ticket.time() != fire_time {
            srv_log!(crate::logging::Severity::Critical, "Timers broken");
        }
        execute_timer_ticket(&ticket);
    }
}

pub(crate) fn init_timers() {
    TIMER.lock().last_fired_time = time::cur_secs();
}

/// Advances the wheel second by second up to the current time; service
/// thread duty, once per second.
pub(crate) fn timer_tick() {
    let mut wheel = TIMER.lock();
    let cur_time = time::cur_secs();
    let mut fire_time = wheel.last_fired_time + 1;
    while fire_time <= cur_time {
        if fire_time & TIMER_LOW_MASK == 0 {
            shift_timers(&mut wheel, fire_time);
        }
        fire_timers(&mut wheel, fire_time);
        fire_time += 1;
    }
    wheel.last_fired_time = cur_time;
}

/// Shutdown path: every parked ticket fires immediately.
pub(crate) fn fire_all_timers() {
    let mut wheel = TIMER.lock();
    let cur_time = time::cur_secs();
    for fire_time in cur_time..=cur_time + TIMER_LOW_MASK {
        fire_timers(&mut wheel, fire_time);
    }
    for level in 0..TIMER_MID_LEVELS {
        for slot in 0..=TIMER_MID_MASK as usize {
            let tickets = core::mem::take(&mut wheel.mid[level][slot]);
            for ticket in tickets {
                if !ticket.cancelled.load(Ordering::Relaxed) {
                    execute_timer_ticket(&ticket);
                }
            }
        }
    }
}

/// Cancels a pending ticket after a wake-up raced the timer. `new_flags` is
/// the freshly-written flag word; nothing to do unless it has OnTimer.
pub(crate) fn remove_task_from_timer(task: &TaskRef, new_flags: TaskFlags) {
    if !new_flags.contains(TaskFlags::ON_TIMER) {
        return;
    }
    let _wheel = TIMER.lock();
    if task.state.clear_on_timer()
        && let Some(ticket) = task.timer_ticket.lock().take()
    {
        ticket.cancelled.store(true, Ordering::Relaxed);
    }
}

/// Parks `task` to be woken `delay_sec` seconds from now. Dropped when the
/// task already has a wake-up pending; immediate during shutdown.
pub(crate) fn run_after(task: &TaskRef, delay_sec: u64) {
    let mut wheel = TIMER.lock();
    let timer_time = time::cur_secs() + delay_sec.min(i64::MAX as u64 / 2) as i64;
    if crate::server::is_in_shutdown() {
        drop(wheel);
        task.set_runnable();
        return;
    }

    if task.state.load().contains(TaskFlags::ON_TIMER) {
        srv_log!(
            crate::logging::Severity::Critical,
            "run_after on a task already parked in the timer wheel"
        );
        if task.state.clear_on_timer()
            && let Some(old) = task.timer_ticket.lock().take()
        {
            old.cancelled.store(true, Ordering::Relaxed);
        }
    }
    if task.state.try_set_on_timer() {
        let ticket = TimerTicket::new(timer_time, Arc::clone(task));
        add_timer_ticket(&mut wheel, Arc::clone(&ticket));
        *task.timer_ticket.lock() = Some(ticket);
    }
    // Otherwise the task is queued or runnable already and will get its
    // slice without our help.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{SrvTask, TaskHandler, ThreadNum};

    struct Nop;
    impl TaskHandler for Nop {
        fn execute_slice(&mut self, _t: &TaskRef, _n: ThreadNum) {}
    }

    fn ticket_for(task: &TaskRef, at: i64) -> Arc<TimerTicket> {
        assert!(task.state.try_set_on_timer());
        let ticket = TimerTicket::new(at, Arc::clone(task));
        *task.timer_ticket.lock() = Some(Arc::clone(&ticket));
        ticket
    }

    #[test]
    fn near_ticket_lands_in_low_wheel_and_fires_on_time() {
        let mut wheel = TimerWheel::new();
        let now = time::cur_secs();
        wheel.last_fired_time = now;

        let task = SrvTask::new(Box::new(Nop));
        let ticket = ticket_for(&task, now + 3);
        add_timer_ticket(&mut wheel, ticket);

        for t in now + 1..now + 3 {
            fire_timers(&mut wheel, t);
            assert!(task.flags().contains(TaskFlags::ON_TIMER), "fired at {t}");
        }
        fire_timers(&mut wheel, now + 3);
        assert!(!task.flags().contains(TaskFlags::ON_TIMER));
        assert!(task.timer_ticket.lock().is_none());
    }

    #[test]
    fn far_ticket_descends_through_mid_wheels() {
        let mut wheel = TimerWheel::new();
        let now = time::cur_secs();
        let delay = 1000; // beyond the 256 s low-wheel range
        let fire_at = now + delay;

        let task = SrvTask::new(Box::new(Nop));
        add_timer_ticket(&mut wheel, ticket_for(&task, fire_at));
        let mid_count: usize = wheel.mid[0].iter().map(VecDeque::len).sum();
        assert_eq!(mid_count, 1, "far ticket must start on a mid wheel");

        // Walk the wheel forward one second at a time, as the service
        // thread would.
        for t in now + 1..=fire_at {
            if t & TIMER_LOW_MASK == 0 {
                shift_timers(&mut wheel, t);
            }
            fire_timers(&mut wheel, t);
            if t < fire_at {
                assert!(task.flags().contains(TaskFlags::ON_TIMER), "fired at {t}");
            }
        }
        assert!(!task.flags().contains(TaskFlags::ON_TIMER));
    }

    #[test]
    fn cancelled_ticket_does_not_fire() {
        let mut wheel = TimerWheel::new();
        let now = time::cur_secs();
        let task = SrvTask::new(Box::new(Nop));
        add_timer_ticket(&mut wheel, ticket_for(&task, now + 2));

        assert!(task.state.clear_on_timer());
        let ticket = task.timer_ticket.lock().take().unwrap();
        ticket.cancelled.store(true, Ordering::Relaxed);

        fire_timers(&mut wheel, now + 2);
        // The wake-up belongs to whoever cancelled, not to the wheel.
        assert!(!task.flags().contains(TaskFlags::ON_TIMER));
    }
}
