//! Worker-thread lifecycle management.
//!
//! There are three roles: the *main* thread polls epoll and hands readiness
//! to tasks; the *service* thread advances the jiffy counter, runs the
//! timer wheel and drives worker start/stop; *worker* threads execute task
//! slices. Start and stop requests flow through a small manager state
//! machine, and the actual state flips ride on RCU so a stopping thread is
//! guaranteed to be out of every peer's sight before it is released.

use crate::logging::{self, LogData};
use crate::rcu::{self, RcuInfo};
use crate::{srv_fatal, srv_log};
use crate::scheduler::{self, SchedInfo};
use crate::socket::{self, SocketsData};
use crate::task::{TaskRef, ThreadNum};
use crate::time::{self, SrvTime};
use core::cell::RefCell;
use core::sync::atomic::{AtomicI64, AtomicU8, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use sync::{Futex, Mutex};

/// Room is reserved for the main and service threads so the total never
/// overflows the thread-number type.
pub(crate) const MAX_NUMBER_OF_THREADS: u16 = u16::MAX - 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum ThreadState {
    Starting = 0,
    Running = 1,
    Revived = 2,
    LockedForStop = 3,
    Stopped = 4,
    Released = 5,
    Dormant = 6,
}

impl ThreadState {
    fn from_u8(v: u8) -> ThreadState {
        match v {
            0 => ThreadState::Starting,
            1 => ThreadState::Running,
            2 => ThreadState::Revived,
            3 => ThreadState::LockedForStop,
            4 => ThreadState::Stopped,
            5 => ThreadState::Released,
            6 => ThreadState::Dormant,
            _ => unreachable!("invalid thread state {v}"),
        }
    }
}

pub struct SrvThread {
    pub(crate) thread_num: ThreadNum,
    pub(crate) seen_jiffy: AtomicU64,
    seen_secs: AtomicI64,
    state: AtomicU8,
    seen_srv_state: AtomicU8,
    pub(crate) cur_task: Mutex<Option<TaskRef>>,
    pub(crate) sched: SchedInfo,
    pub(crate) rcu: Mutex<RcuInfo>,
    pub(crate) socks: Mutex<SocketsData>,
    pub(crate) log: Mutex<LogData>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SrvThread {
    fn new(thread_num: ThreadNum) -> Arc<Self> {
        Arc::new(Self {
            thread_num,
            seen_jiffy: AtomicU64::new(0),
            seen_secs: AtomicI64::new(0),
            state: AtomicU8::new(ThreadState::Starting as u8),
            seen_srv_state: AtomicU8::new(0),
            cur_task: Mutex::new(None),
            sched: SchedInfo::new(),
            rcu: Mutex::new(RcuInfo::new()),
            socks: Mutex::new(SocketsData::new()),
            log: Mutex::new(LogData::new(thread_num)),
            join: Mutex::new(None),
        })
    }

    pub(crate) fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MgrState {
    Idle,
    PreparesToStop,
    ThreadExited,
    SocksMoved,
    NeedNewThread,
    Starting,
}

struct MgrInfo {
    state: MgrState,
    cur_thread: Option<Arc<SrvThread>>,
}

static THREADS: OnceLock<Vec<Arc<SrvThread>>> = OnceLock::new();
static MAX_RUNNING_THREADS: AtomicU16 = AtomicU16::new(20);
static THR_MGR: Mutex<MgrInfo> = Mutex::new(MgrInfo {
    state: MgrState::Idle,
    cur_thread: None,
});
static SVC_SIGNAL: Futex = Futex::new(0);

thread_local! {
    static CUR_THREAD: RefCell<Option<Arc<SrvThread>>> = const { RefCell::new(None) };
}

pub(crate) fn threads() -> &'static [Arc<SrvThread>] {
    THREADS.get().expect("threads manager not initialized")
}

pub(crate) fn threads_initialized() -> bool {
    THREADS.get().is_some()
}

pub(crate) fn max_running_threads() -> ThreadNum {
    MAX_RUNNING_THREADS.load(Ordering::Relaxed)
}

pub(crate) fn get_cur_thread() -> Option<Arc<SrvThread>> {
    CUR_THREAD
        .try_with(|cell| cell.borrow().clone())
        .ok()
        .flatten()
}

/// Runs `f` on the current thread's RCU list. Returns false when the caller
/// is not a managed thread.
pub(crate) fn with_cur_thread_rcu(f: impl FnOnce(&mut RcuInfo)) -> bool {
    match get_cur_thread() {
        Some(thr) => {
            f(&mut thr.rcu.lock());
            true
        }
        None => false,
    }
}

#[inline]
pub(crate) fn is_thread_running(thr: &SrvThread) -> bool {
    thr.state() <= ThreadState::Revived
}

pub(crate) fn cnt_running_threads() -> ThreadNum {
    let Some(threads) = THREADS.get() else {
        return 0;
    };
    let mut result = 0;
    for i in 1..=max_running_threads() {
        if !is_thread_running(&threads[i as usize]) {
            break;
        }
        result += 1;
    }
    result
}

fn set_cur_thread(thr: &Arc<SrvThread>) {
    CUR_THREAD.with(|cell| *cell.borrow_mut() = Some(Arc::clone(thr)));
}

fn register_new_thread(thr: &Arc<SrvThread>) {
    thr.set_state(ThreadState::Running);
    set_cur_thread(thr);
    let mut mgr = THR_MGR.lock();
    if mgr.state == MgrState::Starting {
        if !mgr
            .cur_thread
            .as_ref()
            .is_some_and(|t| Arc::ptr_eq(t, thr))
        {
            drop(mgr);
            srv_fatal!("thread manager in Starting state with a different thread");
        }
        mgr.state = MgrState::Idle;
        mgr.cur_thread = None;
    }
}

fn per_jiffy_tasks_main(thr: &Arc<SrvThread>) {
    if crate::server::is_in_shutdown() {
        rcu::pass_qs(&mut thr.rcu.lock());
        return;
    }

    let cur_jiffies = time::cur_jiffies();
    if thr.seen_jiffy.load(Ordering::Relaxed) == cur_jiffies {
        return;
    }
    thr.seen_jiffy.store(cur_jiffies, Ordering::Relaxed);
    rcu::pass_qs(&mut thr.rcu.lock());

    let cur_secs = time::cur_secs();
    if thr.seen_secs.load(Ordering::Relaxed) == cur_secs {
        return;
    }
    thr.seen_secs.store(cur_secs, Ordering::Relaxed);
    logging::check_logging_flush(thr);
}

fn per_jiffy_tasks_service(thr: &Arc<SrvThread>) {
    if crate::server::is_in_shutdown() {
        rcu::pass_qs(&mut thr.rcu.lock());
        return;
    }

    let cur_jiffies = time::cur_jiffies();
    if thr.seen_jiffy.load(Ordering::Relaxed) == cur_jiffies {
        return;
    }
    thr.seen_jiffy.store(cur_jiffies, Ordering::Relaxed);
    rcu::pass_qs(&mut thr.rcu.lock());
    scheduler::sched_check_overloads();

    let cur_secs = time::cur_secs();
    if thr.seen_secs.load(Ordering::Relaxed) == cur_secs {
        return;
    }
    thr.seen_secs.store(cur_secs, Ordering::Relaxed);
    logging::check_logging_flush(thr);
    crate::timers::timer_tick();
}

fn per_jiffy_tasks_worker(thr: &Arc<SrvThread>) {
    if crate::server::is_in_shutdown() {
        let srv_state = crate::server::state_as_u8();
        if thr.seen_srv_state.load(Ordering::Relaxed) != srv_state {
            thr.seen_srv_state.store(srv_state, Ordering::Relaxed);
            socket::set_all_socks_runnable(thr);
        }
        rcu::pass_qs(&mut thr.rcu.lock());
        socket::promote_sock_amount(thr);
        socket::check_connects_timeout(thr);
        if crate::server::is_server_stopping() && !rcu::has_calls(&thr.rcu.lock()) {
            thr.set_state(ThreadState::Stopped);
        }
        return;
    }

    let cur_jiffies = time::cur_jiffies();
    if thr.seen_jiffy.load(Ordering::Relaxed) == cur_jiffies {
        return;
    }
    thr.seen_jiffy.store(cur_jiffies, Ordering::Relaxed);
    rcu::pass_qs(&mut thr.rcu.lock());
    scheduler::sched_start_jiffy(thr);
    socket::promote_sock_amount(thr);
    socket::check_connects_timeout(thr);

    let cur_secs = time::cur_secs();
    if thr.seen_secs.load(Ordering::Relaxed) == cur_secs {
        return;
    }
    thr.seen_secs.store(cur_secs, Ordering::Relaxed);
    logging::check_logging_flush(thr);
    if thr.state() != ThreadState::LockedForStop {
        socket::clean_socket_list(thr);
        if thr.thread_num == 1 {
            let mgr_thr = {
                let mgr = THR_MGR.lock();
                if mgr.state == MgrState::ThreadExited {
                    mgr.cur_thread.clone()
                } else {
                    None
                }
            };
            if let Some(mgr_thr) = mgr_thr {
                socket::move_all_sockets(thr, &mgr_thr);
                let mut mgr = THR_MGR.lock();
                mgr.state = MgrState::SocksMoved;
            }
        }
    }
}

fn worker_thread_main(thr: Arc<SrvThread>) {
    register_new_thread(&thr);
    rcu::init_thread_rcu(&mut thr.rcu.lock());

    while thr.state() != ThreadState::Stopped {
        scheduler::sched_execute_task(&thr);
        per_jiffy_tasks_worker(&thr);
    }

    {
        let mut rcu = thr.rcu.lock();
        rcu::finalize_thread_rcu(&mut rcu);
    }
    crate::alloc::flush_current_thread();

    if !crate::server::is_server_stopping() {
        let mut mgr = THR_MGR.lock();
        if mgr.state != MgrState::PreparesToStop
            || !mgr
                .cur_thread
                .as_ref()
                .is_some_and(|t| Arc::ptr_eq(t, &thr))
        {
            drop(mgr);
            srv_fatal!("worker thread exited in an unexpected manager state");
        }
        mgr.state = MgrState::ThreadExited;
    }
}

fn start_thread(thr: &Arc<SrvThread>, role: &'static str) -> bool {
    let name = if role.is_empty() {
        format!("{}_{}", logging::app_base_name(), thr.thread_num)
    } else {
        format!("{}_{}", logging::app_base_name(), role)
    };
    let thr2 = Arc::clone(thr);
    let is_service = !role.is_empty();
    let spawned = std::thread::Builder::new().name(name).spawn(move || {
        if is_service {
            service_thread_main(thr2);
        } else {
            worker_thread_main(thr2);
        }
    });
    match spawned {
        Ok(handle) => {
            *thr.join.lock() = Some(handle);
            true
        }
        Err(err) => {
            srv_log!(
                crate::logging::Severity::Critical,
                "Unable to create new thread, result={err}"
            );
            false
        }
    }
}

/// Joins and releases the thread the manager just stopped.
fn stop_cur_mgr_thread() {
    let thr = {
        let mgr = THR_MGR.lock();
        mgr.cur_thread.clone()
    };
    let Some(thr) = thr else { return };

    if let Some(handle) = thr.join.lock().take()
        && handle.join().is_err()
    {
        srv_log!(
            crate::logging::Severity::Critical,
            "Cannot join a stopped worker thread"
        );
    }

    scheduler::release_thread_sched(&thr);
    logging::stop_thread_logging(&thr);

    let mut mgr = THR_MGR.lock();
    mgr.state = MgrState::Idle;
    thr.set_state(ThreadState::Released);
    mgr.cur_thread = None;
}

fn start_cur_mgr_thread() {
    let thr = {
        let mut mgr = THR_MGR.lock();
        mgr.state = MgrState::Starting;
        mgr.cur_thread.clone()
    };
    let Some(thr) = thr else { return };
    logging::start_thread_logging(&thr);
    if !start_thread(&thr, "") {
        let mut mgr = THR_MGR.lock();
        mgr.state = MgrState::Idle;
        thr.set_state(ThreadState::Released);
        mgr.cur_thread = None;
    }
}

fn service_thread_main(thr: Arc<SrvThread>) {
    set_cur_thread(&thr);
    rcu::init_thread_rcu(&mut thr.rcu.lock());

    let mut next_jfy_time = SrvTime::current().advanced_by(time::jiffy_time());
    loop {
        {
            let rcu = thr.rcu.lock();
            if crate::server::is_server_stopping() && !rcu::has_calls(&rcu) {
                break;
            }
        }
        per_jiffy_tasks_service(&thr);

        let mgr_state = THR_MGR.lock().state;
        if mgr_state == MgrState::NeedNewThread {
            start_cur_mgr_thread();
        } else if mgr_state == MgrState::SocksMoved {
            stop_cur_mgr_thread();
        }

        if crate::server::is_in_shutdown() {
            crate::server::track_shutting_down();
        }

        let cur_time = SrvTime::current();
        if next_jfy_time > cur_time {
            let wait = next_jfy_time.since(cur_time);
            SVC_SIGNAL.wait_value_change_timeout(
                0,
                std::time::Duration::new(wait.sec().max(0) as u64, wait.nsec()),
            );
        }
        time::inc_cur_jiffies();

        next_jfy_time = time::last_jiffy_time().advanced_by(time::jiffy_time());
    }

    rcu::finalize_thread_rcu(&mut thr.rcu.lock());
}

/// Asks for a new worker in the given released slot; a no-op while the
/// manager is busy or the server is shutting down.
pub(crate) fn request_thread_start(thr: &Arc<SrvThread>) {
    if crate::server::is_in_shutdown() {
        return;
    }
    let mut mgr = THR_MGR.lock();
    if mgr.state == MgrState::Idle && thr.state() == ThreadState::Released {
        mgr.state = MgrState::NeedNewThread;
        mgr.cur_thread = Some(Arc::clone(thr));
        thr.set_state(ThreadState::Starting);
    }
}

/// Asks an idle worker to stop. The state flip to Stopped rides through
/// RCU, so every peer observes the thread leaving before it exits.
pub(crate) fn request_thread_stop(thr: &Arc<SrvThread>) {
    if crate::server::is_in_shutdown() {
        return;
    }
    let mut mgr = THR_MGR.lock();
    if mgr.state == MgrState::Idle && thr.state() == ThreadState::Running {
        mgr.state = MgrState::PreparesToStop;
        mgr.cur_thread = Some(Arc::clone(thr));
        thr.set_state(ThreadState::LockedForStop);
        drop(mgr);
        let thr2 = Arc::clone(thr);
        rcu::call_rcu(Box::new(move || match thr2.state() {
            ThreadState::LockedForStop => thr2.set_state(ThreadState::Stopped),
            ThreadState::Revived => thr2.set_state(ThreadState::Running),
            state => srv_fatal!("unexpected thread state: {state:?}"),
        }));
    }
}

/// Cancels an in-flight stop because new work arrived for the thread.
pub(crate) fn request_thread_revive(thr: &Arc<SrvThread>) {
    let mut mgr = THR_MGR.lock();
    if thr.state() != ThreadState::LockedForStop || mgr.state != MgrState::PreparesToStop {
        drop(mgr);
        srv_fatal!("invalid thread state for revive");
    }
    thr.set_state(ThreadState::Revived);
    mgr.state = MgrState::Idle;
    mgr.cur_thread = None;
}

pub fn configure(reg: &crate::config::Registry, section: &str) {
    let max = reg.get_int(section, "max_threads", 20);
    let max = max.clamp(1, i64::from(MAX_NUMBER_OF_THREADS)) as u16;
    MAX_RUNNING_THREADS.store(max, Ordering::Relaxed);
}

/// Allocates the full thread table: slot 0 is the main thread, slots
/// `1..=max` are workers, the last slot is the service thread.
pub(crate) fn init_threads_man() {
    let max = max_running_threads();
    let mut threads = Vec::with_capacity(usize::from(max) + 2);
    for i in 0..=max + 1 {
        threads.push(SrvThread::new(i));
    }
    let main_thr = Arc::clone(&threads[0]);
    let svc_thr = Arc::clone(&threads[usize::from(max) + 1]);
    if THREADS.set(threads).is_err() {
        panic!("threads manager initialized twice");
    }

    main_thr.set_state(ThreadState::Dormant);
    svc_thr.set_state(ThreadState::Dormant);
    set_cur_thread(&main_thr);
    rcu::init_thread_rcu(&mut main_thr.rcu.lock());
}

fn start_all_threads() -> bool {
    logging::log_note_threads_started();

    let threads = threads();
    let max = max_running_threads();
    let svc = &threads[usize::from(max) + 1];
    if !start_thread(svc, "S") {
        return false;
    }
    for i in 1..=max {
        if !start_thread(&threads[i as usize], "") {
            for j in i..=max {
                threads[j as usize].set_state(ThreadState::Released);
            }
            break;
        }
    }
    true
}

fn join_all_threads() {
    let threads = threads();
    rcu::finalize_thread_rcu(&mut threads[0].rcu.lock());

    let max = max_running_threads();
    for i in 1..=max + 1 {
        let thr = &threads[i as usize];
        if let Some(handle) = thr.join.lock().take() {
            let _ = handle.join();
        }
        logging::release_thread_logging(thr);
    }
}

/// The main thread's loop: epoll readiness plus per-jiffy duties, until the
/// server reaches the Stopping state.
pub(crate) fn run_main_thread() {
    if !start_all_threads() {
        return;
    }
    if !is_thread_running(&threads()[1]) {
        crate::server::request_shutdown(crate::server::ShutdownType::Fast);
    }

    let main_thr = Arc::clone(&threads()[0]);
    while !crate::server::is_server_stopping() {
        per_jiffy_tasks_main(&main_thr);
        socket::do_socket_wait();
    }

    join_all_threads();
}
