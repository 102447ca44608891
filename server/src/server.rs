//! Server facade: configuration, signals, component bring-up and the
//! shutdown state machine.
//!
//! Bring-up order matters: time first (everything stamps records), then the
//! logging pipeline, sockets manager, threads manager, memory manager and
//! timers. Shutdown walks `ShuttingDownSoft -> ShuttingDownHard -> Stopping
//! -> Stopped`, advancing when every worker is idle and every registered
//! callback agrees, or when the phase timeouts expire.

use crate::config::{ConfigError, Registry};
use crate::logging::{self, Severity};
use crate::socket::SocketFactory;
use crate::time::SrvTime;
use crate::{alloc, socket, srv_fatal, srv_log, threads, time, timers};
use core::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use sync::Mutex;

const CONFIG_SECTION: &str = "task_server";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum ServerState {
    NotInitialized = 0,
    Initialized = 1,
    Running = 2,
    ShuttingDownSoft = 3,
    ShuttingDownHard = 4,
    Stopping = 5,
    Stopped = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownType {
    Slow,
    Fast,
}

/// Services veto the final stop until their own state is safe to drop.
pub trait ShutdownCallback: Send {
    fn ready_for_shutdown(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("server initialized twice")]
    AlreadyInitialized,
    #[error("initialization failed: {0}")]
    InitFailed(&'static str),
}

static SRV_STATE: AtomicU8 = AtomicU8::new(ServerState::NotInitialized as u8);
static SEEN_SD_STATE: AtomicU8 = AtomicU8::new(ServerState::Running as u8);
static SHUTDOWN_START_TIME: Mutex<SrvTime> = Mutex::new(SrvTime::new(0, 0));
static SHUTDOWN_TO: AtomicI64 = AtomicI64::new(0);
static SLOW_SHUTDOWN_TO: AtomicI64 = AtomicI64::new(10);
static FAST_SHUTDOWN_TO: AtomicI64 = AtomicI64::new(2);
static ABORT_SHUTDOWN_TO: AtomicI64 = AtomicI64::new(0);
static SHUTDOWN_LIST: Mutex<Vec<Box<dyn ShutdownCallback>>> = Mutex::new(Vec::new());
static CONF_REGISTRY: Mutex<Option<Registry>> = Mutex::new(None);

fn srv_state() -> ServerState {
    match SRV_STATE.load(Ordering::SeqCst) {
        0 => ServerState::NotInitialized,
        1 => ServerState::Initialized,
        2 => ServerState::Running,
        3 => ServerState::ShuttingDownSoft,
        4 => ServerState::ShuttingDownHard,
        5 => ServerState::Stopping,
        _ => ServerState::Stopped,
    }
}

fn set_srv_state(state: ServerState) {
    SRV_STATE.store(state as u8, Ordering::SeqCst);
}

pub(crate) fn state_as_u8() -> u8 {
    SRV_STATE.load(Ordering::SeqCst)
}

pub fn is_running() -> bool {
    srv_state() == ServerState::Running
}

pub fn is_in_shutdown() -> bool {
    srv_state() >= ServerState::ShuttingDownSoft
}

pub fn is_in_hard_shutdown() -> bool {
    srv_state() >= ServerState::ShuttingDownHard
}

pub(crate) fn is_server_stopping() -> bool {
    srv_state() >= ServerState::Stopping
}

/// Requests shutdown with the matching phase timeout. Callable from any
/// thread and from the signal handler.
pub fn request_shutdown(shutdown_type: ShutdownType) {
    let timeout = match shutdown_type {
        ShutdownType::Slow => SLOW_SHUTDOWN_TO.load(Ordering::Relaxed),
        ShutdownType::Fast => FAST_SHUTDOWN_TO.load(Ordering::Relaxed),
    };
    SHUTDOWN_TO.store(timeout, Ordering::SeqCst);
    let _ = SRV_STATE.compare_exchange(
        ServerState::Running as u8,
        ServerState::ShuttingDownSoft as u8,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );
}

fn is_ready_for_shutdown() -> bool {
    let list = SHUTDOWN_LIST.lock();
    list.iter().all(|cb| cb.ready_for_shutdown())
}

/// Service-thread duty while a shutdown is in progress: stop listening,
/// fire the timers, escalate on timeout and detect full quiescence.
pub(crate) fn track_shutting_down() {
    let state = srv_state();
    if SEEN_SD_STATE.load(Ordering::SeqCst) != state as u8 {
        if SEEN_SD_STATE.load(Ordering::SeqCst) == ServerState::Running as u8 {
            srv_log!(Severity::Warning, "Server is starting shutdown procedures.");
            socket::request_stop_listening();
        }
        *SHUTDOWN_START_TIME.lock() = time::last_jiffy_time();
        SEEN_SD_STATE.store(state as u8, Ordering::SeqCst);
        timers::fire_all_timers();
    }

    let diff_time = SrvTime::current().since(*SHUTDOWN_START_TIME.lock());
    if srv_state() == ServerState::ShuttingDownSoft
        && diff_time.sec() >= SHUTDOWN_TO.load(Ordering::SeqCst)
    {
        srv_log!(
            Severity::Error,
            "Soft shutdown timeout has expired. Trying harder."
        );
        set_srv_state(ServerState::ShuttingDownHard);
        SEEN_SD_STATE.store(ServerState::ShuttingDownHard as u8, Ordering::SeqCst);
        timers::fire_all_timers();
    }

    if crate::scheduler::sched_is_all_idle() && is_ready_for_shutdown() {
        set_srv_state(ServerState::Stopping);
    }

    let abort_to = ABORT_SHUTDOWN_TO.load(Ordering::SeqCst);
    if srv_state() == ServerState::ShuttingDownHard && abort_to != 0 && diff_time.sec() >= abort_to
    {
        srv_fatal!("shutdown did not finish within max_shutdown_time, aborting");
    }
}

extern "C" fn term_handler(_sig: libc::c_int) {
    request_shutdown(ShutdownType::Fast);
}

fn init_signals() {
    // Safety: zeroed sigaction plus an explicit handler/flags is valid.
    unsafe {
        let mut sa: libc::sigaction = core::mem::zeroed();
        sa.sa_sigaction = term_handler as extern "C" fn(libc::c_int) as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigaction(libc::SIGINT, &raw const sa, core::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &raw const sa, core::ptr::null_mut());

        let mut ign: libc::sigaction = core::mem::zeroed();
        ign.sa_sigaction = libc::SIG_IGN;
        libc::sigaction(libc::SIGPIPE, &raw const ign, core::ptr::null_mut());
    }
}

fn configure_task_server(reg: &Registry) {
    SLOW_SHUTDOWN_TO.store(
        reg.get_int(CONFIG_SECTION, "slow_shutdown_timeout", 10),
        Ordering::Relaxed,
    );
    FAST_SHUTDOWN_TO.store(
        reg.get_int(CONFIG_SECTION, "fast_shutdown_timeout", 2),
        Ordering::Relaxed,
    );
    ABORT_SHUTDOWN_TO.store(
        reg.get_int(CONFIG_SECTION, "max_shutdown_time", 0),
        Ordering::Relaxed,
    );
}

fn read_configuration(reg: &Registry) -> Result<(), ServerError> {
    if !reg.has_section(CONFIG_SECTION) {
        return Err(ConfigError::MissingSection(CONFIG_SECTION.to_owned()).into());
    }
    configure_task_server(reg);
    time::configure(reg, CONFIG_SECTION);
    crate::scheduler::configure(reg, CONFIG_SECTION);
    threads::configure(reg, CONFIG_SECTION);
    socket::configure(reg, CONFIG_SECTION);
    logging::configure(reg, CONFIG_SECTION);
    Ok(())
}

/// Splits `-conffile`/`-logfile` out of the command line; other arguments
/// belong to the service on top.
fn process_parameters(args: &[String]) -> Result<Option<std::path::PathBuf>, ServerError> {
    logging::save_app_cmd_line(&args.join(" "));

    if let Some(argv0) = args.first() {
        let base = argv0.rsplit('/').next().unwrap_or(argv0);
        logging::set_app_base_name(base);
    }

    let mut conf_path = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-conffile" => {
                let Some(path) = args.get(i + 1) else {
                    return Err(ServerError::InitFailed("parameter -conffile misses file name"));
                };
                conf_path = Some(std::path::PathBuf::from(path));
                i += 2;
            }
            "-logfile" => {
                let Some(path) = args.get(i + 1) else {
                    return Err(ServerError::InitFailed("parameter -logfile misses file name"));
                };
                logging::set_log_file_name(path);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(conf_path)
}

/// The task-server entry points used by services built on the core.
pub struct TaskServer;

impl TaskServer {
    /// Full command-line initialization: flags, config file, every
    /// subsystem in order.
    pub fn initialize(args: &[String]) -> Result<(), ServerError> {
        time::init_time();
        let conf_path = process_parameters(args)?;
        let reg = match conf_path {
            Some(path) => Registry::load(&path)?,
            None => {
                let default = std::path::PathBuf::from(format!("{}.ini", logging::app_base_name()));
                Registry::load(&default)?
            }
        };
        Self::initialize_with_registry(reg)
    }

    /// Initialization with an already-built registry; the embedding service
    /// owns flag parsing.
    pub fn initialize_with_registry(reg: Registry) -> Result<(), ServerError> {
        if srv_state() != ServerState::NotInitialized {
            return Err(ServerError::AlreadyInitialized);
        }
        time::init_time();
        read_configuration(&reg)?;
        *CONF_REGISTRY.lock() = Some(reg);

        logging::init_logging();
        init_signals();
        if !socket::init_sockets_man() {
            return Err(ServerError::InitFailed("sockets manager"));
        }
        threads::init_threads_man();
        alloc::init_memory_man();
        init_time_man();
        timers::init_timers();

        set_srv_state(ServerState::Initialized);
        Ok(())
    }

    /// Runs the main loop; returns when the server has fully stopped.
    pub fn run() {
        set_srv_state(ServerState::Running);
        if socket::start_sockets_man() {
            threads::run_main_thread();
        }
        set_srv_state(ServerState::Stopped);
    }

    pub fn finalize() {
        socket::finalize_sockets_man();
        logging::finalize_logging();
    }

    pub fn request_shutdown(shutdown_type: ShutdownType) {
        request_shutdown(shutdown_type);
    }

    pub fn is_in_shutdown() -> bool {
        is_in_shutdown()
    }

    pub fn is_running() -> bool {
        is_running()
    }

    /// Registers a listening port; callable before or after startup.
    pub fn add_listening_port(port: u16, factory: Arc<dyn SocketFactory>) -> bool {
        socket::add_listening_port(port, factory)
    }

    pub fn add_shutdown_callback(callback: Box<dyn ShutdownCallback>) {
        SHUTDOWN_LIST.lock().push(callback);
    }

    pub fn config_registry() -> Option<Registry> {
        CONF_REGISTRY.lock().clone()
    }
}

fn init_time_man() {
    let adjuster = crate::task::SrvTask::new(Box::new(time::TzAdjuster));
    adjuster.set_runnable();
}
