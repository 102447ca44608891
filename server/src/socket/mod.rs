//! Epoll-driven sockets engine.
//!
//! One epoll instance serves the whole process. The main thread polls it
//! once per jiffy and turns readiness into epoch-counter bumps plus task
//! wake-ups; all actual I/O happens in the owning task's slices. Listeners
//! funnel into a single listener task that accepts in edge-triggered
//! batches and builds connection tasks through the factory registered with
//! the port.

mod task;

use crate::logging::{DiagMsg, Severity};
use crate::scheduler;
use crate::srv_log;
use crate::task::{SrvTask, TaskFlags, TaskHandler, TaskRef, ThreadNum};
use crate::threads::{self, SrvThread};
use crate::time;
use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use sync::Mutex;

pub use task::{SockState, SocketsData};
pub(crate) use task::{
    SOCK_MIN_WRITE_SIZE, SOCK_READ_BUF_SIZE, SockBuffers, compact_wr_buffer, flush_data,
    is_write_data_pending, read_from_socket, read_to_buf_inner, write_inner,
};

/// Builds the per-connection handler for every socket accepted on a port.
pub trait SocketFactory: Send + Sync {
    fn create_socket_task(&self) -> Box<dyn TaskHandler>;
}

const EPOLL_EVENTS_ARRAY_SIZE: usize = 100;
/// 16 slots fit one cache line of counters and are plenty for one server.
pub const MAX_CNT_LISTENING_SOCKS: usize = 16;

const LISTENER_TAG: u64 = 1 << 63;

struct ListenSockInfo {
    index: usize,
    port: u16,
    fd: AtomicI32,
    factory: Arc<dyn SocketFactory>,
}

static EPOLL_FD: AtomicI32 = AtomicI32::new(-1);
static LISTEN_SOCKS: Mutex<ArrayVec<Arc<ListenSockInfo>, MAX_CNT_LISTENING_SOCKS>> =
    Mutex::new(ArrayVec::new_const());
static LISTEN_EVENTS: [AtomicU32; MAX_CNT_LISTENING_SOCKS] =
    [const { AtomicU32::new(0) }; MAX_CNT_LISTENING_SOCKS];
static LISTEN_ERRORS: [AtomicU32; MAX_CNT_LISTENING_SOCKS] =
    [const { AtomicU32::new(0) }; MAX_CNT_LISTENING_SOCKS];
static LISTENER: OnceLock<TaskRef> = OnceLock::new();
static SOCK_REGISTRY: Mutex<Option<HashMap<i32, TaskRef>>> = Mutex::new(None);
static TOTAL_SOCKETS: AtomicI64 = AtomicI64::new(0);
static SOFT_SOCKET_LIMIT: AtomicI64 = AtomicI64::new(1000);
static HARD_SOCKET_LIMIT: AtomicI64 = AtomicI64::new(2000);
static CONN_TIMEOUT_JIFFIES: AtomicU64 = AtomicU64::new(10);
static SOCKET_TIMEOUT: AtomicI64 = AtomicI64::new(300);
static OLD_SOCKS_DEL_BATCH: AtomicUsize = AtomicUsize::new(10);
static HOST_NAME: OnceLock<String> = OnceLock::new();

const MAX_DEL_BATCH: usize = 100;

pub fn configure(reg: &crate::config::Registry, section: &str) {
    SOFT_SOCKET_LIMIT.store(
        reg.get_int(section, "soft_sockets_limit", 1000),
        Ordering::Relaxed,
    );
    HARD_SOCKET_LIMIT.store(
        reg.get_int(section, "hard_sockets_limit", 2000),
        Ordering::Relaxed,
    );
    let conn_timeout_ms = reg.get_int(section, "connection_timeout", 100).max(1) as u64;
    let jiffy_nsec = u64::from(time::jiffy_time().nsec()).max(1);
    CONN_TIMEOUT_JIFFIES.store(
        (conn_timeout_ms * time::NSECS_PER_MSEC / jiffy_nsec).max(1),
        Ordering::Relaxed,
    );
    SOCKET_TIMEOUT.store(
        reg.get_int(section, "min_socket_inactivity", 300),
        Ordering::Relaxed,
    );
    let batch = reg.get_int(section, "sockets_cleaning_batch", 10).max(10) as usize;
    OLD_SOCKS_DEL_BATCH.store(batch.min(MAX_DEL_BATCH), Ordering::Relaxed);
}

pub(crate) fn conn_timeout_jiffies() -> u64 {
    CONN_TIMEOUT_JIFFIES.load(Ordering::Relaxed)
}

pub(crate) fn total_sockets() -> i64 {
    TOTAL_SOCKETS.load(Ordering::Relaxed)
}

/// Cached result of `gethostname`.
pub fn host_name() -> String {
    HOST_NAME
        .get_or_init(|| {
            let mut buf = [0u8; 256];
            // Safety: buf is a live out-buffer for the call.
            let res = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
            if res != 0 {
                return String::new();
            }
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..len]).into_owned()
        })
        .clone()
}

/// Dotted-quad form of an IPv4 address kept in network byte order.
pub fn ip_to_string(ip: u32) -> String {
    let b = ip.to_ne_bytes();
    format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

pub(crate) fn log_socket_error(severity: Severity, fd: i32, prefix: &str) {
    let mut sock_errno: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    // Safety: out-params are live locals of the right size.
    let res = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&raw mut sock_errno).cast(),
            &raw mut len,
        )
    };
    let sock_errno = if res != 0 { last_errno() } else { sock_errno };
    if sock_errno != 0 {
        srv_log!(severity, "{prefix}, errno={sock_errno}");
    }
}

pub(crate) fn set_socket_nonblock(sock: i32) -> bool {
    // Safety: fcntl on a descriptor we own.
    let res = unsafe { libc::fcntl(sock, libc::F_SETFL, libc::O_NONBLOCK) };
    if res != 0 {
        srv_log!(
            Severity::Critical,
            "Cannot set socket non-blocking, errno={}",
            last_errno()
        );
        return false;
    }
    true
}

fn setsockopt_int(sock: i32, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> bool {
    // Safety: value is a live local of the advertised size.
    let res = unsafe {
        libc::setsockopt(
            sock,
            level,
            name,
            (&raw const value).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    res == 0
}

pub(crate) fn set_socket_options(sock: i32) -> bool {
    if !setsockopt_int(sock, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1) {
        srv_log!(
            Severity::Critical,
            "Cannot set socket's keep-alive property, errno={}",
            last_errno()
        );
        return false;
    }
    if !setsockopt_int(sock, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1) {
        srv_log!(
            Severity::Critical,
            "Cannot set socket's no-delay property, errno={}",
            last_errno()
        );
        return false;
    }
    true
}

fn set_socket_quick_ack(sock: i32) {
    if !setsockopt_int(sock, libc::IPPROTO_TCP, libc::TCP_QUICKACK, 1) {
        srv_log!(
            Severity::Critical,
            "Cannot set socket's quick-ack property, errno={}",
            last_errno()
        );
    }
}

/// Closes a descriptor; with `do_abort` the close sends RST instead of
/// lingering on unsent data.
pub(crate) fn close_fd(fd: i32, do_abort: bool) {
    if do_abort {
        let lgr = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        // Safety: lgr is a live local of the advertised size.
        let res = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                (&raw const lgr).cast(),
                size_of::<libc::linger>() as libc::socklen_t,
            )
        };
        if res != 0 {
            srv_log!(Severity::Critical, "Error setting so_linger, errno={}", last_errno());
        }
    }

    loop {
        // Safety: fd is a descriptor we own; EINTR retries are safe for
        // sockets on Linux.
        let res = unsafe { libc::close(fd) };
        if res == 0 || last_errno() != libc::EINTR {
            if res != 0 {
                srv_log!(Severity::Critical, "Error closing socket, errno={}", last_errno());
            }
            return;
        }
    }
}

fn with_registry<R>(f: impl FnOnce(&mut HashMap<i32, TaskRef>) -> R) -> R {
    let mut reg = SOCK_REGISTRY.lock();
    f(reg.get_or_insert_with(HashMap::new))
}

fn create_listening_socket(info: &ListenSockInfo) -> bool {
    // Safety: plain socket creation.
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if sock == -1 {
        srv_log!(Severity::Critical, "Cannot create socket, errno={}", last_errno());
        return false;
    }
    if !set_socket_nonblock(sock) {
        close_fd(sock, false);
        return false;
    }
    if !setsockopt_int(sock, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1) {
        srv_log!(
            Severity::Error,
            "Cannot set socket's reuse-address property, errno={}",
            last_errno()
        );
    }

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: info.port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(std::net::Ipv4Addr::UNSPECIFIED.octets()),
        },
        sin_zero: [0; 8],
    };
    // Safety: addr is a properly initialized sockaddr_in.
    let res = unsafe {
        libc::bind(
            sock,
            (&raw const addr).cast(),
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if res != 0 {
        srv_log!(
            Severity::Critical,
            "Cannot bind socket to port {}, errno={}",
            info.port,
            last_errno()
        );
        close_fd(sock, false);
        return false;
    }
    // Safety: sock is a bound stream socket.
    if unsafe { libc::listen(sock, 128) } != 0 {
        srv_log!(Severity::Critical, "Cannot listen on a socket, errno={}", last_errno());
        close_fd(sock, false);
        return false;
    }

    let mut evt = libc::epoll_event {
        events: (libc::EPOLLIN | libc::EPOLLET) as u32,
        u64: LISTENER_TAG | info.index as u64,
    };
    // Safety: evt is a live epoll_event.
    let res = unsafe {
        libc::epoll_ctl(
            EPOLL_FD.load(Ordering::SeqCst),
            libc::EPOLL_CTL_ADD,
            sock,
            &raw mut evt,
        )
    };
    if res != 0 {
        srv_log!(
            Severity::Critical,
            "Cannot add listening socket to epoll, errno={}",
            last_errno()
        );
        close_fd(sock, false);
        return false;
    }

    info.fd.store(sock, Ordering::SeqCst);
    true
}

/// Registers a port with its connection factory; binds immediately when the
/// server is already running. Bounded by [`MAX_CNT_LISTENING_SOCKS`].
pub fn add_listening_port(port: u16, factory: Arc<dyn SocketFactory>) -> bool {
    let mut socks = LISTEN_SOCKS.lock();
    if socks.len() == MAX_CNT_LISTENING_SOCKS {
        return false;
    }
    let info = Arc::new(ListenSockInfo {
        index: socks.len(),
        port,
        fd: AtomicI32::new(-1),
        factory,
    });
    socks.push(Arc::clone(&info));
    if crate::server::is_running() {
        create_listening_socket(&info)
    } else {
        true
    }
}

fn listen_socks_snapshot() -> Vec<Arc<ListenSockInfo>> {
    LISTEN_SOCKS.lock().iter().cloned().collect()
}

pub(crate) fn init_sockets_man() -> bool {
    // Safety: epoll_create with any positive hint.
    let epfd = unsafe { libc::epoll_create(1) };
    if epfd == -1 {
        srv_log!(
            Severity::Critical,
            "Cannot create epoll descriptor, errno={}",
            last_errno()
        );
        return false;
    }
    EPOLL_FD.store(epfd, Ordering::SeqCst);

    if host_name().is_empty() {
        srv_log!(Severity::Critical, "Error in gethostname");
        return false;
    }
    let _ = LISTENER.set(SrvTask::new(Box::new(ListenerHandler::new())));
    true
}

pub(crate) fn start_sockets_man() -> bool {
    let socks = listen_socks_snapshot();
    if socks.is_empty() {
        srv_log!(Severity::Critical, "There's no listening sockets, shutting down");
        return false;
    }
    for info in &socks {
        if !create_listening_socket(info) {
            return false;
        }
    }
    true
}

pub(crate) fn finalize_sockets_man() {
    let epfd = EPOLL_FD.swap(-1, Ordering::SeqCst);
    if epfd != -1 {
        // Safety: epfd came from epoll_create.
        unsafe { libc::close(epfd) };
    }
}

fn register_listen_event(index: usize, events: u32) {
    if index >= MAX_CNT_LISTENING_SOCKS {
        return;
    }
    if events & libc::EPOLLIN as u32 != 0 {
        LISTEN_EVENTS[index].fetch_add(1, Ordering::SeqCst);
    } else if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
        LISTEN_ERRORS[index].fetch_add(1, Ordering::SeqCst);
    }
    if let Some(listener) = LISTENER.get() {
        listener.set_runnable();
    }
}

fn register_client_event(task: &TaskRef, events: u32) {
    let Some(st) = task.sock() else { return };
    if events & libc::EPOLLIN as u32 != 0
        && st.seen_read_evts.load(Ordering::SeqCst) == st.reg_read_evts.load(Ordering::SeqCst)
    {
        st.reg_read_evts.fetch_add(1, Ordering::SeqCst);
    }
    if events & libc::EPOLLOUT as u32 != 0
        && st.seen_write_evts.load(Ordering::SeqCst) == st.reg_write_evts.load(Ordering::SeqCst)
    {
        st.reg_write_evts.fetch_add(1, Ordering::SeqCst);
    }
    if events & libc::EPOLLRDHUP as u32 != 0 {
        st.reg_read_hup.store(true, Ordering::SeqCst);
    }
    if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
        st.reg_error.store(true, Ordering::SeqCst);
    }
    task.set_runnable();
}

/// One `epoll_wait` bounded by the jiffy; main-thread duty.
pub(crate) fn do_socket_wait() {
    let jiffy = time::jiffy_time();
    let mut wait_msec = (u64::from(jiffy.nsec()) / time::NSECS_PER_MSEC) as i32;
    if wait_msec == 0 {
        wait_msec = 1;
    }
    // Safety: zeroed epoll_event array is a valid out-buffer.
    let mut events: [libc::epoll_event; EPOLL_EVENTS_ARRAY_SIZE] = unsafe { core::mem::zeroed() };
    // Safety: events is a live out-buffer of the advertised length.
    let res = unsafe {
        libc::epoll_wait(
            EPOLL_FD.load(Ordering::SeqCst),
            events.as_mut_ptr(),
            EPOLL_EVENTS_ARRAY_SIZE as i32,
            wait_msec,
        )
    };
    if res < 0 {
        let errno = last_errno();
        if errno != libc::EINTR {
            srv_log!(Severity::Critical, "Error in epoll_wait, errno={errno}");
        }
        return;
    }
    for evt in &events[..res as usize] {
        let data = evt.u64;
        if data & LISTENER_TAG != 0 {
            register_listen_event((data & !LISTENER_TAG) as usize, evt.events);
        } else {
            let fd = data as i32;
            let task = with_registry(|reg| reg.get(&fd).cloned());
            if let Some(task) = task {
                register_client_event(&task, evt.events);
            }
        }
    }
}

/// Emits the `request-start` record with connection parameters and attaches
/// a fresh diagnostic context to the task.
pub(crate) fn create_diag_request(task: &TaskRef, port: u16, phost: u32, pport: u16) {
    task.create_new_diag_ctx();
    let ctx = task.diag_ctx().expect("fresh diag ctx");
    ctx.set_client_ip(&ip_to_string(phost));
    DiagMsg::new()
        .start_request(&ctx)
        .param("_type", "conn")
        .param("pport", pport)
        .param("port", port)
        .param("conn", ctx.request_id());
}

pub(crate) fn local_port(fd: i32) -> u16 {
    // Safety: zeroed sockaddr_in is a valid out-param.
    let mut addr: libc::sockaddr_in = unsafe { core::mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
    // Safety: out-params are live locals.
    let res = unsafe { libc::getsockname(fd, (&raw mut addr).cast(), &raw mut len) };
    if res == 0 {
        u16::from_be(addr.sin_port)
    } else {
        srv_log!(
            Severity::Critical,
            "Cannot read local port of socket, errno={}",
            last_errno()
        );
        0
    }
}

/// Hooks a connected socket into the engine: socket list, epoll, registry,
/// scheduler.
pub(crate) fn start_processing(task: &TaskRef, thread_num: ThreadNum) -> bool {
    let st = task.sock().expect("start_processing on a non-socket task");
    let cur_thr = threads::get_cur_thread();
    if let Some(thr) = cur_thr.as_ref() {
        let mut socks = thr.socks.lock();
        socks.sock_list.push(Arc::clone(task));
        socks.sock_cnt += 1;
    }
    st.last_active.store(time::cur_secs(), Ordering::Relaxed);
    let last = if thread_num != 0 {
        thread_num
    } else {
        cur_thr.map_or(0, |t| t.thread_num)
    };
    task.last_thread.store(last, Ordering::Relaxed);

    let fd = st.fd();
    with_registry(|reg| reg.insert(fd, Arc::clone(task)));
    let mut evt = libc::epoll_event {
        events: (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLET) as u32,
        u64: fd as u64,
    };
    // Safety: evt is a live epoll_event and fd is open.
    let res = unsafe {
        libc::epoll_ctl(
            EPOLL_FD.load(Ordering::SeqCst),
            libc::EPOLL_CTL_ADD,
            fd,
            &raw mut evt,
        )
    };
    if res != 0 {
        srv_log!(Severity::Critical, "Cannot add socket to epoll, errno={}", last_errno());
        with_registry(|reg| reg.remove(&fd));
        return false;
    }

    task.set_runnable();
    true
}

/// Closes the task's socket and settles its request context.
pub(crate) fn close_socket_task(task: &TaskRef, do_abort: bool) {
    let Some(st) = task.sock() else { return };
    let fd = {
        let fd = st.fd();
        if fd == -1 {
            return;
        }
        st.set_fd(-1);
        fd
    };
    // Unregister before closing: the descriptor number is reusable the
    // moment close returns.
    with_registry(|reg| reg.remove(&fd));
    close_fd(fd, do_abort);

    if let Some(ctx) = task.diag_ctx() {
        {
            let bufs = st.buffers.lock();
            ctx.set_bytes_rd(bufs.read_bytes);
            ctx.set_bytes_wr(bufs.written_bytes);
        }
        if ctx.is_running() {
            DiagMsg::new().stop_request(&ctx);
        }
        task.release_diag_ctx();
    }
    if let Some(thr) = threads::get_cur_thread() {
        thr.socks.lock().sock_cnt -= 1;
    }
}

/// Accept/error pump for all listening ports; a single task processes the
/// per-port counters bumped by the epoll thread.
struct ListenerHandler {
    seen_events: [u32; MAX_CNT_LISTENING_SOCKS],
    seen_errors: [u32; MAX_CNT_LISTENING_SOCKS],
}

impl ListenerHandler {
    fn new() -> Self {
        Self {
            seen_events: [0; MAX_CNT_LISTENING_SOCKS],
            seen_errors: [0; MAX_CNT_LISTENING_SOCKS],
        }
    }

    fn process_listen_error(&mut self, info: &ListenSockInfo) {
        self.seen_errors[info.index] = LISTEN_ERRORS[info.index].load(Ordering::SeqCst);
        let fd = info.fd.swap(-1, Ordering::SeqCst);
        if fd != -1 {
            log_socket_error(Severity::Critical, fd, "Error in listening socket");
            close_fd(fd, true);
        }
        if !crate::server::is_in_shutdown() {
            create_listening_socket(info);
        }
    }

    fn process_listen_event(&mut self, info: &ListenSockInfo, thr_num: ThreadNum) {
        self.seen_events[info.index] = LISTEN_EVENTS[info.index].load(Ordering::SeqCst);
        loop {
            // Safety: zeroed sockaddr_in is a valid out-param.
            let mut addr: libc::sockaddr_in = unsafe { core::mem::zeroed() };
            let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
            // Safety: out-params are live locals.
            let new_sock = unsafe {
                libc::accept(info.fd.load(Ordering::SeqCst), (&raw mut addr).cast(), &raw mut len)
            };
            if new_sock == -1 {
                let errno = last_errno();
                if errno != libc::EAGAIN
                    && errno != libc::EWOULDBLOCK
                    && !crate::server::is_in_shutdown()
                {
                    srv_log!(Severity::Critical, "Error accepting new socket, errno={errno}");
                    let fd = info.fd.swap(-1, Ordering::SeqCst);
                    if fd != -1 {
                        close_fd(fd, true);
                    }
                    create_listening_socket(info);
                }
                return;
            }
            if total_sockets() >= HARD_SOCKET_LIMIT.load(Ordering::Relaxed) {
                srv_log!(
                    Severity::Error,
                    "Number of open sockets {} is bigger than hard limit {}. \
                     Rejecting new connection.",
                    total_sockets(),
                    HARD_SOCKET_LIMIT.load(Ordering::Relaxed)
                );
                close_fd(new_sock, true);
                continue;
            }
            if !set_socket_nonblock(new_sock) || !set_socket_options(new_sock) {
                close_fd(new_sock, true);
                continue;
            }

            let handler = info.factory.create_socket_task();
            let peer_addr = addr.sin_addr.s_addr;
            let peer_port = u16::from_be(addr.sin_port);
            let conn = SrvTask::new_socket(handler, SockState::new(new_sock, peer_addr, peer_port));
            create_diag_request(&conn, info.port, peer_addr, peer_port);
            if !start_processing(&conn, thr_num) {
                conn.terminate();
            }
        }
    }
}

impl TaskHandler for ListenerHandler {
    fn execute_slice(&mut self, _task: &TaskRef, thr_num: ThreadNum) {
        for info in listen_socks_snapshot() {
            if self.seen_errors[info.index] != LISTEN_ERRORS[info.index].load(Ordering::SeqCst) {
                self.process_listen_error(&info);
            }
            if self.seen_events[info.index] != LISTEN_EVENTS[info.index].load(Ordering::SeqCst) {
                self.process_listen_event(&info, thr_num);
            }
            if crate::server::is_in_shutdown() {
                let fd = info.fd.swap(-1, Ordering::SeqCst);
                if fd != -1 {
                    close_fd(fd, false);
                }
            }
        }
    }
}

pub(crate) fn request_stop_listening() {
    if let Some(listener) = LISTENER.get() {
        listener.set_runnable();
    }
}

/// Adds this thread's socket-count delta to the global total.
pub(crate) fn promote_sock_amount(thr: &SrvThread) {
    let mut socks = thr.socks.lock();
    TOTAL_SOCKETS.fetch_add(i64::from(socks.sock_cnt), Ordering::Relaxed);
    socks.sock_cnt = 0;
}

/// Flags an error on connects that exceeded their jiffy budget without a
/// write event.
pub(crate) fn check_connects_timeout(thr: &SrvThread) {
    let to_wake = {
        let socks = thr.socks.lock();
        let mut to_wake = Vec::new();
        for task in &socks.sock_list {
            let Some(st) = task.sock() else { continue };
            let conn_jfy = st.conn_start_jfy.load(Ordering::SeqCst);
            if conn_jfy != 0
                && time::cur_jiffies().saturating_sub(conn_jfy) > conn_timeout_jiffies()
                && st.reg_write_evts.load(Ordering::SeqCst)
                    == st.seen_write_evts.load(Ordering::SeqCst)
                && !st.reg_error.load(Ordering::SeqCst)
            {
                st.reg_error.store(true, Ordering::SeqCst);
                to_wake.push(Arc::clone(task));
            }
        }
        to_wake
    };
    for task in to_wake {
        task.set_runnable();
    }
}

/// Asks the least-recently-active sockets beyond the inactivity threshold
/// to close, a batch at a time; runs only above the soft limit.
fn delete_oldest_sockets(sock_list: &[TaskRef]) {
    let batch = OLD_SOCKS_DEL_BATCH.load(Ordering::Relaxed).min(MAX_DEL_BATCH);
    let limit_time = time::cur_secs() - SOCKET_TIMEOUT.load(Ordering::Relaxed);
    let mut oldest: ArrayVec<(i64, TaskRef), MAX_DEL_BATCH> = ArrayVec::new();

    for task in sock_list {
        let Some(st) = task.sock() else { continue };
        let active = st.last_active.load(Ordering::Relaxed);
        if active >= limit_time {
            continue;
        }
        // Keep the batch sorted by last activity, oldest last to evict
        // first-inserted cheaply.
        let pos = oldest.partition_point(|(a, _)| *a <= active);
        if pos >= batch {
            continue;
        }
        if oldest.len() == batch {
            oldest.pop();
        }
        oldest.insert(pos, (active, Arc::clone(task)));
    }

    for (active, task) in oldest {
        if active < limit_time
            && let Some(st) = task.sock()
        {
            // Closing happens in the task's own slice; it may need to
            // finalize before the descriptor can go.
            st.need_to_close.store(true, Ordering::SeqCst);
            task.set_runnable();
        }
    }
}

/// Sweeps out terminated sockets and, under socket pressure, nominates idle
/// ones for closing. Runs once per second per worker.
pub(crate) fn clean_socket_list(thr: &SrvThread) {
    let (terminated, snapshot) = {
        let mut socks = thr.socks.lock();
        let mut terminated = Vec::new();
        socks.sock_list.retain(|task| {
            if task.flags().contains(TaskFlags::NEED_TERMINATION) {
                terminated.push(Arc::clone(task));
                false
            } else {
                true
            }
        });
        let snapshot = if total_sockets() >= SOFT_SOCKET_LIMIT.load(Ordering::Relaxed) {
            socks.sock_list.clone()
        } else {
            Vec::new()
        };
        (terminated, snapshot)
    };
    for task in terminated {
        scheduler::mark_task_terminated(&task, true);
    }
    if !snapshot.is_empty() {
        delete_oldest_sockets(&snapshot);
    }
}

pub(crate) fn set_all_socks_runnable(thr: &SrvThread) {
    let tasks = thr.socks.lock().sock_list.clone();
    for task in tasks {
        task.set_runnable();
    }
}

/// Hands every socket of a stopping thread to the surviving thread.
pub(crate) fn move_all_sockets(dst_thr: &SrvThread, src_thr: &SrvThread) {
    let (mut list, cnt) = {
        let mut src = src_thr.socks.lock();
        let list = core::mem::take(&mut src.sock_list);
        let cnt = src.sock_cnt;
        src.sock_cnt = 0;
        (list, cnt)
    };
    let mut dst = dst_thr.socks.lock();
    dst.sock_list.append(&mut list);
    dst.sock_cnt += cnt;
}

fn need_early_close_locked(st: &SockState, bufs: &SockBuffers) -> bool {
    st.need_to_close.load(Ordering::SeqCst)
        || crate::server::is_in_hard_shutdown()
        || st.has_error()
        || !bufs.sock_can_read_more
}

/// The byte pump between a proxy source and its destination; driven only
/// from the source side. On completion or error both sides detach and the
/// destination is woken.
pub(crate) fn do_data_proxy(src_task: &TaskRef) {
    let src_st = src_task.sock().expect("proxy source has no socket");
    let dst_task = { src_st.buffers.lock().proxy_dst.clone() };
    let Some(dst_task) = dst_task else { return };
    let dst_st = dst_task.sock().expect("proxy destination has no socket");

    // Lock order is always source then destination; the destination's own
    // slices never touch the source's buffers.
    let mut src_bufs = src_st.buffers.lock();
    let mut dst_bufs = dst_st.buffers.lock();

    let mut had_error = false;
    let finished = loop {
        if need_early_close_locked(src_st, &src_bufs) || need_early_close_locked(dst_st, &dst_bufs)
        {
            had_error = true;
            break true;
        }
        if src_bufs.proxy_size == 0 {
            break true;
        }

        if src_bufs.rd_pos < src_bufs.rd_size {
            // Drain the source's read buffer first; Write decides whether
            // bytes go to dst's buffer or its socket.
            let to_write = (src_bufs.rd_size - src_bufs.rd_pos)
                .min(src_bufs.proxy_size.min(usize::MAX as u64) as usize);
            let chunk = src_bufs.rd_buf[src_bufs.rd_pos..src_bufs.rd_pos + to_write].to_vec();
            let n_done = write_inner(dst_st, &mut dst_bufs, &chunk);
            src_bufs.proxy_size -= n_done as u64;
            src_bufs.rd_pos += n_done;
            if need_early_close_locked(dst_st, &dst_bufs) {
                had_error = true;
                break true;
            }
            if n_done < to_write {
                break false;
            }
            continue;
        }

        let mut to_read = dst_bufs.wr_buf.len() - dst_bufs.wr_size;
        if to_read == 0 {
            flush_data(dst_st, &mut dst_bufs);
            if need_early_close_locked(dst_st, &dst_bufs) {
                had_error = true;
                break true;
            }
            compact_wr_buffer(&mut dst_bufs);
            to_read = dst_bufs.wr_buf.len() - dst_bufs.wr_size;
            if to_read == 0 {
                break false;
            }
        }
        to_read = to_read.min(src_bufs.proxy_size.min(usize::MAX as u64) as usize);

        let n_done = if to_read < SOCK_READ_BUF_SIZE {
            // Small amount left: stage through the source's read buffer.
            read_to_buf_inner(src_st, &mut src_bufs);
            if need_early_close_locked(src_st, &src_bufs) {
                had_error = true;
                break true;
            }
            debug_assert_eq!(src_bufs.rd_pos, 0);
            let n = src_bufs.rd_size.min(to_read);
            let wr_size = dst_bufs.wr_size;
            dst_bufs.wr_buf[wr_size..wr_size + n].copy_from_slice(&src_bufs.rd_buf[..n]);
            src_bufs.rd_pos = n;
            n
        } else {
            // Big amount: read straight from the source socket into the
            // destination's write buffer.
            let wr_size = dst_bufs.wr_size;
            let n = read_from_socket(
                src_st,
                &mut src_bufs,
                &mut dst_bufs.wr_buf[wr_size..wr_size + to_read],
            );
            if need_early_close_locked(src_st, &src_bufs) {
                had_error = true;
                break true;
            }
            n
        };
        if n_done == 0 {
            break false;
        }

        dst_bufs.wr_size += n_done;
        src_bufs.proxy_size -= n_done as u64;
        if dst_bufs.wr_size >= SOCK_MIN_WRITE_SIZE {
            flush_data(dst_st, &mut dst_bufs);
            if need_early_close_locked(dst_st, &dst_bufs) {
                had_error = true;
                break true;
            }
            compact_wr_buffer(&mut dst_bufs);
        }
    };

    if !finished {
        return;
    }
    if had_error {
        src_bufs.proxy_had_error = true;
        dst_bufs.proxy_had_error = true;
    }
    src_bufs.proxy_dst = None;
    dst_bufs.proxy_src = None;
    drop(dst_bufs);
    drop(src_bufs);
    dst_task.set_runnable();
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    struct Nop;
    impl TaskHandler for Nop {
        fn execute_slice(&mut self, _t: &TaskRef, _n: ThreadNum) {}
    }

    fn socket_task_pair() -> (TaskRef, i32) {
        let mut fds = [0i32; 2];
        // Safety: fds is a live out-array.
        let res = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(res, 0);
        assert!(set_socket_nonblock(fds[0]));
        let task = SrvTask::new_socket(Box::new(Nop), SockState::new(fds[0], 0, 0));
        (task, fds[1])
    }

    fn feed(peer: i32, data: &[u8]) {
        // Safety: data is a live slice and peer is open.
        let n = unsafe { libc::send(peer, data.as_ptr().cast(), data.len(), 0) };
        assert_eq!(n, data.len() as isize);
    }

    fn drain(peer: i32, out: &mut Vec<u8>) {
        let mut buf = [0u8; 4096];
        loop {
            // Safety: buf is a live out-buffer.
            let n = unsafe {
                libc::recv(
                    peer,
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if n <= 0 {
                return;
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
    }

    fn allow_read(task: &TaskRef) {
        let st = task.sock().unwrap();
        st.reg_read_evts.fetch_add(1, Ordering::SeqCst);
    }

    fn allow_write(task: &TaskRef) {
        let st = task.sock().unwrap();
        st.reg_write_evts.fetch_add(1, Ordering::SeqCst);
    }

    fn close_peer(peer: i32) {
        // Safety: peer is a descriptor owned by the test.
        unsafe { libc::close(peer) };
    }

    #[test]
    fn line_reader_handles_all_terminators() {
        let (task, peer) = socket_task_pair();
        feed(peer, b"abc\r\ndef\n\0ghi\n");
        allow_read(&task);

        let mut line = String::new();
        assert!(task.read_line(&mut line));
        assert_eq!(line, "abc");
        assert!(task.read_line(&mut line));
        assert_eq!(line, "def");
        assert!(task.read_line(&mut line));
        assert_eq!(line, "");
        assert!(task.read_line(&mut line));
        assert_eq!(line, "ghi");
        allow_read(&task);
        assert!(!task.read_line(&mut line));
        close_peer(peer);
    }

    #[test]
    fn line_reader_survives_split_crlf() {
        let (task, peer) = socket_task_pair();
        let mut line = String::new();

        feed(peer, b"hel");
        allow_read(&task);
        assert!(!task.read_line(&mut line));

        feed(peer, b"lo\r");
        allow_read(&task);
        assert!(task.read_line(&mut line));
        assert_eq!(line, "hello");

        // The LF arrives later and must be swallowed, not turned into an
        // empty line.
        feed(peer, b"\nnext\n");
        allow_read(&task);
        assert!(task.read_line(&mut line));
        assert_eq!(line, "next");
        close_peer(peer);
    }

    #[test]
    fn small_writes_buffer_until_flush() {
        let (task, peer) = socket_task_pair();
        assert_eq!(task.write(b"ping "), 5);
        assert_eq!(task.write(b"pong"), 4);
        let mut got = Vec::new();
        drain(peer, &mut got);
        assert!(got.is_empty(), "small writes must not hit the socket");
        assert!(task.is_write_data_pending());

        allow_write(&task);
        task.flush();
        assert!(!task.is_write_data_pending());
        drain(peer, &mut got);
        assert_eq!(got, b"ping pong");
        close_peer(peer);
    }

    #[test]
    fn big_write_goes_straight_to_socket() {
        let (task, peer) = socket_task_pair();
        allow_write(&task);
        let payload = vec![0x42u8; 4000];
        let written = task.write(&payload);
        assert!(written > 0);
        let mut got = Vec::new();
        drain(peer, &mut got);
        assert_eq!(got.len(), written);
        assert!(!task.is_write_data_pending());
        close_peer(peer);
    }

    #[test]
    fn read_number_roundtrip() {
        let (task, peer) = socket_task_pair();
        feed(peer, &123_456_789_u64.to_ne_bytes());
        allow_read(&task);
        let mut num = 0u64;
        assert!(task.read_number(&mut num));
        assert_eq!(num, 123_456_789);
        close_peer(peer);
    }

    #[test]
    fn proxy_transfers_exactly_the_requested_bytes() {
        let (src_task, src_peer) = socket_task_pair();
        let (dst_task, dst_peer) = socket_task_pair();

        let total: usize = 40_000;
        let payload: Vec<u8> = (0..total + 5000).map(|i| (i % 251) as u8).collect();

        let mut sent = 0;
        let mut received = Vec::new();
        allow_write(&dst_task);
        src_task.start_proxy_to(&dst_task, total as u64);

        // Pump: feed the source, grant readiness, drain the destination,
        // until the proxy detaches itself.
        for _ in 0..10_000 {
            if !src_task.is_proxy_in_progress() {
                break;
            }
            if sent < payload.len() {
                // Safety: slice is live; short sends are fine.
                let n = unsafe {
                    libc::send(
                        src_peer,
                        payload[sent..].as_ptr().cast(),
                        (payload.len() - sent).min(8192),
                        libc::MSG_DONTWAIT,
                    )
                };
                if n > 0 {
                    sent += n as usize;
                }
            }
            allow_read(&src_task);
            allow_write(&dst_task);
            do_data_proxy(&src_task);
            drain(dst_peer, &mut received);
        }
        // A tail below the minimum write size is left in the destination's
        // buffer for its own slice to deliver.
        allow_write(&dst_task);
        dst_task.flush();
        drain(dst_peer, &mut received);

        assert!(!src_task.is_proxy_in_progress());
        assert!(!src_task.proxy_had_error());
        assert!(!dst_task.proxy_had_error());
        assert_eq!(received.len(), total);
        assert_eq!(received[..], payload[..total]);

        close_peer(src_peer);
        close_peer(dst_peer);
    }
}

/// The socket-flavored slice wrapper: connect-timeout bookkeeping, proxy
/// and deferred-flush interlocks around the handler's own slice.
pub(crate) fn internal_run_slice(task: &TaskRef, thr_num: ThreadNum) {
    let st = task.sock().expect("socket slice on a non-socket task");
    st.last_active.store(time::cur_secs(), Ordering::Relaxed);

    let conn_jfy = st.conn_start_jfy.load(Ordering::SeqCst);
    if conn_jfy != 0 {
        if st.reg_write_evts.load(Ordering::SeqCst) != st.seen_write_evts.load(Ordering::SeqCst) {
            st.conn_start_jfy.store(0, Ordering::SeqCst);
        } else if time::cur_jiffies().saturating_sub(conn_jfy) > conn_timeout_jiffies() {
            st.reg_error.store(true, Ordering::SeqCst);
            st.conn_start_jfy.store(0, Ordering::SeqCst);
            srv_log!(Severity::Warning, "Connection has timed out");
        }
    }

    let (proxy_dst, proxy_src) = {
        let bufs = st.buffers.lock();
        (bufs.proxy_dst.clone(), bufs.proxy_src.clone())
    };

    if let Some(dst) = proxy_dst {
        if let Some(dst_st) = dst.sock() {
            dst_st.last_active.store(time::cur_secs(), Ordering::Relaxed);
        }
        do_data_proxy(task);
        if st.buffers.lock().proxy_dst.is_none() {
            task.execute_handler(thr_num);
        }
    } else if let Some(src) = proxy_src {
        // All proxying is driven by the source socket; we probably just
        // became writable, so hand the event over.
        src.set_runnable();
    } else {
        let need_to_flush = st.buffers.lock().need_to_flush;
        if !need_to_flush {
            task.execute_handler(thr_num);
        } else {
            let flushed = {
                let mut bufs = st.buffers.lock();
                flush_data(st, &mut bufs);
                if !is_write_data_pending(&bufs) || need_early_close_locked(st, &bufs) {
                    compact_wr_buffer(&mut bufs);
                    bufs.need_to_flush = false;
                    bufs.flush_is_done = true;
                    true
                } else {
                    false
                }
            };
            if flushed {
                task.execute_handler(thr_num);
            }
        }
    }

    {
        let bufs = st.buffers.lock();
        if st.reg_read_evts.load(Ordering::SeqCst) == st.seen_read_evts.load(Ordering::SeqCst)
            && !bufs.sock_has_read
            && bufs.sock_can_read_more
            && st.fd() != -1
        {
            // Ask the kernel for client data as quickly as possible.
            set_socket_quick_ack(st.fd());
        }
    }

    st.last_active.store(time::cur_secs(), Ordering::Relaxed);
}
