//! Lock-free thread-local logging pipeline.
//!
//! Each thread appends finished records to its own big byte buffer; when a
//! buffer fills up (or a forced flush comes due) the closed prefix is handed
//! to the writer task's queue and a fresh buffer takes its place, so
//! producers never block on the file. Records follow the applog line format:
//!
//! ```text
//! PID/TTT/RRRR/A  APPUID NNNN/MMMM TIMESTAMP HOST CLIENT SESSION APP  body
//! ```
//!
//! A `Fatal` record triggers a coordinated halt: every thread parks after
//! queueing its buffer, the halting thread drains the queue synchronously
//! and the process aborts with everything flushed.

mod ctx;

use crate::task::{SrvTask, TaskHandler, TaskRef, ThreadNum};
use crate::time::{self, SrvTime};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use sync::{Futex, Mutex};

pub use ctx::RequestCtx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    Trace = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
    Fatal = 5,
}

const SEV_NAMES: [&str; 6] = ["Trace", "Info", "Warning", "Error", "Critical", "Fatal"];

const UNK_CLIENT: &str = "UNK_CLIENT";
const UNK_SESSION: &str = "UNK_SESSION";
/// Room kept in the buffer so a record in progress never lands exactly on
/// the rotation edge.
const ONE_REC_RESERVE: usize = 500;
const INIT_LOG_BUF_SIZE: usize = 10_000_000;

static VISIBLE_SEV: AtomicU8 = AtomicU8::new(Severity::Warning as u8);
static LOG_REQUESTS: AtomicBool = AtomicBool::new(true);
static LOG_BUF_SIZE: AtomicU64 = AtomicU64::new(INIT_LOG_BUF_SIZE as u64);
static MAX_FLUSH_PERIOD: AtomicI64 = AtomicI64::new(60);
static FILE_REOPEN_PERIOD: AtomicI64 = AtomicI64::new(60);
static LAST_REOPEN_TIME: AtomicI64 = AtomicI64::new(0);
static LOG_FD: AtomicI32 = AtomicI32::new(-1);
static PROCESS_POST_NUM: AtomicU64 = AtomicU64::new(0);
static NEED_FATAL_HALT: AtomicBool = AtomicBool::new(false);
static THREADS_STARTED: AtomicBool = AtomicBool::new(false);
static CNT_HALTED_THREADS: Futex = Futex::new(0);
static HALT: Futex = Futex::new(0);

static CMD_LINE: Mutex<String> = Mutex::new(String::new());
static FILE_NAME: Mutex<String> = Mutex::new(String::new());
static APP_BASE_NAME: Mutex<String> = Mutex::new(String::new());
static PID_STR: OnceLock<String> = OnceLock::new();
static APP_UID: OnceLock<String> = OnceLock::new();

static WRITE_QUEUE: Mutex<VecDeque<Vec<u8>>> = Mutex::new(VecDeque::new());
static LOG_WRITER: OnceLock<TaskRef> = OnceLock::new();
static MAIN_LOG: Mutex<Option<LogData>> = Mutex::new(None);

/// One thread's append buffer. The write cursor is `buf.len()`;
/// `cur_msg_start` marks where the record in progress begins, so rotation
/// can hand off everything before it and carry the tail over.
pub struct LogData {
    buf: Vec<u8>,
    limit: usize,
    cur_msg_start: usize,
    post_num: u64,
    prefix: String,
    has_params: bool,
    severity: Severity,
    last_flush_time: i64,
}

impl LogData {
    pub(crate) fn new(thr_num: ThreadNum) -> Self {
        let size = LOG_BUF_SIZE.load(Ordering::Relaxed) as usize;
        Self {
            buf: Vec::with_capacity(size),
            limit: size.saturating_sub(8),
            cur_msg_start: 0,
            post_num: 0,
            prefix: make_log_prefix(thr_num),
            has_params: false,
            severity: Severity::Trace,
            last_flush_time: 0,
        }
    }

    fn reset(&mut self, thr_num: ThreadNum) {
        let size = LOG_BUF_SIZE.load(Ordering::Relaxed) as usize;
        self.buf = Vec::with_capacity(size);
        self.limit = size.saturating_sub(8);
        self.cur_msg_start = 0;
        self.post_num = 0;
        self.prefix = make_log_prefix(thr_num);
        self.last_flush_time = 0;
    }
}

pub fn set_app_base_name(name: &str) {
    *APP_BASE_NAME.lock() = name.to_owned();
}

pub(crate) fn app_base_name() -> String {
    let name = APP_BASE_NAME.lock();
    if name.is_empty() {
        "task_server".to_owned()
    } else {
        name.clone()
    }
}

pub fn save_app_cmd_line(cmd_line: &str) {
    *CMD_LINE.lock() = cmd_line.to_owned();
}

pub fn set_log_file_name(name: &str) {
    *FILE_NAME.lock() = name.to_owned();
}

pub fn is_severity_visible(sev: Severity) -> bool {
    sev as u8 >= VISIBLE_SEV.load(Ordering::Relaxed)
}

pub fn set_visible_severity(sev: Severity) {
    VISIBLE_SEV.store(sev as u8, Ordering::Relaxed);
}

fn pid_str() -> &'static str {
    PID_STR.get_or_init(|| {
        // Safety: getpid has no preconditions.
        let pid = unsafe { libc::getpid() };
        format!("{pid:05}")
    })
}

fn app_uid() -> &'static str {
    APP_UID.get_or_init(|| {
        // Safety: getpid has no preconditions.
        let pid = unsafe { libc::getpid() } as i64;
        let t = SrvTime::current().sec();
        let host = crate::socket::host_name();
        let mut h: i64 = 212;
        for b in host.bytes() {
            h = h.wrapping_mul(1265).wrapping_add(i64::from(b));
        }
        h &= 0xFFFF;
        // The low 4 bits are reserved as a GUID generator version number.
        let uid = (h << 48) | ((pid & 0xFFFF) << 32) | ((t & 0xFFF_FFFF) << 4) | 1;
        format!("{:016X}", uid as u64)
    })
}

fn make_log_prefix(thr_num: ThreadNum) -> String {
    format!("{}/{:03}/", pid_str(), thr_num)
}

fn open_log_file() {
    let name = FILE_NAME.lock().clone();
    if name.is_empty() {
        return;
    }
    let cname = std::ffi::CString::new(name).unwrap_or_default();
    // Safety: cname is a valid NUL-terminated path.
    let fd = unsafe {
        libc::open(
            cname.as_ptr(),
            libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT,
            0o666 as libc::c_uint,
        )
    };
    LOG_FD.store(fd, Ordering::SeqCst);
}

fn write_log(buf: &[u8]) {
    let mut fd = LOG_FD.load(Ordering::SeqCst);
    if fd == -1 {
        open_log_file();
        fd = LOG_FD.load(Ordering::SeqCst);
        if fd == -1 {
            return;
        }
        LAST_REOPEN_TIME.store(time::cur_secs(), Ordering::Relaxed);
    }
    // Safety: fd is open for writing and buf is a live slice. A short write
    // leaves nothing we could do; records are best-effort.
    unsafe {
        libc::write(fd, buf.as_ptr().cast(), buf.len());
    }
}

fn queue_log_write(chunk: Vec<u8>) {
    if chunk.is_empty() {
        return;
    }
    let need_signal = {
        let mut queue = WRITE_QUEUE.lock();
        let was_empty = queue.is_empty();
        queue.push_back(chunk);
        was_empty
    };
    if need_signal
        && let Some(writer) = LOG_WRITER.get()
    {
        writer.set_runnable();
    }
}

fn rotate_log_buf(data: &mut LogData) {
    let size = LOG_BUF_SIZE.load(Ordering::Relaxed) as usize;
    let mut old = core::mem::replace(&mut data.buf, Vec::with_capacity(size));
    data.limit = size.saturating_sub(8);
    // Carry a partially-written record over to the head of the new buffer.
    let tail = old.split_off(data.cur_msg_start);
    data.buf.extend_from_slice(&tail);
    data.cur_msg_start = 0;
    queue_log_write(old);
    data.last_flush_time = time::cur_secs();
}

fn check_buf_size(data: &mut LogData, need_size: usize) {
    if data.buf.len() + need_size >= data.limit {
        rotate_log_buf(data);
    }
}

fn add_bytes(data: &mut LogData, bytes: &[u8]) {
    check_buf_size(data, bytes.len());
    data.buf.extend_from_slice(bytes);
}

fn add_str_padded(data: &mut LogData, s: &str, min_chars: usize) {
    check_buf_size(data, s.len().max(min_chars));
    data.buf.extend_from_slice(s.as_bytes());
    for _ in s.len()..min_chars {
        data.buf.push(b' ');
    }
}

fn add_num(data: &mut LogData, num: u64) {
    add_bytes(data, num.to_string().as_bytes());
}

fn add_num_padded(data: &mut LogData, num: u64, min_digs: usize) {
    let s = num.to_string();
    check_buf_size(data, s.len().max(min_digs));
    for _ in s.len()..min_digs {
        data.buf.push(b'0');
    }
    data.buf.extend_from_slice(s.as_bytes());
}

/// Writes the fixed applog prefix for one record.
fn add_log_prefix(data: &mut LogData, ctx: Option<&Arc<RequestCtx>>) {
    let prefix = data.prefix.clone();
    add_bytes(data, prefix.as_bytes());

    let cur_ctx = ctx.cloned().or_else(|| {
        crate::threads::get_cur_thread()
            .and_then(|thr| thr.cur_task.lock().as_ref().and_then(|t| t.diag_ctx()))
    });

    let req_id = cur_ctx
        .as_ref()
        .map_or_else(ctx::next_request_id, |c| c.request_id());
    add_num_padded(data, req_id, 4);
    add_bytes(data, b"/A  ");

    add_bytes(data, app_uid().as_bytes());
    data.buf.push(b' ');

    let proc_post_num = PROCESS_POST_NUM.fetch_add(1, Ordering::Relaxed) + 1;
    add_num_padded(data, proc_post_num, 4);
    data.buf.push(b'/');
    data.post_num += 1;
    add_num_padded(data, data.post_num, 4);
    data.buf.push(b' ');

    check_buf_size(data, 50);
    SrvTime::current().print_logging(&mut data.buf);
    data.buf.push(b' ');

    add_str_padded(data, &crate::socket::host_name(), 15);
    data.buf.push(b' ');

    let client = cur_ctx
        .as_ref()
        .map(|c| c.client_ip())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNK_CLIENT.to_owned());
    add_str_padded(data, &client, 15);
    data.buf.push(b' ');

    let session = cur_ctx
        .as_ref()
        .map(|c| c.session_id())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNK_SESSION.to_owned());
    add_str_padded(data, &session, 24);
    data.buf.push(b' ');

    add_bytes(data, app_base_name().as_bytes());
    data.buf.push(b' ');
}

fn add_param_name(data: &mut LogData, name: &str) {
    check_buf_size(data, name.len() + 2);
    if data.has_params {
        data.buf.push(b'&');
    } else {
        data.has_params = true;
    }
    data.buf.extend_from_slice(name.as_bytes());
    data.buf.push(b'=');
}

fn url_encode_into(value: &str, out: &mut Vec<u8>) {
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'.' | b'~' => out.push(b),
            b' ' => out.push(b'+'),
            _ => {
                const HEX: &[u8; 16] = b"0123456789ABCDEF";
                out.push(b'%');
                out.push(HEX[(b >> 4) as usize]);
                out.push(HEX[(b & 15) as usize]);
            }
        }
    }
}

fn add_param_value(data: &mut LogData, value: &str) {
    let mut encoded = Vec::with_capacity(value.len());
    url_encode_into(value, &mut encoded);
    check_buf_size(data, encoded.len());
    data.buf.extend_from_slice(&encoded);
}

/// Runs `f` on the calling thread's log buffer (or the shared main buffer
/// when the caller is not a managed worker).
fn with_log_data<R>(f: impl FnOnce(&mut LogData) -> R) -> R {
    if let Some(thr) = crate::threads::get_cur_thread()
        && thr.thread_num != 0
    {
        let mut data = thr.log.lock();
        return f(&mut data);
    }
    let mut main = MAIN_LOG.lock();
    let data = main.get_or_insert_with(|| {
        let mut d = LogData::new(0);
        write_start_record(&mut d);
        d
    });
    f(data)
}

fn write_start_record(data: &mut LogData) {
    add_log_prefix(data, None);
    add_bytes(data, b"start         ");
    let cmd_line = CMD_LINE.lock().clone();
    add_bytes(data, cmd_line.as_bytes());
    data.buf.push(b'\n');
    data.cur_msg_start = data.buf.len();
}

/// Parks the calling thread when a fatal halt is in progress, after handing
/// its pending records to the writer queue.
pub(crate) fn check_fatal_abort() {
    if !NEED_FATAL_HALT.load(Ordering::SeqCst) {
        return;
    }
    let Some(thr) = crate::threads::get_cur_thread() else {
        return;
    };
    {
        let mut data = thr.log.lock();
        if !data.buf.is_empty() {
            let chunk = core::mem::take(&mut data.buf);
            queue_log_write(chunk);
        }
    }
    CNT_HALTED_THREADS.add_value(1);
    CNT_HALTED_THREADS.wake_up_waiters(1);
    // Parked until the halting thread aborts the process.
    loop {
        HALT.wait_value_change(0);
    }
}

fn do_fatal_abort(data: &mut LogData) -> ! {
    NEED_FATAL_HALT.store(true, Ordering::SeqCst);
    let mut cnt_halted = CNT_HALTED_THREADS.add_value(1);
    for _ in 0..500 {
        let mut cnt_need = i32::from(crate::threads::cnt_running_threads()) + 2;
        if !THREADS_STARTED.load(Ordering::SeqCst) {
            cnt_need = 1;
        }
        if cnt_halted == cnt_need {
            break;
        }
        let jiffy = time::jiffy_time();
        CNT_HALTED_THREADS.wait_value_change_timeout(
            cnt_halted,
            std::time::Duration::new(jiffy.sec().max(0) as u64, jiffy.nsec()),
        );
        cnt_halted = CNT_HALTED_THREADS.value();
    }

    {
        let mut queue = WRITE_QUEUE.lock();
        while let Some(chunk) = queue.pop_front() {
            write_log(&chunk);
        }
    }
    if !data.buf.is_empty() {
        write_log(&data.buf);
    }
    let fd = LOG_FD.load(Ordering::SeqCst);
    if fd != -1 {
        // Safety: fd came from open().
        unsafe { libc::close(fd) };
    }
    std::process::abort();
}

fn finish_record(data: &mut LogData) {
    check_buf_size(data, 1);
    data.buf.push(b'\n');
    data.cur_msg_start = data.buf.len();
    if data.severity == Severity::Fatal {
        do_fatal_abort(data);
    }
    check_buf_size(data, ONE_REC_RESERVE);
}

/// Builder for one structured log record. The record is finished (newline +
/// cursor advance) when the builder drops.
pub struct DiagMsg {
    started: bool,
}

impl DiagMsg {
    pub fn new() -> Self {
        check_fatal_abort();
        Self { started: false }
    }

    /// Emits `request-start` and marks the context running.
    pub fn start_request(mut self, ctx: &Arc<RequestCtx>) -> Self {
        assert!(!ctx.is_running(), "request context started twice");
        ctx.start();
        ctx.set_request_status(200);
        if !LOG_REQUESTS.load(Ordering::Relaxed) {
            return self;
        }
        with_log_data(|data| {
            data.severity = Severity::Info;
            add_log_prefix(data, Some(ctx));
            add_bytes(data, b"request-start ");
            data.has_params = false;
        });
        self.started = true;
        self
    }

    /// Emits an `extra` record carrying only parameters.
    pub fn print_extra(mut self, ctx: Option<&Arc<RequestCtx>>) -> Self {
        if !LOG_REQUESTS.load(Ordering::Relaxed) {
            return self;
        }
        with_log_data(|data| {
            data.severity = Severity::Info;
            add_log_prefix(data, ctx);
            add_bytes(data, b"extra         ");
            data.has_params = false;
        });
        self.started = true;
        self
    }

    /// Appends one `name=value` pair, URL-encoding the value as needed.
    pub fn param<V: fmt::Display>(self, name: &str, value: V) -> Self {
        if !self.started {
            return self;
        }
        let value = value.to_string();
        with_log_data(|data| {
            add_param_name(data, name);
            add_param_value(data, &value);
        });
        self
    }

    /// Emits `request-stop` with status, elapsed time and byte counts, and
    /// marks the context stopped.
    pub fn stop_request(mut self, ctx: &Arc<RequestCtx>) {
        assert!(ctx.is_running(), "request context stopped without start");
        if LOG_REQUESTS.load(Ordering::Relaxed) {
            with_log_data(|data| {
                data.severity = Severity::Info;
                add_log_prefix(data, Some(ctx));
                add_bytes(data, b"request-stop  ");
                add_num(data, u64::from(ctx.request_status()));
                data.buf.push(b' ');
                let elapsed = ctx.elapsed();
                add_num(data, elapsed.sec().max(0) as u64);
                data.buf.push(b'.');
                add_num_padded(data, u64::from(elapsed.nsec()), 9);
                data.buf.push(b' ');
                add_num(data, ctx.bytes_rd());
                data.buf.push(b' ');
                add_num(data, ctx.bytes_wr());
                finish_record(data);
            });
        }
        ctx.stop();
        self.started = false;
    }

    /// Whole free-form record in one call: prefix, severity, location,
    /// message. The entry point behind `srv_log!`.
    pub fn srv_log(sev: Severity, file: &str, line: u32, args: fmt::Arguments<'_>) {
        if sev != Severity::Fatal && !is_severity_visible(sev) {
            return;
        }
        check_fatal_abort();
        let text = args.to_string();
        let file_name = file.rsplit('/').next().unwrap_or(file);
        with_log_data(|data| {
            data.severity = sev;
            add_log_prefix(data, None);
            add_bytes(data, SEV_NAMES[sev as usize].as_bytes());
            add_bytes(data, b":  \"");
            add_bytes(data, file_name.as_bytes());
            add_bytes(data, b"\", line ");
            add_num(data, u64::from(line));
            add_bytes(data, b": --- ");
            // Applog records are strictly line-oriented.
            let mut bytes = text.into_bytes();
            for b in &mut bytes {
                if *b == b'\n' {
                    *b = b';';
                }
            }
            add_bytes(data, &bytes);
            finish_record(data);
        });
    }
}

impl Drop for DiagMsg {
    fn drop(&mut self) {
        if self.started {
            with_log_data(finish_record);
        }
    }
}

impl Default for DiagMsg {
    fn default() -> Self {
        Self::new()
    }
}

/// Free-form record with severity and source location.
#[macro_export]
macro_rules! srv_log {
    ($sev:expr, $($arg:tt)*) => {
        $crate::logging::DiagMsg::srv_log($sev, file!(), line!(), format_args!($($arg)*))
    };
}

/// Fatal record: flushes what can be flushed across all threads, then
/// aborts the process.
#[macro_export]
macro_rules! srv_fatal {
    ($($arg:tt)*) => {{
        $crate::logging::DiagMsg::srv_log(
            $crate::logging::Severity::Fatal,
            file!(),
            line!(),
            format_args!($($arg)*),
        );
        ::std::process::abort();
    }};
}

pub fn configure(reg: &crate::config::Registry, section: &str) {
    LOG_REQUESTS.store(
        reg.get_bool(section, "log_requests", true),
        Ordering::Relaxed,
    );
    LOG_BUF_SIZE.store(
        reg.get_data_size(section, "log_thread_buf_size", INIT_LOG_BUF_SIZE as u64)
            .max(4096),
        Ordering::Relaxed,
    );
    MAX_FLUSH_PERIOD.store(
        reg.get_int(section, "log_flush_period", 60),
        Ordering::Relaxed,
    );
    FILE_REOPEN_PERIOD.store(
        reg.get_int(section, "log_reopen_period", 60),
        Ordering::Relaxed,
    );
}

fn init_file_name() {
    let mut name = FILE_NAME.lock();
    if name.is_empty() {
        let applog = format!("/log/srv/{}.log", app_base_name());
        *name = applog;
        drop(name);
        open_log_file();
        if LOG_FD.load(Ordering::SeqCst) == -1 {
            *FILE_NAME.lock() = format!("{}.log", app_base_name());
        }
    }
}

/// Writes the bootstrap record and creates the writer task.
pub fn init_logging() {
    with_log_data(|_| {});
    init_file_name();
    let _ = LOG_WRITER.set(SrvTask::new(Box::new(LogWriter)));
}

/// Rotates the main buffer so the bootstrap record reaches the file once
/// worker threads exist to write it.
pub(crate) fn log_note_threads_started() {
    THREADS_STARTED.store(true, Ordering::SeqCst);
    let mut main = MAIN_LOG.lock();
    if let Some(data) = main.as_mut() {
        rotate_log_buf(data);
    }
}

/// Final `stop` record plus synchronous drain; called after every thread
/// has been joined.
pub fn finalize_logging() {
    {
        let mut queue = WRITE_QUEUE.lock();
        while let Some(chunk) = queue.pop_front() {
            write_log(&chunk);
        }
    }
    let mut main = MAIN_LOG.lock();
    let data = main.get_or_insert_with(|| LogData::new(0));
    if !data.buf.is_empty() {
        write_log(&data.buf);
        data.buf.clear();
        data.cur_msg_start = 0;
    }

    add_log_prefix(data, None);
    add_bytes(data, b"stop          0 ");
    let uptime = SrvTime::current().since(time::srv_start_time());
    add_num(data, uptime.sec().max(0) as u64);
    data.buf.push(b'.');
    add_num_padded(data, u64::from(uptime.nsec()), 9);
    data.buf.push(b'\n');
    write_log(&data.buf);
    data.buf.clear();
    data.cur_msg_start = 0;

    let fd = LOG_FD.swap(-1, Ordering::SeqCst);
    if fd != -1 {
        // Safety: fd came from open().
        unsafe { libc::close(fd) };
    }
}

/// Once per second per thread: rotate a buffer that has not reached the
/// writer within the flush period, to keep record latency bounded.
pub(crate) fn check_logging_flush(thr: &crate::threads::SrvThread) {
    check_fatal_abort();
    let flush = |data: &mut LogData| {
        let cur_time = time::cur_secs();
        if cur_time - data.last_flush_time < MAX_FLUSH_PERIOD.load(Ordering::Relaxed) {
            return;
        }
        if data.buf.is_empty() {
            data.last_flush_time = cur_time;
        } else {
            rotate_log_buf(data);
        }
    };
    if thr.thread_num == 0 {
        // The main thread logs into the shared bootstrap buffer.
        let mut main = MAIN_LOG.lock();
        if let Some(data) = main.as_mut() {
            flush(data);
        }
    } else {
        flush(&mut thr.log.lock());
    }
}

/// Fresh buffer for a (re)starting worker thread.
pub(crate) fn start_thread_logging(thr: &crate::threads::SrvThread) {
    thr.log.lock().reset(thr.thread_num);
}

/// Queues whatever the stopped thread still had buffered.
pub(crate) fn stop_thread_logging(thr: &crate::threads::SrvThread) {
    {
        let mut data = thr.log.lock();
        if !data.buf.is_empty() {
            let chunk = core::mem::take(&mut data.buf);
            queue_log_write(chunk);
            data.cur_msg_start = 0;
        }
    }
    check_fatal_abort();
}

/// Writes a joined thread's remaining records straight to the file.
pub(crate) fn release_thread_logging(thr: &crate::threads::SrvThread) {
    let mut data = thr.log.lock();
    if !data.buf.is_empty() {
        write_log(&data.buf);
        data.buf.clear();
        data.cur_msg_start = 0;
    }
}

/// The writer task: closes the file when the reopen period has elapsed (so
/// external rotation can move it), writes one queued chunk per slice and
/// re-marks itself runnable while more remain.
struct LogWriter;

impl TaskHandler for LogWriter {
    fn execute_slice(&mut self, task: &TaskRef, _thr_num: ThreadNum) {
        check_fatal_abort();

        let fd = LOG_FD.load(Ordering::SeqCst);
        if fd != -1
            && time::cur_secs() - LAST_REOPEN_TIME.load(Ordering::Relaxed)
                >= FILE_REOPEN_PERIOD.load(Ordering::Relaxed)
        {
            // Safety: fd came from open().
            unsafe { libc::close(fd) };
            LOG_FD.store(-1, Ordering::SeqCst);
        }

        let (chunk, have_more) = {
            let mut queue = WRITE_QUEUE.lock();
            let chunk = queue.pop_front();
            let have_more = !queue.is_empty();
            (chunk, have_more)
        };
        let Some(chunk) = chunk else { return };
        write_log(&chunk);
        drop(chunk);

        if have_more {
            task.set_runnable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encoding() {
        let mut out = Vec::new();
        url_encode_into("a b&c=1/ok_~", &mut out);
        assert_eq!(out, b"a+b%26c%3D1%2Fok_~");
    }

    #[test]
    fn prefix_has_applog_shape() {
        crate::time::init_time();
        let mut data = LogData::new(7);
        add_log_prefix(&mut data, None);
        let s = String::from_utf8(data.buf.clone()).unwrap();
        // PID/TTT/RRRR/A  ...
        assert!(s.starts_with(&format!("{}/007/", pid_str())), "{s}");
        assert!(s.contains("/A  "), "{s}");
        assert!(s.contains(UNK_CLIENT), "{s}");
        assert!(s.contains(UNK_SESSION), "{s}");
    }

    #[test]
    fn rotation_preserves_partial_record() {
        crate::time::init_time();
        let mut data = LogData::new(1);
        data.buf.extend_from_slice(b"closed record\n");
        data.cur_msg_start = data.buf.len();
        data.buf.extend_from_slice(b"partial");
        rotate_log_buf(&mut data);
        assert_eq!(&data.buf, b"partial");
        assert_eq!(data.cur_msg_start, 0);
        let queued = WRITE_QUEUE.lock().pop_back().unwrap();
        assert_eq!(&queued, b"closed record\n");
    }

    #[test]
    fn records_are_contiguous_lines() {
        crate::time::init_time();
        let mut data = LogData::new(2);
        for i in 0..5 {
            data.severity = Severity::Warning;
            add_log_prefix(&mut data, None);
            add_bytes(&mut data, format!("Warning: record number {i}").as_bytes());
            finish_record(&mut data);
        }
        let s = String::from_utf8(data.buf.clone()).unwrap();
        let lines: Vec<&str> = s.lines().collect();
        assert_eq!(lines.len(), 5);
        for (i, line) in lines.iter().enumerate() {
            assert!(line.contains(&format!("record number {i}")), "{line}");
        }
    }
}
