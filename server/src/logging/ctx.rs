//! Per-request diagnostic context: identity and accounting for one client
//! request, attached to the owning task's context stack and referenced by
//! every log record emitted while it is on top.

use crate::time::SrvTime;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use sync::Mutex;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

pub struct RequestCtx {
    req_id: u64,
    client_ip: Mutex<String>,
    session_id: Mutex<String>,
    status: AtomicU16,
    bytes_rd: AtomicU64,
    bytes_wr: AtomicU64,
    running: AtomicBool,
    start_time: Mutex<SrvTime>,
}

impl RequestCtx {
    pub fn new() -> Self {
        Self {
            req_id: next_request_id(),
            client_ip: Mutex::new(String::new()),
            session_id: Mutex::new(String::new()),
            status: AtomicU16::new(0),
            bytes_rd: AtomicU64::new(0),
            bytes_wr: AtomicU64::new(0),
            running: AtomicBool::new(false),
            start_time: Mutex::new(SrvTime::default()),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.req_id
    }

    pub fn set_client_ip(&self, ip: &str) {
        *self.client_ip.lock() = ip.to_owned();
    }

    pub fn client_ip(&self) -> String {
        self.client_ip.lock().clone()
    }

    pub fn set_session_id(&self, session: &str) {
        *self.session_id.lock() = session.to_owned();
    }

    pub fn session_id(&self) -> String {
        self.session_id.lock().clone()
    }

    pub fn set_request_status(&self, status: u16) {
        self.status.store(status, Ordering::Relaxed);
    }

    pub fn request_status(&self) -> u16 {
        self.status.load(Ordering::Relaxed)
    }

    pub fn set_bytes_rd(&self, n: u64) {
        self.bytes_rd.store(n, Ordering::Relaxed);
    }

    pub fn set_bytes_wr(&self, n: u64) {
        self.bytes_wr.store(n, Ordering::Relaxed);
    }

    pub fn bytes_rd(&self) -> u64 {
        self.bytes_rd.load(Ordering::Relaxed)
    }

    pub fn bytes_wr(&self) -> u64 {
        self.bytes_wr.load(Ordering::Relaxed)
    }

    pub(crate) fn start(&self) {
        assert!(
            !self.running.swap(true, Ordering::SeqCst),
            "request started twice"
        );
        *self.start_time.lock() = SrvTime::current();
    }

    pub(crate) fn stop(&self) {
        assert!(
            self.running.swap(false, Ordering::SeqCst),
            "request stopped without start"
        );
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn elapsed(&self) -> SrvTime {
        SrvTime::current().since(*self.start_time.lock())
    }
}

impl Default for RequestCtx {
    fn default() -> Self {
        Self::new()
    }
}
