//! Per-connection socket state: buffered read/write state machines, the
//! line reader, write batching, the proxy pump and client-side connect.
//!
//! Readiness bookkeeping is split in two: epoch counters the epoll thread
//! bumps live as atomics on [`SockState`], while everything the owning
//! slice mutates (buffers, cursors, flags) sits behind the buffer lock.
//! Reads are only attempted when a previous `recv` filled the whole buffer
//! or an unseen read event arrived; writes are gated the same way.

use crate::logging::Severity;
use crate::srv_log;
use crate::task::{TaskRef, ThreadNum};
use crate::time;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU16, AtomicU32, AtomicU64,
                         Ordering};
use std::sync::Arc;
use sync::Mutex;

/// A little less than the Ethernet MTU.
pub(crate) const SOCK_READ_BUF_SIZE: usize = 1000;
pub(crate) const SOCK_MIN_WRITE_SIZE: usize = 1000;
/// Calculations below assume this is at least twice `SOCK_MIN_WRITE_SIZE`.
pub(crate) const SOCK_WRITE_BUF_SIZE: usize = 2000;

pub(crate) struct SockBuffers {
    pub(crate) rd_buf: Box<[u8; SOCK_READ_BUF_SIZE]>,
    pub(crate) rd_size: usize,
    pub(crate) rd_pos: usize,
    pub(crate) wr_buf: Vec<u8>,
    pub(crate) wr_size: usize,
    pub(crate) wr_pos: usize,
    pub(crate) cr_met: bool,
    pub(crate) sock_has_read: bool,
    pub(crate) sock_can_write: bool,
    pub(crate) sock_can_read_more: bool,
    pub(crate) need_to_flush: bool,
    pub(crate) flush_is_done: bool,
    pub(crate) read_bytes: u64,
    pub(crate) written_bytes: u64,
    pub(crate) proxy_src: Option<TaskRef>,
    pub(crate) proxy_dst: Option<TaskRef>,
    pub(crate) proxy_size: u64,
    pub(crate) proxy_had_error: bool,
}

impl SockBuffers {
    fn new() -> Self {
        Self {
            rd_buf: Box::new([0; SOCK_READ_BUF_SIZE]),
            rd_size: 0,
            rd_pos: 0,
            wr_buf: vec![0; SOCK_WRITE_BUF_SIZE],
            wr_size: 0,
            wr_pos: 0,
            cr_met: false,
            sock_has_read: false,
            sock_can_write: false,
            sock_can_read_more: true,
            need_to_flush: false,
            flush_is_done: false,
            read_bytes: 0,
            written_bytes: 0,
            proxy_src: None,
            proxy_dst: None,
            proxy_size: 0,
            proxy_had_error: false,
        }
    }
}

pub struct SockState {
    fd: AtomicI32,
    peer_addr: AtomicU32,
    peer_port: AtomicU16,
    /// Jiffy of a pending non-blocking connect; 0 when none.
    pub(crate) conn_start_jfy: AtomicU64,
    pub(crate) last_active: AtomicI64,
    pub(crate) reg_read_evts: AtomicU32,
    pub(crate) reg_write_evts: AtomicU32,
    pub(crate) seen_read_evts: AtomicU32,
    pub(crate) seen_write_evts: AtomicU32,
    pub(crate) reg_read_hup: AtomicBool,
    pub(crate) reg_error: AtomicBool,
    pub(crate) need_to_close: AtomicBool,
    error_printed: AtomicBool,
    pub(crate) buffers: Mutex<SockBuffers>,
}

impl SockState {
    pub(crate) fn new(fd: i32, peer_addr: u32, peer_port: u16) -> Self {
        Self {
            fd: AtomicI32::new(fd),
            peer_addr: AtomicU32::new(peer_addr),
            peer_port: AtomicU16::new(peer_port),
            conn_start_jfy: AtomicU64::new(0),
            last_active: AtomicI64::new(0),
            reg_read_evts: AtomicU32::new(0),
            reg_write_evts: AtomicU32::new(0),
            seen_read_evts: AtomicU32::new(0),
            seen_write_evts: AtomicU32::new(0),
            reg_read_hup: AtomicBool::new(false),
            reg_error: AtomicBool::new(false),
            need_to_close: AtomicBool::new(false),
            error_printed: AtomicBool::new(false),
            buffers: Mutex::new(SockBuffers::new()),
        }
    }

    pub(crate) fn fd(&self) -> i32 {
        self.fd.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fd(&self, fd: i32) {
        self.fd.store(fd, Ordering::SeqCst);
    }

    pub(crate) fn peer(&self) -> (u32, u16) {
        (
            self.peer_addr.load(Ordering::Relaxed),
            self.peer_port.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn set_peer(&self, addr: u32, port: u16) {
        self.peer_addr.store(addr, Ordering::Relaxed);
        self.peer_port.store(port, Ordering::Relaxed);
    }

    fn print_error_once(&self) {
        if !self.error_printed.swap(true, Ordering::Relaxed) {
            super::log_socket_error(Severity::Warning, self.fd(), "Error in the socket");
        }
    }

    pub(crate) fn has_error(&self) -> bool {
        if self.reg_error.load(Ordering::SeqCst) {
            self.print_error_once();
            true
        } else {
            false
        }
    }

    /// Graceful close from the owning thread.
    pub(crate) fn close_on_owner(&self, task: &TaskRef) {
        if self.fd() != -1 {
            super::close_socket_task(task, false);
        }
    }

    /// Last-resort close when the task object dies with the fd still open.
    pub(crate) fn close_fd_quietly(&self) {
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd != -1 {
            // Safety: fd was a live descriptor owned by this task.
            unsafe { libc::close(fd) };
        }
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// One `recv` gated by the readiness interlock; updates the edge-trigger
/// bookkeeping.
pub(crate) fn read_from_socket(st: &SockState, bufs: &mut SockBuffers, dest: &mut [u8]) -> usize {
    if !bufs.sock_has_read
        && st.seen_read_evts.load(Ordering::SeqCst) == st.reg_read_evts.load(Ordering::SeqCst)
    {
        return 0;
    }
    if dest.is_empty() {
        return 0;
    }

    let n_read = loop {
        // Safety: dest is a live, writable slice and fd is our descriptor.
        let res = unsafe {
            libc::recv(
                st.fd(),
                dest.as_mut_ptr().cast(),
                dest.len(),
                0,
            )
        };
        if res != -1 {
            break res as usize;
        }
        let errno = last_errno();
        if errno == libc::EINTR {
            continue;
        }
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            st.seen_read_evts
                .store(st.reg_read_evts.load(Ordering::SeqCst), Ordering::SeqCst);
            return 0;
        }
        srv_log!(Severity::Warning, "Error reading from socket, errno={errno}");
        st.reg_error.store(true, Ordering::SeqCst);
        break 0;
    };

    bufs.read_bytes += n_read as u64;
    bufs.sock_has_read = n_read == dest.len();
    bufs.sock_can_read_more =
        n_read != 0 && (bufs.sock_has_read || !st.reg_read_hup.load(Ordering::SeqCst));
    n_read
}

/// One `send` gated by the readiness interlock.
pub(super) fn write_to_socket(st: &SockState, bufs: &mut SockBuffers, src: &[u8]) -> usize {
    if !bufs.sock_can_write
        && st.seen_write_evts.load(Ordering::SeqCst) == st.reg_write_evts.load(Ordering::SeqCst)
    {
        return 0;
    }
    if src.is_empty() {
        return 0;
    }

    st.seen_write_evts
        .store(st.reg_write_evts.load(Ordering::SeqCst), Ordering::SeqCst);
    let n_written = loop {
        // Safety: src is a live slice and fd is our descriptor.
        let res = unsafe { libc::send(st.fd(), src.as_ptr().cast(), src.len(), libc::MSG_NOSIGNAL) };
        if res != -1 {
            break res as usize;
        }
        let errno = last_errno();
        if errno == libc::EINTR {
            continue;
        }
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            return 0;
        }
        srv_log!(Severity::Warning, "Error writing to socket, errno={errno}");
        st.reg_error.store(true, Ordering::SeqCst);
        break 0;
    };

    bufs.written_bytes += n_written as u64;
    bufs.sock_can_write = n_written == src.len();
    n_written
}

fn compact_rd_buffer(bufs: &mut SockBuffers) {
    if bufs.rd_pos != 0 {
        assert!(bufs.rd_pos <= bufs.rd_size);
        bufs.rd_buf.copy_within(bufs.rd_pos..bufs.rd_size, 0);
        bufs.rd_size -= bufs.rd_pos;
        bufs.rd_pos = 0;
    }
}

/// Swallows the LF (or NUL) that follows a CR already consumed.
fn read_lf(bufs: &mut SockBuffers) {
    if bufs.rd_pos < bufs.rd_size {
        let c = bufs.rd_buf[bufs.rd_pos];
        if c == b'\n' || c == b'\0' {
            bufs.rd_pos += 1;
            bufs.cr_met = false;
        }
    }
}

fn read_from_buffer(bufs: &mut SockBuffers, dest: &mut [u8]) -> usize {
    let to_copy = (bufs.rd_size - bufs.rd_pos).min(dest.len());
    dest[..to_copy].copy_from_slice(&bufs.rd_buf[bufs.rd_pos..bufs.rd_pos + to_copy]);
    bufs.rd_pos += to_copy;
    to_copy
}

pub(crate) fn read_to_buf_inner(st: &SockState, bufs: &mut SockBuffers) -> bool {
    compact_rd_buffer(bufs);
    let rd_size = bufs.rd_size;
    // Receive through a stack staging buffer so the borrow checker does not
    // see rd_buf borrowed both as destination and through `bufs`.
    let mut tmp = [0u8; SOCK_READ_BUF_SIZE];
    let space = SOCK_READ_BUF_SIZE - rd_size;
    let n_read = read_from_socket(st, bufs, &mut tmp[..space]);
    bufs.rd_buf[rd_size..rd_size + n_read].copy_from_slice(&tmp[..n_read]);
    bufs.rd_size += n_read;
    if bufs.cr_met {
        read_lf(bufs);
    }
    bufs.rd_size > 0
}

fn copy_data(bufs: &mut SockBuffers, src: &[u8]) {
    let end = bufs.wr_size + src.len();
    bufs.wr_buf[bufs.wr_size..end].copy_from_slice(src);
    bufs.wr_size = end;
}

fn write_no_pending(st: &SockState, bufs: &mut SockBuffers, src: &[u8]) -> usize {
    if src.len() < SOCK_MIN_WRITE_SIZE {
        if bufs.wr_size + src.len() > bufs.wr_buf.len() {
            compact_wr_buffer(bufs);
        }
        copy_data(bufs, src);
        src.len()
    } else {
        write_to_socket(st, bufs, src)
    }
}

pub(crate) fn flush_data(st: &SockState, bufs: &mut SockBuffers) {
    assert!(bufs.wr_pos <= bufs.wr_size);
    let pending: Vec<u8> = bufs.wr_buf[bufs.wr_pos..bufs.wr_size].to_vec();
    let n_written = write_to_socket(st, bufs, &pending);
    bufs.wr_pos += n_written;
}

pub(crate) fn compact_wr_buffer(bufs: &mut SockBuffers) {
    if bufs.wr_pos != 0 {
        assert!(bufs.wr_pos <= bufs.wr_size);
        bufs.wr_buf.copy_within(bufs.wr_pos..bufs.wr_size, 0);
        bufs.wr_size -= bufs.wr_pos;
        bufs.wr_pos = 0;
    }
}

pub(crate) fn is_write_data_pending(bufs: &SockBuffers) -> bool {
    bufs.wr_pos < bufs.wr_size
}

pub(crate) fn write_inner(st: &SockState, bufs: &mut SockBuffers, src: &[u8]) -> usize {
    let has_size = bufs.wr_size - bufs.wr_pos;
    if has_size == 0 {
        // Nothing pending: buffer small writes, send big ones directly.
        write_no_pending(st, bufs, src)
    } else if has_size + src.len() <= SOCK_WRITE_BUF_SIZE {
        compact_wr_buffer(bufs);
        copy_data(bufs, src);
        src.len()
    } else if has_size < SOCK_MIN_WRITE_SIZE {
        // Top the buffer up to the minimum, flush it, then the rest of the
        // data is guaranteed to be big enough to go to the socket directly.
        let to_copy = SOCK_MIN_WRITE_SIZE - has_size;
        compact_wr_buffer(bufs);
        copy_data(bufs, &src[..to_copy]);
        flush_data(st, bufs);
        if is_write_data_pending(bufs) {
            return to_copy;
        }
        compact_wr_buffer(bufs);
        to_copy + write_to_socket(st, bufs, &src[to_copy..])
    } else {
        // Enough is pending to satisfy the minimum: flush first, then we
        // are back to the empty-pending case.
        flush_data(st, bufs);
        if is_write_data_pending(bufs) {
            return 0;
        }
        compact_wr_buffer(bufs);
        write_no_pending(st, bufs, src)
    }
}

impl crate::task::SrvTask {
    fn sock_state(&self) -> &SockState {
        self.sock().expect("socket operation on a non-socket task")
    }

    /// Compacts the read buffer and tops it up with one `recv`.
    pub fn read_to_buf(&self) -> bool {
        let st = self.sock_state();
        let mut bufs = st.buffers.lock();
        read_to_buf_inner(st, &mut bufs)
    }

    pub fn is_read_data_available(&self) -> bool {
        let bufs = self.sock_state().buffers.lock();
        bufs.rd_size > bufs.rd_pos
    }

    pub fn is_write_data_pending(&self) -> bool {
        is_write_data_pending(&self.sock_state().buffers.lock())
    }

    pub fn has_error(&self) -> bool {
        self.sock_state().has_error()
    }

    pub fn can_have_more_read(&self) -> bool {
        self.sock_state().buffers.lock().sock_can_read_more
    }

    pub fn need_to_close(&self) -> bool {
        self.sock_state().need_to_close.load(Ordering::SeqCst)
            || crate::server::is_in_hard_shutdown()
    }

    pub fn need_early_close(&self) -> bool {
        self.need_to_close() || self.has_error() || !self.can_have_more_read()
    }

    /// Reads one line terminated by CR, LF, NUL or any CR/LF pair. Returns
    /// false when no full line is buffered yet; over-long lines set the
    /// error flag.
    pub fn read_line(&self, line: &mut String) -> bool {
        let st = self.sock_state();
        let mut bufs = st.buffers.lock();
        if !read_to_buf_inner(st, &mut bufs) {
            return false;
        }

        let mut crlf_pos = bufs.rd_pos;
        while crlf_pos < bufs.rd_size {
            let c = bufs.rd_buf[crlf_pos];
            if c == b'\n' || c == b'\r' || c == b'\0' {
                break;
            }
            crlf_pos += 1;
        }
        if crlf_pos >= bufs.rd_size {
            if bufs.rd_size == SOCK_READ_BUF_SIZE {
                srv_log!(
                    Severity::Critical,
                    "Too long line in the protocol - at least {} bytes",
                    bufs.rd_size
                );
                st.reg_error.store(true, Ordering::SeqCst);
            }
            return false;
        }

        line.clear();
        line.push_str(&String::from_utf8_lossy(
            &bufs.rd_buf[bufs.rd_pos..crlf_pos],
        ));
        if bufs.rd_buf[crlf_pos] == b'\r' {
            bufs.cr_met = true;
            crlf_pos += 1;
        }
        bufs.rd_pos = crlf_pos;
        read_lf(&mut bufs);
        true
    }

    /// Copies buffered data first, then reads the socket: through the
    /// buffer for small amounts, directly into `dest` for large ones.
    pub fn read(&self, dest: &mut [u8]) -> usize {
        let st = self.sock_state();
        let mut bufs = st.buffers.lock();
        let mut n_read = 0;
        if !dest.is_empty() && bufs.rd_pos < bufs.rd_size {
            n_read = read_from_buffer(&mut bufs, dest);
        }
        if n_read == dest.len() {
            return n_read;
        }
        let rest = &mut dest[n_read..];
        if rest.len() < SOCK_READ_BUF_SIZE {
            if read_to_buf_inner(st, &mut bufs) {
                n_read += read_from_buffer(&mut bufs, rest);
            }
        } else {
            n_read += read_from_socket(st, &mut bufs, rest);
        }
        n_read
    }

    /// All-or-nothing read of exactly `dest.len()` bytes from the buffer.
    pub fn read_data(&self, dest: &mut [u8]) -> bool {
        let st = self.sock_state();
        let mut bufs = st.buffers.lock();
        if bufs.rd_size - bufs.rd_pos < dest.len() {
            read_to_buf_inner(st, &mut bufs);
            if bufs.rd_size - bufs.rd_pos < dest.len() {
                return false;
            }
        }
        let n = read_from_buffer(&mut bufs, dest);
        debug_assert_eq!(n, dest.len());
        true
    }

    /// Binary native-endian u64, the wire format of length prefixes.
    pub fn read_number(&self, num: &mut u64) -> bool {
        let mut raw = [0u8; 8];
        if self.read_data(&mut raw) {
            *num = u64::from_ne_bytes(raw);
            true
        } else {
            false
        }
    }

    /// Writes with batching: small writes gather in the buffer until the
    /// minimum write size is reached. Returns how much was consumed.
    pub fn write(&self, src: &[u8]) -> usize {
        let st = self.sock_state();
        let mut bufs = st.buffers.lock();
        write_inner(st, &mut bufs, src)
    }

    /// Unconditional buffered write; grows the write buffer as needed.
    pub fn write_data(&self, src: &[u8]) {
        let st = self.sock_state();
        let mut bufs = st.buffers.lock();
        if bufs.wr_size + src.len() > bufs.wr_buf.len() {
            let new_size = bufs.wr_size + src.len();
            bufs.wr_buf.resize(new_size, 0);
        }
        copy_data(&mut bufs, src);
    }

    pub fn write_text(&self, text: &str) -> &Self {
        self.write_data(text.as_bytes());
        self
    }

    pub fn write_number<N: core::fmt::Display>(&self, num: N) -> &Self {
        self.write_text(&num.to_string())
    }

    /// Immediate flush attempt; leftover bytes mark the task as needing a
    /// deferred flush.
    pub fn flush(&self) {
        let st = self.sock_state();
        if st.has_error() {
            return;
        }
        let mut bufs = st.buffers.lock();
        if !is_write_data_pending(&bufs) {
            return;
        }
        flush_data(st, &mut bufs);
        if !is_write_data_pending(&bufs) {
            compact_wr_buffer(&mut bufs);
        } else {
            bufs.need_to_flush = true;
        }
    }

    /// Defers flushing to the slice loop; completion is observable through
    /// [`Self::flush_is_done`].
    pub fn request_flush(self: &Arc<Self>) {
        {
            let st = self.sock_state();
            let mut bufs = st.buffers.lock();
            bufs.flush_is_done = false;
            bufs.need_to_flush = true;
        }
        self.set_runnable();
    }

    pub fn flush_is_done(&self) -> bool {
        self.sock_state().buffers.lock().flush_is_done
    }

    pub fn is_proxy_in_progress(&self) -> bool {
        let bufs = self.sock_state().buffers.lock();
        bufs.proxy_src.is_some() || bufs.proxy_dst.is_some()
    }

    pub fn proxy_had_error(&self) -> bool {
        self.sock_state().buffers.lock().proxy_had_error
    }

    /// Starts pumping `proxy_size` bytes from this socket into `dst_task`,
    /// driven from this (source) side.
    pub fn start_proxy_to(self: &Arc<Self>, dst_task: &TaskRef, proxy_size: u64) {
        {
            let src_st = self.sock_state();
            let mut src_bufs = src_st.buffers.lock();
            src_bufs.proxy_dst = Some(Arc::clone(dst_task));
            src_bufs.proxy_size = proxy_size;
            src_bufs.proxy_had_error = false;
        }
        {
            let dst_st = dst_task.sock().expect("proxy destination has no socket");
            let mut dst_bufs = dst_st.buffers.lock();
            dst_bufs.proxy_had_error = false;
            dst_bufs.proxy_src = Some(Arc::clone(self));
        }
        super::do_data_proxy(self);
    }

    /// Non-blocking client connect; success or timeout is decided by later
    /// write events against `conn_start_jfy`.
    pub fn connect(self: &Arc<Self>, addr: std::net::SocketAddrV4) -> bool {
        let st = self.sock_state();
        let old_fd = st.fd.swap(-1, Ordering::SeqCst);
        if old_fd != -1 {
            super::close_fd(old_fd, true);
        }
        st.reg_error.store(false, Ordering::SeqCst);

        // Safety: plain socket creation.
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if sock == -1 {
            srv_log!(
                Severity::Critical,
                "Cannot create socket, errno={}",
                last_errno()
            );
            return false;
        }
        if !super::set_socket_nonblock(sock) || !super::set_socket_options(sock) {
            super::close_fd(sock, true);
            return false;
        }

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: addr.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            },
            sin_zero: [0; 8],
        };
        loop {
            // Safety: sin is a properly initialized sockaddr_in.
            let res = unsafe {
                libc::connect(
                    sock,
                    (&raw const sin).cast(),
                    size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            if res == 0 {
                break;
            }
            let errno = last_errno();
            if errno == libc::EINTR {
                continue;
            }
            if errno != libc::EINPROGRESS {
                srv_log!(Severity::Critical, "Cannot connect socket, errno={errno}");
                super::close_fd(sock, true);
                return false;
            }
            break;
        }

        st.conn_start_jfy
            .store(time::cur_jiffies().max(1), Ordering::SeqCst);
        st.set_fd(sock);
        st.set_peer(u32::from_ne_bytes(addr.ip().octets()), addr.port());
        super::create_diag_request(self, super::local_port(sock), st.peer().0, addr.port());
        true
    }

    /// Hooks an accepted or connected socket into the engine: the owning
    /// thread's socket list, the epoll set and the scheduler.
    pub fn start_processing(self: &Arc<Self>, thread_num: ThreadNum) -> bool {
        super::start_processing(self, thread_num)
    }

    pub fn close_socket(self: &Arc<Self>) {
        super::close_socket_task(self, false);
    }

    pub fn abort_socket(self: &Arc<Self>) {
        super::close_socket_task(self, true);
    }

    pub fn peer_address(&self) -> (String, u16) {
        let (addr, port) = self.sock_state().peer();
        (super::ip_to_string(addr), port)
    }
}

/// Per-thread socket bookkeeping.
pub struct SocketsData {
    /// Open, not-yet-deleted sockets opened on this thread.
    pub(crate) sock_list: Vec<TaskRef>,
    /// Net number of sockets this thread opened minus closed since the
    /// last promotion to the global counter.
    pub(crate) sock_cnt: i32,
}

impl SocketsData {
    pub(crate) fn new() -> Self {
        Self {
            sock_list: Vec::new(),
            sock_cnt: 0,
        }
    }
}
