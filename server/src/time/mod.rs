//! Time source: monotonic-enough wall clock, the jiffy counter, the cached
//! "current seconds" value and timestamp formatting for the log pipeline.
//!
//! The server never calls `clock_gettime` on hot paths that can tolerate a
//! jiffy of staleness; they read [`cur_secs`] instead, which the service
//! thread refreshes when it advances the jiffy counter.

use crate::task::{TaskHandler, TaskRef, ThreadNum};
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;
use sync::Mutex;

pub const MSECS_PER_SECOND: u64 = 1000;
pub const USECS_PER_MSEC: u64 = 1000;
pub const NSECS_PER_USEC: u64 = 1000;
pub const USECS_PER_SECOND: u64 = USECS_PER_MSEC * MSECS_PER_SECOND;
pub const NSECS_PER_MSEC: u64 = NSECS_PER_USEC * USECS_PER_MSEC;
pub const NSECS_PER_SECOND: u64 = NSECS_PER_MSEC * MSECS_PER_SECOND;

const NSECS_PER_SECOND_U32: u32 = 1_000_000_000;

/// A point in time (or an interval), seconds plus nanoseconds.
///
/// Field order makes the derived ordering compare seconds first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SrvTime {
    sec: i64,
    nsec: u32,
}

impl SrvTime {
    pub const fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    pub const fn from_msec(msec: u64) -> Self {
        Self {
            sec: (msec / MSECS_PER_SECOND) as i64,
            nsec: ((msec % MSECS_PER_SECOND) * NSECS_PER_MSEC) as u32,
        }
    }

    /// Exact current time with nanosecond precision.
    pub fn current() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // Safety: ts is a valid out-pointer for the duration of the call.
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &raw mut ts);
        }
        Self {
            sec: ts.tv_sec,
            nsec: ts.tv_nsec as u32,
        }
    }

    pub const fn sec(&self) -> i64 {
        self.sec
    }

    pub const fn nsec(&self) -> u32 {
        self.nsec
    }

    /// Value as microseconds since epoch (or interval length in µs).
    pub const fn as_usec(&self) -> u64 {
        self.sec as u64 * USECS_PER_SECOND + (self.nsec / 1000) as u64
    }

    /// Interval since `earlier`, saturating at zero.
    pub fn since(&self, earlier: SrvTime) -> SrvTime {
        if *self <= earlier {
            return SrvTime::default();
        }
        let mut sec = self.sec - earlier.sec;
        let nsec = if self.nsec >= earlier.nsec {
            self.nsec - earlier.nsec
        } else {
            sec -= 1;
            self.nsec + NSECS_PER_SECOND_U32 - earlier.nsec
        };
        SrvTime { sec, nsec }
    }

    pub fn advanced_by(&self, interval: SrvTime) -> SrvTime {
        let mut sec = self.sec + interval.sec;
        let mut nsec = self.nsec + interval.nsec;
        if nsec >= NSECS_PER_SECOND_U32 {
            nsec -= NSECS_PER_SECOND_U32;
            sec += 1;
        }
        SrvTime { sec, nsec }
    }

    /// Appends `YYYY-MM-DDThh:mm:ss.uuuuuu` in the local timezone.
    pub fn print_logging(&self, out: &mut Vec<u8>) {
        let t = self.localtime_parts();
        push_4digs(out, t.tm_year + 1900);
        out.push(b'-');
        push_2digs(out, t.tm_mon + 1);
        out.push(b'-');
        push_2digs(out, t.tm_mday);
        out.push(b'T');
        push_2digs(out, t.tm_hour);
        out.push(b':');
        push_2digs(out, t.tm_min);
        out.push(b':');
        push_2digs(out, t.tm_sec);
        out.push(b'.');
        push_6digs(out, (self.nsec / 1000) as i32);
    }

    /// Appends `MM/DD/YYYY hh:mm:ss` in the local timezone.
    pub fn print_human(&self, out: &mut Vec<u8>) {
        let t = self.localtime_parts();
        push_2digs(out, t.tm_mon + 1);
        out.push(b'/');
        push_2digs(out, t.tm_mday);
        out.push(b'/');
        push_4digs(out, t.tm_year + 1900);
        out.push(b' ');
        push_2digs(out, t.tm_hour);
        out.push(b':');
        push_2digs(out, t.tm_min);
        out.push(b':');
        push_2digs(out, t.tm_sec);
    }

    fn localtime_parts(&self) -> libc::tm {
        let sec: libc::time_t = self.sec + tz_adjustment();
        // Safety: zeroed tm is a valid out-param for gmtime_r.
        let mut t: libc::tm = unsafe { core::mem::zeroed() };
        // Safety: both pointers are valid for the call.
        unsafe {
            libc::gmtime_r(&raw const sec, &raw mut t);
        }
        t
    }
}

fn push_1dig(out: &mut Vec<u8>, num: i32) {
    out.push(b'0' + num as u8);
}

fn push_2digs(out: &mut Vec<u8>, num: i32) {
    let hi = num / 10;
    push_1dig(out, hi);
    push_1dig(out, num - hi * 10);
}

fn push_4digs(out: &mut Vec<u8>, num: i32) {
    let hi = num / 100;
    push_2digs(out, hi);
    push_2digs(out, num - hi * 100);
}

fn push_6digs(out: &mut Vec<u8>, num: i32) {
    let hi = num / 100;
    push_4digs(out, hi);
    push_2digs(out, num - hi * 100);
}

static CUR_SECS: AtomicI64 = AtomicI64::new(0);
static CUR_JIFFIES: AtomicU64 = AtomicU64::new(0);
static JIFFY_NSEC: AtomicU64 = AtomicU64::new(NSECS_PER_SECOND / 100);
static LAST_JIFFY_TIME: Mutex<SrvTime> = Mutex::new(SrvTime::new(0, 0));
static TZ_ADJUSTMENT: AtomicI64 = AtomicI64::new(0);
static SRV_START_TIME: OnceLock<SrvTime> = OnceLock::new();

/// Current time in seconds since epoch, refreshed once per jiffy. Not exact,
/// but cheap and consistent across a jiffy.
pub fn cur_secs() -> i64 {
    let secs = CUR_SECS.load(Ordering::Relaxed);
    if secs != 0 {
        secs
    } else {
        let now = SrvTime::current().sec();
        CUR_SECS.store(now, Ordering::Relaxed);
        now
    }
}

pub fn cur_jiffies() -> u64 {
    CUR_JIFFIES.load(Ordering::Relaxed)
}

pub fn jiffy_time() -> SrvTime {
    let nsec = JIFFY_NSEC.load(Ordering::Relaxed);
    SrvTime::new(0, nsec as u32)
}

pub fn last_jiffy_time() -> SrvTime {
    *LAST_JIFFY_TIME.lock()
}

pub fn srv_start_time() -> SrvTime {
    *SRV_START_TIME.get_or_init(SrvTime::current)
}

/// Timezone adjustment in seconds: add this to an epoch value before
/// `gmtime_r` to get local-time components.
pub fn tz_adjustment() -> i64 {
    TZ_ADJUSTMENT.load(Ordering::Relaxed)
}

/// Recomputes the cached TZ offset. Returns the number of seconds until one
/// second past the next hour boundary, when the offset is worth refreshing.
fn init_tz_adjustment() -> u64 {
    let now = SrvTime::current();
    let sec: libc::time_t = now.sec();
    // Safety: zeroed tm is a valid out-param for gmtime_r.
    let mut t: libc::tm = unsafe { core::mem::zeroed() };
    // Safety: both pointers are valid for the call.
    unsafe {
        libc::gmtime_r(&raw const sec, &raw mut t);
    }
    t.tm_isdst = -1;
    // Safety: t was fully initialized by gmtime_r above.
    let loc_time = unsafe { libc::mktime(&raw mut t) };
    TZ_ADJUSTMENT.store(now.sec() - loc_time, Ordering::Relaxed);

    ((60 - t.tm_min) * 60 - (t.tm_sec - 1)).max(1) as u64
}

/// First-thing initialization: remembers the start time and seeds the TZ
/// cache and current-seconds value.
pub fn init_time() {
    let now = SrvTime::current();
    let _ = SRV_START_TIME.set(now);
    *LAST_JIFFY_TIME.lock() = now;
    CUR_SECS.store(now.sec(), Ordering::Relaxed);
    init_tz_adjustment();
}

pub fn configure(reg: &crate::config::Registry, section: &str) {
    let clock_freq = reg.get_int(section, "jiffies_per_sec", 100).clamp(1, 1000);
    JIFFY_NSEC.store(NSECS_PER_SECOND / clock_freq as u64, Ordering::Relaxed);
}

/// Advances the jiffy counter; called by the service thread only.
pub fn inc_cur_jiffies() {
    let now = SrvTime::current();
    *LAST_JIFFY_TIME.lock() = now;
    CUR_SECS.store(now.sec(), Ordering::Relaxed);
    CUR_JIFFIES.fetch_add(1, Ordering::Relaxed);
}

/// Recomputes the TZ offset shortly after every hour boundary, so DST
/// transitions show up in log timestamps without a restart.
pub struct TzAdjuster;

impl TaskHandler for TzAdjuster {
    fn execute_slice(&mut self, task: &TaskRef, _thr_num: ThreadNum) {
        let delay = init_tz_adjustment();
        if !crate::server::is_in_shutdown() {
            task.run_after(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_arithmetic() {
        let a = SrvTime::new(10, 500_000_000);
        let b = SrvTime::new(12, 250_000_000);
        let d = b.since(a);
        assert_eq!(d, SrvTime::new(1, 750_000_000));
        assert_eq!(a.advanced_by(d), b);
        // Saturation instead of negative intervals.
        assert_eq!(a.since(b), SrvTime::default());
    }

    #[test]
    fn usec_conversion() {
        let t = SrvTime::new(3, 250_000);
        assert_eq!(t.as_usec(), 3_000_250);
    }

    #[test]
    fn logging_format_shape() {
        init_time();
        let mut buf = Vec::new();
        SrvTime::current().print_logging(&mut buf);
        let s = String::from_utf8(buf).unwrap();
        // YYYY-MM-DDThh:mm:ss.uuuuuu
        assert_eq!(s.len(), 26);
        assert_eq!(&s[4..5], "-");
        assert_eq!(&s[10..11], "T");
        assert_eq!(&s[19..20], ".");
    }

    #[test]
    fn jiffy_advance_updates_secs() {
        init_time();
        let j = cur_jiffies();
        inc_cur_jiffies();
        assert_eq!(cur_jiffies(), j + 1);
        assert!(cur_secs() > 0);
    }
}
