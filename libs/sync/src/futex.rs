use core::ptr;
use core::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

/// Outcome of a [`Futex::wait_value_change`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Another thread woke us through [`Futex::wake_up_waiters`].
    WokenUp,
    /// The futex word no longer held the expected value, so the kernel
    /// refused to put us to sleep.
    ValueChanged,
    /// The timeout elapsed before any wake-up arrived.
    TimedOut,
}

/// A 32-bit word that threads can sleep on.
///
/// This is a thin wrapper over the `FUTEX_WAIT`/`FUTEX_WAKE` pair. The value
/// itself carries whatever meaning the caller gives it (queue length, lock
/// word, barrier count); the futex only provides "sleep while the word still
/// equals X" and "wake up to N sleepers".
pub struct Futex {
    value: AtomicI32,
}

impl Futex {
    pub const fn new(value: i32) -> Self {
        Self {
            value: AtomicI32::new(value),
        }
    }

    #[inline]
    pub fn value(&self) -> i32 {
        self.value.load(Ordering::SeqCst)
    }

    /// Compare-and-swap on the futex word.
    #[inline]
    pub fn change_value(&self, old_value: i32, new_value: i32) -> bool {
        self.value
            .compare_exchange(old_value, new_value, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Adds `cnt_to_add` and returns the new value.
    #[inline]
    pub fn add_value(&self, cnt_to_add: i32) -> i32 {
        self.value.fetch_add(cnt_to_add, Ordering::SeqCst) + cnt_to_add
    }

    /// Plain store. Only valid while no other thread can race on the word,
    /// e.g. under a lock that also guards every writer.
    #[inline]
    pub fn set_value_nonatomic(&self, new_value: i32) {
        self.value.store(new_value, Ordering::SeqCst);
    }

    /// Sleeps until the word stops being `old_value` or a wake-up arrives.
    pub fn wait_value_change(&self, old_value: i32) -> WaitResult {
        loop {
            // Safety: the futex word outlives the syscall; timeout is null.
            let res = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    self.value.as_ptr(),
                    libc::FUTEX_WAIT,
                    old_value,
                    ptr::null::<libc::timespec>(),
                    ptr::null::<u32>(),
                    0,
                )
            };
            if res == 0 {
                return WaitResult::WokenUp;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                continue;
            }
            return WaitResult::ValueChanged;
        }
    }

    /// Like [`Self::wait_value_change`] but gives up after `timeout`.
    pub fn wait_value_change_timeout(&self, old_value: i32, timeout: Duration) -> WaitResult {
        let start = Instant::now();
        let mut left = timeout;
        loop {
            let ts = libc::timespec {
                tv_sec: left.as_secs() as libc::time_t,
                tv_nsec: libc::c_long::from(left.subsec_nanos()),
            };
            // Safety: the futex word outlives the syscall and `ts` is a live
            // stack value for its duration.
            let res = unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    self.value.as_ptr(),
                    libc::FUTEX_WAIT,
                    old_value,
                    &raw const ts,
                    ptr::null::<u32>(),
                    0,
                )
            };
            if res == 0 {
                return WaitResult::WokenUp;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EINTR => {
                    let spent = start.elapsed();
                    if spent >= timeout {
                        return WaitResult::TimedOut;
                    }
                    left = timeout - spent;
                }
                libc::ETIMEDOUT => return WaitResult::TimedOut,
                // EAGAIN and anything unexpected both mean "no sleep
                // happened"; the caller re-reads the word either way.
                _ => return WaitResult::ValueChanged,
            }
        }
    }

    /// Wakes up to `cnt_to_wake` sleepers; returns how many actually woke.
    pub fn wake_up_waiters(&self, cnt_to_wake: i32) -> i32 {
        // Safety: the futex word outlives the syscall; timeout is null.
        let res = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.value.as_ptr(),
                libc::FUTEX_WAKE,
                cnt_to_wake,
                ptr::null::<libc::timespec>(),
                ptr::null::<u32>(),
                0,
            )
        };
        if res < 0 { 0 } else { res as i32 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_refuses_on_changed_value() {
        let f = Futex::new(7);
        assert_eq!(f.wait_value_change(3), WaitResult::ValueChanged);
    }

    #[test]
    fn wait_times_out() {
        let f = Futex::new(0);
        let res = f.wait_value_change_timeout(0, Duration::from_millis(30));
        assert_eq!(res, WaitResult::TimedOut);
    }

    #[test]
    fn wake_reaches_sleeper() {
        let f = Arc::new(Futex::new(0));
        let f2 = Arc::clone(&f);
        let waiter = thread::spawn(move || f2.wait_value_change_timeout(0, Duration::from_secs(5)));
        // Keep waking until the sleeper is actually parked.
        loop {
            if f.wake_up_waiters(1) == 1 {
                break;
            }
            thread::yield_now();
        }
        assert_eq!(waiter.join().unwrap(), WaitResult::WokenUp);
    }
}
