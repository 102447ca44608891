use crate::futex::{Futex, WaitResult};
use lock_api::GuardSend;

/// Low-level mutual exclusion lock over a futex word.
///
/// The word counts the holder plus all waiters. `lock` increments it; whoever
/// moves it from 0 to 1 owns the lock, everyone else parks on the futex.
/// `unlock` decrements and, if waiters remain, hands the lock to exactly one
/// of them by waking it — ownership transfers through the wake-up itself, so
/// a woken thread does not loop back to re-acquire.
pub struct RawMiniMutex {
    futex: Futex,
}

// Safety: lock/try_lock establish exclusive ownership before returning and
// unlock releases it; the futex word serializes all transitions.
unsafe impl lock_api::RawMutex for RawMiniMutex {
    #[allow(clippy::declare_interior_mutable_const, reason = "lock_api requires it")]
    const INIT: Self = Self {
        futex: Futex::new(0),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        let mut val = self.futex.add_value(1);
        debug_assert!(val >= 1);
        if val != 1 {
            // The kernel refusing the sleep means the word moved under us;
            // only an actual wake-up grants ownership.
            while self.futex.wait_value_change(val) == WaitResult::ValueChanged {
                val = self.futex.value();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.futex.change_value(0, 1)
    }

    unsafe fn unlock(&self) {
        let val = self.futex.add_value(-1);
        debug_assert!(val >= 0);
        if val != 0 {
            // A waiter exists but may not have parked yet; retry until the
            // wake actually lands on someone.
            while self.futex.wake_up_waiters(1) != 1 {
                std::thread::yield_now();
            }
        }
    }

    fn is_locked(&self) -> bool {
        self.futex.value() != 0
    }
}

#[cfg(test)]
mod tests {
    use crate::Mutex;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn uncontended_roundtrip() {
        let m = Mutex::new(5_u32);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = Mutex::new(());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn counts_survive_contention() {
        let m = Arc::new(Mutex::new(0_u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&m);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *m.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 80_000);
    }
}
