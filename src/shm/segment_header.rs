//! The header at the start of every segment, followed directly by the segment's data:
//!
//! ```ascii
//!  0: magic             u32   set last during initialization
//!  4: lock word         u32   0: unlocked, 1: locked, 2: locked with (potential) waiters
//!  8: notify sequence   u32   incremented by every `notify_all`
//! 12: reserved          u32
//! 16: data size         u64
//! 24: seconds           i32   timestamp, guarded by the lock
//! 28: microseconds      i32
//! 32: padding up to 64 bytes
//! ```
//!
//! The lock is the three-state futex mutex from Ulrich Drepper's "Futexes Are Tricky". It is not
//!  robust: a process that terminates while holding the lock leaves the segment locked.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::shm::futex::{futex_wait, futex_wake, WaitOutcome};
use crate::time::TimeStamp;

pub const MAGIC: u32 = 0x6e75_6c63;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

#[repr(C, align(64))]
pub struct SegmentHeader {
    magic: AtomicU32,
    lock_word: AtomicU32,
    notify_seq: AtomicU32,
    _reserved: u32,
    data_size: AtomicU64,
    ts_seconds: AtomicI32,
    ts_microseconds: AtomicI32,
}

pub const HEADER_LEN: usize = std::mem::size_of::<SegmentHeader>();

impl SegmentHeader {
    /// Initializes a zeroed header. The magic number is written last, so a concurrent opener sees
    ///  either no magic or a complete header.
    pub fn init(&self, data_size: u64) {
        self.data_size.store(data_size, Ordering::Relaxed);
        self.magic.store(MAGIC, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.magic.load(Ordering::Acquire) == MAGIC
    }

    pub fn data_size(&self) -> u64 {
        self.data_size.load(Ordering::Relaxed)
    }

    pub fn lock(&self) {
        let mut state = match self.lock_word.compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return,
            Err(state) => state,
        };

        if state != CONTENDED {
            state = self.lock_word.swap(CONTENDED, Ordering::Acquire);
        }
        while state != UNLOCKED {
            futex_wait(&self.lock_word, CONTENDED, None);
            state = self.lock_word.swap(CONTENDED, Ordering::Acquire);
        }
    }

    pub fn unlock(&self) {
        if self.lock_word.fetch_sub(1, Ordering::Release) != LOCKED {
            self.lock_word.store(UNLOCKED, Ordering::Release);
            futex_wake(&self.lock_word, 1);
        }
    }

    pub fn notify_all(&self) {
        self.notify_seq.fetch_add(1, Ordering::Release);
        futex_wake(&self.notify_seq, i32::MAX);
    }

    /// Blocks until the next `notify_all`
    pub fn wait(&self) {
        let snapshot = self.notify_seq.load(Ordering::Acquire);
        while self.notify_seq.load(Ordering::Acquire) == snapshot {
            futex_wait(&self.notify_seq, snapshot, None);
        }
    }

    /// Returns `false` if there was no `notify_all` before the timeout expired
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let snapshot = self.notify_seq.load(Ordering::Acquire);
        let deadline = Instant::now() + timeout;

        while self.notify_seq.load(Ordering::Acquire) == snapshot {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if futex_wait(&self.notify_seq, snapshot, Some(remaining)) == WaitOutcome::TimedOut {
                return self.notify_seq.load(Ordering::Acquire) != snapshot;
            }
        }
        true
    }

    /// NB: requires the lock, which orders these accesses across processes
    pub fn timestamp(&self) -> TimeStamp {
        TimeStamp {
            seconds: self.ts_seconds.load(Ordering::Relaxed),
            microseconds: self.ts_microseconds.load(Ordering::Relaxed),
        }
    }

    /// NB: requires the lock
    pub fn set_timestamp(&self, ts: TimeStamp) {
        self.ts_seconds.store(ts.seconds, Ordering::Relaxed);
        self.ts_microseconds.store(ts.microseconds, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use std::mem::MaybeUninit;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn zeroed_header() -> Box<SegmentHeader> {
        // SAFETY: all fields are atomics or plain integers, for which all zero bits is valid
        Box::new(unsafe { MaybeUninit::<SegmentHeader>::zeroed().assume_init() })
    }

    #[test]
    fn test_layout() {
        assert_eq!(HEADER_LEN, 64);
        assert_eq!(std::mem::offset_of!(SegmentHeader, data_size), 16);
        assert_eq!(std::mem::offset_of!(SegmentHeader, ts_seconds), 24);
    }

    #[test]
    fn test_init() {
        let header = zeroed_header();
        assert!(!header.is_initialized());

        header.init(1234);
        assert!(header.is_initialized());
        assert_eq!(header.data_size(), 1234);
        assert!(header.timestamp().is_epoch());
    }

    #[test]
    fn test_lock_states() {
        let header = zeroed_header();

        header.lock();
        assert_eq!(header.lock_word.load(Ordering::Relaxed), LOCKED);
        header.unlock();
        assert_eq!(header.lock_word.load(Ordering::Relaxed), UNLOCKED);
    }

    #[test]
    fn test_lock_is_mutually_exclusive() {
        let header: Arc<SegmentHeader> = Arc::from(zeroed_header());
        let counter = Arc::new(AtomicU64::new(0));

        let handles = (0..4)
            .map(|_| {
                let header = header.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        header.lock();
                        // non-atomic read-modify-write, only correct under mutual exclusion
                        let value = counter.load(Ordering::Relaxed);
                        counter.store(value + 1, Ordering::Relaxed);
                        header.unlock();
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        assert_eq!(header.lock_word.load(Ordering::Relaxed), UNLOCKED);
    }

    #[test]
    fn test_wait_timeout_without_notification() {
        let header = zeroed_header();
        assert!(!header.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_wait_is_woken_by_notify() {
        let header: Arc<SegmentHeader> = Arc::from(zeroed_header());

        let header_for_thread = header.clone();
        let handle = thread::spawn(move || header_for_thread.wait_timeout(Duration::from_secs(10)));

        // the waiter may not be blocked yet, so keep notifying until it returns
        while !handle.is_finished() {
            header.notify_all();
            thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_timestamp() {
        let header = zeroed_header();
        let ts = TimeStamp { seconds: 12, microseconds: 34 };
        header.set_timestamp(ts);
        assert_eq!(header.timestamp(), ts);
    }
}
