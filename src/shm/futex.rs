//! Futex wait / wake on words in shared memory.
//!
//! NB: This uses the *shared* futex operations (`FUTEX_WAIT` / `FUTEX_WAKE`), not the `_PRIVATE`
//!  variants. Private futexes only work inside a single process and would silently fail to wake
//!  waiters in other processes.
//!
//! Other platforms fall back to polling with short sleeps.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WaitOutcome {
    /// woken up, or the word did not have the expected value in the first place. Spurious wakeups
    ///  are reported this way as well.
    Woken,
    TimedOut,
}

#[cfg(target_os = "linux")]
const FUTEX_WAIT: i32 = 0;
#[cfg(target_os = "linux")]
const FUTEX_WAKE: i32 = 1;

/// Blocks while `word` holds `expected`, until woken or until the timeout expires
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts.as_ref()
        .map_or(std::ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: `word` is a valid, aligned u32 for the duration of the call. The kernel only reads it.
    let result = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0i32,
        )
    };

    if result != 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ETIMEDOUT) {
        WaitOutcome::TimedOut
    }
    else {
        WaitOutcome::Woken
    }
}

/// Wakes up to `count` waiters blocked on `word`
#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32, count: i32) {
    // SAFETY: `word` is a valid, aligned u32. Waking has no memory effects.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0i32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitOutcome {
    use std::sync::atomic::Ordering;

    const POLL_INTERVAL: Duration = Duration::from_millis(1);

    if word.load(Ordering::Acquire) != expected {
        return WaitOutcome::Woken;
    }
    match timeout {
        Some(t) if t <= POLL_INTERVAL => {
            std::thread::sleep(t);
            WaitOutcome::TimedOut
        }
        _ => {
            std::thread::sleep(POLL_INTERVAL);
            WaitOutcome::Woken
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_word: &AtomicU32, _count: i32) {
}
