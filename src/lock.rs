//! A two-word lock: a held word plus a waiter count.
//!
//! The fast path is a single atomic swap. Contended acquisitions register in
//! the waiter word and block on a futex (on Linux), so an uncontended
//! allocator pays nothing for wakeups; with no concurrent callers the lock
//! degenerates to an uncontested swap/store pair.

use core::sync::atomic::{AtomicU32, Ordering};

const SPIN_LIMIT: u32 = 100;

pub(crate) struct Lock {
    held: AtomicU32,
    waiters: AtomicU32,
}

impl Lock {
    pub const fn new() -> Self {
        Lock {
            held: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
        }
    }

    pub fn lock(&self) {
        while self.held.swap(1, Ordering::Acquire) != 0 {
            self.wait();
        }
    }

    pub fn unlock(&self) {
        // The release of the held word must be globally visible before the
        // waiter count is read; a release store alone does not order the
        // later load, and a contender that registers and re-checks `held`
        // in that window would park with no wake coming.
        self.held.swap(0, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) != 0 {
            wake(&self.held);
        }
    }

    /// Blocks until the held word is plausibly free again. Spins briefly
    /// first so short critical sections never reach the kernel.
    fn wait(&self) {
        for _ in 0..SPIN_LIMIT {
            if self.held.load(Ordering::Relaxed) == 0 {
                return;
            }
            core::hint::spin_loop();
        }
        // Registration must precede the re-check of `held` in the total
        // order, mirroring the unlock side's swap-then-load.
        self.waiters.fetch_add(1, Ordering::SeqCst);
        while self.held.load(Ordering::SeqCst) != 0 {
            futex_wait(&self.held, 1);
        }
        self.waiters.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            core::ptr::null::<libc::timespec>(),
        );
    }
}

#[cfg(target_os = "linux")]
fn wake(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(_word: &AtomicU32, _expected: u32) {
    std::thread::yield_now();
}

#[cfg(not(target_os = "linux"))]
fn wake(_word: &AtomicU32) {}
