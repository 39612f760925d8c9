//! Thread-local and process-wide state kept in C: a `_Thread_local` counter stays usable while
//! the allocator itself is hooked, which a lazily allocated rust `thread_local!` does not.

use std::ffi::c_int;

extern "C" {
    fn loli_hook_enter() -> c_int;
    fn loli_hook_leave() -> c_int;
    fn loli_unwind_lock();
    fn loli_unwind_unlock();
}

/// Marks the current thread as running a trampoline until dropped.
///
/// Only the outermost guard of a thread records; allocations made by the recorder while it runs
/// see a nested guard and are forwarded untouched.
pub(crate) struct ReentrancyGuard {
    depth: c_int,
}

impl ReentrancyGuard {
    #[inline]
    pub(crate) fn enter() -> Self {
        Self {
            depth: unsafe { loli_hook_enter() },
        }
    }

    #[inline]
    pub(crate) fn is_outermost(&self) -> bool {
        self.depth == 1
    }
}

impl Drop for ReentrancyGuard {
    #[inline]
    fn drop(&mut self) {
        unsafe { loli_hook_leave() };
    }
}

/// Held while walking a stack.
pub(crate) struct UnwindLock(());

#[inline]
pub(crate) fn lock_unwinder() -> UnwindLock {
    unsafe { loli_unwind_lock() };

    UnwindLock(())
}

impl Drop for UnwindLock {
    #[inline]
    fn drop(&mut self) {
        unsafe { loli_unwind_unlock() };
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn only_the_outermost_guard_records() {
        let outer = ReentrancyGuard::enter();

        assert!(outer.is_outermost());

        {
            let inner = ReentrancyGuard::enter();
            assert!(!inner.is_outermost());
        }

        drop(outer);

        assert!(ReentrancyGuard::enter().is_outermost());
    }

    #[test]
    fn depth_is_per_thread() {
        let _outer = ReentrancyGuard::enter();

        let elsewhere = thread::spawn(|| ReentrancyGuard::enter().is_outermost())
            .join()
            .unwrap();

        assert!(elsewhere);
    }

    #[test]
    fn unwinder_lock_is_released_on_drop() {
        drop(lock_unwinder());

        let relocked = thread::spawn(|| {
            let _lock = lock_unwinder();
            true
        })
        .join()
        .unwrap();

        assert!(relocked);
    }
}
