//! Trampolines written into the patched slots.
//!
//! Each one forwards to the real allocator first, so the caller sees the exact same result, then
//! reports the block to the installed recorder. Calls made while the recorder is already running
//! on this thread are forwarded only.

use libc::{c_int, c_void, size_t};

use crate::{helper::ReentrancyGuard, profiler::installed_recorder};

pub(crate) unsafe extern "C" fn loli_malloc(size: size_t) -> *mut c_void {
    let ptr = libc::malloc(size);

    let guard = ReentrancyGuard::enter();

    if guard.is_outermost() {
        if let Some(recorder) = installed_recorder() {
            recorder.on_alloc(ptr as usize, size);
        }
    }

    ptr
}

pub(crate) unsafe extern "C" fn loli_calloc(n: size_t, size: size_t) -> *mut c_void {
    let ptr = libc::calloc(n, size);

    let guard = ReentrancyGuard::enter();

    if guard.is_outermost() {
        if let (Some(recorder), Some(total)) = (installed_recorder(), n.checked_mul(size)) {
            recorder.on_alloc(ptr as usize, total);
        }
    }

    ptr
}

pub(crate) unsafe extern "C" fn loli_memalign(alignment: size_t, size: size_t) -> *mut c_void {
    let ptr = libc::memalign(alignment, size);

    let guard = ReentrancyGuard::enter();

    if guard.is_outermost() {
        if let Some(recorder) = installed_recorder() {
            recorder.on_alloc(ptr as usize, size);
        }
    }

    ptr
}

pub(crate) unsafe extern "C" fn loli_posix_memalign(
    memptr: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    let ret = libc::posix_memalign(memptr, alignment, size);

    let guard = ReentrancyGuard::enter();

    if ret == 0 && guard.is_outermost() {
        if let Some(recorder) = installed_recorder() {
            recorder.on_alloc(*memptr as usize, size);
        }
    }

    ret
}

pub(crate) unsafe extern "C" fn loli_realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let guard = ReentrancyGuard::enter();

    let recorder = if guard.is_outermost() {
        installed_recorder()
    } else {
        None
    };

    // detach before the block can be handed to another thread.
    let previous = recorder.and_then(|recorder| recorder.detach(ptr as usize));

    let new_ptr = libc::realloc(ptr, size);

    if let Some(recorder) = recorder {
        recorder.on_realloc(previous, new_ptr as usize, size);
    }

    new_ptr
}

pub(crate) unsafe extern "C" fn loli_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }

    {
        let guard = ReentrancyGuard::enter();

        if guard.is_outermost() {
            if let Some(recorder) = installed_recorder() {
                recorder.on_free(ptr as usize);
            }
        }
    }

    libc::free(ptr);
}
