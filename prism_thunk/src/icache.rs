//! Instruction cache synchronization.
//!
//! After new code is written to memory and before it is first executed, the
//! instruction stream for that range must be made coherent with the data
//! that was stored. x86 keeps the two coherent in hardware, so only a
//! compiler/memory fence is needed there. Other architectures ask the OS.

use std::sync::atomic::{Ordering, fence};

/// Make `len` bytes starting at `ptr` safe to execute on every core.
///
/// Zero-length ranges are a no-op.
pub fn flush_instruction_cache(ptr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    fence(Ordering::SeqCst);
    platform::flush(ptr, len);
}

#[cfg(windows)]
mod platform {
    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    pub fn flush(ptr: *const u8, len: usize) {
        unsafe {
            FlushInstructionCache(GetCurrentProcess(), ptr as *const _, len);
        }
    }
}

#[cfg(all(not(windows), any(target_arch = "x86", target_arch = "x86_64")))]
mod platform {
    #[inline]
    pub fn flush(_ptr: *const u8, _len: usize) {}
}

#[cfg(all(
    not(windows),
    target_vendor = "apple",
    not(any(target_arch = "x86", target_arch = "x86_64"))
))]
mod platform {
    unsafe extern "C" {
        fn sys_icache_invalidate(start: *mut core::ffi::c_void, len: usize);
    }

    pub fn flush(ptr: *const u8, len: usize) {
        unsafe { sys_icache_invalidate(ptr as *mut _, len) };
    }
}

#[cfg(all(
    not(windows),
    not(target_vendor = "apple"),
    not(any(target_arch = "x86", target_arch = "x86_64"))
))]
mod platform {
    unsafe extern "C" {
        fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
    }

    pub fn flush(ptr: *const u8, len: usize) {
        let start = ptr as *mut core::ffi::c_char;
        unsafe { __clear_cache(start, start.add(len)) };
    }
}
