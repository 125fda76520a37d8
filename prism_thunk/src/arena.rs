//! Executable memory arena for closure trampolines.
//!
//! This module provides:
//! - Platform-specific page allocation (VirtualAlloc/mmap)
//! - A page-granular pool of regions carved out of large backing chunks
//! - The write-then-execute (W^X) transition for each region
//!
//! # Region lifecycle
//! ```text
//! alloc ──> RW (written once) ──seal──> RX (published) ──dealloc──> RW, scrubbed, pooled
//! ```
//!
//! Every region spans whole pages, so sealing or unsealing one never changes
//! the protection of another closure's code.
//!
//! # Safety
//! Raw pointers stay inside this module. Callers see `ExecRegion`, which
//! refuses writes once sealed.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};

use crate::config::ArenaConfig;
use crate::error::{ThunkError, ThunkResult};

/// Byte written over free and unused code space (INT3 on x86).
pub const TRAP_FILL: u8 = 0xCC;

// =============================================================================
// Page mapping
// =============================================================================

/// Protection a region can be switched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prot {
    ReadWrite,
    ReadExec,
}

#[cfg(windows)]
mod platform {
    use std::io;
    use std::ptr::{self, NonNull};

    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE, VirtualAlloc,
        VirtualFree, VirtualProtect,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    use super::Prot;

    pub fn page_size() -> usize {
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }

    /// Commit `len` fresh RW bytes.
    pub unsafe fn map_rw(len: usize) -> Option<NonNull<u8>> {
        let base =
            unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        NonNull::new(base.cast())
    }

    pub unsafe fn unmap(base: NonNull<u8>, _len: usize) {
        unsafe { VirtualFree(base.as_ptr().cast(), 0, MEM_RELEASE) };
    }

    pub unsafe fn protect(base: NonNull<u8>, len: usize, prot: Prot) -> io::Result<()> {
        let flags = match prot {
            Prot::ReadWrite => PAGE_READWRITE,
            Prot::ReadExec => PAGE_EXECUTE_READ,
        };
        let mut previous = 0;
        match unsafe { VirtualProtect(base.as_ptr().cast(), len, flags, &mut previous) } {
            0 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        }
    }
}

#[cfg(unix)]
mod platform {
    use std::io;
    use std::ptr::{self, NonNull};

    use super::Prot;

    pub fn page_size() -> usize {
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        }
    }

    /// Map `len` fresh anonymous RW bytes.
    pub unsafe fn map_rw(len: usize) -> Option<NonNull<u8>> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let base = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
        if base == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(base.cast())
    }

    pub unsafe fn unmap(base: NonNull<u8>, len: usize) {
        unsafe { libc::munmap(base.as_ptr().cast(), len) };
    }

    pub unsafe fn protect(base: NonNull<u8>, len: usize, prot: Prot) -> io::Result<()> {
        let flags = match prot {
            Prot::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Prot::ReadExec => libc::PROT_READ | libc::PROT_EXEC,
        };
        match unsafe { libc::mprotect(base.as_ptr().cast(), len, flags) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

// =============================================================================
// Executable Region
// =============================================================================

/// A page-aligned block of memory handed out by [`ExecArena`].
///
/// Freshly allocated regions are writable and not executable. After
/// [`ExecArena::seal`] they are executable and read-only; the base address
/// never changes for the region's lifetime.
///
/// A region borrows the arena it came from, so it cannot outlive the
/// mapping behind it:
///
/// ```compile_fail
/// use prism_thunk::{ArenaConfig, ExecArena};
///
/// let region = {
///     let arena = ExecArena::new(ArenaConfig::for_testing());
///     arena.alloc(16).unwrap()
/// };
/// let _ = region.as_slice()[0];
/// ```
pub struct ExecRegion<'a> {
    ptr: NonNull<u8>,
    len: usize,
    sealed: bool,
    arena: &'a ExecArena,
}

impl fmt::Debug for ExecRegion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("sealed", &self.sealed)
            .finish()
    }
}

impl ExecRegion<'_> {
    /// Base address of the region.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Region size in bytes (a whole number of pages).
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false for regions handed out by the arena.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the region has been made executable.
    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Check if an address lies inside this region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.ptr.as_ptr() as usize;
        addr >= base && addr < base + self.len
    }

    /// Copy `bytes` to the start of the region.
    ///
    /// # Panics
    /// Panics if the region is sealed or the bytes do not fit.
    pub fn write(&mut self, bytes: &[u8]) {
        assert!(!self.sealed, "Cannot write to sealed region");
        assert!(bytes.len() <= self.len, "Region overflow");

        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr(), bytes.len());
        }
    }

    /// Overwrite the whole region with `byte`.
    ///
    /// # Panics
    /// Panics if the region is sealed.
    pub fn fill(&mut self, byte: u8) {
        assert!(!self.sealed, "Cannot write to sealed region");
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr(), byte, self.len);
        }
    }

    /// View the region's bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

// Regions are only mutated through `&mut` before sealing; afterwards they are read-only.
unsafe impl Send for ExecRegion<'_> {}
unsafe impl Sync for ExecRegion<'_> {}

// =============================================================================
// Arena Statistics
// =============================================================================

/// Counters for arena activity.
#[derive(Debug, Default)]
pub struct ArenaStats {
    live_regions: AtomicUsize,
    bytes_in_use: AtomicUsize,
    chunks_mapped: AtomicUsize,
    allocations: AtomicUsize,
    reuses: AtomicUsize,
}

impl ArenaStats {
    /// All counters at zero.
    pub const fn new() -> Self {
        ArenaStats {
            live_regions: AtomicUsize::new(0),
            bytes_in_use: AtomicUsize::new(0),
            chunks_mapped: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
            reuses: AtomicUsize::new(0),
        }
    }

    fn record_alloc(&self, bytes: usize, reused: bool) {
        self.live_regions.fetch_add(1, Ordering::Relaxed);
        self.bytes_in_use.fetch_add(bytes, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        if reused {
            self.reuses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_dealloc(&self, bytes: usize) {
        self.live_regions.fetch_sub(1, Ordering::Relaxed);
        self.bytes_in_use.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Regions currently handed out.
    pub fn live_regions(&self) -> usize {
        self.live_regions.load(Ordering::Relaxed)
    }

    /// Bytes currently handed out.
    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use.load(Ordering::Relaxed)
    }

    /// Backing chunks mapped so far.
    pub fn chunks_mapped(&self) -> usize {
        self.chunks_mapped.load(Ordering::Relaxed)
    }

    /// Total successful allocations.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Allocations served from a previously freed region.
    pub fn reuses(&self) -> usize {
        self.reuses.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Arena
// =============================================================================

struct Chunk {
    base: NonNull<u8>,
    len: usize,
}

#[derive(Default)]
struct ArenaState {
    chunks: Vec<Chunk>,
    /// Bytes already carved from the most recent chunk.
    cursor: usize,
    /// Freed regions keyed by their page count.
    free: FxHashMap<usize, Vec<NonNull<u8>>>,
}

/// Process-wide pool of execute-capable pages.
///
/// Backing memory is mapped lazily on first allocation and unmapped when the
/// arena is dropped. Regions borrow the arena, so none can outlive it.
///
/// Regions are whole pages, so each live closure costs one page (4 KiB on
/// most hosts) regardless of its code size. An arena with `max_chunks = m`
/// and `chunk_pages = p` holds at most `m * p` single-page closures at once.
pub struct ExecArena {
    config: ArenaConfig,
    page_size: usize,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    state: Mutex<ArenaState>,
    stats: ArenaStats,
}

// The state is only reached through its mutex; chunk pointers are owned.
unsafe impl Send for ExecArena {}
unsafe impl Sync for ExecArena {}

impl ExecArena {
    /// Create an arena. No memory is mapped until the first allocation.
    pub fn new(config: ArenaConfig) -> Self {
        Self {
            config,
            page_size: platform::page_size(),
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            state: Mutex::new(ArenaState::default()),
            stats: ArenaStats::new(),
        }
    }

    /// The arena's configuration.
    #[inline]
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// OS page size used for region granularity.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Activity counters.
    #[inline]
    pub fn stats(&self) -> &ArenaStats {
        &self.stats
    }

    /// Whether the backing memory has been mapped.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Map the first backing chunk if that has not happened yet.
    ///
    /// Safe to call from any number of threads; exactly one maps the chunk.
    /// Failing to obtain the initial chunk aborts the process.
    pub fn ensure_initialized(&self) {
        if self.initialized.load(Ordering::Acquire) {
            return;
        }

        let _guard = self.init_lock.lock();
        if self.initialized.load(Ordering::Acquire) {
            return;
        }

        let len = self.config.chunk_pages.max(1) * self.page_size;
        let Some(chunk) = self.map_chunk(len) else {
            error!(
                target: "prism_thunk::arena",
                len,
                os_error = %std::io::Error::last_os_error(),
                "failed to map initial executable arena chunk"
            );
            std::process::abort();
        };

        {
            let mut state = self.state.lock();
            state.chunks.push(chunk);
            state.cursor = 0;
        }
        debug!(target: "prism_thunk::arena", len, page_size = self.page_size, "arena initialized");
        self.initialized.store(true, Ordering::Release);
    }

    /// Allocate a writable region of at least `size` bytes.
    ///
    /// The region is page-aligned, spans whole pages and starts filled with
    /// [`TRAP_FILL`].
    pub fn alloc(&self, size: usize) -> ThunkResult<ExecRegion<'_>> {
        self.ensure_initialized();

        let pages = size.max(1).div_ceil(self.page_size);
        let len = pages * self.page_size;

        let (ptr, reused) = {
            let mut state = self.state.lock();
            if let Some(ptr) = state.free.get_mut(&pages).and_then(Vec::pop) {
                (ptr, true)
            } else {
                (self.carve(&mut state, len)?, false)
            }
        };

        let mut region = ExecRegion {
            ptr,
            len,
            sealed: false,
            arena: self,
        };
        if !reused {
            region.fill(TRAP_FILL);
        }

        self.stats.record_alloc(len, reused);
        trace!(target: "prism_thunk::arena", addr = ?region.as_ptr(), len, reused, "region allocated");
        Ok(region)
    }

    /// Make a written region executable and read-only.
    ///
    /// # Panics
    /// Panics if `region` was allocated by a different arena.
    pub fn seal(&self, region: &mut ExecRegion<'_>) -> ThunkResult<()> {
        assert!(self.owns(region), "region sealed by a foreign arena");
        if region.sealed {
            return Ok(());
        }
        unsafe { platform::protect(region.ptr, region.len, Prot::ReadExec) }
            .map_err(|err| ThunkError::Protection(err.to_string()))?;
        region.sealed = true;
        Ok(())
    }

    /// Return a region to the pool.
    ///
    /// The region loses execute permission and is scrubbed before it can be
    /// handed out again. If its protection cannot be changed back it is
    /// leaked rather than reused.
    ///
    /// # Panics
    /// Panics if `region` was allocated by a different arena.
    pub fn dealloc(&self, mut region: ExecRegion<'_>) {
        assert!(self.owns(&region), "region returned to a foreign arena");
        debug_assert!(
            self.state.lock().chunks.iter().any(|chunk| {
                let base = chunk.base.as_ptr() as usize;
                let addr = region.as_ptr() as usize;
                addr >= base && addr + region.len <= base + chunk.len
            }),
            "region outside every mapped chunk"
        );
        let len = region.len;
        if region.sealed {
            if let Err(err) = unsafe { platform::protect(region.ptr, len, Prot::ReadWrite) } {
                warn!(
                    target: "prism_thunk::arena",
                    addr = ?region.as_ptr(),
                    os_error = %err,
                    "could not unseal region; leaking it"
                );
                self.stats.record_dealloc(len);
                return;
            }
            region.sealed = false;
        }
        region.fill(TRAP_FILL);

        let pages = len / self.page_size;
        self.state.lock().free.entry(pages).or_default().push(region.ptr);
        self.stats.record_dealloc(len);
        trace!(target: "prism_thunk::arena", addr = ?region.as_ptr(), len, "region released");
    }

    /// Bump-allocate `len` bytes, mapping a new chunk when the current one is full.
    fn carve(&self, state: &mut ArenaState, len: usize) -> ThunkResult<NonNull<u8>> {
        if let Some(last) = state.chunks.last() {
            if last.len - state.cursor >= len {
                let ptr = unsafe { last.base.as_ptr().add(state.cursor) };
                state.cursor += len;
                return Ok(unsafe { NonNull::new_unchecked(ptr) });
            }
        }

        if let Some(max) = self.config.max_chunks {
            if state.chunks.len() >= max {
                return Err(ThunkError::ArenaExhausted { requested: len });
            }
        }

        let chunk_len = (self.config.chunk_pages.max(1) * self.page_size).max(len);
        let chunk = self
            .map_chunk(chunk_len)
            .ok_or(ThunkError::ArenaExhausted { requested: len })?;

        // Hand the tail of the old chunk to the single-page pool.
        if let Some(last) = state.chunks.last() {
            let mut offset = state.cursor;
            while last.len - offset >= self.page_size {
                let ptr = unsafe { NonNull::new_unchecked(last.base.as_ptr().add(offset)) };
                state.free.entry(1).or_default().push(ptr);
                offset += self.page_size;
            }
        }

        debug!(target: "prism_thunk::arena", chunk_len, chunks = state.chunks.len() + 1, "arena grew");
        let base = chunk.base;
        state.chunks.push(chunk);
        state.cursor = len;
        Ok(base)
    }

    #[inline]
    fn owns(&self, region: &ExecRegion<'_>) -> bool {
        std::ptr::eq(region.arena, self)
    }

    fn map_chunk(&self, len: usize) -> Option<Chunk> {
        let base = unsafe { platform::map_rw(len) }?;
        self.stats.chunks_mapped.fetch_add(1, Ordering::Relaxed);
        Some(Chunk { base, len })
    }
}

impl Drop for ExecArena {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for chunk in state.chunks.drain(..) {
            unsafe { platform::unmap(chunk.base, chunk.len) };
        }
        if self.stats.live_regions() > 0 {
            warn!(
                target: "prism_thunk::arena",
                live = self.stats.live_regions(),
                "arena dropped with live regions"
            );
        }
    }
}

impl fmt::Debug for ExecArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecArena")
            .field("page_size", &self.page_size)
            .field("initialized", &self.is_initialized())
            .field("live_regions", &self.stats.live_regions())
            .field("chunks_mapped", &self.stats.chunks_mapped())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
