//! Closure handles.
//!
//! A handle owns one executable region holding a trampoline stamped with an
//! (instance, target) pair. The region's address is the plain function
//! pointer handed to C-style callback APIs; it stays valid, and at the same
//! address, until the handle is dropped.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::trace;

use crate::arena::ExecRegion;
use crate::context::ThunkContext;
use crate::error::{ThunkError, ThunkResult};
use crate::icache::flush_instruction_cache;
use crate::layout::TrampolineLayout;
use crate::signature::{Callback, Signature};

/// Whether the host can execute generated trampolines.
pub const fn is_supported_target() -> bool {
    cfg!(target_arch = "x86_64")
}

// =============================================================================
// Untyped handle
// =============================================================================

/// A closure described by a runtime [`Signature`] of any arity.
pub struct RawThunk<'ctx> {
    ctx: &'ctx ThunkContext,
    region: Option<ExecRegion<'ctx>>,
    code: *const u8,
    layout: Arc<TrampolineLayout>,
}

// The code is immutable once published; the caller vouches for the instance.
unsafe impl Send for RawThunk<'_> {}
unsafe impl Sync for RawThunk<'_> {}

impl<'ctx> RawThunk<'ctx> {
    /// Generate a trampoline that calls `target(instance, args..)` when
    /// invoked as a Win64 function described by `sig`.
    ///
    /// # Safety
    /// `target` must be a Win64 function taking a pointer followed by the
    /// arguments of `sig` and returning `sig`'s return class. `instance`
    /// must stay valid for every invocation of the closure.
    pub unsafe fn new(
        ctx: &'ctx ThunkContext,
        instance: *const (),
        target: *const u8,
        sig: &Signature,
    ) -> ThunkResult<Self> {
        let layout = ctx.layouts().get_or_build(sig)?;
        if !is_supported_target() {
            return Err(ThunkError::UnsupportedTarget(std::env::consts::ARCH));
        }

        let arena = ctx.arena();
        let mut region = arena.alloc(layout.code().len())?;
        region.write(&layout.instantiate(instance, target));
        if let Err(err) = arena.seal(&mut region) {
            arena.dealloc(region);
            return Err(err);
        }
        flush_instruction_cache(region.as_ptr(), layout.code().len());

        let code = region.as_ptr();
        trace!(
            target: "prism_thunk::thunk",
            code = ?code,
            instance = ?instance,
            target_fn = ?target,
            shape = %layout.shape(),
            "closure created"
        );

        Ok(Self {
            ctx,
            region: Some(region),
            code,
            layout,
        })
    }

    /// Entry point of the closure.
    ///
    /// Dangles once the handle is dropped.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.code
    }

    /// Entry point as an address.
    #[inline]
    pub fn code_address(&self) -> usize {
        self.code as usize
    }

    /// Layout the closure was stamped from.
    #[inline]
    pub fn layout(&self) -> &TrampolineLayout {
        &self.layout
    }
}

impl Drop for RawThunk<'_> {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            trace!(target: "prism_thunk::thunk", code = ?self.code, "closure released");
            self.ctx.arena().dealloc(region);
        }
    }
}

impl fmt::Debug for RawThunk<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawThunk")
            .field("code", &self.code)
            .field("shape", self.layout.shape())
            .finish()
    }
}

// =============================================================================
// Typed handle
// =============================================================================

/// A closure binding `&'a T` to a method, callable as the plain pointer `F`.
///
/// ```ignore
/// type KeyFn = extern "win64" fn(i32, i32) -> i32;
///
/// struct Offset(i32);
/// impl Offset {
///     extern "win64" fn apply(&self, a: i32, b: i32) -> i32 { a + b + self.0 }
/// }
///
/// let ctx = ThunkContext::default();
/// let offset = Offset(100);
/// let thunk = Thunk::<KeyFn, _>::new(&ctx, &offset, Offset::apply)?;
/// assert_eq!((unsafe { thunk.callback() })(1, 2), 103);
/// ```
pub struct Thunk<'a, F, T> {
    raw: RawThunk<'a>,
    _marker: PhantomData<(&'a T, F)>,
}

impl<'a, F: Callback<T>, T> Thunk<'a, F, T> {
    /// Bind `instance` to `method`.
    pub fn new(ctx: &'a ThunkContext, instance: &'a T, method: F::Method) -> ThunkResult<Self> {
        let instance = instance as *const T as *const ();
        let target = F::method_address(method);
        // `Callback` ties the signature to both function types.
        let raw = unsafe { RawThunk::new(ctx, instance, target, &F::signature())? };
        Ok(Self {
            raw,
            _marker: PhantomData,
        })
    }

    /// The plain function pointer.
    ///
    /// # Safety
    /// The pointer is only callable while this handle lives. Once the handle
    /// drops, its page is scrubbed with INT3 and may hold another closure, so
    /// the caller must not invoke or hand out the pointer past that point.
    ///
    /// Calls pass `&T` to the method on whichever thread makes them. Unless
    /// `T: Sync`, every call must happen on the thread that owns `instance`.
    ///
    /// Taking the pointer is an unsafe operation:
    ///
    /// ```compile_fail
    /// use prism_thunk::{Thunk, ThunkContext};
    ///
    /// struct Source(u64);
    /// impl Source {
    ///     extern "win64" fn get(&self) -> u64 { self.0 }
    /// }
    ///
    /// let ctx = ThunkContext::default();
    /// let source = Source(1);
    /// let thunk = Thunk::<extern "win64" fn() -> u64, _>::new(&ctx, &source, Source::get).unwrap();
    /// let f = thunk.callback();
    /// ```
    #[inline]
    pub unsafe fn callback(&self) -> F {
        unsafe { F::from_code(self.raw.as_ptr()) }
    }

    /// Entry point as an address, stable for the handle's lifetime.
    #[inline]
    pub fn code_address(&self) -> usize {
        self.raw.code_address()
    }

    /// Untyped view of the handle.
    #[inline]
    pub fn as_raw(&self) -> &RawThunk<'a> {
        &self.raw
    }
}

impl<F, T> fmt::Debug for Thunk<'_, F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Thunk").field(&self.raw).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::config::ArenaConfig;
    use crate::signature::{ArgClass, RetClass};
    use std::cell::Cell;

    struct Counter {
        base: i64,
        calls: Cell<u32>,
    }

    impl Counter {
        extern "win64" fn add(&self, a: i64, b: i64) -> i64 {
            self.calls.set(self.calls.get() + 1);
            self.base + a + b
        }

        extern "win64" fn scale(&self, x: f64) -> f64 {
            x * self.base as f64
        }
    }

    fn ctx() -> ThunkContext {
        ThunkContext::new(ArenaConfig::for_testing())
    }

    #[test]
    fn test_typed_int_closure() {
        let ctx = ctx();
        let counter = Counter {
            base: 100,
            calls: Cell::new(0),
        };
        type AddFn = extern "win64" fn(i64, i64) -> i64;

        let thunk = Thunk::<AddFn, _>::new(&ctx, &counter, Counter::add).unwrap();
        let f = unsafe { thunk.callback() };
        assert_eq!(f(1, 2), 103);
        assert_eq!(f(-100, 0), 0);
        assert_eq!(counter.calls.get(), 2);
    }

    #[test]
    fn test_typed_float_closure() {
        let ctx = ctx();
        let counter = Counter {
            base: 4,
            calls: Cell::new(0),
        };
        type ScaleFn = extern "win64" fn(f64) -> f64;

        let thunk = Thunk::<ScaleFn, _>::new(&ctx, &counter, Counter::scale).unwrap();
        assert_eq!((unsafe { thunk.callback() })(2.5), 10.0);
    }

    #[test]
    fn test_handle_releases_region() {
        let ctx = ctx();
        let counter = Counter {
            base: 0,
            calls: Cell::new(0),
        };
        type AddFn = extern "win64" fn(i64, i64) -> i64;

        let thunk = Thunk::<AddFn, _>::new(&ctx, &counter, Counter::add).unwrap();
        assert_eq!(ctx.arena().stats().live_regions(), 1);
        drop(thunk);
        assert_eq!(ctx.arena().stats().live_regions(), 0);
    }

    #[test]
    fn test_dropped_handle_leaves_only_traps() {
        let ctx = ctx();
        let counter = Counter {
            base: 0,
            calls: Cell::new(0),
        };
        type AddFn = extern "win64" fn(i64, i64) -> i64;

        let thunk = Thunk::<AddFn, _>::new(&ctx, &counter, Counter::add).unwrap();
        let addr = thunk.code_address();
        let len = thunk.as_raw().layout().code().len();
        drop(thunk);

        // The page stays mapped in the arena, writable and scrubbed.
        let code = unsafe { std::slice::from_raw_parts(addr as *const u8, len) };
        assert!(code.iter().all(|&b| b == crate::arena::TRAP_FILL));
    }

    #[test]
    fn test_raw_rejects_aggregates_before_allocating() {
        let ctx = ctx();
        let sig = Signature::new([ArgClass::Aggregate { size: 32 }], RetClass::Void);
        let err = unsafe { RawThunk::new(&ctx, std::ptr::null(), std::ptr::null(), &sig) }
            .unwrap_err();
        assert!(matches!(err, ThunkError::UnsupportedSignature(_)));
        assert!(!ctx.arena().is_initialized());
    }

    #[test]
    fn test_closures_share_layout() {
        let ctx = ctx();
        let a = Counter {
            base: 1,
            calls: Cell::new(0),
        };
        let b = Counter {
            base: 2,
            calls: Cell::new(0),
        };
        type AddFn = extern "win64" fn(i64, i64) -> i64;

        let ta = Thunk::<AddFn, _>::new(&ctx, &a, Counter::add).unwrap();
        let tb = Thunk::<AddFn, _>::new(&ctx, &b, Counter::add).unwrap();
        assert_ne!(ta.code_address(), tb.code_address());
        assert_eq!(ctx.layouts().len(), 1);
        assert_eq!((unsafe { ta.callback() })(0, 0), 1);
        assert_eq!((unsafe { tb.callback() })(0, 0), 2);
    }
}
