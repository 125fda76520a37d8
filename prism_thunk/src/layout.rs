//! Trampoline layouts.
//!
//! A trampoline turns a call `plain(a0, .., an-1)` into
//! `method(instance, a0, .., an-1)`: every argument moves one slot to the
//! right, the instance pointer takes slot 0, and the method is called with a
//! fresh Win64 frame. The code only depends on the argument count and on the
//! register class of each slot, so one [`TrampolineLayout`] is assembled per
//! [`Shape`] and stamped with a concrete (instance, target) pair for every
//! closure.
//!
//! # Generated code
//! ```text
//! mov   r10, rcx                  ; slot 0 is integer class
//! sub   rsp, FRAME                ; FRAME ≡ 8 (mod 16)
//! mov   r11, rsi                  ; n > 4: shift stack arguments down
//! mov   rax, rdi
//! lea   rsi, [rsp + FRAME + 40]
//! lea   rdi, [rsp + 40]
//! mov   ecx, n - 4
//! rep movsq
//! mov   rsi, r11
//! mov   rdi, rax
//! mov   [rsp + 32], r9 / xmm3     ; n >= 4: slot 3 spills
//! mov   r9, r8 / movsd xmm3, xmm2 ; slots 2, 1, 0 shift right
//! ...
//! mov   rcx, INSTANCE
//! mov   rax, TARGET
//! call  rax
//! add   rsp, FRAME
//! ret
//! int3 ...
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::backend::x64::{Assembler, Gpr, Mem, PatchSite, Win64};
use crate::config::ArenaConfig;
use crate::error::SignatureError;
use crate::signature::{Shape, Signature, SlotClass};

/// Alignment the trap padding rounds the code up to.
pub const CODE_ALIGNMENT: usize = 16;

/// Scratch register holding incoming slot 0 while RCX is reused.
const SAVED_SLOT0: Gpr = Gpr::R10;

/// Assembled trampoline template for one signature shape.
#[derive(Debug, Clone)]
pub struct TrampolineLayout {
    shape: Shape,
    code: Vec<u8>,
    logical_len: usize,
    frame_size: i32,
    stack_words: usize,
    instance_offset: usize,
    target_offset: usize,
}

impl TrampolineLayout {
    /// Assemble the layout for `sig` with the default trap padding.
    pub fn build(sig: &Signature) -> Result<Self, SignatureError> {
        Ok(Self::for_shape(sig.shape()?, ArenaConfig::DEFAULT_GUARD_BYTES))
    }

    /// Assemble the layout for an already validated shape.
    pub fn for_shape(shape: Shape, guard_bytes: usize) -> Self {
        let slots = shape.slots();
        let n = slots.len();
        let frame = frame_size(n);
        let stack_words = n.saturating_sub(Win64::REGISTER_SLOTS);

        let mut asm = Assembler::new();

        if slots.first() == Some(&SlotClass::Int) {
            asm.mov_rr(SAVED_SLOT0, Gpr::Rcx);
        }

        asm.sub_ri(Gpr::Rsp, frame);

        if stack_words > 0 {
            // Incoming stack argument k sits at [rsp + frame + 8 + 32 + 8k];
            // as outgoing argument k + 1 it belongs at [rsp + 32 + 8(k + 1)].
            asm.mov_rr(Gpr::R11, Gpr::Rsi);
            asm.mov_rr(Gpr::Rax, Gpr::Rdi);
            asm.lea(Gpr::Rsi, Mem::stack(frame + Win64::incoming_stack_slot(0)));
            asm.lea(Gpr::Rdi, Mem::stack(Win64::outgoing_stack_slot(1)));
            asm.mov_ri32(Gpr::Rcx, stack_words as u32);
            asm.rep_movsq();
            asm.mov_rr(Gpr::Rsi, Gpr::R11);
            asm.mov_rr(Gpr::Rdi, Gpr::Rax);
        }

        if n >= Win64::REGISTER_SLOTS {
            let spill = Mem::stack(Win64::outgoing_stack_slot(0));
            match slots[3] {
                SlotClass::Int => asm.mov_mr(spill, Win64::INT_ARG_REGS[3]),
                SlotClass::Float => asm.movsd_mr(spill, Win64::FLOAT_ARG_REGS[3]),
            }
        }

        for k in (0..n.min(Win64::REGISTER_SLOTS - 1)).rev() {
            match slots[k] {
                SlotClass::Int => {
                    let src = if k == 0 {
                        SAVED_SLOT0
                    } else {
                        Win64::INT_ARG_REGS[k]
                    };
                    asm.mov_rr(Win64::INT_ARG_REGS[k + 1], src);
                }
                SlotClass::Float => {
                    asm.movsd_rr(Win64::FLOAT_ARG_REGS[k + 1], Win64::FLOAT_ARG_REGS[k]);
                }
            }
        }

        asm.mov_patch(Win64::INT_ARG_REGS[0], PatchSite::Instance);
        asm.mov_patch(Gpr::Rax, PatchSite::Target);
        asm.call_r(Gpr::Rax);
        asm.add_ri(Gpr::Rsp, frame);
        asm.ret();
        asm.pad_with_traps(guard_bytes, CODE_ALIGNMENT);

        let out = asm.finish();
        let instance_offset = out
            .patch_offset(PatchSite::Instance)
            .unwrap_or_else(|| unreachable!("instance patch site always emitted"));
        let target_offset = out
            .patch_offset(PatchSite::Target)
            .unwrap_or_else(|| unreachable!("target patch site always emitted"));

        Self {
            shape,
            logical_len: out.logical_len,
            code: out.code,
            frame_size: frame,
            stack_words,
            instance_offset,
            target_offset,
        }
    }

    /// Shape this layout was built for.
    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Template bytes, trap padding included; patch sites are zero.
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Length of the executable part, before trap padding.
    #[inline]
    pub fn logical_len(&self) -> usize {
        self.logical_len
    }

    /// Bytes the trampoline subtracts from RSP.
    #[inline]
    pub fn frame_size(&self) -> i32 {
        self.frame_size
    }

    /// Machine words copied from the caller's stack arguments.
    #[inline]
    pub fn stack_words(&self) -> usize {
        self.stack_words
    }

    /// Offset of a patch site's 8-byte immediate in [`Self::code`].
    #[inline]
    pub fn patch_offset(&self, site: PatchSite) -> usize {
        match site {
            PatchSite::Instance => self.instance_offset,
            PatchSite::Target => self.target_offset,
        }
    }

    /// Template bytes with both patch sites filled in.
    pub fn instantiate(&self, instance: *const (), target: *const u8) -> Vec<u8> {
        let mut code = self.code.clone();
        let mut patch = |site, value: u64| {
            let at = self.patch_offset(site);
            code[at..at + 8].copy_from_slice(&value.to_le_bytes());
        };
        patch(PatchSite::Instance, instance as usize as u64);
        patch(PatchSite::Target, target as usize as u64);
        code
    }
}

/// Frame size for a trampoline forwarding `arity` arguments.
///
/// Covers the shadow space and the outgoing stack arguments of the
/// `arity + 1`-argument call, keeping RSP 16-byte aligned at the call.
pub fn frame_size(arity: usize) -> i32 {
    let outgoing_stack = (arity + 1).saturating_sub(Win64::REGISTER_SLOTS) as i32;
    let raw = Win64::SHADOW_SPACE + Win64::SLOT_SIZE * outgoing_stack;
    // The return address leaves RSP at 8 mod 16 on entry.
    let align = Win64::STACK_ALIGNMENT;
    ((raw + 8 + align - 1) & !(align - 1)) - 8
}

// =============================================================================
// Layout Cache
// =============================================================================

/// Layouts shared across closures of the same shape.
#[derive(Debug)]
pub struct LayoutCache {
    guard_bytes: usize,
    layouts: RwLock<FxHashMap<Shape, Arc<TrampolineLayout>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LayoutCache {
    /// Create an empty cache whose layouts carry `guard_bytes` of trap padding.
    pub fn new(guard_bytes: usize) -> Self {
        Self {
            guard_bytes,
            layouts: RwLock::new(FxHashMap::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fetch the layout for `sig`, assembling it on first use.
    pub fn get_or_build(&self, sig: &Signature) -> Result<Arc<TrampolineLayout>, SignatureError> {
        let shape = sig.shape()?;

        if let Some(layout) = self.layouts.read().get(&shape) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(layout));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let layout = Arc::new(TrampolineLayout::for_shape(shape.clone(), self.guard_bytes));
        trace!(
            target: "prism_thunk::layout",
            shape = %shape,
            len = layout.code().len(),
            frame = layout.frame_size(),
            "layout assembled"
        );

        // Another thread may have raced us here; keep whichever landed first.
        let mut layouts = self.layouts.write();
        Ok(Arc::clone(layouts.entry(shape).or_insert(layout)))
    }

    /// Number of cached shapes.
    pub fn len(&self) -> usize {
        self.layouts.read().len()
    }

    /// Check if no layout has been built yet.
    pub fn is_empty(&self) -> bool {
        self.layouts.read().is_empty()
    }

    /// Lookups served from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that had to assemble a layout.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for LayoutCache {
    fn default() -> Self {
        Self::new(ArenaConfig::DEFAULT_GUARD_BYTES)
    }
}

// =============================================================================
// Tests
// =============================================================================
