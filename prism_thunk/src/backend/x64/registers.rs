//! Registers and the Win64 argument window.
//!
//! Trampolines touch a small, fixed set of registers: the four argument
//! slots in both register files, a couple of scratch GPRs, RSP, and RSI/RDI
//! for the block copy. Everything here is `const` so layouts can be checked
//! at a glance against the convention tables.

use std::fmt;

// =============================================================================
// General-Purpose Registers
// =============================================================================

/// A 64-bit general-purpose register, numbered as in ModR/M + REX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

const GPR_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

impl Gpr {
    /// Register number, 0-15.
    #[inline(always)]
    pub const fn num(self) -> u8 {
        self as u8
    }

    /// The three bits that go into ModR/M or the opcode byte.
    #[inline(always)]
    pub const fn low3(self) -> u8 {
        self.num() & 0b111
    }

    /// R8-R15 need a REX extension bit.
    #[inline(always)]
    pub const fn is_extended(self) -> bool {
        self.num() & 0b1000 != 0
    }

    /// As a base, `rm = 100` is the SIB escape, so RSP and R12 need a SIB byte.
    #[inline(always)]
    pub const fn base_needs_sib(self) -> bool {
        self.low3() == 0b100
    }

    /// As a base with `mod = 00`, `rm = 101` means RIP-relative, so RBP and
    /// R13 always carry a displacement.
    #[inline(always)]
    pub const fn base_needs_disp(self) -> bool {
        self.low3() == 0b101
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(GPR_NAMES[self.num() as usize])
    }
}

// =============================================================================
// XMM Registers
// =============================================================================

/// SSE register. Only the low eight are reachable without REX, and the
/// Win64 window uses just XMM0-XMM3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Xmm {
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
}

impl Xmm {
    #[inline(always)]
    pub const fn num(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.num())
    }
}

// =============================================================================
// Win64 convention
// =============================================================================

/// Microsoft x64 calling convention, as seen by a trampoline.
///
/// Argument `i < 4` travels in `INT_ARG_REGS[i]` or `FLOAT_ARG_REGS[i]`
/// depending on its class; the other register of that slot is dead.
/// Argument `i >= 4` lives on the stack above the 32-byte home area:
///
/// ```text
/// at entry                      at the call site
/// [rsp]          return addr    [rsp .. rsp+32)  home area
/// [rsp+8 .. +40) home area      [rsp+32+8(i-4)]  argument i
/// [rsp+40+8(i-4)] argument i
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Win64;

/// Bitmask of RBX, RBP, RDI, RSI, RSP, R12-R15.
const NONVOLATILE_MASK: u16 = 0xF0F8;

impl Win64 {
    pub const INT_ARG_REGS: [Gpr; 4] = [Gpr::Rcx, Gpr::Rdx, Gpr::R8, Gpr::R9];
    pub const FLOAT_ARG_REGS: [Xmm; 4] = [Xmm::Xmm0, Xmm::Xmm1, Xmm::Xmm2, Xmm::Xmm3];

    /// Argument slots passed in registers.
    pub const REGISTER_SLOTS: usize = 4;
    pub const SLOT_SIZE: i32 = 8;
    /// Home area the caller reserves below the stack arguments.
    pub const SHADOW_SPACE: i32 = 32;
    /// RSP alignment required at every CALL.
    pub const STACK_ALIGNMENT: i32 = 16;

    /// Whether a callee must restore `reg` before returning.
    #[inline]
    pub const fn is_nonvolatile(reg: Gpr) -> bool {
        NONVOLATILE_MASK & (1 << reg.num()) != 0
    }

    /// `[rsp + n]` of stack argument `index` (argument `4 + index`) on entry.
    #[inline]
    pub const fn incoming_stack_slot(index: usize) -> i32 {
        Self::SLOT_SIZE + Self::SHADOW_SPACE + Self::SLOT_SIZE * index as i32
    }

    /// `[rsp + n]` of stack argument `index` just before a CALL.
    #[inline]
    pub const fn outgoing_stack_slot(index: usize) -> i32 {
        Self::SHADOW_SPACE + Self::SLOT_SIZE * index as i32
    }
}

// =============================================================================
// Memory operands
// =============================================================================

/// `[base + disp]`. Trampolines never need an index register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Gpr,
    pub disp: i32,
}

impl Mem {
    #[inline]
    pub const fn at(base: Gpr, disp: i32) -> Self {
        Mem { base, disp }
    }

    /// Stack-relative operand, the only kind the layouts emit.
    #[inline]
    pub const fn stack(disp: i32) -> Self {
        Mem::at(Gpr::Rsp, disp)
    }
}

// =============================================================================
// Tests
// =============================================================================
