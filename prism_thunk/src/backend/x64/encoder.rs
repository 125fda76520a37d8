//! Byte encoders for the trampoline instruction set.
//!
//! Each `encode_*` function produces one complete instruction. Only the
//! forms trampolines use are covered: 64-bit register moves, stack stores,
//! `lea`, immediate loads, `rep movsq`, stack adjustment, indirect call,
//! `ret`, `int3` and scalar-double moves.
//!
//! ```text
//! [REX] opcode [ModR/M] [SIB] [disp8/disp32] [imm]
//! ```

use super::registers::{Gpr, Mem, Xmm};

/// Longest legal x86 instruction.
pub const MAX_INST_LEN: usize = 15;

const REX_BASE: u8 = 0x40;
const REX_W: u8 = 0x08;
const REX_R: u8 = 0x04;
const REX_B: u8 = 0x01;

const MOD_INDIRECT: u8 = 0b00;
const MOD_DISP8: u8 = 0b01;
const MOD_DISP32: u8 = 0b10;
const MOD_REG: u8 = 0b11;

/// `rm = 100` selects a SIB byte.
const RM_SIB: u8 = 0b100;
/// SIB with no index register.
const SIB_NO_INDEX: u8 = 0b100 << 3;

/// One encoded instruction.
#[derive(Clone, Copy)]
pub struct Encoded {
    bytes: [u8; MAX_INST_LEN],
    len: u8,
}

impl Encoded {
    const fn empty() -> Self {
        Encoded {
            bytes: [0; MAX_INST_LEN],
            len: 0,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn byte(mut self, b: u8) -> Self {
        debug_assert!((self.len as usize) < MAX_INST_LEN, "instruction too long");
        self.bytes[self.len as usize] = b;
        self.len += 1;
        self
    }

    fn bytes(self, bs: &[u8]) -> Self {
        bs.iter().fold(self, |enc, &b| enc.byte(b))
    }

    fn rex(self, rex: Option<u8>) -> Self {
        match rex {
            Some(rex) => self.byte(rex),
            None => self,
        }
    }

    /// ModR/M, SIB and displacement for `reg, [base + disp]`.
    fn mem(self, reg: u8, mem: Mem) -> Self {
        let base = mem.base;
        let mode = match i8::try_from(mem.disp) {
            Ok(0) if !base.base_needs_disp() => MOD_INDIRECT,
            Ok(_) => MOD_DISP8,
            Err(_) => MOD_DISP32,
        };
        let enc = if base.base_needs_sib() {
            self.byte(modrm(mode, reg, RM_SIB))
                .byte(SIB_NO_INDEX | base.low3())
        } else {
            self.byte(modrm(mode, reg, base.low3()))
        };
        match mode {
            MOD_DISP8 => enc.byte(mem.disp as i8 as u8),
            MOD_DISP32 => enc.bytes(&mem.disp.to_le_bytes()),
            _ => enc,
        }
    }
}

impl std::fmt::Debug for Encoded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Encoded({:02X?})", self.as_slice())
    }
}

#[inline]
const fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 0b111) << 3) | (rm & 0b111)
}

/// REX prefix, or `None` when every field would be zero.
#[inline]
const fn rex(w: bool, r: bool, b: bool) -> Option<u8> {
    let mut bits = 0;
    if w {
        bits |= REX_W;
    }
    if r {
        bits |= REX_R;
    }
    if b {
        bits |= REX_B;
    }
    if bits == 0 { None } else { Some(REX_BASE | bits) }
}

// =============================================================================
// Data movement
// =============================================================================

/// `mov dst, src` (64-bit, `89 /r`).
pub fn encode_mov_rr(dst: Gpr, src: Gpr) -> Encoded {
    Encoded::empty()
        .rex(rex(true, src.is_extended(), dst.is_extended()))
        .byte(0x89)
        .byte(modrm(MOD_REG, src.low3(), dst.low3()))
}

/// `mov [mem], src` (64-bit).
pub fn encode_mov_mr(mem: Mem, src: Gpr) -> Encoded {
    Encoded::empty()
        .rex(rex(true, src.is_extended(), mem.base.is_extended()))
        .byte(0x89)
        .mem(src.low3(), mem)
}

/// `mov dst, imm64` (`REX.W B8+r io`). The immediate is the final 8 bytes.
pub fn encode_mov_ri64(dst: Gpr, imm: u64) -> Encoded {
    Encoded::empty()
        .rex(rex(true, false, dst.is_extended()))
        .byte(0xB8 | dst.low3())
        .bytes(&imm.to_le_bytes())
}

/// `mov dst32, imm32`, zero-extending into the full register.
pub fn encode_mov_ri32(dst: Gpr, imm: u32) -> Encoded {
    Encoded::empty()
        .rex(rex(false, false, dst.is_extended()))
        .byte(0xB8 | dst.low3())
        .bytes(&imm.to_le_bytes())
}

/// `lea dst, [mem]`.
pub fn encode_lea(dst: Gpr, mem: Mem) -> Encoded {
    Encoded::empty()
        .rex(rex(true, dst.is_extended(), mem.base.is_extended()))
        .byte(0x8D)
        .mem(dst.low3(), mem)
}

/// `rep movsq`: copy RCX quadwords from [RSI] to [RDI], ascending.
pub fn encode_rep_movsq() -> Encoded {
    Encoded::empty().bytes(&[0xF3, REX_BASE | REX_W, 0xA5])
}

// =============================================================================
// Stack adjustment
// =============================================================================

/// Group-1 `op dst, imm` with the short imm8 form when it fits.
fn group1_ri(ext: u8, dst: Gpr, imm: i32) -> Encoded {
    let enc = Encoded::empty().rex(rex(true, false, dst.is_extended()));
    match i8::try_from(imm) {
        Ok(imm8) => enc
            .byte(0x83)
            .byte(modrm(MOD_REG, ext, dst.low3()))
            .byte(imm8 as u8),
        Err(_) => enc
            .byte(0x81)
            .byte(modrm(MOD_REG, ext, dst.low3()))
            .bytes(&imm.to_le_bytes()),
    }
}

/// `add dst, imm`.
pub fn encode_add_ri(dst: Gpr, imm: i32) -> Encoded {
    group1_ri(0, dst, imm)
}

/// `sub dst, imm`.
pub fn encode_sub_ri(dst: Gpr, imm: i32) -> Encoded {
    group1_ri(5, dst, imm)
}

// =============================================================================
// Control flow
// =============================================================================

/// `call target` (`FF /2`).
pub fn encode_call_r(target: Gpr) -> Encoded {
    Encoded::empty()
        .rex(rex(false, false, target.is_extended()))
        .byte(0xFF)
        .byte(modrm(MOD_REG, 2, target.low3()))
}

pub fn encode_ret() -> Encoded {
    Encoded::empty().byte(0xC3)
}

pub fn encode_int3() -> Encoded {
    Encoded::empty().byte(0xCC)
}

// =============================================================================
// Scalar double
// =============================================================================

/// `movsd dst, src` (`F2 0F 10 /r`).
pub fn encode_movsd_rr(dst: Xmm, src: Xmm) -> Encoded {
    Encoded::empty()
        .bytes(&[0xF2, 0x0F, 0x10])
        .byte(modrm(MOD_REG, dst.num(), src.num()))
}

/// `movsd [mem], src` (`F2 0F 11 /r`).
pub fn encode_movsd_mr(mem: Mem, src: Xmm) -> Encoded {
    Encoded::empty()
        .byte(0xF2)
        .rex(rex(false, false, mem.base.is_extended()))
        .bytes(&[0x0F, 0x11])
        .mem(src.num(), mem)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(enc: Encoded) -> Vec<u8> {
        enc.as_slice().to_vec()
    }

    #[test]
    fn test_rex_prefix() {
        assert_eq!(rex(false, false, false), None);
        assert_eq!(rex(true, false, false), Some(0x48));
        assert_eq!(rex(true, true, true), Some(0x4D));
        assert_eq!(rex(false, false, true), Some(0x41));
    }

    #[test]
    fn test_register_moves() {
        assert_eq!(bytes(encode_mov_rr(Gpr::R10, Gpr::Rcx)), [0x49, 0x89, 0xCA]);
        assert_eq!(bytes(encode_mov_rr(Gpr::Rdx, Gpr::R10)), [0x4C, 0x89, 0xD2]);
        assert_eq!(bytes(encode_mov_rr(Gpr::R9, Gpr::R8)), [0x4D, 0x89, 0xC1]);
        assert_eq!(bytes(encode_mov_rr(Gpr::R8, Gpr::Rdx)), [0x49, 0x89, 0xD0]);
        assert_eq!(bytes(encode_mov_rr(Gpr::R11, Gpr::Rsi)), [0x49, 0x89, 0xF3]);
        assert_eq!(bytes(encode_mov_rr(Gpr::Rdi, Gpr::Rax)), [0x48, 0x89, 0xC7]);
    }

    #[test]
    fn test_immediate_loads() {
        let enc = bytes(encode_mov_ri64(Gpr::Rcx, 0x0102_0304_0506_0708));
        assert_eq!(enc[..2], [0x48, 0xB9]);
        assert_eq!(enc[2..], 0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(bytes(encode_mov_ri64(Gpr::R11, 0))[..2], [0x49, 0xBB]);

        assert_eq!(bytes(encode_mov_ri32(Gpr::Rcx, 4)), [0xB9, 4, 0, 0, 0]);
        assert_eq!(bytes(encode_mov_ri32(Gpr::R9, 1))[..2], [0x41, 0xB9]);
    }

    #[test]
    fn test_stack_operands() {
        // mov [rsp + 32], r9
        assert_eq!(
            bytes(encode_mov_mr(Mem::stack(32), Gpr::R9)),
            [0x4C, 0x89, 0x4C, 0x24, 0x20]
        );
        // mov [rsp], rax
        assert_eq!(bytes(encode_mov_mr(Mem::stack(0), Gpr::Rax)), [0x48, 0x89, 0x04, 0x24]);
        // lea rdi, [rsp + 40]
        assert_eq!(
            bytes(encode_lea(Gpr::Rdi, Mem::stack(40))),
            [0x48, 0x8D, 0x7C, 0x24, 0x28]
        );
        // lea rsi, [rsp + 0x200]
        assert_eq!(
            bytes(encode_lea(Gpr::Rsi, Mem::stack(0x200))),
            [0x48, 0x8D, 0xB4, 0x24, 0x00, 0x02, 0x00, 0x00]
        );
    }

    #[test]
    fn test_non_stack_bases() {
        // mov [rbp], rax: RBP always carries a displacement.
        assert_eq!(
            bytes(encode_mov_mr(Mem::at(Gpr::Rbp, 0), Gpr::Rax)),
            [0x48, 0x89, 0x45, 0x00]
        );
        // mov [r12 - 8], rdx: R12 needs SIB like RSP.
        assert_eq!(
            bytes(encode_mov_mr(Mem::at(Gpr::R12, -8), Gpr::Rdx)),
            [0x49, 0x89, 0x54, 0x24, 0xF8]
        );
    }

    #[test]
    fn test_stack_adjust() {
        assert_eq!(bytes(encode_sub_ri(Gpr::Rsp, 40)), [0x48, 0x83, 0xEC, 0x28]);
        assert_eq!(bytes(encode_add_ri(Gpr::Rsp, 40)), [0x48, 0x83, 0xC4, 0x28]);
        assert_eq!(
            bytes(encode_sub_ri(Gpr::Rsp, 0x1008)),
            [0x48, 0x81, 0xEC, 0x08, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn test_control_flow() {
        assert_eq!(bytes(encode_call_r(Gpr::Rax)), [0xFF, 0xD0]);
        assert_eq!(bytes(encode_call_r(Gpr::R11)), [0x41, 0xFF, 0xD3]);
        assert_eq!(bytes(encode_ret()), [0xC3]);
        assert_eq!(bytes(encode_int3()), [0xCC]);
        assert_eq!(bytes(encode_rep_movsq()), [0xF3, 0x48, 0xA5]);
    }

    #[test]
    fn test_movsd() {
        assert_eq!(bytes(encode_movsd_rr(Xmm::Xmm1, Xmm::Xmm0)), [0xF2, 0x0F, 0x10, 0xC8]);
        assert_eq!(bytes(encode_movsd_rr(Xmm::Xmm3, Xmm::Xmm2)), [0xF2, 0x0F, 0x10, 0xDA]);
        assert_eq!(
            bytes(encode_movsd_mr(Mem::stack(32), Xmm::Xmm3)),
            [0xF2, 0x0F, 0x11, 0x5C, 0x24, 0x20]
        );
    }
}
