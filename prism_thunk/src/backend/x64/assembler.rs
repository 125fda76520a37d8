//! Symbolic x64 assembler for trampoline emission.
//!
//! Instructions are recorded as [`Inst`] values and only resolved to bytes in
//! [`Assembler::finish`]. Immediates that are not known while the layout is
//! built (the bound instance and the call target) are emitted as named
//! [`PatchSite`]s; `finish` reports the byte offset of each one so the
//! layout can be stamped per closure without re-assembling.

use super::encoder::{
    Encoded, encode_add_ri, encode_call_r, encode_int3, encode_lea, encode_mov_mr,
    encode_mov_ri32, encode_mov_ri64, encode_mov_rr, encode_movsd_mr, encode_movsd_rr,
    encode_rep_movsq, encode_ret, encode_sub_ri,
};
use super::registers::{Gpr, Mem, Xmm};

/// A 64-bit immediate whose value is written after assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchSite {
    /// The bound instance pointer, passed as the new argument 0.
    Instance,
    /// Address of the bound method.
    Target,
}

impl PatchSite {
    /// All patch sites a trampoline carries.
    pub const ALL: [PatchSite; 2] = [PatchSite::Instance, PatchSite::Target];

    #[inline]
    const fn index(self) -> usize {
        match self {
            PatchSite::Instance => 0,
            PatchSite::Target => 1,
        }
    }
}

/// One symbolic instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inst {
    MovRR { dst: Gpr, src: Gpr },
    MovMR { mem: Mem, src: Gpr },
    MovRI32 { dst: Gpr, imm: u32 },
    MovPatch { dst: Gpr, site: PatchSite },
    Lea { dst: Gpr, mem: Mem },
    AddRI { dst: Gpr, imm: i32 },
    SubRI { dst: Gpr, imm: i32 },
    RepMovsq,
    MovsdRR { dst: Xmm, src: Xmm },
    MovsdMR { mem: Mem, src: Xmm },
    CallR(Gpr),
    Ret,
}

impl Inst {
    fn encode(self) -> Encoded {
        match self {
            Inst::MovRR { dst, src } => encode_mov_rr(dst, src),
            Inst::MovMR { mem, src } => encode_mov_mr(mem, src),
            Inst::MovRI32 { dst, imm } => encode_mov_ri32(dst, imm),
            Inst::MovPatch { dst, .. } => encode_mov_ri64(dst, 0),
            Inst::Lea { dst, mem } => encode_lea(dst, mem),
            Inst::AddRI { dst, imm } => encode_add_ri(dst, imm),
            Inst::SubRI { dst, imm } => encode_sub_ri(dst, imm),
            Inst::RepMovsq => encode_rep_movsq(),
            Inst::MovsdRR { dst, src } => encode_movsd_rr(dst, src),
            Inst::MovsdMR { mem, src } => encode_movsd_mr(mem, src),
            Inst::CallR(target) => encode_call_r(target),
            Inst::Ret => encode_ret(),
        }
    }
}

/// Output of [`Assembler::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    /// Encoded bytes; patch-site immediates are zero.
    pub code: Vec<u8>,
    /// Offset of each patch site's 8-byte immediate, indexed by site.
    patches: [Option<usize>; 2],
    /// Length of the code before trap padding.
    pub logical_len: usize,
}

impl Assembled {
    /// Byte offset of a patch site's immediate, if the code uses it.
    #[inline]
    pub fn patch_offset(&self, site: PatchSite) -> Option<usize> {
        self.patches[site.index()]
    }
}

/// Instruction recorder for trampoline code.
#[derive(Debug)]
pub struct Assembler {
    insts: Vec<Inst>,
    trap_padding: usize,
    align: usize,
}

impl Assembler {
    /// Create a new assembler.
    pub fn new() -> Self {
        Self {
            insts: Vec::new(),
            trap_padding: 0,
            align: 1,
        }
    }

    /// Record an instruction.
    #[inline]
    pub fn emit(&mut self, inst: Inst) {
        self.insts.push(inst);
    }

    /// Recorded instructions, in emission order.
    #[inline]
    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    pub fn mov_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit(Inst::MovRR { dst, src });
    }

    pub fn mov_mr(&mut self, mem: Mem, src: Gpr) {
        self.emit(Inst::MovMR { mem, src });
    }

    pub fn mov_ri32(&mut self, dst: Gpr, imm: u32) {
        self.emit(Inst::MovRI32 { dst, imm });
    }

    /// `mov dst, imm64` whose immediate is filled in later.
    pub fn mov_patch(&mut self, dst: Gpr, site: PatchSite) {
        self.emit(Inst::MovPatch { dst, site });
    }

    pub fn lea(&mut self, dst: Gpr, mem: Mem) {
        self.emit(Inst::Lea { dst, mem });
    }

    pub fn add_ri(&mut self, dst: Gpr, imm: i32) {
        self.emit(Inst::AddRI { dst, imm });
    }

    pub fn sub_ri(&mut self, dst: Gpr, imm: i32) {
        self.emit(Inst::SubRI { dst, imm });
    }

    pub fn rep_movsq(&mut self) {
        self.emit(Inst::RepMovsq);
    }

    pub fn movsd_rr(&mut self, dst: Xmm, src: Xmm) {
        self.emit(Inst::MovsdRR { dst, src });
    }

    pub fn movsd_mr(&mut self, mem: Mem, src: Xmm) {
        self.emit(Inst::MovsdMR { mem, src });
    }

    pub fn call_r(&mut self, target: Gpr) {
        self.emit(Inst::CallR(target));
    }

    pub fn ret(&mut self) {
        self.emit(Inst::Ret);
    }

    /// Request at least `min_traps` INT3 bytes after the last instruction,
    /// extended until the total length is a multiple of `align`.
    pub fn pad_with_traps(&mut self, min_traps: usize, align: usize) {
        debug_assert!(align.is_power_of_two());
        self.trap_padding = min_traps;
        self.align = align;
    }

    /// Resolve all instructions to bytes.
    ///
    /// # Panics
    /// Panics if the same patch site is emitted twice.
    pub fn finish(self) -> Assembled {
        let mut code = Vec::with_capacity(self.insts.len() * 4 + self.trap_padding + self.align);
        let mut patches = [None; 2];

        for inst in &self.insts {
            let enc = inst.encode();
            if let Inst::MovPatch { site, .. } = *inst {
                let slot = &mut patches[site.index()];
                assert!(slot.is_none(), "patch site {site:?} emitted twice");
                // The imm64 form ends with the 8-byte immediate.
                *slot = Some(code.len() + enc.len() - 8);
            }
            code.extend_from_slice(enc.as_slice());
        }

        let logical_len = code.len();
        let trap = encode_int3();
        let mut padded = logical_len + self.trap_padding;
        padded = (padded + self.align - 1) & !(self.align - 1);
        while code.len() < padded {
            code.extend_from_slice(trap.as_slice());
        }

        Assembled {
            code,
            patches,
            logical_len,
        }
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_offsets_resolve_after_prefix() {
        let mut asm = Assembler::new();
        asm.mov_rr(Gpr::R10, Gpr::Rcx); // 3 bytes
        asm.mov_patch(Gpr::Rcx, PatchSite::Instance); // 10 bytes
        asm.mov_patch(Gpr::Rax, PatchSite::Target); // 10 bytes
        asm.call_r(Gpr::Rax);
        asm.ret();

        let out = asm.finish();
        assert_eq!(out.patch_offset(PatchSite::Instance), Some(5));
        assert_eq!(out.patch_offset(PatchSite::Target), Some(15));
        assert_eq!(out.logical_len, 3 + 10 + 10 + 2 + 1);
        assert_eq!(&out.code[3..5], &[0x48, 0xB9]);
        assert_eq!(&out.code[13..15], &[0x48, 0xB8]);
    }

    #[test]
    fn test_trap_padding() {
        let mut asm = Assembler::new();
        asm.ret();
        asm.pad_with_traps(8, 16);
        let out = asm.finish();

        assert_eq!(out.logical_len, 1);
        assert_eq!(out.code.len(), 16);
        assert!(out.code[1..].iter().all(|&b| b == 0xCC));
    }

    #[test]
    fn test_padding_spills_into_next_block() {
        let mut asm = Assembler::new();
        for _ in 0..10 {
            asm.ret();
        }
        asm.pad_with_traps(8, 16);
        let out = asm.finish();
        // 10 + 8 = 18, rounded to 32.
        assert_eq!(out.code.len(), 32);
    }

    #[test]
    fn test_missing_patch_site() {
        let mut asm = Assembler::new();
        asm.ret();
        let out = asm.finish();
        assert_eq!(out.patch_offset(PatchSite::Target), None);
    }

    #[test]
    #[should_panic(expected = "emitted twice")]
    fn test_duplicate_patch_site_panics() {
        let mut asm = Assembler::new();
        asm.mov_patch(Gpr::Rax, PatchSite::Target);
        asm.mov_patch(Gpr::Rdx, PatchSite::Target);
        let _ = asm.finish();
    }
}
