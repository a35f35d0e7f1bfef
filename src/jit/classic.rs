//! Instruction selection for the classic accumulator form.
//!
//! Classic programs compute in 32-bit values: accumulator `A`, index
//! `X`, and sixteen scratch cells. Packet fetches go through the
//! embedder's out-of-line helpers; a failed fetch ends the program with
//! result 0.

use log::trace;

use super::emitter::{is_range16, Emitter, Offsets};
use super::frame::{classic_regs as regs, ClassicFlags};
use super::mips::{self, Reg};
use crate::error::CompileError;
use crate::program::{op, ClassicInsn, RuntimeHooks, ANCILLARY_BASE, CTX_LEN_OFFSET, SCRATCH_WORDS};

pub(crate) struct ClassicContext<'p> {
    prog: &'p [ClassicInsn],
    hooks: &'p RuntimeHooks,
    pub em: Emitter,
    pub flags: ClassicFlags,
    pub offs: Offsets,
}

impl<'p> ClassicContext<'p> {
    pub fn measure(prog: &'p [ClassicInsn], hooks: &'p RuntimeHooks) -> Self {
        Self {
            prog,
            hooks,
            em: Emitter::measuring(),
            flags: ClassicFlags::empty(),
            offs: Offsets::new(prog.len()),
        }
    }

    pub fn emit(
        prog: &'p [ClassicInsn],
        hooks: &'p RuntimeHooks,
        offs: Offsets,
        capacity_words: usize,
    ) -> Self {
        Self {
            prog,
            hooks,
            em: Emitter::writing(capacity_words),
            flags: ClassicFlags::empty(),
            offs,
        }
    }

    fn exit_slot(&self) -> usize {
        self.prog.len()
    }

    // ==================== Wide-immediate ALU fallbacks ====================

    fn addiu_k(&mut self, dst: Reg, src: Reg, imm: i32) {
        if is_range16(imm) {
            self.em.put(mips::addiu(dst, src, imm as i16));
        } else {
            self.em.load_imm(regs::TMP2, imm);
            self.em.put(mips::addu(dst, regs::TMP2, src));
        }
    }

    fn andi_k(&mut self, dst: Reg, src: Reg, k: u32) {
        if k <= 0xffff {
            self.em.put(mips::andi(dst, src, k as u16));
        } else {
            self.em.load_imm(regs::TMP2, k as i32);
            self.em.put(mips::and(dst, src, regs::TMP2));
        }
    }

    fn ori_k(&mut self, dst: Reg, src: Reg, k: u32) {
        if k <= 0xffff {
            self.em.put(mips::ori(dst, src, k as u16));
        } else {
            self.em.load_imm(regs::TMP2, k as i32);
            self.em.put(mips::or(dst, src, regs::TMP2));
        }
    }

    fn xori_k(&mut self, dst: Reg, src: Reg, k: u32) {
        if k <= 0xffff {
            self.em.put(mips::xori(dst, src, k as u16));
        } else {
            self.em.load_imm(regs::TMP2, k as i32);
            self.em.put(mips::xor(dst, src, regs::TMP2));
        }
    }

    fn sltiu_k(&mut self, dst: Reg, src: Reg, k: u32) {
        if is_range16(k as i32) {
            self.em.put(mips::sltiu(dst, src, k as i16));
        } else {
            self.em.load_imm(regs::TMP2, k as i32);
            self.em.put(mips::sltu(dst, src, regs::TMP2));
        }
    }

    // ==================== Shared sequences ====================

    fn divu32(&mut self, dst: Reg, src: Reg) {
        self.em.put(mips::divu(dst, src));
        self.em.put(mips::mflo(dst));
    }

    fn modu32(&mut self, dst: Reg, src: Reg) {
        self.em.put(mips::divu(dst, src));
        self.em.put(mips::mfhi(dst));
    }

    /// Branch to the error exit with result 0.
    fn error_exit(&mut self) -> Result<(), CompileError> {
        let b = self.offs.branch_off(&self.em, self.exit_slot())?;
        self.em.put(mips::b(b));
        self.em.move32(regs::RET, mips::ZERO); // delay slot
        Ok(())
    }

    /// Call a packet helper: address in `TMP1`, context in `$a0` via the
    /// delay slot, offset already placed in `$a1` by the caller.
    fn call_helper(&mut self, addr: u64) {
        self.flags |= ClassicFlags::SEEN_CALL | ClassicFlags::SEEN_CTX;
        self.em.load_const64(regs::TMP1, addr);
        self.em.put(mips::jalr(mips::RA, regs::TMP1));
        self.em.move32(mips::A0, regs::CTX); // delay slot
    }

    fn scratch_off(&self, i: usize, k: u32) -> Result<i16, CompileError> {
        if (k as usize) < SCRATCH_WORDS {
            Ok(4 * k as i16)
        } else {
            Err(CompileError::MalformedInput {
                index: i,
                reason: "scratch cell index out of range",
            })
        }
    }

    fn jump_slot(&self, i: usize, delta: u32) -> Result<usize, CompileError> {
        let slot = i as u64 + 1 + delta as u64;
        if slot <= self.prog.len() as u64 {
            Ok(slot as usize)
        } else {
            Err(CompileError::MalformedInput {
                index: i,
                reason: "jump target out of range",
            })
        }
    }
}

#[derive(Clone, Copy)]
enum CmpSrc {
    Imm(u32),
    X,
}

/// Translate the whole program body. During MEASURE this also records
/// the offset table and discovers the resource flags; during EMIT the
/// table is read-only.
pub(crate) fn build_classic_body(ctx: &mut ClassicContext) -> Result<(), CompileError> {
    let len = ctx.prog.len();
    for i in 0..len {
        if ctx.em.is_measuring() {
            ctx.offs.record(i, ctx.em.idx());
        } else {
            debug_assert_eq!(ctx.offs.get(i) + ctx.offs.prologue_len(), ctx.em.idx());
        }
        let insn = ctx.prog[i];
        trace!(
            "classic {:3}: code {:#06x} jt {} jf {} k {:#x}",
            i,
            insn.code,
            insn.jt,
            insn.jf,
            insn.k
        );
        build_one(ctx, i, insn)?;
    }
    if ctx.em.is_measuring() {
        ctx.offs.record(len, ctx.em.idx());
    }
    Ok(())
}

fn build_one(ctx: &mut ClassicContext, i: usize, insn: ClassicInsn) -> Result<(), CompileError> {
    let code = insn.code as u8;
    let k = insn.k;
    let last = i == ctx.prog.len() - 1;
    let unsupported = CompileError::UnsupportedOpcode {
        index: i,
        opcode: insn.code,
    };

    match (op::class(code), code & !0x07) {
        // ---- loads into A ----
        (op::LD, c) if c == op::IMM || c == op::W | op::IMM => {
            ctx.flags |= ClassicFlags::SEEN_A;
            ctx.em.load_imm(regs::A, k as i32);
        }
        (op::LD, c) if c == op::W | op::LEN => {
            ctx.flags |= ClassicFlags::SEEN_CTX | ClassicFlags::SEEN_A;
            ctx.em.put(mips::lw(regs::A, CTX_LEN_OFFSET, regs::CTX));
        }
        (op::LD, c) if c == op::MEM || c == op::W | op::MEM => {
            ctx.flags |= ClassicFlags::SEEN_MEM | ClassicFlags::SEEN_A;
            let off = ctx.scratch_off(i, k)?;
            ctx.em.put(mips::lw(regs::A, off, regs::M));
        }
        (op::LD, c)
            if c == op::W | op::ABS
                || c == op::H | op::ABS
                || c == op::B | op::ABS
                || c == op::W | op::IND
                || c == op::H | op::IND
                || c == op::B | op::IND =>
        {
            let ind = op::mode(code) == op::IND;
            if !ind && (k as i32) < 0 && (k as i32) >= ANCILLARY_BASE {
                // ancillary loads peek at embedder internals that do not
                // exist at this boundary
                return Err(unsupported);
            }
            let helper = match op::size(code) {
                op::H => ctx.hooks.load_half,
                op::B => ctx.hooks.load_byte,
                _ => ctx.hooks.load_word,
            };
            ctx.flags |= ClassicFlags::SEEN_A;
            if ind {
                ctx.flags |= ClassicFlags::SEEN_X;
            }
            ctx.em.load_const64(regs::TMP1, helper);
            if ind {
                ctx.addiu_k(mips::A1, regs::X, k as i32);
            } else {
                ctx.em.load_imm(mips::A1, k as i32);
            }
            ctx.flags |= ClassicFlags::SEEN_CALL | ClassicFlags::SEEN_CTX;
            ctx.em.put(mips::jalr(mips::RA, regs::TMP1));
            ctx.em.move32(mips::A0, regs::CTX); // delay slot
            // status 0: take the value and continue
            let ok = ctx.offs.branch_off(&ctx.em, ctx.jump_slot(i, 0)?)?;
            ctx.em.put(mips::beq(mips::V0, mips::ZERO, ok));
            ctx.em.move32(regs::A, mips::V1); // delay slot
            ctx.error_exit()?;
        }

        // ---- loads into X ----
        (op::LDX, c) if c == op::IMM || c == op::W | op::IMM => {
            ctx.flags |= ClassicFlags::SEEN_X;
            ctx.em.load_imm(regs::X, k as i32);
        }
        (op::LDX, c) if c == op::MEM || c == op::W | op::MEM => {
            ctx.flags |= ClassicFlags::SEEN_X | ClassicFlags::SEEN_MEM;
            let off = ctx.scratch_off(i, k)?;
            ctx.em.put(mips::lw(regs::X, off, regs::M));
        }
        (op::LDX, c) if c == op::W | op::LEN => {
            ctx.flags |= ClassicFlags::SEEN_X | ClassicFlags::SEEN_CTX;
            ctx.em.put(mips::lw(regs::X, CTX_LEN_OFFSET, regs::CTX));
        }
        (op::LDX, c) if c == op::B | op::MSH => {
            // X <- 4 * (P[k:1] & 0xf)
            ctx.flags |= ClassicFlags::SEEN_X | ClassicFlags::SEEN_A;
            ctx.em.load_const64(regs::TMP1, ctx.hooks.load_byte);
            ctx.em.load_imm(mips::A1, k as i32);
            ctx.flags |= ClassicFlags::SEEN_CALL | ClassicFlags::SEEN_CTX;
            ctx.em.put(mips::jalr(mips::RA, regs::TMP1));
            ctx.em.move32(mips::A0, regs::CTX); // delay slot
            let err = ctx.offs.branch_off(&ctx.em, ctx.exit_slot())?;
            ctx.em.put(mips::bne(mips::V0, mips::ZERO, err));
            ctx.em.move32(regs::RET, mips::ZERO); // delay slot
            ctx.em.put(mips::andi(regs::TMP2, mips::V1, 0xf));
            ctx.em.put(mips::sll(regs::X, regs::TMP2, 2));
        }

        // ---- scratch stores ----
        (op::ST, _) => {
            ctx.flags |= ClassicFlags::SEEN_MEM | ClassicFlags::SEEN_A;
            let off = ctx.scratch_off(i, k)?;
            ctx.em.put(mips::sw(regs::A, off, regs::M));
        }
        (op::STX, _) => {
            ctx.flags |= ClassicFlags::SEEN_MEM | ClassicFlags::SEEN_X;
            let off = ctx.scratch_off(i, k)?;
            ctx.em.put(mips::sw(regs::X, off, regs::M));
        }

        // ---- arithmetic ----
        (op::ALU, c) => {
            ctx.flags |= ClassicFlags::SEEN_A;
            let use_x = op::src(code) != 0;
            if use_x {
                ctx.flags |= ClassicFlags::SEEN_X;
            }
            match op::alu_op(c) {
                op::ADD if use_x => ctx.em.put(mips::addu(regs::A, regs::A, regs::X)),
                op::ADD => ctx.addiu_k(regs::A, regs::A, k as i32),
                op::SUB if use_x => ctx.em.put(mips::subu(regs::A, regs::A, regs::X)),
                op::SUB => ctx.addiu_k(regs::A, regs::A, (k as i32).wrapping_neg()),
                op::MUL if use_x => ctx.em.put(mips::mul(regs::A, regs::A, regs::X)),
                op::MUL => {
                    ctx.em.load_imm(regs::TMP1, k as i32);
                    ctx.em.put(mips::mul(regs::A, regs::A, regs::TMP1));
                }
                op::DIV | op::MOD if use_x => {
                    let err = ctx.offs.branch_off(&ctx.em, ctx.exit_slot())?;
                    ctx.em.put(mips::beq(regs::X, mips::ZERO, err));
                    ctx.em.move32(regs::RET, mips::ZERO); // delay slot
                    if op::alu_op(c) == op::DIV {
                        ctx.divu32(regs::A, regs::X);
                    } else {
                        ctx.modu32(regs::A, regs::X);
                    }
                }
                op::DIV => {
                    if k == 0 {
                        ctx.error_exit()?;
                    } else if k == 1 {
                        // nop
                    } else if k.is_power_of_two() {
                        ctx.em.srl_safe(regs::A, regs::A, k.trailing_zeros());
                    } else {
                        ctx.em.load_imm(regs::TMP1, k as i32);
                        ctx.divu32(regs::A, regs::TMP1);
                    }
                }
                op::MOD => {
                    if k == 0 {
                        ctx.error_exit()?;
                    } else if k == 1 {
                        ctx.em.move32(regs::A, mips::ZERO);
                    } else {
                        ctx.em.load_imm(regs::TMP1, k as i32);
                        ctx.modu32(regs::A, regs::TMP1);
                    }
                }
                op::OR if use_x => ctx.em.put(mips::or(regs::A, regs::A, regs::X)),
                op::OR => ctx.ori_k(regs::A, regs::A, k),
                op::AND if use_x => ctx.em.put(mips::and(regs::A, regs::A, regs::X)),
                op::AND => ctx.andi_k(regs::A, regs::A, k),
                op::XOR if use_x => ctx.em.put(mips::xor(regs::A, regs::A, regs::X)),
                op::XOR => ctx.xori_k(regs::A, regs::A, k),
                op::LSH if use_x => ctx.em.put(mips::sllv(regs::A, regs::A, regs::X)),
                op::LSH => ctx.em.sll_safe(regs::A, regs::A, k),
                op::RSH if use_x => ctx.em.put(mips::srlv(regs::A, regs::A, regs::X)),
                op::RSH => ctx.em.srl_safe(regs::A, regs::A, k),
                op::NEG => ctx.em.put(mips::subu(regs::A, mips::ZERO, regs::A)),
                _ => return Err(unsupported),
            }
        }

        // ---- jumps ----
        (op::JMP, c) if c & 0xf0 == op::JA => {
            let b = ctx.offs.branch_off(&ctx.em, ctx.jump_slot(i, k)?)?;
            ctx.em.put(mips::b(b));
            ctx.em.put(mips::nop());
        }
        (op::JMP, c) => {
            let src = if op::src(code) != 0 {
                ctx.flags |= ClassicFlags::SEEN_X;
                CmpSrc::X
            } else {
                CmpSrc::Imm(k)
            };
            ctx.flags |= ClassicFlags::SEEN_A;
            let jt = ctx.jump_slot(i, insn.jt as u32)?;
            let jf = ctx.jump_slot(i, insn.jf as u32)?;
            match op::alu_op(c) {
                op::JGE | op::JGT => {
                    let greater_only = op::alu_op(c) == op::JGT;
                    match src {
                        CmpSrc::Imm(k) => ctx.sltiu_k(regs::TMP1, regs::A, k),
                        CmpSrc::X => ctx.em.put(mips::sltu(regs::TMP1, regs::A, regs::X)),
                    }
                    // below: false edge
                    let b = ctx.offs.branch_off(&ctx.em, jf)?;
                    ctx.em.put(mips::bne(regs::TMP1, mips::ZERO, b));
                    ctx.em.put(mips::nop());
                    if greater_only {
                        // equality also takes the false edge
                        match src {
                            CmpSrc::Imm(k) => ctx.em.load_imm(regs::TMP1, k as i32),
                            CmpSrc::X => ctx.em.move32(regs::TMP1, regs::X),
                        }
                        let b = ctx.offs.branch_off(&ctx.em, jf)?;
                        ctx.em.put(mips::beq(regs::A, regs::TMP1, b));
                        ctx.em.put(mips::nop());
                    }
                    let b = ctx.offs.branch_off(&ctx.em, jt)?;
                    ctx.em.put(mips::b(b));
                    ctx.em.put(mips::nop());
                }
                op::JEQ => {
                    let cmp = match src {
                        CmpSrc::Imm(k) => {
                            ctx.em.load_imm(regs::TMP1, k as i32);
                            regs::TMP1
                        }
                        CmpSrc::X => regs::X,
                    };
                    let b = ctx.offs.branch_off(&ctx.em, jt)?;
                    ctx.em.put(mips::beq(regs::A, cmp, b));
                    ctx.em.put(mips::nop());
                    let b = ctx.offs.branch_off(&ctx.em, jf)?;
                    ctx.em.put(mips::bne(regs::A, cmp, b));
                    ctx.em.put(mips::nop());
                }
                op::JSET => {
                    match src {
                        CmpSrc::Imm(k) => {
                            ctx.em.load_imm(regs::TMP2, k as i32);
                            ctx.em.put(mips::and(regs::TMP1, regs::A, regs::TMP2));
                        }
                        CmpSrc::X => ctx.em.put(mips::and(regs::TMP1, regs::A, regs::X)),
                    }
                    let b = ctx.offs.branch_off(&ctx.em, jt)?;
                    ctx.em.put(mips::bne(regs::TMP1, mips::ZERO, b));
                    ctx.em.put(mips::nop());
                    let b = ctx.offs.branch_off(&ctx.em, jf)?;
                    ctx.em.put(mips::b(b));
                    ctx.em.put(mips::nop());
                }
                _ => return Err(unsupported),
            }
        }

        // ---- returns ----
        (op::RET, c) if c & 0x18 == op::RET_A => {
            ctx.flags |= ClassicFlags::SEEN_A;
            if !last {
                let b = ctx.offs.branch_off(&ctx.em, ctx.exit_slot())?;
                ctx.em.put(mips::b(b));
            }
            ctx.em.move32(regs::RET, regs::A); // delay slot when branching
        }
        (op::RET, _) => {
            // may take two instructions, so it cannot ride a delay slot
            ctx.em.load_imm(regs::RET, k as i32);
            if !last {
                let b = ctx.offs.branch_off(&ctx.em, ctx.exit_slot())?;
                ctx.em.put(mips::b(b));
                ctx.em.put(mips::nop());
            }
        }

        // ---- register transfers ----
        (op::MISC, c) if c & 0x80 == op::TAX => {
            ctx.flags |= ClassicFlags::SEEN_X | ClassicFlags::SEEN_A;
            ctx.em.move32(regs::X, regs::A);
        }
        (op::MISC, _) => {
            ctx.flags |= ClassicFlags::SEEN_A | ClassicFlags::SEEN_X;
            ctx.em.move32(regs::A, regs::X);
        }

        _ => return Err(unsupported),
    }
    Ok(())
}
