//! Instruction selection for the extended register form.
//!
//! Extended programs see eleven 64-bit registers. The hardware mapping
//! puts the return value in `$v0`, arguments in `$a0..$a4`, and the
//! callee-saved `r6..r9` in `$s0..$s3`; `r10` is a virtual frame
//! pointer that only ever appears as `$sp` plus the local-area size.
//! `$at`, `$t8` and `$t9` are scratch, with `$t9` doubling as the call
//! target register per the o64 convention.
//!
//! The 64-bit ISA sign-extends 32-bit results, so 32-bit operations
//! consult the value-class table and insert `sll`/`dinsu` extensions
//! only where a register's class requires them.

use log::trace;

use super::emitter::{is_range16, Emitter, Offsets};
use super::frame::ExtFlags;
use super::mips::{self, Reg};
use super::tracker::{ValueClass, ValueTable};
use crate::error::CompileError;
use crate::program::{op, ExtInsn, RuntimeHooks, EXT_STACK_SIZE};

pub(crate) struct ExtContext<'p> {
    prog: &'p [ExtInsn],
    hooks: &'p RuntimeHooks,
    vals: &'p ValueTable,
    pub em: Emitter,
    pub flags: ExtFlags,
    pub offs: Offsets,
}

impl<'p> ExtContext<'p> {
    pub fn measure(prog: &'p [ExtInsn], hooks: &'p RuntimeHooks, vals: &'p ValueTable) -> Self {
        Self {
            prog,
            hooks,
            vals,
            em: Emitter::measuring(),
            flags: ExtFlags::empty(),
            offs: Offsets::new(prog.len()),
        }
    }

    pub fn emit(
        prog: &'p [ExtInsn],
        hooks: &'p RuntimeHooks,
        vals: &'p ValueTable,
        offs: Offsets,
        capacity_words: usize,
    ) -> Self {
        Self {
            prog,
            hooks,
            vals,
            em: Emitter::writing(capacity_words),
            flags: ExtFlags::empty(),
            offs,
        }
    }

    /// Map a program register to its hardware home. The frame pointer
    /// maps to `$sp` and is only legal where the caller folds the
    /// local-area size into the access.
    fn ext_reg(&mut self, i: usize, reg: u8, fp_ok: bool) -> Result<Reg, CompileError> {
        match reg {
            0 => Ok(mips::V0),
            1 => Ok(mips::A0),
            2 => Ok(mips::A1),
            3 => Ok(mips::A2),
            4 => Ok(mips::A3),
            5 => Ok(mips::A4),
            6..=9 => {
                let (flag, hw) = match reg {
                    6 => (ExtFlags::SAVE_S0, mips::S0),
                    7 => (ExtFlags::SAVE_S1, mips::S1),
                    8 => (ExtFlags::SAVE_S2, mips::S2),
                    _ => (ExtFlags::SAVE_S3, mips::S3),
                };
                self.flags |= flag;
                Ok(hw)
            }
            10 if fp_ok => {
                self.flags |= ExtFlags::SEEN_FP;
                Ok(mips::SP)
            }
            _ => Err(CompileError::MalformedInput {
                index: i,
                reason: "bad register",
            }),
        }
    }

    /// Base register and folded offset for a memory access.
    fn mem_access(&mut self, i: usize, reg: u8, off: i16) -> Result<(Reg, i16), CompileError> {
        let base = self.ext_reg(i, reg, true)?;
        let mut total = off as i32;
        if base == mips::SP {
            total += EXT_STACK_SIZE;
        }
        if is_range16(total) {
            Ok((base, total as i16))
        } else {
            Err(CompileError::MalformedInput {
                index: i,
                reason: "memory offset out of range",
            })
        }
    }

    /// Zero-extend a sign-extended 32-bit value into `tmp`.
    fn zext_into(&mut self, tmp: Reg, src: Reg) {
        self.em.move64(tmp, src);
        self.em.put(mips::dinsu(tmp, mips::ZERO, 32, 32));
    }

    /// Does the conditional at `i` jump over an immediately following
    /// exit? If so the pair fuses into a single inverted branch.
    fn fuses_exit(&self, i: usize, off: i16) -> bool {
        off == 1 && i + 1 < self.prog.len() && self.prog[i + 1].code == (op::JMP | op::EXIT)
    }

    fn epilogue_branch(&mut self) -> Result<i16, CompileError> {
        self.offs.branch_off(&self.em, self.offs.epilogue_slot())
    }

    fn jump_slot(&self, i: usize, off: i16) -> Result<usize, CompileError> {
        let slot = i as i64 + 1 + off as i64;
        if slot >= 0 && slot <= self.prog.len() as i64 {
            Ok(slot as usize)
        } else {
            Err(CompileError::MalformedInput {
                index: i,
                reason: "jump target out of range",
            })
        }
    }
}

/// Translate the program body. MEASURE records the offset table and
/// discovers the save flags; EMIT replays the identical selection with
/// the table frozen.
pub(crate) fn build_ext_body(ctx: &mut ExtContext) -> Result<(), CompileError> {
    let len = ctx.prog.len();
    let mut i = 0;
    while i < len {
        if ctx.em.is_measuring() {
            ctx.offs.record(i, ctx.em.idx());
        }
        if !ctx.vals.visited(i) {
            // dead code emits nothing; its offset aliases the next
            // live instruction
            i += 1;
            continue;
        }
        let insn = ctx.prog[i];
        trace!(
            "ext {:3}: code {:#04x} dst {} src {} off {} imm {:#x}",
            i,
            insn.code,
            insn.dst,
            insn.src,
            insn.off,
            insn.imm
        );
        let consumed = build_one(ctx, i, insn)?;
        if consumed == 2 && ctx.em.is_measuring() {
            ctx.offs.record(i + 1, ctx.em.idx());
        }
        i += consumed;
    }
    if ctx.em.is_measuring() {
        ctx.offs.record(len, ctx.em.idx());
        // Branches into an exit instruction land on the shared
        // epilogue instead.
        for (j, insn) in ctx.prog.iter().enumerate() {
            if insn.code == (op::JMP | op::EXIT) {
                ctx.offs.record(j, ctx.em.idx());
            }
        }
    }
    Ok(())
}

/// Translate one instruction, returning how many program slots it
/// consumed (2 for wide immediates and branch-over-exit fusion).
fn build_one(ctx: &mut ExtContext, i: usize, insn: ExtInsn) -> Result<usize, CompileError> {
    let code = insn.code;
    let unsupported = CompileError::UnsupportedOpcode {
        index: i,
        opcode: code as u16,
    };

    match op::class(code) {
        op::ALU64 if op::alu_op(code) == op::END => Err(unsupported),
        op::ALU64 | op::ALU if op::src(code) == 0 && op::alu_op(code) != op::END => {
            alu_imm(ctx, i, insn)?;
            Ok(1)
        }
        op::ALU if op::alu_op(code) == op::END => {
            byteswap(ctx, i, insn)?;
            Ok(1)
        }
        op::ALU64 | op::ALU => {
            alu_reg(ctx, i, insn)?;
            Ok(1)
        }
        op::JMP => jump(ctx, i, insn),
        op::LD => load(ctx, i, insn),
        op::LDX => {
            let dst = ctx.ext_reg(i, insn.dst, false)?;
            let (base, off) = ctx.mem_access(i, insn.src, insn.off)?;
            let word = match op::size(code) {
                op::B => mips::lbu(dst, off, base),
                op::H => mips::lhu(dst, off, base),
                op::W => mips::lw(dst, off, base),
                _ => mips::ld(dst, off, base),
            };
            ctx.em.put(word);
            Ok(1)
        }
        op::ST if op::mode(code) == op::MEM => {
            let (base, off) = ctx.mem_access(i, insn.dst, insn.off)?;
            let src = if insn.imm == 0 {
                mips::ZERO
            } else {
                ctx.em.load_imm(mips::AT, insn.imm);
                mips::AT
            };
            ctx.em.put(store_word(code, src, off, base));
            Ok(1)
        }
        op::STX if op::mode(code) == op::MEM => {
            let mut src = ctx.ext_reg(i, insn.src, false)?;
            let (base, off) = ctx.mem_access(i, insn.dst, insn.off)?;
            if op::size(code) == op::DW && ctx.vals.class(i, insn.src) == ValueClass::Narrow32 {
                // a 64-bit store must not leak the sign extension
                ctx.zext_into(mips::AT, src);
                src = mips::AT;
            }
            ctx.em.put(store_word(code, src, off, base));
            Ok(1)
        }
        op::STX if op::mode(code) == op::XADD => {
            atomic_add(ctx, i, insn)?;
            Ok(1)
        }
        _ => Err(unsupported),
    }
}

fn store_word(code: u8, src: Reg, off: i16, base: Reg) -> u32 {
    match op::size(code) {
        op::B => mips::sb(src, off, base),
        op::H => mips::sh(src, off, base),
        op::W => mips::sw(src, off, base),
        _ => mips::sd(src, off, base),
    }
}

/// ALU operation with an immediate operand, both widths.
fn alu_imm(ctx: &mut ExtContext, i: usize, insn: ExtInsn) -> Result<(), CompileError> {
    let is64 = op::class(insn.code) == op::ALU64;
    let bpf_op = op::alu_op(insn.code);
    let dst = ctx.ext_reg(i, insn.dst, false)?;
    let td = ctx.vals.class(i, insn.dst);
    let imm = insn.imm;

    // put dst into the canonical form the operation width expects
    if bpf_op != op::MOV {
        if is64 && td == ValueClass::Narrow32 {
            ctx.em.put(mips::dinsu(dst, mips::ZERO, 32, 32));
        }
        if !is64 && (td == ValueClass::Full64 || td == ValueClass::ZeroExt32) {
            ctx.em.put(mips::sll(dst, dst, 0));
        }
    }

    match bpf_op {
        op::MOV => ctx.em.load_imm(dst, imm),
        op::ADD => {
            if is_range16(imm) {
                let w = if is64 {
                    mips::daddiu(dst, dst, imm as i16)
                } else {
                    mips::addiu(dst, dst, imm as i16)
                };
                ctx.em.put(w);
            } else {
                ctx.em.load_imm(mips::AT, imm);
                let w = if is64 {
                    mips::daddu(dst, dst, mips::AT)
                } else {
                    mips::addu(dst, dst, mips::AT)
                };
                ctx.em.put(w);
            }
        }
        op::SUB => {
            let neg = -(imm as i64);
            if (-0x8000..0x8000).contains(&neg) {
                let w = if is64 {
                    mips::daddiu(dst, dst, neg as i16)
                } else {
                    mips::addiu(dst, dst, neg as i16)
                };
                ctx.em.put(w);
            } else {
                ctx.em.load_imm(mips::AT, imm);
                let w = if is64 {
                    mips::dsubu(dst, dst, mips::AT)
                } else {
                    mips::subu(dst, dst, mips::AT)
                };
                ctx.em.put(w);
            }
        }
        op::AND if (0..=0xffff).contains(&imm) => {
            ctx.em.put(mips::andi(dst, dst, imm as u16));
        }
        op::AND => {
            ctx.em.load_imm(mips::AT, imm);
            ctx.em.put(mips::and(dst, dst, mips::AT));
        }
        op::OR if (0..=0xffff).contains(&imm) => {
            ctx.em.put(mips::ori(dst, dst, imm as u16));
        }
        op::OR => {
            ctx.em.load_imm(mips::AT, imm);
            ctx.em.put(mips::or(dst, dst, mips::AT));
        }
        op::XOR if (0..=0xffff).contains(&imm) => {
            ctx.em.put(mips::xori(dst, dst, imm as u16));
        }
        op::XOR => {
            ctx.em.load_imm(mips::AT, imm);
            ctx.em.put(mips::xor(dst, dst, mips::AT));
        }
        op::LSH if is64 => ctx.em.dsll_imm(dst, dst, imm as u32 & 63),
        op::LSH => ctx.em.put(mips::sll(dst, dst, imm as u32 & 31)),
        op::RSH if is64 => ctx.em.dsrl_imm(dst, dst, imm as u32 & 63),
        op::RSH => ctx.em.put(mips::srl(dst, dst, imm as u32 & 31)),
        op::ARSH if is64 => ctx.em.dsra_imm(dst, dst, imm as u32 & 63),
        op::ARSH => ctx.em.put(mips::sra(dst, dst, imm as u32 & 31)),
        op::NEG => {
            let w = if is64 {
                mips::dsubu(dst, mips::ZERO, dst)
            } else {
                mips::subu(dst, mips::ZERO, dst)
            };
            ctx.em.put(w);
        }
        op::MUL => {
            ctx.em.load_imm(mips::AT, imm);
            if is64 {
                ctx.em.put(mips::dmultu(dst, mips::AT));
                ctx.em.put(mips::mflo(dst));
            } else {
                ctx.em.put(mips::mul(dst, dst, mips::AT));
            }
        }
        op::DIV | op::MOD => {
            if imm == 0 {
                return Err(CompileError::MalformedInput {
                    index: i,
                    reason: "constant division by zero",
                });
            }
            ctx.em.load_imm(mips::AT, imm);
            let w = if is64 {
                mips::ddivu(dst, mips::AT)
            } else {
                mips::divu(dst, mips::AT)
            };
            ctx.em.put(w);
            let w = if bpf_op == op::DIV {
                mips::mflo(dst)
            } else {
                mips::mfhi(dst)
            };
            ctx.em.put(w);
        }
        _ => {
            return Err(CompileError::UnsupportedOpcode {
                index: i,
                opcode: insn.code as u16,
            })
        }
    }
    Ok(())
}

/// ALU operation with a register operand, both widths.
fn alu_reg(ctx: &mut ExtContext, i: usize, insn: ExtInsn) -> Result<(), CompileError> {
    let is64 = op::class(insn.code) == op::ALU64;
    let bpf_op = op::alu_op(insn.code);
    let dst = ctx.ext_reg(i, insn.dst, false)?;
    let td = ctx.vals.class(i, insn.dst);

    // reading the frame pointer is only meaningful as a 64-bit move
    if insn.src == 10 {
        if is64 && bpf_op == op::MOV {
            ctx.flags |= ExtFlags::SEEN_FP;
            ctx.em
                .put(mips::daddiu(dst, mips::SP, EXT_STACK_SIZE as i16));
            return Ok(());
        }
        return Err(CompileError::MalformedInput {
            index: i,
            reason: "bad register",
        });
    }

    let mut src = ctx.ext_reg(i, insn.src, false)?;
    let ts = ctx.vals.class(i, insn.src);

    if bpf_op != op::MOV {
        if is64 && td == ValueClass::Narrow32 {
            ctx.em.put(mips::dinsu(dst, mips::ZERO, 32, 32));
        }
        if !is64 && (td == ValueClass::Full64 || td == ValueClass::ZeroExt32) {
            ctx.em.put(mips::sll(dst, dst, 0));
        }
    }

    // bring the source into the canonical form for this width,
    // folding the fixup into the move when possible
    let mut did_move = false;
    if is64 {
        if ts == ValueClass::Narrow32 {
            let tmp = if bpf_op == op::MOV {
                did_move = true;
                dst
            } else {
                mips::AT
            };
            ctx.zext_into(tmp, src);
            src = tmp;
        }
    } else if ts == ValueClass::Full64 || ts == ValueClass::ZeroExt32 {
        let tmp = if bpf_op == op::MOV {
            did_move = true;
            dst
        } else {
            mips::AT
        };
        ctx.em.put(mips::sll(tmp, src, 0));
        src = tmp;
    }

    match bpf_op {
        op::MOV => {
            if !did_move {
                if is64 {
                    ctx.em.move64(dst, src);
                } else {
                    ctx.em.move32(dst, src);
                }
            }
        }
        op::ADD if is64 => ctx.em.put(mips::daddu(dst, dst, src)),
        op::ADD => ctx.em.put(mips::addu(dst, dst, src)),
        op::SUB if is64 => ctx.em.put(mips::dsubu(dst, dst, src)),
        op::SUB => ctx.em.put(mips::subu(dst, dst, src)),
        op::AND => ctx.em.put(mips::and(dst, dst, src)),
        op::OR => ctx.em.put(mips::or(dst, dst, src)),
        op::XOR => ctx.em.put(mips::xor(dst, dst, src)),
        op::LSH if is64 => ctx.em.put(mips::dsllv(dst, dst, src)),
        op::LSH => ctx.em.put(mips::sllv(dst, dst, src)),
        op::RSH if is64 => ctx.em.put(mips::dsrlv(dst, dst, src)),
        op::RSH => ctx.em.put(mips::srlv(dst, dst, src)),
        op::ARSH if is64 => ctx.em.put(mips::dsrav(dst, dst, src)),
        op::ARSH => ctx.em.put(mips::srav(dst, dst, src)),
        op::MUL if is64 => {
            ctx.em.put(mips::dmultu(dst, src));
            ctx.em.put(mips::mflo(dst));
        }
        op::MUL => ctx.em.put(mips::mul(dst, dst, src)),
        op::DIV | op::MOD => {
            // a zero divisor ends the program with result 0
            let b = ctx.epilogue_branch()?;
            ctx.em.put(mips::beq(src, mips::ZERO, b));
            ctx.em.put(mips::movz(mips::V0, mips::ZERO, src)); // delay slot
            let w = if is64 {
                mips::ddivu(dst, src)
            } else {
                mips::divu(dst, src)
            };
            ctx.em.put(w);
            let w = if bpf_op == op::DIV {
                mips::mflo(dst)
            } else {
                mips::mfhi(dst)
            };
            ctx.em.put(w);
        }
        _ => {
            return Err(CompileError::UnsupportedOpcode {
                index: i,
                opcode: insn.code as u16,
            })
        }
    }
    Ok(())
}

/// Byte-order conversion. The generated code runs little-endian, so
/// only the to-big direction swaps; both directions truncate to the
/// requested width.
fn byteswap(ctx: &mut ExtContext, i: usize, insn: ExtInsn) -> Result<(), CompileError> {
    let dst = ctx.ext_reg(i, insn.dst, false)?;
    let td = ctx.vals.class(i, insn.dst);
    let swap = op::src(insn.code) != 0;

    if insn.imm == 64 && td == ValueClass::Narrow32 {
        ctx.em.put(mips::dinsu(dst, mips::ZERO, 32, 32));
    }
    if insn.imm != 64 && (td == ValueClass::Full64 || td == ValueClass::ZeroExt32) {
        ctx.em.put(mips::sll(dst, dst, 0));
    }

    match insn.imm {
        16 => {
            if swap {
                ctx.em.put(mips::wsbh(dst, dst));
            }
            ctx.em.put(mips::andi(dst, dst, 0xffff));
        }
        32 => {
            if swap {
                ctx.em.put(mips::wsbh(dst, dst));
                ctx.em.put(mips::rotr(dst, dst, 16));
            }
        }
        64 => {
            if swap {
                ctx.em.put(mips::dsbh(dst, dst));
                ctx.em.put(mips::dshd(dst, dst));
            }
        }
        _ => {
            return Err(CompileError::MalformedInput {
                index: i,
                reason: "bad byte swap width",
            })
        }
    }
    Ok(())
}

/// Loads: the two-slot wide immediate and the implicit packet forms.
fn load(ctx: &mut ExtContext, i: usize, insn: ExtInsn) -> Result<usize, CompileError> {
    let code = insn.code;
    match op::mode(code) {
        op::IMM if op::size(code) == op::DW => {
            if insn.src != 0 {
                return Err(CompileError::MalformedInput {
                    index: i,
                    reason: "bad register",
                });
            }
            if i + 1 >= ctx.prog.len() {
                return Err(CompileError::MalformedInput {
                    index: i,
                    reason: "truncated wide immediate",
                });
            }
            let hi = ctx.prog[i + 1];
            if hi.code != 0 || hi.dst != 0 || hi.src != 0 || hi.off != 0 {
                return Err(CompileError::MalformedInput {
                    index: i + 1,
                    reason: "wide immediate tail is not blank",
                });
            }
            let dst = ctx.ext_reg(i, insn.dst, false)?;
            let value = insn.imm as u32 as u64 | ((ctx.prog[i + 1].imm as u32 as u64) << 32);
            ctx.em.load_const64(dst, value);
            Ok(2)
        }
        op::ABS | op::IND => {
            let size = match op::size(code) {
                op::B => 1,
                op::H => 2,
                op::W => 4,
                _ => {
                    return Err(CompileError::UnsupportedOpcode {
                        index: i,
                        opcode: code as u16,
                    })
                }
            };
            ctx.flags |= ExtFlags::SAVE_RA;
            ctx.em.load_const64(mips::T9, ctx.hooks.packet_load);
            // the packet context lives in r6 by convention
            ctx.em.move64(mips::A0, mips::S0);
            if op::mode(code) == op::IND {
                let src = ctx.ext_reg(i, insn.src, false)?;
                if is_range16(insn.imm) {
                    ctx.em.put(mips::addiu(mips::A1, src, insn.imm as i16));
                } else {
                    ctx.em.load_imm(mips::AT, insn.imm);
                    ctx.em.put(mips::addu(mips::A1, src, mips::AT));
                }
            } else {
                ctx.em.load_imm(mips::A1, insn.imm);
            }
            ctx.em.put(mips::jalr(mips::RA, mips::T9));
            ctx.em.put(mips::addiu(mips::A2, mips::ZERO, size)); // delay slot
            // non-zero status ends the program with result 0
            let b = ctx.epilogue_branch()?;
            ctx.em.put(mips::bne(mips::V0, mips::ZERO, b));
            ctx.em.move32(mips::V0, mips::ZERO); // delay slot
            ctx.em.move64(mips::V0, mips::V1);
            Ok(1)
        }
        _ => Err(CompileError::UnsupportedOpcode {
            index: i,
            opcode: code as u16,
        }),
    }
}

/// Atomic in-memory add with a load-linked / store-conditional retry
/// loop.
fn atomic_add(ctx: &mut ExtContext, i: usize, insn: ExtInsn) -> Result<(), CompileError> {
    let dw = match op::size(insn.code) {
        op::W => false,
        op::DW => true,
        _ => {
            return Err(CompileError::UnsupportedOpcode {
                index: i,
                opcode: insn.code as u16,
            })
        }
    };
    let mut src = ctx.ext_reg(i, insn.src, false)?;
    let (base, off) = ctx.mem_access(i, insn.dst, insn.off)?;
    let ts = ctx.vals.class(i, insn.src);

    if dw {
        if ts == ValueClass::Narrow32 {
            ctx.zext_into(mips::T8, src);
            src = mips::T8;
        }
    } else if ts == ValueClass::Full64 || ts == ValueClass::ZeroExt32 {
        ctx.em.put(mips::sll(mips::T8, src, 0));
        src = mips::T8;
    }

    if dw {
        ctx.em.put(mips::lld(mips::AT, off, base));
        ctx.em.put(mips::daddu(mips::AT, mips::AT, src));
        ctx.em.put(mips::scd(mips::AT, off, base));
    } else {
        ctx.em.put(mips::ll(mips::AT, off, base));
        ctx.em.put(mips::addu(mips::AT, mips::AT, src));
        ctx.em.put(mips::sc(mips::AT, off, base));
    }
    // retry from the load-linked if the store lost the reservation
    ctx.em.put(mips::beq(mips::AT, mips::ZERO, -4));
    ctx.em.put(mips::nop()); // delay slot
    Ok(())
}

/// Jumps, calls and exits. Returns 2 when a conditional fuses with a
/// following exit instruction.
fn jump(ctx: &mut ExtContext, i: usize, insn: ExtInsn) -> Result<usize, CompileError> {
    let code = insn.code;
    match op::alu_op(code) {
        op::EXIT => {
            if i + 1 < ctx.prog.len() {
                let b = ctx.epilogue_branch()?;
                ctx.em.put(mips::b(b));
                ctx.em.put(mips::nop());
            }
            Ok(1)
        }
        op::JA => {
            let b = ctx.offs.branch_off(&ctx.em, ctx.jump_slot(i, insn.off)?)?;
            ctx.em.put(mips::b(b));
            ctx.em.put(mips::nop());
            Ok(1)
        }
        op::CALL if op::src(code) == 0 => {
            ctx.flags |= ExtFlags::SAVE_RA;
            let addr = ctx.hooks.call_base.wrapping_add(insn.imm as i64 as u64);
            ctx.em.load_const64(mips::T9, addr);
            ctx.em.put(mips::jalr(mips::RA, mips::T9));
            ctx.em.put(mips::nop()); // delay slot
            Ok(1)
        }
        op::JSGT | op::JSGE if op::src(code) == 0 && insn.imm == 0 => {
            let dst = if insn.dst == 10 {
                // the frame pointer is virtual; compares see the
                // materialized address
                ctx.flags |= ExtFlags::SEEN_FP;
                ctx.em
                    .put(mips::daddiu(mips::AT, mips::SP, EXT_STACK_SIZE as i16));
                mips::AT
            } else {
                ctx.ext_reg(i, insn.dst, false)?
            };
            let greater_only = op::alu_op(code) == op::JSGT;
            if ctx.fuses_exit(i, insn.off) {
                let b = ctx.epilogue_branch()?;
                let w = if greater_only {
                    mips::blez(dst, b)
                } else {
                    mips::bltz(dst, b)
                };
                ctx.em.put(w);
                ctx.em.put(mips::nop());
                return Ok(2);
            }
            let b = ctx.offs.branch_off(&ctx.em, ctx.jump_slot(i, insn.off)?)?;
            let w = if greater_only {
                mips::bgtz(dst, b)
            } else {
                mips::bgez(dst, b)
            };
            ctx.em.put(w);
            ctx.em.put(mips::nop());
            Ok(1)
        }
        op::JEQ | op::JNE | op::JGT | op::JGE | op::JSGT | op::JSGE | op::JSET => {
            let (a, b_reg, branch_eq) = synth_compare(ctx, i, insn)?;
            if ctx.fuses_exit(i, insn.off) {
                // fall into the exit when the condition is false
                let b = ctx.epilogue_branch()?;
                let w = if branch_eq {
                    mips::bne(a, b_reg, b)
                } else {
                    mips::beq(a, b_reg, b)
                };
                ctx.em.put(w);
                ctx.em.put(mips::nop());
                return Ok(2);
            }
            let b = ctx.offs.branch_off(&ctx.em, ctx.jump_slot(i, insn.off)?)?;
            let w = if branch_eq {
                mips::beq(a, b_reg, b)
            } else {
                mips::bne(a, b_reg, b)
            };
            ctx.em.put(w);
            ctx.em.put(mips::nop());
            Ok(1)
        }
        _ => Err(CompileError::UnsupportedOpcode {
            index: i,
            opcode: code as u16,
        }),
    }
}

/// Reduce a conditional to a `beq`/`bne` over two registers: returns
/// the operands and whether the branch is taken on equality.
fn synth_compare(
    ctx: &mut ExtContext,
    i: usize,
    insn: ExtInsn,
) -> Result<(Reg, Reg, bool), CompileError> {
    let code = insn.code;
    let bpf_op = op::alu_op(code);
    let dst = if insn.dst == 10 {
        // the frame pointer is virtual; compare the materialized
        // address, not the raw stack pointer
        ctx.flags |= ExtFlags::SEEN_FP;
        ctx.em
            .put(mips::daddiu(mips::T8, mips::SP, EXT_STACK_SIZE as i16));
        mips::T8
    } else {
        ctx.ext_reg(i, insn.dst, false)?
    };
    let imm = insn.imm;

    if op::src(code) != 0 {
        let src = ctx.ext_reg(i, insn.src, false)?;
        let td = ctx.vals.class(i, insn.dst);
        let ts = ctx.vals.class(i, insn.src);
        return Ok(match bpf_op {
            op::JEQ | op::JNE => {
                // equality needs both operands in the same canonical
                // form; sign extend the wider side to match
                let (mut a, mut b) = (dst, src);
                if td == ValueClass::Narrow32 && ts != ValueClass::Narrow32 {
                    ctx.em.put(mips::sll(mips::AT, src, 0));
                    b = mips::AT;
                } else if ts == ValueClass::Narrow32 && td != ValueClass::Narrow32 {
                    ctx.em.put(mips::sll(mips::AT, dst, 0));
                    a = mips::AT;
                }
                (a, b, bpf_op == op::JEQ)
            }
            op::JSGT => {
                ctx.em.put(mips::slt(mips::AT, src, dst));
                (mips::AT, mips::ZERO, false)
            }
            op::JSGE => {
                ctx.em.put(mips::slt(mips::AT, dst, src));
                (mips::AT, mips::ZERO, true)
            }
            op::JGT | op::JGE => {
                // unsigned order needs zero-extended operands
                let a = if td == ValueClass::Narrow32 {
                    ctx.zext_into(mips::AT, dst);
                    mips::AT
                } else {
                    dst
                };
                let b = if ts == ValueClass::Narrow32 {
                    // $t8 may already hold the frame-pointer address
                    let tmp = if a == mips::T8 { mips::AT } else { mips::T8 };
                    ctx.zext_into(tmp, src);
                    tmp
                } else {
                    src
                };
                if bpf_op == op::JGT {
                    ctx.em.put(mips::sltu(mips::AT, b, a));
                    (mips::AT, mips::ZERO, false)
                } else {
                    ctx.em.put(mips::sltu(mips::AT, a, b));
                    (mips::AT, mips::ZERO, true)
                }
            }
            _ => {
                // JSET
                ctx.em.put(mips::and(mips::AT, dst, src));
                (mips::AT, mips::ZERO, false)
            }
        });
    }

    Ok(match bpf_op {
        op::JEQ | op::JNE => {
            let b = if imm == 0 {
                mips::ZERO
            } else {
                ctx.em.load_imm(mips::AT, imm);
                mips::AT
            };
            (dst, b, bpf_op == op::JEQ)
        }
        op::JSGT | op::JSGE => {
            let bound = imm as i64 + if bpf_op == op::JSGT { 1 } else { 0 };
            ctx.em.load_const64(mips::AT, bound as u64);
            ctx.em.put(mips::slt(mips::AT, dst, mips::AT));
            // taken when dst is not below the bound
            (mips::AT, mips::ZERO, true)
        }
        op::JGT | op::JGE => {
            let bound = imm as u32 as u64 + if bpf_op == op::JGT { 1 } else { 0 };
            ctx.em.load_const64(mips::AT, bound);
            ctx.em.put(mips::sltu(mips::AT, dst, mips::AT));
            (mips::AT, mips::ZERO, true)
        }
        _ => {
            // JSET
            if (0..=0xffff).contains(&imm) {
                ctx.em.put(mips::andi(mips::AT, dst, imm as u16));
            } else {
                ctx.em.load_const64(mips::AT, imm as u32 as u64);
                ctx.em.put(mips::and(mips::AT, dst, mips::AT));
            }
            (mips::AT, mips::ZERO, false)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::tracker;
    use crate::program::op;

    static HOOKS: RuntimeHooks = RuntimeHooks {
        load_word: 0x1000_0000,
        load_half: 0x1000_0100,
        load_byte: 0x1000_0200,
        packet_load: 0x1000_0300,
        call_base: 0x1000_0400,
    };

    fn exit() -> ExtInsn {
        ExtInsn::new(op::JMP | op::EXIT, 0, 0, 0, 0)
    }

    fn measure(prog: &[ExtInsn]) -> (ExtFlags, Offsets, u32) {
        let vals = tracker::propagate(prog).unwrap();
        let mut ctx = ExtContext::measure(prog, &HOOKS, &vals);
        build_ext_body(&mut ctx).unwrap();
        (ctx.flags, ctx.offs, ctx.em.idx())
    }

    fn emit(prog: &[ExtInsn]) -> Vec<u32> {
        let vals = tracker::propagate(prog).unwrap();
        let mut ctx = ExtContext::measure(prog, &HOOKS, &vals);
        build_ext_body(&mut ctx).unwrap();
        let (offs, n) = (ctx.offs, ctx.em.idx());
        let mut ctx = ExtContext::emit(prog, &HOOKS, &vals, offs, n as usize);
        build_ext_body(&mut ctx).unwrap();
        let words = ctx.em.into_buffer().unwrap().into_words();
        assert_eq!(words.len(), n as usize);
        words
    }

    #[test]
    fn test_save_flags_discovery() {
        let prog = vec![
            ExtInsn::new(op::ALU64 | op::MOV | op::X, 6, 1, 0, 0), // r6 = r1
            ExtInsn::new(op::JMP | op::CALL, 0, 0, 0, 4),
            ExtInsn::new(op::STX | op::DW | op::MEM, 10, 6, -8, 0),
            exit(),
        ];
        let (flags, _, _) = measure(&prog);
        assert!(flags.contains(ExtFlags::SAVE_S0));
        assert!(flags.contains(ExtFlags::SAVE_RA));
        assert!(flags.contains(ExtFlags::SEEN_FP));
        assert!(!flags.contains(ExtFlags::SAVE_S1));
    }

    #[test]
    fn test_dead_code_shares_offset() {
        let prog = vec![
            ExtInsn::new(op::JMP | op::JA, 0, 0, 1, 0),
            ExtInsn::new(op::ALU64 | op::MOV | op::K, 0, 0, 0, 9), // dead
            ExtInsn::new(op::ALU64 | op::MOV | op::K, 0, 0, 0, 3),
            exit(),
        ];
        let (_, offs, _) = measure(&prog);
        assert_eq!(offs.get(1), offs.get(2));
    }

    #[test]
    fn test_exit_offsets_alias_epilogue() {
        let prog = vec![
            ExtInsn::new(op::ALU64 | op::MOV | op::K, 0, 0, 0, 1),
            exit(),
            ExtInsn::new(op::ALU64 | op::MOV | op::K, 0, 0, 0, 2), // dead
            exit(),
        ];
        let (_, offs, n) = measure(&prog);
        assert_eq!(offs.get(1), n);
        assert_eq!(offs.get(3), n);
    }

    #[test]
    fn test_wide_imm_consumes_two_slots() {
        let prog = vec![
            ExtInsn::new(op::LD | op::DW | op::IMM, 0, 0, 0, 0x5678),
            ExtInsn::new(0, 0, 0, 0, 0x1234),
            exit(),
        ];
        let words = emit(&prog);
        // lui + ori pair for 0x1234_0000_5678? value = 0x1234_0000_5678:
        // chunked synthesis, then nothing for the exit (last insn)
        assert!(!words.is_empty());
        let (_, offs, n) = measure(&prog);
        assert_eq!(offs.get(1), offs.get(2), "pair tail aliases next insn");
        assert_eq!(offs.get(3), n);
    }

    #[test]
    fn test_wide_imm_tail_must_be_blank() {
        let prog = vec![
            ExtInsn::new(op::LD | op::DW | op::IMM, 0, 0, 0, 1),
            ExtInsn::new(0, 3, 0, 0, 2), // stray dst field
            exit(),
        ];
        let vals = tracker::propagate(&prog).unwrap();
        let mut ctx = ExtContext::measure(&prog, &HOOKS, &vals);
        assert!(matches!(
            build_ext_body(&mut ctx),
            Err(CompileError::MalformedInput { index: 1, .. })
        ));
    }

    #[test]
    fn test_branch_over_exit_fuses() {
        let prog = vec![
            ExtInsn::new(op::JMP | op::JEQ | op::K, 1, 0, 1, 0), // over exit
            exit(),
            ExtInsn::new(op::ALU64 | op::MOV | op::K, 0, 0, 0, 1),
            exit(),
        ];
        let words = emit(&prog);
        // bne r1, zero -> epilogue; nop; mov; (exit is last, no branch)
        assert_eq!(words.len(), 3);
        assert_eq!(words[0] >> 26, 0x05); // bne
        assert_eq!(words[1], mips::nop());
    }

    #[test]
    fn test_bad_register_rejected() {
        let prog = vec![
            ExtInsn::new(op::ALU64 | op::MOV | op::K, 11, 0, 0, 1),
            exit(),
        ];
        // rejected before translation, while classes are propagated
        assert!(matches!(
            tracker::propagate(&prog),
            Err(CompileError::MalformedInput { index: 0, .. })
        ));
    }

    #[test]
    fn test_fp_write_rejected() {
        let prog = vec![
            ExtInsn::new(op::ALU64 | op::MOV | op::K, 10, 0, 0, 1),
            exit(),
        ];
        let vals = tracker::propagate(&prog).unwrap();
        let mut ctx = ExtContext::measure(&prog, &HOOKS, &vals);
        assert!(matches!(
            build_ext_body(&mut ctx),
            Err(CompileError::MalformedInput { index: 0, .. })
        ));
    }

    #[test]
    fn test_fp_relative_store_folds_local_area() {
        let prog = vec![
            ExtInsn::new(op::ALU64 | op::MOV | op::K, 1, 0, 0, 7),
            ExtInsn::new(op::STX | op::DW | op::MEM, 10, 1, -8, 0),
            exit(),
        ];
        let words = emit(&prog);
        // store lands at sp + 512 - 8
        assert!(words.contains(&mips::sd(mips::A0, 504, mips::SP)));
    }

    #[test]
    fn test_atomic_add_retry_loop() {
        let prog = vec![
            ExtInsn::new(op::ALU | op::MOV | op::K, 2, 0, 0, 1),
            ExtInsn::new(op::STX | op::W | op::XADD, 1, 2, 0, 0),
            exit(),
        ];
        let words = emit(&prog);
        assert_eq!(
            words,
            vec![
                mips::addiu(mips::A1, mips::ZERO, 1),
                mips::ll(mips::AT, 0, mips::A0),
                mips::addu(mips::AT, mips::AT, mips::A1),
                mips::sc(mips::AT, 0, mips::A0),
                mips::beq(mips::AT, mips::ZERO, -4),
                mips::nop(),
            ]
        );
    }

    #[test]
    fn test_div_by_zero_register_exits_with_zero() {
        let prog = vec![
            ExtInsn::new(op::ALU64 | op::MOV | op::K, 0, 0, 0, 5),
            ExtInsn::new(op::ALU64 | op::DIV | op::X, 0, 1, 0, 0),
            exit(),
        ];
        let words = emit(&prog);
        // beq src, zero -> epilogue with a conditional v0 clear in the
        // delay slot
        assert!(words.contains(&mips::movz(mips::V0, mips::ZERO, mips::A0)));
    }

    #[test]
    fn test_measure_and_emit_agree() {
        let prog = vec![
            ExtInsn::new(op::ALU64 | op::MOV | op::K, 0, 0, 0, 0x12345),
            ExtInsn::new(op::ALU | op::ADD | op::K, 0, 0, 0, 1),
            ExtInsn::new(op::JMP | op::JGT | op::K, 0, 0, 1, 100),
            ExtInsn::new(op::ALU64 | op::MOV | op::K, 0, 0, 0, 0),
            exit(),
        ];
        let (_, _, n) = measure(&prog);
        assert_eq!(emit(&prog).len(), n as usize);
    }
}
