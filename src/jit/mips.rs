//! MIPS instruction encoding for the JIT.
//!
//! Every encoder is a pure function from operands to one 32-bit instruction
//! word. Word order in the output buffer is the execution order; branch
//! displacements are given in instruction units relative to the delay slot.

/// A MIPS general-purpose register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub u8);

impl Reg {
    fn num(self) -> u32 {
        (self.0 & 0x1f) as u32
    }
}

pub const ZERO: Reg = Reg(0);
pub const AT: Reg = Reg(1);
pub const V0: Reg = Reg(2);
pub const V1: Reg = Reg(3);
pub const A0: Reg = Reg(4);
pub const A1: Reg = Reg(5);
pub const A2: Reg = Reg(6);
pub const A3: Reg = Reg(7);
/// Fifth argument register in the 64-bit calling convention.
pub const A4: Reg = Reg(8);
pub const T4: Reg = Reg(12);
pub const T5: Reg = Reg(13);
pub const S0: Reg = Reg(16);
pub const S1: Reg = Reg(17);
pub const S2: Reg = Reg(18);
pub const S3: Reg = Reg(19);
pub const S4: Reg = Reg(20);
pub const S5: Reg = Reg(21);
pub const S6: Reg = Reg(22);
pub const T8: Reg = Reg(24);
pub const T9: Reg = Reg(25);
pub const SP: Reg = Reg(29);
pub const RA: Reg = Reg(31);

// ==================== Field packers ====================

fn r_type(rs: Reg, rt: Reg, rd: Reg, sa: u32, funct: u32) -> u32 {
    (rs.num() << 21) | (rt.num() << 16) | (rd.num() << 11) | ((sa & 0x1f) << 6) | funct
}

fn i_type(op: u32, rs: Reg, rt: Reg, imm: u16) -> u32 {
    (op << 26) | (rs.num() << 21) | (rt.num() << 16) | imm as u32
}

// ==================== Arithmetic / logic ====================

/// ADDU rd, rs, rt (32-bit add, result sign-extended on 64-bit cores)
pub fn addu(rd: Reg, rs: Reg, rt: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x21)
}

/// SUBU rd, rs, rt
pub fn subu(rd: Reg, rs: Reg, rt: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x23)
}

/// DADDU rd, rs, rt (64-bit add)
pub fn daddu(rd: Reg, rs: Reg, rt: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x2d)
}

/// DSUBU rd, rs, rt
pub fn dsubu(rd: Reg, rs: Reg, rt: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x2f)
}

pub fn and(rd: Reg, rs: Reg, rt: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x24)
}

pub fn or(rd: Reg, rs: Reg, rt: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x25)
}

pub fn xor(rd: Reg, rs: Reg, rt: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x26)
}

/// SLT rd, rs, rt (rd = (rs < rt) signed)
pub fn slt(rd: Reg, rs: Reg, rt: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x2a)
}

/// SLTU rd, rs, rt (rd = (rs < rt) unsigned)
pub fn sltu(rd: Reg, rs: Reg, rt: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x2b)
}

/// MOVZ rd, rs, rt (rd = rs if rt == 0)
pub fn movz(rd: Reg, rs: Reg, rt: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x0a)
}

// ==================== Shifts ====================

/// SLL rd, rt, sa (sa must already be in 0..32)
pub fn sll(rd: Reg, rt: Reg, sa: u32) -> u32 {
    r_type(ZERO, rt, rd, sa, 0x00)
}

pub fn srl(rd: Reg, rt: Reg, sa: u32) -> u32 {
    r_type(ZERO, rt, rd, sa, 0x02)
}

pub fn sra(rd: Reg, rt: Reg, sa: u32) -> u32 {
    r_type(ZERO, rt, rd, sa, 0x03)
}

pub fn sllv(rd: Reg, rt: Reg, rs: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x04)
}

pub fn srlv(rd: Reg, rt: Reg, rs: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x06)
}

pub fn srav(rd: Reg, rt: Reg, rs: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x07)
}

/// DSLL rd, rt, sa (64-bit shift, sa in 0..32)
pub fn dsll(rd: Reg, rt: Reg, sa: u32) -> u32 {
    r_type(ZERO, rt, rd, sa, 0x38)
}

pub fn dsrl(rd: Reg, rt: Reg, sa: u32) -> u32 {
    r_type(ZERO, rt, rd, sa, 0x3a)
}

pub fn dsra(rd: Reg, rt: Reg, sa: u32) -> u32 {
    r_type(ZERO, rt, rd, sa, 0x3b)
}

/// DSLL32 rd, rt, sa (shift by sa + 32)
pub fn dsll32(rd: Reg, rt: Reg, sa: u32) -> u32 {
    r_type(ZERO, rt, rd, sa, 0x3c)
}

pub fn dsrl32(rd: Reg, rt: Reg, sa: u32) -> u32 {
    r_type(ZERO, rt, rd, sa, 0x3e)
}

pub fn dsra32(rd: Reg, rt: Reg, sa: u32) -> u32 {
    r_type(ZERO, rt, rd, sa, 0x3f)
}

pub fn dsllv(rd: Reg, rt: Reg, rs: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x14)
}

pub fn dsrlv(rd: Reg, rt: Reg, rs: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x16)
}

pub fn dsrav(rd: Reg, rt: Reg, rs: Reg) -> u32 {
    r_type(rs, rt, rd, 0, 0x17)
}

/// ROTR rd, rt, sa (rotate right, release-2 encoding)
pub fn rotr(rd: Reg, rt: Reg, sa: u32) -> u32 {
    r_type(Reg(1), rt, rd, sa, 0x02)
}

// ==================== Multiply / divide ====================

/// MUL rd, rs, rt (32-bit three-operand multiply)
pub fn mul(rd: Reg, rs: Reg, rt: Reg) -> u32 {
    (0x1c << 26) | r_type(rs, rt, rd, 0, 0x02)
}

/// DMULTU rs, rt (HI:LO = rs * rt, unsigned 64-bit)
pub fn dmultu(rs: Reg, rt: Reg) -> u32 {
    r_type(rs, rt, ZERO, 0, 0x1d)
}

/// DIVU rs, rt (LO = rs / rt, HI = rs % rt, unsigned 32-bit)
pub fn divu(rs: Reg, rt: Reg) -> u32 {
    r_type(rs, rt, ZERO, 0, 0x1b)
}

/// DDIVU rs, rt (unsigned 64-bit divide)
pub fn ddivu(rs: Reg, rt: Reg) -> u32 {
    r_type(rs, rt, ZERO, 0, 0x1f)
}

pub fn mfhi(rd: Reg) -> u32 {
    r_type(ZERO, ZERO, rd, 0, 0x10)
}

pub fn mflo(rd: Reg) -> u32 {
    r_type(ZERO, ZERO, rd, 0, 0x12)
}

// ==================== Immediates ====================

pub fn addiu(rt: Reg, rs: Reg, imm: i16) -> u32 {
    i_type(0x09, rs, rt, imm as u16)
}

/// DADDIU rt, rs, imm (64-bit add immediate)
pub fn daddiu(rt: Reg, rs: Reg, imm: i16) -> u32 {
    i_type(0x19, rs, rt, imm as u16)
}

pub fn sltiu(rt: Reg, rs: Reg, imm: i16) -> u32 {
    i_type(0x0b, rs, rt, imm as u16)
}

pub fn andi(rt: Reg, rs: Reg, imm: u16) -> u32 {
    i_type(0x0c, rs, rt, imm)
}

pub fn ori(rt: Reg, rs: Reg, imm: u16) -> u32 {
    i_type(0x0d, rs, rt, imm)
}

pub fn xori(rt: Reg, rs: Reg, imm: u16) -> u32 {
    i_type(0x0e, rs, rt, imm)
}

/// LUI rt, imm (rt = imm << 16, sign-extended to 64 bits)
pub fn lui(rt: Reg, imm: u16) -> u32 {
    i_type(0x0f, ZERO, rt, imm)
}

// ==================== Branches ====================

/// BEQ rs, rt, disp (disp in instruction units from the delay slot)
pub fn beq(rs: Reg, rt: Reg, disp: i16) -> u32 {
    i_type(0x04, rs, rt, disp as u16)
}

pub fn bne(rs: Reg, rt: Reg, disp: i16) -> u32 {
    i_type(0x05, rs, rt, disp as u16)
}

/// B disp (unconditional; assembles as BEQ $zero, $zero)
pub fn b(disp: i16) -> u32 {
    beq(ZERO, ZERO, disp)
}

pub fn blez(rs: Reg, disp: i16) -> u32 {
    i_type(0x06, rs, ZERO, disp as u16)
}

pub fn bgtz(rs: Reg, disp: i16) -> u32 {
    i_type(0x07, rs, ZERO, disp as u16)
}

pub fn bltz(rs: Reg, disp: i16) -> u32 {
    i_type(0x01, rs, Reg(0), disp as u16)
}

pub fn bgez(rs: Reg, disp: i16) -> u32 {
    i_type(0x01, rs, Reg(1), disp as u16)
}

// ==================== Jumps ====================

pub fn jr(rs: Reg) -> u32 {
    r_type(rs, ZERO, ZERO, 0, 0x08)
}

/// JALR rd, rs (link register is explicit)
pub fn jalr(rd: Reg, rs: Reg) -> u32 {
    r_type(rs, ZERO, rd, 0, 0x09)
}

pub fn nop() -> u32 {
    0
}

// ==================== Loads / stores ====================

pub fn lbu(rt: Reg, off: i16, base: Reg) -> u32 {
    i_type(0x24, base, rt, off as u16)
}

pub fn lhu(rt: Reg, off: i16, base: Reg) -> u32 {
    i_type(0x25, base, rt, off as u16)
}

pub fn lw(rt: Reg, off: i16, base: Reg) -> u32 {
    i_type(0x23, base, rt, off as u16)
}

pub fn ld(rt: Reg, off: i16, base: Reg) -> u32 {
    i_type(0x37, base, rt, off as u16)
}

pub fn sb(rt: Reg, off: i16, base: Reg) -> u32 {
    i_type(0x28, base, rt, off as u16)
}

pub fn sh(rt: Reg, off: i16, base: Reg) -> u32 {
    i_type(0x29, base, rt, off as u16)
}

pub fn sw(rt: Reg, off: i16, base: Reg) -> u32 {
    i_type(0x2b, base, rt, off as u16)
}

pub fn sd(rt: Reg, off: i16, base: Reg) -> u32 {
    i_type(0x3f, base, rt, off as u16)
}

/// LL rt, off(base) (load linked, 32-bit)
pub fn ll(rt: Reg, off: i16, base: Reg) -> u32 {
    i_type(0x30, base, rt, off as u16)
}

/// SC rt, off(base) (store conditional; rt becomes 1 on success, 0 on failure)
pub fn sc(rt: Reg, off: i16, base: Reg) -> u32 {
    i_type(0x38, base, rt, off as u16)
}

pub fn lld(rt: Reg, off: i16, base: Reg) -> u32 {
    i_type(0x34, base, rt, off as u16)
}

pub fn scd(rt: Reg, off: i16, base: Reg) -> u32 {
    i_type(0x3c, base, rt, off as u16)
}

// ==================== Bit manipulation ====================

/// WSBH rd, rt (swap bytes within halfwords)
pub fn wsbh(rd: Reg, rt: Reg) -> u32 {
    (0x1f << 26) | r_type(ZERO, rt, rd, 0x02, 0x20)
}

/// DSBH rd, rt (swap bytes within halfwords, doubleword)
pub fn dsbh(rd: Reg, rt: Reg) -> u32 {
    (0x1f << 26) | r_type(ZERO, rt, rd, 0x02, 0x24)
}

/// DSHD rd, rt (swap halfwords within doublewords)
pub fn dshd(rd: Reg, rt: Reg) -> u32 {
    (0x1f << 26) | r_type(ZERO, rt, rd, 0x05, 0x24)
}

/// DINSU rt, rs, pos, size (insert into bits pos..pos+size, pos >= 32).
///
/// `dinsu rt, $zero, 32, 32` zeroes the upper word, i.e. zero-extends rt.
pub fn dinsu(rt: Reg, rs: Reg, pos: u32, size: u32) -> u32 {
    let msbd = pos + size - 33; // encoded in the rd field
    let lsbd = pos - 32; // encoded in the sa field
    (0x1f << 26) | r_type(rs, rt, Reg(msbd as u8), lsbd, 0x06)
}
