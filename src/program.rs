//! Source-program instruction forms and the runtime boundary.
//!
//! Two bytecode generations are accepted: the classic accumulator form
//! (two registers plus scratch cells) and the extended eleven-register
//! form. Opcodes use the packed bit layout both generations share:
//! a 3-bit class in the low bits, then size/mode for loads or
//! operation/source for ALU and jump instructions.

/// Number of 32-bit scratch cells available to classic programs.
pub const SCRATCH_WORDS: usize = 16;

/// Size of the extended form's per-program stack area, bytes.
pub const EXT_STACK_SIZE: i32 = 512;

/// Registers in the extended form: `r0`..`r9` plus the read-only frame
/// pointer `r10`.
pub const EXT_REG_COUNT: usize = 11;

/// Packet context record layout, defined at this crate's boundary.
/// The generated code and the embedder's load helpers agree on it.
pub const CTX_DATA_OFFSET: i16 = 0;
/// Packet length, u32, at this offset into the context record.
pub const CTX_LEN_OFFSET: i16 = 8;

/// One classic instruction: opcode, two branch displacements for
/// conditional jumps, and a 32-bit operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassicInsn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl ClassicInsn {
    pub fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { code, jt, jf, k }
    }
}

/// One extended instruction. A 64-bit immediate load occupies two
/// consecutive records; the second carries the high 32 bits in `imm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtInsn {
    pub code: u8,
    pub dst: u8,
    pub src: u8,
    pub off: i16,
    pub imm: i32,
}

impl ExtInsn {
    pub fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
        Self {
            code,
            dst,
            src,
            off,
            imm,
        }
    }
}

/// Packed opcode fields, shared by both generations where the encodings
/// coincide.
pub mod op {
    // instruction classes (low 3 bits)
    pub const LD: u8 = 0x00;
    pub const LDX: u8 = 0x01;
    pub const ST: u8 = 0x02;
    pub const STX: u8 = 0x03;
    pub const ALU: u8 = 0x04;
    pub const JMP: u8 = 0x05;
    /// Classic only.
    pub const RET: u8 = 0x06;
    /// Classic only.
    pub const MISC: u8 = 0x07;
    /// Extended only; numerically aliases MISC.
    pub const ALU64: u8 = 0x07;

    // access width (bits 3-4)
    pub const W: u8 = 0x00;
    pub const H: u8 = 0x08;
    pub const B: u8 = 0x10;
    /// Extended only.
    pub const DW: u8 = 0x18;

    // addressing mode (bits 5-7)
    pub const IMM: u8 = 0x00;
    pub const ABS: u8 = 0x20;
    pub const IND: u8 = 0x40;
    pub const MEM: u8 = 0x60;
    /// Classic only: packet length.
    pub const LEN: u8 = 0x80;
    /// Classic only: nibble-scaling byte load.
    pub const MSH: u8 = 0xa0;
    /// Extended only: atomic add.
    pub const XADD: u8 = 0xc0;

    // ALU operations (bits 4-7)
    pub const ADD: u8 = 0x00;
    pub const SUB: u8 = 0x10;
    pub const MUL: u8 = 0x20;
    pub const DIV: u8 = 0x30;
    pub const OR: u8 = 0x40;
    pub const AND: u8 = 0x50;
    pub const LSH: u8 = 0x60;
    pub const RSH: u8 = 0x70;
    pub const NEG: u8 = 0x80;
    pub const MOD: u8 = 0x90;
    pub const XOR: u8 = 0xa0;
    /// Extended only.
    pub const MOV: u8 = 0xb0;
    /// Extended only.
    pub const ARSH: u8 = 0xc0;
    /// Extended only: byte-swap.
    pub const END: u8 = 0xd0;

    // jump operations (bits 4-7)
    pub const JA: u8 = 0x00;
    pub const JEQ: u8 = 0x10;
    pub const JGT: u8 = 0x20;
    pub const JGE: u8 = 0x30;
    pub const JSET: u8 = 0x40;
    /// Extended only.
    pub const JNE: u8 = 0x50;
    /// Extended only.
    pub const JSGT: u8 = 0x60;
    /// Extended only.
    pub const JSGE: u8 = 0x70;
    /// Extended only.
    pub const CALL: u8 = 0x80;
    /// Extended only.
    pub const EXIT: u8 = 0x90;

    // operand source (bit 3)
    pub const K: u8 = 0x00;
    pub const X: u8 = 0x08;

    // byte-swap direction (bit 3 of an END opcode)
    pub const TO_LE: u8 = 0x00;
    pub const TO_BE: u8 = 0x08;

    // classic return-value source (bits 3-4)
    pub const RET_K: u8 = 0x00;
    pub const RET_A: u8 = 0x10;

    // classic register transfers (bit 7)
    pub const TAX: u8 = 0x00;
    pub const TXA: u8 = 0x80;

    pub fn class(code: u8) -> u8 {
        code & 0x07
    }

    pub fn size(code: u8) -> u8 {
        code & 0x18
    }

    pub fn mode(code: u8) -> u8 {
        code & 0xe0
    }

    pub fn alu_op(code: u8) -> u8 {
        code & 0xf0
    }

    pub fn src(code: u8) -> u8 {
        code & 0x08
    }
}

/// Classic ancillary loads are encoded as absolute loads with operands
/// in this reserved negative window. They peek at embedder-internal
/// structures that do not exist at this boundary and are rejected.
pub const ANCILLARY_BASE: i32 = -0x1000;

/// Facts about the embedding runtime, cached by the caller and read
/// once per compilation before the first pass.
///
/// All packet-access helpers share one ABI: arguments in `$a0..`,
/// status returned in `$v0` (0 = success), loaded value in `$v1`
/// already converted to host byte order. A helper owns all bounds and
/// sign handling for the offset it is given.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeHooks {
    /// Classic word fetch: `(ctx, offset) -> (status, value)`.
    pub load_word: u64,
    /// Classic halfword fetch.
    pub load_half: u64,
    /// Classic byte fetch.
    pub load_byte: u64,
    /// Extended packet fetch: `(ctx, offset, size) -> (status, value)`.
    pub packet_load: u64,
    /// Base address added to an extended `call` immediate to form the
    /// helper entry point.
    pub call_base: u64,
}
