//! Emission cursor and composite instruction selection.
//!
//! An [`Emitter`] runs in one of two modes. MEASURE counts instruction
//! slots without a buffer; EMIT appends words to a [`CodeBuffer`]. All
//! selection decisions (immediate fits, fallback sequences) depend only
//! on operand values, so both modes walk identical paths and produce
//! identical counts.

use super::codebuf::CodeBuffer;
use super::mips::{self, Reg};
use crate::error::CompileError;

/// Is the immediate within the 16-bit signed range?
pub fn is_range16(imm: i32) -> bool {
    (-0x8000..0x8000).contains(&imm)
}

pub struct Emitter {
    buf: Option<CodeBuffer>,
    idx: u32,
}

impl Emitter {
    /// MEASURE mode: count slots, emit nothing.
    pub fn measuring() -> Self {
        Self { buf: None, idx: 0 }
    }

    /// EMIT mode: append words to a buffer of the given capacity.
    pub fn writing(capacity_words: usize) -> Self {
        Self {
            buf: Some(CodeBuffer::with_capacity(capacity_words)),
            idx: 0,
        }
    }

    pub fn is_measuring(&self) -> bool {
        self.buf.is_none()
    }

    /// Current instruction index (equals words emitted so far).
    pub fn idx(&self) -> u32 {
        self.idx
    }

    /// Emit one instruction word (or just count it in MEASURE mode).
    pub fn put(&mut self, word: u32) {
        if let Some(buf) = &mut self.buf {
            buf.push(word);
        }
        self.idx += 1;
    }

    pub fn into_buffer(self) -> Option<CodeBuffer> {
        self.buf
    }

    // ==================== Composite sequences ====================

    /// Load a 32-bit immediate: one `addiu` when it fits signed 16 bits,
    /// otherwise `lui` + `ori`.
    pub fn load_imm(&mut self, dst: Reg, imm: i32) {
        if is_range16(imm) {
            self.put(mips::addiu(dst, mips::ZERO, imm as i16));
        } else {
            self.put(mips::lui(dst, (imm >> 16) as u16));
            self.put(mips::ori(dst, dst, imm as u16));
        }
    }

    /// Synthesize a 64-bit constant in one to four instructions,
    /// chunked 16 bits at a time.
    pub fn load_const64(&mut self, dst: Reg, value: u64) {
        if value >= 0xffff_ffff_ffff_8000 || value < 0x8000 {
            self.put(mips::daddiu(dst, mips::ZERO, value as i16));
        } else if value >= 0xffff_ffff_8000_0000 || (value < 0x8000_0000 && value > 0xffff) {
            self.put(mips::lui(dst, (value >> 16) as u16));
            self.put(mips::ori(dst, dst, value as u16));
        } else {
            let mut seen_part = false;
            let mut needed_shift = 0u32;
            for i in 0..4 {
                let part = (value >> (16 * (3 - i))) & 0xffff;
                if seen_part && needed_shift > 0 && (part != 0 || i == 3) {
                    self.dsll_imm(dst, dst, needed_shift);
                    needed_shift = 0;
                }
                if part != 0 {
                    let src = if seen_part { dst } else { mips::ZERO };
                    self.put(mips::ori(dst, src, part as u16));
                    seen_part = true;
                }
                if seen_part {
                    needed_shift += 16;
                }
            }
        }
    }

    /// 32-bit left shift by immediate; counts of 32 or more produce zero.
    pub fn sll_safe(&mut self, dst: Reg, src: Reg, sa: u32) {
        if sa >= 32 {
            self.put(mips::addu(dst, mips::ZERO, mips::ZERO));
        } else {
            self.put(mips::sll(dst, src, sa));
        }
    }

    /// 32-bit right shift by immediate; counts of 32 or more produce zero.
    pub fn srl_safe(&mut self, dst: Reg, src: Reg, sa: u32) {
        if sa >= 32 {
            self.put(mips::addu(dst, mips::ZERO, mips::ZERO));
        } else {
            self.put(mips::srl(dst, src, sa));
        }
    }

    /// 64-bit left shift by immediate in 0..64, using the split encoding
    /// for counts of 32 and above.
    pub fn dsll_imm(&mut self, dst: Reg, src: Reg, sa: u32) {
        if sa >= 32 {
            self.put(mips::dsll32(dst, src, sa - 32));
        } else {
            self.put(mips::dsll(dst, src, sa));
        }
    }

    /// 64-bit logical right shift by immediate in 0..64.
    pub fn dsrl_imm(&mut self, dst: Reg, src: Reg, sa: u32) {
        if sa >= 32 {
            self.put(mips::dsrl32(dst, src, sa - 32));
        } else {
            self.put(mips::dsrl(dst, src, sa));
        }
    }

    /// 64-bit arithmetic right shift by immediate in 0..64.
    pub fn dsra_imm(&mut self, dst: Reg, src: Reg, sa: u32) {
        if sa >= 32 {
            self.put(mips::dsra32(dst, src, sa - 32));
        } else {
            self.put(mips::dsra(dst, src, sa));
        }
    }

    /// Register move in the 32-bit domain.
    pub fn move32(&mut self, dst: Reg, src: Reg) {
        self.put(mips::addu(dst, src, mips::ZERO));
    }

    /// Register move in the 64-bit domain.
    pub fn move64(&mut self, dst: Reg, src: Reg) {
        self.put(mips::daddu(dst, src, mips::ZERO));
    }
}

/// Branch-offset table built during MEASURE and read-only during EMIT.
///
/// Entries are native-instruction indices relative to the body start;
/// the final entry is the epilogue. EMIT adds the measured prologue
/// length when converting a table entry into a branch displacement.
pub struct Offsets {
    table: Vec<u32>,
    prologue_len: u32,
}

impl Offsets {
    pub fn new(prog_len: usize) -> Self {
        Self {
            table: vec![0; prog_len + 1],
            prologue_len: 0,
        }
    }

    /// Table slot that stands for the epilogue.
    pub fn epilogue_slot(&self) -> usize {
        self.table.len() - 1
    }

    pub fn record(&mut self, slot: usize, body_idx: u32) {
        self.table[slot] = body_idx;
    }

    pub fn get(&self, slot: usize) -> u32 {
        self.table[slot]
    }

    pub fn set_prologue_len(&mut self, len: u32) {
        self.prologue_len = len;
    }

    pub fn prologue_len(&self) -> u32 {
        self.prologue_len
    }

    /// Displacement from the emitter's current slot to `target_slot`,
    /// in instruction units relative to the delay slot.
    ///
    /// During MEASURE the table is still being filled, so the
    /// displacement is reported as zero; branches occupy the same number
    /// of slots either way. Range is checked only during EMIT, when the
    /// table is final.
    pub fn branch_off(&self, em: &Emitter, target_slot: usize) -> Result<i16, CompileError> {
        if em.is_measuring() {
            return Ok(0);
        }
        let disp =
            self.table[target_slot] as i64 + self.prologue_len as i64 - (em.idx() as i64 + 1);
        i16::try_from(disp).map_err(|_| CompileError::DisplacementOverflow {
            target: target_slot,
            displacement: disp,
        })
    }
}
