//! Resource-usage flags and stack-frame construction.
//!
//! The translators record which registers and facilities a program
//! touches; the frame builder turns the final flag set into a stack
//! layout and emits the prologue/epilogue pair. The epilogue restores
//! in the mirror image of the prologue's saves, and a program that
//! needs nothing gets no `$sp` adjustment at all.

use bitflags::bitflags;

use super::emitter::Emitter;
use super::mips::{self, Reg};
use super::tracker::ValueClass;

/// Fixed register assignments for the classic accumulator form.
pub mod classic_regs {
    use super::super::mips::{Reg, S3, S4, S5, S6, T4, T5, V0};

    /// Accumulator.
    pub const A: Reg = S3;
    /// Index register.
    pub const X: Reg = S4;
    /// Packet-context pointer.
    pub const CTX: Reg = S5;
    /// Base of the scratch-cell area.
    pub const M: Reg = S6;
    pub const TMP1: Reg = T4;
    pub const TMP2: Reg = T5;
    /// Filter result.
    pub const RET: Reg = V0;
}

bitflags! {
    /// Resources a classic program was seen to use.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClassicFlags: u8 {
        const SEEN_A = 1 << 0;
        const SEEN_X = 1 << 1;
        const SEEN_CTX = 1 << 2;
        const SEEN_MEM = 1 << 3;
        const SEEN_CALL = 1 << 4;
    }
}

/// Saved callee registers in ascending register-number order, keyed by
/// the flag that makes each one live.
const CLASSIC_SAVES: [(ClassicFlags, Reg); 4] = [
    (ClassicFlags::SEEN_A, classic_regs::A),
    (ClassicFlags::SEEN_X, classic_regs::X),
    (ClassicFlags::SEEN_CTX, classic_regs::CTX),
    (ClassicFlags::SEEN_MEM, classic_regs::M),
];

/// Number of 32-bit scratch cells in a classic frame.
const CLASSIC_SCRATCH_BYTES: u32 = 4 * crate::program::SCRATCH_WORDS as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassicFrame {
    /// Total `$sp` adjustment, bytes, 8-byte aligned.
    pub stack_size: u32,
}

pub fn classic_frame(flags: ClassicFlags) -> ClassicFrame {
    let mut size = 0u32;
    for (flag, _) in CLASSIC_SAVES {
        if flags.contains(flag) {
            size += 4;
        }
    }
    if flags.contains(ClassicFlags::SEEN_CALL) {
        size += 4;
    }
    if flags.contains(ClassicFlags::SEEN_MEM) {
        size += CLASSIC_SCRATCH_BYTES;
    }
    ClassicFrame {
        stack_size: (size + 7) & !7,
    }
}

pub fn emit_classic_prologue(em: &mut Emitter, flags: ClassicFlags, frame: ClassicFrame) {
    if frame.stack_size > 0 {
        em.put(mips::addiu(mips::SP, mips::SP, -(frame.stack_size as i16)));
    }

    let mut real_off: i16 = 0;
    for (flag, reg) in CLASSIC_SAVES {
        if flags.contains(flag) {
            em.put(mips::sw(reg, real_off, mips::SP));
            real_off += 4;
        }
    }
    if flags.contains(ClassicFlags::SEEN_CALL) {
        em.put(mips::sw(mips::RA, real_off, mips::SP));
        real_off += 4;
    }
    // Scratch cells sit above the saves, 8-byte aligned.
    if flags.contains(ClassicFlags::SEEN_MEM) {
        if real_off % 8 != 0 {
            real_off += 4;
        }
        em.put(mips::addiu(classic_regs::M, mips::SP, real_off));
    }

    if flags.contains(ClassicFlags::SEEN_CTX) {
        em.move32(classic_regs::CTX, mips::A0);
    }
    if flags.contains(ClassicFlags::SEEN_X) {
        em.move32(classic_regs::X, mips::ZERO);
    }
    if flags.contains(ClassicFlags::SEEN_A) {
        em.move32(classic_regs::A, mips::ZERO);
    }
}

pub fn emit_classic_epilogue(em: &mut Emitter, flags: ClassicFlags, frame: ClassicFrame) {
    let mut real_off: i16 = 0;
    for (flag, reg) in CLASSIC_SAVES {
        if flags.contains(flag) {
            em.put(mips::lw(reg, real_off, mips::SP));
            real_off += 4;
        }
    }
    if flags.contains(ClassicFlags::SEEN_CALL) {
        em.put(mips::lw(mips::RA, real_off, mips::SP));
    }

    em.put(mips::jr(mips::RA));
    // the stack release rides the delay slot
    if frame.stack_size > 0 {
        em.put(mips::addiu(mips::SP, mips::SP, frame.stack_size as i16));
    } else {
        em.put(mips::nop());
    }
}

bitflags! {
    /// Resources an extended program was seen to use.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExtFlags: u8 {
        const SAVE_S0 = 1 << 0;
        const SAVE_S1 = 1 << 1;
        const SAVE_S2 = 1 << 2;
        const SAVE_S3 = 1 << 3;
        const SAVE_RA = 1 << 4;
        const SEEN_FP = 1 << 5;
    }
}

/// Save slots in store order (top of frame downward).
const EXT_SAVES: [(ExtFlags, Reg); 5] = [
    (ExtFlags::SAVE_RA, mips::RA),
    (ExtFlags::SAVE_S0, mips::S0),
    (ExtFlags::SAVE_S1, mips::S1),
    (ExtFlags::SAVE_S2, mips::S2),
    (ExtFlags::SAVE_S3, mips::S3),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtFrame {
    /// Total `$sp` adjustment, bytes, 16-byte aligned.
    pub stack_size: i32,
}

/// Extended stack frame:
///
/// ```text
///  entry $sp ->  +------------------------+
///                |  $ra       (optional)  |
///                |  $s0..$s3  (optional)  |
///                +------------------------+ <- frame pointer (r10)
///                |  512-byte local area   |
///                |  (only when r10 seen)  |
///      $sp ->    +------------------------+
/// ```
pub fn ext_frame(flags: ExtFlags) -> ExtFrame {
    let mut size = 0i32;
    for (flag, _) in EXT_SAVES {
        if flags.contains(flag) {
            size += 8;
        }
    }
    if flags.contains(ExtFlags::SEEN_FP) {
        size += crate::program::EXT_STACK_SIZE;
    }
    ExtFrame {
        stack_size: (size + 15) & !15,
    }
}

pub fn emit_ext_prologue(em: &mut Emitter, flags: ExtFlags, frame: ExtFrame) {
    if frame.stack_size == 0 {
        return;
    }
    em.put(mips::daddiu(mips::SP, mips::SP, -(frame.stack_size as i16)));

    let mut store_offset = frame.stack_size as i16 - 8;
    for (flag, reg) in EXT_SAVES {
        if flags.contains(flag) {
            em.put(mips::sd(reg, store_offset, mips::SP));
            store_offset -= 8;
        }
    }
}

pub fn emit_ext_epilogue(em: &mut Emitter, flags: ExtFlags, frame: ExtFrame, r0_class: ValueClass) {
    if r0_class == ValueClass::ZeroExt32 {
        // Don't let a zero-extended value escape.
        em.put(mips::sll(mips::V0, mips::V0, 0));
    }

    let mut store_offset = frame.stack_size as i16 - 8;
    for (flag, reg) in EXT_SAVES {
        if flags.contains(flag) {
            em.put(mips::ld(reg, store_offset, mips::SP));
            store_offset -= 8;
        }
    }

    em.put(mips::jr(mips::RA));
    if frame.stack_size > 0 {
        em.put(mips::daddiu(mips::SP, mips::SP, frame.stack_size as i16));
    } else {
        em.put(mips::nop());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(f: impl FnOnce(&mut Emitter)) -> Vec<u32> {
        let mut em = Emitter::writing(32);
        f(&mut em);
        em.into_buffer().unwrap().into_words()
    }

    #[test]
    fn test_classic_frame_sizes() {
        assert_eq!(classic_frame(ClassicFlags::empty()).stack_size, 0);
        assert_eq!(classic_frame(ClassicFlags::SEEN_A).stack_size, 8);
        let all = ClassicFlags::SEEN_A
            | ClassicFlags::SEEN_X
            | ClassicFlags::SEEN_CTX
            | ClassicFlags::SEEN_MEM
            | ClassicFlags::SEEN_CALL;
        // 4 saves + ra + 64 scratch = 84, aligned to 88
        assert_eq!(classic_frame(all).stack_size, 88);
    }

    #[test]
    fn test_classic_empty_frame_is_empty() {
        let frame = classic_frame(ClassicFlags::empty());
        assert!(words(|em| emit_classic_prologue(em, ClassicFlags::empty(), frame)).is_empty());
        assert_eq!(
            words(|em| emit_classic_epilogue(em, ClassicFlags::empty(), frame)),
            vec![mips::jr(mips::RA), mips::nop()]
        );
    }

    #[test]
    fn test_classic_prologue_epilogue_mirror() {
        let flags = ClassicFlags::SEEN_A | ClassicFlags::SEEN_CTX | ClassicFlags::SEEN_CALL;
        let frame = classic_frame(flags);
        assert_eq!(frame.stack_size, 16);

        let pro = words(|em| emit_classic_prologue(em, flags, frame));
        assert_eq!(pro[0], mips::addiu(mips::SP, mips::SP, -16));
        assert_eq!(pro[1], mips::sw(classic_regs::A, 0, mips::SP));
        assert_eq!(pro[2], mips::sw(classic_regs::CTX, 4, mips::SP));
        assert_eq!(pro[3], mips::sw(mips::RA, 8, mips::SP));
        // ctx then accumulator clear
        assert_eq!(pro[4], mips::addu(classic_regs::CTX, mips::A0, mips::ZERO));
        assert_eq!(pro[5], mips::addu(classic_regs::A, mips::ZERO, mips::ZERO));

        let epi = words(|em| emit_classic_epilogue(em, flags, frame));
        assert_eq!(
            epi,
            vec![
                mips::lw(classic_regs::A, 0, mips::SP),
                mips::lw(classic_regs::CTX, 4, mips::SP),
                mips::lw(mips::RA, 8, mips::SP),
                mips::jr(mips::RA),
                mips::addiu(mips::SP, mips::SP, 16),
            ]
        );
    }

    #[test]
    fn test_classic_scratch_base_aligned() {
        let flags = ClassicFlags::SEEN_A | ClassicFlags::SEEN_MEM;
        let frame = classic_frame(flags);
        // 2 saves (8) + 64 scratch = 72
        assert_eq!(frame.stack_size, 72);
        let pro = words(|em| emit_classic_prologue(em, flags, frame));
        // saves at 0 and 4, scratch base at 8
        assert!(pro.contains(&mips::addiu(classic_regs::M, mips::SP, 8)));
    }

    #[test]
    fn test_ext_frame_sizes() {
        assert_eq!(ext_frame(ExtFlags::empty()).stack_size, 0);
        assert_eq!(ext_frame(ExtFlags::SAVE_RA).stack_size, 16);
        assert_eq!(ext_frame(ExtFlags::SEEN_FP).stack_size, 512);
        assert_eq!(
            ext_frame(ExtFlags::SAVE_RA | ExtFlags::SAVE_S0 | ExtFlags::SEEN_FP).stack_size,
            528
        );
    }

    #[test]
    fn test_ext_empty_frame() {
        let frame = ext_frame(ExtFlags::empty());
        assert!(words(|em| emit_ext_prologue(em, ExtFlags::empty(), frame)).is_empty());
        assert_eq!(
            words(|em| emit_ext_epilogue(
                em,
                ExtFlags::empty(),
                frame,
                ValueClass::Unknown
            )),
            vec![mips::jr(mips::RA), mips::nop()]
        );
    }

    #[test]
    fn test_ext_saves_descending() {
        let flags = ExtFlags::SAVE_RA | ExtFlags::SAVE_S0 | ExtFlags::SAVE_S1;
        let frame = ext_frame(flags);
        assert_eq!(frame.stack_size, 32);
        let pro = words(|em| emit_ext_prologue(em, flags, frame));
        assert_eq!(
            pro,
            vec![
                mips::daddiu(mips::SP, mips::SP, -32),
                mips::sd(mips::RA, 24, mips::SP),
                mips::sd(mips::S0, 16, mips::SP),
                mips::sd(mips::S1, 8, mips::SP),
            ]
        );
        let epi = words(|em| emit_ext_epilogue(em, flags, frame, ValueClass::Full64));
        assert_eq!(
            epi,
            vec![
                mips::ld(mips::RA, 24, mips::SP),
                mips::ld(mips::S0, 16, mips::SP),
                mips::ld(mips::S1, 8, mips::SP),
                mips::jr(mips::RA),
                mips::daddiu(mips::SP, mips::SP, 32),
            ]
        );
    }

    #[test]
    fn test_ext_epilogue_sign_extends_zero_ext_result() {
        let frame = ext_frame(ExtFlags::empty());
        let epi = words(|em| emit_ext_epilogue(em, ExtFlags::empty(), frame, ValueClass::ZeroExt32));
        assert_eq!(epi[0], mips::sll(mips::V0, mips::V0, 0));
    }
}
