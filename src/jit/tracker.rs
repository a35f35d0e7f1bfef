//! Register value-class tracking for the extended form.
//!
//! The extended machine wants zero-extended 32-bit values while the
//! 64-bit MIPS ISA canonically sign-extends them. Tracking what is
//! known about every register at every instruction lets the selector
//! omit extension operations that would otherwise be needed on each
//! 32-bit op.
//!
//! The walk follows fall-through edges first, then repeatedly picks the
//! first conditional branch whose taken edge is unexplored and follows
//! it once. Instructions never visited by any walk are dead and emit no
//! code. Merge points are not reconciled; a class can only err toward
//! the conservative states that force an extension.

use bitflags::bitflags;

use crate::error::CompileError;
use crate::program::{op, ExtInsn, EXT_REG_COUNT};

/// What is known about the value held in a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueClass {
    /// Uninitialized.
    #[default]
    Unknown,
    /// Not known to be 32-bit compatible.
    Full64,
    /// 32-bit compatible, no truncation needed for 64-bit ops.
    Compat32,
    /// 32-bit compatible, needs truncation for 64-bit ops.
    Narrow32,
    /// 32-bit zero extended.
    ZeroExt32,
    /// 32-bit, no sign or zero extension needed.
    NonNeg32,
}

bitflags! {
    /// Which control-flow edges have reached an instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Visit: u8 {
        const FALL_THROUGH = 1 << 0;
        const BRANCH_TAKEN = 1 << 1;
    }
}

impl Visit {
    fn done(self) -> bool {
        self.contains(Visit::FALL_THROUGH | Visit::BRANCH_TAKEN)
    }
}

type RegState = [ValueClass; EXT_REG_COUNT];

/// Per-(instruction, register) value classes plus visit states.
///
/// Row `i` holds the classes on entry to instruction `i`; the final row
/// holds the state at program exit, which the epilogue consults for the
/// return register.
pub struct ValueTable {
    classes: Vec<RegState>,
    visits: Vec<Visit>,
}

impl ValueTable {
    /// Class of `reg` on entry to instruction `index` (or at exit, for
    /// `index == prog.len()`).
    pub fn class(&self, index: usize, reg: u8) -> ValueClass {
        self.classes[index][reg as usize]
    }

    /// Was the instruction reached by any walk? Unvisited instructions
    /// are dead code.
    pub fn visited(&self, index: usize) -> bool {
        !self.visits[index].is_empty()
    }
}

fn set_class(state: &mut RegState, reg: u8, class: ValueClass) {
    state[reg as usize] = class;
}

/// Walk from `start_idx` with the given entry state, updating classes
/// and visit marks until an exit instruction or the end of the program.
/// At most one branch-taken edge is consumed per walk.
fn propagate_range(
    prog: &[ExtInsn],
    classes: &mut [RegState],
    visits: &mut [Visit],
    entry: RegState,
    start_idx: usize,
    mut follow_taken: bool,
    budget: &mut usize,
) -> Result<(), CompileError> {
    let len = prog.len();
    let mut state = entry;
    let mut idx = start_idx;

    while idx < len {
        if *budget == 0 {
            // Verified programs are acyclic apart from conditional
            // fall-through edges; running out of budget means the input
            // loops.
            return Err(CompileError::MalformedInput {
                index: idx,
                reason: "control flow does not terminate",
            });
        }
        *budget -= 1;

        classes[idx] = state;
        let insn = &prog[idx];

        match op::class(insn.code) {
            op::ALU => {
                match op::alu_op(insn.code) {
                    op::ADD | op::SUB | op::MUL | op::DIV | op::OR | op::AND | op::LSH
                    | op::RSH | op::NEG | op::MOD | op::XOR | op::ARSH => {
                        set_class(&mut state, insn.dst, ValueClass::Narrow32);
                    }
                    op::MOV => {
                        if op::src(insn.code) != 0 {
                            set_class(&mut state, insn.dst, ValueClass::Narrow32);
                        } else if insn.imm >= 0 {
                            set_class(&mut state, insn.dst, ValueClass::NonNeg32);
                        } else {
                            set_class(&mut state, insn.dst, ValueClass::Narrow32);
                        }
                    }
                    op::END => {
                        let class = match insn.imm {
                            64 => ValueClass::Full64,
                            32 => ValueClass::Narrow32,
                            _ => ValueClass::NonNeg32,
                        };
                        set_class(&mut state, insn.dst, class);
                    }
                    _ => {}
                }
                visits[idx] |= Visit::FALL_THROUGH | Visit::BRANCH_TAKEN;
            }
            op::ALU64 => {
                match op::alu_op(insn.code) {
                    op::MOV => {
                        if op::src(insn.code) != 0 {
                            set_class(&mut state, insn.dst, ValueClass::Full64);
                        } else if insn.imm >= 0 {
                            set_class(&mut state, insn.dst, ValueClass::NonNeg32);
                        } else {
                            set_class(&mut state, insn.dst, ValueClass::Compat32);
                        }
                    }
                    _ => {
                        set_class(&mut state, insn.dst, ValueClass::Full64);
                    }
                }
                visits[idx] |= Visit::FALL_THROUGH | Visit::BRANCH_TAKEN;
            }
            op::LD => {
                match op::size(insn.code) {
                    op::DW => {
                        if op::mode(insn.code) == op::IMM {
                            if idx + 1 >= len {
                                return Err(CompileError::MalformedInput {
                                    index: idx,
                                    reason: "truncated wide immediate",
                                });
                            }
                            let val = (insn.imm as u32 as u64
                                | ((prog[idx + 1].imm as u64) << 32))
                                as i64;
                            let class = if val > 0 && val <= i32::MAX as i64 {
                                ValueClass::NonNeg32
                            } else if val >= i32::MIN as i64 && val <= i32::MAX as i64 {
                                ValueClass::Compat32
                            } else {
                                ValueClass::Full64
                            };
                            set_class(&mut state, insn.dst, class);
                            visits[idx] |= Visit::FALL_THROUGH | Visit::BRANCH_TAKEN;
                            // second slot of the pair carries no code
                            // and stays unvisited
                            idx += 2;
                            continue;
                        }
                        set_class(&mut state, insn.dst, ValueClass::Full64);
                    }
                    op::B | op::H => {
                        set_class(&mut state, insn.dst, ValueClass::NonNeg32);
                    }
                    _ => {
                        set_class(&mut state, insn.dst, ValueClass::Narrow32);
                    }
                }
                visits[idx] |= Visit::FALL_THROUGH | Visit::BRANCH_TAKEN;
            }
            op::LDX => {
                let class = match op::size(insn.code) {
                    op::DW => ValueClass::Full64,
                    op::B | op::H => ValueClass::NonNeg32,
                    _ => ValueClass::Narrow32,
                };
                set_class(&mut state, insn.dst, class);
                visits[idx] |= Visit::FALL_THROUGH | Visit::BRANCH_TAKEN;
            }
            op::JMP => match op::alu_op(insn.code) {
                op::EXIT => {
                    visits[idx] |= Visit::FALL_THROUGH | Visit::BRANCH_TAKEN;
                    classes[len] = state;
                    return Ok(());
                }
                op::JA => {
                    visits[idx] |= Visit::FALL_THROUGH | Visit::BRANCH_TAKEN;
                    let target = idx as i64 + insn.off as i64 + 1;
                    if target < 0 || target > len as i64 {
                        return Err(CompileError::MalformedInput {
                            index: idx,
                            reason: "jump target out of range",
                        });
                    }
                    idx = target as usize;
                    continue;
                }
                op::JEQ | op::JGT | op::JGE | op::JSET | op::JNE | op::JSGT | op::JSGE => {
                    if follow_taken {
                        visits[idx] |= Visit::BRANCH_TAKEN;
                        follow_taken = false;
                        let target = idx as i64 + insn.off as i64 + 1;
                        if target < 0 || target > len as i64 {
                            return Err(CompileError::MalformedInput {
                                index: idx,
                                reason: "jump target out of range",
                            });
                        }
                        idx = target as usize;
                        continue;
                    } else {
                        visits[idx] |= Visit::FALL_THROUGH;
                    }
                }
                op::CALL => {
                    // Helper calls clobber the return and argument registers.
                    for reg in 0..=5 {
                        set_class(&mut state, reg, ValueClass::Full64);
                    }
                    visits[idx] |= Visit::FALL_THROUGH | Visit::BRANCH_TAKEN;
                }
                _ => {
                    visits[idx] |= Visit::FALL_THROUGH | Visit::BRANCH_TAKEN;
                }
            },
            _ => {
                visits[idx] |= Visit::FALL_THROUGH | Visit::BRANCH_TAKEN;
            }
        }

        idx += 1;
    }
    Ok(())
}

/// Build the value-class table for a program.
pub fn propagate(prog: &[ExtInsn]) -> Result<ValueTable, CompileError> {
    let len = prog.len();
    for (i, insn) in prog.iter().enumerate() {
        if insn.dst as usize >= EXT_REG_COUNT || insn.src as usize >= EXT_REG_COUNT {
            return Err(CompileError::MalformedInput {
                index: i,
                reason: "bad register",
            });
        }
    }
    let mut classes = vec![RegState::default(); len + 1];
    let mut visits = vec![Visit::empty(); len];

    // Upon entry the argument registers hold arbitrary 64-bit values.
    let mut entry = RegState::default();
    for reg in 1..=5 {
        set_class(&mut entry, reg, ValueClass::Full64);
    }

    // Each restart retires one branch edge and may re-walk the whole
    // tail, so an acyclic branch-dense program needs up to len*(len+1)
    // steps. Only a genuine cycle can exceed this.
    let mut budget = len.saturating_mul(len.saturating_add(2)) + 16;
    propagate_range(prog, &mut classes, &mut visits, entry, 0, false, &mut budget)?;

    // Repeatedly find the first conditional branch with an unexplored
    // taken edge and follow it; each pass retires one edge.
    'restart: loop {
        for i in 0..len {
            let v = visits[i];
            if v.is_empty() || v.done() {
                continue;
            }
            let follow_taken = v == Visit::FALL_THROUGH;
            let state = classes[i];
            propagate_range(
                prog,
                &mut classes,
                &mut visits,
                state,
                i,
                follow_taken,
                &mut budget,
            )?;
            continue 'restart;
        }
        break;
    }

    Ok(ValueTable { classes, visits })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::op;

    fn alu64_mov_imm(dst: u8, imm: i32) -> ExtInsn {
        ExtInsn::new(op::ALU64 | op::MOV | op::K, dst, 0, 0, imm)
    }

    fn exit() -> ExtInsn {
        ExtInsn::new(op::JMP | op::EXIT, 0, 0, 0, 0)
    }

    #[test]
    fn test_straight_line_classes() {
        let prog = vec![
            alu64_mov_imm(0, 7),
            alu64_mov_imm(1, -7),
            ExtInsn::new(op::ALU64 | op::ADD | op::X, 0, 1, 0, 0),
            exit(),
        ];
        let t = propagate(&prog).unwrap();
        assert_eq!(t.class(0, 1), ValueClass::Full64); // argument on entry
        assert_eq!(t.class(1, 0), ValueClass::NonNeg32); // imm 7 >= 0
        assert_eq!(t.class(2, 1), ValueClass::Compat32); // imm -7
        assert_eq!(t.class(3, 0), ValueClass::Full64); // after 64-bit add
        assert_eq!(t.class(4, 0), ValueClass::Full64); // exit state
        for i in 0..4 {
            assert!(t.visited(i));
        }
    }

    #[test]
    fn test_alu32_narrows() {
        let prog = vec![
            alu64_mov_imm(2, 5),
            ExtInsn::new(op::ALU | op::ADD | op::K, 2, 0, 0, 1),
            exit(),
        ];
        let t = propagate(&prog).unwrap();
        assert_eq!(t.class(2, 2), ValueClass::Narrow32);
    }

    #[test]
    fn test_dead_code_after_ja() {
        let prog = vec![
            ExtInsn::new(op::JMP | op::JA, 0, 0, 1, 0), // skips next
            alu64_mov_imm(0, 9),                        // dead
            alu64_mov_imm(0, 3),
            exit(),
        ];
        let t = propagate(&prog).unwrap();
        assert!(t.visited(0));
        assert!(!t.visited(1));
        assert!(t.visited(2));
    }

    #[test]
    fn test_both_edges_followed() {
        let prog = vec![
            alu64_mov_imm(0, 0),
            ExtInsn::new(op::JMP | op::JEQ | op::K, 1, 0, 1, 0), // over next
            alu64_mov_imm(0, 1),
            exit(),
        ];
        let t = propagate(&prog).unwrap();
        for i in 0..4 {
            assert!(t.visited(i), "instruction {} not visited", i);
        }
    }

    #[test]
    fn test_wide_imm_classes() {
        let lo = 0x9abc_def0u32 as i32;
        let prog = vec![
            ExtInsn::new(op::LD | op::DW | op::IMM, 3, 0, 0, lo),
            ExtInsn::new(0, 0, 0, 0, 0x1234_5678),
            exit(),
        ];
        let t = propagate(&prog).unwrap();
        // value needs all 64 bits
        assert_eq!(t.class(2, 3), ValueClass::Full64);
        // second slot of the pair is never visited
        assert!(!t.visited(1));
    }

    #[test]
    fn test_call_clobbers_args() {
        let prog = vec![
            alu64_mov_imm(1, 1),
            ExtInsn::new(op::JMP | op::CALL, 0, 0, 0, 4),
            exit(),
        ];
        let t = propagate(&prog).unwrap();
        assert_eq!(t.class(2, 0), ValueClass::Full64);
        assert_eq!(t.class(2, 1), ValueClass::Full64);
    }

    #[test]
    fn test_branch_dense_program_accepted() {
        // every instruction but the exit is a conditional; each taken
        // edge forces a restart that re-walks the tail
        let mut prog: Vec<ExtInsn> = (0..12)
            .map(|_| ExtInsn::new(op::JMP | op::JEQ | op::K, 0, 0, 0, 0))
            .collect();
        prog.push(exit());
        let t = propagate(&prog).unwrap();
        for i in 0..prog.len() {
            assert!(t.visited(i), "instruction {} not visited", i);
        }
    }

    #[test]
    fn test_bad_register_rejected() {
        let prog = vec![alu64_mov_imm(11, 1), exit()];
        assert!(matches!(
            propagate(&prog),
            Err(CompileError::MalformedInput { index: 0, .. })
        ));
    }

    #[test]
    fn test_infinite_loop_rejected() {
        // ja -1 jumps to itself forever
        let prog = vec![ExtInsn::new(op::JMP | op::JA, 0, 0, -1, 0), exit()];
        match propagate(&prog) {
            Err(CompileError::MalformedInput { .. }) => {}
            other => panic!("expected malformed input, got {:?}", other.map(|_| ())),
        }
    }
}
