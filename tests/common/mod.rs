//! A little-endian MIPS64 subset interpreter for exercising generated
//! code on the host. It models delay slots, HI/LO, and the
//! load-linked/store-conditional pair (always succeeding, as the runs
//! are single threaded). Runtime helper addresses are intercepted: when
//! control reaches a hooked address the closure runs against machine
//! state and control returns through `$ra`.

#![allow(dead_code)]

use std::collections::HashMap;

use pfjit::program::{RuntimeHooks, CTX_DATA_OFFSET, CTX_LEN_OFFSET};
use pfjit::TranslatedProgram;

/// Byte address of the first generated instruction.
pub const CODE_BASE: u64 = 0x10_0000;
/// Data memory window.
pub const ARENA_BASE: u64 = 0x20_0000;
pub const ARENA_LEN: usize = 0x10_0000;
/// Return address that ends the run.
pub const RA_SENTINEL: u64 = 0xdead_0000;

/// Fixed arena layout used by the tests.
pub const CTX_ADDR: u64 = ARENA_BASE + 0x10;
pub const PACKET_ADDR: u64 = ARENA_BASE + 0x100;

pub const HOOKS: RuntimeHooks = RuntimeHooks {
    load_word: 0x4000_0000,
    load_half: 0x4000_0040,
    load_byte: 0x4000_0080,
    packet_load: 0x4000_00c0,
    call_base: 0x5000_0000,
};

pub struct State {
    pub regs: [u64; 32],
    pub hi: u64,
    pub lo: u64,
    pub arena: Vec<u8>,
}

impl State {
    fn arena_index(&self, addr: u64, len: usize) -> usize {
        let idx = addr
            .checked_sub(ARENA_BASE)
            .unwrap_or_else(|| panic!("access below arena: {:#x}", addr)) as usize;
        assert!(idx + len <= self.arena.len(), "access past arena: {:#x}", addr);
        idx
    }

    pub fn read(&self, addr: u64, len: usize) -> u64 {
        let idx = self.arena_index(addr, len);
        let mut v = 0u64;
        for (i, b) in self.arena[idx..idx + len].iter().enumerate() {
            v |= (*b as u64) << (8 * i);
        }
        v
    }

    pub fn write(&mut self, addr: u64, len: usize, value: u64) {
        let idx = self.arena_index(addr, len);
        for i in 0..len {
            self.arena[idx + i] = (value >> (8 * i)) as u8;
        }
    }
}

type Hook = Box<dyn FnMut(&mut State)>;

pub struct Machine {
    pub st: State,
    code: Vec<u32>,
    hooks: HashMap<u64, Hook>,
}

fn sext32(x: u64) -> u64 {
    x as u32 as i32 as i64 as u64
}

impl Machine {
    pub fn new(words: Vec<u32>) -> Self {
        let mut st = State {
            regs: [0; 32],
            hi: 0,
            lo: 0,
            arena: vec![0; ARENA_LEN],
        };
        st.regs[29] = ARENA_BASE + ARENA_LEN as u64; // $sp
        st.regs[31] = RA_SENTINEL; // $ra
        Self {
            st,
            code: words,
            hooks: HashMap::new(),
        }
    }

    pub fn hook(&mut self, addr: u64, f: impl FnMut(&mut State) + 'static) {
        self.hooks.insert(addr, Box::new(f));
    }

    /// Lay out a packet and its context record, and set `$a0` to the
    /// context address.
    pub fn load_packet(&mut self, packet: &[u8]) {
        for (i, b) in packet.iter().enumerate() {
            self.st.arena[(PACKET_ADDR - ARENA_BASE) as usize + i] = *b;
        }
        self.st
            .write(CTX_ADDR + CTX_DATA_OFFSET as u64, 8, PACKET_ADDR);
        self.st
            .write(CTX_ADDR + CTX_LEN_OFFSET as u64, 4, packet.len() as u64);
        self.st.regs[4] = CTX_ADDR; // $a0
    }

    /// Install the standard packet helpers over the context layout.
    pub fn install_packet_helpers(&mut self) {
        for (addr, size) in [
            (HOOKS.load_word, 4usize),
            (HOOKS.load_half, 2),
            (HOOKS.load_byte, 1),
        ] {
            self.hook(addr, move |st| packet_fetch(st, size));
        }
        self.hook(HOOKS.packet_load, |st| {
            let size = st.regs[6] as usize; // $a2
            packet_fetch(st, size);
        });
    }

    /// Run from the code base until control returns, with a step limit
    /// so a broken branch cannot hang the tests. Returns `$v0`.
    pub fn run(&mut self) -> u64 {
        let mut pc = CODE_BASE;
        let mut next = pc + 4;
        let mut steps = 0u64;
        while pc != RA_SENTINEL {
            steps += 1;
            assert!(steps < 1_000_000, "runaway execution at pc {:#x}", pc);

            if self.hooks.contains_key(&pc) {
                let mut f = self.hooks.remove(&pc).unwrap();
                f(&mut self.st);
                self.hooks.insert(pc, f);
                pc = self.st.regs[31];
                next = pc.wrapping_add(4);
                continue;
            }

            let idx = ((pc - CODE_BASE) / 4) as usize;
            let w = *self
                .code
                .get(idx)
                .unwrap_or_else(|| panic!("fetch outside code: {:#x}", pc));
            let new_next = self.step(w, pc).unwrap_or(next + 4);
            pc = next;
            next = new_next;
        }
        self.st.regs[2] // $v0
    }

    /// Execute one instruction. Returns the address after the delay
    /// slot when the instruction transfers control.
    fn step(&mut self, w: u32, pc: u64) -> Option<u64> {
        let op = w >> 26;
        let rs = ((w >> 21) & 0x1f) as usize;
        let rt = ((w >> 16) & 0x1f) as usize;
        let rd = ((w >> 11) & 0x1f) as usize;
        let sa = (w >> 6) & 0x1f;
        let funct = w & 0x3f;
        let imm = w as u16 as i16;
        let vs = self.st.regs[rs];
        let vt = self.st.regs[rt];
        let ea = vs.wrapping_add(imm as i64 as u64);
        let branch_to = |disp: i16| pc.wrapping_add(4).wrapping_add((disp as i64 * 4) as u64);

        let mut taken: Option<u64> = None;
        match op {
            0x00 => match funct {
                0x00 => self.st.regs[rd] = sext32(vt << sa),
                0x02 if rs == 1 => self.st.regs[rd] = sext32((vt as u32).rotate_right(sa) as u64),
                0x02 => self.st.regs[rd] = sext32(((vt as u32) >> sa) as u64),
                0x03 => self.st.regs[rd] = sext32((((vt as u32) as i32) >> sa) as u32 as u64),
                0x04 => self.st.regs[rd] = sext32(vt << (vs & 31)),
                0x06 => self.st.regs[rd] = sext32(((vt as u32) >> (vs & 31)) as u64),
                0x07 => self.st.regs[rd] = sext32((((vt as u32) as i32) >> (vs & 31)) as u32 as u64),
                0x08 => taken = Some(vs),
                0x09 => {
                    self.st.regs[rd] = pc.wrapping_add(8);
                    taken = Some(vs);
                }
                0x0a => {
                    if vt == 0 {
                        self.st.regs[rd] = vs;
                    }
                }
                0x0b => {
                    if vt != 0 {
                        self.st.regs[rd] = vs;
                    }
                }
                0x10 => self.st.regs[rd] = self.st.hi,
                0x12 => self.st.regs[rd] = self.st.lo,
                0x14 => self.st.regs[rd] = vt << (vs & 63),
                0x16 => self.st.regs[rd] = vt >> (vs & 63),
                0x17 => self.st.regs[rd] = ((vt as i64) >> (vs & 63)) as u64,
                0x19 => {
                    let p = (vs as u32 as u64) * (vt as u32 as u64);
                    self.st.lo = sext32(p);
                    self.st.hi = sext32(p >> 32);
                }
                0x1b => {
                    let (a, b) = (vs as u32, vt as u32);
                    if b != 0 {
                        self.st.lo = sext32((a / b) as u64);
                        self.st.hi = sext32((a % b) as u64);
                    }
                }
                0x1d => {
                    let p = (vs as u128) * (vt as u128);
                    self.st.lo = p as u64;
                    self.st.hi = (p >> 64) as u64;
                }
                0x1f => {
                    if vt != 0 {
                        self.st.lo = vs / vt;
                        self.st.hi = vs % vt;
                    }
                }
                0x21 => self.st.regs[rd] = sext32(vs.wrapping_add(vt)),
                0x23 => self.st.regs[rd] = sext32(vs.wrapping_sub(vt)),
                0x24 => self.st.regs[rd] = vs & vt,
                0x25 => self.st.regs[rd] = vs | vt,
                0x26 => self.st.regs[rd] = vs ^ vt,
                0x2a => self.st.regs[rd] = ((vs as i64) < (vt as i64)) as u64,
                0x2b => self.st.regs[rd] = (vs < vt) as u64,
                0x2d => self.st.regs[rd] = vs.wrapping_add(vt),
                0x2f => self.st.regs[rd] = vs.wrapping_sub(vt),
                0x38 => self.st.regs[rd] = vt << sa,
                0x3a => self.st.regs[rd] = vt >> sa,
                0x3b => self.st.regs[rd] = ((vt as i64) >> sa) as u64,
                0x3c => self.st.regs[rd] = vt << (sa + 32),
                0x3e => self.st.regs[rd] = vt >> (sa + 32),
                0x3f => self.st.regs[rd] = ((vt as i64) >> (sa + 32)) as u64,
                _ => panic!("unimplemented special {:#x} at {:#x}", funct, pc),
            },
            0x01 => match rt {
                0 => {
                    if (vs as i64) < 0 {
                        taken = Some(branch_to(imm));
                    }
                }
                1 => {
                    if (vs as i64) >= 0 {
                        taken = Some(branch_to(imm));
                    }
                }
                _ => panic!("unimplemented regimm {:#x} at {:#x}", rt, pc),
            },
            0x04 => {
                if vs == vt {
                    taken = Some(branch_to(imm));
                }
            }
            0x05 => {
                if vs != vt {
                    taken = Some(branch_to(imm));
                }
            }
            0x06 => {
                if (vs as i64) <= 0 {
                    taken = Some(branch_to(imm));
                }
            }
            0x07 => {
                if (vs as i64) > 0 {
                    taken = Some(branch_to(imm));
                }
            }
            0x09 => self.st.regs[rt] = sext32(vs.wrapping_add(imm as i64 as u64)),
            0x0a => self.st.regs[rt] = ((vs as i64) < imm as i64) as u64,
            0x0b => self.st.regs[rt] = (vs < imm as i64 as u64) as u64,
            0x0c => self.st.regs[rt] = vs & (w as u16 as u64),
            0x0d => self.st.regs[rt] = vs | (w as u16 as u64),
            0x0e => self.st.regs[rt] = vs ^ (w as u16 as u64),
            0x0f => self.st.regs[rt] = sext32((w as u16 as u64) << 16),
            0x19 => self.st.regs[rt] = vs.wrapping_add(imm as i64 as u64),
            0x1c if funct == 0x02 => {
                self.st.regs[rd] = sext32((vs as i32).wrapping_mul(vt as i32) as u32 as u64)
            }
            0x1f => match (funct, sa) {
                (0x20, 0x02) => {
                    let v = vt as u32;
                    self.st.regs[rd] =
                        sext32((((v & 0x00ff_00ff) << 8) | ((v >> 8) & 0x00ff_00ff)) as u64);
                }
                (0x24, 0x02) => {
                    self.st.regs[rd] = ((vt & 0x00ff_00ff_00ff_00ff) << 8)
                        | ((vt >> 8) & 0x00ff_00ff_00ff_00ff);
                }
                (0x24, 0x05) => {
                    self.st.regs[rd] = ((vt & 0xffff) << 48)
                        | (((vt >> 16) & 0xffff) << 32)
                        | (((vt >> 32) & 0xffff) << 16)
                        | (vt >> 48);
                }
                (0x06, lsb) => {
                    let pos = lsb + 32;
                    let size = rd as u32 + 1 - lsb;
                    let mask = (1u64 << size) - 1;
                    let keep = !(mask << pos);
                    self.st.regs[rt] = (vt & keep) | ((vs & mask) << pos);
                }
                _ => panic!("unimplemented special3 {:#x}/{} at {:#x}", funct, sa, pc),
            },
            0x20 => self.st.regs[rt] = self.st.read(ea, 1) as i8 as i64 as u64,
            0x21 => self.st.regs[rt] = self.st.read(ea, 2) as i16 as i64 as u64,
            0x23 | 0x30 => self.st.regs[rt] = sext32(self.st.read(ea, 4)),
            0x24 => self.st.regs[rt] = self.st.read(ea, 1),
            0x25 => self.st.regs[rt] = self.st.read(ea, 2),
            0x37 | 0x34 => self.st.regs[rt] = self.st.read(ea, 8),
            0x28 => self.st.write(ea, 1, vt),
            0x29 => self.st.write(ea, 2, vt),
            0x2b => self.st.write(ea, 4, vt),
            0x3f => self.st.write(ea, 8, vt),
            0x38 => {
                self.st.write(ea, 4, vt);
                self.st.regs[rt] = 1; // store-conditional always succeeds here
            }
            0x3c => {
                self.st.write(ea, 8, vt);
                self.st.regs[rt] = 1;
            }
            _ => panic!("unimplemented opcode {:#x} at {:#x}", op, pc),
        }
        self.st.regs[0] = 0; // $zero stays zero
        taken
    }
}

/// Shared helper body: bounds-checked network-order packet fetch
/// against the context record in `$a0`, offset in `$a1`, result status
/// in `$v0` and value in `$v1`.
fn packet_fetch(st: &mut State, size: usize) {
    let ctx = st.regs[4]; // $a0
    let off = st.regs[5] as u32 as i32 as i64; // $a1, 32-bit offset
    let data = st.read(ctx + CTX_DATA_OFFSET as u64, 8);
    let len = st.read(ctx + CTX_LEN_OFFSET as u64, 4) as i64;

    if off < 0 || off + size as i64 > len {
        st.regs[2] = 1; // status: out of bounds
        st.regs[3] = 0;
        return;
    }
    let mut v = 0u64;
    for i in 0..size {
        v = (v << 8) | st.read(data + off as u64 + i as u64, 1); // network order
    }
    st.regs[2] = 0;
    st.regs[3] = v;
}

/// Convenience: build a machine over a translation's words.
pub fn machine_for(t: &TranslatedProgram) -> Machine {
    Machine::new(t.words.clone())
}
