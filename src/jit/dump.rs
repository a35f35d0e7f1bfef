//! Decoder for the emitted instruction subset, used by the full dump
//! level. Anything outside the subset prints as a raw word.

fn rs(w: u32) -> u32 {
    (w >> 21) & 0x1f
}
fn rt(w: u32) -> u32 {
    (w >> 16) & 0x1f
}
fn rd(w: u32) -> u32 {
    (w >> 11) & 0x1f
}
fn sa(w: u32) -> u32 {
    (w >> 6) & 0x1f
}
fn imm(w: u32) -> i16 {
    w as u16 as i16
}

fn three(name: &str, a: u32, b: u32, c: u32) -> String {
    format!("{} ${}, ${}, ${}", name, a, b, c)
}

fn shift(name: &str, w: u32) -> String {
    format!("{} ${}, ${}, {}", name, rd(w), rt(w), sa(w))
}

fn mem(name: &str, w: u32) -> String {
    format!("{} ${}, {}(${})", name, rt(w), imm(w), rs(w))
}

fn branch2(name: &str, w: u32) -> String {
    format!("{} ${}, ${}, {}", name, rs(w), rt(w), imm(w))
}

fn branch1(name: &str, w: u32) -> String {
    format!("{} ${}, {}", name, rs(w), imm(w))
}

fn arith_imm(name: &str, w: u32) -> String {
    format!("{} ${}, ${}, {}", name, rt(w), rs(w), imm(w))
}

fn logic_imm(name: &str, w: u32) -> String {
    format!("{} ${}, ${}, {:#x}", name, rt(w), rs(w), w & 0xffff)
}

fn special(w: u32) -> String {
    let f = w & 0x3f;
    match f {
        0x00 if w == 0 => "nop".to_string(),
        0x00 => shift("sll", w),
        0x02 if rs(w) == 1 => shift("rotr", w),
        0x02 => shift("srl", w),
        0x03 => shift("sra", w),
        0x04 => three("sllv", rd(w), rt(w), rs(w)),
        0x06 => three("srlv", rd(w), rt(w), rs(w)),
        0x07 => three("srav", rd(w), rt(w), rs(w)),
        0x08 => format!("jr ${}", rs(w)),
        0x09 => format!("jalr ${}, ${}", rd(w), rs(w)),
        0x0a => three("movz", rd(w), rs(w), rt(w)),
        0x10 => format!("mfhi ${}", rd(w)),
        0x12 => format!("mflo ${}", rd(w)),
        0x14 => three("dsllv", rd(w), rt(w), rs(w)),
        0x16 => three("dsrlv", rd(w), rt(w), rs(w)),
        0x17 => three("dsrav", rd(w), rt(w), rs(w)),
        0x1b => format!("divu ${}, ${}", rs(w), rt(w)),
        0x1d => format!("dmultu ${}, ${}", rs(w), rt(w)),
        0x1f => format!("ddivu ${}, ${}", rs(w), rt(w)),
        0x21 => three("addu", rd(w), rs(w), rt(w)),
        0x23 => three("subu", rd(w), rs(w), rt(w)),
        0x24 => three("and", rd(w), rs(w), rt(w)),
        0x25 => three("or", rd(w), rs(w), rt(w)),
        0x26 => three("xor", rd(w), rs(w), rt(w)),
        0x2a => three("slt", rd(w), rs(w), rt(w)),
        0x2b => three("sltu", rd(w), rs(w), rt(w)),
        0x2d => three("daddu", rd(w), rs(w), rt(w)),
        0x2f => three("dsubu", rd(w), rs(w), rt(w)),
        0x38 => shift("dsll", w),
        0x3a => shift("dsrl", w),
        0x3b => shift("dsra", w),
        0x3c => format!("dsll32 ${}, ${}, {}", rd(w), rt(w), sa(w)),
        0x3e => format!("dsrl32 ${}, ${}, {}", rd(w), rt(w), sa(w)),
        0x3f => format!("dsra32 ${}, ${}, {}", rd(w), rt(w), sa(w)),
        _ => format!(".word {:#010x}", w),
    }
}

fn special3(w: u32) -> String {
    match (w & 0x3f, sa(w)) {
        (0x20, 0x02) => format!("wsbh ${}, ${}", rd(w), rt(w)),
        (0x24, 0x02) => format!("dsbh ${}, ${}", rd(w), rt(w)),
        (0x24, 0x05) => format!("dshd ${}, ${}", rd(w), rt(w)),
        (0x06, lsb) => format!(
            "dinsu ${}, ${}, {}, {}",
            rt(w),
            rs(w),
            lsb + 32,
            rd(w) + 1 - lsb
        ),
        _ => format!(".word {:#010x}", w),
    }
}

/// One decoded line for an instruction word.
pub fn mnemonic(w: u32) -> String {
    match w >> 26 {
        0x00 => special(w),
        0x01 if rt(w) == 0 => branch1("bltz", w),
        0x01 if rt(w) == 1 => branch1("bgez", w),
        0x04 if rs(w) == 0 && rt(w) == 0 => format!("b {}", imm(w)),
        0x04 => branch2("beq", w),
        0x05 => branch2("bne", w),
        0x06 => branch1("blez", w),
        0x07 => branch1("bgtz", w),
        0x09 => arith_imm("addiu", w),
        0x0b => arith_imm("sltiu", w),
        0x0c => logic_imm("andi", w),
        0x0d => logic_imm("ori", w),
        0x0e => logic_imm("xori", w),
        0x0f => format!("lui ${}, {:#x}", rt(w), w & 0xffff),
        0x19 => arith_imm("daddiu", w),
        0x1c if w & 0x3f == 0x02 => three("mul", rd(w), rs(w), rt(w)),
        0x1f => special3(w),
        0x23 => mem("lw", w),
        0x24 => mem("lbu", w),
        0x25 => mem("lhu", w),
        0x28 => mem("sb", w),
        0x29 => mem("sh", w),
        0x2b => mem("sw", w),
        0x30 => mem("ll", w),
        0x34 => mem("lld", w),
        0x37 => mem("ld", w),
        0x38 => mem("sc", w),
        0x3c => mem("scd", w),
        0x3f => mem("sd", w),
        _ => format!(".word {:#010x}", w),
    }
}
