//! Multi-pass compilation driver.
//!
//! Translation runs the body selector twice. MEASURE walks the program
//! with no output buffer, recording per-instruction offsets and
//! discovering which registers and stack areas the program touches.
//! LAYOUT sizes the frame from those flags and measures the prologue
//! and epilogue. EMIT then replays the identical selection into a
//! buffer, resolving every branch against the frozen offset table.

use log::debug;

use super::classic::{build_classic_body, ClassicContext};
use super::codebuf::CodeBuffer;
use super::dump;
use super::emitter::Emitter;
use super::ext::{build_ext_body, ExtContext};
use super::frame::{
    classic_frame, emit_classic_epilogue, emit_classic_prologue, emit_ext_epilogue,
    emit_ext_prologue, ext_frame,
};
use super::memory::{ExecutableMemory, MemoryError};
use super::tracker;
use crate::config::{DumpLevel, JitConfig};
use crate::error::CompileError;
use crate::program::{ClassicInsn, ExtInsn, RuntimeHooks};

/// Native code for one program, with its section boundaries.
pub struct TranslatedProgram {
    pub words: Vec<u32>,
    pub prologue_len: u32,
    pub body_len: u32,
    pub epilogue_len: u32,
}

impl TranslatedProgram {
    pub fn len_words(&self) -> usize {
        self.words.len()
    }
}

fn reject_empty(len: usize) -> Result<(), CompileError> {
    if len == 0 {
        Err(CompileError::MalformedInput {
            index: 0,
            reason: "empty program",
        })
    } else {
        Ok(())
    }
}

fn take_words(em: Emitter) -> Vec<u32> {
    // the EMIT pass always carries a buffer
    em.into_buffer().map(CodeBuffer::into_words).unwrap_or_default()
}

/// Translate a classic accumulator program to native code.
pub fn translate_classic(
    prog: &[ClassicInsn],
    hooks: &RuntimeHooks,
) -> Result<TranslatedProgram, CompileError> {
    reject_empty(prog.len())?;

    let mut mctx = ClassicContext::measure(prog, hooks);
    build_classic_body(&mut mctx)?;
    let flags = mctx.flags;
    let body_len = mctx.em.idx();
    let mut offs = mctx.offs;

    let frame = classic_frame(flags);
    let mut pm = Emitter::measuring();
    emit_classic_prologue(&mut pm, flags, frame);
    let prologue_len = pm.idx();
    let mut em = Emitter::measuring();
    emit_classic_epilogue(&mut em, flags, frame);
    let epilogue_len = em.idx();
    offs.set_prologue_len(prologue_len);

    let total = prologue_len + body_len + epilogue_len;
    let mut ctx = ClassicContext::emit(prog, hooks, offs, total as usize);
    emit_classic_prologue(&mut ctx.em, flags, frame);
    build_classic_body(&mut ctx)?;
    debug_assert_eq!(ctx.flags, flags);
    emit_classic_epilogue(&mut ctx.em, flags, frame);
    debug_assert_eq!(ctx.em.idx(), total);

    Ok(TranslatedProgram {
        words: take_words(ctx.em),
        prologue_len,
        body_len,
        epilogue_len,
    })
}

/// Translate an extended register program to native code.
pub fn translate_extended(
    prog: &[ExtInsn],
    hooks: &RuntimeHooks,
) -> Result<TranslatedProgram, CompileError> {
    reject_empty(prog.len())?;

    let vals = tracker::propagate(prog)?;
    let r0_exit_class = vals.class(prog.len(), 0);

    let mut mctx = ExtContext::measure(prog, hooks, &vals);
    build_ext_body(&mut mctx)?;
    let flags = mctx.flags;
    let body_len = mctx.em.idx();
    let mut offs = mctx.offs;

    let frame = ext_frame(flags);
    let mut pm = Emitter::measuring();
    emit_ext_prologue(&mut pm, flags, frame);
    let prologue_len = pm.idx();
    let mut em = Emitter::measuring();
    emit_ext_epilogue(&mut em, flags, frame, r0_exit_class);
    let epilogue_len = em.idx();
    offs.set_prologue_len(prologue_len);

    let total = prologue_len + body_len + epilogue_len;
    let mut ctx = ExtContext::emit(prog, hooks, &vals, offs, total as usize);
    emit_ext_prologue(&mut ctx.em, flags, frame);
    build_ext_body(&mut ctx)?;
    debug_assert_eq!(ctx.flags, flags);
    emit_ext_epilogue(&mut ctx.em, flags, frame, r0_exit_class);
    debug_assert_eq!(ctx.em.idx(), total);

    Ok(TranslatedProgram {
        words: take_words(ctx.em),
        prologue_len,
        body_len,
        epilogue_len,
    })
}

/// Installed native code, executable until dropped.
pub struct CompiledProgram {
    mem: ExecutableMemory,
    len_words: usize,
}

impl CompiledProgram {
    fn install(t: &TranslatedProgram) -> Result<Self, CompileError> {
        let mut buf = CodeBuffer::with_capacity(t.words.len());
        for &w in &t.words {
            buf.push(w);
        }
        let mem = buf.finalize().map_err(exhausted)?;
        Ok(Self {
            mem,
            len_words: t.words.len(),
        })
    }

    pub fn len_bytes(&self) -> usize {
        self.len_words * 4
    }

    /// Entry point of the installed code.
    ///
    /// # Safety
    ///
    /// `F` must be an `extern "C"` function pointer type matching the
    /// generated calling convention, and the code must only run on a
    /// machine that executes the generated instruction set.
    pub unsafe fn entry<F>(&self) -> Option<F>
    where
        F: Copy,
    {
        self.mem.as_fn()
    }
}

fn exhausted(e: MemoryError) -> CompileError {
    CompileError::ResourceExhaustion {
        reason: e.to_string(),
    }
}

fn dump_translation(kind: &str, insns: usize, t: &TranslatedProgram, level: DumpLevel) {
    match level {
        DumpLevel::None => {}
        DumpLevel::Summary | DumpLevel::Full => {
            debug!(
                "{}: {} instructions -> {} words (prologue {}, body {}, epilogue {})",
                kind,
                insns,
                t.len_words(),
                t.prologue_len,
                t.body_len,
                t.epilogue_len
            );
            if level == DumpLevel::Full {
                for (i, &w) in t.words.iter().enumerate() {
                    debug!("{:4}: {:08x}  {}", i, w, dump::mnemonic(w));
                }
            }
        }
    }
}

/// Compile a classic program, or return `Ok(None)` when compilation is
/// disabled and the caller should interpret instead.
pub fn compile_classic(
    prog: &[ClassicInsn],
    hooks: &RuntimeHooks,
    cfg: &JitConfig,
) -> Result<Option<CompiledProgram>, CompileError> {
    if !cfg.enabled {
        return Ok(None);
    }
    let t = translate_classic(prog, hooks)?;
    dump_translation("classic", prog.len(), &t, cfg.dump);
    Ok(Some(CompiledProgram::install(&t)?))
}

/// Compile an extended program, or return `Ok(None)` when compilation
/// is disabled.
pub fn compile_extended(
    prog: &[ExtInsn],
    hooks: &RuntimeHooks,
    cfg: &JitConfig,
) -> Result<Option<CompiledProgram>, CompileError> {
    if !cfg.enabled {
        return Ok(None);
    }
    let t = translate_extended(prog, hooks)?;
    dump_translation("extended", prog.len(), &t, cfg.dump);
    Ok(Some(CompiledProgram::install(&t)?))
}
