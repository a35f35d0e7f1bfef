//! Packet-filter bytecode compiled to MIPS64 machine code.
//!
//! Two source forms are accepted: the classic accumulator form
//! (accumulator, index register and sixteen scratch cells) and the
//! extended form with eleven 64-bit registers. Both compile through the
//! same multi-pass driver: a measuring pass sizes the body and records
//! branch targets, the frame is laid out from the resources the pass
//! discovered, and an emitting pass replays the identical instruction
//! selection into a buffer that is then installed as executable memory.
//!
//! Programs are expected to arrive pre-validated; structural problems
//! the translator still notices surface as [`CompileError`], and every
//! error leaves the caller free to fall back to interpretation.
//!
//! ```no_run
//! use pfjit::{compile_classic, ClassicInsn, JitConfig, RuntimeHooks};
//! use pfjit::program::op;
//!
//! // return the accumulator plus five
//! let prog = vec![
//!     ClassicInsn::new((op::ALU | op::ADD | op::K) as u16, 0, 0, 5),
//!     ClassicInsn::new((op::RET | op::RET_A) as u16, 0, 0, 0),
//! ];
//! let hooks = RuntimeHooks {
//!     load_word: 0,
//!     load_half: 0,
//!     load_byte: 0,
//!     packet_load: 0,
//!     call_base: 0,
//! };
//! let _compiled = compile_classic(&prog, &hooks, &JitConfig::default())?;
//! # Ok::<(), pfjit::CompileError>(())
//! ```

pub mod config;
pub mod error;
pub mod jit;
pub mod program;

pub use config::{DumpLevel, JitConfig};
pub use error::CompileError;
pub use jit::{
    compile_classic, compile_extended, translate_classic, translate_extended, CompiledProgram,
    TranslatedProgram,
};
pub use program::{ClassicInsn, ExtInsn, RuntimeHooks};
