//! Native code generation.
//!
//! The pipeline is: instruction selection per source form
//! ([`classic`], [`ext`]) over a mode-switched [`emitter`], driven by
//! the multi-pass [`driver`], with the result installed through
//! [`memory`].

pub mod codebuf;
pub mod driver;
pub mod dump;
pub mod emitter;
pub mod memory;
pub mod mips;
pub mod tracker;

mod classic;
mod ext;
mod frame;

pub use driver::{
    compile_classic, compile_extended, translate_classic, translate_extended, CompiledProgram,
    TranslatedProgram,
};
pub use memory::{ExecutableMemory, MemoryError};
