//! Per-compilation configuration.
//!
//! Every knob is passed explicitly to the compile entry points and read
//! once before the first pass; nothing is consulted mid-compilation.

/// How much of the compiled output to report through the `log` facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpLevel {
    /// No output.
    #[default]
    None,
    /// One line of pass statistics per compilation.
    Summary,
    /// Pass statistics plus every emitted word with a decoded mnemonic.
    Full,
}

/// Configuration for one compilation.
#[derive(Debug, Clone, Copy)]
pub struct JitConfig {
    /// When false, the compile entry points return `Ok(None)` and the
    /// caller falls back to interpretation.
    pub enabled: bool,
    pub dump: DumpLevel,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dump: DumpLevel::None,
        }
    }
}
