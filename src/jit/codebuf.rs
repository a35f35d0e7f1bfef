//! Code buffer for building JIT code.
//!
//! MIPS instructions are fixed-width 32-bit words, so the buffer is
//! word-oriented. Branch resolution happens in the driver against the
//! measured offset table, so no label machinery lives here.

use super::memory::{ExecutableMemory, MemoryError};

/// A buffer of native instruction words in execution order.
pub struct CodeBuffer {
    words: Vec<u32>,
}

impl CodeBuffer {
    /// Create a new code buffer with pre-allocated capacity, in words.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: Vec::with_capacity(capacity),
        }
    }

    /// Number of instruction words emitted so far.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Append one instruction word.
    pub fn push(&mut self, word: u32) {
        self.words.push(word);
    }

    /// Get the emitted words (for inspection).
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Consume the buffer and return the raw words.
    pub fn into_words(self) -> Vec<u32> {
        self.words
    }

    /// The code as native-endian bytes, ready for installation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.words.len() * 4);
        for w in &self.words {
            bytes.extend_from_slice(&w.to_ne_bytes());
        }
        bytes
    }

    /// Copy the code into freshly allocated executable memory.
    pub fn finalize(self) -> Result<ExecutableMemory, MemoryError> {
        let bytes = self.to_bytes();
        let mut mem = ExecutableMemory::new(bytes.len())?;
        mem.write(0, &bytes)?;
        mem.make_executable()?;
        Ok(mem)
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}
