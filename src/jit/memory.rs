//! Executable memory for installed code.
//!
//! The lifecycle is write-then-execute: a mapping starts out
//! read-write, the code is copied in, and `make_executable` flips it to
//! read-execute for good. There is no way back to writable.

use std::ptr::NonNull;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid memory size")]
    InvalidSize,
}

/// A page-aligned mapping holding generated code.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Map `size` bytes of writable memory, rounded up to whole pages.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let size = (size + page - 1) & !(page - 1);

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)?;

        Ok(Self {
            ptr,
            size,
            executable: false,
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mapped size in bytes (a whole number of pages).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copy `data` into the mapping at `offset`. Fails once the mapping
    /// has been made executable.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        if offset + data.len() > self.size {
            return Err(MemoryError::InvalidSize);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Remap read-execute. Idempotent; writes are refused afterwards.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        let rc = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        self.executable = true;
        Ok(())
    }

    /// Reinterpret the start of the mapping as a function pointer.
    /// Returns `None` until the mapping is executable.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the calling
    /// convention of the installed code.
    pub unsafe fn as_fn<F>(&self) -> Option<F>
    where
        F: Copy,
    {
        if !self.executable {
            return None;
        }
        if std::mem::size_of::<F>() != std::mem::size_of::<fn()>() {
            return None;
        }
        let p = self.ptr.as_ptr();
        Some(unsafe { std::mem::transmute_copy(&p) })
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The mapping is exclusively owned and the executable flag is only
// mutated through &mut self.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounds_up_to_page() {
        let mem = ExecutableMemory::new(1).unwrap();
        assert!(mem.size() >= 1);
        assert_eq!(mem.size() % 4096, 0);
        assert!(!mem.is_executable());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            ExecutableMemory::new(0),
            Err(MemoryError::InvalidSize)
        ));
    }

    #[test]
    fn test_write_then_seal() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        mem.write(0, &0u32.to_ne_bytes()).unwrap();
        mem.make_executable().unwrap();
        assert!(mem.is_executable());
        assert!(mem.write(0, &[0]).is_err(), "sealed mapping refuses writes");
    }

    #[test]
    fn test_out_of_bounds_write_rejected() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        let size = mem.size();
        assert!(mem.write(size - 2, &[0, 0, 0, 0]).is_err());
    }
}
