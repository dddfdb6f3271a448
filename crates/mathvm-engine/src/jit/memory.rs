//! Executable memory pages for generated code.

use crate::jit::JitError;

/// A page-aligned mapping holding finished machine code.
///
/// Created writable, filled once, then flipped to read+execute. Unmapped on
/// drop, so it must outlive every pointer into it (the registry and
/// [`JitProgram`] keep theirs alive for the run).
///
/// [`JitProgram`]: crate::jit::codegen::JitProgram
#[derive(Debug)]
pub struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
}

impl ExecutableMemory {
    /// Map a fresh region, copy `code` into it, and make it executable.
    pub fn new(code: &[u8]) -> Result<Self, JitError> {
        let len = code.len().max(1);
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(JitError::MapFailed(
                    std::io::Error::last_os_error().to_string(),
                ));
            }
            let ptr = ptr.cast::<u8>();
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            if libc::mprotect(ptr.cast(), len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                let err = std::io::Error::last_os_error().to_string();
                libc::munmap(ptr.cast(), len);
                return Err(JitError::MapFailed(err));
            }
            Ok(Self { ptr, len })
        }
    }

    /// Start of the mapped code.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_execution() {
        // mov eax, 42; ret
        let code = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
        let memory = ExecutableMemory::new(&code).unwrap();
        let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(memory.as_ptr()) };
        assert_eq!(f(), 42);
    }
}
