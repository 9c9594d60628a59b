///
/// Code Patching
///
/// Recompilation leaves callers holding the old entry point. A `CodePatcher`
/// overwrites that entry with an absolute jump to the new code, so the old
/// address keeps working and runs the new body.
///
/// `NativePatcher` supports x86_64 on unix and aarch64 on Linux:
/// - x86_64: `movabs rax, imm64; jmp rax` (12 bytes)
/// - aarch64: `ldr x16, #8; br x16; .quad imm64` (16 bytes)
///
/// The Cranelift backend keeps frame pointers on, so every function has a
/// prologue at least this long.
///

use crate::cache::Address;
use crate::error::{JitError, Result};

pub trait CodePatcher {
    fn redirect(&mut self, old: Address, new: Address) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NativePatcher;

impl NativePatcher {
    pub fn new() -> Self {
        NativePatcher
    }

    /// Whether this host has a jump encoding and writable code pages.
    pub fn is_supported() -> bool {
        jump_sequence(0).is_some()
    }
}

impl CodePatcher for NativePatcher {
    fn redirect(&mut self, old: Address, new: Address) -> Result<()> {
        let code = jump_sequence(new.addr()).ok_or_else(|| {
            JitError::Patch(format!(
                "no redirect encoding for {} on {}",
                std::env::consts::ARCH,
                std::env::consts::OS
            ))
        })?;
        write_code(old, &code)
    }
}

#[cfg(all(unix, target_arch = "x86_64"))]
fn jump_sequence(target: usize) -> Option<Vec<u8>> {
    let mut code = Vec::with_capacity(12);
    code.extend_from_slice(&[0x48, 0xB8]);
    code.extend_from_slice(&(target as u64).to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xE0]);
    Some(code)
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn jump_sequence(target: usize) -> Option<Vec<u8>> {
    let mut code = Vec::with_capacity(16);
    code.extend_from_slice(&0x5800_0050u32.to_le_bytes());
    code.extend_from_slice(&0xD61F_0200u32.to_le_bytes());
    code.extend_from_slice(&(target as u64).to_le_bytes());
    Some(code)
}

#[cfg(not(any(
    all(unix, target_arch = "x86_64"),
    all(target_os = "linux", target_arch = "aarch64")
)))]
fn jump_sequence(_target: usize) -> Option<Vec<u8>> {
    None
}

#[cfg(unix)]
fn write_code(at: Address, code: &[u8]) -> Result<()> {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if page > 0 { page as usize } else { 4096 };
    let start = at.addr() & !(page - 1);
    let end = at.addr() + code.len();
    let span = (end - start).div_ceil(page) * page;

    let rc = unsafe {
        libc::mprotect(
            start as *mut libc::c_void,
            span,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        )
    };
    if rc != 0 {
        return Err(JitError::Patch(format!(
            "mprotect(PROT_READ|PROT_WRITE|PROT_EXEC) failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), at.as_mut_ptr(), code.len());
    }
    flush_icache(at, code.len());

    let rc = unsafe {
        libc::mprotect(
            start as *mut libc::c_void,
            span,
            libc::PROT_READ | libc::PROT_EXEC,
        )
    };
    if rc != 0 {
        return Err(JitError::Patch(format!(
            "mprotect(PROT_READ|PROT_EXEC) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn write_code(_at: Address, _code: &[u8]) -> Result<()> {
    Err(JitError::Patch("code patching requires a unix host".to_string()))
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn flush_icache(at: Address, len: usize) {
    unsafe {
        __clear_cache(
            at.as_mut_ptr() as *mut libc::c_char,
            at.as_mut_ptr().add(len) as *mut libc::c_char,
        );
    }
}

#[cfg(all(unix, not(all(target_os = "linux", target_arch = "aarch64"))))]
fn flush_icache(_at: Address, _len: usize) {}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(all(unix, target_arch = "x86_64"))]
    #[test]
    fn test_x86_64_jump_encoding() {
        let code = jump_sequence(0x1122_3344_5566_7788).unwrap();
        assert_eq!(
            code,
            vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0xFF, 0xE0]
        );
        assert!(NativePatcher::is_supported());
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    #[test]
    fn test_aarch64_jump_encoding() {
        let code = jump_sequence(0x1122_3344_5566_7788).unwrap();
        assert_eq!(code.len(), 16);
        assert_eq!(&code[..4], &[0x50, 0x00, 0x00, 0x58]);
        assert_eq!(&code[4..8], &[0x00, 0x02, 0x1F, 0xD6]);
        assert_eq!(&code[8..], &0x1122_3344_5566_7788u64.to_le_bytes());
    }
}
