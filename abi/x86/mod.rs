pub mod assembler;
pub mod stub;

pub use stub::{Downcall, UpcallStub};

use super::{CallBinder, CallConvention, ForeignConventionProvider, Signature, UpcallFn};
use crate::{Error, Result};
use assembler::{R8, R9, RCX, RDI, RDX, RSI};
use std::ffi::c_void;
use std::ptr::NonNull;
use tracing::trace;

/// Integer argument registers of each convention, in assignment order.
pub fn int_arg_registers(convention: CallConvention) -> &'static [u8] {
    match convention {
        CallConvention::SysV64 => &[RDI, RSI, RDX, RCX, R8, R9],
        CallConvention::Win64 => &[RCX, RDX, R8, R9],
    }
}

/// Register and stack image of one call.
///
/// Downcall stubs load argument registers from this frame before the call;
/// upcall stubs spill argument registers into it before entering Rust. The
/// stubs address fields by their `offset_of!` offsets, so the layout is fixed.
#[derive(Debug, Default)]
#[repr(C)]
pub struct CallFrame {
    /// Call target (downcalls only)
    pub target: u64,

    /// Integer argument registers, in the convention's assignment order
    pub int_regs: [u64; 6],

    /// XMM0-XMM7 (low 64 bits)
    pub float_regs: [u64; 8],

    /// RAX after the call
    pub ret_int: u64,

    /// XMM0 (low 64 bits) after the call
    pub ret_float: u64,

    /// Stack-passed arguments
    pub stack: [u64; super::MAX_STACK_ARGS],
}

impl CallFrame {
    pub const TARGET: i32 = core::mem::offset_of!(CallFrame, target) as i32;
    pub const INT_REGS: i32 = core::mem::offset_of!(CallFrame, int_regs) as i32;
    pub const FLOAT_REGS: i32 = core::mem::offset_of!(CallFrame, float_regs) as i32;
    pub const RET_INT: i32 = core::mem::offset_of!(CallFrame, ret_int) as i32;
    pub const RET_FLOAT: i32 = core::mem::offset_of!(CallFrame, ret_float) as i32;
    pub const STACK: i32 = core::mem::offset_of!(CallFrame, stack) as i32;
    pub const SIZE: usize = core::mem::size_of::<CallFrame>();
}

/// A read-only, executable copy of generated code.
///
/// The pages are written while mapped read-write and flipped to read-execute
/// before the address is handed out; they are unmapped on drop.
pub struct ExecutableBuffer {
    addr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is immutable once constructed.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    pub fn new(code: &[u8]) -> Result<Self> {
        let page = page_size();
        let len = code.len().max(1).div_ceil(page) * page;
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::StubAllocation(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        let buffer = Self {
            addr: NonNull::new(addr as *mut u8)
                .ok_or_else(|| Error::StubAllocation("mmap returned null".to_string()))?,
            len,
        };

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), buffer.addr.as_ptr(), code.len());
            if libc::mprotect(addr, len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                return Err(Error::StubAllocation(
                    std::io::Error::last_os_error().to_string(),
                ));
            }
        }
        trace!("Mapped {} bytes of stub code at {:p}", code.len(), buffer.addr);
        Ok(buffer)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.addr.as_ptr()
    }

    pub fn entry(&self) -> NonNull<c_void> {
        self.addr.cast()
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr.as_ptr() as *mut c_void, self.len);
        }
    }
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

/// A binder that synthesizes x86-64 stubs for one convention.
pub struct StubBinder {
    convention: CallConvention,
}

impl StubBinder {
    pub const fn new(convention: CallConvention) -> Self {
        Self { convention }
    }
}

impl CallBinder for StubBinder {
    fn convention(&self) -> CallConvention {
        self.convention
    }

    fn downcall(&self, address: NonNull<c_void>, signature: &Signature) -> Result<Downcall<'static>> {
        Downcall::new(self.convention, address, signature)
    }

    fn upcall(&self, signature: &Signature, target: UpcallFn) -> Result<UpcallStub> {
        UpcallStub::new(self.convention, signature, target)
    }
}

static SYSV64_BINDER: StubBinder = StubBinder::new(CallConvention::SysV64);
static WIN64_BINDER: StubBinder = StubBinder::new(CallConvention::Win64);

/// Provider for x86-64 Unix hosts, whose native convention is System V.
pub struct SysV64HostProvider;

impl ForeignConventionProvider for SysV64HostProvider {
    fn name(&self) -> &'static str {
        "x86-64 System V host"
    }

    fn supported(&self) -> bool {
        std::env::consts::ARCH == "x86_64" && std::env::consts::FAMILY == "unix"
    }

    fn host_binder(&self) -> &'static dyn CallBinder {
        &SYSV64_BINDER
    }

    fn foreign_binder(&self) -> &'static dyn CallBinder {
        &WIN64_BINDER
    }
}

/// Providers compiled into this build, in preference order.
pub fn providers() -> Vec<&'static dyn ForeignConventionProvider> {
    #[allow(unused_mut)]
    let mut providers: Vec<&'static dyn ForeignConventionProvider> = Vec::new();
    #[cfg(unix)]
    providers.push(&SysV64HostProvider);
    providers
}
