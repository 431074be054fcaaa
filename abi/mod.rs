//! Call binders and the foreign calling-convention resolver.
//!
//! A [`CallBinder`] implements one calling convention. It can produce a
//! [`Downcall`] (Rust calls a native address under that convention) and an
//! [`UpcallStub`] (native code calls a Rust closure under that convention).
//!
//! Two binders exist per process:
//!
//! - the host binder, which speaks the host's own C convention (System V
//!   AMD64 on Unix), and
//! - the foreign binder, which speaks the Windows x64 convention used by code
//!   inside a loaded PE image.
//!
//! The native library's own entry points are plain `extern "C"` functions and
//! do not go through a binder at all; binders are for addresses that only
//! become known at runtime.
//!
//! # Platform Support
//!
//! Binders are obtained through a [`ForeignConventionProvider`], one per
//! supported host. The provider set is chosen at build time via `cfg` and the
//! first provider that supports the running host is cached for the life of the
//! process. There is no fallback convention.

use crate::{Error, Result, StartupError};
use once_cell::sync::Lazy;
use std::ffi::c_void;
use std::fmt::Display;
use std::ptr::NonNull;
use tracing::debug;

pub mod classify;

#[cfg(target_arch = "x86_64")]
pub mod x86;

#[cfg(target_arch = "x86_64")]
pub use x86 as arch;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("peloader call stubs are only implemented for x86-64 hosts");

pub use arch::{Downcall, UpcallStub};
pub use classify::{ArgLayout, ArgSlot, MAX_STACK_ARGS, classify};

/// A calling convention a binder can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallConvention {
    /// System V AMD64, the native convention of Linux and macOS on x86-64.
    SysV64,
    /// Microsoft x64, the convention of code inside a PE32+ image.
    Win64,
}

impl CallConvention {
    /// Number of integer/pointer argument registers.
    pub const fn int_arg_count(self) -> usize {
        match self {
            CallConvention::SysV64 => 6,
            CallConvention::Win64 => 4,
        }
    }

    /// Number of floating point argument registers.
    pub const fn float_arg_count(self) -> usize {
        match self {
            CallConvention::SysV64 => 8,
            CallConvention::Win64 => 4,
        }
    }

    /// Bytes the caller reserves above the return address for the callee.
    pub const fn shadow_space(self) -> usize {
        match self {
            CallConvention::SysV64 => 0,
            CallConvention::Win64 => 32,
        }
    }

    /// Whether registers are assigned by argument position rather than per class.
    pub const fn is_positional(self) -> bool {
        matches!(self, CallConvention::Win64)
    }
}

impl Display for CallConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallConvention::SysV64 => write!(f, "sysv64"),
            CallConvention::Win64 => write!(f, "win64"),
        }
    }
}

/// Scalar types that may cross a binder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    I64,
    Pointer,
    F32,
    F64,
}

impl ValueType {
    pub const fn is_float(self) -> bool {
        matches!(self, ValueType::F32 | ValueType::F64)
    }
}

/// The shape of a function: parameter types and an optional return type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    params: Vec<ValueType>,
    ret: Option<ValueType>,
}

impl Signature {
    /// A function returning `ret`.
    pub fn of(ret: ValueType, params: &[ValueType]) -> Self {
        Self {
            params: params.to_vec(),
            ret: Some(ret),
        }
    }

    /// A function returning nothing.
    pub fn of_void(params: &[ValueType]) -> Self {
        Self {
            params: params.to_vec(),
            ret: None,
        }
    }

    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    pub fn ret(&self) -> Option<ValueType> {
        self.ret
    }
}

/// A scalar value passed to or returned from a stub.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Void,
    I32(i32),
    I64(i64),
    Pointer(*mut c_void),
    F32(f32),
    F64(f64),
}

impl Value {
    /// The type of this value, `None` for [`Value::Void`].
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Void => None,
            Value::I32(_) => Some(ValueType::I32),
            Value::I64(_) => Some(ValueType::I64),
            Value::Pointer(_) => Some(ValueType::Pointer),
            Value::F32(_) => Some(ValueType::F32),
            Value::F64(_) => Some(ValueType::F64),
        }
    }

    /// The 64-bit register image of this value.
    ///
    /// Narrow integers are sign-extended and `f32` occupies the low half; the
    /// callee only reads the bits its type covers.
    pub(crate) fn to_bits(self) -> u64 {
        match self {
            Value::Void => 0,
            Value::I32(v) => v as i64 as u64,
            Value::I64(v) => v as u64,
            Value::Pointer(p) => p as u64,
            Value::F32(v) => v.to_bits() as u64,
            Value::F64(v) => v.to_bits(),
        }
    }

    /// Rebuild a value of type `ty` from a register image.
    pub(crate) fn from_bits(ty: ValueType, bits: u64) -> Value {
        match ty {
            ValueType::I32 => Value::I32(bits as u32 as i32),
            ValueType::I64 => Value::I64(bits as i64),
            ValueType::Pointer => Value::Pointer(bits as *mut c_void),
            ValueType::F32 => Value::F32(f32::from_bits(bits as u32)),
            ValueType::F64 => Value::F64(f64::from_bits(bits)),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> Option<*mut c_void> {
        match self {
            Value::Pointer(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }
}

/// The Rust side of an upcall.
pub type UpcallFn = Box<dyn Fn(&[Value]) -> Value + Send + Sync + 'static>;

/// An implementation of one calling convention.
pub trait CallBinder: Send + Sync {
    /// The convention this binder speaks.
    fn convention(&self) -> CallConvention;

    /// Build a callable handle for the native function at `address`.
    fn downcall(&self, address: NonNull<c_void>, signature: &Signature) -> Result<Downcall<'static>>;

    /// Build a stub that native code can call to reach `target`.
    fn upcall(&self, signature: &Signature, target: UpcallFn) -> Result<UpcallStub>;
}

/// Supplies the binders for one kind of host.
pub trait ForeignConventionProvider: Sync {
    /// Name used in logs and startup errors.
    fn name(&self) -> &'static str;

    /// Whether this provider can serve the running process.
    fn supported(&self) -> bool;

    /// Binder for the host's native convention.
    fn host_binder(&self) -> &'static dyn CallBinder;

    /// Binder for the Windows x64 convention.
    fn foreign_binder(&self) -> &'static dyn CallBinder;
}

type ProviderResult = core::result::Result<&'static dyn ForeignConventionProvider, StartupError>;

static PROVIDER: Lazy<ProviderResult> = Lazy::new(|| select_provider(&arch::providers()));

/// Pick the first provider that supports the running host.
pub(crate) fn select_provider(candidates: &[&'static dyn ForeignConventionProvider]) -> ProviderResult {
    let mut rejected = Vec::new();
    for provider in candidates {
        if provider.supported() {
            debug!("Using {} for the foreign calling convention", provider.name());
            return Ok(*provider);
        }
        rejected.push(provider.name());
    }

    Err(StartupError::ForeignConvention(format!(
        "no provider accepts {}/{} (tried: [{}])",
        std::env::consts::OS,
        std::env::consts::ARCH,
        rejected.join(", ")
    )))
}

/// The process-wide Windows x64 binder.
///
/// Resolved on first use and never torn down. A failed resolution is cached
/// and returned to every caller.
pub fn foreign_binder() -> Result<&'static dyn CallBinder> {
    (*PROVIDER)
        .clone()
        .map(|provider| provider.foreign_binder())
        .map_err(Error::from)
}

/// The process-wide binder for the host's own convention.
pub fn host_binder() -> Result<&'static dyn CallBinder> {
    (*PROVIDER)
        .clone()
        .map(|provider| provider.host_binder())
        .map_err(Error::from)
}
