//! The native symbol record and its managed view.
//!
//! A [`NativeSymbol`] is read and written verbatim by the native library, so
//! its layout is pinned: two pointers, a 32-bit ordinal and four bytes of
//! padding, 24 bytes in total. A [`Symbol`] is a handle to one such record
//! living in arena memory.

use crate::abi::{Signature, Value, foreign_binder};
use crate::arena::Arena;
use crate::{Error, Result};
use std::borrow::Cow;
use std::ffi::{CStr, c_char, c_int, c_void};
use std::fmt::Display;
use std::marker::PhantomData;
use std::ptr::NonNull;

/// Ordinal sentinel meaning "identify by name".
pub const NO_ORDINAL: i32 = -1;

/// A symbol record as the native library sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct NativeSymbol {
    /// Nul-terminated name, or null for ordinal-only symbols
    pub name: *const c_char,
    /// Resolved or supplied address, null until known
    pub address: *mut c_void,
    /// Ordinal, or [`NO_ORDINAL`]
    pub ordinal: c_int,
    _padding: u32,
}

const _: () = assert!(std::mem::size_of::<NativeSymbol>() == 24);
const _: () = assert!(std::mem::align_of::<NativeSymbol>() == 8);

impl NativeSymbol {
    pub const fn new(name: *const c_char, address: *mut c_void, ordinal: i32) -> Self {
        Self {
            name,
            address,
            ordinal,
            _padding: 0,
        }
    }

    /// At least one of name and ordinal identifies the symbol.
    pub fn is_valid(&self) -> bool {
        !self.name.is_null() || self.ordinal != NO_ORDINAL
    }
}

impl Default for NativeSymbol {
    fn default() -> Self {
        Self::new(std::ptr::null(), std::ptr::null_mut(), NO_ORDINAL)
    }
}

/// A symbol record in arena memory.
///
/// The name may point into the arena or into the native library's own
/// tables; either way it is valid for `'a`.
pub struct Symbol<'a> {
    record: NonNull<NativeSymbol>,
    _scope: PhantomData<&'a Arena>,
}

impl<'a> Symbol<'a> {
    /// Wrap a record owned by an arena (or native memory) that outlives `'a`.
    ///
    /// # Safety
    ///
    /// `record` must be valid for reads and writes for `'a`, and its name (if
    /// any) must stay valid for `'a`.
    pub(crate) unsafe fn from_record(record: NonNull<NativeSymbol>) -> Self {
        Self {
            record,
            _scope: PhantomData,
        }
    }

    /// Allocate a symbol in `arena`. Either `name` or `ordinal` must identify it.
    pub fn new(arena: &'a Arena, name: Option<&str>, address: *mut c_void, ordinal: i32) -> Result<Self> {
        if name.is_none() && ordinal == NO_ORDINAL {
            return Err(Error::InvalidSymbol);
        }
        let name = match name {
            Some(name) => arena.alloc_str(name)?.as_ptr(),
            None => std::ptr::null(),
        };
        let record = arena.alloc_symbol(NativeSymbol::new(name, address, ordinal));
        Ok(unsafe { Self::from_record(record) })
    }

    /// A symbol identified by name only.
    pub fn of_name(arena: &'a Arena, name: &str) -> Result<Self> {
        Self::new(arena, Some(name), std::ptr::null_mut(), NO_ORDINAL)
    }

    /// A symbol identified by ordinal only.
    pub fn of_ordinal(arena: &'a Arena, ordinal: i32) -> Result<Self> {
        Self::new(arena, None, std::ptr::null_mut(), ordinal)
    }

    /// A symbol whose address is a Windows x64 stub forwarding to `target`.
    ///
    /// The stub lives as long as `arena`.
    pub fn upcall<F>(
        arena: &'a Arena,
        name: Option<&str>,
        ordinal: i32,
        signature: &Signature,
        target: F,
    ) -> Result<Self>
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        if name.is_none() && ordinal == NO_ORDINAL {
            return Err(Error::InvalidSymbol);
        }
        let stub = foreign_binder()?.upcall(signature, Box::new(target))?;
        let address = arena.adopt(stub);
        Self::new(arena, name, address.as_ptr(), ordinal)
    }

    pub fn name(&self) -> Option<&'a CStr> {
        let name = self.record().name;
        if name.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(name) })
        }
    }

    /// The name decoded as UTF-8, replacing invalid sequences.
    pub fn name_lossy(&self) -> Option<Cow<'a, str>> {
        self.name().map(CStr::to_string_lossy)
    }

    pub fn address(&self) -> *mut c_void {
        self.record().address
    }

    pub fn ordinal(&self) -> i32 {
        self.record().ordinal
    }

    pub fn is_valid(&self) -> bool {
        self.record().is_valid()
    }

    pub fn set_name(&mut self, arena: &'a Arena, name: Option<&str>) -> Result<&mut Self> {
        let name = match name {
            Some(name) => arena.alloc_str(name)?.as_ptr(),
            None => std::ptr::null(),
        };
        unsafe { (*self.record.as_ptr()).name = name };
        Ok(self)
    }

    pub fn set_address(&mut self, address: *mut c_void) -> &mut Self {
        unsafe { (*self.record.as_ptr()).address = address };
        self
    }

    pub fn set_ordinal(&mut self, ordinal: i32) -> &mut Self {
        unsafe { (*self.record.as_ptr()).ordinal = ordinal };
        self
    }

    /// A copy of the underlying record.
    pub fn record(&self) -> NativeSymbol {
        unsafe { self.record.as_ptr().read() }
    }

    pub(crate) fn as_ptr(&self) -> *mut NativeSymbol {
        self.record.as_ptr()
    }

    /// `name`, `ordinal`, or `name(ordinal)` when both are present.
    pub fn identifier(&self) -> String {
        let ordinal = self.ordinal();
        match self.name_lossy() {
            None => ordinal.to_string(),
            Some(name) if ordinal == NO_ORDINAL => name.into_owned(),
            Some(name) => format!("{}({})", name, ordinal),
        }
    }
}

impl Display for Symbol<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.identifier())
    }
}

impl std::fmt::Debug for Symbol<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Symbol")
            .field("name", &self.name_lossy())
            .field("address", &self.address())
            .field("ordinal", &self.ordinal())
            .finish()
    }
}
