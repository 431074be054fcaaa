//! Scoped allocation of memory shared with native code.
//!
//! Every string, symbol record and stub handed to the native library comes
//! from an [`Arena`]. Allocations never move and are all released together
//! when the arena is dropped; borrows of the arena bound how long Rust can
//! observe them.

use crate::abi::UpcallStub;
use crate::record::NativeSymbol;
use crate::{Error, Result};
use std::cell::RefCell;
use std::ffi::{CStr, CString, c_char, c_void};
use std::ptr::NonNull;

/// Types that may live in arena-backed native buffers.
///
/// # Safety
///
/// The all-zero bit pattern must be a valid value and the alignment must not
/// exceed 8.
pub unsafe trait ArenaValue: Copy {}

unsafe impl ArenaValue for NativeSymbol {}
unsafe impl ArenaValue for *const c_char {}

#[derive(Default)]
struct Blocks {
    words: Vec<Box<[u64]>>,
    strings: Vec<CString>,
    stubs: Vec<UpcallStub>,
}

/// A caller-controlled allocation scope.
///
/// Not shareable across threads; memory handed out must not be used after
/// the arena is dropped.
#[derive(Default)]
pub struct Arena {
    blocks: RefCell<Blocks>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live allocations.
    pub fn allocations(&self) -> usize {
        let blocks = self.blocks.borrow();
        blocks.words.len() + blocks.strings.len() + blocks.stubs.len()
    }

    /// Copy `value` into a nul-terminated native string.
    pub fn alloc_str(&self, value: &str) -> Result<&CStr> {
        let owned = CString::new(value).map_err(|_| Error::InteriorNul)?;
        let ptr: *const CStr = owned.as_c_str();
        self.blocks.borrow_mut().strings.push(owned);
        // SAFETY: the CString's heap buffer does not move and lives as long as self
        Ok(unsafe { &*ptr })
    }

    /// A zeroed buffer of `count` values.
    pub fn alloc_zeroed<T: ArenaValue>(&self, count: usize) -> NonNull<T> {
        assert!(std::mem::align_of::<T>() <= 8, "arena values are at most 8-byte aligned");
        let bytes = std::mem::size_of::<T>() * count;
        if bytes == 0 {
            return NonNull::dangling();
        }

        let mut words = vec![0u64; bytes.div_ceil(8)].into_boxed_slice();
        let ptr = words.as_mut_ptr() as *mut T;
        self.blocks.borrow_mut().words.push(words);
        // SAFETY: derived from a live boxed slice
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Allocate a single symbol record.
    pub fn alloc_symbol(&self, record: NativeSymbol) -> NonNull<NativeSymbol> {
        let ptr = self.alloc_zeroed::<NativeSymbol>(1);
        unsafe { ptr.as_ptr().write(record) };
        ptr
    }

    /// Keep `stub` alive for the rest of this scope and return its address.
    pub fn adopt(&self, stub: UpcallStub) -> NonNull<c_void> {
        let address = stub.address();
        self.blocks.borrow_mut().stubs.push(stub);
        address
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("allocations", &self.allocations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_nul_terminated_and_stable() {
        let arena = Arena::new();
        let first = arena.alloc_str("KERNEL32.dll").unwrap();
        let first_ptr = first.as_ptr();
        for i in 0..64 {
            arena.alloc_str(&format!("filler{i}")).unwrap();
        }
        assert_eq!(first.as_ptr(), first_ptr);
        assert_eq!(first.to_bytes_with_nul(), b"KERNEL32.dll\0");
        assert_eq!(arena.allocations(), 65);
    }

    #[test]
    fn interior_nul_is_rejected() {
        let arena = Arena::new();
        assert!(matches!(arena.alloc_str("bad\0name"), Err(Error::InteriorNul)));
        assert_eq!(arena.allocations(), 0);
    }

    #[test]
    fn zeroed_buffers_are_aligned() {
        let arena = Arena::new();
        let records = arena.alloc_zeroed::<NativeSymbol>(3);
        assert_eq!(records.as_ptr() as usize % 8, 0);
        let third = unsafe { *records.as_ptr().add(2) };
        assert!(third.name.is_null());
        assert!(third.address.is_null());
        assert_eq!(third.ordinal, 0);

        let names = arena.alloc_zeroed::<*const c_char>(5);
        assert!(unsafe { (*names.as_ptr().add(4)).is_null() });
    }

    #[test]
    fn every_kind_of_allocation_is_counted() {
        use crate::abi::{Signature, Value, foreign_binder};

        let arena = Arena::new();
        arena.alloc_str("msvcrt.dll").unwrap();
        arena.alloc_zeroed::<NativeSymbol>(2);
        let stub = foreign_binder()
            .unwrap()
            .upcall(&Signature::of_void(&[]), Box::new(|_: &[Value]| Value::Void))
            .unwrap();
        let expected = stub.address();
        assert_eq!(arena.adopt(stub), expected);
        assert_eq!(arena.allocations(), 3);
    }

    #[test]
    fn empty_buffers_do_not_allocate() {
        let arena = Arena::new();
        arena.alloc_zeroed::<NativeSymbol>(0);
        assert_eq!(arena.allocations(), 0);
    }
}
