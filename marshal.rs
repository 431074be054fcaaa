//! Two-phase collection transfer.
//!
//! Native enumerations are called twice: once with a null buffer to learn the
//! element count, then again with an arena buffer of exactly that many
//! elements. The fill must report the same count as the first call.

use crate::arena::{Arena, ArenaValue};
use crate::record::{NativeSymbol, Symbol};
use crate::{Error, Result};
use std::ffi::{CStr, c_char, c_int};
use std::marker::PhantomData;
use std::ptr::NonNull;
use tracing::trace;

/// A filled arena buffer.
pub struct Filled<'a, T> {
    base: NonNull<T>,
    len: usize,
    _scope: PhantomData<&'a Arena>,
}

impl<'a, T: ArenaValue> Filled<'a, T> {
    fn empty() -> Self {
        Self {
            base: NonNull::dangling(),
            len: 0,
            _scope: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointers to each element, in native order.
    pub fn elements(&self) -> impl Iterator<Item = NonNull<T>> + '_ {
        // SAFETY: every index is within the allocation
        (0..self.len).map(move |i| unsafe { NonNull::new_unchecked(self.base.as_ptr().add(i)) })
    }

    pub fn read(&self, index: usize) -> Option<T> {
        (index < self.len).then(|| unsafe { self.base.as_ptr().add(index).read() })
    }
}

/// Run the count-then-fill protocol for one native operation.
///
/// `query` is handed a null pointer for the count and the arena buffer for the
/// fill; it returns the native status or count.
pub fn fetch<'a, T, F>(arena: &'a Arena, operation: &'static str, mut query: F) -> Result<Filled<'a, T>>
where
    T: ArenaValue,
    F: FnMut(*mut T) -> c_int,
{
    let count = query(std::ptr::null_mut());
    if count < 0 {
        return Err(Error::NativeStatus {
            operation,
            status: count,
        });
    }

    let expected = count as usize;
    trace!("Native {} reports {} entries", operation, expected);
    if expected == 0 {
        return Ok(Filled::empty());
    }

    let base = arena.alloc_zeroed::<T>(expected);
    let filled = query(base.as_ptr());
    if filled < 0 {
        return Err(Error::NativeStatus {
            operation,
            status: filled,
        });
    }
    if filled as usize != expected {
        return Err(Error::CollectionChanged {
            expected,
            actual: filled as usize,
        });
    }

    Ok(Filled {
        base,
        len: expected,
        _scope: PhantomData,
    })
}

/// Fetch symbol records and wrap each one in a [`Symbol`] view.
pub fn symbols<'a, F>(arena: &'a Arena, operation: &'static str, query: F) -> Result<Vec<Symbol<'a>>>
where
    F: FnMut(*mut NativeSymbol) -> c_int,
{
    let filled = fetch(arena, operation, query)?;
    Ok(filled
        .elements()
        // SAFETY: the record lives in `arena`; names point into native tables
        // that outlive the caller's borrow of the image
        .map(|record| unsafe { Symbol::from_record(record) })
        .collect())
}

/// Fetch an array of name pointers and copy each name out.
///
/// The pointer array itself is scratch memory and is released before
/// returning.
pub fn names<F>(operation: &'static str, query: F) -> Result<Vec<String>>
where
    F: FnMut(*mut *const c_char) -> c_int,
{
    let scratch = Arena::new();
    let filled = fetch(&scratch, operation, query)?;
    let mut names = Vec::with_capacity(filled.len());
    for index in 0..filled.len() {
        let name = filled.read(index).unwrap_or(std::ptr::null());
        if name.is_null() {
            return Err(Error::NativeStatus {
                operation,
                status: -libc::EFAULT,
            });
        }
        names.push(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NO_ORDINAL;
    use std::ffi::c_void;

    const ALPHA: &CStr = c"alpha";
    const BETA: &CStr = c"beta";

    #[test]
    fn empty_collection_skips_fill() {
        let arena = Arena::new();
        let mut calls = 0;
        let result = symbols(&arena, "exports", |buffer| {
            calls += 1;
            assert!(buffer.is_null());
            0
        })
        .unwrap();
        assert!(result.is_empty());
        assert_eq!(calls, 1);
        assert_eq!(arena.allocations(), 0);
    }

    #[test]
    fn count_failure_is_reported() {
        let arena = Arena::new();
        let mut calls = 0;
        let result = fetch::<NativeSymbol, _>(&arena, "imports", |_| {
            calls += 1;
            -libc::EINVAL
        });
        assert!(matches!(
            result,
            Err(Error::NativeStatus { operation: "imports", status }) if status == -libc::EINVAL
        ));
        assert_eq!(calls, 1);
    }

    #[test]
    fn fill_failure_discards_partial_results() {
        let arena = Arena::new();
        let mut calls = 0;
        let result = symbols(&arena, "exports", |buffer| {
            calls += 1;
            if buffer.is_null() {
                return 2;
            }
            unsafe { buffer.write(NativeSymbol::new(ALPHA.as_ptr(), std::ptr::null_mut(), 1)) };
            -libc::EIO
        });
        assert!(matches!(result, Err(Error::NativeStatus { status, .. }) if status == -libc::EIO));
        assert_eq!(calls, 2);
    }

    #[test]
    fn count_change_between_calls_is_detected() {
        let arena = Arena::new();
        let result = fetch::<NativeSymbol, _>(&arena, "exports", |buffer| if buffer.is_null() { 3 } else { 2 });
        assert!(matches!(
            result,
            Err(Error::CollectionChanged {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn symbols_preserve_native_order() {
        let arena = Arena::new();
        let exported = [
            NativeSymbol::new(ALPHA.as_ptr(), 0x1000 as *mut c_void, NO_ORDINAL),
            NativeSymbol::new(std::ptr::null(), 0x2000 as *mut c_void, 4),
            NativeSymbol::new(BETA.as_ptr(), 0x3000 as *mut c_void, 9),
        ];
        let result = symbols(&arena, "exports", |buffer| {
            if !buffer.is_null() {
                unsafe { std::ptr::copy_nonoverlapping(exported.as_ptr(), buffer, exported.len()) };
            }
            exported.len() as c_int
        })
        .unwrap();

        let identifiers: Vec<_> = result.iter().map(Symbol::identifier).collect();
        assert_eq!(identifiers, ["alpha", "4", "beta(9)"]);
        assert_eq!(result[1].address() as usize, 0x2000);
    }

    #[test]
    fn names_are_copied_out() {
        let modules = [ALPHA.as_ptr(), BETA.as_ptr()];
        let mut calls = 0;
        let result = names("modules", |buffer| {
            calls += 1;
            if !buffer.is_null() {
                unsafe { std::ptr::copy_nonoverlapping(modules.as_ptr(), buffer, modules.len()) };
            }
            modules.len() as c_int
        })
        .unwrap();
        assert_eq!(result, ["alpha", "beta"]);
        assert_eq!(calls, 2);
    }

    #[test]
    fn null_name_is_rejected() {
        let result = names("modules", |_| 1);
        assert!(matches!(result, Err(Error::NativeStatus { operation: "modules", .. })));
    }
}
