//! Rust functions that satisfy PE imports.
//!
//! Functions marked `#[pe_import("module.dll")]` are compiled with the
//! Windows x64 convention and collected into a distributed slice at link
//! time. [`PeFile::bind_registered`](crate::PeFile::bind_registered) walks an
//! image's imports and binds every one that has a provider here.

use linkme::distributed_slice;
use std::ffi::c_void;

/// A function pointer wrapper that's Sync.
#[derive(Clone, Copy)]
pub struct FnPtr(pub *const ());

// SAFETY: Function pointers point to immutable code, so they're safe to share.
unsafe impl Sync for FnPtr {}
unsafe impl Send for FnPtr {}

/// A Rust implementation of one imported function.
pub struct ImportProvider {
    /// DLL the image imports the function from, compared ASCII case-insensitively
    pub module: &'static str,
    /// Exported name
    pub name: &'static str,
    /// Windows x64 entry point
    pub address: FnPtr,
}

#[distributed_slice]
pub static IMPORT_PROVIDERS: [ImportProvider] = [..];

/// Look up the provider for `module!name`.
pub fn lookup(module: &str, name: &str) -> Option<*mut c_void> {
    find(&IMPORT_PROVIDERS, module, name)
}

/// Every provider linked into this binary.
pub fn providers() -> impl Iterator<Item = &'static ImportProvider> {
    IMPORT_PROVIDERS.iter()
}

fn find(providers: &[ImportProvider], module: &str, name: &str) -> Option<*mut c_void> {
    providers
        .iter()
        .find(|provider| provider.name == name && provider.module.eq_ignore_ascii_case(module))
        .map(|provider| provider.address.0 as *mut c_void)
}
