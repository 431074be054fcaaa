//! Opened PE images.
//!
//! A [`PeFile`] owns one native image handle and releases it exactly once,
//! either through [`PeFile::close`] or on drop. Symbols returned by the
//! enumeration methods borrow the file, so the borrow checker keeps them from
//! outliving the handle.
//!
//! The native side treats an open image as immutable: enumerations are
//! expected to report the same entries every time they are called.

use crate::abi::{Downcall, Signature, Value, foreign_binder};
use crate::arena::Arena;
use crate::marshal;
use crate::native::{NativeCallTable, OpenOptions, RawPeFile, natives};
use crate::record::Symbol;
use crate::symbols;
use crate::{Error, Result};
use std::ffi::{CString, c_void};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::{debug, trace};

/// Opens images through a native call table.
#[derive(Debug, Clone, Copy)]
pub struct PeLoader<'n> {
    natives: &'n NativeCallTable,
}

impl PeLoader<'static> {
    /// A loader backed by the process-wide native library.
    pub fn new() -> Result<Self> {
        Ok(Self { natives: natives()? })
    }
}

impl<'n> PeLoader<'n> {
    pub fn with_table(natives: &'n NativeCallTable) -> Self {
        Self { natives }
    }

    /// Open the image at `path`.
    ///
    /// The path is resolved to its canonical form and must name a regular
    /// file; anything else is rejected without calling into native code.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<PeFile<'n>> {
        use std::os::unix::ffi::OsStrExt;

        let real = std::fs::canonicalize(path.as_ref())?;
        if !std::fs::metadata(&real)?.is_file() {
            return Err(Error::InvalidPath(format!("{} is not a regular file", real.display())));
        }
        let c_path = CString::new(real.as_os_str().as_bytes()).map_err(|_| Error::InteriorNul)?;

        let mut raw = std::ptr::null_mut();
        let status = unsafe { self.natives.open(&c_path, &mut raw) };
        let handle = opened("open", status, raw)?;

        debug!("Opened {} as {:p}", real.display(), handle);
        Ok(PeFile {
            natives: self.natives,
            handle: Some(handle),
            source: Source::Path(real),
        })
    }

    /// Open an image that is already in memory.
    ///
    /// The bytes are kept by the returned file and freed after the native
    /// handle is closed.
    pub fn open_bytes(&self, bytes: impl Into<Vec<u8>>) -> Result<PeFile<'n>> {
        let buffer = bytes.into().into_boxed_slice();
        if buffer.is_empty() {
            return Err(Error::EmptyImage);
        }

        let options = OpenOptions::memory(&buffer);
        let mut raw = std::ptr::null_mut();
        let status = unsafe { self.natives.open_ex(&options, &mut raw) };
        let handle = opened("openEx", status, raw)?;

        debug!("Opened {} byte image as {:p}", buffer.len(), handle);
        Ok(PeFile {
            natives: self.natives,
            handle: Some(handle),
            source: Source::Memory(buffer),
        })
    }
}

/// Open the image at `path` with the process-wide native library.
pub fn open_image(path: impl AsRef<Path>) -> Result<PeFile<'static>> {
    PeLoader::new()?.open(path)
}

// The native open can report failure with either sign, so anything but a
// zero status and a non-null handle is an error.
fn opened(operation: &'static str, status: i32, raw: *mut RawPeFile) -> Result<NonNull<RawPeFile>> {
    match NonNull::new(raw) {
        Some(handle) if status == 0 => Ok(handle),
        _ => Err(Error::NativeStatus { operation, status }),
    }
}

enum Source {
    Path(PathBuf),
    Memory(Box<[u8]>),
}

impl Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Path(path) => write!(f, "{}", path.display()),
            Source::Memory(bytes) => write!(f, "<memory, {} bytes>", bytes.len()),
        }
    }
}

/// Outcome of [`PeFile::bind_registered`], as `module!symbol` identifiers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BindReport {
    pub bound: Vec<String>,
    pub unresolved: Vec<String>,
}

/// An open PE image.
///
/// Not synchronized; use from one thread at a time.
pub struct PeFile<'n> {
    natives: &'n NativeCallTable,
    handle: Option<NonNull<RawPeFile>>,
    source: Source,
}

impl<'n> PeFile<'n> {
    /// Canonical path of the image, if it was opened from disk.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            Source::Path(path) => Some(path),
            Source::Memory(_) => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }

    fn handle(&self) -> Result<NonNull<RawPeFile>> {
        self.handle.ok_or(Error::Closed)
    }

    /// Satisfy the import `symbol` of `module` with the symbol's address.
    pub fn bind_import(&self, module: &str, symbol: &Symbol<'_>) -> Result<()> {
        let handle = self.handle()?;
        if !symbol.is_valid() {
            return Err(Error::InvalidSymbol);
        }
        if symbol.address().is_null() {
            return Err(Error::UnsatisfiedLink(format!("{}!{} has no address", module, symbol)));
        }
        let c_module = CString::new(module).map_err(|_| Error::InteriorNul)?;

        let status = unsafe { self.natives.import(handle, &c_module, symbol.as_ptr()) };
        if status < 0 {
            return Err(Error::UnsatisfiedLink(format!(
                "failed to bind {}!{} (status {})",
                module, symbol, status
            )));
        }
        debug!("Bound {}!{} to {:p}", module, symbol, symbol.address());
        Ok(())
    }

    /// Fill in the address of the export identified by `symbol`.
    pub fn export(&self, symbol: &mut Symbol<'_>) -> Result<()> {
        let handle = self.handle()?;
        if !symbol.is_valid() {
            return Err(Error::InvalidSymbol);
        }

        let status = unsafe { self.natives.export(handle, symbol.as_ptr()) };
        if status < 0 || symbol.address().is_null() {
            return Err(Error::UnsatisfiedLink(format!(
                "export {} not found in {} (status {})",
                symbol, self.source, status
            )));
        }
        debug!("Resolved export {} at {:p}", symbol, symbol.address());
        Ok(())
    }

    /// Resolve an export and build a Windows x64 call handle for it.
    ///
    /// The handle borrows the file, so it cannot be used once the file is
    /// closed:
    ///
    /// ```compile_fail
    /// # fn call_after_close(mut file: peloader::PeFile<'static>, arena: &peloader::Arena) -> peloader::Result<()> {
    /// let mut symbol = peloader::Symbol::of_name(arena, "add")?;
    /// let signature = peloader::Signature::of_void(&[]);
    /// let call = file.export_downcall(&mut symbol, &signature)?;
    /// file.close()?;
    /// unsafe { call.invoke(&[]) }?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn export_downcall<'f>(&'f self, symbol: &mut Symbol<'_>, signature: &Signature) -> Result<Downcall<'f>> {
        self.export(symbol)?;
        let address = NonNull::new(symbol.address())
            .ok_or_else(|| Error::UnsatisfiedLink(symbol.identifier()))?;
        foreign_binder()?.downcall(address, signature)
    }

    /// Names of the imported modules, in declaration order.
    pub fn modules(&self) -> Result<Vec<String>> {
        let handle = self.handle()?;
        marshal::names("modules", |names| unsafe { self.natives.modules(handle, names) })
    }

    /// Imports of `module`, allocated in `arena`.
    pub fn imports<'a>(&'a self, module: &str, arena: &'a Arena) -> Result<Vec<Symbol<'a>>> {
        let handle = self.handle()?;
        let c_module = CString::new(module).map_err(|_| Error::InteriorNul)?;
        let symbols = marshal::symbols(arena, "imports", |buffer| unsafe {
            self.natives.imports(handle, &c_module, buffer)
        })?;
        trace!("{} imports {} symbols from {}", self.source, symbols.len(), module);
        Ok(symbols)
    }

    /// Exports of the image, allocated in `arena`.
    pub fn exports<'a>(&'a self, arena: &'a Arena) -> Result<Vec<Symbol<'a>>> {
        let handle = self.handle()?;
        let symbols = marshal::symbols(arena, "exports", |buffer| unsafe { self.natives.exports(handle, buffer) })?;
        trace!("{} exports {} symbols", self.source, symbols.len());
        Ok(symbols)
    }

    /// Bind every import that a registered provider covers.
    pub fn bind_registered(&self, arena: &Arena) -> Result<BindReport> {
        let mut report = BindReport::default();
        for module in self.modules()? {
            for mut symbol in self.imports(&module, arena)? {
                let provider = symbol
                    .name()
                    .and_then(|name| name.to_str().ok())
                    .and_then(|name| symbols::lookup(&module, name));
                let qualified = format!("{}!{}", module, symbol);
                match provider {
                    Some(address) => {
                        symbol.set_address(address);
                        self.bind_import(&module, &symbol)?;
                        report.bound.push(qualified);
                    }
                    None => {
                        trace!("No provider for {}", qualified);
                        report.unresolved.push(qualified);
                    }
                }
            }
        }
        debug!(
            "Bound {} registered imports, {} unresolved",
            report.bound.len(),
            report.unresolved.len()
        );
        Ok(report)
    }

    /// Release the native handle. Further operations fail with [`Error::Closed`].
    pub fn close(&mut self) -> Result<()> {
        let handle = self.handle.take().ok_or(Error::Closed)?;
        let mut raw = handle.as_ptr();
        unsafe { self.natives.close(&mut raw) };
        debug!("Closed {}", self.source);
        Ok(())
    }
}

impl Drop for PeFile<'_> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.close();
        }
    }
}

impl std::fmt::Debug for PeFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeFile")
            .field("source", &self.source.to_string())
            .field("handle", &self.handle)
            .finish()
    }
}

/// Build a Windows x64 stub that calls `target`, owned by `arena`.
pub fn make_foreign_callback<F>(arena: &Arena, signature: &Signature, target: F) -> Result<NonNull<c_void>>
where
    F: Fn(&[Value]) -> Value + Send + Sync + 'static,
{
    let stub = foreign_binder()?.upcall(signature, Box::new(target))?;
    Ok(arena.adopt(stub))
}
