//! The native loader library and its call table.
//!
//! `libPeLoader` is bundled into the binary at build time. On first use it is
//! written to a temporary file, loaded with `dlopen`, and the file is removed
//! again; every `peloader_*` entry point is then resolved up front. A missing
//! entry point fails startup instead of failing on first call.
//!
//! The entry points use the host's C convention, which is what Rust's
//! `extern "C"` function pointers already speak, so the table holds them
//! directly.

use crate::record::NativeSymbol;
use crate::{Result, StartupError};
use once_cell::sync::Lazy;
use std::ffi::{CStr, CString, OsString, c_char, c_int, c_void};
use std::io::Write;
use std::marker::{PhantomData, PhantomPinned};
use std::path::Path;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Prefix of every exported entry point.
pub const SYMBOL_PREFIX: &str = "peloader_";

/// Environment variable naming an on-disk library to use instead of the bundled one.
pub const LIBRARY_ENV: &str = "PELOADER_NATIVE_LIBRARY";

/// Version of [`OpenOptions`] understood by the native side.
pub const OPTIONS_VERSION: c_int = 1;
pub const OPEN_FILE: c_int = 0;
pub const OPEN_MEMORY: c_int = 1;

static BUNDLED: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/libPeLoader.bin"));

/// A supported host, in the normalized names used for bundled resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
}

impl Platform {
    pub fn current() -> std::result::Result<Self, StartupError> {
        Self::normalize(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn normalize(os: &str, arch: &str) -> std::result::Result<Self, StartupError> {
        let normalized_os = match os.to_ascii_lowercase().as_str() {
            "linux" => Some("linux"),
            _ => None,
        };
        let normalized_arch = match arch.to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Some("amd64"),
            _ => None,
        };

        match (normalized_os, normalized_arch) {
            (Some(os), Some(arch)) => Ok(Self { os, arch }),
            _ => Err(StartupError::UnsupportedPlatform {
                os: os.to_string(),
                arch: arch.to_string(),
            }),
        }
    }

    pub fn library_name(&self) -> &'static str {
        "libPeLoader.so"
    }

    /// Location of the library within the bundled resources.
    pub fn resource_path(&self) -> String {
        format!("natives/{}/{}/{}", self.os, self.arch, self.library_name())
    }
}

/// Opaque image handle owned by the native side.
#[repr(C)]
pub struct RawPeFile {
    _data: [u8; 0],
    _marker: PhantomData<(*mut u8, PhantomPinned)>,
}

/// Invoked by the native side when a memory image is closed.
pub type FreeCallback = Option<unsafe extern "C" fn(buffer: *const c_void, user: *mut c_void)>;

#[derive(Clone, Copy)]
#[repr(C)]
pub struct MemorySource {
    pub buffer: *const c_void,
    pub length: usize,
    pub callback: FreeCallback,
    pub user: *mut c_void,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub union OpenSource {
    pub path: *const c_char,
    pub memory: MemorySource,
}

/// Argument block of `peloader_openEx`.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct OpenOptions {
    pub version: c_int,
    pub mode: c_int,
    pub file: OpenSource,
}

const _: () = assert!(std::mem::size_of::<OpenOptions>() == 40);

impl OpenOptions {
    pub fn path(path: &CStr) -> Self {
        Self {
            version: OPTIONS_VERSION,
            mode: OPEN_FILE,
            file: OpenSource { path: path.as_ptr() },
        }
    }

    /// Open `bytes` in place. The caller keeps the buffer alive until close.
    pub fn memory(bytes: &[u8]) -> Self {
        Self {
            version: OPTIONS_VERSION,
            mode: OPEN_MEMORY,
            file: OpenSource {
                memory: MemorySource {
                    buffer: bytes.as_ptr() as *const c_void,
                    length: bytes.len(),
                    callback: None,
                    user: std::ptr::null_mut(),
                },
            },
        }
    }
}

pub type OpenFn = unsafe extern "C" fn(path: *const c_char, result: *mut *mut RawPeFile) -> c_int;
pub type OpenExFn = unsafe extern "C" fn(options: *const OpenOptions, result: *mut *mut RawPeFile) -> c_int;
pub type CloseFn = unsafe extern "C" fn(file: *mut *mut RawPeFile);
pub type ImportFn =
    unsafe extern "C" fn(file: *mut RawPeFile, module: *const c_char, symbol: *const NativeSymbol) -> c_int;
pub type ExportFn = unsafe extern "C" fn(file: *mut RawPeFile, symbol: *mut NativeSymbol) -> c_int;
pub type ModulesFn = unsafe extern "C" fn(file: *mut RawPeFile, names: *mut *const c_char) -> c_int;
pub type ImportsFn =
    unsafe extern "C" fn(file: *mut RawPeFile, module: *const c_char, symbols: *mut NativeSymbol) -> c_int;
pub type ExportsFn = unsafe extern "C" fn(file: *mut RawPeFile, symbols: *mut NativeSymbol) -> c_int;

/// Typed handles to every native entry point.
///
/// Immutable once bound and safe to share between threads.
#[derive(Clone, Copy)]
pub struct NativeCallTable {
    pub open: OpenFn,
    pub open_ex: OpenExFn,
    pub close: CloseFn,
    pub import: ImportFn,
    pub export: ExportFn,
    pub modules: ModulesFn,
    pub imports: ImportsFn,
    pub exports: ExportsFn,
}

impl NativeCallTable {
    /// Resolve every entry point in `library`.
    pub fn bind(library: &NativeLibrary) -> std::result::Result<Self, StartupError> {
        unsafe {
            Ok(Self {
                open: library.function("open")?,
                open_ex: library.function("openEx")?,
                close: library.function("close")?,
                import: library.function("import")?,
                export: library.function("export")?,
                modules: library.function("modules")?,
                imports: library.function("imports")?,
                exports: library.function("exports")?,
            })
        }
    }

    /// # Safety
    ///
    /// `path` must stay valid for the duration of the call.
    pub unsafe fn open(&self, path: &CStr, result: &mut *mut RawPeFile) -> c_int {
        unsafe { (self.open)(path.as_ptr(), result) }
    }

    /// # Safety
    ///
    /// Any memory referenced by `options` must outlive the returned handle.
    pub unsafe fn open_ex(&self, options: &OpenOptions, result: &mut *mut RawPeFile) -> c_int {
        unsafe { (self.open_ex)(options, result) }
    }

    /// # Safety
    ///
    /// `file` must be an open handle; it is null afterwards.
    pub unsafe fn close(&self, file: &mut *mut RawPeFile) {
        unsafe { (self.close)(file) }
    }

    /// # Safety
    ///
    /// `file` must be open and `symbol` must point to a valid record.
    pub unsafe fn import(&self, file: NonNull<RawPeFile>, module: &CStr, symbol: *const NativeSymbol) -> c_int {
        unsafe { (self.import)(file.as_ptr(), module.as_ptr(), symbol) }
    }

    /// # Safety
    ///
    /// `file` must be open and `symbol` must point to a valid record.
    pub unsafe fn export(&self, file: NonNull<RawPeFile>, symbol: *mut NativeSymbol) -> c_int {
        unsafe { (self.export)(file.as_ptr(), symbol) }
    }

    /// # Safety
    ///
    /// `file` must be open; `names` is null or has room for every module.
    pub unsafe fn modules(&self, file: NonNull<RawPeFile>, names: *mut *const c_char) -> c_int {
        unsafe { (self.modules)(file.as_ptr(), names) }
    }

    /// # Safety
    ///
    /// `file` must be open; `symbols` is null or has room for every import.
    pub unsafe fn imports(&self, file: NonNull<RawPeFile>, module: &CStr, symbols: *mut NativeSymbol) -> c_int {
        unsafe { (self.imports)(file.as_ptr(), module.as_ptr(), symbols) }
    }

    /// # Safety
    ///
    /// `file` must be open; `symbols` is null or has room for every export.
    pub unsafe fn exports(&self, file: NonNull<RawPeFile>, symbols: *mut NativeSymbol) -> c_int {
        unsafe { (self.exports)(file.as_ptr(), symbols) }
    }
}

impl std::fmt::Debug for NativeCallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeCallTable")
            .field("open", &(self.open as *const ()))
            .field("close", &(self.close as *const ()))
            .finish_non_exhaustive()
    }
}

/// A shared library loaded with `dlopen`.
pub struct NativeLibrary {
    handle: NonNull<c_void>,
}

// SAFETY: dl handles may be used from any thread.
unsafe impl Send for NativeLibrary {}
unsafe impl Sync for NativeLibrary {}

impl NativeLibrary {
    pub fn open(path: &Path) -> std::result::Result<Self, StartupError> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| StartupError::LibraryLoad(format!("{}: path contains a nul byte", path.display())))?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        let handle = NonNull::new(handle)
            .ok_or_else(|| StartupError::LibraryLoad(format!("{}: {}", path.display(), last_dl_error())))?;

        debug!("Loaded native library {} at {:p}", path.display(), handle);
        Ok(Self { handle })
    }

    /// Write `bytes` to a temporary file, load it, and remove the file.
    pub fn extract(bytes: &[u8], name: &str) -> std::result::Result<Self, StartupError> {
        let mut file = tempfile::Builder::new()
            .prefix("peloader-")
            .suffix(&format!("-{}", name))
            .tempfile()
            .map_err(|e| StartupError::Extract(e.to_string()))?;
        file.write_all(bytes)
            .and_then(|_| file.flush())
            .map_err(|e| StartupError::Extract(e.to_string()))?;

        debug!("Extracted {} ({} bytes) to {}", name, bytes.len(), file.path().display());
        let library = Self::open(file.path());
        if let Err(e) = file.close() {
            warn!("Failed to remove extracted {}: {}", name, e);
        }
        library
    }

    /// Address of `name`, which must be exported.
    pub fn symbol(&self, name: &str) -> std::result::Result<NonNull<c_void>, StartupError> {
        let c_name = CString::new(name).map_err(|_| StartupError::UnsatisfiedLink(name.to_string()))?;
        let address = unsafe { libc::dlsym(self.handle.as_ptr(), c_name.as_ptr()) };
        match NonNull::new(address) {
            Some(address) => {
                debug!("Resolved {} at {:p}", name, address);
                Ok(address)
            }
            None => Err(StartupError::UnsatisfiedLink(name.to_string())),
        }
    }

    /// Resolve the prefixed entry point `name` as a function pointer of type `F`.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the native definition.
    unsafe fn function<F: Copy>(&self, name: &str) -> std::result::Result<F, StartupError> {
        const { assert!(std::mem::size_of::<F>() == std::mem::size_of::<*mut c_void>()) };
        let address = self.symbol(&format!("{}{}", SYMBOL_PREFIX, name))?;
        Ok(unsafe { std::mem::transmute_copy(&address.as_ptr()) })
    }
}

impl Drop for NativeLibrary {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
    }
}

fn last_dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        "unknown dlopen error".to_string()
    } else {
        unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
    }
}

type Loaded = std::result::Result<(NativeLibrary, NativeCallTable), StartupError>;

static NATIVES: Lazy<Loaded> = Lazy::new(load);

fn load() -> Loaded {
    load_from(std::env::var_os(LIBRARY_ENV), BUNDLED)
}

/// Load `override_path` if given, otherwise extract `bundled`.
fn load_from(override_path: Option<OsString>, bundled: &[u8]) -> Loaded {
    let platform = Platform::current()?;
    let library = match override_path {
        Some(path) => {
            debug!("Using native library from {}", LIBRARY_ENV);
            NativeLibrary::open(Path::new(&path))?
        }
        None => {
            if bundled.is_empty() {
                return Err(StartupError::MissingNativeLibrary(platform.resource_path()));
            }
            NativeLibrary::extract(bundled, platform.library_name())?
        }
    };
    let table = NativeCallTable::bind(&library)?;
    Ok((library, table))
}

/// The process-wide call table, loaded on first use.
///
/// A failed load is cached and returned to every caller.
pub fn natives() -> Result<&'static NativeCallTable> {
    match &*NATIVES {
        Ok((_, table)) => Ok(table),
        Err(e) => Err(e.clone().into()),
    }
}
