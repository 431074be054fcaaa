//! peloader - Windows x64 PE images on a Unix host.
//!
//! The PE container itself is parsed, relocated and mapped by a small native
//! library (`libPeLoader`) that exposes a C ABI. This crate is the bridge in
//! front of it: it binds the native entry points, moves symbol records across
//! the boundary, and synthesizes the calling-convention stubs a loaded image
//! needs to call into Rust (and Rust needs to call into the image).
//!
//! # Modules
//!
//! - [`abi`] - Call binders for the host and the foreign (Windows x64) convention
//! - [`arena`] - Scoped allocation of memory shared with native code
//! - [`record`] - The fixed-layout native symbol record and its managed view
//! - [`marshal`] - Two-phase (count, then fill) collection transfer
//! - [`native`] - Bundled library extraction and the native call table
//! - [`file`] - Opened image handles
//! - [`symbols`] - Link-time registry of Rust functions that satisfy imports
//!
//! # Error Handling
//!
//! Every operation returns the consolidated [`Error`] type. Startup failures
//! (platform, library, link, foreign convention) are [`StartupError`]s; they are
//! computed once and every later call observes the same failure.

extern crate self as peloader;

pub mod abi;
pub mod arena;
pub mod file;
pub mod marshal;
pub mod native;
pub mod record;
pub mod symbols;

pub use linkme;
pub use macros::pe_import;

/// Consolidated error type for all peloader operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("startup failed: {0}")]
    Startup(#[from] StartupError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsatisfied link: {0}")]
    UnsatisfiedLink(String),

    #[error("native {operation} failed with status {status}")]
    NativeStatus {
        operation: &'static str,
        status: i32,
    },

    #[error("collection changed between count and fill: expected {expected}, got {actual}")]
    CollectionChanged { expected: usize, actual: usize },

    #[error("symbol needs a name or an ordinal")]
    InvalidSymbol,

    #[error("invalid image path: {0}")]
    InvalidPath(String),

    #[error("image buffer is empty")]
    EmptyImage,

    #[error("string contains an interior nul byte")]
    InteriorNul,

    #[error("image handle is closed")]
    Closed,

    #[error("unsupported signature: {0}")]
    UnsupportedSignature(String),

    #[error("argument mismatch: {0}")]
    ArgumentMismatch(String),

    #[error("stub allocation failed: {0}")]
    StubAllocation(String),
}

/// Fatal process-wide initialization failures.
///
/// These are cached by the lazily initialized native table and foreign binder,
/// so they must be cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartupError {
    #[error("unsupported OS/arch combination: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("bundled native library {0} is missing")]
    MissingNativeLibrary(String),

    #[error("failed to extract native library: {0}")]
    Extract(String),

    #[error("failed to load native library: {0}")]
    LibraryLoad(String),

    #[error("unsatisfied link: {0}")]
    UnsatisfiedLink(String),

    #[error("foreign calling convention unavailable: {0}")]
    ForeignConvention(String),
}

pub type Result<T> = core::result::Result<T, Error>;

pub use abi::{CallBinder, CallConvention, Signature, Value, ValueType, foreign_binder, host_binder};
pub use arena::Arena;
pub use file::{BindReport, PeFile, PeLoader, make_foreign_callback, open_image};
pub use record::{NO_ORDINAL, NativeSymbol, Symbol};
