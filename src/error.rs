//! Error types for cache analysis and patching.
//!
//! All errors surface to the immediate caller; nothing is recovered
//! inside the core. Patch recipes use [`Error::is_not_found`] to degrade
//! gracefully around patch sites that do not exist on every platform
//! version.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for cache analysis and patching operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Out-of-Range Errors ====================
    #[error("read past the end of the stream")]
    UnexpectedEof,

    #[error("seek to {offset:#x} out of range")]
    SeekOutOfRange { offset: i64 },

    #[error("address {addr:#x} not found in any cache mapping")]
    AddressNotFound { addr: u64 },

    // ==================== Format Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("main cache expected, but got a subcache")]
    MainCacheExpected,

    #[error("malformed original-bytes file: token '{token}'")]
    MalformedSidecar { token: String },

    // ==================== Not-Found Errors ====================
    #[error("image '{name}' not found")]
    ImageNotFound { name: String },

    #[error("symbol '{name}' not found")]
    SymbolNotFound { name: String },

    #[error("Objective-C class '{name}' not found")]
    ObjcClassNotFound { name: String },

    #[error("segment '{name}' not found")]
    SegmentNotFound { name: String },

    #[error("section '{segment},{section}' not found")]
    SectionNotFound { segment: String, section: String },

    #[error("no {pattern} instruction within {inst_limit} candidates of {start_addr:#x}")]
    InstructionNotFound {
        pattern: &'static str,
        start_addr: u64,
        inst_limit: u32,
    },

    // ==================== Unsupported Fixups ====================
    #[error("stumbled upon an authenticated bind pointer ({fixup:#x})")]
    AuthBindFixup { fixup: u64 },

    #[error("stumbled upon a bind pointer ({fixup:#x})")]
    BindFixup { fixup: u64 },

    // ==================== Invalid Operands ====================
    #[error("cannot encode a shift for a wide movz")]
    MovzWideShift,

    #[error("adrp target {pages} pages away is out of range")]
    AdrpOutOfRange { pages: i64 },

    #[error("add immediate {imm:#x} does not fit in 12 bits")]
    AddImmTooLarge { imm: u16 },
}

/// A specialized Result type for cache analysis and patching.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error means a requested entity or pattern is
    /// absent.
    ///
    /// Optional patch sites (symbols that only exist on some platform
    /// versions) are guarded with this.
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ImageNotFound { .. }
                | Error::SymbolNotFound { .. }
                | Error::ObjcClassNotFound { .. }
                | Error::SegmentNotFound { .. }
                | Error::SectionNotFound { .. }
                | Error::InstructionNotFound { .. }
        )
    }

    /// Returns true if this error means data was addressed outside the
    /// valid range of a stream or mapping.
    #[inline]
    pub fn is_out_of_range(&self) -> bool {
        matches!(
            self,
            Error::UnexpectedEof | Error::SeekOutOfRange { .. } | Error::AddressNotFound { .. }
        )
    }
}
