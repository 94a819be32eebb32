//! infernofs - dyld shared cache software-rendering patcher.
//!
//! This library rewrites a small set of GPU checks inside Apple's dyld
//! shared cache so the user-space frameworks treat software rendering as
//! authoritative. It parses the multi-file cache format (main cache,
//! subcaches, symbols sidecar), resolves exported symbols and
//! Objective-C classes inside embedded images, and overwrites a handful
//! of ARM64 instructions at the resolved sites. Displaced bytes are
//! preserved in a sidecar file so every patch session is reversible.
//!
//! # Example
//!
//! ```no_run
//! use infernofs::{CacheAnalyser, ImageMatcher, Patcher};
//! use infernofs::arm64::Assembler;
//!
//! fn main() -> infernofs::Result<()> {
//!     let analyser = CacheAnalyser::open("/path/to/dyld_shared_cache_arm64e")?;
//!     let image = analyser.find_image(&ImageMatcher::Framework("CoreImage"), false)?;
//!     let addr = image.resolve_sym(&["_CIGLIsUsable"])?;
//!
//!     let mut patcher = Patcher::new();
//!     let mut asm = Assembler::new(&mut patcher);
//!     asm.write_ret(image.path, image.header, addr)?;
//!     patcher.print_changes();
//!     patcher.commit()?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod analyser;
pub mod arm64;
pub mod dyld;
pub mod error;
pub mod macho;
pub mod patcher;
pub mod patches;
pub mod reader;

// Re-export main types
pub use analyser::{CacheAnalyser, CacheEntry, Image, ImageMatcher};
pub use error::{Error, Result};
pub use patcher::Patcher;

use std::path::Path;

use tracing::info;

/// Options controlling a patch run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Only restore the original bytes; stage nothing.
    pub revert_only: bool,
    /// Stage and display the patches without committing them.
    pub dry_run: bool,
    /// Also patch libsystem_trace to unredact os_log output.
    pub unredact_logs: bool,
}

/// Runs a full patch session over the cache tree at `cache_path`.
///
/// Every session starts by reverting the previous one, so the staged
/// patches always describe pristine cache bytes. With
/// [`RunOptions::dry_run`] the staged writes are displayed but never
/// committed; with [`RunOptions::revert_only`] the session stops after
/// the revert.
pub fn run<P: AsRef<Path>>(cache_path: P, options: &RunOptions) -> Result<()> {
    let analyser = CacheAnalyser::open(cache_path)?;

    info!("reverting previous patches");
    for cache in &analyser.caches {
        Patcher::revert(&cache.path)?;
    }
    info!("bytes reverted successfully");

    if options.revert_only {
        return Ok(());
    }

    let mut patcher = Patcher::new();
    info!("building patches");
    patches::apply_all(&analyser, &mut patcher, options.unredact_logs)?;
    info!("patches built successfully");

    patcher.print_changes();

    if !options.dry_run {
        info!("applying changes");
        patcher.commit()?;
        info!("changes applied successfully");
    }

    Ok(())
}
