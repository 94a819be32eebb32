//! Mach-O image parsing.
//!
//! Only the pieces the patcher needs: the 64-bit header, segment and
//! section load commands, and the symbol-table command. Everything else
//! is skipped by its declared size.

mod header;
pub mod nlist;

pub use header::{MachHeader, Section, Segment, SymtabCommand};

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian).
pub const MH_MAGIC_64: u32 = 0xFEED_FACF;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag.
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// ARM CPU type.
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type.
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

// =============================================================================
// Load Commands
// =============================================================================

/// Link-edit symbol table info.
pub const LC_SYMTAB: u32 = 0x2;
/// 64-bit segment of this file.
pub const LC_SEGMENT_64: u32 = 0x19;

bitflags! {
    /// Mach VM protection bits, as found in segment and mapping records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmProt: u32 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXECUTE = 1 << 2;
    }
}
