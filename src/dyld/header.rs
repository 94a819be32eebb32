//! Multi-version dyld cache header decoding.
//!
//! The cache header has grown over the years without a version number;
//! which fields exist is keyed off the value of the mapping-offset field
//! right after the magic. A cache tree is one main file, zero or more
//! subcache files, and optionally a `.symbols` sidecar that carries only
//! the local-symbols table.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Seek};

use crate::error::{Error, Result};
use crate::macho::VmProt;
use crate::reader::CacheRead;

/// Absolute header offsets and version thresholds.
///
/// The thresholds compare against the mapping-offset field: a header
/// field exists when the mappings start past it. Each hex value is the
/// `offsetof` of the named field in Apple's `dyld_cache_header` and must
/// be preserved bit-exactly; do not infer behaviour for thresholds not
/// listed here.
pub mod layout {
    /// Mapping-offset/count pair, right after the 16-byte magic.
    pub const MAPPING_INFO: u64 = 0x10;
    /// Legacy image-directory offset/count pair.
    pub const IMAGES_OLD: u64 = 0x18;
    /// Local-symbols info file offset (`localSymbolsOffset`).
    pub const LOCAL_SYMBOLS: u64 = 0x48;
    /// Unslid base address of the cache (`sharedRegionStart`).
    pub const CACHE_BASE: u64 = 0xE0;
    /// Subcache-directory offset/count pair (`subCacheArrayOffset`).
    pub const SUBCACHES: u64 = 0x188;
    /// Symbol-file UUID field (`symbolFileUUID`).
    pub const SYMBOL_UUID: u64 = 0x190;
    /// Split-layout image-directory offset/count pair (`imagesOffset`).
    pub const IMAGES_NEW: u64 = 0x1C0;
    /// Mapping offsets at or past `offsetof(subCacheArrayCount)` carry a
    /// subcache directory and use the new image directory.
    pub const MIN_MAPPING_OFF_SPLIT: u32 = 0x18C;
    /// Mapping offsets at or past `offsetof(symbolFileUUID)` carry a
    /// symbol-file UUID and 64-bit local-symbol entries.
    pub const MIN_MAPPING_OFF_SYMBOL_UUID: u32 = 0x190;
    /// Mapping offsets at or below `offsetof(cacheSubType)` use v1
    /// subcache entries whose suffix is derived from the index.
    pub const MAX_MAPPING_OFF_SUBCACHE_V1: u32 = 0x1C8;
}

/// Width of a v2 subcache suffix field.
const SUBCACHE_SUFFIX_LEN: usize = 32;

// =============================================================================
// Cache Members
// =============================================================================

/// The role a file plays within a cache tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRole {
    /// The main cache file; unique and parsed first.
    Main,
    /// A secondary cache file referenced by the main header.
    Sub,
    /// The `.symbols` sidecar carrying only the local-symbols table.
    Symbols,
}

/// A 16-byte cache UUID; the zero UUID means "not present".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Uuid(pub [u8; 16]);

impl Uuid {
    /// Reads a UUID at the current stream position.
    pub fn parse<R: Read + Seek>(stream: &mut R) -> Result<Self> {
        let mut data = [0u8; 16];
        stream.read_exact_bytes(&mut data)?;
        Ok(Self(data))
    }

    /// Returns true for the all-zero UUID.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

/// A contiguous (vm range → file range) region of one cache member.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    /// Virtual memory base address.
    pub base: u64,
    /// Size in bytes.
    pub size: u64,
    /// File offset of the mapped bytes.
    pub file_off: u64,
    /// Maximum protection.
    pub max_prot: VmProt,
    /// Initial protection.
    pub init_prot: VmProt,
}

impl Mapping {
    fn parse<R: Read + Seek>(stream: &mut R) -> Result<Self> {
        Ok(Self {
            base: stream.read_u64_le()?,
            size: stream.read_u64_le()?,
            file_off: stream.read_u64_le()?,
            max_prot: VmProt::from_bits_retain(stream.read_u32_le()?),
            init_prot: VmProt::from_bits_retain(stream.read_u32_le()?),
        })
    }

    /// Returns true if this mapping contains the given virtual address.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// Converts a virtual address inside this mapping to a file offset.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> u64 {
        self.file_off + (addr - self.base)
    }
}

/// A dylib declared by the main cache's image directory.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Virtual address of the image's Mach header.
    pub base: u64,
    /// Install path, e.g. `/usr/lib/libobjc.A.dylib`.
    pub path: String,
}

impl ImageInfo {
    fn parse<R: Read + Seek>(stream: &mut R) -> Result<Self> {
        let base = stream.read_u64_le()?;
        stream.skip(16)?; // mod time, inode
        let path_off = stream.read_u32_le()?;
        stream.skip(4)?; // pad
        let record_end = stream.stream_position()?;
        stream.seek_to(u64::from(path_off))?;
        let path = stream.read_cstr()?;
        stream.seek_to(record_end)?;
        Ok(Self { base, path })
    }
}

/// The local-symbols slice belonging to one dylib.
#[derive(Debug, Clone, Copy)]
pub struct LocalSymbols {
    /// First nlist entry of this dylib.
    pub nlist_start_index: u32,
    /// Number of nlist entries.
    pub nlist_count: u32,
}

/// The local-symbols block of a Main or Symbols member.
#[derive(Debug, Clone, Default)]
pub struct LocalSymbolsInfo {
    /// Offset of the nlist array, relative to the block start.
    pub nlist_off: u32,
    /// Offset of the string pool, relative to the block start.
    pub strings_off: u32,
    /// Per-dylib slices keyed by the dylib's vm base address.
    pub entries: HashMap<u64, LocalSymbols>,
}

impl LocalSymbolsInfo {
    /// Parses the block anchored at `block_off`.
    ///
    /// Entry keys are `cache_base + dylib_offset`; `entry_64` selects the
    /// wide dylib-offset layout used once a symbols sidecar exists.
    fn parse<R: Read + Seek>(
        stream: &mut R,
        block_off: u64,
        entry_64: bool,
        cache_base: u64,
    ) -> Result<Self> {
        stream.seek_to(block_off)?;
        let nlist_off = stream.read_u32_le()?;
        stream.skip(4)?; // nlist count
        let strings_off = stream.read_u32_le()?;
        stream.skip(4)?; // strings size
        let entries_offset = stream.read_u32_le()?;
        let entries_count = stream.read_u32_le()?;

        let mut entries = HashMap::with_capacity(entries_count as usize);
        stream.seek_to(block_off + u64::from(entries_offset))?;
        for _ in 0..entries_count {
            let dylib_offset = if entry_64 {
                stream.read_u64_le()?
            } else {
                u64::from(stream.read_u32_le()?)
            };
            let entry = LocalSymbols {
                nlist_start_index: stream.read_u32_le()?,
                nlist_count: stream.read_u32_le()?,
            };
            entries.insert(cache_base + dylib_offset, entry);
        }

        Ok(Self {
            nlist_off,
            strings_off,
            entries,
        })
    }
}

/// A subcache referenced by the main header.
#[derive(Debug, Clone)]
pub struct Subcache {
    /// VM offset of the subcache from the main cache base.
    pub vm_off: u64,
    /// Filename suffix appended to the main cache path.
    pub suffix: String,
}

impl Subcache {
    fn parse<R: Read + Seek>(stream: &mut R, index: u32, v1: bool) -> Result<Self> {
        stream.skip(16)?; // uuid
        let vm_off = stream.read_u64_le()?;
        let suffix = if v1 {
            format!(".{}", index + 1)
        } else {
            stream.read_cstrn(SUBCACHE_SUFFIX_LEN)?
        };
        Ok(Self { vm_off, suffix })
    }
}

// =============================================================================
// Cache Header
// =============================================================================

/// Parsed header of one cache member.
///
/// Constructed once and immutable thereafter. Which fields are populated
/// depends on the member's [`CacheRole`]: Sub members carry only
/// mappings and the cache base, Symbols members only the local-symbols
/// table.
#[derive(Debug, Default)]
pub struct CacheHeader {
    /// Mappings declared by this member, disjoint in vm space.
    pub mappings: Vec<Mapping>,
    /// Image directory (Main only).
    pub images: Vec<ImageInfo>,
    /// Baseline virtual address of the cache.
    pub cache_base: u64,
    /// File offset of the local-symbols block, 0 when absent.
    pub local_symbols_off: u64,
    /// Local-symbols table (Main or Symbols).
    pub local_symbols: LocalSymbolsInfo,
    /// Subcache directory in declared order (Main only).
    pub subcaches: Vec<Subcache>,
    /// UUID of the `.symbols` sidecar; zero when none exists.
    pub symbol_file_uuid: Uuid,
}

impl CacheHeader {
    /// Parses a cache header of the given role.
    ///
    /// Sub and Symbols members rebase their local-symbol keys on
    /// `main_cache_base` when provided.
    pub fn parse<R: Read + Seek>(
        stream: &mut R,
        role: CacheRole,
        main_cache_base: Option<u64>,
    ) -> Result<Self> {
        let mut header = Self::default();

        stream.seek_to(layout::MAPPING_INFO)?;
        let mapping_off = stream.read_u32_le()?;
        let mapping_count = stream.read_u32_le()?;

        if role != CacheRole::Symbols && mapping_off != 0 && mapping_count != 0 {
            stream.seek_to(u64::from(mapping_off))?;
            header.mappings.reserve(mapping_count as usize);
            for _ in 0..mapping_count {
                header.mappings.push(Mapping::parse(stream)?);
            }
        }

        stream.seek_to(layout::CACHE_BASE)?;
        header.cache_base = stream.read_u64_le()?;

        if role == CacheRole::Sub {
            return Ok(header);
        }

        let symbol_file_support = if role == CacheRole::Symbols {
            true
        } else {
            let support = mapping_off >= layout::MIN_MAPPING_OFF_SYMBOL_UUID;
            if support {
                stream.seek_to(layout::SYMBOL_UUID)?;
                header.symbol_file_uuid = Uuid::parse(stream)?;
            }
            support
        };

        if role == CacheRole::Symbols || header.symbol_file_uuid.is_null() {
            stream.seek_to(layout::LOCAL_SYMBOLS)?;
            header.local_symbols_off = u64::from(stream.read_u32_le()?);
            if header.local_symbols_off != 0 {
                header.local_symbols = LocalSymbolsInfo::parse(
                    stream,
                    header.local_symbols_off,
                    symbol_file_support,
                    main_cache_base.unwrap_or(header.cache_base),
                )?;
            }
        }

        if role != CacheRole::Main {
            return Ok(header);
        }

        let split = mapping_off >= layout::MIN_MAPPING_OFF_SPLIT;

        stream.seek_to(if split {
            layout::IMAGES_NEW
        } else {
            layout::IMAGES_OLD
        })?;
        let image_off = stream.read_u32_le()?;
        let image_count = stream.read_u32_le()?;

        // Some subcache headers ship with the main header's fields copied
        // in, so an empty image directory in split layout is the reliable
        // tell that this is not a main cache.
        if split && image_count == 0 {
            return Err(Error::MainCacheExpected);
        }

        if image_off != 0 && image_count != 0 {
            stream.seek_to(u64::from(image_off))?;
            header.images.reserve(image_count as usize);
            for _ in 0..image_count {
                header.images.push(ImageInfo::parse(stream)?);
            }
        }

        if split {
            stream.seek_to(layout::SUBCACHES)?;
            let subcache_off = stream.read_u32_le()?;
            let subcache_count = stream.read_u32_le()?;

            if subcache_off != 0 && subcache_count != 0 {
                let v1 = mapping_off <= layout::MAX_MAPPING_OFF_SUBCACHE_V1;
                stream.seek_to(u64::from(subcache_off))?;
                header.subcaches.reserve(subcache_count as usize);
                for i in 0..subcache_count {
                    header.subcaches.push(Subcache::parse(stream, i, v1)?);
                }
            }
        }

        Ok(header)
    }

    /// Converts a virtual address to a file offset within this member.
    pub fn vm_addr_to_file_off(&self, vm_addr: u64) -> Result<u64> {
        self.mappings
            .iter()
            .find(|m| m.contains_addr(vm_addr))
            .map(|m| m.addr_to_offset(vm_addr))
            .ok_or(Error::AddressNotFound { addr: vm_addr })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn put_u32(buf: &mut Vec<u8>, off: usize, val: u32) {
        buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
    }

    fn put_u64(buf: &mut Vec<u8>, off: usize, val: u64) {
        buf[off..off + 8].copy_from_slice(&val.to_le_bytes());
    }

    fn put_bytes(buf: &mut Vec<u8>, off: usize, bytes: &[u8]) {
        buf[off..off + bytes.len()].copy_from_slice(bytes);
    }

    fn put_mapping(buf: &mut Vec<u8>, off: usize, base: u64, size: u64, file_off: u64) {
        put_u64(buf, off, base);
        put_u64(buf, off + 8, size);
        put_u64(buf, off + 16, file_off);
        put_u32(buf, off + 24, 5); // max_prot r-x
        put_u32(buf, off + 28, 5); // init_prot r-x
    }

    fn put_image(buf: &mut Vec<u8>, off: usize, base: u64, path_off: u32, path: &str) {
        put_u64(buf, off, base);
        put_u32(buf, off + 24, path_off);
        put_bytes(buf, path_off as usize, path.as_bytes());
    }

    /// Legacy layout: mapping offset below every threshold.
    fn legacy_main() -> Vec<u8> {
        let mut buf = vec![0u8; 0x400];
        put_u32(&mut buf, layout::MAPPING_INFO as usize, 0x180);
        put_u32(&mut buf, layout::MAPPING_INFO as usize + 4, 1);
        put_mapping(&mut buf, 0x180, 0x1_8000_0000, 0x10000, 0);
        put_u64(&mut buf, layout::CACHE_BASE as usize, 0x1_8000_0000);
        // Legacy image directory.
        put_u32(&mut buf, layout::IMAGES_OLD as usize, 0x200);
        put_u32(&mut buf, layout::IMAGES_OLD as usize + 4, 1);
        put_image(&mut buf, 0x200, 0x1_8000_1000, 0x240, "/usr/lib/libfoo.dylib");
        buf
    }

    /// Split layout with inline subcache suffixes and a symbols UUID.
    fn split_main() -> Vec<u8> {
        let mut buf = vec![0u8; 0x500];
        put_u32(&mut buf, layout::MAPPING_INFO as usize, 0x1D0);
        put_u32(&mut buf, layout::MAPPING_INFO as usize + 4, 1);
        put_mapping(&mut buf, 0x1D0, 0x1_8000_0000, 0x10000, 0);
        put_u64(&mut buf, layout::CACHE_BASE as usize, 0x1_8000_0000);
        put_bytes(&mut buf, layout::SYMBOL_UUID as usize, &[0xAB; 16]);
        // New image directory.
        put_u32(&mut buf, layout::IMAGES_NEW as usize, 0x300);
        put_u32(&mut buf, layout::IMAGES_NEW as usize + 4, 1);
        put_image(&mut buf, 0x300, 0x1_8000_1000, 0x340, "/usr/lib/libbar.dylib");
        // Subcache directory: one v2 entry (uuid, vm_off, 32-byte suffix).
        put_u32(&mut buf, layout::SUBCACHES as usize, 0x400);
        put_u32(&mut buf, layout::SUBCACHES as usize + 4, 1);
        put_u64(&mut buf, 0x410, 0x4000_0000);
        put_bytes(&mut buf, 0x418, b".01\0");
        buf
    }

    #[test]
    fn legacy_layout_has_no_uuid_and_no_subcaches() {
        let header =
            CacheHeader::parse(&mut Cursor::new(legacy_main()), CacheRole::Main, None).unwrap();
        assert!(header.symbol_file_uuid.is_null());
        assert!(header.subcaches.is_empty());
        assert_eq!(header.cache_base, 0x1_8000_0000);
        assert_eq!(header.images.len(), 1);
        assert_eq!(header.images[0].path, "/usr/lib/libfoo.dylib");
        assert_eq!(header.images[0].base, 0x1_8000_1000);
    }

    #[test]
    fn split_layout_reads_uuid_subcaches_and_new_images() {
        let header =
            CacheHeader::parse(&mut Cursor::new(split_main()), CacheRole::Main, None).unwrap();
        assert_eq!(header.symbol_file_uuid, Uuid([0xAB; 16]));
        assert_eq!(header.images.len(), 1);
        assert_eq!(header.images[0].path, "/usr/lib/libbar.dylib");
        assert_eq!(header.subcaches.len(), 1);
        assert_eq!(header.subcaches[0].suffix, ".01");
        assert_eq!(header.subcaches[0].vm_off, 0x4000_0000);
    }

    #[test]
    fn uuid_present_skips_local_symbols_anchor() {
        let mut buf = split_main();
        // Pretend a local-symbols block exists; it must be ignored while
        // the symbols sidecar UUID is set.
        put_u32(&mut buf, layout::LOCAL_SYMBOLS as usize, 0x4C0);
        let header = CacheHeader::parse(&mut Cursor::new(buf), CacheRole::Main, None).unwrap();
        assert_eq!(header.local_symbols_off, 0);
        assert!(header.local_symbols.entries.is_empty());
    }

    #[test]
    fn mid_split_layout_derives_v1_suffixes() {
        // Mapping offset between the split and inline-suffix thresholds.
        let mut buf = vec![0u8; 0x500];
        put_u32(&mut buf, layout::MAPPING_INFO as usize, 0x1A0);
        put_u32(&mut buf, layout::MAPPING_INFO as usize + 4, 1);
        put_mapping(&mut buf, 0x1A0, 0x1_8000_0000, 0x10000, 0);
        put_u64(&mut buf, layout::CACHE_BASE as usize, 0x1_8000_0000);
        put_u32(&mut buf, layout::IMAGES_NEW as usize, 0x300);
        put_u32(&mut buf, layout::IMAGES_NEW as usize + 4, 1);
        put_image(&mut buf, 0x300, 0x1_8000_1000, 0x340, "/usr/lib/libbaz.dylib");
        // Two v1 entries of 24 bytes each (uuid + vm_off, no suffix).
        put_u32(&mut buf, layout::SUBCACHES as usize, 0x400);
        put_u32(&mut buf, layout::SUBCACHES as usize + 4, 2);
        put_u64(&mut buf, 0x410, 0x4000_0000);
        put_u64(&mut buf, 0x428, 0x8000_0000);

        let header = CacheHeader::parse(&mut Cursor::new(buf), CacheRole::Main, None).unwrap();
        // 0x1A0 < 0x190 is false, so the UUID field exists but is zero.
        assert!(header.symbol_file_uuid.is_null());
        let suffixes: Vec<_> = header.subcaches.iter().map(|s| s.suffix.as_str()).collect();
        assert_eq!(suffixes, [".1", ".2"]);
        assert_eq!(header.subcaches[1].vm_off, 0x8000_0000);
    }

    #[test]
    fn split_subcache_masquerading_as_main_is_rejected() {
        let mut buf = split_main();
        put_u32(&mut buf, layout::IMAGES_NEW as usize + 4, 0);
        let err = CacheHeader::parse(&mut Cursor::new(buf), CacheRole::Main, None).unwrap_err();
        assert!(matches!(err, Error::MainCacheExpected));
    }

    #[test]
    fn sub_role_stops_after_cache_base() {
        let header =
            CacheHeader::parse(&mut Cursor::new(split_main()), CacheRole::Sub, Some(0x1_8000_0000))
                .unwrap();
        assert_eq!(header.mappings.len(), 1);
        assert_eq!(header.cache_base, 0x1_8000_0000);
        assert!(header.images.is_empty());
        assert!(header.subcaches.is_empty());
        assert!(header.symbol_file_uuid.is_null());
    }

    #[test]
    fn local_symbols_entries_rebased_on_main_base() {
        let mut buf = legacy_main();
        put_u32(&mut buf, layout::LOCAL_SYMBOLS as usize, 0x2C0);
        // Block: nlist_off, nlist_count, strings_off, strings_size,
        // entries_offset, entries_count.
        put_u32(&mut buf, 0x2C0, 0x40);
        put_u32(&mut buf, 0x2C8, 0x80);
        put_u32(&mut buf, 0x2D0, 0x20);
        put_u32(&mut buf, 0x2D4, 1);
        // One 32-bit entry at block + 0x20.
        put_u32(&mut buf, 0x2E0, 0x1000); // dylib_offset
        put_u32(&mut buf, 0x2E4, 7); // nlist_start_index
        put_u32(&mut buf, 0x2E8, 3); // nlist_count

        let header = CacheHeader::parse(&mut Cursor::new(buf), CacheRole::Main, None).unwrap();
        assert_eq!(header.local_symbols_off, 0x2C0);
        assert_eq!(header.local_symbols.nlist_off, 0x40);
        assert_eq!(header.local_symbols.strings_off, 0x80);
        let entry = &header.local_symbols.entries[&0x1_8000_1000];
        assert_eq!(entry.nlist_start_index, 7);
        assert_eq!(entry.nlist_count, 3);
    }

    #[test]
    fn symbols_role_reads_64bit_entries() {
        let mut buf = vec![0u8; 0x400];
        // Symbols members skip the mapping table entirely.
        put_u32(&mut buf, layout::MAPPING_INFO as usize, 0x1D0);
        put_u32(&mut buf, layout::MAPPING_INFO as usize + 4, 1);
        put_u64(&mut buf, layout::CACHE_BASE as usize, 0);
        put_u32(&mut buf, layout::LOCAL_SYMBOLS as usize, 0x200);
        put_u32(&mut buf, 0x200, 0x40);
        put_u32(&mut buf, 0x208, 0x80);
        put_u32(&mut buf, 0x210, 0x20);
        put_u32(&mut buf, 0x214, 1);
        // One 64-bit entry at block + 0x20.
        put_u64(&mut buf, 0x220, 0x2000); // dylib_offset
        put_u32(&mut buf, 0x228, 1);
        put_u32(&mut buf, 0x22C, 9);

        let header =
            CacheHeader::parse(&mut Cursor::new(buf), CacheRole::Symbols, Some(0x1_8000_0000))
                .unwrap();
        assert!(header.mappings.is_empty());
        let entry = &header.local_symbols.entries[&0x1_8000_2000];
        assert_eq!(entry.nlist_count, 9);
    }

    #[test]
    fn vm_addr_resolution_is_partitioned() {
        let header = CacheHeader {
            mappings: vec![
                Mapping {
                    base: 0x1_8000_0000,
                    size: 0x1000,
                    file_off: 0,
                    ..Default::default()
                },
                Mapping {
                    base: 0x1_9000_0000,
                    size: 0x1000,
                    file_off: 0x4000,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        assert_eq!(header.vm_addr_to_file_off(0x1_8000_0000).unwrap(), 0);
        assert_eq!(header.vm_addr_to_file_off(0x1_8000_0FFF).unwrap(), 0xFFF);
        assert_eq!(header.vm_addr_to_file_off(0x1_9000_0010).unwrap(), 0x4010);
        let err = header.vm_addr_to_file_off(0x1_8000_1000).unwrap_err();
        assert!(err.is_out_of_range());
    }
}
