//! Cache-tree analysis.
//!
//! The analyser opens the whole cache tree once (main cache, subcaches,
//! optional `.symbols` sidecar), resolves virtual addresses to
//! (member, file offset) pairs, and builds per-image symbol and
//! Objective-C class maps on demand. It keeps no file handles between
//! calls; every lookup opens a fresh stream.

mod matcher;

pub use matcher::{ImageMatcher, FRAMEWORKS_DIR, PRIVATE_FRAMEWORKS_DIR};

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};

use crate::dyld::{CacheHeader, CacheRole};
use crate::error::{Error, Result};
use crate::macho::nlist::Nlist;
use crate::macho::MachHeader;
use crate::reader::CacheRead;

/// Filename suffix of the local-symbols sidecar member.
const SYMBOLS_FILE_EXT: &str = ".symbols";

/// Placeholder Apple substitutes for stripped symbol names.
const REDACTED_NAME: &str = "<redacted>";

/// Offset of the class_ro pointer within an objc_class object.
const CLASS_RO_OFFSET: u64 = 0x20;
/// Offset of the name pointer within a class_ro object.
const CLASS_RO_NAME_OFFSET: u64 = 0x18;

/// The segment and section holding the Objective-C class list.
const OBJC_CLASSLIST_SEGMENT: &str = "__DATA_CONST";
const OBJC_CLASSLIST_SECTION: &str = "__objc_classlist";

fn open_file(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| Error::FileOpen {
            path: path.to_path_buf(),
            source,
        })
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

// =============================================================================
// Cache Entries
// =============================================================================

/// One cache member on disk: its path and parsed header.
#[derive(Debug)]
pub struct CacheEntry {
    /// Filesystem path of the member.
    pub path: PathBuf,
    /// Parsed, immutable header.
    pub header: CacheHeader,
}

impl CacheEntry {
    /// Opens a fresh buffered stream over this member.
    pub fn open(&self) -> Result<BufReader<File>> {
        open_file(&self.path)
    }
}

// =============================================================================
// Images
// =============================================================================

/// An analysed image and the lookup maps assembled for it.
///
/// Holds non-owning references into the analyser's cache entries; the
/// maps themselves are owned by the caller.
#[derive(Debug)]
pub struct Image<'a> {
    /// Path of the cache member the image lives in.
    pub path: &'a Path,
    /// Header of the owning member.
    pub header: &'a CacheHeader,
    /// File offset of the Mach header within the member.
    pub file_off: u64,
    /// Virtual base address of the image.
    pub vm_addr: u64,
    /// Symbol name to vm address.
    pub symbols: HashMap<String, u64>,
    /// Objective-C class name to class-object vm address.
    pub objc_classes: HashMap<String, u64>,
}

impl Image<'_> {
    /// Opens a fresh buffered stream over the owning cache member.
    pub fn open(&self) -> Result<BufReader<File>> {
        open_file(self.path)
    }

    /// Resolves the first known symbol among `variants`.
    ///
    /// Exports get renamed across platform versions, so callers pass all
    /// the spellings they know. Fails with the first name when none
    /// match.
    pub fn resolve_sym(&self, variants: &[&str]) -> Result<u64> {
        variants
            .iter()
            .find_map(|name| self.symbols.get(*name).copied())
            .ok_or_else(|| Error::SymbolNotFound {
                name: variants.first().copied().unwrap_or_default().to_string(),
            })
    }

    /// Resolves an Objective-C class by exact name.
    pub fn resolve_objc_class(&self, name: &str) -> Result<u64> {
        self.objc_classes
            .get(name)
            .copied()
            .ok_or_else(|| Error::ObjcClassNotFound {
                name: name.to_string(),
            })
    }
}

// =============================================================================
// Analyser
// =============================================================================

/// Analyses a whole dyld cache tree.
#[derive(Debug)]
pub struct CacheAnalyser {
    /// Main cache first, then subcaches in declared order.
    pub caches: Vec<CacheEntry>,
    /// Local-symbols sidecar, when the main header references one.
    pub symbols_cache: Option<CacheEntry>,
}

impl CacheAnalyser {
    /// Opens the cache tree rooted at `base_path`.
    ///
    /// Subcache paths are `base_path` plus each declared suffix; the
    /// symbols sidecar is `base_path` plus `.symbols`. Any member that
    /// fails to open is fatal.
    pub fn open<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref();

        let main_header = {
            let mut stream = open_file(base_path)?;
            CacheHeader::parse(&mut stream, CacheRole::Main, None)?
        };
        let main_cache_base = main_header.cache_base;
        let suffixes: Vec<String> = main_header
            .subcaches
            .iter()
            .map(|sub| sub.suffix.clone())
            .collect();
        let has_symbols_file = !main_header.symbol_file_uuid.is_null();

        let mut caches = Vec::with_capacity(1 + suffixes.len());
        caches.push(CacheEntry {
            path: base_path.to_path_buf(),
            header: main_header,
        });

        for suffix in &suffixes {
            let sub_path = append_suffix(base_path, suffix);
            let mut stream = open_file(&sub_path)?;
            let header = CacheHeader::parse(&mut stream, CacheRole::Sub, Some(main_cache_base))?;
            caches.push(CacheEntry {
                path: sub_path,
                header,
            });
        }

        let symbols_cache = if has_symbols_file {
            let sym_path = append_suffix(base_path, SYMBOLS_FILE_EXT);
            let mut stream = open_file(&sym_path)?;
            let header = CacheHeader::parse(&mut stream, CacheRole::Symbols, Some(main_cache_base))?;
            Some(CacheEntry {
                path: sym_path,
                header,
            })
        } else {
            None
        };

        Ok(Self {
            caches,
            symbols_cache,
        })
    }

    /// The main cache member.
    pub fn main_cache(&self) -> &CacheEntry {
        &self.caches[0]
    }

    /// Resolves a virtual address to (file offset, member).
    ///
    /// Members are scanned in construction order. The symbols sidecar is
    /// deliberately excluded; its role is limited to local-symbol lookup.
    pub fn find_entry_from_vm_addr(&self, vm_addr: u64) -> Result<(u64, &CacheEntry)> {
        for entry in &self.caches {
            match entry.header.vm_addr_to_file_off(vm_addr) {
                Ok(offset) => return Ok((offset, entry)),
                Err(err) if err.is_out_of_range() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::AddressNotFound { addr: vm_addr })
    }

    /// Reads the u64 at `file_off` in `stream` and interprets it as a
    /// chained-fixup word, following it just far enough to extract a
    /// rebase target.
    ///
    /// Authenticated binds and plain binds cannot be resolved without
    /// the import tables and are rejected as unsupported.
    pub fn read_ptr_at_in<R: Read + Seek>(
        &self,
        stream: &mut R,
        image_base: u64,
        file_off: u64,
    ) -> Result<u64> {
        stream.seek_to(file_off)?;
        let value = decode_fixup(stream.read_u64_le()?)?;
        Ok(if value > image_base {
            value
        } else {
            value + self.main_cache().header.cache_base
        })
    }

    /// As [`read_ptr_at_in`](Self::read_ptr_at_in), resolving `vm_addr`
    /// and opening the owning member.
    pub fn read_ptr_at(&self, image_base: u64, vm_addr: u64) -> Result<u64> {
        let (file_off, entry) = self.find_entry_from_vm_addr(vm_addr)?;
        let mut stream = entry.open()?;
        self.read_ptr_at_in(&mut stream, image_base, file_off)
    }

    /// Selects the first image whose install path satisfies `matcher`
    /// and assembles its lookup maps.
    ///
    /// The symbol map is the union of the image's own symtab and the
    /// cache's local-symbols table, first write wins. The Objective-C
    /// class map is only walked when `with_objc_classes` is set, since
    /// it costs a pointer chase per class.
    pub fn find_image(
        &self,
        matcher: &ImageMatcher<'_>,
        with_objc_classes: bool,
    ) -> Result<Image<'_>> {
        let main = self.main_cache();
        let info = main
            .header
            .images
            .iter()
            .find(|image| matcher.matches(&image.path))
            .ok_or_else(|| Error::ImageNotFound {
                name: matcher.name(),
            })?;

        let (image_off, image_entry) = self.find_entry_from_vm_addr(info.base)?;

        let mut image_stream = image_entry.open()?;
        image_stream.seek_to(image_off)?;
        let mach_header = MachHeader::parse(&mut image_stream)?;

        let linkedit = mach_header.find_segment("__LINKEDIT")?;
        let linkedit_base = linkedit.vm_addr - linkedit.file_off;

        let mut symbols = HashMap::new();

        if let Some(symtab) = &mach_header.symtab {
            let (symtab_off, symtab_entry) =
                self.find_entry_from_vm_addr(linkedit_base + u64::from(symtab.sym_off))?;
            let (str_off, str_entry) =
                self.find_entry_from_vm_addr(linkedit_base + u64::from(symtab.str_off))?;

            let mut symtab_stream = symtab_entry.open()?;
            symtab_stream.seek_to(symtab_off)?;
            let mut str_stream = str_entry.open()?;

            symbols.reserve(symtab.sym_count as usize);
            for _ in 0..symtab.sym_count {
                let sym = Nlist::parse(&mut symtab_stream)?;
                if sym.strx == 0 || !sym.is_section() {
                    continue;
                }
                str_stream.seek_to(str_off + u64::from(sym.strx))?;
                let name = str_stream.read_cstr()?;
                if name.is_empty() || name == REDACTED_NAME {
                    continue;
                }
                symbols.entry(name).or_insert(sym.value);
            }
        }

        // Local symbols live in the .symbols sidecar when one exists,
        // otherwise in the main cache itself.
        let symbols_cache = self.symbols_cache.as_ref().unwrap_or(main);
        let local = &symbols_cache.header.local_symbols;
        let block_off = symbols_cache.header.local_symbols_off;
        if let Some(slice) = local.entries.get(&info.base) {
            let mut stream = symbols_cache.open()?;
            stream.seek_to(
                block_off
                    + u64::from(local.nlist_off)
                    + u64::from(slice.nlist_start_index) * Nlist::SIZE,
            )?;

            symbols.reserve(slice.nlist_count as usize);
            for _ in 0..slice.nlist_count {
                let sym = Nlist::parse(&mut stream)?;
                if sym.strx == 0 || !sym.is_section() {
                    continue;
                }
                let next_entry = stream.stream_position()?;
                stream.seek_to(block_off + u64::from(local.strings_off) + u64::from(sym.strx))?;
                let name = stream.read_cstr()?;
                stream.seek_to(next_entry)?;
                if name.is_empty() || name == REDACTED_NAME {
                    continue;
                }
                symbols.entry(name).or_insert(sym.value);
            }
        }

        let mut objc_classes = HashMap::new();
        if with_objc_classes {
            let class_list =
                mach_header.find_section(OBJC_CLASSLIST_SEGMENT, OBJC_CLASSLIST_SECTION)?;
            let (class_list_off, class_list_entry) =
                self.find_entry_from_vm_addr(class_list.vm_addr)?;

            let mut stream = class_list_entry.open()?;
            let end_off = class_list_off + class_list.vm_size;
            let mut cur_off = class_list_off;
            while cur_off < end_off {
                let class_addr = self.read_ptr_at_in(&mut stream, info.base, cur_off)?;
                let class_ro_addr = self.read_ptr_at_in(
                    &mut stream,
                    info.base,
                    class_list_entry
                        .header
                        .vm_addr_to_file_off(class_addr + CLASS_RO_OFFSET)?,
                )?;
                let class_name_addr = self.read_ptr_at_in(
                    &mut stream,
                    info.base,
                    class_list_entry
                        .header
                        .vm_addr_to_file_off(class_ro_addr + CLASS_RO_NAME_OFFSET)?,
                )?;

                let (name_off, name_entry) = self.find_entry_from_vm_addr(class_name_addr)?;
                let mut name_stream = name_entry.open()?;
                name_stream.seek_to(name_off)?;
                let name = name_stream.read_cstr()?;

                objc_classes.entry(name).or_insert(class_addr);
                cur_off += 8;
            }
        }

        Ok(Image {
            path: &image_entry.path,
            header: &image_entry.header,
            file_off: image_off,
            vm_addr: info.base,
            symbols,
            objc_classes,
        })
    }
}

// =============================================================================
// Fixup Words
// =============================================================================

/// Decodes a chained-fixup word far enough to follow rebase entries,
/// without materialising the chain.
fn decode_fixup(fixup: u64) -> Result<u64> {
    if fixup & (1 << 63) != 0 {
        if fixup & (1 << 62) != 0 {
            return Err(Error::AuthBindFixup { fixup });
        }
        if bit_extract(fixup, 32, 19) == 0 {
            return Err(Error::BindFixup { fixup });
        }
        // Authenticated rebase; only the target bits survive, the key
        // and diversity bits are dropped.
        Ok(bit_extract(fixup, 0, 32))
    } else {
        Ok(bit_extract(fixup, 0, 36))
    }
}

#[inline]
fn bit_extract(value: u64, lsb: u32, count: u32) -> u64 {
    (value >> lsb) & ((1u64 << count) - 1)
}
