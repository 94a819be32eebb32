//! 64-bit Mach-O header and load-command parsing.

use std::collections::HashMap;
use std::io::{Read, Seek};

use crate::error::{Error, Result};
use crate::reader::CacheRead;

use super::{VmProt, LC_SEGMENT_64, LC_SYMTAB, MH_MAGIC_64};

/// Width of the segment and section name fields.
const NAME_LEN: usize = 16;

/// One section within a segment.
#[derive(Debug, Clone)]
pub struct Section {
    /// Virtual address of the section contents.
    pub vm_addr: u64,
    /// Size of the section contents in bytes.
    pub vm_size: u64,
    /// File offset of the section contents.
    pub file_off: u32,
    /// Alignment as a power of two.
    pub align: u32,
    /// File offset of the relocation entries.
    pub reloc_off: u32,
    /// Number of relocation entries.
    pub reloc_count: u32,
    /// Section type and attributes.
    pub flags: u32,
}

impl Section {
    fn parse<R: Read + Seek>(stream: &mut R) -> Result<Self> {
        let section = Self {
            vm_addr: stream.read_u64_le()?,
            vm_size: stream.read_u64_le()?,
            file_off: stream.read_u32_le()?,
            align: stream.read_u32_le()?,
            reloc_off: stream.read_u32_le()?,
            reloc_count: stream.read_u32_le()?,
            flags: stream.read_u32_le()?,
        };
        stream.skip(12)?; // reserved1..reserved3
        Ok(section)
    }
}

/// One 64-bit segment load command and its sections.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Segment name, e.g. `__LINKEDIT`.
    pub name: String,
    /// Virtual address of the segment.
    pub vm_addr: u64,
    /// Virtual size of the segment.
    pub vm_size: u64,
    /// File offset of the segment contents.
    pub file_off: u64,
    /// Size of the segment contents in the file.
    pub file_size: u64,
    /// Maximum protection.
    pub max_prot: VmProt,
    /// Initial protection.
    pub init_prot: VmProt,
    /// Segment flags.
    pub flags: u32,
    /// Sections keyed by name.
    pub sections: HashMap<String, Section>,
}

impl Segment {
    fn parse<R: Read + Seek>(stream: &mut R, name: String) -> Result<Self> {
        let vm_addr = stream.read_u64_le()?;
        let vm_size = stream.read_u64_le()?;
        let file_off = stream.read_u64_le()?;
        let file_size = stream.read_u64_le()?;
        let max_prot = VmProt::from_bits_retain(stream.read_u32_le()?);
        let init_prot = VmProt::from_bits_retain(stream.read_u32_le()?);
        let sect_count = stream.read_u32_le()?;
        let flags = stream.read_u32_le()?;

        let mut sections = HashMap::with_capacity(sect_count as usize);
        for _ in 0..sect_count {
            let sect_name = stream.read_cstrn(NAME_LEN)?;
            stream.skip(NAME_LEN as i64)?; // owning segment name
            sections.insert(sect_name, Section::parse(stream)?);
        }

        Ok(Self {
            name,
            vm_addr,
            vm_size,
            file_off,
            file_size,
            max_prot,
            init_prot,
            flags,
            sections,
        })
    }

    /// Looks up a section of this segment by name.
    pub fn find_section(&self, name: &str) -> Result<&Section> {
        self.sections
            .get(name)
            .ok_or_else(|| Error::SectionNotFound {
                segment: self.name.clone(),
                section: name.to_string(),
            })
    }
}

/// The symbol-table load command.
#[derive(Debug, Clone, Copy)]
pub struct SymtabCommand {
    /// File offset of the nlist array, relative to `__LINKEDIT`.
    pub sym_off: u32,
    /// Number of nlist entries.
    pub sym_count: u32,
    /// File offset of the string pool, relative to `__LINKEDIT`.
    pub str_off: u32,
    /// Size of the string pool.
    pub str_size: u32,
}

impl SymtabCommand {
    fn parse<R: Read + Seek>(stream: &mut R) -> Result<Self> {
        Ok(Self {
            sym_off: stream.read_u32_le()?,
            sym_count: stream.read_u32_le()?,
            str_off: stream.read_u32_le()?,
            str_size: stream.read_u32_le()?,
        })
    }
}

/// A parsed 64-bit Mach-O header.
///
/// Parsing starts at the current stream position, so images embedded at
/// arbitrary cache offsets work without copying.
#[derive(Debug)]
pub struct MachHeader {
    /// Magic value; always [`MH_MAGIC_64`](super::MH_MAGIC_64).
    pub magic: u32,
    /// CPU type of the image.
    pub cpu_type: u32,
    /// Segments keyed by name.
    pub segments: HashMap<String, Segment>,
    /// The symbol-table command, if the image carries one.
    pub symtab: Option<SymtabCommand>,
}

impl MachHeader {
    /// Parses the header and load commands at the current position.
    ///
    /// Unrecognized load commands are skipped by their declared size.
    pub fn parse<R: Read + Seek>(stream: &mut R) -> Result<Self> {
        let magic = stream.read_u32_le()?;
        if magic != MH_MAGIC_64 {
            return Err(Error::InvalidMachoMagic(magic));
        }
        let cpu_type = stream.read_u32_le()?;
        stream.skip(8)?; // cpu subtype, file type
        let ncmds = stream.read_u32_le()?;
        stream.skip(12)?; // sizeofcmds, flags, reserved

        let mut header = Self {
            magic,
            cpu_type,
            segments: HashMap::new(),
            symtab: None,
        };

        for _ in 0..ncmds {
            let cmd = stream.read_u32_le()?;
            let cmdsize = stream.read_u32_le()?;
            let cmd_end = stream.stream_position()? + u64::from(cmdsize) - 8;

            match cmd {
                LC_SYMTAB => {
                    header.symtab = Some(SymtabCommand::parse(stream)?);
                }
                LC_SEGMENT_64 => {
                    let name = stream.read_cstrn(NAME_LEN)?;
                    let segment = Segment::parse(stream, name.clone())?;
                    header.segments.insert(name, segment);
                }
                _ => {}
            }

            stream.seek_to(cmd_end)?;
        }

        Ok(header)
    }

    /// Looks up a segment by name.
    pub fn find_segment(&self, name: &str) -> Result<&Segment> {
        self.segments
            .get(name)
            .ok_or_else(|| Error::SegmentNotFound {
                name: name.to_string(),
            })
    }

    /// Looks up a section by segment and section name.
    pub fn find_section(&self, seg_name: &str, sect_name: &str) -> Result<&Section> {
        self.find_segment(seg_name)?.find_section(sect_name)
    }
}
