//! BSD name-list (symbol table) entries.

use std::io::{Read, Seek};

use crate::error::Result;
use crate::reader::CacheRead;

/// Value of the type sub-bitfield for a symbol defined in a section.
pub const N_TYPE_SECTION: u8 = 0x7;

/// One fixed-size 64-bit symbol-table entry.
#[derive(Debug, Clone, Copy)]
pub struct Nlist {
    /// Index into the string table; 0 means no name.
    pub strx: u32,
    /// Packed type byte: external, type, private-external, stab bits.
    pub n_type: u8,
    /// Section number.
    pub sect: u8,
    /// Extra description flags.
    pub desc: u16,
    /// Symbol value (an address for section symbols).
    pub value: u64,
}

impl Nlist {
    /// On-disk size of one entry.
    pub const SIZE: u64 = 16;

    /// Reads one entry at the current stream position.
    pub fn parse<R: Read + Seek>(stream: &mut R) -> Result<Self> {
        Ok(Self {
            strx: stream.read_u32_le()?,
            n_type: CacheRead::read_u8(stream)?,
            sect: CacheRead::read_u8(stream)?,
            desc: stream.read_u16_le()?,
            value: stream.read_u64_le()?,
        })
    }

    /// The three-bit type field between the external and
    /// private-external bits.
    #[inline]
    pub fn type_bits(&self) -> u8 {
        (self.n_type >> 1) & 0x7
    }

    /// Returns true for symbols defined in a section.
    #[inline]
    pub fn is_section(&self) -> bool {
        self.type_bits() == N_TYPE_SECTION
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn parse_and_type_bits() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&5u32.to_le_bytes());
        bytes.push(0x0E); // N_SECT | N_EXT
        bytes.push(1);
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&0x1234u64.to_le_bytes());

        let nlist = Nlist::parse(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(nlist.strx, 5);
        assert_eq!(nlist.type_bits(), N_TYPE_SECTION);
        assert!(nlist.is_section());
        assert_eq!(nlist.value, 0x1234);
    }

    #[test]
    fn undefined_symbol_is_not_section() {
        let nlist = Nlist {
            strx: 1,
            n_type: 0x01, // N_UNDF | N_EXT
            sect: 0,
            desc: 0,
            value: 0,
        };
        assert!(!nlist.is_section());
    }
}
