//! Typed little-endian reads over a seekable byte source.
//!
//! Cache files are parsed through streams rather than whole-file
//! buffers: every parser seeks and reads within a single call and holds
//! no handle afterwards. The extension trait is implemented for any
//! `Read + Seek`, so tests run over `Cursor<Vec<u8>>` and production
//! code over buffered files.
//!
//! All multi-byte reads decode explicitly from little-endian bytes via
//! `byteorder`, independent of the host byte order.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// Maps a read failure: running past valid data is an out-of-range
/// condition, everything else is a plain I/O error.
fn map_read(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::UnexpectedEof
    } else {
        Error::Io(err)
    }
}

fn map_seek(offset: i64) -> impl FnOnce(std::io::Error) -> Error {
    move |err| {
        if err.kind() == std::io::ErrorKind::InvalidInput {
            Error::SeekOutOfRange { offset }
        } else {
            Error::Io(err)
        }
    }
}

/// Typed reads over a little-endian byte stream.
pub trait CacheRead: Read + Seek {
    /// Reads one byte.
    fn read_u8(&mut self) -> Result<u8> {
        ReadBytesExt::read_u8(self).map_err(map_read)
    }

    /// Reads a little-endian u16.
    fn read_u16_le(&mut self) -> Result<u16> {
        self.read_u16::<LittleEndian>().map_err(map_read)
    }

    /// Reads a little-endian u32.
    fn read_u32_le(&mut self) -> Result<u32> {
        self.read_u32::<LittleEndian>().map_err(map_read)
    }

    /// Reads a little-endian u64.
    fn read_u64_le(&mut self) -> Result<u64> {
        self.read_u64::<LittleEndian>().map_err(map_read)
    }

    /// Fills `buf` exactly.
    fn read_exact_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf).map_err(map_read)
    }

    /// Reads bytes until a NUL terminator, consuming the terminator.
    fn read_cstr(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            let byte = CacheRead::read_u8(self)?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads a NUL-padded string field of exactly `n` bytes, advancing
    /// the stream by `n` regardless of where the terminator falls.
    fn read_cstrn(&mut self, n: usize) -> Result<String> {
        let mut buf = vec![0u8; n];
        self.read_exact(&mut buf).map_err(map_read)?;
        buf.truncate(memchr::memchr(0, &buf).unwrap_or(n));
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Seeks to an absolute offset from the start of the stream.
    fn seek_to(&mut self, offset: u64) -> Result<u64> {
        self.seek(SeekFrom::Start(offset))
            .map_err(map_seek(offset as i64))
    }

    /// Seeks relative to the current position.
    fn seek_by(&mut self, delta: i64) -> Result<u64> {
        self.seek(SeekFrom::Current(delta)).map_err(map_seek(delta))
    }

    /// Advances the stream without interpreting the bytes.
    fn skip(&mut self, n: i64) -> Result<()> {
        self.seek_by(n).map(|_| ())
    }
}

impl<R: Read + Seek + ?Sized> CacheRead for R {}
