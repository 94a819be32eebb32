//! Patch staging, commit, and revert.
//!
//! Writes are staged in memory keyed by (path, file offset), printed for
//! the operator, and committed in one pass per file. Commit preserves
//! the displaced bytes in a sidecar next to the target so a later run
//! (or `--revert`) can restore the file byte-for-byte. The sidecar is a
//! line-oriented hex format:
//!
//! ```text
//! <offset>: <byte> <byte> ...
//! ```
//!
//! Reverting before every patch session keeps the protocol idempotent;
//! without it the sidecar would describe bytes no longer present.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Extension of the displaced-bytes sidecar written next to each
/// patched file.
pub const ORIG_BYTES_EXT: &str = ".InfernoOriginalBytes";

fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(ORIG_BYTES_EXT);
    PathBuf::from(os)
}

fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| Error::FileOpen {
            path: path.to_path_buf(),
            source,
        })
}

/// In-memory staging buffer for file patches.
#[derive(Debug, Default)]
pub struct Patcher {
    write_queue: BTreeMap<PathBuf, BTreeMap<u64, Vec<u8>>>,
}

impl Patcher {
    /// Creates an empty staging buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages `bytes` at `file_off` in `path`.
    ///
    /// A later write to the same offset replaces the earlier one. The
    /// patch sites are disjoint by construction, so no overlap check is
    /// made.
    pub fn write(&mut self, path: &Path, file_off: u64, bytes: &[u8]) {
        self.write_queue
            .entry(path.to_path_buf())
            .or_default()
            .insert(file_off, bytes.to_vec());
    }

    /// Returns true if nothing has been staged.
    pub fn is_empty(&self) -> bool {
        self.write_queue.is_empty()
    }

    /// Returns the bytes currently staged at (path, offset).
    pub fn staged(&self, path: &Path, file_off: u64) -> Option<&[u8]> {
        self.write_queue
            .get(path)?
            .get(&file_off)
            .map(Vec::as_slice)
    }

    /// Prints the staged writes for the operator.
    pub fn print_changes(&self) {
        for (path, entries) in &self.write_queue {
            println!("  {}:", path.display());
            for (file_off, bytes) in entries {
                print!("    {file_off:#x}:");
                for byte in bytes {
                    print!(" {byte:#x}");
                }
                println!();
            }
        }
    }

    /// Applies every staged write in ascending offset order, recording
    /// the displaced bytes in each file's sidecar.
    pub fn commit(self) -> Result<()> {
        for (path, entries) in &self.write_queue {
            let mut file = open_rw(path)?;

            let sidecar = sidecar_path(path);
            let mut sidecar_file =
                File::create(&sidecar).map_err(|source| Error::FileOpen {
                    path: sidecar.clone(),
                    source,
                })?;

            for (&file_off, bytes) in entries {
                file.seek(SeekFrom::Start(file_off))?;
                let mut displaced = vec![0u8; bytes.len()];
                file.read_exact(&mut displaced)?;

                file.seek(SeekFrom::Start(file_off))?;
                file.write_all(bytes)?;

                write!(sidecar_file, "{file_off:x}:")?;
                for byte in &displaced {
                    write!(sidecar_file, " {byte:02x}")?;
                }
                writeln!(sidecar_file)?;
            }

            file.flush()?;
            sidecar_file.flush()?;
        }
        Ok(())
    }

    /// Replays `path`'s sidecar in write order, restoring the original
    /// bytes, then deletes the sidecar.
    ///
    /// A missing sidecar means there is nothing to revert.
    pub fn revert(path: &Path) -> Result<()> {
        let sidecar = sidecar_path(path);
        if !sidecar.exists() {
            return Ok(());
        }

        let contents = fs::read_to_string(&sidecar).map_err(|source| Error::FileOpen {
            path: sidecar.clone(),
            source,
        })?;
        let mut file = open_rw(path)?;

        for token in contents.split_whitespace() {
            if let Some(offset) = token.strip_suffix(':') {
                let offset = u64::from_str_radix(offset, 16).map_err(|_| {
                    Error::MalformedSidecar {
                        token: token.to_string(),
                    }
                })?;
                file.seek(SeekFrom::Start(offset))?;
                continue;
            }

            let value = u32::from_str_radix(token, 16).map_err(|_| Error::MalformedSidecar {
                token: token.to_string(),
            })?;
            let byte = u8::try_from(value).map_err(|_| Error::MalformedSidecar {
                token: token.to_string(),
            })?;
            file.write_all(&[byte])?;
        }

        file.flush()?;
        fs::remove_file(&sidecar)?;
        Ok(())
    }
}
