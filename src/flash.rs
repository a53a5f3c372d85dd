//! Flash port: a byte-addressable read/write/erase surface over a
//! contiguous address space. Backends are pluggable; this module ships a
//! RAM-backed one (used for the event log mirror and for tests) and a
//! file-backed one (used by the CLI and anything else that wants real
//! persistence on a host filesystem).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Erase leaves the range reading as `0xFF`, matching NOR/NAND flash.
pub const ERASED_BYTE: u8 = 0xFF;

/// Capability set for a flash-like medium: read, write, erase.
///
/// Each backend owns its own context; there is no process-wide singleton,
/// unlike the original C interface's shared `priv` pointer on a single
/// `pblog_flash_ops` value.
pub trait Flash {
    /// Reads `buf.len()` bytes starting at `offset`. Returns the number of
    /// bytes actually read.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize>;

    /// Writes `buf` starting at `offset`. Returns the number of bytes
    /// actually written.
    fn write(&mut self, offset: u32, buf: &[u8]) -> Result<usize>;

    /// Erases `len` bytes starting at `offset`, leaving them as `0xFF`.
    fn erase(&mut self, offset: u32, len: u32) -> Result<()>;
}

/// A RAM-backed flash: a `Vec<u8>` initialized to the erased state.
///
/// Used as the event log's in-memory mirror, and as the default backend
/// in tests since it needs no filesystem.
pub struct RamFlash {
    data: Vec<u8>,
}

impl RamFlash {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![ERASED_BYTE; size],
        }
    }

    /// Builds a `RamFlash` pre-filled with arbitrary bytes, for garbage
    /// tolerance tests.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Flash for RamFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize> {
        let offset = offset as usize;
        if offset > self.data.len() {
            return Err(Error::invalid("read offset past end of RAM flash"));
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    fn write(&mut self, offset: u32, buf: &[u8]) -> Result<usize> {
        let offset = offset as usize;
        if offset > self.data.len() {
            return Err(Error::invalid("write offset past end of RAM flash"));
        }
        let n = buf.len().min(self.data.len() - offset);
        self.data[offset..offset + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<()> {
        let offset = offset as usize;
        let len = len as usize;
        if offset.saturating_add(len) > self.data.len() {
            return Err(Error::invalid("erase range past end of RAM flash"));
        }
        for b in &mut self.data[offset..offset + len] {
            *b = ERASED_BYTE;
        }
        Ok(())
    }
}

/// A file-backed flash, seeking to the requested offset for each access.
///
/// Erase writes `ERASED_BYTE` over the range rather than using a
/// filesystem-level "punch hole", matching `pblog`'s `file.c` which treats
/// erase as an ordinary write of `0xff` bytes.
pub struct FileFlash {
    file: File,
}

impl FileFlash {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Ensures the backing file is at least `len` bytes, erased where grown.
    pub fn ensure_len(&mut self, len: u64) -> Result<()> {
        let cur = self.file.metadata()?.len();
        if cur < len {
            self.file.set_len(len)?;
            self.file.seek(SeekFrom::Start(cur))?;
            let fill = vec![ERASED_BYTE; (len - cur) as usize];
            self.file.write_all(&fill)?;
        }
        Ok(())
    }
}

impl Flash for FileFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        let mut read = 0;
        // read() may return short reads on a plain file at EOF; loop until
        // either the buffer is full or we hit EOF, surfacing the count.
        loop {
            match self.file.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if read == buf.len() {
                break;
            }
        }
        Ok(read)
    }

    fn write(&mut self, offset: u32, buf: &[u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        let fill = vec![ERASED_BYTE; len as usize];
        self.file.write_all(&fill)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_flash_starts_erased() {
        let mut f = RamFlash::new(16);
        let mut buf = [0u8; 16];
        assert_eq!(f.read(0, &mut buf).unwrap(), 16);
        assert_eq!(buf, [ERASED_BYTE; 16]);
    }

    #[test]
    fn ram_flash_write_then_read() {
        let mut f = RamFlash::new(16);
        f.write(4, b"abcd").unwrap();
        let mut buf = [0u8; 4];
        f.read(4, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn ram_flash_erase_resets_to_ff() {
        let mut f = RamFlash::new(16);
        f.write(0, b"xxxx").unwrap();
        f.erase(0, 4).unwrap();
        let mut buf = [0u8; 4];
        f.read(0, &mut buf).unwrap();
        assert_eq!(buf, [ERASED_BYTE; 4]);
    }

    #[test]
    fn file_flash_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.bin");
        let mut f = FileFlash::open(&path).unwrap();
        f.ensure_len(32).unwrap();
        f.write(8, b"hello").unwrap();
        let mut buf = [0u8; 5];
        f.read(8, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
