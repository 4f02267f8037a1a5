// Copyright (c) 2025-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::SECTOR_SIZE;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Sector-granular access to the backing device
///
/// All buffers must be a multiple of [`SECTOR_SIZE`] bytes long. Writes are
/// assumed durable on return; the engine builds its crash-consistency
/// ordering on that.
pub trait BlockIo {
    /// Reads `buf.len() / SECTOR_SIZE` sectors starting at sector address `sa`
    fn read(&mut self, sa: u32, buf: &mut [u8]) -> crate::Result<()>;

    /// Writes `buf.len() / SECTOR_SIZE` sectors starting at sector address `sa`
    fn write(&mut self, sa: u32, buf: &[u8]) -> crate::Result<()>;

    /// Size of the backing device in bytes
    fn media_size(&self) -> u64;
}

/// Sparse in-memory backing device
///
/// Sectors that were never written read back as zeroes, like a
/// freshly-trimmed flash device. Used by the test suite and useful as a
/// scratch target; `media_size` only bounds the address space, no memory is
/// committed up front.
pub struct MemDisk {
    sectors: HashMap<u32, Box<[u8]>>,
    media_size: u64,
}

impl MemDisk {
    #[must_use]
    pub fn new(media_size: u64) -> Self {
        Self {
            sectors: HashMap::new(),
            media_size,
        }
    }

    fn check_range(&self, sa: u32, len: usize) -> crate::Result<()> {
        if len % SECTOR_SIZE != 0 {
            return Err(crate::Error::InvalidArgument("buffer not sector-aligned"));
        }
        let end = u64::from(sa) * SECTOR_SIZE as u64 + len as u64;
        if end > self.media_size {
            return Err(crate::Error::InvalidArgument("sector address out of range"));
        }
        Ok(())
    }
}

impl BlockIo for MemDisk {
    fn read(&mut self, sa: u32, buf: &mut [u8]) -> crate::Result<()> {
        self.check_range(sa, buf.len())?;

        for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            match self.sectors.get(&(sa + i as u32)) {
                Some(data) => chunk.copy_from_slice(data),
                None => chunk.fill(0),
            }
        }
        Ok(())
    }

    fn write(&mut self, sa: u32, buf: &[u8]) -> crate::Result<()> {
        self.check_range(sa, buf.len())?;

        for (i, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            self.sectors.insert(sa + i as u32, chunk.into());
        }
        Ok(())
    }

    fn media_size(&self) -> u64 {
        self.media_size
    }
}

/// File-backed device using positioned reads and writes
///
/// Works against a regular file or a raw device node.
pub struct FileDisk {
    file: File,
    media_size: u64,
}

impl FileDisk {
    /// Opens an existing file or device node
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let media_size = file.metadata()?.len() / SECTOR_SIZE as u64 * SECTOR_SIZE as u64;
        Ok(Self { file, media_size })
    }

    /// Creates (or truncates) a file of the given size
    pub fn create<P: AsRef<Path>>(path: P, media_size: u64) -> crate::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(media_size)?;
        Ok(Self { file, media_size })
    }
}

impl BlockIo for FileDisk {
    fn read(&mut self, sa: u32, buf: &mut [u8]) -> crate::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;

            self.file
                .read_exact_at(buf, u64::from(sa) * SECTOR_SIZE as u64)?;
        }

        #[cfg(not(unix))]
        {
            compile_error!("unsupported OS");
        }

        Ok(())
    }

    fn write(&mut self, sa: u32, buf: &[u8]) -> crate::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;

            self.file
                .write_all_at(buf, u64::from(sa) * SECTOR_SIZE as u64)?;
        }

        Ok(())
    }

    fn media_size(&self) -> u64 {
        self.media_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn mem_disk_unwritten_reads_zero() -> crate::Result<()> {
        let mut disk = MemDisk::new(1 << 22);

        let mut buf = vec![0xFF; SECTOR_SIZE];
        disk.read(17, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0));

        Ok(())
    }

    #[test]
    fn mem_disk_write_read_round_trip() -> crate::Result<()> {
        let mut disk = MemDisk::new(1 << 22);

        let data = vec![0xAB; 3 * SECTOR_SIZE];
        disk.write(5, &data)?;

        let mut buf = vec![0; SECTOR_SIZE];
        disk.read(6, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0xAB));

        Ok(())
    }

    #[test]
    fn mem_disk_rejects_out_of_range() {
        let mut disk = MemDisk::new(4 * SECTOR_SIZE as u64);

        let mut buf = vec![0; SECTOR_SIZE];
        assert!(disk.read(4, &mut buf).is_err());
        assert!(disk.write(4, &buf).is_err());
        assert!(disk.read(3, &mut buf).is_ok());
    }

    #[test]
    fn file_disk_round_trip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("device");

        let mut disk = FileDisk::create(&path, 1 << 22)?;
        assert_eq!(disk.media_size(), 1 << 22);

        let data = vec![0x5A; SECTOR_SIZE];
        disk.write(9, &data)?;

        let mut disk = FileDisk::open(&path)?;
        let mut buf = vec![0; SECTOR_SIZE];
        disk.read(9, &mut buf)?;
        assert_eq!(buf, data);

        // sectors never written read back as zeroes through set_len
        disk.read(100, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0));

        Ok(())
    }
}
