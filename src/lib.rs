// Copyright (c) 2025-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A log-structured block storage engine.
//!
//! Exposes a fixed-size logical block device on top of a larger physical
//! one. All writes, client data and forward-map metadata alike, are
//! appended sequentially into 4 MiB segments; the last sector of every
//! segment holds a reverse map of what was written where. A background
//! cleaner migrates the surviving blocks out of mostly-dead segments and
//! recycles them.
//!
//! ```
//! # fn main() -> logstor::Result<()> {
//! use logstor::{Logstor, MemDisk, SECTOR_SIZE};
//!
//! let mut store = Logstor::open(MemDisk::new(64 << 20))?;
//!
//! store.write(0, &[0xAA; SECTOR_SIZE])?;
//!
//! let mut buf = [0; SECTOR_SIZE];
//! store.read(0, &mut buf)?;
//! assert_eq!(buf, [0xAA; SECTOR_SIZE]);
//!
//! store.close()?;
//! # Ok(())
//! # }
//! ```

pub(crate) mod addr;
mod block_io;
mod cleaner;
mod error;
mod fbuf;
mod logstor;
mod segment;
mod super_block;

pub use addr::{SECTOR_DELETE, SECTOR_NULL};
pub use block_io::{BlockIo, FileDisk, MemDisk};
pub use error::{Error, Result};
pub use logstor::Logstor;

/// Size of one sector in bytes; all I/O is sector-aligned
pub const SECTOR_SIZE: usize = 4096;

/// Forward-map entries per sector
pub(crate) const SECTOR_ENTRIES: usize = SECTOR_SIZE / 4;

/// Size of one segment in bytes
pub const SEG_SIZE: usize = 0x40_0000;

/// Sectors per segment, including the summary sector
pub const SECTORS_PER_SEG: usize = SEG_SIZE / SECTOR_SIZE;

/// Offset of the segment summary within its segment
pub(crate) const SEG_SUM_OFF: usize = SECTORS_PER_SEG - 1;

/// Client data sectors per segment
pub const BLOCKS_PER_SEG: usize = SECTORS_PER_SEG - 1;

/// First segment available for data; segment 0 is reserved for the
/// rotating superblock
pub(crate) const SEG_DATA_START: u32 = 1;
