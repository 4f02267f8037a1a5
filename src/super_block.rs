// Copyright (c) 2025-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    addr::{FD_COUNT, SECTOR_NULL},
    block_io::BlockIo,
    BLOCKS_PER_SEG, SECTORS_PER_SEG, SECTOR_ENTRIES, SECTOR_SIZE, SEG_DATA_START,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// "LOGS": Log-Structured Storage
const SIG_LOGSTOR: u32 = 0x4C4F_4753;
const VER_MAJOR: u8 = 0;
const VER_MINOR: u8 = 1;

/// Serialized length of everything before the `seg_age` array
const FIXED_LEN: usize = 4 + 1 + 1 + 2 + 4 + 4 + 4 + 4 + 4 + 4 * FD_COUNT;

/// Fraction of raw capacity exposed to the client; the rest is slack the
/// cleaner needs to keep finding mostly-dead segments.
const CAPACITY_RATIO: f64 = 0.9;

/// The superblock, stored in the first segment of the device
///
/// It is logically a singleton but physically rotates through the sectors
/// of segment 0: every write goes to the next sector with an incremented
/// generation, so the newest superblock is recovered after a crash by
/// following the generation chain. The trailing per-segment age array
/// shares the sector.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SuperBlock {
    /// Generation number, used for redo after a crash
    pub sb_gen: u16,

    /// Max number of client blocks supported
    pub max_block_cnt: u32,

    // The segments are treated as a circular buffer
    pub seg_cnt: u32,
    pub seg_free_cnt: u32,

    /// Allocate this segment next
    pub seg_alloc_p: u32,

    /// Reclaim this segment next
    pub seg_reclaim_p: u32,

    /// Root sector address per forward-map file
    pub ftab: [u32; FD_COUNT],
}

impl SuperBlock {
    /// Initializes a device: computes the geometry from the media size and
    /// writes the first superblock to sector 0.
    ///
    /// Returns the superblock, the (all-zero) segment age table and the
    /// sector the superblock was written to.
    pub fn init<D: BlockIo>(io: &mut D) -> crate::Result<(Self, Vec<u8>, u32)> {
        let sector_cnt = (io.media_size() / SECTOR_SIZE as u64) as u32;
        let seg_cnt = sector_cnt / SECTORS_PER_SEG as u32;

        if seg_cnt <= SEG_DATA_START {
            return Err(crate::Error::InvalidArgument("device too small"));
        }
        if FIXED_LEN + seg_cnt as usize >= SECTOR_SIZE {
            return Err(crate::Error::InvalidArgument(
                "segment age table does not fit in one sector",
            ));
        }

        let seg_free_cnt = seg_cnt - SEG_DATA_START;

        // the device must at least have space for its own forward map
        let capacity = seg_free_cnt * BLOCKS_PER_SEG as u32;
        let map_overhead = sector_cnt / SECTOR_ENTRIES as u32 * FD_COUNT as u32;
        if capacity <= map_overhead {
            return Err(crate::Error::InvalidArgument(
                "device cannot hold its forward map",
            ));
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let max_block_cnt = (f64::from(capacity - map_overhead) * CAPACITY_RATIO) as u32;

        let sb = Self {
            sb_gen: rand::random(),
            max_block_cnt,
            seg_cnt,
            seg_free_cnt,
            seg_alloc_p: SEG_DATA_START,
            seg_reclaim_p: SEG_DATA_START,
            ftab: [SECTOR_NULL; FD_COUNT],
        };
        let seg_age = vec![0u8; seg_cnt as usize];

        let mut buf = Vec::with_capacity(SECTOR_SIZE);
        sb.encode_into(&mut buf, &seg_age)?;
        buf.resize(SECTOR_SIZE, 0);
        io.write(0, &buf)?;

        log::debug!(
            "initialized device: {seg_cnt} segments, {max_block_cnt} client blocks, generation {}",
            sb.sb_gen,
        );

        Ok((sb, seg_age, 0))
    }

    /// Locates the live superblock
    ///
    /// Starts at sector 0 and follows the chain of contiguously increasing
    /// generations; the last sector of the chain is the one most recently
    /// written before shutdown.
    pub fn probe<D: BlockIo>(io: &mut D) -> crate::Result<(Self, Vec<u8>, u32)> {
        let mut buf = vec![0u8; SECTOR_SIZE];

        io.read(0, &mut buf)?;
        let (mut sb, mut seg_age) = Self::decode_from(&buf)?;

        let mut sb_sa = 0;
        for i in 1..SECTORS_PER_SEG as u32 {
            io.read(i, &mut buf)?;
            let Ok((next, next_age)) = Self::decode_from(&buf) else {
                break;
            };
            if next.sb_gen != sb.sb_gen.wrapping_add(1) {
                break;
            }
            sb = next;
            seg_age = next_age;
            sb_sa = i;
        }

        log::debug!(
            "recovered superblock at sector {sb_sa}, generation {}, {} of {} segments free",
            sb.sb_gen,
            sb.seg_free_cnt,
            sb.seg_cnt,
        );

        Ok((sb, seg_age, sb_sa))
    }

    /// Writes the superblock to the next rotation slot with a bumped
    /// generation
    pub fn write<D: BlockIo>(
        &mut self,
        io: &mut D,
        seg_age: &[u8],
        sb_sa: &mut u32,
    ) -> crate::Result<()> {
        self.sb_gen = self.sb_gen.wrapping_add(1);
        *sb_sa += 1;
        if *sb_sa == SECTORS_PER_SEG as u32 {
            *sb_sa = 0;
        }

        let mut buf = Vec::with_capacity(SECTOR_SIZE);
        self.encode_into(&mut buf, seg_age)?;
        buf.resize(SECTOR_SIZE, 0);
        io.write(*sb_sa, &buf)?;

        log::trace!("wrote superblock generation {} to sector {sb_sa}", self.sb_gen);

        Ok(())
    }

    pub fn encode_into<W: std::io::Write>(
        &self,
        writer: &mut W,
        seg_age: &[u8],
    ) -> crate::Result<()> {
        debug_assert_eq!(seg_age.len(), self.seg_cnt as usize);

        writer.write_u32::<LittleEndian>(SIG_LOGSTOR)?;
        writer.write_u8(VER_MAJOR)?;
        writer.write_u8(VER_MINOR)?;
        writer.write_u16::<LittleEndian>(self.sb_gen)?;
        writer.write_u32::<LittleEndian>(self.max_block_cnt)?;
        writer.write_u32::<LittleEndian>(self.seg_cnt)?;
        writer.write_u32::<LittleEndian>(self.seg_free_cnt)?;
        writer.write_u32::<LittleEndian>(self.seg_alloc_p)?;
        writer.write_u32::<LittleEndian>(self.seg_reclaim_p)?;
        for root in self.ftab {
            writer.write_u32::<LittleEndian>(root)?;
        }
        writer.write_all(seg_age)?;

        Ok(())
    }

    pub fn decode_from(buf: &[u8]) -> crate::Result<(Self, Vec<u8>)> {
        let mut reader = buf;

        if reader.read_u32::<LittleEndian>()? != SIG_LOGSTOR {
            return Err(crate::Error::Corrupt("bad superblock signature"));
        }
        if reader.read_u8()? != VER_MAJOR {
            return Err(crate::Error::Corrupt("unsupported superblock version"));
        }
        let _ver_minor = reader.read_u8()?;

        let sb_gen = reader.read_u16::<LittleEndian>()?;
        let max_block_cnt = reader.read_u32::<LittleEndian>()?;
        let seg_cnt = reader.read_u32::<LittleEndian>()?;
        let seg_free_cnt = reader.read_u32::<LittleEndian>()?;
        let seg_alloc_p = reader.read_u32::<LittleEndian>()?;
        let seg_reclaim_p = reader.read_u32::<LittleEndian>()?;
        let mut ftab = [SECTOR_NULL; FD_COUNT];
        for root in &mut ftab {
            *root = reader.read_u32::<LittleEndian>()?;
        }

        if seg_cnt <= SEG_DATA_START || FIXED_LEN + seg_cnt as usize >= SECTOR_SIZE {
            return Err(crate::Error::Corrupt("superblock segment count out of range"));
        }
        if seg_alloc_p < SEG_DATA_START || seg_alloc_p >= seg_cnt {
            return Err(crate::Error::Corrupt("allocation pointer out of range"));
        }
        if seg_reclaim_p < SEG_DATA_START || seg_reclaim_p >= seg_cnt {
            return Err(crate::Error::Corrupt("reclaim pointer out of range"));
        }
        if seg_free_cnt >= seg_cnt {
            return Err(crate::Error::Corrupt("free segment count out of range"));
        }

        let seg_age = buf
            .get(FIXED_LEN..FIXED_LEN + seg_cnt as usize)
            .ok_or(crate::Error::Corrupt("superblock truncated"))?
            .to_vec();

        Ok((
            Self {
                sb_gen,
                max_block_cnt,
                seg_cnt,
                seg_free_cnt,
                seg_alloc_p,
                seg_reclaim_p,
                ftab,
            },
            seg_age,
        ))
    }
}
