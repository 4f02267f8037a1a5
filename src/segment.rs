// Copyright (c) 2025-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    addr::sega2sa,
    block_io::BlockIo,
    logstor::Logstor,
    BLOCKS_PER_SEG, SECTOR_SIZE, SEG_DATA_START, SEG_SUM_OFF,
};
use byteorder::{ByteOrder, LittleEndian};

/// The two concurrent write fronts
///
/// Fresh client writes go to the hot front (likely to be overwritten
/// soon); live blocks migrated by the cleaner go to the cold front (they
/// already survived one cleaning). Keeping the lifetimes apart lowers
/// write amplification.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Front {
    Hot,
    Cold,
}

/// Segment summary: the last sector of each segment
///
/// Stores the reverse map for the segment's data sectors. The soft state
/// below the on-disk fields only lives in memory.
#[derive(Clone)]
pub(crate) struct SegSummary {
    /// Reverse map: the block address written to each data sector
    pub ss_rm: [u32; BLOCKS_PER_SEG],

    /// Superblock generation at flush time
    pub ss_gen: u16,

    /// Allocate the next sector at this offset
    pub ss_alloc_p: u16,

    /// Segment address this summary belongs to (not persisted)
    pub sega: u32,

    /// Live blocks counted by the cleaner (not persisted)
    pub live_count: u32,
}

impl SegSummary {
    pub fn new() -> Self {
        Self {
            ss_rm: [0; BLOCKS_PER_SEG],
            ss_gen: 0,
            ss_alloc_p: 0,
            sega: 0,
            live_count: 0,
        }
    }

    /// Serializes the on-disk fields into exactly one sector
    pub fn encode_into(&self, buf: &mut [u8; SECTOR_SIZE]) {
        LittleEndian::write_u32_into(&self.ss_rm, &mut buf[..4 * BLOCKS_PER_SEG]);
        LittleEndian::write_u16(&mut buf[4 * BLOCKS_PER_SEG..], self.ss_gen);
        LittleEndian::write_u16(&mut buf[4 * BLOCKS_PER_SEG + 2..], self.ss_alloc_p);
    }

    /// Overwrites the on-disk fields from a sector, keeping the soft state
    ///
    /// A segment that was never flushed holds arbitrary bytes at its
    /// summary offset, so the allocation pointer is clamped instead of
    /// trusted; the liveness scan tolerates garbage reverse-map entries.
    pub fn decode_from(&mut self, buf: &[u8; SECTOR_SIZE]) {
        LittleEndian::read_u32_into(&buf[..4 * BLOCKS_PER_SEG], &mut self.ss_rm);
        self.ss_gen = LittleEndian::read_u16(&buf[4 * BLOCKS_PER_SEG..]);
        self.ss_alloc_p = LittleEndian::read_u16(&buf[4 * BLOCKS_PER_SEG + 2..]);
        self.ss_alloc_p = self.ss_alloc_p.min(SEG_SUM_OFF as u16);
    }
}

impl<D: BlockIo> Logstor<D> {
    pub(crate) fn front(&self, front: Front) -> &SegSummary {
        match front {
            Front::Hot => &self.seg_sum_hot,
            Front::Cold => &self.seg_sum_cold,
        }
    }

    pub(crate) fn front_mut(&mut self, front: Front) -> &mut SegSummary {
        match front {
            Front::Hot => &mut self.seg_sum_hot,
            Front::Cold => &mut self.seg_sum_cold,
        }
    }

    /// Allocates a segment for writing and binds it to the given front
    ///
    /// Walks the allocation pointer circularly, skipping the segment bound
    /// to either write front and any segment whose age is nonzero (written
    /// or under reclaim). A full fruitless cycle means the cleaner could
    /// not keep up or the client overflowed the advertised capacity.
    pub(crate) fn seg_alloc(&mut self, front: Front) -> crate::Result<()> {
        let sega_hot = self.seg_sum_hot.sega;
        let sega_cold = self.seg_sum_cold.sega;

        if self.sb.seg_free_cnt == 0 {
            return Err(crate::Error::NoSpace);
        }

        let mut attempts = 0;
        let sega = loop {
            if attempts == self.sb.seg_cnt {
                return Err(crate::Error::NoSpace);
            }
            attempts += 1;

            let sega = self.sb.seg_alloc_p;
            self.sb.seg_alloc_p += 1;
            if self.sb.seg_alloc_p == self.sb.seg_cnt {
                self.sb.seg_alloc_p = SEG_DATA_START;
            }

            if sega == sega_hot || sega == sega_cold {
                continue;
            }
            if self.seg_age[sega as usize] != 0 {
                continue;
            }
            break sega;
        };

        self.sb.seg_free_cnt -= 1;

        let sum = self.front_mut(front);
        sum.sega = sega;
        sum.ss_alloc_p = 0;

        log::trace!(
            "bound segment {sega} to {front:?} front, {} segments free",
            self.sb.seg_free_cnt,
        );

        Ok(())
    }

    /// Writes a front's segment summary to the end of its segment
    pub(crate) fn seg_sum_write(&mut self, front: Front) -> crate::Result<()> {
        let sb_gen = self.sb.sb_gen;
        let sum = self.front_mut(front);
        sum.ss_gen = sb_gen;

        let sa = sega2sa(sum.sega) + SEG_SUM_OFF as u32;
        let mut buf = [0u8; SECTOR_SIZE];
        sum.encode_into(&mut buf);

        self.io.write(sa, &buf)?;
        self.other_write_count += 1;

        Ok(())
    }

    /// Loads a reclaim candidate's segment summary from disk
    pub(crate) fn seg_sum_read(&mut self, ci: usize) -> crate::Result<()> {
        let sa = sega2sa(self.clean_candidate[ci].sega) + SEG_SUM_OFF as u32;
        let mut buf = [0u8; SECTOR_SIZE];
        self.io.read(sa, &mut buf)?;
        self.clean_candidate[ci].decode_from(&buf);
        Ok(())
    }
}
