// Copyright (c) 2025-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    addr::{sega2sa, Fd, META_LEAF_DEPTH, SECTOR_DELETE, SECTOR_NULL},
    block_io::BlockIo,
    cleaner::CLEAN_WINDOW,
    fbuf::{Fbuf, NIL},
    segment::{Front, SegSummary},
    super_block::SuperBlock,
    SECTOR_SIZE, SEG_SUM_OFF,
};

/// A log-structured store on top of a block device
///
/// Exposes a fixed-size logical block device backed by a larger physical
/// one. All writes are appended sequentially into segments; a forward map
/// translates logical block addresses to physical sector addresses, and a
/// cleaner reclaims segments whose live content has decayed.
///
/// The handle assumes serialized request submission: callers must not
/// issue concurrent operations against one device.
pub struct Logstor<D: BlockIo> {
    pub(crate) io: D,

    pub(crate) sb: SuperBlock,

    /// Per-segment age; 0 means clean and allocatable
    pub(crate) seg_age: Vec<u8>,

    /// Sector the live superblock was last written to
    pub(crate) sb_sa: u32,
    pub(crate) sb_modified: bool,

    pub(crate) seg_sum_hot: SegSummary,
    pub(crate) seg_sum_cold: SegSummary,

    /// Arena backing the cleaner's candidate window
    pub(crate) clean_candidate: Vec<SegSummary>,
    pub(crate) cleaner_disabled: u8,
    pub(crate) clean_low_water: u32,
    pub(crate) clean_high_water: u32,

    // file buffer cache
    pub(crate) fbufs: Vec<Fbuf>,
    pub(crate) fbuf_bucket: Vec<Vec<u32>>,
    pub(crate) cir_head: u32,
    pub(crate) indirect_head: [u32; META_LEAF_DEPTH as usize],
    pub(crate) fbuf_modified_count: usize,

    // statistics
    pub(crate) data_write_count: u64,
    pub(crate) other_write_count: u64,
    pub(crate) fbuf_hit: u64,
    pub(crate) fbuf_miss: u64,
}

impl<D: BlockIo> Logstor<D> {
    /// Opens the store on a backing device
    ///
    /// Recovers the latest superblock, or initializes the device when no
    /// usable superblock is found.
    pub fn open(mut io: D) -> crate::Result<Self> {
        let (sb, seg_age, sb_sa) = match SuperBlock::probe(&mut io) {
            Ok(found) => found,
            Err(crate::Error::Corrupt(reason)) => {
                log::warn!("no usable superblock ({reason}), initializing device");
                SuperBlock::init(&mut io)?
            }
            Err(e) => return Err(e),
        };

        let mut store = Self {
            io,
            sb,
            seg_age,
            sb_sa,
            sb_modified: false,
            seg_sum_hot: SegSummary::new(),
            seg_sum_cold: SegSummary::new(),
            clean_candidate: vec![SegSummary::new(); CLEAN_WINDOW],
            cleaner_disabled: 0,
            clean_low_water: CLEAN_WINDOW as u32 * 2,
            clean_high_water: CLEAN_WINDOW as u32 * 4,
            fbufs: Vec::new(),
            fbuf_bucket: Vec::new(),
            cir_head: NIL,
            indirect_head: [NIL; META_LEAF_DEPTH as usize],
            fbuf_modified_count: 0,
            data_write_count: 0,
            other_write_count: 0,
            fbuf_hit: 0,
            fbuf_miss: 0,
        };

        // cold first, so the fronts never share a segment and the first
        // cold segment sits right at the data start
        store.seg_alloc(Front::Cold)?;
        store.seg_alloc(Front::Hot)?;

        store.file_mod_init();

        Ok(store)
    }

    /// Flushes all cached state and persists the superblock
    ///
    /// This is the durability boundary: everything written before `close`
    /// survives a crash, anything after may be lost.
    pub fn close(&mut self) -> crate::Result<()> {
        log::trace!(
            "closing: {} dirty map buffers, superblock dirty: {}",
            self.fbuf_modified_count,
            self.sb_modified,
        );

        self.file_mod_flush()?;

        self.seg_sum_write(Front::Cold)?;
        self.seg_sum_write(Front::Hot)?;

        self.superblock_write()
    }

    /// Reads `buf.len() / SECTOR_SIZE` blocks starting at `ba`
    ///
    /// Consecutive blocks mapped to consecutive sectors are fetched with a
    /// single backing read; unmapped and deleted blocks read as zeroes.
    pub fn read(&mut self, ba: u32, buf: &mut [u8]) -> crate::Result<()> {
        let size = check_args(ba, buf.len(), self.sb.max_block_cnt)?;

        let mut start_sa = self.file_read_4byte(Fd::Active, ba)?;
        let mut pre_sa = start_sa;
        let mut count: u32 = 1;
        let mut run_off = 0;
        for i in 1..size {
            let sa = self.file_read_4byte(Fd::Active, ba + i)?;
            if sa == pre_sa + 1 {
                count += 1;
                pre_sa = sa;
            } else {
                let run_len = count as usize * SECTOR_SIZE;
                self.read_run(start_sa, &mut buf[run_off..run_off + run_len])?;
                run_off += run_len;
                start_sa = sa;
                pre_sa = sa;
                count = 1;
            }
        }
        self.read_run(start_sa, &mut buf[run_off..])
    }

    fn read_run(&mut self, start_sa: u32, buf: &mut [u8]) -> crate::Result<()> {
        if start_sa == SECTOR_NULL || start_sa == SECTOR_DELETE {
            buf.fill(0);
            Ok(())
        } else {
            self.io.read(start_sa, buf)
        }
    }

    /// Writes `buf.len() / SECTOR_SIZE` blocks starting at `ba`
    pub fn write(&mut self, ba: u32, buf: &[u8]) -> crate::Result<()> {
        check_args(ba, buf.len(), self.sb.max_block_cnt)?;
        self.write_at(ba, buf, Front::Hot)
    }

    /// Appends blocks through the given front
    ///
    /// Within each run: the data sectors are written, then the reverse
    /// map is recorded (and the summary persisted if the segment filled),
    /// and only then the forward map is updated. After a crash between
    /// the two, a scan of the persisted summaries can reconstruct the
    /// mappings deterministically.
    pub(crate) fn write_at(&mut self, mut ba: u32, data: &[u8], front: Front) -> crate::Result<()> {
        let mut remain = (data.len() / SECTOR_SIZE) as u32;
        let mut off = 0;

        while remain > 0 {
            let sum = self.front(front);
            debug_assert!((sum.ss_alloc_p as usize) < SEG_SUM_OFF);
            let sec_free = SEG_SUM_OFF as u32 - u32::from(sum.ss_alloc_p);
            let count = remain.min(sec_free);
            let mut sa = sega2sa(sum.sega) + u32::from(sum.ss_alloc_p);

            let run_len = count as usize * SECTOR_SIZE;
            self.io.write(sa, &data[off..off + run_len])?;
            off += run_len;

            if self.cleaner_disabled > 0 {
                self.other_write_count += u64::from(count);
            } else {
                self.data_write_count += u64::from(count);
            }

            let sum = self.front_mut(front);
            for i in 0..count {
                sum.ss_rm[sum.ss_alloc_p as usize] = ba + i;
                sum.ss_alloc_p += 1;
            }

            if sum.ss_alloc_p as usize == SEG_SUM_OFF {
                // segment is full
                self.seg_sum_write(front)?;
                self.seg_alloc(front)?;
                self.clean_check()?;
            }

            for _ in 0..count {
                self.file_write_4byte(Fd::Active, ba, sa)?;
                ba += 1;
                sa += 1;
            }

            remain -= count;
        }

        Ok(())
    }

    /// Marks `n_sectors` blocks starting at `ba` as deleted
    ///
    /// No segment write happens; subsequent reads return zeroes and the
    /// cleaner treats the old sectors as dead.
    pub fn delete(&mut self, ba: u32, n_sectors: u32) -> crate::Result<()> {
        if u64::from(ba) + u64::from(n_sectors) > u64::from(self.sb.max_block_cnt) {
            return Err(crate::Error::InvalidArgument("block address out of range"));
        }

        for i in 0..n_sectors {
            self.file_write_4byte(Fd::Active, ba + i, SECTOR_DELETE)?;
        }
        Ok(())
    }

    fn superblock_write(&mut self) -> crate::Result<()> {
        self.sb.write(&mut self.io, &self.seg_age, &mut self.sb_sa)?;
        self.sb_modified = false;
        self.other_write_count += 1;
        Ok(())
    }

    /// Number of logical blocks this device exposes
    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.sb.max_block_cnt
    }

    /// Client data sectors written to the backing device
    #[must_use]
    pub fn data_write_count(&self) -> u64 {
        self.data_write_count
    }

    /// All other sectors written: metadata, segment summaries,
    /// superblocks and cleaner migrations
    #[must_use]
    pub fn other_write_count(&self) -> u64 {
        self.other_write_count
    }

    /// File buffer cache hits
    #[must_use]
    pub fn fbuf_hit(&self) -> u64 {
        self.fbuf_hit
    }

    /// File buffer cache misses
    #[must_use]
    pub fn fbuf_miss(&self) -> u64 {
        self.fbuf_miss
    }

    /// Releases the backing device without flushing
    #[must_use]
    pub fn into_inner(self) -> D {
        self.io
    }
}

fn check_args(ba: u32, len: usize, max_block_cnt: u32) -> crate::Result<u32> {
    if len == 0 || len % SECTOR_SIZE != 0 {
        return Err(crate::Error::InvalidArgument(
            "length must be a positive multiple of the sector size",
        ));
    }
    let size = (len / SECTOR_SIZE) as u32;
    if u64::from(ba) + u64::from(size) > u64::from(max_block_cnt) {
        return Err(crate::Error::InvalidArgument("block address out of range"));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemDisk, BLOCKS_PER_SEG, SEG_DATA_START};
    use test_log::test;

    fn sector_of(byte: u8) -> Vec<u8> {
        vec![byte; SECTOR_SIZE]
    }

    #[test]
    fn open_small_device() -> crate::Result<()> {
        // 16 MiB = 4 segments: one for superblocks, two bound to the
        // write fronts, one left free
        let mut store = Logstor::open(MemDisk::new(16 << 20))?;
        assert!(store.block_count() > 0);
        assert_eq!(store.sb.seg_cnt, 4);
        assert_eq!(store.sb.seg_free_cnt, 1);
        assert_eq!(store.seg_sum_cold.sega, SEG_DATA_START);
        assert_eq!(store.seg_sum_hot.sega, SEG_DATA_START + 1);
        assert_eq!(store.data_write_count(), 0);

        store.close()?;
        Ok(())
    }

    #[test]
    fn read_after_write() -> crate::Result<()> {
        let mut store = Logstor::open(MemDisk::new(16 << 20))?;

        store.write(0, &sector_of(0xAA))?;
        store.write(1, &sector_of(0xBB))?;

        let mut buf = vec![0; 2 * SECTOR_SIZE];
        store.read(0, &mut buf)?;
        assert!(buf[..SECTOR_SIZE].iter().all(|&b| b == 0xAA));
        assert!(buf[SECTOR_SIZE..].iter().all(|&b| b == 0xBB));

        Ok(())
    }

    #[test]
    fn unwritten_blocks_read_zero() -> crate::Result<()> {
        let mut store = Logstor::open(MemDisk::new(16 << 20))?;

        let mut buf = sector_of(0xFF);
        store.read(123, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0));

        Ok(())
    }

    #[test]
    fn overwrite_wins() -> crate::Result<()> {
        let mut store = Logstor::open(MemDisk::new(16 << 20))?;

        for round in 0..5u8 {
            store.write(99, &sector_of(round))?;
            let mut buf = sector_of(0xFF);
            store.read(99, &mut buf)?;
            assert!(buf.iter().all(|&b| b == round));
        }

        Ok(())
    }

    #[test]
    fn delete_reads_back_zeroes() -> crate::Result<()> {
        let mut store = Logstor::open(MemDisk::new(16 << 20))?;

        let mut data = vec![0u8; 10 * SECTOR_SIZE];
        for (i, sector) in data.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            sector.fill(i as u8 + 1);
        }
        store.write(0, &data)?;
        store.delete(0, 10)?;

        let mut buf = vec![0xFFu8; 10 * SECTOR_SIZE];
        store.read(0, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0));

        // neighbors are untouched
        store.write(10, &sector_of(0x77))?;
        store.delete(0, 10)?;
        let mut buf = sector_of(0);
        store.read(10, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0x77));

        Ok(())
    }

    #[test]
    fn filling_a_segment_rolls_the_hot_front() -> crate::Result<()> {
        // 128 MiB so the roll happens far above the cleaner's low water
        let mut store = Logstor::open(MemDisk::new(128 << 20))?;
        let old_hot = store.seg_sum_hot.sega;

        let mut data = vec![0u8; BLOCKS_PER_SEG * SECTOR_SIZE];
        for (i, sector) in data.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            sector[..8].copy_from_slice(&(i as u64).to_le_bytes());
        }
        store.write(0, &data)?;

        let new_hot = store.seg_sum_hot.sega;
        assert_ne!(new_hot, old_hot);

        // the persisted summary maps every data sector back to its block
        let mut buf = [0u8; SECTOR_SIZE];
        store
            .io
            .read(sega2sa(old_hot) + SEG_SUM_OFF as u32, &mut buf)?;
        let mut sum = SegSummary::new();
        sum.decode_from(&buf);
        assert_eq!(sum.ss_alloc_p as usize, SEG_SUM_OFF);
        for (i, &ba) in sum.ss_rm.iter().enumerate() {
            assert_eq!(ba, i as u32);
        }

        let mut back = vec![0u8; BLOCKS_PER_SEG * SECTOR_SIZE];
        store.read(0, &mut back)?;
        assert!(back == data);

        Ok(())
    }

    #[test]
    fn unaligned_and_out_of_range_requests_fail() -> crate::Result<()> {
        let mut store = Logstor::open(MemDisk::new(16 << 20))?;
        let block_cnt = store.block_count();

        let mut short = vec![0u8; SECTOR_SIZE - 1];
        assert!(matches!(
            store.read(0, &mut short),
            Err(crate::Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store.write(0, &short),
            Err(crate::Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store.read(block_cnt, &mut sector_of(0)),
            Err(crate::Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store.write(block_cnt - 1, &sector_of(0).repeat(2)),
            Err(crate::Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store.delete(block_cnt, 1),
            Err(crate::Error::InvalidArgument(_))
        ));

        Ok(())
    }

    #[test]
    fn close_and_reopen_preserves_data() -> crate::Result<()> {
        let mut store = Logstor::open(MemDisk::new(64 << 20))?;

        for ba in 0..=100u32 {
            let mut sector = sector_of(0);
            sector[..4].copy_from_slice(&ba.to_le_bytes());
            sector[SECTOR_SIZE - 4..].copy_from_slice(&(!ba).to_le_bytes());
            store.write(ba, &sector)?;
        }
        store.close()?;

        let mut store = Logstor::open(store.into_inner())?;
        for ba in 0..=100u32 {
            let mut sector = sector_of(0xFF);
            store.read(ba, &mut sector)?;
            assert_eq!(&sector[..4], &ba.to_le_bytes());
            assert_eq!(&sector[SECTOR_SIZE - 4..], &(!ba).to_le_bytes());
        }

        Ok(())
    }

    #[test]
    fn dropping_without_close_loses_only_recent_writes() -> crate::Result<()> {
        let mut store = Logstor::open(MemDisk::new(64 << 20))?;

        for ba in 0..=100u32 {
            let mut sector = sector_of(0);
            sector[..4].copy_from_slice(&ba.to_le_bytes());
            store.write(ba, &sector)?;
        }
        store.close()?;

        // more writes that never get a close
        let mut store = Logstor::open(store.into_inner())?;
        for ba in 200..220u32 {
            store.write(ba, &sector_of(0xEE))?;
        }

        // drop the in-memory state, keep the disk
        let mut store = Logstor::open(store.into_inner())?;
        for ba in 0..=100u32 {
            let mut sector = sector_of(0xFF);
            store.read(ba, &mut sector)?;
            assert_eq!(&sector[..4], &ba.to_le_bytes());
        }

        Ok(())
    }

    #[test]
    fn reopen_bumps_the_generation() -> crate::Result<()> {
        let mut store = Logstor::open(MemDisk::new(64 << 20))?;
        let gen_at_open = store.sb.sb_gen;

        store.write(0, &sector_of(1))?;
        store.close()?;
        assert_eq!(store.sb.sb_gen, gen_at_open.wrapping_add(1));

        let store = Logstor::open(store.into_inner())?;
        assert_eq!(store.sb.sb_gen, gen_at_open.wrapping_add(1));

        Ok(())
    }

    #[test]
    fn forward_and_reverse_maps_agree_after_reopen() -> crate::Result<()> {
        let mut store = Logstor::open(MemDisk::new(64 << 20))?;

        let bas: Vec<u32> = (0..500).map(|i| i * 7 % 3000).collect();
        for &ba in &bas {
            let mut sector = sector_of(0);
            sector[..4].copy_from_slice(&ba.to_le_bytes());
            store.write(ba, &sector)?;
        }
        store.close()?;

        let mut store = Logstor::open(store.into_inner())?;
        for &ba in &bas {
            let sa = store.file_read_4byte(Fd::Active, ba)?;
            if sa == SECTOR_NULL || sa == SECTOR_DELETE {
                continue;
            }
            let sega = sa >> 10;
            let mut buf = [0u8; SECTOR_SIZE];
            store.io.read(sega2sa(sega) + SEG_SUM_OFF as u32, &mut buf)?;
            let mut sum = SegSummary::new();
            sum.decode_from(&buf);
            assert_eq!(sum.ss_rm[(sa & 0x3FF) as usize], ba);
        }

        Ok(())
    }

    #[test]
    fn space_accounting_stays_balanced() -> crate::Result<()> {
        let mut store = Logstor::open(MemDisk::new(128 << 20))?;
        let usable = store.sb.seg_cnt - SEG_DATA_START;

        // two segments are always bound to the fronts
        assert_eq!(store.sb.seg_free_cnt, usable - 2);

        let fills = 3;
        let data = vec![0x11u8; BLOCKS_PER_SEG * SECTOR_SIZE];
        for _ in 0..fills {
            store.write(0, &data)?;
        }
        assert_eq!(store.sb.seg_free_cnt, usable - 2 - fills);
        assert!(store.seg_age.iter().all(|&age| age == 0));

        Ok(())
    }

    #[test]
    fn stats_accumulate() -> crate::Result<()> {
        let mut store = Logstor::open(MemDisk::new(16 << 20))?;

        store.write(0, &sector_of(1))?;
        store.write(1, &sector_of(2))?;
        assert_eq!(store.data_write_count(), 2);
        assert_eq!(store.other_write_count(), 0);

        store.close()?;
        // two segment summaries plus the superblock, plus metadata blocks
        assert!(store.other_write_count() >= 3);
        assert!(store.fbuf_miss() > 0);

        Ok(())
    }
}
