// Copyright (c) 2025-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    addr::{sega2sa, Fd, MetaAddr},
    block_io::BlockIo,
    logstor::Logstor,
    segment::Front,
    BLOCKS_PER_SEG, SECTOR_SIZE,
};
use std::collections::VecDeque;

/// Number of reclaim candidates the cleaner weighs against each other
pub(crate) const CLEAN_WINDOW: usize = 6;

/// A candidate that survived this many reclaim passes is cleaned
/// unconditionally
pub(crate) const CLEAN_AGE_LIMIT: u8 = 4;

impl<D: BlockIo> Logstor<D> {
    /// Runs the cleaner if free segments fell below the low-water mark
    ///
    /// Called after a hot segment fills. The guard counter keeps metadata
    /// writes issued by the cleaner itself from recursing back in here.
    pub(crate) fn clean_check(&mut self) -> crate::Result<()> {
        if self.sb.seg_free_cnt <= self.clean_low_water && self.cleaner_disabled == 0 {
            self.cleaner_disabled += 1;
            log::debug!("cleaner start: {} segments free", self.sb.seg_free_cnt);
            let result = self.cleaner();
            self.cleaner_disabled -= 1;
            log::debug!("cleaner done: {} segments free", self.sb.seg_free_cnt);
            result?;
        }
        Ok(())
    }

    /// The clean-window loop
    ///
    /// Keeps a sliding window of reclaim candidates, always cleans the
    /// least-live one, and refills the freed slot from the reclaim
    /// frontier. A candidate that survives a full pass at the head of the
    /// window is either cleaned (below the window's mean liveness) or aged
    /// and replaced, so the window keeps moving.
    fn cleaner(&mut self) -> crate::Result<()> {
        let mut cc: VecDeque<usize> = VecDeque::with_capacity(CLEAN_WINDOW);

        'run: {
            for ci in 0..CLEAN_WINDOW {
                if self.seg_reclaim_init(ci)? {
                    break 'run;
                }
                cc.push_back(ci);
            }

            let mut prev_head: Option<usize> = None;
            'select: loop {
                // pick the least-live candidate; the mean of the others
                // decides the fate of a starving head below
                let mut live_min = u32::MAX;
                let mut live_sum: u64 = 0;
                let mut to_clean = 0;
                for &ci in &cc {
                    let live = self.clean_candidate[ci].live_count;
                    live_sum += u64::from(live);
                    if live < live_min {
                        live_min = live;
                        to_clean = ci;
                    }
                }
                let live_avg =
                    ((live_sum - u64::from(live_min)) / (CLEAN_WINDOW as u64 - 1)) as u32;

                cc.retain(|&ci| ci != to_clean);
                let mut head_processed = false;
                let mut do_clean = true;
                loop {
                    if do_clean {
                        self.seg_clean(to_clean)?;
                        if self.sb.seg_free_cnt > self.clean_high_water {
                            break 'run;
                        }
                    }
                    // refill the freed window slot from the frontier
                    if self.seg_reclaim_init(to_clean)? {
                        break 'run;
                    }
                    cc.push_back(to_clean);

                    if head_processed {
                        continue 'select;
                    }
                    head_processed = true;

                    let head = *cc.front().expect("window is full here");
                    if prev_head != Some(head) {
                        prev_head = Some(head);
                        continue 'select;
                    }

                    // the head survived a whole pass without being picked
                    prev_head = cc.get(1).copied();
                    let live = self.clean_candidate[head].live_count;
                    cc.pop_front();
                    to_clean = head;
                    if live >= live_avg {
                        // too much live data to migrate now; age it so a
                        // later pass takes it unconditionally
                        let sega = self.clean_candidate[head].sega;
                        self.seg_age[sega as usize] = self.seg_age[sega as usize].saturating_add(1);
                        do_clean = false;
                    } else {
                        do_clean = true;
                    }
                }
            }
        }

        // opportunistically take leftovers that are mostly dead
        for ci in 0..CLEAN_WINDOW {
            if cc.contains(&ci) && self.clean_candidate[ci].live_count * 2 < BLOCKS_PER_SEG as u32 {
                self.seg_clean(ci)?;
            }
        }

        Ok(())
    }

    /// Pulls the next segment off the reclaim frontier into window slot
    /// `ci` and counts its live blocks
    ///
    /// Returns `true` when an age-limit clean pushed the free count past
    /// the high-water mark, meaning the cleaner is done.
    fn seg_reclaim_init(&mut self, ci: usize) -> crate::Result<bool> {
        loop {
            let sega = self.sb.seg_reclaim_p;
            self.sb.seg_reclaim_p += 1;
            if self.sb.seg_reclaim_p == self.sb.seg_cnt {
                self.sb.seg_reclaim_p = crate::SEG_DATA_START;
            }

            if sega == self.seg_sum_hot.sega || sega == self.seg_sum_cold.sega {
                continue;
            }

            // nonzero age keeps the allocator away while we hold it
            self.seg_age[sega as usize] = self.seg_age[sega as usize].saturating_add(1);
            self.clean_candidate[ci].sega = sega;
            self.seg_sum_read(ci)?;

            if self.seg_age[sega as usize] >= CLEAN_AGE_LIMIT {
                self.seg_clean(ci)?;
                if self.sb.seg_free_cnt > self.clean_high_water {
                    return Ok(true);
                }
                continue;
            }

            self.seg_live_count(ci)?;
            return Ok(false);
        }
    }

    /// Counts the live blocks of window slot `ci`
    ///
    /// A data sector is live when its reverse-map entry still forward-maps
    /// to it. Live metadata only counts when its cached buffer is neither
    /// dirty nor recently used; the rest gets rewritten by other
    /// mechanisms anyway.
    fn seg_live_count(&mut self, ci: usize) -> crate::Result<()> {
        let seg_sa = sega2sa(self.clean_candidate[ci].sega);
        let slots = self.clean_candidate[ci].ss_alloc_p as usize;

        let mut live_count = 0;
        for i in 0..slots {
            let ba = self.clean_candidate[ci].ss_rm[i];
            let sa = seg_sa + i as u32;
            if MetaAddr::is_meta(ba) {
                let ma = MetaAddr::from_raw(ba);
                if !ma.is_well_formed() {
                    continue;
                }
                if self.fbuf_ma2sa(ma)? == sa {
                    let idx = self.fbuf_get(ma)?;
                    let fbuf = &self.fbufs[idx as usize];
                    if !fbuf.modified && !fbuf.accessed {
                        live_count += 1;
                    }
                }
            } else {
                if ba >= self.sb.max_block_cnt {
                    // reverse map of a never-flushed segment
                    continue;
                }
                if self.file_read_4byte(Fd::Active, ba)? == sa {
                    live_count += 1;
                }
            }
        }
        self.clean_candidate[ci].live_count = live_count;

        Ok(())
    }

    /// Migrates the live blocks of window slot `ci` through the cold front
    /// and frees the segment
    pub(crate) fn seg_clean(&mut self, ci: usize) -> crate::Result<()> {
        let seg_sa = sega2sa(self.clean_candidate[ci].sega);
        let slots = self.clean_candidate[ci].ss_alloc_p as usize;

        let mut buf = vec![0u8; SECTOR_SIZE];
        for i in 0..slots {
            let ba = self.clean_candidate[ci].ss_rm[i];
            let sa = seg_sa + i as u32;
            if MetaAddr::is_meta(ba) {
                let ma = MetaAddr::from_raw(ba);
                if !ma.is_well_formed() {
                    continue;
                }
                if self.fbuf_ma2sa(ma)? == sa {
                    let idx = self.fbuf_get(ma)?;
                    if !self.fbufs[idx as usize].modified {
                        // dirtying forces a rewrite somewhere else later
                        self.fbufs[idx as usize].modified = true;
                        self.fbuf_modified_count += 1;
                        if !self.fbufs[idx as usize].accessed {
                            self.fbuf_flush(idx, Front::Cold)?;
                        }
                    }
                }
            } else {
                if ba >= self.sb.max_block_cnt {
                    continue;
                }
                if self.file_read_4byte(Fd::Active, ba)? == sa {
                    self.io.read(sa, &mut buf)?;
                    self.write_at(ba, &buf, Front::Cold)?;
                }
            }
        }

        let sega = self.clean_candidate[ci].sega;
        self.seg_age[sega as usize] = 0;
        self.sb.seg_free_cnt += 1;
        log::trace!(
            "cleaned segment {sega}, {} live blocks migrated, {} segments free",
            self.clean_candidate[ci].live_count,
            self.sb.seg_free_cnt,
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Logstor, MemDisk};
    use test_log::test;

    /// One full segment worth of payload, tagged by generation
    fn chunk_payload(slot: u32, generation: u32) -> Vec<u8> {
        let mut data = vec![0u8; BLOCKS_PER_SEG * SECTOR_SIZE];
        for (i, sector) in data.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let tag = (slot << 20) ^ (generation << 10) ^ i as u32;
            for word in sector.chunks_exact_mut(4) {
                word.copy_from_slice(&tag.to_le_bytes());
            }
        }
        data
    }

    #[test]
    fn cleaner_reclaims_dead_segments() -> crate::Result<()> {
        // 64 segments; the cleaner triggers once the write pattern has
        // burned through the free pool
        let mut store = Logstor::open(MemDisk::new(256 << 20))?;
        let free_at_open = store.sb.seg_free_cnt;
        assert!(free_at_open > store.clean_low_water);

        // 8 slots, each one segment wide, rewritten round-robin: older
        // incarnations of a slot are dead weight for the cleaner
        const SLOTS: u32 = 8;
        let mut generation = vec![0u32; SLOTS as usize];
        for fill in 0..75u32 {
            let slot = fill % SLOTS;
            generation[slot as usize] = fill;
            let data = chunk_payload(slot, fill);
            store.write(slot * BLOCKS_PER_SEG as u32, &data)?;
        }

        // way more segments written than were free, so the cleaner must
        // have run, and must have left the low-water mark behind
        assert!(free_at_open < 75);
        assert!(store.sb.seg_free_cnt >= store.clean_low_water);

        // every slot still reads back its latest generation
        for slot in 0..SLOTS {
            let expected = chunk_payload(slot, generation[slot as usize]);
            let mut data = vec![0u8; BLOCKS_PER_SEG * SECTOR_SIZE];
            store.read(slot * BLOCKS_PER_SEG as u32, &mut data)?;
            assert!(data == expected, "slot {slot} lost data");
        }

        store.fbuf_queue_check();
        Ok(())
    }

    #[test]
    fn overwriting_one_block_is_sustainable() -> crate::Result<()> {
        let mut store = Logstor::open(MemDisk::new(256 << 20))?;

        let mut payload = vec![0u8; SECTOR_SIZE];
        let writes = 52 * BLOCKS_PER_SEG as u32;
        for i in 0..writes {
            payload[..4].copy_from_slice(&i.to_le_bytes());
            payload[SECTOR_SIZE - 4..].copy_from_slice(&i.to_le_bytes());
            store.write(5, &payload)?;

            let mut back = vec![0u8; SECTOR_SIZE];
            store.read(5, &mut back)?;
            assert!(back == payload, "write {i} not visible");
        }

        assert!(store.sb.seg_free_cnt >= store.clean_low_water);
        assert!(store.data_write_count() >= u64::from(writes));

        store.fbuf_queue_check();
        Ok(())
    }

    #[test]
    fn fully_live_segment_survives_aging_and_migration() -> crate::Result<()> {
        let mut store = Logstor::open(MemDisk::new(256 << 20))?;

        // a fully live region: the cleaner keeps passing it over, ages it,
        // and eventually migrates it wholesale through the cold front
        let keep = chunk_payload(0, 0);
        store.write(0, &keep)?;

        // churn two other slots long enough for the reclaim frontier to
        // lap the device more than once
        for fill in 0..150u32 {
            let slot = 1 + fill % 2;
            let data = chunk_payload(slot, fill);
            store.write(slot * BLOCKS_PER_SEG as u32, &data)?;
        }

        let mut back = vec![0u8; BLOCKS_PER_SEG * SECTOR_SIZE];
        store.read(0, &mut back)?;
        assert!(back == keep);

        store.fbuf_queue_check();
        Ok(())
    }
}
