// Copyright (c) 2025-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    addr::{sega2sa, Fd, MetaAddr, META_LEAF_DEPTH, SECTOR_NULL},
    block_io::BlockIo,
    logstor::Logstor,
    segment::Front,
    SECTOR_ENTRIES, SECTOR_SIZE, SEG_SUM_OFF,
};
use byteorder::{ByteOrder, LittleEndian};

pub(crate) const FILE_BUCKET_COUNT: usize = 12899;

/// Ratio of allocated to needed file buffers
///
/// Even at 1.0 there will still be some flushing during buffer
/// allocation.
const FBUF_RATIO: f64 = 1.0;

/// A pool smaller than this cannot hold a pinned root-to-leaf path plus an
/// eviction candidate
const FBUF_MIN: usize = 8;

/// Niche index value for absent links
pub(crate) const NIL: u32 = u32::MAX;

/// Which queue a file buffer currently lives on
///
/// A buffer is either an eviction candidate on the circular clock queue,
/// or pinned on the indirect list of its tree depth because children in
/// the pool still point at it. The transition between the two is an
/// explicit state change (`promote_to_indirect` / `demote_to_circular`).
#[derive(Copy, Clone, Debug)]
pub(crate) enum Residency {
    Circular { prev: u32, next: u32 },
    Indirect { depth: u32, prev: u32, next: u32 },
}

impl Residency {
    pub fn is_circular(self) -> bool {
        matches!(self, Self::Circular { .. })
    }

    pub fn prev(self) -> u32 {
        match self {
            Self::Circular { prev, .. } | Self::Indirect { prev, .. } => prev,
        }
    }

    pub fn next(self) -> u32 {
        match self {
            Self::Circular { next, .. } | Self::Indirect { next, .. } => next,
        }
    }

    fn set_prev(&mut self, value: u32) {
        match self {
            Self::Circular { prev, .. } | Self::Indirect { prev, .. } => *prev = value,
        }
    }

    fn set_next(&mut self, value: u32) {
        match self {
            Self::Circular { next, .. } | Self::Indirect { next, .. } => *next = value,
        }
    }
}

/// File buffer: one cached sector of a forward-map file
///
/// The forward map is accessed a block at a time, so each cache line holds
/// a whole sector of map entries. Parent links are non-owning arena
/// indices; the owning relation is the pool itself. `ref_cnt` counts the
/// resident children holding this buffer as parent and decides which queue
/// it may live on.
pub(crate) struct Fbuf {
    pub ma: MetaAddr,

    /// Arena index of the buffer one level shallower on the tree path;
    /// `NIL` for roots and recycled buffers
    pub parent: u32,

    /// Number of resident children pointing here
    pub ref_cnt: u16,

    pub accessed: bool,

    /// The cached sector is dirty
    pub modified: bool,

    pub residency: Residency,

    /// Hash bucket this buffer is currently chained in
    pub bucket: u32,

    pub data: Box<[u32; SECTOR_ENTRIES]>,
}

impl<D: BlockIo> Logstor<D> {
    /// Builds the file buffer pool
    pub(crate) fn file_mod_init(&mut self) {
        self.fbuf_hit = 0;
        self.fbuf_miss = 0;
        self.fbuf_modified_count = 0;

        let needed = self.sb.max_block_cnt as usize / SECTOR_ENTRIES;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let count = ((needed as f64 * FBUF_RATIO) as usize).max(FBUF_MIN);

        self.fbuf_bucket = vec![Vec::new(); FILE_BUCKET_COUNT];
        self.fbufs = Vec::with_capacity(count);
        for i in 0..count as u32 {
            let prev = if i == 0 { count as u32 - 1 } else { i - 1 };
            let next = if i as usize == count - 1 { 0 } else { i + 1 };
            self.fbufs.push(Fbuf {
                ma: MetaAddr::INVALID,
                parent: NIL,
                ref_cnt: 0,
                accessed: false,
                modified: false,
                residency: Residency::Circular { prev, next },
                bucket: 0,
                data: Box::new([0; SECTOR_ENTRIES]),
            });
            // distribute the unkeyed buffers over the buckets evenly
            self.bucket_insert(i, i);
        }
        self.cir_head = 0;
        self.indirect_head = [NIL; META_LEAF_DEPTH as usize];

        log::debug!("file buffer pool: {count} buffers");
    }

    /// Writes all dirty file buffers out through the hot front
    ///
    /// The circular queue is walked first (leaves and unpinned nodes),
    /// then the indirect lists from the deepest level up, so a parent's
    /// sector address slots are rewritten only after its children have
    /// settled.
    pub(crate) fn file_mod_flush(&mut self) -> crate::Result<()> {
        if self.cir_head != NIL {
            let head = self.cir_head;
            let mut idx = head;
            loop {
                debug_assert!(self.fbufs[idx as usize].residency.is_circular());
                if self.fbufs[idx as usize].modified {
                    self.fbuf_flush(idx, Front::Hot)?;
                }
                idx = self.fbufs[idx as usize].residency.next();
                if idx == head {
                    break;
                }
            }
        }

        for depth in (0..META_LEAF_DEPTH).rev() {
            let mut idx = self.indirect_head[depth as usize];
            while idx != NIL {
                debug_assert!(!self.fbufs[idx as usize].residency.is_circular());
                if self.fbufs[idx as usize].modified {
                    self.fbuf_flush(idx, Front::Hot)?;
                }
                idx = self.fbufs[idx as usize].residency.next();
            }
        }

        Ok(())
    }

    /// The sector address currently mapped for `ba` in `fd`
    pub(crate) fn file_read_4byte(&mut self, fd: Fd, ba: u32) -> crate::Result<u32> {
        debug_assert!(!MetaAddr::is_meta(ba));
        let idx = self.file_access(fd, ba, false)?;
        Ok(self.fbufs[idx as usize].data[(ba & 0x3FF) as usize])
    }

    /// Sets the mapping of `ba` to `sa` in `fd`
    pub(crate) fn file_write_4byte(&mut self, fd: Fd, ba: u32, sa: u32) -> crate::Result<()> {
        debug_assert!(!MetaAddr::is_meta(ba));
        let idx = self.file_access(fd, ba, true)?;
        self.fbufs[idx as usize].data[(ba & 0x3FF) as usize] = sa;
        Ok(())
    }

    fn file_access(&mut self, fd: Fd, ba: u32, write: bool) -> crate::Result<u32> {
        let idx = self.fbuf_get(MetaAddr::leaf(fd, ba))?;

        let fbuf = &mut self.fbufs[idx as usize];
        fbuf.accessed = true;
        if write && !fbuf.modified {
            fbuf.modified = true;
            self.fbuf_modified_count += 1;
        }

        Ok(idx)
    }

    /// Resolves a metadata address to the sector it was last written to
    pub(crate) fn fbuf_ma2sa(&mut self, ma: MetaAddr) -> crate::Result<u32> {
        match ma.depth() {
            0 => Ok(self.sb.ftab[ma.fd() as usize]),
            1 | 2 => {
                let idx = self.fbuf_get(ma)?;
                let pidx = self.fbufs[idx as usize].parent;
                if pidx == NIL {
                    return Err(crate::Error::Corrupt("indirect block has no parent"));
                }
                let slot = ma.index_at(ma.depth() - 1);
                Ok(self.fbufs[pidx as usize].data[slot as usize])
            }
            _ => unreachable!("invalid tree depth"),
        }
    }

    /// Returns the buffer caching `ma`, loading it (and any missing
    /// ancestors) on a miss
    pub(crate) fn fbuf_get(&mut self, ma: MetaAddr) -> crate::Result<u32> {
        debug_assert!(ma.is_well_formed());

        if let Some(idx) = self.fbuf_search(ma) {
            return Ok(idx);
        }

        // walk from the root, reading the missing levels into the cache
        let mut sa = self.sb.ftab[ma.fd() as usize];
        let mut pidx = NIL;
        let mut tma = ma.with_depth(0).with_index_at(0, 0).with_index_at(1, 0);
        let mut depth = 0;
        loop {
            tma = tma.with_depth(depth);
            let idx = match self.fbuf_search(tma) {
                None => {
                    let idx = self.fbuf_read_and_hash(sa, tma)?;
                    // keeps the pin taken below; dropped again when this
                    // child is evicted
                    self.fbufs[idx as usize].parent = pidx;
                    idx
                }
                Some(idx) => {
                    debug_assert_eq!(self.fbufs[idx as usize].parent, pidx);
                    if pidx != NIL {
                        // already linked to the parent, undo the pin taken
                        // in the previous round
                        debug_assert!(self.fbufs[pidx as usize].ref_cnt > 1);
                        self.fbufs[pidx as usize].ref_cnt -= 1;
                    }
                    idx
                }
            };

            if depth == ma.depth() {
                return Ok(idx);
            }

            if self.fbufs[idx as usize].residency.is_circular() {
                self.promote_to_indirect(idx, depth);
            }
            // pin this node so that reading the next level cannot pick it
            // for reuse
            self.fbufs[idx as usize].ref_cnt += 1;

            let slot = ma.index_at(depth);
            tma = tma.with_index_at(depth, slot);
            sa = self.fbufs[idx as usize].data[slot as usize];
            pidx = idx;
            depth += 1;
        }
    }

    fn fbuf_search(&mut self, ma: MetaAddr) -> Option<u32> {
        let bucket = ma.raw() as usize % FILE_BUCKET_COUNT;
        let found = self.fbuf_bucket[bucket]
            .iter()
            .copied()
            .find(|&idx| self.fbufs[idx as usize].ma == ma);

        match found {
            Some(idx) => {
                self.fbuf_hit += 1;
                Some(idx)
            }
            None => {
                self.fbuf_miss += 1;
                None
            }
        }
    }

    /// Picks a buffer for reuse with the second-chance algorithm
    ///
    /// Only buffers on the circular queue are candidates; callers keep
    /// ancestors they still need off that queue by pinning them. Walks
    /// from the clock hand, clearing `accessed` marks; a buffer seen
    /// without its mark is taken.
    fn fbuf_alloc(&mut self) -> crate::Result<u32> {
        let head = self.cir_head;
        if head == NIL {
            return Err(crate::Error::Corrupt("file buffer pool exhausted"));
        }

        let mut idx = head;
        loop {
            let fbuf = &mut self.fbufs[idx as usize];
            debug_assert!(fbuf.residency.is_circular());
            if !fbuf.accessed {
                break;
            }
            fbuf.accessed = false;
            idx = fbuf.residency.next();
            if idx == head {
                // full revolution; the head lost its mark in the first
                // step and is taken now
                break;
            }
        }
        self.cir_head = self.fbufs[idx as usize].residency.next();

        if self.fbufs[idx as usize].modified {
            log::trace!(
                "flushing evicted map block {:#010x}",
                self.fbufs[idx as usize].ma.raw(),
            );
            self.fbuf_flush(idx, Front::Hot)?;
        }

        let pidx = self.fbufs[idx as usize].parent;
        if pidx != NIL {
            self.fbufs[idx as usize].parent = NIL;
            let parent = &mut self.fbufs[pidx as usize];
            debug_assert!(!parent.residency.is_circular());
            parent.ref_cnt -= 1;
            if parent.ref_cnt == 0 {
                // no children left: back onto the clock, unmarked, so the
                // next pass may take it
                self.demote_to_circular(pidx);
            }
        }

        Ok(idx)
    }

    /// Allocates a buffer, fills it from sector `sa` and re-keys it to `ma`
    fn fbuf_read_and_hash(&mut self, sa: u32, ma: MetaAddr) -> crate::Result<u32> {
        let idx = self.fbuf_alloc()?;

        if sa == SECTOR_NULL {
            // the metadata block does not exist yet
            self.fbufs[idx as usize].data.fill(0);
        } else {
            let mut buf = [0u8; SECTOR_SIZE];
            self.io.read(sa, &mut buf)?;
            LittleEndian::read_u32_into(&buf, &mut *self.fbufs[idx as usize].data);
        }

        self.bucket_remove(idx);
        self.fbufs[idx as usize].ma = ma;
        self.bucket_insert(idx, ma.raw());

        Ok(idx)
    }

    /// Appends the buffer's sector to the given front and returns the
    /// sector address it landed on
    fn fbuf_write(&mut self, idx: u32, front: Front) -> crate::Result<u32> {
        let sum = self.front(front);
        debug_assert!((sum.ss_alloc_p as usize) < SEG_SUM_OFF);
        let sa = sega2sa(sum.sega) + u32::from(sum.ss_alloc_p);

        let mut buf = [0u8; SECTOR_SIZE];
        LittleEndian::write_u32_into(&*self.fbufs[idx as usize].data, &mut buf);
        self.io.write(sa, &buf)?;

        self.fbufs[idx as usize].modified = false;
        self.fbuf_modified_count -= 1;
        self.other_write_count += 1;

        // the reverse mapping of a metadata sector is the metadata address
        // itself
        let ma_raw = self.fbufs[idx as usize].ma.raw();
        let sum = self.front_mut(front);
        sum.ss_rm[sum.ss_alloc_p as usize] = ma_raw;
        sum.ss_alloc_p += 1;

        if sum.ss_alloc_p as usize == SEG_SUM_OFF {
            // segment is full; no clean_check here, the cleaner must stay
            // out while metadata is being written back
            self.seg_sum_write(front)?;
            self.seg_alloc(front)?;
        }

        Ok(sa)
    }

    /// Writes a dirty buffer out and records its new location in the
    /// parent (or the file table, for a root)
    pub(crate) fn fbuf_flush(&mut self, idx: u32, front: Front) -> crate::Result<()> {
        debug_assert!(self.fbufs[idx as usize].modified);

        let sa = self.fbuf_write(idx, front)?;

        let ma = self.fbufs[idx as usize].ma;
        let pidx = self.fbufs[idx as usize].parent;
        if pidx == NIL {
            debug_assert_eq!(ma.depth(), 0);
            self.sb.ftab[ma.fd() as usize] = sa;
            self.sb_modified = true;
        } else {
            let slot = ma.index_at(ma.depth() - 1);
            let parent = &mut self.fbufs[pidx as usize];
            debug_assert_eq!(parent.ma.depth(), ma.depth() - 1);
            parent.data[slot as usize] = sa;
            if !parent.modified {
                parent.modified = true;
                self.fbuf_modified_count += 1;
            }
        }

        Ok(())
    }

    fn bucket_insert(&mut self, idx: u32, key: u32) {
        let bucket = key as usize % FILE_BUCKET_COUNT;
        self.fbuf_bucket[bucket].push(idx);
        self.fbufs[idx as usize].bucket = bucket as u32;
    }

    #[allow(clippy::expect_used)]
    fn bucket_remove(&mut self, idx: u32) {
        let bucket = self.fbufs[idx as usize].bucket as usize;
        let chain = &mut self.fbuf_bucket[bucket];
        let pos = chain
            .iter()
            .position(|&entry| entry == idx)
            .expect("buffer must be in its bucket");
        chain.swap_remove(pos);
    }

    /// Inserts `idx` just behind the clock hand
    fn cir_insert_before_head(&mut self, idx: u32) {
        if self.cir_head == NIL {
            self.fbufs[idx as usize].residency = Residency::Circular { prev: idx, next: idx };
            self.cir_head = idx;
            return;
        }

        let head = self.cir_head;
        let prev = self.fbufs[head as usize].residency.prev();
        self.fbufs[prev as usize].residency.set_next(idx);
        self.fbufs[head as usize].residency.set_prev(idx);
        self.fbufs[idx as usize].residency = Residency::Circular { prev, next: head };
    }

    fn cir_remove(&mut self, idx: u32) {
        debug_assert!(self.fbufs[idx as usize].residency.is_circular());
        let prev = self.fbufs[idx as usize].residency.prev();
        let next = self.fbufs[idx as usize].residency.next();

        if next == idx {
            self.cir_head = NIL;
            return;
        }
        self.fbufs[prev as usize].residency.set_next(next);
        self.fbufs[next as usize].residency.set_prev(prev);
        if self.cir_head == idx {
            self.cir_head = next;
        }
    }

    /// Moves a buffer from the circular queue to the indirect list of its
    /// level; it is about to become a parent
    fn promote_to_indirect(&mut self, idx: u32, depth: u32) {
        debug_assert_eq!(self.fbufs[idx as usize].ma.depth(), depth);
        self.cir_remove(idx);

        let head = self.indirect_head[depth as usize];
        if head != NIL {
            self.fbufs[head as usize].residency.set_prev(idx);
        }
        self.fbufs[idx as usize].residency = Residency::Indirect {
            depth,
            prev: NIL,
            next: head,
        };
        self.indirect_head[depth as usize] = idx;
        self.fbufs[idx as usize].ref_cnt = 0;
    }

    /// Moves an unpinned buffer from its indirect list back to the
    /// circular queue
    fn demote_to_circular(&mut self, idx: u32) {
        debug_assert_eq!(self.fbufs[idx as usize].ref_cnt, 0);
        let Residency::Indirect { depth, prev, next } = self.fbufs[idx as usize].residency else {
            unreachable!("demoted buffer must be on an indirect list");
        };

        if prev == NIL {
            self.indirect_head[depth as usize] = next;
        } else {
            self.fbufs[prev as usize].residency.set_next(next);
        }
        if next != NIL {
            self.fbufs[next as usize].residency.set_prev(prev);
        }

        self.cir_insert_before_head(idx);
        self.fbufs[idx as usize].accessed = false;
    }

    /// Verifies the queue partition invariants; test builds only
    #[cfg(test)]
    pub(crate) fn fbuf_queue_check(&self) {
        let mut seen = vec![false; self.fbufs.len()];

        if self.cir_head != NIL {
            let head = self.cir_head;
            let mut idx = head;
            loop {
                let fbuf = &self.fbufs[idx as usize];
                assert!(!seen[idx as usize], "buffer on two queues");
                seen[idx as usize] = true;
                assert!(fbuf.residency.is_circular());
                assert_eq!(fbuf.ref_cnt, 0, "pinned buffer on circular queue");
                idx = fbuf.residency.next();
                if idx == head {
                    break;
                }
            }
        }

        for depth in 0..META_LEAF_DEPTH {
            let mut idx = self.indirect_head[depth as usize];
            while idx != NIL {
                let fbuf = &self.fbufs[idx as usize];
                assert!(!seen[idx as usize], "buffer on two queues");
                seen[idx as usize] = true;
                assert!(matches!(
                    fbuf.residency,
                    Residency::Indirect { depth: d, .. } if d == depth
                ));
                assert!(fbuf.ref_cnt > 0, "unpinned buffer on indirect list");
                assert_eq!(fbuf.ma.depth(), depth);
                if depth > 0 {
                    let parent = &self.fbufs[fbuf.parent as usize];
                    assert_eq!(parent.ma.depth(), depth - 1);
                    assert!(!parent.residency.is_circular());
                }
                idx = fbuf.residency.next();
            }
        }

        assert!(seen.iter().all(|&s| s), "buffer on no queue");
    }
}
