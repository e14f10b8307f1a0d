//! Resource group directory, descriptors and buffer holds
//!
//! The directory is the in-core image of the resource index. It is rebuilt
//! in bulk whenever the index lock's generation moves past the version the
//! directory was loaded at.

use crate::bitmap::{self, compute_bitstructs, BitmapSegment};
use crate::error::{Error, Result};
use crate::fs::Gfs2Fs;
use crate::glock::{self, LockHolder, LockMode, LockName};
use crate::meta_io::BufferRef;
use crate::types::*;
use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// In-core state of one resource group
#[derive(Debug, Default)]
pub struct RgrpState {
    /// Header counters as last loaded or modified
    pub rg: RgrpHeader,
    /// Lock generation the header was loaded at
    pub rg_vn: u64,
    /// Header and bitmap buffers, present while held
    pub bh: Vec<BufferRef>,
    /// Private copies of each segment's bitmap bytes, made on first free
    pub clone: Vec<Option<Vec<u8>>>,
    pub bh_count: u32,
    /// Blocks the allocator may still hand out during this hold
    pub free_clone: u32,
    /// Group-relative goals for the next search
    pub last_alloc_data: u32,
    pub last_alloc_meta: u32,
}

impl RgrpState {
    pub fn is_held(&self) -> bool {
        self.bh_count > 0 && !self.bh.is_empty()
    }
}

/// Descriptor of one resource group
#[derive(Debug)]
pub struct ResourceGroup {
    pub ri: RindexEntry,
    pub bits: Vec<BitmapSegment>,
    state: Mutex<RgrpState>,
}

impl ResourceGroup {
    pub fn new(ri: RindexEntry, bits: Vec<BitmapSegment>) -> Self {
        let nbits = bits.len();
        ResourceGroup {
            ri,
            bits,
            state: Mutex::new(RgrpState {
                clone: vec![None; nbits],
                ..Default::default()
            }),
        }
    }

    pub fn addr(&self) -> u64 {
        self.ri.addr
    }

    pub fn lock_name(&self) -> LockName {
        LockName::Rgrp(self.ri.addr)
    }

    pub fn state(&self) -> MutexGuard<'_, RgrpState> {
        self.state.lock()
    }

    /// Index of the segment describing a group-relative block
    pub fn segment_of(&self, rel: u32) -> Option<usize> {
        self.bits.iter().position(|bi| bi.covers(rel))
    }

    /// Write the in-core header counters into the header buffer
    pub fn rgrp_out(&self, st: &RgrpState) {
        if let Some(bh) = st.bh.first() {
            st.rg.write_to(&mut bh.data_mut());
        }
    }

    /// Count blocks in each of the four states across the live bitmap
    pub fn count_states(&self, st: &RgrpState) -> [u32; 4] {
        let mut count = [0u32; 4];
        for (bi, bh) in self.bits.iter().zip(st.bh.iter()) {
            let data = bh.data();
            let seg = &data[bi.range()];
            for (state, slot) in count.iter_mut().enumerate() {
                *slot += bitmap::bitcount(seg, state as u8);
            }
        }
        count
    }
}

/// A pin on a resource group's header and bitmap buffers
pub struct RgrpHold {
    rgd: Arc<ResourceGroup>,
}

impl RgrpHold {
    pub fn rgd(&self) -> &Arc<ResourceGroup> {
        &self.rgd
    }

    /// Take another reference on the same buffers
    pub fn dup(&self) -> RgrpHold {
        self.rgd.state().bh_count += 1;
        RgrpHold {
            rgd: Arc::clone(&self.rgd),
        }
    }
}

impl Drop for RgrpHold {
    fn drop(&mut self) {
        let mut st = self.rgd.state();
        st.bh_count = st.bh_count.saturating_sub(1);
        if st.bh_count == 0 {
            st.bh.clear();
            for clone in st.clone.iter_mut() {
                *clone = None;
            }
        }
    }
}

#[derive(Default)]
struct DirInner {
    /// Groups in on-disk order
    list: Vec<Arc<ResourceGroup>>,
    /// Most recently looked-up groups first
    mru: Vec<Arc<ResourceGroup>>,
    /// Groups that recently satisfied a reservation
    recent: Vec<Arc<ResourceGroup>>,
    /// Where the next full sweep starts
    forward: Option<Arc<ResourceGroup>>,
}

/// All resource groups of a filesystem
#[derive(Default)]
pub struct RgrpDirectory {
    inner: Mutex<DirInner>,
    rebuild: Mutex<()>,
    /// Index lock generation the directory was built at; zero when empty
    vn: AtomicU64,
}

impl RgrpDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().list.len()
    }

    pub fn version(&self) -> u64 {
        self.vn.load(Ordering::Acquire)
    }

    /// Group whose data range contains `blk`, promoted to the MRU front
    pub fn lookup(&self, blk: u64) -> Option<Arc<ResourceGroup>> {
        let mut inner = self.inner.lock();
        let pos = inner.mru.iter().position(|rgd| rgd.ri.contains(blk))?;
        let rgd = inner.mru.remove(pos);
        inner.mru.insert(0, Arc::clone(&rgd));
        Some(rgd)
    }

    pub fn first(&self) -> Option<Arc<ResourceGroup>> {
        self.inner.lock().list.first().cloned()
    }

    /// Group following `rgd` in on-disk order
    pub fn next(&self, rgd: &ResourceGroup) -> Option<Arc<ResourceGroup>> {
        let inner = self.inner.lock();
        let pos = inner.list.iter().position(|r| r.ri.addr == rgd.ri.addr)?;
        inner.list.get(pos + 1).cloned()
    }

    /// Snapshot of every group in on-disk order
    pub fn all(&self) -> Vec<Arc<ResourceGroup>> {
        self.inner.lock().list.clone()
    }

    /// Where a search of the recent list starts: the group that last
    /// served this inode if it is still listed, else the head
    pub fn recent_first(&self, hint: u64) -> Option<Arc<ResourceGroup>> {
        let inner = self.inner.lock();
        inner
            .recent
            .iter()
            .find(|r| hint != 0 && r.ri.addr == hint)
            .or(inner.recent.first())
            .cloned()
    }

    /// Recent-list entry following `cur`
    pub fn recent_next(&self, cur: &ResourceGroup) -> Option<Arc<ResourceGroup>> {
        let inner = self.inner.lock();
        let pos = inner.recent.iter().position(|r| r.ri.addr == cur.ri.addr)?;
        inner.recent.get(pos + 1).cloned()
    }

    /// Drop `rgd` from the recent list, returning its successor
    pub fn recent_remove(&self, rgd: &ResourceGroup) -> Option<Arc<ResourceGroup>> {
        let mut inner = self.inner.lock();
        let pos = inner.recent.iter().position(|r| r.ri.addr == rgd.ri.addr)?;
        inner.recent.remove(pos);
        inner.recent.get(pos).cloned()
    }

    /// Append a group to the recent list unless present or the list is full
    pub fn recent_add(&self, rgd: &Arc<ResourceGroup>, max: usize) {
        let mut inner = self.inner.lock();
        if inner.recent.iter().any(|r| r.ri.addr == rgd.ri.addr) {
            return;
        }
        if inner.recent.len() >= max {
            return;
        }
        inner.recent.push(Arc::clone(rgd));
    }

    pub fn recent_len(&self) -> usize {
        self.inner.lock().recent.len()
    }

    /// Starting group of the next sweep, seeded per journal so that nodes
    /// spread over the filesystem
    pub fn forward(&self, jid: u32, journals: u32) -> Option<Arc<ResourceGroup>> {
        let mut inner = self.inner.lock();
        if inner.forward.is_none() && !inner.list.is_empty() {
            let rgrps = inner.list.len() as u64;
            let idx = (rgrps * jid as u64 / journals.max(1) as u64) as usize;
            let start = inner.list.get(idx).or(inner.list.first()).cloned();
            inner.forward = start;
        }
        inner.forward.clone()
    }

    pub fn forward_set(&self, rgd: &Arc<ResourceGroup>) {
        self.inner.lock().forward = Some(Arc::clone(rgd));
    }

    /// Tear down every descriptor
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = DirInner::default();
        self.vn.store(0, Ordering::Release);
    }

    fn install(&self, list: Vec<Arc<ResourceGroup>>, vn: u64) {
        let mut inner = self.inner.lock();
        *inner = DirInner {
            mru: list.clone(),
            list,
            recent: Vec::new(),
            forward: None,
        };
        self.vn.store(vn, Ordering::Release);
    }
}

impl Gfs2Fs {
    /// Look up the resource group owning a block
    pub fn blk2rgrpd(&self, blk: u64) -> Option<Arc<ResourceGroup>> {
        self.rgrps.lookup(blk)
    }

    pub fn rgrpd_get_first(&self) -> Option<Arc<ResourceGroup>> {
        self.rgrps.first()
    }

    pub fn rgrpd_get_next(&self, rgd: &ResourceGroup) -> Option<Arc<ResourceGroup>> {
        self.rgrps.next(rgd)
    }

    /// Lock the resource index shared, rebuilding the directory if it was
    /// loaded at an older generation
    pub fn rindex_hold(&self) -> Result<LockHolder> {
        let gh = glock::acquire(&self.lm, LockName::Rindex, LockMode::Shared)?;
        let gen = gh.generation();
        if self.rgrps.version() != gen {
            let _guard = self.rgrps.rebuild.lock();
            if self.rgrps.version() != gen {
                if let Err(e) = self.ri_update(gen) {
                    self.rgrps.clear();
                    return Err(e);
                }
            }
        }
        Ok(gh)
    }

    /// Reload every descriptor from the on-disk resource index
    fn ri_update(&self, gen: u64) -> Result<()> {
        let rindex = self.rindex_reread()?;
        if rindex.size % RindexEntry::SIZE as u64 != 0 {
            return Err(self.consist(
                rindex.addr,
                format!("resource index size {} is not a whole number of records", rindex.size),
            ));
        }

        let count = rindex.size / RindexEntry::SIZE as u64;
        let mut list = Vec::with_capacity(count as usize);
        let mut rec = [0u8; RindexEntry::SIZE];
        for i in 0..count {
            let n = self.jdata_read(&rindex, i * RindexEntry::SIZE as u64, &mut rec)?;
            if n != RindexEntry::SIZE {
                return Err(self.consist(rindex.addr, format!("short resource index record {}", i)));
            }
            let ri = RindexEntry::from_bytes(&rec);
            let bits = compute_bitstructs(&ri, &self.geo).map_err(|e| self.escalate(e))?;
            list.push(Arc::new(ResourceGroup::new(ri, bits)));
        }

        info!(
            "{}: loaded {} resource groups (index generation {})",
            self.args.fsname, count, gen
        );
        self.rgrps.install(list, gen);
        Ok(())
    }

    /// Pin a group's header and bitmap buffers, reloading the header
    /// counters if the group lock moved on since they were read
    pub fn rgrp_bh_get(&self, rgd: &Arc<ResourceGroup>) -> Result<RgrpHold> {
        let gen = self.lm.generation(rgd.lock_name());
        let mut st = rgd.state();
        if st.bh_count > 0 {
            st.bh_count += 1;
            return Ok(RgrpHold {
                rgd: Arc::clone(rgd),
            });
        }

        // Another holder may have changed the group since our copy was read
        let stale = st.rg_vn != gen;
        let blocks = rgd.ri.addr..rgd.ri.addr + rgd.ri.length as u64;
        let bhs = if stale {
            blocks
                .map(|blk| self.cache.read_fresh(blk))
                .collect::<Result<Vec<_>>>()?
        } else {
            self.cache.read_start(blocks)?
        };
        for (x, bh) in bhs.iter().enumerate() {
            let want = if x == 0 {
                GFS2_METATYPE_RG
            } else {
                GFS2_METATYPE_RB
            };
            if bh.metatype() != Some(want) {
                return Err(self.consist(
                    bh.blkno(),
                    format!("resource group block has type {:?}, expected {}", bh.metatype(), want),
                ));
            }
        }

        if stale {
            st.rg = RgrpHeader::from_bytes(&bhs[0].data());
            st.rg_vn = gen;
            debug!("rgrp {}: header reloaded, {} free", rgd.ri.addr, st.rg.free);
        }

        st.bh = bhs;
        st.free_clone = st.rg.free;
        st.bh_count = 1;
        Ok(RgrpHold {
            rgd: Arc::clone(rgd),
        })
    }

    /// Copy the live bitmaps over any clones and reset the allocatable count
    pub fn rgrp_repolish_clones(&self, rgd: &ResourceGroup) {
        let mut st = rgd.state();
        let RgrpState { bh, clone, .. } = &mut *st;
        for ((bi, bh), clone) in rgd.bits.iter().zip(bh.iter()).zip(clone.iter_mut()) {
            if let Some(copy) = clone {
                copy.copy_from_slice(&bh.data()[bi.range()]);
            }
        }
        st.free_clone = st.rg.free;
    }

    /// Forget uncommitted changes to a group: reload the counters from the
    /// header buffer, drop the clones, and force a device read on the next
    /// hold
    pub(crate) fn rgrp_discard(&self, rgd: &ResourceGroup) {
        let mut st = rgd.state();
        let header = st.bh.first().map(|bh| RgrpHeader::from_bytes(&bh.data()));
        if let Some(rg) = header {
            st.rg = rg;
        }
        st.free_clone = st.rg.free;
        st.rg_vn = 0;
        for clone in st.clone.iter_mut() {
            *clone = None;
        }
        debug!("rgrp {}: in-core changes discarded", rgd.ri.addr);
    }

    /// Check the header counters against the bitmap
    pub fn rgrp_verify(&self, rgd: &Arc<ResourceGroup>) -> Result<()> {
        let _hold = self.rgrp_bh_get(rgd)?;
        let st = rgd.state();
        let count = rgd.count_states(&st);
        let rg = st.rg;
        drop(st);

        if count[GFS2_BLKST_FREE as usize] != rg.free {
            return Err(self.consist(
                rgd.ri.addr,
                format!("free data mismatch: {} != {}", count[0], rg.free),
            ));
        }
        let used = rgd.ri.data as i64 - rg.free as i64 - rg.dinodes as i64;
        if count[GFS2_BLKST_USED as usize] as i64 != used {
            return Err(self.consist(
                rgd.ri.addr,
                format!("used data mismatch: {} != {}", count[1], used),
            ));
        }
        if count[GFS2_BLKST_UNLINKED as usize] != 0 {
            return Err(self.consist(
                rgd.ri.addr,
                format!("{} unlinked blocks in bitmap", count[2]),
            ));
        }
        if count[GFS2_BLKST_DINODE as usize] != rg.dinodes {
            return Err(self.consist(
                rgd.ri.addr,
                format!("used metadata mismatch: {} != {}", count[3], rg.dinodes),
            ));
        }
        Ok(())
    }

    /// Verify every group in the filesystem
    pub fn verify_all(&self) -> Result<usize> {
        let _ri_gh = self.rindex_hold()?;
        let mut checked = 0;
        for rgd in self.rgrps.all() {
            let _gh = glock::acquire(&self.lm, rgd.lock_name(), LockMode::Shared)?;
            self.rgrp_verify(&rgd)?;
            checked += 1;
        }
        Ok(checked)
    }

    /// Header counters of one group
    pub fn rgrp_header(&self, rgd: &Arc<ResourceGroup>) -> Result<RgrpHeader> {
        let _gh = glock::acquire(&self.lm, rgd.lock_name(), LockMode::Shared)?;
        let _hold = self.rgrp_bh_get(rgd)?;
        let rg = rgd.state().rg;
        Ok(rg)
    }

    /// Allocation state of one block
    pub fn get_block_type(&self, blk: u64) -> Result<u8> {
        let _ri_gh = self.rindex_hold()?;
        let rgd = self
            .blk2rgrpd(blk)
            .ok_or_else(|| Error::Invalid(format!("block {} is not in any resource group", blk)))?;
        let _gh = glock::acquire(&self.lm, rgd.lock_name(), LockMode::Shared)?;
        let _hold = self.rgrp_bh_get(&rgd)?;

        let st = rgd.state();
        let rel = (blk - rgd.ri.data0) as u32;
        let idx = rgd
            .segment_of(rel)
            .ok_or_else(|| self.consist(blk, "block not covered by any bitmap segment"))?;
        let bi = &rgd.bits[idx];
        let data = st.bh[idx].data();
        Ok(bitmap::test_bit(&data[bi.range()], rel - bi.first_block()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testing::mem_fs;

    fn rgd(addr: u64, data: u32) -> Arc<ResourceGroup> {
        let ri = RindexEntry {
            addr,
            length: 1,
            data0: addr + 1,
            data,
            bitbytes: data / 4,
        };
        let bits = compute_bitstructs(&ri, &Geometry::new(4096)).unwrap();
        Arc::new(ResourceGroup::new(ri, bits))
    }

    fn directory(n: u64) -> RgrpDirectory {
        let dir = RgrpDirectory::new();
        let list = (0..n).map(|i| rgd(100 + i * 101, 100)).collect();
        dir.install(list, 1);
        dir
    }

    #[test]
    fn test_lookup_promotes_to_front() {
        let dir = directory(4);
        let hit = dir.lookup(100 + 3 * 101 + 5).unwrap();
        assert_eq!(hit.addr(), 403);
        assert_eq!(dir.inner.lock().mru[0].addr(), 403);
        // on-disk order is untouched
        assert_eq!(dir.first().unwrap().addr(), 100);
        assert!(dir.lookup(100).is_none());
        assert!(dir.lookup(100_000).is_none());
    }

    #[test]
    fn test_iteration_order() {
        let dir = directory(3);
        let first = dir.first().unwrap();
        let second = dir.next(&first).unwrap();
        let third = dir.next(&second).unwrap();
        assert_eq!(second.addr(), 201);
        assert!(dir.next(&third).is_none());
    }

    #[test]
    fn test_recent_list_bounded() {
        let dir = directory(4);
        let all = dir.all();
        dir.recent_add(&all[2], 2);
        dir.recent_add(&all[2], 2);
        dir.recent_add(&all[0], 2);
        dir.recent_add(&all[1], 2);
        assert_eq!(dir.recent_len(), 2);

        let head = dir.recent_first(0).unwrap();
        assert_eq!(head.addr(), all[2].addr());
        assert_eq!(dir.recent_first(all[0].addr()).unwrap().addr(), all[0].addr());
        assert_eq!(dir.recent_first(all[3].addr()).unwrap().addr(), all[2].addr());
        assert_eq!(dir.recent_next(&head).unwrap().addr(), all[0].addr());
        let next = dir.recent_remove(&head).unwrap();
        assert_eq!(next.addr(), all[0].addr());
        assert_eq!(dir.recent_len(), 1);
    }

    /// Rewrite the resource index dinode on disk and move the index lock
    /// on, as another node would
    fn corrupt_rindex(fs: &Gfs2Fs, edit: impl FnOnce(&mut [u8])) {
        let bh = fs.read_meta(fs.sb.rindex_addr, GFS2_METATYPE_DI).unwrap();
        edit(&mut bh.data_mut());
        fs.cache.write(&bh).unwrap();
        drop(glock::acquire(&fs.lm, LockName::Rindex, LockMode::Exclusive).unwrap());
    }

    #[test]
    fn test_partial_index_record_is_fault() {
        let fs = mem_fs(4096, 3, 100);
        assert_eq!(fs.rgrps.count(), 3);
        corrupt_rindex(&fs, |data| {
            let mut di = Dinode::from_bytes(data).unwrap();
            di.size += 40;
            di.write_to(data);
        });

        let err = fs.rindex_hold().unwrap_err();
        assert!(matches!(err, Error::Consistency { .. }));
        assert!(fs.is_withdrawn());
        assert_eq!(fs.rgrps.count(), 0);
        assert_eq!(fs.rgrps.version(), 0);
        assert!(fs.blk2rgrpd(fs.root_addr()).is_none());
    }

    #[test]
    fn test_failed_rebuild_leaves_directory_empty() {
        let fs = mem_fs(512, 2, 100);
        corrupt_rindex(&fs, |data| {
            crate::file::set_dinode_ptr(data, 0, 1 << 40);
        });

        assert!(matches!(fs.rindex_hold(), Err(Error::Io(_))));
        assert!(!fs.is_withdrawn());
        assert_eq!(fs.rgrps.count(), 0);
        assert_eq!(fs.rgrps.version(), 0);
        assert!(fs.rgrpd_get_first().is_none());
    }

    #[test]
    fn test_forward_seeded_by_journal() {
        let dir = directory(4);
        assert_eq!(dir.forward(1, 2).unwrap().addr(), dir.all()[2].addr());
        dir.forward_set(&dir.all()[3]);
        assert_eq!(dir.forward(0, 2).unwrap().addr(), dir.all()[3].addr());
        dir.clear();
        assert!(dir.forward(0, 2).is_none());
        assert_eq!(dir.version(), 0);
    }
}
