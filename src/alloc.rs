//! Block allocator
//!
//! A caller reserves a number of blocks up front. The reservation picks and
//! locks one resource group that can supply them all; individual
//! allocations then flip bits inside that group. Frees may land in any
//! group the caller has locked through a [`RgrpList`].

use crate::bitmap;
use crate::error::{Error, Result};
use crate::fs::Gfs2Fs;
use crate::glock::{self, LockHolder, LockMode};
use crate::inode::IncoreInode;
use crate::rgrp::{ResourceGroup, RgrpHold, RgrpState};
use crate::trans::Transaction;
use crate::types::*;
use log::{debug, warn};
use std::sync::Arc;

/// Space reserved in one resource group for the duration of an operation
pub struct Reservation {
    requested: u32,
    alloced: u32,
    rgd: Arc<ResourceGroup>,
    // Field order is release order: buffers, group lock, index lock
    _hold: RgrpHold,
    _rg_gh: LockHolder,
    _ri_gh: LockHolder,
}

impl Reservation {
    pub fn rgd(&self) -> &Arc<ResourceGroup> {
        &self.rgd
    }

    pub fn requested(&self) -> u32 {
        self.requested
    }

    pub fn alloced(&self) -> u32 {
        self.alloced
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.alloced > self.requested {
            warn!(
                "rgrp {}: allocated {} blocks against a reservation of {}",
                self.rgd.addr(),
                self.alloced,
                self.requested
            );
        }
    }
}

/// Which kind of block an allocation produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocKind {
    Data,
    Meta,
    Dinode,
}

impl Gfs2Fs {
    /// Reserve `requested` blocks for an operation on `ip`
    pub fn inplace_reserve(&self, ip: &mut IncoreInode, requested: u32) -> Result<Reservation> {
        self.check_withdrawn()?;
        if requested == 0 {
            return Err(Error::Invalid("reservation of zero blocks".into()));
        }

        let ri_gh = self.rindex_hold()?;
        let (rgd, rg_gh, hold) = self.get_local_rgrp(ip, requested)?;
        debug!(
            "{}: reserved {} blocks in rgrp {}",
            self.args.fsname,
            requested,
            rgd.addr()
        );
        Ok(Reservation {
            requested,
            alloced: 0,
            rgd,
            _hold: hold,
            _rg_gh: rg_gh,
            _ri_gh: ri_gh,
        })
    }

    /// Check whether a locked group can cover the request; on success the
    /// group's buffers stay pinned
    fn try_rgrp_fit(&self, rgd: &Arc<ResourceGroup>, requested: u32) -> Result<Option<RgrpHold>> {
        let hold = self.rgrp_bh_get(rgd)?;
        let fits = {
            let st = rgd.state();
            st.rg.flags & GFS2_RGF_NOALLOC == 0 && st.free_clone >= requested
        };
        Ok(fits.then_some(hold))
    }

    /// Pick and lock a resource group, avoiding contention with other nodes
    fn get_local_rgrp(
        &self,
        ip: &mut IncoreInode,
        requested: u32,
    ) -> Result<(Arc<ResourceGroup>, LockHolder, RgrpHold)> {
        // Recently successful groups, only if nobody else holds them
        let mut cur = self.rgrps.recent_first(ip.last_rg_alloc);
        while let Some(rgd) = cur {
            match glock::try_acquire(&self.lm, rgd.lock_name(), LockMode::Exclusive)? {
                Some(gh) => {
                    if let Some(hold) = self.try_rgrp_fit(&rgd, requested)? {
                        ip.last_rg_alloc = rgd.addr();
                        return Ok((rgd, gh, hold));
                    }
                    drop(gh);
                    cur = self.rgrps.recent_remove(&rgd);
                }
                None => cur = self.rgrps.recent_next(&rgd),
            }
        }

        // Full sweep from the forward cursor: two passes with try locks,
        // the second one waiting if the first skipped anything
        let begin = self
            .rgrps
            .forward(self.args.jid, self.journals())
            .ok_or(Error::NoSpace)?;
        let mut rgd = Arc::clone(&begin);
        let mut try_lock = true;
        let mut loops = 0;
        let mut skipped = 0;

        let (rgd, gh, hold) = loop {
            let gh = if try_lock {
                glock::try_acquire(&self.lm, rgd.lock_name(), LockMode::Exclusive)?
            } else {
                Some(glock::acquire(&self.lm, rgd.lock_name(), LockMode::Exclusive)?)
            };
            match gh {
                Some(gh) => {
                    if let Some(hold) = self.try_rgrp_fit(&rgd, requested)? {
                        break (rgd, gh, hold);
                    }
                }
                None => skipped += 1,
            }

            rgd = self.next_or_first(&rgd)?;
            if rgd.addr() == begin.addr() {
                loops += 1;
                if loops >= 2 || skipped == 0 {
                    debug!(
                        "{}: no resource group can supply {} blocks",
                        self.args.fsname, requested
                    );
                    return Err(Error::NoSpace);
                }
                try_lock = false;
            }
        };

        ip.last_rg_alloc = rgd.addr();
        let max = (self.rgrps.count() / self.journals() as usize).max(1);
        self.rgrps.recent_add(&rgd, max);
        let next = self.next_or_first(&rgd)?;
        self.rgrps.forward_set(&next);

        Ok((rgd, gh, hold))
    }

    fn next_or_first(&self, rgd: &ResourceGroup) -> Result<Arc<ResourceGroup>> {
        self.rgrps
            .next(rgd)
            .or_else(|| self.rgrps.first())
            .ok_or(Error::NoSpace)
    }

    /// Change one block's state in the live bitmap, and in the clone if
    /// there is one
    fn setbit(
        &self,
        rgd: &ResourceGroup,
        st: &mut RgrpState,
        buf: usize,
        blk: u32,
        new_state: u8,
        with_clone: bool,
        tr: &mut Transaction<'_>,
    ) -> Result<()> {
        let bi = rgd.bits[buf];
        let bh = Arc::clone(&st.bh[buf]);
        let old = bitmap::test_bit(&bh.data()[bi.range()], blk);
        if !bitmap::valid_change(old, new_state) {
            return Err(self.consist(
                rgd.ri.data0 + (bi.first_block() + blk) as u64,
                format!(
                    "rgrp {}: bad block state change {} -> {}",
                    rgd.addr(),
                    bitmap::state_name(old),
                    bitmap::state_name(new_state)
                ),
            ));
        }

        tr.add_buffer(&bh)?;
        bitmap::set_bit(&mut bh.data_mut()[bi.range()], blk, new_state);
        if with_clone {
            if let Some(clone) = st.clone[buf].as_mut() {
                bitmap::set_bit(clone, blk, new_state);
            }
        }
        Ok(())
    }

    /// Find a block in `old_state` at or after `goal`, wrapping around the
    /// group, and switch it to `new_state`. Returns the group-relative block.
    fn rgblk_search(
        &self,
        rgd: &ResourceGroup,
        st: &mut RgrpState,
        goal: u32,
        old_state: u8,
        new_state: u8,
        tr: &mut Transaction<'_>,
    ) -> Result<u32> {
        let length = rgd.bits.len();
        let mut buf = rgd.segment_of(goal).unwrap_or(0);
        let mut goal = goal.saturating_sub(rgd.bits[buf].first_block());

        // One extra round so the part of the first segment before the goal
        // is searched last
        let mut found = None;
        for _ in 0..=length {
            let bi = rgd.bits[buf];
            let blk = match &st.clone[buf] {
                Some(clone) => bitmap::bitfit(clone, goal, old_state),
                None => bitmap::bitfit(&st.bh[buf].data()[bi.range()], goal, old_state),
            };
            if let Some(blk) = blk {
                found = Some((buf, blk));
                break;
            }
            buf = (buf + 1) % length;
            goal = 0;
        }

        let (buf, blk) = found.ok_or_else(|| {
            self.consist(
                rgd.addr(),
                format!("no {} block left in resource group", bitmap::state_name(old_state)),
            )
        })?;
        self.setbit(rgd, st, buf, blk, new_state, true, tr)?;
        Ok(rgd.bits[buf].first_block() + blk)
    }

    fn alloc_block(
        &self,
        ip: &mut IncoreInode,
        res: &mut Reservation,
        tr: &mut Transaction<'_>,
        kind: AllocKind,
    ) -> Result<u64> {
        let rgd = Arc::clone(&res.rgd);
        if res.alloced >= res.requested {
            return Err(self.consist(
                rgd.addr(),
                format!("allocation beyond a reservation of {} blocks", res.requested),
            ));
        }

        let mut st = rgd.state();
        if st.rg.free == 0 {
            return Err(self.consist(rgd.addr(), "allocation from a full resource group"));
        }

        let (goal, new_state) = match kind {
            AllocKind::Data if rgd.ri.contains(ip.di.goal_data) => {
                ((ip.di.goal_data - rgd.ri.data0) as u32, GFS2_BLKST_USED)
            }
            AllocKind::Data => (st.last_alloc_data, GFS2_BLKST_USED),
            AllocKind::Meta if rgd.ri.contains(ip.di.goal_meta) => {
                ((ip.di.goal_meta - rgd.ri.data0) as u32, GFS2_BLKST_USED)
            }
            AllocKind::Meta => (st.last_alloc_meta, GFS2_BLKST_USED),
            AllocKind::Dinode => (st.last_alloc_meta, GFS2_BLKST_DINODE),
        };

        let blk = self.rgblk_search(&rgd, &mut st, goal, GFS2_BLKST_FREE, new_state, tr)?;
        let block = rgd.ri.data0 + blk as u64;
        match kind {
            AllocKind::Data => {
                st.last_alloc_data = blk;
                ip.di.goal_data = block;
            }
            AllocKind::Meta => {
                st.last_alloc_meta = blk;
                ip.di.goal_meta = block;
            }
            AllocKind::Dinode => {
                st.last_alloc_meta = blk;
                st.rg.dinodes += 1;
            }
        }

        st.rg.free -= 1;
        st.free_clone = st.free_clone.saturating_sub(1);
        tr.add_buffer(&st.bh[0])?;
        rgd.rgrp_out(&st);
        drop(st);

        res.alloced += 1;
        match kind {
            AllocKind::Data => {
                self.statfs_change(0, -1, 0);
                self.quota.charge(ip.uid(), ip.gid(), 1);
            }
            AllocKind::Meta => {
                self.statfs_change(0, -1, 0);
                self.quota.charge(ip.uid(), ip.gid(), 1);
                tr.cancel_revocation(block);
            }
            AllocKind::Dinode => {
                self.statfs_change(0, -1, 1);
                tr.cancel_revocation(block);
            }
        }
        Ok(block)
    }

    /// Allocate a data block for `ip`
    pub fn alloc_data(
        &self,
        ip: &mut IncoreInode,
        res: &mut Reservation,
        tr: &mut Transaction<'_>,
    ) -> Result<u64> {
        self.alloc_block(ip, res, tr, AllocKind::Data)
    }

    /// Allocate a metadata block for `ip`
    pub fn alloc_meta(
        &self,
        ip: &mut IncoreInode,
        res: &mut Reservation,
        tr: &mut Transaction<'_>,
    ) -> Result<u64> {
        self.alloc_block(ip, res, tr, AllocKind::Meta)
    }

    /// Allocate a dinode block in the group reserved through `dip`
    pub fn alloc_di(
        &self,
        dip: &mut IncoreInode,
        res: &mut Reservation,
        tr: &mut Transaction<'_>,
    ) -> Result<u64> {
        self.alloc_block(dip, res, tr, AllocKind::Dinode)
    }

    /// Mark a run of blocks free in the live bitmap. The run must lie in a
    /// single group whose buffers are held. The first change to a segment
    /// within a hold snapshots it, so the allocator keeps seeing the freed
    /// blocks as used until the transaction commits.
    fn rgblk_free(
        &self,
        bstart: u64,
        blen: u32,
        tr: &mut Transaction<'_>,
    ) -> Result<Arc<ResourceGroup>> {
        let rgd = self
            .blk2rgrpd(bstart)
            .ok_or_else(|| self.consist(bstart, "freeing a block outside every resource group"))?;
        let last = bstart + blen as u64 - 1;
        if blen == 0 || !rgd.ri.contains(last) {
            return Err(self.consist(
                bstart,
                format!("run of {} blocks crosses the end of rgrp {}", blen, rgd.addr()),
            ));
        }

        let mut st = rgd.state();
        if !st.is_held() {
            return Err(self.consist(
                bstart,
                format!("freeing in rgrp {} without holding it", rgd.addr()),
            ));
        }

        let run = (bstart - rgd.ri.data0) as u32..=(last - rgd.ri.data0) as u32;
        let mut segs = Vec::with_capacity(blen as usize);
        // The whole run must be in use before any bit changes
        for rel in run.clone() {
            let buf = rgd
                .segment_of(rel)
                .ok_or_else(|| self.consist(rgd.ri.data0 + rel as u64, "block not in any bitmap segment"))?;
            let bi = rgd.bits[buf];
            let old = bitmap::test_bit(&st.bh[buf].data()[bi.range()], rel - bi.first_block());
            if !bitmap::valid_change(old, GFS2_BLKST_FREE) {
                return Err(self.consist(
                    rgd.ri.data0 + rel as u64,
                    format!(
                        "rgrp {}: freeing a {} block in a run of {}",
                        rgd.addr(),
                        bitmap::state_name(old),
                        blen
                    ),
                ));
            }
            segs.push(buf);
        }

        for (rel, buf) in run.zip(segs) {
            let bi = rgd.bits[buf];
            if st.clone[buf].is_none() {
                let snapshot = st.bh[buf].data()[bi.range()].to_vec();
                st.clone[buf] = Some(snapshot);
            }
            self.setbit(&rgd, &mut st, buf, rel - bi.first_block(), GFS2_BLKST_FREE, false, tr)?;
        }
        drop(st);
        Ok(rgd)
    }

    /// Return freed blocks to the group counters and pin the group until
    /// commit so its clones get repolished
    fn free_account(
        &self,
        rgd: &Arc<ResourceGroup>,
        blen: u32,
        dinode: bool,
        tr: &mut Transaction<'_>,
    ) -> Result<()> {
        let hold = self.rgrp_bh_get(rgd)?;
        {
            let mut st = rgd.state();
            if dinode {
                if st.rg.dinodes == 0 {
                    drop(st);
                    return Err(self.consist(rgd.addr(), "dinode count underflow"));
                }
                st.rg.dinodes -= 1;
            }
            st.rg.free += blen;
            tr.add_buffer(&st.bh[0])?;
            rgd.rgrp_out(&st);
        }
        tr.add_rg(&hold);
        Ok(())
    }

    /// Free a run of data blocks owned by `ip`
    pub fn free_data(
        &self,
        ip: &IncoreInode,
        bstart: u64,
        blen: u32,
        tr: &mut Transaction<'_>,
    ) -> Result<()> {
        let rgd = self.rgblk_free(bstart, blen, tr)?;
        self.free_account(&rgd, blen, false, tr)?;
        self.statfs_change(0, blen as i64, 0);
        self.quota.charge(ip.uid(), ip.gid(), -(blen as i64));
        Ok(())
    }

    /// Free a run of metadata blocks owned by `ip`, revoking them and
    /// dropping any cached copies
    pub fn free_meta(
        &self,
        ip: &IncoreInode,
        bstart: u64,
        blen: u32,
        tr: &mut Transaction<'_>,
    ) -> Result<()> {
        let rgd = self.rgblk_free(bstart, blen, tr)?;
        self.free_account(&rgd, blen, false, tr)?;
        self.statfs_change(0, blen as i64, 0);
        self.quota.charge(ip.uid(), ip.gid(), -(blen as i64));
        self.meta_wipe(bstart, blen, tr)
    }

    /// Free a dinode block that never became a live inode
    pub fn free_uninit_di(
        &self,
        rgd: &Arc<ResourceGroup>,
        blkno: u64,
        tr: &mut Transaction<'_>,
    ) -> Result<()> {
        let owner = self.rgblk_free(blkno, 1, tr)?;
        if owner.addr() != rgd.addr() {
            return Err(self.consist(
                blkno,
                format!("dinode is in rgrp {}, not {}", owner.addr(), rgd.addr()),
            ));
        }
        self.free_account(rgd, 1, true, tr)?;
        self.statfs_change(0, 1, -1);
        Ok(())
    }

    /// Free an inode's dinode block
    pub fn free_di(
        &self,
        rgd: &Arc<ResourceGroup>,
        ip: &IncoreInode,
        tr: &mut Transaction<'_>,
    ) -> Result<()> {
        self.free_uninit_di(rgd, ip.addr, tr)?;
        self.quota.charge(ip.uid(), ip.gid(), -1);
        self.meta_wipe(ip.addr, 1, tr)
    }

    fn meta_wipe(&self, bstart: u64, blen: u32, tr: &mut Transaction<'_>) -> Result<()> {
        for blk in bstart..bstart + blen as u64 {
            tr.add_revoke(blk)?;
        }
        self.cache.wipe(bstart, blen as u64);
        Ok(())
    }
}

/// The distinct resource groups owning a set of blocks, locked together
/// for freeing
pub struct RgrpList<'a> {
    fs: &'a Gfs2Fs,
    rgrps: Vec<Arc<ResourceGroup>>,
    // Field order is release order
    holds: Vec<RgrpHold>,
    holders: Vec<LockHolder>,
    _ri_gh: LockHolder,
}

impl Gfs2Fs {
    /// Start a resource group list; the resource index stays locked for
    /// the life of the list
    pub fn rlist_new(&self) -> Result<RgrpList<'_>> {
        let ri_gh = self.rindex_hold()?;
        Ok(RgrpList {
            fs: self,
            rgrps: Vec::new(),
            holds: Vec::new(),
            holders: Vec::new(),
            _ri_gh: ri_gh,
        })
    }
}

impl RgrpList<'_> {
    /// Add the group owning `block`
    pub fn add(&mut self, block: u64) -> Result<()> {
        if !self.holders.is_empty() {
            return Err(Error::Invalid("resource group list already locked".into()));
        }
        let rgd = self
            .fs
            .blk2rgrpd(block)
            .ok_or_else(|| self.fs.consist(block, "block outside every resource group"))?;
        if !self.rgrps.iter().any(|r| r.addr() == rgd.addr()) {
            self.rgrps.push(rgd);
        }
        Ok(())
    }

    /// Lock every listed group exclusively, in address order, and pin
    /// their buffers
    pub fn lock(&mut self) -> Result<()> {
        self.rgrps.sort_by_key(|r| r.addr());
        let names: Vec<_> = self.rgrps.iter().map(|r| r.lock_name()).collect();
        self.holders = glock::acquire_many(&self.fs.lm, &names, LockMode::Exclusive)?;
        for rgd in &self.rgrps {
            self.holds.push(self.fs.rgrp_bh_get(rgd)?);
        }
        Ok(())
    }

    pub fn rgrps(&self) -> &[Arc<ResourceGroup>] {
        &self.rgrps
    }

    pub fn len(&self) -> usize {
        self.rgrps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rgrps.is_empty()
    }

    /// Header and bitmap blocks across every listed group
    pub fn total_length(&self) -> u32 {
        self.rgrps.iter().map(|r| r.ri.length).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testing::mem_fs;
    use crate::glock::LockName;

    fn owner(fs: &Gfs2Fs) -> IncoreInode {
        let mut ip = IncoreInode::new(fs.root_addr());
        ip.di.uid = 500;
        ip.di.gid = 50;
        ip
    }

    #[test]
    fn test_reserve_zero_is_invalid() {
        let fs = mem_fs(4096, 2, 200);
        let mut ip = owner(&fs);
        assert!(matches!(fs.inplace_reserve(&mut ip, 0), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_alloc_data_updates_counters() {
        let fs = mem_fs(4096, 2, 200);
        let mut ip = owner(&fs);
        let before = fs.statfs();

        let mut res = fs.inplace_reserve(&mut ip, 3).unwrap();
        let mut tr = fs.trans_begin(res.rgd().ri.length + 1, 0).unwrap();
        let a = fs.alloc_data(&mut ip, &mut res, &mut tr).unwrap();
        let b = fs.alloc_data(&mut ip, &mut res, &mut tr).unwrap();
        assert_ne!(a, b);
        assert_eq!(ip.di.goal_data, b);
        assert_eq!(res.alloced(), 2);
        tr.end().unwrap();
        drop(res);

        assert_eq!(fs.get_block_type(a).unwrap(), GFS2_BLKST_USED);
        assert_eq!(fs.statfs().free_blocks, before.free_blocks - 2);
        fs.verify_all().unwrap();
    }

    #[test]
    fn test_reserve_larger_than_any_group() {
        let fs = mem_fs(4096, 2, 200);
        let mut ip = owner(&fs);
        assert!(matches!(fs.inplace_reserve(&mut ip, 500), Err(Error::NoSpace)));
        assert!(!fs.is_withdrawn());
    }

    #[test]
    fn test_alloc_beyond_reservation_is_fault() {
        let fs = mem_fs(4096, 1, 200);
        let mut ip = owner(&fs);
        let mut res = fs.inplace_reserve(&mut ip, 1).unwrap();
        let mut tr = fs.trans_begin(4, 0).unwrap();
        fs.alloc_meta(&mut ip, &mut res, &mut tr).unwrap();
        let err = fs.alloc_meta(&mut ip, &mut res, &mut tr).unwrap_err();
        assert!(err.is_consistency());
        assert!(fs.is_withdrawn());
    }

    #[test]
    fn test_busy_group_is_skipped() {
        let fs = mem_fs(4096, 2, 200);
        let mut ip = owner(&fs);
        let first = fs.rgrpd_get_first().unwrap();
        let second = fs.rgrpd_get_next(&first).unwrap();
        let _busy = glock::acquire(&fs.lm, LockName::Rgrp(first.addr()), LockMode::Exclusive).unwrap();

        let res = fs.inplace_reserve(&mut ip, 1).unwrap();
        assert_eq!(res.rgd().addr(), second.addr());
        assert_eq!(ip.last_rg_alloc, second.addr());
    }

    #[test]
    fn test_success_feeds_recent_and_forward() {
        let fs = mem_fs(4096, 3, 200);
        let mut ip = owner(&fs);
        let res = fs.inplace_reserve(&mut ip, 1).unwrap();
        let chosen = Arc::clone(res.rgd());
        drop(res);
        assert_eq!(fs.rgrps.recent_len(), 1);
        let fwd = fs.rgrps.forward(0, 1).unwrap();
        let expected = fs.next_or_first(&chosen).unwrap();
        assert_eq!(fwd.addr(), expected.addr());

        // the recent list serves the next reservation
        let res = fs.inplace_reserve(&mut ip, 1).unwrap();
        assert_eq!(res.rgd().addr(), chosen.addr());
    }

    #[test]
    fn test_freed_blocks_hidden_until_commit() {
        let fs = mem_fs(4096, 1, 12);
        let mut ip = owner(&fs);
        // 8 data blocks, one taken by the root dinode
        let mut res = fs.inplace_reserve(&mut ip, 7).unwrap();
        let mut tr = fs.trans_begin(4, 0).unwrap();
        let mut blocks = Vec::new();
        for _ in 0..6 {
            blocks.push(fs.alloc_data(&mut ip, &mut res, &mut tr).unwrap());
        }
        tr.end().unwrap();

        let mut tr = fs.trans_begin(4, 0).unwrap();
        fs.free_data(&ip, blocks[0], 1, &mut tr).unwrap();
        // the only block the allocator can see is the never-used one
        let next = fs.alloc_data(&mut ip, &mut res, &mut tr).unwrap();
        assert_ne!(next, blocks[0]);
        tr.end().unwrap();
        drop(res);

        // after commit the freed block is available again
        let mut res = fs.inplace_reserve(&mut ip, 1).unwrap();
        let mut tr = fs.trans_begin(4, 0).unwrap();
        assert_eq!(fs.alloc_data(&mut ip, &mut res, &mut tr).unwrap(), blocks[0]);
        tr.end().unwrap();
        drop(res);
        fs.verify_all().unwrap();
    }

    #[test]
    fn test_realloc_cancels_revoke() {
        let fs = mem_fs(4096, 1, 200);
        let mut ip = owner(&fs);
        let mut res = fs.inplace_reserve(&mut ip, 1).unwrap();
        let mut tr = fs.trans_begin(4, 0).unwrap();
        let blk = fs.alloc_meta(&mut ip, &mut res, &mut tr).unwrap();
        tr.end().unwrap();
        drop(res);

        let mut rlist = fs.rlist_new().unwrap();
        rlist.add(blk).unwrap();
        rlist.lock().unwrap();
        let mut tr = fs.trans_begin(4, 1).unwrap();
        fs.free_meta(&ip, blk, 1, &mut tr).unwrap();
        tr.end().unwrap();
        drop(rlist);
        assert!(fs.is_revoked(blk));

        ip.di.goal_meta = blk;
        let mut res = fs.inplace_reserve(&mut ip, 1).unwrap();
        let mut tr = fs.trans_begin(4, 0).unwrap();
        assert_eq!(fs.alloc_meta(&mut ip, &mut res, &mut tr).unwrap(), blk);
        tr.end().unwrap();
        assert!(!fs.is_revoked(blk));
    }

    #[test]
    fn test_double_free_is_fault() {
        let fs = mem_fs(4096, 1, 200);
        let ip = owner(&fs);
        let rgd = fs.rgrpd_get_first().unwrap();
        let free_blk = rgd.ri.data0 + 10;

        let mut rlist = fs.rlist_new().unwrap();
        rlist.add(free_blk).unwrap();
        rlist.lock().unwrap();
        let mut tr = fs.trans_begin(4, 0).unwrap();
        let err = fs.free_data(&ip, free_blk, 1, &mut tr).unwrap_err();
        assert!(err.is_consistency());
    }

    #[test]
    fn test_free_without_hold_is_fault() {
        let fs = mem_fs(4096, 1, 200);
        let ip = owner(&fs);
        let rgd = fs.rgrpd_get_first().unwrap();
        let mut tr = fs.trans_begin(4, 0).unwrap();
        let err = fs.free_data(&ip, rgd.ri.data0 + 1, 1, &mut tr).unwrap_err();
        assert!(err.is_consistency());
    }

    #[test]
    fn test_free_across_group_end_is_fault() {
        let fs = mem_fs(4096, 2, 200);
        let ip = owner(&fs);
        let rgd = fs.rgrpd_get_first().unwrap();
        let end = rgd.ri.data0 + rgd.ri.data as u64;
        let mut rlist = fs.rlist_new().unwrap();
        rlist.add(end - 1).unwrap();
        rlist.lock().unwrap();
        let mut tr = fs.trans_begin(4, 0).unwrap();
        assert!(fs.free_data(&ip, end - 1, 2, &mut tr).unwrap_err().is_consistency());
    }

    #[test]
    fn test_rlist_dedups_and_sums() {
        let fs = mem_fs(4096, 3, 200);
        let all = fs.rgrps.all();
        let mut rlist = fs.rlist_new().unwrap();
        rlist.add(all[2].ri.data0).unwrap();
        rlist.add(all[0].ri.data0 + 5).unwrap();
        rlist.add(all[2].ri.data0 + 1).unwrap();
        assert_eq!(rlist.len(), 2);
        rlist.lock().unwrap();
        assert_eq!(rlist.rgrps()[0].addr(), all[0].addr());
        assert_eq!(rlist.total_length(), all[0].ri.length + all[2].ri.length);
        assert!(rlist.add(all[1].ri.data0).is_err());
    }
}
