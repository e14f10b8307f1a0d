//! Transactions
//!
//! A transaction is sized up front by the number of metadata buffers it may
//! touch and the number of revokes it may issue. Buffers added to it are
//! written back when it ends; resource groups it freed blocks in have their
//! clone bitmaps repolished at the same point.

use crate::error::{Error, Result};
use crate::fs::Gfs2Fs;
use crate::meta_io::BufferRef;
use crate::rgrp::RgrpHold;
use log::{debug, error, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct Transaction<'a> {
    fs: &'a Gfs2Fs,
    blocks: u32,
    revokes: u32,
    buffers: BTreeMap<u64, BufferRef>,
    pending_revokes: Vec<u64>,
    rgrps: Vec<RgrpHold>,
    ended: bool,
}

impl Gfs2Fs {
    /// Start a transaction touching at most `blocks` buffers and issuing at
    /// most `revokes` revokes
    pub fn trans_begin(&self, blocks: u32, revokes: u32) -> Result<Transaction<'_>> {
        self.check_withdrawn()?;
        if blocks == 0 && revokes == 0 {
            return Err(Error::Invalid("empty transaction".into()));
        }
        Ok(Transaction {
            fs: self,
            blocks,
            revokes,
            buffers: BTreeMap::new(),
            pending_revokes: Vec::new(),
            rgrps: Vec::new(),
            ended: false,
        })
    }

    /// Check if a block has an outstanding revoke
    pub fn is_revoked(&self, blk: u64) -> bool {
        self.revokes.lock().contains(&blk)
    }
}

impl<'a> Transaction<'a> {
    /// Record a buffer as modified by this transaction
    pub fn add_buffer(&mut self, bh: &BufferRef) -> Result<()> {
        if self.buffers.contains_key(&bh.blkno()) {
            return Ok(());
        }
        if self.buffers.len() as u32 >= self.blocks {
            return Err(self.fs.consist(
                bh.blkno(),
                format!("transaction reserved {} blocks, needs more", self.blocks),
            ));
        }
        self.buffers.insert(bh.blkno(), Arc::clone(bh));
        Ok(())
    }

    /// Revoke a freed metadata block so replay will not resurrect it
    pub fn add_revoke(&mut self, blk: u64) -> Result<()> {
        if self.pending_revokes.contains(&blk) {
            return Ok(());
        }
        if self.pending_revokes.len() as u32 >= self.revokes {
            return Err(self.fs.consist(
                blk,
                format!("transaction reserved {} revokes, needs more", self.revokes),
            ));
        }
        self.pending_revokes.push(blk);
        Ok(())
    }

    /// Forget any revoke for a block that is being reused as metadata
    pub fn cancel_revocation(&mut self, blk: u64) {
        self.pending_revokes.retain(|&b| b != blk);
        self.fs.revokes.lock().remove(&blk);
    }

    /// Keep a resource group's buffers pinned until commit so its clones
    /// can be repolished
    pub fn add_rg(&mut self, hold: &RgrpHold) {
        let addr = hold.rgd().addr();
        if self.rgrps.iter().any(|h| h.rgd().addr() == addr) {
            return;
        }
        self.rgrps.push(hold.dup());
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn has_buffer(&self, blkno: u64) -> bool {
        self.buffers.contains_key(&blkno)
    }

    /// Commit: write every modified buffer, publish the revokes and
    /// repolish the clones of groups that freed blocks
    pub fn end(mut self) -> Result<()> {
        self.commit()
    }

    fn commit(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = true;

        if self.fs.is_withdrawn() {
            self.discard();
            return Err(Error::Withdrawn);
        }

        for bh in self.buffers.values() {
            self.fs.cache.write(bh)?;
        }
        if !self.pending_revokes.is_empty() {
            self.fs.revokes.lock().extend(self.pending_revokes.drain(..));
        }
        for hold in self.rgrps.drain(..) {
            self.fs.rgrp_repolish_clones(hold.rgd());
        }
        debug!(
            "{}: transaction committed {} buffers",
            self.fs.args.fsname,
            self.buffers.len()
        );
        self.buffers.clear();
        Ok(())
    }

    /// Throw away everything this transaction changed: reread its buffers
    /// from the device and reset the in-core state of the groups it touched
    fn discard(&mut self) {
        for bh in self.buffers.values() {
            if let Err(e) = self.fs.cache.reread(bh) {
                error!(
                    "{}: discarding block {}: {}",
                    self.fs.args.fsname,
                    bh.blkno(),
                    e
                );
            }
        }
        for rgd in self.fs.rgrps.all() {
            let freed_in = self.rgrps.iter().any(|h| h.rgd().addr() == rgd.addr());
            let touched = (rgd.addr()..rgd.addr() + rgd.ri.length as u64)
                .any(|blk| self.buffers.contains_key(&blk));
            if freed_in || touched {
                self.fs.rgrp_discard(&rgd);
            }
        }
        warn!(
            "{}: withdrawn, discarded a transaction of {} buffers",
            self.fs.args.fsname,
            self.buffers.len()
        );
        self.pending_revokes.clear();
        self.rgrps.clear();
        self.buffers.clear();
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.commit() {
            error!("{}: transaction commit failed: {}", self.fs.args.fsname, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap;
    use crate::fs::testing::mem_fs;
    use crate::inode::IncoreInode;
    use crate::types::*;

    #[test]
    fn test_buffer_budget_is_enforced() {
        let fs = mem_fs(4096, 1, 100);
        let sb = fs.read_meta(GFS2_SB_ADDR, GFS2_METATYPE_SB).unwrap();
        let root = fs.read_meta(fs.root_addr(), GFS2_METATYPE_DI).unwrap();

        let mut tr = fs.trans_begin(1, 0).unwrap();
        tr.add_buffer(&sb).unwrap();
        // the same buffer twice costs nothing
        tr.add_buffer(&sb).unwrap();
        assert_eq!(tr.buffer_count(), 1);

        let err = tr.add_buffer(&root).unwrap_err();
        assert!(err.is_consistency());
        assert!(!tr.has_buffer(root.blkno()));
        assert!(fs.is_withdrawn());
        assert!(matches!(tr.end(), Err(Error::Withdrawn)));
    }

    #[test]
    fn test_revoke_budget_is_enforced() {
        let fs = mem_fs(4096, 1, 100);
        let mut tr = fs.trans_begin(0, 1).unwrap();
        tr.add_revoke(40).unwrap();
        tr.add_revoke(40).unwrap();
        assert!(tr.add_revoke(41).unwrap_err().is_consistency());
        assert!(fs.is_withdrawn());
    }

    #[test]
    fn test_empty_transaction_rejected() {
        let fs = mem_fs(4096, 1, 100);
        assert!(matches!(fs.trans_begin(0, 0), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_cancel_revocation() {
        let fs = mem_fs(4096, 1, 100);
        let mut tr = fs.trans_begin(0, 2).unwrap();
        tr.add_revoke(20).unwrap();
        tr.add_revoke(21).unwrap();
        tr.cancel_revocation(20);
        tr.end().unwrap();
        assert!(!fs.is_revoked(20));
        assert!(fs.is_revoked(21));

        // a committed revoke is cancelled by a later reuse
        let mut tr = fs.trans_begin(1, 0).unwrap();
        tr.cancel_revocation(21);
        tr.end().unwrap();
        assert!(!fs.is_revoked(21));
    }

    #[test]
    fn test_end_repolishes_clones() {
        let fs = mem_fs(4096, 1, 100);
        let mut ip = IncoreInode::new(fs.root_addr());
        let blk = {
            let mut res = fs.inplace_reserve(&mut ip, 1).unwrap();
            let mut tr = fs.trans_begin(RES_RG_BIT + res.rgd().ri.length, 0).unwrap();
            let blk = fs.alloc_data(&mut ip, &mut res, &mut tr).unwrap();
            tr.end().unwrap();
            blk
        };

        let mut rlist = fs.rlist_new().unwrap();
        rlist.add(blk).unwrap();
        rlist.lock().unwrap();
        let rgd = Arc::clone(&rlist.rgrps()[0]);
        let rel = (blk - rgd.ri.data0) as u32;
        let seg = rgd.segment_of(rel).unwrap();
        let bit = rel - rgd.bits[seg].first_block();

        let mut tr = fs.trans_begin(RES_RG_BIT + rlist.total_length(), 0).unwrap();
        fs.free_data(&ip, blk, 1, &mut tr).unwrap();
        {
            // until commit the clone still shows the block in use
            let st = rgd.state();
            let clone = st.clone[seg].as_ref().unwrap();
            assert_eq!(bitmap::test_bit(clone, bit), GFS2_BLKST_USED);
            assert_eq!(st.free_clone + 1, st.rg.free);
        }
        tr.end().unwrap();

        let st = rgd.state();
        let clone = st.clone[seg].as_ref().unwrap();
        assert_eq!(bitmap::test_bit(clone, bit), GFS2_BLKST_FREE);
        assert_eq!(st.free_clone, st.rg.free);
    }

    #[test]
    fn test_withdrawn_end_writes_nothing() {
        let fs = mem_fs(4096, 1, 100);
        let rgd = fs.rgrpd_get_first().unwrap();
        let free = fs.rgrp_header(&rgd).unwrap().free;
        let mut ip = IncoreInode::new(fs.root_addr());

        let blk = {
            let mut res = fs.inplace_reserve(&mut ip, 1).unwrap();
            let mut tr = fs.trans_begin(RES_RG_BIT + res.rgd().ri.length, 0).unwrap();
            let blk = fs.alloc_data(&mut ip, &mut res, &mut tr).unwrap();
            assert_eq!(rgd.state().rg.free, free - 1);
            let _ = fs.consist(blk, "injected");
            assert!(matches!(tr.end(), Err(Error::Withdrawn)));
            blk
        };

        // the allocation never reached the device
        assert_eq!(fs.get_block_type(blk).unwrap(), GFS2_BLKST_FREE);
        assert_eq!(fs.rgrp_header(&rgd).unwrap().free, free);
        assert_eq!(fs.verify_all().unwrap(), 1);
    }
}
