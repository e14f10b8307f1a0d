//! Filesystem instance context

use crate::config::{ErrorsMode, MkfsOptions, MountArgs};
use crate::device::{BlockDevice, FileDevice};
use crate::error::{Error, Result};
use crate::glock::{self, LocalLockManager, LockManager, LockMode};
use crate::inode::Inode;
use crate::meta_io::{BufferCache, BufferRef};
use crate::quota::{QuotaLedger, QuotaSink};
use crate::rgrp::RgrpDirectory;
use crate::types::*;
use log::{error, info};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Totals kept in core and adjusted by every allocation and free
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StatfsTotals {
    pub total: u64,
    pub free: i64,
    pub dinodes: i64,
}

/// Main filesystem handle
pub struct Gfs2Fs {
    pub(crate) cache: BufferCache,
    pub(crate) lm: Arc<dyn LockManager>,
    pub(crate) quota: Arc<dyn QuotaSink>,
    pub sb: Superblock,
    pub geo: Geometry,
    pub args: MountArgs,
    pub(crate) rgrps: RgrpDirectory,
    /// Blocks freed as metadata whose revokes have been committed
    pub(crate) revokes: Mutex<HashSet<u64>>,
    pub(crate) statfs: Mutex<StatfsTotals>,
    pub(crate) inodes: Mutex<HashMap<u64, Arc<Inode>>>,
    withdrawn: AtomicBool,
}

impl Gfs2Fs {
    /// Mount with an in-process lock manager and quota ledger
    pub fn mount(dev: Arc<dyn BlockDevice>, args: MountArgs) -> Result<Self> {
        Self::mount_with(
            dev,
            Arc::new(LocalLockManager::new()),
            Arc::new(QuotaLedger::new()),
            args,
        )
    }

    /// Mount with caller-supplied lock and quota services
    pub fn mount_with(
        dev: Arc<dyn BlockDevice>,
        lm: Arc<dyn LockManager>,
        quota: Arc<dyn QuotaSink>,
        args: MountArgs,
    ) -> Result<Self> {
        let cache = BufferCache::new(dev);
        let sb_bh = cache.read(GFS2_SB_ADDR)?;
        let hdr = MetaHeader::from_bytes(&sb_bh.data());
        if hdr.magic != GFS2_MAGIC || hdr.mh_type != GFS2_METATYPE_SB {
            return Err(Error::Invalid(format!(
                "not a GFS2 filesystem: magic 0x{:08X}, type {}",
                hdr.magic, hdr.mh_type
            )));
        }
        let sb = Superblock::from_bytes(&sb_bh.data())?;
        if sb.fs_format != GFS2_FORMAT_FS {
            return Err(Error::Invalid(format!(
                "unsupported filesystem format: expected {}, got {}",
                GFS2_FORMAT_FS, sb.fs_format
            )));
        }
        if sb.bsize != cache.block_size() {
            return Err(Error::Invalid(format!(
                "block size {} does not match the device ({})",
                sb.bsize,
                cache.block_size()
            )));
        }

        let fs = Gfs2Fs {
            cache,
            lm,
            quota,
            geo: Geometry::new(sb.bsize),
            sb,
            args,
            rgrps: RgrpDirectory::new(),
            revokes: Mutex::new(HashSet::new()),
            statfs: Mutex::new(StatfsTotals::default()),
            inodes: Mutex::new(HashMap::new()),
            withdrawn: AtomicBool::new(false),
        };
        fs.statfs_init()?;
        info!(
            "{}: mounted, jid {} of {} journals, {} resource groups",
            fs.args.fsname,
            fs.args.jid,
            fs.journals(),
            fs.rgrps.count()
        );
        Ok(fs)
    }

    /// Open an image file
    pub fn open<P: AsRef<Path>>(path: P, args: MountArgs) -> Result<Self> {
        let bsize = FileDevice::probe_block_size(path.as_ref())?;
        if !bsize.is_power_of_two() || !(GFS2_MIN_BSIZE..=GFS2_MAX_BSIZE).contains(&bsize) {
            return Err(Error::Invalid(format!("bad block size {} in superblock", bsize)));
        }
        let dev = FileDevice::open(path, bsize)?;
        Self::mount(Arc::new(dev), args)
    }

    /// Format a device and mount the result
    pub fn format(dev: Arc<dyn BlockDevice>, opts: &MkfsOptions, args: MountArgs) -> Result<Self> {
        crate::mkfs::mkfs(dev.as_ref(), opts)?;
        Self::mount(dev, args)
    }

    /// Number of journals used for load balancing
    pub fn journals(&self) -> u32 {
        self.args.journals.unwrap_or(self.sb.journals).max(1)
    }

    pub fn block_size(&self) -> u32 {
        self.sb.bsize
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        self.cache.device()
    }

    pub fn sync(&self) -> Result<()> {
        self.cache.device().sync()
    }

    /// Report a consistency fault and act on it according to the errors
    /// mode. The returned error is what the caller should propagate.
    pub(crate) fn consist(&self, block: u64, detail: impl Into<String>) -> Error {
        let detail = detail.into();
        error!(
            "{}: fatal: filesystem consistency error at block {}: {}",
            self.args.fsname, block, detail
        );
        match self.args.errors {
            ErrorsMode::Panic => panic!(
                "{}: consistency error at block {}: {}",
                self.args.fsname, block, detail
            ),
            ErrorsMode::Withdraw => {
                if !self.withdrawn.swap(true, Ordering::AcqRel) {
                    error!("{}: withdrawn", self.args.fsname);
                }
            }
        }
        Error::Consistency { block, detail }
    }

    /// Route a consistency error raised by pure code through `consist`
    pub(crate) fn escalate(&self, e: Error) -> Error {
        match e {
            Error::Consistency { block, detail } => self.consist(block, detail),
            other => other,
        }
    }

    pub fn is_withdrawn(&self) -> bool {
        self.withdrawn.load(Ordering::Acquire)
    }

    pub(crate) fn check_withdrawn(&self) -> Result<()> {
        if self.is_withdrawn() {
            return Err(Error::Withdrawn);
        }
        Ok(())
    }

    /// Read a metadata block and check its type
    pub(crate) fn read_meta(&self, blkno: u64, mh_type: u32) -> Result<BufferRef> {
        let bh = self.cache.read(blkno)?;
        self.check_type(&bh, mh_type)?;
        Ok(bh)
    }

    /// Read a metadata block from the device, replacing any cached copy.
    /// Used when the lock covering it was taken at a new generation.
    pub(crate) fn reread_meta(&self, blkno: u64, mh_type: u32) -> Result<BufferRef> {
        let bh = self.cache.read_fresh(blkno)?;
        self.check_type(&bh, mh_type)?;
        Ok(bh)
    }

    pub(crate) fn check_type(&self, bh: &BufferRef, mh_type: u32) -> Result<()> {
        match bh.metatype() {
            Some(t) if t == mh_type => Ok(()),
            found => Err(self.consist(
                bh.blkno(),
                format!("metadata type {:?}, expected {}", found, mh_type),
            )),
        }
    }

    /// Zeroed buffer for a newly allocated metadata block, header stamped
    pub(crate) fn new_meta(&self, blkno: u64, mh_type: u32) -> BufferRef {
        let bh = self.cache.new_buffer(blkno);
        MetaHeader::stamp(&mut bh.data_mut(), mh_type, blkno);
        bh
    }

    /// Seed the statfs totals from every resource group header
    fn statfs_init(&self) -> Result<()> {
        let _ri_gh = self.rindex_hold()?;
        let mut totals = StatfsTotals::default();
        for rgd in self.rgrps.all() {
            let _gh = glock::acquire(&self.lm, rgd.lock_name(), LockMode::Shared)?;
            let _hold = self.rgrp_bh_get(&rgd)?;
            let st = rgd.state();
            totals.total += rgd.ri.data as u64;
            totals.free += st.rg.free as i64;
            totals.dinodes += st.rg.dinodes as i64;
        }
        *self.statfs.lock() = totals;
        Ok(())
    }

    pub(crate) fn statfs_change(&self, total: i64, free: i64, dinodes: i64) {
        let mut st = self.statfs.lock();
        st.total = (st.total as i64 + total) as u64;
        st.free += free;
        st.dinodes += dinodes;
    }

    /// Get filesystem statistics
    pub fn statfs(&self) -> FsStats {
        let st = *self.statfs.lock();
        FsStats {
            block_size: self.sb.bsize,
            total_blocks: st.total,
            free_blocks: st.free.max(0) as u64,
            dinodes: st.dinodes.max(0) as u64,
            rgrps: self.rgrps.count() as u32,
        }
    }
}

/// Filesystem statistics
#[derive(Debug, Clone)]
pub struct FsStats {
    pub block_size: u32,
    /// Data blocks governed by resource groups
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub dinodes: u64,
    pub rgrps: u32,
}

impl FsStats {
    /// Get total size in bytes
    pub fn total_size(&self) -> u64 {
        self.total_blocks * self.block_size as u64
    }

    /// Get free size in bytes
    pub fn free_size(&self) -> u64 {
        self.free_blocks * self.block_size as u64
    }

    /// Get used size in bytes
    pub fn used_size(&self) -> u64 {
        self.total_size() - self.free_size()
    }
}
