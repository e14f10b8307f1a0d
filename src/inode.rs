//! In-core inodes
//!
//! An inode's dinode is cached in core together with the lock generation it
//! was read at. Locking the inode re-reads the dinode whenever that
//! generation has moved on.

use crate::error::{Error, Result};
use crate::fs::Gfs2Fs;
use crate::glock::{self, LockHolder, LockMode, LockName};
use crate::trans::Transaction;
use crate::types::*;
use log::debug;
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Cached state of one inode
#[derive(Debug, Clone)]
pub struct IncoreInode {
    pub addr: u64,
    pub di: Dinode,
    /// Lock generation `di` was read at; zero before the first read
    pub vn: u64,
    /// Resource group that last satisfied a reservation for this inode
    pub last_rg_alloc: u64,
}

impl IncoreInode {
    pub fn new(addr: u64) -> Self {
        IncoreInode {
            addr,
            di: Dinode::default(),
            vn: 0,
            last_rg_alloc: 0,
        }
    }

    pub fn uid(&self) -> u32 {
        self.di.uid
    }

    pub fn gid(&self) -> u32 {
        self.di.gid
    }
}

pub struct Inode {
    addr: u64,
    state: Mutex<IncoreInode>,
}

impl Inode {
    pub fn addr(&self) -> u64 {
        self.addr
    }
}

/// A locked inode; the cached dinode is current while this is held
pub struct InodeLock<'a> {
    st: MutexGuard<'a, IncoreInode>,
    gh: LockHolder,
}

impl InodeLock<'_> {
    pub fn mode(&self) -> LockMode {
        self.gh.mode()
    }
}

impl Deref for InodeLock<'_> {
    type Target = IncoreInode;

    fn deref(&self) -> &IncoreInode {
        &self.st
    }
}

impl DerefMut for InodeLock<'_> {
    fn deref_mut(&mut self) -> &mut IncoreInode {
        &mut self.st
    }
}

impl Gfs2Fs {
    /// Get the in-core inode for a dinode address
    pub fn get_inode(&self, addr: u64) -> Arc<Inode> {
        let mut inodes = self.inodes.lock();
        inodes
            .entry(addr)
            .or_insert_with(|| {
                Arc::new(Inode {
                    addr,
                    state: Mutex::new(IncoreInode::new(addr)),
                })
            })
            .clone()
    }

    /// Lock an inode, refreshing its dinode if another holder changed it
    pub fn inode_lock<'i>(&self, ip: &'i Inode, mode: LockMode) -> Result<InodeLock<'i>> {
        let gh = glock::acquire(&self.lm, LockName::Inode(ip.addr), mode)?;
        let mut st = ip.state.lock();
        let gen = gh.generation();
        if st.vn != gen {
            self.dinode_refresh(&mut st)?;
            self.ea_reread(&st)?;
            st.vn = gen;
        }
        Ok(InodeLock { st, gh })
    }

    /// Re-read the dinode behind an in-core inode from the device
    pub(crate) fn dinode_refresh(&self, ip: &mut IncoreInode) -> Result<()> {
        let bh = self.reread_meta(ip.addr, GFS2_METATYPE_DI)?;
        let di = Dinode::from_bytes(&bh.data())?;
        if di.addr != ip.addr {
            return Err(self.consist(
                ip.addr,
                format!("dinode claims to live at block {}", di.addr),
            ));
        }
        debug!("inode {}: refreshed, {} blocks", ip.addr, di.blocks);
        ip.di = di;
        Ok(())
    }

    /// Write the cached dinode back as part of a transaction
    pub(crate) fn dinode_write(&self, ip: &IncoreInode, tr: &mut Transaction<'_>) -> Result<()> {
        let bh = self.read_meta(ip.addr, GFS2_METATYPE_DI)?;
        tr.add_buffer(&bh)?;
        ip.di.write_to(&mut bh.data_mut());
        Ok(())
    }

    /// Read an inode's dinode
    pub fn stat_inode(&self, addr: u64) -> Result<Dinode> {
        let ip = self.get_inode(addr);
        let lock = self.inode_lock(&ip, LockMode::Shared)?;
        Ok(lock.di.clone())
    }

    pub fn root_addr(&self) -> u64 {
        self.sb.root_addr
    }

    /// Create a new inode, allocating its dinode near the parent's
    pub fn create_inode(&self, parent: u64, mode: u32, uid: u32, gid: u32) -> Result<u64> {
        self.check_withdrawn()?;
        let dip = self.get_inode(parent);
        let mut dlock = self.inode_lock(&dip, LockMode::Exclusive)?;
        if !dlock.di.is_dir() {
            return Err(Error::Invalid(format!("inode {} is not a directory", parent)));
        }

        self.quota.check(uid, gid, 1)?;
        let mut res = self.inplace_reserve(&mut dlock, 1)?;
        let mut tr = self.trans_begin(RES_DINODE + RES_RG_BIT + res.rgd().ri.length, 0)?;

        let blkno = self.alloc_di(&mut dlock, &mut res, &mut tr)?;
        let now = chrono::Utc::now().timestamp();
        let di = Dinode {
            formal_ino: blkno,
            addr: blkno,
            mode,
            uid,
            gid,
            nlink: 1,
            blocks: 1,
            atime: now,
            mtime: now,
            ctime: now,
            goal_meta: blkno,
            goal_data: blkno,
            ..Default::default()
        };
        let bh = self.new_meta(blkno, GFS2_METATYPE_DI);
        di.write_to(&mut bh.data_mut());
        tr.add_buffer(&bh)?;
        self.quota.charge(uid, gid, 1);

        tr.end()?;
        drop(res);
        debug!("{}: created inode {}", self.args.fsname, blkno);
        Ok(blkno)
    }

    /// Deallocate an inode: its attribute fork first, then the dinode
    pub fn remove_inode(&self, addr: u64) -> Result<()> {
        self.check_withdrawn()?;
        if addr == self.sb.root_addr || addr == self.sb.rindex_addr {
            return Err(Error::NotPermitted);
        }

        let ip = self.get_inode(addr);
        {
            let mut lock = self.inode_lock(&ip, LockMode::Exclusive)?;
            if lock.di.eattr != 0 {
                self.ea_dealloc_locked(&mut lock)?;
            }
            if lock.di.blocks != 1 {
                return Err(self.consist(
                    addr,
                    format!("inode still owns {} blocks", lock.di.blocks),
                ));
            }
            self.dinode_dealloc(&mut lock)?;
        }
        self.inodes.lock().remove(&addr);
        Ok(())
    }

    fn dinode_dealloc(&self, ip: &mut IncoreInode) -> Result<()> {
        let mut rlist = self.rlist_new()?;
        rlist.add(ip.addr)?;
        rlist.lock()?;
        let rgd = Arc::clone(&rlist.rgrps()[0]);

        let mut tr = self.trans_begin(RES_RG_BIT + rgd.ri.length, 1)?;
        self.free_di(&rgd, ip, &mut tr)?;
        tr.end()?;
        debug!("{}: removed inode {}", self.args.fsname, ip.addr);
        Ok(())
    }
}
