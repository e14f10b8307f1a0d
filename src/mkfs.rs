//! Formatting and growing filesystem images
//!
//! Layout: the superblock in block 0, the resource index dinode in block 1,
//! the index's preallocated journaled-data blocks after it, then resource
//! groups back to back to the end of the device. The root dinode is the
//! first data block of the first group.

use crate::bitmap;
use crate::config::MkfsOptions;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::file::set_dinode_ptr;
use crate::fs::Gfs2Fs;
use crate::glock::{self, LockMode, LockName};
use crate::types::*;
use log::{info, warn};

const RINDEX_ADDR: u64 = 1;

/// Journaled-data blocks needed to hold the resource index at capacity
pub fn rindex_blocks(opts: &MkfsOptions) -> u32 {
    let geo = Geometry::new(opts.block_size);
    div_ru(opts.max_rgrps as usize * RindexEntry::SIZE, geo.jbsize as usize) as u32
}

/// First block after the resource index
fn first_rgrp_addr(opts: &MkfsOptions) -> u64 {
    RINDEX_ADDR + 1 + rindex_blocks(opts) as u64
}

/// Device size that fits exactly `rgrps` full-sized resource groups
pub fn layout_blocks(opts: &MkfsOptions, rgrps: u64) -> u64 {
    let per_rgrp = opts
        .rgrp_layout(opts.rgrp_blocks)
        .map(|(length, data)| (length + data) as u64)
        .unwrap_or(opts.rgrp_blocks as u64);
    first_rgrp_addr(opts) + rgrps * per_rgrp
}

/// Carve `[start, end)` into resource groups of at most `rgrp_blocks`
fn plan_rgrps(opts: &MkfsOptions, start: u64, end: u64, limit: usize) -> Vec<RindexEntry> {
    let mut groups = Vec::new();
    let mut addr = start;
    while addr < end && groups.len() < limit {
        let size = (end - addr).min(opts.rgrp_blocks as u64) as u32;
        let Some((length, data)) = opts.rgrp_layout(size) else {
            break;
        };
        groups.push(RindexEntry {
            addr,
            length,
            data0: addr + length as u64,
            data,
            bitbytes: data / GFS2_NBBY,
        });
        addr += (length + data) as u64;
    }
    groups
}

/// Header and bitmap blocks of an empty resource group
fn rgrp_blocks_image(ri: &RindexEntry, geo: &Geometry) -> Result<Vec<Vec<u8>>> {
    let bits = bitmap::compute_bitstructs(ri, geo)?;
    let mut blocks = Vec::with_capacity(ri.length as usize);
    for x in 0..ri.length as u64 {
        let mut block = vec![0u8; geo.bsize as usize];
        if x == 0 {
            MetaHeader::stamp(&mut block, GFS2_METATYPE_RG, ri.addr);
            RgrpHeader {
                free: ri.data,
                ..Default::default()
            }
            .write_to(&mut block);
        } else {
            MetaHeader::stamp(&mut block, GFS2_METATYPE_RB, ri.addr + x);
        }
        blocks.push(block);
    }
    debug_assert_eq!(bits.len(), blocks.len());
    Ok(blocks)
}

/// Format a device
pub fn mkfs(dev: &dyn BlockDevice, opts: &MkfsOptions) -> Result<Superblock> {
    opts.validate()?;
    if dev.block_size() != opts.block_size {
        return Err(Error::Invalid(format!(
            "device block size {} does not match {}",
            dev.block_size(),
            opts.block_size
        )));
    }

    let geo = Geometry::new(opts.block_size);
    let ri_blocks = rindex_blocks(opts);
    if ri_blocks > geo.diptrs {
        return Err(Error::Invalid(format!(
            "a resource index of {} groups does not fit {}-byte blocks",
            opts.max_rgrps, opts.block_size
        )));
    }

    let groups = plan_rgrps(
        opts,
        first_rgrp_addr(opts),
        dev.num_blocks(),
        opts.max_rgrps as usize,
    );
    let Some(first) = groups.first().copied() else {
        return Err(Error::Invalid(format!(
            "device of {} blocks is too small",
            dev.num_blocks()
        )));
    };
    let last = groups[groups.len() - 1];
    let used_end = last.data0 + last.data as u64;
    if used_end < dev.num_blocks() && groups.len() == opts.max_rgrps as usize {
        warn!(
            "resource index full: {} blocks at the end of the device are unused",
            dev.num_blocks() - used_end
        );
    }

    // Resource groups, the first one carrying the root dinode
    let root_addr = first.data0;
    for ri in &groups {
        let mut blocks = rgrp_blocks_image(ri, &geo)?;
        if ri.addr == first.addr {
            let bits = bitmap::compute_bitstructs(ri, &geo)?;
            let range = bits[0].range();
            bitmap::set_bit(&mut blocks[0][range], 0, GFS2_BLKST_DINODE);
            RgrpHeader {
                free: ri.data - 1,
                dinodes: 1,
                ..Default::default()
            }
            .write_to(&mut blocks[0]);
        }
        for (x, block) in blocks.iter().enumerate() {
            dev.write_block(ri.addr + x as u64, block)?;
        }
    }

    let now = chrono::Utc::now().timestamp();

    // Root directory
    let mut block = vec![0u8; geo.bsize as usize];
    MetaHeader::stamp(&mut block, GFS2_METATYPE_DI, root_addr);
    Dinode {
        formal_ino: root_addr,
        addr: root_addr,
        mode: mode::S_IFDIR | 0o755,
        nlink: 2,
        blocks: 1,
        atime: now,
        mtime: now,
        ctime: now,
        goal_meta: root_addr,
        goal_data: root_addr,
        ..Default::default()
    }
    .write_to(&mut block);
    dev.write_block(root_addr, &block)?;

    // Resource index: dinode plus its journaled-data blocks
    let mut records = Vec::with_capacity(groups.len() * RindexEntry::SIZE);
    for ri in &groups {
        records.extend_from_slice(&ri.to_bytes());
    }
    let mut dinode_block = vec![0u8; geo.bsize as usize];
    MetaHeader::stamp(&mut dinode_block, GFS2_METATYPE_DI, RINDEX_ADDR);
    let jbsize = geo.jbsize as usize;
    for i in 0..ri_blocks as usize {
        let blkno = RINDEX_ADDR + 1 + i as u64;
        let mut jd = vec![0u8; geo.bsize as usize];
        MetaHeader::stamp(&mut jd, GFS2_METATYPE_JD, blkno);
        let start = (i * jbsize).min(records.len());
        let end = ((i + 1) * jbsize).min(records.len());
        jd[MetaHeader::SIZE..MetaHeader::SIZE + (end - start)].copy_from_slice(&records[start..end]);
        dev.write_block(blkno, &jd)?;
        set_dinode_ptr(&mut dinode_block, i, blkno);
    }
    Dinode {
        formal_ino: RINDEX_ADDR,
        addr: RINDEX_ADDR,
        mode: mode::S_IFREG | 0o600,
        nlink: 1,
        size: records.len() as u64,
        blocks: 1 + ri_blocks as u64,
        atime: now,
        mtime: now,
        ctime: now,
        flags: GFS2_DIF_SYSTEM | GFS2_DIF_JDATA,
        height: 1,
        ..Default::default()
    }
    .write_to(&mut dinode_block);
    dev.write_block(RINDEX_ADDR, &dinode_block)?;

    let sb = Superblock {
        fs_format: GFS2_FORMAT_FS,
        bsize: geo.bsize,
        bsize_shift: geo.bsize_shift,
        journals: opts.journals,
        rindex_addr: RINDEX_ADDR,
        root_addr,
        locktable: opts.locktable.clone(),
    };
    let mut block = vec![0u8; geo.bsize as usize];
    sb.write_to(&mut block);
    dev.write_block(GFS2_SB_ADDR, &block)?;
    dev.sync()?;

    info!(
        "formatted {} blocks: {} resource groups, root dinode at {}",
        dev.num_blocks(),
        groups.len(),
        root_addr
    );
    Ok(sb)
}

impl Gfs2Fs {
    /// Grow the filesystem to `new_blocks`, appending resource groups.
    /// Returns the number of groups added.
    pub fn grow(&self, new_blocks: u64) -> Result<u32> {
        self.check_withdrawn()?;
        let _gh = glock::acquire(&self.lm, LockName::Rindex, LockMode::Exclusive)?;

        let mut rindex = self.rindex_reread()?;
        let count = rindex.size / RindexEntry::SIZE as u64;
        if count == 0 {
            return Err(self.consist(rindex.addr, "empty resource index"));
        }
        let mut rec = [0u8; RindexEntry::SIZE];
        self.jdata_read(&rindex, (count - 1) * RindexEntry::SIZE as u64, &mut rec)?;
        let last = RindexEntry::from_bytes(&rec);
        let end = last.data0 + last.data as u64;
        if new_blocks <= end {
            return Err(Error::Invalid(format!(
                "filesystem already ends at block {}",
                end
            )));
        }

        let opts = MkfsOptions {
            block_size: self.sb.bsize,
            rgrp_blocks: last.length + last.data,
            ..Default::default()
        };
        let capacity = self.jdata_capacity(&rindex)? / RindexEntry::SIZE as u64;
        let room = capacity.saturating_sub(count) as usize;
        let groups = plan_rgrps(&opts, end, new_blocks, room);
        if groups.is_empty() {
            return Err(if room == 0 {
                Error::NoSpace
            } else {
                Error::Invalid(format!("no room for a resource group below block {}", new_blocks))
            });
        }

        self.device().resize(new_blocks)?;
        let mut added_data = 0u64;
        for ri in &groups {
            for (x, block) in rgrp_blocks_image(ri, &self.geo)?.into_iter().enumerate() {
                let bh = self.cache.new_buffer(ri.addr + x as u64);
                bh.data_mut().copy_from_slice(&block);
                self.cache.write(&bh)?;
            }
            added_data += ri.data as u64;
        }

        let mut records = Vec::with_capacity(groups.len() * RindexEntry::SIZE);
        for ri in &groups {
            records.extend_from_slice(&ri.to_bytes());
        }
        let touched = div_ru(records.len(), self.geo.jbsize as usize) as u32 + 1;
        let mut tr = self.trans_begin(RES_DINODE + touched, 0)?;
        self.jdata_write(&mut rindex, count * RindexEntry::SIZE as u64, &records, &mut tr)?;
        tr.end()?;

        self.statfs_change(added_data as i64, added_data as i64, 0);
        info!(
            "{}: grew by {} resource groups to {} blocks",
            self.args.fsname,
            groups.len(),
            new_blocks
        );
        Ok(groups.len() as u32)
    }
}
