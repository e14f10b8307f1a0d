//! Extended attribute engine
//!
//! An inode's attribute fork is either a single attribute block or, once
//! that fills up, an indirection block listing attribute blocks. Values too
//! big to sit inline in their record ("stuffed") are spread over data blocks
//! of `jbsize` bytes each, listed by pointers in the record.
//!
//! Reads take the inode lock shared, updates take it exclusive. Every update
//! runs in transactions sized before the first change.

use crate::alloc::Reservation;
use crate::ea_block::{self, EaRecord};
use crate::error::{Error, Result};
use crate::fs::Gfs2Fs;
use crate::glock::LockMode;
use crate::inode::IncoreInode;
use crate::meta_io::BufferRef;
use crate::trans::Transaction;
use crate::types::*;
use log::debug;
use std::sync::Arc;

/// How a set treats an attribute that already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetFlags {
    /// Create or replace
    #[default]
    Any,
    /// Fail with `Exists` if the attribute is there
    Create,
    /// Fail with `NoData` if the attribute is missing
    Replace,
}

/// An attribute update
#[derive(Debug, Clone)]
pub struct EaRequest<'a> {
    pub ea_type: EaType,
    pub name: &'a [u8],
    pub data: &'a [u8],
    pub flags: SetFlags,
    /// New inode mode, stored in the same transaction as the attribute
    pub mode: Option<u32>,
}

impl<'a> EaRequest<'a> {
    pub fn new(ea_type: EaType, name: &'a [u8], data: &'a [u8]) -> Self {
        EaRequest {
            ea_type,
            name,
            data,
            flags: SetFlags::Any,
            mode: None,
        }
    }

    pub fn with_flags(mut self, flags: SetFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    fn size_stuffed(&self) -> usize {
        ea_size_stuffed(self.name.len(), self.data.len())
    }

    fn data_blocks(&self, jbsize: u32) -> u32 {
        div_ru(self.data.len(), jbsize as usize) as u32
    }
}

fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.len() > GFS2_EA_MAX_NAME_LEN {
        return Err(Error::Invalid(format!(
            "attribute name of {} bytes",
            name.len()
        )));
    }
    Ok(())
}

/// A record found in the fork and the record before it in its block
struct EaLocation {
    bh: BufferRef,
    rec: EaRecord,
    prev: Option<EaRecord>,
}

impl Gfs2Fs {
    /// Does a request fit inline, and how many record bytes does it need
    fn ea_calc_size(&self, req: &EaRequest<'_>) -> (bool, usize) {
        let size = req.size_stuffed();
        if size <= self.geo.jbsize as usize {
            return (true, size);
        }
        (
            false,
            ea_size_unstuffed(req.name.len(), req.data.len(), self.geo.jbsize),
        )
    }

    fn ea_check_size(&self, req: &EaRequest<'_>) -> Result<()> {
        if req.data.len() > GFS2_EA_MAX_DATA_LEN {
            return Err(Error::Range(format!(
                "attribute value of {} bytes",
                req.data.len()
            )));
        }
        let (_, size) = self.ea_calc_size(req);
        // Only possible with small blocks: even the pointer array won't fit
        if size > self.geo.jbsize as usize {
            return Err(Error::Range(format!(
                "attribute record of {} bytes exceeds the {}-byte block payload",
                size, self.geo.jbsize
            )));
        }
        Ok(())
    }

    fn ea_records(&self, bh: &BufferRef) -> Result<Vec<EaRecord>> {
        let data = bh.data();
        ea_block::records(&data, bh.blkno())
            .collect::<Result<Vec<_>>>()
            .map_err(|e| self.escalate(e))
    }

    /// Read the whole attribute fork from the device again: the header or
    /// indirection block, every attribute block and every value block
    pub(crate) fn ea_reread(&self, ip: &IncoreInode) -> Result<()> {
        if ip.di.eattr == 0 {
            return Ok(());
        }
        let blocks = if ip.di.is_ea_indirect() {
            let indbh = self.reread_meta(ip.di.eattr, GFS2_METATYPE_IN)?;
            let ptrs = ea_block::indirect_ptrs(&indbh.data(), self.geo.inptrs);
            ptrs.into_iter()
                .map(|bn| self.reread_meta(bn, GFS2_METATYPE_EA))
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![self.reread_meta(ip.di.eattr, GFS2_METATYPE_EA)?]
        };

        for bh in blocks {
            for rec in self.ea_records(&bh)? {
                if rec.is_unused() {
                    continue;
                }
                let ptrs = rec.data_ptrs(&bh.data());
                for ptr in ptrs.into_iter().filter(|&p| p != 0) {
                    self.reread_meta(ptr, GFS2_METATYPE_ED)?;
                }
            }
        }
        Ok(())
    }

    /// Attribute blocks of the fork, in order
    fn ea_blocks(&self, ip: &IncoreInode) -> Result<Vec<BufferRef>> {
        if !ip.di.is_ea_indirect() {
            return Ok(vec![self.read_meta(ip.di.eattr, GFS2_METATYPE_EA)?]);
        }
        let indbh = self.read_meta(ip.di.eattr, GFS2_METATYPE_IN)?;
        let ptrs = ea_block::indirect_ptrs(&indbh.data(), self.geo.inptrs);
        ptrs.into_iter()
            .map(|bn| self.read_meta(bn, GFS2_METATYPE_EA))
            .collect()
    }

    fn ea_find(&self, ip: &IncoreInode, ea_type: EaType, name: &[u8]) -> Result<Option<EaLocation>> {
        if ip.di.eattr == 0 {
            return Ok(None);
        }
        for bh in self.ea_blocks(ip)? {
            let recs = self.ea_records(&bh)?;
            let data = bh.data();
            let mut prev = None;
            for rec in recs {
                if !rec.is_unused() && rec.matches(&data, ea_type, name) {
                    return Ok(Some(EaLocation {
                        bh: Arc::clone(&bh),
                        rec,
                        prev,
                    }));
                }
                prev = Some(rec);
            }
        }
        Ok(None)
    }

    /// Store the inode's ctime, and the requested mode if any
    fn ea_dinode_update(
        &self,
        ip: &mut IncoreInode,
        mode: Option<u32>,
        tr: &mut Transaction<'_>,
    ) -> Result<()> {
        if let Some(mode) = mode {
            if mode & mode::S_IFMT != ip.di.mode & mode::S_IFMT {
                return Err(self.consist(ip.addr, "attribute update changes the file type"));
            }
            ip.di.mode = mode;
        }
        ip.di.ctime = chrono::Utc::now().timestamp();
        self.dinode_write(ip, tr)
    }

    // Listing and reading

    fn ea_list_locked(&self, ip: &IncoreInode) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        if ip.di.eattr == 0 {
            return Ok(out);
        }
        for bh in self.ea_blocks(ip)? {
            let recs = self.ea_records(&bh)?;
            let data = bh.data();
            for rec in recs.iter().filter(|r| !r.is_unused()) {
                if let Some(t) = EaType::from_raw(rec.hdr.ea_type) {
                    out.extend_from_slice(t.prefix().as_bytes());
                    out.extend_from_slice(rec.name(&data));
                    out.push(0);
                }
            }
        }
        Ok(out)
    }

    /// All attribute names as `namespace.name` strings, each NUL-terminated
    pub fn ea_list(&self, addr: u64) -> Result<Vec<u8>> {
        let ip = self.get_inode(addr);
        let lock = self.inode_lock(&ip, LockMode::Shared)?;
        self.ea_list_locked(&lock)
    }

    /// Copy the name list into `buf`. An empty `buf` only asks for the
    /// size. Returns the list's length.
    pub fn ea_list_into(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let names = self.ea_list(addr)?;
        if buf.is_empty() {
            return Ok(names.len());
        }
        if names.len() > buf.len() {
            return Err(Error::Range(format!(
                "name list needs {} bytes, buffer holds {}",
                names.len(),
                buf.len()
            )));
        }
        buf[..names.len()].copy_from_slice(&names);
        Ok(names.len())
    }

    /// Read a record's value
    fn ea_get_copy(&self, loc: &EaLocation) -> Result<Vec<u8>> {
        if loc.rec.hdr.is_stuffed() {
            let data = loc.bh.data();
            return Ok(loc.rec.stuffed_data(&data).to_vec());
        }

        let jbsize = self.geo.jbsize as usize;
        let amount = loc.rec.hdr.data_len as usize;
        let nptrs = div_ru(amount, jbsize);
        let ptrs = loc.rec.data_ptrs(&loc.bh.data());
        if ptrs.len() < nptrs {
            return Err(self.consist(
                loc.bh.blkno(),
                format!("{} data pointers for {} bytes", ptrs.len(), amount),
            ));
        }

        let bhs = self.cache.read_start(ptrs[..nptrs].iter().copied())?;
        let mut out = Vec::with_capacity(amount);
        for bh in &bhs {
            self.check_type(bh, GFS2_METATYPE_ED)?;
            let chunk = (amount - out.len()).min(jbsize);
            out.extend_from_slice(&bh.data()[MetaHeader::SIZE..MetaHeader::SIZE + chunk]);
        }
        Ok(out)
    }

    /// Read an attribute value
    pub fn ea_get(&self, addr: u64, ea_type: EaType, name: &[u8]) -> Result<Vec<u8>> {
        check_name(name)?;
        let ip = self.get_inode(addr);
        let lock = self.inode_lock(&ip, LockMode::Shared)?;
        let loc = self.ea_find(&lock, ea_type, name)?.ok_or(Error::NoData)?;
        self.ea_get_copy(&loc)
    }

    /// Copy an attribute value into `buf`. An empty `buf` only asks for the
    /// size. Returns the value's length.
    pub fn ea_get_into(&self, addr: u64, ea_type: EaType, name: &[u8], buf: &mut [u8]) -> Result<usize> {
        check_name(name)?;
        let ip = self.get_inode(addr);
        let lock = self.inode_lock(&ip, LockMode::Shared)?;
        let loc = self.ea_find(&lock, ea_type, name)?.ok_or(Error::NoData)?;
        let len = loc.rec.hdr.data_len as usize;
        if buf.is_empty() {
            return Ok(len);
        }
        if len > buf.len() {
            return Err(Error::Range(format!(
                "value is {} bytes, buffer holds {}",
                len,
                buf.len()
            )));
        }
        let value = self.ea_get_copy(&loc)?;
        buf[..len].copy_from_slice(&value);
        Ok(len)
    }

    // Setting

    /// Create, replace or update an attribute
    pub fn ea_set(&self, addr: u64, req: &EaRequest<'_>) -> Result<()> {
        self.check_withdrawn()?;
        check_name(req.name)?;
        self.ea_check_size(req)?;

        let ip = self.get_inode(addr);
        let mut lock = self.inode_lock(&ip, LockMode::Exclusive)?;
        if lock.di.is_immutable() {
            return Err(Error::NotPermitted);
        }
        if let Some(mode) = req.mode {
            if mode & mode::S_IFMT != lock.di.mode & mode::S_IFMT {
                return Err(Error::Invalid(format!("mode {:o} changes the file type", mode)));
            }
        }
        self.ea_set_locked(&mut lock, req)
    }

    fn ea_set_locked(&self, ip: &mut IncoreInode, req: &EaRequest<'_>) -> Result<()> {
        if ip.di.eattr == 0 {
            if req.flags == SetFlags::Replace {
                return Err(Error::NoData);
            }
            return self.ea_init(ip, req);
        }

        match self.ea_find(ip, req.ea_type, req.name)? {
            Some(el) => {
                if ip.di.is_append_only() {
                    return Err(Error::NotPermitted);
                }
                if req.flags == SetFlags::Create {
                    return Err(Error::Exists);
                }
                let unstuffed = !el.rec.hdr.is_stuffed();
                self.ea_set_i(ip, req, Some(&el))?;
                if unstuffed {
                    self.ea_set_remove_unstuffed(ip, &el)?;
                }
                Ok(())
            }
            None => {
                if req.flags == SetFlags::Replace {
                    return Err(Error::NoData);
                }
                self.ea_set_i(ip, req, None)
            }
        }
    }

    /// Reserve `blks` blocks, run `f` in a transaction sized for them, and
    /// write the dinode back
    fn ea_alloc_skeleton<F>(&self, ip: &mut IncoreInode, mode: Option<u32>, blks: u32, f: F) -> Result<()>
    where
        F: FnOnce(&mut IncoreInode, &mut Reservation, &mut Transaction<'_>) -> Result<()>,
    {
        self.quota.check(ip.uid(), ip.gid(), blks as u64)?;
        let mut res = self.inplace_reserve(ip, blks)?;
        let mut tr = self.trans_begin(
            blks + res.rgd().ri.length + RES_DINODE + RES_STATFS + RES_QUOTA,
            0,
        )?;
        f(ip, &mut res, &mut tr)?;
        self.ea_dinode_update(ip, mode, &mut tr)?;
        tr.end()
    }

    /// Allocate an attribute block holding one unused record
    fn ea_alloc_blk(
        &self,
        ip: &mut IncoreInode,
        res: &mut Reservation,
        tr: &mut Transaction<'_>,
    ) -> Result<BufferRef> {
        let block = self.alloc_meta(ip, res, tr)?;
        let bh = self.new_meta(block, GFS2_METATYPE_EA);
        tr.add_buffer(&bh)?;
        ea_block::init_block(&mut bh.data_mut());
        ip.di.blocks += 1;
        Ok(bh)
    }

    /// Fill the record at `off` from `req`, allocating data blocks for an
    /// unstuffed value. Record length and last flag are not touched.
    fn ea_write(
        &self,
        ip: &mut IncoreInode,
        bh: &BufferRef,
        off: usize,
        req: &EaRequest<'_>,
        res: Option<&mut Reservation>,
        tr: &mut Transaction<'_>,
    ) -> Result<()> {
        let (stuffed, _) = self.ea_calc_size(req);
        if stuffed {
            ea_block::write_stuffed(&mut bh.data_mut(), off, req.ea_type, req.name, req.data);
            return Ok(());
        }

        let res = res.ok_or_else(|| {
            self.consist(bh.blkno(), "unstuffed attribute written without a reservation")
        })?;
        let jbsize = self.geo.jbsize as usize;
        let mut ptrs = Vec::with_capacity(req.data_blocks(self.geo.jbsize) as usize);
        for chunk in req.data.chunks(jbsize) {
            let block = self.alloc_meta(ip, res, tr)?;
            let dbh = self.new_meta(block, GFS2_METATYPE_ED);
            tr.add_buffer(&dbh)?;
            dbh.data_mut()[MetaHeader::SIZE..MetaHeader::SIZE + chunk.len()].copy_from_slice(chunk);
            ip.di.blocks += 1;
            ptrs.push(block);
        }
        ea_block::write_unstuffed(
            &mut bh.data_mut(),
            off,
            req.ea_type,
            req.name,
            req.data.len(),
            &ptrs,
        );
        Ok(())
    }

    /// Start a fork with its first attribute block
    fn ea_init(&self, ip: &mut IncoreInode, req: &EaRequest<'_>) -> Result<()> {
        let (stuffed, _) = self.ea_calc_size(req);
        let mut blks = 1;
        if !stuffed {
            blks += req.data_blocks(self.geo.jbsize);
        }
        self.ea_alloc_skeleton(ip, req.mode, blks, |ip, res, tr| {
            let bh = self.ea_alloc_blk(ip, res, tr)?;
            ip.di.eattr = bh.blkno();
            self.ea_write(ip, &bh, MetaHeader::SIZE, req, Some(res), tr)?;
            debug!("inode {}: attribute fork started at {}", ip.addr, bh.blkno());
            Ok(())
        })
    }

    /// Drop the record being replaced. A stuffed one with a predecessor is
    /// merged into it; otherwise it is only marked unused, and an unstuffed
    /// one keeps its pointers for `ea_set_remove_unstuffed`.
    fn ea_set_remove_stuffed(&self, el: &EaLocation, tr: &mut Transaction<'_>) -> Result<()> {
        tr.add_buffer(&el.bh)?;
        let mut data = el.bh.data_mut();
        // A split may have put the new record between the two
        let (rec, prev) =
            ea_block::locate(&data, el.bh.blkno(), el.rec.off).map_err(|e| self.escalate(e))?;
        match prev {
            Some(prev) if el.prev.is_some() && rec.hdr.is_stuffed() => {
                ea_block::merge_into_prev(&mut data, prev.off, rec.off)
            }
            _ => ea_block::mark_unused(&mut data, rec.off, false),
        }
        Ok(())
    }

    /// Find room in an existing block; failing that, add a block to the fork
    fn ea_set_i(&self, ip: &mut IncoreInode, req: &EaRequest<'_>, el: Option<&EaLocation>) -> Result<()> {
        let (stuffed, size) = self.ea_calc_size(req);

        for bh in self.ea_blocks(ip)? {
            let recs = self.ea_records(&bh)?;
            for (i, rec) in recs.iter().enumerate() {
                let split = if rec.is_unused() {
                    if (rec.hdr.rec_len as usize) < size {
                        continue;
                    }
                    if !rec.hdr.is_stuffed() {
                        let prev = i.checked_sub(1).map(|j| recs[j]);
                        self.ea_remove_unstuffed(ip, &bh, *rec, prev, true)?;
                    }
                    false
                } else if rec.slack() >= size {
                    true
                } else {
                    continue;
                };

                if stuffed {
                    self.ea_set_simple_noalloc(ip, &bh, rec.off, split, req, el)?;
                } else {
                    let blks = 2 + req.data_blocks(self.geo.jbsize);
                    self.ea_alloc_skeleton(ip, req.mode, blks, |ip, res, tr| {
                        tr.add_buffer(&bh)?;
                        let off = if split {
                            ea_block::split(&mut bh.data_mut(), rec.off)
                        } else {
                            rec.off
                        };
                        self.ea_write(ip, &bh, off, req, Some(res), tr)?;
                        if let Some(el) = el {
                            self.ea_set_remove_stuffed(el, tr)?;
                        }
                        Ok(())
                    })?;
                }
                return Ok(());
            }
        }

        let mut blks = 2;
        if !ip.di.is_ea_indirect() {
            blks += 1;
        }
        if !stuffed {
            blks += req.data_blocks(self.geo.jbsize);
        }
        self.ea_alloc_skeleton(ip, req.mode, blks, |ip, res, tr| {
            self.ea_set_block(ip, req, el, res, tr)
        })
    }

    fn ea_set_simple_noalloc(
        &self,
        ip: &mut IncoreInode,
        bh: &BufferRef,
        off: usize,
        split: bool,
        req: &EaRequest<'_>,
        el: Option<&EaLocation>,
    ) -> Result<()> {
        let mut tr = self.trans_begin(RES_DINODE + 2 * RES_EATTR, 0)?;
        tr.add_buffer(bh)?;
        let off = if split {
            ea_block::split(&mut bh.data_mut(), off)
        } else {
            off
        };
        self.ea_write(ip, bh, off, req, None, &mut tr)?;
        if let Some(el) = el {
            self.ea_set_remove_stuffed(el, &mut tr)?;
        }
        self.ea_dinode_update(ip, req.mode, &mut tr)?;
        tr.end()
    }

    /// Put the attribute in a new block, turning the fork indirect first
    /// if it is still a single block
    fn ea_set_block(
        &self,
        ip: &mut IncoreInode,
        req: &EaRequest<'_>,
        el: Option<&EaLocation>,
        res: &mut Reservation,
        tr: &mut Transaction<'_>,
    ) -> Result<()> {
        let (indbh, slot) = if ip.di.is_ea_indirect() {
            let indbh = self.read_meta(ip.di.eattr, GFS2_METATYPE_IN)?;
            let used = ea_block::indirect_ptrs(&indbh.data(), self.geo.inptrs).len();
            if used >= self.geo.inptrs as usize {
                return Err(Error::NoSpace);
            }
            tr.add_buffer(&indbh)?;
            (indbh, used)
        } else {
            let blk = self.alloc_meta(ip, res, tr)?;
            let indbh = self.new_meta(blk, GFS2_METATYPE_IN);
            tr.add_buffer(&indbh)?;
            ea_block::set_indirect_ptr(&mut indbh.data_mut(), 0, ip.di.eattr);
            ip.di.eattr = blk;
            ip.di.flags |= GFS2_DIF_EA_INDIRECT;
            ip.di.blocks += 1;
            debug!("inode {}: attribute fork now indirect via {}", ip.addr, blk);
            (indbh, 1)
        };

        let newbh = self.ea_alloc_blk(ip, res, tr)?;
        ea_block::set_indirect_ptr(&mut indbh.data_mut(), slot, newbh.blkno());
        self.ea_write(ip, &newbh, MetaHeader::SIZE, req, Some(res), tr)?;
        if let Some(el) = el {
            self.ea_set_remove_stuffed(el, tr)?;
        }
        Ok(())
    }

    /// Free the data blocks of a replaced unstuffed record
    fn ea_set_remove_unstuffed(&self, ip: &mut IncoreInode, el: &EaLocation) -> Result<()> {
        let (rec, prev) = {
            let data = el.bh.data();
            ea_block::locate(&data, el.bh.blkno(), el.rec.off).map_err(|e| self.escalate(e))?
        };
        let prev = prev.filter(|_| el.prev.is_some());
        self.ea_remove_unstuffed(ip, &el.bh, rec, prev, false)
    }

    // Removal

    /// Remove an attribute
    pub fn ea_remove(&self, addr: u64, ea_type: EaType, name: &[u8]) -> Result<()> {
        self.check_withdrawn()?;
        check_name(name)?;

        let ip = self.get_inode(addr);
        let mut lock = self.inode_lock(&ip, LockMode::Exclusive)?;
        if lock.di.is_immutable() || lock.di.is_append_only() {
            return Err(Error::NotPermitted);
        }
        let el = self.ea_find(&lock, ea_type, name)?.ok_or(Error::NoData)?;
        if el.rec.hdr.is_stuffed() {
            self.ea_remove_stuffed(&mut lock, &el)
        } else {
            self.ea_remove_unstuffed(&mut lock, &el.bh, el.rec, el.prev, false)
        }
    }

    fn ea_remove_stuffed(&self, ip: &mut IncoreInode, el: &EaLocation) -> Result<()> {
        let mut tr = self.trans_begin(RES_DINODE + RES_EATTR, 0)?;
        tr.add_buffer(&el.bh)?;
        {
            let mut data = el.bh.data_mut();
            match el.prev {
                Some(prev) => ea_block::merge_into_prev(&mut data, prev.off, el.rec.off),
                None => ea_block::mark_unused(&mut data, el.rec.off, false),
            }
        }
        self.ea_dinode_update(ip, None, &mut tr)?;
        tr.end()
    }

    /// Free every data block of the unstuffed record `rec`, then merge it
    /// into `prev`, or with `leave` set (or no predecessor) keep it as an
    /// unused record
    fn ea_remove_unstuffed(
        &self,
        ip: &mut IncoreInode,
        bh: &BufferRef,
        rec: EaRecord,
        prev: Option<EaRecord>,
        leave: bool,
    ) -> Result<()> {
        let (rec, ptrs) = {
            let data = bh.data();
            let rec = EaRecord {
                off: rec.off,
                hdr: EaHeader::read_at(&data, rec.off),
            };
            (rec, rec.data_ptrs(&data))
        };
        let live: Vec<u64> = ptrs.iter().copied().take_while(|&p| p != 0).collect();
        if live.is_empty() {
            return Ok(());
        }

        // Value blocks usually come from one group; lock whichever they use
        let mut rlist = self.rlist_new()?;
        for &bn in &live {
            rlist.add(bn)?;
        }
        rlist.lock()?;

        let mut tr = self.trans_begin(
            rlist.total_length() + RES_DINODE + RES_EATTR + RES_STATFS + RES_QUOTA,
            live.len() as u32,
        )?;
        tr.add_buffer(bh)?;
        self.free_runs(ip, &live, &mut tr)?;
        {
            let mut data = bh.data_mut();
            for idx in 0..live.len() {
                ea_block::clear_ptr(&mut data, &rec, idx);
            }
            match prev {
                Some(prev) if !leave => ea_block::merge_into_prev(&mut data, prev.off, rec.off),
                _ => ea_block::mark_unused(&mut data, rec.off, true),
            }
        }
        self.ea_dinode_update(ip, None, &mut tr)?;
        tr.end()
    }

    /// Free `blocks` as metadata, coalescing contiguous runs, and take them
    /// off the inode's block count
    fn free_runs(&self, ip: &mut IncoreInode, blocks: &[u64], tr: &mut Transaction<'_>) -> Result<()> {
        let mut run: Option<(u64, u32)> = None;
        for &bn in blocks {
            run = match run {
                Some((start, len)) if start + len as u64 == bn => Some((start, len + 1)),
                Some((start, len)) => {
                    self.free_meta(ip, start, len, tr)?;
                    Some((bn, 1))
                }
                None => Some((bn, 1)),
            };
            if ip.di.blocks == 0 {
                return Err(self.consist(ip.addr, "inode block count underflow"));
            }
            ip.di.blocks -= 1;
        }
        if let Some((start, len)) = run {
            self.free_meta(ip, start, len, tr)?;
        }
        Ok(())
    }

    // Deallocation

    /// Free the whole attribute fork of an inode
    pub fn ea_dealloc(&self, addr: u64) -> Result<()> {
        self.check_withdrawn()?;
        let ip = self.get_inode(addr);
        let mut lock = self.inode_lock(&ip, LockMode::Exclusive)?;
        if lock.di.eattr == 0 {
            return Ok(());
        }
        self.ea_dealloc_locked(&mut lock)
    }

    /// Free value blocks, then the indirection block's attribute blocks,
    /// then the top block, each step in its own transaction
    pub(crate) fn ea_dealloc_locked(&self, ip: &mut IncoreInode) -> Result<()> {
        let _ri_gh = self.rindex_hold()?;

        for bh in self.ea_blocks(ip)? {
            for rec in self.ea_records(&bh)? {
                if !rec.hdr.is_stuffed() {
                    self.ea_remove_unstuffed(ip, &bh, rec, None, true)?;
                }
            }
        }
        if ip.di.is_ea_indirect() {
            self.ea_dealloc_indirect(ip)?;
        }
        self.ea_dealloc_block(ip)?;
        debug!("inode {}: attribute fork freed", ip.addr);
        Ok(())
    }

    fn ea_dealloc_indirect(&self, ip: &mut IncoreInode) -> Result<()> {
        let indbh = self.read_meta(ip.di.eattr, GFS2_METATYPE_IN)?;
        let ptrs = ea_block::indirect_ptrs(&indbh.data(), self.geo.inptrs);
        if ptrs.is_empty() {
            return Ok(());
        }

        let mut rlist = self.rlist_new()?;
        for &bn in &ptrs {
            rlist.add(bn)?;
        }
        rlist.lock()?;

        let mut tr = self.trans_begin(
            rlist.total_length() + RES_DINODE + RES_INDIRECT + RES_STATFS + RES_QUOTA,
            ptrs.len() as u32,
        )?;
        tr.add_buffer(&indbh)?;
        self.free_runs(ip, &ptrs, &mut tr)?;
        {
            let mut data = indbh.data_mut();
            for idx in 0..ptrs.len() {
                ea_block::set_indirect_ptr(&mut data, idx, 0);
            }
        }
        ip.di.flags &= !GFS2_DIF_EA_INDIRECT;
        self.dinode_write(ip, &mut tr)?;
        tr.end()
    }

    fn ea_dealloc_block(&self, ip: &mut IncoreInode) -> Result<()> {
        let eattr = ip.di.eattr;
        let mut rlist = self.rlist_new()?;
        rlist.add(eattr)?;
        rlist.lock()?;

        let mut tr = self.trans_begin(RES_RG_BIT + RES_DINODE + RES_STATFS + RES_QUOTA, 1)?;
        self.free_runs(ip, &[eattr], &mut tr)?;
        ip.di.eattr = 0;
        self.dinode_write(ip, &mut tr)?;
        tr.end()
    }

    // Maintenance

    /// Compact an attribute fork. Not implemented on this filesystem.
    pub fn ea_repack(&self, addr: u64) -> Result<()> {
        let ip = self.get_inode(addr);
        let _lock = self.inode_lock(&ip, LockMode::Exclusive)?;
        Err(Error::Unsupported("attribute repack".into()))
    }

    /// Every block of the attribute fork, top block first, with its raw
    /// contents
    pub fn ea_dump_blocks(&self, addr: u64) -> Result<Vec<(u64, Vec<u8>)>> {
        let ip = self.get_inode(addr);
        let lock = self.inode_lock(&ip, LockMode::Shared)?;
        if lock.di.eattr == 0 {
            return Ok(Vec::new());
        }

        let top_type = if lock.di.is_ea_indirect() {
            GFS2_METATYPE_IN
        } else {
            GFS2_METATYPE_EA
        };
        let top = self.read_meta(lock.di.eattr, top_type)?;
        let mut out = vec![(top.blkno(), top.data().to_vec())];
        if lock.di.is_ea_indirect() {
            let ptrs = ea_block::indirect_ptrs(&top.data(), self.geo.inptrs);
            for bn in ptrs {
                let bh = self.read_meta(bn, GFS2_METATYPE_EA)?;
                out.push((bn, bh.data().to_vec()));
            }
        }
        Ok(out)
    }

    /// Overwrite an attribute's value with one of the same length, in
    /// place, optionally changing the inode mode in the same transaction
    pub fn ea_rewrite(
        &self,
        addr: u64,
        ea_type: EaType,
        name: &[u8],
        value: &[u8],
        mode: Option<u32>,
    ) -> Result<()> {
        self.check_withdrawn()?;
        check_name(name)?;

        let ip = self.get_inode(addr);
        let mut lock = self.inode_lock(&ip, LockMode::Exclusive)?;
        if let Some(mode) = mode {
            if mode & mode::S_IFMT != lock.di.mode & mode::S_IFMT {
                return Err(Error::Invalid(format!("mode {:o} changes the file type", mode)));
            }
        }
        let el = self.ea_find(&lock, ea_type, name)?.ok_or(Error::NoData)?;
        if el.rec.hdr.data_len as usize != value.len() {
            return Err(Error::Invalid(format!(
                "rewrite of a {}-byte value with {} bytes",
                el.rec.hdr.data_len,
                value.len()
            )));
        }

        let mut tr = if el.rec.hdr.is_stuffed() {
            let mut tr = self.trans_begin(RES_DINODE + RES_EATTR, 0)?;
            tr.add_buffer(&el.bh)?;
            let start = el.rec.off + el.rec.hdr.data_offset();
            el.bh.data_mut()[start..start + value.len()].copy_from_slice(value);
            tr
        } else {
            let jbsize = self.geo.jbsize as usize;
            let nptrs = div_ru(value.len(), jbsize);
            let ptrs = el.rec.data_ptrs(&el.bh.data());
            let mut tr = self.trans_begin(nptrs as u32 + RES_DINODE, 0)?;
            for (&bn, chunk) in ptrs.iter().zip(value.chunks(jbsize)) {
                let bh = self.read_meta(bn, GFS2_METATYPE_ED)?;
                tr.add_buffer(&bh)?;
                bh.data_mut()[MetaHeader::SIZE..MetaHeader::SIZE + chunk.len()].copy_from_slice(chunk);
            }
            tr
        };
        self.ea_dinode_update(&mut lock, mode, &mut tr)?;
        tr.end()
    }
}
