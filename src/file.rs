//! Journaled-data special files
//!
//! The resource index is stored as journaled data: either stuffed into the
//! dinode block after the dinode fields, or (height 1) spread over JD blocks
//! listed in the dinode's pointer area, each carrying `jbsize` bytes after
//! its metadata header.

use crate::error::{Error, Result};
use crate::fs::Gfs2Fs;
use crate::trans::Transaction;
use crate::types::*;
use byteorder::{BigEndian, ByteOrder};

/// Direct block pointers of a dinode block, up to the first hole
pub fn dinode_ptrs(block: &[u8], geo: &Geometry) -> Vec<u64> {
    (0..geo.diptrs as usize)
        .map(|i| {
            let off = Dinode::SIZE + i * 8;
            BigEndian::read_u64(&block[off..off + 8])
        })
        .take_while(|&p| p != 0)
        .collect()
}

/// Set direct pointer `idx` of a dinode block
pub fn set_dinode_ptr(block: &mut [u8], idx: usize, ptr: u64) {
    let off = Dinode::SIZE + idx * 8;
    BigEndian::write_u64(&mut block[off..off + 8], ptr);
}

impl Gfs2Fs {
    /// Read the resource index dinode
    pub(crate) fn read_rindex_dinode(&self) -> Result<Dinode> {
        let bh = self.read_meta(self.sb.rindex_addr, GFS2_METATYPE_DI)?;
        let di = Dinode::from_bytes(&bh.data())?;
        Ok(di)
    }

    /// Read the resource index dinode and its data blocks from the device,
    /// replacing whatever the cache held
    pub(crate) fn rindex_reread(&self) -> Result<Dinode> {
        let bh = self.reread_meta(self.sb.rindex_addr, GFS2_METATYPE_DI)?;
        let di = Dinode::from_bytes(&bh.data())?;
        if di.height == 1 {
            let ptrs = dinode_ptrs(&bh.data(), &self.geo);
            for ptr in ptrs {
                self.reread_meta(ptr, GFS2_METATYPE_JD)?;
            }
        }
        Ok(di)
    }

    /// Bytes a journaled-data file can hold without new blocks
    pub(crate) fn jdata_capacity(&self, di: &Dinode) -> Result<u64> {
        match di.height {
            0 => Ok((self.geo.bsize as usize - Dinode::SIZE) as u64),
            1 => {
                let bh = self.read_meta(di.addr, GFS2_METATYPE_DI)?;
                let ptrs = dinode_ptrs(&bh.data(), &self.geo);
                Ok(ptrs.len() as u64 * self.geo.jbsize as u64)
            }
            h => Err(Error::Unsupported(format!("journaled data of height {}", h))),
        }
    }

    /// Read up to `buf.len()` bytes at `offset`; returns the bytes copied
    pub(crate) fn jdata_read(&self, di: &Dinode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= di.size {
            return Ok(0);
        }
        let len = buf.len().min((di.size - offset) as usize);

        match di.height {
            0 => {
                let bh = self.read_meta(di.addr, GFS2_METATYPE_DI)?;
                let start = Dinode::SIZE + offset as usize;
                if start + len > self.geo.bsize as usize {
                    return Err(self.consist(di.addr, "stuffed data runs past the dinode block"));
                }
                buf[..len].copy_from_slice(&bh.data()[start..start + len]);
                Ok(len)
            }
            1 => {
                let ptrs = {
                    let bh = self.read_meta(di.addr, GFS2_METATYPE_DI)?;
                    let data = bh.data();
                    dinode_ptrs(&data, &self.geo)
                };
                let jbsize = self.geo.jbsize as u64;
                let mut copied = 0;
                while copied < len {
                    let pos = offset + copied as u64;
                    let lblock = (pos / jbsize) as usize;
                    let in_block = (pos % jbsize) as usize;
                    let ptr = *ptrs.get(lblock).ok_or_else(|| {
                        self.consist(di.addr, format!("hole at logical block {} of journaled file", lblock))
                    })?;
                    let bh = self.read_meta(ptr, GFS2_METATYPE_JD)?;
                    let chunk = (len - copied).min(jbsize as usize - in_block);
                    let src = MetaHeader::SIZE + in_block;
                    buf[copied..copied + chunk].copy_from_slice(&bh.data()[src..src + chunk]);
                    copied += chunk;
                }
                Ok(len)
            }
            h => Err(Error::Unsupported(format!("journaled data of height {}", h))),
        }
    }

    /// Write `data` at `offset` into already-allocated space, growing the
    /// file size as needed. Every touched block joins the transaction.
    pub(crate) fn jdata_write(
        &self,
        di: &mut Dinode,
        offset: u64,
        data: &[u8],
        tr: &mut Transaction<'_>,
    ) -> Result<()> {
        let end = offset + data.len() as u64;
        if end > self.jdata_capacity(di)? {
            return Err(Error::NoSpace);
        }

        let dibh = self.read_meta(di.addr, GFS2_METATYPE_DI)?;
        tr.add_buffer(&dibh)?;
        match di.height {
            0 => {
                let start = Dinode::SIZE + offset as usize;
                dibh.data_mut()[start..start + data.len()].copy_from_slice(data);
            }
            _ => {
                let ptrs = dinode_ptrs(&dibh.data(), &self.geo);
                let jbsize = self.geo.jbsize as u64;
                let mut written = 0;
                while written < data.len() {
                    let pos = offset + written as u64;
                    let ptr = ptrs[(pos / jbsize) as usize];
                    let in_block = (pos % jbsize) as usize;
                    let bh = self.read_meta(ptr, GFS2_METATYPE_JD)?;
                    tr.add_buffer(&bh)?;
                    let chunk = (data.len() - written).min(jbsize as usize - in_block);
                    let dst = MetaHeader::SIZE + in_block;
                    bh.data_mut()[dst..dst + chunk].copy_from_slice(&data[written..written + chunk]);
                    written += chunk;
                }
            }
        }

        if end > di.size {
            di.size = end;
        }
        di.mtime = chrono::Utc::now().timestamp();
        di.ctime = di.mtime;
        di.write_to(&mut dibh.data_mut());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testing::mem_fs;

    #[test]
    fn test_rindex_records_readable() {
        let fs = mem_fs(512, 3, 100);
        let di = fs.read_rindex_dinode().unwrap();
        assert_eq!(di.height, 1);
        assert_eq!(di.size, 3 * RindexEntry::SIZE as u64);

        let mut rec = [0u8; RindexEntry::SIZE];
        for i in 0..3u64 {
            let n = fs.jdata_read(&di, i * 96, &mut rec).unwrap();
            assert_eq!(n, RindexEntry::SIZE);
            let ri = RindexEntry::from_bytes(&rec);
            assert_eq!(ri.length, 1);
        }
        assert_eq!(fs.jdata_read(&di, di.size, &mut rec).unwrap(), 0);
    }

    #[test]
    fn test_record_across_block_boundary() {
        // 512-byte blocks carry 488 bytes, so record 5 spans two JD blocks
        let fs = mem_fs(512, 6, 100);
        let di = fs.read_rindex_dinode().unwrap();
        let mut rec = [0u8; RindexEntry::SIZE];
        fs.jdata_read(&di, 5 * 96, &mut rec).unwrap();
        let ri = RindexEntry::from_bytes(&rec);
        let all = fs.rgrps.all();
        assert_eq!(ri, all[5].ri);
    }

    #[test]
    fn test_write_beyond_capacity() {
        let fs = mem_fs(512, 1, 100);
        let mut di = fs.read_rindex_dinode().unwrap();
        let cap = fs.jdata_capacity(&di).unwrap();
        let mut tr = fs.trans_begin(8, 0).unwrap();
        let err = fs.jdata_write(&mut di, cap - 10, &[0u8; 20], &mut tr).unwrap_err();
        assert!(matches!(err, Error::NoSpace));
    }
}
