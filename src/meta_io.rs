//! Metadata buffer cache
//!
//! Buffers are shared through `Arc`; dropping the last clone releases the
//! hold. Dirty buffers are tracked by the transaction that touched them, not
//! by the cache.

use crate::device::BlockDevice;
use crate::error::Result;
use crate::types::MetaHeader;
use log::trace;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One cached block
pub struct Buffer {
    blkno: u64,
    data: RwLock<Vec<u8>>,
    uptodate: AtomicBool,
}

pub type BufferRef = Arc<Buffer>;

impl Buffer {
    fn new(blkno: u64, bsize: u32) -> Self {
        Buffer {
            blkno,
            data: RwLock::new(vec![0u8; bsize as usize]),
            uptodate: AtomicBool::new(false),
        }
    }

    pub fn blkno(&self) -> u64 {
        self.blkno
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    /// Metadata type recorded in the block header, or `None` without a
    /// valid magic number
    pub fn metatype(&self) -> Option<u32> {
        let hdr = MetaHeader::from_bytes(&self.data());
        (hdr.magic == crate::types::GFS2_MAGIC).then_some(hdr.mh_type)
    }

    pub fn is_uptodate(&self) -> bool {
        self.uptodate.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("blkno", &self.blkno)
            .field("uptodate", &self.is_uptodate())
            .finish()
    }
}

/// Block cache in front of a device
pub struct BufferCache {
    dev: Arc<dyn BlockDevice>,
    bsize: u32,
    map: Mutex<HashMap<u64, BufferRef>>,
}

impl BufferCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let bsize = dev.block_size();
        BufferCache {
            dev,
            bsize,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    pub fn block_size(&self) -> u32 {
        self.bsize
    }

    fn get(&self, blkno: u64) -> BufferRef {
        let mut map = self.map.lock();
        map.entry(blkno)
            .or_insert_with(|| Arc::new(Buffer::new(blkno, self.bsize)))
            .clone()
    }

    /// Get a buffer, reading it from the device if it is not cached
    pub fn read(&self, blkno: u64) -> Result<BufferRef> {
        let bh = self.get(blkno);
        if !bh.is_uptodate() {
            self.reread(&bh)?;
        }
        Ok(bh)
    }

    /// Get a batch of buffers; the ones not yet cached are read in one pass
    pub fn read_start(&self, blocks: impl IntoIterator<Item = u64>) -> Result<Vec<BufferRef>> {
        let bhs: Vec<BufferRef> = blocks.into_iter().map(|b| self.get(b)).collect();
        for bh in bhs.iter().filter(|bh| !bh.is_uptodate()) {
            self.reread(bh)?;
        }
        Ok(bhs)
    }

    /// Get a buffer with its contents read from the device, cached or not
    pub fn read_fresh(&self, blkno: u64) -> Result<BufferRef> {
        let bh = self.get(blkno);
        self.reread(&bh)?;
        Ok(bh)
    }

    /// Discard the cached contents and read the block again
    pub fn reread(&self, bh: &Buffer) -> Result<()> {
        let mut data = bh.data_mut();
        self.dev.read_block(bh.blkno, &mut data)?;
        bh.uptodate.store(true, Ordering::Release);
        trace!("read block {}", bh.blkno);
        Ok(())
    }

    /// Get a zeroed buffer for a freshly allocated block without reading it
    pub fn new_buffer(&self, blkno: u64) -> BufferRef {
        let bh = self.get(blkno);
        bh.data_mut().fill(0);
        bh.uptodate.store(true, Ordering::Release);
        bh
    }

    /// Write a buffer through to the device
    pub fn write(&self, bh: &Buffer) -> Result<()> {
        let data = bh.data();
        self.dev.write_block(bh.blkno, &data)
    }

    /// Drop cached copies of a run of blocks
    pub fn wipe(&self, start: u64, len: u64) {
        let mut map = self.map.lock();
        for blkno in start..start + len {
            if let Some(bh) = map.remove(&blkno) {
                bh.uptodate.store(false, Ordering::Release);
            }
        }
    }

    pub fn is_cached(&self, blkno: u64) -> bool {
        self.map.lock().contains_key(&blkno)
    }
}
