//! Block devices backing a filesystem image

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Fixed-size block storage
pub trait BlockDevice: Send + Sync {
    fn block_size(&self) -> u32;

    /// Number of addressable blocks
    fn num_blocks(&self) -> u64;

    fn read_block(&self, blkno: u64, buf: &mut [u8]) -> Result<()>;

    fn write_block(&self, blkno: u64, data: &[u8]) -> Result<()>;

    /// Grow (or shrink) the device to `blocks` blocks
    fn resize(&self, blocks: u64) -> Result<()>;

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

fn check_len(bsize: u32, len: usize) -> Result<()> {
    if len != bsize as usize {
        return Err(Error::Invalid(format!(
            "block data must be {} bytes, got {}",
            bsize, len
        )));
    }
    Ok(())
}

fn out_of_range(blkno: u64, blocks: u64) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("block {} beyond end of device ({} blocks)", blkno, blocks),
    ))
}

/// Image file on the host filesystem
pub struct FileDevice {
    file: Mutex<File>,
    bsize: u32,
    blocks: Mutex<u64>,
}

impl FileDevice {
    /// Open an existing image
    pub fn open<P: AsRef<Path>>(path: P, bsize: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let blocks = file.metadata()?.len() / bsize as u64;
        Ok(FileDevice {
            file: Mutex::new(file),
            bsize,
            blocks: Mutex::new(blocks),
        })
    }

    /// Create (or truncate) an image of `blocks` blocks
    pub fn create<P: AsRef<Path>>(path: P, bsize: u32, blocks: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(blocks * bsize as u64)?;
        Ok(FileDevice {
            file: Mutex::new(file),
            bsize,
            blocks: Mutex::new(blocks),
        })
    }

    /// Read the block size out of an image's superblock without opening it
    /// as a device first
    pub fn probe_block_size<P: AsRef<Path>>(path: P) -> Result<u32> {
        let mut file = File::open(path)?;
        let mut head = [0u8; 32];
        file.read_exact(&mut head)?;
        Ok(u32::from_be_bytes([head[28], head[29], head[30], head[31]]))
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> u32 {
        self.bsize
    }

    fn num_blocks(&self) -> u64 {
        *self.blocks.lock()
    }

    fn read_block(&self, blkno: u64, buf: &mut [u8]) -> Result<()> {
        check_len(self.bsize, buf.len())?;
        let blocks = self.num_blocks();
        if blkno >= blocks {
            return Err(out_of_range(blkno, blocks));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(blkno * self.bsize as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&self, blkno: u64, data: &[u8]) -> Result<()> {
        check_len(self.bsize, data.len())?;
        let blocks = self.num_blocks();
        if blkno >= blocks {
            return Err(out_of_range(blkno, blocks));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(blkno * self.bsize as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    fn resize(&self, blocks: u64) -> Result<()> {
        let file = self.file.lock();
        file.set_len(blocks * self.bsize as u64)?;
        *self.blocks.lock() = blocks;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

/// Memory-backed device
pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    bsize: u32,
}

impl MemDevice {
    pub fn new(bsize: u32, blocks: u64) -> Self {
        MemDevice {
            data: Mutex::new(vec![0u8; (blocks * bsize as u64) as usize]),
            bsize,
        }
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> u32 {
        self.bsize
    }

    fn num_blocks(&self) -> u64 {
        self.data.lock().len() as u64 / self.bsize as u64
    }

    fn read_block(&self, blkno: u64, buf: &mut [u8]) -> Result<()> {
        check_len(self.bsize, buf.len())?;
        let data = self.data.lock();
        let start = (blkno * self.bsize as u64) as usize;
        let end = start + self.bsize as usize;
        if end > data.len() {
            return Err(out_of_range(blkno, data.len() as u64 / self.bsize as u64));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_block(&self, blkno: u64, buf: &[u8]) -> Result<()> {
        check_len(self.bsize, buf.len())?;
        let mut data = self.data.lock();
        let start = (blkno * self.bsize as u64) as usize;
        let end = start + self.bsize as usize;
        if end > data.len() {
            return Err(out_of_range(blkno, data.len() as u64 / self.bsize as u64));
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn resize(&self, blocks: u64) -> Result<()> {
        self.data.lock().resize((blocks * self.bsize as u64) as usize, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_device_read_write() {
        let dev = MemDevice::new(512, 8);
        let block = vec![0x5Au8; 512];
        dev.write_block(3, &block).unwrap();

        let mut buf = vec![0u8; 512];
        dev.read_block(3, &mut buf).unwrap();
        assert_eq!(buf, block);

        assert!(dev.read_block(8, &mut buf).is_err());
        dev.resize(16).unwrap();
        assert_eq!(dev.num_blocks(), 16);
        dev.read_block(8, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let dev = MemDevice::new(512, 2);
        assert!(matches!(dev.write_block(0, &[0u8; 100]), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_file_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let dev = FileDevice::create(&path, 1024, 4).unwrap();
        dev.write_block(2, &vec![7u8; 1024]).unwrap();
        dev.sync().unwrap();
        drop(dev);

        let dev = FileDevice::open(&path, 1024).unwrap();
        assert_eq!(dev.num_blocks(), 4);
        let mut buf = vec![0u8; 1024];
        dev.read_block(2, &mut buf).unwrap();
        assert_eq!(buf[0], 7);
        dev.resize(10).unwrap();
        dev.write_block(9, &vec![1u8; 1024]).unwrap();
    }
}
