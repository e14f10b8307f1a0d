//! Resource group bitmap layout and 2-bit block-state primitives
//!
//! Each block of a resource group's data area is described by two bits.
//! Four blocks share a byte, the lowest-numbered block in the lowest bits.

use crate::error::{Error, Result};
use crate::types::*;

/// Where one header or bitmap block keeps its slice of the group bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapSegment {
    /// Byte offset of the bitmap within the block
    pub offset: u32,
    /// Byte index of this slice within the whole group bitmap
    pub start: u32,
    /// Bytes of bitmap held in this block
    pub len: u32,
}

impl BitmapSegment {
    /// First data block (relative to the group) described by this segment
    pub fn first_block(&self) -> u32 {
        self.start * GFS2_NBBY
    }

    /// Number of data blocks described by this segment
    pub fn blocks(&self) -> u32 {
        self.len * GFS2_NBBY
    }

    /// Check if a group-relative block falls in this segment
    pub fn covers(&self, rel: u32) -> bool {
        rel >= self.first_block() && rel < self.first_block() + self.blocks()
    }

    /// Byte range of this segment inside its block
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..(self.offset + self.len) as usize
    }
}

/// Work out which bytes of each header/bitmap block hold the group bitmap.
///
/// The header block gives up its first 128 bytes to the group summary;
/// every other block loses only the metadata header. The last block takes
/// whatever is left.
pub fn compute_bitstructs(ri: &RindexEntry, geo: &Geometry) -> Result<Vec<BitmapSegment>> {
    let length = ri.length;
    if length == 0 {
        return Err(Error::consistency(ri.addr, "resource group of zero length"));
    }

    let mut segments = Vec::with_capacity(length as usize);
    let mut bytes_left = ri.bitbytes;

    for x in 0..length {
        let seg = if length == 1 {
            BitmapSegment {
                offset: RgrpHeader::SIZE as u32,
                start: 0,
                len: bytes_left,
            }
        } else if x == 0 {
            BitmapSegment {
                offset: RgrpHeader::SIZE as u32,
                start: 0,
                len: geo.header_bitbytes().min(bytes_left),
            }
        } else if x + 1 == length {
            BitmapSegment {
                offset: MetaHeader::SIZE as u32,
                start: ri.bitbytes - bytes_left,
                len: bytes_left,
            }
        } else {
            BitmapSegment {
                offset: MetaHeader::SIZE as u32,
                start: ri.bitbytes - bytes_left,
                len: geo.bitmap_bitbytes().min(bytes_left),
            }
        };

        if seg.offset + seg.len > geo.bsize {
            return Err(Error::consistency(
                ri.addr + x as u64,
                format!("bitmap segment of {} bytes overflows the block", seg.len),
            ));
        }
        bytes_left -= seg.len;
        segments.push(seg);
    }

    if bytes_left != 0 {
        return Err(Error::consistency(
            ri.addr,
            format!("{} bitmap bytes not covered by any block", bytes_left),
        ));
    }

    let described = segments
        .last()
        .map(|s| (s.start + s.len) * GFS2_NBBY)
        .unwrap_or(0);
    if described != ri.data {
        return Err(Error::consistency(
            ri.addr,
            format!(
                "bitmap describes {} blocks but the group holds {} ({})",
                described, ri.data, ri
            ),
        ));
    }

    Ok(segments)
}

/// State of block `blk` in a bitmap slice
pub fn test_bit(buf: &[u8], blk: u32) -> u8 {
    let byte = buf[(blk / GFS2_NBBY) as usize];
    let shift = (blk % GFS2_NBBY) * GFS2_BIT_SIZE;
    (byte >> shift) & GFS2_BIT_MASK
}

/// Set block `blk` to `state`, returning the previous state
pub fn set_bit(buf: &mut [u8], blk: u32, state: u8) -> u8 {
    let idx = (blk / GFS2_NBBY) as usize;
    let shift = (blk % GFS2_NBBY) * GFS2_BIT_SIZE;
    let old = (buf[idx] >> shift) & GFS2_BIT_MASK;
    buf[idx] = (buf[idx] & !(GFS2_BIT_MASK << shift)) | ((state & GFS2_BIT_MASK) << shift);
    old
}

/// Find the first block at or after `goal` whose state is `state`
pub fn bitfit(buf: &[u8], goal: u32, state: u8) -> Option<u32> {
    let nblocks = buf.len() as u32 * GFS2_NBBY;
    if goal >= nblocks {
        return None;
    }

    // Skip whole bytes that cannot contain a match
    let full = match state {
        GFS2_BLKST_FREE => 0x00,
        GFS2_BLKST_USED => 0x55,
        GFS2_BLKST_UNLINKED => 0xAA,
        _ => 0xFF,
    };

    let mut blk = goal;
    while blk < nblocks {
        if blk % GFS2_NBBY == 0 {
            let byte = buf[(blk / GFS2_NBBY) as usize];
            if !has_state(byte, state) {
                blk += GFS2_NBBY;
                continue;
            }
            if byte == full {
                return Some(blk);
            }
        }
        if test_bit(buf, blk) == state {
            return Some(blk);
        }
        blk += 1;
    }
    None
}

fn has_state(byte: u8, state: u8) -> bool {
    (0..GFS2_NBBY).any(|i| (byte >> (i * GFS2_BIT_SIZE)) & GFS2_BIT_MASK == state)
}

/// Count blocks in `state` across a bitmap slice
pub fn bitcount(buf: &[u8], state: u8) -> u32 {
    buf.iter()
        .map(|&byte| {
            (0..GFS2_NBBY)
                .filter(|i| (byte >> (i * GFS2_BIT_SIZE)) & GFS2_BIT_MASK == state)
                .count() as u32
        })
        .sum()
}

/// Legal bitmap transitions
pub fn valid_change(old: u8, new: u8) -> bool {
    matches!(
        (old, new),
        (GFS2_BLKST_FREE, GFS2_BLKST_USED)
            | (GFS2_BLKST_FREE, GFS2_BLKST_DINODE)
            | (GFS2_BLKST_USED, GFS2_BLKST_FREE)
            | (GFS2_BLKST_DINODE, GFS2_BLKST_FREE)
    )
}

pub fn state_name(state: u8) -> &'static str {
    match state & GFS2_BIT_MASK {
        GFS2_BLKST_FREE => "free",
        GFS2_BLKST_USED => "used",
        GFS2_BLKST_UNLINKED => "unlinked",
        _ => "dinode",
    }
}
