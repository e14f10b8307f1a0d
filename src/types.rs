//! Core on-disk data structures for GFS2 resource groups, dinodes and
//! extended attributes
//!
//! Everything on disk is big-endian. Structures are decoded from and encoded
//! into block buffers at fixed offsets; the layouts below are bit-exact.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

/// Magic number carried by every metadata block header
pub const GFS2_MAGIC: u32 = 0x0116_1970;

/// On-disk filesystem format revision
pub const GFS2_FORMAT_FS: u32 = 1801;

/// Default block size in bytes
pub const GFS2_DEFAULT_BSIZE: u32 = 4096;

/// Smallest supported block size
pub const GFS2_MIN_BSIZE: u32 = 512;

/// Largest supported block size
pub const GFS2_MAX_BSIZE: u32 = 65536;

/// Block address of the superblock
pub const GFS2_SB_ADDR: u64 = 0;

/// Metadata block types
pub const GFS2_METATYPE_NONE: u32 = 0;
pub const GFS2_METATYPE_SB: u32 = 1; // Superblock
pub const GFS2_METATYPE_RG: u32 = 2; // Resource group header
pub const GFS2_METATYPE_RB: u32 = 3; // Resource group bitmap
pub const GFS2_METATYPE_DI: u32 = 4; // Dinode
pub const GFS2_METATYPE_IN: u32 = 5; // Indirect pointer block
pub const GFS2_METATYPE_JD: u32 = 7; // Journaled data
pub const GFS2_METATYPE_EA: u32 = 10; // Extended attribute header block
pub const GFS2_METATYPE_ED: u32 = 11; // Extended attribute data block

/// Format number stored alongside a metadata type
pub const fn metatype_format(mh_type: u32) -> u32 {
    mh_type * 100
}

/// Bits used per block in a resource group bitmap
pub const GFS2_BIT_SIZE: u32 = 2;

/// Mask for one block's allocation state
pub const GFS2_BIT_MASK: u8 = 0x03;

/// Blocks described per bitmap byte
pub const GFS2_NBBY: u32 = 4;

/// Block allocation states
pub const GFS2_BLKST_FREE: u8 = 0;
pub const GFS2_BLKST_USED: u8 = 1; // Data or metadata
pub const GFS2_BLKST_UNLINKED: u8 = 2; // Reserved, never a counted state
pub const GFS2_BLKST_DINODE: u8 = 3;

/// Resource group flag: never allocate from this group
pub const GFS2_RGF_NOALLOC: u32 = 0x0000_0008;

/// Dinode flags
pub const GFS2_DIF_JDATA: u32 = 0x0000_0001;
pub const GFS2_DIF_EXHASH: u32 = 0x0000_0002;
pub const GFS2_DIF_EA_INDIRECT: u32 = 0x0000_0008;
pub const GFS2_DIF_IMMUTABLE: u32 = 0x0000_0020;
pub const GFS2_DIF_APPENDONLY: u32 = 0x0000_0040;
pub const GFS2_DIF_SYSTEM: u32 = 0x0000_0200;

/// File mode flags
pub mod mode {
    pub const S_IFMT: u32 = 0o170000; // Type mask
    pub const S_IFREG: u32 = 0o100000; // Regular file
    pub const S_IFDIR: u32 = 0o040000; // Directory
}

/// Extended attribute limits and flags
pub const GFS2_EA_MAX_NAME_LEN: usize = 255;
pub const GFS2_EA_MAX_DATA_LEN: usize = 65536;
pub const GFS2_EAFLAG_LAST: u8 = 0x01;

/// Raw extended attribute type tags
pub const GFS2_EATYPE_UNUSED: u8 = 0;
pub const GFS2_EATYPE_USR: u8 = 1;
pub const GFS2_EATYPE_SYS: u8 = 2;
pub const GFS2_EATYPE_SECURITY: u8 = 3;
pub const GFS2_EATYPE_LAST: u8 = GFS2_EATYPE_SECURITY;

/// Transaction sizing: buffers touched per kind of update
pub const RES_DINODE: u32 = 1;
pub const RES_INDIRECT: u32 = 1;
pub const RES_JDATA: u32 = 1;
pub const RES_RG_BIT: u32 = 2;
pub const RES_EATTR: u32 = 1;
pub const RES_STATFS: u32 = 1;
pub const RES_QUOTA: u32 = 2;

/// Round up to the next multiple of eight
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Integer division rounding up
pub const fn div_ru(n: usize, d: usize) -> usize {
    n.div_ceil(d)
}

/// Block size dependent constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Block size in bytes
    pub bsize: u32,
    /// log2(bsize)
    pub bsize_shift: u32,
    /// Payload bytes in a journaled-data, EA or ED block
    pub jbsize: u32,
    /// Block pointers in an indirect block
    pub inptrs: u32,
    /// Block pointers in a dinode
    pub diptrs: u32,
}

impl Geometry {
    pub fn new(bsize: u32) -> Self {
        let jbsize = bsize - MetaHeader::SIZE as u32;
        Geometry {
            bsize,
            bsize_shift: bsize.trailing_zeros(),
            jbsize,
            inptrs: jbsize / 8,
            diptrs: (bsize - Dinode::SIZE as u32) / 8,
        }
    }

    /// Bitmap bytes that fit in a resource group header block
    pub fn header_bitbytes(&self) -> u32 {
        self.bsize - RgrpHeader::SIZE as u32
    }

    /// Bitmap bytes that fit in a plain bitmap block
    pub fn bitmap_bitbytes(&self) -> u32 {
        self.bsize - MetaHeader::SIZE as u32
    }
}

/// Header at the start of every metadata block (24 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaHeader {
    pub magic: u32,
    pub mh_type: u32,
    pub blkno: u64,
    pub format: u32,
}

impl MetaHeader {
    pub const SIZE: usize = 24;

    pub fn new(mh_type: u32, blkno: u64) -> Self {
        MetaHeader {
            magic: GFS2_MAGIC,
            mh_type,
            blkno,
            format: metatype_format(mh_type),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        MetaHeader {
            magic: BigEndian::read_u32(&data[0..4]),
            mh_type: BigEndian::read_u32(&data[4..8]),
            blkno: BigEndian::read_u64(&data[8..16]),
            format: BigEndian::read_u32(&data[16..20]),
        }
    }

    pub fn write_to(&self, data: &mut [u8]) {
        BigEndian::write_u32(&mut data[0..4], self.magic);
        BigEndian::write_u32(&mut data[4..8], self.mh_type);
        BigEndian::write_u64(&mut data[8..16], self.blkno);
        BigEndian::write_u32(&mut data[16..20], self.format);
        BigEndian::write_u32(&mut data[20..24], 0);
    }

    /// Stamp a metadata header onto a block and zero everything after it
    pub fn stamp(data: &mut [u8], mh_type: u32, blkno: u64) {
        MetaHeader::new(mh_type, blkno).write_to(data);
        data[Self::SIZE..].fill(0);
    }
}

/// Superblock (block 0)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub fs_format: u32,
    pub bsize: u32,
    pub bsize_shift: u32,
    /// Number of journals, one per cluster node
    pub journals: u32,
    /// Address of the resource index dinode
    pub rindex_addr: u64,
    /// Address of the root dinode
    pub root_addr: u64,
    /// Cluster lock table name
    pub locktable: String,
}

impl Superblock {
    pub const SIZE: usize = 120;
    const LOCKTABLE_LEN: usize = 64;

    pub fn from_bytes(data: &[u8]) -> crate::Result<Self> {
        let mut cursor = Cursor::new(&data[MetaHeader::SIZE..Self::SIZE]);
        let fs_format = cursor.read_u32::<BigEndian>()?;
        let bsize = cursor.read_u32::<BigEndian>()?;
        let bsize_shift = cursor.read_u32::<BigEndian>()?;
        let journals = cursor.read_u32::<BigEndian>()?;
        let rindex_addr = cursor.read_u64::<BigEndian>()?;
        let root_addr = cursor.read_u64::<BigEndian>()?;

        let table = &data[Self::SIZE - Self::LOCKTABLE_LEN..Self::SIZE];
        let locktable = table
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();

        Ok(Superblock {
            fs_format,
            bsize,
            bsize_shift,
            journals,
            rindex_addr,
            root_addr,
            locktable,
        })
    }

    pub fn write_to(&self, data: &mut [u8]) {
        MetaHeader::stamp(data, GFS2_METATYPE_SB, GFS2_SB_ADDR);
        let p = &mut data[MetaHeader::SIZE..];
        BigEndian::write_u32(&mut p[0..4], self.fs_format);
        BigEndian::write_u32(&mut p[4..8], self.bsize);
        BigEndian::write_u32(&mut p[8..12], self.bsize_shift);
        BigEndian::write_u32(&mut p[12..16], self.journals);
        BigEndian::write_u64(&mut p[16..24], self.rindex_addr);
        BigEndian::write_u64(&mut p[24..32], self.root_addr);

        let table = self.locktable.as_bytes();
        let len = table.len().min(Self::LOCKTABLE_LEN - 1);
        p[32..32 + len].copy_from_slice(&table[..len]);
    }
}

/// One record of the resource index special file (96 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RindexEntry {
    /// First block of the resource group (its header)
    pub addr: u64,
    /// Number of header and bitmap blocks
    pub length: u32,
    /// First data block
    pub data0: u64,
    /// Number of data blocks governed
    pub data: u32,
    /// Number of bitmap bytes
    pub bitbytes: u32,
}

impl RindexEntry {
    pub const SIZE: usize = 96;

    pub fn from_bytes(data: &[u8]) -> Self {
        RindexEntry {
            addr: BigEndian::read_u64(&data[0..8]),
            length: BigEndian::read_u32(&data[8..12]),
            data0: BigEndian::read_u64(&data[16..24]),
            data: BigEndian::read_u32(&data[24..28]),
            bitbytes: BigEndian::read_u32(&data[28..32]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        BigEndian::write_u64(&mut out[0..8], self.addr);
        BigEndian::write_u32(&mut out[8..12], self.length);
        BigEndian::write_u64(&mut out[16..24], self.data0);
        BigEndian::write_u32(&mut out[24..28], self.data);
        BigEndian::write_u32(&mut out[28..32], self.bitbytes);
        out
    }

    /// Check if a block lies in this group's data area
    pub fn contains(&self, block: u64) -> bool {
        block >= self.data0 && block < self.data0 + self.data as u64
    }
}

impl fmt::Display for RindexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ri_addr = {}, ri_length = {}, ri_data0 = {}, ri_data = {}, ri_bitbytes = {}",
            self.addr, self.length, self.data0, self.data, self.bitbytes
        )
    }
}

/// Resource group header fields (128 bytes including the metadata header)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RgrpHeader {
    pub flags: u32,
    pub free: u32,
    pub dinodes: u32,
    pub igeneration: u64,
}

impl RgrpHeader {
    pub const SIZE: usize = 128;

    pub fn from_bytes(data: &[u8]) -> Self {
        let p = &data[MetaHeader::SIZE..];
        RgrpHeader {
            flags: BigEndian::read_u32(&p[0..4]),
            free: BigEndian::read_u32(&p[4..8]),
            dinodes: BigEndian::read_u32(&p[8..12]),
            igeneration: BigEndian::read_u64(&p[16..24]),
        }
    }

    /// Write the counters back, leaving the metadata header untouched
    pub fn write_to(&self, data: &mut [u8]) {
        let p = &mut data[MetaHeader::SIZE..];
        BigEndian::write_u32(&mut p[0..4], self.flags);
        BigEndian::write_u32(&mut p[4..8], self.free);
        BigEndian::write_u32(&mut p[8..12], self.dinodes);
        BigEndian::write_u32(&mut p[12..16], 0);
        BigEndian::write_u64(&mut p[16..24], self.igeneration);
    }
}

/// Dinode (232 bytes before the pointer area)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dinode {
    pub formal_ino: u64,
    pub addr: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    /// Blocks owned by the inode, its own block included
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    /// Last metadata block allocated
    pub goal_meta: u64,
    /// Last data block allocated
    pub goal_data: u64,
    pub flags: u32,
    pub height: u16,
    /// Extended attribute block, or indirection block with GFS2_DIF_EA_INDIRECT
    pub eattr: u64,
}

impl Dinode {
    pub const SIZE: usize = 232;

    pub fn from_bytes(data: &[u8]) -> crate::Result<Self> {
        let mut cursor = Cursor::new(&data[MetaHeader::SIZE..Self::SIZE]);

        let formal_ino = cursor.read_u64::<BigEndian>()?;
        let addr = cursor.read_u64::<BigEndian>()?;
        let mode = cursor.read_u32::<BigEndian>()?;
        let uid = cursor.read_u32::<BigEndian>()?;
        let gid = cursor.read_u32::<BigEndian>()?;
        let nlink = cursor.read_u32::<BigEndian>()?;
        let size = cursor.read_u64::<BigEndian>()?;
        let blocks = cursor.read_u64::<BigEndian>()?;
        let atime = cursor.read_i64::<BigEndian>()?;
        let mtime = cursor.read_i64::<BigEndian>()?;
        let ctime = cursor.read_i64::<BigEndian>()?;
        let goal_meta = cursor.read_u64::<BigEndian>()?;
        let goal_data = cursor.read_u64::<BigEndian>()?;
        let flags = cursor.read_u32::<BigEndian>()?;
        let _payload_format = cursor.read_u32::<BigEndian>()?;
        let height = cursor.read_u16::<BigEndian>()?;
        let _pad = cursor.read_u16::<BigEndian>()?;
        let _depth = cursor.read_u32::<BigEndian>()?;
        let _entries = cursor.read_u32::<BigEndian>()?;
        let _pad2 = cursor.read_u32::<BigEndian>()?;
        let eattr = cursor.read_u64::<BigEndian>()?;

        Ok(Dinode {
            formal_ino,
            addr,
            mode,
            uid,
            gid,
            nlink,
            size,
            blocks,
            atime,
            mtime,
            ctime,
            goal_meta,
            goal_data,
            flags,
            height,
            eattr,
        })
    }

    /// Write the dinode fields, leaving the metadata header and pointer
    /// area untouched
    pub fn write_to(&self, data: &mut [u8]) {
        let p = &mut data[MetaHeader::SIZE..Self::SIZE];
        p.fill(0);
        BigEndian::write_u64(&mut p[0..8], self.formal_ino);
        BigEndian::write_u64(&mut p[8..16], self.addr);
        BigEndian::write_u32(&mut p[16..20], self.mode);
        BigEndian::write_u32(&mut p[20..24], self.uid);
        BigEndian::write_u32(&mut p[24..28], self.gid);
        BigEndian::write_u32(&mut p[28..32], self.nlink);
        BigEndian::write_u64(&mut p[32..40], self.size);
        BigEndian::write_u64(&mut p[40..48], self.blocks);
        BigEndian::write_i64(&mut p[48..56], self.atime);
        BigEndian::write_i64(&mut p[56..64], self.mtime);
        BigEndian::write_i64(&mut p[64..72], self.ctime);
        BigEndian::write_u64(&mut p[72..80], self.goal_meta);
        BigEndian::write_u64(&mut p[80..88], self.goal_data);
        BigEndian::write_u32(&mut p[88..92], self.flags);
        BigEndian::write_u16(&mut p[96..98], self.height);
        BigEndian::write_u64(&mut p[112..120], self.eattr);
    }

    pub fn is_ea_indirect(&self) -> bool {
        self.flags & GFS2_DIF_EA_INDIRECT != 0
    }

    pub fn is_immutable(&self) -> bool {
        self.flags & GFS2_DIF_IMMUTABLE != 0
    }

    pub fn is_append_only(&self) -> bool {
        self.flags & GFS2_DIF_APPENDONLY != 0
    }

    pub fn is_dir(&self) -> bool {
        (self.mode & mode::S_IFMT) == mode::S_IFDIR
    }
}

/// Extended attribute namespaces a request can name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EaType {
    User = 1,
    System = 2,
    Security = 3,
}

impl EaType {
    /// Get the namespace from an on-disk tag; `None` for unused records
    pub fn from_raw(tag: u8) -> Option<Self> {
        match tag {
            GFS2_EATYPE_USR => Some(EaType::User),
            GFS2_EATYPE_SYS => Some(EaType::System),
            GFS2_EATYPE_SECURITY => Some(EaType::Security),
            _ => None,
        }
    }

    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Get namespace prefix string
    pub fn prefix(self) -> &'static str {
        match self {
            EaType::User => "user.",
            EaType::System => "system.",
            EaType::Security => "security.",
        }
    }
}

/// Extended attribute record header (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EaHeader {
    pub rec_len: u32,
    pub data_len: u32,
    pub name_len: u8,
    pub ea_type: u8,
    pub flags: u8,
    pub num_ptrs: u8,
}

impl EaHeader {
    pub const SIZE: usize = 16;

    pub fn read_at(data: &[u8], off: usize) -> Self {
        let p = &data[off..off + Self::SIZE];
        EaHeader {
            rec_len: BigEndian::read_u32(&p[0..4]),
            data_len: BigEndian::read_u32(&p[4..8]),
            name_len: p[8],
            ea_type: p[9],
            flags: p[10],
            num_ptrs: p[11],
        }
    }

    pub fn write_at(&self, data: &mut [u8], off: usize) {
        let p = &mut data[off..off + Self::SIZE];
        BigEndian::write_u32(&mut p[0..4], self.rec_len);
        BigEndian::write_u32(&mut p[4..8], self.data_len);
        p[8] = self.name_len;
        p[9] = self.ea_type;
        p[10] = self.flags;
        p[11] = self.num_ptrs;
        BigEndian::write_u32(&mut p[12..16], 0);
    }

    pub fn is_last(&self) -> bool {
        self.flags & GFS2_EAFLAG_LAST != 0
    }

    pub fn is_stuffed(&self) -> bool {
        self.num_ptrs == 0
    }

    /// Bytes actually used by the record, excluding trailing slack
    pub fn size(&self) -> usize {
        let payload = if self.is_stuffed() {
            self.data_len as usize
        } else {
            8 * self.num_ptrs as usize
        };
        align8(Self::SIZE + self.name_len as usize + payload)
    }

    /// Offset of the name from the start of the record
    pub fn name_offset() -> usize {
        Self::SIZE
    }

    /// Offset of inline data from the start of the record
    pub fn data_offset(&self) -> usize {
        Self::SIZE + self.name_len as usize
    }

    /// Offset of the data pointer array from the start of the record
    pub fn ptrs_offset(&self) -> usize {
        Self::SIZE + align8(self.name_len as usize)
    }

    /// Length of the "prefix.name\0" string `list` emits for this record
    pub fn strlen(&self) -> usize {
        let prefix = EaType::from_raw(self.ea_type)
            .map(|t| t.prefix().len())
            .unwrap_or(0);
        prefix + self.name_len as usize + 1
    }
}

/// Record size of a stuffed request
pub fn ea_size_stuffed(name_len: usize, data_len: usize) -> usize {
    align8(EaHeader::SIZE + name_len + data_len)
}

/// Record size of an unstuffed request, data blocks excluded
pub fn ea_size_unstuffed(name_len: usize, data_len: usize, jbsize: u32) -> usize {
    align8(EaHeader::SIZE + name_len + 8 * div_ru(data_len, jbsize as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_4k() {
        let geo = Geometry::new(4096);
        assert_eq!(geo.bsize_shift, 12);
        assert_eq!(geo.jbsize, 4072);
        assert_eq!(geo.inptrs, 509);
        assert_eq!(geo.diptrs, 483);
        assert_eq!(geo.header_bitbytes(), 3968);
    }

    #[test]
    fn test_rindex_entry_layout() {
        let ri = RindexEntry {
            addr: 0x1122_3344_5566_7788,
            length: 3,
            data0: 20,
            data: 1000,
            bitbytes: 250,
        };
        let bytes = ri.to_bytes();
        assert_eq!(&bytes[0..8], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 3]);
        assert_eq!(RindexEntry::from_bytes(&bytes), ri);
        assert!(ri.contains(20));
        assert!(ri.contains(1019));
        assert!(!ri.contains(1020));
        assert!(!ri.contains(19));
    }

    #[test]
    fn test_dinode_preserves_pointer_area() {
        let mut block = vec![0xAAu8; 4096];
        MetaHeader::new(GFS2_METATYPE_DI, 42).write_to(&mut block);
        let di = Dinode {
            formal_ino: 42,
            addr: 42,
            mode: mode::S_IFREG | 0o644,
            blocks: 1,
            eattr: 77,
            flags: GFS2_DIF_EA_INDIRECT,
            ..Default::default()
        };
        di.write_to(&mut block);
        assert_eq!(block[Dinode::SIZE], 0xAA);

        let back = Dinode::from_bytes(&block).unwrap();
        assert_eq!(back, di);
        assert!(back.is_ea_indirect());
    }

    #[test]
    fn test_ea_sizes() {
        // 16 + 3 + 3 = 22, rounded to 24
        assert_eq!(ea_size_stuffed(3, 3), 24);
        // one pointer for a value just over one block
        assert_eq!(ea_size_unstuffed(3, 4073, 4072), align8(16 + 3 + 16));

        let hdr = EaHeader {
            rec_len: 4072,
            data_len: 5000,
            name_len: 9,
            ea_type: GFS2_EATYPE_USR,
            flags: GFS2_EAFLAG_LAST,
            num_ptrs: 2,
        };
        assert!(!hdr.is_stuffed());
        assert_eq!(hdr.ptrs_offset(), 16 + 16);
        assert_eq!(hdr.size(), align8(16 + 9 + 16));
        assert_eq!(hdr.strlen(), "user.".len() + 9 + 1);
    }

    #[test]
    fn test_superblock_roundtrip() {
        let sb = Superblock {
            fs_format: GFS2_FORMAT_FS,
            bsize: 4096,
            bsize_shift: 12,
            journals: 2,
            rindex_addr: 1,
            root_addr: 30,
            locktable: "cluster:fs0".to_string(),
        };
        let mut block = vec![0u8; 4096];
        sb.write_to(&mut block);
        assert_eq!(MetaHeader::from_bytes(&block).mh_type, GFS2_METATYPE_SB);
        assert_eq!(Superblock::from_bytes(&block).unwrap(), sb);
    }
}
