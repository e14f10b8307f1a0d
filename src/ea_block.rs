//! Attribute records inside an attribute block
//!
//! An attribute block is a metadata header followed by a chain of records
//! that exactly tiles the rest of the block. Each record's `rec_len` leads to
//! the next; the last one carries `GFS2_EAFLAG_LAST` and ends at the block
//! boundary. [`records`] walks the chain and checks every step against the
//! buffer, so the offsets it yields are always safe to slice with.

use crate::error::{Error, Result};
use crate::types::*;
use byteorder::{BigEndian, ByteOrder};

/// One record: where it starts and its decoded header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EaRecord {
    pub off: usize,
    pub hdr: EaHeader,
}

impl EaRecord {
    /// Offset of the following record
    pub fn next(&self) -> usize {
        self.off + self.hdr.rec_len as usize
    }

    pub fn is_unused(&self) -> bool {
        self.hdr.ea_type == GFS2_EATYPE_UNUSED
    }

    /// Bytes between the end of the record's contents and the next record
    pub fn slack(&self) -> usize {
        self.hdr.rec_len as usize - self.hdr.size()
    }

    pub fn name<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.off + EaHeader::name_offset();
        &data[start..start + self.hdr.name_len as usize]
    }

    /// Inline value of a stuffed record
    pub fn stuffed_data<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.off + self.hdr.data_offset();
        &data[start..start + self.hdr.data_len as usize]
    }

    /// Data block pointers of an unstuffed record, holes included
    pub fn data_ptrs(&self, data: &[u8]) -> Vec<u64> {
        let start = self.off + self.hdr.ptrs_offset();
        (0..self.hdr.num_ptrs as usize)
            .map(|i| BigEndian::read_u64(&data[start + i * 8..start + i * 8 + 8]))
            .collect()
    }

    /// Does this record hold `name` in namespace `ea_type`?
    pub fn matches(&self, data: &[u8], ea_type: EaType, name: &[u8]) -> bool {
        self.hdr.ea_type == ea_type.raw() && self.name(data) == name
    }
}

/// Iterator over the records of one attribute block
pub struct EaRecords<'a> {
    data: &'a [u8],
    blkno: u64,
    off: usize,
    done: bool,
}

/// Walk the records of the attribute block `data`, read from `blkno`
pub fn records(data: &[u8], blkno: u64) -> EaRecords<'_> {
    EaRecords {
        data,
        blkno,
        off: MetaHeader::SIZE,
        done: false,
    }
}

impl EaRecords<'_> {
    fn fault(&mut self, detail: String) -> Option<Result<EaRecord>> {
        self.done = true;
        Some(Err(Error::consistency(self.blkno, detail)))
    }
}

impl Iterator for EaRecords<'_> {
    type Item = Result<EaRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let off = self.off;
        if off + EaHeader::SIZE > self.data.len() {
            return self.fault(format!("attribute chain runs off the block at offset {}", off));
        }

        let hdr = EaHeader::read_at(self.data, off);
        let rec_len = hdr.rec_len as usize;
        if rec_len == 0 || rec_len % 8 != 0 {
            return self.fault(format!("bad record length {} at offset {}", rec_len, off));
        }
        if off + rec_len > self.data.len() {
            return self.fault(format!(
                "record at offset {} overruns the block by {} bytes",
                off,
                off + rec_len - self.data.len()
            ));
        }
        if hdr.ea_type > GFS2_EATYPE_LAST {
            return self.fault(format!("record type {} at offset {}", hdr.ea_type, off));
        }
        if hdr.size() > rec_len {
            return self.fault(format!(
                "record at offset {} needs {} bytes but spans {}",
                off,
                hdr.size(),
                rec_len
            ));
        }
        if hdr.is_last() {
            if off + rec_len != self.data.len() {
                return self.fault(format!("last record at offset {} stops short of the block end", off));
            }
            self.done = true;
        }

        self.off = off + rec_len;
        Some(Ok(EaRecord { off, hdr }))
    }
}

/// Find the record at `off`, and the record before it
pub fn locate(data: &[u8], blkno: u64, off: usize) -> Result<(EaRecord, Option<EaRecord>)> {
    let mut prev = None;
    for rec in records(data, blkno) {
        let rec = rec?;
        if rec.off == off {
            return Ok((rec, prev));
        }
        prev = Some(rec);
    }
    Err(Error::consistency(blkno, format!("no attribute record at offset {}", off)))
}

/// Lay out a fresh attribute block: one unused record spanning the payload
pub fn init_block(data: &mut [u8]) {
    let hdr = EaHeader {
        rec_len: (data.len() - MetaHeader::SIZE) as u32,
        flags: GFS2_EAFLAG_LAST,
        ..Default::default()
    };
    hdr.write_at(data, MetaHeader::SIZE);
}

/// Cut the slack off the record at `off` into a new record of its own.
/// Returns the new record's offset; it inherits the last-record flag.
pub fn split(data: &mut [u8], off: usize) -> usize {
    let mut hdr = EaHeader::read_at(data, off);
    let used = hdr.size();
    let new_off = off + used;
    let last = hdr.flags & GFS2_EAFLAG_LAST;

    let new = EaHeader {
        rec_len: hdr.rec_len - used as u32,
        flags: last,
        ..Default::default()
    };
    hdr.rec_len = used as u32;
    hdr.flags &= !GFS2_EAFLAG_LAST;
    hdr.write_at(data, off);
    new.write_at(data, new_off);
    new_off
}

/// Fold the record at `off` into `prev_off`, which must directly precede it
pub fn merge_into_prev(data: &mut [u8], prev_off: usize, off: usize) {
    let hdr = EaHeader::read_at(data, off);
    let mut prev = EaHeader::read_at(data, prev_off);
    prev.rec_len += hdr.rec_len;
    if hdr.is_last() {
        prev.flags |= GFS2_EAFLAG_LAST;
    }
    prev.write_at(data, prev_off);
}

/// Turn the record at `off` into an unused placeholder, keeping its length
/// and last flag
pub fn mark_unused(data: &mut [u8], off: usize, clear_ptrs: bool) {
    let mut hdr = EaHeader::read_at(data, off);
    hdr.ea_type = GFS2_EATYPE_UNUSED;
    if clear_ptrs {
        hdr.num_ptrs = 0;
    }
    hdr.write_at(data, off);
}

fn write_fields(data: &mut [u8], off: usize, ea_type: EaType, name: &[u8], data_len: usize, num_ptrs: u8) {
    let mut hdr = EaHeader::read_at(data, off);
    hdr.data_len = data_len as u32;
    hdr.name_len = name.len() as u8;
    hdr.ea_type = ea_type.raw();
    hdr.num_ptrs = num_ptrs;
    hdr.write_at(data, off);
    let start = off + EaHeader::name_offset();
    data[start..start + name.len()].copy_from_slice(name);
}

/// Fill the record at `off` with a stuffed value. Its length and last flag
/// are left as they are.
pub fn write_stuffed(data: &mut [u8], off: usize, ea_type: EaType, name: &[u8], value: &[u8]) {
    write_fields(data, off, ea_type, name, value.len(), 0);
    let start = off + EaHeader::SIZE + name.len();
    data[start..start + value.len()].copy_from_slice(value);
}

/// Fill the record at `off` with an unstuffed value's pointers
pub fn write_unstuffed(
    data: &mut [u8],
    off: usize,
    ea_type: EaType,
    name: &[u8],
    data_len: usize,
    ptrs: &[u64],
) {
    write_fields(data, off, ea_type, name, data_len, ptrs.len() as u8);
    let start = off + EaHeader::SIZE + align8(name.len());
    for (i, &p) in ptrs.iter().enumerate() {
        BigEndian::write_u64(&mut data[start + i * 8..start + i * 8 + 8], p);
    }
}

/// Zero pointer `idx` of the unstuffed record at `off`
pub fn clear_ptr(data: &mut [u8], rec: &EaRecord, idx: usize) {
    let start = rec.off + rec.hdr.ptrs_offset() + idx * 8;
    BigEndian::write_u64(&mut data[start..start + 8], 0);
}

/// Attribute block pointers of an indirection block, up to the first hole
pub fn indirect_ptrs(data: &[u8], inptrs: u32) -> Vec<u64> {
    (0..inptrs as usize)
        .map(|i| {
            let off = MetaHeader::SIZE + i * 8;
            BigEndian::read_u64(&data[off..off + 8])
        })
        .take_while(|&p| p != 0)
        .collect()
}

pub fn set_indirect_ptr(data: &mut [u8], idx: usize, ptr: u64) {
    let off = MetaHeader::SIZE + idx * 8;
    BigEndian::write_u64(&mut data[off..off + 8], ptr);
}

#[cfg(test)]
mod tests {
    use super::*;

    const BSIZE: usize = 512;

    fn block() -> Vec<u8> {
        let mut data = vec![0u8; BSIZE];
        MetaHeader::stamp(&mut data, GFS2_METATYPE_EA, 42);
        init_block(&mut data);
        data
    }

    fn collect(data: &[u8]) -> Vec<EaRecord> {
        records(data, 42).collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_fresh_block_is_one_unused_record() {
        let data = block();
        let recs = collect(&data);
        assert_eq!(recs.len(), 1);
        assert!(recs[0].is_unused());
        assert!(recs[0].hdr.is_last());
        assert_eq!(recs[0].hdr.rec_len as usize, BSIZE - MetaHeader::SIZE);
    }

    #[test]
    fn test_split_and_merge() {
        let mut data = block();
        write_stuffed(&mut data, 24, EaType::User, b"foo", b"bar");
        let new_off = split(&mut data, 24);
        assert_eq!(new_off, 24 + align8(16 + 3 + 3));
        write_stuffed(&mut data, new_off, EaType::Security, b"label", b"x");

        let recs = collect(&data);
        assert_eq!(recs.len(), 2);
        assert!(!recs[0].hdr.is_last());
        assert!(recs[1].hdr.is_last());
        assert!(recs[0].matches(&data, EaType::User, b"foo"));
        assert_eq!(recs[0].stuffed_data(&data), b"bar");
        assert_eq!(recs[1].name(&data), b"label");

        let before = recs[0].hdr.rec_len;
        merge_into_prev(&mut data, recs[0].off, recs[1].off);
        let recs = collect(&data);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].hdr.rec_len, before + (BSIZE as u32 - 24 - before));
        assert!(recs[0].hdr.is_last());
    }

    #[test]
    fn test_unstuffed_pointers() {
        let mut data = block();
        write_unstuffed(&mut data, 24, EaType::User, b"big", 1000, &[100, 101, 102]);
        let recs = collect(&data);
        assert!(!recs[0].hdr.is_stuffed());
        assert_eq!(recs[0].data_ptrs(&data), vec![100, 101, 102]);

        clear_ptr(&mut data, &recs[0], 1);
        assert_eq!(recs[0].data_ptrs(&data), vec![100, 0, 102]);
    }

    #[test]
    fn test_zero_length_is_a_fault() {
        let mut data = block();
        BigEndian::write_u32(&mut data[24..28], 0);
        let err = records(&data, 42).next().unwrap().unwrap_err();
        assert!(matches!(err, Error::Consistency { block: 42, .. }));
    }

    #[test]
    fn test_overrun_is_a_fault() {
        let mut data = block();
        BigEndian::write_u32(&mut data[24..28], BSIZE as u32);
        assert!(records(&data, 42).next().unwrap().is_err());
    }

    #[test]
    fn test_last_flag_must_end_block() {
        let mut data = block();
        write_stuffed(&mut data, 24, EaType::User, b"a", b"b");
        split(&mut data, 24);
        // drop the flag from the tail and put it on the head
        let mut head = EaHeader::read_at(&data, 24);
        head.flags |= GFS2_EAFLAG_LAST;
        head.write_at(&mut data, 24);
        let recs: Vec<_> = records(&data, 42).collect();
        assert_eq!(recs.len(), 1);
        assert!(recs[0].is_err());
    }

    #[test]
    fn test_missing_last_flag_runs_off() {
        let mut data = block();
        let mut hdr = EaHeader::read_at(&data, 24);
        hdr.flags = 0;
        hdr.write_at(&mut data, 24);
        let recs: Vec<_> = records(&data, 42).collect();
        assert_eq!(recs.len(), 2);
        assert!(recs[0].is_ok());
        assert!(recs[1].is_err());
    }

    #[test]
    fn test_bad_type_is_a_fault() {
        let mut data = block();
        data[24 + 9] = 9;
        assert!(records(&data, 42).next().unwrap().is_err());
    }

    #[test]
    fn test_locate_finds_predecessor() {
        let mut data = block();
        write_stuffed(&mut data, 24, EaType::User, b"a", b"1");
        let second = split(&mut data, 24);
        let (rec, prev) = locate(&data, 42, second).unwrap();
        assert_eq!(rec.off, second);
        assert_eq!(prev.unwrap().off, 24);
        assert!(locate(&data, 42, 30).is_err());
    }
}
