//! End-to-end behaviour over the public API
//!
//! The crate's own `fs::testing` helpers are private to its unit tests, so
//! images here are formatted through the public `mkfs` entry points.

use gfs2_tools::ea_block;
use gfs2_tools::glock::{LocalLockManager, LockManager};
use gfs2_tools::inode::IncoreInode;
use gfs2_tools::mkfs;
use gfs2_tools::quota::{QuotaLedger, QuotaSink};
use gfs2_tools::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

/// A formatted in-memory device with `rgrps` groups of `rgrp_blocks`
fn mem_device(bsize: u32, rgrps: u64, rgrp_blocks: u32, journals: u32) -> Arc<dyn BlockDevice> {
    let opts = MkfsOptions {
        block_size: bsize,
        rgrp_blocks,
        journals,
        max_rgrps: 16,
        locktable: "scenario:fs".into(),
    };
    let dev: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(bsize, mkfs::layout_blocks(&opts, rgrps)));
    mkfs::mkfs(dev.as_ref(), &opts).unwrap();
    dev
}

/// Single-node counterpart of `fs::testing::mem_fs`
fn mem_fs(bsize: u32, rgrps: u64, rgrp_blocks: u32) -> Gfs2Fs {
    Gfs2Fs::mount(mem_device(bsize, rgrps, rgrp_blocks, 1), MountArgs::default()).unwrap()
}

/// Mount the same device as one node of a cluster sharing `lm`
fn node(dev: &Arc<dyn BlockDevice>, lm: &Arc<dyn LockManager>, jid: u32) -> Gfs2Fs {
    let quota: Arc<dyn QuotaSink> = Arc::new(QuotaLedger::new());
    let args = MountArgs {
        jid,
        fsname: format!("node{}", jid),
        ..Default::default()
    };
    Gfs2Fs::mount_with(Arc::clone(dev), Arc::clone(lm), quota, args).unwrap()
}

fn new_file(fs: &Gfs2Fs) -> u64 {
    fs.create_inode(fs.root_addr(), mode::S_IFREG | 0o644, 1000, 1000)
        .unwrap()
}

/// An in-core inode to charge allocations to, without locking one
fn owner(fs: &Gfs2Fs) -> IncoreInode {
    IncoreInode::new(fs.root_addr())
}

/// Reserve `n` blocks, allocate them as data and commit. Returns the blocks
/// and the group they came from.
fn alloc_n(fs: &Gfs2Fs, ip: &mut IncoreInode, n: u32) -> Result<(Vec<u64>, u64)> {
    let mut res = fs.inplace_reserve(ip, n)?;
    let rg = res.rgd().addr();
    let mut tr = fs.trans_begin(RES_RG_BIT + res.rgd().ri.length, 0)?;
    let mut blocks = Vec::new();
    for _ in 0..n {
        blocks.push(fs.alloc_data(ip, &mut res, &mut tr)?);
    }
    tr.end()?;
    Ok((blocks, rg))
}

fn free_one(fs: &Gfs2Fs, ip: &IncoreInode, blk: u64) -> Result<()> {
    let mut rlist = fs.rlist_new()?;
    rlist.add(blk)?;
    rlist.lock()?;
    let mut tr = fs.trans_begin(RES_RG_BIT + rlist.total_length(), 0)?;
    fs.free_data(ip, blk, 1, &mut tr)?;
    tr.end()
}

fn ea_records(fs: &Gfs2Fs, ino: u64) -> Vec<(u64, Vec<ea_block::EaRecord>)> {
    fs.ea_dump_blocks(ino)
        .unwrap()
        .into_iter()
        .filter(|(_, data)| MetaHeader::from_bytes(data).mh_type == GFS2_METATYPE_EA)
        .map(|(blkno, data)| {
            let recs = ea_block::records(&data, blkno)
                .collect::<Result<Vec<_>>>()
                .unwrap();
            (blkno, recs)
        })
        .collect()
}

#[test]
fn first_attribute_starts_fork() {
    let fs = mem_fs(4096, 2, 256);
    let ino = new_file(&fs);
    assert_eq!(fs.stat_inode(ino).unwrap().eattr, 0);

    fs.ea_set(ino, &EaRequest::new(EaType::User, b"foo", b"bar"))
        .unwrap();

    let blocks = fs.ea_dump_blocks(ino).unwrap();
    assert_eq!(blocks.len(), 1);
    let (blkno, data) = &blocks[0];
    let recs: Vec<_> = ea_block::records(data, *blkno)
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(recs.len(), 1);
    let rec = recs[0];
    assert_eq!(rec.hdr.ea_type, GFS2_EATYPE_USR);
    assert_eq!(rec.name(data), b"foo");
    assert_eq!(rec.stuffed_data(data), b"bar");
    assert!(rec.hdr.is_last());
    assert_eq!(fs.ea_get(ino, EaType::User, b"foo").unwrap(), b"bar");
}

#[test]
fn large_value_spreads_over_blocks() {
    let fs = mem_fs(512, 2, 256);
    let jbsize = fs.geo.jbsize as usize;
    let ino = new_file(&fs);
    let value: Vec<u8> = (0..jbsize * 3 + 100).map(|i| (i * 7 % 256) as u8).collect();

    fs.ea_set(ino, &EaRequest::new(EaType::User, b"blob", &value))
        .unwrap();

    let recs = ea_records(&fs, ino);
    let rec = recs[0].1[0];
    assert!(!rec.hdr.is_stuffed());
    assert_eq!(rec.hdr.num_ptrs, 4);
    assert_eq!(rec.hdr.data_len as usize, value.len());
    assert_eq!(fs.ea_get(ino, EaType::User, b"blob").unwrap(), value);

    let mut buf = vec![0u8; value.len()];
    assert_eq!(
        fs.ea_get_into(ino, EaType::User, b"blob", &mut buf).unwrap(),
        value.len()
    );
    assert_eq!(buf, value);
}

#[test]
fn full_group_fails_over_then_out_of_space() {
    // two groups of four data blocks, the root dinode in the first
    let fs = mem_fs(4096, 2, 5);
    let first = fs.rgrpd_get_first().unwrap();
    let second = fs.rgrpd_get_next(&first).unwrap();
    assert_eq!(first.ri.data, 4);
    let mut ip = owner(&fs);

    let (_, rg) = alloc_n(&fs, &mut ip, 2).unwrap();
    assert_eq!(rg, first.addr());
    // the first group can't supply three any more
    let (_, rg) = alloc_n(&fs, &mut ip, 3).unwrap();
    assert_eq!(rg, second.addr());
    assert_eq!(fs.rgrp_header(&first).unwrap().free, 1);
    assert_eq!(fs.rgrp_header(&second).unwrap().free, 1);

    let (a, rg_a) = alloc_n(&fs, &mut ip, 1).unwrap();
    let (b, rg_b) = alloc_n(&fs, &mut ip, 1).unwrap();
    assert_ne!(rg_a, rg_b);
    assert_ne!(a, b);
    assert!(matches!(alloc_n(&fs, &mut ip, 1), Err(Error::NoSpace)));

    assert_eq!(fs.statfs().free_blocks, 0);
    assert_eq!(fs.verify_all().unwrap(), 2);
    assert!(!fs.is_withdrawn());
}

#[test]
fn remove_merges_into_predecessor() {
    let fs = mem_fs(4096, 1, 256);
    let ino = new_file(&fs);
    for (name, value) in [("one", "1"), ("two", "22"), ("three", "333")] {
        fs.ea_set(ino, &EaRequest::new(EaType::User, name.as_bytes(), value.as_bytes()))
            .unwrap();
    }
    let before = ea_records(&fs, ino);
    let recs = &before[0].1;
    assert_eq!(recs.len(), 3);
    let (one, two) = (recs[0], recs[1]);

    fs.ea_remove(ino, EaType::User, b"two").unwrap();

    let after = ea_records(&fs, ino);
    let recs = &after[0].1;
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[0].off, one.off);
    assert_eq!(recs[0].hdr.rec_len, one.hdr.rec_len + two.hdr.rec_len);

    let mut names = fs.listxattr(ino).unwrap();
    names.sort();
    assert_eq!(names, vec!["user.one", "user.three"]);
    assert_eq!(fs.ea_get(ino, EaType::User, b"three").unwrap(), b"333");
}

#[test]
fn concurrent_reservations_use_distinct_groups() {
    // three groups of eight data blocks; the first has seven free
    let fs = Arc::new(mem_fs(4096, 3, 9));
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut ip = IncoreInode::new(fs.root_addr());
                let mut res = fs.inplace_reserve(&mut ip, 6).unwrap();
                let rg = res.rgd().addr();
                // both reservations are live at once
                barrier.wait();
                let mut tr = fs.trans_begin(RES_RG_BIT + res.rgd().ri.length, 0).unwrap();
                let blocks: Vec<u64> = (0..6)
                    .map(|_| fs.alloc_data(&mut ip, &mut res, &mut tr).unwrap())
                    .collect();
                tr.end().unwrap();
                (rg, blocks)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_ne!(results[0].0, results[1].0);

    let mut seen = HashSet::new();
    for (rg, blocks) in &results {
        let rgd = fs.blk2rgrpd(*rg).unwrap();
        for &b in blocks {
            assert!(rgd.ri.contains(b));
            assert!(seen.insert(b), "block {} allocated twice", b);
            assert_eq!(fs.get_block_type(b).unwrap(), GFS2_BLKST_USED);
        }
    }
    assert_eq!(fs.statfs().free_blocks, 7 + 8 + 8 - 12);
    assert_eq!(fs.verify_all().unwrap(), 3);
}

#[test]
fn free_counter_matches_bitmap() {
    let fs = mem_fs(4096, 1, 68);
    let rgd = fs.rgrpd_get_first().unwrap();
    let mut ip = owner(&fs);
    let mut rng = StdRng::seed_from_u64(0x6f5_2019);
    let mut live: Vec<u64> = Vec::new();

    for _ in 0..300 {
        let free = fs.rgrp_header(&rgd).unwrap().free;
        if free > 0 && (live.is_empty() || rng.gen_bool(0.55)) {
            let n = rng.gen_range(1..=free.min(4));
            let (blocks, _) = alloc_n(&fs, &mut ip, n).unwrap();
            live.extend(blocks);
        } else if !live.is_empty() {
            let idx = rng.gen_range(0..live.len());
            let blk = live.swap_remove(idx);
            free_one(&fs, &ip, blk).unwrap();
        }

        // verify compares the header with a full bitmap scan
        fs.verify_all().unwrap();
        let rg = fs.rgrp_header(&rgd).unwrap();
        assert_eq!(rg.free as u64, fs.statfs().free_blocks);
        assert_eq!(rg.free, rgd.ri.data - 1 - live.len() as u32);
    }
}

#[test]
fn attribute_round_trip_mixed_storage() {
    let fs = mem_fs(512, 4, 256);
    let ino = new_file(&fs);
    let mut expected = Vec::new();
    for i in 0..12usize {
        let name = format!("attr{:02}", i);
        let value: Vec<u8> = (0..i * 150 + 3).map(|b| (b + i) as u8).collect();
        let ea_type = if i % 3 == 0 { EaType::Security } else { EaType::User };
        fs.ea_set(ino, &EaRequest::new(ea_type, name.as_bytes(), &value))
            .unwrap();
        expected.push((ea_type, name, value));
    }

    let mut names = fs.listxattr(ino).unwrap();
    names.sort();
    let mut want: Vec<String> = expected
        .iter()
        .map(|(t, n, _)| format!("{}{}", t.prefix(), n))
        .collect();
    want.sort();
    assert_eq!(names, want);

    for (t, n, v) in &expected {
        assert_eq!(&fs.ea_get(ino, *t, n.as_bytes()).unwrap(), v);
    }
    assert!(fs.stat_inode(ino).unwrap().is_ea_indirect());
    fs.verify_all().unwrap();
}

#[test]
fn removing_missing_attribute_changes_nothing() {
    let fs = mem_fs(4096, 1, 256);
    let ino = new_file(&fs);
    fs.ea_set(ino, &EaRequest::new(EaType::User, b"keep", b"v"))
        .unwrap();
    let before = fs.ea_dump_blocks(ino).unwrap();
    let di_before = fs.stat_inode(ino).unwrap();

    assert!(matches!(
        fs.ea_remove(ino, EaType::User, b"missing"),
        Err(Error::NoData)
    ));
    assert!(matches!(
        fs.ea_remove(ino, EaType::Security, b"keep"),
        Err(Error::NoData)
    ));

    assert_eq!(fs.ea_dump_blocks(ino).unwrap(), before);
    assert_eq!(fs.stat_inode(ino).unwrap(), di_before);
}

#[test]
fn exact_fit_value_is_stuffed() {
    let fs = mem_fs(4096, 1, 256);
    let jbsize = fs.geo.jbsize as usize;
    let ino = new_file(&fs);
    let value = vec![b'z'; jbsize - EaHeader::SIZE - 4];
    fs.ea_set(ino, &EaRequest::new(EaType::User, b"edge", &value))
        .unwrap();
    let recs = ea_records(&fs, ino);
    assert!(recs[0].1[0].hdr.is_stuffed());
    assert_eq!(recs[0].1[0].hdr.rec_len as usize, jbsize);

    let bigger = vec![b'z'; value.len() + 1];
    fs.ea_set(ino, &EaRequest::new(EaType::User, b"edge", &bigger))
        .unwrap();
    assert_eq!(fs.ea_get(ino, EaType::User, b"edge").unwrap(), bigger);
}

#[test]
fn remove_inode_returns_attribute_blocks() {
    let fs = mem_fs(512, 2, 256);
    let before = fs.statfs();
    let ino = new_file(&fs);
    for i in 0..8 {
        let name = format!("n{}", i);
        fs.ea_set(ino, &EaRequest::new(EaType::User, name.as_bytes(), &vec![i as u8; 400 * i + 1]))
            .unwrap();
    }
    fs.remove_inode(ino).unwrap();

    let after = fs.statfs();
    assert_eq!(after.free_blocks, before.free_blocks);
    assert_eq!(after.dinodes, before.dinodes);
    assert_eq!(fs.verify_all().unwrap(), 2);
}

#[test]
fn image_file_persists_attributes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fs.img");
    let opts = MkfsOptions {
        block_size: 1024,
        rgrp_blocks: 256,
        journals: 2,
        max_rgrps: 8,
        locktable: "cluster:img".into(),
    };
    let dev = FileDevice::create(&path, 1024, mkfs::layout_blocks(&opts, 3)).unwrap();
    mkfs::mkfs(&dev, &opts).unwrap();
    drop(dev);

    let ino = {
        let fs = Gfs2Fs::open(&path, MountArgs::default()).unwrap();
        let ino = new_file(&fs);
        fs.setxattr(ino, "user.origin", b"host-a", SetFlags::Create)
            .unwrap();
        fs.sync().unwrap();
        ino
    };

    let fs = Gfs2Fs::open(&path, MountArgs::default()).unwrap();
    assert_eq!(fs.sb.locktable, "cluster:img");
    assert_eq!(fs.journals(), 2);
    assert_eq!(fs.getxattr(ino, "user.origin").unwrap(), b"host-a");
    assert_eq!(fs.statfs().rgrps, 3);
    fs.verify_all().unwrap();
}

#[test]
fn nodes_sharing_a_device_never_allocate_the_same_block() {
    let dev = mem_device(4096, 1, 64, 2);
    let lm: Arc<dyn LockManager> = Arc::new(LocalLockManager::new());
    let a = node(&dev, &lm, 0);
    let b = node(&dev, &lm, 1);

    let mut blocks = HashSet::new();
    for round in 0..3 {
        for fs in [&a, &b] {
            let mut ip = owner(fs);
            let (got, _) = alloc_n(fs, &mut ip, 2).unwrap();
            for blk in got {
                assert!(blocks.insert(blk), "round {}: block {} handed out twice", round, blk);
            }
        }
    }

    let fresh = Gfs2Fs::mount(Arc::clone(&dev), MountArgs::default()).unwrap();
    assert_eq!(fresh.verify_all().unwrap(), 1);
    let rgd = fresh.rgrpd_get_first().unwrap();
    assert_eq!(fresh.rgrp_header(&rgd).unwrap().free, rgd.ri.data - 1 - 12);
    for blk in blocks {
        assert_eq!(fresh.get_block_type(blk).unwrap(), GFS2_BLKST_USED);
    }
}

#[test]
fn attribute_set_on_one_node_is_seen_by_another() {
    let dev = mem_device(4096, 2, 128, 2);
    let lm: Arc<dyn LockManager> = Arc::new(LocalLockManager::new());
    let a = node(&dev, &lm, 0);
    let b = node(&dev, &lm, 1);

    let ino = new_file(&a);
    // b caches the inode before it has any attributes
    assert!(b.listxattr(ino).unwrap().is_empty());

    a.setxattr(ino, "user.k", b"v", SetFlags::Create).unwrap();
    assert_eq!(b.getxattr(ino, "user.k").unwrap(), b"v");

    b.setxattr(ino, "user.big", &vec![3u8; 9000], SetFlags::Create)
        .unwrap();
    let mut names = a.listxattr(ino).unwrap();
    names.sort();
    assert_eq!(names, vec!["user.big", "user.k"]);
    assert_eq!(a.getxattr(ino, "user.big").unwrap(), vec![3u8; 9000]);

    a.removexattr(ino, "user.k").unwrap();
    assert!(matches!(b.getxattr(ino, "user.k"), Err(Error::NoData)));

    let fresh = Gfs2Fs::mount(Arc::clone(&dev), MountArgs::default()).unwrap();
    assert_eq!(fresh.verify_all().unwrap(), 2);
}

#[test]
fn bad_free_run_leaves_disk_untouched() {
    let dev = mem_device(4096, 1, 200, 1);
    let fs = Gfs2Fs::mount(Arc::clone(&dev), MountArgs::default()).unwrap();
    let mut ip = owner(&fs);
    let (blocks, _) = alloc_n(&fs, &mut ip, 1).unwrap();
    let blk = blocks[0];
    assert_eq!(fs.get_block_type(blk + 1).unwrap(), GFS2_BLKST_FREE);

    let err = {
        let mut rlist = fs.rlist_new().unwrap();
        rlist.add(blk).unwrap();
        rlist.lock().unwrap();
        let mut tr = fs.trans_begin(RES_RG_BIT + rlist.total_length(), 0).unwrap();
        // the second block of the run is already free
        fs.free_data(&ip, blk, 2, &mut tr).unwrap_err()
    };
    assert!(err.is_consistency());
    assert!(fs.is_withdrawn());
    assert!(matches!(alloc_n(&fs, &mut ip, 1), Err(Error::Withdrawn)));

    let fresh = Gfs2Fs::mount(dev, MountArgs::default()).unwrap();
    assert_eq!(fresh.verify_all().unwrap(), 1);
    assert_eq!(fresh.get_block_type(blk).unwrap(), GFS2_BLKST_USED);
}
