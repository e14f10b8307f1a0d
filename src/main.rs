//! CLI tools for GFS2 filesystem images

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use gfs2_tools::ea_block;
use gfs2_tools::*;
use log::{debug, info};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "gfs2")]
#[command(about = "Allocate blocks and manage extended attributes on GFS2 images")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(flatten)]
    mount: MountOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct MountOpts {
    /// Journal id of this node
    #[arg(long, global = true, default_value_t = 0)]
    jid: u32,

    /// Override the journal count used to spread allocations
    #[arg(long, global = true)]
    journals: Option<u32>,

    /// What to do on a metadata consistency error
    #[arg(long, global = true, value_enum, default_value_t = ErrorsMode::Withdraw)]
    errors: ErrorsMode,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new filesystem
    Mkfs {
        /// Filesystem image path
        image: PathBuf,

        /// Size in bytes (e.g., 1M, 10M, 100M)
        #[arg(short, long)]
        size: String,

        /// Block size in bytes
        #[arg(short, long, default_value_t = GFS2_DEFAULT_BSIZE)]
        block_size: u32,

        /// Blocks per resource group
        #[arg(short, long, default_value_t = 8192)]
        rgrp_blocks: u32,

        /// Number of journals
        #[arg(short, long, default_value_t = 1)]
        journals: u32,

        /// Resource groups the index can hold, for later growth
        #[arg(long, default_value_t = 64)]
        max_rgrps: u32,

        /// Cluster lock table name
        #[arg(short = 't', long, default_value = "")]
        locktable: String,
    },

    /// Show superblock and resource group information
    Info {
        /// Filesystem image path
        #[arg(short, long)]
        image: PathBuf,

        /// Check every group's counters against its bitmap
        #[arg(long)]
        verify: bool,
    },

    /// Show filesystem statistics
    Df {
        /// Filesystem image path
        #[arg(short, long)]
        image: PathBuf,

        /// Human-readable sizes
        #[arg(short = 'H', long)]
        human: bool,
    },

    /// Create an empty inode under the root directory
    Touch {
        /// Filesystem image path
        #[arg(short, long)]
        image: PathBuf,

        /// File mode, in octal
        #[arg(short, long, default_value = "644")]
        mode: String,

        #[arg(long, default_value_t = 0)]
        uid: u32,

        #[arg(long, default_value_t = 0)]
        gid: u32,
    },

    /// Set an extended attribute
    Setfattr {
        /// Filesystem image path
        #[arg(short, long)]
        image: PathBuf,

        /// Inode address
        inode: u64,

        /// Attribute name, e.g. user.comment
        #[arg(short, long)]
        name: String,

        /// Attribute value (reads from stdin if not provided)
        #[arg(short, long)]
        value: Option<String>,

        /// Fail if the attribute exists
        #[arg(long, conflicts_with = "replace")]
        create: bool,

        /// Fail if the attribute does not exist
        #[arg(long)]
        replace: bool,
    },

    /// Print an extended attribute value
    Getfattr {
        /// Filesystem image path
        #[arg(short, long)]
        image: PathBuf,

        /// Inode address
        inode: u64,

        /// Attribute name
        #[arg(short, long)]
        name: String,

        /// Print the value as hex
        #[arg(short = 'x', long)]
        hex: bool,
    },

    /// List extended attribute names
    Listfattr {
        /// Filesystem image path
        #[arg(short, long)]
        image: PathBuf,

        /// Inode address
        inode: u64,
    },

    /// Remove an extended attribute
    Rmfattr {
        /// Filesystem image path
        #[arg(short, long)]
        image: PathBuf,

        /// Inode address
        inode: u64,

        /// Attribute name
        #[arg(short, long)]
        name: String,
    },

    /// Remove an inode and its attributes
    Rminode {
        /// Filesystem image path
        #[arg(short, long)]
        image: PathBuf,

        /// Inode address
        inode: u64,
    },

    /// Dump the attribute blocks of an inode
    Eadump {
        /// Filesystem image path
        #[arg(short, long)]
        image: PathBuf,

        /// Inode address
        inode: u64,
    },

    /// Grow the filesystem by appending resource groups
    Grow {
        /// Filesystem image path
        #[arg(short, long)]
        image: PathBuf,

        /// New size in bytes (e.g., 100M)
        #[arg(short, long)]
        size: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let args = MountArgs {
        jid: cli.mount.jid,
        journals: cli.mount.journals,
        errors: cli.mount.errors,
        ..Default::default()
    };

    match cli.command {
        Commands::Mkfs {
            image,
            size,
            block_size,
            rgrp_blocks,
            journals,
            max_rgrps,
            locktable,
        } => {
            let opts = MkfsOptions {
                block_size,
                rgrp_blocks,
                journals,
                max_rgrps,
                locktable,
            };
            cmd_mkfs(&image, &size, &opts)
        }
        Commands::Info { image, verify } => cmd_info(&image, args, verify),
        Commands::Df { image, human } => cmd_df(&image, args, human),
        Commands::Touch {
            image,
            mode,
            uid,
            gid,
        } => cmd_touch(&image, args, &mode, uid, gid),
        Commands::Setfattr {
            image,
            inode,
            name,
            value,
            create,
            replace,
        } => {
            let flags = if create {
                SetFlags::Create
            } else if replace {
                SetFlags::Replace
            } else {
                SetFlags::Any
            };
            cmd_setfattr(&image, args, inode, &name, value, flags)
        }
        Commands::Getfattr {
            image,
            inode,
            name,
            hex,
        } => cmd_getfattr(&image, args, inode, &name, hex),
        Commands::Listfattr { image, inode } => cmd_listfattr(&image, args, inode),
        Commands::Rmfattr { image, inode, name } => cmd_rmfattr(&image, args, inode, &name),
        Commands::Rminode { image, inode } => cmd_rminode(&image, args, inode),
        Commands::Eadump { image, inode } => cmd_eadump(&image, args, inode),
        Commands::Grow { image, size } => cmd_grow(&image, args, &size),
    }
}

fn open(image: &Path, args: MountArgs) -> Result<Gfs2Fs> {
    debug!("opening {}", image.display());
    Gfs2Fs::open(image, args)
        .with_context(|| format!("Failed to open filesystem image: {}", image.display()))
}

/// Refuse addresses that are not dinodes before touching them as inodes
fn check_inode(fs: &Gfs2Fs, addr: u64) -> Result<()> {
    let state = fs
        .get_block_type(addr)
        .with_context(|| format!("Block {} is not an inode", addr))?;
    if state != GFS2_BLKST_DINODE {
        bail!(
            "Block {} is not an inode ({})",
            addr,
            gfs2_tools::bitmap::state_name(state)
        );
    }
    Ok(())
}

fn cmd_mkfs(image: &Path, size: &str, opts: &MkfsOptions) -> Result<()> {
    let size_bytes = parse_size(size)?;
    opts.validate()?;
    let blocks = size_bytes / opts.block_size as u64;

    let dev = FileDevice::create(image, opts.block_size, blocks)
        .with_context(|| format!("Cannot create '{}'", image.display()))?;
    let sb = gfs2_tools::mkfs::mkfs(&dev, opts)?;

    let fs = Gfs2Fs::mount(std::sync::Arc::new(dev), MountArgs::default())?;
    let stats = fs.statfs();

    println!("Created GFS2 filesystem on {}", image.display());
    println!("  Block size: {} bytes", sb.bsize);
    println!("  Journals: {}", sb.journals);
    println!("  Resource groups: {}", stats.rgrps);
    println!("  Data blocks: {}", stats.total_blocks);
    println!("  Free blocks: {}", stats.free_blocks);
    println!("  Root inode: {}", sb.root_addr);

    Ok(())
}

fn cmd_info(image: &Path, args: MountArgs, verify: bool) -> Result<()> {
    let fs = open(image, args)?;
    let sb = &fs.sb;

    println!("Superblock information for {}", image.display());
    println!("  Format: {}", sb.fs_format);
    println!("  Block size: {}", sb.bsize);
    println!("  Journals: {}", sb.journals);
    println!("  Resource index: block {}", sb.rindex_addr);
    println!("  Root inode: block {}", sb.root_addr);
    if !sb.locktable.is_empty() {
        println!("  Lock table: {}", sb.locktable);
    }
    println!();
    println!("Resource groups:");
    println!("  {:>10} {:>6} {:>10} {:>8} {:>8} {:>8}", "Addr", "Length", "Data0", "Data", "Free", "Dinodes");

    let mut next = fs.rgrpd_get_first();
    while let Some(rgd) = next {
        let rg = fs.rgrp_header(&rgd)?;
        println!(
            "  {:>10} {:>6} {:>10} {:>8} {:>8} {:>8}",
            rgd.ri.addr, rgd.ri.length, rgd.ri.data0, rgd.ri.data, rg.free, rg.dinodes
        );
        next = fs.rgrpd_get_next(&rgd);
    }

    if verify {
        let checked = fs.verify_all().context("Resource group verification failed")?;
        println!();
        println!("Verified {} resource groups", checked);
    }

    Ok(())
}

fn cmd_df(image: &Path, args: MountArgs, human: bool) -> Result<()> {
    let fs = open(image, args)?;
    let stats = fs.statfs();

    let used = stats.total_blocks - stats.free_blocks;
    let use_percent = if stats.total_blocks > 0 {
        (used as f64 / stats.total_blocks as f64 * 100.0) as u32
    } else {
        0
    };

    if human {
        println!("Filesystem      Size  Used Avail Use%");
        println!(
            "{:<15} {:>5} {:>5} {:>5} {:>3}%",
            image.display(),
            format_size(stats.total_size()),
            format_size(stats.used_size()),
            format_size(stats.free_size()),
            use_percent
        );
    } else {
        println!("Filesystem      Blocks   Used   Avail Use%");
        println!(
            "{:<15} {:>6} {:>6} {:>7} {:>3}%",
            image.display(),
            stats.total_blocks,
            used,
            stats.free_blocks,
            use_percent
        );
    }

    println!();
    println!("Inodes: {}, resource groups: {}", stats.dinodes, stats.rgrps);

    Ok(())
}

fn cmd_touch(image: &Path, args: MountArgs, mode: &str, uid: u32, gid: u32) -> Result<()> {
    let perm = u32::from_str_radix(mode, 8).with_context(|| format!("Invalid mode: {}", mode))?;
    if perm & !0o7777 != 0 {
        bail!("Invalid mode: {}", mode);
    }

    let fs = open(image, args)?;
    let addr = fs.create_inode(fs.root_addr(), mode::S_IFREG | perm, uid, gid)?;
    fs.sync()?;
    println!("{}", addr);
    Ok(())
}

fn cmd_setfattr(
    image: &Path,
    args: MountArgs,
    inode: u64,
    name: &str,
    value: Option<String>,
    flags: SetFlags,
) -> Result<()> {
    let value = match value {
        Some(v) => v.into_bytes(),
        None => {
            use std::io::Read;
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };

    let fs = open(image, args)?;
    check_inode(&fs, inode)?;
    fs.setxattr(inode, name, &value, flags)
        .with_context(|| format!("Cannot set {} on inode {}", name, inode))?;
    fs.sync()?;
    info!("set {} ({} bytes) on inode {}", name, value.len(), inode);
    Ok(())
}

fn cmd_getfattr(image: &Path, args: MountArgs, inode: u64, name: &str, hex: bool) -> Result<()> {
    let fs = open(image, args)?;
    check_inode(&fs, inode)?;
    let value = fs
        .getxattr(inode, name)
        .with_context(|| format!("Cannot get {} from inode {}", name, inode))?;

    if hex {
        let text: String = value.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{}=0x{}", name, text);
    } else {
        println!("{}=\"{}\"", name, String::from_utf8_lossy(&value));
    }
    Ok(())
}

fn cmd_listfattr(image: &Path, args: MountArgs, inode: u64) -> Result<()> {
    let fs = open(image, args)?;
    check_inode(&fs, inode)?;
    for name in fs.listxattr(inode)? {
        println!("{}", name);
    }
    Ok(())
}

fn cmd_rmfattr(image: &Path, args: MountArgs, inode: u64, name: &str) -> Result<()> {
    let fs = open(image, args)?;
    check_inode(&fs, inode)?;
    fs.removexattr(inode, name)
        .with_context(|| format!("Cannot remove {} from inode {}", name, inode))?;
    fs.sync()?;
    Ok(())
}

fn cmd_rminode(image: &Path, args: MountArgs, inode: u64) -> Result<()> {
    let fs = open(image, args)?;
    check_inode(&fs, inode)?;
    fs.remove_inode(inode)
        .with_context(|| format!("Cannot remove inode {}", inode))?;
    fs.sync()?;
    Ok(())
}

fn cmd_eadump(image: &Path, args: MountArgs, inode: u64) -> Result<()> {
    let fs = open(image, args)?;
    check_inode(&fs, inode)?;
    let blocks = fs.ea_dump_blocks(inode)?;
    if blocks.is_empty() {
        println!("Inode {} has no attributes", inode);
        return Ok(());
    }

    for (blkno, data) in &blocks {
        let hdr = MetaHeader::from_bytes(data);
        match hdr.mh_type {
            GFS2_METATYPE_IN => {
                println!("Block {}: indirect", blkno);
                for (i, ptr) in ea_block::indirect_ptrs(data, fs.geo.inptrs).iter().enumerate() {
                    println!("  [{}] -> {}", i, ptr);
                }
            }
            GFS2_METATYPE_EA => {
                println!("Block {}: attributes", blkno);
                for rec in ea_block::records(data, *blkno) {
                    let rec = rec?;
                    let kind = EaType::from_raw(rec.hdr.ea_type)
                        .map(|t| t.prefix())
                        .unwrap_or("unused");
                    println!(
                        "  @{:<5} len {:<5} {}{} data {}{}{}",
                        rec.off,
                        rec.hdr.rec_len,
                        kind,
                        String::from_utf8_lossy(rec.name(data)),
                        rec.hdr.data_len,
                        if rec.hdr.is_stuffed() {
                            String::new()
                        } else {
                            format!(" ptrs {:?}", rec.data_ptrs(data))
                        },
                        if rec.hdr.is_last() { " last" } else { "" }
                    );
                }
            }
            t => println!("Block {}: unexpected metadata type {}", blkno, t),
        }
    }
    Ok(())
}

fn cmd_grow(image: &Path, args: MountArgs, size: &str) -> Result<()> {
    let fs = open(image, args)?;
    let new_blocks = parse_size(size)? / fs.block_size() as u64;
    let added = fs.grow(new_blocks)?;
    fs.sync()?;

    let stats = fs.statfs();
    println!("Added {} resource groups", added);
    println!("  Resource groups: {}", stats.rgrps);
    println!("  Data blocks: {}", stats.total_blocks);
    Ok(())
}

fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num_str, multiplier) = if s.ends_with('K') || s.ends_with('k') {
        (&s[..s.len() - 1], 1024u64)
    } else if s.ends_with('M') || s.ends_with('m') {
        (&s[..s.len() - 1], 1024 * 1024)
    } else if s.ends_with('G') || s.ends_with('g') {
        (&s[..s.len() - 1], 1024 * 1024 * 1024)
    } else {
        (s, 1)
    };

    let num: u64 = num_str.parse().with_context(|| format!("Invalid size: {}", s))?;
    Ok(num * multiplier)
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.1}G", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.1}M", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1}K", bytes as f64 / 1024.0)
    } else {
        format!("{}B", bytes)
    }
}
