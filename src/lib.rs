//! gfs2-tools: resource-group block allocation and extended attributes for
//! GFS2 filesystem images
//!
//! This library formats, mounts and modifies GFS2-layout images in user
//! space: reserving and allocating blocks from resource groups, and storing
//! extended attributes on inodes.

pub mod types;
pub mod error;
pub mod config;
pub mod device;
pub mod meta_io;
pub mod glock;
pub mod trans;
pub mod quota;
pub mod bitmap;
pub mod rgrp;
pub mod alloc;
pub mod file;
pub mod inode;
pub mod fs;
pub mod mkfs;
pub mod ea_block;
pub mod eattr;
pub mod xattr;

pub use config::{ErrorsMode, MkfsOptions, MountArgs};
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use eattr::{EaRequest, SetFlags};
pub use error::{Error, Result};
pub use fs::{FsStats, Gfs2Fs};
pub use types::*;
