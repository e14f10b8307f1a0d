//! Mount and format options

use crate::error::{Error, Result};
use crate::types::{Geometry, GFS2_MAX_BSIZE, GFS2_MIN_BSIZE};

/// What to do when metadata is found to be inconsistent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ErrorsMode {
    /// Refuse further mutation on this instance
    #[default]
    Withdraw,
    /// Halt the process
    Panic,
}

/// Per-instance mount options
#[derive(Debug, Clone)]
pub struct MountArgs {
    /// Journal id of this node; selects the starting resource group
    pub jid: u32,
    /// Overrides the superblock's journal count
    pub journals: Option<u32>,
    pub errors: ErrorsMode,
    /// Name used in log messages
    pub fsname: String,
}

impl Default for MountArgs {
    fn default() -> Self {
        MountArgs {
            jid: 0,
            journals: None,
            errors: ErrorsMode::Withdraw,
            fsname: "gfs2".to_string(),
        }
    }
}

/// Options for formatting a new image
#[derive(Debug, Clone)]
pub struct MkfsOptions {
    pub block_size: u32,
    /// Blocks per resource group, header and bitmaps included
    pub rgrp_blocks: u32,
    pub journals: u32,
    /// Resource index capacity, in groups, so the image can grow later
    pub max_rgrps: u32,
    pub locktable: String,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        MkfsOptions {
            block_size: 4096,
            rgrp_blocks: 8192,
            journals: 1,
            max_rgrps: 64,
            locktable: String::new(),
        }
    }
}

impl MkfsOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || !(GFS2_MIN_BSIZE..=GFS2_MAX_BSIZE).contains(&self.block_size)
        {
            return Err(Error::Invalid(format!(
                "block size {} must be a power of two between {} and {}",
                self.block_size, GFS2_MIN_BSIZE, GFS2_MAX_BSIZE
            )));
        }
        // At least one header block plus a full bitmap byte of data
        if self.rgrp_blocks < 5 {
            return Err(Error::Invalid(format!(
                "resource group of {} blocks is too small",
                self.rgrp_blocks
            )));
        }
        if self.journals == 0 {
            return Err(Error::Invalid("at least one journal is required".into()));
        }
        if self.max_rgrps == 0 {
            return Err(Error::Invalid("resource index capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// Split a resource group of `rgrp_blocks` into header/bitmap blocks and
    /// data blocks. Data is kept a multiple of four so every bitmap byte is
    /// fully used.
    pub fn rgrp_layout(&self, total: u32) -> Option<(u32, u32)> {
        let geo = Geometry::new(self.block_size);
        let mut length = 1u32;
        loop {
            if length >= total {
                return None;
            }
            let data = (total - length) & !3;
            if data == 0 {
                return None;
            }
            let capacity = geo.header_bitbytes() + (length - 1) * geo.bitmap_bitbytes();
            if capacity * 4 >= data {
                return Some((length, data));
            }
            length += 1;
        }
    }
}
