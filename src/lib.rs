//! alphafs: a block-addressed file system kept entirely inside a flat array
//! of fixed-size blocks.
//!
//! ```text
//! Block 0..D:   System descriptor (volume geometry, root, free-list head)
//! Block D:      Root directory entry (first allocation)
//! Block D+E..:  Entries, payloads and free runs, in any order
//! ```
//!
//! Free space is a circular doubly-linked list whose nodes live in the first
//! block of the run they describe. Entries reference each other only by
//! block location; every operation re-reads what it needs from the device.
#![cfg_attr(not(any(test, feature = "std")), no_std)]
extern crate alloc;

pub mod block_dev;
pub mod common;
pub mod config;
pub mod fs;
pub mod fs_common;
pub mod layout;
pub mod path;

mod free_space;

#[cfg(feature = "std")]
pub mod shell;

#[cfg(test)]
mod alphafs_test;

pub use block_dev::{BlockDevice, RamDisk};
#[cfg(feature = "std")]
pub use block_dev::FileDisk;
pub use common::{Access, AlphaError, AlphaResult, BlockLoc, Clock, EntryKind, FixedClock, Permission};
#[cfg(feature = "std")]
pub use common::SystemClock;
pub use config::AlphaConfig;
pub use free_space::FreeRun;
pub use fs::{AlphaFs, Metadata, MountKind};
pub use fs_common::{ConsistencyReport, FsStat};

/// Name of the root directory; every absolute path starts with it.
pub const ROOT_NAME: &str = "root";

/// Child slots in a directory entry.
pub const NUMBER_OF_CHILDREN: usize = 64;

/// Smallest block that still holds a whole free-space node.
pub const MIN_BLOCK_SIZE: u32 = 64;

#[cfg(feature = "blk4k")]
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

#[cfg(all(feature = "blk1k", not(feature = "blk4k")))]
pub const DEFAULT_BLOCK_SIZE: u32 = 1024;

#[cfg(not(any(feature = "blk1k", feature = "blk4k")))]
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

#[macro_export]
macro_rules! u32 {
    ($x:expr) => {{
        let mut raw = [0u8; 4];
        raw.copy_from_slice($x);
        u32::from_be_bytes(raw)
    }};
}

#[macro_export]
macro_rules! u64 {
    ($x:expr) => {{
        let mut raw = [0u8; 8];
        raw.copy_from_slice($x);
        u64::from_be_bytes(raw)
    }};
}
