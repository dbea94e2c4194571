//! On-disk structures and their byte layout.
//!
//! All integers are big-endian at fixed offsets. Each structure occupies
//! `ceil(size / block_size)` whole blocks; the unused tail is zero.

use alloc::{string::String, vec::Vec};

use crate::{
    common::{AlphaError, AlphaResult, BlockLoc, EntryKind, Permission},
    MIN_BLOCK_SIZE, NUMBER_OF_CHILDREN,
};

pub const SYSTEM_SIGNATURE1: u64 = 0x11B3_DF89_400A_8A4E;
pub const SYSTEM_SIGNATURE2: u64 = 0x88AA_DF38_E990_4DBC;
pub const FREE_SIGNATURE1: u64 = 0xA9F3_589E_2BB4_C421;
pub const FREE_SIGNATURE2: u64 = 0x2B99_14DF_430A_8E83;
pub const ENTRY_SIGNATURE1: u64 = 0x6512_F67E_D9EF_96A6;
pub const ENTRY_SIGNATURE2: u64 = 0x45A7_D995_E6BB_8322;

/// Length of the name buffers, including the terminating NUL.
pub const NAME_LENGTH: usize = 256;
/// Length of the entry identifier buffer, including the terminating NUL.
pub const ID_LENGTH: usize = 64;

pub const DESCRIPTOR_SIZE: usize = 304;
pub const FREE_NODE_SIZE: usize = 40;
pub const ENTRY_SIZE: usize = 888;

const CHILDREN_OFFSET: usize = 368;

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    crate::u64!(&buf[offset..offset + 8])
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    crate::u32!(&buf[offset..offset + 4])
}

/// Writes `name` into a zeroed fixed buffer, always leaving a trailing NUL.
fn put_name(buf: &mut [u8], name: &str) {
    buf.fill(0);
    let len = name.len().min(buf.len() - 1);
    buf[..len].copy_from_slice(&name.as_bytes()[..len]);
}

fn get_name(buf: &[u8]) -> String {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// Checks that `name` fits in an entry's name buffer and is a single path segment.
pub fn validate_name(name: &str) -> AlphaResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(AlphaError::InvalidName(name.into()));
    }
    if name.contains('/') || name.contains('\0') || name.len() >= NAME_LENGTH {
        return Err(AlphaError::InvalidName(name.into()));
    }
    Ok(())
}

/// Sizes of the on-disk structures in blocks, for one block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    pub total_blocks: u64,
    pub descriptor_blocks: u64,
    pub entry_blocks: u64,
    pub free_node_blocks: u64,
}

impl Geometry {
    pub fn new(block_size: u32, total_blocks: u64) -> AlphaResult<Self> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(AlphaError::Geometry("block size too small for a free-space node"));
        }
        let blocks_for = |bytes: usize| (bytes as u64).div_ceil(block_size as u64);
        let geometry = Self {
            block_size,
            total_blocks,
            descriptor_blocks: blocks_for(DESCRIPTOR_SIZE),
            entry_blocks: blocks_for(ENTRY_SIZE),
            free_node_blocks: blocks_for(FREE_NODE_SIZE),
        };
        // descriptor, root entry and at least one spare block
        if total_blocks <= geometry.descriptor_blocks + geometry.entry_blocks {
            return Err(AlphaError::Geometry("volume too small for descriptor and root"));
        }
        Ok(geometry)
    }

    /// Blocks needed to hold `bytes` bytes of payload.
    pub fn blocks_for(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.block_size as u64)
    }

    pub fn bytes_for(&self, blocks: u64) -> usize {
        blocks as usize * self.block_size as usize
    }
}

/// Block 0: everything needed to find the rest of the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemDescriptor {
    pub volume_name: String,
    pub volume_size: u64,
    pub block_size: u32,
    pub free_head: BlockLoc,
    pub root: BlockLoc,
}

impl SystemDescriptor {
    pub fn new(volume_name: &str, volume_size: u64, block_size: u32) -> Self {
        Self {
            volume_name: volume_name.into(),
            volume_size,
            block_size,
            free_head: 0,
            root: 0,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf.fill(0);
        put_u64(buf, 0, SYSTEM_SIGNATURE1);
        put_u64(buf, 8, self.volume_size);
        put_u64(buf, 16, self.free_head);
        put_u64(buf, 24, self.root);
        put_name(&mut buf[32..32 + NAME_LENGTH], &self.volume_name);
        put_u32(buf, 288, self.block_size);
        put_u64(buf, 296, SYSTEM_SIGNATURE2);
    }

    /// Returns `None` when the signatures do not match.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if get_u64(buf, 0) != SYSTEM_SIGNATURE1 || get_u64(buf, 296) != SYSTEM_SIGNATURE2 {
            return None;
        }
        Some(Self {
            volume_size: get_u64(buf, 8),
            free_head: get_u64(buf, 16),
            root: get_u64(buf, 24),
            volume_name: get_name(&buf[32..32 + NAME_LENGTH]),
            block_size: get_u32(buf, 288),
        })
    }
}

/// One run of free blocks, stored in the run's first block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeNode {
    pub next: BlockLoc,
    pub prev: BlockLoc,
    pub count: u64,
}

impl FreeNode {
    pub fn encode(&self, buf: &mut [u8]) {
        buf.fill(0);
        put_u64(buf, 0, FREE_SIGNATURE1);
        put_u64(buf, 8, self.next);
        put_u64(buf, 16, self.prev);
        put_u64(buf, 24, self.count);
        put_u64(buf, 32, FREE_SIGNATURE2);
    }

    pub fn decode(buf: &[u8], loc: BlockLoc) -> AlphaResult<Self> {
        if get_u64(buf, 0) != FREE_SIGNATURE1 || get_u64(buf, 32) != FREE_SIGNATURE2 {
            return Err(AlphaError::Corrupt(loc, "free-space node"));
        }
        Ok(Self {
            next: get_u64(buf, 8),
            prev: get_u64(buf, 16),
            count: get_u64(buf, 24),
        })
    }
}

/// A file, directory or link record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub kind: EntryKind,
    pub name: String,
    pub id: [u8; ID_LENGTH],
    pub permission: Permission,
    pub modified: u64,
    pub created: u64,
    pub size: u64,
    pub starting_block: BlockLoc,
    /// Occupied child slots, packed from slot 0.
    pub children: Vec<BlockLoc>,
}

impl TreeEntry {
    /// Signatures only; every other field at its lowest value.
    pub fn blank() -> Self {
        Self {
            kind: EntryKind::File,
            name: String::new(),
            id: [0; ID_LENGTH],
            permission: Permission::Read,
            modified: 0,
            created: 0,
            size: 0,
            starting_block: 0,
            children: Vec::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.children.len() >= NUMBER_OF_CHILDREN
    }

    pub fn id_str(&self) -> String {
        get_name(&self.id)
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf.fill(0);
        put_u64(buf, 0, ENTRY_SIGNATURE1);
        buf[8] = self.kind.bits();
        buf[9] = self.permission.bits();
        put_name(&mut buf[16..16 + NAME_LENGTH], &self.name);
        buf[272..272 + ID_LENGTH].copy_from_slice(&self.id);
        put_u64(buf, 336, self.modified);
        put_u64(buf, 344, self.created);
        put_u64(buf, 352, self.size);
        put_u64(buf, 360, self.starting_block);
        for (slot, child) in self.children.iter().take(NUMBER_OF_CHILDREN).enumerate() {
            put_u64(buf, CHILDREN_OFFSET + slot * 8, *child);
        }
        put_u64(buf, 880, ENTRY_SIGNATURE2);
    }

    pub fn decode(buf: &[u8], loc: BlockLoc) -> AlphaResult<Self> {
        if get_u64(buf, 0) != ENTRY_SIGNATURE1 || get_u64(buf, 880) != ENTRY_SIGNATURE2 {
            return Err(AlphaError::Corrupt(loc, "tree entry"));
        }
        let slots = (0..NUMBER_OF_CHILDREN).map(|slot| get_u64(buf, CHILDREN_OFFSET + slot * 8));
        let mut children = Vec::new();
        let mut seen_empty = false;
        for child in slots {
            match (child, seen_empty) {
                (0, _) => seen_empty = true,
                (_, false) => children.push(child),
                // occupied slot behind an empty one
                (_, true) => return Err(AlphaError::Corrupt(loc, "packed child array")),
            }
        }
        let mut id = [0u8; ID_LENGTH];
        id.copy_from_slice(&buf[272..272 + ID_LENGTH]);
        Ok(Self {
            kind: EntryKind::from_bits(buf[8]),
            name: get_name(&buf[16..16 + NAME_LENGTH]),
            id,
            permission: Permission::from_bits(buf[9]),
            modified: get_u64(buf, 336),
            created: get_u64(buf, 344),
            size: get_u64(buf, 352),
            starting_block: get_u64(buf, 360),
            children,
        })
    }
}
