//! The mounted file system session and the tree operations on it.

use alloc::{
    boxed::Box,
    collections::BTreeSet,
    string::{String, ToString},
    vec,
    vec::Vec,
};

use log::{debug, info, warn};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::Serialize;

use crate::{
    block_dev::BlockDevice,
    common::{Access, AlphaError, AlphaResult, BlockLoc, Clock, EntryKind, Permission},
    layout::{validate_name, Geometry, SystemDescriptor, TreeEntry, ID_LENGTH, NAME_LENGTH},
    path::{self, is_within, join, normalize, segments},
    ROOT_NAME,
};

/// How the volume was brought up by `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// A valid descriptor was found and loaded.
    Existing,
    /// The volume was (re)formatted.
    Formatted,
}

/// Everything `stat` reports about an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub location: BlockLoc,
    pub kind: EntryKind,
    pub name: String,
    pub id: String,
    pub permission: Permission,
    pub modified: u64,
    pub created: u64,
    pub size: u64,
    pub starting_block: BlockLoc,
    pub children: usize,
}

/// A mounted alphafs volume.
///
/// Owns the block device and the cached system descriptor. The descriptor is
/// written back whenever the free-list head or the root changes, and again on
/// `sync`/`close`.
pub struct AlphaFs<D: BlockDevice> {
    pub(crate) device: D,
    pub(crate) descriptor: SystemDescriptor,
    pub(crate) geometry: Geometry,
    clock: Box<dyn Clock>,
    rng: SmallRng,
    mount_kind: MountKind,
}

impl<D: BlockDevice> AlphaFs<D> {
    /// Mounts the volume on `device`, formatting it when no valid descriptor is found.
    #[cfg(feature = "std")]
    pub fn open(device: D, volume_name: &str) -> AlphaResult<Self> {
        Self::open_with_clock(device, volume_name, Box::new(crate::common::SystemClock))
    }

    /// Formats `device` unconditionally.
    #[cfg(feature = "std")]
    pub fn format(device: D, volume_name: &str) -> AlphaResult<Self> {
        Self::format_with_clock(device, volume_name, Box::new(crate::common::SystemClock))
    }

    pub fn open_with_clock(device: D, volume_name: &str, clock: Box<dyn Clock>) -> AlphaResult<Self> {
        let block_size = device.block_size();
        let probe = Geometry::new(block_size, device.block_count())?;
        let mut buf = vec![0u8; probe.bytes_for(probe.descriptor_blocks)];
        device.read_blocks(0, &mut buf)?;

        let descriptor = match SystemDescriptor::decode(&buf) {
            Some(descriptor) => descriptor,
            None => {
                warn!("no valid system descriptor on the device, creating a new file system");
                return Self::format_with_clock(device, volume_name, clock);
            }
        };
        if descriptor.block_size != block_size {
            return Err(AlphaError::Geometry("descriptor block size differs from the device"));
        }
        let total_blocks = descriptor.volume_size / block_size as u64;
        if total_blocks > device.block_count() {
            return Err(AlphaError::Geometry("descriptor describes more blocks than the device has"));
        }
        let geometry = Geometry::new(block_size, total_blocks)?;
        let rng = SmallRng::seed_from_u64(clock.now());
        let fs = Self {
            device,
            descriptor,
            geometry,
            clock,
            rng,
            mount_kind: MountKind::Existing,
        };
        let root = fs.read_entry(fs.descriptor.root)?;
        if root.kind != EntryKind::Directory {
            return Err(AlphaError::NotADirectory(fs.descriptor.root));
        }
        info!(
            "mounted volume '{}': {} blocks of {} bytes, root at block {}",
            fs.descriptor.volume_name, total_blocks, block_size, fs.descriptor.root
        );
        Ok(fs)
    }

    pub fn format_with_clock(device: D, volume_name: &str, clock: Box<dyn Clock>) -> AlphaResult<Self> {
        if volume_name.len() >= NAME_LENGTH {
            return Err(AlphaError::InvalidName(volume_name.into()));
        }
        let block_size = device.block_size();
        let geometry = Geometry::new(block_size, device.block_count())?;
        let volume_size = geometry.total_blocks * block_size as u64;
        let rng = SmallRng::seed_from_u64(clock.now());
        let mut fs = Self {
            device,
            descriptor: SystemDescriptor::new(volume_name, volume_size, block_size),
            geometry,
            clock,
            rng,
            mount_kind: MountKind::Formatted,
        };

        fs.init_free_space(geometry.descriptor_blocks)?;

        let root = fs.make_blank()?;
        fs.set_kind(root, EntryKind::Directory)?;
        fs.set_default_metadata(root)?;
        fs.set_name(root, ROOT_NAME)?;
        fs.descriptor.root = root;
        fs.sync()?;

        info!(
            "formatted volume '{}': {} blocks of {} bytes, root at block {}",
            volume_name, geometry.total_blocks, block_size, root
        );
        Ok(fs)
    }

    /// Writes the descriptor and flushes the device.
    pub fn sync(&self) -> AlphaResult<()> {
        self.write_descriptor()?;
        self.device.flush()
    }

    /// Syncs and hands the device back.
    pub fn close(self) -> AlphaResult<D> {
        self.sync()?;
        debug!("closed volume '{}'", self.descriptor.volume_name);
        Ok(self.device)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn descriptor(&self) -> &SystemDescriptor {
        &self.descriptor
    }

    pub fn root(&self) -> BlockLoc {
        self.descriptor.root
    }

    pub fn mount_kind(&self) -> MountKind {
        self.mount_kind
    }

    pub fn volume_name(&self) -> &str {
        &self.descriptor.volume_name
    }

    pub(crate) fn write_descriptor(&self) -> AlphaResult<()> {
        let mut buf = vec![0u8; self.geometry.bytes_for(self.geometry.descriptor_blocks)];
        self.descriptor.encode(&mut buf);
        self.device.write_blocks(0, &buf)
    }

    pub(crate) fn read_raw(&self, loc: BlockLoc, blocks: u64) -> AlphaResult<Vec<u8>> {
        self.check_range(loc, blocks)?;
        let mut buf = vec![0u8; self.geometry.bytes_for(blocks)];
        self.device.read_blocks(loc, &mut buf)?;
        Ok(buf)
    }

    /// Writes `data` at `loc`, zero-padded to a whole number of blocks.
    pub(crate) fn write_raw(&self, loc: BlockLoc, data: &[u8]) -> AlphaResult<()> {
        let blocks = self.geometry.blocks_for(data.len() as u64);
        self.check_range(loc, blocks)?;
        let mut buf = vec![0u8; self.geometry.bytes_for(blocks)];
        buf[..data.len()].copy_from_slice(data);
        self.device.write_blocks(loc, &buf)
    }

    pub(crate) fn check_range(&self, loc: BlockLoc, blocks: u64) -> AlphaResult<()> {
        let end = loc.saturating_add(blocks);
        if end > self.geometry.total_blocks {
            return Err(AlphaError::OutOfRange(loc, end));
        }
        Ok(())
    }

    pub fn read_entry(&self, loc: BlockLoc) -> AlphaResult<TreeEntry> {
        if loc == 0 {
            return Err(AlphaError::Corrupt(loc, "tree entry"));
        }
        let buf = self.read_raw(loc, self.geometry.entry_blocks)?;
        TreeEntry::decode(&buf, loc)
    }

    pub(crate) fn write_entry(&self, loc: BlockLoc, entry: &TreeEntry) -> AlphaResult<()> {
        let mut buf = vec![0u8; self.geometry.bytes_for(self.geometry.entry_blocks)];
        entry.encode(&mut buf);
        self.device.write_blocks(loc, &buf)
    }

    /// Read-modify-write of a whole entry. Nothing is written when `f` fails.
    fn modify_entry<V>(
        &self,
        loc: BlockLoc,
        f: impl FnOnce(&mut TreeEntry) -> AlphaResult<V>,
    ) -> AlphaResult<V> {
        let mut entry = self.read_entry(loc)?;
        let value = f(&mut entry)?;
        self.write_entry(loc, &entry)?;
        Ok(value)
    }

    // ---- path resolution ----

    /// Location of the entry at `path`, or `None` when some segment is missing.
    pub fn lookup(&self, path: &str) -> AlphaResult<Option<BlockLoc>> {
        let path = normalize(path)?;
        let mut loc = self.descriptor.root;
        for name in segments(&path).skip(1) {
            match self.find_child(loc, name)? {
                Some(child) => loc = child,
                None => return Ok(None),
            }
        }
        Ok(Some(loc))
    }

    /// Like `lookup`, but a missing entry is an `InvalidPath` error.
    pub fn resolve(&self, path: &str) -> AlphaResult<BlockLoc> {
        self.lookup(path)?
            .ok_or_else(|| AlphaError::InvalidPath(path.into()))
    }

    /// Linear scan of a directory's children for `name`. Non-directories have no children.
    pub fn find_child(&self, dir: BlockLoc, name: &str) -> AlphaResult<Option<BlockLoc>> {
        let entry = self.read_entry(dir)?;
        if entry.kind != EntryKind::Directory {
            return Ok(None);
        }
        for &child in &entry.children {
            if self.read_entry(child)?.name == name {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    // ---- creation ----

    /// Creates an empty entry of `kind` at `path` and links it into its parent.
    pub fn create(&mut self, path: &str, kind: EntryKind) -> AlphaResult<BlockLoc> {
        let (parent_path, name) = path::split(path)?;
        let parent = self.resolve(&parent_path)?;
        let parent_entry = self.read_entry(parent)?;
        if parent_entry.kind != EntryKind::Directory {
            return Err(AlphaError::NotADirectory(parent));
        }
        if self.find_child(parent, &name)?.is_some() {
            return Err(AlphaError::AlreadyExists(join(&parent_path, &name)));
        }
        if parent_entry.is_full() {
            return Err(AlphaError::DirectoryFull(parent));
        }

        let loc = self.make_blank()?;
        self.set_default_metadata(loc)?;
        self.set_name(loc, &name)?;
        self.set_kind(loc, kind)?;
        self.add_child(parent, loc)?;
        debug!("created {} '{}' at block {}", kind, join(&parent_path, &name), loc);
        Ok(loc)
    }

    pub fn make_directory(&mut self, path: &str) -> AlphaResult<BlockLoc> {
        self.create(path, EntryKind::Directory)
    }

    pub fn make_file(&mut self, path: &str) -> AlphaResult<BlockLoc> {
        self.create(path, EntryKind::File)
    }

    /// Creates a link at `link_path` whose payload is the normalized `target` path.
    pub fn create_link(&mut self, link_path: &str, target: &str) -> AlphaResult<BlockLoc> {
        let target = normalize(target)?;
        let target_loc = self.resolve(&target)?;
        let kind = match self.read_entry(target_loc)?.kind {
            EntryKind::Directory | EntryKind::DirectoryLink => EntryKind::DirectoryLink,
            EntryKind::File | EntryKind::FileLink => EntryKind::FileLink,
        };
        let loc = self.create(link_path, kind)?;
        self.write_data(loc, target.as_bytes())?;
        Ok(loc)
    }

    pub fn read_link(&self, loc: BlockLoc) -> AlphaResult<String> {
        if !self.read_entry(loc)?.kind.is_link() {
            return Err(AlphaError::NotAFile(loc));
        }
        String::from_utf8(self.read_data(loc)?).map_err(|_| AlphaError::Corrupt(loc, "link target"))
    }

    /// Allocates blocks for an entry and writes a blank one there.
    fn make_blank(&mut self) -> AlphaResult<BlockLoc> {
        let loc = self.allocate_or_fail(self.geometry.entry_blocks)?;
        self.write_entry(loc, &TreeEntry::blank())?;
        Ok(loc)
    }

    /// Puts `child` into the first empty slot of `parent`; returns the new child count.
    pub(crate) fn add_child(&self, parent: BlockLoc, child: BlockLoc) -> AlphaResult<usize> {
        self.modify_entry(parent, |entry| {
            if entry.is_full() {
                return Err(AlphaError::DirectoryFull(parent));
            }
            entry.children.push(child);
            Ok(entry.children.len())
        })
    }

    /// Drops `child` from `parent`, shifting later slots left.
    pub(crate) fn remove_child(&self, parent: BlockLoc, child: BlockLoc) -> AlphaResult<()> {
        self.modify_entry(parent, |entry| {
            let slot = entry
                .children
                .iter()
                .position(|&c| c == child)
                .ok_or_else(|| {
                    AlphaError::InvalidPath(alloc::format!(
                        "block {} is not a child of block {}",
                        child, parent
                    ))
                })?;
            entry.children.remove(slot);
            Ok(())
        })
    }

    // ---- content ----

    /// Replaces the payload of a file or link with `data`.
    ///
    /// The new payload is allocated and written before the old one is released,
    /// so running out of space leaves the previous content in place.
    pub fn write_data(&mut self, loc: BlockLoc, data: &[u8]) -> AlphaResult<()> {
        let entry = self.read_entry(loc)?;
        if !entry.kind.has_payload() {
            return Err(AlphaError::NotAFile(loc));
        }
        if !entry.permission.allows(Access::WRITE) {
            return Err(AlphaError::ReadOnly(loc));
        }

        let old = self.payload_range(loc, &entry)?;

        let start = if data.is_empty() {
            0
        } else {
            let start = self.allocate_or_fail(self.geometry.blocks_for(data.len() as u64))?;
            self.write_raw(start, data)?;
            start
        };
        if let Some((old_start, old_count)) = old {
            self.release(old_start, old_count)?;
        }

        let now = self.clock.now();
        self.modify_entry(loc, |entry| {
            entry.starting_block = start;
            entry.size = data.len() as u64;
            entry.modified = now;
            Ok(())
        })?;
        debug!("wrote {} bytes to block {} (payload at {})", data.len(), loc, start);
        Ok(())
    }

    pub fn read_data(&self, loc: BlockLoc) -> AlphaResult<Vec<u8>> {
        let entry = self.read_entry(loc)?;
        if !entry.kind.has_payload() {
            return Err(AlphaError::NotAFile(loc));
        }
        if !entry.permission.allows(Access::READ) {
            return Err(AlphaError::ReadOnly(loc));
        }
        if entry.starting_block == 0 {
            return Ok(Vec::new());
        }
        let mut data = self.read_raw(entry.starting_block, self.geometry.blocks_for(entry.size))?;
        data.truncate(entry.size as usize);
        Ok(data)
    }

    /// Writes `data` to the file at `path`, creating the file when it is missing.
    pub fn write_path(&mut self, path: &str, data: &[u8]) -> AlphaResult<BlockLoc> {
        let loc = match self.lookup(path)? {
            Some(loc) => loc,
            None => self.make_file(path)?,
        };
        self.write_data(loc, data)?;
        Ok(loc)
    }

    pub fn read_path(&self, path: &str) -> AlphaResult<Vec<u8>> {
        self.read_data(self.resolve(path)?)
    }

    /// The block range holding the payload of `entry`, if it has one.
    ///
    /// Fails with `Corrupt` when the range overlaps the reserved blocks or
    /// runs past the end of the volume.
    pub(crate) fn payload_range(
        &self,
        loc: BlockLoc,
        entry: &TreeEntry,
    ) -> AlphaResult<Option<(BlockLoc, u64)>> {
        if !entry.kind.has_payload() || (entry.starting_block == 0 && entry.size == 0) {
            return Ok(None);
        }
        let start = entry.starting_block;
        let count = self.geometry.blocks_for(entry.size);
        let inside = start > 1
            && start >= self.geometry.descriptor_blocks
            && count > 0
            && self.check_range(start, count).is_ok();
        if !inside {
            return Err(AlphaError::Corrupt(loc, "payload range"));
        }
        Ok(Some((start, count)))
    }

    // ---- removal ----

    /// Every block range owned by the subtree at `loc`: entry blocks and payloads.
    ///
    /// Validates the whole subtree first; fails with `Corrupt` on a bad
    /// signature or payload range and `ReadOnly` on an entry below write
    /// permission.
    pub(crate) fn owned_ranges(&self, loc: BlockLoc) -> AlphaResult<Vec<(BlockLoc, u64)>> {
        let mut ranges = Vec::new();
        let mut visited = BTreeSet::new();
        let mut stack = vec![loc];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                return Err(AlphaError::Corrupt(current, "tree entry referenced twice"));
            }
            let entry = self.read_entry(current)?;
            if !entry.permission.allows(Access::WRITE) {
                return Err(AlphaError::ReadOnly(current));
            }
            if let Some(range) = self.payload_range(current, &entry)? {
                ranges.push(range);
            }
            if entry.kind == EntryKind::Directory {
                stack.extend(entry.children.iter().copied());
            }
            ranges.push((current, self.geometry.entry_blocks));
        }
        Ok(ranges)
    }

    /// Releases the entry at `loc` and everything below it. The parent's child
    /// slot is left alone; see `delete_path`.
    pub fn recursive_delete(&mut self, loc: BlockLoc) -> AlphaResult<()> {
        if loc == self.descriptor.root {
            return Err(AlphaError::RootEntry);
        }
        let ranges = self.owned_ranges(loc)?;
        for &(start, count) in &ranges {
            self.release(start, count)?;
        }
        debug!("deleted subtree at block {} ({} ranges)", loc, ranges.len());
        Ok(())
    }

    /// Deletes the subtree at `path` and unlinks it from its parent.
    pub fn delete_path(&mut self, path: &str) -> AlphaResult<()> {
        let loc = self.resolve(path)?;
        if loc == self.descriptor.root {
            return Err(AlphaError::RootEntry);
        }
        let parent = self.resolve(&path::parent_path(path)?)?;
        self.recursive_delete(loc)?;
        self.remove_child(parent, loc)
    }

    // ---- copy and move ----

    /// Copies the subtree at `from` to the new path `to`; returns the copy's location.
    ///
    /// A copy that fails half way is removed again before the error is returned.
    pub fn copy_path(&mut self, from: &str, to: &str) -> AlphaResult<BlockLoc> {
        if from == to {
            return Err(AlphaError::SamePath(from.into()));
        }
        let from = normalize(from)?;
        let to = normalize(to)?;
        if from == to {
            return Err(AlphaError::SamePath(from));
        }
        let source = self.resolve(&from)?;
        if self.lookup(&to)?.is_some() {
            return Err(AlphaError::AlreadyExists(to));
        }
        if is_within(&to, &from)? {
            return Err(AlphaError::IntoSelf(to));
        }

        match self.copy_tree(source, &to) {
            Ok(loc) => Ok(loc),
            Err(e) => {
                warn!("copy of '{}' to '{}' failed ({}), removing the partial copy", from, to, e);
                if let Err(undo) = self.discard_partial_copy(&to) {
                    warn!("could not remove partial copy '{}': {}", to, undo);
                }
                Err(e)
            }
        }
    }

    /// Makes every entry under `to` writable again and deletes the subtree.
    pub(crate) fn discard_partial_copy(&mut self, to: &str) -> AlphaResult<()> {
        let Some(top) = self.lookup(to)? else {
            return Ok(());
        };
        let mut stack = vec![top];
        let mut visited = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let entry = self.read_entry(current)?;
            if entry.kind == EntryKind::Directory {
                stack.extend(entry.children.iter().copied());
            }
            if entry.permission != Permission::Write {
                self.set_permission(current, Permission::Write)?;
            }
        }
        self.delete_path(to)
    }

    fn copy_tree(&mut self, source: BlockLoc, to: &str) -> AlphaResult<BlockLoc> {
        let mut stack = vec![(source, to.to_string())];
        let mut copied: Vec<(BlockLoc, Permission)> = Vec::new();
        while let Some((src, dst_path)) = stack.pop() {
            let entry = self.read_entry(src)?;
            let dst = self.create(&dst_path, entry.kind)?;
            if entry.kind.has_payload() {
                let data = self.read_data(src)?;
                self.write_data(dst, &data)?;
            } else {
                // reversed so siblings are created in slot order
                for &child in entry.children.iter().rev() {
                    let name = self.read_entry(child)?.name;
                    stack.push((child, join(&dst_path, &name)));
                }
            }
            copied.push((dst, entry.permission));
        }
        // permissions last, so a partial copy is still writable and removable
        for &(dst, permission) in &copied {
            if permission != Permission::Write {
                self.set_permission(dst, permission)?;
            }
        }
        Ok(copied[0].0)
    }

    /// Copy followed by deletion of the source. Costs time proportional to
    /// the size of the subtree.
    pub fn move_path(&mut self, from: &str, to: &str) -> AlphaResult<BlockLoc> {
        let from = normalize(from)?;
        let source = self.resolve(&from)?;
        if source == self.descriptor.root {
            return Err(AlphaError::RootEntry);
        }
        // a source that cannot be deleted must not be copied either
        self.owned_ranges(source)?;
        let moved = self.copy_path(&from, to)?;
        self.delete_path(&from)?;
        Ok(moved)
    }

    // ---- listing and metadata ----

    pub fn children(&self, dir: BlockLoc) -> AlphaResult<Vec<BlockLoc>> {
        let entry = self.read_entry(dir)?;
        if entry.kind != EntryKind::Directory {
            return Err(AlphaError::NotADirectory(dir));
        }
        Ok(entry.children)
    }

    /// Names of a directory's children in slot order.
    pub fn list_children(&self, dir: BlockLoc) -> AlphaResult<Vec<String>> {
        self.children(dir)?
            .into_iter()
            .map(|child| self.read_entry(child).map(|entry| entry.name))
            .collect()
    }

    pub fn stat(&self, loc: BlockLoc) -> AlphaResult<Metadata> {
        let entry = self.read_entry(loc)?;
        Ok(Metadata {
            location: loc,
            kind: entry.kind,
            id: entry.id_str(),
            name: entry.name,
            permission: entry.permission,
            modified: entry.modified,
            created: entry.created,
            size: entry.size,
            starting_block: entry.starting_block,
            children: entry.children.len(),
        })
    }

    pub fn set_created_at(&mut self, loc: BlockLoc) -> AlphaResult<()> {
        let now = self.clock.now();
        self.modify_entry(loc, |entry| {
            entry.created = now;
            Ok(())
        })
    }

    pub fn set_modified_at(&mut self, loc: BlockLoc) -> AlphaResult<()> {
        let now = self.clock.now();
        self.modify_entry(loc, |entry| {
            entry.modified = now;
            Ok(())
        })
    }

    /// Gives the entry a fresh random identifier of decimal digits.
    pub fn set_id(&mut self, loc: BlockLoc) -> AlphaResult<()> {
        let mut id = [0u8; ID_LENGTH];
        for digit in id.iter_mut().take(ID_LENGTH - 1) {
            *digit = self.rng.gen_range(b'0'..=b'9');
        }
        self.modify_entry(loc, |entry| {
            entry.id = id;
            Ok(())
        })
    }

    pub fn set_name(&mut self, loc: BlockLoc, name: &str) -> AlphaResult<()> {
        validate_name(name)?;
        self.modify_entry(loc, |entry| {
            entry.name.clear();
            entry.name.push_str(name);
            Ok(())
        })
    }

    pub fn set_permission(&mut self, loc: BlockLoc, permission: Permission) -> AlphaResult<()> {
        self.modify_entry(loc, |entry| {
            entry.permission = permission;
            Ok(())
        })
    }

    /// Sets the kind discriminant. Meant for freshly created entries.
    pub fn set_kind(&mut self, loc: BlockLoc, kind: EntryKind) -> AlphaResult<()> {
        self.modify_entry(loc, |entry| {
            entry.kind = kind;
            Ok(())
        })
    }

    /// Timestamps, identifier and write permission for a new entry.
    pub fn set_default_metadata(&mut self, loc: BlockLoc) -> AlphaResult<()> {
        self.set_created_at(loc)?;
        self.set_id(loc)?;
        self.set_modified_at(loc)?;
        self.set_permission(loc, Permission::Write)
    }
}
