//! The filesystem engine: a flat namespace of inodes packed into the
//! container as fragments.
//!
//! The fragment table is authoritative. An inode is nothing but the
//! ordered set of table slots carrying its id; opening one scans the
//! table, and every size or placement change goes back through the table
//! before the operation returns. Directories, paths and node handles are
//! layered on top of that, with all byte traffic funnelled through the
//! block cache.

mod dir;
mod path;

pub use dir::Directory;
pub use path::split_path;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::BlockCache;
use crate::crypt::{self, PassphraseContext};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::sys::dir_entry::{DirEntry, InodeKind, NAME_MAX};
use crate::sys::fragment::{
    FragmentDesc, FRAGMENT_DESC_SIZE, FREE_OWNER, ROOT_ID, SUPER_OWNER, TABLE_BLOCKS, TABLE_OWNER,
};

/// Superblock magic, the first 8 bytes of block 1.
pub const SUPER_MAGIC: &[u8; 8] = b"CoverFS\0";

/// First block of the data region: header, superblock, fragment table.
const DATA_START: u64 = 2 + TABLE_BLOCKS;

/// Floor of the anti-fragmentation threshold: a gap smaller than this is
/// skipped unless it already covers the whole request.
const MIN_GAP: u64 = 1 << 20;

/// Mount-time policy knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// Keep cached blocks as ciphertext, paying a cipher pass per borrow.
    pub crypt_cache: bool,
}

/// Volume usage summary.
#[derive(Debug, Clone, Copy)]
pub struct VolumeStat {
    pub block_size: u32,
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
    pub inodes: u64,
    pub name_max: u32,
}

struct NodeState {
    kind: InodeKind,
    size: u64,
    /// Table slots of this inode's fragments, in logical order. Slots
    /// are reserved in increasing table order, so this is sorted too.
    fragments: Vec<usize>,
    parent: Option<i32>,
    name: String,
}

/// An open inode. Handles are shared: opening the same id twice yields
/// the same object, and its mutex linearises all operations on the
/// inode.
pub struct Node {
    id: i32,
    state: Mutex<NodeState>,
}

pub type NodeHandle = Arc<Node>;

impl Node {
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    pub fn kind(&self) -> InodeKind {
        self.state.lock().kind
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }
}

struct FragmentTable {
    fragments: Vec<FragmentDesc>,
    /// Slot indices ordered by start block; slots that claim no blocks
    /// sort to the end.
    by_offset: Vec<usize>,
    /// Slot indices ordered by owner id, free slots last. Diagnostics
    /// only; sorted on demand.
    by_id: Vec<usize>,
}

impl FragmentTable {
    fn sort_offsets(&mut self) {
        let fragments = &self.fragments;
        self.by_offset.sort_by_key(|&i| {
            if fragments[i].claims_blocks() {
                fragments[i].start_block
            } else {
                u64::MAX
            }
        });
    }

    fn sort_ids(&mut self) {
        let fragments = &self.fragments;
        self.by_id.sort_by_key(|&i| {
            if fragments[i].is_free() {
                i64::MAX
            } else {
                i64::from(fragments[i].owner)
            }
        });
    }
}

/// The mounted filesystem.
pub struct CoverFs<D: BlockDevice> {
    cache: BlockCache<D>,
    table: Mutex<FragmentTable>,
    nodes: Mutex<HashMap<i32, NodeHandle>>,
}

impl<D: BlockDevice + 'static> CoverFs<D> {
    /// Mount a container. A blank device is initialised from scratch:
    /// key material through the passphrase callback, then superblock,
    /// fragment table and root directory. Otherwise the passphrase
    /// unlocks the existing volume and the fragment table is loaded.
    pub fn mount<F>(mut dev: D, options: MountOptions, passphrase: F) -> Result<CoverFs<D>>
    where
        F: FnOnce(PassphraseContext) -> String,
    {
        let crypt = crypt::open_volume(&mut dev, passphrase)?;
        if dev.total_blocks() < DATA_START + 1 {
            return Err(Error::CorruptVolume("container too small"));
        }
        log::info!(
            "container: {} MiB in {}-byte blocks",
            dev.total_bytes() >> 20,
            dev.block_size()
        );
        let cache = BlockCache::new(dev, crypt, options.crypt_cache)?;

        let formatted = {
            let block = cache.block(1, true)?;
            let guard = cache.lock_read(&block);
            &guard[..8] == SUPER_MAGIC
        };
        let fragments = if formatted {
            Self::load_table(&cache)?
        } else {
            Self::format(&cache)?
        };

        let slots = fragments.len();
        let mut table = FragmentTable {
            fragments,
            by_offset: (0..slots).collect(),
            by_id: (0..slots).collect(),
        };
        table.sort_offsets();

        let fs = CoverFs {
            cache,
            table: Mutex::new(table),
            nodes: Mutex::new(HashMap::new()),
        };
        if !formatted {
            let (id, _) = fs.reserve_new_fragment()?;
            if id != ROOT_ID {
                return Err(Error::Invariant(format!(
                    "fresh volume allocated id {id} for the root directory"
                )));
            }
            fs.cache.sync();
            log::info!("created root directory");
        }
        Ok(fs)
    }

    fn load_table(cache: &BlockCache<D>) -> Result<Vec<FragmentDesc>> {
        let mut fragments = Vec::with_capacity(Self::table_slots(cache.block_size()));
        for tb in 0..TABLE_BLOCKS {
            let block = cache.block(2 + tb, true)?;
            let guard = cache.lock_read(&block);
            for record in guard.chunks_exact(FRAGMENT_DESC_SIZE) {
                fragments.push(FragmentDesc::decode(record));
            }
        }
        log::debug!(
            "loaded fragment table: {} slots, {} owned",
            fragments.len(),
            fragments.iter().filter(|d| d.is_owned()).count()
        );
        Ok(fragments)
    }

    fn format(cache: &BlockCache<D>) -> Result<Vec<FragmentDesc>> {
        log::info!("superblock missing, formatting filesystem");
        let bs = cache.block_size();
        {
            let block = cache.block(1, false)?;
            let mut guard = cache.lock_write(&block);
            guard.fill(0);
            guard[..8].copy_from_slice(SUPER_MAGIC);
        }

        let mut fragments = vec![FragmentDesc::free(); Self::table_slots(bs)];
        fragments[0] = FragmentDesc::new(SUPER_OWNER, 0, 2 * bs);
        fragments[1] = FragmentDesc::new(TABLE_OWNER, 2, TABLE_BLOCKS as u32 * bs);

        let per_block = bs as usize / FRAGMENT_DESC_SIZE;
        for tb in 0..TABLE_BLOCKS as usize {
            let block = cache.block(2 + tb as u64, false)?;
            let mut guard = cache.lock_write(&block);
            for k in 0..per_block {
                let record = fragments[tb * per_block + k].encode();
                guard[k * FRAGMENT_DESC_SIZE..(k + 1) * FRAGMENT_DESC_SIZE]
                    .copy_from_slice(&record);
            }
        }
        cache.sync();
        Ok(fragments)
    }

    fn table_slots(block_size: u32) -> usize {
        block_size as usize / FRAGMENT_DESC_SIZE * TABLE_BLOCKS as usize
    }
}

impl<D: BlockDevice> CoverFs<D> {
    pub fn block_size(&self) -> u32 {
        self.cache.block_size()
    }

    /// Wake the flusher; returns immediately.
    pub fn sync(&self) {
        self.cache.sync();
    }

    /// Drain all dirty blocks on the calling thread.
    pub fn flush(&self) {
        self.cache.flush();
    }

    /// Write one descriptor through the cache into its table block.
    fn store_fragment(&self, table: &FragmentTable, index: usize) -> Result<()> {
        let per_block = self.cache.block_size() as usize / FRAGMENT_DESC_SIZE;
        let block = self.cache.block(2 + (index / per_block) as u64, true)?;
        let mut guard = self.cache.lock_write(&block);
        let ofs = index % per_block * FRAGMENT_DESC_SIZE;
        guard[ofs..ofs + FRAGMENT_DESC_SIZE].copy_from_slice(&table.fragments[index].encode());
        Ok(())
    }

    /// Reserve a fresh inode: the smallest id never handed out before,
    /// materialised as an empty fragment in the first free slot. Freed
    /// ids are not reused; directory entries may still reference them.
    fn reserve_new_fragment(&self) -> Result<(i32, usize)> {
        let mut table = self.table.lock();
        let mut max_id = -1;
        for desc in &table.fragments {
            if desc.owner > max_id {
                max_id = desc.owner;
            }
        }
        let id = max_id + 1;
        let slot = table
            .fragments
            .iter()
            .position(|d| d.is_free())
            .ok_or(Error::NoSpace)?;
        table.fragments[slot] = FragmentDesc::new(id, 0, 0);
        self.store_fragment(&table, slot)?;
        table.sort_offsets();
        Ok((id, slot))
    }

    /// Candidate space for `need` more bytes of the inode whose last
    /// fragment sits in `last_slot`, plus a free table slot reserved
    /// strictly after it so an inode's slots stay in table order.
    ///
    /// Scanning in offset order, the first inter-fragment gap of at
    /// least `min(need, max(need/4, 1 MiB))` bytes wins; preferring
    /// large gaps keeps small requests from shredding the free space.
    /// With no such gap the candidate goes past the last fragment with
    /// size "as much as needed", which the caller caps.
    fn find_gap(
        table: &FragmentTable,
        id: i32,
        last_slot: usize,
        need: u64,
        block_size: u32,
    ) -> Result<(usize, FragmentDesc)> {
        let spare = (last_slot + 1..table.fragments.len())
            .find(|&i| table.fragments[i].is_free())
            .ok_or(Error::NoSpace)?;

        let bs = u64::from(block_size);
        let want = need.min((need / 4).max(MIN_GAP));
        let mut prev: Option<FragmentDesc> = None;
        for &i in &table.by_offset {
            let desc = table.fragments[i];
            if !desc.claims_blocks() {
                break;
            }
            if let Some(p) = prev {
                let end = p.next_free_block(block_size);
                let gap = desc.start_block.saturating_sub(end) * bs;
                if gap >= want {
                    let size = gap.min(u64::from(u32::MAX)) as u32;
                    return Ok((spare, FragmentDesc::new(id, end, size)));
                }
            }
            prev = Some(desc);
        }
        let end = prev
            .map(|d| d.next_free_block(block_size))
            .unwrap_or(DATA_START);
        Ok((spare, FragmentDesc::new(id, end, u32::MAX)))
    }

    /// Grow the already-locked inode to `target` bytes.
    fn grow_locked(&self, id: i32, st: &mut NodeState, target: u64, zero: bool) -> Result<()> {
        let block_size = self.cache.block_size();
        let bs = u64::from(block_size);
        let total_blocks = self.cache.total_blocks();

        while st.size < target {
            let need = target - st.size;
            let mut table = self.table.lock();
            let last_slot = *st.fragments.last().ok_or_else(|| {
                Error::Invariant(format!("inode {id} has no fragments"))
            })?;
            let (spare_slot, mut cand) = Self::find_gap(&table, id, last_slot, need, block_size)?;

            let avail = total_blocks.saturating_sub(cand.start_block) * bs;
            let take = need.min(u64::from(cand.byte_size)).min(avail);
            if take == 0 {
                return Err(Error::NoSpace);
            }
            cand.byte_size = take as u32;

            let last = table.fragments[last_slot];
            let (merge, slot) = if last.byte_size == 0 {
                // the reserved empty fragment is filled in place
                (false, last_slot)
            } else if cand.start_block == last.next_free_block(block_size) {
                let grow = cand.byte_size.min(u32::MAX - last.byte_size);
                if grow == 0 {
                    // fragment at the 4 GiB ceiling: split instead
                    (false, spare_slot)
                } else {
                    cand.byte_size = grow;
                    (true, last_slot)
                }
            } else {
                (false, spare_slot)
            };

            if zero {
                if merge {
                    // stale bytes between the old byte end and its block
                    // boundary become readable after the merge
                    let gap_start = last.byte_offset(block_size) + u64::from(last.byte_size);
                    let gap_end = last.next_free_block(block_size) * bs;
                    self.cache.zero_bytes(gap_start, gap_end - gap_start)?;
                }
                self.cache
                    .zero_bytes(cand.byte_offset(block_size), u64::from(cand.byte_size))?;
            }

            if merge {
                table.fragments[last_slot].byte_size += cand.byte_size;
            } else {
                table.fragments[slot] = cand;
                if slot != last_slot {
                    st.fragments.push(slot);
                }
            }
            self.store_fragment(&table, slot)?;
            st.size += u64::from(cand.byte_size);
            table.sort_offsets();
        }
        Ok(())
    }

    /// Shrink the already-locked inode to `target` bytes, trimming from
    /// the tail. The first fragment is the inode's anchor and survives
    /// even at size zero.
    fn shrink_locked(&self, id: i32, st: &mut NodeState, target: u64) -> Result<()> {
        let mut table = self.table.lock();
        while st.size > target {
            let last_slot = *st.fragments.last().ok_or_else(|| {
                Error::Invariant(format!("inode {id} has no fragments"))
            })?;
            let desc = table.fragments[last_slot];
            st.size -= u64::from(desc.byte_size);
            let keep = u64::from(desc.byte_size).min(target.saturating_sub(st.size));
            table.fragments[last_slot].byte_size = keep as u32;
            st.size += keep;

            if keep == 0 && st.fragments.len() > 1 {
                table.fragments[last_slot].owner = FREE_OWNER;
                self.store_fragment(&table, last_slot)?;
                st.fragments.pop();
            } else {
                self.store_fragment(&table, last_slot)?;
                break;
            }
        }
        table.sort_offsets();
        Ok(())
    }

    fn fragment_snapshot(&self, st: &NodeState) -> Vec<FragmentDesc> {
        let table = self.table.lock();
        st.fragments.iter().map(|&i| table.fragments[i]).collect()
    }

    /// Open an inode by id. The kind and parent are unknown until a
    /// path lookup fills them in; the root is always a directory.
    pub fn open_node_by_id(&self, id: i32) -> Result<NodeHandle> {
        if id < 0 {
            return Err(Error::NotFound);
        }
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get(&id) {
            return Ok(Arc::clone(node));
        }

        let table = self.table.lock();
        let fragments: Vec<usize> = table
            .fragments
            .iter()
            .enumerate()
            .filter(|(_, d)| d.owner == id)
            .map(|(i, _)| i)
            .collect();
        if fragments.is_empty() {
            return Err(Error::NotFound);
        }
        let size = fragments
            .iter()
            .map(|&i| u64::from(table.fragments[i].byte_size))
            .sum();
        drop(table);

        let root = id == ROOT_ID;
        let node = Arc::new(Node {
            id,
            state: Mutex::new(NodeState {
                kind: if root { InodeKind::Dir } else { InodeKind::Unknown },
                size,
                fragments,
                parent: None,
                name: if root { "/".to_owned() } else { String::new() },
            }),
        });
        nodes.insert(id, Arc::clone(&node));
        Ok(node)
    }

    /// Resolve a path from the root. The empty path is the root itself.
    pub fn open_node(&self, path: &str) -> Result<NodeHandle> {
        let mut node = self.open_node_by_id(ROOT_ID)?;
        for part in split_path(path) {
            let entry = self
                .directory(&node)?
                .find(part)?
                .ok_or(Error::NotFound)?;
            let child = self.open_node_by_id(entry.id)?;
            {
                let mut st = child.state.lock();
                st.kind = entry.kind;
                st.parent = Some(node.id);
                st.name = entry.name;
            }
            node = child;
        }
        Ok(node)
    }

    pub fn open_dir(&self, path: &str) -> Result<NodeHandle> {
        let node = self.open_node(path)?;
        if node.kind() != InodeKind::Dir {
            return Err(Error::NotADirectory);
        }
        Ok(node)
    }

    pub fn open_file(&self, path: &str) -> Result<NodeHandle> {
        let node = self.open_node(path)?;
        if node.kind() != InodeKind::File {
            return Err(Error::NotAFile);
        }
        Ok(node)
    }

    /// Entry-table view of a directory node.
    pub fn directory(&self, node: &NodeHandle) -> Result<Directory<'_, D>> {
        if node.kind() != InodeKind::Dir {
            return Err(Error::NotADirectory);
        }
        Ok(Directory::new(self, Arc::clone(node)))
    }

    pub fn read_dir(&self, node: &NodeHandle) -> Result<Vec<DirEntry>> {
        self.directory(node)?.entries()
    }

    pub fn create_file(&self, dir: &NodeHandle, name: &str) -> Result<NodeHandle> {
        self.create_node(dir, name, InodeKind::File)
    }

    pub fn create_dir(&self, dir: &NodeHandle, name: &str) -> Result<NodeHandle> {
        self.create_node(dir, name, InodeKind::Dir)
    }

    fn create_node(&self, dir: &NodeHandle, name: &str, kind: InodeKind) -> Result<NodeHandle> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "node names must be non-empty and separator-free",
            )));
        }
        let entry = DirEntry::new(0, kind, name)?;
        let dir_handle = self.directory(dir)?;
        if dir_handle.find(name)?.is_some() {
            return Err(Error::AlreadyExists);
        }

        let (id, _) = self.reserve_new_fragment()?;
        self.cache.sync();
        dir_handle.add(&DirEntry { id, ..entry })?;

        let node = self.open_node_by_id(id)?;
        {
            let mut st = node.state.lock();
            st.kind = kind;
            st.parent = Some(dir.id);
            st.name = name.to_owned();
        }
        log::debug!("created {kind:?} '{name}' as inode {id}");
        Ok(node)
    }

    /// Delete a node: free all its fragments, drop its directory entry
    /// and forget the handle. The node must have been opened through a
    /// path so its parent is known.
    pub fn remove(&self, node: &NodeHandle) -> Result<()> {
        let (parent, name) = {
            let st = node.state.lock();
            (st.parent, st.name.clone())
        };
        let Some(parent_id) = parent else {
            return Err(Error::NotFound);
        };

        {
            let mut st = node.state.lock();
            let mut table = self.table.lock();
            for &slot in &st.fragments {
                table.fragments[slot].owner = FREE_OWNER;
                self.store_fragment(&table, slot)?;
            }
            table.sort_offsets();
            st.fragments.clear();
            st.size = 0;
        }
        self.cache.sync();

        let parent_node = self.open_node_by_id(parent_id)?;
        self.directory(&parent_node)?.remove(&name)?;
        self.nodes.lock().remove(&node.id);
        log::debug!("removed inode {} ('{name}')", node.id);
        Ok(())
    }

    /// Move a node into `new_dir` under `new_name`. Fails with
    /// `AlreadyExists` if the name is taken; replacing is the host's
    /// business.
    pub fn rename(&self, node: &NodeHandle, new_dir: &NodeHandle, new_name: &str) -> Result<()> {
        let new_dir_handle = self.directory(new_dir)?;
        let (parent, old_name) = {
            let st = node.state.lock();
            (st.parent, st.name.clone())
        };
        let Some(parent_id) = parent else {
            return Err(Error::NotFound);
        };
        if new_dir_handle.find(new_name)?.is_some() {
            return Err(Error::AlreadyExists);
        }

        let old_dir = self.open_node_by_id(parent_id)?;
        let old_dir_handle = self.directory(&old_dir)?;
        let entry = old_dir_handle.find(&old_name)?.ok_or(Error::NotFound)?;
        let moved = DirEntry::new(entry.id, entry.kind, new_name)?;
        old_dir_handle.remove(&old_name)?;
        new_dir_handle.add(&moved)?;

        let mut st = node.state.lock();
        st.parent = Some(new_dir.id);
        st.name = new_name.to_owned();
        Ok(())
    }

    /// Read up to `out.len()` bytes at `offset`. Returns the bytes
    /// copied, zero past EOF.
    pub fn read(&self, node: &NodeHandle, offset: u64, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let st = node.state.lock();
        if offset >= st.size {
            return Ok(0);
        }
        let len = (out.len() as u64).min(st.size - offset);
        let end = offset + len;

        let bs = self.cache.block_size();
        let mut copied = 0u64;
        let mut frag_ofs = 0u64;
        for desc in self.fragment_snapshot(&st) {
            let frag_len = u64::from(desc.byte_size);
            let lo = offset.max(frag_ofs);
            let hi = end.min(frag_ofs + frag_len);
            if lo < hi {
                let container = desc.byte_offset(bs) + (lo - frag_ofs);
                self.cache
                    .read_bytes(container, &mut out[(lo - offset) as usize..(hi - offset) as usize])?;
                copied += hi - lo;
            }
            frag_ofs += frag_len;
        }
        Ok(copied as usize)
    }

    /// Write `data` at `offset`, growing the file first if it ends past
    /// EOF. Bytes between the old EOF and `offset` are not zeroed;
    /// sparse growth wanting zeros goes through [`truncate`](Self::truncate).
    pub fn write(&self, node: &NodeHandle, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut st = node.state.lock();
        let end = offset + data.len() as u64;
        if st.size < end {
            self.grow_locked(node.id, &mut st, end, false)?;
        }

        let bs = self.cache.block_size();
        let mut frag_ofs = 0u64;
        for desc in self.fragment_snapshot(&st) {
            let frag_len = u64::from(desc.byte_size);
            let lo = offset.max(frag_ofs);
            let hi = end.min(frag_ofs + frag_len);
            if lo < hi {
                let container = desc.byte_offset(bs) + (lo - frag_ofs);
                self.cache
                    .write_bytes(container, &data[(lo - offset) as usize..(hi - offset) as usize])?;
            }
            frag_ofs += frag_len;
        }
        self.cache.sync();
        Ok(())
    }

    /// Change the file size. Growth allocates via the gap finder; with
    /// `zero` the new range reads back as zeros. Shrinking frees whole
    /// trailing fragments and trims the last survivor.
    pub fn truncate(&self, node: &NodeHandle, size: u64, zero: bool) -> Result<()> {
        let mut st = node.state.lock();
        if size > st.size {
            self.grow_locked(node.id, &mut st, size, zero)?;
        } else if size < st.size {
            self.shrink_locked(node.id, &mut st, size)?;
        }
        drop(st);
        self.cache.sync();
        Ok(())
    }

    /// Usage summary over the fragment table.
    pub fn stat(&self) -> VolumeStat {
        let mut table = self.table.lock();
        table.sort_ids();

        let block_size = self.cache.block_size();
        let mut inodes = 0u64;
        let mut last_id = None;
        for &i in &table.by_id {
            let desc = &table.fragments[i];
            if desc.is_free() {
                break;
            }
            if desc.owner >= 0 && last_id != Some(desc.owner) {
                inodes += 1;
                last_id = Some(desc.owner);
            }
        }
        let used_blocks: u64 = table
            .fragments
            .iter()
            .filter(|d| d.claims_blocks())
            .map(|d| d.block_span(block_size))
            .sum();
        let total_blocks = self.cache.total_blocks();
        VolumeStat {
            block_size,
            total_blocks,
            used_blocks,
            free_blocks: total_blocks - used_blocks,
            inodes,
            name_max: NAME_MAX as u32,
        }
    }

    /// Walk the table in offset order and verify that no two fragments
    /// overlap and nothing points past the container. A diagnostic, not
    /// a repair.
    pub fn check(&self) -> Result<()> {
        let mut table = self.table.lock();
        table.sort_offsets();
        let bs = self.cache.block_size();

        let mut prev: Option<FragmentDesc> = None;
        for &i in &table.by_offset {
            let desc = table.fragments[i];
            if !desc.claims_blocks() {
                break;
            }
            if let Some(p) = prev {
                if desc.start_block < p.next_free_block(bs) {
                    return Err(Error::Invariant(format!(
                        "fragment of inode {} at block {} overlaps fragment of inode {} ending at block {}",
                        desc.owner,
                        desc.start_block,
                        p.owner,
                        p.next_free_block(bs),
                    )));
                }
            }
            prev = Some(desc);
        }
        if let Some(p) = prev {
            if p.next_free_block(bs) > self.cache.total_blocks() {
                return Err(Error::Invariant(format!(
                    "fragment of inode {} runs past the container",
                    p.owner
                )));
            }
        }
        Ok(())
    }
}
