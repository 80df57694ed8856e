//! Write-back block cache.
//!
//! Every block ever touched stays cached until shutdown; eviction is not
//! a concern at container scale. Dirty blocks are threaded onto an
//! intrusive singly-linked chain through an atomic head, and a dedicated
//! flusher thread drains the chain when woken. [`BlockCache::sync`] is a
//! wake-up with no completion guarantee; durability comes from the drop
//! sequence, which stops the flusher and drains whatever is left.
//!
//! The `crypt_cache` policy decides where plaintext lives: `false` keeps
//! cached buffers in clear (decrypt on load, encrypt on flush); `true`
//! keeps them as ciphertext and pays a cipher pass on every borrow.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::crypt::BlockCrypt;
use crate::device::BlockDevice;
use crate::error::Result;

/// Chain terminator in `next_dirty` position.
const CHAIN_END: i64 = -1;
/// Marks a block that is not on the dirty chain at all.
const NOT_DIRTY: i64 = -2;

struct BlockState {
    data: Box<[u8]>,
    next_dirty: i64,
}

/// One cached block. Carries no reference back to the cache; dirtying
/// goes through the cache handle of whoever borrows the buffer.
pub struct Block {
    index: u64,
    state: Mutex<BlockState>,
}

impl Block {
    pub fn index(&self) -> u64 {
        self.index
    }
}

/// Shared plaintext borrow. Holds the block lock for its lifetime.
pub struct ReadGuard<'a> {
    state: MutexGuard<'a, BlockState>,
    reseal: Option<&'a BlockCrypt>,
    index: u64,
}

impl Deref for ReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.state.data
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Some(crypt) = self.reseal {
            crypt.encrypt(self.index, &mut self.state.data);
        }
    }
}

/// Exclusive plaintext borrow; acquiring one pushes the block onto the
/// dirty chain.
pub struct WriteGuard<'a> {
    state: MutexGuard<'a, BlockState>,
    reseal: Option<&'a BlockCrypt>,
    index: u64,
}

impl Deref for WriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.state.data
    }
}

impl DerefMut for WriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.state.data
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Some(crypt) = self.reseal {
            crypt.encrypt(self.index, &mut self.state.data);
        }
    }
}

struct Shared<D: BlockDevice> {
    dev: Mutex<D>,
    crypt: BlockCrypt,
    crypt_cache: bool,
    block_size: u32,
    total_bytes: u64,
    map: Mutex<HashMap<u64, Arc<Block>>>,
    dirty_head: AtomicI64,
    dirty_count: AtomicU64,
    /// Serialises drains, so a completed [`BlockCache::flush`] means no
    /// write-back is in flight.
    drain_lock: Mutex<()>,
    terminate: AtomicBool,
    wake: Mutex<()>,
    wake_cv: Condvar,
}

impl<D: BlockDevice> Shared<D> {
    fn new_block(&self, index: u64) -> Arc<Block> {
        Arc::new(Block {
            index,
            state: Mutex::new(BlockState {
                data: vec![0u8; self.block_size as usize].into_boxed_slice(),
                next_dirty: NOT_DIRTY,
            }),
        })
    }

    /// Drain the dirty chain once. Callable from any thread; drains are
    /// serialised, and the chain itself is detached with a single atomic
    /// exchange.
    fn drain(&self) {
        let _exclusive = self.drain_lock.lock();
        let mut next = self.dirty_head.swap(CHAIN_END, Ordering::Relaxed);
        if next == CHAIN_END {
            return;
        }
        let mut buf = vec![0u8; self.block_size as usize];
        while next != CHAIN_END {
            let index = next as u64;
            let block = self.map.lock().get(&index).cloned();
            let Some(block) = block else {
                log::error!("dirty block {index} missing from the cache");
                break;
            };
            let mut state = block.state.lock();
            buf.copy_from_slice(&state.data);
            next = state.next_dirty;
            state.next_dirty = NOT_DIRTY;
            self.dirty_count.fetch_sub(1, Ordering::Relaxed);
            drop(state);

            if !self.crypt_cache {
                self.crypt.encrypt(index, &mut buf);
            }
            if let Err(err) = self.dev.lock().write(index, &buf) {
                log::error!("flushing block {index} failed: {err}");
            }
        }
    }

    fn flusher_main(&self) {
        log::debug!("flusher: running");
        loop {
            {
                let mut guard = self.wake.lock();
                while self.dirty_count.load(Ordering::Relaxed) == 0 {
                    if self.terminate.load(Ordering::Relaxed) {
                        log::debug!("flusher: terminating");
                        return;
                    }
                    self.wake_cv.wait(&mut guard);
                }
            }
            self.drain();
        }
    }
}

/// The cache proper. Owns the device, the cipher and the flusher thread.
pub struct BlockCache<D: BlockDevice> {
    shared: Arc<Shared<D>>,
    flusher: Option<JoinHandle<()>>,
}

impl<D: BlockDevice + 'static> BlockCache<D> {
    pub fn new(dev: D, crypt: BlockCrypt, crypt_cache: bool) -> Result<BlockCache<D>> {
        let block_size = dev.block_size();
        let total_bytes = dev.total_bytes();
        let shared = Arc::new(Shared {
            dev: Mutex::new(dev),
            crypt,
            crypt_cache,
            block_size,
            total_bytes,
            map: Mutex::new(HashMap::new()),
            dirty_head: AtomicI64::new(CHAIN_END),
            dirty_count: AtomicU64::new(0),
            drain_lock: Mutex::new(()),
            terminate: AtomicBool::new(false),
            wake: Mutex::new(()),
            wake_cv: Condvar::new(),
        });
        let flusher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("coverfs-flush".to_owned())
                .spawn(move || shared.flusher_main())?
        };
        Ok(BlockCache {
            shared,
            flusher: Some(flusher),
        })
    }
}

impl<D: BlockDevice> BlockCache<D> {
    pub fn block_size(&self) -> u32 {
        self.shared.block_size
    }

    pub fn total_bytes(&self) -> u64 {
        self.shared.total_bytes
    }

    pub fn total_blocks(&self) -> u64 {
        self.shared.total_bytes / u64::from(self.shared.block_size)
    }

    pub fn dirty_blocks(&self) -> u64 {
        self.shared.dirty_count.load(Ordering::Relaxed)
    }

    pub fn cached_blocks(&self) -> usize {
        self.shared.map.lock().len()
    }

    /// Handle to the cached block, inserting on miss. With `load` the
    /// buffer of a new entry is filled from the device before anyone can
    /// observe it; without, it starts zeroed (for callers about to
    /// overwrite the whole block).
    pub fn block(&self, index: u64, load: bool) -> Result<Arc<Block>> {
        let shared = &self.shared;
        let mut map = shared.map.lock();
        if let Some(block) = map.get(&index) {
            return Ok(Arc::clone(block));
        }
        let block = shared.new_block(index);
        let mut state = block.state.lock();
        map.insert(index, Arc::clone(&block));
        drop(map);

        if load {
            if let Err(err) = shared.dev.lock().read(index, &mut state.data) {
                drop(state);
                shared.map.lock().remove(&index);
                return Err(err);
            }
            if !shared.crypt_cache {
                shared.crypt.decrypt(index, &mut state.data);
            }
        }
        drop(state);
        Ok(block)
    }

    /// Ensure `count` blocks starting at `index` are cached, issuing one
    /// device read per contiguous missing run.
    pub fn prefetch(&self, index: u64, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let shared = &self.shared;
        let bs = shared.block_size as usize;

        let mut runs: Vec<(u64, Vec<Arc<Block>>)> = Vec::new();
        let mut map = shared.map.lock();
        for i in index..index + count {
            if map.contains_key(&i) {
                continue;
            }
            let block = shared.new_block(i);
            map.insert(i, Arc::clone(&block));
            match runs.last_mut() {
                Some((start, blocks)) if *start + blocks.len() as u64 == i => blocks.push(block),
                _ => runs.push((i, vec![block])),
            }
        }
        // lock every new block before the map opens up again
        let mut guards: Vec<Vec<MutexGuard<'_, BlockState>>> = runs
            .iter()
            .map(|(_, blocks)| blocks.iter().map(|b| b.state.lock()).collect())
            .collect();
        drop(map);

        let mut failed = None;
        'fill: for ((start, _), run_guards) in runs.iter().zip(guards.iter_mut()) {
            let mut buf = vec![0u8; run_guards.len() * bs];
            if let Err(err) = shared.dev.lock().read(*start, &mut buf) {
                failed = Some(err);
                break 'fill;
            }
            for (k, guard) in run_guards.iter_mut().enumerate() {
                guard.data.copy_from_slice(&buf[k * bs..(k + 1) * bs]);
                if !shared.crypt_cache {
                    shared.crypt.decrypt(*start + k as u64, &mut guard.data);
                }
            }
        }
        drop(guards);

        if let Some(err) = failed {
            let mut map = shared.map.lock();
            for (start, blocks) in &runs {
                for k in 0..blocks.len() as u64 {
                    map.remove(&(start + k));
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Borrow the block's plaintext for reading.
    pub fn lock_read<'a>(&'a self, block: &'a Block) -> ReadGuard<'a> {
        let mut state = block.state.lock();
        let reseal = self.shared.crypt_cache.then_some(&self.shared.crypt);
        if let Some(crypt) = reseal {
            crypt.decrypt(block.index, &mut state.data);
        }
        ReadGuard {
            state,
            reseal,
            index: block.index,
        }
    }

    /// Borrow the block's plaintext for writing and mark it dirty.
    pub fn lock_write<'a>(&'a self, block: &'a Block) -> WriteGuard<'a> {
        let mut state = block.state.lock();
        let reseal = self.shared.crypt_cache.then_some(&self.shared.crypt);
        if let Some(crypt) = reseal {
            crypt.decrypt(block.index, &mut state.data);
        }
        if state.next_dirty == NOT_DIRTY {
            state.next_dirty = self
                .shared
                .dirty_head
                .swap(block.index as i64, Ordering::Relaxed);
            self.shared.dirty_count.fetch_add(1, Ordering::Relaxed);
        }
        WriteGuard {
            state,
            reseal,
            index: block.index,
        }
    }

    /// Copy `out.len()` container bytes starting at byte offset `ofs`.
    pub fn read_bytes(&self, ofs: u64, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let bs = u64::from(self.shared.block_size);
        let first = ofs / bs;
        let last = (ofs + out.len() as u64 - 1) / bs;
        self.prefetch(first, last - first + 1)?;

        let mut pos = ofs;
        let mut done = 0usize;
        for index in first..=last {
            let block = self.block(index, true)?;
            let guard = self.lock_read(&block);
            let in_block = (pos % bs) as usize;
            let n = usize::min(bs as usize - in_block, out.len() - done);
            out[done..done + n].copy_from_slice(&guard[in_block..in_block + n]);
            done += n;
            pos += n as u64;
        }
        Ok(())
    }

    /// Copy `data` into the container at byte offset `ofs`, marking every
    /// touched block dirty and waking the flusher.
    pub fn write_bytes(&self, ofs: u64, data: &[u8]) -> Result<()> {
        self.update_bytes(ofs, data.len() as u64, |dst, done, n| {
            dst.copy_from_slice(&data[done..done + n])
        })
    }

    /// Zero a container byte range through the cache.
    pub fn zero_bytes(&self, ofs: u64, len: u64) -> Result<()> {
        self.update_bytes(ofs, len, |dst, _, _| dst.fill(0))
    }

    fn update_bytes(
        &self,
        ofs: u64,
        len: u64,
        mut fill: impl FnMut(&mut [u8], usize, usize),
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let bs = u64::from(self.shared.block_size);
        let first = ofs / bs;
        let last = (ofs + len - 1) / bs;

        // blocks only partially covered must hold their old contents
        if ofs % bs != 0 {
            self.block(first, true)?;
        }
        if (ofs + len) % bs != 0 {
            self.block(last, true)?;
        }

        let mut pos = ofs;
        let mut done = 0usize;
        for index in first..=last {
            let block = self.block(index, false)?;
            let mut guard = self.lock_write(&block);
            let in_block = (pos % bs) as usize;
            let n = usize::min(bs as usize - in_block, (len - done as u64) as usize);
            fill(&mut guard[in_block..in_block + n], done, n);
            done += n;
            pos += n as u64;
        }
        self.sync();
        Ok(())
    }

    /// Wake the flusher. Returns immediately; there is no completion
    /// guarantee.
    pub fn sync(&self) {
        let _guard = self.shared.wake.lock();
        self.shared.wake_cv.notify_one();
    }

    /// Drain the dirty chain on the calling thread.
    pub fn flush(&self) {
        self.shared.drain();
    }
}

impl<D: BlockDevice> Drop for BlockCache<D> {
    fn drop(&mut self) {
        log::debug!(
            "cache: shutting down with {} dirty of {} cached blocks",
            self.dirty_blocks(),
            self.cached_blocks()
        );
        self.shared.terminate.store(true, Ordering::Relaxed);
        {
            let _guard = self.shared.wake.lock();
            self.shared.wake_cv.notify_one();
        }
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        // anything dirtied between the flusher's last drain and now
        self.shared.drain();
        let leftover = self.dirty_blocks();
        if leftover != 0 {
            log::warn!("cache: {leftover} blocks still dirty after shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    const BS: u32 = 1024;

    fn cache_on(dev: &MemDevice, crypt_cache: bool) -> BlockCache<MemDevice> {
        BlockCache::new(dev.clone(), BlockCrypt::new([11u8; 32]), crypt_cache).unwrap()
    }

    #[test]
    fn write_flush_read_back() {
        let dev = MemDevice::new(64, BS);
        let cache = cache_on(&dev, false);

        let data: Vec<u8> = (0..3000).map(|i| (i % 256) as u8).collect();
        cache.write_bytes(5000, &data).unwrap();
        cache.flush();
        assert_eq!(cache.dirty_blocks(), 0);

        let mut out = vec![0u8; data.len()];
        cache.read_bytes(5000, &mut out).unwrap();
        assert_eq!(out, data);

        // on-disk bytes are ciphertext, not the plaintext we wrote
        let image = dev.image();
        assert_ne!(&image[5000..5000 + data.len()], &data[..]);

        // a fresh cache over the same device sees the plaintext again
        let cache2 = cache_on(&dev, false);
        let mut out2 = vec![0u8; data.len()];
        cache2.read_bytes(5000, &mut out2).unwrap();
        assert_eq!(out2, data);
    }

    #[test]
    fn crypt_cache_mode_behaves_identically() {
        let dev = MemDevice::new(64, BS);
        {
            let cache = cache_on(&dev, true);
            cache.write_bytes(100, b"ciphertext at rest").unwrap();
            cache.flush();

            let mut out = vec![0u8; 18];
            cache.read_bytes(100, &mut out).unwrap();
            assert_eq!(&out, b"ciphertext at rest");
        }
        // plain-cache mount reads what a crypt-cache mount wrote
        let cache = cache_on(&dev, false);
        let mut out = vec![0u8; 18];
        cache.read_bytes(100, &mut out).unwrap();
        assert_eq!(&out, b"ciphertext at rest");
    }

    #[test]
    fn unaligned_write_preserves_neighbours() {
        let dev = MemDevice::new(64, BS);
        let cache = cache_on(&dev, false);

        cache.write_bytes(0, &vec![0xaa; 2 * BS as usize]).unwrap();
        cache.write_bytes(1000, &[0xbb; 48]).unwrap();

        let mut out = vec![0u8; 2 * BS as usize];
        cache.read_bytes(0, &mut out).unwrap();
        assert!(out[..1000].iter().all(|&b| b == 0xaa));
        assert!(out[1000..1048].iter().all(|&b| b == 0xbb));
        assert!(out[1048..].iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn zero_bytes_zeroes() {
        let dev = MemDevice::new(64, BS);
        let cache = cache_on(&dev, false);

        cache.write_bytes(0, &vec![0xff; 3 * BS as usize]).unwrap();
        cache.zero_bytes(100, 2000).unwrap();

        let mut out = vec![0u8; 3 * BS as usize];
        cache.read_bytes(0, &mut out).unwrap();
        assert!(out[..100].iter().all(|&b| b == 0xff));
        assert!(out[100..2100].iter().all(|&b| b == 0));
        assert!(out[2100..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn drop_is_durable() {
        let dev = MemDevice::new(64, BS);
        {
            let cache = cache_on(&dev, false);
            cache.write_bytes(2048, b"must survive drop").unwrap();
            // no explicit flush
        }
        let cache = cache_on(&dev, false);
        let mut out = vec![0u8; 17];
        cache.read_bytes(2048, &mut out).unwrap();
        assert_eq!(&out, b"must survive drop");
    }

    #[test]
    fn async_flusher_drains() {
        let dev = MemDevice::new(64, BS);
        let cache = cache_on(&dev, false);

        cache.write_bytes(0, &[1; 100]).unwrap();
        cache.sync();
        for _ in 0..500 {
            if cache.dirty_blocks() == 0 {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        panic!("flusher did not drain within a second");
    }

    #[test]
    fn rewriting_a_dirty_block_keeps_one_chain_entry() {
        let dev = MemDevice::new(64, BS);
        let cache = cache_on(&dev, false);

        cache.write_bytes(0, &[1; 8]).unwrap();
        cache.write_bytes(4, &[2; 8]).unwrap();
        // a block already on the chain is never pushed twice
        assert!(cache.dirty_blocks() <= 1);
        cache.flush();
        assert_eq!(cache.dirty_blocks(), 0);

        let mut out = vec![0u8; 12];
        cache.read_bytes(0, &mut out).unwrap();
        assert_eq!(&out[..4], &[1; 4]);
        assert_eq!(&out[4..], &[2; 8]);
    }

    #[test]
    fn prefetch_counts_and_reads() {
        let dev = MemDevice::new(64, BS);
        // seed the device with recognisable ciphertext-free zeros, then
        // write through one cache and reopen
        {
            let cache = cache_on(&dev, false);
            cache
                .write_bytes(0, &vec![7u8; 10 * BS as usize])
                .unwrap();
        }
        let cache = cache_on(&dev, false);
        cache.block(3, true).unwrap();
        cache.block(7, true).unwrap();
        assert_eq!(cache.cached_blocks(), 2);

        // fills the holes around the two residents
        cache.prefetch(0, 10).unwrap();
        assert_eq!(cache.cached_blocks(), 10);

        let mut out = vec![0u8; 10 * BS as usize];
        cache.read_bytes(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 7));
    }

    #[test]
    fn concurrent_writers_on_distinct_blocks() {
        let dev = MemDevice::new(256, BS);
        let cache = std::sync::Arc::new(cache_on(&dev, false));

        let mut handles = Vec::new();
        for t in 0u8..4 {
            let cache = std::sync::Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                let ofs = u64::from(t) * 16 * u64::from(BS);
                let payload = vec![t + 1; 16 * BS as usize];
                cache.write_bytes(ofs, &payload).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        for t in 0u8..4 {
            let ofs = u64::from(t) * 16 * u64::from(BS);
            let mut out = vec![0u8; 16 * BS as usize];
            cache.read_bytes(ofs, &mut out).unwrap();
            assert!(out.iter().all(|&b| b == t + 1));
        }
    }
}
