//! Per-thread block pools and the global drain pool.
//!
//! Each thread caches up to 100 free blocks per size class in a ring and
//! goes to the global pool (then to the free-page lists) only when the ring
//! runs dry or overflows, moving [`DRAIN_BATCH_SIZE`] blocks at a time. The
//! global flush counter lets the flusher task ask every thread to lazily
//! return its cached blocks to the pages.

use super::page::{self, CNT_BLOCK_SIZES, DRAIN_BATCH_SIZE};
use core::cell::RefCell;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};
use sync::Mutex;

pub const CNT_BLOCKS_IN_POOL: usize = 100;
const DRAIN_BATCH: usize = DRAIN_BATCH_SIZE as usize;

struct PoolRing {
    cnt_avail: u16,
    put_idx: u16,
    get_idx: u16,
    blocks: [*mut u8; CNT_BLOCKS_IN_POOL],
}

impl PoolRing {
    const fn new() -> Self {
        Self {
            cnt_avail: 0,
            put_idx: 0,
            get_idx: 0,
            blocks: [ptr::null_mut(); CNT_BLOCKS_IN_POOL],
        }
    }
}

struct PoolSet {
    flush_counter: u32,
    pools: [PoolRing; CNT_BLOCK_SIZES],
}

impl PoolSet {
    fn new() -> Box<Self> {
        Box::new(Self {
            flush_counter: FLUSH_COUNTER.load(Ordering::Relaxed),
            pools: [const { PoolRing::new() }; CNT_BLOCK_SIZES],
        })
    }
}

/// Flushes the cached blocks back to their pages when the thread dies.
struct ThreadPools(Box<PoolSet>);

impl Drop for ThreadPools {
    fn drop(&mut self) {
        flush_pool_set(&mut self.0);
    }
}

thread_local! {
    static POOL_SET: RefCell<Option<ThreadPools>> = const { RefCell::new(None) };
}

struct GlobalPool {
    cnt_avail: u16,
    blocks: [*mut u8; CNT_BLOCKS_IN_POOL],
}

// Safety: the blocks array is only touched under the pool mutex.
unsafe impl Send for GlobalPool {}

impl GlobalPool {
    const fn new() -> Self {
        Self {
            cnt_avail: 0,
            blocks: [ptr::null_mut(); CNT_BLOCKS_IN_POOL],
        }
    }
}

static GLOBAL_POOLS: [Mutex<GlobalPool>; CNT_BLOCK_SIZES] =
    [const { Mutex::new(GlobalPool::new()) }; CNT_BLOCK_SIZES];
static FLUSH_COUNTER: AtomicU32 = AtomicU32::new(0);

#[inline]
fn inc_pool_idx(idx: &mut u16) {
    *idx += 1;
    if *idx as usize == CNT_BLOCKS_IN_POOL {
        *idx = 0;
    }
}

/// Refills an empty ring from a free page, taking one block for the caller.
fn fill_from_free_pages(pool: Option<&mut PoolRing>, size_idx: usize) -> *mut u8 {
    let page = page::take_free_page(size_idx);
    match pool {
        Some(pool) => {
            debug_assert_eq!(pool.cnt_avail, 0);
            let mut filled: u16 = 0;
            let result = page::fill_from_page(
                page,
                size_idx,
                Some(&mut |block| {
                    pool.blocks[filled as usize] = block;
                    filled += 1;
                }),
            );
            pool.cnt_avail = filled;
            pool.get_idx = 0;
            pool.put_idx = if filled as usize == CNT_BLOCKS_IN_POOL {
                0
            } else {
                filled
            };
            result
        }
        None => page::fill_from_page(page, size_idx, None),
    }
}

/// Refills an empty ring from the global pool, falling back to free pages.
fn fill_pool(pool: &mut PoolRing, size_idx: usize) -> *mut u8 {
    let mut glob = GLOBAL_POOLS[size_idx].lock();
    if glob.cnt_avail == 0 {
        drop(glob);
        return fill_from_free_pages(Some(pool), size_idx);
    }

    debug_assert_eq!(pool.cnt_avail, 0);
    let result = glob.blocks[0];
    glob.cnt_avail -= 1;
    let cnt_copy = glob.cnt_avail.min(DRAIN_BATCH_SIZE) as usize;
    if cnt_copy != 0 {
        pool.blocks[..cnt_copy].copy_from_slice(&glob.blocks[1..=cnt_copy]);
        pool.cnt_avail = cnt_copy as u16;
        pool.get_idx = 0;
        pool.put_idx = cnt_copy as u16;
        glob.cnt_avail -= cnt_copy as u16;
        let left = glob.cnt_avail as usize;
        if left != 0 {
            glob.blocks.copy_within(cnt_copy + 1..cnt_copy + 1 + left, 0);
        }
    }
    result
}

fn get_from_pool(pool: &mut PoolRing, size_idx: usize) -> *mut u8 {
    if pool.cnt_avail == 0 {
        fill_pool(pool, size_idx)
    } else {
        pool.cnt_avail -= 1;
        let block = pool.blocks[pool.get_idx as usize];
        inc_pool_idx(&mut pool.get_idx);
        block
    }
}

/// Overflow path for a full ring: hand the batch to the global pool, or
/// straight back to the pages when the global pool is full too.
fn drain_pool(pool: &mut PoolRing, size_idx: usize, block: *mut u8) {
    // A full ring holds a linear view again: every slot is occupied.
    pool.get_idx = 0;

    let mut glob = GLOBAL_POOLS[size_idx].lock();
    if glob.cnt_avail as usize == CNT_BLOCKS_IN_POOL {
        drop(glob);
        pool.put_idx = (CNT_BLOCKS_IN_POOL - DRAIN_BATCH) as u16;
        pool.cnt_avail = pool.put_idx;
        page::release_to_free_pages(&pool.blocks[CNT_BLOCKS_IN_POOL - DRAIN_BATCH..], size_idx);
        page::release_to_free_pages(&[block], size_idx);
    } else {
        let mut glob_cnt = glob.cnt_avail as usize;
        glob.blocks[glob_cnt] = block;
        glob_cnt += 1;
        let to_copy = (CNT_BLOCKS_IN_POOL - glob_cnt).min(DRAIN_BATCH);
        pool.put_idx = (CNT_BLOCKS_IN_POOL - to_copy) as u16;
        pool.cnt_avail = pool.put_idx;
        glob.blocks[glob_cnt..glob_cnt + to_copy]
            .copy_from_slice(&pool.blocks[CNT_BLOCKS_IN_POOL - to_copy..]);
        glob.cnt_avail = (glob_cnt + to_copy) as u16;
    }
}

fn put_to_pool(pool: &mut PoolRing, size_idx: usize, block: *mut u8) {
    #[cfg(debug_assertions)]
    {
        // Double-free check against the blocks still cached in this ring.
        let mut idx = pool.get_idx;
        for _ in 0..pool.cnt_avail {
            assert_ne!(pool.blocks[idx as usize], block, "double free detected");
            inc_pool_idx(&mut idx);
        }
    }
    if pool.cnt_avail as usize == CNT_BLOCKS_IN_POOL {
        drain_pool(pool, size_idx, block);
    } else {
        pool.cnt_avail += 1;
        pool.blocks[pool.put_idx as usize] = block;
        inc_pool_idx(&mut pool.put_idx);
    }
}

/// Returns every cached block of the set to the pages and syncs the flush
/// counter.
fn flush_pool_set(set: &mut PoolSet) {
    for (size_idx, pool) in set.pools.iter_mut().enumerate() {
        if pool.cnt_avail == 0 {
            continue;
        }
        let get = pool.get_idx as usize;
        let put = pool.put_idx as usize;
        if get < put {
            page::release_to_free_pages(&pool.blocks[get..put], size_idx);
        } else {
            page::release_to_free_pages(&pool.blocks[get..], size_idx);
            if put != 0 {
                page::release_to_free_pages(&pool.blocks[..put], size_idx);
            }
        }
        pool.get_idx = 0;
        pool.put_idx = 0;
        pool.cnt_avail = 0;
    }
    set.flush_counter = FLUSH_COUNTER.load(Ordering::Relaxed);
}

fn get_from_global(size_idx: usize) -> *mut u8 {
    let mut glob = GLOBAL_POOLS[size_idx].lock();
    if glob.cnt_avail == 0 {
        drop(glob);
        return fill_from_free_pages(None, size_idx);
    }
    glob.cnt_avail -= 1;
    glob.blocks[glob.cnt_avail as usize]
}

/// Allocates one block of the given class through the calling thread's pool
/// (or the global pool when thread-local storage is unavailable).
pub(super) fn alloc_small(size_idx: usize) -> *mut u8 {
    let from_tls = POOL_SET.try_with(|cell| {
        let mut opt = cell.borrow_mut();
        let set = &mut opt.get_or_insert_with(|| ThreadPools(PoolSet::new())).0;
        if set.flush_counter != FLUSH_COUNTER.load(Ordering::Relaxed) {
            flush_pool_set(set);
        }
        get_from_pool(&mut set.pools[size_idx], size_idx)
    });
    match from_tls {
        Ok(block) => block,
        // Thread-local storage is gone (thread teardown); go global.
        Err(_) => get_from_global(size_idx),
    }
}

/// Frees one block of the given class through the calling thread's pool.
pub(super) fn free_small(block: *mut u8, size_idx: usize) {
    let via_tls = POOL_SET.try_with(|cell| {
        let mut opt = cell.borrow_mut();
        let set = &mut opt.get_or_insert_with(|| ThreadPools(PoolSet::new())).0;
        if set.flush_counter != FLUSH_COUNTER.load(Ordering::Relaxed) {
            flush_pool_set(set);
        }
        put_to_pool(&mut set.pools[size_idx], size_idx, block);
    });
    if via_tls.is_err() {
        page::release_to_free_pages(&[block], size_idx);
    }
}

/// Drains the global pool into pages and bumps the flush counter so every
/// thread flushes its rings on its next allocation. Run by the flusher task.
pub(super) fn flush_global_pools() {
    let mut buffer = [ptr::null_mut::<u8>(); CNT_BLOCKS_IN_POOL];
    for size_idx in 0..CNT_BLOCK_SIZES {
        let mut glob = GLOBAL_POOLS[size_idx].lock();
        let cnt = glob.cnt_avail as usize;
        if cnt == 0 {
            continue;
        }
        buffer[..cnt].copy_from_slice(&glob.blocks[..cnt]);
        glob.cnt_avail = 0;
        drop(glob);
        page::release_to_free_pages(&buffer[..cnt], size_idx);
    }
    FLUSH_COUNTER.fetch_add(1, Ordering::Relaxed);
}

/// Flushes the calling thread's rings immediately; used by tests and by
/// orderly thread teardown.
pub fn flush_current_thread() {
    let _ = POOL_SET.try_with(|cell| {
        if let Some(tp) = cell.borrow_mut().as_mut() {
            flush_pool_set(&mut tp.0);
        }
    });
}
