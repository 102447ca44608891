//! Slab-based page allocator.
//!
//! Small allocations are rounded up to one of 39 size classes and served
//! from 64 KiB pages; anything larger gets its own mmap'd region. Each
//! thread keeps a bounded ring of cached blocks per class, drained to and
//! refilled from a global pool in batches, with a grade index picking refill
//! pages by fullness. See `page` and `pool` for the two halves.
//!
//! The allocator is exposed both as plain functions and as the
//! [`SlabAlloc`] adapter a binary can install with `#[global_allocator]`.

mod page;
mod pool;
mod stat;

use crate::task::{SrvTask, TaskHandler, TaskRef, ThreadNum};
use core::alloc::{GlobalAlloc, Layout};

pub use page::{BLOCK_SIZES, CNT_BLOCK_SIZES, MAX_BLOCK_SIZE, PAGE_SIZE};
pub use pool::flush_current_thread;
pub use stat::{MemState, init_start_state, mem_state, total_page_count};

use page::{page_by_ptr, size_index};

/// Seconds between flusher runs.
const FLUSH_PERIOD: u64 = 60;

fn class_for(size: usize, align: usize) -> Option<usize> {
    if size > MAX_BLOCK_SIZE {
        return None;
    }
    if align <= 8 {
        Some(size_index(size.max(1)))
    } else if align <= 64 {
        // Blocks are laid out back to back from the 64-byte header, so a
        // class guarantees `align` only when its size is a multiple of it.
        BLOCK_SIZES.iter().position(|&s| s >= size && s % align == 0)
    } else {
        None
    }
}

/// Allocates `size` bytes aligned to at least 8.
pub fn alloc(size: usize) -> *mut u8 {
    alloc_aligned(size, 8)
}

pub fn alloc_aligned(size: usize, align: usize) -> *mut u8 {
    match class_for(size, align) {
        Some(size_idx) => {
            stat::note_user_alloced(size_idx);
            pool::alloc_small(size_idx)
        }
        None => page::alloc_big_page(size, align),
    }
}

/// Releases a pointer previously returned by [`alloc`]/[`realloc`].
///
/// # Safety
/// `ptr` must come from this allocator and must not be freed twice.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let page = page_by_ptr(ptr);
    // Safety: per contract, ptr belongs to a live page of this allocator.
    let block_size = unsafe { (*page).block_size };
    if block_size <= MAX_BLOCK_SIZE {
        let size_idx = size_index(block_size);
        stat::note_user_freed(size_idx);
        pool::free_small(ptr, size_idx);
    } else {
        page::dealloc_big_page(page);
    }
}

/// Payload capacity of the block holding `ptr`: the bucketed class size for
/// small blocks, the rounded region size minus the header for big ones.
///
/// # Safety
/// `ptr` must come from this allocator and still be live.
pub unsafe fn mem_size(ptr: *const u8) -> usize {
    // Safety: per contract.
    unsafe { (*page_by_ptr(ptr)).block_size }
}

/// Grows or shrinks an allocation, moving it only when the size class
/// actually changes.
///
/// # Safety
/// `ptr` must be null or come from this allocator and still be live.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return alloc(size);
    }
    // Safety: per contract.
    let old_size = unsafe { mem_size(ptr) };
    let fits = if size <= MAX_BLOCK_SIZE {
        BLOCK_SIZES[size_index(size.max(1))] == old_size
    } else if old_size > MAX_BLOCK_SIZE {
        // Safety: big page per the size check.
        let payload_offset = unsafe { (*page_by_ptr(ptr)).payload_offset } as usize;
        page::big_page_size(size, payload_offset) - payload_offset == old_size
    } else {
        false
    };
    if fits {
        return ptr;
    }

    let new_ptr = alloc(size);
    // Safety: both regions are live and at least min(size, old_size) long.
    unsafe {
        core::ptr::copy_nonoverlapping(ptr, new_ptr, size.min(old_size));
        free(ptr);
    }
    new_ptr
}

/// `GlobalAlloc` adapter; a binary opts in with
/// `#[global_allocator] static A: SlabAlloc = SlabAlloc;`.
pub struct SlabAlloc;

// Safety: alloc/dealloc follow the GlobalAlloc contract; blocks are aligned
// per class_for and never handed out twice.
unsafe impl GlobalAlloc for SlabAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        alloc_aligned(layout.size().max(1), layout.align())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // Safety: GlobalAlloc contract guarantees ptr came from self.alloc.
        unsafe { free(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= 8 {
            // Safety: GlobalAlloc contract.
            unsafe { realloc(ptr, new_size.max(1)) }
        } else {
            let new_ptr = alloc_aligned(new_size.max(1), layout.align());
            // Safety: both regions live; old one is layout.size() long.
            unsafe {
                core::ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                free(ptr);
            }
            new_ptr
        }
    }
}

/// Scheduled task that drains the global pool into pages every minute and
/// bumps the flush counter so threads lazily empty their rings too.
pub struct MemFlusher;

impl TaskHandler for MemFlusher {
    fn execute_slice(&mut self, task: &TaskRef, _thr_num: ThreadNum) {
        if crate::server::is_in_shutdown() {
            return;
        }
        pool::flush_global_pools();
        task.run_after(FLUSH_PERIOD);
    }
}

/// Captures the start-state baseline and schedules the flusher.
pub fn init_memory_man() {
    stat::init_start_state();
    let flusher = SrvTask::new(Box::new(MemFlusher));
    flusher.run_after(FLUSH_PERIOD);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counter-sensitive tests share one binary; serialize them so snapshots
    // are not polluted by a sibling test mid-flight.
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn roundtrip_and_mem_size() {
        let _g = TEST_LOCK.lock().unwrap();
        for &n in &[1usize, 8, 9, 100, 1000, 2400, 2496, MAX_BLOCK_SIZE] {
            let p = alloc(n);
            assert!(!p.is_null());
            assert_eq!(p as usize % 8, 0);
            // Safety: p is live and ours.
            unsafe {
                assert!(mem_size(p) >= n);
                assert_eq!(mem_size(p), BLOCK_SIZES[page::size_index(n.max(1))]);
                p.write_bytes(0xAB, n);
                free(p);
            }
        }
    }

    #[test]
    fn big_allocation_roundtrip() {
        let _g = TEST_LOCK.lock().unwrap();
        let n = MAX_BLOCK_SIZE + 1;
        let p = alloc(n);
        // Safety: p is live and ours.
        unsafe {
            assert!(mem_size(p) >= n);
            p.write_bytes(0xCD, n);
            free(p);
        }

        let huge = 1 << 20;
        let p = alloc(huge);
        // Safety: p is live and ours.
        unsafe {
            assert!(mem_size(p) >= huge);
            free(p);
        }
    }

    #[test]
    fn aligned_allocations() {
        let _g = TEST_LOCK.lock().unwrap();
        for &align in &[16usize, 32, 64, 4096] {
            let p = alloc_aligned(align, align);
            assert_eq!(p as usize % align, 0, "align {align}");
            // Safety: p is live and ours.
            unsafe { free(p) };
        }
    }

    #[test]
    fn realloc_keeps_same_class_in_place() {
        let _g = TEST_LOCK.lock().unwrap();
        let p = alloc(100);
        // Safety: p is live and ours.
        unsafe {
            p.write_bytes(0x5A, 100);
            // 112 is the same 112-byte class as 100 rounds into.
            let q = realloc(p, 112);
            assert_eq!(p, q);
            let r = realloc(q, 5000);
            assert_ne!(q, r);
            assert_eq!(r.read(), 0x5A);
            assert_eq!(r.add(99).read(), 0x5A);
            free(r);
        }
    }

    #[test]
    fn pure_free_shrinks_mappings() {
        let _g = TEST_LOCK.lock().unwrap();
        let before = total_page_count();
        let mut ptrs = Vec::new();
        for _ in 0..10_000 {
            ptrs.push(alloc(64));
        }
        assert!(total_page_count() > before);
        for p in ptrs {
            // Safety: each p is live and freed exactly once.
            unsafe { free(p) };
        }
        flush_current_thread();
        pool::flush_global_pools();
        flush_current_thread();
        assert!(
            total_page_count() <= before + 2,
            "pages not returned: before={before} after={}",
            total_page_count()
        );
    }

    #[test]
    fn multithreaded_stress_leaves_no_live_blocks() {
        let _g = TEST_LOCK.lock().unwrap();
        let state_before = mem_state();
        let threads: Vec<_> = (0..4u64)
            .map(|seed| {
                std::thread::spawn(move || {
                    let mut rng = fastrand::Rng::with_seed(seed);
                    let mut live: Vec<(*mut u8, usize)> = Vec::new();
                    for _ in 0..100_000 {
                        if live.len() > 64 || (!live.is_empty() && rng.bool()) {
                            let (p, n) = live.swap_remove(rng.usize(..live.len()));
                            // Safety: p was allocated by us and not yet freed.
                            unsafe {
                                assert!(mem_size(p) >= n);
                                free(p);
                            }
                        } else {
                            let n = rng.usize(1..2400);
                            let p = alloc(n);
                            // Safety: fresh block of at least n bytes.
                            unsafe { p.write_bytes(0x77, n) };
                            live.push((p, n));
                        }
                    }
                    for (p, _) in live {
                        // Safety: still live, freed exactly once.
                        unsafe { free(p) };
                    }
                    flush_current_thread();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let state_after = mem_state();
        for i in 0..CNT_BLOCK_SIZES {
            assert_eq!(
                state_after.user_blocks[i] - state_before.user_blocks[i],
                0,
                "class {i} leaked"
            );
        }
    }
}
