//! Allocator accounting: per-class user/system block counters, big-page
//! counters and the mmap totals, plus the start-state snapshot that
//! per-interval statistics subtract as a baseline.

use super::page::{BLOCK_SIZES, CNT_BLOCK_SIZES};
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;

static USER_BL_ALLOCED: [AtomicU64; CNT_BLOCK_SIZES] =
    [const { AtomicU64::new(0) }; CNT_BLOCK_SIZES];
static USER_BL_FREED: [AtomicU64; CNT_BLOCK_SIZES] = [const { AtomicU64::new(0) }; CNT_BLOCK_SIZES];
static SYS_BL_ALLOCED: [AtomicU64; CNT_BLOCK_SIZES] =
    [const { AtomicU64::new(0) }; CNT_BLOCK_SIZES];
static SYS_BL_FREED: [AtomicU64; CNT_BLOCK_SIZES] = [const { AtomicU64::new(0) }; CNT_BLOCK_SIZES];
static BIG_ALLOCED_CNT: AtomicU64 = AtomicU64::new(0);
static BIG_ALLOCED_SIZE: AtomicU64 = AtomicU64::new(0);
static BIG_FREED_CNT: AtomicU64 = AtomicU64::new(0);
static BIG_FREED_SIZE: AtomicU64 = AtomicU64::new(0);
static TOTAL_SYS_MEM: AtomicI64 = AtomicI64::new(0);
static TOTAL_PAGE_COUNT: AtomicI64 = AtomicI64::new(0);

static START_STATE: OnceLock<MemState> = OnceLock::new();

pub(super) fn note_user_alloced(size_idx: usize) {
    USER_BL_ALLOCED[size_idx].fetch_add(1, Ordering::Relaxed);
}

pub(super) fn note_user_freed(size_idx: usize) {
    USER_BL_FREED[size_idx].fetch_add(1, Ordering::Relaxed);
}

pub(super) fn note_sys_blocks_alloced(size_idx: usize, cnt: u64) {
    SYS_BL_ALLOCED[size_idx].fetch_add(cnt, Ordering::Relaxed);
}

pub(super) fn note_sys_blocks_freed(size_idx: usize, cnt: u64) {
    SYS_BL_FREED[size_idx].fetch_add(cnt, Ordering::Relaxed);
}

pub(super) fn note_big_alloced(size: u64) {
    BIG_ALLOCED_CNT.fetch_add(1, Ordering::Relaxed);
    BIG_ALLOCED_SIZE.fetch_add(size, Ordering::Relaxed);
}

pub(super) fn note_big_freed(size: u64) {
    BIG_FREED_CNT.fetch_add(1, Ordering::Relaxed);
    BIG_FREED_SIZE.fetch_add(size, Ordering::Relaxed);
}

pub(super) fn note_sys_alloc(size: usize) {
    TOTAL_SYS_MEM.fetch_add(size as i64, Ordering::Relaxed);
    TOTAL_PAGE_COUNT.fetch_add(1, Ordering::Relaxed);
}

pub(super) fn note_sys_free(size: usize) {
    TOTAL_SYS_MEM.fetch_sub(size as i64, Ordering::Relaxed);
    TOTAL_PAGE_COUNT.fetch_sub(1, Ordering::Relaxed);
}

/// Point-in-time view of the allocator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemState {
    /// Live user blocks per size class.
    pub user_blocks: [i64; CNT_BLOCK_SIZES],
    /// Live carved blocks per size class (allocated pages worth).
    pub sys_blocks: [i64; CNT_BLOCK_SIZES],
    pub big_blocks_cnt: i64,
    pub big_blocks_size: i64,
    /// Sum of live user data, in bytes.
    pub total_data: u64,
    /// Bytes currently mmap'd.
    pub total_sys: i64,
    /// Pages (of any size) currently mmap'd.
    pub page_count: i64,
}

impl Default for MemState {
    fn default() -> Self {
        Self {
            user_blocks: [0; CNT_BLOCK_SIZES],
            sys_blocks: [0; CNT_BLOCK_SIZES],
            big_blocks_cnt: 0,
            big_blocks_size: 0,
            total_data: 0,
            total_sys: 0,
            page_count: 0,
        }
    }
}

/// Snapshot of the live counters.
pub fn mem_state() -> MemState {
    let mut state = MemState::default();
    let mut total_data = 0u64;
    for i in 0..CNT_BLOCK_SIZES {
        let user = USER_BL_ALLOCED[i].load(Ordering::Relaxed) as i64
            - USER_BL_FREED[i].load(Ordering::Relaxed) as i64;
        state.user_blocks[i] = user;
        if user > 0 {
            total_data += user as u64 * BLOCK_SIZES[i] as u64;
        }
        state.sys_blocks[i] = SYS_BL_ALLOCED[i].load(Ordering::Relaxed) as i64
            - SYS_BL_FREED[i].load(Ordering::Relaxed) as i64;
    }
    state.big_blocks_cnt = BIG_ALLOCED_CNT.load(Ordering::Relaxed) as i64
        - BIG_FREED_CNT.load(Ordering::Relaxed) as i64;
    state.big_blocks_size = BIG_ALLOCED_SIZE.load(Ordering::Relaxed) as i64
        - BIG_FREED_SIZE.load(Ordering::Relaxed) as i64;
    if state.big_blocks_size > 0 {
        total_data += state.big_blocks_size as u64;
    }
    state.total_data = total_data;
    state.total_sys = TOTAL_SYS_MEM.load(Ordering::Relaxed);
    state.page_count = TOTAL_PAGE_COUNT.load(Ordering::Relaxed);
    state
}

/// Captured once, before the server starts serving; per-interval statistics
/// subtract this baseline.
pub fn init_start_state() -> MemState {
    *START_STATE.get_or_init(mem_state)
}

pub fn total_page_count() -> i64 {
    TOTAL_PAGE_COUNT.load(Ordering::Relaxed)
}
