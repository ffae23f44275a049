//! The physical memory manager.
//!
//! A facade in the common allocator shape over the global buddy allocator,
//! with one page cache per core in front of it. Single 4 KiB pages are the
//! overwhelmingly common request, so once the caches are live those are
//! served from a per-core stack without touching the global lock; the
//! buddy only sees batched refills and flushes.
//!
//! Cached pages stay *allocated* as far as the buddy is concerned: refills
//! use [`BuddyAllocator::split_allocation`], which rewrites page orders but
//! neither sets free bits nor touches freelists. A page leaving the cache
//! through [`deallocate`] is therefore a perfectly ordinary buddy free.

use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;
use x86_64::VirtAddr;
use x86_64::instructions::interrupts;
use x86_64::structures::paging::Size4KiB;
use x86_64::structures::paging::mapper::MapToError;

use crate::info;

use super::buddy::{BuddyAllocator, BuddyStats, block_bytes};
use super::bump::BumpAllocator;
use super::freelist::FreeList;
use super::{MetadataOom, PAGE_SIZE, RawAllocator, paging};

/// Start of the virtual range handed to the buddy allocator (must not
/// overlap the heap reservation window).
pub const MANAGED_START: u64 = 0xFFFF_9000_0000_0000;
/// Size of the managed range, metadata included.
pub const MANAGED_SIZE: u64 = 32 * 1024 * 1024; // 32 MiB

/// Upper bound on cores the page caches are sized for.
pub const MAX_CORES: usize = 8;
/// Pages a core may hoard before a free flushes half of them back.
pub const CACHE_MAX_PAGES: usize = 64;
/// Order of the block a cache refill splits into single pages.
const REFILL_ORDER: u8 = 3;

/// The global buddy allocator, behind the one lock every slow path takes.
pub static BUDDY: Mutex<Option<BuddyAllocator>> = Mutex::new(None);

static CACHES_LIVE: AtomicBool = AtomicBool::new(false);

/// A per-core stack of single free pages.
struct PageCache {
    pages: FreeList,
}

impl PageCache {
    const fn new() -> Self {
        Self { pages: FreeList::new() }
    }
}

struct PerCore<T>([UnsafeCell<T>; MAX_CORES]);

// Safety: every core only ever touches its own slot, with interrupts
// disabled for the duration of the access.
unsafe impl<T> Sync for PerCore<T> {}

static PAGE_CACHES: PerCore<PageCache> =
    PerCore([const { UnsafeCell::new(PageCache::new()) }; MAX_CORES]);

/// Index of the executing core.
///
/// TODO: read the APIC id here once SMP bringup lands; a single core runs
/// for now.
fn current_core() -> usize {
    0
}

/// Errors from [`init_pmm`].
#[derive(Debug)]
pub enum PmmInitError {
    Map(MapToError<Size4KiB>),
    Metadata(MetadataOom),
}

/// Maps the managed range, carves the buddy's metadata out of its head
/// with a bump allocator, and makes the rest of the range allocatable.
pub fn init_pmm() -> Result<(), PmmInitError> {
    let start = VirtAddr::new(MANAGED_START);
    let end = start + MANAGED_SIZE;

    paging::map_range(start, MANAGED_SIZE).map_err(PmmInitError::Map)?;

    let metadata_bytes = BuddyAllocator::required_memory(start, end);
    let mut metadata = BumpAllocator::new(start, start + metadata_bytes);
    let data_start = start + metadata_bytes;

    let mut buddy =
        BuddyAllocator::init(data_start, end, &mut metadata).map_err(PmmInitError::Metadata)?;
    buddy.add_region(data_start, end);

    info!(
        "pmm initialized: {:#x} - {:#x}, {} KiB metadata, {} MiB allocatable",
        start.as_u64(),
        end.as_u64(),
        metadata_bytes / 1024,
        (MANAGED_SIZE - metadata_bytes) / (1024 * 1024)
    );

    *BUDDY.lock() = Some(buddy);
    Ok(())
}

/// Enables the per-core page caches. Until this is called every request
/// takes the global lock and goes straight to the buddy.
pub fn set_cache_live() {
    CACHES_LIVE.store(true, Ordering::Release);
    info!("pmm per-core page caches enabled");
}

/// Rounds a layout to the power-of-two page count the buddy serves.
fn block_len(layout: Layout) -> u64 {
    assert!(layout.size() > 0, "zero-size page allocation");
    assert!(
        layout.align() as u64 <= PAGE_SIZE,
        "page allocations cannot demand more than page alignment"
    );
    (layout.size() as u64).div_ceil(PAGE_SIZE).next_power_of_two() * PAGE_SIZE
}

/// Allocates page-granular memory. Single pages come from the executing
/// core's cache when possible; everything else goes to the buddy under the
/// global lock.
pub fn allocate(layout: Layout) -> Option<NonNull<u8>> {
    let len = block_len(layout);
    interrupts::without_interrupts(|| {
        if len == PAGE_SIZE && CACHES_LIVE.load(Ordering::Acquire) {
            let cache = unsafe { &mut *PAGE_CACHES.0[current_core()].get() };
            if let Some(page) = cache.pages.pop() {
                return Some(page.cast());
            }
            refill(cache)
        } else {
            let mut buddy = BUDDY.lock();
            let addr = buddy.as_mut()?.alloc(len)?;
            NonNull::new(addr.as_mut_ptr())
        }
    })
}

/// Takes one high-order block from the buddy, splits it into single
/// pages, stashes all but one in the cache, and returns the remainder.
fn refill(cache: &mut PageCache) -> Option<NonNull<u8>> {
    let mut buddy_lock = BUDDY.lock();
    let buddy = buddy_lock.as_mut()?;

    match buddy.alloc(block_bytes(REFILL_ORDER)) {
        Some(block) => {
            buddy.split_allocation(block, 0);
            for page in 1..(1u64 << REFILL_ORDER) {
                let addr = block + page * PAGE_SIZE;
                cache.pages.push(NonNull::new(addr.as_mut_ptr()).unwrap());
            }
            NonNull::new(block.as_mut_ptr())
        }
        // Not enough contiguity left for a batch; a lone page may still
        // exist.
        None => buddy.alloc(PAGE_SIZE).and_then(|addr| NonNull::new(addr.as_mut_ptr())),
    }
}

/// Frees page-granular memory. Single pages go to the executing core's
/// cache; a full cache first flushes half of itself to the buddy in one
/// locked section.
pub fn deallocate(ptr: NonNull<u8>, layout: Layout) {
    let len = block_len(layout);
    let addr = VirtAddr::from_ptr(ptr.as_ptr());

    interrupts::without_interrupts(|| {
        if len == PAGE_SIZE && CACHES_LIVE.load(Ordering::Acquire) {
            let cache = unsafe { &mut *PAGE_CACHES.0[current_core()].get() };
            if cache.pages.len() >= CACHE_MAX_PAGES {
                let mut buddy_lock = BUDDY.lock();
                let buddy = buddy_lock.as_mut().expect("pmm not initialized");
                for _ in 0..CACHE_MAX_PAGES / 2 {
                    if let Some(page) = cache.pages.pop() {
                        buddy.free(VirtAddr::from_ptr(page.as_ptr()));
                    }
                }
            }
            cache.pages.push(ptr.cast());
        } else {
            BUDDY
                .lock()
                .as_mut()
                .expect("pmm not initialized")
                .free(addr);
        }
    });
}

/// Buddy-level statistics. Cached pages count as allocated.
pub fn stats() -> Option<BuddyStats> {
    interrupts::without_interrupts(|| BUDDY.lock().as_ref().map(|buddy| buddy.stats()))
}

/// Allocator-shape handle to the global physical memory manager, for
/// layers constructed around a backing allocator.
pub struct PmmBacking;

impl RawAllocator for PmmBacking {
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        allocate(layout)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        deallocate(ptr, layout);
    }
}
