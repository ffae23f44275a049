//! Buddy allocation over page-aligned power-of-two blocks.
//!
//! The allocator owns one contiguous page-aligned range and serves blocks of
//! `2^order` pages for orders 0 through 10 (4 KiB up to 4 MiB). Three
//! structures track the range:
//!
//! - a [`Bitmap`] with one bit per page, set when the page is the *base* of
//!   a free block (pages inside any block stay clear),
//! - an order table with one byte per pair of pages, holding each page's
//!   current order in a nibble,
//! - one [`LinkedFreeList`] per order, threaded through the free blocks
//!   themselves.
//!
//! Buddies are computed by XOR on the offset *relative to the managed
//! base*, never on the absolute address, so ranges that are not naturally
//! aligned to their largest block still pair correctly.

use core::alloc::Layout;
use core::cmp::min;
use core::ptr::NonNull;

use x86_64::VirtAddr;

use super::bitmap::Bitmap;
use super::freelist::LinkedFreeList;
use super::{MetadataOom, PAGE_SIZE, RawAllocator, align_down, align_up};

/// Number of block orders; order `k` is `2^k` pages.
pub const NUM_ORDERS: usize = 11;
/// Largest order.
pub const MAX_ORDER: u8 = (NUM_ORDERS - 1) as u8;

/// Bytes in a block of the given order.
pub const fn block_bytes(order: u8) -> u64 {
    PAGE_SIZE << order
}

/// Per-order free block counts, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyStats {
    pub free_per_order: [usize; NUM_ORDERS],
    pub free_bytes: u64,
}

/// A buddy allocator over `[start, end)`.
pub struct BuddyAllocator {
    start: VirtAddr,
    end: VirtAddr,
    n_pages: u64,
    bitmap: Bitmap<false>,
    /// One byte per two consecutive pages: even page's order in the low
    /// nibble, odd page's in the high nibble.
    orders: NonNull<u8>,
    free_lists: [LinkedFreeList; NUM_ORDERS],
}

unsafe impl Send for BuddyAllocator {}

impl BuddyAllocator {
    /// Metadata bytes needed for the range so that carving the metadata out
    /// of the range's head leaves a stable data region.
    ///
    /// Reserving metadata shrinks the page count, which shrinks the
    /// metadata; the sizes are iterated to their fixed point, which must be
    /// reached within three rounds.
    pub fn required_memory(start: VirtAddr, end: VirtAddr) -> u64 {
        let start = align_up(start.as_u64(), PAGE_SIZE);
        let end = align_down(end.as_u64(), PAGE_SIZE);
        assert!(end > start, "empty buddy range");
        let total = end - start;

        let mut metadata = 0;
        for _ in 0..3 {
            let n_pages = (total - metadata) / PAGE_SIZE;
            let needed = align_up(
                Bitmap::<false>::required_bytes(n_pages) + n_pages.div_ceil(2),
                PAGE_SIZE,
            );
            if needed == metadata {
                return metadata;
            }
            metadata = needed;
        }

        let n_pages = (total - metadata) / PAGE_SIZE;
        let needed = align_up(
            Bitmap::<false>::required_bytes(n_pages) + n_pages.div_ceil(2),
            PAGE_SIZE,
        );
        assert!(needed == metadata, "buddy metadata size failed to converge");
        metadata
    }

    /// Creates an allocator over `[start, end)` (rounded inward to page
    /// boundaries) with its bitmap and order table carved from `metadata`.
    ///
    /// No pages are free yet; make sub-ranges available with
    /// [`BuddyAllocator::add_region`].
    pub fn init(
        start: VirtAddr,
        end: VirtAddr,
        metadata: &mut impl RawAllocator,
    ) -> Result<Self, MetadataOom> {
        let start = VirtAddr::new(align_up(start.as_u64(), PAGE_SIZE));
        let end = VirtAddr::new(align_down(end.as_u64(), PAGE_SIZE));
        assert!(end > start, "empty buddy range");
        let n_pages = (end - start) / PAGE_SIZE;

        let bitmap = Bitmap::new(start, PAGE_SIZE, n_pages, metadata)?;

        let order_bytes = n_pages.div_ceil(2);
        let orders_layout = Layout::from_size_align(order_bytes as usize, 1).unwrap();
        let orders = metadata.allocate(orders_layout).ok_or(MetadataOom)?;
        for i in 0..order_bytes {
            unsafe { orders.as_ptr().add(i as usize).write(0) };
        }

        Ok(Self {
            start,
            end,
            n_pages,
            bitmap,
            orders,
            free_lists: [LinkedFreeList::new(); NUM_ORDERS],
        })
    }

    pub const fn start(&self) -> VirtAddr {
        self.start
    }

    pub const fn end(&self) -> VirtAddr {
        self.end
    }

    /// Makes `[region_start, region_end)` available for allocation.
    ///
    /// The range must lie inside the managed range but need not cover it;
    /// disjoint sub-ranges may be added one after another. Each position is
    /// covered by the largest block that fits and is buddy-aligned, which
    /// packs an aligned region in descending order sizes.
    pub fn add_region(&mut self, region_start: VirtAddr, region_end: VirtAddr) {
        let mut current = align_up(region_start.as_u64(), PAGE_SIZE);
        let end = align_down(region_end.as_u64(), PAGE_SIZE);
        assert!(current >= self.start.as_u64() && end <= self.end.as_u64() && current < end);

        while current < end {
            let mut order = MAX_ORDER;
            loop {
                let size = block_bytes(order);
                let aligned = (current - self.start.as_u64()) % size == 0;
                if aligned && current + size <= end {
                    break;
                }
                // Order 0 always fits: the bounds are page-aligned.
                order -= 1;
            }
            self.insert_free(VirtAddr::new(current), order);
            current += block_bytes(order);
        }
    }

    /// Allocates a block of `len` bytes, which must be a power-of-two
    /// multiple of the page size. Returns `None` when no block of that
    /// order or above is free.
    ///
    /// The result is aligned to the block size relative to the managed
    /// base.
    pub fn alloc(&mut self, len: u64) -> Option<VirtAddr> {
        assert!(len >= PAGE_SIZE && len % PAGE_SIZE == 0, "length not in whole pages");
        let pages = len / PAGE_SIZE;
        assert!(pages.is_power_of_two(), "length not a power-of-two page count");
        if pages.trailing_zeros() as u8 > MAX_ORDER {
            return None;
        }

        let base = self.recursive_split(pages.trailing_zeros() as u8)?;
        self.bitmap.set_bit(base, false);
        Some(base)
    }

    /// Pops a free block of `order`, splitting a larger block if the list
    /// is empty. The returned base keeps its free bit; [`Self::alloc`]
    /// clears it once.
    fn recursive_split(&mut self, order: u8) -> Option<VirtAddr> {
        if let Some(ptr) = self.free_lists[order as usize].pop() {
            return Some(VirtAddr::from_ptr(ptr.as_ptr()));
        }
        if order == MAX_ORDER {
            return None;
        }

        let base = self.recursive_split(order + 1)?;
        let buddy = self.buddy_of(base, order);
        self.insert_free(buddy, order);
        self.set_order(base, order);
        Some(base)
    }

    /// Frees the block at `addr`, merging it with free buddies of the same
    /// order until a buddy is missing, allocated, or across the range
    /// boundary.
    pub fn free(&mut self, addr: VirtAddr) {
        assert!(addr >= self.start && addr < self.end, "free of address outside managed range");
        assert!(addr.as_u64() % PAGE_SIZE == 0, "free of unaligned address");
        debug_assert!(!self.bitmap.is_free(addr), "double free");

        let (base, order) = self.recursive_merge(addr);
        self.insert_free(base, order);
    }

    fn recursive_merge(&mut self, addr: VirtAddr) -> (VirtAddr, u8) {
        let order = self.order_of(addr);
        if order == MAX_ORDER {
            return (addr, order);
        }

        let size = block_bytes(order);
        let buddy_rel = (addr - self.start) ^ size;
        // A buddy that is not fully inside the managed range can never be
        // merged with; the block stops coalescing at the boundary.
        if buddy_rel + size > self.end - self.start {
            return (addr, order);
        }

        let buddy = self.start + buddy_rel;
        if !self.bitmap.is_free(buddy) || self.order_of(buddy) != order {
            return (addr, order);
        }

        self.free_lists[order as usize]
            .pop_specific(NonNull::new(buddy.as_mut_ptr()).unwrap());
        // Zero both halves deterministically; only one of them was set.
        self.bitmap.set_bit(buddy, false);
        self.bitmap.set_bit(addr, false);

        let lower = min(addr, buddy);
        self.set_order(lower, order + 1);
        self.recursive_merge(lower)
    }

    /// Rewrites the order entries of an *allocated* block so it becomes a
    /// batch of `target_order` sub-blocks covering the same range. Neither
    /// the bitmap nor the freelists are touched: the caller owns every
    /// sub-block and must keep treating unreleased ones as allocated.
    pub fn split_allocation(&mut self, addr: VirtAddr, target_order: u8) {
        let order = self.order_of(addr);
        assert!(target_order <= order, "cannot split to a larger order");
        debug_assert!(!self.bitmap.is_free(addr), "split of a free block");

        let end = addr + block_bytes(order);
        let step = block_bytes(target_order);
        let mut current = addr;
        while current < end {
            self.set_order(current, target_order);
            current += step;
        }
    }

    /// Current order recorded for the block based at `addr`.
    pub fn order_of(&self, addr: VirtAddr) -> u8 {
        let index = self.page_index(addr);
        let byte = unsafe { self.orders.as_ptr().add((index / 2) as usize).read() };
        if index % 2 == 0 { byte & 0x0F } else { byte >> 4 }
    }

    fn set_order(&mut self, addr: VirtAddr, order: u8) {
        debug_assert!(order <= MAX_ORDER);
        let index = self.page_index(addr);
        let slot = unsafe { self.orders.as_ptr().add((index / 2) as usize) };
        let byte = unsafe { slot.read() };
        let updated = if index % 2 == 0 {
            (byte & 0xF0) | order
        } else {
            (byte & 0x0F) | (order << 4)
        };
        unsafe { slot.write(updated) };
    }

    fn page_index(&self, addr: VirtAddr) -> u64 {
        debug_assert!(addr >= self.start && addr < self.end);
        debug_assert!(addr.as_u64() % PAGE_SIZE == 0);
        (addr - self.start) / PAGE_SIZE
    }

    fn buddy_of(&self, addr: VirtAddr, order: u8) -> VirtAddr {
        self.start + ((addr - self.start) ^ block_bytes(order))
    }

    /// Pushes a block onto its order's freelist and records it free.
    fn insert_free(&mut self, addr: VirtAddr, order: u8) {
        self.free_lists[order as usize].push(NonNull::new(addr.as_mut_ptr()).unwrap());
        self.bitmap.set_bit(addr, true);
        self.set_order(addr, order);
    }

    /// Per-order free counts.
    pub fn stats(&self) -> BuddyStats {
        let mut stats = BuddyStats { free_per_order: [0; NUM_ORDERS], free_bytes: 0 };
        for order in 0..NUM_ORDERS {
            let count = self.free_lists[order].len();
            stats.free_per_order[order] = count;
            stats.free_bytes += count as u64 * block_bytes(order as u8);
        }
        stats
    }

    /// Bases currently on the freelist of `order`. Test support.
    pub fn free_bases(&self, order: u8) -> impl Iterator<Item = VirtAddr> + '_ {
        self.free_lists[order as usize]
            .iter()
            .map(|ptr| VirtAddr::from_ptr(ptr.as_ptr()))
    }

    /// Re-derives the allocator's invariants from scratch. Test support;
    /// never modifies state.
    ///
    /// `allocated` lists the block bases the caller believes are live,
    /// with their orders.
    pub fn validate(&self, allocated: &[(VirtAddr, u8)]) -> Result<(), &'static str> {
        let usable = self.end - self.start;

        // Every freelist entry must be a well-formed free base of its
        // order. Matching the total entry count against the bitmap
        // population then rules out duplicated and orphaned bases.
        let mut listed = 0u64;
        for order in 0..NUM_ORDERS {
            let size = block_bytes(order as u8);
            for ptr in self.free_lists[order].iter() {
                let addr = VirtAddr::from_ptr::<()>(ptr.as_ptr());
                if addr < self.start || addr.as_u64() + size > self.end.as_u64() {
                    return Err("freelist entry outside managed range");
                }
                if (addr - self.start) % size != 0 {
                    return Err("freelist entry not aligned to its order");
                }
                if !self.bitmap.is_free(addr) {
                    return Err("freelist entry not marked free");
                }
                if self.order_of(addr) != order as u8 {
                    return Err("freelist entry order mismatch");
                }
                listed += 1;
            }
        }
        if listed != self.bitmap.count_free() {
            return Err("freelists and bitmap disagree");
        }

        // Page sweep: free blocks have clear interiors and merged buddies.
        let mut index = 0;
        while index < self.n_pages {
            let addr = self.start + index * PAGE_SIZE;
            if !self.bitmap.is_free(addr) {
                index += 1;
                continue;
            }
            let order = self.order_of(addr);
            let pages = 1u64 << order;
            for interior in 1..pages {
                if self.bitmap.is_free(addr + interior * PAGE_SIZE) {
                    return Err("page inside a free block marked free");
                }
            }
            let buddy_rel = (addr - self.start) ^ block_bytes(order);
            if buddy_rel + block_bytes(order) <= usable {
                let buddy = self.start + buddy_rel;
                if self.bitmap.is_free(buddy) && self.order_of(buddy) == order {
                    return Err("two free buddies left unmerged");
                }
            }
            index += pages;
        }

        for &(addr, order) in allocated {
            if self.bitmap.is_free(addr) {
                return Err("allocated base marked free");
            }
            if self.order_of(addr) != order {
                return Err("allocated base has wrong order");
            }
        }

        Ok(())
    }
}
