//! Self tests for the memory subsystem.
//!
//! Run by booting with the `self-test` feature; the kernel executes every
//! test over a QEMU guest with at least 256 MiB of RAM and exits through
//! the debug port. Tests that need raw memory map their own scratch
//! ranges; tests of the buddy and heap build private allocator instances
//! so the global ones stay undisturbed.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::VirtAddr;

use super::bitmap::Bitmap;
use super::buddy::{BuddyAllocator, MAX_ORDER, NUM_ORDERS, block_bytes};
use super::bump::BumpAllocator;
use super::freelist::{FreeList, LinkedFreeList, OwnedFreeList};
use super::heap::{Heap, MIN_BLOCK_SIZE, PREFIX_SIZE};
use super::pmm::{self, PmmBacking};
use super::rbtree::{RbNode, RbTree};
use super::slab::Slab;
use super::vmm::{self, ReserveError, VirtualMemoryManager};
use super::{PAGE_SIZE, align_up, paging};

/// Runs every memory test and exits QEMU.
pub fn main() -> ! {
    crate::testing::run(&[
        &bump_monotonic,
        &bitmap_set_and_check,
        &bitmap_hint_scan,
        &freelist_lifo,
        &linked_freelist_pop_specific,
        &owned_freelist_owner,
        &rbtree_insert_contains_remove,
        &rbtree_duplicate_policy,
        &rbtree_neighbors,
        &slab_bootstrap_then_chunks,
        &buddy_metadata_fixpoint,
        &buddy_descending_orders,
        &buddy_disjoint_regions,
        &buddy_split_merge_round_trip,
        &buddy_boundary_merge,
        &buddy_liveness,
        &buddy_validator_idempotent,
        &buddy_split_allocation_refree,
        &buddy_fuzz,
        &heap_triple_coalesce,
        &heap_no_split_reuse,
        &heap_split_reuse,
        &heap_best_fit,
        &heap_alignment,
        &heap_exhaustion,
        &heap_fuzz,
        &vmm_reservations,
        &vmm_global_covers_heap,
        &pmm_page_cache_lifo,
        &pmm_large_blocks,
        &global_heap_boxes,
        &global_heap_growing_vec,
        &global_heap_big_type,
    ])
}

/// Virtual window the tests carve their scratch mappings from.
const SCRATCH_START: u64 = 0xFFFF_B000_0000_0000;
static SCRATCH_NEXT: AtomicU64 = AtomicU64::new(SCRATCH_START);

/// Maps `len` bytes of fresh scratch memory, leaving an unmapped guard
/// page behind it.
fn scratch(len: u64) -> VirtAddr {
    let len = align_up(len, PAGE_SIZE);
    let start = SCRATCH_NEXT.fetch_add(len + PAGE_SIZE, Ordering::Relaxed);
    paging::map_range(VirtAddr::new(start), len).expect("scratch mapping failed");
    VirtAddr::new(start)
}

/// Builds a buddy allocator over a fresh data range of `data_bytes`, with
/// its metadata bumped out of a separate scratch range. No regions are
/// added yet.
fn scratch_buddy(data_bytes: u64) -> BuddyAllocator {
    let data = scratch(data_bytes);
    let n_pages = data_bytes / PAGE_SIZE;
    let meta_bytes = align_up(
        Bitmap::<false>::required_bytes(n_pages) + n_pages.div_ceil(2),
        PAGE_SIZE,
    );
    let meta = scratch(meta_bytes);
    let mut bump = BumpAllocator::new(meta, meta + meta_bytes);
    BuddyAllocator::init(data, data + data_bytes, &mut bump).expect("buddy metadata")
}

fn scratch_heap(pages: u64) -> Heap<PmmBacking> {
    let start = scratch(pages * PAGE_SIZE);
    Heap::new(start, start + pages * PAGE_SIZE, PmmBacking)
}

fn layout(size: usize, align: usize) -> Layout {
    Layout::from_size_align(size, align).unwrap()
}

/// Deterministic xorshift generator for the fuzz tests.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

// --- bump ---------------------------------------------------------------

fn bump_monotonic() {
    let base = scratch(2 * PAGE_SIZE);
    let mut bump = BumpAllocator::new(base, base + 2 * PAGE_SIZE);

    let mut last = 0;
    let mut room = bump.remaining();
    for (size, align) in [(1u64, 1u64), (13, 8), (100, 64), (512, 512), (7, 2)] {
        let addr = bump.alloc(size, align).expect("bump exhausted early");
        assert!(addr.as_u64() % align == 0);
        assert!(addr.as_u64() > last, "bump cursor moved backwards");
        assert!(bump.remaining() < room, "cursor did not advance");
        last = addr.as_u64();
        room = bump.remaining();
    }

    // The rest of the range is too small for another page.
    assert!(bump.alloc(2 * PAGE_SIZE, 1).is_none());
    // Failed allocations leave the cursor alone.
    let after = bump.alloc(8, 8).unwrap();
    assert!(after.as_u64() > last);
}

// --- bitmap -------------------------------------------------------------

fn bitmap_set_and_check() {
    let base = scratch(PAGE_SIZE);
    let mut bump = BumpAllocator::new(base, base + PAGE_SIZE);
    // 100 blocks spans two words with a masked tail.
    let blocks_base = VirtAddr::new(0x5000_0000);
    let mut bitmap: Bitmap<false> =
        Bitmap::new(blocks_base, 64, 100, &mut bump).expect("bitmap storage");

    assert_eq!(bitmap.count_free(), 0);
    for i in [0u64, 1, 63, 64, 99] {
        let addr = blocks_base + i * 64;
        assert!(!bitmap.is_free(addr));
        bitmap.set_bit(addr, true);
        assert!(bitmap.is_free(addr));
    }
    assert_eq!(bitmap.count_free(), 5);

    bitmap.set_bit(blocks_base + 63 * 64, false);
    assert!(!bitmap.is_free(blocks_base + 63 * 64));
    assert_eq!(bitmap.count_free(), 4);
}

fn bitmap_hint_scan() {
    let base = scratch(PAGE_SIZE);
    let mut bump = BumpAllocator::new(base, base + PAGE_SIZE);
    let blocks_base = VirtAddr::new(0x5000_0000);
    let mut bitmap: Bitmap<true> =
        Bitmap::new(blocks_base, PAGE_SIZE, 200, &mut bump).expect("bitmap storage");

    let free_blocks = [5u64, 64, 65, 130, 199];
    for &i in &free_blocks {
        bitmap.set_bit(blocks_base + i * PAGE_SIZE, true);
    }

    // The scan pops blocks lowest-first and exhausts exactly the set bits.
    for &i in &free_blocks {
        let hint_word = bitmap.hint();
        assert!(hint_word <= i / 64, "hint overshot a set bit");
        assert_eq!(bitmap.get_next_free(), Some(blocks_base + i * PAGE_SIZE));
    }
    assert_eq!(bitmap.get_next_free(), None);

    // Freeing an earlier block pulls the hint back.
    bitmap.set_bit(blocks_base + 70 * PAGE_SIZE, true);
    bitmap.set_bit(blocks_base + 3 * PAGE_SIZE, true);
    assert_eq!(bitmap.get_next_free(), Some(blocks_base + 3 * PAGE_SIZE));
    assert_eq!(bitmap.get_next_free(), Some(blocks_base + 70 * PAGE_SIZE));
    assert_eq!(bitmap.get_next_free(), None);
}

// --- freelists ----------------------------------------------------------

/// Maps a scratch page and hands out 64-byte node slots from it.
fn page_slots() -> impl Fn(u64) -> NonNull<()> {
    let base = scratch(PAGE_SIZE);
    move |i| NonNull::new((base + i * 64).as_mut_ptr()).unwrap()
}

fn freelist_lifo() {
    let slot = page_slots();
    let mut list = FreeList::new();
    assert!(list.pop().is_none());

    list.push(slot(0));
    list.push(slot(1));
    assert_eq!(list.len(), 2);
    assert_eq!(list.pop(), Some(slot(1)));
    assert_eq!(list.pop(), Some(slot(0)));
    assert_eq!(list.pop(), None);
    assert!(list.is_empty());
}

fn linked_freelist_pop_specific() {
    let slot = page_slots();

    // Sole element.
    let mut list = LinkedFreeList::new();
    list.push(slot(0));
    assert_eq!(list.pop_specific(slot(0)), Some(slot(0)));
    assert!(list.is_empty());

    // Head, middle, and tail of a longer list. Pushes are LIFO, so the
    // list reads 3, 2, 1, 0.
    for i in 0..4 {
        list.push(slot(i));
    }
    assert_eq!(list.pop_specific(slot(3)), Some(slot(3))); // head
    assert_eq!(list.pop_specific(slot(1)), Some(slot(1))); // middle
    assert_eq!(list.pop_specific(slot(0)), Some(slot(0))); // tail
    assert_eq!(list.len(), 1);
    assert_eq!(list.pop(), Some(slot(2)));
}

fn owned_freelist_owner() {
    let slot = page_slots();
    let mut owner_a = 0u64;
    let mut owner_b = 0u64;

    let mut list = OwnedFreeList::new();
    list.push(slot(0), &mut owner_a);
    list.push(slot(1), &mut owner_b);
    list.push(slot(2), &mut owner_a);

    unsafe {
        assert_eq!(OwnedFreeList::<u64>::owner_of(slot(0)), &mut owner_a as *mut u64);
        assert_eq!(OwnedFreeList::<u64>::owner_of(slot(1)), &mut owner_b as *mut u64);
    }

    assert_eq!(list.pop_specific(slot(1)), Some(slot(1)));
    assert_eq!(list.pop(), Some(slot(2)));
    assert_eq!(list.pop(), Some(slot(0)));
    assert!(list.is_empty());
}

// --- red-black tree -----------------------------------------------------

fn node_handle(node: &mut Box<RbNode<u64>>) -> NonNull<RbNode<u64>> {
    NonNull::new(node.as_mut() as *mut _).unwrap()
}

fn rbtree_insert_contains_remove() {
    let mut tree: RbTree<u64, fn(&u64, &u64) -> core::cmp::Ordering> = RbTree::new(u64::cmp);
    let mut nodes: Vec<Box<RbNode<u64>>> = Vec::new();
    let mut rng = XorShift(0x1234_5678_9abc_def1);

    // Insert a shuffled range, checking the invariants as the tree grows.
    let mut values: Vec<u64> = (0..128).collect();
    for i in (1..values.len()).rev() {
        let j = (rng.next() % (i as u64 + 1)) as usize;
        values.swap(i, j);
    }
    for &v in &values {
        nodes.push(Box::new(RbNode::new(v)));
        let handle = node_handle(nodes.last_mut().unwrap());
        tree.insert(handle).expect("value is unique");
        tree.check_invariants().expect("rb invariants after insert");
    }

    assert_eq!(tree.len(), 128);
    for v in 0..128 {
        assert!(tree.contains(&v));
    }
    assert!(!tree.contains(&128));

    // An in-order walk sees the sorted range.
    let mut walked = Vec::new();
    let mut current = tree.first();
    while let Some(node) = current {
        walked.push(unsafe { node.as_ref().value });
        current = tree.successor(node);
    }
    assert_eq!(walked, (0..128).collect::<Vec<u64>>());

    // Remove in a different shuffled order.
    for i in (1..values.len()).rev() {
        let j = (rng.next() % (i as u64 + 1)) as usize;
        values.swap(i, j);
    }
    for &v in &values {
        let node = tree.find(&v).expect("value present before removal");
        let removed = tree.remove(node);
        assert_eq!(unsafe { removed.as_ref().value }, v);
        assert!(!tree.contains(&v));
        tree.check_invariants().expect("rb invariants after remove");
    }
    assert!(tree.is_empty());
}

fn rbtree_duplicate_policy() {
    let mut rejecting: RbTree<u64, fn(&u64, &u64) -> core::cmp::Ordering> = RbTree::new(u64::cmp);
    let mut a = Box::new(RbNode::new(7u64));
    let mut b = Box::new(RbNode::new(7u64));
    rejecting.insert(node_handle(&mut a)).unwrap();
    assert!(rejecting.insert(node_handle(&mut b)).is_err());
    assert_eq!(rejecting.len(), 1);

    let mut multi: RbTree<u64, fn(&u64, &u64) -> core::cmp::Ordering, true> =
        RbTree::new(u64::cmp);
    let mut nodes: Vec<Box<RbNode<u64>>> = (0..8).map(|_| Box::new(RbNode::new(7u64))).collect();
    for node in &mut nodes {
        multi.insert(node_handle(node)).unwrap();
        multi.check_invariants().unwrap();
    }
    assert_eq!(multi.len(), 8);
}

fn rbtree_neighbors() {
    let mut tree: RbTree<u64, fn(&u64, &u64) -> core::cmp::Ordering> = RbTree::new(u64::cmp);
    let mut nodes: Vec<Box<RbNode<u64>>> = Vec::new();
    for v in [10u64, 20, 30, 40] {
        nodes.push(Box::new(RbNode::new(v)));
        let handle = node_handle(nodes.last_mut().unwrap());
        tree.insert(handle).unwrap();
    }

    let value = |n: Option<NonNull<RbNode<u64>>>| n.map(|n| unsafe { n.as_ref().value });

    // A present value is its own neighbor on both sides.
    let (lower, upper) = tree.find_neighbors(&20);
    assert_eq!(value(lower), Some(20));
    assert_eq!(value(upper), Some(20));

    let (lower, upper) = tree.find_neighbors(&25);
    assert_eq!(value(lower), Some(20));
    assert_eq!(value(upper), Some(30));

    let (lower, upper) = tree.find_neighbors(&5);
    assert_eq!(value(lower), None);
    assert_eq!(value(upper), Some(10));

    let (lower, upper) = tree.find_neighbors(&45);
    assert_eq!(value(lower), Some(40));
    assert_eq!(value(upper), None);

    assert_eq!(value(tree.lower_bound(&21)), Some(30));
    assert_eq!(value(tree.lower_bound(&40)), Some(40));
    assert_eq!(value(tree.lower_bound(&41)), None);
}

// --- slab ---------------------------------------------------------------

fn slab_bootstrap_then_chunks() {
    type Obj = [u64; 4];
    let mut slab: Slab<Obj, PmmBacking, 4, 8> = Slab::new(PmmBacking);

    // The first four objects come from the embedded bootstrap array.
    let slab_addr = &slab as *const _ as usize;
    let slab_end = slab_addr + size_of::<Slab<Obj, PmmBacking, 4, 8>>();
    let mut objects = Vec::new();
    for _ in 0..4 {
        let obj = slab.alloc().expect("bootstrap slot");
        let addr = obj.as_ptr() as usize;
        assert!(addr >= slab_addr && addr < slab_end, "bootstrap slot outside the slab");
        objects.push(obj);
    }

    // The fifth allocation needs one backing chunk; seven freelist slots
    // remain from it.
    for _ in 0..8 {
        objects.push(slab.alloc().expect("chunk slot"));
    }
    assert_eq!(slab.outstanding(), 12);

    // Freed objects come back before any new chunk is requested.
    let recycled = objects.pop().unwrap();
    slab.free(recycled);
    assert_eq!(slab.alloc(), Some(recycled));

    for obj in objects.drain(..) {
        slab.free(obj);
    }
    slab.free(recycled);
    assert_eq!(slab.outstanding(), 0);

    // Deinit releases exactly the chunks that were requested.
    slab.deinit();
}

// --- buddy --------------------------------------------------------------

fn buddy_metadata_fixpoint() {
    let start = VirtAddr::new(0x1000_0000);
    for pages in [8u64, 1024, 11231, 16384] {
        let end = start + pages * PAGE_SIZE;
        let metadata = BuddyAllocator::required_memory(start, end);
        // Reserving the metadata leaves a data region whose own metadata
        // need is exactly what was reserved.
        let data_pages = (pages * PAGE_SIZE - metadata) / PAGE_SIZE;
        let recomputed = align_up(
            Bitmap::<false>::required_bytes(data_pages) + data_pages.div_ceil(2),
            PAGE_SIZE,
        );
        assert_eq!(metadata, recomputed);
    }
}

/// Scenario: a range of ten order-10 blocks followed by a descending tail
/// with the order-5 block missing.
fn buddy_descending_orders() {
    let tail_pages: u64 = (0..10).filter(|k| *k != 5).map(|k| 1u64 << k).sum();
    let data_pages = 10 * 1024 + tail_pages;
    let mut buddy = scratch_buddy(data_pages * PAGE_SIZE);
    let start = buddy.start();
    buddy.add_region(start, buddy.end());

    let stats = buddy.stats();
    assert_eq!(
        stats.free_per_order,
        [1, 1, 1, 1, 1, 0, 1, 1, 1, 1, 10],
        "descending packing did not produce the expected orders"
    );

    let mut top_bases: Vec<u64> = buddy
        .free_bases(MAX_ORDER)
        .map(|a| (a - start) / PAGE_SIZE)
        .collect();
    top_bases.sort_unstable();
    let expected: Vec<u64> = (0..10).map(|i| i * 1024).collect();
    assert_eq!(top_bases, expected);

    // The tail singletons pack densely after the big blocks.
    let mut offset = 10 * 1024;
    for order in (0..10u8).rev().filter(|o| *o != 5) {
        let bases: Vec<u64> = buddy
            .free_bases(order)
            .map(|a| (a - start) / PAGE_SIZE)
            .collect();
        assert_eq!(bases, [offset], "singleton at wrong offset for its order");
        offset += 1 << order;
    }

    buddy.validate(&[]).expect("fresh region is coherent");
}

/// Disjoint sub-ranges can be added one after another, and the hole
/// between them never becomes allocatable or merges away.
fn buddy_disjoint_regions() {
    let mut buddy = scratch_buddy(8 * PAGE_SIZE);
    let start = buddy.start();
    buddy.add_region(start, start + 3 * PAGE_SIZE);
    buddy.add_region(start + 4 * PAGE_SIZE, start + 8 * PAGE_SIZE);
    buddy.validate(&[]).unwrap();

    // [0, 3): an order-1 pair plus a single page; [4, 8): one order-2
    // block.
    let stats = buddy.stats();
    assert_eq!(stats.free_per_order[0], 1);
    assert_eq!(stats.free_per_order[1], 1);
    assert_eq!(stats.free_per_order[2], 1);

    let a = buddy.alloc(block_bytes(2)).unwrap();
    assert_eq!(a, start + 4 * PAGE_SIZE);
    buddy.free(a);
    buddy.validate(&[]).unwrap();
    assert_eq!(buddy.stats().free_per_order[2], 1);
}

/// Scenario: splitting an order-1 block twice and freeing both halves
/// merges back to the original block.
fn buddy_split_merge_round_trip() {
    let mut buddy = scratch_buddy(2 * PAGE_SIZE);
    let start = buddy.start();
    buddy.add_region(start, buddy.end());

    let before = buddy.stats();
    let a = buddy.alloc(PAGE_SIZE).expect("first half");
    let b = buddy.alloc(PAGE_SIZE).expect("second half");
    assert_eq!((a - start).abs_diff(b - start), PAGE_SIZE);
    buddy.validate(&[(a, 0), (b, 0)]).unwrap();

    buddy.free(a);
    buddy.free(b);
    let after = buddy.stats();
    assert_eq!(after, before, "split and merge did not round-trip");
    assert_eq!(after.free_per_order[1], 1);
    assert_eq!(after.free_per_order[0], 0);
    buddy.validate(&[]).unwrap();
}

/// Scenario: in a `2^10 + 2^6` page range, a freed order-4 block coalesces
/// up to order 6 and stops there, because the order-7 buddy would lie past
/// the end of the managed range.
fn buddy_boundary_merge() {
    let data_pages = 1024 + 64;
    let mut buddy = scratch_buddy(data_pages * PAGE_SIZE);
    let start = buddy.start();
    buddy.add_region(start, buddy.end());

    let big = buddy.alloc(block_bytes(10)).expect("head block");
    assert_eq!(big, start);
    let small = buddy.alloc(block_bytes(4)).expect("tail block");
    assert_eq!((small - start) / PAGE_SIZE, 1024);
    buddy.validate(&[(big, 10), (small, 4)]).unwrap();

    buddy.free(small);
    let stats = buddy.stats();
    assert_eq!(stats.free_per_order[6], 1, "tail did not coalesce to order 6");
    assert_eq!(stats.free_per_order[4], 0);
    assert_eq!(stats.free_per_order[5], 0);
    assert_eq!(stats.free_per_order[10], 0, "merge crossed the range boundary");
    buddy.validate(&[(big, 10)]).unwrap();
}

/// With a free block of order `k`, every allocation of order `<= k`
/// succeeds.
fn buddy_liveness() {
    let mut buddy = scratch_buddy(block_bytes(6));
    buddy.add_region(buddy.start(), buddy.end());

    for order in 0..=6u8 {
        let addr = buddy.alloc(block_bytes(order)).expect("liveness violated");
        buddy.free(addr);
        buddy.validate(&[]).unwrap();
    }
    // Beyond the range's largest block, allocation fails cleanly.
    assert!(buddy.alloc(block_bytes(7)).is_none());
}

fn buddy_validator_idempotent() {
    let mut buddy = scratch_buddy(block_bytes(4));
    buddy.add_region(buddy.start(), buddy.end());
    let a = buddy.alloc(PAGE_SIZE).unwrap();

    let before = buddy.stats();
    buddy.validate(&[(a, 0)]).unwrap();
    buddy.validate(&[(a, 0)]).unwrap();
    assert_eq!(buddy.stats(), before, "validation mutated allocator state");
    buddy.free(a);
}

/// Pages produced by `split_allocation` can be freed one by one and merge
/// back into the block they came from.
fn buddy_split_allocation_refree() {
    let mut buddy = scratch_buddy(block_bytes(2));
    let start = buddy.start();
    buddy.add_region(start, buddy.end());

    let block = buddy.alloc(block_bytes(2)).unwrap();
    buddy.split_allocation(block, 0);
    let allocated: Vec<(VirtAddr, u8)> = (0..4).map(|i| (block + i * PAGE_SIZE, 0)).collect();
    buddy.validate(&allocated).unwrap();

    for (page, _) in &allocated {
        buddy.free(*page);
    }
    let stats = buddy.stats();
    assert_eq!(stats.free_per_order[2], 1, "pages did not merge back");
    buddy.validate(&[]).unwrap();
}

/// Scenario: random allocate/free traffic over a range of eight order-10
/// blocks, validating the allocator after every operation.
fn buddy_fuzz() {
    const OPS: usize = 1024;
    const MAX_LIVE: usize = 16384;

    let mut buddy = scratch_buddy(8 * block_bytes(10));
    buddy.add_region(buddy.start(), buddy.end());
    let full = buddy.stats();

    let mut rng = XorShift(0xdead_beef_cafe_f00d);
    let mut live: Vec<(VirtAddr, u8)> = Vec::new();

    for _ in 0..OPS {
        let allocate = live.is_empty() || (rng.next() % 2 == 0 && live.len() < MAX_LIVE);
        if allocate {
            let order = (rng.next() % NUM_ORDERS as u64) as u8;
            if let Some(addr) = buddy.alloc(block_bytes(order)) {
                live.push((addr, order));
            }
        } else {
            let index = (rng.next() % live.len() as u64) as usize;
            let (addr, _) = live.swap_remove(index);
            buddy.free(addr);
        }
        buddy.validate(&live).expect("buddy invariant violated under fuzz");
    }

    for (addr, _) in live.drain(..) {
        buddy.free(addr);
    }
    buddy.validate(&[]).unwrap();
    assert_eq!(buddy.stats(), full, "drained allocator did not fully merge");
}

// --- heap ---------------------------------------------------------------

/// Scenario: freeing A, C, then B leaves one bucket spanning all three
/// blocks, with the inner boundary tags absorbed.
fn heap_triple_coalesce() {
    let mut heap = scratch_heap(4);
    let a = heap.alloc(layout(128, 8)).unwrap();
    let b = heap.alloc(layout(160, 8)).unwrap();
    let c = heap.alloc(layout(96, 8)).unwrap();

    heap.free(a);
    heap.validate().unwrap();
    assert!(heap.has_bucket(136));

    heap.free(c);
    heap.validate().unwrap();
    assert!(heap.has_bucket(104));

    heap.free(b);
    heap.validate().unwrap();
    let total = (136 + 168 + 104) + 2 * PREFIX_SIZE;
    assert_eq!(heap.stats().buckets, 1, "coalescing left extra buckets");
    assert!(heap.has_bucket(total));
    assert!(!heap.has_bucket(136));
    assert!(!heap.has_bucket(168));
    assert!(!heap.has_bucket(104));
}

/// Scenario: a request that would leave a tail below the minimum block
/// size takes the whole bucket instead of splitting it.
fn heap_no_split_reuse() {
    let mut heap = scratch_heap(4);
    let p = heap.alloc(layout(256, 8)).unwrap();
    heap.free(p);
    assert!(heap.has_bucket(264));

    // 208 bytes needs a 216-byte bucket; the 48-byte tail is below the
    // minimum block and must be absorbed.
    assert!(264 - 216 < MIN_BLOCK_SIZE);
    let q = heap.alloc(layout(208, 8)).unwrap();
    assert_eq!(p, q, "block was not reused in place");
    assert_eq!(heap.stats().buckets, 0, "bucket was not removed from the tree");
    heap.validate().unwrap();
    heap.free(q);
}

/// Scenario: a small request splits a larger freed block and the tail goes
/// back into the tree.
fn heap_split_reuse() {
    let mut heap = scratch_heap(4);
    let p = heap.alloc(layout(256, 8)).unwrap();
    heap.free(p);
    assert!(heap.has_bucket(264));

    let q = heap.alloc(layout(64, 8)).unwrap();
    assert_eq!(p, q, "block was not reused in place");
    assert!(heap.has_bucket(176), "split tail missing from the tree");
    assert!(!heap.has_bucket(264), "original bucket left in the tree");
    heap.validate().unwrap();
}

fn heap_best_fit() {
    let mut heap = scratch_heap(8);
    // Lay out allocations so freeing leaves two separated buckets.
    let small = heap.alloc(layout(96, 8)).unwrap();
    let _pin1 = heap.alloc(layout(64, 8)).unwrap();
    let large = heap.alloc(layout(512, 8)).unwrap();
    let _pin2 = heap.alloc(layout(64, 8)).unwrap();
    heap.free(small);
    heap.free(large);
    assert!(heap.has_bucket(104));
    assert!(heap.has_bucket(520));
    heap.validate().unwrap();

    // A request between the two sizes must come from the larger bucket.
    let mid = heap.alloc(layout(150, 8)).unwrap();
    assert_eq!(mid, large, "best fit skipped the smallest sufficient bucket");
    assert!(heap.has_bucket(104), "wrong bucket was consumed");
    heap.validate().unwrap();
}

fn heap_alignment() {
    let mut heap = scratch_heap(8);
    for align in [16usize, 64, 256, 1024] {
        let ptr = heap.alloc(layout(100, align)).unwrap();
        assert!(ptr.as_ptr() as usize % align == 0, "misaligned allocation");
        heap.validate().unwrap();
        heap.free(ptr);
        heap.validate().unwrap();
    }

    // Alignment also holds when reusing a freed block.
    let a = heap.alloc(layout(600, 8)).unwrap();
    heap.free(a);
    let b = heap.alloc(layout(128, 256)).unwrap();
    assert!(b.as_ptr() as usize % 256 == 0);
    heap.validate().unwrap();
}

fn heap_exhaustion() {
    let mut heap = scratch_heap(2);
    let mut live = Vec::new();
    while let Some(ptr) = heap.alloc(layout(496, 8)) {
        live.push(ptr);
    }
    assert!(!live.is_empty());
    assert!(heap.alloc(layout(496, 8)).is_none(), "allocation past the reservation");
    heap.validate().unwrap();

    // Freeing everything coalesces the committed range into one block.
    for ptr in live.drain(..) {
        heap.free(ptr);
    }
    heap.validate().unwrap();
    assert_eq!(heap.stats().buckets, 1);

    // And the space is usable again.
    let again = heap.alloc(layout(496, 8)).unwrap();
    heap.free(again);
}

/// Random allocate/free traffic against a private heap, validating the
/// boundary tags and the tree after every operation.
fn heap_fuzz() {
    const OPS: usize = 512;

    let mut heap = scratch_heap(32);
    let mut rng = XorShift(0x0123_4567_89ab_cdef);
    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

    for _ in 0..OPS {
        let allocate = live.is_empty() || rng.next() % 2 == 0;
        if allocate {
            let size = 1 + (rng.next() % 1024) as usize;
            let align = 1usize << (rng.next() % 7);
            if let Some(ptr) = heap.alloc(layout(size, align)) {
                assert!(ptr.as_ptr() as usize % align == 0);
                // Stamp the user area to catch overlapping blocks.
                unsafe { ptr.as_ptr().write_bytes(size as u8, size) };
                live.push((ptr, size));
            }
        } else {
            let index = (rng.next() % live.len() as u64) as usize;
            let (ptr, size) = live.swap_remove(index);
            assert_eq!(unsafe { ptr.as_ptr().read() }, size as u8, "allocation clobbered");
            heap.free(ptr);
        }
        heap.validate().expect("heap invariant violated under fuzz");
    }

    for (ptr, _) in live.drain(..) {
        heap.free(ptr);
    }
    heap.validate().unwrap();
    assert!(heap.stats().buckets <= 1);
}

// --- vmm ----------------------------------------------------------------

fn vmm_reservations() {
    let start = VirtAddr::new(0x2000_0000_0000);
    let mut table = VirtualMemoryManager::new(start, start + 16 * PAGE_SIZE);

    assert_eq!(table.reserve(0, 8), Err(ReserveError::InvalidSize));

    let a = table.reserve(PAGE_SIZE, PAGE_SIZE).unwrap();
    assert_eq!(a, start);
    let b = table.reserve(3 * PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
    assert_eq!(b.as_u64() % (2 * PAGE_SIZE), 0);
    assert!(b >= a + PAGE_SIZE);
    assert_eq!(table.len(), 2);
    assert_eq!(table.remaining(), 11 * PAGE_SIZE);

    assert!(table.is_valid(a));
    assert!(table.is_valid(b + (3 * PAGE_SIZE - 1)));
    assert!(!table.is_valid(b + 3 * PAGE_SIZE));
    // The alignment gap between reservations stays invalid.
    assert!(!table.is_valid(a + PAGE_SIZE));

    assert_eq!(
        table.reserve(1024 * PAGE_SIZE, PAGE_SIZE),
        Err(ReserveError::OutOfAddressSpace)
    );

    let mut filling = VirtualMemoryManager::new(start, start + (2 * vmm::MAX_RESERVATIONS as u64) * PAGE_SIZE);
    for _ in 0..vmm::MAX_RESERVATIONS {
        filling.reserve(PAGE_SIZE, PAGE_SIZE).unwrap();
    }
    assert_eq!(
        filling.reserve(PAGE_SIZE, PAGE_SIZE),
        Err(ReserveError::TooManyReservations)
    );
}

/// The global table knows about the heap's reservation.
fn vmm_global_covers_heap() {
    let heap_byte = VirtAddr::new(vmm::VMM_START);
    assert!(vmm::is_valid(heap_byte), "heap reservation missing from the global vmm");
    assert!(!vmm::is_valid(VirtAddr::new(vmm::VMM_START + vmm::VMM_SIZE)));

    // A fresh reservation is immediately visible and usable once mapped.
    let pages = 4;
    let fresh = vmm::reserve_pages(pages).expect("address space left");
    assert!(vmm::is_valid(fresh));
    paging::map_range(fresh, pages * PAGE_SIZE).expect("mapping reserved range");
    unsafe {
        fresh.as_mut_ptr::<u64>().write(0x55AA);
        assert_eq!(fresh.as_ptr::<u64>().read(), 0x55AA);
    }
}

// --- pmm ----------------------------------------------------------------

fn pmm_page_cache_lifo() {
    let page = layout(PAGE_SIZE as usize, PAGE_SIZE as usize);

    let a = pmm::allocate(page).expect("page");
    let b = pmm::allocate(page).expect("page");
    pmm::deallocate(a, page);
    pmm::deallocate(b, page);

    // The cache is a per-core stack: frees come back newest-first without
    // touching the buddy.
    assert_eq!(pmm::allocate(page), Some(b));
    assert_eq!(pmm::allocate(page), Some(a));
    pmm::deallocate(a, page);
    pmm::deallocate(b, page);
}

fn pmm_large_blocks() {
    let big = layout(8 * PAGE_SIZE as usize, PAGE_SIZE as usize);
    let before = pmm::stats().expect("pmm initialized");

    let a = pmm::allocate(big).expect("order-3 block");
    assert!(a.as_ptr() as u64 % PAGE_SIZE == 0);
    let after = pmm::stats().unwrap();
    assert!(after.free_bytes <= before.free_bytes - 8 * PAGE_SIZE);

    pmm::deallocate(a, big);
    assert_eq!(pmm::stats().unwrap().free_bytes, before.free_bytes);
}

// --- global heap --------------------------------------------------------

fn global_heap_boxes() {
    let x = Box::new(42u64);
    assert_eq!(*x, 42);
    for i in 0..10_000u64 {
        let b = Box::new(i);
        assert_eq!(*b, i);
    }
}

fn global_heap_growing_vec() {
    let mut v = Vec::new();
    for i in 0..100_000u64 {
        v.push(i);
    }
    assert_eq!(v.iter().sum::<u64>(), (100_000u64 - 1) * 100_000 / 2);
}

fn global_heap_big_type() {
    let x = Box::new([7u8; 1_000_000]);
    assert!(x.iter().all(|&b| b == 7));
}
