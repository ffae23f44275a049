//! The general-purpose kernel heap.
//!
//! The heap owns a reserved virtual range and commits it front to back as a
//! sequence of boundary-tagged blocks:
//!
//! ```text
//! ┌ header ┬ padding ┬ user bytes ... ┬ footer ┐
//! ```
//!
//! The header packs a free flag and the block's `bucket_size` (the distance
//! from the freelist entry, right after the padding, to the block's end).
//! The padding word in front of the user pointer records the offset back to
//! the header, so `free` needs nothing but the pointer. The footer names
//! the header and is what lets `free` reach the *previous* block's header
//! in one step when coalescing.
//!
//! Free blocks of equal `bucket_size` share a bucket: one red-black tree
//! node holding an [`OwnedFreeList`] of the blocks. Allocation does a
//! best-fit lower-bound walk over the tree and splits oversized blocks;
//! freeing coalesces with both neighbors through the boundary tags, using
//! each neighbor's freelist node to find its bucket in O(1).

extern crate alloc;

use core::alloc::{GlobalAlloc, Layout};
use core::cmp::Ordering;
use core::ptr::NonNull;

use x86_64::VirtAddr;
use x86_64::structures::paging::Size4KiB;
use x86_64::structures::paging::mapper::MapToError;

use crate::info;

use super::freelist::{OwnedFreeList, OwnedNode};
use super::pmm::PmmBacking;
use super::rbtree::{RbNode, RbTree, Slot};
use super::slab::Slab;
use super::vmm::{self, ReserveError};
use super::{PAGE_SIZE, RawAllocator, align_up, paging};

/// Bytes the heap owns in front of the user pointer: header plus padding.
pub const PREFIX_SIZE: u64 = 2 * size_of::<u64>() as u64;
/// Bytes of the trailing footer.
pub const FOOTER_SIZE: u64 = size_of::<u64>() as u64;
const FOOTER_ALIGN: u64 = align_of::<u64>() as u64;

/// Smallest user area: a free block must be able to host its freelist node.
pub const MIN_USER_SIZE: u64 = size_of::<OwnedNode<RbNode<Bucket>>>() as u64;
pub const MIN_USER_ALIGN: u64 = align_of::<OwnedNode<RbNode<Bucket>>>() as u64;
/// Smallest whole block; split tails below this are absorbed instead.
pub const MIN_BLOCK_SIZE: u64 = PREFIX_SIZE + MIN_USER_SIZE + FOOTER_SIZE;

/// Size of the kernel heap's virtual reservation.
pub const HEAP_RESERVE_SIZE: u64 = 16 * 1024 * 1024; // 16 MiB

/// Tree nodes served from in-struct storage before the backing allocator
/// is touched.
const NODE_BOOTSTRAP: usize = 16;
/// Tree nodes per backing chunk once the bootstrap runs out.
const NODE_CHUNK: usize = 32;

const FREE_BIT: u64 = 1 << 63;
const FIELD_MASK: u64 = (1 << 48) - 1;

/// A set of free blocks sharing one `bucket_size`, keyed by that size in
/// the heap's tree.
pub struct Bucket {
    bucket_size: u64,
    blocks: OwnedFreeList<RbNode<Bucket>>,
}

impl Bucket {
    /// A detached key-only bucket for tree searches.
    fn probe(bucket_size: u64) -> Self {
        Self { bucket_size, blocks: OwnedFreeList::new() }
    }
}

fn bucket_order(a: &Bucket, b: &Bucket) -> Ordering {
    a.bucket_size.cmp(&b.bucket_size)
}

type BucketTree = RbTree<Bucket, fn(&Bucket, &Bucket) -> Ordering, false>;
type NodeSlab<B> = Slab<RbNode<Bucket>, B, NODE_BOOTSTRAP, NODE_CHUNK>;

unsafe fn write_header(header: VirtAddr, is_free: bool, bucket_size: u64) {
    debug_assert!(bucket_size <= FIELD_MASK);
    let bits = bucket_size | if is_free { FREE_BIT } else { 0 };
    unsafe { header.as_mut_ptr::<u64>().write(bits) };
}

unsafe fn read_header(header: VirtAddr) -> (bool, u64) {
    let bits = unsafe { header.as_ptr::<u64>().read() };
    (bits & FREE_BIT != 0, bits & FIELD_MASK)
}

unsafe fn write_padding(user: VirtAddr, header_offset: u64) {
    debug_assert!(header_offset <= FIELD_MASK);
    unsafe { (user - FOOTER_SIZE).as_mut_ptr::<u64>().write(header_offset) };
}

unsafe fn read_padding(user: VirtAddr) -> u64 {
    unsafe { (user - FOOTER_SIZE).as_ptr::<u64>().read() } & FIELD_MASK
}

/// Addresses are stored in 48 bits; the canonical upper half is recovered
/// by sign extension.
unsafe fn write_footer(block_end: VirtAddr, header: VirtAddr) {
    unsafe {
        (block_end - FOOTER_SIZE)
            .as_mut_ptr::<u64>()
            .write(header.as_u64() & FIELD_MASK)
    };
}

unsafe fn read_footer(block_end: VirtAddr) -> VirtAddr {
    let bits = unsafe { (block_end - FOOTER_SIZE).as_ptr::<u64>().read() };
    VirtAddr::new_truncate(bits & FIELD_MASK)
}

/// The block layout a request produces at a given freelist entry address.
struct BlockFit {
    user_base: VirtAddr,
    bucket_size: u64,
}

fn fit_at(entry: VirtAddr, user_size: u64, user_align: u64) -> BlockFit {
    let user_base = VirtAddr::new(align_up(entry.as_u64(), user_align));
    let block_end = align_up((user_base + user_size).as_u64(), FOOTER_ALIGN) + FOOTER_SIZE;
    BlockFit { user_base, bucket_size: block_end - entry.as_u64() }
}

/// Heap statistics, for logging and tests.
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    pub committed_bytes: u64,
    pub reserved_bytes: u64,
    pub buckets: usize,
}

/// A boundary-tag heap over a reserved virtual range.
///
/// The range must be mapped read-write up to wherever the commit pointer
/// may reach before the heap writes there; lumOS maps the whole
/// reservation at init. Tree nodes come from an embedded-bootstrap slab
/// backed by `B`, so the heap must not be moved once it has allocated.
pub struct Heap<B: RawAllocator> {
    reserve_start: VirtAddr,
    reserve_end: VirtAddr,
    commit_end: VirtAddr,
    tree: BucketTree,
    nodes: NodeSlab<B>,
}

unsafe impl<B: RawAllocator + Send> Send for Heap<B> {}

impl<B: RawAllocator> Heap<B> {
    /// Creates an empty heap over the reserved range `[reserve_start,
    /// reserve_end)`.
    pub fn new(reserve_start: VirtAddr, reserve_end: VirtAddr, node_backing: B) -> Self {
        assert!(reserve_start.as_u64() % PAGE_SIZE == 0);
        assert!(reserve_end > reserve_start);
        Self {
            reserve_start,
            reserve_end,
            commit_end: reserve_start,
            tree: BucketTree::new(bucket_order),
            nodes: NodeSlab::new(node_backing),
        }
    }

    /// Allocates memory for `layout`.
    ///
    /// Searches the smallest bucket that can hold the request, walks its
    /// blocks for one whose layout works out, and splits off the tail when
    /// it is big enough to stand alone. Falls back to committing fresh
    /// space from the reserved range; `None` once that runs out.
    pub fn alloc(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let user_size = (layout.size() as u64).max(MIN_USER_SIZE);
        let user_align = (layout.align() as u64).max(MIN_USER_ALIGN);

        let mut candidate = self.tree.lower_bound(&Bucket::probe(user_size));
        while let Some(bucket_node) = candidate {
            let node = bucket_node.as_ptr();
            let stored = unsafe { (*node).value.bucket_size };

            let mut fit = None;
            for entry_ptr in unsafe { (*node).value.blocks.iter() } {
                let entry = VirtAddr::from_ptr(entry_ptr.as_ptr());
                let candidate_fit = fit_at(entry, user_size, user_align);
                if stored >= candidate_fit.bucket_size {
                    fit = Some((entry, candidate_fit));
                    break;
                }
            }

            if let Some((entry, fit)) = fit {
                unsafe {
                    (*node).value.blocks.pop_specific(
                        NonNull::new(entry.as_mut_ptr()).unwrap(),
                    );
                }
                if unsafe { (*node).value.blocks.is_empty() } {
                    let node = self.tree.remove(bucket_node);
                    self.nodes.free(node);
                }
                return Some(self.place(entry, stored, fit));
            }

            candidate = self.tree.successor(bucket_node);
        }

        self.commit(user_size, user_align)
    }

    /// Writes the tags for an allocation filling a formerly free block of
    /// `stored` bucket bytes, splitting off the tail when it can stand
    /// alone.
    fn place(&mut self, entry: VirtAddr, stored: u64, fit: BlockFit) -> NonNull<u8> {
        let bucket_size = if stored - fit.bucket_size >= MIN_BLOCK_SIZE {
            let tail_header = entry + fit.bucket_size;
            let tail_entry = tail_header + PREFIX_SIZE;
            let tail_end = entry + stored;
            let tail_bucket = tail_end - tail_entry;
            unsafe {
                write_header(tail_header, true, tail_bucket);
                write_footer(tail_end, tail_header);
            }
            self.insert_free_block(tail_entry, tail_bucket);
            fit.bucket_size
        } else {
            // The tail could not host a block of its own; the allocation
            // absorbs the slack.
            stored
        };

        let header = entry - PREFIX_SIZE;
        unsafe {
            write_header(header, false, bucket_size);
            write_padding(fit.user_base, fit.user_base - header);
            write_footer(entry + bucket_size, header);
        }
        NonNull::new(fit.user_base.as_mut_ptr()).unwrap()
    }

    /// Commits a fresh block from the reserved tail.
    fn commit(&mut self, user_size: u64, user_align: u64) -> Option<NonNull<u8>> {
        let header = self.commit_end;
        let entry = header + PREFIX_SIZE;
        let fit = fit_at(entry, user_size, user_align);
        let block_end = entry + fit.bucket_size;
        if block_end > self.reserve_end {
            return None;
        }

        unsafe {
            write_header(header, false, fit.bucket_size);
            write_padding(fit.user_base, fit.user_base - header);
            write_footer(block_end, header);
        }
        self.commit_end = block_end;
        Some(NonNull::new(fit.user_base.as_mut_ptr()).unwrap())
    }

    /// Frees the allocation behind `user_ptr`, coalescing with both
    /// neighbors before the merged block goes back into the tree.
    pub fn free(&mut self, user_ptr: NonNull<u8>) {
        let user = VirtAddr::from_ptr(user_ptr.as_ptr());
        let header = user - unsafe { read_padding(user) };
        assert!(
            header >= self.reserve_start && header < self.commit_end,
            "free of a pointer outside the heap"
        );
        let (is_free, bucket_size) = unsafe { read_header(header) };
        assert!(!is_free, "heap double free");

        let mut new_header = header;
        let mut end = header + PREFIX_SIZE + bucket_size;

        if header > self.reserve_start {
            // The word in front of our header is the previous block's
            // footer and names its header.
            let prev_header = unsafe { read_footer(header) };
            let (prev_free, prev_bucket) = unsafe { read_header(prev_header) };
            debug_assert!(prev_header + PREFIX_SIZE + prev_bucket == header);
            if prev_free {
                self.remove_free_block(prev_header + PREFIX_SIZE);
                new_header = prev_header;
            }
        }

        if end < self.commit_end {
            let next_header = end;
            let (next_free, next_bucket) = unsafe { read_header(next_header) };
            if next_free {
                self.remove_free_block(next_header + PREFIX_SIZE);
                end = next_header + PREFIX_SIZE + next_bucket;
            }
        }

        let new_bucket = end - (new_header + PREFIX_SIZE);
        unsafe {
            write_header(new_header, true, new_bucket);
            write_footer(end, new_header);
        }
        self.insert_free_block(new_header + PREFIX_SIZE, new_bucket);
    }

    /// Puts a free block into the bucket for `bucket_size`, creating the
    /// bucket's tree node if this is the first block of that size. One
    /// walk: a failed search is reused as the insertion point.
    fn insert_free_block(&mut self, entry: VirtAddr, bucket_size: u64) {
        let entry_ptr = NonNull::new(entry.as_mut_ptr::<()>()).unwrap();
        match self.tree.search(&Bucket::probe(bucket_size)) {
            Slot::Found(node) => unsafe {
                (*node.as_ptr()).value.blocks.push(entry_ptr, node.as_ptr());
            },
            Slot::Vacant { parent, dir } => {
                let node = self
                    .nodes
                    .alloc()
                    .expect("heap bucket metadata exhausted");
                unsafe {
                    node.write(RbNode::new(Bucket {
                        bucket_size,
                        blocks: OwnedFreeList::new(),
                    }));
                }
                let node = self.tree.insert_at(parent, dir, node);
                unsafe {
                    (*node.as_ptr()).value.blocks.push(entry_ptr, node.as_ptr());
                }
            }
        }
    }

    /// Removes a free block from its bucket, found in O(1) through the
    /// owner pointer in the block's freelist node. Drops the bucket's tree
    /// node when the block was its last.
    fn remove_free_block(&mut self, entry: VirtAddr) {
        let entry_ptr = NonNull::new(entry.as_mut_ptr::<()>()).unwrap();
        let owner = unsafe { OwnedFreeList::<RbNode<Bucket>>::owner_of(entry_ptr) };
        unsafe { (*owner).value.blocks.pop_specific(entry_ptr) };
        if unsafe { (*owner).value.blocks.is_empty() } {
            let node = self.tree.remove(NonNull::new(owner).unwrap());
            self.nodes.free(node);
        }
    }

    /// Whether a bucket of exactly `bucket_size` exists. Test support.
    pub fn has_bucket(&self, bucket_size: u64) -> bool {
        self.tree.contains(&Bucket::probe(bucket_size))
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            committed_bytes: self.commit_end - self.reserve_start,
            reserved_bytes: self.reserve_end - self.reserve_start,
            buckets: self.tree.len(),
        }
    }

    /// Sweeps every boundary tag and cross-checks the tree against the
    /// sweep. Test support; must only be run on heaps that are not the
    /// global allocator, since it allocates its block map from there.
    #[cfg(feature = "self-test")]
    pub fn validate(&self) -> Result<(), &'static str> {
        use alloc::vec::Vec;

        struct BlockInfo {
            entry: u64,
            bucket_size: u64,
            is_free: bool,
        }

        let mut blocks: Vec<BlockInfo> = Vec::new();
        let mut current = self.reserve_start;
        let mut prev_free = false;
        while current < self.commit_end {
            let (is_free, bucket_size) = unsafe { read_header(current) };
            let entry = current + PREFIX_SIZE;
            let end = entry + bucket_size;
            if end > self.commit_end {
                return Err("block runs past the commit end");
            }
            if is_free {
                if prev_free {
                    return Err("adjacent free blocks");
                }
                if unsafe { read_footer(end) } != current {
                    return Err("free block footer does not name its header");
                }
            }
            blocks.push(BlockInfo { entry: entry.as_u64(), bucket_size, is_free });
            prev_free = is_free;
            current = end;
        }

        let mut tree_entries = 0;
        let mut prev_size = None;
        let mut node = self.tree.first();
        while let Some(n) = node {
            let bucket = unsafe { &(*n.as_ptr()).value };
            if bucket.blocks.is_empty() {
                return Err("empty bucket left in the tree");
            }
            if let Some(prev) = prev_size {
                if prev >= bucket.bucket_size {
                    return Err("bucket sizes out of order");
                }
            }
            prev_size = Some(bucket.bucket_size);

            for entry_ptr in bucket.blocks.iter() {
                let entry = entry_ptr.as_ptr() as u64;
                match blocks.iter().find(|b| b.entry == entry) {
                    None => return Err("tree lists a block the sweep did not visit"),
                    Some(b) if !b.is_free => return Err("tree lists an allocated block"),
                    Some(b) if b.bucket_size != bucket.bucket_size => {
                        return Err("listed block disagrees with its bucket size");
                    }
                    Some(_) => {}
                }
                tree_entries += 1;
            }
            node = self.tree.successor(n);
        }

        let free_count = blocks.iter().filter(|b| b.is_free).count();
        if tree_entries != free_count {
            return Err("free block count and tree entries disagree");
        }

        self.tree.check_invariants()
    }
}

/// A simple wrapper around spin::Mutex to provide safe interior mutability
pub struct Locked<A> {
    inner: spin::Mutex<A>,
}

impl<A> Locked<A> {
    pub const fn new(inner: A) -> Self {
        Locked {
            inner: spin::Mutex::new(inner),
        }
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, A> {
        self.inner.lock()
    }
}

/// The kernel heap. Empty until [`init_heap`] runs; allocation attempts
/// before that fail.
#[global_allocator]
pub static ALLOCATOR: Locked<Option<Heap<PmmBacking>>> = Locked::new(None);

/// Errors from [`init_heap`].
#[derive(Debug)]
pub enum HeapInitError {
    Reserve(ReserveError),
    Map(MapToError<Size4KiB>),
}

/// Reserves the kernel heap's virtual range, maps it read-write, and
/// installs the heap as the global allocator.
///
/// # Safety
/// Must be called once, after the physical memory manager is up and before
/// anything allocates.
pub unsafe fn init_heap() -> Result<(), HeapInitError> {
    let reserve_start =
        vmm::reserve(HEAP_RESERVE_SIZE, PAGE_SIZE).map_err(HeapInitError::Reserve)?;
    paging::map_range(reserve_start, HEAP_RESERVE_SIZE).map_err(HeapInitError::Map)?;

    let reserve_end = reserve_start + HEAP_RESERVE_SIZE;
    *ALLOCATOR.lock() = Some(Heap::new(reserve_start, reserve_end, PmmBacking));

    info!(
        "heap initialized: {:#x} - {:#x}",
        reserve_start.as_u64(),
        reserve_end.as_u64()
    );
    Ok(())
}

unsafe impl GlobalAlloc for Locked<Option<Heap<PmmBacking>>> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut inner = self.lock();
        match inner.as_mut().and_then(|heap| heap.alloc(layout)) {
            Some(ptr) => ptr.as_ptr(),
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let mut inner = self.lock();
        inner
            .as_mut()
            .expect("heap used before initialization")
            .free(NonNull::new(ptr).unwrap());
    }
}
