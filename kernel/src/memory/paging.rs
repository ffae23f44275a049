//! Page table management and frame allocation from the boot memory map.

use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use spin::Mutex;
use x86_64::{
    PhysAddr, VirtAddr,
    structures::paging::{
        FrameAllocator, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
        mapper::{MapToError, Mapper},
    },
};

use super::{PAGE_SIZE, align_up};

/// Frame allocator over the bootloader's memory map.
pub static FRAME_ALLOCATOR: Mutex<Option<BootInfoFrameAllocator>> = Mutex::new(None);

/// The active level 4 page table.
pub static PAGE_TABLE: Mutex<Option<OffsetPageTable<'static>>> = Mutex::new(None);

/// A frame allocator that returns frames from the memory regions provided by
/// the bootloader, walking the usable regions with a cursor.
pub struct BootInfoFrameAllocator {
    memory_map: &'static MemoryRegions,
    region: usize,
    next_addr: u64,
}

impl BootInfoFrameAllocator {
    /// Initializes a new frame allocator with the given memory map.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the memory map is valid.
    pub unsafe fn init(memory_map: &'static MemoryRegions) -> Self {
        Self { memory_map, region: 0, next_addr: 0 }
    }
}

unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        while self.region < self.memory_map.len() {
            let region = &self.memory_map[self.region];
            if matches!(region.kind, MemoryRegionKind::Usable) {
                let frame = align_up(region.start, PAGE_SIZE).max(self.next_addr);
                if frame + PAGE_SIZE <= region.end {
                    self.next_addr = frame + PAGE_SIZE;
                    return Some(PhysFrame::containing_address(PhysAddr::new(frame)));
                }
            }
            self.region += 1;
            self.next_addr = 0;
        }
        None
    }
}

/// Initializes the global page table from the active level 4 table.
///
/// # Safety
/// The caller must ensure that the memory offset is valid and that all
/// physical memory is mapped at that offset. May only be called once.
pub unsafe fn init(memory_offset: VirtAddr) {
    let level_4_table = unsafe { get_level_4_table(memory_offset) };
    let table = unsafe { OffsetPageTable::new(level_4_table, memory_offset) };
    *PAGE_TABLE.lock() = Some(table);
}

/// Initializes the global frame allocator from the boot memory map.
pub fn init_frame_allocator(memory_map: &'static MemoryRegions) {
    *FRAME_ALLOCATOR.lock() = Some(unsafe { BootInfoFrameAllocator::init(memory_map) });
}

/// Get a mutable reference to the start of the level 4 page table in virtual
/// memory.
///
/// # Safety
/// The caller must make sure there is a valid level 4 page table and that
/// the physical memory is mapped at `memory_offset`. May only be called
/// once to avoid multiple &mut references to the same data.
unsafe fn get_level_4_table(memory_offset: VirtAddr) -> &'static mut PageTable {
    let (level_4_table_frame, _) = x86_64::registers::control::Cr3::read();
    let phys = level_4_table_frame.start_address();
    let virt = (phys.as_u64() + memory_offset.as_u64()) as *mut PageTable;
    unsafe { &mut *virt }
}

/// Maps `len` bytes starting at `start` to freshly allocated frames,
/// read-write. Used to back the buddy's managed range and the heap's
/// reservation before their allocators touch the memory.
pub fn map_range(start: VirtAddr, len: u64) -> Result<(), MapToError<Size4KiB>> {
    let first = Page::containing_address(start);
    let last = Page::containing_address(start + (len - 1));

    for page in Page::range_inclusive(first, last) {
        let frame = FRAME_ALLOCATOR
            .lock()
            .as_mut()
            .unwrap()
            .allocate_frame()
            .ok_or(MapToError::FrameAllocationFailed)?;

        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        unsafe {
            PAGE_TABLE
                .lock()
                .as_mut()
                .unwrap()
                .map_to(page, frame, flags, FRAME_ALLOCATOR.lock().as_mut().unwrap())?
                .flush();
        }
    }

    Ok(())
}
