use std::alloc::Layout;
use std::cell::Cell;
use std::ptr::NonNull;

use crate::cell::CellState;
use crate::error::AllocationError;
use crate::gc::AllocationHeader;
use crate::heap::HeapInner;

pub(crate) const BLOCK_SIZE: usize = 16 * 1024;
pub(crate) const BLOCK_MASK: usize = !(BLOCK_SIZE - 1);

/// Enough mark bits for the densest block (64-byte cells).
const MARK_WORDS: usize = 4;

const fn round_up_to_16(value: usize) -> usize {
    (value + 15) & !15
}

/// A fixed-size, block-size-aligned chunk of memory subdivided into
/// same-size cell slots. The base address is always aligned to
/// `BLOCK_SIZE`, so masking any interior cell pointer recovers the block
/// (and through it the owning heap) without a side table.
///
/// Slots are handed out lazily (`lazy_next` bump) and recycled through a
/// freelist threaded through the dead slots' headers.
#[repr(C)]
pub(crate) struct HeapBlock {
    heap: *const HeapInner,
    cell_size: usize,
    cell_count: usize,
    lazy_next: Cell<usize>,
    freelist: Cell<*mut AllocationHeader>,
    marks: [Cell<u64>; MARK_WORDS],
}

const STORAGE_OFFSET: usize = round_up_to_16(std::mem::size_of::<HeapBlock>());

impl HeapBlock {
    fn layout() -> Layout {
        // The alignment guarantee here is what makes `from_cell` correct;
        // block memory must never come from a plain allocation.
        Layout::from_size_align(BLOCK_SIZE, BLOCK_SIZE).unwrap()
    }

    pub fn create(
        heap: *const HeapInner,
        cell_size: usize,
    ) -> Result<NonNull<HeapBlock>, AllocationError> {
        debug_assert!(cell_size % 16 == 0);
        debug_assert!(cell_size >= std::mem::size_of::<AllocationHeader>());

        let ptr = unsafe { std::alloc::alloc(Self::layout()) } as *mut HeapBlock;
        let Some(block) = NonNull::new(ptr) else {
            return Err(AllocationError::OutOfMemory);
        };

        unsafe {
            block.as_ptr().write(HeapBlock {
                heap,
                cell_size,
                cell_count: (BLOCK_SIZE - STORAGE_OFFSET) / cell_size,
                lazy_next: Cell::new(0),
                freelist: Cell::new(std::ptr::null_mut()),
                marks: [const { Cell::new(0) }; MARK_WORDS],
            });
        }

        Ok(block)
    }

    /// Releases the block's memory. Every slot must already be swept.
    pub unsafe fn destroy(block: NonNull<HeapBlock>) {
        std::alloc::dealloc(block.as_ptr() as *mut u8, Self::layout());
    }

    /// O(1) recovery of the owning block from any interior cell pointer.
    #[inline]
    pub fn from_cell(ptr: *const u8) -> *mut HeapBlock {
        (ptr as usize & BLOCK_MASK) as *mut HeapBlock
    }

    pub fn heap(&self) -> *const HeapInner {
        self.heap
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    fn storage(&self) -> *mut u8 {
        unsafe { (self as *const HeapBlock as *mut u8).add(STORAGE_OFFSET) }
    }

    pub fn cell_at(&self, index: usize) -> *mut AllocationHeader {
        debug_assert!(index < self.cell_count);
        unsafe { self.storage().add(index * self.cell_size) as *mut AllocationHeader }
    }

    #[inline]
    pub fn cell_index(&self, ptr: *const u8) -> usize {
        let offset = ptr as usize - self.storage() as usize;
        offset / self.cell_size
    }

    /// Validates an ambiguous word against this block: it only counts as a
    /// cell pointer if it lands inside a slot that has been handed out.
    pub fn cell_from_possible_pointer(&self, address: usize) -> Option<*mut AllocationHeader> {
        let base = self.storage() as usize;
        if address < base {
            return None;
        }
        let index = (address - base) / self.cell_size;
        if index >= self.lazy_next.get() {
            return None;
        }
        Some(self.cell_at(index))
    }

    pub fn allocate(&self) -> Option<*mut AllocationHeader> {
        let free = self.freelist.get();
        if !free.is_null() {
            unsafe {
                self.freelist.set((*free).next_free.get());
            }
            return Some(free);
        }

        let index = self.lazy_next.get();
        if index < self.cell_count {
            self.lazy_next.set(index + 1);
            Some(self.cell_at(index))
        } else {
            None
        }
    }

    /// Returns a swept slot to the freelist. The payload must already be
    /// destructed; only the header survives.
    pub fn deallocate(&self, cell: *mut AllocationHeader) {
        unsafe {
            debug_assert_eq!(HeapBlock::from_cell(cell as *const u8), self as *const HeapBlock as *mut HeapBlock);
            (*cell).state.set(CellState::Dead);
            (*cell).next_free.set(self.freelist.get());
        }
        self.freelist.set(cell);
    }

    pub fn is_full(&self) -> bool {
        self.freelist.get().is_null() && self.lazy_next.get() >= self.cell_count
    }

    /// Iterates every slot that has ever been handed out, live or dead.
    pub fn for_each_cell(&self, mut callback: impl FnMut(*mut AllocationHeader)) {
        for index in 0..self.lazy_next.get() {
            callback(self.cell_at(index));
        }
    }

    pub fn is_marked(&self, index: usize) -> bool {
        let word = &self.marks[index / 64];
        word.get() & (1 << (index % 64)) != 0
    }

    pub fn set_marked(&self, index: usize) {
        let word = &self.marks[index / 64];
        word.set(word.get() | (1 << (index % 64)));
    }

    pub fn clear_all_marks(&self) {
        for word in self.marks.iter() {
            word.set(0);
        }
    }
}
