use std::cell::RefCell;
use std::collections::HashSet;
use std::ptr::NonNull;

use crate::block::HeapBlock;
use crate::error::AllocationError;
use crate::gc::AllocationHeader;
use crate::heap::HeapInner;

/// Per-size-class pool manager. Blocks move between the usable and full
/// lists as slots are handed out; the sweep phase rebuilds both lists.
pub(crate) struct CellAllocator {
    cell_size: usize,
    usable_blocks: RefCell<Vec<NonNull<HeapBlock>>>,
    full_blocks: RefCell<Vec<NonNull<HeapBlock>>>,
}

impl CellAllocator {
    pub fn new(cell_size: usize) -> CellAllocator {
        CellAllocator {
            cell_size,
            usable_blocks: RefCell::new(Vec::new()),
            full_blocks: RefCell::new(Vec::new()),
        }
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    pub fn allocate(
        &self,
        heap: *const HeapInner,
        live_blocks: &RefCell<HashSet<*mut HeapBlock>>,
    ) -> Result<*mut AllocationHeader, AllocationError> {
        let mut usable = self.usable_blocks.borrow_mut();

        while let Some(&block) = usable.last() {
            let block_ref = unsafe { block.as_ref() };
            match block_ref.allocate() {
                Some(cell) => {
                    if block_ref.is_full() {
                        usable.pop();
                        self.full_blocks.borrow_mut().push(block);
                    }
                    return Ok(cell);
                }
                None => {
                    // Stale entry; it filled up without being moved.
                    usable.pop();
                    self.full_blocks.borrow_mut().push(block);
                }
            }
        }

        let block = HeapBlock::create(heap, self.cell_size)?;
        live_blocks.borrow_mut().insert(block.as_ptr());

        let cell = unsafe { block.as_ref() }
            .allocate()
            .ok_or(AllocationError::OutOfMemory)?;
        usable.push(block);
        Ok(cell)
    }

    /// Drains both block lists for sweeping; the sweep reinserts survivors
    /// through [`CellAllocator::adopt`].
    pub fn take_blocks(&self) -> Vec<NonNull<HeapBlock>> {
        let mut blocks = std::mem::take(&mut *self.usable_blocks.borrow_mut());
        blocks.append(&mut self.full_blocks.borrow_mut());
        blocks
    }

    pub fn adopt(&self, block: NonNull<HeapBlock>) {
        if unsafe { block.as_ref() }.is_full() {
            self.full_blocks.borrow_mut().push(block);
        } else {
            self.usable_blocks.borrow_mut().push(block);
        }
    }

    pub fn for_each_block(&self, mut callback: impl FnMut(&HeapBlock)) {
        for block in self.usable_blocks.borrow().iter() {
            callback(unsafe { block.as_ref() });
        }
        for block in self.full_blocks.borrow().iter() {
            callback(unsafe { block.as_ref() });
        }
    }
}
