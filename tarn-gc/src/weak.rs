use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::block::{BLOCK_MASK, BLOCK_SIZE};
use crate::error::AllocationError;
use crate::gc::{AllocationHeader, Gc};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum WeakImplState {
    /// On the block's freelist.
    Free,
    /// Observing a cell.
    Bound,
    /// The observed cell was reclaimed; the owning handle is still alive.
    Cleared,
}

/// One pooled weak-reference slot. Bound to at most one cell at a time,
/// and never outlives its [`WeakBlock`].
pub(crate) struct WeakImpl {
    target: Cell<*const AllocationHeader>,
    next_free: Cell<*mut WeakImpl>,
    state: Cell<WeakImplState>,
}

const SLOTS_OFFSET: usize = {
    let size = std::mem::size_of::<WeakBlockHeader>();
    (size + 15) & !15
};

#[repr(C)]
struct WeakBlockHeader {
    lazy_next: Cell<usize>,
    freelist: Cell<*mut WeakImpl>,
}

/// A block-size unit of pooled weak slots, aligned like a [`HeapBlock`] so
/// a slot pointer recovers its block by masking. Weak slots are pooled
/// apart from cells: their churn never fragments the per-type allocators,
/// and the weak sweep is a flat scan independent of cell type.
///
/// [`HeapBlock`]: crate::block::HeapBlock
#[repr(C)]
pub(crate) struct WeakBlock {
    header: WeakBlockHeader,
}

impl WeakBlock {
    pub const CAPACITY: usize = (BLOCK_SIZE - SLOTS_OFFSET) / std::mem::size_of::<WeakImpl>();

    fn layout() -> Layout {
        Layout::from_size_align(BLOCK_SIZE, BLOCK_SIZE).unwrap()
    }

    pub fn create() -> Result<NonNull<WeakBlock>, AllocationError> {
        let ptr = unsafe { std::alloc::alloc(Self::layout()) } as *mut WeakBlock;
        let Some(block) = NonNull::new(ptr) else {
            return Err(AllocationError::OutOfMemory);
        };

        unsafe {
            std::ptr::addr_of_mut!((*block.as_ptr()).header).write(WeakBlockHeader {
                lazy_next: Cell::new(0),
                freelist: Cell::new(std::ptr::null_mut()),
            });
        }

        Ok(block)
    }

    #[inline]
    pub fn from_impl(slot: *const WeakImpl) -> *mut WeakBlock {
        (slot as usize & BLOCK_MASK) as *mut WeakBlock
    }

    fn slot_at(&self, index: usize) -> *mut WeakImpl {
        debug_assert!(index < Self::CAPACITY);
        unsafe {
            (self as *const WeakBlock as *const u8)
                .add(SLOTS_OFFSET + index * std::mem::size_of::<WeakImpl>()) as *mut WeakImpl
        }
    }

    pub fn can_allocate(&self) -> bool {
        !self.header.freelist.get().is_null() || self.header.lazy_next.get() < Self::CAPACITY
    }

    pub fn allocate(&self, target: *const AllocationHeader) -> Option<NonNull<WeakImpl>> {
        let slot = {
            let free = self.header.freelist.get();
            if !free.is_null() {
                unsafe {
                    self.header.freelist.set((*free).next_free.get());
                }
                free
            } else {
                let index = self.header.lazy_next.get();
                if index >= Self::CAPACITY {
                    return None;
                }
                self.header.lazy_next.set(index + 1);
                let slot = self.slot_at(index);
                unsafe {
                    slot.write(WeakImpl {
                        target: Cell::new(std::ptr::null()),
                        next_free: Cell::new(std::ptr::null_mut()),
                        state: Cell::new(WeakImplState::Free),
                    });
                }
                slot
            }
        };

        unsafe {
            (*slot).target.set(target);
            (*slot).state.set(WeakImplState::Bound);
            Some(NonNull::new_unchecked(slot))
        }
    }

    pub fn deallocate(&self, slot: *mut WeakImpl) {
        unsafe {
            debug_assert_ne!((*slot).state.get(), WeakImplState::Free);
            (*slot).target.set(std::ptr::null());
            (*slot).state.set(WeakImplState::Free);
            (*slot).next_free.set(self.header.freelist.get());
        }
        self.header.freelist.set(slot);
    }

    /// Clears every binding whose cell did not survive the cell sweep.
    /// Must run after the cell sweep and before any dead block is
    /// released, while the dead cells' headers are still readable.
    pub fn sweep(&self) {
        for index in 0..self.header.lazy_next.get() {
            let slot = unsafe { &*self.slot_at(index) };
            if slot.state.get() != WeakImplState::Bound {
                continue;
            }
            let target = slot.target.get();
            if !unsafe { (*target).is_live() } {
                slot.target.set(std::ptr::null());
                slot.state.set(WeakImplState::Cleared);
            }
        }
    }

    /// Unbinds every slot without touching the referents. Used at heap
    /// teardown so surviving handles observe "empty" instead of a freed
    /// cell.
    pub fn clear_all(&self) {
        for index in 0..self.header.lazy_next.get() {
            let slot = unsafe { &*self.slot_at(index) };
            if slot.state.get() == WeakImplState::Bound {
                slot.target.set(std::ptr::null());
                slot.state.set(WeakImplState::Cleared);
            }
        }
    }
}

/// An owning handle to a weak reference: it observes a cell without
/// keeping it alive. Dropping the handle returns the slot to its block's
/// freelist.
pub struct Weak<T: 'static> {
    slot: NonNull<WeakImpl>,
    _marker: PhantomData<*const T>,
}

impl<T: 'static> Weak<T> {
    pub(crate) fn new(slot: NonNull<WeakImpl>) -> Weak<T> {
        Weak {
            slot,
            _marker: PhantomData,
        }
    }

    /// Returns the observed cell, or `None` once it has been reclaimed.
    pub fn upgrade(&self) -> Option<Gc<T>> {
        let slot = unsafe { self.slot.as_ref() };
        match slot.state.get() {
            WeakImplState::Bound => Some(unsafe { Gc::from_header(slot.target.get()) }),
            WeakImplState::Cleared => None,
            WeakImplState::Free => unreachable!("weak handle to a freed slot"),
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.upgrade().is_none()
    }
}

impl<T: 'static> Drop for Weak<T> {
    fn drop(&mut self) {
        let block = WeakBlock::from_impl(self.slot.as_ptr());
        unsafe {
            (*block).deallocate(self.slot.as_ptr());
        }
    }
}
