use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::allocator::CellAllocator;
use crate::block::{HeapBlock, BLOCK_MASK, BLOCK_SIZE};
use crate::cell::CellState;
use crate::error::AllocationError;
use crate::gc::{self, Allocation, AllocationHeader, Gc};
use crate::roots::RootSet;
use crate::weak::{Weak, WeakBlock, WeakImpl};

/// Cell size classes, matching the block layout: every allocation is
/// served from the smallest class that fits.
const CELL_SIZE_CLASSES: [usize; 7] = [64, 96, 128, 256, 512, 1024, 3072];

//TODO serve cells larger than the biggest size class from dedicated
// multi-block spans instead of rejecting them.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CollectionKind {
    /// A normal cycle: precise roots plus conservative word validation.
    CollectGarbage,
    /// Leak-checking/shutdown strictness: nothing is treated as reachable
    /// except cells actually pinned by registered roots.
    CollectEverything,
}

#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// The collection threshold never drops below this many allocated
    /// bytes.
    pub gc_min_bytes_threshold: usize,
    /// Stress mode: run a full cycle before every allocation.
    pub collect_on_every_allocation: bool,
}

impl Default for HeapConfig {
    fn default() -> HeapConfig {
        HeapConfig {
            gc_min_bytes_threshold: 1024 * 1024,
            collect_on_every_allocation: false,
        }
    }
}

/// What the last collection cycle did.
#[derive(Copy, Clone, Debug, Default)]
pub struct CollectionStats {
    pub live_cells: usize,
    pub collected_cells: usize,
    pub live_bytes: usize,
    pub collected_bytes: usize,
    pub duration: Duration,
}

#[inline(never)]
#[cold]
fn allocation_failed(error: AllocationError) -> ! {
    panic!("heap allocation failed: {}", error);
}

/// The owner of all cell allocators, the weak-block pool, and the root
/// registry for one runtime/agent. Multiple heaps may coexist; each cell
/// belongs to exactly one, and cross-heap references must not occur.
///
/// A `Heap` is single-threaded by construction (`!Send`/`!Sync` through
/// its interior mutability), which enforces the one-mutator model
/// statically.
pub struct Heap {
    inner: Box<HeapInner>,
}

pub(crate) struct HeapInner {
    allocators: Vec<CellAllocator>,
    live_blocks: RefCell<HashSet<*mut HeapBlock>>,
    usable_weak_blocks: RefCell<Vec<NonNull<WeakBlock>>>,
    full_weak_blocks: RefCell<Vec<NonNull<WeakBlock>>>,
    roots: Rc<RootSet>,
    allocated_bytes_since_gc: Cell<usize>,
    gc_bytes_threshold: Cell<usize>,
    gc_deferrals: Cell<usize>,
    should_collect_when_deferral_ends: Cell<bool>,
    collecting: Cell<bool>,
    last_stats: Cell<Option<CollectionStats>>,
    config: HeapConfig,
}

impl Heap {
    pub fn new() -> Heap {
        Heap::with_config(HeapConfig::default())
    }

    pub fn with_config(config: HeapConfig) -> Heap {
        Heap {
            inner: Box::new(HeapInner {
                allocators: CELL_SIZE_CLASSES
                    .iter()
                    .map(|&size| CellAllocator::new(size))
                    .collect(),
                live_blocks: RefCell::new(HashSet::new()),
                usable_weak_blocks: RefCell::new(Vec::new()),
                full_weak_blocks: RefCell::new(Vec::new()),
                roots: Rc::new(RootSet::new()),
                allocated_bytes_since_gc: Cell::new(0),
                gc_bytes_threshold: Cell::new(config.gc_min_bytes_threshold),
                gc_deferrals: Cell::new(0),
                should_collect_when_deferral_ends: Cell::new(false),
                collecting: Cell::new(false),
                last_stats: Cell::new(None),
                config,
            }),
        }
    }

    /// Constructs a new managed cell. Panics on allocation failure;
    /// embedders that want to handle out-of-memory use
    /// [`Heap::try_allocate`].
    pub fn allocate<T: crate::Cell + 'static>(&self, value: T) -> Gc<T> {
        match self.try_allocate(value) {
            Ok(cell) => cell,
            Err(error) => allocation_failed(error),
        }
    }

    pub fn try_allocate<T: crate::Cell + 'static>(
        &self,
        value: T,
    ) -> Result<Gc<T>, AllocationError> {
        assert!(
            std::mem::align_of::<Allocation<T>>() <= 16,
            "cells with alignment above 16 are unsupported"
        );
        assert!(
            !self.inner.collecting.get(),
            "allocation while a collection cycle is running"
        );

        let size = std::mem::size_of::<Allocation<T>>();
        self.inner.will_allocate(size);

        let allocator = self
            .inner
            .allocator_for(size)
            .ok_or(AllocationError::CellTooLarge { size })?;
        let slot = allocator.allocate(&*self.inner, &self.inner.live_blocks)?;

        unsafe {
            let slot = slot as *mut Allocation<T>;
            slot.write(Allocation::new(value));
            Ok(Gc::from_allocation(NonNull::new_unchecked(slot)))
        }
    }

    /// Binds a fresh weak slot to `target`. The returned handle observes
    /// the cell without keeping it alive.
    pub fn create_weak<T: 'static>(&self, target: Gc<T>) -> Weak<T> {
        match self.inner.create_weak_impl(target.header_ptr().as_ptr()) {
            Ok(slot) => Weak::new(slot),
            Err(error) => allocation_failed(error),
        }
    }

    pub fn collect_garbage(&self, kind: CollectionKind) {
        self.inner.collect_garbage(kind);
    }

    /// Suspends collection for the lifetime of the returned scope. A cycle
    /// requested while deferred runs when the last deferral ends.
    pub fn defer_gc(&self) -> DeferGc<'_> {
        self.inner
            .gc_deferrals
            .set(self.inner.gc_deferrals.get() + 1);
        DeferGc { heap: &self.inner }
    }

    /// O(1): recovers the owning heap from the cell's block and compares
    /// it against this one.
    pub fn owns<T: ?Sized>(&self, cell: Gc<T>) -> bool {
        let block = HeapBlock::from_cell(cell.header_ptr().as_ptr() as *const u8);
        unsafe { (*block).heap() == &*self.inner as *const HeapInner }
    }

    pub fn root_count(&self) -> usize {
        self.inner.roots.len()
    }

    pub fn live_cell_count(&self) -> usize {
        let mut count = 0;
        for allocator in self.inner.allocators.iter() {
            allocator.for_each_block(|block| {
                block.for_each_cell(|cell| {
                    if unsafe { (*cell).is_live() } {
                        count += 1;
                    }
                });
            });
        }
        count
    }

    pub fn last_collection_stats(&self) -> Option<CollectionStats> {
        self.inner.last_stats.get()
    }

    pub(crate) fn root_set(&self) -> &Rc<RootSet> {
        &self.inner.roots
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.inner.collect_garbage(CollectionKind::CollectEverything);
        self.inner.teardown();
    }
}

impl HeapInner {
    fn allocator_for(&self, size: usize) -> Option<&CellAllocator> {
        self.allocators
            .iter()
            .find(|allocator| size <= allocator.cell_size())
    }

    fn will_allocate(&self, size: usize) {
        if self.config.collect_on_every_allocation {
            self.collect_garbage(CollectionKind::CollectGarbage);
        } else if self.allocated_bytes_since_gc.get() + size > self.gc_bytes_threshold.get() {
            self.collect_garbage(CollectionKind::CollectGarbage);
        }
        self.allocated_bytes_since_gc
            .set(self.allocated_bytes_since_gc.get() + size);
    }

    fn create_weak_impl(
        &self,
        target: *const AllocationHeader,
    ) -> Result<NonNull<WeakImpl>, AllocationError> {
        if self.usable_weak_blocks.borrow().is_empty() {
            let block = WeakBlock::create()?;
            self.usable_weak_blocks.borrow_mut().push(block);
        }

        let block = *self.usable_weak_blocks.borrow().last().unwrap();
        let block_ref = unsafe { block.as_ref() };
        let slot = block_ref
            .allocate(target)
            .expect("usable weak block out of slots");
        if !block_ref.can_allocate() {
            self.usable_weak_blocks.borrow_mut().pop();
            self.full_weak_blocks.borrow_mut().push(block);
        }

        Ok(slot)
    }

    pub(crate) fn collect_garbage(&self, kind: CollectionKind) {
        assert!(!self.collecting.get(), "re-entrant garbage collection");

        // Only ordinary cycles defer; the shutdown/leak-check kind always
        // runs so it stays a reliable full sweep.
        if kind == CollectionKind::CollectGarbage && self.gc_deferrals.get() > 0 {
            self.should_collect_when_deferral_ends.set(true);
            return;
        }

        self.collecting.set(true);
        let start = Instant::now();

        // Phase 1/2: root scan and transitive marking.
        let mut visitor = Visitor::new(self, kind);
        self.roots.gather(&mut visitor);
        visitor.mark_all_live_cells();
        drop(visitor);

        // Phase 3: cell sweep. Unmarked cells are finalized, destructed and
        // returned to their block's freelist.
        let mut stats = CollectionStats::default();
        let mut empty_blocks: Vec<NonNull<HeapBlock>> = Vec::new();

        for allocator in self.allocators.iter() {
            for block in allocator.take_blocks() {
                let block_ref = unsafe { block.as_ref() };
                let mut live_in_block = 0usize;

                block_ref.for_each_cell(|cell| unsafe {
                    if !(*cell).is_live() {
                        return;
                    }
                    let index = block_ref.cell_index(cell as *const u8);
                    if block_ref.is_marked(index) {
                        live_in_block += 1;
                        stats.live_cells += 1;
                        stats.live_bytes += block_ref.cell_size();
                    } else {
                        trace!("reclaiming {}", gc::dyn_cell(cell).class_name());
                        if (*cell).has_finalizer() {
                            gc::dyn_cell_mut(cell).finalize();
                        }
                        gc::drop_cell(cell);
                        block_ref.deallocate(cell);
                        stats.collected_cells += 1;
                        stats.collected_bytes += block_ref.cell_size();
                    }
                });
                block_ref.clear_all_marks();

                if live_in_block == 0 {
                    empty_blocks.push(block);
                } else {
                    allocator.adopt(block);
                }
            }
        }

        // Phase 4: weak sweep. This reads the swept cells' headers, so it
        // must run before any empty block is released.
        self.sweep_weak_blocks();

        for block in empty_blocks {
            self.live_blocks.borrow_mut().remove(&block.as_ptr());
            unsafe { HeapBlock::destroy(block) };
        }

        let threshold = (stats.live_bytes * 2).max(self.config.gc_min_bytes_threshold);
        self.gc_bytes_threshold.set(threshold);
        self.allocated_bytes_since_gc.set(0);

        stats.duration = start.elapsed();
        debug!(
            "garbage collection ({:?}): {} live cells ({} bytes), {} collected ({} bytes) in {:?}",
            kind,
            stats.live_cells,
            stats.live_bytes,
            stats.collected_cells,
            stats.collected_bytes,
            stats.duration
        );
        self.last_stats.set(Some(stats));

        self.collecting.set(false);
    }

    fn sweep_weak_blocks(&self) {
        for block in self.usable_weak_blocks.borrow().iter() {
            unsafe { block.as_ref() }.sweep();
        }

        let drained: Vec<_> = self.full_weak_blocks.borrow_mut().drain(..).collect();
        for block in drained {
            let block_ref = unsafe { block.as_ref() };
            block_ref.sweep();
            if block_ref.can_allocate() {
                self.usable_weak_blocks.borrow_mut().push(block);
            } else {
                self.full_weak_blocks.borrow_mut().push(block);
            }
        }
    }

    /// Shutdown sweep: destructs every remaining cell unconditionally and
    /// releases all block memory.
    fn teardown(&self) {
        for allocator in self.allocators.iter() {
            for block in allocator.take_blocks() {
                let block_ref = unsafe { block.as_ref() };
                block_ref.for_each_cell(|cell| unsafe {
                    if !(*cell).is_live() {
                        return;
                    }
                    if (*cell).has_finalizer() {
                        gc::dyn_cell_mut(cell).finalize();
                    }
                    gc::drop_cell(cell);
                    (*cell).state.set(CellState::Dead);
                });
            }
        }

        // Unbind surviving weak slots before their targets' blocks go away.
        for block in self
            .usable_weak_blocks
            .borrow()
            .iter()
            .chain(self.full_weak_blocks.borrow().iter())
        {
            unsafe { block.as_ref() }.clear_all();
        }

        for block in self.live_blocks.borrow_mut().drain() {
            unsafe { HeapBlock::destroy(NonNull::new_unchecked(block)) };
        }

        // NOTE: Weak blocks are leaked on purpose. A `Weak` handle that
        // outlives the heap still reads and writes its slot when it is
        // dropped, so the slots have to stay addressable.
    }
}

/// The mark-phase visitor handed to [`Trace::visit_edges`].
///
/// [`Trace::visit_edges`]: crate::Trace::visit_edges
pub struct Visitor<'heap> {
    heap: &'heap HeapInner,
    kind: CollectionKind,
    worklist: Vec<NonNull<AllocationHeader>>,
    min_block_address: usize,
    max_block_address: usize,
}

impl<'heap> Visitor<'heap> {
    fn new(heap: &'heap HeapInner, kind: CollectionKind) -> Visitor<'heap> {
        let mut min_block_address = usize::MAX;
        let mut max_block_address = 0;
        for block in heap.live_blocks.borrow().iter() {
            let address = *block as usize;
            min_block_address = min_block_address.min(address);
            max_block_address = max_block_address.max(address + BLOCK_SIZE);
        }

        Visitor {
            heap,
            kind,
            worklist: Vec::new(),
            min_block_address,
            max_block_address,
        }
    }

    /// Marks a strong edge. Every cell reached here survives the cycle.
    pub fn visit<T: ?Sized>(&mut self, cell: Gc<T>) {
        self.mark(cell.header_ptr());
    }

    /// Validates an ambiguous word and marks it if it resolves to a live
    /// slot of a known block. Ignored during [`CollectionKind::CollectEverything`].
    pub fn visit_possible_value(&mut self, word: usize) {
        if self.kind == CollectionKind::CollectEverything {
            return;
        }
        if word < self.min_block_address || word >= self.max_block_address {
            return;
        }

        let block = (word & BLOCK_MASK) as *mut HeapBlock;
        if !self.heap.live_blocks.borrow().contains(&block) {
            return;
        }

        let block_ref = unsafe { &*block };
        let Some(cell) = block_ref.cell_from_possible_pointer(word) else {
            return;
        };
        if !unsafe { (*cell).is_live() } {
            return;
        }
        self.mark(unsafe { NonNull::new_unchecked(cell) });
    }

    fn mark(&mut self, header: NonNull<AllocationHeader>) {
        debug_assert!(
            unsafe { header.as_ref() }.is_live(),
            "visited edge points at a dead cell"
        );

        let block = HeapBlock::from_cell(header.as_ptr() as *const u8);
        let block_ref = unsafe { &*block };
        let index = block_ref.cell_index(header.as_ptr() as *const u8);
        if block_ref.is_marked(index) {
            return;
        }
        block_ref.set_marked(index);
        self.worklist.push(header);
    }

    fn mark_all_live_cells(&mut self) {
        while let Some(header) = self.worklist.pop() {
            unsafe { gc::dyn_cell(header.as_ptr()) }.visit_edges(self);
        }
    }
}

/// Scope guard that keeps collection from running while the mutator is in
/// the middle of a multi-step construction (a cell exists but is not yet
/// reachable from any root or live object).
pub struct DeferGc<'heap> {
    heap: &'heap HeapInner,
}

impl Drop for DeferGc<'_> {
    fn drop(&mut self) {
        let deferrals = self.heap.gc_deferrals.get();
        assert!(deferrals > 0);
        self.heap.gc_deferrals.set(deferrals - 1);

        if deferrals == 1 && self.heap.should_collect_when_deferral_ends.get() {
            self.heap.should_collect_when_deferral_ends.set(false);
            self.heap.collect_garbage(CollectionKind::CollectGarbage);
        }
    }
}
