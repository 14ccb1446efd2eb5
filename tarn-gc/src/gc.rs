use std::{any::TypeId, ops::Deref, ptr::NonNull};

use crate::cell::{Cell, CellState, Trace};
use crate::heap::Visitor;

const FLAG_FINALIZER: u8 = 1 << 0;

/// Header shared by every cell slot. The freelist reuses `next_free` while
/// the slot is dead, so a dead slot never needs its data region.
///
/// Aligned to 16 so that the payload starts at a fixed offset for every
/// cell type with alignment <= 16.
#[repr(C, align(16))]
pub(crate) struct AllocationHeader {
    tag: TypeId,
    vtable: *mut (),
    pub(crate) next_free: std::cell::Cell<*mut AllocationHeader>,
    pub(crate) state: std::cell::Cell<CellState>,
    flags: u8,
}

#[repr(C)]
pub(crate) struct Allocation<T: ?Sized> {
    pub(crate) header: AllocationHeader,
    pub(crate) data: T,
}

impl<T: Cell + 'static> Allocation<T> {
    pub fn new(data: T) -> Allocation<T> {
        let vtable = vtable::extract(&data);
        let flags = if data.overrides_finalize() { FLAG_FINALIZER } else { 0 };

        Allocation {
            header: AllocationHeader {
                tag: TypeId::of::<T>(),
                vtable,
                next_free: std::cell::Cell::new(std::ptr::null_mut()),
                state: std::cell::Cell::new(CellState::Live),
                flags,
            },
            data,
        }
    }
}

impl AllocationHeader {
    pub(crate) fn is_live(&self) -> bool {
        self.state.get() == CellState::Live
    }

    pub(crate) fn has_finalizer(&self) -> bool {
        self.flags & FLAG_FINALIZER != 0
    }

    fn data_ptr(&self) -> *const () {
        // The payload starts right after the header; see the layout note on
        // `AllocationHeader`.
        unsafe { (self as *const AllocationHeader).add(1) as *const () }
    }
}

/// Reconstructs a `&dyn Cell` for the cell stored behind `header`.
///
/// # Safety
/// `header` must point to a constructed, not-yet-destructed cell slot.
pub(crate) unsafe fn dyn_cell<'a>(header: *const AllocationHeader) -> &'a dyn Cell {
    vtable::construct((*header).data_ptr(), (*header).vtable)
}

/// # Safety
/// Same as [`dyn_cell`], and the caller must have exclusive access.
pub(crate) unsafe fn dyn_cell_mut<'a>(header: *mut AllocationHeader) -> &'a mut dyn Cell {
    vtable::construct_mut((*header).data_ptr() as *mut (), (*header).vtable)
}

/// Placement-destructs the cell behind `header`. The header itself is left
/// intact so the slot can carry freelist state afterwards.
pub(crate) unsafe fn drop_cell(header: *mut AllocationHeader) {
    std::ptr::drop_in_place(dyn_cell_mut(header) as *mut dyn Cell);
}

/// A typed pointer to a managed cell.
///
/// `Gc` is `Copy` and does not keep its referent alive; something must
/// either root the cell or visit this edge from `visit_edges` for it to
/// survive a collection. A `Gc` must not outlive the [`Heap`] that
/// allocated it.
///
/// [`Heap`]: crate::Heap
pub struct Gc<T: ?Sized> {
    ptr: NonNull<Allocation<T>>,
}

impl<T: ?Sized> Copy for Gc<T> {}
impl<T: ?Sized> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Gc<T> {
    #[inline]
    pub fn ptr_eq(a: Gc<T>, b: Gc<T>) -> bool {
        a.ptr == b.ptr
    }

    /// Raw pointer to the payload, for identity comparisons or for handing
    /// the cell's address to a [`ConservativeRoots`] buffer.
    ///
    /// [`ConservativeRoots`]: crate::ConservativeRoots
    pub fn as_ptr(&self) -> *const T {
        unsafe { std::ptr::addr_of!((*self.ptr.as_ptr()).data) }
    }

    pub(crate) fn header_ptr(&self) -> NonNull<AllocationHeader> {
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr() as *mut AllocationHeader) }
    }

    fn allocation(&self) -> &Allocation<T> {
        unsafe { self.ptr.as_ref() }
    }
}

impl Gc<()> {
    pub fn is<T>(self) -> bool
    where
        T: 'static,
    {
        self.allocation().header.tag == TypeId::of::<T>()
    }

    pub fn cast<T>(self) -> Gc<T>
    where
        T: 'static,
    {
        debug_assert!(self.is::<T>());

        Gc {
            ptr: unsafe { NonNull::new_unchecked(self.ptr.as_ptr() as *mut Allocation<T>) },
        }
    }

    pub fn try_cast<T>(self) -> Option<Gc<T>>
    where
        T: 'static,
    {
        if self.is::<T>() {
            Some(self.cast::<T>())
        } else {
            None
        }
    }
}

impl<T> Gc<T> {
    pub fn erase(self) -> Gc<()> {
        Gc {
            ptr: unsafe { NonNull::new_unchecked(self.ptr.as_ptr() as *mut Allocation<()>) },
        }
    }

    pub fn class_name(self) -> &'static str
    where
        T: 'static,
    {
        unsafe { dyn_cell(self.ptr.as_ptr() as *const AllocationHeader).class_name() }
    }

    pub(crate) unsafe fn from_allocation(ptr: NonNull<Allocation<T>>) -> Gc<T> {
        Gc { ptr }
    }

    pub(crate) unsafe fn from_header(header: *const AllocationHeader) -> Gc<T> {
        Gc {
            ptr: NonNull::new_unchecked(header as *mut Allocation<T>),
        }
    }
}

impl<T: ?Sized> Deref for Gc<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.allocation().data
    }
}

impl<T: ?Sized> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        Gc::ptr_eq(*self, *other)
    }
}

impl<T: ?Sized> std::fmt::Display for Gc<T>
where
    T: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.deref().fmt(f)
    }
}

impl<T: ?Sized> std::fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Gc({:p})", self.ptr.as_ptr() as *const u8)
    }
}

unsafe impl<T: ?Sized> Trace for Gc<T> {
    fn visit_edges(&self, visitor: &mut Visitor) {
        visitor.visit(*self);
    }
}

mod vtable {
    use crate::cell::Cell;

    #[repr(C)]
    struct Object {
        data: *const (),
        vtable: *mut (),
    }

    pub fn extract<T: Cell>(data: *const T) -> *mut () {
        unsafe {
            let obj = data as *const dyn Cell;
            std::mem::transmute::<*const dyn Cell, Object>(obj).vtable
        }
    }

    pub unsafe fn construct<'a>(data: *const (), vtable: *mut ()) -> &'a dyn Cell {
        unsafe {
            let object = Object { data, vtable };
            std::mem::transmute::<Object, &dyn Cell>(object)
        }
    }

    pub unsafe fn construct_mut<'a>(data: *mut (), vtable: *mut ()) -> &'a mut dyn Cell {
        unsafe {
            let object = Object {
                data: data as *const (),
                vtable,
            };
            std::mem::transmute::<Object, &mut dyn Cell>(object)
        }
    }
}

mod trace_impls {
    use super::*;
    use arrayvec::ArrayVec;
    use std::cell::{Cell, UnsafeCell};
    use std::collections::HashMap;
    use std::hash::Hash;

    unsafe impl Trace for String {
        fn visit_edges(&self, _visitor: &mut Visitor) {}
    }

    unsafe impl<T: Trace> Trace for Option<T> {
        fn visit_edges(&self, visitor: &mut Visitor) {
            match self {
                Some(inner) => inner.visit_edges(visitor),
                None => (),
            }
        }
    }

    unsafe impl<K: Eq + Hash + Trace, T: Trace> Trace for HashMap<K, T> {
        #[inline]
        fn visit_edges(&self, visitor: &mut Visitor) {
            for key in self.keys() {
                key.visit_edges(visitor);
            }
            for val in self.values() {
                val.visit_edges(visitor);
            }
        }
    }

    unsafe impl<T: Trace> Trace for Vec<T> {
        #[inline]
        fn visit_edges(&self, visitor: &mut Visitor) {
            for el in self {
                el.visit_edges(visitor);
            }
        }
    }

    unsafe impl<T: Trace> Trace for UnsafeCell<T> {
        fn visit_edges(&self, visitor: &mut Visitor) {
            let inner = unsafe { &*self.get() };
            inner.visit_edges(visitor);
        }
    }

    unsafe impl<T> Trace for Cell<T>
    where
        T: Trace + Copy,
    {
        fn visit_edges(&self, visitor: &mut Visitor) {
            self.get().visit_edges(visitor);
        }
    }

    unsafe impl<T: Trace, const C: usize> Trace for ArrayVec<T, C> {
        #[inline]
        fn visit_edges(&self, visitor: &mut Visitor) {
            for el in self {
                el.visit_edges(visitor);
            }
        }
    }
}
