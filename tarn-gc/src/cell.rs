use crate::heap::Visitor;

/// Liveness of a cell slot, flipped by the sweep phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CellState {
    Live,
    Dead,
}

/// Precise edge visitation.
///
/// # Safety
///
/// `visit_edges` must visit every strong cell reference reachable from
/// `self` exactly once per traversal. Missing an edge lets the collector
/// reclaim a cell that is still reachable through the un-visited field.
/// Visiting a field that is not a strong edge (a back-reference or a weak
/// reference) keeps dead cells alive instead.
pub unsafe trait Trace {
    fn visit_edges(&self, visitor: &mut Visitor);
}

/// A managed object. Anything allocated through [`Heap::allocate`] must
/// implement this.
///
/// Types that own non-memory resources override [`Cell::finalize`] and
/// return `true` from [`Cell::overrides_finalize`]; the sweep loop then
/// runs `finalize` once, right before the cell is destructed.
///
/// [`Heap::allocate`]: crate::Heap::allocate
pub trait Cell: Trace {
    fn class_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn finalize(&mut self) {}

    /// Opt-in marker for `finalize`. Dispatch goes through the cell's
    /// vtable, so this is an instance method rather than an associated
    /// constant.
    fn overrides_finalize(&self) -> bool {
        false
    }
}
