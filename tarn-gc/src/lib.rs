//! A mark-and-sweep heap for single-threaded hosts.
//!
//! Cells live in block-size-aligned blocks, so any cell pointer recovers
//! its block, and through it the owning [`Heap`], with a mask.
//! Reachability starts from explicitly registered roots ([`Root`],
//! [`RootVector`], [`RootHashMap`], [`ConservativeRoots`]) and follows
//! [`Trace::visit_edges`].

mod allocator;
mod block;
mod cell;
mod error;
mod gc;
mod heap;
mod roots;
mod weak;

pub use crate::cell::{Cell, CellState, Trace};
pub use crate::error::AllocationError;
pub use crate::gc::Gc;
pub use crate::heap::{CollectionKind, CollectionStats, DeferGc, Heap, HeapConfig, Visitor};
pub use crate::roots::{ConservativeRoots, Root, RootHashMap, RootVector};
pub use crate::weak::Weak;
