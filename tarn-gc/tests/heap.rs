use std::cell::Cell;
use std::rc::Rc;

use tarn_gc::{
    AllocationError, CollectionKind, ConservativeRoots, Gc, Heap, Root, RootHashMap, RootVector,
    Trace, Visitor,
};

struct Node {
    value: u64,
    next: Cell<Option<Gc<Node>>>,
}

impl Node {
    fn new(value: u64) -> Node {
        Node {
            value,
            next: Cell::new(None),
        }
    }
}

unsafe impl Trace for Node {
    fn visit_edges(&self, visitor: &mut Visitor) {
        self.next.visit_edges(visitor);
    }
}
impl tarn_gc::Cell for Node {}

/// A cell owning a non-memory resource; `finalize` releases it.
struct Resource {
    finalized: Rc<Cell<usize>>,
}

unsafe impl Trace for Resource {
    fn visit_edges(&self, _visitor: &mut Visitor) {}
}
impl tarn_gc::Cell for Resource {
    fn finalize(&mut self) {
        self.finalized.set(self.finalized.get() + 1);
    }

    fn overrides_finalize(&self) -> bool {
        true
    }
}

#[test]
fn unreachable_cells_are_reclaimed() {
    let heap = Heap::new();
    for value in 0..10 {
        let _ = heap.allocate(Node::new(value));
    }
    assert_eq!(heap.live_cell_count(), 10);

    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap.live_cell_count(), 0);
}

#[test]
fn rooted_cells_survive() {
    let heap = Heap::new();
    let node = heap.allocate(Node::new(42));
    let root = Root::new(&heap, node);

    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap.live_cell_count(), 1);
    assert_eq!(root.get().value, 42);
}

#[test]
fn edges_keep_a_long_list_alive() {
    let heap = Heap::new();

    let head = heap.allocate(Node::new(0));
    let root = Root::new(&heap, head);
    let mut tail = head;
    for value in 1..1000 {
        let node = heap.allocate(Node::new(value));
        tail.next.set(Some(node));
        tail = node;
    }

    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap.live_cell_count(), 1000);

    // Walk the list to make sure every payload survived intact.
    let mut cursor = Some(root.get());
    let mut expected = 0;
    while let Some(node) = cursor {
        assert_eq!(node.value, expected);
        expected += 1;
        cursor = node.next.get();
    }
    assert_eq!(expected, 1000);

    drop(root);
    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap.live_cell_count(), 0);
}

#[test]
fn cycles_do_not_leak() {
    let heap = Heap::new();

    let first = heap.allocate(Node::new(1));
    let second = heap.allocate(Node::new(2));
    first.next.set(Some(second));
    second.next.set(Some(first));

    let root = Root::new(&heap, first);
    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap.live_cell_count(), 2);

    drop(root);
    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap.live_cell_count(), 0);
}

#[test]
fn finalize_runs_exactly_once() {
    let finalized = Rc::new(Cell::new(0));
    let heap = Heap::new();

    let resource = heap.allocate(Resource {
        finalized: finalized.clone(),
    });
    let root = Root::new(&heap, resource);

    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(finalized.get(), 0);

    drop(root);
    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(finalized.get(), 1);

    // Later cycles and heap teardown must not finalize again.
    heap.collect_garbage(CollectionKind::CollectGarbage);
    drop(heap);
    assert_eq!(finalized.get(), 1);
}

#[test]
fn collect_everything_sweeps_unrooted_cells() {
    let finalized = Rc::new(Cell::new(0));
    let heap = Heap::new();

    let _unrooted = heap.allocate(Resource {
        finalized: finalized.clone(),
    });
    let kept = heap.allocate(Node::new(1));
    let _root = Root::new(&heap, kept);

    heap.collect_garbage(CollectionKind::CollectEverything);
    assert_eq!(finalized.get(), 1);
    assert_eq!(heap.live_cell_count(), 1);
}

#[test]
fn teardown_finalizes_surviving_cells() {
    let finalized = Rc::new(Cell::new(0));
    let heap = Heap::new();

    let resource = heap.allocate(Resource {
        finalized: finalized.clone(),
    });
    let root = Root::new(&heap, resource);

    drop(heap);
    assert_eq!(finalized.get(), 1);
    drop(root);
}

#[test]
fn weak_references_clear_on_reclamation() {
    let heap = Heap::new();
    let node = heap.allocate(Node::new(7));
    let root = Root::new(&heap, node);
    let weak = heap.create_weak(node);

    heap.collect_garbage(CollectionKind::CollectGarbage);
    let upgraded = weak.upgrade().unwrap();
    assert!(Gc::ptr_eq(upgraded, node));

    drop(root);
    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert!(weak.is_cleared());
    assert!(weak.upgrade().is_none());
}

#[test]
fn weak_handle_may_outlive_the_heap() {
    let heap = Heap::new();
    let node = heap.allocate(Node::new(7));
    let root = Root::new(&heap, node);
    let weak = heap.create_weak(node);

    drop(root);
    drop(heap);
    assert!(weak.is_cleared());
}

#[test]
fn owns_recovers_the_heap_from_a_cell() {
    let heap_a = Heap::new();
    let heap_b = Heap::new();

    let cell_a = heap_a.allocate(Node::new(1));
    let cell_b = heap_b.allocate(Node::new(2));

    assert!(heap_a.owns(cell_a));
    assert!(heap_b.owns(cell_b));
    assert!(!heap_a.owns(cell_b));
    assert!(!heap_b.owns(cell_a));
}

#[test]
fn roots_re_home_across_heaps() {
    let heap_a = Heap::new();
    let heap_b = Heap::new();

    let cell_a = heap_a.allocate(Node::new(1));
    let mut root = Root::new(&heap_a, cell_a);
    assert_eq!(heap_a.root_count(), 1);

    // Reassigning within the same heap keeps the existing attachment.
    root.set(&heap_a, cell_a);
    assert_eq!(heap_a.root_count(), 1);

    let cell_b = heap_b.allocate(Node::new(2));
    root.set(&heap_b, cell_b);
    assert_eq!(heap_a.root_count(), 0);
    assert_eq!(heap_b.root_count(), 1);

    drop(root);
    assert_eq!(heap_b.root_count(), 0);
}

#[test]
fn root_vectors_re_home_across_heaps() {
    let heap_a = Heap::new();
    let heap_b = Heap::new();

    let mut roots: RootVector<Node> = RootVector::new(&heap_a);
    assert_eq!(heap_a.root_count(), 1);

    // Same-heap move keeps the existing attachment.
    roots.move_to_heap(&heap_a);
    assert_eq!(heap_a.root_count(), 1);

    roots.move_to_heap(&heap_b);
    assert_eq!(heap_a.root_count(), 0);
    assert_eq!(heap_b.root_count(), 1);

    roots.push(heap_b.allocate(Node::new(3)));
    heap_b.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap_b.live_cell_count(), 1);
}

#[test]
fn root_maps_re_home_across_heaps() {
    let heap_a = Heap::new();
    let heap_b = Heap::new();

    let mut roots: RootHashMap<u32, Node> = RootHashMap::new(&heap_a);
    assert_eq!(heap_a.root_count(), 1);

    roots.move_to_heap(&heap_b);
    assert_eq!(heap_a.root_count(), 0);
    assert_eq!(heap_b.root_count(), 1);

    roots.insert(0, heap_b.allocate(Node::new(3)));
    heap_b.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap_b.live_cell_count(), 1);
}

#[test]
fn conservative_buffers_re_home_across_heaps() {
    let heap_a = Heap::new();
    let heap_b = Heap::new();

    let mut words = ConservativeRoots::new(&heap_a);
    assert_eq!(heap_a.root_count(), 1);

    words.move_to_heap(&heap_b);
    assert_eq!(heap_a.root_count(), 0);
    assert_eq!(heap_b.root_count(), 1);

    let node = heap_b.allocate(Node::new(3));
    words.push(node.as_ptr() as usize);
    heap_b.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap_b.live_cell_count(), 1);
}

#[test]
fn root_vectors_pin_their_contents() {
    let heap = Heap::new();
    let roots = RootVector::new(&heap);

    for value in 0..16 {
        roots.push(heap.allocate(Node::new(value)));
    }
    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap.live_cell_count(), 16);

    roots.clear();
    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap.live_cell_count(), 0);
}

#[test]
fn root_maps_pin_their_values() {
    let heap = Heap::new();
    let roots: RootHashMap<&str, Node> = RootHashMap::new(&heap);

    roots.insert("kept", heap.allocate(Node::new(1)));
    roots.insert("dropped", heap.allocate(Node::new(2)));
    assert_eq!(roots.len(), 2);

    roots.remove(&"dropped");
    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap.live_cell_count(), 1);
    assert_eq!(roots.get(&"kept").unwrap().value, 1);
}

#[test]
fn conservative_words_pin_cells_they_point_at() {
    let heap = Heap::new();
    let words = ConservativeRoots::new(&heap);

    let node = heap.allocate(Node::new(9));
    words.push(node.as_ptr() as usize);

    // Junk words must be validated away, not crash.
    words.push(0);
    words.push(1);
    words.push(usize::MAX);
    let on_stack = 0u64;
    words.push(&on_stack as *const u64 as usize);

    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap.live_cell_count(), 1);
    assert_eq!(node.value, 9);

    words.clear();
    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap.live_cell_count(), 0);
}

#[test]
fn collect_everything_ignores_conservative_words() {
    let heap = Heap::new();
    let words = ConservativeRoots::new(&heap);

    let node = heap.allocate(Node::new(9));
    words.push(node.as_ptr() as usize);

    heap.collect_garbage(CollectionKind::CollectEverything);
    assert_eq!(heap.live_cell_count(), 0);
}

#[test]
fn deferred_construction_gap_is_safe() {
    let heap = Heap::new();

    let defer = heap.defer_gc();
    // Unreachable mid-construction; a requested cycle must wait.
    let orphan = heap.allocate(Node::new(5));
    heap.collect_garbage(CollectionKind::CollectGarbage);
    assert_eq!(heap.live_cell_count(), 1);

    let root = Root::new(&heap, orphan);
    drop(defer);

    // The pending cycle ran, with the cell rooted by then.
    assert_eq!(heap.live_cell_count(), 1);
    assert_eq!(root.get().value, 5);
}

#[test]
fn oversized_allocations_fail_cleanly() {
    struct Huge(#[allow(dead_code)] [u8; 4096]);
    unsafe impl Trace for Huge {
        fn visit_edges(&self, _visitor: &mut Visitor) {}
    }
    impl tarn_gc::Cell for Huge {}

    let heap = Heap::new();
    match heap.try_allocate(Huge([0; 4096])) {
        Err(AllocationError::CellTooLarge { size }) => assert!(size > 4096),
        other => panic!("expected CellTooLarge, got {:?}", other.map(|_| ())),
    }
}
