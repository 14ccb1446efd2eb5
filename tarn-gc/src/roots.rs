use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::{Rc, Weak as RcWeak};

use crate::gc::Gc;
use crate::heap::{Heap, Visitor};

/// Something whose contents must be treated as roots during marking.
pub(crate) trait RootSource {
    fn gather(&self, visitor: &mut Visitor);
}

/// Index-based registry of root containers for one heap. Attach and
/// detach are O(1): slots are recycled through a free list, so containers
/// hold a stable index instead of an intrusive list node.
pub(crate) struct RootSet {
    sources: RefCell<Vec<Option<RcWeak<dyn RootSource>>>>,
    free: RefCell<Vec<usize>>,
    len: Cell<usize>,
}

impl RootSet {
    pub fn new() -> RootSet {
        RootSet {
            sources: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
            len: Cell::new(0),
        }
    }

    pub fn attach(&self, source: RcWeak<dyn RootSource>) -> usize {
        self.len.set(self.len.get() + 1);
        if let Some(index) = self.free.borrow_mut().pop() {
            self.sources.borrow_mut()[index] = Some(source);
            index
        } else {
            let mut sources = self.sources.borrow_mut();
            sources.push(Some(source));
            sources.len() - 1
        }
    }

    pub fn detach(&self, index: usize) {
        let previous = self.sources.borrow_mut()[index].take();
        debug_assert!(previous.is_some());
        self.free.borrow_mut().push(index);
        self.len.set(self.len.get() - 1);
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn gather(&self, visitor: &mut Visitor) {
        let sources = self.sources.borrow();
        for source in sources.iter().flatten() {
            if let Some(source) = source.upgrade() {
                source.gather(visitor);
            }
        }
    }
}

/// Membership of one container in one heap's root set. Dropping it
/// unlinks the container; moving a container does not invalidate it
/// because only the index is held.
struct Attachment {
    set: Rc<RootSet>,
    index: usize,
}

impl Attachment {
    fn new(heap: &Heap, source: Rc<dyn RootSource>) -> Attachment {
        let set = heap.root_set().clone();
        let index = set.attach(Rc::downgrade(&source));
        Attachment { set, index }
    }

    fn is_same_heap(&self, heap: &Heap) -> bool {
        Rc::ptr_eq(&self.set, heap.root_set())
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.set.detach(self.index);
    }
}

/// A durable reference that keeps a single cell alive. Affiliated with
/// exactly one heap at a time; [`Root::set`] with a value from another
/// heap re-homes the root there.
pub struct Root<T: 'static> {
    inner: Rc<RootCell<T>>,
    attachment: Attachment,
}

struct RootCell<T: 'static> {
    value: Cell<Option<Gc<T>>>,
}

impl<T: 'static> RootSource for RootCell<T> {
    fn gather(&self, visitor: &mut Visitor) {
        if let Some(value) = self.value.get() {
            visitor.visit(value);
        }
    }
}

impl<T: 'static> Root<T> {
    pub fn new(heap: &Heap, value: Gc<T>) -> Root<T> {
        let inner = Rc::new(RootCell {
            value: Cell::new(Some(value)),
        });
        Root {
            attachment: Attachment::new(heap, inner.clone()),
            inner,
        }
    }

    pub fn get(&self) -> Gc<T> {
        self.inner.value.get().unwrap()
    }

    pub fn set(&mut self, heap: &Heap, value: Gc<T>) {
        if !self.attachment.is_same_heap(heap) {
            self.attachment = Attachment::new(heap, self.inner.clone());
        }
        self.inner.value.set(Some(value));
    }
}

/// A growable list of roots, all pinned for as long as they stay in the
/// vector.
pub struct RootVector<T: 'static> {
    inner: Rc<RootVecCells<T>>,
    attachment: Attachment,
}

struct RootVecCells<T: 'static> {
    values: RefCell<Vec<Gc<T>>>,
}

impl<T: 'static> RootSource for RootVecCells<T> {
    fn gather(&self, visitor: &mut Visitor) {
        for value in self.values.borrow().iter() {
            visitor.visit(*value);
        }
    }
}

impl<T: 'static> RootVector<T> {
    pub fn new(heap: &Heap) -> RootVector<T> {
        let inner = Rc::new(RootVecCells {
            values: RefCell::new(Vec::new()),
        });
        RootVector {
            attachment: Attachment::new(heap, inner.clone()),
            inner,
        }
    }

    pub fn push(&self, value: Gc<T>) {
        self.inner.values.borrow_mut().push(value);
    }

    pub fn pop(&self) -> Option<Gc<T>> {
        self.inner.values.borrow_mut().pop()
    }

    pub fn get(&self, index: usize) -> Gc<T> {
        self.inner.values.borrow()[index]
    }

    pub fn len(&self) -> usize {
        self.inner.values.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.values.borrow_mut().clear();
    }

    /// Re-homes the vector; a no-op when `heap` is already the affiliated
    /// heap.
    pub fn move_to_heap(&mut self, heap: &Heap) {
        if self.attachment.is_same_heap(heap) {
            return;
        }
        self.attachment = Attachment::new(heap, self.inner.clone());
    }
}

/// A map with plain keys and rooted values; dropping an entry unpins the
/// value.
pub struct RootHashMap<K: Eq + Hash + 'static, T: 'static> {
    inner: Rc<RootMapCells<K, T>>,
    attachment: Attachment,
}

struct RootMapCells<K: Eq + Hash + 'static, T: 'static> {
    values: RefCell<HashMap<K, Gc<T>>>,
}

impl<K: Eq + Hash + 'static, T: 'static> RootSource for RootMapCells<K, T> {
    fn gather(&self, visitor: &mut Visitor) {
        for value in self.values.borrow().values() {
            visitor.visit(*value);
        }
    }
}

impl<K: Eq + Hash + 'static, T: 'static> RootHashMap<K, T> {
    pub fn new(heap: &Heap) -> RootHashMap<K, T> {
        let inner = Rc::new(RootMapCells {
            values: RefCell::new(HashMap::new()),
        });
        RootHashMap {
            attachment: Attachment::new(heap, inner.clone()),
            inner,
        }
    }

    pub fn insert(&self, key: K, value: Gc<T>) -> Option<Gc<T>> {
        self.inner.values.borrow_mut().insert(key, value)
    }

    pub fn get(&self, key: &K) -> Option<Gc<T>> {
        self.inner.values.borrow().get(key).copied()
    }

    pub fn remove(&self, key: &K) -> Option<Gc<T>> {
        self.inner.values.borrow_mut().remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.values.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn move_to_heap(&mut self, heap: &Heap) {
        if self.attachment.is_same_heap(heap) {
            return;
        }
        self.attachment = Attachment::new(heap, self.inner.clone());
    }
}

/// A buffer of ambiguous words the embedder wants scanned conservatively,
/// e.g. a value stack that mixes cell pointers with plain data. Each word
/// is only treated as a pointer if it resolves to a currently-allocated
/// slot in one of the heap's live blocks.
pub struct ConservativeRoots {
    inner: Rc<ConservativeWords>,
    attachment: Attachment,
}

struct ConservativeWords {
    words: RefCell<Vec<usize>>,
}

impl RootSource for ConservativeWords {
    fn gather(&self, visitor: &mut Visitor) {
        for word in self.words.borrow().iter() {
            visitor.visit_possible_value(*word);
        }
    }
}

impl ConservativeRoots {
    pub fn new(heap: &Heap) -> ConservativeRoots {
        let inner = Rc::new(ConservativeWords {
            words: RefCell::new(Vec::new()),
        });
        ConservativeRoots {
            attachment: Attachment::new(heap, inner.clone()),
            inner,
        }
    }

    pub fn push(&self, word: usize) {
        self.inner.words.borrow_mut().push(word);
    }

    pub fn extend_from_slice(&self, words: &[usize]) {
        self.inner.words.borrow_mut().extend_from_slice(words);
    }

    pub fn clear(&self) {
        self.inner.words.borrow_mut().clear();
    }

    pub fn move_to_heap(&mut self, heap: &Heap) {
        if self.attachment.is_same_heap(heap) {
            return;
        }
        self.attachment = Attachment::new(heap, self.inner.clone());
    }
}
