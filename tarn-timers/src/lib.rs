//! Heap-managed timers.
//!
//! A [`Timer`] is a garbage-collected cell wrapping a platform timer
//! source. The cell owning the resource means a timer dropped by the
//! mutator is still stopped: the collector runs [`tarn_gc::Cell::finalize`]
//! before the cell goes away, and that is the only place the source can
//! leak from otherwise.

use std::cell::Cell;

use log::debug;

use tarn_gc::{Gc, Heap, Trace, Visitor};

/// The underlying platform timer. Implementations arm and disarm whatever
/// event-loop facility backs them; both calls must be idempotent.
pub trait TimerSource {
    fn start(&self);
    fn stop(&self);
}

/// A one-shot timer as a managed cell.
pub struct Timer {
    source: Box<dyn TimerSource>,
    active: Cell<bool>,
    timed_out: Cell<bool>,
}

impl Timer {
    pub fn create(heap: &Heap, source: Box<dyn TimerSource>) -> Gc<Timer> {
        heap.allocate(Timer {
            source,
            active: Cell::new(false),
            timed_out: Cell::new(false),
        })
    }

    /// Arms the source. A timer that already fired stays quiet.
    pub fn start(&self) {
        if self.active.get() || self.timed_out.get() {
            return;
        }
        self.active.set(true);
        self.source.start();
    }

    pub fn stop(&self) {
        if !self.active.get() {
            return;
        }
        self.active.set(false);
        self.source.stop();
    }

    /// Called by the event loop when the source expires.
    pub fn fire(&self) {
        self.timed_out.set(true);
        self.active.set(false);
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn has_timed_out(&self) -> bool {
        self.timed_out.get()
    }
}

unsafe impl Trace for Timer {
    fn visit_edges(&self, _visitor: &mut Visitor) {}
}

impl tarn_gc::Cell for Timer {
    fn finalize(&mut self) {
        if self.active.get() {
            debug!("timer reclaimed while armed; stopping its source");
            self.stop();
        }
    }

    fn overrides_finalize(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use tarn_gc::{CollectionKind, Root};

    #[derive(Default)]
    struct Counters {
        starts: Cell<usize>,
        stops: Cell<usize>,
    }

    struct CountingSource(Rc<Counters>);

    impl TimerSource for CountingSource {
        fn start(&self) {
            self.0.starts.set(self.0.starts.get() + 1);
        }

        fn stop(&self) {
            self.0.stops.set(self.0.stops.get() + 1);
        }
    }

    fn counting_timer(heap: &Heap) -> (Gc<Timer>, Rc<Counters>) {
        let counters = Rc::new(Counters::default());
        let timer = Timer::create(heap, Box::new(CountingSource(counters.clone())));
        (timer, counters)
    }

    #[test]
    fn start_and_stop_hit_the_source_once() {
        let heap = Heap::new();
        let (timer, counters) = counting_timer(&heap);
        let _root = Root::new(&heap, timer);

        timer.start();
        timer.start();
        assert_eq!(counters.starts.get(), 1);

        timer.stop();
        timer.stop();
        assert_eq!(counters.stops.get(), 1);
    }

    #[test]
    fn a_fired_timer_does_not_rearm() {
        let heap = Heap::new();
        let (timer, counters) = counting_timer(&heap);
        let _root = Root::new(&heap, timer);

        timer.start();
        timer.fire();
        assert!(timer.has_timed_out());
        assert!(!timer.is_active());

        timer.start();
        assert_eq!(counters.starts.get(), 1);
    }

    #[test]
    fn reclamation_stops_an_armed_timer_once() {
        let heap = Heap::new();
        let (timer, counters) = counting_timer(&heap);
        timer.start();

        heap.collect_garbage(CollectionKind::CollectGarbage);
        assert_eq!(counters.stops.get(), 1);

        heap.collect_garbage(CollectionKind::CollectGarbage);
        drop(heap);
        assert_eq!(counters.stops.get(), 1);
    }

    #[test]
    fn reclamation_leaves_a_stopped_timer_alone() {
        let heap = Heap::new();
        let (timer, counters) = counting_timer(&heap);
        timer.start();
        timer.stop();

        heap.collect_garbage(CollectionKind::CollectGarbage);
        assert_eq!(counters.stops.get(), 1);
    }

    #[test]
    fn teardown_stops_live_armed_timers() {
        let heap = Heap::new();
        let (timer, counters) = counting_timer(&heap);
        let root = Root::new(&heap, timer);
        timer.start();

        drop(heap);
        assert_eq!(counters.stops.get(), 1);
        drop(root);
    }
}
