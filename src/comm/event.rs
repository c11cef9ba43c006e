//! Wall-clock event queue: deferred work posted for a future time and run
//! from the reactor loop, outside the readiness fast path.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::comm::Reactor;
use crate::utils::clock;

pub type EventCallback = Box<dyn FnOnce(&mut Reactor)>;

struct TimedEvent {
    due: f64,
    seq: u64,
    name: &'static str,
    cb: EventCallback,
}

impl PartialEq for TimedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for TimedEvent {}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest event surfaces,
        // with insertion order breaking ties
        other
            .due
            .partial_cmp(&self.due)
            .unwrap_or(Ordering::Equal)
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub struct EventQueue {
    heap: BinaryHeap<TimedEvent>,
    seq: u64,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue::default()
    }

    /// Post `cb` to run `delay` seconds from now.
    pub fn add(&mut self, name: &'static str, delay: f64, cb: EventCallback) {
        self.seq += 1;
        self.heap.push(TimedEvent {
            due: clock::current_dtime() + delay,
            seq: self.seq,
            name,
            cb,
        });
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn pop_due(&mut self, now: f64) -> Option<(&'static str, EventCallback)> {
        if self.heap.peek().map(|e| e.due <= now).unwrap_or(false) {
            let e = self.heap.pop().expect("peeked event exists");
            Some((e.name, e.cb))
        } else {
            None
        }
    }
}

/// Runs every due event. Events posted while running are not considered
/// until the next sweep, so a self-rescheduling event cannot starve I/O.
pub fn run_due(r: &mut Reactor) {
    let now = clock::current_dtime();
    let mut due = Vec::new();
    while let Some(ev) = r.events.pop_due(now) {
        due.push(ev);
    }
    for (name, cb) in due {
        log::trace!("running event {name}");
        cb(r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_surface_in_due_order() {
        crate::utils::clock::update_current_time();
        let mut q = EventQueue::new();
        q.add("later", 50.0, Box::new(|_| {}));
        q.add("soon", -1.0, Box::new(|_| {}));
        q.add("soon-too", -1.0, Box::new(|_| {}));

        let now = clock::current_dtime();
        let first = q.pop_due(now).expect("one event due");
        assert_eq!(first.0, "soon");
        let second = q.pop_due(now).expect("second event due");
        assert_eq!(second.0, "soon-too");
        assert!(q.pop_due(now).is_none());
        assert_eq!(q.len(), 1);
    }
}
