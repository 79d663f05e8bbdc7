//! Ordered, cancelable mailbox between the stack context and the worker.
//!
//! # Design Decisions
//! - A full queue blocks the producer instead of dropping; losing a close or
//!   error event would leak the binding
//! - Urgent events go to the head, so a later urgent event runs before an
//!   earlier one
//! - `cancel_pending` removes in place and keeps the relative order of
//!   everything else

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::net::event::{CorrelationId, Event, Priority};

/// Queue error conditions.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The queue was closed; the event is handed back.
    #[error("event queue is closed")]
    Closed(Event),
}

#[derive(Debug)]
struct State {
    events: VecDeque<Event>,
    closed: bool,
}

/// Blocking multi-producer, single-consumer event queue.
#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl EventQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                events: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue an event, waiting while the queue is full.
    pub fn enqueue(&self, event: Event, priority: Priority) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        while state.events.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(QueueError::Closed(event));
        }
        Self::insert(&mut state, event, priority);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue without waiting. May exceed capacity by this one event.
    ///
    /// Only the consumer uses this: blocking it on its own queue would
    /// never wake up.
    pub fn enqueue_overflow(&self, event: Event, priority: Priority) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed(event));
        }
        if state.events.len() >= self.capacity {
            tracing::warn!(
                depth = state.events.len(),
                capacity = self.capacity,
                kind = event.kind.name(),
                "Event queue over capacity"
            );
        }
        Self::insert(&mut state, event, priority);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    fn insert(state: &mut State, event: Event, priority: Priority) {
        match priority {
            Priority::Normal => state.events.push_back(event),
            Priority::Urgent => state.events.push_front(event),
        }
    }

    /// Wait for the next event. Returns `None` once closed and drained.
    pub fn dequeue(&self) -> Option<Event> {
        let mut state = self.state.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(event);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Take the next event if one is queued.
    pub fn try_dequeue(&self) -> Option<Event> {
        let event = self.state.lock().events.pop_front();
        if event.is_some() {
            self.not_full.notify_one();
        }
        event
    }

    /// Remove every queued event addressed to `target`. Returns how many were removed.
    pub fn cancel_pending(&self, target: CorrelationId) -> usize {
        self.take_pending(target).len()
    }

    /// Remove every queued event addressed to `target` and hand them back in queue order.
    pub fn take_pending(&self, target: CorrelationId) -> Vec<Event> {
        let mut state = self.state.lock();
        let (taken, kept): (VecDeque<Event>, VecDeque<Event>) =
            std::mem::take(&mut state.events).into_iter().partition(|event| event.target == target);
        state.events = kept;
        drop(state);
        if !taken.is_empty() {
            self.not_full.notify_all();
        }
        taken.into()
    }

    /// Stop accepting events and wake every waiter.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::event::EventKind;
    use crate::stack::PcbId;
    use std::sync::Arc;
    use std::time::Duration;

    fn poll(target: u64, pcb: u64) -> Event {
        Event::new(CorrelationId::from_raw(target), EventKind::PollTick { pcb: PcbId(pcb) })
    }

    fn tag(event: &Event) -> (u64, u64) {
        match event.kind {
            EventKind::PollTick { pcb } => (event.target.as_u64(), pcb.0),
            _ => (event.target.as_u64(), 0),
        }
    }

    #[test]
    fn urgent_events_jump_ahead() {
        let queue = EventQueue::with_capacity(8);
        queue.enqueue(poll(1, 1), Priority::Normal).unwrap();
        queue.enqueue(poll(1, 2), Priority::Normal).unwrap();
        queue
            .enqueue(Event::new(CorrelationId::from_raw(1), EventKind::ClearPending), Priority::Urgent)
            .unwrap();

        let first = queue.dequeue().unwrap();
        assert!(matches!(first.kind, EventKind::ClearPending));
        assert_eq!(tag(&queue.dequeue().unwrap()), (1, 1));
        assert_eq!(tag(&queue.dequeue().unwrap()), (1, 2));
    }

    #[test]
    fn take_pending_returns_removed_events_in_order() {
        let queue = EventQueue::with_capacity(16);
        for (target, pcb) in [(4, 1), (5, 2), (4, 3)] {
            queue.enqueue(poll(target, pcb), Priority::Normal).unwrap();
        }

        let taken: Vec<_> = queue.take_pending(CorrelationId::from_raw(4)).iter().map(tag).collect();
        assert_eq!(taken, vec![(4, 1), (4, 3)]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn cancel_pending_preserves_remaining_order() {
        let queue = EventQueue::with_capacity(16);
        let layout = [(1, 1), (2, 2), (1, 3), (3, 4), (2, 5), (1, 6), (3, 7)];
        for (target, pcb) in layout {
            queue.enqueue(poll(target, pcb), Priority::Normal).unwrap();
        }

        assert_eq!(queue.cancel_pending(CorrelationId::from_raw(1)), 3);

        let mut rest = Vec::new();
        while let Some(event) = queue.try_dequeue() {
            rest.push(tag(&event));
        }
        assert_eq!(rest, vec![(2, 2), (3, 4), (2, 5), (3, 7)]);
    }

    #[test]
    fn full_queue_blocks_producer_until_space() {
        let queue = Arc::new(EventQueue::with_capacity(1));
        queue.enqueue(poll(1, 1), Priority::Normal).unwrap();

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.enqueue(poll(1, 2), Priority::Normal).is_ok())
        };

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 1);
        assert_eq!(tag(&queue.dequeue().unwrap()), (1, 1));
        assert!(producer.join().unwrap());
        assert_eq!(tag(&queue.dequeue().unwrap()), (1, 2));
    }

    #[test]
    fn overflow_enqueue_never_blocks() {
        let queue = EventQueue::with_capacity(1);
        queue.enqueue(poll(1, 1), Priority::Normal).unwrap();
        queue.enqueue_overflow(poll(1, 2), Priority::Urgent).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(tag(&queue.dequeue().unwrap()), (1, 2));
    }

    #[test]
    fn close_drains_then_stops() {
        let queue = EventQueue::with_capacity(4);
        queue.enqueue(poll(1, 1), Priority::Normal).unwrap();
        queue.close();
        assert!(matches!(queue.enqueue(poll(1, 2), Priority::Normal), Err(QueueError::Closed(_))));
        assert!(queue.dequeue().is_some());
        assert!(queue.dequeue().is_none());
    }
}
