//! Cooperative event loop for the tabnode runtime
//!
//! Everything in a session runs on one thread. Completion callbacks for the
//! callback-style fs API and deferred event deliveries are queued here and
//! drained in issuance order. Timeouts are not kept here; they run on
//! `tokio::time` where an operation is awaited.

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

/// A queued callback
pub type Task = Box<dyn FnOnce()>;

/// Single-threaded task queue shared by one runtime session
pub struct EventLoop {
    microtasks: RefCell<VecDeque<Task>>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            microtasks: RefCell::new(VecDeque::with_capacity(64)),
        }
    }

    /// Queue a callback to run on the next drain (process.nextTick)
    pub fn queue(&self, task: impl FnOnce() + 'static) {
        self.microtasks.borrow_mut().push_back(Box::new(task));
    }

    pub fn has_pending_work(&self) -> bool {
        !self.microtasks.borrow().is_empty()
    }

    /// Drain queued callbacks, including ones queued while draining.
    /// Returns the number of callbacks run.
    pub fn run_microtasks(&self) -> usize {
        let mut ran = 0;
        loop {
            // The borrow ends before the task runs so tasks may queue more work
            let next = self.microtasks.borrow_mut().pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

pub fn create_event_loop() -> Rc<EventLoop> {
    Rc::new(EventLoop::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_loop_creation() {
        let event_loop = EventLoop::new();
        assert!(!event_loop.has_pending_work());
    }

    #[test]
    fn test_microtasks_run_in_order() {
        let event_loop = create_event_loop();
        let log = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let log = Rc::clone(&log);
            event_loop.queue(move || log.borrow_mut().push(i));
        }
        assert!(log.borrow().is_empty());

        assert_eq!(event_loop.run_microtasks(), 3);
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_nested_queue() {
        let event_loop = create_event_loop();
        let log = Rc::new(RefCell::new(Vec::new()));

        let inner_loop = Rc::clone(&event_loop);
        let inner_log = Rc::clone(&log);
        event_loop.queue(move || {
            inner_log.borrow_mut().push("outer");
            let log = Rc::clone(&inner_log);
            inner_loop.queue(move || log.borrow_mut().push("inner"));
        });

        event_loop.run_microtasks();
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_pending_work_tracks_queue() {
        let event_loop = create_event_loop();
        event_loop.queue(|| {});
        assert!(event_loop.has_pending_work());
        event_loop.run_microtasks();
        assert!(!event_loop.has_pending_work());
    }
}
