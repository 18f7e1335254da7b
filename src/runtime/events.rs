//! EventEmitter - typed listener lists for requests, servers and sockets
//!
//! Listeners are called synchronously, in registration order. The listener
//! list is snapshotted before dispatch, so a listener may register or remove
//! listeners (or emit further events) without a re-entrant borrow.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Identifies a registered listener for [`EventEmitter::off`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Rc<RefCell<dyn FnMut(&E)>>;

pub struct EventEmitter<E> {
    listeners: RefCell<Vec<(ListenerId, Listener<E>, bool)>>,
    next_id: Cell<u64>,
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            listeners: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }

    fn add(&self, listener: impl FnMut(&E) + 'static, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let listener: Listener<E> = Rc::new(RefCell::new(listener));
        self.listeners.borrow_mut().push((id, listener, once));
        id
    }

    pub fn on(&self, listener: impl FnMut(&E) + 'static) -> ListenerId {
        self.add(listener, false)
    }

    /// Listener removed after its first call
    pub fn once(&self, listener: impl FnMut(&E) + 'static) -> ListenerId {
        self.add(listener, true)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(existing, _, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    pub fn remove_all_listeners(&self) {
        self.listeners.borrow_mut().clear();
    }

    /// Call every listener with `event`. Returns false when nobody listened.
    pub fn emit(&self, event: &E) -> bool {
        let snapshot: Vec<(ListenerId, Listener<E>, bool)> = self
            .listeners
            .borrow()
            .iter()
            .map(|(id, listener, once)| (*id, Rc::clone(listener), *once))
            .collect();
        if snapshot.is_empty() {
            return false;
        }

        for (id, listener, once) in snapshot {
            if once {
                self.off(id);
            }
            // A listener emitting into itself is skipped instead of panicking
            if let Ok(mut call) = listener.try_borrow_mut() {
                call(event);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_order_and_off() {
        let emitter: EventEmitter<u32> = EventEmitter::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let first = Rc::clone(&log);
        let id = emitter.on(move |n| first.borrow_mut().push(("first", *n)));
        let second = Rc::clone(&log);
        emitter.on(move |n| second.borrow_mut().push(("second", *n)));

        assert!(emitter.emit(&1));
        assert!(emitter.off(id));
        emitter.emit(&2);

        assert_eq!(
            *log.borrow(),
            vec![("first", 1), ("second", 1), ("second", 2)]
        );
    }

    #[test]
    fn test_once() {
        let emitter: EventEmitter<()> = EventEmitter::new();
        let count = Rc::new(Cell::new(0));
        let counter = Rc::clone(&count);
        emitter.once(move |_| counter.set(counter.get() + 1));

        emitter.emit(&());
        emitter.emit(&());
        assert_eq!(count.get(), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_emit_without_listeners() {
        let emitter: EventEmitter<&str> = EventEmitter::new();
        assert!(!emitter.emit(&"nobody"));
    }

    #[test]
    fn test_listener_can_register_during_emit() {
        let emitter = Rc::new(EventEmitter::<u8>::new());
        let inner = Rc::clone(&emitter);
        emitter.on(move |_| {
            inner.on(|_| {});
        });
        emitter.emit(&0);
        assert_eq!(emitter.listener_count(), 2);
    }
}
