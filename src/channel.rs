//! Ordered broadcast channel for engine callbacks.
//!
//! [`Channel`] is the fan-out primitive every tracker and manager builds
//! on: listeners are invoked synchronously in registration order, and a
//! listener removed mid-dispatch (even from inside another listener's
//! callback) receives nothing further. `fire` snapshots the listener list
//! before invoking anything, then re-checks liveness per entry, so
//! additions and removals during dispatch never invalidate the iteration.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct ChannelInner<T> {
    next_id: u64,
    listeners: Vec<(u64, Rc<dyn Fn(&T)>)>,
}

pub struct Channel<T> {
    inner: Rc<RefCell<ChannelInner<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner) }
    }
}

impl<T: 'static> Channel<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ChannelInner { next_id: 0, listeners: Vec::new() })),
        }
    }

    /// Registers a listener; the returned [`Unlisten`] removes it again.
    pub fn add(&self, listener: Rc<dyn Fn(&T)>) -> Unlisten {
        let id = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.listeners.push((id, listener));
            id
        };
        let weak = Rc::downgrade(&self.inner);
        Unlisten::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().listeners.retain(|(lid, _)| *lid != id);
            }
        })
    }

    pub fn add_fn(&self, listener: impl Fn(&T) + 'static) -> Unlisten {
        self.add(Rc::new(listener))
    }

    /// Broadcasts `value` to every live listener in registration order.
    pub fn fire(&self, value: &T) {
        let snapshot: Vec<(u64, Rc<dyn Fn(&T)>)> = self.inner.borrow().listeners.clone();
        for (id, listener) in snapshot {
            let alive = self.inner.borrow().listeners.iter().any(|(lid, _)| *lid == id);
            if alive {
                listener(value);
            }
        }
    }

    pub fn remove_all(&self) {
        self.inner.borrow_mut().listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.inner.borrow().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listener_count() == 0
    }
}

impl<T: 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Idempotent removal handle returned by every `add`-style registration.
pub struct Unlisten {
    action: Cell<Option<Box<dyn FnOnce()>>>,
}

impl Unlisten {
    pub fn new(action: impl FnOnce() + 'static) -> Self {
        Self { action: Cell::new(Some(Box::new(action))) }
    }

    /// No-op handle for registrations that have nothing to undo.
    pub fn noop() -> Self {
        Self { action: Cell::new(None) }
    }

    /// Folds several handles into one.
    pub fn all(handles: Vec<Unlisten>) -> Self {
        Self::new(move || {
            for h in &handles {
                h.unlisten();
            }
        })
    }

    /// Runs the removal action. Safe to call any number of times.
    pub fn unlisten(&self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl std::fmt::Debug for Unlisten {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Unlisten")
    }
}
