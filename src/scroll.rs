//! Per-scope scroll state.
//!
//! The embedder feeds raw viewport geometry (page coordinates) into the
//! scope's [`ScrollManager`]. The manager rebases it against the scope's
//! own origin offset (an embedded sub-document reports scroll relative to
//! its container, not the top-level page), captures the initial content
//! size, and rebroadcasts to scroll handlers only when something changed.

use std::cell::{Cell, RefCell};

use crate::channel::{Channel, Unlisten};

/// Raw viewport geometry supplied by the embedder, in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportGeometry {
    pub top: f64,
    pub left: f64,
    pub width: f64,
    pub height: f64,
    pub scroll_height: f64,
    pub scroll_width: f64,
}

/// Content size observed at the first measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitialSize {
    pub scroll_height: f64,
    pub scroll_width: f64,
}

/// Scope-relative scroll state delivered to scroll handlers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollEvent {
    pub top: f64,
    pub left: f64,
    pub width: f64,
    pub height: f64,
    pub scroll_height: f64,
    pub scroll_width: f64,
    pub initial_size: InitialSize,
}

pub struct ScrollManager {
    channel: Channel<ScrollEvent>,
    /// Scope origin offset within the page; (0, 0) for a top-level scope.
    origin: Cell<(f64, f64)>,
    initial: Cell<Option<InitialSize>>,
    last: RefCell<Option<ScrollEvent>>,
}

impl ScrollManager {
    pub fn new() -> Self {
        Self {
            channel: Channel::new(),
            origin: Cell::new((0.0, 0.0)),
            initial: Cell::new(None),
            last: RefCell::new(None),
        }
    }

    pub fn with_origin(left: f64, top: f64) -> Self {
        let manager = Self::new();
        manager.origin.set((left, top));
        manager
    }

    pub fn set_origin(&self, left: f64, top: f64) {
        self.origin.set((left, top));
    }

    /// Registers a scroll handler; replays the last known state so late
    /// registrations observe the current position.
    pub fn add_scroll_handler(&self, handler: std::rc::Rc<dyn Fn(&ScrollEvent)>) -> Unlisten {
        if let Some(last) = *self.last.borrow() {
            handler(&last);
        }
        self.channel.add(handler)
    }

    /// Feeds a raw geometry sample; broadcasts when the relative state
    /// differs from the previous one.
    pub fn update(&self, raw: ViewportGeometry) {
        let (left, top) = self.origin.get();
        let initial = match self.initial.get() {
            Some(initial) => initial,
            None => {
                let initial = InitialSize {
                    scroll_height: raw.scroll_height,
                    scroll_width: raw.scroll_width,
                };
                self.initial.set(Some(initial));
                initial
            }
        };
        let event = ScrollEvent {
            top: raw.top - top,
            left: raw.left - left,
            width: raw.width,
            height: raw.height,
            scroll_height: raw.scroll_height,
            scroll_width: raw.scroll_width,
            initial_size: initial,
        };
        if *self.last.borrow() == Some(event) {
            return;
        }
        *self.last.borrow_mut() = Some(event);
        self.channel.fire(&event);
    }

    pub fn last_event(&self) -> Option<ScrollEvent> {
        *self.last.borrow()
    }

    pub fn handler_count(&self) -> usize {
        self.channel.listener_count()
    }

    pub fn dispose(&self) {
        self.channel.remove_all();
    }
}

impl Default for ScrollManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn geometry(top: f64, scroll_height: f64) -> ViewportGeometry {
        ViewportGeometry {
            top,
            left: 0.0,
            width: 400.0,
            height: 600.0,
            scroll_height,
            scroll_width: 400.0,
        }
    }

    #[test]
    fn rebroadcasts_only_on_change() {
        let manager = ScrollManager::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        manager.add_scroll_handler(Rc::new(move |e: &ScrollEvent| seen2.borrow_mut().push(e.top)));

        manager.update(geometry(0.0, 1200.0));
        manager.update(geometry(0.0, 1200.0));
        manager.update(geometry(300.0, 1200.0));
        assert_eq!(*seen.borrow(), vec![0.0, 300.0]);
    }

    #[test]
    fn initial_size_is_captured_once() {
        let manager = ScrollManager::new();
        manager.update(geometry(0.0, 1200.0));
        manager.update(geometry(100.0, 2400.0));

        let event = manager.last_event().unwrap();
        assert_eq!(event.scroll_height, 2400.0);
        assert_eq!(event.initial_size.scroll_height, 1200.0);
    }

    #[test]
    fn embedded_scope_reports_relative_to_origin() {
        let manager = ScrollManager::with_origin(50.0, 800.0);
        manager.update(ViewportGeometry {
            top: 900.0,
            left: 50.0,
            width: 300.0,
            height: 200.0,
            scroll_height: 1000.0,
            scroll_width: 300.0,
        });
        let event = manager.last_event().unwrap();
        assert_eq!(event.top, 100.0);
        assert_eq!(event.left, 0.0);
    }

    #[test]
    fn late_handler_sees_last_state_immediately() {
        let manager = ScrollManager::new();
        manager.update(geometry(250.0, 1200.0));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        manager.add_scroll_handler(Rc::new(move |e: &ScrollEvent| seen2.borrow_mut().push(e.top)));
        assert_eq!(*seen.borrow(), vec![250.0]);
    }

    #[test]
    fn unlisten_stops_delivery() {
        let manager = ScrollManager::new();
        let hits = Rc::new(Cell::new(0));
        let hits2 = Rc::clone(&hits);
        let sub = manager.add_scroll_handler(Rc::new(move |_| hits2.set(hits2.get() + 1)));

        manager.update(geometry(0.0, 1200.0));
        sub.unlisten();
        manager.update(geometry(100.0, 1200.0));
        assert_eq!(hits.get(), 1);
    }
}
