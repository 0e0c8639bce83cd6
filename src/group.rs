//! Trigger groups and registration staggering.
//!
//! An [`AnalyticsGroup`] binds one configuration block's triggers to one
//! root. Registration is deliberately staggered so documents with many
//! triggers don't block first paint: the first trigger registers
//! synchronously, the next few at high priority, the rest in a low-priority
//! slot. The [`Scheduler`] drains all high-priority work per tick but only
//! one low-priority task, as backpressure.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::channel::Unlisten;
use crate::config::TriggerConfig;
use crate::dom::NodeId;
use crate::errors::AnalyticsError;
use crate::event::{EventListener, TrackerKind};
use crate::root::AnalyticsRoot;

/// Triggers past the first this many register in the low-priority slot.
const HIGH_PRIORITY_TRIGGER_LIMIT: usize = 5;

type Task = Box<dyn FnOnce()>;

/// Two-level cooperative task queue pumped by the instrumentation tick.
pub struct Scheduler {
    high: RefCell<VecDeque<Task>>,
    low: RefCell<VecDeque<Task>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { high: RefCell::new(VecDeque::new()), low: RefCell::new(VecDeque::new()) }
    }

    pub fn schedule_high(&self, task: impl FnOnce() + 'static) {
        self.high.borrow_mut().push_back(Box::new(task));
    }

    pub fn schedule_low(&self, task: impl FnOnce() + 'static) {
        self.low.borrow_mut().push_back(Box::new(task));
    }

    /// Runs all pending high-priority tasks, then at most one low-priority
    /// task.
    pub fn pump(&self) {
        loop {
            let task = self.high.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
        let task = self.low.borrow_mut().pop_front();
        if let Some(task) = task {
            task();
        }
    }

    pub fn pending(&self) -> usize {
        self.high.borrow().len() + self.low.borrow().len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

struct GroupInner {
    root: Rc<AnalyticsRoot>,
    context: NodeId,
    scheduler: Rc<Scheduler>,
    subs: RefCell<Vec<Unlisten>>,
    trigger_count: Cell<usize>,
    disposed: Cell<bool>,
}

impl GroupInner {
    fn register(&self, config: &TriggerConfig, listener: EventListener) -> Result<(), AnalyticsError> {
        let on = config.on.clone().ok_or(AnalyticsError::MissingEventType)?;
        let kind = TrackerKind::from_event_type(&on);
        let tracker = self.root.get_tracker(kind);
        let sub = tracker.add(self.context, &on, config, listener)?;
        self.subs.borrow_mut().push(sub);
        Ok(())
    }
}

/// Binds one configuration block's triggers to one analytics root.
pub struct AnalyticsGroup {
    inner: Rc<GroupInner>,
}

impl AnalyticsGroup {
    pub fn new(root: Rc<AnalyticsRoot>, context: NodeId, scheduler: Rc<Scheduler>) -> Self {
        Self {
            inner: Rc::new(GroupInner {
                root,
                context,
                scheduler,
                subs: RefCell::new(Vec::new()),
                trigger_count: Cell::new(0),
                disposed: Cell::new(false),
            }),
        }
    }

    /// Registers one trigger. Cheap validation (event type present, kind
    /// permitted for the scope) is synchronous for every trigger; full
    /// registration runs immediately for the first trigger and is deferred
    /// for the rest, where a failure is logged and drops only that trigger.
    pub fn add_trigger(
        &self,
        config: &TriggerConfig,
        listener: EventListener,
    ) -> Result<(), AnalyticsError> {
        if self.inner.disposed.get() {
            return Err(AnalyticsError::Disposed);
        }
        let on = config.on.as_deref().ok_or(AnalyticsError::MissingEventType)?;
        let kind = TrackerKind::from_event_type(on);
        if !kind.allowed_in(self.inner.root.kind().allowance()) {
            return Err(AnalyticsError::TriggerNotAllowed(on.to_string()));
        }

        let index = self.inner.trigger_count.get();
        self.inner.trigger_count.set(index + 1);
        if index == 0 {
            return self.inner.register(config, listener);
        }

        let inner = Rc::clone(&self.inner);
        let config = config.clone();
        let task = move || {
            if inner.disposed.get() || inner.root.is_disposed() {
                return;
            }
            if let Err(err) = inner.register(&config, listener) {
                log::error!("deferred trigger registration failed: {err}");
            }
        };
        if index < HIGH_PRIORITY_TRIGGER_LIMIT {
            self.inner.scheduler.schedule_high(task);
        } else {
            self.inner.scheduler.schedule_low(task);
        }
        Ok(())
    }

    pub fn trigger_count(&self) -> usize {
        self.inner.trigger_count.get()
    }

    pub fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }
        for sub in self.inner.subs.borrow_mut().drain(..) {
            sub.unlisten();
        }
    }
}
