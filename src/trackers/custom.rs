//! Custom-event tracker with race-free buffering.
//!
//! Custom events can be produced before any consumer has registered. Two
//! buffers absorb that race: ordinary custom events live in a buffer with a
//! fixed 10-second deadline, after which the whole buffer is dropped;
//! `sandbox-` prefixed events get a separate non-expiring buffer that is
//! cleared once a handler attaches. Expiry is an explicit state machine
//! advanced by the tick pump, not a hidden timeout.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::channel::{Channel, Unlisten};
use crate::clock::Clock;
use crate::config::TriggerConfig;
use crate::dom::NodeId;
use crate::errors::AnalyticsError;
use crate::event::{AnalyticsEvent, EventListener};
use crate::future::CancelToken;
use crate::root::AnalyticsRoot;
use crate::trackers::EventTracker;

/// How long early custom events are retained for late consumers.
pub const BUFFER_WINDOW: Duration = Duration::from_secs(10);

pub(crate) const SANDBOX_PREFIX: &str = "sandbox-";

pub(crate) enum BufferState {
    Buffering { deadline: Instant, events: HashMap<String, Vec<AnalyticsEvent>> },
    Expired,
}

/// Buffer pair shared by the custom and story trackers.
pub(crate) struct EventBuffers {
    main: RefCell<BufferState>,
    sandbox: RefCell<HashMap<String, Vec<AnalyticsEvent>>>,
}

impl EventBuffers {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            main: RefCell::new(BufferState::Buffering {
                deadline: now + BUFFER_WINDOW,
                events: HashMap::new(),
            }),
            sandbox: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn push(&self, event: AnalyticsEvent) {
        if event.event_type.starts_with(SANDBOX_PREFIX) {
            self.sandbox
                .borrow_mut()
                .entry(event.event_type.clone())
                .or_default()
                .push(event);
            return;
        }
        if let BufferState::Buffering { events, .. } = &mut *self.main.borrow_mut() {
            events.entry(event.event_type.clone()).or_default().push(event);
        }
    }

    /// Buffered events for one type, as they stand right now.
    pub(crate) fn snapshot(&self, event_type: &str) -> Vec<AnalyticsEvent> {
        if event_type.starts_with(SANDBOX_PREFIX) {
            return self.sandbox.borrow().get(event_type).cloned().unwrap_or_default();
        }
        match &*self.main.borrow() {
            BufferState::Buffering { events, .. } => {
                events.get(event_type).cloned().unwrap_or_default()
            }
            BufferState::Expired => Vec::new(),
        }
    }

    /// The sandbox buffer holds events only until a handler is ready.
    pub(crate) fn clear_sandbox(&self, event_type: &str) {
        self.sandbox.borrow_mut().remove(event_type);
    }

    pub(crate) fn tick(&self, now: Instant) {
        let mut state = self.main.borrow_mut();
        if let BufferState::Buffering { deadline, events } = &*state {
            if now >= *deadline {
                let dropped: usize = events.values().map(Vec::len).sum();
                if dropped > 0 {
                    log::debug!("custom event buffer expired, dropping {dropped} event(s)");
                }
                *state = BufferState::Expired;
            }
        }
    }

    pub(crate) fn dispose(&self) {
        *self.main.borrow_mut() = BufferState::Expired;
        self.sandbox.borrow_mut().clear();
    }
}

pub struct CustomEventTracker {
    root: Weak<AnalyticsRoot>,
    observables: RefCell<HashMap<String, Channel<AnalyticsEvent>>>,
    buffers: EventBuffers,
    token: CancelToken,
}

impl CustomEventTracker {
    pub fn new(root: &Rc<AnalyticsRoot>) -> Self {
        Self {
            root: Rc::downgrade(root),
            observables: RefCell::new(HashMap::new()),
            buffers: EventBuffers::new(root.clock().now()),
            token: CancelToken::new(),
        }
    }

    /// Producer entry point: delivers `event` to live listeners of its type
    /// and appends it to the applicable buffer while that is still active.
    pub fn trigger(&self, event: AnalyticsEvent) {
        let is_sandbox = event.event_type.starts_with(SANDBOX_PREFIX);
        let channel = self.observables.borrow().get(&event.event_type).cloned();
        if let Some(channel) = channel {
            channel.fire(&event);
            // A ready sandbox handler makes its buffer unnecessary.
            if is_sandbox {
                return;
            }
        }
        self.buffers.push(event);
    }
}

impl EventTracker for CustomEventTracker {
    fn add(
        &self,
        context: NodeId,
        event_type: &str,
        config: &TriggerConfig,
        listener: EventListener,
    ) -> Result<Unlisten, AnalyticsError> {
        let root = self.root.upgrade().ok_or(AnalyticsError::Disposed)?;
        let selector = config.selector_str().unwrap_or(":root").to_string();
        let target_ready = root.get_element(context, &selector, config.selection_method());

        let is_sandbox = event_type.starts_with(SANDBOX_PREFIX);
        let buffered = self.buffers.snapshot(event_type);
        if !buffered.is_empty() {
            let doc = Rc::clone(root.doc());
            let replay_listener = Rc::clone(&listener);
            target_ready.then_ok(&self.token, move |target: &NodeId| {
                for event in &buffered {
                    if doc.contains(*target, event.target) {
                        replay_listener(event);
                    }
                }
            });
            if is_sandbox {
                self.buffers.clear_sandbox(event_type);
            }
        }

        let channel = self
            .observables
            .borrow_mut()
            .entry(event_type.to_string())
            .or_insert_with(Channel::new)
            .clone();

        let doc = Rc::clone(root.doc());
        let token = self.token.clone();
        Ok(channel.add_fn(move |event: &AnalyticsEvent| {
            let event = event.clone();
            let doc = Rc::clone(&doc);
            let listener = Rc::clone(&listener);
            target_ready.then_ok(&token, move |target: &NodeId| {
                if doc.contains(*target, event.target) {
                    listener(&event);
                }
            });
        }))
    }

    fn dispose(&self) {
        self.token.cancel();
        self.buffers.dispose();
        for channel in self.observables.borrow().values() {
            channel.remove_all();
        }
    }

    fn tick(&self, now: Instant) {
        self.buffers.tick(now);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
