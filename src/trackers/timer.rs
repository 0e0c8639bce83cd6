//! Timer tracker.
//!
//! Each `add` creates one [`TimerEventHandler`]: an interval driven by the
//! injected clock through the tick pump, optionally armed and disarmed by
//! start/stop sub-triggers resolved through the timer allowlist. A timer
//! with no way to stop (no stop spec, or an explicit `maxTimerLength`) is
//! force-stopped at its deadline, and the forced stop emits a final event.
//! Start and stop sharing one underlying event toggle the running state
//! instead of double-registering.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::channel::Unlisten;
use crate::clock::{millis_since, Clock};
use crate::config::TriggerConfig;
use crate::dom::NodeId;
use crate::errors::AnalyticsError;
use crate::event::{AnalyticsEvent, EventListener, TrackerAllowance, TrackerKind};
use crate::root::AnalyticsRoot;
use crate::trackers::EventTracker;

const MIN_TIMER_INTERVAL_SECONDS: f64 = 0.5;
const DEFAULT_MAX_TIMER_LENGTH_SECONDS: f64 = 7200.0;

type ListenBuilder = Box<dyn Fn() -> Result<Unlisten, AnalyticsError>>;

pub struct TimerEventHandler {
    interval: Duration,
    max_timer_length: Duration,
    /// `maxTimerLength` was set explicitly, so the cap applies even with a
    /// stop trigger.
    max_in_spec: bool,
    call_immediate: bool,
    event_type: String,
    listener: EventListener,
    start_builder: Option<ListenBuilder>,
    stop_builder: Option<ListenBuilder>,
    unlisten_start: RefCell<Option<Unlisten>>,
    unlisten_stop: RefCell<Option<Unlisten>>,
    running: Cell<bool>,
    start_time: Cell<Option<Instant>>,
    last_request_time: Cell<Option<Instant>>,
    next_fire: Cell<Option<Instant>>,
    deadline: Cell<Option<Instant>>,
}

impl TimerEventHandler {
    fn new(
        interval: Duration,
        max_timer_length: Duration,
        max_in_spec: bool,
        call_immediate: bool,
        event_type: String,
        listener: EventListener,
        start_builder: Option<ListenBuilder>,
        stop_builder: Option<ListenBuilder>,
    ) -> Self {
        Self {
            interval,
            max_timer_length,
            max_in_spec,
            call_immediate,
            event_type,
            listener,
            start_builder,
            stop_builder,
            unlisten_start: RefCell::new(None),
            unlisten_stop: RefCell::new(None),
            running: Cell::new(false),
            start_time: Cell::new(None),
            last_request_time: Cell::new(None),
            next_fire: Cell::new(None),
            deadline: Cell::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    fn listen_for_start(&self) -> Result<(), AnalyticsError> {
        if let Some(builder) = &self.start_builder {
            *self.unlisten_start.borrow_mut() = Some(builder()?);
        }
        Ok(())
    }

    fn unlisten_for_start(&self) {
        if let Some(sub) = self.unlisten_start.borrow_mut().take() {
            sub.unlisten();
        }
    }

    fn listen_for_stop(&self) -> Result<(), AnalyticsError> {
        if let Some(builder) = &self.stop_builder {
            match builder() {
                Ok(sub) => *self.unlisten_stop.borrow_mut() = Some(sub),
                Err(err) => {
                    // Stop the timer before surfacing the error.
                    self.dispose();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn unlisten_for_stop(&self) {
        if let Some(sub) = self.unlisten_stop.borrow_mut().take() {
            sub.unlisten();
        }
    }

    fn start(&self, root_element: NodeId, epoch: Instant, now: Instant) -> Result<(), AnalyticsError> {
        if self.is_running() {
            return Ok(());
        }
        self.running.set(true);
        self.start_time.set(Some(now));
        self.last_request_time.set(None);
        self.next_fire.set(Some(now + self.interval));
        // If there is no way to turn off the timer, cap it.
        if self.stop_builder.is_none() || self.max_in_spec {
            self.deadline.set(Some(now + self.max_timer_length));
        }
        self.unlisten_for_start();
        if self.call_immediate {
            self.fire(root_element, epoch, now);
        }
        self.listen_for_stop()
    }

    fn stop(&self, root_element: NodeId, epoch: Instant, now: Instant) {
        if !self.is_running() {
            return;
        }
        self.fire(root_element, epoch, now);
        self.running.set(false);
        self.next_fire.set(None);
        self.deadline.set(None);
        self.last_request_time.set(None);
        self.unlisten_for_stop();
        if let Err(err) = self.listen_for_start() {
            log::error!("failed to re-arm timer start trigger: {err}");
        }
    }

    fn fire(&self, root_element: NodeId, epoch: Instant, now: Instant) {
        (self.listener)(&AnalyticsEvent::with_vars(
            root_element,
            &self.event_type,
            self.timer_vars(epoch, now),
        ));
    }

    fn timer_vars(&self, epoch: Instant, now: Instant) -> BTreeMap<String, String> {
        let mut duration_ms = 0;
        if self.is_running() {
            let anchor = self.last_request_time.get().or(self.start_time.get());
            duration_ms = anchor.map_or(0, |anchor| millis_since(anchor, now));
            self.last_request_time.set(Some(now));
        }
        let mut vars = BTreeMap::new();
        vars.insert("timerDuration".to_string(), duration_ms.to_string());
        vars.insert(
            "timerStart".to_string(),
            self.start_time.get().map_or(0, |start| millis_since(epoch, start)).to_string(),
        );
        vars
    }

    fn dispose(&self) {
        self.unlisten_for_stop();
        self.unlisten_for_start();
    }
}

struct TimerInner {
    root: Weak<AnalyticsRoot>,
    timers: RefCell<HashMap<u64, Rc<TimerEventHandler>>>,
    seq: Cell<u64>,
}

impl TimerInner {
    fn toggle(&self, timer_id: u64) {
        let Some(handler) = self.timers.borrow().get(&timer_id).cloned() else {
            return;
        };
        let Some(root) = self.root.upgrade() else {
            return;
        };
        let now = root.clock().now();
        if handler.is_running() {
            handler.stop(root.root_element(), root.epoch(), now);
        } else if let Err(err) = handler.start(root.root_element(), root.epoch(), now) {
            log::error!("failed to start timer: {err}");
        }
    }

    fn remove(&self, timer_id: u64) {
        let Some(handler) = self.timers.borrow_mut().remove(&timer_id) else {
            return;
        };
        if let Some(root) = self.root.upgrade() {
            handler.stop(root.root_element(), root.epoch(), root.clock().now());
        }
        handler.dispose();
    }
}

pub struct TimerEventTracker {
    inner: Rc<TimerInner>,
}

impl TimerEventTracker {
    pub fn new(root: &Rc<AnalyticsRoot>) -> Self {
        Self {
            inner: Rc::new(TimerInner {
                root: Rc::downgrade(root),
                timers: RefCell::new(HashMap::new()),
                seq: Cell::new(0),
            }),
        }
    }

    pub fn tracked_timer_count(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    /// Builds the start/stop sub-trigger registration for a nested spec.
    fn sub_trigger_builder(
        inner: &Rc<TimerInner>,
        root: &Rc<AnalyticsRoot>,
        context: NodeId,
        sub_config: &TriggerConfig,
        timer_id: u64,
    ) -> Result<ListenBuilder, AnalyticsError> {
        let on = sub_config.on.clone().ok_or(AnalyticsError::MissingEventType)?;
        let kind = TrackerKind::from_event_type(&on);
        let tracker = root.get_tracker_for_allowlist(kind, TrackerAllowance::TIMER)?;

        let weak = Rc::downgrade(inner);
        let sub_config = sub_config.clone();
        Ok(Box::new(move || {
            let weak = weak.clone();
            let toggle: EventListener = Rc::new(move |_event: &AnalyticsEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.toggle(timer_id);
                }
            });
            tracker.add(context, &on, &sub_config, toggle)
        }))
    }
}

impl EventTracker for TimerEventTracker {
    fn add(
        &self,
        context: NodeId,
        event_type: &str,
        config: &TriggerConfig,
        listener: EventListener,
    ) -> Result<Unlisten, AnalyticsError> {
        let root = self.inner.root.upgrade().ok_or(AnalyticsError::Disposed)?;
        let spec = config
            .timer_spec
            .as_ref()
            .ok_or(AnalyticsError::BadTimerSpec("missing timerSpec on timer trigger"))?;

        let interval_seconds =
            spec.interval.ok_or(AnalyticsError::BadTimerSpec("timer interval required"))?;
        if !interval_seconds.is_finite() || interval_seconds < MIN_TIMER_INTERVAL_SECONDS {
            return Err(AnalyticsError::BadTimerSpec("bad timer interval specification"));
        }
        let max_in_spec = spec.max_timer_length.is_some();
        let max_seconds = spec.max_timer_length.unwrap_or(DEFAULT_MAX_TIMER_LENGTH_SECONDS);
        if !max_seconds.is_finite() || max_seconds <= 0.0 {
            return Err(AnalyticsError::BadTimerSpec("bad maxTimerLength specification"));
        }

        let timer_id = self.inner.seq.get() + 1;
        self.inner.seq.set(timer_id);

        let start_builder = spec
            .start_spec
            .as_ref()
            .map(|sub| Self::sub_trigger_builder(&self.inner, &root, context, sub, timer_id))
            .transpose()?;
        let stop_builder = spec
            .stop_spec
            .as_ref()
            .map(|sub| Self::sub_trigger_builder(&self.inner, &root, context, sub, timer_id))
            .transpose()?;

        let handler = Rc::new(TimerEventHandler::new(
            Duration::from_secs_f64(interval_seconds),
            Duration::from_secs_f64(max_seconds),
            max_in_spec,
            spec.immediate.unwrap_or(true),
            event_type.to_string(),
            listener,
            start_builder,
            stop_builder,
        ));
        self.inner.timers.borrow_mut().insert(timer_id, Rc::clone(&handler));

        // Without a start trigger the timer begins immediately.
        let init = if handler.start_builder.is_none() {
            handler.start(root.root_element(), root.epoch(), root.clock().now())
        } else {
            handler.listen_for_start()
        };
        if let Err(err) = init {
            self.inner.timers.borrow_mut().remove(&timer_id);
            handler.dispose();
            return Err(err);
        }

        let weak = Rc::downgrade(&self.inner);
        Ok(Unlisten::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(timer_id);
            }
        }))
    }

    fn dispose(&self) {
        let ids: Vec<u64> = self.inner.timers.borrow().keys().copied().collect();
        for id in ids {
            self.inner.remove(id);
        }
    }

    fn tick(&self, now: Instant) {
        let Some(root) = self.inner.root.upgrade() else {
            return;
        };
        let root_element = root.root_element();
        let epoch = root.epoch();
        let snapshot: Vec<(u64, Rc<TimerEventHandler>)> = self
            .inner
            .timers
            .borrow()
            .iter()
            .map(|(id, handler)| (*id, Rc::clone(handler)))
            .collect();
        for (id, handler) in snapshot {
            if !handler.is_running() {
                continue;
            }
            // The deadline wins over a coinciding interval fire: the
            // forced stop emits the final event.
            if let Some(deadline) = handler.deadline.get() {
                if now >= deadline {
                    self.inner.remove(id);
                    continue;
                }
            }
            while let Some(next) = handler.next_fire.get() {
                if next > now || !handler.is_running() {
                    break;
                }
                handler.next_fire.set(Some(next + handler.interval));
                handler.fire(root_element, epoch, next);
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
