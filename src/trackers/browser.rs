//! Browser-event tracker (opt-in): raw input events debounced before
//! selective fan-out, since blur/change/input bursts can fire at high
//! frequency.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::channel::{Channel, Unlisten};
use crate::clock::Clock;
use crate::config::TriggerConfig;
use crate::dom::{DomEvent, NodeId};
use crate::errors::AnalyticsError;
use crate::event::{AnalyticsEvent, EventListener, BROWSER_EVENTS};
use crate::root::AnalyticsRoot;
use crate::trackers::{effective_context, EventTracker};

const DEBOUNCE: Duration = Duration::from_millis(500);

struct PendingEvent {
    deadline: Instant,
    event: DomEvent,
}

pub struct BrowserEventTracker {
    root: Weak<AnalyticsRoot>,
    /// Latest raw event per type, waiting out its debounce window.
    pending: Rc<RefCell<HashMap<String, PendingEvent>>>,
    channels: RefCell<HashMap<String, Channel<DomEvent>>>,
    doc_subs: RefCell<Vec<Unlisten>>,
}

impl BrowserEventTracker {
    pub fn new(root: &Rc<AnalyticsRoot>) -> Self {
        Self {
            root: Rc::downgrade(root),
            pending: Rc::new(RefCell::new(HashMap::new())),
            channels: RefCell::new(HashMap::new()),
            doc_subs: RefCell::new(Vec::new()),
        }
    }

    fn channel_for(&self, root: &Rc<AnalyticsRoot>, event_type: &str) -> Channel<DomEvent> {
        if let Some(channel) = self.channels.borrow().get(event_type) {
            return channel.clone();
        }
        let channel: Channel<DomEvent> = Channel::new();
        self.channels.borrow_mut().insert(event_type.to_string(), channel.clone());

        // One raw listener per type; bursts collapse to the latest event.
        let pending = Rc::clone(&self.pending);
        let clock = Rc::clone(root.clock());
        let sub = root.doc().add_event_listener(
            event_type,
            Rc::new(move |event: &DomEvent| {
                pending.borrow_mut().insert(
                    event.event_type.clone(),
                    PendingEvent { deadline: clock.now() + DEBOUNCE, event: event.clone() },
                );
            }),
        );
        self.doc_subs.borrow_mut().push(sub);
        channel
    }
}

impl EventTracker for BrowserEventTracker {
    fn add(
        &self,
        context: NodeId,
        event_type: &str,
        config: &TriggerConfig,
        listener: EventListener,
    ) -> Result<Unlisten, AnalyticsError> {
        let root = self.root.upgrade().ok_or(AnalyticsError::Disposed)?;
        if !root.options().allow_browser_events {
            return Err(AnalyticsError::BrowserEventsDisabled);
        }
        if !BROWSER_EVENTS.contains(&event_type) {
            return Err(AnalyticsError::TriggerNotAllowed(event_type.to_string()));
        }
        let selector = config
            .selector_str()
            .ok_or(AnalyticsError::MissingSelector("browser event"))?
            .to_string();

        let doc = Rc::clone(root.doc());
        let fired_type = event_type.to_string();
        let selective = root.create_selective_listener(
            Rc::new(move |target: NodeId, event: &DomEvent| {
                let mut vars = doc.data_vars(target);
                vars.extend(event.vars.clone());
                listener(&AnalyticsEvent::with_vars(target, &fired_type, vars));
            }),
            effective_context(&root, context),
            &selector,
            config.selection_method(),
        );
        Ok(self.channel_for(&root, event_type).add(selective))
    }

    fn dispose(&self) {
        for sub in self.doc_subs.borrow_mut().drain(..) {
            sub.unlisten();
        }
        for channel in self.channels.borrow().values() {
            channel.remove_all();
        }
        self.pending.borrow_mut().clear();
    }

    fn tick(&self, now: Instant) {
        let due: Vec<DomEvent> = {
            let mut pending = self.pending.borrow_mut();
            let keys: Vec<String> = pending
                .iter()
                .filter(|(_, p)| now >= p.deadline)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter().filter_map(|k| pending.remove(&k)).map(|p| p.event).collect()
        };
        for event in due {
            let channel = self.channels.borrow().get(&event.event_type).cloned();
            if let Some(channel) = channel {
                channel.fire(&event);
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockHandle, ManualClock};
    use crate::dom::Document;
    use crate::root::ScopeOptions;

    fn setup(allow: bool) -> (Rc<AnalyticsRoot>, crate::dom::DocumentHandle, Rc<ManualClock>) {
        let doc = Document::new("html");
        let clock = Rc::new(ManualClock::new());
        let epoch = clock.now();
        let root = AnalyticsRoot::new_document(
            Rc::clone(&doc),
            Rc::clone(&clock) as ClockHandle,
            epoch,
            ScopeOptions { allow_browser_events: allow },
        );
        (root, doc, clock)
    }

    fn input_config() -> TriggerConfig {
        serde_json::from_str(r##"{"on": "input", "selector": "#field"}"##).unwrap()
    }

    #[test]
    fn requires_explicit_opt_in() {
        let (root, doc, _clock) = setup(false);
        let tracker = BrowserEventTracker::new(&root);
        let result = tracker.add(doc.root(), "input", &input_config(), Rc::new(|_| {}));
        assert!(matches!(result, Err(AnalyticsError::BrowserEventsDisabled)));
    }

    #[test]
    fn rejects_unknown_browser_events() {
        let (root, doc, _clock) = setup(true);
        let tracker = BrowserEventTracker::new(&root);
        let config: TriggerConfig =
            serde_json::from_str(r##"{"on": "wheel", "selector": "#field"}"##).unwrap();
        let result = tracker.add(doc.root(), "wheel", &config, Rc::new(|_| {}));
        assert!(matches!(result, Err(AnalyticsError::TriggerNotAllowed(_))));
    }

    #[test]
    fn bursts_debounce_to_the_latest_event() {
        let (root, doc, clock) = setup(true);
        let field = doc.create_element_with(doc.root(), "input", &[("id", "field")]);
        let tracker = BrowserEventTracker::new(&root);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        tracker
            .add(
                doc.root(),
                "input",
                &input_config(),
                Rc::new(move |event: &AnalyticsEvent| {
                    seen2.borrow_mut().push(event.vars.get("value").cloned().unwrap_or_default());
                }),
            )
            .unwrap();

        for value in ["h", "he", "hel"] {
            let mut vars = std::collections::BTreeMap::new();
            vars.insert("value".to_string(), value.to_string());
            doc.dispatch_event(DomEvent::with_vars(field, "input", vars));
            clock.advance_ms(100);
            tracker.tick(clock.now());
        }
        assert!(seen.borrow().is_empty(), "still inside the debounce window");

        clock.advance_ms(500);
        tracker.tick(clock.now());
        assert_eq!(*seen.borrow(), vec!["hel"]);
    }

    #[test]
    fn events_after_the_window_fire_separately() {
        let (root, doc, clock) = setup(true);
        let field = doc.create_element_with(doc.root(), "input", &[("id", "field")]);
        let tracker = BrowserEventTracker::new(&root);

        let hits = Rc::new(std::cell::Cell::new(0));
        let hits2 = Rc::clone(&hits);
        tracker
            .add(doc.root(), "input", &input_config(), Rc::new(move |_| hits2.set(hits2.get() + 1)))
            .unwrap();

        doc.dispatch_event(DomEvent::new(field, "input"));
        clock.advance_ms(500);
        tracker.tick(clock.now());
        assert_eq!(hits.get(), 1);

        doc.dispatch_event(DomEvent::new(field, "input"));
        clock.advance_ms(500);
        tracker.tick(clock.now());
        assert_eq!(hits.get(), 2);
    }
}
