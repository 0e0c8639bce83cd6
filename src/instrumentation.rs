//! Instrumentation service: the explicit scope registry and the engine's
//! pump.
//!
//! One service owns every [`AnalyticsRoot`] in a session, keyed by scope
//! id, with create-on-first-access and dispose-on-teardown. It resolves
//! the correct root for a document handle (embedded sub-documents
//! delegate to a root chained to their parent's), exposes the
//! `trigger_custom_event` entry point for external producers, and drives
//! all time-based state (registration staggering, buffer expiry, timers,
//! debounce, visibility time thresholds) from a single `tick`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::clock::{Clock, ClockHandle, SystemClock};
use crate::dom::{DocumentHandle, NodeId, ScopeId};
use crate::event::{AnalyticsEvent, TrackerKind};
use crate::group::{AnalyticsGroup, Scheduler};
use crate::root::{AnalyticsRoot, ScopeOptions};
use crate::trackers::{CustomEventTracker, StoryEventTracker};

#[derive(Debug, Clone, Copy, Default)]
pub struct InstrumentationOptions {
    /// Opt-in for browser-event triggers (blur/change/focus/input).
    pub allow_browser_events: bool,
}

pub struct InstrumentationService {
    clock: ClockHandle,
    epoch: Instant,
    scheduler: Rc<Scheduler>,
    options: InstrumentationOptions,
    roots: RefCell<HashMap<ScopeId, Rc<AnalyticsRoot>>>,
}

impl InstrumentationService {
    pub fn new() -> Self {
        Self::with_clock(Rc::new(SystemClock))
    }

    pub fn with_clock(clock: Rc<dyn Clock>) -> Self {
        Self::with_options(clock, InstrumentationOptions::default())
    }

    pub fn with_options(clock: Rc<dyn Clock>, options: InstrumentationOptions) -> Self {
        let epoch = clock.now();
        Self {
            clock,
            epoch,
            scheduler: Rc::new(Scheduler::new()),
            options,
            roots: RefCell::new(HashMap::new()),
        }
    }

    pub fn clock(&self) -> &ClockHandle {
        &self.clock
    }

    pub fn scheduler(&self) -> &Rc<Scheduler> {
        &self.scheduler
    }

    /// Resolves the analytics root for `doc`, creating it on first access.
    /// An embedded document gets an embed root chained to its parent's.
    pub fn root_for(&self, doc: &DocumentHandle) -> Rc<AnalyticsRoot> {
        if let Some(existing) = self.roots.borrow().get(&doc.scope_id()) {
            return Rc::clone(existing);
        }
        let scope_options = ScopeOptions { allow_browser_events: self.options.allow_browser_events };
        let root = match doc.embed_link() {
            Some((parent_doc, host)) => {
                let parent = self.root_for(&parent_doc);
                AnalyticsRoot::new_embed(Rc::clone(doc), host, &parent, scope_options)
            }
            None => AnalyticsRoot::new_document(
                Rc::clone(doc),
                Rc::clone(&self.clock),
                self.epoch,
                scope_options,
            ),
        };
        log::debug!("created analytics root for scope {}", doc.scope_id());
        self.roots.borrow_mut().insert(doc.scope_id(), Rc::clone(&root));
        root
    }

    pub fn root_for_optional(&self, scope_id: ScopeId) -> Option<Rc<AnalyticsRoot>> {
        self.roots.borrow().get(&scope_id).cloned()
    }

    /// Creates a trigger group bound to `doc`'s root, anchored at the
    /// configuration element `context`.
    pub fn create_group(&self, doc: &DocumentHandle, context: NodeId) -> AnalyticsGroup {
        AnalyticsGroup::new(self.root_for(doc), context, Rc::clone(&self.scheduler))
    }

    /// Producer entry point: routes a custom (or story) event to the
    /// owning scope's tracker. Accepted at any time; buffering covers
    /// events that arrive before any consumer registered. With
    /// `enable_data_vars`, the target's declared variables merge under the
    /// caller's.
    pub fn trigger_custom_event(
        &self,
        doc: &DocumentHandle,
        target: NodeId,
        event_type: &str,
        vars: std::collections::BTreeMap<String, String>,
        enable_data_vars: bool,
    ) {
        let root = self.root_for(doc);
        let event = if enable_data_vars {
            AnalyticsEvent::merged(doc, target, event_type, vars)
        } else {
            AnalyticsEvent::with_vars(target, event_type, vars)
        };
        match TrackerKind::from_event_type(event_type) {
            TrackerKind::Story => {
                let tracker = root.get_tracker(TrackerKind::Story);
                if let Some(story) = tracker.as_any().downcast_ref::<StoryEventTracker>() {
                    story.trigger(event);
                }
            }
            TrackerKind::Custom => {
                let tracker = root.get_tracker(TrackerKind::Custom);
                if let Some(custom) = tracker.as_any().downcast_ref::<CustomEventTracker>() {
                    custom.trigger(event);
                }
            }
            other => {
                log::warn!(
                    "ignoring triggered event {event_type:?}: reserved for the {} tracker",
                    other.key_name()
                );
            }
        }
    }

    /// Advances the engine: pumps deferred registrations, then every
    /// scope's time-driven state.
    pub fn tick(&self) {
        self.scheduler.pump();
        let now = self.clock.now();
        let roots: Vec<Rc<AnalyticsRoot>> = self.roots.borrow().values().cloned().collect();
        for root in roots {
            root.tick(now);
        }
    }

    /// Tears down one scope, cascading to its trackers and managers.
    pub fn dispose_scope(&self, scope_id: ScopeId) {
        if let Some(root) = self.roots.borrow_mut().remove(&scope_id) {
            root.dispose();
        }
    }

    pub fn dispose(&self) {
        let roots = std::mem::take(&mut *self.roots.borrow_mut());
        for root in roots.values() {
            root.dispose();
        }
    }

    pub fn scope_count(&self) -> usize {
        self.roots.borrow().len()
    }
}

impl Default for InstrumentationService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TriggerConfig;
    use crate::dom::Document;
    use crate::event::ScopeKind;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    fn service() -> (InstrumentationService, Rc<ManualClock>) {
        let clock = Rc::new(ManualClock::new());
        (InstrumentationService::with_clock(Rc::clone(&clock) as ClockHandle), clock)
    }

    #[test]
    fn roots_are_cached_per_scope() {
        let (service, _clock) = service();
        let doc = Document::new("html");
        let first = service.root_for(&doc);
        let second = service.root_for(&doc);
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(service.scope_count(), 1);
    }

    #[test]
    fn embedded_documents_get_embed_roots_with_parents() {
        let (service, _clock) = service();
        let parent_doc = Document::new("html");
        let frame = parent_doc.create_element(parent_doc.root(), "iframe");
        let child_doc = Document::new_embedded(&parent_doc, frame, "html");

        let child_root = service.root_for(&child_doc);
        assert_eq!(child_root.kind(), ScopeKind::Embed);
        assert_eq!(child_root.host_element(), Some(frame));
        // Resolving the child created the parent root too.
        assert_eq!(service.scope_count(), 2);
    }

    #[test]
    fn custom_events_buffer_until_a_consumer_registers() {
        let (service, clock) = service();
        let doc = Document::new("html");
        doc.set_ready();

        service.trigger_custom_event(&doc, doc.root(), "early-event", BTreeMap::new(), true);

        let group = service.create_group(&doc, doc.root());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        let config: TriggerConfig = serde_json::from_str(r#"{"on": "early-event"}"#).unwrap();
        group
            .add_trigger(
                &config,
                Rc::new(move |event: &AnalyticsEvent| seen2.borrow_mut().push(event.clone())),
            )
            .unwrap();
        assert_eq!(seen.borrow().len(), 1, "buffered event replays exactly once");

        // The same registration done after the buffer window gets nothing.
        clock.advance_ms(10_000);
        service.tick();
        let late = Rc::new(RefCell::new(Vec::new()));
        let late2 = Rc::clone(&late);
        let group2 = service.create_group(&doc, doc.root());
        group2
            .add_trigger(
                &config,
                Rc::new(move |event: &AnalyticsEvent| late2.borrow_mut().push(event.clone())),
            )
            .unwrap();
        assert!(late.borrow().is_empty());
    }

    #[test]
    fn trigger_custom_event_merges_declared_vars_under_caller_vars() {
        let (service, _clock) = service();
        let doc = Document::new("html");
        let el = doc.create_element_with(
            doc.root(),
            "div",
            &[("data-vars-a", "declared"), ("data-vars-b", "kept")],
        );
        doc.set_ready();

        let group = service.create_group(&doc, doc.root());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        let config: TriggerConfig = serde_json::from_str(r#"{"on": "ping"}"#).unwrap();
        group
            .add_trigger(
                &config,
                Rc::new(move |event: &AnalyticsEvent| seen2.borrow_mut().push(event.clone())),
            )
            .unwrap();

        let mut vars = BTreeMap::new();
        vars.insert("a".to_string(), "caller".to_string());
        service.trigger_custom_event(&doc, el, "ping", vars, true);

        let event = &seen.borrow()[0];
        assert_eq!(event.vars.get("a").map(String::as_str), Some("caller"));
        assert_eq!(event.vars.get("b").map(String::as_str), Some("kept"));
    }

    #[test]
    fn reserved_event_types_are_not_routable_as_custom() {
        let (service, _clock) = service();
        let doc = Document::new("html");
        // Must not panic or create spurious registrations.
        service.trigger_custom_event(&doc, doc.root(), "click", BTreeMap::new(), false);
        let root = service.root_for(&doc);
        assert!(root.get_tracker_optional(TrackerKind::Custom).is_none());
    }

    #[test]
    fn tick_drives_timers_across_scopes() {
        let (service, clock) = service();
        let doc = Document::new("html");
        doc.set_ready();

        let group = service.create_group(&doc, doc.root());
        let hits = Rc::new(std::cell::Cell::new(0));
        let hits2 = Rc::clone(&hits);
        let config: TriggerConfig = serde_json::from_str(
            r#"{"on": "timer", "timerSpec": {"interval": 1, "maxTimerLength": 2}}"#,
        )
        .unwrap();
        group
            .add_trigger(&config, Rc::new(move |_: &AnalyticsEvent| hits2.set(hits2.get() + 1)))
            .unwrap();
        assert_eq!(hits.get(), 1);

        clock.advance_ms(1000);
        service.tick();
        assert_eq!(hits.get(), 2);

        clock.advance_ms(1000);
        service.tick();
        assert_eq!(hits.get(), 3, "forced stop emits the final event");

        clock.advance_ms(3000);
        service.tick();
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn dispose_scope_cascades_and_forgets_the_root() {
        let (service, _clock) = service();
        let doc = Document::new("html");
        let root = service.root_for(&doc);
        service.dispose_scope(doc.scope_id());
        assert!(root.is_disposed());
        assert_eq!(service.scope_count(), 0);
        assert!(service.root_for_optional(doc.scope_id()).is_none());
    }
}
