//! Story tracker: custom-event machinery with per-listener repeat
//! suppression and an optional tag-name filter.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::channel::{Channel, Unlisten};
use crate::clock::Clock;
use crate::config::{StorySpec, TriggerConfig};
use crate::dom::NodeId;
use crate::errors::AnalyticsError;
use crate::event::{AnalyticsEvent, EventListener};
use crate::future::CancelToken;
use crate::root::AnalyticsRoot;
use crate::trackers::custom::EventBuffers;
use crate::trackers::EventTracker;

pub struct StoryEventTracker {
    root: Weak<AnalyticsRoot>,
    observables: RefCell<HashMap<String, Channel<AnalyticsEvent>>>,
    buffers: EventBuffers,
    token: CancelToken,
}

impl StoryEventTracker {
    pub fn new(root: &Rc<AnalyticsRoot>) -> Self {
        Self {
            root: Rc::downgrade(root),
            observables: RefCell::new(HashMap::new()),
            buffers: EventBuffers::new(root.clock().now()),
            token: CancelToken::new(),
        }
    }

    /// Producer entry point for story lifecycle events.
    pub fn trigger(&self, event: AnalyticsEvent) {
        let channel = self.observables.borrow().get(&event.event_type).cloned();
        if let Some(channel) = channel {
            channel.fire(&event);
        }
        self.buffers.push(event);
    }

    /// Applies the story filters and delivers when they pass. Returns
    /// whether the event was delivered, so repeat suppression can latch.
    fn fire_filtered(
        root: &AnalyticsRoot,
        spec: &StorySpec,
        delivered: &RefCell<HashSet<String>>,
        event: &AnalyticsEvent,
        listener: &EventListener,
    ) {
        if !spec.repeat && delivered.borrow().contains(&event.event_type) {
            return;
        }
        if let Some(tag_name) = &spec.tag_name {
            if !root.doc().tag_name(event.target).eq_ignore_ascii_case(tag_name) {
                return;
            }
        }
        delivered.borrow_mut().insert(event.event_type.clone());
        listener(event);
    }
}

impl EventTracker for StoryEventTracker {
    fn add(
        &self,
        _context: NodeId,
        event_type: &str,
        config: &TriggerConfig,
        listener: EventListener,
    ) -> Result<Unlisten, AnalyticsError> {
        let root = self.root.upgrade().ok_or(AnalyticsError::Disposed)?;
        let spec = config.story_spec.clone().unwrap_or_default();

        // Story events always target the scope root; replay the buffer
        // through the same filters the live path uses.
        let delivered = Rc::new(RefCell::new(HashSet::new()));
        for event in self.buffers.snapshot(event_type) {
            Self::fire_filtered(&root, &spec, &delivered, &event, &listener);
        }

        let channel = self
            .observables
            .borrow_mut()
            .entry(event_type.to_string())
            .or_insert_with(Channel::new)
            .clone();

        let weak_root = Rc::downgrade(&root);
        let token = self.token.clone();
        Ok(channel.add_fn(move |event: &AnalyticsEvent| {
            if token.is_canceled() {
                return;
            }
            if let Some(root) = weak_root.upgrade() {
                Self::fire_filtered(&root, &spec, &delivered, event, &listener);
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockHandle, ManualClock};
    use crate::dom::Document;
    use crate::root::ScopeOptions;

    fn setup() -> (Rc<AnalyticsRoot>, crate::dom::DocumentHandle) {
        let doc = Document::new("html");
        let clock = Rc::new(ManualClock::new());
        let epoch = clock.now();
        let root = AnalyticsRoot::new_document(
            Rc::clone(&doc),
            clock as ClockHandle,
            epoch,
            ScopeOptions::default(),
        );
        doc.set_ready();
        (root, doc)
    }

    fn collector() -> (EventListener, Rc<RefCell<Vec<AnalyticsEvent>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        (Rc::new(move |event: &AnalyticsEvent| seen2.borrow_mut().push(event.clone())), seen)
    }

    #[test]
    fn repeat_false_suppresses_subsequent_matches() {
        let (root, doc) = setup();
        let tracker = StoryEventTracker::new(&root);
        let config: TriggerConfig = serde_json::from_str(
            r#"{"on": "story-page-visible", "storySpec": {"repeat": false}}"#,
        )
        .unwrap();

        let (listener, seen) = collector();
        tracker.add(doc.root(), "story-page-visible", &config, listener).unwrap();

        tracker.trigger(AnalyticsEvent::new(doc.root(), "story-page-visible"));
        tracker.trigger(AnalyticsEvent::new(doc.root(), "story-page-visible"));
        tracker.trigger(AnalyticsEvent::new(doc.root(), "story-page-visible"));
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn repeat_default_delivers_every_event() {
        let (root, doc) = setup();
        let tracker = StoryEventTracker::new(&root);
        let config: TriggerConfig =
            serde_json::from_str(r#"{"on": "story-page-visible"}"#).unwrap();

        let (listener, seen) = collector();
        tracker.add(doc.root(), "story-page-visible", &config, listener).unwrap();

        tracker.trigger(AnalyticsEvent::new(doc.root(), "story-page-visible"));
        tracker.trigger(AnalyticsEvent::new(doc.root(), "story-page-visible"));
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn tag_name_filter_drops_other_targets() {
        let (root, doc) = setup();
        let page = doc.create_element(doc.root(), "amp-story-page");
        let other = doc.create_element(doc.root(), "div");
        let tracker = StoryEventTracker::new(&root);
        let config: TriggerConfig = serde_json::from_str(
            r#"{"on": "story-page-visible", "storySpec": {"tagName": "amp-story-page"}}"#,
        )
        .unwrap();

        let (listener, seen) = collector();
        tracker.add(doc.root(), "story-page-visible", &config, listener).unwrap();

        tracker.trigger(AnalyticsEvent::new(other, "story-page-visible"));
        tracker.trigger(AnalyticsEvent::new(page, "story-page-visible"));
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].target, page);
    }

    #[test]
    fn buffered_story_events_replay_through_the_same_filters() {
        let (root, doc) = setup();
        let tracker = StoryEventTracker::new(&root);

        tracker.trigger(AnalyticsEvent::new(doc.root(), "story-page-visible"));
        tracker.trigger(AnalyticsEvent::new(doc.root(), "story-page-visible"));

        let config: TriggerConfig = serde_json::from_str(
            r#"{"on": "story-page-visible", "storySpec": {"repeat": false}}"#,
        )
        .unwrap();
        let (listener, seen) = collector();
        tracker.add(doc.root(), "story-page-visible", &config, listener).unwrap();
        assert_eq!(seen.borrow().len(), 1, "repeat:false applies to the replay too");
    }
}
