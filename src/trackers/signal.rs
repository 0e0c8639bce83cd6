//! Signal-backed trackers: named render signals and initial-content load.
//!
//! Both fire at most once per `add`: the registration resolves its target
//! (scope root or element), waits for the signal, delivers one event and is
//! done. The unlisten cancels a pending delivery.

use std::any::Any;
use std::rc::{Rc, Weak};

use crate::channel::Unlisten;
use crate::config::TriggerConfig;
use crate::dom::NodeId;
use crate::errors::AnalyticsError;
use crate::event::{AnalyticsEvent, EventListener};
use crate::future::{CancelToken, Promise};
use crate::root::{signals, AnalyticsRoot};
use crate::trackers::{effective_context, EventTracker, SignalTarget};

/// Tracks events backed by a named signal (e.g. `render-start`).
pub struct SignalTracker {
    root: Weak<AnalyticsRoot>,
    token: CancelToken,
}

impl SignalTracker {
    pub fn new(root: &Rc<AnalyticsRoot>) -> Self {
        Self { root: Rc::downgrade(root), token: CancelToken::new() }
    }
}

impl EventTracker for SignalTracker {
    fn add(
        &self,
        context: NodeId,
        event_type: &str,
        config: &TriggerConfig,
        listener: EventListener,
    ) -> Result<Unlisten, AnalyticsError> {
        let root = self.root.upgrade().ok_or(AnalyticsError::Disposed)?;
        add_signal_listener(&root, &self.token, context, event_type, config, listener, |root, event_type, target| {
            signal_promise_for(root, event_type, target)
        })
    }

    fn dispose(&self) {
        self.token.cancel();
    }

    fn signal_promise(&self, event_type: &str, target: SignalTarget) -> Option<Promise<()>> {
        let root = self.root.upgrade()?;
        Some(signal_promise_for(&root, event_type, target))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Tracks the "initial content loaded" composite signal: a dedicated
/// ini-load signal raced against the load-end signal.
pub struct IniLoadTracker {
    root: Weak<AnalyticsRoot>,
    token: CancelToken,
}

impl IniLoadTracker {
    pub fn new(root: &Rc<AnalyticsRoot>) -> Self {
        Self { root: Rc::downgrade(root), token: CancelToken::new() }
    }
}

impl EventTracker for IniLoadTracker {
    fn add(
        &self,
        context: NodeId,
        event_type: &str,
        config: &TriggerConfig,
        listener: EventListener,
    ) -> Result<Unlisten, AnalyticsError> {
        let root = self.root.upgrade().ok_or(AnalyticsError::Disposed)?;
        add_signal_listener(&root, &self.token, context, event_type, config, listener, |root, _event_type, target| {
            ini_load_promise_for(root, target)
        })
    }

    fn dispose(&self) {
        self.token.cancel();
    }

    fn signal_promise(&self, _event_type: &str, target: SignalTarget) -> Option<Promise<()>> {
        let root = self.root.upgrade()?;
        Some(ini_load_promise_for(&root, target))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn signal_promise_for(
    root: &Rc<AnalyticsRoot>,
    event_type: &str,
    target: SignalTarget,
) -> Promise<()> {
    let node = match target {
        SignalTarget::Root => root.root_element(),
        SignalTarget::Element(element) => element,
    };
    root.doc().when_signal(node, event_type)
}

fn ini_load_promise_for(root: &Rc<AnalyticsRoot>, target: SignalTarget) -> Promise<()> {
    match target {
        SignalTarget::Root => root.when_ini_loaded(),
        SignalTarget::Element(element) => Promise::race(vec![
            root.doc().when_signal(element, signals::INI_LOAD),
            root.doc().when_signal(element, signals::LOAD_END),
        ]),
    }
}

/// Shared fire-once plumbing: resolve the target, wait for its signal,
/// deliver a single event unless the registration was canceled.
fn add_signal_listener(
    root: &Rc<AnalyticsRoot>,
    tracker_token: &CancelToken,
    context: NodeId,
    event_type: &str,
    config: &TriggerConfig,
    listener: EventListener,
    signal_for: impl Fn(&Rc<AnalyticsRoot>, &str, SignalTarget) -> Promise<()> + 'static,
) -> Result<Unlisten, AnalyticsError> {
    let add_token = CancelToken::new();
    let guard = add_token.clone();
    let tracker_token = tracker_token.clone();
    let selector = config.selector_str().unwrap_or(":root").to_string();
    let event_type = event_type.to_string();

    let deliver = {
        let add_token = add_token.clone();
        let event_type = event_type.clone();
        move |target: NodeId| {
            if add_token.is_canceled() || tracker_token.is_canceled() {
                return;
            }
            listener(&AnalyticsEvent::new(target, &event_type));
        }
    };

    if selector == ":root" || selector == ":host" {
        // Root selectors are delegated to the analytics root.
        let target = root.root_element();
        signal_for(root, &event_type, SignalTarget::Root).then(move |result| {
            if result.is_ok() {
                deliver(target);
            }
        });
    } else {
        let weak = Rc::downgrade(root);
        let method = config.selection_method();
        let lookup = root.get_element(effective_context(root, context), &selector, method);
        let lookup_token = add_token.clone();
        lookup.then_ok(&lookup_token, move |element: &NodeId| {
            let Some(root) = weak.upgrade() else {
                return;
            };
            let element = *element;
            signal_for(&root, &event_type, SignalTarget::Element(element)).then(move |result| {
                if result.is_ok() {
                    deliver(element);
                }
            });
        });
    }

    Ok(Unlisten::new(move || guard.cancel()))
}
