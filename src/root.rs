//! Analytics scope boundary.
//!
//! An [`AnalyticsRoot`] isolates one document (top-level or embedded
//! sub-document): selectors, containment, visibility and scroll are all
//! computed against it. The root owns the name→tracker map (create-or-reuse
//! semantics), the lazy per-scope [`ScrollManager`] and
//! [`VisibilityManager`] singletons, and the element-lookup rules every
//! tracker funnels through. Disposal cascades to everything the root owns
//! and is idempotent.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::clock::ClockHandle;
use crate::config::SelectionMethod;
use crate::dom::{DocumentHandle, DomEvent, NodeId, Selector};
use crate::errors::AnalyticsError;
use crate::event::{ScopeKind, TrackerAllowance, TrackerKind};
use crate::future::{CancelToken, Deferred, Promise};
use crate::scroll::{ScrollManager, ViewportGeometry};
use crate::trackers::{create_tracker, EventTracker};
use crate::visibility::VisibilityManager;

/// Well-known signal names observed on scope roots and elements.
pub mod signals {
    pub const RENDER_START: &str = "render-start";
    pub const INI_LOAD: &str = "ini-load";
    pub const LOAD_END: &str = "load-end";
}

/// Per-scope policy knobs, set by the instrumentation service.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeOptions {
    /// Browser-event triggers (blur/change/focus/input) are opt-in.
    pub allow_browser_events: bool,
}

pub struct AnalyticsRoot {
    kind: ScopeKind,
    doc: DocumentHandle,
    /// Host element in the parent scope, for embedded scopes.
    host: Option<NodeId>,
    parent: Option<Weak<AnalyticsRoot>>,
    clock: ClockHandle,
    epoch: Instant,
    options: ScopeOptions,
    trackers: RefCell<HashMap<&'static str, Rc<dyn EventTracker>>>,
    visibility: RefCell<Option<Rc<VisibilityManager>>>,
    scroll: RefCell<Option<Rc<ScrollManager>>>,
    cancel: CancelToken,
    warned_undeclared: Cell<bool>,
    disposed: Cell<bool>,
}

impl AnalyticsRoot {
    pub fn new_document(
        doc: DocumentHandle,
        clock: ClockHandle,
        epoch: Instant,
        options: ScopeOptions,
    ) -> Rc<Self> {
        Rc::new(Self {
            kind: ScopeKind::Document,
            doc,
            host: None,
            parent: None,
            clock,
            epoch,
            options,
            trackers: RefCell::new(HashMap::new()),
            visibility: RefCell::new(None),
            scroll: RefCell::new(None),
            cancel: CancelToken::new(),
            warned_undeclared: Cell::new(false),
            disposed: Cell::new(false),
        })
    }

    pub fn new_embed(
        doc: DocumentHandle,
        host: NodeId,
        parent: &Rc<AnalyticsRoot>,
        options: ScopeOptions,
    ) -> Rc<Self> {
        Rc::new(Self {
            kind: ScopeKind::Embed,
            doc,
            host: Some(host),
            parent: Some(Rc::downgrade(parent)),
            clock: Rc::clone(&parent.clock),
            epoch: parent.epoch,
            options,
            trackers: RefCell::new(HashMap::new()),
            visibility: RefCell::new(None),
            scroll: RefCell::new(None),
            cancel: CancelToken::new(),
            warned_undeclared: Cell::new(false),
            disposed: Cell::new(false),
        })
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn doc(&self) -> &DocumentHandle {
        &self.doc
    }

    pub fn root_element(&self) -> NodeId {
        self.doc.root()
    }

    pub fn host_element(&self) -> Option<NodeId> {
        self.host
    }

    pub fn clock(&self) -> &ClockHandle {
        &self.clock
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    pub fn options(&self) -> ScopeOptions {
        self.options
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    /// True when `node` lives inside this scope.
    pub fn contains(&self, node: NodeId) -> bool {
        self.doc.contains(self.doc.root(), node)
    }

    // ****************************************
    // ** Tracker map

    /// Create-or-reuse: one live tracker per key name per root.
    pub fn get_tracker(self: &Rc<Self>, kind: TrackerKind) -> Rc<dyn EventTracker> {
        let key = kind.key_name();
        if let Some(existing) = self.trackers.borrow().get(key) {
            return Rc::clone(existing);
        }
        let tracker = create_tracker(kind, self);
        self.trackers.borrow_mut().insert(key, Rc::clone(&tracker));
        tracker
    }

    pub fn get_tracker_optional(&self, kind: TrackerKind) -> Option<Rc<dyn EventTracker>> {
        self.trackers.borrow().get(kind.key_name()).cloned()
    }

    /// Resolves a tracker only when `kind` is permitted in `context`
    /// (timer sub-triggers, visibility `waitFor`).
    pub fn get_tracker_for_allowlist(
        self: &Rc<Self>,
        kind: TrackerKind,
        context: TrackerAllowance,
    ) -> Result<Rc<dyn EventTracker>, AnalyticsError> {
        if !kind.allowed_in(context) {
            return Err(AnalyticsError::TrackerNotAvailable(kind.key_name().to_string()));
        }
        Ok(self.get_tracker(kind))
    }

    // ****************************************
    // ** Element lookup

    /// Resolves `selector` to a single element inside this scope.
    ///
    /// `:root` and `:host` resolve without waiting; everything else defers
    /// until the document is parse-ready and then verifies the match is
    /// contained in this scope.
    pub fn get_element(
        &self,
        context: NodeId,
        selector: &str,
        method: SelectionMethod,
    ) -> Promise<NodeId> {
        match selector.trim() {
            ":root" => return Promise::resolved(self.root_element()),
            ":host" => {
                return match self.host {
                    Some(host) => Promise::resolved(host),
                    None => Promise::rejected(AnalyticsError::NoHostElement),
                };
            }
            _ => {}
        }

        let deferred = Deferred::new();
        let promise = deferred.promise();
        let doc = Rc::clone(&self.doc);
        let root = self.root_element();
        let selector = selector.to_string();
        self.doc.when_ready().then(move |result| {
            if result.is_err() {
                deferred.reject(AnalyticsError::Disposed);
                return;
            }
            let parsed = match Selector::parse(&selector) {
                Ok(parsed) => parsed,
                Err(err) => {
                    deferred.reject(err);
                    return;
                }
            };
            let found = match method {
                SelectionMethod::Scope => doc.query_selector(context, &parsed),
                SelectionMethod::Closest => doc.closest(context, &parsed),
                SelectionMethod::Auto => doc.query_selector(root, &parsed),
            };
            match found {
                Some(node) if doc.contains(root, node) => deferred.resolve(node),
                Some(_) => deferred.reject(AnalyticsError::OutsideScope(selector.clone())),
                None => deferred.reject(AnalyticsError::SelectorNotFound(selector.clone())),
            }
        });
        promise
    }

    /// Resolves an array of selectors. Duplicates are a synchronous error;
    /// elements without declared variables are filtered (with a one-time
    /// warning) unless `require_declared_vars` is false.
    pub fn get_elements(
        self: &Rc<Self>,
        context: NodeId,
        selectors: &[String],
        method: SelectionMethod,
        require_declared_vars: bool,
    ) -> Result<Promise<Vec<NodeId>>, AnalyticsError> {
        assert_unique_selectors(selectors)?;
        let lookups: Vec<Promise<NodeId>> =
            selectors.iter().map(|s| self.get_element(context, s, method)).collect();

        let deferred = Deferred::new();
        let promise = deferred.promise();
        let weak = Rc::downgrade(self);
        Promise::all(lookups).then(move |result| match result {
            Ok(nodes) => {
                let Some(root) = weak.upgrade() else {
                    deferred.reject(AnalyticsError::Disposed);
                    return;
                };
                if !require_declared_vars {
                    deferred.resolve(nodes.clone());
                    return;
                }
                let kept: Vec<NodeId> =
                    nodes.iter().copied().filter(|n| root.doc.has_data_vars(*n)).collect();
                let omitted = nodes.len() - kept.len();
                if omitted > 0 && !root.warned_undeclared.replace(true) {
                    log::warn!(
                        "{omitted} element(s) omitted from selector set: no declared variables"
                    );
                }
                deferred.resolve(kept);
            }
            Err(err) => deferred.reject(err.clone()),
        });
        Ok(promise)
    }

    /// Builds a raw-event listener that walks up from the event target to
    /// the scope root and invokes `listener` with the first element
    /// matching `selector` under the given selection method. Matching
    /// never crosses the scope boundary.
    pub fn create_selective_listener(
        &self,
        listener: Rc<dyn Fn(NodeId, &DomEvent)>,
        context: NodeId,
        selector: &str,
        method: SelectionMethod,
    ) -> Rc<dyn Fn(&DomEvent)> {
        let parsed = match Selector::parse(selector) {
            Ok(parsed) => parsed,
            Err(err) => {
                // Degrade to a no-op listener; registration stays valid.
                log::debug!("selective listener disabled: {err}");
                return Rc::new(|_| {});
            }
        };
        let doc = Rc::clone(&self.doc);
        let root = self.root_element();
        let host = self.host;
        Rc::new(move |event: &DomEvent| {
            let mut current = Some(event.target);
            while let Some(candidate) = current {
                let matched = match &parsed {
                    Selector::Host => Some(candidate) == host,
                    other => doc.matches(candidate, other),
                };
                if matched {
                    let accepted = match method {
                        SelectionMethod::Auto => true,
                        SelectionMethod::Scope => doc.contains(context, candidate),
                        SelectionMethod::Closest => doc.contains(candidate, context),
                    };
                    if accepted {
                        listener(candidate, event);
                        return;
                    }
                }
                if candidate == root {
                    break;
                }
                current = doc.parent_of(candidate);
            }
        })
    }

    /// Resolves once the initial content of this scope has loaded: the
    /// dedicated ini-load signal raced against the load-end signal.
    pub fn when_ini_loaded(&self) -> Promise<()> {
        let root = self.root_element();
        Promise::race(vec![
            self.doc.when_signal(root, signals::INI_LOAD),
            self.doc.when_signal(root, signals::LOAD_END),
        ])
    }

    // ****************************************
    // ** Per-scope managers

    pub fn visibility_manager(self: &Rc<Self>) -> Rc<VisibilityManager> {
        if let Some(existing) = self.visibility.borrow().as_ref() {
            return Rc::clone(existing);
        }
        let parent = self
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|parent| parent.visibility_manager());
        let manager = VisibilityManager::new(
            Rc::clone(&self.doc),
            Rc::clone(&self.clock),
            self.epoch,
            parent,
        );
        *self.visibility.borrow_mut() = Some(Rc::clone(&manager));
        manager
    }

    pub fn scroll_manager(&self) -> Rc<ScrollManager> {
        if let Some(existing) = self.scroll.borrow().as_ref() {
            return Rc::clone(existing);
        }
        let manager = Rc::new(ScrollManager::new());
        *self.scroll.borrow_mut() = Some(Rc::clone(&manager));
        manager
    }

    /// Feeds a raw scroll/viewport sample into the scope: the scroll
    /// manager rebroadcasts it and the visibility manager (when present)
    /// tracks max scroll depth.
    pub fn update_scroll(&self, geometry: ViewportGeometry) {
        self.scroll_manager().update(geometry);
        if let Some(manager) = self.visibility.borrow().as_ref() {
            manager.update_scroll_depth(geometry.top + geometry.height);
        }
    }

    // ****************************************
    // ** Lifecycle

    /// Advances every time-driven tracker and the visibility manager.
    pub fn tick(&self, now: Instant) {
        let trackers: Vec<Rc<dyn EventTracker>> =
            self.trackers.borrow().values().cloned().collect();
        for tracker in trackers {
            tracker.tick(now);
        }
        if let Some(manager) = self.visibility.borrow().as_ref() {
            manager.tick(now);
        }
    }

    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        self.cancel.cancel();
        let trackers = std::mem::take(&mut *self.trackers.borrow_mut());
        for tracker in trackers.values() {
            tracker.dispose();
        }
        if let Some(manager) = self.visibility.borrow_mut().take() {
            manager.dispose();
        }
        if let Some(manager) = self.scroll.borrow_mut().take() {
            manager.dispose();
        }
        log::debug!("analytics root disposed for scope {}", self.doc.scope_id());
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.borrow().len()
    }
}

/// Rejects duplicate entries in a selector array before any registration
/// work happens.
pub fn assert_unique_selectors(selectors: &[String]) -> Result<(), AnalyticsError> {
    let mut seen = std::collections::HashSet::new();
    for selector in selectors {
        if !seen.insert(selector.as_str()) {
            return Err(AnalyticsError::DuplicateSelector(selector.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::dom::Document;
    use std::cell::RefCell;

    fn new_root() -> (Rc<AnalyticsRoot>, DocumentHandle) {
        let doc = Document::new("html");
        let clock = Rc::new(ManualClock::new());
        let epoch = clock.now();
        let root = AnalyticsRoot::new_document(
            Rc::clone(&doc),
            clock as ClockHandle,
            epoch,
            ScopeOptions::default(),
        );
        (root, doc)
    }

    #[test]
    fn root_and_host_selectors_resolve_without_waiting() {
        let (root, doc) = new_root();
        let got = Rc::new(RefCell::new(None));
        let got2 = Rc::clone(&got);
        root.get_element(doc.root(), ":root", SelectionMethod::Auto)
            .then(move |r| *got2.borrow_mut() = Some(r.clone()));
        assert_eq!(got.borrow().as_ref().unwrap().as_ref().unwrap(), &doc.root());

        let failed = Rc::new(RefCell::new(false));
        let failed2 = Rc::clone(&failed);
        root.get_element(doc.root(), ":host", SelectionMethod::Auto)
            .then(move |r| *failed2.borrow_mut() = r.is_err());
        assert!(*failed.borrow(), "top-level scope has no host");
    }

    #[test]
    fn selector_lookup_waits_for_document_ready() {
        let (root, doc) = new_root();
        let button = doc.create_element_with(doc.root(), "button", &[("id", "cta")]);

        let got = Rc::new(RefCell::new(None));
        let got2 = Rc::clone(&got);
        root.get_element(doc.root(), "#cta", SelectionMethod::Auto)
            .then(move |r| *got2.borrow_mut() = Some(r.clone()));
        assert!(got.borrow().is_none());

        doc.set_ready();
        assert_eq!(got.borrow().as_ref().unwrap().as_ref().unwrap(), &button);
    }

    #[test]
    fn lookup_rejects_missing_and_invalid_selectors() {
        let (root, doc) = new_root();
        doc.set_ready();

        let missing = Rc::new(RefCell::new(None));
        let missing2 = Rc::clone(&missing);
        root.get_element(doc.root(), "#nope", SelectionMethod::Auto)
            .then(move |r| *missing2.borrow_mut() = Some(r.is_err()));
        assert_eq!(*missing.borrow(), Some(true));

        let invalid = Rc::new(RefCell::new(None));
        let invalid2 = Rc::clone(&invalid);
        root.get_element(doc.root(), "div > span", SelectionMethod::Auto)
            .then(move |r| *invalid2.borrow_mut() = Some(r.is_err()));
        assert_eq!(*invalid.borrow(), Some(true));
    }

    #[test]
    fn duplicate_selectors_fail_synchronously() {
        let (root, doc) = new_root();
        let selectors = vec!["#a".to_string(), "#a".to_string()];
        let result = root.get_elements(doc.root(), &selectors, SelectionMethod::Auto, true);
        assert!(matches!(result, Err(AnalyticsError::DuplicateSelector(_))));
    }

    #[test]
    fn get_elements_filters_undeclared_vars_unless_opted_out() {
        let (root, doc) = new_root();
        doc.create_element_with(doc.root(), "div", &[("id", "a"), ("data-vars-x", "1")]);
        doc.create_element_with(doc.root(), "div", &[("id", "b")]);
        doc.set_ready();

        let kept = Rc::new(RefCell::new(Vec::new()));
        let kept2 = Rc::clone(&kept);
        let selectors = vec!["#a".to_string(), "#b".to_string()];
        root.get_elements(doc.root(), &selectors, SelectionMethod::Auto, true)
            .unwrap()
            .then(move |r| *kept2.borrow_mut() = r.as_ref().unwrap().clone());
        assert_eq!(kept.borrow().len(), 1);

        let all = Rc::new(RefCell::new(Vec::new()));
        let all2 = Rc::clone(&all);
        root.get_elements(doc.root(), &selectors, SelectionMethod::Auto, false)
            .unwrap()
            .then(move |r| *all2.borrow_mut() = r.as_ref().unwrap().clone());
        assert_eq!(all.borrow().len(), 2);
    }

    #[test]
    fn selective_listener_walks_up_and_respects_methods() {
        let (root, doc) = new_root();
        let section = doc.create_element_with(doc.root(), "section", &[("class", "wrap")]);
        let button = doc.create_element_with(section, "button", &[("id", "cta")]);
        let outside = doc.create_element(doc.root(), "aside");

        let hits = Rc::new(RefCell::new(Vec::new()));
        let hits2 = Rc::clone(&hits);
        let listener = root.create_selective_listener(
            Rc::new(move |node, _ev: &DomEvent| hits2.borrow_mut().push(node)),
            doc.root(),
            ".wrap",
            SelectionMethod::Auto,
        );

        // Event on the button walks up to the matching section.
        listener(&DomEvent::new(button, "click"));
        assert_eq!(*hits.borrow(), vec![section]);

        // Event elsewhere matches nothing.
        listener(&DomEvent::new(outside, "click"));
        assert_eq!(hits.borrow().len(), 1);

        // scope method: context must contain the match.
        let hits3 = Rc::new(RefCell::new(Vec::new()));
        let hits4 = Rc::clone(&hits3);
        let scoped = root.create_selective_listener(
            Rc::new(move |node, _ev: &DomEvent| hits4.borrow_mut().push(node)),
            outside,
            ".wrap",
            SelectionMethod::Scope,
        );
        scoped(&DomEvent::new(button, "click"));
        assert!(hits3.borrow().is_empty());
    }

    #[test]
    fn embed_lookup_rejects_elements_outside_its_scope() {
        let parent_doc = Document::new("html");
        let clock = Rc::new(ManualClock::new());
        let epoch = clock.now();
        let parent = AnalyticsRoot::new_document(
            Rc::clone(&parent_doc),
            Rc::clone(&clock) as ClockHandle,
            epoch,
            ScopeOptions::default(),
        );
        let frame = parent_doc.create_element(parent_doc.root(), "iframe");
        let child_doc = Document::new_embedded(&parent_doc, frame, "html");
        let child =
            AnalyticsRoot::new_embed(Rc::clone(&child_doc), frame, &parent, ScopeOptions::default());

        // The child scope resolves only nodes of its own document tree.
        let inner = child_doc.create_element_with(child_doc.root(), "div", &[("id", "in")]);
        child_doc.set_ready();

        let got = Rc::new(RefCell::new(None));
        let got2 = Rc::clone(&got);
        child
            .get_element(child_doc.root(), "#in", SelectionMethod::Auto)
            .then(move |r| *got2.borrow_mut() = Some(r.clone()));
        assert_eq!(got.borrow().as_ref().unwrap().as_ref().unwrap(), &inner);

        // :host resolves to the frame element without waiting.
        let host = Rc::new(RefCell::new(None));
        let host2 = Rc::clone(&host);
        child
            .get_element(child_doc.root(), ":host", SelectionMethod::Auto)
            .then(move |r| *host2.borrow_mut() = Some(r.clone()));
        assert_eq!(host.borrow().as_ref().unwrap().as_ref().unwrap(), &frame);
    }

    #[test]
    fn when_ini_loaded_races_ini_load_and_load_end() {
        let (root, doc) = new_root();
        let loaded = Rc::new(Cell::new(false));
        let loaded2 = Rc::clone(&loaded);
        root.when_ini_loaded().then(move |_| loaded2.set(true));
        assert!(!loaded.get());
        doc.fire_signal(doc.root(), signals::LOAD_END);
        assert!(loaded.get());
    }

    #[test]
    fn dispose_is_idempotent_and_clears_managers() {
        let (root, _doc) = new_root();
        let _ = root.scroll_manager();
        let _ = root.visibility_manager();
        root.dispose();
        root.dispose();
        assert!(root.is_disposed());
        assert!(root.cancel_token().is_canceled());
        assert_eq!(root.tracker_count(), 0);
    }
}
