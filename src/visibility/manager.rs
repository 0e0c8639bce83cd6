//! Per-scope visibility root.
//!
//! One [`VisibilityManager`] per scope owns every [`VisibilityModel`]
//! registered in it, feeds them effective ratios (samples gated by the
//! document's background state and, for embedded scopes, multiplied by the
//! parent root's visibility), and carries the page-level extras merged into
//! each fired state: max scroll depth and background flags.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::channel::Unlisten;
use crate::clock::{Clock, ClockHandle};
use crate::dom::{DocumentHandle, NodeId};
use crate::future::Promise;
use crate::visibility::model::{VisibilityModel, VisibilityModelSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelTarget {
    Root,
    Element(NodeId),
}

struct ModelEntry {
    id: u64,
    target: ModelTarget,
    model: Rc<VisibilityModel>,
}

pub type StateListener = Rc<dyn Fn(BTreeMap<String, String>)>;

pub struct VisibilityManager {
    doc: DocumentHandle,
    clock: ClockHandle,
    epoch: Instant,
    parent: Option<Rc<VisibilityManager>>,
    children: RefCell<Vec<Weak<VisibilityManager>>>,
    models: RefCell<Vec<ModelEntry>>,
    next_id: Cell<u64>,
    /// Sampled visibility of the scope root itself, 0-1.
    root_ratio: Cell<f64>,
    element_ratios: RefCell<HashMap<NodeId, f64>>,
    backgrounded: Cell<bool>,
    backgrounded_at_start: bool,
    /// Latches once the document has been backgrounded at any point.
    ever_backgrounded: Cell<bool>,
    max_scroll_depth: Cell<f64>,
    doc_sub: RefCell<Option<Unlisten>>,
    disposed: Cell<bool>,
}

impl VisibilityManager {
    pub fn new(
        doc: DocumentHandle,
        clock: ClockHandle,
        epoch: Instant,
        parent: Option<Rc<VisibilityManager>>,
    ) -> Rc<Self> {
        let backgrounded = !doc.is_visible();
        let manager = Rc::new(Self {
            doc: Rc::clone(&doc),
            clock,
            epoch,
            parent: parent.clone(),
            children: RefCell::new(Vec::new()),
            models: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
            root_ratio: Cell::new(1.0),
            element_ratios: RefCell::new(HashMap::new()),
            backgrounded: Cell::new(backgrounded),
            backgrounded_at_start: backgrounded,
            ever_backgrounded: Cell::new(backgrounded),
            max_scroll_depth: Cell::new(0.0),
            doc_sub: RefCell::new(None),
            disposed: Cell::new(false),
        });

        let weak = Rc::downgrade(&manager);
        let sub = doc.on_visibility_change(Rc::new(move |visible: &bool| {
            if let Some(manager) = weak.upgrade() {
                manager.set_backgrounded(!visible);
            }
        }));
        *manager.doc_sub.borrow_mut() = Some(sub);

        if let Some(parent) = parent {
            parent.children.borrow_mut().push(Rc::downgrade(&manager));
        }
        manager
    }

    // ****************************************
    // ** Registration

    pub fn listen_root(
        self: &Rc<Self>,
        spec: VisibilityModelSpec,
        ready: Option<Promise<()>>,
        report_ready: Option<Promise<()>>,
        listener: StateListener,
    ) -> Unlisten {
        self.listen(ModelTarget::Root, spec, ready, report_ready, listener)
    }

    pub fn listen_element(
        self: &Rc<Self>,
        element: NodeId,
        spec: VisibilityModelSpec,
        ready: Option<Promise<()>>,
        report_ready: Option<Promise<()>>,
        listener: StateListener,
    ) -> Unlisten {
        self.listen(ModelTarget::Element(element), spec, ready, report_ready, listener)
    }

    fn listen(
        self: &Rc<Self>,
        target: ModelTarget,
        spec: VisibilityModelSpec,
        ready: Option<Promise<()>>,
        report_ready: Option<Promise<()>>,
        listener: StateListener,
    ) -> Unlisten {
        let now = self.clock.now();
        let weak_for_state = Rc::downgrade(self);
        let model = Rc::new(VisibilityModel::new(
            spec,
            self.epoch,
            now,
            Box::new(move |mut vars| {
                if let Some(manager) = weak_for_state.upgrade() {
                    manager.merge_page_state(&mut vars);
                }
                listener(vars);
            }),
        ));

        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.models.borrow_mut().push(ModelEntry { id, target, model: Rc::clone(&model) });

        match ready {
            None => model.set_ready(true, now),
            Some(promise) => {
                let weak_model = Rc::downgrade(&model);
                let weak_manager = Rc::downgrade(self);
                promise.then(move |result| {
                    if result.is_err() {
                        return;
                    }
                    if let (Some(model), Some(manager)) =
                        (weak_model.upgrade(), weak_manager.upgrade())
                    {
                        model.set_ready(true, manager.clock.now());
                    }
                });
            }
        }
        if let Some(promise) = report_ready {
            let weak_model = Rc::downgrade(&model);
            let weak_manager = Rc::downgrade(self);
            promise.then(move |result| {
                if result.is_err() {
                    return;
                }
                if let (Some(model), Some(manager)) = (weak_model.upgrade(), weak_manager.upgrade())
                {
                    model.on_report_ready(manager.clock.now());
                }
            });
        }

        // Seed the model with the current effective ratio.
        model.update_ratio(self.effective_ratio(target), now);

        let weak = Rc::downgrade(self);
        Unlisten::new(move || {
            if let Some(manager) = weak.upgrade() {
                let mut models = manager.models.borrow_mut();
                if let Some(pos) = models.iter().position(|e| e.id == id) {
                    models[pos].model.dispose();
                    models.remove(pos);
                }
            }
        })
    }

    // ****************************************
    // ** Inputs

    /// Visibility sample for the scope root, 0-1.
    pub fn set_root_ratio(self: &Rc<Self>, ratio: f64) {
        self.root_ratio.set(ratio.clamp(0.0, 1.0));
        self.refresh();
    }

    /// Intersection-ratio sample for one element.
    pub fn set_element_ratio(self: &Rc<Self>, element: NodeId, ratio: f64) {
        self.element_ratios.borrow_mut().insert(element, ratio.clamp(0.0, 1.0));
        self.refresh_target(ModelTarget::Element(element));
    }

    fn set_backgrounded(self: &Rc<Self>, backgrounded: bool) {
        if backgrounded {
            self.ever_backgrounded.set(true);
        }
        if self.backgrounded.get() != backgrounded {
            self.backgrounded.set(backgrounded);
            self.refresh();
        }
    }

    /// Monotonic page scroll depth in px, merged into fired states.
    pub fn update_scroll_depth(&self, depth: f64) {
        if depth > self.max_scroll_depth.get() {
            self.max_scroll_depth.set(depth);
        }
    }

    pub fn max_scroll_depth(&self) -> f64 {
        self.max_scroll_depth.get()
    }

    pub fn is_backgrounded(&self) -> bool {
        self.backgrounded.get()
    }

    /// Advances time-based thresholds; called from the scope's tick.
    pub fn tick(self: &Rc<Self>, now: Instant) {
        let models: Vec<Rc<VisibilityModel>> = self
            .models
            .borrow()
            .iter()
            .filter(|e| e.model.needs_ticks())
            .map(|e| Rc::clone(&e.model))
            .collect();
        for model in models {
            model.tick(now);
        }
    }

    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let entries = std::mem::take(&mut *self.models.borrow_mut());
        for entry in &entries {
            entry.model.dispose();
        }
        if let Some(sub) = self.doc_sub.borrow_mut().take() {
            sub.unlisten();
        }
        log::debug!("visibility manager disposed for scope {}", self.doc.scope_id());
    }

    pub fn model_count(&self) -> usize {
        self.models.borrow().len()
    }

    // ****************************************
    // ** Effective visibility

    /// Visibility of this scope's root: own sample, parent cascade,
    /// zeroed while the document is backgrounded.
    pub fn root_visibility(&self) -> f64 {
        if self.backgrounded.get() {
            return 0.0;
        }
        let parent_factor = self.parent.as_ref().map_or(1.0, |p| p.root_visibility());
        self.root_ratio.get() * parent_factor
    }

    fn effective_ratio(&self, target: ModelTarget) -> f64 {
        match target {
            ModelTarget::Root => self.root_visibility(),
            ModelTarget::Element(element) => {
                if self.backgrounded.get() {
                    0.0
                }
                else {
                    let sample =
                        self.element_ratios.borrow().get(&element).copied().unwrap_or(0.0);
                    let parent_factor =
                        self.parent.as_ref().map_or(1.0, |p| p.root_visibility());
                    sample * parent_factor
                }
            }
        }
    }

    fn refresh(self: &Rc<Self>) {
        let now = self.clock.now();
        let snapshot: Vec<(ModelTarget, Rc<VisibilityModel>)> = self
            .models
            .borrow()
            .iter()
            .map(|e| (e.target, Rc::clone(&e.model)))
            .collect();
        for (target, model) in snapshot {
            model.update_ratio(self.effective_ratio(target), now);
        }
        // Root visibility feeds into every child scope.
        let children = self.children.borrow().clone();
        for child in children {
            if let Some(child) = child.upgrade() {
                child.refresh();
            }
        }
    }

    fn refresh_target(self: &Rc<Self>, target: ModelTarget) {
        let now = self.clock.now();
        let snapshot: Vec<Rc<VisibilityModel>> = self
            .models
            .borrow()
            .iter()
            .filter(|e| e.target == target)
            .map(|e| Rc::clone(&e.model))
            .collect();
        for model in snapshot {
            model.update_ratio(self.effective_ratio(target), now);
        }
    }

    fn merge_page_state(&self, vars: &mut BTreeMap<String, String>) {
        vars.insert(
            "maxScrollDepth".to_string(),
            (self.max_scroll_depth.get().round() as i64).to_string(),
        );
        vars.insert(
            "backgrounded".to_string(),
            if self.ever_backgrounded.get() { "1" } else { "0" }.to_string(),
        );
        vars.insert(
            "backgroundedAtStart".to_string(),
            if self.backgrounded_at_start { "1" } else { "0" }.to_string(),
        );
    }
}
