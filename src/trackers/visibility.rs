//! Visibility tracker: expands a visibility spec into per-target
//! [`VisibilityModel`]s registered with the scope's manager, with ready and
//! report-ready gating.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::channel::Unlisten;
use crate::config::{SelectionMethod, TriggerConfig, VisibilitySpec};
use crate::dom::{DocumentHandle, DomEvent, NodeId};
use crate::errors::AnalyticsError;
use crate::event::{AnalyticsEvent, EventListener, TrackerAllowance, TrackerKind};
use crate::future::{CancelToken, Deferred, Promise};
use crate::root::AnalyticsRoot;
use crate::trackers::{effective_context, EventTracker, SignalTarget};
use crate::visibility::{ReportWhen, VisibilityModelSpec};

pub struct VisibilityTracker {
    root: Weak<AnalyticsRoot>,
    token: CancelToken,
}

impl VisibilityTracker {
    pub fn new(root: &Rc<AnalyticsRoot>) -> Self {
        Self { root: Rc::downgrade(root), token: CancelToken::new() }
    }

    /// Expands the percentage configuration into one model spec per range.
    fn expand_model_specs(
        spec: &VisibilitySpec,
        report_when: Option<ReportWhen>,
    ) -> Result<Vec<VisibilityModelSpec>, AnalyticsError> {
        let ranges: Vec<(f64, f64)> = match &spec.visible_percentage_thresholds {
            Some(thresholds) => {
                let mut ranges = Vec::with_capacity(thresholds.len());
                for threshold in thresholds {
                    let [min, max] = threshold.as_slice() else {
                        return Err(AnalyticsError::BadVisibilitySpec(
                            "visiblePercentageThresholds entries must be [min, max] pairs"
                                .to_string(),
                        ));
                    };
                    ranges.push((*min, *max));
                }
                ranges
            }
            None => vec![(
                spec.visible_percentage_min.unwrap_or(0.0),
                spec.visible_percentage_max.unwrap_or(100.0),
            )],
        };

        let ms = |value: Option<u64>| value.map(Duration::from_millis);
        ranges
            .into_iter()
            .map(|(min, max)| {
                VisibilityModelSpec::validate_range(min, max)?;
                Ok(VisibilityModelSpec {
                    min_percentage: min,
                    max_percentage: max,
                    total_time_min: ms(spec.total_time_min).unwrap_or(Duration::ZERO),
                    total_time_max: ms(spec.total_time_max),
                    continuous_time_min: ms(spec.continuous_time_min).unwrap_or(Duration::ZERO),
                    continuous_time_max: ms(spec.continuous_time_max),
                    repeat: spec.repeat,
                    report_when,
                })
            })
            .collect()
    }

    /// Resolves the `waitFor` gate. Defaults to ini-load whenever a
    /// selector is present, to nothing otherwise.
    fn ready_promise(
        root: &Rc<AnalyticsRoot>,
        spec: &VisibilitySpec,
        has_selector: bool,
        target: SignalTarget,
    ) -> Result<Option<Promise<()>>, AnalyticsError> {
        let wait_for = match spec.wait_for.as_deref() {
            Some(wait_for) => wait_for,
            None if has_selector => "ini-load",
            None => "none",
        };
        if wait_for == "none" {
            return Ok(None);
        }
        let kind = match wait_for {
            "render-start" => TrackerKind::RenderStart,
            "ini-load" => TrackerKind::IniLoad,
            other => {
                return Err(AnalyticsError::BadVisibilitySpec(format!(
                    "waitFor value {other} not supported"
                )));
            }
        };
        let tracker = root.get_tracker_for_allowlist(kind, TrackerAllowance::VISIBLE)?;
        Ok(tracker.signal_promise(wait_for, target))
    }

    /// Terminal gate for `reportWhen` models.
    fn report_ready_promise(doc: &DocumentHandle, report_when: ReportWhen) -> Promise<()> {
        match report_when {
            ReportWhen::DocumentHidden => {
                if !doc.is_visible() {
                    return Promise::resolved(());
                }
                let deferred: Rc<Deferred<()>> = Rc::new(Deferred::new());
                let promise = deferred.promise();
                let sub: Rc<RefCell<Option<Unlisten>>> = Rc::new(RefCell::new(None));
                let sub2 = Rc::clone(&sub);
                let handle = doc.on_visibility_change(Rc::new(move |visible: &bool| {
                    if !visible {
                        deferred.resolve(());
                        if let Some(sub) = sub2.borrow_mut().take() {
                            sub.unlisten();
                        }
                    }
                }));
                *sub.borrow_mut() = Some(handle);
                promise
            }
            ReportWhen::DocumentExit => {
                // pagehide keeps the document eligible for the
                // back/forward cache; unload is the fallback only when
                // pagehide support is absent.
                let event_name = if doc.supports_pagehide() { "pagehide" } else { "unload" };
                let deferred: Rc<Deferred<()>> = Rc::new(Deferred::new());
                let promise = deferred.promise();
                let sub: Rc<RefCell<Option<Unlisten>>> = Rc::new(RefCell::new(None));
                let sub2 = Rc::clone(&sub);
                let handle = doc.add_event_listener(
                    event_name,
                    Rc::new(move |_event: &DomEvent| {
                        deferred.resolve(());
                        if let Some(sub) = sub2.borrow_mut().take() {
                            sub.unlisten();
                        }
                    }),
                );
                *sub.borrow_mut() = Some(handle);
                promise
            }
        }
    }

    /// Wraps the trigger listener: declared variables on the target are
    /// merged over the model's accumulated state.
    fn state_listener(
        doc: &DocumentHandle,
        target: NodeId,
        event_type: &str,
        listener: &EventListener,
    ) -> crate::visibility::StateListener {
        let doc = Rc::clone(doc);
        let event_type = event_type.to_string();
        let listener = Rc::clone(listener);
        Rc::new(move |mut vars| {
            for (key, value) in doc.data_vars(target) {
                vars.insert(key, value);
            }
            listener(&AnalyticsEvent::with_vars(target, &event_type, vars));
        })
    }
}

impl EventTracker for VisibilityTracker {
    fn add(
        &self,
        context: NodeId,
        event_type: &str,
        config: &TriggerConfig,
        listener: EventListener,
    ) -> Result<Unlisten, AnalyticsError> {
        let root = self.root.upgrade().ok_or(AnalyticsError::Disposed)?;
        let spec = config.visibility_spec.clone().unwrap_or_default();

        let mut report_when =
            spec.report_when.as_deref().map(ReportWhen::parse).transpose()?;
        if report_when.is_some() && spec.repeat {
            return Err(AnalyticsError::BadVisibilitySpec(
                "reportWhen and repeat are mutually exclusive".to_string(),
            ));
        }
        if event_type == "hidden" {
            if report_when.is_some() {
                return Err(AnalyticsError::BadVisibilitySpec(
                    "reportWhen must not be set when eventType is hidden".to_string(),
                ));
            }
            report_when = Some(ReportWhen::DocumentHidden);
        }

        let selectors: Vec<String> = match &config.selector {
            Some(selector) => selector.as_list(),
            None => spec.selector.clone().into_iter().collect(),
        };
        let is_root_target = selectors.is_empty()
            || (selectors.len() == 1 && matches!(selectors[0].trim(), ":root" | ":host"));

        let model_specs = Self::expand_model_specs(&spec, report_when)?;
        let method = config
            .selection_method
            .or(spec.selection_method)
            .unwrap_or(SelectionMethod::Auto);

        let manager = root.visibility_manager();
        let doc = Rc::clone(root.doc());
        let add_token = CancelToken::new();
        let subs: Rc<RefCell<Vec<Unlisten>>> = Rc::new(RefCell::new(Vec::new()));

        if is_root_target {
            let ready = Self::ready_promise(&root, &spec, false, SignalTarget::Root)?;
            for model_spec in &model_specs {
                let report_ready =
                    report_when.map(|when| Self::report_ready_promise(&doc, when));
                let state_listener =
                    Self::state_listener(&doc, root.root_element(), event_type, &listener);
                subs.borrow_mut().push(manager.listen_root(
                    model_spec.clone(),
                    ready.clone(),
                    report_ready,
                    state_listener,
                ));
            }
        } else {
            // Elements resolve asynchronously; registrations accumulate
            // under the per-add cancel token.
            let elements = root.get_elements(
                effective_context(&root, context),
                &selectors,
                method,
                true,
            )?;
            let weak_root = Rc::downgrade(&root);
            let spec_for_ready = spec.clone();
            let model_specs = model_specs.clone();
            let event_type = event_type.to_string();
            let listener = Rc::clone(&listener);
            let subs_for_elements = Rc::clone(&subs);
            let manager = Rc::clone(&manager);
            let doc_for_elements = Rc::clone(&doc);
            let tracker_token = self.token.clone();
            elements.then_ok(&add_token, move |elements: &Vec<NodeId>| {
                if tracker_token.is_canceled() {
                    return;
                }
                let Some(root) = weak_root.upgrade() else {
                    return;
                };
                for element in elements {
                    let ready = match Self::ready_promise(
                        &root,
                        &spec_for_ready,
                        true,
                        SignalTarget::Element(*element),
                    ) {
                        Ok(ready) => ready,
                        Err(err) => {
                            log::error!("visibility waitFor resolution failed: {err}");
                            continue;
                        }
                    };
                    for model_spec in &model_specs {
                        let report_ready = model_spec
                            .report_when
                            .map(|when| Self::report_ready_promise(&doc_for_elements, when));
                        let state_listener = Self::state_listener(
                            &doc_for_elements,
                            *element,
                            &event_type,
                            &listener,
                        );
                        subs_for_elements.borrow_mut().push(manager.listen_element(
                            *element,
                            model_spec.clone(),
                            ready.clone(),
                            report_ready,
                            state_listener,
                        ));
                    }
                }
            });
        }

        Ok(Unlisten::new(move || {
            add_token.cancel();
            for sub in subs.borrow_mut().drain(..) {
                sub.unlisten();
            }
        }))
    }

    fn dispose(&self) {
        self.token.cancel();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
