//! Scroll tracker: percent boundaries over the scope's scroll position.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use crate::channel::Unlisten;
use crate::config::TriggerConfig;
use crate::dom::NodeId;
use crate::errors::AnalyticsError;
use crate::event::{AnalyticsEvent, EventListener};
use crate::root::AnalyticsRoot;
use crate::scroll::ScrollEvent;
use crate::trackers::EventTracker;

const SCROLL_PRECISION_PERCENT: f64 = 5.0;
const VAR_V_SCROLL_BOUNDARY: &str = "verticalScrollBoundary";
const VAR_H_SCROLL_BOUNDARY: &str = "horizontalScrollBoundary";

pub struct ScrollEventTracker {
    root: Weak<AnalyticsRoot>,
    subs: RefCell<Vec<Rc<Unlisten>>>,
}

impl ScrollEventTracker {
    pub fn new(root: &Rc<AnalyticsRoot>) -> Self {
        Self { root: Rc::downgrade(root), subs: RefCell::new(Vec::new()) }
    }

    /// Rounds boundaries to the nearest 5%, clamps into 0-100 and
    /// deduplicates into a boundary→fired map.
    fn normalize_boundaries(
        bounds: Option<&Vec<f64>>,
    ) -> Result<BTreeMap<u32, bool>, AnalyticsError> {
        let mut result = BTreeMap::new();
        let Some(bounds) = bounds else {
            return Ok(result);
        };
        for bound in bounds {
            if !bound.is_finite() {
                return Err(AnalyticsError::BadScrollSpec("boundaries must be finite numbers"));
            }
            let rounded = ((bound / SCROLL_PRECISION_PERCENT).round()
                * SCROLL_PRECISION_PERCENT)
                .clamp(0.0, 100.0) as u32;
            result.entry(rounded).or_insert(false);
        }
        Ok(result)
    }

    fn trigger_boundaries(
        bounds: &mut BTreeMap<u32, bool>,
        scroll_percent: f64,
        var_name: &str,
        root_element: NodeId,
        event_type: &str,
        listener: &EventListener,
    ) {
        if scroll_percent <= 0.0 {
            return;
        }
        for (bound, fired) in bounds.iter_mut() {
            if f64::from(*bound) > scroll_percent || *fired {
                continue;
            }
            *fired = true;
            let mut vars = BTreeMap::new();
            vars.insert(var_name.to_string(), bound.to_string());
            listener(&AnalyticsEvent::with_vars(root_element, event_type, vars));
        }
    }
}

impl EventTracker for ScrollEventTracker {
    fn add(
        &self,
        _context: NodeId,
        event_type: &str,
        config: &TriggerConfig,
        listener: EventListener,
    ) -> Result<Unlisten, AnalyticsError> {
        let root = self.root.upgrade().ok_or(AnalyticsError::Disposed)?;
        let spec = config
            .scroll_spec
            .as_ref()
            .ok_or(AnalyticsError::BadScrollSpec("missing scrollSpec on scroll trigger"))?;
        if spec.vertical_boundaries.is_none() && spec.horizontal_boundaries.is_none() {
            return Err(AnalyticsError::BadScrollSpec(
                "boundaries are required for the scroll trigger to work",
            ));
        }

        // Each registration owns its own fired-maps, so multiple listeners
        // track boundary crossings independently.
        let bounds_v = RefCell::new(Self::normalize_boundaries(spec.vertical_boundaries.as_ref())?);
        let bounds_h =
            RefCell::new(Self::normalize_boundaries(spec.horizontal_boundaries.as_ref())?);
        let use_initial_size = spec.use_initial_page_size;
        let root_element = root.root_element();
        let event_type = event_type.to_string();

        let handler = move |event: &ScrollEvent| {
            let (scroll_height, scroll_width) = if use_initial_size {
                (event.initial_size.scroll_height, event.initial_size.scroll_width)
            } else {
                (event.scroll_height, event.scroll_width)
            };
            if scroll_height > 0.0 {
                Self::trigger_boundaries(
                    &mut bounds_v.borrow_mut(),
                    (event.top + event.height) * 100.0 / scroll_height,
                    VAR_V_SCROLL_BOUNDARY,
                    root_element,
                    &event_type,
                    &listener,
                );
            }
            if scroll_width > 0.0 {
                Self::trigger_boundaries(
                    &mut bounds_h.borrow_mut(),
                    (event.left + event.width) * 100.0 / scroll_width,
                    VAR_H_SCROLL_BOUNDARY,
                    root_element,
                    &event_type,
                    &listener,
                );
            }
        };

        let sub = Rc::new(root.scroll_manager().add_scroll_handler(Rc::new(handler)));
        self.subs.borrow_mut().push(Rc::clone(&sub));
        Ok(Unlisten::new(move || sub.unlisten()))
    }

    fn dispose(&self) {
        for sub in self.subs.borrow_mut().drain(..) {
            sub.unlisten();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ClockHandle, ManualClock};
    use crate::dom::Document;
    use crate::root::ScopeOptions;
    use crate::scroll::ViewportGeometry;

    fn setup() -> Rc<AnalyticsRoot> {
        let doc = Document::new("html");
        let clock = Rc::new(ManualClock::new());
        let epoch = clock.now();
        AnalyticsRoot::new_document(doc, clock as ClockHandle, epoch, ScopeOptions::default())
    }

    fn scroll_config(json: &str) -> TriggerConfig {
        serde_json::from_str(json).unwrap()
    }

    fn geometry(top: f64) -> ViewportGeometry {
        // Viewport is half the page: fully scrolled at top == 600.
        ViewportGeometry {
            top,
            left: 0.0,
            width: 400.0,
            height: 600.0,
            scroll_height: 1200.0,
            scroll_width: 400.0,
        }
    }

    #[test]
    fn missing_spec_or_boundaries_fail_fast() {
        let root = setup();
        let tracker = ScrollEventTracker::new(&root);
        let listener: EventListener = Rc::new(|_| {});

        let no_spec = scroll_config(r#"{"on": "scroll"}"#);
        assert!(matches!(
            tracker.add(root.root_element(), "scroll", &no_spec, Rc::clone(&listener)),
            Err(AnalyticsError::BadScrollSpec(_))
        ));

        let no_bounds = scroll_config(r#"{"on": "scroll", "scrollSpec": {}}"#);
        assert!(matches!(
            tracker.add(root.root_element(), "scroll", &no_bounds, listener),
            Err(AnalyticsError::BadScrollSpec(_))
        ));
    }

    #[test]
    fn boundaries_round_to_nearest_five_and_dedupe() {
        let bounds =
            ScrollEventTracker::normalize_boundaries(Some(&vec![1.0, 2.0, 48.0, 51.0, 100.0, 130.0]))
                .unwrap();
        let keys: Vec<u32> = bounds.keys().copied().collect();
        assert_eq!(keys, vec![0, 50, 100]);

        assert!(ScrollEventTracker::normalize_boundaries(Some(&vec![f64::NAN])).is_err());
    }

    #[test]
    fn full_page_scroll_fires_each_boundary_exactly_once() {
        let root = setup();
        let tracker = ScrollEventTracker::new(&root);
        let config = scroll_config(
            r#"{"on": "scroll", "scrollSpec": {"verticalBoundaries": [0, 50, 100]}}"#,
        );

        let fired = Rc::new(RefCell::new(Vec::new()));
        let fired2 = Rc::clone(&fired);
        tracker
            .add(
                root.root_element(),
                "scroll",
                &config,
                Rc::new(move |event: &AnalyticsEvent| {
                    fired2
                        .borrow_mut()
                        .push(event.vars.get(VAR_V_SCROLL_BOUNDARY).cloned().unwrap());
                }),
            )
            .unwrap();

        // Top of a 2x-height page: 50% through; then fully scrolled.
        root.update_scroll(geometry(0.0));
        root.update_scroll(geometry(300.0));
        root.update_scroll(geometry(600.0));
        // Scrolling back up re-fires nothing.
        root.update_scroll(geometry(0.0));

        assert_eq!(*fired.borrow(), vec!["0", "50", "100"]);
    }

    #[test]
    fn listeners_track_boundaries_independently() {
        let root = setup();
        let tracker = ScrollEventTracker::new(&root);
        let config =
            scroll_config(r#"{"on": "scroll", "scrollSpec": {"verticalBoundaries": [50]}}"#);

        let first = Rc::new(RefCell::new(0));
        let first2 = Rc::clone(&first);
        tracker
            .add(
                root.root_element(),
                "scroll",
                &config,
                Rc::new(move |_| *first2.borrow_mut() += 1),
            )
            .unwrap();

        root.update_scroll(geometry(0.0));
        assert_eq!(*first.borrow(), 1);

        // A second listener added later gets its own crossing state and
        // fires off the replayed scroll position.
        let second = Rc::new(RefCell::new(0));
        let second2 = Rc::clone(&second);
        tracker
            .add(
                root.root_element(),
                "scroll",
                &config,
                Rc::new(move |_| *second2.borrow_mut() += 1),
            )
            .unwrap();
        assert_eq!(*second.borrow(), 1);
        assert_eq!(*first.borrow(), 1);
    }

    #[test]
    fn initial_page_size_option_uses_first_measurement() {
        let root = setup();
        let tracker = ScrollEventTracker::new(&root);
        let config = scroll_config(
            r#"{"on": "scroll",
                "scrollSpec": {"verticalBoundaries": [100], "useInitialPageSize": true}}"#,
        );

        let fired = Rc::new(RefCell::new(0));
        let fired2 = Rc::clone(&fired);
        tracker
            .add(
                root.root_element(),
                "scroll",
                &config,
                Rc::new(move |_| *fired2.borrow_mut() += 1),
            )
            .unwrap();

        root.update_scroll(geometry(0.0));
        // The page grows to 2400 after the first measurement; against the
        // initial 1200 the 600px viewport at top=600 is still 100%.
        root.update_scroll(ViewportGeometry { scroll_height: 2400.0, ..geometry(600.0) });
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn horizontal_boundaries_fire_with_their_own_var() {
        let root = setup();
        let tracker = ScrollEventTracker::new(&root);
        let config = scroll_config(
            r#"{"on": "scroll", "scrollSpec": {"horizontalBoundaries": [100]}}"#,
        );

        let fired = Rc::new(RefCell::new(Vec::new()));
        let fired2 = Rc::clone(&fired);
        tracker
            .add(
                root.root_element(),
                "scroll",
                &config,
                Rc::new(move |event: &AnalyticsEvent| {
                    fired2
                        .borrow_mut()
                        .push(event.vars.get(VAR_H_SCROLL_BOUNDARY).cloned().unwrap());
                }),
            )
            .unwrap();

        root.update_scroll(ViewportGeometry {
            top: 0.0,
            left: 400.0,
            width: 400.0,
            height: 600.0,
            scroll_height: 1200.0,
            scroll_width: 800.0,
        });
        assert_eq!(*fired.borrow(), vec!["100"]);
    }
}
