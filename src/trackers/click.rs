//! Click tracker: one document-level click subscription fanned out through
//! selective listeners.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::channel::{Channel, Unlisten};
use crate::config::TriggerConfig;
use crate::dom::{DomEvent, NodeId};
use crate::errors::AnalyticsError;
use crate::event::{AnalyticsEvent, EventListener};
use crate::root::AnalyticsRoot;
use crate::trackers::{effective_context, EventTracker};

pub struct ClickEventTracker {
    root: Weak<AnalyticsRoot>,
    clicks: Channel<DomEvent>,
    doc_sub: RefCell<Option<Unlisten>>,
}

impl ClickEventTracker {
    pub fn new(root: &Rc<AnalyticsRoot>) -> Self {
        let clicks = Channel::new();
        let fan_out = clicks.clone();
        let doc_sub = root
            .doc()
            .add_event_listener("click", Rc::new(move |event: &DomEvent| fan_out.fire(event)));
        Self {
            root: Rc::downgrade(root),
            clicks,
            doc_sub: RefCell::new(Some(doc_sub)),
        }
    }
}

impl EventTracker for ClickEventTracker {
    fn add(
        &self,
        context: NodeId,
        event_type: &str,
        config: &TriggerConfig,
        listener: EventListener,
    ) -> Result<Unlisten, AnalyticsError> {
        let root = self.root.upgrade().ok_or(AnalyticsError::Disposed)?;
        let selector = config
            .selector_str()
            .ok_or(AnalyticsError::MissingSelector("click"))?
            .to_string();

        let doc = Rc::clone(root.doc());
        let event_type = event_type.to_string();
        let selective = root.create_selective_listener(
            Rc::new(move |target: NodeId, _event: &DomEvent| {
                listener(&AnalyticsEvent::with_vars(target, &event_type, doc.data_vars(target)));
            }),
            effective_context(&root, context),
            &selector,
            config.selection_method(),
        );
        Ok(self.clicks.add(selective))
    }

    fn dispose(&self) {
        if let Some(sub) = self.doc_sub.borrow_mut().take() {
            sub.unlisten();
        }
        self.clicks.remove_all();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
