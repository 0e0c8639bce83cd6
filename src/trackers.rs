// src/trackers.rs
//! The tracker family: one [`EventTracker`] implementation per signal kind.
//!
//! A tracker services every trigger of one event kind within one scope.
//! All variants validate their configuration synchronously inside `add`,
//! return an idempotent [`Unlisten`], and dispose idempotently. The
//! [`create_tracker`] factory is the single place a [`TrackerKind`] maps to
//! a concrete implementation; the exhaustive match keeps the compiler
//! honest when a kind is added.

mod browser;
mod click;
mod custom;
mod scroll;
mod signal;
mod story;
mod timer;
mod video;
mod visibility;

use std::any::Any;
use std::rc::Rc;
use std::time::Instant;

pub use browser::BrowserEventTracker;
pub use click::ClickEventTracker;
pub use custom::CustomEventTracker;
pub use scroll::ScrollEventTracker;
pub use signal::{IniLoadTracker, SignalTracker};
pub use story::StoryEventTracker;
pub use timer::{TimerEventHandler, TimerEventTracker};
pub use video::VideoEventTracker;
pub use visibility::VisibilityTracker;

use crate::channel::Unlisten;
use crate::config::TriggerConfig;
use crate::dom::NodeId;
use crate::errors::AnalyticsError;
use crate::event::{EventListener, TrackerKind};
use crate::future::Promise;
use crate::root::AnalyticsRoot;

/// Which signal carrier a signal-backed tracker should observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    Root,
    Element(NodeId),
}

pub trait EventTracker {
    /// Validates `config` and registers `listener`. Configuration errors
    /// fail fast; a failed `add` leaves no partial registration.
    fn add(
        &self,
        context: NodeId,
        event_type: &str,
        config: &TriggerConfig,
        listener: EventListener,
    ) -> Result<Unlisten, AnalyticsError>;

    /// Removes every registration this tracker owns. Idempotent.
    fn dispose(&self);

    /// Advances time-driven state (timers, buffer expiry, debounce).
    fn tick(&self, _now: Instant) {}

    /// For signal-backed trackers: the promise used as a visibility
    /// `waitFor` gate.
    fn signal_promise(&self, _event_type: &str, _target: SignalTarget) -> Option<Promise<()>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Maps a tracker kind to its implementation. `Visible` and `Hidden` share
/// one visibility tracker; the root's cache key already collapses them.
pub fn create_tracker(kind: TrackerKind, root: &Rc<AnalyticsRoot>) -> Rc<dyn EventTracker> {
    match kind {
        TrackerKind::Click => Rc::new(ClickEventTracker::new(root)),
        TrackerKind::Scroll => Rc::new(ScrollEventTracker::new(root)),
        TrackerKind::Custom => Rc::new(CustomEventTracker::new(root)),
        TrackerKind::Story => Rc::new(StoryEventTracker::new(root)),
        TrackerKind::RenderStart => Rc::new(SignalTracker::new(root)),
        TrackerKind::IniLoad => Rc::new(IniLoadTracker::new(root)),
        TrackerKind::Timer => Rc::new(TimerEventTracker::new(root)),
        TrackerKind::Visible | TrackerKind::Hidden => Rc::new(VisibilityTracker::new(root)),
        TrackerKind::Video => Rc::new(VideoEventTracker::new(root)),
        TrackerKind::BrowserEvent => Rc::new(BrowserEventTracker::new(root)),
    }
}

/// The element a trigger's selection is anchored at: the configuration
/// element's parent when it has one, the element itself otherwise.
pub(crate) fn effective_context(root: &AnalyticsRoot, context: NodeId) -> NodeId {
    root.doc().parent_of(context).unwrap_or(context)
}
