//! # pulse-engine
//!
//! Analytics instrumentation engine for a component-based document
//! runtime. The engine observes heterogeneous signals inside a scoped
//! document boundary (clicks, custom application events, element and
//! document visibility, scroll position, timers, media playback, document
//! lifecycle) and turns them into normalized [`AnalyticsEvent`] records
//! delivered to configuration-declared trigger listeners.
//!
//! ```text
//!  producer (raw event / timer tick / ratio sample / trigger call)
//!      │
//!      ▼
//!  EventTracker variant  ──►  AnalyticsEvent (vars merged with the
//!      │                      target's declared data-vars-* variables)
//!      ▼
//!  trigger listener(s) registered by AnalyticsGroup
//! ```
//!
//! The core is single-threaded and cooperative: the embedder owns the
//! event loop, feeds documents/geometry/samples in, and pumps time-driven
//! state through [`InstrumentationService::tick`]. Tests drive everything
//! with a [`ManualClock`]; there are no real delays anywhere.

pub mod channel;
pub mod clock;
pub mod config;
pub mod dom;
pub mod errors;
pub mod event;
pub mod future;
pub mod group;
pub mod instrumentation;
pub mod root;
pub mod scroll;
pub mod trackers;
pub mod visibility;

pub use channel::{Channel, Unlisten};
pub use clock::{Clock, ClockHandle, ManualClock, SystemClock};
pub use config::{
    ScrollSpec, SelectionMethod, SelectorSpec, StorySpec, TimerSpec, TriggerConfig, VideoSpec,
    VisibilitySpec,
};
pub use dom::{Document, DocumentHandle, DomEvent, NodeId, ScopeId, Selector};
pub use errors::AnalyticsError;
pub use event::{AnalyticsEvent, EventListener, ScopeKind, TrackerAllowance, TrackerKind};
pub use future::{CancelToken, Deferred, Promise};
pub use group::{AnalyticsGroup, Scheduler};
pub use instrumentation::{InstrumentationOptions, InstrumentationService};
pub use root::{AnalyticsRoot, ScopeOptions};
pub use scroll::{ScrollEvent, ScrollManager, ViewportGeometry};
pub use trackers::{EventTracker, SignalTarget};
pub use visibility::{ReportWhen, VisibilityManager, VisibilityModel, VisibilityModelSpec};
