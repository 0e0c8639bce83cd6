//! Core event types: [`AnalyticsEvent`], [`TrackerKind`] and the allowance
//! rules deciding where each tracker kind may be used.
//!
//! # Main Types
//!
//! - [`AnalyticsEvent`]: the normalized record delivered to consumers.
//! - [`TrackerKind`]: closed tagged enum over the tracker family.
//! - [`TrackerAllowance`]: bitset of scope kinds / parent trackers a kind
//!   is permitted in.
//! - [`ScopeKind`]: top-level document vs embedded sub-document.

use std::collections::BTreeMap;
use std::rc::Rc;

use bitflags::bitflags;

use crate::dom::{Document, NodeId};

/// Event names served by the browser-event tracker; raw input events that
/// can fire at high frequency and are debounced before fan-out.
pub const BROWSER_EVENTS: &[&str] = &["blur", "change", "focus", "input"];

/// Fixed set of video lifecycle events the video tracker demultiplexes.
pub const VIDEO_EVENTS: &[&str] = &[
    "video-play",
    "video-pause",
    "video-ended",
    "video-session",
    "video-session-visible",
    "video-seconds-played",
    "video-percentage-played",
];

/// The normalized analytics event handed to every trigger listener.
#[derive(Debug, Clone)]
pub struct AnalyticsEvent {
    /// The most relevant target element.
    pub target: NodeId,
    pub event_type: String,
    pub vars: BTreeMap<String, String>,
}

impl AnalyticsEvent {
    pub fn new(target: NodeId, event_type: &str) -> Self {
        Self { target, event_type: event_type.to_string(), vars: BTreeMap::new() }
    }

    pub fn with_vars(target: NodeId, event_type: &str, vars: BTreeMap<String, String>) -> Self {
        Self { target, event_type: event_type.to_string(), vars }
    }

    /// Builds an event whose vars are the shallow merge of the target's
    /// declared variables with `caller_vars` taking precedence.
    pub fn merged(
        doc: &Document,
        target: NodeId,
        event_type: &str,
        caller_vars: BTreeMap<String, String>,
    ) -> Self {
        let mut vars = doc.data_vars(target);
        vars.extend(caller_vars);
        Self { target, event_type: event_type.to_string(), vars }
    }
}

pub type EventListener = Rc<dyn Fn(&AnalyticsEvent)>;

/// Kind of analytics scope a root represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Top-level document.
    Document,
    /// Embedded sub-document with a host element in the parent scope.
    Embed,
}

bitflags! {
    /// Where a tracker kind may be instantiated: directly in a scope kind,
    /// or as a sub-trigger of a timer / as a visibility `waitFor` signal.
    pub struct TrackerAllowance: u8 {
        const DOCUMENT = 0b0001;
        const EMBED    = 0b0010;
        const TIMER    = 0b0100;
        const VISIBLE  = 0b1000;
    }
}

impl ScopeKind {
    pub fn allowance(self) -> TrackerAllowance {
        match self {
            ScopeKind::Document => TrackerAllowance::DOCUMENT,
            ScopeKind::Embed => TrackerAllowance::EMBED,
        }
    }
}

/// The closed set of tracker kinds. Adding a kind forces every `match`
/// below (and the factory) to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackerKind {
    Click,
    Scroll,
    Custom,
    Story,
    RenderStart,
    IniLoad,
    Timer,
    Visible,
    /// Sugar for `visible` with `reportWhen: documentHidden`; shares the
    /// visibility tracker instance.
    Hidden,
    Video,
    BrowserEvent,
}

impl TrackerKind {
    /// Cache key in the root's tracker map. `Hidden` reuses the `visible`
    /// tracker so both event types share one instance.
    pub fn key_name(self) -> &'static str {
        match self {
            TrackerKind::Click => "click",
            TrackerKind::Scroll => "scroll",
            TrackerKind::Custom => "custom",
            TrackerKind::Story => "story",
            TrackerKind::RenderStart => "render-start",
            TrackerKind::IniLoad => "ini-load",
            TrackerKind::Timer => "timer",
            TrackerKind::Visible | TrackerKind::Hidden => "visible",
            TrackerKind::Video => "video",
            TrackerKind::BrowserEvent => "browser-event",
        }
    }

    /// Maps a configured `on` value to the tracker kind servicing it.
    /// Unreserved names fall through to the custom tracker.
    pub fn from_event_type(event_type: &str) -> TrackerKind {
        if event_type.starts_with("video") {
            return TrackerKind::Video;
        }
        if event_type.starts_with("story-") {
            return TrackerKind::Story;
        }
        if BROWSER_EVENTS.contains(&event_type) {
            return TrackerKind::BrowserEvent;
        }
        match event_type {
            "click" => TrackerKind::Click,
            "scroll" => TrackerKind::Scroll,
            "timer" => TrackerKind::Timer,
            "visible" => TrackerKind::Visible,
            "hidden" => TrackerKind::Hidden,
            "render-start" => TrackerKind::RenderStart,
            "ini-load" => TrackerKind::IniLoad,
            _ => TrackerKind::Custom,
        }
    }

    pub fn allowance(self) -> TrackerAllowance {
        let base = TrackerAllowance::DOCUMENT | TrackerAllowance::EMBED;
        match self {
            // Signal-backed kinds also serve as visibility `waitFor`.
            TrackerKind::RenderStart | TrackerKind::IniLoad => {
                base | TrackerAllowance::TIMER | TrackerAllowance::VISIBLE
            }
            // A timer cannot start or stop another timer.
            TrackerKind::Timer => base,
            _ => base | TrackerAllowance::TIMER,
        }
    }

    pub fn allowed_in(self, context: TrackerAllowance) -> bool {
        self.allowance().contains(context)
    }
}
