//! Video tracker: one subscription over the fixed video lifecycle event
//! set, demultiplexed per trigger by `on`, seconds-played interval and
//! percentage milestones.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::channel::{Channel, Unlisten};
use crate::config::TriggerConfig;
use crate::dom::{DomEvent, NodeId};
use crate::errors::AnalyticsError;
use crate::event::{AnalyticsEvent, EventListener, VIDEO_EVENTS};
use crate::future::CancelToken;
use crate::root::AnalyticsRoot;
use crate::trackers::EventTracker;

const SESSION: &str = "video-session";
const SESSION_VISIBLE: &str = "video-session-visible";
const SECONDS_PLAYED: &str = "video-seconds-played";
const PERCENTAGE_PLAYED: &str = "video-percentage-played";
const PERCENTAGE_INTERVAL: f64 = 5.0;
/// Playback state reported for autoplaying media.
const PLAYING_AUTO: &str = "playing_auto";

pub struct VideoEventTracker {
    root: Weak<AnalyticsRoot>,
    sessions: Channel<DomEvent>,
    doc_subs: RefCell<Vec<Unlisten>>,
    token: CancelToken,
}

impl VideoEventTracker {
    pub fn new(root: &Rc<AnalyticsRoot>) -> Self {
        let sessions: Channel<DomEvent> = Channel::new();
        let mut doc_subs = Vec::new();
        for name in VIDEO_EVENTS {
            let fan_out = sessions.clone();
            doc_subs.push(
                root.doc()
                    .add_event_listener(name, Rc::new(move |event: &DomEvent| fan_out.fire(event))),
            );
        }
        Self {
            root: Rc::downgrade(root),
            sessions,
            doc_subs: RefCell::new(doc_subs),
            token: CancelToken::new(),
        }
    }
}

impl EventTracker for VideoEventTracker {
    fn add(
        &self,
        context: NodeId,
        event_type: &str,
        config: &TriggerConfig,
        listener: EventListener,
    ) -> Result<Unlisten, AnalyticsError> {
        let root = self.root.upgrade().ok_or(AnalyticsError::Disposed)?;
        let spec = config.video_spec.clone().unwrap_or_default();
        let selector = config
            .selector_str()
            .map(str::to_string)
            .or_else(|| spec.selector.clone())
            .ok_or(AnalyticsError::MissingSelector("video"))?;

        let on = event_type.to_string();
        if !VIDEO_EVENTS.contains(&on.as_str()) || on == SESSION_VISIBLE {
            return Err(AnalyticsError::BadVideoSpec("unknown video trigger type"));
        }
        if on == SECONDS_PLAYED && spec.interval.unwrap_or(0) == 0 {
            return Err(AnalyticsError::BadVideoSpec(
                "video-seconds-played requires interval spec with non-zero value",
            ));
        }
        let percentages = if on == PERCENTAGE_PLAYED {
            let percentages = spec
                .percentages
                .clone()
                .ok_or(AnalyticsError::BadVideoSpec(
                    "video-percentage-played requires percentages spec",
                ))?;
            for percentage in &percentages {
                if *percentage <= 0.0 || percentage % PERCENTAGE_INTERVAL != 0.0 {
                    return Err(AnalyticsError::BadVideoSpec(
                        "percentages must be non-zero multiples of 5",
                    ));
                }
            }
            percentages
        } else {
            Vec::new()
        };

        let target_ready = root.get_element(context, &selector, config.selection_method());
        let doc = Rc::clone(root.doc());
        let token = self.token.clone();
        let interval = spec.interval.unwrap_or(0);
        let end_session_when_invisible = spec.end_session_when_invisible;
        let exclude_autoplay = spec.exclude_autoplay;
        let interval_counter = Cell::new(0u32);
        let last_percentage = Cell::new(0i64);

        Ok(self.sessions.add_fn(move |event: &DomEvent| {
            let is_visible_type = event.event_type == SESSION_VISIBLE;
            let normalized = if is_visible_type { SESSION } else { event.event_type.as_str() };
            if normalized != on {
                return;
            }

            if normalized == SECONDS_PLAYED {
                interval_counter.set(interval_counter.get() + 1);
                if interval_counter.get() % interval != 0 {
                    return;
                }
            }

            if normalized == PERCENTAGE_PLAYED {
                let Some(percentage) = event
                    .vars
                    .get("normalizedPercentage")
                    .and_then(|p| p.parse::<f64>().ok())
                    .filter(|p| p.is_finite() && p % PERCENTAGE_INTERVAL == 0.0)
                else {
                    log::debug!("video event without a normalized percentage, dropped");
                    return;
                };
                let rounded = percentage as i64;
                if last_percentage.get() == rounded {
                    return;
                }
                if !percentages.contains(&percentage) {
                    return;
                }
                last_percentage.set(rounded);
            }

            if is_visible_type && !end_session_when_invisible {
                return;
            }
            if exclude_autoplay
                && event.vars.get("state").map(String::as_str) == Some(PLAYING_AUTO)
            {
                return;
            }

            let event = event.clone();
            let doc = Rc::clone(&doc);
            let listener = Rc::clone(&listener);
            let normalized = normalized.to_string();
            target_ready.then_ok(&token, move |target: &NodeId| {
                if doc.contains(*target, event.target) {
                    listener(&AnalyticsEvent::with_vars(*target, &normalized, event.vars.clone()));
                }
            });
        }))
    }

    fn dispose(&self) {
        self.token.cancel();
        for sub in self.doc_subs.borrow_mut().drain(..) {
            sub.unlisten();
        }
        self.sessions.remove_all();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
