//! Per-listener visibility state machine.
//!
//! A [`VisibilityModel`] consumes a continuous visibility-ratio stream and
//! turns it into at most one discrete report per arming cycle. Elapsed time
//! between samples/ticks accrues to the visible counters while the model
//! matches its percentage range; leaving the range zeroes the continuous
//! counter. With `repeat`, leaving the range after a fire re-arms the model
//! and resets the time counters. `report_when` models skip threshold firing
//! entirely and fire once when the terminal report-ready signal arrives.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::clock::millis_since;
use crate::errors::AnalyticsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportWhen {
    DocumentHidden,
    DocumentExit,
}

impl ReportWhen {
    pub fn parse(value: &str) -> Result<Self, AnalyticsError> {
        match value {
            "documentHidden" => Ok(ReportWhen::DocumentHidden),
            "documentExit" => Ok(ReportWhen::DocumentExit),
            other => Err(AnalyticsError::BadVisibilitySpec(format!(
                "reportWhen value {other} not supported"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VisibilityModelSpec {
    /// Percentage range, 0-100. Matching is `min < p <= max`, with the
    /// degenerate extremes 0/0 and 100/100 matching exactly 0 and 100.
    pub min_percentage: f64,
    pub max_percentage: f64,
    pub total_time_min: Duration,
    pub total_time_max: Option<Duration>,
    pub continuous_time_min: Duration,
    pub continuous_time_max: Option<Duration>,
    pub repeat: bool,
    pub report_when: Option<ReportWhen>,
}

impl Default for VisibilityModelSpec {
    fn default() -> Self {
        Self {
            min_percentage: 0.0,
            max_percentage: 100.0,
            total_time_min: Duration::ZERO,
            total_time_max: None,
            continuous_time_min: Duration::ZERO,
            continuous_time_max: None,
            repeat: false,
            report_when: None,
        }
    }
}

impl VisibilityModelSpec {
    /// Validates a percentage range: within [0, 100], not inverted, and
    /// degenerate only at the extremes where an exact match is observable.
    pub fn validate_range(min: f64, max: f64) -> Result<(), AnalyticsError> {
        if !(min.is_finite() && max.is_finite()) || min < 0.0 || max > 100.0 {
            return Err(AnalyticsError::BadVisibilitySpec(format!(
                "visiblePercentage range [{min}, {max}] out of bounds"
            )));
        }
        if min > max {
            return Err(AnalyticsError::BadVisibilitySpec(format!(
                "visiblePercentage range [{min}, {max}] is inverted"
            )));
        }
        if min == max && min != 0.0 && min != 100.0 {
            return Err(AnalyticsError::BadVisibilitySpec(format!(
                "visiblePercentageMin == visiblePercentageMax == {min} can never fire"
            )));
        }
        Ok(())
    }

    fn matches(&self, percentage: f64) -> bool {
        if self.min_percentage == self.max_percentage {
            // Only the extremes are valid degenerate ranges.
            return percentage == self.min_percentage;
        }
        percentage > self.min_percentage && percentage <= self.max_percentage
    }
}

struct ModelState {
    created: Instant,
    ready: bool,
    ratio: f64,
    last_update: Option<Instant>,
    matching: bool,
    first_seen: Option<Instant>,
    last_seen: Option<Instant>,
    first_visible: Option<Instant>,
    last_visible: Option<Instant>,
    total_visible: Duration,
    continuous: Duration,
    max_continuous: Duration,
    min_percentage_seen: Option<f64>,
    max_percentage_seen: Option<f64>,
    fired: bool,
    disposed: bool,
}

type ModelListener = Box<dyn Fn(BTreeMap<String, String>)>;

pub struct VisibilityModel {
    spec: VisibilityModelSpec,
    epoch: Instant,
    state: RefCell<ModelState>,
    listener: ModelListener,
}

impl VisibilityModel {
    /// `epoch` anchors the millisecond timestamps reported in the fired
    /// state. The model starts not-ready; call [`VisibilityModel::set_ready`]
    /// once the ready gate resolves (immediately when there is none).
    pub fn new(
        spec: VisibilityModelSpec,
        epoch: Instant,
        created: Instant,
        listener: ModelListener,
    ) -> Self {
        Self {
            spec,
            epoch,
            state: RefCell::new(ModelState {
                created,
                ready: false,
                ratio: 0.0,
                last_update: None,
                matching: false,
                first_seen: None,
                last_seen: None,
                first_visible: None,
                last_visible: None,
                total_visible: Duration::ZERO,
                continuous: Duration::ZERO,
                max_continuous: Duration::ZERO,
                min_percentage_seen: None,
                max_percentage_seen: None,
                fired: false,
                disposed: false,
            }),
            listener,
        }
    }

    pub fn set_ready(&self, ready: bool, now: Instant) {
        {
            let mut state = self.state.borrow_mut();
            if state.disposed || state.ready == ready {
                return;
            }
            state.ready = ready;
        }
        self.update(None, now);
    }

    pub fn update_ratio(&self, ratio: f64, now: Instant) {
        self.update(Some(ratio.clamp(0.0, 1.0)), now);
    }

    /// Time-only update; lets time thresholds fire between ratio samples.
    pub fn tick(&self, now: Instant) {
        self.update(None, now);
    }

    /// Terminal signal for `report_when` models: fire once with whatever
    /// has accumulated, visible or not.
    pub fn on_report_ready(&self, now: Instant) {
        if self.spec.report_when.is_none() {
            return;
        }
        self.update(None, now);
        {
            let mut state = self.state.borrow_mut();
            if state.disposed || state.fired {
                return;
            }
            state.fired = true;
        }
        (self.listener)(self.state_vars(now));
    }

    pub fn dispose(&self) {
        let mut state = self.state.borrow_mut();
        state.disposed = true;
    }

    fn update(&self, new_ratio: Option<f64>, now: Instant) {
        let should_fire = {
            let mut state = self.state.borrow_mut();
            if state.disposed {
                return;
            }

            // Attribute elapsed time to the counters under the previous
            // matching state before adopting the new sample.
            if let Some(last) = state.last_update {
                if state.matching {
                    let dt = now.saturating_duration_since(last);
                    state.total_visible += dt;
                    state.continuous += dt;
                }
            }
            state.last_update = Some(now);
            if let Some(ratio) = new_ratio {
                state.ratio = ratio;
            }
            state.first_seen.get_or_insert(now);
            state.last_seen = Some(now);

            let percentage = if state.ready { state.ratio * 100.0 } else { 0.0 };
            let matching = self.spec.matches(percentage);
            if matching {
                state.last_visible = Some(now);
                state.first_visible.get_or_insert(now);
                let min = state.min_percentage_seen.map_or(percentage, |m| m.min(percentage));
                let max = state.max_percentage_seen.map_or(percentage, |m| m.max(percentage));
                state.min_percentage_seen = Some(min);
                state.max_percentage_seen = Some(max);
            }

            if state.matching && !matching {
                // Leaving the range: close the continuous window and, for
                // repeat models, re-arm with fresh counters.
                state.max_continuous = state.max_continuous.max(state.continuous);
                state.continuous = Duration::ZERO;
                if state.fired && self.spec.repeat {
                    state.fired = false;
                    state.total_visible = Duration::ZERO;
                    state.first_visible = None;
                    state.last_visible = None;
                }
            }
            state.matching = matching;

            self.spec.report_when.is_none()
                && !state.fired
                && state.ready
                && matching
                && self.conditions_met(&state)
        };

        if should_fire {
            self.state.borrow_mut().fired = true;
            (self.listener)(self.state_vars(now));
        }
    }

    fn conditions_met(&self, state: &ModelState) -> bool {
        state.total_visible >= self.spec.total_time_min
            && self.spec.total_time_max.map_or(true, |max| state.total_visible <= max)
            && state.continuous >= self.spec.continuous_time_min
            && self.spec.continuous_time_max.map_or(true, |max| state.continuous <= max)
    }

    /// Next instant at which a pure time threshold could be satisfied, so
    /// the owner knows a tick is still worth scheduling.
    pub fn needs_ticks(&self) -> bool {
        let state = self.state.borrow();
        !state.disposed
            && !state.fired
            && (self.spec.total_time_min > Duration::ZERO
                || self.spec.continuous_time_min > Duration::ZERO)
    }

    pub fn has_fired(&self) -> bool {
        self.state.borrow().fired
    }

    /// Accumulated state as event variables.
    pub fn state_vars(&self, now: Instant) -> BTreeMap<String, String> {
        let state = self.state.borrow();
        let ms = |instant: Option<Instant>| {
            instant.map_or(0, |i| millis_since(self.epoch, i)).to_string()
        };
        let mut vars = BTreeMap::new();
        vars.insert(
            "totalVisibleTime".to_string(),
            (state.total_visible.as_millis() as u64).to_string(),
        );
        vars.insert(
            "maxContinuousVisibleTime".to_string(),
            (state.max_continuous.max(state.continuous).as_millis() as u64).to_string(),
        );
        vars.insert("firstSeenTime".to_string(), ms(state.first_seen));
        vars.insert("lastSeenTime".to_string(), ms(state.last_seen));
        vars.insert("firstVisibleTime".to_string(), ms(state.first_visible));
        vars.insert("lastVisibleTime".to_string(), ms(state.last_visible));
        vars.insert(
            "minVisiblePercentage".to_string(),
            (state.min_percentage_seen.unwrap_or(0.0).round() as i64).to_string(),
        );
        vars.insert(
            "maxVisiblePercentage".to_string(),
            (state.max_percentage_seen.unwrap_or(0.0).round() as i64).to_string(),
        );
        vars.insert(
            "totalTime".to_string(),
            millis_since(self.epoch, now)
                .saturating_sub(millis_since(self.epoch, state.created))
                .to_string(),
        );
        vars
    }
}
