//! Trigger configuration grammar.
//!
//! These structs mirror the JSON configuration blocks handed over by the
//! external config loader. Deserialization is permissive (unknown fields
//! ignored, everything optional); semantic validation happens inside each
//! tracker's `add`, which fails fast on malformed specs.

use serde::Deserialize;

/// One trigger entry of a configuration block.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TriggerConfig {
    /// Event type name this trigger listens for.
    pub on: Option<String>,
    pub selector: Option<SelectorSpec>,
    pub selection_method: Option<SelectionMethod>,
    pub scroll_spec: Option<ScrollSpec>,
    pub visibility_spec: Option<VisibilitySpec>,
    pub timer_spec: Option<TimerSpec>,
    pub video_spec: Option<VideoSpec>,
    pub story_spec: Option<StorySpec>,
}

impl TriggerConfig {
    pub fn selection_method(&self) -> SelectionMethod {
        self.selection_method.unwrap_or_default()
    }

    /// Single selector string, when one was configured.
    pub fn selector_str(&self) -> Option<&str> {
        match &self.selector {
            Some(SelectorSpec::One(s)) => Some(s.as_str()),
            Some(SelectorSpec::Many(list)) => list.first().map(String::as_str),
            None => None,
        }
    }
}

/// `selector` accepts a single string or an array of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SelectorSpec {
    One(String),
    Many(Vec<String>),
}

impl SelectorSpec {
    pub fn as_list(&self) -> Vec<String> {
        match self {
            SelectorSpec::One(s) => vec![s.clone()],
            SelectorSpec::Many(list) => list.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMethod {
    /// Unscoped query from the scope root.
    #[default]
    Auto,
    /// Query within the context element's subtree.
    Scope,
    /// Nearest ancestor of the context element.
    Closest,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScrollSpec {
    /// Percent boundaries, 0-100.
    pub vertical_boundaries: Option<Vec<f64>>,
    pub horizontal_boundaries: Option<Vec<f64>>,
    /// Divide by the scroll size observed at first measurement instead of
    /// the current one.
    pub use_initial_page_size: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VisibilitySpec {
    pub selector: Option<String>,
    pub selection_method: Option<SelectionMethod>,
    /// `none`, `render-start` or `ini-load`.
    pub wait_for: Option<String>,
    /// `documentHidden` or `documentExit`.
    pub report_when: Option<String>,
    pub repeat: bool,
    pub visible_percentage_min: Option<f64>,
    pub visible_percentage_max: Option<f64>,
    /// `[min, max]` percentage ranges, each expanding to its own model.
    pub visible_percentage_thresholds: Option<Vec<Vec<f64>>>,
    /// Time thresholds in milliseconds.
    pub total_time_min: Option<u64>,
    pub total_time_max: Option<u64>,
    pub continuous_time_min: Option<u64>,
    pub continuous_time_max: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimerSpec {
    /// Seconds between fires; minimum 0.5.
    pub interval: Option<f64>,
    /// Seconds before a force-stop; default 7200.
    pub max_timer_length: Option<f64>,
    /// Fire once at start time; default true.
    pub immediate: Option<bool>,
    pub start_spec: Option<Box<TriggerConfig>>,
    pub stop_spec: Option<Box<TriggerConfig>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VideoSpec {
    pub selector: Option<String>,
    /// Every Nth `video-seconds-played` sample fires.
    pub interval: Option<u32>,
    /// Playback percentages, non-zero multiples of 5.
    pub percentages: Option<Vec<f64>>,
    #[serde(rename = "exclude-autoplay")]
    pub exclude_autoplay: bool,
    #[serde(rename = "end-session-when-invisible")]
    pub end_session_when_invisible: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorySpec {
    /// When false, each event type is delivered at most once.
    pub repeat: bool,
    /// Restrict delivery to targets with this tag name.
    pub tag_name: Option<String>,
}

impl Default for StorySpec {
    fn default() -> Self {
        Self { repeat: true, tag_name: None }
    }
}
