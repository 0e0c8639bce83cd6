#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalyticsError {
    #[error("Missing required selector on {0} trigger")]
    MissingSelector(&'static str),

    #[error("Empty selector")]
    EmptySelector,

    #[error("Duplicate selector: {0}")]
    DuplicateSelector(String),

    #[error("Unsupported selector syntax: {0}")]
    InvalidSelector(String),

    #[error("No element found for selector: {0}")]
    SelectorNotFound(String),

    #[error("Element for selector {0} is outside the scope boundary")]
    OutsideScope(String),

    #[error("Scope has no host element")]
    NoHostElement,

    #[error("Missing event type on trigger")]
    MissingEventType,

    #[error("Trigger type {0} is not allowed in this scope")]
    TriggerNotAllowed(String),

    #[error("Bad scroll specification: {0}")]
    BadScrollSpec(&'static str),

    #[error("Bad timer specification: {0}")]
    BadTimerSpec(&'static str),

    #[error("Bad visibility specification: {0}")]
    BadVisibilitySpec(String),

    #[error("Bad video specification: {0}")]
    BadVideoSpec(&'static str),

    #[error("Browser event triggers are not enabled for this scope")]
    BrowserEventsDisabled,

    #[error("Cannot resolve tracker for {0}")]
    TrackerNotAvailable(String),

    #[error("Scope has been disposed")]
    Disposed,
}
