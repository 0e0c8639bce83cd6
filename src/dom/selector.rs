//! Selector subset used for trigger targeting.
//!
//! The engine deliberately supports only the forms the configuration
//! grammar needs: `:root`, `:host`, `#id`, `.class` and a bare tag name.
//! Combinators and attribute selectors are rejected; per the error design
//! that rejection surfaces on the lookup promise, not as a panic.

use crate::errors::AnalyticsError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// The scope's own root element.
    Root,
    /// The scope's host element (embedded scopes only).
    Host,
    Id(String),
    Class(String),
    Tag(String),
}

impl Selector {
    pub fn parse(input: &str) -> Result<Selector, AnalyticsError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AnalyticsError::EmptySelector);
        }
        match trimmed {
            ":root" => return Ok(Selector::Root),
            ":host" => return Ok(Selector::Host),
            _ => {}
        }
        if let Some(name) = trimmed.strip_prefix('#') {
            return if is_name(name) {
                Ok(Selector::Id(name.to_string()))
            } else {
                Err(AnalyticsError::InvalidSelector(input.to_string()))
            };
        }
        if let Some(name) = trimmed.strip_prefix('.') {
            return if is_name(name) {
                Ok(Selector::Class(name.to_string()))
            } else {
                Err(AnalyticsError::InvalidSelector(input.to_string()))
            };
        }
        if is_tag(trimmed) {
            return Ok(Selector::Tag(trimmed.to_ascii_lowercase()));
        }
        Err(AnalyticsError::InvalidSelector(input.to_string()))
    }

    /// True for the two selectors that resolve without waiting for the
    /// document to be ready.
    pub fn is_scope_selector(input: &str) -> bool {
        matches!(input.trim(), ":root" | ":host")
    }
}

fn is_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn is_tag(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}
