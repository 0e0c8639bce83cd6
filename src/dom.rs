// src/dom.rs
//! Document model boundary: [`Document`], [`NodeId`], [`Selector`].
//!
mod document;
mod selector;

pub use document::{DocumentHandle, Document, DomEvent, NodeId, ScopeId};
pub use selector::Selector;
