//! Retained document tree plus the raw-signal surfaces the engine observes.
//!
//! A [`Document`] is one analytics scope: a full document or an embedded
//! sub-document. The embedder builds the element tree, dispatches raw DOM
//! events into the hub, fires named signals (`render-start`, `ini-load`,
//! `load-end`) and flips parse-ready and visibility state. The engine only
//! reads; it never mutates the tree.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{Channel, Unlisten};
use crate::dom::selector::Selector;
use crate::future::{Deferred, Promise};

/// A unique identifier for a scope, represented as a UUID.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId(Uuid);

impl ScopeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index into the document's node arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

struct NodeData {
    tag: String,
    attrs: BTreeMap<String, String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// A raw event dispatched into the document by the embedder.
#[derive(Debug, Clone)]
pub struct DomEvent {
    pub target: NodeId,
    pub event_type: String,
    /// Event payload, e.g. video session details.
    pub vars: BTreeMap<String, String>,
}

impl DomEvent {
    pub fn new(target: NodeId, event_type: &str) -> Self {
        Self { target, event_type: event_type.to_string(), vars: BTreeMap::new() }
    }

    pub fn with_vars(target: NodeId, event_type: &str, vars: BTreeMap<String, String>) -> Self {
        Self { target, event_type: event_type.to_string(), vars }
    }
}

pub type DocumentHandle = Rc<Document>;

struct EmbedLink {
    parent: Weak<Document>,
    host: NodeId,
}

pub struct Document {
    scope_id: ScopeId,
    nodes: RefCell<Vec<NodeData>>,
    root: NodeId,
    embed: Option<EmbedLink>,
    events: RefCell<HashMap<String, Channel<DomEvent>>>,
    signals: RefCell<HashMap<(NodeId, String), Rc<Deferred<()>>>>,
    ready: Deferred<()>,
    visible: Cell<bool>,
    visibility_changed: Channel<bool>,
    supports_pagehide: Cell<bool>,
}

impl Document {
    /// Creates a top-level document with a single root element.
    pub fn new(root_tag: &str) -> DocumentHandle {
        Rc::new(Self::build(root_tag, None))
    }

    /// Creates an embedded sub-document hosted at `host` in `parent`.
    pub fn new_embedded(parent: &DocumentHandle, host: NodeId, root_tag: &str) -> DocumentHandle {
        let link = EmbedLink { parent: Rc::downgrade(parent), host };
        Rc::new(Self::build(root_tag, Some(link)))
    }

    fn build(root_tag: &str, embed: Option<EmbedLink>) -> Self {
        let root_node = NodeData {
            tag: root_tag.to_ascii_lowercase(),
            attrs: BTreeMap::new(),
            parent: None,
            children: Vec::new(),
        };
        Self {
            scope_id: ScopeId::new(),
            nodes: RefCell::new(vec![root_node]),
            root: NodeId(0),
            embed,
            events: RefCell::new(HashMap::new()),
            signals: RefCell::new(HashMap::new()),
            ready: Deferred::new(),
            visible: Cell::new(true),
            visibility_changed: Channel::new(),
            supports_pagehide: Cell::new(true),
        }
    }

    pub fn scope_id(&self) -> ScopeId {
        self.scope_id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn is_embedded(&self) -> bool {
        self.embed.is_some()
    }

    /// Parent document and host node, for embedded documents.
    pub fn embed_link(&self) -> Option<(DocumentHandle, NodeId)> {
        let link = self.embed.as_ref()?;
        link.parent.upgrade().map(|parent| (parent, link.host))
    }

    // ****************************************
    // ** Tree construction and queries

    pub fn create_element(&self, parent: NodeId, tag: &str) -> NodeId {
        let mut nodes = self.nodes.borrow_mut();
        let id = NodeId(nodes.len() as u32);
        nodes.push(NodeData {
            tag: tag.to_ascii_lowercase(),
            attrs: BTreeMap::new(),
            parent: Some(parent),
            children: Vec::new(),
        });
        nodes[parent.0 as usize].children.push(id);
        id
    }

    pub fn create_element_with(
        &self,
        parent: NodeId,
        tag: &str,
        attrs: &[(&str, &str)],
    ) -> NodeId {
        let id = self.create_element(parent, tag);
        for (name, value) in attrs {
            self.set_attribute(id, name, value);
        }
        id
    }

    pub fn set_attribute(&self, node: NodeId, name: &str, value: &str) {
        self.nodes.borrow_mut()[node.0 as usize]
            .attrs
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.nodes.borrow()[node.0 as usize].attrs.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn tag_name(&self, node: NodeId) -> String {
        self.nodes.borrow()[node.0 as usize].tag.clone()
    }

    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.borrow()[node.0 as usize].parent
    }

    /// Inclusive containment: a node contains itself.
    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        let nodes = self.nodes.borrow();
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = nodes[id.0 as usize].parent;
        }
        false
    }

    pub fn matches(&self, node: NodeId, selector: &Selector) -> bool {
        let nodes = self.nodes.borrow();
        let data = &nodes[node.0 as usize];
        match selector {
            Selector::Root => node == self.root,
            // The host lives in the parent document; nothing here matches.
            Selector::Host => false,
            Selector::Id(id) => data.attrs.get("id").map(String::as_str) == Some(id.as_str()),
            Selector::Class(class) => data
                .attrs
                .get("class")
                .map(|c| c.split_ascii_whitespace().any(|part| part == class))
                .unwrap_or(false),
            Selector::Tag(tag) => data.tag == *tag,
        }
    }

    /// Nearest ancestor (inclusive) matching `selector`.
    pub fn closest(&self, node: NodeId, selector: &Selector) -> Option<NodeId> {
        let mut current = Some(node);
        while let Some(id) = current {
            if self.matches(id, selector) {
                return Some(id);
            }
            current = self.parent_of(id);
        }
        None
    }

    /// First match in depth-first preorder within `scope`'s subtree.
    pub fn query_selector(&self, scope: NodeId, selector: &Selector) -> Option<NodeId> {
        self.preorder(scope).into_iter().find(|id| self.matches(*id, selector))
    }

    pub fn query_selector_all(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        self.preorder(scope).into_iter().filter(|id| self.matches(*id, selector)).collect()
    }

    fn preorder(&self, scope: NodeId) -> Vec<NodeId> {
        let nodes = self.nodes.borrow();
        let mut out = Vec::new();
        let mut stack = vec![scope];
        while let Some(id) = stack.pop() {
            out.push(id);
            let children = &nodes[id.0 as usize].children;
            for child in children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    // ****************************************
    // ** Declared variables (data-vars-*)

    /// The element's declared variables: `data-vars-foo-bar="x"` becomes
    /// `fooBar => x`.
    pub fn data_vars(&self, node: NodeId) -> BTreeMap<String, String> {
        let nodes = self.nodes.borrow();
        let mut out = BTreeMap::new();
        for (name, value) in &nodes[node.0 as usize].attrs {
            if let Some(suffix) = name.strip_prefix("data-vars-") {
                if !suffix.is_empty() {
                    out.insert(camelize(suffix), value.clone());
                }
            }
        }
        out
    }

    pub fn has_data_vars(&self, node: NodeId) -> bool {
        let nodes = self.nodes.borrow();
        nodes[node.0 as usize]
            .attrs
            .keys()
            .any(|name| name.starts_with("data-vars-") && name.len() > "data-vars-".len())
    }

    // ****************************************
    // ** Event hub

    pub fn add_event_listener(
        &self,
        event_type: &str,
        listener: Rc<dyn Fn(&DomEvent)>,
    ) -> Unlisten {
        self.event_channel(event_type).add(listener)
    }

    pub fn dispatch_event(&self, event: DomEvent) {
        let channel = self.events.borrow().get(&event.event_type).cloned();
        if let Some(channel) = channel {
            channel.fire(&event);
        }
    }

    fn event_channel(&self, event_type: &str) -> Channel<DomEvent> {
        self.events
            .borrow_mut()
            .entry(event_type.to_string())
            .or_insert_with(Channel::new)
            .clone()
    }

    // ****************************************
    // ** Named signals

    pub fn fire_signal(&self, node: NodeId, name: &str) {
        self.signal_cell(node, name).resolve(());
    }

    pub fn when_signal(&self, node: NodeId, name: &str) -> Promise<()> {
        self.signal_cell(node, name).promise()
    }

    fn signal_cell(&self, node: NodeId, name: &str) -> Rc<Deferred<()>> {
        self.signals
            .borrow_mut()
            .entry((node, name.to_string()))
            .or_insert_with(|| Rc::new(Deferred::new()))
            .clone()
    }

    // ****************************************
    // ** Lifecycle state

    /// Marks the document as fully parsed; pending selector lookups resolve.
    pub fn set_ready(&self) {
        self.ready.resolve(());
    }

    pub fn is_ready(&self) -> bool {
        self.ready.promise().is_settled()
    }

    pub fn when_ready(&self) -> Promise<()> {
        self.ready.promise()
    }

    pub fn is_visible(&self) -> bool {
        self.visible.get()
    }

    /// Document-level visibility (foreground/background).
    pub fn set_visible(&self, visible: bool) {
        if self.visible.get() != visible {
            self.visible.set(visible);
            self.visibility_changed.fire(&visible);
        }
    }

    pub fn on_visibility_change(&self, listener: Rc<dyn Fn(&bool)>) -> Unlisten {
        self.visibility_changed.add(listener)
    }

    pub fn supports_pagehide(&self) -> bool {
        self.supports_pagehide.get()
    }

    pub fn set_supports_pagehide(&self, supported: bool) {
        self.supports_pagehide.set(supported);
    }
}

fn camelize(kebab: &str) -> String {
    let mut out = String::with_capacity(kebab.len());
    let mut upper_next = false;
    for c in kebab.chars() {
        if c == '-' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_tree() -> (DocumentHandle, NodeId, NodeId, NodeId) {
        let doc = Document::new("html");
        let section = doc.create_element_with(doc.root(), "section", &[("class", "hero main")]);
        let button = doc.create_element_with(
            section,
            "button",
            &[("id", "cta"), ("data-vars-event-category", "hero")],
        );
        let aside = doc.create_element(doc.root(), "aside");
        (doc, section, button, aside)
    }

    #[test]
    fn containment_is_inclusive_and_directional() {
        let (doc, section, button, aside) = doc_with_tree();
        assert!(doc.contains(doc.root(), button));
        assert!(doc.contains(section, button));
        assert!(doc.contains(button, button));
        assert!(!doc.contains(button, section));
        assert!(!doc.contains(aside, button));
    }

    #[test]
    fn query_and_closest_resolve_by_selector() {
        let (doc, section, button, _) = doc_with_tree();
        let by_id = Selector::parse("#cta").unwrap();
        let by_class = Selector::parse(".hero").unwrap();
        let by_tag = Selector::parse("button").unwrap();

        assert_eq!(doc.query_selector(doc.root(), &by_id), Some(button));
        assert_eq!(doc.query_selector(doc.root(), &by_class), Some(section));
        assert_eq!(doc.query_selector_all(doc.root(), &by_tag), vec![button]);
        assert_eq!(doc.closest(button, &by_class), Some(section));
        assert_eq!(doc.closest(section, &Selector::parse("#cta").unwrap()), None);
    }

    #[test]
    fn data_vars_are_camelized() {
        let (doc, _, button, aside) = doc_with_tree();
        doc.set_attribute(button, "data-vars-sub-total-price", "12");
        let vars = doc.data_vars(button);
        assert_eq!(vars.get("eventCategory").map(String::as_str), Some("hero"));
        assert_eq!(vars.get("subTotalPrice").map(String::as_str), Some("12"));
        assert!(doc.has_data_vars(button));
        assert!(!doc.has_data_vars(aside));
    }

    #[test]
    fn event_hub_delivers_to_type_listeners_only() {
        let (doc, _, button, _) = doc_with_tree();
        let clicks = Rc::new(RefCell::new(Vec::new()));
        let clicks2 = Rc::clone(&clicks);
        let sub = doc.add_event_listener(
            "click",
            Rc::new(move |ev: &DomEvent| clicks2.borrow_mut().push(ev.target)),
        );

        doc.dispatch_event(DomEvent::new(button, "click"));
        doc.dispatch_event(DomEvent::new(button, "keydown"));
        assert_eq!(*clicks.borrow(), vec![button]);

        sub.unlisten();
        doc.dispatch_event(DomEvent::new(button, "click"));
        assert_eq!(clicks.borrow().len(), 1);
    }

    #[test]
    fn signals_resolve_late_and_early_listeners() {
        let (doc, _, button, _) = doc_with_tree();
        let hits = Cell::new(0);
        let hits = Rc::new(hits);

        let hits2 = Rc::clone(&hits);
        doc.when_signal(button, "ini-load").then(move |_| hits2.set(hits2.get() + 1));
        doc.fire_signal(button, "ini-load");
        assert_eq!(hits.get(), 1);

        // Late listener sees the already-fired signal.
        let hits3 = Rc::clone(&hits);
        doc.when_signal(button, "ini-load").then(move |_| hits3.set(hits3.get() + 1));
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn visibility_fires_only_on_change() {
        let (doc, ..) = doc_with_tree();
        let changes = Rc::new(RefCell::new(Vec::new()));
        let changes2 = Rc::clone(&changes);
        doc.on_visibility_change(Rc::new(move |v: &bool| changes2.borrow_mut().push(*v)));

        doc.set_visible(true); // no change
        doc.set_visible(false);
        doc.set_visible(false);
        doc.set_visible(true);
        assert_eq!(*changes.borrow(), vec![false, true]);
    }

    #[test]
    fn embedded_document_links_back_to_host() {
        let parent = Document::new("html");
        let frame = parent.create_element(parent.root(), "iframe");
        let child = Document::new_embedded(&parent, frame, "html");

        assert!(child.is_embedded());
        let (linked, host) = child.embed_link().unwrap();
        assert_eq!(linked.scope_id(), parent.scope_id());
        assert_eq!(host, frame);
        assert!(!parent.is_embedded());
    }
}
