//! Host node tree.
//!
//! The scheduler never touches a real document. Mounting goes through the
//! [`Host`] trait; [`MemoryHost`] keeps the tree in memory and renders it as
//! markup, which is what tests and headless tools use.

use std::fmt;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::{Error, Result, lock_error};

/// Node handle inside a [`Host`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

/// An event delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: String,
    pub detail: Value,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Callback registered on a host node.
pub type HostListener = Arc<dyn Fn(Event) + Send + Sync>;

/// Node tree the view layer renders into.
pub trait Host: Send + Sync + 'static {
    fn create_element(&self, tag: &str) -> Result<NodeId>;

    fn create_text(&self, text: &str) -> Result<NodeId>;

    /// Transparent container whose children are swapped by a deferred
    /// renderable.
    fn create_slot(&self) -> Result<NodeId>;

    fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<()>;

    /// A node has at most one parent; attaching it elsewhere moves it.
    fn append_child(&self, parent: NodeId, child: NodeId) -> Result<()>;

    fn replace_children(&self, parent: NodeId, children: Vec<NodeId>) -> Result<()>;

    fn add_listener(&self, node: NodeId, event: &str, listener: HostListener) -> Result<()>;

    /// Drop a node and its subtree.
    fn release(&self, node: NodeId) -> Result<()>;
}

enum NodeKind {
    Element(String),
    Text(String),
    Slot,
}

struct MemoryNode {
    kind: NodeKind,
    attributes: Vec<(String, String)>,
    children: Vec<NodeId>,
    listeners: FxHashMap<String, Vec<HostListener>>,
}

impl MemoryNode {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            attributes: Vec::new(),
            children: Vec::new(),
            listeners: FxHashMap::default(),
        }
    }
}

#[derive(Default)]
struct Tree {
    /// Released nodes leave a `None` behind so ids are never reused.
    nodes: Vec<Option<MemoryNode>>,
}

impl Tree {
    fn insert(&mut self, node: MemoryNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(node));
        id
    }

    fn get(&self, id: NodeId) -> Result<&MemoryNode> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::render(format!("unknown {id}")))
    }

    fn get_mut(&mut self, id: NodeId) -> Result<&mut MemoryNode> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::render(format!("unknown {id}")))
    }

    /// Take `child` out of whichever node holds it.
    fn detach(&mut self, child: NodeId) {
        for node in self.nodes.iter_mut().flatten() {
            node.children.retain(|id| *id != child);
        }
    }

    fn write_markup(&self, id: NodeId, out: &mut String) -> Result<()> {
        let node = self.get(id)?;
        match &node.kind {
            NodeKind::Text(text) => out.push_str(text),
            NodeKind::Slot => {
                for child in &node.children {
                    self.write_markup(*child, out)?;
                }
            }
            NodeKind::Element(tag) => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in &node.attributes {
                    let _ = write!(out, " {name}=\"{value}\"");
                }
                out.push('>');
                for child in &node.children {
                    self.write_markup(*child, out)?;
                }
                let _ = write!(out, "</{tag}>");
            }
        }
        Ok(())
    }

    fn write_text(&self, id: NodeId, out: &mut String) -> Result<()> {
        let node = self.get(id)?;
        if let NodeKind::Text(text) = &node.kind {
            out.push_str(text);
        }
        for child in &node.children {
            self.write_text(*child, out)?;
        }
        Ok(())
    }
}

/// In-memory [`Host`].
#[derive(Default)]
pub struct MemoryHost {
    tree: Mutex<Tree>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tree>> {
        self.tree.lock().map_err(lock_error)
    }

    /// Markup of the subtree at `node`. Slots render only their children.
    pub fn render(&self, node: NodeId) -> Result<String> {
        let mut out = String::new();
        self.lock()?.write_markup(node, &mut out)?;
        Ok(out)
    }

    /// Concatenated text content of the subtree at `node`.
    pub fn text(&self, node: NodeId) -> Result<String> {
        let mut out = String::new();
        self.lock()?.write_text(node, &mut out)?;
        Ok(out)
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Result<Option<String>> {
        let tree = self.lock()?;
        Ok(tree
            .get(node)?
            .attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone()))
    }

    /// Live elements with `tag`, oldest first.
    pub fn find_all(&self, tag: &str) -> Result<Vec<NodeId>> {
        let tree = self.lock()?;
        Ok(tree
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, node)| match node {
                Some(MemoryNode {
                    kind: NodeKind::Element(t),
                    ..
                }) if t == tag => Some(NodeId(i)),
                _ => None,
            })
            .collect())
    }

    pub fn find(&self, tag: &str) -> Result<Option<NodeId>> {
        Ok(self.find_all(tag)?.into_iter().next())
    }

    /// Number of nodes not yet released.
    pub fn live_nodes(&self) -> Result<usize> {
        Ok(self.lock()?.nodes.iter().filter(|n| n.is_some()).count())
    }

    /// Deliver `event` to the listeners registered on `node` for its kind.
    /// Returns how many listeners ran.
    pub fn dispatch(&self, node: NodeId, event: Event) -> Result<usize> {
        // Listeners run outside the lock; they may mutate the tree.
        let listeners = {
            let tree = self.lock()?;
            tree.get(node)?
                .listeners
                .get(&event.kind)
                .cloned()
                .unwrap_or_default()
        };
        for listener in &listeners {
            listener(event.clone());
        }
        Ok(listeners.len())
    }
}

impl Host for MemoryHost {
    fn create_element(&self, tag: &str) -> Result<NodeId> {
        Ok(self
            .lock()?
            .insert(MemoryNode::new(NodeKind::Element(tag.to_string()))))
    }

    fn create_text(&self, text: &str) -> Result<NodeId> {
        Ok(self
            .lock()?
            .insert(MemoryNode::new(NodeKind::Text(text.to_string()))))
    }

    fn create_slot(&self) -> Result<NodeId> {
        Ok(self.lock()?.insert(MemoryNode::new(NodeKind::Slot)))
    }

    fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<()> {
        let mut tree = self.lock()?;
        let attributes = &mut tree.get_mut(node)?.attributes;
        match attributes.iter_mut().find(|(key, _)| key == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => attributes.push((name.to_string(), value.to_string())),
        }
        Ok(())
    }

    fn append_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        let mut tree = self.lock()?;
        tree.get(child)?;
        tree.get(parent)?;
        tree.detach(child);
        tree.get_mut(parent)?.children.push(child);
        Ok(())
    }

    fn replace_children(&self, parent: NodeId, children: Vec<NodeId>) -> Result<()> {
        let mut tree = self.lock()?;
        tree.get(parent)?;
        for child in &children {
            tree.detach(*child);
        }
        tree.get_mut(parent)?.children = children;
        Ok(())
    }

    fn add_listener(&self, node: NodeId, event: &str, listener: HostListener) -> Result<()> {
        let mut tree = self.lock()?;
        tree.get_mut(node)?
            .listeners
            .entry(event.to_string())
            .or_default()
            .push(listener);
        Ok(())
    }

    fn release(&self, node: NodeId) -> Result<()> {
        let mut tree = self.lock()?;
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if let Some(slot) = tree.nodes.get_mut(id.0)
                && let Some(released) = slot.take()
            {
                stack.extend(released.children);
            }
        }
        for slot in tree.nodes.iter_mut().flatten() {
            slot.children.retain(|child| *child != node);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_render_markup() {
        let host = MemoryHost::new();
        let ul = host.create_element("ul").unwrap();
        host.set_attribute(ul, "class", "items").unwrap();
        let slot = host.create_slot().unwrap();
        host.append_child(ul, slot).unwrap();
        for text in ["a", "b"] {
            let li = host.create_element("li").unwrap();
            let t = host.create_text(text).unwrap();
            host.append_child(li, t).unwrap();
            host.append_child(slot, li).unwrap();
        }

        assert_eq!(
            host.render(ul).unwrap(),
            r#"<ul class="items"><li>a</li><li>b</li></ul>"#
        );
        assert_eq!(host.text(ul).unwrap(), "ab");
        assert_eq!(host.find_all("li").unwrap().len(), 2);
    }

    #[test]
    fn test_set_attribute_replaces() {
        let host = MemoryHost::new();
        let div = host.create_element("div").unwrap();
        host.set_attribute(div, "data-x", "1").unwrap();
        host.set_attribute(div, "data-x", "2").unwrap();
        assert_eq!(host.attribute(div, "data-x").unwrap().as_deref(), Some("2"));
        assert_eq!(host.render(div).unwrap(), r#"<div data-x="2"></div>"#);
    }

    #[test]
    fn test_release_subtree() {
        let host = MemoryHost::new();
        let root = host.create_element("div").unwrap();
        let child = host.create_element("span").unwrap();
        let text = host.create_text("x").unwrap();
        host.append_child(child, text).unwrap();
        host.append_child(root, child).unwrap();
        assert_eq!(host.live_nodes().unwrap(), 3);

        host.release(child).unwrap();
        assert_eq!(host.live_nodes().unwrap(), 1);
        assert_eq!(host.render(root).unwrap(), "<div></div>");
        assert!(host.render(child).is_err());
    }

    #[test]
    fn test_append_moves_node() {
        let host = MemoryHost::new();
        let old = host.create_element("ul").unwrap();
        let new = host.create_element("ol").unwrap();
        let item = host.create_element("li").unwrap();
        host.append_child(old, item).unwrap();

        host.append_child(new, item).unwrap();
        assert_eq!(host.render(old).unwrap(), "<ul></ul>");
        assert_eq!(host.render(new).unwrap(), "<ol><li></li></ol>");

        // Releasing the former parent leaves the moved node alive.
        host.release(old).unwrap();
        assert_eq!(host.live_nodes().unwrap(), 2);
    }

    #[test]
    fn test_dispatch_by_kind() {
        let host = MemoryHost::new();
        let button = host.create_element("button").unwrap();
        let clicks = Arc::new(AtomicUsize::new(0));
        let counter = clicks.clone();
        host.add_listener(
            button,
            "click",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        assert_eq!(host.dispatch(button, Event::new("click")).unwrap(), 1);
        assert_eq!(host.dispatch(button, Event::new("input")).unwrap(), 0);
        assert_eq!(clicks.load(Ordering::SeqCst), 1);
    }
}
