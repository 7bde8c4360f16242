//! The live UI-node tree, the node builder and the renderer interface.

use std::{fmt, rc::Rc};

use smallvec::SmallVec;

use super::super::op::{Event, Prop};
use crate::{
    arena::{Arena, ArenaKey},
    expressions::NodeKind,
    reactive::SignalId,
    value::Closure,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(ArenaKey);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0.index())
    }
}

#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    /// `None` only for the root.
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Label of a `Text` or `Button`.
    pub text: String,
    /// Style class from the registry.
    pub class: Option<String>,
    /// Current contents of an `Input`.
    pub value: String,
    pub placeholder: String,
    /// Signal kept in sync with `value` by a two-way binding.
    pub bound: Option<SignalId>,
    pub handlers: SmallVec<[(Event, Rc<Closure>); 1]>,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            parent: None,
            children: Vec::new(),
            text: String::new(),
            class: None,
            value: String::new(),
            placeholder: String::new(),
            bound: None,
            handlers: SmallVec::new(),
        }
    }

    #[must_use]
    pub fn handler(&self, event: Event) -> Option<&Rc<Closure>> {
        self.handlers.iter().find(|(e, _)| *e == event).map(|(_, h)| h)
    }
}

/// Receives every structural and visual change to the tree.
///
/// Backends (HTML, terminal, DOM) implement this; the VM never renders anything
/// itself.
pub trait Renderer {
    fn create(&mut self, node: NodeId, kind: NodeKind);
    fn attach(&mut self, parent: NodeId, node: NodeId, before: Option<NodeId>);
    fn detach(&mut self, node: NodeId);
    fn set_text(&mut self, node: NodeId, text: &str);
    fn set_class(&mut self, node: NodeId, class: &str);
    fn set_value(&mut self, node: NodeId, value: &str);
    fn set_placeholder(&mut self, _node: NodeId, _placeholder: &str) {}
}

/// Discards every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRenderer;

impl Renderer for NoopRenderer {
    fn create(&mut self, _node: NodeId, _kind: NodeKind) {}
    fn attach(&mut self, _parent: NodeId, _node: NodeId, _before: Option<NodeId>) {}
    fn detach(&mut self, _node: NodeId) {}
    fn set_text(&mut self, _node: NodeId, _text: &str) {}
    fn set_class(&mut self, _node: NodeId, _class: &str) {}
    fn set_value(&mut self, _node: NodeId, _value: &str) {}
}

/// A renderer call, as captured by [`RecordingRenderer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOp {
    Create(NodeId, NodeKind),
    Attach {
        parent: NodeId,
        node: NodeId,
        before: Option<NodeId>,
    },
    Detach(NodeId),
    SetText(NodeId, String),
    SetClass(NodeId, String),
    SetValue(NodeId, String),
    SetPlaceholder(NodeId, String),
}

/// Records every call, for tests and debugging.
#[derive(Debug, Clone, Default)]
pub struct RecordingRenderer {
    pub ops: Vec<RenderOp>,
}

impl Renderer for RecordingRenderer {
    fn create(&mut self, node: NodeId, kind: NodeKind) {
        self.ops.push(RenderOp::Create(node, kind));
    }

    fn attach(&mut self, parent: NodeId, node: NodeId, before: Option<NodeId>) {
        self.ops.push(RenderOp::Attach { parent, node, before });
    }

    fn detach(&mut self, node: NodeId) {
        self.ops.push(RenderOp::Detach(node));
    }

    fn set_text(&mut self, node: NodeId, text: &str) {
        self.ops.push(RenderOp::SetText(node, text.to_owned()));
    }

    fn set_class(&mut self, node: NodeId, class: &str) {
        self.ops.push(RenderOp::SetClass(node, class.to_owned()));
    }

    fn set_value(&mut self, node: NodeId, value: &str) {
        self.ops.push(RenderOp::SetValue(node, value.to_owned()));
    }

    fn set_placeholder(&mut self, node: NodeId, placeholder: &str) {
        self.ops.push(RenderOp::SetPlaceholder(node, placeholder.to_owned()));
    }
}

/// Where the next node is inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insertion {
    pub parent: NodeId,
    /// Insert before this sibling, or append when `None`.
    pub before: Option<NodeId>,
}

/// Explicit stack of insertion points used while building nodes.
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    stack: Vec<Insertion>,
}

impl NodeBuilder {
    #[must_use]
    pub fn new(root: NodeId) -> Self {
        Self {
            stack: vec![Insertion {
                parent: root,
                before: None,
            }],
        }
    }

    #[must_use]
    pub fn current(&self) -> Insertion {
        // the bottom entry is never popped
        self.stack[self.stack.len() - 1]
    }

    /// Makes `parent` the insertion point until the matching [`exit_child`](Self::exit_child).
    pub fn enter_child(&mut self, parent: NodeId) {
        self.stack.push(Insertion { parent, before: None });
    }

    /// Inserts before `anchor` (inside the anchor's parent) until the matching exit.
    pub fn enter_before(&mut self, parent: NodeId, anchor: NodeId) {
        self.stack.push(Insertion {
            parent,
            before: Some(anchor),
        });
    }

    /// Returns `false` if there was nothing to exit.
    pub fn exit_child(&mut self) -> bool {
        if self.stack.len() > 1 {
            self.stack.pop();
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    /// Drops entries above `depth`, used to recover after an aborted render.
    pub fn truncate(&mut self, depth: usize) {
        self.stack.truncate(depth + 1);
    }
}

/// The node tree, rooted at a `Root` node.
#[derive(Debug)]
pub struct NodeTree {
    arena: Arena<Node>,
    root: NodeId,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTree {
    #[must_use]
    pub fn new() -> Self {
        let mut arena = Arena::new();
        let root = NodeId(arena.insert(Node::new(NodeKind::Root)));
        Self { arena, root }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[must_use]
    pub fn get(&self, node: NodeId) -> Option<&Node> {
        self.arena.get(node.0)
    }

    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut Node> {
        self.arena.get_mut(node.0)
    }

    /// Creates a node and inserts it at `at`.
    pub fn insert(&mut self, kind: NodeKind, at: Insertion, renderer: &mut impl Renderer) -> NodeId {
        let node = NodeId(self.arena.insert(Node::new(kind)));
        renderer.create(node, kind);
        if let Some(parent) = self.arena.get_mut(at.parent.0) {
            let position = at
                .before
                .and_then(|before| parent.children.iter().position(|c| *c == before))
                .unwrap_or(parent.children.len());
            parent.children.insert(position, node);
            if let Some(data) = self.arena.get_mut(node.0) {
                data.parent = Some(at.parent);
            }
            renderer.attach(at.parent, node, at.before);
        }
        node
    }

    /// Detaches and frees `node` and anything still below it.
    pub fn remove(&mut self, node: NodeId, renderer: &mut impl Renderer) {
        let Some(data) = self.arena.get(node.0) else {
            return;
        };
        let parent = data.parent;
        if let Some(parent) = parent.and_then(|p| self.arena.get_mut(p.0)) {
            parent.children.retain(|c| *c != node);
        }
        renderer.detach(node);
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if let Some(data) = self.arena.remove(id.0) {
                stack.extend(data.children);
            }
        }
    }

    pub fn set_prop(&mut self, node: NodeId, prop: Prop, text: String, renderer: &mut impl Renderer) {
        let Some(data) = self.arena.get_mut(node.0) else {
            return;
        };
        match prop {
            Prop::Text => {
                if data.text != text {
                    renderer.set_text(node, &text);
                    data.text = text;
                }
            }
            Prop::Value => {
                if data.value != text {
                    renderer.set_value(node, &text);
                    data.value = text;
                }
            }
            Prop::Placeholder => {
                renderer.set_placeholder(node, &text);
                data.placeholder = text;
            }
        }
    }

    /// Number of live nodes, the root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arena.len() <= 1
    }

    /// Live nodes of `kind`.
    #[must_use]
    pub fn count(&self, kind: NodeKind) -> usize {
        self.arena.iter().filter(|(_, node)| node.kind == kind).count()
    }

    /// Nodes in document order (depth first), excluding the root.
    #[must_use]
    pub fn walk(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if id != self.root {
                out.push(id);
            }
            if let Some(node) = self.arena.get(id.0) {
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    /// Text of every `Text` node in document order.
    #[must_use]
    pub fn texts(&self) -> Vec<String> {
        self.walk()
            .into_iter()
            .filter_map(|id| self.get(id))
            .filter(|node| node.kind == NodeKind::Text)
            .map(|node| node.text.clone())
            .collect()
    }

    /// First node of `kind` whose text equals `text`.
    #[must_use]
    pub fn find(&self, kind: NodeKind, text: &str) -> Option<NodeId> {
        self.walk()
            .into_iter()
            .find(|id| self.get(*id).is_some_and(|node| node.kind == kind && node.text == text))
    }

    /// First node of `kind` in document order.
    #[must_use]
    pub fn first(&self, kind: NodeKind) -> Option<NodeId> {
        self.walk()
            .into_iter()
            .find(|id| self.get(*id).is_some_and(|node| node.kind == kind))
    }

    /// Indented outline of the tree, anchors omitted.
    #[must_use]
    pub fn outline(&self) -> String {
        let mut out = String::new();
        self.outline_into(self.root, 0, &mut out);
        out
    }

    fn outline_into(&self, id: NodeId, depth: usize, out: &mut String) {
        let Some(node) = self.get(id) else {
            return;
        };
        if node.kind != NodeKind::Anchor && id != self.root {
            out.push_str(&"  ".repeat(depth));
            out.push_str(&node.kind.to_string());
            if !node.text.is_empty() {
                out.push_str(&format!(" {:?}", node.text));
            }
            if let Some(class) = &node.class {
                out.push_str(&format!(" .{class}"));
            }
            out.push('\n');
        }
        let depth = if id == self.root { depth } else { depth + 1 };
        for child in &node.children {
            self.outline_into(*child, depth, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn insert_before_anchor_keeps_order() {
        let mut tree = NodeTree::new();
        let mut renderer = RecordingRenderer::default();
        let mut builder = NodeBuilder::new(tree.root());
        let anchor = tree.insert(NodeKind::Anchor, builder.current(), &mut renderer);
        let after = tree.insert(NodeKind::Text, builder.current(), &mut renderer);
        tree.set_prop(after, Prop::Text, "after".into(), &mut renderer);

        builder.enter_before(tree.root(), anchor);
        for text in ["a", "b"] {
            let node = tree.insert(NodeKind::Text, builder.current(), &mut renderer);
            tree.set_prop(node, Prop::Text, text.into(), &mut renderer);
        }
        assert!(builder.exit_child());
        assert!(!builder.exit_child());

        assert_eq!(tree.texts(), vec!["a", "b", "after"]);
    }

    #[test]
    fn remove_frees_subtree() {
        let mut tree = NodeTree::new();
        let mut renderer = NoopRenderer;
        let mut builder = NodeBuilder::new(tree.root());
        let column = tree.insert(NodeKind::Column, builder.current(), &mut renderer);
        builder.enter_child(column);
        tree.insert(NodeKind::Text, builder.current(), &mut renderer);
        tree.insert(NodeKind::Button, builder.current(), &mut renderer);
        builder.exit_child();
        assert_eq!(tree.len(), 4);
        tree.remove(column, &mut renderer);
        assert_eq!(tree.len(), 1);
        assert!(tree.get(tree.root()).unwrap().children.is_empty());
    }
}
