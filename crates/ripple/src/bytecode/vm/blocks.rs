//! Reactive blocks, property bindings and scope teardown.
//!
//! An `IF_BLOCK` / `FOR_BLOCK` instruction leaves behind an anchor node, a
//! [`BlockState`] and one effect. Each run of the effect reads the governing signal
//! (the only tracked read), tears down the child scopes of the previous render and
//! executes the selected branch or the template once per list element into fresh
//! child scopes, inserting nodes before the anchor.

use super::{
    BlockBody, BlockId, BlockState, Machine, VmError,
    exec::{Frame, prop_text},
    nodes::{NodeId, Renderer},
    scope::{Resource, ScopeId, ScopeKind},
};
use crate::{
    bytecode::op::Prop,
    expressions::NodeKind,
    reactive::{Reactive, SignalId},
    tracer::VmTracer,
    value::Value,
};

impl<R: Renderer + 'static, T: VmTracer + 'static> Machine<R, T> {
    pub(super) fn start_block(
        &mut self,
        rx: &mut Reactive<Self>,
        scope: ScopeId,
        signal: SignalId,
        body: BlockBody,
    ) -> Result<(), VmError> {
        let anchor = self
            .tree
            .insert(NodeKind::Anchor, self.builder.current(), &mut self.renderer);
        self.scopes.own(scope, Resource::Node(anchor));
        let block = BlockId(self.blocks.insert(BlockState {
            body,
            scope,
            anchor,
            signal,
            children: Vec::new(),
        }));
        self.scopes.own(scope, Resource::Block(block));
        let effect = rx.effect(self, move |rx, m| m.render_block(rx, block))?;
        self.scopes.own(scope, Resource::Effect(effect));
        Ok(())
    }

    fn render_block(&mut self, rx: &mut Reactive<Self>, block: BlockId) -> Result<(), VmError> {
        let Some(state) = self.blocks.get(block.0) else {
            return Ok(());
        };
        let (body, scope, anchor, signal) = (state.body, state.scope, state.anchor, state.signal);

        let value = rx.read(self, signal)?;
        let stale = self
            .blocks
            .get_mut(block.0)
            .map(|state| std::mem::take(&mut state.children))
            .unwrap_or_default();
        for child in stale {
            self.teardown(rx, child);
        }

        let parent = self
            .tree
            .get(anchor)
            .and_then(|node| node.parent)
            .ok_or(VmError::UnknownNode(anchor))?;
        let depth = self.builder.depth();
        self.builder.enter_before(parent, anchor);
        let rendered = rx.untracked(|rx| self.render_body(rx, block, body, scope, value));
        self.builder.truncate(depth);
        let children = rendered?;
        self.tracer.on_block_render(body.kind(), children);
        Ok(())
    }

    /// Builds the children of one render. Returns how many child scopes were made.
    fn render_body(
        &mut self,
        rx: &mut Reactive<Self>,
        block: BlockId,
        body: BlockBody,
        scope: ScopeId,
        value: Value,
    ) -> Result<usize, VmError> {
        match body {
            BlockBody::If { then, orelse } => {
                let Some(addr) = (if value.is_truthy() { Some(then) } else { orelse }) else {
                    return Ok(0);
                };
                let child = self.child_scope(block, ScopeKind::Branch, scope);
                self.exec(rx, addr, Frame::block(child), Vec::new())?;
                Ok(1)
            }
            BlockBody::For { item, template } => {
                let items = match value {
                    Value::List(items) => items,
                    Value::None => return Ok(0),
                    other => {
                        return Err(VmError::Type {
                            ip: template,
                            msg: format!("'{}' object is not iterable", other.type_name()).into(),
                        });
                    }
                };
                for element in items.iter() {
                    let child = self.child_scope(block, ScopeKind::Item, scope);
                    let signal = rx.signal(element.clone());
                    self.scopes.own(child, Resource::Signal(signal));
                    self.scopes.bind(child, item, Value::Signal(signal));
                    self.exec(rx, template, Frame::block(child), Vec::new())?;
                }
                Ok(items.len())
            }
        }
    }

    /// Creates a child scope and records it on the block before anything runs in it,
    /// so a failed render still tears it down.
    fn child_scope(&mut self, block: BlockId, kind: ScopeKind, parent: ScopeId) -> ScopeId {
        let child = self.scopes.create(kind, parent);
        self.tracer.on_scope_enter(child, kind);
        if let Some(state) = self.blocks.get_mut(block.0) {
            state.children.push(child);
        }
        child
    }

    /// Keeps `prop` of `node` equal to the value of the sub-range at `addr`.
    pub(super) fn bind_prop(
        &mut self,
        rx: &mut Reactive<Self>,
        scope: ScopeId,
        node: NodeId,
        prop: Prop,
        addr: usize,
    ) -> Result<(), VmError> {
        let effect = rx.effect(self, move |rx, m| {
            let value = m.exec(rx, addr, Frame::block(scope), Vec::new())?.unwrap_or_default();
            m.tree.set_prop(node, prop, prop_text(&value), &mut m.renderer);
            Ok(())
        })?;
        self.scopes.own(scope, Resource::Effect(effect));
        Ok(())
    }

    /// Signal-to-node half of a two-way binding; [`Vm::input`](super::Vm::input) is
    /// the other half.
    pub(super) fn bind_value(
        &mut self,
        rx: &mut Reactive<Self>,
        scope: ScopeId,
        node: NodeId,
        signal: SignalId,
    ) -> Result<(), VmError> {
        if let Some(data) = self.tree.get_mut(node) {
            data.bound = Some(signal);
        }
        let effect = rx.effect(self, move |rx, m| {
            let value = rx.read(m, signal)?;
            m.tree.set_prop(node, Prop::Value, prop_text(&value), &mut m.renderer);
            Ok(())
        })?;
        self.scopes.own(scope, Resource::Effect(effect));
        Ok(())
    }

    /// Releases everything `scope` owns, newest first, then the scope itself.
    ///
    /// Returns the number of resources released, nested scopes included.
    pub(super) fn teardown(&mut self, rx: &mut Reactive<Self>, scope: ScopeId) -> usize {
        let resources = self.scopes.remove(scope);
        let mut released = resources.len();
        for resource in resources {
            match resource {
                Resource::Node(node) => self.tree.remove(node, &mut self.renderer),
                Resource::Signal(signal) => rx.dispose_signal(signal),
                Resource::Effect(effect) => rx.dispose_effect(effect),
                Resource::Scope(child) => released += self.teardown(rx, child),
                Resource::Block(block) => {
                    if let Some(state) = self.blocks.remove(block.0) {
                        for child in state.children {
                            released += self.teardown(rx, child);
                        }
                    }
                }
                Resource::Remote(call) => {
                    self.pending.remove(&call);
                }
            }
        }
        self.tracer.on_scope_teardown(scope, released);
        released
    }
}
