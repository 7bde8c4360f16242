//! Execution scopes.
//!
//! A scope binds identifiers (pool indices) to values and owns the resources created
//! while it was current. Lookups fall through to the parent. Scopes live in a
//! generational arena, so a [`ScopeId`] held after teardown simply stops resolving;
//! in-flight remote calls use that as their validity token.

use std::fmt;

use ahash::AHashMap;

use super::{BlockId, nodes::NodeId, remote::CallId};
use crate::{
    arena::{Arena, ArenaKey},
    reactive::{EffectId, SignalId},
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(ArenaKey);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope{}", self.0.index())
    }
}

/// Something a scope must release when it is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Node(NodeId),
    Signal(SignalId),
    Effect(EffectId),
    Scope(ScopeId),
    Block(BlockId),
    Remote(CallId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ScopeKind {
    Root,
    /// Active branch of a reactive conditional.
    Branch,
    /// One element of a reactive iteration.
    Item,
    /// A function call.
    Frame,
}

#[derive(Debug)]
pub struct ScopeData {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    bindings: AHashMap<u16, Value>,
    /// Released in reverse order.
    resources: Vec<Resource>,
}

/// All live scopes.
#[derive(Debug)]
pub struct Scopes {
    arena: Arena<ScopeData>,
    root: ScopeId,
}

impl Default for Scopes {
    fn default() -> Self {
        Self::new()
    }
}

impl Scopes {
    #[must_use]
    pub fn new() -> Self {
        let mut arena = Arena::new();
        let root = ScopeId(arena.insert(ScopeData {
            kind: ScopeKind::Root,
            parent: None,
            bindings: AHashMap::new(),
            resources: Vec::new(),
        }));
        Self { arena, root }
    }

    #[must_use]
    pub fn root(&self) -> ScopeId {
        self.root
    }

    pub fn create(&mut self, kind: ScopeKind, parent: ScopeId) -> ScopeId {
        ScopeId(self.arena.insert(ScopeData {
            kind,
            parent: Some(parent),
            bindings: AHashMap::new(),
            resources: Vec::new(),
        }))
    }

    #[must_use]
    pub fn is_alive(&self, scope: ScopeId) -> bool {
        self.arena.contains(scope.0)
    }

    #[must_use]
    pub fn get(&self, scope: ScopeId) -> Option<&ScopeData> {
        self.arena.get(scope.0)
    }

    /// Binds `name` in `scope` itself, shadowing any parent binding.
    pub fn bind(&mut self, scope: ScopeId, name: u16, value: Value) {
        if let Some(data) = self.arena.get_mut(scope.0) {
            data.bindings.insert(name, value);
        }
    }

    /// Looks `name` up through the scope chain.
    #[must_use]
    pub fn lookup(&self, scope: ScopeId, name: u16) -> Option<&Value> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let data = self.arena.get(id.0)?;
            if let Some(value) = data.bindings.get(&name) {
                return Some(value);
            }
            current = data.parent;
        }
        None
    }

    pub fn own(&mut self, scope: ScopeId, resource: Resource) {
        if let Some(data) = self.arena.get_mut(scope.0) {
            data.resources.push(resource);
        }
    }

    /// Forgets a resource that was released some other way.
    pub fn disown(&mut self, scope: ScopeId, resource: Resource) {
        if let Some(data) = self.arena.get_mut(scope.0) {
            data.resources.retain(|r| *r != resource);
        }
    }

    /// Whether `scope` owns nothing and can be dropped without teardown work.
    #[must_use]
    pub fn is_empty(&self, scope: ScopeId) -> bool {
        self.arena.get(scope.0).is_none_or(|data| data.resources.is_empty())
    }

    /// Removes `scope` from the arena and hands back its resources, newest first.
    ///
    /// Owned child scopes are returned as resources too; the caller releases them
    /// recursively.
    pub fn remove(&mut self, scope: ScopeId) -> Vec<Resource> {
        match self.arena.remove(scope.0) {
            Some(data) => data.resources.into_iter().rev().collect(),
            None => Vec::new(),
        }
    }

    /// Number of live scopes, the root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    #[must_use]
    pub fn is_empty_tree(&self) -> bool {
        self.arena.len() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_falls_through_to_parent() {
        let mut scopes = Scopes::new();
        let root = scopes.root();
        let child = scopes.create(ScopeKind::Branch, root);
        scopes.bind(root, 1, Value::Number(1.0));
        scopes.bind(child, 2, Value::Number(2.0));
        assert_eq!(scopes.lookup(child, 1), Some(&Value::Number(1.0)));
        assert_eq!(scopes.lookup(root, 2), None);

        scopes.bind(child, 1, Value::Number(3.0));
        assert_eq!(scopes.lookup(child, 1), Some(&Value::Number(3.0)));
        assert_eq!(scopes.lookup(root, 1), Some(&Value::Number(1.0)));
    }

    #[test]
    fn removed_scope_stops_resolving() {
        let mut scopes = Scopes::new();
        let child = scopes.create(ScopeKind::Item, scopes.root());
        scopes.bind(child, 0, Value::Bool(true));
        scopes.own(child, Resource::Scope(scopes.root()));
        let released = scopes.remove(child);
        assert_eq!(released.len(), 1);
        assert!(!scopes.is_alive(child));
        assert_eq!(scopes.lookup(child, 0), None);
        assert!(scopes.is_empty_tree());
    }
}
