//! Virtual machine for compiled UI programs.
//!
//! The VM is a pure stack machine. Every invocation of the dispatch loop (program
//! start, a function called from the host, a reactive block re-render, a binding
//! update) owns its operand stack and call frames, so effects may re-enter the
//! loop freely while another invocation is suspended on the Rust stack.
//!
//! Persistent state lives in [`Machine`], which is also the [`Context`] of the
//! reactive graph: effect bodies receive the graph and the machine as two separate
//! borrows and call back into the dispatch loop.

mod blocks;
mod exec;
pub mod nodes;
pub mod remote;
pub mod scope;

use std::{borrow::Cow, fmt, rc::Rc};

use ahash::AHashMap;
use nodes::{NodeBuilder, NodeId, NodeTree, NoopRenderer, Renderer};
use remote::{CallId, Delivery, PendingCall, RemoteError, RemoteRequest, RemoteTransport};
pub use scope::{ScopeId, ScopeKind};
use scope::{Resource, Scopes};

use super::{
    artifact::Program,
    op::{Event, Opcode},
};
use crate::{
    arena::{Arena, ArenaKey},
    reactive::{Context, Reactive, ReactiveError, SignalId},
    resource::{ResourceError, ResourceLimits, ResourceTracker},
    tracer::{NoopTracer, VmTracer},
    value::{Closure, Value},
};

/// Handle to the bookkeeping of one reactive block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(ArenaKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BlockKind {
    If,
    For,
}

/// Fatal runtime error. The VM refuses further turns after returning one.
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// An instruction needed more operands than the frame's stack holds.
    StackUnderflow { ip: usize, opcode: Opcode },
    Malformed { ip: usize, msg: Cow<'static, str> },
    JumpOutOfRange { ip: usize, target: u32 },
    UnknownName { ip: usize, name: String },
    NotASignal { ip: usize, name: String },
    Type { ip: usize, msg: Cow<'static, str> },
    NotCallable { ip: usize, type_name: &'static str },
    /// `inject(key)` found no provider registered under `key`.
    MissingProvider(String),
    /// A remote-call argument has no structured encoding.
    Unserializable { ip: usize, msg: Cow<'static, str> },
    Reactive(ReactiveError),
    Resource(ResourceError),
    UnknownNode(NodeId),
    /// A previous turn failed.
    Poisoned,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackUnderflow { ip, opcode } => write!(f, "at offset {ip}: stack underflow in {opcode}"),
            Self::Malformed { ip, msg } => write!(f, "at offset {ip}: malformed instruction: {msg}"),
            Self::JumpOutOfRange { ip, target } => write!(f, "at offset {ip}: jump target {target} out of range"),
            Self::UnknownName { ip, name } => write!(f, "at offset {ip}: name '{name}' is not bound"),
            Self::NotASignal { ip, name } => write!(f, "at offset {ip}: '{name}' is not a signal"),
            Self::Type { ip, msg } => write!(f, "at offset {ip}: {msg}"),
            Self::NotCallable { ip, type_name } => write!(f, "at offset {ip}: '{type_name}' object is not callable"),
            Self::MissingProvider(key) => write!(f, "no provider registered for '{key}'"),
            Self::Unserializable { ip, msg } => write!(f, "at offset {ip}: {msg}"),
            Self::Reactive(err) => write!(f, "{err}"),
            Self::Resource(err) => write!(f, "{err}"),
            Self::UnknownNode(node) => write!(f, "node {node} does not exist"),
            Self::Poisoned => f.write_str("the VM stopped after an earlier error"),
        }
    }
}

impl std::error::Error for VmError {}

impl From<ReactiveError> for VmError {
    fn from(err: ReactiveError) -> Self {
        Self::Reactive(err)
    }
}

impl From<ResourceError> for VmError {
    fn from(err: ResourceError) -> Self {
        Self::Resource(err)
    }
}

/// Host function resolved by `inject(key)`.
pub type Provider = Rc<dyn Fn() -> Value>;

/// What a reactive block renders.
#[derive(Debug, Clone, Copy)]
enum BlockBody {
    /// Code offsets of the two branches.
    If { then: usize, orelse: Option<usize> },
    /// `item` is the pool index the loop variable binds; `template` runs once per item.
    For { item: u16, template: usize },
}

#[derive(Debug)]
struct BlockState {
    body: BlockBody,
    /// Scope the block was executed in; parent of every child scope.
    scope: ScopeId,
    /// Placeholder node; rendered children are inserted just before it.
    anchor: NodeId,
    /// Computed condition (`if`) or list (`for`) the block re-renders on.
    signal: SignalId,
    /// Child scopes of the current render, in order.
    children: Vec<ScopeId>,
}

impl BlockBody {
    fn kind(self) -> BlockKind {
        match self {
            Self::If { .. } => BlockKind::If,
            Self::For { .. } => BlockKind::For,
        }
    }
}

/// Persistent VM state, and the context type of the reactive graph.
pub struct Machine<R: Renderer, T: VmTracer> {
    /// Shared with closures that re-enter the dispatch loop from effects.
    program: Rc<Program>,
    /// Binding environments and the resources each one releases on teardown.
    scopes: Scopes,
    tree: NodeTree,
    /// Where the next created node is attached.
    builder: NodeBuilder,
    /// Live `if` and `for` blocks.
    blocks: Arena<BlockState>,
    renderer: R,
    tracer: T,
    /// Operation, depth and collection-size budget for the current turn.
    resources: ResourceTracker,
    /// Host functions for `inject(key)`.
    providers: AHashMap<String, Provider>,
    /// Requests issued but not yet taken by the host.
    outbox: Vec<RemoteRequest>,
    /// Issued calls whose response is still outstanding.
    pending: AHashMap<CallId, PendingCall>,
    next_call: u64,
    /// Frames plus nested block executions currently on the Rust stack.
    depth: usize,
}

impl<R: Renderer, T: VmTracer> fmt::Debug for Machine<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("scopes", &self.scopes.len())
            .field("nodes", &self.tree.len())
            .field("blocks", &self.blocks.len())
            .field("pending", &self.pending.len())
            .field("tracer", &self.tracer)
            .finish_non_exhaustive()
    }
}

impl<R: Renderer, T: VmTracer> Context for Machine<R, T> {
    type Value = Value;
    type Error = VmError;
}

/// A loaded program with its live node tree.
///
/// ```text
/// let mut vm = Vm::new(program);
/// vm.run()?;
/// vm.set("main.count", Value::Number(3.0))?;
/// ```
pub struct Vm<R: Renderer + 'static = NoopRenderer, T: VmTracer + 'static = NoopTracer> {
    /// Signals, computed values and effects, borrowed alongside `machine` while
    /// effects run.
    rx: Reactive<Machine<R, T>>,
    machine: Machine<R, T>,
    /// Set by the first failed turn; every later turn returns [`VmError::Poisoned`].
    poisoned: bool,
}

impl<R: Renderer + 'static, T: VmTracer + 'static> fmt::Debug for Vm<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("machine", &self.machine)
            .field("reactive", &self.rx)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl Vm {
    /// Creates a VM with no renderer, no tracer and the default limits.
    #[must_use]
    pub fn new(program: Program) -> Self {
        Self::with_parts(program, NoopRenderer, NoopTracer, ResourceLimits::new())
    }
}

impl<R: Renderer + 'static> Vm<R, NoopTracer> {
    #[must_use]
    pub fn with_renderer(program: Program, renderer: R) -> Self {
        Self::with_parts(program, renderer, NoopTracer, ResourceLimits::new())
    }
}

impl<R: Renderer + 'static, T: VmTracer + 'static> Vm<R, T> {
    #[must_use]
    pub fn with_parts(program: Program, renderer: R, tracer: T, limits: ResourceLimits) -> Self {
        let tree = NodeTree::new();
        let builder = NodeBuilder::new(tree.root());
        Self {
            rx: Reactive::new(limits.reactive),
            machine: Machine {
                program: Rc::new(program),
                scopes: Scopes::new(),
                tree,
                builder,
                blocks: Arena::new(),
                renderer,
                tracer,
                resources: ResourceTracker::new(limits),
                providers: AHashMap::new(),
                outbox: Vec::new(),
                pending: AHashMap::new(),
                next_call: 0,
                depth: 0,
            },
            poisoned: false,
        }
    }

    /// Registers the provider `inject(key)` resolves to.
    pub fn provide(&mut self, key: impl Into<String>, provider: impl Fn() -> Value + 'static) {
        self.machine.providers.insert(key.into(), Rc::new(provider));
    }

    /// Executes the program from offset 0 until `HALT`.
    pub fn run(&mut self) -> Result<(), VmError> {
        self.turn(|rx, m| {
            let root = m.scopes.root();
            rx.batch(m, |rx, m| m.exec(rx, 0, exec::Frame::block(root), Vec::new()))
                .map(drop)
        })
    }

    /// Runs one host-initiated turn; any error poisons the VM.
    fn turn<X>(
        &mut self,
        f: impl FnOnce(&mut Reactive<Machine<R, T>>, &mut Machine<R, T>) -> Result<X, VmError>,
    ) -> Result<X, VmError> {
        if self.poisoned {
            return Err(VmError::Poisoned);
        }
        self.machine.resources.start_turn();
        let result = f(&mut self.rx, &mut self.machine);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    /// Resolves a root-scope name (`module.name` for module globals) to a signal.
    #[must_use]
    pub fn signal(&self, name: &str) -> Option<SignalId> {
        let index = self.machine.program.pool().iter().position(|entry| entry == name)?;
        let index = u16::try_from(index).ok()?;
        match self.machine.scopes.lookup(self.machine.scopes.root(), index) {
            Some(Value::Signal(id)) => Some(*id),
            _ => None,
        }
    }

    /// Current value of the named signal, without recomputing stale computed values.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<Value> {
        self.signal(name).and_then(|id| self.rx.peek(id).cloned())
    }

    /// Reads a signal, recomputing it if needed.
    pub fn read(&mut self, id: SignalId) -> Result<Value, VmError> {
        self.turn(|rx, m| rx.untracked(|rx| rx.read(m, id)))
    }

    /// Writes a signal and runs the effects that depend on it.
    pub fn write(&mut self, id: SignalId, value: Value) -> Result<bool, VmError> {
        self.turn(|rx, m| rx.write(m, id, value))
    }

    /// [`write`](Self::write) by name.
    pub fn set(&mut self, name: &str, value: Value) -> Result<bool, VmError> {
        let id = self.signal(name).ok_or_else(|| VmError::UnknownName {
            ip: 0,
            name: name.to_owned(),
        })?;
        self.write(id, value)
    }

    /// Dispatches a click to `node`. Returns whether a handler ran.
    ///
    /// A node already removed by a re-render is ignored: the host may still be
    /// delivering events for it.
    pub fn click(&mut self, node: NodeId) -> Result<bool, VmError> {
        if !self.poisoned && self.machine.tree.get(node).is_none() {
            return Ok(false);
        }
        self.turn(|rx, m| {
            let handler = m.tree.get(node).ok_or(VmError::UnknownNode(node))?.handler(Event::Click).cloned();
            let Some(handler) = handler else {
                return Ok(false);
            };
            rx.batch(m, |rx, m| m.call_closure(rx, &handler, Vec::new()))?;
            Ok(true)
        })
    }

    /// Delivers text typed into an input node.
    ///
    /// The node's value is updated first, then the bound signal is written and the
    /// `on_input` handler called, all in one batch. The binding effect that follows
    /// sees the value it would set already in place and does nothing. Input for a
    /// removed node is dropped.
    pub fn input(&mut self, node: NodeId, text: &str) -> Result<(), VmError> {
        if !self.poisoned && self.machine.tree.get(node).is_none() {
            return Ok(());
        }
        self.turn(|rx, m| {
            rx.batch(m, |rx, m| {
                let data = m.tree.get_mut(node).ok_or(VmError::UnknownNode(node))?;
                text.clone_into(&mut data.value);
                let bound = data.bound;
                let handler = data.handler(Event::Input).cloned();
                if let Some(signal) = bound {
                    rx.write(m, signal, Value::from(text))?;
                }
                if let Some(handler) = handler {
                    m.call_closure(rx, &handler, vec![Value::from(text)])?;
                }
                Ok(())
            })
        })
    }

    /// Takes every request queued since the last call.
    pub fn take_requests(&mut self) -> Vec<RemoteRequest> {
        std::mem::take(&mut self.machine.outbox)
    }

    /// Hands the outcome of a remote call back to the program.
    ///
    /// The result (or an `Error` value on failure) is written into the call's target
    /// signal. Responses for unknown calls, or for calls whose issuing scope or target
    /// signal has been torn down, are dropped.
    pub fn resolve_remote(
        &mut self,
        id: CallId,
        result: Result<serde_json::Value, RemoteError>,
    ) -> Result<Delivery, VmError> {
        self.turn(|rx, m| {
            let Some(call) = m.pending.remove(&id) else {
                m.tracer.on_remote_discard(id);
                return Ok(Delivery::Discarded);
            };
            m.scopes.disown(call.owner, Resource::Remote(id));
            if !m.scopes.is_alive(call.owner) || call.target.is_some_and(|target| !rx.is_alive(target)) {
                m.tracer.on_remote_discard(id);
                return Ok(Delivery::Discarded);
            }
            if let Some(target) = call.target {
                let value = match result {
                    Ok(json) => Value::from_json(&json),
                    Err(err) => Value::Error(Rc::new(err)),
                };
                rx.write(m, target, value)?;
            }
            Ok(Delivery::Delivered)
        })
    }

    /// Sends every queued request through `transport` and delivers the responses,
    /// repeating until no new requests are queued. Returns the number of calls made.
    pub fn pump(&mut self, transport: &mut impl RemoteTransport) -> Result<usize, VmError> {
        let mut calls = 0;
        loop {
            let requests = self.take_requests();
            if requests.is_empty() {
                return Ok(calls);
            }
            for request in requests {
                calls += 1;
                let result = transport.call(&request);
                self.resolve_remote(request.id, result)?;
            }
        }
    }

    /// Calls still waiting for a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.machine.pending.len()
    }

    #[must_use]
    pub fn tree(&self) -> &NodeTree {
        &self.machine.tree
    }

    #[must_use]
    pub fn renderer(&self) -> &R {
        &self.machine.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.machine.renderer
    }

    #[must_use]
    pub fn tracer(&self) -> &T {
        &self.machine.tracer
    }

    #[must_use]
    pub fn program(&self) -> &Program {
        &self.machine.program
    }

    /// Live scopes, the root included.
    #[must_use]
    pub fn scope_count(&self) -> usize {
        self.machine.scopes.len()
    }

    #[must_use]
    pub fn signal_count(&self) -> usize {
        self.rx.signal_count()
    }

    #[must_use]
    pub fn effect_count(&self) -> usize {
        self.rx.effect_count()
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Consumes the VM, returning its renderer and tracer.
    pub fn into_parts(self) -> (R, T) {
        (self.machine.renderer, self.machine.tracer)
    }
}

impl<R: Renderer + 'static, T: VmTracer + 'static> Machine<R, T> {
    /// Calls a closure value with `args` in a fresh frame and returns its result.
    fn call_closure(
        &mut self,
        rx: &mut Reactive<Self>,
        closure: &Rc<Closure>,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        let root = self.scopes.root();
        let scope = self.scopes.create(ScopeKind::Frame, root);
        self.tracer.on_scope_enter(scope, ScopeKind::Frame);
        let mut stack: Vec<Value> = closure.captures.iter().cloned().collect();
        stack.extend(args);
        let frame = exec::Frame::call(0, 0, scope, closure.owner);
        self.tracer.on_call(closure.addr, self.depth + 1);
        let result = self.exec(rx, closure.addr as usize, frame, stack)?;
        Ok(result.unwrap_or_default())
    }
}
