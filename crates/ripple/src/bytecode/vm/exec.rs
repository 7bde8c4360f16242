//! The dispatch loop.

use std::rc::Rc;

use smallvec::SmallVec;

use super::{
    BlockBody, Machine, VmError,
    nodes::{NodeId, Renderer},
    remote::{CallId, PendingCall, RemoteRequest},
    scope::{Resource, ScopeId, ScopeKind},
};
use crate::{
    bytecode::op::{Instruction, Opcode},
    expressions::{CmpOperator, Operator},
    intrinsics::Intrinsic,
    reactive::{Reactive, SignalId},
    resource::ResourceTracker,
    tracer::VmTracer,
    value::{Closure, Map, Value},
};

/// One activation on the frame stack of a dispatch loop.
#[derive(Debug, Clone, Copy)]
pub(super) struct Frame {
    return_ip: usize,
    /// Operand stack height when the frame was entered; the frame may not pop below it.
    base: usize,
    /// Where names are bound.
    scope: ScopeId,
    /// Scope a call frame's scope is handed to if it still owns resources on return.
    attach: ScopeId,
    /// Whether `scope` was created for this frame.
    fresh: bool,
}

impl Frame {
    /// Runs code directly in an existing scope.
    pub(super) fn block(scope: ScopeId) -> Self {
        Self {
            return_ip: 0,
            base: 0,
            scope,
            attach: scope,
            fresh: false,
        }
    }

    pub(super) fn call(return_ip: usize, base: usize, scope: ScopeId, attach: ScopeId) -> Self {
        Self {
            return_ip,
            base,
            scope,
            attach,
            fresh: true,
        }
    }

    /// The render scope resources made by this frame live as long as: closures made
    /// here and remote calls issued here are tied to it.
    fn owner(&self) -> ScopeId {
        if self.fresh { self.attach } else { self.scope }
    }
}

/// Location of the executing instruction, for error construction.
#[derive(Debug, Clone, Copy)]
struct Site {
    ip: usize,
    opcode: Opcode,
}

impl Site {
    fn underflow(self) -> VmError {
        VmError::StackUnderflow {
            ip: self.ip,
            opcode: self.opcode,
        }
    }

    fn type_error(self, msg: impl Into<std::borrow::Cow<'static, str>>) -> VmError {
        VmError::Type {
            ip: self.ip,
            msg: msg.into(),
        }
    }
}

fn pop(stack: &mut Vec<Value>, base: usize, site: Site) -> Result<Value, VmError> {
    if stack.len() <= base {
        return Err(site.underflow());
    }
    stack.pop().ok_or_else(|| site.underflow())
}

fn pop_n(stack: &mut Vec<Value>, base: usize, n: usize, site: Site) -> Result<Vec<Value>, VmError> {
    if stack.len() < base + n {
        return Err(site.underflow());
    }
    Ok(stack.split_off(stack.len() - n))
}

/// The node on top of the stack, left in place.
fn top_node(stack: &[Value], base: usize, site: Site) -> Result<NodeId, VmError> {
    if stack.len() <= base {
        return Err(site.underflow());
    }
    match stack.last() {
        Some(Value::Node(node)) => Ok(*node),
        Some(other) => Err(site.type_error(format!("expected a node, found '{}'", other.type_name()))),
        None => Err(site.underflow()),
    }
}

fn binary(
    stack: &mut Vec<Value>,
    base: usize,
    site: Site,
    resources: &ResourceTracker,
    op: Operator,
) -> Result<(), VmError> {
    let rhs = pop(stack, base, site)?;
    let lhs = pop(stack, base, site)?;
    if let Some(len) = lhs.binary_len(op, &rhs) {
        resources.check_large_result(len)?;
    }
    stack.push(lhs.binary(op, &rhs).map_err(|msg| site.type_error(msg))?);
    Ok(())
}

fn compare(stack: &mut Vec<Value>, base: usize, site: Site, op: CmpOperator) -> Result<(), VmError> {
    let rhs = pop(stack, base, site)?;
    let lhs = pop(stack, base, site)?;
    stack.push(lhs.compare(op, &rhs).map_err(|msg| site.type_error(msg))?);
    Ok(())
}

/// Text shown for a property value; `None` renders as nothing.
pub(super) fn prop_text(value: &Value) -> String {
    match value {
        Value::None => String::new(),
        other => other.to_string(),
    }
}

impl<R: Renderer + 'static, T: VmTracer + 'static> Machine<R, T> {
    /// Runs the dispatch loop from `ip` until the base frame finishes.
    ///
    /// Returns the value left by `RETURN` or `BLOCK_END` in the base frame, or `None`
    /// on `HALT`.
    pub(super) fn exec(
        &mut self,
        rx: &mut Reactive<Self>,
        ip: usize,
        frame: Frame,
        stack: Vec<Value>,
    ) -> Result<Option<Value>, VmError> {
        let saved = self.depth;
        self.depth += 1;
        let result = match self.resources.check_depth(self.depth) {
            Ok(()) => self.dispatch(rx, ip, frame, stack),
            Err(err) => Err(err.into()),
        };
        self.depth = saved;
        result
    }

    fn dispatch(
        &mut self,
        rx: &mut Reactive<Self>,
        mut ip: usize,
        base_frame: Frame,
        mut stack: Vec<Value>,
    ) -> Result<Option<Value>, VmError> {
        let program = Rc::clone(&self.program);
        let code = program.code();
        let mut frames = vec![base_frame];

        loop {
            let Some(&frame) = frames.last() else {
                return Ok(None);
            };
            let (instruction, next) = Instruction::decode(code, ip).map_err(|err| VmError::Malformed {
                ip,
                msg: err.to_string().into(),
            })?;
            let site = Site {
                ip,
                opcode: instruction.opcode(),
            };
            self.resources.on_operation()?;
            self.tracer
                .on_instruction(ip, site.opcode, stack.len().saturating_sub(frame.base), frames.len());
            let base = frame.base;
            let mut next_ip = next;

            match instruction {
                Instruction::Halt => return Ok(None),
                Instruction::PushNum(n) => stack.push(Value::Number(n)),
                Instruction::PushStr(index) => stack.push(Value::from(program.string(index))),
                Instruction::PushTrue => stack.push(Value::Bool(true)),
                Instruction::PushFalse => stack.push(Value::Bool(false)),
                Instruction::PushNone => stack.push(Value::None),
                Instruction::BuildList(n) => {
                    let items = pop_n(&mut stack, base, usize::from(n), site)?;
                    stack.push(Value::from(items));
                }
                Instruction::BuildMap(n) => {
                    let flat = pop_n(&mut stack, base, usize::from(n) * 2, site)?;
                    let mut map = Map::default();
                    for pair in flat.chunks_exact(2) {
                        if let [key, value] = pair {
                            let Value::Str(key) = key else {
                                return Err(site.type_error(format!("dict keys must be str, not '{}'", key.type_name())));
                            };
                            map.insert(Rc::clone(key), value.clone());
                        }
                    }
                    stack.push(Value::Map(Rc::new(map)));
                }
                Instruction::GetItem => {
                    let index = pop(&mut stack, base, site)?;
                    let object = pop(&mut stack, base, site)?;
                    stack.push(object.get_item(&index).map_err(|msg| site.type_error(msg))?);
                }
                Instruction::Pop => {
                    pop(&mut stack, base, site)?;
                }
                Instruction::LoadVar(name) => {
                    let value = self
                        .scopes
                        .lookup(frame.scope, name)
                        .cloned()
                        .ok_or_else(|| self.unknown_name(ip, name))?;
                    stack.push(value);
                }
                Instruction::StoreVar(name) => {
                    let value = pop(&mut stack, base, site)?;
                    self.scopes.bind(frame.scope, name, value);
                }
                Instruction::LoadSig(name) => {
                    let signal = self.resolve_signal(frame.scope, name, ip)?;
                    let value = rx.read(self, signal)?;
                    stack.push(value);
                }
                Instruction::StoreSig(name) => {
                    let value = pop(&mut stack, base, site)?;
                    let signal = self.resolve_signal(frame.scope, name, ip)?;
                    rx.write(self, signal, value)?;
                }
                Instruction::InitSig(name) => {
                    let value = pop(&mut stack, base, site)?;
                    let signal = rx.signal(value);
                    self.scopes.own(frame.scope, Resource::Signal(signal));
                    self.scopes.bind(frame.scope, name, Value::Signal(signal));
                }
                Instruction::InitComputed(name) => {
                    let derive = match pop(&mut stack, base, site)? {
                        Value::Closure(closure) => closure,
                        other => {
                            return Err(VmError::NotCallable {
                                ip,
                                type_name: other.type_name(),
                            });
                        }
                    };
                    let signal = rx.computed(move |rx, m: &mut Self| m.call_closure(rx, &derive, Vec::new()));
                    self.scopes.own(frame.scope, Resource::Signal(signal));
                    self.scopes.bind(frame.scope, name, Value::Signal(signal));
                }
                Instruction::Add => binary(&mut stack, base, site, &self.resources, Operator::Add)?,
                Instruction::Sub => binary(&mut stack, base, site, &self.resources, Operator::Sub)?,
                Instruction::Mul => binary(&mut stack, base, site, &self.resources, Operator::Mul)?,
                Instruction::Div => binary(&mut stack, base, site, &self.resources, Operator::Div)?,
                Instruction::Mod => binary(&mut stack, base, site, &self.resources, Operator::Mod)?,
                Instruction::Neg => match pop(&mut stack, base, site)? {
                    Value::Number(n) => stack.push(Value::Number(-n)),
                    other => {
                        return Err(site.type_error(format!("bad operand type for unary -: '{}'", other.type_name())));
                    }
                },
                Instruction::Not => {
                    let value = pop(&mut stack, base, site)?;
                    stack.push(Value::Bool(!value.is_truthy()));
                }
                Instruction::Eq => compare(&mut stack, base, site, CmpOperator::Eq)?,
                Instruction::Ne => compare(&mut stack, base, site, CmpOperator::NotEq)?,
                Instruction::Lt => compare(&mut stack, base, site, CmpOperator::Lt)?,
                Instruction::Le => compare(&mut stack, base, site, CmpOperator::LtE)?,
                Instruction::Gt => compare(&mut stack, base, site, CmpOperator::Gt)?,
                Instruction::Ge => compare(&mut stack, base, site, CmpOperator::GtE)?,
                Instruction::And => {
                    let rhs = pop(&mut stack, base, site)?;
                    let lhs = pop(&mut stack, base, site)?;
                    stack.push(if lhs.is_truthy() { rhs } else { lhs });
                }
                Instruction::Or => {
                    let rhs = pop(&mut stack, base, site)?;
                    let lhs = pop(&mut stack, base, site)?;
                    stack.push(if lhs.is_truthy() { lhs } else { rhs });
                }
                Instruction::Jump(target) => next_ip = self.jump_target(ip, target)?,
                Instruction::JumpIfFalse(target) => {
                    if !pop(&mut stack, base, site)?.is_truthy() {
                        next_ip = self.jump_target(ip, target)?;
                    }
                }
                Instruction::Call { addr, argc } => {
                    let argc = usize::from(argc);
                    if stack.len() < base + argc {
                        return Err(site.underflow());
                    }
                    let callee = self.enter_call(next, stack.len() - argc, frame.scope, addr)?;
                    frames.push(callee);
                    next_ip = self.jump_target(ip, addr)?;
                }
                Instruction::CallValue { argc } => {
                    let args = pop_n(&mut stack, base, usize::from(argc), site)?;
                    let closure = match pop(&mut stack, base, site)? {
                        Value::Closure(closure) => closure,
                        other => {
                            return Err(VmError::NotCallable {
                                ip,
                                type_name: other.type_name(),
                            });
                        }
                    };
                    let callee_base = stack.len();
                    stack.extend(closure.captures.iter().cloned());
                    stack.extend(args);
                    let callee = self.enter_call(next, callee_base, closure.owner, closure.addr)?;
                    frames.push(callee);
                    next_ip = self.jump_target(ip, closure.addr)?;
                }
                Instruction::CallIntrinsic { intrinsic, argc } => {
                    let args = pop_n(&mut stack, base, usize::from(argc), site)?;
                    if let Some(len) = intrinsic.result_len(&args) {
                        self.resources.check_large_result(len)?;
                    }
                    let result = if intrinsic == Intrinsic::Inject {
                        self.inject(&args, site)?
                    } else {
                        intrinsic.call(&args).map_err(|msg| site.type_error(msg))?
                    };
                    stack.push(result);
                }
                Instruction::MakeClosure { addr, captures } => {
                    let captures = pop_n(&mut stack, base, usize::from(captures), site)?;
                    stack.push(Value::Closure(Rc::new(Closure {
                        addr,
                        captures: SmallVec::from_vec(captures),
                        owner: frame.owner(),
                    })));
                }
                Instruction::Return => {
                    let value = pop(&mut stack, base, site)?;
                    frames.pop();
                    stack.truncate(frame.base);
                    self.finish_frame(rx, &frame);
                    self.tracer.on_return(self.depth);
                    if frames.is_empty() {
                        return Ok(Some(value));
                    }
                    self.depth -= 1;
                    stack.push(value);
                    next_ip = frame.return_ip;
                }
                Instruction::RemoteCall { name, argc, target } => {
                    let args = pop_n(&mut stack, base, usize::from(argc), site)?;
                    let args = args
                        .iter()
                        .map(Value::to_json)
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|msg| VmError::Unserializable { ip, msg })?;
                    let target = match target {
                        Some(target) => Some(self.resolve_signal(frame.scope, target, ip)?),
                        None => None,
                    };
                    let id = CallId(self.next_call);
                    self.next_call += 1;
                    let owner = frame.owner();
                    let function = program.string(name).to_owned();
                    self.tracer.on_remote_call(id, &function);
                    self.outbox.push(RemoteRequest { id, function, args });
                    self.pending.insert(id, PendingCall { owner, target });
                    self.scopes.own(owner, Resource::Remote(id));
                    stack.push(Value::None);
                }
                Instruction::CreateNode { kind, class } => {
                    let node = self.tree.insert(kind, self.builder.current(), &mut self.renderer);
                    if let Some(class) = class {
                        let class = program.string(class);
                        if let Some(data) = self.tree.get_mut(node) {
                            data.class = Some(class.to_owned());
                        }
                        self.renderer.set_class(node, class);
                    }
                    self.scopes.own(frame.scope, Resource::Node(node));
                    stack.push(Value::Node(node));
                }
                Instruction::SetProp(prop) => {
                    let value = pop(&mut stack, base, site)?;
                    let node = top_node(&stack, base, site)?;
                    self.tree.set_prop(node, prop, prop_text(&value), &mut self.renderer);
                }
                Instruction::BindProp { prop, addr } => {
                    let node = top_node(&stack, base, site)?;
                    let addr = self.jump_target(ip, addr)?;
                    self.bind_prop(rx, frame.scope, node, prop, addr)?;
                }
                Instruction::BindValue(name) => {
                    let node = top_node(&stack, base, site)?;
                    let signal = self.resolve_signal(frame.scope, name, ip)?;
                    self.bind_value(rx, frame.scope, node, signal)?;
                }
                Instruction::OnEvent(event) => {
                    let handler = match pop(&mut stack, base, site)? {
                        Value::Closure(closure) => closure,
                        other => {
                            return Err(VmError::NotCallable {
                                ip,
                                type_name: other.type_name(),
                            });
                        }
                    };
                    let node = top_node(&stack, base, site)?;
                    if let Some(data) = self.tree.get_mut(node) {
                        data.handlers.retain(|(e, _)| *e != event);
                        data.handlers.push((event, handler));
                    }
                }
                Instruction::EnterNode => match pop(&mut stack, base, site)? {
                    Value::Node(node) => self.builder.enter_child(node),
                    other => {
                        return Err(site.type_error(format!("cannot nest nodes under '{}'", other.type_name())));
                    }
                },
                Instruction::ExitNode => {
                    if !self.builder.exit_child() {
                        return Err(VmError::Malformed {
                            ip,
                            msg: "EXIT_NODE without a matching ENTER_NODE".into(),
                        });
                    }
                }
                Instruction::IfBlock { signal, then, orelse } => {
                    let signal = self.resolve_signal(frame.scope, signal, ip)?;
                    let then = self.jump_target(ip, then)?;
                    let orelse = orelse.map(|target| self.jump_target(ip, target)).transpose()?;
                    self.start_block(rx, frame.scope, signal, BlockBody::If { then, orelse })?;
                }
                Instruction::ForBlock { list, item, template } => {
                    let signal = self.resolve_signal(frame.scope, list, ip)?;
                    let template = self.jump_target(ip, template)?;
                    self.start_block(rx, frame.scope, signal, BlockBody::For { item, template })?;
                }
                Instruction::BlockEnd => {
                    if frames.len() > 1 {
                        return Err(VmError::Malformed {
                            ip,
                            msg: "BLOCK_END inside a function call".into(),
                        });
                    }
                    return Ok(if stack.len() > base { stack.pop() } else { None });
                }
            }
            ip = next_ip;
        }
    }

    /// Creates the scope of a call frame and accounts for the new depth.
    fn enter_call(&mut self, return_ip: usize, base: usize, attach: ScopeId, addr: u32) -> Result<Frame, VmError> {
        let scope = self.scopes.create(ScopeKind::Frame, self.scopes.root());
        self.tracer.on_scope_enter(scope, ScopeKind::Frame);
        self.depth += 1;
        self.resources.check_depth(self.depth)?;
        self.tracer.on_call(addr, self.depth);
        Ok(Frame::call(return_ip, base, scope, attach))
    }

    /// Disposes of a returning call frame's scope.
    ///
    /// A scope that owns nothing is dropped. One that created signals, nodes or other
    /// resources is handed to the scope the call is attached to, so it lives exactly
    /// as long as that scope; if that scope is already gone it is torn down at once.
    fn finish_frame(&mut self, rx: &mut Reactive<Self>, frame: &Frame) {
        if !frame.fresh {
            return;
        }
        if self.scopes.is_empty(frame.scope) {
            self.scopes.remove(frame.scope);
        } else if self.scopes.is_alive(frame.attach) {
            self.scopes.own(frame.attach, Resource::Scope(frame.scope));
        } else {
            self.teardown(rx, frame.scope);
        }
    }

    fn jump_target(&self, ip: usize, target: u32) -> Result<usize, VmError> {
        let index = target as usize;
        if index < self.program.code().len() {
            Ok(index)
        } else {
            Err(VmError::JumpOutOfRange { ip, target })
        }
    }

    fn resolve_signal(&self, scope: ScopeId, name: u16, ip: usize) -> Result<SignalId, VmError> {
        match self.scopes.lookup(scope, name) {
            Some(Value::Signal(signal)) => Ok(*signal),
            Some(_) => Err(VmError::NotASignal {
                ip,
                name: self.program.string(name).to_owned(),
            }),
            None => Err(self.unknown_name(ip, name)),
        }
    }

    fn unknown_name(&self, ip: usize, name: u16) -> VmError {
        VmError::UnknownName {
            ip,
            name: self.program.string(name).to_owned(),
        }
    }

    fn inject(&self, args: &[Value], site: Site) -> Result<Value, VmError> {
        let [Value::Str(key)] = args else {
            return Err(site.type_error("inject() takes a single string key"));
        };
        let provider = self
            .providers
            .get(key.as_ref())
            .cloned()
            .ok_or_else(|| VmError::MissingProvider(key.to_string()))?;
        Ok(provider())
    }
}
