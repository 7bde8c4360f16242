//! Lowering of the linked client half to bytecode.
//!
//! The target is a pure stack machine: every expression leaves exactly one value,
//! every statement leaves the operand stack as it found it. Layout of the output:
//! the top-level code of every prepared module (dependencies first) starting at
//! offset 0 and ending with `HALT`, then one body per function in the order the
//! functions were reached.
//!
//! Reactive blocks and binding sub-ranges are compiled inline behind a `JUMP` and
//! run on a fresh operand stack, so they start at depth 0 and end in `BLOCK_END`.

use std::{borrow::Cow, collections::VecDeque, fmt};

use indexmap::{IndexMap, IndexSet};

use crate::{
    bytecode::{Code, CodeBuilder, CodeError, Event, Opcode, Prop},
    expressions::{
        Binding, BlockMode, BoolOperator, Builtin, Call, CallTarget, CmpOperator, Expr, ExprLoc, FStringPart,
        FunctionDef, Identifier, Literal, LocalKind, NodeKind, Operator, Stmt, UnaryOperator,
    },
    intrinsics::Intrinsic,
    parse::CodeRange,
    prepare::{Global, Prepared, evaluate_style},
    style::StyleRegistry,
};

/// Error raised while preparing or compiling client code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The source uses a construct that cannot be compiled where it appears.
    Source {
        module: String,
        position: CodeRange,
        msg: Cow<'static, str>,
    },
    /// The emitted code violates an invariant; a compiler defect.
    Code(CodeError),
}

impl CompileError {
    pub(crate) fn new(module: &str, position: CodeRange, msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Source {
            module: module.to_owned(),
            position,
            msg: msg.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source { module, position, msg } => write!(f, "{module}:{position}: {msg}"),
            Self::Code(err) => write!(f, "internal compiler error: {err}"),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<CodeError> for CompileError {
    fn from(err: CodeError) -> Self {
        Self::Code(err)
    }
}

/// Output of [`compile`].
#[derive(Debug, Clone)]
pub struct Compiled {
    pub code: Code,
    pub styles: StyleRegistry,
    /// Stable names of the server functions the code calls remotely.
    pub remote_functions: Vec<String>,
}

/// Compiles a prepared and linked program.
pub fn compile(prepared: &Prepared) -> Result<Compiled, CompileError> {
    let mut compiler = Compiler {
        builder: CodeBuilder::new(),
        globals: &prepared.globals,
        styles: StyleRegistry::new(),
        remote: IndexSet::new(),
        queue: VecDeque::new(),
        module: "",
        context: Context::default(),
    };

    for module in &prepared.modules {
        compiler.module = &module.name;
        compiler.context = Context {
            render: true,
            blocks: 0,
        };
        compiler.statements(&module.body)?;
    }
    compiler.builder.emit(Opcode::Halt);

    while let Some((module, def)) = compiler.queue.pop_front() {
        compiler.module = module;
        compiler.function(def)?;
    }

    let Compiler {
        builder, styles, remote, ..
    } = compiler;
    Ok(Compiled {
        code: builder.build()?,
        styles,
        remote_functions: remote.into_iter().collect(),
    })
}

#[derive(Debug, Clone, Copy, Default)]
struct Context {
    /// Module top level, component body or a block inside them.
    render: bool,
    /// Reactive blocks the current code is nested in.
    blocks: usize,
}

struct Compiler<'a> {
    builder: CodeBuilder,
    globals: &'a IndexMap<String, Global>,
    styles: StyleRegistry,
    remote: IndexSet<String>,
    /// Functions reached but not emitted yet, with their module.
    queue: VecDeque<(&'a str, &'a FunctionDef)>,
    module: &'a str,
    context: Context,
}

impl<'a> Compiler<'a> {
    fn error(&self, position: CodeRange, msg: impl Into<Cow<'static, str>>) -> CompileError {
        CompileError::new(self.module, position, msg)
    }

    /// Instruction operand naming the variable or signal `ident` refers to.
    fn operand<'i>(&self, ident: &'i Identifier) -> Result<&'i str, CompileError> {
        match &ident.binding {
            Binding::Local(_) | Binding::Capture(_) => Ok(&ident.name),
            Binding::Global(qualified) => Ok(qualified),
            _ => Err(self.error(ident.position, format!("'{}' is not a variable", ident.name))),
        }
    }

    fn argc(&self, count: usize, position: CodeRange) -> Result<u8, CompileError> {
        u8::try_from(count).map_err(|_| self.error(position, "too many arguments"))
    }

    fn statements(&mut self, body: &'a [Stmt]) -> Result<(), CompileError> {
        for stmt in body {
            let depth = self.builder.stack_depth();
            self.statement(stmt)?;
            self.builder.expect_stack_depth(depth);
        }
        Ok(())
    }

    fn statement(&mut self, stmt: &'a Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Import { .. } | Stmt::ImportFrom { .. } | Stmt::Pass => {}
            Stmt::Assign { target, value } => self.assign(target, value)?,
            Stmt::OpAssign { target, op, value } => {
                if matches!(target.binding, Binding::Local(LocalKind::Item)) {
                    return Err(self.error(target.position, "cannot assign to a loop item; write `item.value`"));
                }
                let name = self.operand(target)?;
                self.builder.emit_name(Opcode::LoadVar, name);
                self.expr(value)?;
                self.builder.emit(binary_opcode(*op));
                self.builder.emit_name(Opcode::StoreVar, name);
            }
            Stmt::SignalWrite { target, value } => {
                let name = self.operand(target)?;
                if let Expr::Call(call) = &value.expr
                    && let CallTarget::Remote(function) = &call.target
                {
                    self.remote_call(call, function, Some(name), value.position)?;
                    self.builder.emit(Opcode::Pop);
                } else {
                    self.expr(value)?;
                    self.builder.emit_name(Opcode::StoreSig, name);
                }
            }
            Stmt::SignalOpAssign { target, op, value } => {
                let name = self.operand(target)?;
                self.builder.emit_name(Opcode::LoadSig, name);
                self.expr(value)?;
                self.builder.emit(binary_opcode(*op));
                self.builder.emit_name(Opcode::StoreSig, name);
            }
            Stmt::If {
                test,
                body,
                or_else,
                position,
                mode,
            } => match mode {
                BlockMode::Reactive => self.reactive_if(test, body, or_else, *position)?,
                BlockMode::Plain => self.plain_if(test, body, or_else)?,
                BlockMode::Undecided => return Err(self.error(*position, "conditional was not prepared")),
            },
            Stmt::For {
                target,
                iter,
                body,
                position,
                ..
            } => self.reactive_for(target, iter, body, *position)?,
            Stmt::With { node, body, position } => {
                let Expr::Call(call) = &node.expr else {
                    return Err(self.error(*position, "`with` needs a container node such as `Column()`"));
                };
                match call.target {
                    CallTarget::Node(kind) if kind.is_container() => {
                        self.node(call, kind, node.position)?;
                        self.builder.emit(Opcode::EnterNode);
                        self.statements(body)?;
                        self.builder.emit(Opcode::ExitNode);
                    }
                    _ => return Err(self.error(*position, "`with` needs a container node such as `Column()`")),
                }
            }
            Stmt::FunctionDef(def) => {
                if let Binding::Global(_) = def.name.binding {
                    self.queue.push_back((self.module, def));
                } else {
                    self.closure(def)?;
                    let name = self.operand(&def.name)?;
                    self.builder.emit_name(Opcode::StoreVar, name);
                }
            }
            Stmt::Return { value, position } => {
                if self.context.blocks > 0 {
                    return Err(self.error(*position, "`return` inside a reactive block"));
                }
                match value {
                    Some(value) => self.expr(value)?,
                    None => self.builder.emit(Opcode::PushNone),
                }
                self.builder.emit(Opcode::Return);
            }
            Stmt::Expr(expr) => self.expression_statement(expr)?,
        }
        Ok(())
    }

    fn assign(&mut self, target: &Identifier, value: &'a ExprLoc) -> Result<(), CompileError> {
        if matches!(target.binding, Binding::Local(LocalKind::Item)) {
            return Err(self.error(target.position, "cannot assign to a loop item; write `item.value`"));
        }
        let name = self.operand(target)?;
        if let Expr::Call(call) = &value.expr {
            match call.target {
                CallTarget::Form(Builtin::Signal) => {
                    match call.args.first() {
                        Some(initial) => self.expr(initial)?,
                        None => self.builder.emit(Opcode::PushNone),
                    }
                    self.builder.emit_name(Opcode::InitSig, name);
                    return Ok(());
                }
                CallTarget::Form(Builtin::Computed) => {
                    let derive = call
                        .args
                        .first()
                        .ok_or_else(|| self.error(value.position, "Computed() needs a function"))?;
                    self.expr(derive)?;
                    self.builder.emit_name(Opcode::InitComputed, name);
                    return Ok(());
                }
                _ => {}
            }
        }
        self.expr(value)?;
        self.builder.emit_name(Opcode::StoreVar, name);
        Ok(())
    }

    fn expression_statement(&mut self, expr: &'a ExprLoc) -> Result<(), CompileError> {
        if let Expr::Call(call) = &expr.expr {
            match &call.target {
                CallTarget::Remote(function) => {
                    self.remote_call(call, function, None, expr.position)?;
                    self.builder.emit(Opcode::Pop);
                    return Ok(());
                }
                CallTarget::Component(id) => {
                    if !self.context.render {
                        return Err(self.error(expr.position, "components can only be instantiated in render code"));
                    }
                    self.arguments(call)?;
                    let argc = self.argc(call.args.len(), expr.position)?;
                    self.builder.emit_call(*id, argc);
                    self.builder.emit(Opcode::Pop);
                    return Ok(());
                }
                _ => {}
            }
        }
        self.expr(expr)?;
        self.builder.emit(Opcode::Pop);
        Ok(())
    }

    /// `if` in handler code: ordinary jumps.
    fn plain_if(&mut self, test: &'a ExprLoc, body: &'a [Stmt], or_else: &'a [Stmt]) -> Result<(), CompileError> {
        self.expr(test)?;
        let orelse = self.builder.emit_jump(Opcode::JumpIfFalse);
        let depth = self.builder.stack_depth();
        self.statements(body)?;
        if or_else.is_empty() {
            self.builder.patch_jump(orelse);
        } else {
            let end = self.builder.emit_jump(Opcode::Jump);
            self.builder.patch_jump(orelse);
            self.builder.set_stack_depth(depth);
            self.statements(or_else)?;
            self.builder.expect_stack_depth(depth);
            self.builder.patch_jump(end);
        }
        Ok(())
    }

    /// `IF_BLOCK sig then else; JUMP end; then: ... BLOCK_END; else: ... BLOCK_END; end:`
    fn reactive_if(
        &mut self,
        test: &ExprLoc,
        body: &'a [Stmt],
        or_else: &'a [Stmt],
        position: CodeRange,
    ) -> Result<(), CompileError> {
        let signal = test
            .as_signal_read()
            .ok_or_else(|| self.error(position, "a reactive conditional needs a direct signal read"))?;
        let signal = self.operand(signal)?;
        let (then, orelse) = self.builder.emit_if_block(signal);
        let end = self.builder.emit_jump(Opcode::Jump);
        self.builder.patch_jump(then);
        self.block_body(body)?;
        if or_else.is_empty() {
            self.builder.patch_none(orelse);
        } else {
            self.builder.patch_jump(orelse);
            self.block_body(or_else)?;
        }
        self.builder.patch_jump(end);
        Ok(())
    }

    /// `FOR_BLOCK list item template; JUMP end; template: ... BLOCK_END; end:`
    fn reactive_for(
        &mut self,
        target: &Identifier,
        iter: &ExprLoc,
        body: &'a [Stmt],
        position: CodeRange,
    ) -> Result<(), CompileError> {
        let list = iter
            .as_signal_read()
            .ok_or_else(|| self.error(position, "a reactive iteration needs a direct signal read"))?;
        let list = self.operand(list)?;
        let template = self.builder.emit_for_block(list, &target.name);
        let end = self.builder.emit_jump(Opcode::Jump);
        self.builder.patch_jump(template);
        self.block_body(body)?;
        self.builder.patch_jump(end);
        Ok(())
    }

    /// Body of a reactive block, run by the VM on a fresh stack up to `BLOCK_END`.
    fn block_body(&mut self, body: &'a [Stmt]) -> Result<(), CompileError> {
        let saved = self.builder.stack_depth();
        self.builder.set_stack_depth(0);
        self.context.blocks += 1;
        self.statements(body)?;
        self.context.blocks -= 1;
        self.builder.expect_stack_depth(0);
        self.builder.emit(Opcode::BlockEnd);
        self.builder.set_stack_depth(saved);
        Ok(())
    }

    fn function(&mut self, def: &'a FunctionDef) -> Result<(), CompileError> {
        let id = def
            .id
            .ok_or_else(|| self.error(def.position, format!("function '{}' was not prepared", def.name.name)))?;
        self.builder.place_function(id);

        // the caller pushed captures, then arguments
        let incoming = u16::try_from(def.captures.len() + def.params.len())
            .map_err(|_| self.error(def.position, "too many parameters"))?;
        self.builder.set_stack_depth(incoming);
        for param in def.params.iter().rev() {
            self.builder.emit_name(Opcode::StoreVar, &param.name);
        }
        for capture in def.captures.iter().rev() {
            self.builder.emit_name(Opcode::StoreVar, &capture.name);
        }

        self.context = Context {
            render: def.decorators.component,
            blocks: 0,
        };
        self.statements(&def.body)?;
        if !matches!(def.body.last(), Some(Stmt::Return { .. })) {
            self.builder.emit(Opcode::PushNone);
            self.builder.emit(Opcode::Return);
        }
        Ok(())
    }

    /// Pushes a closure over `def`, copying its captured values from the current scope.
    fn closure(&mut self, def: &'a FunctionDef) -> Result<(), CompileError> {
        let id = def
            .id
            .ok_or_else(|| self.error(def.position, "function was not prepared"))?;
        for capture in &def.captures {
            self.builder.emit_name(Opcode::LoadVar, &capture.name);
        }
        let count = u8::try_from(def.captures.len()).map_err(|_| self.error(def.position, "too many captured variables"))?;
        self.builder.emit_make_closure(id, count);
        self.queue.push_back((self.module, def));
        Ok(())
    }

    fn remote_call(
        &mut self,
        call: &'a Call,
        function: &str,
        target: Option<&str>,
        position: CodeRange,
    ) -> Result<(), CompileError> {
        self.arguments(call)?;
        let argc = self.argc(call.args.len(), position)?;
        self.builder.emit_remote_call(function, argc, target);
        self.remote.insert(function.to_owned());
        Ok(())
    }

    fn arguments(&mut self, call: &'a Call) -> Result<(), CompileError> {
        call.args.iter().try_for_each(|arg| self.expr(arg))
    }

    /// `CREATE_NODE` and its properties; leaves the node on the stack.
    fn node(&mut self, call: &'a Call, kind: NodeKind, position: CodeRange) -> Result<(), CompileError> {
        if !self.context.render {
            return Err(self.error(position, format!("{kind}() can only be used in component or module code")));
        }
        let class = match call.kwarg("style") {
            Some(kwarg) => {
                let style =
                    evaluate_style(&kwarg.value, self.globals).map_err(|msg| self.error(kwarg.value.position, msg))?;
                (!style.is_empty()).then(|| self.styles.register(&style).to_owned())
            }
            None => None,
        };
        self.builder.emit_create_node(kind, class.as_deref());

        if let Some(content) = call.args.first() {
            self.prop(Prop::Text, content)?;
        }
        for kwarg in &call.kwargs {
            match kwarg.name.as_str() {
                "style" => {}
                "placeholder" => self.prop(Prop::Placeholder, &kwarg.value)?,
                "value" => {
                    let signal = match &kwarg.value.expr {
                        Expr::Name(ident) | Expr::ModuleAttr { attr: ident, .. } => self.operand(ident)?,
                        _ => return Err(self.error(kwarg.value.position, "`value=` must name a signal")),
                    };
                    self.builder.emit_name(Opcode::BindValue, signal);
                }
                "on_click" => self.handler(Event::Click, &kwarg.value)?,
                "on_input" => self.handler(Event::Input, &kwarg.value)?,
                other => {
                    return Err(self.error(kwarg.position, format!("unexpected keyword argument '{other}'")));
                }
            }
        }
        Ok(())
    }

    /// Sets a property once, or binds it when the value reads a signal:
    /// `BIND_PROP prop L; JUMP over; L: value BLOCK_END; over:`.
    fn prop(&mut self, prop: Prop, value: &'a ExprLoc) -> Result<(), CompileError> {
        if !value.reads_signal() {
            self.expr(value)?;
            self.builder.emit_set_prop(prop);
            return Ok(());
        }
        let range = self.builder.emit_bind_prop(prop);
        let over = self.builder.emit_jump(Opcode::Jump);
        self.builder.patch_jump(range);
        let saved = self.builder.stack_depth();
        self.builder.set_stack_depth(0);
        self.expr(value)?;
        self.builder.expect_stack_depth(1);
        self.builder.emit(Opcode::BlockEnd);
        self.builder.set_stack_depth(saved);
        self.builder.patch_jump(over);
        Ok(())
    }

    fn handler(&mut self, event: Event, value: &'a ExprLoc) -> Result<(), CompileError> {
        let arity = match &value.expr {
            Expr::Lambda(def) => Some(def.params.len()),
            Expr::Name(ident) | Expr::ModuleAttr { attr: ident, .. } => match &ident.binding {
                Binding::Global(qualified) => match self.globals.get(qualified) {
                    Some(Global::Function { arity, .. }) => Some(*arity),
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        };
        if let Some(arity) = arity
            && arity != event.handler_arity()
        {
            return Err(self.error(
                value.position,
                format!(
                    "on_{event} handler must take {} argument(s), it takes {arity}",
                    event.handler_arity()
                ),
            ));
        }
        self.expr(value)?;
        self.builder.emit_on_event(event);
        Ok(())
    }

    fn load(&mut self, ident: &Identifier) -> Result<(), CompileError> {
        match &ident.binding {
            Binding::Local(LocalKind::Plain) | Binding::Capture(LocalKind::Plain) => {
                self.builder.emit_name(Opcode::LoadVar, &ident.name);
            }
            Binding::Local(LocalKind::Item) | Binding::Capture(LocalKind::Item) => {
                self.builder.emit_name(Opcode::LoadSig, &ident.name);
            }
            Binding::Global(qualified) => match self.globals.get(qualified) {
                Some(Global::Variable) => self.builder.emit_name(Opcode::LoadVar, qualified),
                Some(Global::Function { id, .. }) => self.builder.emit_make_closure(*id, 0),
                _ => return Err(self.error(ident.position, format!("'{}' cannot be used as a value", ident.name))),
            },
            _ => return Err(self.error(ident.position, format!("'{}' cannot be used as a value", ident.name))),
        }
        Ok(())
    }

    fn expr(&mut self, expr: &'a ExprLoc) -> Result<(), CompileError> {
        match &expr.expr {
            Expr::Literal(literal) => match literal {
                Literal::None => self.builder.emit(Opcode::PushNone),
                Literal::Bool(true) => self.builder.emit(Opcode::PushTrue),
                Literal::Bool(false) => self.builder.emit(Opcode::PushFalse),
                Literal::Number(n) => self.builder.emit_num(*n),
                Literal::Str(s) => self.builder.emit_str(s),
            },
            Expr::Name(ident) | Expr::ModuleAttr { attr: ident, .. } => self.load(ident)?,
            Expr::SignalRead(ident) => {
                let name = self.operand(ident)?;
                self.builder.emit_name(Opcode::LoadSig, name);
            }
            Expr::Subscript { object, index } => {
                self.expr(object)?;
                self.expr(index)?;
                self.builder.emit(Opcode::GetItem);
            }
            Expr::List(items) => {
                items.iter().try_for_each(|item| self.expr(item))?;
                let count = u16::try_from(items.len()).map_err(|_| self.error(expr.position, "list literal too long"))?;
                self.builder.emit_u16(Opcode::BuildList, count);
            }
            Expr::Dict(pairs) => {
                for (key, value) in pairs {
                    self.expr(key)?;
                    self.expr(value)?;
                }
                let count = u16::try_from(pairs.len()).map_err(|_| self.error(expr.position, "dict literal too long"))?;
                self.builder.emit_u16(Opcode::BuildMap, count);
            }
            Expr::FString(parts) => {
                for part in parts {
                    match part {
                        FStringPart::Literal(text) => self.builder.emit_str(text),
                        FStringPart::Interpolation(value) => self.expr(value)?,
                    }
                }
                let argc = self.argc(parts.len(), expr.position)?;
                self.builder.emit_call_intrinsic(Intrinsic::Concat, argc);
            }
            Expr::Op { left, op, right } => {
                self.expr(left)?;
                self.expr(right)?;
                self.builder.emit(binary_opcode(*op));
            }
            Expr::Cmp { left, op, right } => {
                self.expr(left)?;
                self.expr(right)?;
                self.builder.emit(compare_opcode(*op));
            }
            Expr::Bool { left, op, right } => {
                self.expr(left)?;
                self.expr(right)?;
                self.builder.emit(match op {
                    BoolOperator::And => Opcode::And,
                    BoolOperator::Or => Opcode::Or,
                });
            }
            Expr::Unary { op, operand } => {
                self.expr(operand)?;
                self.builder.emit(match op {
                    UnaryOperator::Neg => Opcode::Neg,
                    UnaryOperator::Not => Opcode::Not,
                });
            }
            Expr::IfElse { test, body, orelse } => {
                self.expr(test)?;
                let other = self.builder.emit_jump(Opcode::JumpIfFalse);
                let depth = self.builder.stack_depth();
                self.expr(body)?;
                let end = self.builder.emit_jump(Opcode::Jump);
                self.builder.patch_jump(other);
                self.builder.set_stack_depth(depth);
                self.expr(orelse)?;
                self.builder.expect_stack_depth(depth + 1);
                self.builder.patch_jump(end);
            }
            Expr::Call(call) => self.call(call, expr.position)?,
            Expr::Lambda(def) => self.closure(def)?,
        }
        Ok(())
    }

    fn call(&mut self, call: &'a Call, position: CodeRange) -> Result<(), CompileError> {
        match &call.target {
            CallTarget::Intrinsic(intrinsic) => {
                self.arguments(call)?;
                let argc = self.argc(call.args.len(), position)?;
                self.builder.emit_call_intrinsic(*intrinsic, argc);
            }
            CallTarget::Function(id) => {
                self.arguments(call)?;
                let argc = self.argc(call.args.len(), position)?;
                self.builder.emit_call(*id, argc);
            }
            CallTarget::Dynamic => {
                self.expr(&call.callee)?;
                self.arguments(call)?;
                let argc = self.argc(call.args.len(), position)?;
                self.builder.emit_call_value(argc);
            }
            CallTarget::Node(kind) => self.node(call, *kind, position)?,
            CallTarget::Component(_) => {
                return Err(self.error(position, "components can only be instantiated as statements"));
            }
            CallTarget::Remote(function) => {
                return Err(self.error(
                    position,
                    format!("remote call to '{function}' must be a statement or the right side of a signal write"),
                ));
            }
            CallTarget::Form(Builtin::Style | Builtin::Merge) => {
                return Err(self.error(position, "styles can only be passed as `style=`"));
            }
            CallTarget::Form(_) => {
                return Err(self.error(position, "Signal() and Computed() must be assigned directly to a name"));
            }
            CallTarget::Unlinked => return Err(self.error(position, "call was not linked")),
        }
        Ok(())
    }
}

fn binary_opcode(op: Operator) -> Opcode {
    match op {
        Operator::Add => Opcode::Add,
        Operator::Sub => Opcode::Sub,
        Operator::Mul => Opcode::Mul,
        Operator::Div => Opcode::Div,
        Operator::Mod => Opcode::Mod,
    }
}

fn compare_opcode(op: CmpOperator) -> Opcode {
    match op {
        CmpOperator::Eq => Opcode::Eq,
        CmpOperator::NotEq => Opcode::Ne,
        CmpOperator::Lt => Opcode::Lt,
        CmpOperator::LtE => Opcode::Le,
        CmpOperator::Gt => Opcode::Gt,
        CmpOperator::GtE => Opcode::Ge,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        bytecode::{Instruction, Program, encode},
        classify::classify,
        config::BuildConfig,
        graph::ModuleGraph,
        link::link,
        prepare::prepare,
    };

    fn compile_main(source: &str) -> Result<Compiled, CompileError> {
        let config = BuildConfig::default().with_entries(["main"]);
        let graph = ModuleGraph::from_sources(vec![("main".to_owned(), source.to_owned())], &config, None).unwrap();
        let classification = classify(&graph, &config);
        let mut prepared = prepare(&graph, &classification, &config)?;
        link(&mut prepared).unwrap();
        compile(&prepared)
    }

    fn opcodes(compiled: &Compiled) -> Vec<Opcode> {
        let bytes = encode(&compiled.code).unwrap();
        let program = Program::load(&bytes).unwrap();
        program
            .instructions()
            .unwrap()
            .into_iter()
            .map(|(_, instruction)| instruction.opcode())
            .collect()
    }

    #[test]
    fn compound_signal_write_is_load_op_store() {
        let compiled = compile_main("count = Signal(0)\ncount.value += 1\n").unwrap();
        assert_eq!(
            opcodes(&compiled),
            vec![
                Opcode::PushNum,
                Opcode::InitSig,
                Opcode::LoadSig,
                Opcode::PushNum,
                Opcode::Add,
                Opcode::StoreSig,
                Opcode::Halt,
            ]
        );
        assert!(compiled.code.pool.contains(&"main.count".to_owned()));
    }

    #[test]
    fn reactive_if_layout() {
        let compiled = compile_main("flag = Signal(True)\nif flag.value:\n    Text('A')\nelse:\n    Text('B')\n").unwrap();
        let bytes = encode(&compiled.code).unwrap();
        let program = Program::load(&bytes).unwrap();
        let instructions = program.instructions().unwrap();
        let Some((_, Instruction::IfBlock {
            then,
            orelse: Some(orelse),
            ..
        })) = instructions.iter().find(|(_, i)| i.opcode() == Opcode::IfBlock)
        else {
            panic!("expected IF_BLOCK");
        };
        let offsets: Vec<usize> = instructions.iter().map(|(offset, _)| *offset).collect();
        assert!(offsets.contains(&(*then as usize)));
        assert!(offsets.contains(&(*orelse as usize)));
        assert_eq!(
            opcodes(&compiled).iter().filter(|op| **op == Opcode::BlockEnd).count(),
            2
        );
    }

    #[test]
    fn closures_copy_captures_and_bind_them_in_the_prologue() {
        let compiled = compile_main(
            "@component\ndef App():\n    label = 'hi'\n    Button('go', on_click=lambda: print_label(label))\ndef print_label(text):\n    return text\nApp()\n",
        )
        .unwrap();
        let ops = opcodes(&compiled);
        let closure = ops.iter().position(|op| *op == Opcode::MakeClosure).unwrap();
        assert_eq!(ops[closure - 1], Opcode::LoadVar);
        assert_eq!(ops[closure + 1], Opcode::OnEvent);
    }

    #[test]
    fn styles_are_registered_once() {
        let compiled = compile_main(
            "card = Style(padding=8)\nText('a', style=card)\nText('b', style=Style(padding=8))\nText('c', style=merge(card, Style(color='red')))\n",
        )
        .unwrap();
        assert_eq!(compiled.styles.len(), 2);
    }

    #[test]
    fn source_errors_carry_location() {
        let err = compile_main("def f():\n    Text('x')\n").unwrap_err();
        assert_eq!(err.to_string(), "main:2:5: Text() can only be used in component or module code");

        let err = compile_main("items = Signal([])\nfor x in items.value:\n    x = 1\n").unwrap_err();
        assert!(err.to_string().contains("loop item"), "{err}");
    }
}
