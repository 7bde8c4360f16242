//! Name resolution over the client half of the program.
//!
//! Preparation decides, for every identifier of code that will be compiled, what it
//! refers to ([`Binding`]), numbers every function, records closure captures,
//! marks each `if` / `for` as a reactive block or plain control flow and evaluates
//! module-level style constants.
//!
//! Scoping follows the runtime scope tree: names assigned anywhere in a function
//! body are local to it (so a closure may refer to a name assigned after it),
//! names assigned inside a reactive block are local to that block, and everything
//! else falls back to the module's globals, its imports and finally the prelude.

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    classify::{Classification, ModuleClass, Origin},
    compiler::CompileError,
    config::BuildConfig,
    expressions::{
        Binding, BlockMode, Builtin, Call, Decorators, Expr, ExprLoc, FStringPart, FuncId, FunctionDef, Identifier, Literal,
        LocalKind, NodeKind, Stmt, UnaryOperator,
    },
    graph::ModuleGraph,
    intrinsics::Intrinsic,
    parse::{CodeRange, ParsedModule},
    style::{Style, StyleValue, merge},
};

/// Import chains longer than this are treated as unresolvable (they can only be cycles).
const MAX_IMPORT_CHAIN: usize = 32;

/// What a qualified global name refers to.
#[derive(Debug, Clone, PartialEq)]
pub enum Global {
    /// Client function compiled into the artifact.
    Function { id: FuncId, arity: usize, component: bool },
    /// `@rpc` function, reachable only through a remote call.
    Remote { arity: usize },
    /// Server-only function; never linked.
    ServerFunction,
    Variable,
    /// Module-level style constant, evaluated at compile time.
    Style(Style),
    /// Name bound by importing an external module or one of its members.
    External { module: String },
}

#[derive(Debug, Clone)]
pub struct PreparedModule {
    pub name: String,
    /// Top-level statements that run on the client, and the client functions of
    /// the module. Server functions and style constants are removed.
    pub body: Vec<Stmt>,
}

/// The resolved client half of a program.
#[derive(Debug, Clone, Default)]
pub struct Prepared {
    /// Modules in initialization order: every module after the modules it imports.
    pub modules: Vec<PreparedModule>,
    /// Keyed by qualified name, `module.symbol`.
    pub globals: IndexMap<String, Global>,
    pub function_count: u32,
}

impl Prepared {
    #[must_use]
    pub fn global(&self, qualified: &str) -> Option<&Global> {
        self.globals.get(qualified)
    }
}

/// Looks a prelude name up.
#[must_use]
pub fn builtin(name: &str) -> Option<Builtin> {
    let builtin = match name {
        "Signal" => Builtin::Signal,
        "Computed" => Builtin::Computed,
        "Style" => Builtin::Style,
        "merge" => Builtin::Merge,
        "component" | "server" | "rpc" | "client" => Builtin::Decorator,
        _ => {
            if let Ok(kind) = name.parse::<NodeKind>()
                && kind.is_constructible()
            {
                Builtin::Node(kind)
            } else {
                Builtin::Intrinsic(Intrinsic::from_name(name)?)
            }
        }
    };
    Some(builtin)
}

/// Resolves names over every module the client half needs.
///
/// Client modules contribute all their client code; server modules contribute only
/// the functions they declare `@client`.
pub fn prepare(
    graph: &ModuleGraph,
    classification: &Classification,
    config: &BuildConfig,
) -> Result<Prepared, CompileError> {
    let tables = Tables::new(graph, classification, config);
    let mut prepared = Prepared {
        globals: tables.initial_globals(),
        ..Prepared::default()
    };

    for name in graph.dependency_order() {
        let Some(Ok(parsed)) = graph.get(name).map(|module| &module.parsed) else {
            continue;
        };
        let mut body = match classification.module(name) {
            ModuleClass::Client => client_body(parsed, classification),
            ModuleClass::Server => parsed
                .body
                .iter()
                .filter(|stmt| matches!(stmt, Stmt::FunctionDef(def) if def.decorators.client))
                .cloned()
                .collect(),
            ModuleClass::Shared | ModuleClass::Unknown => continue,
        };
        if body.is_empty() {
            continue;
        }

        let mut resolver = Resolver {
            tables: &tables,
            module: name,
            frames: vec![FrameEnv::module()],
            next_function: &mut prepared.function_count,
            globals: &mut prepared.globals,
        };
        for stmt in &mut body {
            resolver.top_level(stmt)?;
        }
        body.retain(|stmt| !is_style_constant(stmt, &prepared.globals));
        prepared.modules.push(PreparedModule {
            name: name.to_owned(),
            body,
        });
    }
    Ok(prepared)
}

/// Body of a client module without its server functions.
fn client_body(parsed: &ParsedModule, classification: &Classification) -> Vec<Stmt> {
    parsed
        .body
        .iter()
        .filter(|stmt| match stmt {
            Stmt::FunctionDef(def) => {
                classification.origin(&format!("{}.{}", parsed.name, def.name.name)) == Origin::Client
            }
            _ => true,
        })
        .cloned()
        .collect()
}

fn is_style_constant(stmt: &Stmt, globals: &IndexMap<String, Global>) -> bool {
    match stmt {
        Stmt::Assign { target, .. } => match &target.binding {
            Binding::Global(qualified) => matches!(globals.get(qualified), Some(Global::Style(_))),
            _ => false,
        },
        _ => false,
    }
}

/// Evaluates a compile-time style expression: `Style(...)`, `merge(a, b)` or the
/// name of a style constant.
pub fn evaluate_style(expr: &ExprLoc, globals: &IndexMap<String, Global>) -> Result<Style, String> {
    match &expr.expr {
        Expr::Call(call) => match callee_binding(call) {
            Some(Binding::Builtin(Builtin::Style)) => {
                if !call.args.is_empty() {
                    return Err("Style() takes keyword arguments only".to_owned());
                }
                let mut style = Style::default();
                for kwarg in &call.kwargs {
                    let value = match &kwarg.value.expr {
                        Expr::Literal(Literal::Number(n)) => StyleValue::Number(*n),
                        Expr::Literal(Literal::Str(s)) => StyleValue::Str(s.clone()),
                        Expr::Unary {
                            op: UnaryOperator::Neg,
                            operand,
                        } => match &operand.expr {
                            Expr::Literal(Literal::Number(n)) => StyleValue::Number(-n),
                            _ => return Err(format!("style property '{}' must be a literal", kwarg.name)),
                        },
                        _ => return Err(format!("style property '{}' must be a literal", kwarg.name)),
                    };
                    style.set(&kwarg.name, value).map_err(|err| err.to_string())?;
                }
                Ok(style)
            }
            Some(Binding::Builtin(Builtin::Merge)) => match call.args.as_slice() {
                [base, over] if call.kwargs.is_empty() => {
                    Ok(merge(&evaluate_style(base, globals)?, &evaluate_style(over, globals)?))
                }
                _ => Err("merge() takes exactly two styles".to_owned()),
            },
            _ => Err("a style must be Style(...), merge(...) or a style constant".to_owned()),
        },
        Expr::Name(ident) | Expr::ModuleAttr { attr: ident, .. } => match &ident.binding {
            Binding::Global(qualified) => match globals.get(qualified) {
                Some(Global::Style(style)) => Ok(style.clone()),
                _ => Err(format!("'{}' is not a style constant", ident.name)),
            },
            _ => Err(format!("'{}' is not a style constant", ident.name)),
        },
        _ => Err("a style must be Style(...), merge(...) or a style constant".to_owned()),
    }
}

/// Binding of a call's callee when it is a plain or module-qualified name.
#[must_use]
pub fn callee_binding(call: &Call) -> Option<&Binding> {
    match &call.callee.expr {
        Expr::Name(ident) | Expr::ModuleAttr { attr: ident, .. } => Some(&ident.binding),
        _ => None,
    }
}

/// Module-level names of one module.
#[derive(Debug)]
enum NameDef {
    Function,
    Variable,
    /// `import module as name`
    Module(String),
    /// `from module import original as name`
    From { module: String, original: String },
}

/// Module-level name tables of every parsed module, used to follow imports.
struct Tables<'a> {
    modules: AHashMap<&'a str, IndexMap<&'a str, NameDef>>,
    graph: &'a ModuleGraph,
    classification: &'a Classification,
    config: &'a BuildConfig,
}

impl<'a> Tables<'a> {
    fn new(graph: &'a ModuleGraph, classification: &'a Classification, config: &'a BuildConfig) -> Self {
        let mut modules = AHashMap::new();
        for module in graph.modules() {
            let Ok(parsed) = &module.parsed else {
                continue;
            };
            let mut names = IndexMap::new();
            for stmt in &parsed.body {
                match stmt {
                    Stmt::FunctionDef(def) => {
                        names.entry(def.name.name.as_str()).or_insert(NameDef::Function);
                    }
                    Stmt::Assign { target, .. } | Stmt::OpAssign { target, .. } => {
                        names.insert(target.name.as_str(), NameDef::Variable);
                    }
                    Stmt::Import { names: imported, .. } => {
                        for import in imported {
                            names.insert(import.alias.name.as_str(), NameDef::Module(import.name.clone()));
                        }
                    }
                    Stmt::ImportFrom {
                        module, names: imported, ..
                    } => {
                        for import in imported {
                            names.insert(
                                import.alias.name.as_str(),
                                NameDef::From {
                                    module: module.clone(),
                                    original: import.name.clone(),
                                },
                            );
                        }
                    }
                    _ => {}
                }
            }
            modules.insert(module.name.as_str(), names);
        }
        Self {
            modules,
            graph,
            classification,
            config,
        }
    }

    /// Globals known before any code is resolved: server and remote functions,
    /// variables and external imports of every module.
    fn initial_globals(&self) -> IndexMap<String, Global> {
        let mut globals = IndexMap::new();
        for module in self.graph.modules() {
            let Ok(parsed) = &module.parsed else {
                continue;
            };
            for stmt in &parsed.body {
                match stmt {
                    Stmt::FunctionDef(def) => {
                        let qualified = format!("{}.{}", module.name, def.name.name);
                        if def.decorators.rpc {
                            globals.insert(
                                qualified,
                                Global::Remote {
                                    arity: def.params.len(),
                                },
                            );
                        } else if self.classification.origin(&qualified) == Origin::Server {
                            globals.insert(qualified, Global::ServerFunction);
                        }
                    }
                    Stmt::Assign { target, .. } | Stmt::OpAssign { target, .. } => {
                        globals.insert(format!("{}.{}", module.name, target.name), Global::Variable);
                    }
                    Stmt::Import { names, .. } => {
                        for import in names.iter().filter(|import| self.is_external(&import.name)) {
                            globals.insert(
                                format!("{}.{}", module.name, import.alias.name),
                                Global::External {
                                    module: import.name.clone(),
                                },
                            );
                        }
                    }
                    Stmt::ImportFrom {
                        module: source, names, ..
                    } if self.is_external(source) => {
                        for import in names {
                            globals.insert(
                                format!("{}.{}", module.name, import.alias.name),
                                Global::External { module: source.clone() },
                            );
                        }
                    }
                    _ => {}
                }
            }
        }
        globals
    }

    fn is_external(&self, module: &str) -> bool {
        !self.graph.contains(module) && !self.config.is_prelude(module)
    }

    /// Resolves a module-level name of `module`, following imports to the module
    /// that defines the symbol.
    fn global(&self, module: &str, name: &str, depth: usize) -> Binding {
        let Some(def) = self.modules.get(module).and_then(|names| names.get(name)) else {
            return if depth == 0 {
                builtin(name).map_or(Binding::Unresolved, Binding::Builtin)
            } else {
                Binding::Unresolved
            };
        };
        match def {
            NameDef::Function | NameDef::Variable => Binding::Global(format!("{module}.{name}")),
            NameDef::Module(target) => Binding::Module(target.clone()),
            NameDef::From {
                module: source,
                original,
            } => {
                if self.config.is_prelude(source) {
                    builtin(original).map_or(Binding::Unresolved, Binding::Builtin)
                } else if !self.graph.contains(source) {
                    Binding::Global(format!("{module}.{name}"))
                } else if depth >= MAX_IMPORT_CHAIN {
                    Binding::Unresolved
                } else {
                    self.global(source, original, depth + 1)
                }
            }
        }
    }

    /// Resolves `alias.attr` where `alias` is bound to `target` in `module`.
    fn attribute(&self, module: &str, alias: &str, target: &str, attr: &str) -> Binding {
        if self.config.is_prelude(target) {
            builtin(attr).map_or(Binding::Unresolved, Binding::Builtin)
        } else if self.graph.contains(target) {
            self.global(target, attr, 1)
        } else {
            Binding::Global(format!("{module}.{alias}"))
        }
    }
}

/// Locals of one function, or of the module's top level (frame 0).
struct FrameEnv {
    /// Innermost last. For the module frame the first scope is empty: top-level
    /// names are globals.
    scopes: Vec<AHashMap<String, LocalKind>>,
    /// Free variables in first-use order.
    captures: Vec<(String, CodeRange)>,
    /// Render context: `if` / `for` are reactive blocks.
    render: bool,
}

impl FrameEnv {
    fn module() -> Self {
        Self {
            scopes: vec![AHashMap::new()],
            captures: Vec::new(),
            render: true,
        }
    }
}

struct Resolver<'a, 'b> {
    tables: &'b Tables<'a>,
    module: &'b str,
    frames: Vec<FrameEnv>,
    next_function: &'b mut u32,
    globals: &'b mut IndexMap<String, Global>,
}

impl Resolver<'_, '_> {
    fn error(&self, position: CodeRange, msg: impl Into<std::borrow::Cow<'static, str>>) -> CompileError {
        CompileError::new(self.module, position, msg)
    }

    fn frame(&mut self) -> &mut FrameEnv {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn render(&self) -> bool {
        self.frames.last().is_some_and(|frame| frame.render)
    }

    /// At module top level, outside any block.
    fn at_module_scope(&self) -> bool {
        self.frames.len() == 1 && self.frames[0].scopes.len() == 1
    }

    fn top_level(&mut self, stmt: &mut Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::FunctionDef(def) => {
                def.name.binding = Binding::Global(format!("{}.{}", self.module, def.name.name));
                let id = self.function(def)?;
                let qualified = format!("{}.{}", self.module, def.name.name);
                self.globals.insert(
                    qualified,
                    Global::Function {
                        id,
                        arity: def.params.len(),
                        component: def.decorators.component,
                    },
                );
                Ok(())
            }
            Stmt::Assign { target, value } => {
                self.expr(value)?;
                let qualified = format!("{}.{}", self.module, target.name);
                if let Expr::Call(call) = &value.expr
                    && matches!(
                        callee_binding(call),
                        Some(Binding::Builtin(Builtin::Style | Builtin::Merge))
                    )
                {
                    let style = evaluate_style(value, self.globals).map_err(|msg| self.error(value.position, msg))?;
                    self.globals.insert(qualified.clone(), Global::Style(style));
                }
                target.binding = Binding::Global(qualified);
                Ok(())
            }
            other => self.statement(other),
        }
    }

    fn statements(&mut self, body: &mut [Stmt]) -> Result<(), CompileError> {
        body.iter_mut().try_for_each(|stmt| self.statement(stmt))
    }

    fn statement(&mut self, stmt: &mut Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Import { position, .. } | Stmt::ImportFrom { position, .. } => {
                if self.at_module_scope() {
                    Ok(())
                } else {
                    Err(self.error(*position, "imports are only allowed at module level"))
                }
            }
            Stmt::Assign { target, value } | Stmt::OpAssign { target, value, .. } => {
                self.expr(value)?;
                target.binding = self.store_binding(&target.name);
                Ok(())
            }
            Stmt::SignalWrite { target, value } | Stmt::SignalOpAssign { target, value, .. } => {
                self.expr(value)?;
                target.binding = self.resolve(&target.name, target.position);
                Ok(())
            }
            Stmt::If {
                test,
                body,
                or_else,
                position,
                mode,
            } => {
                self.expr(test)?;
                if self.render() {
                    if test.as_signal_read().is_none() {
                        return Err(self.error(
                            *position,
                            "a reactive conditional needs a direct signal read as its test (`if name.value:`)",
                        ));
                    }
                    *mode = BlockMode::Reactive;
                    self.block(body, None)?;
                    self.block(or_else, None)
                } else {
                    *mode = BlockMode::Plain;
                    self.statements(body)?;
                    self.statements(or_else)
                }
            }
            Stmt::For {
                target,
                iter,
                body,
                position,
                mode,
            } => {
                if !self.render() {
                    return Err(self.error(
                        *position,
                        "`for` is only supported as a reactive iteration in component or module code",
                    ));
                }
                self.expr(iter)?;
                if iter.as_signal_read().is_none() {
                    return Err(self.error(
                        *position,
                        "a reactive iteration needs a direct signal read as its iterable (`for x in name.value:`)",
                    ));
                }
                *mode = BlockMode::Reactive;
                target.binding = Binding::Local(LocalKind::Item);
                self.block(body, Some(target.name.clone()))
            }
            Stmt::With { node, body, .. } => {
                self.expr(node)?;
                self.statements(body)
            }
            Stmt::FunctionDef(def) => {
                if def.decorators != Decorators::default() {
                    return Err(self.error(def.position, "decorators are only allowed on module-level functions"));
                }
                def.name.binding = self.store_binding(&def.name.name);
                self.function(def).map(|_| ())
            }
            Stmt::Return { value, position } => {
                if self.frames.len() == 1 {
                    return Err(self.error(*position, "`return` outside of a function"));
                }
                value.as_mut().map_or(Ok(()), |value| self.expr(value))
            }
            Stmt::Expr(expr) => self.expr(expr),
            Stmt::Pass => Ok(()),
        }
    }

    /// Resolves a reactive block body in its own scope.
    fn block(&mut self, body: &mut [Stmt], item: Option<String>) -> Result<(), CompileError> {
        let mut scope = AHashMap::new();
        if let Some(item) = item {
            scope.insert(item, LocalKind::Item);
        }
        assigned_names(body, true, &mut scope);
        self.frame().scopes.push(scope);
        let result = self.statements(body);
        self.frame().scopes.pop();
        result
    }

    /// Resolves a function or lambda body in a new frame and numbers it.
    fn function(&mut self, def: &mut FunctionDef) -> Result<FuncId, CompileError> {
        let id = FuncId(*self.next_function);
        *self.next_function += 1;
        def.id = Some(id);

        let render = def.decorators.component;
        let mut scope = AHashMap::new();
        for param in &mut def.params {
            if scope.insert(param.name.clone(), LocalKind::Plain).is_some() {
                return Err(self.error(param.position, format!("duplicate parameter '{}'", param.name)));
            }
            param.binding = Binding::Local(LocalKind::Plain);
        }
        assigned_names(&def.body, render, &mut scope);
        self.frames.push(FrameEnv {
            scopes: vec![scope],
            captures: Vec::new(),
            render,
        });
        let result = self.statements(&mut def.body);
        let frame = self.frames.pop();
        result?;

        // each capture as seen from the defining frame
        def.captures = frame
            .map(|frame| frame.captures)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, position)| {
                let binding = self.resolve(&name, position);
                Identifier {
                    name,
                    position,
                    binding,
                }
            })
            .collect();
        Ok(id)
    }

    /// Binding for the target of an assignment.
    fn store_binding(&mut self, name: &str) -> Binding {
        if self.at_module_scope() {
            Binding::Global(format!("{}.{name}", self.module))
        } else {
            self.resolve(name, CodeRange::default())
        }
    }

    /// Resolves a name read: locals of the current frame, then enclosing frames
    /// (recording a capture in every frame in between), then module globals.
    fn resolve(&mut self, name: &str, position: CodeRange) -> Binding {
        let current = self.frames.len() - 1;
        for index in (0..=current).rev() {
            let found = self.frames[index]
                .scopes
                .iter()
                .rev()
                .find_map(|scope| scope.get(name).copied());
            let Some(kind) = found else {
                continue;
            };
            if index == current {
                return Binding::Local(kind);
            }
            for frame in &mut self.frames[index + 1..] {
                if !frame.captures.iter().any(|(captured, _)| captured == name) {
                    frame.captures.push((name.to_owned(), position));
                }
            }
            return Binding::Capture(kind);
        }
        self.tables.global(self.module, name, 0)
    }

    fn expr(&mut self, expr: &mut ExprLoc) -> Result<(), CompileError> {
        match &mut expr.expr {
            Expr::Literal(_) => Ok(()),
            Expr::Name(ident) | Expr::SignalRead(ident) => {
                ident.binding = self.resolve(&ident.name, ident.position);
                Ok(())
            }
            Expr::ModuleAttr { module, attr } => {
                module.binding = self.resolve(&module.name, module.position);
                match &module.binding {
                    Binding::Module(target) => {
                        attr.binding = self.tables.attribute(self.module, &module.name, target, &attr.name);
                        Ok(())
                    }
                    Binding::Unresolved => Ok(()),
                    _ => Err(self.error(
                        expr.position,
                        format!(
                            "attribute access is only supported on imported modules (`{}.{}`)",
                            module.name, attr.name
                        ),
                    )),
                }
            }
            Expr::Subscript { object, index } => {
                self.expr(object)?;
                self.expr(index)
            }
            Expr::List(items) => items.iter_mut().try_for_each(|item| self.expr(item)),
            Expr::Dict(pairs) => pairs.iter_mut().try_for_each(|(key, value)| {
                self.expr(key)?;
                self.expr(value)
            }),
            Expr::FString(parts) => parts.iter_mut().try_for_each(|part| match part {
                FStringPart::Literal(_) => Ok(()),
                FStringPart::Interpolation(expr) => self.expr(expr),
            }),
            Expr::Op { left, right, .. } | Expr::Cmp { left, right, .. } | Expr::Bool { left, right, .. } => {
                self.expr(left)?;
                self.expr(right)
            }
            Expr::Unary { operand, .. } => self.expr(operand),
            Expr::IfElse { test, body, orelse } => {
                self.expr(test)?;
                self.expr(body)?;
                self.expr(orelse)
            }
            Expr::Call(call) => {
                self.expr(&mut call.callee)?;
                call.args.iter_mut().try_for_each(|arg| self.expr(arg))?;
                call.kwargs.iter_mut().try_for_each(|kwarg| self.expr(&mut kwarg.value))
            }
            Expr::Lambda(def) => self.function(def).map(|_| ()),
        }
    }
}

/// Collects the names a body assigns into `scope`. In render context `if` / `for`
/// bodies are blocks with their own scopes and are skipped.
fn assigned_names(body: &[Stmt], render: bool, scope: &mut AHashMap<String, LocalKind>) {
    for stmt in body {
        match stmt {
            Stmt::Assign { target, .. } | Stmt::OpAssign { target, .. } => {
                scope.entry(target.name.clone()).or_insert(LocalKind::Plain);
            }
            Stmt::FunctionDef(def) => {
                scope.entry(def.name.name.clone()).or_insert(LocalKind::Plain);
            }
            Stmt::With { body, .. } => assigned_names(body, render, scope),
            Stmt::If { body, or_else, .. } if !render => {
                assigned_names(body, render, scope);
                assigned_names(or_else, render, scope);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::classify::classify;

    fn prepare_sources(files: &[(&str, &str)]) -> Result<Prepared, CompileError> {
        let sources = files.iter().map(|(n, s)| ((*n).to_owned(), (*s).to_owned())).collect();
        let config = BuildConfig::default().with_entries(["main"]);
        let graph = ModuleGraph::from_sources(sources, &config, None).unwrap();
        let classification = classify(&graph, &config);
        prepare(&graph, &classification, &config)
    }

    fn body(prepared: &Prepared, module: &str) -> Vec<Stmt> {
        prepared
            .modules
            .iter()
            .find(|m| m.name == module)
            .map(|m| m.body.clone())
            .unwrap()
    }

    #[test]
    fn globals_follow_import_chains() {
        let prepared = prepare_sources(&[
            ("state", "from ripple import Signal\ncount = Signal(0)\n"),
            ("relay", "from state import count\n"),
            ("main", "from relay import count as c\nc.value += 1\n"),
        ])
        .unwrap();
        let names: Vec<_> = prepared.modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["state", "relay", "main"]);
        let Stmt::SignalOpAssign { target, .. } = &body(&prepared, "main")[1] else {
            panic!("expected compound signal write");
        };
        assert_eq!(target.binding, Binding::Global("state.count".to_owned()));
    }

    #[test]
    fn closures_capture_through_nested_functions() {
        let prepared = prepare_sources(&[(
            "main",
            "@component\ndef App():\n    label = 'x'\n    def outer():\n        return lambda: label\n    Text(label)\n",
        )])
        .unwrap();
        let main = body(&prepared, "main");
        let Stmt::FunctionDef(app) = &main[0] else {
            panic!("expected def");
        };
        let Stmt::FunctionDef(outer) = &app.body[1] else {
            panic!("expected nested def");
        };
        assert_eq!(outer.captures.len(), 1);
        assert_eq!(outer.captures[0].binding, Binding::Local(LocalKind::Plain));
        let Stmt::Return {
            value: Some(ExprLoc {
                expr: Expr::Lambda(lambda),
                ..
            }),
            ..
        } = &outer.body[0]
        else {
            panic!("expected lambda");
        };
        assert_eq!(lambda.captures[0].binding, Binding::Capture(LocalKind::Plain));
        assert_eq!(prepared.function_count, 3);
    }

    #[test]
    fn reactive_blocks_need_signal_reads() {
        let err = prepare_sources(&[("main", "flag = True\nif flag:\n    Text('a')\n")]).unwrap_err();
        assert!(err.to_string().contains("direct signal read"), "{err}");
    }

    #[test]
    fn handler_if_is_plain_and_block_names_are_local() {
        let prepared = prepare_sources(&[(
            "main",
            "items = Signal([])\nfor x in items.value:\n    y = x\n    Text(y)\ndef f(n):\n    if n:\n        m = 1\n    return m\n",
        )])
        .unwrap();
        let main = body(&prepared, "main");
        let Stmt::For { body: block, .. } = &main[1] else {
            panic!("expected for");
        };
        let Stmt::Assign { target, value } = &block[0] else {
            panic!("expected assignment");
        };
        assert_eq!(target.binding, Binding::Local(LocalKind::Plain));
        assert!(value.reads_signal());
        let Stmt::FunctionDef(f) = &main[2] else {
            panic!("expected def");
        };
        assert!(matches!(f.body[0], Stmt::If { mode: BlockMode::Plain, .. }));
    }

    #[test]
    fn style_constants_are_evaluated_and_removed() {
        let prepared = prepare_sources(&[(
            "main",
            "card = Style(padding=4, color='red')\nloud = merge(card, Style(color='blue'))\nText('x', style=loud)\n",
        )])
        .unwrap();
        assert_eq!(body(&prepared, "main").len(), 1);
        let Some(Global::Style(style)) = prepared.global("main.loud") else {
            panic!("expected style constant");
        };
        assert_eq!(style.color.as_deref(), Some("blue"));
    }
}
