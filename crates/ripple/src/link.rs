//! Call-target resolution.
//!
//! Every call in the prepared client half gets a [`CallTarget`]: an intrinsic, a
//! direct jump to a client function, a component instantiation, a node
//! constructor, a remote call to an `@rpc` function or a call of a closure value.
//! Names used as values are checked as well, so nothing unresolved reaches the
//! compiler.

use std::{borrow::Cow, fmt, ops::RangeInclusive};

use indexmap::IndexMap;

use crate::{
    expressions::{Binding, Builtin, Call, CallTarget, Expr, ExprLoc, FStringPart, Identifier, NodeKind, Stmt},
    intrinsics::MAX_ARGS,
    parse::CodeRange,
    prepare::{Global, Prepared},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkErrorKind {
    /// The name refers to nothing client code can use.
    Unresolved(Cow<'static, str>),
    Arity { expected: RangeInclusive<usize>, found: usize },
    UnexpectedKeyword(String),
    /// A remote call somewhere other than an expression statement or a signal write.
    RemotePlacement,
    /// `Signal(..)` / `Computed(..)` outside a plain assignment.
    FormPlacement,
    NotCallable,
}

/// A call or name that cannot be linked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkError {
    pub symbol: String,
    pub module: String,
    pub position: CodeRange,
    pub kind: LinkErrorKind,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: ", self.module, self.position)?;
        let symbol = &self.symbol;
        match &self.kind {
            LinkErrorKind::Unresolved(reason) => write!(f, "unresolved symbol '{symbol}': {reason}"),
            LinkErrorKind::Arity { expected, found } => {
                if expected.start() == expected.end() {
                    write!(f, "'{symbol}' takes {} arguments, {found} given", expected.start())
                } else {
                    write!(
                        f,
                        "'{symbol}' takes {} to {} arguments, {found} given",
                        expected.start(),
                        expected.end()
                    )
                }
            }
            LinkErrorKind::UnexpectedKeyword(name) => write!(f, "'{symbol}' got an unexpected keyword argument '{name}'"),
            LinkErrorKind::RemotePlacement => write!(
                f,
                "remote call to '{symbol}' must be a statement or the right side of a signal write"
            ),
            LinkErrorKind::FormPlacement => write!(f, "'{symbol}(...)' must be assigned directly to a name"),
            LinkErrorKind::NotCallable => write!(f, "'{symbol}' is not callable"),
        }
    }
}

impl std::error::Error for LinkError {}

/// Where a call appears; decides which forms are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Site {
    Statement,
    /// Right side of `name.value = ...`.
    SignalWrite,
    /// Right side of `name = ...`.
    Assign,
    Value,
}

/// Resolves the call target of every call in `prepared`.
pub fn link(prepared: &mut Prepared) -> Result<(), LinkError> {
    let Prepared { modules, globals, .. } = prepared;
    for module in modules {
        let linker = Linker {
            globals: &*globals,
            module: &module.name,
        };
        for stmt in &mut module.body {
            linker.statement(stmt)?;
        }
    }
    Ok(())
}

struct Linker<'a> {
    globals: &'a IndexMap<String, Global>,
    module: &'a str,
}

impl Linker<'_> {
    fn error(&self, symbol: impl Into<String>, position: CodeRange, kind: LinkErrorKind) -> LinkError {
        LinkError {
            symbol: symbol.into(),
            module: self.module.to_owned(),
            position,
            kind,
        }
    }

    fn unresolved(&self, ident: &Identifier, reason: impl Into<Cow<'static, str>>) -> LinkError {
        self.error(&ident.name, ident.position, LinkErrorKind::Unresolved(reason.into()))
    }

    fn statements(&self, body: &mut [Stmt]) -> Result<(), LinkError> {
        body.iter_mut().try_for_each(|stmt| self.statement(stmt))
    }

    fn statement(&self, stmt: &mut Stmt) -> Result<(), LinkError> {
        match stmt {
            Stmt::Import { .. } | Stmt::ImportFrom { .. } | Stmt::Pass => Ok(()),
            Stmt::Assign { value, .. } => self.site(value, Site::Assign),
            Stmt::OpAssign { value, .. } => self.expr(value),
            Stmt::SignalWrite { target, value } => {
                self.signal(target)?;
                self.site(value, Site::SignalWrite)
            }
            Stmt::SignalOpAssign { target, value, .. } => {
                self.signal(target)?;
                self.expr(value)
            }
            Stmt::If { test, body, or_else, .. } => {
                self.expr(test)?;
                self.statements(body)?;
                self.statements(or_else)
            }
            Stmt::For { iter, body, .. } => {
                self.expr(iter)?;
                self.statements(body)
            }
            Stmt::With { node, body, .. } => {
                self.expr(node)?;
                self.statements(body)
            }
            Stmt::FunctionDef(def) => self.statements(&mut def.body),
            Stmt::Return { value, .. } => value.as_mut().map_or(Ok(()), |value| self.expr(value)),
            Stmt::Expr(expr) => self.site(expr, Site::Statement),
        }
    }

    fn site(&self, expr: &mut ExprLoc, site: Site) -> Result<(), LinkError> {
        match &mut expr.expr {
            Expr::Call(call) => self.call(call, expr.position, site),
            _ => self.expr(expr),
        }
    }

    /// Target of a signal read or write.
    fn signal(&self, ident: &Identifier) -> Result<(), LinkError> {
        match &ident.binding {
            Binding::Local(_) | Binding::Capture(_) => Ok(()),
            Binding::Global(qualified) => match self.globals.get(qualified) {
                Some(Global::Variable) => Ok(()),
                _ => Err(self.unresolved(ident, "not a signal variable")),
            },
            _ => Err(self.unresolved(ident, "not a signal variable")),
        }
    }

    /// A name used as a value.
    fn value(&self, ident: &Identifier) -> Result<(), LinkError> {
        match &ident.binding {
            Binding::Local(_) | Binding::Capture(_) => Ok(()),
            Binding::Global(qualified) => match self.globals.get(qualified) {
                Some(Global::Function { .. } | Global::Variable) => Ok(()),
                Some(Global::Style(_)) => Err(self.unresolved(ident, "style constants can only be passed as `style=`")),
                Some(Global::Remote { .. } | Global::ServerFunction) => {
                    Err(self.unresolved(ident, "server functions can only be called"))
                }
                Some(Global::External { module }) => Err(self.unresolved(
                    ident,
                    format!("external module '{module}' has no client implementation"),
                )),
                None => Err(self.unresolved(ident, "not defined")),
            },
            Binding::Builtin(_) => Err(self.unresolved(ident, "built-in forms can only be called")),
            Binding::Module(_) => Err(self.unresolved(ident, "a module is not a value")),
            Binding::Unresolved => Err(self.unresolved(ident, "not defined")),
        }
    }

    fn expr(&self, expr: &mut ExprLoc) -> Result<(), LinkError> {
        match &mut expr.expr {
            Expr::Literal(_) => Ok(()),
            Expr::Name(ident) | Expr::ModuleAttr { attr: ident, .. } => self.value(ident),
            Expr::SignalRead(ident) => self.signal(ident),
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
            Expr::Call(call) => self.call(call, expr.position, Site::Value),
            Expr::Lambda(def) => self.statements(&mut def.body),
        }
    }

    fn call(&self, call: &mut Call, position: CodeRange, site: Site) -> Result<(), LinkError> {
        let ident = match &call.callee.expr {
            Expr::Name(ident) | Expr::ModuleAttr { attr: ident, .. } => Some(ident.clone()),
            _ => None,
        };
        let Some(ident) = ident else {
            // calling the result of an expression
            self.expr(&mut call.callee)?;
            self.no_keywords("<expression>", call)?;
            call.target = CallTarget::Dynamic;
            return self.arguments(call);
        };
        let name = ident.name.as_str();

        let target = match &ident.binding {
            Binding::Builtin(builtin) => match *builtin {
                Builtin::Intrinsic(intrinsic) => {
                    self.no_keywords(name, call)?;
                    self.arity(name, intrinsic.arity(), call, position)?;
                    CallTarget::Intrinsic(intrinsic)
                }
                Builtin::Node(kind) => {
                    self.node_arguments(name, kind, call, position)?;
                    CallTarget::Node(kind)
                }
                Builtin::Signal | Builtin::Computed => {
                    if site != Site::Assign {
                        return Err(self.error(name, position, LinkErrorKind::FormPlacement));
                    }
                    self.no_keywords(name, call)?;
                    let expected = if *builtin == Builtin::Signal { 0..=1 } else { 1..=1 };
                    self.arity(name, expected, call, position)?;
                    CallTarget::Form(*builtin)
                }
                // style arguments are evaluated by the compiler
                Builtin::Style => {
                    call.target = CallTarget::Form(Builtin::Style);
                    return Ok(());
                }
                Builtin::Merge => {
                    self.no_keywords(name, call)?;
                    self.arity(name, 2..=2, call, position)?;
                    call.target = CallTarget::Form(Builtin::Merge);
                    return Ok(());
                }
                Builtin::Decorator => return Err(self.error(name, position, LinkErrorKind::NotCallable)),
            },
            Binding::Global(qualified) => match self.globals.get(qualified) {
                Some(Global::Function { id, arity, component }) => {
                    self.no_keywords(name, call)?;
                    self.arity(name, *arity..=*arity, call, position)?;
                    if *component {
                        CallTarget::Component(*id)
                    } else {
                        CallTarget::Function(*id)
                    }
                }
                Some(Global::Remote { arity }) => {
                    if !matches!(site, Site::Statement | Site::SignalWrite) {
                        return Err(self.error(name, position, LinkErrorKind::RemotePlacement));
                    }
                    self.no_keywords(name, call)?;
                    self.arity(name, *arity..=*arity, call, position)?;
                    CallTarget::Remote(qualified.clone())
                }
                Some(Global::Variable) => CallTarget::Dynamic,
                Some(Global::ServerFunction) => {
                    return Err(self.unresolved(&ident, "server function is not `@rpc` and cannot be called remotely"));
                }
                Some(Global::External { module }) => {
                    return Err(self.unresolved(
                        &ident,
                        format!("external module '{module}' has no client implementation"),
                    ));
                }
                Some(Global::Style(_)) => return Err(self.error(name, position, LinkErrorKind::NotCallable)),
                None => return Err(self.unresolved(&ident, "not defined")),
            },
            Binding::Local(_) | Binding::Capture(_) => CallTarget::Dynamic,
            Binding::Module(_) => return Err(self.error(name, position, LinkErrorKind::NotCallable)),
            Binding::Unresolved => return Err(self.unresolved(&ident, "not defined")),
        };
        if target == CallTarget::Dynamic {
            self.no_keywords(name, call)?;
            if call.args.len() > MAX_ARGS {
                return Err(self.arity_error(name, 0..=MAX_ARGS, call, position));
            }
        }
        call.target = target;
        self.arguments(call)
    }

    fn arguments(&self, call: &mut Call) -> Result<(), LinkError> {
        call.args.iter_mut().try_for_each(|arg| self.expr(arg))?;
        for kwarg in &mut call.kwargs {
            // style expressions are compile-time constants
            if kwarg.name != "style" {
                self.expr(&mut kwarg.value)?;
            }
        }
        Ok(())
    }

    fn node_arguments(&self, name: &str, kind: NodeKind, call: &Call, position: CodeRange) -> Result<(), LinkError> {
        let (positional, keywords): (RangeInclusive<usize>, &[&str]) = match kind {
            NodeKind::Text => (0..=1, &["style"]),
            NodeKind::Button => (0..=1, &["style", "on_click"]),
            NodeKind::Input => (0..=0, &["style", "value", "placeholder", "on_input"]),
            NodeKind::Column | NodeKind::Row => (0..=0, &["style"]),
            NodeKind::Root | NodeKind::Anchor => return Err(self.error(name, position, LinkErrorKind::NotCallable)),
        };
        self.arity(name, positional, call, position)?;
        for (index, kwarg) in call.kwargs.iter().enumerate() {
            let duplicate = call.kwargs[..index].iter().any(|earlier| earlier.name == kwarg.name);
            if duplicate || !keywords.contains(&kwarg.name.as_str()) {
                return Err(self.error(
                    name,
                    kwarg.position,
                    LinkErrorKind::UnexpectedKeyword(kwarg.name.clone()),
                ));
            }
        }
        Ok(())
    }

    fn no_keywords(&self, name: &str, call: &Call) -> Result<(), LinkError> {
        match call.kwargs.first() {
            Some(kwarg) => Err(self.error(
                name,
                kwarg.position,
                LinkErrorKind::UnexpectedKeyword(kwarg.name.clone()),
            )),
            None => Ok(()),
        }
    }

    fn arity(&self, name: &str, expected: RangeInclusive<usize>, call: &Call, position: CodeRange) -> Result<(), LinkError> {
        if expected.contains(&call.args.len()) {
            Ok(())
        } else {
            Err(self.arity_error(name, expected, call, position))
        }
    }

    fn arity_error(&self, name: &str, expected: RangeInclusive<usize>, call: &Call, position: CodeRange) -> LinkError {
        self.error(
            name,
            position,
            LinkErrorKind::Arity {
                expected,
                found: call.args.len(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        classify::classify,
        config::BuildConfig,
        expressions::FuncId,
        graph::ModuleGraph,
        intrinsics::Intrinsic,
        prepare::prepare,
    };

    fn link_sources(files: &[(&str, &str)]) -> Result<Prepared, LinkError> {
        let sources = files.iter().map(|(n, s)| ((*n).to_owned(), (*s).to_owned())).collect();
        let config = BuildConfig::default().with_entries(["main"]);
        let graph = ModuleGraph::from_sources(sources, &config, None).unwrap();
        let classification = classify(&graph, &config);
        let mut prepared = prepare(&graph, &classification, &config).unwrap();
        link(&mut prepared)?;
        Ok(prepared)
    }

    fn main_targets(prepared: &Prepared) -> Vec<CallTarget> {
        let main = prepared.modules.iter().find(|m| m.name == "main").unwrap();
        main.body
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::Expr(ExprLoc {
                    expr: Expr::Call(call), ..
                }) => Some(call.target.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn every_callee_class_is_resolved() {
        let prepared = link_sources(&[
            ("api", "__boundary__ = 'server'\n@rpc\ndef ping():\n    return 1\n"),
            (
                "main",
                "from api import ping\ndef helper(n):\n    return n\n@component\ndef Card():\n    Text('card')\nlen([1])\nhelper(1)\nCard()\nText('x')\nping()\n",
            ),
        ])
        .unwrap();
        assert_eq!(
            main_targets(&prepared),
            vec![
                CallTarget::Intrinsic(Intrinsic::Len),
                CallTarget::Function(FuncId(0)),
                CallTarget::Component(FuncId(1)),
                CallTarget::Node(NodeKind::Text),
                CallTarget::Remote("api.ping".to_owned()),
            ]
        );
    }

    #[test]
    fn unknown_names_are_unresolved() {
        let err = link_sources(&[("main", "Text(missing)\n")]).unwrap_err();
        assert_eq!(err.symbol, "missing");
        assert!(matches!(err.kind, LinkErrorKind::Unresolved(_)));
        assert_eq!(err.to_string(), "main:1:6: unresolved symbol 'missing': not defined");

        let err = link_sources(&[("main", "undefined_fn()\n")]).unwrap_err();
        assert_eq!(err.symbol, "undefined_fn");
    }

    #[test]
    fn external_modules_fail_closed() {
        let err = link_sources(&[("main", "import math\nx = math.floor(1.5)\n")]).unwrap_err();
        assert_eq!(err.symbol, "floor");
        assert!(err.to_string().contains("no client implementation"), "{err}");
    }

    #[test]
    fn arity_and_keywords_are_checked() {
        let err = link_sources(&[("main", "len(1, 2)\n")]).unwrap_err();
        assert_eq!(
            err.kind,
            LinkErrorKind::Arity {
                expected: 1..=1,
                found: 2
            }
        );
        let err = link_sources(&[("main", "Text('a', on_click=None)\n")]).unwrap_err();
        assert_eq!(err.kind, LinkErrorKind::UnexpectedKeyword("on_click".to_owned()));
    }

    #[test]
    fn remote_calls_must_stand_alone() {
        let err = link_sources(&[
            ("api", "__boundary__ = 'server'\n@rpc\ndef ping():\n    return 1\n"),
            ("main", "from api import ping\nx = ping()\n"),
        ])
        .unwrap_err();
        assert_eq!(err.kind, LinkErrorKind::RemotePlacement);
    }
}
