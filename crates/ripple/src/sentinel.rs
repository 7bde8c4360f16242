//! Client/server boundary enforcement.
//!
//! Runs over the prepared client half. Every global a client function reads must be
//! of client origin; the only server symbols client code may name are `@rpc`
//! functions, and only as the direct callee of a call. Closures are checked too:
//! a local that was computed from a server symbol taints every closure that
//! captures it, wherever in the function the capture and the assignment appear.

use std::fmt;

use ahash::{AHashMap, AHashSet};

use crate::{
    classify::{Classification, Origin},
    expressions::{Binding, Expr, ExprLoc, FStringPart, FunctionDef, Identifier, Stmt},
    parse::CodeRange,
    prepare::Prepared,
};

/// How a server symbol reached client code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeakKind {
    /// Named directly.
    Reference,
    /// Carried into a closure through a captured local.
    Capture { variable: String },
}

/// Client code reaches a server-only symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLeakError {
    /// Qualified name of the server symbol.
    pub symbol: String,
    pub module: String,
    pub position: CodeRange,
    /// Client function containing the reference, `<module>` for top-level code.
    pub function: String,
    pub kind: LeakKind,
}

impl fmt::Display for ServerLeakError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: ", self.module, self.position)?;
        match &self.kind {
            LeakKind::Reference => write!(
                f,
                "server symbol '{}' is referenced from client code in '{}'",
                self.symbol, self.function
            ),
            LeakKind::Capture { variable } => write!(
                f,
                "closure in '{}' captures '{variable}', which holds server symbol '{}'",
                self.function, self.symbol
            ),
        }
    }
}

impl std::error::Error for ServerLeakError {}

/// Checks that no client code in `prepared` can reach a server symbol.
pub fn validate(prepared: &Prepared, classification: &Classification) -> Result<(), ServerLeakError> {
    for module in &prepared.modules {
        let mut checker = Checker {
            classification,
            module: &module.name,
            frames: Vec::new(),
        };
        checker.enter("<module>", &[], &module.body);
        checker.statements(&module.body)?;
    }
    Ok(())
}

/// Locals of one function and the server symbol each tainted one derives from.
struct Frame<'a> {
    name: &'a str,
    locals: AHashSet<&'a str>,
    tainted: AHashMap<&'a str, String>,
}

struct Checker<'a> {
    classification: &'a Classification,
    module: &'a str,
    frames: Vec<Frame<'a>>,
}

impl<'a> Checker<'a> {
    fn enter(&mut self, name: &'a str, params: &'a [Identifier], body: &'a [Stmt]) {
        let mut assignments = Vec::new();
        let mut locals: AHashSet<&str> = params.iter().map(|param| param.name.as_str()).collect();
        local_assignments(body, &mut locals, &mut assignments);
        self.frames.push(Frame {
            name,
            locals,
            tainted: AHashMap::new(),
        });

        // taint propagates through local assignments until nothing changes
        loop {
            let mut changed = false;
            for (target, value) in &assignments {
                if self.current().tainted.contains_key(target) {
                    continue;
                }
                if let Some(symbol) = self.server_source(value) {
                    self.current_mut().tainted.insert(*target, symbol);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn current(&self) -> &Frame<'a> {
        &self.frames[self.frames.len() - 1]
    }

    fn current_mut(&mut self) -> &mut Frame<'a> {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn is_server(&self, qualified: &str) -> bool {
        self.classification.origin(qualified) == Origin::Server
    }

    /// Taint of a local name as seen from frame `depth`: the innermost frame that
    /// declares it decides.
    fn taint_of(&self, name: &str, depth: usize) -> Option<&String> {
        self.frames[..=depth]
            .iter()
            .rev()
            .find(|frame| frame.locals.contains(name))
            .and_then(|frame| frame.tainted.get(name))
    }

    /// First server symbol evaluating `expr` can yield, through globals or tainted
    /// locals. Nested functions are not entered.
    fn server_source(&self, expr: &ExprLoc) -> Option<String> {
        let depth = self.frames.len() - 1;
        let ident_source = |ident: &Identifier| match &ident.binding {
            Binding::Global(qualified) if self.is_server(qualified) => Some(qualified.clone()),
            Binding::Local(_) | Binding::Capture(_) => self.taint_of(&ident.name, depth).cloned(),
            _ => None,
        };
        match &expr.expr {
            Expr::Literal(_) | Expr::Lambda(_) => None,
            Expr::Name(ident) | Expr::SignalRead(ident) | Expr::ModuleAttr { attr: ident, .. } => ident_source(ident),
            Expr::Subscript { object, index } => self.server_source(object).or_else(|| self.server_source(index)),
            Expr::List(items) => items.iter().find_map(|item| self.server_source(item)),
            Expr::Dict(pairs) => pairs
                .iter()
                .find_map(|(key, value)| self.server_source(key).or_else(|| self.server_source(value))),
            Expr::FString(parts) => parts.iter().find_map(|part| match part {
                FStringPart::Literal(_) => None,
                FStringPart::Interpolation(expr) => self.server_source(expr),
            }),
            Expr::Op { left, right, .. } | Expr::Cmp { left, right, .. } | Expr::Bool { left, right, .. } => {
                self.server_source(left).or_else(|| self.server_source(right))
            }
            Expr::Unary { operand, .. } => self.server_source(operand),
            Expr::IfElse { test, body, orelse } => self
                .server_source(test)
                .or_else(|| self.server_source(body))
                .or_else(|| self.server_source(orelse)),
            Expr::Call(call) => {
                let callee = if self.is_rpc_callee(&call.callee) {
                    None
                } else {
                    self.server_source(&call.callee)
                };
                callee
                    .or_else(|| call.args.iter().find_map(|arg| self.server_source(arg)))
                    .or_else(|| call.kwargs.iter().find_map(|kwarg| self.server_source(&kwarg.value)))
            }
        }
    }

    fn is_rpc_callee(&self, callee: &ExprLoc) -> bool {
        match &callee.expr {
            Expr::Name(ident) | Expr::ModuleAttr { attr: ident, .. } => {
                matches!(&ident.binding, Binding::Global(qualified) if self.classification.is_remote(qualified))
            }
            _ => false,
        }
    }

    fn leak(&self, symbol: &str, position: CodeRange, kind: LeakKind) -> ServerLeakError {
        ServerLeakError {
            symbol: symbol.to_owned(),
            module: self.module.to_owned(),
            position,
            function: self.current().name.to_owned(),
            kind,
        }
    }

    fn statements(&mut self, body: &'a [Stmt]) -> Result<(), ServerLeakError> {
        body.iter().try_for_each(|stmt| self.statement(stmt))
    }

    fn statement(&mut self, stmt: &'a Stmt) -> Result<(), ServerLeakError> {
        match stmt {
            Stmt::Import { .. } | Stmt::ImportFrom { .. } | Stmt::Pass => Ok(()),
            Stmt::Assign { value, .. } | Stmt::OpAssign { value, .. } => self.expr(value),
            Stmt::SignalWrite { target, value } | Stmt::SignalOpAssign { target, value, .. } => {
                self.identifier(target)?;
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
            Stmt::FunctionDef(def) => self.function(def),
            Stmt::Return { value, .. } => value.as_ref().map_or(Ok(()), |value| self.expr(value)),
            Stmt::Expr(expr) => self.expr(expr),
        }
    }

    fn function(&mut self, def: &'a FunctionDef) -> Result<(), ServerLeakError> {
        let depth = self.frames.len() - 1;
        for capture in &def.captures {
            if let Some(symbol) = self.taint_of(&capture.name, depth) {
                return Err(self.leak(
                    symbol,
                    def.position,
                    LeakKind::Capture {
                        variable: capture.name.clone(),
                    },
                ));
            }
        }
        let name = if def.is_lambda { "<lambda>" } else { def.name.name.as_str() };
        self.enter(name, &def.params, &def.body);
        let result = self.statements(&def.body);
        self.frames.pop();
        result
    }

    fn identifier(&self, ident: &Identifier) -> Result<(), ServerLeakError> {
        match &ident.binding {
            Binding::Global(qualified) if self.is_server(qualified) => {
                Err(self.leak(qualified, ident.position, LeakKind::Reference))
            }
            _ => Ok(()),
        }
    }

    fn expr(&mut self, expr: &'a ExprLoc) -> Result<(), ServerLeakError> {
        match &expr.expr {
            Expr::Literal(_) => Ok(()),
            Expr::Name(ident) | Expr::SignalRead(ident) | Expr::ModuleAttr { attr: ident, .. } => {
                self.identifier(ident)
            }
            Expr::Subscript { object, index } => {
                self.expr(object)?;
                self.expr(index)
            }
            Expr::List(items) => items.iter().try_for_each(|item| self.expr(item)),
            Expr::Dict(pairs) => pairs.iter().try_for_each(|(key, value)| {
                self.expr(key)?;
                self.expr(value)
            }),
            Expr::FString(parts) => parts.iter().try_for_each(|part| match part {
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
                if !self.is_rpc_callee(&call.callee) {
                    self.expr(&call.callee)?;
                }
                call.args.iter().try_for_each(|arg| self.expr(arg))?;
                call.kwargs.iter().try_for_each(|kwarg| self.expr(&kwarg.value))
            }
            Expr::Lambda(def) => self.function(def),
        }
    }
}

/// Local names a function body declares, and every `(local, value)` assignment in
/// it. Nested functions are not entered.
fn local_assignments<'a>(body: &'a [Stmt], locals: &mut AHashSet<&'a str>, out: &mut Vec<(&'a str, &'a ExprLoc)>) {
    for stmt in body {
        match stmt {
            Stmt::Assign { target, value } | Stmt::OpAssign { target, value, .. } => {
                if matches!(target.binding, Binding::Local(_)) {
                    locals.insert(&target.name);
                    out.push((&target.name, value));
                }
            }
            Stmt::FunctionDef(def) => {
                locals.insert(&def.name.name);
            }
            Stmt::If { body, or_else, .. } => {
                local_assignments(body, locals, out);
                local_assignments(or_else, locals, out);
            }
            Stmt::For { target, body, .. } => {
                locals.insert(&target.name);
                local_assignments(body, locals, out);
            }
            Stmt::With { body, .. } => local_assignments(body, locals, out),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{classify::classify, config::BuildConfig, graph::ModuleGraph, prepare::prepare};

    fn check(files: &[(&str, &str)]) -> Result<(), ServerLeakError> {
        let sources = files.iter().map(|(n, s)| ((*n).to_owned(), (*s).to_owned())).collect();
        let config = BuildConfig::default().with_entries(["main"]);
        let graph = ModuleGraph::from_sources(sources, &config, None).unwrap();
        let classification = classify(&graph, &config);
        let prepared = prepare(&graph, &classification, &config).unwrap();
        validate(&prepared, &classification)
    }

    const SECRETS: (&str, &str) = ("secrets", "__boundary__ = 'server'\nSECRET = 'hunter2'\n");

    #[test]
    fn closure_capturing_a_tainted_local_is_rejected() {
        let err = check(&[
            SECRETS,
            (
                "main",
                "from secrets import SECRET\n@component\ndef App():\n    def show():\n        return key\n    key = SECRET\n    Button('go', on_click=show)\n",
            ),
        ])
        .unwrap_err();
        assert_eq!(err.symbol, "secrets.SECRET");
        assert_eq!(err.function, "App");
        assert_eq!(
            err.kind,
            LeakKind::Capture {
                variable: "key".to_owned()
            }
        );
    }

    #[test]
    fn direct_reference_is_rejected() {
        let err = check(&[SECRETS, ("main", "import secrets\nText(secrets.SECRET)\n")]).unwrap_err();
        assert_eq!(err.kind, LeakKind::Reference);
        assert_eq!(err.function, "<module>");
        assert_eq!(err.symbol, "secrets.SECRET");
    }

    #[test]
    fn rpc_callee_and_client_locals_pass() {
        check(&[
            (
                "api",
                "__boundary__ = 'server'\nimport sqlite3\n@rpc\ndef save(n):\n    return n\n",
            ),
            (
                "main",
                "from api import save\ncount = Signal(0)\n@component\ndef App():\n    label = 'Save'\n    def click():\n        save(count.value)\n    Button(label, on_click=click)\n",
            ),
        ])
        .unwrap();
    }

    #[test]
    fn rpc_as_value_is_rejected() {
        let err = check(&[
            ("api", "__boundary__ = 'server'\n@rpc\ndef save(n):\n    return n\n"),
            ("main", "from api import save\nhandler = save\n"),
        ])
        .unwrap_err();
        assert_eq!(err.symbol, "api.save");
    }
}
