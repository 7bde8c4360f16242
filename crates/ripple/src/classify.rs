//! Boundary classification of modules and module-level symbols.
//!
//! A module is `server` when it is annotated so or imports a deny-listed module.
//! Modules reachable from an entry without passing through a server module are
//! `client`, the other parsed modules are `shared` and unparsable ones stay
//! `unknown`. Symbols get a [`SymbolRecord`] whose origin the sentinel checks; a
//! symbol nobody could classify counts as server.

use ahash::AHashSet;
use indexmap::IndexMap;

use crate::{
    config::BuildConfig,
    expressions::{Expr, ExprLoc, FStringPart, FunctionDef, Stmt},
    graph::ModuleGraph,
    parse::{Boundary, CodeRange, ParsedModule},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ModuleClass {
    #[default]
    Unknown,
    Client,
    Server,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Origin {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Component,
    Variable,
    Import,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRecord {
    pub origin: Origin,
    pub kind: SymbolKind,
    /// `@rpc`: callable from client code through a remote call.
    pub remote: bool,
    pub position: CodeRange,
}

/// Result of classifying a module graph. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    modules: IndexMap<String, ModuleClass>,
    /// Keyed by qualified name, `module.symbol`.
    symbols: IndexMap<String, SymbolRecord>,
    entries: Vec<String>,
}

impl Classification {
    #[must_use]
    pub fn module(&self, name: &str) -> ModuleClass {
        self.modules.get(name).copied().unwrap_or_default()
    }

    pub fn modules(&self) -> impl Iterator<Item = (&str, ModuleClass)> {
        self.modules.iter().map(|(name, class)| (name.as_str(), *class))
    }

    #[must_use]
    pub fn symbol(&self, qualified: &str) -> Option<&SymbolRecord> {
        self.symbols.get(qualified)
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&str, &SymbolRecord)> {
        self.symbols.iter().map(|(name, record)| (name.as_str(), record))
    }

    /// Origin of a symbol; unknown symbols are server.
    #[must_use]
    pub fn origin(&self, qualified: &str) -> Origin {
        self.symbols.get(qualified).map_or(Origin::Server, |record| record.origin)
    }

    #[must_use]
    pub fn is_remote(&self, qualified: &str) -> bool {
        self.symbols.get(qualified).is_some_and(|record| record.remote)
    }

    /// Entry modules the client half was grown from.
    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

/// Classifies every module of `graph` and every module-level symbol.
#[must_use]
pub fn classify(graph: &ModuleGraph, config: &BuildConfig) -> Classification {
    let mut classification = Classification::default();

    let server: AHashSet<&str> = graph
        .modules()
        .filter(|module| {
            module.parsed.as_ref().is_ok_and(|parsed| {
                parsed.boundary == Some(Boundary::Server)
                    || parsed.imports.iter().any(|edge| config.is_server_only(&edge.module))
            })
        })
        .map(|module| module.name.as_str())
        .collect();

    let entries: Vec<String> = if config.entries.is_empty() {
        graph
            .modules()
            .filter(|module| !server.contains(module.name.as_str()))
            .filter(|module| module.parsed.as_ref().is_ok_and(is_default_entry))
            .map(|module| module.name.clone())
            .collect()
    } else {
        config
            .entries
            .iter()
            .filter(|name| graph.contains(name) && !server.contains(name.as_str()))
            .cloned()
            .collect()
    };

    let mut reached: AHashSet<&str> = AHashSet::new();
    let mut queue: Vec<&str> = entries.iter().map(String::as_str).collect();
    while let Some(name) = queue.pop() {
        if server.contains(name) || !reached.insert(name) {
            continue;
        }
        queue.extend(graph.project_imports(name));
    }

    for module in graph.modules() {
        let class = match &module.parsed {
            Err(_) => ModuleClass::Unknown,
            Ok(_) if server.contains(module.name.as_str()) => ModuleClass::Server,
            Ok(_) if reached.contains(module.name.as_str()) => ModuleClass::Client,
            Ok(_) => ModuleClass::Shared,
        };
        classification.modules.insert(module.name.clone(), class);
    }
    classification.entries = entries;

    for name in graph.dependency_order() {
        if let Some(Ok(parsed)) = graph.get(name).map(|module| &module.parsed) {
            let is_server = server.contains(name);
            SymbolCollector {
                classification: &mut classification,
                graph,
                config,
                module: parsed,
                is_server,
                names: IndexMap::new(),
            }
            .collect();
        }
    }
    classification
}

/// Modules that start the client half when no entries are configured.
fn is_default_entry(parsed: &ParsedModule) -> bool {
    parsed.boundary == Some(Boundary::Client)
        || parsed
            .body
            .iter()
            .any(|stmt| matches!(stmt, Stmt::FunctionDef(def) if def.decorators.component))
}

struct SymbolCollector<'a> {
    classification: &'a mut Classification,
    graph: &'a ModuleGraph,
    config: &'a BuildConfig,
    module: &'a ParsedModule,
    is_server: bool,
    /// Module-level name -> qualified symbol.
    names: IndexMap<&'a str, String>,
}

impl<'a> SymbolCollector<'a> {
    fn collect(mut self) {
        let module = self.module;
        // functions and imports are visible to every initializer
        for stmt in &module.body {
            match stmt {
                Stmt::FunctionDef(def) => self.function(def),
                Stmt::Import { names, .. } => {
                    for import in names {
                        let origin = self.module_origin(&import.name);
                        self.record(&import.alias.name, origin, SymbolKind::Import, false, import.alias.position);
                    }
                }
                Stmt::ImportFrom { module, names, .. } => {
                    for import in names {
                        let origin = self.imported_origin(module, &import.name);
                        self.record(&import.alias.name, origin, SymbolKind::Import, false, import.alias.position);
                    }
                }
                _ => {}
            }
        }
        for stmt in &module.body {
            let (target, value) = match stmt {
                Stmt::Assign { target, value } | Stmt::OpAssign { target, value, .. } => (target, value),
                _ => continue,
            };
            let origin = if self.is_server || self.references_server(value, &mut Vec::new()) {
                Origin::Server
            } else {
                Origin::Client
            };
            self.record(&target.name, origin, SymbolKind::Variable, false, target.position);
        }
    }

    fn function(&mut self, def: &'a FunctionDef) {
        let origin = if def.decorators.client {
            Origin::Client
        } else if self.is_server || def.decorators.server || def.decorators.rpc {
            Origin::Server
        } else {
            Origin::Client
        };
        let kind = if def.decorators.component {
            SymbolKind::Component
        } else {
            SymbolKind::Function
        };
        self.record(&def.name.name, origin, kind, def.decorators.rpc, def.position);
    }

    /// Records a module-level symbol. A server origin is never downgraded by a
    /// later assignment.
    fn record(&mut self, name: &'a str, origin: Origin, kind: SymbolKind, remote: bool, position: CodeRange) {
        let qualified = format!("{}.{name}", self.module.name);
        let entry = self
            .classification
            .symbols
            .entry(qualified.clone())
            .or_insert(SymbolRecord {
                origin,
                kind,
                remote,
                position,
            });
        if origin == Origin::Server {
            entry.origin = Origin::Server;
        }
        self.names.insert(name, qualified);
    }

    /// Origin of a whole imported module bound to a name.
    fn module_origin(&self, module: &str) -> Origin {
        if self.is_server {
            return Origin::Server;
        }
        if self.graph.contains(module) {
            if self.classification.module(module) == ModuleClass::Server {
                Origin::Server
            } else {
                Origin::Client
            }
        } else if self.config.is_client_safe(module) {
            Origin::Client
        } else {
            Origin::Server
        }
    }

    /// Origin of `name` imported from `module`.
    fn imported_origin(&self, module: &str, name: &str) -> Origin {
        if self.is_server {
            return Origin::Server;
        }
        if !self.graph.contains(module) {
            return self.module_origin(module);
        }
        match self.classification.symbols.get(&format!("{module}.{name}")) {
            Some(record) => record.origin,
            None => self.module_origin(module),
        }
    }

    /// Whether `expr` references a server symbol. A direct call of an `@rpc`
    /// function does not count, its result arrives through the remote call.
    fn references_server(&self, expr: &'a ExprLoc, shadowed: &mut Vec<&'a str>) -> bool {
        match &expr.expr {
            Expr::Literal(_) => false,
            Expr::Name(ident) | Expr::SignalRead(ident) => self.name_is_server(&ident.name, shadowed),
            Expr::ModuleAttr { module, attr } => {
                if shadowed.contains(&module.name.as_str()) {
                    return false;
                }
                match self.module_alias(&module.name) {
                    Some(target) if self.graph.contains(target) => {
                        self.classification.origin(&format!("{target}.{}", attr.name)) == Origin::Server
                    }
                    _ => self.name_is_server(&module.name, shadowed),
                }
            }
            Expr::Subscript { object, index } => {
                self.references_server(object, shadowed) || self.references_server(index, shadowed)
            }
            Expr::List(items) => items.iter().any(|item| self.references_server(item, shadowed)),
            Expr::Dict(pairs) => pairs
                .iter()
                .any(|(k, v)| self.references_server(k, shadowed) || self.references_server(v, shadowed)),
            Expr::FString(parts) => parts.iter().any(|part| match part {
                FStringPart::Literal(_) => false,
                FStringPart::Interpolation(expr) => self.references_server(expr, shadowed),
            }),
            Expr::Op { left, right, .. } | Expr::Cmp { left, right, .. } | Expr::Bool { left, right, .. } => {
                self.references_server(left, shadowed) || self.references_server(right, shadowed)
            }
            Expr::Unary { operand, .. } => self.references_server(operand, shadowed),
            Expr::IfElse { test, body, orelse } => {
                self.references_server(test, shadowed)
                    || self.references_server(body, shadowed)
                    || self.references_server(orelse, shadowed)
            }
            Expr::Call(call) => {
                let remote_callee = match &call.callee.expr {
                    Expr::Name(ident) => !shadowed.contains(&ident.name.as_str()) && self.is_rpc(&ident.name),
                    _ => false,
                };
                (!remote_callee && self.references_server(&call.callee, shadowed))
                    || call.args.iter().any(|arg| self.references_server(arg, shadowed))
                    || call.kwargs.iter().any(|kwarg| self.references_server(&kwarg.value, shadowed))
            }
            Expr::Lambda(def) => {
                let before = shadowed.len();
                shadowed.extend(def.params.iter().map(|param| param.name.as_str()));
                let tainted = def.body.iter().any(|stmt| match stmt {
                    Stmt::Return { value: Some(value), .. } => self.references_server(value, shadowed),
                    _ => false,
                });
                shadowed.truncate(before);
                tainted
            }
        }
    }

    fn name_is_server(&self, name: &str, shadowed: &[&str]) -> bool {
        if shadowed.contains(&name) {
            return false;
        }
        self.names
            .get(name)
            .is_some_and(|qualified| self.classification.origin(qualified) == Origin::Server)
    }

    fn is_rpc(&self, name: &str) -> bool {
        let Some(qualified) = self.names.get(name) else {
            return false;
        };
        if self.classification.is_remote(qualified) {
            return true;
        }
        // `from api import save` refers to the record in `api`
        self.module.body.iter().any(|stmt| match stmt {
            Stmt::ImportFrom { module, names, .. } => names
                .iter()
                .any(|import| import.alias.name == name && self.classification.is_remote(&format!("{module}.{}", import.name))),
            _ => false,
        })
    }

    /// Project module bound to `alias` by `import module as alias`.
    fn module_alias(&self, alias: &str) -> Option<&'a str> {
        let module = self.module;
        module.body.iter().find_map(|stmt| match stmt {
            Stmt::Import { names, .. } => names
                .iter()
                .find(|import| import.alias.name == alias)
                .map(|import| import.name.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn classify_sources(files: &[(&str, &str)]) -> Classification {
        let sources = files.iter().map(|(n, s)| ((*n).to_owned(), (*s).to_owned())).collect();
        let config = BuildConfig::default();
        let graph = ModuleGraph::from_sources(sources, &config, None).unwrap();
        classify(&graph, &config)
    }

    #[test]
    fn modules_are_split_by_reachability() {
        let classification = classify_sources(&[
            (
                "app",
                "from ripple import component, Text\nimport widgets\nimport db\n@component\ndef App():\n    Text('hi')\n",
            ),
            ("widgets", "x = 1\n"),
            ("db", "import sqlite3\n"),
            ("tools", "import widgets\n"),
            ("broken", "while True:\n    pass\n"),
        ]);
        let classes: Vec<_> = classification.modules().collect();
        assert_eq!(
            classes,
            vec![
                ("app", ModuleClass::Client),
                ("broken", ModuleClass::Unknown),
                ("db", ModuleClass::Server),
                ("tools", ModuleClass::Shared),
                ("widgets", ModuleClass::Client),
            ]
        );
        assert_eq!(classification.entries(), ["app".to_owned()]);
    }

    #[test]
    fn symbols_carry_origin() {
        let classification = classify_sources(&[
            ("db", "__boundary__ = 'server'\nSECRET = 'k'\n@client\ndef fmt(x):\n    return x\n"),
            (
                "app",
                "__boundary__ = 'client'\nfrom db import SECRET, fmt\nfrom ripple import rpc, server\nimport requests\n\
                 @rpc\ndef save(x):\n    pass\n@server\ndef purge():\n    pass\n\
                 a = 1\nb = SECRET\nc = save(a)\nd = lambda SECRET: SECRET\ne = requests\n",
            ),
        ]);
        assert_eq!(classification.origin("db.SECRET"), Origin::Server);
        assert_eq!(classification.origin("db.fmt"), Origin::Client);
        assert_eq!(classification.origin("app.fmt"), Origin::Client);
        assert_eq!(classification.origin("app.SECRET"), Origin::Server);
        assert_eq!(classification.origin("app.save"), Origin::Server);
        assert!(classification.is_remote("app.save"));
        assert_eq!(classification.origin("app.purge"), Origin::Server);
        assert_eq!(classification.origin("app.a"), Origin::Client);
        assert_eq!(classification.origin("app.b"), Origin::Server);
        assert_eq!(classification.origin("app.c"), Origin::Client);
        assert_eq!(classification.origin("app.d"), Origin::Client);
        assert_eq!(classification.origin("app.requests"), Origin::Server);
        assert_eq!(classification.origin("app.e"), Origin::Server);
        assert_eq!(classification.origin("app.missing"), Origin::Server);
    }
}
