//! Module dependency graph.
//!
//! Every module is parsed independently, on the rayon pool when the configuration
//! allows it. Workers only return their parse results; the graph itself, the module
//! cache and all bookkeeping are touched by the calling thread alone, after the
//! workers finish. A module that fails to parse keeps its error and does not stop
//! its siblings.

use std::{
    borrow::Cow,
    fmt,
    path::{Path, PathBuf},
};

use ahash::AHashSet;
use indexmap::IndexMap;
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::{
    cache::{ModuleCache, content_hash},
    config::BuildConfig,
    parse::{ImportEdge, ParseError, ParsedModule, parse},
};

/// Source file extension of modules.
pub const SOURCE_EXTENSION: &str = "py";

#[derive(Debug)]
pub struct Module {
    pub name: String,
    /// File the source came from, when built from a directory.
    pub path: Option<PathBuf>,
    pub source: String,
    pub parsed: Result<ParsedModule, ParseError>,
}

impl Module {
    /// Import edges, empty when the module failed to parse.
    #[must_use]
    pub fn imports(&self) -> &[ImportEdge] {
        match &self.parsed {
            Ok(parsed) => &parsed.imports,
            Err(_) => &[],
        }
    }
}

/// A parse error together with the module it happened in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleError {
    pub module: String,
    pub error: ParseError,
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.error)
    }
}

impl std::error::Error for ModuleError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    Io { path: PathBuf, msg: Cow<'static, str> },
    /// Two sources map to the same module name. `path` is set for files on disk.
    DuplicateModule { module: String, path: Option<PathBuf> },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, msg } => write!(f, "{}: {msg}", path.display()),
            Self::DuplicateModule {
                module,
                path: Some(path),
            } => write!(f, "{}: module '{module}' is defined twice", path.display()),
            Self::DuplicateModule { module, path: None } => write!(f, "module '{module}' is defined twice"),
        }
    }
}

impl std::error::Error for GraphError {}

/// All modules of a program, ordered by name.
#[derive(Debug, Default)]
pub struct ModuleGraph {
    modules: IndexMap<String, Module>,
    prelude: String,
    cache_hits: usize,
}

impl ModuleGraph {
    /// Builds the graph from in-memory `(module name, source)` pairs.
    ///
    /// Unchanged modules are taken from `cache`; fresh parses are added to it.
    pub fn from_sources(
        sources: Vec<(String, String)>,
        config: &BuildConfig,
        cache: Option<&mut ModuleCache>,
    ) -> Result<Self, GraphError> {
        let mut seen = AHashSet::new();
        if let Some((name, _)) = sources.iter().find(|(name, _)| !seen.insert(name.as_str())) {
            return Err(GraphError::DuplicateModule {
                module: name.clone(),
                path: None,
            });
        }
        Ok(Self::build(
            sources.into_iter().map(|(name, source)| (name, None, source)).collect(),
            config,
            cache,
        ))
    }

    /// Builds the graph from every `*.py` file below `root`.
    ///
    /// `pkg/view.py` becomes module `pkg.view` and `pkg/__init__.py` becomes `pkg`.
    /// Hidden directories and `__pycache__` are skipped.
    pub fn from_dir(root: &Path, config: &BuildConfig, cache: Option<&mut ModuleCache>) -> Result<Self, GraphError> {
        let mut sources = Vec::new();
        let mut seen = AHashSet::new();
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry));
        for entry in walker {
            let entry = entry.map_err(|err| GraphError::Io {
                path: err.path().unwrap_or(root).to_path_buf(),
                msg: err.to_string().into(),
            })?;
            if !entry.file_type().is_file() || entry.path().extension().is_none_or(|ext| ext != SOURCE_EXTENSION) {
                continue;
            }
            let path = entry.path().to_path_buf();
            let Some(name) = module_name(root, &path) else {
                continue;
            };
            if !seen.insert(name.clone()) {
                return Err(GraphError::DuplicateModule {
                    module: name,
                    path: Some(path),
                });
            }
            let source = std::fs::read_to_string(&path).map_err(|err| GraphError::Io {
                path: path.clone(),
                msg: err.to_string().into(),
            })?;
            sources.push((name, Some(path), source));
        }
        Ok(Self::build(sources, config, cache))
    }

    fn build(sources: Vec<(String, Option<PathBuf>, String)>, config: &BuildConfig, cache: Option<&mut ModuleCache>) -> Self {
        let hashes: Vec<_> = sources.iter().map(|(name, _, source)| content_hash(name, source)).collect();

        let mut results: Vec<Option<Result<ParsedModule, ParseError>>> = Vec::with_capacity(sources.len());
        let mut misses = Vec::new();
        let mut cache_hits = 0;
        for (index, hash) in hashes.iter().enumerate() {
            match cache.as_deref().and_then(|cache| cache.get(hash)) {
                Some(module) => {
                    cache_hits += 1;
                    results.push(Some(Ok(module.clone())));
                }
                None => {
                    misses.push(index);
                    results.push(None);
                }
            }
        }

        let parse_one = |&index: &usize| {
            let (name, _, source) = &sources[index];
            (index, parse(source, name))
        };
        let parsed: Vec<_> = if config.parallel {
            misses.par_iter().map(parse_one).collect()
        } else {
            misses.iter().map(parse_one).collect()
        };

        let mut cache = cache;
        for (index, result) in parsed {
            if let (Some(cache), Ok(module)) = (cache.as_deref_mut(), &result) {
                cache.insert(hashes[index], module.clone());
            }
            results[index] = Some(result);
        }

        let mut modules: IndexMap<String, Module> = sources
            .into_iter()
            .zip(results)
            .filter_map(|((name, path, source), parsed)| {
                let parsed = parsed?;
                Some((
                    name.clone(),
                    Module {
                        name,
                        path,
                        source,
                        parsed,
                    },
                ))
            })
            .collect();
        modules.sort_keys();
        Self {
            modules,
            prelude: config.prelude_module.clone(),
            cache_hits,
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules taken from the cache instead of being parsed.
    #[must_use]
    pub fn cache_hits(&self) -> usize {
        self.cache_hits
    }

    /// Project modules imported by `name`, deduplicated, in import order.
    #[must_use]
    pub fn project_imports(&self, name: &str) -> Vec<&str> {
        self.edges(name, true)
    }

    /// Imported modules that are not part of the project (the prelude excluded).
    #[must_use]
    pub fn external_imports(&self, name: &str) -> Vec<&str> {
        self.edges(name, false)
    }

    fn edges(&self, name: &str, project: bool) -> Vec<&str> {
        let Some(module) = self.modules.get(name) else {
            return Vec::new();
        };
        let mut edges: Vec<&str> = Vec::new();
        for edge in module.imports() {
            let target = edge.module.as_str();
            if target == self.prelude || self.contains(target) != project || edges.contains(&target) {
                continue;
            }
            edges.push(target);
        }
        edges
    }

    /// Parse errors of all modules, in module order.
    #[must_use]
    pub fn errors(&self) -> Vec<ModuleError> {
        self.modules
            .values()
            .filter_map(|module| {
                module.parsed.as_ref().err().map(|error| ModuleError {
                    module: module.name.clone(),
                    error: error.clone(),
                })
            })
            .collect()
    }

    /// Module names with every module after the project modules it imports.
    ///
    /// Import cycles are broken at the edge that closes them.
    #[must_use]
    pub fn dependency_order(&self) -> Vec<&str> {
        let mut order = Vec::with_capacity(self.modules.len());
        let mut visited = AHashSet::new();
        for name in self.modules.keys() {
            self.visit(name, &mut visited, &mut order);
        }
        order
    }

    fn visit<'a>(&'a self, name: &'a str, visited: &mut AHashSet<&'a str>, order: &mut Vec<&'a str>) {
        if !visited.insert(name) {
            return;
        }
        for dependency in self.project_imports(name) {
            self.visit(dependency, visited, order);
        }
        order.push(name);
    }
}

fn is_skipped_dir(entry: &walkdir::DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    entry.file_type().is_dir() && (name.starts_with('.') || name == "__pycache__")
}

/// Dotted module name of a source file below `root`.
fn module_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?.with_extension("");
    let mut parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.last().is_some_and(|last| last == "__init__") {
        parts.pop();
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("."))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sources(files: &[(&str, &str)]) -> Vec<(String, String)> {
        files.iter().map(|(n, s)| ((*n).to_owned(), (*s).to_owned())).collect()
    }

    #[test]
    fn module_names_follow_packages() {
        let root = Path::new("/src");
        assert_eq!(module_name(root, Path::new("/src/app.py")).as_deref(), Some("app"));
        assert_eq!(module_name(root, Path::new("/src/pkg/view.py")).as_deref(), Some("pkg.view"));
        assert_eq!(module_name(root, Path::new("/src/pkg/__init__.py")).as_deref(), Some("pkg"));
    }

    #[test]
    fn dependencies_come_first() {
        let graph = ModuleGraph::from_sources(
            sources(&[
                ("app", "import state\nimport widgets\nfrom ripple import Text\n"),
                ("widgets", "import state\n"),
                ("state", "import math\n"),
            ]),
            &BuildConfig::default(),
            None,
        )
        .unwrap();
        assert_eq!(graph.dependency_order(), vec!["state", "widgets", "app"]);
        assert_eq!(graph.project_imports("app"), vec!["state", "widgets"]);
        assert_eq!(graph.external_imports("state"), vec!["math"]);
        assert!(graph.external_imports("app").is_empty());
    }

    #[test]
    fn cycles_terminate() {
        let graph = ModuleGraph::from_sources(
            sources(&[("a", "import b\n"), ("b", "import a\n")]),
            &BuildConfig::default().sequential(),
            None,
        )
        .unwrap();
        assert_eq!(graph.dependency_order(), vec!["b", "a"]);
    }

    #[test]
    fn parse_errors_are_per_module() {
        let graph = ModuleGraph::from_sources(
            sources(&[("bad", "while True:\n    pass\n"), ("good", "x = 1\n")]),
            &BuildConfig::default(),
            None,
        )
        .unwrap();
        assert_eq!(graph.len(), 2);
        assert!(graph.get("good").unwrap().parsed.is_ok());
        let errors = graph.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "bad:1:1: not supported: `while` statements");
    }

    #[test]
    fn cache_skips_unchanged_modules() {
        let mut cache = ModuleCache::new();
        let files = sources(&[("a", "x = 1\n"), ("b", "y = 2\n")]);
        let first = ModuleGraph::from_sources(files.clone(), &BuildConfig::default(), Some(&mut cache)).unwrap();
        assert_eq!(first.cache_hits(), 0);
        assert_eq!(cache.len(), 2);

        let mut changed = files;
        changed[1].1 = "y = 3\n".to_owned();
        let second = ModuleGraph::from_sources(changed, &BuildConfig::default(), Some(&mut cache)).unwrap();
        assert_eq!(second.cache_hits(), 1);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn duplicate_module_names_are_rejected() {
        let err = ModuleGraph::from_sources(
            sources(&[("app", "x = 1\n"), ("app", "x = 2\n")]),
            &BuildConfig::default(),
            None,
        )
        .unwrap_err();
        assert!(matches!(&err, GraphError::DuplicateModule { module, path: None } if module == "app"));
        assert_eq!(err.to_string(), "module 'app' is defined twice");
    }
}
