//! The build pipeline: graph, classification, preparation, sentinel, linking,
//! compilation and encoding.
//!
//! The sentinel runs before any client code is emitted and cannot be skipped.

use std::{fmt, path::Path};

use crate::{
    bytecode::{ArtifactError, Program, encode},
    cache::{CacheError, ModuleCache},
    classify::{Classification, classify},
    compiler::{CompileError, compile},
    config::{BuildConfig, ConfigError},
    graph::{GraphError, ModuleError, ModuleGraph},
    link::{LinkError, link},
    prepare::prepare,
    sentinel::{ServerLeakError, validate},
    style::StyleRegistry,
};

/// Configuration file looked up next to the sources by [`build_project`].
pub const CONFIG_FILE: &str = "ripple.toml";

/// Entry module of [`compile_source`].
pub const DEFAULT_ENTRY: &str = "main";

/// A finished build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// Encoded artifact, see [`Program::load`].
    pub artifact: Vec<u8>,
    pub styles: StyleRegistry,
    /// Stable names of the server functions the client calls remotely.
    pub remote_functions: Vec<String>,
    pub classification: Classification,
}

impl BuildOutput {
    /// Loads (and verifies) the artifact.
    pub fn program(&self) -> Result<Program, ArtifactError> {
        Program::load(&self.artifact)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    Config(ConfigError),
    Graph(GraphError),
    Cache(CacheError),
    /// Every module that failed to parse.
    Parse(Vec<ModuleError>),
    /// No entry module was found or configured.
    NoEntry,
    Leak(ServerLeakError),
    Link(LinkError),
    Compile(CompileError),
    Artifact(ArtifactError),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Graph(err) => write!(f, "{err}"),
            Self::Cache(err) => write!(f, "{err}"),
            Self::Parse(errors) => {
                for (index, err) in errors.iter().enumerate() {
                    if index > 0 {
                        f.write_str("\n")?;
                    }
                    write!(f, "{err}")?;
                }
                Ok(())
            }
            Self::NoEntry => f.write_str("no entry module: configure `entries` or define a @component"),
            Self::Leak(err) => write!(f, "server leak: {err}"),
            Self::Link(err) => write!(f, "{err}"),
            Self::Compile(err) => write!(f, "{err}"),
            Self::Artifact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for BuildError {}

impl From<ConfigError> for BuildError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<GraphError> for BuildError {
    fn from(err: GraphError) -> Self {
        Self::Graph(err)
    }
}

impl From<CacheError> for BuildError {
    fn from(err: CacheError) -> Self {
        Self::Cache(err)
    }
}

impl From<ServerLeakError> for BuildError {
    fn from(err: ServerLeakError) -> Self {
        Self::Leak(err)
    }
}

impl From<LinkError> for BuildError {
    fn from(err: LinkError) -> Self {
        Self::Link(err)
    }
}

impl From<CompileError> for BuildError {
    fn from(err: CompileError) -> Self {
        Self::Compile(err)
    }
}

impl From<ArtifactError> for BuildError {
    fn from(err: ArtifactError) -> Self {
        Self::Artifact(err)
    }
}

/// Builds the client artifact of a parsed module graph.
pub fn build(graph: &ModuleGraph, config: &BuildConfig) -> Result<BuildOutput, BuildError> {
    let errors = graph.errors();
    if !errors.is_empty() {
        return Err(BuildError::Parse(errors));
    }

    let classification = classify(graph, config);
    if classification.entries().is_empty() {
        return Err(BuildError::NoEntry);
    }
    let mut prepared = prepare(graph, &classification, config)?;
    validate(&prepared, &classification)?;
    link(&mut prepared)?;
    let compiled = compile(&prepared)?;
    let artifact = encode(&compiled.code)?;

    Ok(BuildOutput {
        artifact,
        styles: compiled.styles,
        remote_functions: compiled.remote_functions,
        classification,
    })
}

/// Builds every module below `root`, using and refreshing the module cache when
/// the configuration names one (relative paths are taken from `root`).
pub fn build_dir(root: &Path, config: &BuildConfig) -> Result<BuildOutput, BuildError> {
    let Some(cache_path) = &config.cache_path else {
        let graph = ModuleGraph::from_dir(root, config, None)?;
        return build(&graph, config);
    };
    let cache_path = root.join(cache_path);
    let mut cache = ModuleCache::load(&cache_path)?;
    let graph = ModuleGraph::from_dir(root, config, Some(&mut cache))?;
    cache.save(&cache_path)?;
    build(&graph, config)
}

/// Like [`build_dir`], reading the configuration from `root/ripple.toml` when present.
pub fn build_project(root: &Path) -> Result<BuildOutput, BuildError> {
    let path = root.join(CONFIG_FILE);
    let config = if path.is_file() {
        BuildConfig::load(&path)?
    } else {
        BuildConfig::default()
    };
    build_dir(root, &config)
}

/// Builds in-memory `(module name, source)` pairs.
pub fn compile_sources(sources: &[(&str, &str)], config: &BuildConfig) -> Result<BuildOutput, BuildError> {
    let sources = sources
        .iter()
        .map(|(name, source)| ((*name).to_owned(), (*source).to_owned()))
        .collect();
    let graph = ModuleGraph::from_sources(sources, config, None)?;
    build(&graph, config)
}

/// Builds a single module named `main`, which is the entry.
pub fn compile_source(source: &str) -> Result<BuildOutput, BuildError> {
    let config = BuildConfig::default().with_entries([DEFAULT_ENTRY]);
    compile_sources(&[(DEFAULT_ENTRY, source)], &config)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_errors_are_collected() {
        let err = compile_sources(
            &[("a", "while x:\n    pass\n"), ("b", "import\n"), ("main", "x = 1\n")],
            &BuildConfig::default().with_entries(["main"]),
        )
        .unwrap_err();
        let BuildError::Parse(errors) = &err else {
            panic!("expected parse errors, got {err}");
        };
        let modules: Vec<_> = errors.iter().map(|e| e.module.as_str()).collect();
        assert_eq!(modules, vec!["a", "b"]);
    }

    #[test]
    fn missing_entry_is_reported() {
        let err = compile_sources(&[("lib", "x = 1\n")], &BuildConfig::default()).unwrap_err();
        assert_eq!(err, BuildError::NoEntry);
    }

    #[test]
    fn output_lists_remote_functions() {
        let output = compile_sources(
            &[
                ("api", "__boundary__ = 'server'\n@rpc\ndef load(n):\n    return n\n"),
                ("main", "from api import load\ndata = Signal(None)\ndata.value = load(1)\n"),
            ],
            &BuildConfig::default().with_entries(["main"]),
        )
        .unwrap();
        assert_eq!(output.remote_functions, vec!["api.load".to_owned()]);
        assert!(output.program().is_ok());
    }
}
