//! Build configuration.
//!
//! Loaded from a TOML file (usually `ripple.toml` next to the sources). Every field
//! has a default, so an empty file is a valid configuration:
//!
//! ```toml
//! server_only_modules = ["os", "sqlite3", "billing"]
//! client_safe_modules = ["math"]
//! entries = ["app"]
//! cache_path = ".ripple-cache"
//! ```

use std::{
    borrow::Cow,
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// Modules whose import marks a module as server-only unless configured otherwise.
pub const DEFAULT_SERVER_ONLY: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "sqlite3",
    "shutil",
    "pathlib",
    "psycopg2",
    "sqlalchemy",
    "redis",
    "boto3",
];

/// External modules client code may import.
pub const DEFAULT_CLIENT_SAFE: &[&str] = &["math", "json"];

pub const DEFAULT_PRELUDE: &str = "ripple";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Importing any of these (or a submodule) makes a module server-only.
    pub server_only_modules: Vec<String>,
    /// External modules whose symbols are client safe. The prelude always is.
    pub client_safe_modules: Vec<String>,
    /// Entry modules. When empty, every non-server module annotated `client` or
    /// defining a `@component` is an entry.
    pub entries: Vec<String>,
    /// Module name of the UI prelude (`from ripple import Signal, Text`).
    pub prelude_module: String,
    /// Parse modules on the rayon thread pool.
    pub parallel: bool,
    /// Where parsed modules are cached between builds; no cache when unset.
    pub cache_path: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            server_only_modules: DEFAULT_SERVER_ONLY.iter().map(|m| (*m).to_owned()).collect(),
            client_safe_modules: DEFAULT_CLIENT_SAFE.iter().map(|m| (*m).to_owned()).collect(),
            entries: Vec::new(),
            prelude_module: DEFAULT_PRELUDE.to_owned(),
            parallel: true,
            cache_path: None,
        }
    }
}

/// Error returned when a configuration cannot be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io { path: PathBuf, msg: Cow<'static, str> },
    Parse(Cow<'static, str>),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, msg } => write!(f, "cannot read {}: {msg}", path.display()),
            Self::Parse(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl BuildConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml_edit::de::from_str(text).map_err(|err| ConfigError::Parse(err.to_string().into()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.to_path_buf(),
            msg: err.to_string().into(),
        })?;
        Self::from_toml(&text)
    }

    /// Same configuration with `entries` replaced.
    #[must_use]
    pub fn with_entries(mut self, entries: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.entries = entries.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// Whether importing `module` makes the importer server-only.
    #[must_use]
    pub fn is_server_only(&self, module: &str) -> bool {
        self.server_only_modules.iter().any(|m| matches_module(m, module))
    }

    /// Whether symbols imported from the external module `module` are client safe.
    #[must_use]
    pub fn is_client_safe(&self, module: &str) -> bool {
        self.is_prelude(module) || self.client_safe_modules.iter().any(|m| matches_module(m, module))
    }

    #[must_use]
    pub fn is_prelude(&self, module: &str) -> bool {
        matches_module(&self.prelude_module, module)
    }
}

/// `pattern` names `module` itself or one of its parent packages.
fn matches_module(pattern: &str, module: &str) -> bool {
    module
        .strip_prefix(pattern)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(BuildConfig::from_toml("").unwrap(), BuildConfig::default());
    }

    #[test]
    fn fields_override_defaults() {
        let config = BuildConfig::from_toml(
            r#"
            server_only_modules = ["billing"]
            entries = ["app"]
            parallel = false
            cache_path = "cache.bin"
            "#,
        )
        .unwrap();
        assert_eq!(config.server_only_modules, vec!["billing".to_owned()]);
        assert_eq!(config.entries, vec!["app".to_owned()]);
        assert!(!config.parallel);
        assert_eq!(config.cache_path, Some(PathBuf::from("cache.bin")));
        assert_eq!(config.prelude_module, "ripple");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = BuildConfig::from_toml("entires = [\"app\"]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "{err}");
    }

    #[test]
    fn prefix_matching_respects_dots() {
        let config = BuildConfig::default();
        assert!(config.is_server_only("os"));
        assert!(config.is_server_only("os.path"));
        assert!(!config.is_server_only("osmium"));
        assert!(config.is_client_safe("ripple"));
        assert!(config.is_client_safe("math"));
        assert!(!config.is_client_safe("requests"));
    }
}
