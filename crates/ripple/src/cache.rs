//! Content-addressed cache of parsed modules.
//!
//! Entries are keyed by the SHA-256 of the module name and its source text, so an
//! edited or renamed file misses and an unchanged one skips the parser. The cache is
//! only touched from the thread that coordinates a build.

use std::{borrow::Cow, collections::BTreeMap, fmt, io::ErrorKind, path::Path};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::parse::ParsedModule;

/// Bumped whenever the serialized syntax tree changes shape.
const CACHE_FORMAT: u16 = 1;

pub type ContentHash = [u8; 32];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleCache {
    format: u16,
    entries: BTreeMap<ContentHash, ParsedModule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheError {
    pub msg: Cow<'static, str>,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module cache: {}", self.msg)
    }
}

impl std::error::Error for CacheError {}

/// Cache key of one module's source.
#[must_use]
pub fn content_hash(module: &str, source: &str) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(module.as_bytes());
    hasher.update([0]);
    hasher.update(source.as_bytes());
    hasher.finalize().into()
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            format: CACHE_FORMAT,
            entries: BTreeMap::new(),
        }
    }

    /// Reads a cache file. A missing file, or one written by another format
    /// version, gives an empty cache.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::new()),
            Err(err) => {
                return Err(CacheError {
                    msg: format!("cannot read {}: {err}", path.display()).into(),
                });
            }
        };
        match postcard::from_bytes::<Self>(&bytes) {
            Ok(cache) if cache.format == CACHE_FORMAT => Ok(cache),
            _ => Ok(Self::new()),
        }
    }

    /// Writes the cache, creating missing parent directories.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let bytes = postcard::to_allocvec(self).map_err(|err| CacheError {
            msg: format!("cannot encode: {err}").into(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| CacheError {
                msg: format!("cannot create {}: {err}", parent.display()).into(),
            })?;
        }
        std::fs::write(path, bytes).map_err(|err| CacheError {
            msg: format!("cannot write {}: {err}", path.display()).into(),
        })
    }

    #[must_use]
    pub fn get(&self, hash: &ContentHash) -> Option<&ParsedModule> {
        self.entries.get(hash)
    }

    pub fn insert(&mut self, hash: ContentHash, module: ParsedModule) {
        self.entries.insert(hash, module);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;

    #[test]
    fn hash_depends_on_name_and_text() {
        let a = content_hash("app", "x = 1\n");
        assert_eq!(a, content_hash("app", "x = 1\n"));
        assert_ne!(a, content_hash("app", "x = 2\n"));
        assert_ne!(a, content_hash("ap", "px = 1\n"));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let source = "from ripple import Signal\ncount = Signal(0)\n";
        let hash = content_hash("app", source);

        let mut cache = ModuleCache::new();
        cache.insert(hash, parse(source, "app").unwrap());
        cache.save(&path).unwrap();

        let loaded = ModuleCache::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        let module = loaded.get(&hash).unwrap();
        assert_eq!(module.name, "app");
        assert_eq!(module.body.len(), 2);
    }

    #[test]
    fn missing_or_garbage_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        assert!(ModuleCache::load(&path).unwrap().is_empty());
        std::fs::write(&path, b"\xff\xff\xff").unwrap();
        assert!(ModuleCache::load(&path).unwrap().is_empty());
    }
}
