//! Namespace ids isolating the module ids of non-main packages in a bundle

use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use indexmap::IndexMap;
use sha2::{Digest, Sha256};

/// Compute the namespace id for a package path under a seed
pub fn package_id(seed: &str, path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(b":");
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A seed that differs between runs
pub fn default_seed() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("{nanos}-{}", std::process::id())
}

/// Lazily assigned, cached namespace ids for one bundle generation
#[derive(Debug, Clone)]
pub struct PackageIds {
    seed: String,
    ids: IndexMap<PathBuf, String>,
}

impl PackageIds {
    pub fn new(seed: impl Into<String>) -> Self {
        Self {
            seed: seed.into(),
            ids: IndexMap::new(),
        }
    }

    /// Namespace id for `path`, assigning it on first use
    pub fn id_for(&mut self, path: &Path) -> String {
        if let Some(id) = self.ids.get(path) {
            return id.clone();
        }
        let id = package_id(&self.seed, path);
        self.ids.insert(path.to_path_buf(), id.clone());
        id
    }
}
