//! Platform adapters
//!
//! An adapter knows how a platform finds module files, which links a module
//! body declares, and how a module body is encoded into a bundle record. The
//! resolver and the orchestrator only talk to adapters through
//! [`ModuleAdapter`]; adapters are looked up by the identifier a manifest
//! declares in its bundler config.

mod node;
mod requirejs;

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use indexmap::IndexMap;

pub use node::{NODE_ADAPTER, NodeAdapter};
pub use requirejs::{REQUIREJS_ADAPTER, RequireJsAdapter};

use crate::{
    error::BundleError,
    manifest::Manifest,
    report::{Link, ModuleReport, PackageReport, SourceReport},
};

/// Result of resolving a module reference to a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// A concrete module file
    Module(PathBuf),
    /// A reference the adapter deliberately skips
    Ignore,
}

/// What an adapter may look at while parsing one module
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    pub manifest: &'a Manifest,
    pub package_report: &'a PackageReport,
    pub package_path: &'a Path,
}

pub trait ModuleAdapter: fmt::Debug + Send + Sync {
    /// Resolve a module reference (already joined onto its package or
    /// referencing directory) to a concrete module path
    fn resolve_uri(&self, uri: &Path) -> Result<Resolved>;

    /// Find the static and dynamic links of a module
    fn parse_module(&self, path: &Path, context: &ParseContext<'_>) -> Result<ModuleReport>;

    /// Encode a module body for inclusion in a bundle
    fn encode_module(&self, path: &Path, canonical_id: &str, static_links: &[Link])
    -> Result<String>;

    /// Platform-specific rewrite of a source report before bundling
    fn remap_sources(&self, report: SourceReport) -> Result<SourceReport> {
        Ok(report)
    }

    /// Code placed in the header record of every bundle
    fn bundle_header(&self) -> Option<String> {
        None
    }
}

/// The set of adapters a build may use, keyed by identifier
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    adapters: IndexMap<String, Arc<dyn ModuleAdapter>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(NODE_ADAPTER, NodeAdapter);
        registry.register(REQUIREJS_ADAPTER, RequireJsAdapter);
        registry
    }
}

impl AdapterRegistry {
    /// A registry without any adapters
    pub fn empty() -> Self {
        Self {
            adapters: IndexMap::new(),
        }
    }

    /// Register (or replace) the adapter for an identifier
    pub fn register(&mut self, id: impl Into<String>, adapter: impl ModuleAdapter + 'static) {
        self.adapters.insert(id.into(), Arc::new(adapter));
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn ModuleAdapter>> {
        self.adapters
            .get(id)
            .cloned()
            .ok_or_else(|| BundleError::UnknownAdapter(id.to_owned()).into())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

/// Append `suffix` to the file name of `path` without replacing an extension
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Canonicalize the first candidate that is an existing file
pub(crate) fn first_existing_file(candidates: &[PathBuf]) -> Result<Option<PathBuf>> {
    for candidate in candidates {
        if candidate.is_file() {
            let canonical = candidate
                .canonicalize()
                .map_err(|source| BundleError::io(candidate, source))?;
            return Ok(Some(canonical));
        }
    }
    Ok(None)
}

pub(crate) fn read_source(path: &Path) -> Result<String> {
    Ok(std::fs::read_to_string(path).map_err(|source| BundleError::io(path, source))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, error_kind};

    #[test]
    fn test_default_registry_knows_builtin_adapters() -> Result<()> {
        let registry = AdapterRegistry::default();
        assert_eq!(
            registry.ids().collect::<Vec<_>>(),
            vec![NODE_ADAPTER, REQUIREJS_ADAPTER]
        );
        registry.get(NODE_ADAPTER)?;
        registry.get(REQUIREJS_ADAPTER)?;
        Ok(())
    }

    #[test]
    fn test_unknown_adapter_is_rejected() {
        let err = AdapterRegistry::default()
            .get("github.com/example/unknown/0")
            .expect_err("unregistered adapter must fail");
        assert_eq!(error_kind(&err), Some(ErrorKind::Resolution));
    }

    #[test]
    fn test_with_suffix_keeps_existing_extension() {
        assert_eq!(
            with_suffix(Path::new("/pkg/jquery.min"), ".js"),
            PathBuf::from("/pkg/jquery.min.js")
        );
    }
}
