//! Report data produced by the resolver and the orchestrator
//!
//! All maps are insertion ordered. Iteration order is part of the output
//! contract: packages and modules are bundled in the order they were
//! discovered.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A link found in a module body: `[raw reference, normalized reference]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link(pub String, pub String);

impl Link {
    pub fn new(raw: impl Into<String>, normalized: impl Into<String>) -> Self {
        Self(raw.into(), normalized.into())
    }

    /// The reference exactly as written in the module
    pub fn raw(&self) -> &str {
        &self.0
    }

    pub fn normalized(&self) -> &str {
        &self.1
    }

    /// Whether the normalized reference is relative to the referencing module
    pub fn is_relative(&self) -> bool {
        self.1.starts_with('.')
    }
}

/// Links discovered in one module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleReport {
    /// Dependencies resolved while bundling
    pub static_links: Vec<Link>,
    /// Dependencies resolved at runtime through declared resolvers
    pub dynamic_links: Vec<Link>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainModule {
    pub path: String,
}

/// Everything discovered about one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageReport {
    pub main_module: MainModule,
    /// Resolved module path -> module report
    pub modules: IndexMap<PathBuf, ModuleReport>,
    /// Alias name -> real path of the mapped package
    pub mappings: IndexMap<String, PathBuf>,
}

impl PackageReport {
    pub fn new(main_module: impl Into<String>) -> Self {
        Self {
            main_module: MainModule {
                path: main_module.into(),
            },
            modules: IndexMap::new(),
            mappings: IndexMap::new(),
        }
    }
}

/// The dependency report of a whole transitive closure of packages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReport {
    pub main_package: PathBuf,
    /// Real package path -> package report
    pub packages: IndexMap<PathBuf, PackageReport>,
}

impl SourceReport {
    pub fn new(main_package: impl Into<PathBuf>) -> Self {
        Self {
            main_package: main_package.into(),
            packages: IndexMap::new(),
        }
    }

    /// Total number of modules across all packages
    pub fn module_count(&self) -> usize {
        self.packages
            .values()
            .map(|package| package.modules.len())
            .sum()
    }
}

/// What ended up in one generated bundle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleReport {
    pub main_bundle: PathBuf,
    /// Namespace id -> real package path
    pub packages: IndexMap<String, PathBuf>,
    /// Module id in the bundle -> real module path
    pub modules: IndexMap<String, PathBuf>,
}

/// Outcome of one orchestrator run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub main_package: PathBuf,
    pub source_report: SourceReport,
    pub mapped_report: SourceReport,
    pub bundle_report: BundleReport,
    /// Reports of the secondary bundles spun off for dynamic-load entry points
    pub dynamic_bundles: Vec<BuildReport>,
}
