//! Dependency-graph resolver
//!
//! Walks the module graph of a package depth first, starting at an entry
//! module. Relative links are followed inside the package; aliased links are
//! followed into the mapped package, which builds its own part of the same
//! [`SourceReport`]. A module already recorded for its package is never walked
//! again, which makes cycles and diamond dependencies terminate.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use indexmap::IndexMap;
use log::{debug, error, trace};
use serde_json::{Map, Value};

use crate::{
    adapter::{AdapterRegistry, ModuleAdapter, ParseContext, Resolved},
    error::{BundleError, DependencyContext},
    manifest::{CONFIG_NAMESPACE, Manifest, ManifestOptions},
    report::{Link, PackageReport, SourceReport},
};

/// A package directory together with its normalized manifest
#[derive(Debug, Clone)]
pub struct Package {
    path: PathBuf,
    manifest: Manifest,
}

impl Package {
    pub fn load(path: &Path, options: &ManifestOptions) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            manifest: Manifest::load(path, options)?,
        })
    }

    /// Real path of the package directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Record this package and every module reachable from `entry_module`
    /// (default: the manifest's `main`) into `report`
    pub fn build_report(
        &self,
        packages: &mut PackageCache,
        report: &mut SourceReport,
        entry_module: Option<&str>,
    ) -> Result<()> {
        let adapter = packages.registry().get(&self.manifest.config().adapter)?;

        report
            .packages
            .entry(self.path.clone())
            .or_insert_with(|| PackageReport::new(self.manifest.main()));

        let entry = self.entry_path(entry_module);
        debug!(
            "Building report for package {} from {}",
            self.path.display(),
            entry.display()
        );
        self.follow_module(&entry, adapter.as_ref(), packages, report)
    }

    /// Entry references without a path separator marker or extension marker
    /// live in the library directory
    fn entry_path(&self, entry_module: Option<&str>) -> PathBuf {
        let entry = entry_module
            .filter(|entry| !entry.is_empty())
            .unwrap_or_else(|| self.manifest.main());

        let lib_dir = self.manifest.lib_dir();
        let entry = if entry.starts_with('.') || entry.contains('.') || lib_dir.is_empty() {
            entry.to_owned()
        } else {
            format!("{}/{entry}", lib_dir.trim_end_matches('/'))
        };
        normalize_path(&self.path.join(entry.trim_start_matches('/')))
    }

    fn follow_module(
        &self,
        uri: &Path,
        adapter: &dyn ModuleAdapter,
        packages: &mut PackageCache,
        report: &mut SourceReport,
    ) -> Result<()> {
        let module_path = match adapter.resolve_uri(uri)? {
            Resolved::Module(path) => path,
            Resolved::Ignore => {
                debug!("Ignoring module {}", uri.display());
                return Ok(());
            }
        };

        let recorded = package_report(report, &self.path)?;
        if recorded.modules.contains_key(&module_path) {
            trace!("Module {} already recorded", module_path.display());
            return Ok(());
        }

        let module_report = adapter.parse_module(
            &module_path,
            &ParseContext {
                manifest: &self.manifest,
                package_report: recorded,
                package_path: &self.path,
            },
        )?;
        let static_links = module_report.static_links.clone();
        package_report_mut(report, &self.path)?
            .modules
            .insert(module_path.clone(), module_report);

        for link in &static_links {
            self.follow_link(&module_path, link, adapter, packages, report)
                .map_err(|err| annotate(err, &module_path))?;
        }
        Ok(())
    }

    fn follow_link(
        &self,
        module_path: &Path,
        link: &Link,
        adapter: &dyn ModuleAdapter,
        packages: &mut PackageCache,
        report: &mut SourceReport,
    ) -> Result<()> {
        if link.is_relative() {
            let directory = module_path.parent().unwrap_or(&self.path);
            let target = normalize_path(&directory.join(link.normalized()));
            return self.follow_module(&target, adapter, packages, report);
        }

        let (alias, sub_path) = split_alias(link.normalized());
        let target = self.mapped_package_path(alias, link, report)?;

        let options = ManifestOptions {
            main_module: None,
            default_descriptor: Some(inherited_config(&self.manifest)),
            override_descriptor: self.manifest.config().override_for(alias).cloned(),
        };
        let package = packages.get_or_load(&target, &options)?;
        trace!(
            "Following alias '{alias}' into package {}",
            package.path().display()
        );
        package.build_report(packages, report, sub_path)
    }

    /// Real path of the package mapped under `alias`, recorded in this
    /// package's report the first time it is needed
    fn mapped_package_path(
        &self,
        alias: &str,
        link: &Link,
        report: &mut SourceReport,
    ) -> Result<PathBuf> {
        if let Some(path) = package_report(report, &self.path)?.mappings.get(alias) {
            return Ok(path.clone());
        }

        let Some(relative) = self.manifest.mapping(alias)? else {
            return Err(BundleError::MissingMapping {
                manifest: self.manifest.path().to_path_buf(),
                alias: alias.to_owned(),
                reference: link.raw().to_owned(),
            }
            .into());
        };
        let target = self.path.join(relative);
        let real_path = target
            .canonicalize()
            .ok()
            .filter(|path| path.is_dir())
            .ok_or_else(|| BundleError::UnresolvableMapping {
                manifest: self.manifest.path().to_path_buf(),
                alias: alias.to_owned(),
                target: target.clone(),
            })?;

        package_report_mut(report, &self.path)?
            .mappings
            .insert(alias.to_owned(), real_path.clone());
        Ok(real_path)
    }
}

/// Packages loaded during one build, at most once per real path
#[derive(Debug, Clone)]
pub struct PackageCache {
    registry: Arc<AdapterRegistry>,
    packages: IndexMap<PathBuf, Arc<Package>>,
}

impl PackageCache {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self {
            registry,
            packages: IndexMap::new(),
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// The package at `path`; `options` only apply when it is loaded for the
    /// first time
    pub fn get_or_load(&mut self, path: &Path, options: &ManifestOptions) -> Result<Arc<Package>> {
        if let Some(package) = self.packages.get(path) {
            return Ok(Arc::clone(package));
        }
        let package = Arc::new(Package::load(path, options)?);
        self.packages.insert(path.to_path_buf(), Arc::clone(&package));
        Ok(package)
    }
}

/// Split an aliased reference into its alias and optional sub path
pub fn split_alias(reference: &str) -> (&str, Option<&str>) {
    match reference.split_once('/') {
        Some((alias, sub_path)) if !sub_path.is_empty() => (alias, Some(sub_path)),
        Some((alias, _)) => (alias, None),
        None => (reference, None),
    }
}

/// Lexically remove `.` components and fold `..` components
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Default descriptor of a mapped package: the mapping package's bundler
/// config, so dependencies without their own config bundle the same way
fn inherited_config(manifest: &Manifest) -> Value {
    let mut namespace = Map::new();
    namespace.insert(CONFIG_NAMESPACE.to_owned(), manifest.config_namespace());
    let mut root = Map::new();
    root.insert("config".to_owned(), Value::Object(namespace));
    Value::Object(root)
}

/// Attach the referencing module to a failure, once
fn annotate(err: anyhow::Error, module_path: &Path) -> anyhow::Error {
    if err.downcast_ref::<DependencyContext>().is_some() {
        return err;
    }
    error!(
        "Error happened when trying to locate dependency for module: {}",
        module_path.display()
    );
    err.context(DependencyContext {
        module: module_path.to_path_buf(),
    })
}

fn package_report<'a>(report: &'a SourceReport, path: &Path) -> Result<&'a PackageReport> {
    report
        .packages
        .get(path)
        .ok_or_else(|| anyhow::anyhow!("package {} missing from report", path.display()))
}

fn package_report_mut<'a>(
    report: &'a mut SourceReport,
    path: &Path,
) -> Result<&'a mut PackageReport> {
    report
        .packages
        .get_mut(path)
        .ok_or_else(|| anyhow::anyhow!("package {} missing from report", path.display()))
}
