//! Bundling orchestrator
//!
//! A [`Bundler`] resolves the module graph of one package, lets the root
//! package's adapter remap the result, and streams every module and package
//! descriptor into a bundle file. Entry points discovered through resolvers
//! for dynamically loaded modules get their own secondary bundles, generated
//! after the primary bundle is complete.

use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use indexmap::IndexSet;
use log::{debug, info, trace, warn};
use serde_json::{Map, Value, json};

use crate::{
    adapter::{AdapterRegistry, ModuleAdapter, with_suffix},
    bundle::{BundleWriter, LoaderSection},
    error::BundleError,
    manifest::{MANIFEST_FILE, ManifestOptions},
    namespace::{PackageIds, default_seed},
    report::{BuildReport, BundleReport, PackageReport, SourceReport},
    resolver::{Package, PackageCache},
    resources::{DynamicEntry, copy_resources, resolve_dynamic_entries, to_uri},
};

/// How to wrap a primary bundle in the loader stub
#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    /// Loader runtime source inlined into the stub
    pub runtime_path: PathBuf,
    /// URL prefix the loader uses to request the bundle
    pub bundle_url_prefix: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BundlerOptions {
    /// Seed for package namespace ids; derived from time and pid when unset
    pub package_id_hash_seed: Option<String>,
    /// Entry module of the root package, replacing its manifest's `main`
    pub main_module: Option<String>,
    /// Module paths already placed in another bundle
    pub existing_modules: IndexSet<PathBuf>,
    /// Wrap the primary bundle in the loader stub
    pub loader: Option<LoaderOptions>,
    pub adapters: Arc<AdapterRegistry>,
}

/// Bundle `package_path` into `distribution_dir/<package name>.js`
///
/// The distribution directory must already exist.
pub fn bundle(
    package_path: &Path,
    distribution_dir: &Path,
    options: BundlerOptions,
) -> Result<BuildReport> {
    if !distribution_dir.exists() {
        return Err(BundleError::MissingDistribution(distribution_dir.to_path_buf()).into());
    }
    let real_path = package_path
        .canonicalize()
        .map_err(|source| BundleError::io(package_path, source))?;
    let name = real_path
        .file_name()
        .ok_or_else(|| BundleError::NotADirectory(real_path.clone()))?;

    Bundler::new(package_path, distribution_dir.join(name), options)?.generate_bundles()
}

/// Descriptor record written once every package has its namespace id
#[derive(Debug, Clone)]
struct PendingDescriptor {
    package_path: PathBuf,
    namespace: String,
    descriptor: Value,
}

/// State of one bundle generation
#[derive(Debug)]
struct BundleState {
    main_package: PathBuf,
    ids: PackageIds,
    report: BundleReport,
    descriptors: Vec<PendingDescriptor>,
    dynamic_entries: Vec<DynamicEntry>,
    loader: Option<LoaderSection>,
}

impl BundleState {
    fn new(main_package: &Path, seed: &str, bundle_path: &Path) -> Self {
        Self {
            main_package: main_package.to_path_buf(),
            ids: PackageIds::new(seed),
            report: BundleReport {
                main_bundle: bundle_path.to_path_buf(),
                ..BundleReport::default()
            },
            descriptors: Vec::new(),
            dynamic_entries: Vec::new(),
            loader: None,
        }
    }

    /// Prefix of the module ids of a package; empty for the main package
    fn namespace_for(&mut self, package_path: &Path) -> String {
        if package_path == self.main_package {
            return String::new();
        }
        let id = self.ids.id_for(package_path);
        self.report
            .packages
            .entry(id.clone())
            .or_insert_with(|| package_path.to_path_buf());
        id
    }

    fn enqueue(&mut self, entry: DynamicEntry) {
        if !self
            .dynamic_entries
            .iter()
            .any(|queued| queued.path == entry.path)
        {
            trace!("Queued dynamic bundle for {}", entry.uri);
            self.dynamic_entries.push(entry);
        }
    }
}

#[derive(Debug)]
pub struct Bundler {
    package_path: PathBuf,
    distribution_path: PathBuf,
    seed: String,
    options: BundlerOptions,
    packages: PackageCache,
}

impl Bundler {
    /// Prepare a run bundling `package_path` into `<distribution_path>.js`
    pub fn new(
        package_path: &Path,
        distribution_path: impl Into<PathBuf>,
        mut options: BundlerOptions,
    ) -> Result<Self> {
        let real_path = package_path
            .canonicalize()
            .map_err(|source| BundleError::io(package_path, source))?;
        if !real_path.is_dir() {
            return Err(BundleError::NotADirectory(package_path.to_path_buf()).into());
        }
        let seed = options
            .package_id_hash_seed
            .get_or_insert_with(default_seed)
            .clone();
        let packages = PackageCache::new(Arc::clone(&options.adapters));

        Ok(Self {
            package_path: real_path,
            distribution_path: distribution_path.into(),
            seed,
            options,
            packages,
        })
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    fn root_package(&mut self) -> Result<Arc<Package>> {
        let options = ManifestOptions {
            main_module: self.options.main_module.clone(),
            ..ManifestOptions::default()
        };
        self.packages.get_or_load(&self.package_path, &options)
    }

    /// Resolve the module graph of the root package
    pub fn generate_report(&mut self) -> Result<SourceReport> {
        let package = self.root_package()?;
        let mut report = SourceReport::new(&self.package_path);
        package.build_report(&mut self.packages, &mut report, None)?;
        Ok(report)
    }

    /// Write the primary bundle, then one secondary bundle per dynamic entry
    pub fn generate_bundles(&mut self) -> Result<BuildReport> {
        let package = self.root_package()?;
        let source_report = self.generate_report()?;
        let adapter_id = package.manifest().config().adapter.clone();
        let adapter = self.packages.registry().get(&adapter_id)?;
        let mapped_report = adapter.remap_sources(source_report.clone())?;

        let bundle_path = with_suffix(&self.distribution_path, ".js");
        info!(
            "Bundling {} modules from {} into {}",
            mapped_report.module_count(),
            self.package_path.display(),
            bundle_path.display()
        );

        let mut state = BundleState::new(&self.package_path, &self.seed, &bundle_path);
        state.loader = self.loader_section()?;

        // Only a file created by this run may be removed on failure
        let file =
            File::create(&bundle_path).map_err(|source| BundleError::io(&bundle_path, source))?;
        if let Err(err) =
            self.write_bundle(file, &adapter_id, adapter.as_ref(), &mapped_report, &mut state)
        {
            if let Err(remove_err) = std::fs::remove_file(&bundle_path) {
                warn!(
                    "Could not remove partial bundle {}: {remove_err}",
                    bundle_path.display()
                );
            }
            return Err(err);
        }

        let mut build = BuildReport {
            main_package: self.package_path.clone(),
            source_report,
            mapped_report,
            bundle_report: state.report,
            dynamic_bundles: Vec::new(),
        };

        let mut existing = self.options.existing_modules.clone();
        existing.extend(build.bundle_report.modules.values().cloned());
        for entry in &state.dynamic_entries {
            let secondary = self.generate_secondary(entry, existing.clone())?;
            build.dynamic_bundles.push(secondary);
        }
        Ok(build)
    }

    fn generate_secondary(
        &self,
        entry: &DynamicEntry,
        existing_modules: IndexSet<PathBuf>,
    ) -> Result<BuildReport> {
        let relative = entry.uri.strip_suffix(".js").unwrap_or(&entry.uri);
        let distribution_path = self.distribution_path.join(relative);
        if let Some(parent) = distribution_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| BundleError::io(parent, source))?;
        }
        info!(
            "Generating dynamic bundle for {} ({})",
            entry.uri,
            entry.path.display()
        );

        let options = BundlerOptions {
            package_id_hash_seed: Some(self.seed.clone()),
            main_module: Some(entry.uri.clone()),
            existing_modules,
            loader: None,
            adapters: Arc::clone(&self.options.adapters),
        };
        Self::new(&self.package_path, distribution_path, options)?.generate_bundles()
    }

    fn write_bundle(
        &mut self,
        file: File,
        adapter_id: &str,
        adapter: &dyn ModuleAdapter,
        mapped_report: &SourceReport,
        state: &mut BundleState,
    ) -> Result<()> {
        let bundle_path = state.report.main_bundle.clone();
        let io_error = |source| BundleError::io(&bundle_path, source);
        let loader = state.loader.take();

        let mut writer = BundleWriter::new(BufWriter::new(file));

        if let Some(loader) = &loader {
            writer.begin_loader(&loader.meta).map_err(io_error)?;
        }
        writer.begin_payload().map_err(io_error)?;
        writer
            .header(
                &adapter.bundle_header().unwrap_or_default(),
                &json!({ "adapter": adapter_id }),
            )
            .map_err(io_error)?;

        for (package_path, package_report) in &mapped_report.packages {
            self.bundle_package(&mut writer, adapter, package_path, package_report, state)?;
        }

        for pending in std::mem::take(&mut state.descriptors) {
            let id = format!("{}/{MANIFEST_FILE}", pending.namespace);
            let descriptor = remap_mappings(pending, state);
            writer
                .descriptor(&id, &descriptor.to_string(), &json!({}))
                .map_err(io_error)?;
        }
        writer.end_payload().map_err(io_error)?;

        if let Some(loader) = &loader {
            let name = bundle_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            writer.end_loader(loader, &name).map_err(io_error)?;
        }

        let report = serde_json::to_value(&state.report)?;
        writer.report(&report).map_err(io_error)?;
        writer.flush().map_err(io_error)?;
        Ok(())
    }

    fn loader_section(&self) -> Result<Option<LoaderSection>> {
        let Some(options) = &self.options.loader else {
            return Ok(None);
        };
        let runtime = std::fs::read_to_string(&options.runtime_path)
            .map_err(|source| BundleError::io(&options.runtime_path, source))?;
        let mut meta = Map::new();
        if let Some(prefix) = &options.bundle_url_prefix {
            meta.insert("bundleUrlPrefix".to_owned(), Value::from(prefix.as_str()));
        }
        Ok(Some(LoaderSection {
            enabled: true,
            meta: Value::Object(meta),
            runtime,
        }))
    }

    fn bundle_package<W: std::io::Write>(
        &mut self,
        writer: &mut BundleWriter<W>,
        adapter: &dyn ModuleAdapter,
        package_path: &Path,
        package_report: &PackageReport,
        state: &mut BundleState,
    ) -> Result<()> {
        let namespace = state.namespace_for(package_path);
        let package = self
            .packages
            .get_or_load(package_path, &ManifestOptions::default())?;
        let manifest = package.manifest();
        let config = manifest.config();
        debug!(
            "Bundling package {} under namespace '{namespace}'",
            package_path.display()
        );

        for (module_path, module_report) in &package_report.modules {
            if self.options.existing_modules.contains(module_path) {
                trace!("Skipping {} already bundled elsewhere", module_path.display());
                continue;
            }
            let canonical_id = canonical_id(package_path, module_path);
            let id = format!("{namespace}{canonical_id}");
            let code = adapter.encode_module(module_path, &canonical_id, &module_report.static_links)?;
            writer
                .module(&id, code.trim_start(), &json!({}))
                .map_err(|source| BundleError::io(&state.report.main_bundle, source))?;
            debug!("Bundled module {id}");
            state.report.modules.insert(id, module_path.clone());

            if module_report.dynamic_links.is_empty() {
                continue;
            }
            let resolvers = config
                .resolvers_for(&canonical_id)
                .filter(|resolvers| !resolvers.is_empty())
                .ok_or_else(|| BundleError::MissingResolvers {
                    manifest: manifest.path().to_path_buf(),
                    module: module_path.clone(),
                    canonical_id: canonical_id.clone(),
                })?;
            for entry in resolve_dynamic_entries(package_path, manifest.path(), resolvers)? {
                state.enqueue(entry);
            }
        }

        state.descriptors.push(PendingDescriptor {
            package_path: package_path.to_path_buf(),
            namespace,
            descriptor: manifest.client_descriptor(),
        });

        if let Some(resources) = &config.resources {
            let copied = copy_resources(
                package_path,
                manifest.path(),
                resources,
                &self.distribution_path,
            )?;
            debug!("Copied {copied} resources from {}", package_path.display());
        }
        Ok(())
    }
}

/// Module id relative to its package: `/` followed by the `/` separated
/// relative path
fn canonical_id(package_path: &Path, module_path: &Path) -> String {
    let relative = module_path.strip_prefix(package_path).unwrap_or(module_path);
    format!("/{}", to_uri(relative))
}

/// Rewrite the mappings of a descriptor from relative paths to the namespace
/// ids of the mapped packages
fn remap_mappings(pending: PendingDescriptor, state: &mut BundleState) -> Value {
    let mut descriptor = pending.descriptor;
    if let Some(Value::Object(mappings)) = descriptor.get_mut("mappings") {
        for (alias, target) in mappings.iter_mut() {
            let Value::String(relative) = target else {
                continue;
            };
            let resolved = pending.package_path.join(relative.as_str()).canonicalize();
            match resolved {
                Ok(real_path) => *target = Value::String(state.namespace_for(&real_path)),
                Err(err) => warn!(
                    "Mapping '{alias}' of {} cannot be resolved ({err}); leaving it as declared",
                    pending.package_path.display()
                ),
            }
        }
    }
    descriptor
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        error::{ErrorKind, error_kind},
        namespace::package_id,
    };

    fn create_test_file(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    fn seeded() -> BundlerOptions {
        BundlerOptions {
            package_id_hash_seed: Some("test-seed".to_owned()),
            ..BundlerOptions::default()
        }
    }

    #[test]
    fn test_new_rejects_files() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("index.js");
        create_test_file(&file, "")?;

        let err = Bundler::new(&file, temp_dir.path().join("dist"), seeded())
            .expect_err("a file is not a package");
        assert_eq!(error_kind(&err), Some(ErrorKind::Resolution));
        Ok(())
    }

    #[test]
    fn test_default_seed_is_assigned() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let bundler = Bundler::new(
            temp_dir.path(),
            temp_dir.path().join("dist"),
            BundlerOptions::default(),
        )?;
        assert!(!bundler.seed().is_empty());
        Ok(())
    }

    #[test]
    fn test_canonical_id() {
        assert_eq!(
            canonical_id(Path::new("/pkg"), Path::new("/pkg/lib/a.js")),
            "/lib/a.js"
        );
    }

    #[test]
    fn test_descriptor_mappings_become_namespace_ids() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().canonicalize()?;
        std::fs::create_dir_all(root.join("vendor/util"))?;

        let mut state = BundleState::new(&root, "test-seed", &root.join("dist.js"));
        let descriptor = remap_mappings(
            PendingDescriptor {
                package_path: root.clone(),
                namespace: String::new(),
                descriptor: json!({ "mappings": { "util": "./vendor/util", "gone": "./missing" } }),
            },
            &mut state,
        );

        let util_id = package_id("test-seed", &root.join("vendor/util"));
        assert_eq!(
            descriptor,
            json!({ "mappings": { "util": util_id, "gone": "./missing" } })
        );
        assert_eq!(state.report.packages[&util_id], root.join("vendor/util"));
        Ok(())
    }

    #[test]
    fn test_loader_bundle_wraps_payload() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("app");
        create_test_file(&root.join("index.js"), "exports.main = true;\n")?;
        create_test_file(&temp_dir.path().join("loader.js"), "exports.require = {};\n")?;
        let dist = temp_dir.path().join("dist");
        std::fs::create_dir(&dist)?;

        let options = BundlerOptions {
            loader: Some(LoaderOptions {
                runtime_path: temp_dir.path().join("loader.js"),
                bundle_url_prefix: None,
            }),
            ..seeded()
        };
        bundle(&root, &dist, options)?;

        let text = std::fs::read_to_string(dist.join("app.js"))?;
        assert!(text.starts_with("// @sourcemint-bundle-loader: {}\n"));
        assert!(text.contains("exports.require = {};\n"));
        assert!(text.contains("sourcemint.sandbox(\"app.js\", function(sandbox) {"));
        Ok(())
    }

    #[test]
    fn test_unreadable_loader_keeps_previous_bundle() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("app");
        create_test_file(&root.join("index.js"), "exports.main = true;\n")?;
        let dist = temp_dir.path().join("dist");
        std::fs::create_dir(&dist)?;

        bundle(&root, &dist, seeded())?;
        let previous = std::fs::read_to_string(dist.join("app.js"))?;

        let options = BundlerOptions {
            loader: Some(LoaderOptions {
                runtime_path: temp_dir.path().join("missing-loader.js"),
                bundle_url_prefix: None,
            }),
            ..seeded()
        };
        let err = bundle(&root, &dist, options).expect_err("loader runtime does not exist");

        assert_eq!(error_kind(&err), Some(ErrorKind::Io));
        assert_eq!(std::fs::read_to_string(dist.join("app.js"))?, previous);
        Ok(())
    }
}
