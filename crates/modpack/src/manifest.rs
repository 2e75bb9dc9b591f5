//! Package manifest (`package.json`) loading and normalization
//!
//! A manifest is kept as a JSON document so that fields this crate does not
//! know about survive into the descriptor records of a bundle. The bundler's
//! own settings live in a reserved namespace below `config` and are exposed as
//! a typed [`BundlerConfig`].

use std::path::{Path, PathBuf};

use anyhow::Result;
use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BundleError;

/// File name of the manifest inside a package directory
pub const MANIFEST_FILE: &str = "package.json";

/// Key below `config` holding the bundler configuration
pub const CONFIG_NAMESPACE: &str = "github.com/sourcemint/bundler-js/0/-meta/config/0";

/// Adapter used when a manifest does not name one
pub const DEFAULT_ADAPTER: &str = "github.com/sourcemint/platform-nodejs/0";

/// Main module used when a manifest does not declare `main`
pub const DEFAULT_MAIN: &str = "index";

/// Options applied while loading one manifest
#[derive(Debug, Clone, Default)]
pub struct ManifestOptions {
    /// Replaces the manifest's `main` field
    pub main_module: Option<String>,
    /// Document the manifest is layered on top of
    pub default_descriptor: Option<Value>,
    /// Document layered on top of the loaded manifest
    pub override_descriptor: Option<Value>,
}

/// Manifest overrides for one mapped package
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PackageOverride {
    pub descriptor: Option<Value>,
}

/// Typed view of the reserved bundler config namespace
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BundlerConfig {
    /// Identifier of the adapter that parses and encodes modules
    pub adapter: String,
    /// Canonical module id -> resolver declarations for dynamic loading
    pub resolvers: Option<IndexMap<String, Value>>,
    /// Resource declarations copied verbatim into the distribution directory
    pub resources: Option<Vec<Value>>,
    /// Alias name -> manifest overrides for the mapped package
    pub packages: IndexMap<String, PackageOverride>,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            adapter: DEFAULT_ADAPTER.to_owned(),
            resolvers: None,
            resources: None,
            packages: IndexMap::new(),
        }
    }
}

impl BundlerConfig {
    /// Resolver declarations for a canonical module id, if declared as a list
    pub fn resolvers_for(&self, canonical_id: &str) -> Option<&Vec<Value>> {
        self.resolvers
            .as_ref()
            .and_then(|resolvers| resolvers.get(canonical_id))
            .and_then(Value::as_array)
    }

    /// Override descriptor declared for a mapped package alias
    pub fn override_for(&self, alias: &str) -> Option<&Value> {
        self.packages
            .get(alias)
            .and_then(|package| package.descriptor.as_ref())
            .filter(|descriptor| descriptor.is_object())
    }
}

/// A loaded and normalized package manifest
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    descriptor: Value,
    config: BundlerConfig,
}

impl Manifest {
    /// Load the manifest of the package at `package_path`
    ///
    /// Layering order: `default_descriptor`, then the manifest file (if any),
    /// then `override_descriptor`. Normalization happens afterwards and is the
    /// only time the descriptor is mutated.
    pub fn load(package_path: &Path, options: &ManifestOptions) -> Result<Self> {
        let path = package_path.join(MANIFEST_FILE);

        let mut descriptor = options
            .default_descriptor
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()));

        if path.is_file() {
            let text =
                std::fs::read_to_string(&path).map_err(|source| BundleError::io(&path, source))?;
            let loaded: Value =
                serde_json::from_str(&text).map_err(|source| BundleError::ManifestParse {
                    path: path.clone(),
                    source,
                })?;
            if !loaded.is_object() {
                return Err(BundleError::InvalidManifest {
                    path,
                    message: "top-level value must be an object".to_owned(),
                }
                .into());
            }
            deep_update(&mut descriptor, &loaded);
        } else {
            debug!("No manifest at {}, using defaults", path.display());
        }

        if let Some(overrides) = &options.override_descriptor {
            deep_update(&mut descriptor, overrides);
        }

        Self::normalize(path, descriptor, options.main_module.as_deref())
    }

    /// Build a manifest from an in-memory document
    pub fn from_value(package_path: &Path, descriptor: Value) -> Result<Self> {
        Self::normalize(package_path.join(MANIFEST_FILE), descriptor, None)
    }

    fn normalize(path: PathBuf, mut descriptor: Value, main_module: Option<&str>) -> Result<Self> {
        let invalid = |message: &str| BundleError::InvalidManifest {
            path: path.clone(),
            message: message.to_owned(),
        };

        let root = descriptor
            .as_object_mut()
            .ok_or_else(|| invalid("top-level value must be an object"))?;

        if let Some(main) = main_module {
            root.insert("main".to_owned(), Value::String(main.to_owned()));
        }

        let directories = root
            .entry("directories")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| invalid("'directories' must be an object"))?;
        directories
            .entry("lib")
            .or_insert_with(|| Value::String(String::new()));

        let config = root
            .entry("config")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| invalid("'config' must be an object"))?;
        let namespace = config
            .entry(CONFIG_NAMESPACE)
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| invalid("bundler config namespace must be an object"))?;
        namespace
            .entry("adapter")
            .or_insert_with(|| Value::String(DEFAULT_ADAPTER.to_owned()));

        let config: BundlerConfig = serde_json::from_value(Value::Object(namespace.clone()))
            .map_err(|err| invalid(&format!("bundler config: {err}")))?;

        Ok(Self {
            path,
            descriptor,
            config,
        })
    }

    /// Path of the manifest file (it need not exist)
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &BundlerConfig {
        &self.config
    }

    pub fn main(&self) -> &str {
        self.descriptor
            .get("main")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MAIN)
    }

    /// The library directory (`directories.lib`), empty when unset
    pub fn lib_dir(&self) -> &str {
        self.descriptor
            .pointer("/directories/lib")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Relative path declared for a mapping alias
    pub fn mapping(&self, alias: &str) -> Result<Option<&str>> {
        match self.descriptor.get("mappings").and_then(|m| m.get(alias)) {
            None => Ok(None),
            Some(Value::String(target)) => Ok(Some(target)),
            Some(_) => Err(BundleError::InvalidManifest {
                path: self.path.clone(),
                message: format!("mapping '{alias}' must be a string"),
            }
            .into()),
        }
    }

    /// The raw bundler config namespace object, used as the default config of
    /// packages mapped from this one
    pub fn config_namespace(&self) -> Value {
        self.descriptor
            .pointer("/config")
            .and_then(|config| config.get(CONFIG_NAMESPACE))
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// A copy of the descriptor stripped for use at load time
    ///
    /// `main` loses its leading `.`, the bundler namespace is removed from
    /// `config`, and `config` is dropped once empty. Mappings are left as
    /// declared; the bundler rewrites them to namespace ids.
    pub fn client_descriptor(&self) -> Value {
        let mut descriptor = self.descriptor.clone();
        if let Some(root) = descriptor.as_object_mut() {
            if let Some(Value::String(main)) = root.get_mut("main") {
                if let Some(stripped) = main.strip_prefix("./") {
                    *main = format!("/{stripped}");
                }
            }
            let config_empty = match root.get_mut("config") {
                Some(Value::Object(config)) => {
                    config.shift_remove(CONFIG_NAMESPACE);
                    config.is_empty()
                }
                _ => false,
            };
            if config_empty {
                root.shift_remove("config");
            }
        }
        descriptor
    }
}

/// Recursively merge `source` into `target`; objects merge key by key, any
/// other value replaces what was there
pub fn deep_update(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                let merge = value.is_object() && target.get(key).is_some_and(Value::is_object);
                if !merge {
                    target.insert(key.clone(), value.clone());
                } else if let Some(existing) = target.get_mut(key) {
                    deep_update(existing, value);
                }
            }
        }
        (target, source) => *target = source.clone(),
    }
}
