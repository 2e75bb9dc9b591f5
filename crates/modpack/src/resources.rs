//! Glob expansion against a package root
//!
//! Used for the two glob-valued manifest settings: resolvers, whose matches
//! become entry points of secondary bundles, and resources, whose matches are
//! copied verbatim into the distribution directory.

use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{debug, trace};
use serde::Serialize;
use serde_json::Value;

use crate::error::BundleError;

/// Entry point of a secondary bundle found through a resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DynamicEntry {
    /// Path relative to the package root, `/` separated
    pub uri: String,
    /// Real path of the matched file
    pub path: PathBuf,
}

/// Package-relative paths matching `pattern`, in glob order
pub fn expand(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full_pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&root.to_string_lossy()),
        pattern.trim_start_matches("./")
    );
    let entries = glob::glob(&full_pattern).map_err(|err| BundleError::InvalidPattern {
        pattern: pattern.to_owned(),
        message: err.to_string(),
    })?;

    let mut matches = Vec::new();
    for entry in entries {
        let path = entry.map_err(|err| {
            let path = err.path().to_path_buf();
            BundleError::io(path, err.into_error())
        })?;
        if let Ok(relative) = path.strip_prefix(root) {
            matches.push(relative.to_path_buf());
        }
    }
    trace!("Pattern '{pattern}' matched {} paths", matches.len());
    Ok(matches)
}

/// `/` separated form of a relative path
pub fn to_uri(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Expand the resolvers declared for a module into secondary bundle entries
pub fn resolve_dynamic_entries(
    root: &Path,
    manifest_path: &Path,
    resolvers: &[Value],
) -> Result<Vec<DynamicEntry>> {
    let mut entries = Vec::new();
    for resolver in resolvers {
        let Value::String(pattern) = resolver else {
            return Err(BundleError::UnsupportedResolver {
                manifest: manifest_path.to_path_buf(),
                resolver: resolver.to_string(),
            }
            .into());
        };
        for relative in expand(root, pattern)? {
            let full = root.join(&relative);
            let path = full
                .canonicalize()
                .map_err(|source| BundleError::io(&full, source))?;
            entries.push(DynamicEntry {
                uri: to_uri(&relative),
                path,
            });
        }
    }
    Ok(entries)
}

/// Copy the files matched by `resources` from `root` to the same relative
/// paths under `distribution_path`; returns the number of files copied
pub fn copy_resources(
    root: &Path,
    manifest_path: &Path,
    resources: &[Value],
    distribution_path: &Path,
) -> Result<usize> {
    let mut copied = 0;
    for resource in resources {
        let Value::String(pattern) = resource else {
            return Err(BundleError::UnsupportedResource {
                manifest: manifest_path.to_path_buf(),
                resource: resource.to_string(),
            }
            .into());
        };
        for relative in expand(root, pattern)? {
            let source = root.join(&relative);
            if !source.is_file() {
                continue;
            }
            let target = distribution_path.join(&relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|err| BundleError::io(parent, err))?;
            }
            std::fs::copy(&source, &target).map_err(|err| BundleError::io(&target, err))?;
            debug!("Copied resource {} to {}", source.display(), target.display());
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::error::{ErrorKind, error_kind};

    fn create_test_file(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    #[test]
    fn test_copy_resources_skips_directories() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("pkg");
        let dist = temp_dir.path().join("dist/pkg");
        create_test_file(&root.join("assets/logo.png"), "logo")?;
        create_test_file(&root.join("assets/icons/small.png"), "small")?;
        create_test_file(&root.join("assets/readme.txt"), "skip")?;
        std::fs::create_dir_all(root.join("assets/empty.png"))?;

        let copied = copy_resources(
            &root,
            &root.join("package.json"),
            &[json!("assets/**/*.png")],
            &dist,
        )?;

        assert_eq!(copied, 2);
        assert_eq!(std::fs::read_to_string(dist.join("assets/logo.png"))?, "logo");
        assert_eq!(
            std::fs::read_to_string(dist.join("assets/icons/small.png"))?,
            "small"
        );
        assert!(!dist.join("assets/empty.png").exists());
        assert!(!dist.join("assets/readme.txt").exists());
        Ok(())
    }

    #[test]
    fn test_non_string_resource_is_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let err = copy_resources(
            temp_dir.path(),
            &temp_dir.path().join("package.json"),
            &[json!({ "from": "assets" })],
            &temp_dir.path().join("dist"),
        )
        .expect_err("object resources are not supported");
        assert_eq!(error_kind(&err), Some(ErrorKind::Resolution));
        Ok(())
    }

    #[test]
    fn test_resolvers_expand_to_dynamic_entries() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().canonicalize()?;
        create_test_file(&root.join("plugins/a.js"), "")?;
        create_test_file(&root.join("plugins/b.js"), "")?;

        let entries = resolve_dynamic_entries(
            &root,
            &root.join("package.json"),
            &[json!("./plugins/*.js")],
        )?;

        assert_eq!(
            entries,
            vec![
                DynamicEntry {
                    uri: "plugins/a.js".to_owned(),
                    path: root.join("plugins/a.js"),
                },
                DynamicEntry {
                    uri: "plugins/b.js".to_owned(),
                    path: root.join("plugins/b.js"),
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_non_string_resolver_is_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let err = resolve_dynamic_entries(
            temp_dir.path(),
            &temp_dir.path().join("package.json"),
            &[json!(["plugins"])],
        )
        .expect_err("array resolvers are not supported");
        assert_eq!(error_kind(&err), Some(ErrorKind::Resolution));
        Ok(())
    }

    #[test]
    fn test_to_uri() {
        assert_eq!(to_uri(Path::new("plugins/nested/a.js")), "plugins/nested/a.js");
    }
}
