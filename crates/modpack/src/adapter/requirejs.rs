//! RequireJS-style (AMD) adapter

use std::{path::Path, sync::LazyLock};

use anyhow::Result;
use indexmap::IndexSet;
use regex::Regex;

use super::{
    ModuleAdapter, ParseContext, Resolved, first_existing_file,
    node::{STATIC_REQUIRE, collect_links, normalize_reference},
    read_source, with_suffix,
};
use crate::{
    error::BundleError,
    report::{Link, ModuleReport},
};

pub const REQUIREJS_ADAPTER: &str = "github.com/sourcemint/sdk-requirejs/0";

static DEFINE_DEPENDENCIES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bdefine\s*\(\s*(?:["'][^"']*["']\s*,\s*)?\[([^\]]*)\]"#).expect("valid regex")
});

static ASYNC_REQUIRE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\brequire\s*\(\s*\[([^\]]*)\]").expect("valid regex"));

static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["']([^"']+)["']"#).expect("valid regex"));

/// Dependency names with a special meaning inside `define()`
const PSEUDO_MODULES: &[&str] = &["require", "exports", "module"];

/// Installs `define()` on top of the bundle's `require` for AMD modules
const DEFINE_SHIM: &str = "var define = function(id, deps, factory) { return require.define(id, deps, factory); };";

/// Collect the quoted entries of every dependency array matched by `pattern`
fn collect_array_links(pattern: &Regex, source: &str) -> Vec<Link> {
    let mut seen = IndexSet::new();
    for captures in pattern.captures_iter(source) {
        for entry in QUOTED.captures_iter(&captures[1]) {
            let raw = &entry[1];
            if !PSEUDO_MODULES.contains(&raw) {
                seen.insert(Link::new(raw, normalize_reference(raw)));
            }
        }
    }
    seen.into_iter().collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequireJsAdapter;

impl ModuleAdapter for RequireJsAdapter {
    fn resolve_uri(&self, uri: &Path) -> Result<Resolved> {
        match first_existing_file(&[uri.to_path_buf(), with_suffix(uri, ".js")])? {
            Some(path) => Ok(Resolved::Module(path)),
            None => Err(BundleError::UnresolvedModule {
                uri: uri.to_path_buf(),
            }
            .into()),
        }
    }

    fn parse_module(&self, path: &Path, _context: &ParseContext<'_>) -> Result<ModuleReport> {
        let source = read_source(path)?;
        let mut static_links: IndexSet<Link> = collect_array_links(&DEFINE_DEPENDENCIES, &source)
            .into_iter()
            .collect();
        static_links.extend(collect_links(&STATIC_REQUIRE, &source, |_| false));

        Ok(ModuleReport {
            static_links: static_links.into_iter().collect(),
            dynamic_links: collect_array_links(&ASYNC_REQUIRE, &source),
        })
    }

    fn encode_module(
        &self,
        path: &Path,
        _canonical_id: &str,
        _static_links: &[Link],
    ) -> Result<String> {
        Ok(read_source(path)?.trim().to_owned())
    }

    fn bundle_header(&self) -> Option<String> {
        Some(DEFINE_SHIM.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::{manifest::Manifest, report::PackageReport};

    #[test]
    fn test_parse_define_and_async_require() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let module = temp_dir.path().join("main.js");
        std::fs::write(
            &module,
            concat!(
                "define(['require', './a', \"lib/b.js\"], function(require, a, b) {\n",
                "    var c = require('./c');\n",
                "    require(['./lazy'], function(lazy) {});\n",
                "});\n",
            ),
        )?;

        let manifest = Manifest::from_value(temp_dir.path(), serde_json::json!({}))?;
        let package_report = PackageReport::new("main");
        let context = ParseContext {
            manifest: &manifest,
            package_report: &package_report,
            package_path: temp_dir.path(),
        };
        let report = RequireJsAdapter.parse_module(&module, &context)?;

        assert_eq!(
            report.static_links,
            vec![
                Link::new("./a", "./a"),
                Link::new("lib/b.js", "lib/b"),
                Link::new("./c", "./c"),
            ]
        );
        assert_eq!(report.dynamic_links, vec![Link::new("./lazy", "./lazy")]);
        Ok(())
    }

    #[test]
    fn test_header_installs_define() {
        assert!(
            RequireJsAdapter
                .bundle_header()
                .is_some_and(|header| header.starts_with("var define"))
        );
    }
}
