//! Node-style (CommonJS) adapter

use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use anyhow::Result;
use indexmap::IndexSet;
use regex::Regex;

use super::{ModuleAdapter, ParseContext, Resolved, first_existing_file, read_source, with_suffix};
use crate::{
    error::BundleError,
    report::{Link, ModuleReport},
};

pub const NODE_ADAPTER: &str = "github.com/sourcemint/platform-nodejs/0";

pub(super) static STATIC_REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\brequire\s*\(\s*["']([^"']+)["']\s*\)"#).expect("valid regex")
});

static ASYNC_REQUIRE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\brequire\.async\s*\(").expect("valid regex"));

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^["']([^"']+)["']$"#).expect("valid regex"));

/// Modules provided by the Node runtime itself; never bundled
const CORE_MODULES: &[&str] = &[
    "assert",
    "buffer",
    "child_process",
    "cluster",
    "crypto",
    "dgram",
    "dns",
    "events",
    "fs",
    "http",
    "https",
    "net",
    "os",
    "path",
    "punycode",
    "querystring",
    "readline",
    "stream",
    "string_decoder",
    "timers",
    "tls",
    "tty",
    "url",
    "util",
    "vm",
    "zlib",
];

fn is_core_module(reference: &str) -> bool {
    reference.starts_with("node:") || CORE_MODULES.contains(&reference)
}

/// Strip a trailing `.js` so `./a` and `./a.js` name the same module
pub(super) fn normalize_reference(reference: &str) -> String {
    reference
        .strip_suffix(".js")
        .unwrap_or(reference)
        .to_owned()
}

/// Collect the first capture group of every match, deduplicated, in source order
pub(super) fn collect_links(
    pattern: &Regex,
    source: &str,
    skip: impl Fn(&str) -> bool,
) -> Vec<Link> {
    let mut seen = IndexSet::new();
    for captures in pattern.captures_iter(source) {
        let raw = &captures[1];
        if !skip(raw) {
            seen.insert(Link::new(raw, normalize_reference(raw)));
        }
    }
    seen.into_iter().collect()
}

/// Source text of the first argument of a call whose argument list starts
/// at the beginning of `rest`
fn first_argument(rest: &str) -> &str {
    let mut depth = 0_usize;
    let mut quote = None;
    let mut escaped = false;
    for (index, ch) in rest.char_indices() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' | '`' => quote = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' if depth == 0 => return rest[..index].trim(),
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => return rest[..index].trim(),
            _ => {}
        }
    }
    rest.trim()
}

/// Every `require.async()` call; a computed first argument is kept as its
/// source text since only resolvers can name its targets
fn collect_async_links(source: &str) -> Vec<Link> {
    let mut seen = IndexSet::new();
    for call in ASYNC_REQUIRE.find_iter(source) {
        let argument = first_argument(&source[call.end()..]);
        if argument.is_empty() {
            continue;
        }
        let link = match STRING_LITERAL.captures(argument) {
            Some(literal) => Link::new(&literal[1], normalize_reference(&literal[1])),
            None => Link::new(argument, argument),
        };
        seen.insert(link);
    }
    seen.into_iter().collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NodeAdapter;

impl ModuleAdapter for NodeAdapter {
    fn resolve_uri(&self, uri: &Path) -> Result<Resolved> {
        if uri.extension().is_some_and(|ext| ext == "node") {
            return Ok(Resolved::Ignore);
        }
        let candidates: [PathBuf; 3] = [
            uri.to_path_buf(),
            with_suffix(uri, ".js"),
            uri.join("index.js"),
        ];
        match first_existing_file(&candidates)? {
            Some(path) => Ok(Resolved::Module(path)),
            None => Err(BundleError::UnresolvedModule {
                uri: uri.to_path_buf(),
            }
            .into()),
        }
    }

    fn parse_module(&self, path: &Path, context: &ParseContext<'_>) -> Result<ModuleReport> {
        let source = read_source(path)?;
        // A mapping declared under a core module's name shadows the core module
        let is_mapped = |reference: &str| {
            let alias = reference.split('/').next().unwrap_or(reference);
            matches!(context.manifest.mapping(alias), Ok(Some(_)))
        };
        Ok(ModuleReport {
            static_links: collect_links(&STATIC_REQUIRE, &source, |reference| {
                is_core_module(reference) && !is_mapped(reference)
            }),
            dynamic_links: collect_async_links(&source),
        })
    }

    fn encode_module(
        &self,
        path: &Path,
        _canonical_id: &str,
        _static_links: &[Link],
    ) -> Result<String> {
        let source = read_source(path)?;
        Ok(format!(
            "function(require, exports, module) {{\n{}\n}}",
            source.trim_end()
        ))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::{manifest::Manifest, report::PackageReport};

    #[test]
    fn test_resolve_tries_extension_and_index() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().canonicalize()?;
        std::fs::write(root.join("a.js"), "")?;
        std::fs::create_dir(root.join("lib"))?;
        std::fs::write(root.join("lib/index.js"), "")?;

        let adapter = NodeAdapter;
        assert_eq!(
            adapter.resolve_uri(&root.join("a"))?,
            Resolved::Module(root.join("a.js"))
        );
        assert_eq!(
            adapter.resolve_uri(&root.join("lib"))?,
            Resolved::Module(root.join("lib/index.js"))
        );
        assert_eq!(
            adapter.resolve_uri(&root.join("addon.node"))?,
            Resolved::Ignore
        );
        assert!(adapter.resolve_uri(&root.join("missing")).is_err());
        Ok(())
    }

    #[test]
    fn test_parse_finds_static_and_dynamic_links() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let module = temp_dir.path().join("index.js");
        std::fs::write(
            &module,
            concat!(
                "var a = require('./a.js');\n",
                "var fs = require(\"fs\");\n",
                "var fmt = require(\"util-lib/format\");\n",
                "var again = require('./a');\n",
                "require.async('./plugins/' + name, function() {});\n",
                "require.async(\"./worker\", done);\n",
            ),
        )?;

        let manifest = Manifest::from_value(temp_dir.path(), serde_json::json!({}))?;
        let package_report = PackageReport::new("index");
        let context = ParseContext {
            manifest: &manifest,
            package_report: &package_report,
            package_path: temp_dir.path(),
        };
        let report = NodeAdapter.parse_module(&module, &context)?;

        assert_eq!(
            report.static_links,
            vec![
                Link::new("./a.js", "./a"),
                Link::new("util-lib/format", "util-lib/format"),
                Link::new("./a", "./a"),
            ]
        );
        assert_eq!(
            report.dynamic_links,
            vec![
                Link::new("'./plugins/' + name", "'./plugins/' + name"),
                Link::new("./worker", "./worker"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_async_argument_stops_at_top_level_comma() {
        assert_eq!(
            collect_async_links("require.async(resolve(dir, 'a,b'), function() {});"),
            vec![Link::new("resolve(dir, 'a,b')", "resolve(dir, 'a,b')")]
        );
        assert!(collect_async_links("require.async()").is_empty());
    }

    #[test]
    fn test_mapping_shadows_core_module() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let module = temp_dir.path().join("index.js");
        std::fs::write(&module, "require('util'); require('fs');\n")?;

        let manifest = Manifest::from_value(
            temp_dir.path(),
            serde_json::json!({ "mappings": { "util": "./vendor/util" } }),
        )?;
        let package_report = PackageReport::new("index");
        let context = ParseContext {
            manifest: &manifest,
            package_report: &package_report,
            package_path: temp_dir.path(),
        };
        let report = NodeAdapter.parse_module(&module, &context)?;

        assert_eq!(report.static_links, vec![Link::new("util", "util")]);
        Ok(())
    }

    #[test]
    fn test_encode_wraps_module_body() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let module = temp_dir.path().join("a.js");
        std::fs::write(&module, "exports.a = 1;\n")?;

        let code = NodeAdapter.encode_module(&module, "/a.js", &[])?;
        assert_eq!(
            code,
            "function(require, exports, module) {\nexports.a = 1;\n}"
        );
        Ok(())
    }
}
