//! Bundle container format
//!
//! A bundle is plain script text in which every record is framed by a marker
//! line:
//!
//! ```text
//! // @sourcemint-bundle-<kind>: <json metadata>
//! <body>
//! ```
//!
//! A record's body runs up to the line before the next marker (or the end of
//! the text). `ignore` records only delimit scaffolding such as the payload
//! envelope and the loader stub, so that parsing a generated bundle and
//! generating it again reproduces the same text.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::LazyLock,
};

use anyhow::Result;
use indexmap::IndexMap;
use log::{debug, warn};
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::BundleError;

pub const MARKER_PREFIX: &str = "// @sourcemint-bundle-";

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*//[ \t]*@sourcemint-bundle-([^:\n]*):[ \t]*(.*?)[ \t]*$")
        .expect("valid regex")
});

const PAYLOAD_OPEN: &str = "require.bundle(\"\", function(require)\n{";
const PAYLOAD_CLOSE: &str = "});";

const LOADER_OPEN: &str = concat!(
    "var require, sourcemint;\n",
    "(function() {\n",
    "    var rootBundleLoader = function(uri, loadedCallback) {",
);

const LOADER_CALLBACK: &str = concat!(
    "        if (typeof loadedCallback === \"function\") loadedCallback();\n",
    "    }\n",
    "    function initLoader(exports) {\n",
);

const LOADER_INSTALL: &str = "\n    };\n    if (typeof sourcemint === \"undefined\") {\n";

/// Record kinds of the container format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Ignore,
    Header,
    Loader,
    Module,
    Descriptor,
    Report,
}

impl SectionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Header => "header",
            Self::Loader => "loader",
            Self::Module => "module",
            Self::Descriptor => "descriptor",
            Self::Report => "report",
        }
    }

    fn parse(kind: &str) -> Result<Self> {
        Ok(match kind {
            "ignore" => Self::Ignore,
            "header" => Self::Header,
            "loader" => Self::Loader,
            "module" => Self::Module,
            "descriptor" => Self::Descriptor,
            "report" => Self::Report,
            other => return Err(BundleError::UnknownSection(other.to_owned()).into()),
        })
    }
}

/// One marker-delimited section of a bundle text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section<'a> {
    pub kind: &'a str,
    pub meta: &'a str,
    pub body: &'a str,
}

/// Split bundle text into its marker-delimited sections, in order
///
/// Text before the first marker is not part of any section.
pub fn tokenize(text: &str) -> Vec<Section<'_>> {
    let markers: Vec<_> = MARKER.captures_iter(text).collect();
    let mut sections = Vec::with_capacity(markers.len());

    for (index, captures) in markers.iter().enumerate() {
        let (Some(marker), Some(kind), Some(meta)) = (captures.get(0), captures.get(1), captures.get(2))
        else {
            continue;
        };
        let start = if text[marker.end()..].starts_with('\n') {
            marker.end() + 1
        } else {
            marker.end()
        };
        let end = markers
            .get(index + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |next| next.start())
            .max(start);
        let body = &text[start..end];
        sections.push(Section {
            kind: kind.as_str(),
            meta: meta.as_str(),
            body: body.strip_suffix('\n').unwrap_or(body),
        });
    }
    sections
}

/// The marker line of a record, without a line terminator
pub fn marker(kind: SectionKind, meta: &Value) -> String {
    format!("{MARKER_PREFIX}{}: {meta}", kind.as_str())
}

/// Code and metadata of one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub code: String,
    pub meta: Value,
}

impl Record {
    pub fn new(code: impl Into<String>, meta: Value) -> Self {
        Self {
            code: code.into(),
            meta,
        }
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new("", Value::Object(Map::new()))
    }
}

/// Loader flag, metadata and the loader runtime source inlined in the stub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderSection {
    pub enabled: bool,
    pub meta: Value,
    pub runtime: String,
}

impl Default for LoaderSection {
    fn default() -> Self {
        Self {
            enabled: false,
            meta: Value::Object(Map::new()),
            runtime: String::new(),
        }
    }
}

impl LoaderSection {
    fn url_prefix(&self) -> Option<&str> {
        self.meta
            .get("bundleUrlPrefix")
            .and_then(Value::as_str)
            .filter(|prefix| !prefix.is_empty())
    }
}

/// Streaming writer for the container format
///
/// Used by [`Bundle::save`] and by the orchestrator, which writes records as
/// it walks the module graph instead of collecting them first.
#[derive(Debug)]
pub struct BundleWriter<W: Write> {
    out: W,
}

impl<W: Write> BundleWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn section(&mut self, kind: SectionKind, meta: &Value, body: &str) -> io::Result<()> {
        writeln!(self.out, "{}", marker(kind, meta))?;
        writeln!(self.out, "{body}")
    }

    fn ignore(&mut self, body: &str) -> io::Result<()> {
        writeln!(self.out, "{MARKER_PREFIX}{}: ", SectionKind::Ignore.as_str())?;
        writeln!(self.out, "{body}")
    }

    fn memoized(&mut self, kind: SectionKind, id: &str, code: &str, meta: &Value) -> io::Result<()> {
        let meta = with_id(meta, id);
        let body = format!("require.memoize({}, \n{code}\n);", Value::from(id));
        self.section(kind, &meta, &body)
    }

    pub fn begin_payload(&mut self) -> io::Result<()> {
        self.ignore(PAYLOAD_OPEN)
    }

    pub fn header(&mut self, code: &str, meta: &Value) -> io::Result<()> {
        self.section(SectionKind::Header, meta, code)
    }

    pub fn module(&mut self, id: &str, code: &str, meta: &Value) -> io::Result<()> {
        self.memoized(SectionKind::Module, id, code, meta)
    }

    pub fn descriptor(&mut self, id: &str, code: &str, meta: &Value) -> io::Result<()> {
        self.memoized(SectionKind::Descriptor, id, code, meta)
    }

    pub fn end_payload(&mut self) -> io::Result<()> {
        self.ignore(PAYLOAD_CLOSE)
    }

    /// Open the loader stub; the payload follows
    pub fn begin_loader(&mut self, meta: &Value) -> io::Result<()> {
        self.section(SectionKind::Loader, meta, LOADER_OPEN)
    }

    /// Close the loader stub, inlining the loader runtime and the code that
    /// installs it and starts the bundle named `bundle_name`
    pub fn end_loader(&mut self, loader: &LoaderSection, bundle_name: &str) -> io::Result<()> {
        let target = match loader.url_prefix() {
            Some(prefix) => format!("{{host}}{prefix}{bundle_name}"),
            None => bundle_name.to_owned(),
        };
        let body = format!(
            "{LOADER_CALLBACK}{}{LOADER_INSTALL}{}",
            loader.runtime,
            install_lines(&target)
        );
        self.ignore(&body)
    }

    /// Trailing report record; ends the bundle
    pub fn report(&mut self, report: &Value) -> io::Result<()> {
        writeln!(self.out, "{}", marker(SectionKind::Report, report))
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn install_lines(target: &str) -> String {
    let sandbox = format!(
        "        sourcemint.sandbox({}, function(sandbox) {{",
        Value::from(target)
    );
    [
        "        var exports = {};",
        "        initLoader(exports);",
        "        sourcemint = exports.require;",
        "        if (!require) require = sourcemint;",
        sandbox.as_str(),
        "            sandbox.main();",
        "        }, {",
        "            rootBundleLoader: rootBundleLoader",
        "        });",
        "    } else {",
        "        rootBundleLoader();",
        "    }",
        "})();",
    ]
    .join("\n")
}

/// Copy of `meta` with `id` stamped into it
fn with_id(meta: &Value, id: &str) -> Value {
    let mut meta = match meta {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    meta.insert("id".to_owned(), Value::from(id));
    Value::Object(meta)
}

/// Structured state of one bundle file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    path: PathBuf,
    header: Record,
    descriptors: IndexMap<String, Record>,
    modules: IndexMap<String, Record>,
    report: Value,
    loader: LoaderSection,
}

impl Bundle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            header: Record::default(),
            descriptors: IndexMap::new(),
            modules: IndexMap::new(),
            report: Value::Object(Map::new()),
            loader: LoaderSection::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn modules(&self) -> &IndexMap<String, Record> {
        &self.modules
    }

    pub fn descriptors(&self) -> &IndexMap<String, Record> {
        &self.descriptors
    }

    pub fn loader(&self) -> &LoaderSection {
        &self.loader
    }

    /// Drop every record and return to the empty state
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.path));
    }

    pub fn set_header(&mut self, code: impl Into<String>, meta: Value) {
        self.header = Record::new(code, meta);
    }

    pub fn set_loader(&mut self, enabled: bool, meta: Value) {
        self.loader.enabled = enabled;
        self.loader.meta = meta;
    }

    /// Loader runtime source inlined into loader bundles
    pub fn set_loader_runtime(&mut self, runtime: impl Into<String>) {
        self.loader.runtime = runtime.into();
    }

    pub fn set_module(&mut self, id: &str, code: impl Into<String>, meta: &Value) {
        self.modules
            .insert(id.to_owned(), Record::new(code, with_id(meta, id)));
    }

    pub fn set_descriptor(&mut self, id: &str, code: impl Into<String>, meta: &Value) {
        self.descriptors
            .insert(id.to_owned(), Record::new(code, with_id(meta, id)));
    }

    pub fn set_report(&mut self, report: Value) {
        self.report = report;
    }

    /// Load the bundle from disk
    ///
    /// A missing file is created empty first. A file that cannot be parsed is
    /// logged and leaves the bundle in its empty state.
    pub fn open(&mut self) -> Result<()> {
        if !self.path.exists() {
            debug!("Creating empty bundle {}", self.path.display());
            self.save()?;
        }
        let text = std::fs::read_to_string(&self.path)
            .map_err(|source| BundleError::io(&self.path, source))?;
        if let Err(err) = self.parse(&text) {
            warn!("Error '{err:#}' parsing bundle: {}", self.path.display());
            self.reset();
        }
        Ok(())
    }

    /// Replace the state of this bundle with the records found in `text`
    ///
    /// On failure the current state is left untouched.
    pub fn parse(&mut self, text: &str) -> Result<()> {
        let mut parsed = Self::new(self.path.clone());
        for section in tokenize(text) {
            parsed.apply(section)?;
        }
        *self = parsed;
        Ok(())
    }

    fn apply(&mut self, section: Section<'_>) -> Result<()> {
        match SectionKind::parse(section.kind)? {
            SectionKind::Ignore => {
                if self.loader.enabled {
                    if let Some(runtime) = loader_runtime(section.body) {
                        self.loader.runtime = runtime.to_owned();
                    }
                }
            }
            SectionKind::Header => {
                self.header = Record::new(section.body, parse_meta(&section)?);
            }
            SectionKind::Loader => {
                self.set_loader(true, parse_meta(&section)?);
            }
            SectionKind::Module => {
                let (id, record) = memoized_record(&section)?;
                self.modules.insert(id, record);
            }
            SectionKind::Descriptor => {
                let (id, record) = memoized_record(&section)?;
                self.descriptors.insert(id, record);
            }
            SectionKind::Report => {
                self.report = parse_meta(&section)?;
            }
        }
        Ok(())
    }

    /// Write the bundle to disk, replacing any previous content
    pub fn save(&self) -> Result<()> {
        debug!("Writing bundle {}", self.path.display());
        let file = File::create(&self.path).map_err(|source| BundleError::io(&self.path, source))?;
        let mut writer = BundleWriter::new(BufWriter::new(file));
        self.generate(&mut writer)
            .and_then(|()| writer.flush())
            .map_err(|source| BundleError::io(&self.path, source))?;
        Ok(())
    }

    /// Bundle text as [`Bundle::save`] would write it
    pub fn to_text(&self) -> Result<String> {
        let mut writer = BundleWriter::new(Vec::new());
        self.generate(&mut writer)
            .map_err(|source| BundleError::io(&self.path, source))?;
        Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
    }

    pub fn generate<W: Write>(&self, writer: &mut BundleWriter<W>) -> io::Result<()> {
        if self.loader.enabled {
            writer.begin_loader(&self.loader.meta)?;
            self.generate_payload(writer)?;
            writer.end_loader(&self.loader, &self.file_name())?;
        } else {
            self.generate_payload(writer)?;
        }
        writer.report(&self.report)
    }

    fn generate_payload<W: Write>(&self, writer: &mut BundleWriter<W>) -> io::Result<()> {
        writer.begin_payload()?;
        writer.header(&self.header.code, &self.header.meta)?;
        for (id, record) in &self.modules {
            writer.module(id, &record.code, &record.meta)?;
        }
        for (id, record) in &self.descriptors {
            writer.descriptor(id, &record.code, &record.meta)?;
        }
        writer.end_payload()
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn parse_meta(section: &Section<'_>) -> Result<Value> {
    if section.meta.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(section.meta).map_err(|err| {
        BundleError::MalformedRecord {
            kind: section.kind.to_owned(),
            message: format!("invalid metadata: {err}"),
        }
        .into()
    })
}

/// Id and code of a `require.memoize(...)` record
fn memoized_record(section: &Section<'_>) -> Result<(String, Record)> {
    let malformed = |message: &str| BundleError::MalformedRecord {
        kind: section.kind.to_owned(),
        message: message.to_owned(),
    };

    let meta = parse_meta(section)?;
    let id = meta
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("metadata has no string 'id'"))?
        .to_owned();

    let body = section.body;
    let (Some(first), Some(last)) = (body.find('\n'), body.rfind('\n')) else {
        return Err(malformed("body is not wrapped in a memoize call").into());
    };
    if first == last {
        return Err(malformed("body is not wrapped in a memoize call").into());
    }
    Ok((id, Record::new(&body[first + 1..last], meta)))
}

/// Runtime source inlined in the closing section of a loader stub
fn loader_runtime(body: &str) -> Option<&str> {
    let rest = body.strip_prefix(LOADER_CALLBACK)?;
    let end = rest.rfind(LOADER_INSTALL)?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::error::{ErrorKind, error_kind};

    fn sample(path: &Path) -> Bundle {
        let mut bundle = Bundle::new(path);
        bundle.set_header("var header = true;", json!({ "adapter": "node" }));
        bundle.set_module(
            "/index.js",
            "function(require, exports, module) {\nrequire('./a');\n}",
            &json!({}),
        );
        bundle.set_module("/a.js", "function(require, exports, module) {\n\n}\n", &json!({}));
        bundle.set_descriptor("/package.json", r#"{"main":"/index.js"}"#, &json!({}));
        bundle.set_report(json!({ "mainBundle": "/dist/app.js" }));
        bundle
    }

    #[test]
    fn test_marker_line() {
        insta::assert_snapshot!(
            marker(SectionKind::Module, &json!({ "id": "/a.js" })),
            @r#"// @sourcemint-bundle-module: {"id":"/a.js"}"#
        );
    }

    #[test]
    fn test_payload_layout() -> Result<()> {
        let mut bundle = Bundle::new("/dist/app.js");
        bundle.set_module("/a.js", "A", &json!({}));

        assert_eq!(
            bundle.to_text()?,
            concat!(
                "// @sourcemint-bundle-ignore: \n",
                "require.bundle(\"\", function(require)\n",
                "{\n",
                "// @sourcemint-bundle-header: {}\n",
                "\n",
                "// @sourcemint-bundle-module: {\"id\":\"/a.js\"}\n",
                "require.memoize(\"/a.js\", \n",
                "A\n",
                ");\n",
                "// @sourcemint-bundle-ignore: \n",
                "});\n",
                "// @sourcemint-bundle-report: {}\n",
            )
        );
        Ok(())
    }

    #[test]
    fn test_payload_round_trip() -> Result<()> {
        let bundle = sample(Path::new("/dist/app.js"));
        let text = bundle.to_text()?;

        let mut parsed = Bundle::new("/dist/app.js");
        parsed.parse(&text)?;

        assert_eq!(parsed, bundle);
        assert_eq!(parsed.to_text()?, text);
        assert_eq!(
            parsed.modules().keys().collect::<Vec<_>>(),
            vec!["/index.js", "/a.js"]
        );
        assert_eq!(parsed.modules()["/a.js"].code, "function(require, exports, module) {\n\n}\n");
        Ok(())
    }

    #[test]
    fn test_loader_round_trip() -> Result<()> {
        let mut bundle = sample(Path::new("/dist/app.js"));
        bundle.set_loader(true, json!({ "bundleUrlPrefix": "/static/" }));
        bundle.set_loader_runtime("exports.require = function() {};\n");
        let text = bundle.to_text()?;

        assert!(text.starts_with("// @sourcemint-bundle-loader: {\"bundleUrlPrefix\":\"/static/\"}\n"));
        assert!(text.contains("sourcemint.sandbox(\"{host}/static/app.js\", function(sandbox) {"));

        let mut parsed = Bundle::new("/dist/app.js");
        parsed.parse(&text)?;

        assert!(parsed.loader().enabled);
        assert_eq!(parsed.loader().runtime, "exports.require = function() {};\n");
        assert_eq!(parsed.to_text()?, text);
        Ok(())
    }

    #[test]
    fn test_tokenize_sections() {
        let text = concat!(
            "// @sourcemint-bundle-header: {}\n",
            "line one\n",
            "line two\n",
            "  //  @sourcemint-bundle-report:  {\"a\":1}  \n",
        );
        assert_eq!(
            tokenize(text),
            vec![
                Section {
                    kind: "header",
                    meta: "{}",
                    body: "line one\nline two",
                },
                Section {
                    kind: "report",
                    meta: "{\"a\":1}",
                    body: "",
                },
            ]
        );
    }

    #[test]
    fn test_unknown_section_fails() {
        let mut bundle = Bundle::new("/dist/app.js");
        let err = bundle
            .parse("// @sourcemint-bundle-partition-map: {}\n")
            .expect_err("unknown kind must fail");
        assert_eq!(error_kind(&err), Some(ErrorKind::Format));
        assert!(err.to_string().contains("partition-map"));
    }

    #[test]
    fn test_kind_runs_up_to_colon() {
        let mut bundle = Bundle::new("/dist/app.js");
        let err = bundle
            .parse("// @sourcemint-bundle-report : {}\n")
            .expect_err("kind includes the space before the colon");
        assert_eq!(error_kind(&err), Some(ErrorKind::Format));
        assert!(err.to_string().contains("report "));
    }

    #[test]
    fn test_open_creates_missing_bundle() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("app.js");

        let mut bundle = Bundle::new(&path);
        bundle.open()?;

        assert!(path.is_file());
        assert_eq!(bundle, Bundle::new(&path));
        Ok(())
    }

    #[test]
    fn test_open_existing_bundle() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("app.js");
        sample(&path).save()?;

        let mut bundle = Bundle::new(&path);
        bundle.open()?;

        assert_eq!(bundle, sample(&path));
        Ok(())
    }

    #[test]
    fn test_open_corrupt_bundle_resets() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("app.js");
        std::fs::write(&path, "// @sourcemint-bundle-module: {\"id\":\"/a.js\"}\nno memoize\n")?;

        let mut bundle = sample(&path);
        bundle.open()?;

        assert_eq!(bundle, Bundle::new(&path));
        Ok(())
    }
}
