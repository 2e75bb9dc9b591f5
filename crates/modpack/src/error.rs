//! Error types shared by the resolver, the orchestrator and the bundle codec
//!
//! Every concrete failure is a [`BundleError`] variant. Library functions return
//! `anyhow::Result`, so callers classify a failure by downcasting through any
//! context that was attached on the way up.

use std::{fmt, path::PathBuf};

use thiserror::Error;

/// Coarse classification of a [`BundleError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed manifest, or a mapping/resolver declaration that is missing
    Manifest,
    /// A link, resolver, resource or adapter that cannot be resolved
    Resolution,
    /// The bundle container text cannot be parsed
    Format,
    /// Filesystem read/write/copy failure
    Io,
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("error parsing JSON manifest '{}': {source}", path.display())]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid manifest '{}': {message}", path.display())]
    InvalidManifest { path: PathBuf, message: String },

    #[error(
        "manifest '{}' does not declare mapping '{alias}' needed to resolve aliased module '{reference}'",
        manifest.display()
    )]
    MissingMapping {
        manifest: PathBuf,
        alias: String,
        reference: String,
    },

    #[error(
        "mapping '{alias}' in manifest '{}' points to '{}' which cannot be resolved",
        manifest.display(),
        target.display()
    )]
    UnresolvableMapping {
        manifest: PathBuf,
        alias: String,
        target: PathBuf,
    },

    #[error(
        "manifest '{}' for module '{}' does not declare resolvers needed for dynamic loading of '{canonical_id}'",
        manifest.display(),
        module.display()
    )]
    MissingResolvers {
        manifest: PathBuf,
        module: PathBuf,
        canonical_id: String,
    },

    #[error("unknown adapter '{0}'")]
    UnknownAdapter(String),

    #[error("cannot resolve module '{}'", uri.display())]
    UnresolvedModule { uri: PathBuf },

    #[error("resolver '{resolver}' in manifest '{}' is not supported", manifest.display())]
    UnsupportedResolver { manifest: PathBuf, resolver: String },

    #[error("resource '{resource}' in manifest '{}' is not supported", manifest.display())]
    UnsupportedResource { manifest: PathBuf, resource: String },

    #[error("invalid glob pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("package path '{}' is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("distribution path '{}' does not exist", .0.display())]
    MissingDistribution(PathBuf),

    #[error("found unknown section type '{0}'")]
    UnknownSection(String),

    #[error("malformed '{kind}' record: {message}")]
    MalformedRecord { kind: String, message: String },

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BundleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ManifestParse { .. }
            | Self::InvalidManifest { .. }
            | Self::MissingMapping { .. }
            | Self::UnresolvableMapping { .. }
            | Self::MissingResolvers { .. } => ErrorKind::Manifest,
            Self::UnknownAdapter(_)
            | Self::UnresolvedModule { .. }
            | Self::UnsupportedResolver { .. }
            | Self::UnsupportedResource { .. }
            | Self::InvalidPattern { .. }
            | Self::NotADirectory(_)
            | Self::MissingDistribution(_) => ErrorKind::Resolution,
            Self::UnknownSection(_) | Self::MalformedRecord { .. } => ErrorKind::Format,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// Wrap an I/O error together with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Classify an `anyhow` error produced anywhere in this crate
///
/// Errors that did not originate from a [`BundleError`] are reported as `None`.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<BundleError>().map(BundleError::kind)
}

/// Context attached once to a dependency-walk failure, naming the module whose
/// links were being resolved when the failure happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyContext {
    pub module: PathBuf,
}

impl fmt::Display for DependencyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error while locating dependencies of module '{}'",
            self.module.display()
        )
    }
}
