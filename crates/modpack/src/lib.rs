//! Package bundler
//!
//! Resolves the module graph of a package, including the packages it maps
//! under aliases, and packs every reachable module into one bundle file that
//! keeps enough metadata to rebuild the module graph when it is loaded.

pub mod adapter;
pub mod bundle;
pub mod bundler;
pub mod error;
pub mod manifest;
pub mod namespace;
pub mod report;
pub mod resolver;
pub mod resources;

pub use bundler::{Bundler, BundlerOptions, LoaderOptions, bundle};
pub use error::{BundleError, ErrorKind, error_kind};
