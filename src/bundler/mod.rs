//! Bundler orchestration
//!
//! The runtime does not bundle by itself. The host supplies a compiled
//! bundler through the [`Bundler`] trait, and the runtime drives it through
//! a resolve/load plugin contract:
//! - [`plugin`]: [`LoaderPlugin`], answering resolve/load from the virtual
//!   filesystem
//! - [`service`]: [`PackageBundleService`], one ESM bundle per installed
//!   package, cached
//! - [`interop`]: the text rewrites that make CommonJS bundles usable as ESM

pub mod interop;
pub mod plugin;
pub mod service;

pub use plugin::LoaderPlugin;
pub use service::{BundleCache, BundleResponse, PackageBundleService};

use crate::fs::{FsError, path};
use futures_util::future::LocalBoxFuture;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Errors that can occur during bundling
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Could not resolve '{specifier}'")]
    Unresolved { specifier: String },

    #[error("Bundling '{specifier}' failed: {}", join_messages(.messages))]
    BuildFailed {
        specifier: String,
        messages: Vec<Message>,
    },

    #[error(transparent)]
    Fs(#[from] FsError),
}

impl BundleError {
    /// The specifier that failed, when known
    pub fn specifier(&self) -> Option<&str> {
        match self {
            BundleError::Unresolved { specifier } | BundleError::BuildFailed { specifier, .. } => {
                Some(specifier)
            }
            BundleError::Fs(_) => None,
        }
    }
}

fn join_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for bundler operations
pub type BundleResult<T> = Result<T, BundleError>;

/// Bundle output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BundleFormat {
    /// ES Module format
    #[default]
    Esm,
    /// CommonJS format
    Cjs,
    /// Immediately Invoked Function Expression
    Iife,
}

/// How the bundler should parse loaded contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loader {
    Js,
    Jsx,
    Ts,
    Tsx,
    Json,
    Text,
}

impl Loader {
    pub fn from_path(file: &str) -> Self {
        match path::extname(file) {
            ".js" | ".mjs" | ".cjs" => Loader::Js,
            ".jsx" => Loader::Jsx,
            ".ts" | ".mts" | ".cts" => Loader::Ts,
            ".tsx" => Loader::Tsx,
            ".json" => Loader::Json,
            _ => Loader::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    EntryPoint,
    ImportStatement,
    RequireCall,
    DynamicImport,
}

/// Side-channel data attached to a resolved path and handed back on load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    /// The path the bundler sees (possibly aliased)
    pub path: String,
    /// Served from the virtual filesystem
    pub from_virtual_store: bool,
    /// The file actually read when `path` is an alias
    pub real_path: Option<String>,
}

impl ResolvedModule {
    /// The file to read for this module
    pub fn source_path(&self) -> &str {
        self.real_path.as_deref().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone)]
pub struct ResolveArgs {
    pub path: String,
    pub importer: String,
    /// Directory relative specifiers are resolved against
    pub resolve_dir: String,
    pub namespace: String,
    pub kind: ImportKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved {
        path: String,
        namespace: String,
        plugin_data: Option<ResolvedModule>,
    },
    /// Leave the import in the output untouched
    External { path: String },
    /// Let the next plugin or the bundler's default resolution handle it
    Pass,
}

#[derive(Debug, Clone)]
pub struct LoadArgs {
    pub path: String,
    pub namespace: String,
    pub plugin_data: Option<ResolvedModule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded {
        contents: String,
        loader: Loader,
        resolve_dir: Option<String>,
    },
    Failed(Vec<Message>),
    Pass,
}

/// A bundler diagnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub text: String,
    pub file: Option<String>,
}

impl Message {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            file: None,
        }
    }

    pub fn in_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}: {}", file, self.text),
            None => f.write_str(&self.text),
        }
    }
}

/// The resolve/load hooks a bundler calls
pub trait BundlerPlugin {
    fn name(&self) -> &str;

    fn on_resolve(&self, args: &ResolveArgs) -> ResolveOutcome;

    fn on_load(&self, args: &LoadArgs) -> LoadOutcome;
}

/// Options for one build
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub entry_point: String,
    pub format: BundleFormat,
    /// Specifiers left as imports instead of bundled
    pub external: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub code: String,
    pub warnings: Vec<Message>,
}

/// A compiled bundler supplied by the host
pub trait Bundler {
    fn build(
        &self,
        options: BuildOptions,
        plugin: Rc<dyn BundlerPlugin>,
    ) -> LocalBoxFuture<'_, Result<BuildOutput, Vec<Message>>>;
}
