//! Package bundle service
//!
//! Turns an installed package into one ESM module the page can import:
//! resolve the entry with the dynamic (require-first) profile, recover
//! named exports from the entry source, build with the host bundler and
//! post-process the output for ESM interop. Results are cached by specifier
//! until [`PackageBundleService::invalidate`] is called.

use super::interop::{recover_export_names, rewrite_default_export, rewrite_external_requires};
use super::plugin::LoaderPlugin;
use super::{BuildOptions, BundleError, BundleFormat, BundleResult, Bundler};
use crate::fs::VirtualFs;
use crate::resolver::{DEFAULT_MODULES_DIR, ManifestCache, ModuleResolver, ResolverProfile};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Packages the host page provides itself; bundling them would create a
/// second copy
pub const DEFAULT_ALWAYS_EXTERNAL: &[&str] = &[
    "react",
    "react-dom",
    "react/jsx-runtime",
    "react/jsx-dev-runtime",
    "react-dom/client",
];

/// Specifier -> bundle text. Clones share one map.
#[derive(Clone, Default)]
pub struct BundleCache {
    entries: Rc<RefCell<HashMap<String, Rc<str>>>>,
}

impl BundleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, specifier: &str) -> Option<Rc<str>> {
        self.entries.borrow().get(specifier).cloned()
    }

    pub fn insert(&self, specifier: &str, bundle: Rc<str>) {
        self.entries
            .borrow_mut()
            .insert(specifier.to_string(), bundle);
    }

    /// Drop every entry; a changed package can affect any bundle that
    /// inlined it
    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

/// What the dev-server collaborator receives for a specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleResponse {
    Module { specifier: String, body: Rc<str> },
    Failed { specifier: String, message: String },
}

impl BundleResponse {
    pub fn status(&self) -> u16 {
        match self {
            BundleResponse::Module { .. } => 200,
            BundleResponse::Failed { .. } => 500,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            BundleResponse::Module { .. } => "application/javascript; charset=utf-8",
            BundleResponse::Failed { .. } => "text/plain; charset=utf-8",
        }
    }

    pub fn specifier(&self) -> &str {
        match self {
            BundleResponse::Module { specifier, .. } | BundleResponse::Failed { specifier, .. } => {
                specifier
            }
        }
    }
}

pub struct PackageBundleService {
    fs: VirtualFs,
    bundler: Rc<dyn Bundler>,
    cache: BundleCache,
    manifests: ManifestCache,
    project_root: String,
    modules_dir: String,
    always_external: Vec<String>,
}

impl PackageBundleService {
    pub fn new(fs: VirtualFs, bundler: Rc<dyn Bundler>, project_root: impl Into<String>) -> Self {
        Self {
            fs,
            bundler,
            cache: BundleCache::new(),
            manifests: ManifestCache::new(),
            project_root: project_root.into(),
            modules_dir: DEFAULT_MODULES_DIR.to_string(),
            always_external: DEFAULT_ALWAYS_EXTERNAL
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }

    /// Use a session-owned cache pair instead of private ones
    pub fn with_caches(mut self, cache: BundleCache, manifests: ManifestCache) -> Self {
        self.cache = cache;
        self.manifests = manifests;
        self
    }

    pub fn with_always_external(mut self, always_external: Vec<String>) -> Self {
        self.always_external = always_external;
        self
    }

    pub fn with_modules_dir(mut self, modules_dir: impl Into<String>) -> Self {
        self.modules_dir = modules_dir.into();
        self
    }

    pub fn cache(&self) -> &BundleCache {
        &self.cache
    }

    fn resolver(&self, profile: ResolverProfile) -> ModuleResolver {
        ModuleResolver::new(self.fs.clone(), profile)
            .with_cache(self.manifests.clone())
            .with_modules_dir(self.modules_dir.clone())
    }

    /// Bundle `specifier` as a single ESM module
    pub async fn bundle(&self, specifier: &str) -> BundleResult<Rc<str>> {
        if let Some(hit) = self.cache.get(specifier) {
            debug!(specifier, "bundle cache hit");
            return Ok(hit);
        }
        debug!(specifier, "bundle cache miss");

        let entry = self
            .resolver(ResolverProfile::dynamic())
            .resolve(specifier, &self.project_root)
            .ok_or_else(|| BundleError::Unresolved {
                specifier: specifier.to_string(),
            })?;
        let source = self.fs.read_to_string(&entry)?;
        let names = recover_export_names(&source);
        debug!(specifier, entry = %entry, exports = names.len(), "bundling package");

        let plugin = LoaderPlugin::new(
            self.fs.clone(),
            self.resolver(ResolverProfile::declarative()),
        )
        .with_external(self.always_external.clone());
        let options = BuildOptions {
            entry_point: entry,
            format: BundleFormat::Esm,
            external: self.always_external.clone(),
        };

        let output = self
            .bundler
            .build(options, Rc::new(plugin))
            .await
            .map_err(|messages| {
                warn!(specifier, errors = messages.len(), "bundle failed");
                BundleError::BuildFailed {
                    specifier: specifier.to_string(),
                    messages,
                }
            })?;

        let code = rewrite_external_requires(&output.code);
        let code = rewrite_default_export(&code, &names);
        let bundle: Rc<str> = Rc::from(code);
        self.cache.insert(specifier, Rc::clone(&bundle));
        Ok(bundle)
    }

    /// The dev-server surface: never fails, failures name the specifier
    pub async fn handle(&self, specifier: &str) -> BundleResponse {
        match self.bundle(specifier).await {
            Ok(body) => BundleResponse::Module {
                specifier: specifier.to_string(),
                body,
            },
            Err(err) => BundleResponse::Failed {
                specifier: specifier.to_string(),
                message: err.to_string(),
            },
        }
    }

    /// Forget every bundle and every cached manifest
    pub fn invalidate(&self) {
        debug!(entries = self.cache.len(), "invalidating bundle cache");
        self.cache.clear();
        self.manifests.clear();
    }
}
