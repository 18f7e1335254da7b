//! package.json loading and caching

use super::exports::{ExportMap, PackageExports, parse_keyed};
use crate::fs::VirtualFs;
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::warn;

#[derive(Debug, Deserialize, Default)]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    main: Option<String>,
    module: Option<String>,
    browser: Option<Value>,
    #[serde(rename = "type")]
    module_type: Option<String>,
    exports: Option<Value>,
    imports: Option<Value>,
}

/// The fields of a package manifest the resolver reads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageManifest {
    pub name: Option<String>,
    pub version: Option<String>,
    pub main: Option<String>,
    pub module: Option<String>,
    /// Only the string form; the object form remaps files and is not followed
    pub browser: Option<String>,
    pub module_type: Option<String>,
    pub exports: Option<PackageExports>,
    pub imports: Vec<(String, ExportMap)>,
}

impl PackageManifest {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawManifest = serde_json::from_str(text)?;
        Ok(Self {
            name: raw.name,
            version: raw.version,
            main: raw.main,
            module: raw.module,
            browser: raw.browser.and_then(|value| value.as_str().map(str::to_string)),
            module_type: raw.module_type,
            exports: raw
                .exports
                .filter(|value| !value.is_null())
                .map(|value| PackageExports::parse(&value)),
            imports: raw.imports.map(|value| parse_keyed(&value)).unwrap_or_default(),
        })
    }

    /// A main-style field by name (`module`, `main`, `browser`)
    pub fn entry_field(&self, field: &str) -> Option<&str> {
        match field {
            "main" => self.main.as_deref(),
            "module" => self.module.as_deref(),
            "browser" => self.browser.as_deref(),
            _ => None,
        }
    }

    pub fn is_esm(&self) -> bool {
        self.module_type.as_deref() == Some("module")
    }
}

/// Manifests by path. A missing or malformed manifest is cached as `None`.
/// Clones share the same map.
#[derive(Clone, Default)]
pub struct ManifestCache {
    entries: Rc<RefCell<HashMap<String, Option<Rc<PackageManifest>>>>>,
}

impl ManifestCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, fs: &VirtualFs, manifest_path: &str) -> Option<Rc<PackageManifest>> {
        if let Some(cached) = self.entries.borrow().get(manifest_path) {
            return cached.clone();
        }

        let loaded = fs.read_to_string(manifest_path).ok().and_then(|text| {
            PackageManifest::parse(&text)
                .map_err(|err| warn!(path = %manifest_path, error = %err, "invalid package.json"))
                .ok()
                .map(Rc::new)
        });
        self.entries
            .borrow_mut()
            .insert(manifest_path.to_string(), loaded.clone());
        loaded
    }

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
