//! Node-compatible module resolution over the virtual filesystem
//!
//! This module implements the parts of Node's algorithm the runtime needs:
//! - node_modules lookup walking up from the importing directory
//! - package.json `exports` (condition objects, `*` patterns, fallbacks)
//! - package.json `imports` (`#` specifiers)
//! - `module` / `main` / index fallback
//! - relative and absolute paths with extension and index resolution
//!
//! Resolution never errors: an unresolvable specifier is `None`.
//!
//! Two condition orders exist on purpose. The bundler-facing profile
//! ([`ResolverProfile::declarative`]) prefers `import`; the package bundle
//! service ([`ResolverProfile::dynamic`]) prefers `require`, since installed
//! packages were converted at install time and their `.mjs`/`.cjs` markers
//! are not reliable.

pub mod exports;
pub mod manifest;

pub use exports::{ExportMap, PackageExports};
pub use manifest::{ManifestCache, PackageManifest};

use crate::fs::{VirtualFs, path};
use tracing::debug;

pub const DEFAULT_MODULES_DIR: &str = "node_modules";

/// Condition priority, entry fields and extension list for one consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverProfile {
    pub conditions: Vec<String>,
    pub main_fields: Vec<String>,
    pub extensions: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

impl ResolverProfile {
    /// Bundler-facing: favors ESM for tree-shaking
    pub fn declarative() -> Self {
        Self {
            conditions: strings(&["import", "module", "browser", "default", "require"]),
            main_fields: strings(&["module", "main"]),
            extensions: strings(&[".js", ".mjs", ".cjs", ".jsx", ".ts", ".tsx", ".json"]),
        }
    }

    /// Package bundle service: favors CommonJS entries
    pub fn dynamic() -> Self {
        Self {
            conditions: strings(&["require", "node", "default", "import", "module"]),
            main_fields: strings(&["module", "main"]),
            extensions: strings(&[".js", ".cjs", ".mjs", ".json"]),
        }
    }

    /// Replace the condition priority list (custom names included)
    pub fn with_conditions<I, S>(mut self, conditions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions = conditions.into_iter().map(Into::into).collect();
        self
    }
}

/// Split `@scope/name/sub` or `name/sub` into package name and subpath
pub fn split_specifier(specifier: &str) -> Option<(&str, Option<&str>)> {
    let name_segments = if specifier.starts_with('@') { 2 } else { 1 };
    let mut boundary = None;
    let mut seen = 0;
    for (idx, ch) in specifier.char_indices() {
        if ch == '/' {
            seen += 1;
            if seen == name_segments {
                boundary = Some(idx);
                break;
            }
        }
    }

    let (name, subpath) = match boundary {
        Some(idx) => (&specifier[..idx], Some(&specifier[idx + 1..])),
        None => (specifier, None),
    };
    let valid = !name.is_empty()
        && !name.ends_with('/')
        && (name_segments == 1 || (seen >= 1 && name.len() > 2));
    if !valid {
        return None;
    }
    Some((name, subpath.filter(|sub| !sub.is_empty())))
}

fn is_relative(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
}

/// Resolves specifiers against files in a [`VirtualFs`]
pub struct ModuleResolver {
    fs: VirtualFs,
    profile: ResolverProfile,
    modules_dir: String,
    manifests: ManifestCache,
}

impl ModuleResolver {
    pub fn new(fs: VirtualFs, profile: ResolverProfile) -> Self {
        Self {
            fs,
            profile,
            modules_dir: DEFAULT_MODULES_DIR.to_string(),
            manifests: ManifestCache::new(),
        }
    }

    /// Share a manifest cache (the session keeps one so it can be cleared)
    pub fn with_cache(mut self, manifests: ManifestCache) -> Self {
        self.manifests = manifests;
        self
    }

    pub fn with_modules_dir(mut self, modules_dir: impl Into<String>) -> Self {
        self.modules_dir = modules_dir.into();
        self
    }

    pub fn profile(&self) -> &ResolverProfile {
        &self.profile
    }

    pub fn clear_cache(&self) {
        self.manifests.clear();
    }

    /// Resolve `specifier` as imported from a file in `from_dir`
    pub fn resolve(&self, specifier: &str, from_dir: &str) -> Option<String> {
        let from_dir = path::resolve("/", from_dir);
        let resolved = if path::is_absolute(specifier) {
            self.resolve_file_or_dir(&path::normalize(specifier))
        } else if is_relative(specifier) {
            self.resolve_file_or_dir(&path::resolve(&from_dir, specifier))
        } else if specifier.starts_with('#') {
            self.resolve_import(specifier, &from_dir)
        } else {
            self.resolve_bare(specifier, &from_dir)
        };

        match &resolved {
            Some(found) => debug!(specifier, from = %from_dir, resolved = %found, "resolved"),
            None => debug!(specifier, from = %from_dir, "unresolved"),
        }
        resolved
    }

    /// `path`, `path` + extension, then `path/index` + extension
    pub fn resolve_file_or_dir(&self, target: &str) -> Option<String> {
        if self.fs.is_file(target) {
            return Some(target.to_string());
        }
        let with_extension = self
            .profile
            .extensions
            .iter()
            .map(|ext| format!("{}{}", target, ext))
            .find(|candidate| self.fs.is_file(candidate));
        if with_extension.is_some() {
            return with_extension;
        }
        if !self.fs.is_dir(target) {
            return None;
        }
        self.profile
            .extensions
            .iter()
            .map(|ext| path::join(&[target, format!("index{}", ext).as_str()]))
            .find(|candidate| self.fs.is_file(candidate))
    }

    /// Directories from `from_dir` up to `/`, skipping node_modules themselves
    fn lookup_dirs<'a>(&'a self, from_dir: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let mut next = Some(from_dir);
        std::iter::from_fn(move || {
            let current = next?;
            next = (current != "/").then(|| path::dirname(current));
            Some(current)
        })
        .filter(move |dir| path::basename(dir) != self.modules_dir)
    }

    /// Resolve a package name (plus optional subpath) from `from_dir`
    pub fn resolve_bare(&self, specifier: &str, from_dir: &str) -> Option<String> {
        let (name, subpath) = split_specifier(specifier)?;
        for dir in self.lookup_dirs(from_dir) {
            let package_dir = path::join(&[dir, self.modules_dir.as_str(), name]);
            let manifest_path = path::join(&[package_dir.as_str(), "package.json"]);
            if !self.fs.is_file(&manifest_path) {
                continue;
            }
            let manifest = self.manifests.load(&self.fs, &manifest_path)?;
            return match subpath {
                None => self.resolve_main(&package_dir, &manifest),
                Some(subpath) => self.resolve_subpath(&package_dir, &manifest, subpath),
            };
        }
        None
    }

    /// Main entry of an installed package
    pub fn resolve_main(&self, package_dir: &str, manifest: &PackageManifest) -> Option<String> {
        if let Some(exports) = &manifest.exports {
            if let Some(found) = self.resolve_export(package_dir, exports, ".") {
                return Some(found);
            }
        }

        for field in &self.profile.main_fields {
            let Some(entry) = manifest.entry_field(field) else {
                continue;
            };
            if let Some(found) = self.resolve_file_or_dir(&path::join(&[package_dir, entry])) {
                return Some(found);
            }
        }

        self.resolve_file_or_dir(&path::join(&[package_dir, "index"]))
    }

    fn resolve_subpath(
        &self,
        package_dir: &str,
        manifest: &PackageManifest,
        subpath: &str,
    ) -> Option<String> {
        if let Some(exports) = &manifest.exports {
            let key = format!("./{}", subpath);
            if let Some(found) = self.resolve_export(package_dir, exports, &key) {
                return Some(found);
            }
        }
        self.resolve_file_or_dir(&path::join(&[package_dir, subpath]))
    }

    fn resolve_export(&self, package_dir: &str, exports: &PackageExports, key: &str) -> Option<String> {
        let (map, capture) = exports.lookup(key)?;
        map.resolve(&self.profile.conditions, capture.as_deref(), &mut |target| {
            self.accept_package_file(package_dir, target)
        })
    }

    /// A target is usable only if it stays inside the package and names a
    /// file. Directories are rejected so resolution falls through.
    fn accept_package_file(&self, package_dir: &str, target: &str) -> Option<String> {
        let candidate = path::join(&[package_dir, target]);
        (path::is_within(&candidate, package_dir) && self.fs.is_file(&candidate)).then_some(candidate)
    }

    /// `#name` through the `imports` field of the nearest package.json
    fn resolve_import(&self, specifier: &str, from_dir: &str) -> Option<String> {
        let package_dir = self
            .lookup_dirs(from_dir)
            .find(|dir| self.fs.is_file(&path::join(&[*dir, "package.json"])))?
            .to_string();
        let manifest = self
            .manifests
            .load(&self.fs, &path::join(&[package_dir.as_str(), "package.json"]))?;

        let (map, capture) = exports::lookup_keyed(&manifest.imports, specifier)?;
        map.resolve(&self.profile.conditions, capture.as_deref(), &mut |target| {
            if target.starts_with("./") || target.starts_with("../") {
                self.accept_package_file(&package_dir, target)
            } else {
                // imports may map to another package
                self.resolve_bare(target, &package_dir)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MkdirOptions;

    fn install(fs: &VirtualFs, package_dir: &str, manifest: &str, files: &[&str]) {
        fs.mkdir(package_dir, MkdirOptions::recursive()).unwrap();
        fs.write_file(&format!("{}/package.json", package_dir), manifest)
            .unwrap();
        for file in files {
            let full = format!("{}/{}", package_dir, file);
            fs.mkdir(path::dirname(&full), MkdirOptions::recursive()).unwrap();
            fs.write_file(&full, "module.exports = {};").unwrap();
        }
    }

    fn resolver(fs: &VirtualFs, profile: ResolverProfile) -> ModuleResolver {
        ModuleResolver::new(fs.clone(), profile)
    }

    #[test]
    fn test_split_specifier() {
        assert_eq!(split_specifier("react"), Some(("react", None)));
        assert_eq!(split_specifier("react/jsx-runtime"), Some(("react", Some("jsx-runtime"))));
        assert_eq!(split_specifier("@scope/pkg"), Some(("@scope/pkg", None)));
        assert_eq!(
            split_specifier("@scope/pkg/deep/file.js"),
            Some(("@scope/pkg", Some("deep/file.js")))
        );
        assert_eq!(split_specifier("@scope"), None);
        assert_eq!(split_specifier(""), None);
    }

    #[test]
    fn test_profiles_disagree_on_require_import() {
        for manifest in [
            r#"{"exports": {"require": "./a.js", "import": "./b.js"}}"#,
            r#"{"exports": {"import": "./b.js", "require": "./a.js"}}"#,
        ] {
            let fs = VirtualFs::new();
            install(&fs, "/app/node_modules/dual", manifest, &["a.js", "b.js"]);

            let dynamic = resolver(&fs, ResolverProfile::dynamic());
            assert_eq!(
                dynamic.resolve("dual", "/app").as_deref(),
                Some("/app/node_modules/dual/a.js")
            );
            let declarative = resolver(&fs, ResolverProfile::declarative());
            assert_eq!(
                declarative.resolve("dual", "/app").as_deref(),
                Some("/app/node_modules/dual/b.js")
            );
        }
    }

    #[test]
    fn test_custom_condition_needs_recognition() {
        let fs = VirtualFs::new();
        install(
            &fs,
            "/node_modules/pkg",
            r#"{"exports": {"custom": {"import": "./c.js"}, "default": "./d.js"}}"#,
            &["c.js", "d.js"],
        );

        let plain = resolver(
            &fs,
            ResolverProfile::declarative().with_conditions(["import", "default"]),
        );
        assert_eq!(plain.resolve("pkg", "/").as_deref(), Some("/node_modules/pkg/d.js"));

        let custom = resolver(
            &fs,
            ResolverProfile::declarative().with_conditions(["custom", "import", "default"]),
        );
        assert_eq!(custom.resolve("pkg", "/").as_deref(), Some("/node_modules/pkg/c.js"));
    }

    #[test]
    fn test_directory_target_is_rejected() {
        let fs = VirtualFs::new();
        install(
            &fs,
            "/node_modules/dirpkg",
            r#"{"exports": {".": {"import": "./dist", "default": "./main.js"}}, "main": "./fallback.js"}"#,
            &["dist/index.js", "main.js", "fallback.js"],
        );
        let resolved = resolver(&fs, ResolverProfile::declarative()).resolve("dirpkg", "/");
        assert_eq!(resolved.as_deref(), Some("/node_modules/dirpkg/main.js"));

        let fs = VirtualFs::new();
        install(
            &fs,
            "/node_modules/onlydir",
            r#"{"exports": "./dist", "main": "./lib/entry.js"}"#,
            &["dist/index.js", "lib/entry.js"],
        );
        let resolved = resolver(&fs, ResolverProfile::dynamic()).resolve("onlydir", "/");
        assert_eq!(resolved.as_deref(), Some("/node_modules/onlydir/lib/entry.js"));
    }

    #[test]
    fn test_main_entry_fallbacks() {
        let fs = VirtualFs::new();
        install(&fs, "/node_modules/modfirst", r#"{"module": "esm.js", "main": "cjs.js"}"#, &["esm.js", "cjs.js"]);
        install(&fs, "/node_modules/mainonly", r#"{"main": "lib/main"}"#, &["lib/main.js"]);
        install(&fs, "/node_modules/bare", r#"{}"#, &["index.js"]);
        let resolver = resolver(&fs, ResolverProfile::dynamic());

        assert_eq!(resolver.resolve("modfirst", "/").as_deref(), Some("/node_modules/modfirst/esm.js"));
        assert_eq!(resolver.resolve("mainonly", "/").as_deref(), Some("/node_modules/mainonly/lib/main.js"));
        assert_eq!(resolver.resolve("bare", "/").as_deref(), Some("/node_modules/bare/index.js"));
    }

    #[test]
    fn test_missing_manifest_is_unresolved() {
        let fs = VirtualFs::new();
        fs.mkdir("/node_modules/ghost", MkdirOptions::recursive()).unwrap();
        fs.write_file("/node_modules/ghost/index.js", "").unwrap();
        assert_eq!(resolver(&fs, ResolverProfile::dynamic()).resolve("ghost", "/"), None);
        assert_eq!(resolver(&fs, ResolverProfile::dynamic()).resolve("absent", "/"), None);
    }

    #[test]
    fn test_walks_up_and_prefers_nearest() {
        let fs = VirtualFs::new();
        install(&fs, "/app/node_modules/lib", r#"{"main": "outer.js"}"#, &["outer.js"]);
        install(&fs, "/app/packages/ui/node_modules/lib", r#"{"main": "inner.js"}"#, &["inner.js"]);
        let resolver = resolver(&fs, ResolverProfile::declarative());

        assert_eq!(
            resolver.resolve("lib", "/app/packages/ui/src").as_deref(),
            Some("/app/packages/ui/node_modules/lib/inner.js")
        );
        assert_eq!(
            resolver.resolve("lib", "/app/src/deep/er").as_deref(),
            Some("/app/node_modules/lib/outer.js")
        );
    }

    #[test]
    fn test_subpaths_patterns_and_exclusions() {
        let fs = VirtualFs::new();
        install(
            &fs,
            "/node_modules/@ui/kit",
            r#"{
                "exports": {
                    ".": "./index.js",
                    "./button": {"import": "./esm/button.js", "require": "./cjs/button.js"},
                    "./icons/*": "./assets/icons/*.js",
                    "./internal/*": null
                }
            }"#,
            &["index.js", "esm/button.js", "cjs/button.js", "assets/icons/star.js", "internal/x.js", "raw/file.js"],
        );
        let declarative = resolver(&fs, ResolverProfile::declarative());
        assert_eq!(declarative.resolve("@ui/kit/button", "/").as_deref(), Some("/node_modules/@ui/kit/esm/button.js"));
        assert_eq!(
            declarative.resolve("@ui/kit/icons/star", "/").as_deref(),
            Some("/node_modules/@ui/kit/assets/icons/star.js")
        );
        let dynamic = resolver(&fs, ResolverProfile::dynamic());
        assert_eq!(dynamic.resolve("@ui/kit/button", "/").as_deref(), Some("/node_modules/@ui/kit/cjs/button.js"));

        // excluded by exports, reached through the direct path fallback
        assert_eq!(
            declarative.resolve("@ui/kit/internal/x", "/").as_deref(),
            Some("/node_modules/@ui/kit/internal/x.js")
        );
        assert_eq!(declarative.resolve("@ui/kit/raw/file", "/").as_deref(), Some("/node_modules/@ui/kit/raw/file.js"));
    }

    #[test]
    fn test_relative_and_absolute_specifiers() {
        let fs = VirtualFs::new();
        fs.mkdir("/src/components", MkdirOptions::recursive()).unwrap();
        fs.write_file("/src/app.tsx", "").unwrap();
        fs.write_file("/src/components/index.js", "").unwrap();
        let resolver = resolver(&fs, ResolverProfile::declarative());

        assert_eq!(resolver.resolve("./app", "/src").as_deref(), Some("/src/app.tsx"));
        assert_eq!(resolver.resolve("./components", "/src").as_deref(), Some("/src/components/index.js"));
        assert_eq!(resolver.resolve("../app", "/src/components").as_deref(), Some("/src/app.tsx"));
        assert_eq!(resolver.resolve("/src/app.tsx", "/elsewhere").as_deref(), Some("/src/app.tsx"));
        assert_eq!(resolver.resolve("./nope", "/src"), None);
    }

    #[test]
    fn test_imports_field() {
        let fs = VirtualFs::new();
        install(
            &fs,
            "/app",
            r##"{"imports": {"#utils/*": "./src/utils/*.js", "#dep": "lib"}}"##,
            &["src/utils/format.js"],
        );
        install(&fs, "/app/node_modules/lib", r#"{"main": "main.js"}"#, &["main.js"]);
        let resolver = resolver(&fs, ResolverProfile::declarative());

        assert_eq!(resolver.resolve("#utils/format", "/app/src").as_deref(), Some("/app/src/utils/format.js"));
        assert_eq!(resolver.resolve("#dep", "/app/src").as_deref(), Some("/app/node_modules/lib/main.js"));
        assert_eq!(resolver.resolve("#missing", "/app/src"), None);
    }

    #[test]
    fn test_clear_cache_picks_up_new_manifest() {
        let fs = VirtualFs::new();
        install(&fs, "/node_modules/p", r#"{"main": "one.js"}"#, &["one.js", "two.js"]);
        let resolver = resolver(&fs, ResolverProfile::dynamic());
        assert_eq!(resolver.resolve("p", "/").as_deref(), Some("/node_modules/p/one.js"));

        fs.write_file("/node_modules/p/package.json", r#"{"main": "two.js"}"#).unwrap();
        assert_eq!(resolver.resolve("p", "/").as_deref(), Some("/node_modules/p/one.js"));
        resolver.clear_cache();
        assert_eq!(resolver.resolve("p", "/").as_deref(), Some("/node_modules/p/two.js"));
    }
}
