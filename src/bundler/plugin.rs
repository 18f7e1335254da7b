//! Resolve/load plugin serving modules from the virtual filesystem

use super::{
    BundlerPlugin, LoadArgs, LoadOutcome, Loader, Message, ResolveArgs, ResolveOutcome,
    ResolvedModule,
};
use crate::fs::{VirtualFs, path};
use crate::resolver::{ModuleResolver, split_specifier};
use tracing::trace;

pub const VFS_NAMESPACE: &str = "vfs";
pub const STUB_NAMESPACE: &str = "node-stub";

/// Appended to `.mjs`/`.cjs` paths so the bundler does not sniff the format
/// from the extension
pub const ALIAS_SUFFIX: &str = ".js";

/// Contents of every stubbed Node built-in
pub const STUB_CONTENTS: &str = "module.exports = {};";

/// Node built-ins that resolve to an empty module instead of failing
pub const NODE_BUILTINS: &[&str] = &[
    "assert",
    "async_hooks",
    "buffer",
    "child_process",
    "cluster",
    "crypto",
    "dgram",
    "dns",
    "events",
    "fs",
    "fs/promises",
    "http",
    "http2",
    "https",
    "module",
    "net",
    "os",
    "path",
    "perf_hooks",
    "process",
    "querystring",
    "readline",
    "stream",
    "string_decoder",
    "timers",
    "tls",
    "tty",
    "url",
    "util",
    "v8",
    "vm",
    "worker_threads",
    "zlib",
];

pub fn is_node_builtin(specifier: &str) -> bool {
    let name = specifier.strip_prefix("node:").unwrap_or(specifier);
    NODE_BUILTINS.contains(&name)
}

fn needs_alias(file: &str) -> bool {
    matches!(path::extname(file), ".mjs" | ".cjs")
}

pub struct LoaderPlugin {
    fs: VirtualFs,
    resolver: ModuleResolver,
    external: Vec<String>,
}

impl LoaderPlugin {
    pub fn new(fs: VirtualFs, resolver: ModuleResolver) -> Self {
        Self {
            fs,
            resolver,
            external: Vec::new(),
        }
    }

    /// Bare specifiers that always stay external
    pub fn with_external(mut self, external: Vec<String>) -> Self {
        self.external = external;
        self
    }

    fn is_external(&self, specifier: &str) -> bool {
        self.external.iter().any(|name| name == specifier)
    }

    fn resolved(&self, file: String) -> ResolveOutcome {
        let module = if needs_alias(&file) {
            ResolvedModule {
                path: format!("{}{}", file, ALIAS_SUFFIX),
                from_virtual_store: true,
                real_path: Some(file),
            }
        } else {
            ResolvedModule {
                path: file,
                from_virtual_store: true,
                real_path: None,
            }
        };
        ResolveOutcome::Resolved {
            path: module.path.clone(),
            namespace: VFS_NAMESPACE.to_string(),
            plugin_data: Some(module),
        }
    }

    fn base_dir(args: &ResolveArgs) -> String {
        if !args.resolve_dir.is_empty() {
            args.resolve_dir.clone()
        } else if !args.importer.is_empty() {
            path::dirname(&args.importer).to_string()
        } else {
            "/".to_string()
        }
    }
}

impl BundlerPlugin for LoaderPlugin {
    fn name(&self) -> &str {
        "tabnode-vfs"
    }

    fn on_resolve(&self, args: &ResolveArgs) -> ResolveOutcome {
        let specifier = args.path.as_str();

        if specifier.starts_with("node:") {
            return ResolveOutcome::Resolved {
                path: specifier.to_string(),
                namespace: STUB_NAMESPACE.to_string(),
                plugin_data: None,
            };
        }

        if path::is_absolute(specifier) || specifier.starts_with('.') {
            let target = path::resolve(&Self::base_dir(args), specifier);
            return match self.resolver.resolve_file_or_dir(&target) {
                Some(file) => self.resolved(file),
                None => ResolveOutcome::Pass,
            };
        }

        if self.is_external(specifier) {
            return ResolveOutcome::External {
                path: specifier.to_string(),
            };
        }

        if let Some(file) = self.resolver.resolve(specifier, &Self::base_dir(args)) {
            return self.resolved(file);
        }

        let package = split_specifier(specifier).map(|(name, _)| name);
        if is_node_builtin(specifier) || package.is_some_and(is_node_builtin) {
            trace!(specifier, "stubbing node built-in");
            return ResolveOutcome::Resolved {
                path: specifier.to_string(),
                namespace: STUB_NAMESPACE.to_string(),
                plugin_data: None,
            };
        }

        trace!(specifier, "unresolved bare specifier left external");
        ResolveOutcome::External {
            path: specifier.to_string(),
        }
    }

    fn on_load(&self, args: &LoadArgs) -> LoadOutcome {
        match args.namespace.as_str() {
            STUB_NAMESPACE => LoadOutcome::Loaded {
                contents: STUB_CONTENTS.to_string(),
                loader: Loader::Js,
                resolve_dir: None,
            },
            VFS_NAMESPACE => {
                let source = args
                    .plugin_data
                    .as_ref()
                    .map(|module| module.source_path().to_string())
                    .unwrap_or_else(|| args.path.clone());
                match self.fs.read_to_string(&source) {
                    Ok(contents) => LoadOutcome::Loaded {
                        contents,
                        loader: Loader::from_path(&source),
                        resolve_dir: Some(path::dirname(&source).to_string()),
                    },
                    Err(err) => LoadOutcome::Failed(vec![Message::new(err.to_string()).in_file(source)]),
                }
            }
            _ => LoadOutcome::Pass,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::ImportKind;
    use crate::fs::MkdirOptions;
    use crate::resolver::ResolverProfile;

    fn plugin() -> (VirtualFs, LoaderPlugin) {
        let fs = VirtualFs::new();
        fs.mkdir("/app/src/lib", MkdirOptions::recursive()).unwrap();
        fs.mkdir("/app/node_modules/esm-only", MkdirOptions::recursive())
            .unwrap();
        fs.write_file("/app/src/main.js", "import './lib';").unwrap();
        fs.write_file("/app/src/lib/index.js", "export const x = 1;").unwrap();
        fs.write_file("/app/src/helper.mjs", "export default 1;").unwrap();
        fs.write_file(
            "/app/node_modules/esm-only/package.json",
            r#"{"exports": {"import": "./index.mjs"}}"#,
        )
        .unwrap();
        fs.write_file("/app/node_modules/esm-only/index.mjs", "export const y = 2;")
            .unwrap();

        let resolver = ModuleResolver::new(fs.clone(), ResolverProfile::declarative());
        let plugin = LoaderPlugin::new(fs.clone(), resolver).with_external(vec!["react".into()]);
        (fs, plugin)
    }

    fn args(specifier: &str, resolve_dir: &str) -> ResolveArgs {
        ResolveArgs {
            path: specifier.to_string(),
            importer: String::new(),
            resolve_dir: resolve_dir.to_string(),
            namespace: VFS_NAMESPACE.to_string(),
            kind: ImportKind::ImportStatement,
        }
    }

    #[test]
    fn test_relative_with_index_fallback() {
        let (_, plugin) = plugin();
        let outcome = plugin.on_resolve(&args("./lib", "/app/src"));
        let ResolveOutcome::Resolved { path, namespace, .. } = outcome else {
            panic!("expected resolution, got {:?}", outcome);
        };
        assert_eq!(path, "/app/src/lib/index.js");
        assert_eq!(namespace, VFS_NAMESPACE);
    }

    #[test]
    fn test_importer_used_when_resolve_dir_missing() {
        let (_, plugin) = plugin();
        let mut resolve_args = args("./lib/index.js", "");
        resolve_args.importer = "/app/src/main.js".into();
        assert!(matches!(
            plugin.on_resolve(&resolve_args),
            ResolveOutcome::Resolved { ref path, .. } if path == "/app/src/lib/index.js"
        ));
        assert_eq!(plugin.on_resolve(&args("./missing", "/app/src")), ResolveOutcome::Pass);
    }

    #[test]
    fn test_format_ambiguous_extension_is_aliased() {
        let (_, plugin) = plugin();
        let outcome = plugin.on_resolve(&args("esm-only", "/app/src"));
        let ResolveOutcome::Resolved { path, plugin_data, namespace } = outcome else {
            panic!("expected resolution");
        };
        assert_eq!(path, "/app/node_modules/esm-only/index.mjs.js");

        let loaded = plugin.on_load(&LoadArgs {
            path,
            namespace,
            plugin_data,
        });
        assert_eq!(
            loaded,
            LoadOutcome::Loaded {
                contents: "export const y = 2;".into(),
                loader: Loader::Js,
                resolve_dir: Some("/app/node_modules/esm-only".into()),
            }
        );
    }

    #[test]
    fn test_builtins_externals_and_unknown() {
        let (_, plugin) = plugin();
        for builtin in ["fs", "node:path", "fs/promises"] {
            assert!(matches!(
                plugin.on_resolve(&args(builtin, "/app")),
                ResolveOutcome::Resolved { ref namespace, .. } if namespace == STUB_NAMESPACE
            ));
        }
        assert_eq!(
            plugin.on_resolve(&args("react", "/app")),
            ResolveOutcome::External { path: "react".into() }
        );
        assert_eq!(
            plugin.on_resolve(&args("not-installed", "/app")),
            ResolveOutcome::External { path: "not-installed".into() }
        );

        let stub = plugin.on_load(&LoadArgs {
            path: "fs".into(),
            namespace: STUB_NAMESPACE.into(),
            plugin_data: None,
        });
        assert!(matches!(stub, LoadOutcome::Loaded { ref contents, .. } if contents == STUB_CONTENTS));
    }

    #[test]
    fn test_load_failure_carries_fs_error() {
        let (fs, plugin) = plugin();
        fs.unlink("/app/src/helper.mjs").unwrap();
        let outcome = plugin.on_load(&LoadArgs {
            path: "/app/src/helper.mjs.js".into(),
            namespace: VFS_NAMESPACE.into(),
            plugin_data: Some(ResolvedModule {
                path: "/app/src/helper.mjs.js".into(),
                from_virtual_store: true,
                real_path: Some("/app/src/helper.mjs".into()),
            }),
        });
        let LoadOutcome::Failed(messages) = outcome else {
            panic!("expected failure");
        };
        assert!(messages[0].text.starts_with("ENOENT"));
        assert_eq!(messages[0].file.as_deref(), Some("/app/src/helper.mjs"));
    }
}
