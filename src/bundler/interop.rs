//! CommonJS -> ESM interop rewrites for package bundles
//!
//! Each rewrite scans the input once, builds a table of what to change and
//! renders a new string. The input is never edited in place.

use indexmap::{IndexMap, IndexSet};
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// `__export(target, { name: () => name, ... })` emitted by the bundler
/// for ESM sources converted to CommonJS
static EXPORT_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__export\(\s*[\w$]+\s*,\s*\{([^}]*)\}\s*\)").expect("valid regex")
});

static EXPORT_GETTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"["']?([A-Za-z_$][\w$]*)["']?\s*:\s*\(\)\s*=>"#).expect("valid regex")
});

static EXPORTS_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:module\.)?exports\.([A-Za-z_$][\w$]*)\s*=[^=]").expect("valid regex")
});

static DEFINE_PROPERTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"Object\.defineProperty\(\s*exports\s*,\s*["']([A-Za-z_$][\w$]*)["']"#)
        .expect("valid regex")
});

static EXTERNAL_REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"__require\(\s*["']([^"'./][^"']*)["']\s*\)"#).expect("valid regex")
});

static DEFAULT_WRAPPER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^export default (require_[\w$]+)\(\);?[ \t]*$").expect("valid regex")
});

const IGNORED_EXPORTS: &[&str] = &["default", "__esModule"];

/// Binding that holds the CommonJS module object in rewritten output
pub const MODULE_BINDING: &str = "__cjs_module";

/// Named exports of a CommonJS entry, in first-seen order.
///
/// The bundler's own registration idiom is authoritative; assignment scans
/// are only used when it is absent.
pub fn recover_export_names(source: &str) -> Vec<String> {
    let mut names: IndexSet<String> = IndexSet::new();

    for call in EXPORT_CALL.captures_iter(source) {
        for getter in EXPORT_GETTER.captures_iter(&call[1]) {
            names.insert(getter[1].to_string());
        }
    }

    if names.is_empty() {
        let assigned = EXPORTS_ASSIGNMENT
            .captures_iter(source)
            .chain(DEFINE_PROPERTY.captures_iter(source));
        for capture in assigned {
            names.insert(capture[1].to_string());
        }
    }

    names
        .into_iter()
        .filter(|name| !IGNORED_EXPORTS.contains(&name.as_str()))
        .collect()
}

/// Replace `__require("dep")` on bare specifiers with a namespace import.
///
/// Real ESM output throws on a bare `__require` call, so every distinct
/// dependency gets one top-level `import * as __external_N` and each call is
/// replaced by that identifier.
pub fn rewrite_external_requires(code: &str) -> String {
    let mut table: IndexMap<String, String> = IndexMap::new();
    for capture in EXTERNAL_REQUIRE.captures_iter(code) {
        let next = table.len();
        table
            .entry(capture[1].to_string())
            .or_insert_with(|| format!("__external_{}", next));
    }
    if table.is_empty() {
        return code.to_string();
    }

    let body = EXTERNAL_REQUIRE.replace_all(code, |capture: &Captures| {
        table
            .get(&capture[1])
            .cloned()
            .unwrap_or_else(|| capture[0].to_string())
    });

    let mut output = String::with_capacity(code.len() + table.len() * 48);
    for (specifier, binding) in &table {
        output.push_str(&format!("import * as {} from {:?};\n", binding, specifier));
    }
    output.push_str(&body);
    output
}

/// Split the single `export default require_x();` into a binding, the
/// default export and one named export per recovered name.
///
/// Output without exactly one wrapper, or without names, is returned as is.
pub fn rewrite_default_export(code: &str, names: &[String]) -> String {
    if names.is_empty() {
        return code.to_string();
    }
    let mut wrappers = DEFAULT_WRAPPER.captures_iter(code);
    let (Some(wrapper), None) = (wrappers.next(), wrappers.next()) else {
        return code.to_string();
    };
    let (Some(whole), Some(factory)) = (wrapper.get(0), wrapper.get(1)) else {
        return code.to_string();
    };

    let mut replacement = format!(
        "var {module} = {factory}();\nexport default {module};\n",
        module = MODULE_BINDING,
        factory = factory.as_str()
    );
    for name in names {
        replacement.push_str(&format!(
            "var __export_{name} = {module}.{name};\nexport {{ __export_{name} as {name} }};\n",
            name = name,
            module = MODULE_BINDING
        ));
    }

    let mut output = String::with_capacity(code.len() + replacement.len());
    output.push_str(&code[..whole.start()]);
    output.push_str(replacement.trim_end());
    output.push_str(&code[whole.end()..]);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_recover_from_export_idiom() {
        let source = r#"
var src_exports = {};
__export(src_exports, {
  createStore: () => createStore,
  "applyMiddleware": () => applyMiddleware,
  default: () => src_default
});
module.exports = __toCommonJS(src_exports);
exports.ignored = 1;
"#;
        assert_eq!(recover_export_names(source), vec!["createStore", "applyMiddleware"]);
    }

    #[test]
    fn test_recover_from_assignments() {
        let source = r#"
"use strict";
Object.defineProperty(exports, "__esModule", { value: true });
exports.parse = parse;
exports.format = void 0;
module.exports.parse = parse;
if (exports.format == null) {}
Object.defineProperty(exports, "version", { get: function () { return v; } });
"#;
        assert_eq!(recover_export_names(source), vec!["parse", "format", "version"]);
    }

    #[test]
    fn test_recover_nothing() {
        assert!(recover_export_names("module.exports = function () {};").is_empty());
    }

    #[test]
    fn test_rewrite_external_requires() {
        let code = r#"var React = __require("react");
var jsx = __require("react/jsx-runtime");
var again = __require('react');
var local = __require("./local.js");"#;
        let expected = r#"import * as __external_0 from "react";
import * as __external_1 from "react/jsx-runtime";
var React = __external_0;
var jsx = __external_1;
var again = __external_0;
var local = __require("./local.js");"#;
        assert_eq!(rewrite_external_requires(code), expected);
        assert_eq!(rewrite_external_requires("var x = 1;"), "var x = 1;");
    }

    #[test]
    fn test_rewrite_default_export() {
        let code = "var require_lib = __commonJS({});\nexport default require_lib();\n";
        let names = vec!["foo".to_string(), "bar".to_string()];
        let expected = "var require_lib = __commonJS({});\n\
var __cjs_module = require_lib();\n\
export default __cjs_module;\n\
var __export_foo = __cjs_module.foo;\n\
export { __export_foo as foo };\n\
var __export_bar = __cjs_module.bar;\n\
export { __export_bar as bar };\n";
        assert_eq!(rewrite_default_export(code, &names), expected);
    }

    #[test]
    fn test_default_export_left_alone() {
        let names = vec!["a".to_string()];
        let none = "export default 42;\n";
        assert_eq!(rewrite_default_export(none, &names), none);

        let two = "export default require_a();\nexport default require_b();\n";
        assert_eq!(rewrite_default_export(two, &names), two);

        let code = "export default require_a();\n";
        assert_eq!(rewrite_default_export(code, &[]), code);
    }
}
