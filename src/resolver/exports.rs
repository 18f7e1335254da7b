//! Parsed package.json `exports` / `imports` values
//!
//! An export value is a string target, a condition object whose values are
//! export values again, a fallback array, or `null` (the subpath is
//! deliberately hidden). Condition objects are walked in the resolver
//! profile's priority order, not in key order, and a branch that yields no
//! acceptable file falls through to the next condition.

use serde_json::Value;

/// Condition that is never followed; it points at type declarations
pub const TYPES_CONDITION: &str = "types";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportMap {
    /// A path relative to the package root, possibly containing `*`
    Target(String),
    /// Condition name -> nested value, in manifest order
    Conditions(Vec<(String, ExportMap)>),
    /// Alternatives tried in order
    Fallbacks(Vec<ExportMap>),
    /// `null`: nothing is exported here
    Excluded,
}

impl ExportMap {
    pub fn parse(value: &Value) -> Self {
        match value {
            Value::String(target) => ExportMap::Target(target.clone()),
            Value::Array(items) => ExportMap::Fallbacks(items.iter().map(ExportMap::parse).collect()),
            Value::Object(map) => ExportMap::Conditions(
                map.iter()
                    .map(|(condition, nested)| (condition.clone(), ExportMap::parse(nested)))
                    .collect(),
            ),
            _ => ExportMap::Excluded,
        }
    }

    /// Walk the value depth-first using `conditions` as the priority list.
    ///
    /// `capture` replaces `*` in targets matched through a pattern key.
    /// `accept` turns a target into a resolved path, or rejects it (missing
    /// file, directory) so resolution falls through to the next branch.
    pub fn resolve(
        &self,
        conditions: &[String],
        capture: Option<&str>,
        accept: &mut dyn FnMut(&str) -> Option<String>,
    ) -> Option<String> {
        match self {
            ExportMap::Target(target) => match capture {
                Some(capture) => accept(&target.replace('*', capture)),
                None => accept(target),
            },
            ExportMap::Conditions(branches) => {
                for condition in conditions {
                    if condition == TYPES_CONDITION {
                        continue;
                    }
                    let Some((_, nested)) = branches.iter().find(|(name, _)| name == condition)
                    else {
                        continue;
                    };
                    if let Some(resolved) = nested.resolve(conditions, capture, accept) {
                        return Some(resolved);
                    }
                }
                None
            }
            ExportMap::Fallbacks(alternatives) => alternatives
                .iter()
                .find_map(|alternative| alternative.resolve(conditions, capture, accept)),
            ExportMap::Excluded => None,
        }
    }
}

/// The top-level `exports` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageExports {
    /// Keys are subpaths (`"."`, `"./feature"`, `"./utils/*"`)
    Subpaths(Vec<(String, ExportMap)>),
    /// The whole field describes the main entry
    Root(ExportMap),
}

impl PackageExports {
    pub fn parse(value: &Value) -> Self {
        match value {
            Value::Object(map) if map.keys().any(|key| key.starts_with('.')) => {
                PackageExports::Subpaths(parse_keyed(value))
            }
            other => PackageExports::Root(ExportMap::parse(other)),
        }
    }

    pub fn is_subpath_keyed(&self) -> bool {
        matches!(self, PackageExports::Subpaths(_))
    }

    /// The value for `key` (`"."` or `"./sub"`) plus the pattern capture
    pub fn lookup(&self, key: &str) -> Option<(&ExportMap, Option<String>)> {
        match self {
            PackageExports::Subpaths(entries) => lookup_keyed(entries, key),
            PackageExports::Root(map) if key == "." => Some((map, None)),
            PackageExports::Root(_) => None,
        }
    }
}

/// Parse an object keyed by subpath or `#` import name
pub fn parse_keyed(value: &Value) -> Vec<(String, ExportMap)> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(key, nested)| (key.clone(), ExportMap::parse(nested)))
            .collect(),
        _ => Vec::new(),
    }
}

/// Exact key first, then the most specific `*` pattern key
pub fn lookup_keyed<'a>(
    entries: &'a [(String, ExportMap)],
    key: &str,
) -> Option<(&'a ExportMap, Option<String>)> {
    if let Some((_, map)) = entries.iter().find(|(candidate, _)| candidate == key) {
        return Some((map, None));
    }

    entries
        .iter()
        .filter_map(|(pattern, map)| {
            match_pattern(pattern, key).map(|capture| (pattern.len(), map, capture))
        })
        .max_by_key(|(specificity, _, _)| *specificity)
        .map(|(_, map, capture)| (map, Some(capture)))
}

/// Match a single-`*` pattern key, returning the text the star covers
pub fn match_pattern(pattern: &str, key: &str) -> Option<String> {
    let star = pattern.find('*')?;
    let (prefix, suffix) = (&pattern[..star], &pattern[star + 1..]);
    if key.len() < prefix.len() + suffix.len() || !key.starts_with(prefix) || !key.ends_with(suffix)
    {
        return None;
    }
    let capture = &key[prefix.len()..key.len() - suffix.len()];
    (!capture.is_empty()).then(|| capture.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conditions(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn resolve_any(map: &ExportMap, names: &[&str]) -> Option<String> {
        map.resolve(&conditions(names), None, &mut |target| Some(target.to_string()))
    }

    #[test]
    fn test_priority_order_not_key_order() {
        for value in [
            json!({"require": "./a.js", "import": "./b.js"}),
            json!({"import": "./b.js", "require": "./a.js"}),
        ] {
            let map = ExportMap::parse(&value);
            assert_eq!(resolve_any(&map, &["require", "import"]).as_deref(), Some("./a.js"));
            assert_eq!(resolve_any(&map, &["import", "require"]).as_deref(), Some("./b.js"));
        }
    }

    #[test]
    fn test_nested_custom_condition() {
        let map = ExportMap::parse(&json!({
            "custom": {"import": "./c.js"},
            "default": "./d.js"
        }));
        assert_eq!(resolve_any(&map, &["import", "default"]).as_deref(), Some("./d.js"));
        assert_eq!(
            resolve_any(&map, &["custom", "import", "default"]).as_deref(),
            Some("./c.js")
        );
        assert_eq!(
            resolve_any(&map, &["import", "default", "custom"]).as_deref(),
            Some("./d.js")
        );
    }

    #[test]
    fn test_rejected_branch_falls_through() {
        let map = ExportMap::parse(&json!({
            "types": "./index.d.ts",
            "import": "./dist",
            "default": ["./missing.js", "./ok.js"]
        }));
        let mut accept = |target: &str| (target == "./ok.js").then(|| target.to_string());
        let names = conditions(&["types", "import", "default"]);
        assert_eq!(map.resolve(&names, None, &mut accept).as_deref(), Some("./ok.js"));
    }

    #[test]
    fn test_types_condition_is_skipped() {
        let map = ExportMap::parse(&json!({"types": "./index.d.ts"}));
        assert_eq!(resolve_any(&map, &["types", "default"]), None);
    }

    #[test]
    fn test_excluded_and_non_string_values() {
        assert_eq!(ExportMap::parse(&Value::Null), ExportMap::Excluded);
        assert_eq!(ExportMap::parse(&json!(true)), ExportMap::Excluded);
        assert_eq!(resolve_any(&ExportMap::Excluded, &["default"]), None);
    }

    #[test]
    fn test_subpath_keyed_detection() {
        assert!(PackageExports::parse(&json!({".": "./index.js"})).is_subpath_keyed());
        assert!(!PackageExports::parse(&json!({"import": "./index.js"})).is_subpath_keyed());
        assert!(!PackageExports::parse(&json!("./index.js")).is_subpath_keyed());

        let root = PackageExports::parse(&json!("./index.js"));
        assert!(root.lookup(".").is_some());
        assert!(root.lookup("./other").is_none());
    }

    #[test]
    fn test_pattern_lookup_prefers_specific_key() {
        let exports = PackageExports::parse(&json!({
            ".": "./index.js",
            "./*": "./dist/*.js",
            "./features/*": "./src/features/*.js",
            "./features/private/*": null
        }));

        let (map, capture) = exports.lookup("./features/button").unwrap();
        assert_eq!(capture.as_deref(), Some("button"));
        let resolved = map.resolve(&[], capture.as_deref(), &mut |t| Some(t.to_string()));
        assert_eq!(resolved.as_deref(), Some("./src/features/button.js"));

        let (map, _) = exports.lookup("./features/private/x").unwrap();
        assert_eq!(*map, ExportMap::Excluded);

        let (map, capture) = exports.lookup(".").unwrap();
        assert_eq!(*map, ExportMap::Target("./index.js".into()));
        assert!(capture.is_none());
    }

    #[test]
    fn test_match_pattern() {
        assert_eq!(match_pattern("./*.js", "./a/b.js").as_deref(), Some("a/b"));
        assert_eq!(match_pattern("./lib/*", "./lib/"), None);
        assert_eq!(match_pattern("./a*a", "./a"), None);
        assert_eq!(match_pattern("./exact", "./exact"), None);
    }
}
