//! POSIX path helpers for the virtual filesystem
//!
//! The virtual filesystem is POSIX-only regardless of the host platform, so
//! paths are plain `/`-separated strings rather than `std::path::Path`.

/// Normalize a path - resolves `.` and `..` segments and repeated slashes
pub fn normalize(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let is_absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::with_capacity(path.matches('/').count() + 1);

    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                if !parts.is_empty() && parts.last() != Some(&"..") {
                    parts.pop();
                } else if !is_absolute {
                    parts.push("..");
                }
            }
            _ => parts.push(part),
        }
    }

    let joined = parts.join("/");
    match (is_absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Join segments; an absolute segment resets everything before it
pub fn join(segments: &[&str]) -> String {
    let mut joined = String::new();
    for segment in segments.iter().filter(|s| !s.is_empty()) {
        if segment.starts_with('/') {
            joined.clear();
        } else if !joined.is_empty() && !joined.ends_with('/') {
            joined.push('/');
        }
        joined.push_str(segment);
    }
    normalize(&joined)
}

/// Resolve `path` against `base` into an absolute, normalized path
pub fn resolve(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        return normalize(path);
    }
    let base = if base.starts_with('/') { base } else { "/" };
    normalize(&format!("{}/{}", base, path))
}

/// Directory part of a path (`/a/b` -> `/a`, `/a` -> `/`)
pub fn dirname(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        return "/";
    }
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// Last segment of a path
pub fn basename(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Extension including the dot; empty for dotfiles and extensionless names
pub fn extname(path: &str) -> &str {
    let base = basename(path);
    match base.rfind('.') {
        Some(idx) if idx > 0 => &base[idx..],
        _ => "",
    }
}

pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Segments of a normalized absolute path, root yields none
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Whether `path` equals `ancestor` or lies underneath it
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// Path of `path` relative to `ancestor`, assuming [`is_within`]
pub fn strip_ancestor<'a>(path: &'a str, ancestor: &str) -> &'a str {
    if ancestor == "/" {
        return path.trim_start_matches('/');
    }
    path.strip_prefix(ancestor)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/foo/bar//baz/asdf/quux/.."), "/foo/bar/baz/asdf");
        assert_eq!(normalize("foo/bar/../baz"), "foo/baz");
        assert_eq!(normalize("./foo/bar"), "foo/bar");
        assert_eq!(normalize(""), ".");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("/.."), "/");
        assert_eq!(normalize("../.."), "../..");
        assert_eq!(normalize("/a/b/"), "/a/b");
    }

    #[test]
    fn test_join_and_resolve() {
        assert_eq!(join(&["/foo", "bar", "baz/asdf", "quux", ".."]), "/foo/bar/baz/asdf");
        assert_eq!(join(&["foo", "/abs", "x"]), "/abs/x");
        assert_eq!(resolve("/home/user", "../etc"), "/home/etc");
        assert_eq!(resolve("/home/user", "/tmp/./x"), "/tmp/x");
        assert_eq!(resolve("relative", "x"), "/x");
    }

    #[test]
    fn test_dirname_basename_extname() {
        assert_eq!(dirname("/foo/bar/baz"), "/foo/bar");
        assert_eq!(dirname("/foo"), "/");
        assert_eq!(dirname("/"), "/");
        assert_eq!(basename("/foo/bar.js"), "bar.js");
        assert_eq!(basename("/"), "");
        assert_eq!(extname("/a/index.coffee.md"), ".md");
        assert_eq!(extname("/a/.npmrc"), "");
        assert_eq!(extname("/a/Makefile"), "");
    }

    #[test]
    fn test_within() {
        assert!(is_within("/a/b", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(!is_within("/ab", "/a"));
        assert!(is_within("/anything", "/"));
        assert_eq!(strip_ancestor("/a/b/c", "/a"), "b/c");
        assert_eq!(strip_ancestor("/a/b", "/"), "a/b");
    }
}
