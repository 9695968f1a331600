//! Module specifier resolution
//!
//! Maps import specifiers to canonical module ids. Every specifier the
//! engine sees, the top-level entry as well as each nested static or
//! dynamic import, passes through [`resolve`], which admits only regular
//! files beneath the sandbox root after symlink resolution. The resolver is
//! stateless; callers memoize via the module map.

use std::path::{Path, PathBuf};
use thiserror::Error;

use path_clean::PathClean;

/// Errors produced during specifier resolution
///
/// The display strings lead with a stable kind token; callers and the wire
/// protocol match on it textually.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// Specifier carries a URL scheme; remote modules are never loaded
    #[error("RemoteImport: remote specifier '{0}' is not allowed")]
    RemoteImport(String),

    /// Resolved path escapes the sandbox root
    #[error("PathTraversal: '{0}' escapes the sandbox root")]
    PathTraversal(String),

    /// No regular module file at the resolved path
    #[error("NotFound: no module at '{0}'")]
    NotFound(String),
}

/// Result type for resolution
pub type ResolveResult<T> = Result<T, ResolveError>;

/// Extensions accepted as ES modules. No inference: the specifier must name
/// the file explicitly.
const MODULE_EXTENSIONS: [&str; 2] = ["js", "mjs"];

/// Resolve a specifier against its referrer and the sandbox root.
///
/// `referrer` is the canonical id of the importing module, or `None` for
/// the top-level entry (and for imports issued by the bootstrap script,
/// whose synthetic origin is not a filesystem path).
///
/// Rules, in order: remote schemes are rejected, relative specifiers join
/// the referrer's directory (all others the root), the lexical path is
/// cleaned and canonicalized, the canonical path must stay inside the
/// canonical root, and the target must be a regular `.js`/`.mjs` file.
pub fn resolve(specifier: &str, referrer: Option<&str>, root: &Path) -> ResolveResult<String> {
    if has_url_scheme(specifier) {
        return Err(ResolveError::RemoteImport(specifier.to_string()));
    }

    let joined = join_specifier(specifier, referrer, root);
    let lexical = joined.clean();

    // Lexical containment first: a `../../..` chain is a traversal whether
    // or not anything exists at the target.
    if !lexical.starts_with(root) {
        return Err(ResolveError::PathTraversal(specifier.to_string()));
    }

    let canonical = lexical
        .canonicalize()
        .map_err(|_| ResolveError::NotFound(specifier.to_string()))?;

    // Containment again on the real path, so symlinks inside the root
    // cannot point outside it.
    if !canonical.starts_with(root) {
        return Err(ResolveError::PathTraversal(specifier.to_string()));
    }

    if !canonical.is_file() || !has_module_extension(&canonical) {
        return Err(ResolveError::NotFound(specifier.to_string()));
    }

    Ok(canonical.to_string_lossy().to_string())
}

/// Join a specifier against its base directory without touching the
/// filesystem.
fn join_specifier(specifier: &str, referrer: Option<&str>, root: &Path) -> PathBuf {
    if specifier.starts_with("./") || specifier.starts_with("../") {
        let base = referrer
            .map(Path::new)
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        return base.join(specifier);
    }

    if Path::new(specifier).is_absolute() {
        return PathBuf::from(specifier);
    }

    root.join(specifier)
}

/// Whether the specifier's textual form carries a URL scheme.
///
/// A single letter before the colon is a Windows drive, not a scheme.
fn has_url_scheme(specifier: &str) -> bool {
    let bytes = specifier.as_bytes();
    if bytes.first().map_or(true, |b| !b.is_ascii_alphabetic()) {
        return false;
    }
    for (i, b) in bytes.iter().enumerate().skip(1) {
        match b {
            b':' => return i > 1,
            b if b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.') => continue,
            _ => return false,
        }
    }
    false
}

/// Whether the path carries an ES-module extension.
fn has_module_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| MODULE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Builds a chunk tree:
    /// root/entry.js, root/pages/about.js, root/notes.txt
    fn chunk_tree() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::write(root.join("entry.js"), "export default () => 'ok';").unwrap();
        fs::create_dir(root.join("pages")).unwrap();
        fs::write(root.join("pages/about.js"), "export const render = () => '';").unwrap();
        fs::write(root.join("notes.txt"), "not a module").unwrap();
        (dir, root)
    }

    #[test]
    fn test_resolve_bare_specifier_against_root() {
        let (_dir, root) = chunk_tree();
        let id = resolve("entry.js", None, &root).unwrap();
        assert_eq!(id, root.join("entry.js").to_string_lossy());
    }

    #[test]
    fn test_resolve_relative_against_referrer() {
        let (_dir, root) = chunk_tree();
        let referrer = root.join("pages/about.js");
        let id = resolve("../entry.js", Some(&referrer.to_string_lossy()), &root).unwrap();
        assert_eq!(id, root.join("entry.js").to_string_lossy());
    }

    #[test]
    fn test_resolve_relative_without_referrer_uses_root() {
        let (_dir, root) = chunk_tree();
        let id = resolve("./pages/about.js", None, &root).unwrap();
        assert_eq!(id, root.join("pages/about.js").to_string_lossy());
    }

    #[test]
    fn test_remote_schemes_rejected() {
        let (_dir, root) = chunk_tree();
        for specifier in [
            "https://x.example/y.js",
            "http://x.example/y.js",
            "file:///etc/passwd",
            "data:text/javascript,export default 1",
            "node:fs",
        ] {
            let result = resolve(specifier, None, &root);
            assert!(
                matches!(result, Err(ResolveError::RemoteImport(_))),
                "expected RemoteImport for {specifier}"
            );
        }
    }

    #[test]
    fn test_traversal_rejected() {
        let (_dir, root) = chunk_tree();
        let referrer = root.join("pages/about.js");
        let result = resolve(
            "../../../../etc/passwd",
            Some(&referrer.to_string_lossy()),
            &root,
        );
        assert!(matches!(result, Err(ResolveError::PathTraversal(_))));
    }

    #[test]
    fn test_absolute_path_outside_root_rejected() {
        let (_dir, root) = chunk_tree();
        let result = resolve("/etc/passwd", None, &root);
        assert!(matches!(result, Err(ResolveError::PathTraversal(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let (_dir, root) = chunk_tree();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("secret.js");
        fs::write(&target, "export default () => 'leak';").unwrap();
        std::os::unix::fs::symlink(&target, root.join("alias.js")).unwrap();

        let result = resolve("alias.js", None, &root);
        assert!(matches!(result, Err(ResolveError::PathTraversal(_))));
    }

    #[test]
    fn test_missing_module_not_found() {
        let (_dir, root) = chunk_tree();
        let result = resolve("missing.js", None, &root);
        assert!(matches!(result, Err(ResolveError::NotFound(_))));
    }

    #[test]
    fn test_non_module_extension_not_found() {
        let (_dir, root) = chunk_tree();
        let result = resolve("notes.txt", None, &root);
        assert!(matches!(result, Err(ResolveError::NotFound(_))));
    }

    #[test]
    fn test_directory_not_found() {
        let (_dir, root) = chunk_tree();
        let result = resolve("pages", None, &root);
        assert!(matches!(result, Err(ResolveError::NotFound(_))));
    }

    #[test]
    fn test_no_extension_inference() {
        let (_dir, root) = chunk_tree();
        let result = resolve("entry", None, &root);
        assert!(matches!(result, Err(ResolveError::NotFound(_))));
    }

    #[test]
    fn test_scheme_detection() {
        assert!(has_url_scheme("https://x/y.js"));
        assert!(has_url_scheme("node:fs"));
        assert!(has_url_scheme("data:text/plain,x"));
        assert!(!has_url_scheme("./entry.js"));
        assert!(!has_url_scheme("entry.js"));
        assert!(!has_url_scheme("C:/chunks/entry.js"));
        assert!(!has_url_scheme("pages/about.js"));
    }
}
