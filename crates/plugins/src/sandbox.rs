//! Path sandboxing for plugin loading.
//!
//! A plugin may only be loaded from inside an allow-listed root.
//! Requests are plain relative directory names; anything absolute, empty,
//! or containing `..` is refused before the filesystem is touched, and a
//! canonicalize-and-prefix check catches symlinks pointing out of tree.

use std::path::{Path, PathBuf};

use bd_domain::error::{Error, Result};

/// Resolve a requested plugin directory inside the allow-listed roots.
/// Returns the canonical directory of the first root that contains it.
pub fn resolve_plugin_dir(roots: &[PathBuf], requested: &str) -> Result<PathBuf> {
    if requested.is_empty() {
        return Err(Error::Plugin("plugin path is empty".into()));
    }
    let requested_path = Path::new(requested);
    if requested_path.is_absolute() {
        return Err(Error::Plugin(format!(
            "absolute plugin paths are not allowed: {requested}"
        )));
    }
    if requested_path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(Error::Plugin(format!(
            "parent-directory traversal is not allowed: {requested}"
        )));
    }

    for root in roots {
        let candidate = root.join(requested_path);
        if !candidate.is_dir() {
            continue;
        }
        let canonical_root = root
            .canonicalize()
            .map_err(|e| Error::Plugin(format!("plugin root unusable: {e}")))?;
        let canonical = candidate
            .canonicalize()
            .map_err(|e| Error::Plugin(format!("plugin dir unusable: {e}")))?;
        if !canonical.starts_with(&canonical_root) {
            return Err(Error::Plugin(format!(
                "plugin dir escapes its root (symlink?): {requested}"
            )));
        }
        return Ok(canonical);
    }

    Err(Error::Plugin(format!(
        "plugin not found in any allowed root: {requested}"
    )))
}

/// Check the entry file's extension against the allow-list and return
/// the resolved entry path.
pub fn check_entry(plugin_dir: &Path, entry: &str, allowed_extensions: &[String]) -> Result<PathBuf> {
    let path = plugin_dir.join(entry);
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| Error::Plugin(format!("entry has no extension: {entry}")))?;
    if !allowed_extensions.iter().any(|a| a == extension) {
        return Err(Error::Plugin(format!(
            "entry extension .{extension} is not allowed (allowed: {})",
            allowed_extensions.join(", ")
        )));
    }
    if !path.is_file() {
        return Err(Error::Plugin(format!("entry file missing: {entry}")));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roots(dir: &Path) -> Vec<PathBuf> {
        vec![dir.to_path_buf()]
    }

    #[test]
    fn resolves_existing_plugin_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("demo")).unwrap();
        let resolved = resolve_plugin_dir(&roots(tmp.path()), "demo").unwrap();
        assert!(resolved.ends_with("demo"));
    }

    #[test]
    fn rejects_traversal_and_absolute() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(resolve_plugin_dir(&roots(tmp.path()), "../demo").is_err());
        assert!(resolve_plugin_dir(&roots(tmp.path()), "/etc").is_err());
        assert!(resolve_plugin_dir(&roots(tmp.path()), "a/../../b").is_err());
        assert!(resolve_plugin_dir(&roots(tmp.path()), "").is_err());
    }

    #[test]
    fn missing_plugin_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(resolve_plugin_dir(&roots(tmp.path()), "ghost").is_err());
    }

    #[test]
    fn entry_extension_allow_list() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("main.sh"), "#!/bin/sh\n").unwrap();
        std::fs::write(tmp.path().join("main.exe"), "").unwrap();

        let allowed = vec!["sh".to_string(), "js".to_string()];
        assert!(check_entry(tmp.path(), "main.sh", &allowed).is_ok());
        assert!(check_entry(tmp.path(), "main.exe", &allowed).is_err());
        assert!(check_entry(tmp.path(), "missing.sh", &allowed).is_err());
    }
}
