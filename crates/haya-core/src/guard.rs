//! Workspace guard — confines file-touching tools to allowed roots.

use std::path::{Path, PathBuf};

use crate::error::{HayaError, Result};

/// Holds the canonicalized set of directories tools may touch.
#[derive(Debug, Clone)]
pub struct WorkspaceGuard {
    roots: Vec<PathBuf>,
}

impl WorkspaceGuard {
    /// Canonicalize each root up front. Roots that do not exist are rejected
    /// — a typo here must fail loudly, not silently allow nothing.
    pub fn new(roots: &[impl AsRef<Path>]) -> Result<Self> {
        let mut resolved = Vec::with_capacity(roots.len());
        for root in roots {
            resolved.push(root.as_ref().canonicalize()?);
        }
        Ok(Self { roots: resolved })
    }

    /// Resolve `path` (following symlinks) and assert it lies under one of
    /// the allowed roots. Returns the canonical path on success.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        // canonicalize requires the target to exist; for a not-yet-created
        // file, resolve its parent and re-append the final component.
        let canonical = match path.canonicalize() {
            Ok(p) => p,
            Err(_) => {
                let parent = path.parent().ok_or_else(|| HayaError::WorkspaceViolation {
                    path: path.display().to_string(),
                })?;
                let name = path.file_name().ok_or_else(|| HayaError::WorkspaceViolation {
                    path: path.display().to_string(),
                })?;
                parent.canonicalize()?.join(name)
            }
        };

        if self.roots.iter().any(|root| canonical.starts_with(root)) {
            Ok(canonical)
        } else {
            Err(HayaError::WorkspaceViolation {
                path: path.display().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_paths_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let guard = WorkspaceGuard::new(&[dir.path()]).unwrap();
        assert!(guard.resolve(dir.path().join("a.txt")).is_ok());
        // not-yet-existing file in an existing dir
        assert!(guard.resolve(dir.path().join("new.txt")).is_ok());
    }

    #[test]
    fn rejects_escape_via_dotdot() {
        let dir = tempfile::tempdir().unwrap();
        let guard = WorkspaceGuard::new(&[dir.path()]).unwrap();
        let escape = dir.path().join("../outside.txt");
        assert!(matches!(
            guard.resolve(escape),
            Err(HayaError::WorkspaceViolation { .. })
        ));
    }

    #[test]
    fn rejects_symlink_pointing_outside() {
        let inside = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("secret");
        std::fs::write(&target, "x").unwrap();
        let link = inside.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let guard = WorkspaceGuard::new(&[inside.path()]).unwrap();
        assert!(matches!(
            guard.resolve(&link),
            Err(HayaError::WorkspaceViolation { .. })
        ));
    }
}
