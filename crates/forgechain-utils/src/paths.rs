//! Sandboxed path validation.
//!
//! Every path the pipeline writes under `out_dir`, and every path a cascade
//! step declares in `expected_out_files`, is resolved through a
//! [`SandboxRoot`] so it cannot escape its root via `..`, an absolute path,
//! or a symlink. This is the implementation behind `safe_join_under_root`
//! (§4.9.6) and the `PathViolation` error category (§7).

use std::path::{Path, PathBuf};
use thiserror::Error;

#[cfg(unix)]
fn link_count(path: &Path) -> Result<u32, std::io::Error> {
    use std::os::unix::fs::MetadataExt;
    Ok(path.metadata()?.nlink() as u32)
}

#[cfg(not(unix))]
fn link_count(_path: &Path) -> Result<u32, std::io::Error> {
    Ok(1)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("Sandbox root does not exist: {path}")]
    RootNotFound { path: String },

    #[error("Sandbox root is not a directory: {path}")]
    RootNotDirectory { path: String },

    #[error("Failed to canonicalize sandbox root '{path}': {reason}")]
    RootCanonicalizationFailed { path: String, reason: String },

    #[error("Path contains parent directory traversal: {path}")]
    ParentTraversal { path: String },

    #[error("Absolute path not allowed: {path}")]
    AbsolutePath { path: String },

    #[error("Path escapes sandbox root: {path} resolves outside {root}")]
    EscapeAttempt { path: String, root: String },

    #[error("Symlink not allowed: {path}")]
    SymlinkNotAllowed { path: String },

    #[error("Hardlink not allowed: {path}")]
    HardlinkNotAllowed { path: String },

    #[error("Path contains a backslash: {path}")]
    BackslashNotAllowed { path: String },

    #[error("Failed to canonicalize path '{path}': {reason}")]
    PathCanonicalizationFailed { path: String, reason: String },
}

/// Configuration for sandbox path validation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SandboxConfig {
    pub allow_symlinks: bool,
    pub allow_hardlinks: bool,
}

impl SandboxConfig {
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            allow_symlinks: true,
            allow_hardlinks: true,
        }
    }
}

/// A validated root directory for sandboxed operations.
#[derive(Debug, Clone)]
pub struct SandboxRoot {
    root: PathBuf,
    config: SandboxConfig,
}

impl SandboxRoot {
    pub fn new(root: impl AsRef<Path>, config: SandboxConfig) -> Result<Self, SandboxError> {
        let root_path = root.as_ref();

        if !root_path.exists() {
            return Err(SandboxError::RootNotFound {
                path: root_path.display().to_string(),
            });
        }
        if !root_path.is_dir() {
            return Err(SandboxError::RootNotDirectory {
                path: root_path.display().to_string(),
            });
        }
        let canonical =
            root_path
                .canonicalize()
                .map_err(|e| SandboxError::RootCanonicalizationFailed {
                    path: root_path.display().to_string(),
                    reason: e.to_string(),
                })?;

        Ok(Self {
            root: canonical,
            config,
        })
    }

    pub fn new_default(root: impl AsRef<Path>) -> Result<Self, SandboxError> {
        Self::new(root, SandboxConfig::default())
    }

    /// Join a relative path, validating it stays within the sandbox.
    ///
    /// Rejects absolute paths, `..` traversal, and (unless the string itself
    /// is later rejected by a caller such as the manifest path validator)
    /// backslash separators, matching the original manifest-path rules (§3).
    pub fn join(&self, rel: impl AsRef<Path>) -> Result<SandboxPath, SandboxError> {
        let rel_path = rel.as_ref();
        let rel_str = rel_path.to_string_lossy();

        if rel_str.contains('\\') {
            return Err(SandboxError::BackslashNotAllowed {
                path: rel_str.to_string(),
            });
        }
        if rel_path.is_absolute() {
            return Err(SandboxError::AbsolutePath {
                path: rel_path.display().to_string(),
            });
        }
        if rel_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(SandboxError::ParentTraversal {
                path: rel_path.display().to_string(),
            });
        }

        let full_path = self.root.join(rel_path);

        if !self.config.allow_symlinks {
            self.check_symlinks_in_path(&full_path)?;
        }

        if full_path.exists() {
            let canonical =
                full_path
                    .canonicalize()
                    .map_err(|e| SandboxError::PathCanonicalizationFailed {
                        path: full_path.display().to_string(),
                        reason: e.to_string(),
                    })?;

            if !canonical.starts_with(&self.root) {
                return Err(SandboxError::EscapeAttempt {
                    path: rel_path.display().to_string(),
                    root: self.root.display().to_string(),
                });
            }

            if !self.config.allow_hardlinks {
                self.check_hardlink(&canonical)?;
            }

            Ok(SandboxPath {
                full: canonical,
                rel: rel_path.to_path_buf(),
            })
        } else {
            if self.config.allow_symlinks {
                self.validate_ancestor_within_sandbox(&full_path, rel_path)?;
            }
            Ok(SandboxPath {
                full: full_path,
                rel: rel_path.to_path_buf(),
            })
        }
    }

    fn check_symlinks_in_path(&self, path: &Path) -> Result<(), SandboxError> {
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            if current.exists()
                && current
                    .symlink_metadata()
                    .map(|m| m.is_symlink())
                    .unwrap_or(false)
            {
                return Err(SandboxError::SymlinkNotAllowed {
                    path: current.display().to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_hardlink(&self, path: &Path) -> Result<(), SandboxError> {
        if path.is_file() {
            match link_count(path) {
                Ok(count) if count > 1 => {
                    return Err(SandboxError::HardlinkNotAllowed {
                        path: path.display().to_string(),
                    });
                }
                Ok(_) => {}
                Err(_) => {
                    return Err(SandboxError::HardlinkNotAllowed {
                        path: path.display().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_ancestor_within_sandbox(
        &self,
        full_path: &Path,
        rel_path: &Path,
    ) -> Result<(), SandboxError> {
        let mut ancestor = full_path.to_path_buf();
        while !ancestor.exists() {
            if !ancestor.pop() {
                return Ok(());
            }
        }
        let canonical_ancestor =
            ancestor
                .canonicalize()
                .map_err(|e| SandboxError::PathCanonicalizationFailed {
                    path: ancestor.display().to_string(),
                    reason: e.to_string(),
                })?;
        if !canonical_ancestor.starts_with(&self.root) {
            return Err(SandboxError::EscapeAttempt {
                path: rel_path.display().to_string(),
                root: self.root.display().to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

/// A path validated to be within a `SandboxRoot`.
#[derive(Debug, Clone)]
pub struct SandboxPath {
    full: PathBuf,
    rel: PathBuf,
}

impl SandboxPath {
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.full
    }

    #[must_use]
    pub fn relative(&self) -> &Path {
        &self.rel
    }
}

/// Ensure `dir` exists, creating all parent components.
pub fn ensure_dir_all(dir: &camino::Utf8Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir.as_std_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rejects_absolute() {
        let dir = TempDir::new().unwrap();
        let root = SandboxRoot::new_default(dir.path()).unwrap();
        assert!(matches!(
            root.join("/etc/passwd"),
            Err(SandboxError::AbsolutePath { .. })
        ));
    }

    #[test]
    fn rejects_parent_traversal() {
        let dir = TempDir::new().unwrap();
        let root = SandboxRoot::new_default(dir.path()).unwrap();
        assert!(matches!(
            root.join("../escape.txt"),
            Err(SandboxError::ParentTraversal { .. })
        ));
    }

    #[test]
    fn rejects_backslash() {
        let dir = TempDir::new().unwrap();
        let root = SandboxRoot::new_default(dir.path()).unwrap();
        assert!(matches!(
            root.join("a\\b.txt"),
            Err(SandboxError::BackslashNotAllowed { .. })
        ));
    }

    #[test]
    fn allows_nested_new_file() {
        let dir = TempDir::new().unwrap();
        let root = SandboxRoot::new_default(dir.path()).unwrap();
        let p = root.join("src/lib.rs").unwrap();
        assert!(p.as_path().starts_with(dir.path().canonicalize().unwrap()));
    }
}
