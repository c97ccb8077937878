//! Sandbox path validation
//!
//! Confines all filesystem operations performed on behalf of agent output to
//! a single base directory. Resolution is purely lexical so that paths which
//! do not exist yet (the common case for `write_file`) are still validated.

use crate::error::{Result, ToolingError};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// A filesystem sandbox rooted at a base directory.
///
/// [`Sandbox::resolve`] maps an agent-supplied path to an absolute path that
/// is guaranteed to stay inside the base directory, or rejects it.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Create a sandbox rooted at `root`. The directory is created if it
    /// does not exist so that relative writes always have a home.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    /// The sandbox base directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an untrusted path to an absolute path inside the sandbox.
    ///
    /// Absolute inputs are accepted only when they already point inside the
    /// base directory. Relative inputs are normalized component-wise;
    /// any `..` that would climb above the base directory is rejected.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();

        let relative = if path.is_absolute() {
            match path.strip_prefix(&self.root) {
                Ok(rest) => rest.to_path_buf(),
                Err(_) => {
                    return Err(ToolingError::PathViolation(format!(
                        "absolute path {} is outside the sandbox {}",
                        path.display(),
                        self.root.display()
                    )))
                }
            }
        } else {
            path.to_path_buf()
        };

        // Lexical normalization: `..` pops, `.` is dropped. Popping past the
        // sandbox root is a violation.
        let mut stack: Vec<std::ffi::OsString> = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => stack.push(part.to_os_string()),
                Component::CurDir => {}
                Component::ParentDir => {
                    if stack.pop().is_none() {
                        return Err(ToolingError::PathViolation(format!(
                            "path {} escapes the sandbox",
                            path.display()
                        )));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(ToolingError::PathViolation(format!(
                        "unexpected root component in {}",
                        path.display()
                    )))
                }
            }
        }

        let mut resolved = self.root.clone();
        for part in stack {
            resolved.push(part);
        }
        debug!(path = %path.display(), resolved = %resolved.display(), "sandbox resolve");
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox() -> (TempDir, Sandbox) {
        let dir = TempDir::new().unwrap();
        let sandbox = Sandbox::new(dir.path()).unwrap();
        (dir, sandbox)
    }

    #[test]
    fn resolves_relative_paths_inside_root() {
        let (_dir, sandbox) = sandbox();
        let resolved = sandbox.resolve("src/main.rs").unwrap();
        assert!(resolved.starts_with(sandbox.root()));
        assert!(resolved.ends_with("src/main.rs"));
    }

    #[test]
    fn rejects_parent_traversal() {
        let (_dir, sandbox) = sandbox();
        assert!(sandbox.resolve("../etc/passwd").is_err());
        assert!(sandbox.resolve("a/../../etc").is_err());
        assert!(sandbox.resolve("../../../../etc/passwd").is_err());
    }

    #[test]
    fn allows_internal_parent_components() {
        let (_dir, sandbox) = sandbox();
        // a/b/../c normalizes to a/c, which stays inside.
        let resolved = sandbox.resolve("a/b/../c").unwrap();
        assert!(resolved.ends_with("a/c"));
    }

    #[test]
    fn rejects_absolute_paths_outside_root() {
        let (_dir, sandbox) = sandbox();
        assert!(sandbox.resolve("/etc/passwd").is_err());
    }

    #[test]
    fn accepts_absolute_paths_inside_root() {
        let (_dir, sandbox) = sandbox();
        let inside = sandbox.root().join("data/file.txt");
        let resolved = sandbox.resolve(&inside).unwrap();
        assert_eq!(resolved, inside);
    }

    #[test]
    fn empty_path_resolves_to_root() {
        let (_dir, sandbox) = sandbox();
        assert_eq!(sandbox.resolve("").unwrap(), sandbox.root());
    }
}
