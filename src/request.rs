//! Input validation: turns the command line into a [`BuildRequest`].

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Environment variable overriding the derived source root.
pub const SOURCE_ROOT_ENV: &str = "CODEX_BUILDER_SOURCE_ROOT";

/// A validated build request.
///
/// Both roots are canonical, existing directories. The request is built once
/// per invocation and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    source_root: PathBuf,
    target_root: PathBuf,
}

impl BuildRequest {
    /// Validates the caller-supplied target root and pairs it with the
    /// source root.
    ///
    /// `target` is the single positional argument; `None` means it was
    /// omitted and yields [`Error::Usage`].
    pub fn new(target: Option<&Path>, source_root: &Path) -> Result<Self> {
        let target = require_target(target)?;

        Ok(Self {
            source_root: existing_dir(source_root)?,
            target_root: existing_dir(target)?,
        })
    }

    /// Root of the source tree, bind-mounted into the sandbox.
    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Root of the target tree the artifact is installed under.
    pub fn target_root(&self) -> &Path {
        &self.target_root
    }
}

/// Fails with [`Error::Usage`] when the target argument was omitted.
pub fn require_target(target: Option<&Path>) -> Result<&Path> {
    target.ok_or_else(|| Error::Usage("missing required argument <TARGET_ROOT>".to_string()))
}

/// Resolves the source root from the location of the invoking program.
///
/// The program lives one directory below the repository root (for example
/// `<repo>/scripts/build-codex`), so the root is the parent of its containing
/// directory. Symlinks are resolved first, which keeps the answer independent
/// of the caller's working directory.
pub fn source_root_from_script(script: &Path) -> Result<PathBuf> {
    let script = script.canonicalize().map_err(|e| Error::Path {
        path: script.to_path_buf(),
        reason: format!("cannot resolve program location: {}", e),
    })?;

    script
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::Path {
            path: script.clone(),
            reason: "program has no grandparent directory".to_string(),
        })
}

/// Picks the source root: an explicit override wins, otherwise it is derived
/// from the running executable.
pub fn resolve_source_root(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => {
            let exe = std::env::current_exe()?;
            source_root_from_script(&exe)
        }
    }
}

fn existing_dir(path: &Path) -> Result<PathBuf> {
    let metadata = std::fs::metadata(path).map_err(|e| Error::Path {
        path: path.to_path_buf(),
        reason: if e.kind() == std::io::ErrorKind::NotFound {
            "does not exist".to_string()
        } else {
            e.to_string()
        },
    })?;

    if !metadata.is_dir() {
        return Err(Error::Path {
            path: path.to_path_buf(),
            reason: "is not a directory".to_string(),
        });
    }

    Ok(path.canonicalize()?)
}
