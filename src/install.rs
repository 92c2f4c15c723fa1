//! Installs the built binary into the target tree.
//!
//! The copy goes to a temporary file next to the destination, which is made
//! executable and then renamed over the destination. Concurrent installs into
//! the same target therefore never observe a half-written binary, and a
//! failed install leaves whatever was there before untouched.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// Permission bits of the installed artifact.
pub const ARTIFACT_MODE: u32 = 0o755;

/// A binary that has been installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledArtifact {
    /// Where the build produced it.
    pub source_path: PathBuf,
    /// Where it now lives.
    pub installed_path: PathBuf,
    /// Permission bits it was installed with.
    pub mode: u32,
}

/// Atomically installs `from` at `to`, overwriting any previous artifact.
///
/// The destination directory must already exist; it is not created.
pub fn install_artifact(from: &Path, to: &Path) -> Result<InstalledArtifact> {
    let copy_error = |reason: String| Error::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        reason,
    };

    if !from.is_file() {
        return Err(copy_error("build artifact not found".to_string()));
    }

    let dir = to
        .parent()
        .ok_or_else(|| copy_error("destination has no parent directory".to_string()))?;
    if !dir.is_dir() {
        return Err(copy_error(format!(
            "destination directory {} does not exist",
            dir.display()
        )));
    }

    let staged = stage_copy(from, dir).map_err(|e| copy_error(e.to_string()))?;
    staged
        .persist(to)
        .map_err(|e| copy_error(e.error.to_string()))?;

    tracing::info!(from = ?from, to = ?to, "installed artifact");

    Ok(InstalledArtifact {
        source_path: from.to_path_buf(),
        installed_path: to.to_path_buf(),
        mode: ARTIFACT_MODE,
    })
}

fn stage_copy(from: &Path, dir: &Path) -> io::Result<NamedTempFile> {
    let mut staged = tempfile::Builder::new()
        .prefix(".codex-install-")
        .tempfile_in(dir)?;

    {
        let mut reader = BufReader::new(File::open(from)?);
        let mut writer = BufWriter::new(staged.as_file_mut());
        io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
    }
    staged.as_file().sync_all()?;
    set_executable(staged.path())?;

    Ok(staged)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(ARTIFACT_MODE))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
