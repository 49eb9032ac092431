//! Per-run scratch space for raw tool output.
//!
//! Each stage writes what its tool printed to a file in a private temp
//! directory and extraction reads it back from there. The directory is
//! removed when the [`Workspace`] drops, which also happens when a stage bails
//! out with `?`. An operator-named output file is an extra copy kept after
//! the run; it is never read back.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

use crate::fs_guard;

pub struct Workspace {
    dir: TempDir,
}

/// A captured tool output on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evidence {
    /// Private copy inside the workspace.
    pub path: PathBuf,
    /// Operator-named copy, if one was requested.
    pub kept_at: Option<PathBuf>,
    pub sha256: String,
    pub bytes: u64,
}

impl Workspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("provcheck-")
            .tempdir()
            .context("creating temp directory")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `bytes` to `name` inside the workspace and, if given, to
    /// `outfile`, then records their digest. A symlinked `outfile` is refused
    /// before anything is written through it.
    pub fn capture(&self, name: &str, outfile: Option<&Path>, bytes: &[u8]) -> Result<Evidence> {
        let path = self.dir.path().join(name);
        fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;

        if let Some(out) = outfile {
            if let Ok(meta) = fs::symlink_metadata(out) {
                if meta.file_type().is_symlink() {
                    bail!("refusing to write through symlink {}", out.display());
                }
            }
            fs::write(out, bytes).with_context(|| format!("write {}", out.display()))?;
        }

        Ok(Evidence {
            path,
            kept_at: outfile.map(Path::to_path_buf),
            sha256: hex::encode(Sha256::digest(bytes)),
            bytes: bytes.len() as u64,
        })
    }

    /// Reads captured output back through the size and symlink guard.
    pub fn read(&self, evidence: &Evidence) -> Result<Vec<u8>> {
        fs_guard::read_validated(&evidence.path, fs_guard::MAX_JSON_BYTES)
    }
}
