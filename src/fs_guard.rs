use anyhow::{bail, Context, Result};
use std::{
    fs::{self, File},
    io::Read,
    path::Path,
};

/// Upper bound for any JSON document read back from disk (tool output,
/// config). Attestation bundles for large images stay well below this.
pub const MAX_JSON_BYTES: u64 = 20 * 1024 * 1024;

/// Reads a regular, non-symlink file of at most `max_bytes`.
///
/// Two kinds of file come through here: `cosign`/`rekor-cli` output captured
/// into the per-run workspace, and the `--config` file. The symlink check
/// runs on the path before opening, so a link swapped in between the two
/// calls is not caught. The size limit is enforced on the open handle and
/// holds even if the file grows after the stat.
pub fn read_validated(path: &Path, max_bytes: u64) -> Result<Vec<u8>> {
    let meta = fs::symlink_metadata(path).with_context(|| format!("stat {}", path.display()))?;
    match meta.file_type() {
        t if t.is_symlink() => bail!("refusing to read symlink {}", path.display()),
        t if !t.is_file() => bail!("not a regular file: {}", path.display()),
        _ if meta.len() > max_bytes => bail!(
            "{} is too large ({} bytes, limit {max_bytes})",
            path.display(),
            meta.len()
        ),
        _ => {}
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut buf = Vec::new();
    file.take(max_bytes.saturating_add(1))
        .read_to_end(&mut buf)
        .with_context(|| format!("read {}", path.display()))?;
    if buf.len() as u64 > max_bytes {
        bail!("{} is too large (over {max_bytes} bytes)", path.display());
    }
    Ok(buf)
}
