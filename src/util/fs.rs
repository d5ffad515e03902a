use std::fs;
use std::path::Path;

use tracing::warn;

use crate::core::error::Result;

/// Recursively ensure a directory exists.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write contents to a file, creating parent directories if needed.
pub fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

/// Recursively copy the contents of `source` into `dest`.
///
/// Directory-level failures propagate; a single unreadable file (a vendor
/// library with odd permissions, say) is logged and skipped so one bad entry
/// does not abort the whole rootfs population.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    ensure_dir(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            // Replace a stale link from a previous population attempt.
            let _ = fs::remove_file(&target);
            std::os::unix::fs::symlink(&link, &target)?;
        } else if let Err(e) = fs::copy(entry.path(), &target) {
            warn!(
                source = %entry.path().display(),
                error = %e,
                "skipping unreadable file during copy"
            );
        }
    }
    Ok(())
}
