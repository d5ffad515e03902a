use std::fs::File;
use std::path::{Path, PathBuf};

use tar::Archive;
use tracing::{debug, info, warn};

use crate::core::config::Config;
use crate::core::error::{MiniconError, Result};
use crate::util::fs::{copy_tree, ensure_dir, write_file};
use crate::util::security;

/// Directories every container rootfs gets, base image or not.
const ESSENTIAL_DIRECTORIES: &[&str] = &["proc", "sys", "dev", "tmp", "etc", "bin", "lib", "home"];

/// Prepare the root filesystem for a new container and return its path.
///
/// Population strategy, in order: copy the configured base-image directory,
/// extract `<base_image>.tar`, or fall back to a bare directory skeleton.
/// Always finishes by writing a default `/etc/hosts`.
pub fn prepare_rootfs(config: &Config, id: &str) -> Result<PathBuf> {
    ensure_dir(&config.base_dir)?;
    ensure_dir(&config.rootfs_dir)?;

    let rootfs = config.rootfs_dir.join(id);
    if !security::is_safe_path(&rootfs, &config.base_dir) {
        return Err(MiniconError::Security(format!(
            "rootfs path {} escapes base directory {}",
            rootfs.display(),
            config.base_dir.display()
        )));
    }
    ensure_dir(&rootfs)?;

    let tar_path = tar_sibling(&config.base_image);
    if config.base_image.is_dir() {
        copy_base_image(config, &config.base_image, &rootfs)?;
    } else if tar_path.is_file() {
        extract_base_image(config, &tar_path, &rootfs)?;
    } else {
        info!(rootfs = %rootfs.display(), "no base image found, creating minimal skeleton");
        for dir in ESSENTIAL_DIRECTORIES {
            ensure_dir(&rootfs.join(dir))?;
        }
    }

    write_file(
        &rootfs.join("etc").join("hosts"),
        &format!("127.0.0.1\tlocalhost\n127.0.0.1\t{id}\n"),
    )?;

    Ok(rootfs)
}

/// Remove a container's rootfs directory. Best effort.
pub fn remove_rootfs(config: &Config, id: &str) {
    let rootfs = config.rootfs_dir.join(id);
    if !rootfs.exists() {
        return;
    }
    if !security::is_safe_path(&rootfs, &config.base_dir) {
        warn!(rootfs = %rootfs.display(), "refusing to remove rootfs outside base directory");
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(&rootfs) {
        warn!(rootfs = %rootfs.display(), error = %e, "failed to remove rootfs");
    }
}

fn copy_base_image(config: &Config, image: &Path, rootfs: &Path) -> Result<()> {
    if !security::is_safe_path(image, &config.base_dir) {
        return Err(MiniconError::Security(format!(
            "base image {} escapes base directory",
            image.display()
        )));
    }
    debug!(image = %image.display(), rootfs = %rootfs.display(), "copying base image");
    copy_tree(image, rootfs)
}

fn extract_base_image(config: &Config, tar_path: &Path, rootfs: &Path) -> Result<()> {
    if !security::is_safe_path(tar_path, &config.base_dir) {
        return Err(MiniconError::Security(format!(
            "base image tar {} escapes base directory",
            tar_path.display()
        )));
    }
    debug!(tar = %tar_path.display(), rootfs = %rootfs.display(), "extracting base image tar");
    let mut archive = Archive::new(File::open(tar_path)?);
    archive.unpack(rootfs)?;
    Ok(())
}

fn tar_sibling(base_image: &Path) -> PathBuf {
    let mut path = base_image.to_path_buf().into_os_string();
    path.push(".tar");
    PathBuf::from(path)
}
