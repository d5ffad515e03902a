use std::env;
use std::path::PathBuf;

use tracing::warn;

/// Default memory limit for containers: 250 MiB.
pub const DEFAULT_MEMORY_LIMIT: u64 = 250 * 1024 * 1024;

const DEFAULT_BASE_DIR: &str = "/var/lib/minicon";
const DEFAULT_BASE_IMAGE: &str = "/var/lib/minicon/base";
const DEFAULT_ROOTFS_DIR: &str = "/var/lib/minicon/rootfs";
const REGISTRY_FILE_NAME: &str = "containers.json";

/// Process-wide runtime configuration.
///
/// Built once from the environment at process start and read-only afterwards.
/// Tests construct it directly against temp directories.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory all other paths must resolve under.
    pub base_dir: PathBuf,
    /// Directory whose contents seed new container root filesystems.
    pub base_image: PathBuf,
    /// Directory holding one rootfs per container id.
    pub rootfs_dir: PathBuf,
    /// Path of the persisted container registry (JSON).
    pub registry_file: PathBuf,
    /// Default memory limit in bytes for new containers.
    pub memory_limit: u64,
}

impl Config {
    /// Build the configuration from `MINICON_*` environment variables,
    /// falling back to the defaults under `/var/lib/minicon`.
    pub fn from_env() -> Self {
        let base_dir =
            PathBuf::from(env::var("MINICON_BASE_DIR").unwrap_or_else(|_| DEFAULT_BASE_DIR.into()));

        let base_image = env::var("MINICON_BASE_IMAGE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                if base_dir == PathBuf::from(DEFAULT_BASE_DIR) {
                    PathBuf::from(DEFAULT_BASE_IMAGE)
                } else {
                    base_dir.join("base")
                }
            });

        let rootfs_dir = env::var("MINICON_ROOTFS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                if base_dir == PathBuf::from(DEFAULT_BASE_DIR) {
                    PathBuf::from(DEFAULT_ROOTFS_DIR)
                } else {
                    base_dir.join("rootfs")
                }
            });

        let registry_file = env::var("MINICON_REGISTRY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir.join(REGISTRY_FILE_NAME));

        let memory_limit = match env::var("MINICON_MEMORY_LIMIT") {
            Ok(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(value = %raw, "invalid MINICON_MEMORY_LIMIT, using default");
                DEFAULT_MEMORY_LIMIT
            }),
            Err(_) => DEFAULT_MEMORY_LIMIT,
        };

        Self {
            base_dir,
            base_image,
            rootfs_dir,
            registry_file,
            memory_limit,
        }
    }

    /// Configuration rooted at an arbitrary base directory, with the default
    /// sub-layout. Used by tests and embedders.
    pub fn rooted(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            base_image: base_dir.join("base"),
            rootfs_dir: base_dir.join("rootfs"),
            registry_file: base_dir.join(REGISTRY_FILE_NAME),
            memory_limit: DEFAULT_MEMORY_LIMIT,
            base_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_layout_stays_under_base() {
        let config = Config::rooted("/tmp/minicon-test");
        assert!(config.base_image.starts_with(&config.base_dir));
        assert!(config.rootfs_dir.starts_with(&config.base_dir));
        assert!(config.registry_file.starts_with(&config.base_dir));
        assert_eq!(config.memory_limit, DEFAULT_MEMORY_LIMIT);
    }

    #[test]
    fn default_memory_limit_is_250_mib() {
        assert_eq!(DEFAULT_MEMORY_LIMIT, 262_144_000);
    }
}
