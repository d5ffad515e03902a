use std::fs;
use std::path::{Path, PathBuf};

use nix::sched::CloneFlags;
use nix::unistd::{setresgid, setresuid, Gid, Pid, Uid};
use tracing::{debug, warn};

use crate::core::error::{MiniconError, Result};
use crate::platform::linux::namespaces::{self, IdMapping};
use crate::util::security;

/// Directories expected to exist under the container root before chroot.
const ROOT_MOUNT_POINTS: &[&str] = &["proc", "sys", "dev", "tmp"];

/// Mount namespace: `setup` unshares in the parent, `apply` runs inside the
/// child and swaps the root filesystem.
#[derive(Debug)]
pub struct MountHandler {
    root_fs: PathBuf,
}

impl MountHandler {
    pub fn new(root_fs: impl Into<PathBuf>) -> Self {
        Self {
            root_fs: root_fs.into(),
        }
    }

    pub fn setup(&self) -> Result<()> {
        namespaces::unshare(CloneFlags::CLONE_NEWNS)
    }

    /// Runs in the child: privatize mount propagation, enter the container
    /// root, and try to give it a fresh `/proc`.
    pub fn apply(&self) -> Result<()> {
        namespaces::make_root_private()?;

        for dir in ROOT_MOUNT_POINTS {
            fs::create_dir_all(self.root_fs.join(dir))?;
        }

        namespaces::chroot_into(&self.root_fs)?;
        namespaces::chdir(Path::new("/"))?;

        // Without a mounted /proc the container still works, it just cannot
        // see its own process tree.
        if let Err(e) = namespaces::mount_proc(Path::new("/proc")) {
            warn!(error = %e, "could not mount /proc in container");
        }

        debug!(root_fs = %self.root_fs.display(), "mount isolation applied");
        Ok(())
    }
}

/// UTS namespace: isolates the hostname.
#[derive(Debug)]
pub struct UtsHandler {
    hostname: String,
}

impl UtsHandler {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    pub fn setup(&self) -> Result<()> {
        namespaces::unshare(CloneFlags::CLONE_NEWUTS)
    }

    /// Runs in the child: validate and set the container hostname.
    pub fn apply(&self) -> Result<()> {
        if !security::validate_hostname(&self.hostname) {
            return Err(MiniconError::Security(format!(
                "invalid hostname: {:?}",
                self.hostname
            )));
        }
        namespaces::set_hostname(&self.hostname)
    }
}

/// PID namespace. `setup` only unshares: the calling process stays in its
/// original namespace; the next forked child becomes PID 1 of the new one.
#[derive(Debug, Default)]
pub struct PidHandler;

impl PidHandler {
    pub fn setup(&self) -> Result<()> {
        namespaces::unshare(CloneFlags::CLONE_NEWPID)
    }
}

/// User namespace: holds the UID/GID mappings written from the parent and
/// the target user the child drops to before exec.
#[derive(Debug, Default)]
pub struct UserHandler {
    uid_mappings: Vec<IdMapping>,
    gid_mappings: Vec<IdMapping>,
    user_id: Option<u32>,
    group_id: Option<u32>,
}

impl UserHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_uid_mapping(&mut self, mapping: IdMapping) {
        self.uid_mappings.push(mapping);
    }

    pub fn add_gid_mapping(&mut self, mapping: IdMapping) {
        self.gid_mappings.push(mapping);
    }

    /// Set the in-namespace user the child switches to before exec.
    pub fn set_user(&mut self, user_id: u32, group_id: u32) {
        self.user_id = Some(user_id);
        self.group_id = Some(group_id);
    }

    pub fn has_mappings(&self) -> bool {
        !self.uid_mappings.is_empty() && !self.gid_mappings.is_empty()
    }

    pub fn target_user(&self) -> Option<(u32, u32)> {
        Some((self.user_id?, self.group_id?))
    }

    pub fn setup(&self) -> Result<()> {
        namespaces::unshare(CloneFlags::CLONE_NEWUSER)
    }

    /// Runs in the parent once the child PID is known and before the child
    /// is released: deny setgroups, then install the UID and GID maps.
    pub fn apply_from_parent(&self, child: Pid) -> Result<()> {
        if !self.has_mappings() {
            return Err(MiniconError::Validation(
                "UID or GID mappings not set".into(),
            ));
        }
        namespaces::deny_setgroups(child)?;
        namespaces::write_uid_map(child, &self.uid_mappings)?;
        namespaces::write_gid_map(child, &self.gid_mappings)?;
        debug!(child = child.as_raw(), "UID/GID mappings applied");
        Ok(())
    }

    /// Runs in the child: switch real and effective IDs to the configured
    /// user. Group first, while we are still privileged enough to set it.
    pub fn drop_privileges(&self) -> Result<()> {
        let (uid, gid) = self.target_user().ok_or_else(|| {
            MiniconError::Validation("user or group ID not set".into())
        })?;
        setresgid(Gid::from_raw(gid), Gid::from_raw(gid), Gid::from_raw(gid))
            .map_err(|e| MiniconError::kernel("setresgid", e))?;
        setresuid(Uid::from_raw(uid), Uid::from_raw(uid), Uid::from_raw(uid))
            .map_err(|e| MiniconError::kernel("setresuid", e))?;
        debug!(uid, gid, "dropped privileges");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_handler_tracks_mappings() {
        let mut handler = UserHandler::new();
        assert!(!handler.has_mappings());

        handler.add_uid_mapping(IdMapping::new(0, 1000, 1));
        assert!(!handler.has_mappings());

        handler.add_gid_mapping(IdMapping::new(0, 1000, 1));
        assert!(handler.has_mappings());
    }

    #[test]
    fn target_user_requires_both_ids() {
        let mut handler = UserHandler::new();
        assert_eq!(handler.target_user(), None);
        handler.set_user(0, 0);
        assert_eq!(handler.target_user(), Some((0, 0)));
    }

    #[test]
    fn apply_from_parent_requires_mappings() {
        let handler = UserHandler::new();
        let err = handler.apply_from_parent(Pid::from_raw(1)).unwrap_err();
        assert!(matches!(err, MiniconError::Validation(_)));
    }

    #[test]
    fn uts_apply_rejects_invalid_hostname() {
        let handler = UtsHandler::new("bad hostname");
        let err = handler.apply().unwrap_err();
        assert!(matches!(err, MiniconError::Security(_)));
    }
}
