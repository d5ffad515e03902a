use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use nix::mount::{mount, MsFlags};
use nix::sched::CloneFlags;
use nix::unistd::Pid;

use crate::core::error::{MiniconError, Result};

/// The UID/GID mapping triple `(inside, outside, count)` written to a child's
/// `/proc/<pid>/{uid,gid}_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub inside: u32,
    pub outside: u32,
    pub count: u32,
}

impl IdMapping {
    pub fn new(inside: u32, outside: u32, count: u32) -> Self {
        Self {
            inside,
            outside,
            count,
        }
    }
}

/// Move the calling process into fresh namespaces of the selected kinds.
pub fn unshare(flags: CloneFlags) -> Result<()> {
    nix::sched::unshare(flags).map_err(|e| MiniconError::kernel("unshare", e))
}

/// Change the root directory of the calling process.
pub fn chroot_into(path: &Path) -> Result<()> {
    nix::unistd::chroot(path).map_err(|e| MiniconError::kernel("chroot", e))
}

/// Change the working directory of the calling process.
pub fn chdir(path: &Path) -> Result<()> {
    nix::unistd::chdir(path).map_err(|e| MiniconError::kernel("chdir", e))
}

/// Recursively mark `/` private so mount changes cannot propagate back to
/// the host.
pub fn make_root_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| MiniconError::kernel("mount (make-private)", e))
}

/// Mount a fresh `proc` filesystem at `target`.
pub fn mount_proc(target: &Path) -> Result<()> {
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| MiniconError::kernel("mount (proc)", e))
}

/// Set the hostname inside the current UTS namespace.
pub fn set_hostname(name: &str) -> Result<()> {
    nix::unistd::sethostname(name).map_err(|e| MiniconError::kernel("sethostname", e))
}

/// Disable `setgroups(2)` for a child's user namespace. Required before its
/// `gid_map` becomes writable by an unprivileged parent.
pub fn deny_setgroups(pid: Pid) -> Result<()> {
    write_proc_file(pid, "setgroups", "deny")
}

/// Write UID mappings to `/proc/<pid>/uid_map`.
pub fn write_uid_map(pid: Pid, mappings: &[IdMapping]) -> Result<()> {
    write_proc_file(pid, "uid_map", &render_mappings(mappings))
}

/// Write GID mappings to `/proc/<pid>/gid_map`.
pub fn write_gid_map(pid: Pid, mappings: &[IdMapping]) -> Result<()> {
    write_proc_file(pid, "gid_map", &render_mappings(mappings))
}

fn render_mappings(mappings: &[IdMapping]) -> String {
    let mut out = String::new();
    for m in mappings {
        out.push_str(&format!("{} {} {}\n", m.inside, m.outside, m.count));
    }
    out
}

fn write_proc_file(pid: Pid, name: &str, contents: &str) -> Result<()> {
    let path = format!("/proc/{pid}/{name}");
    let mut file = OpenOptions::new()
        .write(true)
        .open(&path)
        .map_err(|e| MiniconError::kernel_io("open /proc map file", e))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| MiniconError::kernel_io("write /proc map file", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The namespace flags must match the kernel ABI values.
    #[test]
    fn clone_flags_match_kernel_abi() {
        assert_eq!(CloneFlags::CLONE_NEWNS.bits(), 0x0002_0000);
        assert_eq!(CloneFlags::CLONE_NEWUTS.bits(), 0x0400_0000);
        assert_eq!(CloneFlags::CLONE_NEWPID.bits(), 0x2000_0000);
        assert_eq!(CloneFlags::CLONE_NEWUSER.bits(), 0x1000_0000);
    }

    #[test]
    fn mappings_render_one_triple_per_line() {
        let mappings = [IdMapping::new(0, 1000, 1), IdMapping::new(1, 100_000, 65_536)];
        assert_eq!(render_mappings(&mappings), "0 1000 1\n1 100000 65536\n");
    }
}
