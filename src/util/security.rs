use std::path::{Component, Path, PathBuf};

/// Longest accepted container name.
pub const MAX_CONTAINER_NAME_LENGTH: usize = 64;
/// Longest accepted hostname (RFC 1123).
pub const MAX_HOSTNAME_LENGTH: usize = 253;

/// Executables refused as `command[0]` regardless of path.
pub const DANGEROUS_COMMANDS: &[&str] = &[
    "rm", "rmdir", "dd", "mkfs", "fdisk", "parted", "mount", "umount", "sudo", "su", "chmod",
    "chown",
];

/// A container name is non-empty, at most 64 chars, and limited to
/// `[A-Za-z0-9_-]`.
pub fn validate_container_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_CONTAINER_NAME_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A hostname is non-empty, at most 253 chars, and limited to `[A-Za-z0-9.-]`.
pub fn validate_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= MAX_HOSTNAME_LENGTH
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// A command is non-empty and its executable's basename is not on the
/// dangerous list.
pub fn validate_command(command: &[String]) -> bool {
    let Some(executable) = command.first() else {
        return false;
    };
    let basename = Path::new(executable)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(executable);
    !DANGEROUS_COMMANDS.contains(&basename)
}

/// Check that `path` resolves under `allowed_base` (no traversal out of it).
///
/// The base must exist. The path itself may not exist yet; its deepest
/// existing ancestor is canonicalized and the remaining components are
/// appended, with `.` and `..` in the non-existing tail rejected outright.
pub fn is_safe_path(path: &Path, allowed_base: &Path) -> bool {
    let Ok(base) = allowed_base.canonicalize() else {
        return false;
    };
    match resolve(path) {
        Some(resolved) => resolved.starts_with(&base),
        None => false,
    }
}

fn resolve(path: &Path) -> Option<PathBuf> {
    if let Ok(resolved) = path.canonicalize() {
        return Some(resolved);
    }
    let name = match path.components().next_back()? {
        Component::Normal(name) => name.to_owned(),
        _ => return None,
    };
    Some(resolve(path.parent()?)?.join(name))
}
