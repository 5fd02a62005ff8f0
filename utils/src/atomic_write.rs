//! Atomic file write helpers.
//!
//! Uses a temp file + rename pattern so a crash mid-write never leaves a
//! truncated file at the destination.

use std::fs::{self, Permissions};
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    /// Keep the permissions of an existing destination; new files get 0o644 on Unix.
    #[default]
    Default,
    /// Strictly enforce owner-only read/write permissions (0o600 on Unix).
    SensitiveOwnerOnly,
}

pub fn atomic_write(path: impl AsRef<Path>, bytes: &[u8]) -> io::Result<()> {
    atomic_write_with_mode(path, bytes, PersistMode::Default)
}

pub fn atomic_write_with_mode(
    path: impl AsRef<Path>,
    bytes: &[u8],
    mode: PersistMode,
) -> io::Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let existing = fs::metadata(path).ok().map(|meta| meta.permissions());

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    if let Some(permissions) = target_permissions(existing, mode) {
        fs::set_permissions(tmp.path(), permissions)?;
    }

    tmp.persist(path).map_err(|e| e.error)?;
    debug!(path = %path.display(), bytes = bytes.len(), "Atomic write complete");
    Ok(())
}

#[cfg(unix)]
fn target_permissions(existing: Option<Permissions>, mode: PersistMode) -> Option<Permissions> {
    use std::os::unix::fs::PermissionsExt;

    match (mode, existing) {
        (PersistMode::SensitiveOwnerOnly, _) => Some(Permissions::from_mode(0o600)),
        (PersistMode::Default, Some(existing)) => Some(existing),
        (PersistMode::Default, None) => Some(Permissions::from_mode(0o644)),
    }
}

#[cfg(not(unix))]
fn target_permissions(existing: Option<Permissions>, _mode: PersistMode) -> Option<Permissions> {
    existing
}
