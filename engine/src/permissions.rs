//! Folder-level authorization for read-oriented tools.
//!
//! Approving a directory approves it and every descendant. Paths are
//! compared after lexical normalization against the session working
//! directory; symlinks are not resolved.

use std::path::{Component, Path, PathBuf};

use tracing::{info, warn};

use crate::config::{ConfigError, persist_approved_folders};

/// Resolve `path` against `base` and fold `.` and `..` components.
///
/// `..` never climbs above the root.
#[must_use]
pub fn normalize_path(path: &Path, base: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if out.parent().is_some() {
                    out.pop();
                }
            }
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                out.push(component.as_os_str());
            }
        }
    }
    out
}

/// Absolute directories the operator approved, in approval order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovedFolderSet {
    folders: Vec<PathBuf>,
}

impl ApprovedFolderSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `path` is an approved folder or lies beneath one.
    ///
    /// `path` must already be normalized.
    #[must_use]
    pub fn covers(&self, path: &Path) -> bool {
        // Component-wise: `/a/bc` is not under `/a/b`.
        self.folders.iter().any(|folder| path.starts_with(folder))
    }

    /// Add `folder`. Returns false when it was already present.
    pub fn insert(&mut self, folder: PathBuf) -> bool {
        if self.folders.contains(&folder) {
            return false;
        }
        self.folders.push(folder);
        true
    }

    /// Remove an exact entry. Descendant or ancestor entries are untouched.
    pub fn remove(&mut self, folder: &Path) -> bool {
        let before = self.folders.len();
        self.folders.retain(|existing| existing != folder);
        self.folders.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.folders.iter().map(PathBuf::as_path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.folders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    fn to_strings(&self) -> Vec<String> {
        self.folders
            .iter()
            .map(|folder| folder.to_string_lossy().into_owned())
            .collect()
    }
}

/// Where approvals are persisted between sessions.
pub trait FolderStore: Send + Sync {
    fn save(&self, folders: &[String]) -> Result<(), ConfigError>;
}

/// Persists approvals to the `approved_folders` key of the config file.
#[derive(Debug, Clone)]
pub struct ConfigFolderStore {
    path: PathBuf,
}

impl ConfigFolderStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FolderStore for ConfigFolderStore {
    fn save(&self, folders: &[String]) -> Result<(), ConfigError> {
        persist_approved_folders(&self.path, folders)
    }
}

/// Store for sessions that should not touch disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFolderStore;

impl FolderStore for NoopFolderStore {
    fn save(&self, _folders: &[String]) -> Result<(), ConfigError> {
        Ok(())
    }
}

pub struct PermissionGate {
    working_dir: PathBuf,
    approved: ApprovedFolderSet,
    store: Box<dyn FolderStore>,
}

impl PermissionGate {
    pub fn new<I, S>(
        working_dir: impl Into<PathBuf>,
        approved: I,
        store: Box<dyn FolderStore>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<Path>,
    {
        let working_dir = working_dir.into();
        let mut set = ApprovedFolderSet::new();
        for folder in approved {
            set.insert(normalize_path(folder.as_ref(), &working_dir));
        }
        Self {
            working_dir,
            approved: set,
            store,
        }
    }

    #[must_use]
    pub fn resolve(&self, folder: &Path) -> PathBuf {
        normalize_path(folder, &self.working_dir)
    }

    #[must_use]
    pub fn check(&self, folder: &Path) -> bool {
        self.approved.covers(&self.resolve(folder))
    }

    /// Approve `folder` and its descendants, returning the normalized path.
    ///
    /// A persistence failure is logged; the in-memory grant stands.
    pub fn grant(&mut self, folder: &Path) -> PathBuf {
        let resolved = self.resolve(folder);
        if self.approved.insert(resolved.clone()) {
            info!(folder = %resolved.display(), "Folder access granted");
            if let Err(e) = self.store.save(&self.approved.to_strings()) {
                warn!(folder = %resolved.display(), error = %e, "Failed to save folder permission");
            }
        }
        resolved
    }

    /// Remove an exact approval. `Ok(None)` when `folder` was not approved.
    ///
    /// The entry is gone from memory even if saving fails.
    pub fn revoke(&mut self, folder: &Path) -> Result<Option<PathBuf>, ConfigError> {
        let resolved = self.resolve(folder);
        if !self.approved.remove(&resolved) {
            return Ok(None);
        }
        info!(folder = %resolved.display(), "Folder access revoked");
        self.store.save(&self.approved.to_strings())?;
        Ok(Some(resolved))
    }

    #[must_use]
    pub fn approved(&self) -> &ApprovedFolderSet {
        &self.approved
    }

    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}
