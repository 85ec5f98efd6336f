//! Project file access.
//!
//! Every path is relative to the project root. Operations on one path are
//! serialized through a per-path lock and bump a per-path version; a save
//! that names a stale `base_version` is rejected. Reported modification
//! times are strictly increasing per path, even when the filesystem clock
//! is coarser than the rate of saves.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use walkdir::WalkDir;

use crate::error::IdeError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub path: String,
    /// Milliseconds since the Unix epoch.
    pub mtime: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub mtime: u64,
    pub size: u64,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVersion {
    pub path: String,
    pub mtime: u64,
    pub size: u64,
    pub version: u64,
}

#[derive(Debug, Default)]
struct Slot {
    version: u64,
    mtime: u64,
}

pub struct SourceLoader {
    root: PathBuf,
    max_file_size: usize,
    build_dir: PathBuf,
    slots: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<Slot>>>>,
}

impl SourceLoader {
    pub fn new(root: impl Into<PathBuf>, max_file_size: usize, build_dir: impl Into<PathBuf>) -> Self {
        SourceLoader {
            root: root.into(),
            max_file_size,
            build_dir: build_dir.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    /// Absolute path for a project-relative one.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, IdeError> {
        Ok(self.root.join(confine(path)?))
    }

    fn slot(&self, relative: &Path) -> Arc<tokio::sync::Mutex<Slot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(relative.to_path_buf()).or_default().clone()
    }

    /// Drop the slot of a path that was never written and is not on disk,
    /// unless another operation holds it.
    fn forget(&self, relative: &Path, slot: &Arc<tokio::sync::Mutex<Slot>>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let unshared = Arc::strong_count(slot) == 2
            && slots.get(relative).is_some_and(|held| Arc::ptr_eq(held, slot));
        if unshared {
            slots.remove(relative);
        }
    }

    #[cfg(test)]
    fn tracked_paths(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub async fn load(&self, path: &str) -> Result<FileContent, IdeError> {
        let relative = confine(path)?;
        let absolute = self.root.join(&relative);
        let shared = self.slot(&relative);
        let slot = shared.lock().await;

        let metadata = match metadata(&absolute, path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) | Err(IdeError::NotFound(_)) => {
                if slot.version == 0 {
                    self.forget(&relative, &shared);
                }
                return Err(IdeError::NotFound(path.to_string()));
            }
            Err(err) => return Err(err),
        };
        self.check_size(path, metadata.len())?;
        let content = tokio::fs::read_to_string(&absolute)
            .await
            .map_err(|err| IdeError::io(&absolute, err))?;
        Ok(FileContent {
            path: display(&relative),
            size: content.len() as u64,
            content,
            mtime: mtime_ms(&metadata).max(slot.mtime),
            version: slot.version,
        })
    }

    /// Write `content`, creating parent directories as needed.
    pub async fn save(
        &self,
        path: &str,
        content: &str,
        base_version: Option<u64>,
    ) -> Result<FileVersion, IdeError> {
        let relative = confine(path)?;
        // Checked before touching the disk; oversize content is never truncated.
        self.check_size(path, content.len() as u64)?;
        let absolute = self.root.join(&relative);
        let slot = self.slot(&relative);
        let mut slot = slot.lock().await;

        if let Some(expected) = base_version {
            if expected != slot.version {
                log::warn!("rejecting stale save of {path} (base {expected}, current {})", slot.version);
                return Err(IdeError::Conflict {
                    path: path.to_string(),
                    expected,
                    actual: slot.version,
                });
            }
        }

        let previous = match tokio::fs::metadata(&absolute).await {
            Ok(metadata) => mtime_ms(&metadata).max(slot.mtime),
            Err(_) => slot.mtime,
        };
        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| IdeError::io(parent, err))?;
        }
        tokio::fs::write(&absolute, content)
            .await
            .map_err(|err| IdeError::io(&absolute, err))?;
        let mtime = advance_mtime(&absolute, previous).await?;

        slot.version += 1;
        slot.mtime = mtime;
        log::info!("saved {path} ({} bytes, version {})", content.len(), slot.version);
        Ok(FileVersion {
            path: display(&relative),
            mtime,
            size: content.len() as u64,
            version: slot.version,
        })
    }

    /// Create an empty file; fails if it already exists.
    pub async fn create(&self, path: &str) -> Result<FileVersion, IdeError> {
        let relative = confine(path)?;
        let absolute = self.root.join(&relative);
        let slot = self.slot(&relative);
        let mut slot = slot.lock().await;

        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| IdeError::io(parent, err))?;
        }
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&absolute)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::AlreadyExists => IdeError::AlreadyExists(path.to_string()),
                _ => IdeError::io(&absolute, err),
            })?;
        let mtime = advance_mtime(&absolute, slot.mtime).await?;

        slot.version += 1;
        slot.mtime = mtime;
        log::info!("created {path}");
        Ok(FileVersion {
            path: display(&relative),
            mtime,
            size: 0,
            version: slot.version,
        })
    }

    pub async fn delete(&self, path: &str) -> Result<FileVersion, IdeError> {
        let relative = confine(path)?;
        let absolute = self.root.join(&relative);
        let shared = self.slot(&relative);
        let mut slot = shared.lock().await;

        if let Err(err) = tokio::fs::remove_file(&absolute).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(IdeError::io(&absolute, err));
            }
            if slot.version == 0 {
                self.forget(&relative, &shared);
            }
            return Err(IdeError::NotFound(path.to_string()));
        }
        // Deleting is a write too; saves based on the old version go stale.
        slot.version += 1;
        log::info!("deleted {path}");
        Ok(FileVersion {
            path: display(&relative),
            mtime: slot.mtime,
            size: 0,
            version: slot.version,
        })
    }

    /// Every regular file in the project, sorted by path. Hidden entries
    /// and the build directory are skipped.
    pub async fn list(&self) -> Result<Vec<FileEntry>, IdeError> {
        let root = self.root.clone();
        let build_dir = self.build_dir.clone();
        tokio::task::spawn_blocking(move || walk(&root, &build_dir))
            .await
            .map_err(|err| IdeError::Worker(err.to_string()))?
    }

    fn check_size(&self, path: &str, size: u64) -> Result<(), IdeError> {
        if size > self.max_file_size as u64 {
            log::warn!("{path} is {size} bytes (limit {})", self.max_file_size);
            return Err(IdeError::FileTooLarge {
                path: path.to_string(),
                size,
                limit: self.max_file_size,
            });
        }
        Ok(())
    }
}

fn walk(root: &Path, build_dir: &Path) -> Result<Vec<FileEntry>, IdeError> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let hidden = entry.file_name().to_str().is_some_and(|n| n.starts_with('.'));
            !hidden && entry.path().strip_prefix(root).ok() != Some(build_dir)
        });
    for entry in walker {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(root).to_path_buf();
            IdeError::io(path, err.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry
            .metadata()
            .map_err(|err| IdeError::io(entry.path(), err.into()))?;
        if let Ok(relative) = entry.path().strip_prefix(root) {
            entries.push(FileEntry {
                path: display(relative),
                mtime: mtime_ms(&metadata),
                size: metadata.len(),
            });
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// Normalized project-relative path; rejects absolute paths and `..`.
fn confine(path: &str) -> Result<PathBuf, IdeError> {
    let mut relative = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(IdeError::InvalidPath(path.to_string()));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(IdeError::InvalidPath(path.to_string()));
    }
    Ok(relative)
}

fn display(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

async fn metadata(absolute: &Path, path: &str) -> Result<std::fs::Metadata, IdeError> {
    tokio::fs::metadata(absolute).await.map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => IdeError::NotFound(path.to_string()),
        _ => IdeError::io(absolute, err),
    })
}

fn mtime_ms(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

/// Make the file's mtime strictly greater than `previous` (in ms).
async fn advance_mtime(absolute: &Path, previous: u64) -> Result<u64, IdeError> {
    let current = metadata(absolute, &absolute.to_string_lossy()).await?;
    let current = mtime_ms(&current);
    if current > previous {
        return Ok(current);
    }
    let bumped = previous + 1;
    let path = absolute.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options().write(true).open(&path)?;
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_millis(bumped))
    })
    .await
    .map_err(|err| IdeError::Worker(err.to_string()))?
    .map_err(|err| IdeError::io(absolute, err))?;
    Ok(bumped)
}
