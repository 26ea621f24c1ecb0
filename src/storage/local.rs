//! Local filesystem storage backend.
//!
//! A directory-oriented store: every `/` in a path is a real directory
//! under a configurable root, and `mkdir`/`rmdir` create and remove real
//! directories.  Object metadata lives in JSON sidecars under
//! `{root}/.meta/`, mirroring the object tree.
//!
//! All writes follow crash-only design: write to temp file, fsync, rename.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::backend::{
    md5_etag, BackendCapabilities, BackendClient, BackendEntry, BackendError, BackendHead,
    BackendObject, BackendResult, ByteRange, EntryKind, ListPage, ListRequest, ListingOrder,
    PutReceipt,
};
use crate::meta::{MetadataProfile, NativeMetadata};

/// Directory holding metadata sidecars.
const META_DIR: &str = ".meta";
/// Directory holding in-flight temp files.
const TMP_DIR: &str = ".tmp";

/// Sidecar record stored next to each object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Sidecar {
    etag: String,
    #[serde(default)]
    metadata: NativeMetadata,
}

/// Stores objects on the local filesystem.
pub struct LocalBackend {
    /// Root directory for all stored objects.
    root: PathBuf,
    /// Shared by writers placing files, exclusive for directory removal.
    tree: tokio::sync::RwLock<()>,
}

impl LocalBackend {
    /// Create a new `LocalBackend` rooted at `root`.
    ///
    /// The directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        std::fs::create_dir_all(root.join(META_DIR))?;
        Ok(Self {
            root,
            tree: tokio::sync::RwLock::new(()),
        })
    }

    /// Resolve a backend path to an absolute file path under `base`.
    ///
    /// Rejects empty segments, `.` and `..` so a path can never escape the
    /// root or alias another path.
    fn resolve_under(base: &Path, path: &str) -> BackendResult<PathBuf> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() || trimmed.starts_with('/') {
            return Err(BackendError::InvalidPath(path.to_string()));
        }
        for segment in trimmed.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(BackendError::InvalidPath(path.to_string()));
            }
        }
        for component in Path::new(trimmed).components() {
            if !matches!(component, Component::Normal(_)) {
                return Err(BackendError::InvalidPath(path.to_string()));
            }
        }
        Ok(base.join(trimmed))
    }

    fn resolve(&self, path: &str) -> BackendResult<PathBuf> {
        let first = path.split('/').next().unwrap_or_default();
        if first == META_DIR || first == TMP_DIR {
            return Err(BackendError::InvalidPath(path.to_string()));
        }
        Self::resolve_under(&self.root, path)
    }

    fn sidecar_path(&self, path: &str) -> BackendResult<PathBuf> {
        let base = Self::resolve_under(&self.root.join(META_DIR), path)?;
        let mut name = base.into_os_string();
        name.push(".json");
        Ok(PathBuf::from(name))
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(TMP_DIR).join(format!("tmp-{}", id))
    }

    /// Write `data` to `target` via temp file, fsync and rename.
    ///
    /// Parent creation and the rename run under the shared tree guard, so
    /// a concurrent prune cannot remove the parent in between.
    async fn write_atomic(&self, target: &Path, data: &[u8]) -> BackendResult<()> {
        let tmp_path = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        let _guard = self.tree.read().await;
        let placed = async {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&tmp_path, target).await
        }
        .await;
        if let Err(e) = placed {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_sidecar(&self, path: &str) -> Sidecar {
        let Ok(sidecar_path) = self.sidecar_path(path) else {
            return Sidecar::default();
        };
        match tokio::fs::read(&sidecar_path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => Sidecar::default(),
        }
    }

    /// Remove now-empty directories between `start` and the top-level
    /// directory of the tree rooted at `base`.  The top level itself is kept.
    async fn prune_empty_parents(base: &Path, start: &Path) {
        let mut current = start.parent().map(Path::to_path_buf);
        while let Some(dir) = current {
            let depth = dir
                .strip_prefix(base)
                .map(|rel| rel.components().count())
                .unwrap_or(0);
            if depth < 2 || tokio::fs::remove_dir(&dir).await.is_err() {
                break;
            }
            current = dir.parent().map(Path::to_path_buf);
        }
    }

    fn relative(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();
        Some(parts.join("/"))
    }

    fn is_internal(name: &str) -> bool {
        name == META_DIR || name == TMP_DIR
    }

    /// Build a listing entry from filesystem metadata alone; the etag is
    /// filled in later by [`Self::fill_etag`].
    fn entry_for(path: String, meta: &std::fs::Metadata) -> BackendEntry {
        let modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        if meta.is_dir() {
            return BackendEntry {
                path,
                kind: EntryKind::Directory,
                size: 0,
                etag: None,
                modified,
            };
        }
        BackendEntry {
            path,
            kind: EntryKind::Object,
            size: meta.len(),
            etag: None,
            modified,
        }
    }

    async fn fill_etag(&self, entry: &mut BackendEntry) {
        if entry.kind == EntryKind::Object {
            let sidecar = self.read_sidecar(&entry.path).await;
            entry.etag = (!sidecar.etag.is_empty()).then_some(sidecar.etag);
        }
    }

    /// True when every path under `dir_prefix` sorts at or before `cursor`.
    fn subtree_exhausted(dir_prefix: &str, cursor: Option<&str>) -> bool {
        match cursor {
            Some(cursor) => dir_prefix < cursor && !cursor.starts_with(dir_prefix),
            None => false,
        }
    }

    /// Collect every object under the deepest directory covered by `prefix`
    /// whose path sorts after `cursor`.
    ///
    /// A prefix that names an object, or that no path could match, yields
    /// nothing.
    async fn walk(&self, prefix: &str, cursor: Option<&str>) -> BackendResult<Vec<BackendEntry>> {
        let start_dir = if prefix.is_empty() {
            Ok(self.root.clone())
        } else if prefix.ends_with('/') {
            self.resolve(prefix)
        } else {
            match prefix.rfind('/') {
                Some(pos) => self.resolve(&prefix[..pos]),
                None => Ok(self.root.clone()),
            }
        };
        let start_dir = match start_dir {
            Ok(dir) => dir,
            Err(BackendError::InvalidPath(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut out = Vec::new();
        let mut stack = vec![start_dir];
        while let Some(dir) = stack.pop() {
            let mut reader = match tokio::fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            while let Some(child) = reader.next_entry().await? {
                let child_path = child.path();
                if dir == self.root
                    && child.file_name().to_str().map(Self::is_internal).unwrap_or(true)
                {
                    continue;
                }
                let Some(rel) = self.relative(&child_path) else {
                    continue;
                };
                let meta = match child.metadata().await {
                    Ok(meta) => meta,
                    // Removed by a concurrent delete.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                if meta.is_dir() {
                    if !Self::subtree_exhausted(&format!("{rel}/"), cursor) {
                        stack.push(child_path);
                    }
                    continue;
                }
                if rel.starts_with(prefix) && cursor.map_or(true, |c| rel.as_str() > c) {
                    out.push(Self::entry_for(rel, &meta));
                }
            }
        }
        Ok(out)
    }

    async fn children(&self, dir_path: &str) -> BackendResult<Vec<BackendEntry>> {
        let trimmed = dir_path.trim_end_matches('/');
        let dir = if trimmed.is_empty() {
            self.root.clone()
        } else {
            self.resolve(trimmed)?
        };
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::NotFound(dir_path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(child) = reader.next_entry().await? {
            let Some(name) = child.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if trimmed.is_empty() && Self::is_internal(&name) {
                continue;
            }
            let path = if trimmed.is_empty() {
                name
            } else {
                format!("{trimmed}/{name}")
            };
            let meta = child.metadata().await?;
            out.push(Self::entry_for(path, &meta));
        }
        Ok(out)
    }
}

impl BackendClient for LocalBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            name: "local",
            listing_order: ListingOrder::Lexicographic,
            anonymous_writes: true,
            directories: true,
            metadata: MetadataProfile::SIDECAR,
        }
    }

    fn put(
        &self,
        path: &str,
        data: Bytes,
        metadata: NativeMetadata,
    ) -> Pin<Box<dyn Future<Output = BackendResult<PutReceipt>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let final_path = self.resolve(&path)?;
            if path.ends_with('/') {
                return Err(BackendError::InvalidPath(path));
            }
            if tokio::fs::metadata(&final_path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)
            {
                return Err(BackendError::AlreadyExists(path));
            }

            let etag = md5_etag(&data);
            let sidecar = Sidecar {
                etag: etag.clone(),
                metadata,
            };
            let sidecar_json = serde_json::to_vec(&sidecar)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

            // Sidecar first: a crash in between leaves a stale sidecar, never
            // an object without one.
            self.write_atomic(&self.sidecar_path(&path)?, &sidecar_json)
                .await?;
            self.write_atomic(&final_path, &data).await?;

            Ok(PutReceipt {
                etag,
                size: data.len() as u64,
                modified: Utc::now(),
            })
        })
    }

    fn get(
        &self,
        path: &str,
        range: Option<ByteRange>,
    ) -> Pin<Box<dyn Future<Output = BackendResult<BackendObject>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let file_path = self.resolve(&path)?;
            let mut file = match tokio::fs::File::open(&file_path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(BackendError::NotFound(path))
                }
                Err(e) => return Err(e.into()),
            };
            let meta = file.metadata().await?;
            if meta.is_dir() {
                return Err(BackendError::NotFound(path));
            }
            let size = meta.len();
            let (start, end) = match range {
                Some(range) => range.resolve_or_err(size)?,
                None => (0, size),
            };
            file.seek(SeekFrom::Start(start)).await?;
            let mut buf = vec![0u8; (end - start) as usize];
            file.read_exact(&mut buf).await?;

            let sidecar = self.read_sidecar(&path).await;
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            Ok(BackendObject {
                data: Bytes::from(buf),
                head: BackendHead {
                    path,
                    kind: EntryKind::Object,
                    size,
                    etag: (!sidecar.etag.is_empty()).then_some(sidecar.etag),
                    modified,
                    metadata: sidecar.metadata,
                },
            })
        })
    }

    fn head(
        &self,
        path: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<BackendHead>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let file_path = self.resolve(&path)?;
            let meta = match tokio::fs::metadata(&file_path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(BackendError::NotFound(path))
                }
                Err(e) => return Err(e.into()),
            };
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            if meta.is_dir() {
                return Ok(BackendHead {
                    path,
                    kind: EntryKind::Directory,
                    size: 0,
                    etag: None,
                    modified,
                    metadata: NativeMetadata::new(),
                });
            }
            let sidecar = self.read_sidecar(&path).await;
            Ok(BackendHead {
                path,
                kind: EntryKind::Object,
                size: meta.len(),
                etag: (!sidecar.etag.is_empty()).then_some(sidecar.etag),
                modified,
                metadata: sidecar.metadata,
            })
        })
    }

    fn delete(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let file_path = self.resolve(&path)?;
            match tokio::fs::metadata(&file_path).await {
                Ok(meta) if meta.is_file() => {}
                Ok(_) => return Err(BackendError::NotFound(path)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(BackendError::NotFound(path))
                }
                Err(e) => return Err(e.into()),
            }
            let sidecar_path = self.sidecar_path(&path)?;
            let _guard = self.tree.write().await;
            tokio::fs::remove_file(&file_path).await?;
            Self::prune_empty_parents(&self.root, &file_path).await;
            if tokio::fs::remove_file(&sidecar_path).await.is_ok() {
                Self::prune_empty_parents(&self.root.join(META_DIR), &sidecar_path).await;
            }
            Ok(())
        })
    }

    fn list(
        &self,
        request: ListRequest,
    ) -> Pin<Box<dyn Future<Output = BackendResult<ListPage>> + Send + '_>> {
        Box::pin(async move {
            let cursor = request.cursor.as_deref();
            let mut entries = if request.recursive {
                self.walk(&request.prefix, cursor).await?
            } else {
                let mut entries = self.children(&request.prefix).await?;
                if let Some(cursor) = cursor {
                    entries.retain(|e| e.path.as_str() > cursor);
                }
                entries
            };
            entries.sort_by(|a, b| a.path.cmp(&b.path));

            let limit = request.limit.max(1);
            let next_cursor = if entries.len() > limit {
                entries.truncate(limit);
                entries.last().map(|e| e.path.clone())
            } else {
                None
            };
            // Sidecars are read only for the entries on this page.
            for entry in entries.iter_mut() {
                self.fill_etag(entry).await;
            }
            Ok(ListPage {
                entries,
                next_cursor,
            })
        })
    }

    fn mkdir(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
        let path = path.trim_end_matches('/').to_string();
        Box::pin(async move {
            let dir = self.resolve(&path)?;
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Err(BackendError::AlreadyExists(path))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tokio::fs::create_dir_all(&dir).await?;
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn rmdir(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
        let path = path.trim_end_matches('/').to_string();
        Box::pin(async move {
            let dir = self.resolve(&path)?;
            let _guard = self.tree.write().await;
            let mut reader = match tokio::fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(BackendError::NotFound(path))
                }
                Err(e) => return Err(e.into()),
            };
            if reader.next_entry().await?.is_some() {
                return Err(BackendError::NotEmpty(path));
            }
            tokio::fs::remove_dir(&dir).await?;
            if let Ok(meta_dir) = Self::resolve_under(&self.root.join(META_DIR), &path) {
                let _ = tokio::fs::remove_dir_all(meta_dir).await;
            }
            Ok(())
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
