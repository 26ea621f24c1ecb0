//! In-memory storage backend.
//!
//! A flat blob store with named containers.  Objects live in a
//! `BTreeMap` keyed by full path, so recursive listings come out in byte
//! order and the last returned path doubles as the native continuation
//! token.  Containers are recorded explicitly by `mkdir`; object paths do
//! not need an enclosing container.
//!
//! A configurable memory limit (`max_size_bytes`) caps total stored bytes.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;

use super::backend::{
    md5_etag, parent_dir, BackendCapabilities, BackendClient, BackendEntry, BackendError,
    BackendHead, BackendObject, BackendResult, ByteRange, EntryKind, ListPage, ListRequest,
    ListingOrder, PutReceipt,
};
use crate::meta::{MetadataProfile, NativeMetadata};

#[derive(Debug, Clone)]
struct StoredEntry {
    data: Bytes,
    etag: String,
    metadata: NativeMetadata,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, StoredEntry>,
    containers: BTreeMap<String, DateTime<Utc>>,
    current_size: u64,
}

/// In-memory storage backend.
///
/// All state sits behind a single `tokio::sync::RwLock`; no lock is held
/// across an await point outside the backend itself.
pub struct MemoryBackend {
    inner: tokio::sync::RwLock<Inner>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
}

impl MemoryBackend {
    /// Create a new `MemoryBackend` with an optional byte limit (0 = unlimited).
    pub fn new(max_size_bytes: u64) -> Self {
        Self {
            inner: tokio::sync::RwLock::new(Inner::default()),
            max_size_bytes,
        }
    }

    /// Total bytes currently stored.
    pub async fn stored_bytes(&self) -> u64 {
        self.inner.read().await.current_size
    }

    fn validate_path(path: &str) -> BackendResult<()> {
        if path.is_empty() || path.starts_with('/') {
            return Err(BackendError::InvalidPath(path.to_string()));
        }
        Ok(())
    }

    fn head_of(path: &str, entry: &StoredEntry) -> BackendHead {
        BackendHead {
            path: path.to_string(),
            kind: EntryKind::Object,
            size: entry.data.len() as u64,
            etag: Some(entry.etag.clone()),
            modified: entry.modified,
            metadata: entry.metadata.clone(),
        }
    }

    fn entry_of(path: &str, entry: &StoredEntry) -> BackendEntry {
        BackendEntry {
            path: path.to_string(),
            kind: EntryKind::Object,
            size: entry.data.len() as u64,
            etag: Some(entry.etag.clone()),
            modified: entry.modified,
        }
    }

    fn list_recursive(inner: &Inner, request: &ListRequest) -> ListPage {
        use std::ops::Bound;

        let limit = request.limit.max(1);
        let prefix = request.prefix.as_str();
        // Seek to whichever of the prefix and the cursor sorts later.
        let start = match request.cursor.as_deref() {
            Some(after) if after >= prefix => Bound::Excluded(after),
            _ => Bound::Included(prefix),
        };
        let mut entries = Vec::new();
        let mut next_cursor = None;

        for (path, entry) in inner
            .objects
            .range::<str, _>((start, Bound::Unbounded))
            .take_while(|(p, _)| p.starts_with(prefix))
        {
            if entries.len() == limit {
                next_cursor = entries.last().map(|e: &BackendEntry| e.path.clone());
                break;
            }
            entries.push(Self::entry_of(path, entry));
        }
        ListPage {
            entries,
            next_cursor,
        }
    }

    fn list_children(inner: &Inner, request: &ListRequest) -> ListPage {
        let dir = request.prefix.trim_end_matches('/');
        let mut children: BTreeMap<String, BackendEntry> = BTreeMap::new();

        for (path, modified) in &inner.containers {
            if parent_dir(path) == dir && path != dir {
                children.insert(
                    path.clone(),
                    BackendEntry {
                        path: path.clone(),
                        kind: EntryKind::Directory,
                        size: 0,
                        etag: None,
                        modified: *modified,
                    },
                );
            }
        }

        let scope = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        for (path, entry) in inner.objects.iter().filter(|(p, _)| p.starts_with(&scope)) {
            let rest = &path[scope.len()..];
            match rest.find('/') {
                None => {
                    children.insert(path.clone(), Self::entry_of(path, entry));
                }
                Some(pos) => {
                    let child = format!("{scope}{}", &rest[..pos]);
                    children.entry(child.clone()).or_insert(BackendEntry {
                        path: child,
                        kind: EntryKind::Directory,
                        size: 0,
                        etag: None,
                        modified: entry.modified,
                    });
                }
            }
        }

        let limit = request.limit.max(1);
        let after = request.cursor.clone().unwrap_or_default();
        let mut remaining = children.into_values().filter(|e| e.path > after);
        let entries: Vec<BackendEntry> = remaining.by_ref().take(limit).collect();
        let next_cursor = if remaining.next().is_some() {
            entries.last().map(|e| e.path.clone())
        } else {
            None
        };
        ListPage {
            entries,
            next_cursor,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(0)
    }
}

impl BackendClient for MemoryBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            name: "memory",
            listing_order: ListingOrder::Lexicographic,
            anonymous_writes: true,
            directories: false,
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
            Self::validate_path(&path)?;
            let etag = md5_etag(&data);
            let size = data.len() as u64;
            let modified = Utc::now();

            let mut inner = self.inner.write().await;
            let replaced = inner
                .objects
                .get(&path)
                .map(|e| e.data.len() as u64)
                .unwrap_or(0);
            let projected = inner.current_size - replaced + size;
            if self.max_size_bytes > 0 && projected > self.max_size_bytes {
                return Err(BackendError::CapacityExceeded {
                    requested: size,
                    limit: self.max_size_bytes,
                });
            }
            inner.current_size = projected;
            inner.objects.insert(
                path,
                StoredEntry {
                    data,
                    etag: etag.clone(),
                    metadata,
                    modified,
                },
            );
            Ok(PutReceipt {
                etag,
                size,
                modified,
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
            let inner = self.inner.read().await;
            let entry = inner
                .objects
                .get(&path)
                .ok_or_else(|| BackendError::NotFound(path.clone()))?;
            let data = match range {
                Some(range) => {
                    let (start, end) = range.resolve_or_err(entry.data.len() as u64)?;
                    entry.data.slice(start as usize..end as usize)
                }
                None => entry.data.clone(),
            };
            Ok(BackendObject {
                data,
                head: Self::head_of(&path, entry),
            })
        })
    }

    fn head(
        &self,
        path: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<BackendHead>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let inner = self.inner.read().await;
            if let Some(entry) = inner.objects.get(&path) {
                return Ok(Self::head_of(&path, entry));
            }
            if let Some(created) = inner.containers.get(&path) {
                return Ok(BackendHead {
                    path: path.clone(),
                    kind: EntryKind::Directory,
                    size: 0,
                    etag: None,
                    modified: *created,
                    metadata: NativeMetadata::new(),
                });
            }
            Err(BackendError::NotFound(path))
        })
    }

    fn delete(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            match inner.objects.remove(&path) {
                Some(entry) => {
                    inner.current_size = inner.current_size.saturating_sub(entry.data.len() as u64);
                    Ok(())
                }
                None => Err(BackendError::NotFound(path)),
            }
        })
    }

    fn list(
        &self,
        request: ListRequest,
    ) -> Pin<Box<dyn Future<Output = BackendResult<ListPage>> + Send + '_>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            if request.recursive {
                Ok(Self::list_recursive(&inner, &request))
            } else {
                Ok(Self::list_children(&inner, &request))
            }
        })
    }

    fn mkdir(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
        let path = path.trim_end_matches('/').to_string();
        Box::pin(async move {
            Self::validate_path(&path)?;
            let mut inner = self.inner.write().await;
            if inner.containers.contains_key(&path) || inner.objects.contains_key(&path) {
                return Err(BackendError::AlreadyExists(path));
            }
            inner.containers.insert(path, Utc::now());
            Ok(())
        })
    }

    fn rmdir(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
        let path = path.trim_end_matches('/').to_string();
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            if !inner.containers.contains_key(&path) {
                return Err(BackendError::NotFound(path));
            }
            let scope = format!("{path}/");
            let occupied = inner.objects.keys().any(|k| k.starts_with(&scope))
                || inner.containers.keys().any(|k| k.starts_with(&scope));
            if occupied {
                return Err(BackendError::NotEmpty(path));
            }
            inner.containers.remove(&path);
            Ok(())
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
