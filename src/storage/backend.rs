//! Abstract backend client trait.
//!
//! Every storage backend must implement [`BackendClient`].  The trait works
//! in terms of path-like names (`bucket/key`), opaque byte payloads and the
//! backend's own metadata encoding, so the gateway never needs to know what
//! the underlying medium is.  Failures are reported as [`BackendError`], the
//! backend-native error shape that [`crate::normalize`] turns into the
//! gateway taxonomy.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::StatusCode;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

use crate::meta::{MetadataProfile, NativeMetadata};

/// Backend-native failure.
#[derive(Debug, Error)]
pub enum BackendError {
    /// An HTTP error response with its raw body (possibly empty).
    #[error("backend returned HTTP {status}")]
    Status { status: StatusCode, body: String },

    /// Nothing exists at the path.
    #[error("no such path: {0}")]
    NotFound(String),

    /// Something already exists at the path.
    #[error("path already exists: {0}")]
    AlreadyExists(String),

    /// A directory could not be removed because it still has children.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// The path cannot be represented by this backend.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The requested byte range starts past the end of the object.
    #[error("range start {start} not satisfiable for object of {size} bytes")]
    InvalidRange { start: u64, size: u64 },

    /// The backend's storage limit would be exceeded.
    #[error("capacity exceeded: {requested} bytes requested, limit {limit}")]
    CapacityExceeded { requested: u64, limit: u64 },

    /// The backend has no primitive for this operation.
    #[error("operation not supported by backend: {0}")]
    Unsupported(&'static str),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend did not answer in time.
    #[error("backend request timed out")]
    Timeout,

    /// The request never produced a response (connection refused, reset, ...).
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result alias for backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// Byte range of an object read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset.
    pub start: u64,
    /// Number of bytes; `None` reads to the end.
    pub length: Option<u64>,
}

impl ByteRange {
    /// Resolve against an object of `size` bytes into a half-open range.
    /// Returns `None` when the range starts past the end of a non-empty object.
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        if self.start > size || (self.start == size && size > 0) {
            return None;
        }
        let end = match self.length {
            Some(len) => self.start.saturating_add(len).min(size),
            None => size,
        };
        Some((self.start, end))
    }

    /// Like [`ByteRange::resolve`], failing with [`BackendError::InvalidRange`].
    pub fn resolve_or_err(&self, size: u64) -> BackendResult<(u64, u64)> {
        self.resolve(size).ok_or(BackendError::InvalidRange {
            start: self.start,
            size,
        })
    }
}

/// Whether a path holds an object or is a directory/container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Object,
    Directory,
}

/// Attributes of a single path.
#[derive(Debug, Clone)]
pub struct BackendHead {
    /// Full backend path.
    pub path: String,
    /// Object or directory.
    pub kind: EntryKind,
    /// Payload size (0 for directories).
    pub size: u64,
    /// Quoted content hash, if the backend reports one.
    pub etag: Option<String>,
    /// Last modification time.
    pub modified: DateTime<Utc>,
    /// Backend-native metadata.
    pub metadata: NativeMetadata,
}

/// A read payload plus the attributes of the full object.
#[derive(Debug, Clone)]
pub struct BackendObject {
    /// Bytes of the requested range (or the whole object).
    pub data: Bytes,
    /// Attributes of the whole object.
    pub head: BackendHead,
}

/// Outcome of a successful write.
#[derive(Debug, Clone)]
pub struct PutReceipt {
    /// Quoted MD5 ETag of the stored payload.
    pub etag: String,
    /// Stored size in bytes.
    pub size: u64,
    /// Modification time recorded by the backend.
    pub modified: DateTime<Utc>,
}

/// One listing entry.
#[derive(Debug, Clone)]
pub struct BackendEntry {
    /// Full backend path.
    pub path: String,
    /// Object or directory.
    pub kind: EntryKind,
    /// Payload size.
    pub size: u64,
    /// Quoted content hash, if known.
    pub etag: Option<String>,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// A listing request.
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    /// With `recursive`, a plain string prefix every returned object path
    /// starts with.  Without it, the directory whose immediate children are
    /// listed (`""` for the root).
    pub prefix: String,
    /// Backend-issued cursor from a previous page.
    pub cursor: Option<String>,
    /// Maximum entries per page.
    pub limit: usize,
    /// Walk the whole subtree, returning objects only.
    pub recursive: bool,
}

/// One page of listing results.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Entries in this page.
    pub entries: Vec<BackendEntry>,
    /// Cursor for the next page; `None` when the listing is exhausted.
    pub next_cursor: Option<String>,
}

/// Order in which a backend's recursive listing yields paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingOrder {
    /// Ascending byte order across pages.
    Lexicographic,
    /// No ordering guarantee; the caller must sort.
    Unordered,
}

/// Static description of what a backend can do.
#[derive(Debug, Clone)]
pub struct BackendCapabilities {
    /// Short backend name for logs.
    pub name: &'static str,
    /// Ordering of recursive listings.
    pub listing_order: ListingOrder,
    /// Whether the gateway may perform writes on behalf of anonymous callers.
    pub anonymous_writes: bool,
    /// Whether `mkdir`/`rmdir` create real directories.
    pub directories: bool,
    /// Native metadata encoding.
    pub metadata: MetadataProfile,
}

/// Async backend client contract.
pub trait BackendClient: Send + Sync + 'static {
    /// Describe this backend.
    fn capabilities(&self) -> BackendCapabilities;

    /// Write `data` to `path` with native `metadata`, replacing any object there.
    fn put(
        &self,
        path: &str,
        data: Bytes,
        metadata: NativeMetadata,
    ) -> Pin<Box<dyn Future<Output = BackendResult<PutReceipt>> + Send + '_>>;

    /// Read the object at `path`, optionally restricted to `range`.
    fn get(
        &self,
        path: &str,
        range: Option<ByteRange>,
    ) -> Pin<Box<dyn Future<Output = BackendResult<BackendObject>> + Send + '_>>;

    /// Read the attributes of `path`. `NotFound` if absent.
    fn head(
        &self,
        path: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<BackendHead>> + Send + '_>>;

    /// Delete the object at `path`. `NotFound` if absent.
    fn delete(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>>;

    /// List one page of entries.
    fn list(
        &self,
        request: ListRequest,
    ) -> Pin<Box<dyn Future<Output = BackendResult<ListPage>> + Send + '_>>;

    /// Create a directory or container at `path`. `AlreadyExists` if present.
    fn mkdir(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>>;

    /// Remove the empty directory or container at `path`.
    fn rmdir(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>>;
}

/// Compute the quoted MD5 ETag of `data`.
pub fn md5_etag(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

/// Parent directory of a `/`-separated path (`""` for top-level names).
pub fn parent_dir(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(pos) => &path[..pos],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_etag_hello() {
        assert_eq!(md5_etag(b"hello"), "\"5d41402abc4b2a76b9719d911017c592\"");
    }

    #[test]
    fn test_md5_etag_empty() {
        assert_eq!(md5_etag(b""), "\"d41d8cd98f00b204e9800998ecf8427e\"");
    }

    #[test]
    fn test_range_resolve() {
        let full = ByteRange { start: 0, length: None };
        assert_eq!(full.resolve(10), Some((0, 10)));
        assert_eq!(full.resolve(0), Some((0, 0)));

        let mid = ByteRange { start: 2, length: Some(3) };
        assert_eq!(mid.resolve(10), Some((2, 5)));

        let overlong = ByteRange { start: 8, length: Some(100) };
        assert_eq!(overlong.resolve(10), Some((8, 10)));

        let past_end = ByteRange { start: 10, length: None };
        assert_eq!(past_end.resolve(10), None);
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("bucket"), "");
        assert_eq!(parent_dir("bucket/key"), "bucket");
        assert_eq!(parent_dir("bucket/a/b/c.txt"), "bucket/a/b");
        assert_eq!(parent_dir("bucket/dir/"), "bucket");
    }
}
