//! Manta storage backend.
//!
//! Speaks the Joyent Manta REST conventions using `reqwest`:
//!
//!   Paths:       `{endpoint}/{account}/stor/{bucket}/{key}`
//!   Directories: `PUT` with `Content-Type: application/json; type=directory`
//!   Listing:     `GET` on a directory returns newline-delimited JSON entries,
//!                paged with `?marker=&limit=`
//!   Metadata:    `m-*` request/response headers
//!
//! Manta requires every parent directory of an object to exist, so `put`
//! creates missing ancestors and retries once.  Recursive listings walk the
//! directory tree and are therefore reported as [`ListingOrder::Unordered`].
//!
//! Requests are signed by a pluggable [`RequestSigner`].  Without one they
//! go out anonymously, which only works for public areas.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

use super::backend::{
    md5_etag, parent_dir, BackendCapabilities, BackendClient, BackendEntry, BackendError,
    BackendHead, BackendObject, BackendResult, ByteRange, EntryKind, ListPage, ListRequest,
    ListingOrder, PutReceipt,
};
use crate::meta::{MetadataProfile, NativeMetadata};

/// Public Manta endpoint used when none is configured.
pub const DEFAULT_MANTA_URL: &str = "https://us-east.manta.joyent.com";

/// Content type Manta uses to mark directories.
const DIRECTORY_CONTENT_TYPE: &str = "application/json; type=directory";

/// Largest page Manta will return for a directory listing.
const MAX_DIR_PAGE: usize = 1024;

/// Encode everything except unreserved characters and `/`.
const MANTA_PATH_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Produces the `Authorization` header for a Manta request.
///
/// Manta's HTTP Signature scheme signs the `Date` header, so the signer gets
/// exactly the date string the request will carry.
pub trait RequestSigner: Send + Sync + 'static {
    fn authorization(&self, date: &str) -> BackendResult<String>;
}

/// One line of a Manta directory listing.
#[derive(Debug, Clone, Deserialize)]
struct DirEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    mtime: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    etag: Option<String>,
}

/// Backend that talks to a Manta object store.
pub struct MantaBackend {
    /// HTTP client for Manta REST calls.
    client: reqwest::Client,
    /// Endpoint without trailing slash.
    endpoint: String,
    /// Account owning the `stor` namespace.
    account: String,
    /// Request signer; `None` sends anonymous requests.
    signer: Option<Arc<dyn RequestSigner>>,
}

impl MantaBackend {
    /// Create a new Manta backend.
    pub fn new(
        endpoint: &str,
        account: &str,
        timeout_secs: u64,
        signer: Option<Arc<dyn RequestSigner>>,
    ) -> anyhow::Result<Self> {
        if account.is_empty() {
            return Err(anyhow::anyhow!("Manta account name must not be empty"));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        let endpoint = if endpoint.is_empty() {
            DEFAULT_MANTA_URL
        } else {
            endpoint
        };
        info!(
            "Manta backend initialized: endpoint={} account={} signed={}",
            endpoint,
            account,
            signer.is_some()
        );

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            account: account.to_string(),
            signer,
        })
    }

    /// Build the full URL for a path under the account's `stor` tree.
    fn object_url(&self, path: &str) -> String {
        let encoded =
            percent_encoding::utf8_percent_encode(path.trim_matches('/'), &MANTA_PATH_ENCODE_SET)
                .to_string();
        if encoded.is_empty() {
            format!("{}/{}/stor", self.endpoint, self.account)
        } else {
            format!("{}/{}/stor/{}", self.endpoint, self.account, encoded)
        }
    }

    /// Attach `Date` and, when configured, `Authorization`, then send.
    async fn send(&self, req: reqwest::RequestBuilder) -> BackendResult<reqwest::Response> {
        let date = httpdate::fmt_http_date(SystemTime::now());
        let mut req = req.header("Date", &date);
        if let Some(signer) = &self.signer {
            req = req.header("Authorization", signer.authorization(&date)?);
        }
        req.send().await.map_err(transport_error)
    }

    /// Turn a non-success response into a [`BackendError::Status`].
    async fn status_error(resp: reqwest::Response) -> BackendError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        BackendError::Status { status, body }
    }

    async fn put_once(
        &self,
        path: &str,
        data: &Bytes,
        metadata: &NativeMetadata,
    ) -> BackendResult<reqwest::Response> {
        let mut hasher = Md5::new();
        hasher.update(data);
        let content_md5 = BASE64_STANDARD.encode(hasher.finalize());

        let mut req = self
            .client
            .put(self.object_url(path))
            .header("Content-MD5", content_md5)
            .body(data.clone());
        for (key, value) in metadata {
            req = req.header(key.as_str(), value.as_str());
        }
        self.send(req).await
    }

    /// Create directory `dir` and all of its ancestors, outermost first.
    /// `PutDirectory` is idempotent in Manta so existing ones are fine.
    async fn ensure_dirs(&self, dir: &str) -> BackendResult<()> {
        let mut current = String::new();
        for segment in dir.split('/').filter(|s| !s.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            let resp = self
                .send(
                    self.client
                        .put(self.object_url(&current))
                        .header("Content-Type", DIRECTORY_CONTENT_TYPE),
                )
                .await?;
            if !resp.status().is_success() {
                return Err(Self::status_error(resp).await);
            }
        }
        Ok(())
    }

    /// Fetch one page of a directory's entries, starting after `marker`.
    async fn list_dir(
        &self,
        dir: &str,
        marker: Option<&str>,
        limit: usize,
    ) -> BackendResult<Vec<DirEntry>> {
        // Manta's marker is inclusive, so ask for one extra and drop it.
        let mut query: Vec<(&str, String)> =
            vec![("limit", (limit + 1).min(MAX_DIR_PAGE).to_string())];
        if let Some(marker) = marker {
            query.push(("marker", marker.to_string()));
        }
        let resp = self
            .send(self.client.get(self.object_url(dir)).query(&query))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(dir.to_string()));
        }
        if !resp.status().is_success() {
            return Err(Self::status_error(resp).await);
        }
        let body = resp.text().await.map_err(transport_error)?;
        let mut entries = parse_listing(&body)?;
        if let Some(marker) = marker {
            entries.retain(|e| e.name.as_str() > marker);
        }
        entries.truncate(limit);
        Ok(entries)
    }

    /// Every entry of a directory, following `marker` pages to the end.
    async fn list_dir_all(&self, dir: &str) -> BackendResult<Vec<DirEntry>> {
        let mut out = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self.list_dir(dir, marker.as_deref(), MAX_DIR_PAGE - 1).await?;
            let full = page.len() == MAX_DIR_PAGE - 1;
            marker = page.last().map(|e| e.name.clone());
            out.extend(page);
            if !full {
                return Ok(out);
            }
        }
    }

    /// Walk the tree below the deepest directory covered by `prefix`.
    async fn walk(&self, prefix: &str) -> BackendResult<Vec<BackendEntry>> {
        let start = if prefix.ends_with('/') {
            prefix.trim_end_matches('/').to_string()
        } else {
            parent_dir(prefix).to_string()
        };

        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            let entries = match self.list_dir_all(&dir).await {
                Ok(entries) => entries,
                Err(BackendError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            for entry in entries {
                let path = join_path(&dir, &entry.name);
                if entry.kind == "directory" {
                    // Only descend where objects under `prefix` can live.
                    let as_dir = format!("{path}/");
                    if as_dir.starts_with(prefix) || prefix.starts_with(&as_dir) {
                        stack.push(path);
                    }
                } else if path.starts_with(prefix) {
                    out.push(to_backend_entry(path, &entry));
                }
            }
        }
        debug!("Manta walk under '{}' found {} objects", prefix, out.len());
        Ok(out)
    }

    /// Remove empty directories between `path` and its top-level directory.
    async fn prune_empty_parents(&self, path: &str) {
        let mut dir = parent_dir(path).to_string();
        while dir.contains('/') {
            match self.send(self.client.delete(self.object_url(&dir))).await {
                Ok(resp) if resp.status().is_success() => {}
                _ => break,
            }
            dir = parent_dir(&dir).to_string();
        }
    }
}

impl BackendClient for MantaBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            name: "manta",
            listing_order: ListingOrder::Unordered,
            anonymous_writes: false,
            directories: true,
            metadata: MetadataProfile::MANTA_HEADERS,
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
            let mut resp = self.put_once(&path, &data, &metadata).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                let err = Self::status_error(resp).await;
                let missing_parent = matches!(&err, BackendError::Status { body, .. }
                    if body.contains("DirectoryDoesNotExist"));
                if !missing_parent {
                    return Err(err);
                }
                debug!("Creating parent directories for {}", path);
                self.ensure_dirs(parent_dir(&path)).await?;
                resp = self.put_once(&path, &data, &metadata).await?;
            }
            if !resp.status().is_success() {
                return Err(Self::status_error(resp).await);
            }
            let modified = header_time(resp.headers(), "last-modified").unwrap_or_else(Utc::now);
            Ok(PutReceipt {
                etag: md5_etag(&data),
                size: data.len() as u64,
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
            if matches!(range, Some(ByteRange { length: Some(0), .. })) {
                let head = self.head(&path).await?;
                if let Some(range) = range {
                    range.resolve_or_err(head.size)?;
                }
                return Ok(BackendObject {
                    data: Bytes::new(),
                    head,
                });
            }

            let mut req = self.client.get(self.object_url(&path));
            if let Some(range) = range {
                req = req.header("Range", range_header(&range));
            }
            let resp = self.send(req).await?;
            match resp.status() {
                StatusCode::NOT_FOUND => return Err(BackendError::NotFound(path)),
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    let size = content_range_total(resp.headers()).unwrap_or(0);
                    return Err(BackendError::InvalidRange {
                        start: range.map(|r| r.start).unwrap_or(0),
                        size,
                    });
                }
                s if !s.is_success() => return Err(Self::status_error(resp).await),
                _ => {}
            }

            let partial = resp.status() == StatusCode::PARTIAL_CONTENT;
            let mut head = head_from_headers(&path, resp.headers());
            if partial {
                if let Some(total) = content_range_total(resp.headers()) {
                    head.size = total;
                }
            }
            let mut data = resp.bytes().await.map_err(transport_error)?;
            if !partial {
                head.size = data.len() as u64;
                if let Some(range) = range {
                    let (start, end) = range.resolve_or_err(head.size)?;
                    data = data.slice(start as usize..end as usize);
                }
            }
            Ok(BackendObject { data, head })
        })
    }

    fn head(
        &self,
        path: &str,
    ) -> Pin<Box<dyn Future<Output = BackendResult<BackendHead>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let resp = self.send(self.client.head(self.object_url(&path))).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Err(BackendError::NotFound(path));
            }
            if !resp.status().is_success() {
                return Err(Self::status_error(resp).await);
            }
            Ok(head_from_headers(&path, resp.headers()))
        })
    }

    fn delete(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
        let path = path.to_string();
        Box::pin(async move {
            let resp = self.send(self.client.delete(self.object_url(&path))).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Err(BackendError::NotFound(path));
            }
            if !resp.status().is_success() {
                return Err(Self::status_error(resp).await);
            }
            self.prune_empty_parents(&path).await;
            Ok(())
        })
    }

    fn list(
        &self,
        request: ListRequest,
    ) -> Pin<Box<dyn Future<Output = BackendResult<ListPage>> + Send + '_>> {
        Box::pin(async move {
            if request.recursive {
                // Unordered: everything in one page, the caller sorts.
                let entries = self.walk(&request.prefix).await?;
                return Ok(ListPage {
                    entries,
                    next_cursor: None,
                });
            }

            let dir = request.prefix.trim_end_matches('/');
            let limit = request.limit.clamp(1, MAX_DIR_PAGE - 1);
            let page = self
                .list_dir(dir, request.cursor.as_deref(), limit)
                .await?;
            let next_cursor = if page.len() == limit {
                page.last().map(|e| e.name.clone())
            } else {
                None
            };
            let entries = page
                .iter()
                .map(|e| to_backend_entry(join_path(dir, &e.name), e))
                .collect();
            Ok(ListPage {
                entries,
                next_cursor,
            })
        })
    }

    fn mkdir(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
        let path = path.trim_end_matches('/').to_string();
        Box::pin(async move {
            // PutDirectory succeeds on an existing directory; check first so
            // callers can rely on AlreadyExists.
            let resp = self.send(self.client.head(self.object_url(&path))).await?;
            if resp.status().is_success() {
                return Err(BackendError::AlreadyExists(path));
            }
            if resp.status() != StatusCode::NOT_FOUND {
                return Err(Self::status_error(resp).await);
            }
            self.ensure_dirs(&path).await
        })
    }

    fn rmdir(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
        let path = path.trim_end_matches('/').to_string();
        Box::pin(async move {
            let resp = self.send(self.client.delete(self.object_url(&path))).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Err(BackendError::NotFound(path));
            }
            if !resp.status().is_success() {
                let err = Self::status_error(resp).await;
                if matches!(&err, BackendError::Status { body, .. } if body.contains("DirectoryNotEmpty"))
                {
                    return Err(BackendError::NotEmpty(path));
                }
                return Err(err);
            }
            Ok(())
        })
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Transport(e.to_string())
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Parse a newline-delimited JSON directory listing.
fn parse_listing(body: &str) -> BackendResult<Vec<DirEntry>> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str::<DirEntry>(line).map_err(|e| BackendError::Status {
                status: StatusCode::BAD_GATEWAY,
                body: format!("malformed directory listing line: {e}"),
            })
        })
        .collect()
}

fn to_backend_entry(path: String, entry: &DirEntry) -> BackendEntry {
    let modified = entry
        .mtime
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    if entry.kind == "directory" {
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
        size: entry.size.unwrap_or(0),
        etag: entry.etag.as_ref().map(|e| format!("\"{}\"", e.trim_matches('"'))),
        modified,
    }
}

fn range_header(range: &ByteRange) -> String {
    match range.length {
        Some(len) => format!("bytes={}-{}", range.start, range.start + len.saturating_sub(1)),
        None => format!("bytes={}-", range.start),
    }
}

/// Total object size from `Content-Range: bytes a-b/total`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get("content-range")?.to_str().ok()?;
    value.rsplit('/').next()?.trim().parse().ok()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_time(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    let value = header_str(headers, name)?;
    httpdate::parse_http_date(value).ok().map(DateTime::<Utc>::from)
}

/// Quoted hex ETag from a base64 `content-md5` header.
fn md5_header_etag(headers: &HeaderMap) -> Option<String> {
    let raw = BASE64_STANDARD
        .decode(header_str(headers, "content-md5")?)
        .ok()?;
    Some(format!("\"{}\"", hex::encode(raw)))
}

fn head_from_headers(path: &str, headers: &HeaderMap) -> BackendHead {
    let content_type = header_str(headers, "content-type").unwrap_or_default();
    let modified = header_time(headers, "last-modified").unwrap_or_else(Utc::now);
    if content_type.contains("type=directory") {
        return BackendHead {
            path: path.to_string(),
            kind: EntryKind::Directory,
            size: 0,
            etag: None,
            modified,
            metadata: NativeMetadata::new(),
        };
    }

    let mut metadata = NativeMetadata::new();
    for (name, value) in headers {
        let name = name.as_str();
        if name == "content-type" || name.starts_with("m-") {
            if let Ok(value) = value.to_str() {
                metadata.insert(name.to_string(), value.to_string());
            }
        }
    }
    let etag = md5_header_etag(headers).or_else(|| {
        header_str(headers, "etag").map(|e| format!("\"{}\"", e.trim_matches('"')))
    });
    BackendHead {
        path: path.to_string(),
        kind: EntryKind::Object,
        size: header_str(headers, "content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        etag,
        modified,
        metadata,
    }
}

// ── Tests ───────────────────────────────────────────────────────────
