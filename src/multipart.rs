//! Multipart upload coordination.
//!
//! Backends have no multipart primitive, so uploads are emulated: each part
//! is staged as its own backend object under
//! `.bleepgate/multipart/{upload_id}/{part:05}.{nonce}` and completion
//! concatenates the verified parts into the final object.
//!
//! Sessions live in memory only.  Staged data of sessions lost to a restart
//! is reclaimed by [`Coordinator::purge_orphaned`].
//!
//! Locking: the session table lock is held only for lookup, insert and
//! remove.  Each session's own mutex guards its part map; `complete` holds
//! it for the whole assembly so no part can change underneath it.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::RequestContext;
use crate::errors::{ErrorKind, GatewayError, GatewayResult};
use crate::listing::clamp_limit;
use crate::meta::NativeMetadata;
use crate::metrics;
use crate::storage::backend::{BackendClient, EntryKind, ListRequest, PutReceipt};

/// Backend directory holding staged parts.
pub const STAGING_ROOT: &str = ".bleepgate/multipart";

/// Highest part number S3 allows.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Lifecycle of a multipart upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Initiated,
    Uploading,
    Completed,
    Aborted,
}

impl UploadState {
    fn is_open(self) -> bool {
        matches!(self, UploadState::Initiated | UploadState::Uploading)
    }
}

/// A staged part as reported to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct PartInfo {
    pub part_number: u32,
    pub size: u64,
    /// Quoted MD5 of the part payload.
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// One entry of a completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Clone)]
struct StagedPart {
    info: PartInfo,
    path: String,
}

#[derive(Debug)]
struct SessionState {
    state: UploadState,
    parts: BTreeMap<u32, StagedPart>,
}

/// One multipart upload session.
#[derive(Debug)]
pub struct Session {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub initiated: DateTime<Utc>,
    /// Native metadata applied to the assembled object.
    metadata: NativeMetadata,
    inner: tokio::sync::Mutex<SessionState>,
}

impl Session {
    pub async fn state(&self) -> UploadState {
        self.inner.lock().await.state
    }
}

/// An in-progress upload as listed by `list_uploads`.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadSummary {
    pub upload_id: String,
    pub key: String,
    pub initiated: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadListing {
    pub uploads: Vec<UploadSummary>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_key_marker: Option<String>,
    pub next_upload_id_marker: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PartListing {
    pub parts: Vec<PartInfo>,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<u32>,
}

/// Result of a successful completion.
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub bucket: String,
    pub key: String,
    /// Composite ETag `"{md5 of part md5s}-{N}"`.
    pub etag: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Filters for [`Coordinator::list_uploads`].
#[derive(Debug, Clone, Default)]
pub struct UploadQuery {
    pub prefix: String,
    pub key_marker: String,
    pub upload_id_marker: String,
    pub delimiter: String,
    pub max_uploads: usize,
}

/// Owns the session table and drives the upload lifecycle.
pub struct Coordinator {
    backend: Arc<dyn BackendClient>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Minimum size of every part but the last (0 disables the check).
    min_part_size: u64,
}

impl Coordinator {
    pub fn new(backend: Arc<dyn BackendClient>, min_part_size: u64) -> Self {
        Self {
            backend,
            sessions: RwLock::new(HashMap::new()),
            min_part_size,
        }
    }

    /// Number of sessions currently open.
    pub fn session_count(&self) -> usize {
        self.sessions.read().expect("rwlock poisoned").len()
    }

    /// True when some open session targets `bucket`.
    pub fn has_uploads(&self, bucket: &str) -> bool {
        self.sessions
            .read()
            .expect("rwlock poisoned")
            .values()
            .any(|s| s.bucket == bucket)
    }

    fn staging_dir(upload_id: &str) -> String {
        format!("{STAGING_ROOT}/{upload_id}")
    }

    fn staging_path(upload_id: &str, part_number: u32) -> String {
        let nonce = uuid::Uuid::new_v4().simple();
        format!("{STAGING_ROOT}/{upload_id}/{part_number:05}.{nonce}")
    }

    /// Start a session for `bucket/key`. `metadata` is already translated.
    pub fn initiate(&self, bucket: &str, key: &str, metadata: NativeMetadata) -> String {
        let upload_id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Session {
            upload_id: upload_id.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            initiated: Utc::now(),
            metadata,
            inner: tokio::sync::Mutex::new(SessionState {
                state: UploadState::Initiated,
                parts: BTreeMap::new(),
            }),
        });
        let count = {
            let mut sessions = self.sessions.write().expect("rwlock poisoned");
            sessions.insert(upload_id.clone(), session);
            sessions.len()
        };
        metrics::set_multipart_sessions(count);
        info!("Initiated multipart upload {} for {}/{}", upload_id, bucket, key);
        upload_id
    }

    /// Look up an open session, checking it belongs to `bucket/key`.
    pub fn session(&self, bucket: &str, key: &str, upload_id: &str) -> GatewayResult<Arc<Session>> {
        let sessions = self.sessions.read().expect("rwlock poisoned");
        match sessions.get(upload_id) {
            Some(s) if s.bucket == bucket && s.key == key => Ok(Arc::clone(s)),
            _ => Err(GatewayError::not_found(format!(
                "no such upload: {upload_id}"
            ))),
        }
    }

    fn remove(&self, upload_id: &str) {
        let count = {
            let mut sessions = self.sessions.write().expect("rwlock poisoned");
            sessions.remove(upload_id);
            sessions.len()
        };
        metrics::set_multipart_sessions(count);
    }

    /// Delete staged objects, logging failures.
    async fn release(&self, ctx: &RequestContext, paths: Vec<String>) {
        for path in paths {
            match ctx.run(self.backend.delete(&path)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to release staged part {}: {}", path, e),
            }
        }
    }

    /// Remove an emptied staging directory, logging failures.
    async fn remove_staging_dir(&self, ctx: &RequestContext, dir: &str) {
        match ctx.run(self.backend.rmdir(dir)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staging directory {}: {}", dir, e),
        }
    }

    /// Stage one part. Re-uploading a part number replaces the previous one.
    #[allow(clippy::too_many_arguments)]
    pub async fn put_part(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
        md5_hex: Option<&str>,
        sha256_hex: Option<&str>,
    ) -> GatewayResult<PartInfo> {
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(GatewayError::invalid_argument(format!(
                "part number must be between 1 and {MAX_PART_NUMBER}, got {part_number}"
            )));
        }
        verify_digests(&data, md5_hex, sha256_hex)?;
        let session = self.session(bucket, key, upload_id)?;

        let path = Self::staging_path(upload_id, part_number);
        let size = data.len() as u64;
        let receipt: PutReceipt = ctx
            .run(self.backend.put(&path, data, NativeMetadata::new()))
            .await?;
        metrics::record_bytes_written(size);

        let info = PartInfo {
            part_number,
            size,
            etag: receipt.etag,
            last_modified: receipt.modified,
        };

        let replaced = {
            let mut inner = session.inner.lock().await;
            if !inner.state.is_open() {
                drop(inner);
                self.release(ctx, vec![path]).await;
                return Err(GatewayError::not_found(format!(
                    "no such upload: {upload_id}"
                )));
            }
            inner.state = UploadState::Uploading;
            inner
                .parts
                .insert(
                    part_number,
                    StagedPart {
                        info: info.clone(),
                        path,
                    },
                )
                .map(|old| old.path)
        };
        if let Some(old) = replaced {
            debug!("Part {} of {} replaced", part_number, upload_id);
            self.release(ctx, vec![old]).await;
        }
        Ok(info)
    }

    /// List staged parts after `part_number_marker`.
    pub async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number_marker: u32,
        max_parts: usize,
    ) -> GatewayResult<PartListing> {
        let session = self.session(bucket, key, upload_id)?;
        let max_parts = clamp_limit(max_parts);
        let inner = session.inner.lock().await;

        let mut remaining = inner
            .parts
            .range(part_number_marker.saturating_add(1)..)
            .map(|(_, p)| p.info.clone());
        let parts: Vec<PartInfo> = remaining.by_ref().take(max_parts).collect();
        let is_truncated = remaining.next().is_some();
        let next_part_number_marker = if is_truncated {
            parts.last().map(|p| p.part_number)
        } else {
            None
        };
        Ok(PartListing {
            parts,
            is_truncated,
            next_part_number_marker,
        })
    }

    /// List open uploads in `bucket`, ordered by key then upload ID.
    pub fn list_uploads(&self, bucket: &str, query: &UploadQuery) -> UploadListing {
        let mut uploads: Vec<UploadSummary> = {
            let sessions = self.sessions.read().expect("rwlock poisoned");
            sessions
                .values()
                .filter(|s| s.bucket == bucket && s.key.starts_with(query.prefix.as_str()))
                .map(|s| UploadSummary {
                    upload_id: s.upload_id.clone(),
                    key: s.key.clone(),
                    initiated: s.initiated,
                })
                .collect()
        };
        uploads.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.upload_id.cmp(&b.upload_id)));

        let max = clamp_limit(query.max_uploads);
        let mut listing = UploadListing::default();
        let mut last_prefix: Option<String> = None;
        let mut last_upload: Option<(String, String)> = None;

        for upload in uploads {
            if !query.key_marker.is_empty() {
                let past_marker = upload.key.as_str() > query.key_marker.as_str()
                    || (upload.key == query.key_marker
                        && !query.upload_id_marker.is_empty()
                        && upload.upload_id.as_str() > query.upload_id_marker.as_str());
                if !past_marker {
                    continue;
                }
            }

            let common_prefix = if query.delimiter.is_empty() {
                None
            } else {
                upload.key[query.prefix.len()..]
                    .find(query.delimiter.as_str())
                    .map(|pos| upload.key[..query.prefix.len() + pos + query.delimiter.len()].to_string())
            };
            if let Some(cp) = common_prefix.as_deref() {
                if last_prefix.as_deref() == Some(cp)
                    || (query.key_marker.starts_with(cp)
                        && query.key_marker.ends_with(&query.delimiter))
                {
                    continue;
                }
            }

            if listing.uploads.len() + listing.common_prefixes.len() >= max {
                listing.is_truncated = true;
                break;
            }
            match common_prefix {
                Some(cp) => {
                    last_upload = Some((cp.clone(), String::new()));
                    last_prefix = Some(cp.clone());
                    listing.common_prefixes.push(cp);
                }
                None => {
                    last_upload = Some((upload.key.clone(), upload.upload_id.clone()));
                    listing.uploads.push(upload);
                }
            }
        }

        if listing.is_truncated {
            if let Some((key, upload_id)) = last_upload {
                listing.next_key_marker = Some(key);
                listing.next_upload_id_marker = Some(upload_id);
            }
        }
        listing
    }

    /// Abort an upload and release its staged parts.
    pub async fn abort(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> GatewayResult<()> {
        let session = self.session(bucket, key, upload_id)?;
        if !self.abort_session(ctx, &session).await {
            return Err(GatewayError::not_found(format!(
                "no such upload: {upload_id}"
            )));
        }
        info!("Aborted multipart upload {} for {}/{}", upload_id, bucket, key);
        Ok(())
    }

    /// Returns false when the session was already completed or aborted.
    async fn abort_session(&self, ctx: &RequestContext, session: &Session) -> bool {
        let paths: Vec<String> = {
            let mut inner = session.inner.lock().await;
            if !inner.state.is_open() {
                return false;
            }
            inner.state = UploadState::Aborted;
            std::mem::take(&mut inner.parts)
                .into_values()
                .map(|p| p.path)
                .collect()
        };
        self.remove(&session.upload_id);
        self.release(ctx, paths).await;
        self.remove_staging_dir(ctx, &Self::staging_dir(&session.upload_id))
            .await;
        true
    }

    /// Assemble the listed parts into `bucket/key`.
    ///
    /// Parts are written in ascending part-number order whatever the order
    /// of `parts`.  On validation or backend failure the session stays open
    /// so the call can be retried.
    pub async fn complete(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<CompletedUpload> {
        let session = self.session(bucket, key, upload_id)?;
        let mut inner = session.inner.lock().await;
        if !inner.state.is_open() {
            return Err(GatewayError::not_found(format!(
                "no such upload: {upload_id}"
            )));
        }
        if parts.is_empty() {
            return Err(GatewayError::invalid_argument(
                "completion must list at least one part",
            ));
        }

        let mut seen = HashSet::new();
        for part in parts {
            if !seen.insert(part.part_number) {
                return Err(GatewayError::invalid_argument(format!(
                    "part {} listed more than once",
                    part.part_number
                )));
            }
            let staged = inner.parts.get(&part.part_number).ok_or_else(|| {
                GatewayError::invalid_argument(format!(
                    "part {} was never uploaded",
                    part.part_number
                ))
            })?;
            if strip_quotes(&part.etag) != strip_quotes(&staged.info.etag) {
                return Err(GatewayError::invalid_argument(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
        }

        let mut ordered: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        ordered.sort_unstable();
        if self.min_part_size > 0 {
            for number in &ordered[..ordered.len() - 1] {
                let size = inner.parts[number].info.size;
                if size < self.min_part_size {
                    return Err(GatewayError::invalid_argument(format!(
                        "part {number} is {size} bytes, smaller than the minimum {}",
                        self.min_part_size
                    )));
                }
            }
        }

        let total: u64 = ordered.iter().map(|n| inner.parts[n].info.size).sum();
        let mut buf = BytesMut::with_capacity(total as usize);
        let mut digests = Vec::with_capacity(ordered.len() * 16);
        for number in &ordered {
            let staged = &inner.parts[number];
            let obj = ctx.run(self.backend.get(&staged.path, None)).await?;
            buf.extend_from_slice(&obj.data);
            let digest = hex::decode(strip_quotes(&staged.info.etag)).map_err(|e| {
                GatewayError::internal(format!(
                    "staged part {number} has a malformed etag {}: {e}",
                    staged.info.etag
                ))
            })?;
            digests.extend(digest);
        }
        let etag = composite_etag(&digests, ordered.len());

        let final_path = format!("{bucket}/{key}");
        let receipt = ctx
            .run(
                self.backend
                    .put(&final_path, buf.freeze(), session.metadata.clone()),
            )
            .await?;
        metrics::record_bytes_written(receipt.size);

        inner.state = UploadState::Completed;
        let paths: Vec<String> = std::mem::take(&mut inner.parts)
            .into_values()
            .map(|p| p.path)
            .collect();
        drop(inner);
        self.remove(upload_id);
        self.release(ctx, paths).await;
        self.remove_staging_dir(ctx, &Self::staging_dir(upload_id))
            .await;

        info!(
            "Completed multipart upload {} for {}/{} ({} parts, {} bytes)",
            upload_id,
            bucket,
            key,
            ordered.len(),
            receipt.size
        );
        Ok(CompletedUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag,
            size: receipt.size,
            last_modified: receipt.modified,
        })
    }

    /// Abort every session initiated more than `max_age` ago.
    pub async fn abort_stale(&self, ctx: &RequestContext, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let stale: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().expect("rwlock poisoned");
            sessions
                .values()
                .filter(|s| s.initiated <= cutoff)
                .cloned()
                .collect()
        };
        let mut aborted = 0;
        for session in &stale {
            if self.abort_session(ctx, session).await {
                info!(
                    "Aborted stale multipart upload {} for {}/{}",
                    session.upload_id, session.bucket, session.key
                );
                aborted += 1;
            }
        }
        if aborted > 0 {
            metrics::record_gc_aborted(aborted);
        }
        aborted
    }

    /// Delete staged data that belongs to no open session.
    pub async fn purge_orphaned(&self, ctx: &RequestContext) -> GatewayResult<usize> {
        let mut orphans = Vec::new();
        let mut cursor = None;
        loop {
            let page = ctx
                .run(self.backend.list(ListRequest {
                    prefix: format!("{STAGING_ROOT}/"),
                    cursor: cursor.take(),
                    limit: 1000,
                    recursive: true,
                }))
                .await?;
            {
                let sessions = self.sessions.read().expect("rwlock poisoned");
                for entry in page.entries {
                    if entry.kind != EntryKind::Object {
                        continue;
                    }
                    let upload_id = entry.path[STAGING_ROOT.len() + 1..]
                        .split('/')
                        .next()
                        .unwrap_or_default();
                    if !sessions.contains_key(upload_id) {
                        orphans.push(entry.path);
                    }
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let mut dirs: Vec<String> = orphans
            .iter()
            .filter_map(|p| p.rsplit_once('/').map(|(dir, _)| dir.to_string()))
            .collect();
        dirs.dedup();
        let count = orphans.len();
        self.release(ctx, orphans).await;
        for dir in dirs {
            self.remove_staging_dir(ctx, &dir).await;
        }
        if count > 0 {
            info!("Purged {} orphaned staged parts", count);
        }
        Ok(count)
    }
}

fn strip_quotes(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

/// `"{hex(md5(concat(part digests)))}-{N}"`.
fn composite_etag(digests: &[u8], parts: usize) -> String {
    let mut hasher = Md5::new();
    hasher.update(digests);
    format!("\"{}-{}\"", hex::encode(hasher.finalize()), parts)
}

/// Check optional hex MD5 and SHA-256 digests of `data`.
pub fn verify_digests(
    data: &[u8],
    md5_hex: Option<&str>,
    sha256_hex: Option<&str>,
) -> GatewayResult<()> {
    if let Some(expected) = md5_hex.filter(|s| !s.is_empty()) {
        let actual = hex::encode(Md5::digest(data));
        if !actual.eq_ignore_ascii_case(strip_quotes(expected)) {
            return Err(GatewayError::invalid_argument(
                "content MD5 does not match the payload",
            ));
        }
    }
    if let Some(expected) = sha256_hex.filter(|s| !s.is_empty()) {
        let actual = hex::encode(Sha256::digest(data));
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(GatewayError::invalid_argument(
                "content SHA-256 does not match the payload",
            ));
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────
