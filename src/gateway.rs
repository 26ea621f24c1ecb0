//! The gateway facade.
//!
//! [`Gateway`] exposes one operation per S3 primitive on top of any
//! [`BackendClient`].  Every operation takes a [`RequestContext`]: verified
//! callers are trusted, anonymous callers are checked against the bucket
//! policy before the backend is touched.  Backend errors are normalized at
//! each call boundary, so only [`GatewayError`] leaves this module.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::{Identity, RequestContext};
use crate::errors::{GatewayError, GatewayResult};
use crate::listing::{self, clamp_limit, ListCursor, ListQuery, ListedObject};
use crate::meta::{from_native, to_native, ObjectMetadata, DEFAULT_CONTENT_TYPE};
use crate::metrics::{self, OperationTimer};
use crate::multipart::{
    verify_digests, CompletedPart, CompletedUpload, Coordinator, PartInfo, PartListing,
    UploadListing, UploadQuery,
};
use crate::policy::{BucketPolicy, CannedPolicy, PolicyStore, S3Action};
use crate::storage::backend::{
    BackendClient, BackendHead, ByteRange, EntryKind, ListRequest, ListingOrder,
};

/// Longest key S3 accepts, in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Bucket as reported by bucket operations.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketInfo {
    pub name: String,
    pub created: DateTime<Utc>,
    pub location: String,
}

/// Object as reported by reads, writes and listings.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub content_type: String,
    pub user_metadata: BTreeMap<String, String>,
    pub last_modified: DateTime<Utc>,
    pub owner: Option<String>,
}

impl ObjectInfo {
    fn from_listed(bucket: &str, obj: ListedObject, owner: Option<&str>) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: obj.key,
            size: obj.size,
            etag: obj.etag.unwrap_or_default(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            user_metadata: BTreeMap::new(),
            last_modified: obj.modified,
            owner: owner.map(str::to_string),
        }
    }
}

/// Body plus description of a read.
#[derive(Debug, Clone)]
pub struct GetObjectOutput {
    pub info: ObjectInfo,
    pub data: Bytes,
}

/// One page of a V1 listing.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsInfo {
    pub objects: Vec<ObjectInfo>,
    pub prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

/// One page of a V2 listing.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsV2Info {
    pub objects: Vec<ObjectInfo>,
    pub prefixes: Vec<String>,
    pub is_truncated: bool,
    pub continuation_token: Option<String>,
    pub next_continuation_token: Option<String>,
    pub key_count: usize,
}

/// Backend description returned by [`Gateway::storage_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    pub backend: &'static str,
    pub listing_order: ListingOrder,
    pub anonymous_writes: bool,
    pub directories: bool,
    pub multipart_sessions: usize,
}

/// S3 facade over one backend.
pub struct Gateway {
    backend: Arc<dyn BackendClient>,
    coordinator: Coordinator,
    policies: PolicyStore,
    config: Config,
}

impl Gateway {
    pub fn new(backend: Arc<dyn BackendClient>, config: Config) -> Self {
        let caps = backend.capabilities();
        info!(
            "Gateway initialized: backend={} order={:?} anonymous_writes={} directories={}",
            caps.name, caps.listing_order, caps.anonymous_writes, caps.directories
        );
        Self {
            coordinator: Coordinator::new(Arc::clone(&backend), config.multipart.min_part_size),
            policies: PolicyStore::new(Arc::clone(&backend)),
            backend,
            config,
        }
    }

    /// Build a context for `identity` carrying the configured deadline.
    pub fn request_context(&self, identity: Identity) -> RequestContext {
        let ctx = RequestContext::new(identity);
        match self.config.gateway.request_timeout_secs {
            0 => ctx,
            secs => ctx.with_timeout(Duration::from_secs(secs)),
        }
    }

    pub fn storage_info(&self) -> StorageInfo {
        let caps = self.backend.capabilities();
        StorageInfo {
            backend: caps.name,
            listing_order: caps.listing_order,
            anonymous_writes: caps.anonymous_writes,
            directories: caps.directories,
            multipart_sessions: self.coordinator.session_count(),
        }
    }

    /// Stop accepting work. In-flight multipart sessions are not persisted.
    pub async fn shutdown(&self) -> GatewayResult<()> {
        let sessions = self.coordinator.session_count();
        if sessions > 0 {
            warn!(
                "Shutting down with {} in-flight multipart uploads; they will be lost",
                sessions
            );
        } else {
            info!("Gateway shut down");
        }
        Ok(())
    }

    // -- Authorization ---------------------------------------------------------

    /// Evaluate an anonymous caller against the bucket policy.
    async fn authorize(
        &self,
        ctx: &RequestContext,
        action: S3Action,
        bucket: &str,
        key: &str,
    ) -> GatewayResult<()> {
        ctx.check()?;
        if !ctx.is_anonymous() {
            return Ok(());
        }
        let allowed = match self.policies.get(ctx, bucket).await? {
            Some(policy) => policy.is_allowed_anonymous(action, bucket, key),
            None => false,
        };
        if !allowed {
            debug!("Anonymous {} denied on {}/{}", action.as_str(), bucket, key);
            return Err(GatewayError::access_denied(format!(
                "anonymous {} is not allowed on {bucket}",
                action.as_str()
            )));
        }
        if action.is_write() && !self.backend.capabilities().anonymous_writes {
            return Err(GatewayError::not_implemented(format!(
                "{} backend does not support anonymous writes",
                self.backend.capabilities().name
            )));
        }
        Ok(())
    }

    fn require_verified(ctx: &RequestContext, operation: &str) -> GatewayResult<()> {
        ctx.check()?;
        if ctx.is_anonymous() {
            return Err(GatewayError::access_denied(format!(
                "{operation} requires an authenticated caller"
            )));
        }
        Ok(())
    }

    fn validate_key(&self, key: &str) -> GatewayResult<()> {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(GatewayError::invalid_argument(format!(
                "object key must be 1 to {MAX_KEY_LENGTH} bytes"
            )));
        }
        if self.backend.capabilities().directories
            && key.split('/').any(|s| s.is_empty() || s == "." || s == "..")
        {
            return Err(GatewayError::invalid_argument(format!(
                "object key {key:?} has an empty, '.' or '..' segment"
            )));
        }
        Ok(())
    }

    /// Fail with `NotFound` unless `bucket` is an existing bucket directory.
    async fn ensure_bucket(&self, ctx: &RequestContext, bucket: &str) -> GatewayResult<BackendHead> {
        let head = ctx.run(self.backend.head(bucket)).await?;
        if head.kind != EntryKind::Directory {
            return Err(GatewayError::not_found(format!("no such bucket: {bucket}")));
        }
        Ok(head)
    }

    fn object_info(&self, bucket: &str, key: &str, head: &BackendHead) -> ObjectInfo {
        let meta = from_native(&head.metadata, &self.backend.capabilities().metadata);
        ObjectInfo {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: head.size,
            etag: head.etag.clone().unwrap_or_default(),
            content_type: meta.content_type_or_default().to_string(),
            user_metadata: meta.user,
            last_modified: head.modified,
            owner: None,
        }
    }

    // -- Buckets ---------------------------------------------------------------

    /// Create a bucket. `location` is accepted but buckets always report the
    /// configured region.
    pub async fn make_bucket_with_location(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        location: &str,
    ) -> GatewayResult<()> {
        let timer = OperationTimer::start("make_bucket");
        let result = async {
            validate_bucket_name(bucket)?;
            Self::require_verified(ctx, "CreateBucket")?;
            if !location.is_empty() && location != self.config.gateway.region {
                debug!(
                    "Bucket {} requested location {} (serving {})",
                    bucket, location, self.config.gateway.region
                );
            }
            ctx.run(self.backend.mkdir(bucket)).await?;
            info!("Created bucket {}", bucket);
            Ok::<_, GatewayError>(())
        }
        .await;
        timer.finish(result)
    }

    pub async fn get_bucket_info(
        &self,
        ctx: &RequestContext,
        bucket: &str,
    ) -> GatewayResult<BucketInfo> {
        let timer = OperationTimer::start("get_bucket_info");
        let result = async {
            validate_bucket_name(bucket)?;
            self.authorize(ctx, S3Action::ListBucket, bucket, "").await?;
            let head = self.ensure_bucket(ctx, bucket).await?;
            Ok::<_, GatewayError>(BucketInfo {
                name: bucket.to_string(),
                created: head.modified,
                location: self.config.gateway.region.clone(),
            })
        }
        .await;
        timer.finish(result)
    }

    /// List buckets in name order. Gateway-internal areas are hidden.
    pub async fn list_buckets(&self, ctx: &RequestContext) -> GatewayResult<Vec<BucketInfo>> {
        let timer = OperationTimer::start("list_buckets");
        let result = async {
            Self::require_verified(ctx, "ListBuckets")?;
            let mut buckets = Vec::new();
            let mut cursor = None;
            loop {
                let page = ctx
                    .run(self.backend.list(ListRequest {
                        prefix: String::new(),
                        cursor: cursor.take(),
                        limit: listing::MAX_LIST_LIMIT,
                        recursive: false,
                    }))
                    .await?;
                for entry in page.entries {
                    if entry.kind != EntryKind::Directory || entry.path.starts_with('.') {
                        continue;
                    }
                    buckets.push(BucketInfo {
                        name: entry.path,
                        created: entry.modified,
                        location: self.config.gateway.region.clone(),
                    });
                }
                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
            buckets.sort_by(|a, b| a.name.cmp(&b.name));
            Ok::<_, GatewayError>(buckets)
        }
        .await;
        timer.finish(result)
    }

    /// Delete an empty bucket along with its policy.
    ///
    /// A bucket with in-progress multipart uploads is not empty.
    pub async fn delete_bucket(&self, ctx: &RequestContext, bucket: &str) -> GatewayResult<()> {
        let timer = OperationTimer::start("delete_bucket");
        let result = async {
            validate_bucket_name(bucket)?;
            Self::require_verified(ctx, "DeleteBucket")?;
            self.ensure_bucket(ctx, bucket).await?;
            if self.coordinator.has_uploads(bucket) {
                return Err(GatewayError::invalid_argument(format!(
                    "bucket {bucket} has in-progress multipart uploads"
                )));
            }
            if self.bucket_has_objects(ctx, bucket).await? {
                return Err(GatewayError::invalid_argument(format!(
                    "bucket {bucket} is not empty"
                )));
            }
            ctx.run(self.backend.rmdir(bucket)).await?;
            self.policies.delete(ctx, bucket).await?;
            info!("Deleted bucket {}", bucket);
            Ok::<_, GatewayError>(())
        }
        .await;
        timer.finish(result)
    }

    async fn bucket_has_objects(&self, ctx: &RequestContext, bucket: &str) -> GatewayResult<bool> {
        let mut cursor = None;
        loop {
            let page = ctx
                .run(self.backend.list(ListRequest {
                    prefix: format!("{bucket}/"),
                    cursor: cursor.take(),
                    limit: 100,
                    recursive: true,
                }))
                .await?;
            if page.entries.iter().any(|e| e.kind == EntryKind::Object) {
                return Ok(true);
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(false),
            }
        }
    }

    // -- Listing ---------------------------------------------------------------

    fn page_size(&self, max_keys: usize) -> usize {
        if max_keys == 0 {
            clamp_limit(self.config.gateway.default_max_keys)
        } else {
            clamp_limit(max_keys)
        }
    }

    /// V1 listing. `marker` is a plain key.
    pub async fn list_objects(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        prefix: &str,
        marker: &str,
        delimiter: &str,
        max_keys: usize,
    ) -> GatewayResult<ListObjectsInfo> {
        let timer = OperationTimer::start("list_objects");
        let result = async {
            validate_bucket_name(bucket)?;
            self.authorize(ctx, S3Action::ListBucket, bucket, "").await?;
            self.ensure_bucket(ctx, bucket).await?;
            let query = ListQuery {
                scope: bucket.to_string(),
                prefix: prefix.to_string(),
                delimiter: delimiter.to_string(),
                after: (!marker.is_empty()).then(|| marker.to_string()),
                inner: None,
                limit: self.page_size(max_keys),
            };
            let page = listing::paginate(self.backend.as_ref(), ctx, &query).await?;
            Ok::<_, GatewayError>(ListObjectsInfo {
                objects: page
                    .objects
                    .into_iter()
                    .map(|o| ObjectInfo::from_listed(bucket, o, None))
                    .collect(),
                prefixes: page.common_prefixes,
                is_truncated: page.is_truncated,
                next_marker: page.next_marker,
            })
        }
        .await;
        timer.finish(result)
    }

    /// V2 listing. `start_after` only applies when no token is given.
    #[allow(clippy::too_many_arguments)]
    pub async fn list_objects_v2(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        prefix: &str,
        continuation_token: &str,
        fetch_owner: bool,
        delimiter: &str,
        max_keys: usize,
        start_after: &str,
    ) -> GatewayResult<ListObjectsV2Info> {
        let timer = OperationTimer::start("list_objects_v2");
        let result = async {
            validate_bucket_name(bucket)?;
            self.authorize(ctx, S3Action::ListBucket, bucket, "").await?;
            let (after, inner) = if !continuation_token.is_empty() {
                let cursor = ListCursor::decode(continuation_token)?;
                (Some(cursor.after), cursor.inner)
            } else if !start_after.is_empty() {
                (Some(start_after.to_string()), None)
            } else {
                (None, None)
            };
            self.ensure_bucket(ctx, bucket).await?;
            let query = ListQuery {
                scope: bucket.to_string(),
                prefix: prefix.to_string(),
                delimiter: delimiter.to_string(),
                after,
                inner,
                limit: self.page_size(max_keys),
            };
            let page = listing::paginate(self.backend.as_ref(), ctx, &query).await?;
            let owner = fetch_owner.then_some(self.config.gateway.owner.as_str());
            let key_count = page.objects.len() + page.common_prefixes.len();
            Ok::<_, GatewayError>(ListObjectsV2Info {
                objects: page
                    .objects
                    .into_iter()
                    .map(|o| ObjectInfo::from_listed(bucket, o, owner))
                    .collect(),
                prefixes: page.common_prefixes,
                is_truncated: page.is_truncated,
                continuation_token: (!continuation_token.is_empty())
                    .then(|| continuation_token.to_string()),
                next_continuation_token: page.next_cursor,
                key_count,
            })
        }
        .await;
        timer.finish(result)
    }

    // -- Objects ---------------------------------------------------------------

    pub async fn get_object(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> GatewayResult<GetObjectOutput> {
        let timer = OperationTimer::start("get_object");
        let result = async {
            validate_bucket_name(bucket)?;
            self.validate_key(key)?;
            self.authorize(ctx, S3Action::GetObject, bucket, key).await?;
            let obj = ctx
                .run(self.backend.get(&format!("{bucket}/{key}"), range))
                .await?;
            if obj.head.kind != EntryKind::Object {
                return Err(GatewayError::not_found(format!("{bucket}/{key}")));
            }
            metrics::record_bytes_read(obj.data.len() as u64);
            Ok::<_, GatewayError>(GetObjectOutput {
                info: self.object_info(bucket, key, &obj.head),
                data: obj.data,
            })
        }
        .await;
        timer.finish(result)
    }

    pub async fn get_object_info(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        key: &str,
    ) -> GatewayResult<ObjectInfo> {
        let timer = OperationTimer::start("get_object_info");
        let result = async {
            validate_bucket_name(bucket)?;
            self.validate_key(key)?;
            self.authorize(ctx, S3Action::GetObject, bucket, key).await?;
            let head = ctx
                .run(self.backend.head(&format!("{bucket}/{key}")))
                .await?;
            if head.kind != EntryKind::Object {
                return Err(GatewayError::not_found(format!("{bucket}/{key}")));
            }
            Ok::<_, GatewayError>(self.object_info(bucket, key, &head))
        }
        .await;
        timer.finish(result)
    }

    /// Store an object. `sha256` is an optional hex digest of `data`.
    pub async fn put_object(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        key: &str,
        data: Bytes,
        metadata: &ObjectMetadata,
        sha256: Option<&str>,
    ) -> GatewayResult<ObjectInfo> {
        let timer = OperationTimer::start("put_object");
        let result = async {
            validate_bucket_name(bucket)?;
            self.validate_key(key)?;
            self.authorize(ctx, S3Action::PutObject, bucket, key).await?;
            verify_digests(&data, None, sha256)?;
            let native = to_native(metadata, &self.backend.capabilities().metadata).into_result()?;
            self.ensure_bucket(ctx, bucket).await?;

            let receipt = ctx
                .run(self.backend.put(&format!("{bucket}/{key}"), data, native))
                .await?;
            metrics::record_bytes_written(receipt.size);
            debug!("Stored {}/{} ({} bytes)", bucket, key, receipt.size);
            Ok::<_, GatewayError>(ObjectInfo {
                bucket: bucket.to_string(),
                key: key.to_string(),
                size: receipt.size,
                etag: receipt.etag,
                content_type: metadata.content_type_or_default().to_string(),
                user_metadata: metadata.user.clone(),
                last_modified: receipt.modified,
                owner: None,
            })
        }
        .await;
        timer.finish(result)
    }

    /// Copy an object. With `metadata == None` the source metadata is kept.
    pub async fn copy_object(
        &self,
        ctx: &RequestContext,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        metadata: Option<&ObjectMetadata>,
    ) -> GatewayResult<ObjectInfo> {
        let timer = OperationTimer::start("copy_object");
        let result = async {
            validate_bucket_name(src_bucket)?;
            validate_bucket_name(dst_bucket)?;
            self.validate_key(src_key)?;
            self.validate_key(dst_key)?;
            self.authorize(ctx, S3Action::GetObject, src_bucket, src_key)
                .await?;
            self.authorize(ctx, S3Action::PutObject, dst_bucket, dst_key)
                .await?;

            let profile = self.backend.capabilities().metadata;
            let replacement = match metadata {
                Some(meta) => Some(to_native(meta, &profile).into_result()?),
                None => None,
            };
            self.ensure_bucket(ctx, dst_bucket).await?;
            let src = ctx
                .run(self.backend.get(&format!("{src_bucket}/{src_key}"), None))
                .await?;
            if src.head.kind != EntryKind::Object {
                return Err(GatewayError::not_found(format!("{src_bucket}/{src_key}")));
            }
            let native = replacement.unwrap_or_else(|| src.head.metadata.clone());
            let kept = from_native(&native, &profile);

            let receipt = ctx
                .run(
                    self.backend
                        .put(&format!("{dst_bucket}/{dst_key}"), src.data, native),
                )
                .await?;
            metrics::record_bytes_written(receipt.size);
            debug!(
                "Copied {}/{} to {}/{}",
                src_bucket, src_key, dst_bucket, dst_key
            );
            Ok::<_, GatewayError>(ObjectInfo {
                bucket: dst_bucket.to_string(),
                key: dst_key.to_string(),
                size: receipt.size,
                etag: receipt.etag,
                content_type: kept.content_type_or_default().to_string(),
                user_metadata: kept.user,
                last_modified: receipt.modified,
                owner: None,
            })
        }
        .await;
        timer.finish(result)
    }

    /// Delete an object. Deleting a missing object fails with `NotFound`.
    pub async fn delete_object(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        key: &str,
    ) -> GatewayResult<()> {
        let timer = OperationTimer::start("delete_object");
        let result = async {
            validate_bucket_name(bucket)?;
            self.validate_key(key)?;
            self.authorize(ctx, S3Action::DeleteObject, bucket, key)
                .await?;
            ctx.run(self.backend.delete(&format!("{bucket}/{key}")))
                .await?;
            debug!("Deleted {}/{}", bucket, key);
            Ok::<_, GatewayError>(())
        }
        .await;
        timer.finish(result)
    }

    // -- Multipart -------------------------------------------------------------

    pub async fn list_multipart_uploads(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        query: &UploadQuery,
    ) -> GatewayResult<UploadListing> {
        let timer = OperationTimer::start("list_multipart_uploads");
        let result = async {
            validate_bucket_name(bucket)?;
            self.authorize(ctx, S3Action::ListBucketMultipartUploads, bucket, "")
                .await?;
            self.ensure_bucket(ctx, bucket).await?;
            Ok::<_, GatewayError>(self.coordinator.list_uploads(bucket, query))
        }
        .await;
        timer.finish(result)
    }

    /// Start a multipart upload and return its upload ID.
    pub async fn new_multipart_upload(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> GatewayResult<String> {
        let timer = OperationTimer::start("new_multipart_upload");
        let result = async {
            validate_bucket_name(bucket)?;
            self.validate_key(key)?;
            self.authorize(ctx, S3Action::PutObject, bucket, key).await?;
            let native = to_native(metadata, &self.backend.capabilities().metadata).into_result()?;
            self.ensure_bucket(ctx, bucket).await?;
            Ok::<_, GatewayError>(self.coordinator.initiate(bucket, key, native))
        }
        .await;
        timer.finish(result)
    }

    /// Stage one part. `md5` and `sha256` are optional hex digests.
    #[allow(clippy::too_many_arguments)]
    pub async fn put_object_part(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
        md5: Option<&str>,
        sha256: Option<&str>,
    ) -> GatewayResult<PartInfo> {
        let timer = OperationTimer::start("put_object_part");
        let result = async {
            validate_bucket_name(bucket)?;
            self.validate_key(key)?;
            self.authorize(ctx, S3Action::PutObject, bucket, key).await?;
            self.ensure_bucket(ctx, bucket).await?;
            self.coordinator
                .put_part(ctx, bucket, key, upload_id, part_number, data, md5, sha256)
                .await
        }
        .await;
        timer.finish(result)
    }

    /// Stage a byte range of an existing object as one part.
    #[allow(clippy::too_many_arguments)]
    pub async fn copy_object_part(
        &self,
        ctx: &RequestContext,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        upload_id: &str,
        part_number: u32,
        range: Option<ByteRange>,
    ) -> GatewayResult<PartInfo> {
        let timer = OperationTimer::start("copy_object_part");
        let result = async {
            validate_bucket_name(src_bucket)?;
            validate_bucket_name(dst_bucket)?;
            self.validate_key(src_key)?;
            self.validate_key(dst_key)?;
            self.authorize(ctx, S3Action::GetObject, src_bucket, src_key)
                .await?;
            self.authorize(ctx, S3Action::PutObject, dst_bucket, dst_key)
                .await?;
            // Fail on an unknown upload before reading the source.
            self.coordinator.session(dst_bucket, dst_key, upload_id)?;
            self.ensure_bucket(ctx, dst_bucket).await?;
            let src = ctx
                .run(
                    self.backend
                        .get(&format!("{src_bucket}/{src_key}"), range),
                )
                .await?;
            metrics::record_bytes_read(src.data.len() as u64);
            self.coordinator
                .put_part(
                    ctx,
                    dst_bucket,
                    dst_key,
                    upload_id,
                    part_number,
                    src.data,
                    None,
                    None,
                )
                .await
        }
        .await;
        timer.finish(result)
    }

    pub async fn list_object_parts(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number_marker: u32,
        max_parts: usize,
    ) -> GatewayResult<PartListing> {
        let timer = OperationTimer::start("list_object_parts");
        let result = async {
            validate_bucket_name(bucket)?;
            self.validate_key(key)?;
            self.authorize(ctx, S3Action::ListMultipartUploadParts, bucket, key)
                .await?;
            self.coordinator
                .list_parts(bucket, key, upload_id, part_number_marker, max_parts)
                .await
        }
        .await;
        timer.finish(result)
    }

    pub async fn abort_multipart_upload(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> GatewayResult<()> {
        let timer = OperationTimer::start("abort_multipart_upload");
        let result = async {
            validate_bucket_name(bucket)?;
            self.validate_key(key)?;
            self.authorize(ctx, S3Action::AbortMultipartUpload, bucket, key)
                .await?;
            self.coordinator.abort(ctx, bucket, key, upload_id).await
        }
        .await;
        timer.finish(result)
    }

    pub async fn complete_multipart_upload(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<CompletedUpload> {
        let timer = OperationTimer::start("complete_multipart_upload");
        let result = async {
            validate_bucket_name(bucket)?;
            self.validate_key(key)?;
            self.authorize(ctx, S3Action::PutObject, bucket, key).await?;
            // The bucket may have been removed out from under the session.
            self.ensure_bucket(ctx, bucket).await?;
            self.coordinator
                .complete(ctx, bucket, key, upload_id, parts)
                .await
        }
        .await;
        timer.finish(result)
    }

    /// Abort sessions older than `multipart.stale_after_secs`.
    pub async fn abort_stale_uploads(&self, ctx: &RequestContext) -> usize {
        let max_age = Duration::from_secs(self.config.multipart.stale_after_secs);
        self.coordinator.abort_stale(ctx, max_age).await
    }

    /// Reclaim staged parts left behind by sessions lost to a restart.
    pub async fn purge_orphaned_staging(&self, ctx: &RequestContext) -> GatewayResult<usize> {
        self.coordinator.purge_orphaned(ctx).await
    }

    // -- Policies --------------------------------------------------------------

    /// Replace the bucket policy with the JSON document `policy`.
    pub async fn set_bucket_policy(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        policy: &[u8],
    ) -> GatewayResult<()> {
        let timer = OperationTimer::start("set_bucket_policy");
        let result = async {
            validate_bucket_name(bucket)?;
            Self::require_verified(ctx, "PutBucketPolicy")?;
            let policy = BucketPolicy::parse(bucket, policy)?;
            self.ensure_bucket(ctx, bucket).await?;
            self.policies.put(ctx, bucket, &policy).await
        }
        .await;
        timer.finish(result)
    }

    pub async fn get_bucket_policy(
        &self,
        ctx: &RequestContext,
        bucket: &str,
    ) -> GatewayResult<BucketPolicy> {
        let timer = OperationTimer::start("get_bucket_policy");
        let result = async {
            validate_bucket_name(bucket)?;
            Self::require_verified(ctx, "GetBucketPolicy")?;
            self.ensure_bucket(ctx, bucket).await?;
            self.policies
                .get(ctx, bucket)
                .await?
                .ok_or_else(|| GatewayError::not_found(format!("bucket {bucket} has no policy")))
        }
        .await;
        timer.finish(result)
    }

    /// Remove the bucket policy. Fails with `NotFound` if there is none.
    pub async fn delete_bucket_policy(
        &self,
        ctx: &RequestContext,
        bucket: &str,
    ) -> GatewayResult<()> {
        let timer = OperationTimer::start("delete_bucket_policy");
        let result = async {
            validate_bucket_name(bucket)?;
            Self::require_verified(ctx, "DeleteBucketPolicy")?;
            self.ensure_bucket(ctx, bucket).await?;
            if !self.policies.delete(ctx, bucket).await? {
                return Err(GatewayError::not_found(format!(
                    "bucket {bucket} has no policy"
                )));
            }
            Ok::<_, GatewayError>(())
        }
        .await;
        timer.finish(result)
    }

    /// Apply a canned access level to keys under `prefix`.
    /// `CannedPolicy::None` removes the bucket policy.
    pub async fn set_canned_policy(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        prefix: &str,
        canned: CannedPolicy,
    ) -> GatewayResult<()> {
        match canned.document(bucket, prefix) {
            Some(policy) => {
                let body = policy.to_json()?;
                self.set_bucket_policy(ctx, bucket, &body).await
            }
            None => {
                Self::require_verified(ctx, "DeleteBucketPolicy")?;
                self.policies.delete(ctx, bucket).await.map(|_| ())
            }
        }
    }

    /// Classify the anonymous access the current policy grants under `prefix`.
    pub async fn get_canned_policy(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        prefix: &str,
    ) -> GatewayResult<CannedPolicy> {
        Self::require_verified(ctx, "GetBucketPolicy")?;
        Ok(match self.policies.get(ctx, bucket).await? {
            Some(policy) => policy.canned_for(bucket, prefix),
            None => CannedPolicy::None,
        })
    }
}

/// Validate a bucket name against S3 naming rules.
pub fn validate_bucket_name(name: &str) -> GatewayResult<()> {
    let invalid = || GatewayError::invalid_argument(format!("invalid bucket name: {name:?}"));

    if !(3..=63).contains(&name.len()) {
        return Err(invalid());
    }
    // Must only contain lowercase letters, digits, hyphens, periods.
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
    {
        return Err(invalid());
    }
    // Must begin and end with a letter or digit.
    let bytes = name.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return Err(invalid());
    }
    if name.contains("..") || looks_like_ip(name) {
        return Err(invalid());
    }
    if name.starts_with("xn--") || name.ends_with("-s3alias") || name.ends_with("--ol-s3") {
        return Err(invalid());
    }
    Ok(())
}

fn looks_like_ip(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|p| p.parse::<u8>().is_ok())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::meta::NativeMetadata;
    use crate::multipart::UploadState;
    use crate::storage::backend::{
        BackendCapabilities, BackendObject, BackendResult, ListPage, PutReceipt,
    };
    use crate::storage::local::LocalBackend;
    use crate::storage::memory::MemoryBackend;
    use std::future::Future;
    use std::pin::Pin;

    fn gateway() -> Gateway {
        Gateway::new(Arc::new(MemoryBackend::default()), Config::default())
    }

    fn admin() -> RequestContext {
        RequestContext::verified("AKIAADMIN")
    }

    fn meta(pairs: &[(&str, &str)]) -> ObjectMetadata {
        let mut m = ObjectMetadata::default();
        for (k, v) in pairs {
            m.insert_user(k, v);
        }
        m
    }

    /// Memory backend that refuses anonymous writes, like Manta.
    struct NoAnonWrites(MemoryBackend);

    impl BackendClient for NoAnonWrites {
        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities {
                anonymous_writes: false,
                ..self.0.capabilities()
            }
        }
        fn put(
            &self,
            path: &str,
            data: Bytes,
            metadata: NativeMetadata,
        ) -> Pin<Box<dyn Future<Output = BackendResult<PutReceipt>> + Send + '_>> {
            self.0.put(path, data, metadata)
        }
        fn get(
            &self,
            path: &str,
            range: Option<ByteRange>,
        ) -> Pin<Box<dyn Future<Output = BackendResult<BackendObject>> + Send + '_>> {
            self.0.get(path, range)
        }
        fn head(
            &self,
            path: &str,
        ) -> Pin<Box<dyn Future<Output = BackendResult<BackendHead>> + Send + '_>> {
            self.0.head(path)
        }
        fn delete(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
            self.0.delete(path)
        }
        fn list(
            &self,
            request: ListRequest,
        ) -> Pin<Box<dyn Future<Output = BackendResult<ListPage>> + Send + '_>> {
            self.0.list(request)
        }
        fn mkdir(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
            self.0.mkdir(path)
        }
        fn rmdir(&self, path: &str) -> Pin<Box<dyn Future<Output = BackendResult<()>> + Send + '_>> {
            self.0.rmdir(path)
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip_with_metadata() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        gw.put_object(&ctx, "b1", "k1", Bytes::from("hello"), &meta(&[("x-custom", "v")]), None)
            .await
            .unwrap();

        let out = gw.get_object(&ctx, "b1", "k1", None).await.unwrap();
        assert_eq!(out.data, Bytes::from("hello"));
        assert_eq!(out.info.user_metadata.get("x-custom").map(String::as_str), Some("v"));
        assert_eq!(out.info.size, 5);
        assert_eq!(out.info.content_type, DEFAULT_CONTENT_TYPE);

        let head = gw.get_object_info(&ctx, "b1", "k1").await.unwrap();
        assert_eq!(head.etag, out.info.etag);
    }

    #[tokio::test]
    async fn test_ranged_get() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        gw.put_object(&ctx, "b1", "k1", Bytes::from("hello world"), &ObjectMetadata::default(), None)
            .await
            .unwrap();
        let out = gw
            .get_object(&ctx, "b1", "k1", Some(ByteRange { start: 6, length: Some(5) }))
            .await
            .unwrap();
        assert_eq!(out.data, Bytes::from("world"));
    }

    #[tokio::test]
    async fn test_multipart_scenario() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        let id = gw
            .new_multipart_upload(&ctx, "b1", "k2", &ObjectMetadata::default())
            .await
            .unwrap();
        let p1 = gw
            .put_object_part(&ctx, "b1", "k2", &id, 1, Bytes::from("AA"), None, None)
            .await
            .unwrap();
        let p2 = gw
            .put_object_part(&ctx, "b1", "k2", &id, 2, Bytes::from("BB"), None, None)
            .await
            .unwrap();

        let done = gw
            .complete_multipart_upload(
                &ctx,
                "b1",
                "k2",
                &id,
                &[
                    CompletedPart { part_number: 1, etag: p1.etag },
                    CompletedPart { part_number: 2, etag: p2.etag },
                ],
            )
            .await
            .unwrap();
        assert!(done.etag.ends_with("-2\""));

        let out = gw.get_object(&ctx, "b1", "k2", None).await.unwrap();
        assert_eq!(out.data, Bytes::from("AABB"));
        // Staged data is not visible as objects.
        let listing = gw.list_objects(&ctx, "b1", "", "", "", 0).await.unwrap();
        assert_eq!(listing.objects.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_with_unknown_part_keeps_uploading() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        let id = gw
            .new_multipart_upload(&ctx, "b1", "k2", &ObjectMetadata::default())
            .await
            .unwrap();
        let p1 = gw
            .put_object_part(&ctx, "b1", "k2", &id, 1, Bytes::from("AA"), None, None)
            .await
            .unwrap();

        let err = gw
            .complete_multipart_upload(
                &ctx,
                "b1",
                "k2",
                &id,
                &[
                    CompletedPart { part_number: 1, etag: p1.etag },
                    CompletedPart { part_number: 7, etag: "\"00\"".to_string() },
                ],
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let session = gw.coordinator.session("b1", "k2", &id).unwrap();
        assert_eq!(session.state().await, UploadState::Uploading);
    }

    #[tokio::test]
    async fn test_copy_object_part() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        gw.put_object(&ctx, "b1", "src", Bytes::from("0123456789"), &ObjectMetadata::default(), None)
            .await
            .unwrap();
        let id = gw
            .new_multipart_upload(&ctx, "b1", "dst", &ObjectMetadata::default())
            .await
            .unwrap();
        let part = gw
            .copy_object_part(
                &ctx,
                "b1",
                "src",
                "b1",
                "dst",
                &id,
                1,
                Some(ByteRange { start: 2, length: Some(3) }),
            )
            .await
            .unwrap();
        assert_eq!(part.size, 3);
        gw.complete_multipart_upload(
            &ctx,
            "b1",
            "dst",
            &id,
            &[CompletedPart { part_number: 1, etag: part.etag }],
        )
        .await
        .unwrap();
        let out = gw.get_object(&ctx, "b1", "dst", None).await.unwrap();
        assert_eq!(out.data, Bytes::from("234"));
    }

    #[tokio::test]
    async fn test_anonymous_put_denied_by_policy() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        gw.set_canned_policy(&ctx, "b1", "", CannedPolicy::ReadOnly)
            .await
            .unwrap();

        let anon = RequestContext::anonymous();
        let err = gw
            .put_object(&anon, "b1", "k3", Bytes::from("x"), &ObjectMetadata::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        let err = gw.get_object_info(&ctx, "b1", "k3").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // Reads are allowed by the same policy.
        gw.put_object(&ctx, "b1", "k3", Bytes::from("x"), &ObjectMetadata::default(), None)
            .await
            .unwrap();
        assert!(gw.get_object(&anon, "b1", "k3", None).await.is_ok());
        assert_eq!(
            gw.get_canned_policy(&ctx, "b1", "").await.unwrap(),
            CannedPolicy::ReadOnly
        );
    }

    #[tokio::test]
    async fn test_anonymous_without_policy_is_denied() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        let anon = RequestContext::anonymous();
        let err = gw.list_objects(&anon, "b1", "", "", "", 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        let err = gw.list_buckets(&anon).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        let err = gw
            .make_bucket_with_location(&anon, "b2", "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
    }

    #[tokio::test]
    async fn test_anonymous_write_on_backend_without_anonymous_writes() {
        let gw = Gateway::new(
            Arc::new(NoAnonWrites(MemoryBackend::default())),
            Config::default(),
        );
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        gw.set_canned_policy(&ctx, "b1", "", CannedPolicy::ReadWrite)
            .await
            .unwrap();

        let anon = RequestContext::anonymous();
        let err = gw
            .put_object(&anon, "b1", "k1", Bytes::from("x"), &ObjectMetadata::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);
        assert!(gw.get_object_info(&ctx, "b1", "k1").await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_get_is_timeout() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        gw.put_object(&ctx, "b1", "k1", Bytes::from("hello"), &ObjectMetadata::default(), None)
            .await
            .unwrap();

        let cancelled = admin();
        cancelled.cancel.cancel();
        let err = gw.get_object(&cancelled, "b1", "k1", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_bucket_lifecycle() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "alpha", "eu-west-1").await.unwrap();
        gw.make_bucket_with_location(&ctx, "beta", "").await.unwrap();
        let err = gw
            .make_bucket_with_location(&ctx, "alpha", "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        // Policies live under the hidden area, which must not show up.
        gw.set_canned_policy(&ctx, "beta", "", CannedPolicy::ReadOnly)
            .await
            .unwrap();
        let names: Vec<_> = gw
            .list_buckets(&ctx)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["alpha", "beta"]);

        let info = gw.get_bucket_info(&ctx, "alpha").await.unwrap();
        assert_eq!(info.location, "us-east-1");

        gw.put_object(&ctx, "beta", "k", Bytes::from("x"), &ObjectMetadata::default(), None)
            .await
            .unwrap();
        let err = gw.delete_bucket(&ctx, "beta").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        gw.delete_object(&ctx, "beta", "k").await.unwrap();
        gw.delete_bucket(&ctx, "beta").await.unwrap();
        let err = gw.get_bucket_info(&ctx, "beta").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = gw.get_bucket_policy(&ctx, "alpha").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_put_into_missing_bucket_fails() {
        let gw = gateway();
        let err = gw
            .put_object(&admin(), "nope", "k", Bytes::from("x"), &ObjectMetadata::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_put_rejects_bad_sha256() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        let err = gw
            .put_object(&ctx, "b1", "k", Bytes::from("x"), &ObjectMetadata::default(), Some("abcd"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_copy_object_keeps_or_replaces_metadata() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        gw.put_object(&ctx, "b1", "src", Bytes::from("data"), &meta(&[("color", "red")]), None)
            .await
            .unwrap();

        let kept = gw
            .copy_object(&ctx, "b1", "src", "b1", "copy1", None)
            .await
            .unwrap();
        assert_eq!(kept.user_metadata.get("color").map(String::as_str), Some("red"));

        let replaced = gw
            .copy_object(&ctx, "b1", "src", "b1", "copy2", Some(&meta(&[("shape", "round")])))
            .await
            .unwrap();
        assert!(replaced.user_metadata.get("color").is_none());
        let head = gw.get_object_info(&ctx, "b1", "copy2").await.unwrap();
        assert_eq!(head.user_metadata.get("shape").map(String::as_str), Some("round"));
        assert_eq!(head.etag, kept.etag);
    }

    #[tokio::test]
    async fn test_list_objects_v1_and_v2_paging() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        for key in ["a", "b", "dir/x", "dir/y", "z"] {
            gw.put_object(&ctx, "b1", key, Bytes::from("x"), &ObjectMetadata::default(), None)
                .await
                .unwrap();
        }

        let v1 = gw.list_objects(&ctx, "b1", "", "", "/", 2).await.unwrap();
        assert!(v1.is_truncated);
        assert_eq!(v1.next_marker.as_deref(), Some("b"));
        let v1 = gw.list_objects(&ctx, "b1", "", "b", "/", 2).await.unwrap();
        assert_eq!(v1.prefixes, vec!["dir/"]);
        assert_eq!(v1.objects[0].key, "z");
        assert!(!v1.is_truncated);

        let mut seen = Vec::new();
        let mut token = String::new();
        loop {
            let page = gw
                .list_objects_v2(&ctx, "b1", "", &token, true, "", 2, "")
                .await
                .unwrap();
            assert!(page.objects.iter().all(|o| o.owner.as_deref() == Some("bleepgate")));
            seen.extend(page.objects.into_iter().map(|o| o.key));
            match page.next_continuation_token {
                Some(next) => token = next,
                None => break,
            }
        }
        assert_eq!(seen, vec!["a", "b", "dir/x", "dir/y", "z"]);

        let after = gw
            .list_objects_v2(&ctx, "b1", "", "", false, "", 0, "dir/x")
            .await
            .unwrap();
        assert_eq!(after.key_count, 2);

        let err = gw
            .list_objects_v2(&ctx, "b1", "", "not-a-token", false, "", 0, "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_metadata_rejected_by_profile() {
        let dir = tempfile::tempdir().unwrap();
        let gw = Gateway::new(
            Arc::new(LocalBackend::new(dir.path()).unwrap()),
            Config::default(),
        );
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        let err = gw
            .put_object(&ctx, "b1", "k", Bytes::from("x"), &meta(&[("note", "bad\u{0}value")]), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.message().contains("note"));
    }

    #[tokio::test]
    async fn test_local_backend_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let gw = Gateway::new(
            Arc::new(LocalBackend::new(dir.path()).unwrap()),
            Config::default(),
        );
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        gw.put_object(&ctx, "b1", "a/b/c.txt", Bytes::from("deep"), &meta(&[("k", "v")]), None)
            .await
            .unwrap();
        let out = gw.get_object(&ctx, "b1", "a/b/c.txt", None).await.unwrap();
        assert_eq!(out.data, Bytes::from("deep"));
        assert_eq!(out.info.user_metadata.get("k").map(String::as_str), Some("v"));

        let err = gw
            .put_object(&ctx, "b1", "a//c", Bytes::from("x"), &ObjectMetadata::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let names: Vec<_> = gw
            .list_buckets(&ctx)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["b1"]);

        gw.delete_object(&ctx, "b1", "a/b/c.txt").await.unwrap();
        gw.delete_bucket(&ctx, "b1").await.unwrap();
    }

    #[tokio::test]
    async fn test_storage_info_and_shutdown() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        gw.new_multipart_upload(&ctx, "b1", "k", &ObjectMetadata::default())
            .await
            .unwrap();
        let info = gw.storage_info();
        assert_eq!(info.backend, "memory");
        assert_eq!(info.listing_order, ListingOrder::Lexicographic);
        assert_eq!(info.multipart_sessions, 1);
        assert!(gw.shutdown().await.is_ok());
    }

    #[test]
    fn test_bucket_name_rules() {
        let longest = "a".repeat(63);
        for good in ["abc", "my-bucket", "my.bucket.1", longest.as_str()] {
            assert!(validate_bucket_name(good).is_ok(), "{good}");
        }
        for bad in [
            "ab",
            "My-Bucket",
            "-abc",
            "abc-",
            ".hidden",
            "a..b",
            "192.168.1.1",
            "xn--abc",
            "name-s3alias",
            "name--ol-s3",
            "has_underscore",
        ] {
            assert!(validate_bucket_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_request_context_gets_deadline() {
        let gw = gateway();
        assert!(gw.request_context(Identity::Anonymous).deadline.is_some());

        let mut config = Config::default();
        config.gateway.request_timeout_secs = 0;
        let gw = Gateway::new(Arc::new(MemoryBackend::default()), config);
        assert!(gw.request_context(Identity::Anonymous).deadline.is_none());
    }

    #[tokio::test]
    async fn test_list_under_object_name_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        for gw in [
            gateway(),
            Gateway::new(Arc::new(LocalBackend::new(dir.path()).unwrap()), Config::default()),
        ] {
            let ctx = admin();
            gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
            gw.put_object(&ctx, "b1", "photos", Bytes::from("x"), &ObjectMetadata::default(), None)
                .await
                .unwrap();

            let listing = gw.list_objects(&ctx, "b1", "photos/", "", "/", 0).await.unwrap();
            assert!(listing.objects.is_empty());
            assert!(listing.prefixes.is_empty());
            let listing = gw.list_objects(&ctx, "b1", "photos//x", "", "", 0).await.unwrap();
            assert!(listing.objects.is_empty());
            let listing = gw.list_objects(&ctx, "b1", "photo", "", "/", 0).await.unwrap();
            assert_eq!(listing.objects.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_delete_bucket_refused_with_open_upload() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        let id = gw
            .new_multipart_upload(&ctx, "b1", "k2", &ObjectMetadata::default())
            .await
            .unwrap();

        let err = gw.delete_bucket(&ctx, "b1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(gw.get_bucket_info(&ctx, "b1").await.is_ok());

        gw.abort_multipart_upload(&ctx, "b1", "k2", &id).await.unwrap();
        gw.delete_bucket(&ctx, "b1").await.unwrap();
    }

    #[tokio::test]
    async fn test_complete_after_bucket_removed_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let stores: Vec<Arc<dyn BackendClient>> = vec![
            Arc::new(MemoryBackend::default()),
            Arc::new(LocalBackend::new(dir.path()).unwrap()),
        ];
        for backend in stores {
            let gw = Gateway::new(backend.clone(), Config::default());
            let ctx = admin();
            gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
            let id = gw
                .new_multipart_upload(&ctx, "b1", "k2", &ObjectMetadata::default())
                .await
                .unwrap();
            let p1 = gw
                .put_object_part(&ctx, "b1", "k2", &id, 1, Bytes::from("AA"), None, None)
                .await
                .unwrap();

            // Another client of the store removes the empty bucket.
            backend.rmdir("b1").await.unwrap();

            let err = gw
                .put_object_part(&ctx, "b1", "k2", &id, 2, Bytes::from("BB"), None, None)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
            let err = gw
                .complete_multipart_upload(
                    &ctx,
                    "b1",
                    "k2",
                    &id,
                    &[CompletedPart { part_number: 1, etag: p1.etag }],
                )
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
            assert!(backend.head("b1").await.is_err());
            assert!(backend.head("b1/k2").await.is_err());

            gw.abort_multipart_upload(&ctx, "b1", "k2", &id).await.unwrap();
            assert_eq!(gw.coordinator.session_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_multipart_operations_validate_names() {
        let gw = gateway();
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        gw.put_object(&ctx, "b1", "src", Bytes::from("x"), &ObjectMetadata::default(), None)
            .await
            .unwrap();
        let id = gw
            .new_multipart_upload(&ctx, "b1", "k2", &ObjectMetadata::default())
            .await
            .unwrap();
        let long_key = "k".repeat(MAX_KEY_LENGTH + 1);

        for (bucket, key) in [("Bad_Bucket", "k2"), ("b1", ""), ("b1", long_key.as_str())] {
            let errs = [
                gw.put_object_part(&ctx, bucket, key, &id, 1, Bytes::from("x"), None, None)
                    .await
                    .map(|_| ()),
                gw.copy_object_part(&ctx, "b1", "src", bucket, key, &id, 1, None)
                    .await
                    .map(|_| ()),
                gw.list_object_parts(&ctx, bucket, key, &id, 0, 0)
                    .await
                    .map(|_| ()),
                gw.abort_multipart_upload(&ctx, bucket, key, &id).await,
                gw.complete_multipart_upload(
                    &ctx,
                    bucket,
                    key,
                    &id,
                    &[CompletedPart { part_number: 1, etag: String::new() }],
                )
                .await
                .map(|_| ()),
            ];
            for (i, result) in errs.into_iter().enumerate() {
                let err = result.unwrap_err();
                assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{bucket}/{key} op {i}");
            }
        }
        assert_eq!(gw.coordinator.session_count(), 1);
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Op {
        GetObject,
        HeadObject,
        ListObjects,
        PutObject,
        DeleteObject,
        CopyObject,
        ListUploads,
        NewUpload,
        PutPart,
        CopyPart,
        ListParts,
        AbortUpload,
        CompleteUpload,
    }

    async fn run_anonymous(
        gw: &Gateway,
        op: Op,
        upload: &str,
        doomed_upload: &str,
        part_etag: &str,
    ) -> GatewayResult<()> {
        let anon = RequestContext::anonymous();
        let none = ObjectMetadata::default();
        match op {
            Op::GetObject => gw.get_object(&anon, "b1", "src", None).await.map(|_| ()),
            Op::HeadObject => gw.get_object_info(&anon, "b1", "src").await.map(|_| ()),
            Op::ListObjects => gw.list_objects(&anon, "b1", "", "", "", 0).await.map(|_| ()),
            Op::PutObject => gw
                .put_object(&anon, "b1", "new", Bytes::from("x"), &none, None)
                .await
                .map(|_| ()),
            Op::DeleteObject => gw.delete_object(&anon, "b1", "victim").await,
            Op::CopyObject => gw
                .copy_object(&anon, "b1", "src", "b1", "copy", None)
                .await
                .map(|_| ()),
            Op::ListUploads => gw
                .list_multipart_uploads(&anon, "b1", &UploadQuery::default())
                .await
                .map(|_| ()),
            Op::NewUpload => gw
                .new_multipart_upload(&anon, "b1", "mp-new", &none)
                .await
                .map(|_| ()),
            Op::PutPart => gw
                .put_object_part(&anon, "b1", "mp", upload, 2, Bytes::from("BB"), None, None)
                .await
                .map(|_| ()),
            Op::CopyPart => gw
                .copy_object_part(&anon, "b1", "src", "b1", "mp", upload, 3, None)
                .await
                .map(|_| ()),
            Op::ListParts => gw
                .list_object_parts(&anon, "b1", "mp", upload, 0, 0)
                .await
                .map(|_| ()),
            Op::AbortUpload => gw.abort_multipart_upload(&anon, "b1", "mp2", doomed_upload).await,
            Op::CompleteUpload => gw
                .complete_multipart_upload(
                    &anon,
                    "b1",
                    "mp",
                    upload,
                    &[CompletedPart { part_number: 1, etag: part_etag.to_string() }],
                )
                .await
                .map(|_| ()),
        }
    }

    #[tokio::test]
    async fn test_anonymous_access_per_canned_policy() {
        use Op::*;
        const READS: &[Op] = &[GetObject, HeadObject, ListObjects];
        const WRITES: &[Op] = &[
            PutObject, DeleteObject, ListUploads, NewUpload, PutPart, ListParts, AbortUpload,
            CompleteUpload,
        ];
        const BOTH: &[Op] = &[CopyObject, CopyPart];
        // Operations run in this order; completion goes last.
        const ORDER: &[Op] = &[
            GetObject, HeadObject, ListObjects, PutObject, DeleteObject, CopyObject, ListUploads,
            NewUpload, PutPart, CopyPart, ListParts, AbortUpload, CompleteUpload,
        ];

        for canned in [
            CannedPolicy::None,
            CannedPolicy::ReadOnly,
            CannedPolicy::WriteOnly,
            CannedPolicy::ReadWrite,
        ] {
            let gw = gateway();
            let ctx = admin();
            gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
            for key in ["src", "victim"] {
                gw.put_object(&ctx, "b1", key, Bytes::from("data"), &ObjectMetadata::default(), None)
                    .await
                    .unwrap();
            }
            let upload = gw
                .new_multipart_upload(&ctx, "b1", "mp", &ObjectMetadata::default())
                .await
                .unwrap();
            let part = gw
                .put_object_part(&ctx, "b1", "mp", &upload, 1, Bytes::from("AA"), None, None)
                .await
                .unwrap();
            let doomed = gw
                .new_multipart_upload(&ctx, "b1", "mp2", &ObjectMetadata::default())
                .await
                .unwrap();
            if canned != CannedPolicy::None {
                gw.set_canned_policy(&ctx, "b1", "", canned).await.unwrap();
            }

            let (read, write) = match canned {
                CannedPolicy::None => (false, false),
                CannedPolicy::ReadOnly => (true, false),
                CannedPolicy::WriteOnly => (false, true),
                CannedPolicy::ReadWrite => (true, true),
            };
            for &op in ORDER {
                let allowed = if READS.contains(&op) {
                    read
                } else if WRITES.contains(&op) {
                    write
                } else {
                    assert!(BOTH.contains(&op));
                    read && write
                };
                let result = run_anonymous(&gw, op, &upload, &doomed, &part.etag).await;
                if allowed {
                    assert!(result.is_ok(), "{canned:?} {op:?}: {result:?}");
                } else {
                    let kind = result.map_err(|e| e.kind());
                    assert_eq!(kind, Err(ErrorKind::AccessDenied), "{canned:?} {op:?}");
                }
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_of_different_keys() {
        let dir = tempfile::tempdir().unwrap();
        let gw = Arc::new(Gateway::new(
            Arc::new(LocalBackend::new(dir.path()).unwrap()),
            Config::default(),
        ));
        let ctx = admin();
        gw.make_bucket_with_location(&ctx, "b1", "").await.unwrap();
        for i in 0..8 {
            let key = format!("dir{i}/old");
            gw.put_object(&ctx, "b1", &key, Bytes::from("x"), &ObjectMetadata::default(), None)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..8 {
            let (gw, ctx) = (gw.clone(), ctx.clone());
            handles.push(tokio::spawn(async move {
                gw.delete_object(&ctx, "b1", &format!("dir{i}/old")).await?;
                for j in 0..10 {
                    let key = format!("dir{i}/obj{j}");
                    let body = Bytes::from(key.clone());
                    gw.put_object(&ctx, "b1", &key, body, &ObjectMetadata::default(), None)
                        .await?;
                }
                Ok::<_, GatewayError>(())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let listing = gw.list_objects(&ctx, "b1", "", "", "", 1000).await.unwrap();
        assert_eq!(listing.objects.len(), 80);
        let out = gw.get_object(&ctx, "b1", "dir3/obj7", None).await.unwrap();
        assert_eq!(out.data, Bytes::from("dir3/obj7"));
    }
}
