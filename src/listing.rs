//! Listing pagination.
//!
//! Turns a backend's recursive listing into S3-style pages: ascending key
//! order, delimiter collapsing into common prefixes, and resumable cursors.
//!
//! Backends that list in byte order are streamed page by page; the rest are
//! drained for the prefix and sorted in memory.  Either way the resume
//! marker (`after`) is authoritative: every key at or before it, and every
//! key under it when it is a common prefix, is skipped.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::RequestContext;
use crate::errors::{ErrorKind, GatewayError, GatewayResult};
use crate::storage::backend::{BackendClient, BackendEntry, EntryKind, ListRequest, ListingOrder};

/// Upper bound (and default) for keys per listing page.
pub const MAX_LIST_LIMIT: usize = 1000;

/// Entries requested from the backend per round trip.
const BACKEND_PAGE: usize = 1000;

/// Cursor format version.
const CURSOR_VERSION: u32 = 1;

/// Clamp a caller-supplied page size to `1..=1000`, with 0 meaning 1000.
pub fn clamp_limit(limit: usize) -> usize {
    if limit == 0 {
        MAX_LIST_LIMIT
    } else {
        limit.min(MAX_LIST_LIMIT)
    }
}

/// Decoded continuation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListCursor {
    /// Version tag.
    pub v: u32,
    /// Last key or common prefix returned.
    pub after: String,
    /// Backend cursor of the page holding `after`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<String>,
}

impl ListCursor {
    pub fn new(after: impl Into<String>, inner: Option<String>) -> Self {
        Self {
            v: CURSOR_VERSION,
            after: after.into(),
            inner,
        }
    }

    /// Encode as an opaque URL-safe token.
    pub fn encode(&self) -> String {
        // Serializing a struct of strings cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode a token produced by [`ListCursor::encode`].
    pub fn decode(token: &str) -> GatewayResult<Self> {
        let malformed = || GatewayError::invalid_argument("malformed continuation token");
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| malformed())?;
        let cursor: ListCursor = serde_json::from_slice(&raw).map_err(|_| malformed())?;
        if cursor.v != CURSOR_VERSION {
            return Err(malformed());
        }
        Ok(cursor)
    }
}

/// One listing request against a bucket.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Bucket (top-level backend directory) being listed.
    pub scope: String,
    /// Key prefix within the bucket.
    pub prefix: String,
    /// Delimiter; empty disables collapsing.
    pub delimiter: String,
    /// Resume after this key or common prefix.
    pub after: Option<String>,
    /// Backend cursor to try before falling back to skipping.
    pub inner: Option<String>,
    /// Maximum keys plus common prefixes to return (already clamped).
    pub limit: usize,
}

/// An object row in a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub modified: DateTime<Utc>,
}

/// One page of listing results.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub objects: Vec<ListedObject>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// Last key or prefix returned, set when truncated.
    pub next_marker: Option<String>,
    /// Encoded [`ListCursor`], set when truncated.
    pub next_cursor: Option<String>,
}

/// Accumulates one page from a sorted stream of keys.
struct Collector<'a> {
    query: &'a ListQuery,
    listing: Listing,
    last_prefix: Option<String>,
    last_returned: Option<String>,
    done: bool,
}

impl<'a> Collector<'a> {
    fn new(query: &'a ListQuery) -> Self {
        Self {
            query,
            listing: Listing::default(),
            last_prefix: None,
            last_returned: None,
            done: false,
        }
    }

    fn count(&self) -> usize {
        self.listing.objects.len() + self.listing.common_prefixes.len()
    }

    /// Offer one backend entry. Entries must arrive in ascending order.
    fn offer(&mut self, entry: &BackendEntry) {
        if self.done || entry.kind != EntryKind::Object {
            return;
        }
        let Some(key) = entry
            .path
            .strip_prefix(self.query.scope.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return;
        };
        if key.is_empty() || !key.starts_with(self.query.prefix.as_str()) {
            return;
        }
        if let Some(after) = self.query.after.as_deref() {
            if key <= after {
                return;
            }
            if !self.query.delimiter.is_empty()
                && after.ends_with(self.query.delimiter.as_str())
                && key.starts_with(after)
            {
                return;
            }
        }

        let common_prefix = if self.query.delimiter.is_empty() {
            None
        } else {
            key[self.query.prefix.len()..]
                .find(self.query.delimiter.as_str())
                .map(|pos| {
                    key[..self.query.prefix.len() + pos + self.query.delimiter.len()].to_string()
                })
        };
        if let Some(cp) = common_prefix.as_deref() {
            if self.last_prefix.as_deref() == Some(cp) {
                return;
            }
        }

        if self.count() >= self.query.limit {
            self.listing.is_truncated = true;
            self.done = true;
            return;
        }

        match common_prefix {
            Some(cp) => {
                self.last_prefix = Some(cp.clone());
                self.last_returned = Some(cp.clone());
                self.listing.common_prefixes.push(cp);
            }
            None => {
                self.last_returned = Some(key.to_string());
                self.listing.objects.push(ListedObject {
                    key: key.to_string(),
                    size: entry.size,
                    etag: entry.etag.clone(),
                    modified: entry.modified,
                });
            }
        }
    }

    fn finish(mut self, inner: Option<String>) -> Listing {
        if self.listing.is_truncated {
            if let Some(last) = self.last_returned.take() {
                self.listing.next_cursor = Some(ListCursor::new(last.clone(), inner).encode());
                self.listing.next_marker = Some(last);
            }
        }
        self.listing
    }
}

/// Produce one page of results for `query`.
pub async fn paginate(
    backend: &dyn BackendClient,
    ctx: &RequestContext,
    query: &ListQuery,
) -> GatewayResult<Listing> {
    let path_prefix = format!("{}/{}", query.scope, query.prefix);
    match backend.capabilities().listing_order {
        ListingOrder::Lexicographic => stream_sorted(backend, ctx, query, &path_prefix).await,
        ListingOrder::Unordered => drain_and_sort(backend, ctx, query, &path_prefix).await,
    }
}

async fn stream_sorted(
    backend: &dyn BackendClient,
    ctx: &RequestContext,
    query: &ListQuery,
    path_prefix: &str,
) -> GatewayResult<Listing> {
    let mut collector = Collector::new(query);
    let mut cursor = query.inner.clone();
    let mut first = true;

    loop {
        let request = ListRequest {
            prefix: path_prefix.to_string(),
            cursor: cursor.clone(),
            limit: BACKEND_PAGE,
            recursive: true,
        };
        let page = match ctx.run(backend.list(request)).await {
            Ok(page) => page,
            Err(e) if first && cursor.is_some() && e.kind() == ErrorKind::InvalidArgument => {
                debug!("backend rejected wrapped cursor, restarting from marker: {}", e);
                cursor = None;
                first = false;
                continue;
            }
            Err(e) => return Err(e),
        };
        first = false;

        for entry in &page.entries {
            collector.offer(entry);
            if collector.done {
                return Ok(collector.finish(cursor));
            }
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(collector.finish(None)),
        }
    }
}

async fn drain_and_sort(
    backend: &dyn BackendClient,
    ctx: &RequestContext,
    query: &ListQuery,
    path_prefix: &str,
) -> GatewayResult<Listing> {
    let mut all = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let request = ListRequest {
            prefix: path_prefix.to_string(),
            cursor: cursor.take(),
            limit: BACKEND_PAGE,
            recursive: true,
        };
        let page = ctx.run(backend.list(request)).await?;
        all.extend(page.entries);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    all.sort_by(|a, b| a.path.cmp(&b.path));

    let mut collector = Collector::new(query);
    for entry in &all {
        collector.offer(entry);
        if collector.done {
            break;
        }
    }
    Ok(collector.finish(None))
}
