//! Metadata translation between the gateway and backend encodings.
//!
//! The gateway side is [`ObjectMetadata`]: a content type, a content length,
//! an ETag and case-insensitive user metadata.  Each backend describes how it
//! stores metadata with a [`MetadataProfile`]; [`to_native`] and
//! [`from_native`] convert between the two.  Keys a backend cannot represent
//! are reported in [`Translation::rejected`] rather than dropped.

use std::collections::{BTreeMap, HashMap};

use crate::errors::{GatewayError, GatewayResult};

/// Prefix S3 clients use for user metadata headers.
pub const AMZ_META_PREFIX: &str = "x-amz-meta-";

/// Default content type when none was supplied.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Backend-native metadata: a flat string map in the backend's own naming.
pub type NativeMetadata = BTreeMap<String, String>;

/// Gateway-side object metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// MIME content type, if known.
    pub content_type: Option<String>,
    /// Payload length in bytes, if known.
    pub content_length: Option<u64>,
    /// Quoted content hash, if known.
    pub etag: Option<String>,
    /// User metadata with lowercased keys and no `x-amz-meta-` prefix.
    pub user: BTreeMap<String, String>,
}

impl ObjectMetadata {
    /// Build metadata from an S3-style header map.
    ///
    /// `content-type` is lifted into the distinguished field,
    /// `content-length` and `etag` are ignored (the gateway computes them),
    /// everything else becomes user metadata.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut meta = ObjectMetadata::default();
        for (key, value) in map {
            match key.to_ascii_lowercase().as_str() {
                "content-type" => meta.content_type = Some(value.clone()),
                "content-length" | "etag" => {}
                _ => meta.insert_user(key, value),
            }
        }
        meta
    }

    /// Insert a user metadata entry. Keys are case-insensitive.
    pub fn insert_user(&mut self, key: &str, value: &str) {
        let lower = key.to_ascii_lowercase();
        let name = lower
            .strip_prefix(AMZ_META_PREFIX)
            .map(str::to_string)
            .unwrap_or(lower);
        self.user.insert(name, value.to_string());
    }

    /// Case-insensitive lookup of a user metadata value.
    pub fn user_value(&self, key: &str) -> Option<&str> {
        let lower = key.to_ascii_lowercase();
        let name = lower.strip_prefix(AMZ_META_PREFIX).unwrap_or(&lower);
        self.user.get(name).map(String::as_str)
    }

    /// Content type, falling back to `application/octet-stream`.
    pub fn content_type_or_default(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    /// Render as an S3 response header map (`x-amz-meta-*` plus content type).
    pub fn to_s3_headers(&self) -> HashMap<String, String> {
        let mut headers: HashMap<String, String> = self
            .user
            .iter()
            .map(|(k, v)| (format!("{AMZ_META_PREFIX}{k}"), v.clone()))
            .collect();
        headers.insert(
            "content-type".to_string(),
            self.content_type_or_default().to_string(),
        );
        headers
    }
}

/// How a backend encodes metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataProfile {
    /// Prefix prepended to user metadata keys in the native map.
    pub user_prefix: &'static str,
    /// Native key holding the content type.
    pub content_type_key: &'static str,
    /// Upper bound on the encoded size of all user entries (0 = unlimited).
    pub max_total_bytes: usize,
    /// Keys must be HTTP header tokens and values visible ASCII.
    pub header_safe: bool,
}

impl MetadataProfile {
    /// Structured sidecar storage (memory and local backends).
    pub const SIDECAR: MetadataProfile = MetadataProfile {
        user_prefix: "user.",
        content_type_key: "content-type",
        max_total_bytes: 0,
        header_safe: false,
    };

    /// Manta-style `m-*` HTTP headers, capped at 4 KiB.
    pub const MANTA_HEADERS: MetadataProfile = MetadataProfile {
        user_prefix: "m-",
        content_type_key: "content-type",
        max_total_bytes: 4096,
        header_safe: true,
    };
}

/// A user metadata key the target backend could not store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedKey {
    pub key: String,
    pub reason: &'static str,
}

/// Result of encoding [`ObjectMetadata`] for a backend.
#[derive(Debug, Clone, Default)]
pub struct Translation {
    /// Entries the backend can store.
    pub native: NativeMetadata,
    /// Entries the backend cannot store.
    pub rejected: Vec<RejectedKey>,
}

impl Translation {
    /// Fail with `InvalidArgument` if any key was rejected.
    pub fn into_result(self) -> GatewayResult<NativeMetadata> {
        if self.rejected.is_empty() {
            return Ok(self.native);
        }
        let detail = self
            .rejected
            .iter()
            .map(|r| format!("{} ({})", r.key, r.reason))
            .collect::<Vec<_>>()
            .join(", ");
        Err(GatewayError::invalid_argument(format!(
            "metadata not representable on this backend: {detail}"
        )))
    }
}

/// Encode gateway metadata into the backend's native representation.
pub fn to_native(meta: &ObjectMetadata, profile: &MetadataProfile) -> Translation {
    let mut translation = Translation::default();
    translation.native.insert(
        profile.content_type_key.to_string(),
        meta.content_type_or_default().to_string(),
    );

    let mut used = 0usize;
    for (key, value) in &meta.user {
        if let Some(reason) = reject_reason(key, value, profile) {
            translation.rejected.push(RejectedKey {
                key: key.clone(),
                reason,
            });
            continue;
        }
        let native_key = format!("{}{}", profile.user_prefix, key);
        let cost = native_key.len() + value.len();
        if profile.max_total_bytes > 0 && used + cost > profile.max_total_bytes {
            translation.rejected.push(RejectedKey {
                key: key.clone(),
                reason: "exceeds backend metadata size limit",
            });
            continue;
        }
        used += cost;
        translation.native.insert(native_key, value.clone());
    }
    translation
}

/// Decode backend-native metadata. Keys outside the profile's user prefix
/// and content-type key are backend bookkeeping and are skipped.
pub fn from_native(native: &NativeMetadata, profile: &MetadataProfile) -> ObjectMetadata {
    let mut meta = ObjectMetadata::default();
    for (key, value) in native {
        let lower = key.to_ascii_lowercase();
        if lower == profile.content_type_key {
            meta.content_type = Some(value.clone());
        } else if let Some(name) = lower.strip_prefix(profile.user_prefix) {
            if !name.is_empty() {
                meta.user.insert(name.to_string(), value.clone());
            }
        }
    }
    meta
}

fn reject_reason(key: &str, value: &str, profile: &MetadataProfile) -> Option<&'static str> {
    if key.is_empty() {
        return Some("empty key");
    }
    if profile.header_safe {
        if !key.bytes().all(is_token_byte) {
            return Some("key is not a valid header name");
        }
        if !value.bytes().all(|b| b == b'\t' || (0x20..0x7f).contains(&b)) {
            return Some("value is not visible ASCII");
        }
    } else if value.chars().any(|c| c.is_control() && c != '\t') {
        return Some("value contains control characters");
    }
    None
}

/// RFC 7230 `tchar`.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
