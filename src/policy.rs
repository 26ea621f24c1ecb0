//! Bucket policies.
//!
//! S3 bucket policy documents, their evaluation for anonymous callers, the
//! canned read-only / write-only / read-write policies, and a store that
//! keeps one document per bucket in the backend under
//! `.bleepgate/policies/{bucket}.json`.
//!
//! Evaluation follows the usual IAM rule: an explicit `Deny` wins, else any
//! matching `Allow` grants, else the request is denied.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::context::RequestContext;
use crate::errors::{ErrorKind, GatewayError, GatewayResult};
use crate::meta::NativeMetadata;
use crate::storage::backend::BackendClient;

/// Policy language version written by the gateway.
pub const POLICY_VERSION: &str = "2012-10-17";

/// Backend directory holding stored policy documents.
pub const POLICY_ROOT: &str = ".bleepgate/policies";

/// Prefix of every S3 resource ARN.
const ARN_PREFIX: &str = "arn:aws:s3:::";

/// Actions the gateway evaluates against bucket policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Action {
    ListBucket,
    ListBucketMultipartUploads,
    GetObject,
    PutObject,
    DeleteObject,
    ListMultipartUploadParts,
    AbortMultipartUpload,
}

impl S3Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            S3Action::ListBucket => "s3:ListBucket",
            S3Action::ListBucketMultipartUploads => "s3:ListBucketMultipartUploads",
            S3Action::GetObject => "s3:GetObject",
            S3Action::PutObject => "s3:PutObject",
            S3Action::DeleteObject => "s3:DeleteObject",
            S3Action::ListMultipartUploadParts => "s3:ListMultipartUploadParts",
            S3Action::AbortMultipartUpload => "s3:AbortMultipartUpload",
        }
    }

    /// Whether the action's resource is an object ARN rather than the bucket.
    pub fn is_object_level(&self) -> bool {
        !matches!(
            self,
            S3Action::ListBucket | S3Action::ListBucketMultipartUploads
        )
    }

    /// Whether the action modifies backend state.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            S3Action::PutObject | S3Action::DeleteObject | S3Action::AbortMultipartUpload
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    /// Outcome of a statement with this effect whose match result is `matched`.
    pub fn is_allowed(self, matched: bool) -> bool {
        match self {
            Effect::Allow => matched,
            Effect::Deny => !matched,
        }
    }
}

/// A JSON value that may be a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl OneOrMany {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let items: &[String] = match self {
            OneOrMany::One(s) => std::slice::from_ref(s),
            OneOrMany::Many(v) => v,
        };
        items.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl From<Vec<String>> for OneOrMany {
    fn from(items: Vec<String>) -> Self {
        OneOrMany::Many(items)
    }
}

/// `"Principal": "*"` or `"Principal": {"AWS": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Principal {
    Wildcard(String),
    Aws {
        #[serde(rename = "AWS")]
        aws: OneOrMany,
    },
}

impl Principal {
    pub fn anyone() -> Self {
        Principal::Aws {
            aws: OneOrMany::Many(vec!["*".to_string()]),
        }
    }

    /// Whether the principal covers anonymous callers.
    pub fn matches_anonymous(&self) -> bool {
        match self {
            Principal::Wildcard(s) => s == "*",
            Principal::Aws { aws } => aws.iter().any(|p| p == "*"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    #[serde(rename = "Sid", default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(rename = "Effect")]
    pub effect: Effect,
    #[serde(rename = "Principal")]
    pub principal: Principal,
    #[serde(rename = "Action", default)]
    pub actions: OneOrMany,
    #[serde(rename = "Resource", default)]
    pub resources: OneOrMany,
}

impl Statement {
    /// Whether the statement applies to `action` on `resource` for an
    /// anonymous caller.
    fn matches(&self, action: S3Action, resource: &str) -> bool {
        let action = action.as_str().to_ascii_lowercase();
        self.principal.matches_anonymous()
            && self
                .actions
                .iter()
                .any(|pattern| wildcard_match(&pattern.to_ascii_lowercase(), &action))
            && self
                .resources
                .iter()
                .any(|pattern| wildcard_match(pattern, resource))
    }
}

/// An S3 bucket policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketPolicy {
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "Statement", default)]
    pub statements: Vec<Statement>,
}

impl BucketPolicy {
    /// Parse and validate a policy document for `bucket`.
    pub fn parse(bucket: &str, json: &[u8]) -> GatewayResult<Self> {
        let policy: BucketPolicy = serde_json::from_slice(json)
            .map_err(|e| GatewayError::invalid_argument(format!("malformed policy: {e}")))?;
        policy.validate(bucket)?;
        Ok(policy)
    }

    pub fn to_json(&self) -> GatewayResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| GatewayError::internal(format!("failed to encode policy: {e}")))
    }

    /// Check the document is well formed and only names `bucket`.
    pub fn validate(&self, bucket: &str) -> GatewayResult<()> {
        if !self.version.is_empty() && self.version != POLICY_VERSION && self.version != "2008-10-17"
        {
            return Err(GatewayError::invalid_argument(format!(
                "unsupported policy version: {}",
                self.version
            )));
        }
        if self.statements.is_empty() {
            return Err(GatewayError::invalid_argument("policy has no statements"));
        }
        let bucket_arn = format!("{ARN_PREFIX}{bucket}");
        for statement in &self.statements {
            if statement.actions.is_empty() {
                return Err(GatewayError::invalid_argument("policy statement has no actions"));
            }
            if statement.resources.is_empty() {
                return Err(GatewayError::invalid_argument("policy statement has no resources"));
            }
            for resource in statement.resources.iter() {
                let names_bucket = resource == bucket_arn
                    || resource
                        .strip_prefix(bucket_arn.as_str())
                        .map(|rest| rest.starts_with('/'))
                        .unwrap_or(false);
                if !names_bucket {
                    return Err(GatewayError::invalid_argument(format!(
                        "policy resource {resource} does not belong to bucket {bucket}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Evaluate an anonymous request for `action` on `bucket` / `key`.
    pub fn is_allowed_anonymous(&self, action: S3Action, bucket: &str, key: &str) -> bool {
        let resource = if action.is_object_level() {
            format!("{ARN_PREFIX}{bucket}/{key}")
        } else {
            format!("{ARN_PREFIX}{bucket}")
        };

        for statement in self.statements.iter().filter(|s| s.effect == Effect::Deny) {
            if !statement.effect.is_allowed(statement.matches(action, &resource)) {
                return false;
            }
        }
        self.statements
            .iter()
            .filter(|s| s.effect == Effect::Allow)
            .any(|s| s.effect.is_allowed(s.matches(action, &resource)))
    }

    /// Classify the anonymous access this policy grants under `prefix`.
    pub fn canned_for(&self, bucket: &str, prefix: &str) -> CannedPolicy {
        let sample = format!("{prefix}\u{1}sample");
        let read = self.is_allowed_anonymous(S3Action::GetObject, bucket, &sample);
        let write = self.is_allowed_anonymous(S3Action::PutObject, bucket, &sample);
        match (read, write) {
            (true, true) => CannedPolicy::ReadWrite,
            (true, false) => CannedPolicy::ReadOnly,
            (false, true) => CannedPolicy::WriteOnly,
            (false, false) => CannedPolicy::None,
        }
    }
}

/// Predefined anonymous access levels for a key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CannedPolicy {
    None,
    #[serde(rename = "readonly")]
    ReadOnly,
    #[serde(rename = "writeonly")]
    WriteOnly,
    #[serde(rename = "readwrite")]
    ReadWrite,
}

impl CannedPolicy {
    /// Build the policy document granting this access to `bucket/prefix*`.
    /// Returns `None` for [`CannedPolicy::None`].
    pub fn document(self, bucket: &str, prefix: &str) -> Option<BucketPolicy> {
        let bucket_arn = format!("{ARN_PREFIX}{bucket}");
        let object_arn = format!("{bucket_arn}/{prefix}*");

        let read_bucket = ["s3:ListBucket"];
        let read_object = ["s3:GetObject"];
        let write_bucket = ["s3:ListBucketMultipartUploads"];
        let write_object = [
            "s3:PutObject",
            "s3:DeleteObject",
            "s3:AbortMultipartUpload",
            "s3:ListMultipartUploadParts",
        ];

        let (bucket_actions, object_actions): (Vec<&str>, Vec<&str>) = match self {
            CannedPolicy::None => return None,
            CannedPolicy::ReadOnly => (read_bucket.to_vec(), read_object.to_vec()),
            CannedPolicy::WriteOnly => (write_bucket.to_vec(), write_object.to_vec()),
            CannedPolicy::ReadWrite => (
                [read_bucket.as_slice(), write_bucket.as_slice()].concat(),
                [read_object.as_slice(), write_object.as_slice()].concat(),
            ),
        };

        let statement = |actions: Vec<&str>, resource: String| Statement {
            sid: None,
            effect: Effect::Allow,
            principal: Principal::anyone(),
            actions: actions.into_iter().map(str::to_string).collect::<Vec<_>>().into(),
            resources: OneOrMany::Many(vec![resource]),
        };
        Some(BucketPolicy {
            version: POLICY_VERSION.to_string(),
            statements: vec![
                statement(bucket_actions, bucket_arn),
                statement(object_actions, object_arn),
            ],
        })
    }
}

/// `*` matches any run of characters, `?` exactly one.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_ti = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Backend-persisted policy documents, one per bucket.
pub struct PolicyStore {
    backend: Arc<dyn BackendClient>,
}

impl PolicyStore {
    pub fn new(backend: Arc<dyn BackendClient>) -> Self {
        Self { backend }
    }

    fn path(bucket: &str) -> String {
        format!("{POLICY_ROOT}/{bucket}.json")
    }

    /// Load the policy for `bucket`, `None` if it has none.
    pub async fn get(
        &self,
        ctx: &RequestContext,
        bucket: &str,
    ) -> GatewayResult<Option<BucketPolicy>> {
        match ctx.run(self.backend.get(&Self::path(bucket), None)).await {
            Ok(obj) => {
                let policy: BucketPolicy = serde_json::from_slice(&obj.data).map_err(|e| {
                    GatewayError::internal(format!("stored policy for {bucket} is corrupt: {e}"))
                })?;
                Ok(Some(policy))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace the policy for `bucket`. Latest write wins.
    pub async fn put(
        &self,
        ctx: &RequestContext,
        bucket: &str,
        policy: &BucketPolicy,
    ) -> GatewayResult<()> {
        let body = Bytes::from(policy.to_json()?);
        let mut meta = NativeMetadata::new();
        meta.insert("content-type".to_string(), "application/json".to_string());
        ctx.run(self.backend.put(&Self::path(bucket), body, meta))
            .await?;
        debug!("Stored bucket policy for {}", bucket);
        Ok(())
    }

    /// Remove the policy for `bucket`. Returns whether one existed.
    pub async fn delete(&self, ctx: &RequestContext, bucket: &str) -> GatewayResult<bool> {
        match ctx.run(self.backend.delete(&Self::path(bucket))).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
