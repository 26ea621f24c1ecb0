//! Per-request context.
//!
//! Every gateway operation receives a [`RequestContext`] naming the caller
//! and carrying the request's cancellation token and optional deadline.
//! Backend calls go through [`RequestContext::run`], which races them
//! against both and normalizes their errors.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{GatewayError, GatewayResult};
use crate::normalize::normalize;
use crate::storage::backend::BackendResult;

/// Who is making the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// A caller whose credentials the front end has verified.
    Verified { access_key: String },
    /// An unauthenticated caller, subject to bucket policy.
    Anonymous,
}

/// Caller identity plus cancellation for one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub identity: Identity,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn verified(access_key: impl Into<String>) -> Self {
        Self::new(Identity::Verified {
            access_key: access_key.into(),
        })
    }

    pub fn anonymous() -> Self {
        Self::new(Identity::Anonymous)
    }

    /// Use `token` for cancellation (typically a child of the connection's).
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Fail every backend call that has not finished `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.identity, Identity::Anonymous)
    }

    /// Run a backend call, dropping it on cancellation or deadline expiry.
    pub async fn run<T, F>(&self, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(GatewayError::timeout("request cancelled"));
        }
        let deadline = self.deadline;
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GatewayError::timeout("request cancelled")),
            _ = expiry => Err(GatewayError::timeout("request deadline exceeded")),
            res = fut => res.map_err(normalize),
        }
    }

    /// Fail with `Timeout` if the request is already cancelled or expired.
    pub fn check(&self) -> GatewayResult<()> {
        if self.cancel.is_cancelled() {
            return Err(GatewayError::timeout("request cancelled"));
        }
        if matches!(self.deadline, Some(at) if Instant::now() >= at) {
            return Err(GatewayError::timeout("request deadline exceeded"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::storage::backend::BackendError;

    #[tokio::test]
    async fn test_run_passes_result_through() {
        let ctx = RequestContext::verified("AKIA");
        let value = ctx.run(async { Ok::<_, BackendError>(7) }).await.unwrap();
        assert_eq!(value, 7);

        let err = ctx
            .run(async { Err::<(), _>(BackendError::NotFound("b/k".into())) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let ctx = RequestContext::anonymous();
        ctx.cancel.cancel();
        let err = ctx
            .run(async { Ok::<_, BackendError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(ctx.check().is_err());
    }

    #[tokio::test]
    async fn test_cancel_drops_inflight_call() {
        let ctx = RequestContext::verified("AKIA");
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, BackendError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let ctx = RequestContext::verified("AKIA").with_timeout(Duration::from_millis(10));
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, BackendError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.message().contains("deadline"));
    }
}
