//! Backend error normalization.
//!
//! Converts a [`BackendError`] into exactly one [`GatewayError`].  HTTP
//! error responses are classified by the error code in their body when it
//! is recognized (Manta and Azure JSON or S3/Azure XML error documents),
//! otherwise by status code.

use http::StatusCode;
use serde::Deserialize;
use std::io;

use crate::errors::GatewayError;
use crate::storage::backend::BackendError;

/// JSON error body, as returned by Manta and other REST stores.
#[derive(Debug, Deserialize)]
struct JsonErrorBody {
    #[serde(alias = "Code")]
    code: String,
    #[serde(default, alias = "Message")]
    message: String,
}

/// XML `<Error>` document, as returned by S3 and Azure.
#[derive(Debug, Deserialize)]
struct XmlErrorBody {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

/// Coarse classification used while mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    NotFound,
    AlreadyExists,
    AccessDenied,
    InvalidArgument,
    NotImplemented,
    Timeout,
    Unavailable,
    Internal,
}

impl Class {
    fn into_error(self, message: String) -> GatewayError {
        match self {
            Class::NotFound => GatewayError::not_found(message),
            Class::AlreadyExists => GatewayError::already_exists(message),
            Class::AccessDenied => GatewayError::access_denied(message),
            Class::InvalidArgument => GatewayError::invalid_argument(message),
            Class::NotImplemented => GatewayError::not_implemented(message),
            Class::Timeout => GatewayError::timeout(message),
            Class::Unavailable => GatewayError::unavailable(message),
            Class::Internal => GatewayError::internal(message),
        }
    }
}

/// Normalize a backend failure into the gateway taxonomy.
pub fn normalize(err: BackendError) -> GatewayError {
    match err {
        BackendError::Status { status, body } => from_http(status, &body),
        BackendError::NotFound(path) => GatewayError::not_found(format!("no such path: {path}")),
        BackendError::AlreadyExists(path) => {
            GatewayError::already_exists(format!("path already exists: {path}"))
        }
        BackendError::NotEmpty(path) => {
            GatewayError::invalid_argument(format!("directory not empty: {path}"))
        }
        BackendError::InvalidPath(path) => {
            GatewayError::invalid_argument(format!("path not representable: {path}"))
        }
        BackendError::InvalidRange { start, size } => GatewayError::invalid_argument(format!(
            "range start {start} not satisfiable for object of {size} bytes"
        )),
        e @ BackendError::CapacityExceeded { .. } => GatewayError::unavailable(e.to_string()),
        BackendError::Unsupported(op) => {
            GatewayError::not_implemented(format!("backend does not support {op}"))
        }
        BackendError::Io(e) => from_io(&e),
        BackendError::Timeout => GatewayError::timeout("backend request timed out"),
        BackendError::Transport(msg) => GatewayError::unavailable(format!("transport: {msg}")),
    }
}

impl From<BackendError> for GatewayError {
    fn from(err: BackendError) -> Self {
        normalize(err)
    }
}

/// Classify an HTTP error response.
pub fn from_http(status: StatusCode, body: &str) -> GatewayError {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        // The status line alone is not enough to classify the failure.
        return GatewayError::internal(format!(
            "backend returned HTTP {}: no error detail available",
            status.as_u16()
        ));
    }

    let Some((code, message)) = parse_error_body(trimmed) else {
        return GatewayError::internal(format!(
            "backend returned HTTP {}: unparsable error body",
            status.as_u16()
        ));
    };

    let class = by_code(&code).unwrap_or_else(|| by_status(status));
    let detail = if message.is_empty() {
        code
    } else {
        format!("{code}: {message}")
    };
    class.into_error(detail)
}

/// Extract `(code, message)` from a JSON or XML error document.
fn parse_error_body(body: &str) -> Option<(String, String)> {
    if body.starts_with('{') {
        let parsed: JsonErrorBody = serde_json::from_str(body).ok()?;
        return Some((parsed.code, parsed.message));
    }
    if body.starts_with('<') && body.contains("<Error") {
        let parsed: XmlErrorBody = quick_xml::de::from_str(body).ok()?;
        return Some((parsed.code, parsed.message));
    }
    None
}

/// Map a recognized backend error code.
fn by_code(code: &str) -> Option<Class> {
    let class = match code {
        "ResourceNotFound" | "NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" | "BlobNotFound"
        | "ContainerNotFound" | "DirectoryDoesNotExist" | "LinkNotFound" => Class::NotFound,

        "BucketAlreadyExists" | "BucketAlreadyOwnedByYou" | "ContainerAlreadyExists"
        | "BlobAlreadyExists" | "ConcurrentRequest" => Class::AlreadyExists,

        "AuthorizationFailed" | "AuthorizationRequired" | "AccessDenied"
        | "InvalidCredentials" | "InvalidSignature" | "InvalidKeyId" | "AuthenticationFailed"
        | "SignatureDoesNotMatch" | "InvalidAccessKeyId" | "AccountBlocked" => {
            Class::AccessDenied
        }

        "DirectoryNotEmpty" | "BucketNotEmpty" | "InvalidArgument" | "InvalidRange"
        | "RequestedRangeNotSatisfiable" | "InvalidPart" | "InvalidPartOrder"
        | "EntityTooSmall" | "EntityTooLarge" | "InvalidBucketName" | "ParentNotDirectory"
        | "BadRequest" | "InvalidQueryParameterValue" | "InvalidHeaderValue"
        | "InvalidUpdate" | "DirectoryLimitExceeded" | "MissingContentLength"
        | "InvalidDigest" | "BadDigest" | "ChecksumError" | "ContentMD5Mismatch" => {
            Class::InvalidArgument
        }

        "NotImplemented" | "MethodNotAllowed" | "UnsupportedOperation" => {
            Class::NotImplemented
        }

        "RequestTimeout" | "OperationTimedOut" | "UploadTimeout" => Class::Timeout,

        "ServiceUnavailable" | "SlowDown" | "ServerBusy" | "ThrottlingException"
        | "RequestThrottled" | "NotEnoughSpace" | "ThrottledError" => Class::Unavailable,

        "InternalError" | "InternalServerError" => Class::Internal,

        _ => return None,
    };
    Some(class)
}

/// Map an HTTP status code.
fn by_status(status: StatusCode) -> Class {
    match status.as_u16() {
        400 | 411 | 416 => Class::InvalidArgument,
        401 | 403 => Class::AccessDenied,
        404 => Class::NotFound,
        409 | 412 => Class::AlreadyExists,
        405 | 501 => Class::NotImplemented,
        408 | 504 => Class::Timeout,
        429 | 502 | 503 | 507 => Class::Unavailable,
        _ => Class::Internal,
    }
}

/// Map a local I/O failure by its kind.
fn from_io(err: &io::Error) -> GatewayError {
    let message = format!("I/O error: {err}");
    match err.kind() {
        io::ErrorKind::NotFound => GatewayError::not_found(message),
        io::ErrorKind::AlreadyExists => GatewayError::already_exists(message),
        io::ErrorKind::PermissionDenied => GatewayError::access_denied(message),
        io::ErrorKind::TimedOut => GatewayError::timeout(message),
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
            GatewayError::invalid_argument(message)
        }
        io::ErrorKind::Unsupported => GatewayError::not_implemented(message),
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe => GatewayError::unavailable(message),
        _ => GatewayError::internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn kind_of(status: u16, body: &str) -> ErrorKind {
        from_http(StatusCode::from_u16(status).unwrap(), body).kind()
    }

    #[test]
    fn test_empty_body_is_internal() {
        let err = from_http(StatusCode::NOT_FOUND, "");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.message().contains("no error detail available"));

        assert_eq!(kind_of(503, "   \n"), ErrorKind::Internal);
    }

    #[test]
    fn test_unparsable_body_is_internal() {
        let err = from_http(StatusCode::BAD_REQUEST, "<html>oops</html>");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.message().contains("unparsable error body"));

        assert_eq!(kind_of(404, "not json at all"), ErrorKind::Internal);
        assert_eq!(kind_of(404, "{\"message\":\"no code\"}"), ErrorKind::Internal);
    }

    #[test]
    fn test_manta_json_codes() {
        let body = r#"{"code":"ResourceNotFound","message":"/alice/stor/b/k was not found"}"#;
        let err = from_http(StatusCode::NOT_FOUND, body);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.message().contains("was not found"));

        assert_eq!(
            kind_of(400, r#"{"code":"DirectoryNotEmpty","message":"x"}"#),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            kind_of(403, r#"{"code":"AuthorizationFailed","message":"x"}"#),
            ErrorKind::AccessDenied
        );
    }

    #[test]
    fn test_xml_codes() {
        let body = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
            <Error><Code>BlobNotFound</Code><Message>The specified blob does not exist.</Message></Error>";
        assert_eq!(kind_of(404, body), ErrorKind::NotFound);

        let body = "<Error><Code>BucketNotEmpty</Code><Message>not empty</Message></Error>";
        assert_eq!(kind_of(409, body), ErrorKind::InvalidArgument);

        let body = "<Error><Code>ContainerAlreadyExists</Code><Message>x</Message></Error>";
        assert_eq!(kind_of(409, body), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_code_wins_over_status() {
        // A 500 carrying a recognized not-found code is still NotFound.
        assert_eq!(
            kind_of(500, r#"{"code":"NoSuchKey","message":"gone"}"#),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_unknown_code_falls_back_to_status() {
        let cases = [
            (400, ErrorKind::InvalidArgument),
            (411, ErrorKind::InvalidArgument),
            (416, ErrorKind::InvalidArgument),
            (401, ErrorKind::AccessDenied),
            (403, ErrorKind::AccessDenied),
            (404, ErrorKind::NotFound),
            (409, ErrorKind::AlreadyExists),
            (412, ErrorKind::AlreadyExists),
            (405, ErrorKind::NotImplemented),
            (501, ErrorKind::NotImplemented),
            (408, ErrorKind::Timeout),
            (504, ErrorKind::Timeout),
            (429, ErrorKind::Unavailable),
            (502, ErrorKind::Unavailable),
            (503, ErrorKind::Unavailable),
            (507, ErrorKind::Unavailable),
            (500, ErrorKind::Internal),
            (418, ErrorKind::Internal),
        ];
        for (status, expected) in cases {
            let body = r#"{"code":"SomethingNew","message":"?"}"#;
            assert_eq!(kind_of(status, body), expected, "status {status}");
        }
    }

    #[test]
    fn test_non_http_variants() {
        assert_eq!(
            normalize(BackendError::NotFound("b/k".into())).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            normalize(BackendError::NotEmpty("b".into())).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(normalize(BackendError::Timeout).kind(), ErrorKind::Timeout);
        assert_eq!(
            normalize(BackendError::Transport("refused".into())).kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(
            normalize(BackendError::Unsupported("rename")).kind(),
            ErrorKind::NotImplemented
        );
        assert_eq!(
            normalize(BackendError::CapacityExceeded {
                requested: 10,
                limit: 5
            })
            .kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(
            normalize(BackendError::InvalidRange { start: 9, size: 3 }).kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_io_kinds() {
        let io_err = |kind| BackendError::Io(io::Error::new(kind, "x"));
        assert_eq!(
            normalize(io_err(io::ErrorKind::NotFound)).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            normalize(io_err(io::ErrorKind::PermissionDenied)).kind(),
            ErrorKind::AccessDenied
        );
        assert_eq!(
            normalize(io_err(io::ErrorKind::TimedOut)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            normalize(io_err(io::ErrorKind::Other)).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_from_impl_allows_question_mark() {
        fn fails() -> Result<(), GatewayError> {
            Err(BackendError::AlreadyExists("b".into()))?;
            Ok(())
        }
        assert_eq!(fails().unwrap_err().kind(), ErrorKind::AlreadyExists);
    }
}
