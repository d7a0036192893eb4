//! Transport boundary
//!
//! The executor never sees wire bytes beyond what [`classify`] extracts: it
//! builds an immutable [`Operation`], signs it into a [`SignedRequest`] for
//! one attempt, hands that to a [`Transport`] and classifies the
//! [`ResponseDescriptor`] it gets back.

pub mod mock;
pub mod xml;

use crate::body::{BodyError, ReplayableBody};
use crate::config::ClientConfig;
use crate::error::{is_retryable_code, Result, StratusError};
use crate::signer::canonical::{canonical_query, encode_path};
use crate::signer::{SignerKind, SigningContext};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, ETAG};
use http::{HeaderMap, Method, StatusCode};
use std::fmt;
use thiserror::Error;
use url::Url;

pub use xml::ErrorDocument;

/// Header carrying the authoritative region of a bucket
pub const BUCKET_REGION_HEADER: &str = "x-amz-bucket-region";

/// Immutable description of one logical request
#[derive(Debug, Clone)]
pub struct Operation {
    /// Operation name for logs, e.g. `UploadPart`
    pub name: &'static str,
    pub method: Method,
    pub bucket: String,
    pub key: Option<String>,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    /// Per-request region pin; bypasses the region cache
    pub region_override: Option<String>,
}

impl Operation {
    pub fn new(name: &'static str, method: Method, bucket: impl Into<String>) -> Self {
        Self {
            name,
            method,
            bucket: bucket.into(),
            key: None,
            query: Vec::new(),
            headers: HeaderMap::new(),
            region_override: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value).map_err(|e| {
            StratusError::Config(format!("Invalid value for header {}: {}", name, e))
        })?;
        self.headers.insert(HeaderName::from_static(name), value);
        Ok(self)
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region_override = Some(region.into());
        self
    }

    /// `/bucket/key` resource path
    pub fn resource_path(&self) -> String {
        match &self.key {
            Some(key) => format!("/{}/{}", self.bucket, encode_path(key)),
            None => format!("/{}/", self.bucket),
        }
    }

    /// Value of query parameter `name`
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// One signed attempt of an [`Operation`]
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub bucket: String,
    pub key: Option<String>,
    pub query: Vec<(String, String)>,
    pub context: SigningContext,
}

impl SignedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Response as seen by the core
#[derive(Debug, Clone)]
pub struct ResponseDescriptor {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseDescriptor {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(HeaderName::from_static(name), value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn etag(&self) -> Option<String> {
        self.headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn bucket_region(&self) -> Option<String> {
        self.header(BUCKET_REGION_HEADER)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
    }
}

/// Connection-level failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ConnectionReset,
    Connect,
    Io,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Timeout => write!(f, "timeout"),
            TransportErrorKind::ConnectionReset => write!(f, "connection reset"),
            TransportErrorKind::Connect => write!(f, "connect"),
            TransportErrorKind::Io => write!(f, "io"),
        }
    }
}

/// Failure reported by a [`Transport`]
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport I/O error: {0}")]
    Io(String),

    /// Reading the request body failed
    #[error(transparent)]
    Body(#[from] BodyError),
}

impl From<TransportError> for StratusError {
    fn from(err: TransportError) -> Self {
        let (kind, message) = match err {
            TransportError::Body(body) => return body.into(),
            TransportError::Timeout(m) => (TransportErrorKind::Timeout, m),
            TransportError::ConnectionReset(m) => (TransportErrorKind::ConnectionReset, m),
            TransportError::Connect(m) => (TransportErrorKind::Connect, m),
            TransportError::Io(m) => (TransportErrorKind::Io, m),
        };
        StratusError::Transport { kind, message }
    }
}

/// Opaque `send(request) -> response` capability
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(
        &self,
        request: &SignedRequest,
        body: Option<&mut ReplayableBody>,
    ) -> std::result::Result<ResponseDescriptor, TransportError>;
}

/// Outcome class of one response
#[derive(Debug, Clone)]
pub enum Classified {
    Success,
    /// Wrong regional endpoint; carries the authoritative region when the
    /// response named one
    Redirect { region: Option<String> },
    /// Signature scheme rejected
    Auth { code: String, message: String },
    /// Throttling or server-side failure; retry with backoff
    Throttled(StratusError),
    Fatal(StratusError),
}

/// Classify `response` to an attempt signed with `context`
pub fn classify(response: &ResponseDescriptor, context: &SigningContext) -> Classified {
    let status = response.status;
    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        return Classified::Success;
    }

    let doc = ErrorDocument::parse(&response.body).unwrap_or_default();
    let code = doc
        .code
        .clone()
        .unwrap_or_else(|| default_code(status).to_string());
    let message = doc
        .message
        .clone()
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
    let region_hint = response.bucket_region().or_else(|| doc.region.clone());
    let names_other_region = region_hint
        .as_deref()
        .is_some_and(|r| r != context.signing_region);

    match status.as_u16() {
        301 | 307 => return Classified::Redirect {
            region: region_hint,
        },
        400 | 403 if names_other_region => {
            return Classified::Redirect {
                region: region_hint,
            }
        }
        400 if region_hint.is_none()
            && matches!(
                code.as_str(),
                "AuthorizationHeaderMalformed" | "IllegalLocationConstraintException"
            ) =>
        {
            return Classified::Redirect { region: None }
        }
        _ => {}
    }

    if is_auth_failure(status, &code, &message, doc.code.is_none(), context.scheme) {
        return Classified::Auth { code, message };
    }

    let error = StratusError::Service {
        status: status.as_u16(),
        code,
        message,
    };
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || matches!(&error, StratusError::Service { code, .. } if is_retryable_code(code))
    {
        Classified::Throttled(error)
    } else {
        Classified::Fatal(error)
    }
}

fn is_auth_failure(
    status: StatusCode,
    code: &str,
    message: &str,
    bodyless: bool,
    scheme: SignerKind,
) -> bool {
    let message = message.to_ascii_lowercase();
    match status.as_u16() {
        403 => match code {
            "SignatureDoesNotMatch" | "InvalidAccessKeyId" => true,
            "AccessDenied" => scheme == SignerKind::V2,
            _ => bodyless && scheme == SignerKind::V2,
        },
        400 => match code {
            "InvalidRequest" => {
                message.contains("signature") || message.contains("aws4-hmac-sha256")
            }
            "InvalidArgument" => scheme == SignerKind::V2 && message.contains("encryption"),
            _ => false,
        },
        _ => false,
    }
}

fn default_code(status: StatusCode) -> &'static str {
    match status.as_u16() {
        301 => "PermanentRedirect",
        307 => "TemporaryRedirect",
        400 => "BadRequest",
        403 => "AccessDenied",
        404 => "NotFound",
        412 => "PreconditionFailed",
        500 => "InternalError",
        503 => "ServiceUnavailable",
        _ => "Unknown",
    }
}

/// Builds request URLs for a region
#[derive(Debug, Clone)]
pub struct EndpointResolver {
    custom: Option<Url>,
    force_path_style: bool,
}

impl EndpointResolver {
    pub fn new(custom: Option<Url>, force_path_style: bool) -> Self {
        Self {
            custom,
            force_path_style,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Ok(Self::new(config.endpoint_url()?, config.force_path_style))
    }

    /// URL for `operation` sent to `region` (`None` = global endpoint)
    pub fn url_for(&self, operation: &Operation, region: Option<&str>) -> Result<Url> {
        let (scheme, host, port) = match &self.custom {
            Some(url) => (
                url.scheme().to_string(),
                url.host_str()
                    .ok_or_else(|| {
                        StratusError::Config(format!("Endpoint {} has no host", url))
                    })?
                    .to_string(),
                url.port(),
            ),
            None => ("https".to_string(), regional_host(region), None),
        };

        let virtual_hosted = !self.force_path_style && is_dns_compatible(&operation.bucket);
        let authority = if virtual_hosted {
            format!("{}.{}", operation.bucket, host)
        } else {
            host
        };

        let mut url = Url::parse(&format!("{}://{}", scheme, authority))
            .map_err(|e| StratusError::Config(format!("Invalid request URL: {}", e)))?;
        url.set_port(port)
            .map_err(|_| StratusError::Config("Endpoint cannot carry a port".to_string()))?;

        let path = if virtual_hosted {
            format!(
                "/{}",
                operation.key.as_deref().map(encode_path).unwrap_or_default()
            )
        } else {
            operation.resource_path()
        };
        url.set_path(&path);
        // Dot segments (even percent-encoded) are collapsed by URL parsing,
        // which would address a different object
        if url.path() != path {
            return Err(StratusError::InvalidKey(format!(
                "{:?} contains '.' or '..' segments and cannot be addressed",
                operation.key.as_deref().unwrap_or_default()
            )));
        }

        if !operation.query.is_empty() {
            url.set_query(Some(&canonical_query(&operation.query)));
        }
        Ok(url)
    }
}

fn regional_host(region: Option<&str>) -> String {
    match region {
        Some(region) => format!("s3.{}.amazonaws.com", region),
        None => "s3.amazonaws.com".to_string(),
    }
}

/// Whether `bucket` can be used as a DNS label for virtual-hosted requests
pub fn is_dns_compatible(bucket: &str) -> bool {
    let bytes = bucket.as_bytes();
    (3..=63).contains(&bytes.len())
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(scheme: SignerKind, region: &str) -> SigningContext {
        SigningContext {
            scheme,
            region: Some(region.to_string()),
            signing_region: region.to_string(),
            service_name: "s3".to_string(),
        }
    }

    fn error(status: u16, code: &str, message: &str, region: Option<&str>) -> ResponseDescriptor {
        ResponseDescriptor::new(StatusCode::from_u16(status).unwrap())
            .with_body(ErrorDocument::render(code, message, region))
    }

    #[test]
    fn test_success() {
        let response = ResponseDescriptor::new(StatusCode::OK);
        assert!(matches!(
            classify(&response, &ctx(SignerKind::V4, "us-east-1")),
            Classified::Success
        ));
    }

    #[test]
    fn test_redirect_from_header() {
        let response = ResponseDescriptor::new(StatusCode::MOVED_PERMANENTLY)
            .with_header(BUCKET_REGION_HEADER, "eu-west-1");
        match classify(&response, &ctx(SignerKind::V4, "us-east-1")) {
            Classified::Redirect { region } => assert_eq!(region.as_deref(), Some("eu-west-1")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_authorization_is_redirect() {
        let response = error(
            400,
            "AuthorizationHeaderMalformed",
            "wrong region",
            Some("ap-south-1"),
        );
        match classify(&response, &ctx(SignerKind::V4, "us-east-1")) {
            Classified::Redirect { region } => assert_eq!(region.as_deref(), Some("ap-south-1")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_region_correction_precedes_auth() {
        // an auth-class failure that names another region is an addressing problem
        let response = error(403, "SignatureDoesNotMatch", "bad", None)
            .with_header(BUCKET_REGION_HEADER, "us-west-2");
        assert!(matches!(
            classify(&response, &ctx(SignerKind::V2, "us-east-1")),
            Classified::Redirect { .. }
        ));
    }

    #[test]
    fn test_auth_failures() {
        let v2 = ctx(SignerKind::V2, "us-east-1");
        let v4 = ctx(SignerKind::V4, "us-east-1");

        let mismatch = error(403, "SignatureDoesNotMatch", "bad signature", None);
        assert!(matches!(classify(&mismatch, &v4), Classified::Auth { .. }));

        let unsupported = error(
            400,
            "InvalidRequest",
            "The authorization mechanism you have provided is not supported. Please use AWS4-HMAC-SHA256.",
            None,
        );
        assert!(matches!(classify(&unsupported, &v2), Classified::Auth { .. }));

        let denied = error(403, "AccessDenied", "denied", None);
        assert!(matches!(classify(&denied, &v2), Classified::Auth { .. }));
        assert!(matches!(classify(&denied, &v4), Classified::Fatal(_)));

        let kms = error(400, "InvalidArgument", "Server Side Encryption with KMS requires v4", None);
        assert!(matches!(classify(&kms, &v2), Classified::Auth { .. }));
    }

    #[test]
    fn test_throttling_and_fatal() {
        let c = ctx(SignerKind::V4, "us-east-1");
        assert!(matches!(
            classify(&error(503, "SlowDown", "slow", None), &c),
            Classified::Throttled(_)
        ));
        assert!(matches!(
            classify(&error(400, "RequestTimeout", "idle", None), &c),
            Classified::Throttled(_)
        ));
        match classify(&error(404, "NoSuchKey", "missing", None), &c) {
            Classified::Fatal(StratusError::Service { status, code, .. }) => {
                assert_eq!(status, 404);
                assert_eq!(code, "NoSuchKey");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_virtual_hosted_url() {
        let resolver = EndpointResolver::new(None, false);
        let op = Operation::new("UploadPart", Method::PUT, "photos")
            .with_key("2024/cat 1.jpg")
            .with_query("uploadId", "abc")
            .with_query("partNumber", "3");

        let url = resolver.url_for(&op, Some("eu-west-1")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://photos.s3.eu-west-1.amazonaws.com/2024/cat%201.jpg?partNumber=3&uploadId=abc"
        );

        let global = resolver.url_for(&op, None).unwrap();
        assert_eq!(global.host_str(), Some("photos.s3.amazonaws.com"));
    }

    #[test]
    fn test_dot_segment_keys_are_rejected() {
        let resolver = EndpointResolver::new(None, false);
        for key in ["a/../b", "./b", "a/.", "a/%2E%2E/b/.."] {
            let op = Operation::new("GetObject", Method::GET, "photos").with_key(key);
            assert!(
                matches!(
                    resolver.url_for(&op, Some("us-east-1")),
                    Err(StratusError::InvalidKey(_))
                ),
                "key {:?}",
                key
            );
        }

        // dots inside a segment are ordinary characters
        let op = Operation::new("GetObject", Method::GET, "photos").with_key("a/..b/.c");
        let url = resolver.url_for(&op, Some("us-east-1")).unwrap();
        assert_eq!(url.path(), "/a/..b/.c");

        let path_style = EndpointResolver::new(None, true);
        let op = Operation::new("GetObject", Method::GET, "photos").with_key("a/../b");
        assert!(matches!(
            path_style.url_for(&op, Some("us-east-1")),
            Err(StratusError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_path_style_url() {
        let endpoint = Url::parse("http://localhost:9000").unwrap();
        let resolver = EndpointResolver::new(Some(endpoint), true);
        let op = Operation::new("GetObject", Method::GET, "photos").with_key("a.txt");
        let url = resolver.url_for(&op, Some("us-east-1")).unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/photos/a.txt");

        // non-DNS-compatible names fall back to path style
        let resolver = EndpointResolver::new(None, false);
        let op = Operation::new("GetObject", Method::GET, "My_Bucket").with_key("a.txt");
        let url = resolver.url_for(&op, Some("us-east-1")).unwrap();
        assert_eq!(url.as_str(), "https://s3.us-east-1.amazonaws.com/My_Bucket/a.txt");
    }

    #[test]
    fn test_transport_error_conversion() {
        let err: StratusError = TransportError::ConnectionReset("peer".to_string()).into();
        assert!(matches!(
            err,
            StratusError::Transport {
                kind: TransportErrorKind::ConnectionReset,
                ..
            }
        ));

        let err: StratusError =
            TransportError::Body(BodyError::UnrecoverableStreamState("x".to_string())).into();
        assert!(matches!(err, StratusError::UnrecoverableStreamState(_)));
    }
}
