//! Request signing and signature-scheme negotiation
//!
//! Two schemes are supported: the legacy HMAC-SHA1 scheme ([`v2`]) and the
//! scoped HMAC-SHA256 scheme ([`v4`]). [`SignerNegotiator`] picks the scheme
//! for the first attempt and decides whether an authentication failure can
//! be corrected by switching schemes.

pub mod canonical;
pub mod v2;
pub mod v4;

use crate::body::PayloadHash;
use crate::config::ClientConfig;
use crate::credentials::Credentials;
use crate::error::{Result, StratusError};
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;
use url::Url;

pub use v2::V2Signer;
pub use v4::V4Signer;

/// Signature scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerKind {
    V2,
    V4,
}

impl fmt::Display for SignerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignerKind::V2 => write!(f, "v2"),
            SignerKind::V4 => write!(f, "v4"),
        }
    }
}

impl FromStr for SignerKind {
    type Err = StratusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "v2" | "sigv2" | "s3" => Ok(SignerKind::V2),
            "v4" | "sigv4" | "aws4" | "s3v4" => Ok(SignerKind::V4),
            other => Err(StratusError::Config(format!(
                "Unknown signer '{}': expected v2 or v4",
                other
            ))),
        }
    }
}

/// Signing parameters of a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningContext {
    pub scheme: SignerKind,
    /// Region believed to hold the bucket; `None` when unknown
    pub region: Option<String>,
    /// Region placed in the signature scope (falls back to the default)
    pub signing_region: String,
    pub service_name: String,
}

impl SigningContext {
    /// Same scheme, new region
    pub fn with_region(&self, region: &str) -> Self {
        Self {
            region: Some(region.to_string()),
            signing_region: region.to_string(),
            ..self.clone()
        }
    }

    /// Same region, new scheme
    pub fn with_scheme(&self, scheme: SignerKind) -> Self {
        Self {
            scheme,
            ..self.clone()
        }
    }
}

/// Request being signed; signers add headers in place
#[derive(Debug)]
pub struct SignableRequest<'a> {
    pub method: &'a Method,
    pub url: &'a Url,
    /// `/bucket/key` resource used by the legacy scheme
    pub resource_path: &'a str,
    pub query: &'a [(String, String)],
    pub headers: HeaderMap,
    pub payload_hash: &'a PayloadHash,
}

/// A signature scheme implementation
pub trait Signer: Send + Sync + fmt::Debug {
    fn kind(&self) -> SignerKind;

    fn sign(
        &self,
        request: &mut SignableRequest<'_>,
        credentials: &Credentials,
        context: &SigningContext,
        time: DateTime<Utc>,
    ) -> Result<()>;
}

/// Headers that only the newer scheme can carry
const V4_ONLY_HEADERS: &[&str] = &[
    "x-amz-server-side-encryption-customer-algorithm",
    "x-amz-server-side-encryption-customer-key",
    "x-amz-server-side-encryption-customer-key-md5",
    "x-amz-server-side-encryption-aws-kms-key-id",
    "x-amz-copy-source-server-side-encryption-customer-algorithm",
    "x-amz-copy-source-server-side-encryption-customer-key",
];

/// Whether the request's encryption parameters require the newer scheme
pub fn requires_v4(headers: &HeaderMap) -> bool {
    let kms = headers
        .get("x-amz-server-side-encryption")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("aws:kms"));
    kms || V4_ONLY_HEADERS.iter().any(|name| headers.contains_key(*name))
}

/// Chooses signing schemes and rebuilds contexts after corrective failures
#[derive(Debug, Clone)]
pub struct SignerNegotiator {
    override_kind: Option<SignerKind>,
    service_name: String,
    default_region: String,
    v2: V2Signer,
    v4: V4Signer,
}

impl SignerNegotiator {
    pub fn new(
        override_kind: Option<SignerKind>,
        service_name: impl Into<String>,
        default_region: impl Into<String>,
    ) -> Self {
        Self {
            override_kind,
            service_name: service_name.into(),
            default_region: default_region.into(),
            v2: V2Signer,
            v4: V4Signer,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.signer_override,
            config.service_name.clone(),
            config.default_region.clone(),
        )
    }

    /// Scheme for the first attempt: the override, else the newer scheme
    ///
    /// Requests carrying KMS or customer-key encryption headers always use the
    /// newer scheme.
    pub fn initial_scheme(&self, headers: &HeaderMap) -> SignerKind {
        match self.override_kind {
            Some(SignerKind::V2) if requires_v4(headers) => {
                warn!("Encryption parameters require v4 signing; ignoring the v2 override");
                SignerKind::V4
            }
            Some(kind) => kind,
            None => SignerKind::V4,
        }
    }

    /// Context for the first attempt against `region` (`None` = unknown)
    pub fn initial_context(&self, headers: &HeaderMap, region: Option<String>) -> SigningContext {
        let signing_region = region
            .clone()
            .unwrap_or_else(|| self.default_region.clone());
        SigningContext {
            scheme: self.initial_scheme(headers),
            region,
            signing_region,
            service_name: self.service_name.clone(),
        }
    }

    /// Context to retry with after an authentication failure, or `None` when
    /// the failed attempt already used the newest scheme
    pub fn after_auth_failure(&self, context: &SigningContext) -> Option<SigningContext> {
        match context.scheme {
            SignerKind::V2 => Some(context.with_scheme(SignerKind::V4)),
            SignerKind::V4 => None,
        }
    }

    pub fn signer(&self, kind: SignerKind) -> &dyn Signer {
        match kind {
            SignerKind::V2 => &self.v2,
            SignerKind::V4 => &self.v4,
        }
    }

    /// Sign `request` with the scheme named by `context`
    pub fn sign(
        &self,
        request: &mut SignableRequest<'_>,
        credentials: &Credentials,
        context: &SigningContext,
        time: DateTime<Utc>,
    ) -> Result<()> {
        self.signer(context.scheme)
            .sign(request, credentials, context, time)
    }
}

pub(crate) fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn negotiator(override_kind: Option<SignerKind>) -> SignerNegotiator {
        SignerNegotiator::new(override_kind, "s3", "us-east-1")
    }

    #[test]
    fn test_default_prefers_v4() {
        let ctx = negotiator(None).initial_context(&HeaderMap::new(), None);
        assert_eq!(ctx.scheme, SignerKind::V4);
        assert_eq!(ctx.region, None);
        assert_eq!(ctx.signing_region, "us-east-1");
    }

    #[test]
    fn test_override_is_honored() {
        let ctx = negotiator(Some(SignerKind::V2))
            .initial_context(&HeaderMap::new(), Some("eu-west-1".to_string()));
        assert_eq!(ctx.scheme, SignerKind::V2);
        assert_eq!(ctx.signing_region, "eu-west-1");
    }

    #[test]
    fn test_kms_upgrades_to_v4() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-amz-server-side-encryption",
            HeaderValue::from_static("aws:kms"),
        );
        assert!(requires_v4(&headers));
        assert_eq!(
            negotiator(Some(SignerKind::V2)).initial_scheme(&headers),
            SignerKind::V4
        );

        let mut sse_s3 = HeaderMap::new();
        sse_s3.insert(
            "x-amz-server-side-encryption",
            HeaderValue::from_static("AES256"),
        );
        assert!(!requires_v4(&sse_s3));
    }

    #[test]
    fn test_after_auth_failure() {
        let negotiator = negotiator(Some(SignerKind::V2));
        let ctx = negotiator.initial_context(&HeaderMap::new(), Some("us-west-2".to_string()));
        let upgraded = negotiator.after_auth_failure(&ctx).unwrap();
        assert_eq!(upgraded.scheme, SignerKind::V4);
        assert_eq!(upgraded.region.as_deref(), Some("us-west-2"));
        assert!(negotiator.after_auth_failure(&upgraded).is_none());
    }

    #[test]
    fn test_signer_kind_parsing() {
        assert_eq!("V4".parse::<SignerKind>().unwrap(), SignerKind::V4);
        assert_eq!("sigv2".parse::<SignerKind>().unwrap(), SignerKind::V2);
        assert!("v3".parse::<SignerKind>().is_err());
        assert_eq!(SignerKind::V2.to_string(), "v2");
    }

    #[test]
    fn test_context_with_region() {
        let ctx = negotiator(None).initial_context(&HeaderMap::new(), None);
        let moved = ctx.with_region("ap-southeast-2");
        assert_eq!(moved.region.as_deref(), Some("ap-southeast-2"));
        assert_eq!(moved.signing_region, "ap-southeast-2");
        assert_eq!(moved.scheme, ctx.scheme);
    }
}
