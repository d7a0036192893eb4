//! Scoped HMAC-SHA256 request signing
//!
//! ```text
//! CanonicalRequest = Method \n CanonicalURI \n CanonicalQuery \n
//!                    CanonicalHeaders \n\n SignedHeaders \n HashedPayload
//! StringToSign     = "AWS4-HMAC-SHA256" \n Timestamp \n Scope \n hex(SHA256(CanonicalRequest))
//! SigningKey       = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")
//! ```

use super::canonical::{canonical_headers, canonical_query, hmac_sha256};
use super::{host_header, SignableRequest, Signer, SignerKind, SigningContext};
use crate::body::sha256_hex;
use crate::credentials::Credentials;
use crate::error::{Result, StratusError};
use chrono::{DateTime, Utc};
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, HOST};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

#[derive(Debug, Clone, Copy, Default)]
pub struct V4Signer;

impl V4Signer {
    /// Signing key for one day, region and service
    pub fn derive_signing_key(
        secret_key: &str,
        date: &str,
        region: &str,
        service: &str,
    ) -> Result<Vec<u8>> {
        let date_key = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes())?;
        let date_region_key = hmac_sha256(&date_key, region.as_bytes())?;
        let date_region_service_key = hmac_sha256(&date_region_key, service.as_bytes())?;
        hmac_sha256(&date_region_service_key, b"aws4_request")
    }

    fn canonical_request(request: &SignableRequest<'_>) -> (String, String) {
        let path = request.url.path();
        let canonical_uri = if path.is_empty() { "/" } else { path };
        let (headers, signed_headers) = canonical_headers(&request.headers);
        let canonical = format!(
            "{}\n{}\n{}\n{}\n\n{}\n{}",
            request.method.as_str(),
            canonical_uri,
            canonical_query(request.query),
            headers,
            signed_headers,
            request.payload_hash.header_value()
        );
        (canonical, signed_headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| StratusError::Credentials(format!("Invalid header value: {}", e)))
}

impl Signer for V4Signer {
    fn kind(&self) -> SignerKind {
        SignerKind::V4
    }

    fn sign(
        &self,
        request: &mut SignableRequest<'_>,
        credentials: &Credentials,
        context: &SigningContext,
        time: DateTime<Utc>,
    ) -> Result<()> {
        let amz_date = time.format("%Y%m%dT%H%M%SZ").to_string();
        let date = time.format("%Y%m%d").to_string();

        request.headers.remove(AUTHORIZATION);
        request.headers.remove("date");
        request
            .headers
            .insert(HOST, header_value(&host_header(request.url))?);
        request.headers.insert(
            HeaderName::from_static("x-amz-date"),
            header_value(&amz_date)?,
        );
        request.headers.insert(
            HeaderName::from_static("x-amz-content-sha256"),
            header_value(request.payload_hash.header_value())?,
        );
        match credentials.token() {
            Some(token) => {
                request.headers.insert(
                    HeaderName::from_static("x-amz-security-token"),
                    header_value(token)?,
                );
            }
            None => {
                request.headers.remove("x-amz-security-token");
            }
        }

        let (canonical, signed_headers) = Self::canonical_request(request);
        let scope = format!(
            "{}/{}/{}/aws4_request",
            date, context.signing_region, context.service_name
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            scope,
            sha256_hex(canonical.as_bytes())
        );

        let signing_key = Self::derive_signing_key(
            credentials.secret(),
            &date,
            &context.signing_region,
            &context.service_name,
        )?;
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, credentials.access_key, scope, signed_headers, signature
        );
        request
            .headers
            .insert(AUTHORIZATION, header_value(&authorization)?);
        Ok(())
    }
}
