//! Legacy HMAC-SHA1 request signing
//!
//! ```text
//! StringToSign = Verb \n Content-MD5 \n Content-Type \n Date \n
//!                CanonicalizedAmzHeaders CanonicalizedResource
//! Authorization = "AWS " + AccessKey + ":" + Base64(HMAC-SHA1(secret, StringToSign))
//! ```

use super::canonical::hmac_sha1;
use super::{host_header, SignableRequest, Signer, SignerKind, SigningContext};
use crate::credentials::Credentials;
use crate::error::{Result, StratusError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, HOST};
use http::HeaderMap;
use std::collections::BTreeMap;

/// Query parameters that are part of the signed resource
const SUB_RESOURCES: &[&str] = &[
    "acl",
    "cors",
    "delete",
    "lifecycle",
    "location",
    "logging",
    "notification",
    "partNumber",
    "policy",
    "requestPayment",
    "response-cache-control",
    "response-content-disposition",
    "response-content-encoding",
    "response-content-language",
    "response-content-type",
    "response-expires",
    "restore",
    "tagging",
    "torrent",
    "uploadId",
    "uploads",
    "versionId",
    "versioning",
    "versions",
    "website",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct V2Signer;

impl V2Signer {
    fn string_to_sign(request: &SignableRequest<'_>) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}{}",
            request.method.as_str(),
            header(&request.headers, "content-md5"),
            header(&request.headers, "content-type"),
            header(&request.headers, "date"),
            canonical_amz_headers(&request.headers),
            canonical_resource(request.resource_path, request.query)
        )
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn canonical_amz_headers(headers: &HeaderMap) -> String {
    let mut amz: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if name.starts_with("x-amz-") {
            let value = String::from_utf8_lossy(value.as_bytes()).trim().to_string();
            amz.entry(name).or_default().push(value);
        }
    }
    amz.iter()
        .map(|(name, values)| format!("{}:{}\n", name, values.join(",")))
        .collect()
}

fn canonical_resource(resource_path: &str, query: &[(String, String)]) -> String {
    let mut sub: Vec<(&str, &str)> = query
        .iter()
        .filter(|(k, _)| SUB_RESOURCES.contains(&k.as_str()))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    if sub.is_empty() {
        return resource_path.to_string();
    }
    sub.sort_by(|a, b| a.0.cmp(b.0));
    let params = sub
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.to_string()
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", resource_path, params)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| StratusError::Credentials(format!("Invalid header value: {}", e)))
}

impl Signer for V2Signer {
    fn kind(&self) -> SignerKind {
        SignerKind::V2
    }

    fn sign(
        &self,
        request: &mut SignableRequest<'_>,
        credentials: &Credentials,
        _context: &SigningContext,
        time: DateTime<Utc>,
    ) -> Result<()> {
        request.headers.remove(AUTHORIZATION);
        request.headers.remove("x-amz-date");
        request.headers.remove("x-amz-content-sha256");
        request
            .headers
            .insert(HOST, header_value(&host_header(request.url))?);
        request.headers.insert(
            HeaderName::from_static("date"),
            header_value(&time.format("%a, %d %b %Y %H:%M:%S GMT").to_string())?,
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

        let string_to_sign = Self::string_to_sign(request);
        let signature = BASE64.encode(hmac_sha1(
            credentials.secret().as_bytes(),
            string_to_sign.as_bytes(),
        )?);
        request.headers.insert(
            AUTHORIZATION,
            header_value(&format!("AWS {}:{}", credentials.access_key, signature))?,
        );
        Ok(())
    }
}
