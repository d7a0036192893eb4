//! In-memory storage provider for testing
//!
//! [`MockStore`] implements [`Transport`] against a simulated multi-region
//! provider so the executor and the transfer coordinator can be exercised
//! without a network. Buckets live in a region; a request signed for any
//! other region is answered the way a real provider answers it (a redirect
//! naming the right region). Schemes can be rejected, failures injected per
//! request, and every request is logged for assertions.
//!
//! # Example
//!
//! ```rust
//! use stratus::transport::mock::MockStore;
//!
//! let store = MockStore::new().with_bucket("photos", "eu-west-1");
//! store.put_object("photos", "cat.jpg", b"meow".to_vec());
//! assert_eq!(store.object("photos", "cat.jpg").unwrap().as_ref(), b"meow");
//! ```

use super::xml::{self, ErrorDocument};
use super::{ResponseDescriptor, SignedRequest, Transport, TransportError, BUCKET_REGION_HEADER};
use crate::body::{md5_base64, md5_hex, ReplayableBody};
use crate::signer::SignerKind;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Which requests an injected failure applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureTarget {
    Any,
    Method(Method),
    /// Upload of this part number
    Part(u32),
    /// Ranged GET starting at this offset
    RangeStart(u64),
    Key(String),
}

/// Failure injected in place of normal handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Connection drops after part of the body was sent
    ConnectionReset,
    Timeout,
    /// Provider answers with this status and error code
    Status { status: u16, code: String },
    /// Never answers
    Hang,
}

#[derive(Debug, Clone)]
struct FailureRule {
    target: FailureTarget,
    failure: InjectedFailure,
    remaining: u32,
}

/// One request as seen by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub method: Method,
    pub bucket: String,
    pub key: Option<String>,
    pub part_number: Option<u32>,
    pub upload_id: Option<String>,
    pub range_start: Option<u64>,
    pub scheme: SignerKind,
    pub signing_region: String,
    /// `None` when the request failed below HTTP
    pub status: Option<u16>,
}

#[derive(Debug, Clone)]
struct MockObject {
    data: Bytes,
    etag: String,
}

impl MockObject {
    fn new(data: Bytes) -> Self {
        let etag = format!("\"{}\"", md5_hex(&data));
        Self { data, etag }
    }
}

#[derive(Debug, Default)]
struct MockUpload {
    key: String,
    parts: BTreeMap<u32, MockObject>,
}

#[derive(Debug)]
struct MockBucket {
    region: String,
    objects: HashMap<String, MockObject>,
    uploads: HashMap<String, MockUpload>,
}

impl MockBucket {
    fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            objects: HashMap::new(),
            uploads: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct MockState {
    buckets: HashMap<String, MockBucket>,
    rejected_schemes: HashSet<SignerKind>,
    redirect_hints: bool,
    min_part_size: u64,
    failure_rules: Vec<FailureRule>,
    part_delays: HashMap<u32, Duration>,
    corrupt_ranges: HashMap<u64, u32>,
    completion_failures: VecDeque<(u16, String)>,
    completed_part_lists: Vec<Vec<(u32, String)>>,
    log: Vec<RequestRecord>,
    next_upload: u64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
            rejected_schemes: HashSet::new(),
            redirect_hints: true,
            min_part_size: 0,
            failure_rules: Vec::new(),
            part_delays: HashMap::new(),
            corrupt_ranges: HashMap::new(),
            completion_failures: VecDeque::new(),
            completed_part_lists: Vec::new(),
            log: Vec::new(),
            next_upload: 1,
        }
    }
}

/// In-memory multi-region provider
#[derive(Debug, Clone, Default)]
pub struct MockStore {
    state: Arc<Mutex<MockState>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MockStore::create_bucket`]
    pub fn with_bucket(self, bucket: &str, region: &str) -> Self {
        self.create_bucket(bucket, region);
        self
    }

    pub fn create_bucket(&self, bucket: &str, region: &str) {
        self.state
            .lock()
            .buckets
            .insert(bucket.to_string(), MockBucket::new(region));
    }

    /// Re-create `bucket` in another region, keeping its contents
    pub fn move_bucket(&self, bucket: &str, region: &str) {
        if let Some(b) = self.state.lock().buckets.get_mut(bucket) {
            b.region = region.to_string();
        }
    }

    pub fn put_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        if let Some(b) = self.state.lock().buckets.get_mut(bucket) {
            b.objects
                .insert(key.to_string(), MockObject::new(data.into()));
        }
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.data.clone())
    }

    pub fn object_etag(&self, bucket: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map(|o| o.etag.clone())
    }

    /// Reject every request signed with `kind`
    pub fn reject_scheme(&self, kind: SignerKind) {
        self.state.lock().rejected_schemes.insert(kind);
    }

    /// When disabled, wrong-region answers carry no region (except HEAD
    /// bucket, which always reports it)
    pub fn set_redirect_hints(&self, enabled: bool) {
        self.state.lock().redirect_hints = enabled;
    }

    /// Enforce a minimum size on every part except the last at completion
    pub fn set_min_part_size(&self, size: u64) {
        self.state.lock().min_part_size = size;
    }

    /// Fail the next `times` requests matching `target`
    pub fn fail_requests(&self, target: FailureTarget, failure: InjectedFailure, times: u32) {
        self.state.lock().failure_rules.push(FailureRule {
            target,
            failure,
            remaining: times,
        });
    }

    /// Delay every upload of `part_number`
    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.state.lock().part_delays.insert(part_number, delay);
    }

    /// Serve corrupted bytes for the next `times` ranged GETs at `offset`
    pub fn corrupt_range(&self, offset: u64, times: u32) {
        self.state.lock().corrupt_ranges.insert(offset, times);
    }

    /// Fail the next completion call; status 200 embeds the error document
    /// in a success response
    pub fn fail_next_completion(&self, status: u16, code: &str) {
        self.state
            .lock()
            .completion_failures
            .push_back((status, code.to_string()));
    }

    /// Forget an in-progress upload as if the provider expired it
    pub fn expire_upload(&self, bucket: &str, upload_id: &str) {
        if let Some(b) = self.state.lock().buckets.get_mut(bucket) {
            b.uploads.remove(upload_id);
        }
    }

    pub fn upload_ids(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .map(|b| b.uploads.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Part numbers stored for an in-progress upload
    pub fn uploaded_parts(&self, bucket: &str, upload_id: &str) -> Vec<u32> {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .and_then(|b| b.uploads.get(upload_id))
            .map(|u| u.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state.lock().log.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().log.clear();
    }

    /// Part lists submitted to completion calls, in submission order
    pub fn completed_part_lists(&self) -> Vec<Vec<(u32, String)>> {
        self.state.lock().completed_part_lists.clone()
    }
}

fn part_number(request: &SignedRequest) -> Option<u32> {
    request.query_value("partNumber").and_then(|v| v.parse().ok())
}

fn parse_range(header: &str) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn record(request: &SignedRequest, status: Option<u16>) -> RequestRecord {
    RequestRecord {
        method: request.method.clone(),
        bucket: request.bucket.clone(),
        key: request.key.clone(),
        part_number: part_number(request),
        upload_id: request.query_value("uploadId").map(str::to_string),
        range_start: request
            .header("range")
            .and_then(parse_range)
            .map(|(start, _)| start),
        scheme: request.context.scheme,
        signing_region: request.context.signing_region.clone(),
        status,
    }
}

fn error_response(status: u16, code: &str, message: &str) -> ResponseDescriptor {
    ResponseDescriptor::new(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST))
        .with_header("content-type", "application/xml")
        .with_body(ErrorDocument::render(code, message, None))
}

impl FailureTarget {
    fn matches(&self, request: &SignedRequest) -> bool {
        match self {
            FailureTarget::Any => true,
            FailureTarget::Method(method) => request.method == *method,
            FailureTarget::Part(n) => {
                request.method == Method::PUT && part_number(request) == Some(*n)
            }
            FailureTarget::RangeStart(offset) => request
                .header("range")
                .and_then(parse_range)
                .is_some_and(|(start, _)| start == *offset),
            FailureTarget::Key(key) => request.key.as_deref() == Some(key.as_str()),
        }
    }
}

impl MockState {
    fn take_failure(&mut self, request: &SignedRequest) -> Option<InjectedFailure> {
        let rule = self
            .failure_rules
            .iter_mut()
            .find(|rule| rule.remaining > 0 && rule.target.matches(request))?;
        rule.remaining -= 1;
        Some(rule.failure.clone())
    }

    fn delay_for(&self, request: &SignedRequest) -> Option<Duration> {
        if request.method != Method::PUT {
            return None;
        }
        part_number(request).and_then(|n| self.part_delays.get(&n).copied())
    }

    fn handle(&mut self, request: &SignedRequest, payload: Bytes) -> ResponseDescriptor {
        let response = self.dispatch(request, payload);
        self.log.push(record(request, Some(response.status.as_u16())));
        response
    }

    fn dispatch(&mut self, request: &SignedRequest, payload: Bytes) -> ResponseDescriptor {
        let scheme = request.context.scheme;
        let signing_region = request.context.signing_region.as_str();

        let Some(region) = self.buckets.get(&request.bucket).map(|b| b.region.clone()) else {
            return error_response(404, "NoSuchBucket", "The specified bucket does not exist");
        };

        if signing_region != region {
            return self.wrong_region(request, &region);
        }

        if self.rejected_schemes.contains(&scheme) {
            return match scheme {
                SignerKind::V2 => error_response(
                    400,
                    "InvalidRequest",
                    "The authorization mechanism you have provided is not supported. \
                     Please use AWS4-HMAC-SHA256.",
                ),
                SignerKind::V4 => error_response(
                    403,
                    "SignatureDoesNotMatch",
                    "The request signature we calculated does not match the signature you provided.",
                ),
            };
        }

        let response = match (&request.method, request.key.as_deref()) {
            (&Method::HEAD, None) => ResponseDescriptor::new(StatusCode::OK),
            (&Method::PUT, Some(key)) => match part_number(request) {
                Some(n) => self.upload_part(request, n, payload),
                None => self.put(request, key, payload),
            },
            (&Method::POST, Some(key)) if request.query_value("uploads").is_some() => {
                self.initiate(request, key)
            }
            (&Method::POST, Some(_)) => self.complete(request, &payload),
            (&Method::DELETE, Some(key)) => match request.query_value("uploadId") {
                Some(upload_id) => self.abort(request, upload_id),
                None => self.delete(request, key),
            },
            (&Method::GET, Some(key)) => match request.query_value("uploadId") {
                Some(upload_id) => self.list_parts(request, upload_id),
                None => self.get(request, key, false),
            },
            (&Method::HEAD, Some(key)) => self.get(request, key, true),
            _ => error_response(501, "NotImplemented", "Operation not supported by the mock"),
        };

        if response.status.is_success() {
            response.with_header(BUCKET_REGION_HEADER, &region)
        } else {
            response
        }
    }

    fn wrong_region(&self, request: &SignedRequest, region: &str) -> ResponseDescriptor {
        let head_bucket = request.method == Method::HEAD && request.key.is_none();
        if head_bucket {
            return ResponseDescriptor::new(StatusCode::MOVED_PERMANENTLY)
                .with_header(BUCKET_REGION_HEADER, region);
        }
        if !self.redirect_hints {
            return ResponseDescriptor::new(StatusCode::MOVED_PERMANENTLY);
        }
        match request.context.scheme {
            SignerKind::V4 => ResponseDescriptor::new(StatusCode::BAD_REQUEST)
                .with_header(BUCKET_REGION_HEADER, region)
                .with_body(ErrorDocument::render(
                    "AuthorizationHeaderMalformed",
                    &format!(
                        "The authorization header is malformed; the region '{}' is wrong; expecting '{}'",
                        request.context.signing_region, region
                    ),
                    Some(region),
                )),
            SignerKind::V2 => ResponseDescriptor::new(StatusCode::MOVED_PERMANENTLY)
                .with_header(BUCKET_REGION_HEADER, region)
                .with_body(ErrorDocument::render(
                    "PermanentRedirect",
                    "The bucket you are attempting to access must be addressed using the specified endpoint.",
                    None,
                )),
        }
    }

    fn bucket_mut(&mut self, request: &SignedRequest) -> Option<&mut MockBucket> {
        self.buckets.get_mut(&request.bucket)
    }

    fn put(&mut self, request: &SignedRequest, key: &str, payload: Bytes) -> ResponseDescriptor {
        let object = MockObject::new(payload);
        let etag = object.etag.clone();
        if let Some(bucket) = self.bucket_mut(request) {
            bucket.objects.insert(key.to_string(), object);
        }
        ResponseDescriptor::new(StatusCode::OK).with_header("etag", &etag)
    }

    fn delete(&mut self, request: &SignedRequest, key: &str) -> ResponseDescriptor {
        if let Some(bucket) = self.bucket_mut(request) {
            bucket.objects.remove(key);
        }
        ResponseDescriptor::new(StatusCode::NO_CONTENT)
    }

    fn initiate(&mut self, request: &SignedRequest, key: &str) -> ResponseDescriptor {
        let upload_id = format!("upload-{:06}", self.next_upload);
        self.next_upload += 1;
        let Some(bucket) = self.bucket_mut(request) else {
            return error_response(404, "NoSuchBucket", "The specified bucket does not exist");
        };
        bucket.uploads.insert(
            upload_id.clone(),
            MockUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        ResponseDescriptor::new(StatusCode::OK).with_body(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<InitiateMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
            xml::escape(&request.bucket),
            xml::escape(key),
            upload_id
        ))
    }

    fn upload_part(
        &mut self,
        request: &SignedRequest,
        part_number: u32,
        payload: Bytes,
    ) -> ResponseDescriptor {
        let upload_id = request.query_value("uploadId").unwrap_or_default().to_string();
        let Some(upload) = self
            .bucket_mut(request)
            .and_then(|b| b.uploads.get_mut(&upload_id))
        else {
            return error_response(404, "NoSuchUpload", "The specified upload does not exist");
        };
        let part = MockObject::new(payload);
        let etag = part.etag.clone();
        upload.parts.insert(part_number, part);
        ResponseDescriptor::new(StatusCode::OK).with_header("etag", &etag)
    }

    fn complete(&mut self, request: &SignedRequest, payload: &[u8]) -> ResponseDescriptor {
        let upload_id = request.query_value("uploadId").unwrap_or_default().to_string();

        if let Some((status, code)) = self.completion_failures.pop_front() {
            let body = ErrorDocument::render(&code, "Injected completion failure", None);
            return ResponseDescriptor::new(
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            )
            .with_body(body);
        }

        let submitted: Vec<(u32, String)> = match xml::parse(payload, Some("Part")) {
            Ok(doc) => doc
                .records
                .iter()
                .filter_map(|part| {
                    let number = part.get("PartNumber")?.parse().ok()?;
                    Some((number, part.get("ETag")?.clone()))
                })
                .collect(),
            Err(_) => return error_response(400, "MalformedXML", "Could not parse part list"),
        };
        self.completed_part_lists.push(submitted.clone());

        let min_part_size = self.min_part_size;
        let Some(bucket) = self.bucket_mut(request) else {
            return error_response(404, "NoSuchBucket", "The specified bucket does not exist");
        };
        let Some(upload) = bucket.uploads.get(&upload_id) else {
            return error_response(404, "NoSuchUpload", "The specified upload does not exist");
        };

        if submitted.is_empty() {
            return error_response(400, "MalformedXML", "No parts submitted");
        }
        if submitted.windows(2).any(|w| w[0].0 >= w[1].0) {
            return error_response(
                400,
                "InvalidPartOrder",
                "The list of parts was not in ascending order",
            );
        }

        let mut data = Vec::new();
        let mut digests = Vec::new();
        for (index, (number, etag)) in submitted.iter().enumerate() {
            let Some(part) = upload.parts.get(number).filter(|p| &p.etag == etag) else {
                return error_response(
                    400,
                    "InvalidPart",
                    &format!("Part {} could not be found or its ETag does not match", number),
                );
            };
            if index + 1 < submitted.len() && (part.data.len() as u64) < min_part_size {
                return error_response(
                    400,
                    "EntityTooSmall",
                    "Your proposed upload is smaller than the minimum allowed object size",
                );
            }
            data.extend_from_slice(&part.data);
            digests.extend_from_slice(part.etag.trim_matches('"').as_bytes());
        }

        let key = upload.key.clone();
        let etag = format!("\"{}-{}\"", md5_hex(&digests), submitted.len());
        bucket.uploads.remove(&upload_id);
        bucket.objects.insert(
            key.clone(),
            MockObject {
                data: Bytes::from(data),
                etag: etag.clone(),
            },
        );

        ResponseDescriptor::new(StatusCode::OK).with_body(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<CompleteMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><ETag>{}</ETag></CompleteMultipartUploadResult>",
            xml::escape(&request.bucket),
            xml::escape(&key),
            xml::escape(&etag)
        ))
    }

    fn abort(&mut self, request: &SignedRequest, upload_id: &str) -> ResponseDescriptor {
        match self
            .bucket_mut(request)
            .and_then(|b| b.uploads.remove(upload_id))
        {
            Some(_) => ResponseDescriptor::new(StatusCode::NO_CONTENT),
            None => error_response(404, "NoSuchUpload", "The specified upload does not exist"),
        }
    }

    fn list_parts(&mut self, request: &SignedRequest, upload_id: &str) -> ResponseDescriptor {
        let Some(upload) = self
            .bucket_mut(request)
            .and_then(|b| b.uploads.get(upload_id))
        else {
            return error_response(404, "NoSuchUpload", "The specified upload does not exist");
        };
        let parts: String = upload
            .parts
            .iter()
            .map(|(number, part)| {
                format!(
                    "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag><Size>{}</Size></Part>",
                    number,
                    xml::escape(&part.etag),
                    part.data.len()
                )
            })
            .collect();
        ResponseDescriptor::new(StatusCode::OK).with_body(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<ListPartsResult><UploadId>{}</UploadId><IsTruncated>false</IsTruncated>{}</ListPartsResult>",
            upload_id, parts
        ))
    }

    fn get(&mut self, request: &SignedRequest, key: &str, head: bool) -> ResponseDescriptor {
        let Some(object) = self
            .buckets
            .get(&request.bucket)
            .and_then(|b| b.objects.get(key))
            .cloned()
        else {
            return error_response(404, "NoSuchKey", "The specified key does not exist");
        };

        if let Some(expected) = request.header("if-match") {
            if expected != object.etag {
                return error_response(
                    412,
                    "PreconditionFailed",
                    "At least one of the pre-conditions you specified did not hold",
                );
            }
        }

        let total = object.data.len() as u64;
        let response = match request.header("range").and_then(parse_range) {
            Some((start, end)) if start < total => {
                let end = end.min(total - 1);
                let mut slice = object.data.slice(start as usize..=end as usize).to_vec();
                let md5 = md5_base64(&slice);
                if let Some(remaining) = self.corrupt_ranges.get_mut(&start) {
                    if *remaining > 0 && !slice.is_empty() {
                        *remaining -= 1;
                        slice[0] ^= 0xff;
                    }
                }
                ResponseDescriptor::new(StatusCode::PARTIAL_CONTENT)
                    .with_header("content-range", &format!("bytes {}-{}/{}", start, end, total))
                    .with_header("content-md5", &md5)
                    .with_body(slice)
            }
            Some(_) => {
                return error_response(
                    416,
                    "InvalidRange",
                    "The requested range is not satisfiable",
                )
            }
            None => ResponseDescriptor::new(StatusCode::OK).with_body(object.data.clone()),
        };

        let length = if head { total } else { response.body.len() as u64 };
        let response = response
            .with_header("etag", &object.etag)
            .with_header("content-length", &length.to_string());
        if head {
            response.with_body(Bytes::new())
        } else {
            response
        }
    }
}

#[async_trait]
impl Transport for MockStore {
    async fn send(
        &self,
        request: &SignedRequest,
        body: Option<&mut ReplayableBody>,
    ) -> Result<ResponseDescriptor, TransportError> {
        let (failure, delay) = {
            let mut state = self.state.lock();
            (state.take_failure(request), state.delay_for(request))
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(failure) = failure {
            return self.inject(request, body, failure).await;
        }

        let payload = match body {
            Some(body) => Bytes::from(body.read_remaining()?),
            None => Bytes::new(),
        };
        Ok(self.state.lock().handle(request, payload))
    }
}

impl MockStore {
    async fn inject(
        &self,
        request: &SignedRequest,
        body: Option<&mut ReplayableBody>,
        failure: InjectedFailure,
    ) -> Result<ResponseDescriptor, TransportError> {
        match failure {
            InjectedFailure::Hang => {
                std::future::pending::<()>().await;
                Err(TransportError::Timeout("request never completed".to_string()))
            }
            InjectedFailure::ConnectionReset => {
                if let Some(body) = body {
                    let mut partial = [0u8; 1024];
                    body.read_chunk(&mut partial)?;
                }
                self.state.lock().log.push(record(request, None));
                Err(TransportError::ConnectionReset(
                    "connection reset by peer".to_string(),
                ))
            }
            InjectedFailure::Timeout => {
                self.state.lock().log.push(record(request, None));
                Err(TransportError::Timeout("no response from server".to_string()))
            }
            InjectedFailure::Status { status, code } => {
                if let Some(body) = body {
                    body.read_remaining()?;
                }
                self.state.lock().log.push(record(request, Some(status)));
                Ok(error_response(status, &code, "Injected failure"))
            }
        }
    }
}
