//! Multipart operations and their response documents
//!
//! Builds the [`Operation`]s a transfer issues and reads the few fields the
//! coordinator needs back out of the provider's responses.

use crate::body::md5_base64;
use crate::error::{Result, StratusError};
use crate::transport::xml::{self, ErrorDocument};
use crate::transport::{Operation, ResponseDescriptor};
use http::Method;

pub fn initiate(bucket: &str, key: &str) -> Operation {
    Operation::new("CreateMultipartUpload", Method::POST, bucket)
        .with_key(key)
        .with_query("uploads", "")
}

pub fn upload_part(
    bucket: &str,
    key: &str,
    upload_id: &str,
    part_number: u32,
    data: &[u8],
) -> Result<Operation> {
    Operation::new("UploadPart", Method::PUT, bucket)
        .with_key(key)
        .with_query("partNumber", part_number.to_string())
        .with_query("uploadId", upload_id)
        .with_header("content-md5", &md5_base64(data))
}

pub fn complete(bucket: &str, key: &str, upload_id: &str) -> Operation {
    Operation::new("CompleteMultipartUpload", Method::POST, bucket)
        .with_key(key)
        .with_query("uploadId", upload_id)
}

pub fn abort(bucket: &str, key: &str, upload_id: &str) -> Operation {
    Operation::new("AbortMultipartUpload", Method::DELETE, bucket)
        .with_key(key)
        .with_query("uploadId", upload_id)
}

pub fn list_parts(bucket: &str, key: &str, upload_id: &str) -> Operation {
    Operation::new("ListParts", Method::GET, bucket)
        .with_key(key)
        .with_query("uploadId", upload_id)
}

pub fn put_object(bucket: &str, key: &str, data: &[u8]) -> Result<Operation> {
    Operation::new("PutObject", Method::PUT, bucket)
        .with_key(key)
        .with_header("content-md5", &md5_base64(data))
}

pub fn head_object(bucket: &str, key: &str) -> Operation {
    Operation::new("HeadObject", Method::HEAD, bucket).with_key(key)
}

/// Ranged GET that fails if the object changed since `etag` was observed
pub fn get_range(bucket: &str, key: &str, range: &str, etag: Option<&str>) -> Result<Operation> {
    let operation = Operation::new("GetObject", Method::GET, bucket)
        .with_key(key)
        .with_header("range", range)?;
    match etag {
        Some(etag) => operation.with_header("if-match", etag),
        None => Ok(operation),
    }
}

/// Part list body for the completion call; `parts` must already be ordered
pub fn render_part_list(parts: &[(u32, String)]) -> String {
    let mut body = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<CompleteMultipartUpload>",
    );
    for (part_number, etag) in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part_number,
            xml::escape(etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

fn parse_document(
    response: &ResponseDescriptor,
    record_tag: Option<&str>,
) -> Result<xml::XmlDocument> {
    xml::parse(&response.body, record_tag).map_err(StratusError::Serialization)
}

/// Upload id from an initiate response
pub fn parse_upload_id(response: &ResponseDescriptor) -> Result<String> {
    parse_document(response, None)?
        .field("UploadId")
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| StratusError::Serialization("response carries no UploadId".to_string()))
}

/// Final object ETag from a completion response
///
/// A successful status whose body is an error document is still a
/// completion failure.
pub fn parse_completion(response: &ResponseDescriptor, upload_id: &str) -> Result<String> {
    if let Some(error) = ErrorDocument::parse(&response.body) {
        return Err(StratusError::Completion {
            upload_id: upload_id.to_string(),
            message: format!(
                "{}: {}",
                error.code.unwrap_or_default(),
                error.message.unwrap_or_default()
            ),
        });
    }
    Ok(parse_document(response, None)?
        .field("ETag")
        .map(str::to_string)
        .unwrap_or_default())
}

/// Part as listed by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

pub fn parse_list_parts(response: &ResponseDescriptor) -> Result<Vec<ListedPart>> {
    parse_document(response, Some("Part"))?
        .records
        .iter()
        .map(|record| {
            let field = |name: &str| {
                record.get(name).ok_or_else(|| {
                    StratusError::Serialization(format!("listed part is missing {}", name))
                })
            };
            Ok(ListedPart {
                part_number: field("PartNumber")?
                    .parse()
                    .map_err(|e| StratusError::Serialization(format!("bad PartNumber: {}", e)))?,
                etag: field("ETag")?.clone(),
                size: field("Size")?
                    .parse()
                    .map_err(|e| StratusError::Serialization(format!("bad Size: {}", e)))?,
            })
        })
        .collect()
}

/// Size and ETag of an object from a HEAD response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
    pub etag: Option<String>,
}

pub fn parse_object_info(response: &ResponseDescriptor) -> Result<ObjectInfo> {
    let size = response
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            StratusError::Serialization("response carries no Content-Length".to_string())
        })?;
    Ok(ObjectInfo {
        size,
        etag: response.etag(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[test]
    fn test_part_list_is_rendered_in_given_order() {
        let body = render_part_list(&[(1, "\"a\"".to_string()), (2, "\"b\"".to_string())]);
        let doc = xml::parse(body.as_bytes(), Some("Part")).unwrap();
        assert_eq!(doc.root, "CompleteMultipartUpload");
        let numbers: Vec<&str> = doc
            .records
            .iter()
            .map(|r| r.get("PartNumber").unwrap().as_str())
            .collect();
        assert_eq!(numbers, vec!["1", "2"]);
        assert_eq!(doc.records[0].get("ETag").unwrap(), "\"a\"");
    }

    #[test]
    fn test_completion_error_inside_success() {
        let response = ResponseDescriptor::new(StatusCode::OK)
            .with_body(ErrorDocument::render("InternalError", "try again", None));
        let err = parse_completion(&response, "u1").unwrap_err();
        assert!(matches!(err, StratusError::Completion { ref upload_id, .. } if upload_id == "u1"));
        assert!(err.to_string().contains("InternalError"));
    }

    #[test]
    fn test_parse_upload_id() {
        let response = ResponseDescriptor::new(StatusCode::OK).with_body(
            "<InitiateMultipartUploadResult><Bucket>b</Bucket><Key>k</Key>\
             <UploadId>abc-123</UploadId></InitiateMultipartUploadResult>",
        );
        assert_eq!(parse_upload_id(&response).unwrap(), "abc-123");

        let empty = ResponseDescriptor::new(StatusCode::OK)
            .with_body("<InitiateMultipartUploadResult/>");
        assert!(parse_upload_id(&empty).is_err());
    }

    #[test]
    fn test_parse_list_parts() {
        let response = ResponseDescriptor::new(StatusCode::OK).with_body(
            "<ListPartsResult><UploadId>u</UploadId>\
             <Part><PartNumber>1</PartNumber><ETag>\"a\"</ETag><Size>5</Size></Part>\
             <Part><PartNumber>3</PartNumber><ETag>\"c\"</ETag><Size>2</Size></Part>\
             </ListPartsResult>",
        );
        let parts = parse_list_parts(&response).unwrap();
        assert_eq!(
            parts[1],
            ListedPart {
                part_number: 3,
                etag: "\"c\"".to_string(),
                size: 2
            }
        );
    }

    #[test]
    fn test_get_range_carries_precondition() {
        let op = get_range("b", "k", "bytes=0-9", Some("\"e\"")).unwrap();
        assert_eq!(op.headers.get("range").unwrap(), "bytes=0-9");
        assert_eq!(op.headers.get("if-match").unwrap(), "\"e\"");
    }
}
