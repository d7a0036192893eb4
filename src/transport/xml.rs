//! Minimal reader for the flat XML documents storage providers return

use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;

/// Leaf values of a document, with repeated `record_tag` groups collected
/// separately
#[derive(Debug, Default, Clone)]
pub struct XmlDocument {
    pub root: String,
    /// Leaves outside any record; the first occurrence of a name wins
    pub fields: HashMap<String, String>,
    pub records: Vec<HashMap<String, String>>,
}

impl XmlDocument {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Parse `body`, grouping the children of every `record_tag` element
pub fn parse(body: &[u8], record_tag: Option<&str>) -> Result<XmlDocument, String> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut doc = XmlDocument::default();
    let mut stack: Vec<String> = Vec::new();
    let mut record: Option<HashMap<String, String>> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if doc.root.is_empty() {
                    doc.root = name.clone();
                }
                if record_tag == Some(name.as_str()) {
                    record = Some(HashMap::new());
                }
                stack.push(name);
            }
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| format!("Malformed XML text: {}", e))?
                    .to_string();
                if let Some(tag) = stack.last() {
                    match record.as_mut() {
                        Some(fields) => {
                            fields.insert(tag.clone(), text);
                        }
                        None => {
                            doc.fields.entry(tag.clone()).or_insert(text);
                        }
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if record_tag == Some(name.as_str()) {
                    if let Some(fields) = record.take() {
                        doc.records.push(fields);
                    }
                }
                stack.pop();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(format!("Malformed XML: {}", e)),
        }
        buf.clear();
    }

    if doc.root.is_empty() {
        return Err("Empty XML document".to_string());
    }
    Ok(doc)
}

/// Escape text for inclusion in an element body
pub fn escape(text: &str) -> String {
    quick_xml::escape::escape(text).to_string()
}

/// Provider error document (`<Error><Code>..</Code>...</Error>`)
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ErrorDocument {
    pub code: Option<String>,
    pub message: Option<String>,
    pub region: Option<String>,
    pub request_id: Option<String>,
}

impl ErrorDocument {
    /// `None` unless `body` is an `<Error>` document
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.is_empty() {
            return None;
        }
        let doc = parse(body, None).ok()?;
        if doc.root != "Error" {
            return None;
        }
        Some(Self {
            code: doc.field("Code").map(str::to_string),
            message: doc.field("Message").map(str::to_string),
            region: doc.field("Region").map(str::to_string),
            request_id: doc.field("RequestId").map(str::to_string),
        })
    }

    /// Render an error document
    pub fn render(code: &str, message: &str, region: Option<&str>) -> String {
        let region = region
            .map(|r| format!("<Region>{}</Region>", escape(r)))
            .unwrap_or_default();
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Error><Code>{}</Code><Message>{}</Message>{}<RequestId>stratus</RequestId></Error>",
            escape(code),
            escape(message),
            region
        )
    }
}
