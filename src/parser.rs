//! Content classification and body parsing.
//!
//! Given a method, a Content-Type, and the buffered body bytes, exactly one
//! parsing strategy is selected and produces a normalized
//! [`ParsedBody`]: a [`BodyView`] plus zero or more [`FileView`]s.
//!
//! Multipart parsing enforces its byte and count ceilings proactively,
//! while walking parts, never after buffering past a limit. A violated
//! limit is a typed client error the pipeline renders as 4xx; it is never
//! a crash.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::body::{BodyView, FileView, generated_file_name};
use crate::error::Error;
use crate::method::Method;

// ── Limits ────────────────────────────────────────────────────────────────────

/// Ceilings for multipart and binary bodies.
///
/// Checked while parts are walked, so a request is rejected as soon as a
/// ceiling is crossed rather than after the whole body was accepted.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ParseLimits {
    /// Maximum bytes across all file parts.
    pub max_total_file_bytes: usize,
    /// Maximum bytes for a single file part.
    pub max_file_bytes: usize,
    /// Maximum number of file parts.
    pub max_files: usize,
    /// Maximum bytes for a single non-file field.
    pub max_field_bytes: usize,
    /// Maximum number of non-file fields.
    pub max_fields: usize,
    /// Whether zero-byte file parts are accepted.
    pub allow_empty_files: bool,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_total_file_bytes: 50 * 1024 * 1024,
            max_file_bytes: 10 * 1024 * 1024,
            max_files: 16,
            max_field_bytes: 64 * 1024,
            max_fields: 100,
            allow_empty_files: true,
        }
    }
}

impl ParseLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_total_file_bytes(mut self, n: usize) -> Self {
        self.max_total_file_bytes = n;
        self
    }

    pub fn with_max_file_bytes(mut self, n: usize) -> Self {
        self.max_file_bytes = n;
        self
    }

    pub fn with_max_files(mut self, n: usize) -> Self {
        self.max_files = n;
        self
    }

    pub fn with_max_field_bytes(mut self, n: usize) -> Self {
        self.max_field_bytes = n;
        self
    }

    pub fn with_max_fields(mut self, n: usize) -> Self {
        self.max_fields = n;
        self
    }

    pub fn with_allow_empty_files(mut self, allow: bool) -> Self {
        self.allow_empty_files = allow;
        self
    }
}

// ── Classification ────────────────────────────────────────────────────────────

/// The parsing strategy selected for a request. First match wins.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
    /// No parsing: method outside the body-carrying set, or no Content-Type.
    Skip,
    /// Buffer the body and expose it through [`BodyView`] accessors.
    Buffer,
    /// Walk multipart parts into fields and files.
    Multipart,
    /// The whole body becomes one synthetic file.
    Binary,
}

/// Picks the strategy for a method + Content-Type pair.
pub fn classify(method: Method, content_type: Option<&str>) -> Strategy {
    if !method.carries_body() {
        return Strategy::Skip;
    }
    let Some(raw) = content_type else {
        return Strategy::Skip;
    };
    // Parameters (`; boundary=…`, `; charset=…`) don't participate in
    // strategy selection.
    let mime = raw.split(';').next().unwrap_or(raw).trim().to_ascii_lowercase();

    if mime.starts_with("text/") || mime.ends_with("json") {
        return Strategy::Buffer;
    }
    // Exact types that buffer-parse; `application/json` is already covered
    // by the `json` suffix rule above, kept here for the fixed list.
    if matches!(
        mime.as_str(),
        "application/json" | "application/xml" | "application/javascript"
    ) {
        return Strategy::Buffer;
    }
    if mime == "multipart/form-data" {
        return Strategy::Multipart;
    }
    if mime == "application/x-www-form-urlencoded" {
        return Strategy::Buffer;
    }
    Strategy::Binary
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// The normalized result of body parsing.
#[derive(Clone, Debug, Default)]
pub struct ParsedBody {
    pub body: BodyView,
    pub files: Vec<FileView>,
}

impl ParsedBody {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Runs the selected strategy over the buffered body.
pub fn parse(
    method: Method,
    content_type: Option<&str>,
    bytes: Bytes,
    limits: &ParseLimits,
) -> Result<ParsedBody, Error> {
    match classify(method, content_type) {
        Strategy::Skip => Ok(ParsedBody::empty()),
        Strategy::Buffer => Ok(ParsedBody {
            body: BodyView::from_bytes(bytes, content_type.map(str::to_owned)),
            files: Vec::new(),
        }),
        Strategy::Multipart => {
            let raw = content_type.unwrap_or_default();
            let boundary = boundary_of(raw)
                .ok_or_else(|| Error::bad_request("multipart body without boundary"))?;
            parse_multipart(&bytes, &boundary, limits)
        }
        Strategy::Binary => {
            if bytes.len() > limits.max_file_bytes || bytes.len() > limits.max_total_file_bytes {
                return Err(Error::payload_too_large("binary body exceeds file size limit"));
            }
            let file = FileView {
                key: String::new(),
                name: generated_file_name(),
                original_name: String::new(),
                mime_type: content_type.unwrap_or_default().to_owned(),
                bytes,
            };
            Ok(ParsedBody { body: BodyView::empty(), files: vec![file] })
        }
    }
}

/// Extracts the boundary parameter from a multipart Content-Type.
fn boundary_of(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        if k.trim().eq_ignore_ascii_case("boundary") {
            Some(v.trim().trim_matches('"').to_owned())
        } else {
            None
        }
    })
}

/// Walks `--boundary`-delimited parts, splitting file parts from plain
/// fields and enforcing every ceiling as it goes.
fn parse_multipart(bytes: &Bytes, boundary: &str, limits: &ParseLimits) -> Result<ParsedBody, Error> {
    let delimiter = format!("--{boundary}");
    let mut files = Vec::new();
    let mut fields = serde_json::Map::new();
    let mut total_file_bytes = 0usize;

    let mut rest: &[u8] = bytes;
    // Skip the preamble up to the first delimiter.
    let Some(start) = find(rest, delimiter.as_bytes()) else {
        return Err(Error::bad_request("malformed multipart body"));
    };
    rest = &rest[start + delimiter.len()..];

    loop {
        if rest.starts_with(b"--") {
            break; // closing delimiter
        }
        rest = rest.strip_prefix(b"\r\n").unwrap_or(rest);

        let part_end = find(rest, delimiter.as_bytes());
        let (part, next) = match part_end {
            Some(end) => (&rest[..end], &rest[end + delimiter.len()..]),
            None => break, // truncated body: treat what we have as final
        };

        let Some(header_end) = find(part, b"\r\n\r\n") else {
            return Err(Error::bad_request("multipart part without headers"));
        };
        let headers = &part[..header_end];
        let mut content = &part[header_end + 4..];
        content = content.strip_suffix(b"\r\n").unwrap_or(content);

        let (name, filename, part_mime) = parse_part_headers(headers)?;
        // Zero-copy slice of the request buffer.
        let offset = content.as_ptr() as usize - bytes.as_ptr() as usize;
        let content = bytes.slice(offset..offset + content.len());

        match filename {
            Some(original_name) => {
                if files.len() + 1 > limits.max_files {
                    return Err(Error::too_many_fields("too many file parts"));
                }
                if content.len() > limits.max_file_bytes {
                    return Err(Error::payload_too_large("file part exceeds size limit"));
                }
                total_file_bytes += content.len();
                if total_file_bytes > limits.max_total_file_bytes {
                    return Err(Error::payload_too_large("upload exceeds total size limit"));
                }
                if content.is_empty() && !limits.allow_empty_files {
                    return Err(Error::bad_request("empty file part not permitted"));
                }
                files.push(FileView {
                    key: name,
                    name: generated_file_name(),
                    original_name,
                    mime_type: part_mime.unwrap_or_else(|| "application/octet-stream".to_owned()),
                    bytes: content,
                });
            }
            None => {
                if fields.len() + 1 > limits.max_fields {
                    return Err(Error::too_many_fields("too many fields"));
                }
                if content.len() > limits.max_field_bytes {
                    return Err(Error::payload_too_large("field exceeds size limit"));
                }
                let value = String::from_utf8_lossy(&content).into_owned();
                fields.insert(name, Value::String(value));
            }
        }

        rest = next;
    }

    // Non-file fields become a JSON-object-backed body view, so handlers
    // read multipart fields through the same `body.json()` accessor.
    let body = if fields.is_empty() {
        BodyView::empty()
    } else {
        let buf = serde_json::to_vec(&Value::Object(fields))
            .map_err(|e| Error::bad_request(format!("unencodable multipart fields: {e}")))?;
        BodyView::from_bytes(Bytes::from(buf), Some("application/json".to_owned()))
    };

    Ok(ParsedBody { body, files })
}

/// Pulls `name`, `filename`, and the part Content-Type out of part headers.
fn parse_part_headers(raw: &[u8]) -> Result<(String, Option<String>, Option<String>), Error> {
    let text = String::from_utf8_lossy(raw);
    let mut name = None;
    let mut filename = None;
    let mut mime = None;

    for line in text.split("\r\n") {
        let Some((header, value)) = line.split_once(':') else {
            continue;
        };
        if header.eq_ignore_ascii_case("content-disposition") {
            for param in value.split(';') {
                let param = param.trim();
                if let Some(v) = param.strip_prefix("name=") {
                    name = Some(v.trim_matches('"').to_owned());
                } else if let Some(v) = param.strip_prefix("filename=") {
                    filename = Some(v.trim_matches('"').to_owned());
                }
            }
        } else if header.eq_ignore_ascii_case("content-type") {
            mime = Some(value.trim().to_owned());
        }
    }

    match name {
        Some(name) => Ok((name, filename, mime)),
        None => Err(Error::bad_request("multipart part without a field name")),
    }
}

/// First index of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multipart_body(parts: &[(&str, Option<&str>, &str)]) -> (String, Bytes) {
        let boundary = "xYzBoundary";
        let mut body = String::new();
        for (name, filename, content) in parts {
            body.push_str(&format!("--{boundary}\r\n"));
            match filename {
                Some(f) => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\nContent-Type: text/plain\r\n\r\n"
                )),
                None => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                )),
            }
            body.push_str(content);
            body.push_str("\r\n");
        }
        body.push_str(&format!("--{boundary}--\r\n"));
        (
            format!("multipart/form-data; boundary={boundary}"),
            Bytes::from(body),
        )
    }

    #[test]
    fn strategy_table() {
        let cases = [
            ("application/json", Strategy::Buffer),
            ("text/plain", Strategy::Buffer),
            ("text/csv; charset=utf-8", Strategy::Buffer),
            ("application/xml", Strategy::Buffer),
            ("application/javascript", Strategy::Buffer),
            ("application/vnd.api+json", Strategy::Buffer),
            ("application/x-www-form-urlencoded", Strategy::Buffer),
            ("multipart/form-data; boundary=x", Strategy::Multipart),
            ("application/pdf", Strategy::Binary),
            ("image/png", Strategy::Binary),
        ];
        for (content_type, expected) in cases {
            assert_eq!(classify(Method::Post, Some(content_type)), expected, "{content_type}");
        }
    }

    #[test]
    fn get_and_missing_content_type_skip_parsing() {
        assert_eq!(classify(Method::Get, Some("application/json")), Strategy::Skip);
        assert_eq!(classify(Method::Post, None), Strategy::Skip);
    }

    #[test]
    fn binary_produces_one_synthetic_file() {
        let parsed = parse(
            Method::Post,
            Some("application/pdf"),
            Bytes::from_static(b"%PDF-1.4"),
            &ParseLimits::default(),
        )
        .unwrap();
        assert!(parsed.body.json().is_null());
        assert_eq!(parsed.files.len(), 1);
        let file = &parsed.files[0];
        assert_eq!(file.key, "");
        assert_eq!(file.original_name, "");
        assert_eq!(file.mime_type, "application/pdf");
        assert!(!file.name.is_empty());
    }

    #[test]
    fn multipart_splits_fields_and_files() {
        let (content_type, body) = multipart_body(&[
            ("title", None, "hello"),
            ("doc", Some("a.txt"), "file contents"),
        ]);
        let parsed = parse(Method::Post, Some(&content_type), body, &ParseLimits::default()).unwrap();
        assert_eq!(parsed.body.json()["title"], "hello");
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].key, "doc");
        assert_eq!(parsed.files[0].original_name, "a.txt");
        assert_eq!(&parsed.files[0].bytes[..], b"file contents");
    }

    #[test]
    fn multipart_file_limit_is_a_client_error() {
        let (content_type, body) = multipart_body(&[("doc", Some("a.bin"), "0123456789")]);
        let limits = ParseLimits::default().with_max_file_bytes(4);
        let err = parse(Method::Post, Some(&content_type), body, &limits).unwrap_err();
        assert_eq!(err.status(), 413);
    }

    #[test]
    fn multipart_field_count_limit() {
        let (content_type, body) = multipart_body(&[("a", None, "1"), ("b", None, "2")]);
        let limits = ParseLimits::default().with_max_fields(1);
        let err = parse(Method::Post, Some(&content_type), body, &limits).unwrap_err();
        assert_eq!(err.status(), 431);
    }

    #[test]
    fn empty_file_rejected_when_disallowed() {
        let (content_type, body) = multipart_body(&[("doc", Some("a.txt"), "")]);
        let limits = ParseLimits::default().with_allow_empty_files(false);
        let err = parse(Method::Post, Some(&content_type), body, &limits).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn urlencoded_defers_decoding() {
        let parsed = parse(
            Method::Post,
            Some("application/x-www-form-urlencoded"),
            Bytes::from_static(b"a=1%202"),
            &ParseLimits::default(),
        )
        .unwrap();
        assert_eq!(parsed.body.text(), "a=1%202");
        assert_eq!(parsed.body.url_params()["a"], "1 2");
    }
}
