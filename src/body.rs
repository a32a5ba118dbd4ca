//! Lazily-memoized views over the request body.
//!
//! A request body is read into memory exactly once, as a single immutable
//! [`Bytes`] buffer. Every view (text, parsed JSON, blob, URL-encoded
//! params) is computed at most once on first access and cached; all views
//! are backed by the same buffer, nothing is recopied per access.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde_json::Value;

/// Memoized views over one immutable body buffer.
#[derive(Debug, Default)]
pub struct BodyView {
    bytes: Bytes,
    mime: Option<String>,
    text: OnceLock<String>,
    json: OnceLock<Value>,
    url_params: OnceLock<HashMap<String, String>>,
}

impl Clone for BodyView {
    fn clone(&self) -> Self {
        // Bytes clones are refcount bumps; memos start cold.
        Self::from_bytes(self.bytes.clone(), self.mime.clone())
    }
}

impl BodyView {
    /// The view used when a request carries no parseable body.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Bytes, mime: Option<String>) -> Self {
        Self {
            bytes,
            mime,
            text: OnceLock::new(),
            json: OnceLock::new(),
            url_params: OnceLock::new(),
        }
    }

    /// The raw buffer backing every view.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The body as text. Invalid UTF-8 is replaced, not rejected:
    /// malformed bodies must look like empty-ish bodies, never errors.
    pub fn text(&self) -> &str {
        self.text
            .get_or_init(|| String::from_utf8_lossy(&self.bytes).into_owned())
    }

    /// The body parsed as JSON. Parsed once, cached; repeat calls return
    /// the same reference. A body that is not valid JSON yields
    /// [`Value::Null`], which downstream validation treats the same as an
    /// absent body.
    pub fn json(&self) -> &Value {
        self.json
            .get_or_init(|| serde_json::from_slice(&self.bytes).unwrap_or(Value::Null))
    }

    /// The buffer plus the mimetype it arrived with.
    pub fn blob(&self) -> (Bytes, Option<&str>) {
        (self.bytes.clone(), self.mime.as_deref())
    }

    /// The body decoded as `application/x-www-form-urlencoded` pairs.
    /// Decoding is deferred to this accessor; the raw bytes stay untouched.
    pub fn url_params(&self) -> &HashMap<String, String> {
        self.url_params.get_or_init(|| {
            let mut map = HashMap::new();
            for pair in self.text().split('&') {
                if pair.is_empty() {
                    continue;
                }
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                let k = urlencoding::decode(k).map(|c| c.into_owned()).unwrap_or_else(|_| k.to_owned());
                let v = v.replace('+', " ");
                let v = urlencoding::decode(&v).map(|c| c.into_owned()).unwrap_or(v);
                map.insert(k, v);
            }
            map
        })
    }
}

// ── FileView ──────────────────────────────────────────────────────────────────

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(0);

/// Returns a process-unique generated file name (`upload_<hex>`).
pub(crate) fn generated_file_name() -> String {
    let n = NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed);
    format!("upload_{n:012x}")
}

/// One uploaded file: a multipart file part, or the whole body of an
/// unrecognized content type.
#[derive(Clone, Debug)]
pub struct FileView {
    /// The multipart field name. Empty for the synthetic binary-body file.
    pub key: String,
    /// Generated unique name, safe to use as a storage key.
    pub name: String,
    /// The client-supplied filename. Empty for the synthetic file.
    pub original_name: String,
    /// The part's Content-Type, verbatim.
    pub mime_type: String,
    /// The owning reference to the file's byte buffer.
    pub bytes: Bytes,
}

impl FileView {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_is_parsed_once_and_cached() {
        let body = BodyView::from_bytes(Bytes::from_static(br#"{"id":"abc"}"#), None);
        let first = body.json();
        let second = body.json();
        assert!(std::ptr::eq(first, second));
        assert_eq!(first["id"], "abc");
    }

    #[test]
    fn text_reflects_same_bytes_after_json() {
        let body = BodyView::from_bytes(Bytes::from_static(br#"{"id":"abc"}"#), None);
        let _ = body.json();
        assert_eq!(body.text(), r#"{"id":"abc"}"#);
    }

    #[test]
    fn invalid_json_is_null_not_error() {
        let body = BodyView::from_bytes(Bytes::from_static(b"not json"), None);
        assert!(body.json().is_null());
        assert_eq!(body.text(), "not json");
    }

    #[test]
    fn url_params_decode_lazily() {
        let body = BodyView::from_bytes(
            Bytes::from_static(b"name=a%20b&tag=x%2Fy&plus=1+2"),
            Some("application/x-www-form-urlencoded".to_owned()),
        );
        let params = body.url_params();
        assert_eq!(params["name"], "a b");
        assert_eq!(params["tag"], "x/y");
        assert_eq!(params["plus"], "1 2");
        // raw bytes untouched
        assert_eq!(body.text(), "name=a%20b&tag=x%2Fy&plus=1+2");
    }

    #[test]
    fn generated_names_are_unique() {
        let a = generated_file_name();
        let b = generated_file_name();
        assert_ne!(a, b);
        assert!(a.starts_with("upload_"));
    }
}
