//! The response template, the only place that decides the wire-body shape
//! of Plain and Exception envelopes.
//!
//! The default wraps payloads and errors in a `{"error", "content"}` JSON
//! envelope. Replace it wholesale through
//! [`Config::template`](crate::Config) to adopt an application-specific API
//! convention; Raw, File, Stream, and Redirect envelopes never pass through
//! here.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Value, json};

use crate::response::PlainBody;

/// What the template receives: a successful payload or a caught error,
/// each with the envelope's code and headers.
#[derive(Debug)]
pub enum TemplateInput {
    Payload {
        content: PlainBody,
        code: u16,
        headers: Vec<(String, String)>,
    },
    Error {
        name: String,
        message: String,
        code: u16,
        headers: Vec<(String, String)>,
    },
}

/// The templated wire form: body bytes, final code, final headers.
#[derive(Debug)]
pub struct Rendered {
    pub content: Bytes,
    pub code: u16,
    pub headers: Vec<(String, String)>,
}

/// A pluggable template function.
pub type ResponseTemplate = Arc<dyn Fn(TemplateInput) -> Rendered + Send + Sync>;

/// The built-in template.
///
/// - Errors → `{"error": <name>, "content": <message>}` with a JSON
///   content-type merged over the envelope's headers.
/// - JSON payloads → `{"error": null, "content": <payload>}`; content-type
///   defaults to JSON only when the envelope carried no headers of its own.
/// - Buffers pass through untouched.
pub fn default_template(input: TemplateInput) -> Rendered {
    match input {
        TemplateInput::Error { name, message, code, mut headers } => {
            let body = json!({ "error": name, "content": message });
            headers.retain(|(k, _)| k != "content-type");
            headers.push(("content-type".to_owned(), "application/json".to_owned()));
            Rendered { content: to_bytes(&body), code, headers }
        }
        TemplateInput::Payload { content: PlainBody::Buffer(bytes), code, headers } => {
            Rendered { content: bytes, code, headers }
        }
        TemplateInput::Payload { content: PlainBody::Json(payload), code, mut headers } => {
            let body = json!({ "error": null, "content": payload });
            if headers.is_empty() {
                headers.push(("content-type".to_owned(), "application/json".to_owned()));
            }
            Rendered { content: to_bytes(&body), code, headers }
        }
    }
}

fn to_bytes(value: &Value) -> Bytes {
    // Serializing a `Value` cannot fail.
    Bytes::from(serde_json::to_vec(value).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_json(rendered: &Rendered) -> Value {
        serde_json::from_slice(&rendered.content).unwrap()
    }

    #[test]
    fn payload_is_wrapped_with_null_error() {
        let rendered = default_template(TemplateInput::Payload {
            content: PlainBody::Json(json!({ "userId": "abc" })),
            code: 201,
            headers: Vec::new(),
        });
        assert_eq!(rendered.code, 201);
        assert_eq!(body_json(&rendered), json!({ "error": null, "content": { "userId": "abc" } }));
        assert_eq!(
            rendered.headers,
            vec![("content-type".to_owned(), "application/json".to_owned())]
        );
    }

    #[test]
    fn existing_headers_suppress_the_default_content_type() {
        let rendered = default_template(TemplateInput::Payload {
            content: PlainBody::Json(json!("ok")),
            code: 200,
            headers: vec![("content-type".to_owned(), "application/hal+json".to_owned())],
        });
        assert_eq!(rendered.headers.len(), 1);
        assert_eq!(rendered.headers[0].1, "application/hal+json");
    }

    #[test]
    fn errors_render_name_and_message() {
        let rendered = default_template(TemplateInput::Error {
            name: "ValidationError".to_owned(),
            message: "invalid body".to_owned(),
            code: 400,
            headers: Vec::new(),
        });
        assert_eq!(rendered.code, 400);
        assert_eq!(
            body_json(&rendered),
            json!({ "error": "ValidationError", "content": "invalid body" })
        );
    }

    #[test]
    fn buffers_pass_through_untouched() {
        let rendered = default_template(TemplateInput::Payload {
            content: PlainBody::Buffer(Bytes::from_static(b"\x00\x01")),
            code: 200,
            headers: Vec::new(),
        });
        assert_eq!(&rendered.content[..], b"\x00\x01");
        assert!(rendered.headers.is_empty());
    }
}
