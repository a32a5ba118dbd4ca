//! The response envelope and the [`IntoEnvelope`] conversion trait.
//!
//! Every handler return value is normalized into an [`Envelope`]: one of
//! seven tagged variants, all carrying `{content, code, headers}`. The
//! pipeline's Send stage is the only consumer; the template module decides
//! the wire shape of Plain and Exception envelopes.
//!
//! Status codes are validated at construction: the base envelope accepts
//! `100..=599`, a Redirect only `300..=399` (default 302).

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;

use crate::error::Error;

/// A type-erased stream of response chunks. `Sync` is required because the
/// wire body it feeds is a `Sync` trait object.
pub type ByteStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static>>;

/// Content of a Plain envelope: a JSON payload the template wraps, or a
/// buffer the template passes through untouched.
#[derive(Clone, Debug)]
pub enum PlainBody {
    Json(Value),
    Buffer(Bytes),
}

/// Content of a Raw envelope, written verbatim, bypassing the template.
#[derive(Clone, Debug)]
pub enum RawBody {
    Text(String),
    Buffer(Bytes),
    /// Any other value: strictly JSON-serialized at send time.
    Json(Value),
}

/// Content of a File envelope. Starts as a path; the pipeline's
/// FormatResponse stage resolves it to bytes (a missing file degrades to a
/// 404 exception, never a crash).
#[derive(Clone, Debug)]
pub enum FileBody {
    Path(PathBuf),
    Resolved(Bytes),
}

/// A caught error, rendered through the response template.
#[derive(Clone, Debug)]
pub struct Exception {
    pub name: String,
    pub message: String,
}

/// The tagged variants of a response.
pub enum EnvelopeKind {
    Plain(PlainBody),
    Raw(RawBody),
    File(FileBody),
    Redirect,
    Stream(ByteStream),
    Exception(Exception),
    /// Header/status overrides contributed mid-pipeline; merged into
    /// whatever is ultimately written, never sent on its own.
    Modification,
}

impl fmt::Debug for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(body)    => f.debug_tuple("Plain").field(body).finish(),
            Self::Raw(body)      => f.debug_tuple("Raw").field(body).finish(),
            Self::File(body)     => f.debug_tuple("File").field(body).finish(),
            Self::Redirect       => f.write_str("Redirect"),
            Self::Stream(_)      => f.write_str("Stream(..)"),
            Self::Exception(e)   => f.debug_tuple("Exception").field(e).finish(),
            Self::Modification   => f.write_str("Modification"),
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// A normalized response: variant + status code + headers.
#[derive(Debug)]
pub struct Envelope {
    kind: EnvelopeKind,
    code: u16,
    headers: Vec<(String, String)>,
}

impl Envelope {
    /// A 200 Plain envelope wrapping a JSON payload.
    pub fn plain(payload: impl Into<Value>) -> Self {
        Self::with_kind(EnvelopeKind::Plain(PlainBody::Json(payload.into())), 200)
    }

    /// A 200 Plain envelope carrying a buffer the template passes through.
    pub fn buffer(bytes: impl Into<Bytes>) -> Self {
        Self::with_kind(EnvelopeKind::Plain(PlainBody::Buffer(bytes.into())), 200)
    }

    /// A 200 Raw envelope: the text is written verbatim, untemplated.
    pub fn raw_text(text: impl Into<String>) -> Self {
        Self::with_kind(EnvelopeKind::Raw(RawBody::Text(text.into())), 200)
    }

    /// A 200 Raw envelope: the bytes are written verbatim.
    pub fn raw_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::with_kind(EnvelopeKind::Raw(RawBody::Buffer(bytes.into())), 200)
    }

    /// A 200 Raw envelope: the value is strictly JSON-serialized at send.
    pub fn raw_json(payload: impl Into<Value>) -> Self {
        Self::with_kind(EnvelopeKind::Raw(RawBody::Json(payload.into())), 200)
    }

    /// A File envelope. The path is resolved to bytes during
    /// FormatResponse; a read failure becomes a 404 exception.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::with_kind(EnvelopeKind::File(FileBody::Path(path.into())), 200)
    }

    /// A 302 redirect to `location`. Use [`Envelope::code`] to pick another
    /// 3xx code; anything outside `300..=399` fails.
    pub fn redirect(location: impl Into<String>) -> Self {
        let mut env = Self::with_kind(EnvelopeKind::Redirect, 302);
        env.headers.push(("location".to_owned(), location.into()));
        env
    }

    /// A 200 Stream envelope piping `stream` to the client.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static,
    {
        Self::with_kind(EnvelopeKind::Stream(Box::pin(stream)), 200)
    }

    /// A 500 Exception envelope.
    pub fn exception(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_kind(
            EnvelopeKind::Exception(Exception { name: name.into(), message: message.into() }),
            500,
        )
    }

    /// A Modification envelope: header/status overrides carried through the
    /// pipeline without terminating it. `code` 0 means "no override".
    pub fn modification() -> Self {
        Self { kind: EnvelopeKind::Modification, code: 0, headers: Vec::new() }
    }

    /// Renders an [`Error`] as the Exception envelope the client will see.
    pub fn from_error(err: &Error, verbose: bool) -> Self {
        let mut env = Self::exception(err.name(), err.client_message(verbose));
        env.code = err.status().clamp(100, 599);
        env
    }

    fn with_kind(kind: EnvelopeKind, code: u16) -> Self {
        Self { kind, code, headers: Vec::new() }
    }

    /// Reassembles an envelope previously split by `into_parts`.
    pub(crate) fn from_parts(kind: EnvelopeKind, code: u16, headers: Vec<(String, String)>) -> Self {
        Self { kind, code, headers }
    }

    /// Sets the status code, enforcing `100..=599` (and `300..=399` for
    /// redirects).
    pub fn code(mut self, code: u16) -> Result<Self, Error> {
        match self.kind {
            EnvelopeKind::Redirect if !(300..=399).contains(&code) => {
                return Err(Error::Configuration(format!(
                    "redirect status {code} outside 300..=399"
                )));
            }
            _ if !(100..=599).contains(&code) => {
                return Err(Error::Configuration(format!("status {code} outside 100..=599")));
            }
            _ => {}
        }
        self.code = code;
        Ok(self)
    }

    /// Appends a response header.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn status(&self) -> u16 {
        self.code
    }

    pub fn kind(&self) -> &EnvelopeKind {
        &self.kind
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub(crate) fn into_parts(self) -> (EnvelopeKind, u16, Vec<(String, String)>) {
        (self.kind, self.code, self.headers)
    }
}

// ── IntoEnvelope ──────────────────────────────────────────────────────────────

/// Conversion into an [`Envelope`].
///
/// Implemented for envelopes themselves, JSON values, strings, buffers, and
/// `Result`, so a handler returns whichever is natural and the pipeline
/// normalizes it:
///
/// ```rust
/// use viaduct::{ClientRequest, Envelope};
/// use serde_json::json;
///
/// async fn create_item(_req: ClientRequest) -> Result<Envelope, viaduct::Error> {
///     Envelope::plain(json!({ "userId": "abc" })).code(201)
/// }
/// ```
pub trait IntoEnvelope {
    fn into_envelope(self) -> Envelope;
}

impl IntoEnvelope for Envelope {
    fn into_envelope(self) -> Envelope {
        self
    }
}

/// Any JSON value (object, array, string, number, boolean, null) becomes
/// a default 200 Plain envelope.
impl IntoEnvelope for Value {
    fn into_envelope(self) -> Envelope {
        Envelope::plain(self)
    }
}

impl IntoEnvelope for &'static str {
    fn into_envelope(self) -> Envelope {
        Envelope::plain(self)
    }
}

impl IntoEnvelope for String {
    fn into_envelope(self) -> Envelope {
        Envelope::plain(self)
    }
}

/// Buffers wrap into Plain and pass through the template untouched.
impl IntoEnvelope for Bytes {
    fn into_envelope(self) -> Envelope {
        Envelope::buffer(self)
    }
}

impl IntoEnvelope for Vec<u8> {
    fn into_envelope(self) -> Envelope {
        Envelope::buffer(self)
    }
}

impl IntoEnvelope for () {
    fn into_envelope(self) -> Envelope {
        Envelope::plain(Value::Null)
    }
}

/// Handler errors become exception envelopes; the pipeline never sees a
/// bare `Err`.
impl<T: IntoEnvelope> IntoEnvelope for Result<T, Error> {
    fn into_envelope(self) -> Envelope {
        match self {
            Ok(v) => v.into_envelope(),
            Err(e) => Envelope::from_error(&e, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_bounds_are_enforced() {
        assert!(Envelope::plain("x").code(99).is_err());
        assert!(Envelope::plain("x").code(600).is_err());
        assert!(Envelope::plain("x").code(100).is_ok());
        assert!(Envelope::plain("x").code(599).is_ok());
    }

    #[test]
    fn redirect_restricts_to_3xx() {
        assert!(Envelope::redirect("/next").code(299).is_err());
        assert!(Envelope::redirect("/next").code(400).is_err());
        assert!(Envelope::redirect("/next").code(300).is_ok());
        assert!(Envelope::redirect("/next").code(399).is_ok());
    }

    #[test]
    fn redirect_defaults_to_302_with_location() {
        let env = Envelope::redirect("/next");
        assert_eq!(env.status(), 302);
        assert_eq!(env.headers(), &[("location".to_owned(), "/next".to_owned())]);
    }

    #[test]
    fn error_results_become_exceptions() {
        let env = Err::<Envelope, _>(Error::not_found()).into_envelope();
        assert_eq!(env.status(), 404);
        assert!(matches!(env.kind(), EnvelopeKind::Exception(e) if e.name == "ClientInputError"));
    }
}
