//! Unified error taxonomy.
//!
//! Application-level failures (a missed route, a rejected body, a handler
//! that fell over) are all values of [`Error`] and are converted into
//! response envelopes by the dispatch pipeline; nothing in the request path
//! escapes uncaught. Only [`Error::Configuration`] is different: it surfaces
//! synchronously at registration time and is meant to stop the program
//! before it starts serving.

use std::fmt;

/// The validation slot a schema is attached to.
///
/// Slots are checked in the fixed order `Body → Headers → Query → Params`
/// on every dispatch to a route carrying schemas.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Slot {
    Body,
    Headers,
    Query,
    Params,
}

impl Slot {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Body    => "body",
            Self::Headers => "headers",
            Self::Query   => "query",
            Self::Params  => "params",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can go wrong between accepting a connection and writing
/// the response.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A 4xx-family failure caused by the client: malformed request line,
    /// unmatched route, oversized or over-count upload.
    #[error("{message}")]
    ClientInput { status: u16, message: String },

    /// A schema validation failure, carrying the failing slot and the
    /// validator's per-field messages. Whether the client sees the messages
    /// or a generic `invalid <slot>` is decided by configuration at
    /// render time, not here.
    #[error("invalid {slot}")]
    Validation { slot: Slot, messages: Vec<String> },

    /// An error raised by user handler code, wrapped so it can be rendered
    /// as an exception envelope. `code` defaults to 500 when the original
    /// error carried no status.
    #[error("{name}: {message}")]
    Handler { name: String, message: String, code: u16 },

    /// A file or stream read failure while producing the response.
    #[error("io: {0}")]
    UpstreamIo(#[from] std::io::Error),

    /// A setup-time mistake: duplicate plugin name, conflicting route
    /// registration, out-of-range status code. Fatal at registration.
    #[error("configuration: {0}")]
    Configuration(String),
}

impl Error {
    /// A 404 for an unmatched route or a rejected host.
    pub fn not_found() -> Self {
        Self::ClientInput { status: 404, message: "not found".to_owned() }
    }

    /// A 400 for a body the parser explicitly rejected.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::ClientInput { status: 400, message: message.into() }
    }

    /// A 413 for an upload that crossed a configured byte ceiling.
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::ClientInput { status: 413, message: message.into() }
    }

    /// A 431 for an upload that crossed a configured count ceiling.
    pub fn too_many_fields(message: impl Into<String>) -> Self {
        Self::ClientInput { status: 431, message: message.into() }
    }

    /// Wraps an arbitrary handler failure as a 500-class exception.
    pub fn handler(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler { name: name.into(), message: message.into(), code: 500 }
    }

    /// The status code this error renders with.
    pub fn status(&self) -> u16 {
        match self {
            Self::ClientInput { status, .. } => *status,
            Self::Validation { .. }          => 400,
            Self::Handler { code, .. }       => *code,
            Self::UpstreamIo(_)              => 500,
            Self::Configuration(_)           => 500,
        }
    }

    /// The `error` field the default response template reports.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClientInput { .. } => "ClientInputError",
            Self::Validation { .. }  => "ValidationError",
            Self::Handler { .. }     => "HandlerError",
            Self::UpstreamIo(_)      => "UpstreamIOError",
            Self::Configuration(_)   => "ConfigurationError",
        }
    }

    /// The message shown to the client.
    ///
    /// Validation failures leak field-level detail only when `verbose` is
    /// set; everything else renders its display form.
    pub fn client_message(&self, verbose: bool) -> String {
        match self {
            Self::Validation { messages, .. } if verbose && !messages.is_empty() => {
                messages.join("; ")
            }
            Self::Validation { slot, .. } => format!("invalid {slot}"),
            other => other.to_string(),
        }
    }
}
