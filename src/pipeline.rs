//! The request lifecycle state machine.
//!
//! One inbound request moves through a fixed sequence of stages:
//!
//! ```text
//! plugin pre-hooks → normalize → plugin observe → middleware chain
//!   → route match → validate/modify/handle → format → plugin pre-send → send
//! ```
//!
//! Nothing escapes the pipeline uncaught: every failure from normalization
//! onward is folded into an [`Envelope`] and written to the wire, so a
//! broken handler can never take the process down. Middleware may
//! short-circuit straight to the send stage, or contribute header/status
//! overrides that are merged into whatever response is ultimately written.

use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::headers::HeaderMultiMap;
use crate::method::Method;
use crate::middleware::{ErasedMiddleware, MiddlewareHandle, MiddlewareRegistry};
use crate::parser;
use crate::plugin::{Plugin, PluginRegistry};
use crate::request::ProcessedRequest;
use crate::response::{ByteStream, Envelope, EnvelopeKind, FileBody, RawBody};
use crate::router::Router;
use crate::schema::{FieldValidator, Validator};
use crate::template::{default_template, Rendered, ResponseTemplate, TemplateInput};

/// The body type every response is erased into before hitting the wire.
pub type WireBody = BoxBody<Bytes, std::io::Error>;

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// The assembled framework: router, middleware, plugins, validator, config.
///
/// Build one per server, register everything, then wrap it in an `Arc` and
/// call [`handle`](Pipeline::handle) once per request.
pub struct Pipeline {
    router: Router,
    middleware: RwLock<MiddlewareRegistry>,
    plugins: Arc<PluginRegistry>,
    validator: Arc<dyn Validator>,
    template: ResponseTemplate,
    config: Config,
}

impl Pipeline {
    pub fn new(mut config: Config) -> Self {
        let template = config
            .template
            .take()
            .unwrap_or_else(|| Arc::new(default_template));
        let plugins = Arc::new(PluginRegistry::new());

        let router = Router::new();
        router.on_update(registry_notifier(plugins.clone()));

        Self {
            router,
            middleware: RwLock::new(MiddlewareRegistry::new()),
            plugins,
            validator: Arc::new(FieldValidator),
            template,
            config,
        }
    }

    /// Swaps in a different schema validator. Call before serving.
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// The registration handle. Clones are cheap and share one tree.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn add_middleware<F, Fut>(&self, middleware: F) -> MiddlewareHandle
    where
        F: Fn(Arc<ProcessedRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Envelope>> + Send + 'static,
    {
        let handle = self.write_middleware().add(middleware);
        registry_notifier(self.plugins.clone())();
        handle
    }

    pub fn remove_middleware(&self, handle: MiddlewareHandle) -> bool {
        let removed = self.write_middleware().remove(handle);
        if removed {
            registry_notifier(self.plugins.clone())();
        }
        removed
    }

    /// Registers a plugin. Duplicate names are a hard setup error.
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), Error> {
        self.plugins.register(plugin)?;
        registry_notifier(self.plugins.clone())();
        Ok(())
    }

    pub(crate) fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    fn write_middleware(&self) -> std::sync::RwLockWriteGuard<'_, MiddlewareRegistry> {
        self.middleware.write().unwrap_or_else(|e| e.into_inner())
    }

    fn middleware_chain(&self) -> Vec<ErasedMiddleware> {
        self.middleware
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }
}

/// Fans a registry change out to every plugin's update hook. Fired from
/// synchronous registration paths, so the async hook runs on a spawned
/// task when a runtime is available and is skipped otherwise.
fn registry_notifier(plugins: Arc<PluginRegistry>) -> Arc<dyn Fn() + Send + Sync> {
    Arc::new(move || {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let plugins = plugins.clone();
            handle.spawn(async move { plugins.notify_update().await });
        }
    })
}

// ── Request lifecycle ─────────────────────────────────────────────────────────

impl Pipeline {
    /// Drives one request through every stage and produces the wire
    /// response. Never fails; failures become error envelopes.
    pub async fn handle<B>(
        &self,
        req: http::Request<B>,
        remote_ip: IpAddr,
    ) -> http::Response<WireBody>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
        B::Error: std::error::Error,
    {
        self.plugins.ensure_initialized().await;

        let (parts, body) = req.into_parts();

        // Pre-receipt hooks see the raw head, before any parsing. A `false`
        // return means the plugin owns the response; nothing more is
        // written on this exchange.
        for plugin in self.plugins.snapshot() {
            match plugin.on_before_request_received(&parts).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(plugin = plugin.name(), "request aborted by pre-receipt hook");
                    return abort_response();
                }
                Err(err) => {
                    error!(plugin = plugin.name(), "pre-receipt hook failed: {err}");
                }
            }
        }

        let started = Instant::now();
        let method_label = parts.method.as_str().to_owned();
        let path_label = parts.uri.path().to_owned();

        let envelope = match self.normalize(&parts, body, remote_ip).await {
            Ok(request) => self.dispatch(request).await,
            Err(err) => {
                let verbose = self.config.verbose_validation;
                Finished::plain(Envelope::from_error(&err, verbose))
            }
        };

        let response = self.send(envelope).await;
        info!(
            method = %method_label,
            path = %path_label,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request"
        );
        response
    }

    /// Stage 2: classification, buffering, parsing, host/IP derivation.
    async fn normalize<B>(
        &self,
        parts: &http::request::Parts,
        body: B,
        remote_ip: IpAddr,
    ) -> Result<Arc<ProcessedRequest>, Error>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
        B::Error: std::error::Error,
    {
        let method: Method = parts
            .method
            .as_str()
            .parse()
            .map_err(|_| Error::not_found())?;
        let headers = HeaderMultiMap::from_http(&parts.headers);
        let content_type = headers.first("content-type").map(str::to_owned);

        let bytes = match parser::classify(method, content_type.as_deref()) {
            parser::Strategy::Skip => Bytes::new(),
            _ => buffer_body(body, self.config.limits.max_total_file_bytes).await?,
        };
        let parsed = parser::parse(method, content_type.as_deref(), bytes, &self.config.limits)?;

        let request =
            ProcessedRequest::build(method, &parts.uri, headers, parsed, remote_ip, &self.config)
                .map(Arc::new)?;

        // Observation hooks are side-effect only; a failing plugin never
        // fails the request.
        for plugin in self.plugins.snapshot() {
            if let Err(err) = plugin.on_request_received(&request).await {
                error!(plugin = plugin.name(), "request-received hook failed: {err}");
            }
        }
        Ok(request)
    }

    /// Stages 4-8: middleware, route match, handler, format, pre-send.
    async fn dispatch(&self, request: Arc<ProcessedRequest>) -> Finished {
        let mut overrides = Overrides::default();

        for middleware in self.middleware_chain() {
            match middleware(request.clone()).await {
                None => {}
                Some(env) if matches!(env.kind(), EnvelopeKind::Modification) => {
                    overrides.absorb(env);
                }
                // An early response skips the rest of the chain, routing,
                // and the pre-send hooks.
                Some(env) => {
                    return Finished { envelope: self.format(env).await, overrides };
                }
            }
        }

        let Some((entry, params)) = self.router.lookup(request.method(), request.path()) else {
            let envelope =
                Envelope::from_error(&Error::not_found(), self.config.verbose_validation);
            return Finished { envelope, overrides };
        };

        let envelope = match entry
            .dispatch(&request, params, self.validator.as_ref(), &self.config)
            .await
        {
            Ok(envelope) => envelope,
            Err(err) => Envelope::from_error(&err, self.config.verbose_validation),
        };
        let envelope = self.format(envelope).await;

        for plugin in self.plugins.snapshot() {
            match plugin.on_before_response_sent(&request, &envelope).await {
                Ok(Some(replacement)) => {
                    return Finished { envelope: self.format(replacement).await, overrides };
                }
                Ok(None) => {}
                Err(err) => {
                    error!(plugin = plugin.name(), "pre-send hook failed: {err}");
                }
            }
        }

        Finished { envelope, overrides }
    }

    /// Stage 7: File envelopes resolve their path to bytes here, so the
    /// send stage only ever writes buffers and streams. A failed read
    /// degrades to Not-Found, never a crash.
    async fn format(&self, envelope: Envelope) -> Envelope {
        let EnvelopeKind::File(FileBody::Path(_)) = envelope.kind() else {
            return envelope;
        };
        let (kind, code, headers) = envelope.into_parts();
        let EnvelopeKind::File(FileBody::Path(path)) = kind else { unreachable!() };

        match tokio::fs::read(&path).await {
            Ok(bytes) => Envelope::from_parts(
                EnvelopeKind::File(FileBody::Resolved(bytes.into())),
                code,
                headers,
            ),
            Err(err) => {
                warn!(path = %path.display(), "file envelope read failed: {err}");
                Envelope::from_error(&Error::not_found(), false)
            }
        }
    }

    /// Stage 9: per-variant wire assembly, override merging, code-only
    /// statuses, server-side logging of 5xx exceptions.
    async fn send(&self, finished: Finished) -> http::Response<WireBody> {
        let Finished { envelope, overrides } = finished;
        let (kind, code, headers) = envelope.into_parts();
        let code = overrides.status.unwrap_or(code);
        let headers = overrides.merge_headers(headers);

        let (code, headers, payload) = match kind {
            EnvelopeKind::Stream(stream) => {
                let mut headers = headers;
                if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                    headers.push(("content-type".to_owned(), "application/octet-stream".to_owned()));
                }
                (code, headers, Payload::Stream(stream))
            }
            EnvelopeKind::Raw(raw) => {
                let bytes = match raw {
                    RawBody::Text(text) => Bytes::from(text),
                    RawBody::Buffer(bytes) => bytes,
                    RawBody::Json(value) => match serde_json::to_vec(&value) {
                        Ok(vec) => Bytes::from(vec),
                        Err(err) => {
                            error!("raw json serialization failed: {err}");
                            return assemble(500, Vec::new(), Payload::None);
                        }
                    },
                };
                (code, headers, Payload::Bytes(bytes))
            }
            EnvelopeKind::File(FileBody::Resolved(bytes)) => (code, headers, Payload::Bytes(bytes)),
            // Unresolved paths cannot reach here; format() rewrites them.
            EnvelopeKind::File(FileBody::Path(_)) => {
                (404, headers, Payload::None)
            }
            EnvelopeKind::Exception(exception) => {
                if code >= 500 {
                    error!(
                        name = %exception.name,
                        message = %exception.message,
                        "exception response"
                    );
                }
                let rendered = (self.template)(TemplateInput::Error {
                    name: exception.name,
                    message: exception.message,
                    code,
                    headers,
                });
                let Rendered { content, code, headers } = rendered;
                (code, headers, Payload::Bytes(content))
            }
            EnvelopeKind::Redirect => (code, headers, Payload::None),
            EnvelopeKind::Plain(content) => {
                let rendered = (self.template)(TemplateInput::Payload { content, code, headers });
                let Rendered { content, code, headers } = rendered;
                (code, headers, Payload::Bytes(content))
            }
            // Never meant to be sent on its own; an orphaned modification
            // carries its overrides and an empty body. Its code sentinel 0
            // means "no override", so an absent status falls back to 200.
            EnvelopeKind::Modification => {
                (if code == 0 { 200 } else { code }, headers, Payload::None)
            }
        };

        let payload = if self.config.code_only_statuses.contains(&code) {
            Payload::None
        } else {
            payload
        };
        assemble(code, headers, payload)
    }
}

// ── Support types ─────────────────────────────────────────────────────────────

/// A formatted envelope plus the overrides accumulated in front of it.
struct Finished {
    envelope: Envelope,
    overrides: Overrides,
}

impl Finished {
    fn plain(envelope: Envelope) -> Self {
        Self { envelope, overrides: Overrides::default() }
    }
}

/// Header/status overrides contributed by mid-pipeline modifications.
#[derive(Default)]
struct Overrides {
    status: Option<u16>,
    headers: Vec<(String, String)>,
}

impl Overrides {
    /// Folds one modification envelope in. Later modifications win on both
    /// status and header-name conflicts.
    fn absorb(&mut self, envelope: Envelope) {
        let (_, code, headers) = envelope.into_parts();
        if code != 0 {
            self.status = Some(code);
        }
        for (name, value) in headers {
            self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
            self.headers.push((name, value));
        }
    }

    /// Base headers with the overrides layered on top.
    fn merge_headers(&self, mut base: Vec<(String, String)>) -> Vec<(String, String)> {
        for (name, value) in &self.headers {
            base.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
            base.push((name.clone(), value.clone()));
        }
        base
    }
}

enum Payload {
    None,
    Bytes(Bytes),
    Stream(ByteStream),
}

/// The response for a pre-receipt abort: the plugin owns the exchange, so
/// nothing but a connection-close marker goes out.
fn abort_response() -> http::Response<WireBody> {
    assemble(200, vec![("connection".to_owned(), "close".to_owned())], Payload::None)
}

/// Buffers a transport body up to `cap` bytes, rejecting oversized bodies
/// before they are fully read.
///
/// A transport read error resolves to an empty body rather than failing
/// the request: downstream must see an interrupted body and an absent one
/// identically.
async fn buffer_body<B>(body: B, cap: usize) -> Result<Bytes, Error>
where
    B: hyper::body::Body + Send,
    B::Data: Send,
    B::Error: std::error::Error,
{
    let mut body = std::pin::pin!(body);
    let mut buffered = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!("body read failed: {err}");
                return Ok(Bytes::new());
            }
        };
        if let Ok(data) = frame.into_data() {
            if buffered.len() + data.remaining() > cap {
                return Err(Error::payload_too_large(format!(
                    "request body exceeds {cap} bytes"
                )));
            }
            buffered.put(data);
        }
    }
    Ok(buffered.freeze())
}

fn assemble(code: u16, headers: Vec<(String, String)>, payload: Payload) -> http::Response<WireBody> {
    let mut builder = http::Response::builder().status(code);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }

    let body: WireBody = match payload {
        Payload::None => Empty::new().map_err(io_never).boxed(),
        Payload::Bytes(bytes) => Full::new(bytes).map_err(io_never).boxed(),
        Payload::Stream(stream) => StreamBody::new(stream.map_ok(Frame::data)).boxed(),
    };

    builder.body(body).unwrap_or_else(|err| {
        error!("response assembly failed: {err}");
        http::Response::builder()
            .status(500)
            .body(Empty::new().map_err(io_never).boxed())
            .unwrap()
    })
}

fn io_never(never: std::convert::Infallible) -> std::io::Error {
    match never {}
}
