//! The normalized request descriptors.
//!
//! [`ProcessedRequest`] is built once per inbound connection and never
//! mutated afterwards: middleware, validators, modifiers, and the handler
//! all read the same immutable descriptor. Per-dispatch data (path
//! parameters and modifier-injected fields) lives on the derived
//! [`ClientRequest`] view, which shares the descriptor through an `Arc`
//! without touching it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::body::{BodyView, FileView};
use crate::config::Config;
use crate::error::Error;
use crate::headers::HeaderMultiMap;
use crate::method::Method;
use crate::parser::ParsedBody;

/// Where the request came from, after proxy-header derivation.
#[derive(Clone, Debug)]
pub struct RemoteAddress {
    /// The client IP: the nearest trusted forwarded hop, or the socket peer.
    pub ip: String,
    /// The full forwarding chain, client first.
    pub ips: Vec<String>,
}

/// An immutable, normalized inbound request.
#[derive(Debug)]
pub struct ProcessedRequest {
    method: Method,
    protocol: String,
    host: String,
    path: String,
    headers: HeaderMultiMap,
    query: Vec<(String, String)>,
    body: BodyView,
    files: Vec<FileView>,
    remote: RemoteAddress,
}

impl ProcessedRequest {
    /// Normalizes one transport-level request.
    ///
    /// Fails only for a rejected host (when `allowed_hosts` is configured);
    /// the pipeline renders that as Not-Found.
    pub(crate) fn build(
        method: Method,
        uri: &http::Uri,
        headers: HeaderMultiMap,
        parsed: ParsedBody,
        socket_ip: IpAddr,
        config: &Config,
    ) -> Result<Self, Error> {
        let forwarded = config.trust_proxy.then(|| Forwarded::parse(&headers));

        let host = forwarded
            .as_ref()
            .and_then(|f| f.host.clone())
            .or_else(|| headers.first("host").map(str::to_owned))
            .or_else(|| uri.host().map(str::to_owned))
            .unwrap_or_default();

        if let Some(allowed) = &config.allowed_hosts {
            // Compare without any :port suffix.
            let bare = host.split(':').next().unwrap_or(&host);
            if !allowed.iter().any(|a| a == bare) {
                return Err(Error::not_found());
            }
        }

        let protocol = forwarded
            .as_ref()
            .and_then(|f| f.proto.clone())
            .unwrap_or_else(|| "http".to_owned());

        let socket = normalize_ip(&socket_ip.to_string());
        let chain: Vec<String> = forwarded.map(|f| f.chain).unwrap_or_default();
        let remote = if chain.is_empty() {
            RemoteAddress { ip: socket.clone(), ips: vec![socket] }
        } else {
            RemoteAddress { ip: chain[0].clone(), ips: chain }
        };

        Ok(Self {
            method,
            protocol,
            host,
            path: uri.path().to_owned(),
            headers,
            query: parse_query(uri.query().unwrap_or_default()),
            body: parsed.body,
            files: parsed.files,
            remote,
        })
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMultiMap {
        &self.headers
    }

    /// First value of a query parameter.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a repeated query parameter, in order.
    pub fn query_all(&self, name: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// The query as a JSON object of first values, for validation.
    pub fn query_json(&self) -> Value {
        let mut obj = Map::new();
        for (k, v) in &self.query {
            obj.entry(k.clone()).or_insert_with(|| Value::String(v.clone()));
        }
        Value::Object(obj)
    }

    pub fn body(&self) -> &BodyView {
        &self.body
    }

    pub fn files(&self) -> &[FileView] {
        &self.files
    }

    pub fn remote(&self) -> &RemoteAddress {
        &self.remote
    }

    /// Derives the per-dispatch view carrying path parameters, leaving the
    /// descriptor untouched.
    pub fn client_request(self: &Arc<Self>, params: HashMap<String, String>) -> ClientRequest {
        ClientRequest { inner: Arc::clone(self), params, fields: Map::new() }
    }
}

// ── ClientRequest ─────────────────────────────────────────────────────────────

/// The per-dispatch view handed to modifiers and handlers: the shared
/// descriptor plus path parameters and modifier-injected fields.
#[derive(Clone, Debug)]
pub struct ClientRequest {
    inner: Arc<ProcessedRequest>,
    params: HashMap<String, String>,
    fields: Map<String, Value>,
}

impl ClientRequest {
    /// The underlying immutable descriptor.
    pub fn request(&self) -> &ProcessedRequest {
        &self.inner
    }

    pub fn method(&self) -> Method {
        self.inner.method()
    }

    pub fn path(&self) -> &str {
        self.inner.path()
    }

    pub fn headers(&self) -> &HeaderMultiMap {
        self.inner.headers()
    }

    pub fn body(&self) -> &BodyView {
        self.inner.body()
    }

    pub fn files(&self) -> &[FileView] {
        self.inner.files()
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.inner.query(name)
    }

    pub fn remote(&self) -> &RemoteAddress {
        self.inner.remote()
    }

    /// A named path parameter.
    ///
    /// For a route `/users/:id`, `req.param("id")` on `/users/42` returns
    /// `Some("42")`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// The params as a JSON object, for validation.
    pub fn params_json(&self) -> Value {
        Value::Object(
            self.params
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        )
    }

    /// A field contributed by a route modifier.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Merges a modifier's partial payload; later keys win on conflict.
    pub(crate) fn merge_fields(&mut self, payload: Map<String, Value>) {
        for (k, v) in payload {
            self.fields.insert(k, v);
        }
    }
}

// ── Forwarded-header derivation ───────────────────────────────────────────────

/// Host/IP/proto derived from proxy headers. Only consulted when
/// proxy-trust is enabled.
struct Forwarded {
    host: Option<String>,
    proto: Option<String>,
    chain: Vec<String>,
}

impl Forwarded {
    /// `Forwarded` first, then the de-facto `X-Forwarded-*` family, then
    /// single-hop headers.
    fn parse(headers: &HeaderMultiMap) -> Self {
        let mut host = None;
        let mut proto = None;
        let mut chain = Vec::new();

        if let Some(raw) = headers.first("forwarded") {
            for element in raw.split(',') {
                for pair in element.split(';') {
                    let Some((k, v)) = pair.split_once('=') else { continue };
                    let v = v.trim().trim_matches('"');
                    match k.trim().to_ascii_lowercase().as_str() {
                        "for" => chain.push(normalize_ip(v)),
                        "host" if host.is_none() => host = Some(v.to_owned()),
                        "proto" if proto.is_none() => proto = Some(v.to_owned()),
                        _ => {}
                    }
                }
            }
        }

        if host.is_none() {
            host = headers.first("x-forwarded-host").map(str::to_owned);
        }
        if proto.is_none() {
            proto = headers.first("x-forwarded-proto").map(str::to_owned);
        }
        if chain.is_empty() {
            if let Some(raw) = headers.first("x-forwarded-for") {
                chain = raw.split(',').map(|ip| normalize_ip(ip.trim())).collect();
            }
        }
        if chain.is_empty() {
            for name in ["x-real-ip", "cf-connecting-ip"] {
                if let Some(ip) = headers.first(name) {
                    chain = vec![normalize_ip(ip)];
                    break;
                }
            }
        }

        Self { host, proto, chain }
    }
}

/// Strips the IPv4-mapped IPv6 prefix (`::ffff:127.0.0.1` → `127.0.0.1`).
fn normalize_ip(ip: &str) -> String {
    ip.strip_prefix("::ffff:").unwrap_or(ip).to_owned()
}

fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let k = urlencoding::decode(k).map(|c| c.into_owned()).unwrap_or_else(|_| k.to_owned());
            let v = v.replace('+', " ");
            let v = urlencoding::decode(&v).map(|c| c.into_owned()).unwrap_or(v);
            (k, v)
        })
        .collect()
}
