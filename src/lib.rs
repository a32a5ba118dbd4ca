//! # viaduct
//!
//! A request-dispatch HTTP framework: typed routing with schema validation,
//! a middleware chain, and a plugin hook surface, wrapped around hyper.
//!
//! ## The shape of a request
//!
//! ```text
//! plugin pre-hooks → body classification → middleware → route match
//!   → schema validation → modifiers → handler → response template → wire
//! ```
//!
//! Every stage is pluggable at its seam: validation behind [`Validator`],
//! the wire shape behind a [`template`](crate::template) function, the
//! cross-cutting hooks behind [`Plugin`]. Nothing escapes the pipeline
//! uncaught: a panicking dependency or a missing file becomes a templated
//! error response, never a dead process.
//!
//! What viaduct intentionally leaves to the proxy in front of it:
//!
//! - **TLS termination**: nginx SSL / k8s ingress
//! - **Rate limiting**: `limit_req` / ingress-nginx annotations
//! - **Slow-client protection**: proxy timeout and buffer settings
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use viaduct::{object_schema, ClientRequest, Config, Envelope, Pipeline, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = Pipeline::new(Config::default());
//!     let router = app.router();
//!
//!     router.route().get("/users/:id", get_user).unwrap();
//!     router
//!         .route()
//!         .body(object_schema(json!({ "name": { "type": "string", "min_length": 1 } })))
//!         .post("/users", create_user)
//!         .unwrap();
//!
//!     Server::bind("0.0.0.0:3000").serve(app).await.unwrap();
//! }
//!
//! async fn get_user(req: ClientRequest) -> Envelope {
//!     Envelope::plain(json!({ "id": req.param("id") }))
//! }
//!
//! async fn create_user(req: ClientRequest) -> Result<Envelope, viaduct::Error> {
//!     // the body already passed the schema above
//!     let name = req.body().json()["name"].clone();
//!     Envelope::plain(json!({ "created": name })).code(201)
//! }
//! ```

mod body;
mod config;
mod error;
mod handler;
mod headers;
mod method;
mod middleware;
mod parser;
mod pipeline;
mod plugin;
mod request;
mod response;
mod router;
mod schema;
mod server;
mod table;

pub mod health;
pub mod template;

// Re-exported so `#[viaduct::async_trait]` works on Plugin impls without a
// direct async-trait dependency.
pub use async_trait::async_trait;

pub use body::{BodyView, FileView};
pub use config::Config;
pub use error::{Error, Slot};
pub use handler::Handler;
pub use headers::HeaderMultiMap;
pub use method::Method;
pub use middleware::MiddlewareHandle;
pub use parser::{ParseLimits, Strategy};
pub use pipeline::{Pipeline, WireBody};
pub use plugin::Plugin;
pub use request::{ClientRequest, ProcessedRequest, RemoteAddress};
pub use response::{
    ByteStream, Envelope, EnvelopeKind, Exception, FileBody, IntoEnvelope, PlainBody, RawBody,
};
pub use router::{PayloadRoute, Route, RouteDescriptor, RouteMetadata, Router};
pub use schema::{object_schema, FieldValidator, SchemaHandle, Validator};
pub use server::Server;
