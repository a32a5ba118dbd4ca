//! Route registration, schema attachment, and dispatch-time behavior.
//!
//! A [`Router`] is a cheaply clonable handle over a shared [`RouteTable`].
//! Registration goes through *drafts*: [`Router::route`] snapshots the
//! router into a [`Route`] value, and every schema-attachment call clones
//! that value with one slot overlaid, so chained calls never mutate sibling
//! drafts:
//!
//! ```rust
//! use serde_json::json;
//! use viaduct::{object_schema, ClientRequest, Envelope, Router};
//!
//! async fn create(req: ClientRequest) -> Result<Envelope, viaduct::Error> {
//!     Envelope::plain(json!({ "userId": req.body().json()["id"] })).code(201)
//! }
//!
//! let router = Router::new();
//! let base = router.route();
//! base.body(object_schema(json!({ "id": { "type": "string", "min_length": 1 } })))
//!     .post("/items", create)?;
//! base.query(object_schema(json!({ "page": { "type": "string" } })))
//!     .get("/items", |req: ClientRequest| async move {
//!         Envelope::plain(json!({ "page": req.query("page") }))
//!     })?;
//! # Ok::<(), viaduct::Error>(())
//! ```
//!
//! `.body()` returns a [`PayloadRoute`], which has no `get`/`head` methods:
//! attaching a body schema to a GET route is a compile error, not a runtime
//! surprise.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};

use crate::config::Config;
use crate::error::{Error, Slot};
use crate::handler::{BoxFuture, BoxedHandler, Handler};
use crate::method::Method;
use crate::request::{ClientRequest, ProcessedRequest};
use crate::response::Envelope;
use crate::schema::{SchemaHandle, Validator};
use crate::table::{RouteTable, SharedTable};

// ── Registry entries ──────────────────────────────────────────────────────────

/// Everything the dispatcher needs for one `(method, path)`.
pub(crate) struct RouteEntry {
    handler: BoxedHandler,
    schemas: SchemaSet,
    modifiers: Vec<ErasedModifier>,
}

/// The four optional schema slots attached to a route.
#[derive(Clone, Default)]
struct SchemaSet {
    body: Option<SchemaHandle>,
    headers: Option<SchemaHandle>,
    query: Option<SchemaHandle>,
    params: Option<SchemaHandle>,
}

impl SchemaSet {
    /// Attached slots in the fixed validation order.
    fn slots(&self) -> [(Slot, Option<&SchemaHandle>); 4] {
        [
            (Slot::Body, self.body.as_ref()),
            (Slot::Headers, self.headers.as_ref()),
            (Slot::Query, self.query.as_ref()),
            (Slot::Params, self.params.as_ref()),
        ]
    }
}

type ErasedModifier =
    Arc<dyn Fn(ClientRequest) -> BoxFuture<Result<Map<String, Value>, Error>> + Send + Sync>;

/// Registry metadata for one route, exported for documentation tooling.
/// Never consulted on the hot path.
#[derive(Clone, Debug)]
pub struct RouteDescriptor {
    pub method: Method,
    pub path: String,
    /// Per-slot schema descriptions, as exported by the validator.
    pub flat_schema: Value,
    pub metadata: RouteMetadata,
}

/// Free-form documentation attached to a draft.
#[derive(Clone, Debug, Default)]
pub struct RouteMetadata {
    pub summary: Option<String>,
    pub description: Option<String>,
    pub deprecated: bool,
    pub example: Option<Value>,
    pub responses: Option<Value>,
    pub external_docs: Option<String>,
}

// ── Router ────────────────────────────────────────────────────────────────────

type Notifier = Arc<dyn Fn() + Send + Sync>;

/// The registration handle. Clones share one route tree.
#[derive(Clone)]
pub struct Router {
    table: SharedTable<Arc<RouteEntry>>,
    descriptors: Arc<RwLock<Vec<RouteDescriptor>>>,
    notifier: Arc<RwLock<Option<Notifier>>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            table: RouteTable::shared(),
            descriptors: Arc::new(RwLock::new(Vec::new())),
            notifier: Arc::new(RwLock::new(None)),
        }
    }

    /// Starts a draft with no schemas, modifiers, or metadata.
    pub fn route(&self) -> Route {
        Route {
            router: self.clone(),
            schemas: SchemaSet::default(),
            modifiers: Vec::new(),
            metadata: RouteMetadata::default(),
        }
    }

    /// Grafts `child` under `prefix`. The mount is live: routes registered
    /// on `child` afterwards are reachable here too, and mounts nest.
    pub fn mount(&self, prefix: &str, child: &Router) -> Result<(), Error> {
        if Arc::ptr_eq(&self.table, &child.table) {
            return Err(Error::Configuration(format!(
                "cannot mount a router into itself at {prefix}"
            )));
        }
        self.write_table().mount(prefix, child.table.clone())?;

        let prefix = prefix.trim_end_matches('/');
        let nested: Vec<RouteDescriptor> = child
            .read_descriptors()
            .iter()
            .map(|d| RouteDescriptor {
                path: format!("{prefix}{}", d.path),
                ..d.clone()
            })
            .collect();
        self.write_descriptors().extend(nested);
        self.notify();
        Ok(())
    }

    /// A snapshot of every registered route's metadata.
    ///
    /// Descriptors for mounted routers cover their contents at mount time;
    /// live lookup always reflects the current tree.
    pub fn descriptors(&self) -> Vec<RouteDescriptor> {
        self.read_descriptors().clone()
    }

    /// Every registered `(method, pattern)` pair, mounts included.
    pub fn patterns(&self) -> Vec<(Method, String)> {
        self.read_table().patterns()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.read_table().is_empty()
    }

    pub(crate) fn lookup(
        &self,
        method: Method,
        path: &str,
    ) -> Option<(Arc<RouteEntry>, HashMap<String, String>)> {
        let (entry, params) = self.read_table().lookup(method, path)?;
        Some((entry, params.into_iter().collect()))
    }

    /// Called after every registration. The pipeline uses this to fan out
    /// plugin registry-update notifications.
    pub(crate) fn on_update(&self, notifier: Notifier) {
        *self.notifier.write().unwrap_or_else(|e| e.into_inner()) = Some(notifier);
    }

    fn notify(&self) {
        let guard = self.notifier.read().unwrap_or_else(|e| e.into_inner());
        if let Some(notifier) = guard.as_ref() {
            notifier();
        }
    }

    fn read_table(&self) -> std::sync::RwLockReadGuard<'_, RouteTable<Arc<RouteEntry>>> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_table(&self) -> std::sync::RwLockWriteGuard<'_, RouteTable<Arc<RouteEntry>>> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_descriptors(&self) -> std::sync::RwLockReadGuard<'_, Vec<RouteDescriptor>> {
        self.descriptors.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_descriptors(&self) -> std::sync::RwLockWriteGuard<'_, Vec<RouteDescriptor>> {
        self.descriptors.write().unwrap_or_else(|e| e.into_inner())
    }

    fn register(
        &self,
        method: Method,
        path: &str,
        handler: BoxedHandler,
        schemas: SchemaSet,
        modifiers: Vec<ErasedModifier>,
        metadata: RouteMetadata,
    ) -> Result<(), Error> {
        let flat_schema = flatten_schemas(&schemas);
        let entry = Arc::new(RouteEntry { handler, schemas, modifiers });
        self.write_table().register(method, path, entry)?;
        self.write_descriptors().push(RouteDescriptor {
            method,
            path: path.to_owned(),
            flat_schema,
            metadata,
        });
        self.notify();
        Ok(())
    }
}

/// Descriptor export uses the raw field maps so it never needs a validator
/// reference at registration time.
fn flatten_schemas(schemas: &SchemaSet) -> Value {
    let mut flat = Map::new();
    for (slot, handle) in schemas.slots() {
        if let Some(handle) = handle {
            flat.insert(
                slot.as_str().to_owned(),
                Value::Object(handle.fields().clone()),
            );
        }
    }
    Value::Object(flat)
}

// ── Drafts ────────────────────────────────────────────────────────────────────

macro_rules! schema_slot {
    ($(#[$doc:meta])* $name:ident -> $out:ident) => {
        $(#[$doc])*
        pub fn $name(&self, schema: SchemaHandle) -> $out {
            let mut draft = self.clone();
            draft.schemas.$name = Some(schema);
            $out::from(draft)
        }
    };
}

macro_rules! verbs {
    ($($(#[$doc:meta])* $name:ident => $method:ident),+ $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $name<H: Handler>(&self, path: &str, handler: H) -> Result<(), Error> {
                self.register(Method::$method, path, handler)
            }
        )+
    };
}

/// A value-typed route draft. Cloning is cheap; schema calls overlay one
/// slot on a fresh copy.
#[derive(Clone)]
pub struct Route {
    router: Router,
    schemas: SchemaSet,
    modifiers: Vec<ErasedModifier>,
    metadata: RouteMetadata,
}

impl Route {
    schema_slot! {
        /// Attaches a body schema. The resulting draft carries no `get` or
        /// `head` methods.
        body -> PayloadRoute
    }
    schema_slot!(headers -> Route);
    schema_slot!(query -> Route);
    schema_slot! {
        /// Attaches a path-parameter schema. Purely additive; params are
        /// meaningful on every verb.
        params -> Route
    }

    /// Binds a modifier, run after validation and before the handler.
    /// Modifiers run in registration order and their returned fields are
    /// merged into the request, later keys winning.
    pub fn modify<F, Fut>(&self, modifier: F) -> Route
    where
        F: Fn(ClientRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Map<String, Value>, Error>> + Send + 'static,
    {
        let mut draft = self.clone();
        draft
            .modifiers
            .push(Arc::new(move |req| Box::pin(modifier(req))));
        draft
    }

    /// Replaces the draft's documentation metadata.
    pub fn metadata(&self, metadata: RouteMetadata) -> Route {
        let mut draft = self.clone();
        draft.metadata = metadata;
        draft
    }

    verbs! {
        get     => Get,
        head    => Head,
        post    => Post,
        put     => Put,
        patch   => Patch,
        delete  => Delete,
        options => Options,
        trace   => Trace,
        connect => Connect,
    }

    fn register<H: Handler>(&self, method: Method, path: &str, handler: H) -> Result<(), Error> {
        self.router.register(
            method,
            path,
            handler.into_boxed_handler(),
            self.schemas.clone(),
            self.modifiers.clone(),
            self.metadata.clone(),
        )
    }
}

impl From<Route> for PayloadRoute {
    fn from(draft: Route) -> Self {
        Self { draft }
    }
}

/// A draft carrying a body schema. Identical to [`Route`] except that the
/// verbs without body semantics, `get` and `head`, are absent.
#[derive(Clone)]
pub struct PayloadRoute {
    draft: Route,
}

impl PayloadRoute {
    pub fn headers(&self, schema: SchemaHandle) -> PayloadRoute {
        self.draft.headers(schema).into()
    }

    pub fn query(&self, schema: SchemaHandle) -> PayloadRoute {
        self.draft.query(schema).into()
    }

    pub fn params(&self, schema: SchemaHandle) -> PayloadRoute {
        self.draft.params(schema).into()
    }

    pub fn modify<F, Fut>(&self, modifier: F) -> PayloadRoute
    where
        F: Fn(ClientRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Map<String, Value>, Error>> + Send + 'static,
    {
        self.draft.modify(modifier).into()
    }

    pub fn metadata(&self, metadata: RouteMetadata) -> PayloadRoute {
        self.draft.metadata(metadata).into()
    }

    verbs! {
        post    => Post,
        put     => Put,
        patch   => Patch,
        delete  => Delete,
        options => Options,
        trace   => Trace,
        connect => Connect,
    }

    fn register<H: Handler>(&self, method: Method, path: &str, handler: H) -> Result<(), Error> {
        self.draft.register(method, path, handler)
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

impl RouteEntry {
    /// Validation, modifiers, handler, in that order. Validation and
    /// modifier failures surface as `Err`; handler errors are already
    /// folded into the envelope by `IntoEnvelope`.
    pub(crate) async fn dispatch(
        &self,
        request: &Arc<ProcessedRequest>,
        params: HashMap<String, String>,
        validator: &dyn Validator,
        config: &Config,
    ) -> Result<Envelope, Error> {
        let mut client = request.client_request(params);

        if !config.disable_validation {
            self.validate(&client, validator)?;
        }

        for modifier in &self.modifiers {
            let fields = modifier(client.clone()).await?;
            client.merge_fields(fields);
        }

        Ok(self.handler.call(client).await)
    }

    fn validate(&self, client: &ClientRequest, validator: &dyn Validator) -> Result<(), Error> {
        for (slot, handle) in self.schemas.slots() {
            let Some(handle) = handle else { continue };
            let value = match slot {
                Slot::Body => client.body().json().clone(),
                Slot::Headers => client.headers().to_json(),
                Slot::Query => client.request().query_json(),
                Slot::Params => client.params_json(),
            };
            if !value.is_object() {
                return Err(Error::Validation {
                    slot,
                    messages: vec![format!("expected an object for {slot}")],
                });
            }
            let messages = validator.validate(handle, &value);
            if !messages.is_empty() {
                return Err(Error::Validation { slot, messages });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyView;
    use crate::headers::HeaderMultiMap;
    use crate::parser::ParsedBody;
    use crate::schema::{object_schema, FieldValidator};
    use serde_json::json;

    fn request(method: Method, path: &str, body: &str) -> Arc<ProcessedRequest> {
        let uri: http::Uri = format!("http://localhost{path}").parse().unwrap();
        let parsed = ParsedBody {
            body: BodyView::from_bytes(
                body.as_bytes().to_vec().into(),
                Some("application/json".to_owned()),
            ),
            files: Vec::new(),
        };
        let built = ProcessedRequest::build(
            method,
            &uri,
            HeaderMultiMap::new(),
            parsed,
            "127.0.0.1".parse().unwrap(),
            &Config::default(),
        );
        Arc::new(built.unwrap())
    }

    async fn echo(req: ClientRequest) -> Envelope {
        Envelope::plain(json!({
            "id": req.param("id"),
            "fields": Value::Object(req.fields().clone()),
        }))
    }

    fn id_schema() -> crate::schema::SchemaHandle {
        object_schema(json!({ "id": { "type": "string", "min_length": 1 } }))
    }

    #[tokio::test]
    async fn lookup_and_dispatch_reach_the_handler() {
        let router = Router::new();
        router.route().get("/users/:id", echo).unwrap();

        let (entry, params) = router.lookup(Method::Get, "/users/7").unwrap();
        let req = request(Method::Get, "/users/7", "");
        let envelope = entry
            .dispatch(&req, params, &FieldValidator, &Config::default())
            .await
            .unwrap();
        assert_eq!(envelope.status(), 200);
    }

    #[tokio::test]
    async fn invalid_body_never_reaches_the_handler() {
        let router = Router::new();
        router
            .route()
            .body(id_schema())
            .post("/items", |_req: ClientRequest| async move {
                panic!("handler must not run");
                #[allow(unreachable_code)]
                Envelope::plain("")
            })
            .unwrap();

        let (entry, params) = router.lookup(Method::Post, "/items").unwrap();
        let req = request(Method::Post, "/items", r#"{"id":""}"#);
        let err = entry
            .dispatch(&req, params, &FieldValidator, &Config::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { slot: Slot::Body, .. }));
        assert_eq!(err.client_message(false), "invalid body");
        assert_eq!(err.client_message(true), "id must be at least 1 characters");
    }

    #[tokio::test]
    async fn disable_validation_skips_schemas() {
        let router = Router::new();
        router
            .route()
            .body(id_schema())
            .post("/items", echo)
            .unwrap();

        let config = Config { disable_validation: true, ..Config::default() };
        let (entry, params) = router.lookup(Method::Post, "/items").unwrap();
        let req = request(Method::Post, "/items", r#"{"id":""}"#);
        assert!(entry
            .dispatch(&req, params, &FieldValidator, &config)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn modifiers_run_in_order_and_later_keys_win() {
        let router = Router::new();
        router
            .route()
            .modify(|_req| async move {
                Ok(Map::from_iter([
                    ("who".to_owned(), json!("first")),
                    ("a".to_owned(), json!(1)),
                ]))
            })
            .modify(|_req| async move {
                Ok(Map::from_iter([("who".to_owned(), json!("second"))]))
            })
            .get("/who", |req: ClientRequest| async move {
                Envelope::plain(Value::Object(req.fields().clone()))
            })
            .unwrap();

        let (entry, params) = router.lookup(Method::Get, "/who").unwrap();
        let req = request(Method::Get, "/who", "");
        let envelope = entry
            .dispatch(&req, params, &FieldValidator, &Config::default())
            .await
            .unwrap();
        match envelope.kind() {
            crate::response::EnvelopeKind::Plain(crate::response::PlainBody::Json(v)) => {
                assert_eq!(v["who"], "second");
                assert_eq!(v["a"], 1);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[tokio::test]
    async fn modifier_errors_abort_dispatch() {
        let router = Router::new();
        router
            .route()
            .modify(|_req| async move { Err(Error::handler("AuthModifier", "no token")) })
            .get("/secure", echo)
            .unwrap();

        let (entry, params) = router.lookup(Method::Get, "/secure").unwrap();
        let req = request(Method::Get, "/secure", "");
        let err = entry
            .dispatch(&req, params, &FieldValidator, &Config::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handler { .. }));
    }

    #[test]
    fn drafts_do_not_leak_schemas_onto_siblings() {
        let router = Router::new();
        let base = router.route();
        base.body(id_schema()).post("/items", echo).unwrap();
        base.query(object_schema(json!({ "page": {} })))
            .get("/items", echo)
            .unwrap();

        let descriptors = router.descriptors();
        let post = descriptors.iter().find(|d| d.method == Method::Post).unwrap();
        let get = descriptors.iter().find(|d| d.method == Method::Get).unwrap();
        assert!(post.flat_schema.get("body").is_some());
        assert!(post.flat_schema.get("query").is_none());
        assert!(get.flat_schema.get("query").is_some());
        assert!(get.flat_schema.get("body").is_none());
    }

    #[test]
    fn duplicate_route_registration_fails() {
        let router = Router::new();
        router.route().get("/a", echo).unwrap();
        assert!(router.route().get("/a", echo).is_err());
    }

    #[test]
    fn mounted_router_stays_live() {
        let api = Router::new();
        let root = Router::new();
        root.mount("/api", &api).unwrap();
        api.route().get("/late/:id", echo).unwrap();

        let (_, params) = root.lookup(Method::Get, "/api/late/9").unwrap();
        assert_eq!(params["id"], "9");
    }

    #[test]
    fn self_mount_is_rejected() {
        let router = Router::new();
        assert!(router.mount("/loop", &router).is_err());
        assert!(router.mount("/loop", &router.clone()).is_err());
    }

    #[test]
    fn descriptors_carry_metadata_and_prefixes() {
        let child = Router::new();
        child
            .route()
            .metadata(RouteMetadata {
                summary: Some("list items".to_owned()),
                deprecated: true,
                ..RouteMetadata::default()
            })
            .get("/items", echo)
            .unwrap();

        let root = Router::new();
        root.mount("/v1", &child).unwrap();

        let descriptors = root.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].path, "/v1/items");
        assert_eq!(descriptors[0].metadata.summary.as_deref(), Some("list items"));
        assert!(descriptors[0].metadata.deprecated);
    }
}
