//! End-to-end lifecycle tests: a full pipeline driven with in-memory
//! requests, no sockets.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde_json::{json, Value};
use viaduct::{
    async_trait, object_schema, ClientRequest, Config, Envelope, Error, Pipeline, Plugin,
    ProcessedRequest, WireBody,
};

const LOCAL: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

fn get(path: &str) -> http::Request<Full<Bytes>> {
    http::Request::builder()
        .method("GET")
        .uri(format!("http://localhost{path}"))
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn post_json(path: &str, body: Value) -> http::Request<Full<Bytes>> {
    http::Request::builder()
        .method("POST")
        .uri(format!("http://localhost{path}"))
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(serde_json::to_vec(&body).unwrap())))
        .unwrap()
}

async fn read_json(response: http::Response<WireBody>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

fn items_pipeline() -> Pipeline {
    let pipeline = Pipeline::new(Config::default());
    pipeline
        .router()
        .route()
        .body(object_schema(json!({ "id": { "type": "string", "min_length": 1 } })))
        .post("/items", |req: ClientRequest| async move {
            Envelope::plain(json!({ "userId": req.request().body().json()["id"] })).code(201)
        })
        .unwrap();
    pipeline
}

#[tokio::test]
async fn valid_post_reaches_handler_and_is_templated() {
    let pipeline = items_pipeline();
    let response = pipeline
        .handle(post_json("/items", json!({ "id": "abc" })), LOCAL)
        .await;
    assert_eq!(response.status(), 201);
    assert_eq!(
        read_json(response).await,
        json!({ "error": null, "content": { "userId": "abc" } })
    );
}

#[tokio::test]
async fn invalid_body_is_rejected_with_a_generic_message() {
    let pipeline = items_pipeline();
    let response = pipeline
        .handle(post_json("/items", json!({ "id": "" })), LOCAL)
        .await;
    assert_eq!(response.status(), 400);
    let body = read_json(response).await;
    assert_eq!(body["error"], "ValidationError");
    assert_eq!(body["content"], "invalid body");
}

#[tokio::test]
async fn verbose_validation_reports_field_messages() {
    let config = Config { verbose_validation: true, ..Config::default() };
    let pipeline = Pipeline::new(config);
    pipeline
        .router()
        .route()
        .body(object_schema(json!({ "id": { "type": "string", "min_length": 1 } })))
        .post("/items", |_req: ClientRequest| async move { Envelope::plain("unreachable") })
        .unwrap();

    let response = pipeline
        .handle(post_json("/items", json!({ "id": "" })), LOCAL)
        .await;
    let body = read_json(response).await;
    assert_eq!(body["content"], "id must be at least 1 characters");
}

#[tokio::test]
async fn unknown_path_is_a_templated_not_found() {
    let pipeline = Pipeline::new(Config::default());
    let response = pipeline.handle(get("/nowhere"), LOCAL).await;
    assert_eq!(response.status(), 404);
    assert_eq!(read_json(response).await["error"], "ClientInputError");
}

/// Collects formatted log output so a test can assert on emitted records.
#[derive(Clone, Default)]
struct LogCapture(Arc<std::sync::Mutex<Vec<u8>>>);

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[tokio::test]
async fn not_found_still_emits_an_access_record() {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(capture.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let pipeline = Pipeline::new(Config::default());
    let response = pipeline.handle(get("/nowhere"), LOCAL).await;
    assert_eq!(response.status(), 404);

    let logs = capture.contents();
    assert!(logs.contains("method=GET"), "missing method field: {logs}");
    assert!(logs.contains("path=/nowhere"), "missing path field: {logs}");
    assert!(logs.contains("status=404"), "missing status field: {logs}");
    assert!(logs.contains("elapsed_ms="), "missing elapsed field: {logs}");
}

#[tokio::test]
async fn path_params_flow_into_the_handler() {
    let pipeline = Pipeline::new(Config::default());
    pipeline
        .router()
        .route()
        .get("/users/:id/posts/:post", |req: ClientRequest| async move {
            Envelope::plain(json!({
                "id": req.param("id"),
                "post": req.param("post"),
            }))
        })
        .unwrap();

    let response = pipeline.handle(get("/users/alice/posts/42"), LOCAL).await;
    let body = read_json(response).await;
    assert_eq!(body["content"], json!({ "id": "alice", "post": "42" }));
}

#[tokio::test]
async fn urlencoded_bodies_are_buffered_and_decoded_lazily() {
    let pipeline = Pipeline::new(Config::default());
    pipeline
        .router()
        .route()
        .post("/form", |req: ClientRequest| async move {
            let name = req
                .request()
                .body()
                .url_params()
                .get("name")
                .cloned()
                .unwrap_or_default();
            Envelope::plain(json!({ "name": name }))
        })
        .unwrap();

    let request = http::Request::builder()
        .method("POST")
        .uri("http://localhost/form")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Full::new(Bytes::from_static(b"name=ada+lovelace")))
        .unwrap();
    let body = read_json(pipeline.handle(request, LOCAL).await).await;
    assert_eq!(body["content"]["name"], "ada lovelace");
}

#[tokio::test]
async fn binary_body_becomes_a_synthetic_file() {
    let pipeline = Pipeline::new(Config::default());
    pipeline
        .router()
        .route()
        .post("/upload", |req: ClientRequest| async move {
            let file = &req.files()[0];
            Envelope::plain(json!({
                "mime": file.mime_type,
                "len": file.bytes.len(),
                "body_is_null": req.body().json().is_null(),
            }))
        })
        .unwrap();

    let request = http::Request::builder()
        .method("POST")
        .uri("http://localhost/upload")
        .header("content-type", "application/pdf")
        .body(Full::new(Bytes::from_static(b"%PDF-1.7 ...")))
        .unwrap();
    let body = read_json(pipeline.handle(request, LOCAL).await).await;
    assert_eq!(body["content"]["mime"], "application/pdf");
    assert_eq!(body["content"]["len"], 12);
    assert_eq!(body["content"]["body_is_null"], true);
}

// ── Plugins ───────────────────────────────────────────────────────────────────

struct Gate {
    open: AtomicBool,
    seen: AtomicUsize,
}

#[async_trait]
impl Plugin for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    async fn on_before_request_received(
        &self,
        _head: &http::request::Parts,
    ) -> Result<bool, Error> {
        Ok(self.open.load(Ordering::SeqCst))
    }

    async fn on_request_received(&self, _req: &ProcessedRequest) -> Result<(), Error> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn pre_receipt_abort_suppresses_the_pipeline() {
    let pipeline = Pipeline::new(Config::default());
    let gate = Arc::new(Gate { open: AtomicBool::new(false), seen: AtomicUsize::new(0) });
    pipeline.add_plugin(gate.clone()).unwrap();
    pipeline
        .router()
        .route()
        .get("/x", |_req: ClientRequest| async move { Envelope::plain("ok") })
        .unwrap();

    let response = pipeline.handle(get("/x"), LOCAL).await;
    assert_eq!(response.headers()["connection"], "close");
    assert_eq!(gate.seen.load(Ordering::SeqCst), 0);

    gate.open.store(true, Ordering::SeqCst);
    let response = pipeline.handle(get("/x"), LOCAL).await;
    assert_eq!(response.status(), 200);
    assert_eq!(gate.seen.load(Ordering::SeqCst), 1);
}

struct Replacer;

#[async_trait]
impl Plugin for Replacer {
    fn name(&self) -> &str {
        "replacer"
    }

    async fn on_before_response_sent(
        &self,
        _req: &ProcessedRequest,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, Error> {
        if envelope.status() == 500 {
            return Ok(Some(Envelope::raw_text("shielded").code(502)?));
        }
        Ok(None)
    }
}

#[tokio::test]
async fn pre_send_hook_can_replace_the_response() {
    let pipeline = Pipeline::new(Config::default());
    pipeline.add_plugin(Arc::new(Replacer)).unwrap();
    pipeline
        .router()
        .route()
        .get("/boom", |_req: ClientRequest| async move {
            Err::<Envelope, _>(Error::handler("Boom", "it broke"))
        })
        .unwrap();

    let response = pipeline.handle(get("/boom"), LOCAL).await;
    assert_eq!(response.status(), 502);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"shielded");
}

#[tokio::test]
async fn duplicate_plugin_names_fail_registration() {
    let pipeline = Pipeline::new(Config::default());
    pipeline.add_plugin(Arc::new(Replacer)).unwrap();
    assert!(matches!(
        pipeline.add_plugin(Arc::new(Replacer)),
        Err(Error::Configuration(_))
    ));
}

// ── Middleware ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn removed_middleware_no_longer_runs() {
    let pipeline = Pipeline::new(Config::default());
    pipeline
        .router()
        .route()
        .get("/x", |_req: ClientRequest| async move { Envelope::plain("through") })
        .unwrap();
    let handle =
        pipeline.add_middleware(|_req| async move { Some(Envelope::raw_text("blocked")) });

    let response = pipeline.handle(get("/x"), LOCAL).await;
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"blocked");

    assert!(pipeline.remove_middleware(handle));
    let response = pipeline.handle(get("/x"), LOCAL).await;
    assert_eq!(read_json(response).await["content"], "through");
}

#[tokio::test]
async fn multipart_fields_and_files_reach_the_handler() {
    let pipeline = Pipeline::new(Config::default());
    pipeline
        .router()
        .route()
        .post("/upload", |req: ClientRequest| async move {
            Envelope::plain(json!({
                "caption": req.body().json()["caption"],
                "file": req.files()[0].original_name,
            }))
        })
        .unwrap();

    let boundary = "oak";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"caption\"\r\n\r\n\
         holiday\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"photo\"; filename=\"beach.png\"\r\n\
         Content-Type: image/png\r\n\r\n\
         PNGDATA\r\n\
         --{boundary}--\r\n"
    );
    let request = http::Request::builder()
        .method("POST")
        .uri("http://localhost/upload")
        .header("content-type", format!("multipart/form-data; boundary={boundary}"))
        .body(Full::new(Bytes::from(body)))
        .unwrap();

    let body = read_json(pipeline.handle(request, LOCAL).await).await;
    assert_eq!(body["content"]["caption"], "holiday");
    assert_eq!(body["content"]["file"], "beach.png");
}
