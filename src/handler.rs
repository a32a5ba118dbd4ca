//! Handler trait and type erasure.
//!
//! The route table needs to hold handlers of *different* concrete types in
//! one tree, so handlers are stored as trait objects behind a common
//! interface. The chain from user code to vtable call is:
//!
//! ```text
//! async fn create(req: ClientRequest) -> Result<Envelope, Error> { … }
//!        ↓ route.post("/items", create)
//! create.into_boxed_handler()                  ← Handler blanket impl
//!        ↓ Arc::new(FnHandler(create))         ← heap-allocated wrapper
//! handler.call(req)  at dispatch time          ← one vtable dispatch
//!        ↓ Box::pin(async { create(req).await.into_envelope() })
//! ```
//!
//! The per-request cost is one Arc clone plus one virtual call.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::request::ClientRequest;
use crate::response::{Envelope, IntoEnvelope};

// ── Internal types ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future resolving to an [`Envelope`].
pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: ClientRequest) -> BoxFuture<Envelope>;
}

/// A heap-allocated, type-erased handler shared across concurrent requests.
#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid route handler.
///
/// You never implement this yourself. It is automatically satisfied for any
/// `async fn` with the signature:
///
/// ```text
/// async fn name(req: ClientRequest) -> impl IntoEnvelope
/// ```
///
/// The trait is **sealed**: only the blanket impl below can satisfy it, so
/// the API surface stays stable across versions.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(ClientRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoEnvelope + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(ClientRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoEnvelope + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

// ── Concrete wrapper ──────────────────────────────────────────────────────────

/// Bridges a concrete handler `F` into the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(ClientRequest) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoEnvelope + Send + 'static,
{
    fn call(&self, req: ClientRequest) -> BoxFuture<Envelope> {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_envelope() })
    }
}
