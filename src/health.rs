//! Built-in Kubernetes health-check handlers.
//!
//! | Probe | Path | Question |
//! |---|---|---|
//! | **Liveness** | `/healthz` | Is the process alive? Failure → restart. |
//! | **Readiness** | `/readyz` | Can the pod serve traffic? Failure → pulled from load-balancer. |
//!
//! Register them like any other handler:
//!
//! ```rust
//! use viaduct::{health, Router};
//!
//! let router = Router::new();
//! router.route().get("/healthz", health::liveness)?;
//! router.route().get("/readyz", health::readiness)?;
//! # Ok::<(), viaduct::Error>(())
//! ```
//!
//! Override `readiness` with a custom handler if you need to gate on
//! dependency availability (database connections, downstream services,
//! warm-up periods).

use crate::request::ClientRequest;
use crate::response::Envelope;

/// Kubernetes liveness probe handler.
///
/// Always returns `200 OK` with body `"ok"`. If the process can respond to
/// HTTP at all, it is alive; this handler intentionally has no dependencies.
pub async fn liveness(_req: ClientRequest) -> Envelope {
    Envelope::raw_text("ok")
}

/// Kubernetes readiness probe handler (default implementation).
///
/// Returns `200 OK` with body `"ready"`. Replace this with your own handler
/// if your application must verify dependency health before accepting
/// traffic.
pub async fn readiness(_req: ClientRequest) -> Envelope {
    Envelope::raw_text("ready")
}
