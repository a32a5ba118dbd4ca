//! Global middleware.
//!
//! Middleware runs after normalization and before route matching, in
//! registration order. Each callback sees the immutable
//! [`ProcessedRequest`] and returns one of three things:
//!
//! - `None`: continue to the next middleware;
//! - `Some(envelope)`: short-circuit, the envelope is formatted and sent,
//!   remaining middleware and routing are skipped;
//! - `Some(Envelope::modification()...)`: merge the carried header/status
//!   overrides into whatever response is ultimately written, and continue.
//!
//! Every registration returns a [`MiddlewareHandle`] that removes exactly
//! that callback, regardless of what was added or removed around it.

use std::future::Future;
use std::sync::Arc;

use crate::handler::BoxFuture;
use crate::request::ProcessedRequest;
use crate::response::Envelope;

pub(crate) type ErasedMiddleware =
    Arc<dyn Fn(Arc<ProcessedRequest>) -> BoxFuture<Option<Envelope>> + Send + Sync + 'static>;

/// Removal token for one registered middleware.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MiddlewareHandle(u64);

/// Ordered, insertion-indexed middleware registry.
#[derive(Default)]
pub struct MiddlewareRegistry {
    entries: Vec<(u64, ErasedMiddleware)>,
    next_id: u64,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback at the end of the chain.
    pub fn add<F, Fut>(&mut self, middleware: F) -> MiddlewareHandle
    where
        F: Fn(Arc<ProcessedRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Envelope>> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        let erased: ErasedMiddleware = Arc::new(move |req| Box::pin(middleware(req)));
        self.entries.push((id, erased));
        MiddlewareHandle(id)
    }

    /// Removes the callback `handle` refers to. Returns whether it was
    /// still registered.
    pub fn remove(&mut self, handle: MiddlewareHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(id, _)| *id != handle.0);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A cheap snapshot of the chain, so dispatch never holds the registry
    /// lock across an await point.
    pub(crate) fn snapshot(&self) -> Vec<ErasedMiddleware> {
        self.entries.iter().map(|(_, mw)| Arc::clone(mw)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_remove_exactly_one_entry() {
        let mut registry = MiddlewareRegistry::new();
        let a = registry.add(|_req| async { None });
        let b = registry.add(|_req| async { None });
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(b));
        assert!(registry.is_empty());
    }
}
