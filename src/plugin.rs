//! Process-wide plugins.
//!
//! A plugin is a named, single-instance extension receiving lifecycle and
//! per-request hooks. All hooks are optional no-ops; a plugin implements
//! the ones it cares about. Two hooks can influence a request:
//! `on_before_request_received` returning `Ok(false)` aborts it, and
//! `on_before_response_sent` returning `Ok(Some(_))` replaces the response.
//!
//! A hook that returns an error is logged at error level and swallowed;
//! the request proceeds. One misbehaving extension must not become a
//! request outage.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::request::ProcessedRequest;
use crate::response::Envelope;

/// The plugin hook contract. Every hook has a no-op default.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin name; duplicate registration is a setup-time error.
    fn name(&self) -> &str;

    /// Before any parsing. `Ok(false)` aborts the request entirely; the
    /// plugin is assumed to have dealt with the client itself.
    async fn on_before_request_received(&self, head: &http::request::Parts) -> Result<bool, Error> {
        let _ = head;
        Ok(true)
    }

    /// After normalization. Side effects only; the return value is ignored
    /// beyond error logging.
    async fn on_request_received(&self, req: &ProcessedRequest) -> Result<(), Error> {
        let _ = req;
        Ok(())
    }

    /// After formatting, before the wire write. A returned envelope
    /// replaces the response; later plugins are not consulted.
    async fn on_before_response_sent(
        &self,
        req: &ProcessedRequest,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, Error> {
        let _ = (req, envelope);
        Ok(None)
    }

    /// Once, when the server starts listening.
    async fn on_server_started(&self, addr: SocketAddr) -> Result<(), Error> {
        let _ = addr;
        Ok(())
    }

    /// Whenever a route, middleware, or plugin registration changes.
    async fn on_registry_update(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Once, the first time any request runs through the pipeline.
    async fn on_initialize(&self) -> Result<(), Error> {
        Ok(())
    }

    /// On shutdown. Awaited under a hard timeout; shutdown proceeds
    /// regardless of completion.
    async fn on_before_exit(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Name-keyed, single-instance-per-name plugin registry.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    initialized: OnceCell<()>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin. A duplicate name fails synchronously.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), Error> {
        let mut plugins = self.plugins.write().unwrap_or_else(|e| e.into_inner());
        if plugins.iter().any(|p| p.name() == plugin.name()) {
            return Err(Error::Configuration(format!(
                "plugin {:?} already registered",
                plugin.name()
            )));
        }
        plugins.push(plugin);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.plugins.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Runs every `on_initialize` hook exactly once, on the first call.
    pub(crate) async fn ensure_initialized(&self) {
        self.initialized
            .get_or_init(|| async {
                for plugin in self.snapshot() {
                    if let Err(e) = plugin.on_initialize().await {
                        error!(plugin = plugin.name(), "initialize hook failed: {e}");
                    }
                }
            })
            .await;
    }

    /// Fires `on_registry_update` on every plugin, swallowing failures.
    pub(crate) async fn notify_update(&self) {
        for plugin in self.snapshot() {
            if let Err(e) = plugin.on_registry_update().await {
                error!(plugin = plugin.name(), "registry-update hook failed: {e}");
            }
        }
    }

    pub(crate) async fn notify_server_started(&self, addr: SocketAddr) {
        for plugin in self.snapshot() {
            if let Err(e) = plugin.on_server_started(addr).await {
                error!(plugin = plugin.name(), "server-started hook failed: {e}");
            }
        }
    }

    /// Awaits every `on_before_exit` hook, bounded by `timeout`. Shutdown
    /// continues whether or not the hooks finished.
    pub(crate) async fn run_before_exit(&self, timeout: Duration) {
        let plugins = self.snapshot();
        if plugins.is_empty() {
            return;
        }
        let all = async {
            for plugin in plugins {
                if let Err(e) = plugin.on_before_exit().await {
                    error!(plugin = plugin.name(), "before-exit hook failed: {e}");
                }
            }
        };
        if tokio::time::timeout(timeout, all).await.is_err() {
            warn!("before-exit hooks exceeded {timeout:?}, proceeding with shutdown");
        } else {
            debug!("before-exit hooks completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        initialized: AtomicUsize,
    }

    #[async_trait]
    impl Plugin for Counting {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_initialize(&self) -> Result<(), Error> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = PluginRegistry::new();
        let make = || {
            Arc::new(Counting { name: "metrics", initialized: AtomicUsize::new(0) })
                as Arc<dyn Plugin>
        };
        registry.register(make()).unwrap();
        assert!(matches!(
            registry.register(make()),
            Err(Error::Configuration(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn initialize_runs_once() {
        let registry = PluginRegistry::new();
        let plugin = Arc::new(Counting { name: "p", initialized: AtomicUsize::new(0) });
        registry.register(plugin.clone()).unwrap();

        registry.ensure_initialized().await;
        registry.ensure_initialized().await;
        assert_eq!(plugin.initialized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_exit_hook_is_bounded() {
        struct Slow;

        #[async_trait]
        impl Plugin for Slow {
            fn name(&self) -> &str {
                "slow"
            }

            async fn on_before_exit(&self) -> Result<(), Error> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let registry = PluginRegistry::new();
        registry.register(Arc::new(Slow)).unwrap();

        let started = std::time::Instant::now();
        registry.run_before_exit(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
