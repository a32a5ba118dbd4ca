//! Pipeline configuration.
//!
//! One value, built at startup, read-only afterwards. Everything here has a
//! conservative default: proxy headers untrusted, validation on and
//! non-verbose, standard multipart ceilings.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use crate::parser::ParseLimits;
use crate::template::ResponseTemplate;

/// Configuration consumed by the dispatch pipeline.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Trust `Forwarded` / `X-Forwarded-*` / `X-Real-IP` /
    /// `CF-Connecting-IP` for host and client-IP derivation. Leave off
    /// unless a proxy you control sets them.
    pub trust_proxy: bool,

    /// Report the validator's per-field messages to the client instead of
    /// the generic `invalid <slot>`.
    pub verbose_validation: bool,

    /// Skip schema validation entirely.
    pub disable_validation: bool,

    /// When set, requests whose derived host is not in this list are
    /// answered with 404.
    pub allowed_hosts: Option<Vec<String>>,

    /// Status codes written header-only, regardless of envelope content.
    pub code_only_statuses: HashSet<u16>,

    /// Multipart and binary body ceilings.
    pub limits: ParseLimits,

    /// Seconds to wait for plugin before-exit hooks at shutdown.
    pub exit_hook_timeout_secs: u64,

    /// Replaces the default `{"error", "content"}` response template.
    #[serde(skip)]
    pub template: Option<ResponseTemplate>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trust_proxy: false,
            verbose_validation: false,
            disable_validation: false,
            allowed_hosts: None,
            code_only_statuses: HashSet::from([204, 304]),
            limits: ParseLimits::default(),
            exit_hook_timeout_secs: 5,
            template: None,
        }
    }
}

impl Config {
    pub fn exit_hook_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_hook_timeout_secs)
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("trust_proxy", &self.trust_proxy)
            .field("verbose_validation", &self.verbose_validation)
            .field("disable_validation", &self.disable_validation)
            .field("allowed_hosts", &self.allowed_hosts)
            .field("code_only_statuses", &self.code_only_statuses)
            .field("limits", &self.limits)
            .field("exit_hook_timeout_secs", &self.exit_hook_timeout_secs)
            .field("template", &self.template.as_ref().map(|_| "custom"))
            .finish()
    }
}
