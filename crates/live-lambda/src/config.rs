//! Bridge configuration, read once at process start.

use std::collections::HashSet;
use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_CHUNK;
use crate::bridge::protocol::WorkerId;
use crate::environment::reserved_env_vars;

pub const ENV_LIVE_ENABLED: &str = "SLS_LIVE_LAMBDA_ENABLED";
pub const ENV_SERVICE_NAME: &str = "SLS_SERVICE_NAME";
pub const ENV_STAGE: &str = "SLS_STAGE";
pub const ENV_TOPIC_PREFIX: &str = "SLS_TOPIC_PREFIX";
pub const ENV_FRAGMENT_TTL: &str = "SLS_FRAGMENT_TTL_SECS";
pub const ENV_FUNCTION_NAME: &str = "AWS_LAMBDA_FUNCTION_NAME";

/// Lambda's hard execution limit; a fragment older than this can never be answered.
const DEFAULT_FRAGMENT_TTL: Duration = Duration::from_secs(900);

/// `"true"` or `"1"`, case-insensitive, surrounding whitespace ignored.
pub fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    value.eq_ignore_ascii_case("true") || value == "1"
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub live_enabled: bool,
    pub app: String,
    pub stage: String,
    pub topic_prefix: Option<String>,
    pub function_name: String,
    pub max_chunk: usize,
    pub fragment_ttl: Duration,
    pub reserved_env: HashSet<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            live_enabled: false,
            app: String::new(),
            stage: String::new(),
            topic_prefix: None,
            function_name: String::new(),
            max_chunk: DEFAULT_MAX_CHUNK,
            fragment_ttl: DEFAULT_FRAGMENT_TTL,
            reserved_env: reserved_env_vars(),
        }
    }
}

impl BridgeConfig {
    pub fn new(app: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            stage: stage.into(),
            ..Default::default()
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let fragment_ttl = lookup(ENV_FRAGMENT_TTL)
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.fragment_ttl);

        Self {
            live_enabled: lookup(ENV_LIVE_ENABLED).is_some_and(|v| is_truthy(&v)),
            app: lookup(ENV_SERVICE_NAME).unwrap_or_default(),
            stage: lookup(ENV_STAGE).unwrap_or_default(),
            topic_prefix: lookup(ENV_TOPIC_PREFIX).filter(|p| !p.trim().is_empty()),
            function_name: lookup(ENV_FUNCTION_NAME).unwrap_or_default(),
            fragment_ttl,
            ..defaults
        }
    }

    pub fn with_live_enabled(mut self, enabled: bool) -> Self {
        self.live_enabled = enabled;
        self
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = Some(prefix.into());
        self
    }

    pub fn with_function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = name.into();
        self
    }

    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk;
        self
    }

    pub fn with_fragment_ttl(mut self, ttl: Duration) -> Self {
        self.fragment_ttl = ttl;
        self
    }

    pub fn with_reserved_env(mut self, reserved: HashSet<String>) -> Self {
        self.reserved_env = reserved;
        self
    }

    pub fn topics(&self) -> Topics {
        Topics::new(self.topic_prefix.as_deref(), &self.app, &self.stage)
    }
}

/// Topic names for one application/stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(prefix: Option<&str>, app: &str, stage: &str) -> Self {
        let base = match prefix {
            Some(prefix) => format!("{}/{}/{}", prefix.trim_end_matches('/'), app, stage),
            None => format!("{}/{}", app, stage),
        };
        Self { base }
    }

    /// Shared topic the remote worker listens on.
    pub fn events(&self) -> String {
        format!("{}/events", self.base)
    }

    /// Per-worker topic replies are published to.
    pub fn worker(&self, worker_id: &WorkerId) -> String {
        format!("{}/events/{}", self.base, worker_id)
    }
}
