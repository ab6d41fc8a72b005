//! Environment forwarded to the remote worker.

use std::collections::{BTreeMap, HashSet};

/// Variables owned by the function runtime or by the bridge itself. They
/// describe the cloud sandbox, not the function, and are never forwarded.
pub const RESERVED_ENV_VARS: &[&str] = &[
    "SLS_SERVICE_NAME",
    "SLS_STAGE",
    "SLS_LIVE_LAMBDA_ENABLED",
    "AWS_LAMBDA_FUNCTION_MEMORY_SIZE",
    "AWS_LAMBDA_LOG_GROUP_NAME",
    "AWS_LAMBDA_LOG_STREAM_NAME",
    "LD_LIBRARY_PATH",
    "LAMBDA_TASK_ROOT",
    "AWS_LAMBDA_RUNTIME_API",
    "AWS_EXECUTION_ENV",
    "AWS_XRAY_DAEMON_ADDRESS",
    "AWS_LAMBDA_INITIALIZATION_TYPE",
    "PATH",
    "PWD",
    "LAMBDA_RUNTIME_DIR",
    "LANG",
    "NODE_PATH",
    "TZ",
    "SHLVL",
    "_AWS_XRAY_DAEMON_ADDRESS",
    "_AWS_XRAY_DAEMON_PORT",
    "AWS_XRAY_CONTEXT_MISSING",
    "_HANDLER",
    "_LAMBDA_CONSOLE_SOCKET",
    "_LAMBDA_CONTROL_SOCKET",
    "_LAMBDA_LOG_FD",
    "_LAMBDA_RUNTIME_LOAD_TIME",
    "_LAMBDA_SB_ID",
    "_LAMBDA_SERVER_PORT",
    "_LAMBDA_SHARED_MEM_FD",
];

/// Default deny-list as an owned set.
pub fn reserved_env_vars() -> HashSet<String> {
    RESERVED_ENV_VARS.iter().map(|name| name.to_string()).collect()
}

/// Sorted snapshot of the process environment minus reserved names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvironmentSnapshot {
    /// Capture the current process environment.
    pub fn capture(reserved: &HashSet<String>) -> Self {
        // vars_os: a single non-UTF-8 variable must not abort the capture.
        let vars = std::env::vars_os().filter_map(|(key, value)| {
            Some((key.into_string().ok()?, value.into_string().ok()?))
        });
        Self::capture_from(vars, reserved)
    }

    pub fn capture_from<I, K, V>(vars: I, reserved: &HashSet<String>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| !reserved.contains(k))
            .collect();
        tracing::debug!(count = vars.len(), "Captured environment snapshot");
        Self { vars }
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
