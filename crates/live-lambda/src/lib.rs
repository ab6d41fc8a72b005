//! live-lambda: relay cloud function invocations to a remote development worker.
//!
//! [`wrap`] is called once at startup. With `SLS_LIVE_LAMBDA_ENABLED` set, each
//! invocation is published over pub/sub to the developer's machine and the
//! function returns whatever the remote handler replies.

pub mod bridge;
pub mod config;
pub mod context;
pub mod controller;
pub mod environment;
pub mod handler;

#[cfg(test)]
mod test_support;

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use bridge::protocol::{Fragment, Message, MessageType, Properties, WorkerId};
pub use bridge::transport::{MemoryTransport, QoS, Transport, TransportError};
pub use config::{BridgeConfig, Topics};
pub use context::{CancellationToken, Invocation, InvocationContext};
pub use controller::{Bridge, BridgeError};
pub use environment::{EnvironmentSnapshot, RESERVED_ENV_VARS};
pub use handler::{BridgeHandler, Handler, HandlerFn, handler_fn, is_fatal_error, wrap};

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `SLS_LOG` picks the level for this crate
/// only, so the host function's own logs are left alone. `LOG_FORMAT=json`
/// switches to JSON lines. Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = log_level(std::env::var("SLS_LOG").ok().as_deref());
        EnvFilter::new(format!("live_lambda={level}"))
    });

    let output = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init();
}

/// Map an `SLS_LOG` value to a filter level. Unknown or unset means `info`.
fn log_level(value: Option<&str>) -> &'static str {
    match value.map(str::trim) {
        Some(v) if v.eq_ignore_ascii_case("trace") => "trace",
        Some(v) if v.eq_ignore_ascii_case("debug") => "debug",
        Some(v) if v.eq_ignore_ascii_case("warn") || v.eq_ignore_ascii_case("warning") => "warn",
        Some(v) if v.eq_ignore_ascii_case("error") => "error",
        Some(v) if v.eq_ignore_ascii_case("off") => "off",
        _ => "info",
    }
}
