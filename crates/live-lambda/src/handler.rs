//! Function handler seam and the live-mode wrapper.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::bridge::transport::Transport;
use crate::config::BridgeConfig;
use crate::context::Invocation;
use crate::controller::{Bridge, BridgeError};

/// A cloud function: one event in, one response body out.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(
        &self,
        event: serde_json::Value,
        invocation: Invocation,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(serde_json::Value, Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(serde_json::Value, Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    async fn call(
        &self,
        event: serde_json::Value,
        invocation: Invocation,
    ) -> anyhow::Result<serde_json::Value> {
        (self.f)(event, invocation).await
    }
}

/// Handler that relays every invocation through a shared [`Bridge`].
pub struct BridgeHandler {
    bridge: Arc<Bridge>,
}

impl BridgeHandler {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }
}

#[async_trait]
impl Handler for BridgeHandler {
    async fn call(
        &self,
        event: serde_json::Value,
        invocation: Invocation,
    ) -> anyhow::Result<serde_json::Value> {
        match self.bridge.switch(event, &invocation).await {
            Ok(response) => Ok(response),
            Err(e) if e.is_fatal() => {
                tracing::error!(
                    worker_id = %self.bridge.worker_id(),
                    error = %e,
                    "Live bridge has no transport; this function process should terminate"
                );
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Choose between the local handler and the bridge, once, at startup.
///
/// With live mode off `handler` is returned untouched and `transport` is never
/// called. With live mode on the local handler is never invoked; every call is
/// relayed through one [`Bridge`] shared by all invocations of this process.
///
/// The caller owns process lifetime: an error for which [`is_fatal_error`]
/// holds means the transport could not be set up, and the host should exit
/// rather than keep serving invocations that can never complete.
pub fn wrap<T>(handler: Arc<dyn Handler>, config: &BridgeConfig, transport: T) -> Arc<dyn Handler>
where
    T: FnOnce() -> Arc<dyn Transport>,
{
    if !config.live_enabled {
        tracing::debug!("Live mode disabled, using local handler");
        return handler;
    }

    tracing::info!(
        app = %config.app,
        stage = %config.stage,
        function = %config.function_name,
        "Live mode enabled, relaying invocations to remote worker"
    );
    let bridge = Arc::new(Bridge::new(config.clone(), transport()));
    Arc::new(BridgeHandler::new(bridge))
}

/// Whether `err` came from a bridge that cannot reach its transport.
pub fn is_fatal_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<BridgeError>().is_some_and(BridgeError::is_fatal)
}
