//! The transport capability peer sessions multiplex over.

pub mod memory;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::address::Address;
use crate::error::Result;
use crate::status::{ConnectionStatus, ConnectionType, StatusCallback};

pub use memory::{MemoryConnection, MemoryRelay};

pub type EventCallback = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure into an event callback handle.
///
/// Registries deduplicate by handle, so clone the returned `Arc` when the same
/// listener may be registered more than once.
pub fn event_callback<F, Fut>(f: F) -> EventCallback
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)) as BoxFuture<'static, ()>)
}

/// A duplex channel carrying anonymous messages and named events.
///
/// Status callbacks run synchronously, in registration order, once per
/// transition and after the new status is readable through `status()`.
/// Event callbacks run once per matching inbound event.
#[async_trait]
pub trait Connection: Send + Sync {
    fn connection_type(&self) -> ConnectionType;

    fn local_address(&self) -> &Address;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn status(&self) -> ConnectionStatus;

    /// Fire-and-forget; never fails on delivery.
    async fn send(&self, payload: Value) -> Result<()>;

    /// Fire-and-forget; never fails on delivery.
    async fn emit(&self, event: &str, payload: Value) -> Result<()>;

    fn on_message(&self, callback: EventCallback);

    fn on_event(&self, event: &str, callback: EventCallback, once: bool);

    /// Removes every listener for `event` registered with this handle.
    fn off_event(&self, event: &str, callback: &EventCallback);

    fn on_status_change(&self, callback: StatusCallback);

    fn off_status_change(&self, callback: &StatusCallback);
}
