//! `bd-features` — the feature modules behind the command dispatcher.
//!
//! A feature bundles related commands behind a uniform capability set:
//! a stable name, optional async setup/cleanup, and a command handler.
//! Features find their collaborators through the [`FeatureBus`] and
//! degrade gracefully when a collaborator is absent.

pub mod actions;
pub mod assertions;
pub mod audit;
pub mod console;
pub mod events;
pub mod evidence;
pub mod kind;
pub mod multi;
pub mod network;
pub mod perf;
pub mod plugins_bridge;
pub mod snapshot;
pub mod state;
pub mod tabs;
pub mod tracking;
pub mod video;

mod bus;
mod context;

pub use bus::FeatureBus;
pub use context::{
    BasicMockValidator, CommandExecutor, ContextRef, FeatureContext, LifecycleLink,
    MockValidator, PageRef,
};
pub use kind::FeatureKind;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use bd_domain::error::Result;
use bd_domain::response::Response;

/// A self-contained module bundling related commands.
///
/// `handle` returns `Ok(Response)` for every domain outcome, including
/// failed assertions (`status:"error"` with `data.passed == false`);
/// `Err` is reserved for genuine faults, which the dispatcher routes
/// through the plugin `onError` pipeline.
#[async_trait]
pub trait Feature: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn commands(&self) -> &'static [&'static str];

    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response>;

    /// Upcast for typed collaborator lookups through the bus.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
