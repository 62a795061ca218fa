//! Performance metrics.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use bd_browser::driver::PageHandle;
use bd_domain::error::{Error, Result};
use bd_domain::response::Response;

use crate::{Feature, FeatureContext};

pub const NAME: &str = "performance";
pub const COMMANDS: &[&str] = &["getPerformanceMetrics"];

/// Navigation-timing probe run alongside the driver's raw metrics.
const TIMING_SCRIPT: &str = "(() => { \
    const nav = performance.getEntriesByType('navigation')[0]; \
    if (!nav) return null; \
    return { \
        domContentLoaded: nav.domContentLoadedEventEnd, \
        load: nav.loadEventEnd, \
        ttfb: nav.responseStart, \
    }; })()";

pub struct PerformanceMetrics {
    ctx: FeatureContext,
}

impl PerformanceMetrics {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        Ok(Self { ctx: ctx.clone() })
    }

    /// Raw metrics for collaborator use (assertions).
    pub async fn collect(&self) -> Result<Value> {
        let page = self
            .ctx
            .page
            .get()
            .ok_or_else(|| Error::Handler("no page open".into()))?;
        let mut metrics = page.metrics().await?;
        if let Ok(timing) = page.evaluate(TIMING_SCRIPT).await {
            if !timing.is_null() {
                metrics["navigationTiming"] = timing;
            }
        }
        Ok(metrics)
    }
}

#[async_trait]
impl Feature for PerformanceMetrics {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn handle(&self, cmd: &str, _args: &Value) -> Result<Response> {
        match cmd {
            "getPerformanceMetrics" => {
                let metrics = self.collect().await?;
                Ok(Response::ok(json!({ "metrics": metrics })))
            }
            _ => Err(Error::UnknownCommand(cmd.to_string())),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
