//! Multi-command execution.
//!
//! Runs a batch of commands sequentially through the full dispatch
//! pipeline (hooks, enrichment and all), stopping on the first error
//! unless `continueOnError` is set.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use bd_domain::error::{Error, Result};
use bd_domain::response::Response;

use crate::{Feature, FeatureContext};

pub const NAME: &str = "multiCommand";
pub const COMMANDS: &[&str] = &["runCommands"];

pub struct MultiCommand {
    ctx: FeatureContext,
}

impl MultiCommand {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        Ok(Self { ctx: ctx.clone() })
    }
}

#[async_trait]
impl Feature for MultiCommand {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response> {
        if cmd != "runCommands" {
            return Err(Error::UnknownCommand(cmd.to_string()));
        }
        let executor = self
            .ctx
            .executor()
            .ok_or_else(|| Error::Handler("command executor unavailable".into()))?;
        let commands = args
            .get("commands")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Handler("commands array is required".into()))?;
        let continue_on_error = args
            .get("continueOnError")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut results = Vec::with_capacity(commands.len());
        let mut failed = 0usize;
        for entry in commands {
            let sub_cmd = match entry.get("cmd").and_then(Value::as_str) {
                Some(c) if c != "runCommands" => c.to_string(),
                Some(_) => {
                    return Err(Error::Handler("runCommands cannot nest itself".into()));
                }
                None => {
                    return Err(Error::Handler("each entry needs a cmd".into()));
                }
            };
            let sub_args = entry.get("args").cloned().unwrap_or_else(|| json!({}));

            let response = executor.execute(&sub_cmd, sub_args).await;
            let ok = response.is_ok();
            results.push(json!({ "cmd": sub_cmd, "response": response }));
            if !ok {
                failed += 1;
                if !continue_on_error {
                    break;
                }
            }
        }

        Ok(Response::ok(json!({
            "results": results,
            "executed": results.len(),
            "failed": failed,
        })))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
