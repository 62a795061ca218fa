//! Plugin feature: bridges the plugin host into the feature system.
//!
//! Owns the [`PluginHost`] and exposes its commands; the dispatcher
//! reaches the hook pipelines and the plugin command registry through
//! this feature via the bus.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use bd_domain::error::{Error, Result};
use bd_domain::response::Response;
use bd_plugins::{HookName, PluginHost, SkipVerdict};

use crate::{Feature, FeatureContext};

pub const NAME: &str = "plugins";
pub const COMMANDS: &[&str] = &[
    "loadPlugin",
    "unloadPlugin",
    "listPlugins",
    "runPluginCommand",
];

pub struct PluginsFeature {
    host: Arc<PluginHost>,
}

impl PluginsFeature {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        Ok(Self {
            host: Arc::new(PluginHost::new(ctx.plugins.clone(), &ctx.state_dir)),
        })
    }

    pub fn host(&self) -> Arc<PluginHost> {
        self.host.clone()
    }

    /// `beforeCommand` pipeline; `Some` means the command is skipped.
    pub async fn before_command(&self, cmd: &str, args: &Value) -> Option<SkipVerdict> {
        self.host.before_command(cmd, args).await
    }

    pub async fn after_command(&self, cmd: &str, response: &Response) {
        let payload = json!({ "cmd": cmd, "response": response });
        self.host.fire_hook(HookName::AfterCommand, payload).await;
    }

    pub async fn on_error(&self, cmd: &str, error: &str) {
        let payload = json!({ "cmd": cmd, "error": error });
        self.host.fire_hook(HookName::OnError, payload).await;
    }

    pub async fn fire_on_navigate(&self, url: &str) {
        self.host
            .fire_hook(HookName::OnNavigate, json!({ "url": url }))
            .await;
    }

    pub async fn fire_on_snapshot(&self, summary: Value) {
        self.host.fire_hook(HookName::OnSnapshot, summary).await;
    }

    /// Plugin-registered commands (the registry parallel to the command
    /// index).
    pub fn find_plugin_command(&self, cmd: &str) -> Option<String> {
        self.host.find_command(cmd)
    }

    pub async fn run_plugin_command(&self, cmd: &str, args: Value) -> Result<Value> {
        self.host.run_command(cmd, args).await
    }
}

#[async_trait]
impl Feature for PluginsFeature {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn cleanup(&self) -> Result<()> {
        self.host.shutdown().await;
        Ok(())
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response> {
        match cmd {
            "loadPlugin" => {
                let path = args
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Handler("path is required".into()))?;
                let info = self.host.load_plugin(path)?;
                Ok(Response::ok(serde_json::to_value(info)?))
            }
            "unloadPlugin" => {
                let name = args
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Handler("name is required".into()))?;
                self.host.unload_plugin(name).await?;
                Ok(Response::ok(json!({ "unloaded": name })))
            }
            "listPlugins" => Ok(Response::ok(json!({
                "plugins": self.host.list(),
                "hookFailures": self.host.hook_failures(),
            }))),
            "runPluginCommand" => {
                let name = args
                    .get("command")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Handler("command is required".into()))?;
                let payload = args.get("args").cloned().unwrap_or_else(|| json!({}));
                let result = self.host.run_command(name, payload).await?;
                Ok(Response::ok(json!({ "result": result })))
            }
            _ => Err(Error::UnknownCommand(cmd.to_string())),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
