//! Command dispatcher.
//!
//! The path from a command name to a response: O(1) index lookup, lazy
//! feature load on first use, the plugin hook pipeline around the
//! handler, response enrichment, and anticipatory preloading.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use bd_domain::error::Error;
use bd_domain::response::Response;
use bd_domain::trace::TraceEvent;
use bd_features::console::ConsoleCapture;
use bd_features::plugins_bridge::PluginsFeature;
use bd_features::{console, plugins_bridge};

use crate::registry::FeatureRegistry;

/// Commands whose responses get the last console messages appended.
const ENRICHED_COMMANDS: &[&str] = &["click", "dblclick", "type", "evaluate", "navigate"];
const ENRICH_CONSOLE_COUNT: usize = 5;

pub struct Dispatcher {
    registry: Arc<FeatureRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<FeatureRegistry>) -> Self {
        Self { registry }
    }

    fn plugins(&self) -> Option<Arc<PluginsFeature>> {
        self.registry
            .ctx()
            .bus
            .get_as::<PluginsFeature>(plugins_bridge::NAME)
    }

    pub async fn dispatch(&self, cmd: &str, args: &Value) -> Response {
        let started = Instant::now();
        let response = self.dispatch_inner(cmd, args).await;
        TraceEvent::CommandDispatched {
            cmd: cmd.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            ok: response.is_ok(),
        }
        .emit();
        response
    }

    async fn dispatch_inner(&self, cmd: &str, args: &Value) -> Response {
        // 1. Index lookup; plugin-registered commands live in a parallel
        //    registry consulted on a miss.
        let entry = match self.registry.lookup(cmd) {
            Some(entry) => entry,
            None => return self.dispatch_plugin_command(cmd, args).await,
        };

        // 2. Lazy load on first use.
        if entry.lazy && !self.registry.is_loaded(entry.kind) {
            if let Err(e) = self.registry.load_lazy(entry.kind).await {
                return Response::from(&e);
            }
        }

        // 3. Obtain the feature.
        let feature = match self.registry.get(entry.kind.name()) {
            Some(feature) => feature,
            None => {
                return Response::error(format!(
                    "feature {} is not available",
                    entry.kind.name()
                ))
            }
        };

        // 4. beforeCommand pipeline: a skip verdict short-circuits.
        if let Some(plugins) = self.plugins() {
            if let Some(verdict) = plugins.before_command(cmd, args).await {
                return Response::ok_with_message(
                    json!({ "skipped": true, "command": cmd }),
                    format!("Command skipped by plugin: {}", verdict.reason),
                );
            }
        }

        // 5. Handler, then the success or error pipeline.
        match feature.handle(cmd, args).await {
            Ok(mut response) => {
                self.enrich(cmd, &mut response);
                if let Some(plugins) = self.plugins() {
                    plugins.after_command(cmd, &response).await;
                }
                self.registry.fire_preload_hints(cmd);
                response
            }
            Err(error) => {
                if let Some(plugins) = self.plugins() {
                    plugins.on_error(cmd, &error.to_string()).await;
                }
                Response::from(&error)
            }
        }
    }

    async fn dispatch_plugin_command(&self, cmd: &str, args: &Value) -> Response {
        let plugins = match self.plugins() {
            Some(plugins) if plugins.find_plugin_command(cmd).is_some() => plugins,
            _ => return Response::from(&Error::UnknownCommand(cmd.to_string())),
        };
        match plugins.run_plugin_command(cmd, args.clone()).await {
            Ok(result) => Response::ok(json!({ "result": result })),
            Err(error) => Response::from(&error),
        }
    }

    /// Append the last console messages to interaction responses when a
    /// console feature is present and the field is absent.
    fn enrich(&self, cmd: &str, response: &mut Response) {
        if !response.is_ok() || !ENRICHED_COMMANDS.contains(&cmd) {
            return;
        }
        let console = match self
            .registry
            .ctx()
            .bus
            .get_as::<ConsoleCapture>(console::NAME)
        {
            Some(console) => console,
            None => return,
        };
        let data = response.data.get_or_insert_with(|| json!({}));
        if data.get("console").is_some() {
            return;
        }
        if let Value::Object(map) = data {
            match serde_json::to_value(console.recent(ENRICH_CONSOLE_COUNT)) {
                Ok(recent) => {
                    map.insert("console".to_string(), recent);
                }
                Err(e) => tracing::debug!(error = %e, "console enrichment failed"),
            }
        }
    }
}
