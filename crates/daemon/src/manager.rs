//! The manager: request entry point above the dispatcher.
//!
//! Lifecycle commands (`status`, `start`, `close`, `setHeadless`) are
//! handled here and never reach the dispatcher, because they may
//! invalidate the feature set. Everything else auto-starts the browser,
//! makes sure features are initialized, dispatches, and then handles
//! the two rebuild triggers: the video context-restart special case and
//! any handler that dropped the `features_initialized` guard.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use bd_browser::driver::RecordVideoOptions;
use bd_domain::error::Error;
use bd_domain::response::Response;
use bd_features::plugins_bridge;
use bd_features::video::VideoRecording;
use bd_features::{video, CommandExecutor, FeatureContext};

use crate::dispatch::Dispatcher;
use crate::lifecycle::{Lifecycle, DEFAULT_URL};
use crate::registry::FeatureRegistry;
use crate::server::RequestHandler;

pub struct Manager {
    lifecycle: Arc<Lifecycle>,
    registry: Arc<FeatureRegistry>,
    dispatcher: Dispatcher,
    session_id: Option<String>,
    /// Serializes feature rebuilds against dispatch.
    rebuild_lock: tokio::sync::Mutex<()>,
}

impl Manager {
    /// Build the manager and wire it into the feature context's
    /// executor and lifecycle slots.
    pub fn new(
        ctx: &FeatureContext,
        lifecycle: Arc<Lifecycle>,
        session_id: Option<String>,
    ) -> Arc<Self> {
        let registry = Arc::new(FeatureRegistry::new(ctx.clone()));
        let manager = Arc::new(Self {
            lifecycle: lifecycle.clone(),
            registry: registry.clone(),
            dispatcher: Dispatcher::new(registry),
            session_id,
            rebuild_lock: tokio::sync::Mutex::new(()),
        });
        *ctx.executor.write() = Some(manager.clone());
        *ctx.lifecycle.write() = Some(lifecycle);
        manager
    }

    pub fn registry(&self) -> &Arc<FeatureRegistry> {
        &self.registry
    }

    /// Rebuild the feature set when the guard is down. Serialized so a
    /// triggering command finishes the rebuild before returning.
    async fn ensure_features(&self) -> Result<(), Error> {
        if self.lifecycle.features_initialized() {
            return Ok(());
        }
        let _guard = self.rebuild_lock.lock().await;
        if self.lifecycle.features_initialized() {
            return Ok(());
        }
        self.registry.cleanup_all().await;
        self.registry.initialize_core().await?;
        self.lifecycle.set_features_initialized(true);
        Ok(())
    }

    /// Rebuild after a context recreation. The browser stayed up, so a
    /// live video feature keeps its recording state: the instance is
    /// carried across the rebuild, re-published, and handed the fresh
    /// context. Every recreation path goes through here, whichever
    /// handler triggered the restart.
    async fn rebuild_after_context_recreation(&self) -> Result<(), Error> {
        let video_feature = self
            .registry
            .ctx()
            .bus
            .get_as::<VideoRecording>(video::NAME);

        self.ensure_features().await?;

        if let Some(video_feature) = video_feature {
            if let Some(context) = self.registry.ctx().context.get() {
                video_feature.set_context(context);
            }
            self.registry.ctx().bus.publish(video_feature);
        }
        Ok(())
    }

    pub async fn handle_command(&self, cmd: &str, args: &Value) -> Response {
        match cmd {
            // ── Lifecycle commands: bypass the dispatcher ───────────
            "status" => Response::ok(self.lifecycle.status().await),
            "start" => {
                let url = args
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_URL)
                    .to_string();
                let started = match self.lifecycle.ensure_started(&url).await {
                    Ok(started) => started,
                    Err(e) => return Response::from(&e),
                };
                if let Err(e) = self.ensure_features().await {
                    return Response::from(&e);
                }
                Response::ok(json!({
                    "running": true,
                    "started": started,
                    "url": self.lifecycle.current_url().await,
                }))
            }
            "close" => {
                if let Some(session) = &self.session_id {
                    let requested = args.get("sessionId").and_then(Value::as_str);
                    if requested != Some(session.as_str()) {
                        return Response::from(&Error::SessionMismatch {
                            manager: session.clone(),
                            requested: requested.unwrap_or("<none>").to_string(),
                        });
                    }
                }
                self.registry.cleanup_all().await;
                self.lifecycle.set_features_initialized(false);
                match self.lifecycle.close().await {
                    Ok(()) => Response::ok(json!({ "running": false })),
                    Err(e) => Response::from(&e),
                }
            }
            "setHeadless" => {
                let headless = match args.get("headless").and_then(Value::as_bool) {
                    Some(flag) => flag,
                    None => {
                        return Response::from(&Error::Handler(
                            "headless flag is required".into(),
                        ))
                    }
                };
                match self.lifecycle.set_headless(headless).await {
                    Ok(outcome) => {
                        if outcome.restarted {
                            if let Err(e) = self.ensure_features().await {
                                return Response::from(&e);
                            }
                        }
                        Response::ok(json!({
                            "restarted": outcome.restarted,
                            "previousValue": outcome.previous,
                        }))
                    }
                    Err(e) => Response::from(&e),
                }
            }

            // ── Everything else: dispatcher pipeline ────────────────
            _ => {
                if let Err(e) = self.lifecycle.ensure_started(DEFAULT_URL).await {
                    return Response::from(&e);
                }
                if let Err(e) = self.ensure_features().await {
                    return Response::from(&e);
                }

                let response = self.dispatcher.dispatch(cmd, args).await;
                let response = self.apply_video_restart(response).await;

                // A handler may have torn the context down (state
                // restore); rebuild before the next command arrives.
                if self.lifecycle.is_running().await && !self.lifecycle.features_initialized() {
                    if let Err(e) = self.rebuild_after_context_recreation().await {
                        return Response::from(&e);
                    }
                }
                response
            }
        }
    }

    /// The video special case: a handler answering with
    /// `requiresContextRestart` + options gets its context rebuilt and
    /// the original response returned to the client.
    async fn apply_video_restart(&self, response: Response) -> Response {
        if !response.is_ok() {
            return response;
        }
        let options = response
            .data
            .as_ref()
            .filter(|d| d["requiresContextRestart"] == json!(true))
            .and_then(|d| d.get("recordVideoOptions"))
            .cloned()
            .and_then(|v| serde_json::from_value::<RecordVideoOptions>(v).ok());
        let options = match options {
            Some(options) => options,
            None => return response,
        };

        if let Err(e) = self.lifecycle.recreate_for_video(options).await {
            return Response::from(&e);
        }
        if let Err(e) = self.rebuild_after_context_recreation().await {
            return Response::from(&e);
        }
        response
    }

    /// Hook pipeline shutdown plus browser close, used by the signal
    /// handlers.
    pub async fn shutdown(&self) {
        if let Some(plugins) = self
            .registry
            .ctx()
            .bus
            .get_as::<plugins_bridge::PluginsFeature>(plugins_bridge::NAME)
        {
            plugins.host().shutdown().await;
        }
        self.registry.cleanup_all().await;
        if let Err(e) = self.lifecycle.close().await {
            tracing::warn!(error = %e, "browser close during shutdown failed");
        }
    }
}

#[async_trait]
impl RequestHandler for Manager {
    async fn handle(&self, request: Value) -> Response {
        let cmd = match request.get("cmd").and_then(Value::as_str) {
            Some(cmd) => cmd.to_string(),
            None => return Response::error("missing cmd field"),
        };
        self.handle_command(&cmd, &request).await
    }
}

#[async_trait]
impl CommandExecutor for Manager {
    async fn execute(&self, cmd: &str, args: Value) -> Response {
        self.handle_command(cmd, &args).await
    }
}
