//! Video recording.
//!
//! Recording requires a context built with video options, so `start`
//! does not record anything itself: it answers with
//! `requiresContextRestart` + the options, and the manager recreates
//! the context and re-initializes features. The new context handle is
//! re-injected here afterwards.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use bd_browser::driver::{ContextHandle, RecordVideoOptions, Viewport};
use bd_domain::error::{Error, Result};
use bd_domain::response::Response;

use crate::{Feature, FeatureContext};

pub const NAME: &str = "videoRecording";
pub const COMMANDS: &[&str] = &["startVideoRecording", "stopVideoRecording"];

pub struct VideoRecording {
    ctx: FeatureContext,
    recording: Mutex<Option<RecordVideoOptions>>,
    /// Context the recording runs in; replaced after recreation.
    context: Mutex<Option<Arc<dyn ContextHandle>>>,
}

impl VideoRecording {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            recording: Mutex::new(None),
            context: Mutex::new(ctx.context.get()),
        })
    }

    /// Called by the manager after the video context exists.
    pub fn set_context(&self, context: Arc<dyn ContextHandle>) {
        *self.context.lock() = Some(context);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.lock().is_some()
    }
}

#[async_trait]
impl Feature for VideoRecording {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response> {
        match cmd {
            "startVideoRecording" => {
                if self.is_recording() {
                    return Err(Error::Handler("video recording already active".into()));
                }
                let dir = self
                    .ctx
                    .state_dir
                    .join("videos")
                    .display()
                    .to_string();
                let size = args.get("size").and_then(|s| {
                    Some(Viewport {
                        width: s.get("width")?.as_u64()? as u32,
                        height: s.get("height")?.as_u64()? as u32,
                    })
                });
                let options = RecordVideoOptions { dir, size };
                *self.recording.lock() = Some(options.clone());

                Ok(Response::ok(json!({
                    "requiresContextRestart": true,
                    "recordVideoOptions": options,
                })))
            }
            "stopVideoRecording" => {
                let options = self
                    .recording
                    .lock()
                    .take()
                    .ok_or_else(|| Error::Handler("no video recording active".into()))?;
                Ok(Response::ok(json!({
                    "stopped": true,
                    "dir": options.dir,
                })))
            }
            _ => Err(Error::UnknownCommand(cmd.to_string())),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn make() -> VideoRecording {
        let ctx = FeatureContext::new(PathBuf::from("/tmp/bd"), Default::default(), Default::default());
        VideoRecording::new(&ctx).unwrap()
    }

    #[tokio::test]
    async fn start_requests_context_restart() {
        let video = make();
        let resp = video
            .handle("startVideoRecording", &json!({"size": {"width": 1280, "height": 720}}))
            .await
            .unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data["requiresContextRestart"], true);
        assert_eq!(data["recordVideoOptions"]["size"]["width"], 1280);
        assert!(video.is_recording());
    }

    #[tokio::test]
    async fn double_start_fails() {
        let video = make();
        video
            .handle("startVideoRecording", &json!({}))
            .await
            .unwrap();
        assert!(video
            .handle("startVideoRecording", &json!({}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn stop_without_start_fails() {
        let video = make();
        assert!(video
            .handle("stopVideoRecording", &json!({}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn stop_round_trip() {
        let video = make();
        video
            .handle("startVideoRecording", &json!({}))
            .await
            .unwrap();
        let resp = video
            .handle("stopVideoRecording", &json!({}))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap()["stopped"], true);
        assert!(!video.is_recording());
    }
}
