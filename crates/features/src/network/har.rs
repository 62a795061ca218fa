//! HAR 1.2 export of captured network traffic.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use bd_domain::error::{Error, Result};
use bd_domain::response::Response;

use crate::network::capture::NetworkCapture;
use crate::{Feature, FeatureContext};

pub const NAME: &str = "harExport";
pub const COMMANDS: &[&str] = &["exportHAR"];

pub struct HarExport {
    ctx: FeatureContext,
}

impl HarExport {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        Ok(Self { ctx: ctx.clone() })
    }

    fn sanitize_filename(name: &str) -> Result<String> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Handler(format!(
                "invalid export name: {name} (use letters, digits, - and _)"
            )));
        }
        Ok(format!("{name}.har"))
    }
}

#[async_trait]
impl Feature for HarExport {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response> {
        if cmd != "exportHAR" {
            return Err(Error::UnknownCommand(cmd.to_string()));
        }
        let capture = self
            .ctx
            .bus
            .get_as::<NetworkCapture>(crate::network::capture::NAME)
            .ok_or_else(|| {
                Error::Handler("network capture is not active - run setupNetworkCapture first".into())
            })?;

        let filename = Self::sanitize_filename(
            args.get("filename")
                .and_then(Value::as_str)
                .unwrap_or("capture"),
        )?;

        let entries: Vec<Value> = capture
            .completed()
            .into_iter()
            .map(|r| {
                json!({
                    "startedDateTime": r.started_at,
                    "time": r.duration_ms,
                    "request": {
                        "method": r.method,
                        "url": r.url,
                        "httpVersion": "HTTP/1.1",
                        "headers": [],
                        "queryString": [],
                        "cookies": [],
                        "headersSize": -1,
                        "bodySize": -1,
                    },
                    "response": {
                        "status": r.status,
                        "statusText": "",
                        "httpVersion": "HTTP/1.1",
                        "headers": [],
                        "cookies": [],
                        "content": { "size": -1, "mimeType": r.mime_type },
                        "redirectURL": "",
                        "headersSize": -1,
                        "bodySize": -1,
                    },
                    "cache": {},
                    "timings": { "send": 0, "wait": r.duration_ms, "receive": 0 },
                })
            })
            .collect();
        let entry_count = entries.len();

        let har = json!({
            "log": {
                "version": "1.2",
                "creator": { "name": "browserd", "version": env!("CARGO_PKG_VERSION") },
                "entries": entries,
            }
        });

        let dir = self.ctx.state_dir.join("har-exports");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(&filename);
        std::fs::write(&path, serde_json::to_string_pretty(&har)?)?;

        Ok(Response::ok(json!({
            "path": path.display().to_string(),
            "entries": entry_count,
        })))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bd_browser::driver::NetworkEvent;
    use chrono::Utc;

    fn ctx(dir: &std::path::Path) -> FeatureContext {
        FeatureContext::new(dir.to_path_buf(), Default::default(), Default::default())
    }

    #[tokio::test]
    async fn export_writes_har_file() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let capture = Arc::new(NetworkCapture::new(&ctx).unwrap());
        ctx.bus.publish(capture.clone());

        // Feed one exchange straight through the capture store.
        capture
            .handle("setupNetworkCapture", &json!({}))
            .await
            .unwrap();
        for event in [
            NetworkEvent::RequestWillBeSent {
                request_id: "1".into(),
                method: "GET".into(),
                url: "http://x/api".into(),
                timestamp: Utc::now(),
            },
            NetworkEvent::ResponseReceived {
                request_id: "1".into(),
                method: "GET".into(),
                url: "http://x/api".into(),
                status: 200,
                mime_type: "application/json".into(),
                timestamp: Utc::now(),
            },
        ] {
            capture.ingest_event(event);
        }

        let har = HarExport::new(&ctx).unwrap();
        let resp = har
            .handle("exportHAR", &json!({"filename": "run-1"}))
            .await
            .unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data["entries"], 1);

        let written = std::fs::read_to_string(tmp.path().join("har-exports/run-1.har")).unwrap();
        let parsed: Value = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed["log"]["version"], "1.2");
        assert_eq!(parsed["log"]["entries"][0]["response"]["status"], 200);
    }

    #[tokio::test]
    async fn export_without_capture_is_domain_error() {
        let tmp = tempfile::tempdir().unwrap();
        let har = HarExport::new(&ctx(tmp.path())).unwrap();
        assert!(har.handle("exportHAR", &json!({})).await.is_err());
    }

    #[tokio::test]
    async fn filename_is_sanitized() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        ctx.bus
            .publish(Arc::new(NetworkCapture::new(&ctx).unwrap()));
        let har = HarExport::new(&ctx).unwrap();
        assert!(har
            .handle("exportHAR", &json!({"filename": "../escape"}))
            .await
            .is_err());
    }
}
