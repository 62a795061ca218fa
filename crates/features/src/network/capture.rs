//! Network capture.
//!
//! Requests go into a pending map keyed `METHOD:url` so the matching
//! response is joined in O(1). Completed exchanges land in the ring
//! buffer; pending entries that never saw a response are swept once
//! they go stale.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use bd_browser::driver::{NetworkEvent, PageHandle};
use bd_domain::config::CapacityBand;
use bd_domain::error::{Error, Result};
use bd_domain::response::Response;
use bd_ring::RingBuffer;

use crate::{Feature, FeatureContext};

pub const NAME: &str = "networkCapture";
pub const COMMANDS: &[&str] = &[
    "setupNetworkCapture",
    "listNetworkRequests",
    "clearNetworkCapture",
];

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const STALE_AFTER: chrono::Duration = chrono::Duration::seconds(60);

#[derive(Debug, Clone)]
struct PendingRequest {
    request_id: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedRequest {
    pub method: String,
    pub url: String,
    pub status: u16,
    pub mime_type: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

struct CaptureStore {
    pending: HashMap<String, PendingRequest>,
    completed: RingBuffer<CapturedRequest>,
}

pub struct NetworkCapture {
    ctx: FeatureContext,
    store: Arc<Mutex<CaptureStore>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn pending_key(method: &str, url: &str) -> String {
    format!("{}:{}", method.to_uppercase(), url)
}

impl NetworkCapture {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        let capacity = CapacityBand::NETWORK.clamp(ctx.capture.network_capacity);
        Ok(Self {
            ctx: ctx.clone(),
            store: Arc::new(Mutex::new(CaptureStore {
                pending: HashMap::new(),
                completed: RingBuffer::new(capacity)?,
            })),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn completed(&self) -> Vec<CapturedRequest> {
        self.store.lock().completed.to_vec()
    }

    pub fn pending_count(&self) -> usize {
        self.store.lock().pending.len()
    }

    /// Most recent completed exchange for `METHOD url`, if any.
    pub fn find_completed(&self, method: &str, url: &str) -> Option<CapturedRequest> {
        let method = method.to_uppercase();
        let store = self.store.lock();
        store
            .completed
            .filter_items(|r| r.method == method && r.url == url)
            .into_iter()
            .next_back()
    }

    /// Feed one event through the capture path. The pump task calls
    /// this; tests may call it directly.
    pub(crate) fn ingest_event(&self, event: NetworkEvent) {
        Self::ingest(&self.store, event);
    }

    fn ingest(store: &Mutex<CaptureStore>, event: NetworkEvent) {
        match event {
            NetworkEvent::RequestWillBeSent {
                request_id,
                method,
                url,
                timestamp,
            } => {
                store.lock().pending.insert(
                    pending_key(&method, &url),
                    PendingRequest {
                        request_id,
                        started_at: timestamp,
                    },
                );
            }
            NetworkEvent::ResponseReceived {
                method,
                url,
                status,
                mime_type,
                timestamp,
                ..
            } => {
                let mut store = store.lock();
                let started_at = store
                    .pending
                    .remove(&pending_key(&method, &url))
                    .map(|p| p.started_at)
                    .unwrap_or(timestamp);
                store.completed.push(CapturedRequest {
                    method: method.to_uppercase(),
                    url,
                    status,
                    mime_type,
                    started_at,
                    completed_at: timestamp,
                    duration_ms: (timestamp - started_at).num_milliseconds(),
                });
            }
        }
    }

    fn sweep(store: &Mutex<CaptureStore>) -> usize {
        let cutoff = Utc::now() - STALE_AFTER;
        let mut store = store.lock();
        let before = store.pending.len();
        store.pending.retain(|_, p| p.started_at >= cutoff);
        let removed = before - store.pending.len();
        if removed > 0 {
            tracing::debug!(removed, "swept stale pending requests");
        }
        removed
    }
}

#[async_trait]
impl Feature for NetworkCapture {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn setup(&self) -> Result<()> {
        if let Some(page) = self.ctx.page.get() {
            let mut rx = page.subscribe_network();
            let store = self.store.clone();
            let pump = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => NetworkCapture::ingest(&store, event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(dropped = n, "network capture lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            self.tasks.lock().push(pump);
        }

        let store = self.store.clone();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                NetworkCapture::sweep(&store);
            }
        });
        self.tasks.lock().push(sweeper);
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response> {
        match cmd {
            "setupNetworkCapture" => Ok(Response::ok(json!({ "enabled": true }))),
            "listNetworkRequests" => {
                let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
                let store = self.store.lock();
                Ok(Response::ok(json!({
                    "requests": store.completed.last_n(limit),
                    "total": store.completed.len(),
                    "pending": store.pending.len(),
                    "overflow": store.completed.overflow_count(),
                })))
            }
            "clearNetworkCapture" => {
                let mut store = self.store.lock();
                let cleared = store.completed.len();
                store.completed.clear();
                store.pending.clear();
                Ok(Response::ok(json!({ "cleared": cleared })))
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

    fn make() -> NetworkCapture {
        let ctx = FeatureContext::new(PathBuf::from("."), Default::default(), Default::default());
        NetworkCapture::new(&ctx).unwrap()
    }

    fn request(method: &str, url: &str) -> NetworkEvent {
        NetworkEvent::RequestWillBeSent {
            request_id: "r1".into(),
            method: method.into(),
            url: url.into(),
            timestamp: Utc::now(),
        }
    }

    fn response(method: &str, url: &str, status: u16) -> NetworkEvent {
        NetworkEvent::ResponseReceived {
            request_id: "r1".into(),
            method: method.into(),
            url: url.into(),
            status,
            mime_type: "application/json".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn request_response_pair_completes() {
        let capture = make();
        capture.ingest_event(request("get", "http://x/api"));
        assert_eq!(capture.pending_count(), 1);
        capture.ingest_event(response("get", "http://x/api", 200));
        assert_eq!(capture.pending_count(), 0);

        let completed = capture.completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].method, "GET");
        assert_eq!(completed[0].status, 200);
        assert!(completed[0].duration_ms >= 0);
    }

    #[tokio::test]
    async fn find_completed_matches_method_and_url() {
        let capture = make();
        capture.ingest_event(request("GET", "http://x/a"));
        capture.ingest_event(response("GET", "http://x/a", 404));

        assert_eq!(capture.find_completed("get", "http://x/a").unwrap().status, 404);
        assert!(capture.find_completed("POST", "http://x/a").is_none());
        assert!(capture.find_completed("GET", "http://x/b").is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_pending() {
        let capture = make();
        capture.store.lock().pending.insert(
            pending_key("GET", "http://x/stale"),
            PendingRequest {
                request_id: "old".into(),
                started_at: Utc::now() - chrono::Duration::seconds(120),
            },
        );
        capture.ingest_event(request("GET", "http://x/fresh"));

        let removed = NetworkCapture::sweep(&capture.store);
        assert_eq!(removed, 1);
        assert_eq!(capture.pending_count(), 1);
    }

    #[tokio::test]
    async fn list_and_clear_commands() {
        let capture = make();
        capture.ingest_event(request("GET", "http://x/a"));
        capture.ingest_event(response("GET", "http://x/a", 200));

        let resp = capture.handle("listNetworkRequests", &json!({})).await.unwrap();
        assert_eq!(resp.data.unwrap()["total"], 1);

        capture.handle("clearNetworkCapture", &json!({})).await.unwrap();
        let resp = capture.handle("listNetworkRequests", &json!({})).await.unwrap();
        assert_eq!(resp.data.unwrap()["total"], 0);
    }
}
