//! Event capture and `waitForEvent`.
//!
//! Console and network events are folded into one bounded event log.
//! `waitForEvent` polls that log at 100 ms until a matching event
//! arrives or the timeout expires, in which case it resolves with null.

use std::any::Any;
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

pub const NAME: &str = "events";
pub const COMMANDS: &[&str] = &["waitForEvent", "getEvents", "clearEvents"];

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_WAIT_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    pub event_type: String,
    pub detail: String,
    /// Timestamp of the underlying browser event, not of recording.
    pub timestamp: DateTime<Utc>,
}

pub struct Events {
    ctx: FeatureContext,
    log: Arc<Mutex<RingBuffer<RecordedEvent>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Events {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        let capacity = CapacityBand::EVENTS.clamp(ctx.capture.event_capacity);
        Ok(Self {
            ctx: ctx.clone(),
            log: Arc::new(Mutex::new(RingBuffer::new(capacity)?)),
            pumps: Mutex::new(Vec::new()),
        })
    }

    pub fn record(&self, event: RecordedEvent) {
        self.log.lock().push(event);
    }

    fn find_since(
        &self,
        event_type: &str,
        pattern: Option<&str>,
        since: DateTime<Utc>,
    ) -> Option<RecordedEvent> {
        self.log
            .lock()
            .find(|e| {
                e.event_type == event_type
                    && e.timestamp >= since
                    && pattern.map(|p| e.detail.contains(p)).unwrap_or(true)
            })
            .cloned()
    }
}

#[async_trait]
impl Feature for Events {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn setup(&self) -> Result<()> {
        let page = match self.ctx.page.get() {
            Some(page) => page,
            None => return Ok(()),
        };

        let mut console_rx = page.subscribe_console();
        let log = self.log.clone();
        let console_pump = tokio::spawn(async move {
            while let Ok(event) = console_rx.recv().await {
                log.lock().push(RecordedEvent {
                    event_type: "console".into(),
                    detail: event.text,
                    timestamp: event.timestamp,
                });
            }
        });

        let mut network_rx = page.subscribe_network();
        let log = self.log.clone();
        let network_pump = tokio::spawn(async move {
            while let Ok(event) = network_rx.recv().await {
                let (event_type, detail, timestamp) = match event {
                    NetworkEvent::RequestWillBeSent {
                        method,
                        url,
                        timestamp,
                        ..
                    } => ("request".to_string(), format!("{method} {url}"), timestamp),
                    NetworkEvent::ResponseReceived {
                        method,
                        url,
                        status,
                        timestamp,
                        ..
                    } => (
                        "response".to_string(),
                        format!("{method} {url} {status}"),
                        timestamp,
                    ),
                };
                log.lock().push(RecordedEvent {
                    event_type,
                    detail,
                    timestamp,
                });
            }
        });

        *self.pumps.lock() = vec![console_pump, network_pump];
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }
        Ok(())
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response> {
        match cmd {
            "waitForEvent" => {
                let event_type = args
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Handler("type is required".into()))?
                    .to_string();
                let pattern = args.get("pattern").and_then(Value::as_str).map(str::to_string);
                let timeout_ms = args
                    .get("timeout")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_WAIT_MS);

                let started = Utc::now();
                let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
                loop {
                    if let Some(event) =
                        self.find_since(&event_type, pattern.as_deref(), started)
                    {
                        return Ok(Response::ok(json!({ "event": event })));
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(Response::ok(json!({ "event": Value::Null })));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
            "getEvents" => {
                let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
                let log = self.log.lock();
                Ok(Response::ok(json!({
                    "events": log.last_n(limit),
                    "total": log.len(),
                    "overflow": log.overflow_count(),
                })))
            }
            "clearEvents" => {
                let mut log = self.log.lock();
                let cleared = log.len();
                log.clear();
                Ok(Response::ok(json!({ "cleared": cleared })))
            }
            _ => Err(Error::UnknownCommand(cmd.to_string())),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
