//! Console capture.
//!
//! Hooks the page's console event stream into a bounded ring buffer.
//! When overflow discards an error or warning, a secondary counter
//! records the loss so operators can detect capture gaps.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use bd_browser::driver::{ConsoleEvent, PageHandle};
use bd_domain::config::CapacityBand;
use bd_domain::error::{Error, Result};
use bd_domain::response::Response;
use bd_ring::RingBuffer;

use crate::{Feature, FeatureContext};

pub const NAME: &str = "console";
pub const COMMANDS: &[&str] = &["getConsole", "clearConsole", "setConsoleBufferCapacity"];

struct ConsoleStore {
    buffer: RingBuffer<ConsoleEvent>,
    /// Errors/warnings lost to overflow since the last clear.
    discarded_severe: u64,
}

pub struct ConsoleCapture {
    ctx: FeatureContext,
    store: Arc<Mutex<ConsoleStore>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ConsoleCapture {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        let capacity = CapacityBand::CONSOLE.clamp(ctx.capture.console_capacity);
        Ok(Self {
            ctx: ctx.clone(),
            store: Arc::new(Mutex::new(ConsoleStore {
                buffer: RingBuffer::new(capacity)?,
                discarded_severe: 0,
            })),
            pump: Mutex::new(None),
        })
    }

    /// Last `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ConsoleEvent> {
        self.store.lock().buffer.last_n(n)
    }

    pub fn all(&self) -> Vec<ConsoleEvent> {
        self.store.lock().buffer.to_vec()
    }

    pub fn discarded_severe(&self) -> u64 {
        self.store.lock().discarded_severe
    }

    fn push(store: &Mutex<ConsoleStore>, event: ConsoleEvent) {
        let mut store = store.lock();
        if let Some(evicted) = store.buffer.push(event) {
            if evicted.level.is_severe() {
                store.discarded_severe += 1;
            }
        }
    }
}

#[async_trait]
impl Feature for ConsoleCapture {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn setup(&self) -> Result<()> {
        let page = match self.ctx.page.get() {
            Some(page) => page,
            None => return Ok(()), // no page yet; nothing to capture
        };
        let mut rx = page.subscribe_console();
        let store = self.store.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => ConsoleCapture::push(&store, event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(dropped = n, "console capture lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.pump.lock() = Some(handle);
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response> {
        match cmd {
            "getConsole" => {
                let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
                let store = self.store.lock();
                Ok(Response::ok(json!({
                    "messages": store.buffer.last_n(limit),
                    "total": store.buffer.len(),
                    "overflow": store.buffer.overflow_count(),
                    "discardedErrors": store.discarded_severe,
                })))
            }
            "clearConsole" => {
                let mut store = self.store.lock();
                let cleared = store.buffer.len();
                store.buffer.clear();
                store.discarded_severe = 0;
                Ok(Response::ok(json!({ "cleared": cleared })))
            }
            "setConsoleBufferCapacity" => {
                let requested = args
                    .get("capacity")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::Handler("capacity is required".into()))?
                    as usize;
                let capacity = CapacityBand::CONSOLE.clamp(requested);
                let mut store = self.store.lock();
                store.buffer.set_capacity(capacity)?;
                store.discarded_severe = 0;
                Ok(Response::ok(json!({
                    "capacity": capacity,
                    "retained": store.buffer.len(),
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
    use bd_browser::driver::ConsoleLevel;
    use chrono::Utc;
    use std::path::PathBuf;

    fn ctx() -> FeatureContext {
        FeatureContext::new(PathBuf::from("."), Default::default(), Default::default())
    }

    fn event(level: ConsoleLevel, text: &str) -> ConsoleEvent {
        ConsoleEvent {
            level,
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn get_console_returns_newest_messages() {
        let console = ConsoleCapture::new(&ctx()).unwrap();
        for i in 0..5 {
            ConsoleCapture::push(&console.store, event(ConsoleLevel::Log, &format!("m{i}")));
        }
        let resp = console
            .handle("getConsole", &json!({"limit": 2}))
            .await
            .unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data["messages"][0]["text"], "m3");
        assert_eq!(data["messages"][1]["text"], "m4");
        assert_eq!(data["total"], 5);
    }

    #[tokio::test]
    async fn discarded_severe_counter_tracks_lost_errors() {
        let mut ctx = ctx();
        ctx.capture.console_capacity = 10; // band minimum
        let console = ConsoleCapture::new(&ctx).unwrap();
        for i in 0..10 {
            ConsoleCapture::push(&console.store, event(ConsoleLevel::Error, &format!("e{i}")));
        }
        assert_eq!(console.discarded_severe(), 0);
        // Next pushes evict errors.
        ConsoleCapture::push(&console.store, event(ConsoleLevel::Log, "extra"));
        ConsoleCapture::push(&console.store, event(ConsoleLevel::Log, "extra2"));
        assert_eq!(console.discarded_severe(), 2);
    }

    #[tokio::test]
    async fn capacity_clamps_into_band_and_keeps_newest() {
        let console = ConsoleCapture::new(&ctx()).unwrap();
        for i in 0..50 {
            ConsoleCapture::push(&console.store, event(ConsoleLevel::Log, &format!("m{i}")));
        }
        let resp = console
            .handle("setConsoleBufferCapacity", &json!({"capacity": 3}))
            .await
            .unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data["capacity"], 10); // clamped up to the band minimum
        assert_eq!(data["retained"], 10);
        let kept = console.all();
        assert_eq!(kept.last().unwrap().text, "m49");
        assert_eq!(kept.first().unwrap().text, "m40");
    }

    #[tokio::test]
    async fn capacity_clamps_large_values_down() {
        let console = ConsoleCapture::new(&ctx()).unwrap();
        let resp = console
            .handle("setConsoleBufferCapacity", &json!({"capacity": 100000}))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap()["capacity"], 1000);
    }

    #[tokio::test]
    async fn clear_resets_counters() {
        let console = ConsoleCapture::new(&ctx()).unwrap();
        ConsoleCapture::push(&console.store, event(ConsoleLevel::Error, "x"));
        console.handle("clearConsole", &json!({})).await.unwrap();
        assert!(console.all().is_empty());
        assert_eq!(console.discarded_severe(), 0);
    }
}
