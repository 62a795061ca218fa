//! Deterministic in-memory driver.
//!
//! Used by the integration suites (and anything else that needs a browser
//! that never leaves the process). Tests script it: register selectors,
//! canned evaluate results and an accessibility tree up front, then emit
//! console/network events while the daemon runs against it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use bd_domain::error::{Error, Result};

use crate::driver::{
    BrowserDriver, BrowserHandle, ConsoleEvent, ConsoleLevel, ContextHandle, ContextOptions,
    LaunchOptions, MockFulfillment, NetworkEvent, PageHandle, RouteDecider, RouteRequest,
    WaitUntil,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared scripting state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct SelectorSpec {
    pub visible: bool,
    pub text: Option<String>,
}

#[derive(Default)]
struct StubShared {
    selectors: HashMap<String, SelectorSpec>,
    eval_results: HashMap<String, Value>,
    a11y_tree: Option<Value>,
    storage_state: Option<Value>,
    route_decider: Option<RouteDecider>,
    launch_count: u32,
    last_launch: Option<LaunchOptions>,
    last_context: Option<ContextOptions>,
    navigations: Vec<String>,
    pages: Vec<Arc<StubPage>>,
}

/// Scripting handle shared by the driver and every handle it produces.
#[derive(Clone, Default)]
pub struct StubState {
    inner: Arc<Mutex<StubShared>>,
}

impl StubState {
    pub fn set_selector(&self, selector: &str, spec: SelectorSpec) {
        self.inner
            .lock()
            .selectors
            .insert(selector.to_string(), spec);
    }

    pub fn set_eval_result(&self, expression: &str, result: Value) {
        self.inner
            .lock()
            .eval_results
            .insert(expression.to_string(), result);
    }

    pub fn set_a11y_tree(&self, tree: Value) {
        self.inner.lock().a11y_tree = Some(tree);
    }

    pub fn set_storage_state(&self, state: Value) {
        self.inner.lock().storage_state = Some(state);
    }

    pub fn launch_count(&self) -> u32 {
        self.inner.lock().launch_count
    }

    pub fn last_launch(&self) -> Option<LaunchOptions> {
        self.inner.lock().last_launch.clone()
    }

    pub fn last_context(&self) -> Option<ContextOptions> {
        self.inner.lock().last_context.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.inner.lock().navigations.clone()
    }

    /// Most recently opened page that is still open.
    pub fn current_page(&self) -> Option<Arc<StubPage>> {
        self.inner
            .lock()
            .pages
            .iter()
            .rev()
            .find(|p| !p.closed.load(Ordering::Acquire))
            .cloned()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Driver / browser / context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Default)]
pub struct StubDriver {
    pub state: StubState,
}

impl StubDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BrowserDriver for StubDriver {
    async fn launch(&self, opts: LaunchOptions) -> Result<Arc<dyn BrowserHandle>> {
        let mut shared = self.state.inner.lock();
        shared.launch_count += 1;
        shared.last_launch = Some(opts);
        Ok(Arc::new(StubBrowser {
            state: self.state.clone(),
        }))
    }
}

pub struct StubBrowser {
    state: StubState,
}

#[async_trait]
impl BrowserHandle for StubBrowser {
    async fn new_context(&self, opts: ContextOptions) -> Result<Arc<dyn ContextHandle>> {
        self.state.inner.lock().last_context = Some(opts);
        Ok(Arc::new(StubContext {
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut shared = self.state.inner.lock();
        for page in shared.pages.drain(..) {
            page.closed.store(true, Ordering::Release);
        }
        shared.route_decider = None;
        Ok(())
    }
}

pub struct StubContext {
    state: StubState,
}

#[async_trait]
impl ContextHandle for StubContext {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>> {
        let page = Arc::new(StubPage::new(self.state.clone()));
        self.state.inner.lock().pages.push(page.clone());
        Ok(page)
    }

    async fn pages(&self) -> Vec<Arc<dyn PageHandle>> {
        self.state
            .inner
            .lock()
            .pages
            .iter()
            .filter(|p| !p.closed.load(Ordering::Acquire))
            .map(|p| p.clone() as Arc<dyn PageHandle>)
            .collect()
    }

    async fn storage_state(&self) -> Result<Value> {
        Ok(self
            .state
            .inner
            .lock()
            .storage_state
            .clone()
            .unwrap_or_else(|| json!({"cookies": [], "origins": []})))
    }

    async fn set_route_decider(&self, decider: Option<RouteDecider>) -> Result<()> {
        self.state.inner.lock().route_decider = decider;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut shared = self.state.inner.lock();
        for page in shared.pages.drain(..) {
            page.closed.store(true, Ordering::Release);
        }
        shared.route_decider = None;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Page
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct StubPage {
    id: String,
    state: StubState,
    url: Mutex<String>,
    console_tx: broadcast::Sender<ConsoleEvent>,
    network_tx: broadcast::Sender<NetworkEvent>,
    closed: AtomicBool,
}

impl StubPage {
    fn new(state: StubState) -> Self {
        let (console_tx, _) = broadcast::channel(256);
        let (network_tx, _) = broadcast::channel(256);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state,
            url: Mutex::new("about:blank".to_string()),
            console_tx,
            network_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Script a console message from "the page".
    pub fn emit_console(&self, level: ConsoleLevel, text: &str) {
        let _ = self.console_tx.send(ConsoleEvent {
            level,
            text: text.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Script a network exchange. Routes through the installed mock
    /// decider first; returns the fulfillment when one was applied.
    pub fn simulate_request(
        &self,
        method: &str,
        url: &str,
        real_status: u16,
    ) -> Option<MockFulfillment> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let _ = self.network_tx.send(NetworkEvent::RequestWillBeSent {
            request_id: request_id.clone(),
            method: method.to_string(),
            url: url.to_string(),
            timestamp: Utc::now(),
        });

        let decider = self.state.inner.lock().route_decider.clone();
        let fulfillment = decider.and_then(|d| {
            d(&RouteRequest {
                method: method.to_string(),
                url: url.to_string(),
            })
        });

        let status = fulfillment.as_ref().map(|f| f.status).unwrap_or(real_status);
        let _ = self.network_tx.send(NetworkEvent::ResponseReceived {
            request_id,
            method: method.to_string(),
            url: url.to_string(),
            status,
            mime_type: "application/json".to_string(),
            timestamp: Utc::now(),
        });
        fulfillment
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Driver("page is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PageHandle for StubPage {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn navigate(&self, url: &str, _wait: WaitUntil) -> Result<()> {
        self.ensure_open()?;
        *self.url.lock() = url.to_string();
        self.state.inner.lock().navigations.push(url.to_string());
        Ok(())
    }

    async fn url(&self) -> String {
        self.url.lock().clone()
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.ensure_open()?;
        let known = self.state.inner.lock().selectors.contains_key(selector);
        if !known {
            return Err(Error::Handler(format!("Element not found: {selector}")));
        }
        Ok(())
    }

    async fn dblclick(&self, selector: &str) -> Result<()> {
        self.click(selector).await
    }

    async fn type_text(&self, selector: &str, _text: &str) -> Result<()> {
        self.click(selector).await
    }

    async fn press(&self, _key: &str) -> Result<()> {
        self.ensure_open()
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.ensure_open()?;
        Ok(self
            .state
            .inner
            .lock()
            .eval_results
            .get(expression)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn accessibility_snapshot(&self) -> Result<Value> {
        self.ensure_open()?;
        Ok(self
            .state
            .inner
            .lock()
            .a11y_tree
            .clone()
            .unwrap_or(Value::Null))
    }

    async fn query_selector_exists(&self, selector: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.state.inner.lock().selectors.contains_key(selector))
    }

    async fn is_visible(&self, selector: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self
            .state
            .inner
            .lock()
            .selectors
            .get(selector)
            .map(|s| s.visible)
            .unwrap_or(false))
    }

    async fn text_content(&self, selector: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self
            .state
            .inner
            .lock()
            .selectors
            .get(selector)
            .and_then(|s| s.text.clone()))
    }

    async fn screenshot(&self) -> Result<String> {
        self.ensure_open()?;
        // 1x1 transparent PNG.
        Ok("iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk\
            YPhfDwAChwGA60e6kgAAAABJRU5ErkJggg=="
            .to_string())
    }

    async fn metrics(&self) -> Result<Value> {
        self.ensure_open()?;
        Ok(json!({
            "documents": 1,
            "nodes": 42,
            "jsHeapUsedSize": 1_048_576,
            "url": self.url.lock().clone(),
        }))
    }

    fn subscribe_console(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.console_tx.subscribe()
    }

    fn subscribe_network(&self) -> broadcast::Receiver<NetworkEvent> {
        self.network_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn launch_context_page_round_trip() {
        let driver = StubDriver::new();
        let browser = driver.launch(LaunchOptions::default()).await.unwrap();
        let context = browser.new_context(ContextOptions::default()).await.unwrap();
        let page = context.new_page().await.unwrap();

        page.navigate("http://localhost:3000", WaitUntil::NetworkIdle)
            .await
            .unwrap();
        assert_eq!(page.url().await, "http://localhost:3000");
        assert_eq!(driver.state.navigations(), vec!["http://localhost:3000"]);
    }

    #[tokio::test]
    async fn click_unknown_selector_fails() {
        let driver = StubDriver::new();
        let browser = driver.launch(LaunchOptions::default()).await.unwrap();
        let context = browser.new_context(ContextOptions::default()).await.unwrap();
        let page = context.new_page().await.unwrap();

        assert!(page.click("#missing").await.is_err());
        driver.state.set_selector("#submit", SelectorSpec {
            visible: true,
            text: Some("Submit".into()),
        });
        assert!(page.click("#submit").await.is_ok());
        assert!(page.is_visible("#submit").await.unwrap());
    }

    #[tokio::test]
    async fn console_events_reach_subscribers() {
        let driver = StubDriver::new();
        let browser = driver.launch(LaunchOptions::default()).await.unwrap();
        let context = browser.new_context(ContextOptions::default()).await.unwrap();
        let _page = context.new_page().await.unwrap();

        let page = driver.state.current_page().unwrap();
        let mut rx = page.subscribe_console();
        page.emit_console(ConsoleLevel::Error, "boom");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.level, ConsoleLevel::Error);
        assert_eq!(event.text, "boom");
    }

    #[tokio::test]
    async fn route_decider_intercepts_simulated_requests() {
        let driver = StubDriver::new();
        let browser = driver.launch(LaunchOptions::default()).await.unwrap();
        let context = browser.new_context(ContextOptions::default()).await.unwrap();
        let _page = context.new_page().await.unwrap();

        context
            .set_route_decider(Some(Arc::new(|req: &RouteRequest| {
                (req.url.ends_with("/api/users")).then(|| MockFulfillment {
                    status: 200,
                    body: json!([{"id": 1}]),
                    headers: Default::default(),
                })
            })))
            .await
            .unwrap();

        let page = driver.state.current_page().unwrap();
        assert!(page.simulate_request("GET", "http://x/api/users", 500).is_some());
        assert!(page.simulate_request("GET", "http://x/other", 200).is_none());
    }
}
