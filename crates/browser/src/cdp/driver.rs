//! Driver-trait implementation on top of the CDP session.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use bd_domain::error::{Error, Result};

use crate::cdp::launch::{self, LaunchedBrowser};
use crate::cdp::session::{CdpConnection, CdpEvent};
use crate::driver::{
    BrowserDriver, BrowserHandle, ConsoleEvent, ConsoleLevel, ContextHandle, ContextOptions,
    LaunchOptions, NetworkEvent, PageHandle, RouteDecider, RouteRequest, WaitUntil,
};

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Settle delay applied after `load` for network-idle waits.
const NETWORK_IDLE_SETTLE: Duration = Duration::from_millis(500);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct CdpDriver;

impl CdpDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserDriver for CdpDriver {
    async fn launch(&self, opts: LaunchOptions) -> Result<Arc<dyn BrowserHandle>> {
        let LaunchedBrowser {
            child,
            ws_url,
            user_data_dir,
        } = launch::spawn_browser(&opts).await?;
        let conn = CdpConnection::connect(&ws_url).await?;
        Ok(Arc::new(CdpBrowser {
            conn,
            child: tokio::sync::Mutex::new(Some(child)),
            user_data_dir,
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Browser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CdpBrowser {
    conn: Arc<CdpConnection>,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
    user_data_dir: PathBuf,
}

#[async_trait]
impl BrowserHandle for CdpBrowser {
    async fn new_context(&self, opts: ContextOptions) -> Result<Arc<dyn ContextHandle>> {
        let result = self
            .conn
            .send("Target.createBrowserContext", json!({}), None)
            .await?;
        let context_id = result
            .get("browserContextId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Driver("createBrowserContext returned no id".into()))?
            .to_string();

        let mut pending_origins = Vec::new();
        if let Some(state) = &opts.storage_state {
            if let Some(cookies) = state.get("cookies").and_then(Value::as_array) {
                if !cookies.is_empty() {
                    self.conn
                        .send(
                            "Storage.setCookies",
                            json!({ "cookies": cookies, "browserContextId": context_id }),
                            None,
                        )
                        .await?;
                }
            }
            if let Some(origins) = state.get("origins").and_then(Value::as_array) {
                pending_origins = origins.to_vec();
            }
        }

        Ok(Arc::new(CdpContext {
            conn: self.conn.clone(),
            context_id,
            opts,
            pages: Mutex::new(Vec::new()),
            route: Arc::new(Mutex::new(None)),
            pending_origins: Arc::new(Mutex::new(pending_origins)),
        }))
    }

    async fn close(&self) -> Result<()> {
        // Polite close first; the kill below covers a wedged browser.
        let _ = self.conn.send("Browser.close", json!({}), None).await;
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
            tracing::debug!(error = %e, "temp profile cleanup failed");
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CdpContext {
    conn: Arc<CdpConnection>,
    context_id: String,
    opts: ContextOptions,
    pages: Mutex<Vec<Arc<CdpPage>>>,
    route: Arc<Mutex<Option<RouteDecider>>>,
    /// Origins from restored storage state, injected into pages as they
    /// navigate to a matching origin.
    pending_origins: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl ContextHandle for CdpContext {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>> {
        let created = self
            .conn
            .send(
                "Target.createTarget",
                json!({ "url": "about:blank", "browserContextId": self.context_id }),
                None,
            )
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Driver("createTarget returned no targetId".into()))?
            .to_string();

        let attached = self
            .conn
            .send(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Driver("attachToTarget returned no sessionId".into()))?
            .to_string();

        let page = Arc::new(CdpPage::new(
            self.conn.clone(),
            target_id,
            session_id,
            self.route.clone(),
            self.pending_origins.clone(),
        ));
        page.init(&self.opts).await?;
        page.clone().spawn_event_pump();

        self.pages.lock().push(page.clone());
        Ok(page)
    }

    async fn pages(&self) -> Vec<Arc<dyn PageHandle>> {
        self.pages
            .lock()
            .iter()
            .filter(|p| !p.closed.load(Ordering::Acquire))
            .map(|p| p.clone() as Arc<dyn PageHandle>)
            .collect()
    }

    async fn storage_state(&self) -> Result<Value> {
        let cookies = self
            .conn
            .send(
                "Storage.getCookies",
                json!({ "browserContextId": self.context_id }),
                None,
            )
            .await?
            .get("cookies")
            .cloned()
            .unwrap_or_else(|| json!([]));

        let mut origins = Vec::new();
        for page in self.pages().await {
            match page
                .evaluate(
                    "(() => { const out = []; \
                     for (let i = 0; i < localStorage.length; i++) { \
                       const k = localStorage.key(i); \
                       out.push({ name: k, value: localStorage.getItem(k) }); } \
                     return { origin: location.origin, localStorage: out }; })()",
                )
                .await
            {
                Ok(origin) if origin.get("origin").is_some() => origins.push(origin),
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "localStorage dump failed"),
            }
        }

        Ok(json!({ "cookies": cookies, "origins": origins }))
    }

    async fn set_route_decider(&self, decider: Option<RouteDecider>) -> Result<()> {
        let enable = decider.is_some();
        *self.route.lock() = decider;
        let pages: Vec<Arc<CdpPage>> = self.pages.lock().clone();
        for page in pages {
            let cmd = if enable { "Fetch.enable" } else { "Fetch.disable" };
            if let Err(e) = self.conn.send(cmd, json!({}), Some(&page.session_id)).await {
                tracing::warn!(error = %e, "toggling request interception failed");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for page in self.pages.lock().drain(..) {
            page.closed.store(true, Ordering::Release);
        }
        self.conn
            .send(
                "Target.disposeBrowserContext",
                json!({ "browserContextId": self.context_id }),
                None,
            )
            .await?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Page
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CdpPage {
    conn: Arc<CdpConnection>,
    target_id: String,
    session_id: String,
    url: Mutex<String>,
    console_tx: broadcast::Sender<ConsoleEvent>,
    network_tx: broadcast::Sender<NetworkEvent>,
    /// requestId → (method, url), for joining responses to requests.
    inflight: Arc<Mutex<HashMap<String, (String, String)>>>,
    route: Arc<Mutex<Option<RouteDecider>>>,
    pending_origins: Arc<Mutex<Vec<Value>>>,
    closed: AtomicBool,
}

impl CdpPage {
    fn new(
        conn: Arc<CdpConnection>,
        target_id: String,
        session_id: String,
        route: Arc<Mutex<Option<RouteDecider>>>,
        pending_origins: Arc<Mutex<Vec<Value>>>,
    ) -> Self {
        let (console_tx, _) = broadcast::channel(1024);
        let (network_tx, _) = broadcast::channel(1024);
        Self {
            conn,
            target_id,
            session_id,
            url: Mutex::new("about:blank".to_string()),
            console_tx,
            network_tx,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            route,
            pending_origins,
            closed: AtomicBool::new(false),
        }
    }

    async fn init(&self, opts: &ContextOptions) -> Result<()> {
        let session = Some(self.session_id.as_str());
        self.conn.send("Page.enable", json!({}), session).await?;
        self.conn.send("Runtime.enable", json!({}), session).await?;
        self.conn.send("Network.enable", json!({}), session).await?;
        self.conn
            .send("Performance.enable", json!({}), session)
            .await?;

        if let Some(viewport) = opts.viewport {
            self.conn
                .send(
                    "Emulation.setDeviceMetricsOverride",
                    json!({
                        "width": viewport.width,
                        "height": viewport.height,
                        "deviceScaleFactor": 1,
                        "mobile": false,
                    }),
                    session,
                )
                .await?;
        }
        if let Some(user_agent) = &opts.user_agent {
            self.conn
                .send(
                    "Network.setUserAgentOverride",
                    json!({ "userAgent": user_agent }),
                    session,
                )
                .await?;
        }
        let route_active = self.route.lock().is_some();
        if route_active {
            self.conn.send("Fetch.enable", json!({}), session).await?;
        }
        Ok(())
    }

    fn spawn_event_pump(self: Arc<Self>) {
        let mut events = self.conn.subscribe_events();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(dropped = n, "page event pump lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if event.session_id.as_deref() != Some(self.session_id.as_str()) {
                    continue;
                }
                if self.closed.load(Ordering::Acquire) {
                    break;
                }
                self.handle_event(event).await;
            }
        });
    }

    async fn handle_event(&self, event: CdpEvent) {
        match event.method.as_str() {
            "Runtime.consoleAPICalled" => {
                let level = match event.params.get("type").and_then(Value::as_str) {
                    Some("error") | Some("assert") => ConsoleLevel::Error,
                    Some("warning") => ConsoleLevel::Warning,
                    Some("info") => ConsoleLevel::Info,
                    Some("debug") => ConsoleLevel::Debug,
                    _ => ConsoleLevel::Log,
                };
                let text = event
                    .params
                    .get("args")
                    .and_then(Value::as_array)
                    .map(|args| {
                        args.iter()
                            .map(|arg| match arg.get("value") {
                                Some(Value::String(s)) => s.clone(),
                                Some(v) => v.to_string(),
                                None => arg
                                    .get("description")
                                    .and_then(Value::as_str)
                                    .unwrap_or("<object>")
                                    .to_string(),
                            })
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_default();
                let _ = self.console_tx.send(ConsoleEvent {
                    level,
                    text,
                    timestamp: Utc::now(),
                });
            }
            "Network.requestWillBeSent" => {
                let request_id = str_field(&event.params, "requestId");
                let method = event.params["request"]["method"]
                    .as_str()
                    .unwrap_or("GET")
                    .to_string();
                let url = event.params["request"]["url"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                self.inflight
                    .lock()
                    .insert(request_id.clone(), (method.clone(), url.clone()));
                let _ = self.network_tx.send(NetworkEvent::RequestWillBeSent {
                    request_id,
                    method,
                    url,
                    timestamp: Utc::now(),
                });
            }
            "Network.responseReceived" => {
                let request_id = str_field(&event.params, "requestId");
                let (method, url) = self
                    .inflight
                    .lock()
                    .remove(&request_id)
                    .unwrap_or_else(|| {
                        (
                            "GET".to_string(),
                            event.params["response"]["url"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string(),
                        )
                    });
                let _ = self.network_tx.send(NetworkEvent::ResponseReceived {
                    request_id,
                    method,
                    url,
                    status: event.params["response"]["status"].as_u64().unwrap_or(0) as u16,
                    mime_type: event.params["response"]["mimeType"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    timestamp: Utc::now(),
                });
            }
            "Page.frameNavigated" => {
                // Top frame only; subframes carry a parentId.
                if event.params["frame"]["parentId"].is_null() {
                    if let Some(url) = event.params["frame"]["url"].as_str() {
                        *self.url.lock() = url.to_string();
                    }
                }
            }
            "Fetch.requestPaused" => {
                self.handle_paused_request(&event.params).await;
            }
            _ => {}
        }
    }

    async fn handle_paused_request(&self, params: &Value) {
        let request_id = str_field(params, "requestId");
        let request = RouteRequest {
            method: params["request"]["method"]
                .as_str()
                .unwrap_or("GET")
                .to_string(),
            url: params["request"]["url"].as_str().unwrap_or_default().to_string(),
        };
        let decision = self.route.lock().clone().and_then(|d| d(&request));
        let session = Some(self.session_id.as_str());

        let outcome = match decision {
            Some(fulfillment) => {
                let body = BASE64.encode(fulfillment.body.to_string());
                let mut headers = vec![json!({
                    "name": "Content-Type",
                    "value": "application/json",
                })];
                for (name, value) in &fulfillment.headers {
                    headers.push(json!({ "name": name, "value": value }));
                }
                self.conn
                    .send(
                        "Fetch.fulfillRequest",
                        json!({
                            "requestId": request_id,
                            "responseCode": fulfillment.status,
                            "responseHeaders": headers,
                            "body": body,
                        }),
                        session,
                    )
                    .await
            }
            None => {
                self.conn
                    .send(
                        "Fetch.continueRequest",
                        json!({ "requestId": request_id }),
                        session,
                    )
                    .await
            }
        };
        if let Err(e) = outcome {
            tracing::warn!(error = %e, url = %request.url, "request interception failed");
        }
    }

    /// Inject restored localStorage entries whose origin matches the
    /// page's current location.
    async fn apply_pending_origins(&self, current_url: &str) {
        let matching: Vec<Value> = {
            let mut pending = self.pending_origins.lock();
            let (take, keep): (Vec<_>, Vec<_>) = pending.drain(..).partition(|entry| {
                entry
                    .get("origin")
                    .and_then(Value::as_str)
                    .map(|origin| current_url.starts_with(origin))
                    .unwrap_or(false)
            });
            *pending = keep;
            take
        };
        for entry in matching {
            let items = match entry.get("localStorage").and_then(Value::as_array) {
                Some(items) => items.clone(),
                None => continue,
            };
            let script = format!(
                "(() => {{ const items = {}; \
                 for (const it of items) localStorage.setItem(it.name, it.value); }})()",
                Value::Array(items)
            );
            if let Err(e) = self.evaluate(&script).await {
                tracing::warn!(error = %e, "restoring localStorage failed");
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Driver("page is closed".into()));
        }
        Ok(())
    }

    /// Evaluate a boolean-returning selector script, translating `false`
    /// into the element-not-found domain error.
    async fn eval_selector_action(&self, selector: &str, script: String) -> Result<()> {
        match self.evaluate(&script).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(Error::Handler(format!("Element not found: {selector}"))),
        }
    }
}

fn str_field(params: &Value, key: &str) -> String {
    params.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

#[async_trait]
impl PageHandle for CdpPage {
    fn id(&self) -> String {
        self.target_id.clone()
    }

    async fn navigate(&self, url: &str, wait: WaitUntil) -> Result<()> {
        self.ensure_open()?;
        let mut events = self.conn.subscribe_events();
        let result = self
            .conn
            .send("Page.navigate", json!({ "url": url }), Some(&self.session_id))
            .await?;
        if let Some(error_text) = result.get("errorText").and_then(Value::as_str) {
            return Err(Error::Driver(format!("navigation failed: {error_text}")));
        }

        let loaded = tokio::time::timeout(NAVIGATION_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(event)
                        if event.method == "Page.loadEventFired"
                            && event.session_id.as_deref() == Some(self.session_id.as_str()) =>
                    {
                        return true;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await;
        match loaded {
            Ok(true) => {}
            Ok(false) => return Err(Error::Driver("CDP connection closed during navigation".into())),
            Err(_) => return Err(Error::Driver(format!("navigation timed out: {url}"))),
        }
        if wait == WaitUntil::NetworkIdle {
            tokio::time::sleep(NETWORK_IDLE_SETTLE).await;
        }

        *self.url.lock() = url.to_string();
        self.apply_pending_origins(url).await;
        Ok(())
    }

    async fn url(&self) -> String {
        self.url.lock().clone()
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.ensure_open()?;
        let sel = serde_json::to_string(selector)?;
        self.eval_selector_action(
            selector,
            format!(
                "(() => {{ const el = document.querySelector({sel}); \
                 if (!el) return false; el.click(); return true; }})()"
            ),
        )
        .await
    }

    async fn dblclick(&self, selector: &str) -> Result<()> {
        self.ensure_open()?;
        let sel = serde_json::to_string(selector)?;
        self.eval_selector_action(
            selector,
            format!(
                "(() => {{ const el = document.querySelector({sel}); \
                 if (!el) return false; \
                 el.dispatchEvent(new MouseEvent('dblclick', {{ bubbles: true }})); \
                 return true; }})()"
            ),
        )
        .await
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        self.ensure_open()?;
        let sel = serde_json::to_string(selector)?;
        let value = serde_json::to_string(text)?;
        self.eval_selector_action(
            selector,
            format!(
                "(() => {{ const el = document.querySelector({sel}); \
                 if (!el) return false; el.focus(); el.value = {value}; \
                 el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
                 el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
                 return true; }})()"
            ),
        )
        .await
    }

    async fn press(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let session = Some(self.session_id.as_str());
        self.conn
            .send(
                "Input.dispatchKeyEvent",
                json!({ "type": "keyDown", "key": key, "text": key }),
                session,
            )
            .await?;
        self.conn
            .send(
                "Input.dispatchKeyEvent",
                json!({ "type": "keyUp", "key": key }),
                session,
            )
            .await?;
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.ensure_open()?;
        let result = self
            .conn
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
                Some(&self.session_id),
            )
            .await?;
        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(Value::as_str)
                .unwrap_or("evaluation threw");
            return Err(Error::Handler(text.to_string()));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn accessibility_snapshot(&self) -> Result<Value> {
        self.ensure_open()?;
        let result = self
            .conn
            .send(
                "Accessibility.getFullAXTree",
                json!({}),
                Some(&self.session_id),
            )
            .await?;
        let nodes = match result.get("nodes").and_then(Value::as_array) {
            Some(nodes) if !nodes.is_empty() => nodes,
            _ => return Ok(Value::Null),
        };
        Ok(normalize_ax_tree(nodes))
    }

    async fn query_selector_exists(&self, selector: &str) -> Result<bool> {
        let sel = serde_json::to_string(selector)?;
        Ok(self
            .evaluate(&format!("document.querySelector({sel}) !== null"))
            .await?
            .as_bool()
            .unwrap_or(false))
    }

    async fn is_visible(&self, selector: &str) -> Result<bool> {
        let sel = serde_json::to_string(selector)?;
        Ok(self
            .evaluate(&format!(
                "(() => {{ const el = document.querySelector({sel}); \
                 if (!el) return false; \
                 const style = getComputedStyle(el); \
                 if (style.display === 'none' || style.visibility === 'hidden') return false; \
                 const rect = el.getBoundingClientRect(); \
                 return rect.width > 0 && rect.height > 0; }})()"
            ))
            .await?
            .as_bool()
            .unwrap_or(false))
    }

    async fn text_content(&self, selector: &str) -> Result<Option<String>> {
        let sel = serde_json::to_string(selector)?;
        let value = self
            .evaluate(&format!(
                "(() => {{ const el = document.querySelector({sel}); \
                 return el ? el.textContent : null; }})()"
            ))
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn screenshot(&self) -> Result<String> {
        self.ensure_open()?;
        let result = self
            .conn
            .send(
                "Page.captureScreenshot",
                json!({ "format": "png" }),
                Some(&self.session_id),
            )
            .await?;
        result
            .get("data")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Driver("captureScreenshot returned no data".into()))
    }

    async fn metrics(&self) -> Result<Value> {
        self.ensure_open()?;
        let result = self
            .conn
            .send("Performance.getMetrics", json!({}), Some(&self.session_id))
            .await?;
        let mut out = serde_json::Map::new();
        if let Some(metrics) = result.get("metrics").and_then(Value::as_array) {
            for metric in metrics {
                if let (Some(name), Some(value)) = (
                    metric.get("name").and_then(Value::as_str),
                    metric.get("value"),
                ) {
                    out.insert(name.to_string(), value.clone());
                }
            }
        }
        Ok(Value::Object(out))
    }

    fn subscribe_console(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.console_tx.subscribe()
    }

    fn subscribe_network(&self) -> broadcast::Receiver<NetworkEvent> {
        self.network_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.conn
            .send(
                "Target.closeTarget",
                json!({ "targetId": self.target_id }),
                None,
            )
            .await?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AX tree normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fold the protocol's flat node list into the `{role, name, children}`
/// tree the snapshot feature consumes. The first non-ignored node is the
/// root.
fn normalize_ax_tree(nodes: &[Value]) -> Value {
    let by_id: HashMap<&str, &Value> = nodes
        .iter()
        .filter_map(|n| n.get("nodeId").and_then(Value::as_str).map(|id| (id, n)))
        .collect();

    fn build(node: &Value, by_id: &HashMap<&str, &Value>) -> Option<Value> {
        if node.get("ignored").and_then(Value::as_bool).unwrap_or(false) {
            // Ignored nodes are transparent: splice their children up.
            let children = collect_children(node, by_id);
            return match children.len() {
                0 => None,
                1 => Some(children.into_iter().next().unwrap_or(Value::Null)),
                _ => Some(json!({ "role": "generic", "name": "", "children": children })),
            };
        }
        let role = node["role"]["value"].as_str().unwrap_or("generic");
        let name = node["name"]["value"].as_str().unwrap_or("");
        let children = collect_children(node, by_id);
        Some(json!({ "role": role, "name": name, "children": children }))
    }

    fn collect_children(node: &Value, by_id: &HashMap<&str, &Value>) -> Vec<Value> {
        node.get("childIds")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .filter_map(|id| by_id.get(id))
                    .filter_map(|child| build(child, by_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    nodes
        .first()
        .and_then(|root| build(root, &by_id))
        .unwrap_or(Value::Null)
}
