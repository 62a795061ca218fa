//! Driver trait surface consumed by the daemon core.
//!
//! Everything here is object-safe: the lifecycle holds `Arc<dyn ...>`
//! handles and never names a concrete driver.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use bd_domain::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub headless: bool,
    pub executable: Option<String>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordVideoOptions {
    pub dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Viewport>,
}

#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub viewport: Option<Viewport>,
    pub user_agent: Option<String>,
    /// Validated storage state injected at context creation.
    pub storage_state: Option<Value>,
    pub record_video: Option<RecordVideoOptions>,
}

impl ContextOptions {
    /// Overlay `other` onto `self`, keeping existing values where `other`
    /// is silent. Used by context recreation to merge new options into
    /// the ones the context was built with.
    pub fn merged_with(mut self, other: ContextOptions) -> ContextOptions {
        if other.viewport.is_some() {
            self.viewport = other.viewport;
        }
        if other.user_agent.is_some() {
            self.user_agent = other.user_agent;
        }
        if other.storage_state.is_some() {
            self.storage_state = other.storage_state;
        }
        if other.record_video.is_some() {
            self.record_video = other.record_video;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitUntil {
    Load,
    #[default]
    NetworkIdle,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Debug,
    Warning,
    Error,
}

impl ConsoleLevel {
    pub fn is_severe(&self) -> bool {
        matches!(self, ConsoleLevel::Warning | ConsoleLevel::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleEvent {
    pub level: ConsoleLevel,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NetworkEvent {
    #[serde(rename_all = "camelCase")]
    RequestWillBeSent {
        request_id: String,
        method: String,
        url: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ResponseReceived {
        request_id: String,
        method: String,
        url: String,
        status: u16,
        mime_type: String,
        timestamp: DateTime<Utc>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Route interception (network mocking)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub method: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockFulfillment {
    pub status: u16,
    pub body: Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Decides whether an intercepted request is fulfilled with a mock
/// (`Some`) or continues to the network (`None`). The mocking feature
/// installs one of these on the context.
pub type RouteDecider = Arc<dyn Fn(&RouteRequest) -> Option<MockFulfillment> + Send + Sync>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Entry point: launches browsers. One driver serves the whole daemon.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, opts: LaunchOptions) -> Result<Arc<dyn BrowserHandle>>;
}

#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn new_context(&self, opts: ContextOptions) -> Result<Arc<dyn ContextHandle>>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ContextHandle: Send + Sync {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>>;
    /// All open pages, oldest first.
    async fn pages(&self) -> Vec<Arc<dyn PageHandle>>;
    /// Cookies plus per-origin local/session storage, in the shape the
    /// storage validator checks.
    async fn storage_state(&self) -> Result<Value>;
    /// Install (or clear) the mock route decider.
    async fn set_route_decider(&self, decider: Option<RouteDecider>) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PageHandle: Send + Sync {
    fn id(&self) -> String;
    async fn navigate(&self, url: &str, wait: WaitUntil) -> Result<()>;
    async fn url(&self) -> String;
    async fn click(&self, selector: &str) -> Result<()>;
    async fn dblclick(&self, selector: &str) -> Result<()>;
    async fn type_text(&self, selector: &str, text: &str) -> Result<()>;
    async fn press(&self, key: &str) -> Result<()>;
    async fn evaluate(&self, expression: &str) -> Result<Value>;
    /// Raw accessibility tree, or `Value::Null` when the browser returns
    /// nothing (snapshot falls back to DOM traversal in that case).
    async fn accessibility_snapshot(&self) -> Result<Value>;
    async fn query_selector_exists(&self, selector: &str) -> Result<bool>;
    async fn is_visible(&self, selector: &str) -> Result<bool>;
    async fn text_content(&self, selector: &str) -> Result<Option<String>>;
    /// Base64-encoded PNG.
    async fn screenshot(&self) -> Result<String>;
    /// Load/layout metrics as loose JSON.
    async fn metrics(&self) -> Result<Value>;
    fn subscribe_console(&self) -> broadcast::Receiver<ConsoleEvent>;
    fn subscribe_network(&self) -> broadcast::Receiver<NetworkEvent>;
    async fn close(&self) -> Result<()>;
}
