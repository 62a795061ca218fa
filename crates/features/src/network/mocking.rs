//! Network mocking.
//!
//! Mocks live in a registry keyed `METHOD:url`. The feature installs a
//! route decider on the context; intercepted requests matching an
//! enabled mock are fulfilled with its JSON response, everything else
//! continues to the network. Registering over an existing key
//! overwrites it with a warning, and every registry change lands in a
//! bounded history.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use bd_browser::driver::{ContextHandle, MockFulfillment, RouteRequest};
use bd_domain::error::{Error, Result};
use bd_domain::response::Response;
use bd_ring::RingBuffer;

use crate::{Feature, FeatureContext, MockValidator};

pub const NAME: &str = "networkMocking";
pub const COMMANDS: &[&str] = &[
    "setupNetworkMocking",
    "mockRoute",
    "listMocks",
    "enableMock",
    "disableMock",
    "clearMocks",
];

const HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MockEntry {
    pub method: String,
    pub url: String,
    pub response: Value,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MockAction {
    Create,
    Overwrite,
    Clear,
    Enable,
    Disable,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MockHistoryEntry {
    pub action: MockAction,
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

fn mock_key(method: &str, url: &str) -> String {
    format!("{}:{}", method.to_uppercase(), url)
}

pub struct NetworkMocking {
    ctx: FeatureContext,
    registry: Arc<Mutex<HashMap<String, MockEntry>>>,
    history: Mutex<RingBuffer<MockHistoryEntry>>,
    validator: Arc<dyn MockValidator>,
}

impl NetworkMocking {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            registry: Arc::new(Mutex::new(HashMap::new())),
            history: Mutex::new(RingBuffer::new(HISTORY_CAPACITY)?),
            validator: ctx.mock_validator.clone(),
        })
    }

    fn record(&self, action: MockAction, key: &str) {
        self.history.lock().push(MockHistoryEntry {
            action,
            key: key.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn history(&self) -> Vec<MockHistoryEntry> {
        self.history.lock().to_vec()
    }

    /// Install the route decider on the current context. Idempotent.
    async fn install_decider(&self) -> Result<()> {
        let context = self
            .ctx
            .context
            .get()
            .ok_or_else(|| Error::Handler("no browser context - run start first".into()))?;
        let registry = self.registry.clone();
        context
            .set_route_decider(Some(Arc::new(move |req: &RouteRequest| {
                let registry = registry.lock();
                registry
                    .get(&mock_key(&req.method, &req.url))
                    .filter(|mock| mock.enabled)
                    .map(|mock| MockFulfillment {
                        status: mock.status,
                        body: mock.response.clone(),
                        headers: HashMap::new(),
                    })
            })))
            .await
    }

    fn require_key(args: &Value) -> Result<(String, String)> {
        let method = args
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Handler("url is required".into()))?
            .to_string();
        Ok((method, url))
    }

    fn set_enabled(&self, args: &Value, enabled: bool) -> Result<Response> {
        let (method, url) = Self::require_key(args)?;
        let key = mock_key(&method, &url);
        let mut registry = self.registry.lock();
        let mock = registry
            .get_mut(&key)
            .ok_or_else(|| Error::Handler(format!("no mock registered for {key}")))?;
        mock.enabled = enabled;
        drop(registry);
        self.record(
            if enabled {
                MockAction::Enable
            } else {
                MockAction::Disable
            },
            &key,
        );
        Ok(Response::ok(json!({ "key": key, "enabled": enabled })))
    }
}

#[async_trait]
impl Feature for NetworkMocking {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn setup(&self) -> Result<()> {
        // Context may not exist yet when the feature is probed early;
        // the decider is (re)installed by setupNetworkMocking.
        if self.ctx.context.get().is_some() {
            self.install_decider().await?;
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        if let Some(context) = self.ctx.context.get() {
            if let Err(e) = context.set_route_decider(None).await {
                tracing::warn!(error = %e, "removing route decider failed");
            }
        }
        Ok(())
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response> {
        match cmd {
            "setupNetworkMocking" => {
                self.install_decider().await?;
                Ok(Response::ok(json!({ "enabled": true })))
            }
            "mockRoute" => {
                let (method, url) = Self::require_key(args)?;
                let response = args
                    .get("response")
                    .cloned()
                    .ok_or_else(|| Error::Handler("response is required".into()))?;
                let status = args.get("status").and_then(Value::as_u64).unwrap_or(200) as u16;
                let schema = args.get("schema").cloned();

                if let Some(schema) = &schema {
                    if let Err(reason) = self.validator.validate(&response, schema) {
                        return Err(Error::Handler(format!(
                            "mock response does not match schema: {reason}"
                        )));
                    }
                }

                let key = mock_key(&method, &url);
                let entry = MockEntry {
                    method,
                    url,
                    response,
                    status,
                    schema,
                    enabled: true,
                    created_at: Utc::now(),
                };
                let overwritten = self.registry.lock().insert(key.clone(), entry).is_some();
                if overwritten {
                    tracing::warn!(key = %key, "overwriting existing mock");
                    self.record(MockAction::Overwrite, &key);
                } else {
                    self.record(MockAction::Create, &key);
                }
                Ok(Response::ok(json!({ "key": key, "overwritten": overwritten })))
            }
            "listMocks" => {
                let registry = self.registry.lock();
                let mut mocks: Vec<&MockEntry> = registry.values().collect();
                mocks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                Ok(Response::ok(json!({ "mocks": mocks })))
            }
            "enableMock" => self.set_enabled(args, true),
            "disableMock" => self.set_enabled(args, false),
            "clearMocks" => {
                let cleared = {
                    let mut registry = self.registry.lock();
                    let n = registry.len();
                    registry.clear();
                    n
                };
                self.record(MockAction::Clear, "*");
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
    use bd_browser::driver::{BrowserDriver, BrowserHandle, ContextHandle, ContextOptions, LaunchOptions};
    use bd_browser::stub::StubDriver;
    use std::path::PathBuf;

    async fn setup() -> (StubDriver, NetworkMocking) {
        let driver = StubDriver::new();
        let ctx = FeatureContext::new(PathBuf::from("."), Default::default(), Default::default());
        let browser = driver.launch(LaunchOptions::default()).await.unwrap();
        let context = browser.new_context(ContextOptions::default()).await.unwrap();
        let page = context.new_page().await.unwrap();
        ctx.context.set(Some(context));
        ctx.page.set(Some(page));
        let mocking = NetworkMocking::new(&ctx).unwrap();
        (driver, mocking)
    }

    #[tokio::test]
    async fn setup_then_list_is_empty() {
        let (_driver, mocking) = setup().await;
        let resp = mocking.handle("setupNetworkMocking", &json!({})).await.unwrap();
        assert_eq!(resp.data.unwrap()["enabled"], true);

        let resp = mocking.handle("listMocks", &json!({})).await.unwrap();
        assert_eq!(resp.data.unwrap()["mocks"], json!([]));
    }

    #[tokio::test]
    async fn enabled_mock_fulfills_matching_request() {
        let (driver, mocking) = setup().await;
        mocking.handle("setupNetworkMocking", &json!({})).await.unwrap();
        mocking
            .handle(
                "mockRoute",
                &json!({"method": "GET", "url": "http://x/api/users",
                        "response": [{"id": 1}], "status": 200}),
            )
            .await
            .unwrap();

        let page = driver.state.current_page().unwrap();
        let hit = page.simulate_request("GET", "http://x/api/users", 500);
        assert_eq!(hit.unwrap().body, json!([{"id": 1}]));
        assert!(page.simulate_request("GET", "http://x/other", 200).is_none());
    }

    #[tokio::test]
    async fn disable_enable_round_trip() {
        let (driver, mocking) = setup().await;
        mocking.handle("setupNetworkMocking", &json!({})).await.unwrap();
        let args = json!({"method": "GET", "url": "http://x/api"});
        mocking
            .handle("mockRoute", &json!({"method": "GET", "url": "http://x/api", "response": {}}))
            .await
            .unwrap();

        mocking.handle("disableMock", &args).await.unwrap();
        let page = driver.state.current_page().unwrap();
        assert!(page.simulate_request("GET", "http://x/api", 200).is_none());

        mocking.handle("enableMock", &args).await.unwrap();
        assert!(page.simulate_request("GET", "http://x/api", 200).is_some());
    }

    #[tokio::test]
    async fn overwrite_is_flagged_and_recorded() {
        let (_driver, mocking) = setup().await;
        let args = json!({"method": "GET", "url": "http://x/api", "response": {"v": 1}});
        let first = mocking.handle("mockRoute", &args).await.unwrap();
        assert_eq!(first.data.unwrap()["overwritten"], false);

        let second = mocking.handle("mockRoute", &args).await.unwrap();
        assert_eq!(second.data.unwrap()["overwritten"], true);

        let actions: Vec<MockAction> =
            mocking.history().into_iter().map(|h| h.action).collect();
        assert_eq!(actions, vec![MockAction::Create, MockAction::Overwrite]);
    }

    #[tokio::test]
    async fn clear_mocks_empties_registry() {
        let (_driver, mocking) = setup().await;
        mocking
            .handle("mockRoute", &json!({"method": "GET", "url": "http://x/a", "response": {}}))
            .await
            .unwrap();
        mocking.handle("clearMocks", &json!({})).await.unwrap();
        let resp = mocking.handle("listMocks", &json!({})).await.unwrap();
        assert_eq!(resp.data.unwrap()["mocks"], json!([]));
    }

    #[tokio::test]
    async fn schema_mismatch_rejects_mock() {
        let (_driver, mocking) = setup().await;
        let result = mocking
            .handle(
                "mockRoute",
                &json!({"method": "GET", "url": "http://x/api",
                        "response": {"id": "one"},
                        "schema": {"id": "number"}}),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn toggling_unknown_mock_fails() {
        let (_driver, mocking) = setup().await;
        assert!(mocking
            .handle("disableMock", &json!({"method": "GET", "url": "http://none"}))
            .await
            .is_err());
    }
}
