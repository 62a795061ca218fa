//! Core page actions: navigation, clicking, typing, evaluation.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use bd_browser::driver::{PageHandle, WaitUntil};
use bd_domain::error::{Error, Result};
use bd_domain::response::Response;

use crate::plugins_bridge::PluginsFeature;
use crate::snapshot::Snapshot;
use crate::tracking::StateTracking;
use crate::{Feature, FeatureContext};

pub const NAME: &str = "coreActions";
pub const COMMANDS: &[&str] = &[
    "navigate",
    "click",
    "dblclick",
    "type",
    "press",
    "evaluate",
    "screenshot",
];

pub struct CoreActions {
    ctx: FeatureContext,
}

impl CoreActions {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        Ok(Self { ctx: ctx.clone() })
    }

    fn page(&self) -> Result<Arc<dyn PageHandle>> {
        self.ctx
            .page
            .get()
            .ok_or_else(|| Error::Handler("no page open - run start first".into()))
    }

    /// Resolve the target of a selector-taking command: an explicit
    /// `selector`, or a `ref` from the most recent snapshot.
    fn resolve_target(&self, args: &Value) -> Result<String> {
        if let Some(selector) = args.get("selector").and_then(Value::as_str) {
            return Ok(selector.to_string());
        }
        let reference = args
            .get("ref")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Handler("selector or ref is required".into()))?;

        let snapshot = self
            .ctx
            .bus
            .get_as::<Snapshot>(crate::snapshot::NAME)
            .ok_or_else(|| Error::Handler("snapshot feature unavailable".into()))?;
        let data = snapshot.resolve_ref(reference).ok_or_else(|| {
            Error::Handler(format!(
                "Unknown ref: {reference} (refs are invalidated by each new snapshot)"
            ))
        })?;
        data.css_selector.ok_or_else(|| {
            Error::Handler(format!(
                "Ref {reference} ({} #{}) has no resolvable selector",
                data.role, data.role_index
            ))
        })
    }

    fn record_action(&self, description: String) {
        if let Some(tracking) = self.ctx.bus.get_as::<StateTracking>(crate::tracking::NAME) {
            tracking.record_action(&description);
        }
    }

    fn record_navigation(&self, url: &str) {
        if let Some(tracking) = self.ctx.bus.get_as::<StateTracking>(crate::tracking::NAME) {
            tracking.record_navigation(url);
        }
    }

    fn fire_on_navigate(&self, url: String) {
        if let Some(plugins) = self.ctx.bus.get_as::<PluginsFeature>(crate::plugins_bridge::NAME)
        {
            tokio::spawn(async move {
                plugins.fire_on_navigate(&url).await;
            });
        }
    }
}

#[async_trait]
impl Feature for CoreActions {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response> {
        match cmd {
            "navigate" => {
                let url = args
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Handler("url is required".into()))?;
                let page = self.page()?;
                page.navigate(url, WaitUntil::NetworkIdle).await?;
                self.record_navigation(url);
                self.fire_on_navigate(url.to_string());
                Ok(Response::ok(json!({ "url": url })))
            }
            "click" => {
                let target = self.resolve_target(args)?;
                self.page()?.click(&target).await?;
                self.record_action(format!("click {target}"));
                Ok(Response::ok(json!({ "clicked": target })))
            }
            "dblclick" => {
                let target = self.resolve_target(args)?;
                self.page()?.dblclick(&target).await?;
                self.record_action(format!("dblclick {target}"));
                Ok(Response::ok(json!({ "clicked": target, "double": true })))
            }
            "type" => {
                let target = self.resolve_target(args)?;
                let text = args
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Handler("text is required".into()))?;
                self.page()?.type_text(&target, text).await?;
                self.record_action(format!("type into {target}"));
                Ok(Response::ok(json!({ "typed": text.len(), "selector": target })))
            }
            "press" => {
                let key = args
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Handler("key is required".into()))?;
                self.page()?.press(key).await?;
                self.record_action(format!("press {key}"));
                Ok(Response::ok(json!({ "pressed": key })))
            }
            "evaluate" => {
                let expression = args
                    .get("expression")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Handler("expression is required".into()))?;
                let result = self.page()?.evaluate(expression).await?;
                Ok(Response::ok(json!({ "result": result })))
            }
            "screenshot" => {
                let data = self.page()?.screenshot().await?;
                Ok(Response::ok(json!({ "format": "png", "base64": data })))
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
    use bd_browser::stub::{SelectorSpec, StubDriver};
    use std::path::PathBuf;

    async fn setup() -> (StubDriver, FeatureContext, CoreActions) {
        let driver = StubDriver::new();
        let ctx = FeatureContext::new(PathBuf::from("."), Default::default(), Default::default());
        let browser = driver.launch(LaunchOptions::default()).await.unwrap();
        let context = browser.new_context(ContextOptions::default()).await.unwrap();
        let page = context.new_page().await.unwrap();
        ctx.context.set(Some(context));
        ctx.page.set(Some(page));
        let actions = CoreActions::new(&ctx).unwrap();
        (driver, ctx, actions)
    }

    #[tokio::test]
    async fn navigate_records_url() {
        let (driver, _ctx, actions) = setup().await;
        let resp = actions
            .handle("navigate", &json!({"url": "http://localhost:3000"}))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap()["url"], "http://localhost:3000");
        assert_eq!(driver.state.navigations(), vec!["http://localhost:3000"]);
    }

    #[tokio::test]
    async fn navigate_records_a_navigation_interaction() {
        let (_driver, ctx, actions) = setup().await;
        let tracking = Arc::new(StateTracking::new(&ctx).unwrap());
        ctx.bus.publish(tracking.clone());

        actions
            .handle("navigate", &json!({"url": "http://localhost/a"}))
            .await
            .unwrap();
        actions
            .handle("press", &json!({"key": "Enter"}))
            .await
            .unwrap();

        let recent = tracking.recent(10);
        assert_eq!(recent.len(), 2);
        assert!(matches!(
            recent[0],
            crate::tracking::Interaction::Navigation { .. }
        ));
        assert!(matches!(
            recent[1],
            crate::tracking::Interaction::Action { .. }
        ));
    }

    #[tokio::test]
    async fn click_missing_element_is_domain_error() {
        let (_driver, _ctx, actions) = setup().await;
        let err = actions
            .handle("click", &json!({"selector": "#nope"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Element not found"));
    }

    #[tokio::test]
    async fn click_known_selector_succeeds() {
        let (driver, _ctx, actions) = setup().await;
        driver.state.set_selector("#go", SelectorSpec {
            visible: true,
            text: None,
        });
        let resp = actions
            .handle("click", &json!({"selector": "#go"}))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap()["clicked"], "#go");
    }

    #[tokio::test]
    async fn missing_required_arg_is_domain_error() {
        let (_driver, _ctx, actions) = setup().await;
        assert!(actions.handle("navigate", &json!({})).await.is_err());
        assert!(actions.handle("type", &json!({"selector": "#x"})).await.is_err());
    }

    #[tokio::test]
    async fn unknown_ref_names_the_invalidation_rule() {
        let (_driver, ctx, actions) = setup().await;
        let snapshot = Arc::new(Snapshot::new(&ctx).unwrap());
        ctx.bus.publish(snapshot);
        let err = actions
            .handle("click", &json!({"ref": "e9"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown ref"));
    }
}
