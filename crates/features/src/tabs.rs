//! Tab management.
//!
//! Switching updates the daemon's current page through the lifecycle
//! link; the context itself is never touched. Closing the last tab is
//! refused so the daemon always has a page to work against.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use bd_browser::driver::{ContextHandle, PageHandle, WaitUntil};
use bd_domain::error::{Error, Result};
use bd_domain::response::Response;

use crate::{Feature, FeatureContext};

pub const NAME: &str = "tabs";
pub const COMMANDS: &[&str] = &["tabs"];

pub struct Tabs {
    ctx: FeatureContext,
}

impl Tabs {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        Ok(Self { ctx: ctx.clone() })
    }

    fn context(&self) -> Result<Arc<dyn ContextHandle>> {
        self.ctx
            .context
            .get()
            .ok_or_else(|| Error::Handler("no browser context - run start first".into()))
    }

    async fn switch_to(&self, page: Arc<dyn PageHandle>) {
        let url = page.url().await;
        match self.ctx.lifecycle() {
            Some(lifecycle) => lifecycle.set_page(page, url).await,
            // Degraded path: no lifecycle wired (tests); update the
            // shared ref directly.
            None => self.ctx.page.set(Some(page)),
        }
    }

    async fn page_infos(&self) -> Result<Vec<Value>> {
        let current_id = self.ctx.page.get().map(|p| p.id());
        let mut infos = Vec::new();
        for (index, page) in self.context()?.pages().await.into_iter().enumerate() {
            infos.push(json!({
                "index": index,
                "url": page.url().await,
                "active": Some(page.id()) == current_id,
            }));
        }
        Ok(infos)
    }
}

#[async_trait]
impl Feature for Tabs {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response> {
        if cmd != "tabs" {
            return Err(Error::UnknownCommand(cmd.to_string()));
        }
        let action = args.get("action").and_then(Value::as_str).unwrap_or("list");

        match action {
            "list" => {
                let tabs = self.page_infos().await?;
                Ok(Response::ok(json!({ "tabs": tabs, "count": tabs.len() })))
            }
            "new" => {
                let context = self.context()?;
                let page = context.new_page().await?;
                if let Some(url) = args.get("url").and_then(Value::as_str) {
                    page.navigate(url, WaitUntil::NetworkIdle).await?;
                }
                self.switch_to(page).await;
                let tabs = self.page_infos().await?;
                Ok(Response::ok(json!({ "tabs": tabs, "count": tabs.len() })))
            }
            "switch" => {
                let index = args
                    .get("index")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::Handler("index is required".into()))?
                    as usize;
                let pages = self.context()?.pages().await;
                let page = pages
                    .get(index)
                    .cloned()
                    .ok_or_else(|| Error::Handler(format!("No tab at index {index}")))?;
                self.switch_to(page.clone()).await;
                Ok(Response::ok(json!({
                    "index": index,
                    "url": page.url().await,
                })))
            }
            "close" => {
                let pages = self.context()?.pages().await;
                if pages.len() <= 1 {
                    return Err(Error::Handler(
                        "Cannot close the last remaining tab".into(),
                    ));
                }
                let index = args
                    .get("index")
                    .and_then(Value::as_u64)
                    .map(|i| i as usize)
                    .unwrap_or(pages.len() - 1);
                let page = pages
                    .get(index)
                    .cloned()
                    .ok_or_else(|| Error::Handler(format!("No tab at index {index}")))?;
                let closing_current = self.ctx.page.get().map(|p| p.id()) == Some(page.id());
                page.close().await?;
                if closing_current {
                    // Fall back to the first remaining tab.
                    let remaining = self.context()?.pages().await;
                    if let Some(next) = remaining.first().cloned() {
                        self.switch_to(next).await;
                    }
                }
                let tabs = self.page_infos().await?;
                Ok(Response::ok(json!({ "tabs": tabs, "count": tabs.len() })))
            }
            other => Err(Error::Handler(format!("unknown tabs action: {other}"))),
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

    async fn setup() -> (FeatureContext, Tabs) {
        let driver = StubDriver::new();
        let ctx = FeatureContext::new(PathBuf::from("."), Default::default(), Default::default());
        let browser = driver.launch(LaunchOptions::default()).await.unwrap();
        let context = browser.new_context(ContextOptions::default()).await.unwrap();
        let page = context.new_page().await.unwrap();
        ctx.context.set(Some(context));
        ctx.page.set(Some(page));
        let tabs = Tabs::new(&ctx).unwrap();
        (ctx, tabs)
    }

    #[tokio::test]
    async fn list_shows_single_tab() {
        let (_ctx, tabs) = setup().await;
        let resp = tabs.handle("tabs", &json!({"action": "list"})).await.unwrap();
        assert_eq!(resp.data.unwrap()["count"], 1);
    }

    #[tokio::test]
    async fn new_tab_switches_current_page() {
        let (ctx, tabs) = setup().await;
        let before = ctx.page.get().unwrap().id();
        let resp = tabs.handle("tabs", &json!({"action": "new"})).await.unwrap();
        assert_eq!(resp.data.unwrap()["count"], 2);
        assert_ne!(ctx.page.get().unwrap().id(), before);
    }

    #[tokio::test]
    async fn close_last_tab_is_refused() {
        let (_ctx, tabs) = setup().await;
        let err = tabs
            .handle("tabs", &json!({"action": "close"}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot close the last remaining tab");
    }

    #[tokio::test]
    async fn close_second_tab_falls_back() {
        let (ctx, tabs) = setup().await;
        tabs.handle("tabs", &json!({"action": "new"})).await.unwrap();
        let resp = tabs.handle("tabs", &json!({"action": "close"})).await.unwrap();
        assert_eq!(resp.data.unwrap()["count"], 1);
        assert!(ctx.page.get().is_some());
    }

    #[tokio::test]
    async fn switch_out_of_range_fails() {
        let (_ctx, tabs) = setup().await;
        assert!(tabs
            .handle("tabs", &json!({"action": "switch", "index": 7}))
            .await
            .is_err());
    }
}
