//! Named saved browser states.
//!
//! `saveBrowserState` snapshots the context's cookies and storage plus
//! the current URL into `states/<name>.json`; restoring validates the
//! file with the same corruption checks as the persistent state and
//! rebuilds the context through the lifecycle link.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use bd_browser::driver::{ContextHandle, PageHandle};
use bd_browser::storage::validate_storage_state;
use bd_domain::error::{Error, Result};
use bd_domain::response::Response;

use crate::{Feature, FeatureContext};

pub const NAME: &str = "browserState";
pub const COMMANDS: &[&str] = &[
    "saveBrowserState",
    "restoreBrowserState",
    "listBrowserStates",
    "deleteBrowserState",
];

pub struct BrowserState {
    ctx: FeatureContext,
    states_dir: PathBuf,
}

impl BrowserState {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            states_dir: ctx.state_dir.join("states"),
        })
    }

    fn state_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Handler(format!(
                "invalid state name: {name} (use letters, digits, - and _)"
            )));
        }
        Ok(self.states_dir.join(format!("{name}.json")))
    }

    fn require_name(args: &Value) -> Result<&str> {
        args.get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Handler("name is required".into()))
    }
}

#[async_trait]
impl Feature for BrowserState {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response> {
        match cmd {
            "saveBrowserState" => {
                let name = Self::require_name(args)?;
                let path = self.state_path(name)?;
                let context = self
                    .ctx
                    .context
                    .get()
                    .ok_or_else(|| Error::Handler("no browser context - run start first".into()))?;

                let storage = context.storage_state().await?;
                let url = match self.ctx.page.get() {
                    Some(page) => Some(page.url().await),
                    None => None,
                };
                let record = json!({
                    "savedAt": Utc::now(),
                    "url": url,
                    "state": storage,
                });

                std::fs::create_dir_all(&self.states_dir)?;
                std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
                Ok(Response::ok(json!({ "name": name, "path": path.display().to_string() })))
            }
            "restoreBrowserState" => {
                let name = Self::require_name(args)?;
                let path = self.state_path(name)?;
                let raw = std::fs::read_to_string(&path)
                    .map_err(|_| Error::Handler(format!("no saved state named {name}")))?;

                // The same corruption checks as the persistent state file.
                let record = validate_storage_state(&raw)
                    .map_err(|r| Error::StorageCorruption(r.to_string()))?;
                let storage = record.get("state").cloned().unwrap_or(Value::Null);
                if validate_storage_state(&storage.to_string()).is_err() {
                    return Err(Error::StorageCorruption(format!(
                        "saved state {name} has an invalid storage payload"
                    )));
                }
                let url = record
                    .get("url")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let lifecycle = self
                    .ctx
                    .lifecycle()
                    .ok_or_else(|| Error::Handler("lifecycle unavailable".into()))?;
                lifecycle.recreate_with_state(storage, url.clone()).await?;
                Ok(Response::ok(json!({ "name": name, "url": url })))
            }
            "listBrowserStates" => {
                let mut states = Vec::new();
                if self.states_dir.is_dir() {
                    for entry in std::fs::read_dir(&self.states_dir)? {
                        let entry = entry?;
                        let path = entry.path();
                        if path.extension().and_then(|e| e.to_str()) == Some("json") {
                            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                                states.push(stem.to_string());
                            }
                        }
                    }
                }
                states.sort();
                Ok(Response::ok(json!({ "states": states })))
            }
            "deleteBrowserState" => {
                let name = Self::require_name(args)?;
                let path = self.state_path(name)?;
                if !path.exists() {
                    return Err(Error::Handler(format!("no saved state named {name}")));
                }
                std::fs::remove_file(&path)?;
                Ok(Response::ok(json!({ "deleted": name })))
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
    use crate::LifecycleLink;
    use bd_browser::driver::{BrowserDriver, BrowserHandle, ContextHandle, ContextOptions, LaunchOptions, PageHandle};
    use bd_browser::stub::StubDriver;
    use parking_lot::Mutex;

    struct RecordingLink {
        restored: Mutex<Vec<(Value, Option<String>)>>,
    }

    #[async_trait]
    impl LifecycleLink for RecordingLink {
        async fn set_page(&self, _page: Arc<dyn PageHandle>, _url: String) {}
        async fn recreate_with_state(&self, state: Value, url: Option<String>) -> Result<()> {
            self.restored.lock().push((state, url));
            Ok(())
        }
    }

    async fn setup(dir: &std::path::Path) -> (FeatureContext, BrowserState, Arc<RecordingLink>) {
        let driver = StubDriver::new();
        driver.state.set_storage_state(json!({
            "cookies": [{"name": "sid", "value": "abc"}],
            "origins": [],
        }));
        let ctx = FeatureContext::new(dir.to_path_buf(), Default::default(), Default::default());
        let browser = driver.launch(LaunchOptions::default()).await.unwrap();
        let context = browser.new_context(ContextOptions::default()).await.unwrap();
        let page = context.new_page().await.unwrap();
        page.navigate("http://localhost/app", bd_browser::driver::WaitUntil::NetworkIdle)
            .await
            .unwrap();
        ctx.context.set(Some(context));
        ctx.page.set(Some(page));

        let link = Arc::new(RecordingLink {
            restored: Mutex::new(Vec::new()),
        });
        *ctx.lifecycle.write() = Some(link.clone());

        let state = BrowserState::new(&ctx).unwrap();
        (ctx, state, link)
    }

    #[tokio::test]
    async fn save_restore_list_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let (_ctx, state, link) = setup(tmp.path()).await;

        state
            .handle("saveBrowserState", &json!({"name": "checkout"}))
            .await
            .unwrap();

        let resp = state.handle("listBrowserStates", &json!({})).await.unwrap();
        assert_eq!(resp.data.unwrap()["states"], json!(["checkout"]));

        let resp = state
            .handle("restoreBrowserState", &json!({"name": "checkout"}))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap()["url"], "http://localhost/app");

        let restored = link.restored.lock();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].0["cookies"][0]["name"], "sid");
        assert_eq!(restored[0].1.as_deref(), Some("http://localhost/app"));
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (_ctx, state, _link) = setup(tmp.path()).await;
        for bad in ["../x", "a b", "", "x/y"] {
            assert!(state
                .handle("saveBrowserState", &json!({"name": bad}))
                .await
                .is_err());
        }
    }

    #[tokio::test]
    async fn restore_rejects_corrupted_state_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (_ctx, state, _link) = setup(tmp.path()).await;
        std::fs::create_dir_all(tmp.path().join("states")).unwrap();
        std::fs::write(
            tmp.path().join("states/bad.json"),
            r#"{"url": "http://x", "state": {}, "note": "=== SNAPSHOT"}"#,
        )
        .unwrap();

        let err = state
            .handle("restoreBrowserState", &json!({"name": "bad"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageCorruption(_)));
    }

    #[tokio::test]
    async fn delete_removes_state() {
        let tmp = tempfile::tempdir().unwrap();
        let (_ctx, state, _link) = setup(tmp.path()).await;
        state
            .handle("saveBrowserState", &json!({"name": "tmp"}))
            .await
            .unwrap();
        state
            .handle("deleteBrowserState", &json!({"name": "tmp"}))
            .await
            .unwrap();
        let resp = state.handle("listBrowserStates", &json!({})).await.unwrap();
        assert_eq!(resp.data.unwrap()["states"], json!([]));
        assert!(state
            .handle("deleteBrowserState", &json!({"name": "tmp"}))
            .await
            .is_err());
    }
}
