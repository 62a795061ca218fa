//! Browser lifecycle state machine.
//!
//! Exclusive owner of the browser, context and page handles. Everything
//! that creates or destroys them goes through here, and anything that
//! destroys the context or page drops the `features_initialized` guard
//! so the manager rebuilds the feature set before the next command.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use bd_browser::driver::{
    BrowserDriver, BrowserHandle, ContextHandle, ContextOptions, LaunchOptions, PageHandle,
    RecordVideoOptions, Viewport, WaitUntil,
};
use bd_browser::storage;
use bd_domain::config::BrowserConfig;
use bd_domain::error::{Error, Result};
use bd_domain::trace::TraceEvent;
use bd_features::{ContextRef, LifecycleLink, PageRef};

use crate::paths::StatePaths;

pub const DEFAULT_URL: &str = "about:blank";

#[derive(Debug, Clone, Copy)]
pub struct HeadlessOutcome {
    pub restarted: bool,
    pub previous: bool,
}

struct LifecycleState {
    browser: Option<Arc<dyn BrowserHandle>>,
    context: Option<Arc<dyn ContextHandle>>,
    page: Option<Arc<dyn PageHandle>>,
    /// Options the current context was built with; context recreation
    /// merges on top of these.
    context_opts: ContextOptions,
    current_url: Option<String>,
}

pub struct Lifecycle {
    driver: Arc<dyn BrowserDriver>,
    paths: Arc<StatePaths>,
    config: parking_lot::Mutex<BrowserConfig>,
    /// Transitions hold this across awaits; one transition at a time.
    state: tokio::sync::Mutex<LifecycleState>,
    page_ref: PageRef,
    context_ref: ContextRef,
    features_initialized: AtomicBool,
    start_time: Instant,
}

impl Lifecycle {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        paths: Arc<StatePaths>,
        config: BrowserConfig,
        page_ref: PageRef,
        context_ref: ContextRef,
    ) -> Self {
        Self {
            driver,
            paths,
            config: parking_lot::Mutex::new(config),
            state: tokio::sync::Mutex::new(LifecycleState {
                browser: None,
                context: None,
                page: None,
                context_opts: ContextOptions::default(),
                current_url: None,
            }),
            page_ref,
            context_ref,
            features_initialized: AtomicBool::new(false),
            start_time: Instant::now(),
        }
    }

    pub fn features_initialized(&self) -> bool {
        self.features_initialized.load(Ordering::Acquire)
    }

    pub fn set_features_initialized(&self, value: bool) {
        self.features_initialized.store(value, Ordering::Release);
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.browser.is_some()
    }

    pub async fn current_url(&self) -> Option<String> {
        self.state.lock().await.current_url.clone()
    }

    pub fn headless(&self) -> bool {
        self.config.lock().headless
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub async fn status(&self) -> Value {
        let state = self.state.lock().await;
        json!({
            "running": state.browser.is_some(),
            "url": state.current_url,
            "hasPage": state.page.is_some(),
        })
    }

    fn base_context_options(&self, storage_state: Option<Value>) -> ContextOptions {
        let config = self.config.lock();
        ContextOptions {
            viewport: Some(Viewport {
                width: config.viewport.width,
                height: config.viewport.height,
            }),
            user_agent: Some(config.user_agent.clone()),
            storage_state,
            record_video: None,
        }
    }

    /// Launch the browser, build a context (restoring validated storage
    /// state), open one page and navigate. Precondition: stopped.
    pub async fn start(&self, url: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.browser.is_some() {
            return Err(Error::Handler("browser already running".into()));
        }
        self.start_locked(&mut state, url).await
    }

    /// No-op when running; otherwise `start(default_url)`.
    pub async fn ensure_started(&self, default_url: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.browser.is_some() {
            return Ok(false);
        }
        self.start_locked(&mut state, default_url).await?;
        Ok(true)
    }

    async fn start_locked(&self, state: &mut LifecycleState, url: &str) -> Result<()> {
        let (headless, executable, extra_args) = {
            let config = self.config.lock();
            (
                config.headless,
                config.executable.clone(),
                config.extra_args.clone(),
            )
        };
        let browser = self
            .driver
            .launch(LaunchOptions {
                headless,
                executable,
                extra_args,
            })
            .await?;

        // A rejected state file is deleted and the browser starts clean.
        let storage_state = storage::load_storage_state(&self.paths.browser_state_file())?;
        let opts = self.base_context_options(storage_state);
        let context = browser.new_context(opts.clone()).await?;
        let page = context.new_page().await?;
        page.navigate(url, WaitUntil::NetworkIdle).await?;

        self.page_ref.set(Some(page.clone()));
        self.context_ref.set(Some(context.clone()));
        state.browser = Some(browser);
        state.context = Some(context);
        state.page = Some(page);
        state.context_opts = opts;
        state.current_url = Some(url.to_string());

        TraceEvent::BrowserStarted {
            url: url.to_string(),
            headless,
        }
        .emit();
        Ok(())
    }

    /// Save storage state, close the browser, reset all handles.
    /// `start_time` is preserved. No-op when already stopped.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.close_locked(&mut state).await
    }

    async fn close_locked(&self, state: &mut LifecycleState) -> Result<()> {
        let browser = match state.browser.take() {
            Some(browser) => browser,
            None => return Ok(()),
        };
        self.features_initialized.store(false, Ordering::Release);

        if let Some(context) = &state.context {
            self.persist_storage_state(context.as_ref()).await;
        }
        if let Err(e) = browser.close().await {
            tracing::warn!(error = %e, "browser close reported an error");
        }

        state.context = None;
        state.page = None;
        self.page_ref.set(None);
        self.context_ref.set(None);

        TraceEvent::BrowserClosed {
            uptime_ms: self.uptime_ms(),
        }
        .emit();
        Ok(())
    }

    async fn persist_storage_state(&self, context: &dyn ContextHandle) {
        match context.storage_state().await {
            Ok(storage_state) => {
                let path = self.paths.browser_state_file();
                match serde_json::to_string_pretty(&storage_state) {
                    Ok(serialized) => {
                        if let Err(e) = std::fs::write(&path, serialized) {
                            tracing::warn!(error = %e, "failed to write browser state");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to serialize browser state"),
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to read storage state before close"),
        }
    }

    /// Flip headless. Equal value is a no-op; otherwise update config
    /// and, if running, restart at the current URL.
    pub async fn set_headless(&self, headless: bool) -> Result<HeadlessOutcome> {
        let previous = {
            let mut config = self.config.lock();
            let previous = config.headless;
            if previous == headless {
                return Ok(HeadlessOutcome {
                    restarted: false,
                    previous,
                });
            }
            config.headless = headless;
            previous
        };

        let mut state = self.state.lock().await;
        if state.browser.is_none() {
            return Ok(HeadlessOutcome {
                restarted: false,
                previous,
            });
        }
        let url = state
            .current_url
            .clone()
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        self.close_locked(&mut state).await?;
        self.start_locked(&mut state, &url).await?;
        Ok(HeadlessOutcome {
            restarted: true,
            previous,
        })
    }

    /// Rebuild the context with merged options (e.g. video recording).
    /// The browser stays up; the page and context are replaced, and the
    /// prior URL is restored unless it was `about:blank`.
    pub async fn recreate_context(&self, extra: ContextOptions) -> Result<()> {
        let mut state = self.state.lock().await;
        let browser = state
            .browser
            .clone()
            .ok_or_else(|| Error::Handler("browser is not running".into()))?;
        self.features_initialized.store(false, Ordering::Release);

        let prior_url = state.current_url.clone();
        if let Some(context) = state.context.take() {
            self.persist_storage_state(context.as_ref()).await;
            if let Err(e) = context.close().await {
                tracing::warn!(error = %e, "context close reported an error");
            }
        }

        let storage_state = match extra.storage_state.clone() {
            Some(explicit) => Some(explicit),
            None => storage::load_storage_state(&self.paths.browser_state_file())?,
        };
        let mut opts = state.context_opts.clone().merged_with(extra);
        opts.storage_state = storage_state;

        let context = browser.new_context(opts.clone()).await?;
        let page = context.new_page().await?;

        let restored_url = match prior_url.as_deref() {
            Some(url) if url != DEFAULT_URL => {
                page.navigate(url, WaitUntil::NetworkIdle).await?;
                Some(url.to_string())
            }
            other => other.map(str::to_string),
        };

        self.page_ref.set(Some(page.clone()));
        self.context_ref.set(Some(context.clone()));
        state.context = Some(context);
        state.page = Some(page);
        state.context_opts = opts;
        state.current_url = restored_url.clone().or(prior_url);

        TraceEvent::ContextRecreated { restored_url }.emit();
        Ok(())
    }

    /// Shortcut used by the video special case.
    pub async fn recreate_for_video(&self, record_video: RecordVideoOptions) -> Result<()> {
        self.recreate_context(ContextOptions {
            record_video: Some(record_video),
            ..Default::default()
        })
        .await
    }

    /// Replace the current page reference without touching the context
    /// (tab switching).
    pub async fn replace_page(&self, page: Arc<dyn PageHandle>, url: String) {
        let mut state = self.state.lock().await;
        state.page = Some(page.clone());
        state.current_url = Some(url);
        self.page_ref.set(Some(page));
    }
}

#[async_trait]
impl LifecycleLink for Lifecycle {
    async fn set_page(&self, page: Arc<dyn PageHandle>, url: String) {
        self.replace_page(page, url).await;
    }

    async fn recreate_with_state(&self, state: Value, url: Option<String>) -> Result<()> {
        self.recreate_context(ContextOptions {
            storage_state: Some(state),
            ..Default::default()
        })
        .await?;
        if let Some(url) = url {
            let page = self
                .page_ref
                .get()
                .ok_or_else(|| Error::Handler("no page after context recreation".into()))?;
            page.navigate(&url, WaitUntil::NetworkIdle).await?;
            self.state.lock().await.current_url = Some(url);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bd_browser::stub::StubDriver;
    use bd_domain::config::BrowserConfig;

    fn make(dir: &std::path::Path) -> (StubDriver, Arc<Lifecycle>) {
        let driver = StubDriver::new();
        let paths = Arc::new(StatePaths::resolve(dir, crate::paths::DEFAULT_INSTANCE));
        let lifecycle = Arc::new(Lifecycle::new(
            Arc::new(driver.clone()),
            paths,
            BrowserConfig::default(),
            PageRef::default(),
            ContextRef::default(),
        ));
        (driver, lifecycle)
    }

    #[tokio::test]
    async fn start_close_resets_handles() {
        let tmp = tempfile::tempdir().unwrap();
        let (_driver, lifecycle) = make(tmp.path());

        assert!(!lifecycle.is_running().await);
        lifecycle.start("http://localhost:3000").await.unwrap();
        assert!(lifecycle.is_running().await);
        assert_eq!(
            lifecycle.current_url().await.as_deref(),
            Some("http://localhost:3000")
        );
        let status = lifecycle.status().await;
        assert_eq!(status["running"], true);
        assert_eq!(status["hasPage"], true);

        lifecycle.close().await.unwrap();
        let status = lifecycle.status().await;
        assert_eq!(status["running"], false);
        assert_eq!(status["hasPage"], false);
        assert!(!lifecycle.features_initialized());
    }

    #[tokio::test]
    async fn start_twice_is_refused_but_ensure_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, lifecycle) = make(tmp.path());

        assert!(lifecycle.ensure_started(DEFAULT_URL).await.unwrap());
        assert!(!lifecycle.ensure_started(DEFAULT_URL).await.unwrap());
        assert!(lifecycle.start(DEFAULT_URL).await.is_err());
        assert_eq!(driver.state.launch_count(), 1);
    }

    #[tokio::test]
    async fn context_gets_viewport_and_user_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, lifecycle) = make(tmp.path());
        lifecycle.start(DEFAULT_URL).await.unwrap();

        let opts = driver.state.last_context().unwrap();
        let viewport = opts.viewport.unwrap();
        assert_eq!((viewport.width, viewport.height), (2560, 1440));
        assert!(opts.user_agent.unwrap().contains("browserd"));
    }

    #[tokio::test]
    async fn set_headless_same_value_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, lifecycle) = make(tmp.path());
        lifecycle.start(DEFAULT_URL).await.unwrap();

        let outcome = lifecycle.set_headless(false).await.unwrap();
        assert!(!outcome.restarted);
        assert!(!outcome.previous);
        assert_eq!(driver.state.launch_count(), 1);
    }

    #[tokio::test]
    async fn set_headless_flip_restarts_at_current_url() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, lifecycle) = make(tmp.path());
        lifecycle.start("http://localhost/app").await.unwrap();

        let outcome = lifecycle.set_headless(true).await.unwrap();
        assert!(outcome.restarted);
        assert!(!outcome.previous);
        assert_eq!(driver.state.launch_count(), 2);
        assert!(driver.state.last_launch().unwrap().headless);
        assert_eq!(
            lifecycle.current_url().await.as_deref(),
            Some("http://localhost/app")
        );
    }

    #[tokio::test]
    async fn corrupted_state_file_is_deleted_and_start_proceeds() {
        let tmp = tempfile::tempdir().unwrap();
        let (_driver, lifecycle) = make(tmp.path());
        let state_file = tmp.path().join("browser-state.json");
        std::fs::write(&state_file, r#"{"cookies": [], "x": "=== SNAPSHOT"}"#).unwrap();

        lifecycle.start(DEFAULT_URL).await.unwrap();
        assert!(!state_file.exists());
        assert!(lifecycle.is_running().await);
    }

    #[tokio::test]
    async fn close_persists_storage_state() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, lifecycle) = make(tmp.path());
        driver.state.set_storage_state(serde_json::json!({
            "cookies": [{"name": "sid", "value": "1"}], "origins": []
        }));

        lifecycle.start(DEFAULT_URL).await.unwrap();
        lifecycle.close().await.unwrap();

        let written = std::fs::read_to_string(tmp.path().join("browser-state.json")).unwrap();
        let parsed: Value = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed["cookies"][0]["name"], "sid");
    }

    #[tokio::test]
    async fn recreate_context_restores_url_unless_blank() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, lifecycle) = make(tmp.path());
        lifecycle.start("http://localhost/app").await.unwrap();
        lifecycle.set_features_initialized(true);

        lifecycle
            .recreate_context(ContextOptions::default())
            .await
            .unwrap();
        assert_eq!(
            lifecycle.current_url().await.as_deref(),
            Some("http://localhost/app")
        );
        assert!(!lifecycle.features_initialized());
        // Two navigations to the same URL: initial start + restore.
        assert_eq!(
            driver.state.navigations(),
            vec!["http://localhost/app", "http://localhost/app"]
        );

        lifecycle.close().await.unwrap();
        lifecycle.start(DEFAULT_URL).await.unwrap();
        lifecycle
            .recreate_context(ContextOptions::default())
            .await
            .unwrap();
        // about:blank is not re-navigated.
        let navs = driver.state.navigations();
        assert_eq!(navs.iter().filter(|u| *u == DEFAULT_URL).count(), 1);
    }

    #[tokio::test]
    async fn recreate_refused_when_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let (_driver, lifecycle) = make(tmp.path());
        assert!(lifecycle
            .recreate_context(ContextOptions::default())
            .await
            .is_err());
    }
}
