//! Assertion execution.
//!
//! Assertion outcomes are typed results, not exceptions: a failed
//! assertion returns `status:"error"` with `data.passed == false` and
//! the recorded expected/actual values, so tests can consume both the
//! status and the detail. Every run is appended to an in-memory result
//! log.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use bd_browser::driver::PageHandle;
use bd_domain::error::{Error, Result};
use bd_domain::response::Response;

use crate::console::ConsoleCapture;
use crate::network::capture::NetworkCapture;
use crate::snapshot::Snapshot;
use crate::{Feature, FeatureContext};

pub const NAME: &str = "assertions";
pub const COMMANDS: &[&str] = &["assert", "listAssertions", "clearAssertions"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
    pub name: String,
    pub passed: bool,
    pub expected: String,
    pub actual: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

pub struct Assertions {
    ctx: FeatureContext,
    results: Mutex<Vec<AssertionResult>>,
}

impl Assertions {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            results: Mutex::new(Vec::new()),
        })
    }

    pub fn results(&self) -> Vec<AssertionResult> {
        self.results.lock().clone()
    }

    fn resolve_selector(&self, args: &Value) -> Result<Option<String>> {
        if let Some(selector) = args.get("selector").and_then(Value::as_str) {
            return Ok(Some(selector.to_string()));
        }
        if let Some(reference) = args.get("ref").and_then(Value::as_str) {
            let snapshot = self
                .ctx
                .bus
                .get_as::<Snapshot>(crate::snapshot::NAME)
                .ok_or_else(|| Error::Handler("snapshot feature unavailable".into()))?;
            let data = snapshot
                .resolve_ref(reference)
                .ok_or_else(|| Error::Handler(format!("Unknown ref: {reference}")))?;
            return data
                .css_selector
                .map(Some)
                .ok_or_else(|| Error::Handler(format!("Ref {reference} has no selector")));
        }
        Ok(None)
    }

    /// Evaluate the requested condition, returning (expected, actual).
    async fn evaluate_condition(
        &self,
        args: &Value,
        selector: Option<&str>,
    ) -> Result<(String, String)> {
        let page = self
            .ctx
            .page
            .get()
            .ok_or_else(|| Error::Handler("no page open".into()))?;

        if let Some(want_visible) = args.get("visible").and_then(Value::as_bool) {
            let selector =
                selector.ok_or_else(|| Error::Handler("visible assertion needs a selector".into()))?;
            let visible = page.is_visible(selector).await?;
            let describe = |v: bool| if v { "visible" } else { "hidden" };
            return Ok((describe(want_visible).into(), describe(visible).into()));
        }
        if let Some(want_text) = args.get("text").and_then(Value::as_str) {
            let selector =
                selector.ok_or_else(|| Error::Handler("text assertion needs a selector".into()))?;
            let actual = page
                .text_content(selector)
                .await?
                .unwrap_or_else(|| "<missing>".into());
            return Ok((want_text.to_string(), actual));
        }
        if let Some(want_exists) = args.get("exists").and_then(Value::as_bool) {
            let selector =
                selector.ok_or_else(|| Error::Handler("exists assertion needs a selector".into()))?;
            let exists = page.query_selector_exists(selector).await?;
            let describe = |v: bool| if v { "present" } else { "absent" };
            return Ok((describe(want_exists).into(), describe(exists).into()));
        }
        if args.get("noConsoleErrors").and_then(Value::as_bool) == Some(true) {
            // Weak dependency: without console capture the assertion
            // degrades to vacuously unknown rather than failing.
            let actual = match self.ctx.bus.get_as::<ConsoleCapture>(crate::console::NAME) {
                Some(console) => {
                    let errors = console
                        .all()
                        .into_iter()
                        .filter(|e| e.level.is_severe())
                        .count();
                    format!("{errors} console errors")
                }
                None => "console capture unavailable".to_string(),
            };
            return Ok(("0 console errors".into(), actual));
        }
        if let Some(spec) = args.get("responseStatus") {
            let method = spec.get("method").and_then(Value::as_str).unwrap_or("GET");
            let url = spec
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Handler("responseStatus assertion needs url".into()))?;
            let want = spec.get("status").and_then(Value::as_u64).unwrap_or(200);
            let actual = match self
                .ctx
                .bus
                .get_as::<NetworkCapture>(crate::network::capture::NAME)
            {
                Some(capture) => match capture.find_completed(method, url) {
                    Some(entry) => format!("status {}", entry.status),
                    None => "no matching request captured".to_string(),
                },
                None => "network capture unavailable".to_string(),
            };
            return Ok((format!("status {want}"), actual));
        }

        Err(Error::Handler(
            "assertion needs one of: visible, text, exists, noConsoleErrors, responseStatus".into(),
        ))
    }
}

#[async_trait]
impl Feature for Assertions {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response> {
        match cmd {
            "assert" => {
                let started = Instant::now();
                let selector = self.resolve_selector(args)?;
                let (expected, actual) =
                    self.evaluate_condition(args, selector.as_deref()).await?;
                let passed = expected == actual;

                let result = AssertionResult {
                    name: args
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("assert")
                        .to_string(),
                    passed,
                    expected,
                    actual,
                    selector,
                    timestamp: Utc::now(),
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                self.results.lock().push(result.clone());

                let data = serde_json::to_value(&result)?;
                if passed {
                    Ok(Response::ok(data))
                } else {
                    Ok(Response::error_with_data(
                        format!(
                            "Assertion failed: expected {}, got {}",
                            result.expected, result.actual
                        ),
                        data,
                    ))
                }
            }
            "listAssertions" => {
                let results = self.results();
                Ok(Response::ok(json!({
                    "assertions": results,
                    "total": results.len(),
                    "passed": results.iter().filter(|r| r.passed).count(),
                })))
            }
            "clearAssertions" => {
                let cleared = {
                    let mut results = self.results.lock();
                    let n = results.len();
                    results.clear();
                    n
                };
                Ok(Response::ok(json!({ "cleared": cleared })))
            }
            _ => Err(Error::UnknownCommand(cmd.to_string())),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
