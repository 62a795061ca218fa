//! Accessibility-tree snapshots with symbolic element refs.
//!
//! Each snapshot renders the tree as indented text and assigns `e1`,
//! `e2`, … refs to interactive nodes. The ref map is fully replaced by
//! the next snapshot; refs from an older snapshot may no longer resolve.
//! When the accessibility tree comes back empty the feature falls back
//! to a DOM traversal, and on total failure the snapshot text itself
//! carries the error.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use bd_browser::driver::PageHandle;
use bd_domain::error::{Error, Result};
use bd_domain::response::Response;

use crate::plugins_bridge::PluginsFeature;
use crate::tracking::StateTracking;
use crate::{Feature, FeatureContext};

pub const NAME: &str = "snapshot";
pub const COMMANDS: &[&str] = &["snapshot"];

/// Roles that receive a symbolic ref.
const INTERACTIVE_ROLES: &[&str] = &[
    "button", "link", "textbox", "searchbox", "checkbox", "radio", "combobox", "listbox",
    "menuitem", "tab", "switch", "slider", "heading",
];

/// CSS used to tag elements of a role with their `data-bd-ref`
/// attribute, making refs resolvable by ordinary selector lookups.
fn role_css(role: &str) -> Option<&'static str> {
    match role {
        "button" => Some("button, [role=\"button\"], input[type=\"button\"], input[type=\"submit\"]"),
        "link" => Some("a[href], [role=\"link\"]"),
        "textbox" => Some("input:not([type]), input[type=\"text\"], input[type=\"email\"], input[type=\"password\"], textarea"),
        "searchbox" => Some("input[type=\"search\"]"),
        "checkbox" => Some("input[type=\"checkbox\"], [role=\"checkbox\"]"),
        "radio" => Some("input[type=\"radio\"], [role=\"radio\"]"),
        "combobox" => Some("select, [role=\"combobox\"]"),
        "heading" => Some("h1, h2, h3, h4, h5, h6"),
        _ => None,
    }
}

/// Traversal run when the accessibility tree is empty: collects the
/// interactive elements with whatever stable selectors the DOM offers.
pub const DOM_FALLBACK_SCRIPT: &str = "(() => { \
    const out = []; \
    const push = (role, el) => { \
        let sel = null; \
        if (el.id) sel = '#' + CSS.escape(el.id); \
        out.push({ role, name: (el.innerText || el.value || '').trim().slice(0, 80), sel }); \
    }; \
    document.querySelectorAll('button, input[type=submit]').forEach(el => push('button', el)); \
    document.querySelectorAll('a[href]').forEach(el => push('link', el)); \
    document.querySelectorAll('input:not([type=submit]), textarea, select').forEach(el => push('textbox', el)); \
    document.querySelectorAll('h1, h2, h3, h4, h5, h6').forEach(el => push('heading', el)); \
    return out; })()";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefData {
    pub role: String,
    pub role_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub css_selector: Option<String>,
}

pub struct Snapshot {
    ctx: FeatureContext,
    ref_map: Mutex<HashMap<String, RefData>>,
}

impl Snapshot {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        Ok(Self {
            ctx: ctx.clone(),
            ref_map: Mutex::new(HashMap::new()),
        })
    }

    /// Refs from the most recent snapshot.
    pub fn ref_map(&self) -> HashMap<String, RefData> {
        self.ref_map.lock().clone()
    }

    pub fn resolve_ref(&self, reference: &str) -> Option<RefData> {
        self.ref_map.lock().get(reference).cloned()
    }

    async fn capture(&self) -> Result<(String, HashMap<String, RefData>)> {
        let page = self
            .ctx
            .page
            .get()
            .ok_or_else(|| Error::Handler("no page open".into()))?;

        match page.accessibility_snapshot().await {
            Ok(Value::Null) => self.dom_fallback().await,
            Ok(tree) => {
                let mut renderer = TreeRenderer::default();
                renderer.walk(&tree, 0);
                let mut refs = renderer.refs;
                self.tag_elements(&mut refs).await;
                Ok((renderer.lines.join("\n"), refs))
            }
            Err(e) => {
                // Total failure degrades to an error string, not a fault.
                tracing::warn!(error = %e, "accessibility snapshot failed");
                match self.dom_fallback().await {
                    Ok(result) => Ok(result),
                    Err(_) => Ok((format!("ERROR: snapshot unavailable: {e}"), HashMap::new())),
                }
            }
        }
    }

    /// DOM traversal used when the accessibility tree is empty. Builds
    /// selectors directly, so refs from this path always resolve.
    async fn dom_fallback(&self) -> Result<(String, HashMap<String, RefData>)> {
        let page = self
            .ctx
            .page
            .get()
            .ok_or_else(|| Error::Handler("no page open".into()))?;

        let nodes = page.evaluate(DOM_FALLBACK_SCRIPT).await?;
        let nodes = nodes
            .as_array()
            .cloned()
            .ok_or_else(|| Error::Handler("DOM traversal returned no nodes".into()))?;

        let mut lines = vec!["- document (DOM fallback):".to_string()];
        let mut refs = HashMap::new();
        let mut role_counts: HashMap<String, usize> = HashMap::new();
        for node in &nodes {
            let role = node["role"].as_str().unwrap_or("generic").to_string();
            let name = node["name"].as_str().unwrap_or("").to_string();
            let index = *role_counts
                .entry(role.clone())
                .and_modify(|c| *c += 1)
                .or_insert(0);
            let reference = format!("e{}", refs.len() + 1);
            lines.push(format!("  - {role} \"{name}\" [ref={reference}]"));
            refs.insert(
                reference,
                RefData {
                    role,
                    role_index: index,
                    name: (!name.is_empty()).then_some(name),
                    css_selector: node["sel"].as_str().map(str::to_string),
                },
            );
        }
        Ok((lines.join("\n"), refs))
    }

    /// Tag ref'd elements with `data-bd-ref` so refs resolve through
    /// ordinary selectors. Best effort; refs stay usable by role/index
    /// when tagging fails.
    async fn tag_elements(&self, refs: &mut HashMap<String, RefData>) {
        let page = match self.ctx.page.get() {
            Some(page) => page,
            None => return,
        };
        let mut tags = Vec::new();
        for (reference, data) in refs.iter() {
            if let Some(css) = role_css(&data.role) {
                tags.push(json!({
                    "ref": reference,
                    "css": css,
                    "index": data.role_index,
                }));
            }
        }
        if tags.is_empty() {
            return;
        }
        let script = format!(
            "(() => {{ const tags = {}; \
             for (const t of tags) {{ \
               const els = document.querySelectorAll(t.css); \
               if (els[t.index]) els[t.index].setAttribute('data-bd-ref', t.ref); }} \
             return true; }})()",
            Value::Array(tags)
        );
        match page.evaluate(&script).await {
            Ok(Value::Bool(true)) => {
                for (reference, data) in refs.iter_mut() {
                    if role_css(&data.role).is_some() {
                        data.css_selector = Some(format!("[data-bd-ref=\"{reference}\"]"));
                    }
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "ref tagging failed"),
        }
    }
}

#[async_trait]
impl Feature for Snapshot {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn handle(&self, cmd: &str, _args: &Value) -> Result<Response> {
        match cmd {
            "snapshot" => {
                let (text, refs) = self.capture().await?;
                let ref_count = refs.len();
                *self.ref_map.lock() = refs;

                if let Some(tracking) = self.ctx.bus.get_as::<StateTracking>(crate::tracking::NAME)
                {
                    tracking.record_action("snapshot");
                }
                if let Some(plugins) =
                    self.ctx.bus.get_as::<PluginsFeature>(crate::plugins_bridge::NAME)
                {
                    let summary = json!({ "refCount": ref_count });
                    tokio::spawn(async move {
                        plugins.fire_on_snapshot(summary).await;
                    });
                }

                let url = match self.ctx.page.get() {
                    Some(page) => Some(page.url().await),
                    None => None,
                };
                Ok(Response::ok(json!({
                    "snapshot": text,
                    "refCount": ref_count,
                    "url": url,
                })))
            }
            _ => Err(Error::UnknownCommand(cmd.to_string())),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tree rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct TreeRenderer {
    lines: Vec<String>,
    refs: HashMap<String, RefData>,
    role_counts: HashMap<String, usize>,
}

impl TreeRenderer {
    fn walk(&mut self, node: &Value, depth: usize) {
        let role = node["role"].as_str().unwrap_or("generic");
        let name = node["name"].as_str().unwrap_or("");
        let indent = "  ".repeat(depth);

        let mut line = if name.is_empty() {
            format!("{indent}- {role}")
        } else {
            format!("{indent}- {role} \"{name}\"")
        };

        if INTERACTIVE_ROLES.contains(&role) {
            let index = *self
                .role_counts
                .entry(role.to_string())
                .and_modify(|c| *c += 1)
                .or_insert(0);
            let reference = format!("e{}", self.refs.len() + 1);
            line.push_str(&format!(" [ref={reference}]"));
            self.refs.insert(
                reference,
                RefData {
                    role: role.to_string(),
                    role_index: index,
                    name: (!name.is_empty()).then(|| name.to_string()),
                    css_selector: None,
                },
            );
        }
        self.lines.push(line);

        if let Some(children) = node["children"].as_array() {
            for child in children {
                self.walk(child, depth + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bd_browser::driver::{BrowserDriver, BrowserHandle, ContextHandle, ContextOptions, LaunchOptions};
    use bd_browser::stub::StubDriver;
    use std::path::PathBuf;

    async fn ctx_with_stub(driver: &StubDriver) -> FeatureContext {
        let ctx = FeatureContext::new(PathBuf::from("."), Default::default(), Default::default());
        let browser = driver.launch(LaunchOptions::default()).await.unwrap();
        let context = browser.new_context(ContextOptions::default()).await.unwrap();
        let page = context.new_page().await.unwrap();
        ctx.context.set(Some(context));
        ctx.page.set(Some(page));
        ctx
    }

    #[tokio::test]
    async fn snapshot_assigns_refs_and_replaces_map() {
        let driver = StubDriver::new();
        driver.state.set_a11y_tree(json!({
            "role": "RootWebArea", "name": "Home", "children": [
                { "role": "heading", "name": "Welcome", "children": [] },
                { "role": "button", "name": "Submit", "children": [] },
                { "role": "button", "name": "Cancel", "children": [] },
            ]
        }));
        let ctx = ctx_with_stub(&driver).await;
        let snapshot = Snapshot::new(&ctx).unwrap();

        let resp = snapshot.handle("snapshot", &json!({})).await.unwrap();
        assert!(resp.is_ok());
        let data = resp.data.unwrap();
        assert_eq!(data["refCount"], 3);
        let text = data["snapshot"].as_str().unwrap();
        assert!(text.contains("- heading \"Welcome\" [ref=e1]"));
        assert!(text.contains("- button \"Submit\" [ref=e2]"));

        let map = snapshot.ref_map();
        assert_eq!(map["e2"].role, "button");
        assert_eq!(map["e2"].role_index, 0);
        assert_eq!(map["e3"].role_index, 1);

        // A second snapshot fully replaces the map.
        driver.state.set_a11y_tree(json!({
            "role": "RootWebArea", "name": "", "children": [
                { "role": "link", "name": "Docs", "children": [] },
            ]
        }));
        snapshot.handle("snapshot", &json!({})).await.unwrap();
        let map = snapshot.ref_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map["e1"].role, "link");
    }

    #[tokio::test]
    async fn empty_tree_falls_back_to_dom_traversal() {
        let driver = StubDriver::new();
        // a11y tree left unset -> Value::Null -> DOM fallback path.
        let ctx = ctx_with_stub(&driver).await;
        driver.state.set_eval_result(
            DOM_FALLBACK_SCRIPT,
            json!([{ "role": "button", "name": "Go", "sel": "#go" }]),
        );
        let snapshot = Snapshot::new(&ctx).unwrap();

        let resp = snapshot.handle("snapshot", &json!({})).await.unwrap();
        let data = resp.data.unwrap();
        assert!(data["snapshot"].as_str().unwrap().contains("DOM fallback"));
        let map = snapshot.ref_map();
        assert_eq!(map["e1"].css_selector.as_deref(), Some("#go"));
    }

    #[tokio::test]
    async fn no_page_is_a_handler_error() {
        let ctx = FeatureContext::new(PathBuf::from("."), Default::default(), Default::default());
        let snapshot = Snapshot::new(&ctx).unwrap();
        assert!(snapshot.handle("snapshot", &json!({})).await.is_err());
    }
}
